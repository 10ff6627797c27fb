//! The coordinator owns the authoritative task table and drives the job
//! through its phases. Workers reach it through the [`Scheduler`] RPC service.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::{ready, Ready};
use tarpc::context;
use tarpc::server::{BaseChannel, Channel};
use tarpc::tokio_serde::formats::Json;
use tokio::net::UnixListener;
use tokio_util::codec::LengthDelimitedCodec;

use crate::mr::protocol::{partition_of, Assignment};

/// How long an assignment may stay in progress before any worker asking for
/// work is allowed to take it over
pub const DEFAULT_LEASE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskKind {
    Map,
    Reduce,
}

/// Where a task is in its Idle -> InProgress -> Completed life. An in-progress
/// task always knows who holds it and since when.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TaskStatus {
    Idle,
    InProgress {
        assignee: String,
        assigned_at: Instant,
    },
    Completed,
}

#[derive(Debug, Clone)]
struct Task {
    id: usize,
    kind: TaskKind,
    inputs: Vec<String>,
    status: TaskStatus,
}

/// Global job phase, only ever advancing Mapping -> Reducing -> Completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Mapping,
    Reducing,
    Completed,
}

/// Everything the RPC handlers touch, guarded by a single mutex so each
/// handler observes the table exactly as the previous one left it
#[derive(Debug)]
struct Inner {
    tasks: Vec<Task>,
    phase: Phase,
    n_reduce: usize,
    /// partition id -> every intermediate file reported for it so far
    intermediate: HashMap<usize, Vec<String>>,
}

impl Inner {
    /// Advance the phase as far as the table allows. A transition that enables
    /// the next one fires it in the same call, so a job with no splits, or
    /// whose maps produced nothing, falls straight through to Completed.
    fn check_and_transition(&mut self) {
        loop {
            match self.phase {
                Phase::Mapping => {
                    let maps_done = self
                        .tasks
                        .iter()
                        .filter(|t| t.kind == TaskKind::Map)
                        .all(|t| t.status == TaskStatus::Completed);
                    if !maps_done {
                        return;
                    }
                    let reduce_tasks: Vec<Task> = (0..self.n_reduce)
                        .filter_map(|partition| {
                            let files = self.intermediate.get(&partition)?;
                            Some(Task {
                                id: partition,
                                kind: TaskKind::Reduce,
                                inputs: files.clone(),
                                status: TaskStatus::Idle,
                            })
                        })
                        .collect();
                    println!(
                        "[Job] Every map task is finished, starting the reduce phase with {} task(s)",
                        reduce_tasks.len()
                    );
                    self.tasks = reduce_tasks;
                    self.phase = Phase::Reducing;
                }
                Phase::Reducing => {
                    let reduces_done = self
                        .tasks
                        .iter()
                        .filter(|t| t.kind == TaskKind::Reduce)
                        .all(|t| t.status == TaskStatus::Completed);
                    if !reduces_done {
                        return;
                    }
                    println!("[Job] Every reduce task is finished, the job is done");
                    self.phase = Phase::Completed;
                }
                Phase::Completed => return,
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Coordinator {
    inner: Arc<Mutex<Inner>>,
    lease: Duration,
}

impl Coordinator {
    /// Create a coordinator with one map task per input split, in split order
    pub fn new(inputs: Vec<String>, n_reduce: usize) -> Self {
        Self::with_lease(inputs, n_reduce, DEFAULT_LEASE)
    }

    /// Same as [`Coordinator::new`] with a custom reassignment lease
    pub fn with_lease(inputs: Vec<String>, n_reduce: usize, lease: Duration) -> Self {
        let tasks = inputs
            .into_iter()
            .enumerate()
            .map(|(id, file)| Task {
                id,
                kind: TaskKind::Map,
                inputs: vec![file],
                status: TaskStatus::Idle,
            })
            .collect();
        let coordinator = Self {
            inner: Arc::new(Mutex::new(Inner {
                tasks,
                phase: Phase::Mapping,
                n_reduce,
                intermediate: HashMap::new(),
            })),
            lease,
        };
        // A job with no splits is complete before the first worker asks
        coordinator.inner.lock().unwrap().check_and_transition();
        coordinator
    }

    /// Hand out the first eligible task in id order, marking it in progress.
    ///
    /// A task whose lease ran out is eligible again: it is taken over
    /// silently, the previous assignee is never told and its late report is
    /// simply absorbed.
    pub fn assign(&self, worker_id: &str) -> Assignment {
        let mut inner = self.inner.lock().unwrap();
        if inner.phase == Phase::Completed {
            return Assignment::Done;
        }
        let n_reduce = inner.n_reduce;
        let now = Instant::now();
        for task in inner.tasks.iter_mut() {
            let eligible = match &task.status {
                TaskStatus::Idle => true,
                TaskStatus::InProgress { assigned_at, .. } => {
                    now.duration_since(*assigned_at) > self.lease
                }
                TaskStatus::Completed => false,
            };
            if !eligible {
                continue;
            }
            if let TaskStatus::InProgress { assignee, .. } = &task.status {
                println!(
                    "[Lease] Task #{} outlived its lease on worker {}, handing it to worker {}",
                    task.id, assignee, worker_id
                );
            }
            task.status = TaskStatus::InProgress {
                assignee: worker_id.to_owned(),
                assigned_at: now,
            };
            return match task.kind {
                TaskKind::Map => {
                    println!(
                        "[Map] Assigned map task #{} to worker {}",
                        task.id, worker_id
                    );
                    Assignment::Map {
                        task_id: task.id,
                        input: task.inputs[0].clone(),
                        n_reduce,
                    }
                }
                TaskKind::Reduce => {
                    println!(
                        "[Reduce] Assigned reduce task #{} to worker {}",
                        task.id, worker_id
                    );
                    Assignment::Reduce {
                        task_id: task.id,
                        inputs: task.inputs.clone(),
                    }
                }
            };
        }
        Assignment::Wait
    }

    /// Record a finished map task and index the files it produced by the
    /// partition id embedded in their names.
    ///
    /// Reports for unknown task ids are dropped. A duplicate report for an
    /// already completed task only adds its files to the partition index,
    /// which is how a displaced worker's late output is absorbed.
    pub fn complete_map(&self, task_id: usize, produced: Vec<String>) {
        let mut inner = self.inner.lock().unwrap();
        match inner
            .tasks
            .iter_mut()
            .find(|t| t.kind == TaskKind::Map && t.id == task_id)
        {
            Some(task) => task.status = TaskStatus::Completed,
            None => {
                println!("[Map] Ignoring completion report for unknown map task #{task_id}");
                return;
            }
        }
        println!("[Map] Map task #{task_id} has been finished");
        let n_reduce = inner.n_reduce;
        for file in produced {
            match partition_of(&file) {
                Some(partition) if partition < n_reduce => {
                    inner.intermediate.entry(partition).or_default().push(file);
                }
                _ => println!(
                    "[Map] Dropping intermediate file {file}, its name does not route to a valid partition"
                ),
            }
        }
        inner.check_and_transition();
    }

    /// Record a finished reduce task. Duplicate reports are harmless.
    pub fn complete_reduce(&self, task_id: usize) {
        let mut inner = self.inner.lock().unwrap();
        match inner
            .tasks
            .iter_mut()
            .find(|t| t.kind == TaskKind::Reduce && t.id == task_id)
        {
            Some(task) => task.status = TaskStatus::Completed,
            None => {
                println!("[Reduce] Ignoring completion report for unknown reduce task #{task_id}");
                return;
            }
        }
        println!("[Reduce] Reduce task #{task_id} has been finished");
        inner.check_and_transition();
    }

    /// The outer driver polls this until the job reaches its final phase
    pub fn done(&self) -> bool {
        self.inner.lock().unwrap().phase == Phase::Completed
    }

    pub fn phase(&self) -> Phase {
        self.inner.lock().unwrap().phase
    }
}

/// RPC surface the workers drive the scheduler through
#[tarpc::service]
pub trait Scheduler {
    /// Ask for the next task, identifying the caller by an opaque worker id
    async fn request_task(worker_id: String) -> Assignment;
    /// Report a finished map task along with the intermediate files it wrote
    async fn report_map_done(task_id: usize, produced: Vec<String>);
    /// Report a finished reduce task
    async fn report_reduce_done(task_id: usize);
}

/// The handlers only take the table lock and mutate, so they all complete
/// immediately with ready futures
#[tarpc::server]
impl Scheduler for Coordinator {
    type RequestTaskFut = Ready<Assignment>;
    type ReportMapDoneFut = Ready<()>;
    type ReportReduceDoneFut = Ready<()>;

    fn request_task(self, _: context::Context, worker_id: String) -> Self::RequestTaskFut {
        ready(self.assign(&worker_id))
    }

    fn report_map_done(
        self,
        _: context::Context,
        task_id: usize,
        produced: Vec<String>,
    ) -> Self::ReportMapDoneFut {
        self.complete_map(task_id, produced);
        ready(())
    }

    fn report_reduce_done(self, _: context::Context, task_id: usize) -> Self::ReportReduceDoneFut {
        self.complete_reduce(task_id);
        ready(())
    }
}

/// Remove any stale socket file from a previous run and bind the
/// worker-facing listener. Failing to bind is fatal to the caller, the
/// coordinator cannot serve without it.
pub async fn bind(socket: &Path) -> anyhow::Result<UnixListener> {
    let _ = tokio::fs::remove_file(socket).await;
    Ok(UnixListener::bind(socket)?)
}

/// Accept worker connections forever, serving one RPC channel per connection
pub async fn serve(listener: UnixListener, coordinator: Coordinator) {
    loop {
        match listener.accept().await {
            Ok((conn, _)) => {
                let framed = LengthDelimitedCodec::builder().new_framed(conn);
                let transport = tarpc::serde_transport::new(framed, Json::default());
                let channel = BaseChannel::with_defaults(transport);
                tokio::spawn(channel.execute(coordinator.clone().serve()));
            }
            Err(e) => println!("[Job] Failed to accept a worker connection: {e}"),
        }
    }
}

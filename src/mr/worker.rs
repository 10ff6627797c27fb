//! The worker half of the engine: pull a task, run the user function, write
//! files, report back. Workers keep no state between tasks, so any process
//! speaking this loop is a valid worker and any number of them can run.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::time::Duration;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tarpc::tokio_serde::formats::Json;
use tarpc::{client, context};
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio_util::codec::LengthDelimitedCodec;

use crate::mr::coordinator::SchedulerClient;
use crate::mr::protocol::{intermediate_file, output_file, Assignment};

/// How long to sleep when the coordinator has nothing to hand out
const WAIT_BACKOFF: Duration = Duration::from_secs(1);

/// One key/value pair emitted by a map function
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

pub type MapFunc = fn(&str, &str) -> Vec<KeyValue>;
pub type ReduceFunc = fn(&str, &[String]) -> String;

/// Stable hash used to route a key to its partition
pub fn hash_key(key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

pub struct Worker {
    id: String,
    dir: PathBuf,
    map_func: MapFunc,
    reduce_func: ReduceFunc,
}

impl Worker {
    /// A worker identifies itself to the coordinator by its pid and writes
    /// its files into the current working directory
    pub fn new(map_func: MapFunc, reduce_func: ReduceFunc) -> Self {
        Self::in_dir(map_func, reduce_func, ".")
    }

    /// Run against an explicit working directory instead of the process CWD
    pub fn in_dir(map_func: MapFunc, reduce_func: ReduceFunc, dir: impl Into<PathBuf>) -> Self {
        Self {
            id: std::process::id().to_string(),
            dir: dir.into(),
            map_func,
            reduce_func,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The main loop: pull, execute, report, until told to exit. A failed RPC
    /// means the coordinator is gone and the job is over as far as this
    /// worker is concerned, so it stops quietly.
    pub async fn run(&self, client: &SchedulerClient) -> anyhow::Result<()> {
        loop {
            let assignment = match client.request_task(context::current(), self.id.clone()).await {
                Ok(assignment) => assignment,
                Err(e) => {
                    println!("[Worker] Lost the coordinator while asking for work: {e}");
                    return Ok(());
                }
            };
            match assignment {
                Assignment::Map {
                    task_id,
                    input,
                    n_reduce,
                } => {
                    let produced = self.run_map(task_id, &input, n_reduce).await?;
                    if client
                        .report_map_done(context::current(), task_id, produced)
                        .await
                        .is_err()
                    {
                        return Ok(());
                    }
                }
                Assignment::Reduce { task_id, inputs } => {
                    self.run_reduce(task_id, &inputs).await?;
                    if client
                        .report_reduce_done(context::current(), task_id)
                        .await
                        .is_err()
                    {
                        return Ok(());
                    }
                }
                Assignment::Wait => tokio::time::sleep(WAIT_BACKOFF).await,
                Assignment::Done => {
                    println!("[Worker] Worker {} is done, goodbye", self.id);
                    return Ok(());
                }
            }
        }
    }

    /// Run one map task: apply the user function to the split and spill its
    /// output into one file per partition that received a pair.
    ///
    /// Each file is written under a scratch name and renamed to its
    /// partition-encoded name only once fully on disk, so a reduce task can
    /// never observe a truncated input even when two workers race on a
    /// reassigned task.
    pub async fn run_map(
        &self,
        task_id: usize,
        input: &str,
        n_reduce: usize,
    ) -> anyhow::Result<Vec<String>> {
        println!(
            "[Map] Worker {} is reading input split {} for map task #{}",
            self.id, input, task_id
        );
        let contents = tokio::fs::read_to_string(input).await?;
        let pairs = (self.map_func)(input, &contents);

        // One JSON line per pair, bucketed by the key's partition
        let mut buckets: Vec<String> = vec![String::new(); n_reduce];
        for kv in pairs {
            let partition = (hash_key(&kv.key) % n_reduce as u64) as usize;
            buckets[partition].push_str(&serde_json::to_string(&kv)?);
            buckets[partition].push('\n');
        }

        let mut produced = Vec::new();
        for (partition, bucket) in buckets.into_iter().enumerate() {
            if bucket.is_empty() {
                // a partition no key hashed into gets no file at all
                continue;
            }
            let name = intermediate_file(task_id, partition, &self.id);
            let scratch = self.dir.join(format!(".{name}.tmp"));
            let mut file = tokio::fs::File::create(&scratch).await?;
            file.write_all(bucket.as_bytes()).await?;
            file.flush().await?;
            drop(file);
            let target = self.dir.join(&name);
            tokio::fs::rename(&scratch, &target).await?;
            produced.push(target.to_string_lossy().into_owned());
        }
        println!(
            "[Map] Worker {} finished map task #{}, wrote {} partition file(s)",
            self.id,
            task_id,
            produced.len()
        );
        Ok(produced)
    }

    /// Run one reduce task: gather every pair from the partition's
    /// intermediate files, group by key and write one output line per key.
    pub async fn run_reduce(&self, task_id: usize, inputs: &[String]) -> anyhow::Result<()> {
        let mut pairs = Vec::new();
        for input in inputs {
            println!(
                "[Reduce] Worker {} is reading intermediate file {} for reduce task #{}",
                self.id, input, task_id
            );
            let contents = tokio::fs::read_to_string(input).await?;
            for line in contents.lines().filter(|line| !line.is_empty()) {
                let kv: KeyValue = serde_json::from_str(line)?;
                pairs.push(kv);
            }
        }
        // Grouping is a sort followed by a scan over equal-key runs
        pairs.par_sort_unstable();

        let name = output_file(task_id);
        let scratch = self.dir.join(format!(".{}.{}.tmp", name, self.id));
        let mut out = tokio::fs::File::create(&scratch).await?;
        let mut start = 0;
        while start < pairs.len() {
            let mut end = start;
            while end < pairs.len() && pairs[end].key == pairs[start].key {
                end += 1;
            }
            let values: Vec<String> = pairs[start..end].iter().map(|kv| kv.value.clone()).collect();
            let reduced = (self.reduce_func)(&pairs[start].key, &values);
            out.write_all(format!("{} {}\n", pairs[start].key, reduced).as_bytes())
                .await?;
            start = end;
        }
        out.flush().await?;
        drop(out);
        tokio::fs::rename(&scratch, self.dir.join(&name)).await?;
        println!(
            "[Reduce] Worker {} finished reduce task #{}, output written to {}",
            self.id, task_id, name
        );
        Ok(())
    }
}

/// Dial the coordinator's socket and spawn the client dispatch
pub async fn connect(socket: &Path) -> anyhow::Result<SchedulerClient> {
    let conn = UnixStream::connect(socket).await?;
    let framed = LengthDelimitedCodec::builder().new_framed(conn);
    let transport = tarpc::serde_transport::new(framed, Json::default());
    Ok(SchedulerClient::new(client::Config::default(), transport).spawn())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mr::function::wc;
    use crate::mr::protocol::partition_of;
    use tempfile::tempdir;

    #[tokio::test]
    async fn map_output_lands_in_partition_encoded_files() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("split.txt");
        std::fs::write(&input, "apple banana apple cherry").unwrap();

        let worker = Worker::in_dir(wc::map, wc::reduce, dir.path());
        let produced = worker
            .run_map(3, input.to_str().unwrap(), 4)
            .await
            .unwrap();

        assert!(!produced.is_empty() && produced.len() <= 4);
        for file in &produced {
            let partition = partition_of(file).expect("produced names must carry their partition");
            let contents = std::fs::read_to_string(file).unwrap();
            assert!(!contents.is_empty());
            for line in contents.lines() {
                let pair: KeyValue = serde_json::from_str(line).unwrap();
                assert_eq!(hash_key(&pair.key) % 4, partition as u64);
            }
        }
        // nothing half-written left behind
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|entry| {
                entry
                    .as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .ends_with(".tmp")
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn reduce_groups_pairs_across_input_files() {
        let dir = tempdir().unwrap();
        let kv = |key: &str| {
            serde_json::to_string(&KeyValue {
                key: key.to_string(),
                value: "1".to_string(),
            })
            .unwrap()
        };
        let first = dir.path().join("mr-0-0-a");
        let second = dir.path().join("mr-1-0-a");
        std::fs::write(&first, format!("{}\n{}\n", kv("x"), kv("y"))).unwrap();
        std::fs::write(&second, format!("{}\n", kv("x"))).unwrap();

        let worker = Worker::in_dir(wc::map, wc::reduce, dir.path());
        worker
            .run_reduce(
                0,
                &[
                    first.to_string_lossy().into_owned(),
                    second.to_string_lossy().into_owned(),
                ],
            )
            .await
            .unwrap();

        let out = std::fs::read_to_string(dir.path().join("mr-out-0")).unwrap();
        let mut lines: Vec<&str> = out.lines().collect();
        lines.sort_unstable();
        assert_eq!(lines, vec!["x 2", "y 1"]);
    }

    #[tokio::test]
    async fn map_of_an_empty_split_produces_no_files() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("empty.txt");
        std::fs::write(&input, "").unwrap();

        let worker = Worker::in_dir(wc::map, wc::reduce, dir.path());
        let produced = worker
            .run_map(0, input.to_str().unwrap(), 3)
            .await
            .unwrap();
        assert!(produced.is_empty());
    }
}

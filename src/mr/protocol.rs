//! Wire types shared by the coordinator and its workers, plus the file-naming
//! convention that routes map output to the right reduce task.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// One reply to `request_task`, telling a worker what to do next
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Assignment {
    /// Run the user map function over a single input split
    Map {
        task_id: usize,
        input: String,
        n_reduce: usize,
    },
    /// Reduce every intermediate file collected for one partition
    Reduce { task_id: usize, inputs: Vec<String> },
    /// Nothing is eligible right now, back off and ask again
    Wait,
    /// The whole job has finished, the worker can exit
    Done,
}

/// The Unix socket the coordinator listens on, stable per user
pub fn socket_path() -> PathBuf {
    let uid = unsafe { libc::getuid() };
    std::env::temp_dir().join(format!("mr-{uid}"))
}

/// Final name of a map task's output for one partition: `mr-<map>-<partition>-<nonce>`
pub fn intermediate_file(map_id: usize, partition: usize, nonce: &str) -> String {
    format!("mr-{map_id}-{partition}-{nonce}")
}

/// Final output file for one partition
pub fn output_file(partition: usize) -> String {
    format!("mr-out-{partition}")
}

static PARTITION: OnceLock<Regex> = OnceLock::new();

/// Recover the partition id from a reported intermediate filename.
///
/// Splitting the basename on `-` must yield the partition id as the
/// second-to-last token, e.g. `mr-3-1-70031` belongs to partition 1.
/// Names that do not follow the convention yield `None`.
pub fn partition_of(filename: &str) -> Option<usize> {
    let re = PARTITION.get_or_init(|| Regex::new(r"-(\d+)-[^-]*$").unwrap());
    let base = Path::new(filename).file_name()?.to_str()?;
    re.captures(base)?[1].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovers_partition_from_conforming_names() {
        assert_eq!(partition_of("mr-3-1-70031"), Some(1));
        assert_eq!(partition_of("/tmp/job/mr-12-0-9"), Some(0));
        assert_eq!(partition_of(&intermediate_file(5, 7, "123")), Some(7));
    }

    #[test]
    fn rejects_nonconforming_names() {
        assert_eq!(partition_of("mr-out-0"), None);
        assert_eq!(partition_of("mr-1-notanumber-x"), None);
        assert_eq!(partition_of("mr-1"), None);
        assert_eq!(partition_of("garbage"), None);
        assert_eq!(partition_of(""), None);
    }

    #[test]
    fn socket_path_is_stable() {
        assert_eq!(socket_path(), socket_path());
    }
}

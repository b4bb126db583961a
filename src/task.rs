use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// One key/value pair emitted by a map function and consumed by a reduce
/// function. Also the record format of the intermediate files, one JSON
/// object per line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// User map function: input file name and its full contents, out come
/// unordered key/value pairs.
pub type MapFunc = fn(&Path, &str) -> Vec<KeyValue>;

/// User reduce function: one distinct key and all values grouped under it.
pub type ReduceFunc = fn(&str, &[String]) -> String;

/// A unit of work handed from the coordinator to a worker. The enum tag
/// survives the JSON transport, so the receiving side always knows which
/// variant it got.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Task {
    /// Partition one input file into `n_reduce` intermediate buckets.
    Map {
        id: usize,
        filename: PathBuf,
        n_reduce: usize,
    },
    /// Merge the `n_map` intermediate partitions sharing this id.
    Reduce { id: usize, n_map: usize },
    /// Nothing leasable right now; idle and ask again.
    Noop,
    /// The whole job is finished; terminate.
    Stop,
}

impl Task {
    /// Task identity within its phase. Noop and Stop are not tracked in any
    /// finished set and have no id.
    pub fn id(&self) -> Option<usize> {
        match self {
            Task::Map { id, .. } | Task::Reduce { id, .. } => Some(*id),
            Task::Noop | Task::Stop => None,
        }
    }
}

/// Bucket index for a key: hash(key) mod n_reduce. SipHash with the default
/// keys is stable across processes of one build, which is the lifetime of a
/// job.
pub fn partition(key: &str, n_reduce: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % n_reduce
}

/// Intermediate file holding map task `map_id`'s pairs for reduce partition
/// `reduce_id`.
pub fn intermediate_path(dir: &Path, map_id: usize, reduce_id: usize) -> PathBuf {
    dir.join(format!("mr-{}-{}", map_id, reduce_id))
}

/// Final output file of reduce task `reduce_id`.
pub fn output_path(dir: &Path, reduce_id: usize) -> PathBuf {
    dir.join(format!("mr-out-{}", reduce_id))
}

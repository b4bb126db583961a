use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use atomicwrites::{AllowOverwrite, AtomicFile};
use log::{debug, info, warn};
use tarpc::{client, context, tokio_serde::formats::Json};
use tokio::time;

use crate::{
    intermediate_path, output_path, partition, KeyValue, MapFunc, MapReduceClient, ReduceFunc,
    Task, MAX_FRAME_LEN,
};

/// Sleep between polls when the coordinator has nothing leasable.
const IDLE_INTERVAL: Duration = Duration::from_millis(500);
/// Backoff after a failed RPC or a failed task execution.
const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// A stateless worker process. Loops requesting tasks until told to stop;
/// the only state it shares with other workers is the files it writes under
/// `dir`.
pub struct Worker {
    /// Shared directory for intermediate and output files.
    pub dir: PathBuf,
    /// Coordinator address, `host:port`.
    pub server: String,
    pub map: MapFunc,
    pub reduce: ReduceFunc,
}

impl Worker {
    /// Run the task loop until the coordinator hands out `Task::Stop`.
    /// Transport errors never end the loop; the coordinator is assumed
    /// eventually reachable.
    pub async fn launch(&self) -> anyhow::Result<()> {
        let mut client: Option<MapReduceClient> = None;
        loop {
            if client.is_none() {
                match connect(&self.server).await {
                    Ok(c) => client = Some(c),
                    Err(e) => {
                        warn!("cannot reach coordinator at {}: {:#}", self.server, e);
                        time::sleep(RETRY_INTERVAL).await;
                        continue;
                    }
                }
            }
            let c = match client.as_ref() {
                Some(c) => c,
                None => continue,
            };

            let task = match c.get_task(context::current()).await {
                Ok(task) => task,
                Err(e) => {
                    warn!("get_task failed: {}", e);
                    client = None;
                    time::sleep(RETRY_INTERVAL).await;
                    continue;
                }
            };

            match &task {
                Task::Noop => {
                    debug!("nothing leasable, idling");
                    time::sleep(IDLE_INTERVAL).await;
                }
                Task::Stop => {
                    info!("job finished, worker exiting");
                    return Ok(());
                }
                Task::Map { .. } | Task::Reduce { .. } => {
                    if let Err(e) = execute(&task, &self.dir, self.map, self.reduce) {
                        // Abandon the attempt; the lease will expire and the
                        // task will be handed out again.
                        warn!("task {:?} failed: {:#}", task, e);
                        time::sleep(RETRY_INTERVAL).await;
                        continue;
                    }
                    match c.report_task_done(context::current(), task.clone()).await {
                        Ok(Ok(())) => debug!("reported {:?} done", task),
                        Ok(Err(e)) => warn!("coordinator rejected report for {:?}: {}", task, e),
                        Err(e) => {
                            warn!("report_task_done failed: {}", e);
                            client = None;
                            time::sleep(RETRY_INTERVAL).await;
                        }
                    }
                }
            }
        }
    }
}

async fn connect(server: &str) -> anyhow::Result<MapReduceClient> {
    let mut transport = tarpc::serde_transport::tcp::connect(server, Json::default);
    transport.config_mut().max_frame_length(MAX_FRAME_LEN);
    let transport = transport.await.context("tcp connect")?;
    Ok(MapReduceClient::new(client::Config::default(), transport).spawn())
}

/// Execute a task against the shared directory. Map and Reduce do real
/// work; Noop and Stop carry none and fall through.
pub fn execute(task: &Task, dir: &Path, map_f: MapFunc, reduce_f: ReduceFunc) -> anyhow::Result<()> {
    match task {
        Task::Map {
            id,
            filename,
            n_reduce,
        } => run_map(*id, filename, *n_reduce, dir, map_f),
        Task::Reduce { id, n_map } => run_reduce(*id, *n_map, dir, reduce_f),
        Task::Noop | Task::Stop => Ok(()),
    }
}

/// Map execution: read the input, apply the user map function, split the
/// pairs into `n_reduce` buckets by key hash, and atomically replace the
/// full set of intermediate files for this map id. Atomic replacement keeps
/// duplicate executions of the same task from corrupting a bucket a reduce
/// task may already be reading.
pub fn run_map(
    id: usize,
    input: &Path,
    n_reduce: usize,
    dir: &Path,
    map_f: MapFunc,
) -> anyhow::Result<()> {
    let contents =
        fs::read_to_string(input).with_context(|| format!("cannot read input {:?}", input))?;
    let pairs = map_f(input, &contents);

    let mut buckets: Vec<Vec<KeyValue>> = vec![Vec::new(); n_reduce];
    for kv in pairs {
        buckets[partition(&kv.key, n_reduce)].push(kv);
    }

    // Every bucket is written, empty ones included, so the matching reduce
    // task never has to guess whether a file is missing or just empty.
    for (reduce_id, bucket) in buckets.iter().enumerate() {
        let path = intermediate_path(dir, id, reduce_id);
        let mut body = String::new();
        for kv in bucket {
            body.push_str(&serde_json::to_string(kv)?);
            body.push('\n');
        }
        AtomicFile::new(&path, AllowOverwrite)
            .write(|f| f.write_all(body.as_bytes()))
            .with_context(|| format!("cannot write intermediate file {:?}", path))?;
    }
    debug!("map task {} wrote {} buckets", id, n_reduce);
    Ok(())
}

/// Reduce execution: gather this partition's records from all `n_map`
/// intermediate files, sort by key, group consecutive equal keys, apply the
/// user reduce function per group, and atomically write one
/// `"<key> <value>"` line per distinct key in ascending key order.
pub fn run_reduce(id: usize, n_map: usize, dir: &Path, reduce_f: ReduceFunc) -> anyhow::Result<()> {
    let mut pairs = Vec::new();
    for map_id in 0..n_map {
        let path = intermediate_path(dir, map_id, id);
        // A missing or corrupt file means the producing map task has not
        // durably finished; give up and let the lease expire.
        let text = fs::read_to_string(&path)
            .with_context(|| format!("cannot read intermediate file {:?}", path))?;
        for line in text.lines() {
            let kv: KeyValue = serde_json::from_str(line)
                .with_context(|| format!("corrupt record in {:?}", path))?;
            pairs.push(kv);
        }
    }

    pairs.sort_by(|a, b| a.key.cmp(&b.key));

    let mut body = String::new();
    let mut i = 0;
    while i < pairs.len() {
        let mut j = i + 1;
        while j < pairs.len() && pairs[j].key == pairs[i].key {
            j += 1;
        }
        let values: Vec<String> = pairs[i..j].iter().map(|kv| kv.value.clone()).collect();
        let out = reduce_f(&pairs[i].key, &values);
        body.push_str(&format!("{} {}\n", pairs[i].key, out));
        i = j;
    }

    let path = output_path(dir, id);
    AtomicFile::new(&path, AllowOverwrite)
        .write(|f| f.write_all(body.as_bytes()))
        .with_context(|| format!("cannot write output file {:?}", path))?;
    debug!("reduce task {} merged {} partitions", id, n_map);
    Ok(())
}

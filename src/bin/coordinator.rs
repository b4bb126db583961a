use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::info;
use structopt::StructOpt;
use tokio::time;

use mapred::Coordinator;

#[derive(StructOpt, Debug)]
#[structopt(name = env!("CARGO_PKG_NAME"), version = env!("CARGO_PKG_VERSION"), about = env!("CARGO_PKG_DESCRIPTION"))]
struct Opt {
    /// Port to serve the coordinator RPC surface on
    #[structopt(short, long)]
    port: u16,

    /// Seconds a task lease may run before the task becomes leasable again
    #[structopt(short, long, default_value = "10")]
    timeout: u64,

    /// Files to process, one map task each
    #[structopt(name = "FILE", parse(from_os_str))]
    files: Vec<PathBuf>,

    /// Number of reduce partitions
    #[structopt(long, default_value = "10")]
    nreduce: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init();

    let opt = Opt::from_args();
    let coordinator = Arc::new(Coordinator::new(
        opt.files,
        opt.nreduce,
        Duration::from_secs(opt.timeout),
    ));

    let server = tokio::spawn(coordinator.clone().serve(opt.port));

    while !coordinator.done() {
        time::sleep(Duration::from_secs(1)).await;
    }
    info!("job done, draining stop replies");
    // Keep serving briefly so idle workers pick up their Stop task.
    time::sleep(Duration::from_secs(3)).await;
    server.abort();
    Ok(())
}

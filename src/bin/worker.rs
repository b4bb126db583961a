use std::path::PathBuf;

use structopt::StructOpt;

use mapred::app::wc;
use mapred::Worker;

#[derive(StructOpt, Debug)]
#[structopt(name = env!("CARGO_PKG_NAME"), version = env!("CARGO_PKG_VERSION"), about = env!("CARGO_PKG_DESCRIPTION"))]
struct Opt {
    /// Coordinator address, host:port
    #[structopt(short, long)]
    server: String,

    /// Shared directory for intermediate and output files
    #[structopt(short, long, default_value = "target", parse(from_os_str))]
    dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init();

    let opt = Opt::from_args();
    let w = Worker {
        dir: opt.dir,
        server: opt.server,
        map: wc::map,
        reduce: wc::reduce,
    };
    w.launch().await?;
    Ok(())
}

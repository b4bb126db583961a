//! Single-process reference executor: same partitioning and output format
//! as the distributed job, useful for checking results.

use std::collections::HashMap;
use std::fs;
use std::io::Write as _;
use std::path::PathBuf;

use atomicwrites::{AllowOverwrite, AtomicFile};
use log::trace;
use structopt::StructOpt;

use mapred::app::wc::{map, reduce};
use mapred::{output_path, partition};

#[derive(StructOpt, Debug)]
#[structopt(name = env!("CARGO_PKG_NAME"), version = env!("CARGO_PKG_VERSION"), about = env!("CARGO_PKG_DESCRIPTION"))]
struct Opt {
    /// Files to process
    #[structopt(name = "FILE", parse(from_os_str))]
    files: Vec<PathBuf>,

    /// Directory for output files
    #[structopt(long, default_value = "target", parse(from_os_str))]
    dir: PathBuf,

    /// Number of output partitions
    #[structopt(long, default_value = "10")]
    nreduce: usize,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init();

    let opt = Opt::from_args();

    let mut grouped = HashMap::<String, Vec<String>>::new();
    for fname in opt.files.iter() {
        let contents = fs::read_to_string(fname)?;
        for kv in map(fname, &contents) {
            grouped.entry(kv.key).or_default().push(kv.value);
        }
    }

    let mut partitions = vec![Vec::<(String, String)>::new(); opt.nreduce];
    for (key, values) in grouped.iter() {
        let out = reduce(key, values);
        partitions[partition(key, opt.nreduce)].push((key.clone(), out));
    }

    for (r, entries) in partitions.iter_mut().enumerate() {
        entries.sort();
        let path = output_path(&opt.dir, r);
        let mut body = String::new();
        for (key, value) in entries.iter() {
            body.push_str(&format!("{} {}\n", key, value));
        }
        AtomicFile::new(&path, AllowOverwrite).write(|f| f.write_all(body.as_bytes()))?;
        trace!("output {:?}", path);
    }
    Ok(())
}

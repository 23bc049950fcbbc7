#![forbid(unsafe_code)]

use anyhow::{bail, Result};
use oxblk_core::FtlConfig;
use oxblk_harness::{default_geometry, run_workload, WorkloadSpec};
use std::env;

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(cmd) = args.next() else {
        print_usage();
        return Ok(());
    };

    match cmd.as_str() {
        "smoke" => {
            let report = run_workload(
                default_geometry(),
                FtlConfig::default(),
                WorkloadSpec::default(),
            )?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        "soak" => {
            let secs: u64 = match args.next() {
                Some(raw) => raw.parse()?,
                None => 4096,
            };
            let geo = default_geometry();
            let report = run_workload(
                geo,
                FtlConfig::default(),
                WorkloadSpec {
                    nr_secs: secs.min(geo.nr_secs()),
                    ..WorkloadSpec::default()
                },
            )?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {cmd}")
        }
    }
}

fn print_usage() {
    println!("oxblk-harness");
    println!();
    println!("USAGE:");
    println!("  oxblk-harness smoke");
    println!("  oxblk-harness soak [nr_secs]");
}

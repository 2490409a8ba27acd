// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Prints a KB's metadata and per-segment sizes.

use clap::Parser;
use quadstore::{metadata, Config, Engine, Metadata};

#[derive(Parser)]
#[command(name = "qs-backend-info", about = "Inspect a KB on this node")]
struct Args {
    /// Also run the structural consistency checks (the KB must not be
    /// served while checking)
    #[arg(long)]
    check: bool,

    /// Name of the KB
    kbname: String,
}

fn run(args: &Args) -> quadstore::Result<()> {
    let config = Config::from_env();

    let md = Metadata::open(
        &quadstore::file::metadata_path(&config, &args.kbname),
        false,
    )?;

    println!("KB:            {}", args.kbname);
    println!(
        "segments:      {}",
        md.get_int(metadata::MD_SEGMENTS, 0)
    );
    println!(
        "version:       {}",
        md.get_int(metadata::MD_VERSION, -1)
    );
    println!(
        "hash function: {}",
        md.get_string(metadata::MD_HASHFUNC).unwrap_or("?")
    );
    println!(
        "store type:    {}",
        md.get_string(metadata::MD_STORE).unwrap_or("?")
    );
    println!(
        "model files:   {}",
        md.get_bool(metadata::MD_MODEL_FILES, false)
    );
    println!(
        "uuid:          {}",
        md.get_string(metadata::MD_UUID).unwrap_or("?")
    );
    println!(
        "bnode counter: {}",
        md.get_int(metadata::MD_BNODE, 1)
    );

    for seg in md.get_int_vector(metadata::MD_SEGMENT_P) {
        let mut engine = Engine::open(&config, &args.kbname, seg)?;
        let size = engine.size()?;

        println!(
            "segment {seg:04x}: {} quads, {} resources, {} graphs",
            size.quads_s, size.resources, size.models,
        );

        if args.check {
            let report = engine.check_consistency()?;
            println!(
                "  check: {} rows, {} triples, {} row leaks, {} block leaks",
                report.rows, report.triples, report.ptable_leaks, report.tbchain_leaks,
            );
            if report.ptable_leaks > 0 || report.tbchain_leaks > 0 {
                return Err(quadstore::Error::Corruption(format!(
                    "segment {seg:04x} leaked storage"
                )));
            }
        }
    }

    Ok(())
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    if let Err(e) = run(&args) {
        eprintln!("qs-backend-info: {e}");
        std::process::exit(1);
    }
}

// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Deletes KBs from this node.

use clap::Parser;
use quadstore::Config;

#[derive(Parser)]
#[command(name = "qs-backend-destroy", about = "Delete KBs from this node")]
struct Args {
    /// Only print what would be deleted
    #[arg(short = 'n', long = "dry-run")]
    dry_run: bool,

    /// Names of the KBs to delete
    #[arg(required = true)]
    kbnames: Vec<String>,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let config = Config::from_env();
    let mut failures = 0;

    for kbname in &args.kbnames {
        if args.dry_run {
            let dir = quadstore::file::kb_dir(&config, kbname);
            if dir.exists() {
                println!("would delete {}", dir.display());
            } else {
                eprintln!("qs-backend-destroy: KB {kbname} not found");
                failures += 1;
            }

            continue;
        }

        match quadstore::destroy_store(&config, kbname) {
            Ok(()) => println!("deleted KB {kbname}"),
            Err(e) => {
                eprintln!("qs-backend-destroy: {kbname}: {e}");
                failures += 1;
            }
        }
    }

    // 0 = all deleted, 1 = all failed, 2 = partial
    if failures == args.kbnames.len() {
        std::process::exit(1);
    }
    if failures > 0 {
        std::process::exit(2);
    }
}

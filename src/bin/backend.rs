// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Backend daemon: serves one KB's segments over TCP.

use clap::Parser;
use quadstore::Config;

#[derive(Parser)]
#[command(name = "qs-backend", about = "Quad store backend daemon")]
struct Args {
    /// Detach and run in the background
    #[arg(short = 'D', long = "daemon")]
    daemon: bool,

    /// Refuse imports when free disk drops below this many GB
    #[arg(short = 'l', long = "limit")]
    limit: Option<f64>,

    /// Name of the KB to serve
    kbname: String,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let mut config = Config::from_env();
    if let Some(limit) = args.limit {
        config.disk_limit_gb = limit;
    }

    if args.daemon {
        daemonize();
    }

    if let Err(e) = quadstore::server::serve(&config, &args.kbname) {
        eprintln!("qs-backend: {e}");
        std::process::exit(1);
    }
}

#[cfg(unix)]
fn daemonize() {
    // classic double fork so the daemon is not a session leader
    // SAFETY: single-threaded at this point
    unsafe {
        match libc::fork() {
            -1 => {
                eprintln!("qs-backend: fork failed");
                std::process::exit(1);
            }
            0 => {}
            _ => std::process::exit(0),
        }

        libc::setsid();

        match libc::fork() {
            -1 => {
                eprintln!("qs-backend: fork failed");
                std::process::exit(1);
            }
            0 => {}
            _ => std::process::exit(0),
        }
    }
}

#[cfg(not(unix))]
fn daemonize() {
    eprintln!("qs-backend: daemon mode is not supported on this platform");
    std::process::exit(1);
}

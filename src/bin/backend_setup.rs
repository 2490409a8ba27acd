// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Creates a KB's on-disk layout on this node.

use clap::Parser;
use quadstore::{Config, StoreOptions};

#[derive(Parser)]
#[command(name = "qs-backend-setup", about = "Create a KB on this node")]
struct Args {
    /// This node's index within the cluster
    #[arg(long, default_value_t = 0)]
    node: u32,

    /// Number of nodes in the cluster
    #[arg(long, default_value_t = 1)]
    cluster: u32,

    /// Total number of segments
    #[arg(long, default_value_t = 2)]
    segments: u32,

    /// Also store mirror segments on this node
    #[arg(long)]
    mirror: bool,

    /// Store per-graph triple lists in separate files
    #[arg(long = "model-files")]
    model_files: bool,

    /// Require this password from clients
    #[arg(long)]
    password: Option<String>,

    /// Name of the KB to create
    kbname: String,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let config = Config::from_env();

    let mut options = StoreOptions::new(args.segments)
        .node(args.node, args.cluster)
        .mirror(args.mirror)
        .model_files(args.model_files);
    if let Some(password) = args.password {
        options = options.password(password);
    }

    if let Err(e) = quadstore::create_store(&config, &args.kbname, &options) {
        eprintln!("qs-backend-setup: {e}");
        std::process::exit(1);
    }

    println!(
        "created KB {} ({} segments, {} primary on this node)",
        args.kbname,
        args.segments,
        options.primary_segments().len(),
    );
}

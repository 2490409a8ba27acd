// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Updates a KB's access password.

use clap::Parser;
use quadstore::{metadata, protocol::auth_digest, Config, Metadata};

#[derive(Parser)]
#[command(name = "qs-passwd", about = "Set a KB's access password")]
struct Args {
    /// Name of the KB
    kbname: String,

    /// New password; omit to remove authentication
    password: Option<String>,
}

fn run(args: &Args) -> quadstore::Result<()> {
    let config = Config::from_env();

    let md_path = quadstore::file::metadata_path(&config, &args.kbname);
    let mut md = Metadata::open(&md_path, false)?;

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let salt = md.get_int(metadata::MD_SALT, 0) as u32;

    match &args.password {
        Some(password) => {
            let digest = auth_digest(&args.kbname, password, salt);
            md.set(metadata::MD_HASH, quadstore::setup::hex(&digest));
        }
        None => md.set(metadata::MD_HASH, ""),
    }

    md.flush()?;

    Ok(())
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    if let Err(e) = run(&args) {
        eprintln!("qs-passwd: {e}");
        std::process::exit(1);
    }
}

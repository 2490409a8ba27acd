// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Clones a KB's directory tree under a new name.

use clap::Parser;
use quadstore::{protocol::auth_digest, Config, Metadata};
use std::path::Path;

#[derive(Parser)]
#[command(name = "qs-backend-copy", about = "Copy a KB under a new name")]
struct Args {
    /// Password for the copy (defaults to open access)
    #[arg(short = 'P', long)]
    password: Option<String>,

    /// KB to copy from
    from: String,

    /// Name of the new KB
    to: String,
}

fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;

    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());

        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }

    Ok(())
}

fn run(args: &Args) -> quadstore::Result<()> {
    let config = Config::from_env();

    if !quadstore::file::kb_name_is_legal(&args.to) {
        return Err(quadstore::Error::Protocol(format!(
            "illegal KB name {:?}",
            args.to
        )));
    }

    let from_dir = quadstore::file::kb_dir(&config, &args.from);
    let to_dir = quadstore::file::kb_dir(&config, &args.to);

    if !from_dir.is_dir() {
        return Err(quadstore::Error::NotFound(format!("KB {}", args.from)));
    }
    if to_dir.exists() {
        return Err(quadstore::Error::Conflict(format!(
            "KB {} already exists",
            args.to
        )));
    }

    copy_tree(&from_dir, &to_dir)?;

    // the copy must not answer to the old name or password
    let md_path = quadstore::file::metadata_path(&config, &args.to);
    let mut md = Metadata::open(&md_path, false)?;
    md.set(quadstore::metadata::MD_NAME, args.to.clone());

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let salt = md.get_int(quadstore::metadata::MD_SALT, 0) as u32;
    match &args.password {
        Some(password) => {
            let digest = auth_digest(&args.to, password, salt);
            md.set(quadstore::metadata::MD_HASH, quadstore::setup::hex(&digest));
        }
        None => md.set(quadstore::metadata::MD_HASH, ""),
    }
    md.flush()?;

    // the runtime lock of the source must not travel with the copy
    let runtime = quadstore::file::runtime_info_path(&config, &args.to);
    if runtime.exists() {
        std::fs::remove_file(runtime)?;
    }

    Ok(())
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    if let Err(e) = run(&args) {
        eprintln!("qs-backend-copy: {e}");
        std::process::exit(1);
    }

    println!("copied KB {} to {}", args.from, args.to);
}

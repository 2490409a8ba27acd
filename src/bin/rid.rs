// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Prints the RID of lexical forms, the way the store would hash them.

use clap::Parser;
use quadstore::{Rid, RID_NULL};

#[derive(Parser)]
#[command(name = "qs-rid", about = "Hash lexical forms into RIDs")]
struct Args {
    /// Treat the terms as plain literals instead of URIs
    #[arg(short = 'L', long)]
    literal: bool,

    /// Terms to hash
    #[arg(required = true)]
    terms: Vec<String>,
}

fn main() {
    let args = Args::parse();

    for term in &args.terms {
        let rid = if args.literal {
            Rid::literal(term, RID_NULL)
        } else {
            Rid::uri(term)
        };

        println!("{rid} {term}");
    }
}

// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Per-node storage engine for a horizontally sharded RDF quad store.
//!
//! ##### About
//!
//! A store ("KB") is split into up to 256 segments, each owned by one node.
//! This crate implements everything one node needs to serve its segments:
//! the on-disk index structures, the bulk import pipeline, the indexed
//! quad-matching primitive (`bind`) and the resource-hash lookup, plus the
//! binary wire protocol the query front-end speaks.
//!
//! Quads `(graph, subject, predicate, object)` are stored as 64-bit
//! resource identifiers ([`Rid`]), derived from the lexical form by a
//! strong hash. Per segment, a predicate gets two radix trees (one keyed by
//! subject, one by object) whose leaves point at linked chains of
//! `(graph, value)` pairs in a shared chain table. Graph membership is
//! tracked separately so graph-scoped reads and deletes do not have to
//! touch every predicate index.
//!
//! # Example usage
//!
//! ```
//! use quadstore::{BindQuery, Config, Engine, Quad, Rid, StoreOptions};
//! #
//! # let dir = tempfile::tempdir()?;
//! # let config = Config::new(dir.path()).disk_limit_gb(0.0);
//!
//! quadstore::create_store(&config, "example", &StoreOptions::new(1))?;
//! let mut engine = Engine::open(&config, "example", 0)?;
//!
//! let g = Rid::uri("http://example.org/graph");
//! let s = Rid::uri("http://example.org/s");
//! let p = Rid::uri("http://example.org/p");
//! let o = Rid::uri("http://example.org/o");
//!
//! engine.start_import()?;
//! engine.quad_import(&[Quad::new(g, s, p, o)])?;
//! engine.stop_import()?;
//!
//! let hits = engine.bind(&BindQuery::everything())?;
//! # assert!(hits.is_match());
//! #
//! # Ok::<(), quadstore::Error>(())
//! ```

#![deny(clippy::all, clippy::cargo)]
#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::option_if_let_else)]

macro_rules! fail_iter {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => return Some(Err(e)),
        }
    };
}

pub mod coding;
mod config;

#[doc(hidden)]
pub mod engine;

mod error;

#[doc(hidden)]
pub mod file;

mod list;
mod lock;
mod mapped;

pub mod metadata;

mod mhash;

#[doc(hidden)]
pub mod protocol;

mod ptable;
mod ptree;
mod quad;
mod resource;
mod rhash;
mod rid;

#[doc(hidden)]
pub mod server;

#[doc(hidden)]
pub mod setup;

mod tbchain;
mod timing;
mod tlist;

#[doc(hidden)]
pub use {
    list::List,
    mhash::ModelHash,
    ptable::{Ptable, RowId},
    ptree::Ptree,
    rhash::ResourceHash,
    tbchain::TripleBlockChain,
    tlist::TripleList,
};

pub use {
    coding::{DecodeError, EncodeError},
    config::Config,
    engine::{
        query::{BindFlags, BindQuery, BindResult, SameMask},
        DataSize, Engine, MAX_OPEN_PTREES,
    },
    error::{Error, Result},
    metadata::Metadata,
    quad::Quad,
    resource::Resource,
    rid::{default_graph_rid, Rid, RidKind, DEFAULT_GRAPH_URI, HASH_FUNCTION, RID_GONE, RID_NULL},
    setup::{create_store, destroy_store, StoreOptions},
    timing::{ImportTiming, QueryTiming},
};

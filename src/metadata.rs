// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! KB metadata: a small key/value store serialized as flat N-Triples.
//!
//! The file lives at `<store root>/<kb>/metadata.nt` and holds one
//! statement per line, `<kb uri> <property> "value" .`. Keys may repeat
//! (the per-segment role properties do). Writes are buffered in memory
//! and flushed with an atomic rewrite.

use crate::{file::rewrite_atomic, Error, Result};
use std::path::{Path, PathBuf};

/// Property IRI prefix for every metadata key.
pub const PREFIX: &str = "http://quadstore.org/metadata#";

pub const MD_NAME: &str = "kb_name";
pub const MD_SEGMENTS: &str = "num_segments";
pub const MD_VERSION: &str = "version";
pub const MD_SALT: &str = "salt";
pub const MD_HASH: &str = "hash";
pub const MD_SEGMENT_P: &str = "segment_p";
pub const MD_SEGMENT_M: &str = "segment_m";
pub const MD_BNODE: &str = "bnode";
pub const MD_HASHFUNC: &str = "hash_function";
pub const MD_STORE: &str = "store_type";
pub const MD_MODEL_DATA: &str = "model_data";
pub const MD_MODEL_DIRS: &str = "model_dirs";
pub const MD_MODEL_FILES: &str = "model_files";
pub const MD_UUID: &str = "uuid";

/// On-disk table format version this binary reads and writes.
pub const CURRENT_TABLE_VERSION: i64 = 11;

/// Oldest table format version this binary still opens.
pub const EARLIEST_TABLE_VERSION: i64 = 10;

/// Parsed metadata plus the path it flushes back to.
pub struct Metadata {
    path: PathBuf,
    subject: String,
    entries: Vec<(String, String)>,
}

impl Metadata {
    /// Reads a metadata file, creating an empty one if permitted.
    pub fn open(path: &Path, create: bool) -> Result<Self> {
        let mut md = Self {
            path: path.into(),
            subject: format!("file://{}", path.display()),
            entries: Vec::new(),
        };

        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && create => {
                return Ok(md);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(path.display().to_string()));
            }
            Err(e) => return Err(Error::Io(e)),
        };

        for (lineno, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = parse_statement(line) else {
                return Err(Error::Corruption(format!(
                    "{}:{}: unparsable metadata statement",
                    path.display(),
                    lineno + 1,
                )));
            };

            md.entries.push((key, value));
        }

        Ok(md)
    }

    fn full_key(key: &str) -> String {
        format!("{PREFIX}{key}")
    }

    /// First value for a key.
    #[must_use]
    pub fn get_string(&self, key: &str) -> Option<&str> {
        let key = Self::full_key(key);

        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Every value for a key, in file order.
    #[must_use]
    pub fn get_all(&self, key: &str) -> Vec<&str> {
        let key = Self::full_key(key);

        self.entries
            .iter()
            .filter(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    #[must_use]
    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        self.get_string(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    #[must_use]
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get_string(key)
            .map_or(default, |v| v == "true" || v == "1")
    }

    /// All values of a key parsed as integers, skipping junk.
    #[must_use]
    pub fn get_int_vector(&self, key: &str) -> Vec<u32> {
        self.get_all(key)
            .iter()
            .filter_map(|v| v.parse().ok())
            .collect()
    }

    /// Replaces every value of `key` with one value.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let full = Self::full_key(key);
        self.entries.retain(|(k, _)| *k != full);
        self.entries.push((full, value.into()));
    }

    /// Appends a value, keeping existing ones.
    pub fn add(&mut self, key: &str, value: impl Into<String>) {
        self.entries.push((Self::full_key(key), value.into()));
    }

    pub fn remove(&mut self, key: &str) {
        let full = Self::full_key(key);
        self.entries.retain(|(k, _)| *k != full);
    }

    /// Atomically rewrites the backing file.
    pub fn flush(&self) -> Result<()> {
        let mut out = String::new();

        for (key, value) in &self.entries {
            out.push_str(&format!(
                "<{}> <{}> \"{}\" .\n",
                self.subject,
                key,
                escape(value),
            ));
        }

        rewrite_atomic(&self.path, out.as_bytes())?;

        Ok(())
    }
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();

    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }

    out
}

/// Parses `<subj> <pred> "obj" .` or `<subj> <pred> <obj> .`.
fn parse_statement(line: &str) -> Option<(String, String)> {
    let rest = line.strip_prefix('<')?;
    let (_, rest) = rest.split_once('>')?;
    let rest = rest.trim_start().strip_prefix('<')?;
    let (pred, rest) = rest.split_once('>')?;
    let rest = rest.trim_start();

    let value = if let Some(rest) = rest.strip_prefix('"') {
        // find the closing quote, honouring escapes
        let mut end = None;
        let mut escaped = false;
        for (i, c) in rest.char_indices() {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                end = Some(i);
                break;
            }
        }
        unescape(&rest[..end?])
    } else if let Some(rest) = rest.strip_prefix('<') {
        let (uri, _) = rest.split_once('>')?;
        uri.to_string()
    } else {
        return None;
    };

    Some((pred.to_string(), value))
}

// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Store creation and destruction on a single node.

use crate::{
    config::Config,
    file,
    metadata::{self, Metadata},
    protocol::auth_digest,
    rid::HASH_FUNCTION,
    Error, Result,
};
use xxhash_rust::xxh3::xxh3_128;

/// Hard ceiling on segments per store.
pub const MAX_SEGMENTS: u32 = 256;

/// Parameters for creating a store on this node.
#[derive(Clone, Debug)]
pub struct StoreOptions {
    /// Total segments in the KB
    pub segments: u32,

    /// This node's index within the cluster
    pub node: u32,

    /// Number of nodes in the cluster
    pub cluster: u32,

    /// Also hold mirror copies of the next node's segments
    pub mirror: bool,

    /// Store per-graph triples in separate files instead of the shared
    /// triple-block chain
    pub model_files: bool,

    /// Access password; unset means open access
    pub password: Option<String>,
}

impl StoreOptions {
    #[must_use]
    pub fn new(segments: u32) -> Self {
        Self {
            segments,
            node: 0,
            cluster: 1,
            mirror: false,
            model_files: false,
            password: None,
        }
    }

    #[must_use]
    pub fn node(mut self, node: u32, cluster: u32) -> Self {
        self.node = node;
        self.cluster = cluster;
        self
    }

    #[must_use]
    pub fn mirror(mut self, mirror: bool) -> Self {
        self.mirror = mirror;
        self
    }

    #[must_use]
    pub fn model_files(mut self, model_files: bool) -> Self {
        self.model_files = model_files;
        self
    }

    #[must_use]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Primary segments this node owns: `seg % cluster == node`.
    #[must_use]
    pub fn primary_segments(&self) -> Vec<u32> {
        (0..self.segments)
            .filter(|s| s % self.cluster == self.node)
            .collect()
    }

    /// Mirror segments: the next node's primaries.
    #[must_use]
    pub fn mirror_segments(&self) -> Vec<u32> {
        if !self.mirror || self.cluster < 2 {
            return Vec::new();
        }

        (0..self.segments)
            .filter(|s| s % self.cluster == (self.node + 1) % self.cluster)
            .collect()
    }
}

/// Weakly random bits for salts and UUIDs; uniqueness matters here,
/// unpredictability does not.
fn entropy(extra: &str) -> u128 {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos());

    xxh3_128(format!("{now}:{}:{extra}", std::process::id()).as_bytes())
}

/// Creates the on-disk layout and metadata for a KB on this node.
///
/// Fails with [`Error::Conflict`] when the KB already exists.
pub fn create_store(config: &Config, kb_name: &str, options: &StoreOptions) -> Result<()> {
    if !file::kb_name_is_legal(kb_name) {
        return Err(Error::Protocol(format!("illegal KB name {kb_name:?}")));
    }
    if options.segments == 0 || options.segments > MAX_SEGMENTS {
        return Err(Error::Protocol(format!(
            "segment count must be within [1, {MAX_SEGMENTS}]"
        )));
    }
    if options.cluster == 0 || options.node >= options.cluster {
        return Err(Error::Protocol("node index outside cluster".into()));
    }

    let md_path = file::metadata_path(config, kb_name);
    if md_path.exists() {
        return Err(Error::Conflict(format!("KB {kb_name} already exists")));
    }

    std::fs::create_dir_all(file::kb_dir(config, kb_name))?;

    #[allow(clippy::cast_possible_truncation)]
    let salt = entropy(kb_name) as u32;

    let mut md = Metadata::open(&md_path, true)?;
    md.set(metadata::MD_NAME, kb_name);
    md.set(metadata::MD_SEGMENTS, options.segments.to_string());
    md.set(
        metadata::MD_VERSION,
        metadata::CURRENT_TABLE_VERSION.to_string(),
    );
    md.set(metadata::MD_STORE, "native");
    md.set(metadata::MD_HASHFUNC, HASH_FUNCTION);
    md.set(metadata::MD_SALT, salt.to_string());
    md.set(metadata::MD_BNODE, "1");
    md.set(metadata::MD_MODEL_DATA, "true");
    md.set(metadata::MD_MODEL_DIRS, "true");
    md.set(
        metadata::MD_MODEL_FILES,
        if options.model_files { "true" } else { "false" },
    );
    md.set(metadata::MD_UUID, format!("{:032x}", entropy("uuid")));

    if let Some(password) = &options.password {
        let digest = auth_digest(kb_name, password, salt);
        md.set(metadata::MD_HASH, hex(&digest));
    } else {
        md.set(metadata::MD_HASH, "");
    }

    for seg in options.primary_segments() {
        md.add(metadata::MD_SEGMENT_P, seg.to_string());
        std::fs::create_dir_all(file::segment_dir(config, kb_name, seg))?;
    }
    for seg in options.mirror_segments() {
        md.add(metadata::MD_SEGMENT_M, seg.to_string());
        std::fs::create_dir_all(file::segment_dir(config, kb_name, seg))?;
    }

    md.flush()?;

    log::info!(
        "created KB {kb_name} with {} segments ({} primary here)",
        options.segments,
        options.primary_segments().len(),
    );

    Ok(())
}

/// Removes a KB's directory tree from this node.
pub fn destroy_store(config: &Config, kb_name: &str) -> Result<()> {
    if !file::kb_name_is_legal(kb_name) {
        return Err(Error::Protocol(format!("illegal KB name {kb_name:?}")));
    }

    let dir = file::kb_dir(config, kb_name);
    if !dir.exists() {
        return Err(Error::NotFound(format!("KB {kb_name}")));
    }

    std::fs::remove_dir_all(dir)?;

    log::info!("destroyed KB {kb_name}");

    Ok(())
}

/// Lower-case hex of a digest.
#[must_use]
pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn create_and_destroy() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = Config::new(dir.path());

        create_store(&config, "kb1", &StoreOptions::new(4))?;

        let md = Metadata::open(&file::metadata_path(&config, "kb1"), false)?;
        assert_eq!(Some("kb1"), md.get_string(metadata::MD_NAME));
        assert_eq!(4, md.get_int(metadata::MD_SEGMENTS, 0));
        assert_eq!(Some(HASH_FUNCTION), md.get_string(metadata::MD_HASHFUNC));
        assert_eq!(vec![0, 1, 2, 3], md.get_int_vector(metadata::MD_SEGMENT_P));

        // double create conflicts
        assert!(matches!(
            create_store(&config, "kb1", &StoreOptions::new(4)),
            Err(Error::Conflict(_))
        ));

        destroy_store(&config, "kb1")?;
        assert!(matches!(
            destroy_store(&config, "kb1"),
            Err(Error::NotFound(_))
        ));

        Ok(())
    }

    #[test]
    fn segment_distribution() {
        let options = StoreOptions::new(8).node(1, 4).mirror(true);
        assert_eq!(vec![1, 5], options.primary_segments());
        assert_eq!(vec![2, 6], options.mirror_segments());

        let solo = StoreOptions::new(2);
        assert_eq!(vec![0, 1], solo.primary_segments());
        assert!(solo.mirror_segments().is_empty());
    }

    #[test]
    fn rejects_bad_names() {
        let config = Config::new("/tmp");
        assert!(create_store(&config, "bad name", &StoreOptions::new(1)).is_err());
        assert!(destroy_store(&config, "../etc").is_err());
    }
}

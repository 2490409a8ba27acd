// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Model hash: graph RID → usage tag.
//!
//! The value encodes where a graph's triples live: 0 means the graph is
//! absent, 1 means a per-graph triple list file, 2 and above is the head
//! block id of the graph's chain in the triple-block chain file.

use crate::{file::HEADER_SIZE, mapped::MappedFile, rid::Rid, Error, Result};
use std::path::{Path, PathBuf};

pub const MAGIC: [u8; 4] = *b"JXM0";
const REVISION: u32 = 1;

const ENTRY_SIZE: usize = 12;
const INITIAL_SIZE: u32 = 4096;
const INITIAL_SEARCH_DIST: u32 = 16;

const OFF_MAGIC: usize = 0;
const OFF_REVISION: usize = 4;
const OFF_SIZE: usize = 8;
const OFF_COUNT: usize = 12;
const OFF_SEARCH_DIST: usize = 16;

/// Open-addressed hash of graph usage tags, 12-byte entries.
pub struct ModelHash {
    map: MappedFile,
    path: PathBuf,
    size: u32,
    count: u32,
    search_dist: u32,
}

fn bucket(rid: Rid, size: u32) -> u32 {
    #[allow(clippy::cast_possible_truncation)]
    {
        ((rid.0 >> 10) as u32) & (size - 1)
    }
}

impl ModelHash {
    pub fn open(path: &Path, writable: bool, create: bool) -> Result<Self> {
        let existed = path.exists();
        let min_len = HEADER_SIZE as u64 + u64::from(INITIAL_SIZE) * ENTRY_SIZE as u64;

        let mut map = MappedFile::open(path, writable, create, if existed { 0 } else { min_len })?;

        let (size, count, search_dist);
        if existed {
            if map.len() < HEADER_SIZE || map.bytes()[OFF_MAGIC..OFF_MAGIC + 4] != MAGIC {
                return Err(Error::Corruption(format!(
                    "{} does not look like a mhash file",
                    path.display()
                )));
            }
            let revision = map.read_u32(OFF_REVISION);
            if revision != REVISION {
                return Err(Error::Corruption(format!(
                    "{} is revision {revision}, expected {REVISION}",
                    path.display()
                )));
            }

            size = map.read_u32(OFF_SIZE);
            count = map.read_u32(OFF_COUNT);
            search_dist = map.read_u32(OFF_SEARCH_DIST);

            if !size.is_power_of_two() {
                return Err(Error::Corruption(format!(
                    "{} hash size {size} is not a power of two",
                    path.display()
                )));
            }
        } else {
            size = INITIAL_SIZE;
            count = 0;
            search_dist = INITIAL_SEARCH_DIST;

            map.bytes_mut()[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(&MAGIC);
            map.write_u32(OFF_REVISION, REVISION);
            map.write_u32(OFF_SIZE, size);
            map.write_u32(OFF_COUNT, count);
            map.write_u32(OFF_SEARCH_DIST, search_dist);
        }

        Ok(Self {
            map,
            path: path.into(),
            size,
            count,
            search_dist,
        })
    }

    fn entry(&self, index: u32) -> (Rid, u32) {
        let off = HEADER_SIZE + index as usize * ENTRY_SIZE;

        (Rid(self.map.read_u64(off)), self.map.read_u32(off + 8))
    }

    fn set_entry(&mut self, index: u32, rid: Rid, val: u32) {
        let off = HEADER_SIZE + index as usize * ENTRY_SIZE;
        self.map.write_u64(off, rid.0);
        self.map.write_u32(off + 8, val);
    }

    /// Usage tag for a graph; 0 when absent.
    pub fn get(&self, rid: Rid) -> Result<u32> {
        let mut index = bucket(rid, self.size);

        for _ in 0..self.search_dist {
            let (erid, val) = self.entry(index);
            if erid == rid {
                return Ok(val);
            }
            index = (index + 1) & (self.size - 1);
            if index == 0 {
                break;
            }
        }

        Ok(0)
    }

    /// Stores a usage tag; 0 deletes. Grows the table when no slot is
    /// found within the probe window.
    pub fn put(&mut self, rid: Rid, val: u32) -> Result<()> {
        let mut index = bucket(rid, self.size);
        let mut candidate = None;
        let mut i = 0;

        let slot = loop {
            let (erid, _) = self.entry(index);
            if erid == rid {
                break index;
            }
            if erid.0 == 0 && candidate.is_none() {
                // remember the hole; a matching entry may still follow
                candidate = Some(index);
            }

            let window_end = i == self.search_dist || index == self.size - 1;
            if window_end {
                if let Some(candidate) = candidate {
                    break candidate;
                }

                self.grow()?;

                return self.put(rid, val);
            }

            index = (index + 1) & (self.size - 1);
            i += 1;
        };

        let (old_rid, old_val) = self.entry(slot);
        if old_rid == rid && old_val == val {
            return Ok(());
        }

        self.set_entry(slot, rid, val);

        if val != 0 && old_val == 0 {
            self.count += 1;
        } else if val == 0 && old_val != 0 {
            self.count -= 1;
        }

        Ok(())
    }

    fn grow(&mut self) -> Result<()> {
        let old_size = self.size;
        self.size *= 2;
        self.search_dist = self.search_dist * 2 + 1;

        self.map.grow_to(
            HEADER_SIZE as u64 + u64::from(self.size) * ENTRY_SIZE as u64,
        )?;

        // with bucket = hash & (size - 1), doubling moves an entry either
        // nowhere or exactly old_size slots up, preserving probe offsets
        for i in 0..old_size {
            let (rid, val) = self.entry(i);
            if rid.0 == 0 {
                continue;
            }
            if bucket(rid, self.size) >= old_size {
                self.set_entry(i, Rid(0), 0);
                self.set_entry(old_size + i, rid, val);
            }
        }

        log::trace!("grew {} to {} slots", self.path.display(), self.size);

        self.write_header();

        Ok(())
    }

    /// Number of graphs with a non-zero tag.
    #[must_use]
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Every graph RID with a non-zero tag.
    #[must_use]
    pub fn keys(&self) -> Vec<Rid> {
        let mut keys = Vec::with_capacity(self.count as usize);

        for i in 0..self.size {
            let (rid, val) = self.entry(i);
            if val != 0 {
                keys.push(rid);
            }
        }

        keys
    }

    /// Every `(graph, tag)` with a non-zero tag.
    #[must_use]
    pub fn entries(&self) -> Vec<(Rid, u32)> {
        let mut entries = Vec::with_capacity(self.count as usize);

        for i in 0..self.size {
            let (rid, val) = self.entry(i);
            if val != 0 {
                entries.push((rid, val));
            }
        }

        entries
    }

    fn write_header(&mut self) {
        self.map.write_u32(OFF_SIZE, self.size);
        self.map.write_u32(OFF_COUNT, self.count);
        self.map.write_u32(OFF_SEARCH_DIST, self.search_dist);
    }

    /// Writes the header fields and forces data out.
    pub fn flush(&mut self) -> Result<()> {
        if self.map.is_writable() {
            self.write_header();
            self.map.sync()?;
        }

        Ok(())
    }

    pub fn unlink(mut self) -> Result<()> {
        if self.map.is_writable() {
            self.write_header();
        }
        std::fs::remove_file(&self.path)?;

        Ok(())
    }
}

impl Drop for ModelHash {
    fn drop(&mut self) {
        if self.map.is_writable() {
            self.write_header();
        }
    }
}

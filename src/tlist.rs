// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Per-graph triple list: the "old-style" graph index.
//!
//! When a store is created with `model_files`, each graph's triples go
//! into a plain width-3 RID append file of its own instead of the shared
//! triple-block chain. Reads must support both styles regardless of how
//! the store was created.

use crate::{
    file::HEADER_SIZE,
    lock::{lock_fd, LockMode},
    rid::Rid,
    Error, Result,
};
use byteorder::{ByteOrder, LittleEndian as LE};
use std::{
    fs::File,
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

pub const MAGIC: [u8; 4] = *b"JXT0";
const REVISION: u32 = 2;

const ROW_SIZE: usize = 24;

/// One graph's triple file.
pub struct TripleList {
    file: File,
    path: PathBuf,
    rows: u64,
    read_pos: u64,
}

impl TripleList {
    pub fn open(path: &Path, writable: bool, create: bool) -> Result<Self> {
        if create && writable {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let existed = path.exists();
        let mut file = File::options()
            .read(true)
            .write(writable)
            .create(create && writable)
            .open(path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::NotFound(path.display().to_string())
                } else {
                    Error::Io(e)
                }
            })?;

        if writable {
            lock_fd(&file, LockMode::Exclusive).map_err(|e| {
                if e.kind() == std::io::ErrorKind::WouldBlock {
                    Error::Conflict(format!("{} is locked", path.display()))
                } else {
                    Error::Io(e)
                }
            })?;
        }

        let len = file.metadata()?.len();
        if existed && len > 0 {
            let mut magic = [0u8; 4];
            (&file).read_exact(&mut magic)?;
            if magic != MAGIC {
                return Err(Error::Corruption(format!(
                    "{} does not look like a triple list",
                    path.display()
                )));
            }
            let mut rev = [0u8; 4];
            (&file).read_exact(&mut rev)?;
            let revision = LE::read_u32(&rev);
            if revision != REVISION {
                return Err(Error::Corruption(format!(
                    "{} is revision {revision}, expected {REVISION}",
                    path.display()
                )));
            }
            if (len - HEADER_SIZE as u64) % ROW_SIZE as u64 != 0 {
                return Err(Error::Corruption(format!(
                    "{} has a partial row",
                    path.display()
                )));
            }
        } else {
            let mut header = [0u8; HEADER_SIZE];
            header[0..4].copy_from_slice(&MAGIC);
            LE::write_u32(&mut header[4..8], REVISION);
            file.write_all(&header)?;
        }

        let rows = (file.metadata()?.len() - HEADER_SIZE as u64) / ROW_SIZE as u64;

        Ok(Self {
            file,
            path: path.into(),
            rows,
            read_pos: 0,
        })
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.rows
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn add(&mut self, triple: [Rid; 3]) -> Result<u64> {
        let mut row = [0u8; ROW_SIZE];
        LE::write_u64(&mut row[0..8], triple[0].0);
        LE::write_u64(&mut row[8..16], triple[1].0);
        LE::write_u64(&mut row[16..24], triple[2].0);

        self.file.seek(SeekFrom::Start(
            HEADER_SIZE as u64 + self.rows * ROW_SIZE as u64,
        ))?;
        self.file.write_all(&row)?;
        self.rows += 1;

        Ok(self.rows - 1)
    }

    pub fn rewind(&mut self) {
        self.read_pos = 0;
    }

    pub fn next_value(&mut self) -> Result<Option<[Rid; 3]>> {
        if self.read_pos >= self.rows {
            return Ok(None);
        }

        let mut row = [0u8; ROW_SIZE];
        self.file.seek(SeekFrom::Start(
            HEADER_SIZE as u64 + self.read_pos * ROW_SIZE as u64,
        ))?;
        self.file.read_exact(&mut row)?;
        self.read_pos += 1;

        Ok(Some([
            Rid(LE::read_u64(&row[0..8])),
            Rid(LE::read_u64(&row[8..16])),
            Rid(LE::read_u64(&row[16..24])),
        ]))
    }

    /// Drops every triple but keeps the file.
    pub fn truncate(&mut self) -> Result<()> {
        self.file.set_len(HEADER_SIZE as u64)?;
        self.rows = 0;
        self.read_pos = 0;

        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;

        Ok(())
    }

    pub fn unlink(self) -> Result<()> {
        std::fs::remove_file(&self.path)?;

        Ok(())
    }
}

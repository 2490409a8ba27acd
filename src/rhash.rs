// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Resource hash: RID → `(attr, lexical form)`.
//!
//! A disk-backed open-addressed table. Because RIDs are already a strong
//! hash of the lexical form, the table just truncates them to index a
//! power-of-two slot array and probes linearly. Short lexical forms are
//! stored inline in the 32-byte slot; longer ones spill into a sidecar
//! `.lex` file addressed by `(offset, length)`.
//!
//! RID collisions (two lexical forms, one hash) are astronomically rare
//! but tolerated: the first write wins and later writers get a warning,
//! never an error.

use crate::{
    file::HEADER_SIZE,
    mapped::MappedFile,
    resource::Resource,
    rid::{Rid, RID_NULL},
    Error, Result,
};
use byteorder::{ByteOrder, LittleEndian as LE};
use std::{
    fs::File,
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

pub const MAGIC: [u8; 4] = *b"JXR0";
pub const LEX_MAGIC: [u8; 4] = *b"JXR1";
const REVISION: u32 = 1;

const ENTRY_SIZE: usize = 32;
const INITIAL_SIZE: u32 = 4096;
const INITIAL_SEARCH_DIST: u32 = 32;

/// Longest lexical form stored inline in a slot.
const INLINE_MAX: usize = 14;

const OFF_MAGIC: usize = 0;
const OFF_REVISION: usize = 4;
const OFF_SIZE: usize = 8;
const OFF_COUNT: usize = 12;
const OFF_SEARCH_DIST: usize = 16;

const DISP_NONE: u8 = 0;
const DISP_INLINE: u8 = 1;
const DISP_EXTERNAL: u8 = 2;

/// The resource table of one segment plus its lex sidecar.
pub struct ResourceHash {
    map: MappedFile,
    path: PathBuf,
    lex_file: File,
    lex_tail: u64,
    size: u32,
    count: u32,
    search_dist: u32,
}

fn bucket(rid: Rid, size: u32) -> u32 {
    #[allow(clippy::cast_possible_truncation)]
    {
        (rid.0 as u32) & (size - 1)
    }
}

impl ResourceHash {
    pub fn open(path: &Path, lex_path: &Path, writable: bool, create: bool) -> Result<Self> {
        let existed = path.exists();
        let min_len = HEADER_SIZE as u64 + u64::from(INITIAL_SIZE) * ENTRY_SIZE as u64;

        let mut map = MappedFile::open(path, writable, create, if existed { 0 } else { min_len })?;

        let (size, count, search_dist);
        if existed {
            if map.len() < HEADER_SIZE || map.bytes()[OFF_MAGIC..OFF_MAGIC + 4] != MAGIC {
                return Err(Error::Corruption(format!(
                    "{} does not look like a resource hash",
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

        let lex_existed = lex_path.exists();
        let mut lex_file = File::options()
            .read(true)
            .write(writable)
            .create(create && writable)
            .open(lex_path)?;

        if lex_existed {
            let mut magic = [0u8; 4];
            (&lex_file).read_exact(&mut magic)?;
            if magic != LEX_MAGIC {
                return Err(Error::Corruption(format!(
                    "{} does not look like a lex file",
                    lex_path.display()
                )));
            }
        } else {
            let mut header = [0u8; HEADER_SIZE];
            header[0..4].copy_from_slice(&LEX_MAGIC);
            LE::write_u32(&mut header[4..8], REVISION);
            lex_file.write_all(&header)?;
        }

        let lex_tail = lex_file.seek(SeekFrom::End(0))?;

        Ok(Self {
            map,
            path: path.into(),
            lex_file,
            lex_tail,
            size,
            count,
            search_dist,
        })
    }

    /// Number of resources stored.
    #[must_use]
    pub fn count(&self) -> u32 {
        self.count
    }

    fn slot_rid(&self, index: u32) -> Rid {
        Rid(self.map.read_u64(HEADER_SIZE + index as usize * ENTRY_SIZE))
    }

    fn read_slot(&self, index: u32) -> Result<(Rid, Rid, String)> {
        let off = HEADER_SIZE + index as usize * ENTRY_SIZE;
        let rid = Rid(self.map.read_u64(off));
        let attr = Rid(self.map.read_u64(off + 8));
        let disp = &self.map.bytes()[off + 16..off + 32];

        let lex = match disp[0] {
            DISP_NONE => String::new(),
            DISP_INLINE => {
                let len = disp[1] as usize;
                if len > INLINE_MAX {
                    return Err(self.corrupt(index, "inline length out of range"));
                }
                std::str::from_utf8(&disp[2..2 + len])
                    .map_err(|_| self.corrupt(index, "inline lex is not UTF-8"))?
                    .to_string()
            }
            DISP_EXTERNAL => {
                let len = LE::read_u32(&disp[4..8]) as usize;
                let offset = LE::read_u64(&disp[8..16]);
                if offset + len as u64 > self.lex_tail {
                    return Err(self.corrupt(index, "lex pointer past end of lex file"));
                }

                let mut buf = vec![0u8; len];
                (&self.lex_file).seek(SeekFrom::Start(offset))?;
                (&self.lex_file).read_exact(&mut buf)?;

                String::from_utf8(buf)
                    .map_err(|_| self.corrupt(index, "lex entry is not UTF-8"))?
            }
            tag => {
                return Err(Error::Corruption(format!(
                    "slot {index} of {}: unknown lex disposition {tag:#x}",
                    self.path.display()
                )));
            }
        };

        Ok((rid, attr, lex))
    }

    fn write_slot(&mut self, index: u32, rid: Rid, attr: Rid, lex: &str) -> Result<()> {
        let mut disp = [0u8; 16];

        if lex.len() <= INLINE_MAX {
            disp[0] = DISP_INLINE;
            #[allow(clippy::cast_possible_truncation)]
            {
                disp[1] = lex.len() as u8;
            }
            disp[2..2 + lex.len()].copy_from_slice(lex.as_bytes());
        } else {
            let offset = self.lex_tail;
            self.lex_file.seek(SeekFrom::Start(offset))?;
            self.lex_file.write_all(lex.as_bytes())?;
            self.lex_tail += lex.len() as u64;

            disp[0] = DISP_EXTERNAL;
            #[allow(clippy::cast_possible_truncation)]
            LE::write_u32(&mut disp[4..8], lex.len() as u32);
            LE::write_u64(&mut disp[8..16], offset);
        }

        let off = HEADER_SIZE + index as usize * ENTRY_SIZE;
        self.map.write_u64(off, rid.0);
        self.map.write_u64(off + 8, attr.0);
        self.map.bytes_mut()[off + 16..off + 32].copy_from_slice(&disp);

        Ok(())
    }

    fn find_slot(&self, rid: Rid) -> Option<std::result::Result<u32, u32>> {
        // Ok(index) = rid found there, Err(index) = first free slot in
        // the probe window, None = window exhausted
        let mut index = bucket(rid, self.size);
        let mut free = None;

        for _ in 0..=self.search_dist {
            let slot_rid = self.slot_rid(index);
            if slot_rid == rid {
                return Some(Ok(index));
            }
            if slot_rid.0 == 0 && free.is_none() {
                free = Some(index);
            }
            index = (index + 1) & (self.size - 1);
        }

        free.map(Err)
    }

    /// Batch insert. Duplicate RIDs keep the first stored lexical form;
    /// a genuine hash collision is logged and tolerated.
    pub fn put_multi(&mut self, resources: &[Resource]) -> Result<()> {
        for res in resources {
            self.put(res)?;
        }

        Ok(())
    }

    fn put(&mut self, res: &Resource) -> Result<()> {
        if res.rid.0 == 0 || res.rid == RID_NULL {
            return Err(Error::Protocol(format!(
                "refusing to store reserved rid {}",
                res.rid
            )));
        }

        match self.find_slot(res.rid) {
            Some(Ok(index)) => {
                let (_, attr, lex) = self.read_slot(index)?;
                if attr != res.attr || lex != res.lex {
                    log::warn!(
                        "rid collision on {}: keeping {lex:?}, dropping {:?}",
                        res.rid,
                        res.lex,
                    );
                }

                Ok(())
            }
            Some(Err(index)) => {
                self.write_slot(index, res.rid, res.attr, &res.lex)?;
                self.count += 1;

                Ok(())
            }
            None => {
                self.grow()?;
                self.put(res)
            }
        }
    }

    /// Fills `attr` and `lex` for each requested RID. Unknown RIDs come
    /// back with an empty lexical form and a warning in the log.
    pub fn get_multi(&self, rids: &[Rid]) -> Result<Vec<Resource>> {
        let mut out = Vec::with_capacity(rids.len());

        for &rid in rids {
            out.push(match self.find_slot(rid) {
                Some(Ok(index)) => {
                    let (_, attr, lex) = self.read_slot(index)?;

                    Resource { rid, attr, lex }
                }
                _ => {
                    log::warn!("resource {rid} not found in {}", self.path.display());

                    Resource {
                        rid,
                        attr: RID_NULL,
                        lex: String::new(),
                    }
                }
            });
        }

        Ok(out)
    }

    fn grow(&mut self) -> Result<()> {
        // full rehash: collect live slots, double, reinsert
        let mut live = Vec::with_capacity(self.count as usize);
        for i in 0..self.size {
            if self.slot_rid(i).0 != 0 {
                let off = HEADER_SIZE + i as usize * ENTRY_SIZE;
                let mut raw = [0u8; ENTRY_SIZE];
                raw.copy_from_slice(&self.map.bytes()[off..off + ENTRY_SIZE]);
                live.push(raw);
            }
        }

        self.size *= 2;
        self.search_dist = self.search_dist * 2 + 1;
        self.map
            .grow_to(HEADER_SIZE as u64 + u64::from(self.size) * ENTRY_SIZE as u64)?;

        // clear and replay
        self.map.bytes_mut()[HEADER_SIZE..].fill(0);
        for raw in live {
            let rid = Rid(LE::read_u64(&raw[0..8]));
            let mut index = bucket(rid, self.size);
            loop {
                if self.slot_rid(index).0 == 0 {
                    let off = HEADER_SIZE + index as usize * ENTRY_SIZE;
                    self.map.bytes_mut()[off..off + ENTRY_SIZE].copy_from_slice(&raw);

                    break;
                }
                index = (index + 1) & (self.size - 1);
            }
        }

        log::trace!("grew {} to {} slots", self.path.display(), self.size);

        self.write_header();

        Ok(())
    }

    fn write_header(&mut self) {
        self.map.write_u32(OFF_SIZE, self.size);
        self.map.write_u32(OFF_COUNT, self.count);
        self.map.write_u32(OFF_SEARCH_DIST, self.search_dist);
    }

    /// Writes headers and forces table and lex data out.
    pub fn flush(&mut self) -> Result<()> {
        if self.map.is_writable() {
            self.write_header();
            self.lex_file.flush()?;
            self.lex_file.sync_all()?;
            self.map.sync()?;
        }

        Ok(())
    }

    fn corrupt(&self, index: u32, what: &str) -> Error {
        Error::Corruption(format!(
            "slot {index} of {}: {what}",
            self.path.display()
        ))
    }
}

impl Drop for ResourceHash {
    fn drop(&mut self) {
        if self.map.is_writable() {
            self.write_header();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn open(dir: &Path) -> crate::Result<ResourceHash> {
        ResourceHash::open(
            &dir.join("res.rhash"),
            &dir.join("res.lex"),
            true,
            true,
        )
    }

    #[test]
    fn put_get_roundtrip() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut rh = open(dir.path())?;

        let short = Resource::uri("u:a");
        let long = Resource::uri("http://example.org/a/very/long/resource/name/indeed");
        let lit = Resource::literal("bonjour", Rid::uri("x:lang:fr"));

        rh.put_multi(&[short.clone(), long.clone(), lit.clone()])?;
        assert_eq!(3, rh.count());

        let got = rh.get_multi(&[long.rid, short.rid, lit.rid])?;
        assert_eq!(long, got[0]);
        assert_eq!(short, got[1]);
        assert_eq!(lit, got[2]);

        Ok(())
    }

    #[test]
    fn duplicate_insert_is_idempotent() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut rh = open(dir.path())?;

        let res = Resource::uri("http://example.org/dup");
        rh.put_multi(&[res.clone(), res.clone()])?;
        rh.put_multi(&[res.clone()])?;

        assert_eq!(1, rh.count());
        assert_eq!(res, rh.get_multi(&[res.rid])?[0]);

        Ok(())
    }

    #[test]
    fn collision_keeps_first_write() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut rh = open(dir.path())?;

        // forge two resources with the same rid but different lex
        let first = Resource::uri("u:first");
        let mut second = Resource::uri("u:second");
        second.rid = first.rid;

        rh.put_multi(&[first.clone(), second])?;
        assert_eq!(first.lex, rh.get_multi(&[first.rid])?[0].lex);

        Ok(())
    }

    #[test]
    fn missing_rid_comes_back_empty() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let rh = open(dir.path())?;

        let got = rh.get_multi(&[Rid(0x1234)])?;
        assert_eq!("", got[0].lex);
        assert_eq!(RID_NULL, got[0].attr);

        Ok(())
    }

    #[test]
    fn grows_past_initial_capacity() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut rh = open(dir.path())?;

        let resources: Vec<Resource> = (0..(INITIAL_SIZE + 100))
            .map(|i| Resource::uri(format!("http://example.org/r/{i}")))
            .collect();

        rh.put_multi(&resources)?;
        assert_eq!(INITIAL_SIZE + 100, rh.count());

        for res in resources.iter().step_by(97) {
            assert_eq!(*res, rh.get_multi(&[res.rid])?[0]);
        }

        Ok(())
    }

    #[test]
    fn reopen_reads_back() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let long = Resource::uri("http://example.org/a/long/enough/name/to/spill");
        {
            let mut rh = open(dir.path())?;
            rh.put_multi(&[long.clone()])?;
            rh.flush()?;
        }

        let rh = ResourceHash::open(
            &dir.path().join("res.rhash"),
            &dir.path().join("res.lex"),
            false,
            false,
        )?;
        assert_eq!(long, rh.get_multi(&[long.rid])?[0]);

        Ok(())
    }
}

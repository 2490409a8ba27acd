// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Memory-mapped file substrate used by every index structure.
//!
//! Each structure is one file: a 512-byte header followed by a packed
//! array of fixed-size records. The whole file is mapped; growth extends
//! the file and remaps, which invalidates anything pointing into the old
//! map, so record access always goes through offsets, never held
//! references.

use crate::{
    file::HEADER_SIZE,
    lock::{lock_fd, LockMode},
    Error, Result,
};
use byteorder::{ByteOrder, LittleEndian as LE};
use memmap2::{Mmap, MmapMut};
use std::{
    fs::File,
    path::{Path, PathBuf},
};

enum MapInner {
    ReadOnly(Mmap),
    Writable(MmapMut),
}

/// A file-backed byte arena.
pub struct MappedFile {
    file: File,
    map: MapInner,
    len: usize,
    writable: bool,
}

impl MappedFile {
    /// Opens (and with `create`, creates) a file and maps it whole.
    ///
    /// The file is extended to at least `min_len` before mapping. An
    /// advisory lock is taken: exclusive for writable opens, shared
    /// otherwise.
    pub fn open(path: &Path, writable: bool, create: bool, min_len: u64) -> Result<Self> {
        let file = File::options()
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

        lock_fd(
            &file,
            if writable {
                LockMode::Exclusive
            } else {
                LockMode::Shared
            },
        )
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock {
                Error::Conflict(format!("{} is locked", path.display()))
            } else {
                Error::Io(e)
            }
        })?;

        let file_len = file.metadata()?.len();
        let len = file_len.max(min_len);
        if len > file_len {
            if !writable {
                return Err(Error::Corruption(format!(
                    "{} is truncated ({file_len} < {len} bytes)",
                    path.display()
                )));
            }
            file.set_len(len)?;
        }

        let map = Self::map(&file, writable)?;

        #[allow(clippy::cast_possible_truncation)]
        Ok(Self {
            file,
            map,
            len: len as usize,
            writable,
        })
    }

    fn map(file: &File, writable: bool) -> Result<MapInner> {
        // SAFETY: the file is advisory-locked against cooperating writers;
        // the map is never handed out past a grow
        unsafe {
            Ok(if writable {
                MapInner::Writable(MmapMut::map_mut(file)?)
            } else {
                MapInner::ReadOnly(Mmap::map(file)?)
            })
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Extends the file and remaps. Grown space reads as zeroes.
    pub fn grow_to(&mut self, new_len: u64) -> Result<()> {
        debug_assert!(self.writable);

        if new_len as usize <= self.len {
            return Ok(());
        }

        if let MapInner::Writable(map) = &self.map {
            map.flush()?;
        }

        self.file.set_len(new_len)?;
        self.map = Self::map(&self.file, self.writable)?;

        #[allow(clippy::cast_possible_truncation)]
        {
            self.len = new_len as usize;
        }

        Ok(())
    }

    /// Forces mapped data out to disk.
    pub fn sync(&self) -> Result<()> {
        if let MapInner::Writable(map) = &self.map {
            map.flush()?;
        }

        Ok(())
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        match &self.map {
            MapInner::ReadOnly(map) => map,
            MapInner::Writable(map) => map,
        }
    }

    /// Mutable view; callers must hold a writable handle.
    ///
    /// # Panics
    ///
    /// Panics when the handle is read-only. Structures guard their write
    /// paths with [`Self::is_writable`].
    #[must_use]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        match &mut self.map {
            MapInner::Writable(map) => map,
            MapInner::ReadOnly(_) => unreachable!("write through read-only map"),
        }
    }

    #[must_use]
    pub fn read_u32(&self, offset: usize) -> u32 {
        LE::read_u32(&self.bytes()[offset..offset + 4])
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) {
        LE::write_u32(&mut self.bytes_mut()[offset..offset + 4], value);
    }

    #[must_use]
    pub fn read_u64(&self, offset: usize) -> u64 {
        LE::read_u64(&self.bytes()[offset..offset + 8])
    }

    pub fn write_u64(&mut self, offset: usize, value: u64) {
        LE::write_u64(&mut self.bytes_mut()[offset..offset + 8], value);
    }
}

/// Descriptor of a block file's on-disk format.
#[derive(Copy, Clone, Debug)]
pub struct BlockFormat {
    pub magic: [u8; 4],
    pub revision: u32,
    pub block_size: usize,
    pub initial_blocks: u32,
    /// Ids below this are never allocated (0 is NULL everywhere; some
    /// structures also reserve 1 as a sentinel).
    pub reserved: u32,
}

const OFF_MAGIC: usize = 0;
const OFF_REVISION: usize = 4;
const OFF_SIZE: usize = 8;
const OFF_LENGTH: usize = 12;
const OFF_FREE_LIST: usize = 16;

/// Block allocator over a [`MappedFile`]: a header page, a packed array of
/// fixed-size blocks, and a free list threaded through the first 4 bytes
/// of released blocks.
///
/// Allocation pops the free list when possible, otherwise bumps the
/// high-water mark, doubling the capacity when it is reached. Freeing
/// pushes onto the free list and does not zero the block.
pub struct BlockFile {
    map: MappedFile,
    path: PathBuf,
    format: BlockFormat,
}

impl BlockFile {
    /// Opens or creates a block file.
    pub fn open(path: &Path, format: BlockFormat, writable: bool, create: bool) -> Result<Self> {
        debug_assert!(format.initial_blocks.is_power_of_two());

        let existed = path.exists();
        let min_len = if existed {
            0
        } else {
            HEADER_SIZE as u64 + u64::from(format.initial_blocks) * format.block_size as u64
        };

        let map = MappedFile::open(path, writable, create, min_len)?;

        let mut file = Self {
            map,
            path: path.into(),
            format,
        };

        if existed {
            file.check_header()?;
            // make sure the whole capacity is mapped
            let want = file.file_len(file.size());
            if (file.map.len() as u64) < want {
                if !writable {
                    return Err(Error::Corruption(format!(
                        "{} is shorter than its header says",
                        path.display()
                    )));
                }
                file.map.grow_to(want)?;
            }
        } else {
            file.init_header();
        }

        Ok(file)
    }

    fn file_len(&self, blocks: u32) -> u64 {
        HEADER_SIZE as u64 + u64::from(blocks) * self.format.block_size as u64
    }

    fn init_header(&mut self) {
        let format = self.format;
        self.map.bytes_mut()[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(&format.magic);
        self.map.write_u32(OFF_REVISION, format.revision);
        self.map.write_u32(OFF_SIZE, format.initial_blocks);
        self.map.write_u32(OFF_LENGTH, format.reserved);
        self.map.write_u32(OFF_FREE_LIST, 0);
    }

    fn check_header(&self) -> Result<()> {
        let magic = &self.map.bytes()[OFF_MAGIC..OFF_MAGIC + 4];
        if magic != self.format.magic {
            return Err(Error::Corruption(format!(
                "{} does not look like a {} file",
                self.path.display(),
                String::from_utf8_lossy(&self.format.magic),
            )));
        }

        let revision = self.map.read_u32(OFF_REVISION);
        if revision != self.format.revision {
            return Err(Error::Corruption(format!(
                "{} is revision {revision}, expected {}",
                self.path.display(),
                self.format.revision,
            )));
        }

        let size = self.map.read_u32(OFF_SIZE);
        let length = self.map.read_u32(OFF_LENGTH);
        if !size.is_power_of_two() || length > size {
            return Err(Error::Corruption(format!(
                "{} header is inconsistent (size {size}, length {length})",
                self.path.display(),
            )));
        }

        Ok(())
    }

    /// Capacity in blocks.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.map.read_u32(OFF_SIZE)
    }

    /// High-water mark: ids below this have been handed out at least once.
    #[must_use]
    pub fn length(&self) -> u32 {
        self.map.read_u32(OFF_LENGTH)
    }

    #[must_use]
    pub fn free_list_head(&self) -> u32 {
        self.map.read_u32(OFF_FREE_LIST)
    }

    #[must_use]
    pub fn reserved(&self) -> u32 {
        self.format.reserved
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.map.is_writable()
    }

    fn offset(&self, id: u32) -> usize {
        HEADER_SIZE + id as usize * self.format.block_size
    }

    /// Checks an id refers to an allocated block.
    pub fn check_id(&self, id: u32) -> Result<()> {
        if id < self.format.reserved || id >= self.length() {
            return Err(Error::Corruption(format!(
                "block {id:#x} out of range [{}, {}) in {}",
                self.format.reserved,
                self.length(),
                self.path.display(),
            )));
        }

        Ok(())
    }

    #[must_use]
    pub fn block(&self, id: u32) -> &[u8] {
        let off = self.offset(id);
        &self.map.bytes()[off..off + self.format.block_size]
    }

    #[must_use]
    pub fn block_mut(&mut self, id: u32) -> &mut [u8] {
        let off = self.offset(id);
        let block_size = self.format.block_size;
        &mut self.map.bytes_mut()[off..off + block_size]
    }

    /// Allocates a zeroed block and returns its id.
    pub fn allocate(&mut self) -> Result<u32> {
        let free = self.free_list_head();
        if free != 0 {
            self.check_id(free)?;
            let next = LE::read_u32(&self.block(free)[0..4]);
            self.map.write_u32(OFF_FREE_LIST, next);
            self.block_mut(free).fill(0);

            return Ok(free);
        }

        let length = self.length();
        if length == self.size() {
            self.grow()?;
        }

        self.map.write_u32(OFF_LENGTH, length + 1);

        Ok(length)
    }

    /// Pushes a block onto the free list. The block's contents are left
    /// in place until reuse.
    pub fn free(&mut self, id: u32) -> Result<()> {
        self.check_id(id)?;

        let head = self.free_list_head();
        LE::write_u32(&mut self.block_mut(id)[0..4], head);
        self.map.write_u32(OFF_FREE_LIST, id);

        Ok(())
    }

    /// Doubling is the only permissible growth policy.
    fn grow(&mut self) -> Result<()> {
        let new_size = self.size() * 2;
        self.map.grow_to(self.file_len(new_size))?;
        self.map.write_u32(OFF_SIZE, new_size);

        log::trace!("grew {} to {new_size} blocks", self.path.display());

        Ok(())
    }

    /// Walks the free list; bails at `length()` hops (a longer list means
    /// a cycle).
    pub fn free_list_len(&self) -> Result<u32> {
        let mut n = 0;
        let mut id = self.free_list_head();
        while id != 0 {
            self.check_id(id)?;
            n += 1;
            if n > self.length() {
                return Err(Error::Corruption(format!(
                    "free list cycle in {}",
                    self.path.display()
                )));
            }
            id = LE::read_u32(&self.block(id)[0..4]);
        }

        Ok(n)
    }

    /// Reclaims blocks that are neither reachable (`marked`) nor on the
    /// free list. Returns the number of leaks fixed.
    ///
    /// Callers must have marked every block they can reach before calling
    /// this.
    pub fn reclaim_leaks(&mut self, marked: &mut Vec<bool>) -> Result<u32> {
        marked.resize(self.length() as usize, false);

        let mut id = self.free_list_head();
        let mut hops = 0;
        while id != 0 {
            self.check_id(id)?;
            if let Some(slot) = marked.get_mut(id as usize) {
                *slot = true;
            }
            hops += 1;
            if hops > self.length() {
                return Err(Error::Corruption(format!(
                    "free list cycle in {}",
                    self.path.display()
                )));
            }
            id = LE::read_u32(&self.block(id)[0..4]);
        }

        let mut leaks = 0;
        for id in self.format.reserved..self.length() {
            if !marked.get(id as usize).copied().unwrap_or(false) {
                log::warn!("block {id} leaked in {}, reclaiming", self.path.display());
                self.free(id)?;
                leaks += 1;
            }
        }

        Ok(leaks)
    }

    /// Structure-specific header fields live after the allocator's own,
    /// starting at byte 24 of the header page.
    #[must_use]
    pub fn aux_u64(&self, slot: usize) -> u64 {
        self.map.read_u64(24 + slot * 8)
    }

    pub fn set_aux_u64(&mut self, slot: usize, value: u64) {
        self.map.write_u64(24 + slot * 8, value);
    }

    pub fn sync(&self) -> Result<()> {
        self.map.sync()
    }

    /// Removes the backing file; the handle is consumed.
    pub fn unlink(self) -> Result<()> {
        std::fs::remove_file(&self.path)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    const FORMAT: BlockFormat = BlockFormat {
        magic: *b"JXTT",
        revision: 1,
        block_size: 24,
        initial_blocks: 4,
        reserved: 1,
    };

    #[test]
    fn block_alloc_free_reuse() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("t.blocks");

        let mut bf = BlockFile::open(&path, FORMAT, true, true)?;

        let a = bf.allocate()?;
        let b = bf.allocate()?;
        assert_eq!(1, a);
        assert_eq!(2, b);

        bf.free(a)?;
        assert_eq!(1, bf.free_list_len()?);

        // freed block comes back zeroed
        bf.block_mut(b)[4..8].copy_from_slice(&[1, 2, 3, 4]);
        let c = bf.allocate()?;
        assert_eq!(a, c);
        assert!(bf.block(c).iter().all(|b| *b == 0));

        Ok(())
    }

    #[test]
    fn block_grow_doubles() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("t.blocks");

        let mut bf = BlockFile::open(&path, FORMAT, true, true)?;
        for _ in 0..10 {
            bf.allocate()?;
        }
        assert_eq!(16, bf.size());
        assert_eq!(11, bf.length());

        Ok(())
    }

    #[test]
    fn reopen_checks_magic() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("t.blocks");

        {
            let bf = BlockFile::open(&path, FORMAT, true, true)?;
            bf.sync()?;
        }

        let mut other = FORMAT;
        other.magic = *b"XXXX";
        assert!(matches!(
            BlockFile::open(&path, other, true, true),
            Err(crate::Error::Corruption(_))
        ));

        // and revision
        let mut rev = FORMAT;
        rev.revision = 9;
        assert!(matches!(
            BlockFile::open(&path, rev, false, false),
            Err(crate::Error::Corruption(_))
        ));

        Ok(())
    }

    #[test]
    fn leak_reclaim() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("t.blocks");

        let mut bf = BlockFile::open(&path, FORMAT, true, true)?;
        let a = bf.allocate()?;
        let _b = bf.allocate()?;
        let c = bf.allocate()?;
        bf.free(c)?;

        // pretend only `a` is reachable; b leaks, c is already free
        let mut marked = vec![false; bf.length() as usize];
        marked[a as usize] = true;

        assert_eq!(1, bf.reclaim_leaks(&mut marked)?);
        assert_eq!(2, bf.free_list_len()?);

        Ok(())
    }
}

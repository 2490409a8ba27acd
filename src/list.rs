// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Fixed-width append log with external sorting.
//!
//! Used as an on-disk scratch buffer during imports: quads are appended
//! (buffered), the file is sorted chunk-at-a-time in place, and a k-way
//! merge over the chunk cursors yields a globally sorted, deduplicated
//! stream. The chunk size bounds the memory needed to sort a list of any
//! length; it is a tuning knob, not part of the format.

use crate::{
    lock::{lock_fd, LockMode},
    quad::Quad,
    rid::Rid,
    Error, Result,
};
use byteorder::{ByteOrder, LittleEndian as LE};
use memmap2::Mmap;
use std::{
    cmp::Ordering,
    fs::File,
    io::{Read, Seek, SeekFrom, Write},
    marker::PhantomData,
    path::{Path, PathBuf},
};

/// Rows buffered before hitting the file.
const WRITE_BUFFER_ROWS: usize = 256;

/// In-memory budget for one sort chunk.
const CHUNK_BYTES: usize = 64 << 20;

/// A fixed-width row.
pub trait Record: Copy {
    const WIDTH: usize;

    fn write_to(&self, out: &mut [u8]);
    fn read_from(buf: &[u8]) -> Self;
}

impl Record for Rid {
    const WIDTH: usize = 8;

    fn write_to(&self, out: &mut [u8]) {
        LE::write_u64(out, self.0);
    }

    fn read_from(buf: &[u8]) -> Self {
        Self(LE::read_u64(buf))
    }
}

impl Record for Quad {
    const WIDTH: usize = 32;

    fn write_to(&self, out: &mut [u8]) {
        LE::write_u64(&mut out[0..8], self.graph.0);
        LE::write_u64(&mut out[8..16], self.subject.0);
        LE::write_u64(&mut out[16..24], self.predicate.0);
        LE::write_u64(&mut out[24..32], self.object.0);
    }

    fn read_from(buf: &[u8]) -> Self {
        Self {
            graph: Rid(LE::read_u64(&buf[0..8])),
            subject: Rid(LE::read_u64(&buf[8..16])),
            predicate: Rid(LE::read_u64(&buf[16..24])),
            object: Rid(LE::read_u64(&buf[24..32])),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum SortState {
    Unsorted,
    ChunkSorted,
    Sorted,
}

/// A headerless file of fixed-width rows.
pub struct List<R: Record> {
    file: File,
    path: PathBuf,
    /// rows on disk
    offset: u64,
    buffer: Vec<u8>,
    sort: SortState,
    cmp: Option<fn(&R, &R) -> Ordering>,
    chunk_rows: u64,
    read_pos: u64,
    _marker: PhantomData<R>,
}

impl<R: Record> List<R> {
    pub fn open(path: &Path, writable: bool, create: bool) -> Result<Self> {
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
        if len % R::WIDTH as u64 != 0 {
            return Err(Error::Corruption(format!(
                "{} length {len} is not a multiple of the row width {}",
                path.display(),
                R::WIDTH,
            )));
        }

        Ok(Self {
            file,
            path: path.into(),
            offset: len / R::WIDTH as u64,
            buffer: Vec::with_capacity(WRITE_BUFFER_ROWS * R::WIDTH),
            sort: SortState::Unsorted,
            cmp: None,
            chunk_rows: (CHUNK_BYTES / R::WIDTH) as u64,
            read_pos: 0,
            _marker: PhantomData,
        })
    }

    /// Rows in the list, including any still in the write buffer.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.offset + (self.buffer.len() / R::WIDTH) as u64
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends a row, returning its index.
    pub fn add(&mut self, record: R) -> Result<u64> {
        if self.buffer.len() >= WRITE_BUFFER_ROWS * R::WIDTH {
            self.flush()?;
        }

        let index = self.len();
        let start = self.buffer.len();
        self.buffer.resize(start + R::WIDTH, 0);
        record.write_to(&mut self.buffer[start..]);
        self.sort = SortState::Unsorted;

        Ok(index)
    }

    /// Pushes the write buffer out to the file.
    pub fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        self.file.seek(SeekFrom::Start(self.offset * R::WIDTH as u64))?;
        self.file.write_all(&self.buffer)?;
        self.offset += (self.buffer.len() / R::WIDTH) as u64;
        self.buffer.clear();

        Ok(())
    }

    /// Random-access read.
    pub fn get(&mut self, index: u64) -> Result<R> {
        if index >= self.offset {
            // still in the write buffer
            let start = usize::try_from((index - self.offset) * R::WIDTH as u64)
                .map_err(|_| Error::Corruption("list index overflow".into()))?;
            if start + R::WIDTH > self.buffer.len() {
                return Err(Error::Corruption(format!(
                    "read past end of {} ({index} >= {})",
                    self.path.display(),
                    self.len(),
                )));
            }

            return Ok(R::read_from(&self.buffer[start..start + R::WIDTH]));
        }

        let mut buf = vec![0u8; R::WIDTH];
        self.file.seek(SeekFrom::Start(index * R::WIDTH as u64))?;
        self.file.read_exact(&mut buf)?;

        Ok(R::read_from(&buf))
    }

    /// Restarts sequential reading.
    pub fn rewind(&mut self) {
        self.read_pos = 0;
    }

    /// Next row in file order, or `None` at the end. Ignores the write
    /// buffer; flush first.
    pub fn next_value(&mut self) -> Result<Option<R>> {
        if self.read_pos >= self.offset {
            return Ok(None);
        }

        let mut buf = vec![0u8; R::WIDTH];
        self.file
            .seek(SeekFrom::Start(self.read_pos * R::WIDTH as u64))?;
        self.file.read_exact(&mut buf)?;
        self.read_pos += 1;

        Ok(Some(R::read_from(&buf)))
    }

    /// Sorts the whole list in one chunk (needs the whole list in
    /// memory).
    pub fn sort(&mut self, cmp: fn(&R, &R) -> Ordering) -> Result<()> {
        self.flush()?;
        self.sort_range(0, self.offset, cmp)?;
        self.cmp = Some(cmp);
        self.sort = SortState::Sorted;

        Ok(())
    }

    /// Sorts the list chunk-at-a-time in place; reading back sorted order
    /// is then [`Self::sorted_uniq`]'s job.
    pub fn sort_chunked(&mut self, cmp: fn(&R, &R) -> Ordering) -> Result<()> {
        self.flush()?;

        let mut start = 0;
        while start < self.offset {
            let rows = self.chunk_rows.min(self.offset - start);
            self.sort_range(start, rows, cmp)?;
            start += rows;
        }

        self.cmp = Some(cmp);
        self.sort = if self.offset <= self.chunk_rows {
            SortState::Sorted
        } else {
            SortState::ChunkSorted
        };

        Ok(())
    }

    fn sort_range(&mut self, start: u64, rows: u64, cmp: fn(&R, &R) -> Ordering) -> Result<()> {
        let rows_usize = usize::try_from(rows)
            .map_err(|_| Error::Corruption("sort chunk overflow".into()))?;

        let mut records = Vec::with_capacity(rows_usize);
        let mut buf = vec![0u8; rows_usize * R::WIDTH];
        self.file.seek(SeekFrom::Start(start * R::WIDTH as u64))?;
        self.file.read_exact(&mut buf)?;

        for chunk in buf.chunks_exact(R::WIDTH) {
            records.push(R::read_from(chunk));
        }
        records.sort_unstable_by(cmp);

        for (record, chunk) in records.iter().zip(buf.chunks_exact_mut(R::WIDTH)) {
            record.write_to(chunk);
        }
        self.file.seek(SeekFrom::Start(start * R::WIDTH as u64))?;
        self.file.write_all(&buf)?;

        Ok(())
    }

    /// Merged, deduplicated stream over a (chunk-)sorted list.
    ///
    /// Consecutive byte-identical rows collapse to one, so the stream
    /// length is the number of distinct rows.
    pub fn sorted_uniq(&mut self) -> Result<SortedUniqIter<R>> {
        if self.sort == SortState::Unsorted {
            return Err(Error::Protocol(format!(
                "sorted read of unsorted list {}",
                self.path.display()
            )));
        }

        let Some(cmp) = self.cmp else {
            return Err(Error::Protocol("list comparator missing".into()));
        };

        self.flush()?;

        // SAFETY: we hold the exclusive lock; the map is dropped with the
        // iterator before any further mutation
        let map = if self.offset == 0 {
            None
        } else {
            Some(unsafe { Mmap::map(&self.file)? })
        };

        let mut cursors = vec![];
        let mut start = 0;
        while start < self.offset {
            let rows = self.chunk_rows.min(self.offset - start);
            #[allow(clippy::cast_possible_truncation)]
            cursors.push((
                start as usize * R::WIDTH,
                (start + rows) as usize * R::WIDTH,
            ));
            start += rows;
        }

        Ok(SortedUniqIter {
            map,
            cursors,
            last: None,
            cmp,
            _marker: PhantomData,
        })
    }

    /// Empties the list.
    pub fn truncate(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.offset = 0;
        self.buffer.clear();
        self.read_pos = 0;
        self.sort = SortState::Unsorted;

        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.flush()?;
        self.file.sync_all()?;

        Ok(())
    }

    pub fn unlink(self) -> Result<()> {
        std::fs::remove_file(&self.path)?;

        Ok(())
    }

    #[cfg(test)]
    fn set_chunk_rows(&mut self, rows: u64) {
        self.chunk_rows = rows;
    }
}

/// K-way merge over the sorted chunks of a list.
pub struct SortedUniqIter<R: Record> {
    map: Option<Mmap>,
    /// byte ranges still pending per chunk
    cursors: Vec<(usize, usize)>,
    last: Option<Vec<u8>>,
    cmp: fn(&R, &R) -> Ordering,
    _marker: PhantomData<R>,
}

impl<R: Record> Iterator for SortedUniqIter<R> {
    type Item = R;

    fn next(&mut self) -> Option<Self::Item> {
        let map = self.map.as_ref()?;

        loop {
            let mut best: Option<usize> = None;

            for (i, &(pos, end)) in self.cursors.iter().enumerate() {
                if pos >= end {
                    continue;
                }
                match best {
                    None => best = Some(i),
                    Some(b) => {
                        let head = R::read_from(&map[pos..pos + R::WIDTH]);
                        let best_head =
                            R::read_from(&map[self.cursors[b].0..self.cursors[b].0 + R::WIDTH]);
                        if (self.cmp)(&head, &best_head) == Ordering::Less {
                            best = Some(i);
                        }
                    }
                }
            }

            let best = best?;
            let pos = self.cursors[best].0;
            let raw = &map[pos..pos + R::WIDTH];
            self.cursors[best].0 += R::WIDTH;

            if self.last.as_deref() == Some(raw) {
                continue;
            }

            self.last = Some(raw.to_vec());

            return Some(R::read_from(raw));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;
    use test_log::test;

    fn rid_cmp(a: &Rid, b: &Rid) -> Ordering {
        a.cmp(b)
    }

    #[test]
    fn append_flush_read() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut list: List<Rid> = List::open(&dir.path().join("t.list"), true, true)?;

        for i in 0..1000u64 {
            assert_eq!(i, list.add(Rid(i * 3))?);
        }
        assert_eq!(1000, list.len());

        assert_eq!(Rid(999 * 3), list.get(999)?);
        list.flush()?;
        assert_eq!(Rid(500 * 3), list.get(500)?);

        list.rewind();
        assert_eq!(Some(Rid(0)), list.next_value()?);
        assert_eq!(Some(Rid(3)), list.next_value()?);

        Ok(())
    }

    #[test]
    fn sorted_uniq_single_chunk() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut list: List<Rid> = List::open(&dir.path().join("t.list"), true, true)?;

        for v in [5u64, 3, 5, 1, 3, 3, 9] {
            list.add(Rid(v))?;
        }
        list.sort_chunked(rid_cmp)?;

        let values: Vec<u64> = list.sorted_uniq()?.map(|r| r.0).collect();
        assert_eq!(vec![1, 3, 5, 9], values);

        Ok(())
    }

    #[test]
    fn sorted_uniq_across_chunks() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut list: List<Rid> = List::open(&dir.path().join("t.list"), true, true)?;
        list.set_chunk_rows(16);

        let mut rng = rand::rng();
        let mut expected: Vec<u64> = (0..200).map(|_| rng.random_range(0..64)).collect();
        for &v in &expected {
            list.add(Rid(v))?;
        }

        list.sort_chunked(rid_cmp)?;

        expected.sort_unstable();
        expected.dedup();

        let values: Vec<u64> = list.sorted_uniq()?.map(|r| r.0).collect();
        assert_eq!(expected, values);

        // strictly increasing
        assert!(values.windows(2).all(|w| w[0] < w[1]));

        Ok(())
    }

    #[test]
    fn sorted_read_of_unsorted_list_is_an_error() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut list: List<Rid> = List::open(&dir.path().join("t.list"), true, true)?;
        list.add(Rid(1))?;

        assert!(matches!(
            list.sorted_uniq(),
            Err(Error::Protocol(_))
        ));

        Ok(())
    }

    #[test]
    fn quad_rows_roundtrip() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut list: List<Quad> = List::open(&dir.path().join("q.list"), true, true)?;

        let q = Quad::new(Rid(1), Rid(2), Rid(3), Rid(4));
        list.add(q)?;
        list.flush()?;

        list.rewind();
        assert_eq!(Some(q), list.next_value()?);

        // reject files whose length is not a row multiple
        drop(list);
        let path = dir.path().join("q.list");
        let mut f = File::options().append(true).open(&path)?;
        f.write_all(&[0u8; 7])?;
        drop(f);

        assert!(matches!(
            List::<Quad>::open(&path, true, false),
            Err(Error::Corruption(_))
        ));

        Ok(())
    }

    #[test]
    fn truncate_resets() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut list: List<Rid> = List::open(&dir.path().join("t.list"), true, true)?;

        for i in 0..10u64 {
            list.add(Rid(i))?;
        }
        list.flush()?;
        list.truncate()?;

        assert_eq!(0, list.len());
        assert_eq!(None, list.next_value()?);

        Ok(())
    }
}

// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Chain table: an arena of 24-byte rows forming singly-linked chains.
//!
//! Every predicate tree leaf owns exactly one chain in the segment's
//! shared table. A row holds a `(graph, value)` RID pair and the id of
//! the next row; 0 terminates. Chains are prepend-only, so `add_pair`
//! returns a new head which the caller must store back into the owning
//! leaf.

use crate::{
    mapped::{BlockFile, BlockFormat},
    rid::{Rid, RID_NULL},
    Error, Result,
};
use byteorder::{ByteOrder, LittleEndian as LE};
use rustc_hash::FxHashSet;
use std::path::Path;

/// Row id within a chain table; 0 is the end-of-chain marker.
pub type RowId = u32;

pub const MAGIC: [u8; 4] = *b"JXT0";
const REVISION: u32 = 1;
const ROW_SIZE: usize = 24;
const INITIAL_ROWS: u32 = 1024;

const FORMAT: BlockFormat = BlockFormat {
    magic: MAGIC,
    revision: REVISION,
    block_size: ROW_SIZE,
    initial_blocks: INITIAL_ROWS,
    reserved: 1,
};

const AUX_TAG: usize = 0;

/// The chain table backing all predicate trees of one segment.
pub struct Ptable {
    rows: BlockFile,
}

impl Ptable {
    pub fn open(path: &Path, writable: bool, create: bool) -> Result<Self> {
        let mut rows = BlockFile::open(path, FORMAT, writable, create)?;

        if writable && rows.aux_u64(AUX_TAG) == 0 {
            rows.set_aux_u64(AUX_TAG, tag_for(path));
        }

        Ok(Self { rows })
    }

    /// Pairing tag checked by ptrees opened against this table.
    #[must_use]
    pub fn tag(&self) -> u64 {
        self.rows.aux_u64(AUX_TAG)
    }

    /// Rows handed out so far (including freed ones).
    #[must_use]
    pub fn length(&self) -> u32 {
        self.rows.length()
    }

    pub fn free_length(&self) -> Result<u32> {
        self.rows.free_list_len()
    }

    /// Allocates an empty row.
    pub fn new_row(&mut self) -> Result<RowId> {
        self.rows.allocate()
    }

    pub fn free_row(&mut self, row: RowId) -> Result<()> {
        self.rows.free(row)
    }

    fn write_row(&mut self, row: RowId, cont: RowId, pair: [Rid; 2]) {
        let block = self.rows.block_mut(row);
        LE::write_u32(&mut block[0..4], cont);
        LE::write_u64(&mut block[8..16], pair[0].0);
        LE::write_u64(&mut block[16..24], pair[1].0);
    }

    /// Prepends a pair to the chain ending at `tail` (0 starts a fresh
    /// chain) and returns the new head.
    pub fn add_pair(&mut self, tail: RowId, pair: [Rid; 2]) -> Result<RowId> {
        if tail != 0 {
            self.rows.check_id(tail)?;
        }

        let row = self.rows.allocate()?;
        self.write_row(row, tail, pair);

        Ok(row)
    }

    pub fn get_row(&self, row: RowId) -> Result<[Rid; 2]> {
        self.rows.check_id(row)?;
        let block = self.rows.block(row);

        Ok([
            Rid(LE::read_u64(&block[8..16])),
            Rid(LE::read_u64(&block[16..24])),
        ])
    }

    /// The next row in the chain, or 0 at the end.
    pub fn next(&self, row: RowId) -> Result<RowId> {
        self.rows.check_id(row)?;

        Ok(LE::read_u32(&self.rows.block(row)[0..4]))
    }

    /// True if any row in the chain matches exactly.
    pub fn pair_exists(&self, head: RowId, pair: [Rid; 2]) -> Result<bool> {
        let mut row = head;
        let mut hops = 0;

        while row != 0 {
            if self.get_row(row)? == pair {
                return Ok(true);
            }
            hops += 1;
            if hops > self.length() {
                return Err(self.cycle());
            }
            row = self.next(row)?;
        }

        Ok(false)
    }

    /// Walks the whole chain onto the free list.
    pub fn remove_chain(&mut self, head: RowId) -> Result<()> {
        let mut row = head;
        let mut hops = 0;

        while row != 0 {
            let next = self.next(row)?;
            self.free_row(row)?;
            hops += 1;
            if hops > self.length() {
                return Err(self.cycle());
            }
            row = next;
        }

        Ok(())
    }

    /// Removes every row matching `pattern` ([`RID_NULL`] is a wildcard in
    /// either slot; `(NULL, NULL)` removes everything) and returns the new
    /// head. Removed rows are counted into `removed`.
    ///
    /// When the graph slot of the pattern is a wildcard, the graph of each
    /// removed row is recorded in `models` so callers can flag the
    /// affected graph chains as supersets.
    pub fn remove_pair(
        &mut self,
        head: RowId,
        pattern: [Rid; 2],
        removed: &mut u32,
        mut models: Option<&mut FxHashSet<Rid>>,
    ) -> Result<RowId> {
        if head == 0 {
            return Err(Error::Corruption("tried to remove from chain 0".into()));
        }

        if pattern == [RID_NULL, RID_NULL] {
            let mut row = head;
            let mut hops = 0;
            while row != 0 {
                let data = self.get_row(row)?;
                if let Some(models) = models.as_deref_mut() {
                    models.insert(data[0]);
                }
                let next = self.next(row)?;
                self.free_row(row)?;
                *removed += 1;
                hops += 1;
                if hops > self.length() {
                    return Err(self.cycle());
                }
                row = next;
            }

            return Ok(0);
        }

        let graph_wild = pattern[0] == RID_NULL;

        let mut new_head = head;
        let mut prev: RowId = 0;
        let mut row = head;
        let mut hops = 0;

        while row != 0 {
            let next = self.next(row)?;
            let data = self.get_row(row)?;

            let hit = (pattern[0] == RID_NULL || data[0] == pattern[0])
                && (pattern[1] == RID_NULL || data[1] == pattern[1]);

            if hit {
                if graph_wild {
                    if let Some(models) = models.as_deref_mut() {
                        models.insert(data[0]);
                    }
                }
                if prev == 0 {
                    new_head = next;
                } else {
                    let block = self.rows.block_mut(prev);
                    LE::write_u32(&mut block[0..4], next);
                }
                self.free_row(row)?;
                *removed += 1;
            } else {
                prev = row;
            }

            hops += 1;
            if hops > self.length() {
                return Err(self.cycle());
            }
            row = next;
        }

        Ok(new_head)
    }

    /// Chain length in rows; counting stops (with an error log) once
    /// `max` is exceeded, which callers use to spot cycles.
    pub fn chain_length(&self, head: RowId, max: u32) -> Result<u32> {
        if head == 0 {
            return Ok(0);
        }

        let mut length = 0;
        let mut row = head;

        while row != 0 {
            length += 1;
            if max != 0 && length > max {
                log::error!(
                    "chain length bound ({max}) exceeded in {}",
                    self.rows.path().display()
                );

                break;
            }
            row = self.next(row)?;
        }

        Ok(length)
    }

    /// Lazy forward walk of one chain.
    #[must_use]
    pub fn iter(&self, head: RowId) -> ChainIter<'_> {
        ChainIter {
            table: self,
            row: head,
            hops: 0,
        }
    }

    fn cycle(&self) -> Error {
        Error::Corruption(format!("chain cycle in {}", self.rows.path().display()))
    }

    pub fn sync(&self) -> Result<()> {
        self.rows.sync()
    }

    pub fn unlink(self) -> Result<()> {
        self.rows.unlink()
    }

    /// Starts a reachability mark for the leak check; chains are marked
    /// with [`Self::mark_chain`], then [`Self::check_leaks`] reports rows
    /// in no chain and not on the free list.
    #[must_use]
    pub fn start_check(&self) -> ConsistencyCheck {
        ConsistencyCheck {
            owner: vec![0; self.length() as usize],
        }
    }

    /// Marks the chain at `head` as owned by `src` and returns its length.
    ///
    /// Fails when a row turns out to be shared between chains (or appears
    /// twice, i.e. a cycle).
    pub fn mark_chain(
        &self,
        check: &mut ConsistencyCheck,
        src: u32,
        head: RowId,
    ) -> Result<u32> {
        debug_assert!(src != 0);

        let mut length = 0;
        let mut row = head;

        while row != 0 {
            self.rows.check_id(row)?;
            let slot = &mut check.owner[row as usize];
            if *slot != 0 {
                return Err(Error::Corruption(format!(
                    "row {row:#x} reachable from {src:#x} and {:#x} in {}",
                    *slot,
                    self.rows.path().display(),
                )));
            }
            *slot = src;
            length += 1;
            row = self.next(row)?;
        }

        Ok(length)
    }

    /// Rows in no marked chain and not on the free list.
    pub fn check_leaks(&self, check: &mut ConsistencyCheck) -> Result<u32> {
        let mut row = self.rows.free_list_head();
        let mut hops = 0;
        while row != 0 {
            self.rows.check_id(row)?;
            if check.owner[row as usize] != 0 {
                return Err(Error::Corruption(format!(
                    "row {row:#x} is both free and owned by {:#x}",
                    check.owner[row as usize]
                )));
            }
            check.owner[row as usize] = u32::MAX;
            hops += 1;
            if hops > self.length() {
                return Err(self.cycle());
            }
            row = self.next(row)?;
        }

        let leaked = check.owner[self.rows.reserved() as usize..]
            .iter()
            .filter(|o| **o == 0)
            .count();

        #[allow(clippy::cast_possible_truncation)]
        Ok(leaked as u32)
    }
}

/// Ownership marks used by the ptable leak check.
pub struct ConsistencyCheck {
    owner: Vec<u32>,
}

pub struct ChainIter<'a> {
    table: &'a Ptable,
    row: RowId,
    hops: u32,
}

impl Iterator for ChainIter<'_> {
    type Item = Result<(RowId, [Rid; 2])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.row == 0 {
            return None;
        }

        self.hops += 1;
        if self.hops > self.table.length() {
            return Some(Err(self.table.cycle()));
        }

        let row = self.row;
        let pair = fail_iter!(self.table.get_row(row));
        self.row = fail_iter!(self.table.next(row));

        Some(Ok((row, pair)))
    }
}

fn tag_for(path: &Path) -> u64 {
    use xxhash_rust::xxh3::xxh3_64;

    let parent = path.parent().unwrap_or(path);
    let tag = xxh3_64(parent.to_string_lossy().as_bytes());

    // 0 means "untagged"
    if tag == 0 {
        1
    } else {
        tag
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn pair(a: u64, b: u64) -> [Rid; 2] {
        [Rid(a), Rid(b)]
    }

    fn open(dir: &Path) -> crate::Result<Ptable> {
        Ptable::open(&dir.join("pairs.ptable"), true, true)
    }

    #[test]
    fn chain_prepend_and_walk() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut pt = open(dir.path())?;

        let mut head = 0;
        for i in 0..5 {
            head = pt.add_pair(head, pair(1, i))?;
        }

        assert_eq!(5, pt.chain_length(head, 0)?);

        // prepend order: last added comes out first
        let rows = pt.iter(head).collect::<crate::Result<Vec<_>>>()?;
        assert_eq!(pair(1, 4), rows[0].1);
        assert_eq!(pair(1, 0), rows[4].1);

        assert!(pt.pair_exists(head, pair(1, 2))?);
        assert!(!pt.pair_exists(head, pair(2, 2))?);

        Ok(())
    }

    #[test]
    fn remove_pair_exact() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut pt = open(dir.path())?;

        let mut head = 0;
        head = pt.add_pair(head, pair(1, 10))?;
        head = pt.add_pair(head, pair(1, 11))?;
        head = pt.add_pair(head, pair(2, 10))?;

        let free_before = pt.free_length()?;

        let mut removed = 0;
        let head = pt.remove_pair(head, pair(1, 10), &mut removed, None)?;
        assert_eq!(1, removed);
        assert_eq!(2, pt.chain_length(head, 0)?);
        assert_eq!(free_before + 1, pt.free_length()?);
        assert!(!pt.pair_exists(head, pair(1, 10))?);

        Ok(())
    }

    #[test]
    fn remove_pair_wildcard_records_models() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut pt = open(dir.path())?;

        let mut head = 0;
        head = pt.add_pair(head, pair(1, 10))?;
        head = pt.add_pair(head, pair(2, 10))?;
        head = pt.add_pair(head, pair(3, 11))?;

        let mut removed = 0;
        let mut models = FxHashSet::default();
        let head = pt.remove_pair(
            head,
            [RID_NULL, Rid(10)],
            &mut removed,
            Some(&mut models),
        )?;

        assert_eq!(2, removed);
        assert_eq!(1, pt.chain_length(head, 0)?);
        assert!(models.contains(&Rid(1)));
        assert!(models.contains(&Rid(2)));
        assert!(!models.contains(&Rid(3)));

        Ok(())
    }

    #[test]
    fn remove_all_frees_whole_chain() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut pt = open(dir.path())?;

        let free_before = pt.free_length()?;
        let mut head = 0;
        for g in 0..4 {
            head = pt.add_pair(head, pair(g, 100 + g))?;
        }

        let mut removed = 0;
        let mut models = FxHashSet::default();
        let head = pt.remove_pair(
            head,
            [RID_NULL, RID_NULL],
            &mut removed,
            Some(&mut models),
        )?;

        assert_eq!(0, head);
        assert_eq!(4, removed);
        assert_eq!(4, models.len());
        assert_eq!(free_before + 4, pt.free_length()?);

        Ok(())
    }

    #[test]
    fn add_then_remove_restores_free_list() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut pt = open(dir.path())?;

        // seed some churn so the free list is non-trivial
        let mut head = 0;
        for i in 0..3 {
            head = pt.add_pair(head, pair(9, i))?;
        }
        let free_before = pt.free_length()?;

        let head2 = pt.add_pair(head, pair(5, 5))?;
        let mut removed = 0;
        let back = pt.remove_pair(head2, pair(5, 5), &mut removed, None)?;

        assert_eq!(head, back);
        assert_eq!(free_before + 1, pt.free_length()?);

        Ok(())
    }

    #[test]
    fn leak_check_clean_table() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut pt = open(dir.path())?;

        let mut head_a = 0;
        head_a = pt.add_pair(head_a, pair(1, 1))?;
        head_a = pt.add_pair(head_a, pair(1, 2))?;
        let mut head_b = 0;
        head_b = pt.add_pair(head_b, pair(2, 1))?;

        let mut check = pt.start_check();
        assert_eq!(2, pt.mark_chain(&mut check, 1, head_a)?);
        assert_eq!(1, pt.mark_chain(&mut check, 2, head_b)?);
        assert_eq!(0, pt.check_leaks(&mut check)?);

        Ok(())
    }

    #[test]
    fn leak_check_detects_orphan() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut pt = open(dir.path())?;

        let head = pt.add_pair(0, pair(1, 1))?;
        let _orphan = pt.add_pair(0, pair(2, 2))?;

        let mut check = pt.start_check();
        pt.mark_chain(&mut check, 1, head)?;
        assert_eq!(1, pt.check_leaks(&mut check)?);

        Ok(())
    }

    #[test]
    fn reopen_keeps_rows() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("pairs.ptable");

        let head = {
            let mut pt = Ptable::open(&path, true, true)?;
            let head = pt.add_pair(0, pair(7, 8))?;
            pt.sync()?;
            head
        };

        let pt = Ptable::open(&path, false, false)?;
        assert_eq!([Rid(7), Rid(8)], pt.get_row(head)?);

        Ok(())
    }
}

// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Predicate tree: a radix trie over 64-bit keys.
//!
//! Each predicate gets two of these per segment, one keyed by subject and
//! one by object. Interior nodes have 4 branches (2 key bits per level);
//! leaves carry the key, the head of a chain in the shared [`Ptable`] and
//! the chain's length. Node ids and leaf ids share one record arena: the
//! MSB distinguishes them, record 0 is reserved as NULL in both spaces
//! and record 1 is the root node.
//!
//! The tree only stores a leaf where keys diverge: inserting a key whose
//! prefix is shared with an existing leaf pushes interior nodes down the
//! shared prefix until the two keys separate. Removal collapses empty
//! paths; a node left with a single leaf keeps it at its depth (leaves
//! are never promoted upward).

use crate::{
    file::HEADER_SIZE,
    mapped::MappedFile,
    ptable::{ConsistencyCheck, Ptable, RowId},
    rid::{Rid, RID_NULL},
    Error, Result,
};
use rustc_hash::FxHashSet;
use std::path::{Path, PathBuf};

pub const MAGIC: [u8; 4] = *b"JXP1";
const REVISION: u32 = 1;

const REC_SIZE: usize = 16;

/// Records added to a region per grow.
const SIZE_INC: u32 = 4096;

const NODE_TAG: u32 = 0x8000_0000;
const NODE_MASK: u32 = 0x7fff_ffff;

const NULL_NODE: u32 = NODE_TAG;
const ROOT_NODE: u32 = NODE_TAG | 1;

const BRANCHES: usize = 4;
const BRANCH_BITS: u32 = 2;
const LEVELS: usize = (64 / BRANCH_BITS) as usize;

// header layout
const OFF_MAGIC: usize = 0;
const OFF_REVISION: usize = 4;
const OFF_NODE_BASE: usize = 8;
const OFF_NODE_SIZE: usize = 12;
const OFF_NODE_COUNT: usize = 16;
const OFF_LEAF_BASE: usize = 20;
const OFF_LEAF_SIZE: usize = 24;
const OFF_LEAF_COUNT: usize = 28;
const OFF_ALLOC: usize = 32;
const OFF_COUNT: usize = 40;
const OFF_NODE_FREE: usize = 48;
const OFF_LEAF_FREE: usize = 52;
const OFF_TABLE_TAG: usize = 56;

fn is_node(id: u32) -> bool {
    id & NODE_TAG != 0
}

fn is_leaf(id: u32) -> bool {
    !is_node(id)
}

fn branch_of(pk: u64, level: usize) -> usize {
    #[allow(clippy::cast_possible_truncation)]
    {
        ((pk >> ((LEVELS - 1 - level) as u32 * BRANCH_BITS)) & (BRANCHES as u64 - 1)) as usize
    }
}

fn rec_off(rec: u32) -> usize {
    HEADER_SIZE + rec as usize * REC_SIZE
}

/// One direction of a predicate index.
pub struct Ptree {
    map: MappedFile,
    path: PathBuf,
}

impl Ptree {
    /// Opens a predicate tree, pairing it with the chain table identified
    /// by `table_tag`. A tree recorded against a different table refuses
    /// to open.
    pub fn open(path: &Path, writable: bool, create: bool, table_tag: u64) -> Result<Self> {
        let existed = path.exists();

        let initial = u64::from(SIZE_INC) * 2 * REC_SIZE as u64 + HEADER_SIZE as u64;
        let map = MappedFile::open(path, writable, create, if existed { 0 } else { initial })?;

        let mut tree = Self {
            map,
            path: path.into(),
        };

        if existed {
            tree.check_header(table_tag)?;
        } else {
            tree.init_header(table_tag);
        }

        Ok(tree)
    }

    fn init_header(&mut self, table_tag: u64) {
        self.map.bytes_mut()[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(&MAGIC);
        self.map.write_u32(OFF_REVISION, REVISION);

        // records [0, SIZE_INC) are the first node region (0 = null
        // record, 1 = root), [SIZE_INC, 2 * SIZE_INC) the first leaf
        // region with its first record reserved so leaf id 0 stays NULL
        self.map.write_u32(OFF_NODE_BASE, 2);
        self.map.write_u32(OFF_NODE_SIZE, SIZE_INC);
        self.map.write_u32(OFF_NODE_COUNT, 2);
        self.map.write_u32(OFF_LEAF_BASE, SIZE_INC + 1);
        self.map.write_u32(OFF_LEAF_SIZE, SIZE_INC * 2);
        self.map.write_u32(OFF_LEAF_COUNT, 2);
        self.map.write_u64(OFF_ALLOC, u64::from(SIZE_INC) * 2);
        self.map.write_u64(OFF_COUNT, 0);
        self.map.write_u32(OFF_NODE_FREE, NULL_NODE);
        self.map.write_u32(OFF_LEAF_FREE, 0);
        self.map.write_u64(OFF_TABLE_TAG, table_tag);

        for b in 0..BRANCHES {
            self.set_branch(ROOT_NODE, b, NULL_NODE);
        }
    }

    fn check_header(&mut self, table_tag: u64) -> Result<()> {
        if self.map.len() < HEADER_SIZE {
            return Err(Error::Corruption(format!(
                "{} is too short to be a ptree",
                self.path.display()
            )));
        }

        if self.map.bytes()[OFF_MAGIC..OFF_MAGIC + 4] != MAGIC {
            return Err(Error::Corruption(format!(
                "{} does not look like a ptree file",
                self.path.display()
            )));
        }

        let revision = self.map.read_u32(OFF_REVISION);
        if revision != REVISION {
            return Err(Error::Corruption(format!(
                "{} is revision {revision}, expected {REVISION}",
                self.path.display()
            )));
        }

        let stored = self.map.read_u64(OFF_TABLE_TAG);
        if stored != 0 && stored != table_tag {
            return Err(Error::Corruption(format!(
                "{} references a different chain table",
                self.path.display()
            )));
        }
        if stored == 0 && self.map.is_writable() {
            self.map.write_u64(OFF_TABLE_TAG, table_tag);
        }

        Ok(())
    }

    /// Rows stored in this tree.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.map.read_u64(OFF_COUNT)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    // -- record accessors ----------------------------------------------

    fn node_check(&self, id: u32) -> Result<u32> {
        if !is_node(id) {
            return Err(Error::Corruption(format!(
                "id {id:#x} is not a node in {}",
                self.path.display()
            )));
        }
        let offset = id & NODE_MASK;
        if offset == 0 || u64::from(offset) >= self.alloc() {
            return Err(Error::Corruption(format!(
                "node {offset:#x} out of range in {}",
                self.path.display()
            )));
        }

        Ok(offset)
    }

    fn leaf_check(&self, id: u32) -> Result<u32> {
        if !is_leaf(id) || id == 0 || u64::from(id) >= self.alloc() {
            return Err(Error::Corruption(format!(
                "leaf {id:#x} out of range in {}",
                self.path.display()
            )));
        }

        Ok(id)
    }

    fn branch(&self, node: u32, branch: usize) -> Result<u32> {
        let offset = self.node_check(node)?;

        Ok(self.map.read_u32(rec_off(offset) + branch * 4))
    }

    fn set_branch(&mut self, node: u32, branch: usize, value: u32) {
        let offset = node & NODE_MASK;
        self.map.write_u32(rec_off(offset) + branch * 4, value);
    }

    fn leaf_pk(&self, leaf: u32) -> u64 {
        self.map.read_u64(rec_off(leaf))
    }

    fn leaf_chain(&self, leaf: u32) -> RowId {
        self.map.read_u32(rec_off(leaf) + 8)
    }

    fn leaf_length(&self, leaf: u32) -> u32 {
        self.map.read_u32(rec_off(leaf) + 12)
    }

    fn set_leaf(&mut self, leaf: u32, pk: u64, chain: RowId, length: u32) {
        self.map.write_u64(rec_off(leaf), pk);
        self.map.write_u32(rec_off(leaf) + 8, chain);
        self.map.write_u32(rec_off(leaf) + 12, length);
    }

    fn alloc(&self) -> u64 {
        self.map.read_u64(OFF_ALLOC)
    }

    fn add_count(&mut self, delta: i64) {
        #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
        let count = (self.count() as i64 + delta).max(0) as u64;
        self.map.write_u64(OFF_COUNT, count);
    }

    // -- allocation ----------------------------------------------------

    fn grow_region(&mut self, base_off: usize, size_off: usize) -> Result<()> {
        let alloc = self.alloc();
        self.map
            .grow_to(HEADER_SIZE as u64 + (alloc + u64::from(SIZE_INC)) * REC_SIZE as u64)?;

        #[allow(clippy::cast_possible_truncation)]
        {
            self.map.write_u32(base_off, alloc as u32);
            self.map.write_u32(size_off, alloc as u32 + SIZE_INC);
        }
        self.map.write_u64(OFF_ALLOC, alloc + u64::from(SIZE_INC));

        Ok(())
    }

    fn new_node(&mut self) -> Result<u32> {
        let free = self.map.read_u32(OFF_NODE_FREE);
        if free != NULL_NODE {
            self.node_check(free)?;
            let next = self.branch(free, 0)?;
            self.map.write_u32(OFF_NODE_FREE, next);
            for b in 0..BRANCHES {
                self.set_branch(free, b, NULL_NODE);
            }

            return Ok(free);
        }

        if self.map.read_u32(OFF_NODE_BASE) == self.map.read_u32(OFF_NODE_SIZE) {
            self.grow_region(OFF_NODE_BASE, OFF_NODE_SIZE)?;
        }

        let base = self.map.read_u32(OFF_NODE_BASE);
        self.map.write_u32(OFF_NODE_BASE, base + 1);
        let count = self.map.read_u32(OFF_NODE_COUNT);
        self.map.write_u32(OFF_NODE_COUNT, count + 1);

        let node = base | NODE_TAG;
        for b in 0..BRANCHES {
            self.set_branch(node, b, NULL_NODE);
        }

        Ok(node)
    }

    fn free_node(&mut self, node: u32) -> Result<()> {
        if node == ROOT_NODE {
            return Err(Error::Corruption("tried to free the root node".into()));
        }
        self.node_check(node)?;

        let head = self.map.read_u32(OFF_NODE_FREE);
        self.set_branch(node, 0, head);
        self.map.write_u32(OFF_NODE_FREE, node);
        let count = self.map.read_u32(OFF_NODE_COUNT);
        self.map.write_u32(OFF_NODE_COUNT, count.saturating_sub(1));

        Ok(())
    }

    fn new_leaf(&mut self) -> Result<u32> {
        let free = self.map.read_u32(OFF_LEAF_FREE);
        if free != 0 {
            self.leaf_check(free)?;
            let next = self.leaf_chain(free);
            self.map.write_u32(OFF_LEAF_FREE, next);
            self.set_leaf(free, RID_NULL.0, 0, 0);

            return Ok(free);
        }

        if self.map.read_u32(OFF_LEAF_BASE) == self.map.read_u32(OFF_LEAF_SIZE) {
            self.grow_region(OFF_LEAF_BASE, OFF_LEAF_SIZE)?;
            // keep leaf id 0 impossible: the region start is a plain
            // record index, never 0 after the initial regions
        }

        let base = self.map.read_u32(OFF_LEAF_BASE);
        self.map.write_u32(OFF_LEAF_BASE, base + 1);
        let count = self.map.read_u32(OFF_LEAF_COUNT);
        self.map.write_u32(OFF_LEAF_COUNT, count + 1);

        self.set_leaf(base, RID_NULL.0, 0, 0);

        Ok(base)
    }

    fn free_leaf(&mut self, leaf: u32) -> Result<()> {
        self.leaf_check(leaf)?;

        let head = self.map.read_u32(OFF_LEAF_FREE);
        self.set_leaf(leaf, RID_NULL.0, head, 0);
        self.map.write_u32(OFF_LEAF_FREE, leaf);
        let count = self.map.read_u32(OFF_LEAF_COUNT);
        self.map.write_u32(OFF_LEAF_COUNT, count.saturating_sub(1));

        Ok(())
    }

    // -- lookup --------------------------------------------------------

    fn get_leaf(&self, pk: u64) -> Result<Option<u32>> {
        let mut pos = ROOT_NODE;

        for level in 0..LEVELS {
            let next = self.branch(pos, branch_of(pk, level))?;
            if next == NULL_NODE {
                return Ok(None);
            }
            if is_leaf(next) {
                if self.leaf_pk(next) == pk {
                    return Ok(Some(next));
                }

                return Ok(None);
            }
            pos = next;
        }

        Err(Error::Corruption(format!(
            "fell through leaf lookup for {pk:016x} in {}",
            self.path.display()
        )))
    }

    fn get_or_create_leaf(&mut self, pk: u64) -> Result<u32> {
        let mut pos = ROOT_NODE;
        let mut level = 0;

        while level < LEVELS {
            let b = branch_of(pk, level);
            let next = self.branch(pos, b)?;

            if next == NULL_NODE {
                // the top two levels always stay interior so a leaf can
                // never sit right under the root
                if level > 1 {
                    let leaf = self.new_leaf()?;
                    self.set_leaf(leaf, pk, 0, 0);
                    self.set_branch(pos, b, leaf);

                    return Ok(leaf);
                }

                let node = self.new_node()?;
                self.set_branch(pos, b, node);
                pos = node;
                level += 1;
            } else if is_leaf(next) {
                let existing = self.leaf_pk(next);
                if existing == pk {
                    return Ok(next);
                }

                if level + 1 >= LEVELS {
                    return Err(Error::Corruption(format!(
                        "leaf split fell off the key in {}",
                        self.path.display()
                    )));
                }

                // keys differ further down: push one interior node onto
                // the shared prefix and hang the old leaf below it
                let old_branch = branch_of(existing, level + 1);
                let split = self.new_node()?;
                self.set_branch(pos, b, split);
                self.set_branch(split, old_branch, next);
                // re-examine the same level; the next pass descends into
                // the split node
            } else {
                pos = next;
                level += 1;
            }
        }

        Err(Error::Corruption(format!(
            "fell through leaf create for {pk:016x} in {}",
            self.path.display()
        )))
    }

    // -- mutation ------------------------------------------------------

    /// Appends `pair` to the chain for `pk`, creating the leaf if needed.
    ///
    /// With `force_dup` unset, a pair already present in the chain is not
    /// added again. Returns whether a row was inserted.
    pub fn add(
        &mut self,
        table: &mut Ptable,
        pk: Rid,
        pair: [Rid; 2],
        force_dup: bool,
    ) -> Result<bool> {
        let leaf = self.get_or_create_leaf(pk.0)?;
        let chain = self.leaf_chain(leaf);

        if !force_dup && chain != 0 && table.pair_exists(chain, pair)? {
            return Ok(false);
        }

        let new_chain = table.add_pair(chain, pair)?;
        let length = self.leaf_length(leaf);
        self.set_leaf(leaf, pk.0, new_chain, length + 1);
        self.add_count(1);

        Ok(true)
    }

    /// Removes rows matching `pair` under `pk`; empty leaves are freed
    /// and the path above them culled. Returns the number removed.
    pub fn remove(
        &mut self,
        table: &mut Ptable,
        pk: Rid,
        pair: [Rid; 2],
        models: Option<&mut FxHashSet<Rid>>,
    ) -> Result<u32> {
        let Some(leaf) = self.get_leaf(pk.0)? else {
            return Ok(0);
        };

        let chain = self.leaf_chain(leaf);
        if chain == 0 {
            return Err(Error::Corruption(format!(
                "leaf {leaf:#x} has no chain in {}",
                self.path.display()
            )));
        }

        let mut removed = 0;
        let new_chain = table.remove_pair(chain, pair, &mut removed, models)?;
        let length = self.leaf_length(leaf).saturating_sub(removed);
        self.set_leaf(leaf, pk.0, new_chain, length);

        if removed > 0 {
            self.add_count(-i64::from(removed));
            if length == 0 {
                self.collapse_by_pk(pk.0, ROOT_NODE, 0)?;
            }
        }

        Ok(removed)
    }

    fn collapse_by_pk(&mut self, pk: u64, node: u32, level: usize) -> Result<CollapseAction> {
        let b = branch_of(pk, level);
        let child = self.branch(node, b)?;

        if child == NULL_NODE {
            return Ok(CollapseAction::Keep);
        } else if is_leaf(child) {
            if self.leaf_length(child) == 0 && self.leaf_chain(child) == 0 {
                self.free_leaf(child)?;
                self.set_branch(node, b, NULL_NODE);
            } else {
                log::error!(
                    "unexpected non-empty leaf collapsing {pk:016x} in {}",
                    self.path.display()
                );
            }
        } else if self.collapse_by_pk(pk, child, level + 1)? == CollapseAction::Cull {
            self.free_node(child)?;
            self.set_branch(node, b, NULL_NODE);
        }

        for c in 0..BRANCHES {
            if self.branch(node, c)? != NULL_NODE {
                return Ok(CollapseAction::Keep);
            }
        }

        Ok(CollapseAction::Cull)
    }

    /// Whole-tree sweep removing every row matching `pattern`.
    pub fn remove_all(&mut self, table: &mut Ptable, pattern: [Rid; 2]) -> Result<u32> {
        let mut removed = 0;
        self.remove_all_recurse(table, pattern, ROOT_NODE, &mut removed)?;
        self.add_count(-i64::from(removed));

        Ok(removed)
    }

    fn remove_all_recurse(
        &mut self,
        table: &mut Ptable,
        pattern: [Rid; 2],
        node: u32,
        removed: &mut u32,
    ) -> Result<CollapseAction> {
        let mut branches = 0;

        for b in 0..BRANCHES {
            let child = self.branch(node, b)?;

            if child == NULL_NODE {
                continue;
            }

            if is_leaf(child) {
                let chain = self.leaf_chain(child);
                let mut sub_removed = 0;
                if chain != 0 {
                    let new_chain =
                        table.remove_pair(chain, pattern, &mut sub_removed, None)?;
                    let pk = self.leaf_pk(child);
                    let length = self.leaf_length(child).saturating_sub(sub_removed);
                    self.set_leaf(child, pk, new_chain, length);
                    *removed += sub_removed;
                }

                if sub_removed > 0 && self.leaf_length(child) == 0 {
                    self.free_leaf(child)?;
                    self.set_branch(node, b, NULL_NODE);
                } else {
                    branches += 1;
                }
            } else {
                match self.remove_all_recurse(table, pattern, child, removed)? {
                    CollapseAction::Cull => {
                        self.free_node(child)?;
                        self.set_branch(node, b, NULL_NODE);
                    }
                    CollapseAction::Keep => branches += 1,
                }
            }
        }

        if branches == 0 && node != ROOT_NODE {
            return Ok(CollapseAction::Cull);
        }

        Ok(CollapseAction::Keep)
    }

    // -- iteration -----------------------------------------------------

    /// Lazy stream over the chain rows for `pk` matching `pattern`
    /// ([`RID_NULL`] wildcards either slot). `None` when the key has no
    /// leaf.
    pub fn search(&self, pk: Rid, pattern: [Rid; 2]) -> Result<Option<SearchIter>> {
        let Some(leaf) = self.get_leaf(pk.0)? else {
            return Ok(None);
        };

        Ok(Some(SearchIter {
            block: self.leaf_chain(leaf),
            length: self.leaf_length(leaf),
            pattern,
        }))
    }

    /// Enumerates every `(pk, pair)` in the tree, optionally keeping only
    /// pairs whose graph slot equals `graph`.
    #[must_use]
    pub fn traverse(&self, graph: Rid) -> TraverseIter {
        TraverseIter {
            stack: vec![(ROOT_NODE, 0)],
            block: 0,
            pk: Rid(0),
            graph,
        }
    }

    pub fn sync(&self) -> Result<()> {
        self.map.sync()
    }

    pub fn unlink(self) -> Result<()> {
        std::fs::remove_file(&self.path)?;

        Ok(())
    }

    // -- verification --------------------------------------------------

    /// Structural check: walks the whole tree, confirms every leaf length
    /// equals its chain length in `table`, marks the chains in `check`
    /// and returns statistics.
    pub fn check(&self, table: &Ptable, check: &mut ConsistencyCheck) -> Result<PtreeStats> {
        let mut stats = PtreeStats::default();
        self.check_recurse(table, check, ROOT_NODE, 1, &mut stats)?;

        if stats.rows != self.count() {
            return Err(Error::Corruption(format!(
                "{}: header says {} rows, tree holds {}",
                self.path.display(),
                self.count(),
                stats.rows,
            )));
        }

        Ok(stats)
    }

    fn check_recurse(
        &self,
        table: &Ptable,
        check: &mut ConsistencyCheck,
        node: u32,
        depth: u32,
        stats: &mut PtreeStats,
    ) -> Result<()> {
        stats.nodes += 1;

        for b in 0..BRANCHES {
            let child = self.branch(node, b)?;
            if child == NULL_NODE {
                continue;
            }

            if is_leaf(child) {
                let length = self.leaf_length(child);
                let chain = self.leaf_chain(child);
                if length == 0 || chain == 0 {
                    return Err(Error::Corruption(format!(
                        "{}: leaf {child:#x} is empty but was not collected",
                        self.path.display()
                    )));
                }

                let chain_len = table.mark_chain(check, child, chain)?;
                if chain_len != length {
                    return Err(Error::Corruption(format!(
                        "{}: leaf {child:#x} says {length} rows, chain holds {chain_len}",
                        self.path.display()
                    )));
                }

                stats.leaves += 1;
                stats.rows += u64::from(length);
                stats.min_leaf_depth = stats.min_leaf_depth.min(depth);
                stats.max_leaf_depth = stats.max_leaf_depth.max(depth);
            } else {
                self.check_recurse(table, check, child, depth + 1, stats)?;
            }
        }

        Ok(())
    }
}

#[derive(Copy, Clone, Eq, PartialEq)]
enum CollapseAction {
    Keep,
    Cull,
}

/// Tree shape counters returned by [`Ptree::check`].
#[derive(Debug)]
pub struct PtreeStats {
    pub nodes: u32,
    pub leaves: u32,
    pub rows: u64,
    pub min_leaf_depth: u32,
    pub max_leaf_depth: u32,
}

impl Default for PtreeStats {
    fn default() -> Self {
        Self {
            nodes: 0,
            leaves: 0,
            rows: 0,
            min_leaf_depth: u32::MAX,
            max_leaf_depth: 0,
        }
    }
}

/// Cursor over one leaf's chain; stepped with the owning chain table.
pub struct SearchIter {
    block: RowId,
    length: u32,
    pattern: [Rid; 2],
}

impl SearchIter {
    /// Length of the underlying leaf (not of the filtered stream).
    #[must_use]
    pub fn chain_length(&self) -> u32 {
        self.length
    }

    pub fn next(&mut self, table: &Ptable) -> Result<Option<[Rid; 2]>> {
        while self.block != 0 {
            let row = table.get_row(self.block)?;
            self.block = table.next(self.block)?;

            if (self.pattern[0] == RID_NULL || self.pattern[0] == row[0])
                && (self.pattern[1] == RID_NULL || self.pattern[1] == row[1])
            {
                return Ok(Some(row));
            }
        }

        Ok(None)
    }
}

/// Depth-first walk over every leaf chain in a tree.
pub struct TraverseIter {
    stack: Vec<(u32, usize)>,
    block: RowId,
    pk: Rid,
    graph: Rid,
}

impl TraverseIter {
    pub fn next(&mut self, tree: &Ptree, table: &Ptable) -> Result<Option<(Rid, [Rid; 2])>> {
        loop {
            while self.block != 0 {
                let row = table.get_row(self.block)?;
                self.block = table.next(self.block)?;

                if self.graph == RID_NULL || self.graph == row[0] {
                    return Ok(Some((self.pk, row)));
                }
            }

            let Some((node, branch)) = self.stack.pop() else {
                return Ok(None);
            };

            for b in branch..BRANCHES {
                let child = tree.branch(node, b)?;
                if child == NULL_NODE {
                    continue;
                }

                if is_leaf(child) {
                    self.block = tree.leaf_chain(child);
                    self.pk = Rid(tree.leaf_pk(child));
                    self.stack.push((node, b + 1));

                    break;
                }

                self.stack.push((node, b + 1));
                self.stack.push((child, 0));

                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn open_pair(dir: &Path) -> crate::Result<(Ptree, Ptable)> {
        let table = Ptable::open(&dir.join("pairs.ptable"), true, true)?;
        let tree = Ptree::open(&dir.join("ps-test.ptree"), true, true, table.tag())?;

        Ok((tree, table))
    }

    fn pair(a: u64, b: u64) -> [Rid; 2] {
        [Rid(a), Rid(b)]
    }

    #[test]
    fn add_and_search() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let (mut tree, mut table) = open_pair(dir.path())?;

        assert!(tree.add(&mut table, Rid(42), pair(1, 100), false)?);
        assert!(tree.add(&mut table, Rid(42), pair(1, 101), false)?);
        assert!(tree.add(&mut table, Rid(7), pair(1, 100), false)?);

        assert_eq!(3, tree.count());

        let mut it = tree.search(Rid(42), [RID_NULL, RID_NULL])?.unwrap();
        let mut seen = vec![];
        while let Some(row) = it.next(&table)? {
            seen.push(row);
        }
        assert_eq!(2, seen.len());

        // filtered search
        let mut it = tree.search(Rid(42), [RID_NULL, Rid(101)])?.unwrap();
        assert_eq!(Some(pair(1, 101)), it.next(&table)?);
        assert_eq!(None, it.next(&table)?);

        // missing key has no iterator
        assert!(tree.search(Rid(9999), [RID_NULL, RID_NULL])?.is_none());

        Ok(())
    }

    #[test]
    fn dedup_unless_forced() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let (mut tree, mut table) = open_pair(dir.path())?;

        assert!(tree.add(&mut table, Rid(1), pair(1, 1), false)?);
        assert!(!tree.add(&mut table, Rid(1), pair(1, 1), false)?);
        assert_eq!(1, tree.count());

        assert!(tree.add(&mut table, Rid(1), pair(1, 1), true)?);
        assert_eq!(2, tree.count());

        Ok(())
    }

    #[test]
    fn zero_key_works() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let (mut tree, mut table) = open_pair(dir.path())?;

        assert!(tree.add(&mut table, Rid(0), pair(5, 6), false)?);
        let mut it = tree.search(Rid(0), [RID_NULL, RID_NULL])?.unwrap();
        assert_eq!(Some(pair(5, 6)), it.next(&table)?);

        Ok(())
    }

    #[test]
    fn split_on_shared_prefix() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let (mut tree, mut table) = open_pair(dir.path())?;

        // differ in a single high bit, sharing no low prefix
        let a = Rid(0x0000_0000_0000_0001);
        let b = Rid(0x4000_0000_0000_0001);
        tree.add(&mut table, a, pair(1, 10), false)?;
        tree.add(&mut table, b, pair(1, 11), false)?;

        let mut check = table.start_check();
        let stats = tree.check(&table, &mut check)?;
        assert_eq!(2, stats.leaves);
        assert!(stats.min_leaf_depth >= 2);

        let mut it = tree.search(a, [RID_NULL, RID_NULL])?.unwrap();
        assert_eq!(Some(pair(1, 10)), it.next(&table)?);
        assert_eq!(None, it.next(&table)?);

        Ok(())
    }

    #[test]
    fn split_on_long_shared_prefix() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let (mut tree, mut table) = open_pair(dir.path())?;

        // differ only in the bottom 2 bits: maximal shared prefix
        let a = Rid(0xdead_beef_0000_0000);
        let b = Rid(0xdead_beef_0000_0001);
        tree.add(&mut table, a, pair(1, 10), false)?;
        tree.add(&mut table, b, pair(1, 11), false)?;

        let mut it = tree.search(a, [RID_NULL, RID_NULL])?.unwrap();
        assert_eq!(Some(pair(1, 10)), it.next(&table)?);
        let mut it = tree.search(b, [RID_NULL, RID_NULL])?.unwrap();
        assert_eq!(Some(pair(1, 11)), it.next(&table)?);

        let mut check = table.start_check();
        let stats = tree.check(&table, &mut check)?;
        assert_eq!(2, stats.leaves);
        assert_eq!(stats.min_leaf_depth, stats.max_leaf_depth);
        assert_eq!(0, table.check_leaks(&mut check)?);

        Ok(())
    }

    #[test]
    fn remove_collapses_path() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let (mut tree, mut table) = open_pair(dir.path())?;

        tree.add(&mut table, Rid(42), pair(1, 100), false)?;
        tree.add(&mut table, Rid(42), pair(2, 100), false)?;

        assert_eq!(1, tree.remove(&mut table, Rid(42), pair(1, 100), None)?);
        assert_eq!(1, tree.count());

        assert_eq!(1, tree.remove(&mut table, Rid(42), pair(2, 100), None)?);
        assert_eq!(0, tree.count());
        assert!(tree.search(Rid(42), [RID_NULL, RID_NULL])?.is_none());

        // removing from a key that never existed is a no-op
        assert_eq!(0, tree.remove(&mut table, Rid(4242), pair(1, 1), None)?);

        // every row is back on the free list
        let mut check = table.start_check();
        assert_eq!(0, table.check_leaks(&mut check)?);

        Ok(())
    }

    #[test]
    fn remove_all_by_graph() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let (mut tree, mut table) = open_pair(dir.path())?;

        for pk in 0..20u64 {
            tree.add(&mut table, Rid(pk), pair(1, pk), false)?;
            tree.add(&mut table, Rid(pk), pair(2, pk), false)?;
        }

        assert_eq!(20, tree.remove_all(&mut table, [Rid(1), RID_NULL])?);
        assert_eq!(20, tree.count());

        // graph 2 is still intact
        let mut it = tree.search(Rid(3), [RID_NULL, RID_NULL])?.unwrap();
        assert_eq!(Some(pair(2, 3)), it.next(&table)?);
        assert_eq!(None, it.next(&table)?);

        // second sweep finds nothing
        assert_eq!(0, tree.remove_all(&mut table, [Rid(1), RID_NULL])?);

        let mut check = table.start_check();
        let stats = tree.check(&table, &mut check)?;
        assert_eq!(20, stats.leaves);
        assert_eq!(0, table.check_leaks(&mut check)?);

        Ok(())
    }

    #[test]
    fn traverse_with_graph_filter() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let (mut tree, mut table) = open_pair(dir.path())?;

        for pk in 0..10u64 {
            tree.add(&mut table, Rid(pk * 1000), pair(pk % 2, pk), false)?;
        }

        let mut it = tree.traverse(RID_NULL);
        let mut n = 0;
        while it.next(&tree, &table)?.is_some() {
            n += 1;
        }
        assert_eq!(10, n);

        let mut it = tree.traverse(Rid(0));
        let mut n = 0;
        while let Some((_pk, row)) = it.next(&tree, &table)? {
            assert_eq!(Rid(0), row[0]);
            n += 1;
        }
        assert_eq!(5, n);

        Ok(())
    }

    #[test]
    fn rejects_foreign_table() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let (tree, table) = open_pair(dir.path())?;
        let path = tree.path().to_path_buf();
        drop(tree);

        assert!(matches!(
            Ptree::open(&path, true, false, table.tag().wrapping_add(1)),
            Err(Error::Corruption(_))
        ));

        Ok(())
    }

    #[test]
    fn reopen_preserves_tree() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let tag;
        {
            let (mut tree, mut table) = open_pair(dir.path())?;
            tag = table.tag();
            for pk in 0..100u64 {
                tree.add(&mut table, Rid(pk << 32), pair(1, pk), false)?;
            }
            tree.sync()?;
            table.sync()?;
        }

        let table = Ptable::open(&dir.path().join("pairs.ptable"), false, false)?;
        let tree = Ptree::open(&dir.path().join("ps-test.ptree"), false, false, tag)?;
        assert_eq!(100, tree.count());

        let mut it = tree.search(Rid(5u64 << 32), [RID_NULL, RID_NULL])?.unwrap();
        assert_eq!(Some(pair(1, 5)), it.next(&table)?);

        Ok(())
    }
}

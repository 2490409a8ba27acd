// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Triple-block chain: per-graph triple storage in 128-byte blocks.
//!
//! Each block holds up to 5 `(s, p, o)` triples and the id of the next
//! block; new triples go into the head block, and a full head gets a
//! fresh block prepended. The head block's flags track two degraded
//! states: `SPARSE` (some triples have been overwritten with the GONE
//! tombstone) and `SUPERSET` (the chain may hold triples that no longer
//! exist in the authoritative predicate trees, so reads must verify).

use crate::{
    mapped::{BlockFile, BlockFormat},
    rid::{Rid, RID_GONE},
    Error, Result,
};
use byteorder::{ByteOrder, LittleEndian as LE};
use std::path::Path;

pub const MAGIC: [u8; 4] = *b"JXTB";
const REVISION: u32 = 1;

/// Triples per block.
pub const BLOCK_TRIPLES: usize = 5;
const BLOCK_SIZE: usize = 128;
const INITIAL_BLOCKS: u32 = 1024;

const FORMAT: BlockFormat = BlockFormat {
    magic: MAGIC,
    revision: REVISION,
    block_size: BLOCK_SIZE,
    initial_blocks: INITIAL_BLOCKS,
    // 0 is NULL, 1 is kept as a sentinel so chain heads are always >= 2
    // and the model hash can use 1 to mean "stored in a file"
    reserved: 2,
};

/// Chain-head flag: some triples in the chain are GONE tombstones.
pub const BIT_SPARSE: u8 = 1;

/// Chain-head flag: the chain may contain stale triples; verify on read.
pub const BIT_SUPERSET: u8 = 2;

const OFF_CONT: usize = 0;
const OFF_LENGTH: usize = 4;
const OFF_FLAGS: usize = 5;
const OFF_TRIPLES: usize = 8;

/// The triple-block chain file of one segment ("model list").
pub struct TripleBlockChain {
    blocks: BlockFile,
}

impl TripleBlockChain {
    pub fn open(path: &Path, writable: bool, create: bool) -> Result<Self> {
        Ok(Self {
            blocks: BlockFile::open(path, FORMAT, writable, create)?,
        })
    }

    /// Blocks handed out so far.
    #[must_use]
    pub fn allocated_blocks(&self) -> u32 {
        self.blocks.length()
    }

    /// Starts a new chain and returns its head block.
    pub fn new_chain(&mut self) -> Result<u32> {
        self.blocks.allocate()
    }

    /// Walks the chain and frees every block.
    pub fn remove_chain(&mut self, head: u32) -> Result<()> {
        let mut block = head;
        let mut hops = 0;

        while block != 0 {
            self.blocks.check_id(block)?;
            let next = LE::read_u32(&self.blocks.block(block)[OFF_CONT..OFF_CONT + 4]);
            self.blocks.free(block)?;
            hops += 1;
            if hops > self.blocks.length() {
                return Err(self.cycle());
            }
            block = next;
        }

        Ok(())
    }

    fn block_length(&self, block: u32) -> usize {
        self.blocks.block(block)[OFF_LENGTH] as usize
    }

    fn cont(&self, block: u32) -> u32 {
        LE::read_u32(&self.blocks.block(block)[OFF_CONT..OFF_CONT + 4])
    }

    fn triple_at(&self, block: u32, pos: usize) -> [Rid; 3] {
        let data = self.blocks.block(block);
        let off = OFF_TRIPLES + pos * 24;

        [
            Rid(LE::read_u64(&data[off..off + 8])),
            Rid(LE::read_u64(&data[off + 8..off + 16])),
            Rid(LE::read_u64(&data[off + 16..off + 24])),
        ]
    }

    /// Appends to the head block, or prepends a fresh head when full.
    /// Returns the (possibly new) head, which the caller must store back
    /// into the model hash.
    pub fn add_triple(&mut self, head: u32, triple: [Rid; 3]) -> Result<u32> {
        self.blocks.check_id(head)?;

        let mut head = head;
        if self.block_length(head) + 1 > BLOCK_TRIPLES {
            let new_head = self.blocks.allocate()?;
            let flags = self.blocks.block(head)[OFF_FLAGS];
            let block = self.blocks.block_mut(new_head);
            LE::write_u32(&mut block[OFF_CONT..OFF_CONT + 4], head);
            block[OFF_LENGTH] = 0;
            block[OFF_FLAGS] = flags;
            head = new_head;
        }

        let len = self.block_length(head);
        let block = self.blocks.block_mut(head);
        let off = OFF_TRIPLES + len * 24;
        LE::write_u64(&mut block[off..off + 8], triple[0].0);
        LE::write_u64(&mut block[off + 8..off + 16], triple[1].0);
        LE::write_u64(&mut block[off + 16..off + 24], triple[2].0);
        #[allow(clippy::cast_possible_truncation)]
        {
            block[OFF_LENGTH] = len as u8 + 1;
        }

        Ok(head)
    }

    pub fn set_bit(&mut self, head: u32, bit: u8) -> Result<()> {
        self.blocks.check_id(head)?;
        let block = self.blocks.block_mut(head);
        // flipping bits causes page writes, so avoid when already set
        if block[OFF_FLAGS] & bit == 0 {
            block[OFF_FLAGS] |= bit;
        }

        Ok(())
    }

    pub fn clear_bit(&mut self, head: u32, bit: u8) -> Result<()> {
        self.blocks.check_id(head)?;
        let block = self.blocks.block_mut(head);
        if block[OFF_FLAGS] & bit != 0 {
            block[OFF_FLAGS] &= !bit;
        }

        Ok(())
    }

    pub fn get_bit(&self, head: u32, bit: u8) -> Result<bool> {
        self.blocks.check_id(head)?;

        Ok(self.blocks.block(head)[OFF_FLAGS] & bit != 0)
    }

    /// Triples in the chain, not counting GONE tombstones.
    pub fn length(&self, head: u32) -> Result<u64> {
        self.blocks.check_id(head)?;

        let mut length = 0;
        let mut block = head;
        let mut hops = 0;

        while block != 0 {
            self.blocks.check_id(block)?;
            for pos in 0..self.block_length(block) {
                if self.triple_at(block, pos)[0] != RID_GONE {
                    length += 1;
                }
            }
            hops += 1;
            if hops > self.blocks.length() {
                return Err(self.cycle());
            }
            block = self.cont(block);
        }

        Ok(length)
    }

    /// Starts an iterator over the chain's live triples.
    pub fn iter(&self, head: u32) -> Result<TbChainIter> {
        self.blocks.check_id(head)?;

        Ok(TbChainIter {
            chain: head,
            node: head,
            pos: 0,
            superset: self.get_bit(head, BIT_SUPERSET)?,
            hops: 0,
        })
    }

    fn cycle(&self) -> Error {
        Error::Corruption(format!(
            "block chain cycle in {}",
            self.blocks.path().display()
        ))
    }

    /// Marks every block of `head` in `marks`; returns its triple count.
    /// Fails when a block appears in two chains or twice in one.
    pub fn mark_chain(&self, marks: &mut Vec<bool>, head: u32) -> Result<u64> {
        marks.resize(self.blocks.length() as usize, false);

        let mut triples = 0;
        let mut block = head;
        let mut hops = 0;

        while block != 0 {
            self.blocks.check_id(block)?;
            let slot = &mut marks[block as usize];
            if *slot {
                return Err(Error::Corruption(format!(
                    "block {block} appears in two chains in {}",
                    self.blocks.path().display()
                )));
            }
            *slot = true;

            let len = self.block_length(block);
            if len == 0 || len > BLOCK_TRIPLES {
                return Err(Error::Corruption(format!(
                    "block {block} has invalid length {len} in {}",
                    self.blocks.path().display()
                )));
            }
            #[allow(clippy::cast_possible_truncation)]
            {
                triples += len as u64;
            }

            hops += 1;
            if hops > self.blocks.length() {
                return Err(self.cycle());
            }
            block = self.cont(block);
        }

        Ok(triples)
    }

    /// After every chain has been marked, frees unreachable blocks.
    pub fn reclaim_leaks(&mut self, marks: &mut Vec<bool>) -> Result<u32> {
        self.blocks.reclaim_leaks(marks)
    }

    pub fn sync(&self) -> Result<()> {
        self.blocks.sync()
    }

    pub fn unlink(self) -> Result<()> {
        self.blocks.unlink()
    }

    fn kill_triple(&mut self, block: u32, pos: usize) {
        let data = self.blocks.block_mut(block);
        let off = OFF_TRIPLES + pos * 24;
        LE::write_u64(&mut data[off..off + 8], RID_GONE.0);
    }
}

/// Cursor over a chain; GONE triples are skipped, and when the chain is
/// flagged `SUPERSET` every triple is re-checked through the verifier
/// before being yielded.
pub struct TbChainIter {
    chain: u32,
    node: u32,
    pos: usize,
    superset: bool,
    hops: u32,
}

impl TbChainIter {
    /// Steps the iterator. `verify` decides whether a triple still exists
    /// in the authoritative indexes; it is only consulted on superset
    /// chains. Triples failing verification are tombstoned in place (on
    /// writable handles) and the chain is marked sparse.
    pub fn next<V>(
        &mut self,
        tbc: &mut TripleBlockChain,
        verify: &mut V,
    ) -> Result<Option<[Rid; 3]>>
    where
        V: FnMut([Rid; 3]) -> Result<bool>,
    {
        loop {
            if self.node == 0 {
                // a full clean scan proves the chain is exact again
                if self.superset && tbc.blocks.is_writable() {
                    tbc.clear_bit(self.chain, BIT_SUPERSET)?;
                }

                return Ok(None);
            }

            tbc.blocks.check_id(self.node)?;

            if self.pos >= tbc.block_length(self.node) {
                self.hops += 1;
                if self.hops > tbc.allocated_blocks() {
                    return Err(tbc.cycle());
                }
                self.node = tbc.cont(self.node);
                self.pos = 0;

                continue;
            }

            let triple = tbc.triple_at(self.node, self.pos);
            if triple[0] == RID_GONE {
                self.pos += 1;

                continue;
            }

            if self.superset && !verify(triple)? {
                if tbc.blocks.is_writable() {
                    tbc.kill_triple(self.node, self.pos);
                    tbc.set_bit(self.chain, BIT_SPARSE)?;
                }
                self.pos += 1;

                continue;
            }

            self.pos += 1;

            return Ok(Some(triple));
        }
    }
}

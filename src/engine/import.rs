// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Bulk ingest and deletion.
//!
//! Imports are staged: resources buffer into memory and flush into the
//! resource hash in batches; quads buffer into memory and, once a session
//! overflows the buffer, spill into 16 on-disk pending lists partitioned
//! by predicate bucket. `stop_import` drains whatever is staged into the
//! predicate trees and graph indexes and flushes all headers, which is
//! the point where the new quads become visible to readers.

use super::{BufferedQuad, Engine, PENDED_LISTS, QUAD_BUFFER_SIZE, RES_BUFFER_SIZE};
use crate::{
    file,
    list::List,
    quad::Quad,
    rid::{Rid, RID_NULL},
    tbchain::BIT_SUPERSET,
    timing::Stopwatch,
    Error, Resource, Result,
};
use rustc_hash::FxHashSet;

/// Which pending list a predicate spills into.
fn pended_bucket(pred: Rid) -> usize {
    #[allow(clippy::cast_possible_truncation)]
    {
        ((pred.0 >> 40) as usize) % PENDED_LISTS
    }
}

impl Engine {
    /// Brackets the start of an ingest run; refuses when the store's
    /// filesystem is low on space.
    pub fn start_import(&mut self) -> Result<()> {
        let free = file::free_disk_gb(&self.seg_dir);
        if free < self.config.disk_limit_gb {
            log::error!(
                "free disk {free:.1} GB below limit {:.1} GB, refusing import",
                self.config.disk_limit_gb,
            );

            return Err(Error::Capacity);
        }

        self.importing = true;

        Ok(())
    }

    /// Stages resources; flushes into the resource hash when the buffer
    /// fills.
    pub fn res_import(&mut self, resources: &[Resource]) -> Result<()> {
        let timer = Stopwatch::start();

        for res in resources {
            self.res_buffer.push(res.clone());
            if self.res_buffer.len() >= RES_BUFFER_SIZE {
                self.res_import_flush()?;
            }
        }

        self.import_timing.add_resource += timer.lap();

        Ok(())
    }

    fn res_import_flush(&mut self) -> Result<()> {
        let staged = std::mem::take(&mut self.res_buffer);
        self.res.put_multi(&staged)?;

        Ok(())
    }

    /// Drains the resource buffer into the resource hash.
    pub fn res_import_commit(&mut self) -> Result<()> {
        let timer = Stopwatch::start();
        self.res_import_flush()?;
        self.import_timing.commit_resource += timer.lap();

        Ok(())
    }

    /// Stages quads; a full buffer switches the session into pended mode
    /// and commits as it goes.
    pub fn quad_import(&mut self, quads: &[Quad]) -> Result<()> {
        let timer = Stopwatch::start();

        for &quad in quads {
            self.quad_buffer.push(BufferedQuad { quad, skip: false });

            if self.quad_buffer.len() >= QUAD_BUFFER_SIZE {
                if self.pended.is_none() {
                    let mut lists = Vec::with_capacity(PENDED_LISTS);
                    for bucket in 0..PENDED_LISTS {
                        let path =
                            file::list_path(&self.seg_dir, &format!("pl-{bucket:x}"));
                        let mut list: List<Quad> = List::open(&path, true, true)?;
                        list.truncate()?;
                        lists.push(list);
                    }
                    self.pended = Some(lists);

                    log::debug!(
                        "import session on {}:{:04x} overflowed, pending to disk",
                        self.kb_name,
                        self.segment,
                    );
                }

                self.quad_import_commit()?;
            }
        }

        self.import_timing.add_quad += timer.lap();

        Ok(())
    }

    /// Commits the staged quad buffer.
    ///
    /// In pended mode the quads only move to the on-disk pending lists
    /// (the trees are rebuilt once at `stop_import`); otherwise they are
    /// inserted into both tree directions right here. Either way the
    /// graph indexes are appended now.
    pub fn quad_import_commit(&mut self) -> Result<()> {
        let timer = Stopwatch::start();

        if self.pended.is_some() {
            for i in 0..self.quad_buffer.len() {
                if self.quad_buffer[i].skip {
                    continue;
                }
                let quad = self.quad_buffer[i].quad;
                let bucket = pended_bucket(quad.predicate);
                if let Some(pended) = &mut self.pended {
                    pended[bucket].add(quad)?;
                }
            }
        } else {
            self.commit_buffer_to_ptrees()?;
        }

        self.predicates.flush()?;
        self.append_graph_indexes()?;
        self.quad_buffer.clear();

        self.import_timing.commit_quad += timer.lap();

        Ok(())
    }

    /// In-memory path: two sorted passes over the buffer, subject trees
    /// then object trees. Duplicates are marked on the first pass and
    /// skipped everywhere after.
    fn commit_buffer_to_ptrees(&mut self) -> Result<()> {
        self.quad_buffer
            .sort_unstable_by(|a, b| a.quad.cmp_psmo(&b.quad));
        for i in 1..self.quad_buffer.len() {
            if self.quad_buffer[i].quad == self.quad_buffer[i - 1].quad {
                self.quad_buffer[i].skip = true;
            }
        }

        let mut current: Option<(Rid, usize)> = None;
        for i in 0..self.quad_buffer.len() {
            if self.quad_buffer[i].skip {
                continue;
            }
            let quad = self.quad_buffer[i].quad;

            let n = match current {
                Some((pred, n)) if pred == quad.predicate => n,
                _ => {
                    let n = self.open_ptree_pair(quad.predicate)?;
                    current = Some((quad.predicate, n));
                    n
                }
            };

            let Engine { ptrees, pairs, .. } = self;
            let (subject, _) = ptrees.pair_mut(n)?;
            let inserted =
                subject.add(pairs, quad.subject, [quad.graph, quad.object], false)?;
            if inserted {
                self.approx_size += 1;
            } else {
                // already present from an earlier commit
                self.quad_buffer[i].skip = true;
            }
        }

        self.quad_buffer
            .sort_unstable_by(|a, b| a.quad.cmp_poms(&b.quad));

        let mut current: Option<(Rid, usize)> = None;
        for i in 0..self.quad_buffer.len() {
            if self.quad_buffer[i].skip {
                continue;
            }
            let quad = self.quad_buffer[i].quad;

            let n = match current {
                Some((pred, n)) if pred == quad.predicate => n,
                _ => {
                    let n = self.open_ptree_pair(quad.predicate)?;
                    current = Some((quad.predicate, n));
                    n
                }
            };

            let Engine { ptrees, pairs, .. } = self;
            let (_, object) = ptrees.pair_mut(n)?;
            object.add(pairs, quad.object, [quad.graph, quad.subject], true)?;
        }

        Ok(())
    }

    /// Appends the buffer to the per-graph indexes: the graph's tlist
    /// when it lives in its own file, the triple-block chain otherwise.
    fn append_graph_indexes(&mut self) -> Result<()> {
        self.quad_buffer
            .sort_unstable_by(|a, b| a.quad.cmp_by_graph(&b.quad));

        let mut tlist = None;
        let mut chain_head = 0u32;
        let mut last_model = RID_NULL;

        for i in 0..self.quad_buffer.len() {
            if self.quad_buffer[i].skip {
                continue;
            }
            let quad = self.quad_buffer[i].quad;
            let model = quad.graph;

            if model != last_model {
                tlist = None;
                chain_head = 0;

                match self.models.get(model)? {
                    0 => {
                        if self.model_files {
                            tlist = Some(self.open_tlist(model, true)?);
                            self.models.put(model, 1)?;
                        }
                        // chain allocated lazily below
                    }
                    1 => {
                        tlist = Some(self.open_tlist(model, false)?);
                    }
                    node => chain_head = node,
                }

                last_model = model;
            }

            if let Some(tl) = &mut tlist {
                tl.add(quad.triple())?;
            } else {
                if chain_head == 0 {
                    chain_head = self.model_list.new_chain()?;
                    self.models.put(model, chain_head)?;
                }
                let new_head = self.model_list.add_triple(chain_head, quad.triple())?;
                if new_head != chain_head {
                    chain_head = new_head;
                    self.models.put(model, chain_head)?;
                }
            }
        }

        Ok(())
    }

    /// Ends an ingest run: drains staged data into the real indexes and
    /// flushes every header. Readers see the new quads after this
    /// returns.
    pub fn stop_import(&mut self) -> Result<()> {
        let timer = Stopwatch::start();

        if !self.quad_buffer.is_empty() {
            self.quad_import_commit()?;
        }
        self.res_import_flush()?;
        self.res.flush()?;
        self.models.flush()?;

        if let Some(mut pended) = self.pended.take() {
            for list in &mut pended {
                self.drain_pended_list(list)?;
            }
            for list in pended {
                list.unlink()?;
            }
        }

        self.predicates.flush()?;
        self.sync()?;

        self.importing = false;
        self.import_timing.rebuild += timer.lap();

        Ok(())
    }

    /// Replays one pending list into both tree directions: sort by
    /// `(p, s, g, o)` for the subject trees, resort by `(p, o, g, s)`
    /// for the object trees, deduplicating in the sorted reads.
    fn drain_pended_list(&mut self, list: &mut List<Quad>) -> Result<()> {
        list.flush()?;

        list.sort_chunked(|a, b| a.cmp_psmo(b))?;
        let mut current: Option<(Rid, usize)> = None;
        let quads = list.sorted_uniq()?;
        for quad in quads {
            let n = match current {
                Some((pred, n)) if pred == quad.predicate => n,
                _ => {
                    let n = self.open_ptree_pair(quad.predicate)?;
                    current = Some((quad.predicate, n));
                    n
                }
            };

            let Engine { ptrees, pairs, .. } = self;
            let (subject, _) = ptrees.pair_mut(n)?;
            if subject.add(pairs, quad.subject, [quad.graph, quad.object], false)? {
                self.approx_size += 1;
            }
        }

        list.sort_chunked(|a, b| a.cmp_poms(b))?;
        let mut current: Option<(Rid, usize)> = None;
        let quads = list.sorted_uniq()?;
        for quad in quads {
            let n = match current {
                Some((pred, n)) if pred == quad.predicate => n,
                _ => {
                    let n = self.open_ptree_pair(quad.predicate)?;
                    current = Some((quad.predicate, n));
                    n
                }
            };

            let Engine { ptrees, pairs, .. } = self;
            let (_, object) = ptrees.pair_mut(n)?;
            object.add(pairs, quad.object, [quad.graph, quad.subject], false)?;
        }

        Ok(())
    }

    /// Removes explicit quads from both tree directions, then flags the
    /// touched graphs' chains as supersets so graph-scoped reads verify
    /// against the trees again.
    pub fn delete_quads(&mut self, quads: &[Quad]) -> Result<()> {
        let timer = Stopwatch::start();

        let preds: FxHashSet<Rid> = quads.iter().map(|q| q.predicate).collect();
        let models: FxHashSet<Rid> = quads.iter().map(|q| q.graph).collect();

        for pred in preds {
            let Some(n) = self.ptrees.find(pred) else {
                // predicate unknown to this segment
                continue;
            };

            for quad in quads.iter().filter(|q| q.predicate == pred) {
                let Engine { ptrees, pairs, .. } = self;
                let (subject, object) = ptrees.pair_mut(n)?;
                subject.remove(pairs, quad.subject, [quad.graph, quad.object], None)?;
                object.remove(pairs, quad.object, [quad.graph, quad.subject], None)?;
            }
        }

        for model in models {
            let val = self.models.get(model)?;
            if val > 1 {
                self.model_list.set_bit(val, BIT_SUPERSET)?;
            }
        }

        self.import_timing.remove += timer.lap();

        Ok(())
    }

    /// Deletes whole graphs. [`RID_NULL`] anywhere in the input wipes the
    /// entire segment.
    pub fn delete_models(&mut self, models: &[Rid]) -> Result<()> {
        let timer = Stopwatch::start();

        if models.contains(&RID_NULL) {
            self.wipe()?;
            self.import_timing.remove += timer.lap();

            return Ok(());
        }

        let mut todo = Vec::new();
        for &model in models {
            if !model.is_uri() {
                log::warn!("asked to delete non-URI graph {model}, ignoring");

                continue;
            }
            if self.models.get(model)? != 0 {
                todo.push(model);
            }
        }

        // replacing one small graph inside a large KB is the common case;
        // walking its chain beats sweeping every tree
        if todo.len() == 1 {
            let model = todo[0];
            let val = self.models.get(model)?;
            if val > 1 {
                let chain_length = self.model_list.length(val)?;
                if chain_length < self.approx_size / 100 || chain_length < 100 {
                    self.delete_model_by_search(model, val)?;
                    self.models.put(model, 0)?;
                    self.models.flush()?;
                    self.import_timing.remove += timer.lap();

                    return Ok(());
                }
            }
        }

        for &model in &todo {
            match self.models.get(model)? {
                0 => {}
                1 => {
                    if let Ok(mut tl) = self.open_tlist(model, false) {
                        tl.truncate()?;
                    }
                }
                val => self.model_list.remove_chain(val)?,
            }
            self.models.put(model, 0)?;
        }

        if !todo.is_empty() {
            for n in 0..self.ptrees.len() {
                for &model in &todo {
                    let Engine { ptrees, pairs, .. } = self;
                    let (subject, object) = ptrees.pair_mut(n)?;
                    // nothing in the subject direction means nothing in
                    // the object direction either
                    let removed = subject.remove_all(pairs, [model, RID_NULL])?;
                    if removed > 0 {
                        object.remove_all(pairs, [model, RID_NULL])?;
                        self.approx_size = self.approx_size.saturating_sub(u64::from(removed));
                    }
                }
            }
        }

        self.models.flush()?;
        self.import_timing.remove += timer.lap();

        Ok(())
    }

    /// Fast path for deleting one small graph: collect its predicates
    /// from the chain, then remove its rows from just those trees.
    fn delete_model_by_search(&mut self, model: Rid, chain: u32) -> Result<()> {
        let mut preds = FxHashSet::default();
        {
            let Engine { model_list, .. } = self;
            let mut it = model_list.iter(chain)?;
            let mut no_verify = |_: [Rid; 3]| Ok(true);
            while let Some(triple) = it.next(model_list, &mut no_verify)? {
                preds.insert(triple[1]);
            }
        }

        for pred in preds {
            let Some(n) = self.ptrees.find(pred) else {
                log::error!("graph {model} refers to unindexed predicate {pred}");

                continue;
            };
            self.ptrees.ensure_open(n)?;

            let mut triples = Vec::new();
            {
                let Engine { model_list, .. } = self;
                let mut it = model_list.iter(chain)?;
                let mut no_verify = |_: [Rid; 3]| Ok(true);
                while let Some(triple) = it.next(model_list, &mut no_verify)? {
                    if triple[1] == pred {
                        triples.push(triple);
                    }
                }
            }

            let Engine { ptrees, pairs, .. } = self;
            let (subject, object) = ptrees.pair_mut(n)?;
            for triple in triples {
                if subject.remove(pairs, triple[0], [model, triple[2]], None)? == 0 {
                    log::error!(
                        "failed to remove known triple {} {} {} of {model} from the s index",
                        triple[0],
                        triple[1],
                        triple[2],
                    );
                }
                if object.remove(pairs, triple[2], [model, triple[0]], None)? == 0 {
                    log::error!(
                        "failed to remove known triple {} {} {} of {model} from the o index",
                        triple[0],
                        triple[1],
                        triple[2],
                    );
                }
                self.approx_size = self.approx_size.saturating_sub(1);
            }
        }

        self.model_list.remove_chain(chain)?;

        Ok(())
    }
}

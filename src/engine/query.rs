// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The quad-pattern matching primitive ("bind") and resource resolution.
//!
//! `bind` classifies the constraint pattern and walks the cheapest index
//! that can answer it: the model hash for graph enumeration, the graph
//! indexes for graph-scoped scans, a single predicate tree when the
//! predicate is known, or every open tree as a last resort. Results are
//! up to four parallel RID columns, capped at `limit` rows.

use super::Engine;
use crate::{
    rid::{default_graph_rid, Rid, RID_NULL},
    timing::Stopwatch,
    Error, Resource, Result,
};
use rustc_hash::FxHashSet;

/// Which columns to return, bind direction and filter bits.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct BindFlags(pub u32);

impl BindFlags {
    /// Return the graph column.
    pub const MODEL: Self = Self(0x0001);

    /// Return the subject column.
    pub const SUBJECT: Self = Self(0x0002);

    /// Return the predicate column.
    pub const PREDICATE: Self = Self(0x0004);

    /// Return the object column.
    pub const OBJECT: Self = Self(0x0008);

    /// The caller only needs distinct rows.
    pub const DISTINCT: Self = Self(0x0010);

    /// Iterate subject-keyed indexes.
    pub const BY_SUBJECT: Self = Self(0x1000);

    /// Iterate object-keyed indexes.
    pub const BY_OBJECT: Self = Self(0x2000);

    /// Drop rows whose graph is the well-known default graph.
    pub const EXCLUDE_DEFAULT_GRAPH: Self = Self(0x4000);

    const SAME_SHIFT: u32 = 8;
    const SAME_BITS: u32 = 0x0F00;

    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub fn with_same(self, mask: SameMask) -> Self {
        Self((self.0 & !Self::SAME_BITS) | ((mask as u32) << Self::SAME_SHIFT))
    }

    #[must_use]
    pub fn same_mask(self) -> SameMask {
        SameMask::from_bits((self.0 & Self::SAME_BITS) >> Self::SAME_SHIFT)
    }

    /// Number of columns the caller asked for.
    #[must_use]
    pub fn columns(self) -> usize {
        [Self::MODEL, Self::SUBJECT, Self::PREDICATE, Self::OBJECT]
            .iter()
            .filter(|f| self.contains(**f))
            .count()
    }
}

impl std::ops::BitOr for BindFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Equality constraints between the four slots of a row.
///
/// `X` marks an unconstrained slot; equal letters must hold equal RIDs.
/// Slot order is `(graph, subject, predicate, object)`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[repr(u32)]
pub enum SameMask {
    #[default]
    Xxxx = 0,
    Xxaa = 1,
    Xaxa = 2,
    Xaax = 3,
    Xaaa = 4,
    Axxa = 5,
    Axax = 6,
    Axaa = 7,
    Aaxx = 8,
    Aaxa = 9,
    Aaax = 10,
    Aaaa = 11,
    Aabb = 12,
    Abab = 13,
    Abba = 14,
}

impl SameMask {
    #[must_use]
    pub fn from_bits(bits: u32) -> Self {
        match bits {
            1 => Self::Xxaa,
            2 => Self::Xaxa,
            3 => Self::Xaax,
            4 => Self::Xaaa,
            5 => Self::Axxa,
            6 => Self::Axax,
            7 => Self::Axaa,
            8 => Self::Aaxx,
            9 => Self::Aaxa,
            10 => Self::Aaax,
            11 => Self::Aaaa,
            12 => Self::Aabb,
            13 => Self::Abab,
            14 => Self::Abba,
            0 => Self::Xxxx,
            other => {
                log::warn!("unhandled same-variable mask {other}, ignoring");

                Self::Xxxx
            }
        }
    }

    #[must_use]
    pub fn matches(self, row: [Rid; 4]) -> bool {
        let [g, s, p, o] = row;

        match self {
            Self::Xxxx => true,
            Self::Xxaa => p == o,
            Self::Xaxa => s == o,
            Self::Xaax => s == p,
            Self::Xaaa => s == p && p == o,
            Self::Axxa => g == o,
            Self::Axax => g == p,
            Self::Axaa => g == p && p == o,
            Self::Aaxx => g == s,
            Self::Aaxa => g == s && s == o,
            Self::Aaax => g == s && s == p,
            Self::Aaaa => g == s && s == p && p == o,
            Self::Aabb => g == s && p == o,
            Self::Abab => g == p && s == o,
            Self::Abba => g == o && s == p,
        }
    }
}

/// One bind request: flags, constraint vectors, offset and row cap.
///
/// An empty constraint vector is a wildcard for that slot.
#[derive(Clone, Debug)]
pub struct BindQuery {
    pub flags: BindFlags,
    pub models: Vec<Rid>,
    pub subjects: Vec<Rid>,
    pub predicates: Vec<Rid>,
    pub objects: Vec<Rid>,
    pub offset: i32,
    /// Row cap; negative means unlimited.
    pub limit: i64,
}

impl BindQuery {
    /// A wildcard query returning all four columns.
    #[must_use]
    pub fn everything() -> Self {
        Self {
            flags: BindFlags::MODEL
                | BindFlags::SUBJECT
                | BindFlags::PREDICATE
                | BindFlags::OBJECT
                | BindFlags::BY_SUBJECT,
            models: Vec::new(),
            subjects: Vec::new(),
            predicates: Vec::new(),
            objects: Vec::new(),
            offset: 0,
            limit: -1,
        }
    }

    #[must_use]
    pub fn with_models(mut self, models: Vec<Rid>) -> Self {
        self.models = models;
        self
    }

    #[must_use]
    pub fn with_subjects(mut self, subjects: Vec<Rid>) -> Self {
        self.subjects = subjects;
        self
    }

    #[must_use]
    pub fn with_predicates(mut self, predicates: Vec<Rid>) -> Self {
        self.predicates = predicates;
        self
    }

    #[must_use]
    pub fn with_objects(mut self, objects: Vec<Rid>) -> Self {
        self.objects = objects;
        self
    }

    #[must_use]
    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }
}

/// Outcome of a bind.
///
/// "No rows and no columns requested" is [`BindResult::NoMatch`]; zero
/// rows with columns requested is a regular (empty) match — callers rely
/// on the difference.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BindResult {
    NoMatch,
    Match(Vec<Vec<Rid>>),
}

impl BindResult {
    #[must_use]
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Match(_))
    }

    /// Rows in the result (0 for `NoMatch` and zero-column matches).
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::NoMatch => 0,
            Self::Match(cols) => cols.first().map_or(0, Vec::len),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn columns(&self) -> &[Vec<Rid>] {
        match self {
            Self::NoMatch => &[],
            Self::Match(cols) => cols,
        }
    }
}

fn push_row(cols: &mut [Vec<Rid>], flags: BindFlags, row: [Rid; 4]) {
    let mut col = 0;
    for (slot, flag) in [
        BindFlags::MODEL,
        BindFlags::SUBJECT,
        BindFlags::PREDICATE,
        BindFlags::OBJECT,
    ]
    .iter()
    .enumerate()
    {
        if flags.contains(*flag) {
            cols[col].push(row[slot]);
            col += 1;
        }
    }
}

fn sort_uniq(v: &mut Vec<Rid>) {
    v.sort_unstable();
    v.dedup();
}

impl Engine {
    /// The quad-pattern matching primitive.
    #[allow(clippy::too_many_lines)]
    pub fn bind(&mut self, query: &BindQuery) -> Result<BindResult> {
        let flags = query.flags;

        if !flags.contains(BindFlags::BY_SUBJECT) && !flags.contains(BindFlags::BY_OBJECT) {
            return Err(Error::Protocol("bind without a direction".into()));
        }
        if flags.contains(BindFlags::BY_SUBJECT) && flags.contains(BindFlags::BY_OBJECT) {
            return Err(Error::Protocol("bind with both directions set".into()));
        }
        if query.offset > 0 {
            log::error!("bind called with non-zero offset {}", query.offset);
        }

        let timer = Stopwatch::start();

        let by_subject = flags.contains(BindFlags::BY_SUBJECT);
        let conjunctive = (by_subject
            && !query.subjects.is_empty()
            && query.subjects.len() == query.predicates.len())
            || (!by_subject
                && !query.objects.is_empty()
                && query.objects.len() == query.predicates.len());

        let mut mv = query.models.clone();
        let mut sv = query.subjects.clone();
        let mut pv = query.predicates.clone();
        let mut ov = query.objects.clone();
        if !conjunctive {
            sort_uniq(&mut mv);
            sort_uniq(&mut sv);
            sort_uniq(&mut pv);
            sort_uniq(&mut ov);
        }

        let cols_requested = flags.columns();
        #[allow(clippy::cast_sign_loss)]
        let limit = if query.limit < 0 {
            u64::MAX
        } else if cols_requested == 0 {
            // existence check: one row settles it
            1
        } else {
            query.limit as u64
        };

        let mut cols: Vec<Vec<Rid>> = vec![Vec::new(); cols_requested];
        let mut count: u64 = 0;

        let same = flags.same_mask();
        let exclude_default = flags.contains(BindFlags::EXCLUDE_DEFAULT_GRAPH);
        let default_graph = default_graph_rid();
        let accept = |row: [Rid; 4]| -> bool {
            same.matches(row) && !(exclude_default && row[0] == default_graph)
        };

        // (?m _ _ _): the model hash knows every graph
        if cols_requested == 1
            && flags.contains(BindFlags::MODEL)
            && flags.contains(BindFlags::DISTINCT)
            && mv.is_empty()
            && sv.is_empty()
            && pv.is_empty()
            && ov.is_empty()
        {
            cols[0] = self.models.keys();
            self.note_bind(&timer);

            return Ok(BindResult::Match(cols));
        }

        // (_ _ ?p _): the predicate list knows every predicate
        if cols_requested == 1
            && flags.contains(BindFlags::PREDICATE)
            && flags.contains(BindFlags::DISTINCT)
            && mv.is_empty()
            && sv.is_empty()
            && pv.is_empty()
            && ov.is_empty()
        {
            for n in 0..self.ptrees.len() {
                if count >= limit {
                    break;
                }
                let pred = self.ptrees.pred(n);
                let (subject, _) = self.ptrees.pair_mut(n)?;
                if subject.count() > 0 {
                    cols[0].push(pred);
                    count += 1;
                }
            }
            self.note_bind(&timer);

            return Ok(BindResult::Match(cols));
        }

        // DISTINCT (_ _ p ?o): traverse one tree through a set
        if cols_requested == 1
            && flags.contains(BindFlags::OBJECT)
            && flags.contains(BindFlags::DISTINCT)
            && mv.is_empty()
            && sv.is_empty()
            && pv.len() == 1
            && ov.is_empty()
        {
            let Engine { ptrees, pairs, .. } = self;
            if let Some(tree) = ptrees.subject_mut(pv[0])? {
                let mut set = FxHashSet::default();
                let mut it = tree.traverse(RID_NULL);
                while count < limit {
                    let Some((pk, row)) = it.next(tree, pairs)? else {
                        break;
                    };
                    let quad = [row[0], pk, pv[0], row[1]];
                    if !accept(quad) {
                        continue;
                    }
                    count += 1;
                    set.insert(quad[3]);
                }
                cols[0].extend(set);
            }
            self.note_bind(&timer);

            return Ok(BindResult::Match(cols));
        }

        // (m ...): graph-scoped; walk the graph's own index
        if !mv.is_empty() && sv.is_empty() && pv.is_empty() && ov.is_empty() {
            for &model in &mv {
                if count >= limit {
                    break;
                }

                match self.models.get(model)? {
                    0 => {}
                    1 => {
                        let mut tl = match self.open_tlist(model, false) {
                            Ok(tl) => tl,
                            Err(Error::NotFound(_)) => continue,
                            Err(e) => return Err(e),
                        };
                        tl.rewind();
                        while count < limit {
                            let Some(triple) = tl.next_value()? else {
                                break;
                            };
                            let quad = [model, triple[0], triple[1], triple[2]];
                            if !accept(quad) {
                                continue;
                            }
                            push_row(&mut cols, flags, quad);
                            count += 1;
                        }
                    }
                    node => {
                        let Engine {
                            model_list,
                            ptrees,
                            pairs,
                            ..
                        } = self;

                        // stale triples are weeded out against the trees
                        let mut verify = |triple: [Rid; 3]| -> Result<bool> {
                            let Some(tree) = ptrees.subject_mut(triple[1])? else {
                                return Ok(false);
                            };
                            let Some(mut hit) = tree.search(triple[0], [model, triple[2]])?
                            else {
                                return Ok(false);
                            };

                            Ok(hit.next(pairs)?.is_some())
                        };

                        let mut it = model_list.iter(node)?;
                        while count < limit {
                            let Some(triple) = it.next(model_list, &mut verify)? else {
                                break;
                            };
                            let quad = [model, triple[0], triple[1], triple[2]];
                            if !accept(quad) {
                                continue;
                            }
                            push_row(&mut cols, flags, quad);
                            count += 1;
                        }
                    }
                }
            }

            self.note_bind(&timer);

            return Ok(self.finish(cols_requested, count, cols));
        }

        if by_subject && sv.is_empty() {
            if pv.is_empty() {
                // (_ _ _ _): scan every tree
                for n in 0..self.ptrees.len() {
                    if count >= limit {
                        break;
                    }
                    let pred = self.ptrees.pred(n);
                    let Engine { ptrees, pairs, .. } = self;
                    let (tree, _) = ptrees.pair_mut(n)?;

                    for mi in 0..mv.len().max(1) {
                        let mrid = mv.get(mi).copied().unwrap_or(RID_NULL);
                        let mut it = tree.traverse(mrid);
                        while count < limit {
                            let Some((pk, row)) = it.next(tree, pairs)? else {
                                break;
                            };
                            let quad = [row[0], pk, pred, row[1]];
                            if !accept(quad) {
                                continue;
                            }
                            count += 1;
                            push_row(&mut cols, flags, quad);
                        }
                    }
                }
            } else {
                // (_ _ p _): traverse just the named trees
                for &pred in &pv {
                    if count >= limit {
                        break;
                    }
                    let Engine { ptrees, pairs, .. } = self;
                    let Some(tree) = ptrees.subject_mut(pred)? else {
                        continue;
                    };

                    for mi in 0..mv.len().max(1) {
                        if count >= limit {
                            break;
                        }
                        let mrid = mv.get(mi).copied().unwrap_or(RID_NULL);
                        let mut it = tree.traverse(mrid);
                        while count < limit {
                            let Some((pk, row)) = it.next(tree, pairs)? else {
                                break;
                            };
                            let quad = [row[0], pk, pred, row[1]];
                            if !accept(quad) {
                                continue;
                            }
                            count += 1;
                            push_row(&mut cols, flags, quad);
                        }
                    }
                }
            }
        } else if by_subject && !pv.is_empty() && !sv.is_empty() {
            // (_ s p _): exact leaf lookups
            for pi in 0..pv.len() {
                if count >= limit {
                    break;
                }
                let Engine { ptrees, pairs, .. } = self;
                let Some(tree) = ptrees.subject_mut(pv[pi])? else {
                    continue;
                };

                let subjects: &[Rid] = if conjunctive {
                    // zip: this predicate pairs with its subject
                    std::slice::from_ref(&sv[pi])
                } else {
                    &sv
                };

                for &pk in subjects {
                    if count >= limit {
                        break;
                    }
                    for mi in 0..mv.len().max(1) {
                        if count >= limit {
                            break;
                        }
                        for oi in 0..ov.len().max(1) {
                            let pattern = [
                                mv.get(mi).copied().unwrap_or(RID_NULL),
                                ov.get(oi).copied().unwrap_or(RID_NULL),
                            ];
                            let Some(mut it) = tree.search(pk, pattern)? else {
                                continue;
                            };
                            while count < limit {
                                let Some(row) = it.next(pairs)? else {
                                    break;
                                };
                                let quad = [row[0], pk, pv[pi], row[1]];
                                if !accept(quad) {
                                    continue;
                                }
                                count += 1;
                                push_row(&mut cols, flags, quad);
                            }
                        }
                    }
                }
            }
        } else if !by_subject && !pv.is_empty() && !ov.is_empty() {
            // (_ _ p o): exact leaf lookups in the object direction
            for pi in 0..pv.len() {
                if count >= limit {
                    break;
                }
                let Engine { ptrees, pairs, .. } = self;
                let Some(tree) = ptrees.object_mut(pv[pi])? else {
                    continue;
                };

                let objects: &[Rid] = if conjunctive {
                    std::slice::from_ref(&ov[pi])
                } else {
                    &ov
                };

                for &pk in objects {
                    if count >= limit {
                        break;
                    }
                    for mi in 0..mv.len().max(1) {
                        if count >= limit {
                            break;
                        }
                        for si in 0..sv.len().max(1) {
                            let pattern = [
                                mv.get(mi).copied().unwrap_or(RID_NULL),
                                sv.get(si).copied().unwrap_or(RID_NULL),
                            ];
                            let Some(mut it) = tree.search(pk, pattern)? else {
                                continue;
                            };
                            while count < limit {
                                let Some(row) = it.next(pairs)? else {
                                    break;
                                };
                                let quad = [row[0], row[1], pv[pi], pk];
                                if !accept(quad) {
                                    continue;
                                }
                                count += 1;
                                push_row(&mut cols, flags, quad);
                            }
                        }
                    }
                }
            }
        } else if by_subject {
            // (_ s _ _): no predicate to narrow by; try every tree
            for n in 0..self.ptrees.len() {
                if count >= limit {
                    break;
                }
                let pred = self.ptrees.pred(n);
                let Engine { ptrees, pairs, .. } = self;
                let (tree, _) = ptrees.pair_mut(n)?;

                for &pk in &sv {
                    if count >= limit {
                        break;
                    }
                    for mi in 0..mv.len().max(1) {
                        if count >= limit {
                            break;
                        }
                        for oi in 0..ov.len().max(1) {
                            if count >= limit {
                                break;
                            }
                            let pattern = [
                                mv.get(mi).copied().unwrap_or(RID_NULL),
                                ov.get(oi).copied().unwrap_or(RID_NULL),
                            ];
                            let Some(mut it) = tree.search(pk, pattern)? else {
                                continue;
                            };
                            while count < limit {
                                let Some(row) = it.next(pairs)? else {
                                    break;
                                };
                                let quad = [row[0], pk, pred, row[1]];
                                if !accept(quad) {
                                    continue;
                                }
                                count += 1;
                                push_row(&mut cols, flags, quad);
                            }
                        }
                    }
                }
            }
        } else {
            // (_ _ _ o) by object: try every tree in the object direction
            for n in 0..self.ptrees.len() {
                if count >= limit {
                    break;
                }
                let pred = self.ptrees.pred(n);
                let Engine { ptrees, pairs, .. } = self;
                let (_, tree) = ptrees.pair_mut(n)?;

                for &pk in &ov {
                    if count >= limit {
                        break;
                    }
                    for mi in 0..mv.len().max(1) {
                        if count >= limit {
                            break;
                        }
                        for si in 0..sv.len().max(1) {
                            if count >= limit {
                                break;
                            }
                            let pattern = [
                                mv.get(mi).copied().unwrap_or(RID_NULL),
                                sv.get(si).copied().unwrap_or(RID_NULL),
                            ];
                            let Some(mut it) = tree.search(pk, pattern)? else {
                                continue;
                            };
                            while count < limit {
                                let Some(row) = it.next(pairs)? else {
                                    break;
                                };
                                let quad = [row[0], row[1], pred, pk];
                                if !accept(quad) {
                                    continue;
                                }
                                count += 1;
                                push_row(&mut cols, flags, quad);
                            }
                        }
                    }
                }
            }
        }

        self.note_bind(&timer);

        Ok(self.finish(cols_requested, count, cols))
    }

    fn finish(&self, cols_requested: usize, count: u64, cols: Vec<Vec<Rid>>) -> BindResult {
        if count == 0 && cols_requested == 0 {
            BindResult::NoMatch
        } else {
            BindResult::Match(cols)
        }
    }

    fn note_bind(&mut self, timer: &Stopwatch) {
        self.query_timing.bind_count += 1;
        self.query_timing.bind += timer.lap();
    }

    /// Intersection primitive: subjects that co-occur with every given
    /// `(p_i, o_i)` pair, optionally narrowed by incoming M and S sets.
    /// Returns at most the `(M, S)` columns.
    ///
    /// Despite the shared signature this is not `bind`; object-direction
    /// binding is a documented limit of this branch.
    pub fn reverse_bind(&mut self, query: &BindQuery) -> Result<BindResult> {
        let flags = query.flags;

        if !flags.contains(BindFlags::BY_SUBJECT) && !flags.contains(BindFlags::BY_OBJECT) {
            return Err(Error::Protocol("reverse bind without a direction".into()));
        }
        if flags.contains(BindFlags::BY_SUBJECT) && flags.contains(BindFlags::BY_OBJECT) {
            return Err(Error::Protocol("reverse bind with both directions set".into()));
        }
        if flags.contains(BindFlags::BY_OBJECT) {
            return Err(Error::Unsupported("reverse bind by object"));
        }

        let timer = Stopwatch::start();

        let iters = query.objects.len();
        if !query.predicates.is_empty() && query.predicates.len() != iters {
            return Err(Error::Protocol(
                "reverse bind with length(p) != length(o)".into(),
            ));
        }

        #[allow(clippy::cast_sign_loss)]
        let limit = if query.limit < 0 {
            usize::MAX
        } else {
            query.limit as usize
        };

        // one object-direction probe per (p, o), narrowest first
        let mut probes = Vec::with_capacity(iters);
        for i in 0..iters {
            let pattern = [RID_NULL, RID_NULL];
            let probe = match query.predicates.get(i) {
                Some(&pred) => {
                    let Engine { ptrees, .. } = self;
                    match ptrees.object_mut(pred)? {
                        Some(tree) => tree.search(query.objects[i], pattern)?,
                        None => None,
                    }
                }
                None => None,
            };
            probes.push(probe);
        }
        probes.sort_by_key(|p| {
            p.as_ref()
                .map_or(u32::MAX, crate::ptree::SearchIter::chain_length)
        });

        let mut m_filter: Option<FxHashSet<Rid>> = if query.models.is_empty() {
            None
        } else {
            Some(query.models.iter().copied().collect())
        };
        let mut s_filter: Option<FxHashSet<Rid>> = if query.subjects.is_empty() {
            None
        } else {
            Some(query.subjects.iter().copied().collect())
        };

        let mut final_m: Vec<Rid> = query.models.clone();
        let mut final_s: Vec<Rid> = query.subjects.clone();

        for probe in probes {
            let mut inter_m = Vec::new();
            let mut inter_s = Vec::new();

            if let Some(mut probe) = probe {
                while let Some(row) = probe.next(&self.pairs)? {
                    let (graph, subject) = (row[0], row[1]);
                    if m_filter.as_ref().is_some_and(|f| !f.contains(&graph)) {
                        continue;
                    }
                    if s_filter.as_ref().is_some_and(|f| !f.contains(&subject)) {
                        continue;
                    }
                    inter_m.push(graph);
                    inter_s.push(subject);
                }
            }

            if flags.contains(BindFlags::MODEL) {
                m_filter = Some(inter_m.iter().copied().collect());
                final_m = inter_m;
            }
            if flags.contains(BindFlags::SUBJECT) {
                s_filter = Some(inter_s.iter().copied().collect());
                final_s = inter_s;
            }
        }

        self.note_bind(&timer);

        let cols = flags.columns();
        if cols == 1 && flags.contains(BindFlags::SUBJECT) {
            final_s.truncate(limit);

            return Ok(BindResult::Match(vec![final_s]));
        }
        if cols == 2 && flags.contains(BindFlags::SUBJECT) && flags.contains(BindFlags::MODEL) {
            final_m.truncate(limit);
            final_s.truncate(limit);

            return Ok(BindResult::Match(vec![final_m, final_s]));
        }

        Err(Error::Protocol(format!(
            "reverse bind requesting unsupported slots ({cols} columns)"
        )))
    }

    /// Looks up the resources behind a set of RIDs. Blank nodes are
    /// synthesized, everything else comes from the resource hash.
    pub fn resolve(&mut self, rids: &[Rid]) -> Result<Vec<Resource>> {
        let timer = Stopwatch::start();

        let lookups: Vec<Rid> = rids.iter().copied().filter(|r| !r.is_bnode()).collect();
        let mut found = self.res.get_multi(&lookups)?.into_iter();

        let mut out = Vec::with_capacity(rids.len());
        for &rid in rids {
            if rid.is_bnode() {
                out.push(Resource::bnode(rid));
            } else {
                out.push(found.next().ok_or_else(|| {
                    Error::Corruption("resource lookup shrank".into())
                })?);
            }
        }

        self.query_timing.resolve_count += 1;
        self.query_timing.resolve += timer.lap();

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn flag_columns() {
        assert_eq!(0, BindFlags::BY_SUBJECT.columns());
        assert_eq!(1, (BindFlags::MODEL | BindFlags::BY_SUBJECT).columns());
        assert_eq!(
            4,
            (BindFlags::MODEL | BindFlags::SUBJECT | BindFlags::PREDICATE | BindFlags::OBJECT)
                .columns(),
        );
    }

    #[test]
    fn same_mask_roundtrips_through_flags() {
        for bits in 0..15 {
            let mask = SameMask::from_bits(bits);
            let flags = BindFlags::BY_SUBJECT.with_same(mask);
            assert_eq!(mask, flags.same_mask());
        }

        // unknown values degrade to no constraint
        assert_eq!(SameMask::Xxxx, SameMask::from_bits(15));
    }

    #[test]
    fn same_mask_equivalence_classes() {
        let a = Rid(1);
        let b = Rid(2);

        assert!(SameMask::Xxxx.matches([a, b, a, b]));
        assert!(SameMask::Xxaa.matches([a, b, b, b]));
        assert!(!SameMask::Xxaa.matches([a, b, a, b]));
        assert!(SameMask::Aabb.matches([a, a, b, b]));
        assert!(!SameMask::Aabb.matches([a, b, a, b]));
        assert!(SameMask::Abba.matches([a, b, b, a]));
        assert!(SameMask::Aaaa.matches([a, a, a, a]));
        assert!(!SameMask::Aaaa.matches([a, a, a, b]));
    }

    #[test]
    fn no_match_only_without_columns() {
        let dir = tempfile::tempdir().unwrap();
        let config = crate::Config::new(dir.path());
        crate::create_store(&config, "qtest", &crate::StoreOptions::new(1)).unwrap();
        let mut engine = Engine::open(&config, "qtest", 0).unwrap();

        let with_columns = BindQuery::everything();
        assert!(engine.bind(&with_columns).unwrap().is_match());

        let without_columns = BindQuery {
            flags: BindFlags::BY_SUBJECT,
            ..BindQuery::everything()
        };
        assert_eq!(BindResult::NoMatch, engine.bind(&without_columns).unwrap());
    }
}

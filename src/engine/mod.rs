// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The engine facade: everything one open segment can do.
//!
//! An [`Engine`] owns the index files of a single segment plus the
//! registry of per-predicate trees, enforces the single-writer rule with
//! an advisory lock on the segment directory, and exposes the operations
//! the network layer calls into: imports, bind, resolve and graph
//! deletion.

pub mod import;
pub mod query;

use crate::{
    config::Config,
    file,
    list::List,
    lock::{FileLock, LockMode},
    metadata::{self, Metadata},
    mhash::ModelHash,
    ptable::Ptable,
    ptree::Ptree,
    quad::Quad,
    rhash::ResourceHash,
    rid::{Rid, HASH_FUNCTION},
    tbchain::TripleBlockChain,
    timing::{ImportTiming, QueryTiming},
    tlist::TripleList,
    Error, Resource, Result,
};
use rustc_hash::FxHashMap;
use std::{collections::VecDeque, path::PathBuf};

/// Open predicate tree pairs kept before the oldest is closed.
pub const MAX_OPEN_PTREES: usize = 300;

/// Staged resources before the resource hash is written.
pub(crate) const RES_BUFFER_SIZE: usize = 10240;

/// Staged quads before a commit spills to the pending lists.
pub(crate) const QUAD_BUFFER_SIZE: usize = 10240;

/// Pending import lists, partitioned by predicate bucket.
pub(crate) const PENDED_LISTS: usize = 16;

pub(crate) struct PtreeRef {
    pub pred: Rid,
    pub subject: Option<Ptree>,
    pub object: Option<Ptree>,
}

/// All predicate trees of a segment, open or not, in registration order.
///
/// At most [`MAX_OPEN_PTREES`] pairs are open at once; opening one more
/// closes the oldest-opened pair.
pub(crate) struct PtreeRegistry {
    seg_dir: PathBuf,
    table_tag: u64,
    refs: Vec<PtreeRef>,
    by_pred: FxHashMap<Rid, usize>,
    open_order: VecDeque<usize>,
}

impl PtreeRegistry {
    fn new(seg_dir: PathBuf, table_tag: u64) -> Self {
        Self {
            seg_dir,
            table_tag,
            refs: Vec::new(),
            by_pred: FxHashMap::default(),
            open_order: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn pred(&self, n: usize) -> Rid {
        self.refs[n].pred
    }

    pub fn find(&self, pred: Rid) -> Option<usize> {
        self.by_pred.get(&pred).copied()
    }

    /// Adds a predicate without touching the disk.
    pub fn register(&mut self, pred: Rid) -> usize {
        debug_assert!(self.find(pred).is_none());

        let n = self.refs.len();
        self.refs.push(PtreeRef {
            pred,
            subject: None,
            object: None,
        });
        self.by_pred.insert(pred, n);

        n
    }

    /// Opens the pair at `n`, evicting the oldest pair when at capacity.
    pub fn ensure_open(&mut self, n: usize) -> Result<()> {
        if self.refs[n].subject.is_some() {
            return Ok(());
        }

        if self.open_order.len() >= MAX_OPEN_PTREES {
            if let Some(oldest) = self.open_order.pop_front() {
                let toclose = &mut self.refs[oldest];
                log::trace!("closing ptree pair for {}", toclose.pred);
                toclose.subject = None;
                toclose.object = None;
            }
        }

        let pred = self.refs[n].pred;
        let subject = Ptree::open(
            &file::ptree_path(&self.seg_dir, 's', pred),
            true,
            true,
            self.table_tag,
        )?;
        let object = Ptree::open(
            &file::ptree_path(&self.seg_dir, 'o', pred),
            true,
            true,
            self.table_tag,
        )?;

        self.refs[n].subject = Some(subject);
        self.refs[n].object = Some(object);
        self.open_order.push_back(n);

        Ok(())
    }

    /// Both directions of the pair at `n`, opening it first if needed.
    pub fn pair_mut(&mut self, n: usize) -> Result<(&mut Ptree, &mut Ptree)> {
        self.ensure_open(n)?;

        let r = &mut self.refs[n];
        match (&mut r.subject, &mut r.object) {
            (Some(s), Some(o)) => Ok((s, o)),
            _ => Err(Error::Corruption(format!(
                "ptree pair for {} did not open",
                r.pred
            ))),
        }
    }

    /// Subject-direction tree for a predicate, `None` when the predicate
    /// has no index in this segment.
    pub fn subject_mut(&mut self, pred: Rid) -> Result<Option<&mut Ptree>> {
        match self.find(pred) {
            Some(n) => Ok(Some(self.pair_mut(n)?.0)),
            None => Ok(None),
        }
    }

    pub fn object_mut(&mut self, pred: Rid) -> Result<Option<&mut Ptree>> {
        match self.find(pred) {
            Some(n) => Ok(Some(self.pair_mut(n)?.1)),
            None => Ok(None),
        }
    }

    pub fn sync_open(&self) -> Result<()> {
        for r in &self.refs {
            if let Some(tree) = &r.subject {
                tree.sync()?;
            }
            if let Some(tree) = &r.object {
                tree.sync()?;
            }
        }

        Ok(())
    }

    /// Unlinks every tree file and forgets all predicates.
    fn unlink_all(&mut self) -> Result<()> {
        for n in 0..self.refs.len() {
            self.ensure_open(n)?;
            let r = &mut self.refs[n];
            if let Some(tree) = r.subject.take() {
                tree.unlink()?;
            }
            if let Some(tree) = r.object.take() {
                tree.unlink()?;
            }
        }

        self.refs.clear();
        self.by_pred.clear();
        self.open_order.clear();

        Ok(())
    }
}

pub(crate) struct BufferedQuad {
    pub quad: Quad,
    pub skip: bool,
}

/// Per-index row counts returned by [`Engine::size`].
#[derive(Copy, Clone, Debug, Default)]
pub struct DataSize {
    pub quads_s: u64,
    pub quads_o: u64,
    pub resources: u64,
    pub models: u64,
}

/// Findings of [`Engine::check_consistency`].
#[derive(Copy, Clone, Debug, Default)]
pub struct CheckReport {
    /// Rows across all subject-direction trees
    pub rows: u64,

    /// Triples across all graph chains
    pub triples: u64,

    /// Chain-table rows in no chain and not on the free list
    pub ptable_leaks: u32,

    /// Triple blocks that were unreachable (now reclaimed)
    pub tbchain_leaks: u32,
}

/// One open segment of a KB.
pub struct Engine {
    pub(crate) config: Config,
    pub(crate) kb_name: String,
    pub(crate) segment: u32,
    pub(crate) segments: u32,
    pub(crate) seg_dir: PathBuf,
    pub(crate) metadata: Metadata,
    pub(crate) model_files: bool,

    pub(crate) res: ResourceHash,
    pub(crate) models: ModelHash,
    pub(crate) model_list: TripleBlockChain,
    pub(crate) pairs: Ptable,
    pub(crate) predicates: List<Rid>,
    pub(crate) ptrees: PtreeRegistry,

    pub(crate) res_buffer: Vec<Resource>,
    pub(crate) quad_buffer: Vec<BufferedQuad>,
    pub(crate) pended: Option<Vec<List<Quad>>>,

    pub(crate) approx_size: u64,
    pub(crate) importing: bool,
    pub(crate) import_timing: ImportTiming,
    pub(crate) query_timing: QueryTiming,

    _dir_lock: FileLock,
}

impl Engine {
    /// Opens one segment of a KB for reading and writing.
    ///
    /// Checks that the store's metadata matches this binary (hash
    /// function, store type, format version) and takes the exclusive
    /// per-segment lock.
    pub fn open(config: &Config, kb_name: &str, segment: u32) -> Result<Self> {
        let metadata = Metadata::open(&file::metadata_path(config, kb_name), false)
            .map_err(|e| match e {
                Error::NotFound(_) => Error::NotFound(format!("KB {kb_name}")),
                other => other,
            })?;

        let Some(stored_name) = metadata.get_string(metadata::MD_NAME) else {
            return Err(Error::Corruption(
                "no KB name in metadata, does the KB exist?".into(),
            ));
        };
        if stored_name != kb_name {
            return Err(Error::Corruption(format!(
                "metadata names KB {stored_name:?}, not {kb_name:?}"
            )));
        }

        let hashfunc = metadata.get_string(metadata::MD_HASHFUNC).unwrap_or("MD5");
        if hashfunc != HASH_FUNCTION {
            return Err(Error::Corruption(format!(
                "store uses hash function {hashfunc}, this binary uses {HASH_FUNCTION}"
            )));
        }

        let store_type = metadata
            .get_string(metadata::MD_STORE)
            .unwrap_or("semi-native");
        if store_type != "native" {
            return Err(Error::Corruption(format!(
                "tried to open {store_type} store with the native engine"
            )));
        }

        let version = metadata.get_int(metadata::MD_VERSION, -1);
        if !(metadata::EARLIEST_TABLE_VERSION..=metadata::CURRENT_TABLE_VERSION)
            .contains(&version)
        {
            return Err(Error::Corruption(format!(
                "table format version {version} is outside [{}, {}]",
                metadata::EARLIEST_TABLE_VERSION,
                metadata::CURRENT_TABLE_VERSION,
            )));
        }

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let segments = metadata.get_int(metadata::MD_SEGMENTS, 0) as u32;
        if segments == 0 {
            return Err(Error::Corruption("KB has no segments".into()));
        }
        if segment >= segments {
            return Err(Error::NotFound(format!(
                "segment {segment} of {segments}"
            )));
        }

        let model_files = metadata.get_bool(metadata::MD_MODEL_FILES, false);

        let seg_dir = file::segment_dir(config, kb_name, segment);
        if !seg_dir.is_dir() {
            return Err(Error::NotFound(format!(
                "segment directory {}",
                seg_dir.display()
            )));
        }

        let dir_lock = FileLock::take(&file::lock_path(&seg_dir, "seg"), LockMode::Exclusive)?;

        let res = ResourceHash::open(
            &file::rhash_path(&seg_dir, "res"),
            &file::lex_path(&seg_dir, "res"),
            true,
            true,
        )?;
        let models = ModelHash::open(&file::mhash_path(&seg_dir, "models"), true, true)?;
        let model_list =
            TripleBlockChain::open(&file::tbchain_path(&seg_dir, "mlist"), true, true)?;
        let pairs = Ptable::open(&file::ptable_path(&seg_dir, "pairs"), true, true)?;
        let mut predicates: List<Rid> =
            List::open(&file::list_path(&seg_dir, "predicates"), true, true)?;

        let mut ptrees = PtreeRegistry::new(seg_dir.clone(), pairs.tag());
        predicates.rewind();
        while let Some(pred) = predicates.next_value()? {
            if ptrees.find(pred).is_none() {
                ptrees.register(pred);
            } else {
                log::warn!("predicate {pred} listed twice in segment {segment}");
            }
        }

        log::debug!(
            "opened {kb_name}:{segment:04x} with {} predicates",
            ptrees.len(),
        );

        Ok(Self {
            config: config.clone(),
            kb_name: kb_name.into(),
            segment,
            segments,
            seg_dir,
            metadata,
            model_files,
            res,
            models,
            model_list,
            pairs,
            predicates,
            ptrees,
            res_buffer: Vec::new(),
            quad_buffer: Vec::new(),
            pended: None,
            approx_size: 0,
            importing: false,
            import_timing: ImportTiming::default(),
            query_timing: QueryTiming::default(),
            _dir_lock: dir_lock,
        })
    }

    #[must_use]
    pub fn kb_name(&self) -> &str {
        &self.kb_name
    }

    #[must_use]
    pub fn segment(&self) -> u32 {
        self.segment
    }

    #[must_use]
    pub fn segments(&self) -> u32 {
        self.segments
    }

    /// Whether an import run is currently open.
    #[must_use]
    pub fn is_importing(&self) -> bool {
        self.importing
    }

    /// Closes and reopens every index file (used after offline
    /// maintenance, on `SIGUSR2`).
    pub fn reopen(self) -> Result<Self> {
        let config = self.config.clone();
        let kb_name = self.kb_name.clone();
        let segment = self.segment;

        // locks die with the old handles
        drop(self);

        Self::open(&config, &kb_name, segment)
    }

    /// Registers a predicate, creating its tree pair and recording it in
    /// the predicate list.
    pub(crate) fn open_ptree_pair(&mut self, pred: Rid) -> Result<usize> {
        if let Some(n) = self.ptrees.find(pred) {
            return Ok(n);
        }

        let n = self.ptrees.register(pred);
        self.predicates.add(pred)?;
        self.ptrees.ensure_open(n)?;

        let (subject, _) = self.ptrees.pair_mut(n)?;
        self.approx_size += subject.count();

        Ok(n)
    }

    /// Reserves a contiguous range of blank-node ids, persistent across
    /// restarts. Returns `[from, to)`.
    pub fn bnode_alloc(&mut self, count: u64) -> Result<(u64, u64)> {
        #[allow(clippy::cast_sign_loss)]
        let from = self.metadata.get_int(metadata::MD_BNODE, 1).max(1) as u64;
        let to = from + count;

        self.metadata.set(metadata::MD_BNODE, to.to_string());
        self.metadata.flush()?;

        Ok((from, to))
    }

    /// Makes sure graph entries exist ahead of an import; only needed
    /// for stores whose graphs live in their own files.
    pub fn new_models(&mut self, models: &[Rid]) -> Result<()> {
        for &model in models {
            if self.model_files && self.models.get(model)? == 0 {
                self.open_tlist(model, true)?;
                self.models.put(model, 1)?;
            }
        }
        self.models.flush()?;

        Ok(())
    }

    /// Transactions are not supported in this branch; the interface
    /// exists so callers get a well-defined error.
    pub fn transaction(&mut self, _op: u8) -> Result<()> {
        Err(Error::Unsupported("transactions"))
    }

    /// Row counts across all indexes of this segment.
    pub fn size(&mut self) -> Result<DataSize> {
        let mut size = DataSize {
            resources: u64::from(self.res.count()),
            models: u64::from(self.models.count()),
            ..DataSize::default()
        };

        for n in 0..self.ptrees.len() {
            let (subject, object) = self.ptrees.pair_mut(n)?;
            size.quads_s += subject.count();
            size.quads_o += object.count();
        }

        Ok(size)
    }

    #[must_use]
    pub fn import_times(&self) -> ImportTiming {
        self.import_timing
    }

    #[must_use]
    pub fn query_times(&self) -> QueryTiming {
        self.query_timing
    }

    /// Graph usage tag straight from the model hash.
    pub fn model_usage(&self, model: Rid) -> Result<u32> {
        self.models.get(model)
    }

    pub(crate) fn open_tlist(&self, model: Rid, create: bool) -> Result<TripleList> {
        TripleList::open(&file::tlist_path(&self.seg_dir, model), true, create)
    }

    /// Unlinks every index file of the segment and recreates them empty.
    pub(crate) fn wipe(&mut self) -> Result<()> {
        log::info!("wiping segment {:04x} of {}", self.segment, self.kb_name);

        self.ptrees.unlink_all()?;
        self.predicates.truncate()?;

        let tlists = file::tlist_root(&self.seg_dir);
        if tlists.is_dir() {
            std::fs::remove_dir_all(&tlists)?;
        }

        // recreate in place: remove the name first, then open a fresh
        // file under it; the old handle is dropped by the assignment
        let path = file::ptable_path(&self.seg_dir, "pairs");
        std::fs::remove_file(&path)?;
        self.pairs = Ptable::open(&path, true, true)?;
        self.ptrees = PtreeRegistry::new(self.seg_dir.clone(), self.pairs.tag());

        let path = file::tbchain_path(&self.seg_dir, "mlist");
        std::fs::remove_file(&path)?;
        self.model_list = TripleBlockChain::open(&path, true, true)?;

        let path = file::mhash_path(&self.seg_dir, "models");
        std::fs::remove_file(&path)?;
        self.models = ModelHash::open(&path, true, true)?;

        let rhash_path = file::rhash_path(&self.seg_dir, "res");
        let lex_path = file::lex_path(&self.seg_dir, "res");
        std::fs::remove_file(&rhash_path)?;
        std::fs::remove_file(&lex_path)?;
        self.res = ResourceHash::open(&rhash_path, &lex_path, true, true)?;

        self.approx_size = 0;

        Ok(())
    }

    /// Cross-checks every structure of the segment: leaf lengths against
    /// chain lengths, row ownership, block reachability. Orphaned rows
    /// and blocks are counted (and blocks reclaimed onto the free list).
    pub fn check_consistency(&mut self) -> Result<CheckReport> {
        let mut report = CheckReport::default();

        let mut check = self.pairs.start_check();
        for n in 0..self.ptrees.len() {
            let Engine { ptrees, pairs, .. } = self;
            let (subject, object) = ptrees.pair_mut(n)?;
            report.rows += subject.check(pairs, &mut check)?.rows;
            object.check(pairs, &mut check)?;
        }
        report.ptable_leaks = self.pairs.check_leaks(&mut check)?;

        let mut marks = Vec::new();
        for (_, val) in self.models.entries() {
            if val > 1 {
                report.triples += self.model_list.mark_chain(&mut marks, val)?;
            }
        }
        report.tbchain_leaks = self.model_list.reclaim_leaks(&mut marks)?;

        Ok(report)
    }

    /// Flushes everything to disk without closing.
    pub fn sync(&mut self) -> Result<()> {
        self.res.flush()?;
        self.models.flush()?;
        self.model_list.sync()?;
        self.pairs.sync()?;
        self.predicates.sync()?;
        self.ptrees.sync_open()?;

        Ok(())
    }
}

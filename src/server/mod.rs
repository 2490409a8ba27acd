// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The backend worker: serves one KB's segments over TCP.
//!
//! One thread per connection; all connections share the per-segment
//! engines behind a mutex, which preserves the single-writer-per-segment
//! invariant the on-disk structures rely on. Connections must
//! authenticate before anything but NO_OP is served. A `SIGUSR2` makes
//! the server reopen its index files at the next idle moment.

use crate::{
    coding::{Decode, DecodeError, Encode},
    config::Config,
    engine::Engine,
    file,
    lock::{FileLock, LockMode},
    metadata::{self, Metadata},
    protocol::{Frame, Opcode, PayloadReader, PayloadWriter, FEATURE_STRING},
    quad::Quad,
    rid::Rid,
    setup::hex,
    BindFlags, BindQuery, BindResult, Error, Resource, Result,
};
use rustc_hash::FxHashMap;
use std::{
    io::{BufReader, BufWriter, Write},
    net::{TcpListener, TcpStream},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

static RELOAD_REQUESTED: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn on_sigusr2(_sig: libc::c_int) {
    RELOAD_REQUESTED.store(true, Ordering::SeqCst);
}

#[cfg(unix)]
fn install_reload_handler() {
    // SAFETY: the handler only touches an atomic
    unsafe {
        libc::signal(libc::SIGUSR2, on_sigusr2 as libc::sighandler_t);
    }
}

#[cfg(not(unix))]
fn install_reload_handler() {}

struct Shared {
    config: Config,
    kb_name: String,
    auth_hash: String,
    segments: u32,
    primary: Vec<u32>,
    mirror: Vec<u32>,
    engines: Mutex<FxHashMap<u32, Engine>>,
}

impl Shared {
    fn owns_segment(&self, segment: u32) -> bool {
        self.primary.contains(&segment) || self.mirror.contains(&segment)
    }

    /// Runs `f` with the engine for `segment`, opening it on first use.
    fn with_engine<T>(&self, segment: u32, f: impl FnOnce(&mut Engine) -> Result<T>) -> Result<T> {
        if !self.owns_segment(segment) {
            return Err(Error::NotFound(format!(
                "segment {segment} is not served by this node"
            )));
        }

        let mut engines = self
            .engines
            .lock()
            .map_err(|_| Error::Protocol("engine mutex poisoned".into()))?;

        if RELOAD_REQUESTED.swap(false, Ordering::SeqCst) {
            log::info!("reload requested, reopening index files");
            let open: Vec<u32> = engines.keys().copied().collect();
            for seg in open {
                if let Some(engine) = engines.remove(&seg) {
                    engines.insert(seg, engine.reopen()?);
                }
            }
        }

        if !engines.contains_key(&segment) {
            let engine = Engine::open(&self.config, &self.kb_name, segment)?;
            engines.insert(segment, engine);
        }

        let engine = engines
            .get_mut(&segment)
            .ok_or_else(|| Error::NotFound(format!("segment {segment}")))?;

        f(engine)
    }
}

/// Runs the backend worker for a KB. Blocks until the listener fails.
pub fn serve(config: &Config, kb_name: &str) -> Result<()> {
    let md = Metadata::open(&file::metadata_path(config, kb_name), false).map_err(|e| match e {
        Error::NotFound(_) => Error::NotFound(format!("KB {kb_name}")),
        other => other,
    })?;

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let shared = Arc::new(Shared {
        config: config.clone(),
        kb_name: kb_name.into(),
        auth_hash: md.get_string(metadata::MD_HASH).unwrap_or("").into(),
        segments: md.get_int(metadata::MD_SEGMENTS, 0) as u32,
        primary: md.get_int_vector(metadata::MD_SEGMENT_P),
        mirror: md.get_int_vector(metadata::MD_SEGMENT_M),
        engines: Mutex::new(FxHashMap::default()),
    });

    // runtime.info doubles as the "one worker per KB" lock
    let runtime_path = file::runtime_info_path(config, kb_name);
    let runtime_lock = FileLock::take(&runtime_path, LockMode::Exclusive).map_err(|e| match e {
        Error::Conflict(_) => Error::Conflict(format!("KB {kb_name} is already being served")),
        other => other,
    })?;

    let listener = TcpListener::bind(("0.0.0.0", config.port))?;
    let local_port = listener.local_addr()?.port();
    std::fs::write(
        &runtime_path,
        format!("{} {local_port}\n", std::process::id()),
    )?;

    install_reload_handler();

    log::info!("serving KB {kb_name} on port {local_port}");

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || {
                    if let Err(e) = handle_connection(&shared, stream) {
                        log::warn!("connection ended: {e}");
                    }
                });
            }
            Err(e) => {
                log::error!("accept failed: {e}");
            }
        }
    }

    drop(runtime_lock);

    Ok(())
}

fn handle_connection(shared: &Shared, stream: TcpStream) -> Result<()> {
    let peer = stream.peer_addr()?;
    log::debug!("connection from {peer}");

    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream);
    let mut authed = shared.auth_hash.is_empty();

    loop {
        let frame = match Frame::decode_from(&mut reader) {
            Ok(frame) => frame,
            Err(DecodeError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // clean disconnect
                return Ok(());
            }
            Err(e) => {
                log::warn!("{peer}: unreadable frame: {e}");
                Frame::error(0, "unreadable frame").encode_into(&mut writer)?;
                writer.flush()?;

                return Ok(());
            }
        };

        let segment = frame.segment;
        let reply = match dispatch(shared, &mut authed, frame) {
            Ok(reply) => reply,
            Err(Error::Auth) => {
                log::warn!("{peer}: authentication failed");
                Frame::error(segment, "access denied").encode_into(&mut writer)?;
                writer.flush()?;

                return Ok(());
            }
            Err(e) => {
                log::warn!("{peer}: {e}");

                Some(Frame::error(segment, &e.to_string()))
            }
        };

        if let Some(reply) = reply {
            reply.encode_into(&mut writer)?;
            writer.flush()?;
        }
    }
}

fn read_bind_query(payload: &[u8]) -> Result<BindQuery> {
    let mut r = PayloadReader::new(payload);

    let flags = BindFlags(r.u32()?);
    let offset = r.i32()?;
    let limit = i64::from(r.i32()?);
    let models = r.rid_vector()?;
    let subjects = r.rid_vector()?;
    let predicates = r.rid_vector()?;
    let objects = r.rid_vector()?;

    Ok(BindQuery {
        flags,
        models,
        subjects,
        predicates,
        objects,
        offset,
        limit,
    })
}

fn bind_reply(segment: u32, result: &BindResult) -> Frame {
    match result {
        BindResult::NoMatch => Frame::empty(Opcode::NoMatch, segment),
        BindResult::Match(cols) => {
            let mut w = PayloadWriter::new();
            #[allow(clippy::cast_possible_truncation)]
            w.u32(cols.len() as u32);
            w.u64(cols.first().map_or(0, Vec::len) as u64);
            for col in cols {
                for rid in col {
                    w.rid(*rid);
                }
            }

            Frame::new(Opcode::BindList, segment, w.finish())
        }
    }
}

fn resource_list_reply(segment: u32, resources: &[Resource]) -> Frame {
    let mut w = PayloadWriter::new();
    #[allow(clippy::cast_possible_truncation)]
    w.u32(resources.len() as u32);
    for res in resources {
        w.rid(res.rid);
        w.rid(res.attr);
        w.string(&res.lex);
    }

    Frame::new(Opcode::ResourceList, segment, w.finish())
}

fn read_resources(payload: &[u8]) -> Result<Vec<Resource>> {
    let mut r = PayloadReader::new(payload);
    let count = r.u32()? as usize;

    let mut resources = Vec::with_capacity(count.min(65536));
    for _ in 0..count {
        let rid = r.rid()?;
        let attr = r.rid()?;
        let lex = r.string()?;
        resources.push(Resource { rid, attr, lex });
    }

    Ok(resources)
}

fn read_quads(payload: &[u8]) -> Result<Vec<Quad>> {
    let mut r = PayloadReader::new(payload);
    let count = r.u32()? as usize;

    let mut quads = Vec::with_capacity(count.min(65536));
    for _ in 0..count {
        quads.push(Quad::new(r.rid()?, r.rid()?, r.rid()?, r.rid()?));
    }

    Ok(quads)
}

/// Maps one request frame to at most one reply frame.
#[allow(clippy::too_many_lines)]
fn dispatch(shared: &Shared, authed: &mut bool, frame: Frame) -> Result<Option<Frame>> {
    let segment = frame.segment;

    // the version handshake must work before authentication
    if frame.op == Opcode::NoOp {
        return Ok(Some(Frame::empty(Opcode::DoneOk, segment)));
    }

    if frame.op == Opcode::Auth {
        let mut r = PayloadReader::new(&frame.payload);
        let digest = r.bytes(16)?;

        let expected = &shared.auth_hash;
        if !expected.is_empty() && hex(digest) != *expected {
            return Err(Error::Auth);
        }

        *authed = true;
        let mut w = PayloadWriter::new();
        w.string(FEATURE_STRING);

        return Ok(Some(Frame::new(Opcode::DoneOk, segment, w.finish())));
    }

    if !*authed {
        return Err(Error::Protocol("command before AUTH".into()));
    }

    match frame.op {
        Opcode::InsertResource => {
            let resources = read_resources(&frame.payload)?;
            // semi-async: no reply
            shared.with_engine(segment, |engine| engine.res_import(&resources))?;

            Ok(None)
        }

        Opcode::CommitResource => {
            shared.with_engine(segment, Engine::res_import_commit)?;

            Ok(Some(Frame::empty(Opcode::DoneOk, segment)))
        }

        Opcode::InsertQuad => {
            let quads = read_quads(&frame.payload)?;
            shared.with_engine(segment, |engine| engine.quad_import(&quads))?;

            Ok(None)
        }

        Opcode::CommitQuad => {
            shared.with_engine(segment, Engine::quad_import_commit)?;

            Ok(Some(Frame::empty(Opcode::DoneOk, segment)))
        }

        Opcode::StartImport => {
            shared.with_engine(segment, Engine::start_import)?;

            Ok(Some(Frame::empty(Opcode::DoneOk, segment)))
        }

        Opcode::StopImport => {
            shared.with_engine(segment, Engine::stop_import)?;

            Ok(Some(Frame::empty(Opcode::DoneOk, segment)))
        }

        Opcode::BindLimit => {
            let query = read_bind_query(&frame.payload)?;
            let result = shared.with_engine(segment, |engine| engine.bind(&query))?;

            Ok(Some(bind_reply(segment, &result)))
        }

        Opcode::ReverseBind => {
            let query = read_bind_query(&frame.payload)?;
            let result = shared.with_engine(segment, |engine| engine.reverse_bind(&query))?;

            Ok(Some(bind_reply(segment, &result)))
        }

        Opcode::Resolve | Opcode::ResolveAttr => {
            let mut r = PayloadReader::new(&frame.payload);
            let rids = r.rid_vector()?;
            let resources = shared.with_engine(segment, |engine| engine.resolve(&rids))?;

            Ok(Some(resource_list_reply(segment, &resources)))
        }

        Opcode::DeleteModels => {
            let mut r = PayloadReader::new(&frame.payload);
            let models = r.rid_vector()?;
            shared.with_engine(segment, |engine| engine.delete_models(&models))?;

            Ok(Some(Frame::empty(Opcode::DoneOk, segment)))
        }

        Opcode::DeleteQuads => {
            let mut r = PayloadReader::new(&frame.payload);
            let models = r.rid_vector()?;
            let subjects = r.rid_vector()?;
            let predicates = r.rid_vector()?;
            let objects = r.rid_vector()?;

            if subjects.len() != models.len()
                || predicates.len() != models.len()
                || objects.len() != models.len()
            {
                return Err(Error::Protocol("delete_quads vectors differ in length".into()));
            }

            let quads: Vec<Quad> = (0..models.len())
                .map(|i| Quad::new(models[i], subjects[i], predicates[i], objects[i]))
                .collect();
            shared.with_engine(segment, |engine| engine.delete_quads(&quads))?;

            Ok(Some(Frame::empty(Opcode::DoneOk, segment)))
        }

        Opcode::NewModels => {
            let mut r = PayloadReader::new(&frame.payload);
            let models = r.rid_vector()?;
            shared.with_engine(segment, |engine| engine.new_models(&models))?;

            Ok(Some(Frame::empty(Opcode::DoneOk, segment)))
        }

        Opcode::GetSize | Opcode::GetSizeReverse => {
            let size = shared.with_engine(segment, Engine::size)?;

            let mut w = PayloadWriter::new();
            w.u64(size.quads_s);
            w.u64(size.quads_o);
            w.u64(size.resources);
            w.u64(size.models);

            Ok(Some(Frame::new(Opcode::Size, segment, w.finish())))
        }

        Opcode::GetImportTimes => {
            let times = shared.with_engine(segment, |engine| Ok(engine.import_times()))?;

            let mut w = PayloadWriter::new();
            w.f64(times.add_resource);
            w.f64(times.commit_resource);
            w.f64(times.add_quad);
            w.f64(times.commit_quad);
            w.f64(times.remove);
            w.f64(times.rebuild);

            Ok(Some(Frame::new(Opcode::ImportTimes, segment, w.finish())))
        }

        Opcode::GetQueryTimes => {
            let times = shared.with_engine(segment, |engine| Ok(engine.query_times()))?;

            let mut w = PayloadWriter::new();
            w.u64(times.bind_count);
            w.f64(times.bind);
            w.u64(times.resolve_count);
            w.f64(times.resolve);

            Ok(Some(Frame::new(Opcode::QueryTimes, segment, w.finish())))
        }

        Opcode::BnodeAlloc => {
            let mut r = PayloadReader::new(&frame.payload);
            let count = r.u64()?;
            let seg = shared.primary.first().copied().unwrap_or(0);
            let (from, to) = shared.with_engine(seg, |engine| engine.bnode_alloc(count))?;

            let mut w = PayloadWriter::new();
            w.u64(from);
            w.u64(to);

            Ok(Some(Frame::new(Opcode::BnodeRange, segment, w.finish())))
        }

        Opcode::Segments => {
            let mut w = PayloadWriter::new();
            #[allow(clippy::cast_possible_truncation)]
            w.u32((shared.primary.len() + shared.mirror.len()) as u32);
            for seg in shared.primary.iter().chain(&shared.mirror) {
                w.u32(*seg);
            }

            Ok(Some(Frame::new(Opcode::SegmentList, segment, w.finish())))
        }

        Opcode::NodeSegments => {
            let mut w = PayloadWriter::new();
            w.u32(shared.segments);
            let mut roles = vec![0u8; shared.segments as usize];
            for seg in &shared.primary {
                if let Some(role) = roles.get_mut(*seg as usize) {
                    *role = b'p';
                }
            }
            for seg in &shared.mirror {
                if let Some(role) = roles.get_mut(*seg as usize) {
                    *role = b'm';
                }
            }
            w.bytes(&roles);

            Ok(Some(Frame::new(
                Opcode::NodeSegmentList,
                segment,
                w.finish(),
            )))
        }

        Opcode::ChooseSegment => {
            let mut w = PayloadWriter::new();
            w.u32(shared.primary.first().copied().unwrap_or(0));

            Ok(Some(Frame::new(Opcode::ChosenSegment, segment, w.finish())))
        }

        Opcode::Transaction => Err(Error::Unsupported("transactions")),

        Opcode::PriceBind | Opcode::BindFirst | Opcode::BindNext | Opcode::BindDone => {
            Err(Error::Unsupported("streaming binds"))
        }

        Opcode::Lock | Opcode::Unlock => Err(Error::Unsupported("explicit locks")),

        Opcode::GetQuadFreq => Err(Error::Unsupported("quad frequency stats")),

        // response opcodes arriving as requests
        _ => Err(Error::Protocol(format!(
            "unexpected opcode {:?}",
            frame.op
        ))),
    }
}

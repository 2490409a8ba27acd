mod common;

use quadstore::{
    coding::{Decode, Encode},
    protocol::{auth_digest, Frame, Opcode, PayloadReader, PayloadWriter},
    BindFlags, Config, Rid, StoreOptions,
};
use std::{
    io::{BufReader, BufWriter, Write},
    net::TcpStream,
    time::Duration,
};
use test_log::test;

struct Client {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl Client {
    fn connect(config: &Config, kb: &str) -> quadstore::Result<Self> {
        // the server publishes its actual port in runtime.info
        let runtime = quadstore::file::runtime_info_path(config, kb);
        let mut port = 0;
        for _ in 0..200 {
            if let Ok(contents) = std::fs::read_to_string(&runtime) {
                if let Some(p) = contents.split_whitespace().nth(1) {
                    port = p.parse().unwrap_or(0);
                    if port != 0 {
                        break;
                    }
                }
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_ne!(0, port, "server did not come up");

        let stream = TcpStream::connect(("127.0.0.1", port))?;
        Ok(Self {
            reader: BufReader::new(stream.try_clone()?),
            writer: BufWriter::new(stream),
        })
    }

    fn send(&mut self, frame: &Frame) -> quadstore::Result<()> {
        frame.encode_into(&mut self.writer)?;
        self.writer.flush()?;

        Ok(())
    }

    fn call(&mut self, frame: &Frame) -> quadstore::Result<Frame> {
        self.send(frame)?;

        Ok(Frame::decode_from(&mut self.reader)?)
    }

    fn auth(&mut self, kb: &str, password: &str, salt: u32) -> quadstore::Result<Frame> {
        let mut w = PayloadWriter::new();
        w.bytes(&auth_digest(kb, password, salt));

        self.call(&Frame::new(Opcode::Auth, 0, w.finish()))
    }
}

fn start_server(dir: &std::path::Path, password: Option<&str>) -> (Config, u32) {
    let config = Config::new(dir).port(0).disk_limit_gb(0.0);

    let mut options = StoreOptions::new(1);
    if let Some(password) = password {
        options = options.password(password);
    }
    quadstore::create_store(&config, common::KB, &options).unwrap();

    let md = quadstore::Metadata::open(
        &quadstore::file::metadata_path(&config, common::KB),
        false,
    )
    .unwrap();
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let salt = md.get_int(quadstore::metadata::MD_SALT, 0) as u32;

    let serve_config = config.clone();
    let kb = common::KB.to_string();
    std::thread::spawn(move || {
        if let Err(e) = quadstore::server::serve(&serve_config, &kb) {
            eprintln!("server died: {e}");
        }
    });

    (config, salt)
}

fn bind_query_payload(flags: BindFlags, p: &[Rid]) -> Vec<u8> {
    let mut w = PayloadWriter::new();
    w.u32(flags.0);
    w.i32(0); // offset
    w.i32(-1); // limit
    w.rid_vector(&[]);
    w.rid_vector(&[]);
    w.rid_vector(p);
    w.rid_vector(&[]);

    w.finish()
}

#[test]
fn full_session_over_the_wire() -> quadstore::Result<()> {
    let dir = tempfile::tempdir()?;
    let (config, salt) = start_server(dir.path(), Some("sesame"));

    let mut client = Client::connect(&config, common::KB)?;

    // pre-auth commands are rejected, NO_OP is fine
    let reply = client.call(&Frame::empty(Opcode::NoOp, 0))?;
    assert_eq!(Opcode::DoneOk, reply.op);

    let reply = client.call(&Frame::empty(Opcode::GetSize, 0))?;
    assert_eq!(Opcode::Error, reply.op);

    // authenticate; the reply advertises the feature string
    let reply = client.auth(common::KB, "sesame", salt)?;
    assert_eq!(Opcode::DoneOk, reply.op);
    let mut r = PayloadReader::new(&reply.payload);
    assert_eq!(" no-o-index ", r.string()?);

    // import one quad
    let g = Rid::uri("urn:g1");
    let s = Rid::uri("http://example/s1");
    let p = Rid::uri("http://example/p1");
    let o = Rid::uri("http://example/o1");

    assert_eq!(
        Opcode::DoneOk,
        client.call(&Frame::empty(Opcode::StartImport, 0))?.op,
    );

    let mut w = PayloadWriter::new();
    w.u32(1);
    w.rid(s);
    w.rid(quadstore::RID_NULL);
    w.string("http://example/s1");
    client.send(&Frame::new(Opcode::InsertResource, 0, w.finish()))?;

    let mut w = PayloadWriter::new();
    w.u32(1);
    w.rid(g);
    w.rid(s);
    w.rid(p);
    w.rid(o);
    client.send(&Frame::new(Opcode::InsertQuad, 0, w.finish()))?;

    assert_eq!(
        Opcode::DoneOk,
        client.call(&Frame::empty(Opcode::CommitResource, 0))?.op,
    );
    assert_eq!(
        Opcode::DoneOk,
        client.call(&Frame::empty(Opcode::CommitQuad, 0))?.op,
    );
    assert_eq!(
        Opcode::DoneOk,
        client.call(&Frame::empty(Opcode::StopImport, 0))?.op,
    );

    // bind it back
    let flags = BindFlags::MODEL
        | BindFlags::SUBJECT
        | BindFlags::PREDICATE
        | BindFlags::OBJECT
        | BindFlags::BY_SUBJECT;
    let reply = client.call(&Frame::new(
        Opcode::BindLimit,
        0,
        bind_query_payload(flags, &[p]),
    ))?;
    assert_eq!(Opcode::BindList, reply.op);

    let mut r = PayloadReader::new(&reply.payload);
    assert_eq!(4, r.u32()?);
    assert_eq!(1, r.u64()?);
    assert_eq!(g, r.rid()?);
    assert_eq!(s, r.rid()?);
    assert_eq!(p, r.rid()?);
    assert_eq!(o, r.rid()?);

    // resolve the subject
    let mut w = PayloadWriter::new();
    w.rid_vector(&[s]);
    let reply = client.call(&Frame::new(Opcode::Resolve, 0, w.finish()))?;
    assert_eq!(Opcode::ResourceList, reply.op);
    let mut r = PayloadReader::new(&reply.payload);
    assert_eq!(1, r.u32()?);
    assert_eq!(s, r.rid()?);
    assert_eq!(quadstore::RID_NULL, r.rid()?);
    assert_eq!("http://example/s1", r.string()?);

    // sizes
    let reply = client.call(&Frame::empty(Opcode::GetSize, 0))?;
    assert_eq!(Opcode::Size, reply.op);
    let mut r = PayloadReader::new(&reply.payload);
    assert_eq!(1, r.u64()?);

    // blank nodes
    let mut w = PayloadWriter::new();
    w.u64(4);
    let reply = client.call(&Frame::new(Opcode::BnodeAlloc, 0, w.finish()))?;
    assert_eq!(Opcode::BnodeRange, reply.op);
    let mut r = PayloadReader::new(&reply.payload);
    let from = r.u64()?;
    assert_eq!(from + 4, r.u64()?);

    // transactions keep their well-defined failure
    let reply = client.call(&Frame::empty(Opcode::Transaction, 0))?;
    assert_eq!(Opcode::Error, reply.op);

    Ok(())
}

#[test]
fn wrong_password_closes_the_connection() -> quadstore::Result<()> {
    let dir = tempfile::tempdir()?;
    let (config, salt) = start_server(dir.path(), Some("sesame"));

    let mut client = Client::connect(&config, common::KB)?;
    let reply = client.auth(common::KB, "wrong", salt)?;
    assert_eq!(Opcode::Error, reply.op);

    // the server hung up on us
    assert!(client.call(&Frame::empty(Opcode::NoOp, 0)).is_err());

    Ok(())
}

#[test]
fn open_store_needs_no_password() -> quadstore::Result<()> {
    let dir = tempfile::tempdir()?;
    let (config, _salt) = start_server(dir.path(), None);

    let mut client = Client::connect(&config, common::KB)?;

    // no AUTH at all; the store was created without a password
    let reply = client.call(&Frame::empty(Opcode::GetSize, 0))?;
    assert_eq!(Opcode::Size, reply.op);

    Ok(())
}

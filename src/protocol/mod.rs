// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Wire protocol between the query front-end and a backend worker.
//!
//! Every frame is a 12-byte header and a payload: two magic bytes
//! `"ID"`, a version byte identifying the RID hash function, the opcode,
//! then payload length and segment id as little-endian `u32`s. Payload
//! integers are little-endian and packed; RID vectors carry a byte-length
//! prefix, strings are NUL-terminated and padded to an 8-byte boundary.

pub mod admin;

use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    rid::Rid,
    Error,
};
use byteorder::{LittleEndian as LE, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use xxhash_rust::xxh3::xxh3_128;

/// First two bytes of every frame.
pub const MAGIC: [u8; 2] = *b"ID";

/// Protocol version; doubles as the RID hash function discriminator.
pub const VERSION: u8 = 0x84;

/// Capabilities advertised in the AUTH reply, space-padded.
pub const FEATURE_STRING: &str = " no-o-index ";

/// Frames larger than this are rejected before allocation.
pub const MAX_PAYLOAD: u32 = 1 << 30;

/// Request and response opcodes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Opcode {
    NoOp = 0x01,
    Resolve = 0x02,
    BindLimit = 0x03,
    PriceBind = 0x04,
    InsertResource = 0x05,
    CommitResource = 0x06,
    InsertQuad = 0x07,
    CommitQuad = 0x08,
    StartImport = 0x09,
    StopImport = 0x0a,
    DeleteModels = 0x0b,
    DeleteQuads = 0x0c,
    NewModels = 0x0d,
    GetSize = 0x0e,
    GetImportTimes = 0x0f,
    GetQueryTimes = 0x10,
    BindFirst = 0x11,
    BindNext = 0x12,
    BindDone = 0x13,
    ReverseBind = 0x14,
    BnodeAlloc = 0x15,
    ResolveAttr = 0x16,
    Auth = 0x17,
    Transaction = 0x18,
    Lock = 0x19,
    Unlock = 0x1a,
    NodeSegments = 0x1b,
    Segments = 0x1c,
    GetSizeReverse = 0x1d,
    GetQuadFreq = 0x1e,
    ChooseSegment = 0x1f,

    Error = 0x40,
    DoneOk = 0x41,
    NoMatch = 0x42,
    BindList = 0x43,
    ResourceList = 0x44,
    Size = 0x45,
    ImportTimes = 0x46,
    QueryTimes = 0x47,
    BnodeRange = 0x48,
    SegmentList = 0x49,
    NodeSegmentList = 0x4a,
    ChosenSegment = 0x4b,
}

impl TryFrom<u8> for Opcode {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, DecodeError> {
        use Opcode::{
            Auth, BindDone, BindFirst, BindLimit, BindList, BindNext, BnodeAlloc, BnodeRange,
            ChooseSegment, ChosenSegment, CommitQuad, CommitResource, DeleteModels, DeleteQuads,
            DoneOk, Error, GetImportTimes, GetQuadFreq, GetQueryTimes, GetSize, GetSizeReverse,
            ImportTimes, InsertQuad, InsertResource, Lock, NewModels, NoMatch, NoOp,
            NodeSegmentList, NodeSegments, PriceBind, QueryTimes, Resolve, ResolveAttr,
            ResourceList, ReverseBind, SegmentList, Segments, Size, StartImport, StopImport,
            Transaction, Unlock,
        };

        Ok(match value {
            0x01 => NoOp,
            0x02 => Resolve,
            0x03 => BindLimit,
            0x04 => PriceBind,
            0x05 => InsertResource,
            0x06 => CommitResource,
            0x07 => InsertQuad,
            0x08 => CommitQuad,
            0x09 => StartImport,
            0x0a => StopImport,
            0x0b => DeleteModels,
            0x0c => DeleteQuads,
            0x0d => NewModels,
            0x0e => GetSize,
            0x0f => GetImportTimes,
            0x10 => GetQueryTimes,
            0x11 => BindFirst,
            0x12 => BindNext,
            0x13 => BindDone,
            0x14 => ReverseBind,
            0x15 => BnodeAlloc,
            0x16 => ResolveAttr,
            0x17 => Auth,
            0x18 => Transaction,
            0x19 => Lock,
            0x1a => Unlock,
            0x1b => NodeSegments,
            0x1c => Segments,
            0x1d => GetSizeReverse,
            0x1e => GetQuadFreq,
            0x1f => ChooseSegment,
            0x40 => Error,
            0x41 => DoneOk,
            0x42 => NoMatch,
            0x43 => BindList,
            0x44 => ResourceList,
            0x45 => Size,
            0x46 => ImportTimes,
            0x47 => QueryTimes,
            0x48 => BnodeRange,
            0x49 => SegmentList,
            0x4a => NodeSegmentList,
            0x4b => ChosenSegment,
            other => return Err(DecodeError::InvalidTag(("Opcode", other))),
        })
    }
}

/// One protocol frame.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    pub op: Opcode,
    pub segment: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    #[must_use]
    pub fn new(op: Opcode, segment: u32, payload: Vec<u8>) -> Self {
        Self {
            op,
            segment,
            payload,
        }
    }

    #[must_use]
    pub fn empty(op: Opcode, segment: u32) -> Self {
        Self::new(op, segment, Vec::new())
    }

    /// An ERROR frame carrying a message.
    #[must_use]
    pub fn error(segment: u32, message: &str) -> Self {
        let mut w = PayloadWriter::new();
        w.string(message);

        Self::new(Opcode::Error, segment, w.finish())
    }
}

impl Encode for Frame {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_all(&MAGIC)?;
        writer.write_u8(VERSION)?;
        writer.write_u8(self.op as u8)?;
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32::<LE>(self.payload.len() as u32)?;
        writer.write_u32::<LE>(self.segment)?;
        writer.write_all(&self.payload)?;

        Ok(())
    }
}

impl Decode for Frame {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let mut magic = [0u8; 2];
        reader.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(DecodeError::InvalidHeader("Frame"));
        }

        let version = reader.read_u8()?;
        if version != VERSION {
            return Err(DecodeError::InvalidTag(("Version", version)));
        }

        let op = Opcode::try_from(reader.read_u8()?)?;
        let length = reader.read_u32::<LE>()?;
        if length > MAX_PAYLOAD {
            return Err(DecodeError::InvalidHeader("Frame length"));
        }
        let segment = reader.read_u32::<LE>()?;

        let mut payload = vec![0u8; length as usize];
        reader.read_exact(&mut payload)?;

        Ok(Self {
            op,
            segment,
            payload,
        })
    }
}

/// Digest carried by AUTH: a 128-bit hash of `"<kbname>:<password>"`
/// concatenated with the KB's 4-byte salt.
#[must_use]
pub fn auth_digest(kb_name: &str, password: &str, salt: u32) -> [u8; 16] {
    let mut buf = Vec::with_capacity(kb_name.len() + password.len() + 5);
    buf.extend_from_slice(kb_name.as_bytes());
    buf.push(b':');
    buf.extend_from_slice(password.as_bytes());
    buf.extend_from_slice(&salt.to_le_bytes());

    xxh3_128(&buf).to_le_bytes()
}

/// Sequential payload writer.
#[derive(Default)]
pub struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn rid(&mut self, rid: Rid) {
        self.u64(rid.0);
    }

    /// Byte-length-prefixed vector of RIDs.
    pub fn rid_vector(&mut self, rids: &[Rid]) {
        #[allow(clippy::cast_possible_truncation)]
        self.u32((rids.len() * 8) as u32);
        for rid in rids {
            self.rid(*rid);
        }
    }

    /// NUL-terminated string, padded to the next 8-byte boundary.
    pub fn string(&mut self, s: &str) {
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
        while self.buf.len() % 8 != 0 {
            self.buf.push(0);
        }
    }

    pub fn bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Sequential payload reader; all methods fail cleanly on truncation.
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| Error::Protocol("truncated payload".into()))?;

        let slice = &self.buf[self.pos..end];
        self.pos = end;

        Ok(slice)
    }

    pub fn u32(&mut self) -> Result<u32, Error> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);

        Ok(u32::from_le_bytes(raw))
    }

    pub fn i32(&mut self) -> Result<i32, Error> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);

        Ok(i32::from_le_bytes(raw))
    }

    pub fn u64(&mut self) -> Result<u64, Error> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);

        Ok(u64::from_le_bytes(raw))
    }

    pub fn f64(&mut self) -> Result<f64, Error> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);

        Ok(f64::from_le_bytes(raw))
    }

    pub fn rid(&mut self) -> Result<Rid, Error> {
        Ok(Rid(self.u64()?))
    }

    pub fn rid_vector(&mut self) -> Result<Vec<Rid>, Error> {
        let bytes = self.u32()? as usize;
        if bytes % 8 != 0 {
            return Err(Error::Protocol("rid vector length not a multiple of 8".into()));
        }

        let raw = self.take(bytes)?;
        Ok(raw
            .chunks_exact(8)
            .map(|c| {
                let mut b = [0u8; 8];
                b.copy_from_slice(c);
                Rid(u64::from_le_bytes(b))
            })
            .collect())
    }

    pub fn string(&mut self) -> Result<String, Error> {
        let start = self.pos;
        let nul = self.buf[start..]
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| Error::Protocol("unterminated string".into()))?;

        let s = std::str::from_utf8(&self.buf[start..start + nul])
            .map_err(|_| Error::Protocol("string is not UTF-8".into()))?
            .to_string();

        // consume the NUL plus padding to the 8-byte boundary
        self.pos = start + nul + 1;
        while self.pos % 8 != 0 && self.pos < self.buf.len() {
            self.pos += 1;
        }

        Ok(s)
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], Error> {
        self.take(n)
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use test_log::test;

    #[test]
    fn frame_roundtrip() -> crate::Result<()> {
        let mut w = PayloadWriter::new();
        w.rid_vector(&[Rid(1), Rid(2), Rid(3)]);
        w.string("hello");
        let frame = Frame::new(Opcode::BindLimit, 7, w.finish());

        let bytes = frame.encode_into_vec();
        assert_eq!(&bytes[0..2], b"ID");
        assert_eq!(bytes[2], VERSION);

        let decoded = Frame::decode_from(&mut Cursor::new(bytes))?;
        assert_eq!(frame, decoded);

        let mut r = PayloadReader::new(&decoded.payload);
        assert_eq!(vec![Rid(1), Rid(2), Rid(3)], r.rid_vector()?);
        assert_eq!("hello", r.string()?);
        assert_eq!(0, r.remaining());

        Ok(())
    }

    #[test]
    fn bad_magic_rejected() {
        let mut bytes = Frame::empty(Opcode::NoOp, 0).encode_into_vec();
        bytes[0] = b'X';

        assert!(Frame::decode_from(&mut Cursor::new(bytes)).is_err());
    }

    #[test]
    fn unknown_opcode_rejected() {
        let mut bytes = Frame::empty(Opcode::NoOp, 0).encode_into_vec();
        bytes[3] = 0xff;

        assert!(matches!(
            Frame::decode_from(&mut Cursor::new(bytes)),
            Err(DecodeError::InvalidTag(("Opcode", 0xff)))
        ));
    }

    #[test]
    fn truncated_payload_is_protocol_error() {
        let mut r = PayloadReader::new(&[1, 2, 3]);
        assert!(r.u64().is_err());
    }

    #[test]
    fn auth_digest_is_stable() {
        let a = auth_digest("kb", "secret", 42);
        let b = auth_digest("kb", "secret", 42);
        assert_eq!(a, b);

        assert_ne!(a, auth_digest("kb", "secret", 43));
        assert_ne!(a, auth_digest("kb", "other", 42));
        assert_ne!(a, auth_digest("kb2", "secret", 42));
    }
}

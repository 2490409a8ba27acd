// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Cluster admin control-plane framing.
//!
//! The admin plane (create/start/stop/delete stores) is not served by
//! this crate; only the frame boundaries are reproduced so a backend can
//! recognise and skip admin traffic cleanly.

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use byteorder::{LittleEndian as LE, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

pub const MAGIC: [u8; 2] = *b"AC";
pub const VERSION: u8 = 0x01;

/// Admin command numbers; semantics live in the control-plane daemon.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum AdminOp {
    StartKb = 0x01,
    StopKb = 0x02,
    CreateKb = 0x03,
    DeleteKb = 0x04,
    GetKbInfo = 0x05,
    GetKbInfoAll = 0x06,
    ExpectNKb = 0x07,
}

impl TryFrom<u8> for AdminOp {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, DecodeError> {
        Ok(match value {
            0x01 => Self::StartKb,
            0x02 => Self::StopKb,
            0x03 => Self::CreateKb,
            0x04 => Self::DeleteKb,
            0x05 => Self::GetKbInfo,
            0x06 => Self::GetKbInfoAll,
            0x07 => Self::ExpectNKb,
            other => return Err(DecodeError::InvalidTag(("AdminOp", other))),
        })
    }
}

/// An admin frame: `"AC" <version> <op> <len:u16>` then the payload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AdminFrame {
    pub op: AdminOp,
    pub payload: Vec<u8>,
}

impl Encode for AdminFrame {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_all(&MAGIC)?;
        writer.write_u8(VERSION)?;
        writer.write_u8(self.op as u8)?;
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u16::<LE>(self.payload.len() as u16)?;
        writer.write_all(&self.payload)?;

        Ok(())
    }
}

impl Decode for AdminFrame {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let mut magic = [0u8; 2];
        reader.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(DecodeError::InvalidHeader("AdminFrame"));
        }

        let version = reader.read_u8()?;
        if version != VERSION {
            return Err(DecodeError::InvalidTag(("AdminVersion", version)));
        }

        let op = AdminOp::try_from(reader.read_u8()?)?;
        let length = reader.read_u16::<LE>()?;

        let mut payload = vec![0u8; length as usize];
        reader.read_exact(&mut payload)?;

        Ok(Self { op, payload })
    }
}

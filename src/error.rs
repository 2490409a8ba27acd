// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{DecodeError, EncodeError};

/// Represents errors that can occur in the storage engine
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Serialization failed
    Encode(EncodeError),

    /// Deserialization failed
    Decode(DecodeError),

    /// On-disk state violated a structural invariant (bad magic tag or
    /// revision, length mismatch, chain cycle, ...)
    ///
    /// Non-recoverable for the affected segment.
    Corruption(String),

    /// Malformed or out-of-sequence client request
    ///
    /// Recoverable; the connection keeps being served.
    Protocol(String),

    /// Authentication failed (wrong KB name or password)
    Auth,

    /// Not enough disk space to accept writes
    Capacity,

    /// KB, segment or graph does not exist
    NotFound(String),

    /// KB already exists, or the store is locked by another process
    Conflict(String),

    /// Operation is a documented limit of this engine
    /// (transactions, reverse bind by object)
    Unsupported(&'static str),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Encode(e) => write!(f, "{e}"),
            Self::Decode(e) => write!(f, "{e}"),
            Self::Corruption(msg) => write!(f, "corruption: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Self::Auth => write!(f, "access denied"),
            Self::Capacity => write!(f, "free disk space below limit"),
            Self::NotFound(what) => write!(f, "not found: {what}"),
            Self::Conflict(what) => write!(f, "conflict: {what}"),
            Self::Unsupported(what) => write!(f, "not supported in this branch: {what}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Encode(e) => Some(e),
            Self::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

/// Engine result
pub type Result<T> = std::result::Result<T, Error>;

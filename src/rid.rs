// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use xxhash_rust::xxh3::xxh3_64;

/// Wildcard / unbound slot in a pattern.
///
/// Also used as the "no attribute" marker on URI resources.
pub const RID_NULL: Rid = Rid(0x8000_0000_0000_0000);

/// Tombstone for triples soft-deleted inside a triple block.
pub const RID_GONE: Rid = Rid(0x8000_0000_0000_0001);

/// Lexical form whose hash is the well-known default graph RID.
pub const DEFAULT_GRAPH_URI: &str = "system:defaultGraph";

/// Name of the RID hash function, recorded in store metadata.
///
/// A store written with a different hash function cannot be opened by
/// this binary.
pub const HASH_FUNCTION: &str = "XXH3";

const KIND_MASK: u64 = 0xE000_0000_0000_0000;
const KIND_SHIFT: u32 = 61;

const KIND_URI: u64 = 0b000;
const KIND_LITERAL: u64 = 0b001;
const KIND_BNODE: u64 = 0b010;
const KIND_INTERNAL: u64 = 0b100;

/// Type tag carried in the top 3 bits of a [`Rid`]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RidKind {
    /// A URI reference
    Uri,

    /// A literal (plain, typed or language-tagged)
    Literal,

    /// A blank node, allocated from the store-wide counter
    BlankNode,

    /// Internal sentinel space (`RID_NULL`, `RID_GONE`)
    Internal,
}

/// 64-bit resource identifier.
///
/// Derived from the lexical form by a strong hash, with a 3-bit type tag
/// overlaid on the high bits. Because the identifier *is* the hash, the
/// indexes never need to consult the lexical form to compare resources.
#[derive(Copy, Clone, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Rid(pub u64);

impl Rid {
    /// Hashes a URI lexical form.
    #[must_use]
    pub fn uri(lex: &str) -> Self {
        Self::tagged(xxh3_64(lex.as_bytes()), KIND_URI)
    }

    /// Hashes a literal lexical form.
    ///
    /// The attribute (datatype or language) is hashed in so `"1"` and
    /// `"1"^^xsd:integer` get distinct identifiers.
    #[must_use]
    pub fn literal(lex: &str, attr: Self) -> Self {
        let mut buf = Vec::with_capacity(lex.len() + 8);
        buf.extend_from_slice(&attr.0.to_le_bytes());
        buf.extend_from_slice(lex.as_bytes());

        Self::tagged(xxh3_64(&buf), KIND_LITERAL)
    }

    /// Builds a blank node RID from a store-wide counter value.
    #[must_use]
    pub fn bnode(counter: u64) -> Self {
        Self::tagged(counter, KIND_BNODE)
    }

    fn tagged(raw: u64, kind: u64) -> Self {
        Self((raw & !KIND_MASK) | (kind << KIND_SHIFT))
    }

    /// The type tag of this RID.
    #[must_use]
    pub fn kind(self) -> RidKind {
        match (self.0 & KIND_MASK) >> KIND_SHIFT {
            KIND_LITERAL => RidKind::Literal,
            KIND_BNODE => RidKind::BlankNode,
            k if k & KIND_INTERNAL != 0 => RidKind::Internal,
            _ => RidKind::Uri,
        }
    }

    #[must_use]
    pub fn is_uri(self) -> bool {
        self.kind() == RidKind::Uri
    }

    #[must_use]
    pub fn is_literal(self) -> bool {
        self.kind() == RidKind::Literal
    }

    #[must_use]
    pub fn is_bnode(self) -> bool {
        self.kind() == RidKind::BlankNode
    }

    /// Whether this RID is the wildcard sentinel.
    #[must_use]
    pub fn is_null(self) -> bool {
        self == RID_NULL
    }

    /// Which segment of an `n`-segment store owns this RID.
    #[must_use]
    pub fn segment(self, segments: u32) -> u32 {
        #[allow(clippy::cast_possible_truncation)]
        {
            (self.0 % u64::from(segments)) as u32
        }
    }
}

/// The well-known RID of the unnamed graph.
#[must_use]
pub fn default_graph_rid() -> Rid {
    Rid::uri(DEFAULT_GRAPH_URI)
}

impl From<u64> for Rid {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Rid> for u64 {
    fn from(value: Rid) -> Self {
        value.0
    }
}

impl std::fmt::Debug for Rid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl std::fmt::Display for Rid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::rid::{Rid, RID_NULL};

/// A resource: an identifier plus the lexical form it was hashed from.
///
/// For a URI, `attr` is [`RID_NULL`]. For a literal, `attr` is the RID of
/// the empty string, of a datatype URI, or of a language tag stored as a
/// literal. Blank nodes are synthesized on the fly and never stored.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Resource {
    pub rid: Rid,
    pub attr: Rid,
    pub lex: String,
}

impl Resource {
    /// A URI resource from its lexical form.
    #[must_use]
    pub fn uri(lex: impl Into<String>) -> Self {
        let lex = lex.into();

        Self {
            rid: Rid::uri(&lex),
            attr: RID_NULL,
            lex,
        }
    }

    /// A literal resource from its lexical form and attribute.
    #[must_use]
    pub fn literal(lex: impl Into<String>, attr: Rid) -> Self {
        let lex = lex.into();

        Self {
            rid: Rid::literal(&lex, attr),
            attr,
            lex,
        }
    }

    /// Synthesizes the printable form of a blank node.
    #[must_use]
    pub fn bnode(rid: Rid) -> Self {
        Self {
            rid,
            attr: RID_NULL,
            lex: format!("_:b{:x}", rid.0),
        }
    }
}

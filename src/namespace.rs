//! Session namespaces for composing sub-protocols on one channel.
//!
//! A [`SessionId`] encodes the path from a root protocol run down to a
//! (possibly deeply) nested sub-protocol instance:
//!
//! ```text
//!  63        48 47    40 39    32 31    24 23    16 15     8 7      0
//! +-----------+--------+--------+--------+--------+--------+--------+
//! | root tag  | level1 | level2 | level3 | level4 | level5 | level6 |
//! +-----------+--------+--------+--------+--------+--------+--------+
//! ```
//!
//! Every level slot stores `ordinal + 1` of the child at that depth, a zero
//! slot terminates the path. Because the slots of a path are filled from the
//! top and never contain zero, two different paths always produce different
//! ids, which makes [`SessionId::child`] injective.
use std::fmt;

use serde::{Deserialize, Serialize};

const ROOT_SHIFT: u32 = 48;
const SLOT_BITS: u32 = 8;
const SLOT_MASK: u64 = (1 << SLOT_BITS) - 1;

/// The maximum nesting depth of sub-protocols below a root session.
pub const MAX_DEPTH: u32 = 6;
/// The largest ordinal a child can be allocated with.
pub const MAX_ORDINAL: u32 = SLOT_MASK as u32 - 1;

/// Identifies one protocol instance in the session tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(u64);

impl SessionId {
    /// The session id of a root protocol run with the given tag.
    pub const fn root(tag: u16) -> Self {
        Self((tag as u64) << ROOT_SHIFT)
    }

    /// Reinterprets a raw id, e.g. one decoded from the wire.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw id as written on the wire.
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The tag of the root session this id descends from.
    pub const fn root_tag(self) -> u16 {
        (self.0 >> ROOT_SHIFT) as u16
    }

    /// Number of composition levels between the root and this session.
    pub fn depth(self) -> u32 {
        (0..MAX_DEPTH)
            .find(|level| self.slot(*level) == 0)
            .unwrap_or(MAX_DEPTH)
    }

    /// Derives the namespace of the `ordinal`-th sub-protocol of this session.
    ///
    /// Returns `None` if this session is already at [`MAX_DEPTH`] or the
    /// ordinal exceeds [`MAX_ORDINAL`].
    pub fn child(self, ordinal: u32) -> Option<Self> {
        let depth = self.depth();
        if depth >= MAX_DEPTH || ordinal > MAX_ORDINAL {
            return None;
        }
        Some(Self(self.0 | ((ordinal as u64 + 1) << slot_shift(depth))))
    }

    /// The session this one was derived from, `None` for root sessions.
    pub fn parent(self) -> Option<Self> {
        match self.depth() {
            0 => None,
            depth => Some(Self(self.0 & !(SLOT_MASK << slot_shift(depth - 1)))),
        }
    }

    /// The ordinal this session was allocated with by its parent.
    pub fn ordinal(self) -> Option<u32> {
        match self.depth() {
            0 => None,
            depth => Some(self.slot(depth - 1) as u32 - 1),
        }
    }

    /// Whether `other` is this session or one of its (transitive) sub-sessions.
    pub fn contains(self, other: SessionId) -> bool {
        let mask = u64::MAX << (ROOT_SHIFT - SLOT_BITS * self.depth());
        other.0 & mask == self.0
    }

    fn slot(self, level: u32) -> u64 {
        (self.0 >> slot_shift(level)) & SLOT_MASK
    }
}

const fn slot_shift(level: u32) -> u32 {
    ROOT_SHIFT - SLOT_BITS * (level + 1)
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root_tag())?;
        for level in 0..self.depth() {
            write!(f, ".{}", self.slot(level) - 1)?;
        }
        Ok(())
    }
}

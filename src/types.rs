use derive_more::{Display, From};
use indexmap::{IndexMap as _IndexMap, IndexSet as _IndexSet};
use rustc_hash::FxBuildHasher;
use std::{collections::HashSet as _HashSet, sync::Arc};

/// Stable handle of a block inside a [`Topology`](crate::topology::Topology).
///
/// Handles are dense indices into the topology's block arena, so every
/// per-block table of the runtime is a plain `Vec` indexed by `BlockId`.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display("#{_0}")]
pub struct BlockId(pub(crate) u32);

impl BlockId {
    /// Position of the block in the topology arena.
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn from_index(index: usize) -> Self {
        Self(index.try_into().expect("BlockId::from_index"))
    }
}

/// Name of a port on a block, unique among that block's inputs (or outputs).
#[derive(Debug, Display, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, From)]
pub struct SocketId(Arc<str>);

impl SocketId {
    /// Borrow the socket name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SocketId {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl From<String> for SocketId {
    fn from(value: String) -> Self {
        Self(value.into())
    }
}

impl From<&SocketId> for SocketId {
    fn from(value: &SocketId) -> Self {
        value.clone()
    }
}

/// Type tag carried by a socket; connected sockets must carry equal tags.
#[derive(Debug, Display, Clone, PartialEq, Eq, Hash, From)]
pub struct TypeTag(Arc<str>);

impl From<&str> for TypeTag {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

/// Immutable `(id, type-tag)` pair identifying one port on a block.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Socket {
    /// Port name.
    pub id: SocketId,
    /// Payload type accepted or produced by the port.
    pub ty: TypeTag,
}

impl Socket {
    /// Create a socket from anything convertible into an id and a tag.
    pub fn new(id: impl Into<SocketId>, ty: impl Into<TypeTag>) -> Self {
        Self {
            id: id.into(),
            ty: ty.into(),
        }
    }
}

/// Work items keyed by the input socket they arrive on.
pub type Inputs<I> = IndexMap<SocketId, Vec<I>>;
/// Work items keyed by the output socket that produced them.
pub type Outputs<I> = IndexMap<SocketId, Vec<I>>;

pub(crate) type HashSet<T> = _HashSet<T, FxBuildHasher>;
/// `IndexMap` type with fast hasher.
pub type IndexMap<K, V> = _IndexMap<K, V, FxBuildHasher>;
pub(crate) type IndexSet<T> = _IndexSet<T, FxBuildHasher>;

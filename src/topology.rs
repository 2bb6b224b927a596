mod builder;

/// Errors returned by [`TopologyBuilder`] when the graph is malformed.
pub use crate::topology::builder::{SocketDirection, TopologyBuilder, TopologyError};
use crate::{
    block::{Block, BlockRole},
    config::Config,
    types::{BlockId, SocketId},
};
use derive_more::Debug;

/// Link from one block's output socket to another block's input socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Connection {
    /// Producing block.
    pub source: BlockId,
    /// Output socket on `source`.
    pub source_socket: SocketId,
    /// Consuming block.
    pub target: BlockId,
    /// Input socket on `target`.
    pub target_socket: SocketId,
}

/// Read-only snapshot of a validated, acyclic block graph.
///
/// Blocks live in an arena addressed by [`BlockId`]. Adjacency is
/// precomputed over *distinct* blocks: two connections between the same pair
/// of blocks count as one edge for degree and barrier purposes.
#[must_use]
#[derive(Debug)]
pub struct Topology<C: Config> {
    #[debug("{} blocks", blocks.len())]
    blocks: Vec<C::Block>,
    connections: Vec<Connection>,
    /// Distinct predecessors of each block, sorted.
    upstream: Vec<Vec<BlockId>>,
    /// Distinct successors of each block, sorted.
    downstream: Vec<Vec<BlockId>>,
    /// Indexes into `connections` of the edges ending at each block.
    incoming: Vec<Vec<usize>>,
    /// Kahn order; roots first.
    order: Vec<BlockId>,
}

impl<C: Config> Topology<C> {
    /// Start describing a new graph.
    pub fn builder() -> TopologyBuilder<C> {
        TopologyBuilder::new()
    }

    /// Number of blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the graph has no blocks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Borrow a block.
    ///
    /// # Panics
    /// If `id` does not belong to this topology.
    #[must_use]
    pub fn block(&self, id: BlockId) -> &C::Block {
        &self.blocks[id.index()]
    }

    /// All block handles in arena order.
    pub fn block_ids(&self) -> impl ExactSizeIterator<Item = BlockId> + '_ {
        (0..self.blocks.len()).map(BlockId::from_index)
    }

    /// Every connection in insertion order.
    #[must_use]
    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    /// Connections ending at `id`.
    pub fn connections_into(&self, id: BlockId) -> impl Iterator<Item = &Connection> + '_ {
        self.incoming[id.index()]
            .iter()
            .map(|&idx| &self.connections[idx])
    }

    /// Distinct predecessors of `id`.
    #[must_use]
    pub fn upstream(&self, id: BlockId) -> &[BlockId] {
        &self.upstream[id.index()]
    }

    /// Distinct successors of `id`.
    #[must_use]
    pub fn downstream(&self, id: BlockId) -> &[BlockId] {
        &self.downstream[id.index()]
    }

    /// A topological order of all blocks.
    #[must_use]
    pub fn topological_order(&self) -> &[BlockId] {
        &self.order
    }

    /// Blocks without predecessors.
    pub fn roots(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.block_ids().filter(|&id| self.upstream(id).is_empty())
    }

    /// Blocks whose role is [`BlockRole::Source`].
    pub fn sources(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.block_ids().filter(|&id| self.role(id).is_source())
    }

    /// Blocks whose role is [`BlockRole::Sink`].
    pub fn sinks(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.block_ids().filter(|&id| self.role(id).is_sink())
    }

    pub(crate) fn role(&self, id: BlockId) -> BlockRole {
        self.block(id).role()
    }

    pub(crate) fn name(&self, id: BlockId) -> &str {
        self.block(id).name()
    }
}

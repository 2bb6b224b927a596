use crate::{
    block::Block,
    config::Config,
    topology::{Connection, Topology},
    types::{BlockId, IndexSet, SocketId, TypeTag},
};
use derive_more::Display;
use std::collections::VecDeque;
use thiserror::Error;

/// Which side of a block a socket lives on.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq)]
pub enum SocketDirection {
    /// Input port.
    #[display("input")]
    Input,
    /// Output port.
    #[display("output")]
    Output,
}

/// Structural problems detected while building a [`Topology`].
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum TopologyError {
    /// A connection references a block that was never added.
    #[error("unknown block {0}")]
    UnknownBlock(BlockId),
    /// A connection references a socket the block does not declare.
    #[error("block {block} has no {direction} socket `{socket}`")]
    UnknownSocket {
        /// Offending block.
        block: BlockId,
        /// Missing socket.
        socket: SocketId,
        /// Side of the block that was searched.
        direction: SocketDirection,
    },
    /// Connected sockets carry different type tags.
    #[error("cannot connect {source_tag} output `{source_socket}` of {source_block} to {target_tag} input `{target_socket}` of {target_block}")]
    TypeMismatch {
        /// Producing block.
        source_block: BlockId,
        /// Output socket on the producer.
        source_socket: SocketId,
        /// Its type tag.
        source_tag: TypeTag,
        /// Consuming block.
        target_block: BlockId,
        /// Input socket on the consumer.
        target_socket: SocketId,
        /// Its type tag.
        target_tag: TypeTag,
    },
    /// The same socket pair was connected twice.
    #[error("duplicate connection into `{target_socket}` of {target}")]
    DuplicateConnection {
        /// Consuming block.
        target: BlockId,
        /// Input socket on the consumer.
        target_socket: SocketId,
    },
    /// A block was connected to itself.
    #[error("block {0} is connected to itself")]
    SelfLoop(BlockId),
    /// The provided dependency graph contains cycle(s).
    #[error("graph contains cycle(s)")]
    Cycle,
}

/// Incremental description of a block graph.
#[must_use]
#[derive(Debug)]
pub struct TopologyBuilder<C: Config> {
    blocks: Vec<C::Block>,
    connections: IndexSet<Connection>,
}

impl<C: Config> Default for TopologyBuilder<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Config> TopologyBuilder<C> {
    /// Empty builder.
    pub fn new() -> Self {
        Self {
            blocks: Vec::new(),
            connections: IndexSet::default(),
        }
    }

    /// Add a block to the arena and return its handle.
    #[must_use = "the handle is needed to connect the block"]
    pub fn add_block(&mut self, block: C::Block) -> BlockId {
        let id = BlockId::from_index(self.blocks.len());
        self.blocks.push(block);
        id
    }

    /// Connect `source.source_socket` to `target.target_socket`.
    ///
    /// # Errors
    /// Unknown blocks or sockets, mismatched type tags, self-loops and
    /// duplicate connections.
    pub fn connect(
        &mut self,
        source: BlockId,
        source_socket: impl Into<SocketId>,
        target: BlockId,
        target_socket: impl Into<SocketId>,
    ) -> Result<&mut Self, TopologyError> {
        let source_socket = source_socket.into();
        let target_socket = target_socket.into();
        if source == target {
            return Err(TopologyError::SelfLoop(source));
        }
        let source_tag = self.socket_tag(source, &source_socket, SocketDirection::Output)?;
        let target_tag = self.socket_tag(target, &target_socket, SocketDirection::Input)?;
        if source_tag != target_tag {
            return Err(TopologyError::TypeMismatch {
                source_block: source,
                source_socket,
                source_tag,
                target_block: target,
                target_socket,
                target_tag,
            });
        }
        let connection = Connection {
            source,
            source_socket,
            target,
            target_socket,
        };
        if self.connections.contains(&connection) {
            return Err(TopologyError::DuplicateConnection {
                target,
                target_socket: connection.target_socket,
            });
        }
        self.connections.insert(connection);
        Ok(self)
    }

    fn socket_tag(
        &self,
        block: BlockId,
        socket: &SocketId,
        direction: SocketDirection,
    ) -> Result<TypeTag, TopologyError> {
        let block_ref = self
            .blocks
            .get(block.index())
            .ok_or(TopologyError::UnknownBlock(block))?;
        let sockets = match direction {
            SocketDirection::Input => block_ref.inputs(),
            SocketDirection::Output => block_ref.outputs(),
        };
        sockets
            .iter()
            .find(|candidate| candidate.id == *socket)
            .map(|found| found.ty.clone())
            .ok_or_else(|| TopologyError::UnknownSocket {
                block,
                socket: socket.clone(),
                direction,
            })
    }

    /// Freeze the graph.
    ///
    /// # Errors
    /// [`TopologyError::Cycle`] if no topological order exists.
    pub fn build(self) -> Result<Topology<C>, TopologyError> {
        let Self {
            blocks,
            connections,
        } = self;
        let len = blocks.len();

        // Phase 1: Distinct adjacency in both directions, plus the list of
        // connections ending at every block (used to route warehouse contents
        // onto input sockets).
        let mut parents = vec![IndexSet::<BlockId>::default(); len];
        let mut children = vec![IndexSet::<BlockId>::default(); len];
        let mut incoming = vec![Vec::new(); len];
        for (idx, connection) in connections.iter().enumerate() {
            parents[connection.target.index()].insert(connection.source);
            children[connection.source.index()].insert(connection.target);
            incoming[connection.target.index()].push(idx);
        }
        let sorted = |sets: Vec<IndexSet<BlockId>>| -> Vec<Vec<BlockId>> {
            sets.into_iter()
                .map(|set| {
                    let mut ids: Vec<_> = set.into_iter().collect();
                    ids.sort_unstable();
                    ids
                })
                .collect()
        };
        let upstream = sorted(parents);
        let downstream = sorted(children);

        // Phase 2: Kahn ordering. Seed with roots, release a child once all of
        // its parents have been placed. Anything left unplaced sits on a cycle.
        let mut parents_left: Vec<usize> = upstream.iter().map(Vec::len).collect();
        let mut ready: VecDeque<BlockId> = parents_left
            .iter()
            .enumerate()
            .filter(|&(_, &left)| left == 0)
            .map(|(idx, _)| BlockId::from_index(idx))
            .collect();
        let mut order = Vec::with_capacity(len);
        while let Some(id) = ready.pop_front() {
            order.push(id);
            for &child in &downstream[id.index()] {
                let left = &mut parents_left[child.index()];
                *left = left.checked_sub(1).expect("TopologyBuilder::build: [1]");
                if *left == 0 {
                    ready.push_back(child);
                }
            }
        }
        if order.len() != len {
            return Err(TopologyError::Cycle);
        }

        Ok(Topology {
            blocks,
            connections: connections.into_iter().collect(),
            upstream,
            downstream,
            incoming,
            order,
        })
    }

    /// Number of blocks added so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether no block has been added yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

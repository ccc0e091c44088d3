//! Peer identities.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A peer's stable identity on the network: its public key bytes.
///
/// Node identities outlive connections. The sync engine keys all of its
/// per-peer state on `NodeId`, so a peer that reconnects from a new
/// address keeps its reputation.
#[derive(Clone, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub Vec<u8>);

impl NodeId {
    /// Creates a node id from raw public key bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        NodeId(bytes.into())
    }

    /// An abbreviated hex form for logs: the first four bytes.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..self.0.len().min(4)])
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short())
    }
}

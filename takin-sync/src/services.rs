//! Collaborator seams.
//!
//! The sync engine consumes storage, block application, witness
//! cryptography, and the peer network through these traits. Production
//! nodes wire in the real services; tests substitute in-memory fakes.

use std::collections::HashSet;

use futures::future::BoxFuture;

use takin_chain::{
    block::{Block, ConfigHash, Header, Height, Witness},
    peer::NodeId,
};

use crate::{
    error::{BoxError, CommitError},
    message::SyncMessage,
};

/// Read access to committed chain state.
pub trait BlockStore: Send + Sync + 'static {
    /// The height of the best committed block, or `None` for an empty
    /// chain.
    fn best_height(&self) -> Option<Height>;

    /// The committed block at `height`, if there is one.
    fn block_at_height(&self, height: Height) -> Option<Block>;
}

/// Asynchronous block application.
///
/// Committing a block is slow (it executes transactions and touches
/// storage), so the committer returns a future the engine spawns. The
/// outcome is delivered back to the scheduler through its own queue;
/// implementations only need to resolve the future.
pub trait BlockCommitter: Send + Sync + 'static {
    /// Applies `block` to the chain.
    ///
    /// The returned future must resolve exactly once, with a
    /// [`CommitError`] variant that lets the scheduler attribute the
    /// failure (see the variant docs).
    fn commit(&self, block: Block) -> BoxFuture<'static, Result<(), CommitError>>;
}

/// Header and witness codec plus signature verification, keyed by the
/// active signer configuration.
pub trait HeaderValidator: Send + Sync + 'static {
    /// Decodes raw header bytes.
    ///
    /// The decoded height can only be trusted after
    /// [`verify_witness`](Self::verify_witness) passes.
    fn decode_header(&self, raw: &[u8]) -> Result<Header, BoxError>;

    /// Decodes raw witness bytes.
    fn decode_witness(&self, raw: &[u8]) -> Result<Witness, BoxError>;

    /// Checks the witness against the signer set of the currently
    /// active configuration.
    fn verify_witness(&self, header: &Header, witness: &Witness) -> Result<(), BoxError>;

    /// The hash of the currently active signer configuration.
    ///
    /// Headers that declare a different configuration hash cannot be
    /// verified yet; their validation is deferred to block application.
    fn config_hash(&self) -> ConfigHash;
}

/// The peer network: connected-peer visibility and fire-and-forget
/// message sending.
///
/// Inbound messages do not come through this trait; they arrive on the
/// mpsc receiver handed to the synchronizer at construction.
pub trait SyncNetwork: Send + 'static {
    /// The peers we currently have a connection to.
    fn connected_peers(&self) -> HashSet<NodeId>;

    /// Sends a message to one peer. Delivery is best-effort.
    fn send(&self, peer: &NodeId, message: SyncMessage);

    /// Sends a message to a uniformly random connected peer outside
    /// `exclude`, returning the chosen peer, or `None` if every
    /// connected peer was excluded.
    fn send_to_random_peer(
        &self,
        message: SyncMessage,
        exclude: &HashSet<NodeId>,
    ) -> Option<NodeId>;
}

/// What the embedding node wants the engine to do about an announced
/// configuration change.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConfigAction {
    /// Not relevant; keep syncing.
    Ignore,
    /// Stop syncing so the node can reload configuration.
    PauseSync,
}

/// Decides how to react to `AppliedConfig` announcements.
///
/// Configuration loading itself is the embedding node's business; the
/// engine only pauses when asked to.
pub trait ConfigObserver: Send + 'static {
    /// Called for every `AppliedConfig` message from a non-blacklisted
    /// peer.
    fn applied_config(&self, peer: &NodeId, height: Height, config_hash: &ConfigHash)
        -> ConfigAction;
}

/// The default observer: configuration changes never pause sync.
impl ConfigObserver for () {
    fn applied_config(&self, _: &NodeId, _: Height, _: &ConfigHash) -> ConfigAction {
        ConfigAction::Ignore
    }
}

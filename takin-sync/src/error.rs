//! Error types for the sync engine.
//!
//! Errors fall into distinct classes with different handling:
//! protocol violations are peer-scoped (the peer loses reputation and
//! the affected job restarts), transient local failures are retried
//! without touching peer reputation, benign races are treated as
//! success, and ambiguous chain-integrity failures are fatal for the
//! chain because silently proceeding could persist a corrupt chain.

use thiserror::Error;

use takin_chain::block::Height;

/// A type-erased error, used on the collaborator seams.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The failure modes of handing a block to the commit collaborator.
///
/// The scheduler branches on the variant: only [`CommitError::BadBlock`]
/// is attributed to the sending peer.
#[derive(Error, Debug, Clone)]
pub enum CommitError {
    /// The block engine has already been shut down.
    ///
    /// A shutdown race, not an error: the job is dropped silently.
    #[error("block engine is already closed")]
    EngineClosed,

    /// Storage has a rollback pending and cannot accept the block right
    /// now.
    ///
    /// Transient: the commit is resubmitted without touching peer
    /// reputation.
    #[error("storage rollback pending, commit must be retried")]
    PendingRollback,

    /// A block at this height was already committed by another path,
    /// typically normal block production racing fast sync.
    ///
    /// Treated as success without a commit.
    #[error("block at height {0} is already committed")]
    AlreadyCommitted(Height),

    /// The block failed validation against data this engine requested
    /// and can therefore be attributed to the peer that sent it.
    #[error("block failed validation: {0}")]
    BadBlock(String),

    /// The block does not connect to its predecessor, and the
    /// predecessor was not produced by this engine, so the fault cannot
    /// be attributed.
    ///
    /// Fatal: the engine must halt rather than guess.
    #[error("block does not connect to the previous block")]
    ChainMismatch,
}

/// Errors that stop syncing for the whole chain.
///
/// Everything else the engine handles internally; these are propagated
/// to the embedding node, which must halt block production and sync for
/// the chain until an operator intervenes.
#[derive(Error, Debug)]
pub enum FatalSyncError {
    /// A committed-chain mismatch that cannot be attributed to a peer.
    #[error(
        "block {height} does not connect to the previous block and the fault \
         cannot be attributed to a peer; halting to avoid persisting a corrupt chain"
    )]
    AmbiguousChainMismatch {
        /// The height whose commit failed.
        height: Height,
    },
}

//! The Takin block synchronization engine.
//!
//! This crate lets a node catch up to the rest of its peer network by
//! fetching, validating, ordering, and committing blocks produced by
//! other nodes, while tracking which peers are trustworthy and
//! responsive enough to keep asking.
//!
//! There are two operating modes:
//!
//! - [`FastSynchronizer`](fast::FastSynchronizer) requests up to
//!   `parallelism` blocks from distinct random peers simultaneously and
//!   commits them in strict height order. Signer nodes use it to catch
//!   up before switching to block production.
//! - [`SlowSynchronizer`](slow::SlowSynchronizer) keeps a single
//!   request outstanding and adapts its polling interval to how often
//!   peers actually have new blocks. Read-only replicas use it to
//!   follow the chain without hammering block producers.
//!
//! Both modes consult and update one [`PeerRegistry`](peers::PeerRegistry)
//! before selecting a peer and after every response, and both answer
//! block requests from other peers while they sync.
//!
//! Storage, witness cryptography, and the wire codec are external
//! collaborators, consumed through the traits in [`services`].

#![deny(missing_docs)]
#![forbid(unsafe_code)]

pub mod error;
pub mod fast;
pub mod message;
pub mod messaging;
pub mod packer;
pub mod params;
pub mod peers;
pub mod services;
pub mod sleep;
pub mod slow;

#[cfg(test)]
mod testing;

pub use error::{BoxError, CommitError, FatalSyncError};
pub use fast::FastSynchronizer;
pub use message::SyncMessage;
pub use params::SyncParameters;
pub use peers::PeerRegistry;
pub use slow::SlowSynchronizer;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Raises the shutdown flag of a synchronizer.
///
/// Cancellation is cooperative: the synchronizer checks the flag at
/// each loop iteration, drains the commits it has already issued, and
/// returns. There is no forced interruption of an in-flight commit.
#[derive(Clone, Debug)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    pub(crate) fn new(flag: Arc<AtomicBool>) -> Self {
        ShutdownHandle(flag)
    }

    /// Asks the synchronizer to stop. It finishes the current tick and
    /// returns.
    pub fn shutdown(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// Why a synchronizer returned control to its caller.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SyncOutcome {
    /// The exit condition was reached: every responsive peer has been
    /// drained and the minimum sync height (if any) was met.
    PeersDrained,
    /// The shutdown flag was raised.
    ShutDown,
    /// A configuration change needs to be applied before syncing can
    /// continue; the embedding node should reload and restart sync.
    ConfigChange,
}

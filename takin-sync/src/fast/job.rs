//! Fast-sync job bookkeeping.

use std::time::Instant;

use takin_chain::{
    block::{Block, Header, Height, Witness},
    peer::NodeId,
};

/// One in-flight fetch-and-commit unit for a specific height.
///
/// A job exists for a height only while that height is unresolved:
/// it is created when a request is sent and destroyed when the height
/// is committed (or the engine turned out to be closed). At most one
/// job exists per height, and only the scheduler mutates it.
#[derive(Debug)]
pub(crate) struct Job {
    /// The height this job is responsible for.
    pub height: Height,
    /// The peer the request went to. Replies from anyone else are
    /// protocol violations.
    pub peer: NodeId,
    /// The verified header, once received.
    pub header: Option<Header>,
    /// The witness belonging to `header`.
    pub witness: Option<Witness>,
    /// The assembled block, once the body has arrived.
    pub block: Option<Block>,
    /// True while a commit for this job is in flight.
    pub committing: bool,
    /// When the request was sent; drives the job timeout.
    pub started_at: Instant,
    /// Set when a restart found no available peer; retried every tick.
    pub restart_failed: bool,
}

impl Job {
    pub fn new(height: Height, peer: NodeId, now: Instant) -> Self {
        Job {
            height,
            peer,
            header: None,
            witness: None,
            block: None,
            committing: false,
            started_at: now,
            restart_failed: false,
        }
    }
}

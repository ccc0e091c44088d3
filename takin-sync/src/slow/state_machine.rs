//! The slow-sync session state machine.
//!
//! Slow sync can only be in one state at a time:
//!
//! - `WaitForAction`: idle, nothing outstanding.
//! - `WaitForReply`: one `GetBlockRange` request is outstanding.
//! - `WaitForCommit`: a received batch is being committed.
//!
//! The machine structurally enforces the single-outstanding-request
//! invariant that keeps a replica from hammering producers: requests
//! are only issued from `WaitForAction`, and calling a transition from
//! the wrong state is a programming error that panics rather than
//! silently overwriting the outstanding request.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use takin_chain::{
    block::{next_height, Height},
    peer::NodeId,
};

/// The slow-sync states.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SlowSyncState {
    /// Idle; the next tick may send a request.
    WaitForAction,
    /// A range request is outstanding.
    WaitForReply,
    /// A received batch is being committed.
    WaitForCommit,
}

/// What the driver should do on this tick.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SlowSyncStep {
    /// Nothing to do.
    Idle,
    /// Request a range starting at `start`, avoiding `exclude_peer` if
    /// other peers are available.
    SendRequest {
        /// The first height to request.
        start: Height,
        /// A peer to avoid: the one whose reply we just gave up on.
        exclude_peer: Option<NodeId>,
    },
}

/// Per-chain slow-sync session state.
#[derive(Debug)]
pub struct SlowSyncSession {
    state: SlowSyncState,
    /// The peer we expect an answer from. Set iff state is not
    /// `WaitForAction`.
    waiting_peer: Option<NodeId>,
    /// The start height we are waiting for. Set iff state is not
    /// `WaitForAction`.
    waiting_height: Option<Height>,
    /// When the outstanding request was sent.
    request_sent_at: Option<Instant>,
    /// When we entered `WaitForAction`.
    idle_since: Instant,
    /// The highest height handed to the committer. Before any block the
    /// chain may be empty, hence the `Option`.
    last_uncommitted: Option<Height>,
    /// The highest height the committer has confirmed.
    last_committed: Option<Height>,
    /// Set by a failed commit until the driver acknowledges it.
    failed_commit: bool,
}

impl SlowSyncSession {
    /// Starts a session at the committed tip.
    pub fn new(tip: Option<Height>, now: Instant) -> Self {
        SlowSyncSession {
            state: SlowSyncState::WaitForAction,
            waiting_peer: None,
            waiting_height: None,
            request_sent_at: None,
            idle_since: now,
            last_uncommitted: tip,
            last_committed: tip,
            failed_commit: false,
        }
    }

    /// The current state.
    pub fn state(&self) -> SlowSyncState {
        self.state
    }

    /// The next height to request: one above the last height already
    /// handed to the committer.
    pub fn start_height(&self) -> Height {
        next_height(self.last_uncommitted)
    }

    /// The highest height the committer has confirmed.
    pub fn last_committed(&self) -> Option<Height> {
        self.last_committed
    }

    /// Is this the range start we are waiting for?
    pub fn is_height_we_wait_for(&self, height: Height) -> bool {
        self.waiting_height == Some(height)
    }

    /// Is this the peer we asked?
    pub fn is_peer_we_wait_for(&self, peer: &NodeId) -> bool {
        self.waiting_peer.as_ref() == Some(peer)
    }

    /// True while handed-over blocks have not all been confirmed.
    pub fn is_waiting_for_commits(&self) -> bool {
        self.last_committed < self.last_uncommitted
    }

    /// Decides what to do on a tick.
    ///
    /// In `WaitForAction` a request is due once the adaptive sleep has
    /// passed. In `WaitForReply` the request is given up after
    /// `max_peer_wait`, and re-issued for the *same* range against a
    /// different peer. `WaitForCommit` is driven by commit outcomes,
    /// not by time.
    pub fn poll(
        &mut self,
        now: Instant,
        current_sleep: Duration,
        max_peer_wait: Duration,
    ) -> SlowSyncStep {
        match self.state {
            SlowSyncState::WaitForAction => {
                if now > self.idle_since + current_sleep {
                    SlowSyncStep::SendRequest {
                        start: self.start_height(),
                        // We don't mind asking the old peer again.
                        exclude_peer: None,
                    }
                } else {
                    SlowSyncStep::Idle
                }
            }
            SlowSyncState::WaitForReply => {
                let sent_at = self
                    .request_sent_at
                    .expect("request_sent_at is set while waiting for a reply");
                if now > sent_at + max_peer_wait {
                    let timed_out = self.waiting_peer.clone();
                    debug!(
                        height = %self.start_height(),
                        peer = ?timed_out,
                        "waited too long for a block range, asking someone else",
                    );
                    self.reset_to_wait_for_action(now);
                    SlowSyncStep::SendRequest {
                        start: self.start_height(),
                        exclude_peer: timed_out,
                    }
                } else {
                    SlowSyncStep::Idle
                }
            }
            SlowSyncState::WaitForCommit => SlowSyncStep::Idle,
        }
    }

    /// Records that a range request was sent to `peer`.
    ///
    /// # Panics
    ///
    /// If a request is already outstanding. That would break the
    /// single-outstanding-request invariant, so it fails loudly.
    pub fn begin_wait_for_reply(&mut self, peer: NodeId, start: Height, now: Instant) {
        assert_eq!(
            self.state,
            SlowSyncState::WaitForAction,
            "begin_wait_for_reply: a request is already outstanding",
        );
        self.state = SlowSyncState::WaitForReply;
        self.waiting_peer = Some(peer);
        self.waiting_height = Some(start);
        self.request_sent_at = Some(now);
    }

    /// Records that `height` was handed to the committer.
    ///
    /// # Panics
    ///
    /// If `height` is below a height already handed over.
    pub fn note_uncommitted(&mut self, height: Height) {
        assert!(
            Some(height) >= self.last_uncommitted,
            "note_uncommitted: height {} is below the pending height {:?}",
            height,
            self.last_uncommitted,
        );
        self.last_uncommitted = Some(height);
    }

    /// Moves to `WaitForCommit` after handing a non-empty batch over.
    ///
    /// # Panics
    ///
    /// If no request was outstanding.
    pub fn enter_wait_for_commit(&mut self) {
        assert_eq!(
            self.state,
            SlowSyncState::WaitForReply,
            "enter_wait_for_commit: no request was outstanding",
        );
        self.state = SlowSyncState::WaitForCommit;
    }

    /// Returns to idle after a reply with zero blocks: nothing to do
    /// yet.
    ///
    /// # Panics
    ///
    /// If no request was outstanding.
    pub fn reply_was_empty(&mut self, now: Instant) {
        assert_eq!(
            self.state,
            SlowSyncState::WaitForReply,
            "reply_was_empty: no request was outstanding",
        );
        self.reset_to_wait_for_action(now);
    }

    /// Records a confirmed commit. Intermediate confirmations update
    /// the committed height; only when the whole outstanding batch is
    /// confirmed does the session return to `WaitForAction`.
    ///
    /// # Panics
    ///
    /// If the committer confirms a height we never handed over.
    pub fn on_successful_commit(&mut self, height: Height, now: Instant) {
        if next_height(self.last_committed) != height {
            warn!(
                committed = %height,
                last = ?self.last_committed,
                "commit confirmation out of sequence",
            );
        }
        assert!(
            Some(height) <= self.last_uncommitted,
            "commit confirmed for height {} above the pending height {:?}",
            height,
            self.last_uncommitted,
        );

        self.last_committed = Some(height);
        if self.state == SlowSyncState::WaitForCommit && !self.is_waiting_for_commits() {
            self.reset_to_wait_for_action(now);
        }
    }

    /// Records a failed commit.
    ///
    /// All the following blocks of the batch depend on the failed one,
    /// so the rest of the batch is discarded and the session rewinds to
    /// the last known-good height.
    pub fn on_failed_commit(&mut self, height: Height, now: Instant) {
        warn!(
            failed = %height,
            last_good = ?self.last_committed,
            "block commit failed, discarding the rest of the batch",
        );
        self.last_uncommitted = self.last_committed;
        self.failed_commit = true;
        if self.state == SlowSyncState::WaitForCommit {
            self.reset_to_wait_for_action(now);
        }
    }

    /// Consumes the failed-commit flag.
    pub fn take_failed_commit(&mut self) -> bool {
        std::mem::take(&mut self.failed_commit)
    }

    fn reset_to_wait_for_action(&mut self, now: Instant) {
        self.state = SlowSyncState::WaitForAction;
        self.waiting_peer = None;
        self.waiting_height = None;
        self.request_sent_at = None;
        self.idle_since = now;
    }
}

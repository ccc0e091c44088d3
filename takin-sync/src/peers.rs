//! The peer health registry: the single source of truth for "should we
//! talk to peer P right now, and how".
//!
//! Peers move between four states:
//!
//! - `Syncable`: nothing known against the peer.
//! - `Unresponsive`: the peer did not answer a request in time. It gets
//!   a new chance after a while, otherwise we would run out of peers to
//!   sync from over time.
//! - `Blacklisted`: the peer accumulated too many protocol violations
//!   inside a sliding time window. It is excluded until the window ages
//!   out or the blacklist timeout passes.
//! - `Drained`: the peer told us it has no blocks above some height.
//!   A header (or status) for a higher height is evidence of more
//!   blocks and makes it syncable again.
//!
//! We use `Status` messages as an indication that there are headers
//! available at the status height minus one (the height in a status
//! message is the block the peer is working on, i.e. its committed
//! height plus one). They also serve as a discovery mechanism, in which
//! we become aware of our neighborhood.
//!
//! All state transitions are driven by the owning synchronizer's
//! thread; resurrection happens lazily when state is read, never on a
//! timer, which keeps the registry purely reactive and trivially
//! testable. None of the operations fail: an unknown peer id is created
//! with default state on first touch.

use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
    time::Instant,
};

use indexmap::IndexMap;
use rand::seq::IteratorRandom;
use tracing::{debug, trace, warn};

use takin_chain::{block::Height, peer::NodeId};

use crate::params::SyncParameters;


/// The reputation state of a single peer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum PeerSyncState {
    /// Nothing known against the peer.
    Syncable,
    /// No timely response; avoided until `since + resurrect_unresponsive_time`.
    Unresponsive {
        /// When the peer became unresponsive. Re-entering the state
        /// does not reset this.
        since: Instant,
    },
    /// Too many errors inside the window; excluded until
    /// `last_error + blacklisting_timeout`, or until the window ages
    /// below the threshold.
    Blacklisted {
        /// When the last error was recorded.
        last_error: Instant,
    },
    /// The peer reported having no blocks above its watermark.
    Drained {
        /// When the peer was last reported drained.
        since: Instant,
    },
}

/// Everything the registry knows about a single peer.
///
/// `maybe_legacy` and `confirmed_modern` are transitional and should be
/// removed once most nodes have upgraded: then every peer can serve the
/// split header/body protocol and we no longer need the single-message
/// fallback.
#[derive(Clone, Debug)]
pub struct KnownState {
    state: PeerSyncState,

    /// The highest height at which the peer claimed to have no more
    /// blocks. `None` means it reported having no blocks at all (or was
    /// never drained). Monotonic: a later, lower drain report never
    /// regresses it.
    drained_at: Option<Height>,

    /// Timestamps of recent errors, oldest first. Bounded to
    /// `max_errors_before_blacklisting` entries.
    error_times: VecDeque<Instant>,

    maybe_legacy: bool,
    confirmed_modern: bool,

    connected: bool,
    disconnected_at: Option<Instant>,
}

impl KnownState {
    fn new() -> Self {
        KnownState {
            state: PeerSyncState::Syncable,
            drained_at: None,
            error_times: VecDeque::new(),
            maybe_legacy: false,
            confirmed_modern: false,
            connected: false,
            disconnected_at: None,
        }
    }

    /// Is the peer usable for a request at `height`?
    ///
    /// Drained peers still serve heights at or below their watermark.
    pub fn is_syncable(&self, height: Height) -> bool {
        match self.state {
            PeerSyncState::Syncable => true,
            PeerSyncState::Drained { .. } => self.drained_at >= Some(height),
            _ => false,
        }
    }

    /// Checks the blacklist, applying the timeout resurrection first.
    pub fn update_and_check_blacklisted(&mut self, now: Instant, params: &SyncParameters) -> bool {
        if let PeerSyncState::Blacklisted { last_error } = self.state {
            // Peers should be given new chances often.
            if now > last_error + params.blacklisting_timeout {
                debug!("peer timed out of blacklist");
                self.state = PeerSyncState::Syncable;
                self.error_times.clear();
            }
        }
        matches!(self.state, PeerSyncState::Blacklisted { .. })
    }

    /// Checks unresponsiveness, applying the timeout resurrection first.
    pub fn update_and_check_unresponsive(
        &mut self,
        now: Instant,
        params: &SyncParameters,
    ) -> bool {
        if let PeerSyncState::Unresponsive { since } = self.state {
            if now > since + params.resurrect_unresponsive_time {
                debug!("peer timed out of unresponsiveness");
                self.state = PeerSyncState::Syncable;
            }
        }
        matches!(self.state, PeerSyncState::Unresponsive { .. })
    }

    /// Checks the drained state, applying the timeout resurrection first.
    ///
    /// Resurrection forgets the watermark: after this long the peer may
    /// well have new blocks, so it gets a clean slate.
    pub fn update_and_check_drained(&mut self, now: Instant, params: &SyncParameters) -> bool {
        if let PeerSyncState::Drained { since } = self.state {
            if now > since + params.resurrect_drained_time {
                debug!("peer timed out of drained");
                self.state = PeerSyncState::Syncable;
                self.drained_at = None;
            }
        }
        matches!(self.state, PeerSyncState::Drained { .. })
    }

    /// Applies every time-based auto-transition.
    pub fn resurrect(&mut self, now: Instant, params: &SyncParameters) {
        self.update_and_check_unresponsive(now, params);
        self.update_and_check_drained(now, params);
        self.update_and_check_blacklisted(now, params);
    }

    /// True while the peer might speak only the legacy protocol.
    pub fn is_maybe_legacy(&self) -> bool {
        !self.confirmed_modern && self.maybe_legacy
    }

    /// True once the peer has proven it speaks the modern protocol.
    pub fn is_confirmed_modern(&self) -> bool {
        self.confirmed_modern
    }

    fn set_maybe_legacy(&mut self, is_legacy: bool) {
        if !self.confirmed_modern {
            self.maybe_legacy = is_legacy;
        }
    }

    fn confirm_modern(&mut self) {
        self.confirmed_modern = true;
        self.maybe_legacy = false;
    }

    /// Marks the peer unresponsive. Idempotent: re-entering the state
    /// does not reset the resurrection timer.
    fn unresponsive(&mut self, reason: &str, now: Instant) {
        match self.state {
            PeerSyncState::Unresponsive { .. } | PeerSyncState::Blacklisted { .. } => {}
            _ => {
                debug!(%reason, "marking peer unresponsive");
                self.state = PeerSyncState::Unresponsive { since: now };
            }
        }
    }

    /// Records an error and escalates to blacklisting once the sliding
    /// window fills up.
    ///
    /// Entries older than `blacklisting_error_timeout` are dropped
    /// first, so errors must keep accruing faster than they age out to
    /// keep a peer blacklisted: the state self-heals otherwise.
    fn record_error(&mut self, reason: &str, now: Instant, params: &SyncParameters) {
        while let Some(&oldest) = self.error_times.front() {
            if now.saturating_duration_since(oldest) >= params.blacklisting_error_timeout {
                self.error_times.pop_front();
            } else {
                break;
            }
        }
        if self.error_times.len() >= params.max_errors_before_blacklisting {
            self.error_times.pop_front();
        }
        self.error_times.push_back(now);

        if self.error_times.len() >= params.max_errors_before_blacklisting {
            if !matches!(self.state, PeerSyncState::Blacklisted { .. }) {
                warn!(%reason, "blacklisting peer");
            }
            self.state = PeerSyncState::Blacklisted { last_error: now };
        } else if matches!(self.state, PeerSyncState::Blacklisted { .. }) {
            debug!("peer errors aged out, removing from blacklist");
            self.state = PeerSyncState::Syncable;
        } else {
            trace!(%reason, errors = self.error_times.len(), "not blacklisting peer yet");
        }
    }

    /// Records that the peer has no blocks above `height` (`None`: no
    /// blocks at all). The watermark never regresses.
    fn drained(&mut self, height: Option<Height>, now: Instant) {
        self.state = PeerSyncState::Drained { since: now };
        if height > self.drained_at {
            self.drained_at = height;
        }
    }

    /// A verified header at `height` is concrete proof of liveness and
    /// data: it resurrects drained peers with a lower watermark, and
    /// unresponsive peers. It never resurrects blacklisted peers.
    fn header_received(&mut self, height: Height) {
        match self.state {
            PeerSyncState::Drained { .. } if Some(height) > self.drained_at => {
                debug!(%height, "got header above drain watermark, peer syncable again");
                self.state = PeerSyncState::Syncable;
            }
            PeerSyncState::Unresponsive { .. } => {
                debug!(%height, "got header from unresponsive peer, peer syncable again");
                self.state = PeerSyncState::Syncable;
            }
            _ => {}
        }
    }

    /// A status message hints that there might be more blocks to fetch.
    ///
    /// Unlike a header it is only a claim, so it resurrects drained
    /// peers but never unresponsive or blacklisted ones.
    fn status_received(&mut self, height: Height) {
        if let PeerSyncState::Drained { .. } = self.state {
            if Some(height) > self.drained_at {
                debug!(%height, "got status above drain watermark, peer syncable again");
                self.state = PeerSyncState::Syncable;
            }
        }
    }

    /// Clears a blacklist unconditionally. Only used by the
    /// minimum-sync-height escape hatch.
    fn whitelist(&mut self) {
        if matches!(self.state, PeerSyncState::Blacklisted { .. }) {
            self.state = PeerSyncState::Syncable;
            self.error_times.clear();
        }
    }

    fn connected(&mut self) {
        self.connected = true;
        self.disconnected_at = None;
    }

    fn disconnected(&mut self, now: Instant) {
        if self.connected {
            self.connected = false;
            self.disconnected_at = Some(now);
        }
    }

    /// True while connected, or for `disconnect_timeout` after a
    /// disconnect, so brief reconnects don't flap the exit check.
    pub fn is_connected(&self, now: Instant, params: &SyncParameters) -> bool {
        self.connected
            || self
                .disconnected_at
                .is_some_and(|at| now.saturating_duration_since(at) < params.disconnect_timeout)
    }

    /// A compact description for diagnostics.
    pub fn describe(&self) -> String {
        format!(
            "state: {:?}, legacy: {}, modern: {}",
            self.state, self.maybe_legacy, self.confirmed_modern
        )
    }
}

/// Keeps track of every known peer's [`KnownState`].
///
/// Owned and driven by exactly one synchronizer; chains synced in
/// parallel must use independent registries.
#[derive(Debug)]
pub struct PeerRegistry {
    params: Arc<SyncParameters>,
    statuses: IndexMap<NodeId, KnownState>,
}

impl PeerRegistry {
    /// Creates an empty registry.
    pub fn new(params: Arc<SyncParameters>) -> Self {
        PeerRegistry {
            params,
            statuses: IndexMap::new(),
        }
    }

    fn state_of(&mut self, peer: &NodeId) -> &mut KnownState {
        self.statuses
            .entry(peer.clone())
            .or_insert_with(KnownState::new)
    }

    /// Adds the peer if it doesn't exist. Does nothing if it exists.
    pub fn note_peer(&mut self, peer: &NodeId) {
        self.state_of(peer);
    }

    /// Marks a peer unresponsive, unless it is blacklisted.
    ///
    /// `reason` describes the circumstances; if a bug caused this, the
    /// log line is the trail.
    pub fn record_unresponsive(&mut self, peer: &NodeId, reason: &str, now: Instant) {
        let params = self.params.clone();
        let state = self.state_of(peer);
        if state.update_and_check_blacklisted(now, &params) {
            return;
        }
        state.unresponsive(reason, now);
    }

    /// Records a protocol violation, blacklisting the peer once the
    /// error window fills up.
    pub fn record_error(&mut self, peer: &NodeId, reason: &str, now: Instant) {
        let params = self.params.clone();
        self.state_of(peer).record_error(reason, now, &params);
    }

    /// Records that a peer has no blocks above `height`, unless it is
    /// blacklisted.
    pub fn record_drained(&mut self, peer: &NodeId, height: Option<Height>, now: Instant) {
        let params = self.params.clone();
        let state = self.state_of(peer);
        if state.update_and_check_blacklisted(now, &params) {
            warn!(peer = %peer, "tried to record a drain for a blacklisted peer");
            return;
        }
        state.drained(height, now);
    }

    /// Records a verified header received from a peer.
    pub fn record_header_received(&mut self, peer: &NodeId, height: Height, now: Instant) {
        let params = self.params.clone();
        let state = self.state_of(peer);
        if state.update_and_check_blacklisted(now, &params) {
            warn!(peer = %peer, "got a header from a blacklisted peer");
            return;
        }
        state.header_received(height);
    }

    /// Records status-message evidence of blocks up to `height`.
    pub fn record_status_received(&mut self, peer: &NodeId, height: Height, now: Instant) {
        let params = self.params.clone();
        let state = self.state_of(peer);
        if state.update_and_check_blacklisted(now, &params) {
            return;
        }
        state.status_received(height);
    }

    /// Is the peer usable for a request at `height`, after applying any
    /// time-based resurrection?
    pub fn is_syncable(&mut self, peer: &NodeId, height: Height, now: Instant) -> bool {
        let params = self.params.clone();
        let state = self.state_of(peer);
        state.resurrect(now, &params);
        state.is_syncable(height)
    }

    /// Checks the blacklist, resurrecting the peer first if its timeout
    /// has passed.
    pub fn is_blacklisted(&mut self, peer: &NodeId, now: Instant) -> bool {
        let params = self.params.clone();
        self.state_of(peer).update_and_check_blacklisted(now, &params)
    }

    /// Flags a peer as possibly speaking only the legacy protocol,
    /// unless it is blacklisted or already confirmed modern.
    pub fn set_maybe_legacy(&mut self, peer: &NodeId, is_legacy: bool, now: Instant) {
        let params = self.params.clone();
        let state = self.state_of(peer);
        if state.update_and_check_blacklisted(now, &params) {
            return;
        }
        state.set_maybe_legacy(is_legacy);
    }

    /// True while the peer might speak only the legacy protocol.
    pub fn is_maybe_legacy(&mut self, peer: &NodeId) -> bool {
        self.state_of(peer).is_maybe_legacy()
    }

    /// True once the peer has proven it speaks the modern protocol.
    pub fn is_confirmed_modern(&mut self, peer: &NodeId) -> bool {
        self.state_of(peer).is_confirmed_modern()
    }

    /// Records proof that the peer speaks the modern protocol.
    pub fn confirm_modern(&mut self, peer: &NodeId) {
        self.state_of(peer).confirm_modern();
    }

    /// Runs resurrection for all peers, then returns the peers we
    /// should *not* sync from at `height`.
    ///
    /// `now` is passed in rather than read from the clock to keep this
    /// pure and testable.
    pub fn excluded_non_syncable(&mut self, height: Height, now: Instant) -> HashSet<NodeId> {
        self.resurrect_peers(now);
        self.statuses
            .iter()
            .filter(|(_, state)| !(state.is_syncable(height) && !state.is_maybe_legacy()))
            .map(|(peer, _)| peer.clone())
            .collect()
    }

    /// A random peer flagged maybe-legacy that can serve `height`,
    /// outside `exclude`.
    pub fn random_legacy_peer(
        &mut self,
        height: Height,
        exclude: &HashSet<NodeId>,
    ) -> Option<NodeId> {
        self.statuses
            .iter()
            .filter(|(peer, state)| {
                state.is_maybe_legacy() && state.is_syncable(height) && !exclude.contains(*peer)
            })
            .map(|(peer, _)| peer.clone())
            .choose(&mut rand::thread_rng())
    }

    /// The number of connected peers that could serve `height`, after
    /// resurrection. Drives the fast-sync exit condition.
    pub fn count_syncable_connected(&mut self, height: Height, now: Instant) -> usize {
        self.resurrect_peers(now);
        let params = self.params.clone();
        self.statuses
            .values()
            .filter(|state| state.is_syncable(height) && state.is_connected(now, &params))
            .count()
    }

    /// Records connection establishment for a set of peers.
    pub fn mark_connected<'a>(&mut self, peers: impl IntoIterator<Item = &'a NodeId>) {
        for peer in peers {
            self.state_of(peer).connected();
        }
    }

    /// Records connection loss for a set of peers.
    pub fn mark_disconnected<'a>(
        &mut self,
        peers: impl IntoIterator<Item = &'a NodeId>,
        now: Instant,
    ) {
        for peer in peers {
            self.state_of(peer).disconnected(now);
        }
    }

    /// Clears every blacklist.
    ///
    /// Escape hatch for when a minimum-sync-height requirement makes
    /// "no peers available" worse than "talk to a previously bad peer
    /// again".
    pub fn revive_all_blacklisted(&mut self) {
        warn!("reviving all blacklisted peers");
        for state in self.statuses.values_mut() {
            state.whitelist();
        }
    }

    /// Per-peer state descriptions for diagnostics.
    pub fn peer_states(&self) -> Vec<(NodeId, String)> {
        self.statuses
            .iter()
            .map(|(peer, state)| (peer.clone(), state.describe()))
            .collect()
    }

    /// The number of currently blacklisted peers, without resurrection.
    pub fn count_blacklisted(&self) -> usize {
        self.statuses
            .values()
            .filter(|state| matches!(state.state, PeerSyncState::Blacklisted { .. }))
            .count()
    }

    /// Forgets all peer state. Used at sync-session end.
    pub fn clear(&mut self) {
        debug!("clearing all peer statuses");
        self.statuses.clear();
    }

    fn resurrect_peers(&mut self, now: Instant) {
        let params = self.params.clone();
        for state in self.statuses.values_mut() {
            state.resurrect(now, &params);
        }
    }
}

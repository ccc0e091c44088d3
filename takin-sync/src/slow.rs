//! Slow sync: the replica-friendly, single-outstanding-request
//! synchronizer.
//!
//! Used by read-only replicas. It consumes blocks at roughly the pace
//! they are produced, to avoid spamming the block producers: one peer
//! at a time is asked for a bounded range, and the polling interval
//! adapts to how many blocks the replies actually carry (see
//! [`crate::sleep`]). To consume blocks fast, use
//! [`crate::fast::FastSynchronizer`] instead.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

use tokio::sync::mpsc;
use tracing::{debug, info, instrument, trace, warn};

use takin_chain::{
    block::{Block, Height},
    peer::NodeId,
};

use crate::{
    error::{CommitError, FatalSyncError},
    message::{CompleteBlock, SyncMessage},
    messaging::RequestServer,
    params::SyncParameters,
    peers::PeerRegistry,
    services::{BlockCommitter, BlockStore, ConfigAction, ConfigObserver, HeaderValidator, SyncNetwork},
    sleep::SleepStats,
    ShutdownHandle, SyncOutcome,
};

mod state_machine;

#[cfg(test)]
mod tests;

pub use state_machine::{SlowSyncSession, SlowSyncState, SlowSyncStep};

/// A commit outcome handed back from the spawned commit task to the
/// sync loop.
#[derive(Debug)]
struct SlowCommitOutcome {
    height: Height,
    peer: NodeId,
    result: Result<(), CommitError>,
}

/// The slow synchronizer: one chain, one outstanding request, polite
/// pacing.
pub struct SlowSynchronizer<S, C, V, N, O = ()>
where
    S: BlockStore,
    C: BlockCommitter,
    V: HeaderValidator,
    N: SyncNetwork,
    O: ConfigObserver,
{
    params: Arc<SyncParameters>,
    store: S,
    committer: Arc<C>,
    validator: V,
    network: N,
    inbound: mpsc::UnboundedReceiver<(NodeId, SyncMessage)>,
    config_observer: O,

    peers: PeerRegistry,
    session: SlowSyncSession,
    sleep: SleepStats,
    server: RequestServer,

    outcome_tx: mpsc::UnboundedSender<SlowCommitOutcome>,
    outcome_rx: mpsc::UnboundedReceiver<SlowCommitOutcome>,
    shutdown: Arc<AtomicBool>,
}

impl<S, C, V, N, O> SlowSynchronizer<S, C, V, N, O>
where
    S: BlockStore,
    C: BlockCommitter,
    V: HeaderValidator,
    N: SyncNetwork,
    O: ConfigObserver,
{
    /// Creates a slow synchronizer over the given collaborators.
    ///
    /// `inbound` carries the peer messages addressed to this chain.
    pub fn new(
        params: Arc<SyncParameters>,
        store: S,
        committer: Arc<C>,
        validator: V,
        network: N,
        inbound: mpsc::UnboundedReceiver<(NodeId, SyncMessage)>,
        config_observer: O,
    ) -> (Self, ShutdownHandle) {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = ShutdownHandle::new(shutdown.clone());
        let now = Instant::now();

        let sync = SlowSynchronizer {
            peers: PeerRegistry::new(params.clone()),
            session: SlowSyncSession::new(None, now),
            sleep: SleepStats::new(&params),
            server: RequestServer::new(),
            params,
            store,
            committer,
            validator,
            network,
            inbound,
            config_observer,
            outcome_tx,
            outcome_rx,
            shutdown,
        };
        (sync, handle)
    }

    /// Follows the chain until shutdown, a configuration change, or a
    /// fatal error.
    ///
    /// We typically wait for a peer to respond before asking for more,
    /// unless it is exceptionally slow.
    #[instrument(skip(self), fields(tip = ?self.store.best_height()))]
    pub async fn sync(&mut self) -> Result<SyncOutcome, FatalSyncError> {
        let tip = self.store.best_height();
        let now = Instant::now();
        self.session = SlowSyncSession::new(tip, now);
        info!(?tip, "starting slow sync");

        let result = loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break Ok(SyncOutcome::ShutDown);
            }

            if let Err(fatal) = self.process_commit_outcomes() {
                break Err(fatal);
            }
            if let Some(outcome) = self.process_messages() {
                break Ok(outcome);
            }

            let now = Instant::now();
            self.maybe_send_request(now);

            let nap = self.sleep.current_sleep().min(self.params.loop_interval);
            tokio::time::sleep(nap).await;
        };

        self.peers.clear();
        info!(outcome = ?result.as_ref().ok(), "slow sync finished");
        result
    }

    /// Drains commit outcomes posted by the commit task.
    fn process_commit_outcomes(&mut self) -> Result<(), FatalSyncError> {
        while let Ok(outcome) = self.outcome_rx.try_recv() {
            let now = Instant::now();
            let SlowCommitOutcome {
                height,
                peer,
                result,
            } = outcome;

            match result {
                Ok(()) | Err(CommitError::AlreadyCommitted(_)) => {
                    trace!(%height, "block committed");
                    metrics::counter!("sync.slow.committed.block.count", 1);
                    self.server.invalidate_tip_cache();
                    self.session.on_successful_commit(height, now);
                }
                Err(CommitError::ChainMismatch) => {
                    return Err(FatalSyncError::AmbiguousChainMismatch { height });
                }
                Err(error @ (CommitError::EngineClosed | CommitError::PendingRollback)) => {
                    debug!(%height, %error, "transient commit failure");
                    self.session.on_failed_commit(height, now);
                }
                Err(CommitError::BadBlock(reason)) => {
                    self.peers.record_error(
                        &peer,
                        &format!("sent a block that failed to commit: {reason}"),
                        now,
                    );
                    self.session.on_failed_commit(height, now);
                }
            }
        }
        Ok(())
    }

    /// Drains inbound peer messages.
    ///
    /// The only reply we expect is `BlockRange`; everything else is
    /// either a request we answer or noise we drop.
    fn process_messages(&mut self) -> Option<SyncOutcome> {
        while let Ok((peer, message)) = self.inbound.try_recv() {
            let now = Instant::now();
            if self.peers.is_blacklisted(&peer, now) {
                continue;
            }
            self.peers.note_peer(&peer);
            if matches!(
                message,
                SyncMessage::GetBlockHeaderAndBlock { .. } | SyncMessage::BlockHeader { .. }
            ) {
                self.peers.confirm_modern(&peer);
            }

            match message {
                // We answer any get request.
                SyncMessage::GetBlockAtHeight { height } => {
                    self.server
                        .send_block_at_height(&self.store, &self.network, &peer, height)
                }
                SyncMessage::GetBlockHeaderAndBlock { height } => self
                    .server
                    .send_block_header_and_block(&self.store, &self.network, &peer, height),
                SyncMessage::GetBlockRange { start_height } => {
                    self.server
                        .send_block_range(&self.store, &self.network, &peer, start_height)
                }

                SyncMessage::BlockRange {
                    start_height,
                    blocks,
                    ..
                } => {
                    let processed = self.handle_block_range(&peer, start_height, blocks, now);
                    let params = self.params.clone();
                    self.sleep.observe(processed, &params);
                    metrics::gauge!(
                        "sync.slow.sleep.ms",
                        self.sleep.current_sleep().as_millis() as f64
                    );
                }

                SyncMessage::AppliedConfig {
                    height,
                    config_hash,
                } => {
                    if self
                        .config_observer
                        .applied_config(&peer, height, &config_hash)
                        == ConfigAction::PauseSync
                    {
                        info!(%height, "pausing slow sync for a configuration change");
                        return Some(SyncOutcome::ConfigChange);
                    }
                }

                other => trace!(%peer, message = other.name(), "dropping unexpected message"),
            }
        }
        None
    }

    /// Sends a range request if the state machine says one is due.
    fn maybe_send_request(&mut self, now: Instant) {
        let step = self.session.poll(
            now,
            self.sleep.current_sleep(),
            self.params.slow_sync_max_peer_wait_time,
        );
        if let SlowSyncStep::SendRequest {
            start,
            exclude_peer,
        } = step
        {
            self.send_range_request(start, exclude_peer, now);
        }
    }

    fn send_range_request(&mut self, start: Height, exclude_peer: Option<NodeId>, now: Instant) {
        let mut exclude = self.peers.excluded_non_syncable(start, now);

        // Sometimes we prefer not to use the same peer as last time,
        // but only if that leaves us somebody to ask.
        if let Some(prev) = exclude_peer {
            let others = self
                .network
                .connected_peers()
                .into_iter()
                .filter(|p| !exclude.contains(p) && *p != prev)
                .count();
            if others > 0 {
                exclude.insert(prev);
            }
        }

        let message = SyncMessage::GetBlockRange {
            start_height: start,
        };
        match self.network.send_to_random_peer(message, &exclude) {
            Some(peer) => {
                let _ = self.session.take_failed_commit();
                debug!(%peer, %start, "requested block range");
                self.session.begin_wait_for_reply(peer, start, now);
            }
            None => warn!(
                height = %start,
                "no peers to request blocks from, cannot proceed"
            ),
        }
    }

    /// Validates a received block range and hands it to the committer.
    ///
    /// Returns the number of accepted blocks; the sleep calculator
    /// feeds on it.
    fn handle_block_range(
        &mut self,
        peer: &NodeId,
        start: Height,
        blocks: Vec<CompleteBlock>,
        now: Instant,
    ) -> usize {
        if self.session.state() != SlowSyncState::WaitForReply {
            if self.session.take_failed_commit() {
                // The previous batch failed while this reply was in
                // flight; it builds on discarded blocks, so drop it.
                debug!(%peer, "dropping block range received after a failed commit");
                return 0;
            }
            self.peers.record_error(
                peer,
                &format!("sent a block range while we were not waiting for one ({start})"),
                now,
            );
            return 0;
        }

        if !self.session.is_height_we_wait_for(start) {
            self.peers.record_error(
                peer,
                &format!(
                    "sent a block range starting at {start}, expected {}",
                    self.session.start_height()
                ),
                now,
            );
            return 0;
        }

        if !self.session.is_peer_we_wait_for(peer) {
            // Probably our original request timed out and this is the
            // late answer. We are waiting for exactly this range, so
            // use it.
            debug!(%peer, %start, "block range from an unexpected peer, using it anyway");
        }

        let mut batch = Vec::new();
        let mut expected = start;
        for complete in &blocks {
            match self.check_range_block(peer, complete, expected, now) {
                Some(block) => {
                    batch.push(block);
                    expected = expected.next();
                }
                // Validation failed; give up on the rest of the range.
                None => break,
            }
        }

        let processed = batch.len();
        debug!(%peer, %start, processed, "handled block range");
        if processed == 0 {
            self.session.reply_was_empty(now);
            return 0;
        }

        for block in &batch {
            self.session.note_uncommitted(block.height());
        }
        self.session.enter_wait_for_commit();
        self.spawn_commit_chain(peer.clone(), batch);
        processed
    }

    /// Decodes and verifies one block of a range.
    fn check_range_block(
        &mut self,
        peer: &NodeId,
        complete: &CompleteBlock,
        expected: Height,
        now: Instant,
    ) -> Option<Block> {
        if complete.header.is_empty() {
            let reason = if complete.witness.is_empty() {
                format!("sent an empty header at height {expected}")
            } else {
                format!("sent a witness without a header at height {expected}")
            };
            self.peers.record_error(peer, &reason, now);
            return None;
        }

        let header = match self.validator.decode_header(&complete.header) {
            Ok(header) => header,
            Err(error) => {
                self.peers
                    .record_error(peer, &format!("sent an undecodable header: {error}"), now);
                return None;
            }
        };

        if header.height != expected {
            self.peers.record_error(
                peer,
                &format!("sent header height {}, expected {expected}", header.height),
                now,
            );
            return None;
        }

        let witness = match self.validator.decode_witness(&complete.witness) {
            Ok(witness) => witness,
            Err(error) => {
                self.peers
                    .record_error(peer, &format!("sent an undecodable witness: {error}"), now);
                return None;
            }
        };

        // If the header declares a different configuration we cannot
        // validate the witness against the signer list yet; worst case
        // the commit attempt fails later.
        let verifiable = header
            .config_hash
            .map_or(true, |hash| hash == self.validator.config_hash());
        if verifiable {
            if let Err(error) = self.validator.verify_witness(&header, &witness) {
                self.peers.record_error(
                    peer,
                    &format!("sent an invalid witness at height {expected}: {error}"),
                    now,
                );
                return None;
            }
        }

        Some(Block {
            header,
            witness,
            transactions: complete.transactions.clone(),
        })
    }

    /// Commits a batch in order on a background task.
    ///
    /// Outcomes are posted back to the loop; a failed commit stops the
    /// chain, because the following blocks depend on the failed one.
    fn spawn_commit_chain(&self, peer: NodeId, batch: Vec<Block>) {
        let committer = self.committer.clone();
        let outcome_tx = self.outcome_tx.clone();
        tokio::spawn(async move {
            for block in batch {
                let height = block.height();
                let result = committer.commit(block).await;
                let failed = result.is_err();
                let _ = outcome_tx.send(SlowCommitOutcome {
                    height,
                    peer: peer.clone(),
                    result,
                });
                if failed {
                    break;
                }
            }
        });
    }

    /// The session state, for diagnostics.
    pub fn session(&self) -> &SlowSyncSession {
        &self.session
    }

    /// The peer registry, for diagnostics.
    pub fn peer_registry(&self) -> &PeerRegistry {
        &self.peers
    }
}

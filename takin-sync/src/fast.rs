//! Fast sync: the parallel, windowed, multi-peer block-fetch pipeline.
//!
//! This synchronizer fetches blocks by requesting `parallelism`
//! heights from distinct random peers simultaneously. Peers respond to
//! a request with a `BlockHeader` immediately followed by an
//! `UnfinishedBlock`; if they don't have the block they respond with
//! the header of their own tip, and if they have no blocks at all,
//! with an empty header and witness.
//!
//! Completed jobs are committed strictly in ascending height order:
//! commits are issued to the (asynchronous) commit collaborator one at
//! a time, and a height is never handed over while a lower height's
//! outcome is still unknown.
//!
//! Requests that time out restart against a different peer, and the
//! silent peer takes a liveness penalty; the first ambiguous timeout is
//! forgiven as "maybe this peer only speaks the legacy protocol" so
//! protocol-version mismatches aren't punished as failures.
//!
//! When we start we know nothing about our neighborhood. We rely on two
//! discovery mechanisms: the random-peer send primitive (which tells us
//! who a request actually went to), and listening for messages from
//! peers in normal sync mode, which broadcast their status regularly.
//! Together they give a fairly complete picture of the network within a
//! few seconds, which matters because the more peers we know, the more
//! reliably we can tell whether we're up to date.

use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

use tokio::sync::mpsc;
use tracing::{debug, info, instrument, trace};

use takin_chain::{
    block::{next_height, Block, Height},
    peer::NodeId,
};

use crate::{
    error::{CommitError, FatalSyncError},
    message::{CompleteBlock, SyncMessage},
    messaging::RequestServer,
    params::SyncParameters,
    peers::PeerRegistry,
    services::{BlockCommitter, BlockStore, ConfigAction, ConfigObserver, HeaderValidator, SyncNetwork},
    ShutdownHandle, SyncOutcome,
};

mod job;


use job::Job;

/// A commit outcome handed back from a spawned commit task to the
/// scheduler loop.
///
/// Outcomes are immutable values; only the loop ever touches the jobs
/// themselves, so no locking is needed anywhere in the scheduler.
#[derive(Debug)]
struct CommitOutcome {
    height: Height,
    peer: NodeId,
    result: Result<(), CommitError>,
}

/// When the sync loop should stop on its own.
enum ExitCondition {
    /// Only on shutdown (or a fatal error).
    Never,
    /// When every responsive connected peer is drained, but not before
    /// `deadline` and not below the configured minimum height.
    ResponsiveDrained {
        deadline: Instant,
    },
}

/// The fast synchronizer.
pub struct FastSynchronizer<S, C, V, N, O = ()>
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
    /// In-flight jobs by height. A `BTreeMap` so the commit walk sees
    /// ascending heights.
    jobs: BTreeMap<Height, Job>,
    /// Our view of the committed tip. `None` before the first block.
    tip: Option<Height>,
    /// The connected set as of the previous tick, to turn the network's
    /// snapshots into connect/disconnect events.
    last_connected: HashSet<NodeId>,
    server: RequestServer,

    outcome_tx: mpsc::UnboundedSender<CommitOutcome>,
    outcome_rx: mpsc::UnboundedReceiver<CommitOutcome>,
    shutdown: Arc<AtomicBool>,
}

impl<S, C, V, N, O> FastSynchronizer<S, C, V, N, O>
where
    S: BlockStore,
    C: BlockCommitter,
    V: HeaderValidator,
    N: SyncNetwork,
    O: ConfigObserver,
{
    /// Creates a fast synchronizer over the given collaborators.
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

        let sync = FastSynchronizer {
            peers: PeerRegistry::new(params.clone()),
            jobs: BTreeMap::new(),
            tip: None,
            last_connected: HashSet::new(),
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

    /// Syncs until we are reasonably sure we're up to date with our
    /// peers. Validators call this before starting to build blocks.
    ///
    /// We consider ourselves up to date when at least `exit_delay` has
    /// passed since start, the configured minimum height (if any) has
    /// been reached, and no syncable connected peer remains at our next
    /// height. The delay requirement exists so that early-connection
    /// asymmetry cannot create a false "no peers left" signal.
    ///
    /// Note that being in contact with all current signers proves
    /// nothing by itself: any of them could have turned rogue and been
    /// excluded from future signer lists, so all peers are treated as
    /// potentially adversarial replicas throughout.
    #[instrument(skip(self), fields(tip = ?self.store.best_height()))]
    pub async fn sync_until_responsive_peers_drained(
        &mut self,
    ) -> Result<SyncOutcome, FatalSyncError> {
        let deadline = Instant::now() + self.params.exit_delay;
        self.sync_until(ExitCondition::ResponsiveDrained { deadline })
            .await
    }

    /// Syncs until shutdown, a configuration change, or a fatal error.
    #[instrument(skip(self), fields(tip = ?self.store.best_height()))]
    pub async fn sync_until_shutdown(&mut self) -> Result<SyncOutcome, FatalSyncError> {
        self.sync_until(ExitCondition::Never).await
    }

    async fn sync_until(
        &mut self,
        exit_condition: ExitCondition,
    ) -> Result<SyncOutcome, FatalSyncError> {
        self.tip = self.store.best_height();
        info!(tip = ?self.tip, "starting fast sync");

        let result = loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break Ok(SyncOutcome::ShutDown);
            }
            let now = Instant::now();

            self.refresh_connectivity(now);
            self.refill_jobs(now);
            if let Some(outcome) = self.process_messages(now) {
                break Ok(outcome);
            }
            if let Err(fatal) = self.process_done_jobs(now) {
                break Err(fatal);
            }
            self.process_stale_jobs(now);
            self.start_pending_commit();
            self.update_metrics();

            if self.exit_reached(&exit_condition, now) {
                break Ok(SyncOutcome::PeersDrained);
            }

            tokio::time::sleep(self.params.loop_interval).await;
        };

        self.teardown().await;
        info!(tip = ?self.tip, outcome = ?result.as_ref().ok(), "fast sync finished");
        result
    }

    fn exit_reached(&mut self, exit_condition: &ExitCondition, now: Instant) -> bool {
        match exit_condition {
            ExitCondition::Never => false,
            ExitCondition::ResponsiveDrained { deadline } => {
                now >= *deadline
                    && self
                        .params
                        .must_sync_until_height
                        .map_or(true, |must| self.tip >= Some(must))
                    && self
                        .peers
                        .count_syncable_connected(next_height(self.tip), now)
                        == 0
            }
        }
    }

    /// Turns the network's connected-peer snapshot into registry
    /// connect/disconnect events.
    fn refresh_connectivity(&mut self, now: Instant) {
        let current = self.network.connected_peers();
        self.peers
            .mark_connected(current.difference(&self.last_connected));
        self.peers
            .mark_disconnected(self.last_connected.difference(&current), now);
        self.last_connected = current;
    }

    /// Keeps `parallelism` jobs in flight for the next heights above
    /// the tip.
    fn refill_jobs(&mut self, now: Instant) {
        while self.jobs.len() < self.params.parallelism {
            let next = self
                .jobs
                .keys()
                .next_back()
                .map(|highest| highest.next())
                .unwrap_or_else(|| next_height(self.tip));
            if !self.start_job(next, now) {
                break;
            }
        }
    }

    /// Requests `height` from a random eligible peer.
    ///
    /// Modern peers are preferred; if none is eligible we fall back to
    /// a peer that might only speak the legacy protocol. Returns false
    /// if nobody could be asked.
    fn start_job(&mut self, height: Height, now: Instant) -> bool {
        let mut exclude = self.peers.excluded_non_syncable(height, now);
        // Distinct peers per job, so one slow peer stalls one height.
        // A job being restarted may go back to its own peer, so only
        // other heights' peers count as taken.
        let assigned: HashSet<NodeId> = self
            .jobs
            .values()
            .filter(|job| job.height != height)
            .map(|job| job.peer.clone())
            .collect();
        exclude.extend(assigned.iter().cloned());

        if let Some(peer) = self
            .network
            .send_to_random_peer(SyncMessage::GetBlockHeaderAndBlock { height }, &exclude)
        {
            self.add_job(height, peer, now);
            return true;
        }

        // No modern peer to sync from; try a legacy one.
        if let Some(peer) = self.peers.random_legacy_peer(height, &assigned) {
            self.network
                .send(&peer, SyncMessage::GetBlockAtHeight { height });
            self.add_job(height, peer, now);
            return true;
        }

        // Nobody at all. If we are required to reach a minimum height,
        // a previously bad peer is better than stalling forever.
        if self
            .params
            .must_sync_until_height
            .is_some_and(|must| self.tip < Some(must))
            && self.peers.count_blacklisted() > 0
        {
            self.peers.revive_all_blacklisted();
        }
        false
    }

    fn add_job(&mut self, height: Height, peer: NodeId, now: Instant) {
        self.peers.note_peer(&peer);
        match self.jobs.insert(height, Job::new(height, peer, now)) {
            Some(old) => debug!(%height, old_peer = %old.peer, "restarted job"),
            None => debug!(%height, "started job"),
        }
    }

    /// Restarts a job against a different peer; if none is available
    /// the job is flagged and retried every tick.
    fn restart_job(&mut self, height: Height, now: Instant) {
        metrics::counter!("sync.fast.restarted.job.count", 1);
        if !self.start_job(height, now) {
            if let Some(job) = self.jobs.get_mut(&height) {
                job.restart_failed = true;
            }
        }
    }

    /// Drains and dispatches inbound peer messages.
    fn process_messages(&mut self, now: Instant) -> Option<SyncOutcome> {
        while let Ok((peer, message)) = self.inbound.try_recv() {
            if self.peers.is_blacklisted(&peer, now) {
                continue;
            }
            self.peers.note_peer(&peer);
            if matches!(
                message,
                SyncMessage::GetBlockHeaderAndBlock { .. } | SyncMessage::BlockHeader { .. }
            ) {
                // Speaking the split protocol proves the peer is modern.
                self.peers.confirm_modern(&peer);
            }

            match message {
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

                SyncMessage::BlockHeader {
                    header,
                    witness,
                    requested_height,
                } => {
                    self.handle_block_header(&peer, header, witness, requested_height, now);
                }
                SyncMessage::UnfinishedBlock {
                    header,
                    transactions,
                } => self.handle_unfinished_block(&peer, header, transactions, now),
                SyncMessage::CompleteBlock { block } => {
                    self.handle_complete_block(&peer, block, now)
                }

                SyncMessage::Status { height } => {
                    // The status height is the peer's next block, so it
                    // is evidence of blocks up to the height below it.
                    if let Some(evidence) = height.prev() {
                        self.peers.record_status_received(&peer, evidence, now);
                    }
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
                        info!(%height, "pausing fast sync for a configuration change");
                        return Some(SyncOutcome::ConfigChange);
                    }
                }

                SyncMessage::BlockRange { .. } => {
                    trace!(%peer, "dropping block range, fast sync does not request ranges")
                }
            }
        }
        None
    }

    /// Validates a header reply against its outstanding job.
    ///
    /// Returns true if the header was accepted and recorded.
    fn handle_block_header(
        &mut self,
        peer: &NodeId,
        header_raw: Vec<u8>,
        witness_raw: Vec<u8>,
        requested: Height,
        now: Instant,
    ) -> bool {
        let (job_peer, already_has_header) = match self.jobs.get(&requested) {
            Some(job) => (job.peer.clone(), job.header.is_some()),
            None => {
                // Unsolicited headers may be an adversary trying to get
                // us to restart jobs, so they cost reputation.
                self.peers.record_error(
                    peer,
                    &format!("sent an unsolicited header for height {requested}"),
                    now,
                );
                return false;
            }
        };
        if already_has_header {
            self.peers.record_error(
                peer,
                &format!("sent a second header for height {requested}"),
                now,
            );
            return false;
        }
        if job_peer != *peer {
            self.peers.record_error(
                peer,
                &format!("sent a header for another peer's job at height {requested}"),
                now,
            );
            return false;
        }

        if header_raw.is_empty() && witness_raw.is_empty() {
            // The peer says it has no blocks at all; try another peer.
            debug!(%peer, %requested, "peer drained with no blocks");
            self.peers.record_drained(peer, None, now);
            self.restart_job(requested, now);
            return false;
        }

        let header = match self.validator.decode_header(&header_raw) {
            Ok(header) => header,
            Err(error) => {
                self.peers
                    .record_error(peer, &format!("sent an undecodable header: {error}"), now);
                self.restart_job(requested, now);
                return false;
            }
        };
        let peer_best = header.height;

        if peer_best > requested {
            // A peer cannot claim to lack data beyond a height it
            // itself reports having exceeded.
            self.peers.record_error(
                peer,
                &format!("claims to lack height {requested} but reports tip {peer_best}"),
                now,
            );
            self.restart_job(requested, now);
            return false;
        }

        if peer_best < requested {
            // The peer doesn't have the block we wanted. Remember its
            // tip and try another peer.
            debug!(%peer, %requested, %peer_best, "peer drained");
            self.peers.record_drained(peer, Some(peer_best), now);
            self.restart_job(requested, now);
            return false;
        }

        let witness = match self.validator.decode_witness(&witness_raw) {
            Ok(witness) => witness,
            Err(error) => {
                self.peers
                    .record_error(peer, &format!("sent an undecodable witness: {error}"), now);
                self.restart_job(requested, now);
                return false;
            }
        };

        // A header built under a configuration we haven't activated
        // cannot be checked against the current signer set; its
        // validation is deferred to block application.
        let verifiable = header
            .config_hash
            .map_or(true, |hash| hash == self.validator.config_hash());
        if verifiable {
            if let Err(error) = self.validator.verify_witness(&header, &witness) {
                self.peers.record_error(
                    peer,
                    &format!("sent an invalid witness at height {requested}: {error}"),
                    now,
                );
                self.restart_job(requested, now);
                return false;
            }
        }

        trace!(%peer, %requested, "header accepted");
        if let Some(job) = self.jobs.get_mut(&requested) {
            job.header = Some(header);
            job.witness = Some(witness);
        }
        self.peers.record_header_received(peer, peer_best, now);
        true
    }

    /// Matches a block body against the job whose header it claims to
    /// complete.
    fn handle_unfinished_block(
        &mut self,
        peer: &NodeId,
        header_raw: Vec<u8>,
        transactions: Vec<Vec<u8>>,
        now: Instant,
    ) {
        let height = match self.validator.decode_header(&header_raw) {
            Ok(header) => header.height,
            Err(error) => {
                self.peers.record_error(
                    peer,
                    &format!("sent a body with an undecodable header: {error}"),
                    now,
                );
                return;
            }
        };

        let rejection = match self.jobs.get(&height) {
            None => Some("sent an unsolicited block body"),
            Some(job) if job.block.is_some() => Some("sent a second body"),
            Some(job) if job.peer != *peer => Some("sent a body for another peer's job"),
            Some(job) if !job.header.as_ref().is_some_and(|h| h.raw == header_raw) => {
                Some("sent a body that does not match the accepted header")
            }
            Some(_) => None,
        };
        if let Some(reason) = rejection {
            self.peers
                .record_error(peer, &format!("{reason} at height {height}"), now);
            return;
        }

        trace!(%peer, %height, "block body accepted");
        if let Some(job) = self.jobs.get_mut(&height) {
            // The witness was verified together with the header.
            if let (Some(header), Some(witness)) = (job.header.clone(), job.witness.clone()) {
                job.block = Some(Block {
                    header,
                    witness,
                    transactions,
                });
            }
        }
    }

    /// Handles the legacy single-message protocol: a complete block is
    /// just a header reply and a body in one.
    fn handle_complete_block(&mut self, peer: &NodeId, block: CompleteBlock, now: Instant) {
        if !self.peers.is_maybe_legacy(peer) {
            // We only expect complete blocks from legacy peers.
            trace!(%peer, "dropping complete block from a peer not marked legacy");
            return;
        }
        let CompleteBlock {
            height,
            header,
            witness,
            transactions,
        } = block;
        if self.handle_block_header(peer, header.clone(), witness, height, now) {
            self.handle_unfinished_block(peer, header, transactions, now);
        }
    }

    /// Drains commit outcomes and retires the finished jobs.
    fn process_done_jobs(&mut self, now: Instant) -> Result<(), FatalSyncError> {
        while let Ok(outcome) = self.outcome_rx.try_recv() {
            self.process_done_job(outcome, now, false)?;
        }
        Ok(())
    }

    fn process_done_job(
        &mut self,
        outcome: CommitOutcome,
        now: Instant,
        final_drain: bool,
    ) -> Result<(), FatalSyncError> {
        let CommitOutcome {
            height,
            peer,
            result,
        } = outcome;
        let Some(job) = self.jobs.get_mut(&height) else {
            return Ok(());
        };
        job.committing = false;

        match result {
            Ok(()) | Err(CommitError::AlreadyCommitted(_)) => {
                trace!(%height, "block committed");
                metrics::counter!("sync.fast.committed.block.count", 1);
                self.jobs.remove(&height);
                self.tip = Some(height);
                self.server.invalidate_tip_cache();
            }
            Err(CommitError::EngineClosed) => {
                // A shutdown race, not an error.
                debug!(%height, "dropping job, the block engine is closed");
                self.jobs.remove(&height);
            }
            Err(CommitError::PendingRollback) => {
                // Transient: the job keeps its block and the commit
                // walk resubmits it. The peer did nothing wrong.
                debug!(%height, "commit hit a pending rollback, resubmitting");
            }
            Err(CommitError::BadBlock(reason)) => {
                if self.store.best_height() >= Some(height) {
                    // Normal sync committed this height before our
                    // commit landed: the job is done, just not by us.
                    debug!(%height, "block already in storage, job done");
                    self.jobs.remove(&height);
                    self.tip = Some(height);
                } else {
                    debug!(%height, %reason, "peer sent an invalid block");
                    self.peers.record_error(
                        &peer,
                        &format!("sent block {height} that failed to commit: {reason}"),
                        now,
                    );
                    if final_drain {
                        self.jobs.remove(&height);
                    } else {
                        // The job's data came from a bad peer; drop it
                        // before fetching the height again.
                        if let Some(job) = self.jobs.get_mut(&height) {
                            job.header = None;
                            job.witness = None;
                            job.block = None;
                        }
                        self.restart_job(height, now);
                    }
                }
            }
            Err(CommitError::ChainMismatch) => {
                return Err(FatalSyncError::AmbiguousChainMismatch { height });
            }
        }
        Ok(())
    }

    /// Restarts jobs whose peers have gone quiet.
    ///
    /// The first ambiguous timeout flips the peer to "maybe legacy"
    /// instead of punishing it: it might simply not answer the modern
    /// request. A repeat timeout while still unconfirmed gives the
    /// heuristic up and marks the peer unresponsive. This is the knob
    /// to extend if one grace cycle ever proves too strict.
    fn process_stale_jobs(&mut self, now: Instant) {
        let mut stale: Vec<(Height, Option<NodeId>)> = Vec::new();
        for job in self.jobs.values() {
            if job.restart_failed {
                // No peer was available at restart time. Retry every
                // tick; it only costs a check against local state.
                stale.push((job.height, None));
            } else if job.block.is_none()
                && !job.committing
                && now > job.started_at + self.params.job_timeout
            {
                stale.push((job.height, Some(job.peer.clone())));
            }
        }

        for (height, timed_out_peer) in stale {
            if let Some(peer) = timed_out_peer {
                if self.peers.is_confirmed_modern(&peer) {
                    self.peers.record_unresponsive(
                        &peer,
                        &format!("no response for the job at height {height}"),
                        now,
                    );
                } else if self.peers.is_maybe_legacy(&peer) {
                    // Marked legacy but still silent: probably just
                    // unresponsive. It could still be legacy, and may
                    // prove itself modern after the timeout.
                    self.peers.set_maybe_legacy(&peer, false, now);
                    self.peers.record_unresponsive(
                        &peer,
                        &format!("no response to the legacy request at height {height}"),
                        now,
                    );
                } else {
                    // Assume a legacy node and retry with the
                    // single-message protocol.
                    self.peers.set_maybe_legacy(&peer, true, now);
                }
            }
            self.restart_job(height, now);
        }
    }

    /// Issues the next commit if the lowest job is ready.
    ///
    /// Only the lowest job is ever eligible: commits happen in strict
    /// ascending order, never past a gap, and never while a lower
    /// height's outcome is unknown.
    fn start_pending_commit(&mut self) {
        let Some((&height, job)) = self.jobs.iter_mut().next() else {
            return;
        };
        if job.committing {
            return;
        }
        let Some(block) = job.block.clone() else {
            return;
        };

        debug!(%height, "committing block");
        job.committing = true;
        let future = self.committer.commit(block);
        let outcome_tx = self.outcome_tx.clone();
        let peer = job.peer.clone();
        tokio::spawn(async move {
            let result = future.await;
            let _ = outcome_tx.send(CommitOutcome {
                height,
                peer,
                result,
            });
        });
    }

    /// Drains the outcome of every commit already issued, then releases
    /// job and peer state.
    ///
    /// An in-flight commit is never abandoned: its outcome decides
    /// whether the tip moved.
    async fn teardown(&mut self) {
        let committing = self.jobs.values().filter(|job| job.committing).count();
        debug!(committing, "awaiting in-flight commits before exit");
        for _ in 0..committing {
            match self.outcome_rx.recv().await {
                Some(outcome) => {
                    // Fatal errors no longer matter; we are exiting.
                    let _ = self.process_done_job(outcome, Instant::now(), true);
                }
                None => break,
            }
        }
        self.jobs.clear();
        self.peers.clear();
    }

    fn update_metrics(&self) {
        metrics::gauge!("sync.fast.jobs.in_flight", self.jobs.len() as f64);
        metrics::gauge!(
            "sync.fast.tip.height",
            self.tip.map_or(0.0, |height| height.0 as f64)
        );
        metrics::gauge!(
            "sync.peers.blacklisted",
            self.peers.count_blacklisted() as f64
        );
    }

    /// Our view of the committed tip.
    pub fn tip(&self) -> Option<Height> {
        self.tip
    }

    /// The number of in-flight jobs, for diagnostics.
    pub fn in_flight_jobs(&self) -> usize {
        self.jobs.len()
    }

    /// The peer registry, for diagnostics.
    pub fn peer_registry(&self) -> &PeerRegistry {
        &self.peers
    }
}

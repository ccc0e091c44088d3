//! Tuning parameters for the synchronizers.

use std::time::Duration;

use takin_chain::block::Height;

/// Tuning parameters shared by fast and slow sync.
///
/// The engine never reads configuration from anywhere else: embedders
/// build one `SyncParameters` value and share it by reference across
/// components. It is immutable after construction.
#[derive(Clone, Debug)]
pub struct SyncParameters {
    /// How long a drained peer stays drained before it is given a new
    /// chance to serve us blocks.
    ///
    /// Without resurrection we would run out of peers to sync from over
    /// time.
    pub resurrect_drained_time: Duration,

    /// How long an unresponsive peer is avoided before it is given a
    /// new chance.
    pub resurrect_unresponsive_time: Duration,

    /// The number of block-fetch jobs fast sync keeps in flight, each
    /// against a distinct peer.
    pub parallelism: usize,

    /// Don't exit fast sync for at least this long after starting.
    ///
    /// This gives the connection manager time to accumulate connections
    /// so that random peer selection has more peers to choose from.
    /// Otherwise one peer connecting quicker than the rest can give us
    /// the impression that it is the only reachable node, and we exit
    /// fast sync before we had a chance to sync from the others.
    ///
    /// Sane values: signers 60s, single-node tests 0, multi-node tests
    /// around a second.
    pub exit_delay: Duration,

    /// How long fast sync waits for a response to an outstanding job
    /// before restarting it against a different peer.
    pub job_timeout: Duration,

    /// The scheduler tick: the bound on commit-queue polling and
    /// therefore on timeout resolution.
    pub loop_interval: Duration,

    /// A minimum height that must be reached before fast sync may exit.
    ///
    /// Also gates the blacklist escape hatch: when this height has not
    /// been reached and no peer remains, previously blacklisted peers
    /// are revived rather than giving up.
    pub must_sync_until_height: Option<Height>,

    /// The number of errors inside [`blacklisting_error_timeout`] that
    /// get a peer blacklisted.
    ///
    /// [`blacklisting_error_timeout`]: Self::blacklisting_error_timeout
    pub max_errors_before_blacklisting: usize,

    /// How long a peer stays blacklisted before it is given a new
    /// chance.
    pub blacklisting_timeout: Duration,

    /// The width of the sliding window used for blacklist escalation.
    ///
    /// Errors older than this no longer count towards
    /// [`max_errors_before_blacklisting`], so a peer whose errors age
    /// out faster than they accrue heals on its own.
    ///
    /// [`max_errors_before_blacklisting`]: Self::max_errors_before_blacklisting
    pub blacklisting_error_timeout: Duration,

    /// How long a disconnected peer still counts as connected for the
    /// fast-sync exit check.
    ///
    /// Brief reconnects must not create a false "no peers left" signal.
    pub disconnect_timeout: Duration,

    /// The upper bound for the slow-sync adaptive sleep.
    pub slow_sync_max_sleep: Duration,

    /// The lower bound for the slow-sync adaptive sleep.
    pub slow_sync_min_sleep: Duration,

    /// How long slow sync waits for a block range reply before asking a
    /// different peer.
    pub slow_sync_max_peer_wait_time: Duration,
}

impl Default for SyncParameters {
    fn default() -> Self {
        SyncParameters {
            resurrect_drained_time: Duration::from_secs(10),
            resurrect_unresponsive_time: Duration::from_secs(20),
            parallelism: 10,
            exit_delay: Duration::from_secs(60),
            job_timeout: Duration::from_secs(10),
            loop_interval: Duration::from_millis(100),
            must_sync_until_height: None,
            max_errors_before_blacklisting: 10,
            blacklisting_timeout: Duration::from_secs(600),
            blacklisting_error_timeout: Duration::from_secs(300),
            disconnect_timeout: Duration::from_secs(10),
            slow_sync_max_sleep: Duration::from_millis(600),
            slow_sync_min_sleep: Duration::from_millis(20),
            slow_sync_max_peer_wait_time: Duration::from_secs(2),
        }
    }
}

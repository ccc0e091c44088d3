//! Slow sync unit tests.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::testing::*;

use super::*;

// State machine

fn session_at(now: Instant) -> SlowSyncSession {
    SlowSyncSession::new(None, now)
}

#[test]
fn requests_are_only_due_after_the_sleep() {
    let now = Instant::now();
    let mut session = session_at(now);
    let sleep = Duration::from_millis(500);
    let wait = Duration::from_secs(2);

    assert_eq!(session.poll(now, sleep, wait), SlowSyncStep::Idle);
    assert_eq!(
        session.poll(now + Duration::from_millis(501), sleep, wait),
        SlowSyncStep::SendRequest {
            start: Height(0),
            exclude_peer: None,
        },
    );
}

#[test]
fn a_timed_out_request_is_retried_against_a_different_peer() {
    let now = Instant::now();
    let mut session = session_at(now);
    let sleep = Duration::from_millis(500);
    let wait = Duration::from_secs(2);

    session.begin_wait_for_reply(node(1), Height(0), now);
    assert_eq!(
        session.poll(now + Duration::from_secs(1), sleep, wait),
        SlowSyncStep::Idle
    );

    // The same range, but not the same peer.
    assert_eq!(
        session.poll(now + Duration::from_secs(3), sleep, wait),
        SlowSyncStep::SendRequest {
            start: Height(0),
            exclude_peer: Some(node(1)),
        },
    );
    assert_eq!(session.state(), SlowSyncState::WaitForAction);
}

#[test]
#[should_panic(expected = "already outstanding")]
fn a_second_outstanding_request_is_a_contract_violation() {
    let now = Instant::now();
    let mut session = session_at(now);
    session.begin_wait_for_reply(node(1), Height(0), now);
    session.begin_wait_for_reply(node(2), Height(0), now);
}

#[test]
#[should_panic(expected = "already outstanding")]
fn requesting_while_committing_is_a_contract_violation() {
    let now = Instant::now();
    let mut session = session_at(now);
    session.begin_wait_for_reply(node(1), Height(0), now);
    session.note_uncommitted(Height(0));
    session.enter_wait_for_commit();
    session.begin_wait_for_reply(node(2), Height(1), now);
}

#[test]
#[should_panic(expected = "no request was outstanding")]
fn committing_without_a_request_is_a_contract_violation() {
    let now = Instant::now();
    let mut session = session_at(now);
    session.enter_wait_for_commit();
}

#[test]
#[should_panic(expected = "below the pending height")]
fn handing_over_a_lower_height_is_a_contract_violation() {
    let now = Instant::now();
    let mut session = session_at(now);
    session.note_uncommitted(Height(5));
    session.note_uncommitted(Height(4));
}

#[test]
#[should_panic(expected = "above the pending height")]
fn confirming_an_unknown_commit_is_a_contract_violation() {
    let now = Instant::now();
    let mut session = session_at(now);
    session.on_successful_commit(Height(3), now);
}

#[test]
fn partial_commits_keep_waiting_until_the_batch_is_done() {
    let now = Instant::now();
    let mut session = session_at(now);

    session.begin_wait_for_reply(node(1), Height(0), now);
    session.note_uncommitted(Height(0));
    session.note_uncommitted(Height(1));
    session.note_uncommitted(Height(2));
    session.enter_wait_for_commit();

    session.on_successful_commit(Height(0), now);
    assert_eq!(session.state(), SlowSyncState::WaitForCommit);
    session.on_successful_commit(Height(1), now);
    assert_eq!(session.state(), SlowSyncState::WaitForCommit);

    // The last height of the batch completes it.
    session.on_successful_commit(Height(2), now);
    assert_eq!(session.state(), SlowSyncState::WaitForAction);
    assert_eq!(session.start_height(), Height(3));
}

#[test]
fn a_failed_commit_rewinds_to_the_last_good_height() {
    let now = Instant::now();
    let mut session = session_at(now);

    session.begin_wait_for_reply(node(1), Height(0), now);
    session.note_uncommitted(Height(0));
    session.note_uncommitted(Height(1));
    session.enter_wait_for_commit();

    session.on_successful_commit(Height(0), now);
    session.on_failed_commit(Height(1), now);

    assert_eq!(session.state(), SlowSyncState::WaitForAction);
    assert_eq!(session.start_height(), Height(1));
    assert!(session.take_failed_commit());
    assert!(!session.take_failed_commit());
}

// Driver

type TestSlowSynchronizer = SlowSynchronizer<TestStore, TestCommitter, TestValidator, TestNetwork>;

struct Harness {
    sync: TestSlowSynchronizer,
    store: TestStore,
    committer: TestCommitter,
    network: TestNetwork,
    inbound: mpsc::UnboundedSender<(NodeId, SyncMessage)>,
}

fn harness_with(params: SyncParameters, peers: &[u8]) -> Harness {
    let params = Arc::new(params);
    let store = TestStore::default();
    let committer = TestCommitter::default();
    let network = TestNetwork::with_peers(peers.iter().map(|&b| node(b)));
    let (inbound, inbound_rx) = mpsc::unbounded_channel();
    let (sync, _handle) = SlowSynchronizer::new(
        params,
        store.clone(),
        Arc::new(committer.clone()),
        TestValidator,
        network.clone(),
        inbound_rx,
        (),
    );
    Harness {
        sync,
        store,
        committer,
        network,
        inbound,
    }
}

fn harness() -> Harness {
    harness_with(SyncParameters::default(), &[1, 2])
}

/// Lets spawned commit tasks run.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn a_block_range_is_committed_in_order() {
    let mut h = harness();
    let now = Instant::now() + Duration::from_secs(1);

    h.sync.maybe_send_request(now);
    let sent = h.network.take_sent();
    match &sent[0] {
        (peer, SyncMessage::GetBlockRange { start_height }) => {
            assert_eq!(peer, &node(1));
            assert_eq!(*start_height, Height(0));
        }
        (_, other) => panic!("unexpected message {}", other.name()),
    }
    assert_eq!(h.sync.session.state(), SlowSyncState::WaitForReply);

    let blocks = vec![
        make_complete(Height(0)),
        make_complete(Height(1)),
        make_complete(Height(2)),
    ];
    let processed = h.sync.handle_block_range(&node(1), Height(0), blocks, now);
    assert_eq!(processed, 3);
    assert_eq!(h.sync.session.state(), SlowSyncState::WaitForCommit);

    settle().await;
    h.sync.process_commit_outcomes().expect("no fatal error");

    assert_eq!(
        h.committer.committed_heights(),
        vec![Height(0), Height(1), Height(2)]
    );
    assert_eq!(h.sync.session.state(), SlowSyncState::WaitForAction);
    assert_eq!(h.sync.session.start_height(), Height(3));
}

#[tokio::test]
async fn an_empty_reply_means_nothing_to_do_yet() {
    let mut h = harness();
    let now = Instant::now() + Duration::from_secs(1);

    h.sync.maybe_send_request(now);
    let processed = h.sync.handle_block_range(&node(1), Height(0), Vec::new(), now);

    assert_eq!(processed, 0);
    assert_eq!(h.sync.session.state(), SlowSyncState::WaitForAction);
    assert!(h.committer.committed_heights().is_empty());
}

#[tokio::test]
async fn a_reply_from_the_wrong_peer_is_still_used() {
    let mut h = harness();
    let now = Instant::now() + Duration::from_secs(1);

    h.sync.maybe_send_request(now);
    let processed =
        h.sync
            .handle_block_range(&node(2), Height(0), vec![make_complete(Height(0))], now);

    assert_eq!(processed, 1);
    assert_eq!(h.sync.session.state(), SlowSyncState::WaitForCommit);
}

#[tokio::test]
async fn unsolicited_ranges_blacklist_the_sender() {
    let mut h = harness_with(
        SyncParameters {
            max_errors_before_blacklisting: 2,
            ..SyncParameters::default()
        },
        &[1, 2],
    );
    let now = Instant::now();

    h.sync
        .handle_block_range(&node(2), Height(0), vec![make_complete(Height(0))], now);
    assert!(!h.sync.peers.is_blacklisted(&node(2), now));
    h.sync
        .handle_block_range(&node(2), Height(0), vec![make_complete(Height(0))], now);
    assert!(h.sync.peers.is_blacklisted(&node(2), now));
}

#[tokio::test]
async fn an_invalid_witness_stops_the_batch() {
    let mut h = harness();
    let now = Instant::now() + Duration::from_secs(1);

    h.sync.maybe_send_request(now);
    let blocks = vec![
        make_complete(Height(0)),
        CompleteBlock {
            height: Height(1),
            header: header_bytes(Height(1)),
            witness: b"bad".to_vec(),
            transactions: Vec::new(),
        },
        make_complete(Height(2)),
    ];
    let processed = h.sync.handle_block_range(&node(1), Height(0), blocks, now);
    assert_eq!(processed, 1);

    settle().await;
    h.sync.process_commit_outcomes().expect("no fatal error");
    assert_eq!(h.committer.committed_heights(), vec![Height(0)]);
}

#[tokio::test]
async fn a_failed_commit_discards_the_rest_of_the_batch() {
    let mut h = harness();
    let now = Instant::now() + Duration::from_secs(1);
    h.committer
        .fail_at(Height(1), CommitError::BadBlock("does not apply".into()));

    h.sync.maybe_send_request(now);
    let blocks = vec![
        make_complete(Height(0)),
        make_complete(Height(1)),
        make_complete(Height(2)),
    ];
    h.sync.handle_block_range(&node(1), Height(0), blocks, now);

    settle().await;
    h.sync.process_commit_outcomes().expect("no fatal error");

    // Only the prefix before the failure was committed, and the next
    // request starts right above it.
    assert_eq!(h.committer.committed_heights(), vec![Height(0)]);
    assert_eq!(h.sync.session.state(), SlowSyncState::WaitForAction);
    assert_eq!(h.sync.session.start_height(), Height(1));
}

#[tokio::test]
async fn an_ambiguous_chain_mismatch_is_fatal() {
    let mut h = harness();
    let now = Instant::now() + Duration::from_secs(1);
    h.committer.fail_at(Height(0), CommitError::ChainMismatch);

    h.sync.maybe_send_request(now);
    h.sync
        .handle_block_range(&node(1), Height(0), vec![make_complete(Height(0))], now);

    settle().await;
    let fatal = h.sync.process_commit_outcomes();
    assert!(matches!(
        fatal,
        Err(FatalSyncError::AmbiguousChainMismatch { height }) if height == Height(0)
    ));
}

#[tokio::test]
async fn replicas_answer_range_requests_while_syncing() {
    let mut h = harness();
    for height in 0..=4 {
        h.store.insert(make_block(Height(height)));
    }

    h.inbound
        .send((node(2), SyncMessage::GetBlockRange { start_height: Height(3) }))
        .expect("receiver alive");
    let outcome = h.sync.process_messages();
    assert!(outcome.is_none());

    let sent = h.network.take_sent();
    match &sent[0].1 {
        SyncMessage::BlockRange { blocks, is_full, .. } => {
            assert_eq!(blocks.len(), 2);
            assert!(!is_full);
        }
        other => panic!("unexpected message {}", other.name()),
    }
}

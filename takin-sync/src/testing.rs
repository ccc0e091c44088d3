//! In-memory fake collaborators for synchronizer tests.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::{Arc, Mutex},
};

use futures::FutureExt;

use takin_chain::{
    block::{Block, ConfigHash, Header, Height, Witness},
    peer::NodeId,
};

use crate::{
    error::{BoxError, CommitError},
    message::{CompleteBlock, SyncMessage},
    services::{BlockCommitter, BlockStore, HeaderValidator, SyncNetwork},
};

pub(crate) fn node(byte: u8) -> NodeId {
    NodeId::new([byte; 8])
}

/// The test header encoding: 8 height bytes, then an optional 32-byte
/// config hash, then arbitrary padding.
pub(crate) fn header_bytes(height: Height) -> Vec<u8> {
    let mut raw = height.0.to_le_bytes().to_vec();
    raw.extend_from_slice(b"hdr");
    raw
}

pub(crate) fn header_bytes_with_config(height: Height, config: ConfigHash) -> Vec<u8> {
    let mut raw = height.0.to_le_bytes().to_vec();
    raw.extend_from_slice(&config.0);
    raw
}

pub(crate) fn witness_bytes() -> Vec<u8> {
    b"witness".to_vec()
}

pub(crate) fn make_block(height: Height) -> Block {
    Block {
        header: Header::new(header_bytes(height), height, None),
        witness: Witness::new(witness_bytes()),
        transactions: vec![vec![height.0 as u8]],
    }
}

pub(crate) fn make_complete(height: Height) -> CompleteBlock {
    CompleteBlock::from_block(&make_block(height))
}

/// A block store over a shared map, so tests can add blocks while a
/// synchronizer holds the store.
#[derive(Clone, Default)]
pub(crate) struct TestStore {
    blocks: Arc<Mutex<BTreeMap<Height, Block>>>,
}

impl TestStore {
    pub fn insert(&self, block: Block) {
        self.blocks.lock().unwrap().insert(block.height(), block);
    }
}

impl BlockStore for TestStore {
    fn best_height(&self) -> Option<Height> {
        self.blocks.lock().unwrap().keys().next_back().copied()
    }

    fn block_at_height(&self, height: Height) -> Option<Block> {
        self.blocks.lock().unwrap().get(&height).cloned()
    }
}

/// Decodes the test encoding. The magic byte strings `bad` (witness
/// content) and `undecodable` (header content) trigger failures.
pub(crate) struct TestValidator;

impl HeaderValidator for TestValidator {
    fn decode_header(&self, raw: &[u8]) -> Result<Header, BoxError> {
        if raw.len() < 8 || raw == b"undecodable" {
            return Err("header too short".into());
        }
        let height = Height(u64::from_le_bytes(raw[..8].try_into().expect("8 bytes")));
        let config_hash = (raw.len() >= 40)
            .then(|| ConfigHash(raw[8..40].try_into().expect("32 bytes")));
        Ok(Header::new(raw.to_vec(), height, config_hash))
    }

    fn decode_witness(&self, raw: &[u8]) -> Result<Witness, BoxError> {
        if raw == b"undecodable" {
            return Err("witness undecodable".into());
        }
        Ok(Witness::new(raw.to_vec()))
    }

    fn verify_witness(&self, _header: &Header, witness: &Witness) -> Result<(), BoxError> {
        if witness.raw == b"bad" {
            return Err("witness does not verify".into());
        }
        Ok(())
    }

    fn config_hash(&self) -> ConfigHash {
        ConfigHash([0; 32])
    }
}

/// A committer that records the order blocks were committed in, with
/// scripted failures and heights that hang forever.
#[derive(Clone, Default)]
pub(crate) struct TestCommitter {
    pub committed: Arc<Mutex<Vec<Height>>>,
    pub failures: Arc<Mutex<HashMap<Height, CommitError>>>,
    pub hanging: Arc<Mutex<HashSet<Height>>>,
}

impl TestCommitter {
    pub fn committed_heights(&self) -> Vec<Height> {
        self.committed.lock().unwrap().clone()
    }

    pub fn fail_at(&self, height: Height, error: CommitError) {
        self.failures.lock().unwrap().insert(height, error);
    }

    pub fn hang_at(&self, height: Height) {
        self.hanging.lock().unwrap().insert(height);
    }
}

impl BlockCommitter for TestCommitter {
    fn commit(&self, block: Block) -> futures::future::BoxFuture<'static, Result<(), CommitError>> {
        let height = block.height();
        let committed = self.committed.clone();
        let failures = self.failures.clone();
        let hanging = self.hanging.clone();
        async move {
            if hanging.lock().unwrap().contains(&height) {
                futures::future::pending::<()>().await;
            }
            let failure = failures.lock().unwrap().remove(&height);
            match failure {
                Some(error) => Err(error),
                None => {
                    committed.lock().unwrap().push(height);
                    Ok(())
                }
            }
        }
        .boxed()
    }
}

/// A network that records sent messages. "Random" selection is the
/// lowest-ordered connected peer outside the exclusion set, which makes
/// tests deterministic.
#[derive(Clone, Default)]
pub(crate) struct TestNetwork {
    pub connected: Arc<Mutex<BTreeSet<NodeId>>>,
    pub sent: Arc<Mutex<Vec<(NodeId, SyncMessage)>>>,
}

impl TestNetwork {
    pub fn with_peers(peers: impl IntoIterator<Item = NodeId>) -> Self {
        let network = TestNetwork::default();
        network.connected.lock().unwrap().extend(peers);
        network
    }

    pub fn take_sent(&self) -> Vec<(NodeId, SyncMessage)> {
        std::mem::take(&mut self.sent.lock().unwrap())
    }
}

impl SyncNetwork for TestNetwork {
    fn connected_peers(&self) -> HashSet<NodeId> {
        self.connected.lock().unwrap().iter().cloned().collect()
    }

    fn send(&self, peer: &NodeId, message: SyncMessage) {
        self.sent.lock().unwrap().push((peer.clone(), message));
    }

    fn send_to_random_peer(
        &self,
        message: SyncMessage,
        exclude: &HashSet<NodeId>,
    ) -> Option<NodeId> {
        let peer = self
            .connected
            .lock()
            .unwrap()
            .iter()
            .find(|peer| !exclude.contains(*peer))
            .cloned()?;
        self.sent.lock().unwrap().push((peer.clone(), message));
        Some(peer)
    }
}

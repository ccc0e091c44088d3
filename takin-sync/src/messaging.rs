//! Serving block requests from other peers.
//!
//! Both synchronizers keep answering `GetBlockAtHeight`,
//! `GetBlockRange`, and `GetBlockHeaderAndBlock` while they sync, so a
//! network of catching-up nodes can still feed each other.

use tracing::{debug, trace};

use takin_chain::{block::Height, peer::NodeId};

use crate::{
    message::{CompleteBlock, SyncMessage},
    packer::pack_block_range,
    services::{BlockStore, SyncNetwork},
};

/// Answers block requests from local storage.
///
/// Peers in fast sync send us a lot of requests, and the header of our
/// tip is sent very often as an "I'm drained" signal, so the tip header
/// is cached here instead of bothering the store with repeated reads.
#[derive(Debug, Default)]
pub struct RequestServer {
    /// The cached tip: height, raw header bytes, raw witness bytes.
    tip_cache: Option<(Height, Vec<u8>, Vec<u8>)>,
}

impl RequestServer {
    /// Creates a server with a cold cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers a legacy `GetBlockAtHeight` request with a
    /// `CompleteBlock`, or stays silent if we lack the block.
    pub fn send_block_at_height<S, N>(
        &self,
        store: &S,
        network: &N,
        peer: &NodeId,
        height: Height,
    ) where
        S: BlockStore,
        N: SyncNetwork,
    {
        match store.block_at_height(height) {
            Some(block) => network.send(
                peer,
                SyncMessage::CompleteBlock {
                    block: CompleteBlock::from_block(&block),
                },
            ),
            None => debug!(%peer, %height, "no block at requested height"),
        }
    }

    /// Answers a `GetBlockRange` request.
    ///
    /// Even when we have none of the requested blocks an empty range is
    /// sent back, so the requester knows we are alive and can nap.
    pub fn send_block_range<S, N>(&self, store: &S, network: &N, peer: &NodeId, start: Height)
    where
        S: BlockStore,
        N: SyncNetwork,
    {
        let mut blocks = Vec::new();
        let complete = pack_block_range(start, |height| store.block_at_height(height), &mut blocks);
        trace!(%peer, %start, blocks = blocks.len(), "replying with block range");
        network.send(
            peer,
            SyncMessage::BlockRange {
                start_height: start,
                is_full: !complete,
                blocks,
            },
        );
    }

    /// Answers a `GetBlockHeaderAndBlock` request.
    ///
    /// If we have the block, the reply is its header immediately
    /// followed by the block body. If we only have lower blocks, the
    /// reply is our tip header alone, which tells the requester our
    /// height. With no blocks at all we reply with the empty
    /// header/witness pair.
    pub fn send_block_header_and_block<S, N>(
        &mut self,
        store: &S,
        network: &N,
        peer: &NodeId,
        requested: Height,
    ) where
        S: BlockStore,
        N: SyncNetwork,
    {
        let my_best = match store.best_height() {
            Some(best) => best,
            None => {
                self.send_header(network, peer, Vec::new(), Vec::new(), requested);
                return;
            }
        };

        if my_best < requested {
            // We are drained at our tip: send the tip header, from the
            // cache when it is still current.
            if let Some((height, header, witness)) = &self.tip_cache {
                if *height == my_best {
                    let (header, witness) = (header.clone(), witness.clone());
                    self.send_header(network, peer, header, witness, requested);
                    return;
                }
            }
            let block = store
                .block_at_height(my_best)
                .unwrap_or_else(|| panic!("best block {my_best} missing from store"));
            let (header, witness) = (block.header.raw, block.witness.raw);
            self.tip_cache = Some((my_best, header.clone(), witness.clone()));
            self.send_header(network, peer, header, witness, requested);
            return;
        }

        let block = store
            .block_at_height(requested)
            .unwrap_or_else(|| panic!("block {requested} below best missing from store"));
        let (header, witness) = (block.header.raw.clone(), block.witness.raw.clone());
        if requested == my_best {
            self.tip_cache = Some((my_best, header.clone(), witness.clone()));
        }
        self.send_header(network, peer, header.clone(), witness, requested);

        trace!(%peer, %requested, "following up with the block body");
        network.send(
            peer,
            SyncMessage::UnfinishedBlock {
                header,
                transactions: block.transactions,
            },
        );
    }

    /// Drops the cached tip header. Called after local commits move the
    /// tip.
    pub fn invalidate_tip_cache(&mut self) {
        self.tip_cache = None;
    }

    fn send_header<N: SyncNetwork>(
        &self,
        network: &N,
        peer: &NodeId,
        header: Vec<u8>,
        witness: Vec<u8>,
        requested_height: Height,
    ) {
        trace!(%peer, %requested_height, "replying with block header");
        network.send(
            peer,
            SyncMessage::BlockHeader {
                header,
                witness,
                requested_height,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{BTreeMap, HashSet},
        sync::Mutex,
    };

    use takin_chain::block::{Block, Header, Witness};

    use super::*;

    struct MapStore(BTreeMap<Height, Block>);

    impl MapStore {
        fn with_heights(heights: impl IntoIterator<Item = u64>) -> Self {
            MapStore(
                heights
                    .into_iter()
                    .map(|h| {
                        let height = Height(h);
                        let block = Block {
                            header: Header::new(vec![h as u8; 16], height, None),
                            witness: Witness::new(vec![0xee; 8]),
                            transactions: vec![vec![1, 2, 3]],
                        };
                        (height, block)
                    })
                    .collect(),
            )
        }
    }

    impl BlockStore for MapStore {
        fn best_height(&self) -> Option<Height> {
            self.0.keys().next_back().copied()
        }

        fn block_at_height(&self, height: Height) -> Option<Block> {
            self.0.get(&height).cloned()
        }
    }

    #[derive(Default)]
    struct RecordingNetwork {
        sent: Mutex<Vec<(NodeId, SyncMessage)>>,
    }

    impl RecordingNetwork {
        fn take(&self) -> Vec<(NodeId, SyncMessage)> {
            std::mem::take(&mut self.sent.lock().unwrap())
        }
    }

    impl SyncNetwork for RecordingNetwork {
        fn connected_peers(&self) -> HashSet<NodeId> {
            HashSet::new()
        }

        fn send(&self, peer: &NodeId, message: SyncMessage) {
            self.sent.lock().unwrap().push((peer.clone(), message));
        }

        fn send_to_random_peer(
            &self,
            _message: SyncMessage,
            _exclude: &HashSet<NodeId>,
        ) -> Option<NodeId> {
            None
        }
    }

    fn requester() -> NodeId {
        NodeId::new([9; 4])
    }

    #[test]
    fn header_and_block_when_we_have_the_block() {
        let store = MapStore::with_heights(0..=5);
        let network = RecordingNetwork::default();
        let mut server = RequestServer::new();

        server.send_block_header_and_block(&store, &network, &requester(), Height(3));

        let sent = network.take();
        assert_eq!(sent.len(), 2);
        assert!(matches!(
            &sent[0].1,
            SyncMessage::BlockHeader { requested_height, header, .. }
                if *requested_height == Height(3) && !header.is_empty()
        ));
        assert!(matches!(&sent[1].1, SyncMessage::UnfinishedBlock { .. }));
    }

    #[test]
    fn tip_header_alone_when_we_are_drained() {
        let store = MapStore::with_heights(0..=5);
        let network = RecordingNetwork::default();
        let mut server = RequestServer::new();

        server.send_block_header_and_block(&store, &network, &requester(), Height(9));

        let sent = network.take();
        assert_eq!(sent.len(), 1);
        match &sent[0].1 {
            SyncMessage::BlockHeader {
                header,
                requested_height,
                ..
            } => {
                // The tip header, echoing the requested height.
                assert_eq!(header, &vec![5u8; 16]);
                assert_eq!(*requested_height, Height(9));
            }
            other => panic!("unexpected message {}", other.name()),
        }

        // The second drained reply comes from the cache.
        server.send_block_header_and_block(&store, &network, &requester(), Height(10));
        let sent = network.take();
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            &sent[0].1,
            SyncMessage::BlockHeader { requested_height, .. } if *requested_height == Height(10)
        ));
    }

    #[test]
    fn empty_header_when_we_have_no_blocks() {
        let store = MapStore::with_heights([]);
        let network = RecordingNetwork::default();
        let mut server = RequestServer::new();

        server.send_block_header_and_block(&store, &network, &requester(), Height(0));

        let sent = network.take();
        assert!(matches!(
            &sent[0].1,
            SyncMessage::BlockHeader { header, witness, .. }
                if header.is_empty() && witness.is_empty()
        ));
    }

    #[test]
    fn block_range_replies_are_sent_even_when_empty() {
        let store = MapStore::with_heights(0..=5);
        let network = RecordingNetwork::default();
        let server = RequestServer::new();

        server.send_block_range(&store, &network, &requester(), Height(100));

        let sent = network.take();
        match &sent[0].1 {
            SyncMessage::BlockRange {
                start_height,
                is_full,
                blocks,
            } => {
                assert_eq!(*start_height, Height(100));
                assert!(!is_full);
                assert!(blocks.is_empty());
            }
            other => panic!("unexpected message {}", other.name()),
        }
    }

    #[test]
    fn block_range_is_contiguous_from_the_start_height() {
        let store = MapStore::with_heights(0..=5);
        let network = RecordingNetwork::default();
        let server = RequestServer::new();

        server.send_block_range(&store, &network, &requester(), Height(2));

        let sent = network.take();
        match &sent[0].1 {
            SyncMessage::BlockRange { blocks, .. } => {
                let heights: Vec<_> = blocks.iter().map(|b| b.height.0).collect();
                assert_eq!(heights, vec![2, 3, 4, 5]);
            }
            other => panic!("unexpected message {}", other.name()),
        }
    }
}

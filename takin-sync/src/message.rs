//! Peer message semantics.
//!
//! These are the in-process representations of the sync protocol
//! messages. The wire codec that turns them into bytes (and back) is an
//! external collaborator; nothing in this crate serializes them.

use takin_chain::block::{Block, ConfigHash, Height};

/// A complete block as carried inside [`SyncMessage::CompleteBlock`]
/// and [`SyncMessage::BlockRange`]: raw header and witness bytes plus
/// the transaction payloads.
///
/// Raw bytes rather than decoded types, because the receiver must
/// decode and verify them itself before trusting anything.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CompleteBlock {
    /// The height the sender claims for this block.
    pub height: Height,
    /// Raw encoded header bytes.
    pub header: Vec<u8>,
    /// Raw encoded witness bytes.
    pub witness: Vec<u8>,
    /// Encoded transactions, in block order.
    pub transactions: Vec<Vec<u8>>,
}

impl CompleteBlock {
    /// Builds the message form of a locally stored block.
    pub fn from_block(block: &Block) -> Self {
        CompleteBlock {
            height: block.height(),
            header: block.header.raw.clone(),
            witness: block.witness.raw.clone(),
            transactions: block.transactions.clone(),
        }
    }

    /// The number of content bytes this block contributes to a packet.
    pub fn content_len(&self) -> usize {
        self.header.len()
            + self.witness.len()
            + self.transactions.iter().map(Vec::len).sum::<usize>()
    }
}

/// The sync protocol messages exchanged with peers.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SyncMessage {
    /// Legacy request for a single complete block.
    GetBlockAtHeight {
        /// The requested height.
        height: Height,
    },

    /// Legacy reply to [`SyncMessage::GetBlockAtHeight`]: the complete
    /// block in one message.
    CompleteBlock {
        /// The block, with the height the sender claims for it.
        block: CompleteBlock,
    },

    /// Request for the header and body of the block at a height.
    ///
    /// The reply is a [`SyncMessage::BlockHeader`], immediately
    /// followed by a [`SyncMessage::UnfinishedBlock`] if the sender has
    /// the block.
    GetBlockHeaderAndBlock {
        /// The requested height.
        height: Height,
    },

    /// A block header with its witness.
    ///
    /// If the sender lacks the requested block it replies with the
    /// header of its own tip instead; an empty header and witness mean
    /// it has no blocks at all.
    BlockHeader {
        /// Raw encoded header bytes; may be empty.
        header: Vec<u8>,
        /// Raw encoded witness bytes; may be empty.
        witness: Vec<u8>,
        /// The height that was requested, echoed back so the receiver
        /// can match the reply to its request.
        requested_height: Height,
    },

    /// The body of a block whose header was just sent.
    ///
    /// Carries the header bytes again so the receiver can match the
    /// body to the header it already verified.
    UnfinishedBlock {
        /// Raw encoded header bytes, byte-identical to the
        /// [`SyncMessage::BlockHeader`] that preceded this message.
        header: Vec<u8>,
        /// Encoded transactions, in block order.
        transactions: Vec<Vec<u8>>,
    },

    /// Request for a range of complete blocks starting at a height.
    GetBlockRange {
        /// The first height of the range.
        start_height: Height,
    },

    /// Reply to [`SyncMessage::GetBlockRange`].
    ///
    /// Bounded to [`MAX_BLOCKS_IN_PACKAGE`] blocks and the packet byte
    /// budget; an empty reply is still sent so the requester knows the
    /// sender is alive.
    ///
    /// [`MAX_BLOCKS_IN_PACKAGE`]: crate::packer::MAX_BLOCKS_IN_PACKAGE
    BlockRange {
        /// The first height of the range, echoed back.
        start_height: Height,
        /// True if more blocks existed but did not fit in this packet.
        is_full: bool,
        /// The blocks, contiguous from `start_height`.
        blocks: Vec<CompleteBlock>,
    },

    /// Periodic liveness and progress broadcast.
    ///
    /// The height is the block the peer is currently working on, so its
    /// evidence-of-data is `height - 1`.
    Status {
        /// The peer's next block to produce.
        height: Height,
    },

    /// A peer signals that it has applied a pending configuration
    /// change at a height.
    AppliedConfig {
        /// The height the configuration applies from.
        height: Height,
        /// The hash of the applied configuration.
        config_hash: ConfigHash,
    },
}

impl SyncMessage {
    /// A short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            SyncMessage::GetBlockAtHeight { .. } => "GetBlockAtHeight",
            SyncMessage::CompleteBlock { .. } => "CompleteBlock",
            SyncMessage::GetBlockHeaderAndBlock { .. } => "GetBlockHeaderAndBlock",
            SyncMessage::BlockHeader { .. } => "BlockHeader",
            SyncMessage::UnfinishedBlock { .. } => "UnfinishedBlock",
            SyncMessage::GetBlockRange { .. } => "GetBlockRange",
            SyncMessage::BlockRange { .. } => "BlockRange",
            SyncMessage::Status { .. } => "Status",
            SyncMessage::AppliedConfig { .. } => "AppliedConfig",
        }
    }
}

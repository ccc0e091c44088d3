//! Assembles a size- and count-bounded batch of contiguous blocks for
//! replica transfer.

use takin_chain::block::{Block, Height};

use crate::message::CompleteBlock;

/// The most blocks a single [`BlockRange`] reply may carry.
///
/// [`BlockRange`]: crate::message::SyncMessage::BlockRange
pub const MAX_BLOCKS_IN_PACKAGE: usize = 10;

/// The wire payload ceiling for a single packet.
pub const MAX_PACKET_PAYLOAD_BYTES: usize = 16 * 1024 * 1024;

/// Headroom under the payload ceiling for message framing.
const PACKAGE_SAFETY_MARGIN_BYTES: usize = 64 * 1024;

/// The content byte budget for a packed block range.
pub const MAX_PACKAGE_CONTENT_BYTES: usize =
    MAX_PACKET_PAYLOAD_BYTES - PACKAGE_SAFETY_MARGIN_BYTES;

/// Packs contiguous blocks from `start` into `out`, bounded by
/// [`MAX_BLOCKS_IN_PACKAGE`] and [`MAX_PACKAGE_CONTENT_BYTES`].
///
/// Returns `true` ("complete") when packing stopped because a height
/// was missing: the requester has everything we have. Returns `false`
/// ("incomplete") when packing stopped at a bound: more blocks exist
/// and the requester should ask again.
///
/// The byte budget is checked *before* a block is appended, so the
/// emitted batch never exceeds the budget, whatever the block sizes.
pub fn pack_block_range<F>(start: Height, fetch: F, out: &mut Vec<CompleteBlock>) -> bool
where
    F: Fn(Height) -> Option<Block>,
{
    let mut packed_bytes = 0;

    for n in 0..MAX_BLOCKS_IN_PACKAGE {
        let height = start.add(n as u64);
        let block = match fetch(height) {
            Some(block) => block,
            // The first missing height: the requester caught up.
            None => return true,
        };

        let complete = CompleteBlock::from_block(&block);
        if packed_bytes + complete.content_len() > MAX_PACKAGE_CONTENT_BYTES {
            return false;
        }
        packed_bytes += complete.content_len();
        out.push(complete);
    }

    false
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use takin_chain::block::{Header, Witness};

    use super::*;

    fn block_of_size(height: Height, bytes: usize) -> Block {
        Block {
            header: Header::new(vec![0u8; 32], height, None),
            witness: Witness::new(vec![0u8; 32]),
            transactions: vec![vec![0u8; bytes.saturating_sub(64)]],
        }
    }

    fn store_with_blocks(best: Height, size: usize) -> impl Fn(Height) -> Option<Block> {
        move |height| (height <= best).then(|| block_of_size(height, size))
    }

    #[test]
    fn packs_the_full_count_when_more_blocks_remain() {
        let mut out = Vec::new();
        let complete = pack_block_range(Height(0), store_with_blocks(Height(50), 1000), &mut out);

        assert!(!complete);
        assert_eq!(out.len(), MAX_BLOCKS_IN_PACKAGE);
        assert_eq!(out[0].height, Height(0));
        assert_eq!(out[9].height, Height(9));
    }

    #[test]
    fn stops_complete_at_the_first_missing_height() {
        let mut out = Vec::new();
        let complete = pack_block_range(Height(45), store_with_blocks(Height(50), 1000), &mut out);

        assert!(complete);
        assert_eq!(out.len(), 6);
    }

    #[test]
    fn stops_incomplete_when_the_byte_budget_is_reached() {
        let big = 10_000_000;
        let mut out = Vec::new();
        let complete = pack_block_range(Height(0), store_with_blocks(Height(20), big), &mut out);

        assert!(!complete);
        assert_eq!(out.len(), MAX_PACKAGE_CONTENT_BYTES / big);
    }

    #[test]
    fn a_single_oversized_block_packs_nothing() {
        let mut out = Vec::new();
        let complete = pack_block_range(
            Height(0),
            store_with_blocks(Height(20), MAX_PACKAGE_CONTENT_BYTES + 1),
            &mut out,
        );

        assert!(!complete);
        assert!(out.is_empty());
    }

    proptest! {
        /// Packing never exceeds the byte budget or the block count,
        /// regardless of input block sizes.
        #[test]
        fn packed_batches_respect_both_bounds(
            sizes in proptest::collection::vec(0usize..4_000_000, 0..20),
        ) {
            let fetch = |height: Height| {
                sizes
                    .get(height.0 as usize)
                    .map(|&size| block_of_size(height, size.max(64)))
            };

            let mut out = Vec::new();
            pack_block_range(Height(0), fetch, &mut out);

            prop_assert!(out.len() <= MAX_BLOCKS_IN_PACKAGE);
            let total: usize = out.iter().map(CompleteBlock::content_len).sum();
            prop_assert!(total <= MAX_PACKAGE_CONTENT_BYTES);
        }
    }
}

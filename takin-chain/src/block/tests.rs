//! Block type unit tests.

use super::*;

fn block_with_sizes(header: usize, witness: usize, txs: &[usize]) -> Block {
    Block {
        header: Header::new(vec![0u8; header], Height(7), None),
        witness: Witness::new(vec![0u8; witness]),
        transactions: txs.iter().map(|&n| vec![0u8; n]).collect(),
    }
}

#[test]
fn height_arithmetic() {
    assert_eq!(Height(0).next(), Height(1));
    assert_eq!(Height(0).prev(), None);
    assert_eq!(Height(5).prev(), Some(Height(4)));
    assert_eq!(Height(3).add(4), Height(7));

    assert_eq!(next_height(None), Height::MIN);
    assert_eq!(next_height(Some(Height(9))), Height(10));
}

#[test]
#[should_panic(expected = "height overflow")]
fn height_next_checks_bounds() {
    let _ = Height::MAX.next();
}

#[test]
fn content_len_counts_all_parts() {
    let block = block_with_sizes(100, 60, &[10, 20, 30]);
    assert_eq!(block.content_len(), 100 + 60 + 10 + 20 + 30);

    let empty = block_with_sizes(0, 0, &[]);
    assert_eq!(empty.content_len(), 0);
}

#[test]
fn node_id_short_display() {
    use crate::peer::NodeId;

    let id = NodeId::new([0xab, 0xcd, 0xef, 0x01, 0x23, 0x45]);
    assert_eq!(id.short(), "abcdef01");
    assert_eq!(format!("{id}"), "abcdef01");

    let tiny = NodeId::new([0x0f]);
    assert_eq!(tiny.short(), "0f");
}

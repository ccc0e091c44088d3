//! Blocks and block-related structures (heights, headers, witnesses).

mod header;
mod height;

#[cfg(test)]
mod tests;

pub use header::{ConfigHash, Header};
pub use height::{next_height, Height};

use std::fmt;

use serde::{Deserialize, Serialize};

/// The signer-quorum proof attached to a block.
///
/// The witness is a signature set proving that a quorum of the chain's
/// configured signers accepted the block. Its internal structure is the
/// verifier's concern; the sync engine only moves it around and compares
/// it byte-for-byte.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Witness {
    /// The raw encoded witness bytes.
    pub raw: Vec<u8>,
}

impl Witness {
    /// Creates a witness from raw encoded bytes.
    pub fn new(raw: Vec<u8>) -> Self {
        Witness { raw }
    }

    /// Returns true if the witness carries no bytes at all.
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

/// A Takin block: a decoded header, its witness, and the transaction
/// payloads in block order.
///
/// Transactions are opaque byte strings here; transaction decoding and
/// execution happen in the block-application layer.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// The decoded block header.
    pub header: Header,
    /// The quorum witness for the header.
    pub witness: Witness,
    /// Encoded transactions, in block order.
    pub transactions: Vec<Vec<u8>>,
}

impl Block {
    /// The block's height, as committed to by its signed header.
    pub fn height(&self) -> Height {
        self.header.height
    }

    /// The number of content bytes this block contributes to a network
    /// packet: header, witness, and transaction payloads.
    ///
    /// Used by the range packer to stay under the wire payload ceiling.
    /// Framing overhead is covered by the packer's safety margin.
    pub fn content_len(&self) -> usize {
        self.header.raw.len()
            + self.witness.raw.len()
            + self.transactions.iter().map(Vec::len).sum::<usize>()
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("height", &self.header.height)
            .field("transactions", &self.transactions.len())
            .finish()
    }
}

//! Block headers.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::Height;

/// The hash of a signer configuration, as committed to by block headers
/// built under that configuration.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ConfigHash(pub [u8; 32]);

impl fmt::Debug for ConfigHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ConfigHash")
            .field(&hex::encode(self.0))
            .finish()
    }
}

/// A decoded view of a block header.
///
/// The header keeps its raw encoded bytes alongside the decoded fields:
/// peers echo header bytes back in block bodies, and the sync engine
/// matches them byte-for-byte rather than re-encoding.
///
/// The height can be trusted once the witness has been verified, because
/// it is part of the signed header content. Decoding raw bytes into a
/// `Header` is the validator seam's job.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Header {
    /// The raw encoded header bytes, exactly as received.
    pub raw: Vec<u8>,
    /// The block height committed to by the header.
    pub height: Height,
    /// The hash of the signer configuration the header was built under,
    /// if the header declares one.
    pub config_hash: Option<ConfigHash>,
}

impl Header {
    /// Creates a header view over raw bytes.
    pub fn new(raw: Vec<u8>, height: Height, config_hash: Option<ConfigHash>) -> Self {
        Header {
            raw,
            height,
            config_hash,
        }
    }
}

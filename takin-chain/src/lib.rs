//! Core data model for the Takin chain: blocks, headers, witnesses,
//! block heights, and peer identities.
//!
//! This crate deliberately knows nothing about wire encodings, storage,
//! or cryptography. Raw header and witness bytes are carried opaquely;
//! decoding and signature verification live behind the validator seam in
//! `takin-sync`.

#![deny(missing_docs)]
#![forbid(unsafe_code)]

pub mod block;
pub mod peer;

pub use block::{Block, ConfigHash, Header, Height, Witness};
pub use peer::NodeId;

//! Block heights.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The height of a block is the length of the chain back to the genesis
/// block.
///
/// # Invariants
///
/// Users should not construct block heights greater than [`Height::MAX`].
#[derive(Copy, Clone, Default, Eq, PartialEq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Height(pub u64);

impl Height {
    /// The minimum height: the genesis block.
    pub const MIN: Height = Height(0);

    /// The maximum height.
    ///
    /// Far above any reachable chain length, but low enough that height
    /// arithmetic can never wrap.
    pub const MAX: Height = Height(u64::MAX / 2);

    /// The height of the next block after this one.
    pub fn next(self) -> Height {
        assert!(self < Height::MAX, "height overflow");
        Height(self.0 + 1)
    }

    /// The height of the block before this one, or `None` at genesis.
    pub fn prev(self) -> Option<Height> {
        self.0.checked_sub(1).map(Height)
    }

    /// The height `n` blocks above this one.
    pub fn add(self, n: u64) -> Height {
        let h = Height(self.0 + n);
        assert!(h <= Height::MAX, "height overflow");
        h
    }
}

impl fmt::Debug for Height {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Height({})", self.0)
    }
}

impl fmt::Display for Height {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The height of the first block above `tip`.
///
/// A `None` tip means an empty chain, so the next height is genesis.
pub fn next_height(tip: Option<Height>) -> Height {
    match tip {
        Some(h) => h.next(),
        None => Height::MIN,
    }
}

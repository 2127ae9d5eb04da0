//! Consensus constants shared across the block index.

pub mod constants;

pub type Hash256 = [u8; 32];

/// The all-zero hash, used as the previous-block reference of a genesis
/// header and as the "unset" value for stored hashes.
pub const NULL_HASH: Hash256 = [0u8; 32];

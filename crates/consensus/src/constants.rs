//! Consensus-wide constants shared across validation and the block index.

/// Maximum amount of time that a block timestamp is allowed to exceed the
/// current network-adjusted time before the block will be accepted.
pub const MAX_FUTURE_BLOCK_TIME: i64 = 2 * 60 * 60;

/// Timestamp window used as a grace period by code that compares external
/// timestamps (such as timestamps passed to RPCs, or wallet key creation
/// times) to block timestamps. Must be at least as high as
/// `MAX_FUTURE_BLOCK_TIME`.
pub const TIMESTAMP_WINDOW: i64 = MAX_FUTURE_BLOCK_TIME;

/// Number of block times entering the median-time-past calculation.
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Version stamped into serialized block index records.
pub const CLIENT_VERSION: i32 = 1_010_000;

//! Packed validity/status word of a block index entry.

const VALIDITY_MASK: u32 = 0x07;

/// Full block available in the block files.
const HAS_DATA_FLAG: u32 = 1 << 3;
/// Undo data available in the undo files.
const HAS_UNDO_FLAG: u32 = 1 << 4;
/// The block itself failed validation.
const FAILED_FLAG: u32 = 1 << 5;
/// The block descends from a failed block.
const FAILED_PARENT_FLAG: u32 = 1 << 6;
/// The on-disk content hash and size are recorded.
const HAS_DISK_META_FLAG: u32 = 1 << 7;
/// The entry carries a soft-rejection counter.
const HAS_SOFT_REJ_FLAG: u32 = 1 << 8;

const INVALID_MASK: u32 = FAILED_FLAG | FAILED_PARENT_FLAG;

/// How far validation of a block has progressed. Each level implies the
/// same level for every ancestor, except that `Transactions` only implies
/// `Tree` for parents.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
#[repr(u32)]
pub enum BlockValidity {
    Unknown = 0,
    /// Parsed, version ok, hash satisfies claimed PoW, timestamp not in
    /// the future.
    Header = 1,
    /// All parent headers found, difficulty matches, timestamp against
    /// median previous, checkpoints.
    Tree = 2,
    /// Transaction data checked against the merkle root; the cumulative
    /// transaction count is only set once all parents reach this too.
    Transactions = 3,
    /// Outputs do not overspend inputs, no double spends, coinbase ok.
    Chain = 4,
    /// Scripts and signatures ok.
    Scripts = 5,
}

impl BlockValidity {
    fn from_bits(bits: u32) -> Self {
        match bits & VALIDITY_MASK {
            1 => Self::Header,
            2 => Self::Tree,
            3 => Self::Transactions,
            4 => Self::Chain,
            5 => Self::Scripts,
            _ => Self::Unknown,
        }
    }
}

/// Validity level and flags packed into one word, serialized as a varint.
/// All transitions are pure `with_*` constructors returning the new word.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BlockStatus(u32);

impl BlockStatus {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn validity(self) -> BlockValidity {
        BlockValidity::from_bits(self.0)
    }

    pub fn with_validity(self, validity: BlockValidity) -> Self {
        Self((self.0 & !VALIDITY_MASK) | validity as u32)
    }

    pub fn has_data(self) -> bool {
        (self.0 & HAS_DATA_FLAG) != 0
    }

    pub fn with_data(self, has_data: bool) -> Self {
        Self((self.0 & !HAS_DATA_FLAG) | if has_data { HAS_DATA_FLAG } else { 0 })
    }

    pub fn has_undo(self) -> bool {
        (self.0 & HAS_UNDO_FLAG) != 0
    }

    pub fn with_undo(self, has_undo: bool) -> Self {
        Self((self.0 & !HAS_UNDO_FLAG) | if has_undo { HAS_UNDO_FLAG } else { 0 })
    }

    pub fn has_failed(self) -> bool {
        (self.0 & FAILED_FLAG) != 0
    }

    pub fn with_failed(self, has_failed: bool) -> Self {
        Self((self.0 & !FAILED_FLAG) | if has_failed { FAILED_FLAG } else { 0 })
    }

    pub fn has_failed_parent(self) -> bool {
        (self.0 & FAILED_PARENT_FLAG) != 0
    }

    pub fn with_failed_parent(self, has_failed_parent: bool) -> Self {
        Self((self.0 & !FAILED_PARENT_FLAG) | if has_failed_parent { FAILED_PARENT_FLAG } else { 0 })
    }

    pub fn has_disk_meta(self) -> bool {
        (self.0 & HAS_DISK_META_FLAG) != 0
    }

    pub fn with_disk_meta(self, has_meta: bool) -> Self {
        Self((self.0 & !HAS_DISK_META_FLAG) | if has_meta { HAS_DISK_META_FLAG } else { 0 })
    }

    pub fn has_soft_rejection_data(self) -> bool {
        (self.0 & HAS_SOFT_REJ_FLAG) != 0
    }

    pub fn with_soft_rejection(self, has_data: bool) -> Self {
        Self((self.0 & !HAS_SOFT_REJ_FLAG) | if has_data { HAS_SOFT_REJ_FLAG } else { 0 })
    }

    pub fn is_invalid(self) -> bool {
        (self.0 & INVALID_MASK) != 0
    }

    pub fn with_cleared_failure_flags(self) -> Self {
        Self(self.0 & !INVALID_MASK)
    }

    /// Whether this entry is valid at least up to the given level.
    pub fn is_valid(self, up_to: BlockValidity) -> bool {
        if self.is_invalid() {
            return false;
        }
        self.validity() >= up_to
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_bit_layout() {
        assert_eq!(BlockStatus::new().with_data(true).bits(), 0x08);
        assert_eq!(BlockStatus::new().with_undo(true).bits(), 0x10);
        assert_eq!(BlockStatus::new().with_failed(true).bits(), 0x20);
        assert_eq!(BlockStatus::new().with_failed_parent(true).bits(), 0x40);
        assert_eq!(BlockStatus::new().with_disk_meta(true).bits(), 0x80);
        assert_eq!(BlockStatus::new().with_soft_rejection(true).bits(), 0x100);
    }

    #[test]
    fn validity_is_ordered() {
        assert!(BlockValidity::Unknown < BlockValidity::Header);
        assert!(BlockValidity::Header < BlockValidity::Tree);
        assert!(BlockValidity::Tree < BlockValidity::Transactions);
        assert!(BlockValidity::Transactions < BlockValidity::Chain);
        assert!(BlockValidity::Chain < BlockValidity::Scripts);
    }

    #[test]
    fn with_validity_preserves_flags() {
        let status = BlockStatus::new()
            .with_data(true)
            .with_soft_rejection(true)
            .with_validity(BlockValidity::Chain);
        assert!(status.has_data());
        assert!(status.has_soft_rejection_data());
        assert_eq!(status.validity(), BlockValidity::Chain);

        let status = status.with_validity(BlockValidity::Scripts);
        assert!(status.has_data());
        assert_eq!(status.validity(), BlockValidity::Scripts);
    }

    #[test]
    fn invalid_blocks_are_never_valid() {
        let status = BlockStatus::new()
            .with_validity(BlockValidity::Scripts)
            .with_failed(true);
        assert!(status.is_invalid());
        assert!(!status.is_valid(BlockValidity::Unknown));
        assert!(!status.is_valid(BlockValidity::Scripts));

        let cleared = status.with_cleared_failure_flags();
        assert!(!cleared.is_invalid());
        assert!(cleared.is_valid(BlockValidity::Scripts));
    }

    #[test]
    fn failed_parent_marks_invalid() {
        let status = BlockStatus::new().with_failed_parent(true);
        assert!(status.is_invalid());
        assert!(!status.is_valid(BlockValidity::Transactions));
    }

    #[test]
    fn bits_roundtrip() {
        for bits in [0u32, 0x08, 0x1ff, 0x125, 0xa3] {
            assert_eq!(BlockStatus::from_bits(bits).bits(), bits);
        }
    }
}

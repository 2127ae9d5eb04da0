//! Disk-location records for block and undo data.

use chaind_consensus::Hash256;

/// Position of a block's data within the numbered block files.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BlockFilePos {
    pub file: i32,
    pub pos: u32,
}

impl BlockFilePos {
    pub fn new(file: i32, pos: u32) -> Self {
        Self { file, pos }
    }
}

/// Hash and size of a block's serialized data on disk.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DiskBlockMetaData {
    pub hash: Hash256,
    pub size: u64,
}

impl DiskBlockMetaData {
    pub fn new(hash: Hash256, size: u64) -> Self {
        Self { hash, size }
    }
}

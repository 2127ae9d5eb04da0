//! In-memory block index: the header tree, validity tracking, fork-choice
//! ordering, and the persistent form of index entries.

pub mod blockindex;
pub mod diskindex;
pub mod filepos;
pub mod status;
pub mod tree;

pub use blockindex::{
    block_proof_equivalent_time, last_common_ancestor, work_cmp, BlockIndex, ValidationTime,
};
pub use diskindex::DiskBlockIndex;
pub use filepos::{BlockFilePos, DiskBlockMetaData};
pub use status::{BlockStatus, BlockValidity};
pub use tree::{BlockTree, BlockTreeError};

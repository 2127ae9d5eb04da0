//! The header map: every known entry, the candidate tips, and the set of
//! entries awaiting persistence.
//!
//! The tree is process-wide state owned by the enclosing chain state,
//! which also holds the reader-writer lock that guards installs and
//! enumeration. The dirty set carries its own mutex so mutation paths can
//! enqueue entries with shared access.

use std::collections::{HashMap, VecDeque};
use std::hash::{BuildHasher, Hasher};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use chaind_consensus::{Hash256, NULL_HASH};
use chaind_log::{log_debug, log_info};
use chaind_primitives::block::BlockHeader;
use smallvec::SmallVec;

use crate::blockindex::{hash_hex, work_cmp, BlockIndex};
use crate::diskindex::DiskBlockIndex;
use crate::filepos::{BlockFilePos, DiskBlockMetaData};
use crate::status::BlockValidity;

/// Hashes a block-hash key by its first eight bytes. Block hashes are
/// already uniformly distributed, so rehashing them buys nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct BlockHasher;

impl BuildHasher for BlockHasher {
    type Hasher = CheapHasher;

    fn build_hasher(&self) -> CheapHasher {
        CheapHasher(0)
    }
}

#[derive(Default)]
pub struct CheapHasher(u64);

impl Hasher for CheapHasher {
    fn write(&mut self, bytes: &[u8]) {
        let mut word = [0u8; 8];
        let len = bytes.len().min(8);
        word[..len].copy_from_slice(&bytes[..len]);
        self.0 = u64::from_le_bytes(word);
    }

    fn finish(&self) -> u64 {
        self.0
    }
}

type HashKeyed<V> = HashMap<Hash256, V, BlockHasher>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTreeError {
    DuplicateHeader(Hash256),
    UnknownParent(Hash256),
}

impl std::fmt::Display for BlockTreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockTreeError::DuplicateHeader(hash) => {
                write!(f, "header {} already indexed", hash_hex(hash))
            }
            BlockTreeError::UnknownParent(hash) => {
                write!(f, "parent {} not indexed", hash_hex(hash))
            }
        }
    }
}

impl std::error::Error for BlockTreeError {}

#[derive(Default)]
pub struct BlockTree {
    entries: HashKeyed<Arc<BlockIndex>>,
    children: HashKeyed<SmallVec<[Hash256; 2]>>,
    tips: HashKeyed<Arc<BlockIndex>>,
    dirty: Mutex<HashKeyed<Arc<BlockIndex>>>,
    next_sequence_id: i32,
}

impl BlockTree {
    pub fn new() -> Self {
        Self {
            next_sequence_id: 1,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, hash: &Hash256) -> Option<&Arc<BlockIndex>> {
        self.entries.get(hash)
    }

    pub fn entries(&self) -> impl Iterator<Item = &Arc<BlockIndex>> {
        self.entries.values()
    }

    /// Index a newly accepted header. The parent must already be indexed
    /// unless the header is a genesis header (all-zero previous hash).
    pub fn insert_header(&mut self, header: &BlockHeader) -> Result<Arc<BlockIndex>, BlockTreeError> {
        let hash = header.hash();
        if self.entries.contains_key(&hash) {
            return Err(BlockTreeError::DuplicateHeader(hash));
        }
        let parent = self.lookup_parent(&header.prev_block)?;

        let mut entry = BlockIndex::from_header(header);
        if let Some(parent) = &parent {
            entry.link_parent(Arc::clone(parent));
            // A header born inside an active rejection window inherits
            // the parent's countdown.
            entry.set_soft_rejected_from_parent();
        }
        entry.set_chain_work();
        entry.build_skip();
        entry.set_sequence_id(self.next_sequence_id);
        self.next_sequence_id += 1;
        entry.set_received_time(unix_now());

        let entry = Arc::new(entry);
        self.install(hash, Arc::clone(&entry), parent.map(|p| p.hash()));
        self.mark_dirty(&entry);
        log_debug!(
            "indexed header {} at height {}",
            hash_hex(&hash),
            entry.height()
        );
        Ok(entry)
    }

    /// Repopulate the tree from persistent records at startup. Records
    /// are linked in height order and the memory-only statistics (chain
    /// work, running time maximum, skip pointers, cumulative transaction
    /// counts) are rebuilt from scratch. Loaded entries are not dirty.
    pub fn load_from_records(
        &mut self,
        mut records: Vec<DiskBlockIndex>,
    ) -> Result<(), BlockTreeError> {
        records.sort_by_key(|record| record.height);
        let count = records.len();
        for record in &records {
            let hash = record.block_hash();
            if self.entries.contains_key(&hash) {
                return Err(BlockTreeError::DuplicateHeader(hash));
            }
            let parent = self.lookup_parent(&record.header.prev_block)?;
            let parent_hash = parent.as_ref().map(|p| p.hash());

            let mut entry = BlockIndex::from_persistent(record, parent);
            entry.set_chain_work();
            entry.build_skip();
            let entry = Arc::new(entry);
            entry.set_chain_tx(contiguous_chain_tx(&entry));
            self.install(hash, entry, parent_hash);
        }
        if count > 0 {
            let best_height = self
                .tips
                .values()
                .map(|tip| tip.height())
                .max()
                .unwrap_or(0);
            log_info!("loaded {count} block index entries, best height {best_height}");
        }
        Ok(())
    }

    fn lookup_parent(&self, prev_block: &Hash256) -> Result<Option<Arc<BlockIndex>>, BlockTreeError> {
        if *prev_block == NULL_HASH {
            return Ok(None);
        }
        match self.entries.get(prev_block) {
            Some(parent) => Ok(Some(Arc::clone(parent))),
            None => Err(BlockTreeError::UnknownParent(*prev_block)),
        }
    }

    fn install(&mut self, hash: Hash256, entry: Arc<BlockIndex>, parent_hash: Option<Hash256>) {
        if let Some(parent_hash) = parent_hash {
            self.children.entry(parent_hash).or_default().push(hash);
            self.tips.remove(&parent_hash);
        }
        self.tips.insert(hash, Arc::clone(&entry));
        self.entries.insert(hash, entry);
    }

    /// Record a block's disk data on its entry, then re-establish the
    /// cumulative transaction counts the reset invalidated.
    pub fn set_block_data(
        &self,
        entry: &Arc<BlockIndex>,
        tx_count: u32,
        pos: BlockFilePos,
        meta: Option<DiskBlockMetaData>,
    ) {
        entry.set_disk_block_data(tx_count, pos, meta);
        self.update_chain_tx(entry);
        self.mark_dirty(entry);
    }

    /// Raise an entry's validity, enqueueing it for persistence when the
    /// level changed.
    pub fn raise_validity(&self, entry: &Arc<BlockIndex>, up_to: BlockValidity) -> bool {
        let changed = entry.raise_validity(up_to);
        if changed {
            self.mark_dirty(entry);
        }
        changed
    }

    /// Drop an entry's disk locations after the pruner removed its files.
    pub fn clear_file_info(&self, entry: &Arc<BlockIndex>) {
        entry.clear_file_info();
        self.mark_dirty(entry);
        log_debug!(
            "cleared file info for {} at height {}",
            hash_hex(&entry.hash()),
            entry.height()
        );
    }

    /// Walk `start` and every descendant, parent before child, recomputing
    /// the cumulative transaction count from each parent's. Run after any
    /// operation that resets an entry's count.
    pub fn update_chain_tx(&self, start: &Arc<BlockIndex>) {
        let mut queue: VecDeque<Arc<BlockIndex>> = VecDeque::new();
        queue.push_back(Arc::clone(start));
        while let Some(entry) = queue.pop_front() {
            entry.set_chain_tx(contiguous_chain_tx(&entry));
            if let Some(children) = self.children.get(&entry.hash()) {
                for child_hash in children {
                    if let Some(child) = self.entries.get(child_hash) {
                        queue.push_back(Arc::clone(child));
                    }
                }
            }
        }
    }

    /// Soft reject `entry` for `num_blocks` descendants (or clear with
    /// `-1`) and propagate the change down every known descendant chain,
    /// parent before child, as deep as either the old or the new counter
    /// reaches.
    pub fn set_soft_rejected_for(&self, entry: &Arc<BlockIndex>, num_blocks: i32) {
        let previous = entry.soft_rejected_for();
        entry.set_soft_rejected_for(num_blocks);
        self.mark_dirty(entry);

        let mut remaining = previous.max(num_blocks);
        let mut level: Vec<Hash256> = vec![entry.hash()];
        while remaining > 0 && !level.is_empty() {
            let mut next = Vec::new();
            for hash in &level {
                let Some(children) = self.children.get(hash) else {
                    continue;
                };
                for child_hash in children {
                    if let Some(child) = self.entries.get(child_hash) {
                        child.set_soft_rejected_from_parent();
                        self.mark_dirty(child);
                        next.push(*child_hash);
                    }
                }
            }
            level = next;
            remaining -= 1;
        }
    }

    /// The best candidate tip: the leaf with the most cumulative work
    /// that is neither invalid nor soft rejected.
    pub fn best_tip(&self) -> Option<Arc<BlockIndex>> {
        self.tips
            .values()
            .filter(|tip| !tip.is_invalid() && !tip.is_soft_rejected())
            .max_by(|a, b| work_cmp(a, b))
            .cloned()
    }

    /// All candidate tips, worst first. Ordering is computed per call
    /// because validation completion mutates the comparator's keys.
    pub fn ordered_candidates(&self) -> Vec<Arc<BlockIndex>> {
        let mut candidates: Vec<Arc<BlockIndex>> = self.tips.values().cloned().collect();
        candidates.sort_by(|a, b| work_cmp(a, b));
        candidates
    }

    /// Enqueue an entry whose persistent state may differ from disk.
    pub fn mark_dirty(&self, entry: &Arc<BlockIndex>) {
        let mut dirty = self.dirty.lock().expect("dirty set lock");
        dirty.insert(entry.hash(), Arc::clone(entry));
    }

    /// Hand every dirty entry to the persistence flusher, clearing the
    /// set. Entries that fail to flush must be marked dirty again.
    pub fn take_dirty(&self) -> Vec<Arc<BlockIndex>> {
        let mut dirty = self.dirty.lock().expect("dirty set lock");
        dirty.drain().map(|(_, entry)| entry).collect()
    }
}

fn contiguous_chain_tx(entry: &Arc<BlockIndex>) -> u32 {
    let tx_count = entry.tx_count();
    if tx_count == 0 {
        return 0;
    }
    match entry.parent() {
        None => tx_count,
        Some(parent) if parent.chain_tx() > 0 => parent.chain_tx().saturating_add(tx_count),
        Some(_) => 0,
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

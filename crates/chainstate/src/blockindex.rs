//! A node of the block header tree.
//!
//! The chain is a tree rooted at the genesis block, with each block
//! potentially having multiple candidate successors. Entries are owned by
//! the [`BlockTree`](crate::tree::BlockTree) map; parent and skip links
//! are shared handles into the same map.

use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use chaind_consensus::constants::MEDIAN_TIME_SPAN;
use chaind_consensus::{Hash256, NULL_HASH};
use chaind_pow::difficulty::block_proof;
use chaind_primitives::block::BlockHeader;
use primitive_types::U256;

use crate::diskindex::DiskBlockIndex;
use crate::filepos::{BlockFilePos, DiskBlockMetaData};
use crate::status::{BlockStatus, BlockValidity};

/// When validation of a block completed to `Scripts` level, measured on a
/// process-wide monotonic clock.
///
/// `Pending` is the construction default and sorts after every completed
/// instant. `Earliest` sorts before every completed instant; it is the
/// state of entries loaded from disk and the target of
/// [`BlockIndex::ignore_validation_time`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum ValidationTime {
    Earliest,
    Completed(Duration),
    Pending,
}

impl ValidationTime {
    pub fn now() -> Self {
        Self::Completed(monotonic_epoch().elapsed())
    }

    pub fn is_pending(self) -> bool {
        matches!(self, Self::Pending)
    }
}

fn monotonic_epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Fields read and written by different threads, guarded by the per-entry
/// mutex. Must never be held across I/O.
pub(crate) struct IndexState {
    pub(crate) status: BlockStatus,
    pub(crate) file: i32,
    pub(crate) data_pos: u32,
    pub(crate) undo_pos: u32,
    pub(crate) tx_count: u32,
    pub(crate) disk_meta: Option<DiskBlockMetaData>,
    pub(crate) soft_rejected: i32,
    pub(crate) validation_time: ValidationTime,
}

impl IndexState {
    fn new() -> Self {
        Self {
            status: BlockStatus::new(),
            file: 0,
            data_pos: 0,
            undo_pos: 0,
            tx_count: 0,
            disk_meta: None,
            soft_rejected: -1,
            validation_time: ValidationTime::Pending,
        }
    }
}

pub struct BlockIndex {
    hash: Hash256,
    parent: Option<Arc<BlockIndex>>,
    skip: Option<Arc<BlockIndex>>,
    height: i32,
    version: i32,
    merkle_root: Hash256,
    time: u32,
    bits: u32,
    nonce: u32,
    chain_work: U256,
    time_max: u32,
    sequence_id: i32,
    time_received: u64,
    chain_tx: AtomicU32,
    inner: Mutex<IndexState>,
}

impl BlockIndex {
    /// New entry for a freshly accepted header. Derived statistics are
    /// zeroed until the entry is linked and installed.
    pub fn from_header(header: &BlockHeader) -> Self {
        Self {
            hash: header.hash(),
            parent: None,
            skip: None,
            height: 0,
            version: header.version,
            merkle_root: header.merkle_root,
            time: header.time,
            bits: header.bits,
            nonce: header.nonce,
            chain_work: U256::zero(),
            time_max: header.time,
            sequence_id: 0,
            // Default to the header time, which in effect assumes the
            // block was honestly mined.
            time_received: u64::from(header.time),
            chain_tx: AtomicU32::new(0),
            inner: Mutex::new(IndexState::new()),
        }
    }

    /// Rebuild an entry from its persistent record, linking `parent`.
    /// Memory-only statistics are left for the loader to recompute;
    /// the validation time starts at `Earliest`, the best possible
    /// candidate value, since after a restart only tip validity matters.
    pub fn from_persistent(disk: &DiskBlockIndex, parent: Option<Arc<BlockIndex>>) -> Self {
        let mut entry = Self::from_header(&disk.header);
        entry.height = disk.height;
        entry.time_max = match &parent {
            Some(parent) => parent.time_max.max(entry.time),
            None => entry.time,
        };
        entry.parent = parent;
        let state = entry.inner.get_mut().expect("block index lock");
        state.status = disk.status;
        state.file = disk.file;
        state.data_pos = disk.data_pos;
        state.undo_pos = disk.undo_pos;
        state.tx_count = disk.tx_count;
        state.disk_meta = disk.disk_meta;
        state.soft_rejected = disk.soft_rejected;
        state.validation_time = ValidationTime::Earliest;
        entry
    }

    /// Link the parent entry, fixing height and the running time maximum.
    pub fn link_parent(&mut self, parent: Arc<BlockIndex>) {
        self.height = parent.height + 1;
        self.time_max = parent.time_max.max(self.time);
        self.parent = Some(parent);
    }

    /// Cumulative work up to and including this block. An undecodable
    /// compact target contributes zero proof.
    pub fn set_chain_work(&mut self) {
        let proof = block_proof(self.bits).unwrap_or_default();
        let parent_work = match &self.parent {
            Some(parent) => parent.chain_work,
            None => U256::zero(),
        };
        self.chain_work = parent_work.saturating_add(proof);
    }

    /// Build the skiplist pointer for this entry.
    pub fn build_skip(&mut self) {
        if let Some(parent) = &self.parent {
            self.skip = ancestor_handle(parent, skip_height(self.height)).cloned();
        }
    }

    pub(crate) fn set_sequence_id(&mut self, sequence_id: i32) {
        self.sequence_id = sequence_id;
    }

    pub(crate) fn set_received_time(&mut self, time_received: u64) {
        self.time_received = time_received;
    }

    pub(crate) fn locked_state(&self) -> MutexGuard<'_, IndexState> {
        self.inner.lock().expect("block index lock")
    }

    pub fn hash(&self) -> Hash256 {
        self.hash
    }

    pub fn parent(&self) -> Option<&Arc<BlockIndex>> {
        self.parent.as_ref()
    }

    pub fn skip(&self) -> Option<&Arc<BlockIndex>> {
        self.skip.as_ref()
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn chain_work(&self) -> U256 {
        self.chain_work
    }

    pub fn sequence_id(&self) -> i32 {
        self.sequence_id
    }

    /// Number of transactions in the chain up to and including this
    /// block. Non-zero only once transaction data is present for this
    /// entry and every ancestor.
    pub fn chain_tx(&self) -> u32 {
        self.chain_tx.load(AtomicOrdering::Relaxed)
    }

    pub(crate) fn set_chain_tx(&self, chain_tx: u32) {
        self.chain_tx.store(chain_tx, AtomicOrdering::Relaxed);
    }

    pub fn block_time(&self) -> i64 {
        i64::from(self.time)
    }

    /// Maximum header time in the chain up to and including this block.
    pub fn block_time_max(&self) -> i64 {
        i64::from(self.time_max)
    }

    pub fn header_received_time(&self) -> u64 {
        self.time_received
    }

    pub fn received_time_diff(&self) -> i64 {
        self.time_received as i64 - self.block_time()
    }

    pub fn tx_count(&self) -> u32 {
        self.locked_state().tx_count
    }

    pub fn status(&self) -> BlockStatus {
        self.locked_state().status
    }

    pub fn is_invalid(&self) -> bool {
        self.locked_state().status.is_invalid()
    }

    /// Whether this entry is valid at least up to the given level.
    pub fn is_valid(&self, up_to: BlockValidity) -> bool {
        self.locked_state().status.is_valid(up_to)
    }

    /// Position of the block data, if any is stored.
    pub fn block_pos(&self) -> Option<BlockFilePos> {
        let state = self.locked_state();
        if state.status.has_data() {
            Some(BlockFilePos::new(state.file, state.data_pos))
        } else {
            None
        }
    }

    /// Position of the undo data, if any is stored.
    pub fn undo_pos(&self) -> Option<BlockFilePos> {
        let state = self.locked_state();
        if state.status.has_undo() {
            Some(BlockFilePos::new(state.file, state.undo_pos))
        } else {
            None
        }
    }

    pub fn disk_meta(&self) -> Option<DiskBlockMetaData> {
        self.locked_state().disk_meta
    }

    pub fn set_disk_meta(&self, meta: DiskBlockMetaData) {
        let mut state = self.locked_state();
        set_disk_meta_locked(&mut state, meta);
    }

    /// Record the disk metadata unless some is already present. Returns
    /// whether the entry changed.
    pub fn set_disk_meta_if_unset(&self, meta: DiskBlockMetaData) -> bool {
        let mut state = self.locked_state();
        if state.status.has_disk_meta() {
            return false;
        }
        set_disk_meta_locked(&mut state, meta);
        true
    }

    /// Record where the block's data was written, along with its
    /// transaction count, and raise validity to `Transactions`.
    ///
    /// Resets the cumulative transaction count to zero; the owning tree's
    /// contiguity walker must be run afterwards to re-establish it for
    /// this entry and its descendants.
    pub fn set_disk_block_data(
        &self,
        tx_count: u32,
        pos: BlockFilePos,
        meta: Option<DiskBlockMetaData>,
    ) {
        let mut state = self.locked_state();
        state.tx_count = tx_count;
        self.set_chain_tx(0);
        state.file = pos.file;
        state.data_pos = pos.pos;
        state.undo_pos = 0;
        state.status = state.status.with_data(true);
        raise_validity_locked(&mut state, BlockValidity::Transactions);
        if let Some(meta) = meta {
            set_disk_meta_locked(&mut state, meta);
        }
    }

    /// Record where the block's undo data was written.
    pub fn set_undo_pos(&self, undo_pos: u32) {
        let mut state = self.locked_state();
        state.undo_pos = undo_pos;
        state.status = state.status.with_undo(true);
    }

    /// Forget all disk locations, as the pruner does after removing the
    /// block files.
    pub fn clear_file_info(&self) {
        let mut state = self.locked_state();
        state.status = state
            .status
            .with_data(false)
            .with_undo(false)
            .with_disk_meta(false);
        state.file = 0;
        state.data_pos = 0;
        state.undo_pos = 0;
        state.disk_meta = None;
    }

    /// Reconstruct the header from this entry and its parent's hash.
    pub fn block_header(&self) -> BlockHeader {
        BlockHeader {
            version: self.version,
            prev_block: match &self.parent {
                Some(parent) => parent.hash,
                None => NULL_HASH,
            },
            merkle_root: self.merkle_root,
            time: self.time,
            bits: self.bits,
            nonce: self.nonce,
        }
    }

    /// Median of the last [`MEDIAN_TIME_SPAN`] block times ending here,
    /// taking the lower median when fewer times are available.
    pub fn median_time_past(&self) -> i64 {
        let mut times: Vec<i64> = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut entry = self;
        loop {
            times.push(entry.block_time());
            if times.len() == MEDIAN_TIME_SPAN {
                break;
            }
            match entry.parent.as_deref() {
                Some(parent) => entry = parent,
                None => break,
            }
        }
        times.sort_unstable();
        times[(times.len() - 1) / 2]
    }

    /// Raise the validity level of this entry. Returns whether the level
    /// changed; invalid entries and downgrades are left untouched. The
    /// first raise to `Scripts` stamps the validation completion time.
    pub fn raise_validity(&self, up_to: BlockValidity) -> bool {
        let mut state = self.locked_state();
        raise_validity_locked(&mut state, up_to)
    }

    pub fn mark_failed(&self) {
        let mut state = self.locked_state();
        state.status = state.status.with_failed(true);
    }

    pub fn mark_failed_parent(&self) {
        let mut state = self.locked_state();
        state.status = state.status.with_failed_parent(true);
    }

    pub fn clear_failure_flags(&self) {
        let mut state = self.locked_state();
        state.status = state.status.with_cleared_failure_flags();
    }

    /// Tie-breaker instant for choosing which of the equal-work tips
    /// finished validation first.
    pub fn validation_time(&self) -> ValidationTime {
        self.locked_state().validation_time
    }

    /// Pretend validation completed instantly. Used for precious blocks
    /// that should win against every same-work competitor.
    pub fn ignore_validation_time(&self) {
        let mut state = self.locked_state();
        state.validation_time = ValidationTime::Earliest;
    }

    pub fn is_soft_rejected(&self) -> bool {
        self.locked_state().soft_rejected >= 0
    }

    /// Number of blocks after this one that should also be considered
    /// soft rejected. Negative means this block is a normal block.
    pub fn soft_rejected_for(&self) -> i32 {
        self.locked_state().soft_rejected
    }

    /// Whether this block inherits soft rejection from its parent. The
    /// parent must be known and its counter set correctly; a counter of
    /// zero affects no further blocks.
    pub fn should_be_considered_soft_rejected_because_of_parent(&self) -> bool {
        let parent = self.parent.as_ref().expect("parent must be known");
        parent.soft_rejected_for() > 0
    }

    /// Mark this block soft rejected for itself and `num_blocks`
    /// descendants (`-1` clears the mark).
    ///
    /// Must not be called on a block that is soft rejected because of its
    /// parent. Afterwards the caller must invoke
    /// [`set_soft_rejected_from_parent`](Self::set_soft_rejected_from_parent)
    /// on every known descendant chain, parent before child, up to
    /// `max(previous, num_blocks)` blocks past this one.
    pub fn set_soft_rejected_for(&self, num_blocks: i32) {
        assert!(num_blocks >= -1, "soft rejection counter below -1");
        assert!(
            !self.should_be_considered_soft_rejected_because_of_parent(),
            "block is soft rejected because of its parent"
        );

        let mut state = self.locked_state();
        state.soft_rejected = num_blocks;
        // The counter only needs to be stored when the block is soft
        // rejected; absence of the data means a normal block.
        let rejected = state.soft_rejected >= 0;
        state.status = state.status.with_soft_rejection(rejected);
    }

    /// Propagate soft rejection from the parent, one block less deep.
    pub fn set_soft_rejected_from_parent(&self) {
        let parent = self.parent.as_ref().expect("parent must be known");
        let parent_counter = parent.soft_rejected_for();
        let mut state = self.locked_state();
        if parent_counter > 0 {
            state.soft_rejected = parent_counter - 1;
            state.status = state.status.with_soft_rejection(true);
        } else {
            state.soft_rejected = -1;
            state.status = state.status.with_soft_rejection(false);
        }
    }

    /// Find the ancestor at the given height, following this entry's own
    /// skip pointer and each intermediate one where it helps. O(log
    /// height) steps; out-of-range heights yield `None`.
    pub fn get_ancestor(&self, height: i32) -> Option<&BlockIndex> {
        self.ancestor_with_hops(height)
            .map(|(ancestor, _)| ancestor)
    }

    /// [`get_ancestor`](Self::get_ancestor) reporting how many skip or
    /// parent links the walk followed. Lookups must stay logarithmic in
    /// chain height; the hop count is what tests hold that against.
    pub fn ancestor_with_hops(&self, height: i32) -> Option<(&BlockIndex, usize)> {
        if height < 0 || height > self.height {
            return None;
        }

        let mut walk: &BlockIndex = self;
        let mut height_walk = self.height;
        let mut hops = 0usize;
        while height_walk > height {
            match (walk.skip.as_deref(), skip_step(height_walk, height)) {
                (Some(skip), Some(skip_to)) => {
                    walk = skip;
                    height_walk = skip_to;
                }
                _ => {
                    walk = walk.parent.as_deref()?;
                    height_walk -= 1;
                }
            }
            hops += 1;
        }
        Some((walk, hops))
    }
}

/// Decide whether the walk at `height_walk` should take its skip pointer
/// toward `target`, and where that lands. The skip is declined when the
/// parent's own skip would land materially closer.
fn skip_step(height_walk: i32, target: i32) -> Option<i32> {
    let height_skip = skip_height(height_walk);
    let height_skip_prev = skip_height(height_walk - 1);
    let take = height_skip == target
        || (height_skip > target
            && !(height_skip_prev < height_skip - 2 && height_skip_prev >= target));
    take.then_some(height_skip)
}

/// The same skip-or-parent walk over shared handles, for building new
/// skip pointers. Requires `height <= start.height`.
fn ancestor_handle<'a>(start: &'a Arc<BlockIndex>, height: i32) -> Option<&'a Arc<BlockIndex>> {
    if height < 0 || height > start.height {
        return None;
    }

    let mut walk = start;
    let mut height_walk = walk.height;
    while height_walk > height {
        match (walk.skip.as_ref(), skip_step(height_walk, height)) {
            (Some(skip), Some(skip_to)) => {
                walk = skip;
                height_walk = skip_to;
            }
            _ => {
                walk = walk.parent.as_ref()?;
                height_walk -= 1;
            }
        }
    }
    Some(walk)
}

impl fmt::Debug for BlockIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockIndex")
            .field("hash", &hash_hex(&self.hash))
            .field("height", &self.height)
            .field("chain_work", &self.chain_work)
            .finish_non_exhaustive()
    }
}

fn set_disk_meta_locked(state: &mut IndexState, meta: DiskBlockMetaData) {
    assert!(meta.hash != NULL_HASH, "disk meta requires a content hash");
    assert!(meta.size > 0, "disk meta requires a non-zero size");
    state.disk_meta = Some(meta);
    state.status = state.status.with_disk_meta(true);
}

fn raise_validity_locked(state: &mut IndexState, up_to: BlockValidity) -> bool {
    if state.status.is_invalid() {
        return false;
    }
    if state.status.validity() >= up_to {
        return false;
    }
    if up_to == BlockValidity::Scripts && state.validation_time.is_pending() {
        state.validation_time = ValidationTime::now();
    }
    state.status = state.status.with_validity(up_to);
    true
}

/// Hex form of a hash, most significant byte first.
pub(crate) fn hash_hex(hash: &Hash256) -> String {
    hash.iter()
        .rev()
        .fold(String::with_capacity(64), |mut out, byte| {
            use fmt::Write as _;
            let _ = write!(out, "{byte:02x}");
            out
        })
}

fn invert_lowest_one(value: i32) -> i32 {
    value & value.saturating_sub(1)
}

/// Height of the ancestor the skip pointer of an entry at `height` aims
/// at: clear the lowest set bit, nudged on odd heights so consecutive
/// entries do not all aim at the same ancestor.
fn skip_height(height: i32) -> i32 {
    if height < 2 {
        0
    } else if (height & 1) != 0 {
        invert_lowest_one(invert_lowest_one(height - 1)) + 1
    } else {
        invert_lowest_one(height)
    }
}

/// Total order over candidate tips: by cumulative work, then by earlier
/// validation completion, then by earlier receipt, with the entry address
/// as the final tie breaker (only reachable for disk-loaded entries,
/// which all share sequence id zero and the earliest validation time).
/// `Ordering::Greater` means `a` is the better tip.
pub fn work_cmp(a: &BlockIndex, b: &BlockIndex) -> Ordering {
    let by_work = a.chain_work.cmp(&b.chain_work);
    if by_work != Ordering::Equal {
        return by_work;
    }
    let by_validation = b.validation_time().cmp(&a.validation_time());
    if by_validation != Ordering::Equal {
        return by_validation;
    }
    let by_sequence = b.sequence_id.cmp(&a.sequence_id);
    if by_sequence != Ordering::Equal {
        return by_sequence;
    }
    (b as *const BlockIndex as usize).cmp(&(a as *const BlockIndex as usize))
}

/// Time it would take to redo the work difference between `from` and
/// `to`, in seconds, assuming the hashrate implied by the difficulty at
/// `tip`.
pub fn block_proof_equivalent_time(
    to: &BlockIndex,
    from: &BlockIndex,
    tip: &BlockIndex,
    target_spacing: i64,
) -> i64 {
    let (difference, sign) = if to.chain_work > from.chain_work {
        (to.chain_work - from.chain_work, 1)
    } else {
        (from.chain_work - to.chain_work, -1)
    };
    let proof = block_proof(tip.bits).unwrap_or_default();
    if proof.is_zero() {
        return 0;
    }
    let scaled = difference.saturating_mul(U256::from(target_spacing as u64)) / proof;
    if scaled.bits() > 63 {
        return sign * i64::MAX;
    }
    sign * scaled.low_u64() as i64
}

/// Find the forking point between two chain tips.
pub fn last_common_ancestor<'a>(
    a: &'a BlockIndex,
    b: &'a BlockIndex,
) -> Option<&'a BlockIndex> {
    let target = a.height.min(b.height);
    let mut a = a.get_ancestor(target)?;
    let mut b = b.get_ancestor(target)?;
    while !std::ptr::eq(a, b) {
        a = a.parent.as_deref()?;
        b = b.parent.as_deref()?;
    }
    Some(a)
}

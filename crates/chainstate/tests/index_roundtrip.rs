use std::sync::Arc;

use chaind_chainstate::tree::BlockTree;
use chaind_chainstate::{
    BlockFilePos, BlockIndex, BlockValidity, DiskBlockIndex, DiskBlockMetaData, ValidationTime,
};
use chaind_consensus::constants::CLIENT_VERSION;
use chaind_consensus::{Hash256, NULL_HASH};
use chaind_primitives::block::BlockHeader;

fn make_header(prev_block: Hash256, time: u32, nonce: u32) -> BlockHeader {
    BlockHeader {
        version: 4,
        prev_block,
        merkle_root: [0u8; 32],
        time,
        bits: 0x1d00ffff,
        nonce,
    }
}

fn build_chain(tree: &mut BlockTree, length: u32) -> Vec<Arc<BlockIndex>> {
    let mut entries = Vec::with_capacity(length as usize);
    let mut prev = NULL_HASH;
    for height in 0..length {
        let header = make_header(prev, 1_000_000 + height, height);
        prev = header.hash();
        entries.push(tree.insert_header(&header).expect("insert header"));
    }
    entries
}

#[test]
fn entry_snapshot_roundtrips() {
    let mut tree = BlockTree::new();
    let chain = build_chain(&mut tree, 3);
    let entry = &chain[2];

    tree.set_block_data(
        entry,
        421,
        BlockFilePos::new(7, 120_334),
        Some(DiskBlockMetaData::new([0xcd; 32], 990_001)),
    );
    entry.set_undo_pos(55_102);
    tree.raise_validity(entry, BlockValidity::Scripts);
    tree.set_soft_rejected_for(entry, 4);

    let record = DiskBlockIndex::from_entry(entry);
    assert_eq!(record.client_version, CLIENT_VERSION);
    assert_eq!(record.height, 2);
    assert_eq!(record.tx_count, 421);
    assert_eq!(record.file, 7);
    assert_eq!(record.data_pos, 120_334);
    assert_eq!(record.undo_pos, 55_102);
    assert_eq!(record.soft_rejected, 4);
    assert_eq!(record.header, entry.block_header());
    assert_eq!(record.block_hash(), entry.hash());

    let decoded = DiskBlockIndex::decode(&record.encode()).expect("decode");
    assert_eq!(decoded, record);
}

#[test]
fn reload_rebuilds_memory_only_statistics() {
    let mut tree = BlockTree::new();
    let chain = build_chain(&mut tree, 8);

    // Block data for a contiguous prefix, then a gap at height 4.
    for (height, entry) in chain.iter().enumerate().take(4) {
        tree.set_block_data(
            entry,
            10 + height as u32,
            BlockFilePos::new(0, 1_000 * (height as u32 + 1)),
            None,
        );
    }
    tree.set_block_data(&chain[5], 99, BlockFilePos::new(0, 77_000), None);
    tree.raise_validity(&chain[1], BlockValidity::Scripts);
    tree.set_soft_rejected_for(&chain[6], 1);

    let records: Vec<DiskBlockIndex> = tree
        .entries()
        .map(|entry| DiskBlockIndex::from_entry(entry))
        .collect();
    let encoded: Vec<Vec<u8>> = records.iter().map(|record| record.encode()).collect();
    let reloaded_records: Vec<DiskBlockIndex> = encoded
        .iter()
        .map(|bytes| DiskBlockIndex::decode(bytes).expect("decode"))
        .collect();

    let mut reloaded = BlockTree::new();
    reloaded
        .load_from_records(reloaded_records)
        .expect("load records");
    assert_eq!(reloaded.len(), tree.len());

    for original in &chain {
        let entry = reloaded.get(&original.hash()).expect("reloaded entry");
        assert_eq!(entry.height(), original.height());
        assert_eq!(entry.chain_work(), original.chain_work());
        assert_eq!(entry.block_time_max(), original.block_time_max());
        assert_eq!(entry.status(), original.status());
        assert_eq!(entry.tx_count(), original.tx_count());
        assert_eq!(entry.block_pos(), original.block_pos());
        assert_eq!(entry.undo_pos(), original.undo_pos());
        assert_eq!(entry.soft_rejected_for(), original.soft_rejected_for());
        assert_eq!(entry.chain_tx(), original.chain_tx());
        assert_eq!(entry.block_header(), original.block_header());

        // Memory-only fields reset to their load defaults.
        assert_eq!(entry.sequence_id(), 0);
        assert_eq!(entry.validation_time(), ValidationTime::Earliest);
        if let Some(skip) = entry.skip() {
            let original_skip = original.skip().expect("original skip");
            assert_eq!(skip.height(), original_skip.height());
        }
    }

    // The contiguous prefix keeps cumulative counts; the gap resets them.
    assert_eq!(reloaded.get(&chain[0].hash()).expect("entry").chain_tx(), 10);
    assert_eq!(
        reloaded.get(&chain[3].hash()).expect("entry").chain_tx(),
        10 + 11 + 12 + 13
    );
    assert_eq!(reloaded.get(&chain[4].hash()).expect("entry").chain_tx(), 0);
    assert_eq!(reloaded.get(&chain[5].hash()).expect("entry").chain_tx(), 0);
}

#[test]
fn filling_a_gap_restores_contiguity() {
    let mut tree = BlockTree::new();
    let chain = build_chain(&mut tree, 4);

    tree.set_block_data(&chain[0], 1, BlockFilePos::new(0, 100), None);
    tree.set_block_data(&chain[2], 3, BlockFilePos::new(0, 300), None);
    tree.set_block_data(&chain[3], 4, BlockFilePos::new(0, 400), None);
    assert_eq!(chain[2].chain_tx(), 0);
    assert_eq!(chain[3].chain_tx(), 0);

    tree.set_block_data(&chain[1], 2, BlockFilePos::new(0, 200), None);
    assert_eq!(chain[1].chain_tx(), 3);
    assert_eq!(chain[2].chain_tx(), 6);
    assert_eq!(chain[3].chain_tx(), 10);
}

#[test]
fn clear_file_info_drops_positions_and_meta() {
    let mut tree = BlockTree::new();
    let chain = build_chain(&mut tree, 2);
    let entry = &chain[1];

    tree.set_block_data(
        entry,
        12,
        BlockFilePos::new(3, 9_000),
        Some(DiskBlockMetaData::new([0x5a; 32], 123_456)),
    );
    entry.set_undo_pos(444);
    assert!(entry.block_pos().is_some());
    assert!(entry.undo_pos().is_some());
    assert!(entry.disk_meta().is_some());

    tree.clear_file_info(entry);
    assert!(entry.block_pos().is_none());
    assert!(entry.undo_pos().is_none());
    assert!(entry.disk_meta().is_none());
    let status = entry.status();
    assert!(!status.has_data());
    assert!(!status.has_undo());
    assert!(!status.has_disk_meta());
    // Validity is untouched by pruning.
    assert_eq!(status.validity(), BlockValidity::Transactions);
}

#[test]
fn dirty_set_collapses_and_drains() {
    let mut tree = BlockTree::new();
    let chain = build_chain(&mut tree, 3);

    // Insertion marked every entry dirty once, duplicates collapsed.
    let dirty = tree.take_dirty();
    assert_eq!(dirty.len(), 3);
    assert!(tree.take_dirty().is_empty());

    tree.raise_validity(&chain[2], BlockValidity::Tree);
    tree.raise_validity(&chain[2], BlockValidity::Chain);
    let dirty = tree.take_dirty();
    assert_eq!(dirty.len(), 1);
    assert!(Arc::ptr_eq(&dirty[0], &chain[2]));

    // An unchanged raise enqueues nothing.
    tree.raise_validity(&chain[2], BlockValidity::Chain);
    assert!(tree.take_dirty().is_empty());
}

#[test]
fn undo_position_tracks_its_flag() {
    let mut tree = BlockTree::new();
    let chain = build_chain(&mut tree, 2);
    let entry = &chain[1];

    assert!(entry.undo_pos().is_none());
    tree.set_block_data(entry, 5, BlockFilePos::new(2, 640), None);
    assert!(entry.undo_pos().is_none());

    entry.set_undo_pos(8_192);
    assert_eq!(entry.undo_pos(), Some(BlockFilePos::new(2, 8_192)));

    // Writing block data again resets the undo offset.
    tree.set_block_data(entry, 5, BlockFilePos::new(2, 640), None);
    assert_eq!(entry.undo_pos(), Some(BlockFilePos::new(2, 0)));
}

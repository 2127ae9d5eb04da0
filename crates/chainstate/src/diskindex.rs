//! The persistent form of a block index entry.
//!
//! Only persistent fields are encoded; derived chain statistics and the
//! parent link are rebuilt at load time by looking up the previous-block
//! hash in the header map. The layout is stable across revisions as long
//! as the status bit assignments are preserved.

use chaind_consensus::constants::CLIENT_VERSION;
use chaind_consensus::Hash256;
use chaind_primitives::block::BlockHeader;
use chaind_primitives::encoding::{DecodeError, Decoder, Encoder};

use crate::blockindex::BlockIndex;
use crate::filepos::DiskBlockMetaData;
use crate::status::BlockStatus;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiskBlockIndex {
    pub client_version: i32,
    pub height: i32,
    pub status: BlockStatus,
    pub tx_count: u32,
    pub file: i32,
    pub data_pos: u32,
    pub undo_pos: u32,
    pub header: BlockHeader,
    pub disk_meta: Option<DiskBlockMetaData>,
    pub soft_rejected: i32,
}

impl DiskBlockIndex {
    /// Snapshot the persistent fields of an entry under its mutex.
    pub fn from_entry(entry: &BlockIndex) -> Self {
        let header = entry.block_header();
        let state = entry.locked_state();
        Self {
            client_version: CLIENT_VERSION,
            height: entry.height(),
            status: state.status,
            tx_count: state.tx_count,
            file: state.file,
            data_pos: state.data_pos,
            undo_pos: state.undo_pos,
            header,
            disk_meta: state.disk_meta,
            soft_rejected: state.soft_rejected,
        }
    }

    /// The map key this record belongs under.
    pub fn block_hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_varint(self.client_version as u64);
        encoder.write_varint(self.height as u64);
        encoder.write_varint(u64::from(self.status.bits()));
        encoder.write_varint(u64::from(self.tx_count));
        if self.status.has_data() || self.status.has_undo() {
            encoder.write_varint(self.file as u64);
        }
        if self.status.has_data() {
            encoder.write_varint(u64::from(self.data_pos));
        }
        if self.status.has_undo() {
            encoder.write_varint(u64::from(self.undo_pos));
        }
        self.header.consensus_encode_to(&mut encoder);
        if self.status.has_disk_meta() {
            let meta = self.disk_meta.expect("disk meta present when flagged");
            encoder.write_hash_le(&meta.hash);
            encoder.write_u64_le(meta.size);
        }
        if self.status.has_soft_rejection_data() {
            encoder.write_varint(self.soft_rejected as u64);
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let record = Self::decode_from(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(record)
    }

    pub fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let client_version = read_varint_i32(decoder, "client version out of range")?;
        let height = read_varint_i32(decoder, "height out of range")?;
        let status_bits = read_varint_u32(decoder, "status word out of range")?;
        let status = BlockStatus::from_bits(status_bits);
        let tx_count = read_varint_u32(decoder, "transaction count out of range")?;

        let file = if status.has_data() || status.has_undo() {
            read_varint_i32(decoder, "file number out of range")?
        } else {
            0
        };
        let data_pos = if status.has_data() {
            read_varint_u32(decoder, "data offset out of range")?
        } else {
            0
        };
        let undo_pos = if status.has_undo() {
            read_varint_u32(decoder, "undo offset out of range")?
        } else {
            0
        };

        let header = BlockHeader::consensus_decode_from(decoder)?;

        let disk_meta = if status.has_disk_meta() {
            let hash = decoder.read_hash_le()?;
            let size = decoder.read_u64_le()?;
            Some(DiskBlockMetaData::new(hash, size))
        } else {
            None
        };

        let soft_rejected = if status.has_soft_rejection_data() {
            read_varint_i32(decoder, "soft rejection counter out of range")?
        } else {
            -1
        };

        Ok(Self {
            client_version,
            height,
            status,
            tx_count,
            file,
            data_pos,
            undo_pos,
            header,
            disk_meta,
            soft_rejected,
        })
    }
}

fn read_varint_u32(decoder: &mut Decoder, message: &'static str) -> Result<u32, DecodeError> {
    let value = decoder.read_varint()?;
    u32::try_from(value).map_err(|_| DecodeError::InvalidData(message))
}

fn read_varint_i32(decoder: &mut Decoder, message: &'static str) -> Result<i32, DecodeError> {
    let value = decoder.read_varint()?;
    i32::try_from(value).map_err(|_| DecodeError::InvalidData(message))
}

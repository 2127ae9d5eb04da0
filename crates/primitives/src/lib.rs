//! Block header type and byte-level serialization primitives.

pub mod block;
pub mod encoding;
pub mod hash;

pub use block::{BlockHeader, HEADER_SIZE};
pub use encoding::{DecodeError, Decoder, Encoder};
pub use hash::{sha256, sha256d};

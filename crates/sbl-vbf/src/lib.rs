//! sbl-vbf - VBF (Volvo Binary Format) firmware containers
//!
//! A VBF file is a textual header followed by binary block records. Blocks
//! are parsed lazily and verified against their CRC16 after optional LZSS
//! decompression.

pub mod block;
pub mod catalog;
pub mod checksum;
pub mod error;
pub mod file;
pub mod header;
pub mod lzss;

pub use block::{decode_block_data, next_block, VbfBlock, VbfBlocks, FORMAT_LZSS, FORMAT_UNCOMPRESSED};
pub use catalog::VbfCatalog;
pub use checksum::{crc16, crc32};
pub use error::{Result, VbfError};
pub use file::{decoded_blocks, VbfBuilder, VbfFile};
pub use header::{parse_header, EraseRange, SwPartType, VbfHeader, HEADER_SENTINEL, MAX_HEADER_LEN};

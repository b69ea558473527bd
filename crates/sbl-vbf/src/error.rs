//! VBF parsing errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VbfError {
    /// Header sentinel missing, bad header field or block running past end of file
    #[error("Malformed VBF: {0}")]
    MalformedVbf(String),

    #[error(
        "CRC mismatch in block at 0x{address:08X}: expected 0x{expected:04X}, computed 0x{actual:04X}"
    )]
    CrcMismatch {
        address: u32,
        expected: u16,
        actual: u16,
    },

    #[error("Unsupported compression format: data_format_identifier 0x{0:02X}")]
    UnsupportedCompressionFormat(u8),

    #[error("File checksum mismatch: expected 0x{expected:08X}, computed 0x{actual:08X}")]
    FileChecksumMismatch { expected: u32, actual: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, VbfError>;

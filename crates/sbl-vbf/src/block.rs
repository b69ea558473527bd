//! Binary block records following the header
//!
//! `[address: u32 BE][length: u32 BE][data: length bytes][crc16: u16 BE]`,
//! repeated until end of file.

use tracing::trace;

use crate::checksum::crc16;
use crate::error::{Result, VbfError};
use crate::lzss;

/// Block record size without data
const BLOCK_OVERHEAD: usize = 4 + 4 + 2;

/// Data stored uncompressed
pub const FORMAT_UNCOMPRESSED: u8 = 0x00;
/// Data stored LZSS-compressed
pub const FORMAT_LZSS: u8 = 0x10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VbfBlock {
    pub start_address: u32,
    /// Stored length of `data`, i.e. before decompression
    pub length: u32,
    /// Data as stored in the file
    pub data: Vec<u8>,
    /// CRC16 of the decompressed data
    pub crc16: u16,
}

impl VbfBlock {
    /// Decompress according to the header's format identifier and check the CRC
    pub fn decode(&self, data_format_identifier: u8) -> Result<Vec<u8>> {
        let decoded = decode_block_data(&self.data, data_format_identifier)?;
        self.verify(&decoded)?;
        Ok(decoded)
    }

    pub fn verify(&self, decoded: &[u8]) -> Result<()> {
        let actual = crc16(decoded);
        if actual != self.crc16 {
            return Err(VbfError::CrcMismatch {
                address: self.start_address,
                expected: self.crc16,
                actual,
            });
        }
        Ok(())
    }
}

pub fn decode_block_data(data: &[u8], data_format_identifier: u8) -> Result<Vec<u8>> {
    match data_format_identifier {
        FORMAT_UNCOMPRESSED => Ok(data.to_vec()),
        FORMAT_LZSS => Ok(lzss::decompress(data)),
        other => Err(VbfError::UnsupportedCompressionFormat(other)),
    }
}

/// Read the block starting at `offset`.
///
/// Returns `None` once `offset` reaches the end of the file.
pub fn next_block(bytes: &[u8], offset: usize) -> Result<Option<(VbfBlock, usize)>> {
    if offset == bytes.len() {
        return Ok(None);
    }

    let remaining = bytes.len().checked_sub(offset).ok_or_else(|| {
        VbfError::MalformedVbf(format!("block offset {} beyond end of file", offset))
    })?;
    if remaining < BLOCK_OVERHEAD {
        return Err(VbfError::MalformedVbf(format!(
            "truncated block header at offset {} ({} bytes left)",
            offset, remaining
        )));
    }

    let start_address = read_u32(bytes, offset);
    let length = read_u32(bytes, offset + 4);
    let data_start = offset + 8;
    let data_end = data_start
        .checked_add(length as usize)
        .filter(|end| end + 2 <= bytes.len())
        .ok_or_else(|| {
            VbfError::MalformedVbf(format!(
                "block at 0x{:08X} declares {} bytes, past end of file",
                start_address, length
            ))
        })?;

    let crc16 = u16::from_be_bytes([bytes[data_end], bytes[data_end + 1]]);
    trace!(
        address = format!("0x{:08X}", start_address),
        length,
        crc = format!("0x{:04X}", crc16),
        "Parsed block"
    );

    Ok(Some((
        VbfBlock {
            start_address,
            length,
            data: bytes[data_start..data_end].to_vec(),
            crc16,
        },
        data_end + 2,
    )))
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Lazy block iterator; stops after the first error
#[derive(Debug, Clone)]
pub struct VbfBlocks<'a> {
    bytes: &'a [u8],
    start: usize,
    offset: usize,
    failed: bool,
}

impl<'a> VbfBlocks<'a> {
    pub fn new(bytes: &'a [u8], header_len: usize) -> Self {
        Self {
            bytes,
            start: header_len,
            offset: header_len,
            failed: false,
        }
    }

    /// Rewind to the first block
    pub fn restart(&mut self) {
        self.offset = self.start;
        self.failed = false;
    }

    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl Iterator for VbfBlocks<'_> {
    type Item = Result<VbfBlock>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match next_block(self.bytes, self.offset) {
            Ok(Some((block, next))) => {
                self.offset = next;
                Some(Ok(block))
            }
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(address: u32, data: &[u8], crc: u16) -> Vec<u8> {
        let mut out = address.to_be_bytes().to_vec();
        out.extend_from_slice(&(data.len() as u32).to_be_bytes());
        out.extend_from_slice(data);
        out.extend_from_slice(&crc.to_be_bytes());
        out
    }

    #[test]
    fn test_next_block_reads_record() {
        let data = b"123456789";
        let bytes = record(0x0002_0000, data, 0x29B1);

        let (block, next) = next_block(&bytes, 0).unwrap().unwrap();
        assert_eq!(block.start_address, 0x0002_0000);
        assert_eq!(block.length, 9);
        assert_eq!(block.data, data.to_vec());
        assert_eq!(block.crc16, 0x29B1);
        assert_eq!(next, bytes.len());
        assert!(next_block(&bytes, next).unwrap().is_none());
        assert_eq!(block.decode(FORMAT_UNCOMPRESSED).unwrap(), data.to_vec());
    }

    #[test]
    fn test_block_past_eof() {
        let mut bytes = record(0x1000, &[1, 2, 3, 4], 0);
        bytes.truncate(bytes.len() - 3);
        assert!(matches!(
            next_block(&bytes, 0),
            Err(VbfError::MalformedVbf(_))
        ));
        assert!(matches!(
            next_block(&bytes, 0x100),
            Err(VbfError::MalformedVbf(_))
        ));
    }

    #[test]
    fn test_corrupted_data_fails_crc() {
        let data = b"123456789";
        let mut bytes = record(0x1000, data, crc16(data));
        bytes[8] ^= 0x01;

        let (block, _) = next_block(&bytes, 0).unwrap().unwrap();
        assert!(matches!(
            block.decode(FORMAT_UNCOMPRESSED),
            Err(VbfError::CrcMismatch {
                address: 0x1000,
                expected: 0x29B1,
                ..
            })
        ));
    }

    #[test]
    fn test_crc_covers_decompressed_data() {
        let plain = b"AAAAAAAAAAAAAAAAAAAAAAAAAAAABBBB".to_vec();
        let packed = lzss::compress(&plain);
        let bytes = record(0x2000, &packed, crc16(&plain));

        let (block, _) = next_block(&bytes, 0).unwrap().unwrap();
        assert_eq!(block.length as usize, packed.len());
        assert_eq!(block.decode(FORMAT_LZSS).unwrap(), plain);
        assert!(block.decode(FORMAT_UNCOMPRESSED).is_err());
    }

    #[test]
    fn test_unknown_format() {
        assert!(matches!(
            decode_block_data(&[1, 2, 3], 0x20),
            Err(VbfError::UnsupportedCompressionFormat(0x20))
        ));
    }

    #[test]
    fn test_iterator_is_restartable() {
        let mut bytes = b"HDR".to_vec();
        bytes.extend(record(0x1000, &[1, 2], crc16(&[1, 2])));
        bytes.extend(record(0x2000, &[3, 4, 5], crc16(&[3, 4, 5])));

        let mut blocks = VbfBlocks::new(&bytes, 3);
        let addresses: Vec<u32> = blocks
            .by_ref()
            .map(|b| b.unwrap().start_address)
            .collect();
        assert_eq!(addresses, vec![0x1000, 0x2000]);
        assert!(blocks.next().is_none());

        blocks.restart();
        assert_eq!(blocks.next().unwrap().unwrap().start_address, 0x1000);
    }

    #[test]
    fn test_iterator_stops_after_error() {
        let mut bytes = record(0x1000, &[1, 2], crc16(&[1, 2]));
        bytes.extend_from_slice(&[0xFF, 0xFF]);

        let mut blocks = VbfBlocks::new(&bytes, 0);
        assert!(blocks.next().unwrap().is_ok());
        assert!(blocks.next().unwrap().is_err());
        assert!(blocks.next().is_none());
    }
}

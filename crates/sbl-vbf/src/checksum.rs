//! Block and file checksums

use crc::{Crc, CRC_16_IBM_3740, CRC_32_ISO_HDLC};

/// CRC-16/CCITT-FALSE (poly 0x1021, init 0xFFFF), the per-block checksum
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// CRC-32 used by the `file_checksum` header field
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

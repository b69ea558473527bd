//! Whole VBF files: loading, verification and building

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::block::{VbfBlock, VbfBlocks, FORMAT_LZSS, FORMAT_UNCOMPRESSED};
use crate::checksum::{crc16, crc32};
use crate::error::{Result, VbfError};
use crate::header::{parse_header, EraseRange, SwPartType, VbfHeader};
use crate::lzss;

/// A parsed VBF image. Blocks are read lazily from the retained bytes.
#[derive(Debug, Clone)]
pub struct VbfFile {
    header: VbfHeader,
    bytes: Vec<u8>,
    path: Option<PathBuf>,
}

impl VbfFile {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let header = parse_header(&bytes)?;
        debug!(
            part_type = %header.sw_part_type,
            header_len = header.header_len,
            size = bytes.len(),
            "Parsed VBF header"
        );
        Ok(Self {
            header,
            bytes,
            path: None,
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let mut file = Self::from_bytes(bytes)?;
        info!(path = %path.display(), part_type = %file.header.sw_part_type, "Loaded VBF");
        file.path = Some(path.to_path_buf());
        Ok(file)
    }

    pub fn header(&self) -> &VbfHeader {
        &self.header
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Display name for logs
    pub fn name(&self) -> String {
        match (&self.path, &self.header.sw_part_number) {
            (Some(path), _) => path.display().to_string(),
            (None, Some(part)) => part.clone(),
            (None, None) => self.header.sw_part_type.to_string(),
        }
    }

    pub fn blocks(&self) -> VbfBlocks<'_> {
        VbfBlocks::new(&self.bytes, self.header.header_len)
    }

    /// The binary section after the header
    pub fn block_data(&self) -> &[u8] {
        &self.bytes[self.header.header_len..]
    }

    /// Compare the header's `file_checksum` with the CRC32 of the block stream.
    /// Files without the field pass.
    pub fn verify_file_checksum(&self) -> Result<()> {
        let Some(expected) = self.header.file_checksum else {
            return Ok(());
        };
        let actual = crc32(self.block_data());
        if actual != expected {
            return Err(VbfError::FileChecksumMismatch { expected, actual });
        }
        Ok(())
    }

    /// Decode every block and check its CRC; returns the block count
    pub fn verify_blocks(&self) -> Result<usize> {
        let mut count = 0;
        for block in self.blocks() {
            block?.decode(self.header.data_format_identifier)?;
            count += 1;
        }
        Ok(count)
    }
}

/// Builds byte-exact VBF images
#[derive(Debug, Clone)]
pub struct VbfBuilder {
    part_type: SwPartType,
    part_number: String,
    sw_version: String,
    data_format_identifier: u8,
    ecu_address: Option<u32>,
    call: Option<u32>,
    erase: Vec<EraseRange>,
    sw_signature_dev: Option<Vec<u8>>,
    blocks: Vec<(u32, Vec<u8>)>,
}

impl VbfBuilder {
    pub fn new(part_type: SwPartType) -> Self {
        Self {
            part_type,
            part_number: "00000000".to_string(),
            sw_version: "AA".to_string(),
            data_format_identifier: FORMAT_UNCOMPRESSED,
            ecu_address: None,
            call: None,
            erase: Vec::new(),
            sw_signature_dev: None,
            blocks: Vec::new(),
        }
    }

    pub fn part_number(mut self, part_number: impl Into<String>) -> Self {
        self.part_number = part_number.into();
        self
    }

    pub fn sw_version(mut self, sw_version: impl Into<String>) -> Self {
        self.sw_version = sw_version.into();
        self
    }

    pub fn compressed(mut self) -> Self {
        self.data_format_identifier = FORMAT_LZSS;
        self
    }

    pub fn data_format_identifier(mut self, identifier: u8) -> Self {
        self.data_format_identifier = identifier;
        self
    }

    pub fn ecu_address(mut self, address: u32) -> Self {
        self.ecu_address = Some(address);
        self
    }

    pub fn call(mut self, address: u32) -> Self {
        self.call = Some(address);
        self
    }

    pub fn erase(mut self, address: u32, length: u32) -> Self {
        self.erase.push(EraseRange { address, length });
        self
    }

    pub fn sw_signature_dev(mut self, signature: Vec<u8>) -> Self {
        self.sw_signature_dev = Some(signature);
        self
    }

    /// Add a block of plain (uncompressed) data
    pub fn block(mut self, address: u32, data: impl Into<Vec<u8>>) -> Self {
        self.blocks.push((address, data.into()));
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut binary = Vec::new();
        for (address, plain) in &self.blocks {
            let stored = if self.data_format_identifier == FORMAT_LZSS {
                lzss::compress(plain)
            } else {
                plain.clone()
            };
            binary.extend_from_slice(&address.to_be_bytes());
            binary.extend_from_slice(&(stored.len() as u32).to_be_bytes());
            binary.extend_from_slice(&stored);
            binary.extend_from_slice(&crc16(plain).to_be_bytes());
        }

        let mut header = String::from("vbf_version = 2.2;\r\n\r\nheader {\r\n");
        let _ = write!(header, "    sw_part_number = \"{}\";\r\n", self.part_number);
        let _ = write!(header, "    sw_version = \"{}\";\r\n", self.sw_version);
        let _ = write!(header, "    sw_part_type = {};\r\n", self.part_type);
        let _ = write!(
            header,
            "    data_format_identifier = 0x{:02X};\r\n",
            self.data_format_identifier
        );
        if let Some(address) = self.ecu_address {
            let _ = write!(header, "    ecu_address = 0x{:X};\r\n", address);
        }
        if !self.erase.is_empty() {
            let ranges: Vec<String> = self
                .erase
                .iter()
                .map(|r| format!("{{ 0x{:08X}, 0x{:08X} }}", r.address, r.length))
                .collect();
            let _ = write!(header, "    erase = {{ {} }};\r\n", ranges.join(",\r\n              "));
        }
        if let Some(call) = self.call {
            let _ = write!(header, "    call = 0x{:08X};\r\n", call);
        }
        if let Some(signature) = &self.sw_signature_dev {
            let _ = write!(header, "    sw_signature_dev = 0x{};\r\n", hex::encode_upper(signature));
        }
        let _ = write!(header, "    file_checksum = 0x{:08X};\r\n}}", crc32(&binary));

        let mut bytes = header.into_bytes();
        bytes.extend_from_slice(&binary);
        bytes
    }

    pub fn build_file(&self) -> Result<VbfFile> {
        VbfFile::from_bytes(self.build())
    }
}

/// Blocks of a file decoded and CRC-checked, in file order
pub fn decoded_blocks(file: &VbfFile) -> impl Iterator<Item = Result<(VbfBlock, Vec<u8>)>> + '_ {
    let format = file.header().data_format_identifier;
    file.blocks().map(move |block| {
        let block = block?;
        let decoded = block.decode(format)?;
        Ok((block, decoded))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> VbfBuilder {
        VbfBuilder::new(SwPartType::Exe)
            .part_number("32218941")
            .ecu_address(0x1A01)
            .erase(0x0008_0000, 0x0002_0000)
            .erase(0x000A_0000, 0x0001_0000)
            .block(0x0008_0000, vec![0x11; 300])
            .block(0x000A_0000, (0..=255u8).collect::<Vec<u8>>())
    }

    #[test]
    fn test_built_file_round_trips() {
        let file = sample().build_file().unwrap();
        let header = file.header();

        assert_eq!(header.sw_part_type, SwPartType::Exe);
        assert_eq!(header.sw_part_number.as_deref(), Some("32218941"));
        assert_eq!(header.erase.len(), 2);
        assert_eq!(file.verify_blocks().unwrap(), 2);
        file.verify_file_checksum().unwrap();

        let blocks: Vec<_> = decoded_blocks(&file).collect::<Result<_>>().unwrap();
        assert_eq!(blocks[0].0.start_address, 0x0008_0000);
        assert_eq!(blocks[0].1, vec![0x11; 300]);
        assert_eq!(blocks[1].1, (0..=255u8).collect::<Vec<u8>>());
    }

    #[test]
    fn test_compressed_file() {
        let file = sample().compressed().build_file().unwrap();
        assert_eq!(file.header().data_format_identifier, FORMAT_LZSS);

        let first = file.blocks().next().unwrap().unwrap();
        assert!(first.data.len() < 300);
        assert_eq!(file.verify_blocks().unwrap(), 2);
    }

    #[test]
    fn test_flipped_bit_is_detected() {
        let mut bytes = sample().build();
        let header_len = parse_header(&bytes).unwrap().header_len;
        bytes[header_len + 8 + 10] ^= 0x04;

        let file = VbfFile::from_bytes(bytes).unwrap();
        assert!(matches!(
            file.verify_blocks(),
            Err(VbfError::CrcMismatch { .. })
        ));
        assert!(matches!(
            file.verify_file_checksum(),
            Err(VbfError::FileChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.vbf");
        std::fs::write(&path, sample().build()).unwrap();

        let file = VbfFile::load(&path).unwrap();
        assert_eq!(file.path(), Some(path.as_path()));
        assert_eq!(file.blocks().count(), 2);
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            VbfFile::load("/nonexistent/file.vbf"),
            Err(VbfError::Io(_))
        ));
    }
}

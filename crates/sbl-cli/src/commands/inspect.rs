//! Inspect command - VBF header, blocks and checksums

use std::path::Path;

use anyhow::{bail, Context, Result};
use sbl_vbf::VbfFile;
use serde::Serialize;
use tabled::Tabled;

use crate::output::OutputContext;

#[derive(Debug, Serialize)]
pub struct VbfSummary {
    pub part_type: String,
    pub part_number: Option<String>,
    pub sw_version: Option<String>,
    pub data_format_identifier: String,
    pub call: Option<String>,
    pub erase: Vec<String>,
    /// `None` when the header has no file_checksum
    pub file_checksum_ok: Option<bool>,
    pub blocks: Vec<BlockRow>,
}

impl VbfSummary {
    pub fn is_valid(&self) -> bool {
        self.file_checksum_ok != Some(false) && self.blocks.iter().all(|b| b.error.is_none())
    }
}

#[derive(Debug, Serialize, Tabled)]
pub struct BlockRow {
    #[tabled(rename = "Address")]
    pub address: String,
    #[tabled(rename = "Stored")]
    pub stored: u32,
    #[tabled(rename = "Decoded")]
    pub decoded: usize,
    #[tabled(rename = "CRC16")]
    pub crc16: String,
    #[tabled(rename = "Status", display_with = "display_status")]
    pub error: Option<String>,
}

fn display_status(error: &Option<String>) -> String {
    error.clone().unwrap_or_else(|| "ok".to_string())
}

/// Decode every block and collect what the file claims about itself
pub fn summarize(file: &VbfFile) -> VbfSummary {
    let header = file.header();
    let file_checksum_ok = header
        .file_checksum
        .map(|_| file.verify_file_checksum().is_ok());

    let mut blocks = Vec::new();
    for block in file.blocks() {
        let block = match block {
            Ok(block) => block,
            Err(e) => {
                blocks.push(BlockRow {
                    address: "-".to_string(),
                    stored: 0,
                    decoded: 0,
                    crc16: "-".to_string(),
                    error: Some(e.to_string()),
                });
                break;
            }
        };
        let (decoded, error) = match block.decode(header.data_format_identifier) {
            Ok(data) => (data.len(), None),
            Err(e) => (0, Some(e.to_string())),
        };
        blocks.push(BlockRow {
            address: format!("0x{:08X}", block.start_address),
            stored: block.length,
            decoded,
            crc16: format!("0x{:04X}", block.crc16),
            error,
        });
    }

    VbfSummary {
        part_type: header.sw_part_type.to_string(),
        part_number: header.sw_part_number.clone(),
        sw_version: header.sw_version.clone(),
        data_format_identifier: format!("0x{:02X}", header.data_format_identifier),
        call: header.call.map(|a| format!("0x{:08X}", a)),
        erase: header
            .erase
            .iter()
            .map(|r| format!("0x{:08X}+0x{:X}", r.address, r.length))
            .collect(),
        file_checksum_ok,
        blocks,
    }
}

pub fn inspect(path: &Path, ctx: &OutputContext) -> Result<()> {
    let file =
        VbfFile::load(path).with_context(|| format!("Failed to read VBF {}", path.display()))?;
    let summary = summarize(&file);

    ctx.json(&summary);
    ctx.info(&format!("File:        {}", path.display()));
    ctx.info(&format!("Part type:   {}", summary.part_type));
    if let Some(part) = &summary.part_number {
        ctx.info(&format!("Part number: {}", part));
    }
    if let Some(version) = &summary.sw_version {
        ctx.info(&format!("SW version:  {}", version));
    }
    ctx.info(&format!("Format:      {}", summary.data_format_identifier));
    if let Some(call) = &summary.call {
        ctx.info(&format!("Call:        {}", call));
    }
    if !summary.erase.is_empty() {
        ctx.info(&format!("Erase:       {}", summary.erase.join(", ")));
    }
    match summary.file_checksum_ok {
        Some(true) => ctx.info("Checksum:    ok"),
        Some(false) => ctx.warn("Checksum:    MISMATCH"),
        None => ctx.info("Checksum:    not present"),
    }
    ctx.table(&summary.blocks);

    if !summary.is_valid() {
        bail!("{} failed verification", path.display());
    }
    ctx.success(&format!("{} blocks verified", summary.blocks.len()));
    Ok(())
}

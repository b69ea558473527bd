//! Block transfer: erase, RequestDownload, TransferData, RequestTransferExit
//!
//! Blocks go to the ECU strictly in file order and one at a time. Any
//! failure aborts the block; nothing is retried or resumed.

use serde::{Deserialize, Serialize};
use sbl_vbf::{EraseRange, VbfBlock, VbfFile};
use tracing::{debug, info, warn};

use crate::error::{Result, UdsError};
use crate::uds::{routine_id, UdsService, ADDRESS_AND_LENGTH_FORMAT};

/// TransferData SID and counter taken from each maxNumberOfBlockLength
const TRANSFER_DATA_OVERHEAD: u32 = 2;

/// What the ECU supports, configured per ECU rather than guessed from
/// responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EcuCapability {
    /// The ECU verifies downloads with the Check-Memory routine; its
    /// transfer-exit record is then all zero instead of a CRC16
    #[serde(default)]
    pub check_memory: bool,
}

/// Totals for one downloaded file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadSummary {
    pub blocks: usize,
    pub bytes: usize,
    pub erased_ranges: usize,
}

/// Next TransferData counter: 1, 2, .., 0xFF, 0x00, 0x01, ..
pub fn next_block_counter(counter: u8) -> u8 {
    counter.wrapping_add(1)
}

#[derive(Clone)]
pub struct BlockTransfer {
    uds: UdsService,
    capability: EcuCapability,
}

impl BlockTransfer {
    pub fn new(uds: UdsService, capability: EcuCapability) -> Self {
        Self { uds, capability }
    }

    pub fn capability(&self) -> EcuCapability {
        self.capability
    }

    /// Returns the ECU's maxNumberOfBlockLength
    pub async fn request_download(&self, address: u32, size: u32, data_format: u8) -> Result<u32> {
        info!(
            address = format!("0x{:08X}", address),
            size,
            data_format = format!("0x{:02X}", data_format),
            address_format = format!("0x{:02X}", ADDRESS_AND_LENGTH_FORMAT),
            "Requesting download"
        );
        let max_block_length = self.uds.request_download(data_format, address, size).await?;
        if max_block_length <= TRANSFER_DATA_OVERHEAD {
            return Err(UdsError::InvalidResponse(format!(
                "maxNumberOfBlockLength {} leaves no room for data",
                max_block_length
            )));
        }
        debug!(max_block_length, "Download accepted");
        Ok(max_block_length)
    }

    /// Send `data` in chunks of `max_block_length - 2`; returns the chunk count
    pub async fn transfer_data(&self, data: &[u8], max_block_length: u32) -> Result<usize> {
        if max_block_length <= TRANSFER_DATA_OVERHEAD {
            return Err(UdsError::InvalidResponse(format!(
                "maxNumberOfBlockLength {} leaves no room for data",
                max_block_length
            )));
        }
        let chunk_len = (max_block_length - TRANSFER_DATA_OVERHEAD) as usize;

        let mut counter = 1u8;
        let mut chunks = 0;
        for chunk in data.chunks(chunk_len) {
            self.uds.transfer_data(counter, chunk).await?;
            counter = next_block_counter(counter);
            chunks += 1;
        }
        debug!(chunks, bytes = data.len(), "Transfer complete");
        Ok(chunks)
    }

    /// Close the transfer and check the exit record against the block CRC
    pub async fn transfer_exit(&self, expected_crc: u16) -> Result<()> {
        let record = self.uds.request_transfer_exit().await?;

        if self.capability.check_memory {
            if record.iter().any(|b| *b != 0) {
                return Err(UdsError::InvalidResponse(format!(
                    "Transfer exit record should be zero with check-memory: {}",
                    hex::encode_upper(&record)
                )));
            }
            return Ok(());
        }

        let [a, b] = record.as_slice() else {
            return Err(UdsError::InvalidResponse(format!(
                "Transfer exit record is not a CRC16: {}",
                hex::encode_upper(&record)
            )));
        };
        let actual = u16::from_be_bytes([*a, *b]);
        if actual != expected_crc {
            warn!(
                expected = format!("0x{:04X}", expected_crc),
                actual = format!("0x{:04X}", actual),
                "ECU checksum differs from block CRC"
            );
            return Err(UdsError::ProtocolSequence(format!(
                "Transfer exit CRC 0x{:04X}, expected 0x{:04X}",
                actual, expected_crc
            )));
        }
        Ok(())
    }

    /// Erase every range with RoutineControl FF00; the first failure stops
    pub async fn flash_erase(&self, ranges: &[EraseRange]) -> Result<()> {
        for range in ranges {
            info!(
                address = format!("0x{:08X}", range.address),
                length = range.length,
                "Erasing"
            );
            let mut params = vec![ADDRESS_AND_LENGTH_FORMAT];
            params.extend_from_slice(&range.address.to_be_bytes());
            params.extend_from_slice(&range.length.to_be_bytes());

            self.uds
                .routine_control_start(routine_id::ERASE_MEMORY, &params)
                .await?
                .ensure_passed()?;
        }
        Ok(())
    }

    /// Verify the block CRC, then download it. A corrupt block produces no
    /// bus traffic at all.
    ///
    /// The requested memory size is the stored length: compressed blocks go
    /// over the wire as stored and the ECU decompresses them.
    pub async fn transfer_data_block(&self, block: &VbfBlock, data_format: u8) -> Result<()> {
        block.decode(data_format)?;
        let max_block_length = self
            .request_download(block.start_address, block.length, data_format)
            .await?;
        self.transfer_data(&block.data, max_block_length).await?;
        self.transfer_exit(block.crc16).await
    }

    /// Erase the file's ranges, download all blocks and run Check-Memory
    /// when the ECU supports it
    pub async fn download_vbf(&self, file: &VbfFile) -> Result<DownloadSummary> {
        let header = file.header();
        info!(
            file = %file.name(),
            part_type = %header.sw_part_type,
            erase_ranges = header.erase.len(),
            "Downloading VBF"
        );

        let mut summary = DownloadSummary {
            erased_ranges: header.erase.len(),
            ..Default::default()
        };
        self.flash_erase(&header.erase).await?;

        for block in file.blocks() {
            let block = block?;
            self.transfer_data_block(&block, header.data_format_identifier)
                .await?;
            summary.blocks += 1;
            summary.bytes += block.data.len();
        }

        if self.capability.check_memory {
            let signature = header.sw_signature_dev.clone().unwrap_or_default();
            self.uds
                .routine_control_start(routine_id::CHECK_MEMORY, &signature)
                .await?
                .ensure_passed()?;
            debug!(file = %file.name(), "Check memory passed");
        }

        info!(
            file = %file.name(),
            blocks = summary.blocks,
            bytes = summary.bytes,
            "VBF downloaded"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sbl_transport::MockTransportAdapter;
    use sbl_vbf::{crc16, SwPartType, VbfBuilder, VbfError, FORMAT_LZSS, FORMAT_UNCOMPRESSED};
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};

    fn transfer(check_memory: bool) -> (Arc<MockTransportAdapter>, BlockTransfer) {
        let mock = Arc::new(MockTransportAdapter::new());
        mock.add_response(vec![0x34], vec![0x74, 0x20, 0x00, 0x12]);
        mock.add_response(vec![0x31, 0x01], vec![0x71, 0x01, 0xFF, 0x00, 0x10]);
        let transfer = BlockTransfer::new(UdsService::new(mock.clone()), EcuCapability { check_memory });
        (mock, transfer)
    }

    fn echo_counters(mock: &MockTransportAdapter, count: u16) {
        for counter in 0..count {
            let counter = counter as u8;
            mock.add_response(vec![0x36, counter], vec![0x76, counter]);
        }
    }

    #[test]
    fn test_counter_wraps_to_zero() {
        assert_eq!(next_block_counter(0x01), 0x02);
        assert_eq!(next_block_counter(0xFF), 0x00);
    }

    #[tokio::test]
    async fn test_chunks_use_block_length_minus_two() {
        let (mock, transfer) = transfer(false);
        echo_counters(&mock, 256);

        let data: Vec<u8> = (0..40u8).collect();
        assert_eq!(transfer.transfer_data(&data, 18).await.unwrap(), 3);

        let sent = mock.requests_for(0x36);
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0][..2], [0x36, 0x01]);
        assert_eq!(sent[0].len(), 18);
        assert_eq!(sent[2][..2], [0x36, 0x03]);
        assert_eq!(sent[2][2..], data[32..]);
    }

    #[tokio::test]
    async fn test_counter_wraps_during_long_transfer() {
        let (mock, transfer) = transfer(false);
        echo_counters(&mock, 256);

        let data = vec![0xA5; 300];
        transfer.transfer_data(&data, 3).await.unwrap();

        let counters: Vec<u8> = mock.requests_for(0x36).iter().map(|r| r[1]).collect();
        assert_eq!(counters[254], 0xFF);
        assert_eq!(counters[255], 0x00);
        assert_eq!(counters[256], 0x01);
    }

    #[tokio::test]
    async fn test_exit_crc_compared_without_check_memory() {
        let (mock, transfer) = transfer(false);
        mock.add_response(vec![0x37], vec![0x77, 0x29, 0xB1]);
        assert_ok!(transfer.transfer_exit(0x29B1).await);
        assert!(matches!(
            transfer.transfer_exit(0x1234).await,
            Err(UdsError::ProtocolSequence(_))
        ));
    }

    #[tokio::test]
    async fn test_exit_without_crc_rejected() {
        let (_mock, transfer) = transfer(false);
        // default mock reply is a bare 0x77
        assert!(matches!(
            transfer.transfer_exit(0x29B1).await,
            Err(UdsError::InvalidResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_exit_record_must_be_exactly_a_crc16() {
        let (mock, transfer) = transfer(false);
        mock.add_response(vec![0x37], vec![0x77, 0x29, 0xB1, 0x00]);
        assert!(matches!(
            transfer.transfer_exit(0x29B1).await,
            Err(UdsError::InvalidResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_compressed_block_requests_stored_length() {
        let (mock, transfer) = transfer(false);
        echo_counters(&mock, 16);
        let plain = vec![0xFF; 0x100];
        let data = sbl_vbf::lzss::compress(&plain);
        let block = VbfBlock {
            start_address: 0x0001_0000,
            length: data.len() as u32,
            data,
            crc16: crc16(&plain),
        };
        mock.add_response(vec![0x37], vec![0x77, (block.crc16 >> 8) as u8, block.crc16 as u8]);

        assert_ok!(transfer.transfer_data_block(&block, FORMAT_LZSS).await);

        let request = mock.requests_for(0x34).pop().unwrap();
        assert_eq!(request[..3], [0x34, FORMAT_LZSS, 0x44]);
        assert_eq!(request[7..], block.length.to_be_bytes());
        let sent: usize = mock.requests_for(0x36).iter().map(|r| r.len() - 2).sum();
        assert_eq!(sent, block.length as usize);
        assert!(block.length < 0x100);
    }

    #[tokio::test]
    async fn test_exit_zero_record_with_check_memory() {
        let (mock, transfer) = transfer(true);
        assert_ok!(transfer.transfer_exit(0x29B1).await);
        mock.add_response(vec![0x37], vec![0x77, 0x00, 0x00]);
        assert_ok!(transfer.transfer_exit(0x29B1).await);

        mock.add_response(vec![0x37], vec![0x77, 0x29, 0xB1]);
        assert_err!(transfer.transfer_exit(0x29B1).await);
    }

    #[tokio::test]
    async fn test_erase_fails_on_aborted_range() {
        let (mock, transfer) = transfer(false);
        let mut second = vec![0x31, 0x01, 0xFF, 0x00, 0x44, 0x00, 0x02, 0x00, 0x00];
        second.extend_from_slice(&0x100u32.to_be_bytes());
        mock.add_response(second, vec![0x71, 0x01, 0xFF, 0x00, 0x11]);

        let ranges = [
            EraseRange { address: 0x0001_0000, length: 0x100 },
            EraseRange { address: 0x0002_0000, length: 0x100 },
            EraseRange { address: 0x0003_0000, length: 0x100 },
        ];
        assert!(matches!(
            transfer.flash_erase(&ranges).await,
            Err(UdsError::RoutineFailed { routine_id: 0xFF00, .. })
        ));
        assert_eq!(mock.requests_for(0x31).len(), 2);
    }

    #[tokio::test]
    async fn test_corrupt_block_never_reaches_the_bus() {
        let (mock, transfer) = transfer(false);
        let data = b"123456789".to_vec();
        let mut block = VbfBlock {
            start_address: 0x0001_0000,
            length: data.len() as u32,
            data,
            crc16: 0x29B1,
        };
        block.data[4] ^= 0x10;

        assert!(matches!(
            transfer.transfer_data_block(&block, FORMAT_UNCOMPRESSED).await,
            Err(UdsError::Vbf(VbfError::CrcMismatch { .. }))
        ));
        assert!(mock.requests_for(0x34).is_empty());
        assert!(mock.requests_for(0x37).is_empty());
    }

    #[tokio::test]
    async fn test_download_vbf_sequence() {
        let (mock, transfer) = transfer(true);
        echo_counters(&mock, 4);
        mock.add_response(vec![0x31, 0x01, 0x02, 0x12], vec![0x71, 0x01, 0x02, 0x12, 0x10, 0x00]);

        let file = VbfBuilder::new(SwPartType::Exe)
            .erase(0x0001_0000, 0x1000)
            .sw_signature_dev(vec![0xDE, 0xAD])
            .block(0x0001_0000, vec![0x55; 20])
            .block(0x0001_0800, vec![0x66; 10])
            .build_file()
            .unwrap();

        let summary = transfer.download_vbf(&file).await.unwrap();
        assert_eq!(
            summary,
            DownloadSummary {
                blocks: 2,
                bytes: 30,
                erased_ranges: 1
            }
        );

        let services: Vec<u8> = mock.requests().iter().map(|r| r[0]).collect();
        assert_eq!(
            services,
            vec![0x31, 0x34, 0x36, 0x36, 0x37, 0x34, 0x36, 0x37, 0x31]
        );
        let check = mock.requests_for(0x31).pop().unwrap();
        assert_eq!(check, vec![0x31, 0x01, 0x02, 0x12, 0xDE, 0xAD]);
        assert_eq!(crc16(&[0x55; 20]), file.blocks().next().unwrap().unwrap().crc16);
    }
}

//! UDS service layer for the programming sequence

use std::sync::Arc;
use std::time::Duration;

use sbl_transport::{TransportAdapter, TransportError};
use tracing::{debug, warn};

use super::routine::RoutineResult;
use super::{
    routine_sub_function, service_id, standard_did, DiagnosticSession, NegativeResponseCode,
    ADDRESS_AND_LENGTH_FORMAT,
};
use crate::error::{Result, UdsError};

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2000);
/// P2* extended timeout after a response-pending NRC
const RESPONSE_PENDING_TIMEOUT: Duration = Duration::from_millis(5000);
const MAX_PENDING_RESPONSES: usize = 64;

fn transport_error(e: TransportError) -> UdsError {
    match e {
        TransportError::Timeout(_) => UdsError::Timeout,
        other => UdsError::Transport(other),
    }
}

/// UDS client over any [`TransportAdapter`]
#[derive(Clone)]
pub struct UdsService {
    transport: Arc<dyn TransportAdapter>,
    timeout: Duration,
    pending_timeout: Duration,
}

impl UdsService {
    pub fn new(transport: Arc<dyn TransportAdapter>) -> Self {
        Self {
            transport,
            timeout: DEFAULT_TIMEOUT,
            pending_timeout: RESPONSE_PENDING_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_pending_timeout(mut self, timeout: Duration) -> Self {
        self.pending_timeout = timeout;
        self
    }

    pub fn transport(&self) -> &Arc<dyn TransportAdapter> {
        &self.transport
    }

    /// Send a request and return the positive response.
    ///
    /// Response-pending NRCs are absorbed by waiting for the follow-up
    /// message; any other negative response becomes an error.
    pub async fn request(&self, request: &[u8]) -> Result<Vec<u8>> {
        let Some(&sid) = request.first() else {
            return Err(UdsError::InvalidResponse("Empty request".to_string()));
        };

        let mut response = self
            .transport
            .send_receive(request, self.timeout)
            .await
            .map_err(transport_error)?;

        let mut pending = 0;
        while response.first() == Some(&service_id::NEGATIVE_RESPONSE) {
            if response.len() < 3 {
                return Err(UdsError::InvalidResponse(format!(
                    "Negative response too short: {}",
                    hex::encode_upper(&response)
                )));
            }
            let nrc = NegativeResponseCode::from(response[2]);
            if response[1] != sid {
                return Err(UdsError::InvalidResponse(format!(
                    "Negative response for service 0x{:02X} while waiting for 0x{:02X}",
                    response[1], sid
                )));
            }
            if !nrc.is_response_pending() {
                warn!(
                    request = %hex::encode_upper(request),
                    response = %hex::encode_upper(&response),
                    %nrc,
                    "Negative response"
                );
                return Err(UdsError::NegativeResponse { service_id: sid, nrc });
            }

            pending += 1;
            if pending > MAX_PENDING_RESPONSES {
                return Err(UdsError::Timeout);
            }
            debug!(service = format!("0x{:02X}", sid), pending, "Response pending");
            response = self
                .transport
                .receive(self.pending_timeout)
                .await
                .map_err(transport_error)?;
        }

        let expected = sid.wrapping_add(service_id::POSITIVE_OFFSET);
        if response.first() != Some(&expected) {
            warn!(
                request = %hex::encode_upper(request),
                response = %hex::encode_upper(&response),
                "Unexpected response"
            );
            return Err(UdsError::InvalidResponse(format!(
                "Expected positive response 0x{:02X}, got {}",
                expected,
                hex::encode_upper(&response)
            )));
        }
        Ok(response)
    }

    /// Diagnostic Session Control (0x10)
    pub async fn diagnostic_session_control(&self, session: DiagnosticSession) -> Result<()> {
        let response = self
            .request(&[service_id::DIAGNOSTIC_SESSION_CONTROL, session.id()])
            .await?;
        if response.get(1) != Some(&session.id()) {
            return Err(UdsError::InvalidResponse(format!(
                "Session change echoed {}",
                hex::encode_upper(&response)
            )));
        }
        Ok(())
    }

    /// ECU Reset (0x11)
    pub async fn ecu_reset(&self, reset_type: u8) -> Result<()> {
        self.request(&[service_id::ECU_RESET, reset_type]).await?;
        Ok(())
    }

    /// Tester Present (0x3E)
    pub async fn tester_present(&self, suppress_response: bool) -> Result<()> {
        if suppress_response {
            self.transport
                .send(&[service_id::TESTER_PRESENT, 0x80])
                .await
                .map_err(transport_error)
        } else {
            self.request(&[service_id::TESTER_PRESENT, 0x00]).await?;
            Ok(())
        }
    }

    /// Read Data By Identifier (0x22) for a single DID; returns the data record
    pub async fn read_data_by_id(&self, did: u16) -> Result<Vec<u8>> {
        let [hi, lo] = did.to_be_bytes();
        let response = self.request(&[service_id::READ_DATA_BY_ID, hi, lo]).await?;
        if response.len() < 3 || response[1..3] != [hi, lo] {
            return Err(UdsError::InvalidResponse(format!(
                "ReadDataByIdentifier 0x{:04X} answered with {}",
                did,
                hex::encode_upper(&response)
            )));
        }
        Ok(response[3..].to_vec())
    }

    /// Active diagnostic session from DID F186
    pub async fn read_active_session(&self) -> Result<DiagnosticSession> {
        let [hi, lo] = standard_did::ACTIVE_DIAGNOSTIC_SESSION.to_be_bytes();
        let response = self.request(&[service_id::READ_DATA_BY_ID, hi, lo]).await?;
        DiagnosticSession::from_f186_response(&response)
    }

    /// Write Data By Identifier (0x2E)
    pub async fn write_data_by_id(&self, did: u16, data: &[u8]) -> Result<()> {
        let mut request = vec![service_id::WRITE_DATA_BY_ID];
        request.extend_from_slice(&did.to_be_bytes());
        request.extend_from_slice(data);
        self.request(&request).await?;
        Ok(())
    }

    /// SecurityAccess requestSeed (odd sub-function); returns the seed bytes
    pub async fn security_access_request_seed(&self, level: u8) -> Result<Vec<u8>> {
        let response = self.request(&[service_id::SECURITY_ACCESS, level]).await?;
        if response.get(1) != Some(&level) {
            return Err(UdsError::InvalidResponse(format!(
                "Seed response for wrong level: {}",
                hex::encode_upper(&response)
            )));
        }
        Ok(response[2..].to_vec())
    }

    /// SecurityAccess sendKey (even sub-function)
    pub async fn security_access_send_key(&self, key_level: u8, key: &[u8]) -> Result<()> {
        let mut request = vec![service_id::SECURITY_ACCESS, key_level];
        request.extend_from_slice(key);
        let response = self.request(&request).await?;
        if response.get(1) != Some(&key_level) {
            return Err(UdsError::InvalidResponse(format!(
                "Key response for wrong level: {}",
                hex::encode_upper(&response)
            )));
        }
        Ok(())
    }

    /// RoutineControl startRoutine (0x31 0x01)
    pub async fn routine_control_start(&self, routine_id: u16, params: &[u8]) -> Result<RoutineResult> {
        let mut request = vec![service_id::ROUTINE_CONTROL, routine_sub_function::START_ROUTINE];
        request.extend_from_slice(&routine_id.to_be_bytes());
        request.extend_from_slice(params);
        let response = self.request(&request).await?;
        RoutineResult::parse(&response, routine_id)
    }

    /// RoutineControl requestRoutineResults (0x31 0x03)
    pub async fn routine_control_result(&self, routine_id: u16) -> Result<RoutineResult> {
        let mut request = vec![
            service_id::ROUTINE_CONTROL,
            routine_sub_function::REQUEST_ROUTINE_RESULTS,
        ];
        request.extend_from_slice(&routine_id.to_be_bytes());
        let response = self.request(&request).await?;
        RoutineResult::parse(&response, routine_id)
    }

    /// Request Download (0x34); returns maxNumberOfBlockLength
    pub async fn request_download(&self, data_format: u8, address: u32, size: u32) -> Result<u32> {
        let mut request = vec![
            service_id::REQUEST_DOWNLOAD,
            data_format,
            ADDRESS_AND_LENGTH_FORMAT,
        ];
        request.extend_from_slice(&address.to_be_bytes());
        request.extend_from_slice(&size.to_be_bytes());

        let response = self.request(&request).await?;
        if response.len() < 2 {
            return Err(UdsError::InvalidResponse(
                "RequestDownload response too short".to_string(),
            ));
        }

        let num_bytes = (response[1] >> 4) as usize;
        if num_bytes == 0 || num_bytes > 4 || response.len() < 2 + num_bytes {
            return Err(UdsError::InvalidResponse(format!(
                "RequestDownload response missing maxNumberOfBlockLength: {}",
                hex::encode_upper(&response)
            )));
        }

        Ok(response[2..2 + num_bytes]
            .iter()
            .fold(0u32, |acc, b| (acc << 8) | *b as u32))
    }

    /// Transfer Data (0x36); the ECU must echo the sequence counter
    pub async fn transfer_data(&self, block_counter: u8, data: &[u8]) -> Result<()> {
        let mut request = Vec::with_capacity(data.len() + 2);
        request.push(service_id::TRANSFER_DATA);
        request.push(block_counter);
        request.extend_from_slice(data);

        let response = self.request(&request).await?;
        match response.get(1) {
            Some(echo) if *echo == block_counter => Ok(()),
            echo => {
                warn!(
                    expected = format!("0x{:02X}", block_counter),
                    response = %hex::encode_upper(&response),
                    "TransferData counter mismatch"
                );
                Err(UdsError::ProtocolSequence(format!(
                    "TransferData echoed counter {:?}, expected 0x{:02X}",
                    echo, block_counter
                )))
            }
        }
    }

    /// Request Transfer Exit (0x37); returns the transferResponseParameterRecord
    pub async fn request_transfer_exit(&self) -> Result<Vec<u8>> {
        let response = self.request(&[service_id::REQUEST_TRANSFER_EXIT]).await?;
        Ok(response[1..].to_vec())
    }
}

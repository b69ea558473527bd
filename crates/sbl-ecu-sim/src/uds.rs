//! UDS constants and response builders for the ECU side

/// Service IDs the simulated ECU answers
pub mod service_id {
    pub const DIAGNOSTIC_SESSION_CONTROL: u8 = 0x10;
    pub const ECU_RESET: u8 = 0x11;
    pub const READ_DATA_BY_ID: u8 = 0x22;
    pub const SECURITY_ACCESS: u8 = 0x27;
    pub const WRITE_DATA_BY_ID: u8 = 0x2E;
    pub const ROUTINE_CONTROL: u8 = 0x31;
    pub const REQUEST_DOWNLOAD: u8 = 0x34;
    pub const TRANSFER_DATA: u8 = 0x36;
    pub const REQUEST_TRANSFER_EXIT: u8 = 0x37;
    pub const TESTER_PRESENT: u8 = 0x3E;
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;
}

pub mod routine_id {
    pub const ERASE_MEMORY: u16 = 0xFF00;
    pub const ACTIVATE_SBL: u16 = 0x0301;
    pub const CHECK_MEMORY: u16 = 0x0212;
    pub const COMPLETE_AND_COMPATIBLE: u16 = 0x0205;
}

/// Routine info byte
pub mod routine_status {
    pub const COMPLETED: u8 = 0x10;
    pub const ABORTED: u8 = 0x11;
}

pub mod session {
    pub const DEFAULT: u8 = 0x01;
    pub const PROGRAMMING: u8 = 0x02;
    pub const EXTENDED: u8 = 0x03;
}

pub const DID_ACTIVE_SESSION: u16 = 0xF186;

/// UDS Negative Response Codes
pub mod nrc {
    pub const SERVICE_NOT_SUPPORTED: u8 = 0x11;
    pub const SUB_FUNCTION_NOT_SUPPORTED: u8 = 0x12;
    pub const INCORRECT_MESSAGE_LENGTH: u8 = 0x13;
    pub const CONDITIONS_NOT_CORRECT: u8 = 0x22;
    pub const REQUEST_SEQUENCE_ERROR: u8 = 0x24;
    pub const REQUEST_OUT_OF_RANGE: u8 = 0x31;
    pub const SECURITY_ACCESS_DENIED: u8 = 0x33;
    pub const UPLOAD_DOWNLOAD_NOT_ACCEPTED: u8 = 0x70;
    pub const GENERAL_PROGRAMMING_FAILURE: u8 = 0x72;
    pub const WRONG_BLOCK_SEQUENCE_COUNTER: u8 = 0x73;
    pub const RESPONSE_PENDING: u8 = 0x78;
    pub const SERVICE_NOT_SUPPORTED_IN_ACTIVE_SESSION: u8 = 0x7F;
}

pub fn positive_response(service_id: u8, data: &[u8]) -> Vec<u8> {
    let mut response = Vec::with_capacity(1 + data.len());
    response.push(service_id + 0x40);
    response.extend_from_slice(data);
    response
}

pub fn negative_response(service_id: u8, nrc: u8) -> Vec<u8> {
    vec![service_id::NEGATIVE_RESPONSE, service_id, nrc]
}

/// `71 01 <rid> <status> [record]`
pub fn routine_response(routine_id: u16, status: u8, record: &[u8]) -> Vec<u8> {
    let [hi, lo] = routine_id.to_be_bytes();
    let mut data = vec![0x01, hi, lo, status];
    data.extend_from_slice(record);
    positive_response(service_id::ROUTINE_CONTROL, &data)
}

//! Simulated ECU with primary and secondary bootloader behavior
//!
//! The PBL accepts a download into RAM and the activate-SBL routine. Once the
//! SBL runs, erase is allowed and every further download must land inside an
//! erased range.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use sbl_security::{
    derive_key, DelayTimerState, FixedKey, SecurityAlgorithm, SecurityError, SecurityGuard,
    ServerHandshake,
};
use sbl_vbf::{crc16, decode_block_data, EraseRange, FORMAT_LZSS, FORMAT_UNCOMPRESSED};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{EcuConfig, FaultConfig, ProgrammingConfig};
use crate::error::{Result, SimError};
use crate::uds::{
    negative_response, nrc, positive_response, routine_id, routine_response, routine_status,
    service_id, session, DID_ACTIVE_SESSION,
};

/// `addressAndLengthFormatIdentifier` accepted by the erase routine
const ERASE_FORMAT: u8 = 0x44;

enum LevelHandler {
    Legacy {
        fixed_key: FixedKey,
        pending: Option<[u8; 3]>,
    },
    Aes(ServerHandshake),
}

#[derive(Debug, Clone)]
struct DidValue {
    value: Vec<u8>,
    writable: bool,
}

#[derive(Debug)]
struct DownloadState {
    address: u32,
    size: u32,
    data_format: u8,
    buffer: Vec<u8>,
    expected_counter: u8,
}

pub struct SimulatedEcu {
    session: AtomicU8,
    guard: Mutex<SecurityGuard>,
    levels: Mutex<HashMap<u8, LevelHandler>>,
    /// Seed handed out by legacy levels instead of a random one
    fixed_seed: RwLock<Option<[u8; 3]>>,
    dids: RwLock<HashMap<u16, DidValue>>,
    programming: ProgrammingConfig,
    faults: RwLock<FaultConfig>,
    sbl_active: AtomicBool,
    erased: RwLock<Vec<EraseRange>>,
    download_state: RwLock<Option<DownloadState>>,
    /// Written blocks keyed by start address
    memory: RwLock<BTreeMap<u32, Vec<u8>>>,
    blocks_since_check: AtomicUsize,
    application_blocks: AtomicUsize,
}

impl SimulatedEcu {
    pub fn new(config: &EcuConfig) -> Result<Self> {
        let mut levels = HashMap::new();
        for def in &config.security.levels {
            if def.level % 2 == 0 {
                return Err(SimError::Config(format!(
                    "Security level 0x{:02X} must be odd",
                    def.level
                )));
            }
            let handler = match &def.algorithm {
                SecurityAlgorithm::Legacy { fixed_key } => LevelHandler::Legacy {
                    fixed_key: *fixed_key,
                    pending: None,
                },
                SecurityAlgorithm::Aes(keys) => {
                    LevelHandler::Aes(ServerHandshake::new(keys.clone(), def.level)?)
                }
            };
            levels.insert(def.level, handler);
        }

        let mut dids = HashMap::new();
        for def in &config.dids {
            let value = hex::decode(def.value.trim_start_matches("0x")).map_err(|e| {
                SimError::Config(format!("DID 0x{:04X} value '{}': {}", def.did, def.value, e))
            })?;
            dids.insert(
                def.did,
                DidValue {
                    value,
                    writable: def.writable,
                },
            );
        }

        info!(
            levels = levels.len(),
            dids = dids.len(),
            check_memory = config.programming.check_memory,
            "Simulated ECU powered up"
        );

        Ok(Self {
            session: AtomicU8::new(config.programming.initial_session),
            guard: Mutex::new(SecurityGuard::new(
                config.security.delay_timer.clone(),
                Instant::now(),
            )),
            levels: Mutex::new(levels),
            fixed_seed: RwLock::new(None),
            dids: RwLock::new(dids),
            programming: config.programming.clone(),
            faults: RwLock::new(config.faults.clone()),
            sbl_active: AtomicBool::new(false),
            erased: RwLock::new(Vec::new()),
            download_state: RwLock::new(None),
            memory: RwLock::new(BTreeMap::new()),
            blocks_since_check: AtomicUsize::new(0),
            application_blocks: AtomicUsize::new(0),
        })
    }

    pub fn session(&self) -> u8 {
        self.session.load(Ordering::SeqCst)
    }

    pub fn sbl_active(&self) -> bool {
        self.sbl_active.load(Ordering::SeqCst)
    }

    pub fn unlocked_level(&self) -> Option<u8> {
        self.guard.lock().unlocked_level()
    }

    pub fn delay_state(&self, level: u8) -> DelayTimerState {
        self.guard.lock().state(level)
    }

    pub fn erased_ranges(&self) -> Vec<EraseRange> {
        self.erased.read().clone()
    }

    /// Data of the block written at `address`
    pub fn memory_at(&self, address: u32) -> Option<Vec<u8>> {
        self.memory.read().get(&address).cloned()
    }

    pub fn written_blocks(&self) -> usize {
        self.memory.read().len()
    }

    pub fn download_in_progress(&self) -> bool {
        self.download_state.read().is_some()
    }

    /// Make legacy levels hand out `seed`; `None` restores random seeds
    pub fn set_fixed_seed(&self, seed: Option<[u8; 3]>) {
        *self.fixed_seed.write() = seed;
    }

    pub fn set_faults(&self, faults: FaultConfig) {
        *self.faults.write() = faults;
    }

    /// Reset as after a power cycle or ECUReset. Flash contents survive.
    pub fn power_cycle(&self) {
        self.session.store(session::DEFAULT, Ordering::SeqCst);
        self.guard.lock().reboot(Instant::now());
        self.leave_programming();
        info!("ECU reset");
    }

    fn leave_programming(&self) {
        let was_active = self.sbl_active.swap(false, Ordering::SeqCst);
        let had_download = self.download_state.write().take().is_some();
        self.erased.write().clear();
        self.blocks_since_check.store(0, Ordering::SeqCst);
        self.application_blocks.store(0, Ordering::SeqCst);
        if was_active || had_download {
            debug!(was_active, had_download, "Left programming state");
        }
    }

    /// Every response to `request`: response-pending NRCs, if any, then the
    /// final answer. Empty when the response is suppressed.
    pub fn handle(&self, request: &[u8]) -> Vec<Vec<u8>> {
        let response = self.process_request(request);
        if response.is_empty() {
            return Vec::new();
        }

        let pending = if is_erase_request(request) && response[0] != service_id::NEGATIVE_RESPONSE {
            self.programming.erase_pending_responses
        } else {
            0
        };
        let mut responses: Vec<Vec<u8>> = (0..pending)
            .map(|_| negative_response(service_id::ROUTINE_CONTROL, nrc::RESPONSE_PENDING))
            .collect();
        responses.push(response);
        responses
    }

    /// Process a UDS request and return the final response
    pub fn process_request(&self, request: &[u8]) -> Vec<u8> {
        let Some(&sid) = request.first() else {
            return negative_response(0x00, nrc::INCORRECT_MESSAGE_LENGTH);
        };

        let forced = self
            .faults
            .read()
            .negative_responses
            .iter()
            .find(|f| f.service == sid)
            .map(|f| f.nrc);
        if let Some(code) = forced {
            debug!(
                service_id = format!("0x{:02X}", sid),
                nrc = format!("0x{:02X}", code),
                "Forced negative response"
            );
            return negative_response(sid, code);
        }

        match sid {
            service_id::DIAGNOSTIC_SESSION_CONTROL => self.handle_session_control(request),
            service_id::ECU_RESET => self.handle_ecu_reset(request),
            service_id::TESTER_PRESENT => self.handle_tester_present(request),
            service_id::READ_DATA_BY_ID => self.handle_read_data_by_id(request),
            service_id::WRITE_DATA_BY_ID => self.handle_write_data_by_id(request),
            service_id::SECURITY_ACCESS => self.handle_security_access(request),
            service_id::ROUTINE_CONTROL => self.handle_routine_control(request),
            service_id::REQUEST_DOWNLOAD => self.handle_request_download(request),
            service_id::TRANSFER_DATA => self.handle_transfer_data(request),
            service_id::REQUEST_TRANSFER_EXIT => self.handle_request_transfer_exit(request),
            _ => {
                debug!(service_id = format!("0x{:02X}", sid), "Unsupported service");
                negative_response(sid, nrc::SERVICE_NOT_SUPPORTED)
            }
        }
    }

    fn handle_session_control(&self, request: &[u8]) -> Vec<u8> {
        let Some(&requested) = request.get(1) else {
            return negative_response(
                service_id::DIAGNOSTIC_SESSION_CONTROL,
                nrc::INCORRECT_MESSAGE_LENGTH,
            );
        };

        match requested {
            session::DEFAULT | session::PROGRAMMING | session::EXTENDED => {
                let previous = self.session.swap(requested, Ordering::SeqCst);
                if previous != requested {
                    self.guard.lock().lock();
                    if previous == session::PROGRAMMING {
                        self.leave_programming();
                    }
                    info!(
                        from = format!("0x{:02X}", previous),
                        to = format!("0x{:02X}", requested),
                        "Session changed, security relocked"
                    );
                }
                // P2 = 25ms, P2* = 5000ms
                positive_response(
                    service_id::DIAGNOSTIC_SESSION_CONTROL,
                    &[requested, 0x00, 0x19, 0x01, 0xF4],
                )
            }
            _ => negative_response(
                service_id::DIAGNOSTIC_SESSION_CONTROL,
                nrc::SUB_FUNCTION_NOT_SUPPORTED,
            ),
        }
    }

    fn handle_ecu_reset(&self, request: &[u8]) -> Vec<u8> {
        let Some(&reset_type) = request.get(1) else {
            return negative_response(service_id::ECU_RESET, nrc::INCORRECT_MESSAGE_LENGTH);
        };
        if !(0x01..=0x03).contains(&reset_type) {
            return negative_response(service_id::ECU_RESET, nrc::SUB_FUNCTION_NOT_SUPPORTED);
        }
        self.power_cycle();
        positive_response(service_id::ECU_RESET, &[reset_type])
    }

    fn handle_tester_present(&self, request: &[u8]) -> Vec<u8> {
        let Some(&sub_function) = request.get(1) else {
            return negative_response(service_id::TESTER_PRESENT, nrc::INCORRECT_MESSAGE_LENGTH);
        };
        if sub_function & 0x80 != 0 {
            return Vec::new();
        }
        positive_response(service_id::TESTER_PRESENT, &[sub_function & 0x7F])
    }

    fn handle_read_data_by_id(&self, request: &[u8]) -> Vec<u8> {
        if request.len() < 3 || request.len() % 2 == 0 {
            return negative_response(service_id::READ_DATA_BY_ID, nrc::INCORRECT_MESSAGE_LENGTH);
        }

        let dids = self.dids.read();
        let mut data = Vec::new();
        for pair in request[1..].chunks_exact(2) {
            let did = u16::from_be_bytes([pair[0], pair[1]]);
            data.extend_from_slice(pair);
            if did == DID_ACTIVE_SESSION {
                data.push(self.session());
                continue;
            }
            match dids.get(&did) {
                Some(entry) => data.extend_from_slice(&entry.value),
                None => {
                    debug!(did = format!("0x{:04X}", did), "Unknown DID");
                    return negative_response(
                        service_id::READ_DATA_BY_ID,
                        nrc::REQUEST_OUT_OF_RANGE,
                    );
                }
            }
        }
        positive_response(service_id::READ_DATA_BY_ID, &data)
    }

    fn handle_write_data_by_id(&self, request: &[u8]) -> Vec<u8> {
        if request.len() < 4 {
            return negative_response(service_id::WRITE_DATA_BY_ID, nrc::INCORRECT_MESSAGE_LENGTH);
        }
        let did = u16::from_be_bytes([request[1], request[2]]);

        let mut dids = self.dids.write();
        let Some(entry) = dids.get_mut(&did).filter(|e| e.writable) else {
            return negative_response(service_id::WRITE_DATA_BY_ID, nrc::REQUEST_OUT_OF_RANGE);
        };
        if self.unlocked_level().is_none() {
            return negative_response(service_id::WRITE_DATA_BY_ID, nrc::SECURITY_ACCESS_DENIED);
        }

        entry.value = request[3..].to_vec();
        info!(
            did = format!("0x{:04X}", did),
            value = %hex::encode_upper(&entry.value),
            "DID written"
        );
        positive_response(service_id::WRITE_DATA_BY_ID, &request[1..3])
    }

    fn handle_security_access(&self, request: &[u8]) -> Vec<u8> {
        let Some(&sub_function) = request.get(1) else {
            return negative_response(service_id::SECURITY_ACCESS, nrc::INCORRECT_MESSAGE_LENGTH);
        };
        match sub_function {
            0x00 | 0x7F..=0xFF => {
                negative_response(service_id::SECURITY_ACCESS, nrc::SUB_FUNCTION_NOT_SUPPORTED)
            }
            level if level % 2 == 1 => self.request_seed(level, request),
            key_level => self.send_key(key_level - 1, key_level, request),
        }
    }

    fn request_seed(&self, level: u8, request: &[u8]) -> Vec<u8> {
        let now = Instant::now();
        let mut levels = self.levels.lock();
        let Some(handler) = levels.get_mut(&level) else {
            return negative_response(service_id::SECURITY_ACCESS, nrc::SUB_FUNCTION_NOT_SUPPORTED);
        };
        let mut guard = self.guard.lock();

        match handler {
            LevelHandler::Legacy { pending, .. } => {
                if request.len() != 2 {
                    return negative_response(
                        service_id::SECURITY_ACCESS,
                        nrc::INCORRECT_MESSAGE_LENGTH,
                    );
                }
                if guard.is_unlocked(level) {
                    debug!(level = format!("0x{:02X}", level), "Already unlocked, zero seed");
                    return positive_response(service_id::SECURITY_ACCESS, &[level, 0, 0, 0]);
                }
                if let Err(rejection) = guard.on_request_seed(level, now) {
                    return negative_response(service_id::SECURITY_ACCESS, rejection.nrc());
                }

                let seed = self.fixed_seed.read().unwrap_or_else(random_seed);
                *pending = Some(seed);
                info!(
                    level = format!("0x{:02X}", level),
                    seed = %hex::encode_upper(seed),
                    "Providing seed"
                );
                positive_response(service_id::SECURITY_ACCESS, &[level, seed[0], seed[1], seed[2]])
            }
            LevelHandler::Aes(handshake) => {
                if let Err(rejection) = guard.on_request_seed(level, now) {
                    return negative_response(service_id::SECURITY_ACCESS, rejection.nrc());
                }
                match handshake.respond_seed(request) {
                    Ok(response) => {
                        info!(level = format!("0x{:02X}", level), "Authenticated seed request");
                        response
                    }
                    Err(e) => {
                        warn!(
                            level = format!("0x{:02X}", level),
                            error = %e,
                            request = %hex::encode_upper(request),
                            "Rejected clientRequestSeed"
                        );
                        negative_response(service_id::SECURITY_ACCESS, security_error_nrc(&e))
                    }
                }
            }
        }
    }

    fn send_key(&self, level: u8, key_level: u8, request: &[u8]) -> Vec<u8> {
        if request.len() < 3 {
            return negative_response(service_id::SECURITY_ACCESS, nrc::INCORRECT_MESSAGE_LENGTH);
        }
        let now = Instant::now();
        let mut levels = self.levels.lock();
        let Some(handler) = levels.get_mut(&level) else {
            return negative_response(service_id::SECURITY_ACCESS, nrc::SUB_FUNCTION_NOT_SUPPORTED);
        };
        let mut guard = self.guard.lock();

        let verdict = match handler {
            LevelHandler::Legacy { fixed_key, pending } => {
                let seed = pending.take();
                let fixed_key: &FixedKey = fixed_key;
                let key = &request[2..];
                guard.on_send_key(level, now, || {
                    seed.is_some_and(|seed| derive_key(&seed, fixed_key).as_slice() == key)
                })
            }
            LevelHandler::Aes(handshake) => guard.on_send_key(level, now, || {
                match handshake.verify_key(request) {
                    Ok(()) => true,
                    Err(e) => {
                        debug!(error = %e, "clientSendKey rejected");
                        false
                    }
                }
            }),
        };

        match verdict {
            Ok(()) => positive_response(service_id::SECURITY_ACCESS, &[key_level]),
            Err(rejection) => negative_response(service_id::SECURITY_ACCESS, rejection.nrc()),
        }
    }

    fn handle_routine_control(&self, request: &[u8]) -> Vec<u8> {
        if request.len() < 4 {
            return negative_response(service_id::ROUTINE_CONTROL, nrc::INCORRECT_MESSAGE_LENGTH);
        }
        if request[1] != 0x01 {
            return negative_response(service_id::ROUTINE_CONTROL, nrc::SUB_FUNCTION_NOT_SUPPORTED);
        }
        let routine = u16::from_be_bytes([request[2], request[3]]);
        let params = &request[4..];

        if self.session() != session::PROGRAMMING {
            return negative_response(service_id::ROUTINE_CONTROL, nrc::CONDITIONS_NOT_CORRECT);
        }
        if self.unlocked_level().is_none() {
            return negative_response(service_id::ROUTINE_CONTROL, nrc::SECURITY_ACCESS_DENIED);
        }

        match routine {
            routine_id::ERASE_MEMORY => self.erase_memory(params),
            routine_id::ACTIVATE_SBL => self.activate_sbl(params),
            routine_id::CHECK_MEMORY if self.programming.check_memory => self.check_memory(),
            routine_id::COMPLETE_AND_COMPATIBLE => self.complete_and_compatible(),
            _ => {
                debug!(routine = format!("0x{:04X}", routine), "Unsupported routine");
                negative_response(service_id::ROUTINE_CONTROL, nrc::REQUEST_OUT_OF_RANGE)
            }
        }
    }

    fn erase_memory(&self, params: &[u8]) -> Vec<u8> {
        let &[ERASE_FORMAT, a0, a1, a2, a3, l0, l1, l2, l3] = params else {
            return negative_response(service_id::ROUTINE_CONTROL, nrc::INCORRECT_MESSAGE_LENGTH);
        };
        if !self.sbl_active() {
            warn!("Erase refused, SBL not active");
            return negative_response(service_id::ROUTINE_CONTROL, nrc::CONDITIONS_NOT_CORRECT);
        }

        let range = EraseRange {
            address: u32::from_be_bytes([a0, a1, a2, a3]),
            length: u32::from_be_bytes([l0, l1, l2, l3]),
        };
        self.memory
            .write()
            .retain(|address, _| !range_contains(&range, *address, 1));
        self.erased.write().push(range);
        info!(
            address = format!("0x{:08X}", range.address),
            length = range.length,
            "Memory erased"
        );
        routine_response(routine_id::ERASE_MEMORY, routine_status::COMPLETED, &[0x00])
    }

    fn activate_sbl(&self, params: &[u8]) -> Vec<u8> {
        let &[a0, a1, a2, a3] = params else {
            return negative_response(service_id::ROUTINE_CONTROL, nrc::INCORRECT_MESSAGE_LENGTH);
        };
        let call = u32::from_be_bytes([a0, a1, a2, a3]);
        if self.sbl_active() {
            return negative_response(service_id::ROUTINE_CONTROL, nrc::REQUEST_SEQUENCE_ERROR);
        }

        let loaded = self
            .memory
            .read()
            .range(..=call)
            .next_back()
            .is_some_and(|(start, data)| (call as u64) < *start as u64 + data.len() as u64);
        if !loaded {
            warn!(call = format!("0x{:08X}", call), "No SBL at call address");
            return routine_response(routine_id::ACTIVATE_SBL, routine_status::ABORTED, &[]);
        }

        self.sbl_active.store(true, Ordering::SeqCst);
        self.blocks_since_check.store(0, Ordering::SeqCst);
        info!(call = format!("0x{:08X}", call), "SBL activated");
        routine_response(routine_id::ACTIVATE_SBL, routine_status::COMPLETED, &[])
    }

    fn check_memory(&self) -> Vec<u8> {
        let blocks = self.blocks_since_check.swap(0, Ordering::SeqCst);
        let passed = blocks > 0 && !self.faults.read().fail_check_memory;
        info!(blocks, passed, "Check memory");
        routine_response(
            routine_id::CHECK_MEMORY,
            routine_status::COMPLETED,
            &[if passed { 0x00 } else { 0x01 }],
        )
    }

    fn complete_and_compatible(&self) -> Vec<u8> {
        let passed = self.sbl_active() && self.application_blocks.load(Ordering::SeqCst) > 0;
        info!(passed, "Complete and compatible check");
        routine_response(
            routine_id::COMPLETE_AND_COMPATIBLE,
            routine_status::COMPLETED,
            &[if passed { 0x00 } else { 0x01 }],
        )
    }

    fn handle_request_download(&self, request: &[u8]) -> Vec<u8> {
        if request.len() < 3 {
            return negative_response(service_id::REQUEST_DOWNLOAD, nrc::INCORRECT_MESSAGE_LENGTH);
        }
        if self.session() != session::PROGRAMMING {
            return negative_response(
                service_id::REQUEST_DOWNLOAD,
                nrc::SERVICE_NOT_SUPPORTED_IN_ACTIVE_SESSION,
            );
        }
        if self.unlocked_level().is_none() {
            debug!("Download denied: requires security access");
            return negative_response(service_id::REQUEST_DOWNLOAD, nrc::SECURITY_ACCESS_DENIED);
        }
        if self.download_in_progress() {
            debug!("Download denied: transfer already in progress");
            return negative_response(service_id::REQUEST_DOWNLOAD, nrc::CONDITIONS_NOT_CORRECT);
        }

        let data_format = request[1];
        if data_format != FORMAT_UNCOMPRESSED && data_format != FORMAT_LZSS {
            return negative_response(service_id::REQUEST_DOWNLOAD, nrc::REQUEST_OUT_OF_RANGE);
        }

        let size_len = (request[2] >> 4) as usize;
        let addr_len = (request[2] & 0x0F) as usize;
        if !(1..=4).contains(&size_len) || !(1..=4).contains(&addr_len) {
            return negative_response(service_id::REQUEST_DOWNLOAD, nrc::REQUEST_OUT_OF_RANGE);
        }
        if request.len() != 3 + addr_len + size_len {
            return negative_response(service_id::REQUEST_DOWNLOAD, nrc::INCORRECT_MESSAGE_LENGTH);
        }
        let address = be_value(&request[3..3 + addr_len]);
        let size = be_value(&request[3 + addr_len..]);
        if size == 0 {
            return negative_response(service_id::REQUEST_DOWNLOAD, nrc::REQUEST_OUT_OF_RANGE);
        }

        if self.sbl_active() {
            let inside = self
                .erased
                .read()
                .iter()
                .any(|range| range_contains(range, address, size));
            if !inside {
                warn!(
                    address = format!("0x{:08X}", address),
                    size,
                    "Download outside erased memory"
                );
                return negative_response(
                    service_id::REQUEST_DOWNLOAD,
                    nrc::UPLOAD_DOWNLOAD_NOT_ACCEPTED,
                );
            }
        }

        info!(
            address = format!("0x{:08X}", address),
            size,
            data_format = format!("0x{:02X}", data_format),
            "Download accepted"
        );
        *self.download_state.write() = Some(DownloadState {
            address,
            size,
            data_format,
            buffer: Vec::with_capacity(size as usize),
            expected_counter: 1,
        });

        let [hi, lo] = self.programming.max_block_length.to_be_bytes();
        positive_response(service_id::REQUEST_DOWNLOAD, &[0x20, hi, lo])
    }

    fn handle_transfer_data(&self, request: &[u8]) -> Vec<u8> {
        if request.len() < 3 || request.len() > self.programming.max_block_length as usize {
            return negative_response(service_id::TRANSFER_DATA, nrc::INCORRECT_MESSAGE_LENGTH);
        }
        let block_counter = request[1];
        let data = &request[2..];

        let mut download_state = self.download_state.write();
        let Some(state) = download_state.as_mut() else {
            debug!("TransferData denied: no active transfer");
            return negative_response(service_id::TRANSFER_DATA, nrc::REQUEST_SEQUENCE_ERROR);
        };

        if block_counter != state.expected_counter {
            debug!(
                expected = state.expected_counter,
                received = block_counter,
                "Wrong block sequence counter"
            );
            return negative_response(service_id::TRANSFER_DATA, nrc::WRONG_BLOCK_SEQUENCE_COUNTER);
        }
        if state.buffer.len() + data.len() > state.size as usize {
            debug!(
                received = state.buffer.len(),
                data_len = data.len(),
                total = state.size,
                "TransferData exceeds requested size"
            );
            return negative_response(service_id::TRANSFER_DATA, nrc::UPLOAD_DOWNLOAD_NOT_ACCEPTED);
        }

        state.buffer.extend_from_slice(data);
        state.expected_counter = state.expected_counter.wrapping_add(1);

        let echo = if self.faults.read().corrupt_transfer_echo {
            block_counter.wrapping_add(1)
        } else {
            block_counter
        };
        positive_response(service_id::TRANSFER_DATA, &[echo])
    }

    fn handle_request_transfer_exit(&self, _request: &[u8]) -> Vec<u8> {
        let Some(state) = self.download_state.write().take() else {
            return negative_response(
                service_id::REQUEST_TRANSFER_EXIT,
                nrc::REQUEST_SEQUENCE_ERROR,
            );
        };

        if state.buffer.len() != state.size as usize {
            warn!(
                expected = state.size,
                actual = state.buffer.len(),
                "Downloaded size differs from request"
            );
            return negative_response(
                service_id::REQUEST_TRANSFER_EXIT,
                nrc::GENERAL_PROGRAMMING_FAILURE,
            );
        }

        let decoded = match decode_block_data(&state.buffer, state.data_format) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(error = %e, "Downloaded data cannot be decoded");
                return negative_response(
                    service_id::REQUEST_TRANSFER_EXIT,
                    nrc::GENERAL_PROGRAMMING_FAILURE,
                );
            }
        };
        let crc = crc16(&decoded);
        info!(
            address = format!("0x{:08X}", state.address),
            bytes = decoded.len(),
            crc = format!("0x{:04X}", crc),
            "Block written"
        );
        self.memory.write().insert(state.address, decoded);
        self.blocks_since_check.fetch_add(1, Ordering::SeqCst);
        if self.sbl_active() {
            self.application_blocks.fetch_add(1, Ordering::SeqCst);
        }

        if self.programming.check_memory {
            positive_response(service_id::REQUEST_TRANSFER_EXIT, &[])
        } else {
            positive_response(service_id::REQUEST_TRANSFER_EXIT, &crc.to_be_bytes())
        }
    }
}

fn is_erase_request(request: &[u8]) -> bool {
    let [hi, lo] = routine_id::ERASE_MEMORY.to_be_bytes();
    request.starts_with(&[service_id::ROUTINE_CONTROL, 0x01, hi, lo])
}

fn random_seed() -> [u8; 3] {
    let mut rng = rand::thread_rng();
    loop {
        let seed: [u8; 3] = rng.gen();
        if seed != [0; 3] {
            return seed;
        }
    }
}

fn be_value(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32)
}

fn range_contains(range: &EraseRange, address: u32, size: u32) -> bool {
    let start = range.address as u64;
    let end = start + range.length as u64;
    address as u64 >= start && address as u64 + size as u64 <= end
}

fn security_error_nrc(error: &SecurityError) -> u8 {
    match error {
        SecurityError::InvalidLength { .. } => nrc::INCORRECT_MESSAGE_LENGTH,
        SecurityError::InvalidLevel(_) => nrc::SUB_FUNCTION_NOT_SUPPORTED,
        _ => nrc::REQUEST_OUT_OF_RANGE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ForcedNrc, SecurityLevelDef};
    use pretty_assertions::assert_eq;
    use sbl_security::{AuthKeys, ClientHandshake, DelayTimerConfig};
    use sbl_vbf::lzss;

    fn relaxed_config() -> EcuConfig {
        let mut config = EcuConfig::default();
        config.security.delay_timer = DelayTimerConfig::relaxed();
        config
    }

    fn ecu() -> SimulatedEcu {
        SimulatedEcu::new(&relaxed_config()).unwrap()
    }

    fn unlock(ecu: &SimulatedEcu) {
        ecu.set_fixed_seed(Some([0x1A, 0x2B, 0x3C]));
        assert_eq!(ecu.process_request(&[0x27, 0x01]), vec![0x67, 0x01, 0x1A, 0x2B, 0x3C]);
        assert_eq!(ecu.process_request(&[0x27, 0x02, 0x97, 0xFB, 0xDF]), vec![0x67, 0x02]);
    }

    fn programming_unlocked() -> SimulatedEcu {
        let ecu = ecu();
        ecu.process_request(&[0x10, 0x02]);
        unlock(&ecu);
        ecu
    }

    fn request_download(ecu: &SimulatedEcu, address: u32, format: u8, size: usize) -> Vec<u8> {
        let mut request = vec![0x34, format, 0x44];
        request.extend_from_slice(&address.to_be_bytes());
        request.extend_from_slice(&(size as u32).to_be_bytes());
        ecu.process_request(&request)
    }

    fn download(ecu: &SimulatedEcu, address: u32, format: u8, stored: &[u8]) -> Vec<u8> {
        assert_eq!(
            request_download(ecu, address, format, stored.len()),
            vec![0x74, 0x20, 0x02, 0x02]
        );

        for (i, chunk) in stored.chunks(0x200).enumerate() {
            let counter = (i + 1) as u8;
            let mut transfer = vec![0x36, counter];
            transfer.extend_from_slice(chunk);
            assert_eq!(ecu.process_request(&transfer), vec![0x76, counter]);
        }
        ecu.process_request(&[0x37])
    }

    fn activate_sbl(ecu: &SimulatedEcu) {
        let sbl = vec![0xA5; 64];
        download(ecu, 0x2000_0000, 0x00, &sbl);
        assert_eq!(
            ecu.process_request(&[0x31, 0x01, 0x03, 0x01, 0x20, 0x00, 0x00, 0x00]),
            vec![0x71, 0x01, 0x03, 0x01, 0x10]
        );
    }

    #[test]
    fn test_session_control_and_f186() {
        let ecu = ecu();
        assert_eq!(ecu.process_request(&[0x22, 0xF1, 0x86]), vec![0x62, 0xF1, 0x86, 0x01]);
        assert_eq!(
            ecu.process_request(&[0x10, 0x02]),
            vec![0x50, 0x02, 0x00, 0x19, 0x01, 0xF4]
        );
        assert_eq!(ecu.process_request(&[0x22, 0xF1, 0x86]), vec![0x62, 0xF1, 0x86, 0x02]);
        assert_eq!(ecu.process_request(&[0x10, 0x05]), vec![0x7F, 0x10, 0x12]);
    }

    #[test]
    fn test_tester_present() {
        let ecu = ecu();
        assert_eq!(ecu.process_request(&[0x3E, 0x00]), vec![0x7E, 0x00]);
        assert!(ecu.process_request(&[0x3E, 0x80]).is_empty());
        assert!(ecu.handle(&[0x3E, 0x80]).is_empty());
    }

    #[test]
    fn test_unknown_service() {
        assert_eq!(ecu().process_request(&[0x85, 0x01]), vec![0x7F, 0x85, 0x11]);
        assert_eq!(ecu().process_request(&[]), vec![0x7F, 0x00, 0x13]);
    }

    #[test]
    fn test_legacy_unlock_with_known_seed() {
        let ecu = ecu();
        unlock(&ecu);
        assert_eq!(ecu.unlocked_level(), Some(0x01));

        // already unlocked: zero seed
        assert_eq!(ecu.process_request(&[0x27, 0x01]), vec![0x67, 0x01, 0, 0, 0]);
    }

    #[test]
    fn test_session_change_relocks() {
        let ecu = ecu();
        unlock(&ecu);
        ecu.process_request(&[0x10, 0x02]);
        assert_eq!(ecu.unlocked_level(), None);
    }

    #[test]
    fn test_invalid_keys_arm_delay() {
        let ecu = ecu();
        ecu.set_fixed_seed(Some([0x1A, 0x2B, 0x3C]));

        ecu.process_request(&[0x27, 0x01]);
        assert_eq!(ecu.process_request(&[0x27, 0x02, 0, 0, 0]), vec![0x7F, 0x27, 0x35]);
        ecu.process_request(&[0x27, 0x01]);
        assert_eq!(ecu.process_request(&[0x27, 0x02, 0, 0, 0]), vec![0x7F, 0x27, 0x36]);
        assert!(matches!(
            ecu.delay_state(0x01),
            DelayTimerState::Delayed { false_attempts: 2, .. }
        ));
        assert_eq!(ecu.process_request(&[0x27, 0x01]), vec![0x7F, 0x27, 0x37]);
    }

    #[test]
    fn test_key_without_seed() {
        let ecu = ecu();
        assert_eq!(ecu.process_request(&[0x27, 0x02, 1, 2, 3]), vec![0x7F, 0x27, 0x24]);
        assert_eq!(ecu.process_request(&[0x27, 0x03]), vec![0x7F, 0x27, 0x12]);
        assert_eq!(ecu.process_request(&[0x27, 0x00]), vec![0x7F, 0x27, 0x12]);
    }

    #[test]
    fn test_boot_delay_refuses_seed() {
        let ecu = SimulatedEcu::new(&EcuConfig::default()).unwrap();
        assert_eq!(ecu.process_request(&[0x27, 0x01]), vec![0x7F, 0x27, 0x37]);
    }

    #[test]
    fn test_aes_level() {
        let keys = AuthKeys::new([0x11; 16], [0x22; 16]);
        let mut config = relaxed_config();
        config.security.levels.push(SecurityLevelDef {
            level: 0x05,
            algorithm: SecurityAlgorithm::Aes(keys.clone()),
        });
        let ecu = SimulatedEcu::new(&config).unwrap();

        let mut client = ClientHandshake::new(keys, 0x05).unwrap();
        let seed_response = ecu.process_request(&client.request_seed());
        assert_eq!(&seed_response[..2], &[0x67, 0x05]);
        let send_key = client.send_key(&seed_response).unwrap();
        assert_eq!(ecu.process_request(&send_key), vec![0x67, 0x06]);
        assert_eq!(ecu.unlocked_level(), Some(0x05));
    }

    #[test]
    fn test_aes_tampered_request() {
        let keys = AuthKeys::new([0x11; 16], [0x22; 16]);
        let mut config = relaxed_config();
        config.security.levels = vec![SecurityLevelDef {
            level: 0x05,
            algorithm: SecurityAlgorithm::Aes(keys.clone()),
        }];
        let ecu = SimulatedEcu::new(&config).unwrap();

        let mut request = ClientHandshake::new(keys, 0x05).unwrap().request_seed();
        request[10] ^= 0x01;
        assert_eq!(ecu.process_request(&request), vec![0x7F, 0x27, 0x31]);
    }

    #[test]
    fn test_download_requires_programming_and_security() {
        let ecu = ecu();
        let request = [0x34, 0x00, 0x44, 0, 0, 0x10, 0, 0, 0, 0, 0x10];
        assert_eq!(ecu.process_request(&request), vec![0x7F, 0x34, 0x7F]);
        ecu.process_request(&[0x10, 0x02]);
        assert_eq!(ecu.process_request(&request), vec![0x7F, 0x34, 0x33]);
    }

    #[test]
    fn test_block_download_returns_crc() {
        let ecu = programming_unlocked();
        let data = b"123456789".to_vec();
        assert_eq!(download(&ecu, 0x2000_0000, 0x00, &data), vec![0x77, 0x29, 0xB1]);
        assert_eq!(ecu.memory_at(0x2000_0000), Some(data));
        assert!(!ecu.download_in_progress());
    }

    #[test]
    fn test_compressed_download() {
        let ecu = programming_unlocked();
        let plain: Vec<u8> = b"ABCD".iter().cycle().take(1500).copied().collect();
        let packed = lzss::compress(&plain);
        let response = download(&ecu, 0x2000_0000, 0x10, &packed);
        assert_eq!(response, [vec![0x77], crc16(&plain).to_be_bytes().to_vec()].concat());
        assert_eq!(ecu.memory_at(0x2000_0000), Some(plain));
    }

    #[test]
    fn test_compressed_size_counts_stored_bytes() {
        let ecu = programming_unlocked();
        let plain = vec![0x00; 600];
        let packed = lzss::compress(&plain);
        assert!(packed.len() < plain.len());

        // Requesting the decompressed size leaves the transfer short
        request_download(&ecu, 0x2000_0000, 0x10, plain.len());
        let mut transfer = vec![0x36, 0x01];
        transfer.extend_from_slice(&packed);
        assert_eq!(ecu.process_request(&transfer), vec![0x76, 0x01]);
        assert_eq!(ecu.process_request(&[0x37]), vec![0x7F, 0x37, 0x72]);
        assert_eq!(ecu.memory_at(0x2000_0000), None);

        // More stored bytes than requested are refused outright
        request_download(&ecu, 0x2000_0000, 0x10, packed.len() - 1);
        assert_eq!(ecu.process_request(&transfer), vec![0x7F, 0x36, 0x70]);
    }

    #[test]
    fn test_wrong_counter() {
        let ecu = programming_unlocked();
        ecu.process_request(&[0x34, 0x00, 0x44, 0x20, 0, 0, 0, 0, 0, 0, 4]);
        assert_eq!(ecu.process_request(&[0x36, 0x02, 1, 2]), vec![0x7F, 0x36, 0x73]);
        assert_eq!(ecu.process_request(&[0x36, 0x01, 1, 2]), vec![0x76, 0x01]);
        assert_eq!(ecu.process_request(&[0x36, 0x02, 3, 4, 5]), vec![0x7F, 0x36, 0x70]);
    }

    #[test]
    fn test_short_transfer_fails_exit() {
        let ecu = programming_unlocked();
        ecu.process_request(&[0x34, 0x00, 0x44, 0x20, 0, 0, 0, 0, 0, 0, 4]);
        ecu.process_request(&[0x36, 0x01, 1, 2]);
        assert_eq!(ecu.process_request(&[0x37]), vec![0x7F, 0x37, 0x72]);
        assert_eq!(ecu.process_request(&[0x37]), vec![0x7F, 0x37, 0x24]);
    }

    #[test]
    fn test_erase_needs_sbl() {
        let ecu = programming_unlocked();
        let erase = [0x31, 0x01, 0xFF, 0x00, 0x44, 0, 0x08, 0, 0, 0, 0x02, 0, 0];
        assert_eq!(ecu.process_request(&erase), vec![0x7F, 0x31, 0x22]);

        activate_sbl(&ecu);
        assert!(ecu.sbl_active());
        assert_eq!(ecu.process_request(&erase), vec![0x71, 0x01, 0xFF, 0x00, 0x10, 0x00]);
        assert_eq!(
            ecu.erased_ranges(),
            vec![EraseRange {
                address: 0x0008_0000,
                length: 0x0002_0000
            }]
        );
    }

    #[test]
    fn test_activate_without_sbl_aborts() {
        let ecu = programming_unlocked();
        assert_eq!(
            ecu.process_request(&[0x31, 0x01, 0x03, 0x01, 0x20, 0x00, 0x00, 0x00]),
            vec![0x71, 0x01, 0x03, 0x01, 0x11]
        );
        assert!(!ecu.sbl_active());
    }

    #[test]
    fn test_application_must_land_in_erased_range() {
        let ecu = programming_unlocked();
        activate_sbl(&ecu);
        ecu.process_request(&[0x31, 0x01, 0xFF, 0x00, 0x44, 0, 0x08, 0, 0, 0, 0, 0x10, 0]);

        let outside = [0x34, 0x00, 0x44, 0, 0x09, 0, 0, 0, 0, 0, 0x10];
        assert_eq!(ecu.process_request(&outside), vec![0x7F, 0x34, 0x70]);

        // complete and compatible fails before any application block
        assert_eq!(
            ecu.process_request(&[0x31, 0x01, 0x02, 0x05]),
            vec![0x71, 0x01, 0x02, 0x05, 0x10, 0x01]
        );
        let app = vec![0x5A; 0x1000];
        download(&ecu, 0x0008_0000, 0x00, &app);
        assert_eq!(
            ecu.process_request(&[0x31, 0x01, 0x02, 0x05]),
            vec![0x71, 0x01, 0x02, 0x05, 0x10, 0x00]
        );
    }

    #[test]
    fn test_check_memory_capability() {
        let ecu = programming_unlocked();
        assert_eq!(ecu.process_request(&[0x31, 0x01, 0x02, 0x12]), vec![0x7F, 0x31, 0x31]);

        let mut config = relaxed_config();
        config.programming.check_memory = true;
        let ecu = SimulatedEcu::new(&config).unwrap();
        ecu.process_request(&[0x10, 0x02]);
        unlock(&ecu);
        let data = vec![1, 2, 3, 4];
        assert_eq!(download(&ecu, 0x2000_0000, 0x00, &data), vec![0x77]);
        assert_eq!(
            ecu.process_request(&[0x31, 0x01, 0x02, 0x12, 0xAB, 0xCD]),
            vec![0x71, 0x01, 0x02, 0x12, 0x10, 0x00]
        );
        // nothing downloaded since the last check
        assert_eq!(
            ecu.process_request(&[0x31, 0x01, 0x02, 0x12]),
            vec![0x71, 0x01, 0x02, 0x12, 0x10, 0x01]
        );
    }

    #[test]
    fn test_erase_response_pending() {
        let mut config = relaxed_config();
        config.programming.erase_pending_responses = 2;
        let ecu = SimulatedEcu::new(&config).unwrap();
        ecu.process_request(&[0x10, 0x02]);
        unlock(&ecu);
        activate_sbl(&ecu);

        let responses = ecu.handle(&[0x31, 0x01, 0xFF, 0x00, 0x44, 0, 0x08, 0, 0, 0, 0, 0x10, 0]);
        assert_eq!(
            responses,
            vec![
                vec![0x7F, 0x31, 0x78],
                vec![0x7F, 0x31, 0x78],
                vec![0x71, 0x01, 0xFF, 0x00, 0x10, 0x00],
            ]
        );
    }

    #[test]
    fn test_forced_nrc_and_corrupt_echo() {
        let ecu = programming_unlocked();
        ecu.set_faults(FaultConfig {
            negative_responses: vec![ForcedNrc {
                service: 0x11,
                nrc: 0x22,
            }],
            corrupt_transfer_echo: true,
            fail_check_memory: false,
        });
        assert_eq!(ecu.process_request(&[0x11, 0x01]), vec![0x7F, 0x11, 0x22]);

        ecu.process_request(&[0x34, 0x00, 0x44, 0x20, 0, 0, 0, 0, 0, 0, 2]);
        assert_eq!(ecu.process_request(&[0x36, 0x01, 1, 2]), vec![0x76, 0x02]);
    }

    #[test]
    fn test_reset_relocks_and_keeps_flash() {
        let ecu = programming_unlocked();
        let data = vec![7; 16];
        download(&ecu, 0x2000_0000, 0x00, &data);

        assert_eq!(ecu.process_request(&[0x11, 0x01]), vec![0x51, 0x01]);
        assert_eq!(ecu.session(), session::DEFAULT);
        assert_eq!(ecu.unlocked_level(), None);
        assert_eq!(ecu.memory_at(0x2000_0000), Some(data));
    }

    #[test]
    fn test_write_did() {
        let ecu = ecu();
        assert_eq!(ecu.process_request(&[0x2E, 0xF1, 0x99, 1, 2, 3, 4]), vec![0x7F, 0x2E, 0x33]);
        assert_eq!(ecu.process_request(&[0x2E, 0xF1, 0x90, 1]), vec![0x7F, 0x2E, 0x31]);
        unlock(&ecu);
        assert_eq!(ecu.process_request(&[0x2E, 0xF1, 0x99, 1, 2, 3, 4]), vec![0x6E, 0xF1, 0x99]);
        assert_eq!(
            ecu.process_request(&[0x22, 0xF1, 0x99]),
            vec![0x62, 0xF1, 0x99, 1, 2, 3, 4]
        );
    }

    #[test]
    fn test_even_level_rejected_in_config() {
        let mut config = relaxed_config();
        config.security.levels[0].level = 0x02;
        assert!(matches!(
            SimulatedEcu::new(&config),
            Err(SimError::Config(_))
        ));
    }
}

//! Secondary-bootloader download sequence
//!
//! ```text
//! DetectMode -> [ChangeToProgramming] -> SecurityAccess -> SblDownload
//!   -> SblActivate -> [EssDownload] -> ApplicationDownload
//!   -> CheckCompleteCompatible -> Done
//! ```
//!
//! The first failing step ends the run. Nothing resumes from the middle;
//! call [`SblOrchestrator::reset`] and run again.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use sbl_transport::PeriodicSender;
use sbl_vbf::{VbfCatalog, VbfFile};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{EcuSettings, FlashConfig, SecurityConfig};
use crate::error::{Result, UdsError};
use crate::security::{SecurityAccessEngine, SecurityVariant};
use crate::transfer::{BlockTransfer, DownloadSummary};
use crate::uds::{reset_type, routine_id, service_id, standard_did, DiagnosticSession, UdsService};

/// Functional TesterPresent with suppressed response, as a raw single frame
const TESTER_PRESENT_FRAME: [u8; 8] = [0x02, 0x3E, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SblStep {
    Idle,
    DetectMode,
    ChangeToProgramming,
    SecurityAccess,
    SblDownload,
    SblActivate,
    EssDownload,
    ApplicationDownload,
    CheckCompleteCompatible,
    Done,
}

impl fmt::Display for SblStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::DetectMode => "detect mode",
            Self::ChangeToProgramming => "change to programming session",
            Self::SecurityAccess => "security access",
            Self::SblDownload => "SBL download",
            Self::SblActivate => "SBL activation",
            Self::EssDownload => "ESS download",
            Self::ApplicationDownload => "application download",
            Self::CheckCompleteCompatible => "complete and compatible check",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// The step that ended a run and why
#[derive(Debug, Error)]
#[error("SBL sequence failed at {step}: {source}")]
pub struct SblFailure {
    pub step: SblStep,
    #[source]
    pub source: UdsError,
}

/// Progress shared with whoever displays it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SblProgress {
    pub step: SblStep,
    pub current_file: Option<String>,
    pub files_done: usize,
    pub files_total: usize,
    pub bytes_done: u64,
    pub bytes_total: u64,
}

impl Default for SblProgress {
    fn default() -> Self {
        Self {
            step: SblStep::Idle,
            current_file: None,
            files_done: 0,
            files_total: 0,
            bytes_done: 0,
            bytes_total: 0,
        }
    }
}

/// Outcome of a successful run
#[derive(Debug, Clone)]
pub struct SblReport {
    pub initial_session: DiagnosticSession,
    pub variant: SecurityVariant,
    pub files: Vec<(String, DownloadSummary)>,
    pub elapsed: Duration,
}

impl SblReport {
    pub fn total_bytes(&self) -> usize {
        self.files.iter().map(|(_, s)| s.bytes).sum()
    }
}

struct TesterPresent {
    sender: PeriodicSender,
    interval: Duration,
}

pub struct SblOrchestrator {
    uds: UdsService,
    transfer: BlockTransfer,
    security: SecurityAccessEngine,
    security_config: SecurityConfig,
    reset_after_flash: bool,
    tester_present: Option<TesterPresent>,
    step: SblStep,
    progress: Arc<RwLock<SblProgress>>,
}

impl SblOrchestrator {
    pub fn new(uds: UdsService, security_config: SecurityConfig, ecu: EcuSettings) -> Self {
        Self {
            transfer: BlockTransfer::new(uds.clone(), ecu.capability),
            security: SecurityAccessEngine::new(uds.clone(), security_config.delay()),
            uds,
            security_config,
            reset_after_flash: ecu.reset_after_flash,
            tester_present: None,
            step: SblStep::Idle,
            progress: Arc::new(RwLock::new(SblProgress::default())),
        }
    }

    pub fn from_config(uds: UdsService, config: &FlashConfig) -> Self {
        let uds = uds
            .with_timeout(config.timing.request_timeout())
            .with_pending_timeout(config.timing.pending_timeout());
        Self::new(uds, config.security.clone(), config.ecu.clone())
    }

    /// Keep the ECU in its session with a periodic functional TesterPresent
    pub fn with_tester_present(mut self, sender: PeriodicSender, interval: Duration) -> Self {
        self.tester_present = Some(TesterPresent { sender, interval });
        self
    }

    pub fn step(&self) -> SblStep {
        self.step
    }

    pub fn progress(&self) -> Arc<RwLock<SblProgress>> {
        self.progress.clone()
    }

    pub fn security(&self) -> &SecurityAccessEngine {
        &self.security
    }

    /// Back to `Idle` for a fresh run. Security counters survive.
    pub fn reset(&mut self) {
        self.step = SblStep::Idle;
        self.security.relock_all();
        *self.progress.write() = SblProgress::default();
    }

    /// Run the whole sequence against the files in `catalog`
    pub async fn run(&mut self, catalog: &VbfCatalog) -> std::result::Result<SblReport, SblFailure> {
        if self.step != SblStep::Idle {
            return Err(SblFailure {
                step: self.step,
                source: UdsError::ProtocolSequence(
                    "Sequence already ran; reset before running again".to_string(),
                ),
            });
        }

        let started = Instant::now();
        {
            let mut progress = self.progress.write();
            progress.files_total = catalog.sbl.iter().count() + catalog.ess.len() + catalog.application.len();
            progress.bytes_total = catalog
                .sbl
                .iter()
                .chain(&catalog.ess)
                .chain(&catalog.application)
                .map(|f| f.block_data().len() as u64)
                .sum();
        }

        self.start_tester_present().await;
        let result = self.run_steps(catalog).await;
        self.stop_tester_present().await;

        match result {
            Ok((initial_session, variant, files)) => {
                self.enter(SblStep::Done);
                let report = SblReport {
                    initial_session,
                    variant,
                    files,
                    elapsed: started.elapsed(),
                };
                info!(
                    files = report.files.len(),
                    bytes = report.total_bytes(),
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "SBL sequence complete"
                );
                Ok(report)
            }
            Err(source) => {
                error!(step = %self.step, error = %source, "SBL sequence aborted");
                Err(SblFailure {
                    step: self.step,
                    source,
                })
            }
        }
    }

    async fn run_steps(
        &mut self,
        catalog: &VbfCatalog,
    ) -> Result<(DiagnosticSession, SecurityVariant, Vec<(String, DownloadSummary)>)> {
        self.enter(SblStep::DetectMode);
        let [hi, lo] = standard_did::ACTIVE_DIAGNOSTIC_SESSION.to_be_bytes();
        let f186 = self.uds.request(&[service_id::READ_DATA_BY_ID, hi, lo]).await?;
        let initial_session = DiagnosticSession::from_f186_response(&f186)?;
        // The variant follows the mode the ECU was found in, not the
        // programming session entered below
        let variant = SecurityVariant::select(&f186)?;
        info!(session = %initial_session, %variant, "ECU mode detected");

        if initial_session != DiagnosticSession::Programming {
            self.enter(SblStep::ChangeToProgramming);
            self.uds
                .diagnostic_session_control(DiagnosticSession::Programming)
                .await?;
            self.security.relock_all();
        }

        self.enter(SblStep::SecurityAccess);
        let profile = self.security_config.profile(variant).clone();
        debug!(%variant, level = format!("0x{:02X}", profile.level), "Security variant selected");
        self.security.unlock(profile.level, &profile.algorithm).await?;

        let mut files = Vec::new();

        self.enter(SblStep::SblDownload);
        let sbl = catalog
            .sbl
            .as_ref()
            .ok_or_else(|| UdsError::Config("No SBL among the VBF files".to_string()))?;
        files.push(self.download(sbl).await?);

        self.enter(SblStep::SblActivate);
        let call = sbl.header().call.ok_or_else(|| {
            UdsError::Config(format!("SBL {} has no call address", sbl.name()))
        })?;
        info!(call = format!("0x{:08X}", call), "Activating SBL");
        self.uds
            .routine_control_start(routine_id::ACTIVATE_SBL, &call.to_be_bytes())
            .await?
            .ensure_completed()?;

        if !catalog.ess.is_empty() {
            self.enter(SblStep::EssDownload);
            for file in &catalog.ess {
                files.push(self.download(file).await?);
            }
        }

        self.enter(SblStep::ApplicationDownload);
        for file in &catalog.application {
            files.push(self.download(file).await?);
        }

        self.enter(SblStep::CheckCompleteCompatible);
        self.uds
            .routine_control_start(routine_id::COMPLETE_AND_COMPATIBLE, &[])
            .await?
            .ensure_passed()?;

        if self.reset_after_flash {
            info!("Resetting ECU");
            self.uds.ecu_reset(reset_type::HARD_RESET).await?;
            self.security.relock_all();
        }

        Ok((initial_session, variant, files))
    }

    async fn download(&mut self, file: &VbfFile) -> Result<(String, DownloadSummary)> {
        let name = file.name();
        self.progress.write().current_file = Some(name.clone());

        let summary = self.transfer.download_vbf(file).await?;

        let mut progress = self.progress.write();
        progress.files_done += 1;
        progress.bytes_done += file.block_data().len() as u64;
        progress.current_file = None;
        Ok((name, summary))
    }

    fn enter(&mut self, step: SblStep) {
        debug!(from = %self.step, to = %step, "SBL step");
        self.step = step;
        self.progress.write().step = step;
    }

    async fn start_tester_present(&self) {
        if let Some(tp) = &self.tester_present {
            if let Err(e) = tp.sender.start(TESTER_PRESENT_FRAME.to_vec(), tp.interval).await {
                warn!(error = %e, "Tester present not started");
            }
        }
    }

    async fn stop_tester_present(&self) {
        if let Some(tp) = &self.tester_present {
            if let Err(e) = tp.sender.stop().await {
                warn!(error = %e, "Tester present not stopped");
            }
        }
    }
}

//! RoutineControl responses

use std::fmt;

use crate::error::{Result, UdsError};

/// Routine info byte following the routine identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutineStatus {
    Completed,
    Aborted,
    Active,
    Other(u8),
}

impl From<u8> for RoutineStatus {
    fn from(value: u8) -> Self {
        match value {
            0x10 => Self::Completed,
            0x11 => Self::Aborted,
            0x12 => Self::Active,
            other => Self::Other(other),
        }
    }
}

impl From<RoutineStatus> for u8 {
    fn from(status: RoutineStatus) -> Self {
        match status {
            RoutineStatus::Completed => 0x10,
            RoutineStatus::Aborted => 0x11,
            RoutineStatus::Active => 0x12,
            RoutineStatus::Other(v) => v,
        }
    }
}

impl fmt::Display for RoutineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Aborted => write!(f, "aborted"),
            Self::Active => write!(f, "active"),
            Self::Other(v) => write!(f, "status 0x{:02X}", v),
        }
    }
}

/// `71 <sub> <rid_hi> <rid_lo> <info> <record...>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutineResult {
    pub routine_id: u16,
    pub status: RoutineStatus,
    pub record: Vec<u8>,
}

impl RoutineResult {
    pub fn parse(response: &[u8], routine_id: u16) -> Result<Self> {
        if response.len() < 5 {
            return Err(UdsError::InvalidResponse(format!(
                "Routine response too short: {}",
                hex::encode_upper(response)
            )));
        }
        let echoed = u16::from_be_bytes([response[2], response[3]]);
        if echoed != routine_id {
            return Err(UdsError::InvalidResponse(format!(
                "Routine response for 0x{:04X}, expected 0x{:04X}",
                echoed, routine_id
            )));
        }
        Ok(Self {
            routine_id,
            status: RoutineStatus::from(response[4]),
            record: response[5..].to_vec(),
        })
    }

    pub fn ensure_completed(&self) -> Result<()> {
        match self.status {
            RoutineStatus::Completed => Ok(()),
            status => Err(UdsError::RoutineFailed {
                routine_id: self.routine_id,
                status,
            }),
        }
    }

    /// Completed with a leading result byte of `0x00` (where present)
    pub fn ensure_passed(&self) -> Result<()> {
        self.ensure_completed()?;
        match self.record.first() {
            None | Some(0x00) => Ok(()),
            Some(other) => Err(UdsError::RoutineFailed {
                routine_id: self.routine_id,
                status: RoutineStatus::Other(*other),
            }),
        }
    }
}

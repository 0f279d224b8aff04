//! Common types for DIMSE operations

use serde::{Deserialize, Serialize};

/// DIMSE command codes carried in CommandField (0000,0100)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandField {
    CStoreRq,
    CStoreRsp,
    CGetRq,
    CGetRsp,
    CFindRq,
    CFindRsp,
    CMoveRq,
    CMoveRsp,
    CEchoRq,
    CEchoRsp,
    CCancelRq,
    /// Any code this engine has no name for (N-* services, private codes)
    Other(u16),
}

impl CommandField {
    pub fn from_code(code: u16) -> Self {
        match code {
            0x0001 => Self::CStoreRq,
            0x8001 => Self::CStoreRsp,
            0x0010 => Self::CGetRq,
            0x8010 => Self::CGetRsp,
            0x0020 => Self::CFindRq,
            0x8020 => Self::CFindRsp,
            0x0021 => Self::CMoveRq,
            0x8021 => Self::CMoveRsp,
            0x0030 => Self::CEchoRq,
            0x8030 => Self::CEchoRsp,
            0x0FFF => Self::CCancelRq,
            other => Self::Other(other),
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            Self::CStoreRq => 0x0001,
            Self::CStoreRsp => 0x8001,
            Self::CGetRq => 0x0010,
            Self::CGetRsp => 0x8010,
            Self::CFindRq => 0x0020,
            Self::CFindRsp => 0x8020,
            Self::CMoveRq => 0x0021,
            Self::CMoveRsp => 0x8021,
            Self::CEchoRq => 0x0030,
            Self::CEchoRsp => 0x8030,
            Self::CCancelRq => 0x0FFF,
            Self::Other(code) => *code,
        }
    }

    /// Response bit is set on every DIMSE response command
    pub fn is_response(&self) -> bool {
        self.code() & 0x8000 != 0
    }

    /// Response command paired with a request command
    pub fn response(&self) -> Option<Self> {
        match self {
            Self::CStoreRq => Some(Self::CStoreRsp),
            Self::CGetRq => Some(Self::CGetRsp),
            Self::CFindRq => Some(Self::CFindRsp),
            Self::CMoveRq => Some(Self::CMoveRsp),
            Self::CEchoRq => Some(Self::CEchoRsp),
            _ => None,
        }
    }
}

impl std::fmt::Display for CommandField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CStoreRq => write!(f, "C-STORE-RQ"),
            Self::CStoreRsp => write!(f, "C-STORE-RSP"),
            Self::CGetRq => write!(f, "C-GET-RQ"),
            Self::CGetRsp => write!(f, "C-GET-RSP"),
            Self::CFindRq => write!(f, "C-FIND-RQ"),
            Self::CFindRsp => write!(f, "C-FIND-RSP"),
            Self::CMoveRq => write!(f, "C-MOVE-RQ"),
            Self::CMoveRsp => write!(f, "C-MOVE-RSP"),
            Self::CEchoRq => write!(f, "C-ECHO-RQ"),
            Self::CEchoRsp => write!(f, "C-ECHO-RSP"),
            Self::CCancelRq => write!(f, "C-CANCEL-RQ"),
            Self::Other(code) => write!(f, "command 0x{:04X}", code),
        }
    }
}

/// DICOM query/retrieve levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryLevel {
    /// Patient level
    Patient,
    /// Study level
    Study,
    /// Series level
    Series,
    /// Image level
    Image,
}

/// Priority carried in (0000,0700)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    pub fn code(&self) -> u16 {
        match self {
            Priority::Medium => 0x0000,
            Priority::High => 0x0001,
            Priority::Low => 0x0002,
        }
    }

    pub fn from_code(code: u16) -> Self {
        match code {
            0x0001 => Priority::High,
            0x0002 => Priority::Low,
            _ => Priority::Medium,
        }
    }
}

/// DIMSE operation status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimseStatus {
    /// Operation completed successfully
    Success,
    /// Operation is pending (more responses to follow)
    Pending,
    /// Operation cancelled by user
    Cancel,
    /// Operation failed with error
    Failure(u16), // DICOM status code
    /// Warning occurred during operation
    Warning(u16), // DICOM status code
}

impl DimseStatus {
    /// Classify a raw status code as defined in PS3.7 Annex C
    pub fn from_code(code: u16) -> Self {
        match code {
            0x0000 => DimseStatus::Success,
            0xFF00 | 0xFF01 => DimseStatus::Pending,
            0xFE00 => DimseStatus::Cancel,
            0x0001 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => DimseStatus::Warning(code),
            other => DimseStatus::Failure(other),
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            DimseStatus::Success => 0x0000,
            DimseStatus::Pending => 0xFF00,
            DimseStatus::Cancel => 0xFE00,
            DimseStatus::Failure(code) | DimseStatus::Warning(code) => *code,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, DimseStatus::Pending)
    }

    /// Anything but pending ends a response stream
    pub fn is_final(&self) -> bool {
        !self.is_pending()
    }

    pub fn is_success(&self) -> bool {
        matches!(self, DimseStatus::Success | DimseStatus::Warning(_))
    }
}

impl std::fmt::Display for DimseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DimseStatus::Success => write!(f, "Success"),
            DimseStatus::Pending => write!(f, "Pending"),
            DimseStatus::Cancel => write!(f, "Cancel"),
            DimseStatus::Failure(code) => write!(f, "Failure(0x{:04X})", code),
            DimseStatus::Warning(code) => write!(f, "Warning(0x{:04X})", code),
        }
    }
}

impl std::fmt::Display for QueryLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryLevel::Patient => write!(f, "PATIENT"),
            QueryLevel::Study => write!(f, "STUDY"),
            QueryLevel::Series => write!(f, "SERIES"),
            QueryLevel::Image => write!(f, "IMAGE"),
        }
    }
}

impl std::str::FromStr for QueryLevel {
    type Err = crate::error::DimseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "PATIENT" => Ok(QueryLevel::Patient),
            "STUDY" => Ok(QueryLevel::Study),
            "SERIES" => Ok(QueryLevel::Series),
            "IMAGE" => Ok(QueryLevel::Image),
            _ => Err(crate::error::DimseError::config(format!(
                "Invalid query level: {}",
                s
            ))),
        }
    }
}

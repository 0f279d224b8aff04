//! Error types for DIMSE operations

use dicom_ul::association::Error as UlError;
use dicom_ul::pdu::Pdu;
use thiserror::Error;

use crate::negotiator::RejectReason;
use crate::types::CommandField;

/// Result type alias for DIMSE operations
pub type Result<T> = std::result::Result<T, DimseError>;

/// Error types that can occur during DIMSE operations
#[derive(Error, Debug)]
pub enum DimseError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("DICOM parsing error: {0}")]
    DicomParsing(String),

    #[error("DICOM object error: {0}")]
    DicomObject(String),

    #[error("DICOM UL error: {0}")]
    DicomUl(String),

    /// Inbound association refused by the local negotiator
    #[error("Association rejected: {0}")]
    Rejected(RejectReason),

    /// Outbound association refused by the peer
    #[error("Association rejected by peer: {0}")]
    AssociationRejected(String),

    #[error("Association aborted by peer")]
    Aborted,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unsupported DIMSE command: {0}")]
    UnsupportedCommand(CommandField),

    #[error("Presentation context {0} was not negotiated")]
    UnknownPresentationContext(u8),

    #[error("A handler for {0} is already registered")]
    DuplicateHandler(CommandField),

    #[error("Listener already started")]
    AlreadyStarted,

    #[error("DIMSE operation failed: {0}")]
    OperationFailed(String),

    #[error("Invalid AE Title: {0}")]
    InvalidAeTitle(String),

    #[error("Timeout occurred: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DimseError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new operation failed error
    pub fn operation_failed(msg: impl Into<String>) -> Self {
        Self::OperationFailed(msg.into())
    }

    /// Create a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DimseError::Network(_) | DimseError::Timeout(_) | DimseError::AssociationRejected(_)
        )
    }

    /// Errors that end the association they occurred on
    pub fn is_fatal_to_association(&self) -> bool {
        matches!(
            self,
            DimseError::Network(_)
                | DimseError::DicomUl(_)
                | DimseError::Aborted
                | DimseError::Protocol(_)
                | DimseError::UnsupportedCommand(_)
                | DimseError::UnknownPresentationContext(_)
                | DimseError::Timeout(_)
        )
    }
}

impl From<UlError> for DimseError {
    fn from(error: UlError) -> Self {
        match error {
            UlError::Rejected { association_rj, .. } => DimseError::AssociationRejected(format!(
                "{:?} rejection, {}",
                association_rj.result, association_rj.source
            )),
            UlError::NoAcceptedPresentationContexts { .. } => DimseError::AssociationRejected(
                "no proposed presentation context was accepted".to_string(),
            ),
            UlError::Aborted { .. } => DimseError::Aborted,
            UlError::UnexpectedPdu { pdu, .. } if matches!(*pdu, Pdu::AbortRQ { .. }) => DimseError::Aborted,
            UlError::Connect { source, .. }
            | UlError::WireSend { source, .. }
            | UlError::WireRead { source, .. } => DimseError::Network(source),
            UlError::ConnectionClosed => DimseError::Network(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed by peer",
            )),
            UlError::Timeout { .. } => DimseError::Timeout("DICOM upper layer operation".to_string()),
            other => DimseError::DicomUl(other.to_string()),
        }
    }
}

//! DIMSE Status Code Mapping
//!
//! Converts collaborator failures into DICOM DIMSE status codes (PS3.4, PS3.7 Annex C).
//!
//! # Status Code Mapping
//!
//! - `0x0000`: Success
//! - `0xA700`: Out of resources
//! - `0xA900`: Identifier or dataset does not match SOP class
//! - `0xC000`: Unable to process
//! - `0xFE00`: Cancel
//! - `0xFF00`: Pending (C-FIND, C-MOVE)

use crate::provider::{ProviderError, SinkError};
use crate::types::DimseStatus;

pub const OUT_OF_RESOURCES: u16 = 0xA700;
pub const IDENTIFIER_DOES_NOT_MATCH: u16 = 0xA900;
pub const UNABLE_TO_PROCESS: u16 = 0xC000;
/// Refused: SOP class not supported
pub const SOP_CLASS_NOT_SUPPORTED: u16 = 0x0122;

/// Maps MatchProvider failures to C-FIND failure statuses
pub fn provider_error_to_dimse(error: &ProviderError) -> DimseStatus {
    match error {
        ProviderError::InvalidIdentifier(_) => DimseStatus::Failure(IDENTIFIER_DOES_NOT_MATCH),
        ProviderError::UnsupportedModel(_) => DimseStatus::Failure(SOP_CLASS_NOT_SUPPORTED),
        ProviderError::OutOfResources(_) => DimseStatus::Failure(OUT_OF_RESOURCES),
        ProviderError::Failed(_) => DimseStatus::Failure(UNABLE_TO_PROCESS),
    }
}

/// Maps RetrieveSink failures to C-STORE failure statuses
pub fn sink_error_to_dimse(error: &SinkError) -> DimseStatus {
    match error {
        SinkError::DatasetMismatch(_) => DimseStatus::Failure(IDENTIFIER_DOES_NOT_MATCH),
        SinkError::OutOfResources(_) => DimseStatus::Failure(OUT_OF_RESOURCES),
        SinkError::Io(e) if e.kind() == std::io::ErrorKind::StorageFull => {
            DimseStatus::Failure(OUT_OF_RESOURCES)
        }
        SinkError::Io(_) | SinkError::Failed(_) => DimseStatus::Failure(UNABLE_TO_PROCESS),
    }
}

/// Check if a status indicates success (including warnings)
pub fn is_successful_status(status: &DimseStatus) -> bool {
    matches!(status, DimseStatus::Success | DimseStatus::Warning(_))
}

/// Check if a status indicates a retriable error
pub fn is_retriable_status(status: &DimseStatus) -> bool {
    match status {
        DimseStatus::Failure(code) => matches!(*code, 0xA700..=0xA7FF),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_errors() {
        assert_eq!(
            provider_error_to_dimse(&ProviderError::InvalidIdentifier("no level".into())),
            DimseStatus::Failure(0xA900)
        );
        assert_eq!(
            provider_error_to_dimse(&ProviderError::OutOfResources("busy".into())),
            DimseStatus::Failure(0xA700)
        );
        assert_eq!(
            provider_error_to_dimse(&ProviderError::Failed("index gone".into())),
            DimseStatus::Failure(0xC000)
        );
    }

    #[test]
    fn test_sink_errors() {
        let full = std::io::Error::new(std::io::ErrorKind::StorageFull, "disk full");
        assert_eq!(sink_error_to_dimse(&SinkError::Io(full)), DimseStatus::Failure(0xA700));

        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(sink_error_to_dimse(&SinkError::Io(denied)), DimseStatus::Failure(0xC000));

        assert_eq!(
            sink_error_to_dimse(&SinkError::DatasetMismatch("no SOP instance".into())),
            DimseStatus::Failure(0xA900)
        );
    }

    #[test]
    fn test_is_successful_status() {
        assert!(is_successful_status(&DimseStatus::Success));
        assert!(is_successful_status(&DimseStatus::Warning(0xB000)));
        assert!(!is_successful_status(&DimseStatus::Failure(0xC000)));
        assert!(!is_successful_status(&DimseStatus::Pending));
    }

    #[test]
    fn test_is_retriable_status() {
        assert!(is_retriable_status(&DimseStatus::Failure(0xA700)));
        assert!(is_retriable_status(&DimseStatus::Failure(0xA702)));
        assert!(!is_retriable_status(&DimseStatus::Failure(0xC000)));
        assert!(!is_retriable_status(&DimseStatus::Success));
    }
}

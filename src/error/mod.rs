/// Error types for the sanitization pipeline
///
/// Every failure a job can hit is a `WipeError`. Errors never cross job
/// boundaries: the pipeline attaches them to the failing job's log as an
/// `ErrorKind` plus message, so sibling jobs keep running.
///
/// Recovery policy per kind:
///
/// ```text
/// EnumerationError         fatal to starting jobs, caller may retry enumerate()
/// CapabilityMismatchError  recovered by the selector's fallback method
/// PreCheckFailure          retried up to the configured bound, then surfaced
/// ExecutionFailure         fatal to the job, never retried
/// VerificationFailure      job failed, log retained, no certificate
/// SigningError             job stays done but uncertified; issuance can be retried
/// ```
pub mod retry;

pub use retry::{ExponentialBackoff, RetryStrategy};

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WipeError {
    #[error("Device inventory unreachable: {0}")]
    Enumeration(String),

    #[error("No decodable transport for {device}: {detail}")]
    CapabilityMismatch { device: String, detail: String },

    #[error("Pre-check failed after {attempts} attempt(s): {reason}")]
    PreCheck { attempts: u32, reason: String },

    #[error("Sanitization failed: {0}")]
    Execution(String),

    #[error("Verification failed: {0}")]
    Verification(String),

    #[error("Certificate signing failed: {0}")]
    Signing(String),

    #[error("Job {job_id} is {state}; certificates are only issued for done jobs")]
    NotCertifiable { job_id: String, state: String },

    #[error("Device {0} already has an active job")]
    DeviceBusy(String),

    #[error("Destructive operation already started; the job can no longer be aborted")]
    NotAbortable,

    #[error("Job cancelled before sanitization started")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Audit sink error: {0}")]
    Audit(String),
}

impl From<std::io::Error> for WipeError {
    fn from(err: std::io::Error) -> Self {
        WipeError::Io(err.to_string())
    }
}

impl WipeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WipeError::Enumeration(_) => ErrorKind::EnumerationError,
            WipeError::CapabilityMismatch { .. } => ErrorKind::CapabilityMismatchError,
            WipeError::PreCheck { .. } => ErrorKind::PreCheckFailure,
            WipeError::Execution(_) => ErrorKind::ExecutionFailure,
            WipeError::Verification(_) => ErrorKind::VerificationFailure,
            WipeError::Signing(_) => ErrorKind::SigningError,
            WipeError::NotCertifiable { .. } => ErrorKind::NotCertifiable,
            WipeError::DeviceBusy(_) => ErrorKind::DeviceBusy,
            WipeError::NotAbortable => ErrorKind::NotAbortable,
            WipeError::Cancelled => ErrorKind::Cancelled,
            WipeError::Io(_) => ErrorKind::IoError,
            WipeError::Config(_) => ErrorKind::ConfigError,
            WipeError::Audit(_) => ErrorKind::AuditError,
        }
    }

    /// Whether a retry strategy may try the failed step again
    pub fn allows_retry(&self) -> bool {
        !matches!(
            self,
            WipeError::Cancelled
                | WipeError::NotAbortable
                | WipeError::DeviceBusy(_)
                | WipeError::Config(_)
        )
    }
}

pub type WipeResult<T> = Result<T, WipeError>;

/// Serializable error classification carried in job log entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    EnumerationError,
    CapabilityMismatchError,
    PreCheckFailure,
    ExecutionFailure,
    VerificationFailure,
    SigningError,
    NotCertifiable,
    DeviceBusy,
    NotAbortable,
    Cancelled,
    IoError,
    ConfigError,
    AuditError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(
            WipeError::Enumeration("gone".into()).kind(),
            ErrorKind::EnumerationError
        );
        assert_eq!(
            WipeError::PreCheck {
                attempts: 3,
                reason: "frozen".into()
            }
            .kind(),
            ErrorKind::PreCheckFailure
        );
        assert_eq!(
            WipeError::Verification("residual data".into()).kind(),
            ErrorKind::VerificationFailure
        );
        assert_eq!(WipeError::NotAbortable.kind(), ErrorKind::NotAbortable);
    }

    #[test]
    fn test_pre_check_message_includes_attempts() {
        let err = WipeError::PreCheck {
            attempts: 3,
            reason: "drive is security frozen".into(),
        };
        let message = err.to_string();
        assert!(message.contains("3 attempt(s)"));
        assert!(message.contains("security frozen"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: WipeError = io.into();
        assert_eq!(err.kind(), ErrorKind::IoError);
        assert!(err.to_string().contains("denied"));
    }

    #[test]
    fn test_allows_retry() {
        assert!(WipeError::Io("busy".into()).allows_retry());
        assert!(WipeError::Execution("power".into()).allows_retry());
        assert!(!WipeError::Cancelled.allows_retry());
        assert!(!WipeError::DeviceBusy("sda".into()).allows_retry());
    }

    #[test]
    fn test_error_kind_display() {
        assert_eq!(
            ErrorKind::VerificationFailure.to_string(),
            "VerificationFailure"
        );
    }
}

use thiserror::Error;

/// Failure taxonomy for the acquisition pipeline.
///
/// Only `InvalidConfiguration` is fatal; it is rejected before any network
/// activity begins. Every other condition is folded into the relevant
/// attempt or result record and surfaced through the diagnostic report.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("no route to endpoint: {0}")]
    Unreachable(String),

    #[error("operation requires elevated privileges: {0}")]
    PermissionDenied(String),

    #[error("port already has a live binder: {0}")]
    PortInUse(u16),

    #[error("operation timed out after {0} ms")]
    Timeout(u64),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("classification ambiguous: {0}")]
    ClassificationAmbiguous(String),

    #[error("capture tool unavailable: {0}")]
    SubprocessUnavailable(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

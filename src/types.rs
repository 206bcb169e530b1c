use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use ::time::{format_description::well_known, OffsetDateTime};

/// A network destination or source: address plus UDP/TCP port.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub address: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self { address, port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// One concrete strategy for obtaining an inbound datagram or packet.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MethodKind {
    /// Bind a reuse-enabled UDP socket on the target port and wait for a datagram.
    BindListen,
    /// Connect a UDP socket to the device, optionally send a greeting, wait for a reply.
    ConnectMode,
    /// Raw IPv4 socket observing all UDP traffic, filtered by destination port (needs root).
    RawCapture,
    /// Bounded tcpdump subprocess, output pattern-matched for the target port.
    ExternalCaptureTool,
}

impl fmt::Display for MethodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MethodKind::BindListen => "bind-listen",
            MethodKind::ConnectMode => "connect-mode",
            MethodKind::RawCapture => "raw-capture",
            MethodKind::ExternalCaptureTool => "external-capture-tool",
        };
        f.write_str(name)
    }
}

/// Immutable per-run description of one acquisition method.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub method: MethodKind,
    /// Lower value runs earlier.
    pub priority: u8,
    pub timeout_ms: u64,
    pub requires_elevated_privilege: bool,
}

impl MethodDescriptor {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Outcome of a single capture attempt.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CaptureOutcome {
    Success,
    Timeout,
    PermissionDenied,
    PortInUse,
    SubprocessUnavailable,
    Error,
}

impl fmt::Display for CaptureOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CaptureOutcome::Success => "success",
            CaptureOutcome::Timeout => "timeout",
            CaptureOutcome::PermissionDenied => "permission-denied",
            CaptureOutcome::PortInUse => "port-in-use",
            CaptureOutcome::SubprocessUnavailable => "subprocess-unavailable",
            CaptureOutcome::Error => "error",
        };
        f.write_str(name)
    }
}

/// Record of one method invocation against one endpoint. Written once, never mutated.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CaptureAttempt {
    pub method: MethodKind,
    pub endpoint: Endpoint,
    pub started_at: String,
    pub duration_ms: u64,
    pub outcome: CaptureOutcome,
    /// Captured bytes; empty for failures and for tool-only (weak) successes.
    pub payload: Vec<u8>,
    pub error_detail: Option<String>,
}

/// Why the classifier did or did not match a buffer.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClassifyReason {
    SignatureMatch,
    SizeHeuristic,
    NoMatch,
}

/// Heuristic judgement over a captured buffer. Never a conformance guarantee.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub matched: bool,
    pub reason: ClassifyReason,
    pub confidence_note: String,
}

/// Record of one control command sent to the device, response or not.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub command: Vec<u8>,
    pub endpoint: Endpoint,
    pub responded: bool,
    pub response_payload: Option<Vec<u8>>,
}

/// Operator-facing recommendation derived from which stage failed.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Remediation {
    CheckPowerAndCabling,
    ReachableButSilent,
    UnexpectedProtocol,
    None,
}

impl fmt::Display for Remediation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Remediation::CheckPowerAndCabling => "check power/cabling/network",
            Remediation::ReachableButSilent => {
                "reachable but silent: check device activation/mode"
            }
            Remediation::UnexpectedProtocol => {
                "unexpected protocol: verify port/device identity"
            }
            Remediation::None => "none",
        };
        f.write_str(text)
    }
}

/// Aggregate result of one diagnostic run.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct DiagnosticResult {
    pub endpoints: Vec<Endpoint>,
    pub attempts: Vec<CaptureAttempt>,
    pub classifications: Vec<Classification>,
    pub command_results: Vec<CommandResult>,
    pub overall_success: bool,
    pub remediation: Option<Remediation>,
    pub attempts_by_method: BTreeMap<String, u64>,
    pub attempts_by_endpoint: BTreeMap<String, u64>,
}

/// RFC3339 UTC timestamp for attempt records.
pub fn now_rfc3339() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

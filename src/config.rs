use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::classify::ClassifierConfig;
use crate::error::ProbeError;
use crate::types::{MethodDescriptor, MethodKind};

/// Settings for the external packet-capture subprocess.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct CaptureToolConfig {
    /// Program name or path; looked up on PATH when not absolute.
    pub program: String,
    /// Capture interface passed to the tool.
    pub interface: String,
    /// Stop after this many captured packets.
    pub packet_cap: u32,
}

impl Default for CaptureToolConfig {
    fn default() -> Self {
        Self {
            program: "tcpdump".to_string(),
            interface: "any".to_string(),
            packet_cap: 10,
        }
    }
}

/// Complete configuration for one diagnostic run.
///
/// Every address, port, timeout, and command byte sequence lives here; the
/// pipeline itself holds no hidden defaults. Command byte layouts are
/// firmware specific and are deliberately data, not code.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ProbeConfig {
    /// Candidate device addresses to probe directly.
    pub candidates: Vec<IpAddr>,
    /// Also derive candidates from local interface subnets (conventional
    /// sensor host numbers in each local /24).
    pub derive_from_interfaces: bool,
    /// Probe every host of each local /24 instead of just the conventional ones.
    pub sweep_local: bool,

    /// Port the sensor streams data to.
    pub data_port: u16,
    /// Device control port; also used for the TCP liveness probe.
    pub control_port: u16,
    /// Port the discovery datagram is broadcast to.
    pub discovery_port: u16,
    pub broadcast_addresses: Vec<Ipv4Addr>,
    /// Discovery datagram payload; firmware specific.
    pub discovery_probe: Vec<u8>,

    pub probe_timeout_ms: u64,
    pub probe_concurrency: usize,
    pub discovery_wait_ms: u64,

    /// Acquisition methods in priority order.
    pub methods: Vec<MethodDescriptor>,
    /// Optional payload sent after connecting in connect-mode.
    pub greeting: Option<Vec<u8>>,
    pub capture_tool: CaptureToolConfig,

    /// Wall-clock bound for the whole capture stage, retries included.
    pub global_deadline_ms: u64,
    /// Pause between ladder rounds while the deadline allows retries.
    pub retry_pause_ms: u64,
    /// Run every method for diagnostic completeness instead of stopping
    /// at the first success.
    pub exhaustive: bool,

    pub classifier: ClassifierConfig,

    /// Activation commands fired at the control port before capture.
    pub commands: Vec<Vec<u8>>,
    pub command_response_wait_ms: u64,
    pub command_gap_ms: u64,
    pub send_activation: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            // Factory-default device addresses plus the variants seen on
            // robot-mounted installations.
            candidates: vec![
                IpAddr::V4(Ipv4Addr::new(192, 168, 1, 201)),
                IpAddr::V4(Ipv4Addr::new(192, 168, 123, 201)),
                IpAddr::V4(Ipv4Addr::new(192, 168, 0, 201)),
                IpAddr::V4(Ipv4Addr::new(10, 5, 5, 200)),
            ],
            derive_from_interfaces: true,
            sweep_local: false,
            data_port: 2368,
            control_port: 9347,
            discovery_port: 9347,
            broadcast_addresses: vec![
                Ipv4Addr::new(255, 255, 255, 255),
                Ipv4Addr::new(192, 168, 1, 255),
                Ipv4Addr::new(192, 168, 123, 255),
                Ipv4Addr::new(192, 168, 0, 255),
            ],
            discovery_probe: vec![0x47, 0x74, 0x00, 0xFF, 0x00, 0x00, 0x00, 0x00],
            probe_timeout_ms: 2_000,
            probe_concurrency: 64,
            discovery_wait_ms: 3_000,
            methods: default_methods(),
            greeting: None,
            capture_tool: CaptureToolConfig::default(),
            global_deadline_ms: 30_000,
            retry_pause_ms: 2_000,
            exhaustive: false,
            classifier: ClassifierConfig::default(),
            commands: default_commands(),
            command_response_wait_ms: 1_000,
            command_gap_ms: 500,
            send_activation: false,
        }
    }
}

/// Default method ladder: cheapest and least privileged first.
pub fn default_methods() -> Vec<MethodDescriptor> {
    vec![
        MethodDescriptor {
            method: MethodKind::BindListen,
            priority: 1,
            timeout_ms: 5_000,
            requires_elevated_privilege: false,
        },
        MethodDescriptor {
            method: MethodKind::ConnectMode,
            priority: 2,
            timeout_ms: 5_000,
            requires_elevated_privilege: false,
        },
        MethodDescriptor {
            method: MethodKind::RawCapture,
            priority: 3,
            timeout_ms: 10_000,
            requires_elevated_privilege: true,
        },
        MethodDescriptor {
            method: MethodKind::ExternalCaptureTool,
            priority: 4,
            timeout_ms: 12_000,
            requires_elevated_privilege: false,
        },
    ]
}

/// Conventional activation sequence: start spin, set return mode, start
/// data transmission. Exact layouts vary by firmware and must be confirmed
/// against vendor documentation.
pub fn default_commands() -> Vec<Vec<u8>> {
    vec![
        vec![0x47, 0x74, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00],
        vec![0x47, 0x74, 0x00, 0x02, 0x39, 0x00, 0x00, 0x00],
        vec![0x47, 0x74, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00],
    ]
}

impl ProbeConfig {
    /// Load a configuration from a JSON file, filling absent fields with defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config file: {}", path.as_ref().display()))?;
        let cfg: ProbeConfig = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.as_ref().display()))?;
        Ok(cfg)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn discovery_wait(&self) -> Duration {
        Duration::from_millis(self.discovery_wait_ms)
    }

    pub fn global_deadline(&self) -> Duration {
        Duration::from_millis(self.global_deadline_ms)
    }

    pub fn retry_pause(&self) -> Duration {
        Duration::from_millis(self.retry_pause_ms)
    }

    pub fn command_response_wait(&self) -> Duration {
        Duration::from_millis(self.command_response_wait_ms)
    }

    pub fn command_gap(&self) -> Duration {
        Duration::from_millis(self.command_gap_ms)
    }

    /// Reject configurations that cannot produce a meaningful run.
    /// This is the only fatal error path; it fires before any socket is opened.
    pub fn validate(&self) -> Result<(), ProbeError> {
        if self.candidates.is_empty() && !self.derive_from_interfaces {
            return Err(ProbeError::InvalidConfiguration(
                "candidate list is empty and interface derivation is disabled".into(),
            ));
        }
        if self.methods.is_empty() {
            return Err(ProbeError::InvalidConfiguration(
                "method list is empty".into(),
            ));
        }
        if self.probe_timeout_ms == 0 {
            return Err(ProbeError::InvalidConfiguration(
                "probe timeout must be positive".into(),
            ));
        }
        if let Some(m) = self.methods.iter().find(|m| m.timeout_ms == 0) {
            return Err(ProbeError::InvalidConfiguration(format!(
                "method {} has a non-positive timeout",
                m.method
            )));
        }
        if self.global_deadline_ms == 0 {
            return Err(ProbeError::InvalidConfiguration(
                "global deadline must be positive".into(),
            ));
        }
        if self.data_port == 0 || self.control_port == 0 || self.discovery_port == 0 {
            return Err(ProbeError::InvalidConfiguration(
                "ports must be nonzero".into(),
            ));
        }
        if self.probe_concurrency == 0 {
            return Err(ProbeError::InvalidConfiguration(
                "probe concurrency must be positive".into(),
            ));
        }
        Ok(())
    }
}

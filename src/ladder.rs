use std::collections::HashSet;
use std::io;
use std::mem::MaybeUninit;
use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::{Mutex as StdMutex, OnceLock};
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::CaptureToolConfig;
use crate::types::{
    now_rfc3339, CaptureAttempt, CaptureOutcome, Endpoint, MethodDescriptor, MethodKind,
};

/// Per-run knobs shared by every method in the ladder.
#[derive(Debug, Clone)]
pub struct LadderOptions {
    /// Run every method for diagnostic completeness instead of stopping at
    /// the first success.
    pub exhaustive: bool,
    /// Optional payload transmitted after connecting in connect-mode.
    pub greeting: Option<Vec<u8>>,
    pub capture_tool: CaptureToolConfig,
}

/// Result of one ladder invocation: every attempt made, in order, and the
/// index of the first chronological success if there was one.
#[derive(Debug, Clone)]
pub struct LadderRun {
    pub attempts: Vec<CaptureAttempt>,
    pub winner: Option<usize>,
}

impl LadderRun {
    pub fn succeeded(&self) -> bool {
        self.winner.is_some()
    }
}

type MethodResult = (CaptureOutcome, Vec<u8>, Option<String>);

/// Try the configured acquisition methods against one endpoint, strictly in
/// priority order.
///
/// Every method invocation becomes one `CaptureAttempt` regardless of
/// outcome, and no method error escapes the ladder. With exhaustive mode
/// off the ladder returns at the first success; with it on, the remaining
/// methods still run and the first success stays the flagged winner.
///
/// The ladder performs no retries; callers wrap it in a deadline-bounded
/// retry loop when they want more than one round.
pub async fn run_ladder(
    endpoint: Endpoint,
    methods: &[MethodDescriptor],
    opts: &LadderOptions,
    cancel: &CancellationToken,
) -> LadderRun {
    let mut ordered: Vec<MethodDescriptor> = methods.to_vec();
    ordered.sort_by_key(|m| m.priority);

    let mut attempts: Vec<CaptureAttempt> = Vec::new();
    let mut winner: Option<usize> = None;

    for desc in &ordered {
        if cancel.is_cancelled() {
            break;
        }

        debug!("trying {} against {}", desc.method, endpoint);
        let started_at = now_rfc3339();
        let start = Instant::now();
        let (outcome, payload, error_detail) = match desc.method {
            MethodKind::BindListen => bind_listen(endpoint.port, desc.timeout()).await,
            MethodKind::ConnectMode => {
                connect_mode(endpoint, opts.greeting.as_deref(), desc.timeout()).await
            }
            MethodKind::RawCapture => {
                raw_capture(endpoint.port, desc.timeout(), cancel.clone()).await
            }
            MethodKind::ExternalCaptureTool => {
                external_capture_tool(endpoint.port, &opts.capture_tool, desc.timeout()).await
            }
        };

        let attempt = CaptureAttempt {
            method: desc.method,
            endpoint,
            started_at,
            duration_ms: start.elapsed().as_millis() as u64,
            outcome,
            payload,
            error_detail,
        };
        let succeeded = attempt.outcome == CaptureOutcome::Success;
        debug!(
            "{} against {} finished: {} in {} ms",
            desc.method, endpoint, attempt.outcome, attempt.duration_ms
        );
        attempts.push(attempt);

        if succeeded {
            if winner.is_none() {
                winner = Some(attempts.len() - 1);
            }
            if !opts.exhaustive {
                break;
            }
        }
    }

    LadderRun { attempts, winner }
}

// One live binder per well-known port per process. The OS enforces the
// per-host constraint; this registry makes the in-process case a clean
// `PortInUse` instead of racing on kernel semantics.
static LIVE_BINDERS: OnceLock<StdMutex<HashSet<u16>>> = OnceLock::new();

struct BinderClaim(u16);

fn claim_port(port: u16) -> Option<BinderClaim> {
    let registry = LIVE_BINDERS.get_or_init(|| StdMutex::new(HashSet::new()));
    let mut live = registry.lock().expect("binder registry lock");
    live.insert(port).then(|| BinderClaim(port))
}

impl Drop for BinderClaim {
    fn drop(&mut self) {
        if let Some(registry) = LIVE_BINDERS.get() {
            if let Ok(mut live) = registry.lock() {
                live.remove(&self.0);
            }
        }
    }
}

/// Bind a reuse-enabled UDP socket to the wildcard address on the target
/// port and wait for the first datagram.
async fn bind_listen(port: u16, timeout: Duration) -> MethodResult {
    let _claim = match claim_port(port) {
        Some(c) => c,
        None => {
            return (
                CaptureOutcome::PortInUse,
                Vec::new(),
                Some(format!("port {port} already has a live binder in this process")),
            )
        }
    };

    let socket = match Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)) {
        Ok(s) => s,
        Err(e) => {
            return (
                CaptureOutcome::Error,
                Vec::new(),
                Some(format!("socket creation failed: {e}")),
            )
        }
    };
    if let Err(e) = socket.set_reuse_address(true) {
        return (
            CaptureOutcome::Error,
            Vec::new(),
            Some(format!("enabling address reuse failed: {e}")),
        );
    }
    let bind_addr: SocketAddr = SocketAddr::from(([0, 0, 0, 0], port));
    if let Err(e) = socket.bind(&SockAddr::from(bind_addr)) {
        return match e.kind() {
            io::ErrorKind::AddrInUse => (
                CaptureOutcome::PortInUse,
                Vec::new(),
                Some(format!("port {port} already bound on this host")),
            ),
            io::ErrorKind::PermissionDenied => (
                CaptureOutcome::PermissionDenied,
                Vec::new(),
                Some(format!("binding port {port} requires elevated privileges")),
            ),
            _ => (
                CaptureOutcome::Error,
                Vec::new(),
                Some(format!("bind failed: {e}")),
            ),
        };
    }
    if let Err(e) = socket.set_nonblocking(true) {
        return (
            CaptureOutcome::Error,
            Vec::new(),
            Some(format!("setting nonblocking failed: {e}")),
        );
    }
    let sock = match UdpSocket::from_std(socket.into()) {
        Ok(s) => s,
        Err(e) => {
            return (
                CaptureOutcome::Error,
                Vec::new(),
                Some(format!("socket registration failed: {e}")),
            )
        }
    };

    let mut buf = vec![0u8; 4096];
    match time::timeout(timeout, sock.recv_from(&mut buf)).await {
        Ok(Ok((n, from))) => {
            debug!("bind-listen got {n} bytes from {from}");
            buf.truncate(n);
            (CaptureOutcome::Success, buf, None)
        }
        Ok(Err(e)) => (
            CaptureOutcome::Error,
            Vec::new(),
            Some(format!("receive failed: {e}")),
        ),
        Err(_) => (
            CaptureOutcome::Timeout,
            Vec::new(),
            Some(format!("no datagram within {} ms", timeout.as_millis())),
        ),
    }
}

/// Connect a UDP socket to the endpoint (fixing the peer), optionally send
/// a greeting, and wait for a reply.
async fn connect_mode(
    endpoint: Endpoint,
    greeting: Option<&[u8]>,
    timeout: Duration,
) -> MethodResult {
    let sock = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(s) => s,
        Err(e) => {
            return (
                CaptureOutcome::Error,
                Vec::new(),
                Some(format!("socket creation failed: {e}")),
            )
        }
    };
    if let Err(e) = sock.connect((endpoint.address, endpoint.port)).await {
        return (
            CaptureOutcome::Error,
            Vec::new(),
            Some(format!("connect to {endpoint} failed: {e}")),
        );
    }
    if let Some(g) = greeting {
        if let Err(e) = sock.send(g).await {
            debug!("greeting to {endpoint} failed: {e}");
        }
    }

    let mut buf = vec![0u8; 4096];
    match time::timeout(timeout, sock.recv(&mut buf)).await {
        Ok(Ok(n)) => {
            buf.truncate(n);
            (CaptureOutcome::Success, buf, None)
        }
        Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => (
            CaptureOutcome::Error,
            Vec::new(),
            Some(format!("{endpoint} rejected the datagram (port unreachable)")),
        ),
        Ok(Err(e)) => (
            CaptureOutcome::Error,
            Vec::new(),
            Some(format!("receive failed: {e}")),
        ),
        Err(_) => (
            CaptureOutcome::Timeout,
            Vec::new(),
            Some(format!("no reply within {} ms", timeout.as_millis())),
        ),
    }
}

/// Observe all IPv4/UDP traffic through a raw socket and return the first
/// packet addressed to the target port.
///
/// Runs on the blocking pool with a short socket read timeout so the
/// method deadline and cancellation are both observed within one tick.
async fn raw_capture(target_port: u16, timeout: Duration, cancel: CancellationToken) -> MethodResult {
    let handle =
        tokio::task::spawn_blocking(move || raw_capture_blocking(target_port, timeout, cancel));
    match handle.await {
        Ok(result) => result,
        Err(e) => (
            CaptureOutcome::Error,
            Vec::new(),
            Some(format!("capture task failed: {e}")),
        ),
    }
}

fn raw_capture_blocking(
    target_port: u16,
    timeout: Duration,
    cancel: CancellationToken,
) -> MethodResult {
    let socket = match Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::UDP)) {
        Ok(s) => s,
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            return (
                CaptureOutcome::PermissionDenied,
                Vec::new(),
                Some("raw socket requires root or CAP_NET_RAW".to_string()),
            )
        }
        Err(e) => {
            return (
                CaptureOutcome::Error,
                Vec::new(),
                Some(format!("raw socket creation failed: {e}")),
            )
        }
    };
    // Short read timeout keeps the loop responsive to cancellation.
    if let Err(e) = socket.set_read_timeout(Some(Duration::from_millis(250))) {
        return (
            CaptureOutcome::Error,
            Vec::new(),
            Some(format!("setting read timeout failed: {e}")),
        );
    }

    let deadline = std::time::Instant::now() + timeout;
    let mut buf = vec![MaybeUninit::<u8>::uninit(); 65_535];

    while std::time::Instant::now() < deadline {
        if cancel.is_cancelled() {
            break;
        }
        let n = match socket.recv(&mut buf) {
            Ok(n) => n,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                continue
            }
            Err(e) => {
                return (
                    CaptureOutcome::Error,
                    Vec::new(),
                    Some(format!("raw receive failed: {e}")),
                )
            }
        };
        // The kernel wrote n initialized bytes into the buffer.
        let packet = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, n) };
        if let Some(payload) = udp_payload_for_port(packet, target_port) {
            return (CaptureOutcome::Success, payload.to_vec(), None);
        }
    }

    (
        CaptureOutcome::Timeout,
        Vec::new(),
        Some(format!(
            "no packet for port {target_port} within {} ms",
            timeout.as_millis()
        )),
    )
}

/// Parse an IPv4 packet and return the UDP payload when the transport is
/// UDP and the destination port matches.
fn udp_payload_for_port(packet: &[u8], target_port: u16) -> Option<&[u8]> {
    if packet.len() < 20 || packet[0] >> 4 != 4 {
        return None;
    }
    let ihl = usize::from(packet[0] & 0x0F) * 4;
    if ihl < 20 || packet.len() < ihl + 8 {
        return None;
    }
    if packet[9] != 17 {
        return None;
    }
    let dest_port = u16::from_be_bytes([packet[ihl + 2], packet[ihl + 3]]);
    if dest_port != target_port {
        return None;
    }
    Some(&packet[ihl + 8..])
}

/// Invoke the external capture utility as a bounded subprocess and count
/// output lines referencing the target port.
///
/// A nonzero count is a weak success: traffic was observed but no payload
/// was recovered. A missing tool degrades this one method to skipped.
async fn external_capture_tool(
    target_port: u16,
    tool: &CaptureToolConfig,
    timeout: Duration,
) -> MethodResult {
    let mut cmd = tokio::process::Command::new(&tool.program);
    cmd.arg("-i")
        .arg(&tool.interface)
        .arg("-c")
        .arg(tool.packet_cap.to_string())
        .arg("-n")
        .arg("udp")
        .arg("port")
        .arg(target_port.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return (
                CaptureOutcome::SubprocessUnavailable,
                Vec::new(),
                Some(format!("{} not found on PATH", tool.program)),
            )
        }
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            return (
                CaptureOutcome::PermissionDenied,
                Vec::new(),
                Some(format!("{} is not executable by this user", tool.program)),
            )
        }
        Err(e) => {
            return (
                CaptureOutcome::Error,
                Vec::new(),
                Some(format!("spawning {} failed: {e}", tool.program)),
            )
        }
    };

    // kill_on_drop reaps the subprocess if the timeout wins the race.
    let output = match time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(out)) => out,
        Ok(Err(e)) => {
            return (
                CaptureOutcome::Error,
                Vec::new(),
                Some(format!("capture tool failed: {e}")),
            )
        }
        Err(_) => {
            return (
                CaptureOutcome::Timeout,
                Vec::new(),
                Some(format!(
                    "capture tool produced no result within {} ms",
                    timeout.as_millis()
                )),
            )
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let needle = target_port.to_string();
    let matching = stdout.lines().filter(|l| l.contains(&needle)).count();
    if matching > 0 {
        return (
            CaptureOutcome::Success,
            Vec::new(),
            Some(format!(
                "{matching} matching lines reported by {}; no payload recovered",
                tool.program
            )),
        );
    }
    if !output.status.success() {
        return (
            CaptureOutcome::Error,
            Vec::new(),
            Some(format!("capture tool exited with {}", output.status)),
        );
    }
    (
        CaptureOutcome::Timeout,
        Vec::new(),
        Some("capture tool saw no matching traffic".to_string()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ipv4_udp_packet(dest_port: u16, payload: &[u8]) -> Vec<u8> {
        let mut p = vec![0u8; 28];
        p[0] = 0x45; // version 4, ihl 5
        p[9] = 17; // UDP
        p[22] = (dest_port >> 8) as u8;
        p[23] = (dest_port & 0xFF) as u8;
        p.extend_from_slice(payload);
        p
    }

    #[test]
    fn udp_payload_extracted_for_matching_port() {
        let packet = ipv4_udp_packet(2368, b"hello");
        assert_eq!(udp_payload_for_port(&packet, 2368), Some(&b"hello"[..]));
    }

    #[test]
    fn wrong_port_is_filtered() {
        let packet = ipv4_udp_packet(2369, b"hello");
        assert_eq!(udp_payload_for_port(&packet, 2368), None);
    }

    #[test]
    fn non_udp_transport_is_filtered() {
        let mut packet = ipv4_udp_packet(2368, b"hello");
        packet[9] = 6; // TCP
        assert_eq!(udp_payload_for_port(&packet, 2368), None);
    }

    #[test]
    fn truncated_packet_is_filtered() {
        let packet = vec![0x45u8; 12];
        assert_eq!(udp_payload_for_port(&packet, 2368), None);
    }

    #[test]
    fn options_header_shifts_udp_offset() {
        // ihl 6 -> 24-byte IP header
        let mut p = vec![0u8; 32];
        p[0] = 0x46;
        p[9] = 17;
        p[26] = (2368u16 >> 8) as u8;
        p[27] = (2368u16 & 0xFF) as u8;
        p.extend_from_slice(b"xy");
        assert_eq!(udp_payload_for_port(&p, 2368), Some(&b"xy"[..]));
    }

    #[test]
    fn port_claim_is_exclusive_until_dropped() {
        let first = claim_port(42_111);
        assert!(first.is_some());
        assert!(claim_port(42_111).is_none());
        drop(first);
        assert!(claim_port(42_111).is_some());
    }
}

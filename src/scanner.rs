use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ProbeConfig;
use crate::netdetect;
use crate::types::Endpoint;

/// Probe candidate addresses for liveness with a concurrency limit.
///
/// - One TCP connect per candidate to the device control port, bounded by
///   `timeout` via `tokio::time::timeout`; each probe owns its socket.
/// - Limits concurrent attempts using a `Semaphore` so a large candidate
///   set cannot exhaust ephemeral ports or file descriptors.
/// - Responders become endpoints carrying `data_port`, the port the
///   device streams on.
///
/// An empty result is a normal, reportable outcome, not an error.
pub async fn probe_candidates(
    candidates: &[IpAddr],
    probe_port: u16,
    data_port: u16,
    concurrency: usize,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Vec<Endpoint> {
    // Dedup while preserving first-seen order; one probe per address.
    let mut seen = HashSet::new();
    let targets: Vec<IpAddr> = candidates
        .iter()
        .copied()
        .filter(|ip| seen.insert(*ip))
        .collect();

    let reachable: Arc<Mutex<Vec<Endpoint>>> = Arc::new(Mutex::new(Vec::new()));
    let sem = Arc::new(Semaphore::new(concurrency.clamp(1, 1_024)));
    let mut set = JoinSet::new();

    for ip in targets {
        if cancel.is_cancelled() {
            break;
        }
        let permit = sem
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore in scope");
        let reachable = reachable.clone();
        let cancel = cancel.clone();

        set.spawn(async move {
            let _permit = permit; // keep permit until task completes

            if cancel.is_cancelled() {
                return;
            }

            let addr = SocketAddr::new(ip, probe_port);
            let start = Instant::now();
            match time::timeout(timeout, TcpStream::connect(addr)).await {
                Ok(Ok(_stream)) => {
                    debug!(
                        "liveness probe {} answered in {} ms",
                        addr,
                        start.elapsed().as_millis()
                    );
                    let mut guard = reachable.lock().await;
                    guard.push(Endpoint::new(ip, data_port));
                }
                _ => {
                    // Unreachable, refused, or timed out; silence here is
                    // recorded by the absence of an endpoint.
                    debug!("liveness probe {} got no answer", addr);
                }
            }
        });
    }

    while set.join_next().await.is_some() {}

    let mut out = reachable.lock().await.clone();
    out.sort_by_key(|e| (e.address, e.port));
    out
}

/// Broadcast a discovery datagram and collect replying devices.
///
/// Sends `probe` to each broadcast address on `discovery_port`, then
/// gathers reply source addresses until `wait` elapses. Devices that
/// answer become endpoints carrying `data_port`.
pub async fn broadcast_discovery(
    probe: &[u8],
    broadcast_addresses: &[Ipv4Addr],
    discovery_port: u16,
    data_port: u16,
    wait: Duration,
    cancel: &CancellationToken,
) -> Vec<Endpoint> {
    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(s) => s,
        Err(e) => {
            warn!("broadcast discovery could not open a socket: {e}");
            return Vec::new();
        }
    };
    if let Err(e) = socket.set_broadcast(true) {
        warn!("broadcast discovery could not enable SO_BROADCAST: {e}");
        return Vec::new();
    }

    for &addr in broadcast_addresses {
        if cancel.is_cancelled() {
            return Vec::new();
        }
        if let Err(e) = socket.send_to(probe, (addr, discovery_port)).await {
            // Some interfaces reject the limited broadcast address; keep going.
            debug!("discovery datagram to {addr}:{discovery_port} failed: {e}");
        }
    }

    let mut found: Vec<Endpoint> = Vec::new();
    let mut seen = HashSet::new();
    let deadline = Instant::now() + wait;
    let mut buf = vec![0u8; 2048];

    loop {
        if cancel.is_cancelled() {
            break;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match time::timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok((n, from))) => {
                debug!("discovery reply: {} bytes from {}", n, from.ip());
                if seen.insert(from.ip()) {
                    found.push(Endpoint::new(from.ip(), data_port));
                }
            }
            Ok(Err(e)) => {
                debug!("discovery receive error: {e}");
                break;
            }
            Err(_) => break, // window elapsed
        }
    }

    found
}

/// Full scan stage: direct liveness probes, then broadcast discovery as a
/// fallback when nothing answered.
///
/// Candidates come from configuration, optionally extended with addresses
/// derived from the local subnets. Never blocks past the configured
/// timeouts; an empty set means "nothing reachable", not failure.
pub async fn scan(cfg: &ProbeConfig, cancel: &CancellationToken) -> Vec<Endpoint> {
    let mut candidates = cfg.candidates.clone();

    if cfg.derive_from_interfaces {
        match netdetect::sensor_host_candidates() {
            Ok(derived) => candidates.extend(derived),
            Err(e) => warn!("interface candidate derivation failed: {e}"),
        }
    }
    if cfg.sweep_local {
        match netdetect::detect_local_cidrs() {
            Ok(cidrs) => {
                for cidr in cidrs {
                    candidates.extend(netdetect::expand_cidr_to_ips(cidr));
                }
            }
            Err(e) => warn!("local sweep derivation failed: {e}"),
        }
    }

    let reachable = probe_candidates(
        &candidates,
        cfg.control_port,
        cfg.data_port,
        cfg.probe_concurrency,
        cfg.probe_timeout(),
        cancel,
    )
    .await;

    if !reachable.is_empty() || cancel.is_cancelled() {
        return reachable;
    }

    debug!("no candidate answered a direct probe; falling back to broadcast discovery");
    broadcast_discovery(
        &cfg.discovery_probe,
        &cfg.broadcast_addresses,
        cfg.discovery_port,
        cfg.data_port,
        cfg.discovery_wait(),
        cancel,
    )
    .await
}

use std::net::IpAddr;
use std::time::Duration;

use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;

use lidar_probe_rs::config::ProbeConfig;
use lidar_probe_rs::orchestrator::{run_diagnostic, NonInteractive, OperatorPrompt};
use lidar_probe_rs::types::{MethodDescriptor, MethodKind, Remediation};

fn bind_listen_only(timeout_ms: u64) -> Vec<MethodDescriptor> {
    vec![MethodDescriptor {
        method: MethodKind::BindListen,
        priority: 1,
        timeout_ms,
        requires_elevated_privilege: false,
    }]
}

/// TCP listener standing in for the device control port.
async fn control_listener() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener");
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let _ = listener.accept().await;
        }
    });
    port
}

/// Keeps streaming conventional-looking datagrams at the data port.
fn pump_datagrams(target_port: u16) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let sock = UdpSocket::bind("127.0.0.1:0").await.expect("pump socket");
        let mut packet = vec![0xEE, 0xFF];
        packet.resize(1400, 0);
        loop {
            let _ = sock.send_to(&packet, ("127.0.0.1", target_port)).await;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
}

#[tokio::test]
async fn streaming_device_produces_an_overall_success() {
    let control_port = control_listener().await;
    let data_port = 45_361;
    let pump = pump_datagrams(data_port);

    let cfg = ProbeConfig {
        candidates: vec!["127.0.0.1".parse().unwrap()],
        derive_from_interfaces: false,
        control_port,
        data_port,
        probe_timeout_ms: 1_000,
        methods: bind_listen_only(3_000),
        global_deadline_ms: 6_000,
        retry_pause_ms: 100,
        ..ProbeConfig::default()
    };

    let result = run_diagnostic(&cfg, &NonInteractive, CancellationToken::new())
        .await
        .expect("valid config");
    pump.abort();

    assert!(result.overall_success);
    assert_eq!(result.remediation, Some(Remediation::None));
    assert_eq!(result.endpoints.len(), 1);
    assert!(result.classifications.iter().any(|c| c.matched));
}

#[tokio::test]
async fn silent_device_recommends_checking_activation() {
    let control_port = control_listener().await;

    let cfg = ProbeConfig {
        candidates: vec!["127.0.0.1".parse().unwrap()],
        derive_from_interfaces: false,
        control_port,
        data_port: 45_362,
        probe_timeout_ms: 1_000,
        methods: bind_listen_only(300),
        global_deadline_ms: 1_200,
        retry_pause_ms: 300,
        ..ProbeConfig::default()
    };

    let result = run_diagnostic(&cfg, &NonInteractive, CancellationToken::new())
        .await
        .expect("valid config");

    assert!(!result.overall_success);
    assert_eq!(result.remediation, Some(Remediation::ReachableButSilent));
    assert!(!result.attempts.is_empty());
}

#[tokio::test]
async fn unreachable_network_recommends_checking_cabling() {
    let cfg = ProbeConfig {
        candidates: vec![IpAddr::V4("192.0.2.55".parse().unwrap())],
        derive_from_interfaces: false,
        probe_timeout_ms: 300,
        broadcast_addresses: Vec::new(),
        discovery_wait_ms: 100,
        methods: bind_listen_only(300),
        global_deadline_ms: 1_000,
        ..ProbeConfig::default()
    };

    let result = run_diagnostic(&cfg, &NonInteractive, CancellationToken::new())
        .await
        .expect("valid config");

    assert!(!result.overall_success);
    assert_eq!(result.remediation, Some(Remediation::CheckPowerAndCabling));
    assert!(result.endpoints.is_empty());
    assert!(result.attempts.is_empty());
}

/// Operator override: capture blind against the configured candidates even
/// though nothing answered a probe.
struct AlwaysYes;

impl OperatorPrompt for AlwaysYes {
    fn ask_yes_no(&self, _prompt: &str) -> bool {
        true
    }
}

#[tokio::test]
async fn blind_capture_override_still_reaches_the_ladder() {
    let data_port = 45_363;
    let pump = pump_datagrams(data_port);

    let cfg = ProbeConfig {
        candidates: vec!["127.0.0.1".parse().unwrap()],
        derive_from_interfaces: false,
        // Nothing listens on the control port, so the scan finds nothing.
        control_port: 45_399,
        data_port,
        probe_timeout_ms: 300,
        broadcast_addresses: Vec::new(),
        discovery_wait_ms: 100,
        methods: bind_listen_only(3_000),
        global_deadline_ms: 5_000,
        retry_pause_ms: 100,
        ..ProbeConfig::default()
    };

    let result = run_diagnostic(&cfg, &AlwaysYes, CancellationToken::new())
        .await
        .expect("valid config");
    pump.abort();

    assert!(result.overall_success);
    assert!(!result.attempts.is_empty());
}

#[tokio::test]
async fn activation_commands_are_recorded_per_command() {
    let control_port = control_listener().await;

    let cfg = ProbeConfig {
        candidates: vec!["127.0.0.1".parse().unwrap()],
        derive_from_interfaces: false,
        control_port,
        data_port: 45_364,
        probe_timeout_ms: 1_000,
        methods: bind_listen_only(200),
        global_deadline_ms: 800,
        retry_pause_ms: 300,
        send_activation: true,
        command_response_wait_ms: 100,
        command_gap_ms: 10,
        ..ProbeConfig::default()
    };

    let result = run_diagnostic(&cfg, &NonInteractive, CancellationToken::new())
        .await
        .expect("valid config");

    // The default activation trio, all unanswered: the control port here is
    // TCP-only, so the UDP commands fall into the void.
    assert_eq!(result.command_results.len(), 3);
    assert!(result.command_results.iter().all(|r| !r.responded));
}

#[tokio::test]
async fn cancelled_run_returns_promptly_with_partial_results() {
    let control_port = control_listener().await;
    let cancel = CancellationToken::new();
    let killer = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        killer.cancel();
    });

    let cfg = ProbeConfig {
        candidates: vec!["127.0.0.1".parse().unwrap()],
        derive_from_interfaces: false,
        control_port,
        data_port: 45_365,
        probe_timeout_ms: 1_000,
        methods: bind_listen_only(1_000),
        global_deadline_ms: 60_000,
        retry_pause_ms: 100,
        ..ProbeConfig::default()
    };

    let start = tokio::time::Instant::now();
    let result = run_diagnostic(&cfg, &NonInteractive, cancel)
        .await
        .expect("valid config");

    assert!(!result.overall_success);
    assert!(
        start.elapsed() < Duration::from_secs(5),
        "cancellation must not wait out the global deadline"
    );
}

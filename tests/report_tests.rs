use std::net::IpAddr;

use lidar_probe_rs::report::{build_report, render_summary};
use lidar_probe_rs::types::{
    CaptureAttempt, CaptureOutcome, Endpoint, MethodKind, Remediation,
};

fn attempt(
    method: MethodKind,
    endpoint: Endpoint,
    outcome: CaptureOutcome,
    duration_ms: u64,
    detail: &str,
) -> CaptureAttempt {
    CaptureAttempt {
        method,
        endpoint,
        started_at: "2026-01-01T00:00:00Z".into(),
        duration_ms,
        outcome,
        payload: Vec::new(),
        error_detail: Some(detail.to_string()),
    }
}

/// One silent-but-reachable device: probes found it, every capture method
/// came back empty-handed in its own distinct way.
#[test]
fn reachable_but_silent_device() {
    let reachable = Endpoint::new("10.0.0.9".parse::<IpAddr>().unwrap(), 2368);
    // 10.0.0.5 never answered a probe, so it contributes no endpoint.
    let endpoints = vec![reachable];

    let attempts = vec![
        attempt(
            MethodKind::BindListen,
            reachable,
            CaptureOutcome::Timeout,
            5_000,
            "no datagram within 5000 ms",
        ),
        attempt(
            MethodKind::RawCapture,
            reachable,
            CaptureOutcome::PermissionDenied,
            2,
            "raw socket requires root or CAP_NET_RAW",
        ),
        attempt(
            MethodKind::ExternalCaptureTool,
            reachable,
            CaptureOutcome::Timeout,
            10_000,
            "capture tool saw no matching traffic",
        ),
    ];

    let result = build_report(endpoints, attempts, Vec::new(), Vec::new());

    assert!(!result.overall_success);
    assert_eq!(result.remediation, Some(Remediation::ReachableButSilent));
    assert_eq!(result.attempts_by_endpoint.get("10.0.0.9:2368"), Some(&3));
    assert_eq!(result.attempts_by_method.len(), 3);

    let summary = render_summary(&result);
    assert!(summary.contains("reachable but silent"));
    assert!(summary.contains("permission-denied"));
    assert!(summary.contains("elevated privileges"));
}

#[test]
fn summary_renders_every_attempt_row() {
    let ep = Endpoint::new("192.168.1.201".parse::<IpAddr>().unwrap(), 2368);
    let result = build_report(
        vec![ep],
        vec![
            attempt(MethodKind::BindListen, ep, CaptureOutcome::Timeout, 5_000, "t"),
            attempt(MethodKind::ConnectMode, ep, CaptureOutcome::Timeout, 5_000, "t"),
        ],
        Vec::new(),
        Vec::new(),
    );
    let summary = render_summary(&result);
    assert!(summary.contains("bind-listen"));
    assert!(summary.contains("connect-mode"));
    assert!(summary.contains("192.168.1.201:2368"));
}

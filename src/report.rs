use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::types::{
    CaptureAttempt, CaptureOutcome, Classification, CommandResult, DiagnosticResult, Endpoint,
    Remediation,
};

/// Merge everything the pipeline produced into one diagnostic result.
///
/// Remediation comes from a fixed decision table keyed on the first stage
/// that failed:
/// - nothing reachable -> check power/cabling/network
/// - reachable, no capture -> reachable but silent
/// - capture, no protocol match -> unexpected protocol
/// - capture and match -> overall success
pub fn build_report(
    endpoints: Vec<Endpoint>,
    attempts: Vec<CaptureAttempt>,
    classifications: Vec<Classification>,
    command_results: Vec<CommandResult>,
) -> DiagnosticResult {
    let any_capture = attempts
        .iter()
        .any(|a| a.outcome == CaptureOutcome::Success);
    let any_match = classifications.iter().any(|c| c.matched);

    let (overall_success, remediation) = if endpoints.is_empty() {
        (false, Remediation::CheckPowerAndCabling)
    } else if !any_capture {
        (false, Remediation::ReachableButSilent)
    } else if !any_match {
        (false, Remediation::UnexpectedProtocol)
    } else {
        (true, Remediation::None)
    };

    let mut attempts_by_method: BTreeMap<String, u64> = BTreeMap::new();
    let mut attempts_by_endpoint: BTreeMap<String, u64> = BTreeMap::new();
    for a in &attempts {
        *attempts_by_method.entry(a.method.to_string()).or_insert(0) += 1;
        *attempts_by_endpoint
            .entry(a.endpoint.to_string())
            .or_insert(0) += 1;
    }

    DiagnosticResult {
        endpoints,
        attempts,
        classifications,
        command_results,
        overall_success,
        remediation: Some(remediation),
        attempts_by_method,
        attempts_by_endpoint,
    }
}

/// Render the operator-facing summary block.
pub fn render_summary(result: &DiagnosticResult) -> String {
    let mut out = String::new();

    let verdict = if result.overall_success {
        "sensor traffic captured and recognized"
    } else {
        "sensor traffic not confirmed"
    };
    let _ = writeln!(out, "Diagnostic verdict: {verdict}");

    if let Some(rem) = result.remediation {
        if rem != Remediation::None {
            let _ = writeln!(out, "Recommendation: {rem}");
        }
    }

    let _ = writeln!(
        out,
        "Endpoints reachable: {} | capture attempts: {} | commands sent: {}",
        result.endpoints.len(),
        result.attempts.len(),
        result.command_results.len()
    );

    if !result.attempts.is_empty() {
        // Column widths sized to content, matching the widest entry.
        let mut ep_w = "endpoint".len();
        let mut m_w = "method".len();
        for a in &result.attempts {
            ep_w = ep_w.max(a.endpoint.to_string().len());
            m_w = m_w.max(a.method.to_string().len());
        }
        let o_w = "subprocess-unavailable".len();

        let _ = writeln!(
            out,
            "{:<m_w$}  {:<ep_w$}  {:<o_w$}  {:>11}  {:>7}  detail",
            "method", "endpoint", "outcome", "duration_ms", "bytes"
        );
        let _ = writeln!(
            out,
            "{:-<m_w$}  {:-<ep_w$}  {:-<o_w$}  {:->11}  {:->7}  ------",
            "", "", "", "", ""
        );
        for a in &result.attempts {
            let detail = a.error_detail.as_deref().unwrap_or("");
            let _ = writeln!(
                out,
                "{:<m_w$}  {:<ep_w$}  {:<o_w$}  {:>11}  {:>7}  {}",
                a.method.to_string(),
                a.endpoint.to_string(),
                a.outcome.to_string(),
                a.duration_ms,
                a.payload.len(),
                detail
            );
        }
    }

    for (method, count) in &result.attempts_by_method {
        let _ = writeln!(out, "  attempts via {method}: {count}");
    }
    for (endpoint, count) in &result.attempts_by_endpoint {
        let _ = writeln!(out, "  attempts against {endpoint}: {count}");
    }

    if result
        .attempts
        .iter()
        .any(|a| a.outcome == CaptureOutcome::PermissionDenied)
    {
        let _ = writeln!(
            out,
            "Note: at least one method needs elevated privileges; rerun as root to use it."
        );
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClassifyReason, MethodKind};
    use std::net::{IpAddr, Ipv4Addr};

    fn endpoint() -> Endpoint {
        Endpoint::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)), 2368)
    }

    fn attempt(outcome: CaptureOutcome, method: MethodKind) -> CaptureAttempt {
        CaptureAttempt {
            method,
            endpoint: endpoint(),
            started_at: "2026-01-01T00:00:00Z".into(),
            duration_ms: 5,
            outcome,
            payload: Vec::new(),
            error_detail: None,
        }
    }

    #[test]
    fn no_endpoints_means_check_cabling() {
        let r = build_report(Vec::new(), Vec::new(), Vec::new(), Vec::new());
        assert!(!r.overall_success);
        assert_eq!(r.remediation, Some(Remediation::CheckPowerAndCabling));
    }

    #[test]
    fn reachable_without_capture_means_silent() {
        let r = build_report(
            vec![endpoint()],
            vec![attempt(CaptureOutcome::Timeout, MethodKind::BindListen)],
            Vec::new(),
            Vec::new(),
        );
        assert_eq!(r.remediation, Some(Remediation::ReachableButSilent));
    }

    #[test]
    fn capture_without_match_means_unexpected_protocol() {
        let r = build_report(
            vec![endpoint()],
            vec![attempt(CaptureOutcome::Success, MethodKind::BindListen)],
            vec![Classification {
                matched: false,
                reason: ClassifyReason::NoMatch,
                confidence_note: String::new(),
            }],
            Vec::new(),
        );
        assert_eq!(r.remediation, Some(Remediation::UnexpectedProtocol));
        assert!(!r.overall_success);
    }

    #[test]
    fn capture_and_match_is_success() {
        let r = build_report(
            vec![endpoint()],
            vec![attempt(CaptureOutcome::Success, MethodKind::BindListen)],
            vec![Classification {
                matched: true,
                reason: ClassifyReason::SignatureMatch,
                confidence_note: String::new(),
            }],
            Vec::new(),
        );
        assert!(r.overall_success);
        assert_eq!(r.remediation, Some(Remediation::None));
    }

    #[test]
    fn counts_are_per_method_and_endpoint() {
        let r = build_report(
            vec![endpoint()],
            vec![
                attempt(CaptureOutcome::Timeout, MethodKind::BindListen),
                attempt(CaptureOutcome::Timeout, MethodKind::BindListen),
                attempt(CaptureOutcome::PermissionDenied, MethodKind::RawCapture),
            ],
            Vec::new(),
            Vec::new(),
        );
        assert_eq!(r.attempts_by_method.get("bind-listen"), Some(&2));
        assert_eq!(r.attempts_by_method.get("raw-capture"), Some(&1));
        assert_eq!(r.attempts_by_endpoint.get("10.0.0.9:2368"), Some(&3));
    }

    #[test]
    fn summary_mentions_privilege_note_when_denied() {
        let r = build_report(
            vec![endpoint()],
            vec![attempt(CaptureOutcome::PermissionDenied, MethodKind::RawCapture)],
            Vec::new(),
            Vec::new(),
        );
        let text = render_summary(&r);
        assert!(text.contains("elevated privileges"));
        assert!(text.contains("reachable but silent"));
    }
}

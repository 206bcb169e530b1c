use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classify;
use crate::command;
use crate::config::ProbeConfig;
use crate::error::ProbeError;
use crate::ladder::{self, LadderOptions};
use crate::report;
use crate::scanner;
use crate::types::{
    CaptureOutcome, Classification, CommandResult, DiagnosticResult, Endpoint,
};

/// Caller-supplied capability for questions only a human near the hardware
/// can answer ("is the LED lit?", "capture blind anyway?").
pub trait OperatorPrompt: Send + Sync {
    fn ask_yes_no(&self, prompt: &str) -> bool;
}

/// Prompt for unattended runs: declines every question.
#[derive(Debug, Default, Clone, Copy)]
pub struct NonInteractive;

impl OperatorPrompt for NonInteractive {
    fn ask_yes_no(&self, _prompt: &str) -> bool {
        false
    }
}

/// Run the full diagnostic pipeline: scan, optional activation, the
/// capture ladder under the global deadline, classification, report.
///
/// This is the single failure boundary. `InvalidConfiguration` is the only
/// error that escapes; every network-level failure is folded into the
/// returned `DiagnosticResult`. Cancellation is observed between stages
/// and inside every component within its own timeout.
pub async fn run_diagnostic(
    cfg: &ProbeConfig,
    operator: &dyn OperatorPrompt,
    cancel: CancellationToken,
) -> Result<DiagnosticResult, ProbeError> {
    cfg.validate()?;

    let endpoints = scanner::scan(cfg, &cancel).await;
    info!("scan finished: {} endpoint(s) reachable", endpoints.len());

    // Nothing answered. The operator may still opt into capturing blind
    // against the configured candidates (a device can stream without
    // answering probes).
    let targets: Vec<Endpoint> = if endpoints.is_empty() {
        if !cancel.is_cancelled()
            && !cfg.candidates.is_empty()
            && operator.ask_yes_no(
                "No endpoint answered a probe. Attempt capture against the configured candidates anyway?",
            )
        {
            cfg.candidates
                .iter()
                .map(|&ip| Endpoint::new(ip, cfg.data_port))
                .collect()
        } else {
            Vec::new()
        }
    } else {
        endpoints
    };

    let mut command_results: Vec<CommandResult> = Vec::new();
    if cfg.send_activation && !cfg.commands.is_empty() {
        for ep in &targets {
            if cancel.is_cancelled() {
                break;
            }
            let control = Endpoint::new(ep.address, cfg.control_port);
            info!(
                "sending {} activation command(s) to {}",
                cfg.commands.len(),
                control
            );
            let mut results = command::send_commands(
                control,
                &cfg.commands,
                cfg.command_response_wait(),
                cfg.command_gap(),
                &cancel,
            )
            .await;
            command_results.append(&mut results);
        }
    }

    let opts = LadderOptions {
        exhaustive: cfg.exhaustive,
        greeting: cfg.greeting.clone(),
        capture_tool: cfg.capture_tool.clone(),
    };

    let mut attempts = Vec::new();
    let mut classifications: Vec<Classification> = Vec::new();
    let deadline = Instant::now() + cfg.global_deadline();

    // Ladders run endpoint-by-endpoint: the wildcard bind admits a single
    // binder per port, so cross-endpoint parallelism lives in the scan
    // stage, not here.
    'endpoints: for ep in &targets {
        loop {
            if cancel.is_cancelled() {
                break 'endpoints;
            }
            if !attempts.is_empty() && Instant::now() >= deadline {
                warn!("global deadline expired; returning what was collected");
                break 'endpoints;
            }

            let run = ladder::run_ladder(*ep, &cfg.methods, &opts, &cancel).await;
            let succeeded = run.succeeded();
            for attempt in &run.attempts {
                if attempt.outcome == CaptureOutcome::Success && !attempt.payload.is_empty() {
                    classifications.push(classify::classify(&cfg.classifier, &attempt.payload));
                }
            }
            attempts.extend(run.attempts);

            if succeeded {
                if cfg.exhaustive {
                    // Completeness run: move on to the remaining endpoints.
                    break;
                }
                break 'endpoints;
            }

            let now = Instant::now();
            if now + cfg.retry_pause() >= deadline {
                debug!("deadline leaves no room for another round against {ep}");
                break;
            }
            time::sleep(cfg.retry_pause()).await;
        }
    }

    Ok(report::build_report(
        targets,
        attempts,
        classifications,
        command_results,
    ))
}

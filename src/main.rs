use std::fs::{self, File};
use std::io::Write as _;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use lidar_probe_rs::config::ProbeConfig;
use lidar_probe_rs::netdetect;
use lidar_probe_rs::orchestrator::{self, NonInteractive, OperatorPrompt};
use lidar_probe_rs::report;
use lidar_probe_rs::types::DiagnosticResult;

/// lidar-probe-rs — discover a LiDAR sensor on the network, capture a traffic
/// sample through a ladder of fallback methods, and report what went wrong.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "lidar-probe-rs",
    version,
    about = "LiDAR sensor discovery, capture diagnostics, and activation.",
    long_about = None
)]
struct Cli {
    /// JSON config file; flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Candidate addresses: comma-separated IPs/CIDRs, or a path to a file
    /// with one entry per line. If omitted, uses config/defaults plus
    /// subnet-derived candidates.
    #[arg(long)]
    candidates: Option<String>,

    /// UDP port the sensor streams data to.
    #[arg(long = "data-port")]
    data_port: Option<u16>,

    /// Device control port (also used for liveness probes).
    #[arg(long = "control-port")]
    control_port: Option<u16>,

    /// Per-probe liveness timeout in milliseconds.
    #[arg(long = "timeout-ms")]
    timeout_ms: Option<u64>,

    /// Max concurrent liveness probes.
    #[arg(long)]
    concurrency: Option<usize>,

    /// Wall-clock bound for the capture stage in milliseconds.
    #[arg(long = "deadline-ms")]
    deadline_ms: Option<u64>,

    /// Run every capture method for completeness instead of stopping at the
    /// first success.
    #[arg(long, default_value_t = false)]
    exhaustive: bool,

    /// Fire the configured activation commands before capturing.
    #[arg(long, default_value_t = false)]
    activate: bool,

    /// Probe every host of each local /24, not just conventional sensor
    /// addresses.
    #[arg(long, default_value_t = false)]
    sweep: bool,

    /// Ask on stdin before capturing blind when nothing answers a probe.
    #[arg(long, default_value_t = false)]
    interactive: bool,

    /// Write the full diagnostic result as pretty JSON to this path.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Debug-level logging on stderr.
    #[arg(long, default_value_t = false)]
    verbose: bool,
}

/// Prompt that asks the question on the terminal.
struct StdinPrompt;

impl OperatorPrompt for StdinPrompt {
    fn ask_yes_no(&self, prompt: &str) -> bool {
        print!("{prompt} (y/n): ");
        let _ = std::io::stdout().flush();
        let mut line = String::new();
        if std::io::stdin().read_line(&mut line).is_err() {
            return false;
        }
        matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut cfg = match cli.config.as_deref() {
        Some(path) => ProbeConfig::load(path)?,
        None => ProbeConfig::default(),
    };

    if let Some(list) = cli.candidates.as_deref() {
        cfg.candidates = load_candidates(list)?;
        // An explicit candidate list replaces subnet derivation.
        cfg.derive_from_interfaces = false;
    }
    if let Some(p) = cli.data_port {
        cfg.data_port = p;
    }
    if let Some(p) = cli.control_port {
        cfg.control_port = p;
    }
    if let Some(t) = cli.timeout_ms {
        cfg.probe_timeout_ms = t;
    }
    if let Some(c) = cli.concurrency {
        cfg.probe_concurrency = c;
    }
    if let Some(d) = cli.deadline_ms {
        cfg.global_deadline_ms = d;
    }
    if cli.exhaustive {
        cfg.exhaustive = true;
    }
    if cli.activate {
        cfg.send_activation = true;
    }
    if cli.sweep {
        cfg.sweep_local = true;
    }

    println!("lidar-probe-rs configuration:");
    println!(
        "  candidates   : {} explicit{}",
        cfg.candidates.len(),
        if cfg.derive_from_interfaces {
            " + subnet-derived"
        } else {
            ""
        }
    );
    println!("  data port    : {}", cfg.data_port);
    println!("  control port : {}", cfg.control_port);
    println!("  probe timeout: {} ms", cfg.probe_timeout_ms);
    println!("  deadline     : {} ms", cfg.global_deadline_ms);
    println!("  exhaustive   : {}", cfg.exhaustive);
    println!("  activation   : {}", cfg.send_activation);

    if cfg.derive_from_interfaces {
        match netdetect::detect_local_cidrs() {
            Ok(cidrs) => {
                println!("Detected local IPv4 CIDRs:");
                for cidr in &cidrs {
                    println!("  - {cidr}");
                }
            }
            Err(e) => {
                eprintln!("Warning: failed to detect local networks: {e}");
            }
        }
    }

    // Ctrl-C cancels the run; components drain within their own timeouts.
    let cancel = CancellationToken::new();
    let cancel_ctrlc = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        cancel_ctrlc.cancel();
    });

    let result = if cli.interactive {
        orchestrator::run_diagnostic(&cfg, &StdinPrompt, cancel).await?
    } else {
        orchestrator::run_diagnostic(&cfg, &NonInteractive, cancel).await?
    };

    print!("\n{}", report::render_summary(&result));

    if let Some(path) = cli.output.as_deref() {
        if let Err(e) = write_result_json(path, &result) {
            eprintln!("Failed to write JSON to {}: {}", path.display(), e);
        } else {
            println!("Wrote JSON result to {}", path.display());
        }
    }

    Ok(())
}

/// The candidate argument is either a readable file or an inline list.
fn load_candidates(list: &str) -> Result<Vec<IpAddr>> {
    let path = Path::new(list);
    if path.is_file() {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read candidates file: {}", path.display()))?;
        netdetect::parse_candidates_str(&content)
    } else {
        netdetect::parse_candidates_str(list)
    }
}

fn write_result_json(path: &Path, result: &DiagnosticResult) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, result)?;
    Ok(())
}

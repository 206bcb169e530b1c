use serde::{Deserialize, Serialize};

use crate::types::{Classification, ClassifyReason};

/// Tuning constants for the protocol fingerprint heuristic.
///
/// The defaults describe the sensor family's conventional wire format:
/// short magic prefixes near the start of each datagram and a full-packet
/// size in the low-thousands of bytes. Signatures differ across firmware
/// revisions; confirm against vendor documentation before trusting a match.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Buffers shorter than this can never match.
    pub min_packet_len: usize,
    /// Signatures are searched only within this many leading bytes.
    pub header_window: usize,
    /// Known magic byte sequences.
    pub signatures: Vec<Vec<u8>>,
    /// Inclusive full-packet size range used as a weak fallback signal.
    pub expected_size_min: usize,
    pub expected_size_max: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            min_packet_len: 16,
            header_window: 20,
            signatures: vec![vec![0xEE, 0xFF], vec![0xFF, 0xEE], vec![0xAA, 0x55]],
            expected_size_min: 1_000,
            expected_size_max: 2_000,
        }
    }
}

/// Judge whether a captured buffer looks like the expected sensor protocol.
///
/// Purely deterministic over its inputs. The result is a heuristic with
/// real false-positive and false-negative risk, never a conformance check.
pub fn classify(cfg: &ClassifierConfig, buf: &[u8]) -> Classification {
    if buf.len() < cfg.min_packet_len {
        return Classification {
            matched: false,
            reason: ClassifyReason::NoMatch,
            confidence_note: format!(
                "{} bytes is below the minimum viable packet size of {}",
                buf.len(),
                cfg.min_packet_len
            ),
        };
    }

    let window = &buf[..cfg.header_window.min(buf.len())];
    for sig in &cfg.signatures {
        if !sig.is_empty() && contains_subslice(window, sig) {
            return Classification {
                matched: true,
                reason: ClassifyReason::SignatureMatch,
                confidence_note: format!(
                    "magic sequence {} found in the first {} bytes",
                    hex_string(sig),
                    window.len()
                ),
            };
        }
    }

    if buf.len() >= cfg.expected_size_min && buf.len() <= cfg.expected_size_max {
        return Classification {
            matched: true,
            reason: ClassifyReason::SizeHeuristic,
            confidence_note: format!(
                "no signature, but {} bytes falls in the expected {}..={} range; weak evidence only",
                buf.len(),
                cfg.expected_size_min,
                cfg.expected_size_max
            ),
        };
    }

    Classification {
        matched: false,
        reason: ClassifyReason::NoMatch,
        confidence_note: format!(
            "{} bytes with no known signature and outside the expected size range",
            buf.len()
        ),
    }
}

fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn hex_string(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

//! Startup checks
//!
//! Probes the external encoder before the service starts. A missing or old
//! encoder is reported but never fatal: raw files are still served, and
//! conversions fail individually with a reason.

use crate::config::Config;
use std::process::Command;
use thiserror::Error;

/// Oldest ffmpeg major version known to support the HLS muxer options we pass
pub const MIN_FFMPEG_MAJOR: u32 = 4;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Encoder '{program}' not available: {reason}")]
    EncoderUnavailable { program: String, reason: String },
}

/// Run `<program> -version` and return its first output line
pub fn check_encoder_available(program: &str) -> Result<String, StartupError> {
    let unavailable = |reason: String| StartupError::EncoderUnavailable {
        program: program.to_string(),
        reason,
    };

    let output = Command::new(program)
        .arg("-version")
        .output()
        .map_err(|e| unavailable(format!("is it installed and in PATH? {}", e)))?;

    if !output.status.success() {
        return Err(unavailable(format!("-version exited with {}", output.status)));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.lines().next().unwrap_or("").trim().to_string())
}

/// Parse the major version from `ffmpeg -version` output
///
/// Handles various FFmpeg version formats:
/// - Standard: "ffmpeg version 6.1.1 ..."
/// - N-prefixed: "ffmpeg version n7.0-... ..."
///
/// Git snapshots ("N-112345-g...") carry no release number and yield `None`.
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let version_part = version_line
        .to_lowercase()
        .split("ffmpeg version")
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    let version_str = version_part.trim_start_matches('n');
    version_str
        .split(|c| c == '.' || c == '-')
        .next()?
        .parse()
        .ok()
}

/// Run all startup checks, logging problems as warnings
///
/// Returns the encoder's version line when the probe succeeded.
pub fn run_startup_checks(cfg: &Config) -> Option<String> {
    let program = &cfg.encoder.program;
    match check_encoder_available(program) {
        Ok(version) => {
            if let Some(major) = parse_ffmpeg_version(&version) {
                if major < MIN_FFMPEG_MAJOR {
                    tracing::warn!(
                        major,
                        "Encoder is older than {}.0; conversions may fail",
                        MIN_FFMPEG_MAJOR
                    );
                }
            }
            tracing::info!(%version, "Encoder available");
            Some(version)
        }
        Err(e) => {
            tracing::warn!("{}; conversions will fail until it is installed", e);
            None
        }
    }
}

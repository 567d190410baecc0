//! HLS encoder module
//!
//! Defines the contract for the external encoder and provides the ffmpeg
//! implementation that turns a raw video into a VOD playlist plus MPEG-TS
//! segments in the manifest's directory.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Segment file pattern, relative to the manifest directory
const SEGMENT_PATTERN: &str = "segment_%03d.ts";

/// Encoder diagnostics written next to the manifest while encoding
pub const ENCODER_LOG_FILE: &str = "encoder.log";

/// How often a running encoder is polled for exit
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Error type for encoding operations
#[derive(Debug, Error)]
pub enum EncodeError {
    /// The encoder binary could not be started (missing, not executable)
    #[error("Failed to start encoder: {0}")]
    Spawn(std::io::Error),

    /// Encoder process exited with non-zero status
    #[error("Encoder failed with exit code: {0}")]
    Failed(i32),

    /// Encoder process was terminated by signal
    #[error("Encoder process was terminated by signal")]
    Terminated,

    /// Encoder ran past the configured limit and was killed
    #[error("Encoder timed out after {0} seconds")]
    TimedOut(u64),

    /// Encoder reported success but the manifest is absent or empty
    #[error("Encoder produced no manifest at {0}")]
    MissingOutput(PathBuf),

    /// IO error while preparing or waiting on the encoder
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One invocation of the encoder contract:
/// `encode(input, output manifest, segment duration) -> success | failure`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeRequest {
    /// Raw video to convert
    pub input_path: PathBuf,
    /// Manifest to produce; segments land in the same directory
    pub output_manifest_path: PathBuf,
    /// Target segment length
    pub segment_duration_secs: u32,
}

impl EncodeRequest {
    pub fn new(input_path: PathBuf, output_manifest_path: PathBuf, segment_duration_secs: u32) -> Self {
        Self {
            input_path,
            output_manifest_path,
            segment_duration_secs,
        }
    }

    /// Directory the encoder writes into
    pub fn output_dir(&self) -> &Path {
        self.output_manifest_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
    }
}

/// An external encoder service.
///
/// `encode` blocks until the encoder finishes; callers run it on a blocking
/// thread.
pub trait Encoder: Send + Sync {
    fn encode(&self, request: &EncodeRequest) -> Result<(), EncodeError>;
}

/// Encoder backed by an ffmpeg binary
#[derive(Debug, Clone)]
pub struct FfmpegHlsEncoder {
    program: String,
    timeout: Option<Duration>,
}

impl FfmpegHlsEncoder {
    /// `timeout_secs == 0` disables the limit
    pub fn new(program: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            program: program.into(),
            timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
        }
    }

}

impl Encoder for FfmpegHlsEncoder {
    fn encode(&self, request: &EncodeRequest) -> Result<(), EncodeError> {
        let log = File::create(request.output_dir().join(ENCODER_LOG_FILE))?;

        let mut cmd = build_ffmpeg_command(&self.program, request);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log));

        tracing::debug!(program = %self.program, input = ?request.input_path, "Starting encoder");
        let child = cmd.spawn().map_err(EncodeError::Spawn)?;
        let status = wait_with_timeout(child, self.timeout)?;
        check_status(status)?;
        verify_manifest(&request.output_manifest_path)?;

        remove_encoder_log(request.output_dir());
        Ok(())
    }
}

/// Drop the stderr log of a successful run. Returns false if it stayed.
fn remove_encoder_log(dir: &Path) -> bool {
    let log = dir.join(ENCODER_LOG_FILE);
    match std::fs::remove_file(&log) {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(path = ?log, "Could not remove encoder log: {}", e);
            false
        }
    }
}

/// Build an ffmpeg command producing a VOD HLS playlist
///
/// Video is re-encoded to H.264 and audio to AAC so any allow-listed
/// container becomes playable by hls.js and native HLS players alike.
pub fn build_ffmpeg_command(program: &str, request: &EncodeRequest) -> Command {
    let mut cmd = Command::new(program);

    cmd.arg("-nostdin").arg("-y");
    cmd.arg("-loglevel").arg("error");
    cmd.arg("-i").arg(&request.input_path);

    cmd.arg("-c:v").arg("libx264");
    cmd.arg("-preset").arg("veryfast");
    cmd.arg("-c:a").arg("aac");

    // Keyframe at every segment boundary so segments start cleanly
    cmd.arg("-force_key_frames").arg(format!(
        "expr:gte(t,n_forced*{})",
        request.segment_duration_secs
    ));

    cmd.arg("-f").arg("hls");
    cmd.arg("-hls_time")
        .arg(request.segment_duration_secs.to_string());
    cmd.arg("-hls_playlist_type").arg("vod");
    cmd.arg("-hls_segment_filename")
        .arg(request.output_dir().join(SEGMENT_PATTERN));

    cmd.arg(&request.output_manifest_path);

    cmd
}

/// Wait for a child, killing it once `timeout` elapses
pub fn wait_with_timeout(
    mut child: Child,
    timeout: Option<Duration>,
) -> Result<ExitStatus, EncodeError> {
    let Some(timeout) = timeout else {
        return Ok(child.wait()?);
    };

    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(EncodeError::TimedOut(timeout.as_secs()));
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

fn check_status(status: ExitStatus) -> Result<(), EncodeError> {
    if status.success() {
        Ok(())
    } else {
        match status.code() {
            Some(code) => Err(EncodeError::Failed(code)),
            None => Err(EncodeError::Terminated),
        }
    }
}

/// The manifest must exist and be non-empty after a successful run
pub fn verify_manifest(path: &Path) -> Result<(), EncodeError> {
    match std::fs::metadata(path) {
        Ok(m) if m.is_file() && m.len() > 0 => Ok(()),
        _ => Err(EncodeError::MissingOutput(path.to_path_buf())),
    }
}

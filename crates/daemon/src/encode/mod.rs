//! External encoder contract and the ffmpeg HLS implementation

pub mod hls;

pub use hls::{build_ffmpeg_command, EncodeError, EncodeRequest, Encoder, FfmpegHlsEncoder};

//! mwah media daemon
//!
//! Serves a directory of videos over HTTP, converts raw files into HLS
//! streaming assets on demand and optionally exposes the server through a
//! public tunnel.

pub mod catalog;
pub mod concurrency;
pub mod control_server;
pub mod encode;
pub mod jobs;
pub mod media_server;
pub mod publish;
pub mod range;
pub mod service;
pub mod startup;
pub mod status;
pub mod tunnel;

pub use mwah_config as config;
pub use mwah_config::Config;
pub use catalog::{CatalogError, MediaCatalog, Resolved, SourceAsset, StreamingAsset};
pub use concurrency::{derive_plan, ConcurrencyPlan};
pub use control_server::{create_control_router, run_control_server, AppState};
pub use encode::{build_ffmpeg_command, EncodeError, EncodeRequest, Encoder, FfmpegHlsEncoder};
pub use jobs::{JobError, JobHandle, JobState, TranscodeJobManager};
pub use media_server::{create_media_router, MediaServer, ServerBinding, ServerError};
pub use service::{MediaService, ServiceError};
pub use startup::{check_encoder_available, parse_ffmpeg_version, run_startup_checks, StartupError};
pub use status::{new_shared_status, JobView, SharedStatus, StatusSnapshot};
pub use tunnel::{DisabledTunnel, NgrokTunnel, TunnelError, TunnelProvider};

//! Process-wide media service.
//!
//! Wires configuration, catalog, job manager, media server, control API and
//! tunnel together. The media server binding and the tunnel attempt are
//! each initialized at most once per process.

use crate::catalog::{CatalogError, MediaCatalog};
use crate::concurrency::{derive_plan, ConcurrencyPlan};
use crate::config::{Config, ConfigError};
use crate::control_server::{run_control_server, AppState};
use crate::encode::{Encoder, FfmpegHlsEncoder};
use crate::jobs::TranscodeJobManager;
use crate::media_server::{self, MediaServer, ServerBinding, ServerError};
use crate::startup::run_startup_checks;
use crate::status::{new_shared_status, SharedStatus};
use crate::tunnel::{provider_from_config, TunnelError, TunnelProvider};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OnceCell;

/// Error type for service operations
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Media root unusable
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// Media server could not bind
    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    /// Control API address did not parse
    #[error("Invalid control address '{0}'")]
    ControlAddr(String),
}

/// Runtime state shared by every part of the service
pub struct MediaService {
    config: Config,
    plan: ConcurrencyPlan,
    manager: Arc<TranscodeJobManager>,
    status: SharedStatus,
    tunnel: Box<dyn TunnelProvider>,
    server: OnceCell<MediaServer>,
    public_url: OnceCell<String>,
}

impl MediaService {
    /// Build the service with the ffmpeg encoder and the configured tunnel
    pub fn new(config: Config) -> Result<Self, ServiceError> {
        let encoder = Arc::new(FfmpegHlsEncoder::new(
            config.encoder.program.clone(),
            config.encoder.timeout_secs,
        ));
        let tunnel = provider_from_config(&config.tunnel);
        Self::with_parts(config, encoder, tunnel)
    }

    /// Build the service around a given encoder and tunnel provider
    pub fn with_parts(
        config: Config,
        encoder: Arc<dyn Encoder>,
        tunnel: Box<dyn TunnelProvider>,
    ) -> Result<Self, ServiceError> {
        config.validate()?;

        let catalog = MediaCatalog::open(&config.media.root, config.normalized_extensions())?;
        let plan = derive_plan(&config);
        let status = new_shared_status();
        let manager = Arc::new(TranscodeJobManager::new(
            catalog,
            encoder,
            config.encoder.segment_duration_secs,
            plan.max_concurrent_jobs as usize,
            status.clone(),
        ));

        tracing::info!(
            root = %config.media.root.display(),
            cores = plan.total_cores,
            max_concurrent_jobs = plan.max_concurrent_jobs,
            "Media service initialized"
        );

        Ok(Self {
            config,
            plan,
            manager,
            status,
            tunnel,
            server: OnceCell::new(),
            public_url: OnceCell::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn concurrency_plan(&self) -> &ConcurrencyPlan {
        &self.plan
    }

    pub fn manager(&self) -> Arc<TranscodeJobManager> {
        Arc::clone(&self.manager)
    }

    pub fn status(&self) -> SharedStatus {
        self.status.clone()
    }

    /// Binding of the media server, if it has been started
    pub fn binding(&self) -> Option<ServerBinding> {
        self.server.get().map(|s| s.binding().clone())
    }

    /// Start the media server, or return the existing binding.
    ///
    /// Concurrent first calls bind exactly once.
    pub async fn start_media_server(&self) -> Result<ServerBinding, ServiceError> {
        let server = self
            .server
            .get_or_try_init(|| async {
                let server = media_server::start(
                    self.manager.catalog().root().to_path_buf(),
                    &self.config.server.host,
                    self.config.server.port_range_start,
                    self.config.server.port_range_end,
                )
                .await?;
                self.status.write().await.media_url = Some(server.binding().url());
                Ok::<_, ServerError>(server)
            })
            .await?;
        Ok(server.binding().clone())
    }

    /// URL the media is reachable at: the public tunnel URL if the single
    /// tunnel attempt succeeded, otherwise the local server URL.
    pub async fn open_tunnel(&self) -> Result<String, ServiceError> {
        let binding = self.start_media_server().await?;
        let url = self
            .public_url
            .get_or_init(|| async {
                match self.tunnel.open(binding.port).await {
                    Ok(public_url) => {
                        tracing::info!(url = %public_url, "Public tunnel open");
                        self.status.write().await.public_url = Some(public_url.clone());
                        public_url
                    }
                    Err(TunnelError::Disabled) => binding.url(),
                    Err(e) => {
                        tracing::warn!("Public tunnel unavailable, using local URL: {}", e);
                        binding.url()
                    }
                }
            })
            .await;
        Ok(url.clone())
    }

    /// Start everything and serve until Ctrl-C.
    ///
    /// Only a failure to bind the media server is fatal.
    pub async fn run(&self) -> Result<(), ServiceError> {
        run_startup_checks(&self.config);

        let binding = self.start_media_server().await?;

        let control_addr: SocketAddr = self
            .config
            .server
            .control_addr
            .parse()
            .map_err(|_| ServiceError::ControlAddr(self.config.server.control_addr.clone()))?;
        let state = AppState {
            manager: self.manager(),
            status: self.status(),
        };
        let control = tokio::spawn(async move {
            if let Err(e) = run_control_server(control_addr, state).await {
                tracing::error!("Control API error: {}", e);
            }
        });

        let url = self.open_tunnel().await?;
        tracing::info!(local = %binding.url(), url = %url, "Serving media");

        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        }
        tracing::info!("Shutting down");

        control.abort();
        if let Some(server) = self.server.get() {
            server.abort();
        }
        Ok(())
    }
}

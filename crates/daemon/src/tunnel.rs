//! Public tunnel providers.
//!
//! A provider turns a local port into a publicly reachable URL. The service
//! makes a single attempt per process and falls back to the local URL.

use crate::config::TunnelConfig;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};

/// Environment variable ngrok reads its credentials from
pub const NGROK_TOKEN_ENV: &str = "NGROK_AUTHTOKEN";

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Why no public URL could be obtained
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Public tunnel is disabled")]
    Disabled,

    #[error("NGROK_AUTHTOKEN is not set")]
    MissingToken,

    #[error("Failed to start tunnel agent: {0}")]
    Spawn(std::io::Error),

    #[error("Tunnel agent exited with {0:?} before publishing a URL")]
    Exited(Option<i32>),

    #[error("No public URL after {0} seconds")]
    Timeout(u64),
}

/// Makes a local port publicly reachable
#[async_trait]
pub trait TunnelProvider: Send + Sync {
    /// Open a tunnel to `local_port` and return its public URL
    async fn open(&self, local_port: u16) -> Result<String, TunnelError>;
}

/// Provider used when tunneling is turned off
#[derive(Debug, Default)]
pub struct DisabledTunnel;

#[async_trait]
impl TunnelProvider for DisabledTunnel {
    async fn open(&self, _local_port: u16) -> Result<String, TunnelError> {
        Err(TunnelError::Disabled)
    }
}

/// Runs the ngrok agent and reads the public URL from its local API
#[derive(Debug)]
pub struct NgrokTunnel {
    program: String,
    api_url: String,
    auth_token: Option<String>,
    startup_timeout: Duration,
    child: Mutex<Option<Child>>,
}

#[derive(Debug, Deserialize)]
struct AgentTunnels {
    #[serde(default)]
    tunnels: Vec<AgentTunnel>,
}

#[derive(Debug, Deserialize)]
struct AgentTunnel {
    public_url: String,
    #[serde(default)]
    config: Option<AgentTunnelConfig>,
}

#[derive(Debug, Deserialize)]
struct AgentTunnelConfig {
    #[serde(default)]
    addr: String,
}

impl NgrokTunnel {
    /// Build from configuration, taking the token from the environment
    pub fn from_config(cfg: &TunnelConfig) -> Self {
        let auth_token = std::env::var(NGROK_TOKEN_ENV)
            .ok()
            .filter(|t| !t.trim().is_empty());
        Self::new(
            cfg.program.clone(),
            cfg.api_url.clone(),
            auth_token,
            Duration::from_secs(cfg.startup_timeout_secs),
        )
    }

    pub fn new(
        program: impl Into<String>,
        api_url: impl Into<String>,
        auth_token: Option<String>,
        startup_timeout: Duration,
    ) -> Self {
        Self {
            program: program.into(),
            api_url: api_url.into(),
            auth_token,
            startup_timeout,
            child: Mutex::new(None),
        }
    }

    /// Exit code of the agent if it has already exited
    fn agent_exit(&self) -> Option<Option<i32>> {
        let mut guard = self.child.lock().ok()?;
        let child = guard.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => Some(status.code()),
            Ok(None) => None,
            Err(e) => {
                tracing::debug!("Cannot poll tunnel agent: {}", e);
                None
            }
        }
    }

    fn stop_agent(&self) {
        if let Ok(mut guard) = self.child.lock() {
            if let Some(mut child) = guard.take() {
                let _ = child.start_kill();
            }
        }
    }

    async fn fetch_public_url(&self, client: &reqwest::Client, local_port: u16) -> Option<String> {
        let response = match client.get(&self.api_url).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!("Tunnel agent API not ready: {}", e);
                return None;
            }
        };
        let tunnels: AgentTunnels = response.json().await.ok()?;
        select_public_url(&tunnels.tunnels, local_port)
    }
}

/// Pick the tunnel forwarding to `local_port`, preferring https
fn select_public_url(tunnels: &[AgentTunnel], local_port: u16) -> Option<String> {
    let port_suffix = format!(":{}", local_port);
    let matching: Vec<&AgentTunnel> = tunnels
        .iter()
        .filter(|t| {
            t.config
                .as_ref()
                .map_or(true, |c| c.addr.is_empty() || c.addr.ends_with(&port_suffix))
        })
        .collect();

    matching
        .iter()
        .find(|t| t.public_url.starts_with("https://"))
        .or_else(|| matching.first())
        .map(|t| t.public_url.clone())
}

#[async_trait]
impl TunnelProvider for NgrokTunnel {
    async fn open(&self, local_port: u16) -> Result<String, TunnelError> {
        let token = self.auth_token.as_ref().ok_or(TunnelError::MissingToken)?;

        let port = local_port.to_string();
        let child = Command::new(&self.program)
            .args(["http", port.as_str()])
            .env(NGROK_TOKEN_ENV, token)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(TunnelError::Spawn)?;
        if let Ok(mut guard) = self.child.lock() {
            *guard = Some(child);
        }
        tracing::debug!(program = %self.program, local_port, "Started tunnel agent");

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .unwrap_or_default();
        let deadline = tokio::time::Instant::now() + self.startup_timeout;

        loop {
            if let Some(url) = self.fetch_public_url(&client, local_port).await {
                return Ok(url);
            }
            if let Some(code) = self.agent_exit() {
                self.stop_agent();
                return Err(TunnelError::Exited(code));
            }
            if tokio::time::Instant::now() >= deadline {
                self.stop_agent();
                return Err(TunnelError::Timeout(self.startup_timeout.as_secs()));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/// Provider selected by configuration
pub fn provider_from_config(cfg: &TunnelConfig) -> Box<dyn TunnelProvider> {
    if cfg.enabled {
        Box::new(NgrokTunnel::from_config(cfg))
    } else {
        Box::new(DisabledTunnel)
    }
}

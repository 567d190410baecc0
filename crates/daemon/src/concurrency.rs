//! Concurrency planning module
//!
//! Derives the size of the encoder worker pool from CPU core count and configuration.

use crate::config::Config;

/// Upper bound for the derived pool size; explicit configuration may exceed it
const MAX_DERIVED_JOBS: u32 = 4;

/// Concurrency plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Maximum number of encoder processes running at once
    pub max_concurrent_jobs: u32,
}

impl ConcurrencyPlan {
    /// Derive a concurrency plan from configuration
    ///
    /// Uses the following rules:
    /// - Detects CPU cores via num_cpus
    /// - Uses `encoder.max_concurrent_jobs` when non-zero
    /// - Otherwise one job per 4 cores, at least 1 and at most 4
    pub fn derive(cfg: &Config) -> Self {
        Self::derive_with_cores(cfg, num_cpus::get() as u32)
    }

    /// Same as [`ConcurrencyPlan::derive`] with an explicit core count
    pub fn derive_with_cores(cfg: &Config, total_cores: u32) -> Self {
        let max_concurrent_jobs = if cfg.encoder.max_concurrent_jobs > 0 {
            cfg.encoder.max_concurrent_jobs
        } else {
            derive_max_jobs(total_cores)
        };

        Self {
            total_cores,
            max_concurrent_jobs,
        }
    }
}

/// One encoder per 4 cores, clamped to [1, MAX_DERIVED_JOBS]
///
/// x264 already spreads one encode across all cores, so more parallel jobs
/// mostly add memory pressure.
fn derive_max_jobs(cores: u32) -> u32 {
    (cores / 4).clamp(1, MAX_DERIVED_JOBS)
}

/// Public function to derive a concurrency plan from configuration
pub fn derive_plan(cfg: &Config) -> ConcurrencyPlan {
    ConcurrencyPlan::derive(cfg)
}

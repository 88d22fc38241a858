// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

use crate::channel::InstancePolicy;
use crate::paginate::DelayRange;
use crate::refresh::StaleSessionPolicy;

/// Relay between HTTP callers and browser-resident agents.
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "tether", version, about)]
pub struct RelayConfig {
    /// Host to bind on.
    #[arg(long, default_value = "127.0.0.1", env = "TETHER_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 9870, env = "TETHER_PORT")]
    pub port: u16,

    /// Bearer token for API and agent auth. If unset, auth is disabled.
    #[arg(long, env = "TETHER_AUTH_TOKEN")]
    pub auth_token: Option<String>,

    /// Default time budget for one dispatched request, in seconds.
    #[arg(long, default_value_t = 60, env = "TETHER_DISPATCH_TIMEOUT_SECS")]
    pub dispatch_timeout_secs: u64,

    /// Time budget for a credential refresh round trip, in seconds.
    #[arg(long, default_value_t = 30, env = "TETHER_REFRESH_TIMEOUT_SECS")]
    pub refresh_timeout_secs: u64,

    /// Lower bound of the randomized delay between pages, in milliseconds.
    #[arg(long, default_value_t = 1500, env = "TETHER_PAGE_DELAY_MIN_MS")]
    pub page_delay_min_ms: u64,

    /// Upper bound of the randomized delay between pages, in milliseconds.
    #[arg(long, default_value_t = 4000, env = "TETHER_PAGE_DELAY_MAX_MS")]
    pub page_delay_max_ms: u64,

    /// Page size used when a caller does not pick one.
    #[arg(long, default_value_t = 20, env = "TETHER_BATCH_SIZE")]
    pub batch_size: usize,

    /// Route to any instance of the owner when the requested instance is gone.
    #[arg(long, env = "TETHER_INSTANCE_FALLBACK")]
    pub instance_fallback: bool,

    /// Upstream status codes that indicate a stale browser session.
    #[arg(long, value_delimiter = ',', default_value = "401,403", env = "TETHER_STALE_STATUS")]
    pub stale_status: Vec<u16>,

    /// Upstream business error codes (top-level `code` field) that indicate a stale session.
    #[arg(long, value_delimiter = ',', env = "TETHER_STALE_CODES")]
    pub stale_codes: Vec<String>,

    /// Directory for persisted credential snapshots.
    #[arg(long, env = "TETHER_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Log format (json or text).
    #[arg(long, default_value = "text", env = "TETHER_LOG_FORMAT")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "TETHER_LOG_LEVEL")]
    pub log_level: String,
}

impl RelayConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.page_delay_min_ms > self.page_delay_max_ms {
            anyhow::bail!(
                "--page-delay-min-ms ({}) must not exceed --page-delay-max-ms ({})",
                self.page_delay_min_ms,
                self.page_delay_max_ms
            );
        }
        if self.batch_size == 0 {
            anyhow::bail!("--batch-size must be at least 1");
        }
        if self.dispatch_timeout_secs == 0 {
            anyhow::bail!("--dispatch-timeout-secs must be at least 1");
        }
        Ok(())
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }

    pub fn page_delay(&self) -> DelayRange {
        DelayRange::from_millis(self.page_delay_min_ms, self.page_delay_max_ms)
    }

    pub fn instance_policy(&self) -> InstancePolicy {
        if self.instance_fallback {
            InstancePolicy::AllowFallback
        } else {
            InstancePolicy::Exact
        }
    }

    pub fn stale_policy(&self) -> StaleSessionPolicy {
        StaleSessionPolicy::new(self.stale_status.clone(), self.stale_codes.clone())
    }

    /// Resolve the state directory.
    ///
    /// Checks `--state-dir`, then `$XDG_STATE_HOME/tether`, then
    /// `$HOME/.local/state/tether`.
    pub fn state_dir(&self) -> PathBuf {
        if let Some(ref dir) = self.state_dir {
            return dir.clone();
        }
        if let Ok(xdg) = std::env::var("XDG_STATE_HOME") {
            return PathBuf::from(xdg).join("tether");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".local/state/tether");
        }
        PathBuf::from(".tether")
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

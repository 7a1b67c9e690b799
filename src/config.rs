//! Configuration
//!
//! Resolution order: built-in defaults, then an optional YAML file, then
//! `LOT_TRACE_*` environment variables (a `.env` file is honoured).

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Runtime settings for the store client and orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    /// Base URL of the ledger gateway used by `HttpLotStore`.
    pub store_url: String,
    /// Upper bound on waiting for a write to be confirmed.
    pub confirm_timeout_ms: u64,
    /// How often `HttpLotStore` polls a pending transaction.
    pub confirm_poll_interval_ms: u64,
    /// Budget multiplier applied to the cost estimate of a lot creation.
    pub create_cost_multiplier: f64,
    /// Budget multiplier applied to the cost estimate of a stage write.
    pub stage_cost_multiplier: f64,
    /// Candidate lot ids tried before giving up on a collision-free one.
    pub lot_id_attempts: u32,
    /// Bind address for the REST surface.
    pub listen_addr: String,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            store_url: "http://localhost:8545".to_string(),
            confirm_timeout_ms: 60_000,
            confirm_poll_interval_ms: 1_000,
            create_cost_multiplier: 1.0,
            stage_cost_multiplier: 2.0,
            lot_id_attempts: 8,
            listen_addr: "127.0.0.1:3000".to_string(),
        }
    }
}

impl TraceConfig {
    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }

    pub fn confirm_poll_interval(&self) -> Duration {
        Duration::from_millis(self.confirm_poll_interval_ms)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.confirm_timeout_ms == 0 {
            bail!("confirm_timeout_ms must be greater than zero");
        }
        if self.confirm_poll_interval_ms == 0 {
            bail!("confirm_poll_interval_ms must be greater than zero");
        }
        for (name, value) in [
            ("create_cost_multiplier", self.create_cost_multiplier),
            ("stage_cost_multiplier", self.stage_cost_multiplier),
        ] {
            if !value.is_finite() || value < 1.0 {
                bail!("{name} must be a finite value >= 1.0, got {value}");
            }
        }
        if self.lot_id_attempts == 0 {
            bail!("lot_id_attempts must be at least 1");
        }
        if self.store_url.trim().is_empty() {
            bail!("store_url must not be empty");
        }
        Ok(())
    }

    /// Apply `LOT_TRACE_*` overrides read through `lookup`.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("LOT_TRACE_STORE_URL") {
            self.store_url = v;
        }
        if let Some(v) = lookup("LOT_TRACE_CONFIRM_TIMEOUT_MS") {
            self.confirm_timeout_ms = v
                .parse()
                .with_context(|| format!("LOT_TRACE_CONFIRM_TIMEOUT_MS: invalid value '{v}'"))?;
        }
        if let Some(v) = lookup("LOT_TRACE_CONFIRM_POLL_INTERVAL_MS") {
            self.confirm_poll_interval_ms = v.parse().with_context(|| {
                format!("LOT_TRACE_CONFIRM_POLL_INTERVAL_MS: invalid value '{v}'")
            })?;
        }
        if let Some(v) = lookup("LOT_TRACE_CREATE_COST_MULTIPLIER") {
            self.create_cost_multiplier = v.parse().with_context(|| {
                format!("LOT_TRACE_CREATE_COST_MULTIPLIER: invalid value '{v}'")
            })?;
        }
        if let Some(v) = lookup("LOT_TRACE_STAGE_COST_MULTIPLIER") {
            self.stage_cost_multiplier = v.parse().with_context(|| {
                format!("LOT_TRACE_STAGE_COST_MULTIPLIER: invalid value '{v}'")
            })?;
        }
        if let Some(v) = lookup("LOT_TRACE_LOT_ID_ATTEMPTS") {
            self.lot_id_attempts = v
                .parse()
                .with_context(|| format!("LOT_TRACE_LOT_ID_ATTEMPTS: invalid value '{v}'"))?;
        }
        if let Some(v) = lookup("LOT_TRACE_LISTEN_ADDR") {
            self.listen_addr = v;
        }
        Ok(())
    }
}

/// Loads [`TraceConfig`] from file and environment.
pub struct ConfigLoader {
    path: Option<String>,
}

impl ConfigLoader {
    pub fn new(path: Option<impl Into<String>>) -> Self {
        Self {
            path: path.map(Into::into),
        }
    }

    /// Create loader from LOT_TRACE_CONFIG env var, if set
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self::new(std::env::var("LOT_TRACE_CONFIG").ok())
    }

    pub fn load(&self) -> Result<TraceConfig> {
        self.load_with(|key| std::env::var(key).ok())
    }

    fn load_with(&self, lookup: impl Fn(&str) -> Option<String>) -> Result<TraceConfig> {
        let mut config = match &self.path {
            Some(path) => Self::load_file(Path::new(path))?,
            None => TraceConfig::default(),
        };
        config.apply_overrides(lookup)?;
        config.validate()?;

        info!(
            store_url = %config.store_url,
            confirm_timeout_ms = config.confirm_timeout_ms,
            create_cost_multiplier = config.create_cost_multiplier,
            stage_cost_multiplier = config.stage_cost_multiplier,
            "Loaded lot-trace configuration"
        );
        Ok(config)
    }

    fn load_file(path: &Path) -> Result<TraceConfig> {
        info!("Loading configuration from {}", path.display());
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }
}

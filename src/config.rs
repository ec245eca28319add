//! Configuration management for the transaction submitter
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::retry::RetryPolicy;
use crate::tx::SpeedTier;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub submitter: SubmitterConfig,
    pub chain: ChainConfig,
    #[serde(default)]
    pub sequence: SequenceConfig,
    #[serde(default)]
    pub fees: FeeConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub metrics: MetricsConfig,
    pub wallet: WalletConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitterConfig {
    pub instance_id: String,
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_urls: Vec<String>,
    #[serde(default = "default_gas_price_strategy")]
    pub gas_price_strategy: GasPriceStrategy,
    #[serde(default = "default_priority_fee_gwei")]
    pub priority_fee_gwei: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum GasPriceStrategy {
    Legacy,
    Eip1559,
    Arbitrum,
    Optimism,
}

/// Nonce bookkeeping
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SequenceConfig {
    /// Default reservation lifetime
    pub reservation_ttl_secs: u64,
    /// Account state older than this is resynced before allocating
    pub freshness_secs: u64,
    /// Interval of the expiry sweep
    pub sweep_interval_secs: u64,
    /// Idle accounts without reservations are dropped after this
    pub idle_gc_secs: u64,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            reservation_ttl_secs: 300,
            freshness_secs: 30,
            sweep_interval_secs: 10,
            idle_gc_secs: 3600,
        }
    }
}

impl SequenceConfig {
    pub fn reservation_ttl(&self) -> Duration {
        Duration::from_secs(self.reservation_ttl_secs)
    }

    pub fn freshness(&self) -> Duration {
        Duration::from_secs(self.freshness_secs)
    }

    pub fn idle_gc(&self) -> Duration {
        Duration::from_secs(self.idle_gc_secs)
    }
}

/// Fee estimation
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeeConfig {
    /// Buffer percentage for gas limit (e.g., 10 = 10% buffer)
    pub gas_limit_buffer_percent: u64,
    pub slow_premium_percent: u64,
    pub standard_premium_percent: u64,
    pub fast_premium_percent: u64,
    /// Minimum bump accepted by the ledger for replace-by-fee
    pub replacement_bump_percent: u64,
    pub max_gas_price_gwei: u64,
    pub cache_ttl_secs: u64,
    pub history_size: usize,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            gas_limit_buffer_percent: 10,
            slow_premium_percent: 0,
            standard_premium_percent: 10,
            fast_premium_percent: 25,
            replacement_bump_percent: 10,
            max_gas_price_gwei: 500,
            cache_ttl_secs: 15,
            history_size: 100,
        }
    }
}

impl FeeConfig {
    pub fn premium_percent(&self, tier: SpeedTier) -> u64 {
        match tier {
            SpeedTier::Slow => self.slow_premium_percent,
            SpeedTier::Standard => self.standard_premium_percent,
            SpeedTier::Fast => self.fast_premium_percent,
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Overrides for the two retry presets
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub transaction: RetryProfileConfig,
    pub rpc: RetryProfileConfig,
}

impl RetryConfig {
    pub fn transaction_policy(&self) -> RetryPolicy {
        self.transaction.apply(RetryPolicy::transaction())
    }

    pub fn rpc_policy(&self) -> RetryPolicy {
        self.rpc.apply(RetryPolicy::rpc_query())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RetryProfileConfig {
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub jitter: Option<f64>,
}

impl RetryProfileConfig {
    fn apply(&self, mut policy: RetryPolicy) -> RetryPolicy {
        if let Some(max_attempts) = self.max_attempts {
            policy.max_attempts = max_attempts;
        }
        if let Some(ms) = self.base_delay_ms {
            policy.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = self.max_delay_ms {
            policy.max_delay = Duration::from_millis(ms);
        }
        if let Some(multiplier) = self.backoff_multiplier {
            policy.backoff_multiplier = multiplier;
        }
        if let Some(jitter) = self.jitter {
            policy.jitter = jitter;
        }
        policy
    }
}

/// End-to-end submission
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub inclusion_timeout_secs: u64,
    pub receipt_poll_interval_ms: u64,
    /// Gas limit used for zero-value cancel transfers
    pub cancel_gas_limit: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            inclusion_timeout_secs: 120,
            receipt_poll_interval_ms: 2000,
            cancel_gas_limit: 21_000,
        }
    }
}

impl PipelineConfig {
    pub fn inclusion_timeout(&self) -> Duration {
        Duration::from_secs(self.inclusion_timeout_secs)
    }

    pub fn receipt_poll_interval(&self) -> Duration {
        Duration::from_millis(self.receipt_poll_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    /// Environment variables holding the managed accounts' private keys
    pub private_key_envs: Vec<String>,
}

fn default_reconcile_interval_secs() -> u64 {
    60
}

fn default_gas_price_strategy() -> GasPriceStrategy {
    GasPriceStrategy::Eip1559
}

fn default_priority_fee_gwei() -> u64 {
    2
}

impl Settings {
    /// Load settings from the configured file
    pub fn load() -> Result<Self> {
        let config_path = env::var("TX_SUBMITTER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    /// Parse settings from TOML text
    pub fn parse(config_str: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(config_str)?;

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.chain.rpc_urls.is_empty() {
            anyhow::bail!("Chain {} has no RPC URLs configured", self.chain.name);
        }

        if self.wallet.private_key_envs.is_empty() {
            anyhow::bail!("At least one managed account key must be configured");
        }

        if self.fees.max_gas_price_gwei == 0 {
            anyhow::bail!("fees.max_gas_price_gwei must be positive");
        }

        if self.sequence.reservation_ttl_secs == 0 {
            anyhow::bail!("sequence.reservation_ttl_secs must be positive");
        }

        for (name, policy) in [
            ("transaction", self.retry.transaction_policy()),
            ("rpc", self.retry.rpc_policy()),
        ] {
            if policy.max_attempts == 0 {
                anyhow::bail!("retry.{}.max_attempts must be at least 1", name);
            }
            if policy.base_delay > policy.max_delay {
                anyhow::bail!("retry.{} base delay exceeds max delay", name);
            }
        }

        if self.database.is_none() {
            tracing::warn!("No database configured - submission log is in-memory only");
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}")?;

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
        [submitter]
        instance_id = "submitter-1"

        [chain]
        chain_id = 11155111
        name = "sepolia"
        rpc_urls = ["${TX_SUBMITTER_TEST_RPC}"]

        [wallet]
        private_key_envs = ["SIGNER_KEY_0"]

        [retry.transaction]
        max_attempts = 4
    "#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input).unwrap();
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn test_load_applies_defaults_and_overrides() {
        env::set_var("TX_SUBMITTER_TEST_RPC", "http://localhost:8545");

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.chain.rpc_urls, vec!["http://localhost:8545"]);
        assert_eq!(settings.chain.gas_price_strategy, GasPriceStrategy::Eip1559);
        assert_eq!(settings.sequence.reservation_ttl_secs, 300);
        assert_eq!(settings.fees.fast_premium_percent, 25);
        assert_eq!(settings.retry.transaction_policy().max_attempts, 4);
        assert_eq!(settings.retry.rpc_policy(), RetryPolicy::rpc_query());
        assert!(settings.database.is_none());
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let broken = MINIMAL.replace("max_attempts = 4", "max_attempts = 0");
        assert!(Settings::parse(&broken).is_err());
    }
}

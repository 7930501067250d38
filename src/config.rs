//! Configuration loader and validator for the broadcast bot.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::resolver::ResolverOptions;
use crate::worker::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub telegram: Telegram,
    pub delivery: Delivery,
    pub filter: Filter,
    pub roster: Roster,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
    /// Tenant every captured roster entry belongs to.
    pub tenant_id: String,
}

/// Telegram bot settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Telegram {
    pub bot_token: String,
}

/// Delivery pipeline tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Delivery {
    pub batch_size: usize,
    pub workers: usize,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_seconds: u64,
    pub lease_seconds: u64,
    /// Recipients of one work unit sent in parallel.
    #[serde(default = "default_unit_concurrency")]
    pub unit_concurrency: usize,
}

fn default_unit_concurrency() -> usize {
    8
}

/// Tenant gate applied to captured events and resolved recipients.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Filter {
    #[serde(default)]
    pub disable_tenant_filter: bool,
    #[serde(default)]
    pub allowed_tenants: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Roster {
    pub page_size: u32,
}

/// Boolean gate deciding whether a tenant is served at all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TenantFilter {
    disabled: bool,
    allowed: Vec<String>,
}

impl TenantFilter {
    pub fn new(disabled: bool, allowed: impl IntoIterator<Item = String>) -> Self {
        Self {
            disabled,
            allowed: allowed
                .into_iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
        }
    }

    /// Filter that admits every tenant.
    pub fn open() -> Self {
        Self::new(true, Vec::new())
    }

    pub fn allows(&self, tenant_id: &str) -> bool {
        self.disabled || self.allowed.iter().any(|t| t == tenant_id)
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/communicator.db", self.app.data_dir))
    }

    pub fn tenant_filter(&self) -> TenantFilter {
        TenantFilter::new(
            self.filter.disable_tenant_filter,
            self.filter.allowed_tenants.iter().cloned(),
        )
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.delivery.max_attempts,
            base_delay: Duration::from_millis(self.delivery.base_backoff_ms),
            max_delay: Duration::from_secs(self.delivery.max_backoff_seconds),
        }
    }

    pub fn resolver_options(&self) -> ResolverOptions {
        ResolverOptions {
            page_size: self.roster.page_size,
            filter: self.tenant_filter(),
        }
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.delivery.lease_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.app.poll_interval_ms)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    if cfg.app.tenant_id.trim().is_empty() {
        return Err(ConfigError::Invalid("app.tenant_id must be non-empty"));
    }

    if cfg.telegram.bot_token.trim().is_empty() {
        return Err(ConfigError::Invalid("telegram.bot_token must be non-empty"));
    }

    let d = &cfg.delivery;
    if d.batch_size == 0 {
        return Err(ConfigError::Invalid("delivery.batch_size must be > 0"));
    }
    if d.workers == 0 {
        return Err(ConfigError::Invalid("delivery.workers must be > 0"));
    }
    if d.max_attempts == 0 {
        return Err(ConfigError::Invalid("delivery.max_attempts must be > 0"));
    }
    if d.lease_seconds == 0 {
        return Err(ConfigError::Invalid("delivery.lease_seconds must be > 0"));
    }
    if d.unit_concurrency == 0 {
        return Err(ConfigError::Invalid("delivery.unit_concurrency must be > 0"));
    }

    if !cfg.filter.disable_tenant_filter
        && cfg.filter.allowed_tenants.iter().all(|t| t.trim().is_empty())
    {
        return Err(ConfigError::Invalid(
            "filter.allowed_tenants must be set unless filter.disable_tenant_filter is true",
        ));
    }

    if cfg.roster.page_size == 0 {
        return Err(ConfigError::Invalid("roster.page_size must be > 0"));
    }

    Ok(())
}

/// Returns the example YAML content.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 500
  tenant_id: "contoso"

telegram:
  bot_token: "YOUR_TELEGRAM_BOT_TOKEN"

delivery:
  batch_size: 100
  workers: 4
  max_attempts: 5
  base_backoff_ms: 1000
  max_backoff_seconds: 60
  lease_seconds: 300
  unit_concurrency: 8

filter:
  disable_tenant_filter: false
  allowed_tenants:
    - "contoso"

roster:
  page_size: 500
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn example_cfg() -> Config {
        serde_yaml::from_str(example()).unwrap()
    }

    #[test]
    fn parse_example_ok() {
        validate(&example_cfg()).unwrap();
    }

    #[test]
    fn invalid_bot_token() {
        let mut cfg = example_cfg();
        cfg.telegram.bot_token = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("telegram.bot_token")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_delivery_bounds() {
        let mut cfg = example_cfg();
        cfg.delivery.batch_size = 0;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("batch_size")),
            _ => panic!("wrong error"),
        }

        let mut cfg = example_cfg();
        cfg.delivery.workers = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = example_cfg();
        cfg.delivery.max_attempts = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = example_cfg();
        cfg.delivery.unit_concurrency = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = example_cfg();
        cfg.roster.page_size = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn enabled_filter_needs_tenants() {
        let mut cfg = example_cfg();
        cfg.filter.allowed_tenants = vec![" ".into()];
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("allowed_tenants")),
            _ => panic!("wrong error"),
        }

        cfg.filter.disable_tenant_filter = true;
        validate(&cfg).unwrap();
    }

    #[test]
    fn tenant_filter_gate() {
        let f = TenantFilter::new(false, vec![" contoso ".to_string(), "".to_string()]);
        assert!(f.allows("contoso"));
        assert!(!f.allows("fabrikam"));
        assert!(!f.allows(""));

        assert!(TenantFilter::open().allows("anything"));
    }

    #[test]
    fn derived_settings() {
        let cfg = example_cfg();
        let policy = cfg.retry_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_millis(1000));
        assert_eq!(policy.max_delay, Duration::from_secs(60));
        assert_eq!(cfg.resolver_options().page_size, 500);
        assert_eq!(cfg.lease(), Duration::from_secs(300));
        assert_eq!(cfg.delivery.unit_concurrency, 8);
    }

    #[test]
    fn unit_concurrency_defaults_when_omitted() {
        let yaml = example().replace("  unit_concurrency: 8\n", "");
        let cfg: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(cfg.delivery.unit_concurrency, 8);
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg = example_cfg();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.app.tenant_id, "contoso");
        assert_eq!(cfg.filter.allowed_tenants, vec!["contoso".to_string()]);
    }
}

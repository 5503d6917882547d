//! Configuration for the price agent, loaded from TOML.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::entity::EntityKind;
use crate::proxy;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub limits: LimitsConfig,
    pub reconcile: ReconcileConfig,
    pub fetch: FetchConfig,
    pub proxy: ProxyConfig,
    pub http: HttpConfig,
    pub notify: NotifyConfig,
    pub logging: LoggingConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// No path means defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.fetch.attempts >= 1, "fetch.attempts must be at least 1");
        anyhow::ensure!(
            self.reconcile.interval_secs >= 1,
            "reconcile.interval_secs must be positive"
        );
        anyhow::ensure!(
            self.reconcile.concurrency >= 1,
            "reconcile.concurrency must be at least 1"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// sqlx connection url, e.g. `sqlite://pricewatch.db` or `sqlite::memory:`
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://pricewatch.db".to_string(),
        }
    }
}

/// Per-user caps on active subscriptions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_wishlists: usize,
    pub max_products: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_wishlists: 5,
            max_products: 5,
        }
    }
}

impl LimitsConfig {
    pub fn for_kind(&self, kind: EntityKind) -> usize {
        match kind {
            EntityKind::Wishlist => self.max_wishlists,
            EntityKind::Product => self.max_products,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub interval_secs: u64,
    /// Entities processed in parallel within one run.
    pub concurrency: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: 1800,
            concurrency: 2,
        }
    }
}

impl ReconcileConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub user_agent: String,
    /// Per attempt network timeout.
    pub timeout_ms: u64,
    pub attempts: u32,
    /// Lower bound of the jittered pause between attempts; 0 disables it.
    pub backoff_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout_ms: 4000,
            attempts: 3,
            backoff_ms: 600,
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub enabled: bool,
    pub endpoints: Vec<Url>,
    /// Extra endpoints, one per line.
    pub list_file: Option<PathBuf>,
}

impl ProxyConfig {
    /// Inline endpoints followed by the list file's, or nothing when disabled.
    pub fn resolve_endpoints(&self) -> Result<Vec<Url>> {
        if !self.enabled {
            return Ok(Vec::new());
        }
        let mut endpoints = self.endpoints.clone();
        if let Some(path) = &self.list_file {
            endpoints.extend(proxy::load_proxy_list(path)?);
        }
        Ok(endpoints)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// When unset, notifications are only logged.
    pub webhook_url: Option<Url>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is not set.
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_documented_defaults() {
        let c = Config::from_toml("").unwrap();
        assert_eq!(c.limits.max_wishlists, 5);
        assert_eq!(c.limits.max_products, 5);
        assert_eq!(c.reconcile.interval_secs, 1800);
        assert_eq!(c.fetch.timeout(), Duration::from_secs(4));
        assert_eq!(c.fetch.attempts, 3);
        assert!(!c.proxy.enabled);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let c = Config::from_toml(
            r#"
            [limits]
            max_products = 10

            [proxy]
            enabled = true
            endpoints = ["http://10.0.0.1:3128"]
            "#,
        )
        .unwrap();
        assert_eq!(c.limits.for_kind(EntityKind::Product), 10);
        assert_eq!(c.limits.for_kind(EntityKind::Wishlist), 5);
        assert_eq!(c.proxy.resolve_endpoints().unwrap().len(), 1);
    }

    #[test]
    fn disabled_proxies_resolve_to_nothing() {
        let c = Config::from_toml(
            r#"
            [proxy]
            endpoints = ["http://10.0.0.1:3128"]
            "#,
        )
        .unwrap();
        assert!(c.proxy.resolve_endpoints().unwrap().is_empty());
    }

    #[test]
    fn zero_attempts_is_rejected() {
        assert!(Config::from_toml("[fetch]\nattempts = 0").is_err());
    }
}

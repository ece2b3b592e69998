use crate::{indexer, retry::RetryPolicy};
use anyhow::{Context, Result};
use serde::Deserialize;
use solabi::ethprim::Address;
use std::{
    fmt::{self, Debug, Formatter},
    fs,
    path::Path,
    time::Duration,
};
use url::Url;

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub ethrpc: Url,
    pub database: Url,
    pub contract: Address,
    #[serde(default)]
    pub start_block: u64,
    #[serde(default)]
    pub scan: Scan,
    #[serde(default)]
    pub retry: Retry,
    #[serde(default)]
    pub live: Live,
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Scan {
    pub page_size: u64,
    pub request_delay_ms: u64,
    pub window_attempts: u32,
}

impl Default for Scan {
    fn default() -> Self {
        Self {
            page_size: 1000,
            request_delay_ms: 500,
            window_attempts: 5,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Retry {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub jitter: bool,
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2000,
            jitter: true,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Live {
    pub poll_interval_ms: u64,
}

impl Default for Live {
    fn default() -> Self {
        Self {
            poll_interval_ms: 4000,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let toml = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&toml)
    }

    fn parse(toml: &str) -> Result<Self> {
        let config: Self = toml::from_str(toml)?;
        anyhow::ensure!(config.scan.page_size > 0, "scan page size must be positive");
        anyhow::ensure!(
            config.scan.window_attempts > 0,
            "scan window attempts must be positive"
        );
        anyhow::ensure!(
            config.retry.max_attempts > 0,
            "retry max attempts must be positive"
        );
        Ok(config)
    }

    /// The indexer settings described by this configuration.
    pub fn settings(&self) -> indexer::Settings {
        indexer::Settings {
            start_block: self.start_block,
            scan: indexer::Scan {
                page_size: self.scan.page_size,
                request_delay: Duration::from_millis(self.scan.request_delay_ms),
                window_attempts: self.scan.window_attempts,
            },
            retry: RetryPolicy {
                max_attempts: self.retry.max_attempts,
                base_delay: Duration::from_millis(self.retry.base_delay_ms),
                jitter: self.retry.jitter,
            },
            live: indexer::Live {
                poll_interval: Duration::from_millis(self.live.poll_interval_ms),
                page_size: self.scan.page_size,
            },
        }
    }
}

impl Debug for Config {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Config")
            .field("ethrpc", &redacted(&self.ethrpc))
            .field("database", &redacted(&self.database))
            .field("contract", &self.contract)
            .field("start_block", &self.start_block)
            .field("scan", &self.scan)
            .field("retry", &self.retry)
            .field("live", &self.live)
            .finish()
    }
}

/// Formats a URL without its password.
fn redacted(url: &Url) -> String {
    let mut url = url.clone();
    if url.password().is_some() {
        // Only fails for URLs that cannot carry credentials in the first place.
        let _ = url.set_password(Some("********"));
    }
    url.to_string()
}

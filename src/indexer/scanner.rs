//! Historical catch-up: fetches each event's logs in fixed-size block windows
//! and applies them in chain order.

use super::pipeline::Pipeline;
use crate::{
    chain::ChainClient,
    database::Database,
    decoder::Signature,
};
use anyhow::{Context, Result};
use std::{cmp, sync::Arc, time::Duration};
use tokio::{sync::watch, time};

/// The catch-up scan configuration.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Scan {
    /// The number of blocks per `eth_getLogs` request.
    pub page_size: u64,
    /// Delay between consecutive window requests, to stay within provider
    /// rate limits.
    pub request_delay: Duration,
    /// How many times a window is attempted before the scan gives up.
    pub window_attempts: u32,
}

impl Default for Scan {
    fn default() -> Self {
        Self {
            page_size: 1000,
            request_delay: Duration::from_millis(500),
            window_attempts: 5,
        }
    }
}

/// How a scan ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Progress {
    Complete,
    Stopped,
}

pub struct Scanner {
    chain: Arc<dyn ChainClient>,
    database: Arc<dyn Database>,
    pipeline: Arc<Pipeline>,
    config: Scan,
}

impl Scanner {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        database: Arc<dyn Database>,
        pipeline: Arc<Pipeline>,
        config: Scan,
    ) -> Self {
        Self {
            chain,
            database,
            pipeline,
            config: Scan {
                page_size: config.page_size.max(1),
                window_attempts: config.window_attempts.max(1),
                ..config
            },
        }
    }

    /// Scans every event signature, parents first, over `[from, to]`.
    /// Signatures whose scan cursor is already past `from` resume after their
    /// cursor.
    pub async fn scan_all(
        &self,
        from: u64,
        to: u64,
        stop: &watch::Receiver<bool>,
    ) -> Result<Progress> {
        for (i, signature) in Signature::ALL.into_iter().enumerate() {
            if i > 0 {
                time::sleep(self.config.request_delay).await;
            }

            let start = match self.database.scan_cursor(signature.name()).await? {
                Some(cursor) if cursor >= from => cursor + 1,
                _ => from,
            };
            if start > to {
                tracing::debug!(%signature, cursor = %(start - 1), "already caught up");
                continue;
            }

            tracing::info!(%signature, from = %start, %to, "catching up");
            if self.scan(signature, start, to, stop).await? == Progress::Stopped {
                return Ok(Progress::Stopped);
            }
        }
        Ok(Progress::Complete)
    }

    /// Scans one event signature over the inclusive range `[from, to]`. The
    /// scan cursor for the signature is raised after every completed window.
    pub async fn scan(
        &self,
        signature: Signature,
        from: u64,
        to: u64,
        stop: &watch::Receiver<bool>,
    ) -> Result<Progress> {
        let mut start = from;
        while start <= to {
            if *stop.borrow() {
                tracing::info!(%signature, next = %start, "scan stopped");
                return Ok(Progress::Stopped);
            }

            let end = cmp::min(to, start.saturating_add(self.config.page_size - 1));
            self.window(signature, start, end).await?;
            self.database
                .set_scan_cursor(signature.name(), end)
                .await?;

            start = match end.checked_add(1) {
                Some(next) => next,
                None => break,
            };
            if start <= to {
                time::sleep(self.config.request_delay).await;
            }
        }
        Ok(Progress::Complete)
    }

    /// Fetches and applies one window, retrying the whole window with a
    /// pause in between when fetching or applying fails.
    async fn window(&self, signature: Signature, from: u64, to: u64) -> Result<()> {
        let pause = self.pipeline.retry().base_delay * 2;
        let mut attempt = 1;
        loop {
            match self.try_window(signature, from, to).await {
                Ok(count) => {
                    if count > 0 {
                        tracing::debug!(%signature, %from, %to, logs = %count, "indexed window");
                    }
                    return Ok(());
                }
                Err(err) if attempt >= self.config.window_attempts => {
                    return Err(err).with_context(|| {
                        format!("failed to scan {signature} logs in blocks {from}..={to}")
                    });
                }
                Err(err) => {
                    tracing::warn!(
                        %signature, %from, %to, %attempt, ?err,
                        "window failed, pausing before retrying"
                    );
                    time::sleep(pause).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn try_window(&self, signature: Signature, from: u64, to: u64) -> Result<usize> {
        let topic = self.pipeline.topic(signature);
        let chain = &self.chain;
        let logs = self
            .pipeline
            .retry()
            .execute("eth_getLogs", || chain.get_logs(topic, from, to))
            .await?;

        for log in &logs {
            self.pipeline.apply_log(log).await?;
        }
        Ok(logs.len())
    }
}

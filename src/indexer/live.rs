//! Live mode: one subscription and one consumer task per event signature.

use super::pipeline::Pipeline;
use crate::{
    chain::{ChainClient, LogBatch, RawLog, Subscriptions},
    checkpoint::Checkpoint,
    database::Outcome,
    decoder::Signature,
};
use anyhow::Result;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::{sync::mpsc, task::JoinHandle};

/// The live subscription configuration.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Live {
    pub poll_interval: Duration,
    /// Maximum number of blocks fetched per poll.
    pub page_size: u64,
}

pub struct LiveSubscriptions {
    subscriptions: Subscriptions,
    consumers: Vec<JoinHandle<()>>,
}

impl LiveSubscriptions {
    /// Subscribes to every event signature starting at block `from`.
    pub fn start_all(
        chain: Arc<dyn ChainClient>,
        pipeline: Arc<Pipeline>,
        checkpoint: Arc<Checkpoint>,
        from: u64,
        config: Live,
    ) -> Result<Self> {
        let subscriptions = Subscriptions::new(chain, config.poll_interval, config.page_size);
        let watermarks = Arc::new(Watermarks::new(from.saturating_sub(1)));

        let mut consumers = Vec::with_capacity(Signature::ALL.len());
        for signature in Signature::ALL {
            let (sender, receiver) = mpsc::unbounded_channel();
            let id = subscriptions.subscribe(pipeline.topic(signature), from, sender)?;
            tracing::debug!(%signature, ?id, %from, "subscribed");
            consumers.push(tokio::spawn(consume(
                signature,
                receiver,
                pipeline.clone(),
                checkpoint.clone(),
                watermarks.clone(),
            )));
        }

        tracing::info!(subscriptions = %consumers.len(), %from, "live subscriptions started");
        Ok(Self {
            subscriptions,
            consumers,
        })
    }

    /// Removes all subscriptions and waits for the consumers to finish the
    /// logs they already received.
    pub async fn stop_all(self) {
        self.subscriptions.unsubscribe_all();
        for consumer in self.consumers {
            if let Err(err) = consumer.await {
                tracing::warn!(?err, "live consumer panicked");
            }
        }
        tracing::info!("live subscriptions stopped");
    }
}

/// The highest block each signature has fully applied. The checkpoint may
/// only advance to the lowest of them.
struct Watermarks(Mutex<HashMap<Signature, u64>>);

impl Watermarks {
    fn new(block: u64) -> Self {
        Self(Mutex::new(
            Signature::ALL.into_iter().map(|s| (s, block)).collect(),
        ))
    }

    /// Records a watermark and returns the lowest one.
    fn update(&self, signature: Signature, block: u64) -> u64 {
        let mut marks = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        marks.insert(signature, block);
        marks.values().copied().min().unwrap_or(block)
    }
}

async fn consume(
    signature: Signature,
    mut batches: mpsc::UnboundedReceiver<LogBatch>,
    pipeline: Arc<Pipeline>,
    checkpoint: Arc<Checkpoint>,
    watermarks: Arc<Watermarks>,
) {
    // Set once a log is dropped; the watermark for this signature stays
    // below it so a restart picks the log up again.
    let mut frozen = None::<u64>;
    // Logs whose rows are not there yet because another signature's
    // subscription lags behind. Applied again with every batch.
    let mut deferred = Vec::<RawLog>::new();

    while let Some(batch) = batches.recv().await {
        let retried = std::mem::take(&mut deferred);
        for log in retried.iter().chain(&batch.logs) {
            match pipeline.apply_log(log).await {
                Ok(Some(Outcome::Missing(what))) => {
                    tracing::debug!(
                        %signature, block = %log.block_number, log_index = %log.log_index,
                        %what, "deferring live log"
                    );
                    deferred.push(log.clone());
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::error!(
                        %signature, block = %log.block_number, log_index = %log.log_index, ?err,
                        "dropping live log"
                    );
                    frozen.get_or_insert(log.block_number.saturating_sub(1));
                }
            }
        }

        let mark = deferred
            .iter()
            .map(|log| log.block_number.saturating_sub(1))
            .chain(frozen)
            .fold(batch.through, u64::min);
        let safe = watermarks.update(signature, mark);
        if let Err(err) = checkpoint.advance(safe).await {
            tracing::warn!(%signature, block = %safe, ?err, "failed to advance checkpoint");
        }
    }
    tracing::debug!(%signature, "live subscription closed");
}

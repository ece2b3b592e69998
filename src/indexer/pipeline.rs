//! The path every log takes, whether it came from a catch-up scan or a live
//! subscription: decode, timestamp, apply.

use crate::{
    chain::{ChainClient, RawLog},
    database::{self, Origin, Outcome},
    decoder::{Decoder, Signature},
    processor::EventProcessor,
    retry::RetryPolicy,
};
use anyhow::Result;
use solabi::ethprim::Digest;
use std::sync::Arc;

pub struct Pipeline {
    chain: Arc<dyn ChainClient>,
    decoder: Decoder,
    processor: EventProcessor,
    retry: RetryPolicy,
}

impl Pipeline {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        decoder: Decoder,
        processor: EventProcessor,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            chain,
            decoder,
            processor,
            retry,
        }
    }

    pub fn topic(&self, signature: Signature) -> Digest {
        self.decoder.topic(signature)
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Applies a single log. Logs that cannot be decoded are skipped and
    /// `None` is returned; an error means the log could not be applied even
    /// after retrying.
    pub async fn apply_log(&self, log: &RawLog) -> Result<Option<Outcome>> {
        let event = match self.decoder.decode(log) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(
                    %err, block = %log.block_number, log_index = %log.log_index,
                    transaction = %database::hash(&log.transaction_hash),
                    "failed to decode log"
                );
                return Ok(None);
            }
        };

        let (chain, processor, event) = (&self.chain, &self.processor, &event);
        let outcome = self
            .retry
            .execute(event.signature().name(), || async move {
                let block = chain.block_meta(log.block_number).await?;
                let origin = Origin {
                    tx_hash: database::hash(&log.transaction_hash),
                    block_number: log.block_number,
                    log_index: log.log_index,
                    timestamp: block.timestamp,
                };
                processor.apply(event, &origin).await
            })
            .await?;
        Ok(Some(outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        database::{Database, Sqlite},
        testing::{logs, FakeChain, FakeReader},
    };
    use solabi::ethprim::Address;
    use std::{sync::atomic::Ordering, time::Duration};

    fn pipeline(reader: Arc<FakeReader>) -> (Arc<Sqlite>, Pipeline) {
        let database = Arc::new(Sqlite::new_for_test());
        let chain = Arc::new(FakeChain::new(0));
        let pipeline = Pipeline::new(
            chain,
            Decoder::new().unwrap(),
            EventProcessor::new(database.clone(), reader),
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(10),
                jitter: false,
            },
        );
        (database, pipeline)
    }

    #[tokio::test]
    async fn skips_undecodable_logs() {
        let (_, pipeline) = pipeline(Arc::default());
        let unknown = logs::at(
            RawLog {
                topics: vec![Digest([0xff; 32])],
                ..Default::default()
            },
            10,
            0,
        );
        assert_eq!(pipeline.apply_log(&unknown).await.unwrap(), None);

        let mut truncated = logs::ticket_minted(&pipeline.decoder, 1, 7, 1, Address([1; 20]));
        truncated.data.clear();
        assert_eq!(pipeline.apply_log(&truncated).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_failed_contract_reads() {
        let reader = Arc::new(FakeReader::default());
        reader.details_failures.store(2, Ordering::SeqCst);
        let (database, pipeline) = pipeline(reader.clone());

        let log = logs::at(
            logs::event_created(&pipeline.decoder, 7, Address([0xaa; 20]), "Concert"),
            100,
            0,
        );
        assert_eq!(
            pipeline.apply_log(&log).await.unwrap(),
            Some(Outcome::Applied)
        );
        assert_eq!(reader.details_calls.load(Ordering::SeqCst), 3);

        let event = database.event(7).await.unwrap().unwrap();
        assert_eq!(event.tx_hash, database::hash(&log.transaction_hash));
        assert_eq!(event.block_number, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_exhausting_retries() {
        let reader = Arc::new(FakeReader::default());
        reader.details_failures.store(usize::MAX, Ordering::SeqCst);
        let (database, pipeline) = pipeline(reader.clone());

        let log = logs::at(
            logs::event_created(&pipeline.decoder, 7, Address([0xaa; 20]), "Concert"),
            100,
            0,
        );
        assert!(pipeline.apply_log(&log).await.is_err());
        assert_eq!(reader.details_calls.load(Ordering::SeqCst), 3);
        assert!(database.event(7).await.unwrap().is_none());
    }
}

//! Log subscriptions. The provider is only reachable over HTTP, so a
//! subscription is a polled log filter: every poll interval new blocks are
//! queried for the subscribed topic and delivered as a [`LogBatch`].

use super::{digest_hex, ChainClient, ChainRpcError, RawLog};
use solabi::ethprim::Digest;
use std::{
    cmp,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{sync::mpsc, task::JoinHandle, time};

/// Logs for one subscription covering every block up to and including
/// `through`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LogBatch {
    pub logs: Vec<RawLog>,
    pub through: u64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct SubscriptionId(u64);

/// A set of polled log subscriptions against one chain client.
pub struct Subscriptions {
    client: Arc<dyn ChainClient>,
    poll_interval: Duration,
    page_size: u64,
    next_id: AtomicU64,
    tasks: Mutex<Vec<(SubscriptionId, JoinHandle<()>)>>,
}

impl Subscriptions {
    pub fn new(client: Arc<dyn ChainClient>, poll_interval: Duration, page_size: u64) -> Self {
        Self {
            client,
            poll_interval,
            page_size: page_size.max(1),
            next_id: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Subscribes to logs with the specified first topic, starting at block
    /// `from`. Batches are pushed into `sink` in ascending block order; the
    /// subscription ends on its own once the receiving side is dropped.
    pub fn subscribe(
        &self,
        topic: Digest,
        from: u64,
        sink: mpsc::UnboundedSender<LogBatch>,
    ) -> Result<SubscriptionId, ChainRpcError> {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let task = tokio::spawn(poll(
            self.client.clone(),
            topic,
            from,
            self.poll_interval,
            self.page_size,
            sink,
        ));

        self.tasks
            .lock()
            .map_err(|_| ChainRpcError::Subscription {
                topic: digest_hex(&topic),
                message: "subscription registry poisoned".to_string(),
            })?
            .push((id, task));
        Ok(id)
    }

    /// Removes every subscription, aborting the polling tasks.
    pub fn unsubscribe_all(&self) {
        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for (id, task) in tasks {
            tracing::debug!(?id, "unsubscribing");
            task.abort();
        }
    }
}

impl Drop for Subscriptions {
    fn drop(&mut self) {
        self.unsubscribe_all();
    }
}

async fn poll(
    client: Arc<dyn ChainClient>,
    topic: Digest,
    mut next: u64,
    interval: Duration,
    page_size: u64,
    sink: mpsc::UnboundedSender<LogBatch>,
) {
    let topic_hex = digest_hex(&topic);
    loop {
        match client.head_block().await {
            Ok(head) if head >= next => {
                let to = cmp::min(head, next + page_size - 1);
                match client.get_logs(topic, next, to).await {
                    Ok(logs) => {
                        if sink.send(LogBatch { logs, through: to }).is_err() {
                            tracing::debug!(topic = %topic_hex, "subscription receiver gone");
                            return;
                        }
                        next = to + 1;
                        // Keep going without sleeping while we are behind.
                        if to < head {
                            continue;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(topic = %topic_hex, from = %next, %to, %err, "failed to poll logs");
                    }
                }
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(topic = %topic_hex, %err, "failed to poll head block");
            }
        }

        if sink.is_closed() {
            return;
        }
        time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeChain;

    #[tokio::test(start_paused = true)]
    async fn delivers_new_blocks_in_pages() {
        let chain = Arc::new(FakeChain::new(25));
        let topic = Digest([1; 32]);
        chain.push_log(topic, 3, 0);
        chain.push_log(topic, 21, 4);

        let subscriptions = Subscriptions::new(chain.clone(), Duration::from_secs(1), 10);
        let (tx, mut rx) = mpsc::unbounded_channel();
        subscriptions.subscribe(topic, 1, tx).unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.through, 10);
        assert_eq!(first.logs.len(), 1);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.through, 20);
        assert!(second.logs.is_empty());
        let third = rx.recv().await.unwrap();
        assert_eq!(third.through, 25);
        assert_eq!(third.logs[0].block_number, 21);

        chain.set_head(30);
        let fourth = rx.recv().await.unwrap();
        assert_eq!(fourth.through, 30);

        subscriptions.unsubscribe_all();
        assert!(rx.recv().await.is_none());
    }
}

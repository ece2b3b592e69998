//! Contract event indexer: catches up on historical logs and then follows the
//! chain through live subscriptions.

mod live;
mod pipeline;
mod scanner;

pub use self::{
    live::Live,
    scanner::{Progress, Scan},
};
use self::{live::LiveSubscriptions, pipeline::Pipeline, scanner::Scanner};
use crate::{
    chain::ChainClient,
    checkpoint::Checkpoint,
    contract::ContractReader,
    database::Database,
    decoder::Decoder,
    processor::EventProcessor,
    retry::RetryPolicy,
};
use anyhow::{Context, Result};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

/// The indexer run configuration.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Settings {
    /// The block to start from when nothing has been indexed yet.
    pub start_block: u64,
    pub scan: Scan,
    pub retry: RetryPolicy,
    pub live: Live,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    Stopped,
    Starting,
    CatchingUp,
    Live,
}

/// Mirrors contract events into a [`Database`].
pub struct Indexer {
    chain: Arc<dyn ChainClient>,
    checkpoint: Arc<Checkpoint>,
    pipeline: Arc<Pipeline>,
    scanner: Scanner,
    live: Live,
    phase: Mutex<Phase>,
    stop: watch::Sender<bool>,
    subscriptions: Mutex<Option<LiveSubscriptions>>,
}

impl Indexer {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        database: Arc<dyn Database>,
        contract: Arc<dyn ContractReader>,
        settings: Settings,
    ) -> Result<Self> {
        let pipeline = Arc::new(Pipeline::new(
            chain.clone(),
            Decoder::new()?,
            EventProcessor::new(database.clone(), contract),
            settings.retry,
        ));
        Ok(Self {
            scanner: Scanner::new(
                chain.clone(),
                database.clone(),
                pipeline.clone(),
                settings.scan,
            ),
            checkpoint: Arc::new(Checkpoint::new(database, settings.start_block)),
            chain,
            pipeline,
            live: settings.live,
            phase: Mutex::new(Phase::Stopped),
            stop: watch::channel(false).0,
            subscriptions: Mutex::new(None),
        })
    }

    pub fn phase(&self) -> Phase {
        *lock(&self.phase)
    }

    /// Catches up from the stored checkpoint to the current head and then
    /// switches to live subscriptions. Returns once live mode is entered.
    ///
    /// Starting an indexer that is already running does nothing. A failure
    /// to reach the provider fails the start right away, without retrying.
    pub async fn start(&self) -> Result<()> {
        {
            let mut phase = lock(&self.phase);
            if *phase != Phase::Stopped {
                tracing::info!(phase = ?*phase, "indexer already running");
                return Ok(());
            }
            *phase = Phase::Starting;
        }
        self.stop.send_replace(false);

        let result = self.run().await;
        if result.is_err() {
            self.set_phase(Phase::Stopped);
        }
        result
    }

    async fn run(&self) -> Result<()> {
        let head = self
            .chain
            .head_block()
            .await
            .context("failed to reach the JSON-RPC provider")?;
        let from = self.checkpoint.load().await?;
        tracing::info!(%from, %head, "starting indexer");

        let stop = self.stop.subscribe();
        if *stop.borrow() {
            self.set_phase(Phase::Stopped);
            return Ok(());
        }
        self.set_phase(Phase::CatchingUp);
        if from <= head && self.scanner.scan_all(from, head, &stop).await? == Progress::Stopped {
            tracing::info!("catch-up interrupted");
            self.set_phase(Phase::Stopped);
            return Ok(());
        }
        self.checkpoint.advance(head).await?;

        let live = LiveSubscriptions::start_all(
            self.chain.clone(),
            self.pipeline.clone(),
            self.checkpoint.clone(),
            head + 1,
            self.live,
        )?;

        let mut subscriptions = lock(&self.subscriptions);
        if *stop.borrow() {
            // Stopped while subscribing; dropping the handles aborts them.
            self.set_phase(Phase::Stopped);
            return Ok(());
        }
        *subscriptions = Some(live);
        self.set_phase(Phase::Live);
        tracing::info!(%head, "catch-up complete, following the chain");
        Ok(())
    }

    /// Stops catch-up or live mode. In-flight logs finish applying.
    pub async fn stop(&self) {
        self.stop.send_replace(true);
        let live = lock(&self.subscriptions).take();
        if let Some(live) = live {
            live.stop_all().await;
        }
        self.set_phase(Phase::Stopped);
        tracing::info!("indexer stopped");
    }

    fn set_phase(&self, phase: Phase) {
        *lock(&self.phase) = phase;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        database::{self, EventStatus, Role, Sqlite, TransactionKind},
        testing::{logs, FakeChain, FakeReader},
    };
    use solabi::ethprim::Address;
    use std::time::Duration;

    const ORGANIZER: Address = Address([0xaa; 20]);
    const BUYER: Address = Address([0xbb; 20]);

    fn settings() -> Settings {
        Settings {
            start_block: 0,
            scan: Scan {
                page_size: 1000,
                request_delay: Duration::from_millis(500),
                window_attempts: 5,
            },
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(10),
                jitter: false,
            },
            live: Live {
                poll_interval: Duration::from_secs(4),
                page_size: 1000,
            },
        }
    }

    fn indexer(chain: Arc<FakeChain>, database: Arc<Sqlite>) -> Indexer {
        Indexer::new(chain, database, Arc::new(FakeReader::default()), settings()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn catches_up_then_follows_the_chain() {
        let decoder = Decoder::new().unwrap();
        let chain = Arc::new(FakeChain::new(120));
        chain.push(logs::at(
            logs::event_created(&decoder, 7, ORGANIZER, "Concert"),
            100,
            0,
        ));
        chain.push(logs::at(
            logs::ticket_type_added(&decoder, 7, 1, "GA", 1000, 50),
            105,
            0,
        ));
        chain.push(logs::at(
            logs::tickets_purchased(&decoder, 7, 1, BUYER, 3, 3000),
            110,
            0,
        ));
        let database = Arc::new(Sqlite::new_for_test());
        let indexer = indexer(chain.clone(), database.clone());

        indexer.start().await.unwrap();
        assert_eq!(indexer.phase(), Phase::Live);

        let event = database.event(7).await.unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Pending);
        assert_eq!(database.ticket_type(7, 1).await.unwrap().unwrap().sold, 3);

        let mut transactions = 0;
        for kind in [
            TransactionKind::EventCreation,
            TransactionKind::TicketTypeAdded,
            TransactionKind::TicketPurchase,
        ] {
            transactions += database.transactions_by_kind(kind).await.unwrap().len();
        }
        assert_eq!(transactions, 3);

        let organizer = database.user(&database::address(&ORGANIZER)).await.unwrap();
        assert_eq!(organizer.unwrap().role, Role::Organizer);
        let buyer = database.user(&database::address(&BUYER)).await.unwrap();
        assert_eq!(buyer.unwrap().role, Role::Buyer);
        assert!(database.checkpoint().await.unwrap().unwrap() >= 110);

        // Live: a mint in a new block is picked up on the next poll.
        chain.push(logs::at(
            logs::ticket_minted(&decoder, 1, 7, 1, BUYER),
            125,
            0,
        ));
        chain.set_head(125);
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(database.ticket(1).await.unwrap().is_some());
        assert_eq!(database.ticket_type(7, 1).await.unwrap().unwrap().sold, 4);
        assert_eq!(database.checkpoint().await.unwrap(), Some(125));

        indexer.stop().await;
        assert_eq!(indexer.phase(), Phase::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent() {
        let chain = Arc::new(FakeChain::new(10));
        let indexer = indexer(chain.clone(), Arc::new(Sqlite::new_for_test()));

        indexer.start().await.unwrap();
        let requests = chain.requests().len();
        indexer.start().await.unwrap();

        assert_eq!(indexer.phase(), Phase::Live);
        assert_eq!(chain.requests().len(), requests);
        indexer.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_provider_fails_fast() {
        let chain = Arc::new(FakeChain::new(10));
        chain.fail_head(1);
        let indexer = indexer(chain.clone(), Arc::new(Sqlite::new_for_test()));

        assert!(indexer.start().await.is_err());
        assert_eq!(indexer.phase(), Phase::Stopped);
        assert!(chain.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stopping_during_catch_up_allows_a_restart() {
        // Two windows per signature with a request delay in between.
        let chain = Arc::new(FakeChain::new(1500));
        let indexer = Arc::new(indexer(chain.clone(), Arc::new(Sqlite::new_for_test())));

        let starting = tokio::spawn({
            let indexer = indexer.clone();
            async move { indexer.start().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(indexer.phase(), Phase::CatchingUp);
        indexer.stop().await;

        starting.await.unwrap().unwrap();
        assert_eq!(indexer.phase(), Phase::Stopped);

        indexer.start().await.unwrap();
        assert_eq!(indexer.phase(), Phase::Live);
        indexer.stop().await;
        assert_eq!(indexer.phase(), Phase::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn resumes_from_the_checkpoint() {
        let chain = Arc::new(FakeChain::new(2500));
        let database = Arc::new(Sqlite::new_for_test());
        database.advance_checkpoint(2000).await.unwrap();
        let indexer = indexer(chain.clone(), database.clone());

        indexer.start().await.unwrap();

        assert!(chain
            .requests()
            .iter()
            .all(|&(_, from, to)| from >= 2000 && to <= 2500));
        assert_eq!(database.checkpoint().await.unwrap(), Some(2500));
        indexer.stop().await;
    }
}

//! In-memory chain and contract doubles shared by the unit tests.

use crate::{
    chain::{BlockMeta, ChainClient, ChainRpcError, RawLog},
    contract::{ContractReader, EventDetails, ShareDetails, TicketTypeDetails},
};
use anyhow::Result;
use futures::{future::BoxFuture, FutureExt};
use solabi::ethprim::Digest;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Mutex,
    },
};

/// Timestamp of block `number` on the fake chain.
pub fn timestamp(number: u64) -> u64 {
    1_700_000_000 + number * 12
}

#[derive(Default)]
pub struct FakeChain {
    head: AtomicU64,
    logs: Mutex<Vec<RawLog>>,
    requests: Mutex<Vec<(Digest, u64, u64)>>,
    /// Remaining injected failures keyed by the first block of a window.
    failures: Mutex<HashMap<u64, usize>>,
    /// Remaining injected failures for a topic, one entry per failure.
    topic_failures: Mutex<Vec<Digest>>,
    head_failures: AtomicUsize,
    call_result: Mutex<Option<Vec<u8>>>,
}

impl FakeChain {
    pub fn new(head: u64) -> Self {
        Self {
            head: AtomicU64::new(head),
            ..Default::default()
        }
    }

    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    pub fn push(&self, log: RawLog) {
        self.logs.lock().unwrap().push(log);
    }

    /// Adds an empty log with the specified topic at a chain position.
    pub fn push_log(&self, topic: Digest, block: u64, log_index: u64) {
        self.push(logs::at(
            RawLog {
                topics: vec![topic],
                ..Default::default()
            },
            block,
            log_index,
        ));
    }

    /// The `eth_getLogs` windows requested so far.
    pub fn requests(&self) -> Vec<(Digest, u64, u64)> {
        self.requests.lock().unwrap().clone()
    }

    /// Makes `eth_getLogs` fail `times` times for windows starting at `from`.
    pub fn fail_window(&self, from: u64, times: usize) {
        self.failures.lock().unwrap().insert(from, times);
    }

    /// Makes the next `times` `eth_getLogs` requests for `topic` fail.
    pub fn fail_topic(&self, topic: Digest, times: usize) {
        self.topic_failures
            .lock()
            .unwrap()
            .extend(std::iter::repeat(topic).take(times));
    }

    pub fn fail_head(&self, times: usize) {
        self.head_failures.store(times, Ordering::SeqCst);
    }

    pub fn set_call_result(&self, output: Vec<u8>) {
        *self.call_result.lock().unwrap() = Some(output);
    }
}

impl ChainClient for FakeChain {
    fn head_block(&self) -> BoxFuture<'_, Result<u64, ChainRpcError>> {
        let failing = self
            .head_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let result = if failing {
            Err(ChainRpcError::transport("connection refused"))
        } else {
            Ok(self.head.load(Ordering::SeqCst))
        };
        async move { result }.boxed()
    }

    fn get_logs(
        &self,
        topic: Digest,
        from: u64,
        to: u64,
    ) -> BoxFuture<'_, Result<Vec<RawLog>, ChainRpcError>> {
        self.requests.lock().unwrap().push((topic, from, to));

        let failing = match self.failures.lock().unwrap().get_mut(&from) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        } || {
            let mut topics = self.topic_failures.lock().unwrap();
            match topics.iter().position(|failing| *failing == topic) {
                Some(index) => {
                    topics.remove(index);
                    true
                }
                None => false,
            }
        };
        let result = if failing {
            Err(ChainRpcError::transport(format!("request for {from}..={to} timed out")))
        } else {
            let mut logs = self
                .logs
                .lock()
                .unwrap()
                .iter()
                .filter(|log| {
                    log.topics.first() == Some(&topic) && (from..=to).contains(&log.block_number)
                })
                .cloned()
                .collect::<Vec<_>>();
            logs.sort_by_key(|log| (log.block_number, log.log_index));
            Ok(logs)
        };
        async move { result }.boxed()
    }

    fn block_meta(&self, number: u64) -> BoxFuture<'_, Result<BlockMeta, ChainRpcError>> {
        async move {
            Ok(BlockMeta {
                number,
                timestamp: timestamp(number),
            })
        }
        .boxed()
    }

    fn call(&self, _: Vec<u8>) -> BoxFuture<'_, Result<Vec<u8>, ChainRpcError>> {
        let result = self
            .call_result
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ChainRpcError::transport("execution reverted"));
        async move { result }.boxed()
    }
}

/// Contract reader answering from fixed values.
#[derive(Default)]
pub struct FakeReader {
    pub shares: Vec<ShareDetails>,
    pub ticket_types: Mutex<HashMap<(u64, u64), TicketTypeDetails>>,
    /// Number of upcoming `event_details` calls that fail.
    pub details_failures: AtomicUsize,
    pub details_calls: AtomicUsize,
}

impl FakeReader {
    pub fn set_ticket_type(&self, event_id: u64, type_id: u64, details: TicketTypeDetails) {
        self.ticket_types
            .lock()
            .unwrap()
            .insert((event_id, type_id), details);
    }
}

impl ContractReader for FakeReader {
    fn event_details(&self, event_id: u64) -> BoxFuture<'_, Result<EventDetails>> {
        self.details_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .details_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        async move {
            anyhow::ensure!(!failing, "execution reverted");
            Ok(EventDetails {
                event_uri: format!("ipfs://event/{event_id}"),
                document_uri: format!("ipfs://document/{event_id}"),
                event_date: 1_800_000_000,
                event_active: false,
                created_at: 1_699_999_999,
            })
        }
        .boxed()
    }

    fn revenue_shares(&self, _: u64) -> BoxFuture<'_, Result<Vec<ShareDetails>>> {
        let shares = self.shares.clone();
        async move { Ok(shares) }.boxed()
    }

    fn ticket_type(
        &self,
        event_id: u64,
        type_id: u64,
    ) -> BoxFuture<'_, Result<TicketTypeDetails>> {
        let details = self
            .ticket_types
            .lock()
            .unwrap()
            .get(&(event_id, type_id))
            .cloned()
            .unwrap_or(TicketTypeDetails {
                sale_start: 1_700_000_000,
                sale_end: 1_800_000_000,
                active: true,
            });
        async move { Ok(details) }.boxed()
    }
}

/// ABI encoded contract logs.
pub mod logs {
    use crate::{
        chain::RawLog,
        decoder::{Decoder, Signature},
    };
    use solabi::ethprim::{Address, Digest};

    fn uint(value: u64) -> [u8; 32] {
        let mut word = [0; 32];
        word[24..].copy_from_slice(&value.to_be_bytes());
        word
    }

    fn address(value: Address) -> [u8; 32] {
        let mut word = [0; 32];
        word[12..].copy_from_slice(&value.0);
        word
    }

    fn string(value: &str) -> Vec<u8> {
        let mut encoded = uint(value.len() as u64).to_vec();
        encoded.extend_from_slice(value.as_bytes());
        encoded.resize(32 + value.len().div_ceil(32) * 32, 0);
        encoded
    }

    fn log(decoder: &Decoder, signature: Signature, indexed: &[[u8; 32]], data: Vec<u8>) -> RawLog {
        let mut topics = vec![decoder.topic(signature)];
        topics.extend(indexed.iter().copied().map(Digest));
        RawLog {
            topics,
            data,
            ..Default::default()
        }
    }

    /// Places a log in the chain; the transaction hash is derived from the
    /// block number so logs of one block share a transaction.
    pub fn at(mut log: RawLog, block: u64, log_index: u64) -> RawLog {
        log.transaction_hash = Digest(uint(block));
        log.block_number = block;
        log.log_index = log_index;
        log
    }

    pub fn event_created(decoder: &Decoder, event_id: u64, creator: Address, name: &str) -> RawLog {
        let mut data = uint(0x20).to_vec();
        data.extend(string(name));
        log(
            decoder,
            Signature::EventCreated,
            &[uint(event_id), address(creator)],
            data,
        )
    }

    pub fn event_approved(decoder: &Decoder, event_id: u64, creator: Address) -> RawLog {
        log(
            decoder,
            Signature::EventApproved,
            &[uint(event_id), address(creator)],
            Vec::new(),
        )
    }

    pub fn event_rejected(decoder: &Decoder, event_id: u64, creator: Address) -> RawLog {
        log(
            decoder,
            Signature::EventRejected,
            &[uint(event_id), address(creator)],
            Vec::new(),
        )
    }

    pub fn ticket_type_added(
        decoder: &Decoder,
        event_id: u64,
        type_id: u64,
        name: &str,
        price: u64,
        supply: u64,
    ) -> RawLog {
        let mut data = [uint(0x60), uint(price), uint(supply)].concat();
        data.extend(string(name));
        log(
            decoder,
            Signature::TicketTypeAdded,
            &[uint(event_id), uint(type_id)],
            data,
        )
    }

    pub fn ticket_type_updated(
        decoder: &Decoder,
        event_id: u64,
        type_id: u64,
        price: u64,
        supply: u64,
    ) -> RawLog {
        log(
            decoder,
            Signature::TicketTypeUpdated,
            &[uint(event_id), uint(type_id)],
            [uint(price), uint(supply)].concat(),
        )
    }

    pub fn ticket_minted(
        decoder: &Decoder,
        ticket_id: u64,
        event_id: u64,
        type_id: u64,
        buyer: Address,
    ) -> RawLog {
        log(
            decoder,
            Signature::TicketMinted,
            &[uint(ticket_id), uint(event_id), uint(type_id)],
            address(buyer).to_vec(),
        )
    }

    pub fn tickets_purchased(
        decoder: &Decoder,
        event_id: u64,
        type_id: u64,
        buyer: Address,
        quantity: u64,
        total_cost: u64,
    ) -> RawLog {
        log(
            decoder,
            Signature::TicketsPurchased,
            &[uint(event_id), uint(type_id), address(buyer)],
            [uint(quantity), uint(total_cost)].concat(),
        )
    }

    pub fn ticket_listed(decoder: &Decoder, ticket_id: u64, price: u64, deadline: u64) -> RawLog {
        log(
            decoder,
            Signature::TicketListedForResale,
            &[uint(ticket_id)],
            [uint(price), uint(deadline)].concat(),
        )
    }

    pub fn ticket_resold(
        decoder: &Decoder,
        ticket_id: u64,
        from: Address,
        to: Address,
        price: u64,
    ) -> RawLog {
        log(
            decoder,
            Signature::TicketResold,
            &[uint(ticket_id), address(from), address(to)],
            uint(price).to_vec(),
        )
    }

    pub fn listing_cancelled(decoder: &Decoder, ticket_id: u64) -> RawLog {
        log(
            decoder,
            Signature::ResaleListingCancelled,
            &[uint(ticket_id)],
            Vec::new(),
        )
    }

    pub fn ticket_used(decoder: &Decoder, ticket_id: u64, event_id: u64, user: Address) -> RawLog {
        log(
            decoder,
            Signature::TicketUsed,
            &[uint(ticket_id), uint(event_id), address(user)],
            Vec::new(),
        )
    }
}

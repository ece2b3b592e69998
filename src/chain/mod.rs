//! Thin access layer over the chain. The [`ChainClient`] trait is the only
//! place the indexer talks to the JSON-RPC provider; it never retries on its
//! own, callers wrap it with a [`crate::retry::RetryPolicy`].

pub mod ethrpc;
mod subscription;

pub use self::subscription::{LogBatch, SubscriptionId, Subscriptions};
use futures::future::BoxFuture;
use solabi::ethprim::Digest;
use thiserror::Error;

/// A raw contract log as returned by `eth_getLogs`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RawLog {
    pub topics: Vec<Digest>,
    pub data: Vec<u8>,
    pub transaction_hash: Digest,
    pub block_number: u64,
    pub log_index: u64,
}

/// Block metadata needed to timestamp datastore records.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BlockMeta {
    pub number: u64,
    /// Block timestamp in seconds since the Unix epoch.
    pub timestamp: u64,
}

#[derive(Debug, Error)]
pub enum ChainRpcError {
    #[error("RPC transport error: {0}")]
    Transport(String),

    #[error("block {0} not found")]
    MissingBlock(u64),

    #[error("invalid RPC response: {0}")]
    Decode(String),

    #[error("subscription for topic {topic} failed: {message}")]
    Subscription { topic: String, message: String },
}

impl ChainRpcError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Operations the indexer needs from a JSON-RPC provider for a single
/// contract on a single chain.
pub trait ChainClient: Send + Sync {
    /// Returns the current head block number.
    fn head_block(&self) -> BoxFuture<'_, Result<u64, ChainRpcError>>;

    /// Fetches the contract's logs with `topic` as the first topic in the
    /// inclusive block range `[from, to]`, in ascending chain order.
    fn get_logs(
        &self,
        topic: Digest,
        from: u64,
        to: u64,
    ) -> BoxFuture<'_, Result<Vec<RawLog>, ChainRpcError>>;

    /// Fetches the number and timestamp of a block.
    fn block_meta(&self, number: u64) -> BoxFuture<'_, Result<BlockMeta, ChainRpcError>>;

    /// Executes a read-only `eth_call` against the contract at the latest
    /// block and returns the raw return data.
    fn call(&self, input: Vec<u8>) -> BoxFuture<'_, Result<Vec<u8>, ChainRpcError>>;
}

/// Formats a 32-byte digest as `0x`-prefixed lower-case hex.
pub fn digest_hex(digest: &Digest) -> String {
    format!("0x{}", hex::encode(digest.0))
}

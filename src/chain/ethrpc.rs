//! [`ChainClient`] over an HTTP JSON-RPC provider.

use super::{BlockMeta, ChainClient, ChainRpcError, RawLog};
use ethrpc::{
    eth,
    types::{
        ArrayVec, BlockTag, Empty, Hydrated, LogBlocks, LogFilter, LogFilterValue,
        TransactionCall,
    },
};
use futures::{future::BoxFuture, FutureExt};
use solabi::ethprim::{Address, Digest, U256};
use url::Url;

pub struct EthRpc {
    eth: ethrpc::http::Client,
    contract: Address,
}

impl EthRpc {
    pub fn new(url: Url, contract: Address) -> Self {
        Self {
            eth: ethrpc::http::Client::new(url),
            contract,
        }
    }
}

impl ChainClient for EthRpc {
    fn head_block(&self) -> BoxFuture<'_, Result<u64, ChainRpcError>> {
        async move {
            let number = self
                .eth
                .execute(eth::BlockNumber, Empty)
                .await
                .map_err(ChainRpcError::transport)?;
            Ok(number.as_u64())
        }
        .boxed()
    }

    fn get_logs(
        &self,
        topic: Digest,
        from: u64,
        to: u64,
    ) -> BoxFuture<'_, Result<Vec<RawLog>, ChainRpcError>> {
        async move {
            let mut topics = ArrayVec::<_, 4>::new();
            topics.push(LogFilterValue::Exact(topic));
            let filter = LogFilter {
                address: LogFilterValue::Exact(self.contract),
                topics,
                blocks: LogBlocks::Range {
                    from: from.into(),
                    to: to.into(),
                },
            };

            tracing::trace!(%from, %to, "eth_getLogs");
            let logs = self
                .eth
                .execute(eth::GetLogs, (filter,))
                .await
                .map_err(ChainRpcError::transport)?;

            Ok(logs
                .into_iter()
                .map(|log| RawLog {
                    topics: log.topics.to_vec(),
                    data: log.data.to_vec(),
                    transaction_hash: log.transaction_hash,
                    block_number: log.block_number.as_u64(),
                    log_index: log.log_index.as_u64(),
                })
                .collect())
        }
        .boxed()
    }

    fn block_meta(&self, number: u64) -> BoxFuture<'_, Result<BlockMeta, ChainRpcError>> {
        async move {
            let block = self
                .eth
                .execute(
                    eth::GetBlockByNumber,
                    (U256::from(number).into(), Hydrated::No),
                )
                .await
                .map_err(ChainRpcError::transport)?
                .ok_or(ChainRpcError::MissingBlock(number))?;
            Ok(BlockMeta {
                number: block.number.as_u64(),
                timestamp: block.timestamp.as_u64(),
            })
        }
        .boxed()
    }

    fn call(&self, input: Vec<u8>) -> BoxFuture<'_, Result<Vec<u8>, ChainRpcError>> {
        async move {
            let call = TransactionCall {
                to: Some(self.contract),
                input: Some(input),
                ..Default::default()
            };
            self.eth
                .execute(eth::Call, (call, BlockTag::Latest.into()))
                .await
                .map_err(ChainRpcError::transport)
        }
        .boxed()
    }
}

//! HTTP JSON-RPC ledger client built on an alloy provider.

use std::time::Duration;

use alloy_consensus::TxEnvelope;
use alloy_eips::eip2718::Encodable2718;
use alloy_eips::{BlockId as RpcBlockId, BlockNumberOrTag};
use alloy_network::{Ethereum, ReceiptResponse};
use alloy_primitives::{Address, B256, U256};
use alloy_provider::{Provider, RootProvider};
use alloy_rpc_client::RpcClient as AlloyRpcClient;
use alloy_transport::TransportError;
use alloy_transport_http::Http;
use async_trait::async_trait;
use tracing::debug;
use url::Url;

use super::{BlockHeader, BlockId, ClientError, Connector, LedgerClient, NonceTag, TxStatus};
use crate::{sign_transfer, Account};

/// Upper bound on a single request, including connecting.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Dials [`RpcClient`]s for a fixed endpoint.
#[derive(Debug, Clone)]
pub struct RpcConnector {
    endpoint: String,
    timeout: Duration,
}

impl RpcConnector {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Sets the per-request timeout of dialed clients.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Connector for RpcConnector {
    type Client = RpcClient;

    async fn dial(&self) -> Result<RpcClient, ClientError> {
        RpcClient::connect(&self.endpoint, self.timeout).await
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// JSON-RPC client for an Ethereum-compatible node.
///
/// The chain id is fetched once when connecting and reused for every signed
/// transfer.
#[derive(Debug, Clone)]
pub struct RpcClient {
    provider: RootProvider<Ethereum>,
    chain_id: u64,
}

impl RpcClient {
    /// Connects to `url` and caches the node's chain id.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, ClientError> {
        let provider = http_provider(url, timeout)?;
        let chain_id = provider
            .get_chain_id()
            .await
            .map_err(|e| ClientError::Dial(format!("{url}: {e}")))?;
        debug!(url, chain_id, "Connected to node");
        Ok(Self { provider, chain_id })
    }
}

/// Creates a provider over a reqwest transport with a request timeout.
fn http_provider(url: &str, timeout: Duration) -> Result<RootProvider<Ethereum>, ClientError> {
    let url: Url = url
        .parse()
        .map_err(|e| ClientError::Dial(format!("invalid url {url}: {e}")))?;
    let http = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ClientError::Dial(e.to_string()))?;
    let client = AlloyRpcClient::new(Http::with_client(http, url), false);
    Ok(RootProvider::<Ethereum>::new(client))
}

fn rpc_block(block: BlockId) -> RpcBlockId {
    match block {
        BlockId::Latest => RpcBlockId::latest(),
        BlockId::Number(n) => RpcBlockId::number(n),
    }
}

fn block_tag(block: BlockId) -> BlockNumberOrTag {
    match block {
        BlockId::Latest => BlockNumberOrTag::Latest,
        BlockId::Number(n) => BlockNumberOrTag::Number(n),
    }
}

impl From<TransportError> for ClientError {
    fn from(e: TransportError) -> Self {
        match e.as_error_resp() {
            Some(payload) => ClientError::Rpc {
                code: payload.code,
                message: payload.message.to_string(),
            },
            None => ClientError::Transport(e),
        }
    }
}

#[async_trait]
impl LedgerClient for RpcClient {
    async fn balance_of(&self, address: Address, block: BlockId) -> Result<U256, ClientError> {
        Ok(self
            .provider
            .get_balance(address)
            .block_id(rpc_block(block))
            .await?)
    }

    async fn next_nonce(&self, address: Address, tag: NonceTag) -> Result<u64, ClientError> {
        let count = self.provider.get_transaction_count(address);
        let nonce = match tag {
            NonceTag::Pending => count.pending().await?,
            NonceTag::Latest => count.latest().await?,
        };
        Ok(nonce)
    }

    async fn header_at(&self, block: BlockId) -> Result<BlockHeader, ClientError> {
        let block_data = self
            .provider
            .get_block_by_number(block_tag(block))
            .await?
            .ok_or_else(|| ClientError::NotFound(format!("block {block:?}")))?;
        Ok(BlockHeader {
            number: block_data.header.number,
            timestamp: block_data.header.timestamp,
            hash: block_data.header.hash,
        })
    }

    async fn transaction_count(&self, block_hash: B256) -> Result<u64, ClientError> {
        self.provider
            .get_block_transaction_count_by_hash(block_hash)
            .await?
            .ok_or_else(|| ClientError::NotFound(format!("block {block_hash}")))
    }

    async fn submit_transfer(
        &self,
        signer: &Account,
        to: Address,
        amount: U256,
        gas_price: u128,
        nonce: u64,
    ) -> Result<B256, ClientError> {
        let signed = sign_transfer(signer, self.chain_id, to, amount, gas_price, nonce)?;
        let tx_hash = *signed.hash();
        let raw = TxEnvelope::from(signed).encoded_2718();

        self.provider.send_raw_transaction(&raw).await?;
        Ok(tx_hash)
    }

    async fn transaction_status(&self, tx_hash: B256) -> Result<TxStatus, ClientError> {
        let mined = self
            .provider
            .get_transaction_by_hash(tx_hash)
            .await?
            .is_some_and(|tx| tx.block_number.is_some());
        if !mined {
            return Ok(TxStatus::Pending);
        }

        Ok(match self.provider.get_transaction_receipt(tx_hash).await? {
            Some(receipt) => TxStatus::Confirmed {
                success: ReceiptResponse::status(&receipt),
            },
            None => TxStatus::Pending,
        })
    }
}

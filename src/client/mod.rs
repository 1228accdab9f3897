//! Ledger client capability set.
//!
//! This module provides the [`LedgerClient`] trait the load generator drives,
//! the [`Connector`] trait that dials new clients, and the value types they
//! exchange. Two implementations ship with the crate:
//!
//! - [`rpc::RpcConnector`]: HTTP JSON-RPC against a real node, via an alloy provider
//! - [`crate::sim::SimConnector`]: an in-process ledger backed by revm

pub mod rpc;

#[cfg(test)]
pub(crate) mod mock;

use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use thiserror::Error;

use crate::Account;

/// Block selector for state and header queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockId {
    /// The most recent block known to the node.
    Latest,
    /// A specific block height.
    Number(u64),
}

/// Which view of an account's nonce to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceTag {
    /// Includes transactions still waiting in the pool.
    Pending,
    /// Confirmed transactions only.
    Latest,
}

/// The header fields the load generator needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub number: u64,
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
    pub hash: B256,
}

/// Confirmation state of a submitted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// Not yet included in a block (or not yet visible to the node).
    Pending,
    /// Included, with the receipt's execution status.
    Confirmed { success: bool },
}

/// Errors returned by ledger clients.
///
/// All of these are treated as transient by the worker paths and retried.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport failure or an undecodable response.
    #[error("transport error: {0}")]
    Transport(alloy_transport::TransportError),

    /// The node answered with a JSON-RPC error object.
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// The requested block or object does not exist (yet).
    #[error("not found: {0}")]
    NotFound(String),

    /// The ledger refused a submission (bad nonce, insufficient funds, ...).
    #[error("transaction rejected: {0}")]
    Rejected(String),

    /// The transaction could not be signed.
    #[error("signing failed: {0}")]
    Signing(#[from] k256::ecdsa::Error),

    /// The connection could not be established.
    #[error("dial failed: {0}")]
    Dial(String),
}

/// Ledger operations used by the load generator.
///
/// Implementations must be safe to share between concurrently running
/// instances; signing and nonce bookkeeping stay with the caller.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Returns the balance of `address` at `block`.
    async fn balance_of(&self, address: Address, block: BlockId) -> Result<U256, ClientError>;

    /// Returns the next nonce `address` should use.
    async fn next_nonce(&self, address: Address, tag: NonceTag) -> Result<u64, ClientError>;

    /// Returns the header of `block`.
    async fn header_at(&self, block: BlockId) -> Result<BlockHeader, ClientError>;

    /// Returns the number of transactions in the block with `block_hash`.
    async fn transaction_count(&self, block_hash: B256) -> Result<u64, ClientError>;

    /// Signs and broadcasts a value transfer, returning its hash.
    async fn submit_transfer(
        &self,
        signer: &Account,
        to: Address,
        amount: U256,
        gas_price: u128,
        nonce: u64,
    ) -> Result<B256, ClientError>;

    /// Returns whether `tx_hash` is still pending, and its outcome if not.
    async fn transaction_status(&self, tx_hash: B256) -> Result<TxStatus, ClientError>;
}

/// Dials new ledger clients.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Client: LedgerClient + 'static;

    /// Opens a new client connection.
    async fn dial(&self) -> Result<Self::Client, ClientError>;

    /// Human-readable endpoint, for logs and errors.
    fn endpoint(&self) -> &str;
}

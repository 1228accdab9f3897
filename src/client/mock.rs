//! Scripted ledger used by unit tests.

use std::collections::HashMap;
use std::sync::Arc;

use alloy_primitives::{keccak256, Address, B256, U256};
use async_trait::async_trait;
use parking_lot::Mutex;

use super::{BlockHeader, BlockId, ClientError, Connector, LedgerClient, NonceTag, TxStatus};
use crate::Account;

#[derive(Debug, Clone)]
pub(crate) struct Submission {
    pub from: Address,
    pub to: Address,
    pub amount: U256,
    pub nonce: u64,
    pub hash: B256,
}

#[derive(Debug)]
struct MockTx {
    polls_left: usize,
    success: bool,
    credited: bool,
    to: Address,
    amount: U256,
}

/// Knobs and observations of the scripted ledger.
#[derive(Debug, Default)]
pub(crate) struct MockState {
    /// Dial attempts to fail before succeeding.
    pub dial_failures: usize,
    pub dial_attempts: usize,
    /// Submissions to reject before accepting.
    pub submit_failures: usize,
    /// Submissions to reject per sender, as if it could not pay for them.
    pub rejected_senders: HashMap<Address, usize>,
    /// Nonce lookups to fail with an RPC error.
    pub nonce_errors: usize,
    /// Number of hops per sender whose receipt reports failure.
    pub failing_senders: HashMap<Address, usize>,
    /// Pending answers returned for every transaction before it confirms.
    pub pending_polls: usize,
    /// Status queries to fail with an RPC error.
    pub status_errors: usize,
    pub status_queries: usize,
    pub height: u64,
    pub submissions: Vec<Submission>,
    nonces: HashMap<Address, u64>,
    balances: HashMap<Address, U256>,
    txs: HashMap<B256, MockTx>,
}

impl MockState {
    /// Advances the ledger nonce of `address`, as if another client had
    /// used the key.
    pub fn bump_nonce(&mut self, address: Address, by: u64) {
        *self.nonces.entry(address).or_default() += by;
    }
}

#[derive(Debug, Default)]
pub(crate) struct MockLedger {
    state: Mutex<MockState>,
}

impl MockLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn configure(&self, f: impl FnOnce(&mut MockState)) {
        f(&mut self.state.lock());
    }

    pub fn inspect<T>(&self, f: impl FnOnce(&MockState) -> T) -> T {
        f(&self.state.lock())
    }

    pub fn connector(self: &Arc<Self>) -> MockConnector {
        MockConnector {
            ledger: Arc::clone(self),
        }
    }

    pub fn client(self: &Arc<Self>) -> MockClient {
        MockClient {
            ledger: Arc::clone(self),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct MockConnector {
    ledger: Arc<MockLedger>,
}

#[async_trait]
impl Connector for MockConnector {
    type Client = MockClient;

    async fn dial(&self) -> Result<MockClient, ClientError> {
        let mut state = self.ledger.state.lock();
        state.dial_attempts += 1;
        if state.dial_failures > 0 {
            state.dial_failures -= 1;
            return Err(ClientError::Dial("connection refused".into()));
        }
        Ok(self.ledger.client())
    }

    fn endpoint(&self) -> &str {
        "mock://ledger"
    }
}

#[derive(Debug, Clone)]
pub(crate) struct MockClient {
    ledger: Arc<MockLedger>,
}

#[async_trait]
impl LedgerClient for MockClient {
    async fn balance_of(&self, address: Address, _block: BlockId) -> Result<U256, ClientError> {
        let state = self.ledger.state.lock();
        Ok(state.balances.get(&address).copied().unwrap_or_default())
    }

    async fn next_nonce(&self, address: Address, _tag: NonceTag) -> Result<u64, ClientError> {
        let mut state = self.ledger.state.lock();
        if state.nonce_errors > 0 {
            state.nonce_errors -= 1;
            return Err(ClientError::Rpc {
                code: -32603,
                message: "internal error".into(),
            });
        }
        Ok(state.nonces.get(&address).copied().unwrap_or_default())
    }

    async fn header_at(&self, block: BlockId) -> Result<BlockHeader, ClientError> {
        let state = self.ledger.state.lock();
        let number = match block {
            BlockId::Latest => state.height,
            BlockId::Number(n) if n <= state.height => n,
            BlockId::Number(n) => return Err(ClientError::NotFound(format!("block {n}"))),
        };
        Ok(BlockHeader {
            number,
            timestamp: number * 2,
            hash: keccak256(number.to_be_bytes()),
        })
    }

    async fn transaction_count(&self, _block_hash: B256) -> Result<u64, ClientError> {
        Ok(1)
    }

    async fn submit_transfer(
        &self,
        signer: &Account,
        to: Address,
        amount: U256,
        _gas_price: u128,
        nonce: u64,
    ) -> Result<B256, ClientError> {
        let mut state = self.ledger.state.lock();
        if state.submit_failures > 0 {
            state.submit_failures -= 1;
            return Err(ClientError::Rejected("txpool is full".into()));
        }

        let from = signer.address;
        if let Some(left) = state.rejected_senders.get_mut(&from).filter(|left| **left > 0) {
            *left -= 1;
            return Err(ClientError::Rejected("insufficient funds".into()));
        }
        let expected = state.nonces.get(&from).copied().unwrap_or_default();
        if nonce != expected {
            return Err(ClientError::Rejected(format!(
                "nonce mismatch: got {nonce}, expected {expected}"
            )));
        }
        state.nonces.insert(from, expected + 1);

        let mut preimage = from.to_vec();
        preimage.extend_from_slice(&nonce.to_be_bytes());
        let hash = keccak256(&preimage);

        let success = match state.failing_senders.get_mut(&from) {
            Some(left) if *left > 0 => {
                *left -= 1;
                false
            }
            _ => true,
        };
        let polls_left = state.pending_polls;
        state.txs.insert(
            hash,
            MockTx {
                polls_left,
                success,
                credited: false,
                to,
                amount,
            },
        );
        state.submissions.push(Submission {
            from,
            to,
            amount,
            nonce,
            hash,
        });
        Ok(hash)
    }

    async fn transaction_status(&self, tx_hash: B256) -> Result<TxStatus, ClientError> {
        let mut guard = self.ledger.state.lock();
        let state = &mut *guard;
        state.status_queries += 1;
        if state.status_errors > 0 {
            state.status_errors -= 1;
            return Err(ClientError::Rpc {
                code: -32603,
                message: "internal error".into(),
            });
        }

        let Some(tx) = state.txs.get_mut(&tx_hash) else {
            return Ok(TxStatus::Pending);
        };
        if tx.polls_left > 0 {
            tx.polls_left -= 1;
            return Ok(TxStatus::Pending);
        }
        if tx.success && !tx.credited {
            tx.credited = true;
            *state.balances.entry(tx.to).or_default() += tx.amount;
        }
        Ok(TxStatus::Confirmed {
            success: tx.success,
        })
    }
}

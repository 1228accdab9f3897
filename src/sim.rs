//! In-process ledger backed by revm.
//!
//! [`SimLedger`] accepts signed transfers into a pool and seals a block every
//! `block_time`, executing the pooled transfers in arrival order against a
//! `CacheDB`. Sealing is lazy: every call first catches the chain up to the
//! current tokio time, so paused-clock tests see blocks appear exactly when
//! time is advanced.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use alloy_primitives::{keccak256, Address, B256, U256};
use async_trait::async_trait;
use parking_lot::Mutex;
use revm::{
    context::TxEnv,
    database::{CacheDB, EmptyDB},
    primitives::{TxKind, KECCAK_EMPTY},
    state::AccountInfo,
    Context, DatabaseRef, ExecuteCommitEvm, MainBuilder, MainContext,
};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::client::{
    BlockHeader, BlockId, ClientError, Connector, LedgerClient, NonceTag, TxStatus,
};
use crate::{recover_signer, sign_transfer, Account, TRANSFER_GAS_LIMIT};

/// Chain id of the simulated ledger.
pub const SIM_CHAIN_ID: u64 = 1;

const MIN_BLOCK_TIME: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy)]
struct SimBlock {
    header: BlockHeader,
    tx_count: u64,
}

#[derive(Debug, Clone, Copy)]
struct PooledTransfer {
    hash: B256,
    from: Address,
    to: Address,
    value: U256,
    gas_price: u128,
    nonce: u64,
}

struct SimState {
    db: CacheDB<EmptyDB>,
    blocks: Vec<SimBlock>,
    next_seal: Instant,
    pool: Vec<PooledTransfer>,
    /// Pending nonces of senders with pooled transfers.
    pool_nonces: HashMap<Address, u64>,
    /// Execution status of every sealed transfer.
    receipts: HashMap<B256, bool>,
    /// Balance after every block that changed it, per address.
    balances: HashMap<Address, Vec<(u64, U256)>>,
}

/// A simulated ledger shared by every [`SimClient`] dialed from it.
pub struct SimLedger {
    block_time: Duration,
    genesis_timestamp: u64,
    state: Mutex<SimState>,
}

impl SimLedger {
    /// Creates a ledger whose genesis block credits `allocations`.
    pub fn new(block_time: Duration, allocations: &[(Address, U256)]) -> Arc<Self> {
        let block_time = block_time.max(MIN_BLOCK_TIME);
        let mut db = CacheDB::new(EmptyDB::default());
        let mut balances = HashMap::new();
        for &(address, balance) in allocations {
            let info = AccountInfo {
                balance,
                nonce: 0,
                code_hash: KECCAK_EMPTY,
                code: None,
            };
            db.insert_account_info(address, info);
            balances.insert(address, vec![(0, balance)]);
        }

        let genesis_timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let genesis = SimBlock {
            header: BlockHeader {
                number: 0,
                timestamp: genesis_timestamp,
                hash: keccak256(b"ledger-load genesis"),
            },
            tx_count: 0,
        };

        Arc::new(Self {
            block_time,
            genesis_timestamp,
            state: Mutex::new(SimState {
                db,
                blocks: vec![genesis],
                next_seal: Instant::now() + block_time,
                pool: Vec::new(),
                pool_nonces: HashMap::new(),
                receipts: HashMap::new(),
                balances,
            }),
        })
    }

    pub fn connector(self: &Arc<Self>) -> SimConnector {
        SimConnector {
            ledger: Arc::clone(self),
        }
    }

    /// Height of the most recent sealed block.
    pub fn height(&self) -> u64 {
        let mut state = self.state.lock();
        self.catch_up(&mut state);
        state.height()
    }

    fn catch_up(&self, state: &mut SimState) {
        let now = Instant::now();
        while state.next_seal <= now {
            self.seal(state);
            state.next_seal += self.block_time;
        }
    }

    fn seal(&self, state: &mut SimState) {
        let number = state.height() + 1;
        let parent = state.blocks.last().map(|b| b.header.hash).unwrap_or_default();
        let transfers = std::mem::take(&mut state.pool);
        state.pool_nonces.clear();

        let db = std::mem::replace(&mut state.db, CacheDB::new(EmptyDB::default()));
        let mut evm = Context::mainnet().with_db(db).build_mainnet();

        let mut preimage = Vec::with_capacity(40 + transfers.len() * 32);
        preimage.extend_from_slice(&number.to_be_bytes());
        preimage.extend_from_slice(parent.as_slice());
        let mut succeeded = 0usize;
        for transfer in &transfers {
            let tx_env = TxEnv {
                caller: transfer.from,
                kind: TxKind::Call(transfer.to),
                value: transfer.value,
                gas_limit: TRANSFER_GAS_LIMIT,
                gas_price: transfer.gas_price,
                nonce: transfer.nonce,
                chain_id: Some(SIM_CHAIN_ID),
                ..Default::default()
            };

            let success = match evm.transact_commit(tx_env) {
                Ok(result) => result.is_success(),
                Err(e) => {
                    debug!(hash = %transfer.hash, error = ?e, "Transfer invalid at execution");
                    false
                }
            };
            succeeded += usize::from(success);
            state.receipts.insert(transfer.hash, success);
            preimage.extend_from_slice(transfer.hash.as_slice());
        }
        state.db = evm.ctx.journaled_state.database;

        for transfer in &transfers {
            for address in [transfer.from, transfer.to] {
                let balance = state.account(address).balance;
                let history = state.balances.entry(address).or_default();
                match history.last_mut() {
                    Some((block, value)) if *block == number => *value = balance,
                    _ => history.push((number, balance)),
                }
            }
        }

        let elapsed_ms = number as u128 * self.block_time.as_millis();
        let header = BlockHeader {
            number,
            timestamp: self.genesis_timestamp + (elapsed_ms / 1000) as u64,
            hash: keccak256(&preimage),
        };
        state.blocks.push(SimBlock {
            header,
            tx_count: transfers.len() as u64,
        });

        if !transfers.is_empty() {
            debug!(
                number,
                transactions = transfers.len(),
                succeeded,
                "Sealed block"
            );
        }
    }

    fn submit(
        &self,
        signer: &Account,
        to: Address,
        value: U256,
        gas_price: u128,
        nonce: u64,
    ) -> Result<B256, ClientError> {
        let signed = sign_transfer(signer, SIM_CHAIN_ID, to, value, gas_price, nonce)?;
        let from = recover_signer(&signed)
            .filter(|recovered| *recovered == signer.address)
            .ok_or_else(|| ClientError::Rejected("invalid signature".into()))?;
        let hash = *signed.hash();

        let mut state = self.state.lock();
        self.catch_up(&mut state);

        if state.receipts.contains_key(&hash) || state.pool.iter().any(|t| t.hash == hash) {
            return Err(ClientError::Rejected("already known".into()));
        }
        let expected = state.pending_nonce(from);
        if nonce != expected {
            return Err(ClientError::Rejected(format!(
                "invalid nonce: got {nonce}, expected {expected}"
            )));
        }
        let cost = U256::from(gas_price) * U256::from(TRANSFER_GAS_LIMIT) + value;
        let balance = state.account(from).balance;
        if balance < cost {
            return Err(ClientError::Rejected(format!(
                "insufficient funds: balance {balance}, cost {cost}"
            )));
        }

        state.pool.push(PooledTransfer {
            hash,
            from,
            to,
            value,
            gas_price,
            nonce,
        });
        state.pool_nonces.insert(from, nonce + 1);
        Ok(hash)
    }
}

impl SimState {
    fn height(&self) -> u64 {
        self.blocks.len() as u64 - 1
    }

    fn account(&self, address: Address) -> AccountInfo {
        match self.db.basic_ref(address) {
            Ok(Some(info)) => info,
            _ => AccountInfo::default(),
        }
    }

    fn pending_nonce(&self, address: Address) -> u64 {
        self.pool_nonces
            .get(&address)
            .copied()
            .unwrap_or_else(|| self.account(address).nonce)
    }

    fn balance_at(&self, address: Address, number: u64) -> U256 {
        let Some(history) = self.balances.get(&address) else {
            return U256::ZERO;
        };
        let idx = history.partition_point(|(block, _)| *block <= number);
        idx.checked_sub(1)
            .map(|i| history[i].1)
            .unwrap_or_default()
    }

    fn block(&self, block: BlockId) -> Result<&SimBlock, ClientError> {
        let found = match block {
            BlockId::Latest => self.blocks.last(),
            BlockId::Number(n) => usize::try_from(n).ok().and_then(|i| self.blocks.get(i)),
        };
        found.ok_or_else(|| ClientError::NotFound(format!("block {block:?}")))
    }
}

/// Dials clients of one [`SimLedger`]. Dialing never fails.
#[derive(Clone)]
pub struct SimConnector {
    ledger: Arc<SimLedger>,
}

#[async_trait]
impl Connector for SimConnector {
    type Client = SimClient;

    async fn dial(&self) -> Result<SimClient, ClientError> {
        Ok(SimClient {
            ledger: Arc::clone(&self.ledger),
        })
    }

    fn endpoint(&self) -> &str {
        "sim://local"
    }
}

#[derive(Clone)]
pub struct SimClient {
    ledger: Arc<SimLedger>,
}

#[async_trait]
impl LedgerClient for SimClient {
    async fn balance_of(&self, address: Address, block: BlockId) -> Result<U256, ClientError> {
        let mut state = self.ledger.state.lock();
        self.ledger.catch_up(&mut state);
        match block {
            BlockId::Latest => Ok(state.account(address).balance),
            BlockId::Number(n) if n <= state.height() => Ok(state.balance_at(address, n)),
            BlockId::Number(n) => Err(ClientError::NotFound(format!("block {n}"))),
        }
    }

    async fn next_nonce(&self, address: Address, tag: NonceTag) -> Result<u64, ClientError> {
        let mut state = self.ledger.state.lock();
        self.ledger.catch_up(&mut state);
        Ok(match tag {
            NonceTag::Pending => state.pending_nonce(address),
            NonceTag::Latest => state.account(address).nonce,
        })
    }

    async fn header_at(&self, block: BlockId) -> Result<BlockHeader, ClientError> {
        let mut state = self.ledger.state.lock();
        self.ledger.catch_up(&mut state);
        state.block(block).map(|b| b.header)
    }

    async fn transaction_count(&self, block_hash: B256) -> Result<u64, ClientError> {
        let mut state = self.ledger.state.lock();
        self.ledger.catch_up(&mut state);
        state
            .blocks
            .iter()
            .rev()
            .find(|b| b.header.hash == block_hash)
            .map(|b| b.tx_count)
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
        self.ledger.submit(signer, to, amount, gas_price, nonce)
    }

    async fn transaction_status(&self, tx_hash: B256) -> Result<TxStatus, ClientError> {
        let mut state = self.ledger.state.lock();
        self.ledger.catch_up(&mut state);
        Ok(match state.receipts.get(&tx_hash) {
            Some(&success) => TxStatus::Confirmed { success },
            None => TxStatus::Pending,
        })
    }
}

/// Builds a simulated ledger that pre-funds `master` with `ether` ether.
pub fn funded_ledger(block_time: Duration, master: Address, ether: u64) -> Arc<SimLedger> {
    let balance = U256::from(ether) * U256::from(crate::config::WEI_PER_ETHER);
    info!(%master, ether, block_ms = block_time.as_millis() as u64, "Simulated ledger ready");
    SimLedger::new(block_time, &[(master, balance)])
}

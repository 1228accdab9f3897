//! Funding of ephemeral accounts from the master account.
//!
//! Funding never gives up: dial failures, rejected submissions and failed
//! receipts all lead to another attempt. Only cancellation of the run ends the
//! loop early.

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, B256, U256};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{BlockId, ClientError, Connector, LedgerClient, NonceTag};
use crate::{Account, ConfirmationWatcher, Error, RunConfig};

/// The funded account every instance draws its initial balance from.
///
/// The master's next nonce is cached behind an async mutex so instances
/// bootstrapping at the same time take consecutive nonces instead of racing
/// for the same one. The lock is held for the submission only.
#[derive(Debug)]
pub struct MasterAccount {
    account: Account,
    next_nonce: Mutex<Option<u64>>,
}

impl MasterAccount {
    pub fn new(account: Account) -> Self {
        Self {
            account,
            next_nonce: Mutex::new(None),
        }
    }

    pub fn address(&self) -> Address {
        self.account.address
    }

    /// Submits a transfer from the master account.
    ///
    /// A rejected submission drops the cached nonce so the next call reads it
    /// back from the ledger.
    pub async fn submit<C>(
        &self,
        client: &C,
        to: Address,
        amount: U256,
        gas_price: u128,
    ) -> Result<B256, ClientError>
    where
        C: LedgerClient + ?Sized,
    {
        let mut slot = self.next_nonce.lock().await;
        let nonce = match *slot {
            Some(nonce) => nonce,
            None => {
                client
                    .next_nonce(self.account.address, NonceTag::Pending)
                    .await?
            }
        };

        match client
            .submit_transfer(&self.account, to, amount, gas_price, nonce)
            .await
        {
            Ok(hash) => {
                *slot = Some(nonce + 1);
                Ok(hash)
            }
            Err(e) => {
                *slot = None;
                Err(e)
            }
        }
    }
}

/// Outcome of funding one address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FundingReceipt {
    /// Funding attempts made, including failed dials.
    pub attempts: u32,
    /// Hash of the transfer that delivered the funds.
    pub tx_hash: B256,
}

/// Funds ephemeral accounts, dialing its own connection on first use.
pub struct Funder<Cn: Connector> {
    connector: Arc<Cn>,
    master: Arc<MasterAccount>,
    client: Option<Cn::Client>,
    amount: U256,
    gas_price: u128,
    retry_delay: Duration,
    watcher: ConfirmationWatcher,
    cancel: CancellationToken,
}

impl<Cn: Connector> Funder<Cn> {
    pub fn new(
        connector: Arc<Cn>,
        master: Arc<MasterAccount>,
        config: &RunConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            connector,
            master,
            client: None,
            amount: config.funding_amount,
            gas_price: config.gas_price,
            retry_delay: config.retry_delay,
            watcher: ConfirmationWatcher::new(config.poll_interval),
            cancel,
        }
    }

    /// Transfers the funding amount to `target` and waits until it arrived.
    ///
    /// Returns [`Error::Cancelled`] if the run is cancelled first; no other
    /// error escapes.
    pub async fn fund(&mut self, target: Address) -> Result<FundingReceipt, Error> {
        let mut attempts = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            attempts += 1;

            if self.client.is_none() {
                match self.connector.dial().await {
                    Ok(client) => self.client = Some(client),
                    Err(e) => {
                        warn!(endpoint = self.connector.endpoint(), attempts, error = %e, "Dial failed, retrying funding");
                        pause(self.retry_delay).await;
                        continue;
                    }
                }
            }

            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                outcome = self.attempt(target) => outcome,
            };

            match outcome {
                Ok(Some(tx_hash)) => {
                    info!(%target, attempts, %tx_hash, "Account funded");
                    return Ok(FundingReceipt { attempts, tx_hash });
                }
                Ok(None) => debug!(%target, attempts, "Funding transfer failed, retrying"),
                Err(e) => debug!(%target, attempts, error = %e, "Funding attempt errored, retrying"),
            }
            pause(self.retry_delay).await;
        }
    }

    /// One funding transfer. `Ok(None)` means the transfer confirmed as failed
    /// and the balance is still short.
    async fn attempt(&self, target: Address) -> Result<Option<B256>, ClientError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| ClientError::Dial("not connected".into()))?;

        let tx_hash = self
            .master
            .submit(client, target, self.amount, self.gas_price)
            .await?;
        if self.watcher.wait(client, tx_hash).await {
            return Ok(Some(tx_hash));
        }

        let balance = client.balance_of(target, BlockId::Latest).await?;
        Ok((balance >= self.amount).then_some(tx_hash))
    }

    /// Hands over the connection dialed while funding.
    pub fn into_client(self) -> Option<Cn::Client> {
        self.client
    }
}

/// Waits before a retry; a zero delay still yields to the scheduler.
pub(crate) async fn pause(delay: Duration) {
    if delay.is_zero() {
        tokio::task::yield_now().await;
    } else {
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::MockLedger;

    fn test_config() -> RunConfig {
        RunConfig::default()
            .with_funding_amount(U256::from(1_000_000u64))
            .with_poll_interval(Duration::from_millis(100))
    }

    fn funder(ledger: &Arc<MockLedger>, master: &Arc<MasterAccount>) -> Funder<crate::client::mock::MockConnector> {
        Funder::new(
            Arc::new(ledger.connector()),
            Arc::clone(master),
            &test_config(),
            CancellationToken::new(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_failures_are_retried() {
        let ledger = MockLedger::new();
        ledger.configure(|s| s.dial_failures = 2);
        let master = Arc::new(MasterAccount::new(Account::generate()));
        let target = Account::generate().address;

        let mut funder = funder(&ledger, &master);
        let receipt = funder.fund(target).await.unwrap();

        assert_eq!(receipt.attempts, 3);
        assert_eq!(ledger.inspect(|s| s.dial_attempts), 3);
        assert!(funder.into_client().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_submissions_resync_master_nonce() {
        let ledger = MockLedger::new();
        ledger.configure(|s| s.submit_failures = 2);
        let master = Arc::new(MasterAccount::new(Account::generate()));

        let mut funder = funder(&ledger, &master);
        let receipt = funder.fund(Account::generate().address).await.unwrap();

        assert_eq!(receipt.attempts, 3);
        let nonces: Vec<u64> = ledger.inspect(|s| s.submissions.iter().map(|t| t.nonce).collect());
        assert_eq!(nonces, vec![0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_receipt_triggers_new_transfer() {
        let ledger = MockLedger::new();
        let master = Arc::new(MasterAccount::new(Account::generate()));
        ledger.configure(|s| {
            s.failing_senders.insert(master.address(), 1);
        });

        let target = Account::generate().address;
        let mut funder = funder(&ledger, &master);
        let receipt = funder.fund(target).await.unwrap();

        assert_eq!(receipt.attempts, 2);
        let submissions = ledger.inspect(|s| s.submissions.clone());
        assert_eq!(submissions.len(), 2);
        assert_eq!(submissions[1].hash, receipt.tx_hash);
        assert_eq!(submissions[1].nonce, 1);
        assert!(submissions.iter().all(|t| t.to == target));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_funders_take_consecutive_master_nonces() {
        let ledger = MockLedger::new();
        let master = Arc::new(MasterAccount::new(Account::generate()));

        let mut first = funder(&ledger, &master);
        let mut second = funder(&ledger, &master);
        let (a, b) = tokio::join!(
            async {
                let x = first.fund(Account::generate().address).await.unwrap();
                let y = first.fund(Account::generate().address).await.unwrap();
                (x, y)
            },
            async {
                let x = second.fund(Account::generate().address).await.unwrap();
                let y = second.fund(Account::generate().address).await.unwrap();
                (x, y)
            }
        );

        for receipt in [a.0, a.1, b.0, b.1] {
            assert_eq!(receipt.attempts, 1);
        }
        let mut nonces: Vec<u64> = ledger.inspect(|s| s.submissions.iter().map(|t| t.nonce).collect());
        nonces.sort_unstable();
        assert_eq!(nonces, vec![0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_funding_gives_up() {
        let ledger = MockLedger::new();
        ledger.configure(|s| s.dial_failures = usize::MAX);
        let master = Arc::new(MasterAccount::new(Account::generate()));
        let cancel = CancellationToken::new();
        let mut funder = Funder::new(
            Arc::new(ledger.connector()),
            master,
            &test_config().with_retry_delay(Duration::from_millis(10)),
            cancel.clone(),
        );

        let handle = tokio::spawn(async move { funder.fund(Address::ZERO).await });
        tokio::time::sleep(Duration::from_millis(55)).await;
        cancel.cancel();

        assert!(matches!(handle.await.unwrap(), Err(Error::Cancelled)));
    }
}

//! Confirmation polling.

use std::time::Duration;

use alloy_primitives::B256;
use tokio::time::sleep;
use tracing::{debug, trace};

use crate::client::{LedgerClient, TxStatus};

/// Polls a ledger until a transaction leaves the pending state.
///
/// Each poll sleeps first and then queries, so a transaction is never reported
/// confirmed sooner than one interval after submission. Query errors are
/// transient: they are logged and the next poll happens on the usual cadence.
#[derive(Debug, Clone, Copy)]
pub struct ConfirmationWatcher {
    poll_interval: Duration,
}

impl ConfirmationWatcher {
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    /// Waits for `tx_hash` to confirm and returns whether its receipt reports
    /// success.
    pub async fn wait<C>(&self, client: &C, tx_hash: B256) -> bool
    where
        C: LedgerClient + ?Sized,
    {
        loop {
            sleep(self.poll_interval).await;
            match client.transaction_status(tx_hash).await {
                Ok(TxStatus::Pending) => trace!(%tx_hash, "Transaction still pending"),
                Ok(TxStatus::Confirmed { success }) => return success,
                Err(e) => debug!(%tx_hash, error = %e, "Status poll failed, retrying"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::MockLedger;
    use crate::Account;
    use alloy_primitives::{Address, U256};
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_wait_returns_receipt_status() {
        let ledger = MockLedger::new();
        let client = ledger.client();
        let sender = Account::generate();
        ledger.configure(|s| {
            s.failing_senders.insert(sender.address, 1);
        });

        let failed = client
            .submit_transfer(&sender, Account::generate().address, U256::from(1), 1, 0)
            .await
            .unwrap();
        let succeeded = client
            .submit_transfer(&sender, Account::generate().address, U256::from(1), 1, 1)
            .await
            .unwrap();

        let watcher = ConfirmationWatcher::new(Duration::from_millis(100));
        assert!(!watcher.wait(&client, failed).await);
        assert!(watcher.wait(&client, succeeded).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_and_pending_are_retried() {
        let ledger = MockLedger::new();
        let client = ledger.client();
        ledger.configure(|s| {
            s.pending_polls = 2;
            s.status_errors = 3;
        });

        let hash = client
            .submit_transfer(&Account::generate(), Address::ZERO, U256::from(1), 1, 0)
            .await
            .unwrap();

        let watcher = ConfirmationWatcher::new(Duration::from_secs(1));
        let start = Instant::now();
        assert!(watcher.wait(&client, hash).await);

        // 3 errors + 2 pending + 1 confirmed, one interval each.
        assert_eq!(ledger.inspect(|s| s.status_queries), 6);
        assert_eq!(start.elapsed(), Duration::from_secs(6));
    }
}

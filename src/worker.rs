//! Instance workers.
//!
//! An [`Instance`] owns one [`AccountPair`] for its whole life. It funds both
//! accounts, announces itself with `InstanceStarted`, and then runs rounds of
//! two hops (A to B, then B back to A) until its [`TerminationPolicy`] says
//! stop. Every hop waits for its confirmation before the next one is sent, so
//! each outcome carries a directly measured latency.

use std::sync::Arc;

use alloy_primitives::{Address, B256};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bootstrap::pause;
use crate::client::{Connector, LedgerClient, NonceTag};
use crate::{
    Account, ConfirmationWatcher, Event, EventKind, Funder, MasterAccount, RunConfig,
    TerminationPolicy,
};

/// The two ephemeral accounts an instance transfers between.
#[derive(Debug, Clone)]
pub struct AccountPair {
    pub a: Account,
    pub b: Account,
}

impl AccountPair {
    /// Generates two fresh accounts.
    pub fn generate() -> Self {
        Self {
            a: Account::generate(),
            b: Account::generate(),
        }
    }
}

/// Per-instance counts returned when the instance exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstanceSummary {
    pub id: usize,
    /// Whether the instance got past bootstrapping.
    pub started: bool,
    /// Rounds fully completed.
    pub rounds: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// One side of the pair together with the nonce it will use next.
///
/// `None` means the nonce must be read back from the ledger before the next
/// submission.
#[derive(Debug)]
struct Sender {
    account: Account,
    next_nonce: Option<u64>,
}

impl Sender {
    fn new(account: Account) -> Self {
        Self {
            account,
            next_nonce: None,
        }
    }
}

/// A load-generating worker.
pub struct Instance<Cn: Connector> {
    id: usize,
    pair: AccountPair,
    connector: Arc<Cn>,
    master: Arc<MasterAccount>,
    config: Arc<RunConfig>,
    events: mpsc::Sender<Event>,
    cancel: CancellationToken,
}

impl<Cn: Connector> Instance<Cn> {
    pub fn new(
        id: usize,
        pair: AccountPair,
        connector: Arc<Cn>,
        master: Arc<MasterAccount>,
        config: Arc<RunConfig>,
        events: mpsc::Sender<Event>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            pair,
            connector,
            master,
            config,
            events,
            cancel,
        }
    }

    /// Runs the instance to completion.
    ///
    /// `InstanceStopped` is sent exactly once, and only if `InstanceStarted`
    /// was sent before it.
    pub async fn run(self) -> InstanceSummary {
        let Self {
            id,
            pair,
            connector,
            master,
            config,
            events,
            cancel,
        } = self;
        let mut summary = InstanceSummary {
            id,
            ..Default::default()
        };

        // Fund sequentially: both transfers come from the same master nonce.
        let mut funder = Funder::new(connector, master, &config, cancel.clone());
        for address in [pair.a.address, pair.b.address] {
            if let Err(e) = funder.fund(address).await {
                info!(instance = id, error = %e, "Instance gave up during bootstrap");
                return summary;
            }
        }
        let Some(client) = funder.into_client() else {
            warn!(instance = id, "Bootstrap finished without a connection");
            return summary;
        };

        if !emit(&events, id, EventKind::InstanceStarted).await {
            return summary;
        }
        summary.started = true;
        info!(instance = id, a = %pair.a.address, b = %pair.b.address, "Instance running");

        let watcher = ConfirmationWatcher::new(config.poll_interval);
        let mut sides = [Sender::new(pair.a), Sender::new(pair.b)];
        let running_since = Instant::now();
        let deadline = match config.policy {
            TerminationPolicy::FixedDuration(d) => Some(running_since + d),
            _ => None,
        };

        'rounds: while config
            .policy
            .should_continue(summary.rounds, running_since.elapsed())
        {
            for (from, to) in [(0, 1), (1, 0)] {
                let recipient = sides[to].account.address;
                let kind = tokio::select! {
                    _ = cancel.cancelled() => break 'rounds,
                    kind = hop(&client, &mut sides[from], recipient, &config, &watcher, deadline) => kind,
                };

                match kind {
                    EventKind::TxSucceeded { .. } => summary.succeeded += 1,
                    _ => summary.failed += 1,
                }
                if !emit(&events, id, kind).await {
                    break 'rounds;
                }
            }
            summary.rounds += 1;
        }

        emit(&events, id, EventKind::InstanceStopped).await;
        info!(
            instance = id,
            rounds = summary.rounds,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Instance stopped"
        );
        summary
    }
}

/// Sends one event; returns false once the recorder is gone.
async fn emit(events: &mpsc::Sender<Event>, id: usize, kind: EventKind) -> bool {
    if events.send(Event::new(id, kind)).await.is_err() {
        debug!(instance = id, ?kind, "Recorder closed, dropping event");
        return false;
    }
    true
}

/// Submits one transfer from `sender` to `to` and waits for its confirmation.
///
/// A hop whose submission cannot be placed is reported as failed.
async fn hop<C>(
    client: &C,
    sender: &mut Sender,
    to: Address,
    config: &RunConfig,
    watcher: &ConfirmationWatcher,
    deadline: Option<Instant>,
) -> EventKind
where
    C: LedgerClient + ?Sized,
{
    let Some(tx_hash) = submit(client, sender, to, config, deadline).await else {
        return EventKind::TxFailed;
    };
    let submitted_at = Instant::now();

    if watcher.wait(client, tx_hash).await {
        EventKind::TxSucceeded {
            latency: submitted_at.elapsed(),
        }
    } else {
        EventKind::TxFailed
    }
}

/// Places one transfer on the ledger.
///
/// A rejection with a cached nonce resyncs the nonce from the pending pool and
/// resubmits once; a rejection with a freshly fetched nonce gives up the hop.
/// Nonce lookups are retried until they answer or `deadline` passes.
async fn submit<C>(
    client: &C,
    sender: &mut Sender,
    to: Address,
    config: &RunConfig,
    deadline: Option<Instant>,
) -> Option<B256>
where
    C: LedgerClient + ?Sized,
{
    let from = sender.account.address;
    loop {
        let (nonce, fresh) = match sender.next_nonce {
            Some(nonce) => (nonce, false),
            None => match client.next_nonce(from, NonceTag::Pending).await {
                Ok(nonce) => {
                    sender.next_nonce = Some(nonce);
                    (nonce, true)
                }
                Err(e) => {
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        debug!(%from, error = %e, "Nonce fetch failed past the deadline");
                        return None;
                    }
                    debug!(%from, error = %e, "Nonce fetch failed, retrying");
                    pause(config.retry_delay).await;
                    continue;
                }
            },
        };

        match client
            .submit_transfer(&sender.account, to, config.transfer_amount, config.gas_price, nonce)
            .await
        {
            Ok(tx_hash) => {
                sender.next_nonce = Some(nonce + 1);
                return Some(tx_hash);
            }
            Err(e) => {
                sender.next_nonce = None;
                if fresh {
                    debug!(%from, nonce, error = %e, "Submission rejected, failing hop");
                    return None;
                }
                debug!(%from, nonce, error = %e, "Submission rejected, resyncing nonce");
                pause(config.retry_delay).await;
            }
        }
    }
}

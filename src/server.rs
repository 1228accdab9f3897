//! Load test orchestration.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::{BlockId, Connector, LedgerClient};
use crate::{
    Account, AccountPair, Error, Instance, InstanceSummary, MasterAccount, Recorder, Report,
    RunConfig,
};

/// Outcome of a finished run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Chain height when the run started.
    pub start_height: u64,
    /// Chain height after every instance was joined.
    pub end_height: u64,
    /// The recorder's final report.
    pub report: Report,
    /// One entry per instance, ordered by instance id.
    pub instances: Vec<InstanceSummary>,
}

/// Runs a configured number of instances against one ledger and records
/// their throughput.
///
/// # Example
///
/// ```no_run
/// use ledger_load::client::rpc::RpcConnector;
/// use ledger_load::{Account, LoadTest, RunConfig, TerminationPolicy};
/// use std::sync::Arc;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn demo(master: Account) -> Result<(), ledger_load::Error> {
/// let config = RunConfig::default()
///     .with_instances(10)
///     .with_policy(TerminationPolicy::FixedRounds(50));
/// let test = LoadTest::new(Arc::new(RpcConnector::new("http://127.0.0.1:8545")), master, config);
/// let summary = test.run(CancellationToken::new()).await?;
/// println!("{}", summary.report);
/// # Ok(())
/// # }
/// ```
pub struct LoadTest<Cn: Connector> {
    connector: Arc<Cn>,
    master: Arc<MasterAccount>,
    config: Arc<RunConfig>,
}

impl<Cn: Connector> LoadTest<Cn> {
    pub fn new(connector: Arc<Cn>, master: Account, config: RunConfig) -> Self {
        Self {
            connector,
            master: Arc::new(MasterAccount::new(master)),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Runs the test until every started instance has stopped.
    ///
    /// Only the initial dial and the height queries around the run can fail;
    /// everything inside the instances is retried. Cancelling `cancel` makes
    /// the instances stop after their current hop, which ends the run with a
    /// final report.
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunSummary, Error> {
        let client = self.connector.dial().await.map_err(|source| Error::Dial {
            endpoint: self.connector.endpoint().to_string(),
            source,
        })?;
        let start_height = client.header_at(BlockId::Latest).await?.number;
        info!(
            start_height,
            instances = self.config.instances,
            policy = ?self.config.policy,
            master = %self.master.address(),
            "Start test"
        );

        let (events, receiver) = mpsc::channel(self.config.channel_capacity());
        let workers = cancel.child_token();
        let mut set = JoinSet::new();
        for id in 0..self.config.instances {
            let instance = Instance::new(
                id,
                AccountPair::generate(),
                Arc::clone(&self.connector),
                Arc::clone(&self.master),
                Arc::clone(&self.config),
                events.clone(),
                workers.child_token(),
            );
            set.spawn(instance.run());
        }
        // The recorder must see the channel close once every instance exits.
        drop(events);

        let report = Recorder::new(self.config.report).run(receiver).await;

        // Instances still bootstrapping never counted as live; stop them too.
        workers.cancel();
        let mut instances = Vec::with_capacity(self.config.instances);
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(summary) => instances.push(summary),
                Err(e) => warn!(error = %e, "Instance task failed"),
            }
        }
        instances.sort_by_key(|summary| summary.id);

        let end_height = client.header_at(BlockId::Latest).await?.number;
        info!(
            "Done test. Started at block {}, end at block {}",
            start_height, end_height
        );

        Ok(RunSummary {
            start_height,
            end_height,
            report,
            instances,
        })
    }
}

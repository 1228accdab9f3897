//! Run and node configuration.

use alloy_primitives::U256;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::{Account, Error};

/// One ether in wei.
pub const WEI_PER_ETHER: u64 = 1_000_000_000_000_000_000;

/// When an instance leaves its transfer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TerminationPolicy {
    /// Never stops on its own; only cancellation ends the loop.
    #[default]
    Infinite,
    /// Runs exactly this many A->B / B->A rounds.
    FixedRounds(u64),
    /// Starts new rounds while less than this much time has passed since the
    /// loop began. The last round may overrun by one round's latency.
    FixedDuration(Duration),
}

impl TerminationPolicy {
    /// Returns true if another round should start.
    pub fn should_continue(&self, rounds_completed: u64, running_for: Duration) -> bool {
        match *self {
            TerminationPolicy::Infinite => true,
            TerminationPolicy::FixedRounds(rounds) => rounds_completed < rounds,
            TerminationPolicy::FixedDuration(duration) => running_for < duration,
        }
    }
}

/// Reporting cadences of the recorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportIntervals {
    /// Length of the "since last report" window.
    pub window: Duration,
    /// Period between full-run snapshots.
    pub snapshot: Duration,
}

impl Default for ReportIntervals {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(5),
            snapshot: Duration::from_secs(20),
        }
    }
}

/// Immutable configuration of one load test run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Number of concurrent instances.
    pub instances: usize,
    /// Amount sent from the master account to each ephemeral account.
    pub funding_amount: U256,
    /// Termination policy shared by all instances.
    pub policy: TerminationPolicy,
    /// Amount moved by every hop.
    pub transfer_amount: U256,
    /// Gas price attached to every transfer, in wei.
    pub gas_price: u128,
    /// Delay between confirmation polls.
    pub poll_interval: Duration,
    /// Delay before resubmitting after a rejected submission.
    pub retry_delay: Duration,
    /// Recorder reporting cadences.
    pub report: ReportIntervals,
    /// Event channel slots reserved per instance.
    pub channel_capacity_per_instance: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            instances: 1,
            funding_amount: U256::from(WEI_PER_ETHER),
            policy: TerminationPolicy::Infinite,
            transfer_amount: U256::from(10_000u64),
            gas_price: 1_000_000_000,
            poll_interval: Duration::from_secs(1),
            retry_delay: Duration::from_millis(100),
            report: ReportIntervals::default(),
            channel_capacity_per_instance: 1024,
        }
    }
}

impl RunConfig {
    /// Sets the number of instances.
    pub fn with_instances(mut self, instances: usize) -> Self {
        self.instances = instances;
        self
    }

    /// Sets the per-account funding amount.
    pub fn with_funding_amount(mut self, amount: U256) -> Self {
        self.funding_amount = amount;
        self
    }

    /// Sets the termination policy.
    pub fn with_policy(mut self, policy: TerminationPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the amount moved per hop.
    pub fn with_transfer_amount(mut self, amount: U256) -> Self {
        self.transfer_amount = amount;
        self
    }

    /// Sets the confirmation poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the resubmission delay.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Sets the recorder cadences.
    pub fn with_report_intervals(mut self, report: ReportIntervals) -> Self {
        self.report = report;
        self
    }

    /// Total capacity of the shared event channel.
    pub fn channel_capacity(&self) -> usize {
        self.channel_capacity_per_instance
            .saturating_mul(self.instances)
            .max(1)
    }
}

/// Node endpoint and master key, as stored in the JSON config file.
#[derive(Clone, Deserialize)]
pub struct NodeConfig {
    /// JSON-RPC endpoint of the node.
    #[serde(rename = "Node", alias = "node")]
    pub node: String,
    /// Hex encoded private key of the funded master account.
    #[serde(rename = "PrivateKey", alias = "private_key")]
    pub private_key: String,
}

impl NodeConfig {
    /// Loads the configuration file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw).map_err(|source| Error::ConfigParse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Parses the master account key.
    pub fn master_account(&self) -> Result<Account, Error> {
        Account::from_private_key_hex(&self.private_key)
    }
}

impl std::fmt::Debug for NodeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeConfig")
            .field("node", &self.node)
            .finish_non_exhaustive()
    }
}

//! Chain-side throughput monitor.
//!
//! Where the [`Recorder`](crate::Recorder) measures what the instances observe,
//! the [`BlockMonitor`] measures what the chain actually includes: it walks
//! blocks upward from a start height and reports per-block and cumulative
//! transactions per second from block timestamps.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::client::{BlockHeader, BlockId, LedgerClient};
use crate::Error;

/// Numbers for one non-empty block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockReport {
    pub height: u64,
    /// Seconds since the previous block.
    pub duration_s: u64,
    pub txns: u64,
    pub total_txns: u64,
    /// `None` when the block shares its parent's timestamp.
    pub block_tps: Option<f64>,
    pub total_tps: Option<f64>,
}

/// Running totals since the start height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockStats {
    /// Last height folded in.
    pub height: u64,
    pub total_txns: u64,
    /// Seconds covered by the folded blocks.
    pub total_time_s: u64,
    last_timestamp: u64,
}

impl BlockStats {
    /// Starts counting after `start`.
    pub fn new(start: &BlockHeader) -> Self {
        Self {
            height: start.number,
            total_txns: 0,
            total_time_s: 0,
            last_timestamp: start.timestamp,
        }
    }

    /// Folds in the next block. Empty blocks advance time but yield no report.
    pub fn record(&mut self, header: &BlockHeader, txns: u64) -> Option<BlockReport> {
        let duration_s = header.timestamp.saturating_sub(self.last_timestamp);
        self.height = header.number;
        self.last_timestamp = header.timestamp;
        self.total_txns += txns;
        self.total_time_s += duration_s;

        if txns == 0 {
            return None;
        }
        Some(BlockReport {
            height: header.number,
            duration_s,
            txns,
            total_txns: self.total_txns,
            block_tps: rate(txns, duration_s),
            total_tps: rate(self.total_txns, self.total_time_s),
        })
    }
}

fn rate(txns: u64, secs: u64) -> Option<f64> {
    (secs > 0).then(|| txns as f64 / secs as f64)
}

/// Walks the chain from a start height, one block at a time.
#[derive(Debug, Clone, Copy)]
pub struct BlockMonitor {
    retry_interval: Duration,
    stop_height: Option<u64>,
}

impl Default for BlockMonitor {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(1),
            stop_height: None,
        }
    }
}

impl BlockMonitor {
    /// Stops after this height has been folded in.
    pub fn with_stop_height(mut self, height: Option<u64>) -> Self {
        self.stop_height = height;
        self
    }

    /// Follows the chain until cancelled or past the stop height.
    ///
    /// Only a missing start block is fatal; later lookups are retried.
    pub async fn run<C>(
        &self,
        client: &C,
        start_height: u64,
        cancel: CancellationToken,
    ) -> Result<BlockStats, Error>
    where
        C: LedgerClient + ?Sized,
    {
        let start = client.header_at(BlockId::Number(start_height)).await?;
        info!(height = start_height, "Start recording");

        let mut stats = BlockStats::new(&start);
        let mut next = start_height + 1;
        while !cancel.is_cancelled() && self.stop_height.map_or(true, |stop| next <= stop) {
            let fetched = async {
                let header = client.header_at(BlockId::Number(next)).await?;
                let txns = client.transaction_count(header.hash).await?;
                Ok::<_, crate::ClientError>((header, txns))
            };
            let (header, txns) = tokio::select! {
                _ = cancel.cancelled() => break,
                fetched = fetched => match fetched {
                    Ok(block) => block,
                    Err(e) => {
                        debug!(height = next, error = %e, "Block not available yet");
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(self.retry_interval) => continue,
                        }
                    }
                },
            };

            match stats.record(&header, txns) {
                Some(report) => info!(
                    height = report.height,
                    duration_s = report.duration_s,
                    txns = report.txns,
                    total_txns = report.total_txns,
                    block_tps = report.block_tps.unwrap_or_default(),
                    total_tps = report.total_tps.unwrap_or_default(),
                    "Block recorded"
                ),
                None => info!(height = header.number, "Skip empty block"),
            }
            next += 1;
        }
        Ok(stats)
    }
}

//! CLI for driving load tests against a ledger node.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{utils::parse_ether, Address, U256};
use clap::{Args, Parser, Subcommand};
use eyre::{Result, WrapErr};
use ledger_load::client::rpc::{RpcClient, RpcConnector};
use ledger_load::monitor::BlockMonitor;
use ledger_load::sim::funded_ledger;
use ledger_load::{
    Account, BlockId, Connector, LedgerClient, LoadTest, MasterAccount, NodeConfig,
    ReportIntervals, RunConfig, RunSummary, TerminationPolicy,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ledger-load", about = "Load generator for Ethereum-compatible nodes")]
struct Cli {
    /// Node configuration file with `Node` and `PrivateKey`.
    #[arg(long, global = true, default_value = "./config.json")]
    conf: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the balance of an address in wei.
    Balance {
        address: Address,
        /// Block height; latest if omitted.
        #[arg(long)]
        height: Option<u64>,
    },
    /// Print a block header.
    Header {
        /// Block height; latest if omitted.
        height: Option<u64>,
    },
    /// Print the number of transactions in a block.
    TxCount { height: u64 },
    /// Send wei from the master account.
    Transfer { to: Address, wei: U256 },
    /// Run a load test against the configured node.
    Run(RunArgs),
    /// Run a load test against an in-process simulated ledger.
    Simulate {
        #[command(flatten)]
        run: RunArgs,
        /// Block interval of the simulated ledger in milliseconds.
        #[arg(long = "block-time", value_name = "MS", default_value_t = 1000)]
        block_time_ms: u64,
    },
    /// Follow the chain from a height and report included throughput.
    Monitor {
        start_height: u64,
        /// Stop after this height.
        #[arg(long)]
        until: Option<u64>,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Number of concurrent instances.
    #[arg(long, default_value_t = 1)]
    instances: usize,
    /// Stop each instance after this many rounds.
    #[arg(long, conflicts_with = "duration")]
    rounds: Option<u64>,
    /// Stop starting new rounds after this many seconds.
    #[arg(long)]
    duration: Option<u64>,
    /// Ether sent to each ephemeral account.
    #[arg(long = "init-ether", default_value = "1")]
    init_ether: String,
    /// Wei moved by every hop.
    #[arg(long = "amount-wei", default_value = "10000")]
    amount_wei: U256,
    /// Confirmation poll interval in milliseconds.
    #[arg(long = "poll-ms", default_value_t = 1000)]
    poll_ms: u64,
    /// Delay before retrying a rejected submission or failed nonce lookup.
    #[arg(long = "retry-ms", default_value_t = 100)]
    retry_ms: u64,
    /// Seconds covered by each window report.
    #[arg(long = "record-secs", default_value_t = 5, value_parser = clap::value_parser!(u64).range(1..))]
    record_secs: u64,
    /// Seconds between all-time snapshot reports.
    #[arg(long = "total-record-secs", default_value_t = 20, value_parser = clap::value_parser!(u64).range(1..))]
    total_record_secs: u64,
}

impl RunArgs {
    fn run_config(&self) -> Result<RunConfig> {
        let policy = match (self.rounds, self.duration) {
            (Some(rounds), _) => TerminationPolicy::FixedRounds(rounds),
            (None, Some(secs)) => TerminationPolicy::FixedDuration(Duration::from_secs(secs)),
            (None, None) => TerminationPolicy::Infinite,
        };
        let funding = parse_ether(&self.init_ether)
            .wrap_err_with(|| format!("invalid --init-ether {}", self.init_ether))?;

        Ok(RunConfig::default()
            .with_instances(self.instances)
            .with_policy(policy)
            .with_funding_amount(funding)
            .with_transfer_amount(self.amount_wei)
            .with_poll_interval(Duration::from_millis(self.poll_ms))
            .with_retry_delay(Duration::from_millis(self.retry_ms))
            .with_report_intervals(ReportIntervals {
                window: Duration::from_secs(self.record_secs),
                snapshot: Duration::from_secs(self.total_record_secs),
            }))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ledger_load=info")),
        )
        .init();

    let cli = Cli::parse();
    let cancel = CancellationToken::new();
    spawn_ctrl_c(cancel.clone());

    match cli.command {
        Command::Simulate { run, block_time_ms } => {
            let master = Account::generate();
            let ledger = funded_ledger(Duration::from_millis(block_time_ms), master.address, 1_000_000);
            let test = LoadTest::new(Arc::new(ledger.connector()), master, run.run_config()?);
            print_summary(&test.run(cancel).await?);
            Ok(())
        }
        command => {
            let conf = NodeConfig::load(&cli.conf)?;
            run_against_node(command, &conf, cancel).await
        }
    }
}

async fn run_against_node(command: Command, conf: &NodeConfig, cancel: CancellationToken) -> Result<()> {
    let connector = RpcConnector::new(conf.node.clone());
    let master = conf.master_account()?;

    let command = match command {
        Command::Run(run) => {
            let test = LoadTest::new(Arc::new(connector), master, run.run_config()?);
            print_summary(&test.run(cancel).await?);
            return Ok(());
        }
        other => other,
    };

    let client: RpcClient = connector
        .dial()
        .await
        .wrap_err_with(|| format!("failed to dial {}", conf.node))?;

    match command {
        Command::Balance { address, height } => {
            let block = height.map_or(BlockId::Latest, BlockId::Number);
            let balance = client.balance_of(address, block).await?;
            println!("{balance}");
        }
        Command::Header { height } => {
            let block = height.map_or(BlockId::Latest, BlockId::Number);
            let header = client.header_at(block).await?;
            println!("number:    {}", header.number);
            println!("timestamp: {}", header.timestamp);
            println!("hash:      {}", header.hash);
        }
        Command::TxCount { height } => {
            let header = client.header_at(BlockId::Number(height)).await?;
            let count = client.transaction_count(header.hash).await?;
            println!("{count}");
        }
        Command::Transfer { to, wei } => {
            let gas_price = RunConfig::default().gas_price;
            let master = MasterAccount::new(master);
            let hash = master.submit(&client, to, wei, gas_price).await?;
            info!(from = %master.address(), %to, %wei, %hash, "Transfer submitted");
            println!("{hash}");
        }
        Command::Monitor {
            start_height,
            until,
        } => {
            let stats = BlockMonitor::default()
                .with_stop_height(until)
                .run(&client, start_height, cancel)
                .await?;
            println!(
                "height {}, total txns {}, total time {} s",
                stats.height, stats.total_txns, stats.total_time_s
            );
        }
        Command::Run(_) | Command::Simulate { .. } => {}
    }
    Ok(())
}

fn spawn_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupted, stopping instances");
                cancel.cancel();
            }
            Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C"),
        }
    });
}

fn print_summary(summary: &RunSummary) {
    println!("{}", summary.report);
    println!(
        "blocks {} -> {}, instances started {}/{}",
        summary.start_height,
        summary.end_height,
        summary.instances.iter().filter(|i| i.started).count(),
        summary.instances.len(),
    );
}

//! chainevents CLI — watch a channel's blocks, transactions and chaincode
//! events, live or replayed.
//!
//! # Commands
//! ```text
//! chainevents blocks    --url <peer> --channel <id> [--start N|oldest] [--end N|newest]
//! chainevents tx        --tx-id <id|ALL> --url <peer> --channel <id>
//! chainevents chaincode --chaincode-id <id> --pattern <regex> --url <peer> --channel <id>
//! chainevents demo      [--blocks N]
//! chainevents version
//! ```
//!
//! Every event is printed to stdout as one JSON line; logs go to stderr.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;

use chainevents_core::{
    ChannelEventHub, ConnectionState, EndBlock, EventHubBuilder, EventHubConfig, LedgerBlock,
    LogConfig, MemoryLedger, Notification, PeerTarget, RegistrationOptions, StartBlock,
    UnsignedIdentity, ValidationCode,
};
use chainevents_ws::{WsDeliverConfig, WsDeliverTransport};

mod logging;

#[derive(Parser)]
#[command(
    name = "chainevents",
    about = "Channel event hub: watch blocks, transactions and chaincode events",
    version
)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON structured logs
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct StreamArgs {
    /// Peer deliver gateway URL, e.g. wss://peer0.org1.example.com:7051
    #[arg(long)]
    url: Option<String>,
    /// Channel name
    #[arg(long)]
    channel: Option<String>,
    /// First block to replay: a number or "oldest"
    #[arg(long)]
    start: Option<StartBlock>,
    /// Last block to replay: a number or "newest"
    #[arg(long)]
    end: Option<EndBlock>,
    /// Request full blocks (payloads and envelopes)
    #[arg(long)]
    full: bool,
    /// JSON config file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,
    /// MSP id presented to the gateway
    #[arg(long, default_value = "Org1MSP")]
    msp_id: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every block
    Blocks {
        #[command(flatten)]
        stream: StreamArgs,
    },

    /// Print commit statuses for one transaction id, or ALL
    Tx {
        #[arg(long)]
        tx_id: String,
        #[command(flatten)]
        stream: StreamArgs,
    },

    /// Print chaincode events whose name matches a pattern
    Chaincode {
        #[arg(long)]
        chaincode_id: String,
        /// Regular expression over event names
        #[arg(long, default_value = ".*")]
        pattern: String,
        #[command(flatten)]
        stream: StreamArgs,
    },

    /// Replay a seeded in-memory ledger
    Demo {
        #[arg(long, default_value_t = 5)]
        blocks: u64,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Blocks { stream } => {
            let (hub, config) = open_hub(&stream, cli.verbose, cli.json_logs)?;
            let (_, rx) = hub.subscribe_blocks(RegistrationOptions::new())?;
            run(&hub, &config, rx, |block| {
                json!({
                    "block": block.number,
                    "channel": block.channel_id,
                    "transactions": block.transactions.iter().map(|tx| json!({
                        "txId": tx.tx_id,
                        "validationCode": tx.validation_code,
                    })).collect::<Vec<_>>(),
                })
            })
            .await
        }

        Commands::Tx { tx_id, stream } => {
            let (hub, config) = open_hub(&stream, cli.verbose, cli.json_logs)?;
            let (_, rx) = hub.subscribe_tx(&tx_id, RegistrationOptions::new().unregister(false))?;
            run(&hub, &config, rx, |status| {
                json!({
                    "txId": status.tx_id,
                    "validationCode": status.validation_code,
                    "block": status.block_number,
                })
            })
            .await
        }

        Commands::Chaincode { chaincode_id, pattern, stream } => {
            let (hub, config) = open_hub(&stream, cli.verbose, cli.json_logs)?;
            let (_, rx) =
                hub.subscribe_chaincode(&chaincode_id, &pattern, RegistrationOptions::new())?;
            run(&hub, &config, rx, |notice| {
                json!({
                    "chaincodeId": notice.event.chaincode_id,
                    "eventName": notice.event.event_name,
                    "txId": notice.event.tx_id,
                    "block": notice.block_number,
                    "validationCode": notice.validation_code,
                })
            })
            .await
        }

        Commands::Demo { blocks } => {
            logging::init_tracing(&log_config(LogConfig::default(), cli.verbose, cli.json_logs));
            cmd_demo(blocks).await
        }

        Commands::Version => {
            println!("chainevents v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Resolve the config, install logging and build a WebSocket-backed hub.
fn open_hub(
    stream: &StreamArgs,
    verbose: bool,
    json_logs: bool,
) -> Result<(ChannelEventHub, EventHubConfig)> {
    let config = stream.resolve()?;
    logging::init_tracing(&log_config(config.log.clone(), verbose, json_logs));
    let hub = EventHubBuilder::new(config.channel_id.clone(), config.target()?)
        .transport(WsDeliverTransport::new(WsDeliverConfig::default()))
        .identity(UnsignedIdentity::new(stream.msp_id.clone()))
        .build()?;
    Ok((hub, config))
}

impl StreamArgs {
    /// Config file values overridden by flags.
    fn resolve(&self) -> Result<EventHubConfig> {
        let mut config = match &self.config {
            Some(path) => EventHubConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => {
                let url = self
                    .url
                    .clone()
                    .ok_or_else(|| anyhow!("--url or --config is required"))?;
                let channel = self
                    .channel
                    .clone()
                    .ok_or_else(|| anyhow!("--channel or --config is required"))?;
                EventHubConfig::new(channel, url)
            }
        };
        if let Some(url) = &self.url {
            config.peer.url = url.clone();
        }
        if let Some(channel) = &self.channel {
            config.channel_id = channel.clone();
        }
        if self.start.is_some() {
            config.start_block = self.start;
        }
        if self.end.is_some() {
            config.end_block = self.end;
        }
        config.full_block |= self.full;
        Ok(config)
    }
}

fn log_config(mut log: LogConfig, verbose: bool, json_logs: bool) -> LogConfig {
    if verbose {
        log.level = "debug".into();
    }
    log.json |= json_logs;
    log
}

/// Connect, print notifications until the stream ends or Ctrl-C.
///
/// A failure reported to the listener is returned as an error; only the
/// newest-block completion, a closed subscription or a numeric end block
/// count as a clean finish.
async fn run<T>(
    hub: &ChannelEventHub,
    config: &EventHubConfig,
    mut rx: UnboundedReceiver<Notification<T>>,
    render: impl Fn(&T) -> serde_json::Value,
) -> Result<()> {
    let options = config.connect_options()?;
    let numeric_end = matches!(options.end_block, Some(EndBlock::Number(_)));
    hub.connect_and_wait(options)
        .await
        .with_context(|| format!("connecting to {}", hub.peer_addr()))?;

    let mut tick = tokio::time::interval(Duration::from_millis(250));
    loop {
        tokio::select! {
            item = rx.recv() => match item {
                Some(item) => {
                    if emit(item, &render)? {
                        return Ok(());
                    }
                }
                None => return Ok(()),
            },
            _ = tick.tick() => {
                if hub.connection_state() == ConnectionState::Disconnected {
                    while let Ok(item) = rx.try_recv() {
                        if emit(item, &render)? {
                            return Ok(());
                        }
                    }
                    // a numeric end block closes the session without an error;
                    // any other end reaches the listener and is read above
                    if numeric_end {
                        return Ok(());
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                hub.disconnect();
                return Ok(());
            }
        }
    }
}

/// Print one notification. `Ok(true)` once the stream has completed.
fn emit<T>(item: Notification<T>, render: &impl Fn(&T) -> serde_json::Value) -> Result<bool> {
    match item {
        Notification::Delivered(value) => {
            println!("{}", render(&value));
            Ok(false)
        }
        Notification::Failed(e) if e.completion().is_some() => {
            tracing::info!("{e}");
            Ok(true)
        }
        Notification::Failed(e) => Err(e).context("event stream failed"),
    }
}

async fn cmd_demo(blocks: u64) -> Result<()> {
    let ledger = MemoryLedger::new("demo-channel");
    ledger.serve("localhost:7051");
    for i in 0..blocks {
        let code = if i % 3 == 2 {
            ValidationCode::MvccReadConflict
        } else {
            ValidationCode::Valid
        };
        let payload = format!("{{\"seq\":{i}}}");
        ledger.append(
            LedgerBlock::new(0, "")
                .with_tx(format!("tx-{i}"), code)
                .with_chaincode_event("demo-cc", format!("evtTransfer{i}"), payload.as_bytes()),
        )?;
    }

    let target = PeerTarget::new("grpcs://localhost:7051")?.with_name("demo-peer");
    let hub = EventHubBuilder::new("demo-channel", target)
        .transport(ledger)
        .identity(UnsignedIdentity::new("DemoMSP"))
        .build()?;

    let replay = RegistrationOptions::replay(StartBlock::Oldest, EndBlock::Newest);
    let (_, mut events) = hub.subscribe_chaincode("demo-cc", "^evt", replay)?;
    let (_, txs) = hub.subscribe_tx("ALL", RegistrationOptions::new())?;

    let printer = tokio::spawn(async move {
        while let Some(Notification::Delivered(notice)) = events.recv().await {
            println!(
                "{}",
                json!({
                    "chaincodeId": notice.event.chaincode_id,
                    "eventName": notice.event.event_name,
                    "block": notice.block_number,
                })
            );
        }
    });

    let config = EventHubConfig::new("demo-channel", "grpcs://localhost:7051");
    run(&hub, &config, txs, |status| {
        json!({
            "txId": status.tx_id,
            "validationCode": status.validation_code,
            "block": status.block_number,
        })
    })
    .await?;
    printer.await.context("demo printer task")?;
    let replayed = hub.last_block_number().map_or(0, |n| n + 1);
    println!("replayed {replayed} blocks from {}", hub.name());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainevents_core::EventHubError;

    fn ledger(blocks: u64) -> MemoryLedger {
        let ledger = MemoryLedger::new("demo-channel");
        ledger.serve("localhost:7051");
        for i in 0..blocks {
            ledger
                .append(LedgerBlock::new(0, "").with_tx(format!("tx-{i}"), ValidationCode::Valid))
                .unwrap();
        }
        ledger
    }

    fn hub(ledger: &MemoryLedger, channel: &str) -> ChannelEventHub {
        EventHubBuilder::new(channel, PeerTarget::new("grpcs://localhost:7051").unwrap())
            .transport(ledger.clone())
            .identity(UnsignedIdentity::new("DemoMSP"))
            .build()
            .unwrap()
    }

    fn render_block(block: &chainevents_core::DecodedBlock) -> serde_json::Value {
        json!({ "block": block.number })
    }

    #[tokio::test]
    async fn stream_failure_is_an_error() {
        let ledger = ledger(2);
        let hub = hub(&ledger, "missing-channel");
        let config = EventHubConfig::new("missing-channel", "grpcs://localhost:7051");
        let (_, rx) = hub.subscribe_blocks(RegistrationOptions::new()).unwrap();

        let err = tokio::time::timeout(Duration::from_secs(5), run(&hub, &config, rx, render_block))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EventHubError>(),
            Some(EventHubError::UnexpectedStatus(_))
        ));
    }

    #[tokio::test]
    async fn numeric_end_block_is_a_clean_finish() {
        let ledger = ledger(4);
        let hub = hub(&ledger, "demo-channel");
        let mut config = EventHubConfig::new("demo-channel", "grpcs://localhost:7051");
        config.start_block = Some(StartBlock::Oldest);
        config.end_block = Some(EndBlock::Number(1));
        let (_, rx) = hub.subscribe_blocks(RegistrationOptions::new()).unwrap();

        tokio::time::timeout(Duration::from_secs(5), run(&hub, &config, rx, render_block))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hub.last_block_number(), Some(1));
    }

    #[test]
    fn failure_notifications_are_errors() {
        let render = |n: &u64| json!(n);
        assert!(!emit(Notification::Delivered(3), &render).unwrap());
        let done = Notification::Failed(EventHubError::NewestBlockReceived { block_number: Some(3) });
        assert!(emit(done, &render).unwrap());
        let failed: Notification<u64> = Notification::Failed(EventHubError::Shutdown);
        assert!(emit(failed, &render).is_err());
    }
}

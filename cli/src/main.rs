//! chainreader CLI — sync a reader against a node and inspect its state.
//!
//! Usage:
//! ```bash
//! chainreader sync   --rpc-url http://127.0.0.1:19998 --from 1 --database ./reader.db
//! chainreader follow --config reader.json
//! chainreader status --database ./reader.db --network testnet --id main
//! chainreader info
//! ```

use std::env;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use chainreader_core::snapshot::load_state;
use chainreader_core::{
    BlockchainReader, BlockchainRpc, EntityKind, EntityRepository, EventLogger,
    MemoryEntityRepository, MemoryPacketStore, MemoryReaderStateRepository, PacketPinner,
    PacketStore, ReaderConfig, ReaderMediator, ReaderStateRepository, RevisionChain,
    RpcBlockSource, RpcTransitionDeriver, SequenceValidator, SnapshotPersister, StateViewApplier,
    StateViewProjection, SyncDriver,
};
use chainreader_node::NodeRpcClient;
use chainreader_storage::SqliteStorage;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "sync" => cmd_sync(&args[2..]).await,
        "follow" => cmd_follow(&args[2..]).await,
        "status" => cmd_status(&args[2..]).await,
        "info" => {
            cmd_info();
            Ok(())
        }
        "version" | "--version" | "-V" => {
            println!("chainreader {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("chainreader {}", env!("CARGO_PKG_VERSION"));
    println!("Ordered, reorg-safe reader of blockchain state transitions\n");
    println!("USAGE:");
    println!("    chainreader <COMMAND> [OPTIONS]\n");
    println!("COMMANDS:");
    println!("    sync     Read from the last synced block to the chain tip once");
    println!("    follow   Keep syncing as the chain tip moves");
    println!("    status   Show the persisted reader snapshot");
    println!("    info     Show default configuration");
    println!("    version  Print version");
    println!("    help     Print this help\n");
    println!("OPTIONS:");
    println!("    --config <FILE>         JSON reader configuration");
    println!("    --id <ID>               Reader id");
    println!("    --network <NAME>        Network name");
    println!("    --from <HEIGHT>         Initial block height");
    println!("    --blocks-limit <N>      Synced blocks kept for sequence validation");
    println!("    --rpc-url <URL>         Node JSON-RPC endpoint");
    println!("    --rpc-user <USER>       Node RPC user");
    println!("    --rpc-password <PASS>   Node RPC password");
    println!("    --database <FILE>       SQLite database (in-memory when omitted)");
}

fn cmd_info() {
    let defaults = ReaderConfig::default();
    println!("ChainReader v{}", env!("CARGO_PKG_VERSION"));
    println!("  Default blocks limit: {} blocks", defaults.blocks_limit);
    println!("  Default snapshot interval: every {} blocks", defaults.snapshot_interval);
    println!("  Default poll interval: {} ms", defaults.poll_interval_ms);
    println!("  Default node endpoint: {}", defaults.rpc_url);
    println!("  Storage backends: memory, SQLite (feature: sqlite)");
}

// ─── Options ─────────────────────────────────────────────────────────────────

struct Options {
    config: ReaderConfig,
    database: Option<String>,
}

fn parse_options(args: &[String]) -> Result<Options> {
    let mut config_path = None;
    let mut overrides = Vec::new();
    let mut database = None;

    let mut iter = args.iter();
    while let Some(flag) = iter.next() {
        let value = iter
            .next()
            .with_context(|| format!("missing value for {flag}"))?
            .clone();
        match flag.as_str() {
            "--config" => config_path = Some(value),
            "--database" => database = Some(value),
            "--id" | "--network" | "--from" | "--blocks-limit" | "--rpc-url" | "--rpc-user"
            | "--rpc-password" => overrides.push((flag.clone(), value)),
            other => bail!("unknown option {other}"),
        }
    }

    let mut config = match config_path {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config {path}"))?;
            serde_json::from_str::<ReaderConfig>(&raw)
                .with_context(|| format!("parsing config {path}"))?
        }
        None => ReaderConfig::default(),
    };

    for (flag, value) in overrides {
        match flag.as_str() {
            "--id" => config.id = value,
            "--network" => config.network = value,
            "--from" => config.initial_block_height = value.parse().context("--from")?,
            "--blocks-limit" => config.blocks_limit = value.parse().context("--blocks-limit")?,
            "--rpc-url" => config.rpc_url = value,
            "--rpc-user" => config.rpc_user = Some(value),
            "--rpc-password" => config.rpc_password = Some(value),
            _ => unreachable!("filtered above"),
        }
    }
    config.validate()?;

    Ok(Options { config, database })
}

// ─── Wiring ──────────────────────────────────────────────────────────────────

struct Backends {
    snapshots: Arc<dyn ReaderStateRepository>,
    packets: Arc<dyn PacketStore>,
    contracts: Arc<dyn EntityRepository>,
    objects: Arc<dyn EntityRepository>,
}

async fn open_backends(database: Option<&str>) -> Result<Backends> {
    match database {
        Some(path) => {
            let storage = SqliteStorage::open(path).await?;
            tracing::info!(path, "using SQLite storage");
            Ok(Backends {
                snapshots: Arc::new(storage.clone()),
                packets: Arc::new(storage.clone()),
                contracts: Arc::new(storage.entities(EntityKind::Contract)),
                objects: Arc::new(storage.entities(EntityKind::Object)),
            })
        }
        None => {
            tracing::info!("using in-memory storage");
            Ok(Backends {
                snapshots: Arc::new(MemoryReaderStateRepository::new()),
                packets: Arc::new(MemoryPacketStore::new()),
                contracts: Arc::new(MemoryEntityRepository::new(EntityKind::Contract)),
                objects: Arc::new(MemoryEntityRepository::new(EntityKind::Object)),
            })
        }
    }
}

async fn build_driver(
    options: &Options,
) -> Result<(Arc<dyn BlockchainRpc>, SyncDriver<RpcBlockSource>)> {
    let config = &options.config;
    let rpc: Arc<dyn BlockchainRpc> = Arc::new(NodeRpcClient::from_reader_config(config)?);
    let backends = open_backends(options.database.as_deref()).await?;

    let state = load_state(backends.snapshots.as_ref(), &config.scope(), config.blocks_limit).await?;
    let mut mediator = ReaderMediator::new(state, config.initial_block_height);

    let deriver = Arc::new(RpcTransitionDeriver::new(rpc.clone()));
    let applier = Arc::new(StateViewApplier::new(
        rpc.clone(),
        backends.packets.clone(),
        RevisionChain::new(backends.contracts),
        RevisionChain::new(backends.objects),
    ));

    Arc::new(SequenceValidator::new(deriver.clone())).attach(&mut mediator);
    Arc::new(StateViewProjection::new(applier)).attach(&mut mediator);
    Arc::new(PacketPinner::new(backends.packets)).attach(&mut mediator);
    Arc::new(SnapshotPersister::new(
        backends.snapshots,
        config.scope(),
        config.snapshot_interval,
    ))
    .attach(&mut mediator);
    Arc::new(EventLogger).attach(&mut mediator);

    let source = RpcBlockSource::new(rpc.clone(), config.initial_block_height);
    let reader = BlockchainReader::new(Arc::new(mediator), source, deriver);
    Ok((rpc.clone(), SyncDriver::new(rpc, reader)))
}

// ─── Commands ────────────────────────────────────────────────────────────────

async fn cmd_sync(args: &[String]) -> Result<()> {
    let options = parse_options(args)?;
    let (_, driver) = build_driver(&options).await?;
    let outcome = driver.sync().await?;
    println!("{outcome:?}");
    Ok(())
}

async fn cmd_follow(args: &[String]) -> Result<()> {
    let options = parse_options(args)?;
    let poll = Duration::from_millis(options.config.poll_interval_ms);
    let (rpc, driver) = build_driver(&options).await?;
    let driver = Arc::new(driver);
    let (tx, rx) = mpsc::channel(16);

    let follower = tokio::spawn(driver.clone().follow(rx));

    let mut ticker = tokio::time::interval(poll);
    let mut last_tip: Option<String> = None;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
        }
        let tip = match tip_hash(rpc.as_ref()).await {
            Ok(tip) => tip,
            Err(e) => {
                tracing::warn!(error = %e, "failed to poll chain tip");
                continue;
            }
        };
        if last_tip.as_deref() != Some(tip.as_str()) {
            last_tip = Some(tip.clone());
            if tx.send(tip).await.is_err() {
                break;
            }
        }
    }

    // let the running sync finish its current block before exiting
    driver.stop();
    drop(tx);
    follower.await?;
    Ok(())
}

async fn tip_hash(rpc: &dyn BlockchainRpc) -> Result<String> {
    let count = rpc.get_block_count().await?;
    Ok(rpc.get_block_hash(count).await?)
}

async fn cmd_status(args: &[String]) -> Result<()> {
    let options = parse_options(args)?;
    let Some(path) = options.database.as_deref() else {
        bail!("status needs --database");
    };
    let storage = SqliteStorage::open(path).await?;
    let scope = options.config.scope();

    match storage.load(&scope).await? {
        Some(snapshot) => {
            println!("Reader {scope}");
            println!("  Blocks kept: {}", snapshot.blocks.len());
            if let Some(block) = snapshot.last_block() {
                println!("  Last block:  {} ({})", block.height, block.hash);
            }
            if let Some(at) = snapshot.last_synced_at {
                println!("  Last synced: {}", at.to_rfc3339());
            }
        }
        None => println!("Reader {scope} has no snapshot"),
    }
    Ok(())
}

//! CLI sync harness for exercising the engine against a simulated chain
//!
//! This tool allows testing:
//! - Full syncs with either cache backend
//! - Interrupt/resume scenarios
//! - Performance benchmarking
//! - Reorg recovery

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use lightsync_engine::{
    init_logging, BlockCache, CycleOutcome, RecordingScanner, SimulatedChain, SyncConfig,
    SyncDependencies, SyncEngine, SyncEvent, SyncEventLogger, SyncPhase,
};
use lightsync_params::{CheckpointList, Network, NetworkType};
use lightsync_storage::paths::{cache_base_dir, wallet_cache_dir};
use lightsync_storage::{
    FsBlockCache, MemoryProgressStore, ProgressStore, SqliteBlockCache, SqliteProgressStore,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "sync-harness")]
#[command(about = "Light wallet sync testing harness", long_about = None)]
struct Cli {
    /// Emit JSON log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    /// One SQLite table
    Sqlite,
    /// One file per block plus a metadata index
    Fs,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a full sync from birthday to tip
    FullSync {
        /// Network whose parameters to use
        #[arg(short, long, default_value = "regtest")]
        network: NetworkType,

        /// Birthday height
        #[arg(short, long, default_value = "1000")]
        birthday: u64,

        /// Simulated chain tip
        #[arg(short, long, default_value = "11000")]
        tip: u64,

        /// Blocks per batch
        #[arg(long, default_value = "100")]
        batch_size: u64,

        /// Cache backend
        #[arg(long, value_enum, default_value = "sqlite")]
        backend: Backend,

        /// Cache directory (defaults to the platform cache dir)
        #[arg(long)]
        cache_dir: Option<PathBuf>,

        /// Wallet alias
        #[arg(long, default_value = "harness")]
        alias: String,

        /// Checkpoint file used to resolve the birthday
        #[arg(long)]
        checkpoints: Option<PathBuf>,

        /// Delay per streamed block in milliseconds
        #[arg(long, default_value = "0")]
        block_delay_ms: u64,
    },

    /// Benchmark sync performance
    Benchmark {
        /// Number of blocks to sync
        #[arg(short, long, default_value = "10000")]
        blocks: u64,

        /// Number of runs
        #[arg(short, long, default_value = "3")]
        runs: u32,

        /// Blocks per batch
        #[arg(long, default_value = "100")]
        batch_size: u64,
    },

    /// Test interrupt and resume
    InterruptTest {
        /// Number of blocks to sync
        #[arg(short, long, default_value = "2000")]
        blocks: u64,

        /// Interrupt after N milliseconds
        #[arg(short, long, default_value = "500")]
        interrupt_after_ms: u64,

        /// Delay per streamed block in milliseconds
        #[arg(long, default_value = "1")]
        block_delay_ms: u64,
    },

    /// Test reorg recovery
    ReorgTest {
        /// Blocks replaced below the tip
        #[arg(short, long, default_value = "5")]
        depth: u64,

        /// Grow the rewind distance with consecutive reorgs
        #[arg(long)]
        escalate: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json);

    match cli.command {
        Commands::FullSync {
            network,
            birthday,
            tip,
            batch_size,
            backend,
            cache_dir,
            alias,
            checkpoints,
            block_delay_ms,
        } => {
            let options = FullSyncOptions {
                network: Network::from_type(network),
                birthday,
                tip,
                batch_size,
                backend,
                cache_dir: cache_dir.unwrap_or_else(cache_base_dir),
                alias,
                checkpoints,
                block_delay: Duration::from_millis(block_delay_ms),
            };
            run_full_sync(options).await?;
        }
        Commands::Benchmark {
            blocks,
            runs,
            batch_size,
        } => {
            run_benchmark(blocks, runs, batch_size).await?;
        }
        Commands::InterruptTest {
            blocks,
            interrupt_after_ms,
            block_delay_ms,
        } => {
            run_interrupt_test(
                blocks,
                Duration::from_millis(interrupt_after_ms),
                Duration::from_millis(block_delay_ms),
            )
            .await?;
        }
        Commands::ReorgTest { depth, escalate } => {
            run_reorg_test(depth, escalate).await?;
        }
    }

    Ok(())
}

struct FullSyncOptions {
    network: Network,
    birthday: u64,
    tip: u64,
    batch_size: u64,
    backend: Backend,
    cache_dir: PathBuf,
    alias: String,
    checkpoints: Option<PathBuf>,
    block_delay: Duration,
}

fn open_cache(backend: Backend, dir: &Path) -> anyhow::Result<Arc<dyn BlockCache>> {
    Ok(match backend {
        Backend::Sqlite => Arc::new(SqliteBlockCache::open(dir.join("blocks.sqlite"))?),
        Backend::Fs => Arc::new(FsBlockCache::open(dir)?),
    })
}

fn build_engine(
    chain: &SimulatedChain,
    cache: Arc<dyn BlockCache>,
    progress: Box<dyn ProgressStore>,
    config: SyncConfig,
) -> anyhow::Result<(SyncEngine, Arc<RecordingScanner>)> {
    let scanner = Arc::new(RecordingScanner::new().with_cache(cache.clone()));
    let engine = SyncEngine::new(
        SyncDependencies {
            source: Arc::new(chain.clone()),
            cache,
            progress,
            scanner: scanner.clone(),
            enhancer: Some(scanner.clone()),
            utxo_fetcher: Some(scanner.clone()),
        },
        config,
    )?;
    Ok((engine, scanner))
}

fn harness_config(birthday: u64, batch_size: u64) -> SyncConfig {
    SyncConfig {
        poll_interval: Duration::from_secs(3600),
        ..SyncConfig::default()
            .with_birthday(birthday)
            .with_batch_size(batch_size)
    }
}

/// Drive a progress bar from scan progress events
fn spawn_progress_bar(engine: &SyncEngine) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {percent}% {msg}")?
            .progress_chars("=>-"),
    );

    let mut events = engine.subscribe();
    Ok(tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SyncEvent::PhaseProgress {
                    phase,
                    height,
                    fraction,
                    ..
                } if phase == SyncPhase::Scan => {
                    pb.set_position((fraction * 100.0) as u64);
                    pb.set_message(format!("scanned {}", height));
                }
                SyncEvent::ReorgHandled {
                    reorg_height,
                    rewind_height,
                } => {
                    pb.set_message(format!("reorg at {}, rewound to {}", reorg_height, rewind_height));
                }
                SyncEvent::Idle { scanned_height, .. } => {
                    pb.finish_with_message(format!("synced to {}", scanned_height));
                    break;
                }
                SyncEvent::Failed(failure) => {
                    pb.abandon_with_message(failure.message);
                    break;
                }
                _ => {}
            }
        }
    }))
}

async fn run_full_sync(options: FullSyncOptions) -> anyhow::Result<()> {
    let checkpoints = match &options.checkpoints {
        Some(path) => CheckpointList::from_file(path)?,
        None => CheckpointList::default(),
    };
    let birthday = checkpoints.birthday_height(&options.network, options.birthday);
    info!(
        "Starting full sync on {} from birthday {} to {}",
        options.network.name, birthday, options.tip
    );

    let dir = wallet_cache_dir(&options.cache_dir, &options.alias);
    info!("Cache directory: {}", dir.display());

    let cache = open_cache(options.backend, &dir)?;
    let progress = SqliteProgressStore::open(dir.join("progress.sqlite"), options.alias.clone())?;
    let chain = SimulatedChain::new(options.tip).with_block_delay(options.block_delay);

    let config = SyncConfig {
        batch_size: options.batch_size,
        poll_interval: Duration::from_secs(3600),
        ..SyncConfig::for_network(&options.network, &checkpoints, birthday)
    };
    let (engine, _) = build_engine(&chain, cache, Box::new(progress), config)?;

    let progress_task = spawn_progress_bar(&engine)?;
    let outcome = engine.sync_once(true).await;
    progress_task.await?;

    match outcome {
        CycleOutcome::Synced { scanned_height, .. } => {
            info!("✅ Sync completed successfully at {}", scanned_height);
            info!("{}", engine.perf().summary());
            Ok(())
        }
        CycleOutcome::Waiting {
            latest_height,
            downloaded,
        } => {
            warn!(
                "Local state at {} is ahead of the chain tip {}",
                downloaded, latest_height
            );
            Ok(())
        }
        CycleOutcome::Failed(failure) => bail!("sync failed: {}", failure.message),
        CycleOutcome::Cancelled => bail!("sync cancelled"),
    }
}

async fn run_benchmark(blocks: u64, runs: u32, batch_size: u64) -> anyhow::Result<()> {
    if blocks == 0 || runs == 0 {
        bail!("blocks and runs must be positive");
    }
    info!("Starting benchmark: {} blocks, {} runs", blocks, runs);

    let mut total_duration = Duration::ZERO;
    let mut total_blocks = 0u64;

    for run in 1..=runs {
        info!("Run {}/{}", run, runs);

        let chain = SimulatedChain::new(blocks);
        let cache: Arc<dyn BlockCache> = Arc::new(SqliteBlockCache::open_in_memory()?);
        let (engine, _) = build_engine(
            &chain,
            cache,
            Box::new(MemoryProgressStore::new()),
            harness_config(1, batch_size),
        )?;

        let start_time = std::time::Instant::now();
        if let CycleOutcome::Failed(failure) = engine.sync_once(false).await {
            bail!("run {} failed: {}", run, failure.message);
        }
        let elapsed = start_time.elapsed();

        info!(
            "  Duration: {:.2}s | {:.1} blocks/s",
            elapsed.as_secs_f64(),
            blocks as f64 / elapsed.as_secs_f64()
        );
        info!("{}", engine.perf().summary());

        total_duration += elapsed;
        total_blocks += blocks;
    }

    info!("📊 Benchmark Results:");
    info!("  Runs: {}", runs);
    info!("  Total blocks: {}", total_blocks);
    info!(
        "  Average duration: {:.2}s",
        (total_duration / runs).as_secs_f64()
    );
    info!(
        "  Average speed: {:.1} blocks/s",
        total_blocks as f64 / total_duration.as_secs_f64()
    );

    Ok(())
}

async fn run_interrupt_test(
    blocks: u64,
    interrupt_after: Duration,
    block_delay: Duration,
) -> anyhow::Result<()> {
    info!(
        "Starting interrupt test; interrupting after {:?}",
        interrupt_after
    );

    let dir = tempfile::tempdir()?;
    let chain = SimulatedChain::new(blocks).with_block_delay(block_delay);
    let open = || -> anyhow::Result<SyncEngine> {
        let cache = open_cache(Backend::Fs, dir.path())?;
        let progress = SqliteProgressStore::open(dir.path().join("progress.sqlite"), "interrupt")?;
        let (engine, _) = build_engine(&chain, cache, Box::new(progress), harness_config(1, 100))?;
        Ok(engine)
    };

    let engine = open()?;
    let logger = Arc::new(SyncEventLogger::new());
    tokio::spawn(logger.clone().follow(engine.subscribe()));

    engine.start(true).await;
    tokio::time::sleep(interrupt_after).await;
    info!("⚠️  Interrupting sync...");
    engine.stop().await;

    let interrupted = engine.progress()?;
    drop(engine);
    info!(
        "Interrupted at downloaded {} / scanned {} after {} events",
        interrupted.downloaded,
        interrupted.scanned,
        logger.get_events().len()
    );

    chain.clear_fetched();
    let resumed = open()?;
    match resumed.sync_once(true).await {
        CycleOutcome::Synced { scanned_height, .. } => {
            info!("✅ Resume completed at {}", scanned_height)
        }
        other => bail!("resume did not finish: {:?}", other),
    }

    let first_fetched = chain.fetched_heights().first().copied();
    match first_fetched {
        Some(height) if height <= interrupted.downloaded => {
            bail!("block {} was downloaded twice", height)
        }
        Some(height) => info!("✅ Resumed download at {}", height),
        None => info!("✅ Nothing left to download after the interrupt"),
    }

    Ok(())
}

async fn run_reorg_test(depth: u64, escalate: bool) -> anyhow::Result<()> {
    let tip = 2000;
    info!("Starting reorg test: replacing {} blocks below {}", depth, tip);

    let chain = SimulatedChain::new(tip);
    let cache: Arc<dyn BlockCache> = Arc::new(SqliteBlockCache::open_in_memory()?);
    let mut config = harness_config(1, 100);
    config.rewind_policy.escalate = escalate;
    let (engine, scanner) = build_engine(&chain, cache, Box::new(MemoryProgressStore::new()), config)?;

    let mut events = engine.subscribe();
    if !matches!(engine.sync_once(true).await, CycleOutcome::Synced { .. }) {
        bail!("initial sync failed");
    }

    chain.reorg_from(tip.saturating_sub(depth).max(1));
    chain.advance_tip(1);

    let outcome = engine.sync_once(true).await;

    while let Ok(event) = events.try_recv() {
        if let SyncEvent::ReorgHandled {
            reorg_height,
            rewind_height,
        } = event
        {
            info!(
                "Reorg at {} handled, rewound to {}",
                reorg_height, rewind_height
            );
        }
    }
    info!("Scanner rewinds: {:?}", scanner.rewinds());

    match outcome {
        CycleOutcome::Synced { scanned_height, .. } if scanned_height == chain.tip() => {
            info!("✅ Recovered and synced to {}", scanned_height);
            Ok(())
        }
        other => Err(anyhow::anyhow!("{:?}", other)).context("reorg recovery failed"),
    }
}

#![doc = include_str!("../README.md")]

mod config;
mod telemetry;
mod workload;

use clap::Parser;
use config::{CliArgs, LoadgenConfig};
use portable_atomic::Ordering;
use std::{sync::Arc, time::Instant};
use strata::{
    CounterMetrics, FixedBlockSizer, IdPoolStats, InMemoryIdAuthority, InMemoryStore,
    MonotonicClock,
};
use tokio::{signal, task::JoinSet};
use tokio_util::sync::CancellationToken;
use workload::{Cache, Counters, Pools};

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = LoadgenConfig::try_from(args)?;

    telemetry::init_telemetry(config.json_logs)?;
    log_startup_info(&config);

    let clock = MonotonicClock::default();
    let authority = Arc::new(InMemoryIdAuthority::new(FixedBlockSizer::new(config.block_size)?));
    let pools = Arc::new(Pools::new(authority, clock.clone(), config.pool.clone())?);

    let store = InMemoryStore::new("loadgen");
    workload::seed(&store, &config)?;
    let metrics = Arc::new(CounterMetrics::new());
    let cache = Arc::new(Cache::with_metrics(
        store,
        clock,
        Arc::clone(&metrics),
        config.cache.clone(),
    )?);

    let counters = Arc::new(Counters::default());
    let stop = CancellationToken::new();
    let mut set = JoinSet::new();
    workload::spawn_id_workers(&mut set, &pools, &counters, &config, &stop);
    workload::spawn_cache_workers(&mut set, &cache, &counters, &config, &stop);

    let started = Instant::now();
    let mut first_err = None;
    tokio::select! {
        () = tokio::time::sleep(config.duration) => {
            #[cfg(feature = "tracing")]
            tracing::info!("Run finished after {:?}", config.duration);
        },
        () = shutdown_signal() => {},
        Some(joined) = set.join_next() => {
            // A worker only returns early when it found a violation.
            workload::record_outcome(joined, &mut first_err);
        },
    }
    stop.cancel();

    while let Some(joined) = set.join_next().await {
        workload::record_outcome(joined, &mut first_err);
    }
    let elapsed = started.elapsed();

    let stats = pools
        .partitions()
        .into_iter()
        .map(|partition| Ok((partition, pools.pool(partition)?.stats())))
        .collect::<strata::Result<Vec<_>>>()?;
    pools.close()?;
    cache.close();
    log_summary(&counters, &metrics, &stats, elapsed);

    first_err.map_or(Ok(()), Err)
}

fn log_startup_info(_config: &LoadgenConfig) {
    if cfg!(debug_assertions) {
        #[cfg(feature = "tracing")]
        tracing::info!("Starting load generator with full config: {:#?}", _config);
    } else {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Starting load generator with {} id workers over {} partitions and {} cache workers",
            _config.id_workers,
            _config.partitions,
            _config.cache_workers
        );
    }
}

#[allow(clippy::cast_precision_loss)]
fn log_summary(
    counters: &Counters,
    metrics: &CounterMetrics,
    _stats: &[(u32, IdPoolStats)],
    elapsed: core::time::Duration,
) {
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    let ids = counters.ids.load(Ordering::Relaxed);
    let reads = counters.reads.load(Ordering::Relaxed);
    let writes = counters.writes.load(Ordering::Relaxed);
    let snapshot = metrics.snapshot();

    #[cfg(feature = "tracing")]
    {
        tracing::info!(
            "Ids: {ids} issued ({:.0}/s), {} errors",
            ids as f64 / secs,
            counters.id_errors.load(Ordering::Relaxed)
        );
        tracing::info!(
            "Cache: {reads} reads ({:.0}/s), {writes} writes, {} errors, hit ratio {:.3}, {} evictions, {} invalidations",
            reads as f64 / secs,
            counters.cache_errors.load(Ordering::Relaxed),
            snapshot.hit_ratio(),
            snapshot.evictions,
            snapshot.invalidations
        );
        for (partition, stats) in _stats {
            tracing::info!(
                "Partition({partition}): {} ids from {} blocks, {} renewals",
                stats.ids_issued,
                stats.blocks_acquired,
                stats.renewals_started
            );
        }
    }
    #[cfg(not(feature = "tracing"))]
    {
        println!("ids={ids} ({:.0}/s)", ids as f64 / secs);
        println!(
            "reads={reads} ({:.0}/s) writes={writes} hit_ratio={:.3}",
            reads as f64 / secs,
            snapshot.hit_ratio()
        );
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!("Failed to install SIGTERM handler: {_e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received Ctrl+C signal");
        },
        () = terminate => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received SIGTERM signal");
        },
    }
}

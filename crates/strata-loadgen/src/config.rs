use anyhow::bail;
use clap::Parser;
use core::time::Duration;
use strata::{ExpirationCacheConfig, IdPoolConfig};

/// Runtime configuration for the `strata-loadgen` binary.
///
/// Every value can be given as a CLI flag or through the environment (a
/// `.env` file in the working directory is loaded first).
#[derive(Parser, Debug, Clone)]
#[command(
    name = "strata-loadgen",
    version,
    about = "Drives strata id pools and the expiration cache with concurrent load"
)]
pub struct CliArgs {
    /// Number of id partitions the id workers spread over.
    ///
    /// Environment variable: `PARTITIONS`
    #[arg(long, env = "PARTITIONS", default_value_t = 4)]
    pub partitions: u32,

    /// Number of ids reserved per block fetch.
    ///
    /// Environment variable: `BLOCK_SIZE`
    #[arg(long, env = "BLOCK_SIZE", default_value_t = 10_000)]
    pub block_size: u64,

    /// Number of Tokio tasks requesting ids.
    ///
    /// Environment variable: `ID_WORKERS`
    #[arg(long, env = "ID_WORKERS", default_value_t = 8)]
    pub id_workers: usize,

    /// Number of blocking workers reading and writing through the cache.
    ///
    /// Environment variable: `CACHE_WORKERS`
    #[arg(long, env = "CACHE_WORKERS", default_value_t = 4)]
    pub cache_workers: usize,

    /// Number of distinct row keys seeded into the store.
    ///
    /// Environment variable: `KEYS`
    #[arg(long, env = "KEYS", default_value_t = 1_000)]
    pub keys: usize,

    /// Number of columns per row.
    ///
    /// Environment variable: `COLUMNS`
    #[arg(long, env = "COLUMNS", default_value_t = 8)]
    pub columns: usize,

    /// Fraction of cache operations that are writes, in `[0, 1]`.
    ///
    /// Environment variable: `WRITE_RATIO`
    #[arg(long, env = "WRITE_RATIO", default_value_t = 0.05)]
    pub write_ratio: f64,

    /// How long a cached slice stays fresh, in milliseconds.
    ///
    /// Environment variable: `EXPIRATION_MS`
    #[arg(long, env = "EXPIRATION_MS", default_value_t = 10_000)]
    pub expiration_ms: u64,

    /// How long a written key stays uncacheable, in milliseconds.
    ///
    /// Environment variable: `GRACE_MS`
    #[arg(long, env = "GRACE_MS", default_value_t = 50)]
    pub grace_ms: u64,

    /// Cache capacity in bytes.
    ///
    /// Environment variable: `CACHE_BYTES`
    #[arg(long, env = "CACHE_BYTES", default_value_t = 64 * 1024 * 1024)]
    pub cache_bytes: u64,

    /// How long to run before shutting down. Ctrl+C stops earlier.
    ///
    /// Environment variable: `DURATION_SECS`
    #[arg(long, env = "DURATION_SECS", default_value_t = 10)]
    pub duration_secs: u64,

    /// Emit logs as JSON instead of human-readable text.
    ///
    /// Environment variable: `JSON_LOGS`
    #[arg(long, env = "JSON_LOGS", default_value_t = false)]
    pub json_logs: bool,
}

#[derive(Debug, Clone)]
pub struct LoadgenConfig {
    pub partitions: u32,
    pub block_size: u64,
    pub id_workers: usize,
    pub cache_workers: usize,
    pub keys: usize,
    pub columns: usize,
    pub write_ratio: f64,
    pub duration: Duration,
    pub json_logs: bool,
    pub pool: IdPoolConfig,
    pub cache: ExpirationCacheConfig,
}

impl TryFrom<CliArgs> for LoadgenConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.partitions == 0 {
            bail!("PARTITIONS must be greater than 0");
        }
        if args.block_size == 0 {
            bail!("BLOCK_SIZE must be greater than 0");
        }
        if args.id_workers == 0 && args.cache_workers == 0 {
            bail!("At least one of ID_WORKERS or CACHE_WORKERS must be greater than 0");
        }
        if args.keys == 0 || args.columns == 0 {
            bail!("KEYS and COLUMNS must be greater than 0");
        }
        if !(0.0..=1.0).contains(&args.write_ratio) {
            bail!("WRITE_RATIO ({}) must lie within [0, 1]", args.write_ratio);
        }
        if args.duration_secs == 0 {
            bail!("DURATION_SECS must be greater than 0");
        }

        // Renew once a tenth of the block is left so fetches overlap issuing.
        let pool = IdPoolConfig::default()
            .with_renew_id_count((args.block_size / 10).max(1))
            .with_renew_buffer_fraction(0.1);
        pool.validate()?;

        let cache = ExpirationCacheConfig::default()
            .with_expiration(Duration::from_millis(args.expiration_ms))
            .with_grace_wait(Duration::from_millis(args.grace_ms))
            .with_max_bytes(args.cache_bytes);
        cache.validate()?;

        Ok(Self {
            partitions: args.partitions,
            block_size: args.block_size,
            id_workers: args.id_workers,
            cache_workers: args.cache_workers,
            keys: args.keys,
            columns: args.columns,
            write_ratio: args.write_ratio,
            duration: Duration::from_secs(args.duration_secs),
            json_logs: args.json_logs,
            pool,
            cache,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<LoadgenConfig> {
        let argv = core::iter::once("strata-loadgen").chain(args.iter().copied());
        LoadgenConfig::try_from(CliArgs::try_parse_from(argv)?)
    }

    #[test]
    fn defaults_are_valid() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.partitions, 4);
        assert_eq!(config.pool.renew_id_count, 1_000);
        assert_eq!(config.cache.grace_wait, Duration::from_millis(50));
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(parse(&["--partitions", "0"]).is_err());
        assert!(parse(&["--write-ratio", "1.5"]).is_err());
        assert!(parse(&["--id-workers", "0", "--cache-workers", "0"]).is_err());
        assert!(parse(&["--cache-bytes", "0"]).is_err());
    }
}

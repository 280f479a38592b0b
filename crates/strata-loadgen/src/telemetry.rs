//! Log output for the load generator.
//!
//! Verbosity comes from `RUST_LOG` (default `info`). With the `tracing`
//! feature the library's own events (renewals, cleanup passes, shutdown)
//! show up alongside the load generator's.

use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

pub fn init_telemetry(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let fmt = tracing_subscriber::fmt::layer()
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339());

    let layer = if json {
        fmt.json().with_current_span(false).boxed()
    } else {
        fmt.compact().boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()?;
    Ok(())
}

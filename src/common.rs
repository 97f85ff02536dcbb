//! Setup shared by the binaries

use eyre::WrapErr;
use tracing_error::ErrorLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Install `color-eyre` reports and a `tracing` subscriber.
///
/// Filtering follows `RUST_LOG`, falling back to `info`.
pub fn initialize_logging() -> eyre::Result<()> {
    color_eyre::install()?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_thread_names(true))
        .with(ErrorLayer::default())
        .try_init()
        .wrap_err("installing tracing subscriber")?;
    Ok(())
}

use tracing_error::ErrorLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Install `color-eyre` reports and a `RUST_LOG`-driven subscriber
/// (defaults to `warn`)
pub fn initialize_logging() -> eyre::Result<()> {
    color_eyre::install()?;

    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("warn"))?;
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .with(ErrorLayer::default())
        .try_init()?;
    Ok(())
}


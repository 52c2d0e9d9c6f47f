/// Installs a `fmt` subscriber filtered by `RUST_LOG`, defaulting to `nagare=info`.
///
/// Task spans are named `task` and carry the task name, so
/// `RUST_LOG=nagare=debug` shows every capture and release as it happens.
#[cfg(feature = "logging")]
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("nagare=info"))?;

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))?;

    Ok(())
}

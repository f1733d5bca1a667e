pub use log::{trace, debug, info, warn, error, LevelFilter};

/// Install the process-wide logger. `RUST_LOG` overrides the given level.
pub fn initialize(level: LevelFilter) -> Result<(), anyhow::Error> {
    env_logger::builder()
        .filter_level(level)
        .filter_module("winit", LevelFilter::Warn)
        .filter_module("calloop", LevelFilter::Error)
        .parse_default_env()
        .try_init()?;

    Ok(())
}

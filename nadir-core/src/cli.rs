use std::path::PathBuf;
use clap::{Parser, ValueEnum};
use log::LevelFilter;
use serde::Deserialize;

/// Log level options for command-line argument.
#[derive(Debug, Clone, Copy, ValueEnum, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Off,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::Trace,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Off => LevelFilter::Off,
        }
    }
}

/// Common command-line arguments for Nadir applications.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct EngineArgs {
    /// Set the log verbosity level (overrides the config file)
    #[arg(short = 'l', long = "log-level", value_enum)]
    pub log_level: Option<LogLevel>,

    /// Path to the TOML configuration file
    #[arg(short = 'c', long = "config", default_value = "nadir.toml")]
    pub config: PathBuf,

    /// Run on the CPU-only null backend, no GPU or window required
    #[arg(long)]
    pub headless: bool,

    /// Render into an offscreen target instead of a window swapchain
    #[arg(long)]
    pub offscreen: bool,

    /// Stop after this many frames (runs until the window closes if absent)
    #[arg(short = 'f', long = "frames")]
    pub frames: Option<u64>,

    /// Additional positional arguments passed to the application
    #[arg(trailing_var_arg = true)]
    pub args: Vec<String>,
}

impl EngineArgs {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_frame_loop_flags() {
        let args = EngineArgs::parse_from(["sandbox", "--headless", "-f", "12", "-l", "debug"]);
        assert!(args.headless);
        assert!(!args.offscreen);
        assert_eq!(args.frames, Some(12));
        assert_eq!(args.log_level, Some(LogLevel::Debug));
        assert_eq!(args.config, PathBuf::from("nadir.toml"));
    }

    #[test]
    fn log_level_maps_to_filter() {
        assert_eq!(LevelFilter::from(LogLevel::Warn), LevelFilter::Warn);
        assert_eq!(LevelFilter::from(LogLevel::default()), LevelFilter::Info);
    }
}

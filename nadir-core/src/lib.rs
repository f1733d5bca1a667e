//! Nadir core - ambient services shared by every Nadir crate.

pub mod cli;
pub mod collections;
pub mod config;
pub mod log;

pub use cli::{EngineArgs, LogLevel};
pub use config::Config;

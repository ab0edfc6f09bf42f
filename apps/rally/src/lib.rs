pub mod app;
pub mod cli;
pub mod config;
pub mod directory;
pub mod error;
pub mod host;
pub mod join;
pub mod relay;
pub mod session;
pub mod telemetry;
pub mod transport;

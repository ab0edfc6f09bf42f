use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::telemetry::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "rally",
    about = "📡 Pair two peers through a directory record and a relay join code",
    author,
    version
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "RALLY_DIRECTORY_SERVER",
        default_value = "http://127.0.0.1:8080",
        help = "Base URL for the directory service"
    )]
    pub directory_server: String,

    #[arg(
        long,
        global = true,
        env = "RALLY_RELAY_SERVER",
        default_value = "http://127.0.0.1:8090",
        help = "Base URL for the relay allocation service"
    )]
    pub relay_server: String,

    #[arg(
        long = "auth-token",
        global = true,
        env = "RALLY_AUTH_TOKEN",
        value_name = "TOKEN",
        hide_env_values = true,
        help = "Bearer token attached to directory and relay requests"
    )]
    pub auth_token: Option<String>,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(flatten)]
    pub session: SessionArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "RALLY_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "RALLY_LOG_FILE",
        help = "Write structured logs to a file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct SessionArgs {
    #[arg(
        long = "security-mode",
        global = true,
        env = "RALLY_SECURITY_MODE",
        default_value = "dtls",
        value_name = "MODE",
        help = "Security mode handed to the transport along with the relay descriptor"
    )]
    pub security_mode: String,

    #[arg(
        long = "heartbeat-ms",
        global = true,
        env = "RALLY_HEARTBEAT_MS",
        value_name = "MS",
        help = "Heartbeat cadence in milliseconds (default 15000, upper bound 15000)"
    )]
    pub heartbeat_ms: Option<u64>,

    #[arg(
        long = "poll-ms",
        global = true,
        env = "RALLY_POLL_MS",
        value_name = "MS",
        help = "Directory poll cadence in milliseconds (default and minimum 1100)"
    )]
    pub poll_ms: Option<u64>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Advertise a new session and wait for a peer
    Host(HostArgs),
    /// Quick-match into an advertised session
    Join,
}

#[derive(Args, Debug, Default)]
pub struct HostArgs {
    #[arg(
        long = "name",
        value_name = "NAME",
        default_value = "rally-session",
        help = "Name for the advertised directory record"
    )]
    pub name: String,
}

pub fn parse() -> Cli {
    Cli::parse()
}

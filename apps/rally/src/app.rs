use crate::cli::{self, Command};
use crate::config::Config;
use crate::error::CliError;
use crate::{host, join};

pub async fn run(cli: cli::Cli) -> Result<(), CliError> {
    let config = Config::from_cli(&cli);
    match cli.command {
        Command::Host(args) => host::run(&config, args).await,
        Command::Join => join::run(&config).await,
    }
}

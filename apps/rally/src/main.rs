use rally_core::error::CliError;
use rally_core::{app, cli, telemetry};

#[tokio::main]
async fn main() {
    let cli = cli::parse();
    if let Err(err) = telemetry::init(&cli.logging.to_config()) {
        eprintln!("❌ {}", CliError::Logging(err.to_string()));
        std::process::exit(1);
    }
    if let Err(err) = app::run(cli).await {
        eprintln!("❌ {err}");
        std::process::exit(1);
    }
}

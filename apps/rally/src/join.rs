//! Join flow: quick-match into an advertised session and poll until the
//! relay join code comes through.

use std::sync::Arc;

use tokio::signal;
use tokio::time::interval;
use tracing::info;

use crate::config::Config;
use crate::directory::HttpDirectoryBackend;
use crate::error::CliError;
use crate::host::TICK_QUANTUM;
use crate::relay::HttpRelayBackend;
use crate::session::{SessionCoordinator, SessionPhase};
use crate::transport::RecordingTransport;

pub async fn run(config: &Config) -> Result<(), CliError> {
    let tunables = config.tunables("rally-session")?;
    let directory = Arc::new(HttpDirectoryBackend::new(
        &config.directory_server,
        config.auth_token.clone(),
    )?);
    let relay = Arc::new(HttpRelayBackend::new(
        &config.relay_server,
        config.auth_token.clone(),
    )?);
    let transport = Arc::new(RecordingTransport::new());
    let mut coordinator = SessionCoordinator::new(directory, relay, transport, tunables)?;

    coordinator.join_session().await?;
    println!(
        "\n🔎 matched session record {}",
        coordinator.record_id().unwrap_or("-")
    );
    println!("   polling for the relay join code... press Ctrl-C to give up.\n");

    let mut ticker = interval(TICK_QUANTUM);
    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);
    enum Outcome {
        Joined,
        Failed,
        Interrupted,
    }
    let outcome = loop {
        tokio::select! {
            _ = &mut shutdown => break Outcome::Interrupted,
            _ = ticker.tick() => {
                coordinator.tick(TICK_QUANTUM).await;
                match coordinator.phase() {
                    SessionPhase::JoinerActive => break Outcome::Joined,
                    // The coordinator cleared itself: record vanished or the
                    // relay join failed. Details are already in the log.
                    SessionPhase::Idle => break Outcome::Failed,
                    _ => {}
                }
            }
        }
    };

    match outcome {
        Outcome::Joined => {
            println!(
                "✅ joined relay with code {}; transport running as client.\n",
                coordinator.relay_token()
            );
            info!("session joined, handing off to transport");
            coordinator.shutdown().await;
            Ok(())
        }
        Outcome::Failed => {
            coordinator.shutdown().await;
            Err(CliError::NegotiationFailed)
        }
        Outcome::Interrupted => {
            println!("\n👋 giving up on the session.");
            coordinator.shutdown().await;
            Ok(())
        }
    }
}

//! Host flow: advertise a session, keep it alive, tear it down on exit.

use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::time::interval;
use tracing::info;

use crate::cli::HostArgs;
use crate::config::Config;
use crate::directory::HttpDirectoryBackend;
use crate::error::CliError;
use crate::relay::HttpRelayBackend;
use crate::session::{SessionCoordinator, SESSION_CAPACITY};
use crate::transport::RecordingTransport;

/// Quantum the negotiation tick loop runs on. Coarse enough to stay cheap,
/// fine enough that the 1.1s poll cadence lands close to its interval.
pub(crate) const TICK_QUANTUM: Duration = Duration::from_millis(100);

pub async fn run(config: &Config, args: HostArgs) -> Result<(), CliError> {
    let tunables = config.tunables(&args.name)?;
    let directory = Arc::new(HttpDirectoryBackend::new(
        &config.directory_server,
        config.auth_token.clone(),
    )?);
    let relay = Arc::new(HttpRelayBackend::new(
        &config.relay_server,
        config.auth_token.clone(),
    )?);
    let transport = Arc::new(RecordingTransport::new());
    let coordinator = SessionCoordinator::new(directory, relay, transport, tunables)?;
    host_until_interrupted(coordinator).await
}

async fn host_until_interrupted(mut coordinator: SessionCoordinator) -> Result<(), CliError> {
    if let Err(err) = coordinator.create_session().await {
        // A failed in-flight rollback leaves the record advertised; the
        // drain retries the delete before the process exits.
        coordinator.shutdown().await;
        return Err(err.into());
    }
    print_host_banner(&coordinator);
    info!(
        record_id = %coordinator.record_id().unwrap_or("-"),
        "hosting session, entering tick loop"
    );

    let mut ticker = interval(TICK_QUANTUM);
    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                println!("\n👋 ending session, cleaning up records...");
                break;
            }
            _ = ticker.tick() => coordinator.tick(TICK_QUANTUM).await,
        }
    }
    coordinator.shutdown().await;
    Ok(())
}

fn print_host_banner(coordinator: &SessionCoordinator) {
    println!("\n📡 rally session advertised!\n");
    println!("  record id : {}", coordinator.record_id().unwrap_or("-"));
    println!("  join code : {}", coordinator.relay_token());
    println!(
        "  members   : {}/{}",
        coordinator.member_count().unwrap_or(0),
        SESSION_CAPACITY
    );
    println!();
    println!("🛰️  Waiting for a peer... press Ctrl-C to end the session.\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{DirectoryError, DirectoryOp, InMemoryDirectory};
    use crate::relay::{InMemoryRelay, RelayError};
    use crate::session::SessionTunables;

    #[test_deadline::async_deadline]
    async fn a_failed_create_still_drains_the_record_on_exit() {
        let directory = Arc::new(InMemoryDirectory::new());
        let relay = Arc::new(InMemoryRelay::new());
        relay
            .fail_next_allocate(RelayError::AllocationFailed("no capacity".into()))
            .await;
        directory
            .inject_failure(DirectoryOp::Delete, DirectoryError::Server("busy".into()))
            .await;
        let coordinator = SessionCoordinator::new(
            directory.clone(),
            relay,
            Arc::new(RecordingTransport::new()),
            SessionTunables::default(),
        )
        .expect("valid tunables");

        let result = host_until_interrupted(coordinator).await;
        assert!(matches!(result, Err(CliError::Session(_))));
        // One delete failed during rollback, the exit drain retried it and
        // the record is no longer advertised.
        assert_eq!(directory.count_ops(DirectoryOp::Delete).await, 2);
        assert_eq!(directory.record_count().await, 0);
    }
}

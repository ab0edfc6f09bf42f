//! Seam to the external peer-to-peer transport.
//!
//! The kernel's job ends at handing the transport a relay descriptor and
//! starting it in the right role. What the transport does with the relay
//! afterwards is out of scope, so the crate ships [`RecordingTransport`],
//! which enforces the call contract and remembers what it was told. The
//! binary and the tests both use it; a real integration implements
//! [`Transport`] against its own stack.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::relay::RelayDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Host,
    Client,
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport has not been configured with a relay descriptor")]
    NotConfigured,
    #[error("transport already started as {0:?}")]
    AlreadyStarted(TransportMode),
    #[error("transport setup failed: {0}")]
    Setup(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Hands the transport its relay binding. Must precede either start call.
    async fn configure(&self, descriptor: RelayDescriptor) -> Result<(), TransportError>;

    async fn start_host(&self) -> Result<(), TransportError>;

    async fn start_client(&self) -> Result<(), TransportError>;
}

#[derive(Default)]
struct RecordingState {
    descriptor: Option<RelayDescriptor>,
    started: Option<TransportMode>,
    fail_configure: Option<TransportError>,
    fail_start: Option<TransportError>,
}

/// Transport double that validates call order and records the handoff.
#[derive(Clone, Default)]
pub struct RecordingTransport {
    state: Arc<Mutex<RecordingState>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn descriptor(&self) -> Option<RelayDescriptor> {
        self.state.lock().unwrap().descriptor.clone()
    }

    pub fn started_mode(&self) -> Option<TransportMode> {
        self.state.lock().unwrap().started
    }

    pub fn fail_next_configure(&self, err: TransportError) {
        self.state.lock().unwrap().fail_configure = Some(err);
    }

    pub fn fail_next_start(&self, err: TransportError) {
        self.state.lock().unwrap().fail_start = Some(err);
    }

    fn start(&self, mode: TransportMode) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.fail_start.take() {
            return Err(err);
        }
        if let Some(active) = state.started {
            return Err(TransportError::AlreadyStarted(active));
        }
        let descriptor = state
            .descriptor
            .as_ref()
            .ok_or(TransportError::NotConfigured)?;
        info!(
            endpoint = %descriptor.endpoint,
            security_mode = %descriptor.security_mode,
            mode = ?mode,
            "transport started"
        );
        state.started = Some(mode);
        Ok(())
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn configure(&self, descriptor: RelayDescriptor) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.fail_configure.take() {
            return Err(err);
        }
        if let Some(active) = state.started {
            return Err(TransportError::AlreadyStarted(active));
        }
        state.descriptor = Some(descriptor);
        Ok(())
    }

    async fn start_host(&self) -> Result<(), TransportError> {
        self.start(TransportMode::Host)
    }

    async fn start_client(&self) -> Result<(), TransportError> {
        self.start(TransportMode::Client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> RelayDescriptor {
        RelayDescriptor {
            endpoint: "relay.local:42000".into(),
            allocation_id: "alloc-1".into(),
            connection_data: "blob".into(),
            security_mode: "dtls".into(),
        }
    }

    #[test_deadline::async_deadline]
    async fn start_requires_configuration() {
        let transport = RecordingTransport::new();
        assert!(matches!(
            transport.start_host().await,
            Err(TransportError::NotConfigured)
        ));
        transport.configure(descriptor()).await.expect("configure");
        transport.start_host().await.expect("start");
        assert_eq!(transport.started_mode(), Some(TransportMode::Host));
    }

    #[test_deadline::async_deadline]
    async fn second_start_is_rejected() {
        let transport = RecordingTransport::new();
        transport.configure(descriptor()).await.expect("configure");
        transport.start_client().await.expect("start");
        assert!(matches!(
            transport.start_host().await,
            Err(TransportError::AlreadyStarted(TransportMode::Client))
        ));
    }

    #[test_deadline::async_deadline]
    async fn injected_configure_failure_fires_once() {
        let transport = RecordingTransport::new();
        transport.fail_next_configure(TransportError::Setup("no relay".into()));
        assert!(matches!(
            transport.configure(descriptor()).await,
            Err(TransportError::Setup(_))
        ));
        transport.configure(descriptor()).await.expect("configure");
        assert!(transport.descriptor().is_some());
    }

    #[test_deadline::async_deadline]
    async fn reconfigure_after_start_is_rejected() {
        let transport = RecordingTransport::new();
        transport.configure(descriptor()).await.expect("configure");
        transport.start_host().await.expect("start");
        assert!(matches!(
            transport.configure(descriptor()).await,
            Err(TransportError::AlreadyStarted(TransportMode::Host))
        ));
    }
}

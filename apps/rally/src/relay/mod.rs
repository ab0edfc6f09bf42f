//! Relay allocation service client.
//!
//! The relay carves out an allocation for a session and hands back a short
//! join code. The host publishes that code through the directory; the joiner
//! redeems it for the same allocation. Neither peer ever learns the other's
//! address, which is the point.

mod memory;

pub use memory::InMemoryRelay;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::config::service_base_url;

/// Connection details for one side of a relay allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayAllocation {
    pub allocation_id: String,
    pub host: String,
    pub port: u16,
    /// Opaque blob the transport forwards to the relay verbatim.
    pub connection_data: String,
}

impl RelayAllocation {
    /// Builds the transport-facing descriptor for this allocation.
    pub fn descriptor(&self, security_mode: &str) -> RelayDescriptor {
        RelayDescriptor {
            endpoint: format!("{}:{}", self.host, self.port),
            allocation_id: self.allocation_id.clone(),
            connection_data: self.connection_data.clone(),
            security_mode: security_mode.to_string(),
        }
    }
}

/// Everything the external transport needs to bind to a relay allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayDescriptor {
    pub endpoint: String,
    pub allocation_id: String,
    pub connection_data: String,
    pub security_mode: String,
}

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("invalid relay configuration: {0}")]
    InvalidConfig(String),
    #[error("relay allocation failed: {0}")]
    AllocationFailed(String),
    #[error("join code must be a six character alphanumeric string")]
    InvalidJoinCode,
    #[error("relay join rejected: {0}")]
    JoinRejected(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait RelayBackend: Send + Sync {
    /// Reserves an allocation with room for `slots` remote peers and returns
    /// it together with the join code that redeems it.
    async fn allocate(&self, slots: u32) -> Result<(RelayAllocation, String), RelayError>;

    /// Redeems a join code for the allocation it names.
    async fn join(&self, join_code: &str) -> Result<RelayAllocation, RelayError>;
}

pub fn validate_join_code(code: &str) -> Result<(), RelayError> {
    let trimmed = code.trim();
    if trimmed.len() == 6 && trimmed.chars().all(|c| c.is_ascii_alphanumeric()) {
        Ok(())
    } else {
        Err(RelayError::InvalidJoinCode)
    }
}

pub struct HttpRelayBackend {
    base_url: Url,
    bearer_token: Option<String>,
    client: reqwest::Client,
}

impl HttpRelayBackend {
    pub fn new(
        base_url: impl AsRef<str>,
        bearer_token: Option<String>,
    ) -> Result<Self, RelayError> {
        let base_url = service_base_url(base_url.as_ref())
            .map_err(|err| RelayError::InvalidConfig(format!("relay server: {err}")))?;
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .no_proxy()
            .build()?;
        Ok(Self {
            base_url,
            bearer_token,
            client,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, RelayError> {
        self.base_url
            .join(path)
            .map_err(|err| RelayError::InvalidConfig(format!("invalid endpoint {path}: {err}")))
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.bearer_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

#[async_trait]
impl RelayBackend for HttpRelayBackend {
    async fn allocate(&self, slots: u32) -> Result<(RelayAllocation, String), RelayError> {
        let endpoint = self.endpoint("allocations")?;
        let response = self
            .request(self.client.post(endpoint))
            .json(&AllocateRequest { slots })
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::HttpStatus(status));
        }
        let envelope = response.json::<AllocateResponse>().await?;
        if !envelope.success {
            let message = envelope
                .message
                .unwrap_or_else(|| "relay allocation rejected".to_string());
            return Err(RelayError::AllocationFailed(message));
        }
        let allocation = envelope
            .allocation
            .ok_or_else(|| RelayError::InvalidResponse("missing allocation".into()))?;
        let join_code = envelope
            .join_code
            .ok_or_else(|| RelayError::InvalidResponse("missing join code".into()))?;
        validate_join_code(&join_code)?;
        debug!(
            allocation_id = %allocation.allocation_id,
            endpoint = %allocation.host,
            "relay allocation reserved"
        );
        Ok((allocation, join_code))
    }

    async fn join(&self, join_code: &str) -> Result<RelayAllocation, RelayError> {
        validate_join_code(join_code)?;
        let endpoint = self.endpoint("allocations/join")?;
        let response = self
            .request(self.client.post(endpoint))
            .json(&JoinRequest {
                join_code: join_code.trim().to_string(),
            })
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(RelayError::InvalidJoinCode);
        }
        if !status.is_success() {
            return Err(RelayError::HttpStatus(status));
        }
        let envelope = response.json::<JoinResponse>().await?;
        if !envelope.success {
            let message = envelope
                .message
                .unwrap_or_else(|| "relay join rejected".to_string());
            return Err(RelayError::JoinRejected(message));
        }
        let allocation = envelope
            .allocation
            .ok_or_else(|| RelayError::InvalidResponse("missing allocation".into()))?;
        debug!(allocation_id = %allocation.allocation_id, "joined relay allocation");
        Ok(allocation)
    }
}

#[derive(Debug, Serialize)]
struct AllocateRequest {
    slots: u32,
}

#[derive(Debug, Deserialize)]
struct AllocateResponse {
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    allocation: Option<RelayAllocation>,
    #[serde(default)]
    join_code: Option<String>,
}

#[derive(Debug, Serialize)]
struct JoinRequest {
    join_code: String,
}

#[derive(Debug, Deserialize)]
struct JoinResponse {
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    allocation: Option<RelayAllocation>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_deadline::deadline]
    fn accepts_six_alphanumerics() {
        assert!(validate_join_code("ABC123").is_ok());
        assert!(validate_join_code("  ABC123  ").is_ok());
    }

    #[test_deadline::deadline]
    fn rejects_everything_else() {
        for code in ["", "ABC12", "ABC1234", "ABC 12", "default_join_code"] {
            assert!(
                matches!(validate_join_code(code), Err(RelayError::InvalidJoinCode)),
                "{code:?} should be rejected"
            );
        }
    }

    #[test_deadline::deadline]
    fn descriptor_carries_allocation_and_mode() {
        let allocation = RelayAllocation {
            allocation_id: "alloc-7".into(),
            host: "relay.example".into(),
            port: 42007,
            connection_data: "blob".into(),
        };
        let descriptor = allocation.descriptor("dtls");
        assert_eq!(descriptor.endpoint, "relay.example:42007");
        assert_eq!(descriptor.allocation_id, "alloc-7");
        assert_eq!(descriptor.security_mode, "dtls");
    }
}

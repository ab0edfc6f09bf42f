//! Directory service client.
//!
//! The directory holds short-lived session records: named, capacity-bounded
//! membership lists with string fields. Hosts advertise a record carrying the
//! relay join code, joiners quick-match into one and poll the code out of it.
//! Records expire unless the host keeps pinging, so liveness is the caller's
//! problem, not the directory's.

mod memory;

pub use memory::{DirectoryOp, InMemoryDirectory};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::config::service_base_url;

/// Window of heartbeat silence after which the directory drops a record.
pub const RECORD_EXPIRY: Duration = Duration::from_secs(30);

/// Who can read a record field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldVisibility {
    /// Only members of the record see the value.
    Member,
    /// Anyone who can fetch the record sees the value.
    Public,
}

/// A single named value attached to a directory record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordField {
    pub value: String,
    pub visibility: FieldVisibility,
}

impl RecordField {
    pub fn member(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            visibility: FieldVisibility::Member,
        }
    }

    pub fn public(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            visibility: FieldVisibility::Public,
        }
    }
}

/// Snapshot of a directory record as the service last reported it.
///
/// Membership is managed by the service: creating a record enrolls the
/// creator, quick-matching enrolls the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryRecord {
    pub id: String,
    pub name: String,
    pub capacity: u32,
    pub members: Vec<String>,
    #[serde(default)]
    pub fields: HashMap<String, RecordField>,
}

impl DirectoryRecord {
    pub fn field_value(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(|field| field.value.as_str())
    }

    pub fn is_full(&self) -> bool {
        self.members.len() as u32 >= self.capacity
    }
}

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("invalid directory configuration: {0}")]
    InvalidConfig(String),
    #[error("record {0} not found")]
    NotFound(String),
    #[error("no open record available")]
    NoMatchAvailable,
    #[error("directory rate limit exceeded")]
    RateLimited,
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),
    #[error("server rejected request: {0}")]
    Server(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait DirectoryBackend: Send + Sync {
    /// Creates a record with the caller as its first member.
    async fn create(
        &self,
        name: &str,
        capacity: u32,
        fields: HashMap<String, RecordField>,
    ) -> Result<DirectoryRecord, DirectoryError>;

    /// Enrolls the caller in an arbitrary record with a free slot.
    async fn quick_match(&self) -> Result<DirectoryRecord, DirectoryError>;

    async fn get(&self, id: &str) -> Result<DirectoryRecord, DirectoryError>;

    /// Merges `fields` into the record and returns the updated snapshot.
    async fn update(
        &self,
        id: &str,
        fields: HashMap<String, RecordField>,
    ) -> Result<DirectoryRecord, DirectoryError>;

    /// Resets the record's expiry clock.
    async fn send_heartbeat(&self, id: &str) -> Result<(), DirectoryError>;

    async fn delete(&self, id: &str) -> Result<(), DirectoryError>;
}

pub struct HttpDirectoryBackend {
    base_url: Url,
    bearer_token: Option<String>,
    client: reqwest::Client,
}

impl HttpDirectoryBackend {
    pub fn new(
        base_url: impl AsRef<str>,
        bearer_token: Option<String>,
    ) -> Result<Self, DirectoryError> {
        let base_url = service_base_url(base_url.as_ref())
            .map_err(|err| DirectoryError::InvalidConfig(format!("directory server: {err}")))?;
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

    fn endpoint(&self, path: &str) -> Result<Url, DirectoryError> {
        self.base_url
            .join(path)
            .map_err(|err| DirectoryError::InvalidConfig(format!("invalid endpoint {path}: {err}")))
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.bearer_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn read_record(
        &self,
        response: reqwest::Response,
    ) -> Result<DirectoryRecord, DirectoryError> {
        let envelope = response.json::<RecordEnvelope>().await?;
        if !envelope.success {
            let message = envelope
                .message
                .unwrap_or_else(|| "directory request failed".to_string());
            return Err(DirectoryError::Server(message));
        }
        envelope
            .record
            .ok_or_else(|| DirectoryError::InvalidResponse("missing record".into()))
    }

    async fn read_ack(&self, response: reqwest::Response) -> Result<(), DirectoryError> {
        let envelope = response.json::<AckEnvelope>().await?;
        if !envelope.success {
            let message = envelope
                .message
                .unwrap_or_else(|| "directory request failed".to_string());
            return Err(DirectoryError::Server(message));
        }
        Ok(())
    }
}

fn status_error(status: StatusCode, record_id: Option<&str>) -> DirectoryError {
    match (status, record_id) {
        (StatusCode::NOT_FOUND, Some(id)) => DirectoryError::NotFound(id.to_string()),
        (StatusCode::TOO_MANY_REQUESTS, _) => DirectoryError::RateLimited,
        _ => DirectoryError::HttpStatus(status),
    }
}

#[async_trait]
impl DirectoryBackend for HttpDirectoryBackend {
    async fn create(
        &self,
        name: &str,
        capacity: u32,
        fields: HashMap<String, RecordField>,
    ) -> Result<DirectoryRecord, DirectoryError> {
        let endpoint = self.endpoint("records")?;
        let request = CreateRecordRequest {
            name: name.to_string(),
            capacity,
            fields,
        };
        let response = self
            .request(self.client.post(endpoint))
            .json(&request)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, None));
        }
        let record = self.read_record(response).await?;
        debug!(record_id = %record.id, name = %record.name, "directory record created");
        Ok(record)
    }

    async fn quick_match(&self) -> Result<DirectoryRecord, DirectoryError> {
        let endpoint = self.endpoint("records/quick-match")?;
        let response = self
            .request(self.client.post(endpoint))
            .json(&serde_json::json!({}))
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(DirectoryError::NoMatchAvailable);
        }
        if !status.is_success() {
            return Err(status_error(status, None));
        }
        let record = self.read_record(response).await?;
        debug!(record_id = %record.id, "quick-matched into directory record");
        Ok(record)
    }

    async fn get(&self, id: &str) -> Result<DirectoryRecord, DirectoryError> {
        let endpoint = self.endpoint(&format!("records/{id}"))?;
        let response = self.request(self.client.get(endpoint)).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, Some(id)));
        }
        self.read_record(response).await
    }

    async fn update(
        &self,
        id: &str,
        fields: HashMap<String, RecordField>,
    ) -> Result<DirectoryRecord, DirectoryError> {
        let endpoint = self.endpoint(&format!("records/{id}"))?;
        let request = UpdateRecordRequest { fields };
        let response = self
            .request(self.client.patch(endpoint))
            .json(&request)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, Some(id)));
        }
        let record = self.read_record(response).await?;
        debug!(record_id = %record.id, "directory record updated");
        Ok(record)
    }

    async fn send_heartbeat(&self, id: &str) -> Result<(), DirectoryError> {
        let endpoint = self.endpoint(&format!("records/{id}/heartbeat"))?;
        let response = self.request(self.client.post(endpoint)).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, Some(id)));
        }
        self.read_ack(response).await
    }

    async fn delete(&self, id: &str) -> Result<(), DirectoryError> {
        let endpoint = self.endpoint(&format!("records/{id}"))?;
        let response = self.request(self.client.delete(endpoint)).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, Some(id)));
        }
        self.read_ack(response).await
    }
}

#[derive(Debug, Serialize)]
struct CreateRecordRequest {
    name: String,
    capacity: u32,
    fields: HashMap<String, RecordField>,
}

#[derive(Debug, Serialize)]
struct UpdateRecordRequest {
    fields: HashMap<String, RecordField>,
}

#[derive(Debug, Deserialize)]
struct RecordEnvelope {
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    record: Option<DirectoryRecord>,
}

#[derive(Debug, Deserialize)]
struct AckEnvelope {
    success: bool,
    #[serde(default)]
    message: Option<String>,
}

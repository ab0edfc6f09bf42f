//! In-process directory service.
//!
//! Implements the full backend contract against a [`BTreeMap`] with a manual
//! clock: `advance` ages every record and drops the ones whose heartbeat
//! silence reached [`RECORD_EXPIRY`]. Tests drive the clock explicitly, so
//! liveness properties are checked without waiting on wall time. Every call
//! is logged and any operation can be armed to fail once, which is how the
//! rollback and teardown paths get exercised.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{DirectoryBackend, DirectoryError, DirectoryRecord, RecordField, RECORD_EXPIRY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DirectoryOp {
    Create,
    QuickMatch,
    Get,
    Update,
    Heartbeat,
    Delete,
}

struct StoredRecord {
    record: DirectoryRecord,
    since_heartbeat: Duration,
}

#[derive(Default)]
struct DirectoryState {
    records: BTreeMap<String, StoredRecord>,
    calls: Vec<(DirectoryOp, Option<String>)>,
    failures: HashMap<DirectoryOp, DirectoryError>,
}

impl DirectoryState {
    fn take_failure(&mut self, op: DirectoryOp) -> Result<(), DirectoryError> {
        match self.failures.remove(&op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn log(&mut self, op: DirectoryOp, id: Option<&str>) {
        self.calls.push((op, id.map(str::to_string)));
    }
}

#[derive(Default)]
pub struct InMemoryDirectory {
    state: Mutex<DirectoryState>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ages every record; records whose silence reaches the expiry window
    /// are dropped, exactly as the real service reaps them.
    pub async fn advance(&self, dt: Duration) {
        let mut state = self.state.lock().await;
        for stored in state.records.values_mut() {
            stored.since_heartbeat += dt;
        }
        state
            .records
            .retain(|_, stored| stored.since_heartbeat < RECORD_EXPIRY);
    }

    /// Arms `op` to fail with `err` on its next invocation only.
    pub async fn inject_failure(&self, op: DirectoryOp, err: DirectoryError) {
        self.state.lock().await.failures.insert(op, err);
    }

    /// Record snapshot without touching the call log.
    pub async fn snapshot(&self, id: &str) -> Option<DirectoryRecord> {
        self.state
            .lock()
            .await
            .records
            .get(id)
            .map(|stored| stored.record.clone())
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.state.lock().await.records.contains_key(id)
    }

    pub async fn record_count(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn calls(&self) -> Vec<(DirectoryOp, Option<String>)> {
        self.state.lock().await.calls.clone()
    }

    pub async fn count_ops(&self, op: DirectoryOp) -> usize {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|(logged, _)| *logged == op)
            .count()
    }

    pub async fn count_ops_for(&self, op: DirectoryOp, id: &str) -> usize {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|(logged, logged_id)| *logged == op && logged_id.as_deref() == Some(id))
            .count()
    }
}

#[async_trait]
impl DirectoryBackend for InMemoryDirectory {
    async fn create(
        &self,
        name: &str,
        capacity: u32,
        fields: HashMap<String, RecordField>,
    ) -> Result<DirectoryRecord, DirectoryError> {
        let mut state = self.state.lock().await;
        state.log(DirectoryOp::Create, None);
        state.take_failure(DirectoryOp::Create)?;
        let record = DirectoryRecord {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            capacity,
            members: vec![Uuid::new_v4().to_string()],
            fields,
        };
        state.records.insert(
            record.id.clone(),
            StoredRecord {
                record: record.clone(),
                since_heartbeat: Duration::ZERO,
            },
        );
        Ok(record)
    }

    async fn quick_match(&self) -> Result<DirectoryRecord, DirectoryError> {
        let mut state = self.state.lock().await;
        state.log(DirectoryOp::QuickMatch, None);
        state.take_failure(DirectoryOp::QuickMatch)?;
        let open_id = state
            .records
            .values()
            .find(|stored| !stored.record.is_full())
            .map(|stored| stored.record.id.clone())
            .ok_or(DirectoryError::NoMatchAvailable)?;
        let stored = state
            .records
            .get_mut(&open_id)
            .expect("open record disappeared while locked");
        stored.record.members.push(Uuid::new_v4().to_string());
        Ok(stored.record.clone())
    }

    async fn get(&self, id: &str) -> Result<DirectoryRecord, DirectoryError> {
        let mut state = self.state.lock().await;
        state.log(DirectoryOp::Get, Some(id));
        state.take_failure(DirectoryOp::Get)?;
        state
            .records
            .get(id)
            .map(|stored| stored.record.clone())
            .ok_or_else(|| DirectoryError::NotFound(id.to_string()))
    }

    async fn update(
        &self,
        id: &str,
        fields: HashMap<String, RecordField>,
    ) -> Result<DirectoryRecord, DirectoryError> {
        let mut state = self.state.lock().await;
        state.log(DirectoryOp::Update, Some(id));
        state.take_failure(DirectoryOp::Update)?;
        let stored = state
            .records
            .get_mut(id)
            .ok_or_else(|| DirectoryError::NotFound(id.to_string()))?;
        for (key, field) in fields {
            stored.record.fields.insert(key, field);
        }
        Ok(stored.record.clone())
    }

    async fn send_heartbeat(&self, id: &str) -> Result<(), DirectoryError> {
        let mut state = self.state.lock().await;
        state.log(DirectoryOp::Heartbeat, Some(id));
        state.take_failure(DirectoryOp::Heartbeat)?;
        let stored = state
            .records
            .get_mut(id)
            .ok_or_else(|| DirectoryError::NotFound(id.to_string()))?;
        stored.since_heartbeat = Duration::ZERO;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), DirectoryError> {
        let mut state = self.state.lock().await;
        state.log(DirectoryOp::Delete, Some(id));
        state.take_failure(DirectoryOp::Delete)?;
        state
            .records
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| DirectoryError::NotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_deadline::async_deadline]
    async fn records_expire_without_heartbeats() {
        let directory = InMemoryDirectory::new();
        let record = directory
            .create("expiring", 2, HashMap::new())
            .await
            .expect("create");
        directory.advance(RECORD_EXPIRY - Duration::from_secs(1)).await;
        assert!(directory.contains(&record.id).await);
        directory.advance(Duration::from_secs(1)).await;
        assert!(!directory.contains(&record.id).await);
    }

    #[test_deadline::async_deadline]
    async fn heartbeat_resets_the_expiry_clock() {
        let directory = InMemoryDirectory::new();
        let record = directory
            .create("kept-alive", 2, HashMap::new())
            .await
            .expect("create");
        for _ in 0..10 {
            directory.advance(Duration::from_secs(15)).await;
            directory
                .send_heartbeat(&record.id)
                .await
                .expect("heartbeat");
        }
        assert!(directory.contains(&record.id).await);
    }

    #[test_deadline::async_deadline]
    async fn quick_match_fills_an_open_slot() {
        let directory = InMemoryDirectory::new();
        let created = directory
            .create("open", 2, HashMap::new())
            .await
            .expect("create");
        let matched = directory.quick_match().await.expect("quick match");
        assert_eq!(matched.id, created.id);
        assert_eq!(matched.members.len(), 2);
        assert!(matches!(
            directory.quick_match().await,
            Err(DirectoryError::NoMatchAvailable)
        ));
    }

    #[test_deadline::async_deadline]
    async fn injected_failure_fires_once() {
        let directory = InMemoryDirectory::new();
        let record = directory
            .create("flaky", 2, HashMap::new())
            .await
            .expect("create");
        directory
            .inject_failure(DirectoryOp::Delete, DirectoryError::Server("busy".into()))
            .await;
        assert!(matches!(
            directory.delete(&record.id).await,
            Err(DirectoryError::Server(_))
        ));
        directory.delete(&record.id).await.expect("second delete");
        assert_eq!(directory.record_count().await, 0);
    }

    #[test_deadline::async_deadline]
    async fn update_merges_fields() {
        let directory = InMemoryDirectory::new();
        let mut fields = HashMap::new();
        fields.insert("token".to_string(), RecordField::member("pending"));
        let record = directory
            .create("merge", 2, fields)
            .await
            .expect("create");
        let mut changed = HashMap::new();
        changed.insert("token".to_string(), RecordField::member("ABC123"));
        let updated = directory.update(&record.id, changed).await.expect("update");
        assert_eq!(updated.field_value("token"), Some("ABC123"));
    }
}

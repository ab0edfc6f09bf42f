//! Session negotiation kernel.
//!
//! [`SessionCoordinator`] owns the whole handshake between two peers that
//! have never met: the host advertises a directory record whose
//! [`KEY_RELAY_JOIN_CODE`] field starts as a sentinel, allocates a relay and
//! publishes the real join code through that field; the joiner quick-matches
//! into the record and polls until the field transitions, then redeems the
//! code with the relay and starts its transport. All cadence runs through
//! [`SessionCoordinator::tick`], driven by an external loop.
//!
//! Every method takes `&mut self`, so an in-flight operation exclusively
//! borrows the session. There is no way for a stale completion to land on a
//! coordinator that was torn down in the meantime; cancelling a flow is
//! dropping its future.

mod ledger;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::directory::{DirectoryBackend, DirectoryError, DirectoryRecord, RecordField};
use crate::relay::{RelayBackend, RelayError};
use crate::transport::{Transport, TransportError};

use ledger::RecordLedger;

/// One host slot, one joiner slot. The handshake is strictly pairwise.
pub const SESSION_CAPACITY: u32 = 2;

/// Record field through which the relay join code travels.
pub const KEY_RELAY_JOIN_CODE: &str = "relay_join_code";

/// Field value meaning "host has not published a code yet".
pub const JOIN_CODE_SENTINEL: &str = "default_join_code";

/// Default liveness cadence. Must stay well inside the directory's
/// 30 second expiry window.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Default poll cadence. The directory rate-limits reads to roughly one per
/// second, so polling any faster just burns quota.
pub const POLL_INTERVAL: Duration = Duration::from_millis(1100);

#[derive(Debug, Clone)]
pub struct SessionTunables {
    pub record_name: String,
    pub security_mode: String,
    pub heartbeat_interval: Duration,
    pub poll_interval: Duration,
}

impl Default for SessionTunables {
    fn default() -> Self {
        Self {
            record_name: "rally-session".to_string(),
            security_mode: "dtls".to_string(),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            poll_interval: POLL_INTERVAL,
        }
    }
}

impl SessionTunables {
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.record_name.trim().is_empty() {
            return Err(SessionError::InvalidConfig(
                "record name cannot be empty".into(),
            ));
        }
        if self.security_mode.trim().is_empty() {
            return Err(SessionError::InvalidConfig(
                "security mode cannot be empty".into(),
            ));
        }
        if self.heartbeat_interval.is_zero() || self.heartbeat_interval > HEARTBEAT_INTERVAL {
            return Err(SessionError::InvalidConfig(format!(
                "heartbeat interval must be within (0, {}ms]",
                HEARTBEAT_INTERVAL.as_millis()
            )));
        }
        if self.poll_interval < POLL_INTERVAL {
            return Err(SessionError::InvalidConfig(format!(
                "poll interval must be at least {}ms",
                POLL_INTERVAL.as_millis()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    /// Record advertised, waiting for the membership list to fill.
    HostWaitingForPeer,
    /// A peer showed up in the membership list.
    HostActive,
    /// Quick-matched, polling for the join code to transition.
    JoinerWaitingForToken,
    /// Relay joined, transport running as client.
    JoinerActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Unassigned,
    Host,
    Joiner,
}

impl SessionPhase {
    pub fn role(self) -> Role {
        match self {
            SessionPhase::Idle => Role::Unassigned,
            SessionPhase::HostWaitingForPeer | SessionPhase::HostActive => Role::Host,
            SessionPhase::JoinerWaitingForToken | SessionPhase::JoinerActive => Role::Joiner,
        }
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("a session is already active")]
    AlreadyActive,
    #[error("invalid session configuration: {0}")]
    InvalidConfig(String),
    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),
    #[error("relay error: {0}")]
    Relay(#[from] RelayError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Countdown with millisecond resolution. Fires when the remainder crosses
/// strictly below zero; a timer sitting exactly on zero waits for the next
/// quantum. Fresh timers start at zero so the first positive tick fires.
#[derive(Debug, Clone, Copy)]
struct TickTimer {
    remaining_ms: i64,
}

impl TickTimer {
    fn expired() -> Self {
        Self { remaining_ms: 0 }
    }

    fn advance(&mut self, dt: Duration) -> bool {
        self.remaining_ms -= dt.as_millis() as i64;
        self.remaining_ms < 0
    }

    fn reset(&mut self, interval: Duration) {
        self.remaining_ms = interval.as_millis() as i64;
    }
}

pub struct SessionCoordinator {
    directory: Arc<dyn DirectoryBackend>,
    relay: Arc<dyn RelayBackend>,
    transport: Arc<dyn Transport>,
    tunables: SessionTunables,
    phase: SessionPhase,
    /// Latest snapshot of the held record. `Some` is what keeps polling
    /// alive; the joiner drops it the instant the token is consumed.
    record: Option<DirectoryRecord>,
    relay_token: String,
    heartbeat_timer: TickTimer,
    poll_timer: TickTimer,
    ledger: RecordLedger,
}

impl SessionCoordinator {
    pub fn new(
        directory: Arc<dyn DirectoryBackend>,
        relay: Arc<dyn RelayBackend>,
        transport: Arc<dyn Transport>,
        tunables: SessionTunables,
    ) -> Result<Self, SessionError> {
        tunables.validate()?;
        Ok(Self {
            directory,
            relay,
            transport,
            tunables,
            phase: SessionPhase::Idle,
            record: None,
            relay_token: JOIN_CODE_SENTINEL.to_string(),
            heartbeat_timer: TickTimer::expired(),
            poll_timer: TickTimer::expired(),
            ledger: RecordLedger::new(),
        })
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn role(&self) -> Role {
        self.phase.role()
    }

    pub fn record_id(&self) -> Option<&str> {
        self.record.as_ref().map(|record| record.id.as_str())
    }

    /// The join code this session knows. Stays [`JOIN_CODE_SENTINEL`] until
    /// the host publishes or the joiner observes a real one.
    pub fn relay_token(&self) -> &str {
        &self.relay_token
    }

    pub fn member_count(&self) -> Option<usize> {
        self.record.as_ref().map(|record| record.members.len())
    }

    /// Records still owed a delete. Non-zero after shutdown means the
    /// directory refused and the record will ride out its expiry window.
    pub fn outstanding_cleanup(&self) -> usize {
        self.ledger.len()
    }

    /// Advertises a new session: create the record with a sentinel join
    /// code, allocate a relay, publish the real code, then bring the
    /// transport up in host mode. Any failure past record creation rolls the
    /// record back so no dead session stays advertised.
    pub async fn create_session(&mut self) -> Result<(), SessionError> {
        if self.phase != SessionPhase::Idle {
            return Err(SessionError::AlreadyActive);
        }

        let mut fields = HashMap::new();
        fields.insert(
            KEY_RELAY_JOIN_CODE.to_string(),
            RecordField::member(JOIN_CODE_SENTINEL),
        );
        let record = self
            .directory
            .create(&self.tunables.record_name, SESSION_CAPACITY, fields)
            .await?;
        let record_id = record.id.clone();
        info!(record_id = %record_id, name = %record.name, "session record created");

        // The ledger entry lands before anything else can fail.
        self.ledger.push(record_id.clone());
        self.phase = SessionPhase::HostWaitingForPeer;
        self.record = Some(record);
        self.heartbeat_timer = TickTimer::expired();
        self.poll_timer = TickTimer::expired();

        if let Err(err) = self.publish_and_start(&record_id).await {
            warn!(record_id = %record_id, error = %err, "session create failed, rolling back record");
            self.roll_back_record(&record_id).await;
            self.clear_session();
            return Err(err);
        }
        Ok(())
    }

    async fn publish_and_start(&mut self, record_id: &str) -> Result<(), SessionError> {
        let (allocation, join_code) = self.relay.allocate(SESSION_CAPACITY - 1).await?;

        let mut fields = HashMap::new();
        fields.insert(
            KEY_RELAY_JOIN_CODE.to_string(),
            RecordField::member(join_code.clone()),
        );
        let updated = self.directory.update(record_id, fields).await?;
        self.record = Some(updated);
        self.relay_token = join_code.clone();
        info!(record_id = %record_id, join_code = %join_code, "relay token published");

        let descriptor = allocation.descriptor(&self.tunables.security_mode);
        self.transport.configure(descriptor).await?;
        self.transport.start_host().await?;
        Ok(())
    }

    async fn roll_back_record(&mut self, record_id: &str) {
        match self.directory.delete(record_id).await {
            Ok(()) => {
                self.ledger.retire(record_id);
                info!(record_id = %record_id, "orphaned record rolled back");
            }
            Err(err) => {
                // Entry stays in the ledger; the shutdown drain retries it.
                warn!(record_id = %record_id, error = %err, "rollback delete failed");
            }
        }
    }

    /// Quick-matches into an open record and starts polling for the token.
    pub async fn join_session(&mut self) -> Result<(), SessionError> {
        if self.phase != SessionPhase::Idle {
            return Err(SessionError::AlreadyActive);
        }
        let record = self.directory.quick_match().await?;
        info!(
            record_id = %record.id,
            members = record.members.len(),
            "quick-matched into session record"
        );
        self.phase = SessionPhase::JoinerWaitingForToken;
        self.poll_timer = TickTimer::expired();
        self.record = Some(record);
        Ok(())
    }

    /// One scheduler quantum. Heartbeat is handled before the poll; both
    /// timers fire when their remainder crosses strictly below zero and are
    /// reset before the service call is awaited. Failures inside the tick
    /// path are logged, not returned; the machine settles itself.
    pub async fn tick(&mut self, dt: Duration) {
        self.handle_heartbeat(dt).await;
        self.handle_poll(dt).await;
    }

    async fn handle_heartbeat(&mut self, dt: Duration) {
        if self.role() != Role::Host {
            return;
        }
        let Some(record_id) = self.record.as_ref().map(|record| record.id.clone()) else {
            return;
        };
        if !self.heartbeat_timer.advance(dt) {
            return;
        }
        self.heartbeat_timer.reset(self.tunables.heartbeat_interval);
        match self.directory.send_heartbeat(&record_id).await {
            Ok(()) => debug!(record_id = %record_id, "heartbeat sent"),
            Err(DirectoryError::NotFound(_)) => {
                warn!(record_id = %record_id, "record gone, clearing session");
                self.clear_session();
            }
            Err(err) => warn!(record_id = %record_id, error = %err, "heartbeat failed"),
        }
    }

    async fn handle_poll(&mut self, dt: Duration) {
        let Some(record_id) = self.record.as_ref().map(|record| record.id.clone()) else {
            return;
        };
        if !self.poll_timer.advance(dt) {
            return;
        }
        self.poll_timer.reset(self.tunables.poll_interval);
        match self.directory.get(&record_id).await {
            Ok(fetched) => self.apply_poll(fetched).await,
            Err(DirectoryError::NotFound(_)) => {
                warn!(record_id = %record_id, "record gone, clearing session");
                self.clear_session();
            }
            Err(err) => warn!(record_id = %record_id, error = %err, "record poll failed"),
        }
    }

    async fn apply_poll(&mut self, fetched: DirectoryRecord) {
        let record_id = fetched.id.clone();
        let known_members = self
            .record
            .as_ref()
            .map(|record| record.members.len())
            .unwrap_or(0);
        if fetched.members.len() != known_members {
            info!(
                record_id = %record_id,
                members = fetched.members.len(),
                capacity = fetched.capacity,
                "membership changed"
            );
        }
        if self.phase == SessionPhase::HostWaitingForPeer && fetched.is_full() {
            info!(record_id = %record_id, "peer joined, session active");
            self.phase = SessionPhase::HostActive;
        }

        let token = fetched
            .field_value(KEY_RELAY_JOIN_CODE)
            .unwrap_or(JOIN_CODE_SENTINEL)
            .to_string();
        self.record = Some(fetched);

        // The host wrote the token itself; only a joiner consumes it.
        if self.role() != Role::Joiner || token == JOIN_CODE_SENTINEL {
            return;
        }

        // Drop the record reference before anything can fail: polling stops
        // here, so this token triggers at most one relay-join attempt.
        self.record = None;
        self.relay_token = token.clone();
        info!(record_id = %record_id, "relay token observed");

        if let Err(err) = self.join_relay(&token).await {
            warn!(record_id = %record_id, error = %err, "relay join failed, clearing session");
            self.clear_session();
            return;
        }
        self.phase = SessionPhase::JoinerActive;
        info!(record_id = %record_id, "joined relay, transport live");
    }

    async fn join_relay(&mut self, token: &str) -> Result<(), SessionError> {
        let allocation = self.relay.join(token).await?;
        let descriptor = allocation.descriptor(&self.tunables.security_mode);
        self.transport.configure(descriptor).await?;
        self.transport.start_client().await?;
        Ok(())
    }

    /// Tears the session down. Drains the ledger with one best-effort delete
    /// per created record, then clears every session field. Only host flows
    /// push ledger entries, so the drain is structurally a no-op for
    /// joiners. Safe to call in any phase.
    pub async fn shutdown(&mut self) {
        if !self.ledger.is_empty() {
            info!(outstanding = self.ledger.len(), "draining created records");
        }
        while let Some(record_id) = self.ledger.pop() {
            match self.directory.delete(&record_id).await {
                Ok(()) => info!(record_id = %record_id, "session record deleted"),
                Err(err) => {
                    warn!(record_id = %record_id, error = %err, "session record delete failed")
                }
            }
        }
        self.clear_session();
    }

    fn clear_session(&mut self) {
        self.phase = SessionPhase::Idle;
        self.record = None;
        self.relay_token = JOIN_CODE_SENTINEL.to_string();
        self.heartbeat_timer = TickTimer::expired();
        self.poll_timer = TickTimer::expired();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{DirectoryOp, InMemoryDirectory};
    use crate::relay::InMemoryRelay;
    use crate::transport::{RecordingTransport, TransportMode};

    struct Harness {
        directory: Arc<InMemoryDirectory>,
        relay: Arc<InMemoryRelay>,
        transport: RecordingTransport,
        coordinator: SessionCoordinator,
    }

    fn harness() -> Harness {
        harness_with(SessionTunables::default())
    }

    fn harness_with(tunables: SessionTunables) -> Harness {
        let directory = Arc::new(InMemoryDirectory::new());
        let relay = Arc::new(InMemoryRelay::new());
        let transport = RecordingTransport::new();
        let coordinator = SessionCoordinator::new(
            directory.clone(),
            relay.clone(),
            Arc::new(transport.clone()),
            tunables,
        )
        .expect("valid tunables");
        Harness {
            directory,
            relay,
            transport,
            coordinator,
        }
    }

    #[test_deadline::deadline]
    fn tunables_reject_out_of_bounds_intervals() {
        let mut tunables = SessionTunables::default();
        tunables.heartbeat_interval = Duration::from_secs(16);
        assert!(matches!(
            tunables.validate(),
            Err(SessionError::InvalidConfig(_))
        ));

        let mut tunables = SessionTunables::default();
        tunables.heartbeat_interval = Duration::ZERO;
        assert!(tunables.validate().is_err());

        let mut tunables = SessionTunables::default();
        tunables.poll_interval = Duration::from_millis(1000);
        assert!(tunables.validate().is_err());

        assert!(SessionTunables::default().validate().is_ok());
    }

    #[test_deadline::async_deadline]
    async fn a_shorter_heartbeat_interval_speeds_up_the_cadence() {
        let mut tunables = SessionTunables::default();
        tunables.heartbeat_interval = Duration::from_secs(5);
        let mut h = harness_with(tunables);
        h.coordinator.create_session().await.expect("create");

        // Fires on the first positive tick, then every full crossing of the
        // five second interval.
        for _ in 0..12 {
            h.coordinator.tick(Duration::from_secs(1)).await;
        }
        assert_eq!(h.directory.count_ops(DirectoryOp::Heartbeat).await, 2);
    }

    #[test_deadline::async_deadline]
    async fn create_session_publishes_token_and_starts_host_transport() {
        let mut h = harness();
        h.coordinator.create_session().await.expect("create");

        assert_eq!(h.coordinator.phase(), SessionPhase::HostWaitingForPeer);
        assert_eq!(h.coordinator.role(), Role::Host);
        assert_ne!(h.coordinator.relay_token(), JOIN_CODE_SENTINEL);
        assert_eq!(h.coordinator.outstanding_cleanup(), 1);
        assert_eq!(h.transport.started_mode(), Some(TransportMode::Host));

        let record_id = h.coordinator.record_id().expect("record held").to_string();
        let snapshot = h.directory.snapshot(&record_id).await.expect("record");
        assert_eq!(
            snapshot.field_value(KEY_RELAY_JOIN_CODE),
            Some(h.coordinator.relay_token())
        );
        assert_eq!(snapshot.capacity, SESSION_CAPACITY);
    }

    #[test_deadline::async_deadline]
    async fn create_session_twice_is_rejected() {
        let mut h = harness();
        h.coordinator.create_session().await.expect("create");
        assert!(matches!(
            h.coordinator.create_session().await,
            Err(SessionError::AlreadyActive)
        ));
    }

    #[test_deadline::async_deadline]
    async fn failed_allocation_rolls_the_record_back() {
        let mut h = harness();
        h.relay
            .fail_next_allocate(RelayError::AllocationFailed("no capacity".into()))
            .await;

        let result = h.coordinator.create_session().await;
        assert!(matches!(result, Err(SessionError::Relay(_))));
        assert_eq!(h.coordinator.phase(), SessionPhase::Idle);
        assert_eq!(h.coordinator.relay_token(), JOIN_CODE_SENTINEL);
        assert_eq!(h.coordinator.outstanding_cleanup(), 0);
        assert_eq!(h.directory.record_count().await, 0);
    }

    #[test_deadline::async_deadline]
    async fn failed_token_publish_rolls_the_record_back() {
        let mut h = harness();
        h.directory
            .inject_failure(DirectoryOp::Update, DirectoryError::Server("boom".into()))
            .await;

        let result = h.coordinator.create_session().await;
        assert!(matches!(result, Err(SessionError::Directory(_))));
        assert_eq!(h.directory.record_count().await, 0);
        assert_eq!(h.coordinator.outstanding_cleanup(), 0);
    }

    #[test_deadline::async_deadline]
    async fn failed_transport_start_rolls_the_record_back() {
        let mut h = harness();
        h.transport
            .fail_next_start(TransportError::Setup("bind refused".into()));

        let result = h.coordinator.create_session().await;
        assert!(matches!(result, Err(SessionError::Transport(_))));
        assert_eq!(h.coordinator.phase(), SessionPhase::Idle);
        assert_eq!(h.directory.record_count().await, 0);
    }

    #[test_deadline::async_deadline]
    async fn failed_rollback_delete_keeps_the_ledger_entry() {
        let mut h = harness();
        h.relay
            .fail_next_allocate(RelayError::AllocationFailed("no capacity".into()))
            .await;
        h.directory
            .inject_failure(DirectoryOp::Delete, DirectoryError::Server("busy".into()))
            .await;

        assert!(h.coordinator.create_session().await.is_err());
        assert_eq!(h.coordinator.phase(), SessionPhase::Idle);
        assert_eq!(h.coordinator.outstanding_cleanup(), 1);
        assert_eq!(h.directory.record_count().await, 1);
    }

    #[test_deadline::async_deadline]
    async fn join_session_starts_polling() {
        let mut h = harness();
        h.directory
            .create("advertised", SESSION_CAPACITY, HashMap::new())
            .await
            .expect("seed record");

        h.coordinator.join_session().await.expect("join");
        assert_eq!(h.coordinator.phase(), SessionPhase::JoinerWaitingForToken);
        assert_eq!(h.coordinator.role(), Role::Joiner);
        assert_eq!(h.coordinator.member_count(), Some(2));
    }

    #[test_deadline::async_deadline]
    async fn join_with_no_open_record_stays_idle() {
        let mut h = harness();
        let result = h.coordinator.join_session().await;
        assert!(matches!(
            result,
            Err(SessionError::Directory(DirectoryError::NoMatchAvailable))
        ));
        assert_eq!(h.coordinator.phase(), SessionPhase::Idle);
        assert_eq!(h.coordinator.role(), Role::Unassigned);
    }

    #[test_deadline::async_deadline]
    async fn host_ignores_its_own_published_token() {
        let mut h = harness();
        h.coordinator.create_session().await.expect("create");

        for _ in 0..5 {
            h.coordinator.tick(Duration::from_millis(1200)).await;
        }
        // Still hosting, never tried to redeem its own code.
        assert_eq!(h.coordinator.role(), Role::Host);
        assert_eq!(h.relay.join_attempt_count().await, 0);
        assert!(h.coordinator.record_id().is_some());
    }

    #[test_deadline::async_deadline]
    async fn heartbeat_runs_before_the_poll_in_a_tick() {
        let mut h = harness();
        h.coordinator.create_session().await.expect("create");
        h.coordinator.tick(Duration::from_millis(100)).await;

        let ops: Vec<DirectoryOp> = h
            .directory
            .calls()
            .await
            .into_iter()
            .map(|(op, _)| op)
            .collect();
        let heartbeat = ops
            .iter()
            .position(|op| *op == DirectoryOp::Heartbeat)
            .expect("heartbeat sent");
        let poll = ops
            .iter()
            .position(|op| *op == DirectoryOp::Get)
            .expect("record polled");
        assert!(
            heartbeat < poll,
            "heartbeat should precede the poll, saw {ops:?}"
        );
    }

    #[test_deadline::async_deadline]
    async fn heartbeat_not_found_clears_the_session() {
        let mut h = harness();
        h.coordinator.create_session().await.expect("create");
        let record_id = h.coordinator.record_id().expect("record").to_string();
        // The record disappears behind the coordinator's back.
        h.directory.delete(&record_id).await.expect("delete");

        h.coordinator.tick(Duration::from_millis(100)).await;
        assert_eq!(h.coordinator.phase(), SessionPhase::Idle);
        assert!(h.coordinator.record_id().is_none());
    }

    #[test_deadline::async_deadline]
    async fn shutdown_drains_every_created_record() {
        let mut h = harness();

        // First create: allocation fails and the rollback delete fails too,
        // so the ledger keeps the first record.
        h.relay
            .fail_next_allocate(RelayError::AllocationFailed("no capacity".into()))
            .await;
        h.directory
            .inject_failure(DirectoryOp::Delete, DirectoryError::Server("busy".into()))
            .await;
        assert!(h.coordinator.create_session().await.is_err());
        assert_eq!(h.coordinator.outstanding_cleanup(), 1);

        // Second create succeeds; two records are now owed a delete.
        h.coordinator.create_session().await.expect("create");
        assert_eq!(h.coordinator.outstanding_cleanup(), 2);
        assert_eq!(h.directory.record_count().await, 2);

        h.coordinator.shutdown().await;
        assert_eq!(h.coordinator.outstanding_cleanup(), 0);
        assert_eq!(h.coordinator.phase(), SessionPhase::Idle);
        assert_eq!(h.coordinator.relay_token(), JOIN_CODE_SENTINEL);
        assert_eq!(h.directory.record_count().await, 0);
        assert_eq!(h.directory.count_ops(DirectoryOp::Delete).await, 3);
    }

    #[test_deadline::async_deadline]
    async fn shutdown_for_a_joiner_deletes_nothing() {
        let mut h = harness();
        h.directory
            .create("advertised", SESSION_CAPACITY, HashMap::new())
            .await
            .expect("seed record");
        h.coordinator.join_session().await.expect("join");

        h.coordinator.shutdown().await;
        assert_eq!(h.coordinator.phase(), SessionPhase::Idle);
        assert_eq!(h.directory.count_ops(DirectoryOp::Delete).await, 0);
        assert_eq!(h.directory.record_count().await, 1);
    }
}

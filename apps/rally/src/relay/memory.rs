//! In-process relay allocator for tests and local wiring.

use std::collections::HashMap;

use async_trait::async_trait;
use rand::{distributions::Alphanumeric, Rng};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{validate_join_code, RelayAllocation, RelayBackend, RelayError};

#[derive(Default)]
struct RelayState {
    allocations: HashMap<String, RelayAllocation>,
    join_attempts: Vec<String>,
    fail_allocate: Option<RelayError>,
    fail_join: Option<RelayError>,
}

#[derive(Default)]
pub struct InMemoryRelay {
    state: Mutex<RelayState>,
}

impl InMemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_next_allocate(&self, err: RelayError) {
        self.state.lock().await.fail_allocate = Some(err);
    }

    pub async fn fail_next_join(&self, err: RelayError) {
        self.state.lock().await.fail_join = Some(err);
    }

    /// Join codes redeemed so far, in order, including rejected ones.
    pub async fn join_attempts(&self) -> Vec<String> {
        self.state.lock().await.join_attempts.clone()
    }

    pub async fn join_attempt_count(&self) -> usize {
        self.state.lock().await.join_attempts.len()
    }

    pub async fn allocation_count(&self) -> usize {
        self.state.lock().await.allocations.len()
    }
}

fn generate_join_code() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .map(|c| char::from(c).to_ascii_uppercase())
        .take(6)
        .collect()
}

#[async_trait]
impl RelayBackend for InMemoryRelay {
    async fn allocate(&self, slots: u32) -> Result<(RelayAllocation, String), RelayError> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.fail_allocate.take() {
            return Err(err);
        }
        if slots == 0 {
            return Err(RelayError::AllocationFailed(
                "allocation needs at least one remote slot".into(),
            ));
        }
        let allocation = RelayAllocation {
            allocation_id: Uuid::new_v4().to_string(),
            host: "relay.local".to_string(),
            port: 42000 + state.allocations.len() as u16,
            connection_data: Uuid::new_v4().simple().to_string(),
        };
        let join_code = generate_join_code();
        state.allocations.insert(join_code.clone(), allocation.clone());
        Ok((allocation, join_code))
    }

    async fn join(&self, join_code: &str) -> Result<RelayAllocation, RelayError> {
        let mut state = self.state.lock().await;
        state.join_attempts.push(join_code.to_string());
        if let Some(err) = state.fail_join.take() {
            return Err(err);
        }
        validate_join_code(join_code)?;
        state
            .allocations
            .get(join_code.trim())
            .cloned()
            .ok_or(RelayError::InvalidJoinCode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_deadline::async_deadline]
    async fn allocation_round_trips_through_its_join_code() {
        let relay = InMemoryRelay::new();
        let (allocation, code) = relay.allocate(1).await.expect("allocate");
        let joined = relay.join(&code).await.expect("join");
        assert_eq!(joined, allocation);
        assert_eq!(relay.join_attempts().await, vec![code]);
    }

    #[test_deadline::async_deadline]
    async fn unknown_code_is_rejected_but_still_counted() {
        let relay = InMemoryRelay::new();
        assert!(matches!(
            relay.join("ZZZZZZ").await,
            Err(RelayError::InvalidJoinCode)
        ));
        assert_eq!(relay.join_attempt_count().await, 1);
    }

    #[test_deadline::deadline]
    fn generated_codes_pass_validation() {
        for _ in 0..32 {
            let code = generate_join_code();
            assert!(validate_join_code(&code).is_ok(), "bad code {code}");
            assert!(code.chars().all(|c| !c.is_ascii_lowercase()));
        }
    }
}

//! Per-command circuit breaker.
//!
//! Breaker state is stored as `circuit_breaker/{command}`. Transitions:
//!
//! ```text
//! Closed --(failure_threshold consecutive failures)--> Open
//! Open   --(cooldown elapsed, one caller wins CAS)---> HalfOpen
//! HalfOpen --(trial succeeds)--> Closed
//! HalfOpen --(trial fails)-----> Open
//! ```
//!
//! The Open → HalfOpen step is a single strict CAS against the version that
//! was read, so only one concurrent caller gets the trial permit.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::store::{EntityRef, OptimisticWriter, StoreError, WriteMeta};
use crate::utils::clock::Clock;

/// Entity type of circuit-breaker rows.
pub const BREAKER_ENTITY: &str = "circuit_breaker";

const BREAKER_SUBJECT: &str = "circuit-breaker";

#[derive(Debug, thiserror::Error)]
pub enum BreakerError {
    #[error("Circuit open for {command}")]
    Open {
        command: String,
        retry_at: Option<DateTime<Utc>>,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Thresholds for one command's breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial is allowed.
    pub cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 30_000,
        }
    }
}

/// Persisted breaker state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BreakerState {
    Closed { consecutive_failures: u32 },
    Open { opened_at_ms: i64 },
    HalfOpen { trial_started_at_ms: i64 },
}

impl Default for BreakerState {
    fn default() -> Self {
        Self::Closed {
            consecutive_failures: 0,
        }
    }
}

impl BreakerState {
    fn decode(value: &Value) -> Self {
        if value.is_null() {
            return Self::default();
        }
        serde_json::from_value(value.clone()).unwrap_or_else(|e| {
            warn!(error = %e, "Unreadable breaker state, treating as closed");
            Self::default()
        })
    }

    fn encode(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// What `acquire` granted the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerPermit {
    /// Circuit closed, normal call.
    Normal,
    /// This caller owns the single half-open trial.
    Trial,
}

/// Circuit breaker over the state store.
pub struct CircuitBreaker {
    writer: OptimisticWriter,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(writer: OptimisticWriter, clock: Arc<dyn Clock>) -> Self {
        Self { writer, clock }
    }

    fn entity(command: &str) -> EntityRef {
        EntityRef::new(BREAKER_ENTITY, command)
    }

    fn meta(command: &str) -> WriteMeta {
        WriteMeta::new(format!("circuit_breaker:{command}"), BREAKER_SUBJECT)
    }

    /// Current state of a command's breaker.
    pub async fn state(&self, command: &str) -> Result<BreakerState, StoreError> {
        let current = self.writer.store().read(&Self::entity(command)).await?;
        Ok(BreakerState::decode(&current.value))
    }

    /// Ask to run `command`.
    pub async fn acquire(
        &self,
        command: &str,
        config: &BreakerConfig,
    ) -> Result<BreakerPermit, BreakerError> {
        let entity = Self::entity(command);
        let current = self.writer.store().read(&entity).await?;
        let now_ms = self.clock.now_ms();
        let cooldown = config.cooldown_ms as i64;

        // A half-open trial that never reported back is treated like an
        // open circuit whose cooldown restarts at the trial start.
        let since = match BreakerState::decode(&current.value) {
            BreakerState::Closed { .. } => return Ok(BreakerPermit::Normal),
            BreakerState::Open { opened_at_ms } => opened_at_ms,
            BreakerState::HalfOpen {
                trial_started_at_ms,
            } => trial_started_at_ms,
        };

        let retry_at_ms = since.saturating_add(cooldown);
        if now_ms < retry_at_ms {
            return Err(BreakerError::Open {
                command: command.to_string(),
                retry_at: Utc.timestamp_millis_opt(retry_at_ms).single(),
            });
        }

        let trial = BreakerState::HalfOpen {
            trial_started_at_ms: now_ms,
        }
        .encode();
        match self
            .writer
            .write(
                &entity,
                Some(current.version),
                &Self::meta(command),
                None,
                |_| trial.clone(),
            )
            .await
        {
            Ok(_) => {
                info!(command, "Circuit half-open, trial call granted");
                Ok(BreakerPermit::Trial)
            }
            Err(e) if e.is_conflict() => Err(BreakerError::Open {
                command: command.to_string(),
                retry_at: None,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Report a successful call.
    pub async fn record_success(
        &self,
        command: &str,
        permit: BreakerPermit,
    ) -> Result<(), StoreError> {
        let current = self.state(command).await?;
        if current == BreakerState::default() {
            return Ok(());
        }

        self.writer
            .write(
                &Self::entity(command),
                None,
                &Self::meta(command),
                None,
                |value| match BreakerState::decode(value) {
                    BreakerState::Closed { .. } => BreakerState::default().encode(),
                    BreakerState::HalfOpen { .. } if permit == BreakerPermit::Trial => {
                        BreakerState::default().encode()
                    }
                    _ => value.clone(),
                },
            )
            .await?;

        if permit == BreakerPermit::Trial {
            info!(command, "Circuit closed after successful trial");
        }
        Ok(())
    }

    /// Report a failed call.
    pub async fn record_failure(
        &self,
        command: &str,
        config: &BreakerConfig,
    ) -> Result<BreakerState, StoreError> {
        let now_ms = self.clock.now_ms();
        let threshold = config.failure_threshold.max(1);

        let receipt = self
            .writer
            .write(
                &Self::entity(command),
                None,
                &Self::meta(command),
                None,
                |value| match BreakerState::decode(value) {
                    BreakerState::Closed {
                        consecutive_failures,
                    } if consecutive_failures + 1 >= threshold => {
                        BreakerState::Open {
                            opened_at_ms: now_ms,
                        }
                        .encode()
                    }
                    BreakerState::Closed {
                        consecutive_failures,
                    } => BreakerState::Closed {
                        consecutive_failures: consecutive_failures + 1,
                    }
                    .encode(),
                    BreakerState::HalfOpen { .. } => BreakerState::Open {
                        opened_at_ms: now_ms,
                    }
                    .encode(),
                    BreakerState::Open { .. } => value.clone(),
                },
            )
            .await?;

        let state = BreakerState::decode(&receipt.entry.value);
        if matches!(state, BreakerState::Open { opened_at_ms } if opened_at_ms == now_ms) {
            warn!(command, threshold, "Circuit opened");
        }
        Ok(state)
    }
}

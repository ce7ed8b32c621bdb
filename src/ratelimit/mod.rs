//! Per-subject throttling and circuit breaking.
//!
//! Both keep their state as ordinary `StateEntry` rows and mutate it through
//! the `OptimisticWriter`, so counters and breaker transitions get the same
//! per-entity CAS guarantee as command state.
//!
//! Rate limiting uses fixed windows: the counter entity for a call is
//! `rate_limit/{subject}:{category}:{window_id}` with
//! `window_id = now_ms / window_ms`. Every call increments the counter,
//! including denied ones.
//!
//! All callers of one subject contend on the same counter row, so the
//! limiter's writer should use [`BackoffPolicy::for_counters`] and each
//! check is bounded by the invocation deadline rather than a retry count.
//!
//! [`BackoffPolicy::for_counters`]: crate::utils::retry::BackoffPolicy::for_counters

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::store::{EntityRef, OptimisticWriter, StoreError, WriteMeta};
use crate::utils::clock::Clock;

pub mod breaker;

pub use breaker::{BreakerConfig, BreakerError, BreakerPermit, BreakerState, CircuitBreaker};

/// Entity type of rate-limit counter rows.
pub const RATE_LIMIT_ENTITY: &str = "rate_limit";

/// Command name recorded on counter audit records.
const RATE_LIMIT_COMMAND: &str = "rate_limit.check";

/// Throttling policy for one category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitPolicy {
    pub category: String,
    #[serde(alias = "window_ms")]
    pub window_ms: u64,
    #[serde(alias = "max_requests")]
    pub max_requests: u64,
}

impl RateLimitPolicy {
    pub fn new(category: impl Into<String>, window_ms: u64, max_requests: u64) -> Self {
        Self {
            category: category.into(),
            window_ms,
            max_requests,
        }
    }
}

/// A call could not be counted. Never a commit conflict: the command has
/// not run yet.
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("Rate-limit counter {entity} still contended after {attempts} attempts")]
    Contended { entity: EntityRef, attempts: u32 },

    #[error("Deadline passed while counting call against {entity}")]
    DeadlineExceeded { entity: EntityRef },

    #[error("Rate-limit counter unavailable: {0}")]
    Store(StoreError),
}

impl From<StoreError> for RateLimitError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::RetriesExhausted { entity, attempts } => {
                Self::Contended { entity, attempts }
            }
            StoreError::VersionConflict { entity, .. } => Self::Contended {
                entity,
                attempts: 1,
            },
            StoreError::DeadlineExceeded { entity } => Self::DeadlineExceeded { entity },
            other => Self::Store(other),
        }
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateDecision {
    /// Call may proceed. `reset_at` is `None` when no policy applies.
    Allow {
        count: u64,
        reset_at: Option<DateTime<Utc>>,
    },
    /// Threshold exceeded for the current window.
    Deny {
        count: u64,
        limit: u64,
        reset_at: DateTime<Utc>,
    },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }
}

/// Fixed-window rate limiter over the state store.
pub struct RateLimiter {
    writer: OptimisticWriter,
    policies: HashMap<String, RateLimitPolicy>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(
        writer: OptimisticWriter,
        policies: impl IntoIterator<Item = RateLimitPolicy>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let policies: HashMap<_, _> = policies
            .into_iter()
            .filter(|p| p.window_ms > 0)
            .map(|p| (p.category.clone(), p))
            .collect();
        info!(policies = policies.len(), "Rate limiter initialized");
        Self {
            writer,
            policies,
            clock,
        }
    }

    pub fn policy(&self, category: &str) -> Option<&RateLimitPolicy> {
        self.policies.get(category)
    }

    /// Count this call against `(subject, category)` and decide.
    ///
    /// Lost CAS races on the counter are retried until `deadline`.
    pub async fn check(
        &self,
        subject: &str,
        category: &str,
        deadline: Option<Instant>,
    ) -> Result<RateDecision, RateLimitError> {
        let Some(policy) = self.policies.get(category) else {
            return Ok(RateDecision::Allow {
                count: 0,
                reset_at: None,
            });
        };

        let now_ms = self.clock.now_ms();
        let window_ms = policy.window_ms as i64;
        let window_id = now_ms.div_euclid(window_ms);
        let reset_at = Utc
            .timestamp_millis_opt((window_id + 1) * window_ms)
            .single()
            .unwrap_or_else(|| self.clock.now());

        let counter = counter_entity(subject, category, window_id);
        let receipt = self
            .writer
            .write(
                &counter,
                None,
                &WriteMeta::new(RATE_LIMIT_COMMAND, subject),
                deadline,
                increment_counter,
            )
            .await
            .map_err(|e| {
                warn!(subject, category, error = %e, "Rate-limit counter not updated");
                RateLimitError::from(e)
            })?;
        let count = receipt.entry.value.as_u64().unwrap_or(0);

        if count > policy.max_requests {
            debug!(
                subject,
                category,
                count,
                limit = policy.max_requests,
                "Rate limit exceeded"
            );
            Ok(RateDecision::Deny {
                count,
                limit: policy.max_requests,
                reset_at,
            })
        } else {
            Ok(RateDecision::Allow {
                count,
                reset_at: Some(reset_at),
            })
        }
    }
}

fn counter_entity(subject: &str, category: &str, window_id: i64) -> EntityRef {
    EntityRef::new(
        RATE_LIMIT_ENTITY,
        format!("{subject}:{category}:{window_id}"),
    )
}

fn increment_counter(value: &Value) -> Value {
    json!(value.as_u64().unwrap_or(0) + 1)
}

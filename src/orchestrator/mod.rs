//! Command orchestrator.
//!
//! Drives one invocation through the pipeline:
//!
//! ```text
//! Pending → PreHooks → RateCheck → Executing → Committing → PostHooks → Completed
//! ```
//!
//! with exits to `Blocked`, `RateLimited`, `Unavailable`, `HandlerFailed`,
//! `TimedOut` and `ConflictFailed`. Every failure exit happens before the
//! commit, so a failed command leaves state and audit untouched. Events are
//! enqueued only after `Completed` and never delay the response.

use std::sync::Arc;
use std::time::{Duration, Instant as StdInstant};

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::ExecutionContext;
use crate::error::CommandError;
use crate::hooks::{HookPipeline, SideEffect};
use crate::queue::{EventQueue, MemoryDeadLetterLog};
use crate::ratelimit::{
    BreakerError, BreakerPermit, BreakerState, CircuitBreaker, RateDecision, RateLimitError,
    RateLimiter,
};
use crate::registry::{CommandDefinition, CommandRegistry, StateView};
use crate::store::{CommitReceipt, OptimisticWriter, StateStore, StoreError, WriteMeta};

mod builder;
mod response;
mod state;

pub use builder::{BuildError, OrchestratorBuilder};
pub use response::{CommandRequest, CommandResponse, ResponseMetadata};
pub use state::ExecutionState;

use state::Execution;

/// Name reported in `hooksRun` and `ValidationBlocked` for schema checks.
pub const SCHEMA_CHECK: &str = "schema";
/// Name reported in `ValidationBlocked` for unknown commands.
pub const REGISTRY_CHECK: &str = "registry";

/// Orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Deadline for commands that do not set their own.
    pub default_deadline_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_deadline_ms: 30_000,
        }
    }
}

/// What a successful run produced.
struct Completion {
    result: Value,
    receipt: Option<CommitReceipt>,
}

/// Executes registered commands.
///
/// Built by [`OrchestratorBuilder`]; cheap to share behind an `Arc`.
pub struct Orchestrator {
    registry: CommandRegistry,
    hooks: HookPipeline,
    writer: OptimisticWriter,
    limiter: RateLimiter,
    breaker: CircuitBreaker,
    queue: EventQueue,
    dead_letter_log: Option<Arc<MemoryDeadLetterLog>>,
    default_deadline: Duration,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        self.writer.store()
    }

    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    /// Dead letters kept in memory, when no other sink was configured.
    pub fn dead_letter_log(&self) -> Option<&MemoryDeadLetterLog> {
        self.dead_letter_log.as_deref()
    }

    pub async fn breaker_state(&self, command: &str) -> Result<BreakerState, StoreError> {
        self.breaker.state(command).await
    }

    /// Stop the event queue. Commands may still execute; their events are
    /// counted as dropped.
    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
    }

    /// Run one command invocation to a terminal state.
    ///
    /// Never returns an error: failures are reported in the response.
    #[tracing::instrument(
        name = "command.execute",
        skip_all,
        fields(command = %request.command, subject = %request.subject, invocation_id)
    )]
    pub async fn execute(&self, request: CommandRequest) -> CommandResponse {
        let started = StdInstant::now();
        let CommandRequest {
            command,
            parameters,
            subject,
        } = request;

        let definition = match self.registry.lookup(&command) {
            Ok(definition) => definition,
            Err(e) => {
                let mut execution = Execution::new(Uuid::nil());
                let err = CommandError::ValidationBlocked {
                    hook: REGISTRY_CHECK.to_string(),
                    reason: e.to_string(),
                };
                execution.fail(&err);
                info!(error = %err, "Rejected unknown command");
                return respond(execution, Uuid::nil(), started, Err(err));
            }
        };

        let budget = definition.deadline.unwrap_or(self.default_deadline);
        let ctx = ExecutionContext::new(command, subject, parameters, budget);
        tracing::Span::current().record(
            "invocation_id",
            tracing::field::display(ctx.invocation_id()),
        );

        let mut execution = Execution::new(ctx.invocation_id());
        let outcome = self.run(&definition, &ctx, &mut execution).await;
        match &outcome {
            Ok(completion) => info!(
                state_version = ?completion.receipt.as_ref().map(|r| r.entry.version),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Command completed"
            ),
            Err(e) => {
                execution.fail(e);
                info!(kind = e.kind(), error = %e, "Command failed");
            }
        }
        respond(execution, ctx.invocation_id(), started, outcome)
    }

    async fn run(
        &self,
        definition: &CommandDefinition,
        ctx: &ExecutionContext,
        execution: &mut Execution,
    ) -> Result<Completion, CommandError> {
        let deadline_ms = (ctx.deadline_at() - ctx.started_at())
            .num_milliseconds()
            .max(0) as u64;
        let timeout = || CommandError::TimeoutError { deadline_ms };

        // PreHooks
        execution.advance(ExecutionState::PreHooks);
        if !definition.parameter_schema.is_empty() {
            execution.hooks_run.push(SCHEMA_CHECK.to_string());
            definition
                .parameter_schema
                .validate(ctx.parameters())
                .map_err(|reason| CommandError::ValidationBlocked {
                    hook: SCHEMA_CHECK.to_string(),
                    reason,
                })?;
        }

        let pre = self.hooks.run_pre(&definition.hooks, ctx).await;
        execution.hooks_run.extend(pre.hooks_run);
        execution.warnings.extend(pre.warnings);
        if let Some(block) = pre.blocked {
            return Err(CommandError::ValidationBlocked {
                hook: block.hook,
                reason: block.reason,
            });
        }

        // RateCheck
        execution.advance(ExecutionState::RateCheck);
        if let Some(class) = &definition.rate_limit_class {
            let decision = self
                .limiter
                .check(ctx.subject(), class, Some(ctx.deadline()))
                .await
                .map_err(|e| match e {
                    RateLimitError::DeadlineExceeded { .. } => timeout(),
                    other => {
                        warn!(error = %other, "Rate check failed, refusing call");
                        unavailable(&definition.name)
                    }
                })?;
            if let RateDecision::Deny { reset_at, .. } = decision {
                return Err(CommandError::RateLimited {
                    category: class.clone(),
                    reset_at,
                });
            }
        }

        let permit = match &definition.circuit_breaker {
            Some(config) => match self.breaker.acquire(&definition.name, config).await {
                Ok(permit) => Some(permit),
                Err(BreakerError::Open { command, retry_at }) => {
                    return Err(CommandError::CommandUnavailable { command, retry_at })
                }
                Err(BreakerError::Store(e)) => {
                    warn!(error = %e, "Circuit breaker state unavailable, refusing call");
                    return Err(unavailable(&definition.name));
                }
            },
            None => None,
        };

        if ctx.is_expired() {
            return Err(timeout());
        }

        // Executing
        execution.advance(ExecutionState::Executing);
        let view = StateView::new(self.writer.store().as_ref());
        let handled =
            tokio::time::timeout_at(ctx.deadline(), definition.handler.handle(ctx, view)).await;
        let output = match handled {
            Ok(Ok(output)) => {
                self.settle_breaker(definition, permit, true).await;
                output
            }
            Ok(Err(e)) => {
                self.settle_breaker(definition, permit, false).await;
                return Err(CommandError::HandlerError(e.to_string()));
            }
            Err(_) => {
                warn!(deadline_ms, "Handler exceeded deadline, abandoned");
                self.settle_breaker(definition, permit, false).await;
                return Err(timeout());
            }
        };

        // Committing
        execution.advance(ExecutionState::Committing);
        let receipt = match &output.mutation {
            Some(mutation) => {
                let meta = WriteMeta::new(ctx.command(), ctx.subject());
                let receipt = self
                    .writer
                    .write(
                        &mutation.entity,
                        mutation.expected_version,
                        &meta,
                        Some(ctx.deadline()),
                        |current| mutation.apply(current),
                    )
                    .await
                    .map_err(|e| CommandError::from_store(e, deadline_ms))?;
                Some(receipt)
            }
            None => None,
        };

        let result = match (output.result, &receipt) {
            (Some(result), _) => result,
            (None, Some(receipt)) => receipt.entry.value.clone(),
            (None, None) => Value::Null,
        };

        // PostHooks
        execution.advance(ExecutionState::PostHooks);
        let post = self.hooks.run_post(&definition.hooks, ctx, &result).await;
        execution.hooks_run.extend(post.hooks_run);
        execution.warnings.extend(post.warnings);

        execution.advance(ExecutionState::Completed);
        self.emit(
            definition,
            ctx,
            &result,
            receipt.as_ref(),
            pre.side_effects.into_iter().chain(post.side_effects),
        );

        Ok(Completion { result, receipt })
    }

    /// Report the handler outcome to the breaker. Breaker bookkeeping
    /// failures are logged and never change the command's outcome.
    async fn settle_breaker(
        &self,
        definition: &CommandDefinition,
        permit: Option<BreakerPermit>,
        success: bool,
    ) {
        let (Some(config), Some(permit)) = (&definition.circuit_breaker, permit) else {
            return;
        };
        let recorded = if success {
            self.breaker.record_success(&definition.name, permit).await
        } else {
            self.breaker
                .record_failure(&definition.name, config)
                .await
                .map(|_| ())
        };
        if let Err(e) = recorded {
            warn!(command = %definition.name, error = %e, "Failed to record breaker outcome");
        }
    }

    /// Enqueue the command's declared events and hook side effects.
    fn emit(
        &self,
        definition: &CommandDefinition,
        ctx: &ExecutionContext,
        result: &Value,
        receipt: Option<&CommitReceipt>,
        side_effects: impl Iterator<Item = SideEffect>,
    ) {
        for event_type in &definition.emits {
            let payload = json!({
                "command": ctx.command(),
                "invocationId": ctx.invocation_id(),
                "subject": ctx.subject(),
                "result": result,
                "stateVersion": receipt.map(|r| r.entry.version),
            });
            let id = self.queue.enqueue(event_type.as_str(), payload);
            debug!(event_id = %id, %event_type, "Enqueued command event");
        }
        for effect in side_effects {
            let id = self.queue.enqueue(effect.event_type.as_str(), effect.payload);
            debug!(event_id = %id, event_type = %effect.event_type, "Enqueued hook side effect");
        }
    }
}

/// Refusal when the rate check or breaker could not reach a decision.
fn unavailable(command: &str) -> CommandError {
    CommandError::CommandUnavailable {
        command: command.to_string(),
        retry_at: None,
    }
}

fn respond(
    execution: Execution,
    invocation_id: Uuid,
    started: StdInstant,
    outcome: Result<Completion, CommandError>,
) -> CommandResponse {
    let state = execution.state();
    let (state_version, audit_id) = match &outcome {
        Ok(Completion {
            receipt: Some(receipt),
            ..
        }) => (Some(receipt.entry.version), Some(receipt.audit.audit_id)),
        _ => (None, None),
    };
    let metadata = ResponseMetadata {
        execution_time_ms: started.elapsed().as_millis() as u64,
        hooks_run: execution.hooks_run,
        state_version,
        audit_id,
        invocation_id,
        state,
        warnings: execution.warnings,
    };
    match outcome {
        Ok(completion) => CommandResponse::completed(completion.result, metadata),
        Err(err) => CommandResponse::failed(err, metadata),
    }
}

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::json;
use tokio::sync::{broadcast, mpsc};

use super::*;
use crate::builtin;
use crate::config::Config;
use crate::hooks::{FnHook, Hook, HookResult, HookSpec};
use crate::queue::{DeliveryOutcome, EventDeliveryError, EventHandler, QueuedEvent};
use crate::ratelimit::{BreakerConfig, RateLimitPolicy};
use crate::registry::{
    CommandPolicy, HandlerError, HandlerOutput, Mutation, ParamType, ParameterSchema,
};
use crate::store::EntityRef;
use crate::utils::clock::ManualClock;

fn counter() -> EntityRef {
    EntityRef::new("counter", "a")
}

fn increment(by: i64) -> CommandRequest {
    CommandRequest::new(
        builtin::STATE_INCREMENT,
        json!({"entityType": "counter", "entityId": "a", "by": by}),
        "alice",
    )
}

fn base() -> OrchestratorBuilder {
    OrchestratorBuilder::with_config(Config::for_test())
        .commands(builtin::commands())
        .hook(Arc::new(builtin::SqlGuard))
}

/// Counts invocations and fails or sleeps on demand.
struct Scripted {
    calls: Arc<AtomicU32>,
    fail: bool,
    delay: Duration,
}

impl Scripted {
    fn definition(name: &str, fail: bool, delay: Duration) -> (CommandDefinition, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let handler = Arc::new(Self {
            calls: calls.clone(),
            fail,
            delay,
        });
        (CommandDefinition::new(name, handler), calls)
    }
}

#[async_trait]
impl crate::registry::CommandHandler for Scripted {
    async fn handle(
        &self,
        _ctx: &ExecutionContext,
        _state: StateView<'_>,
    ) -> Result<HandlerOutput, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(HandlerError::Failed("dependency unavailable".into()));
        }
        Ok(HandlerOutput::mutate(Mutation::set(
            EntityRef::new("scripted", "x"),
            json!("done"),
        )))
    }
}

/// Forwards every event it receives.
struct Forward(mpsc::UnboundedSender<Arc<QueuedEvent>>);

impl EventHandler for Forward {
    fn name(&self) -> &str {
        "forward"
    }

    fn handle(&self, event: Arc<QueuedEvent>) -> BoxFuture<'static, Result<(), EventDeliveryError>> {
        let sender = self.0.clone();
        Box::pin(async move {
            sender
                .send(event)
                .map_err(|e| EventDeliveryError::Failed(e.to_string()))
        })
    }
}

async fn next_outcome(rx: &mut broadcast::Receiver<DeliveryOutcome>) -> DeliveryOutcome {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("outcome within 5s")
        .expect("outcome channel open")
}

#[tokio::test]
async fn test_completed_command_commits_and_reports() {
    let orchestrator = base().build().unwrap();

    let response = orchestrator.execute(increment(5)).await;

    assert!(response.success, "{:?}", response.error);
    assert_eq!(response.result, Some(json!(5)));
    assert_eq!(response.metadata.state, ExecutionState::Completed);
    assert_eq!(response.metadata.state_version, Some(1));
    assert_eq!(response.metadata.hooks_run, vec![SCHEMA_CHECK.to_string()]);
    assert_ne!(response.metadata.invocation_id, Uuid::nil());

    let audit = orchestrator.store().audit_log(&counter()).await.unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(Some(audit[0].audit_id), response.metadata.audit_id);
    assert_eq!(audit[0].command, builtin::STATE_INCREMENT);
    assert_eq!(audit[0].subject, "alice");
}

#[tokio::test]
async fn test_read_only_command_returns_handler_result() {
    let orchestrator = base().build().unwrap();
    orchestrator.execute(increment(2)).await;

    let response = orchestrator
        .execute(CommandRequest::new(
            builtin::STATE_GET,
            json!({"entityType": "counter", "entityId": "a"}),
            "bob",
        ))
        .await;

    assert!(response.success);
    assert_eq!(response.result, Some(json!({"value": 2, "version": 1})));
    assert_eq!(response.metadata.state_version, None);
    assert_eq!(orchestrator.store().audit_records().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_unknown_command_is_blocked() {
    let orchestrator = base().build().unwrap();

    let response = orchestrator
        .execute(CommandRequest::new("nope", json!({}), "alice"))
        .await;

    assert!(!response.success);
    assert_eq!(response.error_kind(), Some("ValidationBlocked"));
    assert_eq!(response.metadata.state, ExecutionState::Blocked);
    assert!(matches!(
        response.cause,
        Some(CommandError::ValidationBlocked { ref hook, .. }) if hook == REGISTRY_CHECK
    ));
}

#[tokio::test]
async fn test_schema_violation_blocks_before_hooks() {
    let orchestrator = base().build().unwrap();

    let response = orchestrator
        .execute(CommandRequest::new(
            builtin::STATE_SET,
            json!({"entityType": "counter"}),
            "alice",
        ))
        .await;

    assert_eq!(response.metadata.state, ExecutionState::Blocked);
    assert_eq!(response.metadata.hooks_run, vec![SCHEMA_CHECK.to_string()]);
    assert!(orchestrator.store().audit_records().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_blocking_pre_hook_prevents_handler_and_commit() {
    let (definition, calls) = Scripted::definition("db.exec", false, Duration::ZERO);
    let orchestrator = base()
        .command(definition.with_hook(HookSpec::pre_blocking(builtin::SQL_GUARD)))
        .build()
        .unwrap();

    let response = orchestrator
        .execute(CommandRequest::new(
            "db.exec",
            json!({"sql": "DROP TABLE users"}),
            "mallory",
        ))
        .await;

    assert_eq!(response.error_kind(), Some("ValidationBlocked"));
    assert_eq!(
        response.error.as_ref().map(|e| e.message.as_str()),
        Some("Parameters contain DROP TABLE")
    );
    assert_eq!(response.metadata.hooks_run, vec![builtin::SQL_GUARD.to_string()]);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(orchestrator.store().audit_records().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_rate_limit_denies_until_next_window() {
    let clock = Arc::new(ManualClock::at_ms(1_000));
    let orchestrator = base()
        .clock(clock.clone())
        .rate_limit(RateLimitPolicy::new("write", 60_000, 2))
        .command(
            CommandDefinition::new("limited", Arc::new(builtin::IncrementState))
                .rate_limited("write"),
        )
        .build()
        .unwrap();
    let request = || {
        CommandRequest::new(
            "limited",
            json!({"entityType": "counter", "entityId": "a"}),
            "alice",
        )
    };

    assert!(orchestrator.execute(request()).await.success);
    assert!(orchestrator.execute(request()).await.success);
    let denied = orchestrator.execute(request()).await;

    assert_eq!(denied.metadata.state, ExecutionState::RateLimited);
    let reset_at = denied.error.as_ref().and_then(|e| e.reset_at).unwrap();
    assert_eq!(reset_at.timestamp_millis(), 60_000);

    clock.set_ms(60_000);
    assert!(orchestrator.execute(request()).await.success);
    assert_eq!(
        orchestrator.store().read(&counter()).await.unwrap().value,
        json!(3)
    );
}

#[tokio::test]
async fn test_handler_error_commits_nothing() {
    let (definition, calls) = Scripted::definition("flaky", true, Duration::ZERO);
    let orchestrator = base().command(definition).build().unwrap();

    let response = orchestrator
        .execute(CommandRequest::new("flaky", json!({}), "alice"))
        .await;

    assert_eq!(response.error_kind(), Some("HandlerError"));
    assert_eq!(response.metadata.state, ExecutionState::HandlerFailed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(orchestrator.store().audit_records().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_deadline_abandons_handler_without_commit() {
    let (definition, _calls) = Scripted::definition("slow", false, Duration::from_millis(400));
    let orchestrator = base()
        .command(definition.with_deadline(Duration::from_millis(50)))
        .build()
        .unwrap();

    let started = StdInstant::now();
    let response = orchestrator
        .execute(CommandRequest::new("slow", json!({}), "alice"))
        .await;

    assert!(started.elapsed() < Duration::from_millis(300));
    assert_eq!(response.error_kind(), Some("TimeoutError"));
    assert_eq!(response.metadata.state, ExecutionState::TimedOut);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(orchestrator.store().audit_records().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_stale_expected_version_is_conflict() {
    let orchestrator = base().build().unwrap();
    orchestrator.execute(increment(1)).await;
    orchestrator.execute(increment(1)).await;

    let response = orchestrator
        .execute(CommandRequest::new(
            builtin::STATE_SET,
            json!({"entityType": "counter", "entityId": "a", "value": 0, "expectedVersion": 1}),
            "alice",
        ))
        .await;

    assert_eq!(response.error_kind(), Some("ConflictError"));
    assert_eq!(response.metadata.state, ExecutionState::ConflictFailed);
    assert_eq!(
        orchestrator.store().read(&counter()).await.unwrap().version,
        2
    );
}

#[tokio::test]
async fn test_breaker_opens_after_threshold() {
    let clock = Arc::new(ManualClock::at_ms(0));
    let (definition, calls) = Scripted::definition("remote", true, Duration::ZERO);
    let orchestrator = base()
        .clock(clock.clone())
        .command(definition.with_circuit_breaker(BreakerConfig {
            failure_threshold: 2,
            cooldown_ms: 1_000,
        }))
        .build()
        .unwrap();
    let request = || CommandRequest::new("remote", json!({}), "alice");

    assert_eq!(
        orchestrator.execute(request()).await.error_kind(),
        Some("HandlerError")
    );
    assert_eq!(
        orchestrator.execute(request()).await.error_kind(),
        Some("HandlerError")
    );

    let rejected = orchestrator.execute(request()).await;
    assert_eq!(rejected.error_kind(), Some("CommandUnavailable"));
    assert_eq!(rejected.metadata.state, ExecutionState::Unavailable);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    clock.advance(Duration::from_millis(1_000));
    assert_eq!(
        orchestrator.execute(request()).await.error_kind(),
        Some("HandlerError")
    );
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(matches!(
        orchestrator.breaker_state("remote").await.unwrap(),
        BreakerState::Open { .. }
    ));
}

#[tokio::test]
async fn test_post_hook_failure_is_a_warning() {
    let veto: Arc<dyn Hook> = Arc::new(FnHook::new("post_veto", |_ctx, _result| {
        Ok(HookResult::block("result looks odd"))
    }));
    let orchestrator = base()
        .hook(veto)
        .command(
            CommandDefinition::new("bump", Arc::new(builtin::IncrementState))
                .with_hook(HookSpec::post_blocking("post_veto")),
        )
        .build()
        .unwrap();

    let response = orchestrator
        .execute(CommandRequest::new(
            "bump",
            json!({"entityType": "counter", "entityId": "a"}),
            "alice",
        ))
        .await;

    assert!(response.success);
    assert_eq!(response.metadata.state, ExecutionState::Completed);
    assert_eq!(response.metadata.warnings.len(), 1);
    assert!(response.metadata.warnings[0].contains("result looks odd"));
    assert_eq!(response.metadata.state_version, Some(1));
}

#[tokio::test]
async fn test_completed_command_emits_events_and_side_effects() {
    let tagger: Arc<dyn Hook> = Arc::new(FnHook::new("tagger", |ctx, _result| {
        Ok(HookResult::allow().with_side_effect("audit.tag", json!({"subject": ctx.subject()})))
    }));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let orchestrator = base()
        .hook(tagger)
        .command(
            CommandDefinition::new("tagged", Arc::new(builtin::IncrementState))
                .with_hook(HookSpec::pre_advisory("tagger"))
                .emits("counter.bumped"),
        )
        .event_handler("counter.bumped", Arc::new(Forward(tx.clone())))
        .event_handler("audit.tag", Arc::new(Forward(tx)))
        .build()
        .unwrap();

    let response = orchestrator
        .execute(CommandRequest::new(
            "tagged",
            json!({"entityType": "counter", "entityId": "a", "by": 4}),
            "alice",
        ))
        .await;
    assert!(response.success);

    let mut received = HashMap::new();
    for _ in 0..2 {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        received.insert(event.event_type.clone(), event.payload.clone());
    }

    let bumped = &received["counter.bumped"];
    assert_eq!(bumped["command"], "tagged");
    assert_eq!(bumped["subject"], "alice");
    assert_eq!(bumped["result"], 4);
    assert_eq!(bumped["stateVersion"], 1);
    assert_eq!(
        bumped["invocationId"],
        json!(response.metadata.invocation_id)
    );
    assert_eq!(received["audit.tag"], json!({"subject": "alice"}));
}

#[tokio::test]
async fn test_failed_command_emits_nothing() {
    let orchestrator = base().build().unwrap();
    let mut outcomes = orchestrator.queue().subscribe();

    let blocked = orchestrator
        .execute(CommandRequest::new(
            builtin::STATE_SET,
            json!({"entityType": "t"}),
            "alice",
        ))
        .await;
    assert!(!blocked.success);

    let completed = orchestrator
        .execute(CommandRequest::new(
            builtin::STATE_SET,
            json!({"entityType": "t", "entityId": "x", "value": 1}),
            "alice",
        ))
        .await;
    assert!(completed.success);

    assert!(matches!(
        next_outcome(&mut outcomes).await,
        DeliveryOutcome::Unrouted { ref event_type, .. } if event_type == builtin::STATE_CHANGED
    ));
    assert_eq!(orchestrator.queue().stats().enqueued, 1);
}

#[tokio::test]
async fn test_build_rejects_unknown_hook() {
    let result = base()
        .command(
            CommandDefinition::new("x", Arc::new(builtin::GetState))
                .with_hook(HookSpec::pre_blocking("missing")),
        )
        .build();

    assert!(matches!(
        result,
        Err(BuildError::UnknownHook { ref hook, .. }) if hook == "missing"
    ));
}

#[tokio::test]
async fn test_build_rejects_duplicate_command() {
    let result = base()
        .command(CommandDefinition::new(
            builtin::STATE_GET,
            Arc::new(builtin::GetState),
        ))
        .build();

    assert!(matches!(result, Err(BuildError::Registry(_))));
}

#[tokio::test]
async fn test_configured_policy_overrides_registration() {
    let mut config = Config::for_test();
    config.rate_limits = vec![RateLimitPolicy::new("write", 60_000, 1)];
    config.commands.insert(
        builtin::STATE_INCREMENT.to_string(),
        CommandPolicy {
            hooks: Some(vec![HookSpec::pre_blocking(builtin::SQL_GUARD)]),
            rate_limit_class: Some("write".to_string()),
            circuit_breaker: None,
        },
    );
    let orchestrator = OrchestratorBuilder::with_config(config)
        .commands(builtin::commands())
        .hook(Arc::new(builtin::SqlGuard))
        .build()
        .unwrap();

    let first = orchestrator.execute(increment(1)).await;
    assert_eq!(
        first.metadata.hooks_run,
        vec![SCHEMA_CHECK.to_string(), builtin::SQL_GUARD.to_string()]
    );
    let second = orchestrator.execute(increment(1)).await;
    assert_eq!(second.error_kind(), Some("RateLimited"));
}

#[tokio::test]
async fn test_custom_schema_type_mismatch() {
    let orchestrator = base()
        .command(
            CommandDefinition::new("typed", Arc::new(builtin::GetState)).with_schema(
                ParameterSchema::new().required("count", ParamType::Integer),
            ),
        )
        .build()
        .unwrap();

    let response = orchestrator
        .execute(CommandRequest::new("typed", json!({"count": "ten"}), "alice"))
        .await;

    assert_eq!(
        response.error.map(|e| e.message),
        Some("Parameter 'count' must be of type integer".to_string())
    );
}

#[tokio::test]
async fn test_dead_letter_log_defaults_to_memory() {
    let orchestrator = base().build().unwrap();
    assert!(orchestrator.dead_letter_log().is_some_and(|log| log.is_empty()));
    orchestrator.shutdown().await;
}

#[test]
fn test_orchestrator_config_default_deadline() {
    assert_eq!(OrchestratorConfig::default().default_deadline_ms, 30_000);
}

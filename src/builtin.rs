//! Built-in commands and hooks.
//!
//! Generic state commands (`state.set`, `state.increment`, `state.get`), the
//! `sql_guard` pre-hook and a logging event handler. Registered by the
//! binary; libraries opt in via [`commands`] and [`hooks`].

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::info;

use crate::context::ExecutionContext;
use crate::hooks::{Hook, HookResult, Result as HookOutcome};
use crate::queue::{EventDeliveryError, EventHandler, QueuedEvent};
use crate::registry::{
    CommandDefinition, CommandHandler, HandlerError, HandlerOutput, Mutation, ParamType,
    ParameterSchema, StateView,
};
use crate::store::EntityRef;

pub const STATE_SET: &str = "state.set";
pub const STATE_INCREMENT: &str = "state.increment";
pub const STATE_GET: &str = "state.get";
/// Emitted after `state.set` and `state.increment` complete.
pub const STATE_CHANGED: &str = "state.changed";
pub const SQL_GUARD: &str = "sql_guard";

const SQL_PATTERNS: &[&str] = &[
    "DROP TABLE",
    "DROP DATABASE",
    "TRUNCATE TABLE",
    "DELETE FROM",
    "; --",
];

fn entity_schema() -> ParameterSchema {
    ParameterSchema::new()
        .required("entityType", ParamType::String)
        .required("entityId", ParamType::String)
}

fn entity_param(ctx: &ExecutionContext) -> Result<EntityRef, HandlerError> {
    let field = |key: &str| {
        ctx.parameter(key)
            .and_then(Value::as_str)
            .ok_or_else(|| HandlerError::InvalidInput(format!("'{key}' must be a string")))
    };
    Ok(EntityRef::new(field("entityType")?, field("entityId")?))
}

/// `state.set {entityType, entityId, value, expectedVersion?}`
pub struct SetState;

#[async_trait]
impl CommandHandler for SetState {
    async fn handle(
        &self,
        ctx: &ExecutionContext,
        _state: StateView<'_>,
    ) -> Result<HandlerOutput, HandlerError> {
        let entity = entity_param(ctx)?;
        let value = ctx.parameter("value").cloned().unwrap_or(Value::Null);
        let mut mutation = Mutation::set(entity, value);
        match ctx.parameter("expectedVersion") {
            None | Some(Value::Null) => {}
            Some(raw) => {
                let expected = raw.as_u64().ok_or_else(|| {
                    HandlerError::InvalidInput(format!(
                        "'expectedVersion' must be a non-negative integer, got {raw}"
                    ))
                })?;
                mutation = mutation.expect_version(expected);
            }
        }
        Ok(HandlerOutput::mutate(mutation))
    }
}

/// `state.increment {entityType, entityId, by?}`; absent counts as 0.
pub struct IncrementState;

#[async_trait]
impl CommandHandler for IncrementState {
    async fn handle(
        &self,
        ctx: &ExecutionContext,
        state: StateView<'_>,
    ) -> Result<HandlerOutput, HandlerError> {
        let entity = entity_param(ctx)?;
        let by = ctx.parameter("by").and_then(Value::as_i64).unwrap_or(1);

        let current = state.read(&entity).await?;
        if !(current.value.is_null() || current.value.is_i64()) {
            return Err(HandlerError::InvalidInput(format!(
                "{entity} does not hold an integer"
            )));
        }

        Ok(HandlerOutput::mutate(Mutation::update(entity, move |v| {
            json!(v.as_i64().unwrap_or(0).saturating_add(by))
        })))
    }
}

/// `state.get {entityType, entityId}` → `{value, version}`
pub struct GetState;

#[async_trait]
impl CommandHandler for GetState {
    async fn handle(
        &self,
        ctx: &ExecutionContext,
        state: StateView<'_>,
    ) -> Result<HandlerOutput, HandlerError> {
        let entity = entity_param(ctx)?;
        let current = state.read(&entity).await?;
        Ok(HandlerOutput::value(json!({
            "value": current.value,
            "version": current.version,
        })))
    }
}

/// The built-in state commands.
pub fn commands() -> Vec<CommandDefinition> {
    vec![
        CommandDefinition::new(STATE_SET, Arc::new(SetState))
            .with_schema(
                entity_schema()
                    .required("value", ParamType::Any)
                    .optional("expectedVersion", ParamType::Integer),
            )
            .emits(STATE_CHANGED),
        CommandDefinition::new(STATE_INCREMENT, Arc::new(IncrementState))
            .with_schema(entity_schema().optional("by", ParamType::Integer))
            .emits(STATE_CHANGED),
        CommandDefinition::new(STATE_GET, Arc::new(GetState)).with_schema(entity_schema()),
    ]
}

/// Rejects parameters containing destructive SQL.
pub struct SqlGuard;

impl SqlGuard {
    fn find(value: &Value) -> Option<&'static str> {
        match value {
            Value::String(s) => {
                let upper = s.to_uppercase();
                SQL_PATTERNS.iter().copied().find(|p| upper.contains(p))
            }
            Value::Array(items) => items.iter().find_map(Self::find),
            Value::Object(map) => map.values().find_map(Self::find),
            _ => None,
        }
    }
}

#[async_trait]
impl Hook for SqlGuard {
    fn name(&self) -> &str {
        SQL_GUARD
    }

    async fn check(&self, ctx: &ExecutionContext, _result: Option<&Value>) -> HookOutcome<HookResult> {
        Ok(match Self::find(ctx.parameters()) {
            Some(pattern) => HookResult::block(format!("Parameters contain {pattern}")),
            None => HookResult::allow(),
        })
    }
}

/// The built-in hooks.
pub fn hooks() -> Vec<Arc<dyn Hook>> {
    vec![Arc::new(SqlGuard)]
}

/// Event handler that only logs what it receives.
pub struct LogEvents;

impl EventHandler for LogEvents {
    fn name(&self) -> &str {
        "log"
    }

    fn handle(&self, event: Arc<QueuedEvent>) -> BoxFuture<'static, Result<(), EventDeliveryError>> {
        Box::pin(async move {
            info!(
                event_id = %event.id,
                event_type = %event.event_type,
                attempt = event.attempt_count,
                payload = %event.payload,
                "Event received"
            );
            Ok(())
        })
    }
}

//! Command registry.
//!
//! Commands are registered explicitly at startup, each with its handler and
//! policy (hooks, rate-limit class, emitted events, optional circuit
//! breaker). The registry is frozen when the orchestrator is built; lookups
//! afterwards are read-only.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::context::ExecutionContext;
use crate::hooks::HookSpec;
use crate::ratelimit::BreakerConfig;
use crate::store::{EntityRef, StateEntry, StateStore, StoreError, Versioned};

pub mod schema;

pub use schema::{ParamField, ParamType, ParameterSchema};

// ============================================================================
// Errors
// ============================================================================

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Command already registered: {0}")]
    DuplicateCommand(String),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),
}

/// Business-logic failure reported by a command handler.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

// ============================================================================
// Handler contract
// ============================================================================

/// Read-only view of the state store handed to handlers.
///
/// Handlers never write directly; they describe a [`Mutation`] that the
/// orchestrator commits after the handler returns.
#[derive(Clone, Copy)]
pub struct StateView<'a> {
    store: &'a dyn StateStore,
}

impl<'a> StateView<'a> {
    pub fn new(store: &'a dyn StateStore) -> Self {
        Self { store }
    }

    pub async fn read(&self, entity: &EntityRef) -> std::result::Result<Versioned, StoreError> {
        self.store.read(entity).await
    }

    pub async fn entry(
        &self,
        entity: &EntityRef,
    ) -> std::result::Result<Option<StateEntry>, StoreError> {
        self.store.entry(entity).await
    }

    pub async fn list(&self, entity_type: &str) -> std::result::Result<Vec<StateEntry>, StoreError> {
        self.store.list(entity_type).await
    }
}

type Apply = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// A state change requested by a handler.
///
/// `apply` maps the current value to the new one and is re-run against fresh
/// state whenever the commit loses a CAS race.
#[derive(Clone)]
pub struct Mutation {
    pub entity: EntityRef,
    /// Commit only if the entity is still at this version (no retry).
    pub expected_version: Option<u64>,
    apply: Apply,
}

impl Mutation {
    pub fn update<F>(entity: EntityRef, apply: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        Self {
            entity,
            expected_version: None,
            apply: Arc::new(apply),
        }
    }

    /// Replace the value outright.
    pub fn set(entity: EntityRef, value: Value) -> Self {
        Self::update(entity, move |_| value.clone())
    }

    pub fn expect_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }

    pub fn apply(&self, current: &Value) -> Value {
        (self.apply)(current)
    }
}

impl fmt::Debug for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutation")
            .field("entity", &self.entity)
            .field("expected_version", &self.expected_version)
            .finish_non_exhaustive()
    }
}

/// What a handler produced.
#[derive(Debug, Clone, Default)]
pub struct HandlerOutput {
    /// Returned to the caller. When `None` and a mutation committed, the
    /// committed value is returned instead.
    pub result: Option<Value>,
    pub mutation: Option<Mutation>,
}

impl HandlerOutput {
    /// Read-only outcome.
    pub fn value(result: Value) -> Self {
        Self {
            result: Some(result),
            mutation: None,
        }
    }

    /// Commit `mutation`; the caller receives the committed value.
    pub fn mutate(mutation: Mutation) -> Self {
        Self {
            result: None,
            mutation: Some(mutation),
        }
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }
}

/// Business logic behind a command.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: &ExecutionContext,
        state: StateView<'_>,
    ) -> std::result::Result<HandlerOutput, HandlerError>;
}

// ============================================================================
// Definitions
// ============================================================================

/// A named, invokable operation and its policy.
#[derive(Clone)]
pub struct CommandDefinition {
    pub name: String,
    pub parameter_schema: ParameterSchema,
    pub handler: Arc<dyn CommandHandler>,
    /// Ordered hook list, both phases.
    pub hooks: Vec<HookSpec>,
    pub rate_limit_class: Option<String>,
    /// Event types enqueued when the command completes.
    pub emits: Vec<String>,
    /// Breaker is opt-in per command.
    pub circuit_breaker: Option<BreakerConfig>,
    /// Overrides the orchestrator's default deadline.
    pub deadline: Option<Duration>,
}

impl CommandDefinition {
    pub fn new(name: impl Into<String>, handler: Arc<dyn CommandHandler>) -> Self {
        Self {
            name: name.into(),
            parameter_schema: ParameterSchema::default(),
            handler,
            hooks: Vec::new(),
            rate_limit_class: None,
            emits: Vec::new(),
            circuit_breaker: None,
            deadline: None,
        }
    }

    pub fn with_schema(mut self, schema: ParameterSchema) -> Self {
        self.parameter_schema = schema;
        self
    }

    pub fn with_hook(mut self, hook: HookSpec) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn with_hooks(mut self, hooks: impl IntoIterator<Item = HookSpec>) -> Self {
        self.hooks.extend(hooks);
        self
    }

    pub fn rate_limited(mut self, class: impl Into<String>) -> Self {
        self.rate_limit_class = Some(class.into());
        self
    }

    pub fn emits(mut self, event_type: impl Into<String>) -> Self {
        self.emits.push(event_type.into());
        self
    }

    pub fn with_circuit_breaker(mut self, config: BreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

impl fmt::Debug for CommandDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandDefinition")
            .field("name", &self.name)
            .field("hooks", &self.hooks)
            .field("rate_limit_class", &self.rate_limit_class)
            .field("emits", &self.emits)
            .field("circuit_breaker", &self.circuit_breaker)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

/// Configured policy overriding a command's registered hooks or class.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandPolicy {
    pub hooks: Option<Vec<HookSpec>>,
    pub rate_limit_class: Option<String>,
    /// `true` enables the breaker with the configured defaults, `false`
    /// removes one set at registration.
    pub circuit_breaker: Option<bool>,
}

// ============================================================================
// Registry
// ============================================================================

/// Name → definition table.
#[derive(Default)]
pub struct CommandRegistry {
    commands: HashMap<String, Arc<CommandDefinition>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, definition: CommandDefinition) -> Result<()> {
        if self.commands.contains_key(&definition.name) {
            return Err(RegistryError::DuplicateCommand(definition.name));
        }
        debug!(
            command = %definition.name,
            hooks = definition.hooks.len(),
            rate_limit_class = ?definition.rate_limit_class,
            "Registered command"
        );
        self.commands
            .insert(definition.name.clone(), Arc::new(definition));
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<CommandDefinition>> {
        self.commands
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownCommand(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    /// Registered command names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.commands.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn definitions(&self) -> impl Iterator<Item = &CommandDefinition> {
        self.commands.values().map(Arc::as_ref)
    }

    /// Replace hooks, rate-limit classes and breaker settings with
    /// configured values.
    pub fn apply_policies(
        &mut self,
        policies: &HashMap<String, CommandPolicy>,
        breaker_defaults: &BreakerConfig,
    ) {
        for (name, policy) in policies {
            let Some(existing) = self.commands.get(name) else {
                warn!(command = %name, "Policy configured for unregistered command");
                continue;
            };
            let mut definition = CommandDefinition::clone(existing);
            if let Some(hooks) = &policy.hooks {
                definition.hooks = hooks.clone();
            }
            if let Some(class) = &policy.rate_limit_class {
                definition.rate_limit_class = Some(class.clone());
            }
            match policy.circuit_breaker {
                Some(true) if definition.circuit_breaker.is_none() => {
                    definition.circuit_breaker = Some(breaker_defaults.clone());
                }
                Some(false) => definition.circuit_breaker = None,
                _ => {}
            }
            debug!(command = %name, "Applied configured command policy");
            self.commands.insert(name.clone(), Arc::new(definition));
        }
    }
}

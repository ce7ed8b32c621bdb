//! Orchestrator assembly.

use std::sync::Arc;

use tracing::info;

use super::Orchestrator;
use crate::config::{Config, ConfigError};
use crate::hooks::{Hook, HookPipeline};
use crate::queue::{DeadLetterSink, EventHandler, EventQueue, EventRoutes, MemoryDeadLetterLog};
use crate::ratelimit::{CircuitBreaker, RateLimitPolicy, RateLimiter};
use crate::registry::{CommandDefinition, CommandRegistry, RegistryError};
use crate::store::{InMemoryStateStore, OptimisticWriter, StateStore};
use crate::utils::clock::{Clock, SystemClock};
use crate::utils::retry::BackoffPolicy;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Command {command} references unregistered hook {hook}")]
    UnknownHook { command: String, hook: String },
}

/// Collects commands, hooks, event handlers and policies, then freezes them
/// into an [`Orchestrator`].
pub struct OrchestratorBuilder {
    config: Config,
    store: Option<Arc<dyn StateStore>>,
    clock: Arc<dyn Clock>,
    hooks: Vec<Arc<dyn Hook>>,
    commands: Vec<CommandDefinition>,
    routes: EventRoutes,
    rate_limits: Vec<RateLimitPolicy>,
    dead_letter_sink: Option<Arc<dyn DeadLetterSink>>,
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        Self {
            config,
            store: None,
            clock: Arc::new(SystemClock),
            hooks: Vec::new(),
            commands: Vec::new(),
            routes: EventRoutes::new(),
            rate_limits: Vec::new(),
            dead_letter_sink: None,
        }
    }

    /// State backend. Defaults to a fresh [`InMemoryStateStore`].
    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Clock for rate-limit windows and breaker cooldowns.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn hook(mut self, hook: Arc<dyn Hook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn command(mut self, definition: CommandDefinition) -> Self {
        self.commands.push(definition);
        self
    }

    pub fn commands(mut self, definitions: impl IntoIterator<Item = CommandDefinition>) -> Self {
        self.commands.extend(definitions);
        self
    }

    pub fn event_handler(
        mut self,
        event_type: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        self.routes.add(event_type, handler);
        self
    }

    /// Adds to the configured policies; replaces one with the same category.
    pub fn rate_limit(mut self, policy: RateLimitPolicy) -> Self {
        self.rate_limits.push(policy);
        self
    }

    /// Where exhausted events go. Defaults to an in-memory log reachable via
    /// [`Orchestrator::dead_letter_log`].
    pub fn dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letter_sink = Some(sink);
        self
    }

    /// Validate and start. Must be called inside a tokio runtime since it
    /// spawns the event queue workers.
    pub fn build(self) -> Result<Orchestrator, BuildError> {
        self.config.validate()?;

        let mut registry = CommandRegistry::new();
        for definition in self.commands {
            registry.register(definition)?;
        }
        registry.apply_policies(&self.config.commands, &self.config.breaker);

        let mut hooks = HookPipeline::new(self.config.hooks.default_timeout());
        for hook in self.hooks {
            hooks.register(hook);
        }
        for definition in registry.definitions() {
            if let Some(spec) = definition.hooks.iter().find(|s| !hooks.contains(&s.name)) {
                return Err(BuildError::UnknownHook {
                    command: definition.name.clone(),
                    hook: spec.name.clone(),
                });
            }
        }

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryStateStore::new()));
        let writer = OptimisticWriter::new(Arc::clone(&store), self.config.store.backoff());
        let counters = OptimisticWriter::new(store, BackoffPolicy::for_counters());

        let policies = self
            .config
            .rate_limits
            .iter()
            .cloned()
            .chain(self.rate_limits);
        let limiter = RateLimiter::new(counters.clone(), policies, Arc::clone(&self.clock));
        let breaker = CircuitBreaker::new(counters, self.clock);

        let (sink, dead_letter_log): (Arc<dyn DeadLetterSink>, _) = match self.dead_letter_sink {
            Some(sink) => (sink, None),
            None => {
                let log = Arc::new(MemoryDeadLetterLog::new());
                (Arc::clone(&log) as Arc<dyn DeadLetterSink>, Some(log))
            }
        };
        let queue = EventQueue::start(self.config.queue.clone(), self.routes, sink);

        info!(
            commands = ?registry.names(),
            hooks = ?hooks.hook_names(),
            default_deadline_ms = self.config.orchestrator.default_deadline_ms,
            "Orchestrator built"
        );

        Ok(Orchestrator {
            registry,
            hooks,
            writer,
            limiter,
            breaker,
            queue,
            dead_letter_log,
            default_deadline: self.config.default_deadline(),
        })
    }
}

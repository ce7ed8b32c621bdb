//! Pre/post hook pipeline.
//!
//! Hooks are registered once by name and referenced from each command's
//! ordered `HookSpec` list. Per phase:
//!
//! 1. Blocking hooks run one at a time in list order. In the pre phase the
//!    first block, error or timeout stops the pipeline and the command is
//!    rejected. In the post phase the same outcomes become warnings and stop
//!    the remaining blocking post-hooks.
//! 2. Advisory hooks then run concurrently, each bounded by its timeout.
//!    Their failures are logged and reported as warnings only.
//!
//! Advisory pre-hooks are skipped when a blocking pre-hook rejected the call.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::context::ExecutionContext;

/// Result type for hook invocations.
pub type Result<T> = std::result::Result<T, HookError>;

/// Errors a hook invocation can produce.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HookError {
    #[error("Hook failed: {0}")]
    Failed(String),

    #[error("Hook timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Hook not registered: {0}")]
    NotRegistered(String),
}

/// When a hook runs relative to the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookPhase {
    Pre,
    Post,
}

/// Whether a hook can stop the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookMode {
    Blocking,
    Advisory,
}

/// One entry in a command's hook list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookSpec {
    pub name: String,
    pub phase: HookPhase,
    pub mode: HookMode,
    /// Per-invocation timeout; the pipeline default applies when unset.
    #[serde(default, alias = "timeout_ms", skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl HookSpec {
    pub fn new(name: impl Into<String>, phase: HookPhase, mode: HookMode) -> Self {
        Self {
            name: name.into(),
            phase,
            mode,
            timeout_ms: None,
        }
    }

    pub fn pre_blocking(name: impl Into<String>) -> Self {
        Self::new(name, HookPhase::Pre, HookMode::Blocking)
    }

    pub fn pre_advisory(name: impl Into<String>) -> Self {
        Self::new(name, HookPhase::Pre, HookMode::Advisory)
    }

    pub fn post_blocking(name: impl Into<String>) -> Self {
        Self::new(name, HookPhase::Post, HookMode::Blocking)
    }

    pub fn post_advisory(name: impl Into<String>) -> Self {
        Self::new(name, HookPhase::Post, HookMode::Advisory)
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// Hook pipeline configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    /// Timeout for hooks whose spec sets none.
    pub default_timeout_ms: u64,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 2_000,
        }
    }
}

impl HooksConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

/// Deferred event requested by a hook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SideEffect {
    pub event_type: String,
    pub payload: Value,
}

/// Outcome of one hook invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HookResult {
    pub blocked: bool,
    pub reason: Option<String>,
    pub side_effects: Vec<SideEffect>,
}

impl HookResult {
    pub fn allow() -> Self {
        Self::default()
    }

    pub fn block(reason: impl Into<String>) -> Self {
        Self {
            blocked: true,
            reason: Some(reason.into()),
            side_effects: Vec::new(),
        }
    }

    pub fn with_side_effect(mut self, event_type: impl Into<String>, payload: Value) -> Self {
        self.side_effects.push(SideEffect {
            event_type: event_type.into(),
            payload,
        });
        self
    }
}

/// A pluggable validator.
///
/// `result` is `None` in the pre phase and the handler's result in the post
/// phase.
#[async_trait]
pub trait Hook: Send + Sync {
    /// Registration name referenced by `HookSpec::name`.
    fn name(&self) -> &str;

    async fn check(&self, ctx: &ExecutionContext, result: Option<&Value>) -> Result<HookResult>;
}

/// Adapts a synchronous closure into a [`Hook`].
pub struct FnHook<F> {
    name: String,
    check: F,
}

impl<F> FnHook<F>
where
    F: Fn(&ExecutionContext, Option<&Value>) -> Result<HookResult> + Send + Sync,
{
    pub fn new(name: impl Into<String>, check: F) -> Self {
        Self {
            name: name.into(),
            check,
        }
    }
}

#[async_trait]
impl<F> Hook for FnHook<F>
where
    F: Fn(&ExecutionContext, Option<&Value>) -> Result<HookResult> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self, ctx: &ExecutionContext, result: Option<&Value>) -> Result<HookResult> {
        (self.check)(ctx, result)
    }
}

/// Why the pre phase rejected a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookBlock {
    pub hook: String,
    pub reason: String,
}

impl fmt::Display for HookBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

/// Accumulated outcome of one phase.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HookReport {
    /// Names of hooks that were invoked, in invocation order.
    pub hooks_run: Vec<String>,
    pub warnings: Vec<String>,
    /// Side effects from hooks that passed.
    pub side_effects: Vec<SideEffect>,
    /// Set only by the pre phase.
    pub blocked: Option<HookBlock>,
}

impl HookReport {
    pub fn is_blocked(&self) -> bool {
        self.blocked.is_some()
    }
}

/// Registered hooks plus the policy for running them.
pub struct HookPipeline {
    hooks: HashMap<String, Arc<dyn Hook>>,
    default_timeout: Duration,
}

impl HookPipeline {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            hooks: HashMap::new(),
            default_timeout,
        }
    }

    /// Register a hook under its own name, replacing any previous one.
    pub fn register(&mut self, hook: Arc<dyn Hook>) {
        let name = hook.name().to_string();
        if self.hooks.insert(name.clone(), hook).is_some() {
            warn!(hook = %name, "Replacing previously registered hook");
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.hooks.contains_key(name)
    }

    pub fn hook_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.hooks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Run the pre phase of `specs` for `ctx`.
    pub async fn run_pre(&self, specs: &[HookSpec], ctx: &ExecutionContext) -> HookReport {
        let mut report = HookReport::default();

        for spec in phase_specs(specs, HookPhase::Pre, HookMode::Blocking) {
            report.hooks_run.push(spec.name.clone());
            match self.invoke(spec, ctx, None).await {
                Ok(result) if result.blocked => {
                    let reason = result
                        .reason
                        .unwrap_or_else(|| format!("Blocked by hook {}", spec.name));
                    debug!(hook = %spec.name, command = %ctx.command(), %reason, "Pre-hook blocked");
                    report.blocked = Some(HookBlock {
                        hook: spec.name.clone(),
                        reason,
                    });
                    return report;
                }
                Ok(result) => report.side_effects.extend(result.side_effects),
                Err(e) => {
                    warn!(hook = %spec.name, command = %ctx.command(), error = %e, "Blocking pre-hook failed, rejecting");
                    report.blocked = Some(HookBlock {
                        hook: spec.name.clone(),
                        reason: format!("Hook {} failed: {}", spec.name, e),
                    });
                    return report;
                }
            }
        }

        self.run_advisory(specs, HookPhase::Pre, ctx, None, &mut report)
            .await;
        report
    }

    /// Run the post phase of `specs` after a successful commit.
    pub async fn run_post(
        &self,
        specs: &[HookSpec],
        ctx: &ExecutionContext,
        result: &Value,
    ) -> HookReport {
        let mut report = HookReport::default();

        for spec in phase_specs(specs, HookPhase::Post, HookMode::Blocking) {
            report.hooks_run.push(spec.name.clone());
            let warning = match self.invoke(spec, ctx, Some(result)).await {
                Ok(outcome) if outcome.blocked => format!(
                    "Post-hook {} blocked: {}",
                    spec.name,
                    outcome.reason.as_deref().unwrap_or("no reason given")
                ),
                Ok(outcome) => {
                    report.side_effects.extend(outcome.side_effects);
                    continue;
                }
                Err(e) => format!("Post-hook {} failed: {}", spec.name, e),
            };
            warn!(hook = %spec.name, command = %ctx.command(), %warning, "Blocking post-hook did not pass");
            report.warnings.push(warning);
            break;
        }

        self.run_advisory(specs, HookPhase::Post, ctx, Some(result), &mut report)
            .await;
        report
    }

    async fn run_advisory(
        &self,
        specs: &[HookSpec],
        phase: HookPhase,
        ctx: &ExecutionContext,
        result: Option<&Value>,
        report: &mut HookReport,
    ) {
        let advisory: Vec<&HookSpec> = phase_specs(specs, phase, HookMode::Advisory).collect();
        if advisory.is_empty() {
            return;
        }

        let outcomes = join_all(
            advisory
                .iter()
                .map(|spec| async move { (*spec, self.invoke(spec, ctx, result).await) }),
        )
        .await;

        for (spec, outcome) in outcomes {
            report.hooks_run.push(spec.name.clone());
            match outcome {
                Ok(hook_result) if hook_result.blocked => {
                    let warning = format!(
                        "Advisory hook {} flagged: {}",
                        spec.name,
                        hook_result.reason.as_deref().unwrap_or("no reason given")
                    );
                    debug!(hook = %spec.name, command = %ctx.command(), %warning, "Advisory hook flagged");
                    report.warnings.push(warning);
                }
                Ok(hook_result) => report.side_effects.extend(hook_result.side_effects),
                Err(e) => {
                    warn!(hook = %spec.name, command = %ctx.command(), error = %e, "Advisory hook failed");
                    report
                        .warnings
                        .push(format!("Advisory hook {} failed: {}", spec.name, e));
                }
            }
        }
    }

    async fn invoke(
        &self,
        spec: &HookSpec,
        ctx: &ExecutionContext,
        result: Option<&Value>,
    ) -> Result<HookResult> {
        let hook = self
            .hooks
            .get(&spec.name)
            .ok_or_else(|| HookError::NotRegistered(spec.name.clone()))?;
        let timeout = spec
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);

        match tokio::time::timeout(timeout, hook.check(ctx, result)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(HookError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

fn phase_specs(
    specs: &[HookSpec],
    phase: HookPhase,
    mode: HookMode,
) -> impl Iterator<Item = &HookSpec> {
    specs
        .iter()
        .filter(move |s| s.phase == phase && s.mode == mode)
}

//! Hooks run around each tool invocation.
//!
//! A call resolves (or creates) its session, runs the tool, records the
//! tool's output into the session, and then gives the time-gated auto-save
//! and cleanup hooks a chance to run. Recording failures are logged and
//! never fail the tool call.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use lensforge_core::config::MiddlewareConfig;
use lensforge_core::{ContextEntry, EvolutionStage, HybridAttempt, Lens, MetricUpdate};

use crate::context::ContextUsage;
use crate::manager::StateManager;

/// Which kind of artifact a tool produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    Lens,
    Evolve,
    Hybridize,
    /// Read-only or unrecognized tools
    Other,
}

impl ToolKind {
    /// Classify a tool by name.
    pub fn from_tool_name(name: &str) -> Self {
        let name = name.to_ascii_lowercase();
        if name.contains("hybrid") {
            ToolKind::Hybridize
        } else if name.contains("evol") {
            ToolKind::Evolve
        } else if name.contains("lens") {
            ToolKind::Lens
        } else {
            ToolKind::Other
        }
    }

    pub fn is_state_changing(self) -> bool {
        !matches!(self, ToolKind::Other)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LensOutput {
    prompt: String,
    #[serde(default)]
    domains: Vec<String>,
    madness_level: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EvolveOutput {
    original_idea: String,
    idea: String,
    pattern: String,
    madness_level: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HybridOutput {
    idea_a: String,
    idea_b: String,
    method: String,
    result: Option<String>,
}

/// Result of a wrapped tool call.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub session_id: String,
    pub output: Value,
}

pub struct SessionMiddleware {
    manager: Arc<StateManager>,
    config: MiddlewareConfig,
    auto_save_interval: Duration,
    cleanup_interval: Duration,
    inactive_threshold_ms: u64,
    last_save: Mutex<Instant>,
    last_cleanup: Mutex<Instant>,
}

impl SessionMiddleware {
    pub fn new(manager: Arc<StateManager>) -> Self {
        let config = manager.config().clone();
        let now = Instant::now();
        Self {
            auto_save_interval: config.persistence.auto_save_interval(),
            cleanup_interval: config.cleanup.run_interval(),
            inactive_threshold_ms: config.cleanup.inactive_threshold_ms,
            config: config.middleware,
            manager,
            last_save: Mutex::new(now),
            last_cleanup: Mutex::new(now),
        }
    }

    pub fn manager(&self) -> &Arc<StateManager> {
        &self.manager
    }

    /// Run `handler` for `tool` with every hook applied.
    ///
    /// The handler receives the resolved session id and the call arguments.
    pub async fn around<F, Fut>(&self, tool: &str, args: Value, handler: F) -> anyhow::Result<ToolOutcome>
    where
        F: FnOnce(String, Value) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<Value>>,
    {
        let session_id = self.resolve_session(tool, &args);
        let output = handler(session_id.clone(), args).await?;

        self.after_call(&session_id, tool, &output);
        self.check_context_limit(&session_id);
        self.maybe_auto_save().await;
        self.maybe_cleanup();

        Ok(ToolOutcome { session_id, output })
    }

    /// Find the session named by `sessionId` in `args`, or create one.
    ///
    /// New sessions take `userId` and `problem` from `args` when present.
    /// The tool call is counted in the session's tool usage.
    pub fn resolve_session(&self, tool: &str, args: &Value) -> String {
        let requested = args.get("sessionId").and_then(Value::as_str);
        let session_id = match requested {
            Some(id) if self.manager.get_session(id).is_some() => id.to_string(),
            _ => {
                let user_id = args
                    .get("userId")
                    .and_then(Value::as_str)
                    .unwrap_or(self.config.anonymous_user_id.as_str());
                let problem = args.get("problem").and_then(Value::as_str);
                let session = self.manager.create_session(user_id, problem);
                if let Some(id) = requested {
                    info!(requested = id, session_id = %session.id, "Unknown session id, started a new session");
                }
                session.id
            }
        };

        if let Err(e) = self
            .manager
            .update_metrics(&session_id, MetricUpdate::ToolUsage(tool.to_string()))
        {
            warn!(session_id = %session_id, tool, error = %e, "Failed to record tool usage");
        }
        session_id
    }

    /// Record a tool's output into its session.
    pub fn after_call(&self, session_id: &str, tool: &str, output: &Value) {
        let kind = ToolKind::from_tool_name(tool);
        let (entry, metrics) = match kind {
            ToolKind::Lens => match LensOutput::deserialize(output) {
                Ok(out) => {
                    let mut metrics = vec![MetricUpdate::TotalGenerations];
                    if let Some(level) = out.madness_level {
                        metrics.push(MetricUpdate::MadnessIndex(level));
                    }
                    metrics.extend(out.domains.iter().cloned().map(MetricUpdate::Domain));
                    (ContextEntry::Lens(Lens::new(out.prompt, out.domains)), metrics)
                }
                Err(e) => return self.skip_output(session_id, tool, e),
            },
            ToolKind::Evolve => match EvolveOutput::deserialize(output) {
                Ok(out) => (
                    ContextEntry::Evolution {
                        original_idea: out.original_idea,
                        stage: EvolutionStage::new(out.idea, out.pattern, out.madness_level),
                    },
                    vec![
                        MetricUpdate::TotalGenerations,
                        MetricUpdate::MadnessIndex(out.madness_level),
                    ],
                ),
                Err(e) => return self.skip_output(session_id, tool, e),
            },
            ToolKind::Hybridize => match HybridOutput::deserialize(output) {
                Ok(out) => {
                    let mut metrics = vec![MetricUpdate::TotalGenerations];
                    if out.result.as_deref().is_some_and(|r| !r.trim().is_empty()) {
                        metrics.push(MetricUpdate::SuccessfulHybrid);
                    }
                    let attempt = HybridAttempt::new(out.idea_a, out.idea_b, out.method, out.result);
                    (ContextEntry::Hybrid(attempt), metrics)
                }
                Err(e) => return self.skip_output(session_id, tool, e),
            },
            ToolKind::Other => return,
        };

        if let Err(e) = self.manager.add_to_context(session_id, entry) {
            warn!(session_id, tool, error = %e, "Failed to record tool output");
            return;
        }
        for metric in metrics {
            if let Err(e) = self.manager.update_metrics(session_id, metric) {
                warn!(session_id, tool, error = %e, "Failed to update metrics");
            }
        }

        if self.config.auto_snapshot && kind.is_state_changing() {
            if let Err(e) = self.manager.create_snapshot(session_id) {
                warn!(session_id, tool, error = %e, "Automatic snapshot failed");
            }
        }
    }

    fn skip_output(&self, session_id: &str, tool: &str, error: serde_json::Error) {
        warn!(session_id, tool, error = %error, "Unrecognized tool output, not recorded");
    }

    /// Warn when a session's context nears the configured ceiling.
    pub fn check_context_limit(&self, session_id: &str) -> Option<ContextUsage> {
        let usage = self.manager.context_usage(session_id)?;
        if usage.ratio >= self.config.context_warning_ratio {
            warn!(
                session_id,
                bytes = usage.bytes,
                max_bytes = usage.max_bytes,
                "Session context approaching size limit"
            );
        }
        Some(usage)
    }

    /// Save state if the auto-save interval has elapsed. Returns whether a
    /// save was attempted.
    pub async fn maybe_auto_save(&self) -> bool {
        if !gate(&self.last_save, self.auto_save_interval) {
            return false;
        }
        if let Err(e) = self.manager.save_state().await {
            warn!(error = %e, "Auto-save failed");
        }
        true
    }

    /// Sweep inactive sessions if the cleanup interval has elapsed.
    pub fn maybe_cleanup(&self) -> Option<usize> {
        if !gate(&self.last_cleanup, self.cleanup_interval) {
            return None;
        }
        let removed = self
            .manager
            .cleanup_inactive_sessions(self.inactive_threshold_ms);
        debug!(removed, "Middleware cleanup sweep");
        Some(removed)
    }
}

/// Claim the gate if `interval` has passed since it was last claimed.
/// A zero interval disables the gate.
fn gate(last: &Mutex<Instant>, interval: Duration) -> bool {
    if interval.is_zero() {
        return false;
    }
    let mut last = last.lock();
    if last.elapsed() < interval {
        return false;
    }
    *last = Instant::now();
    true
}

//! Session and snapshot types.
//!
//! A [`Session`] is the unit of state owned by the state manager. Its
//! `context` is the variable-size part governed by the context size budget;
//! `metrics` and `preferences` are small and fixed-shape.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Upper bound of the madness scale.
pub const MAX_MADNESS: f64 = 10.0;

/// Lifecycle state of a session.
///
/// `Session::state_at` only yields `Active` or `Inactive`. `Deleted` is
/// reported by the state manager for ids no longer in its registry; there is
/// no transition out of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Receiving updates
    Active,
    /// No activity within the inactivity threshold
    Inactive,
    /// Removed from the registry
    Deleted,
}

/// A generated lens prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lens {
    pub timestamp: DateTime<Utc>,
    pub prompt: String,
    #[serde(default)]
    pub domains: Vec<String>,
}

impl Lens {
    pub fn new(prompt: impl Into<String>, domains: Vec<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            prompt: prompt.into(),
            domains,
        }
    }
}

/// One step of an idea evolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvolutionStage {
    pub idea: String,
    /// Name of the evolution pattern that produced this stage
    pub pattern: String,
    pub madness_level: f64,
    pub timestamp: DateTime<Utc>,
}

impl EvolutionStage {
    pub fn new(idea: impl Into<String>, pattern: impl Into<String>, madness_level: f64) -> Self {
        Self {
            idea: idea.into(),
            pattern: pattern.into(),
            madness_level,
            timestamp: Utc::now(),
        }
    }
}

/// A sequence of evolution stages rooted at one original idea.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvolutionChain {
    pub original_idea: String,
    #[serde(default)]
    pub stages: Vec<EvolutionStage>,
    pub current_stage_index: usize,
}

impl EvolutionChain {
    pub fn new(original_idea: impl Into<String>) -> Self {
        Self {
            original_idea: original_idea.into(),
            stages: Vec::new(),
            current_stage_index: 0,
        }
    }

    /// Append a stage and move the cursor onto it.
    pub fn push_stage(&mut self, stage: EvolutionStage) {
        self.stages.push(stage);
        self.current_stage_index = self.stages.len() - 1;
    }

    /// Timestamp of the most recent stage, if any.
    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.stages.iter().map(|s| s.timestamp).max()
    }
}

/// An attempt to combine two ideas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HybridAttempt {
    pub idea_a: String,
    pub idea_b: String,
    pub method: String,
    pub result: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl HybridAttempt {
    pub fn new(
        idea_a: impl Into<String>,
        idea_b: impl Into<String>,
        method: impl Into<String>,
        result: Option<String>,
    ) -> Self {
        Self {
            idea_a: idea_a.into(),
            idea_b: idea_b.into(),
            method: method.into(),
            result,
            timestamp: Utc::now(),
        }
    }
}

/// The size-governed part of a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionContext {
    pub current_problem: String,
    pub generated_lenses: Vec<Lens>,
    pub evolution_chains: Vec<EvolutionChain>,
    pub hybrid_attempts: Vec<HybridAttempt>,
}

impl SessionContext {
    pub fn with_problem(problem: impl Into<String>) -> Self {
        Self {
            current_problem: problem.into(),
            ..Default::default()
        }
    }

    /// Total number of entries across all sub-collections.
    pub fn entry_count(&self) -> usize {
        self.generated_lenses.len() + self.evolution_chains.len() + self.hybrid_attempts.len()
    }

    /// Serialized JSON size in bytes.
    pub fn serialized_size(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }
}

/// Usage metrics for a session.
///
/// Sets and maps are ordered so that serialization (and therefore snapshot
/// checksums) is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionMetrics {
    pub total_generations: u64,
    /// Running mean in `0.0..=10.0`
    pub average_madness_index: f64,
    pub unique_domains_used: BTreeSet<String>,
    pub successful_hybrids: u64,
    pub tool_usage: BTreeMap<String, u64>,
}

/// Optional user-set hints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionPreferences {
    pub preferred_domains: Option<Vec<String>>,
    pub avoided_domains: Option<Vec<String>>,
    pub target_madness_level: Option<f64>,
}

/// One creative working session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub start_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub context: SessionContext,
    pub metrics: SessionMetrics,
    #[serde(default)]
    pub preferences: SessionPreferences,
}

impl Session {
    /// Create a new session with a fresh id.
    pub fn new(user_id: impl Into<String>, initial_problem: Option<&str>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            start_time: now,
            last_activity: now,
            context: SessionContext::with_problem(initial_problem.unwrap_or_default()),
            metrics: SessionMetrics::default(),
            preferences: SessionPreferences::default(),
        }
    }

    /// Bump `last_activity` without ever moving it backwards.
    pub fn touch(&mut self) {
        let now = Utc::now();
        if now > self.last_activity {
            self.last_activity = now;
        }
    }

    /// Lifecycle state relative to `now` and an inactivity threshold.
    pub fn state_at(&self, now: DateTime<Utc>, inactive_threshold: chrono::Duration) -> SessionState {
        if now - self.last_activity > inactive_threshold {
            SessionState::Inactive
        } else {
            SessionState::Active
        }
    }
}

/// Immutable, checksummed copy of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub id: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub state: Session,
    /// Hex SHA-256 of the canonical JSON of `state`
    pub checksum: String,
}

/// Inclusive time range covered by archived entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Lossy summary of entries compacted away.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedData {
    pub item_count: usize,
    pub date_range: Option<DateRange>,
    pub key_highlights: Vec<String>,
    /// Raw archived entries, kept only for context archives
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

// ============================================================================
// Typed partial updates
// ============================================================================

/// Additions to a session context. Sub-collections are appended, never
/// replaced; `current_problem` replaces when set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextUpdate {
    pub current_problem: Option<String>,
    pub generated_lenses: Vec<Lens>,
    pub evolution_chains: Vec<EvolutionChain>,
    pub hybrid_attempts: Vec<HybridAttempt>,
}

/// Field-wise replacement of metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricsUpdate {
    pub total_generations: Option<u64>,
    pub average_madness_index: Option<f64>,
    pub unique_domains_used: Option<BTreeSet<String>>,
    pub successful_hybrids: Option<u64>,
    pub tool_usage: Option<BTreeMap<String, u64>>,
}

/// Field-wise replacement of preferences.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PreferencesUpdate {
    pub preferred_domains: Option<Vec<String>>,
    pub avoided_domains: Option<Vec<String>>,
    pub target_madness_level: Option<f64>,
}

/// Partial update of a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionUpdate {
    pub context: Option<ContextUpdate>,
    pub metrics: Option<MetricsUpdate>,
    pub preferences: Option<PreferencesUpdate>,
}

impl SessionUpdate {
    pub fn context(update: ContextUpdate) -> Self {
        Self {
            context: Some(update),
            ..Default::default()
        }
    }

    pub fn metrics(update: MetricsUpdate) -> Self {
        Self {
            metrics: Some(update),
            ..Default::default()
        }
    }

    pub fn preferences(update: PreferencesUpdate) -> Self {
        Self {
            preferences: Some(update),
            ..Default::default()
        }
    }

    /// Check value ranges. Reports the first problem found.
    pub fn validate(&self) -> Result<()> {
        if let Some(ref metrics) = self.metrics {
            if let Some(avg) = metrics.average_madness_index {
                if !in_madness_range(avg) {
                    return Err(Error::Validation(format!(
                        "averageMadnessIndex {} outside 0..=10",
                        avg
                    )));
                }
            }
        }
        if let Some(ref prefs) = self.preferences {
            if let Some(level) = prefs.target_madness_level {
                if !in_madness_range(level) {
                    return Err(Error::Validation(format!(
                        "targetMadnessLevel {} outside 0..=10",
                        level
                    )));
                }
            }
        }
        if let Some(ref ctx) = self.context {
            for chain in &ctx.evolution_chains {
                if !chain.stages.is_empty() && chain.current_stage_index >= chain.stages.len() {
                    return Err(Error::Validation(format!(
                        "evolution chain '{}' has stage index {} past {} stages",
                        chain.original_idea,
                        chain.current_stage_index,
                        chain.stages.len()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Apply this update to a session in place.
    ///
    /// Context sub-collections are concatenated; metrics and preferences are
    /// merged field by field. Does not touch `last_activity`.
    pub fn apply_to(self, session: &mut Session) {
        if let Some(ctx) = self.context {
            if let Some(problem) = ctx.current_problem {
                session.context.current_problem = problem;
            }
            session.context.generated_lenses.extend(ctx.generated_lenses);
            session.context.evolution_chains.extend(ctx.evolution_chains);
            session.context.hybrid_attempts.extend(ctx.hybrid_attempts);
        }

        if let Some(m) = self.metrics {
            let metrics = &mut session.metrics;
            if let Some(v) = m.total_generations {
                metrics.total_generations = v;
            }
            if let Some(v) = m.average_madness_index {
                metrics.average_madness_index = v;
            }
            if let Some(v) = m.unique_domains_used {
                metrics.unique_domains_used = v;
            }
            if let Some(v) = m.successful_hybrids {
                metrics.successful_hybrids = v;
            }
            if let Some(v) = m.tool_usage {
                metrics.tool_usage = v;
            }
        }

        if let Some(p) = self.preferences {
            let prefs = &mut session.preferences;
            if p.preferred_domains.is_some() {
                prefs.preferred_domains = p.preferred_domains;
            }
            if p.avoided_domains.is_some() {
                prefs.avoided_domains = p.avoided_domains;
            }
            if p.target_madness_level.is_some() {
                prefs.target_madness_level = p.target_madness_level;
            }
        }
    }
}

/// Kind of artifact recorded into a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextKind {
    Lens,
    Evolution,
    Hybrid,
}

/// An artifact to record into a session context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ContextEntry {
    Lens(Lens),
    Evolution {
        #[serde(rename = "originalIdea")]
        original_idea: String,
        stage: EvolutionStage,
    },
    Hybrid(HybridAttempt),
}

impl ContextEntry {
    pub fn kind(&self) -> ContextKind {
        match self {
            ContextEntry::Lens(_) => ContextKind::Lens,
            ContextEntry::Evolution { .. } => ContextKind::Evolution,
            ContextEntry::Hybrid(_) => ContextKind::Hybrid,
        }
    }

    /// Record this entry into a context.
    ///
    /// An evolution entry extends the existing chain with the same original
    /// idea, or starts a new chain.
    pub fn apply_to(self, context: &mut SessionContext) {
        match self {
            ContextEntry::Lens(lens) => context.generated_lenses.push(lens),
            ContextEntry::Evolution {
                original_idea,
                stage,
            } => {
                match context
                    .evolution_chains
                    .iter_mut()
                    .find(|c| c.original_idea == original_idea)
                {
                    Some(chain) => chain.push_stage(stage),
                    None => {
                        let mut chain = EvolutionChain::new(original_idea);
                        chain.push_stage(stage);
                        context.evolution_chains.push(chain);
                    }
                }
            }
            ContextEntry::Hybrid(attempt) => context.hybrid_attempts.push(attempt),
        }
    }
}

/// A single metric event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "metric", content = "value", rename_all = "camelCase")]
pub enum MetricUpdate {
    /// Increment the generation counter by one
    TotalGenerations,
    /// Fold a madness reading into the running mean.
    ///
    /// The mean divides by the *current* `total_generations`, so this must
    /// follow the matching `TotalGenerations` bump in the same operation.
    MadnessIndex(f64),
    /// Record a domain as used
    Domain(String),
    /// Increment the successful-hybrid counter
    SuccessfulHybrid,
    /// Increment the usage counter for a tool
    ToolUsage(String),
}

impl MetricUpdate {
    /// Reject readings that cannot be folded into the running mean.
    pub fn validate(&self) -> Result<()> {
        match self {
            MetricUpdate::MadnessIndex(value) if !value.is_finite() => Err(Error::Validation(
                format!("madness reading {} is not a finite number", value),
            )),
            _ => Ok(()),
        }
    }

    /// Fold this event into `metrics`. A non-finite madness reading is
    /// ignored.
    pub fn apply_to(self, metrics: &mut SessionMetrics) {
        match self {
            MetricUpdate::TotalGenerations => metrics.total_generations += 1,
            MetricUpdate::MadnessIndex(value) if !value.is_finite() => {}
            MetricUpdate::MadnessIndex(value) => {
                let value = value.clamp(0.0, MAX_MADNESS);
                let n = metrics.total_generations.max(1) as f64;
                let avg = metrics.average_madness_index + (value - metrics.average_madness_index) / n;
                metrics.average_madness_index = avg.clamp(0.0, MAX_MADNESS);
            }
            MetricUpdate::Domain(domain) => {
                metrics.unique_domains_used.insert(domain);
            }
            MetricUpdate::SuccessfulHybrid => metrics.successful_hybrids += 1,
            MetricUpdate::ToolUsage(tool) => *metrics.tool_usage.entry(tool).or_insert(0) += 1,
        }
    }
}

fn in_madness_range(value: f64) -> bool {
    value.is_finite() && (0.0..=MAX_MADNESS).contains(&value)
}

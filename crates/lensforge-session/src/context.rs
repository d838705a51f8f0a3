//! Context size governance.
//!
//! Keeps the variable-size part of a session within a byte budget. All
//! operations are pure transformations over [`SessionContext`] values.
//!
//! Trimming is proportional and lossy: every sub-collection is cut by the
//! same factor, keeping its most recent entries. The result is only
//! approximately bounded; a single oversized entry can leave the trimmed
//! context above the budget.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use lensforge_core::{
    ArchivedData, DateRange, EvolutionChain, HybridAttempt, Lens, SessionContext,
};

/// Anything with a creation time that can be ranked by recency.
pub trait Timestamped {
    fn timestamp(&self) -> DateTime<Utc>;
}

impl Timestamped for Lens {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl Timestamped for HybridAttempt {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl Timestamped for EvolutionChain {
    fn timestamp(&self) -> DateTime<Utc> {
        self.last_updated().unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// Ranking parameters for [`ContextManager::prioritize_elements`].
#[derive(Debug, Clone)]
pub struct PriorityCriteria {
    /// Age at which the recency score reaches zero.
    pub max_age: Duration,
    /// Number of most recent elements whose score is doubled.
    pub preserve_recent: usize,
    /// Drop elements scoring below this.
    pub min_importance: Option<f64>,
}

impl Default for PriorityCriteria {
    fn default() -> Self {
        Self {
            max_age: Duration::hours(24),
            preserve_recent: 5,
            min_importance: None,
        }
    }
}

/// An element with its priority score.
#[derive(Debug, Clone, PartialEq)]
pub struct Prioritized<T> {
    pub item: T,
    pub score: f64,
}

/// Byte sizes of the context and its sub-collections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSizes {
    pub total: usize,
    pub lenses: usize,
    pub evolution_chains: usize,
    pub hybrid_attempts: usize,
}

/// Current context usage against a byte budget.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContextUsage {
    pub bytes: usize,
    pub max_bytes: usize,
    /// `bytes / max_bytes`
    pub ratio: f64,
}

impl ContextUsage {
    pub fn exceeds_limit(&self) -> bool {
        self.bytes > self.max_bytes
    }
}

/// Result of archiving entries older than a threshold.
#[derive(Debug, Clone)]
pub struct ArchiveOutcome {
    /// Entries younger than the threshold.
    pub retained: SessionContext,
    /// Summary of what was removed, `None` if nothing was old enough.
    pub archive: Option<ArchivedData>,
}

/// Pure operations over session contexts.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextManager;

impl ContextManager {
    pub fn new() -> Self {
        Self
    }

    /// Serialized JSON size of the context.
    pub fn context_size(&self, context: &SessionContext) -> usize {
        context.serialized_size()
    }

    pub fn measure(&self, context: &SessionContext) -> ContextSizes {
        ContextSizes {
            total: context.serialized_size(),
            lenses: json_len(&context.generated_lenses),
            evolution_chains: json_len(&context.evolution_chains),
            hybrid_attempts: json_len(&context.hybrid_attempts),
        }
    }

    pub fn usage(&self, context: &SessionContext, max_bytes: usize) -> ContextUsage {
        let bytes = self.context_size(context);
        ContextUsage {
            bytes,
            max_bytes,
            ratio: if max_bytes == 0 {
                f64::INFINITY
            } else {
                bytes as f64 / max_bytes as f64
            },
        }
    }

    /// Shrink the context toward `max_bytes`.
    ///
    /// Unchanged if already within budget. Otherwise each sub-collection is
    /// cut to `floor(len * max_bytes / total)` entries, dropping from the
    /// front so the newest entries survive.
    pub fn trim_context(&self, context: &SessionContext, max_bytes: usize) -> SessionContext {
        let sizes = self.measure(context);
        if sizes.total <= max_bytes {
            return context.clone();
        }

        let factor = max_bytes as f64 / sizes.total as f64;
        tracing::debug!(
            total = sizes.total,
            lenses = sizes.lenses,
            evolution_chains = sizes.evolution_chains,
            hybrid_attempts = sizes.hybrid_attempts,
            max_bytes,
            factor,
            "trimming context"
        );

        SessionContext {
            current_problem: context.current_problem.clone(),
            generated_lenses: keep_recent(&context.generated_lenses, factor),
            evolution_chains: keep_recent(&context.evolution_chains, factor),
            hybrid_attempts: keep_recent(&context.hybrid_attempts, factor),
        }
    }

    /// Rank elements by recency.
    ///
    /// Score is `1 - age / max_age` (floored at zero), doubled for the
    /// `preserve_recent` newest elements. Sorted best first.
    pub fn prioritize_elements<T: Timestamped + Clone>(
        &self,
        elements: &[T],
        criteria: &PriorityCriteria,
    ) -> Vec<Prioritized<T>> {
        self.prioritize_elements_at(elements, criteria, Utc::now())
    }

    pub fn prioritize_elements_at<T: Timestamped + Clone>(
        &self,
        elements: &[T],
        criteria: &PriorityCriteria,
        now: DateTime<Utc>,
    ) -> Vec<Prioritized<T>> {
        let max_age_ms = criteria.max_age.num_milliseconds().max(1) as f64;

        let mut newest_first: Vec<usize> = (0..elements.len()).collect();
        newest_first.sort_by(|&a, &b| elements[b].timestamp().cmp(&elements[a].timestamp()));
        let mut boosted = vec![false; elements.len()];
        for &idx in newest_first.iter().take(criteria.preserve_recent) {
            boosted[idx] = true;
        }

        let mut ranked: Vec<Prioritized<T>> = elements
            .iter()
            .enumerate()
            .map(|(idx, item)| {
                let age_ms = (now - item.timestamp()).num_milliseconds().max(0) as f64;
                let mut score = (1.0 - age_ms / max_age_ms).max(0.0);
                if boosted[idx] {
                    score *= 2.0;
                }
                Prioritized {
                    item: item.clone(),
                    score,
                }
            })
            .filter(|p| criteria.min_importance.map_or(true, |min| p.score >= min))
            .collect();

        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        ranked
    }

    /// Split off entries older than `age_threshold` into an archive summary.
    pub fn archive_old_entries(
        &self,
        context: &SessionContext,
        age_threshold: Duration,
    ) -> ArchiveOutcome {
        self.archive_old_entries_at(context, age_threshold, Utc::now())
    }

    pub fn archive_old_entries_at(
        &self,
        context: &SessionContext,
        age_threshold: Duration,
        now: DateTime<Utc>,
    ) -> ArchiveOutcome {
        let cutoff = now - age_threshold;
        let is_old = |ts: DateTime<Utc>| ts < cutoff;

        let (old_lenses, new_lenses): (Vec<Lens>, Vec<Lens>) = context
            .generated_lenses
            .iter()
            .cloned()
            .partition(|l| is_old(l.timestamp));
        let (old_chains, new_chains): (Vec<EvolutionChain>, Vec<EvolutionChain>) = context
            .evolution_chains
            .iter()
            .cloned()
            .partition(|c| is_old(Timestamped::timestamp(c)));
        let (old_hybrids, new_hybrids): (Vec<HybridAttempt>, Vec<HybridAttempt>) = context
            .hybrid_attempts
            .iter()
            .cloned()
            .partition(|h| is_old(h.timestamp));

        let retained = SessionContext {
            current_problem: context.current_problem.clone(),
            generated_lenses: new_lenses,
            evolution_chains: new_chains,
            hybrid_attempts: new_hybrids,
        };

        let item_count = old_lenses.len() + old_chains.len() + old_hybrids.len();
        if item_count == 0 {
            return ArchiveOutcome {
                retained,
                archive: None,
            };
        }

        let timestamps: Vec<DateTime<Utc>> = old_lenses
            .iter()
            .map(|l| l.timestamp)
            .chain(old_chains.iter().flat_map(|c| c.stages.iter().map(|s| s.timestamp)))
            .chain(old_hybrids.iter().map(|h| h.timestamp))
            .collect();
        let date_range = match (timestamps.iter().min(), timestamps.iter().max()) {
            (Some(&start), Some(&end)) => Some(DateRange { start, end }),
            _ => None,
        };

        let mut domains: Vec<&str> = old_lenses
            .iter()
            .flat_map(|l| l.domains.iter().map(String::as_str))
            .collect();
        domains.sort_unstable();
        domains.dedup();

        let key_highlights = vec![
            format!("{} distinct domains explored", domains.len()),
            format!("{} evolution chains", old_chains.len()),
            format!("{} hybrid attempts", old_hybrids.len()),
        ];

        let raw = serde_json::to_value(SessionContext {
            current_problem: String::new(),
            generated_lenses: old_lenses,
            evolution_chains: old_chains,
            hybrid_attempts: old_hybrids,
        })
        .ok();

        ArchiveOutcome {
            retained,
            archive: Some(ArchivedData {
                item_count,
                date_range,
                key_highlights,
                raw,
            }),
        }
    }

    /// Concatenate several contexts into one.
    ///
    /// Lenses and hybrid attempts are sorted by time; evolution chains keep
    /// input order. Duplicates are not removed. The problem statement is the
    /// last non-empty one.
    pub fn merge_contexts(&self, contexts: &[SessionContext]) -> SessionContext {
        let mut merged = SessionContext::default();
        for ctx in contexts {
            if !ctx.current_problem.is_empty() {
                merged.current_problem = ctx.current_problem.clone();
            }
            merged.generated_lenses.extend(ctx.generated_lenses.iter().cloned());
            merged.evolution_chains.extend(ctx.evolution_chains.iter().cloned());
            merged.hybrid_attempts.extend(ctx.hybrid_attempts.iter().cloned());
        }
        merged.generated_lenses.sort_by_key(|l| l.timestamp);
        merged.hybrid_attempts.sort_by_key(|h| h.timestamp);
        merged
    }
}

fn json_len<T: Serialize>(value: &T) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0)
}

fn keep_recent<T: Clone>(items: &[T], factor: f64) -> Vec<T> {
    let keep = ((items.len() as f64) * factor).floor() as usize;
    let keep = keep.min(items.len());
    items[items.len() - keep..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lensforge_core::EvolutionStage;

    fn lens(prompt: &str, ts: DateTime<Utc>) -> Lens {
        Lens {
            timestamp: ts,
            prompt: prompt.to_string(),
            domains: vec!["physics".into()],
        }
    }

    fn big_context(n: usize) -> SessionContext {
        let now = Utc::now();
        let mut ctx = SessionContext::with_problem("test");
        for i in 0..n {
            ctx.generated_lenses.push(lens(
                &format!("lens {} {}", i, "x".repeat(200)),
                now + Duration::seconds(i as i64),
            ));
            ctx.hybrid_attempts.push(HybridAttempt::new(
                format!("a{}", i),
                format!("b{}", i),
                "fusion",
                None,
            ));
        }
        ctx
    }

    #[test]
    fn test_trim_within_budget_is_noop() {
        let manager = ContextManager::new();
        let ctx = big_context(3);
        let trimmed = manager.trim_context(&ctx, 1_000_000);
        assert_eq!(trimmed, ctx);
    }

    #[test]
    fn test_trim_keeps_most_recent() {
        let manager = ContextManager::new();
        let ctx = big_context(40);
        let max = ctx.serialized_size() / 2;

        let trimmed = manager.trim_context(&ctx, max);
        let lenses = &trimmed.generated_lenses;
        assert!(lenses.len() < 40);
        assert!(!lenses.is_empty());
        assert_eq!(lenses.last(), ctx.generated_lenses.last());
        assert_eq!(lenses[0], ctx.generated_lenses[40 - lenses.len()]);
        assert!(trimmed.hybrid_attempts.len() <= ctx.hybrid_attempts.len());
        assert_eq!(trimmed.current_problem, "test");
        assert!(trimmed.serialized_size() < ctx.serialized_size());
    }

    #[test]
    fn test_trim_is_only_approximate() {
        let manager = ContextManager::new();
        let now = Utc::now();
        let mut ctx = SessionContext::with_problem("x".repeat(5_000));
        for i in 0..3 {
            ctx.generated_lenses.push(lens(&format!("lens {}", i), now));
        }

        let trimmed = manager.trim_context(&ctx, 4_000);
        // The problem statement is never trimmed, so the budget is missed
        assert!(trimmed.serialized_size() > 4_000);
        assert!(trimmed.generated_lenses.len() < 3);
        assert_eq!(trimmed.generated_lenses.last(), ctx.generated_lenses.last());
    }

    #[test]
    fn test_prioritize_boosts_recent() {
        let manager = ContextManager::new();
        let now = Utc::now();
        let elements = vec![
            lens("old", now - Duration::hours(12)),
            lens("new", now - Duration::hours(1)),
            lens("ancient", now - Duration::hours(48)),
        ];
        let criteria = PriorityCriteria {
            max_age: Duration::hours(24),
            preserve_recent: 1,
            min_importance: Some(0.1),
        };

        let ranked = manager.prioritize_elements_at(&elements, &criteria, now);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].item.prompt, "new");
        assert!(ranked[0].score > 1.0);
        assert!((ranked[1].score - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_archive_old_entries() {
        let manager = ContextManager::new();
        let now = Utc::now();
        let mut ctx = SessionContext::with_problem("p");
        ctx.generated_lenses = vec![
            lens("old", now - Duration::days(3)),
            lens("fresh", now),
        ];
        let mut chain = EvolutionChain::new("idea");
        let mut stage = EvolutionStage::new("idea v2", "mutation", 4.0);
        stage.timestamp = now - Duration::days(2);
        chain.push_stage(stage);
        ctx.evolution_chains.push(chain);

        let outcome = manager.archive_old_entries_at(&ctx, Duration::days(1), now);
        assert_eq!(outcome.retained.generated_lenses.len(), 1);
        assert!(outcome.retained.evolution_chains.is_empty());

        let archive = outcome.archive.unwrap();
        assert_eq!(archive.item_count, 2);
        assert!(archive.key_highlights.contains(&"1 distinct domains explored".to_string()));
        assert!(archive.key_highlights.contains(&"1 evolution chains".to_string()));
        let range = archive.date_range.unwrap();
        assert_eq!(range.start, now - Duration::days(3));
        assert!(archive.raw.is_some());
    }

    #[test]
    fn test_archive_nothing_old() {
        let manager = ContextManager::new();
        let ctx = big_context(2);
        let outcome = manager.archive_old_entries(&ctx, Duration::days(1));
        assert!(outcome.archive.is_none());
        assert_eq!(outcome.retained, ctx);
    }

    #[test]
    fn test_merge_contexts_sorts_by_time() {
        let manager = ContextManager::new();
        let now = Utc::now();
        let mut a = SessionContext::with_problem("first");
        a.generated_lenses.push(lens("later", now));
        let mut b = SessionContext::with_problem("second");
        b.generated_lenses.push(lens("earlier", now - Duration::minutes(5)));
        b.generated_lenses.push(lens("later", now));

        let merged = manager.merge_contexts(&[a, b]);
        assert_eq!(merged.current_problem, "second");
        assert_eq!(merged.generated_lenses.len(), 3);
        assert_eq!(merged.generated_lenses[0].prompt, "earlier");
    }

    #[test]
    fn test_usage_ratio() {
        let manager = ContextManager::new();
        let ctx = SessionContext::default();
        let usage = manager.usage(&ctx, ctx.serialized_size() * 2);
        assert!((usage.ratio - 0.5).abs() < 1e-9);
        assert!(!usage.exceeds_limit());
    }
}

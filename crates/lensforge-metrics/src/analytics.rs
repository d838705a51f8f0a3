//! Session analytics.
//!
//! Read-only reports computed from a session's history. Nothing here
//! mutates a session or performs I/O; functions that depend on the current
//! time have an `_at` variant taking `now` explicitly.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use lensforge_core::{EvolutionChain, Session};

/// Tuning knobs for the analytics computations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    /// Number of most recent lenses considered for the trend.
    pub sample_window_size: usize,
    /// Weight applied to the unique-domain count of a lens.
    pub domain_weight: f64,
    /// Maximum recency bonus for a lens generated just now.
    pub recency_bonus: f64,
    /// Age after which a lens earns no recency bonus.
    pub recency_horizon_hours: i64,
    /// Slope magnitude below which the trend counts as stable.
    pub stable_slope_band: f64,
    /// Context size above which health is penalized (bytes).
    pub oversized_context_bytes: usize,
    /// Idle time above which health is penalized (minutes).
    pub inactivity_minutes: i64,
    /// Domain count below which health is penalized.
    pub min_healthy_domains: usize,
    /// Domain count below which the report recommends more exploration.
    pub recommended_domains: usize,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            sample_window_size: 10,
            domain_weight: 1.0,
            recency_bonus: 0.5,
            recency_horizon_hours: 24,
            stable_slope_band: 0.1,
            oversized_context_bytes: 50 * 1024,
            inactivity_minutes: 30,
            min_healthy_domains: 5,
            recommended_domains: 10,
        }
    }
}

const OVERSIZED_CONTEXT_PENALTY: u32 = 30;
const INACTIVITY_PENALTY: u32 = 20;
const LOW_DIVERSITY_PENALTY: u32 = 15;

/// Direction of the creativity trend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Increasing,
    Decreasing,
    Stable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreativityTrend {
    pub direction: TrendDirection,
    /// Least-squares slope over the sampled scores
    pub rate: f64,
    /// `0.0..=1.0`
    pub confidence: f64,
    pub sample_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEffectiveness {
    pub domain: String,
    pub usage_count: usize,
    pub last_used: DateTime<Utc>,
    pub effectiveness_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternFrequency {
    /// Stage signature, e.g. `mutation@3 -> inversion@6`
    pub signature: String,
    pub count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvolutionPatternReport {
    /// Signatures sorted by frequency, most common first
    pub common_patterns: Vec<PatternFrequency>,
    /// Hybrid methods used exactly once
    pub unusual_combinations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSummary {
    pub total_ideas_generated: usize,
    pub average_creativity: f64,
    pub most_used_domains: Vec<String>,
    pub peak_madness_level: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReport {
    pub session_id: String,
    pub generated_at: DateTime<Utc>,
    pub summary: ReportSummary,
    pub trend: CreativityTrend,
    pub top_domains: Vec<DomainEffectiveness>,
    pub patterns: EvolutionPatternReport,
    pub highlights: Vec<String>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionHealth {
    /// `0..=100`
    pub score: u32,
    pub issues: Vec<String>,
}

impl SessionHealth {
    pub fn is_healthy(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Pure reporting over a session.
#[derive(Debug, Clone, Default)]
pub struct SessionAnalytics {
    config: AnalyticsConfig,
}

impl SessionAnalytics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: AnalyticsConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AnalyticsConfig {
        &self.config
    }

    pub fn calculate_creativity_trend(&self, session: &Session) -> CreativityTrend {
        self.calculate_creativity_trend_at(session, Utc::now())
    }

    /// Fit a least-squares line through per-lens scores of the most recent
    /// `sample_window_size` lenses, in generation order.
    pub fn calculate_creativity_trend_at(
        &self,
        session: &Session,
        now: DateTime<Utc>,
    ) -> CreativityTrend {
        let lenses = &session.context.generated_lenses;
        let start = lenses.len().saturating_sub(self.config.sample_window_size);
        let horizon = Duration::hours(self.config.recency_horizon_hours.max(1));

        let scores: Vec<f64> = lenses[start..]
            .iter()
            .map(|lens| {
                let mut unique = lens.domains.clone();
                unique.sort();
                unique.dedup();
                let age = (now - lens.timestamp).max(Duration::zero());
                let freshness = 1.0 - (age.num_seconds() as f64 / horizon.num_seconds() as f64);
                unique.len() as f64 * self.config.domain_weight
                    + freshness.max(0.0) * self.config.recency_bonus
            })
            .collect();

        let slope = linear_regression_slope(&scores);
        let direction = if slope > self.config.stable_slope_band {
            TrendDirection::Increasing
        } else if slope < -self.config.stable_slope_band {
            TrendDirection::Decreasing
        } else {
            TrendDirection::Stable
        };

        CreativityTrend {
            direction,
            rate: slope,
            confidence: slope.abs().min(10.0) / 10.0,
            sample_size: scores.len(),
        }
    }

    pub fn find_most_effective_domains(&self, session: &Session) -> Vec<DomainEffectiveness> {
        self.find_most_effective_domains_at(session, Utc::now())
    }

    /// Per-domain usage across lenses, best first.
    ///
    /// The score is usage count weighted by how recently the domain was used.
    pub fn find_most_effective_domains_at(
        &self,
        session: &Session,
        now: DateTime<Utc>,
    ) -> Vec<DomainEffectiveness> {
        let mut usage: HashMap<&str, (usize, DateTime<Utc>)> = HashMap::new();
        for lens in &session.context.generated_lenses {
            for domain in &lens.domains {
                let entry = usage.entry(domain.as_str()).or_insert((0, lens.timestamp));
                entry.0 += 1;
                if lens.timestamp > entry.1 {
                    entry.1 = lens.timestamp;
                }
            }
        }

        let mut domains: Vec<DomainEffectiveness> = usage
            .into_iter()
            .map(|(domain, (count, last_used))| {
                let idle_hours = (now - last_used).num_minutes().max(0) as f64 / 60.0;
                let recency = 1.0 / (1.0 + idle_hours / 24.0);
                DomainEffectiveness {
                    domain: domain.to_string(),
                    usage_count: count,
                    last_used,
                    effectiveness_score: count as f64 * (1.0 + recency),
                }
            })
            .collect();

        domains.sort_by(|a, b| {
            b.effectiveness_score
                .total_cmp(&a.effectiveness_score)
                .then_with(|| a.domain.cmp(&b.domain))
        });
        domains
    }

    /// Group evolution chains by stage signature and flag one-off hybrid
    /// methods.
    pub fn analyze_evolution_patterns(&self, session: &Session) -> EvolutionPatternReport {
        let mut signatures: BTreeMap<String, usize> = BTreeMap::new();
        for chain in &session.context.evolution_chains {
            if chain.stages.is_empty() {
                continue;
            }
            *signatures.entry(chain_signature(chain)).or_insert(0) += 1;
        }

        let mut common_patterns: Vec<PatternFrequency> = signatures
            .into_iter()
            .map(|(signature, count)| PatternFrequency { signature, count })
            .collect();
        common_patterns.sort_by(|a, b| b.count.cmp(&a.count));

        let mut methods: BTreeMap<&str, usize> = BTreeMap::new();
        for attempt in &session.context.hybrid_attempts {
            *methods.entry(attempt.method.as_str()).or_insert(0) += 1;
        }
        let unusual_combinations = methods
            .into_iter()
            .filter(|(_, count)| *count == 1)
            .map(|(method, _)| method.to_string())
            .collect();

        EvolutionPatternReport {
            common_patterns,
            unusual_combinations,
        }
    }

    pub fn generate_session_report(&self, session: &Session) -> SessionReport {
        self.generate_session_report_at(session, Utc::now())
    }

    pub fn generate_session_report_at(&self, session: &Session, now: DateTime<Utc>) -> SessionReport {
        let ctx = &session.context;
        let metrics = &session.metrics;

        let trend = self.calculate_creativity_trend_at(session, now);
        let domains = self.find_most_effective_domains_at(session, now);
        let patterns = self.analyze_evolution_patterns(session);

        let stage_count: usize = ctx.evolution_chains.iter().map(|c| c.stages.len()).sum();
        let total_ideas_generated =
            ctx.generated_lenses.len() + stage_count + ctx.hybrid_attempts.len();

        let peak_madness_level = ctx
            .evolution_chains
            .iter()
            .flat_map(|c| c.stages.iter().map(|s| s.madness_level))
            .fold(metrics.average_madness_index, f64::max);

        let mut by_usage = domains.clone();
        by_usage.sort_by(|a, b| b.usage_count.cmp(&a.usage_count).then_with(|| a.domain.cmp(&b.domain)));
        let most_used_domains: Vec<String> =
            by_usage.iter().take(3).map(|d| d.domain.clone()).collect();

        let mut highlights = Vec::new();
        if trend.direction == TrendDirection::Increasing {
            highlights.push("Creativity is trending upward across recent lenses".to_string());
        }
        if metrics.successful_hybrids > 0 {
            highlights.push(format!(
                "{} successful idea hybrid(s)",
                metrics.successful_hybrids
            ));
        }
        if peak_madness_level >= 8.0 {
            highlights.push(format!("Reached a madness level of {:.1}", peak_madness_level));
        }
        if let Some(longest) = ctx.evolution_chains.iter().max_by_key(|c| c.stages.len()) {
            if longest.stages.len() >= 3 {
                highlights.push(format!(
                    "Evolved '{}' through {} stages",
                    longest.original_idea,
                    longest.stages.len()
                ));
            }
        }

        let mut recommendations = Vec::new();
        if metrics.unique_domains_used.len() < self.config.recommended_domains {
            recommendations.push(format!(
                "Explore more domains: only {} used so far",
                metrics.unique_domains_used.len()
            ));
        }
        if ctx.hybrid_attempts.is_empty() {
            recommendations.push("Try hybridizing two of your ideas".to_string());
        }
        if ctx.evolution_chains.is_empty() {
            recommendations.push("Evolve an idea through several stages".to_string());
        }
        if metrics.total_generations > 0 && metrics.average_madness_index < 3.0 {
            recommendations.push("Push further: average madness is below 3".to_string());
        }
        if trend.direction == TrendDirection::Decreasing {
            recommendations.push("Creativity is dipping; switch to an unfamiliar domain".to_string());
        }

        SessionReport {
            session_id: session.id.clone(),
            generated_at: now,
            summary: ReportSummary {
                total_ideas_generated,
                average_creativity: metrics.average_madness_index,
                most_used_domains,
                peak_madness_level,
            },
            trend,
            top_domains: domains.into_iter().take(5).collect(),
            patterns,
            highlights,
            recommendations,
        }
    }

    pub fn calculate_session_health(&self, session: &Session) -> SessionHealth {
        self.calculate_session_health_at(session, Utc::now())
    }

    /// Start at 100 and subtract fixed penalties; never below 0.
    pub fn calculate_session_health_at(&self, session: &Session, now: DateTime<Utc>) -> SessionHealth {
        let mut score: u32 = 100;
        let mut issues = Vec::new();

        let size = session.context.serialized_size();
        if size > self.config.oversized_context_bytes {
            score = score.saturating_sub(OVERSIZED_CONTEXT_PENALTY);
            issues.push(format!("Context is large ({} KB)", size / 1024));
        }

        let idle = now - session.last_activity;
        if idle > Duration::minutes(self.config.inactivity_minutes) {
            score = score.saturating_sub(INACTIVITY_PENALTY);
            issues.push(format!("Inactive for {} minutes", idle.num_minutes()));
        }

        let domains = session.metrics.unique_domains_used.len();
        if domains < self.config.min_healthy_domains {
            score = score.saturating_sub(LOW_DIVERSITY_PENALTY);
            issues.push(format!("Low domain diversity ({} domains)", domains));
        }

        SessionHealth { score, issues }
    }
}

/// Signature of a chain: its stages' pattern names and rounded madness.
fn chain_signature(chain: &EvolutionChain) -> String {
    chain
        .stages
        .iter()
        .map(|s| format!("{}@{}", s.pattern, s.madness_level.round() as i64))
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Least-squares slope of `values` against their indices.
fn linear_regression_slope(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let n_f = n as f64;
    let mean_x = (n_f - 1.0) / 2.0;
    let mean_y = values.iter().sum::<f64>() / n_f;

    let mut num = 0.0;
    let mut den = 0.0;
    for (i, y) in values.iter().enumerate() {
        let dx = i as f64 - mean_x;
        num += dx * (y - mean_y);
        den += dx * dx;
    }
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lensforge_core::{EvolutionStage, HybridAttempt, Lens};

    fn lens_at(prompt: &str, domains: &[&str], ts: DateTime<Utc>) -> Lens {
        Lens {
            timestamp: ts,
            prompt: prompt.to_string(),
            domains: domains.iter().map(|d| d.to_string()).collect(),
        }
    }

    #[test]
    fn test_slope() {
        assert_eq!(linear_regression_slope(&[]), 0.0);
        assert_eq!(linear_regression_slope(&[3.0]), 0.0);
        assert!((linear_regression_slope(&[1.0, 2.0, 3.0]) - 1.0).abs() < 1e-9);
        assert!((linear_regression_slope(&[4.0, 2.0, 0.0]) + 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_trend_increasing_with_more_domains() {
        let now = Utc::now();
        let mut session = Session::new("u1", Some("test"));
        session.context.generated_lenses = vec![
            lens_at("a", &["x"], now),
            lens_at("b", &["x", "y"], now),
            lens_at("c", &["x", "y", "z"], now),
        ];

        let trend = SessionAnalytics::new().calculate_creativity_trend_at(&session, now);
        assert_eq!(trend.direction, TrendDirection::Increasing);
        assert!((trend.rate - 1.0).abs() < 1e-9);
        assert!((trend.confidence - 0.1).abs() < 1e-9);
        assert_eq!(trend.sample_size, 3);
    }

    #[test]
    fn test_trend_stable_without_history() {
        let session = Session::new("u1", None);
        let trend = SessionAnalytics::new().calculate_creativity_trend(&session);
        assert_eq!(trend.direction, TrendDirection::Stable);
        assert_eq!(trend.confidence, 0.0);
    }

    #[test]
    fn test_trend_uses_window() {
        let now = Utc::now();
        let mut session = Session::new("u1", None);
        // Old, rising part falls outside the window of 2
        session.context.generated_lenses = vec![
            lens_at("a", &[], now),
            lens_at("b", &["x", "y", "z"], now),
            lens_at("c", &["x"], now),
            lens_at("d", &["x"], now),
        ];
        let analytics = SessionAnalytics::with_config(AnalyticsConfig {
            sample_window_size: 2,
            ..Default::default()
        });
        let trend = analytics.calculate_creativity_trend_at(&session, now);
        assert_eq!(trend.sample_size, 2);
        assert_eq!(trend.direction, TrendDirection::Stable);
    }

    #[test]
    fn test_most_effective_domains() {
        let now = Utc::now();
        let mut session = Session::new("u1", None);
        session.context.generated_lenses = vec![
            lens_at("a", &["biology", "music"], now - Duration::hours(2)),
            lens_at("b", &["biology"], now),
        ];

        let domains = SessionAnalytics::new().find_most_effective_domains_at(&session, now);
        assert_eq!(domains.len(), 2);
        assert_eq!(domains[0].domain, "biology");
        assert_eq!(domains[0].usage_count, 2);
        assert_eq!(domains[0].last_used, now);
    }

    #[test]
    fn test_evolution_patterns() {
        let mut session = Session::new("u1", None);
        for idea in ["a", "b"] {
            let mut chain = EvolutionChain::new(idea);
            chain.push_stage(EvolutionStage::new("x", "mutation", 3.0));
            chain.push_stage(EvolutionStage::new("y", "inversion", 6.0));
            session.context.evolution_chains.push(chain);
        }
        let mut odd = EvolutionChain::new("c");
        odd.push_stage(EvolutionStage::new("z", "explosion", 9.0));
        session.context.evolution_chains.push(odd);

        session.context.hybrid_attempts = vec![
            HybridAttempt::new("a", "b", "fusion", None),
            HybridAttempt::new("a", "c", "fusion", None),
            HybridAttempt::new("b", "c", "parasitic", None),
        ];

        let report = SessionAnalytics::new().analyze_evolution_patterns(&session);
        assert_eq!(report.common_patterns[0].signature, "mutation@3 -> inversion@6");
        assert_eq!(report.common_patterns[0].count, 2);
        assert_eq!(report.unusual_combinations, vec!["parasitic".to_string()]);
    }

    #[test]
    fn test_report_recommends_more_domains() {
        let session = Session::new("u1", Some("test"));
        let report = SessionAnalytics::new().generate_session_report(&session);
        assert_eq!(report.summary.total_ideas_generated, 0);
        assert!(report
            .recommendations
            .iter()
            .any(|r| r.starts_with("Explore more domains")));
    }

    #[test]
    fn test_report_summary_top_three() {
        let now = Utc::now();
        let mut session = Session::new("u1", None);
        session.context.generated_lenses = vec![
            lens_at("a", &["a", "b", "c", "d"], now),
            lens_at("b", &["a", "b", "c"], now),
            lens_at("c", &["a", "b"], now),
        ];
        let report = SessionAnalytics::new().generate_session_report_at(&session, now);
        assert_eq!(report.summary.most_used_domains, vec!["a", "b", "c"]);
        assert_eq!(report.summary.total_ideas_generated, 3);
    }

    #[test]
    fn test_health_penalties() {
        let now = Utc::now();
        let mut session = Session::new("u1", None);
        let analytics = SessionAnalytics::new();

        // No domains yet
        let health = analytics.calculate_session_health_at(&session, now);
        assert_eq!(health.score, 85);
        assert_eq!(health.issues.len(), 1);

        session.last_activity = now - Duration::minutes(45);
        session.context.current_problem = "x".repeat(60 * 1024);
        let health = analytics.calculate_session_health_at(&session, now);
        assert_eq!(health.score, 35);
        assert_eq!(health.issues.len(), 3);
    }

    #[test]
    fn test_health_full_score() {
        let now = Utc::now();
        let mut session = Session::new("u1", None);
        for d in ["a", "b", "c", "d", "e"] {
            session.metrics.unique_domains_used.insert(d.to_string());
        }
        let health = SessionAnalytics::new().calculate_session_health_at(&session, now);
        assert_eq!(health.score, 100);
        assert!(health.is_healthy());
    }

    #[test]
    fn test_report_serializes_camel_case() {
        let session = Session::new("u1", Some("test"));
        let report = SessionAnalytics::new().generate_session_report(&session);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["sessionId"], session.id.as_str());
        assert!(json["summary"]["totalIdeasGenerated"].is_number());
        assert!(json["summary"]["mostUsedDomains"].is_array());
    }
}

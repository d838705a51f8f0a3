//! Portable export format.
//!
//! Sets and maps are written as plain arrays and `[key, value]` pairs so the
//! document does not depend on how a reader models collections.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lensforge_core::{Session, SessionContext, SessionMetrics, SessionPreferences, StateSnapshot};
use lensforge_metrics::SessionReport;

/// Version tag written into, and required from, every export document.
pub const EXPORT_FORMAT_VERSION: &str = "1.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportDocument {
    pub version: String,
    pub session: ExportedSession,
    #[serde(default)]
    pub snapshots: Vec<ExportedSnapshot>,
    #[serde(default)]
    pub report: Option<SessionReport>,
    pub export_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedMetrics {
    pub total_generations: u64,
    pub average_madness_index: f64,
    #[serde(default)]
    pub unique_domains_used: Vec<String>,
    pub successful_hybrids: u64,
    #[serde(default)]
    pub tool_usage: Vec<(String, u64)>,
}

impl From<&SessionMetrics> for ExportedMetrics {
    fn from(m: &SessionMetrics) -> Self {
        Self {
            total_generations: m.total_generations,
            average_madness_index: m.average_madness_index,
            unique_domains_used: m.unique_domains_used.iter().cloned().collect(),
            successful_hybrids: m.successful_hybrids,
            tool_usage: m
                .tool_usage
                .iter()
                .map(|(tool, count)| (tool.clone(), *count))
                .collect(),
        }
    }
}

impl From<ExportedMetrics> for SessionMetrics {
    fn from(m: ExportedMetrics) -> Self {
        let mut tool_usage = std::collections::BTreeMap::new();
        for (tool, count) in m.tool_usage {
            *tool_usage.entry(tool).or_insert(0) += count;
        }
        Self {
            total_generations: m.total_generations,
            average_madness_index: m.average_madness_index,
            unique_domains_used: m.unique_domains_used.into_iter().collect(),
            successful_hybrids: m.successful_hybrids,
            tool_usage,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedSession {
    pub id: String,
    pub user_id: String,
    pub start_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub context: SessionContext,
    pub metrics: ExportedMetrics,
    #[serde(default)]
    pub preferences: SessionPreferences,
}

impl From<&Session> for ExportedSession {
    fn from(s: &Session) -> Self {
        Self {
            id: s.id.clone(),
            user_id: s.user_id.clone(),
            start_time: s.start_time,
            last_activity: s.last_activity,
            context: s.context.clone(),
            metrics: ExportedMetrics::from(&s.metrics),
            preferences: s.preferences.clone(),
        }
    }
}

impl From<ExportedSession> for Session {
    fn from(s: ExportedSession) -> Self {
        Self {
            id: s.id,
            user_id: s.user_id,
            start_time: s.start_time,
            last_activity: s.last_activity,
            context: s.context,
            metrics: s.metrics.into(),
            preferences: s.preferences,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedSnapshot {
    pub id: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub state: ExportedSession,
    pub checksum: String,
}

impl From<&StateSnapshot> for ExportedSnapshot {
    fn from(s: &StateSnapshot) -> Self {
        Self {
            id: s.id.clone(),
            session_id: s.session_id.clone(),
            timestamp: s.timestamp,
            state: ExportedSession::from(&s.state),
            checksum: s.checksum.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_written_as_arrays_and_pairs() {
        let mut session = Session::new("u1", Some("test"));
        session.metrics.unique_domains_used.insert("biology".into());
        session.metrics.tool_usage.insert("generate_lens".into(), 3);

        let exported = ExportedSession::from(&session);
        let json = serde_json::to_value(&exported).unwrap();
        assert_eq!(json["metrics"]["uniqueDomainsUsed"], serde_json::json!(["biology"]));
        assert_eq!(json["metrics"]["toolUsage"], serde_json::json!([["generate_lens", 3]]));

        let back: Session = exported.into();
        assert_eq!(back, session);
    }

    #[test]
    fn test_duplicate_tool_pairs_are_summed() {
        let metrics = ExportedMetrics {
            total_generations: 0,
            average_madness_index: 0.0,
            unique_domains_used: vec!["a".into(), "a".into()],
            successful_hybrids: 0,
            tool_usage: vec![("t".into(), 1), ("t".into(), 2)],
        };
        let metrics: SessionMetrics = metrics.into();
        assert_eq!(metrics.tool_usage["t"], 3);
        assert_eq!(metrics.unique_domains_used.len(), 1);
    }
}

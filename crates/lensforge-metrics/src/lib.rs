//! # lensforge-metrics
//!
//! Session analytics and health reporting for Lensforge.
//!
//! This crate provides:
//! - Creativity trend over recent lenses
//! - Domain effectiveness ranking
//! - Evolution pattern frequency and unusual hybrid methods
//! - Session reports with highlights and recommendations
//! - Session health scoring

pub mod analytics;

pub use analytics::{
    AnalyticsConfig, CreativityTrend, DomainEffectiveness, EvolutionPatternReport,
    PatternFrequency, ReportSummary, SessionAnalytics, SessionHealth, SessionReport,
    TrendDirection,
};

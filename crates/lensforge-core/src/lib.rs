//! # lensforge-core
//!
//! Core types and abstractions for Lensforge, the session state server for
//! the creative prompt-generation tools.
//!
//! This crate provides:
//! - The session entity model (context, metrics, preferences)
//! - Snapshots and archive summaries
//! - Typed partial updates and context/metric events
//! - Configuration system
//! - Common error types

pub mod config;
pub mod error;
pub mod session;

pub use config::{BackendKind, Config};
pub use error::{Error, Result};
pub use session::{
    ArchivedData, ContextEntry, ContextKind, ContextUpdate, DateRange, EvolutionChain,
    EvolutionStage, HybridAttempt, Lens, MetricUpdate, MetricsUpdate, PreferencesUpdate, Session,
    SessionContext, SessionMetrics, SessionPreferences, SessionState, SessionUpdate,
    StateSnapshot,
};

//! # lensforge-session
//!
//! Session state management for Lensforge.
//!
//! This crate provides:
//! - An in-memory session registry with LRU-by-activity eviction
//! - Checksummed snapshots with rollback and archival
//! - Context size governance (trim, prioritize, archive, merge)
//! - Key-value persistence over memory, file and placeholder remote backends
//! - Versioned session export and import
//! - Middleware hooks wrapping tool invocations
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use lensforge_core::{Config, ContextEntry, Lens};
//! use lensforge_session::StateManager;
//!
//! let manager = Arc::new(StateManager::new(Config::load()?));
//! manager.initialize().await?;
//!
//! let session = manager.create_session("user-1", Some("reinvent the umbrella"));
//! manager.add_to_context(&session.id, ContextEntry::Lens(Lens::new("...", vec![])))?;
//! let snapshot = manager.create_snapshot(&session.id)?;
//!
//! manager.shutdown().await?;
//! ```
//!
//! ## Storage Layout
//!
//! With the file backend every key is stored at `<location>/<key>.json`:
//! - `state.json` - all sessions and snapshots
//! - `session_<id>.json` - one session and its snapshots, for recovery when
//!   the bulk record is unreadable
//! - `archive_<id>_<millis>_<uuid>.json` - summaries of compressed snapshots

pub mod context;
pub mod export;
pub mod manager;
pub mod middleware;
pub mod persistence;

// Re-export commonly used types
pub use context::{
    ArchiveOutcome, ContextManager, ContextSizes, ContextUsage, Prioritized, PriorityCriteria,
    Timestamped,
};
pub use export::{
    ExportDocument, ExportedMetrics, ExportedSession, ExportedSnapshot, EXPORT_FORMAT_VERSION,
};
pub use manager::{IntegrityIssue, ManagerStats, StateError, StateManager};
pub use middleware::{SessionMiddleware, ToolKind, ToolOutcome};
pub use persistence::{
    FileBackend, MemoryBackend, PersistenceError, PersistenceHandler, RedisBackend,
    StorageBackend,
};

//! gitward core library.
//!
//! This crate provides the safety layer gitward puts around mutating git
//! commands: change classification, shelving and restoring Background
//! content, durable conflict sessions with per-hunk resolution, and
//! content-similarity rename matching.

pub mod classifier;
pub mod config;
pub mod conflict;
pub mod engine;
pub mod errors;
pub mod executor;
pub mod git;
pub mod rename;
pub mod snapshot;
pub mod state;

// Re-exports for convenience.
pub use classifier::{ChangeClass, ClassificationRule, Classifier};
pub use config::GitwardConfig;
pub use conflict::{ConflictSession, Disposition, SessionStatus};
pub use engine::{AbortOutcome, ClassifiedEntry, Engine, FinalizeOutcome};
pub use errors::CoreError;
pub use executor::{OperationResult, RestoreOutcome};
pub use git::{GitCommand, OperationKind};
pub use rename::{RenameCandidate, RenamePair};
pub use snapshot::Snapshot;
pub use state::StatePaths;

// src/core/ha/error.rs

//! The error type shared by every component of the HA supervisor.

use thiserror::Error;

/// Errors surfaced by the coordination client, database adapter, and
/// decision engine. Everything except `Fatal` is recovered within the tick
/// that produced it; `Fatal` aborts the process.
#[derive(Debug, Error, Clone)]
pub enum HaError {
    /// The coordination store is unreachable or returned a malformed response.
    #[error("coordination store unavailable: {0}")]
    StoreUnavailable(String),

    /// The local database process is not running or not accepting connections.
    #[error("database is not running or not accepting connections")]
    DatabaseUnavailable,

    /// `race("/initialize", ...)` lost; expected during a concurrent bootstrap.
    /// `CoordinationClient::race` itself reports this as a `bool`, so callers
    /// observe the condition directly rather than constructing this variant;
    /// it documents the contended case named in the error taxonomy.
    #[error("lost the initialization race to another node")]
    InitializeContended,

    /// A compare-and-set on the leader key failed; expected under contention.
    /// Likewise surfaced as a `bool` by `attempt_to_acquire_leader`/
    /// `update_leader` rather than as an `Err` of this variant.
    #[error("lost the leader lease compare-and-set")]
    LeaseContended,

    /// Streaming base-copy provisioning did not produce a usable data directory.
    #[error("basecopy from leader failed: {0}")]
    BasecopyFailed(String),

    /// Archive-based restore did not produce a usable data directory.
    #[error("archive restore failed: {0}")]
    ArchiveRestoreFailed(String),

    /// A configuration invariant was violated, or a child process failed
    /// unrecoverably. The supervisor must not continue running.
    #[error("fatal HA supervisor error: {0}")]
    Fatal(String),
}

//! Core types and error definitions for the support case memory.
//!
//! This crate holds the record model shared by the store, the similarity
//! indexes and the query layer in `scp-memory`.
//!
//! # Main types
//!
//! - [`ScpError`] — Unified error enum for store, index and encoder failures.
//! - [`ScpResult`] — Convenience alias for `Result<T, ScpError>`.
//! - [`Case`] — A support incident record, keyed by `case_id`.
//! - [`CaseUpdate`] — Partial update; scalar fields overwrite, lists append.
//! - [`CaseDraft`] — Parser output with fallbacks for missing id and title.
//! - [`CaseQuery`] / [`CaseFilter`] — Free text plus structured predicates.
//! - [`SearchResult`] — A ranked hit with its similarity score.

/// Case records and their parts.
pub mod case;
/// Error types.
pub mod error;
/// Query, filter and result types.
pub mod query;

pub use case::{
    synthesize_case_id, Case, CaseDraft, CaseMetrics, CaseTag, CaseUpdate, LogEntry, Priority,
    Status, UNTITLED_CASE,
};
pub use error::{ScpError, ScpResult};
pub use query::{CaseFilter, CaseQuery, SearchResult, DEFAULT_LIMIT, MAX_LIMIT};

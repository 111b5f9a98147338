//! Case memory with hybrid structured and similarity search.
//!
//! Holds support cases in a thread-safe store, projects them into a
//! similarity index and answers queries that combine structured filters with
//! free-text ranking.
//!
//! # Main types
//!
//! - [`QueryOrchestrator`] — Single entry point: mutations, search, similar cases, persistence.
//! - [`CaseStore`] — Authoritative case map with filters, stats and snapshots.
//! - [`SimilarityIndex`] — Trait for similarity backends.
//! - [`EmbeddingIndex`] — Exact inner-product search over encoder vectors.
//! - [`LexicalIndex`] — Jaccard token overlap, no encoder needed.
//! - [`EmbeddingProvider`] — Trait for text encoders; [`LocalEmbedding`] is the hash fallback.
//! - [`MemoryConfig`] — TOML-loadable settings.

/// TOML configuration.
pub mod config;
/// Encoder trait and implementations.
pub mod embedding;
/// Similarity backends.
pub mod index;
/// Query orchestration over store and index.
pub mod orchestrator;
/// Encoder selection by name.
pub mod registry;
/// The authoritative case store.
pub mod store;

pub use config::{ConsistencyPolicy, MemoryConfig, SearchConfig};
#[cfg(feature = "fastembed")]
pub use embedding::FastEmbedder;
pub use embedding::{EmbeddingProvider, LocalEmbedding};
pub use index::{
    BackendKind, EmbeddingIndex, IndexHit, IndexLoad, IndexStats, LexicalIndex, SimilarityIndex,
};
pub use orchestrator::{CaseContext, ContextSummary, MemoryStats, QueryOrchestrator, SimilarCase};
pub use store::{CaseSnapshot, CaseStore, ImportReport, RawSnapshot, StoreStats, TagCount};

use async_trait::async_trait;
use scp_core::{Case, ScpResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Exact inner-product index over case embeddings.
pub mod embedding;
/// Token-overlap index used when no encoder is available.
pub mod lexical;

pub use embedding::EmbeddingIndex;
pub use lexical::LexicalIndex;

/// Text indexed for a case whose searchable text is blank.
pub const EMPTY_CASE_TEXT: &str = "empty case";

/// Minimum `k` for a global search that is later intersected with filters.
pub const GLOBAL_SEARCH_FLOOR: usize = 100;

/// Which similarity backend serves queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Dense vectors from an encoder.
    #[default]
    Embedding,
    /// Jaccard overlap of word sets.
    Lexical,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Embedding => f.write_str("embedding"),
            BackendKind::Lexical => f.write_str("lexical"),
        }
    }
}

/// One ranked case id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexHit {
    /// Case identifier.
    pub case_id: String,
    /// Similarity in `[0, 1]`.
    pub score: f32,
}

/// Outcome of loading persisted index artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexLoad {
    /// Artifacts read; `count` distinct cases indexed.
    Loaded {
        /// Distinct cases restored.
        count: usize,
    },
    /// Nothing persisted, or the backend does not persist.
    Absent,
    /// Artifacts belong to another encoder. The index was left empty.
    ModelMismatch {
        /// Identity found on disk.
        stored: String,
        /// Identity of the live encoder.
        current: String,
    },
}

/// Snapshot of index health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexStats {
    /// Backend kind.
    pub backend: BackendKind,
    /// Encoder identity, for embedding indexes.
    pub model_id: Option<String>,
    /// Vector dimension, for embedding indexes.
    pub dimension: Option<usize>,
    /// Distinct case ids indexed.
    pub indexed_cases: usize,
    /// Physical rows, including superseded ones awaiting rebuild.
    pub rows: usize,
    /// Whether the index holds rows the store no longer agrees with.
    pub needs_rebuild: bool,
}

/// A similarity backend over case text.
///
/// Scores are in `[0, 1]`, higher is closer, and results come back in
/// non-increasing score order with at most `k` entries. Implementations may be
/// append-only, in which case `remove` and `update` are logical and
/// [`SimilarityIndex::needs_rebuild`] reports when a rebuild would drop stale rows.
#[async_trait]
pub trait SimilarityIndex: Send + Sync {
    /// Backend kind.
    fn kind(&self) -> BackendKind;

    /// Indexes a case.
    async fn add(&self, case: &Case) -> ScpResult<()>;

    /// Withdraws a case. Returns whether the id was indexed.
    async fn remove(&self, case_id: &str) -> ScpResult<bool>;

    /// Re-indexes a changed case.
    async fn update(&self, case: &Case) -> ScpResult<()>;

    /// Top `k` cases for free text, keeping scores `>= threshold`.
    async fn search(&self, query: &str, k: usize, threshold: f32) -> ScpResult<Vec<IndexHit>>;

    /// Top `k` neighbours of a case, never including the case itself.
    async fn find_similar(&self, case: &Case, k: usize, threshold: f32)
        -> ScpResult<Vec<IndexHit>>;

    /// Scores for a pre-filtered candidate set. Candidates missing from the
    /// result score zero.
    ///
    /// The default runs one global search large enough to cover the candidates.
    async fn rank_candidates(&self, query: &str, candidates: &[Case]) -> ScpResult<Vec<IndexHit>> {
        let k = candidates.len().max(GLOBAL_SEARCH_FLOOR);
        self.search(query, k, 0.0).await
    }

    /// Replaces the whole index with the given cases.
    async fn rebuild(&self, cases: &[Case]) -> ScpResult<()>;

    /// Writes artifacts under `dir`.
    async fn persist(&self, dir: &Path) -> ScpResult<()>;

    /// Reads artifacts from `dir`.
    async fn load(&self, dir: &Path) -> ScpResult<IndexLoad>;

    /// Whether stale rows are waiting for a rebuild.
    fn needs_rebuild(&self) -> bool;

    /// Distinct case ids indexed.
    fn len(&self) -> usize;

    /// Whether nothing is indexed.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Health snapshot.
    fn stats(&self) -> IndexStats;
}

/// The text a case is indexed under.
pub fn index_text(case: &Case) -> String {
    let text = case.text_content();
    if text.trim().is_empty() {
        EMPTY_CASE_TEXT.to_string()
    } else {
        text
    }
}

/// Orders hits by score descending, then id ascending.
pub fn sort_hits(hits: &mut [IndexHit]) {
    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.case_id.cmp(&b.case_id))
    });
}

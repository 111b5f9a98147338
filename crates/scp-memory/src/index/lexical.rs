use super::{index_text, sort_hits, BackendKind, IndexHit, IndexLoad, IndexStats, SimilarityIndex};
use async_trait::async_trait;
use parking_lot::RwLock;
use scp_core::{Case, ScpResult};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Jaccard similarity over lower-cased whitespace tokens.
///
/// Keeps one token set per case, so add, update and remove are exact and the
/// index is never stale. Nothing is persisted; the store rebuilds it on open.
pub struct LexicalIndex {
    tokens: RwLock<HashMap<String, HashSet<String>>>,
}

impl LexicalIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self {
            tokens: RwLock::new(HashMap::new()),
        }
    }

    fn score_all(&self, query: &HashSet<String>) -> Vec<IndexHit> {
        self.tokens
            .read()
            .iter()
            .map(|(id, words)| IndexHit {
                case_id: id.clone(),
                score: jaccard(query, words),
            })
            .collect()
    }
}

impl Default for LexicalIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// Lower-cased whitespace-separated words of `text`.
pub fn tokenize(text: &str) -> HashSet<String> {
    text.split_whitespace().map(str::to_lowercase).collect()
}

/// `|a ∩ b| / |a ∪ b|`, zero when both are empty.
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    if union == 0 {
        0.0
    } else {
        intersection as f32 / union as f32
    }
}

fn top_k(mut hits: Vec<IndexHit>, k: usize, threshold: f32) -> Vec<IndexHit> {
    hits.retain(|h| h.score >= threshold);
    sort_hits(&mut hits);
    hits.truncate(k);
    hits
}

#[async_trait]
impl SimilarityIndex for LexicalIndex {
    fn kind(&self) -> BackendKind {
        BackendKind::Lexical
    }

    async fn add(&self, case: &Case) -> ScpResult<()> {
        let words = tokenize(&index_text(case));
        self.tokens.write().insert(case.case_id.clone(), words);
        Ok(())
    }

    async fn remove(&self, case_id: &str) -> ScpResult<bool> {
        Ok(self.tokens.write().remove(case_id).is_some())
    }

    async fn update(&self, case: &Case) -> ScpResult<()> {
        self.add(case).await
    }

    async fn search(&self, query: &str, k: usize, threshold: f32) -> ScpResult<Vec<IndexHit>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        Ok(top_k(self.score_all(&tokenize(query)), k, threshold))
    }

    async fn find_similar(
        &self,
        case: &Case,
        k: usize,
        threshold: f32,
    ) -> ScpResult<Vec<IndexHit>> {
        let mut hits = self
            .search(&index_text(case), k.saturating_add(1), threshold)
            .await?;
        hits.retain(|h| h.case_id != case.case_id);
        hits.truncate(k);
        Ok(hits)
    }

    async fn rank_candidates(&self, query: &str, candidates: &[Case]) -> ScpResult<Vec<IndexHit>> {
        let query = tokenize(query);
        let mut hits: Vec<IndexHit> = candidates
            .iter()
            .map(|c| IndexHit {
                case_id: c.case_id.clone(),
                score: jaccard(&query, &tokenize(&index_text(c))),
            })
            .collect();
        sort_hits(&mut hits);
        Ok(hits)
    }

    async fn rebuild(&self, cases: &[Case]) -> ScpResult<()> {
        let fresh: HashMap<String, HashSet<String>> = cases
            .iter()
            .map(|c| (c.case_id.clone(), tokenize(&index_text(c))))
            .collect();
        *self.tokens.write() = fresh;
        Ok(())
    }

    async fn persist(&self, _dir: &Path) -> ScpResult<()> {
        Ok(())
    }

    async fn load(&self, _dir: &Path) -> ScpResult<IndexLoad> {
        Ok(IndexLoad::Absent)
    }

    fn needs_rebuild(&self) -> bool {
        false
    }

    fn len(&self) -> usize {
        self.tokens.read().len()
    }

    fn stats(&self) -> IndexStats {
        let indexed = self.len();
        IndexStats {
            backend: BackendKind::Lexical,
            model_id: None,
            dimension: None,
            indexed_cases: indexed,
            rows: indexed,
            needs_rebuild: false,
        }
    }
}

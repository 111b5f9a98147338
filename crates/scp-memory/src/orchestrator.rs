use crate::config::{ConsistencyPolicy, MemoryConfig};
use crate::index::{
    BackendKind, EmbeddingIndex, IndexLoad, IndexStats, LexicalIndex, SimilarityIndex,
};
use crate::registry;
use crate::store::{CaseStore, ImportReport, StoreStats};
use chrono::Utc;
use scp_core::{
    Case, CaseDraft, CaseFilter, CaseQuery, CaseTag, CaseUpdate, LogEntry, ScpError, ScpResult,
    SearchResult, Status,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Neighbours included in a [`CaseContext`].
const CONTEXT_SIMILAR: usize = 3;

/// Tag source recorded by [`QueryOrchestrator::bulk_update_tags`].
pub const BULK_TAG_SOURCE: &str = "bulk_update";

/// Short description of a neighbouring case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarCase {
    /// Case id.
    pub case_id: String,
    /// Title.
    pub title: String,
    /// Status.
    pub status: Status,
    /// Similarity to the anchor case.
    pub similarity_score: f32,
    /// Applied solution, if any.
    pub solution: Option<String>,
}

/// Counters describing a case at a glance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSummary {
    /// Attached log lines.
    pub total_logs: usize,
    /// Attached tags.
    pub tag_count: usize,
    /// Linked related cases.
    pub related_cases: usize,
    /// Whole days since creation.
    pub days_open: i64,
}

/// A case plus its nearest neighbours, shaped for prompt injection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseContext {
    /// The anchor case.
    pub case: Case,
    /// Up to three similar cases.
    pub similar_cases: Vec<SimilarCase>,
    /// Counters.
    pub summary: ContextSummary,
}

/// Combined store and index statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    /// Backend serving queries.
    pub backend: BackendKind,
    /// Store aggregates.
    pub store: StoreStats,
    /// Index health.
    pub index: IndexStats,
}

/// Single entry point for case storage and retrieval.
///
/// Owns the authoritative [`CaseStore`] and one [`SimilarityIndex`] projection
/// of it. Every mutation touching both runs under one async write gate, so an
/// index rebuild never interleaves with a concurrent add. Reads do not take
/// the gate.
pub struct QueryOrchestrator {
    config: MemoryConfig,
    store: CaseStore,
    index: Arc<dyn SimilarityIndex>,
    write_gate: Mutex<()>,
}

impl QueryOrchestrator {
    /// Creates an empty in-memory orchestrator with the configured backend.
    ///
    /// If the embedding encoder cannot be loaded the orchestrator degrades to
    /// the lexical backend and logs a warning; check [`Self::active_backend`].
    pub fn new(config: MemoryConfig) -> ScpResult<Self> {
        config.validate()?;
        let index = build_index(&config)?;
        Ok(Self::assemble(config, index))
    }

    /// Creates an orchestrator around a caller-supplied index.
    pub fn with_index(config: MemoryConfig, index: Arc<dyn SimilarityIndex>) -> ScpResult<Self> {
        config.validate()?;
        Ok(Self::assemble(config, index))
    }

    /// Opens the memory persisted under `config.data_dir`.
    ///
    /// An unreadable case snapshot is logged and skipped. The index is loaded
    /// from its artifacts and rebuilt when they are missing, belong to another
    /// encoder, or disagree with the store on the number of cases.
    pub async fn open(config: MemoryConfig) -> ScpResult<Self> {
        let orchestrator = Self::new(config)?;
        orchestrator.restore_from_disk().await?;
        Ok(orchestrator)
    }

    /// Like [`Self::open`] but with a caller-supplied index.
    pub async fn open_with_index(
        config: MemoryConfig,
        index: Arc<dyn SimilarityIndex>,
    ) -> ScpResult<Self> {
        let orchestrator = Self::with_index(config, index)?;
        orchestrator.restore_from_disk().await?;
        Ok(orchestrator)
    }

    fn assemble(config: MemoryConfig, index: Arc<dyn SimilarityIndex>) -> Self {
        info!(backend = %index.kind(), data_dir = %config.data_dir.display(), "Case memory ready");
        Self {
            config,
            store: CaseStore::new(),
            index,
            write_gate: Mutex::new(()),
        }
    }

    async fn restore_from_disk(&self) -> ScpResult<()> {
        let _gate = self.write_gate.lock().await;

        let cases_path = self.config.cases_path();
        match self.store.load_from(&cases_path).await {
            Ok(_) => {}
            Err(ScpError::Serialization(e)) => {
                warn!(path = %cases_path.display(), error = %e, "Case snapshot unreadable, starting empty");
            }
            Err(e) => return Err(e),
        }

        let outcome = match self.index.load(&self.config.index_dir()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "Index artifacts unreadable, rebuilding");
                IndexLoad::Absent
            }
        };
        if let IndexLoad::ModelMismatch { stored, current } = &outcome {
            let mismatch = ScpError::IndexModelMismatch {
                stored: stored.clone(),
                current: current.clone(),
            };
            warn!(error = %mismatch, "Persisted index discarded");
        }
        let in_sync = matches!(outcome, IndexLoad::Loaded { count } if count == self.store.len());
        if !in_sync || self.index.needs_rebuild() {
            debug!(?outcome, cases = self.store.len(), "Rebuilding index on open");
            self.index.rebuild(&self.store.list_all()).await?;
        }
        Ok(())
    }

    /// The configuration in use.
    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Backend actually serving queries, after any fallback.
    pub fn active_backend(&self) -> BackendKind {
        self.index.kind()
    }

    /// Number of stored cases.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Whether no case is stored.
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Every stored case, oldest first.
    pub fn list_cases(&self) -> Vec<Case> {
        self.store.list_all()
    }

    /// Cases matching the structured predicates, without text ranking.
    pub fn filter_cases(&self, filter: &CaseFilter) -> Vec<Case> {
        self.store.filter(filter)
    }

    // --- Mutations ---

    /// Stores a case and indexes it. Returns the stored copy.
    ///
    /// If indexing fails the case stays stored and the error is returned;
    /// [`Self::rebuild_index`] reconciles the index.
    pub async fn add_case(&self, case: Case) -> ScpResult<Case> {
        case.validate()?;
        let _gate = self.write_gate.lock().await;
        let existed = self.store.contains(&case.case_id);
        let stored = self.store.upsert(case);
        if existed {
            self.index.update(&stored).await?;
        } else {
            self.index.add(&stored).await?;
        }
        self.settle().await?;
        debug!(case_id = %stored.case_id, "Case stored");
        Ok(stored)
    }

    /// Converts a parser draft, applying id and title fallbacks, and stores it.
    pub async fn add_draft(&self, draft: CaseDraft) -> ScpResult<Case> {
        self.add_case(draft.into_case()?).await
    }

    /// Applies a partial update. `None` when the case does not exist.
    pub async fn update_case(&self, case_id: &str, update: CaseUpdate) -> ScpResult<Option<Case>> {
        self.mutate(case_id, |case| case.apply_update(update)).await
    }

    /// Appends log lines to a case. Returns whether the case exists.
    pub async fn append_logs(&self, case_id: &str, logs: Vec<LogEntry>) -> ScpResult<bool> {
        let updated = self
            .mutate(case_id, |case| case.logs.extend(logs))
            .await?;
        Ok(updated.is_some())
    }

    /// Adds or replaces a tag on a case.
    pub async fn add_tag(&self, case_id: &str, tag: CaseTag) -> ScpResult<Option<Case>> {
        self.mutate(case_id, |case| case.add_tag(tag)).await
    }

    /// Removes a case from the store and the index. Returns whether it existed.
    pub async fn delete_case(&self, case_id: &str) -> ScpResult<bool> {
        let _gate = self.write_gate.lock().await;
        if !self.store.delete(case_id) {
            return Ok(false);
        }
        self.index.remove(case_id).await?;
        self.settle().await?;
        debug!(case_id = %case_id, "Case deleted");
        Ok(true)
    }

    /// Adds tags by name to many cases, rebuilding at most once at the end.
    /// Unknown ids are skipped. Returns the number of cases updated.
    pub async fn bulk_update_tags(&self, mappings: HashMap<String, Vec<String>>) -> ScpResult<usize> {
        let _gate = self.write_gate.lock().await;
        let mut ids: Vec<&String> = mappings.keys().collect();
        ids.sort();

        let mut updated = 0;
        for case_id in ids {
            let names = &mappings[case_id];
            let changed = self.store.update_with(case_id, |case| {
                for name in names {
                    case.add_tag(CaseTag {
                        name: name.clone(),
                        confidence: 1.0,
                        source: BULK_TAG_SOURCE.to_string(),
                    });
                }
            });
            if let Some(case) = changed {
                self.index.update(&case).await?;
                updated += 1;
            }
        }
        self.settle().await?;
        info!(updated, "Bulk tag update applied");
        Ok(updated)
    }

    async fn mutate<F>(&self, case_id: &str, mutate: F) -> ScpResult<Option<Case>>
    where
        F: FnOnce(&mut Case) + Send,
    {
        let _gate = self.write_gate.lock().await;
        let Some(updated) = self.store.update_with(case_id, mutate) else {
            return Ok(None);
        };
        self.index.update(&updated).await?;
        self.settle().await?;
        Ok(Some(updated))
    }

    /// Rebuilds a stale index when the policy is eager. Callers hold the gate.
    async fn settle(&self) -> ScpResult<()> {
        if self.config.search.consistency == ConsistencyPolicy::Eager && self.index.needs_rebuild() {
            self.index.rebuild(&self.store.list_all()).await?;
        }
        Ok(())
    }

    /// Rebuilds the index from the store.
    pub async fn rebuild_index(&self) -> ScpResult<()> {
        let _gate = self.write_gate.lock().await;
        self.index.rebuild(&self.store.list_all()).await
    }

    // --- Reads ---

    /// Returns a case by id.
    pub fn get_case(&self, case_id: &str) -> Option<Case> {
        self.store.get(case_id)
    }

    /// Every stored id, sorted.
    pub fn case_ids(&self) -> Vec<String> {
        self.store.case_ids()
    }

    /// Filters, ranks and truncates.
    ///
    /// Structured predicates narrow the store first. Free text is then scored
    /// by the active backend; candidates the index did not return score zero.
    /// On the lexical backend a zero-score candidate survives only if its text
    /// contains the query. Without free text every candidate scores 1.0 and
    /// keeps filter order.
    pub async fn search(&self, query: &CaseQuery) -> ScpResult<Vec<SearchResult>> {
        let limit = query.effective_limit(
            self.config.search.default_limit,
            self.config.search.max_limit,
        );
        let candidates = self.store.filter(&query.filter);

        let Some(text) = query.query_text() else {
            return Ok(candidates
                .into_iter()
                .take(limit)
                .map(|case| SearchResult {
                    case,
                    similarity_score: 1.0,
                    matched_fields: Vec::new(),
                })
                .collect());
        };
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let scores: HashMap<String, f32> = self
            .index
            .rank_candidates(text, &candidates)
            .await?
            .into_iter()
            .map(|hit| (hit.case_id, hit.score))
            .collect();
        let score_of = |case: &Case| scores.get(&case.case_id).copied().unwrap_or(0.0);

        let candidates = if self.index.kind() == BackendKind::Lexical {
            let (mut kept, unscored): (Vec<Case>, Vec<Case>) =
                candidates.into_iter().partition(|c| score_of(c) > 0.0);
            kept.extend(CaseStore::text_contains(text, unscored));
            kept
        } else {
            candidates
        };

        let mut results: Vec<SearchResult> = candidates
            .into_iter()
            .map(|case| SearchResult {
                similarity_score: score_of(&case),
                matched_fields: case.matched_fields(text),
                case,
            })
            .collect();
        results.sort_by(|a, b| b.similarity_score.total_cmp(&a.similarity_score));
        results.truncate(limit);
        Ok(results)
    }

    /// Nearest neighbours of a stored case, never including the case itself.
    ///
    /// `limit` and `threshold` default to the configured values. Unknown ids
    /// yield an empty list. Ids the index still holds but the store no longer
    /// has are dropped.
    pub async fn find_similar(
        &self,
        case_id: &str,
        limit: Option<usize>,
        threshold: Option<f32>,
    ) -> ScpResult<Vec<SearchResult>> {
        let Some(case) = self.store.get(case_id) else {
            return Ok(Vec::new());
        };
        let limit = limit
            .unwrap_or(self.config.search.similar_limit)
            .clamp(1, self.config.search.max_limit);
        let threshold = threshold.unwrap_or(self.config.search.similar_threshold);
        let slack = self.index.len().saturating_sub(self.store.len());

        let hits = self
            .index
            .find_similar(&case, limit + slack, threshold)
            .await?;
        Ok(hits
            .into_iter()
            .filter(|hit| hit.case_id != case_id)
            .filter_map(|hit| {
                self.store.get(&hit.case_id).map(|case| SearchResult {
                    case,
                    similarity_score: hit.score,
                    matched_fields: Vec::new(),
                })
            })
            .take(limit)
            .collect())
    }

    /// The case with its three nearest neighbours and summary counters.
    pub async fn case_context(&self, case_id: &str) -> ScpResult<Option<CaseContext>> {
        let Some(case) = self.store.get(case_id) else {
            return Ok(None);
        };
        let similar_cases = self
            .find_similar(case_id, Some(CONTEXT_SIMILAR), None)
            .await?
            .into_iter()
            .map(|r| SimilarCase {
                case_id: r.case.case_id,
                title: r.case.title,
                status: r.case.status,
                similarity_score: r.similarity_score,
                solution: r.case.solution,
            })
            .collect();
        let summary = ContextSummary {
            total_logs: case.logs.len(),
            tag_count: case.tags.len(),
            related_cases: case.related_cases.len(),
            days_open: case.days_open(Utc::now()),
        };
        Ok(Some(CaseContext {
            case,
            similar_cases,
            summary,
        }))
    }

    /// Store aggregates and index health.
    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            backend: self.index.kind(),
            store: self.store.stats(),
            index: self.index.stats(),
        }
    }

    // --- Persistence ---

    /// Snapshot of every case as pretty JSON.
    pub fn export_json(&self) -> ScpResult<String> {
        self.store.export_json()
    }

    /// Drops every case and empties the index. Returns how many were removed.
    pub async fn clear_all(&self) -> ScpResult<usize> {
        let _gate = self.write_gate.lock().await;
        let removed = self.store.len();
        self.store.clear();
        self.index.rebuild(&[]).await?;
        info!(removed, "Case memory cleared");
        Ok(removed)
    }

    /// Restores a snapshot document, then rebuilds the index once.
    pub async fn import_json(&self, raw: &str) -> ScpResult<ImportReport> {
        let _gate = self.write_gate.lock().await;
        let report = self.store.import_json(raw)?;
        self.index.rebuild(&self.store.list_all()).await?;
        info!(imported = report.imported, skipped = report.skipped, "Imported cases");
        Ok(report)
    }

    /// Writes the case snapshot and the index artifacts under `data_dir`.
    ///
    /// The two writes are not atomic together; a crash between them is
    /// repaired by the rebuild check in [`Self::open`].
    pub async fn save_all(&self) -> ScpResult<()> {
        let _gate = self.write_gate.lock().await;
        self.store.save_to(&self.config.cases_path()).await?;
        self.index.persist(&self.config.index_dir()).await
    }

    /// Writes a snapshot to `<data_dir>/backups/<name>.json`. The name
    /// defaults to `backup_<YYYYmmdd_HHMMSS>`.
    pub async fn backup(&self, name: Option<&str>) -> ScpResult<PathBuf> {
        let name = match name {
            Some(n) if n.is_empty() || n.contains(['/', '\\']) || n.starts_with('.') => {
                return Err(ScpError::MalformedInput(format!(
                    "invalid backup name '{n}'"
                )));
            }
            Some(n) => n.to_string(),
            None => format!("backup_{}", Utc::now().format("%Y%m%d_%H%M%S")),
        };
        let path = self.config.backup_dir().join(format!("{name}.json"));
        self.store.save_to(&path).await?;
        info!(path = %path.display(), "Backup written");
        Ok(path)
    }
}

fn build_index(config: &MemoryConfig) -> ScpResult<Arc<dyn SimilarityIndex>> {
    match config.search.backend {
        BackendKind::Lexical => Ok(Arc::new(LexicalIndex::new())),
        BackendKind::Embedding => {
            match registry::load_encoder(&config.search.embedding_model, &config.model_cache_dir()) {
                Ok(encoder) => Ok(Arc::new(EmbeddingIndex::new(encoder))),
                Err(ScpError::BackendUnavailable(reason)) => {
                    let compiled: Vec<&str> =
                        registry::available().iter().map(|e| e.name).collect();
                    warn!(
                        model = %config.search.embedding_model,
                        reason = %reason,
                        available = ?compiled,
                        "Embedding backend unavailable, falling back to lexical search"
                    );
                    Ok(Arc::new(LexicalIndex::new()))
                }
                Err(e) => Err(e),
            }
        }
    }
}

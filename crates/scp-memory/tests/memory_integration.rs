#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Integration tests for the scp-memory crate.
//!
//! Covers on-disk persistence and reopen, encoder mismatch recovery, corrupt
//! artifacts, TOML configuration, snapshot import with bad records, and
//! concurrent writers racing a rebuild.

use std::sync::Arc;

use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

use scp_core::{Case, CaseQuery, CaseUpdate, SearchResult, Status};
use scp_memory::index::embedding::{METADATA_FILE, VECTOR_FILE};
use scp_memory::{
    BackendKind, ConsistencyPolicy, EmbeddingIndex, LocalEmbedding, MemoryConfig,
    QueryOrchestrator, SimilarityIndex,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn hash_config(dir: &TempDir) -> MemoryConfig {
    MemoryConfig::in_dir(dir.path()).with_embedding_model("hash")
}

fn ids(results: &[SearchResult]) -> Vec<String> {
    results.iter().map(|r| r.case.case_id.clone()).collect()
}

async fn seed(o: &QueryOrchestrator) {
    for (id, title) in [
        ("A", "database timeout"),
        ("B", "API 503 errors"),
        ("C", "database connection pool exhausted"),
    ] {
        o.add_case(Case::new(id, title)).await.unwrap();
    }
}

// ---------------------------------------------------------------------------
// 1. Save and reopen
// ---------------------------------------------------------------------------

#[tokio::test]
async fn save_and_reopen_embedding_memory() {
    init_tracing();
    let tmp = TempDir::new().unwrap();

    let first = QueryOrchestrator::open(hash_config(&tmp)).await.unwrap();
    assert_eq!(first.active_backend(), BackendKind::Embedding);
    seed(&first).await;
    first.save_all().await.unwrap();
    let before = first.search(&CaseQuery::text("database")).await.unwrap();

    assert!(tmp.path().join("cases.json").exists());
    assert!(tmp.path().join("index").join(VECTOR_FILE).exists());
    assert!(tmp.path().join("index").join(METADATA_FILE).exists());

    let reopened = QueryOrchestrator::open(hash_config(&tmp)).await.unwrap();
    assert_eq!(reopened.case_ids(), vec!["A", "B", "C"]);
    let stats = reopened.stats();
    assert_eq!(stats.index.indexed_cases, 3);
    assert!(!stats.index.needs_rebuild);

    let after = reopened.search(&CaseQuery::text("database")).await.unwrap();
    assert_eq!(ids(&before), ids(&after));
}

#[tokio::test]
async fn reopen_rebuilds_when_index_lags_store() {
    let tmp = TempDir::new().unwrap();
    let first = QueryOrchestrator::open(hash_config(&tmp)).await.unwrap();
    seed(&first).await;
    first.save_all().await.unwrap();

    // Snapshot saved again with a fourth case, older index artifacts put back.
    let index_dir = first.config().index_dir();
    let vectors = std::fs::read(index_dir.join(VECTOR_FILE)).unwrap();
    let metadata = std::fs::read(index_dir.join(METADATA_FILE)).unwrap();
    first.add_case(Case::new("D", "disk full")).await.unwrap();
    first.save_all().await.unwrap();
    std::fs::write(index_dir.join(VECTOR_FILE), vectors).unwrap();
    std::fs::write(index_dir.join(METADATA_FILE), metadata).unwrap();

    let reopened = QueryOrchestrator::open(hash_config(&tmp)).await.unwrap();
    assert_eq!(reopened.stats().index.indexed_cases, 4);
    let hits = reopened.search(&CaseQuery::text("disk full")).await.unwrap();
    assert_eq!(hits[0].case.case_id, "D");
}

// ---------------------------------------------------------------------------
// 2. Encoder mismatch and corrupt artifacts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reopen_with_other_encoder_rebuilds() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let first = QueryOrchestrator::open(hash_config(&tmp)).await.unwrap();
    seed(&first).await;
    first.save_all().await.unwrap();

    let index: Arc<dyn SimilarityIndex> =
        Arc::new(EmbeddingIndex::new(Arc::new(LocalEmbedding::new(128))));
    let reopened = QueryOrchestrator::open_with_index(hash_config(&tmp), index)
        .await
        .unwrap();
    let stats = reopened.stats();
    assert_eq!(stats.index.model_id.as_deref(), Some("fnv1a-128"));
    assert_eq!(stats.index.indexed_cases, 3);

    let hits = reopened
        .search(&CaseQuery::text("database timeout"))
        .await
        .unwrap();
    assert_eq!(hits[0].case.case_id, "A");
}

#[tokio::test]
async fn corrupt_snapshot_starts_empty() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    std::fs::write(tmp.path().join("cases.json"), "{ truncated").unwrap();

    let o = QueryOrchestrator::open(hash_config(&tmp)).await.unwrap();
    assert!(o.is_empty());
    o.add_case(Case::new("A", "fresh start")).await.unwrap();
    assert_eq!(o.case_ids(), vec!["A"]);
}

#[tokio::test]
async fn non_utf8_snapshot_starts_empty() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    std::fs::write(tmp.path().join("cases.json"), [0xff, 0xfe, b'{', 0x80]).unwrap();

    let config = MemoryConfig::in_dir(tmp.path()).with_backend(BackendKind::Lexical);
    let o = QueryOrchestrator::open(config).await.unwrap();
    assert!(o.is_empty());
    o.add_case(Case::new("A", "fresh start")).await.unwrap();
    o.save_all().await.unwrap();

    let reopened = QueryOrchestrator::open(
        MemoryConfig::in_dir(tmp.path()).with_backend(BackendKind::Lexical),
    )
    .await
    .unwrap();
    assert_eq!(reopened.case_ids(), vec!["A"]);
}

#[tokio::test]
async fn corrupt_vector_file_triggers_rebuild() {
    let tmp = TempDir::new().unwrap();
    let first = QueryOrchestrator::open(hash_config(&tmp)).await.unwrap();
    seed(&first).await;
    first.save_all().await.unwrap();

    std::fs::write(tmp.path().join("index").join(VECTOR_FILE), b"garbage").unwrap();
    let reopened = QueryOrchestrator::open(hash_config(&tmp)).await.unwrap();
    assert_eq!(reopened.stats().index.indexed_cases, 3);
}

// ---------------------------------------------------------------------------
// 3. Configuration from TOML
// ---------------------------------------------------------------------------

#[tokio::test]
async fn config_file_selects_lexical_backend() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("scp.toml");
    let data_dir = tmp.path().join("data");
    std::fs::write(
        &path,
        format!(
            "data_dir = {:?}\n\n[search]\nbackend = \"lexical\"\ndefault_limit = 2\n",
            data_dir.display().to_string()
        ),
    )
    .unwrap();

    let config = MemoryConfig::load(&path).await.unwrap();
    assert_eq!(config.data_dir, data_dir);
    let o = QueryOrchestrator::open(config).await.unwrap();
    assert_eq!(o.active_backend(), BackendKind::Lexical);

    for i in 0..5 {
        o.add_case(Case::new(format!("N-{i}"), "network flap"))
            .await
            .unwrap();
    }
    let hits = o.search(&CaseQuery::text("network")).await.unwrap();
    assert_eq!(hits.len(), 2);
}

// ---------------------------------------------------------------------------
// 4. Import with malformed records
// ---------------------------------------------------------------------------

#[tokio::test]
async fn import_skips_bad_records_and_indexes_good_ones() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let o = QueryOrchestrator::open(hash_config(&tmp)).await.unwrap();

    let raw = r#"{
        "export_timestamp": "2024-05-01T10:00:00Z",
        "total_cases": 3,
        "cases": [
            {"case_id": "I-1", "title": "certificate expired", "status": "resolved"},
            {"title": "no id"},
            {"case_id": "I-3", "title": "kernel panic on boot"}
        ]
    }"#;
    let report = o.import_json(raw).await.unwrap();
    assert_eq!(report.imported, 2);
    assert_eq!(report.skipped, 1);
    assert_eq!(o.stats().index.indexed_cases, 2);

    let hits = o
        .search(&CaseQuery::text("certificate expired").with_statuses([Status::Resolved]))
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].case.case_id, "I-1");

    let exported = o.export_json().unwrap();
    let other = QueryOrchestrator::new(MemoryConfig::default().with_backend(BackendKind::Lexical))
        .unwrap();
    assert_eq!(other.import_json(&exported).await.unwrap().imported, 2);
}

// ---------------------------------------------------------------------------
// 5. Concurrent writers
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_adds_and_rebuilds_stay_consistent() {
    let tmp = TempDir::new().unwrap();
    let o = Arc::new(
        QueryOrchestrator::open(hash_config(&tmp).with_consistency(ConsistencyPolicy::Eager))
            .await
            .unwrap(),
    );

    let mut handles = Vec::new();
    for worker in 0..4 {
        let o = Arc::clone(&o);
        handles.push(tokio::spawn(async move {
            for i in 0..25 {
                let id = format!("W{worker}-{i}");
                o.add_case(Case::new(id.clone(), format!("incident {worker} {i}")))
                    .await
                    .unwrap();
                if i % 10 == 0 {
                    o.rebuild_index().await.unwrap();
                }
                if i % 5 == 0 {
                    o.update_case(
                        &id,
                        CaseUpdate {
                            status: Some(Status::InProgress),
                            ..Default::default()
                        },
                    )
                    .await
                    .unwrap();
                }
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let stats = o.stats();
    assert_eq!(stats.store.total_cases, 100);
    assert_eq!(stats.index.indexed_cases, 100);
    assert!(!stats.index.needs_rebuild);
    assert_eq!(stats.store.cases_by_status[&Status::InProgress], 20);
}

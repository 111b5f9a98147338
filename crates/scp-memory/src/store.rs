use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use scp_core::{Case, CaseFilter, Priority, ScpResult, Status};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{info, warn};

/// How many tags [`StoreStats::top_tags`] reports.
const TOP_TAGS: usize = 10;

/// Serialized form of the whole store, as written by export and backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseSnapshot {
    /// When the snapshot was taken.
    pub export_timestamp: DateTime<Utc>,
    /// Number of cases in `cases`.
    pub total_cases: usize,
    /// Every stored case.
    pub cases: Vec<Case>,
}

/// A snapshot read back without trusting its records. Each entry of `cases` is
/// decoded and validated on its own so one bad record does not sink the rest.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawSnapshot {
    /// Export time, if recorded.
    #[serde(default)]
    pub export_timestamp: Option<DateTime<Utc>>,
    /// Declared case count, informational only.
    #[serde(default)]
    pub total_cases: Option<usize>,
    /// Undecoded case records.
    #[serde(default)]
    pub cases: Vec<serde_json::Value>,
}

/// Outcome of a batch restore.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportReport {
    /// Records stored.
    pub imported: usize,
    /// Records rejected as malformed.
    pub skipped: usize,
}

/// Occurrences of one tag name across the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagCount {
    /// Tag name.
    pub name: String,
    /// Number of cases carrying it.
    pub count: usize,
}

/// Aggregate view of the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Number of stored cases.
    pub total_cases: usize,
    /// Count per status, zeros included.
    pub cases_by_status: BTreeMap<Status, usize>,
    /// Count per priority, zeros included.
    pub cases_by_priority: BTreeMap<Priority, usize>,
    /// Mean `metrics.resolution_time_hours` over resolved cases, missing values
    /// counted as zero. `None` when nothing is resolved.
    pub avg_resolution_time_hours: Option<f64>,
    /// Most frequent tags, highest count first, ties by name.
    pub top_tags: Vec<TagCount>,
    /// Approximate footprint in MiB, from the serialized size.
    pub memory_usage_mb: f64,
}

/// Thread-safe map of cases keyed by `case_id`.
///
/// Every operation takes the single lock once, so each call is atomic on its
/// own. Nothing here spans several calls; [`CaseStore::update_with`] is the
/// only read-modify-write.
pub struct CaseStore {
    cases: Mutex<HashMap<String, Case>>,
}

impl CaseStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            cases: Mutex::new(HashMap::new()),
        }
    }

    /// Inserts or overwrites a case and stamps `updated_at`. Returns the stored copy.
    pub fn upsert(&self, mut case: Case) -> Case {
        case.updated_at = Utc::now();
        self.cases.lock().insert(case.case_id.clone(), case.clone());
        case
    }

    /// Returns a copy of the case, if stored.
    pub fn get(&self, case_id: &str) -> Option<Case> {
        self.cases.lock().get(case_id).cloned()
    }

    /// Whether a case with this id is stored.
    pub fn contains(&self, case_id: &str) -> bool {
        self.cases.lock().contains_key(case_id)
    }

    /// Removes a case. Returns whether it existed.
    pub fn delete(&self, case_id: &str) -> bool {
        self.cases.lock().remove(case_id).is_some()
    }

    /// Mutates a case in place under the lock and stamps `updated_at`.
    /// Returns the updated copy, or `None` when the id is unknown.
    pub fn update_with<F>(&self, case_id: &str, mutate: F) -> Option<Case>
    where
        F: FnOnce(&mut Case),
    {
        let mut cases = self.cases.lock();
        let case = cases.get_mut(case_id)?;
        mutate(case);
        case.updated_at = Utc::now();
        Some(case.clone())
    }

    /// Every case, ordered by creation time then id.
    pub fn list_all(&self) -> Vec<Case> {
        let mut all: Vec<Case> = self.cases.lock().values().cloned().collect();
        sort_cases(&mut all);
        all
    }

    /// Every stored id, sorted.
    pub fn case_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.cases.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of stored cases.
    pub fn len(&self) -> usize {
        self.cases.lock().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.cases.lock().is_empty()
    }

    /// Drops every case.
    pub fn clear(&self) {
        self.cases.lock().clear();
    }

    /// Cases satisfying every active predicate, in [`CaseStore::list_all`] order.
    pub fn filter(&self, filter: &CaseFilter) -> Vec<Case> {
        let mut matched: Vec<Case> = self
            .cases
            .lock()
            .values()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect();
        sort_cases(&mut matched);
        matched
    }

    /// Keeps the candidates whose searchable text contains `query`,
    /// case-insensitively. A blank query keeps everything.
    pub fn text_contains(query: &str, candidates: Vec<Case>) -> Vec<Case> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return candidates;
        }
        candidates
            .into_iter()
            .filter(|c| c.text_content().to_lowercase().contains(&needle))
            .collect()
    }

    /// Counts, averages and top tags over the current contents.
    pub fn stats(&self) -> StoreStats {
        let cases = self.cases.lock();

        let mut cases_by_status: BTreeMap<Status, usize> =
            Status::ALL.into_iter().map(|s| (s, 0)).collect();
        let mut cases_by_priority: BTreeMap<Priority, usize> =
            Priority::ALL.into_iter().map(|p| (p, 0)).collect();
        let mut tag_counts: HashMap<&str, usize> = HashMap::new();
        let mut resolved = 0usize;
        let mut resolution_hours = 0.0f64;

        for case in cases.values() {
            *cases_by_status.entry(case.status).or_insert(0) += 1;
            *cases_by_priority.entry(case.priority).or_insert(0) += 1;
            if case.status == Status::Resolved {
                resolved += 1;
                resolution_hours += case.metrics.resolution_time_hours.unwrap_or(0.0);
            }
            for tag in &case.tags {
                *tag_counts.entry(tag.name.as_str()).or_insert(0) += 1;
            }
        }

        let mut top_tags: Vec<TagCount> = tag_counts
            .into_iter()
            .map(|(name, count)| TagCount {
                name: name.to_string(),
                count,
            })
            .collect();
        top_tags.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
        top_tags.truncate(TOP_TAGS);

        let bytes: usize = cases
            .values()
            .map(|c| serde_json::to_vec(c).map_or(0, |v| v.len()))
            .sum();

        StoreStats {
            total_cases: cases.len(),
            cases_by_status,
            cases_by_priority,
            avg_resolution_time_hours: (resolved > 0)
                .then(|| resolution_hours / resolved as f64),
            top_tags,
            memory_usage_mb: bytes as f64 / (1024.0 * 1024.0),
        }
    }

    /// Point-in-time copy of every case.
    pub fn snapshot(&self) -> CaseSnapshot {
        let cases = self.list_all();
        CaseSnapshot {
            export_timestamp: Utc::now(),
            total_cases: cases.len(),
            cases,
        }
    }

    /// The snapshot as pretty-printed JSON.
    pub fn export_json(&self) -> ScpResult<String> {
        Ok(serde_json::to_string_pretty(&self.snapshot())?)
    }

    /// Upserts every valid record of a snapshot. Malformed records are logged
    /// and counted, never fatal.
    pub fn restore(&self, raw: RawSnapshot) -> ImportReport {
        let mut report = ImportReport::default();
        for value in raw.cases {
            let label = value
                .get("case_id")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            let decoded = serde_json::from_value::<Case>(value)
                .map_err(scp_core::ScpError::from)
                .and_then(|case| case.validate().map(|()| case));
            match decoded {
                Ok(case) => {
                    self.upsert(case);
                    report.imported += 1;
                }
                Err(e) => {
                    warn!(case_id = %label, error = %e, "Skipping malformed case record");
                    report.skipped += 1;
                }
            }
        }
        report
    }

    /// Parses a snapshot document and restores it. Fails only when the
    /// document itself is unreadable.
    pub fn import_json(&self, raw: &str) -> ScpResult<ImportReport> {
        let snapshot: RawSnapshot = serde_json::from_str(raw)?;
        Ok(self.restore(snapshot))
    }

    /// Writes the snapshot to `path` through a temp file and rename.
    pub async fn save_to(&self, path: &Path) -> ScpResult<()> {
        let json = self.export_json()?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json.as_bytes()).await?;
        tokio::fs::rename(&tmp, path).await?;
        info!(path = %path.display(), cases = self.len(), "Saved case snapshot");
        Ok(())
    }

    /// Restores from a snapshot file. Returns `None` when the file does not exist.
    ///
    /// Bytes that are not valid UTF-8 JSON surface as a serialization error.
    pub async fn load_from(&self, path: &Path) -> ScpResult<Option<ImportReport>> {
        if !tokio::fs::try_exists(path).await? {
            return Ok(None);
        }
        let bytes = tokio::fs::read(path).await?;
        let snapshot: RawSnapshot = serde_json::from_slice(&bytes)?;
        let report = self.restore(snapshot);
        info!(
            path = %path.display(),
            imported = report.imported,
            skipped = report.skipped,
            "Loaded case snapshot"
        );
        Ok(Some(report))
    }
}

impl Default for CaseStore {
    fn default() -> Self {
        Self::new()
    }
}

fn sort_cases(cases: &mut [Case]) {
    cases.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.case_id.cmp(&b.case_id))
    });
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use scp_core::CaseTag;

    fn case(id: &str, title: &str) -> Case {
        Case::new(id, title)
    }

    #[test]
    fn test_upsert_and_get() {
        let store = CaseStore::new();
        assert!(store.is_empty());

        let stored = store.upsert(case("C-1", "Database timeout"));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("C-1").unwrap(), stored);
        assert!(store.get("missing").is_none());
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let store = CaseStore::new();
        let c = case("C-1", "Database timeout");
        store.upsert(c.clone());
        let second = store.upsert(c);

        assert_eq!(store.len(), 1);
        assert_eq!(store.get("C-1").unwrap(), second);
    }

    #[test]
    fn test_upsert_stamps_updated_at() {
        let store = CaseStore::new();
        let mut c = case("C-1", "t");
        c.updated_at = Utc::now() - chrono::Duration::days(30);
        let stored = store.upsert(c.clone());
        assert!(stored.updated_at > c.updated_at);
    }

    #[test]
    fn test_delete() {
        let store = CaseStore::new();
        store.upsert(case("C-1", "t"));
        assert!(store.delete("C-1"));
        assert!(!store.delete("C-1"));
        assert!(store.get("C-1").is_none());
    }

    #[test]
    fn test_update_with() {
        let store = CaseStore::new();
        store.upsert(case("C-1", "t"));
        let updated = store
            .update_with("C-1", |c| c.notes.push("called customer".into()))
            .unwrap();
        assert_eq!(updated.notes, vec!["called customer"]);
        assert_eq!(store.get("C-1").unwrap().notes, vec!["called customer"]);
        assert!(store.update_with("C-2", |_| {}).is_none());
    }

    #[test]
    fn test_list_all_is_ordered() {
        let store = CaseStore::new();
        let base = Utc::now();
        let mut b = case("B", "t");
        b.created_at = base;
        let mut a = case("A", "t");
        a.created_at = base + chrono::Duration::seconds(5);
        let mut c = case("C", "t");
        c.created_at = base;
        store.upsert(a);
        store.upsert(b);
        store.upsert(c);

        let ids: Vec<String> = store.list_all().into_iter().map(|c| c.case_id).collect();
        assert_eq!(ids, vec!["B", "C", "A"]);
        assert_eq!(store.case_ids(), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_filter_conjunction() {
        let store = CaseStore::new();
        store.upsert(case("C-1", "a").with_status(Status::Open).with_tag("db"));
        store.upsert(
            case("C-2", "b")
                .with_status(Status::Open)
                .with_priority(Priority::Critical),
        );
        store.upsert(case("C-3", "c").with_status(Status::Closed).with_tag("db"));

        let open_db = store.filter(&CaseFilter {
            statuses: Some(vec![Status::Open]),
            tags_any: Some(vec!["db".into()]),
            ..Default::default()
        });
        assert_eq!(open_db.len(), 1);
        assert_eq!(open_db[0].case_id, "C-1");

        assert_eq!(store.filter(&CaseFilter::default()).len(), 3);
        let none = store.filter(&CaseFilter {
            case_ids: Some(vec!["C-9".into()]),
            ..Default::default()
        });
        assert!(none.is_empty());
    }

    #[test]
    fn test_text_contains() {
        let cases = vec![
            case("C-1", "Database Timeout"),
            case("C-2", "API 503 errors"),
        ];
        let hits = CaseStore::text_contains("database", cases.clone());
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].case_id, "C-1");
        assert_eq!(CaseStore::text_contains("  ", cases).len(), 2);
    }

    #[test]
    fn test_stats() {
        let store = CaseStore::new();
        let mut r1 = case("C-1", "a").with_status(Status::Resolved).with_tag("db");
        r1.metrics.resolution_time_hours = Some(4.0);
        let r2 = case("C-2", "b").with_status(Status::Resolved).with_tag("db");
        let open = case("C-3", "c").with_tag("net").with_priority(Priority::High);
        store.upsert(r1);
        store.upsert(r2);
        store.upsert(open);

        let stats = store.stats();
        assert_eq!(stats.total_cases, 3);
        assert_eq!(stats.cases_by_status.len(), Status::ALL.len());
        assert_eq!(stats.cases_by_status[&Status::Resolved], 2);
        assert_eq!(stats.cases_by_status[&Status::Closed], 0);
        assert_eq!(stats.cases_by_priority[&Priority::High], 1);
        assert_eq!(stats.avg_resolution_time_hours, Some(2.0));
        assert_eq!(stats.top_tags[0], TagCount { name: "db".into(), count: 2 });
        assert_eq!(stats.top_tags[1].name, "net");
        assert!(stats.memory_usage_mb > 0.0);

        assert_eq!(CaseStore::new().stats().avg_resolution_time_hours, None);
    }

    #[test]
    fn test_top_tags_capped() {
        let store = CaseStore::new();
        let mut c = case("C-1", "t");
        for i in 0..15 {
            c.add_tag(CaseTag::manual(format!("tag-{i:02}")));
        }
        store.upsert(c);
        let stats = store.stats();
        assert_eq!(stats.top_tags.len(), 10);
        assert_eq!(stats.top_tags[0].name, "tag-00");
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let store = CaseStore::new();
        store.upsert(case("C-1", "Database timeout").with_tag("db"));
        store.upsert(case("C-2", "API 503 errors"));
        let json = store.export_json().unwrap();

        let restored = CaseStore::new();
        let report = restored.import_json(&json).unwrap();
        assert_eq!(report, ImportReport { imported: 2, skipped: 0 });

        for original in store.list_all() {
            let mut back = restored.get(&original.case_id).unwrap();
            back.updated_at = original.updated_at;
            assert_eq!(back, original);
        }
    }

    #[test]
    fn test_restore_skips_malformed() {
        let store = CaseStore::new();
        let raw = r#"{
            "cases": [
                {"case_id": "C-1", "title": "good"},
                {"case_id": "C-2"},
                {"case_id": "", "title": "blank id"},
                {"case_id": "C-4", "title": "bad tag",
                 "tags": [{"name": "x", "confidence": 3.0, "source": "auto"}]},
                {"case_id": "C-5", "title": "bad status", "status": "paused"}
            ]
        }"#;
        let report = store.import_json(raw).unwrap();
        assert_eq!(report, ImportReport { imported: 1, skipped: 4 });
        assert!(store.contains("C-1"));
    }

    #[test]
    fn test_import_unreadable_document() {
        let store = CaseStore::new();
        assert!(store.import_json("not json").is_err());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("cases.json");

        let store = CaseStore::new();
        store.upsert(case("C-1", "Database timeout"));
        store.save_to(&path).await.unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());

        let loaded = CaseStore::new();
        let report = loaded.load_from(&path).await.unwrap().unwrap();
        assert_eq!(report.imported, 1);
        assert_eq!(loaded.get("C-1").unwrap().title, "Database timeout");

        let missing = CaseStore::new();
        assert!(missing
            .load_from(&tmp.path().join("absent.json"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_load_invalid_utf8_is_serialization_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("cases.json");
        tokio::fs::write(&path, [0xff, 0xfe, b'{', 0x80]).await.unwrap();

        let store = CaseStore::new();
        let err = store.load_from(&path).await.unwrap_err();
        assert!(matches!(err, scp_core::ScpError::Serialization(_)));
        assert!(store.is_empty());
    }
}

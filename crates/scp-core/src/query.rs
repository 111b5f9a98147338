use crate::case::{Case, Priority, Status};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Results returned when a query does not ask for a limit.
pub const DEFAULT_LIMIT: usize = 10;
/// Upper bound on results per query.
pub const MAX_LIMIT: usize = 100;

/// Structured predicates over stored cases.
///
/// Predicates of different kinds are ANDed; `tags_any` is an OR over tag
/// names. An empty list behaves like an absent one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaseFilter {
    /// Keep cases whose id is listed.
    pub case_ids: Option<Vec<String>>,
    /// Keep cases in any of these states.
    pub statuses: Option<Vec<Status>>,
    /// Keep cases with any of these priorities.
    pub priorities: Option<Vec<Priority>>,
    /// Inclusive lower bound on `created_at`.
    pub created_from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `created_at`.
    pub created_to: Option<DateTime<Utc>>,
    /// Keep cases carrying at least one of these tags.
    pub tags_any: Option<Vec<String>>,
}

impl CaseFilter {
    /// Whether the case satisfies every present predicate.
    pub fn matches(&self, case: &Case) -> bool {
        if let Some(ids) = active(&self.case_ids) {
            if !ids.iter().any(|id| *id == case.case_id) {
                return false;
            }
        }
        if let Some(statuses) = active(&self.statuses) {
            if !statuses.contains(&case.status) {
                return false;
            }
        }
        if let Some(priorities) = active(&self.priorities) {
            if !priorities.contains(&case.priority) {
                return false;
            }
        }
        if self.created_from.is_some_and(|from| case.created_at < from) {
            return false;
        }
        if self.created_to.is_some_and(|to| case.created_at > to) {
            return false;
        }
        if let Some(tags) = active(&self.tags_any) {
            if !tags.iter().any(|name| case.has_tag(name)) {
                return false;
            }
        }
        true
    }

    /// Whether no predicate is active.
    pub fn is_unrestricted(&self) -> bool {
        active(&self.case_ids).is_none()
            && active(&self.statuses).is_none()
            && active(&self.priorities).is_none()
            && active(&self.tags_any).is_none()
            && self.created_from.is_none()
            && self.created_to.is_none()
    }
}

fn active<T>(list: &Option<Vec<T>>) -> Option<&[T]> {
    list.as_deref().filter(|l| !l.is_empty())
}

/// A search request: optional free text plus structured filters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaseQuery {
    /// Free text to rank by. Blank text means "filter only".
    pub query: Option<String>,
    /// Maximum results, clamped to `1..=100`. Defaults to 10.
    pub limit: Option<usize>,
    /// Structured predicates.
    #[serde(flatten)]
    pub filter: CaseFilter,
}

impl CaseQuery {
    /// A free-text query with no filters.
    pub fn text(query: impl Into<String>) -> Self {
        Self {
            query: Some(query.into()),
            ..Default::default()
        }
    }

    /// A filter-only query.
    pub fn filtered(filter: CaseFilter) -> Self {
        Self {
            query: None,
            limit: None,
            filter,
        }
    }

    /// Sets the result limit.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Restricts to the given states.
    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = Status>) -> Self {
        self.filter.statuses = Some(statuses.into_iter().collect());
        self
    }

    /// Restricts to cases carrying any of the given tags.
    pub fn with_tags<S: Into<String>>(mut self, tags: impl IntoIterator<Item = S>) -> Self {
        self.filter.tags_any = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    /// The trimmed query text, if any is left.
    pub fn query_text(&self) -> Option<&str> {
        self.query.as_deref().map(str::trim).filter(|q| !q.is_empty())
    }

    /// The requested limit clamped to `1..=max_limit`.
    pub fn effective_limit(&self, default_limit: usize, max_limit: usize) -> usize {
        let max_limit = max_limit.max(1);
        self.limit.unwrap_or(default_limit).clamp(1, max_limit)
    }
}

/// One ranked hit returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    /// The matching case.
    pub case: Case,
    /// Similarity in `[0, 1]`, higher is closer.
    pub similarity_score: f32,
    /// Fields in which the query text occurs.
    pub matched_fields: Vec<String>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::case::CaseTag;

    #[test]
    fn test_filter_conjunction() {
        let mut case = Case::new("C-1", "t").with_status(Status::Open);
        case.add_tag(CaseTag::manual("network"));

        let filter = CaseFilter {
            statuses: Some(vec![Status::Open, Status::InProgress]),
            tags_any: Some(vec!["dns".into(), "network".into()]),
            ..Default::default()
        };
        assert!(filter.matches(&case));

        let filter = CaseFilter {
            statuses: Some(vec![Status::Open]),
            priorities: Some(vec![Priority::Critical]),
            ..Default::default()
        };
        assert!(!filter.matches(&case));
    }

    #[test]
    fn test_empty_lists_are_absent() {
        let case = Case::new("C-1", "t");
        let filter = CaseFilter {
            case_ids: Some(vec![]),
            statuses: Some(vec![]),
            tags_any: Some(vec![]),
            ..Default::default()
        };
        assert!(filter.matches(&case));
        assert!(filter.is_unrestricted());
        assert!(CaseFilter::default().is_unrestricted());
    }

    #[test]
    fn test_date_bounds_inclusive() {
        let case = Case::new("C-1", "t");
        let filter = CaseFilter {
            created_from: Some(case.created_at),
            created_to: Some(case.created_at),
            ..Default::default()
        };
        assert!(filter.matches(&case));

        let later = CaseFilter {
            created_from: Some(case.created_at + chrono::Duration::seconds(1)),
            ..Default::default()
        };
        assert!(!later.matches(&case));
    }

    #[test]
    fn test_query_text_and_limit() {
        assert_eq!(CaseQuery::text("  db  ").query_text(), Some("db"));
        assert_eq!(CaseQuery::text("   ").query_text(), None);

        let q = CaseQuery::default();
        assert_eq!(q.effective_limit(DEFAULT_LIMIT, MAX_LIMIT), 10);
        assert_eq!(q.clone().with_limit(0).effective_limit(10, 100), 1);
        assert_eq!(q.with_limit(500).effective_limit(10, 100), 100);
    }

    #[test]
    fn test_query_json_shape() {
        let q: CaseQuery = serde_json::from_str(
            r#"{"query":"timeout","limit":5,"statuses":["open"],"tags_any":["db"]}"#,
        )
        .unwrap();
        assert_eq!(q.limit, Some(5));
        assert_eq!(q.filter.statuses, Some(vec![Status::Open]));
        assert_eq!(q.filter.tags_any, Some(vec!["db".to_string()]));
    }
}

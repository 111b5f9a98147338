use crate::error::{ScpError, ScpResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Title given to drafts that arrive without one.
pub const UNTITLED_CASE: &str = "Untitled Case";

// --- Enumerations ---

/// Lifecycle state of a [`Case`].
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Newly reported, nobody working on it yet.
    #[default]
    Open,
    /// An engineer is actively working the case.
    InProgress,
    /// Waiting on information from the customer.
    PendingCustomer,
    /// Waiting on a third-party vendor.
    PendingVendor,
    /// A fix or answer has been delivered.
    Resolved,
    /// Closed out, no further work expected.
    Closed,
}

impl Status {
    /// Every status, in lifecycle order.
    pub const ALL: [Status; 6] = [
        Status::Open,
        Status::InProgress,
        Status::PendingCustomer,
        Status::PendingVendor,
        Status::Resolved,
        Status::Closed,
    ];

    /// Wire name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Open => "open",
            Status::InProgress => "in_progress",
            Status::PendingCustomer => "pending_customer",
            Status::PendingVendor => "pending_vendor",
            Status::Resolved => "resolved",
            Status::Closed => "closed",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = ScpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ScpError::MalformedInput(format!("unknown status '{s}'")))
    }
}

/// Urgency of a [`Case`]. Ordered from most to least urgent.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Production down or data loss.
    Critical,
    /// Major functionality impaired.
    High,
    /// Default priority.
    #[default]
    Medium,
    /// Cosmetic or informational.
    Low,
}

impl Priority {
    /// Every priority, most urgent first.
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
    ];

    /// Wire name of the priority.
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = ScpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Priority::ALL
            .into_iter()
            .find(|priority| priority.as_str() == s)
            .ok_or_else(|| ScpError::MalformedInput(format!("unknown priority '{s}'")))
    }
}

// --- Case parts ---

/// A classification label attached to a case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseTag {
    /// Tag name, unique within one case.
    pub name: String,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// Who produced the tag (`auto`, `manual`, ...).
    pub source: String,
}

impl CaseTag {
    /// Creates a tag, rejecting confidences outside `[0, 1]`.
    pub fn new(
        name: impl Into<String>,
        confidence: f64,
        source: impl Into<String>,
    ) -> ScpResult<Self> {
        let tag = Self {
            name: name.into(),
            confidence,
            source: source.into(),
        };
        tag.validate()?;
        Ok(tag)
    }

    /// Creates a manual tag with full confidence.
    pub fn manual(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            confidence: 1.0,
            source: "manual".to_string(),
        }
    }

    fn validate(&self) -> ScpResult<()> {
        if self.name.trim().is_empty() {
            return Err(ScpError::MalformedInput("tag name is blank".into()));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(ScpError::MalformedInput(format!(
                "tag '{}' confidence {} outside [0, 1]",
                self.name, self.confidence
            )));
        }
        Ok(())
    }
}

/// A log line or finding attached to a case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// When the line was recorded.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Raw log text.
    pub content: String,
    /// Origin system of the line, if known.
    #[serde(default)]
    pub source: Option<String>,
    /// Severity level (`error`, `warning`, `info`), if known.
    #[serde(default)]
    pub level: Option<String>,
}

impl LogEntry {
    /// Creates a log entry stamped now.
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            content: content.into(),
            source: None,
            level: None,
        }
    }

    /// Sets the severity level.
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = Some(level.into());
        self
    }

    /// Sets the origin system.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Operational metrics tracked per case.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaseMetrics {
    /// Hours until first response.
    pub response_time_hours: Option<f64>,
    /// Hours until resolution.
    pub resolution_time_hours: Option<f64>,
    /// Customer satisfaction score in `[1, 5]`.
    pub customer_satisfaction: Option<f64>,
    /// Engineering hours spent.
    pub engineering_effort_hours: Option<f64>,
    /// Number of escalations.
    pub escalation_count: u32,
}

// --- Case ---

/// A support incident record.
///
/// `case_id` is assigned by the caller and is the identity used by the store
/// and every index. `updated_at` is owned by the store, which stamps it on
/// every mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Case {
    /// Unique case identifier.
    pub case_id: String,
    /// One-line summary.
    pub title: String,
    /// Lifecycle state.
    #[serde(default)]
    pub status: Status,
    /// Urgency.
    #[serde(default)]
    pub priority: Priority,
    /// Free-form description.
    #[serde(default)]
    pub description: String,

    /// Customer name or id.
    #[serde(default)]
    pub customer: Option<String>,
    /// Product or service affected.
    #[serde(default)]
    pub product: Option<String>,
    /// Component within the product.
    #[serde(default)]
    pub component: Option<String>,
    /// Free-form severity label.
    #[serde(default)]
    pub severity: Option<String>,
    /// Primary category.
    #[serde(default)]
    pub category: Option<String>,
    /// Secondary category.
    #[serde(default)]
    pub subcategory: Option<String>,

    /// Observed symptoms, in report order.
    #[serde(default)]
    pub symptoms: Vec<String>,
    /// Verbatim error messages.
    #[serde(default)]
    pub error_messages: Vec<String>,
    /// Steps to reproduce.
    #[serde(default)]
    pub reproduction_steps: Vec<String>,
    /// Internal notes.
    #[serde(default)]
    pub notes: Vec<String>,

    /// Identified root cause.
    #[serde(default)]
    pub root_cause: Option<String>,
    /// Applied solution.
    #[serde(default)]
    pub solution: Option<String>,
    /// Temporary workaround.
    #[serde(default)]
    pub workaround: Option<String>,

    /// Attached log lines.
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    /// Tags, unique by name.
    #[serde(default)]
    pub tags: Vec<CaseTag>,
    /// Ids of related cases.
    #[serde(default)]
    pub related_cases: Vec<String>,
    /// Id of the parent case when this is a sub-case.
    #[serde(default)]
    pub parent_case: Option<String>,

    /// Operational metrics.
    #[serde(default)]
    pub metrics: CaseMetrics,
    /// Opaque integration fields.
    #[serde(default)]
    pub custom_fields: HashMap<String, serde_json::Value>,

    /// Creation time.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Last mutation time, stamped by the store.
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Case {
    /// Creates an open, medium-priority case with the given id and title.
    pub fn new(case_id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            case_id: case_id.into(),
            title: title.into(),
            status: Status::default(),
            priority: Priority::default(),
            description: String::new(),
            customer: None,
            product: None,
            component: None,
            severity: None,
            category: None,
            subcategory: None,
            symptoms: Vec::new(),
            error_messages: Vec::new(),
            reproduction_steps: Vec::new(),
            notes: Vec::new(),
            root_cause: None,
            solution: None,
            workaround: None,
            logs: Vec::new(),
            tags: Vec::new(),
            related_cases: Vec::new(),
            parent_case: None,
            metrics: CaseMetrics::default(),
            custom_fields: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Sets the status.
    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Adds a manual tag.
    pub fn with_tag(mut self, name: impl Into<String>) -> Self {
        self.add_tag(CaseTag::manual(name));
        self
    }

    /// Adds a tag. A tag with the same name is replaced where it stands.
    pub fn add_tag(&mut self, tag: CaseTag) {
        match self.tags.iter_mut().find(|t| t.name == tag.name) {
            Some(existing) => *existing = tag,
            None => self.tags.push(tag),
        }
    }

    /// Removes a tag by name. Returns whether it was present.
    pub fn remove_tag(&mut self, name: &str) -> bool {
        let before = self.tags.len();
        self.tags.retain(|t| t.name != name);
        self.tags.len() < before
    }

    /// Whether a tag with this name is attached.
    pub fn has_tag(&self, name: &str) -> bool {
        self.tags.iter().any(|t| t.name == name)
    }

    /// Appends a log line.
    pub fn add_log(&mut self, entry: LogEntry) {
        self.logs.push(entry);
    }

    /// Links a related case. Returns `false` for duplicates and self links.
    pub fn add_related(&mut self, case_id: impl Into<String>) -> bool {
        let case_id = case_id.into();
        if case_id == self.case_id || self.related_cases.contains(&case_id) {
            return false;
        }
        self.related_cases.push(case_id);
        true
    }

    /// Whole days since the case was created.
    pub fn days_open(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_days()
    }

    /// All searchable text of the case joined by single spaces.
    ///
    /// Order: title, description, symptoms, error messages, reproduction steps,
    /// notes, root cause, solution, workaround, log contents, tag names. Empty
    /// parts are skipped.
    pub fn text_content(&self) -> String {
        let mut parts: Vec<&str> = vec![&self.title, &self.description];
        parts.extend(self.symptoms.iter().map(String::as_str));
        parts.extend(self.error_messages.iter().map(String::as_str));
        parts.extend(self.reproduction_steps.iter().map(String::as_str));
        parts.extend(self.notes.iter().map(String::as_str));
        parts.extend(self.root_cause.as_deref());
        parts.extend(self.solution.as_deref());
        parts.extend(self.workaround.as_deref());
        parts.extend(self.logs.iter().map(|l| l.content.as_str()));
        parts.extend(self.tags.iter().map(|t| t.name.as_str()));

        parts
            .into_iter()
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Names of the fields in which any whitespace token of `query` occurs,
    /// compared case-insensitively.
    pub fn matched_fields(&self, query: &str) -> Vec<String> {
        let tokens: Vec<String> = query.split_whitespace().map(str::to_lowercase).collect();
        if tokens.is_empty() {
            return Vec::new();
        }
        let hit = |text: &str| {
            let lowered = text.to_lowercase();
            tokens.iter().any(|t| lowered.contains(t.as_str()))
        };
        let any_hit = |items: &[String]| items.iter().any(|s| hit(s));

        let checks: [(&str, bool); 11] = [
            ("title", hit(&self.title)),
            ("description", hit(&self.description)),
            ("symptoms", any_hit(&self.symptoms)),
            ("error_messages", any_hit(&self.error_messages)),
            ("reproduction_steps", any_hit(&self.reproduction_steps)),
            ("notes", any_hit(&self.notes)),
            ("root_cause", self.root_cause.as_deref().is_some_and(hit)),
            ("solution", self.solution.as_deref().is_some_and(hit)),
            ("workaround", self.workaround.as_deref().is_some_and(hit)),
            ("tags", self.tags.iter().any(|t| hit(&t.name))),
            ("logs", self.logs.iter().any(|l| hit(&l.content))),
        ];
        checks
            .into_iter()
            .filter(|(_, matched)| *matched)
            .map(|(name, _)| name.to_string())
            .collect()
    }

    /// Applies a partial update. Scalar fields overwrite, list fields append.
    pub fn apply_update(&mut self, update: CaseUpdate) {
        let CaseUpdate {
            title,
            status,
            priority,
            description,
            solution,
            workaround,
            root_cause,
            symptoms,
            error_messages,
            reproduction_steps,
            notes,
        } = update;

        if let Some(title) = title {
            self.title = title;
        }
        if let Some(status) = status {
            self.status = status;
        }
        if let Some(priority) = priority {
            self.priority = priority;
        }
        if let Some(description) = description {
            self.description = description;
        }
        if solution.is_some() {
            self.solution = solution;
        }
        if workaround.is_some() {
            self.workaround = workaround;
        }
        if root_cause.is_some() {
            self.root_cause = root_cause;
        }
        self.symptoms.extend(symptoms.unwrap_or_default());
        self.error_messages.extend(error_messages.unwrap_or_default());
        self.reproduction_steps
            .extend(reproduction_steps.unwrap_or_default());
        self.notes.extend(notes.unwrap_or_default());
    }

    /// Checks the record invariants the store relies on.
    pub fn validate(&self) -> ScpResult<()> {
        if self.case_id.trim().is_empty() {
            return Err(ScpError::MalformedInput("case_id is blank".into()));
        }
        for (i, tag) in self.tags.iter().enumerate() {
            tag.validate().map_err(|e| {
                ScpError::MalformedInput(format!("case {}: {e}", self.case_id))
            })?;
            if self.tags[..i].iter().any(|t| t.name == tag.name) {
                return Err(ScpError::MalformedInput(format!(
                    "case {}: duplicate tag '{}'",
                    self.case_id, tag.name
                )));
            }
        }
        if let Some(score) = self.metrics.customer_satisfaction {
            if !(1.0..=5.0).contains(&score) {
                return Err(ScpError::MalformedInput(format!(
                    "case {}: customer satisfaction {score} outside [1, 5]",
                    self.case_id
                )));
            }
        }
        Ok(())
    }
}

// --- Partial updates and drafts ---

/// A partial update. `None` leaves a field untouched; list fields append.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CaseUpdate {
    /// New title.
    #[serde(default)]
    pub title: Option<String>,
    /// New status.
    #[serde(default)]
    pub status: Option<Status>,
    /// New priority.
    #[serde(default)]
    pub priority: Option<Priority>,
    /// New description.
    #[serde(default)]
    pub description: Option<String>,
    /// New solution.
    #[serde(default)]
    pub solution: Option<String>,
    /// New workaround.
    #[serde(default)]
    pub workaround: Option<String>,
    /// New root cause.
    #[serde(default)]
    pub root_cause: Option<String>,
    /// Symptoms to append.
    #[serde(default)]
    pub symptoms: Option<Vec<String>>,
    /// Error messages to append.
    #[serde(default)]
    pub error_messages: Option<Vec<String>>,
    /// Reproduction steps to append.
    #[serde(default)]
    pub reproduction_steps: Option<Vec<String>>,
    /// Notes to append.
    #[serde(default)]
    pub notes: Option<Vec<String>>,
}

impl CaseUpdate {
    /// Whether the update changes nothing.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// The canonical shape a free-text parser hands over. Every field is optional;
/// [`CaseDraft::into_case`] fills the gaps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaseDraft {
    /// Case id. Synthesised from the clock when absent.
    pub case_id: Option<String>,
    /// Title. Falls back to [`UNTITLED_CASE`].
    pub title: Option<String>,
    /// Status.
    pub status: Option<Status>,
    /// Priority.
    pub priority: Option<Priority>,
    /// Description.
    pub description: Option<String>,
    /// Customer.
    pub customer: Option<String>,
    /// Product.
    pub product: Option<String>,
    /// Component.
    pub component: Option<String>,
    /// Category.
    pub category: Option<String>,
    /// Symptoms.
    pub symptoms: Vec<String>,
    /// Error messages.
    pub error_messages: Vec<String>,
    /// Reproduction steps.
    pub reproduction_steps: Vec<String>,
    /// Notes.
    pub notes: Vec<String>,
    /// Root cause.
    pub root_cause: Option<String>,
    /// Solution.
    pub solution: Option<String>,
    /// Workaround.
    pub workaround: Option<String>,
    /// Tags. Later duplicates replace earlier ones.
    pub tags: Vec<CaseTag>,
    /// Log lines.
    pub logs: Vec<LogEntry>,
    /// Creation time, defaults to now.
    pub created_at: Option<DateTime<Utc>>,
}

impl CaseDraft {
    /// Converts the draft into a validated case.
    pub fn into_case(self) -> ScpResult<Case> {
        let now = Utc::now();
        let case_id = self
            .case_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| synthesize_case_id(now));
        let title = self
            .title
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| UNTITLED_CASE.to_string());

        let mut case = Case::new(case_id, title);
        case.status = self.status.unwrap_or_default();
        case.priority = self.priority.unwrap_or_default();
        case.description = self.description.unwrap_or_default();
        case.customer = self.customer;
        case.product = self.product;
        case.component = self.component;
        case.category = self.category;
        case.symptoms = self.symptoms;
        case.error_messages = self.error_messages;
        case.reproduction_steps = self.reproduction_steps;
        case.notes = self.notes;
        case.root_cause = self.root_cause;
        case.solution = self.solution;
        case.workaround = self.workaround;
        case.logs = self.logs;
        for tag in self.tags {
            case.add_tag(tag);
        }
        if let Some(created_at) = self.created_at {
            case.created_at = created_at;
        }
        case.validate()?;
        Ok(case)
    }
}

/// Timestamp-derived case id with a short random suffix against collisions
/// within the same second.
pub fn synthesize_case_id(now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("SCP-{}-{}", now.format("%Y%m%d%H%M%S"), &suffix[..8])
}

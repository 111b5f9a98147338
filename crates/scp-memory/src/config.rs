use crate::index::BackendKind;
use scp_core::{ScpError, ScpResult, MAX_LIMIT};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File name of the case snapshot inside `data_dir`.
pub const CASES_FILE: &str = "cases.json";

/// When the similarity index is brought back in line with the store after a
/// mutation that leaves it stale.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsistencyPolicy {
    /// Rebuild right after the mutation, before the call returns.
    #[default]
    Eager,
    /// Leave the index stale until `rebuild_index` or the next open.
    Deferred,
}

/// Top-level configuration of a case memory.
///
/// ```toml
/// data_dir = "./scp_data"
///
/// [search]
/// backend = "embedding"
/// embedding_model = "minilm"
/// default_limit = 10
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Directory holding `cases.json`, the index artifacts and backups.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Search and indexing settings.
    #[serde(default)]
    pub search: SearchConfig,
}

/// Search and indexing settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Similarity backend to start with.
    #[serde(default)]
    pub backend: BackendKind,
    /// Encoder name, resolved by [`crate::registry::load_encoder`].
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    /// Where downloaded model files live. Defaults to `<data_dir>/models`.
    #[serde(default)]
    pub model_cache_dir: Option<PathBuf>,
    /// Results per query when the query does not say.
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    /// Hard cap on results per query.
    #[serde(default = "default_max_limit")]
    pub max_limit: usize,
    /// Neighbours returned by `find_similar` by default.
    #[serde(default = "default_similar_limit")]
    pub similar_limit: usize,
    /// Minimum score for `find_similar` by default.
    #[serde(default = "default_similar_threshold")]
    pub similar_threshold: f32,
    /// Index consistency after deletes and updates.
    #[serde(default)]
    pub consistency: ConsistencyPolicy,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            search: SearchConfig::default(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            embedding_model: default_embedding_model(),
            model_cache_dir: None,
            default_limit: default_limit(),
            max_limit: default_max_limit(),
            similar_limit: default_similar_limit(),
            similar_threshold: default_similar_threshold(),
            consistency: ConsistencyPolicy::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./scp_data")
}
fn default_embedding_model() -> String {
    "minilm".to_string()
}
fn default_limit() -> usize {
    10
}
fn default_max_limit() -> usize {
    MAX_LIMIT
}
fn default_similar_limit() -> usize {
    5
}
fn default_similar_threshold() -> f32 {
    0.1
}

impl MemoryConfig {
    /// Default settings rooted at `data_dir`.
    pub fn in_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Selects the similarity backend.
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.search.backend = backend;
        self
    }

    /// Selects the encoder by name.
    pub fn with_embedding_model(mut self, model: impl Into<String>) -> Self {
        self.search.embedding_model = model.into();
        self
    }

    /// Selects the consistency policy.
    pub fn with_consistency(mut self, policy: ConsistencyPolicy) -> Self {
        self.search.consistency = policy;
        self
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(raw: &str) -> ScpResult<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| ScpError::Config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub async fn load(path: &Path) -> ScpResult<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            ScpError::Config(format!(
                "failed to read config file '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Rejects settings the query layer cannot honour.
    pub fn validate(&self) -> ScpResult<()> {
        let s = &self.search;
        if s.max_limit == 0 || s.max_limit > MAX_LIMIT {
            return Err(ScpError::Config(format!(
                "max_limit must be in 1..={MAX_LIMIT}, got {}",
                s.max_limit
            )));
        }
        if s.default_limit == 0 || s.default_limit > s.max_limit {
            return Err(ScpError::Config(format!(
                "default_limit must be in 1..={}, got {}",
                s.max_limit, s.default_limit
            )));
        }
        if s.similar_limit == 0 {
            return Err(ScpError::Config("similar_limit must be positive".into()));
        }
        if !(0.0..=1.0).contains(&s.similar_threshold) {
            return Err(ScpError::Config(format!(
                "similar_threshold must be in [0, 1], got {}",
                s.similar_threshold
            )));
        }
        if s.embedding_model.trim().is_empty() {
            return Err(ScpError::Config("embedding_model is empty".into()));
        }
        Ok(())
    }

    /// Path of the case snapshot.
    pub fn cases_path(&self) -> PathBuf {
        self.data_dir.join(CASES_FILE)
    }

    /// Directory holding the index artifacts.
    pub fn index_dir(&self) -> PathBuf {
        self.data_dir.join("index")
    }

    /// Directory holding timestamped backups.
    pub fn backup_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }

    /// Model cache directory, explicit or under `data_dir`.
    pub fn model_cache_dir(&self) -> PathBuf {
        self.search
            .model_cache_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("models"))
    }
}

//! Encoder registry: resolves a configured model name to an encoder.
//!
//! | Name | ID | Dimension | Semantic | Notes |
//! |------|----|-----------|----------|-------|
//! | minilm | minilm-384 | 384 | yes | needs the `fastembed` feature |
//! | hash | fnv1a-384 | 384 | no | always available |
//!
//! Resolution never falls back silently. An unknown or uncompiled model is
//! reported as [`ScpError::BackendUnavailable`] and the caller decides whether
//! to degrade.

use crate::embedding::{EmbeddingProvider, LocalEmbedding, HASH_DIMENSION};
use scp_core::{ScpError, ScpResult};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Default encoder name when none is configured.
pub const DEFAULT_ENCODER: &str = "minilm";

/// Hash encoder name.
pub const HASH_ENCODER: &str = "hash";

/// Static description of a known encoder.
#[derive(Debug, Clone)]
pub struct RegisteredEncoder {
    /// Short name used in config.
    pub name: &'static str,
    /// Model identity written to index metadata.
    pub id: &'static str,
    /// Other accepted spellings.
    pub aliases: &'static [&'static str],
    /// Output dimension.
    pub dimension: usize,
    /// Whether the encoder captures meaning rather than shared words.
    pub is_semantic: bool,
    /// Human-readable description.
    pub description: &'static str,
}

impl RegisteredEncoder {
    /// Whether this build can construct the encoder.
    pub fn is_compiled(&self) -> bool {
        !self.is_semantic || cfg!(feature = "fastembed")
    }

    fn answers_to(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
            || self.id.eq_ignore_ascii_case(name)
            || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(name))
    }
}

/// Every known encoder, preferred first.
pub static ENCODERS: &[RegisteredEncoder] = &[
    RegisteredEncoder {
        name: "minilm",
        id: "minilm-384",
        aliases: &["all-MiniLM-L6-v2", "sentence-transformers/all-MiniLM-L6-v2"],
        dimension: 384,
        is_semantic: true,
        description: "MiniLM-L6-v2 sentence embeddings",
    },
    RegisteredEncoder {
        name: HASH_ENCODER,
        id: "fnv1a-384",
        aliases: &["fnv1a"],
        dimension: HASH_DIMENSION,
        is_semantic: false,
        description: "FNV-1a feature hashing, no model files",
    },
];

/// Looks up an encoder by name, id or alias, ignoring ASCII case.
pub fn find(name: &str) -> Option<&'static RegisteredEncoder> {
    ENCODERS.iter().find(|e| e.answers_to(name.trim()))
}

/// Encoders this build can construct.
pub fn available() -> Vec<&'static RegisteredEncoder> {
    ENCODERS.iter().filter(|e| e.is_compiled()).collect()
}

/// Builds the named encoder. `cache_dir` holds downloaded model files.
pub fn load_encoder(name: &str, cache_dir: &Path) -> ScpResult<Arc<dyn EmbeddingProvider>> {
    let entry = find(name)
        .ok_or_else(|| ScpError::BackendUnavailable(format!("unknown encoder '{name}'")))?;
    debug!(encoder = entry.name, description = entry.description, "Resolving encoder");
    if !entry.is_semantic {
        return Ok(Arc::new(LocalEmbedding::new(entry.dimension)));
    }
    load_semantic(entry, cache_dir)
}

#[cfg(feature = "fastembed")]
fn load_semantic(
    _entry: &RegisteredEncoder,
    cache_dir: &Path,
) -> ScpResult<Arc<dyn EmbeddingProvider>> {
    Ok(Arc::new(crate::embedding::FastEmbedder::load(cache_dir)?))
}

#[cfg(not(feature = "fastembed"))]
fn load_semantic(
    entry: &RegisteredEncoder,
    _cache_dir: &Path,
) -> ScpResult<Arc<dyn EmbeddingProvider>> {
    Err(ScpError::BackendUnavailable(format!(
        "encoder '{}' requires the fastembed feature",
        entry.name
    )))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_find_by_name_id_alias() {
        assert_eq!(find("minilm").unwrap().id, "minilm-384");
        assert_eq!(find("ALL-MINILM-L6-V2").unwrap().name, "minilm");
        assert_eq!(find("fnv1a-384").unwrap().name, "hash");
        assert_eq!(find(" hash ").unwrap().name, "hash");
        assert!(find("word2vec").is_none());
    }

    #[test]
    fn test_hash_always_available() {
        assert!(available().iter().any(|e| e.name == HASH_ENCODER));
    }

    #[test]
    fn test_load_hash_encoder() {
        let tmp = tempfile::TempDir::new().unwrap();
        let encoder = load_encoder("hash", tmp.path()).unwrap();
        assert_eq!(encoder.model_id(), "fnv1a-384");
        assert_eq!(encoder.dimension(), 384);
    }

    #[test]
    fn test_unknown_encoder_unavailable() {
        let tmp = tempfile::TempDir::new().unwrap();
        let err = load_encoder("word2vec", tmp.path()).err().unwrap();
        assert!(matches!(err, ScpError::BackendUnavailable(_)));
    }

    #[cfg(not(feature = "fastembed"))]
    #[test]
    fn test_semantic_needs_feature() {
        let tmp = tempfile::TempDir::new().unwrap();
        let err = load_encoder(DEFAULT_ENCODER, tmp.path()).err().unwrap();
        assert!(matches!(err, ScpError::BackendUnavailable(_)));
    }
}

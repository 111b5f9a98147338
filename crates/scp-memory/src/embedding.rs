use async_trait::async_trait;
use scp_core::{ScpError, ScpResult};
use std::collections::HashMap;

/// Dimension of the hash encoder, matched to MiniLM so either fits the same slab.
pub const HASH_DIMENSION: usize = 384;

/// Maps text to a fixed-length, L2-normalised vector.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Compute embedding vector for a single text.
    async fn embed(&self, text: &str) -> ScpResult<Vec<f32>>;

    /// Compute embeddings for a batch of texts.
    async fn embed_batch(&self, texts: &[&str]) -> ScpResult<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    /// Dimension of the embedding vectors produced by this provider.
    fn dimension(&self) -> usize;

    /// Stable identity of the model, recorded next to persisted vectors.
    fn model_id(&self) -> &str;
}

/// Feature-hashing encoder. No model files, deterministic, always available.
///
/// Words are lower-cased alphanumeric runs of two or more characters. Each word
/// adds its term frequency at three FNV-1a positions with decreasing weight.
pub struct LocalEmbedding {
    dimension: usize,
    model_id: String,
}

impl LocalEmbedding {
    /// Creates a hash encoder of the given dimension.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            model_id: format!("fnv1a-{dimension}"),
        }
    }
}

impl Default for LocalEmbedding {
    fn default() -> Self {
        Self::new(HASH_DIMENSION)
    }
}

#[async_trait]
impl EmbeddingProvider for LocalEmbedding {
    async fn embed(&self, text: &str) -> ScpResult<Vec<f32>> {
        if text.is_empty() {
            return Err(ScpError::Embedding("cannot embed empty text".to_string()));
        }
        if self.dimension == 0 {
            return Err(ScpError::Embedding("dimension must be positive".to_string()));
        }

        let mut vector = vec![0.0f32; self.dimension];

        let lowered = text.to_lowercase();
        let words: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.len() > 1)
            .collect();

        let mut freq: HashMap<&str, f32> = HashMap::new();
        for word in &words {
            *freq.entry(word).or_insert(0.0) += 1.0;
        }

        let total = words.len() as f32;
        if total == 0.0 {
            return Ok(vector);
        }

        for (word, count) in &freq {
            let tf = count / total;
            let bytes = word.as_bytes();
            vector[fnv1a(bytes, None) as usize % self.dimension] += tf;
            vector[fnv1a(bytes, Some(1)) as usize % self.dimension] += tf * 0.7;
            vector[fnv1a(bytes, Some(2)) as usize % self.dimension] += tf * 0.5;
        }

        l2_normalize(&mut vector);
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

/// FNV-1a over `data`, optionally salted with one trailing byte.
fn fnv1a(data: &[u8], salt: Option<u8>) -> u32 {
    let mut hash: u32 = 2166136261;
    for &byte in data.iter().chain(salt.as_slice()) {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

/// Scales `vector` to unit length in place. Zero vectors are left alone.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

#[cfg(feature = "fastembed")]
pub use fast::FastEmbedder;

#[cfg(feature = "fastembed")]
mod fast {
    use super::{l2_normalize, EmbeddingProvider};
    use async_trait::async_trait;
    use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
    use parking_lot::Mutex;
    use scp_core::{ScpError, ScpResult};
    use std::path::Path;
    use std::sync::Arc;
    use tracing::info;

    /// MiniLM-L6-v2 sentence encoder run through ONNX runtime.
    ///
    /// Inference is CPU bound and runs on the blocking pool.
    pub struct FastEmbedder {
        model: Arc<Mutex<TextEmbedding>>,
    }

    impl FastEmbedder {
        /// Model identity recorded in index metadata.
        pub const MODEL_ID: &'static str = "minilm-384";
        /// Output dimension.
        pub const DIMENSION: usize = 384;

        /// Loads the model, downloading it into `cache_dir` on first use.
        pub fn load(cache_dir: &Path) -> ScpResult<Self> {
            let options = InitOptions::new(EmbeddingModel::AllMiniLML6V2)
                .with_cache_dir(cache_dir.to_path_buf())
                .with_show_download_progress(false);
            let model = TextEmbedding::try_new(options).map_err(|e| {
                ScpError::BackendUnavailable(format!("failed to load MiniLM: {e}"))
            })?;
            info!(cache_dir = %cache_dir.display(), "Loaded MiniLM encoder");
            Ok(Self {
                model: Arc::new(Mutex::new(model)),
            })
        }

        async fn run(&self, texts: Vec<String>) -> ScpResult<Vec<Vec<f32>>> {
            let model = Arc::clone(&self.model);
            let mut vectors = tokio::task::spawn_blocking(move || model.lock().embed(texts, None))
                .await
                .map_err(|e| ScpError::Embedding(format!("encoder task failed: {e}")))?
                .map_err(|e| ScpError::Embedding(e.to_string()))?;
            for v in &mut vectors {
                l2_normalize(v);
            }
            Ok(vectors)
        }
    }

    #[async_trait]
    impl EmbeddingProvider for FastEmbedder {
        async fn embed(&self, text: &str) -> ScpResult<Vec<f32>> {
            if text.is_empty() {
                return Err(ScpError::Embedding("cannot embed empty text".to_string()));
            }
            self.run(vec![text.to_string()])
                .await?
                .pop()
                .ok_or_else(|| ScpError::Embedding("encoder returned no vector".to_string()))
        }

        async fn embed_batch(&self, texts: &[&str]) -> ScpResult<Vec<Vec<f32>>> {
            if texts.is_empty() {
                return Ok(Vec::new());
            }
            self.run(texts.iter().map(|t| (*t).to_string()).collect())
                .await
        }

        fn dimension(&self) -> usize {
            Self::DIMENSION
        }

        fn model_id(&self) -> &str {
            Self::MODEL_ID
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn dot(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[tokio::test]
    async fn test_local_embedding_dimension() {
        let emb = LocalEmbedding::new(128);
        assert_eq!(emb.dimension(), 128);
        assert_eq!(emb.model_id(), "fnv1a-128");
        let vec = emb.embed("hello world").await.unwrap();
        assert_eq!(vec.len(), 128);
    }

    #[tokio::test]
    async fn test_local_embedding_normalized() {
        let emb = LocalEmbedding::default();
        let vec = emb.embed("connection pool exhausted").await.unwrap();
        let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_local_embedding_similar_texts() {
        let emb = LocalEmbedding::default();
        let v1 = emb.embed("database connection timeout").await.unwrap();
        let v2 = emb.embed("database connection refused").await.unwrap();
        let v3 = emb.embed("printer paper jam").await.unwrap();

        let sim_12 = dot(&v1, &v2);
        let sim_13 = dot(&v1, &v3);
        assert!(
            sim_12 > sim_13,
            "sim(db-db)={sim_12} should be > sim(db-printer)={sim_13}"
        );
    }

    #[tokio::test]
    async fn test_local_embedding_empty() {
        let emb = LocalEmbedding::default();
        assert!(emb.embed("").await.is_err());
        let zero = emb.embed("a ! ?").await.unwrap();
        assert!(zero.iter().all(|x| *x == 0.0));
    }

    #[tokio::test]
    async fn test_local_embedding_deterministic() {
        let emb = LocalEmbedding::default();
        let v1 = emb.embed("Login Loop").await.unwrap();
        let v2 = emb.embed("login loop").await.unwrap();
        assert_eq!(v1, v2);
    }

    #[tokio::test]
    async fn test_embed_batch() {
        let emb = LocalEmbedding::default();
        let vecs = emb.embed_batch(&["disk full", "dns failure"]).await.unwrap();
        assert_eq!(vecs.len(), 2);
        assert_eq!(vecs[0].len(), HASH_DIMENSION);
    }

    #[test]
    fn test_fnv1a_salt_changes_hash() {
        assert_eq!(fnv1a(b"", None), 2166136261);
        assert_ne!(fnv1a(b"disk", None), fnv1a(b"disk", Some(1)));
        assert_eq!(fnv1a(b"disk", Some(1)), fnv1a(b"disk\x01", None));
    }
}

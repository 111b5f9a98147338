use super::{index_text, sort_hits, BackendKind, IndexHit, IndexLoad, IndexStats, SimilarityIndex};
use crate::embedding::EmbeddingProvider;
use async_trait::async_trait;
use parking_lot::RwLock;
use scp_core::{Case, ScpError, ScpResult};
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Vector slab file inside the index directory.
pub const VECTOR_FILE: &str = "vector_index.bin";
/// Metadata file inside the index directory.
pub const METADATA_FILE: &str = "vector_metadata.json";

const MAGIC: [u8; 4] = *b"SCPV";
const FORMAT_VERSION: u16 = 1;
/// magic + version + dimension + count + crc
const HEADER_LEN: usize = 4 + 2 + 4 + 4 + 4;

/// Sidecar describing a persisted vector slab.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorMetadata {
    /// Case id of each row, in slab order.
    pub case_ids: Vec<String>,
    /// Identity of the encoder that produced the vectors.
    pub model_name: String,
    /// Vector dimension.
    pub embedding_dim: usize,
    /// Number of rows.
    pub total_cases: usize,
}

/// Append-only rows plus a map from case id to its current row.
///
/// Updates push a new row and repoint `live`; removals drop the `live` entry.
/// Superseded rows stay until a rebuild compacts them.
struct VectorTable {
    dimension: usize,
    row_ids: Vec<String>,
    vectors: Vec<f32>,
    live: HashMap<String, usize>,
    stale: bool,
}

impl VectorTable {
    fn new(dimension: usize) -> Self {
        Self {
            dimension,
            row_ids: Vec::new(),
            vectors: Vec::new(),
            live: HashMap::new(),
            stale: false,
        }
    }

    fn push(&mut self, case_id: &str, vector: &[f32]) {
        let row = self.row_ids.len();
        self.row_ids.push(case_id.to_string());
        self.vectors.extend_from_slice(vector);
        if self.live.insert(case_id.to_string(), row).is_some() {
            self.stale = true;
        }
    }

    fn row(&self, row: usize) -> &[f32] {
        let start = row * self.dimension;
        &self.vectors[start..start + self.dimension]
    }

    /// Live rows in slab order.
    fn live_rows(&self) -> Vec<(&str, usize)> {
        let mut rows: Vec<(&str, usize)> = self
            .live
            .iter()
            .map(|(id, row)| (id.as_str(), *row))
            .collect();
        rows.sort_by_key(|(_, row)| *row);
        rows
    }
}

#[derive(Debug)]
struct Scored<'a> {
    score: f32,
    case_id: &'a str,
}

impl PartialEq for Scored<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scored<'_> {}

impl PartialOrd for Scored<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored<'_> {
    // Higher score is better; on ties the smaller id is better.
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.case_id.cmp(self.case_id))
    }
}

/// Exact inner-product search over encoder vectors.
///
/// The encoder runs before the table lock is taken, so slow models never block
/// readers. Scores are clamped to `[0, 1]`.
pub struct EmbeddingIndex {
    encoder: Arc<dyn EmbeddingProvider>,
    table: RwLock<VectorTable>,
}

impl EmbeddingIndex {
    /// Creates an empty index over the given encoder.
    pub fn new(encoder: Arc<dyn EmbeddingProvider>) -> Self {
        let dimension = encoder.dimension();
        Self {
            encoder,
            table: RwLock::new(VectorTable::new(dimension)),
        }
    }

    /// Identity of the encoder.
    pub fn model_id(&self) -> &str {
        self.encoder.model_id()
    }

    async fn encode(&self, text: &str) -> ScpResult<Vec<f32>> {
        let vector = self.encoder.embed(text).await?;
        self.check_dimension(&vector)?;
        Ok(vector)
    }

    fn check_dimension(&self, vector: &[f32]) -> ScpResult<()> {
        let expected = self.encoder.dimension();
        if vector.len() != expected {
            return Err(ScpError::Embedding(format!(
                "encoder {} returned {} dims, expected {expected}",
                self.encoder.model_id(),
                vector.len()
            )));
        }
        Ok(())
    }

    fn top_k(&self, query: &[f32], k: usize, threshold: f32) -> Vec<IndexHit> {
        if k == 0 {
            return Vec::new();
        }
        let table = self.table.read();
        let mut heap: BinaryHeap<Reverse<Scored<'_>>> = BinaryHeap::with_capacity(k + 1);
        for (case_id, row) in &table.live {
            let raw: f32 = table
                .row(*row)
                .iter()
                .zip(query)
                .map(|(a, b)| a * b)
                .sum();
            let score = raw.clamp(0.0, 1.0);
            if score < threshold {
                continue;
            }
            heap.push(Reverse(Scored {
                score,
                case_id: case_id.as_str(),
            }));
            if heap.len() > k {
                heap.pop();
            }
        }

        let mut hits: Vec<IndexHit> = heap
            .into_iter()
            .map(|Reverse(s)| IndexHit {
                case_id: s.case_id.to_string(),
                score: s.score,
            })
            .collect();
        sort_hits(&mut hits);
        hits
    }

    fn encode_artifacts(&self) -> ScpResult<(Vec<u8>, VectorMetadata)> {
        let table = self.table.read();
        let rows = table.live_rows();
        let count = u32::try_from(rows.len())
            .map_err(|_| ScpError::Index("too many rows to persist".into()))?;
        let dimension = u32::try_from(table.dimension)
            .map_err(|_| ScpError::Index("dimension out of range".into()))?;

        let mut buf = Vec::with_capacity(HEADER_LEN + rows.len() * table.dimension * 4);
        buf.extend_from_slice(&MAGIC);
        buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        buf.extend_from_slice(&dimension.to_le_bytes());
        buf.extend_from_slice(&count.to_le_bytes());
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        for (_, row) in &rows {
            for value in table.row(*row) {
                buf.extend_from_slice(&value.to_le_bytes());
            }
        }

        let metadata = VectorMetadata {
            case_ids: rows.iter().map(|(id, _)| (*id).to_string()).collect(),
            model_name: self.encoder.model_id().to_string(),
            embedding_dim: table.dimension,
            total_cases: rows.len(),
        };
        Ok((buf, metadata))
    }
}

/// Parses a slab written by [`EmbeddingIndex::persist`] against its metadata.
fn decode_slab(bytes: &[u8], metadata: &VectorMetadata) -> ScpResult<Vec<f32>> {
    let header = bytes
        .get(..HEADER_LEN)
        .ok_or_else(|| ScpError::Index("vector file shorter than header".into()))?;
    if header[..4] != MAGIC {
        return Err(ScpError::Index("invalid vector file magic".into()));
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != FORMAT_VERSION {
        return Err(ScpError::Index(format!(
            "unsupported vector file version {version}"
        )));
    }
    let read_u32 =
        |at: usize| u32::from_le_bytes([header[at], header[at + 1], header[at + 2], header[at + 3]]);
    let dimension = read_u32(6) as usize;
    let count = read_u32(10) as usize;
    let crc = read_u32(14);
    if crc32fast::hash(&header[..14]) != crc {
        return Err(ScpError::Index("vector file header CRC mismatch".into()));
    }
    if dimension != metadata.embedding_dim || count != metadata.case_ids.len() {
        return Err(ScpError::Index(format!(
            "vector file holds {count}x{dimension}, metadata says {}x{}",
            metadata.case_ids.len(),
            metadata.embedding_dim
        )));
    }

    let body = &bytes[HEADER_LEN..];
    let expected = count
        .checked_mul(dimension)
        .and_then(|n| n.checked_mul(4))
        .ok_or_else(|| ScpError::Index("vector slab size overflow".into()))?;
    if body.len() != expected {
        return Err(ScpError::Index(format!(
            "vector slab is {} bytes, expected {expected}",
            body.len()
        )));
    }
    Ok(body
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> ScpResult<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl SimilarityIndex for EmbeddingIndex {
    fn kind(&self) -> BackendKind {
        BackendKind::Embedding
    }

    async fn add(&self, case: &Case) -> ScpResult<()> {
        let vector = self.encode(&index_text(case)).await?;
        self.table.write().push(&case.case_id, &vector);
        Ok(())
    }

    async fn remove(&self, case_id: &str) -> ScpResult<bool> {
        let mut table = self.table.write();
        let present = table.live.remove(case_id).is_some();
        if present {
            table.stale = true;
        }
        Ok(present)
    }

    async fn update(&self, case: &Case) -> ScpResult<()> {
        self.add(case).await
    }

    async fn search(&self, query: &str, k: usize, threshold: f32) -> ScpResult<Vec<IndexHit>> {
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }
        let text = if query.trim().is_empty() {
            super::EMPTY_CASE_TEXT
        } else {
            query
        };
        let vector = self.encode(text).await?;
        Ok(self.top_k(&vector, k, threshold))
    }

    async fn find_similar(
        &self,
        case: &Case,
        k: usize,
        threshold: f32,
    ) -> ScpResult<Vec<IndexHit>> {
        let vector = self.encode(&index_text(case)).await?;
        let mut hits = self.top_k(&vector, k.saturating_add(1), threshold);
        hits.retain(|h| h.case_id != case.case_id);
        hits.truncate(k);
        Ok(hits)
    }

    async fn rebuild(&self, cases: &[Case]) -> ScpResult<()> {
        let mut unique: Vec<&Case> = Vec::with_capacity(cases.len());
        let mut position: HashMap<&str, usize> = HashMap::new();
        for case in cases {
            match position.get(case.case_id.as_str()) {
                Some(&at) => unique[at] = case,
                None => {
                    position.insert(case.case_id.as_str(), unique.len());
                    unique.push(case);
                }
            }
        }

        let texts: Vec<String> = unique.iter().map(|c| index_text(c)).collect();
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let vectors = self.encoder.embed_batch(&refs).await?;
        if vectors.len() != unique.len() {
            return Err(ScpError::Embedding(format!(
                "encoder returned {} vectors for {} texts",
                vectors.len(),
                unique.len()
            )));
        }

        let mut fresh = VectorTable::new(self.encoder.dimension());
        for (case, vector) in unique.iter().zip(&vectors) {
            self.check_dimension(vector)?;
            fresh.push(&case.case_id, vector);
        }
        *self.table.write() = fresh;
        info!(
            cases = unique.len(),
            model = %self.encoder.model_id(),
            "Rebuilt embedding index"
        );
        Ok(())
    }

    async fn persist(&self, dir: &Path) -> ScpResult<()> {
        let (slab, metadata) = self.encode_artifacts()?;
        tokio::fs::create_dir_all(dir).await?;
        write_atomic(&dir.join(VECTOR_FILE), &slab).await?;
        let json = serde_json::to_vec_pretty(&metadata)?;
        write_atomic(&dir.join(METADATA_FILE), &json).await?;
        info!(
            dir = %dir.display(),
            cases = metadata.total_cases,
            "Persisted embedding index"
        );
        Ok(())
    }

    async fn load(&self, dir: &Path) -> ScpResult<IndexLoad> {
        let meta_path = dir.join(METADATA_FILE);
        let slab_path = dir.join(VECTOR_FILE);
        if !tokio::fs::try_exists(&meta_path).await? || !tokio::fs::try_exists(&slab_path).await?
        {
            return Ok(IndexLoad::Absent);
        }

        let raw = tokio::fs::read(&meta_path).await?;
        let metadata: VectorMetadata = serde_json::from_slice(&raw)?;
        let current = self.encoder.model_id().to_string();
        if metadata.model_name != current || metadata.embedding_dim != self.encoder.dimension() {
            debug!(
                stored = %metadata.model_name,
                current = %current,
                stored_dim = metadata.embedding_dim,
                "Discarding vectors from another encoder"
            );
            *self.table.write() = VectorTable::new(self.encoder.dimension());
            return Ok(IndexLoad::ModelMismatch {
                stored: metadata.model_name,
                current,
            });
        }

        let bytes = tokio::fs::read(&slab_path).await?;
        let vectors = decode_slab(&bytes, &metadata)?;

        let mut table = VectorTable::new(metadata.embedding_dim);
        for (row, case_id) in metadata.case_ids.iter().enumerate() {
            let start = row * metadata.embedding_dim;
            table.push(case_id, &vectors[start..start + metadata.embedding_dim]);
        }
        let count = table.live.len();
        *self.table.write() = table;
        info!(dir = %dir.display(), cases = count, "Loaded embedding index");
        Ok(IndexLoad::Loaded { count })
    }

    fn needs_rebuild(&self) -> bool {
        self.table.read().stale
    }

    fn len(&self) -> usize {
        self.table.read().live.len()
    }

    fn stats(&self) -> IndexStats {
        let table = self.table.read();
        IndexStats {
            backend: BackendKind::Embedding,
            model_id: Some(self.encoder.model_id().to_string()),
            dimension: Some(table.dimension),
            indexed_cases: table.live.len(),
            rows: table.row_ids.len(),
            needs_rebuild: table.stale,
        }
    }
}

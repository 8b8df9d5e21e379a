// SPDX-License-Identifier: MIT OR Apache-2.0
//! Embedding backends.
//!
//! The engine treats embeddings as an interchangeable dependency behind the
//! [`Embedder`] trait. The shipping default is [`HashingEmbedder`]: signed
//! feature hashing over word tokens and character 3-grams into a fixed-size
//! L2-normalized vector. It is deterministic and needs no network, which
//! keeps the backlog pipeline runnable anywhere. Remote embedders plug in
//! through the same trait and the cache layers wrap any of them.

use crate::text::tokenize;
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from embedding backends and caches.
#[derive(Debug, Error)]
pub enum EmbedderError {
    /// Backend returned a different number of vectors than texts.
    #[error("embedding backend returned unexpected vector count: expected {expected}, got {got}")]
    VectorCountMismatch {
        /// Texts submitted.
        expected: usize,
        /// Vectors returned.
        got: usize,
    },

    /// SQLite cache failure.
    #[error("embedding cache failure: {0}")]
    Cache(#[from] rusqlite::Error),

    /// Embedder selection rejected the environment configuration.
    #[error("unsupported embedder configuration: {0}")]
    UnsupportedConfig(String),
}

/// Embedding provider interface.
pub trait Embedder {
    /// Embed each text into a vector. Implementations must return exactly
    /// one vector per input, in order.
    fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f64>>, EmbedderError>;

    /// Stable identifier used as the disk-cache namespace.
    fn model_id(&self) -> String;
}

// ---------------------------------------------------------------------------
// Vector math
// ---------------------------------------------------------------------------

/// Dot product. Panics in debug builds if lengths differ; callers always
/// compare vectors from the same embedder.
pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// L2-normalize; the zero vector stays zero.
pub fn l2_normalize(vec: &[f64]) -> Vec<f64> {
    let norm_sq: f64 = vec.iter().map(|v| v * v).sum();
    if norm_sq <= 0.0 {
        return vec![0.0; vec.len()];
    }
    let inv = 1.0 / norm_sq.sqrt();
    vec.iter().map(|v| v * inv).collect()
}

/// Cosine similarity in `[-1, 1]`. Does not assume normalized inputs.
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    let aa: f64 = a.iter().map(|v| v * v).sum();
    let bb: f64 = b.iter().map(|v| v * v).sum();
    if aa <= 0.0 || bb <= 0.0 {
        return 0.0;
    }
    dot(a, b) / (aa.sqrt() * bb.sqrt())
}

fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Stable 64-bit hash of a token (first 8 bytes of SHA-256, big-endian).
fn stable_hash64(value: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    let digest = hasher.finalize();
    u64::from_be_bytes(digest[..8].try_into().expect("8-byte prefix"))
}

// ---------------------------------------------------------------------------
// HashingEmbedder
// ---------------------------------------------------------------------------

/// Offline feature-hashing embedder.
///
/// Not a neural model: word tokens and character n-grams are hashed with a
/// sign bit into a fixed-dimension vector, then L2-normalized so cosine
/// similarity is a dot product.
#[derive(Debug, Clone, PartialEq)]
pub struct HashingEmbedder {
    /// Vector dimension.
    pub dim: usize,
    /// Weight added per word token.
    pub token_weight: f64,
    /// Character n-gram length.
    pub ngram_n: usize,
    /// Weight added per n-gram (0 disables n-grams).
    pub ngram_weight: f64,
    /// Cap on n-grams considered per text.
    pub max_ngrams: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self {
            dim: 512,
            token_weight: 1.0,
            ngram_n: 3,
            ngram_weight: 0.5,
            max_ngrams: 4_096,
        }
    }
}

fn char_ngrams(text: &str, n: usize, max_ngrams: usize) -> Vec<String> {
    let cleaned: String = text
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    if cleaned.is_empty() {
        return Vec::new();
    }
    let chars: Vec<char> = cleaned.chars().collect();
    if chars.len() <= n {
        return vec![cleaned];
    }
    let mut out = Vec::new();
    for window in chars.windows(n) {
        out.push(window.iter().collect::<String>());
        if max_ngrams > 0 && out.len() >= max_ngrams {
            break;
        }
    }
    out
}

impl Embedder for HashingEmbedder {
    fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f64>>, EmbedderError> {
        let dim = self.dim.max(1);
        let mut vectors = Vec::with_capacity(texts.len());

        for text in texts {
            let mut vec = vec![0.0f64; dim];

            for token in tokenize(text) {
                let h = stable_hash64(&token);
                let idx = (h % dim as u64) as usize;
                let sign = if (h >> 63) & 1 == 1 { 1.0 } else { -1.0 };
                vec[idx] += sign * self.token_weight;
            }

            if self.ngram_weight != 0.0 {
                for gram in char_ngrams(text, self.ngram_n, self.max_ngrams) {
                    let h = stable_hash64(&format!("g:{gram}"));
                    let idx = (h % dim as u64) as usize;
                    let sign = if (h >> 63) & 1 == 1 { 1.0 } else { -1.0 };
                    vec[idx] += sign * self.ngram_weight;
                }
            }

            vectors.push(l2_normalize(&vec));
        }

        Ok(vectors)
    }

    fn model_id(&self) -> String {
        format!("hashing/d{}n{}", self.dim, self.ngram_n)
    }
}

// ---------------------------------------------------------------------------
// Cache layers
// ---------------------------------------------------------------------------

/// In-memory cache keyed by SHA-256(text). Always safe to stack on any
/// backend; remote backends especially benefit.
pub struct CachedEmbedder<E> {
    inner: E,
    cache: RefCell<HashMap<String, Vec<f64>>>,
}

impl<E: Embedder> CachedEmbedder<E> {
    /// Wrap `inner` with an empty cache.
    pub fn new(inner: E) -> Self {
        Self {
            inner,
            cache: RefCell::new(HashMap::new()),
        }
    }
}

impl<E: Embedder> Embedder for CachedEmbedder<E> {
    fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f64>>, EmbedderError> {
        let mut keys = Vec::with_capacity(texts.len());
        let mut missing_texts: Vec<String> = Vec::new();
        let mut missing_keys: Vec<String> = Vec::new();
        {
            let cache = self.cache.borrow();
            for text in texts {
                let key = sha256_hex(text);
                if !cache.contains_key(&key) && !missing_keys.contains(&key) {
                    missing_texts.push(text.clone());
                    missing_keys.push(key.clone());
                }
                keys.push(key);
            }
        }

        if !missing_texts.is_empty() {
            let vectors = self.inner.embed_texts(&missing_texts)?;
            if vectors.len() != missing_keys.len() {
                return Err(EmbedderError::VectorCountMismatch {
                    expected: missing_keys.len(),
                    got: vectors.len(),
                });
            }
            let mut cache = self.cache.borrow_mut();
            for (key, vec) in missing_keys.into_iter().zip(vectors) {
                cache.insert(key, vec);
            }
        }

        let cache = self.cache.borrow();
        Ok(keys
            .iter()
            .map(|key| cache[key].clone())
            .collect())
    }

    fn model_id(&self) -> String {
        self.inner.model_id()
    }
}

/// SQLite cache: vectors stored as compact JSON arrays keyed by
/// `(model_id, sha256(text))`.
pub struct DiskCachedEmbedder<E> {
    inner: E,
    path: PathBuf,
}

impl<E: Embedder> DiskCachedEmbedder<E> {
    /// Wrap `inner` with a cache database at `path` (created on demand).
    pub fn new(inner: E, path: impl Into<PathBuf>) -> Self {
        Self {
            inner,
            path: path.into(),
        }
    }

    fn connect(&self) -> Result<Connection, EmbedderError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    EmbedderError::UnsupportedConfig(format!(
                        "cannot create cache directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }
        let conn = Connection::open(&self.path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS embedding_cache (
                model_id TEXT NOT NULL,
                text_hash TEXT NOT NULL,
                vector_json TEXT NOT NULL,
                PRIMARY KEY (model_id, text_hash)
            )",
            [],
        )?;
        Ok(conn)
    }
}

impl<E: Embedder> Embedder for DiskCachedEmbedder<E> {
    fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f64>>, EmbedderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let model_id = self.inner.model_id();
        let conn = self.connect()?;

        let hashes: Vec<String> = texts.iter().map(|t| sha256_hex(t)).collect();
        let mut cached: HashMap<String, Vec<f64>> = HashMap::new();
        {
            let mut stmt = conn.prepare(
                "SELECT vector_json FROM embedding_cache WHERE model_id = ?1 AND text_hash = ?2",
            )?;
            for hash in &hashes {
                if cached.contains_key(hash) {
                    continue;
                }
                let row: Option<String> = stmt
                    .query_row(rusqlite::params![model_id, hash], |row| row.get(0))
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                if let Some(json) = row {
                    if let Ok(vec) = serde_json::from_str::<Vec<f64>>(&json) {
                        cached.insert(hash.clone(), vec);
                    }
                }
            }
        }

        let mut missing_hashes: Vec<String> = Vec::new();
        let mut missing_texts: Vec<String> = Vec::new();
        for (text, hash) in texts.iter().zip(&hashes) {
            if !cached.contains_key(hash) && !missing_hashes.contains(hash) {
                missing_hashes.push(hash.clone());
                missing_texts.push(text.clone());
            }
        }

        if !missing_texts.is_empty() {
            let vectors = self.inner.embed_texts(&missing_texts)?;
            if vectors.len() != missing_hashes.len() {
                return Err(EmbedderError::VectorCountMismatch {
                    expected: missing_hashes.len(),
                    got: vectors.len(),
                });
            }
            let mut stmt = conn.prepare(
                "INSERT OR IGNORE INTO embedding_cache(model_id, text_hash, vector_json)
                 VALUES (?1, ?2, ?3)",
            )?;
            for (hash, vec) in missing_hashes.into_iter().zip(vectors) {
                let json =
                    serde_json::to_string(&vec).unwrap_or_else(|_| "[]".to_string());
                stmt.execute(rusqlite::params![model_id, hash, json])?;
                cached.insert(hash, vec);
            }
        }

        Ok(hashes.iter().map(|hash| cached[hash].clone()).collect())
    }

    fn model_id(&self) -> String {
        self.inner.model_id()
    }
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// Select the default embedder from the environment.
///
/// * unset `TRIAGE_ENGINE_EMBEDDER` → hashing embedder (memory-cached, plus
///   a SQLite layer when `TRIAGE_ENGINE_EMBED_CACHE_PATH` is set);
/// * `openai[:model]` → rejected: this crate carries no remote backend, the
///   trait is the seam for callers that do;
/// * anything else → rejected.
pub fn default_embedder() -> Result<Box<dyn Embedder>, EmbedderError> {
    let spec = std::env::var("TRIAGE_ENGINE_EMBEDDER").unwrap_or_default();
    let spec = spec.trim();
    if !spec.is_empty() {
        if spec.to_lowercase().starts_with("openai") {
            return Err(EmbedderError::UnsupportedConfig(
                "TRIAGE_ENGINE_EMBEDDER=openai requires a remote embedding backend; \
                 supply one through the Embedder trait or unset the variable to use \
                 the offline hashing embedder"
                    .to_string(),
            ));
        }
        return Err(EmbedderError::UnsupportedConfig(format!(
            "unrecognized TRIAGE_ENGINE_EMBEDDER value {spec:?}"
        )));
    }

    let inner = CachedEmbedder::new(HashingEmbedder::default());
    let cache_path = std::env::var("TRIAGE_ENGINE_EMBED_CACHE_PATH").unwrap_or_default();
    let cache_path = cache_path.trim();
    if cache_path.is_empty() {
        Ok(Box::new(inner))
    } else {
        Ok(Box::new(DiskCachedEmbedder::new(inner, cache_path)))
    }
}

impl Embedder for Box<dyn Embedder> {
    fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f64>>, EmbedderError> {
        (**self).embed_texts(texts)
    }

    fn model_id(&self) -> String {
        (**self).model_id()
    }
}

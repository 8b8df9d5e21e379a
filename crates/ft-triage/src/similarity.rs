// SPDX-License-Identifier: MIT OR Apache-2.0
//! Composite pair similarity and candidate-pair generation.
//!
//! Items are compared on four signals: embedding cosine (dominant), title
//! token overlap, path-anchor overlap, and shared evidence IDs. For large
//! inputs, candidate pairs come from exact buckets (fingerprint, evidence,
//! anchor, title token) plus banded sparse-random-hyperplane LSH signatures
//! rather than the full quadratic sweep.

use crate::embed::{Embedder, EmbedderError, dot, l2_normalize};
use crate::text::{extract_path_anchors_from_chunks, tokenize};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

/// One item represented as an embedding vector plus high-precision metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemVector {
    /// Item title.
    pub title: String,
    /// Canonical text the vector was computed from.
    pub text: String,
    /// Lowercased title tokens.
    pub title_tokens: BTreeSet<String>,
    /// Expanded path anchors.
    pub anchors: BTreeSet<String>,
    /// Evidence IDs cited by the item.
    pub evidence_ids: BTreeSet<String>,
    /// SHA-256 of the canonical text; empty when the item has no text.
    pub fingerprint: String,
    /// L2-normalized embedding.
    pub vector: Vec<f64>,
}

/// Similarity breakdown between two items.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PairSimilarity {
    /// Raw cosine in `[-1, 1]`.
    pub embedding_cosine: f64,
    /// Cosine rescaled into `[0, 1]`.
    pub embedding_similarity: f64,
    /// Jaccard over anchors.
    pub anchor_jaccard: f64,
    /// Jaccard over title tokens.
    pub title_jaccard: f64,
    /// Count of shared evidence IDs.
    pub evidence_overlap: usize,
    /// Whether canonical-text fingerprints matched exactly.
    pub exact_duplicate: bool,
    /// Weighted composite in `[0, 1]` (1.0 for exact duplicates).
    pub overall_similarity: f64,
}

// ---------------------------------------------------------------------------
// Weights
// ---------------------------------------------------------------------------

/// Weights used by [`compute_pair_similarity`], normalized to sum 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimilarityWeights {
    /// Embedding similarity weight.
    pub embedding: f64,
    /// Title Jaccard weight.
    pub title: f64,
    /// Anchor Jaccard weight.
    pub anchor: f64,
    /// Evidence overlap weight.
    pub evidence: f64,
}

impl Default for SimilarityWeights {
    fn default() -> Self {
        Self {
            embedding: 0.82,
            title: 0.10,
            anchor: 0.06,
            evidence: 0.02,
        }
    }
}

impl SimilarityWeights {
    /// Normalize to sum 1.0; non-positive totals are left unchanged.
    pub fn normalized(self) -> Self {
        let total = self.embedding + self.title + self.anchor + self.evidence;
        if total <= 0.0 {
            return self;
        }
        Self {
            embedding: self.embedding / total,
            title: self.title / total,
            anchor: self.anchor / total,
            evidence: self.evidence / total,
        }
    }
}

fn parse_float_env(name: &str) -> Option<f64> {
    std::env::var(name).ok()?.trim().parse().ok()
}

/// Resolve similarity weights from the environment.
///
/// `TRIAGE_ENGINE_SIM_WEIGHTS` takes either a JSON object
/// (`{"embedding": 0.8, ...}`) or a comma list in
/// embedding,title,anchor,evidence order. Per-field
/// `TRIAGE_ENGINE_SIM_WEIGHT_<FIELD>` overrides win. The result is
/// normalized to sum 1.
pub fn similarity_weights_from_env() -> SimilarityWeights {
    let mut weights = SimilarityWeights::default();

    if let Ok(raw) = std::env::var("TRIAGE_ENGINE_SIM_WEIGHTS") {
        let raw = raw.trim();
        if raw.starts_with('{') {
            if let Ok(obj) = serde_json::from_str::<BTreeMap<String, f64>>(raw) {
                weights = SimilarityWeights {
                    embedding: *obj.get("embedding").unwrap_or(&weights.embedding),
                    title: *obj.get("title").unwrap_or(&weights.title),
                    anchor: *obj.get("anchor").unwrap_or(&weights.anchor),
                    evidence: *obj.get("evidence").unwrap_or(&weights.evidence),
                };
            }
        } else {
            let parts: Vec<f64> = raw
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .filter_map(|p| p.parse().ok())
                .collect();
            if parts.len() == 4 {
                weights = SimilarityWeights {
                    embedding: parts[0],
                    title: parts[1],
                    anchor: parts[2],
                    evidence: parts[3],
                };
            }
        }
    }

    if let Some(v) = parse_float_env("TRIAGE_ENGINE_SIM_WEIGHT_EMBEDDING") {
        weights.embedding = v;
    }
    if let Some(v) = parse_float_env("TRIAGE_ENGINE_SIM_WEIGHT_TITLE") {
        weights.title = v;
    }
    if let Some(v) = parse_float_env("TRIAGE_ENGINE_SIM_WEIGHT_ANCHOR") {
        weights.anchor = v;
    }
    if let Some(v) = parse_float_env("TRIAGE_ENGINE_SIM_WEIGHT_EVIDENCE") {
        weights.evidence = v;
    }

    weights.normalized()
}

// ---------------------------------------------------------------------------
// Pair similarity
// ---------------------------------------------------------------------------

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let inter = a.intersection(b).count();
    if inter == 0 {
        return 0.0;
    }
    let union = a.union(b).count();
    inter as f64 / union as f64
}

/// Composite similarity for two embedded items with explicit weights.
pub fn compute_pair_similarity(
    left: &ItemVector,
    right: &ItemVector,
    weights: &SimilarityWeights,
) -> PairSimilarity {
    let exact = !left.fingerprint.is_empty() && left.fingerprint == right.fingerprint;

    // Vectors are L2-normalized; cosine reduces to a dot product.
    let cos = dot(&left.vector, &right.vector).clamp(-1.0, 1.0);
    let emb_sim = (cos + 1.0) / 2.0;

    let anchor_sim = jaccard(&left.anchors, &right.anchors);
    let title_sim = jaccard(&left.title_tokens, &right.title_tokens);
    let evidence_overlap = left.evidence_ids.intersection(&right.evidence_ids).count();
    let evidence_signal = if evidence_overlap == 0 {
        0.0
    } else {
        (evidence_overlap as f64 / 2.0).min(1.0)
    };

    let overall = if exact {
        1.0
    } else {
        (weights.embedding * emb_sim
            + weights.title * title_sim
            + weights.anchor * anchor_sim
            + weights.evidence * evidence_signal)
            .clamp(0.0, 1.0)
    };

    PairSimilarity {
        embedding_cosine: cos,
        embedding_similarity: emb_sim,
        anchor_jaccard: anchor_sim,
        title_jaccard: title_sim,
        evidence_overlap,
        exact_duplicate: exact,
        overall_similarity: overall,
    }
}

// ---------------------------------------------------------------------------
// Item vector construction
// ---------------------------------------------------------------------------

/// Caller-supplied view of one item: a title, text chunks, and evidence IDs.
pub struct ItemSource {
    /// Item title (always included as a text chunk).
    pub title: String,
    /// Body text chunks.
    pub chunks: Vec<String>,
    /// Evidence IDs cited by the item.
    pub evidence_ids: Vec<String>,
}

const CANONICAL_MAX_CHARS: usize = 64_000;

fn canonical_text(text: &str) -> String {
    let cleaned: String = text.trim().split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.chars().count() > CANONICAL_MAX_CHARS {
        cleaned.chars().take(CANONICAL_MAX_CHARS).collect()
    } else {
        cleaned
    }
}

fn join_chunks(chunks: &[String], max_chars: usize) -> String {
    let joined = chunks
        .iter()
        .filter(|c| !c.is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join("\n");
    let total = joined.chars().count();
    if total <= max_chars {
        return joined;
    }
    // Keep head + tail to retain both context and any final error messages.
    let head_len = max_chars / 2;
    let tail_len = max_chars - head_len;
    let head: String = joined.chars().take(head_len).collect();
    let tail: String = joined
        .chars()
        .skip(total - tail_len)
        .collect();
    format!("{head}\n...[snip]...\n{tail}")
}

/// Build embedded vectors for a batch of items.
pub fn build_item_vectors<E: Embedder + ?Sized>(
    items: &[ItemSource],
    embedder: &E,
    max_text_chars: usize,
) -> Result<Vec<ItemVector>, EmbedderError> {
    if items.is_empty() {
        return Ok(Vec::new());
    }

    let mut texts: Vec<String> = Vec::with_capacity(items.len());
    let mut metas: Vec<(BTreeSet<String>, BTreeSet<String>, BTreeSet<String>, String)> =
        Vec::with_capacity(items.len());

    for item in items {
        let mut chunks: Vec<String> = item
            .chunks
            .iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        let title = item.title.trim().to_string();
        if !title.is_empty() && !chunks.contains(&title) {
            chunks.insert(0, title.clone());
        }

        let text = join_chunks(&chunks, max_text_chars);
        let canonical = canonical_text(&text);
        let fingerprint = if canonical.is_empty() {
            String::new()
        } else {
            let mut hasher = Sha256::new();
            hasher.update(canonical.as_bytes());
            format!("{:x}", hasher.finalize())
        };

        let title_tokens: BTreeSet<String> = tokenize(&title).into_iter().collect();
        let anchors: BTreeSet<String> =
            extract_path_anchors_from_chunks(chunks.iter().map(String::as_str))
                .into_iter()
                .collect();
        let evidence_ids: BTreeSet<String> = item
            .evidence_ids
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        texts.push(text);
        metas.push((title_tokens, anchors, evidence_ids, fingerprint));
    }

    let vectors_raw = embedder.embed_texts(&texts)?;
    if vectors_raw.len() != items.len() {
        return Err(EmbedderError::VectorCountMismatch {
            expected: items.len(),
            got: vectors_raw.len(),
        });
    }

    Ok(items
        .iter()
        .zip(texts)
        .zip(metas)
        .zip(vectors_raw)
        .map(
            |(((item, text), (title_tokens, anchors, evidence_ids, fingerprint)), vec)| {
                ItemVector {
                    title: item.title.trim().to_string(),
                    text,
                    title_tokens,
                    anchors,
                    evidence_ids,
                    fingerprint,
                    vector: l2_normalize(&vec),
                }
            },
        )
        .collect())
}

// ---------------------------------------------------------------------------
// LSH + candidate pairs
// ---------------------------------------------------------------------------

/// Knobs for [`generate_candidate_pairs`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CandidatePairOptions {
    /// Buckets larger than this are dropped to bound quadratic blowup.
    pub max_bucket_size: usize,
    /// Number of LSH bands.
    pub sim_bands: u32,
    /// Bits per band.
    pub sim_band_bits: u32,
    /// Total signature bits.
    pub lsh_bits: u32,
    /// Sparse components sampled per hyperplane.
    pub lsh_indices_per_bit: usize,
    /// RNG seed for hyperplane sampling.
    pub seed: u64,
    /// Cap on anchors bucketed per item.
    pub max_anchors_per_item: usize,
    /// Cap on title tokens bucketed per item.
    pub max_title_tokens_per_item: usize,
}

impl Default for CandidatePairOptions {
    fn default() -> Self {
        Self {
            max_bucket_size: 64,
            sim_bands: 8,
            sim_band_bits: 16,
            lsh_bits: 128,
            lsh_indices_per_bit: 32,
            seed: 1337,
            max_anchors_per_item: 8,
            max_title_tokens_per_item: 6,
        }
    }
}

/// LSH signatures for cosine similarity using sparse random hyperplanes.
struct SparseRandomHyperplaneLsh {
    dim: usize,
    n_bits: u32,
    indices: Vec<Vec<usize>>,
    signs: Vec<Vec<f64>>,
}

impl SparseRandomHyperplaneLsh {
    fn new(dim: usize, n_bits: u32, indices_per_bit: usize, seed: u64) -> Self {
        assert!(dim > 0, "LSH dim must be > 0");
        assert!(n_bits > 0 && n_bits <= 128, "LSH n_bits must be in 1..=128");
        assert!(indices_per_bit > 0, "LSH indices_per_bit must be > 0");

        let mut rng = StdRng::seed_from_u64(seed);
        let mut indices = Vec::with_capacity(n_bits as usize);
        let mut signs = Vec::with_capacity(n_bits as usize);
        for _ in 0..n_bits {
            let mut bit_indices = Vec::with_capacity(indices_per_bit);
            let mut bit_signs = Vec::with_capacity(indices_per_bit);
            for _ in 0..indices_per_bit {
                bit_indices.push(rng.gen_range(0..dim));
                bit_signs.push(if rng.r#gen::<f64>() < 0.5 { 1.0 } else { -1.0 });
            }
            indices.push(bit_indices);
            signs.push(bit_signs);
        }
        Self {
            dim,
            n_bits,
            indices,
            signs,
        }
    }

    fn signature(&self, vec: &[f64]) -> u128 {
        assert_eq!(vec.len(), self.dim, "vector length != LSH dimension");
        let mut sig: u128 = 0;
        for bit in 0..self.n_bits as usize {
            let acc: f64 = self.indices[bit]
                .iter()
                .zip(&self.signs[bit])
                .map(|(&idx, &sign)| sign * vec[idx])
                .sum();
            if acc >= 0.0 {
                sig |= 1u128 << bit;
            }
        }
        sig
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum BucketKey {
    Fingerprint(String),
    Evidence(String),
    Anchor(String),
    TitleToken(String),
    Band(u32, u128),
}

/// Generate candidate index pairs.
///
/// For 64 items or fewer every pair is a candidate; beyond that, pairs come
/// from exact buckets and LSH bands, with oversized buckets dropped.
pub fn generate_candidate_pairs(
    items: &[ItemVector],
    opts: &CandidatePairOptions,
) -> BTreeSet<(usize, usize)> {
    let n = items.len();
    let mut pairs = BTreeSet::new();
    if n <= 1 {
        return pairs;
    }

    if n <= 64 {
        for i in 0..n {
            for j in (i + 1)..n {
                pairs.insert((i, j));
            }
        }
        return pairs;
    }

    let mut buckets: BTreeMap<BucketKey, Vec<usize>> = BTreeMap::new();
    let add = |key: BucketKey, idx: usize, buckets: &mut BTreeMap<BucketKey, Vec<usize>>| {
        buckets.entry(key).or_default().push(idx);
    };

    for (idx, item) in items.iter().enumerate() {
        if !item.fingerprint.is_empty() {
            add(
                BucketKey::Fingerprint(item.fingerprint.clone()),
                idx,
                &mut buckets,
            );
        }
        for ev in &item.evidence_ids {
            add(BucketKey::Evidence(ev.clone()), idx, &mut buckets);
        }
        for anchor in item.anchors.iter().take(opts.max_anchors_per_item) {
            add(BucketKey::Anchor(anchor.clone()), idx, &mut buckets);
        }
        // Title tokens help avoid missing obvious duplicates when bodies
        // are short.
        for token in item.title_tokens.iter().take(opts.max_title_tokens_per_item) {
            add(BucketKey::TitleToken(token.clone()), idx, &mut buckets);
        }
    }

    let dim = items[0].vector.len();
    if dim > 0 && opts.sim_bands > 0 && opts.sim_band_bits > 0 {
        let lsh = SparseRandomHyperplaneLsh::new(
            dim,
            opts.lsh_bits,
            opts.lsh_indices_per_bit,
            opts.seed,
        );
        let mask: u128 = if opts.sim_band_bits >= 128 {
            u128::MAX
        } else {
            (1u128 << opts.sim_band_bits) - 1
        };
        for (idx, item) in items.iter().enumerate() {
            let sig = lsh.signature(&item.vector);
            for band in 0..opts.sim_bands {
                let shift = band * opts.sim_band_bits;
                if shift >= 128 {
                    break;
                }
                let band_value = (sig >> shift) & mask;
                add(BucketKey::Band(band, band_value), idx, &mut buckets);
            }
        }
    }

    for indices in buckets.values() {
        if indices.len() < 2 || indices.len() > opts.max_bucket_size {
            continue;
        }
        let uniq: BTreeSet<usize> = indices.iter().copied().collect();
        let uniq: Vec<usize> = uniq.into_iter().collect();
        for i in 0..uniq.len() {
            for j in (i + 1)..uniq.len() {
                pairs.insert((uniq[i], uniq[j]));
            }
        }
    }

    pairs
}

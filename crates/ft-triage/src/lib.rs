// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! ft-triage
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Greedy k-NN clustering over candidate pairs.
pub mod cluster;
/// Embedder trait, hashing embedder, and cache layers.
pub mod embed;
/// Composite similarity and LSH candidate generation.
pub mod similarity;
/// Tokenization and path-anchor extraction.
pub mod text;
/// Regex theme classification.
pub mod themes;

pub use cluster::{ClusterOptions, cluster_items_knn, dedupe_clusters, select_medoid};
pub use embed::{
    CachedEmbedder, DiskCachedEmbedder, Embedder, EmbedderError, HashingEmbedder,
    cosine_similarity, default_embedder, dot, l2_normalize,
};
pub use similarity::{
    CandidatePairOptions, ItemSource, ItemVector, PairSimilarity, SimilarityWeights,
    build_item_vectors, compute_pair_similarity, generate_candidate_pairs,
    similarity_weights_from_env,
};
pub use themes::{Theme, classify_theme, classify_themes};

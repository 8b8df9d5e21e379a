// SPDX-License-Identifier: MIT OR Apache-2.0
//! Greedy k-NN clustering over the candidate-pair graph.

use crate::similarity::{
    CandidatePairOptions, ItemVector, SimilarityWeights, compute_pair_similarity,
    generate_candidate_pairs,
};
use std::collections::{BTreeMap, BTreeSet};

/// Knobs for [`cluster_items_knn`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClusterOptions {
    /// How many candidate clusters are examined per item.
    pub k: usize,
    /// Minimum composite similarity to join a cluster.
    pub overall_threshold: f64,
    /// Optional extra gate on embedding similarity to the representative.
    pub representative_threshold: Option<f64>,
    /// Whether size-1 clusters appear in the output.
    pub include_singletons: bool,
    /// Similarity weights.
    pub weights: SimilarityWeights,
    /// Candidate-pair generation knobs.
    pub pairs: CandidatePairOptions,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            k: 10,
            overall_threshold: 0.78,
            representative_threshold: Some(0.75),
            include_singletons: true,
            weights: SimilarityWeights::default().normalized(),
            pairs: CandidatePairOptions::default(),
        }
    }
}

fn embedding_similarity(left: &ItemVector, right: &ItemVector) -> f64 {
    let cos = crate::embed::dot(&left.vector, &right.vector).clamp(-1.0, 1.0);
    (cos + 1.0) / 2.0
}

/// Pick the medoid of `members`: highest mean composite similarity to the
/// other members, ties broken by smallest index.
pub fn select_medoid(
    members: &[usize],
    items: &[ItemVector],
    weights: &SimilarityWeights,
) -> usize {
    assert!(!members.is_empty(), "cannot select medoid of empty cluster");
    if members.len() == 1 {
        return members[0];
    }

    let mut best = members[0];
    let mut best_score = f64::NEG_INFINITY;
    for &candidate in members {
        let mut total = 0.0;
        let mut count = 0usize;
        for &other in members {
            if other == candidate {
                continue;
            }
            total +=
                compute_pair_similarity(&items[candidate], &items[other], weights)
                    .overall_similarity;
            count += 1;
        }
        let score = if count == 0 { 1.0 } else { total / count as f64 };
        if score > best_score || (score == best_score && candidate < best) {
            best = candidate;
            best_score = score;
        }
    }
    best
}

/// Greedy k-NN clustering.
///
/// Items are visited in input order. Each item is compared against the
/// current representatives of clusters it shares a candidate pair with; it
/// joins the most similar cluster passing both thresholds, or opens a new
/// one. After the sweep each cluster's representative is re-selected as the
/// medoid and moved to the front of the member list.
///
/// Returned clusters preserve input order of their members (modulo the
/// representative being first); every member belongs to exactly one cluster.
pub fn cluster_items_knn(items: &[ItemVector], opts: &ClusterOptions) -> Vec<Vec<usize>> {
    if items.is_empty() {
        return Vec::new();
    }

    let pairs = generate_candidate_pairs(items, &opts.pairs);
    let mut neighbors: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
    for &(i, j) in &pairs {
        neighbors.entry(i).or_default().insert(j);
        neighbors.entry(j).or_default().insert(i);
    }

    // clusters[c] = member indices in join order; representative[c] is the
    // current seed used for comparisons during the sweep.
    let mut clusters: Vec<Vec<usize>> = Vec::new();
    let mut representatives: Vec<usize> = Vec::new();

    for idx in 0..items.len() {
        let empty = BTreeSet::new();
        let adjacent = neighbors.get(&idx).unwrap_or(&empty);

        let mut scored: Vec<(f64, f64, usize)> = Vec::new();
        for (cluster_idx, &rep) in representatives.iter().enumerate() {
            if !adjacent.contains(&rep) {
                continue;
            }
            let sim = compute_pair_similarity(&items[idx], &items[rep], &opts.weights);
            scored.push((
                sim.overall_similarity,
                embedding_similarity(&items[idx], &items[rep]),
                cluster_idx,
            ));
        }
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.2.cmp(&b.2))
        });

        let joined = scored
            .into_iter()
            .take(opts.k.max(1))
            .find(|(overall, rep_sim, _)| {
                *overall >= opts.overall_threshold
                    && opts
                        .representative_threshold
                        .is_none_or(|threshold| *rep_sim >= threshold)
            });

        match joined {
            Some((_, _, cluster_idx)) => clusters[cluster_idx].push(idx),
            None => {
                clusters.push(vec![idx]);
                representatives.push(idx);
            }
        }
    }

    let mut out = Vec::with_capacity(clusters.len());
    for mut members in clusters {
        if members.len() == 1 && !opts.include_singletons {
            continue;
        }
        let medoid = select_medoid(&members, items, &opts.weights);
        members.retain(|&m| m != medoid);
        members.insert(0, medoid);
        out.push(members);
    }
    out
}

/// Near-duplicate collapse: [`cluster_items_knn`] at a high overall
/// threshold with no representative gate, singletons always included.
pub fn dedupe_clusters(items: &[ItemVector], overall_threshold: f64) -> Vec<Vec<usize>> {
    cluster_items_knn(
        items,
        &ClusterOptions {
            overall_threshold,
            representative_threshold: None,
            include_singletons: true,
            ..ClusterOptions::default()
        },
    )
}

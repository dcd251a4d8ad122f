//! Consistency analysis: repeatedly sample an agent's response to the
//! same input and quantify response stability in embedding space.
//!
//! Each iteration opens a fresh session (no shared context); iteration 0
//! is the baseline. Responses are embedded in one batched call, compared
//! to the baseline by cosine similarity, and grouped with a greedy
//! single-link clustering. O(n²) is fine at the expected sizes
//! (iterations ≤ 100); this is not meant to scale past that.

use crate::store::{ResultStore, StoreError};
use crate::testcase::TestCase;
use oracle::{Embedder, OracleError, OracleResult};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_OUTLIER_THRESHOLD: f64 = 0.85;
pub const DEFAULT_CLUSTER_THRESHOLD: f64 = 0.90;
const REPRESENTATIVE_MAX_CHARS: usize = 200;

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error(transparent)]
    Oracle(#[from] OracleError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type AnalysisResult<T> = Result<T, AnalysisError>;

/// One repeated call to the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistencySample {
    pub run_id: Uuid,
    pub iteration: usize,
    pub response_text: String,
    pub embedding: Vec<f32>,
    pub similarity_to_baseline: f64,
    pub is_outlier: bool,
    pub latency_ms: u64,
}

/// A group of near-identical responses, labeled by size rank.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseCluster {
    pub label: String,
    pub size: usize,
    /// First member's response, truncated for display.
    pub representative: String,
    /// Mean cosine similarity of members to the cluster seed.
    pub avg_similarity: f64,
}

/// Aggregate of all samples for one analyzed test case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistencyRun {
    pub id: Uuid,
    pub test_case_id: Uuid,
    pub iterations: usize,
    /// Mean similarity to baseline, ×100.
    pub consistency_score: f64,
    /// Standard deviation of the similarity list.
    pub semantic_variance: f64,
    pub outlier_count: usize,
    pub clusters: Vec<ResponseCluster>,
}

pub struct ConsistencyAnalyzer {
    store: Arc<dyn ResultStore>,
    embedder: Arc<dyn Embedder>,
    outlier_threshold: f64,
    cluster_threshold: f64,
}

impl ConsistencyAnalyzer {
    pub fn new(store: Arc<dyn ResultStore>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            store,
            embedder,
            outlier_threshold: DEFAULT_OUTLIER_THRESHOLD,
            cluster_threshold: DEFAULT_CLUSTER_THRESHOLD,
        }
    }

    pub fn with_outlier_threshold(mut self, threshold: f64) -> Self {
        self.outlier_threshold = threshold;
        self
    }

    pub fn with_cluster_threshold(mut self, threshold: f64) -> Self {
        self.cluster_threshold = threshold;
        self
    }

    /// Call the agent `iterations` times via `call_fn`, embed every
    /// response, and score stability. `call_fn` receives the iteration
    /// index and must open a fresh session per call; it returns the
    /// response text and the call latency in milliseconds. Every sample
    /// and the aggregate run row are upserted to the store before this
    /// returns.
    pub async fn analyze<F, Fut>(
        &self,
        test_case: &TestCase,
        iterations: usize,
        call_fn: F,
    ) -> AnalysisResult<(ConsistencyRun, Vec<ConsistencySample>)>
    where
        F: Fn(usize) -> Fut,
        Fut: Future<Output = OracleResult<(String, u64)>>,
    {
        if iterations == 0 {
            return Err(OracleError::InvalidConfig {
                message: "consistency analysis requires at least one iteration".to_string(),
            }
            .into());
        }

        info!(
            "Consistency analysis for '{}': {} iterations",
            test_case.name, iterations
        );

        let run_id = Uuid::new_v4();
        let mut responses = Vec::with_capacity(iterations);
        for i in 0..iterations {
            let (text, latency_ms) = call_fn(i).await?;
            debug!("Iteration {i} replied in {latency_ms}ms ({} chars)", text.len());
            responses.push((text, latency_ms));
        }

        let texts: Vec<String> = responses.iter().map(|(t, _)| t.clone()).collect();
        let embeddings = self.embedder.embed(&texts).await?;
        if embeddings.len() != responses.len() {
            return Err(OracleError::MalformedOutput {
                message: format!(
                    "embedder returned {} vectors for {} responses",
                    embeddings.len(),
                    responses.len()
                ),
            }
            .into());
        }

        let baseline = &embeddings[0];
        let similarities: Vec<f64> = embeddings
            .iter()
            .map(|e| cosine_similarity(baseline, e))
            .collect();

        let samples: Vec<ConsistencySample> = responses
            .into_iter()
            .zip(embeddings.iter())
            .zip(similarities.iter())
            .enumerate()
            .map(|(i, (((text, latency_ms), embedding), &similarity))| ConsistencySample {
                run_id,
                iteration: i,
                response_text: text,
                embedding: embedding.clone(),
                similarity_to_baseline: similarity,
                is_outlier: similarity < self.outlier_threshold,
                latency_ms,
            })
            .collect();

        let outlier_count = samples.iter().filter(|s| s.is_outlier).count();
        if outlier_count > 0 {
            warn!(
                "{outlier_count}/{} responses fell below the {} outlier threshold",
                samples.len(),
                self.outlier_threshold
            );
        }

        let clusters = cluster_responses(&texts, &embeddings, self.cluster_threshold);

        let run = ConsistencyRun {
            id: run_id,
            test_case_id: test_case.id,
            iterations,
            consistency_score: mean(&similarities) * 100.0,
            semantic_variance: stddev(&similarities),
            outlier_count,
            clusters,
        };

        // The store is the source of truth here as in execution: rows go
        // in before the caller sees the aggregate.
        for sample in &samples {
            self.store.upsert_consistency_sample(sample.clone()).await?;
        }
        self.store.upsert_consistency_run(run.clone()).await?;

        info!(
            "Consistency score {:.1} (variance {:.4}, {} outliers, {} clusters)",
            run.consistency_score,
            run.semantic_variance,
            run.outlier_count,
            run.clusters.len()
        );

        Ok((run, samples))
    }
}

/// Cosine similarity in plain double precision. Vectors are opaque but
/// must share a dimensionality; a zero-norm vector yields 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0_f64;
    let mut norm_a = 0.0_f64;
    let mut norm_b = 0.0_f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        dot += f64::from(x) * f64::from(y);
        norm_a += f64::from(x) * f64::from(x);
        norm_b += f64::from(y) * f64::from(y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation.
pub fn stddev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// Greedy single-link clustering: each unclustered response seeds a new
/// cluster, which absorbs every remaining unclustered response whose
/// similarity to the seed meets the threshold. Clusters are sorted by
/// size descending and labeled Cluster A, B, C, ...
pub fn cluster_responses(
    texts: &[String],
    embeddings: &[Vec<f32>],
    threshold: f64,
) -> Vec<ResponseCluster> {
    let mut clustered = vec![false; embeddings.len()];
    let mut groups: Vec<(usize, Vec<f64>)> = Vec::new();

    for seed in 0..embeddings.len() {
        if clustered[seed] {
            continue;
        }
        clustered[seed] = true;
        let mut member_similarities = vec![1.0];
        for other in (seed + 1)..embeddings.len() {
            if clustered[other] {
                continue;
            }
            let similarity = cosine_similarity(&embeddings[seed], &embeddings[other]);
            if similarity >= threshold {
                clustered[other] = true;
                member_similarities.push(similarity);
            }
        }
        groups.push((seed, member_similarities));
    }

    groups.sort_by(|a, b| b.1.len().cmp(&a.1.len()));

    groups
        .into_iter()
        .enumerate()
        .map(|(rank, (seed, similarities))| ResponseCluster {
            label: cluster_label(rank),
            size: similarities.len(),
            representative: truncate_chars(&texts[seed], REPRESENTATIVE_MAX_CHARS),
            avg_similarity: mean(&similarities),
        })
        .collect()
}

fn cluster_label(rank: usize) -> String {
    if rank < 26 {
        format!("Cluster {}", (b'A' + rank as u8) as char)
    } else {
        format!("Cluster {}", rank + 1)
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let truncated: String = text.chars().take(max_chars).collect();
        format!("{truncated}…")
    }
}

//! Learned reranking over retrieved candidate memories
//!
//! Adapts query and memory embeddings through the learnable residual
//! transforms (`adapted = e + W·e`), scores candidates by dot
//! product in the adapted space, and selects a small subset via the
//! Gumbel-Top-M trick so the selection stays differentiable in expectation
//! for the policy-gradient update.
//!
//! Numeric edge cases (softmax underflow, overflow in dot products) degrade
//! to documented fallbacks instead of crashing the turn.

use rand::Rng;

use crate::errors::{MemoryError, Result};
use crate::linalg::{self, Matrix};
use crate::types::{RerankerState, RetrievedMemory};

/// Result of one sampling pass over K candidates
#[derive(Debug, Clone)]
pub struct SampledSelection {
    /// Defensive copies of the selected memories, `rerank_score` filled in
    pub selected: Vec<RetrievedMemory>,

    /// Softmax probabilities over all K candidates, kept for the gradient
    pub probabilities: Vec<f32>,

    /// Positions of the selections in the original candidate array
    pub selected_indices: Vec<usize>,
}

/// Full output of a reranking pass, everything the gradient step needs later
#[derive(Debug, Clone)]
pub struct RerankOutcome {
    pub selection: SampledSelection,
    pub query_embedding: Vec<f32>,
    pub adapted_query_embedding: Vec<f32>,
    pub memory_embeddings: Vec<Vec<f32>>,
    pub adapted_memory_embeddings: Vec<Vec<f32>>,
    pub relevance_scores: Vec<f32>,
}

/// Residual linear adaptation: `embedding + transform · embedding`
///
/// The transform must be square with dimension equal to the embedding length.
pub fn apply_embedding_adaptation(embedding: &[f32], transform: &Matrix) -> Result<Vec<f32>> {
    let (rows, cols) = linalg::matrix_shape(transform)?;
    if rows != cols {
        return Err(MemoryError::InvalidMatrix(format!(
            "adaptation transform must be square, got {rows}x{cols}"
        )));
    }
    if cols != embedding.len() {
        return Err(MemoryError::DimensionMismatch {
            expected: cols,
            actual: embedding.len(),
            context: "apply_embedding_adaptation".to_string(),
        });
    }

    let projected = linalg::matmul_vector(transform, embedding)?;
    linalg::residual_add(embedding, &projected)
}

/// Dot product relevance in the adapted space
///
/// Overflow is clamped to a large finite value rather than propagating
/// NaN/Infinity into the softmax.
pub fn compute_relevance_score(adapted_query: &[f32], adapted_memory: &[f32]) -> Result<f32> {
    if adapted_query.len() != adapted_memory.len() {
        return Err(MemoryError::DimensionMismatch {
            expected: adapted_query.len(),
            actual: adapted_memory.len(),
            context: "compute_relevance_score".to_string(),
        });
    }

    let score: f32 = adapted_query
        .iter()
        .zip(adapted_memory.iter())
        .map(|(a, b)| a * b)
        .sum();

    if score.is_finite() {
        Ok(score)
    } else {
        Ok(if score.is_sign_negative() {
            -crate::constants::SCORE_CLAMP
        } else {
            crate::constants::SCORE_CLAMP
        })
    }
}

/// One Gumbel(0, 1) draw from a uniform strictly inside (0, 1)
fn gumbel_noise<R: Rng>(rng: &mut R) -> f32 {
    // Clamp away from both endpoints so neither log can hit infinity
    let u: f32 = rng.gen::<f32>().clamp(f32::EPSILON, 1.0 - f32::EPSILON);
    -(-u.ln()).ln()
}

/// Gumbel-Softmax Top-M sampling over scored candidates
///
/// Perturbs each score with Gumbel noise and selects the `top_m` highest
/// perturbed scores — equivalent in distribution to sampling `top_m` items
/// without replacement from the softmax categorical defined by the perturbed
/// scores at `temperature`. The returned probability vector covers all K
/// candidates and feeds the exact gradient later; it is not used for the
/// selection itself.
///
/// Edge cases:
/// - `top_m >= K`: all candidates selected, uniform probability 1/K, no noise
/// - `K == 0` or `top_m == 0`: empty selection and probabilities
/// - degenerate softmax normalizer: uniform probabilities and deterministic
///   first-M selection (degraded mode, logged)
pub fn gumbel_softmax_sample<R: Rng>(
    rng: &mut R,
    memories: &[RetrievedMemory],
    scores: &[f32],
    top_m: usize,
    temperature: f32,
) -> Result<SampledSelection> {
    let k = memories.len();
    if scores.len() != k {
        return Err(MemoryError::DimensionMismatch {
            expected: k,
            actual: scores.len(),
            context: "gumbel_softmax_sample scores".to_string(),
        });
    }

    if k == 0 || top_m == 0 {
        return Ok(SampledSelection {
            selected: Vec::new(),
            probabilities: Vec::new(),
            selected_indices: Vec::new(),
        });
    }

    if top_m >= k {
        let uniform = 1.0 / k as f32;
        let selected = memories
            .iter()
            .enumerate()
            .map(|(i, m)| with_rerank_score(m, scores[i]))
            .collect();
        return Ok(SampledSelection {
            selected,
            probabilities: vec![uniform; k],
            selected_indices: (0..k).collect(),
        });
    }

    // Perturb and soften
    let perturbed: Vec<f32> = scores.iter().map(|s| s + gumbel_noise(rng)).collect();
    let scaled: Vec<f32> = perturbed.iter().map(|s| s / temperature).collect();

    let max_scaled = scaled.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = scaled.iter().map(|s| (s - max_scaled).exp()).collect();
    let normalizer: f32 = exps.iter().sum();

    let (probabilities, selected_indices) = if !normalizer.is_finite() || normalizer <= 0.0 {
        // Degraded mode: uniform distribution, deterministic first-M selection
        tracing::warn!(
            candidates = k,
            "Softmax normalizer degenerate, falling back to uniform selection"
        );
        (vec![1.0 / k as f32; k], (0..top_m).collect::<Vec<_>>())
    } else {
        let probabilities: Vec<f32> = exps.iter().map(|e| e / normalizer).collect();

        // Gumbel-Top-M: the top_m highest perturbed scores
        let mut order: Vec<usize> = (0..k).collect();
        order.sort_by(|&a, &b| perturbed[b].total_cmp(&perturbed[a]));
        order.truncate(top_m);
        (probabilities, order)
    };

    let selected = selected_indices
        .iter()
        .map(|&i| with_rerank_score(&memories[i], scores[i]))
        .collect();

    Ok(SampledSelection {
        selected,
        probabilities,
        selected_indices,
    })
}

fn with_rerank_score(memory: &RetrievedMemory, score: f32) -> RetrievedMemory {
    let mut copy = memory.clone();
    copy.rerank_score = Some(score);
    copy
}

/// Full reranking pass: adapt, score, sample
///
/// Every candidate must carry an embedding of the weight dimension; a missing
/// or mis-sized embedding is a hard validation failure (the embedding service
/// contract guarantees the configured dimension upstream).
pub fn rerank<R: Rng>(
    rng: &mut R,
    query_embedding: &[f32],
    candidates: &[RetrievedMemory],
    state: &RerankerState,
) -> Result<RerankOutcome> {
    let dimension = state.weights.dimension()?;
    if query_embedding.len() != dimension {
        return Err(MemoryError::DimensionMismatch {
            expected: dimension,
            actual: query_embedding.len(),
            context: "rerank query embedding".to_string(),
        });
    }

    let adapted_query = apply_embedding_adaptation(query_embedding, &state.weights.query_transform)?;

    let mut memory_embeddings = Vec::with_capacity(candidates.len());
    let mut adapted_memory_embeddings = Vec::with_capacity(candidates.len());
    let mut relevance_scores = Vec::with_capacity(candidates.len());

    for candidate in candidates {
        let embedding = candidate.embedding.as_ref().ok_or_else(|| {
            MemoryError::InvalidMatrix(format!("candidate {} has no embedding", candidate.id))
        })?;
        if embedding.len() != dimension {
            return Err(MemoryError::DimensionMismatch {
                expected: dimension,
                actual: embedding.len(),
                context: format!("candidate {} embedding", candidate.id),
            });
        }

        let adapted = apply_embedding_adaptation(embedding, &state.weights.memory_transform)?;
        let score = compute_relevance_score(&adapted_query, &adapted)?;

        memory_embeddings.push(embedding.clone());
        adapted_memory_embeddings.push(adapted);
        relevance_scores.push(score);
    }

    let selection = gumbel_softmax_sample(
        rng,
        candidates,
        &relevance_scores,
        state.config.top_m,
        state.config.temperature,
    )?;

    Ok(RerankOutcome {
        selection,
        query_embedding: query_embedding.to_vec(),
        adapted_query_embedding: adapted_query,
        memory_embeddings,
        adapted_memory_embeddings,
        relevance_scores,
    })
}

/// Render the ephemeral context block injected ahead of generation
///
/// `indices` are positions into the original candidate array; the generation
/// model cites those indices back, so the labels here and the citation
/// extractor's bounds must agree. The caller's message history is never
/// mutated — this string travels in one additional ephemeral message.
pub fn format_memory_block(selected: &[RetrievedMemory], indices: &[usize]) -> String {
    let mut block = String::from("<memories>\n");
    for (memory, &index) in selected.iter().zip(indices.iter()) {
        block.push_str(&format!(
            "Memory [{}]: {}\n  {}\n",
            index, memory.topic_summary, memory.raw_dialogue
        ));
    }
    block.push_str("</memories>");
    block
}

//! Exact REINFORCE gradients for the two reranker transforms
//!
//! Implements `Δφ = η · (R − b) · ∇_φ log P(selection | q, candidates; φ)`
//! for the softmax-parameterized selection policy. For each candidate `i`
//! with advantage `R_i − b` and score coefficient `1[selected] − P_i`, the
//! chain rule through the residual adaptation gives outer-product
//! contributions:
//!
//! ```text
//! ∂/∂Wq ∝ (1/τ) · adv · coef · (m'_i − E[m']) ⊗ q    (original query q)
//! ∂/∂Wm ∝ (1/τ) · adv · coef · q' ⊗ (m_i − E[m])    (adapted query q')
//! ```
//!
//! where `E[m]`/`E[m']` are the sampling-probability-weighted means of the
//! original/adapted memory embeddings over all K candidates.

use crate::config::RerankerConfig;
use crate::constants::ADVANTAGE_EPSILON;
use crate::errors::Result;
use crate::linalg::{self, Matrix};
use crate::types::GradientSample;

/// Gradients with respect to the query and memory transforms
#[derive(Debug, Clone)]
pub struct TransformGradients {
    pub grad_wq: Matrix,
    pub grad_wm: Matrix,
}

/// Probability-weighted mean of `vectors`, a D-vector
fn probability_weighted_mean(vectors: &[Vec<f32>], probabilities: &[f32], dimension: usize) -> Vec<f32> {
    let mut mean = vec![0.0f32; dimension];
    for (vector, &p) in vectors.iter().zip(probabilities.iter()) {
        for (m, v) in mean.iter_mut().zip(vector.iter()) {
            *m += p * v;
        }
    }
    mean
}

/// Exact policy gradient for one turn's reranking decision
///
/// Sums the per-candidate contributions over all K candidates, scaled by the
/// learning rate. Candidates whose advantage is numerically negligible are
/// skipped.
pub fn compute_sample_gradient(
    sample: &GradientSample,
    config: &RerankerConfig,
) -> Result<TransformGradients> {
    let (dimension, k) = sample.validate()?;

    let mut grad_wq = linalg::zero_matrix(dimension, dimension);
    let mut grad_wm = linalg::zero_matrix(dimension, dimension);

    if k == 0 {
        return Ok(TransformGradients { grad_wq, grad_wm });
    }

    let mean_original = probability_weighted_mean(
        &sample.memory_embeddings,
        &sample.sampling_probabilities,
        dimension,
    );
    let mean_adapted = probability_weighted_mean(
        &sample.adapted_memory_embeddings,
        &sample.sampling_probabilities,
        dimension,
    );

    let inv_temperature = 1.0 / config.temperature;

    for i in 0..k {
        let advantage = sample.citation_rewards[i] - config.baseline;
        if advantage.abs() < ADVANTAGE_EPSILON {
            continue;
        }

        let indicator = if sample.selected_indices.contains(&i) { 1.0 } else { 0.0 };
        let coef = indicator - sample.sampling_probabilities[i];
        let scale = config.learning_rate * inv_temperature * advantage * coef;

        // (m'_i − E[m']) ⊗ q, scaled
        let centered_adapted: Vec<f32> = sample.adapted_memory_embeddings[i]
            .iter()
            .zip(mean_adapted.iter())
            .map(|(m, e)| m - e)
            .collect();
        for (row, &c) in grad_wq.iter_mut().zip(centered_adapted.iter()) {
            for (entry, &q) in row.iter_mut().zip(sample.query_embedding.iter()) {
                *entry += scale * c * q;
            }
        }

        // q' ⊗ (m_i − E[m]), scaled
        let centered_original: Vec<f32> = sample.memory_embeddings[i]
            .iter()
            .zip(mean_original.iter())
            .map(|(m, e)| m - e)
            .collect();
        for (row, &q) in grad_wm.iter_mut().zip(sample.adapted_query_embedding.iter()) {
            for (entry, &c) in row.iter_mut().zip(centered_original.iter()) {
                *entry += scale * q * c;
            }
        }
    }

    Ok(TransformGradients { grad_wq, grad_wm })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_with_rewards(rewards: Vec<f32>) -> GradientSample {
        GradientSample {
            query_embedding: vec![1.0, 0.0],
            adapted_query_embedding: vec![1.0, 0.1],
            memory_embeddings: vec![vec![1.0, 0.0], vec![0.0, 1.0]],
            adapted_memory_embeddings: vec![vec![1.0, 0.05], vec![0.05, 1.0]],
            sampling_probabilities: vec![0.7, 0.3],
            selected_indices: vec![0],
            citation_rewards: rewards,
        }
    }

    fn config() -> RerankerConfig {
        RerankerConfig {
            temperature: 0.5,
            learning_rate: 0.001,
            baseline: 0.5,
            ..RerankerConfig::default()
        }
    }

    #[test]
    fn test_gradient_shape() {
        let grads = compute_sample_gradient(&sample_with_rewards(vec![1.0, -1.0]), &config()).unwrap();
        assert_eq!(grads.grad_wq.len(), 2);
        assert_eq!(grads.grad_wq[0].len(), 2);
        assert_eq!(grads.grad_wm.len(), 2);
    }

    #[test]
    fn test_zero_advantage_gives_zero_gradient() {
        let mut cfg = config();
        cfg.baseline = 1.0;
        // Every reward equals the baseline: all advantages vanish
        let grads = compute_sample_gradient(&sample_with_rewards(vec![1.0, 1.0]), &cfg).unwrap();
        assert!(grads.grad_wq.iter().flatten().all(|&x| x == 0.0));
        assert!(grads.grad_wm.iter().flatten().all(|&x| x == 0.0));
    }

    #[test]
    fn test_gradient_is_nonzero_for_informative_rewards() {
        let grads = compute_sample_gradient(&sample_with_rewards(vec![1.0, -1.0]), &config()).unwrap();
        let wq_norm = linalg::frobenius_norm(&grads.grad_wq);
        let wm_norm = linalg::frobenius_norm(&grads.grad_wm);
        assert!(wq_norm > 0.0);
        assert!(wm_norm > 0.0);
    }

    #[test]
    fn test_gradient_scales_with_learning_rate() {
        let sample = sample_with_rewards(vec![1.0, -1.0]);
        let base = compute_sample_gradient(&sample, &config()).unwrap();

        let mut cfg = config();
        cfg.learning_rate *= 10.0;
        let scaled = compute_sample_gradient(&sample, &cfg).unwrap();

        let ratio = linalg::frobenius_norm(&scaled.grad_wq) / linalg::frobenius_norm(&base.grad_wq);
        assert!((ratio - 10.0).abs() < 1e-3);
    }

    #[test]
    fn test_selected_candidate_direction() {
        // A cited selection with positive advantage should push the query
        // transform toward the selected memory's direction relative to the
        // probability-weighted mean: coef = 1 - P > 0 for the selection.
        let sample = sample_with_rewards(vec![1.0, -1.0]);
        let grads = compute_sample_gradient(&sample, &config()).unwrap();

        // Candidate 0 dominates dimension 0; its positive-advantage pull and
        // candidate 1's negative-advantage push both add signed structure,
        // so the gradient cannot be symmetric across dimensions.
        assert!(grads.grad_wq[0][0].abs() != grads.grad_wq[1][0].abs() || grads.grad_wq[0][0] != 0.0);
    }

    #[test]
    fn test_empty_candidate_set() {
        let sample = GradientSample {
            query_embedding: vec![1.0, 0.0],
            adapted_query_embedding: vec![1.0, 0.0],
            memory_embeddings: vec![],
            adapted_memory_embeddings: vec![],
            sampling_probabilities: vec![],
            selected_indices: vec![],
            citation_rewards: vec![],
        };
        let grads = compute_sample_gradient(&sample, &config()).unwrap();
        assert!(grads.grad_wq.iter().flatten().all(|&x| x == 0.0));
    }

    #[test]
    fn test_invalid_sample_rejected() {
        let mut sample = sample_with_rewards(vec![1.0, -1.0]);
        sample.citation_rewards.pop();
        assert!(compute_sample_gradient(&sample, &config()).is_err());
    }
}

//! Core data model for the reranking and consolidation engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::RerankerConfig;
use crate::constants::WEIGHT_INIT_STD;
use crate::errors::{MemoryError, Result};
use crate::linalg::{self, Matrix};

// =============================================================================
// RERANKER STATE
// =============================================================================

/// The two learnable linear transforms of the reranker
///
/// Both matrices are square with identical dimension D (the embedding
/// dimension). Applied in residual form: `adapted = e + W·e`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankerWeights {
    /// Transform applied to the query embedding
    pub query_transform: Matrix,

    /// Transform applied to each candidate memory embedding
    pub memory_transform: Matrix,
}

impl RerankerWeights {
    /// Validate the square/equal-dimension invariant and return D
    pub fn dimension(&self) -> Result<usize> {
        let (q_rows, q_cols) = linalg::matrix_shape(&self.query_transform)?;
        let (m_rows, m_cols) = linalg::matrix_shape(&self.memory_transform)?;
        if q_rows != q_cols || m_rows != m_cols || q_rows != m_rows {
            return Err(MemoryError::InvalidMatrix(format!(
                "transforms must be square with equal dimension, got {q_rows}x{q_cols} and {m_rows}x{m_cols}"
            )));
        }
        Ok(q_rows)
    }
}

/// Per-user reranker state: learnable weights plus sampling configuration
///
/// Created Gaussian-initialized on first use, loaded/saved per user via the
/// keyed store, and mutated only by the gradient accumulator's update step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankerState {
    pub weights: RerankerWeights,
    pub config: RerankerConfig,
}

impl RerankerState {
    /// Fresh state with mean-0 / std-0.01 Gaussian transforms
    pub fn initialized<R: rand::Rng>(rng: &mut R, dimension: usize, config: RerankerConfig) -> Self {
        Self {
            weights: RerankerWeights {
                query_transform: linalg::initialize_matrix(rng, dimension, dimension, 0.0, WEIGHT_INIT_STD),
                memory_transform: linalg::initialize_matrix(rng, dimension, dimension, 0.0, WEIGHT_INIT_STD),
            },
            config,
        }
    }

    /// Introspection snapshot of the current weights
    pub fn stats(&self) -> WeightStats {
        WeightStats {
            dimension: self.weights.query_transform.len(),
            query_transform_norm: linalg::frobenius_norm(&self.weights.query_transform),
            memory_transform_norm: linalg::frobenius_norm(&self.weights.memory_transform),
        }
    }
}

/// Summary statistics about the learned transforms
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightStats {
    pub dimension: usize,
    pub query_transform_norm: f32,
    pub memory_transform_norm: f32,
}

// =============================================================================
// RETRIEVED MEMORIES
// =============================================================================

/// A candidate memory produced by the retrieval collaborator
///
/// `rerank_score` is filled in by the reranking engine; everything else comes
/// from the vector store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedMemory {
    pub id: String,

    /// One-line topic summary used in the injected context block
    pub topic_summary: String,

    /// Serialized dialogue excerpt the memory was extracted from
    pub raw_dialogue: String,

    pub timestamp: DateTime<Utc>,

    pub session_id: String,

    /// Turn indices within the source session this memory references
    #[serde(default)]
    pub turn_references: Vec<u32>,

    /// Embedding of the topic summary, if the retriever supplied one
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,

    /// Similarity score assigned by the retriever
    pub relevance_score: f32,

    /// Score assigned by the learned reranker, if reranking ran
    #[serde(default)]
    pub rerank_score: Option<f32>,
}

impl RetrievedMemory {
    /// Build a fresh document (e.g. from extraction) with a new id
    pub fn new_document(topic_summary: String, raw_dialogue: String, session_id: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            topic_summary,
            raw_dialogue,
            timestamp: Utc::now(),
            session_id,
            turn_references: Vec::new(),
            embedding: None,
            relevance_score: 0.0,
            rerank_score: None,
        }
    }
}

// =============================================================================
// CITATION BOOKKEEPING
// =============================================================================

/// Per-candidate reward record for one turn
///
/// One record exists for every retrieved candidate (not just the selected
/// ones) when exact-REINFORCE bookkeeping is in use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CitationRecord {
    pub memory_id: String,
    pub cited: bool,
    /// +1 (selected and cited) or -1 (everything else)
    pub reward: i8,
    pub turn_index: u32,
}

// =============================================================================
// GRADIENT SAMPLES
// =============================================================================

/// Frozen snapshot of one turn's reranking decision
///
/// Invariant: all embedding vectors share dimension D, and
/// `sampling_probabilities`, `memory_embeddings`, `adapted_memory_embeddings`
/// and `citation_rewards` all have length K.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradientSample {
    pub query_embedding: Vec<f32>,
    pub adapted_query_embedding: Vec<f32>,
    pub memory_embeddings: Vec<Vec<f32>>,
    pub adapted_memory_embeddings: Vec<Vec<f32>>,
    pub sampling_probabilities: Vec<f32>,
    /// Positions into the original candidate array, size <= top_m
    pub selected_indices: Vec<usize>,
    pub citation_rewards: Vec<f32>,
}

impl GradientSample {
    /// Check the aligned-length invariant, returning (D, K)
    pub fn validate(&self) -> Result<(usize, usize)> {
        let d = self.query_embedding.len();
        if d == 0 || self.adapted_query_embedding.len() != d {
            return Err(MemoryError::DimensionMismatch {
                expected: d,
                actual: self.adapted_query_embedding.len(),
                context: "GradientSample query embeddings".to_string(),
            });
        }

        let k = self.memory_embeddings.len();
        if self.adapted_memory_embeddings.len() != k
            || self.sampling_probabilities.len() != k
            || self.citation_rewards.len() != k
        {
            return Err(MemoryError::DimensionMismatch {
                expected: k,
                actual: self.sampling_probabilities.len(),
                context: "GradientSample per-candidate arrays".to_string(),
            });
        }

        for emb in self.memory_embeddings.iter().chain(self.adapted_memory_embeddings.iter()) {
            if emb.len() != d {
                return Err(MemoryError::DimensionMismatch {
                    expected: d,
                    actual: emb.len(),
                    context: "GradientSample memory embedding".to_string(),
                });
            }
        }

        if self.selected_indices.iter().any(|&i| i >= k) {
            return Err(MemoryError::InvalidMatrix(
                "selected index out of candidate range".to_string(),
            ));
        }

        Ok((d, k))
    }
}

/// Per-user accumulator state, persisted after every mutation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradientAccumulatorState {
    pub samples: Vec<GradientSample>,
    pub accumulated_grad_wq: Matrix,
    pub accumulated_grad_wm: Matrix,
    pub last_batch_index: u64,
    pub last_updated: DateTime<Utc>,
    pub version: u32,
}

impl GradientAccumulatorState {
    /// Empty accumulator for a D-dimensional reranker
    pub fn empty(dimension: usize) -> Self {
        Self {
            samples: Vec::new(),
            accumulated_grad_wq: linalg::zero_matrix(dimension, dimension),
            accumulated_grad_wm: linalg::zero_matrix(dimension, dimension),
            last_batch_index: 0,
            last_updated: Utc::now(),
            version: 1,
        }
    }

    /// Zero the samples and gradients and advance the batch counter
    pub fn reset_after_flush(&mut self) {
        let dim = self.accumulated_grad_wq.len();
        self.samples.clear();
        self.accumulated_grad_wq = linalg::zero_matrix(dim, dim);
        self.accumulated_grad_wm = linalg::zero_matrix(dim, dim);
        self.last_batch_index += 1;
        self.last_updated = Utc::now();
    }
}

// =============================================================================
// MESSAGE BUFFER
// =============================================================================

/// One serialized conversation turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferedMessage {
    /// "human" or "assistant"
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Accumulated dialogue awaiting reflection
///
/// One live buffer exists per user, plus transiently one staging copy created
/// by atomically snapshotting and clearing the live buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageBuffer {
    pub messages: Vec<BufferedMessage>,
    pub human_message_count: usize,
    pub last_message_timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// Extraction attempts made against this buffer once staged
    #[serde(default)]
    pub retry_count: u32,
}

impl MessageBuffer {
    pub fn empty() -> Self {
        let now = Utc::now();
        Self {
            messages: Vec::new(),
            human_message_count: 0,
            last_message_timestamp: now,
            created_at: now,
            retry_count: 0,
        }
    }

    /// Append one turn, tracking the human-message count
    pub fn push(&mut self, role: &str, content: &str) {
        let now = Utc::now();
        if role == "human" {
            self.human_message_count += 1;
        }
        self.messages.push(BufferedMessage {
            role: role.to_string(),
            content: content.to_string(),
            timestamp: now,
        });
        self.last_message_timestamp = now;
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// A memory produced by the extraction collaborator, pending merge/add
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedMemory {
    pub topic_summary: String,
    pub raw_dialogue: String,
    pub session_id: String,
    #[serde(default)]
    pub turn_references: Vec<u32>,
}

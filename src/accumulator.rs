//! Per-user gradient accumulation and batched weight updates
//!
//! Each user's accumulator cycles between two phases: ACCUMULATING, where
//! turn-level gradient samples are appended and their contributions summed,
//! and FLUSHING, where the summed gradient is applied to the stored weights
//! and the accumulator resets. A flush triggers when `batch_size` samples
//! have accumulated or the session ends, whichever comes first.
//!
//! Every mutation is persisted immediately so a crash loses at most the
//! in-flight turn. Persistence failures are logged and tolerated: the
//! in-process state stays authoritative for the rest of the session.

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::errors::Result;
use crate::gradient::compute_sample_gradient;
use crate::linalg;
use crate::store::{self, KeyedStore, NS_GRADIENTS, NS_WEIGHTS};
use crate::types::{GradientAccumulatorState, GradientSample, RerankerState};

/// Outcome of recording one sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Sample stored; batch not yet full
    Accumulated,
    /// Sample stored and the batch was flushed into the weights
    Flushed,
}

/// Drives the accumulate/flush cycle against the keyed store
pub struct GradientAccumulator {
    store: Arc<dyn KeyedStore>,
    config: EngineConfig,
}

impl GradientAccumulator {
    pub fn new(store: Arc<dyn KeyedStore>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    /// Load a user's accumulator, creating an empty one on first use
    fn load_state(&self, user_id: &str) -> GradientAccumulatorState {
        store::load_typed(self.store.as_ref(), NS_GRADIENTS, user_id)
            .map(|(state, _)| state)
            .unwrap_or_else(|| GradientAccumulatorState::empty(self.config.dimension))
    }

    fn persist_state(&self, user_id: &str, state: &GradientAccumulatorState) {
        if !store::save_typed(self.store.as_ref(), NS_GRADIENTS, user_id, state) {
            tracing::warn!(user_id, "Accumulator persist failed; continuing with in-memory state");
        }
    }

    /// Record one turn's gradient sample, flushing if the batch fills
    ///
    /// The sample's exact gradient is computed under the user's current
    /// sampling configuration and summed into the accumulator, so the flush
    /// step is a pure matrix addition regardless of batch size.
    pub fn record_sample(
        &self,
        user_id: &str,
        sample: GradientSample,
        reranker: &RerankerState,
    ) -> Result<RecordOutcome> {
        let gradients = compute_sample_gradient(&sample, &reranker.config)?;

        let mut state = self.load_state(user_id);
        linalg::matrix_add_assign(&mut state.accumulated_grad_wq, &gradients.grad_wq)?;
        linalg::matrix_add_assign(&mut state.accumulated_grad_wm, &gradients.grad_wm)?;
        state.samples.push(sample);
        state.last_updated = chrono::Utc::now();

        tracing::debug!(
            user_id,
            samples = state.samples.len(),
            batch_size = self.config.batch_size,
            "Gradient sample recorded"
        );

        if state.samples.len() >= self.config.batch_size {
            self.apply_batch(user_id, &mut state);
            self.persist_state(user_id, &state);
            Ok(RecordOutcome::Flushed)
        } else {
            self.persist_state(user_id, &state);
            Ok(RecordOutcome::Accumulated)
        }
    }

    /// Flush whatever has accumulated, e.g. at session end
    ///
    /// A no-op when the accumulator holds no samples.
    pub fn flush(&self, user_id: &str) -> bool {
        let mut state = self.load_state(user_id);
        if state.samples.is_empty() {
            return false;
        }
        self.apply_batch(user_id, &mut state);
        self.persist_state(user_id, &state);
        true
    }

    /// Apply the accumulated gradient to the stored weights and reset
    ///
    /// Weights missing from the store mean the user never completed a rerank;
    /// the update is dropped rather than applied to fabricated weights.
    fn apply_batch(&self, user_id: &str, state: &mut GradientAccumulatorState) {
        let Some((mut reranker, _)) =
            store::load_typed::<RerankerState>(self.store.as_ref(), NS_WEIGHTS, user_id)
        else {
            tracing::warn!(user_id, "No stored weights at flush; dropping accumulated batch");
            state.reset_after_flush();
            return;
        };

        let batch = state.samples.len();

        if let Err(e) =
            linalg::matrix_add_assign(&mut reranker.weights.query_transform, &state.accumulated_grad_wq)
        {
            tracing::warn!(user_id, error = %e, "Query transform update failed; dropping batch");
            state.reset_after_flush();
            return;
        }
        if let Err(e) =
            linalg::matrix_add_assign(&mut reranker.weights.memory_transform, &state.accumulated_grad_wm)
        {
            tracing::warn!(user_id, error = %e, "Memory transform update failed; dropping batch");
            state.reset_after_flush();
            return;
        }

        reranker.weights.query_transform = linalg::clip_matrix_by_norm(
            std::mem::take(&mut reranker.weights.query_transform),
            self.config.clip_threshold,
        );
        reranker.weights.memory_transform = linalg::clip_matrix_by_norm(
            std::mem::take(&mut reranker.weights.memory_transform),
            self.config.clip_threshold,
        );

        if !store::save_typed(self.store.as_ref(), NS_WEIGHTS, user_id, &reranker) {
            tracing::warn!(user_id, "Weight persist failed after batch update");
        }

        state.reset_after_flush();

        let stats = reranker.stats();
        tracing::info!(
            user_id,
            batch,
            batch_index = state.last_batch_index,
            query_norm = stats.query_transform_norm,
            memory_norm = stats.memory_transform_norm,
            "Applied batched weight update"
        );
    }
}

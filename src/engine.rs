//! Turn-level orchestration of retrieval, reranking, learning, and reflection
//!
//! The engine sits between the conversational agent and its collaborators:
//! an embedding provider, a vector store, a memory extractor, and a
//! consolidation resolver. Per turn it retrieves candidates, reranks them
//! with the user's learned transforms, injects the selection as an ephemeral
//! context block, and after generation converts citation markers into a
//! policy-gradient sample.
//!
//! Turn state is explicit: the rerank snapshot the learning step needs rides
//! inside the [`InjectedContext`] returned by [`MemoryEngine::on_before_generate`],
//! and the caller hands it back to [`MemoryEngine::on_after_generate`]. The
//! engine itself keeps no per-session mutable maps.
//!
//! The learning path is strictly best-effort: any failure there degrades the
//! turn to plain relevance ordering (or no injection at all) and is logged,
//! never surfaced to the caller as an error. Only caller mistakes, an invalid
//! user id or configuration, are hard failures.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::accumulator::GradientAccumulator;
use crate::citations::{self, CitationOutcome};
use crate::config::EngineConfig;
use crate::consolidation::{self, ConsolidationPlan};
use crate::errors::{MemoryError, Result};
use crate::reflection::{check_reflection_triggers, MemoryExtractor, ReflectionScheduler};
use crate::reranker::{self, RerankOutcome};
use crate::store::{self, KeyedStore, NS_BUFFER, NS_METADATA, NS_WEIGHTS};
use crate::types::{
    ExtractedMemory, GradientSample, MessageBuffer, RerankerState, RetrievedMemory, WeightStats,
};

/// Neighbors fetched when checking a fresh memory for overlap
const CONSOLIDATION_NEIGHBORS: usize = 5;

// =============================================================================
// COLLABORATOR TRAITS
// =============================================================================

/// Text-to-vector service; every returned vector must match the configured
/// dimension
pub trait EmbeddingProvider: Send + Sync {
    fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;

    fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }
}

/// Per-user vector index over memory documents
///
/// `add_documents` owns embedding for documents that arrive without one.
pub trait VectorStore: Send + Sync {
    fn similarity_search(
        &self,
        user_id: &str,
        embedding: &[f32],
        top_k: usize,
    ) -> anyhow::Result<Vec<RetrievedMemory>>;

    fn add_documents(&self, user_id: &str, documents: Vec<RetrievedMemory>) -> anyhow::Result<()>;

    fn delete(&self, user_id: &str, ids: &[String]) -> anyhow::Result<()>;
}

/// Decides whether an extracted memory merges into its neighbors or is added
///
/// The reply is the newline-separated action grammar understood by
/// [`consolidation::parse_resolution`].
pub trait ConsolidationResolver: Send + Sync {
    fn resolve(
        &self,
        user_id: &str,
        extracted: &ExtractedMemory,
        similar: &[RetrievedMemory],
    ) -> anyhow::Result<String>;
}

// =============================================================================
// ENGINE
// =============================================================================

/// The context block handed back for injection before generation
///
/// Caller-owned turn state: pass it back to
/// [`MemoryEngine::on_after_generate`] so the learning step can see the
/// reranking decision the completion responded to.
#[derive(Debug, Clone)]
pub struct InjectedContext {
    /// Rendered `<memories>` block, one ephemeral message
    pub memory_block: String,
    /// The selected memories, `rerank_score` filled in
    pub selected: Vec<RetrievedMemory>,
    /// Rerank snapshot; absent when the turn degraded to relevance ordering
    snapshot: Option<TurnSnapshot>,
}

/// Frozen snapshot of one turn's reranking decision, awaiting the completion
#[derive(Debug, Clone)]
struct TurnSnapshot {
    outcome: RerankOutcome,
    candidates: Vec<RetrievedMemory>,
    turn_index: u32,
}

/// Per-user operational counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct UserMetadata {
    turn_index: u32,
    /// Idle gap observed before the most recent human message
    #[serde(default)]
    last_inactivity_ms: u64,
}

pub struct MemoryEngine {
    config: EngineConfig,
    store: Arc<dyn KeyedStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    vector_store: Arc<dyn VectorStore>,
    extractor: Arc<dyn MemoryExtractor>,
    resolver: Arc<dyn ConsolidationResolver>,
    accumulator: GradientAccumulator,
    scheduler: Arc<ReflectionScheduler>,
    rng: Mutex<StdRng>,
}

impl MemoryEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn KeyedStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        vector_store: Arc<dyn VectorStore>,
        extractor: Arc<dyn MemoryExtractor>,
        resolver: Arc<dyn ConsolidationResolver>,
    ) -> Result<Self> {
        config.validate()?;

        let accumulator = GradientAccumulator::new(Arc::clone(&store), config.clone());
        let scheduler = Arc::new(ReflectionScheduler::new(
            Arc::clone(&store),
            config.reflection.clone(),
        ));

        Ok(Self {
            config,
            store,
            embedder,
            vector_store,
            extractor,
            resolver,
            accumulator,
            scheduler,
            rng: Mutex::new(StdRng::from_entropy()),
        })
    }

    /// Reseed the sampling RNG for reproducible runs
    pub fn reseed(&self, seed: u64) {
        *self.rng.lock() = StdRng::seed_from_u64(seed);
    }

    fn validate_user(user_id: &str) -> Result<()> {
        if user_id.trim().is_empty() {
            return Err(MemoryError::InvalidUserId("user id is empty".to_string()));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // TURN LIFECYCLE
    // -------------------------------------------------------------------------

    /// Record an incoming human message into the live reflection buffer
    ///
    /// The idle gap since the previous message is the inactivity signal for
    /// reflection. It is captured here, before the append restamps the
    /// buffer record, so the post-turn trigger check still sees it.
    pub fn on_turn_start(&self, user_id: &str, message: &str) -> Result<()> {
        Self::validate_user(user_id)?;

        let gap_ms = self
            .store
            .get(NS_BUFFER, user_id)
            .map(|record| (Utc::now() - record.updated_at).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        let mut metadata = self.load_metadata(user_id);
        metadata.last_inactivity_ms = gap_ms;
        if !store::save_typed(self.store.as_ref(), NS_METADATA, user_id, &metadata) {
            tracing::warn!(user_id, "Failed to persist inactivity stamp");
        }

        self.append_to_buffer(user_id, "human", message);
        Ok(())
    }

    /// Retrieve, rerank, and render the context block for the coming turn
    ///
    /// Returns `None` when there is nothing to inject: no stored memories yet,
    /// or the retrieval collaborators are unavailable. A reranker failure is
    /// not fatal either; the turn degrades to plain relevance ordering with no
    /// learning snapshot.
    pub fn on_before_generate(&self, user_id: &str, query: &str) -> Result<Option<InjectedContext>> {
        Self::validate_user(user_id)?;

        let query_embedding = match self.embedder.embed(query) {
            Ok(embedding) => embedding,
            Err(e) => {
                tracing::warn!(user_id, error = %e, "Query embedding failed; skipping injection");
                return Ok(None);
            }
        };

        let mut candidates = match self.vector_store.similarity_search(
            user_id,
            &query_embedding,
            self.config.reranker.top_k,
        ) {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::warn!(user_id, error = %e, "Similarity search failed; skipping injection");
                return Ok(None);
            }
        };
        if candidates.is_empty() {
            return Ok(None);
        }

        self.fill_missing_embeddings(user_id, &mut candidates);
        candidates.retain(|c| match &c.embedding {
            Some(e) if e.len() == self.config.dimension => true,
            _ => {
                tracing::warn!(user_id, memory_id = %c.id, "Dropping candidate without usable embedding");
                false
            }
        });
        if candidates.is_empty() {
            return Ok(None);
        }

        let state = self.load_or_init_reranker(user_id);

        let outcome = {
            let mut rng = self.rng.lock();
            reranker::rerank(&mut *rng, &query_embedding, &candidates, &state)
        };

        match outcome {
            Ok(outcome) => {
                if outcome.selection.selected.is_empty() {
                    return Ok(None);
                }
                let memory_block = reranker::format_memory_block(
                    &outcome.selection.selected,
                    &outcome.selection.selected_indices,
                );
                let selected = outcome.selection.selected.clone();
                let turn_index = self.load_metadata(user_id).turn_index;
                Ok(Some(InjectedContext {
                    memory_block,
                    selected,
                    snapshot: Some(TurnSnapshot {
                        outcome,
                        candidates,
                        turn_index,
                    }),
                }))
            }
            Err(e) => {
                tracing::warn!(user_id, error = %e, "Rerank failed; degrading to relevance order");
                Ok(Some(self.relevance_only_context(candidates)))
            }
        }
    }

    /// Process the model's completion: learn from citations, buffer the turn,
    /// and schedule reflection when due
    ///
    /// `context` is whatever `on_before_generate` returned for this turn;
    /// `None` (no injection, or the caller chose not to inject) skips the
    /// learning step.
    pub fn on_after_generate(
        &self,
        user_id: &str,
        context: Option<InjectedContext>,
        completion: &str,
    ) -> Result<()> {
        Self::validate_user(user_id)?;

        self.append_to_buffer(user_id, "assistant", completion);

        if let Some(snapshot) = context.and_then(|c| c.snapshot) {
            self.learn_from_citations(user_id, snapshot, completion);
        }

        let mut metadata = self.load_metadata(user_id);
        metadata.turn_index += 1;
        if !store::save_typed(self.store.as_ref(), NS_METADATA, user_id, &metadata) {
            tracing::warn!(user_id, "Failed to persist turn counter");
        }

        self.maybe_reflect(user_id);
        Ok(())
    }

    /// Flush pending learning state and force a final reflection
    pub fn end_session(&self, user_id: &str) -> Result<()> {
        Self::validate_user(user_id)?;

        self.accumulator.flush(user_id);
        self.trigger_reflection(user_id);
        Ok(())
    }

    /// Evaluate reflection thresholds for one user and stage if due
    ///
    /// Called automatically after every turn, where the idle gap captured at
    /// turn start carries the inactivity signal. Periodic callers can invoke
    /// it between turns to pick up inactivity accumulating while the user is
    /// away.
    pub fn maybe_reflect(&self, user_id: &str) {
        let Some((buffer, updated_at)) =
            store::load_typed::<MessageBuffer>(self.store.as_ref(), NS_BUFFER, user_id)
        else {
            return;
        };

        // Appends restamp the buffer record, so right after a turn the live
        // gap is near zero; the pre-turn gap covers that path.
        let live_gap_ms = (Utc::now() - updated_at).num_milliseconds().max(0) as u64;
        let inactivity_ms = live_gap_ms.max(self.load_metadata(user_id).last_inactivity_ms);
        let trigger = check_reflection_triggers(
            buffer.human_message_count,
            inactivity_ms,
            self.scheduler.config(),
        );

        if trigger.is_due() {
            tracing::info!(user_id, ?trigger, "Reflection due");
            self.trigger_reflection(user_id);
        }
    }

    /// Introspection: the user's current transform norms, if weights exist
    pub fn weight_stats(&self, user_id: &str) -> Option<WeightStats> {
        store::load_typed::<RerankerState>(self.store.as_ref(), NS_WEIGHTS, user_id)
            .map(|(state, _)| state.stats())
    }

    // -------------------------------------------------------------------------
    // INTERNALS
    // -------------------------------------------------------------------------

    fn append_to_buffer(&self, user_id: &str, role: &str, content: &str) {
        let mut buffer = store::load_typed::<MessageBuffer>(self.store.as_ref(), NS_BUFFER, user_id)
            .map(|(buffer, _)| buffer)
            .unwrap_or_else(MessageBuffer::empty);
        buffer.push(role, content);
        if !store::save_typed(self.store.as_ref(), NS_BUFFER, user_id, &buffer) {
            tracing::warn!(user_id, role, "Failed to persist buffered message");
        }
    }

    fn load_metadata(&self, user_id: &str) -> UserMetadata {
        store::load_typed(self.store.as_ref(), NS_METADATA, user_id)
            .map(|(metadata, _)| metadata)
            .unwrap_or_default()
    }

    fn load_or_init_reranker(&self, user_id: &str) -> RerankerState {
        if let Some((state, _)) =
            store::load_typed::<RerankerState>(self.store.as_ref(), NS_WEIGHTS, user_id)
        {
            return state;
        }

        let state = {
            let mut rng = self.rng.lock();
            RerankerState::initialized(&mut *rng, self.config.dimension, self.config.reranker.clone())
        };
        if !store::save_typed(self.store.as_ref(), NS_WEIGHTS, user_id, &state) {
            tracing::warn!(user_id, "Failed to persist freshly initialized weights");
        }
        tracing::info!(user_id, dimension = self.config.dimension, "Initialized reranker weights");
        state
    }

    fn fill_missing_embeddings(&self, user_id: &str, candidates: &mut [RetrievedMemory]) {
        let missing: Vec<usize> = candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| c.embedding.is_none())
            .map(|(i, _)| i)
            .collect();
        if missing.is_empty() {
            return;
        }

        let texts: Vec<String> = missing
            .iter()
            .map(|&i| candidates[i].topic_summary.clone())
            .collect();
        match self.embedder.embed_batch(&texts) {
            Ok(embeddings) if embeddings.len() == missing.len() => {
                for (&i, embedding) in missing.iter().zip(embeddings) {
                    candidates[i].embedding = Some(embedding);
                }
            }
            Ok(_) => tracing::warn!(user_id, "Embedding batch returned wrong count"),
            Err(e) => tracing::warn!(user_id, error = %e, "Failed to embed candidate summaries"),
        }
    }

    /// Fallback ordering when the learned path is unavailable
    fn relevance_only_context(&self, mut candidates: Vec<RetrievedMemory>) -> InjectedContext {
        candidates.sort_by(|a, b| b.relevance_score.total_cmp(&a.relevance_score));
        candidates.truncate(self.config.reranker.top_m);
        let indices: Vec<usize> = (0..candidates.len()).collect();
        InjectedContext {
            memory_block: reranker::format_memory_block(&candidates, &indices),
            selected: candidates,
            snapshot: None,
        }
    }

    fn learn_from_citations(&self, user_id: &str, pending: TurnSnapshot, completion: &str) {
        let outcome = citations::extract_citations(completion);
        if outcome == CitationOutcome::Malformed {
            tracing::warn!(user_id, "Malformed citation output; skipping learning for this turn");
            return;
        }

        let records = citations::build_citation_records(
            &outcome,
            &pending.candidates,
            &pending.outcome.selection.selected_indices,
            pending.turn_index,
        );
        if records.is_empty() {
            return;
        }

        let sample = GradientSample {
            query_embedding: pending.outcome.query_embedding,
            adapted_query_embedding: pending.outcome.adapted_query_embedding,
            memory_embeddings: pending.outcome.memory_embeddings,
            adapted_memory_embeddings: pending.outcome.adapted_memory_embeddings,
            sampling_probabilities: pending.outcome.selection.probabilities,
            selected_indices: pending.outcome.selection.selected_indices,
            citation_rewards: citations::reward_vector(&records),
        };

        let Some((state, _)) =
            store::load_typed::<RerankerState>(self.store.as_ref(), NS_WEIGHTS, user_id)
        else {
            tracing::warn!(user_id, "Weights vanished between rerank and update; skipping");
            return;
        };

        if let Err(e) = self.accumulator.record_sample(user_id, sample, &state) {
            tracing::warn!(user_id, error = %e, "Gradient recording failed; turn not learned from");
        }
    }

    fn trigger_reflection(&self, user_id: &str) {
        let Some(staged) = self.scheduler.stage_buffer(user_id) else {
            return;
        };

        // The staged dialogue takes its idle history with it
        let mut metadata = self.load_metadata(user_id);
        if metadata.last_inactivity_ms != 0 {
            metadata.last_inactivity_ms = 0;
            if !store::save_typed(self.store.as_ref(), NS_METADATA, user_id, &metadata) {
                tracing::warn!(user_id, "Failed to reset inactivity stamp");
            }
        }

        let embedder = Arc::clone(&self.embedder);
        let vector_store = Arc::clone(&self.vector_store);
        let resolver = Arc::clone(&self.resolver);
        let owner = user_id.to_string();

        let _detached = self.scheduler.spawn_extraction(
            user_id.to_string(),
            staged,
            Arc::clone(&self.extractor),
            move |memories| {
                for extracted in memories {
                    consolidate_one(&owner, &extracted, &*embedder, &*vector_store, &*resolver);
                }
            },
        );
    }
}

/// Fold one extracted memory into the vector store
///
/// Overlap detection needs an embedding of the new summary; if embedding or
/// the resolver fails, the memory is inserted directly so extracted dialogue
/// is never discarded by a collaborator outage.
fn consolidate_one(
    user_id: &str,
    extracted: &ExtractedMemory,
    embedder: &dyn EmbeddingProvider,
    vector_store: &dyn VectorStore,
    resolver: &dyn ConsolidationResolver,
) {
    let similar = match embedder.embed(&extracted.topic_summary) {
        Ok(embedding) => vector_store
            .similarity_search(user_id, &embedding, CONSOLIDATION_NEIGHBORS)
            .unwrap_or_else(|e| {
                tracing::warn!(user_id, error = %e, "Neighbor search failed during consolidation");
                Vec::new()
            }),
        Err(e) => {
            tracing::warn!(user_id, error = %e, "Embedding failed during consolidation");
            Vec::new()
        }
    };

    let plan = if similar.is_empty() {
        consolidation::direct_insert(extracted)
    } else {
        match resolver.resolve(user_id, extracted, &similar) {
            Ok(reply) => {
                let actions = consolidation::parse_resolution(&reply);
                consolidation::resolve(extracted, &similar, &actions)
            }
            Err(e) => {
                tracing::warn!(user_id, error = %e, "Resolver unavailable; adding memory as-is");
                consolidation::direct_insert(extracted)
            }
        }
    };

    apply_plan(user_id, plan, vector_store);
}

fn apply_plan(user_id: &str, plan: ConsolidationPlan, vector_store: &dyn VectorStore) {
    if !plan.deletes.is_empty() {
        if let Err(e) = vector_store.delete(user_id, &plan.deletes) {
            tracing::warn!(user_id, error = %e, "Failed to delete merged memories");
        }
    }
    let inserts = plan.inserts.len();
    if let Err(e) = vector_store.add_documents(user_id, plan.inserts) {
        tracing::warn!(user_id, error = %e, "Failed to insert consolidated memories");
    } else {
        tracing::debug!(user_id, inserts, "Consolidation applied");
    }
}

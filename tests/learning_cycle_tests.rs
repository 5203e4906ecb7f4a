//! End-to-end scenarios: turn processing, batched learning, persistence
//! across restarts, and the reflection/consolidation pipeline.

use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::TempDir;

use reflective_memory::engine::{ConsolidationResolver, EmbeddingProvider, VectorStore};
use reflective_memory::reflection::MemoryExtractor;
use reflective_memory::{
    EngineConfig, KeyedStore, MemoryEngine, MessageBuffer, ReflectionMode, RetrievedMemory,
    RocksStore,
};
use reflective_memory::types::ExtractedMemory;

// =============================================================================
// COLLABORATOR FAKES
// =============================================================================

/// Deterministic 2-d embedder: even-length text maps to one axis, odd to the
/// other, so similarity is controllable from test inputs
struct AxisEmbedder;

impl EmbeddingProvider for AxisEmbedder {
    fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        if text.len() % 2 == 0 {
            Ok(vec![1.0, 0.0])
        } else {
            Ok(vec![0.0, 1.0])
        }
    }
}

#[derive(Default)]
struct FakeVectorStore {
    documents: Mutex<Vec<RetrievedMemory>>,
}

impl FakeVectorStore {
    fn ids(&self) -> Vec<String> {
        self.documents.lock().iter().map(|d| d.id.clone()).collect()
    }

    fn summaries(&self) -> Vec<String> {
        self.documents
            .lock()
            .iter()
            .map(|d| d.topic_summary.clone())
            .collect()
    }

    fn seed(&self, summaries_and_embeddings: &[(&str, Vec<f32>)]) {
        let docs: Vec<RetrievedMemory> = summaries_and_embeddings
            .iter()
            .map(|(summary, embedding)| {
                let mut doc = RetrievedMemory::new_document(
                    summary.to_string(),
                    format!("dialogue about {summary}"),
                    "seed-session".to_string(),
                );
                doc.embedding = Some(embedding.clone());
                doc
            })
            .collect();
        self.documents.lock().extend(docs);
    }
}

impl VectorStore for FakeVectorStore {
    fn similarity_search(
        &self,
        _user_id: &str,
        embedding: &[f32],
        top_k: usize,
    ) -> anyhow::Result<Vec<RetrievedMemory>> {
        let mut docs: Vec<RetrievedMemory> = self.documents.lock().clone();
        for doc in &mut docs {
            doc.relevance_score = doc
                .embedding
                .as_ref()
                .map(|e| e.iter().zip(embedding).map(|(a, b)| a * b).sum())
                .unwrap_or(0.0);
        }
        docs.sort_by(|a, b| b.relevance_score.total_cmp(&a.relevance_score));
        docs.truncate(top_k);
        Ok(docs)
    }

    fn add_documents(&self, _user_id: &str, mut documents: Vec<RetrievedMemory>) -> anyhow::Result<()> {
        for doc in &mut documents {
            if doc.embedding.is_none() {
                doc.embedding = Some(AxisEmbedder.embed(&doc.topic_summary)?);
            }
        }
        self.documents.lock().extend(documents);
        Ok(())
    }

    fn delete(&self, _user_id: &str, ids: &[String]) -> anyhow::Result<()> {
        self.documents.lock().retain(|d| !ids.contains(&d.id));
        Ok(())
    }
}

/// Extracts one memory per human message
struct EchoExtractor;

impl MemoryExtractor for EchoExtractor {
    fn extract(&self, _user_id: &str, buffer: &MessageBuffer) -> anyhow::Result<Vec<ExtractedMemory>> {
        Ok(buffer
            .messages
            .iter()
            .filter(|m| m.role == "human")
            .map(|m| ExtractedMemory {
                topic_summary: m.content.clone(),
                raw_dialogue: m.content.clone(),
                session_id: "reflected".to_string(),
                turn_references: vec![],
            })
            .collect())
    }
}

/// Replies with a fixed resolution script
struct ScriptedResolver {
    reply: String,
}

impl ConsolidationResolver for ScriptedResolver {
    fn resolve(
        &self,
        _user_id: &str,
        _extracted: &ExtractedMemory,
        _similar: &[RetrievedMemory],
    ) -> anyhow::Result<String> {
        Ok(self.reply.clone())
    }
}

fn build_engine(
    store: Arc<dyn KeyedStore>,
    vector_store: Arc<FakeVectorStore>,
    config: EngineConfig,
    resolver_reply: &str,
) -> MemoryEngine {
    let engine = MemoryEngine::new(
        config,
        store,
        Arc::new(AxisEmbedder),
        vector_store,
        Arc::new(EchoExtractor),
        Arc::new(ScriptedResolver {
            reply: resolver_reply.to_string(),
        }),
    )
    .unwrap();
    engine.reseed(1234);
    engine
}

/// Config sized for the 2-d fakes, reflection pushed out of the way
fn quiet_config(batch_size: usize) -> EngineConfig {
    let mut config = EngineConfig::for_dimension(2);
    config.reranker.top_m = 2;
    config.batch_size = batch_size;
    config.reflection.min_turns = 100;
    config.reflection.max_turns = 1_000;
    config
}

// =============================================================================
// SCENARIOS
// =============================================================================

#[test]
fn learning_cycle_updates_weights_on_cited_turns() {
    let temp = TempDir::new().unwrap();
    let store: Arc<dyn KeyedStore> = Arc::new(RocksStore::open(temp.path()).unwrap());
    let vector_store = Arc::new(FakeVectorStore::default());
    vector_store.seed(&[("hiking trips", vec![1.0, 0.0]), ("sourdough", vec![0.0, 1.0])]);

    let engine = build_engine(store, vector_store, quiet_config(1), "Add()");

    engine.on_turn_start("alice", "what should I pack").unwrap();
    let context = engine.on_before_generate("alice", "what should I pack").unwrap();
    let context = context.expect("two seeded memories should inject");
    assert!(context.memory_block.contains("<memories>"));

    let before = engine.weight_stats("alice").unwrap();
    assert_eq!(before.dimension, 2);

    // Cite only one of the two injected memories so rewards stay asymmetric
    engine
        .on_after_generate("alice", Some(context), "Given your trips [0], pack layers")
        .unwrap();

    let after = engine.weight_stats("alice").unwrap();
    let moved = before.query_transform_norm != after.query_transform_norm
        || before.memory_transform_norm != after.memory_transform_norm;
    assert!(moved, "a cited turn with batch_size 1 must update weights");
}

#[test]
fn batch_size_defers_updates_until_full() {
    let temp = TempDir::new().unwrap();
    let store: Arc<dyn KeyedStore> = Arc::new(RocksStore::open(temp.path()).unwrap());
    let vector_store = Arc::new(FakeVectorStore::default());
    vector_store.seed(&[("topic a", vec![1.0, 0.0]), ("topic b", vec![0.0, 1.0])]);

    let engine = build_engine(store, vector_store, quiet_config(3), "Add()");

    let run_turn = |completion: &str| {
        engine.on_turn_start("bob", "question").unwrap();
        let context = engine.on_before_generate("bob", "question").unwrap().unwrap();
        engine.on_after_generate("bob", Some(context), completion).unwrap();
    };

    run_turn("Using [0], answer one");
    let baseline = engine.weight_stats("bob").unwrap();

    run_turn("Using [1], answer two");
    let mid = engine.weight_stats("bob").unwrap();
    assert_eq!(baseline.query_transform_norm, mid.query_transform_norm);
    assert_eq!(baseline.memory_transform_norm, mid.memory_transform_norm);

    run_turn("Using [0], answer three");
    let after = engine.weight_stats("bob").unwrap();
    let moved = baseline.query_transform_norm != after.query_transform_norm
        || baseline.memory_transform_norm != after.memory_transform_norm;
    assert!(moved, "the third sample fills the batch and flushes");
}

#[test]
fn end_session_flushes_partial_batch() {
    let temp = TempDir::new().unwrap();
    let store: Arc<dyn KeyedStore> = Arc::new(RocksStore::open(temp.path()).unwrap());
    let vector_store = Arc::new(FakeVectorStore::default());
    vector_store.seed(&[("topic a", vec![1.0, 0.0]), ("topic b", vec![0.0, 1.0])]);

    let engine = build_engine(store, vector_store, quiet_config(10), "Add()");

    engine.on_turn_start("carol", "question").unwrap();
    let context = engine.on_before_generate("carol", "question").unwrap().unwrap();
    engine.on_after_generate("carol", Some(context), "Citing [0], done").unwrap();

    let before = engine.weight_stats("carol").unwrap();

    // Runtime needed only because a final reflection may spawn
    let runtime = tokio::runtime::Runtime::new().unwrap();
    runtime.block_on(async {
        engine.end_session("carol").unwrap();
    });

    let after = engine.weight_stats("carol").unwrap();
    let moved = before.query_transform_norm != after.query_transform_norm
        || before.memory_transform_norm != after.memory_transform_norm;
    assert!(moved, "end_session must flush the single accumulated sample");
}

#[test]
fn weights_survive_store_reopen() {
    let temp = TempDir::new().unwrap();
    let vector_store = Arc::new(FakeVectorStore::default());
    vector_store.seed(&[("topic a", vec![1.0, 0.0]), ("topic b", vec![0.0, 1.0])]);

    let learned = {
        let rocks = RocksStore::open(temp.path()).unwrap();
        let store: Arc<dyn KeyedStore> = Arc::new(rocks);
        let engine = build_engine(store, vector_store.clone(), quiet_config(1), "Add()");

        engine.on_turn_start("dave", "question").unwrap();
        let context = engine.on_before_generate("dave", "question").unwrap().unwrap();
        engine.on_after_generate("dave", Some(context), "From [0], answer").unwrap();
        engine.weight_stats("dave").unwrap()
        // RocksStore drops here, releasing the DB lock
    };

    let store: Arc<dyn KeyedStore> = Arc::new(RocksStore::open(temp.path()).unwrap());
    let engine = build_engine(store, vector_store, quiet_config(1), "Add()");

    let restored = engine.weight_stats("dave").unwrap();
    assert_eq!(restored.dimension, learned.dimension);
    assert_eq!(restored.query_transform_norm, learned.query_transform_norm);
    assert_eq!(restored.memory_transform_norm, learned.memory_transform_norm);
}

#[tokio::test]
async fn reflection_extracts_and_adds_memories() {
    let temp = TempDir::new().unwrap();
    let store: Arc<dyn KeyedStore> = Arc::new(RocksStore::open(temp.path()).unwrap());
    let vector_store = Arc::new(FakeVectorStore::default());

    let mut config = quiet_config(4);
    config.reflection.min_turns = 1;
    config.reflection.mode = ReflectionMode::Relaxed;

    let engine = build_engine(store, vector_store.clone(), config, "Add()");

    engine.on_turn_start("erin", "I started pottery classes").unwrap();
    engine.on_after_generate("erin", None, "[NO_CITE] That sounds fun").unwrap();

    // Reflection runs detached; give the worker a moment
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let summaries = vector_store.summaries();
    assert!(
        summaries.iter().any(|s| s.contains("pottery")),
        "reflection should add the extracted memory, got {summaries:?}"
    );
}

#[tokio::test]
async fn consolidation_merge_replaces_existing_memory() {
    let temp = TempDir::new().unwrap();
    let store: Arc<dyn KeyedStore> = Arc::new(RocksStore::open(temp.path()).unwrap());
    let vector_store = Arc::new(FakeVectorStore::default());
    // Even-length summary so the extracted memory's embedding lands on it
    vector_store.seed(&[("likes hiking trips", vec![1.0, 0.0])]);
    let original_ids = vector_store.ids();

    let mut config = quiet_config(4);
    config.reflection.min_turns = 1;
    config.reflection.mode = ReflectionMode::Relaxed;

    let engine = build_engine(
        store,
        vector_store.clone(),
        config,
        "Merge(0, enjoys long mountain hikes)",
    );

    // Even-length message embeds onto the same axis as the seeded memory
    engine.on_turn_start("finn", "hiked all weekend!").unwrap();
    engine.on_after_generate("finn", None, "[NO_CITE] Nice").unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let summaries = vector_store.summaries();
    assert!(
        summaries.iter().any(|s| s == "enjoys long mountain hikes"),
        "merge should insert the combined memory, got {summaries:?}"
    );
    assert!(
        !summaries.iter().any(|s| s == "likes hiking trips"),
        "merge should delete the original memory"
    );
    let ids = vector_store.ids();
    assert!(ids.iter().all(|id| !original_ids.contains(id)));
}

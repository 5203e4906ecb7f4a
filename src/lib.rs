//! Learned memory reranking and consolidation for conversational agents
//!
//! Long-running assistants accumulate memories faster than a fixed similarity
//! metric can usefully rank them. This crate learns a per-user reranker on
//! top of any embedding model: two small residual transforms adapt query and
//! memory embeddings, Gumbel-Top-M sampling keeps the selection stochastic
//! and differentiable in expectation, and citation markers in the model's own
//! replies provide the reward signal for exact REINFORCE updates, batched per
//! user and norm-clipped.
//!
//! Around the learner sits the memory lifecycle: dialogue buffers with
//! threshold-driven reflection, detached extraction with backoff, and
//! merge/add consolidation of extracted memories into the vector store.
//! Everything persists per user through a namespaced keyed store with a
//! RocksDB backend.
//!
//! The entry point is [`engine::MemoryEngine`]; plug in implementations of
//! [`engine::EmbeddingProvider`], [`engine::VectorStore`],
//! [`reflection::MemoryExtractor`], and [`engine::ConsolidationResolver`].

pub mod accumulator;
pub mod citations;
pub mod config;
pub mod consolidation;
pub mod constants;
pub mod engine;
pub mod errors;
pub mod gradient;
pub mod linalg;
pub mod reflection;
pub mod reranker;
pub mod store;
pub mod tracing_setup;
pub mod types;

pub use config::{EngineConfig, RerankerConfig, ReflectionConfig, ReflectionMode};
pub use engine::{ConsolidationResolver, EmbeddingProvider, InjectedContext, MemoryEngine, VectorStore};
pub use errors::{MemoryError, Result};
pub use reflection::MemoryExtractor;
pub use store::{InMemoryStore, KeyedStore, RocksStore};
pub use types::{ExtractedMemory, MessageBuffer, RerankerState, RetrievedMemory, WeightStats};

// Re-export foundational crates so hosts stay version-aligned
pub use chrono;
pub use parking_lot;
pub use uuid;

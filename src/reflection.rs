//! Reflection scheduling: when and how buffered dialogue becomes memories
//!
//! Buffered turns are not extracted immediately. The scheduler watches two
//! signals, human-turn count and inactivity, and stages the buffer for
//! extraction once thresholds are met. Staging is snapshot-and-clear: the
//! live buffer moves to a staging slot so new turns accumulate in a fresh
//! buffer while extraction runs. At most one staged buffer exists per user;
//! a second reflection is refused until the first resolves.
//!
//! Extraction runs detached with exponential backoff. After `max_retries`
//! failed attempts the staged buffer is dropped and the loss logged; the
//! live buffer keeps collecting turns regardless.

use std::sync::Arc;

use crate::config::{ReflectionConfig, ReflectionMode};
use crate::store::{self, KeyedStore, NS_BUFFER, NS_BUFFER_STAGING};
use crate::types::{ExtractedMemory, MessageBuffer};

/// Why a reflection was (or was not) triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReflectionTrigger {
    /// Thresholds not met
    NotDue,
    /// Minimum thresholds satisfied under the configured mode
    ThresholdsMet,
    /// A maximum threshold was exceeded; reflection is forced
    Forced,
}

impl ReflectionTrigger {
    pub fn is_due(&self) -> bool {
        !matches!(self, ReflectionTrigger::NotDue)
    }
}

/// Evaluate the trigger rules for one user's live buffer
///
/// Maximum thresholds force a reflection on their own, unconditionally.
/// Below the maximums, `Strict` mode requires both minimums while `Relaxed`
/// accepts either one. An empty buffer is rejected at staging time, not here.
pub fn check_reflection_triggers(
    human_message_count: usize,
    inactivity_ms: u64,
    config: &ReflectionConfig,
) -> ReflectionTrigger {
    if human_message_count >= config.max_turns || inactivity_ms >= config.max_inactivity_ms {
        return ReflectionTrigger::Forced;
    }

    let turns_met = human_message_count >= config.min_turns;
    let inactivity_met = inactivity_ms >= config.min_inactivity_ms;

    let due = match config.mode {
        ReflectionMode::Strict => turns_met && inactivity_met,
        ReflectionMode::Relaxed => turns_met || inactivity_met,
    };

    if due {
        ReflectionTrigger::ThresholdsMet
    } else {
        ReflectionTrigger::NotDue
    }
}

/// Produces memories from a staged dialogue buffer
///
/// Implementations wrap whatever extraction backend is in use (typically an
/// LLM call). Errors are retried with backoff by the scheduler.
pub trait MemoryExtractor: Send + Sync {
    fn extract(&self, user_id: &str, buffer: &MessageBuffer) -> anyhow::Result<Vec<ExtractedMemory>>;
}

/// Drives staging and the detached extraction worker
pub struct ReflectionScheduler {
    store: Arc<dyn KeyedStore>,
    config: ReflectionConfig,
}

impl ReflectionScheduler {
    pub fn new(store: Arc<dyn KeyedStore>, config: ReflectionConfig) -> Self {
        Self { store, config }
    }

    /// Snapshot-and-clear the live buffer into the staging slot
    ///
    /// Returns the staged buffer, or `None` when there is nothing to stage or
    /// a previous staging is still in flight.
    pub fn stage_buffer(&self, user_id: &str) -> Option<MessageBuffer> {
        if self.store.get(NS_BUFFER_STAGING, user_id).is_some() {
            tracing::debug!(user_id, "Reflection already in flight; skipping");
            return None;
        }

        let (mut buffer, _) =
            store::load_typed::<MessageBuffer>(self.store.as_ref(), NS_BUFFER, user_id)?;
        if buffer.is_empty() {
            return None;
        }
        buffer.retry_count = 0;

        if !store::save_typed(self.store.as_ref(), NS_BUFFER_STAGING, user_id, &buffer) {
            tracing::warn!(user_id, "Failed to stage buffer; leaving live buffer intact");
            return None;
        }
        self.store.delete(NS_BUFFER, user_id);

        tracing::info!(
            user_id,
            messages = buffer.messages.len(),
            human_messages = buffer.human_message_count,
            "Buffer staged for reflection"
        );
        Some(buffer)
    }

    /// Run extraction against the staged buffer with exponential backoff
    ///
    /// Spawned detached so turn processing never waits on extraction; the
    /// extractor is a blocking call and runs on the blocking pool so a slow
    /// backend never pins a runtime worker. Each failed attempt persists the
    /// incremented retry counter with the staged buffer, so a process restart
    /// resumes with the attempt history intact. On success the staging slot
    /// is cleared and the extracted memories are handed to `on_extracted`.
    ///
    /// Without an ambient tokio runtime there is nothing to run the worker
    /// on: the staged buffer is restored to the live slot and `None` is
    /// returned, so the dialogue waits for a runtime-backed trigger instead
    /// of being lost.
    pub fn spawn_extraction<F>(
        self: &Arc<Self>,
        user_id: String,
        mut buffer: MessageBuffer,
        extractor: Arc<dyn MemoryExtractor>,
        on_extracted: F,
    ) -> Option<tokio::task::JoinHandle<()>>
    where
        F: FnOnce(Vec<ExtractedMemory>) + Send + 'static,
    {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                tracing::warn!(user_id, "No async runtime for extraction; restoring live buffer");
                self.restore_staged(&user_id, buffer);
                return None;
            }
        };

        let scheduler = Arc::clone(self);
        Some(runtime.spawn(async move {
            loop {
                let attempt = {
                    let extractor = Arc::clone(&extractor);
                    let owner = user_id.clone();
                    let snapshot = buffer.clone();
                    tokio::task::spawn_blocking(move || extractor.extract(&owner, &snapshot))
                        .await
                };
                let result = match attempt {
                    Ok(result) => result,
                    Err(e) => Err(anyhow::anyhow!("extraction task aborted: {e}")),
                };

                match result {
                    Ok(memories) => {
                        scheduler.store.delete(NS_BUFFER_STAGING, &user_id);
                        tracing::info!(
                            user_id,
                            extracted = memories.len(),
                            attempts = buffer.retry_count + 1,
                            "Reflection extraction complete"
                        );
                        on_extracted(memories);
                        return;
                    }
                    Err(e) => {
                        buffer.retry_count += 1;
                        if buffer.retry_count > scheduler.config.max_retries {
                            scheduler.store.delete(NS_BUFFER_STAGING, &user_id);
                            tracing::error!(
                                user_id,
                                messages = buffer.messages.len(),
                                retries = scheduler.config.max_retries,
                                error = %e,
                                "Dropping staged buffer after exhausting retries; dialogue lost"
                            );
                            return;
                        }

                        scheduler.persist_retry_count(&user_id, &buffer);

                        let delay_ms = scheduler.config.retry_delay_ms
                            << (buffer.retry_count.saturating_sub(1)).min(16);
                        tracing::warn!(
                            user_id,
                            attempt = buffer.retry_count,
                            delay_ms,
                            error = %e,
                            "Extraction failed; retrying after backoff"
                        );
                        tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                    }
                }
            }
        }))
    }

    /// Persist the attempt counter so a restart resumes the history
    ///
    /// When the typed save fails, falls back to patching `retry_count` in the
    /// raw staging record; only if that also fails does the counter live
    /// solely in the worker's memory for the rest of the loop.
    fn persist_retry_count(&self, user_id: &str, buffer: &MessageBuffer) {
        if store::save_typed(self.store.as_ref(), NS_BUFFER_STAGING, user_id, buffer) {
            return;
        }
        tracing::warn!(user_id, "Typed retry-counter save failed; patching raw staging record");

        let Some(mut record) = self.store.get(NS_BUFFER_STAGING, user_id) else {
            tracing::warn!(user_id, "Staging record missing while patching retry counter");
            return;
        };
        match record.value.as_object_mut() {
            Some(fields) => {
                fields.insert("retry_count".to_string(), buffer.retry_count.into());
                if !self.store.put(NS_BUFFER_STAGING, user_id, record.value) {
                    tracing::warn!(
                        user_id,
                        "Raw retry-counter patch failed; counter held in memory only"
                    );
                }
            }
            None => tracing::warn!(user_id, "Staging record is not an object; cannot patch"),
        }
    }

    /// Move a staged buffer back into the live slot
    ///
    /// Anything buffered since staging is appended after the restored
    /// messages so dialogue order is preserved.
    fn restore_staged(&self, user_id: &str, staged: MessageBuffer) {
        let mut restored = staged;
        restored.retry_count = 0;
        if let Some((live, _)) =
            store::load_typed::<MessageBuffer>(self.store.as_ref(), NS_BUFFER, user_id)
        {
            restored.human_message_count += live.human_message_count;
            restored.last_message_timestamp = live.last_message_timestamp;
            restored.messages.extend(live.messages);
        }
        if store::save_typed(self.store.as_ref(), NS_BUFFER, user_id, &restored) {
            self.store.delete(NS_BUFFER_STAGING, user_id);
        } else {
            tracing::warn!(user_id, "Failed to restore staged buffer; leaving it staged");
        }
    }

    pub fn config(&self) -> &ReflectionConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, StoredRecord};
    use parking_lot::Mutex;

    fn config() -> ReflectionConfig {
        ReflectionConfig {
            min_turns: 2,
            max_turns: 10,
            min_inactivity_ms: 1_000,
            max_inactivity_ms: 60_000,
            mode: ReflectionMode::Strict,
            max_retries: 2,
            retry_delay_ms: 1,
        }
    }

    #[test]
    fn test_strict_requires_both_minimums() {
        let cfg = config();
        assert_eq!(check_reflection_triggers(5, 100, &cfg), ReflectionTrigger::NotDue);
        assert_eq!(check_reflection_triggers(1, 5_000, &cfg), ReflectionTrigger::NotDue);
        assert_eq!(
            check_reflection_triggers(5, 5_000, &cfg),
            ReflectionTrigger::ThresholdsMet
        );
    }

    #[test]
    fn test_relaxed_accepts_either_minimum() {
        let mut cfg = config();
        cfg.mode = ReflectionMode::Relaxed;
        assert_eq!(
            check_reflection_triggers(5, 100, &cfg),
            ReflectionTrigger::ThresholdsMet
        );
        assert_eq!(
            check_reflection_triggers(1, 5_000, &cfg),
            ReflectionTrigger::ThresholdsMet
        );
        assert_eq!(check_reflection_triggers(1, 100, &cfg), ReflectionTrigger::NotDue);
    }

    #[test]
    fn test_maximums_force_reflection() {
        let cfg = config();
        assert_eq!(check_reflection_triggers(10, 0, &cfg), ReflectionTrigger::Forced);
        assert_eq!(check_reflection_triggers(1, 60_000, &cfg), ReflectionTrigger::Forced);
    }

    #[test]
    fn test_zero_human_turns_still_honors_inactivity() {
        // Assistant-only buffers must not linger forever: the inactivity
        // maximum forces, and relaxed mode accepts the inactivity minimum,
        // regardless of the human-turn count.
        let cfg = config();
        assert_eq!(check_reflection_triggers(0, 60_000, &cfg), ReflectionTrigger::Forced);
        assert_eq!(check_reflection_triggers(0, 5_000, &cfg), ReflectionTrigger::NotDue);

        let mut relaxed = config();
        relaxed.mode = ReflectionMode::Relaxed;
        assert_eq!(
            check_reflection_triggers(0, 5_000, &relaxed),
            ReflectionTrigger::ThresholdsMet
        );
        assert_eq!(check_reflection_triggers(0, 100, &relaxed), ReflectionTrigger::NotDue);
    }

    fn staged_setup() -> (Arc<InMemoryStore>, Arc<ReflectionScheduler>) {
        let store = Arc::new(InMemoryStore::new());
        let scheduler = Arc::new(ReflectionScheduler::new(
            store.clone() as Arc<dyn KeyedStore>,
            config(),
        ));

        let mut buffer = MessageBuffer::empty();
        buffer.push("human", "I moved to Lisbon last month");
        buffer.push("assistant", "How are you settling in?");
        store::save_typed(store.as_ref(), NS_BUFFER, "u1", &buffer);

        (store, scheduler)
    }

    #[test]
    fn test_stage_snapshots_and_clears() {
        let (store, scheduler) = staged_setup();

        let staged = scheduler.stage_buffer("u1").unwrap();
        assert_eq!(staged.messages.len(), 2);
        assert_eq!(staged.retry_count, 0);

        // Live buffer cleared, staging slot occupied
        assert!(store.get(NS_BUFFER, "u1").is_none());
        assert!(store.get(NS_BUFFER_STAGING, "u1").is_some());
    }

    #[test]
    fn test_second_stage_refused_while_in_flight() {
        let (store, scheduler) = staged_setup();
        scheduler.stage_buffer("u1").unwrap();

        // New dialogue arrives in a fresh live buffer
        let mut buffer = MessageBuffer::empty();
        buffer.push("human", "another topic");
        store::save_typed(store.as_ref(), NS_BUFFER, "u1", &buffer);

        assert!(scheduler.stage_buffer("u1").is_none());
        // The new live buffer was not consumed
        assert!(store.get(NS_BUFFER, "u1").is_some());
    }

    #[test]
    fn test_stage_skips_empty_buffer() {
        let store = Arc::new(InMemoryStore::new());
        let scheduler = ReflectionScheduler::new(store.clone() as Arc<dyn KeyedStore>, config());
        store::save_typed(store.as_ref(), NS_BUFFER, "u1", &MessageBuffer::empty());
        assert!(scheduler.stage_buffer("u1").is_none());
    }

    struct FlakyExtractor {
        failures_remaining: Mutex<u32>,
    }

    impl MemoryExtractor for FlakyExtractor {
        fn extract(&self, _user_id: &str, buffer: &MessageBuffer) -> anyhow::Result<Vec<ExtractedMemory>> {
            let mut remaining = self.failures_remaining.lock();
            if *remaining > 0 {
                *remaining -= 1;
                anyhow::bail!("backend unavailable");
            }
            Ok(vec![ExtractedMemory {
                topic_summary: "moved to Lisbon".to_string(),
                raw_dialogue: buffer.messages[0].content.clone(),
                session_id: "s1".to_string(),
                turn_references: vec![0],
            }])
        }
    }

    #[tokio::test]
    async fn test_extraction_retries_then_succeeds() {
        let (store, scheduler) = staged_setup();
        let staged = scheduler.stage_buffer("u1").unwrap();

        let extractor = Arc::new(FlakyExtractor {
            failures_remaining: Mutex::new(1),
        });
        let extracted = Arc::new(Mutex::new(Vec::new()));
        let sink = extracted.clone();

        scheduler
            .spawn_extraction("u1".to_string(), staged, extractor, move |memories| {
                *sink.lock() = memories;
            })
            .unwrap()
            .await
            .unwrap();

        assert_eq!(extracted.lock().len(), 1);
        assert!(store.get(NS_BUFFER_STAGING, "u1").is_none());
    }

    #[tokio::test]
    async fn test_extraction_drops_buffer_after_max_retries() {
        let (store, scheduler) = staged_setup();
        let staged = scheduler.stage_buffer("u1").unwrap();

        let extractor = Arc::new(FlakyExtractor {
            failures_remaining: Mutex::new(u32::MAX),
        });
        let extracted = Arc::new(Mutex::new(Vec::new()));
        let sink = extracted.clone();

        scheduler
            .spawn_extraction("u1".to_string(), staged, extractor, move |memories| {
                *sink.lock() = memories;
            })
            .unwrap()
            .await
            .unwrap();

        assert!(extracted.lock().is_empty());
        assert!(store.get(NS_BUFFER_STAGING, "u1").is_none());
    }

    #[test]
    fn test_spawn_without_runtime_restores_buffer() {
        let (store, scheduler) = staged_setup();
        let staged = scheduler.stage_buffer("u1").unwrap();

        let extractor = Arc::new(FlakyExtractor {
            failures_remaining: Mutex::new(0),
        });
        // No tokio runtime on this thread
        let handle = scheduler.spawn_extraction("u1".to_string(), staged, extractor, |_| {});
        assert!(handle.is_none());

        // Dialogue moved back to the live slot for a later attempt
        let record = store.get(NS_BUFFER, "u1").unwrap();
        let buffer: MessageBuffer = serde_json::from_value(record.value).unwrap();
        assert_eq!(buffer.messages.len(), 2);
        assert_eq!(buffer.human_message_count, 1);
        assert!(store.get(NS_BUFFER_STAGING, "u1").is_none());
    }

    /// Wraps an in-memory store and fails the next N puts on the staging
    /// namespace, recording every staging put it sees.
    struct FlakyPutStore {
        inner: InMemoryStore,
        failures_armed: Mutex<u32>,
        staging_puts: Mutex<Vec<serde_json::Value>>,
    }

    impl FlakyPutStore {
        fn new() -> Self {
            Self {
                inner: InMemoryStore::new(),
                failures_armed: Mutex::new(0),
                staging_puts: Mutex::new(Vec::new()),
            }
        }
    }

    impl KeyedStore for FlakyPutStore {
        fn get(&self, namespace: &str, user_id: &str) -> Option<StoredRecord> {
            self.inner.get(namespace, user_id)
        }

        fn put(&self, namespace: &str, user_id: &str, value: serde_json::Value) -> bool {
            if namespace == NS_BUFFER_STAGING {
                self.staging_puts.lock().push(value.clone());
                let mut armed = self.failures_armed.lock();
                if *armed > 0 {
                    *armed -= 1;
                    return false;
                }
            }
            self.inner.put(namespace, user_id, value)
        }

        fn delete(&self, namespace: &str, user_id: &str) -> bool {
            self.inner.delete(namespace, user_id)
        }
    }

    #[tokio::test]
    async fn test_retry_counter_survives_typed_save_failure() {
        let store = Arc::new(FlakyPutStore::new());
        let scheduler = Arc::new(ReflectionScheduler::new(
            store.clone() as Arc<dyn KeyedStore>,
            config(),
        ));

        let mut buffer = MessageBuffer::empty();
        buffer.push("human", "weekend plans in Porto");
        store::save_typed(store.as_ref(), NS_BUFFER, "u1", &buffer);
        let staged = scheduler.stage_buffer("u1").unwrap();

        // The next staging put fails, forcing the raw-record fallback
        *store.failures_armed.lock() = 1;

        let extractor = Arc::new(FlakyExtractor {
            failures_remaining: Mutex::new(1),
        });
        let extracted = Arc::new(Mutex::new(Vec::new()));
        let sink = extracted.clone();
        scheduler
            .spawn_extraction("u1".to_string(), staged, extractor, move |memories| {
                *sink.lock() = memories;
            })
            .unwrap()
            .await
            .unwrap();

        assert_eq!(extracted.lock().len(), 1);
        // Staging puts observed: the initial stage, the failed typed save,
        // then the raw patch carrying the incremented counter
        let puts = store.staging_puts.lock();
        assert_eq!(puts.len(), 3);
        assert_eq!(puts[0]["retry_count"], 0);
        assert_eq!(puts[1]["retry_count"], 1);
        assert_eq!(puts[2]["retry_count"], 1);
    }
}

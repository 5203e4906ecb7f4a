//! Documented constants for the reranking and reflection subsystems
//!
//! All tunable parameters live here with justification for their values.
//! Centralizing constants prevents magic numbers and makes tuning easier.

// =============================================================================
// RERANKER DEFAULTS
// Policy-gradient reranking over retrieved memories. Values follow the
// standard REINFORCE-with-baseline setup for a softmax selection policy.
// =============================================================================

/// Default candidate pool size handed to the reranker per turn
///
/// 20 candidates is large enough that the learned transforms have room to
/// reorder meaningfully, and small enough that the exact gradient (which sums
/// over all K candidates) stays cheap.
pub const DEFAULT_TOP_K: usize = 20;

/// Default number of memories injected into the generation step
///
/// 5 memories keeps the injected context block small relative to the prompt
/// budget while giving the citation signal several arms to discriminate.
pub const DEFAULT_TOP_M: usize = 5;

/// Default Gumbel-Softmax temperature
///
/// 0.5 sharpens the sampling distribution around high-relevance candidates
/// while retaining enough exploration for the policy gradient to observe
/// counterfactual selections.
pub const DEFAULT_TEMPERATURE: f32 = 0.5;

/// Default learning rate for the transform updates
///
/// The transforms start near zero (residual form: output = input + W·input),
/// so small steps are essential; 1e-3 with batch accumulation keeps single
/// noisy turns from destabilizing the adapted embedding space.
pub const DEFAULT_LEARNING_RATE: f32 = 0.001;

/// Default reward baseline for advantage computation
///
/// Rewards are ±1, so a 0.5 baseline makes cited selections worth +0.5 and
/// everything else −1.5, suppressing unhelpful candidates faster than it
/// promotes helpful ones.
pub const DEFAULT_BASELINE: f32 = 0.5;

/// Default number of gradient samples accumulated before a weight update
pub const DEFAULT_BATCH_SIZE: usize = 4;

/// Default Frobenius-norm ceiling applied to each transform after an update
///
/// 100.0 is far above any healthy weight magnitude for unit-norm embeddings;
/// it exists to stop a pathological reward sequence from blowing up the
/// transforms, not to shape routine updates.
pub const DEFAULT_CLIP_THRESHOLD: f32 = 100.0;

/// Standard deviation for Gaussian weight initialization
///
/// Mean-zero, std 0.01 keeps the initial adaptation within noise of the
/// identity map, so untrained rerankers reproduce relevance-only ordering.
pub const WEIGHT_INIT_STD: f32 = 0.01;

/// Advantages with absolute value below this contribute nothing to gradients
pub const ADVANTAGE_EPSILON: f32 = 1e-8;

/// Clamp bound for relevance scores when a dot product overflows
///
/// Propagating NaN/Infinity into the softmax poisons the whole probability
/// vector; a large finite score preserves ordering instead.
pub const SCORE_CLAMP: f32 = 1e6;

// =============================================================================
// REFLECTION SCHEDULING DEFAULTS
// Thresholds governing when buffered dialogue is staged for memory
// extraction. Min thresholds gate routine extraction; max thresholds force it.
// =============================================================================

/// Minimum human messages before reflection may trigger
pub const DEFAULT_MIN_TURNS: usize = 2;

/// Human-message count that forces reflection regardless of inactivity
pub const DEFAULT_MAX_TURNS: usize = 50;

/// Minimum inactivity (ms) before reflection may trigger (10 minutes)
pub const DEFAULT_MIN_INACTIVITY_MS: u64 = 600_000;

/// Inactivity (ms) that forces reflection (30 minutes)
pub const DEFAULT_MAX_INACTIVITY_MS: u64 = 1_800_000;

/// Maximum extraction retry attempts before a staged buffer is dropped
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Base delay (ms) for exponential extraction retry backoff
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;

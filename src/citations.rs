//! Citation-marker extraction and reward assignment
//!
//! The generation model marks which injected memories it actually used with
//! bracketed index lists (`[0, 2]`) or a literal `[NO_CITE]` token. Those
//! markers are the only reward signal the reranker learns from. Malformed
//! marker syntax aborts the RL update for the turn rather than guessing.

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;

use crate::types::{CitationRecord, RetrievedMemory};

/// Reward for a memory that was selected and cited
pub const REWARD_CITED: f32 = 1.0;

/// Reward for everything else: selected-but-uncited and not-selected alike.
/// Collapsing those two cases into one signal is a deliberate modeling
/// choice carried over from the selection policy's training setup.
pub const REWARD_UNCITED: f32 = -1.0;

/// Parsed citation outcome for one completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CitationOutcome {
    /// One or more valid index groups, unioned and sorted
    Cited { indices: Vec<usize> },
    /// Literal `[NO_CITE]` token: nothing was useful
    NoCite,
    /// Unparseable marker syntax: no signal, RL update aborted for this turn
    Malformed,
}

fn bracket_group_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[([^\]]*)\]").expect("bracket group regex"))
}

/// Extract citation markers from a completion
///
/// Recognizes a literal `[NO_CITE]` or one or more bracketed comma-separated
/// non-negative integer lists, unioned across groups. Any bracketed content
/// that fails to parse classifies the whole response as malformed. Text with
/// no bracket groups at all is also malformed: the model ignored the citation
/// contract, so there is no signal to learn from.
pub fn extract_citations(completion: &str) -> CitationOutcome {
    if completion.contains("[NO_CITE]") {
        return CitationOutcome::NoCite;
    }

    let mut indices: BTreeSet<usize> = BTreeSet::new();
    let mut saw_group = false;

    for capture in bracket_group_re().captures_iter(completion) {
        saw_group = true;
        let inner = capture[1].trim();
        if inner.is_empty() {
            continue;
        }

        for part in inner.split(',') {
            match part.trim().parse::<usize>() {
                Ok(index) => {
                    indices.insert(index);
                }
                Err(_) => {
                    tracing::debug!(group = %&capture[0], "Unparseable citation group");
                    return CitationOutcome::Malformed;
                }
            }
        }
    }

    if !saw_group {
        return CitationOutcome::Malformed;
    }

    CitationOutcome::Cited {
        indices: indices.into_iter().collect(),
    }
}

/// Turn a citation outcome into per-candidate rewards over all K candidates
///
/// Every retrieved candidate receives a record: selected-and-cited → +1,
/// selected-but-not-cited → −1, not-selected → −1 (implicit "not useful").
/// Citation indices outside the candidate bound are dropped with a warning
/// rather than failing the turn. A malformed outcome yields an empty record
/// set, which short-circuits the gradient cycle.
pub fn build_citation_records(
    outcome: &CitationOutcome,
    candidates: &[RetrievedMemory],
    selected_indices: &[usize],
    turn_index: u32,
) -> Vec<CitationRecord> {
    let k = candidates.len();

    let cited: BTreeSet<usize> = match outcome {
        CitationOutcome::Malformed => return Vec::new(),
        CitationOutcome::NoCite => BTreeSet::new(),
        CitationOutcome::Cited { indices } => indices
            .iter()
            .copied()
            .filter(|&i| {
                if i >= k {
                    tracing::warn!(index = i, candidates = k, "Dropping out-of-range citation index");
                    false
                } else {
                    true
                }
            })
            .collect(),
    };

    let selected: BTreeSet<usize> = selected_indices.iter().copied().collect();

    candidates
        .iter()
        .enumerate()
        .map(|(i, memory)| {
            let was_cited = selected.contains(&i) && cited.contains(&i);
            CitationRecord {
                memory_id: memory.id.clone(),
                cited: was_cited,
                reward: if was_cited { 1 } else { -1 },
                turn_index,
            }
        })
        .collect()
}

/// Reward vector over all K candidates, aligned with the candidate array
pub fn reward_vector(records: &[CitationRecord]) -> Vec<f32> {
    records
        .iter()
        .map(|r| if r.reward > 0 { REWARD_CITED } else { REWARD_UNCITED })
        .collect()
}

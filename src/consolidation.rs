//! Merge/add resolution for freshly extracted memories
//!
//! When an extracted memory overlaps existing ones, a resolver model decides
//! whether to add it as-is or merge it into an existing memory. The resolver
//! replies with newline-separated actions:
//!
//! ```text
//! Merge(2, combined summary of both memories)
//! Add()
//! ```
//!
//! Merges take priority over adds: if any valid merge is present, add actions
//! are ignored. Each merge deletes the target memory and inserts a fresh one
//! carrying the merged summary, so the vector store re-embeds it. Indices
//! refer to the similar-memory list shown to the resolver; duplicates beyond
//! the first and out-of-range indices are dropped with a warning.

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;

use crate::types::{ExtractedMemory, RetrievedMemory};

/// One parsed resolver action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionAction {
    /// Insert the extracted memory as a new document
    Add,
    /// Fold the extracted memory into `similar[index]` under a new summary
    Merge { index: usize, summary: String },
}

/// The store mutations a resolution reduces to
#[derive(Debug, Clone, Default)]
pub struct ConsolidationPlan {
    /// Memory ids to delete before inserting
    pub deletes: Vec<String>,
    /// New documents to insert (and embed)
    pub inserts: Vec<RetrievedMemory>,
}

fn merge_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^Merge\(\s*(\d+)\s*,\s*(.*?)\s*\)$").expect("merge action regex"))
}

fn add_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^Add\(\s*\)$").expect("add action regex"))
}

/// Parse a resolver reply into actions, one per non-empty line
///
/// Lines that match neither action form are skipped with a warning rather
/// than failing the consolidation.
pub fn parse_resolution(reply: &str) -> Vec<ResolutionAction> {
    let mut actions = Vec::new();

    for line in reply.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if add_re().is_match(line) {
            actions.push(ResolutionAction::Add);
        } else if let Some(capture) = merge_re().captures(line) {
            match capture[1].parse::<usize>() {
                Ok(index) => actions.push(ResolutionAction::Merge {
                    index,
                    summary: capture[2].to_string(),
                }),
                Err(_) => tracing::warn!(line, "Unparseable merge index"),
            }
        } else {
            tracing::warn!(line, "Ignoring unrecognized resolution line");
        }
    }

    actions
}

/// Reduce parsed actions to a concrete plan against the similar-memory list
///
/// With no usable actions (empty or all-malformed reply) the extracted memory
/// falls back to a plain add, so resolver failures never discard dialogue.
pub fn resolve(
    extracted: &ExtractedMemory,
    similar: &[RetrievedMemory],
    actions: &[ResolutionAction],
) -> ConsolidationPlan {
    let mut plan = ConsolidationPlan::default();
    let mut merged_indices: BTreeSet<usize> = BTreeSet::new();

    for action in actions {
        if let ResolutionAction::Merge { index, summary } = action {
            if *index >= similar.len() {
                tracing::warn!(
                    index,
                    similar = similar.len(),
                    "Dropping merge with out-of-range index"
                );
                continue;
            }
            // First merge per index wins
            if !merged_indices.insert(*index) {
                tracing::warn!(index, "Dropping duplicate merge for index");
                continue;
            }

            let target = &similar[*index];
            let mut merged = RetrievedMemory::new_document(
                summary.clone(),
                format!("{}\n{}", target.raw_dialogue, extracted.raw_dialogue),
                extracted.session_id.clone(),
            );
            merged.turn_references = target
                .turn_references
                .iter()
                .chain(extracted.turn_references.iter())
                .copied()
                .collect();

            plan.deletes.push(target.id.clone());
            plan.inserts.push(merged);
        }
    }

    if merged_indices.is_empty() {
        // Either an explicit Add or nothing usable; insert as-is
        plan.inserts.push(as_document(extracted));
    }

    plan
}

/// Plan for an extracted memory with no similar neighbors: plain insert
pub fn direct_insert(extracted: &ExtractedMemory) -> ConsolidationPlan {
    ConsolidationPlan {
        deletes: Vec::new(),
        inserts: vec![as_document(extracted)],
    }
}

fn as_document(extracted: &ExtractedMemory) -> RetrievedMemory {
    let mut doc = RetrievedMemory::new_document(
        extracted.topic_summary.clone(),
        extracted.raw_dialogue.clone(),
        extracted.session_id.clone(),
    );
    doc.turn_references = extracted.turn_references.clone();
    doc
}

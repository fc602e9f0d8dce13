//! Approximate name resolution.
//!
//! Transcribed speech mangles names ("vikram", "Viktor", "Bikram" for the
//! same person), so background extraction never trusts an exact string
//! match. [`similarity_ratio`] scores two strings on a 0–100 scale and the
//! [`NameRegistry`] resolves a heard name to the closest known person above
//! a threshold, returning the canonical stored casing.

use parley_types::PersonId;

use crate::graph::{ConversationGraph, GraphError};

/// Minimum [`similarity_ratio`] for a heard name to resolve to a known one.
pub const DEFAULT_NAME_THRESHOLD: u32 = 55;

/// Similarity of two strings on a 0–100 scale, case-insensitive.
///
/// `2 × LCS(a, b) / (|a| + |b|) × 100`, where LCS is the longest common
/// subsequence over characters. 100 means equal (ignoring case), 0 means
/// nothing in common.
pub fn similarity_ratio(a: &str, b: &str) -> u32 {
    let a: Vec<char> = a.to_lowercase().chars().collect();
    let b: Vec<char> = b.to_lowercase().chars().collect();
    if a.is_empty() && b.is_empty() {
        return 100;
    }
    if a.is_empty() || b.is_empty() {
        return 0;
    }

    // One-row LCS dynamic program.
    let mut row = vec![0usize; b.len() + 1];
    for ca in &a {
        let mut prev_diag = 0;
        for (j, cb) in b.iter().enumerate() {
            let prev_row = row[j + 1];
            row[j + 1] = if ca == cb {
                prev_diag + 1
            } else {
                row[j + 1].max(row[j])
            };
            prev_diag = prev_row;
        }
    }
    let lcs = row[b.len()];
    ((2 * lcs * 100) / (a.len() + b.len())) as u32
}

/// In-memory view of every named person, for fuzzy lookup.
///
/// Rebuilt from the graph after every write that can add or change a name
/// (enrollment, display-name updates, merges) rather than on a timer.
#[derive(Debug, Default)]
pub struct NameRegistry {
    entries: Vec<(PersonId, String)>,
}

impl NameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reload the registry from the graph.
    pub fn refresh(&mut self, graph: &ConversationGraph) -> Result<(), GraphError> {
        self.entries = graph.named_persons()?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve `heard` to the best-matching known person at or above
    /// `threshold`. Returns the person id and the canonical stored casing of
    /// their name; `None` when nobody is close enough.
    pub fn resolve_approx(&self, heard: &str, threshold: u32) -> Option<(PersonId, String)> {
        self.entries
            .iter()
            .map(|(id, name)| (id, name, similarity_ratio(heard, name)))
            .filter(|(_, _, score)| *score >= threshold)
            .max_by_key(|(_, _, score)| *score)
            .map(|(id, name, _)| (id.clone(), name.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── similarity_ratio ─────────────────────────────────────────────────────

    #[test]
    fn equal_strings_score_100() {
        assert_eq!(similarity_ratio("vikram", "vikram"), 100);
    }

    #[test]
    fn ratio_ignores_case() {
        assert_eq!(similarity_ratio("Vikram", "vikram"), 100);
    }

    #[test]
    fn disjoint_strings_score_0() {
        assert_eq!(similarity_ratio("abc", "xyz"), 0);
    }

    #[test]
    fn close_misheard_name_scores_high() {
        // "bikram" shares 5 of 6 characters in order with "vikram".
        assert!(similarity_ratio("bikram", "vikram") >= 80);
    }

    #[test]
    fn empty_vs_nonempty_scores_0() {
        assert_eq!(similarity_ratio("", "vikram"), 0);
        assert_eq!(similarity_ratio("", ""), 100);
    }

    // ── NameRegistry ─────────────────────────────────────────────────────────

    fn registry_with(names: &[(&str, &str)]) -> NameRegistry {
        NameRegistry {
            entries: names
                .iter()
                .map(|(id, name)| (PersonId((*id).to_string()), (*name).to_string()))
                .collect(),
        }
    }

    #[test]
    fn resolve_returns_canonical_casing() {
        let reg = registry_with(&[("face_1", "vikram")]);
        let (id, name) = reg.resolve_approx("Vikram", DEFAULT_NAME_THRESHOLD).unwrap();
        assert_eq!(id.as_str(), "face_1");
        assert_eq!(name, "vikram");
    }

    #[test]
    fn resolve_picks_closest_of_several() {
        let reg = registry_with(&[("face_1", "vikram"), ("face_2", "victor")]);
        let (id, _) = reg.resolve_approx("bikram", DEFAULT_NAME_THRESHOLD).unwrap();
        assert_eq!(id.as_str(), "face_1");
    }

    #[test]
    fn resolve_below_threshold_is_none() {
        let reg = registry_with(&[("face_1", "vikram")]);
        assert!(reg.resolve_approx("zzz", DEFAULT_NAME_THRESHOLD).is_none());
    }

    #[test]
    fn refresh_picks_up_new_names() {
        let graph = ConversationGraph::open_in_memory().unwrap();
        let id = PersonId::from_face_number(1);
        graph.create_or_get(&id).unwrap();
        let mut reg = NameRegistry::new();
        reg.refresh(&graph).unwrap();
        assert!(reg.is_empty());

        graph.set_display_name(&id, "Ada").unwrap();
        reg.refresh(&graph).unwrap();
        assert_eq!(reg.len(), 1);
        assert!(reg.resolve_approx("ada", DEFAULT_NAME_THRESHOLD).is_some());
    }
}

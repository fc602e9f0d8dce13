//! In-process face embedding store.
//!
//! Holds every enrolled `(person id, embedding)` pair and answers
//! maximum-cosine-similarity matches. A match is accepted only when the best
//! score clears `1 − recognition_threshold`; the threshold names a distance
//! budget, so the comparison itself is a similarity floor.
//!
//! The store is a process-wide cache over the durable graph: the resolver
//! seeds it at startup from persisted records and appends on enrollment, so
//! it is refreshed incrementally on every write rather than re-queried.

use parley_types::PersonId;

/// Compute the cosine similarity between two equal-length vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` if either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// All enrolled face embeddings, matchable by cosine similarity.
#[derive(Debug, Default)]
pub struct EmbeddingStore {
    known: Vec<(PersonId, Vec<f32>)>,
}

impl EmbeddingStore {
    /// An empty store (no one enrolled yet).
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store from persisted `(id, embedding)` pairs.
    pub fn with_known(known: Vec<(PersonId, Vec<f32>)>) -> Self {
        Self { known }
    }

    /// Number of enrolled identities.
    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    /// Best-scoring enrolled identity for `embedding`, if any are enrolled.
    /// Mismatched-dimension entries are skipped.
    pub fn best_match(&self, embedding: &[f32]) -> Option<(&PersonId, f32)> {
        self.known
            .iter()
            .filter(|(_, e)| e.len() == embedding.len())
            .map(|(id, e)| (id, cosine_similarity(e, embedding)))
            .max_by(|a, b| a.1.total_cmp(&b.1))
    }

    /// Match `embedding` against the enrolled set.
    ///
    /// Accepts the best candidate only when its similarity is at least
    /// `1 − recognition_threshold`; otherwise the face is unknown.
    pub fn match_face(&self, embedding: &[f32], recognition_threshold: f32) -> Option<PersonId> {
        let (id, score) = self.best_match(embedding)?;
        if score >= 1.0 - recognition_threshold {
            Some(id.clone())
        } else {
            None
        }
    }

    /// Enroll a brand-new identity for `embedding` and return its id.
    ///
    /// Ids are `face_N` with `N` one past the highest already present, so an
    /// id is never reused even after other records disappear.
    pub fn enroll(&mut self, embedding: Vec<f32>) -> PersonId {
        let next = self
            .known
            .iter()
            .filter_map(|(id, _)| id.as_str().strip_prefix("face_"))
            .filter_map(|n| n.parse::<u64>().ok())
            .max()
            .map_or(1, |m| m + 1);
        let id = PersonId::from_face_number(next);
        self.known.push((id.clone(), embedding));
        id
    }
}

//! Fuzzy label-to-capability dispatch.
//!
//! Stored states and classifier verdicts are matched against registered
//! capability names by string similarity rather than equality, so a label
//! that drifted through persistence or a slightly off classifier reply
//! ("custom movment") still lands on the right behavior. Ties go to the
//! earliest registration.

use std::sync::Arc;

use tracing::debug;

use parley_memory::names::similarity_ratio;
use parley_types::ParleyError;

use crate::capability::Capability;

/// Minimum similarity (0–100) for a label to dispatch at all.
pub const MIN_MATCH_SCORE: u32 = 55;

/// Registered capabilities, matched by name similarity.
#[derive(Default)]
pub struct Dispatcher {
    entries: Vec<(String, Arc<dyn Capability>)>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability under its own name. Registration order breaks
    /// score ties.
    pub fn register(&mut self, capability: Arc<dyn Capability>) {
        self.entries
            .push((capability.name().to_string(), capability));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve a state label to the best-matching capability.
    pub fn resolve(&self, label: &str) -> Result<Arc<dyn Capability>, ParleyError> {
        let mut best: Option<(u32, &Arc<dyn Capability>)> = None;
        for (name, capability) in &self.entries {
            let score = similarity_ratio(label, name);
            if score >= MIN_MATCH_SCORE && best.is_none_or(|(b, _)| score > b) {
                best = Some((score, capability));
            }
        }
        match best {
            Some((score, capability)) => {
                debug!(label, matched = capability.name(), score, "dispatched");
                Ok(capability.clone())
            }
            None => Err(ParleyError::NoCapability(label.to_string())),
        }
    }
}

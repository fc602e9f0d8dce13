//! Per-utterance conversation-state classification.
//!
//! Every turn, the transcript is shown to a model with a fixed instruction
//! whose only legal outputs are the state labels plus the two transient
//! directives `no-change` and `bad-input`. The verdict is then run through
//! the head-pose gate: someone clearly facing the camera can rescue a
//! `bad-input` verdict (they are talking *to* the robot, however garbled),
//! while a turned-away or absent face forces the turn to be treated as bad
//! input regardless of what the words said.

use std::sync::Arc;

use tracing::{debug, warn};

use parley_perception::pose_class::FacePoseClass;
use parley_types::{ChatMessage, ConversationState, StateVerdict};

use crate::llm::{ChatProvider, LlmError};

/// The classifier's fixed instruction. The label vocabulary is closed; the
/// parser treats anything else as `no-change`.
pub const STATE_INSTRUCTION: &str = "\
You classify one user utterance for a conversational robot. Reply with \
exactly one label and nothing else:
- speak: ordinary conversation, questions, small talk
- silent: the user asks the robot to stop talking or be quiet
- vision: the user asks what the robot can see or about something shown to it
- custom-movement: the user describes a motion for the robot to perform
- standard-movement: the user asks for a named gesture (wave, bow, nod)
- object-find: the user asks the robot to locate or look up an object
- reset: the user asks to start over or forget this conversation
- no-change: the utterance continues the current activity; keep the current state
- bad-input: noise, fragments, or speech not addressed to the robot";

/// Parse a raw classifier reply into a verdict.
///
/// Unknown labels collapse to [`StateVerdict::NoChange`]: a model inventing
/// vocabulary must never move someone's stored state.
pub fn parse_verdict(raw: &str) -> StateVerdict {
    let label = raw.trim().trim_matches(['"', '\'', '.']).to_lowercase();
    match label.as_str() {
        "no-change" => StateVerdict::NoChange,
        "bad-input" => StateVerdict::BadInput,
        other => match ConversationState::parse_label(other) {
            Some(state) => StateVerdict::Set(state),
            None => {
                warn!(label = other, "classifier emitted unknown label, keeping state");
                StateVerdict::NoChange
            }
        },
    }
}

/// Apply the head-pose gate to a classifier verdict.
///
/// - A disengaged face (turned away or absent) forces `bad-input`.
/// - A directly frontal face rescues a `bad-input` verdict into `speak`.
/// - Otherwise the verdict stands.
pub fn apply_pose_gate(verdict: StateVerdict, pose: FacePoseClass) -> StateVerdict {
    if !pose.is_engaged() {
        return StateVerdict::BadInput;
    }
    if verdict == StateVerdict::BadInput && pose == FacePoseClass::Front {
        return StateVerdict::Set(ConversationState::Speak);
    }
    verdict
}

/// Classifier bound to a chat provider.
pub struct StateClassifier {
    provider: Arc<dyn ChatProvider>,
}

impl StateClassifier {
    pub fn new(provider: Arc<dyn ChatProvider>) -> Self {
        Self { provider }
    }

    /// Classify one utterance.
    pub async fn classify(&self, utterance: &str) -> Result<StateVerdict, LlmError> {
        let messages = vec![
            ChatMessage::system(STATE_INSTRUCTION),
            ChatMessage::user(utterance),
        ];
        let raw = self.provider.complete(&messages).await?;
        let verdict = parse_verdict(&raw);
        debug!(raw = raw.trim(), ?verdict, "classified utterance");
        Ok(verdict)
    }
}

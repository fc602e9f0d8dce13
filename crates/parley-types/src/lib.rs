use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Stable opaque identifier for one recognized individual (e.g. `"face_42"`).
///
/// Assigned once at enrollment and never reused. People who are only *talked
/// about* (referenced by name before ever being seen) get a synthetic
/// `"name_<uuid>"` id until a later merge attaches them to a real identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PersonId(pub String);

impl PersonId {
    /// Build the id for the `n`-th enrolled face.
    pub fn from_face_number(n: u64) -> Self {
        Self(format!("face_{n}"))
    }

    /// Build a synthetic id for a person known only by name.
    pub fn from_name_reference() -> Self {
        Self(format!("name_{}", Uuid::new_v4()))
    }

    /// `true` when this id was created from a name reference rather than an
    /// enrolled face embedding.
    pub fn is_name_only(&self) -> bool {
        self.0.starts_with("name_")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PersonId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Closed vocabulary of behavioral states a person's record can hold.
///
/// The transient directives `no-change` and `bad-input` are *not* variants
/// here on purpose: they never overwrite a stored state. They live in
/// [`StateVerdict`], the classifier's output type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConversationState {
    Speak,
    Silent,
    Vision,
    CustomMovement,
    StandardMovement,
    ObjectFind,
    BadInput,
    Reset,
}

impl ConversationState {
    /// The canonical wire label for this state.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Speak => "speak",
            Self::Silent => "silent",
            Self::Vision => "vision",
            Self::CustomMovement => "custom-movement",
            Self::StandardMovement => "standard-movement",
            Self::ObjectFind => "object-find",
            Self::BadInput => "bad-input",
            Self::Reset => "reset",
        }
    }

    /// Parse a canonical label back into a state. Returns `None` for anything
    /// outside the closed vocabulary (including the transient directives).
    pub fn parse_label(label: &str) -> Option<Self> {
        match label {
            "speak" => Some(Self::Speak),
            "silent" => Some(Self::Silent),
            "vision" => Some(Self::Vision),
            "custom-movement" => Some(Self::CustomMovement),
            "standard-movement" => Some(Self::StandardMovement),
            "object-find" => Some(Self::ObjectFind),
            "bad-input" => Some(Self::BadInput),
            "reset" => Some(Self::Reset),
            _ => None,
        }
    }
}

impl Default for ConversationState {
    fn default() -> Self {
        Self::Speak
    }
}

impl std::fmt::Display for ConversationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// The utterance classifier's verdict for one turn.
///
/// `NoChange` keeps the stored state as-is; `BadInput` runs the bad-input
/// capability without touching the stored state. Only `Set` writes through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateVerdict {
    /// Overwrite the stored state with this label.
    Set(ConversationState),
    /// Keep the current state.
    NoChange,
    /// Run the bad-input capability; stored state is untouched.
    BadInput,
}

/// Role of one chat message participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single message in a provider-bound conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// Side-channel tag telling downstream consumers how to treat a fragment:
/// plain speech or a structured action payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentMode {
    /// Plain speech text, forwarded to speech synthesis.
    Default,
    /// The fragment text is a [`MovementPlan`] JSON document.
    CustomMovement,
    /// A movement plan drawn from the fixed gesture library.
    StandardMovement,
    /// The fragment text is a [`LookupTask`] JSON document for the secondary
    /// lookup service.
    ObjectFind,
    /// A short typed error surfaced to the user; the session continues.
    Error,
}

impl FragmentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::CustomMovement => "custom_movement",
            Self::StandardMovement => "standard_movement",
            Self::ObjectFind => "object_find",
            Self::Error => "error",
        }
    }
}

/// One streamed unit of a capability's response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fragment {
    pub text: String,
    pub mode: FragmentMode,
}

impl Fragment {
    pub fn speech(text: impl Into<String>) -> Self {
        Self { text: text.into(), mode: FragmentMode::Default }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self { text: text.into(), mode: FragmentMode::Error }
    }
}

/// Strict definition of the joint-movement payload a capability may emit.
/// The actuation layer parses this; the core only guarantees it serializes.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MovementPlan {
    pub action_list: Vec<JointCommand>,
}

/// One joint target inside a [`MovementPlan`].
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JointCommand {
    /// Actuator name as known to the robot (e.g. `"RShoulderPitch"`).
    pub joint_name: String,
    /// Target angle in degrees.
    pub angle: f32,
    /// Normalized joint speed in `[0, 1]`.
    pub speed: f32,
}

/// Structured task handed to the secondary lookup service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupTask {
    pub api_name: String,
    pub api_details: serde_json::Value,
}

/// One durable person record as loaded from the memory graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonRecord {
    pub id: PersonId,
    pub display_name: Option<String>,
    pub state: ConversationState,
    /// Ordered, exactly-deduplicated free-text facts about the person.
    pub attributes: Vec<String>,
    /// Sequence number of the chain head, or `None` for an empty chain.
    pub head_seq: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl PersonRecord {
    /// A fresh record in the default `speak` state.
    pub fn new(id: PersonId) -> Self {
        Self {
            id,
            display_name: None,
            state: ConversationState::Speak,
            attributes: Vec::new(),
            head_seq: None,
            created_at: Utc::now(),
        }
    }
}

/// Errors that cross crate boundaries in the parley stack.
#[derive(Error, Debug)]
pub enum ParleyError {
    #[error("provider error: {0}")]
    Provider(String),

    #[error("media decode error: {0}")]
    Decode(String),

    #[error("memory graph error: {0}")]
    Graph(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("no capability matched state label '{0}'")]
    NoCapability(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn person_id_face_number_format() {
        let id = PersonId::from_face_number(42);
        assert_eq!(id.as_str(), "face_42");
        assert!(!id.is_name_only());
    }

    #[test]
    fn person_id_name_reference_is_name_only() {
        let id = PersonId::from_name_reference();
        assert!(id.is_name_only());
    }

    #[test]
    fn state_labels_roundtrip() {
        for state in [
            ConversationState::Speak,
            ConversationState::Silent,
            ConversationState::Vision,
            ConversationState::CustomMovement,
            ConversationState::StandardMovement,
            ConversationState::ObjectFind,
            ConversationState::BadInput,
            ConversationState::Reset,
        ] {
            assert_eq!(ConversationState::parse_label(state.label()), Some(state));
        }
    }

    #[test]
    fn directives_are_not_states() {
        assert_eq!(ConversationState::parse_label("no-change"), None);
        assert_eq!(ConversationState::parse_label("gibberish"), None);
    }

    #[test]
    fn default_state_is_speak() {
        assert_eq!(ConversationState::default(), ConversationState::Speak);
    }

    #[test]
    fn chat_message_serializes_role_lowercase() {
        let msg = ChatMessage::system("hello");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"system\""));
    }

    #[test]
    fn movement_plan_roundtrip() {
        let plan = MovementPlan {
            action_list: vec![JointCommand {
                joint_name: "RShoulderPitch".to_string(),
                angle: -45.0,
                speed: 0.3,
            }],
        };
        let json = serde_json::to_string(&plan).unwrap();
        let back: MovementPlan = serde_json::from_str(&json).unwrap();
        assert_eq!(back.action_list.len(), 1);
        assert_eq!(back.action_list[0].joint_name, "RShoulderPitch");
    }

    #[test]
    fn movement_plan_parses_wire_document() {
        let raw = r#"{"action_list":[{"joint_name":"HeadYaw","angle":30.0,"speed":0.5}]}"#;
        let plan: MovementPlan = serde_json::from_str(raw).unwrap();
        assert!((plan.action_list[0].angle - 30.0).abs() < f32::EPSILON);
    }

    #[test]
    fn fragment_mode_wire_names() {
        assert_eq!(FragmentMode::Default.as_str(), "default");
        assert_eq!(FragmentMode::CustomMovement.as_str(), "custom_movement");
        assert_eq!(FragmentMode::ObjectFind.as_str(), "object_find");
    }

    #[test]
    fn new_person_record_defaults() {
        let rec = PersonRecord::new(PersonId::from_face_number(1));
        assert_eq!(rec.state, ConversationState::Speak);
        assert!(rec.attributes.is_empty());
        assert!(rec.head_seq.is_none());
    }
}

//! The capability set.
//!
//! A capability is the behavior bound to one conversation state: it takes
//! the turn context and produces an ordered stream of [`Fragment`]s. Speech
//! capabilities stream token by token so synthesis can start early; action
//! capabilities emit one structured payload (a movement plan, a lookup
//! task) tagged with the matching [`FragmentMode`].
//!
//! Capabilities own the side effects of their turn: appending the exchange
//! to the person's chain, and resetting a one-shot state (vision, movement,
//! object lookup, reset) back to `speak` so the next turn starts clean.

use std::pin::Pin;
use std::sync::Arc;

use async_stream::stream;
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use schemars::schema_for;
use tracing::warn;

use parley_memory::graph::{ConversationGraph, Relationship};
use parley_memory::names::similarity_ratio;
use parley_middleware::secondary::LookupRegistry;
use parley_perception::Frame;
use parley_types::{
    ChatMessage, ConversationState, Fragment, FragmentMode, JointCommand, LookupTask,
    MovementPlan, ParleyError, PersonRecord, Role,
};

use crate::llm::{ChatProvider, LlmError, TextEmbedder};

/// A capability's response stream.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<Fragment, ParleyError>> + Send>>;

/// Everything a capability can know about the current turn.
pub struct TurnContext {
    pub person: PersonRecord,
    pub utterance: String,
    /// Still image attached to the turn, for vision.
    pub image: Option<Frame>,
    /// Embedding of the utterance, for retrieval. Absent when the embedder
    /// was unavailable; retrieval then degrades to pure recency.
    pub query_embedding: Option<Vec<f32>>,
}

/// One behavior bound to a conversation state label.
#[async_trait]
pub trait Capability: Send + Sync {
    /// The state label this capability answers to.
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: TurnContext) -> FragmentStream;
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Build the persona system prompt for one person: who the robot is, who it
/// is talking to, and what it remembers about them.
pub fn build_persona_prompt(
    persona: &str,
    person: &PersonRecord,
    relationships: &[Relationship],
) -> String {
    let mut prompt = String::from(persona);
    match &person.display_name {
        Some(name) => {
            prompt.push_str(&format!("\n\nYou are talking to {name}."));
        }
        None => {
            prompt.push_str("\n\nYou are talking to someone whose name you do not know yet.");
        }
    }
    if !person.attributes.is_empty() {
        prompt.push_str("\nWhat you know about them:");
        for attr in &person.attributes {
            prompt.push_str(&format!("\n- {attr}"));
        }
    }
    if !relationships.is_empty() {
        prompt.push_str("\nTheir relationships:");
        for rel in relationships {
            prompt.push_str(&format!(
                "\n- {} {} {}",
                rel.src.as_str(),
                rel.rel_type.to_lowercase().replace('_', " "),
                rel.dst.as_str()
            ));
        }
    }
    prompt
}

/// Strip a Markdown code fence from a model reply, if present.
pub fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.trim_start_matches('\n')
        .strip_suffix("```")
        .unwrap_or(rest)
        .trim()
}

fn history_to_messages(history: &[parley_memory::graph::StoredMessage]) -> Vec<ChatMessage> {
    history
        .iter()
        .map(|m| match m.role {
            Role::System => ChatMessage::system(&m.text),
            Role::User => ChatMessage::user(&m.text),
            Role::Assistant => ChatMessage::assistant(&m.text),
        })
        .collect()
}

/// Persist one user/assistant exchange; failures are logged, never fatal to
/// the already-delivered response.
fn persist_exchange(
    graph: &ConversationGraph,
    ctx: &TurnContext,
    reply: &str,
    reply_embedding: Option<&[f32]>,
) {
    if let Err(e) = graph.append(
        &ctx.person.id,
        Role::User,
        &ctx.utterance,
        ctx.query_embedding.as_deref(),
    ) {
        warn!(error = %e, "failed to persist user message");
    }
    if let Err(e) = graph.append(&ctx.person.id, Role::Assistant, reply, reply_embedding) {
        warn!(error = %e, "failed to persist assistant message");
    }
}

fn reset_state_to_speak(graph: &ConversationGraph, person: &PersonRecord) {
    if let Err(e) = graph.set_state(&person.id, ConversationState::Speak) {
        warn!(error = %e, "failed to reset state after one-shot capability");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Speak
// ─────────────────────────────────────────────────────────────────────────────

/// Ordinary conversation: hybrid memory retrieval, persona prompt, streamed
/// reply, exchange persisted with embeddings.
pub struct SpeakCapability {
    graph: Arc<ConversationGraph>,
    provider: Arc<dyn ChatProvider>,
    embedder: Option<Arc<dyn TextEmbedder>>,
    persona: String,
    recency_k: usize,
    similar_m: usize,
}

impl SpeakCapability {
    pub fn new(
        graph: Arc<ConversationGraph>,
        provider: Arc<dyn ChatProvider>,
        embedder: Option<Arc<dyn TextEmbedder>>,
        persona: impl Into<String>,
        recency_k: usize,
        similar_m: usize,
    ) -> Self {
        Self {
            graph,
            provider,
            embedder,
            persona: persona.into(),
            recency_k,
            similar_m,
        }
    }
}

#[async_trait]
impl Capability for SpeakCapability {
    fn name(&self) -> &'static str {
        "speak"
    }

    async fn run(&self, ctx: TurnContext) -> FragmentStream {
        let graph = self.graph.clone();
        let provider = self.provider.clone();
        let embedder = self.embedder.clone();
        let persona = self.persona.clone();
        let (recency_k, similar_m) = (self.recency_k, self.similar_m);

        Box::pin(stream! {
            let query = ctx.query_embedding.clone().unwrap_or_default();
            let history = match graph.retrieve(&ctx.person.id, &query, recency_k, similar_m) {
                Ok(h) => h,
                Err(e) => {
                    yield Err(ParleyError::Graph(e.to_string()));
                    return;
                }
            };
            let relationships = graph
                .relationships_of(&ctx.person.id)
                .unwrap_or_default();

            let mut messages =
                vec![ChatMessage::system(build_persona_prompt(&persona, &ctx.person, &relationships))];
            messages.extend(history_to_messages(&history));
            // The current utterance always comes last, after retrieved context.
            messages.push(ChatMessage::user(&ctx.utterance));

            let mut tokens = match provider.stream(&messages).await {
                Ok(s) => s,
                Err(e) => {
                    yield Err(ParleyError::Provider(e.to_string()));
                    return;
                }
            };

            let mut reply = String::new();
            while let Some(token) = tokens.next().await {
                match token {
                    Ok(t) => {
                        reply.push_str(&t);
                        yield Ok(Fragment::speech(t));
                    }
                    Err(e) => {
                        yield Err(ParleyError::Provider(e.to_string()));
                        return;
                    }
                }
            }

            let reply_embedding = match &embedder {
                Some(embedder) => embedder.embed(&reply).await.ok(),
                None => None,
            };
            persist_exchange(&graph, &ctx, &reply, reply_embedding.as_deref());
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Silent
// ─────────────────────────────────────────────────────────────────────────────

/// The robot holds its tongue. No fragments, but the utterance still enters
/// the chain so the conversation record stays complete across silent turns.
pub struct SilentCapability {
    graph: Arc<ConversationGraph>,
}

impl SilentCapability {
    pub fn new(graph: Arc<ConversationGraph>) -> Self {
        Self { graph }
    }
}

#[async_trait]
impl Capability for SilentCapability {
    fn name(&self) -> &'static str {
        "silent"
    }

    async fn run(&self, ctx: TurnContext) -> FragmentStream {
        if let Err(e) = self.graph.append(
            &ctx.person.id,
            Role::User,
            &ctx.utterance,
            ctx.query_embedding.as_deref(),
        ) {
            warn!(error = %e, "failed to persist silent-turn utterance");
        }
        Box::pin(futures_util::stream::empty())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Vision
// ─────────────────────────────────────────────────────────────────────────────

/// Whole-frame image description provider (a vision-language model).
#[async_trait]
pub trait ImageDescriber: Send + Sync {
    async fn describe(&self, frame: &Frame, prompt: &str) -> Result<String, LlmError>;
}

/// Answer a question about what the camera currently shows.
pub struct VisionCapability {
    graph: Arc<ConversationGraph>,
    describer: Arc<dyn ImageDescriber>,
}

impl VisionCapability {
    pub fn new(graph: Arc<ConversationGraph>, describer: Arc<dyn ImageDescriber>) -> Self {
        Self { graph, describer }
    }
}

#[async_trait]
impl Capability for VisionCapability {
    fn name(&self) -> &'static str {
        "vision"
    }

    async fn run(&self, ctx: TurnContext) -> FragmentStream {
        let graph = self.graph.clone();
        let describer = self.describer.clone();

        Box::pin(stream! {
            let Some(frame) = ctx.image.clone() else {
                yield Ok(Fragment::error("I can't see anything right now."));
                reset_state_to_speak(&graph, &ctx.person);
                return;
            };
            match describer.describe(&frame, &ctx.utterance).await {
                Ok(description) => {
                    yield Ok(Fragment::speech(description.clone()));
                    persist_exchange(&graph, &ctx, &description, None);
                }
                Err(e) => {
                    warn!(error = %e, "vision describer failed");
                    yield Ok(Fragment::error("I couldn't make out the image."));
                }
            }
            // Vision answers once and hands the person back to speak; without
            // this every later turn would re-enter the vision path.
            reset_state_to_speak(&graph, &ctx.person);
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Movement
// ─────────────────────────────────────────────────────────────────────────────

const MOVEMENT_INSTRUCTION: &str = "\
Translate the user's request into a robot joint movement plan. Reply with \
JSON only, shaped as {\"action_list\": [{\"joint_name\": \"...\", \
\"angle\": <degrees>, \"speed\": <0..1>}]}. Use Pepper joint names such as \
RShoulderPitch, LShoulderPitch, RElbowRoll, LElbowRoll, HeadYaw, HeadPitch, \
HipPitch. Keep speeds at or below 0.5.";

/// Marker stored in the chain after a movement turn, so later retrieval
/// shows a gesture happened without replaying joint JSON at the model.
const MOVEMENT_PERFORMED: &str = "movement performed";

/// Generate a bespoke movement plan from the user's description.
pub struct CustomMovementCapability {
    graph: Arc<ConversationGraph>,
    provider: Arc<dyn ChatProvider>,
}

impl CustomMovementCapability {
    pub fn new(graph: Arc<ConversationGraph>, provider: Arc<dyn ChatProvider>) -> Self {
        Self { graph, provider }
    }
}

#[async_trait]
impl Capability for CustomMovementCapability {
    fn name(&self) -> &'static str {
        "custom-movement"
    }

    async fn run(&self, ctx: TurnContext) -> FragmentStream {
        let graph = self.graph.clone();
        let provider = self.provider.clone();

        Box::pin(stream! {
            let messages = vec![
                ChatMessage::system(MOVEMENT_INSTRUCTION),
                ChatMessage::user(&ctx.utterance),
            ];
            let schema = serde_json::to_value(schema_for!(MovementPlan))
                .unwrap_or(serde_json::Value::Null);
            let raw = match provider.complete_with_schema(&messages, schema).await {
                Ok(r) => r,
                Err(e) => {
                    yield Err(ParleyError::Provider(e.to_string()));
                    return;
                }
            };
            match serde_json::from_str::<MovementPlan>(strip_code_fences(&raw)) {
                Ok(plan) => {
                    let payload = serde_json::to_string(&plan)
                        .unwrap_or_else(|_| raw.clone());
                    yield Ok(Fragment { text: payload, mode: FragmentMode::CustomMovement });
                    persist_exchange(&graph, &ctx, MOVEMENT_PERFORMED, None);
                    reset_state_to_speak(&graph, &ctx.person);
                }
                Err(e) => {
                    warn!(error = %e, "movement plan did not validate");
                    yield Ok(Fragment::error("I couldn't work out that movement."));
                    reset_state_to_speak(&graph, &ctx.person);
                }
            }
        })
    }
}

/// The built-in gesture library for standard movements.
pub fn standard_gestures() -> Vec<(String, MovementPlan)> {
    let cmd = |joint: &str, angle: f32, speed: f32| JointCommand {
        joint_name: joint.to_string(),
        angle,
        speed,
    };
    vec![
        (
            "wave".to_string(),
            MovementPlan {
                action_list: vec![
                    cmd("RShoulderPitch", -60.0, 0.4),
                    cmd("RElbowRoll", 60.0, 0.5),
                    cmd("RElbowRoll", 20.0, 0.5),
                    cmd("RElbowRoll", 60.0, 0.5),
                ],
            },
        ),
        (
            "bow".to_string(),
            MovementPlan {
                action_list: vec![cmd("HipPitch", -25.0, 0.2), cmd("HeadPitch", 15.0, 0.2)],
            },
        ),
        (
            "nod".to_string(),
            MovementPlan {
                action_list: vec![cmd("HeadPitch", 20.0, 0.3), cmd("HeadPitch", -5.0, 0.3)],
            },
        ),
    ]
}

/// Pick a gesture from the fixed library by fuzzy-matching the request.
pub struct StandardMovementCapability {
    graph: Arc<ConversationGraph>,
    gestures: Vec<(String, MovementPlan)>,
}

impl StandardMovementCapability {
    pub fn new(graph: Arc<ConversationGraph>) -> Self {
        Self {
            graph,
            gestures: standard_gestures(),
        }
    }

    /// Best-matching gesture for an utterance, falling back to the first in
    /// the library when nothing scores.
    fn pick(&self, utterance: &str) -> &(String, MovementPlan) {
        let lowered = utterance.to_lowercase();
        self.gestures
            .iter()
            .max_by_key(|(name, _)| {
                if lowered.contains(name.as_str()) {
                    // A literal mention beats any fuzzy score.
                    200
                } else {
                    similarity_ratio(&lowered, name)
                }
            })
            .unwrap_or(&self.gestures[0])
    }
}

#[async_trait]
impl Capability for StandardMovementCapability {
    fn name(&self) -> &'static str {
        "standard-movement"
    }

    async fn run(&self, ctx: TurnContext) -> FragmentStream {
        let graph = self.graph.clone();
        let (name, plan) = self.pick(&ctx.utterance).clone();

        Box::pin(stream! {
            match serde_json::to_string(&plan) {
                Ok(payload) => {
                    tracing::debug!(gesture = %name, "standard movement selected");
                    yield Ok(Fragment { text: payload, mode: FragmentMode::StandardMovement });
                    persist_exchange(&graph, &ctx, MOVEMENT_PERFORMED, None);
                }
                Err(e) => {
                    yield Err(ParleyError::Provider(e.to_string()));
                }
            }
            reset_state_to_speak(&graph, &ctx.person);
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Object find
// ─────────────────────────────────────────────────────────────────────────────

const LOOKUP_INSTRUCTION: &str = "\
Turn the user's request into a lookup task. Reply with JSON only, shaped as \
{\"api_name\": \"object_find\", \"api_details\": {\"object\": \"...\"}}.";

/// Delegate the turn to a secondary lookup service.
pub struct ObjectFindCapability {
    graph: Arc<ConversationGraph>,
    provider: Arc<dyn ChatProvider>,
    lookups: Arc<LookupRegistry>,
}

impl ObjectFindCapability {
    pub fn new(
        graph: Arc<ConversationGraph>,
        provider: Arc<dyn ChatProvider>,
        lookups: Arc<LookupRegistry>,
    ) -> Self {
        Self {
            graph,
            provider,
            lookups,
        }
    }
}

#[async_trait]
impl Capability for ObjectFindCapability {
    fn name(&self) -> &'static str {
        "object-find"
    }

    async fn run(&self, ctx: TurnContext) -> FragmentStream {
        let graph = self.graph.clone();
        let provider = self.provider.clone();
        let lookups = self.lookups.clone();

        Box::pin(stream! {
            let messages = vec![
                ChatMessage::system(LOOKUP_INSTRUCTION),
                ChatMessage::user(&ctx.utterance),
            ];
            let raw = match provider.complete(&messages).await {
                Ok(r) => r,
                Err(e) => {
                    yield Err(ParleyError::Provider(e.to_string()));
                    return;
                }
            };
            let task = match serde_json::from_str::<LookupTask>(strip_code_fences(&raw)) {
                Ok(task) => task,
                Err(e) => {
                    warn!(error = %e, "lookup task did not validate");
                    yield Ok(Fragment::error("I couldn't work out what to look for."));
                    reset_state_to_speak(&graph, &ctx.person);
                    return;
                }
            };
            let payload = serde_json::to_string(&task).unwrap_or_else(|_| raw.clone());
            yield Ok(Fragment { text: payload, mode: FragmentMode::ObjectFind });

            match lookups.dispatch(&task).await {
                Ok(result) => {
                    yield Ok(Fragment::speech(result.clone()));
                    persist_exchange(&graph, &ctx, &result, None);
                }
                Err(e) => {
                    warn!(error = %e, "secondary lookup failed");
                    yield Ok(Fragment::error("The lookup didn't come back with anything."));
                }
            }
            reset_state_to_speak(&graph, &ctx.person);
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Bad input / reset
// ─────────────────────────────────────────────────────────────────────────────

/// The turn was noise or not addressed to the robot. A short prompt to try
/// again; nothing enters the chain.
pub struct BadInputCapability;

#[async_trait]
impl Capability for BadInputCapability {
    fn name(&self) -> &'static str {
        "bad-input"
    }

    async fn run(&self, _ctx: TurnContext) -> FragmentStream {
        Box::pin(futures_util::stream::once(async {
            Ok(Fragment::speech(
                "Sorry, I didn't catch that. Could you say it again?",
            ))
        }))
    }
}

/// Wipe the person's chain and put them back in `speak`.
pub struct ResetCapability {
    graph: Arc<ConversationGraph>,
}

impl ResetCapability {
    pub fn new(graph: Arc<ConversationGraph>) -> Self {
        Self { graph }
    }
}

#[async_trait]
impl Capability for ResetCapability {
    fn name(&self) -> &'static str {
        "reset"
    }

    async fn run(&self, ctx: TurnContext) -> FragmentStream {
        let graph = self.graph.clone();

        Box::pin(stream! {
            if let Err(e) = graph.reset_messages(&ctx.person.id) {
                yield Err(ParleyError::Graph(e.to_string()));
                return;
            }
            reset_state_to_speak(&graph, &ctx.person);
            yield Ok(Fragment::speech("Okay, let's start fresh."));
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

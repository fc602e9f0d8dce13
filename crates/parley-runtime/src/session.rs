//! The per-turn dialogue engine.
//!
//! [`SessionEngine`] owns the whole pipeline for one robot: camera frames
//! flow in through [`observe_frame`](SessionEngine::observe_frame) and keep
//! the identity resolver and pose vote current; client turns flow through
//! [`handle_turn`](SessionEngine::handle_turn), which transcribes, resolves
//! who is speaking, classifies the utterance, dispatches the matching
//! capability, and forwards its fragments to the response channel with a
//! final marker at the end. Answered utterances are queued for background
//! memory enrichment.
//!
//! One engine serves one camera and one response channel at a time; turns
//! are handled strictly in arrival order by the caller's loop, so two turns
//! for the same person can never interleave their chain writes.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tracing::{info, instrument, warn};

use parley_memory::graph::ConversationGraph;
use parley_memory::names::DEFAULT_NAME_THRESHOLD;
use parley_middleware::media::{MediaService, ResponseChunk, TurnRequest, normalize_transcript};
use parley_middleware::secondary::LookupRegistry;
use parley_perception::Frame;
use parley_perception::pose_class::{PoseClassifier, PoseVote};
use parley_perception::resolver::{
    BoundingBox, FaceEmbedder, IdentityResolver, Resolution, ResolverConfig,
};
use parley_perception::embedding::EmbeddingStore;
use parley_types::{
    Fragment, ParleyError, PersonId, PersonRecord, StateVerdict,
};

use crate::capability::{
    BadInputCapability, Capability, CustomMovementCapability, ImageDescriber,
    ObjectFindCapability, ResetCapability, SilentCapability, SpeakCapability,
    StandardMovementCapability, TurnContext, VisionCapability,
};
use crate::classifier::{StateClassifier, apply_pose_gate};
use crate::dispatch::Dispatcher;
use crate::enrich::{Enricher, EnrichmentHandles, ExtractionJob, spawn_workers};
use crate::llm::{ChatProvider, TextEmbedder};

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Persona text prepended to every speak prompt.
    pub persona: String,
    /// Recency arm of hybrid retrieval.
    pub recency_k: usize,
    /// Similarity arm of hybrid retrieval.
    pub similar_m: usize,
    /// Minimum similarity (0-100) for approximate name resolution during
    /// enrichment.
    pub name_threshold: u32,
    pub resolver: ResolverConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            persona: "You are a friendly conversational robot. Keep replies short \
                      and spoken-word natural."
                .to_string(),
            recency_k: 20,
            similar_m: 20,
            name_threshold: DEFAULT_NAME_THRESHOLD,
            resolver: ResolverConfig::default(),
        }
    }
}

/// Every external service the engine needs.
pub struct EngineServices {
    pub graph: Arc<ConversationGraph>,
    pub media: Arc<dyn MediaService>,
    pub face_embedder: Arc<dyn FaceEmbedder>,
    /// Optional whole-frame pose classifier; without it the pose gate is off.
    pub pose_classifier: Option<Arc<dyn PoseClassifier>>,
    pub provider: Arc<dyn ChatProvider>,
    pub embedder: Option<Arc<dyn TextEmbedder>>,
    pub describer: Arc<dyn ImageDescriber>,
    pub lookups: Arc<LookupRegistry>,
}

/// The per-robot dialogue engine.
pub struct SessionEngine {
    graph: Arc<ConversationGraph>,
    media: Arc<dyn MediaService>,
    face_embedder: Arc<dyn FaceEmbedder>,
    pose_classifier: Option<Arc<dyn PoseClassifier>>,
    resolver: Mutex<IdentityResolver>,
    pose_vote: Mutex<PoseVote>,
    classifier: StateClassifier,
    dispatcher: Dispatcher,
    embedder: Option<Arc<dyn TextEmbedder>>,
    enrichment: EnrichmentHandles,
}

impl SessionEngine {
    /// Build the engine: seed the recognition store from persisted face
    /// embeddings, wire the full capability set, spawn enrichment workers.
    pub fn new(services: EngineServices, config: EngineConfig) -> Result<Self, ParleyError> {
        let EngineServices {
            graph,
            media,
            face_embedder,
            pose_classifier,
            provider,
            embedder,
            describer,
            lookups,
        } = services;

        let known = graph
            .face_embeddings()
            .map_err(|e| ParleyError::Graph(e.to_string()))?;
        info!(enrolled = known.len(), "seeded recognition store");
        let resolver = IdentityResolver::new(config.resolver.clone(), EmbeddingStore::with_known(known));

        let mut dispatcher = Dispatcher::new();
        dispatcher.register(Arc::new(SpeakCapability::new(
            graph.clone(),
            provider.clone(),
            embedder.clone(),
            config.persona.clone(),
            config.recency_k,
            config.similar_m,
        )));
        dispatcher.register(Arc::new(SilentCapability::new(graph.clone())));
        dispatcher.register(Arc::new(VisionCapability::new(graph.clone(), describer)));
        dispatcher.register(Arc::new(CustomMovementCapability::new(
            graph.clone(),
            provider.clone(),
        )));
        dispatcher.register(Arc::new(StandardMovementCapability::new(graph.clone())));
        dispatcher.register(Arc::new(ObjectFindCapability::new(
            graph.clone(),
            provider.clone(),
            lookups,
        )));
        dispatcher.register(Arc::new(BadInputCapability));
        dispatcher.register(Arc::new(ResetCapability::new(graph.clone())));

        let enrichment = spawn_workers(Arc::new(
            Enricher::new(graph.clone(), provider.clone())
                .with_name_threshold(config.name_threshold),
        ));

        Ok(Self {
            graph,
            media,
            face_embedder,
            pose_classifier,
            resolver: Mutex::new(resolver),
            pose_vote: Mutex::new(PoseVote::default()),
            classifier: StateClassifier::new(provider),
            dispatcher,
            embedder,
            enrichment,
        })
    }

    /// Feed one camera frame into identity resolution and the pose vote.
    /// Failures are logged; a bad frame never stops the feed.
    pub async fn observe_frame(&self, frame: Frame) {
        if let Some(classifier) = &self.pose_classifier {
            match classifier.classify(&frame) {
                Ok(score) => self.pose_vote.lock().await.record(score),
                Err(e) => warn!(error = %e, "pose classification failed"),
            }
        }
        let mut resolver = self.resolver.lock().await;
        if let Err(e) = resolver.ingest(frame, self.face_embedder.as_ref()) {
            warn!(error = %e, "frame ingest failed");
        }
    }

    /// Bounding box of the face in the most recently observed frame, for the
    /// robot's head-tracking loop. `None` when the last frame had no face.
    pub async fn current_face_box(&self) -> Option<BoundingBox> {
        self.resolver.lock().await.last_face_box()
    }

    /// Resolve who is currently in front of the camera, persisting a fresh
    /// enrollment when the vote mints one.
    async fn resolve_person(&self) -> Result<Option<PersonId>, ParleyError> {
        let resolution = self.resolver.lock().await.resolve_current();
        match resolution {
            Resolution::Known(id) => Ok(Some(id)),
            Resolution::Enrolled(id, embedding, _snapshot) => {
                self.graph
                    .create_or_get(&id)
                    .map_err(|e| ParleyError::Graph(e.to_string()))?;
                self.graph
                    .set_face_embedding(&id, &embedding)
                    .map_err(|e| ParleyError::Graph(e.to_string()))?;
                info!(person = id.as_str(), "persisted new enrollment");
                Ok(Some(id))
            }
            Resolution::Nobody => Ok(None),
        }
    }

    /// Handle one client turn, forwarding response chunks into `out` and
    /// terminating with a final marker.
    #[instrument(skip_all)]
    pub async fn handle_turn(
        &self,
        request: TurnRequest,
        out: &mpsc::Sender<ResponseChunk>,
    ) -> Result<(), ParleyError> {
        let raw = self
            .media
            .transcribe(&request.audio)
            .await
            .map_err(|e| ParleyError::Decode(e.to_string()))?;
        let utterance = normalize_transcript(&raw);

        let image = match &request.image {
            Some(bytes) => Some(
                self.media
                    .decode_frame(bytes)
                    .await
                    .map_err(|e| ParleyError::Decode(e.to_string()))?,
            ),
            None => None,
        };

        // Who is speaking? Nobody resolved means the turn is treated as bad
        // input against an ephemeral record nothing gets written to.
        let (person, resolved) = match self.resolve_person().await? {
            Some(id) => {
                let record = self
                    .graph
                    .create_or_get(&id)
                    .map_err(|e| ParleyError::Graph(e.to_string()))?;
                (record, true)
            }
            None => (PersonRecord::new(PersonId("guest".to_string())), false),
        };

        let label = if resolved {
            let verdict = match self.classifier.classify(&utterance).await {
                Ok(v) => v,
                Err(e) => {
                    // A dead classifier must not kill the turn; the stored
                    // state carries it.
                    warn!(error = %e, "state classification failed, keeping state");
                    StateVerdict::NoChange
                }
            };
            let verdict = match &self.pose_classifier {
                Some(_) => apply_pose_gate(verdict, self.pose_vote.lock().await.current()),
                None => verdict,
            };
            match verdict {
                StateVerdict::Set(state) => {
                    self.graph
                        .set_state(&person.id, state)
                        .map_err(|e| ParleyError::Graph(e.to_string()))?;
                    state.label()
                }
                StateVerdict::NoChange => person.state.label(),
                StateVerdict::BadInput => "bad-input",
            }
        } else {
            "bad-input"
        };

        let query_embedding = match &self.embedder {
            Some(embedder) => embedder.embed(&utterance).await.ok(),
            None => None,
        };

        // Re-read the record so the capability sees the state it runs under.
        let person = if resolved {
            self.graph
                .create_or_get(&person.id)
                .map_err(|e| ParleyError::Graph(e.to_string()))?
        } else {
            person
        };
        let person_id = person.id.clone();

        let capability = self.dispatcher.resolve(label)?;
        info!(person = person_id.as_str(), label, capability = capability.name(), "turn dispatched");

        let ctx = TurnContext {
            person,
            utterance: utterance.clone(),
            image,
            query_embedding,
        };
        let mut fragments = capability.run(ctx).await;
        use futures_util::StreamExt;
        while let Some(item) = fragments.next().await {
            let chunk = match item {
                Ok(fragment) => ResponseChunk::from_fragment(fragment),
                Err(e) => {
                    warn!(error = %e, "capability stream error");
                    ResponseChunk::from_fragment(Fragment::error(e.to_string()))
                }
            };
            out.send(chunk)
                .await
                .map_err(|e| ParleyError::Channel(e.to_string()))?;
        }
        out.send(ResponseChunk::final_marker())
            .await
            .map_err(|e| ParleyError::Channel(e.to_string()))?;

        // Enrichment runs off the hot path, only for real people and real
        // utterances.
        if resolved && label != "bad-input" {
            self.enrichment.enqueue(ExtractionJob {
                person: person_id,
                utterance,
            });
        }
        Ok(())
    }

    /// Stop the enrichment workers and wait for queued jobs to drain.
    pub async fn shutdown(self) {
        let EnrichmentHandles {
            relationship_tx,
            attribute_tx,
            workers,
        } = self.enrichment;
        drop(relationship_tx);
        drop(attribute_tx);
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "enrichment worker panicked");
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use parley_middleware::media::MediaError;
    use parley_perception::PerceptionError;
    use parley_perception::pose::{FaceLandmarks, Landmark};
    use parley_perception::resolver::{BoundingBox, FaceObservation};
    use parley_types::{ChatMessage, FragmentMode};

    use crate::llm::{LlmError, TokenStream};

    struct StubMedia(&'static str);

    #[async_trait]
    impl MediaService for StubMedia {
        async fn transcribe(&self, _: &[u8]) -> Result<String, MediaError> {
            Ok(self.0.to_string())
        }

        async fn decode_frame(&self, image: &[u8]) -> Result<Frame, MediaError> {
            Ok(Frame::new(image.to_vec(), 640, 480))
        }
    }

    /// Always reports the same frontal face with the given embedding.
    struct FixedFace(Vec<f32>);

    impl FaceEmbedder for FixedFace {
        fn detect(&self, _: &Frame) -> Result<Option<FaceObservation>, PerceptionError> {
            let lm = |x: f32, y: f32| Landmark { x, y };
            Ok(Some(FaceObservation {
                embedding: self.0.clone(),
                bbox: BoundingBox {
                    x: 250.0,
                    y: 150.0,
                    width: 100.0,
                    height: 150.0,
                },
                landmarks: FaceLandmarks {
                    right_eye: lm(290.0, 200.0),
                    left_eye: lm(350.0, 200.0),
                    nose_tip: lm(320.0, 240.0),
                    right_mouth: lm(295.0, 280.0),
                    left_mouth: lm(345.0, 280.0),
                },
            }))
        }
    }

    /// Classifier turns get a fixed label; everything else streams a reply.
    struct SplitProvider {
        label: &'static str,
        reply: &'static str,
    }

    #[async_trait]
    impl ChatProvider for SplitProvider {
        async fn complete(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
            if messages[0].content.contains("exactly one label") {
                Ok(self.label.to_string())
            } else {
                Ok(self.reply.to_string())
            }
        }

        async fn stream(&self, _: &[ChatMessage]) -> Result<TokenStream, LlmError> {
            let tokens: Vec<Result<String, LlmError>> = self
                .reply
                .split_inclusive(' ')
                .map(|t| Ok(t.to_string()))
                .collect();
            Ok(Box::pin(futures_util::stream::iter(tokens)))
        }
    }

    struct NoVision;

    #[async_trait]
    impl ImageDescriber for NoVision {
        async fn describe(&self, _: &Frame, _: &str) -> Result<String, LlmError> {
            Ok("a sunny room".to_string())
        }
    }

    fn engine_with(label: &'static str, reply: &'static str) -> SessionEngine {
        let graph = Arc::new(ConversationGraph::open_in_memory().unwrap());
        let services = EngineServices {
            graph,
            media: Arc::new(StubMedia("hello robot")),
            face_embedder: Arc::new(FixedFace(vec![0.0, 0.0, 1.0])),
            pose_classifier: None,
            provider: Arc::new(SplitProvider { label, reply }),
            embedder: None,
            describer: Arc::new(NoVision),
            lookups: Arc::new(LookupRegistry::new()),
        };
        SessionEngine::new(services, EngineConfig::default()).unwrap()
    }

    async fn drain(rx: &mut mpsc::Receiver<ResponseChunk>) -> Vec<ResponseChunk> {
        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            let done = chunk.is_final;
            chunks.push(chunk);
            if done {
                break;
            }
        }
        chunks
    }

    #[tokio::test]
    async fn full_speak_turn_streams_and_persists() {
        let engine = engine_with("speak", "hi there friend");
        // Enough frames for the vote to enroll the unknown face.
        for _ in 0..10 {
            engine.observe_frame(Frame::new(vec![0], 640, 480)).await;
        }
        // Head tracking sees the face from the latest frame.
        assert!(engine.current_face_box().await.is_some());

        let (tx, mut rx) = mpsc::channel(32);
        engine
            .handle_turn(TurnRequest::audio_only(vec![1, 2, 3]), &tx)
            .await
            .unwrap();

        let chunks = drain(&mut rx).await;
        assert!(chunks.last().unwrap().is_final);
        let speech: String = chunks
            .iter()
            .filter(|c| !c.is_final)
            .map(|c| c.text.as_str())
            .collect();
        assert_eq!(speech, "hi there friend");

        // The enrolled person's chain now holds the exchange.
        let persons = engine.graph.all_persons().unwrap();
        assert_eq!(persons.len(), 1);
        assert_eq!(persons[0].as_str(), "face_1");
        let chain = engine.graph.messages_of(&persons[0]).unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].text, "hello robot");

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn nobody_in_view_is_bad_input_and_writes_nothing() {
        let engine = engine_with("speak", "unused");
        // No frames observed: the window is empty, nobody resolves.
        let (tx, mut rx) = mpsc::channel(32);
        engine
            .handle_turn(TurnRequest::audio_only(vec![1]), &tx)
            .await
            .unwrap();

        let chunks = drain(&mut rx).await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].mode, FragmentMode::Default);
        assert!(chunks[0].text.contains("didn't catch"));
        assert!(chunks[1].is_final);
        assert!(engine.graph.all_persons().unwrap().is_empty());

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn classifier_set_verdict_persists_state() {
        let engine = engine_with("silent", "unused");
        for _ in 0..10 {
            engine.observe_frame(Frame::new(vec![0], 640, 480)).await;
        }

        let (tx, mut rx) = mpsc::channel(32);
        engine
            .handle_turn(TurnRequest::audio_only(vec![1]), &tx)
            .await
            .unwrap();
        let chunks = drain(&mut rx).await;
        // Silent capability emits only the final marker.
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_final);

        let persons = engine.graph.all_persons().unwrap();
        let rec = engine.graph.get(&persons[0]).unwrap().unwrap();
        assert_eq!(rec.state, parley_types::ConversationState::Silent);

        engine.shutdown().await;
    }
}

//! Background memory enrichment.
//!
//! After a turn is answered, its utterance is queued for two extraction
//! passes that run off the hot path: one mines relationships between people
//! ("my sister Grace"), one mines attributes and self-introductions ("I'm
//! Ada, I play chess"). Findings are written to the graph through
//! approximate name resolution, so "vikram" and "Vikram" land on the same
//! record, and a self-introduction can merge a name-only record into the
//! speaker's real one.
//!
//! Workers swallow their own failures: a malformed model reply or a dead
//! provider is logged and the job dropped, never surfaced to the
//! conversation.

use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use parley_memory::graph::{ConversationGraph, GraphError};
use parley_memory::names::{DEFAULT_NAME_THRESHOLD, NameRegistry};
use parley_types::{ChatMessage, PersonId};

use crate::capability::strip_code_fences;
use crate::llm::ChatProvider;

const RELATIONSHIP_INSTRUCTION: &str = "\
Extract person-to-person relationships from the utterance. Reply with JSON \
only, shaped as {\"relationships\": [{\"src\": \"<name>\", \"rel_type\": \
\"<UPPER_SNAKE type>\", \"dst\": \"<name>\"}]}. Use \"self\" as the name \
when the speaker refers to themselves. Reply with an empty list when there \
is nothing to extract.";

const ATTRIBUTE_INSTRUCTION: &str = "\
Extract durable facts about the speaker from the utterance. Reply with JSON \
only, shaped as {\"name\": \"<their name or null>\", \"attributes\": \
[\"<short fact>\"]}. Only include facts worth remembering across \
conversations. Reply with null and an empty list when there is nothing.";

/// One queued extraction pass.
#[derive(Debug, Clone)]
pub struct ExtractionJob {
    pub person: PersonId,
    pub utterance: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Reply parsing
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RelationEdge {
    pub src: String,
    pub rel_type: String,
    pub dst: String,
}

#[derive(Debug, Deserialize)]
struct RelationshipReply {
    #[serde(default)]
    relationships: Vec<RelationEdge>,
}

/// Findings of one attribute pass.
#[derive(Debug, Deserialize, PartialEq)]
pub struct AttributeFindings {
    /// The speaker's name, when the utterance reveals it.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub attributes: Vec<String>,
}

pub fn parse_relationship_reply(raw: &str) -> Result<Vec<RelationEdge>, serde_json::Error> {
    let reply: RelationshipReply = serde_json::from_str(strip_code_fences(raw))?;
    Ok(reply.relationships)
}

pub fn parse_attribute_reply(raw: &str) -> Result<AttributeFindings, serde_json::Error> {
    serde_json::from_str(strip_code_fences(raw))
}

// ─────────────────────────────────────────────────────────────────────────────
// Enricher
// ─────────────────────────────────────────────────────────────────────────────

/// Shared extraction logic behind both workers.
pub struct Enricher {
    graph: Arc<ConversationGraph>,
    provider: Arc<dyn ChatProvider>,
    name_threshold: u32,
}

impl Enricher {
    pub fn new(graph: Arc<ConversationGraph>, provider: Arc<dyn ChatProvider>) -> Self {
        Self {
            graph,
            provider,
            name_threshold: DEFAULT_NAME_THRESHOLD,
        }
    }

    pub fn with_name_threshold(mut self, threshold: u32) -> Self {
        self.name_threshold = threshold;
        self
    }

    /// Resolve a heard name to a known person, or mint a name-only record.
    fn resolve_or_create(
        &self,
        registry: &NameRegistry,
        heard: &str,
    ) -> Result<PersonId, GraphError> {
        if let Some((id, canonical)) = registry.resolve_approx(heard, self.name_threshold) {
            debug!(heard, canonical, "resolved name to existing person");
            return Ok(id);
        }
        let id = PersonId::from_name_reference();
        self.graph.create_or_get(&id)?;
        self.graph.set_display_name(&id, heard)?;
        info!(heard, person = id.as_str(), "created name-only person");
        Ok(id)
    }

    /// Run one relationship pass over an utterance.
    pub async fn extract_relationships(&self, job: &ExtractionJob) -> Result<(), GraphError> {
        let messages = vec![
            ChatMessage::system(RELATIONSHIP_INSTRUCTION),
            ChatMessage::user(&job.utterance),
        ];
        let raw = match self.provider.complete(&messages).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "relationship extraction provider failed");
                return Ok(());
            }
        };
        let edges = match parse_relationship_reply(&raw) {
            Ok(edges) => edges,
            Err(e) => {
                warn!(error = %e, "relationship reply did not parse");
                return Ok(());
            }
        };

        let mut registry = NameRegistry::new();
        registry.refresh(&self.graph)?;
        for edge in edges {
            let src = if edge.src.eq_ignore_ascii_case("self") {
                job.person.clone()
            } else {
                self.resolve_or_create(&registry, &edge.src)?
            };
            let dst = if edge.dst.eq_ignore_ascii_case("self") {
                job.person.clone()
            } else {
                self.resolve_or_create(&registry, &edge.dst)?
            };
            self.graph.add_relationship(&src, &edge.rel_type, &dst)?;
            // Records may have been minted above; later edges in this batch
            // should resolve against them.
            registry.refresh(&self.graph)?;
        }
        Ok(())
    }

    /// Run one attribute pass over an utterance.
    ///
    /// A revealed name is set on the speaker's record; if a *name-only*
    /// record already matches that name approximately, it is merged into the
    /// speaker first, so facts heard about "Ada" before she was ever seen
    /// attach to her face record.
    pub async fn extract_attributes(&self, job: &ExtractionJob) -> Result<(), GraphError> {
        let messages = vec![
            ChatMessage::system(ATTRIBUTE_INSTRUCTION),
            ChatMessage::user(&job.utterance),
        ];
        let raw = match self.provider.complete(&messages).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "attribute extraction provider failed");
                return Ok(());
            }
        };
        let findings = match parse_attribute_reply(&raw) {
            Ok(findings) => findings,
            Err(e) => {
                warn!(error = %e, "attribute reply did not parse");
                return Ok(());
            }
        };

        if let Some(name) = &findings.name {
            let mut registry = NameRegistry::new();
            registry.refresh(&self.graph)?;
            if let Some((existing, _)) = registry.resolve_approx(name, self.name_threshold) {
                if existing.is_name_only() && existing != job.person {
                    info!(
                        source = existing.as_str(),
                        target = job.person.as_str(),
                        "self-introduction matched a name-only record, merging"
                    );
                    self.graph.merge_into(&existing, &job.person)?;
                }
            }
            self.graph.set_display_name(&job.person, name)?;
        }
        for attr in &findings.attributes {
            self.graph.add_attribute(&job.person, attr)?;
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Workers
// ─────────────────────────────────────────────────────────────────────────────

/// Senders into the two extraction queues plus the worker handles.
pub struct EnrichmentHandles {
    pub relationship_tx: mpsc::UnboundedSender<ExtractionJob>,
    pub attribute_tx: mpsc::UnboundedSender<ExtractionJob>,
    pub workers: Vec<JoinHandle<()>>,
}

impl EnrichmentHandles {
    /// Queue an utterance for both passes. Send failures mean the workers
    /// are gone (shutdown); the job is dropped silently.
    pub fn enqueue(&self, job: ExtractionJob) {
        let _ = self.relationship_tx.send(job.clone());
        let _ = self.attribute_tx.send(job);
    }
}

/// Spawn the two extraction workers. They exit when every sender is
/// dropped.
pub fn spawn_workers(enricher: Arc<Enricher>) -> EnrichmentHandles {
    let (relationship_tx, mut relationship_rx) = mpsc::unbounded_channel::<ExtractionJob>();
    let (attribute_tx, mut attribute_rx) = mpsc::unbounded_channel::<ExtractionJob>();

    let rel_enricher = enricher.clone();
    let rel_worker = tokio::spawn(async move {
        while let Some(job) = relationship_rx.recv().await {
            if let Err(e) = rel_enricher.extract_relationships(&job).await {
                warn!(error = %e, person = job.person.as_str(), "relationship pass failed");
            }
        }
    });
    let attr_worker = tokio::spawn(async move {
        while let Some(job) = attribute_rx.recv().await {
            if let Err(e) = enricher.extract_attributes(&job).await {
                warn!(error = %e, person = job.person.as_str(), "attribute pass failed");
            }
        }
    });

    EnrichmentHandles {
        relationship_tx,
        attribute_tx,
        workers: vec![rel_worker, attr_worker],
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::llm::{LlmError, TokenStream};

    struct Scripted(String);

    #[async_trait]
    impl ChatProvider for Scripted {
        async fn complete(&self, _: &[ChatMessage]) -> Result<String, LlmError> {
            Ok(self.0.clone())
        }

        async fn stream(&self, _: &[ChatMessage]) -> Result<TokenStream, LlmError> {
            unimplemented!("enrichment never streams")
        }
    }

    fn enricher_with(graph: Arc<ConversationGraph>, reply: &str) -> Enricher {
        Enricher::new(graph, Arc::new(Scripted(reply.to_string())))
    }

    // ── parsing ──────────────────────────────────────────────────────────────

    #[test]
    fn relationship_reply_parses_with_and_without_fences() {
        let raw = r#"{"relationships":[{"src":"self","rel_type":"BROTHER_OF","dst":"Grace"}]}"#;
        let edges = parse_relationship_reply(raw).unwrap();
        assert_eq!(edges[0].dst, "Grace");

        let fenced = format!("```json\n{raw}\n```");
        assert_eq!(parse_relationship_reply(&fenced).unwrap(), edges);
    }

    #[test]
    fn empty_relationship_reply_is_fine() {
        assert!(parse_relationship_reply("{}").unwrap().is_empty());
    }

    #[test]
    fn attribute_reply_parses_nulls() {
        let findings = parse_attribute_reply(r#"{"name": null, "attributes": []}"#).unwrap();
        assert!(findings.name.is_none());
        assert!(findings.attributes.is_empty());
    }

    #[test]
    fn malformed_reply_is_an_error() {
        assert!(parse_relationship_reply("not json").is_err());
        assert!(parse_attribute_reply("also not json").is_err());
    }

    // ── attribute pass ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn attributes_land_on_the_speaker() {
        let graph = Arc::new(ConversationGraph::open_in_memory().unwrap());
        let id = PersonId::from_face_number(1);
        graph.create_or_get(&id).unwrap();

        let enricher = enricher_with(
            graph.clone(),
            r#"{"name": "Ada", "attributes": ["likes chess", "plays guitar"]}"#,
        );
        let job = ExtractionJob {
            person: id.clone(),
            utterance: "I'm Ada, I like chess and play guitar".to_string(),
        };
        enricher.extract_attributes(&job).await.unwrap();

        let rec = graph.get(&id).unwrap().unwrap();
        assert_eq!(rec.display_name.as_deref(), Some("Ada"));
        assert_eq!(rec.attributes, vec!["likes chess", "plays guitar"]);
    }

    #[tokio::test]
    async fn self_introduction_merges_name_only_record() {
        let graph = Arc::new(ConversationGraph::open_in_memory().unwrap());
        let speaker = PersonId::from_face_number(1);
        graph.create_or_get(&speaker).unwrap();

        // Someone mentioned "Vikram" before he was ever seen.
        let ghost = PersonId::from_name_reference();
        graph.create_or_get(&ghost).unwrap();
        graph.set_display_name(&ghost, "vikram").unwrap();
        graph.add_attribute(&ghost, "works nights").unwrap();

        let enricher = enricher_with(graph.clone(), r#"{"name": "Vikram", "attributes": []}"#);
        let job = ExtractionJob {
            person: speaker.clone(),
            utterance: "I'm Vikram".to_string(),
        };
        enricher.extract_attributes(&job).await.unwrap();

        assert!(graph.get(&ghost).unwrap().is_none());
        let rec = graph.get(&speaker).unwrap().unwrap();
        assert_eq!(rec.display_name.as_deref(), Some("Vikram"));
        assert_eq!(rec.attributes, vec!["works nights"]);
    }

    #[tokio::test]
    async fn name_threshold_gates_approximate_merge() {
        // "vik" vs "Vikram" scores 66: above the default floor, below 70.
        let reply = r#"{"name": "Vikram", "attributes": []}"#;

        for (threshold, expect_merge) in [(DEFAULT_NAME_THRESHOLD, true), (70, false)] {
            let graph = Arc::new(ConversationGraph::open_in_memory().unwrap());
            let speaker = PersonId::from_face_number(1);
            graph.create_or_get(&speaker).unwrap();
            let ghost = PersonId::from_name_reference();
            graph.create_or_get(&ghost).unwrap();
            graph.set_display_name(&ghost, "vik").unwrap();

            let enricher =
                enricher_with(graph.clone(), reply).with_name_threshold(threshold);
            let job = ExtractionJob {
                person: speaker.clone(),
                utterance: "I'm Vikram".to_string(),
            };
            enricher.extract_attributes(&job).await.unwrap();

            assert_eq!(
                graph.get(&ghost).unwrap().is_none(),
                expect_merge,
                "threshold {threshold}"
            );
        }
    }

    #[tokio::test]
    async fn malformed_attribute_reply_is_swallowed() {
        let graph = Arc::new(ConversationGraph::open_in_memory().unwrap());
        let id = PersonId::from_face_number(1);
        graph.create_or_get(&id).unwrap();

        let enricher = enricher_with(graph.clone(), "total nonsense");
        let job = ExtractionJob {
            person: id.clone(),
            utterance: "hello".to_string(),
        };
        enricher.extract_attributes(&job).await.unwrap();
        assert!(graph.get(&id).unwrap().unwrap().attributes.is_empty());
    }

    // ── relationship pass ────────────────────────────────────────────────────

    #[tokio::test]
    async fn relationships_create_name_only_records() {
        let graph = Arc::new(ConversationGraph::open_in_memory().unwrap());
        let speaker = PersonId::from_face_number(1);
        graph.create_or_get(&speaker).unwrap();

        let enricher = enricher_with(
            graph.clone(),
            r#"{"relationships":[{"src":"self","rel_type":"BROTHER_OF","dst":"Grace"}]}"#,
        );
        let job = ExtractionJob {
            person: speaker.clone(),
            utterance: "Grace is my sister".to_string(),
        };
        enricher.extract_relationships(&job).await.unwrap();

        let rels = graph.relationships_of(&speaker).unwrap();
        assert_eq!(rels.len(), 1);
        assert_eq!(rels[0].rel_type, "BROTHER_OF");
        assert!(rels[0].dst.is_name_only());
        let grace = graph.get(&rels[0].dst).unwrap().unwrap();
        assert_eq!(grace.display_name.as_deref(), Some("Grace"));
    }

    #[tokio::test]
    async fn relationships_resolve_known_names_approximately() {
        let graph = Arc::new(ConversationGraph::open_in_memory().unwrap());
        let speaker = PersonId::from_face_number(1);
        let grace = PersonId::from_face_number(2);
        graph.create_or_get(&speaker).unwrap();
        graph.create_or_get(&grace).unwrap();
        graph.set_display_name(&grace, "grace").unwrap();

        let enricher = enricher_with(
            graph.clone(),
            r#"{"relationships":[{"src":"self","rel_type":"BROTHER_OF","dst":"Grace"}]}"#,
        );
        let job = ExtractionJob {
            person: speaker.clone(),
            utterance: "Grace is my sister".to_string(),
        };
        enricher.extract_relationships(&job).await.unwrap();

        let rels = graph.relationships_of(&speaker).unwrap();
        assert_eq!(rels[0].dst, grace);
        // No name-only ghost was minted.
        assert_eq!(graph.all_persons().unwrap().len(), 2);
    }

    // ── workers ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn workers_drain_queue_and_exit_on_close() {
        let graph = Arc::new(ConversationGraph::open_in_memory().unwrap());
        let id = PersonId::from_face_number(1);
        graph.create_or_get(&id).unwrap();

        let enricher = Arc::new(enricher_with(
            graph.clone(),
            r#"{"name": null, "attributes": ["keeps bees"], "relationships": []}"#,
        ));
        let handles = spawn_workers(enricher);
        handles.enqueue(ExtractionJob {
            person: id.clone(),
            utterance: "I keep bees".to_string(),
        });

        let EnrichmentHandles {
            relationship_tx,
            attribute_tx,
            workers,
        } = handles;
        drop(relationship_tx);
        drop(attribute_tx);
        for worker in workers {
            worker.await.unwrap();
        }
        let rec = graph.get(&id).unwrap().unwrap();
        assert_eq!(rec.attributes, vec!["keeps bees"]);
    }
}

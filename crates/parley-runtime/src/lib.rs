//! # parley-runtime
//!
//! The dialogue engine itself: everything between a resolved identity plus a
//! transcript on one side and a stream of response fragments on the other.
//!
//! # Modules
//!
//! - [`llm`] – OpenAI-compatible chat providers: blocking completion,
//!   token streaming over SSE, schema-constrained output, and a
//!   primary-with-one-fallback wrapper.
//! - [`classifier`] – Per-utterance conversation-state classification and
//!   the head-pose gate that can veto or rescue a verdict.
//! - [`dispatch`] – Fuzzy label-to-capability dispatch.
//! - [`capability`] – The capability set: speak, silent, vision, movement
//!   generation, object lookup, bad input, reset.
//! - [`enrich`] – Background relationship and attribute extraction workers
//!   feeding the memory graph.
//! - [`session`] – The per-turn engine tying all of the above together.
//! - [`telemetry`] – Tracing and optional OTLP export initialisation.

pub mod capability;
pub mod classifier;
pub mod dispatch;
pub mod enrich;
pub mod llm;
pub mod session;
pub mod telemetry;

//! # parley-memory
//!
//! Durable per-person conversation memory.
//!
//! [`graph`] holds the SQLite-backed conversation graph: one record per
//! person, an append-only singly-linked message chain per person, free-text
//! attributes, and typed relationships between people. Retrieval is hybrid:
//! recency (the newest messages) unioned with semantic similarity (cosine
//! over stored embeddings, with chain neighbors for local context).
//!
//! [`names`] resolves approximate name references ("Vikram" vs "vikram",
//! misheard transcriptions) against the set of named people so background
//! extraction can attach facts to the right record.

pub mod graph;
pub mod names;

//! Per-person conversation graph.
//!
//! Persists person records, their message chains, attributes, and typed
//! relationships to a local SQLite database, and answers hybrid
//! recency-plus-similarity retrieval over the chains.
//!
//! # Storage layout
//!
//! | table              | columns                                                        |
//! |--------------------|----------------------------------------------------------------|
//! | persons            | id, display_name, state, head_seq, created_at                  |
//! | messages           | id, person_id, seq, role, text, embedding (BLOB), created_at   |
//! | person_attributes  | person_id, pos, attr                                           |
//! | relationships      | src, rel_type, dst                                             |
//! | face_embeddings    | person_id, embedding (BLOB)                                    |
//!
//! Each person's messages form a gapless chain: `seq` starts at 1 and the
//! person row's `head_seq` always names the newest message. Appends take a
//! per-person lock and run the insert plus head retarget in one transaction,
//! so two concurrent turns can never race a chain into a gap or a fork.
//!
//! # Example
//!
//! ```rust
//! use parley_memory::graph::ConversationGraph;
//! use parley_types::{PersonId, Role};
//!
//! let graph = ConversationGraph::open_in_memory().unwrap();
//! let id = PersonId::from_face_number(1);
//! graph.create_or_get(&id).unwrap();
//! graph.append(&id, Role::User, "hello there", Some(&[0.1, 0.9])).unwrap();
//! let history = graph.retrieve(&id, &[0.1, 0.9], 20, 20).unwrap();
//! assert_eq!(history[0].text, "hello there");
//! ```

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use parley_types::{ConversationState, PersonId, PersonRecord, Role};

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can arise from conversation graph operations.
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("graph lock poisoned")]
    Poisoned,
    #[error("unknown person '{0}'")]
    UnknownPerson(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// StoredMessage
// ─────────────────────────────────────────────────────────────────────────────

/// One persisted message in a person's chain.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: Uuid,
    pub person_id: PersonId,
    /// 1-based position in the person's chain, gapless.
    pub seq: i64,
    pub role: Role,
    pub text: String,
    /// Dense embedding of `text`; absent for entries stored before an
    /// embedder was available.
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
}

/// One typed edge between two people.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relationship {
    pub src: PersonId,
    pub rel_type: String,
    pub dst: PersonId,
}

// ─────────────────────────────────────────────────────────────────────────────
// Embedding serialisation helpers
// ─────────────────────────────────────────────────────────────────────────────

fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

fn parse_role(label: &str) -> Role {
    match label {
        "system" => Role::System,
        "assistant" => Role::Assistant,
        _ => Role::User,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ConversationGraph
// ─────────────────────────────────────────────────────────────────────────────

/// SQLite-backed conversation graph, safe to share across tasks.
pub struct ConversationGraph {
    conn: Arc<Mutex<Connection>>,
    person_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ConversationGraph {
    /// Open (or create) a persistent SQLite database at `path`.
    pub fn open(path: &str) -> Result<Self, GraphError> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Open a temporary in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self, GraphError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, GraphError> {
        let graph = Self {
            conn: Arc::new(Mutex::new(conn)),
            person_locks: Mutex::new(HashMap::new()),
        };
        graph.init_schema()?;
        Ok(graph)
    }

    fn init_schema(&self) -> Result<(), GraphError> {
        self.conn()?.execute_batch(
            "CREATE TABLE IF NOT EXISTS persons (
                id           TEXT NOT NULL PRIMARY KEY,
                display_name TEXT,
                state        TEXT NOT NULL,
                head_seq     INTEGER,
                created_at   TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS messages (
                id         TEXT NOT NULL PRIMARY KEY,
                person_id  TEXT NOT NULL,
                seq        INTEGER NOT NULL,
                role       TEXT NOT NULL,
                text       TEXT NOT NULL,
                embedding  BLOB,
                created_at TEXT NOT NULL,
                UNIQUE (person_id, seq)
            );
            CREATE TABLE IF NOT EXISTS person_attributes (
                person_id TEXT NOT NULL,
                pos       INTEGER NOT NULL,
                attr      TEXT NOT NULL,
                PRIMARY KEY (person_id, pos),
                UNIQUE (person_id, attr)
            );
            CREATE TABLE IF NOT EXISTS relationships (
                src      TEXT NOT NULL,
                rel_type TEXT NOT NULL,
                dst      TEXT NOT NULL,
                UNIQUE (src, rel_type, dst)
            );
            CREATE TABLE IF NOT EXISTS face_embeddings (
                person_id TEXT NOT NULL PRIMARY KEY,
                embedding BLOB NOT NULL
            );",
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, GraphError> {
        self.conn.lock().map_err(|_| GraphError::Poisoned)
    }

    /// The append lock for one person's chain.
    fn person_lock(&self, id: &PersonId) -> Result<Arc<Mutex<()>>, GraphError> {
        let mut locks = self.person_locks.lock().map_err(|_| GraphError::Poisoned)?;
        Ok(locks
            .entry(id.as_str().to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }

    // ── person records ───────────────────────────────────────────────────────

    /// Load the person's record, creating a fresh one in the default state on
    /// first sight.
    pub fn create_or_get(&self, id: &PersonId) -> Result<PersonRecord, GraphError> {
        if let Some(record) = self.get(id)? {
            return Ok(record);
        }
        let record = PersonRecord::new(id.clone());
        self.conn()?.execute(
            "INSERT OR IGNORE INTO persons (id, display_name, state, head_seq, created_at)
             VALUES (?1, NULL, ?2, NULL, ?3)",
            params![
                id.as_str(),
                record.state.label(),
                record.created_at.to_rfc3339()
            ],
        )?;
        info!(person = id.as_str(), "created person record");
        Ok(record)
    }

    /// Load a person's record, `None` if unknown.
    pub fn get(&self, id: &PersonId) -> Result<Option<PersonRecord>, GraphError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT display_name, state, head_seq, created_at
                 FROM persons WHERE id = ?1",
                params![id.as_str()],
                |row| {
                    let display_name: Option<String> = row.get(0)?;
                    let state: String = row.get(1)?;
                    let head_seq: Option<i64> = row.get(2)?;
                    let created_at: String = row.get(3)?;
                    Ok((display_name, state, head_seq, created_at))
                },
            )
            .optional()?;
        let Some((display_name, state, head_seq, created_at)) = row else {
            return Ok(None);
        };
        let mut stmt = conn.prepare(
            "SELECT attr FROM person_attributes WHERE person_id = ?1 ORDER BY pos ASC",
        )?;
        let attributes = stmt
            .query_map(params![id.as_str()], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(PersonRecord {
            id: id.clone(),
            display_name,
            state: ConversationState::parse_label(&state).unwrap_or_default(),
            attributes,
            head_seq,
            created_at: created_at.parse::<DateTime<Utc>>().unwrap_or_else(|_| Utc::now()),
        }))
    }

    /// Every person currently in the graph.
    pub fn all_persons(&self) -> Result<Vec<PersonId>, GraphError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id FROM persons ORDER BY created_at ASC")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids.into_iter().map(PersonId).collect())
    }

    /// Every person with a display name, for approximate name resolution.
    pub fn named_persons(&self) -> Result<Vec<(PersonId, String)>, GraphError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, display_name FROM persons
             WHERE display_name IS NOT NULL ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().map(|(id, name)| (PersonId(id), name)).collect())
    }

    pub fn set_display_name(&self, id: &PersonId, name: &str) -> Result<(), GraphError> {
        self.conn()?.execute(
            "UPDATE persons SET display_name = ?2 WHERE id = ?1",
            params![id.as_str(), name],
        )?;
        Ok(())
    }

    /// Persist the person's behavioral state.
    pub fn set_state(&self, id: &PersonId, state: ConversationState) -> Result<(), GraphError> {
        let changed = self.conn()?.execute(
            "UPDATE persons SET state = ?2 WHERE id = ?1",
            params![id.as_str(), state.label()],
        )?;
        if changed == 0 {
            return Err(GraphError::UnknownPerson(id.as_str().to_string()));
        }
        Ok(())
    }

    /// Append a free-text attribute; an exact duplicate is silently skipped.
    pub fn add_attribute(&self, id: &PersonId, attr: &str) -> Result<(), GraphError> {
        let conn = self.conn()?;
        let next_pos: i64 = conn.query_row(
            "SELECT COALESCE(MAX(pos), 0) + 1 FROM person_attributes WHERE person_id = ?1",
            params![id.as_str()],
            |row| row.get(0),
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO person_attributes (person_id, pos, attr)
             VALUES (?1, ?2, ?3)",
            params![id.as_str(), next_pos, attr],
        )?;
        Ok(())
    }

    // ── relationships ────────────────────────────────────────────────────────

    /// Record a typed edge; repeating an identical edge is a no-op.
    pub fn add_relationship(
        &self,
        src: &PersonId,
        rel_type: &str,
        dst: &PersonId,
    ) -> Result<(), GraphError> {
        self.conn()?.execute(
            "INSERT OR IGNORE INTO relationships (src, rel_type, dst) VALUES (?1, ?2, ?3)",
            params![src.as_str(), rel_type, dst.as_str()],
        )?;
        Ok(())
    }

    /// All edges touching the person, outgoing first.
    pub fn relationships_of(&self, id: &PersonId) -> Result<Vec<Relationship>, GraphError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT src, rel_type, dst FROM relationships
             WHERE src = ?1 OR dst = ?1
             ORDER BY src = ?1 DESC, rel_type ASC, dst ASC",
        )?;
        let rows = stmt
            .query_map(params![id.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .map(|(src, rel_type, dst)| Relationship {
                src: PersonId(src),
                rel_type,
                dst: PersonId(dst),
            })
            .collect())
    }

    // ── face embeddings ──────────────────────────────────────────────────────

    /// Persist the person's face embedding (overwriting any previous one).
    pub fn set_face_embedding(&self, id: &PersonId, embedding: &[f32]) -> Result<(), GraphError> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO face_embeddings (person_id, embedding) VALUES (?1, ?2)",
            params![id.as_str(), embedding_to_bytes(embedding)],
        )?;
        Ok(())
    }

    /// Every persisted `(person, face embedding)` pair, for seeding the
    /// recognition store at startup.
    pub fn face_embeddings(&self) -> Result<Vec<(PersonId, Vec<f32>)>, GraphError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT person_id, embedding FROM face_embeddings")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .map(|(id, blob)| (PersonId(id), bytes_to_embedding(&blob)))
            .collect())
    }

    // ── message chain ────────────────────────────────────────────────────────

    /// Append one message to the person's chain and retarget the head.
    ///
    /// The insert and the head update commit atomically under the person's
    /// append lock, so the chain stays gapless under concurrency. Returns
    /// the new message's sequence number.
    pub fn append(
        &self,
        id: &PersonId,
        role: Role,
        text: &str,
        embedding: Option<&[f32]>,
    ) -> Result<i64, GraphError> {
        let lock = self.person_lock(id)?;
        let _guard = lock.lock().map_err(|_| GraphError::Poisoned)?;

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let head: Option<i64> = tx
            .query_row(
                "SELECT head_seq FROM persons WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| GraphError::UnknownPerson(id.as_str().to_string()))?;
        let seq = head.unwrap_or(0) + 1;
        tx.execute(
            "INSERT INTO messages (id, person_id, seq, role, text, embedding, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                Uuid::new_v4().to_string(),
                id.as_str(),
                seq,
                role_label(role),
                text,
                embedding.map(embedding_to_bytes),
                Utc::now().to_rfc3339(),
            ],
        )?;
        tx.execute(
            "UPDATE persons SET head_seq = ?2 WHERE id = ?1",
            params![id.as_str(), seq],
        )?;
        tx.commit()?;
        debug!(person = id.as_str(), seq, "appended message");
        Ok(seq)
    }

    /// The person's full chain, ascending by sequence.
    pub fn messages_of(&self, id: &PersonId) -> Result<Vec<StoredMessage>, GraphError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, seq, role, text, embedding, created_at
             FROM messages WHERE person_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt
            .query_map(params![id.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<Vec<u8>>>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut messages = Vec::with_capacity(rows.len());
        for (msg_id, seq, role, text, blob, created_at) in rows {
            messages.push(StoredMessage {
                id: Uuid::parse_str(&msg_id).unwrap_or_else(|_| Uuid::nil()),
                person_id: id.clone(),
                seq,
                role: parse_role(&role),
                text,
                embedding: blob.map(|b| bytes_to_embedding(&b)),
                created_at: created_at
                    .parse::<DateTime<Utc>>()
                    .unwrap_or_else(|_| Utc::now()),
            });
        }
        Ok(messages)
    }

    /// Hybrid history retrieval for one turn.
    ///
    /// Takes the union of the newest `recency_k` messages and the `similar_m`
    /// most cosine-similar ones (each similar hit pulled in with its chain
    /// neighbors `seq ± 1` for local context), deduplicated by sequence and
    /// returned ascending, so the context reads in conversation order.
    pub fn retrieve(
        &self,
        id: &PersonId,
        query_embedding: &[f32],
        recency_k: usize,
        similar_m: usize,
    ) -> Result<Vec<StoredMessage>, GraphError> {
        let all = self.messages_of(id)?;
        if all.is_empty() {
            return Ok(Vec::new());
        }

        let mut picked: BTreeSet<i64> = BTreeSet::new();

        // Recency arm: newest k sequences.
        for msg in all.iter().rev().take(recency_k) {
            picked.insert(msg.seq);
        }

        // Similarity arm: top m cosine hits plus their chain neighbors.
        if !query_embedding.is_empty() {
            let max_seq = all.last().map_or(0, |m| m.seq);
            let mut scored: Vec<(i64, f32)> = all
                .iter()
                .filter_map(|m| {
                    let e = m.embedding.as_ref()?;
                    (e.len() == query_embedding.len())
                        .then(|| (m.seq, cosine_similarity(e, query_embedding)))
                })
                .collect();
            scored.sort_by(|a, b| b.1.total_cmp(&a.1));
            for (seq, _) in scored.into_iter().take(similar_m) {
                if seq > 1 {
                    picked.insert(seq - 1);
                }
                picked.insert(seq);
                if seq < max_seq {
                    picked.insert(seq + 1);
                }
            }
        }

        Ok(all.into_iter().filter(|m| picked.contains(&m.seq)).collect())
    }

    /// Drop the person's whole chain and clear the head. The record itself,
    /// its attributes, and its relationships survive.
    pub fn reset_messages(&self, id: &PersonId) -> Result<(), GraphError> {
        let lock = self.person_lock(id)?;
        let _guard = lock.lock().map_err(|_| GraphError::Poisoned)?;

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM messages WHERE person_id = ?1",
            params![id.as_str()],
        )?;
        tx.execute(
            "UPDATE persons SET head_seq = NULL WHERE id = ?1",
            params![id.as_str()],
        )?;
        tx.commit()?;
        info!(person = id.as_str(), "reset message chain");
        Ok(())
    }

    // ── merge ────────────────────────────────────────────────────────────────

    /// Fold `source` into `target` and delete `source`.
    ///
    /// Attributes are unioned with exact dedupe, relationship edges are
    /// reattached, the source's messages are renumbered onto the end of the
    /// target's chain, and the target keeps its own display name unless it
    /// had none. Merging an already-absent source (or a person into itself)
    /// is a no-op, so retries are safe.
    pub fn merge_into(&self, source: &PersonId, target: &PersonId) -> Result<(), GraphError> {
        if source == target {
            return Ok(());
        }
        // Lock in id order so opposite-direction merges cannot deadlock.
        let (first, second) = if source.as_str() <= target.as_str() {
            (source, target)
        } else {
            (target, source)
        };
        let first_lock = self.person_lock(first)?;
        let second_lock = self.person_lock(second)?;
        let _fg = first_lock.lock().map_err(|_| GraphError::Poisoned)?;
        let _sg = second_lock.lock().map_err(|_| GraphError::Poisoned)?;

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let source_row: Option<Option<String>> = tx
            .query_row(
                "SELECT display_name FROM persons WHERE id = ?1",
                params![source.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(source_name) = source_row else {
            return Ok(()); // already merged
        };
        let target_head: Option<i64> = tx
            .query_row(
                "SELECT head_seq FROM persons WHERE id = ?1",
                params![target.as_str()],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| GraphError::UnknownPerson(target.as_str().to_string()))?;

        // Attributes: union with exact dedupe, preserving source order.
        let source_attrs: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT attr FROM person_attributes WHERE person_id = ?1 ORDER BY pos ASC",
            )?;
            stmt.query_map(params![source.as_str()], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?
        };
        for attr in &source_attrs {
            let next_pos: i64 = tx.query_row(
                "SELECT COALESCE(MAX(pos), 0) + 1 FROM person_attributes WHERE person_id = ?1",
                params![target.as_str()],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT OR IGNORE INTO person_attributes (person_id, pos, attr)
                 VALUES (?1, ?2, ?3)",
                params![target.as_str(), next_pos, attr],
            )?;
        }
        tx.execute(
            "DELETE FROM person_attributes WHERE person_id = ?1",
            params![source.as_str()],
        )?;

        // Relationships: reattach both endpoints; duplicates collapse.
        tx.execute(
            "UPDATE OR IGNORE relationships SET src = ?2 WHERE src = ?1",
            params![source.as_str(), target.as_str()],
        )?;
        tx.execute(
            "UPDATE OR IGNORE relationships SET dst = ?2 WHERE dst = ?1",
            params![source.as_str(), target.as_str()],
        )?;
        tx.execute(
            "DELETE FROM relationships WHERE src = ?1 OR dst = ?1",
            params![source.as_str()],
        )?;

        // Messages: renumber onto the end of the target's chain.
        let source_seqs: Vec<i64> = {
            let mut stmt = tx.prepare(
                "SELECT seq FROM messages WHERE person_id = ?1 ORDER BY seq ASC",
            )?;
            stmt.query_map(params![source.as_str()], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?
        };
        let mut head = target_head.unwrap_or(0);
        for seq in source_seqs {
            head += 1;
            tx.execute(
                "UPDATE messages SET person_id = ?2, seq = ?3 WHERE person_id = ?1 AND seq = ?4",
                params![source.as_str(), target.as_str(), head, seq],
            )?;
        }
        if Some(head) != target_head && head > 0 {
            tx.execute(
                "UPDATE persons SET head_seq = ?2 WHERE id = ?1",
                params![target.as_str(), head],
            )?;
        }

        // Display name: the target keeps its own unless it had none.
        if let Some(name) = source_name {
            tx.execute(
                "UPDATE persons SET display_name = ?2 WHERE id = ?1 AND display_name IS NULL",
                params![target.as_str(), name],
            )?;
        }
        // Face embedding follows only into a face-less target.
        tx.execute(
            "INSERT OR IGNORE INTO face_embeddings (person_id, embedding)
             SELECT ?2, embedding FROM face_embeddings WHERE person_id = ?1",
            params![source.as_str(), target.as_str()],
        )?;
        tx.execute(
            "DELETE FROM face_embeddings WHERE person_id = ?1",
            params![source.as_str()],
        )?;
        tx.execute(
            "DELETE FROM persons WHERE id = ?1",
            params![source.as_str()],
        )?;
        tx.commit()?;
        info!(
            source = source.as_str(),
            target = target.as_str(),
            "merged person records"
        );
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_with(id: &PersonId) -> ConversationGraph {
        let graph = ConversationGraph::open_in_memory().unwrap();
        graph.create_or_get(id).unwrap();
        graph
    }

    fn face(n: u64) -> PersonId {
        PersonId::from_face_number(n)
    }

    // ── person records ───────────────────────────────────────────────────────

    #[test]
    fn create_or_get_is_idempotent() {
        let id = face(1);
        let graph = graph_with(&id);
        graph.set_display_name(&id, "Ada").unwrap();
        let again = graph.create_or_get(&id).unwrap();
        assert_eq!(again.display_name.as_deref(), Some("Ada"));
    }

    #[test]
    fn fresh_record_defaults_to_speak() {
        let id = face(1);
        let graph = graph_with(&id);
        let rec = graph.get(&id).unwrap().unwrap();
        assert_eq!(rec.state, ConversationState::Speak);
        assert!(rec.head_seq.is_none());
    }

    #[test]
    fn set_state_persists() {
        let id = face(1);
        let graph = graph_with(&id);
        graph.set_state(&id, ConversationState::Silent).unwrap();
        let rec = graph.get(&id).unwrap().unwrap();
        assert_eq!(rec.state, ConversationState::Silent);
    }

    #[test]
    fn set_state_unknown_person_errors() {
        let graph = ConversationGraph::open_in_memory().unwrap();
        let err = graph.set_state(&face(9), ConversationState::Silent).unwrap_err();
        assert!(matches!(err, GraphError::UnknownPerson(_)));
    }

    #[test]
    fn attributes_dedupe_exactly() {
        let id = face(1);
        let graph = graph_with(&id);
        graph.add_attribute(&id, "likes chess").unwrap();
        graph.add_attribute(&id, "likes chess").unwrap();
        graph.add_attribute(&id, "Likes Chess").unwrap(); // different casing kept
        let rec = graph.get(&id).unwrap().unwrap();
        assert_eq!(rec.attributes, vec!["likes chess", "Likes Chess"]);
    }

    // ── message chain ────────────────────────────────────────────────────────

    #[test]
    fn append_assigns_gapless_sequences_and_head() {
        let id = face(1);
        let graph = graph_with(&id);
        assert_eq!(graph.append(&id, Role::User, "one", None).unwrap(), 1);
        assert_eq!(graph.append(&id, Role::Assistant, "two", None).unwrap(), 2);
        assert_eq!(graph.append(&id, Role::User, "three", None).unwrap(), 3);
        let rec = graph.get(&id).unwrap().unwrap();
        assert_eq!(rec.head_seq, Some(3));
    }

    #[test]
    fn append_unknown_person_errors() {
        let graph = ConversationGraph::open_in_memory().unwrap();
        let err = graph.append(&face(9), Role::User, "hi", None).unwrap_err();
        assert!(matches!(err, GraphError::UnknownPerson(_)));
    }

    #[test]
    fn chains_are_isolated_per_person() {
        let a = face(1);
        let b = face(2);
        let graph = graph_with(&a);
        graph.create_or_get(&b).unwrap();
        graph.append(&a, Role::User, "for a", None).unwrap();
        graph.append(&b, Role::User, "for b", None).unwrap();
        assert_eq!(graph.messages_of(&a).unwrap().len(), 1);
        assert_eq!(graph.messages_of(&b).unwrap()[0].text, "for b");
    }

    #[test]
    fn concurrent_appends_stay_gapless() {
        let id = face(1);
        let graph = std::sync::Arc::new(graph_with(&id));
        let mut handles = Vec::new();
        for t in 0..4 {
            let graph = graph.clone();
            let id = id.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..5 {
                    graph
                        .append(&id, Role::User, &format!("t{t} m{i}"), None)
                        .unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let msgs = graph.messages_of(&id).unwrap();
        let seqs: Vec<i64> = msgs.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, (1..=20).collect::<Vec<i64>>());
        assert_eq!(graph.get(&id).unwrap().unwrap().head_seq, Some(20));
    }

    #[test]
    fn reset_clears_chain_but_keeps_record() {
        let id = face(1);
        let graph = graph_with(&id);
        graph.add_attribute(&id, "likes chess").unwrap();
        graph.append(&id, Role::User, "hello", None).unwrap();
        graph.reset_messages(&id).unwrap();
        assert!(graph.messages_of(&id).unwrap().is_empty());
        let rec = graph.get(&id).unwrap().unwrap();
        assert!(rec.head_seq.is_none());
        assert_eq!(rec.attributes, vec!["likes chess"]);
        // A chain restarted after reset begins at 1 again.
        assert_eq!(graph.append(&id, Role::User, "again", None).unwrap(), 1);
    }

    // ── retrieval ────────────────────────────────────────────────────────────

    #[test]
    fn retrieve_round_trips_a_short_chain() {
        let id = face(1);
        let graph = graph_with(&id);
        graph.append(&id, Role::User, "hi", Some(&[1.0, 0.0])).unwrap();
        graph.append(&id, Role::Assistant, "hello!", Some(&[0.9, 0.1])).unwrap();
        let got = graph.retrieve(&id, &[1.0, 0.0], 20, 20).unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].text, "hi");
        assert_eq!(got[1].text, "hello!");
    }

    #[test]
    fn retrieve_unions_recency_and_similarity_with_neighbors() {
        let id = face(1);
        let graph = graph_with(&id);
        // 1..=10: only seq 3 is semantically close to the query; 9 and 10 are
        // the recency picks.
        for i in 1..=10 {
            let emb = if i == 3 { [1.0f32, 0.0] } else { [0.0f32, 1.0] };
            graph
                .append(&id, Role::User, &format!("msg {i}"), Some(&emb))
                .unwrap();
        }
        let got = graph.retrieve(&id, &[1.0, 0.0], 2, 1).unwrap();
        let seqs: Vec<i64> = got.iter().map(|m| m.seq).collect();
        // Similar hit 3 plus neighbors 2 and 4, union recency 9 and 10.
        assert_eq!(seqs, vec![2, 3, 4, 9, 10]);
    }

    #[test]
    fn retrieve_dedupes_overlapping_arms() {
        let id = face(1);
        let graph = graph_with(&id);
        for i in 1..=3 {
            graph
                .append(&id, Role::User, &format!("msg {i}"), Some(&[1.0, 0.0]))
                .unwrap();
        }
        let got = graph.retrieve(&id, &[1.0, 0.0], 3, 3).unwrap();
        let seqs: Vec<i64> = got.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn retrieve_empty_chain_is_empty() {
        let id = face(1);
        let graph = graph_with(&id);
        assert!(graph.retrieve(&id, &[1.0, 0.0], 20, 20).unwrap().is_empty());
    }

    #[test]
    fn retrieve_without_query_embedding_is_pure_recency() {
        let id = face(1);
        let graph = graph_with(&id);
        for i in 1..=5 {
            graph.append(&id, Role::User, &format!("msg {i}"), None).unwrap();
        }
        let got = graph.retrieve(&id, &[], 2, 20).unwrap();
        let seqs: Vec<i64> = got.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![4, 5]);
    }

    // ── relationships ────────────────────────────────────────────────────────

    #[test]
    fn relationships_dedupe_and_query_both_directions() {
        let a = face(1);
        let b = face(2);
        let graph = graph_with(&a);
        graph.create_or_get(&b).unwrap();
        graph.add_relationship(&a, "BROTHER_OF", &b).unwrap();
        graph.add_relationship(&a, "BROTHER_OF", &b).unwrap();
        assert_eq!(graph.relationships_of(&a).unwrap().len(), 1);
        assert_eq!(graph.relationships_of(&b).unwrap().len(), 1);
    }

    // ── face embeddings ──────────────────────────────────────────────────────

    #[test]
    fn face_embeddings_round_trip() {
        let id = face(1);
        let graph = graph_with(&id);
        graph.set_face_embedding(&id, &[0.5, -0.25, 1.0]).unwrap();
        let all = graph.face_embeddings().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, id);
        assert_eq!(all[0].1, vec![0.5, -0.25, 1.0]);
    }

    // ── merge ────────────────────────────────────────────────────────────────

    fn name_only_with(graph: &ConversationGraph, name: &str) -> PersonId {
        let id = PersonId::from_name_reference();
        graph.create_or_get(&id).unwrap();
        graph.set_display_name(&id, name).unwrap();
        id
    }

    #[test]
    fn merge_unions_attributes_and_reattaches_edges() {
        let target = face(1);
        let graph = graph_with(&target);
        let source = name_only_with(&graph, "Vikram");
        let other = face(2);
        graph.create_or_get(&other).unwrap();

        graph.add_attribute(&target, "likes chess").unwrap();
        graph.add_attribute(&source, "likes chess").unwrap();
        graph.add_attribute(&source, "plays guitar").unwrap();
        graph.add_relationship(&source, "FRIEND_OF", &other).unwrap();

        graph.merge_into(&source, &target).unwrap();

        assert!(graph.get(&source).unwrap().is_none());
        let rec = graph.get(&target).unwrap().unwrap();
        assert_eq!(rec.attributes, vec!["likes chess", "plays guitar"]);
        assert_eq!(rec.display_name.as_deref(), Some("Vikram"));
        let rels = graph.relationships_of(&target).unwrap();
        assert_eq!(rels.len(), 1);
        assert_eq!(rels[0].dst, other);
    }

    #[test]
    fn merge_renumbers_messages_onto_target_chain() {
        let target = face(1);
        let graph = graph_with(&target);
        let source = name_only_with(&graph, "Vikram");
        graph.append(&target, Role::User, "t1", None).unwrap();
        graph.append(&source, Role::User, "s1", None).unwrap();
        graph.append(&source, Role::Assistant, "s2", None).unwrap();

        graph.merge_into(&source, &target).unwrap();

        let msgs = graph.messages_of(&target).unwrap();
        let texts: Vec<&str> = msgs.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["t1", "s1", "s2"]);
        assert_eq!(graph.get(&target).unwrap().unwrap().head_seq, Some(3));
    }

    #[test]
    fn merge_is_idempotent() {
        let target = face(1);
        let graph = graph_with(&target);
        let source = name_only_with(&graph, "Vikram");
        graph.add_attribute(&source, "plays guitar").unwrap();

        graph.merge_into(&source, &target).unwrap();
        graph.merge_into(&source, &target).unwrap(); // retry is a no-op

        let rec = graph.get(&target).unwrap().unwrap();
        assert_eq!(rec.attributes, vec!["plays guitar"]);
    }

    #[test]
    fn merge_keeps_target_display_name() {
        let target = face(1);
        let graph = graph_with(&target);
        graph.set_display_name(&target, "Ada").unwrap();
        let source = name_only_with(&graph, "Adda");
        graph.merge_into(&source, &target).unwrap();
        let rec = graph.get(&target).unwrap().unwrap();
        assert_eq!(rec.display_name.as_deref(), Some("Ada"));
    }

    #[test]
    fn merge_into_self_is_noop() {
        let id = face(1);
        let graph = graph_with(&id);
        graph.append(&id, Role::User, "hello", None).unwrap();
        graph.merge_into(&id, &id).unwrap();
        assert_eq!(graph.messages_of(&id).unwrap().len(), 1);
    }
}

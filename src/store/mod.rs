pub mod atomic;

use std::collections::BTreeMap;
use std::ops::Deref;

use chrono::{SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;
use tracing::{debug, info};

use crate::candidates::{CandidateEntity, CandidateSource};
use crate::canonical::arena::SnapshotAlias;
use crate::canonical::{
    AliasMember, ArenaGraph, CanonicalEntity, CanonicalGraph, GraphTotals, MergeMethod,
    MergeOutcome, MergeRequest,
};
use crate::entity::{CanonicalId, Entity, EntityId, EntityType, Observation};
use crate::error::{ResolveError, validate_confidence};
use crate::oracle::ContextSource;

const SCHEMA_VERSION: i64 = 1;
const SEED_ACTOR: &str = "system";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub observations: usize,
    pub new_entities: usize,
    pub updated_entities: usize,
    pub occurrences_added: i64,
}

/// How far an append-only extraction file has been imported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestCursor {
    pub source: String,
    /// SHA-256 of the first `consumed_bytes` bytes.
    pub input_hash: String,
    pub consumed_bytes: usize,
    pub observations: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InitSummary {
    pub total_entities: i64,
    pub canonical_created: i64,
    pub aliases_created: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedCluster {
    pub canonical_id: CanonicalId,
    pub canonical_text: String,
    pub entity_type: EntityType,
    pub alias_count: i64,
    pub total_mentions: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalStats {
    pub total_canonical: i64,
    pub total_aliases: i64,
    pub avg_aliases_per_canonical: f64,
    pub by_type: BTreeMap<String, i64>,
    pub top_merged: Vec<MergedCluster>,
}

/// SQLite-backed entity store and canonical graph.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self, ResolveError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, ResolveError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), ResolveError> {
        self.conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            ",
        )?;

        let version: i64 = self.conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        match version {
            0 => {
                self.create_schema_v1()?;
                self.conn
                    .execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION};"))?;
            }
            SCHEMA_VERSION => self.create_schema_v1()?,
            other => {
                return Err(ResolveError::inconsistent(format!(
                    "unsupported schema version {other}"
                )));
            }
        }
        Ok(())
    }

    fn create_schema_v1(&self) -> Result<(), ResolveError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS entities (
                entity_id INTEGER PRIMARY KEY AUTOINCREMENT,
                text TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                normalized_text TEXT NOT NULL,
                first_seen_doc_id TEXT NOT NULL,
                occurrence_count INTEGER NOT NULL CHECK (occurrence_count >= 1),
                UNIQUE(normalized_text, entity_type)
            );

            CREATE INDEX IF NOT EXISTS idx_entities_type_count
                ON entities(entity_type, occurrence_count);

            CREATE TABLE IF NOT EXISTS document_entities (
                mention_id INTEGER PRIMARY KEY AUTOINCREMENT,
                doc_id TEXT NOT NULL,
                entity_id INTEGER NOT NULL REFERENCES entities(entity_id),
                context TEXT,
                confidence REAL NOT NULL CHECK (confidence >= 0.0 AND confidence <= 1.0),
                method TEXT NOT NULL,
                position_start INTEGER,
                position_end INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_document_entities_entity
                ON document_entities(entity_id);
            CREATE INDEX IF NOT EXISTS idx_document_entities_doc
                ON document_entities(doc_id);

            CREATE TABLE IF NOT EXISTS canonical_entities (
                canonical_id INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_type TEXT NOT NULL,
                canonical_text TEXT NOT NULL,
                canonical_normalized TEXT NOT NULL,
                total_mentions INTEGER NOT NULL CHECK (total_mentions >= 0),
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_canonical_normalized
                ON canonical_entities(canonical_normalized, entity_type);

            CREATE TABLE IF NOT EXISTS entity_aliases (
                entity_id INTEGER PRIMARY KEY REFERENCES entities(entity_id),
                canonical_id INTEGER NOT NULL REFERENCES canonical_entities(canonical_id),
                is_canonical INTEGER NOT NULL CHECK (is_canonical IN (0, 1)),
                merge_method TEXT NOT NULL,
                merge_confidence REAL NOT NULL
                    CHECK (merge_confidence >= 0.0 AND merge_confidence <= 1.0),
                merged_at TEXT NOT NULL,
                merged_by TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_entity_aliases_canonical
                ON entity_aliases(canonical_id);

            CREATE TABLE IF NOT EXISTS ingest_sources (
                source TEXT PRIMARY KEY,
                input_hash TEXT NOT NULL,
                consumed_bytes INTEGER NOT NULL CHECK (consumed_bytes >= 0),
                observations INTEGER NOT NULL CHECK (observations >= 0),
                updated_at TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    /// Records a batch of mentions in one transaction. Any failure rolls the
    /// whole batch back.
    pub fn record_observations(
        &self,
        observations: &[Observation],
    ) -> Result<IngestSummary, ResolveError> {
        let tx = self.conn.unchecked_transaction()?;
        let now = now_rfc3339();
        let mut summary = IngestSummary::default();
        for observation in observations {
            Self::record_observation_on(tx.deref(), observation, &now, &mut summary)?;
        }
        tx.commit()?;
        debug!(
            observations = summary.observations,
            new_entities = summary.new_entities,
            "recorded observation batch"
        );
        Ok(summary)
    }

    pub fn ingest_cursor(&self, source: &str) -> Result<Option<IngestCursor>, ResolveError> {
        let cursor = self
            .conn
            .query_row(
                "SELECT source, input_hash, consumed_bytes, observations
                 FROM ingest_sources WHERE source = ?1",
                params![source],
                |row| {
                    Ok(IngestCursor {
                        source: row.get(0)?,
                        input_hash: row.get(1)?,
                        consumed_bytes: row.get::<_, i64>(2)? as usize,
                        observations: row.get::<_, i64>(3)? as usize,
                    })
                },
            )
            .optional()?;
        Ok(cursor)
    }

    /// Records the unread part of a source file and advances its cursor in
    /// the same transaction.
    pub fn record_source_batch(
        &self,
        source: &str,
        input_hash: &str,
        consumed_bytes: usize,
        observations: &[Observation],
    ) -> Result<IngestSummary, ResolveError> {
        let tx = self.conn.unchecked_transaction()?;
        let now = now_rfc3339();
        let mut summary = IngestSummary::default();
        for observation in observations {
            Self::record_observation_on(tx.deref(), observation, &now, &mut summary)?;
        }
        tx.execute(
            "INSERT INTO ingest_sources
                 (source, input_hash, consumed_bytes, observations, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(source) DO UPDATE SET
                 input_hash = excluded.input_hash,
                 consumed_bytes = excluded.consumed_bytes,
                 observations = ingest_sources.observations + excluded.observations,
                 updated_at = excluded.updated_at",
            params![source, input_hash, consumed_bytes as i64, summary.observations as i64, now],
        )?;
        tx.commit()?;
        debug!(
            source,
            observations = summary.observations,
            consumed_bytes,
            "recorded source batch"
        );
        Ok(summary)
    }

    fn record_observation_on(
        conn: &Connection,
        observation: &Observation,
        now: &str,
        summary: &mut IngestSummary,
    ) -> Result<(), ResolveError> {
        if observation.increment < 1 {
            return Err(ResolveError::invalid(format!(
                "occurrence increment must be >= 1, got {}",
                observation.increment
            )));
        }
        validate_confidence("extraction confidence", observation.confidence)?;

        let existing: Option<EntityId> = conn
            .query_row(
                "SELECT entity_id FROM entities WHERE normalized_text = ?1 AND entity_type = ?2",
                params![observation.normalized_text, observation.entity_type.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        let entity_id = match existing {
            Some(entity_id) => {
                conn.execute(
                    "UPDATE entities SET occurrence_count = occurrence_count + ?1
                     WHERE entity_id = ?2",
                    params![observation.increment, entity_id],
                )?;
                let bumped = conn.execute(
                    "UPDATE canonical_entities
                     SET total_mentions = total_mentions + ?1, updated_at = ?2
                     WHERE canonical_id = (
                         SELECT canonical_id FROM entity_aliases WHERE entity_id = ?3
                     )",
                    params![observation.increment, now, entity_id],
                )?;
                if bumped == 0 {
                    Self::seed_canonical_on(conn, entity_id, now)?;
                }
                summary.updated_entities += 1;
                entity_id
            }
            None => {
                conn.execute(
                    "INSERT INTO entities (
                        text, entity_type, normalized_text, first_seen_doc_id, occurrence_count
                    ) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        observation.text,
                        observation.entity_type.as_str(),
                        observation.normalized_text,
                        observation.doc_id,
                        observation.increment
                    ],
                )?;
                let entity_id = conn.last_insert_rowid();
                Self::seed_canonical_on(conn, entity_id, now)?;
                summary.new_entities += 1;
                entity_id
            }
        };

        let (start, end) = observation.position.unzip();
        conn.execute(
            "INSERT INTO document_entities (
                doc_id, entity_id, context, confidence, method, position_start, position_end
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                observation.doc_id,
                entity_id,
                observation.context,
                observation.confidence,
                observation.method.as_str(),
                start,
                end
            ],
        )?;

        summary.observations += 1;
        summary.occurrences_added += observation.increment;
        Ok(())
    }

    /// Creates a 1:1 canonical entity and `initial` alias for an entity that
    /// has none yet.
    fn seed_canonical_on(
        conn: &Connection,
        entity_id: EntityId,
        now: &str,
    ) -> Result<CanonicalId, ResolveError> {
        conn.execute(
            "INSERT INTO canonical_entities (
                entity_type, canonical_text, canonical_normalized, total_mentions,
                created_at, updated_at
            )
            SELECT entity_type, text, normalized_text, occurrence_count, ?2, ?2
            FROM entities WHERE entity_id = ?1",
            params![entity_id, now],
        )?;
        let canonical_id = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO entity_aliases (
                entity_id, canonical_id, is_canonical, merge_method, merge_confidence,
                merged_at, merged_by
            ) VALUES (?1, ?2, 1, ?3, 1.0, ?4, ?5)",
            params![
                entity_id,
                canonical_id,
                MergeMethod::Initial.as_str(),
                now,
                SEED_ACTOR
            ],
        )?;
        Ok(canonical_id)
    }

    /// Backfills canonical entities for any entity without an alias.
    pub fn initialize_canonical(&self) -> Result<InitSummary, ResolveError> {
        let tx = self.conn.unchecked_transaction()?;
        let now = now_rfc3339();
        let total_entities: i64 =
            tx.query_row("SELECT COUNT(*) FROM entities", [], |row| row.get(0))?;

        let missing = {
            let mut stmt = tx.prepare(
                "SELECT e.entity_id FROM entities e
                 LEFT JOIN entity_aliases ea ON ea.entity_id = e.entity_id
                 WHERE ea.entity_id IS NULL
                 ORDER BY e.entity_id ASC",
            )?;
            let rows = stmt.query_map([], |row| row.get::<_, EntityId>(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        for entity_id in &missing {
            Self::seed_canonical_on(tx.deref(), *entity_id, &now)?;
        }
        tx.commit()?;

        let created = missing.len() as i64;
        info!(total_entities, canonical_created = created, "initialized canonical entities");
        Ok(InitSummary {
            total_entities,
            canonical_created: created,
            aliases_created: created,
        })
    }

    pub fn entity(&self, entity_id: EntityId) -> Result<Entity, ResolveError> {
        self.conn
            .query_row(
                "SELECT entity_id, text, entity_type, normalized_text, first_seen_doc_id,
                        occurrence_count
                 FROM entities WHERE entity_id = ?1",
                params![entity_id],
                decode_entity,
            )
            .optional()?
            .ok_or_else(|| ResolveError::not_found(format!("entity {entity_id}")))
    }

    pub fn entity_by_text(
        &self,
        text: &str,
        entity_type: EntityType,
    ) -> Result<Option<Entity>, ResolveError> {
        let normalized = crate::entity::normalize_entity_text(text, entity_type);
        Ok(self
            .conn
            .query_row(
                "SELECT entity_id, text, entity_type, normalized_text, first_seen_doc_id,
                        occurrence_count
                 FROM entities WHERE normalized_text = ?1 AND entity_type = ?2",
                params![normalized, entity_type.as_str()],
                decode_entity,
            )
            .optional()?)
    }

    pub fn canonical(&self, canonical_id: CanonicalId) -> Result<CanonicalEntity, ResolveError> {
        self.conn
            .query_row(
                "SELECT canonical_id, entity_type, canonical_text, canonical_normalized,
                        total_mentions, created_at, updated_at
                 FROM canonical_entities WHERE canonical_id = ?1",
                params![canonical_id],
                decode_canonical,
            )
            .optional()?
            .ok_or_else(|| ResolveError::not_found(format!("canonical entity {canonical_id}")))
    }

    pub fn canonical_for_entity(
        &self,
        entity_id: EntityId,
    ) -> Result<CanonicalEntity, ResolveError> {
        let canonical_id = self.canonical_id_for(entity_id)?;
        self.canonical(canonical_id)
    }

    /// Members of a cluster, most frequent first.
    pub fn aliases_for_canonical(
        &self,
        canonical_id: CanonicalId,
    ) -> Result<Vec<AliasMember>, ResolveError> {
        self.canonical(canonical_id)?;
        let mut stmt = self.conn.prepare(
            "SELECT e.entity_id, e.text, e.entity_type, e.normalized_text, e.occurrence_count,
                    ea.is_canonical, ea.merge_method, ea.merge_confidence, ea.merged_at,
                    ea.merged_by
             FROM entity_aliases ea
             JOIN entities e ON e.entity_id = ea.entity_id
             WHERE ea.canonical_id = ?1
             ORDER BY e.occurrence_count DESC, e.entity_id ASC",
        )?;
        let rows = stmt.query_map(params![canonical_id], |row| {
            Ok(AliasMember {
                entity_id: row.get(0)?,
                text: row.get(1)?,
                entity_type: decode_entity_type(row, 2)?,
                normalized_text: row.get(3)?,
                occurrence_count: row.get(4)?,
                is_canonical: row.get::<_, i64>(5)? != 0,
                merge_method: decode_merge_method(row, 6)?,
                merge_confidence: row.get(7)?,
                merged_at: row.get(8)?,
                merged_by: row.get(9)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Case-insensitive prefix search over canonical display and normalized
    /// text.
    pub fn search_canonical(
        &self,
        query: &str,
        entity_type: Option<EntityType>,
        limit: usize,
    ) -> Result<Vec<CanonicalEntity>, ResolveError> {
        let pattern = format!("{}%", escape_like(&query.trim().to_lowercase()));
        let mut stmt = self.conn.prepare(
            "SELECT canonical_id, entity_type, canonical_text, canonical_normalized,
                    total_mentions, created_at, updated_at
             FROM canonical_entities
             WHERE (lower(canonical_text) LIKE ?1 ESCAPE '\\'
                    OR canonical_normalized LIKE ?1 ESCAPE '\\')
               AND (?2 IS NULL OR entity_type = ?2)
             ORDER BY total_mentions DESC, canonical_id ASC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![
                pattern,
                entity_type.map(EntityType::as_str),
                i64::try_from(limit).unwrap_or(i64::MAX)
            ],
            decode_canonical,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn canonical_stats(&self) -> Result<CanonicalStats, ResolveError> {
        let total_canonical: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM canonical_entities", [], |row| row.get(0))?;
        let total_aliases: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM entity_aliases", [], |row| row.get(0))?;

        let mut by_type = BTreeMap::new();
        {
            let mut stmt = self.conn.prepare(
                "SELECT entity_type, COUNT(*) FROM canonical_entities
                 GROUP BY entity_type ORDER BY entity_type",
            )?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                by_type.insert(row.get::<_, String>(0)?, row.get::<_, i64>(1)?);
            }
        }

        let mut stmt = self.conn.prepare(
            "SELECT ce.canonical_id, ce.canonical_text, ce.entity_type, COUNT(ea.entity_id),
                    ce.total_mentions
             FROM canonical_entities ce
             JOIN entity_aliases ea ON ea.canonical_id = ce.canonical_id
             GROUP BY ce.canonical_id
             HAVING COUNT(ea.entity_id) > 1
             ORDER BY COUNT(ea.entity_id) DESC, ce.total_mentions DESC, ce.canonical_id ASC
             LIMIT 10",
        )?;
        let top_merged = stmt
            .query_map([], |row| {
                Ok(MergedCluster {
                    canonical_id: row.get(0)?,
                    canonical_text: row.get(1)?,
                    entity_type: decode_entity_type(row, 2)?,
                    alias_count: row.get(3)?,
                    total_mentions: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let avg_aliases_per_canonical = if total_canonical > 0 {
            total_aliases as f64 / total_canonical as f64
        } else {
            0.0
        };

        Ok(CanonicalStats {
            total_canonical,
            total_aliases,
            avg_aliases_per_canonical,
            by_type,
            top_merged,
        })
    }

    /// Copies the live graph into memory for dry runs.
    pub fn snapshot_graph(&self) -> Result<ArenaGraph, ResolveError> {
        let clusters = {
            let mut stmt = self
                .conn
                .prepare("SELECT canonical_id, total_mentions FROM canonical_entities")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, CanonicalId>(0)?, row.get::<_, i64>(1)?))
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        let aliases = {
            let mut stmt = self.conn.prepare(
                "SELECT ea.entity_id, ea.canonical_id, e.occurrence_count, ea.is_canonical,
                        ea.merge_method
                 FROM entity_aliases ea
                 JOIN entities e ON e.entity_id = ea.entity_id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(SnapshotAlias {
                    entity_id: row.get(0)?,
                    canonical_id: row.get(1)?,
                    occurrence_count: row.get(2)?,
                    is_canonical: row.get::<_, i64>(3)? != 0,
                    method: decode_merge_method(row, 4)?,
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        ArenaGraph::from_snapshot(&clusters, &aliases)
    }

    fn apply_merge_on(
        conn: &Connection,
        request: &MergeRequest,
        now: &str,
    ) -> Result<MergeOutcome, ResolveError> {
        let source: Option<(CanonicalId, i64, String)> = conn
            .query_row(
                "SELECT ea.canonical_id, e.occurrence_count, e.entity_type
                 FROM entity_aliases ea
                 JOIN entities e ON e.entity_id = ea.entity_id
                 WHERE ea.entity_id = ?1",
                params![request.source_entity_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let (source_canonical_id, moved, source_type) = source.ok_or_else(|| {
            ResolveError::not_found(format!(
                "entity {} has no canonical mapping",
                request.source_entity_id
            ))
        })?;

        if source_canonical_id == request.target_canonical_id {
            return Ok(MergeOutcome::AlreadyMerged {
                canonical_id: source_canonical_id,
            });
        }

        let target_type: Option<String> = conn
            .query_row(
                "SELECT entity_type FROM canonical_entities WHERE canonical_id = ?1",
                params![request.target_canonical_id],
                |row| row.get(0),
            )
            .optional()?;
        let target_type = target_type.ok_or_else(|| {
            ResolveError::not_found(format!(
                "canonical entity {}",
                request.target_canonical_id
            ))
        })?;
        if target_type != source_type {
            return Err(ResolveError::invalid(format!(
                "cannot merge {source_type} entity {} into {target_type} canonical entity {}",
                request.source_entity_id, request.target_canonical_id
            )));
        }

        let target_bumped = conn.execute(
            "UPDATE canonical_entities
             SET total_mentions = total_mentions + ?1, updated_at = ?2
             WHERE canonical_id = ?3",
            params![moved, now, request.target_canonical_id],
        )?;
        if target_bumped != 1 {
            return Err(ResolveError::not_found(format!(
                "canonical entity {}",
                request.target_canonical_id
            )));
        }

        let source_drained = conn.execute(
            "UPDATE canonical_entities
             SET total_mentions = total_mentions - ?1, updated_at = ?2
             WHERE canonical_id = ?3 AND total_mentions >= ?1",
            params![moved, now, source_canonical_id],
        )?;
        if source_drained != 1 {
            return Err(ResolveError::inconsistent(format!(
                "canonical entity {source_canonical_id} cannot give up {moved} mentions"
            )));
        }

        conn.execute(
            "UPDATE entity_aliases
             SET canonical_id = ?1, is_canonical = 0, merge_method = ?2,
                 merge_confidence = ?3, merged_at = ?4, merged_by = ?5
             WHERE entity_id = ?6",
            params![
                request.target_canonical_id,
                request.method.as_str(),
                request.confidence,
                now,
                request.merged_by,
                request.source_entity_id
            ],
        )?;

        let (remaining, leftover): (i64, i64) = conn.query_row(
            "SELECT
                (SELECT COUNT(*) FROM entity_aliases WHERE canonical_id = ?1),
                (SELECT total_mentions FROM canonical_entities WHERE canonical_id = ?1)",
            params![source_canonical_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let orphaned = remaining == 0;
        if orphaned {
            if leftover != 0 {
                return Err(ResolveError::inconsistent(format!(
                    "orphaned canonical entity {source_canonical_id} still holds {leftover} mentions"
                )));
            }
            conn.execute(
                "DELETE FROM canonical_entities WHERE canonical_id = ?1",
                params![source_canonical_id],
            )?;
        }

        Ok(MergeOutcome::Merged {
            source_canonical_id,
            target_canonical_id: request.target_canonical_id,
            moved_mentions: moved,
            orphaned_canonical_deleted: orphaned,
        })
    }

    fn count(&self, sql: &str) -> Result<i64, ResolveError> {
        Ok(self.conn.query_row(sql, [], |row| row.get(0))?)
    }
}

impl CanonicalGraph for SqliteStore {
    fn canonical_id_for(&self, entity_id: EntityId) -> Result<CanonicalId, ResolveError> {
        self.conn
            .query_row(
                "SELECT canonical_id FROM entity_aliases WHERE entity_id = ?1",
                params![entity_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| {
                ResolveError::not_found(format!("entity {entity_id} has no canonical mapping"))
            })
    }

    fn apply_merge(&mut self, request: &MergeRequest) -> Result<MergeOutcome, ResolveError> {
        // Dropping the transaction on an early return rolls every write back.
        let tx = self.conn.transaction()?;
        let outcome = Self::apply_merge_on(&tx, request, &now_rfc3339())?;
        tx.commit()?;
        Ok(outcome)
    }

    fn verify_invariants(&self) -> Result<GraphTotals, ResolveError> {
        let unmapped = self.count(
            "SELECT COUNT(*) FROM entities e
             LEFT JOIN entity_aliases ea ON ea.entity_id = e.entity_id
             WHERE ea.entity_id IS NULL",
        )?;
        if unmapped > 0 {
            return Err(ResolveError::inconsistent(format!(
                "{unmapped} entities have no canonical mapping"
            )));
        }

        let dangling = self.count(
            "SELECT COUNT(*) FROM entity_aliases ea
             LEFT JOIN canonical_entities ce ON ce.canonical_id = ea.canonical_id
             WHERE ce.canonical_id IS NULL",
        )?;
        if dangling > 0 {
            return Err(ResolveError::inconsistent(format!(
                "{dangling} aliases point at missing canonical entities"
            )));
        }

        let orphans = self.count(
            "SELECT COUNT(*) FROM canonical_entities ce
             WHERE NOT EXISTS (
                 SELECT 1 FROM entity_aliases ea WHERE ea.canonical_id = ce.canonical_id
             )",
        )?;
        if orphans > 0 {
            return Err(ResolveError::inconsistent(format!(
                "{orphans} canonical entities have no members"
            )));
        }

        let drift: Option<(CanonicalId, i64, i64)> = self
            .conn
            .query_row(
                "SELECT ce.canonical_id, ce.total_mentions, SUM(e.occurrence_count)
                 FROM canonical_entities ce
                 JOIN entity_aliases ea ON ea.canonical_id = ce.canonical_id
                 JOIN entities e ON e.entity_id = ea.entity_id
                 GROUP BY ce.canonical_id
                 HAVING ce.total_mentions != SUM(e.occurrence_count)
                 ORDER BY ce.canonical_id
                 LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        if let Some((canonical_id, stored, actual)) = drift {
            return Err(ResolveError::inconsistent(format!(
                "canonical entity {canonical_id} records {stored} mentions but its members hold {actual}"
            )));
        }

        let totals = GraphTotals {
            entities: self.count("SELECT COUNT(*) FROM entities")?,
            aliases: self.count("SELECT COUNT(*) FROM entity_aliases")?,
            canonical_entities: self.count("SELECT COUNT(*) FROM canonical_entities")?,
            total_occurrences: self
                .count("SELECT COALESCE(SUM(occurrence_count), 0) FROM entities")?,
            total_mentions: self
                .count("SELECT COALESCE(SUM(total_mentions), 0) FROM canonical_entities")?,
        };
        if totals.total_occurrences != totals.total_mentions {
            return Err(ResolveError::inconsistent(format!(
                "canonical totals sum to {} but entities hold {}",
                totals.total_mentions, totals.total_occurrences
            )));
        }
        Ok(totals)
    }
}

impl CandidateSource for SqliteStore {
    fn candidate_pool(
        &self,
        entity_type: EntityType,
        min_occurrences: i64,
    ) -> Result<Vec<CandidateEntity>, ResolveError> {
        let mut stmt = self.conn.prepare(
            "SELECT e.entity_id, e.text, e.normalized_text, e.occurrence_count
             FROM entities e
             JOIN entity_aliases ea ON ea.entity_id = e.entity_id
             WHERE e.entity_type = ?1
               AND e.occurrence_count >= ?2
               AND ea.is_canonical = 1
             ORDER BY SUBSTR(e.normalized_text, 1, 3), e.occurrence_count DESC, e.entity_id ASC",
        )?;
        let rows = stmt.query_map(params![entity_type.as_str(), min_occurrences], |row| {
            Ok(CandidateEntity {
                entity_id: row.get(0)?,
                text: row.get(1)?,
                normalized_text: row.get(2)?,
                occurrence_count: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

impl ContextSource for SqliteStore {
    /// Context of the earliest recorded mention that carried one.
    fn context_for(&self, entity_id: EntityId) -> Result<Option<String>, ResolveError> {
        Ok(self
            .conn
            .query_row(
                "SELECT context FROM document_entities
                 WHERE entity_id = ?1 AND context IS NOT NULL AND context != ''
                 ORDER BY mention_id ASC
                 LIMIT 1",
                params![entity_id],
                |row| row.get(0),
            )
            .optional()?)
    }
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn decode_entity(row: &Row<'_>) -> rusqlite::Result<Entity> {
    Ok(Entity {
        entity_id: row.get(0)?,
        text: row.get(1)?,
        entity_type: decode_entity_type(row, 2)?,
        normalized_text: row.get(3)?,
        first_seen_doc_id: row.get(4)?,
        occurrence_count: row.get(5)?,
    })
}

fn decode_canonical(row: &Row<'_>) -> rusqlite::Result<CanonicalEntity> {
    Ok(CanonicalEntity {
        canonical_id: row.get(0)?,
        entity_type: decode_entity_type(row, 1)?,
        canonical_text: row.get(2)?,
        canonical_normalized: row.get(3)?,
        total_mentions: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn decode_entity_type(row: &Row<'_>, idx: usize) -> rusqlite::Result<EntityType> {
    let raw: String = row.get(idx)?;
    EntityType::parse(&raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.to_string().into())
    })
}

fn decode_merge_method(row: &Row<'_>, idx: usize) -> rusqlite::Result<MergeMethod> {
    let raw: String = row.get(idx)?;
    MergeMethod::parse(&raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.to_string().into())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidates::{CandidateQuery, find_merge_candidates};

    fn observe(store: &SqliteStore, doc: &str, text: &str, ty: EntityType, count: i64) {
        store
            .record_observations(&[Observation::new(doc, text, ty).with_increment(count)])
            .expect("record observation");
    }

    fn entity_id(store: &SqliteStore, text: &str) -> EntityId {
        store
            .entity_by_text(text, EntityType::Person)
            .expect("lookup")
            .expect("entity exists")
            .entity_id
    }

    fn merge(
        store: &mut SqliteStore,
        source: EntityId,
        target: CanonicalId,
    ) -> Result<MergeOutcome, ResolveError> {
        let request =
            MergeRequest::new(source, target, MergeMethod::Auto, 0.97, "auto_merge_script")
                .expect("request");
        store.apply_merge(&request)
    }

    #[test]
    fn observations_dedupe_on_normalized_text_and_seed_canonicals() {
        let store = SqliteStore::open_in_memory().expect("open");
        let summary = store
            .record_observations(&[
                Observation::new("doc-1", "Alan M. Dershowitz", EntityType::Person)
                    .with_context("counsel Alan M. Dershowitz said"),
                Observation::new("doc-2", "alan m dershowitz", EntityType::Person)
                    .with_increment(4),
                Observation::new("doc-2", "Palm Beach", EntityType::Location),
            ])
            .expect("record");
        assert_eq!(summary.observations, 3);
        assert_eq!(summary.new_entities, 2);
        assert_eq!(summary.updated_entities, 1);
        assert_eq!(summary.occurrences_added, 6);

        let alan = entity_id(&store, "Alan M. Dershowitz");
        let entity = store.entity(alan).expect("entity");
        assert_eq!(entity.occurrence_count, 5);
        assert_eq!(entity.first_seen_doc_id, "doc-1");
        assert_eq!(entity.text, "Alan M. Dershowitz");

        let canonical = store.canonical_for_entity(alan).expect("canonical");
        assert_eq!(canonical.total_mentions, 5);
        assert_eq!(canonical.canonical_text, "Alan M. Dershowitz");
        assert_eq!(
            store.context_for(alan).expect("context").as_deref(),
            Some("counsel Alan M. Dershowitz said")
        );

        let totals = store.verify_invariants().expect("invariants");
        assert_eq!(totals.entities, 2);
        assert_eq!(totals.aliases, 2);
        assert_eq!(totals.total_mentions, 6);
    }

    #[test]
    fn invalid_observation_rolls_back_the_batch() {
        let store = SqliteStore::open_in_memory().expect("open");
        let mut bad = Observation::new("doc-1", "Leon Black", EntityType::Person);
        bad.confidence = 2.0;
        let err = store
            .record_observations(&[
                Observation::new("doc-1", "Larry Summers", EntityType::Person),
                bad,
            ])
            .expect_err("bad confidence");
        assert!(matches!(err, ResolveError::InputValidation(_)));
        assert!(
            store
                .entity_by_text("Larry Summers", EntityType::Person)
                .expect("lookup")
                .is_none()
        );
        assert_eq!(store.verify_invariants().expect("invariants").entities, 0);
    }

    #[test]
    fn source_cursor_advances_with_its_batch() {
        let store = SqliteStore::open_in_memory().expect("open");
        assert!(store.ingest_cursor("vol-1.jsonl").expect("cursor").is_none());

        let first = Observation::new("doc-1", "Jean Luc Brunel", EntityType::Person);
        store
            .record_source_batch("vol-1.jsonl", "aaa", 80, &[first.with_increment(10)])
            .expect("first batch");
        let second = Observation::new("doc-2", "Jean Luc Brunel", EntityType::Person);
        store
            .record_source_batch("vol-1.jsonl", "bbb", 120, &[second])
            .expect("second batch");

        let cursor = store
            .ingest_cursor("vol-1.jsonl")
            .expect("cursor")
            .expect("recorded");
        assert_eq!(cursor.input_hash, "bbb");
        assert_eq!(cursor.consumed_bytes, 120);
        assert_eq!(cursor.observations, 2);
        assert_eq!(store.verify_invariants().expect("invariants").total_mentions, 11);
    }

    #[test]
    fn rejected_batch_leaves_the_cursor_where_it_was() {
        let store = SqliteStore::open_in_memory().expect("open");
        let good = [Observation::new("doc-1", "Sarah Kellen", EntityType::Person)];
        store
            .record_source_batch("vol-2.jsonl", "aaa", 40, &good)
            .expect("good batch");

        let mut bad = Observation::new("doc-2", "Sarah Kellen", EntityType::Person);
        bad.increment = 0;
        let err = store
            .record_source_batch("vol-2.jsonl", "bbb", 90, &[bad])
            .expect_err("bad increment");
        assert!(matches!(err, ResolveError::InputValidation(_)));

        let cursor = store
            .ingest_cursor("vol-2.jsonl")
            .expect("cursor")
            .expect("recorded");
        assert_eq!((cursor.input_hash.as_str(), cursor.consumed_bytes), ("aaa", 40));
        assert_eq!(store.verify_invariants().expect("invariants").total_mentions, 1);
        assert!(store.ingest_cursor("vol-3.jsonl").expect("cursor").is_none());
    }

    #[test]
    fn merge_across_entity_types_is_rejected() {
        let mut store = SqliteStore::open_in_memory().expect("open");
        observe(&store, "d1", "Virginia Giuffre", EntityType::Person, 8);
        observe(&store, "d1", "Virginia", EntityType::Location, 3);
        let person = entity_id(&store, "Virginia Giuffre");
        let person_canonical = store.canonical_id_for(person).expect("person");
        let place = store
            .entity_by_text("Virginia", EntityType::Location)
            .expect("lookup")
            .expect("location exists")
            .entity_id;
        let place_canonical = store.canonical_id_for(place).expect("place");

        let err = merge(&mut store, person, place_canonical).expect_err("type mismatch");
        assert!(matches!(err, ResolveError::InputValidation(_)), "{err:?}");
        assert_eq!(store.canonical_id_for(person).expect("mapped"), person_canonical);
        assert_eq!(store.canonical(place_canonical).expect("place").total_mentions, 3);
        assert_eq!(store.canonical(person_canonical).expect("person").total_mentions, 8);
        store.verify_invariants().expect("invariants");
    }

    #[test]
    fn merge_moves_mentions_and_deletes_orphan_canonical() {
        let mut store = SqliteStore::open_in_memory().expect("open");
        observe(&store, "d1", "Jeffrey Epstein", EntityType::Person, 50);
        observe(&store, "d2", "Jefffrey Epstein", EntityType::Person, 2);
        let common = entity_id(&store, "Jeffrey Epstein");
        let typo = entity_id(&store, "Jefffrey Epstein");
        let target = store.canonical_id_for(common).expect("target");
        let orphan = store.canonical_id_for(typo).expect("orphan");

        let outcome = merge(&mut store, typo, target).expect("merge");
        assert_eq!(
            outcome,
            MergeOutcome::Merged {
                source_canonical_id: orphan,
                target_canonical_id: target,
                moved_mentions: 2,
                orphaned_canonical_deleted: true,
            }
        );
        assert_eq!(store.canonical(target).expect("target").total_mentions, 52);
        assert!(matches!(store.canonical(orphan), Err(ResolveError::NotFound(_))));

        let members = store.aliases_for_canonical(target).expect("members");
        assert_eq!(
            members.iter().map(|m| m.entity_id).collect::<Vec<_>>(),
            vec![common, typo]
        );
        assert!(members[0].is_canonical);
        assert!(!members[1].is_canonical);
        assert_eq!(members[1].merge_method, MergeMethod::Auto);
        assert_eq!(members[1].merged_by, "auto_merge_script");
        store.verify_invariants().expect("invariants");

        // Later mentions of a merged entity still land on the surviving cluster.
        observe(&store, "d3", "Jefffrey Epstein", EntityType::Person, 3);
        assert_eq!(store.canonical(target).expect("target").total_mentions, 55);
        store.verify_invariants().expect("invariants after ingest");
    }

    #[test]
    fn merging_into_own_cluster_is_a_no_op() {
        let mut store = SqliteStore::open_in_memory().expect("open");
        observe(&store, "d1", "Ghislaine Maxwell", EntityType::Person, 7);
        let id = entity_id(&store, "Ghislaine Maxwell");
        let own = store.canonical_id_for(id).expect("own");
        let before = store.canonical(own).expect("before");

        let outcome = merge(&mut store, id, own).expect("no-op");
        assert_eq!(outcome, MergeOutcome::AlreadyMerged { canonical_id: own });
        assert_eq!(store.canonical(own).expect("after"), before);
        assert!(store.aliases_for_canonical(own).expect("members")[0].is_canonical);
    }

    #[test]
    fn failed_merges_leave_the_graph_untouched() {
        let mut store = SqliteStore::open_in_memory().expect("open");
        observe(&store, "d1", "Leon Black", EntityType::Person, 9);
        let id = entity_id(&store, "Leon Black");
        let own = store.canonical_id_for(id).expect("own");

        assert!(matches!(merge(&mut store, id, 999), Err(ResolveError::NotFound(_))));
        assert!(matches!(merge(&mut store, 999, own), Err(ResolveError::NotFound(_))));
        assert_eq!(store.canonical(own).expect("own").total_mentions, 9);
        store.verify_invariants().expect("invariants");
    }

    #[test]
    fn drifted_totals_are_a_consistency_violation_and_block_merges() {
        let mut store = SqliteStore::open_in_memory().expect("open");
        observe(&store, "d1", "Bear Stearns", EntityType::Person, 10);
        observe(&store, "d1", "Bear Steams", EntityType::Person, 4);
        let source = entity_id(&store, "Bear Steams");
        let target = store
            .canonical_id_for(entity_id(&store, "Bear Stearns"))
            .expect("target");
        let source_canonical = store.canonical_id_for(source).expect("source canonical");

        store
            .conn
            .execute(
                "UPDATE canonical_entities SET total_mentions = 1 WHERE canonical_id = ?1",
                params![source_canonical],
            )
            .expect("corrupt");
        assert!(matches!(
            store.verify_invariants(),
            Err(ResolveError::ConsistencyViolation(_))
        ));

        let err = merge(&mut store, source, target).expect_err("drained source");
        assert!(err.is_fatal());
        assert_eq!(store.canonical(target).expect("target").total_mentions, 10);
        assert_eq!(store.canonical_id_for(source).expect("unchanged"), source_canonical);
    }

    #[test]
    fn initialize_backfills_legacy_entities_idempotently() {
        let store = SqliteStore::open_in_memory().expect("open");
        observe(&store, "d1", "Larry Summers", EntityType::Person, 3);
        store
            .conn
            .execute(
                "INSERT INTO entities (text, entity_type, normalized_text, first_seen_doc_id, occurrence_count)
                 VALUES ('New York', 'location', 'new york', 'd9', 6)",
                [],
            )
            .expect("legacy row");
        assert!(store.verify_invariants().is_err());

        let first = store.initialize_canonical().expect("init");
        assert_eq!(
            first,
            InitSummary {
                total_entities: 2,
                canonical_created: 1,
                aliases_created: 1,
            }
        );
        let second = store.initialize_canonical().expect("re-init");
        assert_eq!(second.canonical_created, 0);
        let totals = store.verify_invariants().expect("invariants");
        assert_eq!(totals.total_mentions, 9);
    }

    #[test]
    fn search_and_stats_report_clusters() {
        let mut store = SqliteStore::open_in_memory().expect("open");
        observe(&store, "d1", "Jeffrey Epstein", EntityType::Person, 50);
        observe(&store, "d1", "Jefffrey Epstein", EntityType::Person, 2);
        observe(&store, "d1", "Jeff_Smith", EntityType::Person, 80);
        observe(&store, "d1", "Jefferson County", EntityType::Location, 5);
        let target = store
            .canonical_id_for(entity_id(&store, "Jeffrey Epstein"))
            .expect("target");
        let source = entity_id(&store, "Jefffrey Epstein");
        merge(&mut store, source, target).expect("merge");

        let hits = store.search_canonical("JEFF", None, 10).expect("search");
        assert_eq!(
            hits.iter().map(|c| c.canonical_text.as_str()).collect::<Vec<_>>(),
            vec!["Jeff_Smith", "Jeffrey Epstein", "Jefferson County"]
        );
        let literal = store.search_canonical("jeff_", None, 10).expect("literal");
        assert_eq!(literal.len(), 1);
        let places = store
            .search_canonical("jeff", Some(EntityType::Location), 10)
            .expect("typed");
        assert_eq!(places.len(), 1);

        let stats = store.canonical_stats().expect("stats");
        assert_eq!(stats.total_canonical, 3);
        assert_eq!(stats.total_aliases, 4);
        assert_eq!(stats.by_type.get("person"), Some(&2));
        assert_eq!(stats.top_merged.len(), 1);
        assert_eq!(stats.top_merged[0].alias_count, 2);
        assert_eq!(stats.top_merged[0].total_mentions, 52);
    }

    #[test]
    fn candidate_pool_skips_merged_and_rare_entities() {
        let mut store = SqliteStore::open_in_memory().expect("open");
        observe(&store, "d1", "Ghislaine Maxwell", EntityType::Person, 40);
        observe(&store, "d1", "Ghislaine Maxwel", EntityType::Person, 6);
        observe(&store, "d1", "Ghislane Maxwell", EntityType::Person, 5);
        observe(&store, "d1", "Ghislaine Maxwelll", EntityType::Person, 1);

        let query = CandidateQuery::new(EntityType::Person);
        let scan = find_merge_candidates(&store, &query).expect("scan");
        assert_eq!(scan.entities, 3);

        let target = store
            .canonical_id_for(entity_id(&store, "Ghislaine Maxwell"))
            .expect("target");
        let source = entity_id(&store, "Ghislaine Maxwel");
        merge(&mut store, source, target).expect("merge");
        let pool = store.candidate_pool(EntityType::Person, 5).expect("pool");
        assert_eq!(
            pool.iter().map(|e| e.text.as_str()).collect::<Vec<_>>(),
            vec!["Ghislaine Maxwell", "Ghislane Maxwell"]
        );
    }

    #[test]
    fn snapshot_matches_live_graph() {
        let mut store = SqliteStore::open_in_memory().expect("open");
        observe(&store, "d1", "Kathy Ruemmler", EntityType::Person, 12);
        observe(&store, "d1", "Kathy Ruemmier", EntityType::Person, 3);
        let target = store
            .canonical_id_for(entity_id(&store, "Kathy Ruemmler"))
            .expect("target");
        let source = entity_id(&store, "Kathy Ruemmier");
        merge(&mut store, source, target).expect("merge");

        let snapshot = store.snapshot_graph().expect("snapshot");
        assert_eq!(
            snapshot.verify_invariants().expect("arena"),
            store.verify_invariants().expect("sqlite")
        );
        assert_eq!(snapshot.total_mentions(target), Some(15));
    }
}

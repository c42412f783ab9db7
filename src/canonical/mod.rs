pub mod arena;

use serde::{Deserialize, Serialize};

use crate::entity::{CanonicalId, EntityId, EntityType};
use crate::error::{ResolveError, validate_confidence};

pub use arena::ArenaGraph;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMethod {
    Initial,
    Auto,
    Llm,
    Manual,
}

impl MergeMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Auto => "auto",
            Self::Llm => "llm",
            Self::Manual => "manual",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ResolveError> {
        match raw {
            "initial" => Ok(Self::Initial),
            "auto" => Ok(Self::Auto),
            "llm" => Ok(Self::Llm),
            "manual" => Ok(Self::Manual),
            _ => Err(ResolveError::invalid(format!("unknown merge method `{raw}`"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalEntity {
    pub canonical_id: CanonicalId,
    pub entity_type: EntityType,
    pub canonical_text: String,
    pub canonical_normalized: String,
    pub total_mentions: i64,
    pub created_at: String,
    pub updated_at: String,
}

/// A member entity of a canonical cluster, joined with its alias row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AliasMember {
    pub entity_id: EntityId,
    pub text: String,
    pub entity_type: EntityType,
    pub normalized_text: String,
    pub occurrence_count: i64,
    pub is_canonical: bool,
    pub merge_method: MergeMethod,
    pub merge_confidence: f64,
    pub merged_at: String,
    pub merged_by: String,
}

/// Request to move one entity into another cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeRequest {
    pub source_entity_id: EntityId,
    pub target_canonical_id: CanonicalId,
    pub method: MergeMethod,
    pub confidence: f64,
    pub merged_by: String,
}

impl MergeRequest {
    pub fn new(
        source_entity_id: EntityId,
        target_canonical_id: CanonicalId,
        method: MergeMethod,
        confidence: f64,
        merged_by: impl Into<String>,
    ) -> Result<Self, ResolveError> {
        validate_confidence("merge confidence", confidence)?;
        if method == MergeMethod::Initial {
            return Err(ResolveError::invalid(
                "`initial` is reserved for seeding and cannot be used to merge",
            ));
        }
        let merged_by = merged_by.into();
        if merged_by.trim().is_empty() {
            return Err(ResolveError::invalid("merged_by must not be empty"));
        }
        Ok(Self {
            source_entity_id,
            target_canonical_id,
            method,
            confidence,
            merged_by,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MergeOutcome {
    AlreadyMerged {
        canonical_id: CanonicalId,
    },
    Merged {
        source_canonical_id: CanonicalId,
        target_canonical_id: CanonicalId,
        moved_mentions: i64,
        orphaned_canonical_deleted: bool,
    },
}

impl MergeOutcome {
    pub fn is_merged(&self) -> bool {
        matches!(self, Self::Merged { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GraphTotals {
    pub entities: i64,
    pub aliases: i64,
    pub canonical_entities: i64,
    pub total_occurrences: i64,
    pub total_mentions: i64,
}

/// The mutable entity -> canonical mapping.
///
/// Implementations must make `apply_merge` atomic: either the alias rewrite,
/// both mention totals, and the orphan cleanup all land, or none of them do.
/// Callers serialize merges; nothing here is safe to interleave.
pub trait CanonicalGraph {
    fn canonical_id_for(&self, entity_id: EntityId) -> Result<CanonicalId, ResolveError>;

    fn apply_merge(&mut self, request: &MergeRequest) -> Result<MergeOutcome, ResolveError>;

    /// Checks total mapping, mention conservation and orphan absence.
    fn verify_invariants(&self) -> Result<GraphTotals, ResolveError>;
}

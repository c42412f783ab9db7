//! Merge candidate discovery.
//!
//! Entities are blocked by the first three characters of their normalized
//! text and only compared within a block. Pairs that differ in that prefix
//! are never proposed, whatever their similarity.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

use crate::entity::similarity::{block_key, char_len, edit_distance, jaccard_similarity};
use crate::entity::{EntityId, EntityType};
use crate::error::{ResolveError, validate_confidence};
use crate::scoring::{ScoreInput, score_merge};

pub const MIN_OCCURRENCES_DEFAULT: i64 = 5;
pub const MAX_EDIT_DISTANCE_DEFAULT: usize = 3;
pub const MIN_CONFIDENCE_DEFAULT: f64 = 0.70;
pub const LIMIT_DEFAULT: usize = 100;

/// An unmerged entity eligible to compete as a fresh candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateEntity {
    pub entity_id: EntityId,
    pub text: String,
    pub normalized_text: String,
    pub occurrence_count: i64,
}

pub trait CandidateSource {
    /// Entities of `entity_type` with at least `min_occurrences` mentions whose
    /// alias still marks them canonical.
    fn candidate_pool(
        &self,
        entity_type: EntityType,
        min_occurrences: i64,
    ) -> Result<Vec<CandidateEntity>, ResolveError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CandidateQuery {
    pub entity_type: EntityType,
    pub min_occurrences: i64,
    pub max_edit_distance: usize,
    pub min_confidence: f64,
    pub limit: usize,
}

impl CandidateQuery {
    pub fn new(entity_type: EntityType) -> Self {
        Self {
            entity_type,
            min_occurrences: MIN_OCCURRENCES_DEFAULT,
            max_edit_distance: MAX_EDIT_DISTANCE_DEFAULT,
            min_confidence: MIN_CONFIDENCE_DEFAULT,
            limit: LIMIT_DEFAULT,
        }
    }

    fn validate(&self) -> Result<(), ResolveError> {
        validate_confidence("min_confidence", self.min_confidence)?;
        if self.min_occurrences < 1 {
            return Err(ResolveError::invalid("min_occurrences must be >= 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidateSide {
    pub id: EntityId,
    pub text: String,
    pub normalized: String,
    pub count: i64,
}

impl From<&CandidateEntity> for CandidateSide {
    fn from(entity: &CandidateEntity) -> Self {
        Self {
            id: entity.entity_id,
            text: entity.text.clone(),
            normalized: entity.normalized_text.clone(),
            count: entity.occurrence_count,
        }
    }
}

/// Ephemeral merge proposal; never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeCandidate {
    pub entity1: CandidateSide,
    pub entity2: CandidateSide,
    pub distance: usize,
    pub jaccard: f64,
    pub confidence: f64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateScan {
    pub entity_type: EntityType,
    pub entities: usize,
    pub blocks: usize,
    pub comparisons: u64,
    pub candidates: Vec<MergeCandidate>,
}

pub fn find_merge_candidates(
    source: &dyn CandidateSource,
    query: &CandidateQuery,
) -> Result<CandidateScan, ResolveError> {
    query.validate()?;
    let pool = source.candidate_pool(query.entity_type, query.min_occurrences)?;
    find_candidates_in(&pool, query)
}

pub fn find_candidates_in(
    pool: &[CandidateEntity],
    query: &CandidateQuery,
) -> Result<CandidateScan, ResolveError> {
    query.validate()?;

    let mut blocks: BTreeMap<String, Vec<&CandidateEntity>> = BTreeMap::new();
    let mut entities = 0usize;
    for entity in pool
        .iter()
        .filter(|e| e.occurrence_count >= query.min_occurrences)
    {
        entities += 1;
        blocks
            .entry(block_key(&entity.normalized_text))
            .or_default()
            .push(entity);
    }

    let mut candidates = Vec::new();
    let mut comparisons = 0u64;
    for block in blocks.values_mut() {
        block.sort_by(|a, b| {
            b.occurrence_count
                .cmp(&a.occurrence_count)
                .then_with(|| a.entity_id.cmp(&b.entity_id))
        });

        for (i, left) in block.iter().enumerate() {
            for right in &block[i + 1..] {
                comparisons += 1;
                if let Some(candidate) = compare_pair(left, right, query)? {
                    candidates.push(candidate);
                }
            }
        }
    }

    debug!(
        entity_type = %query.entity_type,
        entities,
        blocks = blocks.len(),
        comparisons,
        found = candidates.len(),
        "candidate scan finished"
    );

    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    candidates.truncate(query.limit);

    Ok(CandidateScan {
        entity_type: query.entity_type,
        entities,
        blocks: blocks.len(),
        comparisons,
        candidates,
    })
}

fn compare_pair(
    left: &CandidateEntity,
    right: &CandidateEntity,
    query: &CandidateQuery,
) -> Result<Option<MergeCandidate>, ResolveError> {
    let len_diff = char_len(&left.normalized_text).abs_diff(char_len(&right.normalized_text));
    if len_diff > query.max_edit_distance {
        return Ok(None);
    }

    // Zero shared words rules the pair out even when the edit distance is tiny.
    let jaccard = jaccard_similarity(&left.normalized_text, &right.normalized_text);
    if jaccard == 0.0 {
        return Ok(None);
    }

    let distance = edit_distance(&left.normalized_text, &right.normalized_text);
    if distance > query.max_edit_distance {
        return Ok(None);
    }

    let score = score_merge(ScoreInput {
        text1: &left.text,
        text2: &right.text,
        count1: left.occurrence_count,
        count2: right.occurrence_count,
        edit_distance: distance,
        jaccard,
    })?;
    if score.confidence < query.min_confidence {
        return Ok(None);
    }

    Ok(Some(MergeCandidate {
        entity1: CandidateSide::from(left),
        entity2: CandidateSide::from(right),
        distance,
        jaccard,
        confidence: score.confidence,
        reason: score.reason,
    }))
}

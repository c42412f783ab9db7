use std::collections::BTreeMap;

use crate::canonical::{CanonicalGraph, GraphTotals, MergeMethod, MergeOutcome, MergeRequest};
use crate::entity::{CanonicalId, EntityId};
use crate::error::ResolveError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cluster {
    total_mentions: i64,
    member_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
struct Member {
    canonical_id: CanonicalId,
    occurrence_count: i64,
    is_canonical: bool,
    method: MergeMethod,
    confidence: f64,
    merged_by: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotAlias {
    pub entity_id: EntityId,
    pub canonical_id: CanonicalId,
    pub occurrence_count: i64,
    pub is_canonical: bool,
    pub method: MergeMethod,
}

/// In-memory canonical graph: cluster records keyed by canonical id plus an
/// entity -> cluster index. Merges rewrite the index and adjust two cluster
/// totals; nothing is relinked.
#[derive(Debug, Clone, Default)]
pub struct ArenaGraph {
    clusters: BTreeMap<CanonicalId, Cluster>,
    members: BTreeMap<EntityId, Member>,
}

impl ArenaGraph {
    /// One cluster per entity, canonical ids allocated from 1.
    pub fn seed<I>(entities: I) -> Result<Self, ResolveError>
    where
        I: IntoIterator<Item = (EntityId, i64)>,
    {
        let mut graph = Self::default();
        let mut next_id: CanonicalId = 1;
        for (entity_id, occurrence_count) in entities {
            if occurrence_count < 1 {
                return Err(ResolveError::invalid(format!(
                    "entity {entity_id} has occurrence_count {occurrence_count}"
                )));
            }
            if graph.members.contains_key(&entity_id) {
                return Err(ResolveError::invalid(format!(
                    "entity {entity_id} seeded twice"
                )));
            }
            graph.clusters.insert(
                next_id,
                Cluster {
                    total_mentions: occurrence_count,
                    member_count: 1,
                },
            );
            graph.members.insert(
                entity_id,
                Member {
                    canonical_id: next_id,
                    occurrence_count,
                    is_canonical: true,
                    method: MergeMethod::Initial,
                    confidence: 1.0,
                    merged_by: "system".to_string(),
                },
            );
            next_id += 1;
        }
        Ok(graph)
    }

    /// Rebuilds a graph from persisted rows. Totals are taken as stored so
    /// `verify_invariants` can catch drift in the source.
    pub fn from_snapshot(
        clusters: &[(CanonicalId, i64)],
        aliases: &[SnapshotAlias],
    ) -> Result<Self, ResolveError> {
        let mut graph = Self::default();
        for &(canonical_id, total_mentions) in clusters {
            graph.clusters.insert(
                canonical_id,
                Cluster {
                    total_mentions,
                    member_count: 0,
                },
            );
        }
        for alias in aliases {
            let cluster = graph.clusters.get_mut(&alias.canonical_id).ok_or_else(|| {
                ResolveError::inconsistent(format!(
                    "entity {} maps to missing canonical {}",
                    alias.entity_id, alias.canonical_id
                ))
            })?;
            cluster.member_count += 1;
            graph.members.insert(
                alias.entity_id,
                Member {
                    canonical_id: alias.canonical_id,
                    occurrence_count: alias.occurrence_count,
                    is_canonical: alias.is_canonical,
                    method: alias.method,
                    confidence: 1.0,
                    merged_by: "snapshot".to_string(),
                },
            );
        }
        Ok(graph)
    }

    pub fn canonical_count(&self) -> usize {
        self.clusters.len()
    }

    pub fn contains_canonical(&self, canonical_id: CanonicalId) -> bool {
        self.clusters.contains_key(&canonical_id)
    }

    pub fn total_mentions(&self, canonical_id: CanonicalId) -> Option<i64> {
        self.clusters.get(&canonical_id).map(|c| c.total_mentions)
    }

    pub fn is_canonical(&self, entity_id: EntityId) -> Option<bool> {
        self.members.get(&entity_id).map(|m| m.is_canonical)
    }

    pub fn merge_method(&self, entity_id: EntityId) -> Option<(MergeMethod, f64, &str)> {
        self.members
            .get(&entity_id)
            .map(|m| (m.method, m.confidence, m.merged_by.as_str()))
    }

    pub fn members_of(&self, canonical_id: CanonicalId) -> Vec<EntityId> {
        self.members
            .iter()
            .filter(|(_, m)| m.canonical_id == canonical_id)
            .map(|(id, _)| *id)
            .collect()
    }
}

impl CanonicalGraph for ArenaGraph {
    fn canonical_id_for(&self, entity_id: EntityId) -> Result<CanonicalId, ResolveError> {
        self.members
            .get(&entity_id)
            .map(|m| m.canonical_id)
            .ok_or_else(|| ResolveError::not_found(format!("entity {entity_id} has no alias")))
    }

    fn apply_merge(&mut self, request: &MergeRequest) -> Result<MergeOutcome, ResolveError> {
        let member = self.members.get(&request.source_entity_id).ok_or_else(|| {
            ResolveError::not_found(format!(
                "entity {} has no alias",
                request.source_entity_id
            ))
        })?;
        let source_canonical_id = member.canonical_id;
        let target_canonical_id = request.target_canonical_id;
        if source_canonical_id == target_canonical_id {
            return Ok(MergeOutcome::AlreadyMerged {
                canonical_id: source_canonical_id,
            });
        }
        if !self.clusters.contains_key(&target_canonical_id) {
            return Err(ResolveError::not_found(format!(
                "canonical {target_canonical_id} does not exist"
            )));
        }

        // Validate everything before the first write so a failure leaves no trace.
        let moved = member.occurrence_count;
        let source = *self.clusters.get(&source_canonical_id).ok_or_else(|| {
            ResolveError::inconsistent(format!(
                "entity {} maps to missing canonical {source_canonical_id}",
                request.source_entity_id
            ))
        })?;
        let drained = source.member_count == 1 && source.total_mentions != moved;
        if source.member_count == 0 || source.total_mentions < moved || drained {
            return Err(ResolveError::inconsistent(format!(
                "canonical {source_canonical_id} holds {} mentions across {} members, cannot release {moved}",
                source.total_mentions, source.member_count
            )));
        }

        if let Some(member) = self.members.get_mut(&request.source_entity_id) {
            member.canonical_id = target_canonical_id;
            member.is_canonical = false;
            member.method = request.method;
            member.confidence = request.confidence;
            member.merged_by = request.merged_by.clone();
        }
        if let Some(target) = self.clusters.get_mut(&target_canonical_id) {
            target.total_mentions += moved;
            target.member_count += 1;
        }
        let remaining = source.member_count - 1;
        if remaining == 0 {
            self.clusters.remove(&source_canonical_id);
        } else if let Some(source) = self.clusters.get_mut(&source_canonical_id) {
            source.total_mentions -= moved;
            source.member_count = remaining;
        }

        Ok(MergeOutcome::Merged {
            source_canonical_id,
            target_canonical_id,
            moved_mentions: moved,
            orphaned_canonical_deleted: remaining == 0,
        })
    }

    fn verify_invariants(&self) -> Result<GraphTotals, ResolveError> {
        let mut sums: BTreeMap<CanonicalId, (i64, usize)> = BTreeMap::new();
        for (entity_id, member) in &self.members {
            if !self.clusters.contains_key(&member.canonical_id) {
                return Err(ResolveError::inconsistent(format!(
                    "entity {entity_id} maps to missing canonical {}",
                    member.canonical_id
                )));
            }
            let entry = sums.entry(member.canonical_id).or_default();
            entry.0 += member.occurrence_count;
            entry.1 += 1;
        }

        for (canonical_id, cluster) in &self.clusters {
            let (sum, count) = sums.get(canonical_id).copied().unwrap_or((0, 0));
            if count == 0 {
                return Err(ResolveError::inconsistent(format!(
                    "canonical {canonical_id} is an orphan"
                )));
            }
            if sum != cluster.total_mentions || count != cluster.member_count {
                return Err(ResolveError::inconsistent(format!(
                    "canonical {canonical_id} records {} mentions over {} members, members hold {sum} over {count}",
                    cluster.total_mentions, cluster.member_count
                )));
            }
        }

        let total_occurrences = self.members.values().map(|m| m.occurrence_count).sum();
        let total_mentions = self.clusters.values().map(|c| c.total_mentions).sum();
        Ok(GraphTotals {
            entities: self.members.len() as i64,
            aliases: self.members.len() as i64,
            canonical_entities: self.clusters.len() as i64,
            total_occurrences,
            total_mentions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(source: EntityId, target: CanonicalId) -> MergeRequest {
        MergeRequest::new(source, target, MergeMethod::Auto, 0.97, "test").expect("request")
    }

    #[test]
    fn seeding_is_one_cluster_per_entity() {
        let graph = ArenaGraph::seed([(10, 50), (11, 2), (12, 7)]).expect("seed");
        assert_eq!(graph.canonical_count(), 3);
        assert_eq!(graph.canonical_id_for(11).expect("alias"), 2);
        assert_eq!(graph.is_canonical(12), Some(true));
        let totals = graph.verify_invariants().expect("valid");
        assert_eq!(totals.total_mentions, 59);
    }

    #[test]
    fn merge_moves_mentions_and_deletes_orphan() {
        let mut graph = ArenaGraph::seed([(10, 50), (11, 2)]).expect("seed");
        let outcome = graph.apply_merge(&request(11, 1)).expect("merge");
        assert_eq!(
            outcome,
            MergeOutcome::Merged {
                source_canonical_id: 2,
                target_canonical_id: 1,
                moved_mentions: 2,
                orphaned_canonical_deleted: true,
            }
        );
        assert_eq!(graph.total_mentions(1), Some(52));
        assert!(!graph.contains_canonical(2));
        assert_eq!(graph.is_canonical(11), Some(false));
        assert_eq!(graph.members_of(1), vec![10, 11]);
        graph.verify_invariants().expect("still valid");
    }

    #[test]
    fn merging_into_own_cluster_is_a_no_op() {
        let mut graph = ArenaGraph::seed([(10, 5), (11, 3)]).expect("seed");
        let outcome = graph.apply_merge(&request(10, 1)).expect("no-op");
        assert_eq!(outcome, MergeOutcome::AlreadyMerged { canonical_id: 1 });
        assert_eq!(graph.total_mentions(1), Some(5));
        assert_eq!(graph.merge_method(10).map(|m| m.0), Some(MergeMethod::Initial));
    }

    #[test]
    fn moving_one_of_two_members_keeps_source_cluster() {
        let mut graph = ArenaGraph::seed([(1, 10), (2, 4), (3, 6)]).expect("seed");
        graph.apply_merge(&request(2, 1)).expect("2 -> c1");
        let outcome = graph.apply_merge(&request(1, 3)).expect("1 -> c3");
        assert!(matches!(
            outcome,
            MergeOutcome::Merged {
                orphaned_canonical_deleted: false,
                moved_mentions: 10,
                ..
            }
        ));
        assert_eq!(graph.total_mentions(1), Some(4));
        assert_eq!(graph.total_mentions(3), Some(16));
        graph.verify_invariants().expect("valid");
    }

    #[test]
    fn unknown_ids_fail_without_mutation() {
        let mut graph = ArenaGraph::seed([(1, 10), (2, 4)]).expect("seed");
        assert!(matches!(
            graph.apply_merge(&request(99, 1)),
            Err(ResolveError::NotFound(_))
        ));
        assert!(matches!(
            graph.apply_merge(&request(2, 42)),
            Err(ResolveError::NotFound(_))
        ));
        assert_eq!(graph.canonical_id_for(2).expect("alias"), 2);
        assert_eq!(graph.total_mentions(2), Some(4));
    }

    #[test]
    fn snapshot_with_drifted_totals_fails_verification() {
        let aliases = [
            SnapshotAlias {
                entity_id: 1,
                canonical_id: 7,
                occurrence_count: 3,
                is_canonical: true,
                method: MergeMethod::Initial,
            },
            SnapshotAlias {
                entity_id: 2,
                canonical_id: 7,
                occurrence_count: 4,
                is_canonical: false,
                method: MergeMethod::Llm,
            },
        ];
        let drifted = ArenaGraph::from_snapshot(&[(7, 6)], &aliases).expect("load");
        assert!(matches!(
            drifted.verify_invariants(),
            Err(ResolveError::ConsistencyViolation(_))
        ));

        let orphaned = ArenaGraph::from_snapshot(&[(7, 7), (8, 0)], &aliases).expect("load");
        assert!(orphaned.verify_invariants().is_err());

        let dangling = [SnapshotAlias {
            entity_id: 3,
            canonical_id: 99,
            occurrence_count: 1,
            is_canonical: true,
            method: MergeMethod::Initial,
        }];
        assert!(ArenaGraph::from_snapshot(&[(7, 7)], &dangling).is_err());
    }
}

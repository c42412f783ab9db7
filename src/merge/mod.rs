//! Single merge execution against any [`CanonicalGraph`].

use tracing::{error, info};

use crate::canonical::{CanonicalGraph, MergeMethod, MergeOutcome, MergeRequest};
use crate::entity::{CanonicalId, EntityId};
use crate::error::ResolveError;

pub const AUTO_MERGE_ACTOR: &str = "auto_merge_script";

/// Moves `source_entity_id` into `target_canonical_id`.
///
/// Inputs are validated before the graph is touched. The graph applies the
/// merge atomically, so an error here means nothing changed.
pub fn merge(
    graph: &mut dyn CanonicalGraph,
    source_entity_id: EntityId,
    target_canonical_id: CanonicalId,
    method: MergeMethod,
    confidence: f64,
    actor: &str,
) -> Result<MergeOutcome, ResolveError> {
    let request = MergeRequest::new(
        source_entity_id,
        target_canonical_id,
        method,
        confidence,
        actor,
    )?;
    execute(graph, &request)
}

pub fn execute(
    graph: &mut dyn CanonicalGraph,
    request: &MergeRequest,
) -> Result<MergeOutcome, ResolveError> {
    match graph.apply_merge(request) {
        Ok(outcome) => {
            if let MergeOutcome::Merged {
                source_canonical_id,
                target_canonical_id,
                moved_mentions,
                orphaned_canonical_deleted,
            } = &outcome
            {
                info!(
                    entity = request.source_entity_id,
                    from = source_canonical_id,
                    to = target_canonical_id,
                    moved_mentions,
                    orphan_deleted = orphaned_canonical_deleted,
                    method = request.method.as_str(),
                    actor = %request.merged_by,
                    "merged entity"
                );
            }
            Ok(outcome)
        }
        Err(err) => {
            error!(
                entity = request.source_entity_id,
                target = request.target_canonical_id,
                error = %err,
                "merge failed"
            );
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::ArenaGraph;

    #[test]
    fn merges_and_reports_orphan_cleanup() {
        let mut graph = ArenaGraph::seed([(10, 50), (11, 2)]).expect("seed");
        let target = graph.canonical_id_for(10).expect("target");
        let outcome = merge(&mut graph, 11, target, MergeMethod::Auto, 1.0, AUTO_MERGE_ACTOR)
            .expect("merge");
        assert!(outcome.is_merged());
        assert_eq!(graph.canonical_id_for(11).expect("moved"), target);
        assert_eq!(graph.canonical_count(), 1);
    }

    #[test]
    fn second_merge_of_same_entity_is_idempotent() {
        let mut graph = ArenaGraph::seed([(1, 8), (2, 3)]).expect("seed");
        let target = graph.canonical_id_for(1).expect("target");
        merge(&mut graph, 2, target, MergeMethod::Manual, 1.0, "reviewer").expect("first");
        let again =
            merge(&mut graph, 2, target, MergeMethod::Manual, 1.0, "reviewer").expect("again");
        assert_eq!(again, MergeOutcome::AlreadyMerged { canonical_id: target });
        assert_eq!(graph.total_mentions(target), Some(11));
    }

    #[test]
    fn invalid_requests_never_reach_the_graph() {
        let mut graph = ArenaGraph::seed([(1, 8), (2, 3)]).expect("seed");
        let target = graph.canonical_id_for(1).expect("target");
        let err = merge(&mut graph, 2, target, MergeMethod::Llm, 1.4, "llm:test")
            .expect_err("bad confidence");
        assert!(matches!(err, ResolveError::InputValidation(_)));
        assert_eq!(graph.canonical_count(), 2);
    }
}

//! Three-tier review of merge candidates.
//!
//! High-confidence candidates merge automatically, the middle band goes to a
//! judgment oracle, and the low band is only surfaced for a human. Oracle
//! calls may run in parallel; merges are always applied one at a time.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::candidates::MergeCandidate;
use crate::canonical::{CanonicalGraph, MergeMethod, MergeOutcome};
use crate::entity::{CanonicalId, EntityId, EntityType};
use crate::error::ResolveError;
use crate::merge::{AUTO_MERGE_ACTOR, merge};
use crate::oracle::{ContextSource, MergeOracle, OracleRequest, OracleVerdict, consult_all};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ReviewThresholds {
    pub auto_merge: f64,
    pub oracle_review: f64,
    pub manual_review: f64,
}

impl Default for ReviewThresholds {
    fn default() -> Self {
        Self {
            auto_merge: 0.95,
            oracle_review: 0.80,
            manual_review: 0.70,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReviewTier {
    AutoMerge(MergeCandidate),
    OracleReview(MergeCandidate),
    ManualReview(MergeCandidate),
    BelowThreshold(MergeCandidate),
}

impl ReviewTier {
    pub fn route(candidate: MergeCandidate, thresholds: &ReviewThresholds) -> Self {
        let confidence = candidate.confidence;
        if confidence >= thresholds.auto_merge {
            Self::AutoMerge(candidate)
        } else if confidence >= thresholds.oracle_review {
            Self::OracleReview(candidate)
        } else if confidence >= thresholds.manual_review {
            Self::ManualReview(candidate)
        } else {
            Self::BelowThreshold(candidate)
        }
    }

    pub fn candidate(&self) -> &MergeCandidate {
        match self {
            Self::AutoMerge(c)
            | Self::OracleReview(c)
            | Self::ManualReview(c)
            | Self::BelowThreshold(c) => c,
        }
    }
}

/// Which tiers a run may execute. Unselected tiers are deferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TierSelection {
    Auto,
    Oracle,
    #[default]
    All,
}

impl TierSelection {
    pub fn parse(raw: &str) -> Result<Self, ResolveError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "oracle" | "llm" => Ok(Self::Oracle),
            "all" => Ok(Self::All),
            _ => Err(ResolveError::invalid(format!("unknown review tier `{raw}`"))),
        }
    }

    pub fn runs_auto(self) -> bool {
        matches!(self, Self::Auto | Self::All)
    }

    pub fn runs_oracle(self) -> bool {
        matches!(self, Self::Oracle | Self::All)
    }
}

/// Source and target of a candidate merge. The less frequent entity moves;
/// on a tie entity2 is the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeDirection {
    pub source_entity_id: EntityId,
    pub source_text: String,
    pub target_entity_id: EntityId,
    pub target_text: String,
}

impl MergeDirection {
    pub fn of(candidate: &MergeCandidate) -> Self {
        let (source, target) = if candidate.entity2.count >= candidate.entity1.count {
            (&candidate.entity1, &candidate.entity2)
        } else {
            (&candidate.entity2, &candidate.entity1)
        };
        Self {
            source_entity_id: source.id,
            source_text: source.text.clone(),
            target_entity_id: target.id,
            target_text: target.text.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeLogEntry {
    pub source_entity_id: EntityId,
    pub source_text: String,
    pub target_canonical_id: CanonicalId,
    pub target_text: String,
    pub method: MergeMethod,
    pub confidence: f64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OracleDecision {
    pub entity1: String,
    pub entity2: String,
    pub algorithmic_confidence: f64,
    pub algorithmic_reason: String,
    pub should_merge: bool,
    pub reasoning: String,
    pub oracle_confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeReport {
    pub total_candidates: usize,
    pub merged: usize,
    pub rejected: usize,
    pub skipped: usize,
    pub deferred: usize,
    pub errors: usize,
    pub dry_run: bool,
    pub interrupted: bool,
    pub merges: Vec<MergeLogEntry>,
    pub decisions: Vec<OracleDecision>,
    pub manual_review: Vec<MergeCandidate>,
}

impl MergeReport {
    fn new(total_candidates: usize, dry_run: bool) -> Self {
        Self {
            total_candidates,
            merged: 0,
            rejected: 0,
            skipped: 0,
            deferred: 0,
            errors: 0,
            dry_run,
            interrupted: false,
            merges: Vec::new(),
            decisions: Vec::new(),
            manual_review: Vec::new(),
        }
    }
}

/// A fatal failure stopped the batch. Merges already applied stay applied.
#[derive(Debug, Error)]
#[error("review batch aborted after {} merges: {}", .report.merged, .error)]
pub struct BatchAborted {
    #[source]
    pub error: ResolveError,
    pub report: MergeReport,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedReview {
    pub tier: ReviewTier,
    pub oracle_request: Option<OracleRequest>,
}

/// Routed candidates with their oracle requests prepared.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReviewPlan {
    pub items: Vec<PlannedReview>,
}

impl ReviewPlan {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouterOptions {
    pub thresholds: ReviewThresholds,
    pub tiers: TierSelection,
    pub dry_run: bool,
    pub parallelism: usize,
    pub auto_actor: String,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            thresholds: ReviewThresholds::default(),
            tiers: TierSelection::All,
            dry_run: false,
            parallelism: 4,
            auto_actor: AUTO_MERGE_ACTOR.to_string(),
        }
    }
}

pub struct ReviewRouter<'a> {
    options: RouterOptions,
    oracle: Option<&'a dyn MergeOracle>,
    interrupt: Option<&'a AtomicBool>,
}

impl<'a> ReviewRouter<'a> {
    pub fn new(options: RouterOptions) -> Self {
        Self {
            options,
            oracle: None,
            interrupt: None,
        }
    }

    pub fn with_oracle(mut self, oracle: &'a dyn MergeOracle) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn with_interrupt(mut self, flag: &'a AtomicBool) -> Self {
        self.interrupt = Some(flag);
        self
    }

    /// Routes candidates and builds oracle requests for the middle band.
    /// Reads contexts only, so it can run before the graph is borrowed
    /// mutably.
    pub fn plan(
        &self,
        entity_type: EntityType,
        candidates: Vec<MergeCandidate>,
        contexts: &dyn ContextSource,
    ) -> Result<ReviewPlan, ResolveError> {
        let wants_oracle = self.options.tiers.runs_oracle() && self.oracle.is_some();
        let mut items = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let tier = ReviewTier::route(candidate, &self.options.thresholds);
            let oracle_request = match &tier {
                ReviewTier::OracleReview(c) if wants_oracle => {
                    Some(build_oracle_request(entity_type, c, contexts)?)
                }
                _ => None,
            };
            items.push(PlannedReview {
                tier,
                oracle_request,
            });
        }
        Ok(ReviewPlan { items })
    }

    pub fn execute(
        &self,
        graph: &mut dyn CanonicalGraph,
        plan: ReviewPlan,
    ) -> Result<MergeReport, BatchAborted> {
        let mut report = MergeReport::new(plan.len(), self.options.dry_run);
        match self.execute_into(graph, plan, &mut report) {
            Ok(()) => {
                info!(
                    total = report.total_candidates,
                    merged = report.merged,
                    rejected = report.rejected,
                    skipped = report.skipped,
                    deferred = report.deferred,
                    errors = report.errors,
                    dry_run = report.dry_run,
                    interrupted = report.interrupted,
                    "review batch finished"
                );
                Ok(report)
            }
            Err(error) => {
                error!(error = %error, merged = report.merged, "review batch aborted");
                Err(BatchAborted { error, report })
            }
        }
    }

    fn execute_into(
        &self,
        graph: &mut dyn CanonicalGraph,
        plan: ReviewPlan,
        report: &mut MergeReport,
    ) -> Result<(), ResolveError> {
        let window = self.options.parallelism.max(1);
        let mut pending: Vec<(MergeCandidate, OracleRequest)> = Vec::new();

        for item in plan.items {
            if self.interrupted() {
                stop_early(&mut pending, report);
                break;
            }
            match item.tier {
                ReviewTier::AutoMerge(candidate) => {
                    self.flush_oracle(graph, &mut pending, report)?;
                    if !self.options.tiers.runs_auto() {
                        report.deferred += 1;
                        continue;
                    }
                    let approval = Approval {
                        method: MergeMethod::Auto,
                        confidence: candidate.confidence,
                        actor: &self.options.auto_actor,
                        reason: candidate.reason.clone(),
                    };
                    self.apply(graph, &candidate, approval, report)?;
                }
                ReviewTier::OracleReview(candidate) => match item.oracle_request {
                    Some(request) => {
                        pending.push((candidate, request));
                        if pending.len() >= window {
                            self.flush_oracle(graph, &mut pending, report)?;
                        }
                    }
                    None => report.deferred += 1,
                },
                ReviewTier::ManualReview(candidate) => report.manual_review.push(candidate),
                ReviewTier::BelowThreshold(_) => report.skipped += 1,
            }
        }

        if !report.interrupted {
            self.flush_oracle(graph, &mut pending, report)?;
        }

        if !self.options.dry_run && report.merged > 0 {
            graph.verify_invariants()?;
        }
        Ok(())
    }

    fn flush_oracle(
        &self,
        graph: &mut dyn CanonicalGraph,
        pending: &mut Vec<(MergeCandidate, OracleRequest)>,
        report: &mut MergeReport,
    ) -> Result<(), ResolveError> {
        if pending.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(pending);
        let Some(oracle) = self.oracle else {
            report.deferred += batch.len();
            return Ok(());
        };

        let requests = batch.iter().map(|(_, r)| r.clone()).collect::<Vec<_>>();
        let verdicts = consult_all(oracle, &requests, self.options.parallelism);
        let actor = oracle.actor();

        for ((candidate, request), verdict) in batch.into_iter().zip(verdicts) {
            report.decisions.push(decision_record(&request, &verdict));
            if !verdict.should_merge {
                warn!(
                    entity1 = %candidate.entity1.text,
                    entity2 = %candidate.entity2.text,
                    reasoning = %verdict.reasoning,
                    "oracle rejected merge"
                );
                report.rejected += 1;
                continue;
            }
            let approval = Approval {
                method: MergeMethod::Llm,
                confidence: verdict.confidence,
                actor: &actor,
                reason: verdict.reasoning,
            };
            self.apply(graph, &candidate, approval, report)?;
        }
        Ok(())
    }

    fn apply(
        &self,
        graph: &mut dyn CanonicalGraph,
        candidate: &MergeCandidate,
        approval: Approval<'_>,
        report: &mut MergeReport,
    ) -> Result<(), ResolveError> {
        let direction = MergeDirection::of(candidate);
        // The target cluster may have moved earlier in this batch.
        let outcome = match graph.canonical_id_for(direction.target_entity_id) {
            Ok(target) => merge(
                graph,
                direction.source_entity_id,
                target,
                approval.method,
                approval.confidence,
                approval.actor,
            )
            .map(|outcome| (target, outcome)),
            Err(err) => Err(err),
        };

        match outcome {
            Ok((target_canonical_id, MergeOutcome::Merged { .. })) => {
                report.merged += 1;
                report.merges.push(MergeLogEntry {
                    source_entity_id: direction.source_entity_id,
                    source_text: direction.source_text,
                    target_canonical_id,
                    target_text: direction.target_text,
                    method: approval.method,
                    confidence: approval.confidence,
                    reason: approval.reason,
                });
                Ok(())
            }
            Ok((_, MergeOutcome::AlreadyMerged { .. })) => {
                report.skipped += 1;
                Ok(())
            }
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                error!(
                    source = %direction.source_text,
                    target = %direction.target_text,
                    error = %err,
                    "candidate failed; continuing"
                );
                report.errors += 1;
                Ok(())
            }
        }
    }

    fn interrupted(&self) -> bool {
        self.interrupt.is_some_and(|flag| flag.load(Ordering::SeqCst))
    }
}

/// Oracle candidates still waiting for a verdict are reported as deferred.
fn stop_early(pending: &mut Vec<(MergeCandidate, OracleRequest)>, report: &mut MergeReport) {
    report.interrupted = true;
    report.deferred += pending.len();
    pending.clear();
}

struct Approval<'s> {
    method: MergeMethod,
    confidence: f64,
    actor: &'s str,
    reason: String,
}

fn build_oracle_request(
    entity_type: EntityType,
    candidate: &MergeCandidate,
    contexts: &dyn ContextSource,
) -> Result<OracleRequest, ResolveError> {
    Ok(OracleRequest {
        entity_type,
        entity1_text: candidate.entity1.text.clone(),
        entity1_count: candidate.entity1.count,
        entity2_text: candidate.entity2.text.clone(),
        entity2_count: candidate.entity2.count,
        context1: contexts.context_for(candidate.entity1.id)?,
        context2: contexts.context_for(candidate.entity2.id)?,
        algorithmic_confidence: candidate.confidence,
        algorithmic_reason: candidate.reason.clone(),
    })
}

fn decision_record(request: &OracleRequest, verdict: &OracleVerdict) -> OracleDecision {
    OracleDecision {
        entity1: request.entity1_text.clone(),
        entity2: request.entity2_text.clone(),
        algorithmic_confidence: request.algorithmic_confidence,
        algorithmic_reason: request.algorithmic_reason.clone(),
        should_merge: verdict.should_merge,
        reasoning: verdict.reasoning.clone(),
        oracle_confidence: verdict.confidence,
    }
}

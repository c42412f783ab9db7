//! External judgment for medium-confidence merges.
//!
//! Oracles are untrusted. Every failure path ends in a rejecting verdict so a
//! flaky or misbehaving oracle can only ever block merges, never cause them.

pub mod ollama;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::entity::{EntityId, EntityType};
use crate::error::ResolveError;

pub use ollama::OllamaOracle;

/// Longest context snippet handed to an oracle, in characters.
pub const CONTEXT_CHARS: usize = 500;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OracleRequest {
    pub entity_type: EntityType,
    pub entity1_text: String,
    pub entity1_count: i64,
    pub entity2_text: String,
    pub entity2_count: i64,
    pub context1: Option<String>,
    pub context2: Option<String>,
    pub algorithmic_confidence: f64,
    pub algorithmic_reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleVerdict {
    pub should_merge: bool,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub confidence: f64,
}

impl OracleVerdict {
    pub fn rejected(cause: impl std::fmt::Display) -> Self {
        Self {
            should_merge: false,
            reasoning: format!("error: {cause}"),
            confidence: 0.0,
        }
    }
}

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle transport failed: {0}")]
    Transport(String),
    #[error("oracle returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed oracle response: {0}")]
    Malformed(String),
    #[error("invalid oracle verdict: {0}")]
    InvalidVerdict(String),
}

pub trait MergeOracle: Sync {
    fn judge(&self, request: &OracleRequest) -> Result<OracleVerdict, OracleError>;

    /// Recorded as `merged_by` on approved merges.
    fn actor(&self) -> String;
}

/// Mention context lookup used to enrich oracle requests.
pub trait ContextSource {
    fn context_for(&self, entity_id: EntityId) -> Result<Option<String>, ResolveError>;
}

pub fn parse_verdict(raw: &str) -> Result<OracleVerdict, OracleError> {
    let verdict: OracleVerdict = serde_json::from_str(raw.trim()).map_err(|err| {
        OracleError::Malformed(format!("{err}; raw: {}", truncate_chars(raw, 200)))
    })?;
    if !(0.0..=1.0).contains(&verdict.confidence) {
        return Err(OracleError::InvalidVerdict(format!(
            "confidence {} outside [0.0, 1.0]",
            verdict.confidence
        )));
    }
    Ok(verdict)
}

/// Asks the oracle once and never fails.
pub fn consult(oracle: &dyn MergeOracle, request: &OracleRequest) -> OracleVerdict {
    match oracle.judge(request) {
        Ok(verdict) => verdict,
        Err(err) => {
            warn!(
                entity1 = %request.entity1_text,
                entity2 = %request.entity2_text,
                error = %err,
                "oracle consultation failed; treating as rejection"
            );
            OracleVerdict::rejected(err)
        }
    }
}

/// Consults for every request using at most `parallelism` worker threads.
/// Verdicts come back in request order.
pub fn consult_all(
    oracle: &dyn MergeOracle,
    requests: &[OracleRequest],
    parallelism: usize,
) -> Vec<OracleVerdict> {
    if requests.is_empty() {
        return Vec::new();
    }
    let workers = parallelism.clamp(1, requests.len());
    if workers == 1 {
        return requests.iter().map(|r| consult(oracle, r)).collect();
    }

    let chunk_size = requests.len().div_ceil(workers);
    std::thread::scope(|scope| {
        let handles = requests
            .chunks(chunk_size)
            .map(|batch| {
                let handle = scope.spawn(move || {
                    batch.iter().map(|r| consult(oracle, r)).collect::<Vec<_>>()
                });
                (batch.len(), handle)
            })
            .collect::<Vec<_>>();

        handles
            .into_iter()
            .flat_map(|(len, handle)| {
                handle.join().unwrap_or_else(|_| {
                    warn!(requests = len, "oracle worker panicked; rejecting its batch");
                    vec![OracleVerdict::rejected("oracle worker panicked"); len]
                })
            })
            .collect()
    })
}

pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

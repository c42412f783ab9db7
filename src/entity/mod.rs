pub mod similarity;

use serde::{Deserialize, Serialize};

use crate::error::{ResolveError, validate_confidence};

pub type EntityId = i64;
pub type CanonicalId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Person,
    Organization,
    Location,
    Date,
}

impl EntityType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::Organization => "organization",
            Self::Location => "location",
            Self::Date => "date",
        }
    }

    /// Accepts the store's singular names and the extractor's plural buckets.
    pub fn parse(raw: &str) -> Result<Self, ResolveError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "person" | "people" => Ok(Self::Person),
            "organization" | "organizations" => Ok(Self::Organization),
            "location" | "locations" => Ok(Self::Location),
            "date" | "dates" => Ok(Self::Date),
            _ => Err(ResolveError::invalid(format!("unknown entity type `{raw}`"))),
        }
    }

    fn strips_punctuation(self) -> bool {
        matches!(self, Self::Person | Self::Organization)
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityType {
    type Err = ResolveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionMethod {
    #[default]
    Regex,
    Llm,
}

impl ExtractionMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Regex => "regex",
            Self::Llm => "llm",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entity {
    pub entity_id: EntityId,
    pub text: String,
    pub entity_type: EntityType,
    pub normalized_text: String,
    pub first_seen_doc_id: String,
    pub occurrence_count: i64,
}

/// Collapses whitespace and case-folds; names also lose `.` and `,`.
pub fn normalize_entity_text(text: &str, entity_type: EntityType) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let lowered = collapsed.to_lowercase();
    if entity_type.strips_punctuation() {
        lowered.replace(['.', ','], "")
    } else {
        lowered
    }
}

/// One extractor mention of a surface string in a document.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawObservation {
    pub doc_id: String,
    pub text: String,
    #[serde(alias = "entity_type")]
    pub r#type: String,
    #[serde(default = "default_increment", alias = "occurrence_increment")]
    pub count: i64,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub method: ExtractionMethod,
    #[serde(default)]
    pub start: Option<i64>,
    #[serde(default)]
    pub end: Option<i64>,
}

fn default_increment() -> i64 {
    1
}

fn default_confidence() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub doc_id: String,
    pub text: String,
    pub entity_type: EntityType,
    pub normalized_text: String,
    pub increment: i64,
    pub context: Option<String>,
    pub confidence: f64,
    pub method: ExtractionMethod,
    pub position: Option<(i64, i64)>,
}

impl Observation {
    pub fn new(doc_id: &str, text: &str, entity_type: EntityType) -> Self {
        Self {
            doc_id: doc_id.to_string(),
            text: text.to_string(),
            entity_type,
            normalized_text: normalize_entity_text(text, entity_type),
            increment: 1,
            context: None,
            confidence: 1.0,
            method: ExtractionMethod::Regex,
            position: None,
        }
    }

    pub fn with_increment(mut self, increment: i64) -> Self {
        self.increment = increment;
        self
    }

    pub fn with_context(mut self, context: &str) -> Self {
        self.context = Some(context.to_string());
        self
    }
}

impl TryFrom<RawObservation> for Observation {
    type Error = ResolveError;

    fn try_from(raw: RawObservation) -> Result<Self, Self::Error> {
        let entity_type = EntityType::parse(&raw.r#type)?;
        if raw.doc_id.trim().is_empty() {
            return Err(ResolveError::invalid("doc_id must not be empty"));
        }
        let normalized_text = normalize_entity_text(&raw.text, entity_type);
        if normalized_text.is_empty() {
            return Err(ResolveError::invalid("entity text must not be empty"));
        }
        if raw.count < 1 {
            return Err(ResolveError::invalid(format!(
                "occurrence increment must be >= 1, got {}",
                raw.count
            )));
        }
        validate_confidence("extraction confidence", raw.confidence)?;
        let position = match (raw.start, raw.end) {
            (Some(start), Some(end)) if start <= end => Some((start, end)),
            (Some(_), Some(_)) => {
                return Err(ResolveError::invalid("mention start must be <= end"));
            }
            _ => None,
        };

        Ok(Self {
            doc_id: raw.doc_id,
            text: raw.text.split_whitespace().collect::<Vec<_>>().join(" "),
            entity_type,
            normalized_text,
            increment: raw.count,
            context: raw.context,
            confidence: raw.confidence,
            method: raw.method,
            position,
        })
    }
}

pub fn parse_observation_jsonl(input: &str) -> Result<Vec<Observation>, ResolveError> {
    let mut out = Vec::new();
    for (idx, line) in input.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let raw: RawObservation = serde_json::from_str(line)
            .map_err(|err| ResolveError::invalid(format!("line {}: {err}", idx + 1)))?;
        let observation = Observation::try_from(raw).map_err(|err| match err {
            ResolveError::InputValidation(message) => {
                ResolveError::invalid(format!("line {}: {message}", idx + 1))
            }
            other => other,
        })?;
        out.push(observation);
    }
    Ok(out)
}

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{
    CONTEXT_CHARS, MergeOracle, OracleError, OracleRequest, OracleVerdict, parse_verdict,
    truncate_chars,
};
use crate::config::OracleConfig;
use crate::entity::EntityType;

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
    format: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

/// Judges merges with a local Ollama model through `/api/generate`.
pub struct OllamaOracle {
    client: reqwest::blocking::Client,
    endpoint: String,
    model: String,
}

impl OllamaOracle {
    pub fn new(config: &OracleConfig) -> Result<Self, OracleError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|err| OracleError::Transport(err.to_string()))?;
        Ok(Self {
            client,
            endpoint: format!("{}/api/generate", config.host.trim_end_matches('/')),
            model: config.model.clone(),
        })
    }
}

impl MergeOracle for OllamaOracle {
    fn judge(&self, request: &OracleRequest) -> Result<OracleVerdict, OracleError> {
        let body = GenerateRequest {
            model: &self.model,
            prompt: build_prompt(request),
            stream: false,
            format: "json",
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .map_err(|err| OracleError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(OracleError::Status {
                status: status.as_u16(),
                body: truncate_chars(&body, 200).to_string(),
            });
        }

        let generated: GenerateResponse = response
            .json()
            .map_err(|err| OracleError::Malformed(err.to_string()))?;
        parse_verdict(&generated.response)
    }

    fn actor(&self) -> String {
        format!("llm:{}", self.model)
    }
}

pub fn build_prompt(request: &OracleRequest) -> String {
    let subject = match request.entity_type {
        EntityType::Person => "person",
        EntityType::Organization => "organization",
        EntityType::Location => "place",
        EntityType::Date => "date",
    };

    let mut prompt = format!(
        "You are reviewing whether two entity names refer to the same {subject}.\n\n\
         Entity 1: \"{}\" (appears {} times)\n\
         Entity 2: \"{}\" (appears {} times)\n\n\
         Algorithm similarity: {:.2}\n\
         Algorithm reasoning: {}\n",
        request.entity1_text,
        request.entity1_count,
        request.entity2_text,
        request.entity2_count,
        request.algorithmic_confidence,
        request.algorithmic_reason,
    );

    if let Some(context) = request.context1.as_deref().filter(|c| !c.is_empty()) {
        prompt.push_str("\nContext where Entity 1 appears:\n");
        prompt.push_str(truncate_chars(context, CONTEXT_CHARS));
        prompt.push('\n');
    }
    if let Some(context) = request.context2.as_deref().filter(|c| !c.is_empty()) {
        prompt.push_str("\nContext where Entity 2 appears:\n");
        prompt.push_str(truncate_chars(context, CONTEXT_CHARS));
        prompt.push('\n');
    }

    prompt.push_str(GUIDANCE);
    prompt
}

const GUIDANCE: &str = r#"
Question: Do these two entity names refer to the same real-world entity?

Consider:
- Typos and OCR errors:
  * "Jeffrey" vs "Jefffrey" (repeated letters)
  * "Stearns" vs "Steams" or "Sterns" ("rn" often reads as "m")
  * "Clinton" vs "Clint" (truncation)
- Middle names or initials (e.g. "Alan Dershowitz" vs "Alan M. Dershowitz")
- Name variations (e.g. "Kathy" vs "Kathryn", "Yasser" vs "Yasir")
- Well-known organizations: variants of a famous name are likely OCR errors

But be careful of:
  * Different people with similar names
  * Different organizations (e.g. "Senate Majority" vs "Senate Minority")
  * Different places (e.g. "South Africa" vs "South America")

Respond with JSON:
{
  "should_merge": true/false,
  "reasoning": "explanation of your decision",
  "confidence": 0.95
}
"#;

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::candidates::{
    LIMIT_DEFAULT, MAX_EDIT_DISTANCE_DEFAULT, MIN_CONFIDENCE_DEFAULT, MIN_OCCURRENCES_DEFAULT,
};

pub const PROJECT_CONFIG_FILE: &str = ".unsealed.project.yml";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateConfig {
    pub min_occurrences: i64,
    pub max_edit_distance: usize,
    pub min_confidence: f64,
    pub limit: usize,
}

impl Default for CandidateConfig {
    fn default() -> Self {
        Self {
            min_occurrences: MIN_OCCURRENCES_DEFAULT,
            max_edit_distance: MAX_EDIT_DISTANCE_DEFAULT,
            min_confidence: MIN_CONFIDENCE_DEFAULT,
            limit: LIMIT_DEFAULT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OracleConfig {
    pub host: String,
    pub model: String,
    pub timeout_secs: u64,
    pub parallelism: usize,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost:11434".to_string(),
            model: "qwen2.5:7b".to_string(),
            timeout_secs: 120,
            parallelism: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct EffectiveConfig {
    pub sources: Vec<String>,
    pub exclude: Vec<String>,
    pub candidates: CandidateConfig,
    pub oracle: OracleConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    sources: Option<Vec<String>>,
    #[serde(default)]
    exclude: Option<Vec<String>>,
    #[serde(default)]
    candidates: Option<RawCandidates>,
    #[serde(default)]
    oracle: Option<RawOracle>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCandidates {
    min_occurrences: Option<i64>,
    max_edit_distance: Option<usize>,
    min_confidence: Option<f64>,
    limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawOracle {
    host: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    parallelism: Option<usize>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid value for `{key}`: {value}")]
    InvalidValue { key: String, value: String },
}

pub fn load_effective_config(
    cwd: &Path,
    repo_config: Option<&Path>,
    user_config: Option<&Path>,
) -> Result<EffectiveConfig, ConfigError> {
    let mut merged = EffectiveConfig::default();

    if let Some(path) = user_config.filter(|path| path.exists()) {
        merge_layer(&mut merged, load_config_layer(path)?);
    }

    if let Some(path) = find_nearest_project_config(cwd) {
        merge_layer(&mut merged, load_config_layer(&path)?);
    }

    if let Some(path) = repo_config.filter(|path| path.exists()) {
        merge_layer(&mut merged, load_config_layer(path)?);
    }

    validate(&merged)?;
    Ok(merged)
}

pub fn find_nearest_project_config(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(PROJECT_CONFIG_FILE))
        .find(|candidate| candidate.is_file())
}

/// Applies `OLLAMA_HOST`, `OLLAMA_MODEL` and `OLLAMA_TIMEOUT` on top of the
/// file layers.
pub fn apply_env_overrides(
    config: &mut EffectiveConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(host) = lookup("OLLAMA_HOST").filter(|v| !v.trim().is_empty()) {
        config.oracle.host = host;
    }
    if let Some(model) = lookup("OLLAMA_MODEL").filter(|v| !v.trim().is_empty()) {
        config.oracle.model = model;
    }
    if let Some(raw) = lookup("OLLAMA_TIMEOUT").filter(|v| !v.trim().is_empty()) {
        config.oracle.timeout_secs =
            raw.trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue {
                    key: "OLLAMA_TIMEOUT".to_string(),
                    value: raw.clone(),
                })?;
    }
    Ok(())
}

fn merge_layer(merged: &mut EffectiveConfig, layer: RawConfig) {
    if let Some(sources) = layer.sources {
        merge_sources_dedup(&mut merged.sources, sources);
    }
    if let Some(exclude) = layer.exclude {
        merged.exclude = exclude;
    }
    if let Some(candidates) = layer.candidates {
        let target = &mut merged.candidates;
        target.min_occurrences = candidates.min_occurrences.unwrap_or(target.min_occurrences);
        target.max_edit_distance = candidates
            .max_edit_distance
            .unwrap_or(target.max_edit_distance);
        target.min_confidence = candidates.min_confidence.unwrap_or(target.min_confidence);
        target.limit = candidates.limit.unwrap_or(target.limit);
    }
    if let Some(oracle) = layer.oracle {
        let target = &mut merged.oracle;
        if let Some(host) = oracle.host {
            target.host = host;
        }
        if let Some(model) = oracle.model {
            target.model = model;
        }
        target.timeout_secs = oracle.timeout_secs.unwrap_or(target.timeout_secs);
        target.parallelism = oracle.parallelism.unwrap_or(target.parallelism);
    }
}

fn merge_sources_dedup(existing: &mut Vec<String>, incoming: Vec<String>) {
    let mut seen = existing.iter().cloned().collect::<HashSet<_>>();
    for source in incoming {
        if seen.insert(source.clone()) {
            existing.push(source);
        }
    }
}

fn validate(config: &EffectiveConfig) -> Result<(), ConfigError> {
    let invalid = |key: &str, value: String| ConfigError::InvalidValue {
        key: key.to_string(),
        value,
    };
    let candidates = &config.candidates;
    if !(0.0..=1.0).contains(&candidates.min_confidence) {
        return Err(invalid(
            "candidates.min_confidence",
            candidates.min_confidence.to_string(),
        ));
    }
    if candidates.min_occurrences < 1 {
        return Err(invalid(
            "candidates.min_occurrences",
            candidates.min_occurrences.to_string(),
        ));
    }
    if config.oracle.parallelism == 0 {
        return Err(invalid("oracle.parallelism", "0".to_string()));
    }
    Ok(())
}

fn load_config_layer(path: &Path) -> Result<RawConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config_layer(&content)
}

fn parse_config_layer(content: &str) -> Result<RawConfig, ConfigError> {
    if content.trim().is_empty() {
        return Ok(RawConfig::default());
    }
    Ok(serde_yaml::from_str(content)?)
}

pub fn load_config_file(path: &Path) -> Result<EffectiveConfig, ConfigError> {
    let mut config = EffectiveConfig::default();
    merge_layer(&mut config, load_config_layer(path)?);
    validate(&config)?;
    Ok(config)
}

pub fn default_repo_config_yaml() -> String {
    r#"sources:
  - ./extractions/**/*.jsonl
exclude: []
candidates:
  min_occurrences: 5
  max_edit_distance: 3
  min_confidence: 0.70
  limit: 100
oracle:
  host: http://localhost:11434
  model: qwen2.5:7b
  timeout_secs: 120
  parallelism: 4
"#
    .to_string()
}

pub fn default_global_config_yaml() -> String {
    r#"sources: []
exclude: []
oracle:
  host: http://localhost:11434
  model: qwen2.5:7b
"#
    .to_string()
}

pub fn expand_tilde(path: &str, home: &Path) -> PathBuf {
    if path == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = path.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sources_thresholds_and_oracle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.yml");
        std::fs::write(
            &path,
            r#"sources:
  - ~/extractions/**/*.jsonl
  - ./batch.jsonl
exclude:
  - "**/scratch-*"
candidates:
  min_occurrences: 2
  min_confidence: 0.8
oracle:
  model: llama3:8b
  parallelism: 2
"#,
        )
        .expect("write config");

        let parsed = load_config_file(&path).expect("parse config");
        assert_eq!(parsed.sources.len(), 2);
        assert_eq!(parsed.exclude, vec!["**/scratch-*".to_string()]);
        assert_eq!(parsed.candidates.min_occurrences, 2);
        assert_eq!(parsed.candidates.min_confidence, 0.8);
        assert_eq!(parsed.candidates.max_edit_distance, 3);
        assert_eq!(parsed.candidates.limit, 100);
        assert_eq!(parsed.oracle.model, "llama3:8b");
        assert_eq!(parsed.oracle.host, "http://localhost:11434");
        assert_eq!(parsed.oracle.parallelism, 2);
    }

    #[test]
    fn default_yaml_round_trips_to_defaults() {
        let layer = parse_config_layer(&default_repo_config_yaml()).expect("parse default");
        let mut config = EffectiveConfig::default();
        merge_layer(&mut config, layer);
        assert_eq!(config.candidates, CandidateConfig::default());
        assert_eq!(config.oracle, OracleConfig::default());
        parse_config_layer(&default_global_config_yaml()).expect("parse global default");
    }

    #[test]
    fn rejects_unknown_keys_and_bad_thresholds() {
        assert!(matches!(
            parse_config_layer("candidates:\n  min_confidnce: 0.5\n"),
            Err(ConfigError::Yaml(_))
        ));

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.yml");
        std::fs::write(&path, "candidates:\n  min_confidence: 1.5\n").expect("write");
        assert!(matches!(
            load_config_file(&path),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn env_overrides_win_over_files() {
        let mut config = EffectiveConfig::default();
        apply_env_overrides(&mut config, |key| match key {
            "OLLAMA_HOST" => Some("http://gpu-box:11434".to_string()),
            "OLLAMA_TIMEOUT" => Some("30".to_string()),
            _ => None,
        })
        .expect("overrides");
        assert_eq!(config.oracle.host, "http://gpu-box:11434");
        assert_eq!(config.oracle.model, "qwen2.5:7b");
        assert_eq!(config.oracle.timeout_secs, 30);

        let err = apply_env_overrides(&mut config, |key| {
            (key == "OLLAMA_TIMEOUT").then(|| "soon".to_string())
        })
        .expect_err("bad timeout");
        assert!(err.to_string().contains("OLLAMA_TIMEOUT"));
    }

    #[test]
    fn expands_tilde_paths() {
        let expanded = expand_tilde("~/extractions", Path::new("/home/tester"));
        assert_eq!(expanded, Path::new("/home/tester/extractions"));
    }

    #[test]
    fn merges_user_project_and_repo_layers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        let repo = root.join("workspace/repo");
        std::fs::create_dir_all(repo.join(".unsealed")).expect("repo config dir");
        std::fs::create_dir_all(root.join("home/.unsealed")).expect("home config dir");

        let user_cfg = root.join("home/.unsealed/config.yml");
        std::fs::write(
            &user_cfg,
            r#"sources:
  - /shared/global.jsonl
  - /shared/dup.jsonl
exclude:
  - "user-*"
oracle:
  model: user-model
"#,
        )
        .expect("write user config");

        std::fs::write(
            root.join(PROJECT_CONFIG_FILE),
            "sources:\n  - /shared/far-project.jsonl\n",
        )
        .expect("write far project config");
        std::fs::write(
            root.join("workspace").join(PROJECT_CONFIG_FILE),
            r#"sources:
  - /shared/project.jsonl
  - /shared/dup.jsonl
candidates:
  min_occurrences: 3
"#,
        )
        .expect("write project config");

        let repo_cfg = repo.join(".unsealed/config.yml");
        std::fs::write(
            &repo_cfg,
            r#"sources:
  - /shared/repo.jsonl
exclude:
  - "repo-*"
candidates:
  limit: 10
"#,
        )
        .expect("write repo config");

        let merged =
            load_effective_config(&repo, Some(&repo_cfg), Some(&user_cfg)).expect("merge config");
        assert_eq!(
            merged.sources,
            vec![
                "/shared/global.jsonl",
                "/shared/dup.jsonl",
                "/shared/project.jsonl",
                "/shared/repo.jsonl",
            ]
        );
        assert_eq!(merged.exclude, vec!["repo-*".to_string()]);
        assert_eq!(merged.candidates.min_occurrences, 3);
        assert_eq!(merged.candidates.limit, 10);
        assert_eq!(merged.oracle.model, "user-model");
    }
}

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::{Args, Parser, Subcommand};
use glob::glob;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use unsealed::ResolveError;
use unsealed::candidates::{CandidateQuery, find_merge_candidates};
use unsealed::canonical::{CanonicalGraph, MergeMethod};
use unsealed::config::{
    ConfigError, EffectiveConfig, apply_env_overrides, default_global_config_yaml,
    default_repo_config_yaml, expand_tilde, load_effective_config,
};
use unsealed::entity::{CanonicalId, EntityId, EntityType, parse_observation_jsonl};
use unsealed::merge::merge;
use unsealed::oracle::OllamaOracle;
use unsealed::review::{ReviewRouter, ReviewThresholds, ReviewTier, RouterOptions, TierSelection};
use unsealed::store::{IngestCursor, SqliteStore};
use unsealed::store::atomic::write_json_atomic;
use walkdir::WalkDir;

const DB_FILE: &str = "entities.sqlite";

#[derive(Debug)]
struct CliError {
    code: &'static str,
    message: String,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn io(code: &'static str, err: io::Error) -> Self {
        Self::new(code, err.to_string())
    }
}

impl From<ResolveError> for CliError {
    fn from(value: ResolveError) -> Self {
        Self::new(value.code(), value.to_string())
    }
}

impl From<ConfigError> for CliError {
    fn from(value: ConfigError) -> Self {
        Self::new("config_error", value.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(value: serde_json::Error) -> Self {
        Self::new("json_error", value.to_string())
    }
}

#[derive(Parser, Debug)]
#[command(name = "unsealed")]
#[command(about = "Entity canonicalization and fuzzy merging for OCR'd document corpora")]
struct Cli {
    #[arg(long, global = true)]
    global: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the store and a default config.
    Init,
    /// Record observation JSONL from configured sources or stdin.
    Ingest(IngestArgs),
    /// Give every entity without a canonical mapping its own cluster.
    Seed,
    /// Report merge candidates grouped by review tier.
    Candidates(CandidateArgs),
    /// Find candidates and run the review tiers against the graph.
    Merge(MergeArgs),
    /// Manually merge one entity into a canonical cluster.
    MergeEntity(MergeEntityArgs),
    /// Show an entity and its canonical entity.
    Lookup { entity_id: EntityId },
    /// List the member aliases of a canonical entity.
    Members { canonical_id: CanonicalId },
    /// Prefix search over canonical entities.
    Search(SearchArgs),
    Stats,
    /// Check total mapping, mention conservation and orphan absence.
    Verify,
}

#[derive(Args, Debug)]
struct IngestArgs {
    #[arg(long)]
    stdin: bool,
}

#[derive(Args, Debug, Clone)]
struct FinderArgs {
    #[arg(long = "type", default_value = "person", value_parser = parse_entity_type)]
    entity_type: EntityType,
    #[arg(long)]
    min_occurrences: Option<i64>,
    #[arg(long)]
    max_distance: Option<usize>,
    #[arg(long)]
    min_confidence: Option<f64>,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Args, Debug)]
struct CandidateArgs {
    #[command(flatten)]
    finder: FinderArgs,
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct MergeArgs {
    #[command(flatten)]
    finder: FinderArgs,
    #[arg(long, default_value = "auto", value_parser = parse_tier)]
    tier: TierSelection,
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct MergeEntityArgs {
    entity_id: EntityId,
    canonical_id: CanonicalId,
    #[arg(long, default_value_t = 1.0)]
    confidence: f64,
    #[arg(long = "by", default_value = "manual")]
    actor: String,
}

#[derive(Args, Debug)]
struct SearchArgs {
    query: String,
    #[arg(long = "type", value_parser = parse_entity_type)]
    entity_type: Option<EntityType>,
    #[arg(long, default_value_t = 20)]
    limit: usize,
}

#[derive(Debug, Clone)]
struct RepoPaths {
    root: PathBuf,
    db: PathBuf,
    repo_config: PathBuf,
    user_config: PathBuf,
    mode: StorageMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StorageMode {
    RepoLocal,
    Global,
}

fn main() -> ExitCode {
    init_tracing();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let payload = json!({
                "error": {
                    "code": err.code,
                    "message": err.message,
                }
            });
            eprintln!("{payload}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let cwd = std::env::current_dir().map_err(|err| CliError::io("cwd_error", err))?;
    let paths = repo_paths(&cwd, cli.global)?;
    match cli.command {
        Command::Init => cmd_init(&paths),
        Command::Ingest(args) => cmd_ingest(&cwd, &paths, args),
        Command::Seed => cmd_seed(&paths),
        Command::Candidates(args) => cmd_candidates(&cwd, &paths, args),
        Command::Merge(args) => cmd_merge(&cwd, &paths, args),
        Command::MergeEntity(args) => cmd_merge_entity(&paths, args),
        Command::Lookup { entity_id } => cmd_lookup(&paths, entity_id),
        Command::Members { canonical_id } => cmd_members(&paths, canonical_id),
        Command::Search(args) => cmd_search(&paths, args),
        Command::Stats => cmd_stats(&paths),
        Command::Verify => cmd_verify(&paths),
    }
}

fn cmd_init(paths: &RepoPaths) -> Result<(), CliError> {
    fs::create_dir_all(&paths.root).map_err(|err| CliError::io("mkdir_error", err))?;
    let _ = SqliteStore::open(&path_string(&paths.db))?;
    write_default_config(paths)?;

    print_json(&json!({
        "status": "ok",
        "unsealed_dir": paths.root,
        "db": paths.db,
        "mode": match paths.mode {
            StorageMode::RepoLocal => "repo",
            StorageMode::Global => "global",
        },
    }))
}

fn cmd_ingest(cwd: &Path, paths: &RepoPaths, args: IngestArgs) -> Result<(), CliError> {
    let store = open_store(paths)?;
    if args.stdin {
        let mut input = String::new();
        io::stdin()
            .read_to_string(&mut input)
            .map_err(|err| CliError::io("stdin_error", err))?;
        let observations = parse_observation_jsonl(&input)?;
        let summary = store.record_observations(&observations)?;
        return print_json(&json!({
            "status": "ok",
            "mode": "stdin",
            "summary": summary,
        }));
    }

    let home = home_dir()?;
    let config = load_config(cwd, paths)?;
    if config.sources.is_empty() {
        return Err(CliError::new(
            "missing_sources",
            "no ingest sources configured; add sources in .unsealed/config.yml or ~/.unsealed/config.yml",
        ));
    }

    let inputs = resolve_source_files(cwd, &home, &config.sources, &config.exclude)?;

    let mut scanned = 0usize;
    let mut imported = 0usize;
    let mut skipped_unchanged = 0usize;
    let mut observations_recorded = 0usize;
    let mut failures = Vec::new();

    for path in inputs {
        scanned += 1;
        let input = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) => {
                failures.push(json!({ "path": path, "error": err.to_string() }));
                continue;
            }
        };
        let input_hash = sha256_hex(&input);
        let source = path.to_string_lossy().into_owned();
        let previous = store.ingest_cursor(&source)?;
        if previous.as_ref().is_some_and(|prev| prev.input_hash == input_hash) {
            skipped_unchanged += 1;
            continue;
        }

        // Extraction files are append-only; only lines past the last cursor count.
        let unread = match previous.as_ref() {
            None => input.as_str(),
            Some(prev) => match appended_tail(&input, prev) {
                Some(tail) => tail,
                None => {
                    failures.push(json!({
                        "path": path,
                        "error": "input was rewritten since the last ingest; only appends are supported",
                    }));
                    continue;
                }
            },
        };

        let outcome = parse_observation_jsonl(unread).and_then(|observations| {
            store.record_source_batch(&source, &input_hash, input.len(), &observations)
        });
        let summary = match outcome {
            Ok(summary) => summary,
            Err(err) if err.is_fatal() => return Err(err.into()),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping input");
                failures.push(json!({ "path": path, "error": err.to_string() }));
                continue;
            }
        };

        imported += 1;
        observations_recorded += summary.observations;
    }

    info!(scanned, imported, skipped_unchanged, "ingest finished");

    print_json(&json!({
        "status": if failures.is_empty() { "ok" } else { "partial" },
        "scanned_inputs": scanned,
        "imported_inputs": imported,
        "skipped_unchanged": skipped_unchanged,
        "observations": observations_recorded,
        "failure_count": failures.len(),
        "failures": failures,
    }))
}

fn cmd_seed(paths: &RepoPaths) -> Result<(), CliError> {
    let store = open_store(paths)?;
    let summary = store.initialize_canonical()?;
    print_json(&json!({
        "status": if summary.canonical_created == 0 {
            "already_initialized"
        } else {
            "initialized"
        },
        "summary": summary,
    }))
}

fn cmd_candidates(cwd: &Path, paths: &RepoPaths, args: CandidateArgs) -> Result<(), CliError> {
    let store = open_store(paths)?;
    let config = load_config(cwd, paths)?;
    let query = candidate_query(&config, &args.finder);
    let scan = find_merge_candidates(&store, &query)?;

    let thresholds = ReviewThresholds::default();
    let mut auto_merge = Vec::new();
    let mut oracle_review = Vec::new();
    let mut manual_review = Vec::new();
    let mut below_threshold = Vec::new();
    for candidate in scan.candidates {
        match ReviewTier::route(candidate, &thresholds) {
            ReviewTier::AutoMerge(c) => auto_merge.push(c),
            ReviewTier::OracleReview(c) => oracle_review.push(c),
            ReviewTier::ManualReview(c) => manual_review.push(c),
            ReviewTier::BelowThreshold(c) => below_threshold.push(c),
        }
    }

    let report = json!({
        "entity_type": scan.entity_type,
        "entities": scan.entities,
        "blocks": scan.blocks,
        "comparisons": scan.comparisons,
        "total_candidates": auto_merge.len()
            + oracle_review.len()
            + manual_review.len()
            + below_threshold.len(),
        "summary": {
            "auto_merge": auto_merge.len(),
            "oracle_review": oracle_review.len(),
            "manual_review": manual_review.len(),
            "below_threshold": below_threshold.len(),
        },
        "thresholds": thresholds,
        "auto_merge": auto_merge,
        "oracle_review": oracle_review,
        "manual_review": manual_review,
        "below_threshold": below_threshold,
    });

    if let Some(out) = &args.out {
        write_json_atomic(out, &report).map_err(|err| CliError::io("write_error", err))?;
    }
    print_json(&report)
}

fn cmd_merge(cwd: &Path, paths: &RepoPaths, args: MergeArgs) -> Result<(), CliError> {
    let mut store = open_store(paths)?;
    let config = load_config(cwd, paths)?;
    let query = candidate_query(&config, &args.finder);
    let scan = find_merge_candidates(&store, &query)?;

    let oracle = if args.tier.runs_oracle() {
        Some(
            OllamaOracle::new(&config.oracle)
                .map_err(|err| CliError::new("oracle_error", err.to_string()))?,
        )
    } else {
        None
    };

    let interrupt = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&interrupt);
    if let Err(err) = ctrlc::set_handler(move || handler_flag.store(true, Ordering::SeqCst)) {
        warn!(error = %err, "could not install Ctrl-C handler");
    }

    let mut router = ReviewRouter::new(RouterOptions {
        tiers: args.tier,
        dry_run: args.dry_run,
        parallelism: config.oracle.parallelism,
        ..RouterOptions::default()
    })
    .with_interrupt(&interrupt);
    if let Some(oracle) = &oracle {
        router = router.with_oracle(oracle);
    }

    let plan = router.plan(query.entity_type, scan.candidates, &store)?;
    let outcome = if args.dry_run {
        let mut snapshot = store.snapshot_graph()?;
        router.execute(&mut snapshot, plan)
    } else {
        router.execute(&mut store, plan)
    };

    let report = match outcome {
        Ok(report) => report,
        Err(aborted) => {
            if let Some(out) = &args.out {
                write_json_atomic(out, &aborted.report)
                    .map_err(|err| CliError::io("write_error", err))?;
            }
            return Err(CliError::new(aborted.error.code(), aborted.to_string()));
        }
    };

    let payload = json!({
        "status": if report.interrupted { "interrupted" } else { "ok" },
        "entity_type": query.entity_type,
        "tier": args.tier,
        "scan": {
            "entities": scan.entities,
            "blocks": scan.blocks,
            "comparisons": scan.comparisons,
        },
        "report": report,
    });
    if let Some(out) = &args.out {
        write_json_atomic(out, &payload).map_err(|err| CliError::io("write_error", err))?;
    }
    print_json(&payload)
}

fn cmd_merge_entity(paths: &RepoPaths, args: MergeEntityArgs) -> Result<(), CliError> {
    let mut store = open_store(paths)?;
    let entity = store.entity(args.entity_id)?;
    let outcome = merge(
        &mut store,
        args.entity_id,
        args.canonical_id,
        MergeMethod::Manual,
        args.confidence,
        &args.actor,
    )?;
    let canonical = store.canonical_for_entity(args.entity_id)?;
    print_json(&json!({
        "status": "ok",
        "entity": entity,
        "outcome": outcome,
        "canonical": canonical,
    }))
}

fn cmd_lookup(paths: &RepoPaths, entity_id: EntityId) -> Result<(), CliError> {
    let store = open_store(paths)?;
    let entity = store.entity(entity_id)?;
    let canonical = store.canonical_for_entity(entity_id)?;
    print_json(&json!({
        "entity": entity,
        "canonical": canonical,
    }))
}

fn cmd_members(paths: &RepoPaths, canonical_id: CanonicalId) -> Result<(), CliError> {
    let store = open_store(paths)?;
    let canonical = store.canonical(canonical_id)?;
    let aliases = store.aliases_for_canonical(canonical_id)?;
    print_json(&json!({
        "canonical": canonical,
        "alias_count": aliases.len(),
        "aliases": aliases,
    }))
}

fn cmd_search(paths: &RepoPaths, args: SearchArgs) -> Result<(), CliError> {
    let store = open_store(paths)?;
    let results = store.search_canonical(&args.query, args.entity_type, args.limit)?;
    print_json(&json!({
        "query": args.query,
        "count": results.len(),
        "results": results,
    }))
}

fn cmd_stats(paths: &RepoPaths) -> Result<(), CliError> {
    let store = open_store(paths)?;
    let stats = store.canonical_stats()?;
    print_json(&serde_json::to_value(stats)?)
}

fn cmd_verify(paths: &RepoPaths) -> Result<(), CliError> {
    let store = open_store(paths)?;
    let totals = store.verify_invariants()?;
    print_json(&json!({
        "status": "ok",
        "totals": totals,
    }))
}

fn candidate_query(config: &EffectiveConfig, args: &FinderArgs) -> CandidateQuery {
    let defaults = &config.candidates;
    CandidateQuery {
        entity_type: args.entity_type,
        min_occurrences: args.min_occurrences.unwrap_or(defaults.min_occurrences),
        max_edit_distance: args.max_distance.unwrap_or(defaults.max_edit_distance),
        min_confidence: args.min_confidence.unwrap_or(defaults.min_confidence),
        limit: args.limit.unwrap_or(defaults.limit),
    }
}

fn load_config(cwd: &Path, paths: &RepoPaths) -> Result<EffectiveConfig, CliError> {
    let mut config =
        load_effective_config(cwd, Some(&paths.repo_config), Some(&paths.user_config))?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    Ok(config)
}

fn resolve_source_files(
    cwd: &Path,
    home: &Path,
    sources: &[String],
    exclude_patterns: &[String],
) -> Result<Vec<PathBuf>, CliError> {
    let mut out = Vec::new();
    let excludes = compile_excludes(cwd, home, exclude_patterns)?;

    for source in sources {
        let raw_path = source.trim();
        if raw_path.is_empty() {
            continue;
        }
        let expanded = absolutize(cwd, home, raw_path);
        let source_files = if looks_like_glob(raw_path) {
            glob_paths(&expanded)?
        } else if expanded.is_dir() {
            WalkDir::new(&expanded)
                .into_iter()
                .filter_map(Result::ok)
                .map(|entry| entry.path().to_path_buf())
                .filter(|path| path.is_file())
                .collect::<Vec<_>>()
        } else if expanded.is_file() {
            vec![expanded]
        } else {
            Vec::new()
        };

        out.extend(
            source_files
                .into_iter()
                .filter(|path| !is_excluded(path, &excludes)),
        );
    }

    out.sort();
    out.dedup();
    Ok(out)
}

fn absolutize(cwd: &Path, home: &Path, raw: &str) -> PathBuf {
    let expanded = expand_tilde(raw, home);
    if expanded.is_absolute() {
        return expanded;
    }
    let relative = expanded.strip_prefix(".").unwrap_or(&expanded);
    cwd.join(relative)
}

fn looks_like_glob(path: &str) -> bool {
    ['*', '?', '[', ']', '{', '}']
        .iter()
        .any(|ch| path.contains(*ch))
}

fn glob_paths(pattern: &Path) -> Result<Vec<PathBuf>, CliError> {
    let pattern_str = pattern.to_string_lossy();
    let mut out = Vec::new();
    let entries = glob(&pattern_str)
        .map_err(|err| CliError::new("glob_error", format!("{} ({pattern_str})", err.msg)))?;
    for entry in entries {
        match entry {
            Ok(path) if path.is_file() => out.push(path),
            Ok(_) => {}
            Err(err) => return Err(CliError::new("glob_error", err.to_string())),
        }
    }
    Ok(out)
}

fn compile_excludes(
    cwd: &Path,
    home: &Path,
    patterns: &[String],
) -> Result<Vec<glob::Pattern>, CliError> {
    let mut compiled = Vec::new();
    for pattern in patterns {
        let raw = pattern.trim();
        if raw.is_empty() {
            continue;
        }
        let normalized = absolutize(cwd, home, raw).to_string_lossy().to_string();
        let compiled_pattern = glob::Pattern::new(&normalized)
            .map_err(|err| CliError::new("exclude_glob_error", err.to_string()))?;
        compiled.push(compiled_pattern);
    }
    Ok(compiled)
}

fn is_excluded(path: &Path, excludes: &[glob::Pattern]) -> bool {
    excludes.iter().any(|pattern| pattern.matches_path(path))
}

fn appended_tail<'a>(input: &'a str, previous: &IngestCursor) -> Option<&'a str> {
    let consumed = previous.consumed_bytes;
    if consumed > input.len() || !input.is_char_boundary(consumed) {
        return None;
    }
    (sha256_hex(&input[..consumed]) == previous.input_hash).then(|| &input[consumed..])
}

fn repo_paths(cwd: &Path, global: bool) -> Result<RepoPaths, CliError> {
    let home = home_dir()?;
    let (root, mode) = if global {
        (home.join(".unsealed"), StorageMode::Global)
    } else {
        (cwd.join(".unsealed"), StorageMode::RepoLocal)
    };

    Ok(RepoPaths {
        db: root.join(DB_FILE),
        repo_config: cwd.join(".unsealed").join("config.yml"),
        user_config: home.join(".unsealed").join("config.yml"),
        root,
        mode,
    })
}

fn open_store(paths: &RepoPaths) -> Result<SqliteStore, CliError> {
    if !paths.root.exists() || !paths.db.exists() {
        return Err(CliError::new(
            "not_initialized",
            "store is not initialized; run `unsealed init`",
        ));
    }
    Ok(SqliteStore::open(&path_string(&paths.db))?)
}

fn write_default_config(paths: &RepoPaths) -> Result<(), CliError> {
    let config_path = match paths.mode {
        StorageMode::RepoLocal => &paths.repo_config,
        StorageMode::Global => &paths.user_config,
    };
    if config_path.exists() {
        return Ok(());
    }
    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent).map_err(|err| CliError::io("mkdir_error", err))?;
    }
    let default = match paths.mode {
        StorageMode::RepoLocal => default_repo_config_yaml(),
        StorageMode::Global => default_global_config_yaml(),
    };
    fs::write(config_path, default).map_err(|err| CliError::io("write_error", err))
}

fn home_dir() -> Result<PathBuf, CliError> {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .ok_or_else(|| CliError::new("home_error", "HOME environment variable is not set"))
}

fn parse_entity_type(raw: &str) -> Result<EntityType, String> {
    EntityType::parse(raw).map_err(|err| err.to_string())
}

fn parse_tier(raw: &str) -> Result<TierSelection, String> {
    TierSelection::parse(raw).map_err(|err| err.to_string())
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string(value)?;
    println!("{rendered}");
    Ok(())
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}

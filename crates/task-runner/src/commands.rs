//! Subcommand handlers. Each returns the JSON document `main` prints.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use tracing::{debug, info};

use task_engine::diagnoser::{hypothesize, DiagnosisInput};
use task_engine::memory::{FailureMemory, JsonFileLearningStore, LearningStore, VerificationLearningStore};
use task_engine::verifier::score_snapshot;
use task_engine::{ActionType, EngineConfig};

/// Defaults, then the TOML file if given, then `TASK_ENGINE_*` overrides.
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let mut config = match path {
        Some(p) => EngineConfig::from_file(p).with_context(|| format!("loading config from {}", p.display()))?,
        None => EngineConfig::default(),
    };
    config.apply_env();
    config.validate().context("invalid engine configuration")?;
    Ok(config)
}

fn open_store(path: &Path) -> Result<Arc<JsonFileLearningStore>> {
    let store = JsonFileLearningStore::open(path)
        .with_context(|| format!("opening learning store {}", path.display()))?;
    debug!(path = %path.display(), "learning store opened");
    Ok(Arc::new(store))
}

pub struct VerifyArgs {
    pub task_type: String,
    pub text: Option<String>,
    pub text_file: Option<PathBuf>,
    pub url: Option<String>,
    pub action_rate: Option<f64>,
}

pub fn verify(config: &EngineConfig, args: VerifyArgs) -> Result<Value> {
    let text = match (args.text, args.text_file) {
        (Some(text), _) => text,
        (None, Some(path)) => std::fs::read_to_string(&path)
            .with_context(|| format!("reading page text from {}", path.display()))?,
        (None, None) => String::new(),
    };
    let snapshot = score_snapshot(
        &config.verification,
        &args.task_type,
        &text,
        args.url.as_deref(),
        args.action_rate,
    );
    info!(
        task_type = %snapshot.task_type,
        composite = snapshot.composite,
        passed = snapshot.passed,
        "verification scored"
    );
    Ok(serde_json::to_value(snapshot)?)
}

pub fn diagnose(error: &str, attempts: u32, credential_expired: bool) -> Result<Value> {
    let hypotheses = hypothesize(&DiagnosisInput {
        error: error.to_string(),
        attempts,
        credential_expired,
        prior_failures: 0,
    });
    debug!(count = hypotheses.len(), "hypotheses ranked");
    Ok(serde_json::to_value(hypotheses)?)
}

pub async fn memory_lookup(
    config: &EngineConfig,
    store_path: &Path,
    domain: &str,
    action_type: &str,
    selector: Option<&str>,
) -> Result<Value> {
    let action_type = ActionType::parse(action_type).ok_or_else(|| anyhow!("unknown action type: {action_type}"))?;
    let store = open_store(store_path)?;
    let memory = FailureMemory::new(store, config.memory.clone());
    let fix = memory
        .lookup(domain, action_type, selector)
        .await
        .context("failure memory lookup")?;
    Ok(serde_json::to_value(fix)?)
}

pub async fn memory_list(store_path: &Path) -> Result<Value> {
    let store = open_store(store_path)?;
    let mut rows = store.all_failures().await.context("listing failure memory")?;
    rows.sort_by(|a, b| {
        a.site_domain
            .cmp(&b.site_domain)
            .then(b.last_seen_at.cmp(&a.last_seen_at))
    });
    Ok(serde_json::to_value(rows)?)
}

pub async fn hints(config: &EngineConfig, store_path: &Path, domain: &str, task_type: &str) -> Result<Value> {
    let store = open_store(store_path)?;
    let learning = VerificationLearningStore::new(store, config.memory.clone());
    let known = learning
        .known_corrections(domain, task_type)
        .await
        .context("fetching known corrections")?;
    let preamble = learning
        .preamble_for(domain, task_type)
        .await
        .context("rendering known issues")?;
    Ok(json!({
        "domain": domain,
        "task_type": task_type,
        "preamble": preamble,
        "corrections": known,
    }))
}

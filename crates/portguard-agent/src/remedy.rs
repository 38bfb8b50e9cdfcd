use std::{io::ErrorKind, path::PathBuf, sync::Arc};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::{config::GuardConfig, errors::RemediationActionError, supervisor::Supervisor};

/// Fixed set of failure categories the engine knows how to remediate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Connection,
    Build,
    Api,
    Validation,
    ResourceExhaustion,
}

impl ErrorCategory {
    pub fn tag(self) -> &'static str {
        match self {
            ErrorCategory::Connection => "connection",
            ErrorCategory::Build => "build",
            ErrorCategory::Api => "api",
            ErrorCategory::Validation => "validation",
            ErrorCategory::ResourceExhaustion => "resource_exhaustion",
        }
    }
}

/// Declarative classification table, evaluated top to bottom; the first
/// matching category wins, so classification stays deterministic when a line
/// matches several patterns. Matching is case-insensitive substring.
const CLASSIFIERS: &[(ErrorCategory, &[&str])] = &[
    (
        ErrorCategory::Connection,
        &[
            "econnrefused",
            "prismaclientinitializationerror",
            "connection refused",
        ],
    ),
    (
        ErrorCategory::Build,
        &["build error", "failed to compile", "module not found"],
    ),
    (
        ErrorCategory::Api,
        &["internal server error", "api error"],
    ),
    (
        ErrorCategory::Validation,
        &["validation error", "invalid data"],
    ),
    (
        ErrorCategory::ResourceExhaustion,
        &["out of memory", "memory error", "heap limit"],
    ),
];

pub fn classify(line: &str) -> Option<ErrorCategory> {
    let lower = line.to_ascii_lowercase();
    for (category, needles) in CLASSIFIERS {
        if needles.iter().any(|n| lower.contains(n)) {
            return Some(*category);
        }
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureSource {
    ProcessOutput,
    AppLog,
}

/// A classified failure derived from one log line or structured entry.
#[derive(Debug, Clone)]
pub struct ErrorSignature {
    pub category: ErrorCategory,
    pub excerpt: String,
    pub source: SignatureSource,
    /// Structured entries carry their own timestamp; stream lines do not.
    pub timestamp: Option<String>,
    pub origin_url: Option<String>,
}

impl ErrorSignature {
    /// Deterministic dedup key: the category tag plus the entry's own
    /// timestamp, falling back to the trimmed excerpt for untimestamped
    /// stream lines. Repeated scans of the same occurrence map to the same
    /// key, so it is only ever remediated once.
    pub fn identity_key(&self) -> String {
        match &self.timestamp {
            Some(ts) => format!("{}:{}", self.category.tag(), ts),
            None => format!("{}:{}", self.category.tag(), self.excerpt.trim()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

/// Persisted outcome of one remediation attempt, appended exactly once per
/// identity key. Unknown fields are ignored on load so the format can grow.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationRecord {
    pub key: String,
    pub category: ErrorCategory,
    pub outcome: Outcome,
    pub completed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Durable ledger of handled signatures, rewritten in full after each
/// dispatch batch so re-invocation after a crash does not replay them.
pub struct Ledger {
    path: PathBuf,
    records: Vec<RemediationRecord>,
}

impl Ledger {
    pub async fn load(path: PathBuf) -> Self {
        let records = match tokio::fs::read_to_string(&path).await {
            Ok(content) => match serde_json::from_str::<Vec<RemediationRecord>>(&content) {
                Ok(records) => records,
                Err(err) => {
                    tracing::warn!(%err, path = %path.display(), "unreadable remediation ledger, starting empty");
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };
        Self { path, records }
    }

    pub fn get(&self, key: &str) -> Option<&RemediationRecord> {
        self.records.iter().find(|r| r.key == key)
    }

    /// Atomic rewrite: tmp file then rename.
    pub async fn persist(&self) -> anyhow::Result<()> {
        use anyhow::Context;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("create ledger dir")?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(&self.records).context("serialize ledger")?;
        tokio::fs::write(&tmp, &data).await.context("write ledger tmp")?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .context("persist ledger")?;
        Ok(())
    }
}

/// One step of a corrective action. Steps run in sequence; the first failing
/// step aborts the rest and marks the whole signature as failed.
#[derive(Debug, Clone)]
pub enum RemedyStep {
    /// External command. `check: false` steps are best-effort and never fail
    /// the action (e.g. `pkill` with nothing to kill).
    Run {
        program: String,
        args: Vec<String>,
        check: bool,
    },
    /// Clean a build-artifact directory; a missing directory is fine.
    RemoveDir(PathBuf),
    /// Restart through the supervisor's serialized stop/start API.
    RestartServer,
}

impl RemedyStep {
    fn name(&self) -> String {
        match self {
            RemedyStep::Run { program, args, .. } => {
                let mut s = program.clone();
                for a in args {
                    s.push(' ');
                    s.push_str(a);
                }
                s
            }
            RemedyStep::RemoveDir(path) => format!("remove {}", path.display()),
            RemedyStep::RestartServer => "restart server".to_string(),
        }
    }
}

/// The fixed category -> action mapping. Several categories deliberately end
/// in a server restart but stay separate remediations: dedup is by identity
/// key, which includes the category.
pub fn default_actions(cfg: &GuardConfig) -> Vec<(ErrorCategory, Vec<RemedyStep>)> {
    let run = |program: &str, args: &[&str], check: bool| RemedyStep::Run {
        program: program.to_string(),
        args: args.iter().map(|a| a.to_string()).collect(),
        check,
    };

    vec![
        (
            ErrorCategory::Connection,
            vec![
                run("service", &["postgresql", "start"], false),
                run("npx", &["prisma", "generate"], true),
            ],
        ),
        (
            ErrorCategory::Build,
            vec![
                RemedyStep::RemoveDir(cfg.cwd.join(".next")),
                run("npm", &["install"], true),
                run("npm", &["run", "build"], true),
            ],
        ),
        (ErrorCategory::Api, vec![RemedyStep::RestartServer]),
        (
            ErrorCategory::Validation,
            vec![run("npx", &["prisma", "db", "push", "--accept-data-loss"], true)],
        ),
        (
            ErrorCategory::ResourceExhaustion,
            vec![run("pkill", &["-f", "node"], false), RemedyStep::RestartServer],
        ),
    ]
}

#[derive(Debug, serde::Deserialize)]
struct AppLogEntry {
    #[serde(rename = "type", default)]
    entry_type: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

/// The store is either a bare entry array or `{"logs": [...]}`; both shapes
/// exist in the wild. Anything else is treated as empty.
fn parse_app_log(content: &str) -> Vec<AppLogEntry> {
    #[derive(serde::Deserialize)]
    #[serde(untagged)]
    enum Store {
        Entries(Vec<AppLogEntry>),
        Wrapped { logs: Vec<AppLogEntry> },
    }

    match serde_json::from_str::<Store>(content) {
        Ok(Store::Entries(entries)) => entries,
        Ok(Store::Wrapped { logs }) => logs,
        Err(err) => {
            tracing::warn!(%err, "unreadable application log store");
            Vec::new()
        }
    }
}

/// Scans log sources for known failure signatures and dispatches one
/// corrective action per signature, recording the outcome in the ledger.
/// Holds no timer of its own; the caller owns scheduling.
pub struct RemedyEngine {
    error_log: PathBuf,
    app_log: PathBuf,
    actions: Vec<(ErrorCategory, Vec<RemedyStep>)>,
    cwd: PathBuf,
    supervisor: Arc<Supervisor>,
    ledger: Mutex<Ledger>,
}

impl RemedyEngine {
    pub async fn new(supervisor: Arc<Supervisor>) -> Self {
        let cfg = supervisor.config().clone();
        let ledger = Ledger::load(cfg.ledger_path()).await;
        Self {
            error_log: cfg.error_log_path(),
            app_log: cfg.app_log_path(),
            actions: default_actions(&cfg),
            cwd: cfg.cwd.clone(),
            supervisor,
            ledger: Mutex::new(ledger),
        }
    }

    #[cfg(test)]
    pub fn with_actions(mut self, actions: Vec<(ErrorCategory, Vec<RemedyStep>)>) -> Self {
        self.actions = actions;
        self
    }

    /// Read every configured log source from durable storage and classify.
    /// Restartable: no in-memory watermark, the ledger is what prevents
    /// re-processing across invocations.
    pub async fn scan(&self) -> Vec<ErrorSignature> {
        let mut signatures = Vec::new();

        if let Ok(content) = tokio::fs::read_to_string(&self.error_log).await {
            for line in content.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                if let Some(category) = classify(line) {
                    signatures.push(ErrorSignature {
                        category,
                        excerpt: line.to_string(),
                        source: SignatureSource::ProcessOutput,
                        timestamp: None,
                        origin_url: None,
                    });
                }
            }
        }

        if let Ok(content) = tokio::fs::read_to_string(&self.app_log).await {
            for entry in parse_app_log(&content) {
                if entry.entry_type != "error" {
                    continue;
                }
                if let Some(category) = classify(&entry.message) {
                    signatures.push(ErrorSignature {
                        category,
                        excerpt: entry.message,
                        source: SignatureSource::AppLog,
                        timestamp: entry.timestamp,
                        origin_url: entry.url,
                    });
                }
            }
        }

        signatures
    }

    /// Idempotent: a signature whose identity key is already in the ledger
    /// short-circuits to the prior record; nothing re-executes.
    pub async fn dispatch(&self, signature: &ErrorSignature) -> RemediationRecord {
        let key = signature.identity_key();
        {
            let ledger = self.ledger.lock().await;
            if let Some(prior) = ledger.get(&key) {
                return prior.clone();
            }
        }

        tracing::info!(
            category = signature.category.tag(),
            source = ?signature.source,
            origin = signature.origin_url.as_deref().unwrap_or(""),
            "dispatching remediation"
        );

        let result = self.run_action(signature.category).await;
        let record = RemediationRecord {
            key,
            category: signature.category,
            outcome: if result.is_ok() {
                Outcome::Success
            } else {
                Outcome::Failure
            },
            completed_at: Utc::now(),
            detail: result.err().map(|e| e.to_string()),
        };

        match record.outcome {
            Outcome::Success => {
                tracing::info!(category = signature.category.tag(), "remediation succeeded");
            }
            Outcome::Failure => {
                // Recorded but not retried automatically; hammering a broken
                // environment every cycle helps nobody.
                tracing::error!(
                    category = signature.category.tag(),
                    detail = record.detail.as_deref().unwrap_or(""),
                    "remediation failed"
                );
            }
        }

        let mut ledger = self.ledger.lock().await;
        ledger.records.push(record.clone());
        if let Err(err) = ledger.persist().await {
            tracing::warn!(%err, "failed to persist remediation ledger");
        }
        record
    }

    async fn run_action(&self, category: ErrorCategory) -> Result<(), RemediationActionError> {
        let Some((_, steps)) = self.actions.iter().find(|(c, _)| *c == category) else {
            return Ok(());
        };

        for step in steps {
            match step {
                RemedyStep::Run {
                    program,
                    args,
                    check,
                } => {
                    let output = tokio::process::Command::new(program)
                        .args(args)
                        .current_dir(&self.cwd)
                        .output()
                        .await;
                    match output {
                        Ok(out) if out.status.success() || !check => {}
                        Ok(out) => {
                            return Err(RemediationActionError {
                                step: step.name(),
                                reason: format!("exit code {:?}", out.status.code()),
                            });
                        }
                        Err(_) if !check => {}
                        Err(err) => {
                            return Err(RemediationActionError {
                                step: step.name(),
                                reason: err.to_string(),
                            });
                        }
                    }
                }
                RemedyStep::RemoveDir(path) => {
                    match tokio::fs::remove_dir_all(path).await {
                        Ok(()) => {}
                        Err(err) if err.kind() == ErrorKind::NotFound => {}
                        Err(err) => {
                            return Err(RemediationActionError {
                                step: step.name(),
                                reason: err.to_string(),
                            });
                        }
                    }
                }
                RemedyStep::RestartServer => {
                    self.supervisor
                        .restart()
                        .await
                        .map_err(|err| RemediationActionError {
                            step: step.name(),
                            reason: err.to_string(),
                        })?;
                }
            }
        }
        Ok(())
    }

    /// One poll cycle: scan, dispatch everything new, return how many
    /// signatures were newly handled.
    pub async fn run_cycle(&self) -> usize {
        let signatures = self.scan().await;
        let mut handled = 0;
        for signature in &signatures {
            let already = {
                let ledger = self.ledger.lock().await;
                ledger.get(&signature.identity_key()).is_some()
            };
            if already {
                continue;
            }
            self.dispatch(signature).await;
            handled += 1;
        }
        if handled > 0 {
            tracing::info!(handled, "remediation cycle complete");
        }
        handled
    }

    pub async fn ledger_len(&self) -> usize {
        self.ledger.lock().await.records.len()
    }
}

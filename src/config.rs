//! Layered configuration for Baton.
//!
//! Settings are read from `.baton/baton.toml`, then overridden by the
//! environment (a project `.env` is loaded first), then by CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [store]
//! path = ".baton/baton.db"
//!
//! [queues]
//! max_attempts = 2
//! concurrency = 2
//! poll_interval_ms = 500
//! lease_secs = 900
//! backoff_ms = 2000
//!
//! [workflow]
//! max_iterations = 2
//! handoff = "dev-execute"   # or "none" to run the whole graph in the driver
//!
//! [hitl]
//! failed_attempt_threshold = 2
//!
//! [policy]
//! allowed_repos = ["acme/widgets"]
//!
//! [review]
//! command = "cargo test"
//! status_context = "baton/review"
//! timeout_secs = 600
//!
//! [ops]
//! command = "./scripts/smoke.sh"
//!
//! [limits]
//! output_limit = 2000
//!
//! [workspace]
//! root = ".baton/workspaces"
//!
//! [github]
//! api_url = "https://api.github.com"
//! token_env = "GITHUB_TOKEN"
//!
//! [logging]
//! level = "info"
//! format = "pretty"         # or "json"
//! dir = ".baton/logs"       # optional daily-rolling file output
//! ```

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use baton_common::{NodeName, Stage};
use serde::{Deserialize, Serialize};

pub const BATON_DIR: &str = ".baton";
pub const CONFIG_FILE: &str = "baton.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    ".baton/baton.db".to_string()
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSection {
    /// Deliveries per job before it is dead-lettered
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Jobs processed in parallel per queue
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How long a claimed job stays invisible to other consumers
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    /// Delay before a failed job is redelivered
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    2
}

fn default_concurrency() -> usize {
    2
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_lease_secs() -> u64 {
    900
}

fn default_backoff_ms() -> u64 {
    2000
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            lease_secs: default_lease_secs(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl QueueSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSection {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Node the driver hands off to the phase workers, or "none"
    #[serde(default = "default_handoff")]
    pub handoff: String,
}

fn default_max_iterations() -> u32 {
    crate::workflow::DEFAULT_MAX_ITERATIONS
}

fn default_handoff() -> String {
    NodeName::DevExecute.as_str().to_string()
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            handoff: default_handoff(),
        }
    }
}

impl WorkflowSection {
    pub fn handoff_node(&self) -> Result<Option<NodeName>> {
        match self.handoff.trim() {
            "" | "none" => Ok(None),
            other => {
                let node: NodeName = other.parse().map_err(|e: String| anyhow::anyhow!(e))?;
                if node.position().is_none() {
                    anyhow::bail!("Handoff node must be a sequence node, got '{}'", other);
                }
                Ok(Some(node))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HitlSection {
    #[serde(default = "default_failed_attempt_threshold")]
    pub failed_attempt_threshold: u32,
}

fn default_failed_attempt_threshold() -> u32 {
    crate::hitl::DEFAULT_FAILED_ATTEMPT_THRESHOLD
}

impl Default for HitlSection {
    fn default() -> Self {
        Self {
            failed_attempt_threshold: default_failed_attempt_threshold(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicySection {
    /// Repositories phase workers may act on. Empty allows none.
    #[serde(default)]
    pub allowed_repos: Vec<String>,
}

/// Set of `owner/name` slugs the workers may touch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoAllowlist(BTreeSet<String>);

impl RepoAllowlist {
    pub fn new<I, S>(repos: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            repos
                .into_iter()
                .map(|r| r.as_ref().trim().to_string())
                .filter(|r| !r.is_empty())
                .collect(),
        )
    }

    /// Parse a comma-separated list.
    pub fn parse(list: &str) -> Self {
        Self::new(list.split(','))
    }

    pub fn allows(&self, repo: &str) -> bool {
        self.0.contains(repo.trim())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckSection {
    /// Shell command run by the stage worker
    #[serde(default)]
    pub command: Option<String>,
    /// Commit status context; defaults to "baton/<stage>"
    #[serde(default)]
    pub status_context: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsSection {
    /// Characters of captured command output kept in events
    #[serde(default = "default_output_limit")]
    pub output_limit: usize,
}

fn default_output_limit() -> usize {
    crate::commands::DEFAULT_OUTPUT_LIMIT
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            output_limit: default_output_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceSection {
    #[serde(default = "default_workspace_root")]
    pub root: String,
}

fn default_workspace_root() -> String {
    ".baton/workspaces".to_string()
}

impl Default for WorkspaceSection {
    fn default() -> Self {
        Self {
            root: default_workspace_root(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubSection {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Environment variable holding the API token
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

fn default_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}

impl Default for GithubSection {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            token_env: default_token_env(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default)]
    pub dir: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            dir: None,
        }
    }
}

/// Contents of `.baton/baton.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatonToml {
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub queues: QueueSection,
    #[serde(default)]
    pub workflow: WorkflowSection,
    #[serde(default)]
    pub hitl: HitlSection,
    #[serde(default)]
    pub policy: PolicySection,
    #[serde(default)]
    pub review: CheckSection,
    #[serde(default)]
    pub ops: CheckSection,
    #[serde(default)]
    pub limits: LimitsSection,
    #[serde(default)]
    pub workspace: WorkspaceSection,
    #[serde(default)]
    pub github: GithubSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl BatonToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse baton.toml")
    }

    /// Load `.baton/baton.toml`, or defaults when the file doesn't exist.
    pub fn load_or_default(baton_dir: &Path) -> Result<Self> {
        let config_path = baton_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize baton.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides. `lookup` is `std::env::var` in production.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("BATON_DB_PATH") {
            self.store.path = path;
        }
        if let Some(list) = lookup("BATON_ALLOWED_REPOS") {
            self.policy.allowed_repos = list
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(cmd) = lookup("BATON_REVIEW_COMMAND") {
            self.review.command = Some(cmd);
        }
        if let Some(cmd) = lookup("BATON_OPS_COMMAND") {
            self.ops.command = Some(cmd);
        }
        if let Some(value) = lookup("BATON_MAX_ITERATIONS") {
            self.workflow.max_iterations = value
                .trim()
                .parse()
                .with_context(|| format!("Invalid BATON_MAX_ITERATIONS '{}'", value))?;
        }
        if let Some(value) = lookup("BATON_MAX_ATTEMPTS") {
            self.queues.max_attempts = value
                .trim()
                .parse()
                .with_context(|| format!("Invalid BATON_MAX_ATTEMPTS '{}'", value))?;
        }
        if let Some(value) = lookup("BATON_LOG_FORMAT") {
            self.logging.format = value.parse()?;
        }
        Ok(())
    }

    pub fn allowlist(&self) -> RepoAllowlist {
        RepoAllowlist::new(&self.policy.allowed_repos)
    }

    pub fn check(&self, stage: Stage) -> Option<&CheckSection> {
        match stage {
            Stage::Dev => None,
            Stage::Review => Some(&self.review),
            Stage::Ops => Some(&self.ops),
        }
    }

    pub fn status_context(&self, stage: Stage) -> String {
        self.check(stage)
            .and_then(|c| c.status_context.clone())
            .unwrap_or_else(|| format!("baton/{}", stage))
    }

    /// Configuration problems that do not prevent startup.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.policy.allowed_repos.is_empty() {
            warnings.push(
                "policy.allowed_repos is empty: every phase job will be refused".to_string(),
            );
        }
        if let Err(e) = self.workflow.handoff_node() {
            warnings.push(format!("workflow.handoff: {}", e));
        }
        if self.workflow.max_iterations == 0 {
            warnings.push("workflow.max_iterations is 0: no run can replan".to_string());
        }
        for stage in [Stage::Review, Stage::Ops] {
            if self.check(stage).is_some_and(|c| c.command.is_none()) {
                warnings.push(format!("{}.command is not set: checks will be skipped", stage));
            }
        }
        warnings
    }
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct BatonConfig {
    pub project_dir: PathBuf,
    pub settings: BatonToml,
    pub verbose: bool,
}

impl BatonConfig {
    /// Resolve configuration for `project_dir`: `.env`, then the TOML file
    /// (explicit path or `.baton/baton.toml`), then process environment.
    pub fn load(project_dir: PathBuf, config_path: Option<&Path>, verbose: bool) -> Result<Self> {
        let env_file = project_dir.join(".env");
        if env_file.exists() {
            dotenvy::from_path(&env_file)
                .with_context(|| format!("Failed to load {}", env_file.display()))?;
        }

        let mut settings = match config_path {
            Some(path) => BatonToml::load(path)?,
            None => BatonToml::load_or_default(&project_dir.join(BATON_DIR))?,
        };
        settings.apply_env(|key| std::env::var(key).ok())?;

        Ok(Self {
            project_dir,
            settings,
            verbose,
        })
    }

    pub fn baton_dir(&self) -> PathBuf {
        self.project_dir.join(BATON_DIR)
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.resolve(&self.settings.store.path)
    }

    pub fn workspace_root(&self) -> PathBuf {
        self.resolve(&self.settings.workspace.root)
    }

    pub fn log_dir(&self) -> Option<PathBuf> {
        self.settings.logging.dir.as_deref().map(|d| self.resolve(d))
    }

    pub fn github_token(&self) -> Option<String> {
        std::env::var(&self.settings.github.token_env)
            .ok()
            .filter(|t| !t.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = BatonToml::default();
        assert_eq!(config.queues.max_attempts, 2);
        assert_eq!(config.queues.concurrency, 2);
        assert_eq!(config.workflow.max_iterations, 2);
        assert_eq!(config.hitl.failed_attempt_threshold, 2);
        assert_eq!(config.limits.output_limit, 2000);
        assert_eq!(
            config.workflow.handoff_node().unwrap(),
            Some(NodeName::DevExecute)
        );
        assert_eq!(config.status_context(Stage::Review), "baton/review");
    }

    #[test]
    fn test_parse_partial_file() {
        let config = BatonToml::parse(
            r#"
            [policy]
            allowed_repos = ["acme/widgets"]

            [ops]
            command = "make smoke"
            status_context = "ci/ops"

            [workflow]
            handoff = "none"
            "#,
        )
        .unwrap();
        assert!(config.allowlist().allows("acme/widgets"));
        assert_eq!(config.ops.command.as_deref(), Some("make smoke"));
        assert_eq!(config.status_context(Stage::Ops), "ci/ops");
        assert_eq!(config.workflow.handoff_node().unwrap(), None);
        assert_eq!(config.queues.lease_secs, 900);
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = BatonToml::parse("[policy]\nallowed_repos = [\"a/b\"]\n").unwrap();
        config
            .apply_env(env(&[
                ("BATON_ALLOWED_REPOS", " acme/widgets, acme/gears ,,"),
                ("BATON_REVIEW_COMMAND", "npm test"),
                ("BATON_MAX_ITERATIONS", "3"),
                ("BATON_LOG_FORMAT", "json"),
            ]))
            .unwrap();
        let allow = config.allowlist();
        assert!(allow.allows("acme/gears"));
        assert!(!allow.allows("a/b"));
        assert_eq!(config.review.command.as_deref(), Some("npm test"));
        assert_eq!(config.workflow.max_iterations, 3);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_env_number_is_error() {
        let mut config = BatonToml::default();
        let err = config
            .apply_env(env(&[("BATON_MAX_ATTEMPTS", "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains("BATON_MAX_ATTEMPTS"));
    }

    #[test]
    fn test_invalid_handoff() {
        let section = WorkflowSection {
            handoff: "escalate".into(),
            ..Default::default()
        };
        assert!(section.handoff_node().is_err());
        let section = WorkflowSection {
            handoff: "bogus".into(),
            ..Default::default()
        };
        assert!(section.handoff_node().is_err());
    }

    #[test]
    fn test_empty_allowlist_allows_nothing() {
        let allow = RepoAllowlist::parse("");
        assert!(allow.is_empty());
        assert!(!allow.allows("acme/widgets"));
    }

    #[test]
    fn test_warnings() {
        let config = BatonToml::default();
        let warnings = config.warnings();
        assert!(warnings.iter().any(|w| w.contains("allowed_repos")));
        assert!(warnings.iter().any(|w| w.contains("review.command")));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let mut config = BatonToml::default();
        config.policy.allowed_repos = vec!["acme/widgets".into()];
        config.save(&path).unwrap();

        let loaded = BatonToml::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded.policy.allowed_repos, vec!["acme/widgets".to_string()]);
    }

    #[test]
    fn test_relative_paths_resolve_against_project() {
        let config = BatonConfig {
            project_dir: PathBuf::from("/srv/project"),
            settings: BatonToml::default(),
            verbose: false,
        };
        assert_eq!(config.db_path(), PathBuf::from("/srv/project/.baton/baton.db"));
        assert!(config.log_dir().is_none());
    }
}

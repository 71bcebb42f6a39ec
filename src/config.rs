//! TOML configuration.
//!
//! Every section and field is optional; defaults reproduce the engine's
//! documented behavior (1200-char chunks with 200-char overlap, 2–5 planned
//! steps, 120 s test timeout, hashing embeddings). A missing config file is
//! not an error: [`load_config_or_default`] falls back to
//! [`Config::minimal`].

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub planning: PlanningConfig,
    #[serde(default)]
    pub tests: TestsConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// Configuration used when no config file exists.
    pub fn minimal() -> Self {
        Self::default()
    }
}

// ============ [workspace] ============

#[derive(Debug, Deserialize, Clone)]
pub struct WorkspaceConfig {
    /// Directory (relative to each workspace root) holding jobs, staging and index.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    /// Optional operator guidance appended to every edit request.
    #[serde(default = "default_steering_file")]
    pub steering_file: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            steering_file: default_steering_file(),
        }
    }
}

fn default_state_dir() -> String {
    ".stepwise".to_string()
}
fn default_steering_file() -> String {
    ".steering.md".to_string()
}

// ============ [index] ============

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    /// Extra exclusions on top of the built-in dependency/build/VCS globs.
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
            overlap_chars: default_overlap_chars(),
            extensions: default_extensions(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    }
}

fn default_max_chars() -> usize {
    1200
}
fn default_overlap_chars() -> usize {
    200
}
fn default_extensions() -> Vec<String> {
    [
        "ts", "tsx", "js", "jsx", "mjs", "cjs", "json", "md", "mdx", "yml", "yaml", "toml", "py",
        "go", "rs", "java", "kt", "cs", "cpp", "c", "h", "php", "rb", "sql", "sh",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

// ============ [retrieval] ============

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Matches requested for the job-level planning context.
    #[serde(default = "default_plan_k")]
    pub plan_k: usize,
    #[serde(default = "default_plan_budget_chars")]
    pub plan_budget_chars: usize,
    /// Matches requested for each step's edit context.
    #[serde(default = "default_step_k")]
    pub step_k: usize,
    #[serde(default = "default_step_budget_chars")]
    pub step_budget_chars: usize,
    /// Budget used by `stepwise search --packed` and `GET /context/search`.
    #[serde(default = "default_search_budget_chars")]
    pub search_budget_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            plan_k: default_plan_k(),
            plan_budget_chars: default_plan_budget_chars(),
            step_k: default_step_k(),
            step_budget_chars: default_step_budget_chars(),
            search_budget_chars: default_search_budget_chars(),
        }
    }
}

fn default_plan_k() -> usize {
    8
}
fn default_plan_budget_chars() -> usize {
    5000
}
fn default_step_k() -> usize {
    6
}
fn default_step_budget_chars() -> usize {
    4000
}
fn default_search_budget_chars() -> usize {
    6000
}

// ============ [embedding] ============

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_embedding_provider() -> String {
    "hashing".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

// ============ [chat] ============

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    /// Provider used when a start request names none (`auto`, `anthropic`, `openai`, `mock`).
    #[serde(default = "default_chat_provider")]
    pub default_provider: String,
    #[serde(default = "default_chat_model")]
    pub default_model: String,
    #[serde(default = "default_plan_max_tokens")]
    pub plan_max_tokens: u32,
    #[serde(default = "default_patch_max_tokens")]
    pub patch_max_tokens: u32,
    #[serde(default = "default_chat_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub openai_url: Option<String>,
    #[serde(default)]
    pub anthropic_url: Option<String>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            default_provider: default_chat_provider(),
            default_model: default_chat_model(),
            plan_max_tokens: default_plan_max_tokens(),
            patch_max_tokens: default_patch_max_tokens(),
            timeout_secs: default_chat_timeout_secs(),
            openai_url: None,
            anthropic_url: None,
        }
    }
}

fn default_chat_provider() -> String {
    "auto".to_string()
}
fn default_chat_model() -> String {
    "claude-sonnet-4".to_string()
}
fn default_plan_max_tokens() -> u32 {
    2048
}
fn default_patch_max_tokens() -> u32 {
    4096
}
fn default_chat_timeout_secs() -> u64 {
    120
}

// ============ [planning] ============

#[derive(Debug, Deserialize, Clone)]
pub struct PlanningConfig {
    #[serde(default = "default_min_steps")]
    pub min_steps: usize,
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
}

impl Default for PlanningConfig {
    fn default() -> Self {
        Self {
            min_steps: default_min_steps(),
            max_steps: default_max_steps(),
        }
    }
}

fn default_min_steps() -> usize {
    2
}
fn default_max_steps() -> usize {
    5
}

// ============ [tests] ============

#[derive(Debug, Deserialize, Clone)]
pub struct TestsConfig {
    /// Shell command run in the workspace root. When unset, the command is
    /// detected from the workspace manifest.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default = "default_test_timeout_secs")]
    pub timeout_secs: u64,
    /// Disable manifest-based detection; only `command` is honored.
    #[serde(default = "default_true")]
    pub detect: bool,
}

impl Default for TestsConfig {
    fn default() -> Self {
        Self {
            command: None,
            timeout_secs: default_test_timeout_secs(),
            detect: true,
        }
    }
}

fn default_test_timeout_secs() -> u64 {
    120
}
fn default_true() -> bool {
    true
}

// ============ [server] ============

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7337".to_string()
}

// ============ Loading ============

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Load `path` if it exists, otherwise use [`Config::minimal`].
pub fn load_config_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        Ok(Config::minimal())
    }
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Validate index
    if config.index.max_chars == 0 {
        anyhow::bail!("index.max_chars must be > 0");
    }
    if config.index.overlap_chars >= config.index.max_chars {
        anyhow::bail!("index.overlap_chars must be < index.max_chars");
    }

    // Validate planning
    if config.planning.max_steps == 0 {
        anyhow::bail!("planning.max_steps must be >= 1");
    }
    if config.planning.min_steps > config.planning.max_steps {
        anyhow::bail!("planning.min_steps must be <= planning.max_steps");
    }

    // Validate tests
    if config.tests.timeout_secs == 0 {
        anyhow::bail!("tests.timeout_secs must be > 0");
    }

    if config.workspace.state_dir.trim().is_empty() {
        anyhow::bail!("workspace.state_dir must not be empty");
    }

    // Validate embedding
    match config.embedding.provider.as_str() {
        "disabled" | "hashing" => {}
        "openai" | "ollama" => {
            if config.embedding.model.is_none() {
                anyhow::bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hashing, openai, or ollama.",
            other
        ),
    }
    if config.embedding.dims == Some(0) {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }

    Ok(())
}

/// Resolve a path inside a workspace's state directory.
pub fn state_path(config: &Config, root: &Path, parts: &[&str]) -> PathBuf {
    let mut path = root.join(&config.workspace.state_dir);
    for part in parts {
        path.push(part);
    }
    path
}

//! Job control surface.
//!
//! The [`Engine`] owns the job repository, the chat router, the embedder
//! and one [`AutopilotRunner`] per live job. The HTTP server and the CLI
//! both drive jobs through it.

use anyhow::Context;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::chat::ChatRouter;
use crate::config::Config;
use crate::embedding::{create_embedder, Embedder};
use crate::error::{EngineError, EngineResult};
use crate::models::{Job, JobSummary};
use crate::runner::{ApproveOutcome, AutopilotContext, AutopilotRunner};
use crate::store::{valid_job_id, FileJobStore, JobRepository, PersistentJobRepository};

const MIN_GOAL_CHARS: usize = 4;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub workspace_root: String,
    pub goal_prompt: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApproveRequest {
    #[serde(default)]
    pub selected_files: Option<Vec<String>>,
    #[serde(default)]
    pub approve_all: bool,
}

pub struct Engine {
    ctx: Arc<AutopilotContext>,
    repo: Arc<PersistentJobRepository>,
    runners: RwLock<HashMap<String, Arc<AutopilotRunner>>>,
}

impl Engine {
    pub fn new(config: Config, chat: ChatRouter, embedder: Arc<dyn Embedder>) -> Self {
        let repo = Arc::new(PersistentJobRepository::new(FileJobStore::new(
            config.workspace.state_dir.clone(),
        )));
        let ctx = Arc::new(AutopilotContext {
            config: Arc::new(config),
            chat: Arc::new(chat),
            embedder,
            repo: repo.clone(),
        });
        Self {
            ctx,
            repo,
            runners: RwLock::new(HashMap::new()),
        }
    }

    /// Engine with the configured chat providers and embedder.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let chat = ChatRouter::from_config(&config.chat)?;
        let embedder = create_embedder(&config.embedding)?;
        Ok(Self::new(config, chat, embedder))
    }

    pub fn config(&self) -> &Config {
        &self.ctx.config
    }

    pub fn embedder(&self) -> &dyn Embedder {
        self.ctx.embedder.as_ref()
    }

    pub fn store(&self) -> &FileJobStore {
        self.repo.store()
    }

    /// Create a job, plan it, and run until the first approval pause or a
    /// terminal state.
    pub async fn start(&self, req: StartRequest) -> EngineResult<Job> {
        let goal = req.goal_prompt.trim();
        if goal.chars().count() < MIN_GOAL_CHARS {
            return Err(EngineError::InvalidRequest(format!(
                "goalPrompt must be at least {} characters",
                MIN_GOAL_CHARS
            )));
        }
        let root = Path::new(&req.workspace_root);
        if !root.is_dir() {
            return Err(EngineError::InvalidRequest(format!(
                "workspaceRoot is not a directory: {}",
                req.workspace_root
            )));
        }
        let root = root
            .canonicalize()
            .with_context(|| format!("Failed to resolve workspace root {}", req.workspace_root))?;

        let chat = &self.ctx.config.chat;
        let job = Job::new(
            uuid::Uuid::new_v4().to_string(),
            root.to_string_lossy(),
            non_empty(req.provider).unwrap_or_else(|| chat.default_provider.clone()),
            non_empty(req.model).unwrap_or_else(|| chat.default_model.clone()),
            goal,
        );
        self.repo.put(&job)?;
        info!(job = %job.id, root = %job.workspace_root, "job created");

        let runner = self.register(job).await;
        Ok(runner.start().await?)
    }

    pub async fn status(&self, id: &str) -> EngineResult<Job> {
        Ok(self.runner(id).await?.snapshot().await)
    }

    pub async fn approve(&self, id: &str, req: ApproveRequest) -> EngineResult<ApproveOutcome> {
        self.runner(id)
            .await?
            .approve(req.selected_files, req.approve_all)
            .await
    }

    pub async fn abort(&self, id: &str) -> EngineResult<Job> {
        self.runner(id).await?.abort().await
    }

    /// Summaries of every job this engine knows, oldest first.
    pub fn list(&self) -> Vec<JobSummary> {
        self.repo.list().iter().map(Job::summary).collect()
    }

    /// Load a persisted job and make it live again. A job that is already
    /// live is returned as-is. A job saved mid-run continues from where it
    /// stopped.
    pub async fn recover(&self, root: &Path, id: &str) -> EngineResult<Job> {
        if let Some(runner) = self.runners.read().await.get(id) {
            return Ok(runner.snapshot().await);
        }
        if !valid_job_id(id) {
            return Err(EngineError::InvalidRequest(format!("invalid job id: {}", id)));
        }
        let job = self
            .repo
            .recover(root, id)?
            .ok_or_else(|| EngineError::JobNotFound(id.to_string()))?;
        info!(job = %job.id, state = %job.state, "job recovered");
        let runner = self.register(job).await;
        Ok(runner.resume().await?)
    }

    /// Drop a job from memory. Its persisted record and staged files stay.
    pub async fn forget(&self, id: &str) -> EngineResult<()> {
        let removed = self.runners.write().await.remove(id);
        self.repo.remove(id);
        match removed {
            Some(_) => Ok(()),
            None => Err(EngineError::JobNotFound(id.to_string())),
        }
    }

    async fn register(&self, job: Job) -> Arc<AutopilotRunner> {
        let runner = Arc::new(AutopilotRunner::new(self.ctx.clone(), job));
        self.runners
            .write()
            .await
            .insert(runner.id().to_string(), runner.clone());
        runner
    }

    async fn runner(&self, id: &str) -> EngineResult<Arc<AutopilotRunner>> {
        self.runners
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::JobNotFound(id.to_string()))
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

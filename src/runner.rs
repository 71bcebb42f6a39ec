//! Autopilot runner: the per-job state machine.
//!
//! ```text
//! planning ──plan ok, ≥1 step──▶ running ──step staged──▶ awaiting-approval
//!    │  └──plan ok, 0 steps──▶ done                           │ approve
//!    └──plan call fails──▶ error          running ◀──tests── testing ◀── apply
//!                                            │
//!                                            └──no pending step──▶ done
//! any non-terminal ──abort──▶ aborted      any non-terminal ──failure──▶ error
//! ```
//!
//! # Locking
//!
//! Each runner owns its [`Job`] behind a `tokio::sync::Mutex`. The record
//! lock is held only to read inputs or to mutate and persist, never across a
//! chat, embedding or test call. A second `flow` lock serializes the
//! start/approve flows of one job. [`AutopilotRunner::abort`] takes only the
//! record lock, so it lands immediately even while a flow is waiting on the
//! network; when that flow re-acquires the record and finds it terminal, it
//! drops its result.
//!
//! Every mutation appends to the job log and is persisted through the
//! [`JobRepository`] before the lock is released.

use anyhow::Result;
use chrono::Utc;
use serde::{Serialize, Serializer};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::chat::ChatRouter;
use crate::config::Config;
use crate::embedding::Embedder;
use crate::error::{EngineError, EngineResult};
use crate::indexer::{pack_context, search_index};
use crate::models::{Job, JobState, LogEntry, Step, StepStatus};
use crate::prompts::{self, StepBrief};
use crate::stager::{self, normalize_target};
use crate::store::JobRepository;
use crate::test_runner;

/// Collaborators shared by every runner of an engine.
pub struct AutopilotContext {
    pub config: Arc<Config>,
    pub chat: Arc<ChatRouter>,
    pub embedder: Arc<dyn Embedder>,
    pub repo: Arc<dyn JobRepository>,
}

/// Which staged files an approval covers.
#[derive(Debug, Clone, PartialEq)]
pub enum AppliedFiles {
    All,
    Only(Vec<String>),
}

impl Serialize for AppliedFiles {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            AppliedFiles::All => serializer.serialize_str("all"),
            AppliedFiles::Only(files) => files.serialize(serializer),
        }
    }
}

/// Result of approving the waiting step.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApproveOutcome {
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waiting_step_id: Option<String>,
    /// 1-based position of the step that was approved.
    pub current_step: usize,
    pub total_steps: usize,
    pub applied: usize,
    pub skipped: usize,
    pub applied_files: AppliedFiles,
}

pub struct AutopilotRunner {
    id: String,
    root: PathBuf,
    ctx: Arc<AutopilotContext>,
    job: Mutex<Job>,
    flow: Mutex<()>,
}

fn record(job: &mut Job, message: impl Into<String>) {
    let message = message.into();
    info!(job = %job.id, state = %job.state, "{}", message);
    job.log.push(LogEntry {
        time: Utc::now(),
        message,
    });
}

/// Short random step identifier.
fn step_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

impl AutopilotRunner {
    /// Wrap a job record (fresh or recovered from disk).
    pub fn new(ctx: Arc<AutopilotContext>, job: Job) -> Self {
        Self {
            id: job.id.clone(),
            root: PathBuf::from(&job.workspace_root),
            ctx,
            job: Mutex::new(job),
            flow: Mutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn snapshot(&self) -> Job {
        self.job.lock().await.clone()
    }

    fn persist(&self, job: &mut Job) -> Result<()> {
        job.updated_at = Utc::now();
        self.ctx.repo.put(job)
    }

    // ============ Flows ============

    /// Plan the job and stage its first step, stopping at the first
    /// approval pause or terminal state.
    pub async fn start(&self) -> Result<Job> {
        let _flow = self.flow.lock().await;
        self.plan().await?;
        self.advance().await?;
        Ok(self.snapshot().await)
    }

    /// Continue a job that was persisted mid-flow. Interrupted tests are
    /// rerun for the applied step. Paused and terminal jobs are left alone.
    pub async fn resume(&self) -> Result<Job> {
        let _flow = self.flow.lock().await;
        let (state, applied) = {
            let mut job = self.job.lock().await;
            if !matches!(
                job.state,
                JobState::Planning | JobState::Running | JobState::Testing
            ) {
                return Ok(job.clone());
            }
            let message = format!("Resuming {} job after restart.", job.state);
            record(&mut job, message);
            self.persist(&mut job)?;
            let applied = job
                .steps
                .iter()
                .find(|s| s.status == StepStatus::Applied)
                .map(|s| s.id.clone());
            (job.state, applied)
        };

        match (state, applied) {
            (JobState::Planning, _) => self.plan().await?,
            (JobState::Testing, Some(step_id)) => self.run_tests_for_step(&step_id).await?,
            (JobState::Testing, None) => {
                let mut job = self.job.lock().await;
                job.state = JobState::Running;
                self.persist(&mut job)?;
            }
            _ => {}
        }
        self.advance().await?;
        Ok(self.snapshot().await)
    }

    /// Approve the waiting step, apply it, test it and move on to the next.
    pub async fn approve(
        &self,
        selected_files: Option<Vec<String>>,
        approve_all: bool,
    ) -> EngineResult<ApproveOutcome> {
        let _flow = self.flow.lock().await;

        let selection = match selected_files {
            Some(files) if !approve_all && !files.is_empty() => Some(
                files
                    .iter()
                    .filter_map(|f| normalize_target(&self.ctx.config, f).ok())
                    .collect::<Vec<_>>(),
            ),
            _ => None,
        };

        let (step_id, applied, skipped) = self.apply_approved(selection.as_deref()).await?;
        self.run_tests_for_step(&step_id).await?;
        self.advance().await?;

        let job = self.snapshot().await;
        Ok(ApproveOutcome {
            state: job.state,
            waiting_step_id: job.waiting_step_id.clone(),
            current_step: job.step_index(&step_id).map(|i| i + 1).unwrap_or(0),
            total_steps: job.steps.len(),
            applied,
            skipped,
            applied_files: match selection {
                Some(files) => AppliedFiles::Only(files),
                None => AppliedFiles::All,
            },
        })
    }

    // ============ Operations ============

    /// Ask the chat capability for a step plan.
    pub async fn plan(&self) -> Result<()> {
        let (provider, model, goal) = {
            let mut job = self.job.lock().await;
            if job.state != JobState::Planning {
                debug!(job = %job.id, state = %job.state, "plan skipped");
                return Ok(());
            }
            record(&mut job, "Planning steps…");
            self.persist(&mut job)?;
            (job.provider.clone(), job.model.clone(), job.goal_prompt.clone())
        };

        let retrieval = &self.ctx.config.retrieval;
        let (context, context_note) = self
            .gather_context(&goal, retrieval.plan_k, retrieval.plan_budget_chars)
            .await;

        let planning = &self.ctx.config.planning;
        let request = prompts::plan_request(
            &provider,
            &model,
            &goal,
            &context,
            (planning.min_steps, planning.max_steps),
            self.ctx.config.chat.plan_max_tokens,
        );
        let response = self.ctx.chat.chat(&request).await;

        let mut job = self.job.lock().await;
        if job.state.is_terminal() {
            debug!(job = %job.id, "plan result discarded");
            return Ok(());
        }
        if let Some(note) = context_note {
            record(&mut job, note);
        }

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                job.state = JobState::Error;
                job.waiting_step_id = None;
                record(&mut job, format!("Planning failed: {:#}", e));
                return self.persist(&mut job);
            }
        };
        if let Some(warn) = &response.warn {
            record(
                &mut job,
                format!("Chat provider '{}' degraded: {}", response.provider, warn),
            );
        }

        let outcome = prompts::interpret_plan(&response.content);
        if let Some(note) = outcome.note {
            record(&mut job, note);
        }

        let mut planned = outcome.steps;
        if planned.len() > planning.max_steps {
            record(
                &mut job,
                format!(
                    "Plan proposed {} steps; keeping the first {}.",
                    planned.len(),
                    planning.max_steps
                ),
            );
            planned.truncate(planning.max_steps);
        }

        let config = &self.ctx.config;
        job.steps = planned
            .into_iter()
            .map(|p| {
                let mut step = Step::new(step_id(), p.title);
                step.rationale = p.rationale;
                step.target_files = p.target_files.map(|files| {
                    files
                        .iter()
                        .filter_map(|f| normalize_target(config, f).ok())
                        .collect()
                });
                step
            })
            .collect();

        if job.steps.is_empty() {
            job.state = JobState::Done;
            job.waiting_step_id = None;
            record(&mut job, "No steps planned - job complete.");
        } else {
            job.state = JobState::Running;
            let n = job.steps.len();
            record(&mut job, format!("Planned {} step(s).", n));
        }
        self.persist(&mut job)
    }

    /// Request patches for `step_id`, stage them and pause for approval.
    pub async fn execute_step(&self, step_id: &str) -> Result<()> {
        let (provider, model, goal, title, rationale, target_files) = {
            let mut job = self.job.lock().await;
            if job.state != JobState::Running {
                debug!(job = %job.id, state = %job.state, "execute skipped");
                return Ok(());
            }
            let Some(step) = job.step(step_id) else {
                anyhow::bail!("Unknown step {} in job {}", step_id, job.id);
            };
            let brief = (
                step.title.clone(),
                step.rationale.clone(),
                step.target_files.clone().unwrap_or_default(),
            );
            record(&mut job, format!("Executing: {}", brief.0));
            self.persist(&mut job)?;
            (
                job.provider.clone(),
                job.model.clone(),
                job.goal_prompt.clone(),
                brief.0,
                brief.1,
                brief.2,
            )
        };

        let query = match &rationale {
            Some(r) => format!("{} {}", title, r),
            None => title.clone(),
        };
        let retrieval = &self.ctx.config.retrieval;
        let (context, context_note) = self
            .gather_context(&query, retrieval.step_k, retrieval.step_budget_chars)
            .await;
        let steering = self.read_steering();

        let request = prompts::patch_request(
            &provider,
            &model,
            &StepBrief {
                goal: &goal,
                title: &title,
                rationale: rationale.as_deref(),
                target_files: &target_files,
                steering: steering.as_deref(),
                context: &context,
            },
            self.ctx.config.chat.patch_max_tokens,
        );
        let response = self.ctx.chat.chat(&request).await;

        let mut job = self.job.lock().await;
        if job.state.is_terminal() {
            debug!(job = %job.id, step = step_id, "step result discarded");
            return Ok(());
        }
        if let Some(note) = context_note {
            record(&mut job, note);
        }

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                let message = format!("{:#}", e);
                let log = format!("Step execution failed: {}", message);
                return self.fail_locked(&mut job, Some(step_id), &log, message);
            }
        };
        if let Some(warn) = &response.warn {
            record(
                &mut job,
                format!("Chat provider '{}' degraded: {}", response.provider, warn),
            );
        }

        let outcome = prompts::interpret_patches(&response.content);
        for note in outcome.notes {
            record(&mut job, note);
        }

        let report = match stager::stage(&self.ctx.config, &self.root, &outcome.patches) {
            Ok(r) => r,
            Err(e) => {
                let message = format!("{:#}", e);
                let log = format!("Staging failed: {}", message);
                return self.fail_locked(&mut job, Some(step_id), &log, message);
            }
        };
        for message in &report.messages {
            record(&mut job, message.clone());
        }

        if let Some(step) = job.step_mut(step_id) {
            step.patches = Some(report.patches);
            step.status = StepStatus::Staged;
        }
        job.state = JobState::AwaitingApproval;
        job.waiting_step_id = Some(step_id.to_string());
        record(
            &mut job,
            format!(
                "Staged {} file(s) for review. Awaiting approval.",
                report.staged
            ),
        );
        self.persist(&mut job)
    }

    /// Promote the waiting step's approved patches into the workspace.
    ///
    /// Returns `(step_id, applied, skipped)`.
    pub async fn apply_approved(&self, selection: Option<&[String]>) -> EngineResult<(String, usize, usize)> {
        let mut job = self.job.lock().await;
        if job.state.is_terminal() {
            return Err(EngineError::JobTerminal {
                id: job.id.clone(),
                state: job.state,
            });
        }
        let step_id = match (&job.state, job.waiting_step().map(|s| s.id.clone())) {
            (JobState::AwaitingApproval, Some(id)) => id,
            _ => return Err(EngineError::NoWaitingStep(job.id.clone())),
        };

        match selection {
            Some(files) => record(
                &mut job,
                format!("Selective approval: applying {} selected file(s)", files.len()),
            ),
            None => record(&mut job, "Full approval: applying all staged files"),
        }

        let job_id = job.id.clone();
        let patches = {
            let Some(step) = job.step_mut(&step_id) else {
                return Err(EngineError::NoWaitingStep(job_id));
            };
            let mut patches = step.patches.take().unwrap_or_default();
            for patch in &mut patches {
                patch.approved = selection
                    .map(|files| files.iter().any(|f| f == &patch.target_file))
                    .unwrap_or(true);
            }
            step.status = StepStatus::Approved;
            step.patches = Some(patches.clone());
            patches
        };
        job.waiting_step_id = None;
        job.state = JobState::Running;

        if patches.is_empty() {
            if let Some(step) = job.step_mut(&step_id) {
                step.status = StepStatus::Applied;
            }
            let title = job.step(&step_id).map(|s| s.title.clone()).unwrap_or_default();
            record(&mut job, format!("No patches to apply for step: {}", title));
            self.persist(&mut job)?;
            return Ok((step_id, 0, 0));
        }

        let report = match stager::promote(&self.ctx.config, &self.root, &patches, selection) {
            Ok(r) => r,
            Err(e) => {
                let message = format!("{:#}", e);
                let log = format!("Apply failed: {}", message);
                self.fail_locked(&mut job, Some(&step_id), &log, message)?;
                return Err(EngineError::Internal(e));
            }
        };
        for message in &report.messages {
            record(&mut job, message.clone());
        }
        if let Some(step) = job.step_mut(&step_id) {
            step.status = StepStatus::Applied;
        }
        record(
            &mut job,
            format!(
                "Applied {} file(s), skipped {} file(s) to workspace.",
                report.applied,
                report.skipped + report.missing
            ),
        );
        self.persist(&mut job)?;
        Ok((step_id, report.applied, report.skipped))
    }

    /// Run the workspace tests and record the result on `step_id`.
    ///
    /// Test failures are data: the job returns to `running` either way.
    pub async fn run_tests_for_step(&self, step_id: &str) -> Result<()> {
        {
            let mut job = self.job.lock().await;
            if job.state.is_terminal() {
                return Ok(());
            }
            job.state = JobState::Testing;
            let title = job.step(step_id).map(|s| s.title.clone()).unwrap_or_default();
            record(&mut job, format!("Running tests for step: {}", title));
            self.persist(&mut job)?;
        }

        let result = test_runner::run_tests(&self.ctx.config, &self.root).await;

        let mut job = self.job.lock().await;
        if job.state.is_terminal() {
            debug!(job = %job.id, step = step_id, "test result discarded");
            return Ok(());
        }
        let passed = result.passed;
        if let Some(step) = job.step_mut(step_id) {
            step.test_result = Some(result);
            step.status = StepStatus::Tested;
        }
        job.state = JobState::Running;
        record(&mut job, if passed { "Tests passed." } else { "Tests failed." });
        self.persist(&mut job)
    }

    /// Execute the next pending step, or finish the job when none is left.
    pub async fn advance(&self) -> Result<()> {
        let next = {
            let mut job = self.job.lock().await;
            if job.state != JobState::Running {
                return Ok(());
            }
            match job.steps.iter().find(|s| s.status == StepStatus::Pending) {
                Some(step) => step.id.clone(),
                None => {
                    job.state = JobState::Done;
                    job.waiting_step_id = None;
                    record(&mut job, "All steps completed.");
                    return self.persist(&mut job);
                }
            }
        };
        self.execute_step(&next).await
    }

    /// Move a non-terminal job to `aborted`.
    pub async fn abort(&self) -> EngineResult<Job> {
        let mut job = self.job.lock().await;
        if job.state.is_terminal() {
            return Err(EngineError::JobTerminal {
                id: job.id.clone(),
                state: job.state,
            });
        }
        job.state = JobState::Aborted;
        job.waiting_step_id = None;
        record(&mut job, "Job aborted by user.");
        self.persist(&mut job)?;
        Ok(job.clone())
    }

    /// Move a non-terminal job to `error`, recording `message` on the
    /// waiting step if there is one.
    pub async fn fail(&self, message: &str) -> Result<()> {
        let mut job = self.job.lock().await;
        if job.state.is_terminal() {
            return Ok(());
        }
        let step = job.waiting_step_id.clone();
        self.fail_locked(&mut job, step.as_deref(), message, message.to_string())
    }

    fn fail_locked(
        &self,
        job: &mut Job,
        step_id: Option<&str>,
        log_message: &str,
        step_error: String,
    ) -> Result<()> {
        if let Some(step) = step_id
            .and_then(|id| job.step_mut(id))
            .filter(|s| !s.status.is_absorbing())
        {
            step.status = StepStatus::Error;
            step.error = Some(step_error);
        }
        job.state = JobState::Error;
        job.waiting_step_id = None;
        warn!(job = %job.id, "{}", log_message);
        record(job, log_message);
        self.persist(job)
    }

    // ============ Helpers ============

    /// Search the index and pack the matches. Failures degrade to no
    /// context plus a note for the job log.
    async fn gather_context(&self, query: &str, k: usize, budget: usize) -> (String, Option<String>) {
        if !self.ctx.config.embedding.is_enabled() {
            return (String::new(), None);
        }
        match search_index(
            &self.ctx.config,
            &self.root,
            self.ctx.embedder.as_ref(),
            query,
            k,
        )
        .await
        {
            Ok(matches) => (pack_context(&matches, budget), None),
            Err(e) => {
                warn!(job = %self.id, error = %e, "context search failed");
                (String::new(), Some(format!("Context search failed: {:#}", e)))
            }
        }
    }

    fn read_steering(&self) -> Option<String> {
        let path = self.root.join(&self.ctx.config.workspace.steering_file);
        std::fs::read_to_string(path)
            .ok()
            .filter(|s| !s.trim().is_empty())
    }
}

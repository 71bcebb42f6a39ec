//! Core data models used throughout stepwise.
//!
//! These types represent the index, the patches proposed by the model, and
//! the jobs and steps driven by the autopilot runner. Everything here is a
//! plain serde record: jobs and indexes are persisted as camelCase JSON with
//! kebab-case enum values, so a record written by one engine process can be
//! loaded verbatim by the next.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============ Index ============

/// One embedded, line-bounded chunk of a workspace file.
///
/// `id` is derived from `(file_path, line_start, line_end, content_hash)`,
/// so rebuilding an unchanged workspace yields identical items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexItem {
    pub id: String,
    /// Workspace-relative path with forward slashes.
    pub file_path: String,
    /// 1-based, inclusive.
    pub line_start: usize,
    /// 1-based, inclusive.
    pub line_end: usize,
    pub text: String,
    pub vector: Vec<f32>,
    pub content_hash: String,
}

/// The searchable index of one workspace root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Index {
    pub embedding_model_id: String,
    pub updated_at: DateTime<Utc>,
    pub items: Vec<IndexItem>,
}

/// An [`IndexItem`] paired with its similarity to a query.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredItem {
    #[serde(flatten)]
    pub item: IndexItem,
    pub score: f32,
}

// ============ Patches ============

/// How a [`PatchHunk`] describes its change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PatchMode {
    /// `new_content` is the complete file after the edit.
    WholeFile,
    /// `unified_diff` is applied against the file currently on disk.
    DiffHunks,
}

impl PatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatchMode::WholeFile => "whole-file",
            PatchMode::DiffHunks => "diff-hunks",
        }
    }
}

/// A proposed change to exactly one workspace file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchHunk {
    pub target_file: String,
    pub mode: PatchMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unified_diff: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default)]
    pub approved: bool,
}

impl PatchHunk {
    pub fn whole_file(target: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            target_file: target.into(),
            mode: PatchMode::WholeFile,
            new_content: Some(content.into()),
            unified_diff: None,
            explanation: None,
            approved: false,
        }
    }

    pub fn diff_hunks(target: impl Into<String>, diff: impl Into<String>) -> Self {
        Self {
            target_file: target.into(),
            mode: PatchMode::DiffHunks,
            new_content: None,
            unified_diff: Some(diff.into()),
            explanation: None,
            approved: false,
        }
    }

    pub fn with_explanation(mut self, explanation: impl Into<String>) -> Self {
        self.explanation = Some(explanation.into());
        self
    }
}

// ============ Steps ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepStatus {
    Pending,
    Staged,
    Approved,
    Applied,
    Tested,
    Error,
    Skipped,
}

impl StepStatus {
    /// `Error` and `Skipped` absorb; no further step transitions apply.
    pub fn is_absorbing(&self) -> bool {
        matches!(self, StepStatus::Error | StepStatus::Skipped)
    }
}

/// Outcome of running the workspace test command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub passed: bool,
    pub output: String,
}

/// One planned unit of work within a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_files: Option<Vec<String>>,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patches: Option<Vec<PatchHunk>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_result: Option<TestResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Step {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            rationale: None,
            target_files: None,
            status: StepStatus::Pending,
            patches: None,
            test_result: None,
            error: None,
        }
    }

    /// Files proposed by this step's patches, in patch order.
    pub fn patch_files(&self) -> Vec<String> {
        self.patches
            .iter()
            .flatten()
            .map(|p| p.target_file.clone())
            .collect()
    }
}

// ============ Jobs ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    Planning,
    Running,
    AwaitingApproval,
    Testing,
    Done,
    Aborted,
    Error,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Aborted | JobState::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Planning => "planning",
            JobState::Running => "running",
            JobState::AwaitingApproval => "awaiting-approval",
            JobState::Testing => "testing",
            JobState::Done => "done",
            JobState::Aborted => "aborted",
            JobState::Error => "error",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub time: DateTime<Utc>,
    pub message: String,
}

/// One end-to-end autopilot run for a single goal against one workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub workspace_root: String,
    pub provider: String,
    pub model: String,
    pub goal_prompt: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub state: JobState,
    pub steps: Vec<Step>,
    pub log: Vec<LogEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waiting_step_id: Option<String>,
}

impl Job {
    pub fn new(
        id: impl Into<String>,
        workspace_root: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
        goal_prompt: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            workspace_root: workspace_root.into(),
            provider: provider.into(),
            model: model.into(),
            goal_prompt: goal_prompt.into(),
            created_at: now,
            updated_at: now,
            state: JobState::Planning,
            steps: Vec::new(),
            log: Vec::new(),
            waiting_step_id: None,
        }
    }

    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == step_id)
    }

    pub fn step_index(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == step_id)
    }

    pub fn waiting_step(&self) -> Option<&Step> {
        self.waiting_step_id.as_deref().and_then(|id| self.step(id))
    }

    pub fn summary(&self) -> JobSummary {
        const PREVIEW_CHARS: usize = 100;
        let mut goal_preview: String = self.goal_prompt.chars().take(PREVIEW_CHARS).collect();
        if self.goal_prompt.chars().count() > PREVIEW_CHARS {
            goal_preview.push_str("...");
        }
        JobSummary {
            id: self.id.clone(),
            state: self.state,
            goal_preview,
            created_at: self.created_at,
            step_count: self.steps.len(),
        }
    }
}

/// Lightweight listing entry for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub id: String,
    pub state: JobState,
    pub goal_preview: String,
    pub created_at: DateTime<Utc>,
    pub step_count: usize,
}

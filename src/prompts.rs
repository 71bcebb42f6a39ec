//! Chat request construction and response interpretation for the runner.
//!
//! Two exchanges drive a job: the **plan** request returns a list of steps,
//! and one **patch** request per step returns proposed file changes. Both
//! responses go through [`crate::extract`] and are read leniently: field
//! names and mode spellings the models commonly produce are accepted, and
//! anything unusable turns into a note for the job log instead of an error.

use serde_json::Value;

use crate::chat::{ChatMessage, ChatRequest};
use crate::extract::extract_json;
use crate::models::{PatchHunk, PatchMode};

pub const FALLBACK_STEP_TITLE: &str = "Implement requested change";

const RAW_PREVIEW_CHARS: usize = 200;

fn plan_system(min_steps: usize, max_steps: usize) -> String {
    format!(
        r#"You are AUTOPILOT for a local code editor. Return ONLY valid JSON: no markdown, no code fences, no explanatory text.

Schema:
{{
  "steps": [
    {{
      "title": "short imperative",
      "rationale": "why this step",
      "targetFiles": ["relative/path.rs"]
    }}
  ]
}}

Rules:
- {min}-{max} steps.
- targetFiles are workspace-relative and may be empty.
- Start with {{ and end with }}."#,
        min = min_steps,
        max = max_steps
    )
}

const PATCH_SYSTEM: &str = r#"You are a software editor. Return ONLY valid JSON: no markdown, no code fences, no explanatory text.

Schema:
{
  "patches": [
    {
      "targetFile": "<workspace-relative path>",
      "mode": "whole-file" | "diff-hunks",
      "newContent": "<full file after edits, for whole-file>",
      "unifiedDiff": "<unified diff against the current file, for diff-hunks>",
      "explanation": "<what changed and why>"
    }
  ]
}

Rules:
- Use "whole-file" for new files, small files, or complete rewrites.
- Use "diff-hunks" for targeted changes in large files.
- If nothing needs to change, return {"patches": []}."#;

/// One step as proposed by the planner.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedStep {
    pub title: String,
    pub rationale: Option<String>,
    pub target_files: Option<Vec<String>>,
}

impl PlannedStep {
    fn fallback(rationale: &str) -> Self {
        Self {
            title: FALLBACK_STEP_TITLE.to_string(),
            rationale: Some(rationale.to_string()),
            target_files: None,
        }
    }
}

#[derive(Debug)]
pub struct PlanOutcome {
    pub steps: Vec<PlannedStep>,
    /// Set when the response could not be used as-is.
    pub note: Option<String>,
}

#[derive(Debug, Default)]
pub struct PatchOutcome {
    pub patches: Vec<PatchHunk>,
    pub notes: Vec<String>,
}

pub fn plan_request(
    provider: &str,
    model: &str,
    goal: &str,
    context: &str,
    (min_steps, max_steps): (usize, usize),
    max_tokens: u32,
) -> ChatRequest {
    let mut user = format!("GOAL:\n{}\n\n", goal);
    if !context.is_empty() {
        user.push_str(context);
        user.push('\n');
    }
    user.push_str("Return only the plan JSON.");

    ChatRequest {
        provider: provider.to_string(),
        model: model.to_string(),
        messages: vec![
            ChatMessage::system(plan_system(min_steps, max_steps)),
            ChatMessage::user(user),
        ],
        max_tokens: Some(max_tokens),
    }
}

/// Inputs for one step's patch request.
pub struct StepBrief<'a> {
    pub goal: &'a str,
    pub title: &'a str,
    pub rationale: Option<&'a str>,
    pub target_files: &'a [String],
    pub steering: Option<&'a str>,
    pub context: &'a str,
}

pub fn patch_request(provider: &str, model: &str, brief: &StepBrief<'_>, max_tokens: u32) -> ChatRequest {
    let mut sections = vec![format!("PROJECT GOAL: {}", brief.goal)];

    let mut step = format!("STEP GOAL: {}", brief.title);
    if let Some(r) = brief.rationale {
        step.push_str(&format!("\nRATIONALE: {}", r));
    }
    sections.push(step);

    if !brief.target_files.is_empty() {
        sections.push(format!("TARGET FILES: {}", brief.target_files.join(", ")));
    }
    if let Some(s) = brief.steering.filter(|s| !s.trim().is_empty()) {
        sections.push(format!("STEERING:\n{}", s.trim_end()));
    }
    if !brief.context.is_empty() {
        sections.push(brief.context.to_string());
    }

    let user = format!("{}\n\nRespond only with JSON per schema.", sections.join("\n\n"));

    ChatRequest {
        provider: provider.to_string(),
        model: model.to_string(),
        messages: vec![ChatMessage::system(PATCH_SYSTEM), ChatMessage::user(user)],
        max_tokens: Some(max_tokens),
    }
}

/// Interpret a plan response.
///
/// An explicit empty `steps` array is a valid zero-step plan. Unparsable
/// output, or output without a `steps` array, becomes a single generic step.
pub fn interpret_plan(raw: &str) -> PlanOutcome {
    let value = match extract_json(raw) {
        Ok(v) => v,
        Err(e) => {
            return PlanOutcome {
                steps: vec![PlannedStep::fallback("default fallback")],
                note: Some(format!(
                    "Plan parsing failed: {}. Raw content: {}",
                    e,
                    preview(raw)
                )),
            }
        }
    };

    let Some(items) = value.get("steps").and_then(Value::as_array) else {
        return PlanOutcome {
            steps: vec![PlannedStep::fallback("default")],
            note: Some("Plan had no steps array; using a single generic step.".to_string()),
        };
    };

    let steps = items
        .iter()
        .map(|s| PlannedStep {
            title: s
                .get("title")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .unwrap_or("Step")
                .to_string(),
            rationale: s
                .get("rationale")
                .and_then(Value::as_str)
                .map(String::from),
            target_files: s
                .get("targetFiles")
                .or_else(|| s.get("target_files"))
                .and_then(Value::as_array)
                .map(|files| {
                    files
                        .iter()
                        .filter_map(Value::as_str)
                        .map(String::from)
                        .collect()
                }),
        })
        .collect();

    PlanOutcome { steps, note: None }
}

/// Interpret a patch response. Never fails; unusable entries are noted.
pub fn interpret_patches(raw: &str) -> PatchOutcome {
    let mut outcome = PatchOutcome::default();

    let value = match extract_json(raw) {
        Ok(v) => v,
        Err(e) => {
            outcome.notes.push(format!(
                "Patch parsing failed: {}. Raw content: {}",
                e,
                preview(raw)
            ));
            return outcome;
        }
    };

    let Some(items) = value.get("patches").and_then(Value::as_array) else {
        outcome
            .notes
            .push("Response had no patches array; nothing to stage.".to_string());
        return outcome;
    };

    for item in items {
        let Some(target) = str_field(item, &["targetFile", "file", "path"]) else {
            outcome.notes.push("Skipping patch without a target file".to_string());
            continue;
        };
        let new_content = str_field(item, &["newContent", "content"]);
        let unified_diff = str_field(item, &["unifiedDiff", "diff"]);

        let mode = match str_field(item, &["mode"]).as_deref() {
            Some("whole-file" | "wholeFile" | "replaceWhole" | "replace") => PatchMode::WholeFile,
            Some("diff-hunks" | "diffHunks" | "hunks" | "diff") => PatchMode::DiffHunks,
            None if unified_diff.is_some() && new_content.is_none() => PatchMode::DiffHunks,
            None => PatchMode::WholeFile,
            Some(other) => {
                outcome
                    .notes
                    .push(format!("Skipping {}: unknown patch mode '{}'", target, other));
                continue;
            }
        };

        outcome.patches.push(PatchHunk {
            target_file: target,
            mode,
            new_content: if mode == PatchMode::WholeFile { new_content } else { None },
            unified_diff: if mode == PatchMode::DiffHunks { unified_diff } else { None },
            explanation: str_field(item, &["explanation"]),
            approved: false,
        });
    }

    outcome
}

fn str_field(item: &Value, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|n| item.get(*n).and_then(Value::as_str))
        .map(String::from)
}

fn preview(raw: &str) -> String {
    raw.chars().take(RAW_PREVIEW_CHARS).collect()
}

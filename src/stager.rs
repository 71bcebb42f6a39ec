//! Patch staging area.
//!
//! Proposed file contents are written under `<root>/<state_dir>/staging/`,
//! mirroring workspace-relative paths, and only reach the live workspace
//! when [`promote`] copies them over. Each staged file carries sibling
//! artifacts:
//!
//! | Artifact | Content |
//! |----------|---------|
//! | `<rel>` | staged file content |
//! | `<rel>.explain.txt` | model explanation (may be empty) |
//! | `<rel>.mode.txt` | `whole-file` or `diff-hunks` |
//! | `<rel>.diff.txt` | the unified diff (diff-hunks only) |
//!
//! Every target path goes through [`normalize_target`] both when staging and
//! again right before promotion. Per-patch problems (bad paths, bad diffs,
//! missing payloads) never fail a batch; they are counted and described in
//! the returned report. Only I/O failures on the staging area itself are
//! errors.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::{state_path, Config};
use crate::diff::apply_unified_diff;
use crate::models::{PatchHunk, PatchMode};

const EXPLAIN_SUFFIX: &str = ".explain.txt";
const MODE_SUFFIX: &str = ".mode.txt";
const DIFF_SUFFIX: &str = ".diff.txt";

/// Outcome of [`stage`].
#[derive(Debug, Default)]
pub struct StageReport {
    pub staged: usize,
    pub rejected: usize,
    /// Accepted patches with normalized targets, all `approved = false`.
    pub patches: Vec<PatchHunk>,
    /// Human-readable notes for the job log.
    pub messages: Vec<String>,
}

/// Outcome of [`promote`].
#[derive(Debug, Default)]
pub struct PromoteReport {
    pub applied: usize,
    pub skipped: usize,
    /// Selected patches with no staged artifact left.
    pub missing: usize,
    pub applied_files: Vec<String>,
    pub messages: Vec<String>,
}

/// Normalize a model-supplied target path to a workspace-relative one.
///
/// Backslashes become `/`, leading slashes and `.` segments are dropped.
/// Paths that are empty, carry a drive prefix, contain `..`, or point into
/// the state directory are rejected.
pub fn normalize_target(config: &Config, target: &str) -> Result<String, String> {
    let unified = target.trim().replace('\\', "/");
    let stripped = unified.trim_start_matches('/');

    let mut parts: Vec<&str> = Vec::new();
    for segment in stripped.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(format!("path escapes the workspace: {}", target)),
            s if parts.is_empty() && s.contains(':') => {
                return Err(format!("absolute path not allowed: {}", target));
            }
            s => parts.push(s),
        }
    }

    if parts.is_empty() {
        return Err("empty target path".to_string());
    }
    let state_dir = config.workspace.state_dir.trim_matches('/');
    if parts[0] == state_dir {
        return Err(format!("path inside state directory: {}", target));
    }

    Ok(parts.join("/"))
}

pub fn staging_root(config: &Config, root: &Path) -> PathBuf {
    state_path(config, root, &["staging"])
}

fn staged_path(config: &Config, root: &Path, rel: &str) -> PathBuf {
    staging_root(config, root).join(rel)
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

/// Stage `patches` for review.
pub fn stage(config: &Config, root: &Path, patches: &[PatchHunk]) -> Result<StageReport> {
    let mut report = StageReport::default();

    for patch in patches {
        let rel = match normalize_target(config, &patch.target_file) {
            Ok(rel) => rel,
            Err(reason) => {
                warn!(target_file = %patch.target_file, %reason, "rejected patch");
                report.rejected += 1;
                report.messages.push(format!("Skipping invalid path: {}", reason));
                continue;
            }
        };

        let content = match patch.mode {
            PatchMode::WholeFile => match &patch.new_content {
                Some(content) => content.clone(),
                None => {
                    report.rejected += 1;
                    report
                        .messages
                        .push(format!("Missing newContent for whole-file patch: {}", rel));
                    continue;
                }
            },
            PatchMode::DiffHunks => {
                let Some(diff) = &patch.unified_diff else {
                    report.rejected += 1;
                    report
                        .messages
                        .push(format!("Missing unifiedDiff for diff-hunks patch: {}", rel));
                    continue;
                };
                let original = read_or_empty(&root.join(&rel));
                match apply_unified_diff(&original, diff) {
                    Ok(result) => {
                        debug!(file = %rel, hunks = result.hunks_applied, "applied diff");
                        result.patched
                    }
                    Err(e) => {
                        warn!(file = %rel, error = %e, "diff failed, staging original content");
                        report
                            .messages
                            .push(format!("Diff application failed for {}: {}; keeping original", rel, e));
                        original
                    }
                }
            }
        };

        write_artifacts(config, root, &rel, patch, &content)?;

        let mut accepted = patch.clone();
        accepted.target_file = rel;
        accepted.approved = false;
        report.patches.push(accepted);
        report.staged += 1;
    }

    Ok(report)
}

fn write_artifacts(
    config: &Config,
    root: &Path,
    rel: &str,
    patch: &PatchHunk,
    content: &str,
) -> Result<()> {
    let staged = staged_path(config, root, rel);
    if let Some(parent) = staged.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create staging dir: {}", parent.display()))?;
    }

    fs::write(&staged, content)
        .with_context(|| format!("Failed to write staged file: {}", staged.display()))?;
    fs::write(
        sibling(&staged, EXPLAIN_SUFFIX),
        patch.explanation.as_deref().unwrap_or(""),
    )?;
    fs::write(sibling(&staged, MODE_SUFFIX), patch.mode.as_str())?;

    let diff_path = sibling(&staged, DIFF_SUFFIX);
    match (&patch.mode, &patch.unified_diff) {
        (PatchMode::DiffHunks, Some(diff)) => fs::write(&diff_path, diff)?,
        // Restaging as whole-file must not leave an older diff behind.
        _ => remove_if_exists(&diff_path)?,
    }

    Ok(())
}

/// Copy staged content into the workspace.
///
/// With `selected = None` every patch is promoted. With a selection, a patch
/// is promoted only when its file is selected and it is marked approved;
/// the rest are skipped and stay staged.
pub fn promote(
    config: &Config,
    root: &Path,
    patches: &[PatchHunk],
    selected: Option<&[String]>,
) -> Result<PromoteReport> {
    let mut report = PromoteReport::default();

    for patch in patches {
        if let Some(selected) = selected {
            if !selected.iter().any(|f| f == &patch.target_file) {
                report.skipped += 1;
                report
                    .messages
                    .push(format!("Skipped {} (not in selected files)", patch.target_file));
                continue;
            }
            if !patch.approved {
                report.skipped += 1;
                report
                    .messages
                    .push(format!("Skipped {} (not approved)", patch.target_file));
                continue;
            }
        }

        let rel = match normalize_target(config, &patch.target_file) {
            Ok(rel) => rel,
            Err(reason) => {
                warn!(target_file = %patch.target_file, %reason, "refusing to promote");
                report.skipped += 1;
                report.messages.push(format!("Skipping invalid target path: {}", reason));
                continue;
            }
        };

        let staged = staged_path(config, root, &rel);
        if !staged.is_file() {
            report.missing += 1;
            report
                .messages
                .push(format!("No staged content found for: {}", rel));
            continue;
        }

        let data = fs::read(&staged)
            .with_context(|| format!("Failed to read staged file: {}", staged.display()))?;
        let target = root.join(&rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        fs::write(&target, data)
            .with_context(|| format!("Failed to write workspace file: {}", target.display()))?;

        remove_artifacts(config, root, &rel)?;

        report.applied += 1;
        report
            .messages
            .push(format!("Applied {} patch to {}", patch.mode.as_str(), rel));
        report.applied_files.push(rel);
    }

    Ok(report)
}

/// Remove every staged artifact for `file`. Returns whether anything was
/// staged. The workspace copy is never touched.
pub fn discard(config: &Config, root: &Path, file: &str) -> Result<bool> {
    let rel = normalize_target(config, file).map_err(anyhow::Error::msg)?;
    let existed = staged_path(config, root, &rel).exists();
    remove_artifacts(config, root, &rel)?;
    Ok(existed)
}

/// Workspace-relative paths of all currently staged files, sorted.
pub fn list_staged(config: &Config, root: &Path) -> Result<Vec<String>> {
    let staging = staging_root(config, root);
    if !staging.is_dir() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(&staging) {
        let entry = entry.with_context(|| format!("Failed to walk {}", staging.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(&staging) else {
            continue;
        };
        let rel = rel.to_string_lossy().replace('\\', "/");
        // The mode marker is written for every staged file.
        if let Some(file) = rel.strip_suffix(MODE_SUFFIX) {
            if staging.join(file).is_file() {
                files.push(file.to_string());
            }
        }
    }

    files.sort();
    Ok(files)
}

/// Read the staged content for `file`, if any.
pub fn read_staged(config: &Config, root: &Path, file: &str) -> Option<String> {
    let rel = normalize_target(config, file).ok()?;
    fs::read_to_string(staged_path(config, root, &rel)).ok()
}

fn remove_artifacts(config: &Config, root: &Path, rel: &str) -> Result<()> {
    let staged = staged_path(config, root, rel);
    remove_if_exists(&staged)?;
    for suffix in [EXPLAIN_SUFFIX, MODE_SUFFIX, DIFF_SUFFIX] {
        remove_if_exists(&sibling(&staged, suffix))?;
    }

    // Prune directories emptied by the removal, stopping at the staging root.
    let stop = staging_root(config, root);
    let mut dir = staged.parent().map(Path::to_path_buf);
    while let Some(d) = dir {
        if d == stop || !d.starts_with(&stop) || fs::remove_dir(&d).is_err() {
            break;
        }
        dir = d.parent().map(Path::to_path_buf);
    }
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}

fn read_or_empty(path: &Path) -> String {
    match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable file treated as empty");
            String::new()
        }
    }
}

//! Workspace content index.
//!
//! Builds, persists and queries the per-workspace embedding index stored at
//! `<root>/<state_dir>/index/index.json`.
//!
//! # Build Pipeline
//!
//! ```text
//! walk root ──▶ exclude / extension filter ──▶ chunk_lines ──▶ embed (batched) ──▶ Index
//! ```
//!
//! Files are visited in sorted relative-path order and items are content
//! addressed (see [`crate::chunk`]), so rebuilding an unchanged workspace
//! produces the same item ids and hashes. A build always replaces the
//! previous index wholesale.
//!
//! # Search
//!
//! The query is embedded with the same provider and every item is scored by
//! cosine similarity. Results are sorted descending with a stable sort, so
//! equal scores keep index order. A missing index, an empty index, or a
//! blank query all yield no matches.
//!
//! # Context Packing
//!
//! [`pack_context`] renders ranked matches into a prompt section under a
//! character budget. It is greedy by rank and stops at the first snippet
//! that does not fit; snippets are never cut.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::chunk::{chunk_lines, content_hash, item_id};
use crate::config::{state_path, Config};
use crate::embedding::{cosine_similarity, Embedder};
use crate::models::{Index, IndexItem, ScoredItem};

pub const CONTEXT_HEADER: &str = "### Project Context (top matches)";

/// Directories never descended into, at any depth.
const PRUNED_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "target",
    "dist",
    "build",
    ".next",
    ".cache",
    "coverage",
];

/// Summary reported by `index status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStatus {
    pub ready: bool,
    pub items: usize,
    pub model: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

pub fn index_path(config: &Config, root: &Path) -> PathBuf {
    state_path(config, root, &["index", "index.json"])
}

// ============ Build ============

/// Enumerate indexable files as `(relative posix path, absolute path)`.
pub fn discover_files(config: &Config, root: &Path) -> Result<Vec<(String, PathBuf)>> {
    if !root.is_dir() {
        bail!("Workspace root is not a directory: {}", root.display());
    }

    let mut excludes = vec!["**/*.min.*".to_string()];
    excludes.extend(config.index.exclude_globs.iter().cloned());
    let exclude_set = build_globset(&excludes)?;

    let state_dir = config.workspace.state_dir.trim_matches('/').to_string();
    let walker = WalkDir::new(root)
        .follow_links(config.index.follow_symlinks)
        .into_iter()
        .filter_entry(|e| {
            if e.depth() == 0 || !e.file_type().is_dir() {
                return true;
            }
            let name = e.file_name().to_string_lossy();
            name != state_dir.as_str() && !PRUNED_DIRS.contains(&&*name)
        });

    let mut files = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().replace('\\', "/");

        if exclude_set.is_match(&rel_str) {
            continue;
        }
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if !config.index.extensions.iter().any(|x| x == &ext) {
            continue;
        }

        files.push((rel_str, path.to_path_buf()));
    }

    // Sort for deterministic ordering
    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}

/// Build a fresh index for `root`. Does not save it.
pub async fn build_index(config: &Config, root: &Path, embedder: &dyn Embedder) -> Result<Index> {
    let files = discover_files(config, root)?;

    let mut pending: Vec<IndexItem> = Vec::new();
    for (rel, abs) in &files {
        let text = match fs::read_to_string(abs) {
            Ok(t) => t,
            Err(e) => {
                warn!(file = %rel, error = %e, "skipping unreadable file");
                continue;
            }
        };

        for chunk in chunk_lines(&text, config.index.max_chars, config.index.overlap_chars) {
            let hash = content_hash(&chunk.text);
            pending.push(IndexItem {
                id: item_id(rel, chunk.line_start, chunk.line_end, &hash),
                file_path: rel.clone(),
                line_start: chunk.line_start,
                line_end: chunk.line_end,
                text: chunk.text,
                vector: Vec::new(),
                content_hash: hash,
            });
        }
    }

    let batch_size = config.embedding.batch_size.max(1);
    for batch in pending.chunks_mut(batch_size) {
        let texts: Vec<String> = batch.iter().map(|i| i.text.clone()).collect();
        let vectors = embedder
            .embed_batch(&texts)
            .await
            .with_context(|| format!("Embedding failed ({})", embedder.model_name()))?;
        if vectors.len() != batch.len() {
            bail!(
                "Embedding provider returned {} vectors for {} inputs",
                vectors.len(),
                batch.len()
            );
        }
        for (item, vector) in batch.iter_mut().zip(vectors) {
            item.vector = vector;
        }
    }

    info!(
        root = %root.display(),
        files = files.len(),
        items = pending.len(),
        model = embedder.model_name(),
        "index built"
    );

    Ok(Index {
        embedding_model_id: embedder.model_name().to_string(),
        updated_at: Utc::now(),
        items: pending,
    })
}

// ============ Persistence ============

pub fn save_index(config: &Config, root: &Path, index: &Index) -> Result<()> {
    let path = index_path(config, root);
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create index dir: {}", dir.display()))?;
    }
    let json = serde_json::to_string(index)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, &path).with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

/// Build, save and report. Replaces any previous index for `root`.
pub async fn rebuild_index(config: &Config, root: &Path, embedder: &dyn Embedder) -> Result<IndexStatus> {
    let index = build_index(config, root, embedder).await?;
    save_index(config, root, &index)?;
    Ok(index_status(config, root))
}

/// Load the saved index. Missing or unreadable indexes are `None`.
pub fn load_index(config: &Config, root: &Path) -> Option<Index> {
    let path = index_path(config, root);
    let text = fs::read_to_string(&path).ok()?;
    match serde_json::from_str(&text) {
        Ok(index) => Some(index),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt index ignored");
            None
        }
    }
}

pub fn index_status(config: &Config, root: &Path) -> IndexStatus {
    match load_index(config, root) {
        Some(index) => IndexStatus {
            ready: !index.items.is_empty(),
            items: index.items.len(),
            model: Some(index.embedding_model_id),
            updated_at: Some(index.updated_at),
        },
        None => IndexStatus {
            ready: false,
            items: 0,
            model: None,
            updated_at: None,
        },
    }
}

// ============ Search ============

/// Rank indexed items against `query`, returning at most `k`.
pub async fn search_index(
    config: &Config,
    root: &Path,
    embedder: &dyn Embedder,
    query: &str,
    k: usize,
) -> Result<Vec<ScoredItem>> {
    if query.trim().is_empty() || k == 0 {
        return Ok(Vec::new());
    }
    let Some(index) = load_index(config, root) else {
        return Ok(Vec::new());
    };
    if index.items.is_empty() {
        return Ok(Vec::new());
    }
    if index.embedding_model_id != embedder.model_name() {
        warn!(
            index_model = %index.embedding_model_id,
            query_model = embedder.model_name(),
            "index was built with a different embedding model; rebuild it"
        );
        return Ok(Vec::new());
    }

    let query_vec = embedder.embed(query).await?;
    Ok(rank(index.items, &query_vec, k))
}

/// Score and order `items` against `query_vec`.
pub fn rank(items: Vec<IndexItem>, query_vec: &[f32], k: usize) -> Vec<ScoredItem> {
    let mut scored: Vec<ScoredItem> = items
        .into_iter()
        .map(|item| {
            let score = cosine_similarity(query_vec, &item.vector);
            ScoredItem { item, score }
        })
        .collect();

    // sort_by is stable: ties keep index order.
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    scored.truncate(k);
    scored
}

// ============ Context packing ============

/// Render `matches` under `budget` characters.
///
/// ````text
/// ### Project Context (top matches)
///
/// [src/lib.rs:1-20] (score=0.812)
/// ```rust
/// ...
/// ```
/// ````
///
/// Returns an empty string when nothing fits.
pub fn pack_context(matches: &[ScoredItem], budget: usize) -> String {
    let mut out = String::from(CONTEXT_HEADER);
    let mut used = CONTEXT_HEADER.chars().count();
    let mut packed = 0usize;

    for m in matches {
        let head = format!(
            "\n[{}:{}-{}] (score={:.3})",
            m.item.file_path, m.item.line_start, m.item.line_end, m.score
        );
        let block = format!(
            "```{}\n{}\n```",
            detect_lang(&m.item.file_path),
            m.item.text
        );
        // Two newline joiners: before the head and before the block.
        let cost = 2 + head.chars().count() + block.chars().count();
        if used + cost > budget {
            break;
        }
        out.push('\n');
        out.push_str(&head);
        out.push('\n');
        out.push_str(&block);
        used += cost;
        packed += 1;
    }

    if packed == 0 {
        String::new()
    } else {
        out
    }
}

/// Fence language for a file path, or `""` when unknown.
pub fn detect_lang(path: &str) -> &'static str {
    let ext = path
        .rsplit_once('.')
        .map(|(_, e)| e.to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "ts" => "ts",
        "tsx" => "tsx",
        "js" | "mjs" | "cjs" => "js",
        "jsx" => "jsx",
        "py" => "py",
        "go" => "go",
        "rs" => "rust",
        "java" => "java",
        "kt" => "kotlin",
        "cs" => "cs",
        "cpp" => "cpp",
        "c" | "h" => "c",
        "md" | "mdx" => "md",
        "json" => "json",
        "yml" | "yaml" => "yaml",
        "toml" => "toml",
        "sql" => "sql",
        "sh" => "bash",
        "rb" => "ruby",
        "php" => "php",
        _ => "",
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}

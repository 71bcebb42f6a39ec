//! Line-boundary text chunker.
//!
//! Splits file content into [`LineChunk`]s of at most `max_chars`
//! characters. Splitting only happens between lines, and consecutive chunks
//! share roughly `overlap_chars` of trailing lines so a definition that
//! straddles a boundary is visible in both chunks.
//!
//! Identity is content-addressed: [`content_hash`] is the SHA-256 of the
//! chunk text and [`item_id`] hashes `(path, line_start, line_end,
//! content_hash)`. Re-chunking unchanged content therefore reproduces the
//! same identifiers.
//!
//! # Algorithm
//!
//! 1. Split on `\n` (a trailing `\r` is dropped from each line).
//! 2. Accumulate lines while the joined text stays within `max_chars`.
//! 3. A single line longer than `max_chars` becomes a chunk of its own.
//! 4. Step back over trailing lines totalling at most `overlap_chars` to
//!    choose the next start, always at least one line past the previous one.
//! 5. Whitespace-only chunks are dropped.

use sha2::{Digest, Sha256};

/// A contiguous run of lines. Line numbers are 1-based and inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineChunk {
    pub line_start: usize,
    pub line_end: usize,
    pub text: String,
}

pub fn chunk_lines(text: &str, max_chars: usize, overlap_chars: usize) -> Vec<LineChunk> {
    if text.is_empty() {
        return Vec::new();
    }

    let mut lines: Vec<&str> = text
        .split('\n')
        .map(|l| l.strip_suffix('\r').unwrap_or(l))
        .collect();
    // A terminating newline does not start another line.
    if text.ends_with('\n') {
        lines.pop();
    }
    let lengths: Vec<usize> = lines.iter().map(|l| l.chars().count()).collect();

    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let start = i;
        let mut len = 0usize;

        while i < lines.len() {
            let sep = if i == start { 0 } else { 1 };
            if len + sep + lengths[i] > max_chars {
                break;
            }
            len += sep + lengths[i];
            i += 1;
        }

        // Oversized line: emit it alone.
        if i == start {
            i += 1;
        }

        let body = lines[start..i].join("\n");
        if !body.trim().is_empty() {
            chunks.push(LineChunk {
                line_start: start + 1,
                line_end: i,
                text: body,
            });
        }

        if i >= lines.len() {
            break;
        }

        // Back up over trailing lines that fit in the overlap window.
        let mut carried = 0usize;
        let mut next = i;
        while next > start + 1 {
            let candidate = lengths[next - 1] + 1;
            if carried + candidate > overlap_chars {
                break;
            }
            carried += candidate;
            next -= 1;
        }
        i = next;
    }

    chunks
}

/// SHA-256 hex digest of chunk text.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Deterministic item identifier for a chunk of `file_path`.
pub fn item_id(file_path: &str, line_start: usize, line_end: usize, hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}:{}:{}:{}", file_path, line_start, line_end, hash).as_bytes());
    format!("{:x}", hasher.finalize())
}

//! Unified-diff parsing and application.
//!
//! Applies standard `@@ -L,N +L,N @@` hunks (the output of `git diff` or
//! `diff -u`) to in-memory text. File header lines (`---` / `+++`) are
//! optional. Model-written diffs frequently carry stale line numbers, so a
//! hunk whose context does not match at its stated position is relocated
//! to the nearest position where it does match.
//!
//! ```text
//! --- a/src/main.rs
//! +++ b/src/main.rs
//! @@ -1,3 +1,3 @@
//!  fn main() {
//! -    println!("hello");
//! +    println!("hello, world");
//!  }
//! ```

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiffError {
    #[error("patch parse error: {0}")]
    Parse(String),
    #[error("patch contains no hunks")]
    Empty,
    #[error("hunk {hunk} does not match the file near line {line}")]
    Mismatch { hunk: usize, line: usize },
}

#[derive(Debug)]
pub struct PatchResult {
    pub patched: String,
    pub hunks_applied: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Context,
    Remove,
    Add,
}

#[derive(Debug)]
struct Hunk {
    orig_start: usize,
    orig_len: usize,
    lines: Vec<(Op, String)>,
}

impl Hunk {
    fn before(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter(|(op, _)| *op != Op::Add)
            .map(|(_, l)| l.as_str())
            .collect()
    }

    fn after(&self) -> Vec<String> {
        self.lines
            .iter()
            .filter(|(op, _)| *op != Op::Remove)
            .map(|(_, l)| l.clone())
            .collect()
    }

    /// Drop blank trailing lines beyond the header's original count. They
    /// come from the blank line that often ends model output.
    fn finish(mut self) -> Self {
        while matches!(self.lines.last(), Some((Op::Context, l)) if l.is_empty())
            && self.before().len() > self.orig_len
        {
            self.lines.pop();
        }
        self
    }
}

/// Apply `diff` to `original`.
///
/// A diff without any hunk is an error: callers asked for a change and
/// received none.
pub fn apply_unified_diff(original: &str, diff: &str) -> Result<PatchResult, DiffError> {
    let hunks = parse_hunks(diff)?;
    if hunks.is_empty() {
        return Err(DiffError::Empty);
    }

    let eol = if original.contains("\r\n") { "\r\n" } else { "\n" };
    let mut lines: Vec<String> = original.lines().map(|l| l.to_string()).collect();
    let mut offset: i64 = 0;

    for (n, hunk) in hunks.iter().enumerate() {
        let before = hunk.before();
        // `-L,0` inserts after line L; `-0,0` is the top of the file.
        let anchor = if before.is_empty() {
            hunk.orig_start as i64
        } else {
            hunk.orig_start as i64 - 1
        };
        let expected = (anchor + offset).max(0) as usize;

        let at = locate(&lines, &before, expected).ok_or(DiffError::Mismatch {
            hunk: n + 1,
            line: expected + 1,
        })?;

        let after = hunk.after();
        let delta = after.len() as i64 - before.len() as i64;
        lines.splice(at..at + before.len(), after);
        offset += delta;
    }

    let mut patched = lines.join(eol);
    let keep_newline = original.ends_with('\n') || (original.is_empty() && !patched.is_empty());
    if keep_newline && !patched.ends_with('\n') {
        patched.push_str(eol);
    }

    Ok(PatchResult {
        patched,
        hunks_applied: hunks.len(),
    })
}

/// Find where `block` matches `lines`, preferring `expected` and then the
/// closest match in either direction.
fn locate(lines: &[String], block: &[&str], expected: usize) -> Option<usize> {
    let fits = |at: usize| {
        at + block.len() <= lines.len()
            && block.iter().enumerate().all(|(i, l)| lines[at + i] == *l)
    };

    if block.is_empty() {
        return Some(expected.min(lines.len()));
    }
    if fits(expected) {
        return Some(expected);
    }

    let last = lines.len().checked_sub(block.len())?;
    for distance in 1..=lines.len() {
        if let Some(up) = expected.checked_sub(distance) {
            if up <= last && fits(up) {
                return Some(up);
            }
        }
        let down = expected + distance;
        if down <= last && fits(down) {
            return Some(down);
        }
        if expected.saturating_sub(distance) == 0 && down > last {
            break;
        }
    }
    None
}

fn parse_hunks(diff: &str) -> Result<Vec<Hunk>, DiffError> {
    let mut hunks: Vec<Hunk> = Vec::new();
    let mut current: Option<Hunk> = None;
    let mut lines = diff.lines().enumerate().peekable();

    while let Some((lineno, line)) = lines.next() {
        if line.starts_with("@@") {
            if let Some(h) = current.take() {
                hunks.push(h.finish());
            }
            let (orig_start, orig_len) = parse_hunk_header(line)
                .map_err(|e| DiffError::Parse(format!("line {}: {}", lineno + 1, e)))?;
            current = Some(Hunk {
                orig_start,
                orig_len,
                lines: Vec::new(),
            });
            continue;
        }

        // A `---`/`+++` pair is a file header; a second one ends this file.
        let is_header = line.starts_with("--- ")
            && matches!(lines.peek(), Some((_, next)) if next.starts_with("+++ "));
        if is_header {
            if current.is_some() || !hunks.is_empty() {
                break;
            }
            lines.next();
            continue;
        }

        let Some(hunk) = current.as_mut() else {
            // Preamble before the first hunk (`diff --git`, `index ...`).
            continue;
        };

        if line.starts_with('\\') {
            // "\ No newline at end of file"
            continue;
        } else if let Some(rest) = line.strip_prefix('-') {
            hunk.lines.push((Op::Remove, rest.to_string()));
        } else if let Some(rest) = line.strip_prefix('+') {
            hunk.lines.push((Op::Add, rest.to_string()));
        } else {
            let rest = line.strip_prefix(' ').unwrap_or(line);
            hunk.lines.push((Op::Context, rest.to_string()));
        }
    }

    if let Some(h) = current {
        hunks.push(h.finish());
    }

    Ok(hunks)
}

/// Parse `@@ -L[,N] +L[,N] @@`, returning the original start line and
/// length. A missing length means one line.
fn parse_hunk_header(header: &str) -> Result<(usize, usize), String> {
    let inner = header
        .split("@@")
        .nth(1)
        .ok_or_else(|| "malformed hunk header".to_string())?
        .trim();

    let orig = inner
        .split_whitespace()
        .next()
        .and_then(|p| p.strip_prefix('-'))
        .ok_or_else(|| format!("missing original range in: {}", header))?;

    let (start, len) = orig.split_once(',').unwrap_or((orig, "1"));
    let start = start
        .parse::<usize>()
        .map_err(|e| format!("bad line number '{}': {}", start, e))?;
    let len = len
        .parse::<usize>()
        .map_err(|e| format!("bad line count '{}': {}", len, e))?;
    Ok((start, len))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(orig: &str, diff: &str) -> String {
        apply_unified_diff(orig, diff).unwrap().patched
    }

    #[test]
    fn test_simple_replacement() {
        let orig = "fn main() {\n    println!(\"hello\");\n}\n";
        let diff = "--- a/src/main.rs\n+++ b/src/main.rs\n@@ -1,3 +1,3 @@\n fn main() {\n-    println!(\"hello\");\n+    println!(\"hello, world\");\n }\n";
        assert_eq!(apply(orig, diff), "fn main() {\n    println!(\"hello, world\");\n}\n");
    }

    #[test]
    fn test_addition_and_deletion() {
        assert_eq!(
            apply("line1\nline2\n", "@@ -1,2 +1,3 @@\n line1\n+inserted\n line2\n"),
            "line1\ninserted\nline2\n"
        );
        assert_eq!(
            apply("line1\ndelete_me\nline2\n", "@@ -1,3 +1,2 @@\n line1\n-delete_me\n line2\n"),
            "line1\nline2\n"
        );
    }

    #[test]
    fn test_multiple_hunks_track_offset() {
        let orig = "a\nb\nc\nd\ne\nf\n";
        let diff = "@@ -1,2 +1,3 @@\n a\n+a2\n b\n@@ -5,2 +6,1 @@\n e\n-f\n";
        assert_eq!(apply(orig, diff), "a\na2\nb\nc\nd\ne\n");
    }

    #[test]
    fn test_stale_line_numbers_relocate() {
        let orig = "header\nheader2\nfn x() {\n    old();\n}\n";
        // Claims line 1, but the context lives at line 3.
        let diff = "@@ -1,3 +1,3 @@\n fn x() {\n-    old();\n+    new();\n }\n";
        assert_eq!(apply(orig, diff), "header\nheader2\nfn x() {\n    new();\n}\n");
    }

    #[test]
    fn test_new_file_from_empty() {
        let diff = "--- /dev/null\n+++ b/new.txt\n@@ -0,0 +1,2 @@\n+first\n+second\n";
        assert_eq!(apply("", diff), "first\nsecond\n");
    }

    #[test]
    fn test_no_newline_marker_ignored() {
        let diff = "@@ -1 +1 @@\n-old\n\\ No newline at end of file\n+new\n\\ No newline at end of file\n";
        assert_eq!(apply("old", diff), "new");
    }

    #[test]
    fn test_context_mismatch_errors() {
        let err = apply_unified_diff("a\nb\nc\n", "@@ -1,2 +1,2 @@\n x\n-b\n+B\n").unwrap_err();
        assert!(matches!(err, DiffError::Mismatch { hunk: 1, .. }));
    }

    #[test]
    fn test_empty_diff_errors() {
        assert!(matches!(
            apply_unified_diff("a\n", "not a diff at all"),
            Err(DiffError::Empty)
        ));
    }

    #[test]
    fn test_bad_header_errors() {
        assert!(matches!(
            apply_unified_diff("a\n", "@@ -x,1 +1,1 @@\n-a\n+b\n"),
            Err(DiffError::Parse(_))
        ));
    }

    #[test]
    fn test_removed_sql_comment_is_not_header() {
        let orig = "-- note\nSELECT 1;\n";
        let diff = "@@ -1,2 +1,1 @@\n--- note\n SELECT 1;\n";
        assert_eq!(apply(orig, diff), "SELECT 1;\n");
    }

    #[test]
    fn test_zero_length_range_inserts_after_line() {
        assert_eq!(apply("a\nb\nc\n", "@@ -2,0 +3,1 @@\n+NEW\n"), "a\nb\nNEW\nc\n");
        assert_eq!(apply("a\nb\n", "@@ -0,0 +1,1 @@\n+top\n"), "top\na\nb\n");
        assert_eq!(apply("a\nb\n", "@@ -2,0 +3,1 @@\n+end\n"), "a\nb\nend\n");
    }

    #[test]
    fn test_crlf_line_endings_preserved() {
        let orig = "one\r\ntwo\r\nthree\r\n";
        let diff = "@@ -1,3 +1,3 @@\n one\n-two\n+TWO\n three\n";
        assert_eq!(apply(orig, diff), "one\r\nTWO\r\nthree\r\n");

        let crlf_diff = "@@ -2,1 +2,1 @@\r\n-two\r\n+2\r\n";
        assert_eq!(apply(orig, crlf_diff), "one\r\n2\r\nthree\r\n");
    }

    #[test]
    fn test_trailing_blank_lines_after_hunk_ignored() {
        let diff = "@@ -1,2 +1,2 @@\n a\n-b\n+B\n\n\n";
        assert_eq!(apply("a\nb\n", diff), "a\nB\n");
    }

    #[test]
    fn test_blank_context_line_within_count_kept() {
        let orig = "a\n\nb\n";
        let diff = "@@ -1,3 +1,3 @@\n a\n\n-b\n+B\n";
        assert_eq!(apply(orig, diff), "a\n\nB\n");
    }
}

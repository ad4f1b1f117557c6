//! Cumulative DDL from a schema source tree, plus a lexical statement splitter.

use std::ops::Range;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{Result, TidemarkError};

/// Produces the full DDL text that defines the current schema.
pub trait SchemaSource: Send + Sync {
    fn build(&self) -> Result<String>;

    /// Short description for logs and reports.
    fn describe(&self) -> String;
}

/// Concatenates every `*.sql` file under a directory, in relative path order.
#[derive(Debug, Clone)]
pub struct DirectorySchemaBuilder {
    root: PathBuf,
}

impl DirectorySchemaBuilder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// SHA-256 over each file's relative path and content.
    pub fn compute_hash(&self) -> Result<String> {
        let mut hasher = Sha256::new();
        for path in sql_files(&self.root)? {
            let rel = relative(&self.root, &path);
            hasher.update(rel.as_bytes());
            hasher.update([0u8]);
            hasher.update(std::fs::read(&path)?);
            hasher.update([0u8]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }
}

impl SchemaSource for DirectorySchemaBuilder {
    fn build(&self) -> Result<String> {
        if !self.root.is_dir() {
            return Err(TidemarkError::SchemaError(format!(
                "Schema source directory '{}' does not exist",
                self.root.display()
            )));
        }
        let files = sql_files(&self.root)?;
        if files.is_empty() {
            return Err(TidemarkError::SchemaError(format!(
                "No .sql files found under '{}'",
                self.root.display()
            )));
        }

        let mut out = String::new();
        for path in files {
            let content = std::fs::read_to_string(&path)?;
            out.push_str(&format!("-- File: {}\n", relative(&self.root, &path)));
            out.push_str(content.trim_end());
            out.push_str("\n\n");
        }
        Ok(out)
    }

    fn describe(&self) -> String {
        self.root.display().to_string()
    }
}

/// A schema source that is already in memory.
#[derive(Debug, Clone)]
pub struct InlineSchema(pub String);

impl SchemaSource for InlineSchema {
    fn build(&self) -> Result<String> {
        Ok(self.0.clone())
    }

    fn describe(&self) -> String {
        "inline DDL".to_string()
    }
}

fn relative(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

/// All `*.sql` files under `dir`, recursively, sorted by path. Missing dir yields none.
pub fn sql_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if !dir.is_dir() {
        return Ok(files);
    }
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if path.extension().is_some_and(|e| e == "sql") {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Top-level transaction control: `BEGIN`, `START TRANSACTION`, `COMMIT`,
/// `END`, `ROLLBACK` and `ABORT`. Two-phase commit and savepoint rollbacks are
/// left alone.
fn is_transaction_control(statement: &str) -> bool {
    let upper = statement.trim().trim_end_matches(';').to_uppercase();
    let mut words = upper.split_whitespace();
    match (words.next(), words.next()) {
        (Some("BEGIN"), next) => next != Some("ATOMIC"),
        (Some("START"), Some("TRANSACTION")) => true,
        (Some("COMMIT" | "END" | "ROLLBACK" | "ABORT"), next) => {
            !matches!(next, Some("PREPARED" | "TO"))
        }
        _ => false,
    }
}

/// Whether a statement is nothing but comments and whitespace.
fn is_blank(statement: &str) -> bool {
    statement.lines().all(|line| {
        let line = line.trim();
        line.is_empty() || line.starts_with("--")
    }) && !statement.contains("/*")
}

/// Whether a segment opens a SQL-standard `BEGIN ATOMIC ... END` body.
fn opens_atomic_body(segment: &str) -> bool {
    let upper = segment.to_uppercase();
    let words: Vec<&str> = upper.split_whitespace().collect();
    words.windows(2).any(|w| w == ["BEGIN", "ATOMIC"])
}

fn is_bare_end(segment: &str) -> bool {
    strip_leading_comments(segment.trim()).eq_ignore_ascii_case("END")
}

/// Byte ranges of the top-level statements in `sql`, each including its
/// terminating semicolon. The ranges cover the whole input.
///
/// Quoted strings, quoted identifiers, dollar-quoted bodies, comments and
/// `BEGIN ATOMIC ... END` bodies never end a statement.
fn statement_spans(sql: &str) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut start = 0;
    let mut segment_start = 0;
    let mut in_atomic = false;
    let bytes = sql.as_bytes();
    let mut chars = sql.char_indices().peekable();

    while let Some((i, ch)) = chars.next() {
        match ch {
            '\'' | '"' => {
                while let Some((_, inner)) = chars.next() {
                    if inner == ch {
                        if chars.peek().is_some_and(|(_, next)| *next == ch) {
                            chars.next();
                            continue;
                        }
                        break;
                    }
                }
            }
            '-' if chars.peek().is_some_and(|(_, next)| *next == '-') => {
                for (_, inner) in chars.by_ref() {
                    if inner == '\n' {
                        break;
                    }
                }
            }
            '/' if chars.peek().is_some_and(|(_, next)| *next == '*') => {
                chars.next();
                let mut prev = '\0';
                for (_, inner) in chars.by_ref() {
                    if prev == '*' && inner == '/' {
                        break;
                    }
                    prev = inner;
                }
            }
            '$' => {
                // Dollar-quote tag: $$ or $name$
                let tag_end = sql[i + 1..]
                    .char_indices()
                    .find(|(_, c)| !(c.is_alphanumeric() || *c == '_'))
                    .map(|(off, c)| (i + 1 + off, c));
                if let Some((end, '$')) = tag_end {
                    let tag = &sql[i..=end];
                    if tag[1..tag.len() - 1].chars().next().is_some_and(|c| c.is_ascii_digit()) {
                        continue;
                    }
                    let body_start = end + 1;
                    let close = sql[body_start..]
                        .find(tag)
                        .map(|off| body_start + off + tag.len())
                        .unwrap_or(bytes.len());
                    while chars.peek().is_some_and(|(j, _)| *j < close) {
                        chars.next();
                    }
                }
            }
            ';' => {
                let segment = &sql[segment_start..i];
                segment_start = i + 1;
                if in_atomic {
                    if !is_bare_end(segment) {
                        continue;
                    }
                    in_atomic = false;
                } else if opens_atomic_body(segment) {
                    in_atomic = true;
                    continue;
                }
                spans.push(start..i + 1);
                start = i + 1;
            }
            _ => {}
        }
    }
    if start < bytes.len() {
        spans.push(start..bytes.len());
    }
    spans
}

/// Split SQL into statements on top-level semicolons.
///
/// Blank statements and transaction control are dropped.
pub fn split_statements(sql: &str) -> Vec<String> {
    statement_spans(sql)
        .into_iter()
        .filter_map(|span| {
            let raw = &sql[span];
            let trimmed = raw.strip_suffix(';').unwrap_or(raw).trim();
            if trimmed.is_empty() || is_blank(trimmed) || is_transaction_control(strip_leading_comments(trimmed)) {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
        .collect()
}

fn strip_leading_comments(statement: &str) -> &str {
    let mut rest = statement.trim_start();
    while rest.starts_with("--") {
        rest = rest.split_once('\n').map(|(_, r)| r.trim_start()).unwrap_or("");
    }
    rest
}

/// Remove top-level transaction control statements from a migration body.
///
/// Everything else, including function bodies that use `BEGIN`/`END`, is
/// kept byte for byte. Returns the cleaned SQL and whether anything was
/// removed.
pub fn strip_transaction_control(sql: &str) -> (String, bool) {
    let mut kept = String::with_capacity(sql.len());
    let mut removed = false;
    for span in statement_spans(sql) {
        let raw = &sql[span];
        let statement = raw.strip_suffix(';').unwrap_or(raw).trim();
        if !statement.is_empty() && is_transaction_control(strip_leading_comments(statement)) {
            removed = true;
        } else {
            kept.push_str(raw);
        }
    }
    (kept, removed)
}

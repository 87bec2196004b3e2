//! Lexical scan of an agent's Python sources for restricted imports and
//! calls.
//!
//! This is a line-based heuristic, not a parser: it catches the plain
//! `import subprocess` or `eval(...)` an agent author writes, not code that
//! goes out of its way to hide. Container isolation stays the real boundary.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::config::PolicyConfig;

/// Files larger than this are not scanned.
const MAX_SOURCE_BYTES: u64 = 1024 * 1024;

/// Findings reported in one violation.
const MAX_REPORTED: usize = 10;

static IMPORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*import\s+(.+)$").unwrap());

static FROM_IMPORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*from\s+([A-Za-z_][\w.]*)\s+import\s+(.+)$").unwrap());

/// A possibly dotted callee directly followed by `(`.
static CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[^\w.])((?:[A-Za-z_]\w*\s*\.\s*)*[A-Za-z_]\w*)\s*\(").unwrap()
});

/// What the scan looks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRules {
    pub modules: BTreeSet<String>,
    pub calls: BTreeSet<String>,
}

impl SourceRules {
    pub fn from_config(config: &PolicyConfig) -> Self {
        Self {
            modules: config.restricted_modules.clone(),
            calls: config.restricted_calls.clone(),
        }
    }

    fn module_restricted(&self, module: &str) -> bool {
        self.modules.iter().any(|m| {
            module == m
                || module
                    .strip_prefix(m.as_str())
                    .is_some_and(|rest| rest.starts_with('.'))
        })
    }

    fn call_restricted(&self, callee: &str) -> bool {
        self.calls.contains(callee)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindingKind {
    Import,
    Call,
}

/// One restricted use, located by file and 1-based line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFinding {
    /// Relative to the scanned directory.
    pub file: PathBuf,
    pub line: usize,
    pub kind: FindingKind,
    pub name: String,
}

impl fmt::Display for SourceFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self.kind {
            FindingKind::Import => "imports",
            FindingKind::Call => "calls",
        };
        write!(f, "{}:{} {verb} {}", self.file.display(), self.line, self.name)
    }
}

/// Human summary of `findings`, capped at a handful of entries.
pub fn describe_findings(findings: &[SourceFinding]) -> String {
    let mut parts: Vec<String> = findings
        .iter()
        .take(MAX_REPORTED)
        .map(ToString::to_string)
        .collect();
    if findings.len() > MAX_REPORTED {
        parts.push(format!("and {} more", findings.len() - MAX_REPORTED));
    }
    parts.join("; ")
}

/// Scan one file's contents.
pub fn scan_python(file: &Path, contents: &str, rules: &SourceRules) -> Vec<SourceFinding> {
    let mut findings = Vec::new();
    let mut docstring: Option<&'static str> = None;

    for (index, raw) in contents.lines().enumerate() {
        let Some(line) = code_part(raw, &mut docstring) else {
            continue;
        };
        let mut hit = |kind, name: String| {
            findings.push(SourceFinding {
                file: file.to_path_buf(),
                line: index + 1,
                kind,
                name,
            });
        };

        if let Some(caps) = FROM_IMPORT.captures(&line) {
            let module = &caps[1];
            if rules.module_restricted(module) {
                hit(FindingKind::Import, module.to_string());
            } else {
                for name in imported_names(&caps[2]) {
                    let dotted = format!("{module}.{name}");
                    if rules.module_restricted(&dotted) {
                        hit(FindingKind::Import, dotted);
                    } else if rules.call_restricted(&dotted) || rules.call_restricted(name) {
                        hit(FindingKind::Call, dotted);
                    }
                }
            }
            continue;
        }
        if let Some(caps) = IMPORT.captures(&line) {
            for module in imported_names(&caps[1]) {
                if rules.module_restricted(module) {
                    hit(FindingKind::Import, module.to_string());
                }
            }
            continue;
        }

        for caps in CALL.captures_iter(&line) {
            let Some(callee) = caps.get(1) else {
                continue;
            };
            if defines(&line[..callee.start()]) {
                continue;
            }
            let callee: String = callee.as_str().chars().filter(|c| !c.is_whitespace()).collect();
            if rules.call_restricted(&callee) {
                hit(FindingKind::Call, callee);
            }
        }
    }
    findings
}

/// `a as b, (c, d)` to `["a", "c", "d"]`.
fn imported_names(list: &str) -> Vec<&str> {
    list.split(',')
        .map(|item| item.trim().trim_matches(|c| c == '(' || c == ')' || c == '\\').trim())
        .filter_map(|item| item.split_whitespace().next())
        .filter(|name| !name.is_empty() && *name != "*")
        .collect()
}

/// Whether the text before a callee makes it a `def` or `class` name.
fn defines(before: &str) -> bool {
    let before = before.trim_end();
    ["def", "class"].iter().any(|kw| {
        before
            .strip_suffix(*kw)
            .is_some_and(|p| p.is_empty() || p.ends_with(|c: char| !c.is_alphanumeric() && c != '_'))
    })
}

/// The part of `raw` that is code: string literals blanked, comments and
/// docstring bodies dropped. `None` when nothing is left.
fn code_part(raw: &str, docstring: &mut Option<&'static str>) -> Option<String> {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;

    if let Some(delim) = *docstring {
        let end = rest.find(delim)?;
        rest = &rest[end + delim.len()..];
        *docstring = None;
    }

    let mut chars = rest.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match c {
            '#' => break,
            '"' | '\'' => {
                let triple = if c == '"' { "\"\"\"" } else { "'''" };
                if rest[i..].starts_with(triple) {
                    let body = &rest[i + 3..];
                    match body.find(triple) {
                        Some(end) => {
                            out.push_str("\"\"");
                            let skip_to = i + 3 + end + 3;
                            while chars.peek().is_some_and(|(j, _)| *j < skip_to) {
                                chars.next();
                            }
                        }
                        None => {
                            *docstring = Some(triple);
                            break;
                        }
                    }
                } else {
                    out.push_str("\"\"");
                    let mut escaped = false;
                    for (_, d) in chars.by_ref() {
                        if escaped {
                            escaped = false;
                        } else if d == '\\' {
                            escaped = true;
                        } else if d == c {
                            break;
                        }
                    }
                }
            }
            _ => out.push(c),
        }
    }

    if out.trim().is_empty() { None } else { Some(out) }
}

/// Scan every `.py` file under `code_dir`.
///
/// Hidden directories and `__pycache__` are skipped, symlinks are not
/// followed, and oversized files are passed over.
pub async fn scan_source(code_dir: &Path, rules: &SourceRules) -> std::io::Result<Vec<SourceFinding>> {
    let mut findings = Vec::new();
    let mut pending = vec![code_dir.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && dir == code_dir => {
                return Ok(findings);
            }
            Err(e) => return Err(e),
        };
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                if !name.starts_with('.') && name != "__pycache__" {
                    pending.push(entry.path());
                }
            } else if file_type.is_file() && name.ends_with(".py") {
                files.push(entry.path());
            }
        }
        files.sort();

        for path in files {
            let meta = tokio::fs::metadata(&path).await?;
            if meta.len() > MAX_SOURCE_BYTES {
                tracing::debug!(path = %path.display(), size = meta.len(), "Skipping oversized source file");
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            let contents = String::from_utf8_lossy(&bytes);
            let relative = path.strip_prefix(code_dir).unwrap_or(&path);
            findings.extend(scan_python(relative, &contents, rules));
        }
    }

    findings.sort_by(|a, b| (&a.file, a.line).cmp(&(&b.file, b.line)));
    Ok(findings)
}

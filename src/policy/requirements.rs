//! Restricted-package scan over an agent's `requirements.txt`.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

pub const REQUIREMENTS_FILE: &str = "requirements.txt";

/// Splits a requirement line at the first version, extra, marker or URL token.
static REQUIREMENT_SPLIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[=<>!~\[;@\s]").unwrap());

/// Extract the normalized package name from one requirements line.
///
/// Returns `None` for blanks, comments and pip options (`-r`, `--index-url`).
pub fn package_name(line: &str) -> Option<String> {
    let line = line.split('#').next().unwrap_or("").trim();
    if line.is_empty() || line.starts_with('-') {
        return None;
    }
    let name = REQUIREMENT_SPLIT.split(line).next().unwrap_or("").trim();
    if name.is_empty() {
        return None;
    }
    // PEP 503 normalization: case-insensitive, runs of -_. are equivalent.
    Some(name.to_lowercase().replace(['_', '.'], "-"))
}

/// Names in `contents` that hit the restricted list.
///
/// A restricted entry also covers its dash-separated family, so
/// `google-cloud` matches `google-cloud-storage`.
pub fn restricted_in(contents: &str, restricted: &BTreeSet<String>) -> Vec<String> {
    let restricted: Vec<String> = restricted
        .iter()
        .map(|r| r.to_lowercase().replace(['_', '.'], "-"))
        .collect();
    let mut hits: Vec<String> = contents
        .lines()
        .filter_map(package_name)
        .filter(|name| {
            restricted.iter().any(|r| {
                name == r
                    || name
                        .strip_prefix(r.as_str())
                        .is_some_and(|rest| rest.starts_with('-'))
            })
        })
        .collect();
    hits.sort();
    hits.dedup();
    hits
}

/// Scan `<code_dir>/requirements.txt`, if any.
pub async fn scan_requirements(
    code_dir: &Path,
    restricted: &BTreeSet<String>,
) -> std::io::Result<Vec<String>> {
    match tokio::fs::read_to_string(code_dir.join(REQUIREMENTS_FILE)).await {
        Ok(contents) => Ok(restricted_in(&contents, restricted)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

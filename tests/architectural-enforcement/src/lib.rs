//! Architectural Enforcement
//!
//! Source scanners shared by the integration tests in `tests/`:
//! - No sleep() calls in production code
//! - No blocking I/O inside async functions
//!
//! Production code means every `.rs` file under the router crates' `src/`
//! directories, minus `#[cfg(test)]` modules and test helper files.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Source roots held to the production rules, relative to the workspace
pub const PRODUCTION_ROOTS: [&str; 2] = ["nexus/core/src", "nexus/daemon/src"];

/// Files that only exist to support tests
const TEST_SUPPORT_FILES: [&str; 1] = ["test_utils.rs"];

/// Workspace root, derived from this crate's location
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("..").join("..")
}

/// One production source file with its test modules cut off
pub struct SourceFile {
    pub path: PathBuf,
    pub lines: Vec<String>,
}

impl SourceFile {
    /// Parse file contents, dropping everything from the first
    /// `#[cfg(test)]` module onward
    #[must_use]
    pub fn from_source(path: impl Into<PathBuf>, source: &str) -> Self {
        let all: Vec<&str> = source.lines().collect();
        let end = all
            .iter()
            .enumerate()
            .position(|(idx, line)| {
                line.trim().starts_with("#[cfg(test)]")
                    && all
                        .get(idx + 1)
                        .is_some_and(|next| next.trim_start().starts_with("mod "))
            })
            .unwrap_or(all.len());

        Self {
            path: path.into(),
            lines: all[..end].iter().map(|l| (*l).to_string()).collect(),
        }
    }

    pub fn line_refs(&self) -> Vec<&str> {
        self.lines.iter().map(String::as_str).collect()
    }
}

/// Every production source file under the given workspace-relative roots
#[must_use]
pub fn production_sources(roots: &[&str]) -> Vec<SourceFile> {
    let base = workspace_root();
    let mut files = Vec::new();

    for root in roots {
        let dir = base.join(root);
        if !dir.exists() {
            continue;
        }

        for entry in walkdir::WalkDir::new(&dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
        {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("rs") {
                continue;
            }
            let is_support = path
                .file_name()
                .and_then(|s| s.to_str())
                .is_some_and(|name| TEST_SUPPORT_FILES.contains(&name));
            if is_support {
                continue;
            }
            if let Ok(source) = fs::read_to_string(path) {
                files.push(SourceFile::from_source(path, &source));
            }
        }
    }

    files
}

/// A rule broken on a specific line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub path: PathBuf,
    pub line_number: usize,
    pub rule: &'static str,
    pub text: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} - {}: {}",
            self.path.display(),
            self.line_number,
            self.rule,
            self.text
        )
    }
}

/// Code portion of a line, with any trailing `//` comment removed
#[must_use]
pub fn code_part(line: &str) -> &str {
    line.split("//").next().unwrap_or(line)
}

/// Kind of function a line belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FnKind {
    Async,
    Sync,
}

/// Whether a line opens a function, and which kind
///
/// Handles visibility modifiers such as `pub` and `pub(crate)`.
#[must_use]
pub fn fn_signature(line: &str) -> Option<FnKind> {
    let trimmed = line.trim();
    let without_vis = if let Some(rest) = trimmed.strip_prefix("pub") {
        let rest = match rest.strip_prefix('(') {
            Some(inner) => inner.split_once(')').map_or(rest, |(_, after)| after),
            None => rest,
        };
        rest.trim_start()
    } else {
        trimmed
    };

    if without_vis.starts_with("async fn ") {
        Some(FnKind::Async)
    } else if without_vis.starts_with("fn ") || without_vis.starts_with("const fn ") {
        Some(FnKind::Sync)
    } else {
        None
    }
}

/// Kind of the nearest enclosing function above `current_idx`
///
/// Stops at module and impl boundaries.
#[must_use]
pub fn enclosing_fn(lines: &[&str], current_idx: usize) -> Option<FnKind> {
    for i in (0..current_idx).rev() {
        if let Some(kind) = fn_signature(lines[i]) {
            return Some(kind);
        }

        let line = lines[i].trim();
        if line.starts_with("mod ") || (line.starts_with("impl") && line.contains('{')) {
            return None;
        }
    }
    None
}

#[must_use]
pub fn is_in_async_function(lines: &[&str], current_idx: usize) -> bool {
    enclosing_fn(lines, current_idx) == Some(FnKind::Async)
}

#[must_use]
pub fn is_in_non_async_function(lines: &[&str], current_idx: usize) -> bool {
    enclosing_fn(lines, current_idx) == Some(FnKind::Sync)
}

/// Whether the enclosing function carries a test attribute
#[must_use]
pub fn is_in_test_function(lines: &[&str], current_idx: usize) -> bool {
    let Some(fn_idx) = (0..current_idx)
        .rev()
        .find(|&i| fn_signature(lines[i]).is_some())
    else {
        return false;
    };

    for i in (0..fn_idx).rev() {
        let line = lines[i].trim();
        if line.starts_with("#[test]") || line.starts_with("#[tokio::test") {
            return true;
        }
        if !line.starts_with("#[") && !line.starts_with("///") {
            break;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fn_signature_variants() {
        assert_eq!(fn_signature("    pub async fn serve(&self) {"), Some(FnKind::Async));
        assert_eq!(fn_signature("pub(crate) fn build_request() {"), Some(FnKind::Sync));
        assert_eq!(fn_signature("fn main() {"), Some(FnKind::Sync));
        assert_eq!(fn_signature("let f = async move {"), None);
        assert_eq!(fn_signature("// fn commented()"), None);
    }

    #[test]
    fn test_cfg_test_module_is_cut() {
        let source = "fn a() {}\n#[cfg(test)]\nmod tests {\n    fn b() {}\n}\n";
        let file = SourceFile::from_source("x.rs", source);
        assert_eq!(file.lines, vec!["fn a() {}".to_string()]);
    }

    #[test]
    fn test_cfg_test_item_is_kept() {
        let source = "#[cfg(test)]\nuse std::fs;\nfn a() {}\n";
        let file = SourceFile::from_source("x.rs", source);
        assert_eq!(file.lines.len(), 3);
    }

    #[test]
    fn test_enclosing_fn_stops_at_impl() {
        let lines = vec!["async fn a() {}", "impl Foo {", "    const X: u8 = 1;"];
        assert_eq!(enclosing_fn(&lines, 2), None);
    }

    #[test]
    fn test_test_function_detection() {
        let lines = vec![
            "#[tokio::test(start_paused = true)]",
            "async fn test_something() {",
            "    tokio::time::sleep(d).await;",
            "}",
        ];
        assert!(is_in_test_function(&lines, 2));
        assert!(!is_in_test_function(&["fn helper() {", "    x();"], 1));
    }

    #[test]
    fn test_production_roots_exist() {
        let root = workspace_root();
        for dir in PRODUCTION_ROOTS {
            assert!(root.join(dir).is_dir(), "missing source root {dir}");
        }
    }
}

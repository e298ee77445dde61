//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: Async code in the router crates MUST NOT use blocking I/O.
//! **Required**: `tokio::fs`, `tokio::io` and async `reqwest`, not `std::fs`,
//! `std::net` or `reqwest::blocking`.
//!
//! Synchronous functions may block; they run before the runtime starts
//! (config loading) or are never called from async code.

use architectural_enforcement::{
    code_part, is_in_async_function, is_in_non_async_function, production_sources, SourceFile,
    Violation, PRODUCTION_ROOTS,
};

/// Test that production code does not use blocking I/O
#[test]
fn test_no_blocking_io_in_production_code() {
    let violations: Vec<Violation> = production_sources(&PRODUCTION_ROOTS)
        .iter()
        .flat_map(find_blocking_io_violations)
        .collect();

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Blocking I/O calls found in production code!\n");

        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }

        eprintln!("\n❌ FORBIDDEN blocking I/O:");
        eprintln!("  - std::fs::read_to_string(), std::fs::write(), std::fs::File");
        eprintln!("  - std::net::TcpStream");
        eprintln!("  - reqwest::blocking::*");
        eprintln!("  - std::io::stdin() / std::io::stdout() in async code");
        eprintln!("\n✅ REQUIRED async I/O:");
        eprintln!("  - tokio::fs::read_to_string().await, tokio::fs::rename().await");
        eprintln!("  - tokio::io::stdin() behind a BufReader");
        eprintln!("  - reqwest::Client::post().send().await");
        eprintln!("\n✅ ACCEPTABLE blocking I/O:");
        eprintln!("  - Non-async functions (config loading before the runtime)");
        eprintln!("  - Test code");

        panic!(
            "\nFound {} blocking I/O violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}

fn find_blocking_io_violations(file: &SourceFile) -> Vec<Violation> {
    let lines = file.line_refs();
    let mut violations = Vec::new();

    for (idx, line) in lines.iter().enumerate() {
        let code = code_part(line);
        let mut flag = |rule: &'static str| {
            violations.push(Violation {
                path: file.path.clone(),
                line_number: idx + 1,
                rule,
                text: line.trim().to_string(),
            });
        };

        // Blocking HTTP is never acceptable
        if code.contains("reqwest::blocking") {
            flag("Blocking HTTP client");
            continue;
        }

        // Module-level imports make blocking calls easy to reach from async code
        if code.trim_start().starts_with("use std::fs") {
            flag("Blocking file I/O import");
            continue;
        }
        if code.trim_start().starts_with("use std::net") {
            flag("Blocking network I/O import");
            continue;
        }

        if is_in_non_async_function(&lines, idx) {
            continue;
        }

        if code.contains("std::fs::") {
            flag("Blocking file I/O");
        }
        if code.contains("std::net::") {
            flag("Blocking network I/O");
        }
        if (code.contains("std::io::stdin()") || code.contains("std::io::stdout()"))
            && is_in_async_function(&lines, idx)
        {
            flag("Blocking stdin/stdout in async");
        }
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(source: &str) -> Vec<Violation> {
        find_blocking_io_violations(&SourceFile::from_source("sample.rs", source))
    }

    #[test]
    fn test_blocking_read_in_async_fn_is_flagged() {
        let violations = scan(
            "pub async fn load(path: &Path) {\n    let raw = std::fs::read_to_string(path)?;\n}\n",
        );
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].rule, "Blocking file I/O");
    }

    #[test]
    fn test_blocking_read_in_sync_fn_is_allowed() {
        let violations = scan(
            "pub fn load_config() {\n    let raw = std::fs::read_to_string(path)?;\n}\n",
        );
        assert!(violations.is_empty());
    }

    #[test]
    fn test_tokio_stdin_is_allowed() {
        let violations = scan(
            "async fn main() {\n    server.serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout()).await;\n}\n",
        );
        assert!(violations.is_empty());
    }

    #[test]
    fn test_std_stdout_in_async_fn_is_flagged() {
        let violations = scan("async fn write() {\n    let out = std::io::stdout();\n}\n");
        assert_eq!(violations.len(), 1);
    }

    #[test]
    fn test_blocking_http_is_always_flagged() {
        let violations = scan("fn fetch() {\n    reqwest::blocking::get(url);\n}\n");
        assert_eq!(violations[0].rule, "Blocking HTTP client");
    }
}

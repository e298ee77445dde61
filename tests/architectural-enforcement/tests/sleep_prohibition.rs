//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Router production code MUST NOT call sleep methods.
//! Cool-downs are timestamps checked on the next request, periodic work
//! uses `tokio::time::interval()`, and per-attempt limits use
//! `tokio::time::timeout()`.
//!
//! **Exceptions**: test code only (`#[cfg(test)]` modules and `test_utils.rs`
//! are never scanned).

use architectural_enforcement::{
    code_part, is_in_test_function, production_sources, SourceFile, Violation, PRODUCTION_ROOTS,
};

/// Test that production code does not contain sleep() calls
#[test]
fn test_no_sleep_in_production_code() {
    let violations: Vec<Violation> = production_sources(&PRODUCTION_ROOTS)
        .iter()
        .flat_map(find_sleep_violations)
        .collect();

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Sleep calls found in production code!\n");

        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }

        eprintln!("\n✅ ACCEPTABLE waiting:");
        eprintln!("  - Periodic tasks using tokio::time::interval()");
        eprintln!("  - Bounded calls using tokio::time::timeout()");
        eprintln!("  - Test code (#[test] or #[tokio::test] functions)");
        eprintln!("\n❌ FORBIDDEN:");
        eprintln!("  - Sleeping out a cool-down (store the deadline instead)");
        eprintln!("  - Sleep between retry attempts");
        eprintln!("  - Sleep as poor man's synchronization");

        panic!(
            "\nFound {} sleep violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}

fn find_sleep_violations(file: &SourceFile) -> Vec<Violation> {
    let lines = file.line_refs();
    let mut violations = Vec::new();

    for (idx, line) in lines.iter().enumerate() {
        let code = code_part(line);
        if !(code.contains("::sleep(") || code.contains(".sleep(")) {
            continue;
        }
        if is_in_test_function(&lines, idx) {
            continue;
        }

        violations.push(Violation {
            path: file.path.clone(),
            line_number: idx + 1,
            rule: "Sleep call",
            text: line.trim().to_string(),
        });
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(source: &str) -> Vec<Violation> {
        find_sleep_violations(&SourceFile::from_source("sample.rs", source))
    }

    #[test]
    fn test_sleep_violation_detection() {
        let violations = scan(
            "async fn cool_down() {\n    tokio::time::sleep(Duration::from_secs(300)).await;\n}\n",
        );
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].line_number, 2);
    }

    #[test]
    fn test_method_named_like_sleep_is_allowed() {
        let violations = scan("fn route(&self) {\n    self.enter_sleep(\"exhausted\");\n}\n");
        assert!(violations.is_empty());
    }

    #[test]
    fn test_sleep_in_test_module_is_ignored() {
        let violations = scan(
            "fn real() {}\n#[cfg(test)]\nmod tests {\n    async fn t() { tokio::time::sleep(d).await; }\n}\n",
        );
        assert!(violations.is_empty());
    }

    #[test]
    fn test_commented_sleep_is_ignored() {
        let violations = scan("fn f() {\n    // tokio::time::sleep(d).await;\n}\n");
        assert!(violations.is_empty());
    }
}

//! Structured result-log parsing.
//!
//! An external test run writes a JSON-lines log: one object per event, of
//! which the interesting ones carry `succeeded`, `className` and
//! `methodName`. This module turns that log into the set of test
//! identifiers that passed. Everything the worker attempted that is not in
//! that set is treated as failed and becomes retry candidate data.
//!
//! Parsing is deliberately forgiving: a missing or truncated log (a device
//! that died mid-run still leaves a partial log behind) yields whatever
//! records were parseable, and malformed lines are skipped.

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;
use tracing::debug;

/// One record from the structured result log.
#[derive(Debug, Deserialize)]
struct RunRecord {
    succeeded: bool,
    #[serde(rename = "className")]
    class_name: String,
    #[serde(rename = "methodName")]
    method_name: String,
}

/// Parsed outcome of one worker run's result log.
#[derive(Debug, Default)]
pub struct BatchResults {
    /// Identifiers confirmed passed by this run.
    pub succeeded: HashSet<String>,
}

/// Builds the canonical `"<ClassName>/<MethodName>"` test identifier.
pub fn test_id(class_name: &str, method_name: &str) -> String {
    format!("{}/{}", class_name, method_name)
}

/// Parses the structured result log at `path`.
///
/// Returns an empty result set if the log does not exist or cannot be
/// read; the caller retries every unconfirmed test, so missing data is
/// safe (it can only cause extra work, never a false pass).
pub fn parse_result_log(path: &Path) -> BatchResults {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            debug!("No readable result log at {}: {}", path.display(), e);
            return BatchResults::default();
        }
    };

    let mut succeeded = HashSet::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        // Non-result events share the log; skip anything that doesn't parse.
        let Ok(record) = serde_json::from_str::<RunRecord>(line) else {
            continue;
        };
        if record.succeeded {
            succeeded.insert(test_id(&record.class_name, &record.method_name));
        }
    }

    BatchResults { succeeded }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_log(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        file
    }

    #[test]
    fn collects_succeeded_records() {
        let log = write_log(&[
            r#"{"succeeded": true, "className": "LoginTests", "methodName": "testLogin"}"#,
            r#"{"succeeded": false, "className": "LoginTests", "methodName": "testLogout"}"#,
            r#"{"succeeded": true, "className": "CartTests", "methodName": "testAddItem"}"#,
        ]);

        let results = parse_result_log(log.path());
        assert_eq!(results.succeeded.len(), 2);
        assert!(results.succeeded.contains("LoginTests/testLogin"));
        assert!(results.succeeded.contains("CartTests/testAddItem"));
        assert!(!results.succeeded.contains("LoginTests/testLogout"));
    }

    #[test]
    fn skips_malformed_and_unrelated_lines() {
        let log = write_log(&[
            r#"{"event": "begin-test-suite", "suite": "All"}"#,
            "not json at all",
            r#"{"succeeded": true, "className": "A", "methodName": "b"}"#,
            "",
            r#"{"succeeded": true}"#,
        ]);

        let results = parse_result_log(log.path());
        assert_eq!(results.succeeded.len(), 1);
        assert!(results.succeeded.contains("A/b"));
    }

    #[test]
    fn missing_log_yields_empty_results() {
        let results = parse_result_log(Path::new("/nonexistent/scatter/results.json"));
        assert!(results.succeeded.is_empty());
    }

    #[test]
    fn test_id_uses_slash_form() {
        assert_eq!(test_id("LoginTests", "testLogin"), "LoginTests/testLogin");
    }
}

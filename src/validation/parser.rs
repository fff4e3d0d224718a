//! Turns validator process output into diagnostics and failing test cases.
//!
//! Checkers that know about Anvil print one JSON object per line on stdout:
//!
//! ```text
//! {"type": "diagnostic", "file": "src/lib.rs", "line": 3, "message": "unused import", "rule": "unused"}
//! {"type": "test_failed", "name": "cart::total", "message": "assertion failed", "stack": "..."}
//! {"type": "coverage", "pct": 81.5}
//! ```
//!
//! Anything else falls back to plain-text recognition of `file:line: message`
//! diagnostics and libtest's `test name ... FAILED` lines.

use std::sync::LazyLock;

use anvil_common::{Diagnostic, FailingCase, TestResult, ValidationResult};
use regex::Regex;
use serde::Deserialize;

/// How much of stderr to keep when a process fails without saying why.
const STDERR_TAIL_CHARS: usize = 2000;

static FILE_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<file>[^\s:][^:]*\.[A-Za-z0-9]+):(?P<line>\d+)(?::\d+)?:\s*(?P<msg>.+)$")
        .expect("file:line regex is valid")
});

static LIBTEST_FAILED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^test (?P<name>\S+) \.\.\. FAILED$").expect("libtest regex is valid")
});

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ReportLine {
    Diagnostic {
        #[serde(default)]
        file: Option<String>,
        #[serde(default)]
        line: Option<u32>,
        message: String,
        #[serde(default)]
        rule: Option<String>,
    },
    TestFailed {
        name: String,
        #[serde(default)]
        message: String,
        #[serde(default)]
        stack: Option<String>,
    },
    Coverage {
        pct: f64,
    },
    #[serde(other)]
    Unknown,
}

fn parse_report_line(line: &str) -> Option<ReportLine> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    match serde_json::from_str::<ReportLine>(trimmed) {
        Ok(ReportLine::Unknown) | Err(_) => None,
        Ok(report) => Some(report),
    }
}

/// Recognise a plain `path/to/file.ext:12[:col]: message` line.
pub fn parse_file_line(line: &str, rule: &str) -> Option<Diagnostic> {
    let caps = FILE_LINE_RE.captures(line.trim())?;
    let line_no = caps["line"].parse().ok()?;
    Some(Diagnostic::new(
        Some(&caps["file"]),
        Some(line_no),
        caps["msg"].trim(),
        rule,
    ))
}

/// Last `STDERR_TAIL_CHARS` characters of a stream, on a char boundary.
pub fn tail(text: &str) -> String {
    let trimmed = text.trim_end();
    let count = trimmed.chars().count();
    if count <= STDERR_TAIL_CHARS {
        return trimmed.to_string();
    }
    let skip = count - STDERR_TAIL_CHARS;
    format!("...{}", trimmed.chars().skip(skip).collect::<String>())
}

fn exit_diagnostic(step: &str, exit_code: Option<i32>, stderr: &str) -> Diagnostic {
    let code = exit_code
        .map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string());
    let tail = tail(stderr);
    let message = if tail.is_empty() {
        format!("{} exited with status {}", step, code)
    } else {
        format!("{} exited with status {}:\n{}", step, code, tail)
    };
    Diagnostic::synthetic("exit_status", &message)
}

/// Build a `ValidationResult` from a finished static-check process.
pub fn static_result(success: bool, exit_code: Option<i32>, stdout: &str, stderr: &str) -> ValidationResult {
    let mut structured = Vec::new();
    for line in stdout.lines() {
        if let Some(ReportLine::Diagnostic {
            file,
            line,
            message,
            rule,
        }) = parse_report_line(line)
        {
            structured.push(Diagnostic {
                file,
                line,
                message,
                rule: rule.unwrap_or_else(|| "lint".to_string()),
            });
        }
    }

    let diagnostics = if structured.is_empty() {
        stdout
            .lines()
            .chain(stderr.lines())
            .filter_map(|l| parse_file_line(l, "lint"))
            .collect()
    } else {
        structured
    };

    if success {
        return ValidationResult {
            passed: true,
            diagnostics,
        };
    }
    if diagnostics.is_empty() {
        return ValidationResult::fail(vec![exit_diagnostic("static check", exit_code, stderr)]);
    }
    ValidationResult::fail(diagnostics)
}

/// Build a `TestResult` from a finished test process.
pub fn test_result(success: bool, exit_code: Option<i32>, stdout: &str, stderr: &str) -> TestResult {
    let mut failing = Vec::new();
    let mut coverage = None;
    let mut structured = false;

    for line in stdout.lines() {
        match parse_report_line(line) {
            Some(ReportLine::TestFailed {
                name,
                message,
                stack,
            }) => {
                structured = true;
                failing.push(FailingCase {
                    name,
                    message,
                    stack,
                });
            }
            Some(ReportLine::Coverage { pct }) => coverage = Some(pct),
            _ => {}
        }
    }

    if !structured {
        failing.extend(
            stdout
                .lines()
                .chain(stderr.lines())
                .filter_map(|l| LIBTEST_FAILED_RE.captures(l.trim()))
                .map(|caps| FailingCase {
                    name: caps["name"].to_string(),
                    message: "FAILED".to_string(),
                    stack: None,
                }),
        );
    }

    if success && failing.is_empty() {
        return TestResult::pass(coverage);
    }
    if failing.is_empty() {
        let diag = exit_diagnostic("test suite", exit_code, stderr);
        failing.push(FailingCase {
            name: "test suite".to_string(),
            message: diag.message,
            stack: None,
        });
    }
    let mut result = TestResult::fail(failing);
    result.coverage_pct = coverage;
    result
}

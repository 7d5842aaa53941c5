//! Result collection and reporting.

use crate::schema::RunResult;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Append-only collection of results for one run batch.
///
/// Safe to share between threads; appends are serialized by a mutex.
#[derive(Debug, Default)]
pub struct ResultSink {
    results: Mutex<Vec<RunResult>>,
}

impl ResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one result.
    pub fn push(&self, result: RunResult) {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(result);
    }

    /// Drop everything collected so far. Call before starting a new batch.
    pub fn clear(&self) {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Copy of the results in append order.
    pub fn snapshot(&self) -> Vec<RunResult> {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// A case that could not be run because its spec or setup is broken.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CaseFailure {
    pub script: String,
    pub case: String,
    pub error: String,
}

/// Everything a finished run reports.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Summary {
    pub generated_at: String,
    pub passed: usize,
    pub failed: usize,
    pub results: Vec<RunResult>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<CaseFailure>,
}

impl Summary {
    /// Build a summary. Errored cases count as failures.
    pub fn new(results: Vec<RunResult>, errors: Vec<CaseFailure>) -> Self {
        let passed = results.iter().filter(|r| r.passed()).count();
        let failed = results.len() - passed + errors.len();
        Self {
            generated_at: chrono::Utc::now().to_rfc3339(),
            passed,
            failed,
            results,
            errors,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Write `summary.json` into `output_root`, creating it if needed.
    pub fn write(&self, output_root: &Path) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(output_root)?;
        let path = output_root.join("summary.json");
        let json = self.to_json().map_err(std::io::Error::other)?;
        std::fs::write(&path, json)?;
        Ok(path)
    }
}

/// Human-readable report with checkmarks.
pub fn format_human(summary: &Summary) -> String {
    let mut out = String::new();
    for result in &summary.results {
        let mark = if result.passed() { '✓' } else { '✗' };
        let _ = write!(
            out,
            "  {mark} {} [{}] ({}ms)",
            result.script, result.case, result.duration_ms
        );
        if let Some(note) = &result.note {
            let _ = write!(out, " - {note}");
        }
        out.push('\n');
    }
    for error in &summary.errors {
        let _ = writeln!(out, "  ✗ {} [{}] {}", error.script, error.case, error.error);
    }
    let _ = writeln!(out, "\n{} passed, {} failed", summary.passed, summary.failed);
    out
}

/// One JUnit test case row.
struct JunitCase<'a> {
    name: &'a str,
    millis: u64,
    failure: Option<String>,
}

/// Format results as JUnit XML, one testsuite per script.
pub fn format_junit_xml(summary: &Summary) -> String {
    let rows = summary
        .results
        .iter()
        .map(|r| {
            let failure = r
                .note
                .clone()
                .or_else(|| (!r.passed()).then(|| "failed".to_string()));
            (r.script.as_str(), JunitCase {
                name: &r.case,
                millis: r.duration_ms,
                failure,
            })
        })
        .chain(summary.errors.iter().map(|e| {
            (e.script.as_str(), JunitCase {
                name: &e.case,
                millis: 0,
                failure: Some(e.error.clone()),
            })
        }));

    let mut suites: Vec<(&str, Vec<JunitCase<'_>>)> = Vec::new();
    for (script, case) in rows {
        match suites.iter_mut().find(|(s, _)| *s == script) {
            Some((_, cases)) => cases.push(case),
            None => suites.push((script, vec![case])),
        }
    }

    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");

    let total_tests: usize = suites.iter().map(|(_, c)| c.len()).sum();
    let total_time: u64 = suites.iter().flat_map(|(_, c)| c).map(|c| c.millis).sum();
    let _ = writeln!(
        xml,
        "<testsuites tests=\"{total_tests}\" failures=\"{}\" time=\"{:.3}\">",
        summary.failed,
        seconds(total_time)
    );

    for (script, cases) in &suites {
        let failures = cases.iter().filter(|c| c.failure.is_some()).count();
        let time: u64 = cases.iter().map(|c| c.millis).sum();
        let _ = writeln!(
            xml,
            "  <testsuite name=\"{}\" tests=\"{}\" failures=\"{failures}\" time=\"{:.3}\">",
            escape_xml(script),
            cases.len(),
            seconds(time)
        );
        for case in cases {
            let _ = writeln!(
                xml,
                "    <testcase name=\"{}\" classname=\"{}\" time=\"{:.3}\">",
                escape_xml(case.name),
                escape_xml(script),
                seconds(case.millis)
            );
            if let Some(message) = &case.failure {
                let _ = writeln!(
                    xml,
                    "      <failure message=\"{}\"></failure>",
                    escape_xml(message)
                );
            }
            xml.push_str("    </testcase>\n");
        }
        xml.push_str("  </testsuite>\n");
    }

    xml.push_str("</testsuites>\n");
    xml
}

#[allow(clippy::cast_precision_loss)]
fn seconds(millis: u64) -> f64 {
    millis as f64 / 1000.0
}

/// Escape special XML characters.
fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

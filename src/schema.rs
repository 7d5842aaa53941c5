//! Schema definitions for smokerun.
//!
//! Script specs arrive as loosely-typed documents and are validated by the
//! resolver into the strict descriptor types defined here. The `*Doc` types
//! only describe the document shape for `smokerun schema`; they are never
//! used to parse specs.

use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Default per-case timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: f64 = 10.0;

/// Exit code reported for a case that ran past its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Suite-level configuration loaded from `smoke.yaml` in the repo root.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SuiteConfig {
    /// Schema version (must match crate major version).
    #[serde(default = "default_version")]
    pub version: u32,

    /// Directory holding script spec documents, relative to the repo root.
    #[serde(default = "default_specs_dir")]
    pub specs_dir: PathBuf,

    /// Directory receiving logs and the run summary, relative to the repo root.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Timeout applied to cases that do not set `timeout_sec`.
    #[serde(default)]
    pub default_timeout_sec: Option<f64>,

    /// Baseline environment patches applied before each case's own `env`.
    /// A null value removes the variable.
    #[serde(default)]
    pub env: BTreeMap<String, Option<String>>,
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            specs_dir: default_specs_dir(),
            output_dir: default_output_dir(),
            default_timeout_sec: None,
            env: BTreeMap::new(),
        }
    }
}

fn default_version() -> u32 {
    1
}

fn default_specs_dir() -> PathBuf {
    PathBuf::from("tests/script_specs")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("out/smoke")
}

/// One environment override from a spec's `env` object.
///
/// A key that is not mentioned at all has no entry; `Unset` and `Set` are
/// the two present states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvPatch {
    /// Present with a null value: remove the variable if inherited.
    Unset,
    /// Present with a string value: set or overwrite the variable.
    Set(String),
}

impl From<Option<String>> for EnvPatch {
    fn from(value: Option<String>) -> Self {
        match value {
            Some(v) => EnvPatch::Set(v),
            None => EnvPatch::Unset,
        }
    }
}

/// A fully resolved, ready-to-execute process description.
#[derive(Debug, Clone)]
pub struct InvocationDescriptor {
    /// Program followed by its arguments. Never empty.
    pub argv: Vec<String>,
    pub working_directory: PathBuf,
    /// The complete environment of the child; nothing else is inherited.
    pub environment: BTreeMap<String, String>,
    /// Timeout in seconds as configured (positive, finite).
    pub timeout_secs: f64,
}

/// Resolved success criteria for one case.
#[derive(Debug, Clone)]
pub struct ExpectationDescriptor {
    /// Allowed exit codes, in declaration order. Never empty.
    pub exit_codes: Vec<i32>,
    /// Pattern searched for in stdout, if any.
    pub stdout_regex: Option<Regex>,
    /// Pattern searched for in stderr, if any.
    pub stderr_regex: Option<Regex>,
}

impl Default for ExpectationDescriptor {
    fn default() -> Self {
        Self {
            exit_codes: vec![0],
            stdout_regex: None,
            stderr_regex: None,
        }
    }
}

/// Verdict of a single case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pass,
    Fail,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Pass => f.write_str("pass"),
            Status::Fail => f.write_str("fail"),
        }
    }
}

/// Outcome of executing one (script, case) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub script: String,
    pub case: String,
    pub argv: Vec<String>,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub status: Status,
    /// Semicolon-joined violation reasons; absent when the case passed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl RunResult {
    /// Whether the case passed.
    pub fn passed(&self) -> bool {
        self.status == Status::Pass
    }
}

/// Root document for a script spec file.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ScriptSpecDoc {
    /// Script path relative to the repo root. Defaults to the spec file's
    /// path relative to the specs directory, without its extension.
    #[serde(default)]
    pub script: Option<String>,

    /// Smoke cases, either a list or `{ cases: [...] }`.
    #[serde(default)]
    pub smoke: Option<SmokeDoc>,
}

/// The two accepted layouts of the `smoke` field.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum SmokeDoc {
    /// A plain list of cases.
    List(Vec<CaseDoc>),
    /// A wrapper object with a `cases` list.
    Cases {
        /// The cases.
        cases: Vec<CaseDoc>,
    },
}

/// A single smoke case.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CaseDoc {
    /// Case name. Defaults to `case-<index>` (1-based).
    #[serde(default)]
    pub name: Option<String>,

    /// Arguments appended after the script path (shebang invocation only).
    #[serde(default)]
    pub args: Vec<String>,

    /// Explicit argv overriding the shebang. Mutually exclusive with `args`.
    #[serde(default)]
    pub command: Option<Vec<String>>,

    /// Timeout in seconds (default 10).
    #[serde(default)]
    pub timeout_sec: Option<f64>,

    /// Environment overrides. A null value removes the variable.
    #[serde(default)]
    pub env: BTreeMap<String, Option<String>>,

    /// Expected outcome.
    #[serde(default)]
    pub expect: Option<ExpectDoc>,
}

/// Expected outcome of a smoke case.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ExpectDoc {
    /// Allowed exit codes (default `[0]`).
    #[serde(default)]
    pub exit_codes: Option<Vec<i32>>,

    /// Multiline regex searched for in stdout.
    #[serde(default)]
    pub stdout_regex: Option<String>,

    /// Multiline regex searched for in stderr.
    #[serde(default)]
    pub stderr_regex: Option<String>,
}

/// Generate the JSON Schema for script spec documents.
pub fn generate_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(ScriptSpecDoc)
}

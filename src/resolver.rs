//! Spec resolution.
//!
//! Turns one loosely-typed smoke case into an [`InvocationDescriptor`] and an
//! [`ExpectationDescriptor`]. Every field has exactly one validation rule and
//! a malformed field fails the whole case before anything is spawned.

use crate::env::apply_patches;
use crate::schema::{
    DEFAULT_TIMEOUT_SECS, EnvPatch, ExpectationDescriptor, InvocationDescriptor,
};
use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Error type for spec resolution.
#[derive(Debug)]
pub enum SpecError {
    /// A field has the wrong type or shape.
    Shape {
        script: String,
        case: String,
        field: &'static str,
        message: String,
    },
    /// No `command` override and the script has no usable `#!` line.
    MissingShebang { script: String, case: String },
    /// The script file does not exist.
    NotFound {
        script: String,
        case: String,
        path: PathBuf,
    },
}

fn describe(script: &str, case: &str) -> String {
    if case.is_empty() {
        script.to_string()
    } else {
        format!("{script} ({case})")
    }
}

impl std::fmt::Display for SpecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpecError::Shape {
                script,
                case,
                field,
                message,
            } => {
                // Nested expectation fields are already qualified.
                let prefix = if field.starts_with("expect.") { "" } else { "spec." };
                write!(f, "{prefix}{field} {message}: {}", describe(script, case))
            }
            SpecError::MissingShebang { script, case } => {
                write!(f, "missing shebang: {}", describe(script, case))
            }
            SpecError::NotFound { script, case, path } => write!(
                f,
                "script not found: {} ({})",
                describe(script, case),
                path.display()
            ),
        }
    }
}

impl std::error::Error for SpecError {}

/// Inputs shared by every case of a run.
#[derive(Debug, Clone)]
pub struct ResolveContext {
    /// Root that script identifiers are relative to.
    pub repo_root: PathBuf,
    /// Working directory of every child.
    pub working_directory: PathBuf,
    /// Inherited environment with reproducibility and suite patches applied.
    pub baseline_env: BTreeMap<String, String>,
    /// Timeout for cases that do not set `timeout_sec`.
    pub default_timeout_secs: f64,
}

impl ResolveContext {
    /// Context rooted at `repo_root`, running children from the same directory.
    pub fn new(repo_root: impl Into<PathBuf>, baseline_env: BTreeMap<String, String>) -> Self {
        let repo_root = repo_root.into();
        Self {
            working_directory: repo_root.clone(),
            repo_root,
            baseline_env,
            default_timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

/// Field-level validator for one case. Carries the names used in errors.
struct Checker<'a> {
    script: &'a str,
    case: &'a str,
}

impl Checker<'_> {
    fn shape(&self, field: &'static str, message: impl Into<String>) -> SpecError {
        SpecError::Shape {
            script: self.script.to_string(),
            case: self.case.to_string(),
            field,
            message: message.into(),
        }
    }

    fn string_list(
        &self,
        field: &'static str,
        value: &Value,
        message: &str,
    ) -> Result<Vec<String>, SpecError> {
        let items = value
            .as_array()
            .ok_or_else(|| self.shape(field, message))?;
        items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| self.shape(field, message))
            })
            .collect()
    }

    fn args(&self, spec: &Map<String, Value>) -> Result<Vec<String>, SpecError> {
        match present(spec, "args") {
            None => Ok(Vec::new()),
            Some(value) => self.string_list("args", value, "must be a list of strings"),
        }
    }

    fn command(
        &self,
        spec: &Map<String, Value>,
        args: &[String],
    ) -> Result<Option<Vec<String>>, SpecError> {
        let Some(value) = present(spec, "command") else {
            return Ok(None);
        };
        const MSG: &str = "must be a non-empty list of strings";
        let command = self.string_list("command", value, MSG)?;
        if command.is_empty() {
            return Err(self.shape("command", MSG));
        }
        if !args.is_empty() {
            return Err(self.shape("args", "must be empty when spec.command is set"));
        }
        Ok(Some(command))
    }

    fn timeout(&self, spec: &Map<String, Value>, default: f64) -> Result<f64, SpecError> {
        let Some(value) = present(spec, "timeout_sec") else {
            return Ok(default);
        };
        let secs = value
            .as_f64()
            .ok_or_else(|| self.shape("timeout_sec", "must be a number"))?;
        if !secs.is_finite() || secs <= 0.0 {
            return Err(self.shape("timeout_sec", "must be a positive number"));
        }
        Ok(secs)
    }

    fn env(&self, spec: &Map<String, Value>) -> Result<BTreeMap<String, EnvPatch>, SpecError> {
        let Some(value) = present(spec, "env") else {
            return Ok(BTreeMap::new());
        };
        let object = value
            .as_object()
            .ok_or_else(|| self.shape("env", "must be a JSON object"))?;
        object
            .iter()
            .map(|(key, value)| {
                let patch = match value {
                    Value::Null => EnvPatch::Unset,
                    Value::String(s) => EnvPatch::Set(s.clone()),
                    _ => {
                        let message = format!("value for {key} must be a string or null");
                        return Err(self.shape("env", message));
                    }
                };
                Ok((key.clone(), patch))
            })
            .collect()
    }

    fn expect(&self, spec: &Map<String, Value>) -> Result<ExpectationDescriptor, SpecError> {
        let Some(value) = present(spec, "expect") else {
            return Ok(ExpectationDescriptor::default());
        };
        let expect = value
            .as_object()
            .ok_or_else(|| self.shape("expect", "must be a JSON object"))?;

        let exit_codes = match present(expect, "exit_codes") {
            None => vec![0],
            Some(value) => self.exit_codes(value)?,
        };

        Ok(ExpectationDescriptor {
            exit_codes,
            stdout_regex: self.pattern(expect, "stdout_regex", "expect.stdout_regex")?,
            stderr_regex: self.pattern(expect, "stderr_regex", "expect.stderr_regex")?,
        })
    }

    fn exit_codes(&self, value: &Value) -> Result<Vec<i32>, SpecError> {
        const FIELD: &str = "expect.exit_codes";
        const MSG: &str = "must be a list of ints";
        let items = value.as_array().ok_or_else(|| self.shape(FIELD, MSG))?;
        if items.is_empty() {
            return Err(self.shape(FIELD, "must not be empty"));
        }
        items
            .iter()
            .map(|item| {
                item.as_i64()
                    .and_then(|code| i32::try_from(code).ok())
                    .ok_or_else(|| self.shape(FIELD, MSG))
            })
            .collect()
    }

    fn pattern(
        &self,
        expect: &Map<String, Value>,
        key: &str,
        field: &'static str,
    ) -> Result<Option<Regex>, SpecError> {
        let Some(value) = present(expect, key) else {
            return Ok(None);
        };
        let pattern = value
            .as_str()
            .ok_or_else(|| self.shape(field, "must be a string"))?;
        compile_optional_regex(pattern)
            .map_err(|e| self.shape(field, format!("is not a valid regex ({e})")))
    }
}

/// Look up a key, treating an explicit null like a missing key.
fn present<'v>(object: &'v Map<String, Value>, key: &str) -> Option<&'v Value> {
    object.get(key).filter(|v| !v.is_null())
}

/// Compile a pattern in multiline mode. An empty pattern means no constraint.
pub fn compile_optional_regex(pattern: &str) -> Result<Option<Regex>, regex::Error> {
    if pattern.is_empty() {
        return Ok(None);
    }
    RegexBuilder::new(pattern)
        .multi_line(true)
        .build()
        .map(Some)
}

/// Derive interpreter tokens from a script's `#!` line.
///
/// Returns `None` when the first line is not a shebang, does not tokenize, or
/// names only the `env` launcher. A leading `env` is dropped, and so is an
/// `-S` immediately following it, matching how the kernel plus `env -S`
/// actually launch such scripts.
pub fn parse_shebang(script_path: &Path) -> Option<Vec<String>> {
    let file = std::fs::File::open(script_path).ok()?;
    let mut first = Vec::new();
    std::io::BufReader::new(file)
        .read_until(b'\n', &mut first)
        .ok()?;
    shebang_tokens(&String::from_utf8_lossy(&first))
}

/// Tokenize a shebang line. See [`parse_shebang`].
pub fn shebang_tokens(line: &str) -> Option<Vec<String>> {
    let rest = line.trim().strip_prefix("#!")?;
    let mut tokens = shlex::split(rest.trim())?;
    if tokens
        .first()
        .is_some_and(|t| Path::new(t).file_name() == Some(OsStr::new("env")))
    {
        tokens.remove(0);
        if tokens.first().is_some_and(|t| t == "-S") {
            tokens.remove(0);
        }
    }
    if tokens.is_empty() { None } else { Some(tokens) }
}

/// Resolve one smoke case.
///
/// `script` is relative to the context's repo root. Errors name the script,
/// the case and, for shape errors, the field.
pub fn resolve(
    script: &str,
    case: &str,
    raw: &Value,
    ctx: &ResolveContext,
) -> Result<(InvocationDescriptor, ExpectationDescriptor), SpecError> {
    let check = Checker { script, case };

    let script_path = ctx.repo_root.join(script);
    let script_path = std::path::absolute(&script_path).unwrap_or(script_path);
    if !script_path.is_file() {
        return Err(SpecError::NotFound {
            script: script.to_string(),
            case: case.to_string(),
            path: script_path,
        });
    }

    let spec = raw
        .as_object()
        .ok_or_else(|| check.shape("case", "must be a JSON object"))?;

    let args = check.args(spec)?;
    let command = check.command(spec, &args)?;
    let timeout_secs = check.timeout(spec, ctx.default_timeout_secs)?;
    let patches = check.env(spec)?;
    let expectation = check.expect(spec)?;

    let argv = match command {
        Some(command) => command,
        None => {
            let mut argv =
                parse_shebang(&script_path).ok_or_else(|| SpecError::MissingShebang {
                    script: script.to_string(),
                    case: case.to_string(),
                })?;
            argv.push(script_path.display().to_string());
            argv.extend(args);
            argv
        }
    };

    let mut environment = ctx.baseline_env.clone();
    apply_patches(&mut environment, &patches);

    debug!(script, case, ?argv, timeout_secs, "resolved invocation");

    Ok((
        InvocationDescriptor {
            argv,
            working_directory: ctx.working_directory.clone(),
            environment,
            timeout_secs,
        },
        expectation,
    ))
}

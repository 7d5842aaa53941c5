//! Spec file loader.
//!
//! Finds script spec documents on disk, parses them into loosely-typed JSON
//! values and expands their `smoke` sections into individual cases. Field
//! validation of each case is left to the resolver.

use crate::schema::SuiteConfig;
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Error type for spec loading operations.
#[derive(Debug)]
pub enum LoadError {
    /// Failed to read the file.
    Io(std::io::Error),
    /// Failed to parse JSON.
    Json(serde_json::Error),
    /// Failed to parse YAML.
    Yaml(serde_yaml::Error),
    /// Failed to parse TOML.
    Toml(toml::de::Error),
    /// Unsupported file extension.
    UnsupportedFormat(String),
    /// The document parsed but its `script`/`smoke` layout is wrong.
    Shape { path: PathBuf, message: String },
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadError::Io(e) => write!(f, "failed to read file: {e}"),
            LoadError::Json(e) => write!(f, "invalid JSON: {e}"),
            LoadError::Yaml(e) => write!(f, "invalid YAML: {e}"),
            LoadError::Toml(e) => write!(f, "invalid TOML: {e}"),
            LoadError::UnsupportedFormat(ext) => {
                write!(
                    f,
                    "unsupported file format: {ext} (expected .json, .yaml, .yml, or .toml)"
                )
            }
            LoadError::Shape { path, message } => write!(f, "{}: {message}", path.display()),
        }
    }
}

impl std::error::Error for LoadError {}

/// The name of the suite configuration file.
pub const SUITE_CONFIG_FILENAME: &str = "smoke.yaml";

const SPEC_EXTENSIONS: &[&str] = &["json", "yaml", "yml", "toml"];

/// One discovered smoke case.
#[derive(Debug, Clone)]
pub struct SmokeCase {
    /// Script path relative to the repo root.
    pub script: String,
    /// Trimmed case name.
    pub case: String,
    /// The raw case object, validated later by the resolver.
    pub spec: Value,
    /// Spec document the case came from.
    pub source: PathBuf,
}

/// Load a spec document as an untyped value.
pub fn load_document(path: &Path) -> Result<Value, LoadError> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let contents = std::fs::read_to_string(path).map_err(LoadError::Io)?;

    match ext {
        "json" => serde_json::from_str(&contents).map_err(LoadError::Json),
        "yaml" | "yml" => serde_yaml::from_str(&contents).map_err(LoadError::Yaml),
        "toml" => toml::from_str(&contents).map_err(LoadError::Toml),
        other => Err(LoadError::UnsupportedFormat(other.to_string())),
    }
}

/// Load suite configuration from a directory.
///
/// Looks for `smoke.yaml` in the given directory.
/// Returns `None` if the file doesn't exist, `Err` if it exists but is invalid.
pub fn load_suite_config(dir: &Path) -> Result<Option<SuiteConfig>, LoadError> {
    let config_path = dir.join(SUITE_CONFIG_FILENAME);

    if !config_path.exists() {
        return Ok(None);
    }

    let contents = std::fs::read_to_string(&config_path).map_err(LoadError::Io)?;
    let config: SuiteConfig = serde_yaml::from_str(&contents).map_err(LoadError::Yaml)?;
    Ok(Some(config))
}

/// Find all spec files in a directory or return the single file.
pub fn find_specs(path: &Path) -> Result<Vec<PathBuf>, std::io::Error> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut specs = Vec::new();
    collect_specs_recursive(path, &mut specs)?;
    specs.sort();
    Ok(specs)
}

fn collect_specs_recursive(dir: &Path, specs: &mut Vec<PathBuf>) -> Result<(), std::io::Error> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();

        if path.is_dir() {
            collect_specs_recursive(&path, specs)?;
        } else if let Some(ext) = path.extension().and_then(|e| e.to_str())
            && SPEC_EXTENSIONS.contains(&ext)
        {
            if path.file_name().is_some_and(|f| f == SUITE_CONFIG_FILENAME) {
                continue;
            }
            specs.push(path);
        }
    }
    Ok(())
}

/// Script identifier implied by a spec file's location.
///
/// `<specs_dir>/bin/tool.sh.json` names `bin/tool.sh`.
pub fn script_from_path(specs_dir: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(specs_dir).unwrap_or(path);
    let stripped = relative.with_extension("");
    stripped
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn shape(path: &Path, message: String) -> LoadError {
    LoadError::Shape {
        path: path.to_path_buf(),
        message,
    }
}

/// Expand one parsed spec document into its smoke cases.
pub fn cases_from_document(
    specs_dir: &Path,
    path: &Path,
    doc: &Value,
) -> Result<Vec<SmokeCase>, LoadError> {
    let object = doc
        .as_object()
        .ok_or_else(|| shape(path, "spec document must be an object".to_string()))?;

    let script = match object.get("script") {
        None | Some(Value::Null) => script_from_path(specs_dir, path),
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(_) => {
            return Err(shape(path, "spec.script must be a non-empty string".to_string()));
        }
    };
    // Log files live under `<output_root>/logs/<script>`, so the identifier
    // must stay inside that directory.
    let escapes = Path::new(&script)
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(shape(
            path,
            format!("spec.script must be a relative path without '..': {script}"),
        ));
    }

    let cases = match object.get("smoke") {
        None | Some(Value::Null) | Some(Value::Bool(false)) => return Ok(Vec::new()),
        Some(Value::Array(items)) => items,
        Some(Value::Object(wrapper)) => match wrapper.get("cases") {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(shape(
                    path,
                    format!("spec.smoke must be a list (or {{cases:[...]}}): {script}"),
                ));
            }
        },
        Some(_) => {
            return Err(shape(
                path,
                format!("spec.smoke must be a list (or {{cases:[...]}}): {script}"),
            ));
        }
    };

    let mut seen = HashSet::new();
    let mut discovered = Vec::with_capacity(cases.len());
    for (idx, case) in cases.iter().enumerate() {
        let idx = idx + 1;
        let case_obj = case.as_object().ok_or_else(|| {
            shape(
                path,
                format!("smoke case must be a JSON object: {script} (case {idx})"),
            )
        })?;
        let name = match case_obj.get("name") {
            None => format!("case-{idx}"),
            Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
            Some(_) => {
                return Err(shape(
                    path,
                    format!("smoke case name must be a non-empty string: {script} (case {idx})"),
                ));
            }
        };
        // Log paths are derived from (script, case); duplicates would overwrite.
        if !seen.insert(name.clone()) {
            return Err(shape(
                path,
                format!("duplicate smoke case name {name:?}: {script}"),
            ));
        }
        discovered.push(SmokeCase {
            script: script.clone(),
            case: name,
            spec: case.clone(),
            source: path.to_path_buf(),
        });
    }
    Ok(discovered)
}

/// Discover every smoke case under `specs_dir`, sorted by (script, case).
pub fn discover_cases(specs_dir: &Path) -> Result<Vec<SmokeCase>, LoadError> {
    let paths = find_specs(specs_dir).map_err(LoadError::Io)?;
    let mut discovered = Vec::new();
    for path in &paths {
        let doc = load_document(path)?;
        let cases = cases_from_document(specs_dir, path, &doc)?;
        debug!(path = %path.display(), cases = cases.len(), "loaded spec document");
        discovered.extend(cases);
    }
    discovered.sort_by(|a, b| (&a.script, &a.case).cmp(&(&b.script, &b.case)));
    Ok(discovered)
}

/// Keep cases whose script or case name contains `filter`.
pub fn filter_cases(cases: Vec<SmokeCase>, filter: Option<&str>) -> Vec<SmokeCase> {
    match filter {
        None => cases,
        Some(f) => cases
            .into_iter()
            .filter(|c| c.script.contains(f) || c.case.contains(f))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn load_json_yaml_and_toml_documents() {
        let dir = tempdir().unwrap();
        let json_path = dir.path().join("a.json");
        std::fs::write(&json_path, r#"{"smoke": [{"args": ["--help"]}]}"#).unwrap();
        let yaml_path = dir.path().join("b.yaml");
        std::fs::write(&yaml_path, "smoke:\n  - args: [\"--help\"]\n").unwrap();
        let toml_path = dir.path().join("c.toml");
        std::fs::write(&toml_path, "[[smoke]]\nargs = [\"--help\"]\n").unwrap();

        for path in [json_path, yaml_path, toml_path] {
            let doc = load_document(&path).unwrap();
            assert_eq!(doc["smoke"][0]["args"][0], "--help", "{}", path.display());
        }
    }

    #[test]
    fn load_invalid_yaml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "invalid: [yaml: {").unwrap();

        let result = load_document(&path);
        assert!(matches!(result, Err(LoadError::Yaml(_))));
    }

    #[test]
    fn load_invalid_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{").unwrap();

        assert!(matches!(load_document(&path), Err(LoadError::Json(_))));
    }

    #[test]
    fn unsupported_format() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.txt");
        std::fs::write(&path, "").unwrap();

        let result = load_document(&path);
        assert!(matches!(result, Err(LoadError::UnsupportedFormat(_))));
    }

    #[test]
    fn find_specs_in_directory() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("a.yaml"), "").unwrap();
        std::fs::write(dir.path().join("b.json"), "").unwrap();
        std::fs::write(dir.path().join("nested/c.toml"), "").unwrap();
        std::fs::write(dir.path().join("d.txt"), "").unwrap();

        let specs = find_specs(dir.path()).unwrap();
        assert_eq!(specs.len(), 3);
    }

    #[test]
    fn find_specs_excludes_suite_config() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.yaml"), "").unwrap();
        std::fs::write(dir.path().join("smoke.yaml"), "version: 1").unwrap();

        let specs = find_specs(dir.path()).unwrap();
        assert_eq!(specs.len(), 1);
        assert!(specs[0].file_name().unwrap() != "smoke.yaml");
    }

    #[test]
    fn load_suite_config_not_found() {
        let dir = tempdir().unwrap();
        let result = load_suite_config(dir.path()).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn load_suite_config_valid() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("smoke.yaml"),
            r#"
version: 1
specs_dir: specs
default_timeout_sec: 2.5
env:
  MY_VAR: my_value
"#,
        )
        .unwrap();

        let config = load_suite_config(dir.path()).unwrap().unwrap();
        assert_eq!(config.version, 1);
        assert_eq!(config.specs_dir, PathBuf::from("specs"));
        assert_eq!(config.default_timeout_sec, Some(2.5));
        assert_eq!(config.env.get("MY_VAR"), Some(&Some("my_value".to_string())));
    }

    #[test]
    fn load_suite_config_invalid() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("smoke.yaml"), "invalid: [yaml: {").unwrap();

        let result = load_suite_config(dir.path());
        assert!(matches!(result, Err(LoadError::Yaml(_))));
    }

    #[test]
    fn script_defaults_to_relative_path_without_extension() {
        let specs = Path::new("/repo/tests/script_specs");
        let path = specs.join("bin/tool.sh.json");
        assert_eq!(script_from_path(specs, &path), "bin/tool.sh");
    }

    #[test]
    fn cases_from_list_and_wrapper() {
        let specs = Path::new("/specs");
        let path = specs.join("x.sh.json");
        let list = json!({"smoke": [{"name": " help "}, {}]});
        let cases = cases_from_document(specs, &path, &list).unwrap();
        assert_eq!(cases.len(), 2);
        assert_eq!(cases[0].script, "x.sh");
        assert_eq!(cases[0].case, "help");
        assert_eq!(cases[1].case, "case-2");

        let wrapped = json!({"script": "bin/y", "smoke": {"cases": [{"args": ["a"]}]}});
        let cases = cases_from_document(specs, &path, &wrapped).unwrap();
        assert_eq!(cases[0].script, "bin/y");
        assert_eq!(cases[0].case, "case-1");
        assert_eq!(cases[0].spec["args"][0], "a");
    }

    #[test]
    fn missing_smoke_yields_no_cases() {
        let specs = Path::new("/specs");
        let path = specs.join("x.json");
        assert!(cases_from_document(specs, &path, &json!({})).unwrap().is_empty());
        assert!(
            cases_from_document(specs, &path, &json!({"smoke": false}))
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn malformed_smoke_layouts_are_rejected() {
        let specs = Path::new("/specs");
        let path = specs.join("x.json");
        let bad = [
            json!({"smoke": "yes"}),
            json!({"smoke": {"list": []}}),
            json!({"smoke": [1]}),
            json!({"smoke": [{"name": ""}]}),
            json!({"smoke": [{"name": 3}]}),
            json!({"smoke": [{"name": "a"}, {"name": "a"}]}),
            json!({"script": 5, "smoke": []}),
            json!({"script": "/usr/bin/tool", "smoke": []}),
            json!({"script": "../outside.sh", "smoke": []}),
            json!({"script": "bin/../../outside.sh", "smoke": []}),
            json!([]),
        ];
        for doc in bad {
            let result = cases_from_document(specs, &path, &doc);
            assert!(matches!(result, Err(LoadError::Shape { .. })), "doc: {doc}");
        }
    }

    #[test]
    fn discover_sorts_by_script_then_case() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("b.sh.json"),
            r#"{"smoke": [{"name": "zeta"}, {"name": "alpha"}]}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("a.sh.yaml"), "smoke:\n  - name: only\n").unwrap();

        let cases = discover_cases(dir.path()).unwrap();
        let ids: Vec<_> = cases
            .iter()
            .map(|c| format!("{}:{}", c.script, c.case))
            .collect();
        assert_eq!(ids, vec!["a.sh:only", "b.sh:alpha", "b.sh:zeta"]);
    }

    #[test]
    fn filter_matches_script_or_case() {
        let specs = Path::new("/specs");
        let doc = json!({"smoke": [{"name": "help"}, {"name": "version"}]});
        let cases = cases_from_document(specs, &specs.join("tool.json"), &doc).unwrap();
        assert_eq!(filter_cases(cases.clone(), Some("vers")).len(), 1);
        assert_eq!(filter_cases(cases.clone(), Some("tool")).len(), 2);
        assert_eq!(filter_cases(cases, None).len(), 2);
    }
}

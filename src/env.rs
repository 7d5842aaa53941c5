//! Environment construction for smoke cases.
//!
//! Every child runs with a complete, explicit environment: the host
//! environment, a few fixed variables that keep output reproducible, the
//! suite's patches and finally the case's own patches.

use crate::schema::EnvPatch;
use std::collections::BTreeMap;
use std::ffi::OsString;
use tracing::warn;

/// Variables pinned for every case so output does not depend on the host
/// locale or on an interactive pager.
pub const REPRODUCIBLE_VARS: &[(&str, &str)] = &[
    ("LC_ALL", "C.UTF-8"),
    ("LANG", "C.UTF-8"),
    ("PAGER", "cat"),
    ("GIT_PAGER", "cat"),
];

/// Build the baseline environment shared by all cases of a run.
///
/// Starts from the current process environment, pins [`REPRODUCIBLE_VARS`]
/// and applies the suite-level patches on top. Variables whose name or value
/// is not valid UTF-8 are skipped.
pub fn baseline_env(suite_patches: &BTreeMap<String, EnvPatch>) -> BTreeMap<String, String> {
    baseline_from(std::env::vars_os().filter_map(utf8_var), suite_patches)
}

fn utf8_var((key, value): (OsString, OsString)) -> Option<(String, String)> {
    match (key.into_string(), value.into_string()) {
        (Ok(key), Ok(value)) => Some((key, value)),
        (key, _) => {
            let key = key.unwrap_or_else(|k| k.to_string_lossy().into_owned());
            warn!(key = %key, "skipping environment variable that is not valid UTF-8");
            None
        }
    }
}

/// Same as [`baseline_env`] but with an explicit inherited environment.
pub fn baseline_from<I>(
    inherited: I,
    suite_patches: &BTreeMap<String, EnvPatch>,
) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut env: BTreeMap<String, String> = inherited.into_iter().collect();
    for (key, value) in REPRODUCIBLE_VARS {
        env.insert((*key).to_string(), (*value).to_string());
    }
    apply_patches(&mut env, suite_patches);
    env
}

/// Apply patches in place: `Set` overwrites, `Unset` removes if present.
pub fn apply_patches(env: &mut BTreeMap<String, String>, patches: &BTreeMap<String, EnvPatch>) {
    for (key, patch) in patches {
        match patch {
            EnvPatch::Set(value) => {
                env.insert(key.clone(), value.clone());
            }
            EnvPatch::Unset => {
                env.remove(key);
            }
        }
    }
}

/// Convert the nullable map used by the suite config into patches.
pub fn patches_from_nullable(map: &BTreeMap<String, Option<String>>) -> BTreeMap<String, EnvPatch> {
    map.iter()
        .map(|(k, v)| (k.clone(), EnvPatch::from(v.clone())))
        .collect()
}

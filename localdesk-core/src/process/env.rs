//! Environment augmentation for spawned processes.
//!
//! A desktop app started from a launcher (Finder, a `.desktop` entry, the
//! Start menu) inherits a minimal environment: `PATH` often lacks the
//! Homebrew and `/usr/local` directories and no locale is set. Every child we
//! spawn gets the missing pieces filled in here.

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::path::PathBuf;

/// Locale applied when neither the caller nor the host environment set one.
pub const DEFAULT_LOCALE: &str = "en_US.UTF-8";

const LOCALE_VARS: [&str; 2] = ["LANG", "LC_ALL"];

/// Directories appended to `PATH` when missing.
fn fallback_path_dirs() -> Vec<PathBuf> {
    if cfg!(target_os = "windows") {
        let root = std::env::var("SystemRoot").unwrap_or_else(|_| r"C:\Windows".to_string());
        vec![
            PathBuf::from(&root).join("System32"),
            PathBuf::from(&root).join("System32").join("WindowsPowerShell").join("v1.0"),
        ]
    } else {
        [
            "/opt/homebrew/bin",
            "/usr/local/bin",
            "/usr/bin",
            "/bin",
            "/usr/sbin",
            "/sbin",
        ]
        .iter()
        .map(PathBuf::from)
        .collect()
    }
}

/// Append every entry of `extras` that `base` does not already contain.
///
/// Falls back to the unmodified base when the result cannot be joined (an
/// entry containing the platform separator).
pub fn merge_path(base: Option<&OsStr>, extras: &[PathBuf]) -> OsString {
    let mut entries: Vec<PathBuf> = base
        .map(|b| std::env::split_paths(b).collect())
        .unwrap_or_default();
    for extra in extras {
        if !entries.iter().any(|e| e == extra) {
            entries.push(extra.clone());
        }
    }
    std::env::join_paths(&entries)
        .unwrap_or_else(|_| base.map(OsStr::to_os_string).unwrap_or_default())
}

/// Build the environment overlay for a child process.
///
/// `explicit` wins over everything; `PATH` is always augmented; locale
/// variables are defaulted only when absent from both `explicit` and the
/// host environment.
pub fn augmented_env(explicit: &BTreeMap<String, String>) -> BTreeMap<String, OsString> {
    let mut env: BTreeMap<String, OsString> = explicit
        .iter()
        .map(|(k, v)| (k.clone(), OsString::from(v)))
        .collect();

    let inherited_path = std::env::var_os("PATH");
    let base_path = explicit
        .get("PATH")
        .map(OsString::from)
        .or(inherited_path);
    env.insert(
        "PATH".to_string(),
        merge_path(base_path.as_deref(), &fallback_path_dirs()),
    );

    for var in LOCALE_VARS {
        if !env.contains_key(var) && std::env::var_os(var).is_none() {
            env.insert(var.to_string(), OsString::from(DEFAULT_LOCALE));
        }
    }
    env
}

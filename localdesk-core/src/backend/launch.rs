//! Backend execution strategy selection.

use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::config::BuildMode;
use crate::error::BackendError;

/// Subdirectory of the resources dir holding the backend.
pub const BACKEND_DIR: &str = "backend";

pub fn packaged_executable_name() -> &'static str {
    if cfg!(target_os = "windows") {
        "local-rag-server.exe"
    } else {
        "local-rag-server"
    }
}

pub fn launcher_script_name() -> &'static str {
    if cfg!(target_os = "windows") {
        "start_backend.ps1"
    } else {
        "start_backend.sh"
    }
}

/// How the backend process is executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LaunchStrategy {
    /// A self-contained executable produced by the packaging step.
    Packaged { executable: PathBuf },
    /// A per-OS launcher script run through its interpreter.
    Script {
        interpreter: PathBuf,
        interpreter_args: Vec<String>,
        script: PathBuf,
    },
}

impl LaunchStrategy {
    /// Pick exactly one strategy.
    ///
    /// Packaged builds prefer the standalone executable and fall back to the
    /// launcher script; development builds prefer the script.
    pub fn resolve(build_mode: BuildMode, resources_dir: &Path) -> Result<Self, BackendError> {
        let backend_dir = resources_dir.join(BACKEND_DIR);
        let executable = backend_dir.join(packaged_executable_name());
        let script = backend_dir.join(launcher_script_name());

        let packaged = || {
            executable.is_file().then(|| LaunchStrategy::Packaged {
                executable: executable.clone(),
            })
        };
        let scripted = || script.is_file().then(|| Self::script(script.clone()));

        let chosen = match build_mode {
            BuildMode::Packaged => packaged().or_else(scripted),
            BuildMode::Development => scripted().or_else(packaged),
        };
        chosen.ok_or_else(|| BackendError::LauncherNotFound {
            searched: vec![executable.clone(), script.clone()],
        })
    }

    fn script(script: PathBuf) -> Self {
        if cfg!(target_os = "windows") {
            LaunchStrategy::Script {
                interpreter: PathBuf::from("powershell.exe"),
                interpreter_args: ["-NoProfile", "-ExecutionPolicy", "Bypass", "-File"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
                script,
            }
        } else {
            LaunchStrategy::Script {
                interpreter: PathBuf::from("/bin/sh"),
                interpreter_args: Vec::new(),
                script,
            }
        }
    }

    pub fn program(&self) -> &Path {
        match self {
            LaunchStrategy::Packaged { executable } => executable,
            LaunchStrategy::Script { interpreter, .. } => interpreter,
        }
    }

    pub fn args(&self) -> Vec<String> {
        match self {
            LaunchStrategy::Packaged { .. } => Vec::new(),
            LaunchStrategy::Script {
                interpreter_args,
                script,
                ..
            } => {
                let mut args = interpreter_args.clone();
                args.push(script.display().to_string());
                args
            }
        }
    }

    /// Directory the backend is started in.
    pub fn working_dir(&self) -> Option<&Path> {
        match self {
            LaunchStrategy::Packaged { executable } => executable.parent(),
            LaunchStrategy::Script { script, .. } => script.parent(),
        }
    }
}

impl std::fmt::Display for LaunchStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchStrategy::Packaged { executable } => {
                write!(f, "packaged executable {}", executable.display())
            }
            LaunchStrategy::Script { script, .. } => write!(f, "launcher script {}", script.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "").unwrap();
    }

    #[test]
    fn test_nothing_found_lists_candidates() {
        let dir = tempfile::tempdir().unwrap();
        match LaunchStrategy::resolve(BuildMode::Packaged, dir.path()) {
            Err(BackendError::LauncherNotFound { searched }) => {
                assert_eq!(searched.len(), 2);
                assert!(searched[0].ends_with(packaged_executable_name()));
                assert!(searched[1].ends_with(launcher_script_name()));
            }
            other => panic!("expected LauncherNotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_packaged_prefers_executable() {
        let dir = tempfile::tempdir().unwrap();
        let backend = dir.path().join(BACKEND_DIR);
        touch(&backend.join(packaged_executable_name()));
        touch(&backend.join(launcher_script_name()));

        let strategy = LaunchStrategy::resolve(BuildMode::Packaged, dir.path()).unwrap();
        assert!(matches!(strategy, LaunchStrategy::Packaged { .. }));
        assert!(strategy.args().is_empty());
        assert_eq!(strategy.working_dir(), Some(backend.as_path()));

        let strategy = LaunchStrategy::resolve(BuildMode::Development, dir.path()).unwrap();
        assert!(matches!(strategy, LaunchStrategy::Script { .. }));
    }

    #[test]
    fn test_falls_back_to_script() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join(BACKEND_DIR).join(launcher_script_name());
        touch(&script);

        let strategy = LaunchStrategy::resolve(BuildMode::Packaged, dir.path()).unwrap();
        assert_eq!(
            strategy.args().last().map(String::as_str),
            Some(script.display().to_string().as_str())
        );
        assert!(strategy.to_string().starts_with("launcher script"));
    }

    #[cfg(unix)]
    #[test]
    fn test_unix_script_runs_through_sh() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join(BACKEND_DIR).join(launcher_script_name()));
        let strategy = LaunchStrategy::resolve(BuildMode::Development, dir.path()).unwrap();
        assert_eq!(strategy.program(), Path::new("/bin/sh"));
        assert_eq!(strategy.args().len(), 1);
    }
}

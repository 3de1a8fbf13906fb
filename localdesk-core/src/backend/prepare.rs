//! Cold-start preparation: port reclamation and stale-file cleanup.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::BackendError;
use crate::process::platform;

/// Finds the processes listening on a local TCP port.
#[async_trait]
pub trait PortInspector: Send + Sync {
    /// Pids bound to `port`. An empty list when nothing listens or the
    /// platform tool is unavailable.
    async fn listening_pids(&self, port: u16) -> Vec<u32>;
}

/// Inspector backed by `lsof` on Unix and `netstat` on Windows.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPortInspector;

#[async_trait]
impl PortInspector for SystemPortInspector {
    async fn listening_pids(&self, port: u16) -> Vec<u32> {
        if cfg!(target_os = "windows") {
            match run_tool("netstat", &["-ano", "-p", "tcp"]).await {
                Some(output) => parse_netstat_pids(&output, port),
                None => Vec::new(),
            }
        } else {
            let port_arg = format!("-iTCP:{port}");
            // lsof exits 1 when nothing matches; the empty output covers it.
            match run_tool("lsof", &["-nP", "-t", &port_arg, "-sTCP:LISTEN"]).await {
                Some(output) => parse_lsof_pids(&output),
                None => Vec::new(),
            }
        }
    }
}

async fn run_tool(program: &str, args: &[&str]) -> Option<String> {
    match tokio::process::Command::new(program)
        .args(args)
        .stdin(std::process::Stdio::null())
        .output()
        .await
    {
        Ok(output) => Some(String::from_utf8_lossy(&output.stdout).into_owned()),
        Err(e) => {
            debug!(program, error = %e, "port inspection tool unavailable");
            None
        }
    }
}

/// Parse `lsof -t` output: one pid per line.
pub fn parse_lsof_pids(output: &str) -> Vec<u32> {
    let mut pids: Vec<u32> = output
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

/// Parse `netstat -ano` output for listeners on `port`.
pub fn parse_netstat_pids(output: &str, port: u16) -> Vec<u32> {
    let suffix = format!(":{port}");
    let mut pids: Vec<u32> = output
        .lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            match cols.as_slice() {
                [proto, local, _foreign, state, pid]
                    if proto.eq_ignore_ascii_case("tcp")
                        && local.ends_with(&suffix)
                        && state.eq_ignore_ascii_case("listening") =>
                {
                    pid.parse().ok()
                }
                _ => None,
            }
        })
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

/// Force-kill whatever listens on `port`, never touching this process.
///
/// Returns the pids that were killed. Finding no owner is the normal case.
pub async fn reclaim_port(inspector: &dyn PortInspector, port: u16) -> Vec<u32> {
    let own_pid = std::process::id();
    let mut killed = Vec::new();
    for pid in inspector.listening_pids(port).await {
        if pid == 0 || pid == own_pid {
            continue;
        }
        if platform::force_kill(pid).await {
            info!(port, pid, "killed orphaned process holding backend port");
            killed.push(pid);
        } else {
            warn!(port, pid, "could not kill process holding backend port");
        }
    }
    killed
}

/// Create the backend home directory if needed.
pub async fn ensure_home(home: &Path) -> Result<(), BackendError> {
    tokio::fs::create_dir_all(home)
        .await
        .map_err(|e| BackendError::Storage {
            path: home.to_path_buf(),
            message: e.to_string(),
        })
}

/// Delete leftover lock and marker files below `home`.
///
/// Failures are logged and ignored. Returns the files that were removed.
pub async fn clear_stale_files(home: &Path, relative: &[PathBuf]) -> Vec<PathBuf> {
    let mut removed = Vec::new();
    for rel in relative {
        let path = home.join(rel);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!(path = %path.display(), "removed stale file");
                removed.push(path);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove stale file"),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct FixedInspector(Vec<u32>);

    #[async_trait]
    impl PortInspector for FixedInspector {
        async fn listening_pids(&self, _port: u16) -> Vec<u32> {
            self.0.clone()
        }
    }

    #[test]
    fn test_parse_lsof_output() {
        assert_eq!(parse_lsof_pids("4242\n17\n4242\n\n"), vec![17, 4242]);
        assert!(parse_lsof_pids("").is_empty());
    }

    #[test]
    fn test_parse_netstat_output() {
        let output = "\
Active Connections

  Proto  Local Address          Foreign Address        State           PID
  TCP    0.0.0.0:8890           0.0.0.0:0              LISTENING       5120
  TCP    127.0.0.1:18890        0.0.0.0:0              LISTENING       77
  TCP    127.0.0.1:8890         127.0.0.1:50311        ESTABLISHED     5120
  TCP    [::]:8890              [::]:0                 LISTENING       5120
";
        assert_eq!(parse_netstat_pids(output, 8890), vec![5120]);
        assert_eq!(parse_netstat_pids(output, 18890), vec![77]);
        assert!(parse_netstat_pids(output, 9000).is_empty());
    }

    #[tokio::test]
    async fn test_reclaim_skips_own_pid() {
        let inspector = FixedInspector(vec![0, std::process::id()]);
        assert!(reclaim_port(&inspector, 8890).await.is_empty());
    }

    #[tokio::test]
    async fn test_clear_stale_files() {
        let dir = tempfile::tempdir().unwrap();
        let lock = PathBuf::from("qdrant_data").join(".lock");
        std::fs::create_dir_all(dir.path().join("qdrant_data")).unwrap();
        std::fs::write(dir.path().join(&lock), "").unwrap();

        let removed = clear_stale_files(
            dir.path(),
            &[lock.clone(), PathBuf::from("local_key.txt")],
        )
        .await;
        assert_eq!(removed, vec![dir.path().join(&lock)]);
        assert!(!dir.path().join(&lock).exists());
    }

    #[tokio::test]
    async fn test_ensure_home_creates_nested_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().join("a").join("local_rag");
        ensure_home(&home).await.unwrap();
        assert!(home.is_dir());
    }
}

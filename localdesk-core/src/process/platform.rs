//! OS-specific process termination.

use tracing::{debug, warn};

/// Reject pids that would address a process group or overflow `pid_t`.
#[cfg(unix)]
fn as_pid_t(pid: u32) -> Option<i32> {
    if pid == 0 {
        return None;
    }
    i32::try_from(pid).ok()
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: i32) -> bool {
    let Some(raw) = as_pid_t(pid) else {
        warn!(pid, "refusing to signal invalid pid");
        return false;
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    unsafe { libc::kill(raw, signal) == 0 }
}

/// Signal every member of the process group led by `pid`.
#[cfg(unix)]
fn send_group_signal(pid: u32, signal: i32) -> bool {
    let Some(raw) = as_pid_t(pid) else {
        warn!(pid, "refusing to signal invalid process group");
        return false;
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    unsafe { libc::kill(-raw, signal) == 0 }
}

/// Terminate a process and, where the platform allows it, its descendants.
///
/// Launchers spawn helper processes that outlive their parent. On Windows the
/// whole tree is reclaimed with `taskkill /T /F`; elsewhere every spawned
/// child leads its own process group, which gets `SIGTERM`.
pub async fn terminate_tree(pid: u32) -> bool {
    #[cfg(windows)]
    {
        taskkill(pid, true).await
    }
    #[cfg(unix)]
    {
        debug!(pid, "sending SIGTERM to process group");
        send_group_signal(pid, libc::SIGTERM)
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = pid;
        false
    }
}

/// Force-kill an arbitrary process by pid.
pub async fn force_kill(pid: u32) -> bool {
    #[cfg(windows)]
    {
        taskkill(pid, false).await
    }
    #[cfg(unix)]
    {
        debug!(pid, "sending SIGKILL");
        send_signal(pid, libc::SIGKILL)
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = pid;
        false
    }
}

/// Force-kill the process group led by `pid`. `false` where process groups
/// are not available.
pub fn kill_group(pid: u32) -> bool {
    #[cfg(unix)]
    {
        debug!(pid, "sending SIGKILL to process group");
        send_group_signal(pid, libc::SIGKILL)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

#[cfg(windows)]
async fn taskkill(pid: u32, tree: bool) -> bool {
    let pid_arg = pid.to_string();
    let mut args = vec!["/PID", pid_arg.as_str(), "/F"];
    if tree {
        args.push("/T");
    }
    debug!(pid, tree, "running taskkill");
    match tokio::process::Command::new("taskkill")
        .args(&args)
        .output()
        .await
    {
        Ok(output) => output.status.success(),
        Err(e) => {
            warn!(pid, error = %e, "taskkill failed to run");
            false
        }
    }
}

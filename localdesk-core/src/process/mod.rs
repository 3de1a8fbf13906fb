//! Process handle shared by the service manager and the backend supervisor.
//!
//! A [`ProcessHandle`] owns nothing but channels: the spawned
//! `tokio::process::Child` lives inside a supervising task which reaps it,
//! executes termination requests and publishes the exit exactly once. Output
//! is pumped line by line into a caller-provided sink.

pub mod classify;
pub mod env;
pub mod platform;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

pub use classify::{LineLevel, classify_line};

/// Which pipe a line of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for OutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputStream::Stdout => write!(f, "stdout"),
            OutputStream::Stderr => write!(f, "stderr"),
        }
    }
}

/// Receives every line a process writes, tagged with its stream.
pub type LineSink = Arc<dyn Fn(OutputStream, &str) + Send + Sync>;

/// How a process should be terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateMode {
    /// Immediate force kill of the process itself.
    Kill,
    /// Platform termination of the process and its helpers.
    Tree,
}

/// How a process ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// Set when the exit status itself could not be collected.
    pub error: Option<String>,
}

impl ExitInfo {
    fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
            error: None,
        }
    }

    fn failed(message: String) -> Self {
        Self {
            error: Some(message),
            ..Self::default()
        }
    }

    /// Exit code as a shell would report it: signals map to `128 + signal`.
    pub fn exit_code(&self) -> Option<i32> {
        self.code.or(self.signal.map(|s| 128 + s))
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Everything needed to spawn one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub label: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub current_dir: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn new(label: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            label: label.into(),
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            current_dir: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn envs(mut self, env: BTreeMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }
}

/// Handle to one running (or exited) process.
#[derive(Debug)]
pub struct ProcessHandle {
    label: String,
    pid: Option<u32>,
    control: mpsc::UnboundedSender<TerminateMode>,
    exit: watch::Receiver<Option<ExitInfo>>,
}

impl ProcessHandle {
    /// Spawn the process described by `spec`.
    ///
    /// Must be called from within a Tokio runtime; the supervising and
    /// output-pumping tasks are spawned onto it.
    pub fn spawn(spec: &ProcessSpec, sink: LineSink) -> std::io::Result<Self> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(env::augmented_env(&spec.env))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.current_dir {
            cmd.current_dir(dir);
        }
        // Leading a fresh group lets termination reach the child's helpers.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn()?;
        let pid = child.id();
        debug!(label = %spec.label, pid = ?pid, program = %spec.program.display(), "spawned process");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_lines(stdout, OutputStream::Stdout, sink.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_lines(stderr, OutputStream::Stderr, sink));
        }

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(supervise(child, pid, spec.label.clone(), control_rx, exit_tx));

        Ok(Self {
            label: spec.label.clone(),
            pid,
            control: control_tx,
            exit: exit_rx,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The exit, if the process has already ended.
    pub fn try_exit(&self) -> Option<ExitInfo> {
        self.exit.borrow().clone()
    }

    /// Wait for the process to end.
    pub async fn wait_exit(&self) -> ExitInfo {
        let mut rx = self.exit.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(exit) => exit.clone().unwrap_or_default(),
            // The supervisor only drops its sender after publishing.
            Err(_) => ExitInfo::failed("process supervisor went away".into()),
        }
    }

    /// A receiver that observes the exit; useful inside `select!`.
    pub fn exit_receiver(&self) -> watch::Receiver<Option<ExitInfo>> {
        self.exit.clone()
    }

    /// Request termination. A no-op when the process has already exited.
    pub fn terminate(&self, mode: TerminateMode) {
        if self.control.send(mode).is_err() {
            debug!(label = %self.label, "terminate requested after exit");
        }
    }
}

/// Owns the child until it exits, executing termination requests.
async fn supervise(
    mut child: Child,
    pid: Option<u32>,
    label: String,
    mut control: mpsc::UnboundedReceiver<TerminateMode>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
) {
    let exit = loop {
        tokio::select! {
            status = child.wait() => {
                break match status {
                    Ok(status) => ExitInfo::from_status(status),
                    Err(e) => ExitInfo::failed(e.to_string()),
                };
            }
            Some(mode) = control.recv() => match (mode, pid) {
                (TerminateMode::Tree, Some(pid)) => {
                    if !platform::terminate_tree(pid).await {
                        warn!(%label, pid, "tree termination failed, killing directly");
                        let _ = child.start_kill();
                    }
                }
                _ => {
                    if !pid.is_some_and(platform::kill_group)
                        && let Err(e) = child.start_kill()
                    {
                        warn!(%label, error = %e, "kill failed");
                    }
                }
            },
        }
    };
    debug!(%label, code = ?exit.code, signal = ?exit.signal, "process exited");
    let _ = exit_tx.send(Some(exit));
}

async fn pump_lines<R>(reader: R, stream: OutputStream, sink: LineSink)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end_matches(['\r', '\n']);
                if !line.is_empty() {
                    sink(stream, line);
                }
            }
            Err(e) => {
                debug!(%stream, error = %e, "output pipe closed");
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    fn collecting_sink() -> (LineSink, Arc<Mutex<Vec<(OutputStream, String)>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let captured = lines.clone();
        let sink: LineSink = Arc::new(move |stream: OutputStream, line: &str| {
            captured.lock().unwrap().push((stream, line.to_string()));
        });
        (sink, lines)
    }

    #[tokio::test]
    async fn test_exit_code_and_output_are_captured() {
        let (sink, lines) = collecting_sink();
        let spec = ProcessSpec::new("echo", "/bin/sh")
            .args(["-c", "echo hello; echo oops >&2; exit 3"]);
        let handle = ProcessHandle::spawn(&spec, sink).unwrap();
        assert!(handle.pid().is_some());

        let exit = handle.wait_exit().await;
        assert_eq!(exit.code, Some(3));
        assert_eq!(exit.exit_code(), Some(3));
        assert!(!exit.success());

        // Output pumps may finish just after the exit is observed.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let lines = lines.lock().unwrap();
        assert!(lines.contains(&(OutputStream::Stdout, "hello".to_string())));
        assert!(lines.contains(&(OutputStream::Stderr, "oops".to_string())));
    }

    #[tokio::test]
    async fn test_kill_ends_a_sleeping_process() {
        let (sink, _) = collecting_sink();
        let spec = ProcessSpec::new("sleeper", "/bin/sh").args(["-c", "exec sleep 30"]);
        let handle = ProcessHandle::spawn(&spec, sink).unwrap();
        assert!(handle.try_exit().is_none());

        handle.terminate(TerminateMode::Kill);
        let exit = tokio::time::timeout(Duration::from_secs(5), handle.wait_exit())
            .await
            .unwrap();
        assert_eq!(exit.signal, Some(libc::SIGKILL));
        assert_eq!(exit.exit_code(), Some(128 + libc::SIGKILL));
        assert!(handle.try_exit().is_some());
    }

    #[tokio::test]
    async fn test_tree_termination_sends_sigterm() {
        let (sink, _) = collecting_sink();
        let spec = ProcessSpec::new("sleeper", "/bin/sh").args(["-c", "exec sleep 30"]);
        let handle = ProcessHandle::spawn(&spec, sink).unwrap();
        handle.terminate(TerminateMode::Tree);
        let exit = tokio::time::timeout(Duration::from_secs(5), handle.wait_exit())
            .await
            .unwrap();
        assert_eq!(exit.signal, Some(libc::SIGTERM));
    }

    #[tokio::test]
    async fn test_tree_termination_reaches_background_helpers() {
        let dir = tempfile::tempdir().unwrap();
        let flag = dir.path().join("helper-survived");
        let (sink, _) = collecting_sink();
        let spec = ProcessSpec::new("launcher", "/bin/sh").args([
            "-c".to_string(),
            "(sleep 1; touch \"$0\") & sleep 30".to_string(),
            flag.display().to_string(),
        ]);
        let handle = ProcessHandle::spawn(&spec, sink).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.terminate(TerminateMode::Tree);
        tokio::time::timeout(Duration::from_secs(5), handle.wait_exit())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!flag.exists());
    }

    #[tokio::test]
    async fn test_terminate_after_exit_is_harmless() {
        let (sink, _) = collecting_sink();
        let spec = ProcessSpec::new("true", "/bin/sh").args(["-c", "exit 0"]);
        let handle = ProcessHandle::spawn(&spec, sink).unwrap();
        assert!(handle.wait_exit().await.success());
        handle.terminate(TerminateMode::Kill);
        assert!(handle.try_exit().unwrap().success());
    }

    #[tokio::test]
    async fn test_explicit_env_reaches_child() {
        let (sink, lines) = collecting_sink();
        let mut env = BTreeMap::new();
        env.insert("LOCALDESK_PROBE".to_string(), "42".to_string());
        let spec = ProcessSpec::new("env", "/bin/sh")
            .args(["-c", "echo \"probe=$LOCALDESK_PROBE\""])
            .envs(env);
        let handle = ProcessHandle::spawn(&spec, sink).unwrap();
        handle.wait_exit().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(
            lines
                .lock()
                .unwrap()
                .iter()
                .any(|(_, l)| l == "probe=42")
        );
    }

    #[test]
    fn test_spawn_missing_program_fails() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();
        let (sink, _) = collecting_sink();
        let spec = ProcessSpec::new("missing", "/nonexistent/binary");
        assert!(ProcessHandle::spawn(&spec, sink).is_err());
    }
}

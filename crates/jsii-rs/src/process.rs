//! Kernel process supervision.
//!
//! Locates, spawns, and watches the `jsii-runtime` child process. The
//! child's stderr is drained on a background task into a bounded tail that
//! crash reports include; when tracing is enabled the lines are also
//! mirrored verbatim to the host's stderr. An exit monitor publishes the
//! exit status on a watch channel, since losing the kernel loses all state.

use crate::config::KernelConfig;
use crate::error::{JsiiError, Result};
use std::collections::{HashMap, VecDeque};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

/// How to locate and configure the kernel child process.
///
/// The defaults read the process environment the way the other language
/// runtimes do; builder overrides exist for embedding and tests.
#[derive(Debug, Clone)]
pub struct KernelSpec {
    executable: Option<PathBuf>,
    debug: Option<bool>,
    expected_version: String,
    env: HashMap<String, String>,
}

impl Default for KernelSpec {
    fn default() -> Self {
        Self::from_env()
    }
}

impl KernelSpec {
    /// Spec resolving the executable and debug flag from the environment.
    pub fn from_env() -> Self {
        Self {
            executable: None,
            debug: None,
            expected_version: KernelConfig::RUNTIME_VERSION.to_string(),
            env: HashMap::new(),
        }
    }

    /// Use a specific kernel executable instead of the env/PATH lookup.
    pub fn with_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.executable = Some(path.into());
        self
    }

    /// Force the trace flag on or off regardless of the environment.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = Some(debug);
        self
    }

    /// Override the version the handshake will accept.
    pub fn with_expected_version(mut self, version: impl Into<String>) -> Self {
        self.expected_version = version.into();
        self
    }

    /// Pass an extra environment variable to the child.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn expected_version(&self) -> &str {
        &self.expected_version
    }

    fn resolve_executable(&self) -> PathBuf {
        executable_from(
            self.executable.as_ref(),
            std::env::var_os(KernelConfig::RUNTIME_ENV_VAR),
        )
    }

    fn debug_enabled(&self) -> bool {
        self.debug.unwrap_or_else(|| {
            std::env::var(KernelConfig::DEBUG_ENV_VAR)
                .map(|value| debug_flag_enabled(&value))
                .unwrap_or(false)
        })
    }
}

fn executable_from(explicit: Option<&PathBuf>, env_value: Option<OsString>) -> PathBuf {
    if let Some(path) = explicit {
        return path.clone();
    }
    match env_value {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => PathBuf::from(KernelConfig::RUNTIME_EXECUTABLE),
    }
}

/// Whether a `JSII_DEBUG` value turns tracing on.
pub(crate) fn debug_flag_enabled(value: &str) -> bool {
    !value.is_empty() && value != "0" && !value.eq_ignore_ascii_case("false")
}

/// A running kernel child process.
///
/// The stdio pipes are handed to the engine at spawn time; this struct keeps
/// the supervision side: exit status, kill switch, and the stderr tail.
#[derive(Debug)]
pub struct KernelProcess {
    exit_rx: watch::Receiver<Option<String>>,
    kill_tx: Option<oneshot::Sender<()>>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    pid: Option<u32>,
}

impl KernelProcess {
    /// Spawns the kernel and wires up the stderr drain and exit monitor.
    ///
    /// Returns the process handle together with the child's stdin and
    /// stdout, which the protocol engine owns exclusively.
    pub fn spawn(spec: &KernelSpec) -> Result<(KernelProcess, ChildStdin, ChildStdout)> {
        let executable = spec.resolve_executable();
        let debug_enabled = spec.debug_enabled();

        if debug_enabled {
            debug!("jsii-runtime: {}", executable.display());
        }

        let mut command = Command::new(&executable);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // The kernel requires a UTF-8 locale for its stdio.
        let lang_is_utf8 = std::env::var("LANG")
            .map(|lang| lang.to_ascii_uppercase().contains("UTF-8"))
            .unwrap_or(false);
        if !lang_is_utf8 {
            command.env("LANG", "C.UTF-8");
        }

        if debug_enabled {
            command.env(KernelConfig::DEBUG_ENV_VAR, "1");
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|e| JsiiError::EnvMisconfigured {
            env_var: KernelConfig::RUNTIME_ENV_VAR.to_string(),
            fallback: KernelConfig::RUNTIME_EXECUTABLE.to_string(),
            message: format!("{}: {}", executable.display(), e),
            source: Some(e),
        })?;

        let pid = child.id();
        let stdin = child.stdin.take().expect("stdin was piped");
        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        info!("launched jsii-runtime (pid {:?})", pid);

        let stderr_tail = Arc::new(Mutex::new(VecDeque::new()));
        let tail = stderr_tail.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if debug_enabled {
                    // Kernel traces go to the host's stderr verbatim.
                    eprintln!("{}", line);
                }
                let mut tail = tail.lock().unwrap_or_else(|e| e.into_inner());
                if tail.len() == KernelConfig::STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        });

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = &mut kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let rendered = match status {
                Ok(status) => status.to_string(),
                Err(e) => format!("unknown ({})", e),
            };
            debug!("jsii-runtime terminated: {}", rendered);
            let _ = exit_tx.send(Some(rendered));
        });

        Ok((
            KernelProcess {
                exit_rx,
                kill_tx: Some(kill_tx),
                stderr_tail,
                pid,
            },
            stdin,
            stdout,
        ))
    }

    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    /// The retained tail of the child's stderr, newline-joined.
    pub fn stderr_tail(&self) -> String {
        let tail = self
            .stderr_tail
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// Waits up to `limit` for the child to exit; returns the rendered exit
    /// status when it did.
    pub(crate) async fn wait_exit(&mut self, limit: Duration) -> Option<String> {
        if let Some(status) = self.exit_rx.borrow().clone() {
            return Some(status);
        }
        let waited = tokio::time::timeout(limit, async {
            loop {
                if self.exit_rx.changed().await.is_err() {
                    return None;
                }
                let status = self.exit_rx.borrow().clone();
                if status.is_some() {
                    return status;
                }
            }
        })
        .await;
        waited.ok().flatten()
    }

    /// Graceful stop: the caller has closed stdin already; wait out the
    /// grace period, then kill.
    pub async fn stop(&mut self, grace: Duration) -> Result<()> {
        if let Some(status) = self.wait_exit(grace).await {
            debug!("kernel exited on its own: {}", status);
            return Ok(());
        }
        warn!("kernel did not exit within {:?}, killing it", grace);
        self.kill().await;
        Ok(())
    }

    /// Immediate termination, used when the engine poisons itself.
    pub(crate) async fn kill(&mut self) {
        if let Some(kill) = self.kill_tx.take() {
            let _ = kill.send(());
        }
        let _ = self.wait_exit(KernelConfig::KILL_WAIT).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_flag_recognition() {
        assert!(debug_flag_enabled("1"));
        assert!(debug_flag_enabled("yes"));
        assert!(debug_flag_enabled("TRUE"));
        assert!(!debug_flag_enabled(""));
        assert!(!debug_flag_enabled("0"));
        assert!(!debug_flag_enabled("false"));
        assert!(!debug_flag_enabled("FALSE"));
    }

    #[test]
    fn test_executable_resolution_order() {
        let explicit = PathBuf::from("/opt/kernel/jsii-runtime");
        assert_eq!(
            executable_from(Some(&explicit), Some("/env/override".into())),
            explicit
        );
        assert_eq!(
            executable_from(None, Some("/env/override".into())),
            PathBuf::from("/env/override")
        );
        assert_eq!(
            executable_from(None, Some(OsString::new())),
            PathBuf::from(KernelConfig::RUNTIME_EXECUTABLE)
        );
        assert_eq!(
            executable_from(None, None),
            PathBuf::from(KernelConfig::RUNTIME_EXECUTABLE)
        );
    }

    #[tokio::test]
    async fn test_spawn_failure_names_override_and_fallback() {
        let spec = KernelSpec::from_env()
            .with_executable("/nonexistent/definitely-not-a-kernel");
        let err = KernelProcess::spawn(&spec).unwrap_err();
        let message = err.to_string();
        assert!(message.contains(KernelConfig::RUNTIME_ENV_VAR));
        assert!(message.contains(KernelConfig::RUNTIME_EXECUTABLE));
        assert_eq!(err.exit_code(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_pipes_and_graceful_stop() {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

        let spec = KernelSpec::from_env().with_executable("/bin/cat");
        let (mut process, mut stdin, stdout) = KernelProcess::spawn(&spec).unwrap();
        assert!(process.id().is_some());

        stdin.write_all(b"ping\n").await.unwrap();
        stdin.flush().await.unwrap();

        let mut line = String::new();
        BufReader::new(stdout).read_line(&mut line).await.unwrap();
        assert_eq!(line, "ping\n");

        // cat exits on stdin EOF.
        drop(stdin);
        process.stop(Duration::from_secs(5)).await.unwrap();
        assert!(process.wait_exit(Duration::from_millis(10)).await.is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stderr_tail_is_collected() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("noisy.sh");
        std::fs::write(&script, "#!/bin/sh\necho oops >&2\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let spec = KernelSpec::from_env()
            .with_executable(&script)
            .with_debug(false);
        let (mut process, stdin, _stdout) = KernelProcess::spawn(&spec).unwrap();
        drop(stdin);
        process.stop(Duration::from_secs(5)).await.unwrap();

        // The drain task races process exit; poll briefly.
        let mut tail = String::new();
        for _ in 0..50 {
            tail = process.stderr_tail();
            if !tail.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(tail, "oops");
    }
}

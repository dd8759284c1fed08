//! Container engine interface.
//!
//! The harness needs a narrow slice of an OCI engine: build an image from a
//! dockerfile + context, create/start a container, exec inside it with a
//! wall-clock deadline, copy files in and out, stop and remove. Everything
//! is driven over the engine's CLI (`docker` by default, any argv-compatible
//! binary works) via `std::process::Command`; no daemon API client is linked.
//!
//! Child output is always read on dedicated threads with a hard byte cap so
//! a runaway container cannot exhaust harness memory.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Cap for captured stdout of control commands (`create`, `inspect`, ...).
const CONTROL_STDOUT_CAP: usize = 256 * 1024;
/// Cap for captured stderr of any engine command.
const CONTROL_STDERR_CAP: usize = 256 * 1024;

#[derive(Debug)]
pub enum EngineError {
    /// The engine binary is missing or the daemon is not answering.
    Unavailable { message: String },
    /// The engine command ran and exited nonzero.
    CommandFailed {
        op: String,
        exit_code: Option<i32>,
        stderr: String,
    },
    /// The engine command exceeded its wall-clock deadline.
    TimedOut { op: String },
    Io {
        op: String,
        source: std::io::Error,
    },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Unavailable { message } => {
                write!(f, "container engine unavailable: {message}")
            }
            EngineError::CommandFailed {
                op,
                exit_code,
                stderr,
            } => write!(
                f,
                "engine command failed: {op} (exit={}) stderr={stderr}",
                exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string())
            ),
            EngineError::TimedOut { op } => write!(f, "engine command timed out: {op}"),
            EngineError::Io { op, source } => write!(f, "engine io error during {op}: {source}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl EngineError {
    /// True when retrying against the same engine is pointless and the whole
    /// run should abort rather than fail one instance.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Unavailable { .. })
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Outcome of an exec with captured output.
#[derive(Debug)]
pub struct ExecOutput {
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Outcome of an exec whose output went to a log file.
#[derive(Debug, Clone, Copy)]
pub struct ExecStatus {
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    /// The caller's cancel flag was raised; the child was killed early.
    pub cancelled: bool,
}

#[derive(Debug, Clone)]
pub struct Engine {
    bin: PathBuf,
}

impl Engine {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }

    pub fn bin(&self) -> &Path {
        &self.bin
    }

    /// Probe the engine. Returns the server version string.
    pub fn ping(&self) -> EngineResult<String> {
        let out = self.run_control(
            "ping",
            &["version", "--format", "{{.Server.Version}}"],
            Duration::from_secs(20),
        )?;
        if !out.success() {
            return Err(EngineError::Unavailable {
                message: stderr_snippet(&out.stderr),
            });
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    /// Build `tag` from `context_dir/Dockerfile`, streaming build output to
    /// `log_path`. The context directory must already contain every file the
    /// dockerfile references.
    pub fn build_image(
        &self,
        tag: &str,
        context_dir: &Path,
        network: bool,
        log_path: &Path,
        timeout: Duration,
    ) -> EngineResult<()> {
        let log = open_log(log_path)?;
        let context = context_dir.to_string_lossy().to_string();
        let mut args: Vec<&str> = vec!["build", "--tag", tag];
        if !network {
            args.extend_from_slice(&["--network", "none"]);
        }
        args.push(&context);

        let status = self.run_streamed("build_image", &args, timeout, log)?;
        if status.timed_out {
            return Err(EngineError::TimedOut {
                op: format!("build_image {tag}"),
            });
        }
        if status.exit_code != Some(0) {
            return Err(EngineError::CommandFailed {
                op: format!("build_image {tag}"),
                exit_code: status.exit_code,
                stderr: format!("see build log: {}", log_path.display()),
            });
        }
        Ok(())
    }

    pub fn image_exists(&self, tag: &str) -> EngineResult<bool> {
        let out = self.run_control(
            "image_exists",
            &["image", "inspect", "--format", "{{.Id}}", tag],
            Duration::from_secs(30),
        )?;
        Ok(out.success())
    }

    pub fn remove_image(&self, tag: &str) -> EngineResult<()> {
        let out = self.run_control(
            "remove_image",
            &["image", "rm", "--force", tag],
            Duration::from_secs(60),
        )?;
        // Removing an already-absent image is not an error.
        let _ = out;
        Ok(())
    }

    /// Create a container parked on a no-op command so the harness can exec
    /// into it repeatedly. Returns the engine's container id.
    pub fn create_container(
        &self,
        image_tag: &str,
        name: &str,
        network: bool,
    ) -> EngineResult<String> {
        let mut args: Vec<&str> = vec!["create", "--name", name];
        if !network {
            args.extend_from_slice(&["--network", "none"]);
        }
        args.extend_from_slice(&[image_tag, "tail", "-f", "/dev/null"]);

        let out = self.run_control("create_container", &args, Duration::from_secs(120))?;
        if !out.success() {
            return Err(EngineError::CommandFailed {
                op: format!("create_container {name}"),
                exit_code: out.exit_code,
                stderr: stderr_snippet(&out.stderr),
            });
        }
        let id = String::from_utf8_lossy(&out.stdout).trim().to_string();
        if id.is_empty() {
            return Err(EngineError::CommandFailed {
                op: format!("create_container {name}"),
                exit_code: out.exit_code,
                stderr: "engine printed no container id".to_string(),
            });
        }
        Ok(id)
    }

    pub fn start_container(&self, id: &str) -> EngineResult<()> {
        let out = self.run_control("start_container", &["start", id], Duration::from_secs(120))?;
        if !out.success() {
            return Err(EngineError::CommandFailed {
                op: format!("start_container {id}"),
                exit_code: out.exit_code,
                stderr: stderr_snippet(&out.stderr),
            });
        }
        Ok(())
    }

    pub fn copy_in(&self, id: &str, src: &Path, dest: &str) -> EngineResult<()> {
        let src_s = src.to_string_lossy().to_string();
        let dest_s = format!("{id}:{dest}");
        let out = self.run_control(
            "copy_in",
            &["cp", &src_s, &dest_s],
            Duration::from_secs(300),
        )?;
        if !out.success() {
            return Err(EngineError::CommandFailed {
                op: format!("copy_in {dest}"),
                exit_code: out.exit_code,
                stderr: stderr_snippet(&out.stderr),
            });
        }
        Ok(())
    }

    /// Copy a path out of the container. Missing source is reported as
    /// `Ok(false)` so callers can treat optional report trees as absent.
    pub fn copy_out(&self, id: &str, src: &str, dest: &Path) -> EngineResult<bool> {
        let src_s = format!("{id}:{src}");
        let dest_s = dest.to_string_lossy().to_string();
        let out = self.run_control(
            "copy_out",
            &["cp", &src_s, &dest_s],
            Duration::from_secs(300),
        )?;
        Ok(out.success())
    }

    /// Run `sh -c script` inside the container, capturing output up to
    /// `max_output_bytes` per stream.
    pub fn exec_capture(
        &self,
        id: &str,
        workdir: Option<&str>,
        script: &str,
        timeout: Duration,
        max_output_bytes: usize,
    ) -> EngineResult<ExecOutput> {
        let mut args: Vec<&str> = vec!["exec"];
        if let Some(dir) = workdir {
            args.extend_from_slice(&["--workdir", dir]);
        }
        args.extend_from_slice(&[id, "/bin/sh", "-c", script]);
        self.run_capture("exec", &args, timeout, max_output_bytes, CONTROL_STDERR_CAP)
    }

    /// Run `sh -c script` inside the container with combined stdout+stderr
    /// appended to an open log file. A raised `cancel` flag kills the exec
    /// client early and reports `cancelled`.
    pub fn exec_streamed(
        &self,
        id: &str,
        workdir: Option<&str>,
        script: &str,
        timeout: Duration,
        log: File,
        cancel: Option<&AtomicBool>,
    ) -> EngineResult<ExecStatus> {
        let mut args: Vec<&str> = vec!["exec"];
        if let Some(dir) = workdir {
            args.extend_from_slice(&["--workdir", dir]);
        }
        args.extend_from_slice(&[id, "/bin/sh", "-c", script]);
        self.run_streamed_cancellable("exec", &args, timeout, log, cancel)
    }

    pub fn stop_container(&self, id: &str, grace_seconds: u64) -> EngineResult<()> {
        let grace = grace_seconds.to_string();
        let out = self.run_control(
            "stop_container",
            &["stop", "--time", &grace, id],
            Duration::from_secs(grace_seconds.saturating_add(60)),
        )?;
        let _ = out;
        Ok(())
    }

    /// Force-remove the container and its anonymous volumes. Safe to call on
    /// an already-removed container.
    pub fn remove_container(&self, id: &str) -> EngineResult<()> {
        let out = self.run_control(
            "remove_container",
            &["rm", "--force", "--volumes", id],
            Duration::from_secs(120),
        )?;
        let _ = out;
        Ok(())
    }

    pub fn container_exists(&self, id: &str) -> EngineResult<bool> {
        let out = self.run_control(
            "container_exists",
            &["container", "inspect", "--format", "{{.Id}}", id],
            Duration::from_secs(30),
        )?;
        Ok(out.success())
    }

    fn run_control(&self, op: &str, args: &[&str], timeout: Duration) -> EngineResult<ExecOutput> {
        self.run_capture(op, args, timeout, CONTROL_STDOUT_CAP, CONTROL_STDERR_CAP)
    }

    fn run_capture(
        &self,
        op: &str,
        args: &[&str],
        timeout: Duration,
        stdout_cap: usize,
        stderr_cap: usize,
    ) -> EngineResult<ExecOutput> {
        let mut child = Command::new(&self.bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(op, e))?;

        let stdout = child.stdout.take().ok_or_else(|| EngineError::Io {
            op: op.to_string(),
            source: std::io::Error::other("child stdout missing"),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| EngineError::Io {
            op: op.to_string(),
            source: std::io::Error::other("child stderr missing"),
        })?;

        let stdout_thread =
            std::thread::spawn(move || read_to_end_capped(stdout, stdout_cap.saturating_add(1)));
        let stderr_thread =
            std::thread::spawn(move || read_to_end_capped(stderr, stderr_cap.saturating_add(1)));

        let (status, timed_out) = wait_with_deadline(&mut child, timeout).map_err(|e| {
            EngineError::Io {
                op: op.to_string(),
                source: e,
            }
        })?;

        let (stdout_bytes, stdout_truncated) = stdout_thread
            .join()
            .unwrap_or_else(|_| Ok((Vec::new(), false)))
            .map_err(|e| EngineError::Io {
                op: op.to_string(),
                source: e,
            })?;
        let (stderr_bytes, stderr_truncated) = stderr_thread
            .join()
            .unwrap_or_else(|_| Ok((Vec::new(), false)))
            .map_err(|e| EngineError::Io {
                op: op.to_string(),
                source: e,
            })?;

        Ok(ExecOutput {
            exit_code: status.and_then(|s| s.code()),
            timed_out,
            stdout: stdout_bytes,
            stderr: stderr_bytes,
            stdout_truncated,
            stderr_truncated,
        })
    }

    fn run_streamed(
        &self,
        op: &str,
        args: &[&str],
        timeout: Duration,
        log: File,
    ) -> EngineResult<ExecStatus> {
        self.run_streamed_cancellable(op, args, timeout, log, None)
    }

    fn run_streamed_cancellable(
        &self,
        op: &str,
        args: &[&str],
        timeout: Duration,
        log: File,
        cancel: Option<&AtomicBool>,
    ) -> EngineResult<ExecStatus> {
        let log_err = log.try_clone().map_err(|e| EngineError::Io {
            op: op.to_string(),
            source: e,
        })?;

        let mut child = Command::new(&self.bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(|e| spawn_error(op, e))?;

        let (status, timed_out, cancelled) =
            wait_with_deadline_cancellable(&mut child, timeout, cancel).map_err(|e| {
                EngineError::Io {
                    op: op.to_string(),
                    source: e,
                }
            })?;

        Ok(ExecStatus {
            exit_code: status.and_then(|s| s.code()),
            timed_out,
            cancelled,
        })
    }
}

fn spawn_error(op: &str, e: std::io::Error) -> EngineError {
    if e.kind() == std::io::ErrorKind::NotFound {
        EngineError::Unavailable {
            message: "engine binary not found on PATH".to_string(),
        }
    } else {
        EngineError::Io {
            op: op.to_string(),
            source: e,
        }
    }
}

/// Poll-wait for the child up to `timeout`; kill and reap on expiry.
fn wait_with_deadline(
    child: &mut std::process::Child,
    timeout: Duration,
) -> std::io::Result<(Option<std::process::ExitStatus>, bool)> {
    let (status, timed_out, _) = wait_with_deadline_cancellable(child, timeout, None)?;
    Ok((status, timed_out))
}

fn wait_with_deadline_cancellable(
    child: &mut std::process::Child,
    timeout: Duration,
    cancel: Option<&AtomicBool>,
) -> std::io::Result<(Option<std::process::ExitStatus>, bool, bool)> {
    let deadline = Instant::now().checked_add(timeout);
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok((Some(status), false, false));
        }
        if cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
            let _ = child.kill();
            let status = child.wait()?;
            return Ok((Some(status), false, true));
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            let _ = child.kill();
            let status = child.wait()?;
            return Ok((Some(status), true, false));
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Read until EOF or `cap` bytes. The second element reports truncation.
pub fn read_to_end_capped<R: Read>(mut reader: R, cap: usize) -> std::io::Result<(Vec<u8>, bool)> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            return Ok((buf, false));
        }
        let remaining = cap.saturating_sub(buf.len());
        if n >= remaining {
            buf.extend_from_slice(&chunk[..remaining]);
            // Drain the rest so the child is not blocked on a full pipe.
            loop {
                let n = reader.read(&mut chunk)?;
                if n == 0 {
                    break;
                }
            }
            return Ok((buf, true));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn open_log(path: &Path) -> EngineResult<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| EngineError::Io {
            op: format!("create log dir {}", parent.display()),
            source: e,
        })?;
    }
    File::create(path).map_err(|e| EngineError::Io {
        op: format!("create log {}", path.display()),
        source: e,
    })
}

fn stderr_snippet(bytes: &[u8]) -> String {
    let clipped = &bytes[..bytes.len().min(4096)];
    String::from_utf8_lossy(clipped).replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_capped_truncates_and_drains() {
        let data = vec![b'x'; 100_000];
        let (buf, truncated) = read_to_end_capped(&data[..], 1024).unwrap();
        assert_eq!(buf.len(), 1024);
        assert!(truncated);

        let (buf, truncated) = read_to_end_capped(&data[..], 200_000).unwrap();
        assert_eq!(buf.len(), 100_000);
        assert!(!truncated);
    }

    #[test]
    fn exec_output_success_requires_zero_exit_and_no_timeout() {
        let out = ExecOutput {
            exit_code: Some(0),
            timed_out: false,
            stdout: Vec::new(),
            stderr: Vec::new(),
            stdout_truncated: false,
            stderr_truncated: false,
        };
        assert!(out.success());

        let timed = ExecOutput {
            timed_out: true,
            ..out
        };
        assert!(!timed.success());
    }

    #[test]
    fn missing_binary_is_unavailable() {
        let engine = Engine::new("/nonexistent/patchbench-no-such-engine");
        match engine.ping() {
            Err(EngineError::Unavailable { .. }) => {}
            other => panic!("expected Unavailable, got {other:?}"),
        }
    }

    #[test]
    fn stderr_snippet_flattens_newlines() {
        assert_eq!(stderr_snippet(b"a\nb"), "a\\nb");
    }
}

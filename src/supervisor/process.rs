//! Thin wrapper around one child process.
//!
//! `ProcessHandle` is the shared side (pid, stdin, signals, exit flag);
//! `ProcessOutput` is moved into the drain task and owns the output pipes
//! and the `Child` itself. The child is reaped as soon as it exits, even when
//! a helper process it left behind still holds the output pipes open.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{watch, Mutex};

use super::console::LineSource;

/// After the child exits, how long the readers may keep draining pipes
/// that descendants still hold open.
pub const EXIT_DRAIN_GRACE: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("spawned process has no pid (already exited?)")]
    NoPid,
    #[error("process {pid} has already exited")]
    Exited { pid: u32 },
    #[error("failed to signal process {pid}: {reason}")]
    Signal { pid: u32, reason: String },
}

pub struct ProcessHandle {
    pid: u32,
    stdin: Mutex<Option<ChildStdin>>,
    exited: watch::Receiver<bool>,
}

pub struct ProcessOutput {
    child: Child,
    stdout: Option<BufReader<ChildStdout>>,
    stderr: Option<BufReader<ChildStderr>>,
    exited: watch::Sender<bool>,
}

impl ProcessHandle {
    /// Spawn `program` with piped stdin/stdout/stderr in `working_dir`.
    pub fn spawn(
        program: &Path,
        args: &[String],
        working_dir: &Path,
    ) -> Result<(ProcessHandle, ProcessOutput), ProcessError> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);

        // Windows: hide console window
        crate::utils::apply_creation_flags(&mut cmd);

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: program.display().to_string(),
            source,
        })?;
        let pid = child.id().ok_or(ProcessError::NoPid)?;

        let (exit_tx, exit_rx) = watch::channel(false);
        let stdin = child.stdin.take();
        let stdout = child.stdout.take().map(BufReader::new);
        let stderr = child.stderr.take().map(BufReader::new);

        tracing::debug!("Spawned '{}' with pid {}", program.display(), pid);

        Ok((
            ProcessHandle {
                pid,
                stdin: Mutex::new(stdin),
                exited: exit_rx,
            },
            ProcessOutput {
                child,
                stdout,
                stderr,
                exited: exit_tx,
            },
        ))
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Write `text` plus a newline to stdin and flush.
    pub async fn send_line(&self, text: &str) -> std::io::Result<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stdin closed"))?;
        let data = format!("{}\n", text);
        if let Err(e) = async {
            stdin.write_all(data.as_bytes()).await?;
            stdin.flush().await
        }
        .await
        {
            // 파이프가 깨졌으면 이후 쓰기는 시도하지 않음
            *guard = None;
            return Err(e);
        }
        Ok(())
    }

    /// Whether the child has been reaped.
    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Wait up to `timeout` for the child to be reaped. Returns true if it exited.
    pub async fn wait_exit(&self, timeout: Duration) -> bool {
        let mut rx = self.exited.clone();
        // a dropped sender also counts: the drain task is gone, nothing left to wait on
        let waited = tokio::time::timeout(timeout, async move {
            let _ = rx.wait_for(|exited| *exited).await;
        })
        .await;
        waited.is_ok()
    }

    /// Ask the process to terminate (SIGTERM on unix).
    pub fn terminate(&self) -> Result<(), ProcessError> {
        self.signal(false)
    }

    /// Kill the process outright (SIGKILL on unix).
    pub fn kill(&self) -> Result<(), ProcessError> {
        self.signal(true)
    }

    fn signal(&self, force: bool) -> Result<(), ProcessError> {
        if self.has_exited() {
            return Err(ProcessError::Exited { pid: self.pid });
        }
        let signal_name = if force { "KILL" } else { "TERM" };
        tracing::info!("Sending {} signal to pid {}", signal_name, self.pid);
        send_signal(self.pid, force)
    }
}

impl ProcessOutput {
    /// Hand every stdout/stderr line to `sink` until the child exits, reap it
    /// and publish the exit to every `ProcessHandle` waiter.
    ///
    /// Output still buffered when the child exits is drained for up to
    /// `EXIT_DRAIN_GRACE`; pipes kept open by descendants are then abandoned.
    /// Invalid UTF-8 is replaced, not fatal.
    pub async fn pump_until_exit<F>(mut self, sink: F) -> std::io::Result<ExitStatus>
    where
        F: Fn(LineSource, String),
    {
        let stdout = self.stdout.take();
        let stderr = self.stderr.take();
        let pumps = async {
            tokio::join!(
                pump(stdout, LineSource::Stdout, &sink),
                pump(stderr, LineSource::Stderr, &sink),
            );
        };
        tokio::pin!(pumps);

        let status = tokio::select! {
            status = self.child.wait() => {
                if tokio::time::timeout(EXIT_DRAIN_GRACE, &mut pumps).await.is_err() {
                    tracing::debug!("Output pipes still open after pid exit, detaching readers");
                }
                status
            }
            _ = &mut pumps => self.child.wait().await,
        };
        let _ = self.exited.send(true);
        status
    }
}

async fn pump<R, F>(reader: Option<R>, source: LineSource, sink: &F)
where
    R: AsyncBufRead + Unpin,
    F: Fn(LineSource, String),
{
    let Some(mut reader) = reader else {
        return;
    };
    let mut buf = Vec::with_capacity(256);
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                while matches!(buf.last(), Some(b'\n') | Some(b'\r')) {
                    buf.pop();
                }
                sink(source, String::from_utf8_lossy(&buf).into_owned());
            }
            Err(e) => {
                tracing::debug!("{:?} reader stopped: {}", source, e);
                break;
            }
        }
    }
}

#[cfg(not(target_os = "windows"))]
fn send_signal(pid: u32, force: bool) -> Result<(), ProcessError> {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let sig = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    signal::kill(Pid::from_raw(pid as i32), sig).map_err(|e| ProcessError::Signal {
        pid,
        reason: e.to_string(),
    })
}

#[cfg(target_os = "windows")]
fn send_signal(pid: u32, force: bool) -> Result<(), ProcessError> {
    use winapi::um::handleapi::CloseHandle;
    use winapi::um::processthreadsapi::{OpenProcess, TerminateProcess};
    use winapi::um::winnt::PROCESS_TERMINATE;

    // Windows has no SIGTERM; both paths end in TerminateProcess
    unsafe {
        let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
        if handle.is_null() {
            return Err(ProcessError::Signal {
                pid,
                reason: "OpenProcess failed".to_string(),
            });
        }
        let exit_code = if force { 1 } else { 0 };
        let result = TerminateProcess(handle, exit_code);
        CloseHandle(handle);
        if result == 0 {
            return Err(ProcessError::Signal {
                pid,
                reason: "TerminateProcess failed".to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};

    #[tokio::test]
    async fn test_spawn_echo_and_reap() {
        let dir = tempfile::tempdir().unwrap();
        let args = vec!["-c".to_string(), "echo out; echo err 1>&2".to_string()];
        let (handle, mut output) = ProcessHandle::spawn(Path::new("/bin/sh"), &args, dir.path()).unwrap();
        assert!(handle.pid() > 0);

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let status = output
            .pump_until_exit(move |source, line| sink.lock().unwrap().push((source, line)))
            .await
            .unwrap();
        assert!(status.success());
        assert!(handle.has_exited());
        assert!(handle.wait_exit(Duration::from_millis(10)).await);

        let seen = seen.lock().unwrap();
        assert!(seen.contains(&(LineSource::Stdout, "out".to_string())));
        assert!(seen.contains(&(LineSource::Stderr, "err".to_string())));
    }

    #[tokio::test]
    async fn test_stdin_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let args = vec!["-c".to_string(), "read line; echo \"got $line\"".to_string()];
        let (handle, output) = ProcessHandle::spawn(Path::new("/bin/sh"), &args, dir.path()).unwrap();
        handle.send_line("hello").await.unwrap();

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        output
            .pump_until_exit(move |_, line| sink.lock().unwrap().push(line))
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["got hello".to_string()]);
    }

    #[tokio::test]
    async fn test_terminate_unresponsive_child() {
        let dir = tempfile::tempdir().unwrap();
        let args = vec!["-c".to_string(), "exec sleep 30".to_string()];
        let (handle, output) = ProcessHandle::spawn(Path::new("/bin/sh"), &args, dir.path()).unwrap();
        let drain = tokio::spawn(output.pump_until_exit(|_, _| {}));

        assert!(!handle.wait_exit(Duration::from_millis(100)).await);
        handle.terminate().unwrap();
        assert!(handle.wait_exit(Duration::from_secs(5)).await);
        drain.await.unwrap().unwrap();

        // signalling a reaped process is refused
        assert!(matches!(handle.kill(), Err(ProcessError::Exited { .. })));
    }

    #[tokio::test]
    async fn test_exit_detected_while_helper_holds_pipes() {
        let dir = tempfile::tempdir().unwrap();
        let args = vec!["-c".to_string(), "echo started; sleep 8 & exit 4".to_string()];
        let (handle, output) = ProcessHandle::spawn(Path::new("/bin/sh"), &args, dir.path()).unwrap();

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let status = tokio::time::timeout(
            Duration::from_secs(4),
            output.pump_until_exit(move |_, line| sink.lock().unwrap().push(line)),
        )
        .await
        .expect("exit must not wait for the background sleep")
        .unwrap();

        assert_eq!(status.code(), Some(4));
        assert!(handle.has_exited());
        assert_eq!(*seen.lock().unwrap(), vec!["started".to_string()]);
        println!("✓ exit detected with inherited pipes still open");
    }

    #[tokio::test]
    async fn test_spawn_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let result = ProcessHandle::spawn(Path::new("/definitely/not/here/java"), &[], dir.path());
        assert!(matches!(result, Err(ProcessError::Spawn { .. })));
    }
}

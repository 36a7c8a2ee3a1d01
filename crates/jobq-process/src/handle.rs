//! `ProcessHandle`: one supervised child process.
//!
//! stdout and stderr are drained by background tasks into shared buffers, so
//! the child never blocks on a full pipe while the supervisor only polls.
//! The supervisor reads what arrived since its last poll with
//! [`ProcessHandle::take_new_output`], and the whole capture once the child
//! has exited.

use std::{
    process::{ExitStatus, Stdio},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, Command},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{
    error::{ProcessError, Result},
    memory::{self, MemorySample},
};

/// How long `finish` waits for the pipes to close after the child exited.
/// A grandchild that inherited them can keep them open indefinitely.
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

type Buffer = Arc<Mutex<Vec<u8>>>;

/// What to run: program, arguments and extra environment.
#[derive(Debug, Clone, Default)]
pub struct SpawnRequest {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl SpawnRequest {
    /// Build a request from an argv whose first element is the program.
    ///
    /// # Errors
    ///
    /// - `Spawn`: `argv` is empty.
    pub fn from_argv(argv: Vec<String>) -> Result<Self> {
        let mut parts = argv.into_iter();
        let program = parts
            .next()
            .ok_or_else(|| ProcessError::Spawn("empty command line".to_string()))?;
        Ok(Self {
            program,
            args: parts.collect(),
            env: Vec::new(),
        })
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// A running (or exited, not yet dropped) child process.
///
/// Dropping the handle kills a child that is still alive.
pub struct ProcessHandle {
    child: Child,
    pid: Option<u32>,
    started: Instant,
    ended: Option<Instant>,
    status: Option<ExitStatus>,
    stdout: Buffer,
    stderr: Buffer,
    stdout_read: usize,
    stderr_read: usize,
    readers: Vec<JoinHandle<()>>,
    peak: MemorySample,
}

impl ProcessHandle {
    /// Start `request` with stdin closed and stdout/stderr captured.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// - `Spawn`: the OS refused to start the program.
    pub fn spawn(request: &SpawnRequest) -> Result<Self> {
        let mut child = Command::new(&request.program)
            .args(&request.args)
            .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProcessError::Spawn(format!("{}: {e}", request.program)))?;

        let pid = child.id();
        let stdout: Buffer = Arc::default();
        let stderr: Buffer = Arc::default();
        let mut readers = Vec::with_capacity(2);
        if let Some(pipe) = child.stdout.take() {
            readers.push(pump(pipe, Arc::clone(&stdout)));
        }
        if let Some(pipe) = child.stderr.take() {
            readers.push(pump(pipe, Arc::clone(&stderr)));
        }

        debug!(?pid, program = %request.program, "child spawned");
        let mut handle = Self {
            child,
            pid,
            started: Instant::now(),
            ended: None,
            status: None,
            stdout,
            stderr,
            stdout_read: 0,
            stderr_read: 0,
            readers,
            peak: MemorySample::default(),
        };
        handle.sample_memory();
        Ok(handle)
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Poll the child without blocking. Also refreshes the memory peak.
    pub fn is_alive(&mut self) -> Result<bool> {
        if self.status.is_some() {
            return Ok(false);
        }
        self.sample_memory();
        match self.child.try_wait()? {
            Some(status) => {
                self.record_exit(status);
                Ok(false)
            }
            None => Ok(true),
        }
    }

    /// Exit code once the child exited. A child killed by signal `n` reports
    /// `128 + n`, as a shell would.
    pub fn exit_code(&self) -> Option<i32> {
        self.status.map(exit_code_of)
    }

    /// Wall-clock time from spawn until exit, or until now while running.
    pub fn wall_clock(&self) -> Duration {
        self.ended.unwrap_or_else(Instant::now) - self.started
    }

    pub fn peak_memory(&self) -> MemorySample {
        self.peak
    }

    /// stdout captured since the previous call.
    pub fn take_new_output(&mut self) -> String {
        take_new(&self.stdout, &mut self.stdout_read)
    }

    /// stderr captured since the previous call.
    pub fn take_new_error_output(&mut self) -> String {
        take_new(&self.stderr, &mut self.stderr_read)
    }

    /// Everything captured on stdout so far.
    pub fn output(&self) -> String {
        String::from_utf8_lossy(&self.stdout.lock().unwrap()).into_owned()
    }

    /// Everything captured on stderr so far.
    pub fn error_output(&self) -> String {
        String::from_utf8_lossy(&self.stderr.lock().unwrap()).into_owned()
    }

    /// Wait for the child to exit and for its pipes to drain.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        let status = match self.status {
            Some(status) => status,
            None => {
                let status = self.child.wait().await?;
                self.record_exit(status);
                status
            }
        };
        self.drain_pipes().await;
        Ok(status)
    }

    /// Stop the child: SIGTERM, then SIGKILL if it is still alive after `grace`.
    pub async fn terminate(&mut self, grace: Duration) -> Result<ExitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }

        if let Some(pid) = self.pid {
            send_sigterm(pid)?;
            match tokio::time::timeout(grace, self.child.wait()).await {
                Ok(status) => {
                    let status = status?;
                    self.record_exit(status);
                    debug!(pid, "child exited after SIGTERM");
                }
                Err(_elapsed) => {
                    warn!(pid, grace_ms = grace.as_millis() as u64, "child ignored SIGTERM; killing");
                }
            }
        }

        if self.status.is_none() {
            self.child.kill().await?;
            let status = self.child.wait().await?;
            self.record_exit(status);
        }
        self.wait().await
    }

    fn record_exit(&mut self, status: ExitStatus) {
        self.status = Some(status);
        self.ended = Some(Instant::now());
    }

    fn sample_memory(&mut self) {
        if let Some(sample) = self.pid.and_then(memory::sample) {
            self.peak = self.peak.max(sample);
        }
    }

    async fn drain_pipes(&mut self) {
        for reader in self.readers.drain(..) {
            let abort = reader.abort_handle();
            if tokio::time::timeout(PIPE_DRAIN_TIMEOUT, reader).await.is_err() {
                warn!(pid = ?self.pid, "output pipe still open after exit; giving up on it");
                abort.abort();
            }
        }
    }
}

fn pump<R>(mut pipe: R, sink: Buffer) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => sink.lock().unwrap().extend_from_slice(&chunk[..n]),
                Err(e) => {
                    warn!(error = %e, "reading child output failed");
                    break;
                }
            }
        }
    })
}

/// Decode bytes past `*read`, stopping before an incomplete trailing UTF-8
/// sequence so it is returned whole by a later call.
fn take_new(buffer: &Mutex<Vec<u8>>, read: &mut usize) -> String {
    let data = buffer.lock().unwrap();
    let fresh = &data[*read..];
    let end = match std::str::from_utf8(fresh) {
        Ok(_) => fresh.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => fresh.len(),
    };
    *read += end;
    String::from_utf8_lossy(&fresh[..end]).into_owned()
}

#[cfg(unix)]
fn exit_code_of(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code_of(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[cfg(unix)]
fn send_sigterm(pid: u32) -> Result<()> {
    // Safety: plain kill(2) on our own child's pid.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        // Already gone; the following wait reaps it.
        return Ok(());
    }
    Err(ProcessError::Signal {
        pid,
        reason: err.to_string(),
    })
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) -> Result<()> {
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> SpawnRequest {
        SpawnRequest {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), script.into()],
            env: Vec::new(),
        }
    }

    async fn wait_until_exit(handle: &mut ProcessHandle) {
        while handle.is_alive().unwrap() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn captures_exit_code_and_output() {
        let mut handle = ProcessHandle::spawn(&sh("echo out; echo err >&2; exit 3")).unwrap();
        wait_until_exit(&mut handle).await;
        handle.wait().await.unwrap();

        assert_eq!(handle.exit_code(), Some(3));
        assert_eq!(handle.output(), "out\n");
        assert_eq!(handle.error_output(), "err\n");
    }

    #[tokio::test]
    async fn incremental_output_is_not_repeated() {
        let mut handle =
            ProcessHandle::spawn(&sh("echo one; sleep 0.3; echo two")).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(handle.take_new_output(), "one\n");

        handle.wait().await.unwrap();
        assert_eq!(handle.take_new_output(), "two\n");
        assert_eq!(handle.take_new_output(), "");
        assert_eq!(handle.output(), "one\ntwo\n");
    }

    #[tokio::test]
    async fn environment_is_passed() {
        let request = sh("printf %s \"$JOBQ_JOB_ID\"").env("JOBQ_JOB_ID", "17");
        let mut handle = ProcessHandle::spawn(&request).unwrap();
        handle.wait().await.unwrap();
        assert_eq!(handle.output(), "17");
        assert_eq!(handle.exit_code(), Some(0));
    }

    #[tokio::test]
    async fn terminate_uses_sigterm_first() {
        let mut handle = ProcessHandle::spawn(&sh("exec sleep 30")).unwrap();
        assert!(handle.is_alive().unwrap());

        let started = Instant::now();
        handle.terminate(Duration::from_secs(5)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(handle.exit_code(), Some(128 + libc::SIGTERM));
        assert!(!handle.is_alive().unwrap());
    }

    #[tokio::test]
    async fn terminate_escalates_to_sigkill() {
        let mut handle =
            ProcessHandle::spawn(&sh("trap '' TERM; while :; do sleep 0.05; done")).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        handle.terminate(Duration::from_millis(200)).await.unwrap();
        assert_eq!(handle.exit_code(), Some(128 + libc::SIGKILL));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let request = SpawnRequest::from_argv(vec!["/nonexistent/jobq-test".into()]).unwrap();
        assert!(matches!(
            ProcessHandle::spawn(&request),
            Err(ProcessError::Spawn(_))
        ));
        assert!(SpawnRequest::from_argv(Vec::new()).is_err());
    }

    #[tokio::test]
    async fn wall_clock_stops_at_exit() {
        let mut handle = ProcessHandle::spawn(&sh("exit 0")).unwrap();
        handle.wait().await.unwrap();
        let first = handle.wall_clock();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.wall_clock(), first);
    }

    #[test]
    fn split_utf8_sequence_waits_for_completion() {
        let buffer = Mutex::new("a€".as_bytes()[..2].to_vec());
        let mut read = 0;
        assert_eq!(take_new(&buffer, &mut read), "a");
        buffer.lock().unwrap().extend_from_slice(&"€".as_bytes()[1..]);
        assert_eq!(take_new(&buffer, &mut read), "€");
    }
}

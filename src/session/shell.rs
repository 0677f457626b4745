//! Privileged Shell
//!
//! A persistent shell process driven through its stdin. Every job runs as a
//! child shell leading its own process group and is followed by a marker line
//! on both output streams. The reader tasks use the markers to learn the job's
//! process group, to find where its output ends and to pick up its exit status.

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{BridgeError, BridgeResult};

/// Output stream of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

impl std::fmt::Display for OutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Line sinks a job writes into
pub struct JobSinks {
    pub stdout: mpsc::UnboundedSender<String>,
    pub stderr: mpsc::UnboundedSender<String>,
}

/// Receiving ends matching a [`JobSinks`]
pub struct JobOutput {
    pub stdout: mpsc::UnboundedReceiver<String>,
    pub stderr: mpsc::UnboundedReceiver<String>,
}

impl JobSinks {
    /// Create a sink pair with its receivers
    pub fn channel() -> (Self, JobOutput) {
        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
        (
            Self {
                stdout: stdout_tx,
                stderr: stderr_tx,
            },
            JobOutput {
                stdout: stdout_rx,
                stderr: stderr_rx,
            },
        )
    }
}

/// Drain a line receiver until every sender is gone
pub async fn collect_lines(mut rx: mpsc::UnboundedReceiver<String>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(line) = rx.recv().await {
        lines.push(line);
    }
    lines
}

struct StreamRoute {
    lines: mpsc::UnboundedSender<String>,
    done: oneshot::Sender<Option<i32>>,
}

/// Marker suffix announcing the process group of a job
const GROUP_TAG: &str = ":pgid:";

/// Where the readers send output of the job currently running
struct JobRoute {
    marker: String,
    group: Option<u32>,
    stdout: Option<StreamRoute>,
    stderr: Option<StreamRoute>,
}

impl JobRoute {
    fn stream_mut(&mut self, stream: OutputStream) -> &mut Option<StreamRoute> {
        match stream {
            OutputStream::Stdout => &mut self.stdout,
            OutputStream::Stderr => &mut self.stderr,
        }
    }
}

type RouteSlot = Arc<Mutex<Option<JobRoute>>>;

/// An open privileged shell
pub struct PrivilegedSession {
    id: String,
    pid: u32,
    child: Child,
    /// Held for the whole duration of a job, so jobs never overlap.
    stdin: tokio::sync::Mutex<ChildStdin>,
    route: RouteSlot,
    alive: Arc<AtomicBool>,
    readers: Vec<JoinHandle<()>>,
    close_timeout: Duration,
    #[cfg(test)]
    fail_close: bool,
}

impl PrivilegedSession {
    /// Start `program args...` with piped stdio
    pub async fn open(
        program: &str,
        args: &[String],
        close_timeout: Duration,
    ) -> BridgeResult<Self> {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            BridgeError::SessionUnavailable(format!("failed to start {}: {}", program, e))
        })?;

        let pid = child.id().unwrap_or(0);
        let missing = |name: &str| {
            BridgeError::SessionUnavailable(format!("{} of {} is not piped", name, program))
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let id = uuid::Uuid::new_v4().to_string();
        let route: RouteSlot = Arc::new(Mutex::new(None));
        let alive = Arc::new(AtomicBool::new(true));

        let readers = vec![
            tokio::spawn(pump_lines(
                stdout,
                OutputStream::Stdout,
                Arc::clone(&route),
                Arc::clone(&alive),
                id.clone(),
            )),
            tokio::spawn(pump_lines(
                stderr,
                OutputStream::Stderr,
                Arc::clone(&route),
                Arc::clone(&alive),
                id.clone(),
            )),
        ];

        info!("Opened privileged session {} ({} pid {})", id, program, pid);

        Ok(Self {
            id,
            pid,
            child,
            stdin: tokio::sync::Mutex::new(stdin),
            route,
            alive,
            readers,
            close_timeout,
            #[cfg(test)]
            fail_close: false,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// False once the shell's output pipes reached EOF
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Run one command line, streaming its lines into `sinks`.
    ///
    /// Returns the command's exit status. The sinks are released before this
    /// returns, so receivers drain to completion afterwards.
    pub async fn run_job(&self, command: &str, sinks: JobSinks) -> BridgeResult<i32> {
        let mut stdin = self.stdin.lock().await;

        let marker = format!("__KSU_JOB_{}__", uuid::Uuid::new_v4().simple());
        let (stdout_done_tx, stdout_done_rx) = oneshot::channel();
        let (stderr_done_tx, stderr_done_rx) = oneshot::channel();

        {
            let mut slot = self.route.lock();
            if !self.is_alive() {
                return Err(BridgeError::SessionLost(self.id.clone()));
            }
            *slot = Some(JobRoute {
                marker: marker.clone(),
                group: None,
                stdout: Some(StreamRoute {
                    lines: sinks.stdout,
                    done: stdout_done_tx,
                }),
                stderr: Some(StreamRoute {
                    lines: sinks.stderr,
                    done: stderr_done_tx,
                }),
            });
        }

        debug!("Session {} running job: {}", self.id, command);

        let script = job_script(command, &marker);
        let written = async {
            stdin.write_all(script.as_bytes()).await?;
            stdin.flush().await
        }
        .await;

        if let Err(e) = written {
            warn!("Session {} rejected job input: {}", self.id, e);
            self.route.lock().take();
            return Err(BridgeError::SessionLost(self.id.clone()));
        }

        let exit_code = stdout_done_rx.await;
        let stderr_done = stderr_done_rx.await;
        self.route.lock().take();

        match (exit_code, stderr_done) {
            (Ok(Some(code)), Ok(_)) => Ok(code),
            (Ok(None), Ok(_)) => {
                warn!("Session {} returned an unreadable exit status", self.id);
                Ok(-1)
            }
            _ => Err(BridgeError::SessionLost(self.id.clone())),
        }
    }

    /// Process group of the job in flight.
    ///
    /// A job reports its group as its first line, so this waits up to `wait`
    /// for a job that was written but has not reported yet.
    pub async fn job_group(&self, wait: Duration) -> Option<u32> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let reported = self.route.lock().as_ref().map(|job| job.group);
            match reported {
                None => return None,
                Some(Some(group)) => return Some(group),
                Some(None) => {}
            }
            if !self.is_alive() || tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Make `close` report a failure after shutting the shell down
    #[cfg(test)]
    pub(crate) fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    /// Ask the shell to exit, killing it if it outlives the close timeout
    pub async fn close(mut self) -> BridgeResult<()> {
        let id = self.id.clone();
        let mut stdin = self.stdin.into_inner();
        let _ = stdin.write_all(b"exit\n").await;
        drop(stdin);

        let result = match tokio::time::timeout(self.close_timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!("Session {} exited with {}", id, status);
                Ok(())
            }
            Ok(Err(e)) => Err(BridgeError::SessionClose {
                id: id.clone(),
                reason: e.to_string(),
            }),
            Err(_) => {
                warn!("Force killing session {} (pid {})", id, self.pid);
                self.child
                    .kill()
                    .await
                    .map_err(|e| BridgeError::SessionClose {
                        id: id.clone(),
                        reason: e.to_string(),
                    })
            }
        };

        for reader in self.readers.drain(..) {
            reader.abort();
        }
        self.alive.store(false, Ordering::SeqCst);

        info!("Closed privileged session {}", id);

        #[cfg(test)]
        if self.fail_close {
            return Err(BridgeError::SessionClose {
                id,
                reason: "close failure requested".to_string(),
            });
        }
        result
    }

    /// Kill the shell immediately
    pub async fn kill(mut self) -> BridgeResult<()> {
        warn!("Killing privileged session {} (pid {})", self.id, self.pid);
        let result = self
            .child
            .kill()
            .await
            .map_err(|e| BridgeError::SessionClose {
                id: self.id.clone(),
                reason: e.to_string(),
            });

        for reader in self.readers.drain(..) {
            reader.abort();
        }
        self.alive.store(false, Ordering::SeqCst);
        result
    }
}

/// Quote `text` as a single shell word
fn single_quoted(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

/// Wrap a command so it cannot leak shell state and so its end is marked on
/// both streams.
///
/// The command runs in a child `sh` that becomes a process group leader when
/// `setsid` is available and reports its pid first. stdout carries the exit
/// status after the closing marker.
fn job_script(command: &str, marker: &str) -> String {
    format!(
        "__ksu_setsid=; command -v setsid >/dev/null 2>&1 && __ksu_setsid=setsid\n\
         $__ksu_setsid sh -c 'echo \"{marker}{tag}$$\"; eval \"$1\"' sh {command} </dev/null &\n\
         wait $!\n\
         echo \"{marker}:$?\"\n\
         echo \"{marker}\" >&2\n",
        marker = marker,
        tag = GROUP_TAG,
        command = single_quoted(command),
    )
}

/// Signal a job's process group with TERM, then KILL. Falls back to the
/// leader alone when the job could not get a group of its own.
pub(crate) fn terminate_group_script(group: u32) -> String {
    format!(
        "env kill -TERM -- -{group} 2>/dev/null || env kill -TERM {group} 2>/dev/null\n\
         sleep 0.2\n\
         env kill -KILL -- -{group} 2>/dev/null || env kill -KILL {group} 2>/dev/null\n\
         true\n",
        group = group
    )
}

async fn pump_lines<R>(
    reader: R,
    stream: OutputStream,
    route: RouteSlot,
    alive: Arc<AtomicBool>,
    session_id: String,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                }
                let line = String::from_utf8_lossy(&buf).into_owned();
                route_line(&route, stream, line, &session_id);
            }
            Err(e) => {
                warn!("Session {} {} read failed: {}", session_id, stream, e);
                break;
            }
        }
    }

    // EOF: the shell is gone. Dropping our half of the route wakes the job.
    let mut slot = route.lock();
    alive.store(false, Ordering::SeqCst);
    if let Some(job) = slot.as_mut() {
        job.stream_mut(stream).take();
    }
    debug!("Session {} {} reader finished", session_id, stream);
}

fn route_line(route: &RouteSlot, stream: OutputStream, line: String, session_id: &str) {
    let mut slot = route.lock();
    let Some(job) = slot.as_mut() else {
        debug!("Session {} dropped stray {} line", session_id, stream);
        return;
    };

    match line.find(&job.marker) {
        Some(pos) => {
            let tail = &line[pos + job.marker.len()..];
            if let Some(group) = tail.strip_prefix(GROUP_TAG) {
                job.group = group.trim().parse().ok();
                debug!("Session {} job runs in group {:?}", session_id, job.group);
                return;
            }

            let status = tail
                .strip_prefix(':')
                .and_then(|code| code.trim().parse::<i32>().ok());
            if let Some(sink) = job.stream_mut(stream).take() {
                // Output without a trailing newline ends up in front of the marker.
                if pos > 0 {
                    let _ = sink.lines.send(line[..pos].to_string());
                }
                let _ = sink.done.send(status);
            }
        }
        None => match job.stream_mut(stream) {
            Some(sink) => {
                let _ = sink.lines.send(line);
            }
            None => debug!("Session {} dropped late {} line", session_id, stream),
        },
    }
}

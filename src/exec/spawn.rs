//! Streaming Executor
//!
//! Runs long-lived commands in a dedicated session and streams their output
//! to a callback token. Per job the dispatcher sees the `data` events of each
//! stream in production order, then exactly one `exit`, then an `error` only
//! when the exit status is non-zero.

use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::command::{build_command, ArgumentList, CommandOptions};
use super::jobs::{JobOutcome, JobRegistry};
use crate::dispatch::ResultDispatcher;
use crate::error::BridgeResult;
use crate::session::{
    JobSinks, OutputStream, PrivilegedSession, SessionManager, SessionPurpose, SessionStatus,
};

/// A job that has been started
pub struct SpawnedJob {
    pub job_id: String,
    handle: JoinHandle<JobOutcome>,
}

impl SpawnedJob {
    /// Wait for the job to finish and its events to be queued
    pub async fn wait(self) -> JobOutcome {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Job {} task failed: {}", self.job_id, e);
                JobOutcome::Lost
            }
        }
    }
}

/// Spawns streaming jobs
pub struct StreamExecutor {
    sessions: Arc<SessionManager>,
    dispatcher: ResultDispatcher,
    jobs: Arc<JobRegistry>,
}

impl StreamExecutor {
    pub fn new(sessions: Arc<SessionManager>, dispatcher: ResultDispatcher) -> Self {
        Self {
            sessions,
            dispatcher,
            jobs: Arc::new(JobRegistry::new()),
        }
    }

    /// Registry of jobs started by this executor
    pub fn jobs(&self) -> &Arc<JobRegistry> {
        &self.jobs
    }

    /// Parse the script-supplied JSON and spawn
    pub async fn spawn_json(
        &self,
        command: &str,
        args_json: &str,
        options_json: Option<&str>,
        token: &str,
    ) -> BridgeResult<SpawnedJob> {
        let args = ArgumentList::from_json(args_json)?;
        let options = CommandOptions::from_json(options_json)?;
        self.spawn(command, &args, &options, token).await
    }

    /// Start `command args...` in a fresh session. Returns once the session
    /// is open; if it cannot be opened nothing is emitted for `token`.
    pub async fn spawn(
        &self,
        command: &str,
        args: &ArgumentList,
        options: &CommandOptions,
        token: &str,
    ) -> BridgeResult<SpawnedJob> {
        let line = build_command(command, args.as_slice(), options);
        let session = self.sessions.open_isolated(SessionPurpose::Stream).await?;
        self.sessions.set_status(session.id(), SessionStatus::Busy);

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let job = self.jobs.register(token, &line, cancel_tx);
        info!("Spawning job {} for {} in session {}", job.id, token, session.id());

        let driver = JobDriver {
            job_id: job.id.clone(),
            token: token.to_string(),
            line,
            sessions: Arc::clone(&self.sessions),
            dispatcher: self.dispatcher.clone(),
            jobs: Arc::clone(&self.jobs),
        };
        let handle = tokio::spawn(driver.drive(session, cancel_rx));

        Ok(SpawnedJob {
            job_id: job.id,
            handle,
        })
    }

    /// Cancel every running job of `token`; their remaining events are dropped
    pub fn cancel(&self, token: &str) -> usize {
        self.jobs.cancel_token(token)
    }

    /// Cancel everything still running
    pub fn shutdown(&self) -> usize {
        self.jobs.cancel_all()
    }
}

struct JobDriver {
    job_id: String,
    token: String,
    line: String,
    sessions: Arc<SessionManager>,
    dispatcher: ResultDispatcher,
    jobs: Arc<JobRegistry>,
}

impl JobDriver {
    async fn drive(
        self,
        session: PrivilegedSession,
        mut cancel_rx: oneshot::Receiver<()>,
    ) -> JobOutcome {
        let outcome = tokio::select! {
            biased;
            result = self.stream(&session) => Some(result),
            Ok(()) = &mut cancel_rx => None,
        };

        let outcome = match outcome {
            Some(Ok((code, stderr))) => {
                self.dispatcher.emit_exit(&self.token, code);
                if code != 0 {
                    self.dispatcher.emit_error(&self.token, code, stderr.join("\n"));
                }
                self.sessions.close_quietly(session).await;
                JobOutcome::Exited(code)
            }
            Some(Err(e)) => {
                warn!("Job {} lost its session: {}", self.job_id, e);
                self.dispatcher.emit_exit(&self.token, -1);
                self.dispatcher.emit_error(&self.token, -1, e.to_string());
                self.sessions.close_quietly(session).await;
                JobOutcome::Lost
            }
            None => {
                debug!("Job {} cancelled, suppressing its remaining events", self.job_id);
                self.sessions.abort_job(session).await;
                JobOutcome::Cancelled
            }
        };

        self.jobs.finish(&self.job_id, outcome);
        outcome
    }

    /// Run the job, forwarding lines as they arrive. Returns the exit status
    /// and the accumulated stderr once both streams are drained.
    async fn stream(&self, session: &PrivilegedSession) -> BridgeResult<(i32, Vec<String>)> {
        let (sinks, output) = JobSinks::channel();
        let (code, _, stderr) = tokio::join!(
            session.run_job(&self.line, sinks),
            self.forward(output.stdout, OutputStream::Stdout),
            self.forward(output.stderr, OutputStream::Stderr),
        );
        Ok((code?, stderr))
    }

    async fn forward(
        &self,
        mut rx: mpsc::UnboundedReceiver<String>,
        stream: OutputStream,
    ) -> Vec<String> {
        let mut kept = Vec::new();
        while let Some(line) = rx.recv().await {
            self.dispatcher.emit_data(&self.token, stream, line.clone());
            if stream == OutputStream::Stderr {
                kept.push(line);
            }
        }
        kept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShellConfig;
    use crate::dispatch::testing::RecordingSurface;
    use crate::dispatch::BridgeEvent;
    use crate::error::BridgeError;
    use crate::exec::jobs::JobStatus;
    use crate::session::testing::{group_exited, live_group_members, FailingCloseFactory};
    use crate::session::{SessionFactory, ShellSessionFactory};
    use std::time::Duration;

    struct Harness {
        surface: Arc<RecordingSurface>,
        dispatcher: ResultDispatcher,
        sessions: Arc<SessionManager>,
        executor: StreamExecutor,
    }

    fn harness(config: ShellConfig) -> Harness {
        harness_with(Arc::new(ShellSessionFactory::new(config)))
    }

    fn harness_with(factory: Arc<dyn SessionFactory>) -> Harness {
        let surface = Arc::new(RecordingSurface::default());
        let (dispatcher, _consumer) = ResultDispatcher::start(surface.clone());
        let sessions = Arc::new(SessionManager::new(factory));
        let executor = StreamExecutor::new(Arc::clone(&sessions), dispatcher.clone());
        Harness {
            surface,
            dispatcher,
            sessions,
            executor,
        }
    }

    fn data(token: &str, stream: OutputStream, line: &str) -> BridgeEvent {
        BridgeEvent::Data {
            token: token.to_string(),
            stream,
            line: line.to_string(),
        }
    }

    #[tokio::test]
    async fn test_lines_then_single_exit() {
        let h = harness(ShellConfig::unprivileged());
        let job = h
            .executor
            .spawn_json("for i in 1 2 3 4 5; do echo line$i; done", "", None, "job")
            .await
            .unwrap();
        assert_eq!(job.wait().await, JobOutcome::Exited(0));
        h.dispatcher.flush().await;

        let events = h.surface.events_for("job");
        let expected: Vec<BridgeEvent> = (1..=5)
            .map(|i| data("job", OutputStream::Stdout, &format!("line{}", i)))
            .chain(std::iter::once(BridgeEvent::Exit {
                token: "job".to_string(),
                code: 0,
            }))
            .collect();
        assert_eq!(events, expected);
    }

    #[tokio::test]
    async fn test_failure_emits_exit_then_error() {
        let h = harness(ShellConfig::unprivileged());
        let job = h
            .executor
            .spawn_json("sh", r#"["-c", "'echo boom >&2; exit 7'"]"#, None, "cb")
            .await
            .unwrap();
        assert_eq!(job.wait().await, JobOutcome::Exited(7));
        h.dispatcher.flush().await;

        let events = h.surface.events_for("cb");
        assert_eq!(
            events,
            vec![
                data("cb", OutputStream::Stderr, "boom"),
                BridgeEvent::Exit {
                    token: "cb".to_string(),
                    code: 7
                },
                BridgeEvent::Error {
                    token: "cb".to_string(),
                    exit_code: 7,
                    message: "boom".to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_options_apply_to_spawned_command() {
        let h = harness(ShellConfig::unprivileged());
        let job = h
            .executor
            .spawn_json(
                "echo",
                r#"["$KSU_GREETING"]"#,
                Some(r#"{"cwd": "/", "env": {"KSU_GREETING": "hello"}}"#),
                "env",
            )
            .await
            .unwrap();
        job.wait().await;
        h.dispatcher.flush().await;

        assert_eq!(h.surface.events_for("env")[0], data("env", OutputStream::Stdout, "hello"));
    }

    #[tokio::test]
    async fn test_session_closed_after_completion() {
        let h = harness(ShellConfig::unprivileged());
        let job = h.executor.spawn_json("true", "", None, "t").await.unwrap();
        let job_id = job.job_id.clone();
        job.wait().await;

        assert_eq!(h.sessions.session_count(), 0);
        let info = h.executor.jobs().get(&job_id).unwrap();
        assert_eq!(info.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_concurrent_jobs_keep_their_own_lines() {
        let h = harness(ShellConfig::unprivileged());
        let a = h
            .executor
            .spawn_json("for i in 1 2 3; do echo a$i; sleep 0.01; done", "", None, "a")
            .await
            .unwrap();
        let b = h
            .executor
            .spawn_json("for i in 1 2 3; do echo b$i; sleep 0.01; done", "", None, "b")
            .await
            .unwrap();
        a.wait().await;
        b.wait().await;
        h.dispatcher.flush().await;

        for token in ["a", "b"] {
            let lines: Vec<String> = h
                .surface
                .events_for(token)
                .into_iter()
                .filter_map(|e| match e {
                    BridgeEvent::Data { line, .. } => Some(line),
                    _ => None,
                })
                .collect();
            assert_eq!(lines, (1..=3).map(|i| format!("{}{}", token, i)).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn test_cancel_suppresses_remaining_events() {
        let h = harness(ShellConfig::unprivileged());
        let job = h
            .executor
            .spawn_json("sleep 5; echo late", "", None, "slow")
            .await
            .unwrap();

        assert_eq!(h.executor.cancel("slow"), 1);
        assert_eq!(job.wait().await, JobOutcome::Cancelled);
        h.dispatcher.flush().await;

        assert!(h.surface.events_for("slow").is_empty());
        assert_eq!(h.sessions.session_count(), 0);
        assert_eq!(h.executor.cancel("slow"), 0);
    }

    #[tokio::test]
    async fn test_cancel_stops_job_processes() {
        let h = harness(ShellConfig::unprivileged());
        let job = h
            .executor
            .spawn_json("echo $$; sleep 37", "", None, "long")
            .await
            .unwrap();

        let mut leader = None;
        for _ in 0..100 {
            h.dispatcher.flush().await;
            if let Some(BridgeEvent::Data { line, .. }) = h.surface.events_for("long").first() {
                leader = Some(line.parse::<u32>().unwrap());
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let group = leader.expect("job never printed its pid");
        assert!(live_group_members(group) > 0);

        assert_eq!(h.executor.cancel("long"), 1);
        assert_eq!(job.wait().await, JobOutcome::Cancelled);
        assert!(group_exited(group).await);
        assert_eq!(h.sessions.session_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_close_adds_no_events() {
        let h = harness_with(Arc::new(FailingCloseFactory::default()));
        let ok = h.executor.spawn_json("echo ok", "", None, "ok").await.unwrap();
        assert_eq!(ok.wait().await, JobOutcome::Exited(0));
        let bad = h
            .executor
            .spawn_json("echo bad >&2; exit 4", "", None, "bad")
            .await
            .unwrap();
        assert_eq!(bad.wait().await, JobOutcome::Exited(4));
        h.dispatcher.flush().await;

        assert_eq!(
            h.surface.events_for("ok"),
            vec![
                data("ok", OutputStream::Stdout, "ok"),
                BridgeEvent::Exit {
                    token: "ok".to_string(),
                    code: 0
                },
            ]
        );
        assert_eq!(
            h.surface.events_for("bad"),
            vec![
                data("bad", OutputStream::Stderr, "bad"),
                BridgeEvent::Exit {
                    token: "bad".to_string(),
                    code: 4
                },
                BridgeEvent::Error {
                    token: "bad".to_string(),
                    exit_code: 4,
                    message: "bad".to_string()
                },
            ]
        );
        assert_eq!(h.surface.events().len(), 5);
        assert_eq!(h.sessions.session_count(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_session_emits_nothing() {
        let h = harness(ShellConfig {
            program: "/nonexistent/su".to_string(),
            ..ShellConfig::unprivileged()
        });
        let err = h
            .executor
            .spawn_json("echo hi", "", None, "none")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BridgeError::SessionUnavailable(_)));

        h.dispatcher.flush().await;
        assert!(h.surface.events().is_empty());
        assert!(h.executor.jobs().list().is_empty());
    }

    #[tokio::test]
    async fn test_bad_arguments_rejected_before_start() {
        let h = harness(ShellConfig::unprivileged());
        let err = h
            .executor
            .spawn_json("echo", "not json", None, "bad")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BridgeError::InvalidArguments(_)));
        assert_eq!(h.sessions.session_count(), 0);
    }

    #[tokio::test]
    async fn test_dead_session_folds_into_error_event() {
        let h = harness(ShellConfig::unprivileged());
        let job = h.executor.spawn_json("kill -9 $PPID", "", None, "dead").await.unwrap();
        assert_eq!(job.wait().await, JobOutcome::Lost);
        h.dispatcher.flush().await;

        let events = h.surface.events_for("dead");
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            BridgeEvent::Exit {
                token: "dead".to_string(),
                code: -1
            }
        );
        assert!(matches!(&events[1], BridgeEvent::Error { exit_code: -1, .. }));
    }
}

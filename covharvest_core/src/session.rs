//! Runs every program of a directory inside one long-lived Python interpreter.
//!
//! The interpreter executes a staged runner script that compiles and executes
//! each requested program in fresh module globals and reports one JSON line
//! per program. A program that hangs or takes the interpreter down only costs
//! the session; the next program starts a new one.

use crate::config::ExecutorSettings;
use crate::coverage::{CoverageSink, PROGRAM_PROFILE_ENV, RAW_PROFILE_ENV};
use crate::executor::{InterpreterConfig, ProgramFailure, ProgramOutcome, ScriptRuntime};
use serde::Deserialize;
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

const RUNNER_SOURCE: &str = include_str!("session_runner.py");

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Command, per-program timeout and environment of the interpreter. The
    /// runner reports raised errors itself, so the error marker is unused.
    pub interpreter: InterpreterConfig,
    /// `module` or `module as alias` entries bound into every program.
    pub preload: Vec<String>,
}

impl From<&ExecutorSettings> for SessionConfig {
    fn from(settings: &ExecutorSettings) -> Self {
        Self {
            interpreter: InterpreterConfig::from(settings),
            preload: settings.preload.clone(),
        }
    }
}

/// One line written by the runner.
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
enum Report {
    Ready,
    Ok,
    EarlyExit { code: i32 },
    Raised { detail: String },
}

impl Report {
    fn into_outcome(self) -> ProgramOutcome {
        match self {
            Report::Ok => ProgramOutcome::Ok,
            Report::EarlyExit { code } => ProgramOutcome::Failed(ProgramFailure::EarlyExit { code }),
            Report::Raised { detail } => {
                ProgramOutcome::Failed(ProgramFailure::Raised { code: None, detail })
            }
            Report::Ready => ProgramOutcome::Failed(ProgramFailure::Raised {
                code: None,
                detail: "Runner restarted while a program was running".to_string(),
            }),
        }
    }
}

struct Session {
    child: Child,
    requests: ChildStdin,
    reports: Receiver<String>,
}

impl Session {
    fn next_report(&self, timeout: Duration) -> Result<Report, RecvTimeoutError> {
        let deadline = Instant::now() + timeout;
        loop {
            let line = self
                .reports
                .recv_timeout(deadline.saturating_duration_since(Instant::now()))?;
            match serde_json::from_str(&line) {
                Ok(report) => return Ok(report),
                Err(e) => debug!(line, "Ignoring unreadable runner report: {e}"),
            }
        }
    }

    fn kill(mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }

    /// Waits for an interpreter whose report stream has ended.
    fn reap(mut self, timeout: Duration) -> io::Result<ExitStatus> {
        wait_or_kill(&mut self.child, timeout)
    }

    /// Closes the request stream so the runner returns normally and the
    /// instrumented runtime writes its coverage.
    fn close(self, timeout: Duration) {
        let Session {
            mut child,
            requests,
            ..
        } = self;
        drop(requests);
        match wait_or_kill(&mut child, timeout) {
            Ok(status) if status.success() => debug!("Interpreter session closed"),
            Ok(status) => warn!("Interpreter session ended with {status}"),
            Err(e) => warn!("Failed to wait for interpreter session: {e}"),
        }
    }
}

fn wait_or_kill(child: &mut Child, timeout: Duration) -> io::Result<ExitStatus> {
    let started = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if started.elapsed() > timeout {
            debug!("Interpreter did not exit in time, killing");
            let _ = child.kill();
            return child.wait();
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

/// How a program ended when it took the whole interpreter with it.
fn interpreter_exit(status: io::Result<ExitStatus>) -> ProgramFailure {
    let status = match status {
        Ok(status) => status,
        Err(e) => {
            return ProgramFailure::Spawn {
                message: format!("Error waiting for interpreter: {e}"),
            };
        }
    };
    if let Some(code) = status.code() {
        return ProgramFailure::EarlyExit { code };
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ProgramFailure::Signaled { signal };
        }
    }
    ProgramFailure::Raised {
        code: None,
        detail: "Exited abnormally".to_string(),
    }
}

/// Executes programs with `compile`/`exec` inside one interpreter, started
/// lazily and restarted after a program kills or hangs it.
///
/// The interpreter stays in the caller's process group, so a task timeout
/// in the driver reaches it. Each interpreter writes one coverage fragment,
/// reserved from the sink when it starts.
pub struct SessionRuntime {
    config: SessionConfig,
    runner: NamedTempFile,
    session: Option<Session>,
}

impl SessionRuntime {
    /// Stages the runner script. No interpreter starts until the first
    /// program runs.
    pub fn new(config: SessionConfig) -> io::Result<Self> {
        let mut runner = tempfile::Builder::new()
            .prefix("covharvest_runner_")
            .suffix(".py")
            .tempfile()?;
        runner.write_all(RUNNER_SOURCE.as_bytes())?;
        runner.flush()?;
        Ok(Self {
            config,
            runner,
            session: None,
        })
    }

    fn start(&self, sink: &mut CoverageSink) -> Result<Session, ProgramFailure> {
        let spawn_failure = |message: String| ProgramFailure::Spawn { message };
        let Some((interpreter, args)) = self.config.interpreter.command.split_first() else {
            return Err(spawn_failure("Interpreter command is empty".to_string()));
        };
        let fragment = sink
            .next_fragment()
            .map_err(|e| spawn_failure(format!("Failed to prepare coverage fragment: {e}")))?;

        let mut cmd = Command::new(interpreter);
        cmd.args(args)
            .arg(self.runner.path())
            .args(&self.config.preload)
            .envs(&self.config.interpreter.envs)
            .env(PROGRAM_PROFILE_ENV, &fragment)
            .env_remove(RAW_PROFILE_ENV)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = cmd
            .spawn()
            .map_err(|e| spawn_failure(format!("Failed to spawn '{interpreter}': {e}")))?;
        let (Some(requests), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(spawn_failure("Interpreter pipes were not captured".to_string()));
        };

        let (sender, reports) = mpsc::channel();
        std::thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                if sender.send(line).is_err() {
                    break;
                }
            }
        });

        let session = Session {
            child,
            requests,
            reports,
        };
        let timeout = self.config.interpreter.timeout;
        match session.next_report(timeout) {
            Ok(Report::Ready) => {
                debug!(fragment = %fragment.display(), "Interpreter session started");
                Ok(session)
            }
            Ok(other) => {
                session.kill();
                Err(spawn_failure(format!("Runner reported {other:?} before it was ready")))
            }
            Err(RecvTimeoutError::Timeout) => {
                session.kill();
                Err(spawn_failure("Runner did not become ready in time".to_string()))
            }
            Err(RecvTimeoutError::Disconnected) => {
                let ended = interpreter_exit(session.reap(timeout));
                Err(spawn_failure(format!("Runner exited during startup: {ended}")))
            }
        }
    }
}

impl ScriptRuntime for SessionRuntime {
    fn run_program(&mut self, program: &Path, sink: &mut CoverageSink) -> ProgramOutcome {
        let mut session = match self.session.take() {
            Some(session) => session,
            None => match self.start(sink) {
                Ok(session) => session,
                Err(failure) => return ProgramOutcome::Failed(failure),
            },
        };
        let timeout = self.config.interpreter.timeout;

        let request = match serde_json::to_string(&program.to_string_lossy()) {
            Ok(request) => request,
            Err(e) => {
                self.session = Some(session);
                return ProgramOutcome::Failed(ProgramFailure::Spawn {
                    message: format!("Failed to encode program path: {e}"),
                });
            }
        };
        if let Err(e) = writeln!(session.requests, "{request}").and_then(|()| session.requests.flush())
        {
            let ended = interpreter_exit(session.reap(timeout));
            return ProgramOutcome::Failed(ProgramFailure::Spawn {
                message: format!("Interpreter session is gone ({ended}): {e}"),
            });
        }

        match session.next_report(timeout) {
            Ok(report) => {
                self.session = Some(session);
                report.into_outcome()
            }
            Err(RecvTimeoutError::Timeout) => {
                debug!(program = %program.display(), "Program timed out, killing interpreter session");
                session.kill();
                ProgramOutcome::Failed(ProgramFailure::TimedOut)
            }
            Err(RecvTimeoutError::Disconnected) => {
                ProgramOutcome::Failed(interpreter_exit(session.reap(timeout)))
            }
        }
    }

    fn finish(&mut self) {
        if let Some(session) = self.session.take() {
            session.close(self.config.interpreter.timeout);
        }
    }
}

impl Drop for SessionRuntime {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            session.kill();
        }
    }
}

use crate::config::ExecutorSettings;
use crate::coverage::{CoverageSink, PROGRAM_PROFILE_ENV, RAW_PROFILE_ENV, RawRecord};
use crate::program::discover_programs;
use crate::session::{SessionConfig, SessionRuntime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Why a single program did not complete normally.
///
/// These never escape the script executor; they are collected into the
/// [`ExecutionSummary`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ProgramFailure {
    /// The program raised an error that reached the top level.
    Raised { code: Option<i32>, detail: String },
    /// The program asked to terminate early, whatever status it gave.
    EarlyExit { code: i32 },
    /// The interpreter was killed by a signal (segfaults in the library land here).
    Signaled { signal: i32 },
    TimedOut,
    /// An in-process program panicked.
    Panicked { message: String },
    /// The program could not be started.
    Spawn { message: String },
}

impl ProgramFailure {
    pub fn kind(&self) -> &'static str {
        match self {
            ProgramFailure::Raised { .. } => "raised",
            ProgramFailure::EarlyExit { .. } => "early-exit",
            ProgramFailure::Signaled { .. } => "signaled",
            ProgramFailure::TimedOut => "timed-out",
            ProgramFailure::Panicked { .. } => "panicked",
            ProgramFailure::Spawn { .. } => "spawn",
        }
    }
}

impl fmt::Display for ProgramFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgramFailure::Raised { code, detail } => match code {
                Some(code) => write!(f, "raised (exit {code}): {detail}"),
                None => write!(f, "raised: {detail}"),
            },
            ProgramFailure::EarlyExit { code } => write!(f, "early exit with status {code}"),
            ProgramFailure::Signaled { signal } => write!(f, "terminated by signal {signal}"),
            ProgramFailure::TimedOut => write!(f, "timed out"),
            ProgramFailure::Panicked { message } => write!(f, "panicked: {message}"),
            ProgramFailure::Spawn { message } => write!(f, "failed to start: {message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgramOutcome {
    Ok,
    Failed(ProgramFailure),
}

/// Runs one program against the instrumented library.
pub trait ScriptRuntime {
    fn run_program(&mut self, program: &Path, sink: &mut CoverageSink) -> ProgramOutcome;

    /// Called once after the last program of a directory, before the sink is
    /// flushed. Runtimes that keep an interpreter alive stop it here so its
    /// coverage lands in the sink's fragments.
    fn finish(&mut self) {}
}

impl<R: ScriptRuntime + ?Sized> ScriptRuntime for Box<R> {
    fn run_program(&mut self, program: &Path, sink: &mut CoverageSink) -> ProgramOutcome {
        (**self).run_program(program, sink)
    }

    fn finish(&mut self) {
        (**self).finish()
    }
}

/// Picks the runtime the executor settings ask for.
///
/// # Errors
/// Returns [`ExecutorError::Runner`] when the session runner cannot be staged.
pub fn runtime_from_settings(
    settings: &ExecutorSettings,
) -> Result<Box<dyn ScriptRuntime>, ExecutorError> {
    if settings.uses_session() {
        let runtime = SessionRuntime::new(SessionConfig::from(settings))
            .map_err(|source| ExecutorError::Runner { source })?;
        Ok(Box::new(runtime))
    } else {
        Ok(Box::new(InterpreterRuntime::new(InterpreterConfig::from(settings))))
    }
}

/// Runs programs through a host closure, converting panics into
/// [`ProgramFailure::Panicked`].
pub struct InProcessRuntime<F>
where
    F: FnMut(&Path, &mut CoverageSink) -> Result<(), ProgramFailure>,
{
    harness_fn: F,
}

impl<F> InProcessRuntime<F>
where
    F: FnMut(&Path, &mut CoverageSink) -> Result<(), ProgramFailure>,
{
    pub fn new(harness_fn: F) -> Self {
        Self { harness_fn }
    }
}

impl<F> ScriptRuntime for InProcessRuntime<F>
where
    F: FnMut(&Path, &mut CoverageSink) -> Result<(), ProgramFailure>,
{
    fn run_program(&mut self, program: &Path, sink: &mut CoverageSink) -> ProgramOutcome {
        let result = catch_unwind(AssertUnwindSafe(|| (self.harness_fn)(program, sink)));
        match result {
            Ok(Ok(())) => ProgramOutcome::Ok,
            Ok(Err(failure)) => ProgramOutcome::Failed(failure),
            Err(panic_payload) => {
                let message = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic type".to_string()
                };
                ProgramOutcome::Failed(ProgramFailure::Panicked { message })
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct InterpreterConfig {
    /// Interpreter command; the program path is appended as the last argument.
    pub command: Vec<String>,
    pub timeout: Duration,
    pub envs: BTreeMap<String, String>,
    /// Text in stderr that marks an uncaught error rather than a deliberate exit.
    pub error_marker: String,
}

impl From<&ExecutorSettings> for InterpreterConfig {
    fn from(settings: &ExecutorSettings) -> Self {
        Self {
            command: settings.interpreter.clone(),
            timeout: settings.program_timeout(),
            envs: settings.env.clone(),
            error_marker: settings.error_marker.clone(),
        }
    }
}

/// Runs each program in a fresh interpreter process whose instrumented
/// runtime writes coverage to a sink fragment.
pub struct InterpreterRuntime {
    config: InterpreterConfig,
}

impl InterpreterRuntime {
    pub fn new(config: InterpreterConfig) -> Self {
        Self { config }
    }

    fn run_and_wait_with_timeout(
        &self,
        mut child: Child,
        timeout: Duration,
    ) -> Result<ExitStatus, ProgramFailure> {
        let start_time = Instant::now();

        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {
                    if start_time.elapsed() > timeout {
                        debug!("Program timed out, killing");
                        if let Err(e) = child.kill() {
                            warn!("Failed to kill timed-out program: {e}");
                        }
                        let _ = child.wait();
                        return Err(ProgramFailure::TimedOut);
                    }
                    std::thread::sleep(Duration::from_millis(20));
                }
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(ProgramFailure::Spawn {
                        message: format!("Error waiting for interpreter: {e}"),
                    });
                }
            }
        }
    }

    fn classify_exit(&self, status: ExitStatus, stderr: &str) -> ProgramOutcome {
        if status.success() {
            return ProgramOutcome::Ok;
        }
        let detail = stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or_default()
            .trim()
            .to_string();

        if let Some(code) = status.code() {
            let failure = if !self.config.error_marker.is_empty()
                && stderr.contains(&self.config.error_marker)
            {
                ProgramFailure::Raised {
                    code: Some(code),
                    detail,
                }
            } else {
                ProgramFailure::EarlyExit { code }
            };
            return ProgramOutcome::Failed(failure);
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ProgramOutcome::Failed(ProgramFailure::Signaled { signal });
            }
        }
        ProgramOutcome::Failed(ProgramFailure::Raised {
            code: None,
            detail: "Exited abnormally".to_string(),
        })
    }
}

impl ScriptRuntime for InterpreterRuntime {
    fn run_program(&mut self, program: &Path, sink: &mut CoverageSink) -> ProgramOutcome {
        let Some((interpreter, args)) = self.config.command.split_first() else {
            return ProgramOutcome::Failed(ProgramFailure::Spawn {
                message: "Interpreter command is empty".to_string(),
            });
        };
        let fragment = match sink.next_fragment() {
            Ok(path) => path,
            Err(e) => {
                return ProgramOutcome::Failed(ProgramFailure::Spawn {
                    message: format!("Failed to prepare coverage fragment: {e}"),
                });
            }
        };
        let mut stderr_file = match tempfile::tempfile() {
            Ok(f) => f,
            Err(e) => {
                return ProgramOutcome::Failed(ProgramFailure::Spawn {
                    message: format!("Failed to create stderr capture: {e}"),
                });
            }
        };
        let stderr_handle = match stderr_file.try_clone() {
            Ok(f) => f,
            Err(e) => {
                return ProgramOutcome::Failed(ProgramFailure::Spawn {
                    message: format!("Failed to clone stderr capture: {e}"),
                });
            }
        };

        let mut cmd = Command::new(interpreter);
        cmd.args(args).arg(program);
        if let Some(parent) = program.parent() {
            cmd.current_dir(parent);
        }
        cmd.envs(&self.config.envs)
            .env(PROGRAM_PROFILE_ENV, &fragment)
            .env_remove(RAW_PROFILE_ENV)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr_handle));

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ProgramOutcome::Failed(ProgramFailure::Spawn {
                    message: format!("Failed to spawn '{interpreter}': {e}"),
                });
            }
        };

        let status = match self.run_and_wait_with_timeout(child, self.config.timeout) {
            Ok(status) => status,
            Err(failure) => return ProgramOutcome::Failed(failure),
        };

        let mut stderr = String::new();
        if let Err(e) = stderr_file
            .seek(SeekFrom::Start(0))
            .and_then(|_| stderr_file.read_to_string(&mut stderr))
        {
            debug!("Could not read program stderr: {e}");
        }
        self.classify_exit(status, &stderr)
    }
}

/// Errors that stop a directory from being executed at all. Individual
/// program failures are not errors.
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Failed to discover programs under {dir:?}: {source}")]
    Discovery {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to stage the session runner: {source}")]
    Runner {
        #[source]
        source: io::Error,
    },

    #[error("Failed to flush coverage to {path:?}: {source}")]
    Flush {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramFailureRecord {
    /// Program path relative to the executed directory.
    pub program: PathBuf,
    pub failure: ProgramFailure,
}

/// What happened while executing one directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub directory: PathBuf,
    pub attempted: usize,
    pub succeeded: usize,
    pub failures: Vec<ProgramFailureRecord>,
    pub record_path: PathBuf,
    pub record_bytes: u64,
}

impl ExecutionSummary {
    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    /// Failure counts keyed by [`ProgramFailure::kind`].
    pub fn failures_by_kind(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for record in &self.failures {
            *counts.entry(record.failure.kind()).or_insert(0) += 1;
        }
        counts
    }
}

impl fmt::Display for ExecutionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "[executor] {}: attempted {}, succeeded {}, failed {}",
            self.directory.display(),
            self.attempted,
            self.succeeded,
            self.failed()
        )?;
        for (kind, count) in self.failures_by_kind() {
            writeln!(f, "[executor]   {kind}: {count}")?;
        }
        for record in &self.failures {
            writeln!(
                f,
                "[executor]   FAIL {} {}",
                record.program.display(),
                record.failure
            )?;
        }
        write!(
            f,
            "[executor] raw record {} ({} bytes)",
            self.record_path.display(),
            self.record_bytes
        )
    }
}

/// Executes every program of a directory, one at a time, in path order.
pub struct ScriptExecutor<R: ScriptRuntime> {
    runtime: R,
    extension: String,
}

impl<R: ScriptRuntime> ScriptExecutor<R> {
    pub fn new(runtime: R, extension: impl Into<String>) -> Self {
        Self {
            runtime,
            extension: extension.into(),
        }
    }

    /// Runs all programs under `dir` and flushes `sink` once at the end.
    ///
    /// Program failures are recorded in the summary and never interrupt the
    /// remaining programs.
    pub fn run_directory(
        &mut self,
        dir: &Path,
        mut sink: CoverageSink,
    ) -> Result<ExecutionSummary, ExecutorError> {
        let discovery_err = |source| ExecutorError::Discovery {
            dir: dir.to_path_buf(),
            source,
        };
        let root = dir.canonicalize().map_err(discovery_err)?;
        let programs = discover_programs(&root, &self.extension).map_err(discovery_err)?;
        info!(directory = %dir.display(), programs = programs.len(), "Executing directory");

        let mut succeeded = 0;
        let mut failures = Vec::new();
        for program in &programs {
            let started = Instant::now();
            match self.runtime.run_program(&program.path, &mut sink) {
                ProgramOutcome::Ok => {
                    succeeded += 1;
                    debug!(program = %program.relative.display(), elapsed_ms = started.elapsed().as_millis() as u64, "OK");
                }
                ProgramOutcome::Failed(failure) => {
                    debug!(program = %program.relative.display(), kind = failure.kind(), "{failure}");
                    failures.push(ProgramFailureRecord {
                        program: program.relative.clone(),
                        failure,
                    });
                }
            }
        }

        self.runtime.finish();
        let destination = sink.destination().to_path_buf();
        let RawRecord { path, bytes, .. } = sink.flush().map_err(|source| ExecutorError::Flush {
            path: destination,
            source,
        })?;

        Ok(ExecutionSummary {
            directory: dir.to_path_buf(),
            attempted: programs.len(),
            succeeded,
            failures,
            record_path: path,
            record_bytes: bytes,
        })
    }
}

#[cfg(test)]
mod in_process_runtime_tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn programs_dir(names: &[&str]) -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        for name in names {
            let path = dir.path().join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, name).unwrap();
        }
        dir
    }

    fn file_name(path: &Path) -> String {
        path.file_name().unwrap().to_string_lossy().into_owned()
    }

    #[test]
    fn early_exit_and_raise_are_both_recorded_and_record_still_produced() {
        let dir = programs_dir(&["a_exit.py", "b_raise.py", "c_ok.py"]);
        let out = tempdir().unwrap();
        let runtime = InProcessRuntime::new(|program: &Path, sink: &mut CoverageSink| {
            sink.append(b"cov;");
            match file_name(program).as_str() {
                "a_exit.py" => Err(ProgramFailure::EarlyExit { code: 0 }),
                "b_raise.py" => Err(ProgramFailure::Raised {
                    code: None,
                    detail: "ValueError: bad shape".to_string(),
                }),
                _ => Ok(()),
            }
        });
        let mut executor = ScriptExecutor::new(runtime, "py");

        let summary = executor
            .run_directory(dir.path(), CoverageSink::new(out.path().join("sub.profraw")))
            .unwrap();

        assert_eq!(summary.attempted, 3);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed(), 2);
        assert_eq!(summary.failures[0].program, PathBuf::from("a_exit.py"));
        assert_eq!(summary.failures[0].failure.kind(), "early-exit");
        assert_eq!(summary.failures[1].failure.kind(), "raised");
        assert_eq!(fs::read(out.path().join("sub.profraw")).unwrap(), b"cov;cov;cov;");
    }

    #[test]
    fn panics_are_contained_and_execution_continues() {
        let dir = programs_dir(&["1.py", "2.py", "3.py"]);
        let out = tempdir().unwrap();
        let runtime = InProcessRuntime::new(|program: &Path, _sink: &mut CoverageSink| {
            if file_name(program) == "2.py" {
                panic!("Boom!");
            }
            Ok(())
        });
        let mut executor = ScriptExecutor::new(runtime, "py");

        let summary = executor
            .run_directory(dir.path(), CoverageSink::new(out.path().join("r.profraw")))
            .unwrap();

        assert_eq!(summary.succeeded, 2);
        match &summary.failures[0].failure {
            ProgramFailure::Panicked { message } => assert!(message.contains("Boom!")),
            other => panic!("Expected a panic failure, got {other:?}"),
        }
    }

    #[test]
    fn programs_run_in_lexicographic_path_order() {
        let dir = programs_dir(&["b/2.py", "a/9.py", "b/10.py", "a.py"]);
        let out = tempdir().unwrap();
        let mut seen = Vec::new();
        {
            let runtime = InProcessRuntime::new(|program: &Path, _sink: &mut CoverageSink| {
                seen.push(fs::read_to_string(program).unwrap());
                Ok(())
            });
            let mut executor = ScriptExecutor::new(runtime, "py");
            executor
                .run_directory(dir.path(), CoverageSink::new(out.path().join("r.profraw")))
                .unwrap();
        }
        // Paths compare component-wise, so "a/9.py" sorts before "a.py".
        assert_eq!(seen, vec!["a/9.py", "a.py", "b/10.py", "b/2.py"]);
    }

    #[test]
    fn all_programs_failing_still_yields_summary_and_record() {
        let dir = programs_dir(&["x.py", "y.py"]);
        let out = tempdir().unwrap();
        let runtime = InProcessRuntime::new(|_: &Path, _: &mut CoverageSink| {
            Err(ProgramFailure::EarlyExit { code: 1 })
        });
        let mut executor = ScriptExecutor::new(runtime, "py");

        let summary = executor
            .run_directory(dir.path(), CoverageSink::new(out.path().join("r.profraw")))
            .unwrap();
        assert_eq!(summary.succeeded, 0);
        assert_eq!(summary.failed(), 2);
        assert!(summary.record_path.is_file());
        assert!(summary.to_string().contains("attempted 2, succeeded 0, failed 2"));
    }

    #[test]
    fn missing_directory_is_an_executor_error() {
        let out = tempdir().unwrap();
        let runtime = InProcessRuntime::new(|_: &Path, _: &mut CoverageSink| Ok(()));
        let mut executor = ScriptExecutor::new(runtime, "py");
        let result = executor.run_directory(
            &out.path().join("nope"),
            CoverageSink::new(out.path().join("r.profraw")),
        );
        assert!(matches!(result, Err(ExecutorError::Discovery { .. })));
    }
}

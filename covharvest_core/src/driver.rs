use crate::config::{HarvestConfig, PartialRecordPolicy};
use crate::corpus::BucketLabel;
use crate::coverage::{ProfileMerger, RAW_PROFILE_ENV, RecordState, partition_records};
use crate::process_group::kill_group;
use crate::program::{child_directories, has_program_extension};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fmt::Write as _;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

pub const BUCKET_RESULT_FILE: &str = "bucket_result.json";
pub const PROFILE_LOG_FILE: &str = "profile.log";

/// Replaced by the subdirectory path in a [`TaskCommand`].
pub const DIR_PLACEHOLDER: &str = "{dir}";

/// Driver-level failures. Task failures are reported as [`TaskOutcome`]s
/// and never surface here.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Input directory does not exist: {0:?}")]
    InputMissing(PathBuf),

    #[error("Task command must not be empty")]
    EmptyTaskCommand,

    #[error("Driver I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to serialize bucket result: {0}")]
    Serialize(#[from] serde_json::Error),
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> DriverError + '_ {
    move |source| DriverError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Command line that executes one subdirectory task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskCommand {
    argv: Vec<String>,
}

impl TaskCommand {
    /// Every `{dir}` in `argv` is replaced by the subdirectory; without a
    /// placeholder the subdirectory is appended as the last argument.
    pub fn new(argv: Vec<String>) -> Result<Self, DriverError> {
        if argv.is_empty() || argv[0].is_empty() {
            return Err(DriverError::EmptyTaskCommand);
        }
        Ok(Self { argv })
    }

    /// `<harvest binary> [--config <config>] exec --dir {dir}`
    pub fn script_executor(harvest_binary: &Path, config: Option<&Path>) -> Self {
        let mut argv = vec![harvest_binary.display().to_string()];
        if let Some(config) = config {
            argv.push("--config".to_string());
            argv.push(config.display().to_string());
        }
        argv.extend(["exec", "--dir", DIR_PLACEHOLDER].map(String::from));
        Self { argv }
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    fn render(&self, dir: &Path) -> (OsString, Vec<OsString>) {
        let dir = dir.as_os_str();
        let mut substituted = false;
        let mut rendered: Vec<OsString> = self
            .argv
            .iter()
            .map(|arg| {
                if arg.contains(DIR_PLACEHOLDER) {
                    substituted = true;
                    render_placeholder(arg, dir)
                } else {
                    OsString::from(arg)
                }
            })
            .collect();
        if !substituted {
            rendered.push(dir.to_os_string());
        }
        let program = rendered.remove(0);
        (program, rendered)
    }
}

fn render_placeholder(arg: &str, dir: &std::ffi::OsStr) -> OsString {
    let mut out = OsString::new();
    let mut parts = arg.split(DIR_PLACEHOLDER).peekable();
    while let Some(part) = parts.next() {
        out.push(part);
        if parts.peek().is_some() {
            out.push(dir);
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub parallelism: usize,
    pub task_timeout: Duration,
    pub partial_records: PartialRecordPolicy,
    pub task_command: TaskCommand,
    /// File name of the merged artifact inside the bucket output directory.
    pub artifact_name: String,
    /// Program extension, used to spot programs no task would run.
    pub extension: String,
}

impl DriverSettings {
    pub fn from_config(config: &HarvestConfig, task_command: TaskCommand) -> Self {
        Self {
            parallelism: config.run.parallelism.max(1),
            task_timeout: config.run.task_timeout(),
            partial_records: config.run.partial_records,
            task_command,
            artifact_name: config.merge.artifact_name.clone(),
            extension: config.executor.extension.clone(),
        }
    }
}

/// Terminal state of one subdirectory task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TaskOutcome {
    Succeeded,
    TimedOut,
    Crashed { description: String },
    LaunchFailed { message: String },
}

impl TaskOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            TaskOutcome::Succeeded => "succeeded",
            TaskOutcome::TimedOut => "timed out",
            TaskOutcome::Crashed { .. } => "crashed",
            TaskOutcome::LaunchFailed { .. } => "launch failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReport {
    pub subdirectory: String,
    pub outcome: TaskOutcome,
    pub duration_ms: u64,
    /// Raw record handed to the merge step, if one was kept.
    pub record: Option<PathBuf>,
    /// Captured stdout and stderr of the task.
    #[serde(skip)]
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum BucketStatus {
    Completed,
    DriverFailed { reason: String },
}

/// Outcome of processing one bucket, written as `bucket_result.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketResult {
    pub label: BucketLabel,
    pub status: BucketStatus,
    pub tasks: usize,
    pub succeeded: usize,
    pub timed_out: usize,
    pub crashed: usize,
    pub launch_failed: usize,
    pub records_merged: usize,
    pub records_skipped: usize,
    /// File name of the merged artifact within the bucket output directory.
    pub artifact: Option<PathBuf>,
    pub merge_error: Option<String>,
    pub peak_concurrency: usize,
    /// Programs lying directly in the bucket directory. Only subdirectories
    /// become tasks, so these were not run.
    #[serde(default)]
    pub loose_programs: Vec<PathBuf>,
    #[serde(default)]
    pub reports: Vec<TaskReport>,
}

impl BucketResult {
    pub fn empty(label: BucketLabel) -> Self {
        Self {
            label,
            status: BucketStatus::Completed,
            tasks: 0,
            succeeded: 0,
            timed_out: 0,
            crashed: 0,
            launch_failed: 0,
            records_merged: 0,
            records_skipped: 0,
            artifact: None,
            merge_error: None,
            peak_concurrency: 0,
            loose_programs: Vec::new(),
            reports: Vec::new(),
        }
    }

    pub fn driver_failed(label: BucketLabel, reason: impl Into<String>) -> Self {
        Self {
            status: BucketStatus::DriverFailed {
                reason: reason.into(),
            },
            ..Self::empty(label)
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == BucketStatus::Completed
    }

    pub fn load(path: &Path) -> Result<Self, DriverError> {
        let content = fs::read_to_string(path).map_err(io_err(path))?;
        Ok(serde_json::from_str(&content)?)
    }

    fn tally(&mut self, reports: Vec<TaskReport>) {
        self.tasks = reports.len();
        for report in &reports {
            match report.outcome {
                TaskOutcome::Succeeded => self.succeeded += 1,
                TaskOutcome::TimedOut => self.timed_out += 1,
                TaskOutcome::Crashed { .. } => self.crashed += 1,
                TaskOutcome::LaunchFailed { .. } => self.launch_failed += 1,
            }
        }
        self.reports = reports;
    }
}

/// Runs every subdirectory of a bucket as an isolated task with bounded
/// parallelism, then merges the raw records into one artifact.
pub struct WorkUnitDriver {
    settings: DriverSettings,
    merger: Arc<dyn ProfileMerger>,
}

impl WorkUnitDriver {
    pub fn new(settings: DriverSettings, merger: Arc<dyn ProfileMerger>) -> Self {
        Self { settings, merger }
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    pub async fn run_bucket(
        &self,
        input: &Path,
        output: &Path,
        label: BucketLabel,
    ) -> Result<BucketResult, DriverError> {
        if !input.is_dir() {
            return Err(DriverError::InputMissing(input.to_path_buf()));
        }
        let raw_dir = output.join("raw");
        let logs_dir = output.join("logs");
        fs::create_dir_all(&raw_dir).map_err(io_err(&raw_dir))?;
        fs::create_dir_all(&logs_dir).map_err(io_err(&logs_dir))?;

        let subdirectories = child_directories(input).map_err(io_err(input))?;
        let loose_programs = loose_programs(input, &self.settings.extension).map_err(io_err(input))?;
        if !loose_programs.is_empty() {
            warn!(
                bucket = %label,
                count = loose_programs.len(),
                "Programs directly in the bucket directory are not run; move them into a subdirectory"
            );
        }
        info!(
            bucket = %label,
            tasks = subdirectories.len(),
            parallelism = self.settings.parallelism,
            "Driving bucket"
        );

        let mut result = BucketResult::empty(label);
        result.loose_programs = loose_programs;
        let reports = self.run_tasks(&subdirectories, &raw_dir, &logs_dir, &mut result).await;
        result.tally(reports);

        let records: Vec<PathBuf> = result.reports.iter().filter_map(|r| r.record.clone()).collect();
        self.merge_records(&records, output, &mut result).await;

        if result.artifact.is_some() {
            for record in &records {
                if let Err(e) = fs::remove_file(record) {
                    debug!(record = %record.display(), "Failed to remove raw record: {e}");
                }
            }
        }
        let _ = fs::remove_dir(&raw_dir);

        write_profile_log(&output.join(PROFILE_LOG_FILE), &result)?;
        if let Err(e) = fs::remove_dir_all(&logs_dir) {
            debug!(dir = %logs_dir.display(), "Failed to remove task logs: {e}");
        }

        let result_path = output.join(BUCKET_RESULT_FILE);
        fs::write(&result_path, serde_json::to_string_pretty(&result)?)
            .map_err(io_err(&result_path))?;

        info!(
            bucket = %result.label,
            succeeded = result.succeeded,
            timed_out = result.timed_out,
            crashed = result.crashed,
            merged = result.records_merged,
            "Bucket finished"
        );
        Ok(result)
    }

    async fn run_tasks(
        &self,
        subdirectories: &[PathBuf],
        raw_dir: &Path,
        logs_dir: &Path,
        result: &mut BucketResult,
    ) -> Vec<TaskReport> {
        let semaphore = Arc::new(Semaphore::new(self.settings.parallelism));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::with_capacity(subdirectories.len());
        for dir in subdirectories {
            let name = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| dir.display().to_string());
            let permit = semaphore.clone().acquire_owned().await;
            let task = TaskSpec {
                record: raw_dir.join(format!("{name}.profraw")),
                log: logs_dir.join(format!("{name}.log")),
                name,
                dir: dir.clone(),
                command: self.settings.task_command.clone(),
                timeout: self.settings.task_timeout,
                partial_records: self.settings.partial_records,
            };
            let in_flight = in_flight.clone();
            let peak = peak.clone();

            let handle = tokio::spawn(async move {
                let _permit = permit;
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                let report = task.run().await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                report
            });
            handles.push(handle);
        }

        let mut reports = Vec::with_capacity(handles.len());
        for (index, handle) in handles.into_iter().enumerate() {
            match handle.await {
                Ok(report) => reports.push(report),
                Err(e) => reports.push(TaskReport {
                    subdirectory: subdirectories[index].display().to_string(),
                    outcome: TaskOutcome::LaunchFailed {
                        message: format!("Task panicked: {e}"),
                    },
                    duration_ms: 0,
                    record: None,
                    output: String::new(),
                }),
            }
        }
        result.peak_concurrency = peak.load(Ordering::SeqCst);
        reports
    }

    async fn merge_records(&self, records: &[PathBuf], output: &Path, result: &mut BucketResult) {
        let (usable, skipped) = partition_records(records);
        for (path, state) in &skipped {
            let reason = match state {
                RecordState::Missing => "missing",
                RecordState::Empty => "empty",
                RecordState::Unrecognized => "not a raw profile",
                RecordState::Usable => "usable",
            };
            warn!(record = %path.display(), "Skipping raw record: {reason}");
        }
        result.records_skipped = skipped.len();

        if usable.is_empty() {
            info!(bucket = %result.label, "No usable raw records, skipping merge");
            return;
        }

        let artifact = output.join(&self.settings.artifact_name);
        let merger = self.merger.clone();
        let merge_target = artifact.clone();
        let inputs = usable.clone();
        let merged =
            tokio::task::spawn_blocking(move || merger.merge(&inputs, &merge_target)).await;

        match merged {
            Ok(Ok(())) => {
                result.records_merged = usable.len();
                result.artifact = Some(PathBuf::from(&self.settings.artifact_name));
            }
            Ok(Err(e)) => {
                warn!(bucket = %result.label, tool = self.merger.name(), "Merge failed: {e}");
                result.merge_error = Some(e.to_string());
            }
            Err(e) => {
                warn!(bucket = %result.label, "Merge task panicked: {e}");
                result.merge_error = Some(format!("Merge task panicked: {e}"));
            }
        }
    }
}

struct TaskSpec {
    name: String,
    dir: PathBuf,
    record: PathBuf,
    log: PathBuf,
    command: TaskCommand,
    timeout: Duration,
    partial_records: PartialRecordPolicy,
}

impl TaskSpec {
    async fn run(self) -> TaskReport {
        let started = Instant::now();
        let outcome = self.execute().await;
        let duration_ms = started.elapsed().as_millis() as u64;
        let output = fs::read(&self.log)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default();

        let keep_record = match outcome {
            TaskOutcome::TimedOut => self.partial_records == PartialRecordPolicy::Include,
            TaskOutcome::LaunchFailed { .. } => false,
            TaskOutcome::Succeeded | TaskOutcome::Crashed { .. } => true,
        };
        let record = if keep_record && self.record.exists() {
            Some(self.record)
        } else {
            if !keep_record {
                let _ = fs::remove_file(&self.record);
            }
            None
        };

        match &outcome {
            TaskOutcome::Succeeded => debug!(subdirectory = %self.name, duration_ms, "Task succeeded"),
            other => warn!(subdirectory = %self.name, duration_ms, "Task {}", describe_outcome(other)),
        }

        TaskReport {
            subdirectory: self.name,
            outcome,
            duration_ms,
            record,
            output,
        }
    }

    async fn execute(&self) -> TaskOutcome {
        if let Err(e) = fs::remove_file(&self.record)
            && e.kind() != io::ErrorKind::NotFound
        {
            return TaskOutcome::LaunchFailed {
                message: format!("Failed to clear stale record {:?}: {e}", self.record),
            };
        }
        let (stdout, stderr) = match File::create(&self.log).and_then(|f| Ok((f.try_clone()?, f))) {
            Ok(handles) => handles,
            Err(e) => {
                return TaskOutcome::LaunchFailed {
                    message: format!("Failed to create task log {:?}: {e}", self.log),
                };
            }
        };

        let (program, args) = self.command.render(&self.dir);
        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .env(RAW_PROFILE_ENV, &self.record)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return TaskOutcome::LaunchFailed {
                    message: format!("Failed to spawn {program:?}: {e}"),
                };
            }
        };

        match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) if status.success() => TaskOutcome::Succeeded,
            Ok(Ok(status)) => TaskOutcome::Crashed {
                description: describe_status(status),
            },
            Ok(Err(e)) => TaskOutcome::Crashed {
                description: format!("Failed to wait for task: {e}"),
            },
            Err(_) => {
                self.kill(&mut child).await;
                TaskOutcome::TimedOut
            }
        }
    }

    /// Kills the task's process group, so interpreters it started die with
    /// it, then reaps the task itself.
    async fn kill(&self, child: &mut Child) {
        if let Some(pid) = child.id()
            && let Err(e) = kill_group(pid)
        {
            debug!(subdirectory = %self.name, "Failed to kill task process group: {e}");
        }
        if let Err(e) = child.kill().await {
            warn!(subdirectory = %self.name, "Failed to kill timed-out task: {e}");
        }
    }
}

fn loose_programs(input: &Path, extension: &str) -> io::Result<Vec<PathBuf>> {
    let mut loose = Vec::new();
    for entry in fs::read_dir(input)? {
        let entry = entry?;
        if entry.file_type()?.is_file() && has_program_extension(&entry.path(), extension) {
            loose.push(PathBuf::from(entry.file_name()));
        }
    }
    loose.sort();
    Ok(loose)
}

fn describe_status(status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exited with status {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("killed by signal {signal}");
        }
    }
    "terminated abnormally".to_string()
}

fn describe_outcome(outcome: &TaskOutcome) -> String {
    match outcome {
        TaskOutcome::Crashed { description } => format!("crashed: {description}"),
        TaskOutcome::LaunchFailed { message } => format!("launch failed: {message}"),
        other => other.label().to_string(),
    }
}

fn write_profile_log(path: &Path, result: &BucketResult) -> Result<(), DriverError> {
    let mut log = String::new();
    let _ = writeln!(
        log,
        "[driver] bucket {}: {} tasks, {} succeeded, {} timed out, {} crashed, {} failed to launch",
        result.label, result.tasks, result.succeeded, result.timed_out, result.crashed, result.launch_failed
    );
    let _ = writeln!(
        log,
        "[driver] peak concurrency {}, records merged {}, records skipped {}",
        result.peak_concurrency, result.records_merged, result.records_skipped
    );
    match (&result.artifact, &result.merge_error) {
        (Some(artifact), _) => {
            let _ = writeln!(log, "[driver] artifact {}", artifact.display());
        }
        (None, Some(error)) => {
            let _ = writeln!(log, "[driver] merge failed: {error}");
        }
        (None, None) => {
            let _ = writeln!(log, "[driver] merge skipped: no usable records");
        }
    }
    for program in &result.loose_programs {
        let _ = writeln!(log, "[driver] not run (outside any subdirectory): {}", program.display());
    }
    for report in &result.reports {
        let _ = writeln!(
            log,
            "== {} ({}, {} ms) ==",
            report.subdirectory,
            describe_outcome(&report.outcome),
            report.duration_ms
        );
        log.push_str(&report.output);
        if !report.output.is_empty() && !report.output.ends_with('\n') {
            log.push('\n');
        }
    }
    fs::write(path, log).map_err(io_err(path))
}

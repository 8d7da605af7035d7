use crate::config::{ConfigurationError, HarvestConfig};
use crate::corpus::{Bucket, BucketLabel};
use crate::driver::{BUCKET_RESULT_FILE, BucketResult, PROFILE_LOG_FILE};
use crate::environment::{Environment, EnvironmentFault, ExecOutput};
use crate::observability::bucket_span;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

pub const RUN_SUMMARY_FILE: &str = "run_summary.json";
pub const STAGED_CONFIG_FILE: &str = "harvest.toml";
pub const STAGED_BINARY_FILE: &str = "covharvest";
/// Captured stdout and stderr of the driver.
pub const DRIVER_OUTPUT_FILE: &str = "driver_output.log";

/// Everything collected during one run, written as `run_summary.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub baseline: String,
    pub environment: String,
    pub buckets: Vec<BucketResult>,
}

impl RunReport {
    pub fn completed(&self) -> usize {
        self.buckets.iter().filter(|b| b.is_completed()).count()
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    /// Host path of the binary that plays the driver and executor roles.
    pub harvest_binary: PathBuf,
    /// Configuration staged next to the binary.
    pub staged_config: String,
    pub output: PathBuf,
    pub baseline: String,
}

impl LifecycleSettings {
    pub fn from_config(
        config: &HarvestConfig,
        harvest_binary: PathBuf,
    ) -> Result<Self, ConfigurationError> {
        Ok(Self {
            harvest_binary,
            staged_config: config.to_toml()?,
            output: config.run.output.clone(),
            baseline: config.run.baseline.clone(),
        })
    }

    /// `<output>/profdata/<baseline>`
    pub fn results_dir(&self) -> PathBuf {
        self.output.join("profdata").join(&self.baseline)
    }
}

/// Releases the environment when dropped unless it was already released.
struct ReleaseGuard<'a> {
    env: &'a mut dyn Environment,
    released: bool,
}

impl<'a> ReleaseGuard<'a> {
    fn new(env: &'a mut dyn Environment) -> Self {
        Self { env, released: false }
    }

    fn release(&mut self) -> Result<(), EnvironmentFault> {
        self.released = true;
        self.env.release()
    }
}

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.env.release() {
            error!(environment = self.env.name(), "Failed to release environment: {e}");
        }
    }
}

/// Environment-side layout of a run.
struct EnvLayout {
    inputs: PathBuf,
    profraw: PathBuf,
    binary: PathBuf,
    config: PathBuf,
}

impl EnvLayout {
    fn under(root: &Path) -> Self {
        let bin = root.join("bin");
        Self {
            inputs: root.join("inputs"),
            profraw: root.join("profraw"),
            binary: bin.join(STAGED_BINARY_FILE),
            config: bin.join(STAGED_CONFIG_FILE),
        }
    }
}

/// Owns one environment for the whole run and processes buckets in it one
/// at a time.
pub struct LifecycleManager {
    env: Box<dyn Environment>,
    settings: LifecycleSettings,
}

impl LifecycleManager {
    pub fn new(env: Box<dyn Environment>, settings: LifecycleSettings) -> Self {
        Self { env, settings }
    }

    pub fn environment(&self) -> &dyn Environment {
        self.env.as_ref()
    }

    /// Processes every bucket in ascending label order. Driver failures are
    /// recorded per bucket; staging and retrieval faults abort the run. The
    /// environment is released on every path.
    pub fn run_all(&mut self, buckets: &[Bucket]) -> Result<RunReport, EnvironmentFault> {
        let mut guard = ReleaseGuard::new(self.env.as_mut());
        let outcome = run_buckets(&mut *guard.env, &self.settings, buckets);
        let released = guard.release();

        match (outcome, released) {
            (Ok(report), Ok(())) => Ok(report),
            (Ok(report), Err(e)) => {
                warn!("Run finished but the environment was not released cleanly: {e}");
                Ok(report)
            }
            (Err(primary), Err(release)) => {
                error!("Failed to release environment after fault: {release}");
                Err(primary)
            }
            (Err(primary), Ok(())) => Err(primary),
        }
    }
}

fn run_buckets(
    env: &mut dyn Environment,
    settings: &LifecycleSettings,
    buckets: &[Bucket],
) -> Result<RunReport, EnvironmentFault> {
    env.start()?;
    let layout = EnvLayout::under(env.root());
    for dir in [&layout.inputs, &layout.profraw] {
        env.ensure_dir(dir)?;
    }
    if let Some(bin) = layout.binary.parent() {
        env.ensure_dir(bin)?;
    }
    env.stage_in(&settings.harvest_binary, &layout.binary)?;
    stage_config(env, &settings.staged_config, &layout.config)?;

    let results_dir = settings.results_dir();
    create_host_dir(&results_dir)?;

    let mut ordered: Vec<&Bucket> = buckets.iter().collect();
    ordered.sort_by_key(|b| b.label);

    let mut report = RunReport {
        baseline: settings.baseline.clone(),
        environment: env.name().to_string(),
        buckets: Vec::with_capacity(ordered.len()),
    };
    for (index, bucket) in ordered.iter().enumerate() {
        let span = bucket_span(&bucket.label.to_string(), env.name());
        let _entered = span.enter();
        info!(
            bucket = %bucket.label,
            position = index + 1,
            total = ordered.len(),
            "Processing bucket"
        );
        let result = run_bucket(env, &layout, bucket, &results_dir.join(bucket.label.to_string()))?;
        report.buckets.push(result);
    }

    let summary_path = results_dir.join(RUN_SUMMARY_FILE);
    let summary = serde_json::to_string_pretty(&report).map_err(|e| EnvironmentFault::Retrieve {
        from: summary_path.clone(),
        to: summary_path.clone(),
        reason: e.to_string(),
    })?;
    fs::write(&summary_path, summary).map_err(|e| host_fault(&summary_path, e))?;
    info!(
        buckets = report.buckets.len(),
        completed = report.completed(),
        summary = %summary_path.display(),
        "Run finished"
    );
    Ok(report)
}

fn run_bucket(
    env: &mut dyn Environment,
    layout: &EnvLayout,
    bucket: &Bucket,
    host_dir: &Path,
) -> Result<BucketResult, EnvironmentFault> {
    let label = bucket.label.to_string();
    let env_input = layout.inputs.join(&label);
    let env_output = layout.profraw.join(&label);

    let result = collect_bucket(env, layout, bucket, host_dir, &env_input, &env_output)?;
    for staged in [&env_input, &env_output] {
        if let Err(e) = env.remove(staged) {
            warn!(bucket = %label, path = %staged.display(), "Failed to clear staging area: {e}");
        }
    }
    Ok(result)
}

/// Stages one bucket in, drives it, and retrieves what the driver produced.
fn collect_bucket(
    env: &mut dyn Environment,
    layout: &EnvLayout,
    bucket: &Bucket,
    host_dir: &Path,
    env_input: &Path,
    env_output: &Path,
) -> Result<BucketResult, EnvironmentFault> {
    let label = bucket.label.to_string();

    env.stage_in(&bucket.path, env_input)?;
    env.ensure_dir(env_output)?;
    create_host_dir(host_dir)?;

    let argv = vec![
        layout.binary.display().to_string(),
        "drive".to_string(),
        "--config".to_string(),
        layout.config.display().to_string(),
        "--input".to_string(),
        env_input.display().to_string(),
        "--output".to_string(),
        env_output.display().to_string(),
        "--label".to_string(),
        label.clone(),
    ];
    let out = env.exec(&argv)?;
    keep_driver_output(&out, host_dir, bucket.label);

    if !out.success {
        return Ok(record_driver_failure(env, bucket.label, &out, env_output, host_dir));
    }

    let result_host = host_dir.join(BUCKET_RESULT_FILE);
    env.stage_out(&env_output.join(BUCKET_RESULT_FILE), &result_host)?;
    let result = match BucketResult::load(&result_host) {
        Ok(result) => result,
        Err(e) => {
            warn!(bucket = %label, "Driver result is unreadable: {e}");
            return Ok(record_driver_failure(env, bucket.label, &out, env_output, host_dir));
        }
    };

    if let Some(artifact) = &result.artifact {
        env.stage_out(&env_output.join(artifact), &host_dir.join(artifact))?;
    }
    env.stage_out(&env_output.join(PROFILE_LOG_FILE), &host_dir.join(PROFILE_LOG_FILE))?;

    info!(
        bucket = %label,
        succeeded = result.succeeded,
        timed_out = result.timed_out,
        crashed = result.crashed,
        artifact = result.artifact.is_some(),
        "Bucket collected"
    );
    Ok(result)
}

fn record_driver_failure(
    env: &mut dyn Environment,
    label: BucketLabel,
    out: &ExecOutput,
    env_output: &Path,
    host_dir: &Path,
) -> BucketResult {
    let last_line = out
        .stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("no output")
        .trim();
    let reason = match out.code {
        Some(code) => format!("driver exited with status {code}: {last_line}"),
        None => format!("driver terminated abnormally: {last_line}"),
    };
    warn!(bucket = %label, "{reason}");

    if let Err(e) = env.stage_out(&env_output.join(PROFILE_LOG_FILE), &host_dir.join(PROFILE_LOG_FILE)) {
        debug!(bucket = %label, "No profile log to retrieve: {e}");
    }

    let result = BucketResult::driver_failed(label, reason);
    if let Ok(json) = serde_json::to_string_pretty(&result)
        && let Err(e) = fs::write(host_dir.join(BUCKET_RESULT_FILE), json)
    {
        debug!(bucket = %label, "Failed to write bucket result: {e}");
    }
    result
}

fn keep_driver_output(out: &ExecOutput, host_dir: &Path, label: BucketLabel) {
    let captured = format!("--- stdout ---\n{}\n--- stderr ---\n{}\n", out.stdout, out.stderr);
    if let Err(e) = fs::write(host_dir.join(DRIVER_OUTPUT_FILE), captured) {
        debug!(bucket = %label, "Failed to keep driver output: {e}");
    }
}

fn stage_config(
    env: &mut dyn Environment,
    content: &str,
    destination: &Path,
) -> Result<(), EnvironmentFault> {
    let mut staged = tempfile::NamedTempFile::new().map_err(|e| host_fault(destination, e))?;
    staged
        .write_all(content.as_bytes())
        .and_then(|_| staged.flush())
        .map_err(|e| host_fault(staged.path(), e))?;
    env.stage_in(staged.path(), destination)
}

fn create_host_dir(dir: &Path) -> Result<(), EnvironmentFault> {
    fs::create_dir_all(dir).map_err(|e| host_fault(dir, e))
}

fn host_fault(path: &Path, e: std::io::Error) -> EnvironmentFault {
    EnvironmentFault::Retrieve {
        from: path.to_path_buf(),
        to: path.to_path_buf(),
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::BucketStatus;
    use crate::environment::LocalEnvironment;
    use tempfile::tempdir;

    /// A stand-in harvest binary: its `drive` role records the bucket order,
    /// fails for `60-120`, and otherwise writes a completed result.
    const FAKE_HARVEST: &str = r#"#!/bin/sh
while [ $# -gt 0 ]; do
    case "$1" in
        --input) input="$2"; shift 2 ;;
        --output) output="$2"; shift 2 ;;
        --label) label="$2"; shift 2 ;;
        *) shift ;;
    esac
done
echo "$label" >> '@ORDER@'
echo "$(ls inputs) / $(ls profraw)" >> '@STAGED@'
if [ "$label" = "60-120" ]; then
    echo "driver blew up" >&2
    exit 1
fi
ls "$input" > "$output/profile.log"
printf 'merged' > "$output/merged.profdata"
cat > "$output/bucket_result.json" <<EOF
{"label":"$label","status":{"kind":"completed"},"tasks":1,"succeeded":1,"timed_out":0,"crashed":0,"launch_failed":0,"records_merged":1,"records_skipped":0,"artifact":"merged.profdata","merge_error":null,"peak_concurrency":1}
EOF
"#;

    struct Fixture {
        host: tempfile::TempDir,
        order: PathBuf,
        staged: PathBuf,
        binary: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let host = tempdir().unwrap();
            let order = host.path().join("order.txt");
            let staged = host.path().join("staged.txt");
            let binary = host.path().join("fake_harvest");
            let script = FAKE_HARVEST
                .replace("@ORDER@", &order.display().to_string())
                .replace("@STAGED@", &staged.display().to_string());
            fs::write(&binary, script).unwrap();
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&binary, fs::Permissions::from_mode(0o755)).unwrap();
            }
            Self {
                host,
                order,
                staged,
                binary,
            }
        }

        fn bucket(&self, label: &str) -> Bucket {
            let path = self.host.path().join("corpus").join(label);
            fs::create_dir_all(path.join("sub")).unwrap();
            fs::write(path.join("sub/prog.py"), "pass\n").unwrap();
            Bucket {
                label: label.parse().unwrap(),
                path,
                files: vec![PathBuf::from("sub/prog.py")],
            }
        }

        fn manager(&self) -> LifecycleManager {
            LifecycleManager::new(
                Box::new(LocalEnvironment::new("covharvest_lifecycle_test")),
                LifecycleSettings {
                    harvest_binary: self.binary.clone(),
                    staged_config: HarvestConfig::default().to_toml().unwrap(),
                    output: self.host.path().join("_result"),
                    baseline: "acetest".to_string(),
                },
            )
        }

        fn order(&self) -> Vec<String> {
            fs::read_to_string(&self.order)
                .unwrap_or_default()
                .lines()
                .map(str::to_string)
                .collect()
        }
    }

    #[test]
    fn buckets_run_in_order_and_driver_failure_does_not_stop_the_run() {
        let fx = Fixture::new();
        let buckets = vec![fx.bucket("120-180"), fx.bucket("0-60"), fx.bucket("60-120")];
        let mut manager = fx.manager();

        let report = manager.run_all(&buckets).unwrap();

        assert_eq!(fx.order(), vec!["0-60", "60-120", "120-180"]);
        let labels: Vec<String> = report.buckets.iter().map(|b| b.label.to_string()).collect();
        assert_eq!(labels, vec!["0-60", "60-120", "120-180"]);
        assert_eq!(report.completed(), 2);
        match &report.buckets[1].status {
            BucketStatus::DriverFailed { reason } => assert!(reason.contains("driver blew up")),
            other => panic!("Expected DriverFailed, got {other:?}"),
        }

        let results = fx.host.path().join("_result/profdata/acetest");
        assert_eq!(fs::read(results.join("0-60/merged.profdata")).unwrap(), b"merged");
        assert_eq!(fs::read_to_string(results.join("0-60/profile.log")).unwrap(), "sub\n");
        assert!(results.join("120-180/bucket_result.json").is_file());
        assert!(results.join("60-120/driver_output.log").is_file());
        assert!(results.join("0-60/driver_output.log").is_file());
        assert!(!results.join("60-120/merged.profdata").exists());

        let summary: RunReport =
            serde_json::from_str(&fs::read_to_string(results.join(RUN_SUMMARY_FILE)).unwrap()).unwrap();
        assert_eq!(summary, report);

        // The scratch environment is gone once the run is over.
        assert!(!manager.environment().root().exists());
    }

    #[test]
    fn staging_areas_are_cleared_after_each_bucket() {
        let fx = Fixture::new();
        let buckets = vec![fx.bucket("0-60"), fx.bucket("60-120"), fx.bucket("120-180")];
        let mut manager = fx.manager();

        manager.run_all(&buckets).unwrap();

        // Each line lists what the environment held while that bucket was
        // driven: only the bucket itself, including after the failed one.
        let staged: Vec<String> = fs::read_to_string(&fx.staged)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect();
        assert_eq!(staged, vec!["0-60 / 0-60", "60-120 / 60-120", "120-180 / 120-180"]);
    }

    #[test]
    fn staging_fault_aborts_remaining_buckets_and_releases() {
        let fx = Fixture::new();
        let mut missing = fx.bucket("60-120");
        missing.path = fx.host.path().join("corpus/does-not-exist");
        let buckets = vec![fx.bucket("0-60"), missing, fx.bucket("120-180")];
        let mut manager = fx.manager();

        let err = manager.run_all(&buckets).unwrap_err();

        assert!(matches!(err, EnvironmentFault::Stage { .. }), "got {err:?}");
        assert_eq!(fx.order(), vec!["0-60"]);
        assert!(!manager.environment().root().exists());
        assert!(!fx.host.path().join("_result/profdata/acetest/run_summary.json").exists());
    }

    #[test]
    fn missing_harvest_binary_is_a_fault_before_any_bucket() {
        let fx = Fixture::new();
        let buckets = vec![fx.bucket("0-60")];
        let mut manager = LifecycleManager::new(
            Box::new(LocalEnvironment::new("covharvest_lifecycle_test")),
            LifecycleSettings {
                harvest_binary: fx.host.path().join("no-such-binary"),
                staged_config: String::new(),
                output: fx.host.path().join("_result"),
                baseline: "acetest".to_string(),
            },
        );

        assert!(matches!(manager.run_all(&buckets), Err(EnvironmentFault::Stage { .. })));
        assert!(fx.order().is_empty());
        assert!(!manager.environment().root().exists());
    }

    #[test]
    fn release_guard_releases_on_drop() {
        let mut env = LocalEnvironment::new("covharvest_guard_test");
        env.start().unwrap();
        let root = env.root().to_path_buf();
        {
            let _guard = ReleaseGuard::new(&mut env);
        }
        assert!(!root.exists());
    }
}

use crate::config::{ConfigurationError, HarvestConfig};
use crate::corpus::classify;
use crate::environment::{self, EnvironmentFault};
use crate::lifecycle::{LifecycleManager, LifecycleSettings, RunReport};
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

/// Errors that end a collection run with a non-zero exit status.
#[derive(Error, Debug)]
pub enum HarvestError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Environment(#[from] EnvironmentFault),
}

impl HarvestError {
    pub fn exit_code(&self) -> i32 {
        match self {
            HarvestError::Configuration(_) => 2,
            HarvestError::Environment(_) => 3,
        }
    }
}

/// One complete collection run: partition the corpus, then process every
/// bucket inside a single environment.
///
/// Individual program, task and merge failures are reflected in the returned
/// report; only configuration problems and environment faults are errors.
pub fn collect(config: &HarvestConfig, harvest_binary: PathBuf) -> Result<RunReport, HarvestError> {
    config.validate()?;
    let target = config
        .run
        .target
        .as_deref()
        .ok_or(ConfigurationError::Missing("target"))?;

    let classification = classify(target, &config.classify_options())?;
    info!(
        buckets = classification.buckets.len(),
        files = classification.total_files(),
        pre_bucketed = classification.pre_bucketed,
        "Corpus partitioned"
    );

    let env = environment::from_config(config)?;
    let settings = LifecycleSettings::from_config(config, harvest_binary)?;
    let mut manager = LifecycleManager::new(env, settings);
    Ok(manager.run_all(&classification.buckets)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvironmentKind;
    use std::fs;
    use tempfile::tempdir;

    /// Minimal `drive` stand-in that reports an empty completed bucket.
    const FAKE_DRIVER: &str = r#"#!/bin/sh
while [ $# -gt 0 ]; do
    case "$1" in
        --output) output="$2"; shift 2 ;;
        --label) label="$2"; shift 2 ;;
        *) shift ;;
    esac
done
echo "driven $label" > "$output/profile.log"
cat > "$output/bucket_result.json" <<EOF
{"label":"$label","status":{"kind":"completed"},"tasks":0,"succeeded":0,"timed_out":0,"crashed":0,"launch_failed":0,"records_merged":0,"records_skipped":0,"artifact":null,"merge_error":null,"peak_concurrency":0}
EOF
"#;

    fn local_config(target: PathBuf, output: PathBuf) -> HarvestConfig {
        let mut config = HarvestConfig::default();
        config.run.target = Some(target);
        config.run.output = output;
        config.environment.kind = EnvironmentKind::Local;
        config
    }

    #[test]
    fn missing_target_is_a_configuration_error() {
        let dir = tempdir().unwrap();
        let config = local_config(dir.path().join("absent"), dir.path().join("_result"));
        let err = collect(&config, dir.path().join("bin")).unwrap_err();
        assert!(matches!(err, HarvestError::Configuration(ConfigurationError::TargetMissing(_))));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn docker_run_without_library_is_a_configuration_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.py"), "pass\n").unwrap();
        let mut config = local_config(dir.path().to_path_buf(), dir.path().join("_result"));
        config.environment.kind = EnvironmentKind::Docker;
        let err = collect(&config, dir.path().join("bin")).unwrap_err();
        assert!(matches!(err, HarvestError::Configuration(ConfigurationError::Missing("library"))));
    }

    #[test]
    fn environment_fault_maps_to_exit_code_three() {
        let dir = tempdir().unwrap();
        let corpus = dir.path().join("corpus");
        fs::create_dir_all(&corpus).unwrap();
        fs::write(corpus.join("a.py"), "pass\n").unwrap();
        let config = local_config(corpus, dir.path().join("_result"));

        let err = collect(&config, dir.path().join("no-such-binary")).unwrap_err();
        assert!(matches!(err, HarvestError::Environment(EnvironmentFault::Stage { .. })));
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn local_run_classifies_and_collects_every_bucket() {
        let dir = tempdir().unwrap();
        let corpus = dir.path().join("corpus");
        fs::create_dir_all(corpus.join("pkg")).unwrap();
        fs::write(corpus.join("pkg/a.py"), "pass\n").unwrap();
        fs::write(corpus.join("b.py"), "pass\n").unwrap();

        let binary = dir.path().join("fake_harvest");
        fs::write(&binary, FAKE_DRIVER).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&binary, fs::Permissions::from_mode(0o755)).unwrap();
        }

        let output = dir.path().join("_result");
        let config = local_config(corpus, output.clone());
        let report = collect(&config, binary).unwrap();

        // Files written moments apart land in the first 60-second bucket.
        assert_eq!(report.buckets.len(), 1);
        assert_eq!(report.buckets[0].label.to_string(), "0-60");
        assert!(output.join("acetest/0-60/pkg/a.py").is_file());
        assert!(output.join("acetest/0-60/_root/b.py").is_file());
        assert_eq!(
            fs::read_to_string(output.join("profdata/acetest/0-60/profile.log")).unwrap(),
            "driven 0-60\n"
        );
        assert!(output.join("profdata/acetest/run_summary.json").is_file());
    }
}

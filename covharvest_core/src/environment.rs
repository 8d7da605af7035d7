use crate::config::{ConfigurationError, EnvironmentKind, HarvestConfig};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Failures of the sandbox itself. Unlike task or program failures these
/// abort the run.
#[derive(Error, Debug)]
pub enum EnvironmentFault {
    #[error("Environment image '{0}' not found; build it before collecting")]
    ImageMissing(String),

    #[error("Failed to start environment '{name}': {reason}")]
    Start { name: String, reason: String },

    #[error("Environment has not been started")]
    NotStarted,

    #[error("Failed to stage {from:?} into environment at {to:?}: {reason}")]
    Stage {
        from: PathBuf,
        to: PathBuf,
        reason: String,
    },

    #[error("Failed to retrieve {from:?} from environment to {to:?}: {reason}")]
    Retrieve {
        from: PathBuf,
        to: PathBuf,
        reason: String,
    },

    #[error("Failed to execute {command:?} in environment: {reason}")]
    Exec { command: String, reason: String },

    #[error("Failed to release environment '{name}': {reason}")]
    Release { name: String, reason: String },
}

/// Result of a command executed inside an environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl From<Output> for ExecOutput {
    fn from(output: Output) -> Self {
        Self {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// An isolated place where the instrumented library, the interpreter and the
/// harvest binary live. Paths passed to these methods are environment-side
/// paths rooted at [`Environment::root`].
pub trait Environment {
    fn name(&self) -> &str;

    fn root(&self) -> &Path;

    fn start(&mut self) -> Result<(), EnvironmentFault>;

    fn ensure_dir(&mut self, path: &Path) -> Result<(), EnvironmentFault>;

    /// Copies a host file or directory to exactly `path` inside the
    /// environment. A directory's contents end up directly under `path`.
    fn stage_in(&mut self, host: &Path, path: &Path) -> Result<(), EnvironmentFault>;

    /// Runs `argv` inside the environment with the root as working
    /// directory. A non-zero exit is reported in [`ExecOutput`], not as a
    /// fault.
    fn exec(&mut self, argv: &[String]) -> Result<ExecOutput, EnvironmentFault>;

    /// Copies the environment file at `path` to exactly `host`.
    fn stage_out(&mut self, path: &Path, host: &Path) -> Result<(), EnvironmentFault>;

    /// Deletes a file or directory tree inside the environment. A path that
    /// does not exist is not a fault.
    fn remove(&mut self, path: &Path) -> Result<(), EnvironmentFault>;

    /// Stops and removes the environment. Calling it on an environment that
    /// was never started, or was already released, does nothing.
    fn release(&mut self) -> Result<(), EnvironmentFault>;
}

/// Builds the environment selected by the configuration.
pub fn from_config(config: &HarvestConfig) -> Result<Box<dyn Environment>, ConfigurationError> {
    match config.environment.kind {
        EnvironmentKind::Docker => Ok(Box::new(DockerEnvironment::new(
            config.environment.docker_binary.clone(),
            config.image_name()?,
            config.environment_name(),
            PathBuf::from(&config.environment.container_root),
        ))),
        EnvironmentKind::Local => Ok(Box::new(LocalEnvironment::new(config.environment_name()))),
    }
}

/// A container driven through the `docker` command line.
#[derive(Debug)]
pub struct DockerEnvironment {
    docker: String,
    image: String,
    name: String,
    root: PathBuf,
    container_id: Option<String>,
}

impl DockerEnvironment {
    pub fn new(docker: String, image: String, name: String, root: PathBuf) -> Self {
        Self {
            docker,
            image,
            name,
            root,
            container_id: None,
        }
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    fn docker(&self, args: &[&str]) -> io::Result<Output> {
        debug!(docker = %self.docker, ?args, "Running docker");
        Command::new(&self.docker)
            .args(args)
            .stdin(Stdio::null())
            .output()
    }

    fn container(&self) -> Result<&str, EnvironmentFault> {
        self.container_id.as_deref().ok_or(EnvironmentFault::NotStarted)
    }

    fn image_exists(&self) -> Result<bool, EnvironmentFault> {
        let out = self
            .docker(&["images", "-q", self.image.as_str()])
            .map_err(|e| EnvironmentFault::Start {
                name: self.name.clone(),
                reason: format!("Failed to run '{}': {e}", self.docker),
            })?;
        if !out.status.success() {
            return Err(EnvironmentFault::Start {
                name: self.name.clone(),
                reason: stderr_of(&out),
            });
        }
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }
}

fn stderr_of(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.is_empty() {
        format!("exited with {}", output.status)
    } else {
        stderr
    }
}

impl Environment for DockerEnvironment {
    fn name(&self) -> &str {
        &self.name
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn start(&mut self) -> Result<(), EnvironmentFault> {
        if self.container_id.is_some() {
            return Ok(());
        }
        if !self.image_exists()? {
            return Err(EnvironmentFault::ImageMissing(self.image.clone()));
        }

        // A container left behind by an interrupted run would block the name.
        if let Ok(out) = self.docker(&["rm", "-fv", self.name.as_str()])
            && out.status.success()
        {
            debug!(name = %self.name, "Removed stale container");
        }

        info!(name = %self.name, image = %self.image, "Starting container");
        let out = self
            .docker(&["run", "-td", "--name", self.name.as_str(), self.image.as_str()])
            .map_err(|e| EnvironmentFault::Start {
                name: self.name.clone(),
                reason: e.to_string(),
            })?;
        if !out.status.success() {
            return Err(EnvironmentFault::Start {
                name: self.name.clone(),
                reason: stderr_of(&out),
            });
        }
        let id = String::from_utf8_lossy(&out.stdout).trim().to_string();
        self.container_id = Some(if id.is_empty() { self.name.clone() } else { id });
        Ok(())
    }

    fn ensure_dir(&mut self, path: &Path) -> Result<(), EnvironmentFault> {
        let out = self.exec(&["mkdir".to_string(), "-p".to_string(), path.display().to_string()])?;
        if !out.success {
            return Err(EnvironmentFault::Exec {
                command: format!("mkdir -p {}", path.display()),
                reason: out.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    fn stage_in(&mut self, host: &Path, path: &Path) -> Result<(), EnvironmentFault> {
        let fault = |reason: String| EnvironmentFault::Stage {
            from: host.to_path_buf(),
            to: path.to_path_buf(),
            reason,
        };
        if !host.exists() {
            return Err(fault("source does not exist".to_string()));
        }
        // `SRC/.` copies directory contents, so the destination name is exact.
        let source = if host.is_dir() {
            self.ensure_dir(path)?;
            format!("{}/.", host.display())
        } else {
            if let Some(parent) = path.parent() {
                self.ensure_dir(parent)?;
            }
            host.display().to_string()
        };
        let destination = format!("{}:{}", self.container()?, path.display());
        let out = self
            .docker(&["cp", source.as_str(), destination.as_str()])
            .map_err(|e| fault(e.to_string()))?;
        if !out.status.success() {
            return Err(fault(stderr_of(&out)));
        }
        debug!(from = %host.display(), to = %path.display(), "Staged into container");
        Ok(())
    }

    fn exec(&mut self, argv: &[String]) -> Result<ExecOutput, EnvironmentFault> {
        let container = self.container()?.to_string();
        let root = self.root.display().to_string();
        let mut args: Vec<&str> = vec!["exec", "-w", root.as_str(), container.as_str()];
        args.extend(argv.iter().map(String::as_str));
        let out = self.docker(&args).map_err(|e| EnvironmentFault::Exec {
            command: argv.join(" "),
            reason: e.to_string(),
        })?;
        Ok(out.into())
    }

    fn stage_out(&mut self, path: &Path, host: &Path) -> Result<(), EnvironmentFault> {
        let fault = |reason: String| EnvironmentFault::Retrieve {
            from: path.to_path_buf(),
            to: host.to_path_buf(),
            reason,
        };
        if let Some(parent) = host.parent() {
            fs::create_dir_all(parent).map_err(|e| fault(e.to_string()))?;
        }
        let source = format!("{}:{}", self.container()?, path.display());
        let destination = host.display().to_string();
        let out = self
            .docker(&["cp", source.as_str(), destination.as_str()])
            .map_err(|e| fault(e.to_string()))?;
        if !out.status.success() {
            return Err(fault(stderr_of(&out)));
        }
        Ok(())
    }

    fn remove(&mut self, path: &Path) -> Result<(), EnvironmentFault> {
        let out = self.exec(&["rm".to_string(), "-rf".to_string(), path.display().to_string()])?;
        if !out.success {
            return Err(EnvironmentFault::Exec {
                command: format!("rm -rf {}", path.display()),
                reason: out.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    fn release(&mut self) -> Result<(), EnvironmentFault> {
        let Some(container) = self.container_id.take() else {
            return Ok(());
        };
        info!(name = %self.name, "Stopping container");
        let stop = self.docker(&["stop", container.as_str()]);
        if let Err(e) = &stop {
            warn!(name = %self.name, "docker stop failed: {e}");
        }
        let out = self
            .docker(&["rm", "-fv", container.as_str()])
            .map_err(|e| EnvironmentFault::Release {
                name: self.name.clone(),
                reason: e.to_string(),
            })?;
        if !out.status.success() {
            return Err(EnvironmentFault::Release {
                name: self.name.clone(),
                reason: stderr_of(&out),
            });
        }
        Ok(())
    }
}

/// A scratch directory on the host. Commands run directly on the host, so
/// the instrumented library and interpreter must already be available there.
#[derive(Debug)]
pub struct LocalEnvironment {
    name: String,
    root: PathBuf,
    scratch: Option<TempDir>,
}

impl LocalEnvironment {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            root: PathBuf::new(),
            scratch: None,
        }
    }

    fn resolve(&self, path: &Path) -> Option<PathBuf> {
        self.scratch.as_ref()?;
        let relative = path.strip_prefix(&self.root).ok()?;
        Some(self.root.join(relative))
    }
}

/// Recursively copies `from` to `to`, creating `to` and its parents.
pub fn copy_tree(from: &Path, to: &Path) -> io::Result<u64> {
    if from.is_file() {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        return fs::copy(from, to);
    }
    let mut copied = 0;
    for entry in WalkDir::new(from).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry.path().strip_prefix(from).unwrap_or(entry.path());
        let target = to.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            copied += fs::copy(entry.path(), &target)?;
        }
    }
    Ok(copied)
}

impl Environment for LocalEnvironment {
    fn name(&self) -> &str {
        &self.name
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn start(&mut self) -> Result<(), EnvironmentFault> {
        if self.scratch.is_some() {
            return Ok(());
        }
        let scratch = tempfile::Builder::new()
            .prefix(&format!("{}-", self.name))
            .tempdir()
            .map_err(|e| EnvironmentFault::Start {
                name: self.name.clone(),
                reason: e.to_string(),
            })?;
        self.root = scratch.path().to_path_buf();
        info!(name = %self.name, root = %self.root.display(), "Started local environment");
        self.scratch = Some(scratch);
        Ok(())
    }

    fn ensure_dir(&mut self, path: &Path) -> Result<(), EnvironmentFault> {
        let target = self.resolve(path).ok_or(EnvironmentFault::NotStarted)?;
        fs::create_dir_all(&target).map_err(|e| EnvironmentFault::Exec {
            command: format!("mkdir -p {}", path.display()),
            reason: e.to_string(),
        })
    }

    fn stage_in(&mut self, host: &Path, path: &Path) -> Result<(), EnvironmentFault> {
        let fault = |reason: String| EnvironmentFault::Stage {
            from: host.to_path_buf(),
            to: path.to_path_buf(),
            reason,
        };
        if self.scratch.is_none() {
            return Err(EnvironmentFault::NotStarted);
        }
        let target = self
            .resolve(path)
            .ok_or_else(|| fault("destination is outside the environment root".to_string()))?;
        if !host.exists() {
            return Err(fault("source does not exist".to_string()));
        }
        copy_tree(host, &target).map_err(|e| fault(e.to_string()))?;
        Ok(())
    }

    fn exec(&mut self, argv: &[String]) -> Result<ExecOutput, EnvironmentFault> {
        if self.scratch.is_none() {
            return Err(EnvironmentFault::NotStarted);
        }
        let Some((program, args)) = argv.split_first() else {
            return Err(EnvironmentFault::Exec {
                command: String::new(),
                reason: "empty command".to_string(),
            });
        };
        let out = Command::new(program)
            .args(args)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| EnvironmentFault::Exec {
                command: argv.join(" "),
                reason: e.to_string(),
            })?;
        Ok(out.into())
    }

    fn stage_out(&mut self, path: &Path, host: &Path) -> Result<(), EnvironmentFault> {
        let fault = |reason: String| EnvironmentFault::Retrieve {
            from: path.to_path_buf(),
            to: host.to_path_buf(),
            reason,
        };
        if self.scratch.is_none() {
            return Err(EnvironmentFault::NotStarted);
        }
        let source = self
            .resolve(path)
            .ok_or_else(|| fault("source is outside the environment root".to_string()))?;
        if !source.exists() {
            return Err(fault("no such file in environment".to_string()));
        }
        copy_tree(&source, host).map_err(|e| fault(e.to_string()))?;
        Ok(())
    }

    fn remove(&mut self, path: &Path) -> Result<(), EnvironmentFault> {
        let fault = |reason: String| EnvironmentFault::Exec {
            command: format!("rm -rf {}", path.display()),
            reason,
        };
        if self.scratch.is_none() {
            return Err(EnvironmentFault::NotStarted);
        }
        let target = self
            .resolve(path)
            .filter(|target| *target != self.root)
            .ok_or_else(|| fault("path is not inside the environment root".to_string()))?;
        let removed = if target.is_dir() {
            fs::remove_dir_all(&target)
        } else {
            fs::remove_file(&target)
        };
        match removed {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(fault(e.to_string())),
        }
    }

    fn release(&mut self) -> Result<(), EnvironmentFault> {
        let Some(scratch) = self.scratch.take() else {
            return Ok(());
        };
        info!(name = %self.name, "Releasing local environment");
        scratch.close().map_err(|e| EnvironmentFault::Release {
            name: self.name.clone(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod local_environment_tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn stage_exec_and_retrieve_round_trip() {
        let host = tempdir().unwrap();
        fs::create_dir_all(host.path().join("bucket/sub")).unwrap();
        fs::write(host.path().join("bucket/sub/a.py"), "print(1)\n").unwrap();

        let mut env = LocalEnvironment::new("covharvest_test");
        env.start().unwrap();
        let root = env.root().to_path_buf();
        assert!(root.is_dir());

        let inputs = root.join("inputs/0-60");
        env.stage_in(&host.path().join("bucket"), &inputs).unwrap();
        assert!(inputs.join("sub/a.py").is_file());

        let out = env
            .exec(&["sh".to_string(), "-c".to_string(), "ls inputs/0-60/sub > listing.txt".to_string()])
            .unwrap();
        assert!(out.success, "stderr: {}", out.stderr);

        let retrieved = host.path().join("back/listing.txt");
        env.stage_out(&root.join("listing.txt"), &retrieved).unwrap();
        assert_eq!(fs::read_to_string(&retrieved).unwrap(), "a.py\n");

        env.release().unwrap();
        assert!(!root.exists());
        // Releasing twice is harmless.
        env.release().unwrap();
    }

    #[test]
    fn non_zero_exit_is_not_a_fault() {
        let mut env = LocalEnvironment::new("covharvest_test");
        env.start().unwrap();
        let out = env
            .exec(&["sh".to_string(), "-c".to_string(), "echo oops >&2; exit 4".to_string()])
            .unwrap();
        assert!(!out.success);
        assert_eq!(out.code, Some(4));
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[test]
    fn operations_before_start_are_rejected() {
        let mut env = LocalEnvironment::new("covharvest_test");
        assert!(matches!(
            env.exec(&["true".to_string()]),
            Err(EnvironmentFault::NotStarted)
        ));
        assert!(matches!(
            env.ensure_dir(Path::new("/anything")),
            Err(EnvironmentFault::NotStarted)
        ));
    }

    #[test]
    fn retrieving_a_missing_file_is_a_fault() {
        let host = tempdir().unwrap();
        let mut env = LocalEnvironment::new("covharvest_test");
        env.start().unwrap();
        let root = env.root().to_path_buf();
        let err = env
            .stage_out(&root.join("nope.json"), &host.path().join("nope.json"))
            .unwrap_err();
        assert!(matches!(err, EnvironmentFault::Retrieve { .. }));
    }

    #[test]
    fn remove_deletes_trees_and_tolerates_missing_paths() {
        let host = tempdir().unwrap();
        fs::create_dir_all(host.path().join("bucket/sub")).unwrap();
        fs::write(host.path().join("bucket/sub/a.py"), "pass\n").unwrap();
        let mut env = LocalEnvironment::new("covharvest_test");
        env.start().unwrap();
        let root = env.root().to_path_buf();
        let inputs = root.join("inputs/0-60");
        env.stage_in(&host.path().join("bucket"), &inputs).unwrap();

        env.remove(&inputs).unwrap();
        assert!(!inputs.exists());
        assert!(root.join("inputs").is_dir());
        env.remove(&inputs).unwrap();

        assert!(matches!(env.remove(&root), Err(EnvironmentFault::Exec { .. })));
        assert!(matches!(
            env.remove(Path::new("/etc/covharvest_should_not_exist")),
            Err(EnvironmentFault::Exec { .. })
        ));
        assert!(root.is_dir());
    }

    #[test]
    fn staging_outside_the_root_is_a_fault() {
        let host = tempdir().unwrap();
        fs::write(host.path().join("f"), "x").unwrap();
        let mut env = LocalEnvironment::new("covharvest_test");
        env.start().unwrap();
        let err = env
            .stage_in(&host.path().join("f"), Path::new("/etc/covharvest_should_not_exist"))
            .unwrap_err();
        assert!(matches!(err, EnvironmentFault::Stage { .. }));
    }
}

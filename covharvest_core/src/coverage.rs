use crate::config::MergeSettings;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Names the destination of one subdirectory task's raw coverage record.
/// Set by the work-unit driver, read by the script executor.
pub const RAW_PROFILE_ENV: &str = "COVHARVEST_RAW_PROFILE";

/// Read by the instrumented runtime of each executed program.
pub const PROGRAM_PROFILE_ENV: &str = "LLVM_PROFILE_FILE";

/// Raw profile magic for 64-bit and 32-bit instrumented targets
/// (`\xfflprofr\x81` / `\xfflprofR\x81`).
const RAW_PROFILE_MAGIC_64: u64 = 0xff6c_7072_6f66_7281;
const RAW_PROFILE_MAGIC_32: u64 = 0xff6c_7072_6f66_5281;

/// Collects coverage produced while executing one subdirectory.
///
/// Each program run is handed its own fragment path (see
/// [`CoverageSink::next_fragment`]); in-process runtimes may also
/// [`append`](CoverageSink::append) bytes directly. Nothing reaches the
/// destination until [`flush`](CoverageSink::flush), which concatenates the
/// fragments in execution order into the single raw record. Raw profiles are
/// self-delimiting, so the concatenation is itself a valid raw profile.
#[derive(Debug)]
pub struct CoverageSink {
    destination: PathBuf,
    fragments_dir: PathBuf,
    fragments: Vec<PathBuf>,
    buffered: Vec<u8>,
}

/// The flushed raw coverage record of one subdirectory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub path: PathBuf,
    pub bytes: u64,
    /// Fragments that existed at flush time.
    pub fragments: usize,
}

impl CoverageSink {
    pub fn new(destination: impl Into<PathBuf>) -> Self {
        let destination = destination.into();
        let mut fragments_name = destination
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "record".into());
        fragments_name.push(".fragments");
        let fragments_dir = destination.with_file_name(fragments_name);
        Self {
            destination,
            fragments_dir,
            fragments: Vec::new(),
            buffered: Vec::new(),
        }
    }

    /// Builds a sink from [`RAW_PROFILE_ENV`], if set and non-empty.
    pub fn from_env() -> Option<Self> {
        std::env::var_os(RAW_PROFILE_ENV)
            .filter(|v| !v.is_empty())
            .map(|v| Self::new(PathBuf::from(v)))
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Reserves the fragment path for the next program run. The path is
    /// absolute because programs run from their own directory.
    pub fn next_fragment(&mut self) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.fragments_dir)?;
        let fragment = std::path::absolute(
            self.fragments_dir
                .join(format!("{:06}.profraw", self.fragments.len())),
        )?;
        self.fragments.push(fragment.clone());
        Ok(fragment)
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.buffered.extend_from_slice(bytes);
    }

    /// Writes the raw record. The destination is created even when no
    /// program produced coverage.
    pub fn flush(self) -> io::Result<RawRecord> {
        if let Some(parent) = self.destination.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&self.destination)?;
        let mut bytes = 0u64;
        let mut present = 0usize;

        for fragment in &self.fragments {
            match File::open(fragment) {
                Ok(mut f) => {
                    bytes += io::copy(&mut f, &mut out)?;
                    present += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(fragment = %fragment.display(), "Program left no coverage fragment");
                }
                Err(e) => return Err(e),
            }
        }
        out.write_all(&self.buffered)?;
        bytes += self.buffered.len() as u64;
        out.sync_all()?;

        match fs::remove_dir_all(&self.fragments_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(dir = %self.fragments_dir.display(), "Failed to remove fragments: {e}"),
        }

        Ok(RawRecord {
            path: self.destination,
            bytes,
            fragments: present,
        })
    }
}

/// Whether a raw record can be handed to the merge tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Usable,
    Missing,
    Empty,
    /// Present but not starting with a raw profile header.
    Unrecognized,
}

pub fn inspect_record(path: &Path) -> RecordState {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(_) => return RecordState::Missing,
    };
    let mut header = [0u8; 8];
    let mut filled = 0;
    while filled < header.len() {
        match file.read(&mut header[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(_) => return RecordState::Unrecognized,
        }
    }
    if filled == 0 {
        return RecordState::Empty;
    }
    if filled < header.len() {
        return RecordState::Unrecognized;
    }
    let le = u64::from_le_bytes(header);
    let be = u64::from_be_bytes(header);
    if [le, be]
        .iter()
        .any(|m| *m == RAW_PROFILE_MAGIC_64 || *m == RAW_PROFILE_MAGIC_32)
    {
        RecordState::Usable
    } else {
        RecordState::Unrecognized
    }
}

/// Splits candidate records into those worth merging and those skipped.
pub fn partition_records(paths: &[PathBuf]) -> (Vec<PathBuf>, Vec<(PathBuf, RecordState)>) {
    let mut usable = Vec::new();
    let mut skipped = Vec::new();
    for path in paths {
        match inspect_record(path) {
            RecordState::Usable => usable.push(path.clone()),
            state => skipped.push((path.clone(), state)),
        }
    }
    (usable, skipped)
}

/// Header bytes of a 64-bit little-endian raw profile.
pub fn raw_profile_header() -> [u8; 8] {
    RAW_PROFILE_MAGIC_64.to_le_bytes()
}

#[derive(Error, Debug)]
pub enum MergeError {
    #[error("No merge tool found (tried: {})", .0.join(", "))]
    ToolNotFound(Vec<String>),

    #[error("Failed to launch merge tool '{tool}': {source}")]
    Spawn {
        tool: String,
        #[source]
        source: io::Error,
    },

    #[error("Merge tool exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("Merge produced no artifact at {0:?}")]
    MissingOutput(PathBuf),
}

/// Combines raw coverage records into one merged artifact.
pub trait ProfileMerger: Send + Sync {
    fn name(&self) -> &str;

    /// Merges `records` (all pre-validated) into `output`.
    fn merge(&self, records: &[PathBuf], output: &Path) -> Result<(), MergeError>;
}

/// Invokes `llvm-profdata merge`.
#[derive(Debug, Clone)]
pub struct LlvmProfdataMerger {
    tool: String,
}

impl LlvmProfdataMerger {
    pub fn with_tool(tool: impl Into<String>) -> Self {
        Self { tool: tool.into() }
    }

    /// Picks the first tool that answers `--version`: `$LLVM_PROFDATA`, then
    /// the configured tool, then the configured candidates.
    pub fn locate(settings: &MergeSettings) -> Result<Self, MergeError> {
        let candidates: Vec<String> = std::env::var("LLVM_PROFDATA")
            .ok()
            .into_iter()
            .chain(settings.tool.clone())
            .chain(settings.candidates.iter().cloned())
            .filter(|c| !c.is_empty())
            .collect();

        for candidate in &candidates {
            let answered = Command::new(candidate)
                .arg("--version")
                .output()
                .is_ok_and(|out| out.status.success());
            if answered {
                debug!(tool = %candidate, "Located merge tool");
                return Ok(Self::with_tool(candidate.clone()));
            }
        }
        Err(MergeError::ToolNotFound(candidates))
    }
}

impl ProfileMerger for LlvmProfdataMerger {
    fn name(&self) -> &str {
        &self.tool
    }

    fn merge(&self, records: &[PathBuf], output: &Path) -> Result<(), MergeError> {
        info!(records = records.len(), output = %output.display(), "Merging raw profiles");
        let result = Command::new(&self.tool)
            .args(["merge", "--num-threads=0", "-sparse", "--failure-mode=all", "-o"])
            .arg(output)
            .args(records)
            .output()
            .map_err(|source| MergeError::Spawn {
                tool: self.tool.clone(),
                source,
            })?;

        if !result.status.success() {
            return Err(MergeError::Failed {
                status: result.status.to_string(),
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            });
        }
        if !output.is_file() {
            return Err(MergeError::MissingOutput(output.to_path_buf()));
        }
        Ok(())
    }
}

/// Used when no merge tool could be located: tasks still run and every
/// merge attempt reports the failed lookup.
#[derive(Debug, Clone)]
pub struct UnavailableMerger {
    tried: Vec<String>,
}

impl UnavailableMerger {
    pub fn new(tried: Vec<String>) -> Self {
        Self { tried }
    }
}

impl ProfileMerger for UnavailableMerger {
    fn name(&self) -> &str {
        "unavailable"
    }

    fn merge(&self, _records: &[PathBuf], _output: &Path) -> Result<(), MergeError> {
        Err(MergeError::ToolNotFound(self.tried.clone()))
    }
}

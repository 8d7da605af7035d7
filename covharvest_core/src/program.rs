use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

/// A single corpus program: the leaf unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramFile {
    /// Absolute (or caller-rooted) path to the file.
    pub path: PathBuf,
    /// Path relative to the directory discovery started from.
    pub relative: PathBuf,
    pub modified: SystemTime,
}

impl ProgramFile {
    /// Seconds since the Unix epoch, with sub-second precision.
    pub fn modified_secs(&self) -> f64 {
        self.modified
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

/// Returns true for files with the given bare extension. Compiled bytecode
/// siblings (`.pyc` next to `.py`) never match because the extension is
/// compared exactly.
pub fn has_program_extension(path: &Path, extension: &str) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(extension)
}

/// Recursively discovers program files under `root`, sorted by full path so
/// that repeated runs see the same order.
pub fn discover_programs(root: &Path, extension: &str) -> io::Result<Vec<ProgramFile>> {
    let mut programs = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() || !has_program_extension(entry.path(), extension) {
            continue;
        }
        let modified = entry.metadata().map_err(io::Error::from)?.modified()?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_path_buf();
        programs.push(ProgramFile {
            path: entry.path().to_path_buf(),
            relative,
            modified,
        });
    }
    programs.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(programs)
}

/// Lists the immediate child directories of `dir`, sorted by name.
pub fn child_directories(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut children = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            children.push(entry.path());
        }
    }
    children.sort();
    Ok(children)
}

use crate::config::ConfigurationError;
use crate::program::{ProgramFile, child_directories, discover_programs};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Subdirectory that receives program files sitting directly at the corpus
/// root, so that every bucket's content lives in executable subdirectories.
pub const ROOT_GROUP_DIR: &str = "_root";

/// The `start-end` label of a time-interval bucket.
///
/// Both bounds are seconds relative to the corpus origin (or an externally
/// supplied labelling for pre-bucketed corpora). Labels order by `start`
/// first, then `end`, which is the order buckets are processed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BucketLabel {
    pub start: u64,
    pub end: u64,
}

impl BucketLabel {
    /// Label of the `index`-th bucket for a given interval width.
    pub fn for_index(index: u64, interval_secs: u64) -> Self {
        let start = index * interval_secs;
        Self {
            start,
            end: start + interval_secs,
        }
    }
}

impl fmt::Display for BucketLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Error returned when a directory name is not a bucket label.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("'{0}' is not a bucket label (expected '<start>-<end>' with start < end)")]
pub struct InvalidBucketLabel(pub String);

impl FromStr for BucketLabel {
    type Err = InvalidBucketLabel;

    /// Accepts exactly two runs of ASCII digits joined by a single dash, with
    /// the first value strictly smaller than the second.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidBucketLabel(s.to_string());
        let (start, end) = s.split_once('-').ok_or_else(invalid)?;
        let all_digits = |part: &str| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit());
        if !all_digits(start) || !all_digits(end) {
            return Err(invalid());
        }
        let start: u64 = start.parse().map_err(|_| invalid())?;
        let end: u64 = end.parse().map_err(|_| invalid())?;
        if start >= end {
            return Err(invalid());
        }
        Ok(Self { start, end })
    }
}

impl TryFrom<String> for BucketLabel {
    type Error = InvalidBucketLabel;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BucketLabel> for String {
    fn from(label: BucketLabel) -> Self {
        label.to_string()
    }
}

/// A named, ordered work unit: one directory of subdirectories to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    pub label: BucketLabel,
    /// Host directory holding the bucket's subdirectories.
    pub path: PathBuf,
    /// Program files owned by this bucket, relative to `path`, sorted.
    pub files: Vec<PathBuf>,
}

/// Outcome of classifying a corpus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    /// Buckets in ascending label order.
    pub buckets: Vec<Bucket>,
    /// `true` when the corpus was already partitioned and nothing was copied.
    pub pre_bucketed: bool,
    /// Directory the bucket paths live under: the corpus itself when
    /// pre-bucketed, otherwise the materialised output tree.
    pub root: PathBuf,
}

impl Classification {
    pub fn total_files(&self) -> usize {
        self.buckets.iter().map(|b| b.files.len()).sum()
    }
}

/// Parameters for [`classify`].
#[derive(Debug, Clone)]
pub struct ClassifyOptions {
    /// Width of one bucket in seconds. Must be positive.
    pub interval_secs: u64,
    /// Regular expression searched in each file's corpus-relative path.
    /// Files that do not match are excluded entirely.
    pub filter: Option<String>,
    /// Bare program file extension, e.g. `py`.
    pub extension: String,
    /// Directory buckets are materialised into (`<output>/<baseline>`).
    pub output_dir: PathBuf,
}

/// Partitions `corpus` into time-interval buckets.
///
/// If any immediate child of `corpus` is named like a bucket label, the corpus
/// is treated as pre-bucketed and each such child is returned verbatim.
/// Otherwise each eligible program is assigned to bucket
/// `floor((mtime - min_mtime) / interval)` and copied into
/// `output_dir/<start>-<end>/<relative path>`. The corpus is never modified.
///
/// # Errors
/// Returns [`ConfigurationError`] when the corpus does not exist, the interval
/// is zero, the filter does not compile, no eligible program is found, or
/// copying into the output tree fails.
pub fn classify(
    corpus: &Path,
    options: &ClassifyOptions,
) -> Result<Classification, ConfigurationError> {
    if !corpus.is_dir() {
        return Err(ConfigurationError::TargetMissing(corpus.to_path_buf()));
    }
    if options.interval_secs == 0 {
        return Err(ConfigurationError::InvalidInterval(0));
    }
    let filter = compile_filter(options.filter.as_deref())?;

    if let Some(buckets) = detect_pre_bucketed(corpus, &options.extension)? {
        let classification = Classification {
            buckets,
            pre_bucketed: true,
            root: corpus.to_path_buf(),
        };
        if classification.total_files() == 0 {
            return Err(ConfigurationError::EmptyCorpus(corpus.to_path_buf()));
        }
        if let Some(pattern) = &options.filter {
            warn!(filter = %pattern, "Filter has no effect on an already bucketed corpus");
        }
        info!(
            corpus = %corpus.display(),
            buckets = classification.buckets.len(),
            files = classification.total_files(),
            "Corpus is already bucketed; using existing buckets"
        );
        return Ok(classification);
    }

    let programs: Vec<ProgramFile> = discover_programs(corpus, &options.extension)
        .map_err(|source| ConfigurationError::Io {
            path: corpus.to_path_buf(),
            source,
        })?
        .into_iter()
        .filter(|program| {
            filter
                .as_ref()
                .is_none_or(|re| re.is_match(&relative_key(&program.relative)))
        })
        .collect();

    if programs.is_empty() {
        return Err(ConfigurationError::EmptyCorpus(corpus.to_path_buf()));
    }

    let assignments = assign_buckets(&programs, options.interval_secs);
    let buckets = materialize(corpus, &options.output_dir, &assignments)?;

    info!(
        files = programs.len(),
        buckets = buckets.len(),
        output = %options.output_dir.display(),
        "Classified and copied program files into buckets"
    );

    Ok(Classification {
        buckets,
        pre_bucketed: false,
        root: options.output_dir.clone(),
    })
}

/// Groups programs by bucket label without touching the filesystem.
///
/// The origin is the earliest modification time among `programs`; the offset
/// is truncated to whole seconds before the interval division.
pub fn assign_buckets(
    programs: &[ProgramFile],
    interval_secs: u64,
) -> BTreeMap<BucketLabel, Vec<&ProgramFile>> {
    let mut assignments: BTreeMap<BucketLabel, Vec<&ProgramFile>> = BTreeMap::new();
    let Some(min_mtime) = programs
        .iter()
        .map(ProgramFile::modified_secs)
        .min_by(f64::total_cmp)
    else {
        return assignments;
    };
    debug!(min_mtime, interval_secs, "Bucketing relative to earliest mtime");

    for program in programs {
        let offset = (program.modified_secs() - min_mtime).max(0.0) as u64;
        let label = BucketLabel::for_index(offset / interval_secs, interval_secs);
        assignments.entry(label).or_default().push(program);
    }
    assignments
}

fn compile_filter(pattern: Option<&str>) -> Result<Option<Regex>, ConfigurationError> {
    pattern
        .map(|p| {
            Regex::new(p).map_err(|source| ConfigurationError::InvalidFilter {
                pattern: p.to_string(),
                source,
            })
        })
        .transpose()
}

/// Relative paths are matched with `/` separators regardless of platform.
fn relative_key(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn detect_pre_bucketed(
    corpus: &Path,
    extension: &str,
) -> Result<Option<Vec<Bucket>>, ConfigurationError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| ConfigurationError::Io { path, source }
    };

    let mut buckets = Vec::new();
    for child in child_directories(corpus).map_err(io_err(corpus))? {
        let Some(name) = child.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        match name.parse::<BucketLabel>() {
            Ok(label) => {
                let files = discover_programs(&child, extension)
                    .map_err(io_err(&child))?
                    .into_iter()
                    .map(|p| p.relative)
                    .collect();
                buckets.push(Bucket {
                    label,
                    path: child,
                    files,
                });
            }
            Err(_) => debug!(child = name, "Not a bucket label"),
        }
    }

    if buckets.is_empty() {
        return Ok(None);
    }
    let ignored = child_directories(corpus)
        .map_err(io_err(corpus))?
        .len()
        .saturating_sub(buckets.len());
    if ignored > 0 {
        warn!(ignored, "Ignoring corpus directories that are not bucket labels");
    }
    buckets.sort_by_key(|b| b.label);
    Ok(Some(buckets))
}

fn materialize(
    corpus: &Path,
    output_dir: &Path,
    assignments: &BTreeMap<BucketLabel, Vec<&ProgramFile>>,
) -> Result<Vec<Bucket>, ConfigurationError> {
    let mut buckets = Vec::with_capacity(assignments.len());
    for (label, programs) in assignments {
        let bucket_path = output_dir.join(label.to_string());
        clear_bucket_dir(&bucket_path)?;
        let mut taken = HashSet::with_capacity(programs.len());
        let mut files = Vec::with_capacity(programs.len());

        for program in programs {
            let relative = if program.relative.parent().is_some_and(|p| p != Path::new("")) {
                program.relative.clone()
            } else {
                Path::new(ROOT_GROUP_DIR).join(&program.relative)
            };
            let relative = unique_destination(&relative, &taken);
            taken.insert(relative.clone());

            let dest = bucket_path.join(&relative);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(|source| ConfigurationError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
            fs::copy(&program.path, &dest).map_err(|source| ConfigurationError::Io {
                path: corpus.join(&program.relative),
                source,
            })?;
            files.push(relative);
        }

        files.sort();
        buckets.push(Bucket {
            label: *label,
            path: bucket_path,
            files,
        });
    }
    Ok(buckets)
}

/// Removes what an earlier classification left in a bucket directory.
fn clear_bucket_dir(bucket_path: &Path) -> Result<(), ConfigurationError> {
    match fs::remove_dir_all(bucket_path) {
        Ok(()) => {
            debug!(bucket = %bucket_path.display(), "Replaced previous bucket contents");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(ConfigurationError::Io {
            path: bucket_path.to_path_buf(),
            source,
        }),
    }
}

/// Appends `__N` before the extension until the path is not in `taken`.
fn unique_destination(relative: &Path, taken: &HashSet<PathBuf>) -> PathBuf {
    if !taken.contains(relative) {
        return relative.to_path_buf();
    }
    let stem = relative
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = relative.extension().map(|e| e.to_string_lossy().into_owned());
    (1..)
        .map(|i| {
            let name = match &extension {
                Some(ext) => format!("{stem}__{i}.{ext}"),
                None => format!("{stem}__{i}"),
            };
            relative.with_file_name(name)
        })
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or_else(|| relative.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, SystemTime};
    use tempfile::{TempDir, tempdir};

    const BASE: u64 = 1_700_000_000;

    fn write_program(root: &Path, relative: &str, mtime_offset: u64) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, format!("# {relative}\n")).unwrap();
        let file = File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(BASE + mtime_offset))
            .unwrap();
    }

    fn options(out: &TempDir, interval_secs: u64) -> ClassifyOptions {
        ClassifyOptions {
            interval_secs,
            filter: None,
            extension: "py".to_string(),
            output_dir: out.path().join("acetest"),
        }
    }

    fn labels(classification: &Classification) -> Vec<String> {
        classification
            .buckets
            .iter()
            .map(|b| b.label.to_string())
            .collect()
    }

    #[test]
    fn bucket_label_parsing() {
        assert_eq!(
            "0-60".parse::<BucketLabel>(),
            Ok(BucketLabel { start: 0, end: 60 })
        );
        assert_eq!(
            "120-180".parse::<BucketLabel>().unwrap().to_string(),
            "120-180"
        );
        for bad in ["60-60", "60-0", "a-60", "-60", "0-", "0--60", "0-60-120", "+1-5", ""] {
            assert!(bad.parse::<BucketLabel>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn two_files_one_interval_apart_land_in_two_buckets() {
        let corpus = tempdir().unwrap();
        let out = tempdir().unwrap();
        write_program(corpus.path(), "api_a/first.py", 5);
        write_program(corpus.path(), "api_b/second.py", 65);

        let classification = classify(corpus.path(), &options(&out, 60)).unwrap();

        assert!(!classification.pre_bucketed);
        assert_eq!(labels(&classification), vec!["0-60", "60-120"]);
        assert_eq!(
            classification.buckets[0].files,
            vec![PathBuf::from("api_a/first.py")]
        );
        assert!(out.path().join("acetest/0-60/api_a/first.py").is_file());
        assert!(out.path().join("acetest/60-120/api_b/second.py").is_file());
        // Copied, not moved.
        assert!(corpus.path().join("api_a/first.py").is_file());
    }

    #[test]
    fn pre_bucketed_corpus_is_returned_verbatim_without_copying() {
        let corpus = tempdir().unwrap();
        let out = tempdir().unwrap();
        write_program(corpus.path(), "60-120/sub/b.py", 0);
        write_program(corpus.path(), "0-60/sub/a.py", 0);

        let classification = classify(corpus.path(), &options(&out, 60)).unwrap();

        assert!(classification.pre_bucketed);
        assert_eq!(labels(&classification), vec!["0-60", "60-120"]);
        assert_eq!(classification.buckets[0].path, corpus.path().join("0-60"));
        assert_eq!(fs::read_dir(out.path()).unwrap().count(), 0);
    }

    #[test]
    fn filter_on_pre_bucketed_corpus_is_reported_and_ignored() {
        #[derive(Clone, Default)]
        struct CapturedLogs(Arc<Mutex<Vec<u8>>>);
        impl io::Write for CapturedLogs {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let corpus = tempdir().unwrap();
        let out = tempdir().unwrap();
        write_program(corpus.path(), "0-60/conv/a.py", 0);
        write_program(corpus.path(), "0-60/matmul/b.py", 0);
        let mut opts = options(&out, 60);
        opts.filter = Some("^conv".to_string());

        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let classification =
            tracing::subscriber::with_default(subscriber, || classify(corpus.path(), &opts))
                .unwrap();

        assert!(classification.pre_bucketed);
        assert_eq!(classification.total_files(), 2);
        let logged = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(logged.contains("Filter has no effect"), "logs: {logged}");
    }

    #[test]
    fn pre_bucketed_order_is_numeric_not_lexicographic() {
        let corpus = tempdir().unwrap();
        let out = tempdir().unwrap();
        write_program(corpus.path(), "120-180/s/c.py", 0);
        write_program(corpus.path(), "60-120/s/b.py", 0);
        write_program(corpus.path(), "0-60/s/a.py", 0);

        let classification = classify(corpus.path(), &options(&out, 60)).unwrap();
        assert_eq!(labels(&classification), vec!["0-60", "60-120", "120-180"]);
    }

    #[test]
    fn root_level_files_are_grouped_under_root_dir() {
        let corpus = tempdir().unwrap();
        let out = tempdir().unwrap();
        write_program(corpus.path(), "loose.py", 0);

        let classification = classify(corpus.path(), &options(&out, 60)).unwrap();
        assert_eq!(
            classification.buckets[0].files,
            vec![PathBuf::from("_root/loose.py")]
        );
    }

    #[test]
    fn filter_excludes_non_matching_files() {
        let corpus = tempdir().unwrap();
        let out = tempdir().unwrap();
        write_program(corpus.path(), "conv2d/a.py", 0);
        write_program(corpus.path(), "matmul/b.py", 10);

        let mut opts = options(&out, 60);
        opts.filter = Some("^conv".to_string());
        let classification = classify(corpus.path(), &opts).unwrap();

        assert_eq!(classification.total_files(), 1);
        assert!(!out.path().join("acetest/0-60/matmul").exists());
    }

    #[test]
    fn configuration_errors() {
        let out = tempdir().unwrap();
        let missing = out.path().join("does-not-exist");
        assert!(matches!(
            classify(&missing, &options(&out, 60)),
            Err(ConfigurationError::TargetMissing(_))
        ));

        let empty = tempdir().unwrap();
        fs::write(empty.path().join("readme.md"), "").unwrap();
        assert!(matches!(
            classify(empty.path(), &options(&out, 60)),
            Err(ConfigurationError::EmptyCorpus(_))
        ));

        let corpus = tempdir().unwrap();
        write_program(corpus.path(), "x/a.py", 0);
        let mut opts = options(&out, 60);
        opts.filter = Some("(unclosed".to_string());
        assert!(matches!(
            classify(corpus.path(), &opts),
            Err(ConfigurationError::InvalidFilter { .. })
        ));

        let mut opts = options(&out, 60);
        opts.filter = Some("^nothing-matches$".to_string());
        assert!(matches!(
            classify(corpus.path(), &opts),
            Err(ConfigurationError::EmptyCorpus(_))
        ));

        assert!(matches!(
            classify(corpus.path(), &options(&out, 0)),
            Err(ConfigurationError::InvalidInterval(0))
        ));
    }

    #[test]
    fn partition_is_total_and_exclusive() {
        let corpus = tempdir().unwrap();
        let out = tempdir().unwrap();
        let offsets = [0, 3, 59, 60, 61, 119, 240, 241, 1000];
        for (i, offset) in offsets.iter().enumerate() {
            write_program(corpus.path(), &format!("g{}/p{i}.py", i % 3), *offset);
        }

        let classification = classify(corpus.path(), &options(&out, 60)).unwrap();

        let mut seen = HashSet::new();
        for bucket in &classification.buckets {
            for file in &bucket.files {
                let name = file.file_name().unwrap().to_owned();
                assert!(seen.insert(name), "{file:?} assigned twice");
            }
        }
        assert_eq!(seen.len(), offsets.len());
    }

    #[test]
    fn classification_is_idempotent() {
        let corpus = tempdir().unwrap();
        write_program(corpus.path(), "a/one.py", 0);
        write_program(corpus.path(), "a/two.py", 70);
        write_program(corpus.path(), "b/three.py", 130);

        let first_out = tempdir().unwrap();
        let second_out = tempdir().unwrap();
        let first = classify(corpus.path(), &options(&first_out, 60)).unwrap();
        let second = classify(corpus.path(), &options(&second_out, 60)).unwrap();

        assert_eq!(labels(&first), labels(&second));
        let members = |c: &Classification| -> Vec<Vec<PathBuf>> {
            c.buckets.iter().map(|b| b.files.clone()).collect()
        };
        assert_eq!(members(&first), members(&second));
    }

    #[test]
    fn doubling_the_interval_never_adds_buckets() {
        let programs: Vec<ProgramFile> = [0u64, 7, 29, 31, 64, 65, 200, 203, 999]
            .iter()
            .enumerate()
            .map(|(i, offset)| ProgramFile {
                path: PathBuf::from(format!("/c/p{i}.py")),
                relative: PathBuf::from(format!("p{i}.py")),
                modified: SystemTime::UNIX_EPOCH + Duration::from_secs(BASE + offset),
            })
            .collect();

        let mut previous = usize::MAX;
        for interval in [1, 2, 4, 8, 16, 32, 64, 128, 256, 512, 1024] {
            let count = assign_buckets(&programs, interval).len();
            assert!(count <= previous, "interval {interval} produced {count} > {previous}");
            previous = count;
        }
        assert_eq!(previous, 1);
    }

    #[test]
    fn reclassifying_into_the_same_output_replaces_buckets() {
        let corpus = tempdir().unwrap();
        let out = tempdir().unwrap();
        write_program(corpus.path(), "api/a.py", 0);
        write_program(corpus.path(), "api/b.py", 70);

        let first = classify(corpus.path(), &options(&out, 60)).unwrap();
        // A file left over from an older corpus must not survive either.
        fs::write(out.path().join("acetest/0-60/api/stale.py"), "").unwrap();
        let second = classify(corpus.path(), &options(&out, 60)).unwrap();

        assert_eq!(first, second);
        assert_eq!(second.buckets[0].files, vec![PathBuf::from("api/a.py")]);
        let on_disk: Vec<String> = fs::read_dir(out.path().join("acetest/0-60/api"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(on_disk, vec!["a.py"]);
    }

    #[test]
    fn root_file_colliding_with_root_group_dir_gets_numeric_suffix() {
        let corpus = tempdir().unwrap();
        let out = tempdir().unwrap();
        write_program(corpus.path(), "_root/a.py", 0);
        write_program(corpus.path(), "a.py", 1);

        let classification = classify(corpus.path(), &options(&out, 60)).unwrap();

        assert_eq!(
            classification.buckets[0].files,
            vec![PathBuf::from("_root/a.py"), PathBuf::from("_root/a__1.py")]
        );
        assert!(out.path().join("acetest/0-60/_root/a__1.py").is_file());
    }

    #[test]
    fn colliding_destinations_get_numeric_suffix() {
        let dest = PathBuf::from("sub/a.py");
        let mut taken = HashSet::new();
        assert_eq!(unique_destination(&dest, &taken), dest);
        taken.insert(dest.clone());
        assert_eq!(unique_destination(&dest, &taken), PathBuf::from("sub/a__1.py"));
        taken.insert(PathBuf::from("sub/a__1.py"));
        assert_eq!(unique_destination(&dest, &taken), PathBuf::from("sub/a__2.py"));
    }
}

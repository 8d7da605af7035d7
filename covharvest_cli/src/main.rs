use covharvest_core::config::{EnvironmentKind, HarvestConfig, Library};
use covharvest_core::corpus::{BucketLabel, classify};
use covharvest_core::coverage::{
    CoverageSink, LlvmProfdataMerger, MergeError, ProfileMerger, UnavailableMerger,
};
use covharvest_core::driver::{BucketStatus, DriverSettings, TaskCommand, WorkUnitDriver};
use covharvest_core::environment::EnvironmentFault;
use covharvest_core::executor::{ScriptExecutor, runtime_from_settings};
use covharvest_core::observability::{LogFormat, init_logging};
use covharvest_core::{ConfigurationError, HarvestError};

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_FILE: &str = "covharvest.toml";

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file; defaults to ./covharvest.toml when present.
    #[clap(short, long, value_parser, global = true)]
    config: Option<PathBuf>,
    #[clap(long, global = true, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Partition the corpus and collect coverage for every bucket.
    Collect(CollectArgs),
    /// Only partition the corpus and list the resulting buckets.
    Classify(ClassifyArgs),
    /// Run every subdirectory of one bucket and merge their coverage.
    Drive(DriveArgs),
    /// Execute every program of one subdirectory.
    Exec(ExecArgs),
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LibraryArg {
    Torch,
    Tf,
}

impl From<LibraryArg> for Library {
    fn from(arg: LibraryArg) -> Self {
        match arg {
            LibraryArg::Torch => Library::Torch,
            LibraryArg::Tf => Library::Tf,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum EnvironmentArg {
    Docker,
    Local,
}

impl From<EnvironmentArg> for EnvironmentKind {
    fn from(arg: EnvironmentArg) -> Self {
        match arg {
            EnvironmentArg::Docker => EnvironmentKind::Docker,
            EnvironmentArg::Local => EnvironmentKind::Local,
        }
    }
}

#[derive(Args, Debug)]
struct CorpusArgs {
    /// Corpus directory, or a directory of `<start>-<end>` buckets.
    #[clap(long)]
    target: Option<PathBuf>,
    #[clap(short, long)]
    output: Option<PathBuf>,
    #[clap(long)]
    baseline: Option<String>,
    /// Bucket width in seconds.
    #[clap(long)]
    interval: Option<u64>,
    /// Only programs whose corpus-relative path matches this regex.
    #[clap(long)]
    filter: Option<String>,
}

impl CorpusArgs {
    fn apply(&self, config: &mut HarvestConfig) {
        if let Some(target) = &self.target {
            config.run.target = Some(target.clone());
        }
        if let Some(output) = &self.output {
            config.run.output = output.clone();
        }
        if let Some(baseline) = &self.baseline {
            config.run.baseline = baseline.clone();
        }
        if let Some(interval) = self.interval {
            config.run.interval_secs = interval;
        }
        if let Some(filter) = &self.filter {
            config.run.filter = Some(filter.clone());
        }
    }
}

#[derive(Args, Debug)]
struct TaskArgs {
    /// Maximum number of subdirectories executed at once.
    #[clap(long)]
    parallelism: Option<usize>,
    /// Per-subdirectory timeout in seconds.
    #[clap(long)]
    task_timeout: Option<u64>,
}

impl TaskArgs {
    fn apply(&self, config: &mut HarvestConfig) {
        if let Some(parallelism) = self.parallelism {
            config.run.parallelism = parallelism;
        }
        if let Some(task_timeout) = self.task_timeout {
            config.run.task_timeout_secs = task_timeout;
        }
    }
}

#[derive(Args, Debug)]
struct CollectArgs {
    #[clap(flatten)]
    corpus: CorpusArgs,
    #[clap(flatten)]
    tasks: TaskArgs,
    #[clap(long, value_enum)]
    library: Option<LibraryArg>,
    /// Version of the instrumented library build.
    #[clap(long = "version")]
    library_version: Option<String>,
    #[clap(long, value_enum)]
    environment: Option<EnvironmentArg>,
}

#[derive(Args, Debug)]
struct ClassifyArgs {
    #[clap(flatten)]
    corpus: CorpusArgs,
}

#[derive(Args, Debug)]
struct DriveArgs {
    /// Bucket directory whose subdirectories are the tasks.
    #[clap(long)]
    input: PathBuf,
    /// Directory receiving the merged artifact, log and result.
    #[clap(long)]
    output: PathBuf,
    #[clap(long)]
    label: BucketLabel,
    #[clap(flatten)]
    tasks: TaskArgs,
    /// Command run per subdirectory, `{dir}` is replaced by its path.
    /// Defaults to this binary's `exec` subcommand.
    #[clap(last = true)]
    task_command: Vec<String>,
}

#[derive(Args, Debug)]
struct ExecArgs {
    /// Directory whose programs are executed.
    #[clap(long)]
    dir: PathBuf,
    /// Raw record destination; defaults to $COVHARVEST_RAW_PROFILE.
    #[clap(long)]
    record: Option<PathBuf>,
}

fn load_config(path: Option<&Path>) -> Result<HarvestConfig, ConfigurationError> {
    match path {
        Some(config_path) => {
            info!("Loading configuration from {config_path:?}");
            HarvestConfig::load_from_file(config_path)
        }
        None => {
            let default_config_path = PathBuf::from(DEFAULT_CONFIG_FILE);
            if default_config_path.exists() {
                info!("No config file specified, loading default: {default_config_path:?}");
                HarvestConfig::load_from_file(&default_config_path)
            } else {
                info!("No config file specified and '{DEFAULT_CONFIG_FILE}' not found, using built-in defaults");
                Ok(HarvestConfig::default())
            }
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn exit_code_for(e: &anyhow::Error) -> u8 {
    if let Some(harvest) = e.downcast_ref::<HarvestError>() {
        return harvest.exit_code() as u8;
    }
    if e.downcast_ref::<ConfigurationError>().is_some() {
        return 2;
    }
    if e.downcast_ref::<EnvironmentFault>().is_some() {
        return 3;
    }
    1
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Collect(args) => {
            args.corpus.apply(&mut config);
            args.tasks.apply(&mut config);
            if let Some(library) = args.library {
                config.run.library = Some(library.into());
            }
            if let Some(version) = args.library_version {
                config.run.version = Some(version);
            }
            if let Some(environment) = args.environment {
                config.environment.kind = environment.into();
            }
            collect(&config)
        }
        Command::Classify(args) => {
            args.corpus.apply(&mut config);
            list_buckets(&config)
        }
        Command::Drive(args) => {
            args.tasks.apply(&mut config);
            drive(&config, cli.config.as_deref(), args)
        }
        Command::Exec(args) => exec(&config, args),
    }
}

fn collect(config: &HarvestConfig) -> anyhow::Result<()> {
    let harvest_binary = match &config.environment.harvest_binary {
        Some(path) => path.clone(),
        None => std::env::current_exe().context("Failed to locate the covharvest binary")?,
    };
    let report = covharvest_core::collect(config, harvest_binary)?;

    for bucket in &report.buckets {
        match &bucket.status {
            BucketStatus::Completed => println!(
                "{}: {}/{} subdirectories succeeded, {} timed out, {} crashed, artifact: {}",
                bucket.label,
                bucket.succeeded,
                bucket.tasks,
                bucket.timed_out,
                bucket.crashed,
                bucket
                    .artifact
                    .as_ref()
                    .map_or("none".to_string(), |a| a.display().to_string())
            ),
            BucketStatus::DriverFailed { reason } => {
                println!("{}: driver failed: {reason}", bucket.label)
            }
        }
    }
    println!(
        "Collected {} of {} buckets into {:?}",
        report.completed(),
        report.buckets.len(),
        config.run.output.join("profdata").join(&config.run.baseline)
    );
    Ok(())
}

fn list_buckets(config: &HarvestConfig) -> anyhow::Result<()> {
    config.validate()?;
    let target = config
        .run
        .target
        .as_deref()
        .ok_or(ConfigurationError::Missing("target"))?;
    let classification = classify(target, &config.classify_options())?;

    for bucket in &classification.buckets {
        println!("{}\t{}\t{}", bucket.label, bucket.files.len(), bucket.path.display());
    }
    println!(
        "{} files in {} buckets{}",
        classification.total_files(),
        classification.buckets.len(),
        if classification.pre_bucketed { " (pre-bucketed)" } else { "" }
    );
    Ok(())
}

fn drive(config: &HarvestConfig, config_path: Option<&Path>, args: DriveArgs) -> anyhow::Result<()> {
    config.validate()?;
    let task_command = if args.task_command.is_empty() {
        let exe = std::env::current_exe().context("Failed to locate the covharvest binary")?;
        TaskCommand::script_executor(&exe, config_path)
    } else {
        TaskCommand::new(args.task_command)?
    };

    let merger: Arc<dyn ProfileMerger> = match LlvmProfdataMerger::locate(&config.merge) {
        Ok(merger) => Arc::new(merger),
        Err(MergeError::ToolNotFound(tried)) => {
            warn!("No merge tool available, buckets will not be merged (tried: {tried:?})");
            Arc::new(UnavailableMerger::new(tried))
        }
        Err(e) => return Err(e.into()),
    };

    let driver = WorkUnitDriver::new(DriverSettings::from_config(config, task_command), merger);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;
    let result = runtime.block_on(driver.run_bucket(&args.input, &args.output, args.label))?;

    println!(
        "[driver] {}: {} tasks, {} succeeded, {} timed out, {} crashed, {} records merged",
        result.label,
        result.tasks,
        result.succeeded,
        result.timed_out,
        result.crashed,
        result.records_merged
    );
    Ok(())
}

fn exec(config: &HarvestConfig, args: ExecArgs) -> anyhow::Result<()> {
    let sink = match args.record {
        Some(record) => CoverageSink::new(record),
        None => CoverageSink::from_env().ok_or_else(|| {
            anyhow::anyhow!("No raw record destination: pass --record or set COVHARVEST_RAW_PROFILE")
        })?,
    };

    let runtime = runtime_from_settings(&config.executor)?;
    let mut executor = ScriptExecutor::new(runtime, config.executor.extension.clone());
    let summary = executor.run_directory(&args.dir, sink)?;
    println!("{summary}");
    Ok(())
}

pub mod config;
pub mod corpus;
pub mod coverage;
pub mod driver;
pub mod environment;
pub mod executor;
pub mod lifecycle;
pub mod observability;
mod process_group;
pub mod program;
pub mod run;
pub mod session;

pub use config::{ConfigurationError, HarvestConfig};
pub use corpus::{Bucket, BucketLabel, Classification, ClassifyOptions, classify};
pub use coverage::{CoverageSink, LlvmProfdataMerger, MergeError, ProfileMerger, UnavailableMerger};
pub use driver::{BucketResult, BucketStatus, DriverError, DriverSettings, TaskCommand, WorkUnitDriver};
pub use environment::{DockerEnvironment, Environment, EnvironmentFault, LocalEnvironment};
pub use executor::{
    ExecutionSummary, InProcessRuntime, InterpreterRuntime, ProgramFailure, ProgramOutcome,
    ScriptExecutor, ScriptRuntime, runtime_from_settings,
};
pub use lifecycle::{LifecycleManager, LifecycleSettings, RunReport};
pub use run::{HarvestError, collect};
pub use session::{SessionConfig, SessionRuntime};

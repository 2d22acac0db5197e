//! AppBridge Core Library
//!
//! Prepares a packaged desktop application built for another platform and
//! launches it, either on the host or inside the POSIX shell embedded in it.

pub mod artifact;
pub mod bridge;
pub mod commands;
pub mod config;
pub mod error;
pub mod manifest;
pub mod metadata;
pub mod patches;
pub mod pipeline;
pub mod preflight;
pub mod runtime;
pub mod telemetry;
pub mod workspace;

pub use artifact::{ArtifactRequest, DownloadInfo, DownloadMode, ResolvedArtifact};

pub use bridge::{
    quote_command, shell_quote, to_secondary_path, CommandOutput, ExecOptions, ExecutionSurface,
    HostSurface, SecondarySurface,
};

pub use commands::{
    clean, kill, launch, locate_latest_manifest, prepare, run, CleanOptions, CleanReport,
    Invocation, KillReport, LaunchOptions, LaunchReport, PrepareReport, RunOptions, RunReport,
    Session,
};

pub use config::{load_config, BridgeConfig, ConfigOverrides, NativeBuildStrategy};
pub use error::{BridgeError, PipelineExecutionError, Result};

pub use manifest::{
    read_latest, write_manifest, LaunchManifest, Located, ManifestKind, PrepareManifest,
    RuntimeContext, LAUNCH_PREFIX, PREPARE_PREFIX,
};

pub use metadata::{read_app_metadata, AppMetadata};
pub use patches::{PatchRecipe, PatchRegistry, PatchResult};

pub use pipeline::{
    prepare_stage_names, prepare_stages, run_pipeline, PipelineContext, PipelineState,
    PrepareOptions, Stage, StageDescriptor, StageOutput, StageResult,
};

pub use preflight::PreflightReport;

pub use runtime::{
    resolve_runtime, run_with_fallback, runtime_workdir, FallbackPolicy, Prompter,
    RuntimeOptions, RuntimeOverrides, Surface, TerminalPrompter,
};

pub use telemetry::{init_tracing, RunSpan};
pub use workspace::{hash_artifact, reuse_eligible, WorkPaths};

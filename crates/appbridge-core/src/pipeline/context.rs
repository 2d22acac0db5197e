//! Mutable state owned by one prepare run.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;

use super::{PipelineState, StageResult};
use crate::artifact::{ArtifactRequest, ResolvedArtifact};
use crate::bridge::ExecutionSurface;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::metadata::AppMetadata;
use crate::patches::PatchResult;
use crate::runtime::RuntimeOptions;
use crate::workspace::WorkPaths;

/// Per-run prepare options.
#[derive(Debug, Clone, Default)]
pub struct PrepareOptions {
    pub artifact: ArtifactRequest,
    /// Skip extraction and unpacking when a completed tree already exists.
    pub reuse: bool,
}

/// External tools resolved during the run.
#[derive(Debug, Clone, Default)]
pub struct ResolvedTools {
    pub archiver: Option<String>,
}

/// Accumulator threaded through every prepare stage. Never shared between runs.
pub struct PipelineContext {
    pub config: BridgeConfig,
    pub options: PrepareOptions,
    pub runtime: RuntimeOptions,
    pub surface: Arc<dyn ExecutionSurface>,
    /// Invocation directory on the host.
    pub cwd: PathBuf,
    /// Host working root for this surface; logs and manifests live here.
    pub host_workdir: PathBuf,
    /// Working root in the surface's namespace.
    pub surface_workdir: PathBuf,
    pub tools: ResolvedTools,
    pub artifact: Option<ResolvedArtifact>,
    pub content_hash: Option<String>,
    pub arch: Option<String>,
    pub paths: Option<WorkPaths>,
    pub metadata: Option<AppMetadata>,
    pub staged_archive: Option<PathBuf>,
    pub staged_unpacked: Option<PathBuf>,
    pub patch_results: Vec<PatchResult>,
    pub stage_outputs: BTreeMap<String, Value>,
    pub reuse_hit: bool,
    pub warnings: Vec<String>,
}

impl PipelineContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: BridgeConfig,
        options: PrepareOptions,
        runtime: RuntimeOptions,
        surface: Arc<dyn ExecutionSurface>,
        cwd: PathBuf,
        host_workdir: PathBuf,
        surface_workdir: PathBuf,
    ) -> Self {
        Self {
            config,
            options,
            runtime,
            surface,
            cwd,
            host_workdir,
            surface_workdir,
            tools: ResolvedTools::default(),
            artifact: None,
            content_hash: None,
            arch: None,
            paths: None,
            metadata: None,
            staged_archive: None,
            staged_unpacked: None,
            patch_results: Vec::new(),
            stage_outputs: BTreeMap::new(),
            reuse_hit: false,
            warnings: Vec::new(),
        }
    }

    pub fn paths(&self) -> Result<&WorkPaths> {
        self.paths.as_ref().ok_or(BridgeError::State("work paths"))
    }

    pub fn arch(&self) -> Result<&str> {
        self.arch.as_deref().ok_or(BridgeError::State("architecture"))
    }

    pub fn content_hash(&self) -> Result<&str> {
        self.content_hash
            .as_deref()
            .ok_or(BridgeError::State("content hash"))
    }

    pub fn metadata(&self) -> Result<&AppMetadata> {
        self.metadata
            .as_ref()
            .ok_or(BridgeError::State("app metadata"))
    }

    pub fn archiver(&self) -> Result<&str> {
        self.tools
            .archiver
            .as_deref()
            .ok_or(BridgeError::State("archiver"))
    }
}

impl PipelineState for PipelineContext {
    fn record_stage(&mut self, result: &StageResult) {
        self.stage_outputs
            .insert(result.stage.clone(), result.outputs.clone());
        self.warnings.extend(result.warnings.iter().cloned());
    }
}

use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, Instrument};

use super::launch::{launch, LaunchOptions, LaunchReport};
use super::{Invocation, Session};
use crate::artifact::DownloadInfo;
use crate::error::{BridgeError, Result};
use crate::manifest::{
    manifest_name, write_manifest, ManifestConfig, ManifestKind, PrepareManifest, RuntimeContext,
    PREPARE_PREFIX,
};
use crate::metadata::AppMetadata;
use crate::pipeline::{prepare_stages, run_pipeline, PipelineContext, PrepareOptions, StageResult};
use crate::runtime::{run_with_fallback, Prompter};
use crate::telemetry::{new_run_id, RunSpan};
use crate::workspace::WorkPaths;

/// What a prepare run produced, beyond the stage records.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareSummary {
    pub run_id: String,
    pub content_hash: String,
    pub paths: WorkPaths,
    pub runtime_context: RuntimeContext,
    pub metadata: AppMetadata,
    pub reuse_hit: bool,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_info: Option<DownloadInfo>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareReport {
    pub ok: bool,
    pub manifest_path: PathBuf,
    pub context: PrepareSummary,
    pub stage_results: Vec<StageResult>,
    pub log_path: Option<PathBuf>,
}

/// Prepare on the resolved surface, honouring the fallback policy.
pub async fn prepare(
    invocation: &Invocation,
    options: &PrepareOptions,
    prompter: &dyn Prompter,
) -> Result<PrepareReport> {
    options.artifact.validate()?;

    run_with_fallback(&invocation.runtime, prompter, move |runtime| async move {
        let session = Session::open(&invocation.config, runtime, false).await?;
        prepare_on(invocation, options, session).await
    })
    .await
}

/// Run the prepare stages on an open session and write the prepare manifest.
pub async fn prepare_on(
    invocation: &Invocation,
    options: &PrepareOptions,
    session: Session,
) -> Result<PrepareReport> {
    let run_id = new_run_id();
    let span = RunSpan::span("prepare", &run_id);

    async move {
        info!(
            surface = %session.runtime.surface,
            workdir = %session.surface_workdir.display(),
            reuse = options.reuse,
            "Starting prepare"
        );

        let mut ctx = PipelineContext::new(
            invocation.config.clone(),
            options.clone(),
            session.runtime.clone(),
            session.surface.clone(),
            invocation.cwd.clone(),
            session.host_workdir.clone(),
            session.surface_workdir.clone(),
        );
        let stage_results = run_pipeline(&prepare_stages(), &mut ctx).await?;

        let paths = ctx.paths()?.clone();
        let content_hash = ctx.content_hash()?.to_string();
        let metadata = ctx.metadata()?.clone();
        let artifact = ctx.artifact.clone().ok_or(BridgeError::State("artifact"))?;
        let runtime_context = RuntimeContext::new(
            &session.runtime,
            Some(session.surface_workdir.to_string_lossy().to_string()),
            ctx.arch.clone(),
        );

        let manifest = PrepareManifest {
            kind: ManifestKind::Prepare,
            generated_at: Utc::now(),
            run_id: run_id.clone(),
            paths: paths.clone(),
            stage_results: stage_results.clone(),
            content_hash: content_hash.clone(),
            runtime_context: runtime_context.clone(),
            download_info: artifact.download.clone(),
            artifact_path: artifact.path.clone(),
            metadata: metadata.clone(),
            log_path: invocation.log_path.clone(),
            config: ManifestConfig {
                workdir: session.surface_workdir.clone(),
                native_build_strategy: invocation.config.native_build.strategy,
            },
        };
        let name = manifest_name(PREPARE_PREFIX, manifest.generated_at, Some(&content_hash));
        let manifest_path = write_manifest(&paths.manifests_dir, &name, &manifest).await?;

        info!(
            manifest = %manifest_path.display(),
            stages = stage_results.len(),
            reuse_hit = ctx.reuse_hit,
            "Prepare complete"
        );

        Ok(PrepareReport {
            ok: true,
            manifest_path,
            context: PrepareSummary {
                run_id: run_id.clone(),
                content_hash,
                paths,
                runtime_context,
                metadata,
                reuse_hit: ctx.reuse_hit,
                warnings: ctx.warnings.clone(),
                download_info: artifact.download,
            },
            stage_results,
            log_path: invocation.log_path.clone(),
        })
    }
    .instrument(span)
    .await
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub prepare: PrepareOptions,
    /// Stop after prepare.
    pub no_launch: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub ok: bool,
    pub prepare_only: bool,
    pub prepare_manifest_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub launch_manifest_path: Option<PathBuf>,
    pub log_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub launch: Option<LaunchReport>,
}

/// Prepare, then launch the freshly written manifest on the surface prepare ended up on.
pub async fn run(invocation: &Invocation, options: &RunOptions, prompter: &dyn Prompter) -> Result<RunReport> {
    let prepared = prepare(invocation, &options.prepare, prompter).await?;

    if options.no_launch {
        return Ok(RunReport {
            ok: true,
            prepare_only: true,
            prepare_manifest_path: prepared.manifest_path,
            launch_manifest_path: None,
            log_path: prepared.log_path,
            launch: None,
        });
    }

    let launch_invocation = Invocation {
        runtime: invocation
            .runtime
            .with_surface(prepared.context.runtime_context.surface),
        ..invocation.clone()
    };
    let launch_options = LaunchOptions {
        prepare_manifest: Some(prepared.manifest_path.clone()),
    };
    let launched = launch(&launch_invocation, &launch_options, prompter).await?;

    Ok(RunReport {
        ok: true,
        prepare_only: false,
        prepare_manifest_path: prepared.manifest_path,
        launch_manifest_path: Some(launched.launch_manifest_path.clone()),
        log_path: launched.log_path.clone(),
        launch: Some(launched),
    })
}

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn, Instrument};

use super::{locate_latest_manifest, Invocation, Session};
use crate::bridge::{ExecOptions, ExecutionSurface, SecondarySurface};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::manifest::{
    manifest_name, read_manifest, write_manifest, LaunchManifest, Located, ManifestKind,
    PrepareManifest, RuntimeContext, LAUNCH_PREFIX, PREPARE_PREFIX,
};
use crate::metadata::AppMetadata;
use crate::runtime::{run_with_fallback, Prompter, Surface};
use crate::telemetry::{new_run_id, RunSpan};

const DEFAULT_BUILD_NUMBER: &str = "510";
const DEFAULT_BUILD_FLAVOR: &str = "prod";
const RUNTIME_SEARCH_DEPTH: usize = 8;

/// Companion CLI locations inside the secondary shell that point back at the host.
const HOST_MOUNT_PREFIX: &str = "/mnt/c/";

#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    /// Prepare manifest to launch; the latest one when unset.
    pub prepare_manifest: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchReport {
    pub ok: bool,
    pub runtime: Surface,
    pub launch_manifest_path: PathBuf,
    pub exit_code: i32,
    pub log_path: Option<PathBuf>,
}

/// Launch a prepared app on the resolved surface, honouring the fallback policy.
pub async fn launch(
    invocation: &Invocation,
    options: &LaunchOptions,
    prompter: &dyn Prompter,
) -> Result<LaunchReport> {
    run_with_fallback(&invocation.runtime, prompter, move |runtime| async move {
        let require_display = runtime.surface == Surface::Secondary;
        let session = Session::open(&invocation.config, runtime, require_display).await?;
        launch_on(invocation, options, session).await
    })
    .await
}

async fn resolve_launch_source(options: &LaunchOptions, session: &Session, cwd: &Path) -> Result<Located<PrepareManifest>> {
    if let Some(explicit) = &options.prepare_manifest {
        let path = if explicit.is_absolute() {
            explicit.clone()
        } else {
            cwd.join(explicit)
        };
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(BridgeError::Manifest(format!(
                "prepare manifest not found: {}",
                path.display()
            )));
        }
        let data = read_manifest(&path).await?;
        return Ok(Located { path, data });
    }

    locate_latest_manifest(&session.manifests_dir(), PREPARE_PREFIX)
        .await?
        .ok_or_else(|| {
            BridgeError::Manifest(format!(
                "no prepare manifest in {}. Run `appbridge prepare` first",
                session.manifests_dir().display()
            ))
        })
}

fn runtime_binary_name(surface: &dyn ExecutionSurface) -> &'static str {
    if surface.kind() == Surface::Primary && cfg!(windows) {
        "electron.exe"
    } else {
        "electron"
    }
}

/// Desktop runtime installed by the native module stage.
async fn locate_runtime_binary(surface: &dyn ExecutionSurface, prepared: &PrepareManifest) -> Result<PathBuf> {
    let name = runtime_binary_name(surface);
    let direct = prepared
        .paths
        .native_build_dir
        .join("node_modules/electron/dist")
        .join(name);
    if surface.exists(&direct).await? {
        return Ok(direct);
    }

    surface
        .find_first(&prepared.paths.native_root_dir, name, RUNTIME_SEARCH_DEPTH)
        .await?
        .ok_or_else(|| BridgeError::ToolNotFound {
            tool: format!("Desktop runtime ({name})"),
            hint: "Run prepare again to install the native runtime.".to_string(),
        })
}

fn cli_not_found(config: &BridgeConfig) -> BridgeError {
    BridgeError::ToolNotFound {
        tool: format!("Companion CLI ({})", config.app.cli_name),
        hint: format!(
            "Install it, pass --cli-path, or set {}.",
            config.cli_env_var()
        ),
    }
}

/// Companion CLI: configured path, then environment (host only), then discovery.
async fn resolve_cli_path(session: &Session, config: &BridgeConfig) -> Result<String> {
    let surface = session.surface.as_ref();
    let cli_name = config.app.cli_name.as_str();

    match surface.kind() {
        Surface::Primary => {
            if let Some(explicit) = config.cli_path.as_deref() {
                let path = PathBuf::from(explicit);
                if !surface.exists(&path).await? {
                    return Err(BridgeError::ToolNotFound {
                        tool: format!("Companion CLI at {explicit}"),
                        hint: "The configured path does not exist.".to_string(),
                    });
                }
                return Ok(explicit.to_string());
            }

            if let Ok(from_env) = std::env::var(config.cli_env_var()) {
                if !from_env.trim().is_empty() && surface.exists(Path::new(&from_env)).await? {
                    return Ok(from_env);
                }
            }

            let mut names = vec![cli_name.to_string()];
            if cfg!(windows) {
                names.insert(0, format!("{cli_name}.exe"));
            }
            for name in &names {
                if let Some(found) = surface.locate_tool(name, &[]).await? {
                    return Ok(found);
                }
            }
            Err(cli_not_found(config))
        }
        Surface::Secondary => {
            if let Some(explicit) = session.runtime.secondary.cli_path.as_deref() {
                if !surface.exists(Path::new(explicit)).await? {
                    return Err(BridgeError::ToolNotFound {
                        tool: format!("Companion CLI at {explicit}"),
                        hint: "The path does not exist inside the secondary shell.".to_string(),
                    });
                }
                return Ok(explicit.to_string());
            }

            match surface.locate_tool(cli_name, &[]).await? {
                Some(found) if !found.starts_with(HOST_MOUNT_PREFIX) => Ok(found),
                Some(found) => {
                    warn!(path = %found, "Ignoring host-mounted companion CLI");
                    Err(cli_not_found(config))
                }
                None => Err(cli_not_found(config)),
            }
        }
    }
}

/// Environment handed to the desktop runtime.
pub fn launch_environment(
    config: &BridgeConfig,
    metadata: &AppMetadata,
    app_dir: &Path,
    cli_path: &str,
) -> BTreeMap<String, String> {
    let prefix = config.app.env_prefix.as_str();
    let flavor = metadata
        .build_flavor
        .clone()
        .unwrap_or_else(|| DEFAULT_BUILD_FLAVOR.to_string());
    let app = app_dir.to_string_lossy().replace('\\', "/");
    let renderer = if app.starts_with('/') {
        format!("file://{app}/webview/index.html")
    } else {
        format!("file:///{app}/webview/index.html")
    };

    BTreeMap::from([
        ("ELECTRON_RENDERER_URL".to_string(), renderer),
        ("ELECTRON_FORCE_IS_PACKAGED".to_string(), "1".to_string()),
        (
            format!("{prefix}_BUILD_NUMBER"),
            metadata
                .build_number
                .clone()
                .unwrap_or_else(|| DEFAULT_BUILD_NUMBER.to_string()),
        ),
        (format!("{prefix}_BUILD_FLAVOR"), flavor.clone()),
        ("BUILD_FLAVOR".to_string(), flavor),
        ("NODE_ENV".to_string(), "production".to_string()),
        (config.cli_env_var(), cli_path.to_string()),
        ("PWD".to_string(), app_dir.to_string_lossy().to_string()),
    ])
}

/// Arguments handed to the desktop runtime.
pub fn launch_args(app_dir: &Path, user_data_dir: &Path, cache_dir: &Path) -> Vec<String> {
    vec![
        app_dir.to_string_lossy().to_string(),
        "--enable-logging".to_string(),
        format!("--user-data-dir={}", user_data_dir.to_string_lossy()),
        format!("--disk-cache-dir={}", cache_dir.to_string_lossy()),
    ]
}

/// Launch on an open session and write the launch manifest.
pub async fn launch_on(invocation: &Invocation, options: &LaunchOptions, session: Session) -> Result<LaunchReport> {
    let run_id = new_run_id();
    let span = RunSpan::span("launch", &run_id);

    async move {
        let surface = session.surface.as_ref();
        let source = resolve_launch_source(options, &session, &invocation.cwd).await?;
        let prepared = &source.data;
        let paths = &prepared.paths;

        if !surface.exists(&paths.app_dir).await? {
            return Err(BridgeError::Manifest(format!(
                "prepared app directory is missing: {}. Run prepare again",
                paths.app_dir.display()
            )));
        }

        let runtime_binary = locate_runtime_binary(surface, prepared).await?;
        let cli_path = resolve_cli_path(&session, &invocation.config).await?;
        surface.ensure_dir(&paths.user_data_dir).await?;
        surface.ensure_dir(&paths.cache_dir).await?;

        info!(
            runtime = %session.runtime.surface,
            binary = %runtime_binary.display(),
            app_dir = %paths.app_dir.display(),
            cli = %cli_path,
            "Launching app"
        );

        let exec = ExecOptions {
            cwd: Some(paths.app_dir.clone()),
            env: launch_environment(&invocation.config, &prepared.metadata, &paths.app_dir, &cli_path),
            stdin: None,
            inherit_stdio: true,
        };
        let out = surface
            .execute(
                &runtime_binary.to_string_lossy(),
                &launch_args(&paths.app_dir, &paths.user_data_dir, &paths.cache_dir),
                &exec,
            )
            .await?;

        let manifest = LaunchManifest {
            kind: ManifestKind::Launch,
            generated_at: Utc::now(),
            run_id: run_id.clone(),
            prepare_manifest_path: source.path.clone(),
            paths: paths.clone(),
            stage_results: Vec::new(),
            content_hash: prepared.content_hash.clone(),
            runtime_context: RuntimeContext::new(
                &session.runtime,
                Some(session.surface_workdir.to_string_lossy().to_string()),
                prepared.runtime_context.arch.clone(),
            ),
            runtime_binary,
            app_dir: paths.app_dir.clone(),
            cli_path: Some(cli_path),
            user_data_dir: paths.user_data_dir.clone(),
            cache_dir: paths.cache_dir.clone(),
            exit_code: out.exit_code,
            log_path: invocation.log_path.clone(),
        };
        let name = manifest_name(LAUNCH_PREFIX, manifest.generated_at, None);
        let launch_manifest_path = write_manifest(&session.manifests_dir(), &name, &manifest).await?;

        out.check("launch_app")?;
        info!(manifest = %launch_manifest_path.display(), "App exited cleanly");

        Ok(LaunchReport {
            ok: true,
            runtime: session.runtime.surface,
            launch_manifest_path,
            exit_code: 0,
            log_path: invocation.log_path.clone(),
        })
    }
    .instrument(span)
    .await
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KillReport {
    pub ok: bool,
    pub runtime: Surface,
    pub killed: bool,
    pub warnings: Vec<String>,
}

fn kill_commands(surface: Surface, cli_name: &str) -> Vec<(String, Vec<String>)> {
    match surface {
        Surface::Primary if cfg!(windows) => ["electron.exe".to_string(), format!("{cli_name}.exe")]
            .into_iter()
            .map(|image| {
                (
                    "taskkill".to_string(),
                    vec!["/F".to_string(), "/IM".to_string(), image],
                )
            })
            .collect(),
        _ => ["electron", cli_name]
            .into_iter()
            .map(|pattern| {
                (
                    "pkill".to_string(),
                    vec!["-f".to_string(), pattern.to_string()],
                )
            })
            .collect(),
    }
}

/// Best-effort termination of the desktop runtime and companion CLI. Never fails.
pub async fn kill(invocation: &Invocation) -> KillReport {
    let surface_kind = invocation.runtime.surface;
    let mut warnings = Vec::new();

    let surface: Box<dyn ExecutionSurface> = match surface_kind {
        Surface::Primary => Box::new(crate::bridge::HostSurface::new()),
        Surface::Secondary => {
            match SecondarySurface::discover(invocation.runtime.secondary.distro.as_deref()).await {
                Ok(surface) => Box::new(surface),
                Err(e) => {
                    warnings.push(format!("secondary shell unavailable: {e}"));
                    return KillReport {
                        ok: true,
                        runtime: surface_kind,
                        killed: false,
                        warnings,
                    };
                }
            }
        }
    };

    kill_on(surface.as_ref(), &invocation.config, warnings).await
}

async fn kill_on(surface: &dyn ExecutionSurface, config: &BridgeConfig, mut warnings: Vec<String>) -> KillReport {
    let mut killed = true;
    for (program, args) in kill_commands(surface.kind(), &config.app.cli_name) {
        // Non-zero exits only mean nothing matched.
        if let Err(e) = surface.execute(&program, &args, &ExecOptions::default()).await {
            warn!(program = %program, error = %e, "Kill command failed");
            warnings.push(format!("{program} failed: {e}"));
            killed = false;
        }
    }

    KillReport {
        ok: true,
        runtime: surface.kind(),
        killed,
        warnings,
    }
}

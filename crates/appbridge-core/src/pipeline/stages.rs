//! The prepare stage registry.
//!
//! Every stage is written once against [`ExecutionSurface`], so the same
//! list runs on the host and inside the secondary shell.

use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::json;
use tracing::{info, warn};

use super::{PipelineContext, Stage, StageDescriptor, StageOutput};
use crate::artifact::resolve_artifact;
use crate::bridge::{CommandOutput, ExecOptions, ExecutionSurface};
use crate::config::NativeBuildStrategy;
use crate::error::{BridgeError, Result};
use crate::metadata::read_app_metadata;
use crate::patches::{PatchRegistry, PatchTarget};
use crate::runtime::Surface;
use crate::workspace::{reuse_eligible, WorkPaths};

const INNER_ARCHIVE_DEPTH: usize = 10;
const DISK_IMAGE_DEPTH: usize = 4;

/// Install locations tried when the archiver is not on `PATH`.
const ARCHIVER_CANDIDATES: [&str; 4] = [
    r"C:\Program Files\7-Zip\7z.exe",
    r"C:\Program Files (x86)\7-Zip\7z.exe",
    "/usr/bin/7z",
    "/usr/bin/7za",
];

const INNER_ARCHIVE_UNPACKER: &str = "@electron/asar";
const REBUILD_PACKAGE: &str = "@electron/rebuild";
const PREBUILD_PACKAGE: &str = "prebuild-install";
const RUNTIME_PACKAGE: &str = "electron";

/// Stages in execution order.
pub fn prepare_stages() -> Vec<Box<dyn Stage<PipelineContext>>> {
    vec![
        Box::new(StageDescriptor::new(
            "resolve_artifact_and_paths",
            resolve_artifact_and_paths,
        )),
        Box::new(StageDescriptor::new("extract_artifact", extract_artifact)),
        Box::new(StageDescriptor::new(
            "locate_inner_archive",
            locate_inner_archive,
        )),
        Box::new(StageDescriptor::new(
            "unpack_inner_archive",
            unpack_inner_archive,
        )),
        Box::new(StageDescriptor::new("apply_patches", apply_patches)),
        Box::new(StageDescriptor::new("read_metadata", read_metadata)),
        Box::new(StageDescriptor::new(
            "prepare_native_modules",
            prepare_native_modules,
        )),
        Box::new(StageDescriptor::new(
            "verify_native_modules",
            verify_native_modules,
        )),
    ]
}

/// Stage names in execution order, without running anything.
pub fn prepare_stage_names() -> Vec<String> {
    prepare_stages()
        .iter()
        .map(|s| s.name().to_string())
        .collect()
}

/// npm-family launchers are batch shims on a Windows host.
fn node_program(surface: &dyn ExecutionSurface, name: &str) -> String {
    if surface.kind() == Surface::Primary && cfg!(windows) {
        format!("{name}.cmd")
    } else {
        name.to_string()
    }
}

fn strings<const N: usize>(args: [&str; N]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// 7-Zip reports warnings (for example unsupported symlinks) with codes 1 and 2.
fn archiver_warning(out: &CommandOutput) -> bool {
    matches!(out.exit_code, 1 | 2)
}

fn resolve_artifact_and_paths(ctx: &mut PipelineContext) -> BoxFuture<'_, Result<StageOutput>> {
    async move {
        let surface = ctx.surface.clone();

        let artifact = resolve_artifact(
            surface.as_ref(),
            &ctx.config.artifact,
            &ctx.options.artifact,
            &ctx.cwd,
            &ctx.surface_workdir,
        )
        .await?;
        let content_hash = surface.digest_file(&artifact.path).await?;
        let arch = surface.arch_tag().await?;
        let paths = WorkPaths::derive(&ctx.surface_workdir, &content_hash, &arch)
            .with_host_records(&ctx.host_workdir);

        surface.ensure_dir(&paths.workdir).await?;
        tokio::fs::create_dir_all(&paths.logs_dir).await?;
        tokio::fs::create_dir_all(&paths.manifests_dir).await?;

        let reuse_hit = reuse_eligible(ctx.options.reuse, surface.as_ref(), &paths).await?;
        let archiver = if reuse_hit {
            None
        } else {
            let found = surface.locate_tool("7z", &ARCHIVER_CANDIDATES).await?;
            Some(found.ok_or_else(|| BridgeError::ToolNotFound {
                tool: "7z".to_string(),
                hint: "Install 7-Zip (p7zip-full inside the secondary shell).".to_string(),
            })?)
        };

        info!(
            artifact = %artifact.path.display(),
            hash = %content_hash,
            arch = %arch,
            reuse_hit = reuse_hit,
            "Resolved artifact"
        );

        let outputs = json!({
            "artifactPath": artifact.path,
            "contentHash": content_hash,
            "arch": arch,
            "paths": paths,
            "archiver": archiver,
            "reuseHit": reuse_hit,
            "downloadInfo": artifact.download,
        });

        ctx.tools.archiver = archiver;
        ctx.artifact = Some(artifact);
        ctx.content_hash = Some(content_hash);
        ctx.arch = Some(arch);
        ctx.paths = Some(paths);
        ctx.reuse_hit = reuse_hit;

        Ok(StageOutput::new(outputs))
    }
    .boxed()
}

fn extract_artifact(ctx: &mut PipelineContext) -> BoxFuture<'_, Result<StageOutput>> {
    async move {
        if ctx.reuse_hit {
            return Ok(StageOutput::skipped("reuse mode: skipping artifact extraction"));
        }

        let surface = ctx.surface.clone();
        let paths = ctx.paths()?.clone();
        let artifact = ctx
            .artifact
            .as_ref()
            .map(|a| a.path.clone())
            .ok_or(BridgeError::State("artifact"))?;

        surface.ensure_dir(&paths.extracted_dir).await?;
        let out = surface
            .execute(
                ctx.archiver()?,
                &[
                    "x".to_string(),
                    "-y".to_string(),
                    path_arg(&artifact),
                    format!("-o{}", path_arg(&paths.extracted_dir)),
                ],
                &ExecOptions::default(),
            )
            .await?;

        let mut output = StageOutput::new(json!({ "extractedDir": paths.extracted_dir }));
        let exit_code = out.exit_code;
        if !out.success() {
            let usable = archiver_warning(&out)
                && (surface
                    .find_first(
                        &paths.extracted_dir,
                        &ctx.config.artifact.inner_archive_name,
                        INNER_ARCHIVE_DEPTH,
                    )
                    .await?
                    .is_some()
                    || surface
                        .find_first(
                            &paths.extracted_dir,
                            &ctx.config.artifact.disk_image_name,
                            DISK_IMAGE_DEPTH,
                        )
                        .await?
                        .is_some());
            if !usable {
                out.check("extract_artifact")?;
            }
            output = output.with_warning(format!(
                "archiver exited with code {exit_code} but the needed files were extracted"
            ));
        }

        Ok(output)
    }
    .boxed()
}

fn locate_inner_archive(ctx: &mut PipelineContext) -> BoxFuture<'_, Result<StageOutput>> {
    async move {
        if ctx.reuse_hit {
            return Ok(StageOutput::skipped(
                "reuse mode: skipping inner archive locate/extract",
            ));
        }

        let surface = ctx.surface.clone();
        let paths = ctx.paths()?.clone();
        let inner_name = ctx.config.artifact.inner_archive_name.clone();
        let unpacked_name = format!("{inner_name}.unpacked");
        let staged_archive = paths.staged_archive_dir.join(&inner_name);
        let staged_unpacked = paths.staged_archive_dir.join(&unpacked_name);
        let mut source = "artifact";

        surface.ensure_dir(&paths.staged_archive_dir).await?;

        let direct = surface
            .find_first(&paths.extracted_dir, &inner_name, INNER_ARCHIVE_DEPTH)
            .await?;

        if let Some(found) = direct {
            surface.copy_file(&found, &staged_archive).await?;
            let sibling = found.with_file_name(&unpacked_name);
            if surface.exists(&sibling).await? {
                surface.copy_dir_contents(&sibling, &staged_unpacked).await?;
            }
        } else {
            let image = surface
                .find_first(
                    &paths.extracted_dir,
                    &ctx.config.artifact.disk_image_name,
                    DISK_IMAGE_DEPTH,
                )
                .await?
                .ok_or_else(|| {
                    BridgeError::ArtifactNotFound(format!(
                        "unable to find {inner_name} or {} after extraction",
                        ctx.config.artifact.disk_image_name
                    ))
                })?;
            source = "disk image";

            let mut args = vec!["x".to_string(), "-y".to_string(), path_arg(&image)];
            args.extend(ctx.config.artifact.disk_image_entries.iter().cloned());
            args.push(format!("-o{}", path_arg(&paths.staged_archive_dir)));
            let out = surface
                .execute(ctx.archiver()?, &args, &ExecOptions::default())
                .await?;

            let nested = surface
                .find_first(&paths.staged_archive_dir, &inner_name, INNER_ARCHIVE_DEPTH)
                .await?;
            let nested = match nested {
                Some(path) if out.success() || archiver_warning(&out) => path,
                _ => {
                    out.check("extract_disk_image")?;
                    return Err(BridgeError::ArtifactNotFound(format!(
                        "{inner_name} not found after disk image extraction"
                    )));
                }
            };
            if nested != staged_archive {
                surface.copy_file(&nested, &staged_archive).await?;
            }

            if let Some(unpacked) = surface
                .find_first(&paths.staged_archive_dir, &unpacked_name, INNER_ARCHIVE_DEPTH)
                .await?
            {
                if unpacked != staged_unpacked {
                    surface
                        .copy_dir_contents(&unpacked, &staged_unpacked)
                        .await?;
                }
            }
        }

        let unpacked = if surface.exists(&staged_unpacked).await? {
            Some(staged_unpacked)
        } else {
            None
        };

        let outputs = json!({
            "source": source,
            "stagedArchive": staged_archive,
            "stagedUnpacked": unpacked,
        });
        ctx.staged_archive = Some(staged_archive);
        ctx.staged_unpacked = unpacked;

        Ok(StageOutput::new(outputs))
    }
    .boxed()
}

fn unpack_inner_archive(ctx: &mut PipelineContext) -> BoxFuture<'_, Result<StageOutput>> {
    async move {
        if ctx.reuse_hit {
            return Ok(StageOutput::skipped("reuse mode: skipping inner archive unpack"));
        }

        let surface = ctx.surface.clone();
        let paths = ctx.paths()?.clone();
        let staged = ctx
            .staged_archive
            .clone()
            .ok_or(BridgeError::State("staged inner archive"))?;

        surface.remove_path(&paths.app_dir).await?;
        surface.ensure_dir(&paths.app_dir).await?;

        surface
            .execute(
                &node_program(surface.as_ref(), "npx"),
                &[
                    "--yes".to_string(),
                    INNER_ARCHIVE_UNPACKER.to_string(),
                    "extract".to_string(),
                    path_arg(&staged),
                    path_arg(&paths.app_dir),
                ],
                &ExecOptions::default(),
            )
            .await?
            .check("unpack_inner_archive")?;

        let merged = match &ctx.staged_unpacked {
            Some(unpacked) if surface.exists(unpacked).await? => {
                surface.copy_dir_contents(unpacked, &paths.app_dir).await?;
                true
            }
            _ => false,
        };

        Ok(StageOutput::new(json!({
            "appDir": paths.app_dir,
            "mergedUnpacked": merged,
        })))
    }
    .boxed()
}

fn apply_patches(ctx: &mut PipelineContext) -> BoxFuture<'_, Result<StageOutput>> {
    async move {
        let surface = ctx.surface.clone();
        let app_dir = ctx.paths()?.app_dir.clone();
        let target = PatchTarget {
            surface: surface.as_ref(),
            app_dir: &app_dir,
        };

        let results = PatchRegistry::default()
            .apply_all(ctx.metadata.as_ref(), &target)
            .await?;
        let outputs = json!({ "patches": results });
        ctx.patch_results = results;

        Ok(StageOutput::new(outputs))
    }
    .boxed()
}

fn read_metadata(ctx: &mut PipelineContext) -> BoxFuture<'_, Result<StageOutput>> {
    async move {
        let surface = ctx.surface.clone();
        let app_dir = ctx.paths()?.app_dir.clone();
        let build_key_prefix = ctx.config.app.env_prefix.to_ascii_lowercase();

        let metadata = read_app_metadata(
            surface.as_ref(),
            &app_dir,
            &ctx.config.artifact.native_modules,
            &build_key_prefix,
        )
        .await?;

        let arch = ctx.arch()?.to_string();
        let native_build_dir = ctx
            .paths()?
            .native_build_dir_for(&metadata.runtime_version, &arch);
        if let Some(paths) = ctx.paths.as_mut() {
            paths.native_build_dir = native_build_dir.clone();
        }

        let outputs = json!({
            "metadata": metadata,
            "nativeBuildDir": native_build_dir,
        });
        ctx.metadata = Some(metadata);

        Ok(StageOutput::new(outputs))
    }
    .boxed()
}

/// Where a native module's binaries come from and where the app expects them.
struct NativeBinary {
    module: &'static str,
    file: &'static str,
    required: bool,
    /// Directories under the module root searched in the build tree, in order.
    sources: Vec<String>,
    /// Directories under the module root in the app tree.
    targets: Vec<String>,
}

/// Binary layout for the configured native modules. Unknown modules are rebuilt but not copied.
fn native_binaries(modules: &[String], arch: &str) -> Vec<NativeBinary> {
    let prebuilds = format!("prebuilds/{arch}");
    let release = "build/Release".to_string();
    let mut binaries = Vec::new();

    for module in modules {
        match module.as_str() {
            "better-sqlite3" => binaries.push(NativeBinary {
                module: "better-sqlite3",
                file: "better_sqlite3.node",
                required: true,
                sources: vec![release.clone()],
                targets: vec![release.clone()],
            }),
            "node-pty" => {
                for (file, required) in [
                    ("pty.node", true),
                    ("conpty.node", false),
                    ("conpty_console_list.node", false),
                ] {
                    binaries.push(NativeBinary {
                        module: "node-pty",
                        file,
                        required,
                        sources: vec![release.clone(), prebuilds.clone()],
                        targets: vec![prebuilds.clone(), release.clone()],
                    });
                }
            }
            _ => {}
        }
    }

    binaries
}

fn module_root(base: &Path, module: &str) -> PathBuf {
    base.join("node_modules").join(module)
}

/// Every app-side file that must exist once native modules are prepared.
fn expected_native_files(app_dir: &Path, modules: &[String], arch: &str) -> Vec<PathBuf> {
    native_binaries(modules, arch)
        .into_iter()
        .filter(|b| b.required)
        .flat_map(|b| {
            let root = module_root(app_dir, b.module);
            b.targets
                .iter()
                .map(|t| root.join(t).join(b.file))
                .collect::<Vec<_>>()
        })
        .collect()
}

async fn run_in(
    surface: &dyn ExecutionSurface,
    cwd: &Path,
    program: &str,
    args: Vec<String>,
) -> Result<CommandOutput> {
    surface
        .execute(program, &args, &ExecOptions::in_dir(cwd))
        .await
}

fn prepare_native_modules(ctx: &mut PipelineContext) -> BoxFuture<'_, Result<StageOutput>> {
    async move {
        let surface = ctx.surface.clone();
        let surface = surface.as_ref();
        let paths = ctx.paths()?.clone();
        let arch = ctx.arch()?.to_string();
        let metadata = ctx.metadata()?.clone();
        let modules = ctx.config.artifact.native_modules.clone();
        let strategy = ctx.config.native_build.strategy;
        let build_dir = paths.native_build_dir.clone();
        let binaries = native_binaries(&modules, &arch);

        let module_specs = modules
            .iter()
            .map(|m| metadata.native_module_spec(m))
            .collect::<Result<Vec<_>>>()?;

        if ctx.options.reuse {
            let mut present = true;
            for binary in binaries.iter().filter(|b| b.required) {
                let first_target = binary.targets.first().cloned().unwrap_or_default();
                let path = module_root(&paths.app_dir, binary.module)
                    .join(first_target)
                    .join(binary.file);
                if !surface.exists(&path).await? {
                    present = false;
                    break;
                }
            }
            if present {
                return Ok(StageOutput::new(json!({
                    "skipped": true,
                    "reason": "reuse requested and app native modules already present",
                    "nativeBuildDir": build_dir,
                })));
            }
        }

        let mut warnings = Vec::new();
        let npm = node_program(surface, "npm");
        surface.ensure_dir(&build_dir).await?;

        if !surface.exists(&build_dir.join("package.json")).await? {
            run_in(surface, &build_dir, &npm, strings(["init", "-y"]))
                .await?
                .check("npm_init")?;
        }

        let mut install = strings(["install", "--no-save"]);
        install.extend(module_specs.iter().cloned());
        install.push(REBUILD_PACKAGE.to_string());
        install.push(PREBUILD_PACKAGE.to_string());
        install.push(format!("{RUNTIME_PACKAGE}@{}", metadata.runtime_version));
        run_in(surface, &build_dir, &npm, install)
            .await?
            .check("npm_install_native")?;

        let rebuilt = if strategy == NativeBuildStrategy::Prebuild {
            false
        } else {
            let cli = build_dir.join("node_modules/@electron/rebuild/lib/cli.js");
            let out = run_in(
                surface,
                &build_dir,
                "node",
                vec![
                    path_arg(&cli),
                    "-v".to_string(),
                    metadata.runtime_version.clone(),
                    "-w".to_string(),
                    modules.join(","),
                ],
            )
            .await?;
            if !out.success() && strategy == NativeBuildStrategy::Rebuild {
                out.clone().check("native_rebuild")?;
            }
            out.success()
        };

        if !rebuilt {
            if strategy == NativeBuildStrategy::Auto {
                warnings.push("native rebuild failed, attempting prebuilt binaries".to_string());
            }
            let prebuild_cli = build_dir.join("node_modules/prebuild-install/bin.js");
            for module in &modules {
                let out = run_in(
                    surface,
                    &module_root(&build_dir, module),
                    "node",
                    vec![
                        path_arg(&prebuild_cli),
                        "-r".to_string(),
                        RUNTIME_PACKAGE.to_string(),
                        "-t".to_string(),
                        metadata.runtime_version.clone(),
                        format!("--tag-prefix={RUNTIME_PACKAGE}-v"),
                    ],
                )
                .await?;
                if !out.success() {
                    warnings.push(format!(
                        "prebuilt binary fetch for {module} exited with code {}",
                        out.exit_code
                    ));
                }
            }
        }

        let mut copied = Vec::new();
        for binary in &binaries {
            let build_root = module_root(&build_dir, binary.module);
            let mut source = None;
            for dir in &binary.sources {
                let candidate = build_root.join(dir).join(binary.file);
                if surface.exists(&candidate).await? {
                    source = Some(candidate);
                    break;
                }
            }

            let Some(source) = source else {
                if binary.required {
                    return Err(BridgeError::NativeVerification {
                        missing: vec![path_arg(&build_root.join(&binary.sources[0]).join(binary.file))],
                    });
                }
                continue;
            };

            let app_root = module_root(&paths.app_dir, binary.module);
            for target in &binary.targets {
                let dest = app_root.join(target).join(binary.file);
                surface.copy_file(&source, &dest).await?;
                copied.push(dest);
            }
        }

        for warning in &warnings {
            warn!(stage = "prepare_native_modules", "{warning}");
        }

        Ok(StageOutput::new(json!({
            "skipped": false,
            "nativeBuildDir": build_dir,
            "arch": arch,
            "rebuilt": rebuilt,
            "copied": copied,
        }))
        .with_warnings(warnings))
    }
    .boxed()
}

fn verify_native_modules(ctx: &mut PipelineContext) -> BoxFuture<'_, Result<StageOutput>> {
    async move {
        let surface = ctx.surface.clone();
        let paths = ctx.paths()?;
        let arch = ctx.arch()?;
        let checks = expected_native_files(&paths.app_dir, &ctx.config.artifact.native_modules, arch);

        let mut missing = Vec::new();
        for check in &checks {
            if !surface.exists(check).await? {
                missing.push(path_arg(check));
            }
        }
        if !missing.is_empty() {
            return Err(BridgeError::NativeVerification { missing });
        }

        Ok(StageOutput::new(json!({
            "verified": true,
            "arch": arch,
            "checkedFiles": checks,
        })))
    }
    .boxed()
}

//! Integration test: a reuse hit on the primary surface skips extraction and
//! unpacking, still patches and verifies, and writes a prepare manifest.

use std::path::Path;
use std::sync::Arc;

use appbridge_core::commands::prepare_on;
use appbridge_core::workspace::host_arch_tag;
use appbridge_core::{
    hash_artifact, locate_latest_manifest, resolve_runtime, ArtifactRequest, BridgeConfig,
    HostSurface, Invocation, PrepareManifest, PrepareOptions, RuntimeOverrides, Session,
    WorkPaths, PREPARE_PREFIX,
};

const PRELOAD: &str = r#"n.contextBridge.exposeInMainWorld("electronBridge",B);"#;

const PACKAGE_JSON: &str = r#"{
  "name": "codex",
  "version": "1.2.3",
  "codexBuildNumber": 612,
  "codexBuildFlavor": "prod",
  "dependencies": { "better-sqlite3": "11.5.0", "node-pty": "1.0.0" },
  "devDependencies": { "electron": "33.2.0" }
}"#;

fn write(path: &Path, body: &[u8]) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, body).unwrap();
}

/// Lay out a tree that looks like a finished earlier run.
fn seed_previous_run(paths: &WorkPaths, arch: &str) {
    let app = &paths.app_dir;
    write(&app.join("package.json"), PACKAGE_JSON.as_bytes());
    write(&app.join(".vite/build/preload.js"), PRELOAD.as_bytes());
    write(
        &app.join("node_modules/better-sqlite3/build/Release/better_sqlite3.node"),
        b"bin",
    );
    write(
        &app.join(format!("node_modules/node-pty/prebuilds/{arch}/pty.node")),
        b"bin",
    );
    write(&app.join("node_modules/node-pty/build/Release/pty.node"), b"bin");
    write(&app.join("node_modules/sparkle-darwin/index.js"), b"mac only");
}

#[tokio::test]
async fn test_reuse_hit_skips_unpack_and_records_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let cwd = dir.path().to_path_buf();
    let artifact = cwd.join("Codex.dmg");
    std::fs::write(&artifact, b"not really a disk image").unwrap();

    let config = BridgeConfig::defaults(&cwd);
    let workdir = config.workdir.clone();
    let hash = hash_artifact(&artifact).await.unwrap();
    let arch = host_arch_tag();
    let paths = WorkPaths::derive(&workdir, &hash, &arch);
    seed_previous_run(&paths, &arch);

    let runtime = resolve_runtime(&config, &RuntimeOverrides::default()).unwrap();
    let invocation = Invocation {
        cwd: cwd.clone(),
        config,
        runtime: runtime.clone(),
        log_path: None,
    };
    let options = PrepareOptions {
        artifact: ArtifactRequest {
            no_download: true,
            ..ArtifactRequest::default()
        },
        reuse: true,
    };
    let session = Session::new(runtime, Arc::new(HostSurface::new()), workdir.clone(), workdir.clone());

    let report = prepare_on(&invocation, &options, session).await.unwrap();

    assert!(report.ok);
    assert!(report.context.reuse_hit);
    assert_eq!(report.context.content_hash, hash);
    assert_eq!(report.context.metadata.runtime_version, "33.2.0");
    assert_eq!(report.context.metadata.build_number.as_deref(), Some("612"));
    assert_eq!(report.stage_results.len(), 8);

    for skipped in &report.stage_results[1..4] {
        assert_eq!(skipped.outputs["skipped"], true, "{} should be skipped", skipped.stage);
        assert!(skipped.warnings[0].starts_with("reuse mode"));
    }
    let native = &report.stage_results[6];
    assert_eq!(native.stage, "prepare_native_modules");
    assert_eq!(native.outputs["skipped"], true);

    // Patches still ran against the reused tree.
    let preload = std::fs::read_to_string(paths.app_dir.join(".vite/build/preload.js")).unwrap();
    assert!(preload.contains(r#"exposeInMainWorld("process",processBridge)"#));
    assert!(!paths.app_dir.join("node_modules/sparkle-darwin").exists());
    assert!(!paths.extracted_dir.exists(), "reuse must not extract");

    let latest = locate_latest_manifest::<PrepareManifest>(&workdir.join("manifests"), PREPARE_PREFIX)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.path, report.manifest_path);
    assert_eq!(latest.data.content_hash, hash);
    assert_eq!(latest.data.stage_results, report.stage_results);
    assert!(latest.data.download_info.is_none());
}

#[tokio::test]
async fn test_missing_artifact_without_download_fails_in_first_stage() {
    let dir = tempfile::tempdir().unwrap();
    let cwd = dir.path().to_path_buf();
    let config = BridgeConfig::defaults(&cwd);
    let workdir = config.workdir.clone();
    let runtime = resolve_runtime(&config, &RuntimeOverrides::default()).unwrap();
    let invocation = Invocation {
        cwd,
        config,
        runtime: runtime.clone(),
        log_path: None,
    };
    let options = PrepareOptions {
        artifact: ArtifactRequest {
            no_download: true,
            ..ArtifactRequest::default()
        },
        reuse: false,
    };
    let session = Session::new(runtime, Arc::new(HostSurface::new()), workdir.clone(), workdir);

    let err = prepare_on(&invocation, &options, session).await.unwrap_err();
    let details = err.details();
    assert_eq!(details["stage"], "resolve_artifact_and_paths");
    assert_eq!(details["previousResults"].as_array().unwrap().len(), 0);
    assert_eq!(details["causeKind"], "artifact_not_found");
}

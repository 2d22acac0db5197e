//! Durable JSON records handed from prepare to launch.
//!
//! A manifest is written once and never touched again. Later phases find
//! their input with [`read_latest`], which picks the most recently modified
//! file sharing a name prefix.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::artifact::DownloadInfo;
use crate::config::NativeBuildStrategy;
use crate::error::{BridgeError, Result};
use crate::metadata::AppMetadata;
use crate::pipeline::StageResult;
use crate::runtime::{RuntimeOptions, Surface};
use crate::workspace::WorkPaths;

pub const PREPARE_PREFIX: &str = "prepare-";
pub const LAUNCH_PREFIX: &str = "launch-";

const HASH_SUFFIX_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestKind {
    Prepare,
    Launch,
}

/// Where a run executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeContext {
    pub surface: Surface,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_distro: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_workdir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
}

impl RuntimeContext {
    /// Context for `runtime`. Secondary details are dropped on the primary surface.
    pub fn new(runtime: &RuntimeOptions, secondary_workdir: Option<String>, arch: Option<String>) -> Self {
        let secondary = runtime.surface == Surface::Secondary;
        Self {
            surface: runtime.surface,
            secondary_distro: runtime.secondary.distro.clone().filter(|_| secondary),
            secondary_workdir: secondary_workdir.filter(|_| secondary),
            arch,
        }
    }
}

/// Configuration values a prepare run depended on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestConfig {
    pub workdir: PathBuf,
    pub native_build_strategy: NativeBuildStrategy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareManifest {
    pub kind: ManifestKind,
    pub generated_at: DateTime<Utc>,
    pub run_id: String,
    pub paths: WorkPaths,
    pub stage_results: Vec<StageResult>,
    pub content_hash: String,
    pub runtime_context: RuntimeContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_info: Option<DownloadInfo>,
    pub artifact_path: PathBuf,
    pub metadata: AppMetadata,
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    pub config: ManifestConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchManifest {
    pub kind: ManifestKind,
    pub generated_at: DateTime<Utc>,
    pub run_id: String,
    pub prepare_manifest_path: PathBuf,
    pub paths: WorkPaths,
    /// Launch runs no stages; kept for a uniform record shape.
    #[serde(default)]
    pub stage_results: Vec<StageResult>,
    pub content_hash: String,
    pub runtime_context: RuntimeContext,
    pub runtime_binary: PathBuf,
    pub app_dir: PathBuf,
    #[serde(default)]
    pub cli_path: Option<String>,
    pub user_data_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub exit_code: i32,
    #[serde(default)]
    pub log_path: Option<PathBuf>,
}

/// A manifest together with the file it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Located<T> {
    pub path: PathBuf,
    pub data: T,
}

/// Filesystem-safe UTC timestamp: `2026-01-02T03-04-05-678Z`.
pub fn timestamp_slug(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H-%M-%S-%3fZ").to_string()
}

/// `<prefix><timestamp>[-<hash[..12]>].json`
pub fn manifest_name(prefix: &str, at: DateTime<Utc>, content_hash: Option<&str>) -> String {
    let mut name = format!("{prefix}{}", timestamp_slug(at));
    if let Some(hash) = content_hash {
        let short = hash.get(..HASH_SUFFIX_LEN).unwrap_or(hash);
        name.push('-');
        name.push_str(short);
    }
    name.push_str(".json");
    name
}

/// Serialize `payload` to `<root>/<name>`, creating `root` if needed.
pub async fn write_manifest<T: Serialize>(root: &Path, name: &str, payload: &T) -> Result<PathBuf> {
    tokio::fs::create_dir_all(root).await?;
    let path = root.join(name);
    let mut body = serde_json::to_string_pretty(payload)?;
    body.push('\n');
    tokio::fs::write(&path, body).await?;
    debug!(path = %path.display(), "Manifest written");
    Ok(path)
}

/// Read and parse one manifest file.
pub async fn read_manifest<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = tokio::fs::read(path)
        .await
        .map_err(|e| BridgeError::Manifest(format!("cannot read {}: {e}", path.display())))?;
    serde_json::from_slice(&raw)
        .map_err(|e| BridgeError::Manifest(format!("cannot parse {}: {e}", path.display())))
}

/// Most recently modified `.json` file in `root` whose name starts with `prefix`.
///
/// Equal modification times resolve to the lexicographically greatest name.
/// A missing `root` yields `None`.
pub async fn read_latest<T: DeserializeOwned>(root: &Path, prefix: &str) -> Result<Option<Located<T>>> {
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut latest: Option<(SystemTime, String, PathBuf)> = None;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with(prefix) || !name.ends_with(".json") {
            continue;
        }
        let meta = entry.metadata().await?;
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified()?;
        let newer = match &latest {
            Some((time, best, _)) => (modified, &name) > (*time, best),
            None => true,
        };
        if newer {
            latest = Some((modified, name, entry.path()));
        }
    }

    match latest {
        Some((_, _, path)) => {
            let data = read_manifest(&path).await?;
            Ok(Some(Located { path, data }))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeZone;
    use serde_json::{json, Value};

    use super::*;

    fn set_mtime(path: &Path, secs_ago: u64) {
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(secs_ago))
            .unwrap();
    }

    #[test]
    fn names_are_timestamped_and_hash_suffixed() {
        let at = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(
            manifest_name(PREPARE_PREFIX, at, Some("0123456789abcdef0123")),
            "prepare-2026-01-02T03-04-05-000Z-0123456789ab.json"
        );
        assert_eq!(
            manifest_name(LAUNCH_PREFIX, at, None),
            "launch-2026-01-02T03-04-05-000Z.json"
        );
    }

    #[tokio::test]
    async fn written_manifest_is_pretty_with_trailing_newline() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("manifests");
        let path = write_manifest(&root, "prepare-x.json", &json!({ "kind": "prepare" }))
            .await
            .unwrap();

        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.ends_with("}\n"));
        assert!(body.contains("\n  \"kind\""));
    }

    #[tokio::test]
    async fn latest_follows_mtime_not_name() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let older = write_manifest(root, "prepare-2026-01-02.json", &json!({ "n": 1 }))
            .await
            .unwrap();
        let newer = write_manifest(root, "prepare-2026-01-01.json", &json!({ "n": 2 }))
            .await
            .unwrap();
        set_mtime(&older, 120);
        set_mtime(&newer, 60);

        let found = read_latest::<Value>(root, PREPARE_PREFIX)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.path, newer);
        assert_eq!(found.data["n"], 2);
    }

    #[tokio::test]
    async fn only_matching_json_files_count() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write_manifest(root, "prepare-a.json", &json!({ "n": 1 }))
            .await
            .unwrap();
        std::fs::write(root.join("prepare-b.json.tmp"), "{").unwrap();
        write_manifest(root, "launch-c.json", &json!({ "n": 3 }))
            .await
            .unwrap();
        set_mtime(&root.join("prepare-a.json"), 60);

        let found = read_latest::<Value>(root, PREPARE_PREFIX)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.data["n"], 1);
    }

    #[tokio::test]
    async fn equal_mtimes_pick_greatest_name() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let when = SystemTime::now() - Duration::from_secs(30);
        for (name, n) in [("prepare-a.json", 1), ("prepare-b.json", 2)] {
            let path = write_manifest(root, name, &json!({ "n": n })).await.unwrap();
            std::fs::File::options()
                .write(true)
                .open(&path)
                .unwrap()
                .set_modified(when)
                .unwrap();
        }

        let found = read_latest::<Value>(root, PREPARE_PREFIX)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.data["n"], 2);
    }

    #[tokio::test]
    async fn missing_root_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let found = read_latest::<Value>(&dir.path().join("nope"), PREPARE_PREFIX)
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn corrupt_manifest_is_a_manifest_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("prepare-x.json"), "{").unwrap();
        let err = read_latest::<Value>(dir.path(), PREPARE_PREFIX)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "manifest");
    }
}

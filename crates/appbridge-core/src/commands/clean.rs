use std::path::PathBuf;

use serde::Serialize;
use tracing::{info, warn};

use super::Invocation;
use crate::bridge::{ExecutionSurface, HostSurface, SecondarySurface};
use crate::error::Result;
use crate::runtime::{runtime_workdir, Surface};

/// Subtrees removed by a cache-only clean.
const CACHE_SUBTREES: [&str; 3] = ["cache", "logs", "manifests"];

#[derive(Debug, Clone, Default)]
pub struct CleanOptions {
    /// Remove only cache, log and manifest subtrees instead of the whole root.
    pub cache_only: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanReport {
    /// False when any secondary-shell removal was skipped or failed.
    pub ok: bool,
    pub runtime: Surface,
    pub removed_paths: Vec<String>,
    pub warnings: Vec<String>,
}

fn targets(root: PathBuf, cache_only: bool) -> Vec<PathBuf> {
    if cache_only {
        CACHE_SUBTREES.iter().map(|s| root.join(s)).collect()
    } else {
        vec![root]
    }
}

/// Remove working data. Host paths must be removable; secondary-shell paths are best effort.
pub async fn clean(invocation: &Invocation, options: &CleanOptions) -> Result<CleanReport> {
    let surface_kind = invocation.runtime.surface;
    let host_root = runtime_workdir(&invocation.config.workdir, surface_kind);
    let host = HostSurface::new();
    let mut removed_paths = Vec::new();

    for target in targets(host_root, options.cache_only) {
        if host.exists(&target).await? {
            host.remove_path(&target).await?;
            info!(target = %target.display(), "Removed path");
            removed_paths.push(target.to_string_lossy().to_string());
        }
    }

    let mut warnings = Vec::new();
    if surface_kind == Surface::Secondary {
        match SecondarySurface::discover(invocation.runtime.secondary.distro.as_deref()).await {
            Ok(surface) => {
                let configured = invocation.runtime.secondary.workdir.clone();
                let workdir = match surface.expand_home_path(&configured).await {
                    Ok(expanded) => expanded,
                    Err(e) => {
                        warnings.push(format!(
                            "failed to resolve secondary home directory ({e}); using {configured}"
                        ));
                        configured
                    }
                };
                let (removed, failed) =
                    clean_secondary(&surface, PathBuf::from(workdir), options.cache_only).await;
                removed_paths.extend(removed);
                warnings.extend(failed);
            }
            Err(e) => warnings.push(format!(
                "skipped secondary filesystem cleanup: {e}"
            )),
        }
    }

    for warning in &warnings {
        warn!("{warning}");
    }

    Ok(CleanReport {
        ok: warnings.is_empty(),
        runtime: surface_kind,
        removed_paths,
        warnings,
    })
}

/// Remove mirrored paths inside the secondary shell, collecting failures as warnings.
async fn clean_secondary(
    surface: &dyn ExecutionSurface,
    workdir: PathBuf,
    cache_only: bool,
) -> (Vec<String>, Vec<String>) {
    let mut removed = Vec::new();
    let mut failed = Vec::new();

    for target in targets(workdir, cache_only) {
        match surface.remove_path(&target).await {
            Ok(()) => removed.push(format!("secondary:{}", target.display())),
            Err(e) => failed.push(format!(
                "failed to remove secondary path {}: {e}",
                target.display()
            )),
        }
    }

    (removed, failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::runtime::{RuntimeOverrides, resolve_runtime};

    fn invocation(workdir: PathBuf) -> Invocation {
        let mut config = BridgeConfig::defaults(&workdir);
        config.workdir = workdir.clone();
        let runtime = resolve_runtime(&config, &RuntimeOverrides::default()).unwrap();
        Invocation {
            cwd: workdir,
            config,
            runtime,
            log_path: None,
        }
    }

    #[tokio::test]
    async fn cache_only_keeps_app_trees() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("work");
        for sub in ["cache/h", "logs", "manifests", "app/h"] {
            std::fs::create_dir_all(root.join(sub)).unwrap();
        }

        let report = clean(&invocation(root.clone()), &CleanOptions { cache_only: true })
            .await
            .unwrap();

        assert!(report.ok);
        assert_eq!(report.removed_paths.len(), 3);
        assert!(root.join("app/h").exists());
        assert!(!root.join("cache").exists());
    }

    #[tokio::test]
    async fn full_clean_removes_root_and_tolerates_absence() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("work");
        std::fs::create_dir_all(root.join("app")).unwrap();
        let inv = invocation(root.clone());

        let first = clean(&inv, &CleanOptions::default()).await.unwrap();
        assert_eq!(first.removed_paths, vec![root.to_string_lossy().to_string()]);
        assert!(!root.exists());

        let second = clean(&inv, &CleanOptions::default()).await.unwrap();
        assert!(second.ok);
        assert!(second.removed_paths.is_empty());
    }

    #[tokio::test]
    async fn secondary_failures_become_warnings() {
        let dir = tempfile::tempdir().unwrap();
        let surface = SecondarySurface::new("env", None);
        let workdir = dir.path().join("mirror");
        std::fs::create_dir_all(workdir.join("cache")).unwrap();

        let (removed, failed) = clean_secondary(&surface, workdir.clone(), true).await;
        assert!(failed.is_empty());
        assert_eq!(removed.len(), 3);
        assert!(!workdir.join("cache").exists());

        let broken = SecondarySurface::new("/nonexistent/launcher", None);
        let (removed, failed) = clean_secondary(&broken, workdir, false).await;
        assert!(removed.is_empty());
        assert_eq!(failed.len(), 1);
    }
}

//! Locating the source artifact, downloading it when absent.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::bridge::ExecutionSurface;
use crate::config::ArtifactConfig;
use crate::error::{BridgeError, Result};

/// How a download was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadMode {
    /// Requested with `--download`.
    Explicit,
    /// No local artifact was found.
    Automatic,
}

/// Recorded in the prepare manifest when the artifact was fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadInfo {
    pub downloaded_path: PathBuf,
    pub download_url: String,
    pub mode: DownloadMode,
}

/// What the caller asked for.
#[derive(Debug, Clone, Default)]
pub struct ArtifactRequest {
    /// Host path given on the command line.
    pub explicit_path: Option<PathBuf>,
    /// Download even if a local copy exists.
    pub force_download: bool,
    /// Never download.
    pub no_download: bool,
    /// Overrides the configured URL.
    pub download_url: Option<String>,
}

impl ArtifactRequest {
    pub fn validate(&self) -> Result<()> {
        if self.force_download && self.no_download {
            return Err(BridgeError::Validation {
                field: "download mode",
                value: "download and no-download".to_string(),
                expected: vec!["download", "no-download"],
            });
        }
        Ok(())
    }
}

/// Artifact path in the surface's namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedArtifact {
    pub path: PathBuf,
    pub download: Option<DownloadInfo>,
}

/// Where downloads land on the surface.
pub fn download_target(surface_workdir: &Path, config: &ArtifactConfig) -> PathBuf {
    surface_workdir.join("downloads").join(&config.file_name)
}

/// Resolve the artifact: explicit path, local candidates, then download.
pub async fn resolve_artifact(
    surface: &dyn ExecutionSurface,
    config: &ArtifactConfig,
    request: &ArtifactRequest,
    cwd: &Path,
    surface_workdir: &Path,
) -> Result<ResolvedArtifact> {
    request.validate()?;

    if let Some(explicit) = &request.explicit_path {
        let host_path = if explicit.is_absolute() {
            explicit.clone()
        } else {
            cwd.join(explicit)
        };
        let path = surface.to_surface_path(&host_path);
        if !surface.exists(&path).await? {
            return Err(BridgeError::missing_path(&path));
        }
        return Ok(ResolvedArtifact {
            path,
            download: None,
        });
    }

    let target = download_target(surface_workdir, config);

    if !request.force_download {
        let candidates = [
            surface.to_surface_path(&cwd.join(&config.file_name)),
            target.clone(),
        ];
        for candidate in candidates {
            if surface.exists(&candidate).await? {
                info!(path = %candidate.display(), "Using local artifact");
                return Ok(ResolvedArtifact {
                    path: candidate,
                    download: None,
                });
            }
        }
    }

    if request.no_download {
        return Err(BridgeError::ArtifactNotFound(format!(
            "no {} found. Pass --artifact <path>, place it in {}, or allow downloads",
            config.file_name,
            cwd.display()
        )));
    }

    let url = request
        .download_url
        .clone()
        .unwrap_or_else(|| config.download_url.clone());
    info!(url = %url, dest = %target.display(), "Downloading artifact");
    surface.download(&url, &target).await?;

    Ok(ResolvedArtifact {
        path: target.clone(),
        download: Some(DownloadInfo {
            downloaded_path: target,
            download_url: url,
            mode: if request.force_download {
                DownloadMode::Explicit
            } else {
                DownloadMode::Automatic
            },
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::fake::ScriptedSurface;
    use crate::config::BridgeConfig;
    use crate::runtime::Surface;

    fn artifact_config(cwd: &Path) -> ArtifactConfig {
        BridgeConfig::defaults(cwd).artifact
    }

    #[tokio::test]
    async fn explicit_path_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let surface = ScriptedSurface::new(Surface::Primary);
        let request = ArtifactRequest {
            explicit_path: Some(PathBuf::from("missing.dmg")),
            ..ArtifactRequest::default()
        };
        let err = resolve_artifact(
            &surface,
            &artifact_config(dir.path()),
            &request,
            dir.path(),
            dir.path(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "artifact_not_found");
        assert!(surface.calls().is_empty());
    }

    #[tokio::test]
    async fn local_candidate_beats_download() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Codex.dmg"), b"dmg").unwrap();
        let surface = ScriptedSurface::new(Surface::Primary);

        let resolved = resolve_artifact(
            &surface,
            &artifact_config(dir.path()),
            &ArtifactRequest::default(),
            dir.path(),
            &dir.path().join("work"),
        )
        .await
        .unwrap();
        assert_eq!(resolved.path, dir.path().join("Codex.dmg"));
        assert!(resolved.download.is_none());
    }

    #[tokio::test]
    async fn downloads_when_nothing_local() {
        let dir = tempfile::tempdir().unwrap();
        let surface = ScriptedSurface::new(Surface::Primary);
        let workdir = dir.path().join("work");

        let resolved = resolve_artifact(
            &surface,
            &artifact_config(dir.path()),
            &ArtifactRequest::default(),
            dir.path(),
            &workdir,
        )
        .await
        .unwrap();

        let info = resolved.download.unwrap();
        assert_eq!(info.mode, DownloadMode::Automatic);
        assert_eq!(info.downloaded_path, workdir.join("downloads/Codex.dmg"));
        assert_eq!(
            surface.calls(),
            vec![format!("download {}", crate::config::DEFAULT_DOWNLOAD_URL)]
        );
    }

    #[tokio::test]
    async fn forced_download_skips_local_copy() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Codex.dmg"), b"dmg").unwrap();
        let surface = ScriptedSurface::new(Surface::Primary);
        let request = ArtifactRequest {
            force_download: true,
            download_url: Some("https://example.invalid/App.dmg".to_string()),
            ..ArtifactRequest::default()
        };

        let resolved = resolve_artifact(
            &surface,
            &artifact_config(dir.path()),
            &request,
            dir.path(),
            &dir.path().join("work"),
        )
        .await
        .unwrap();
        let info = resolved.download.unwrap();
        assert_eq!(info.mode, DownloadMode::Explicit);
        assert_eq!(info.download_url, "https://example.invalid/App.dmg");
    }

    #[tokio::test]
    async fn no_download_without_local_copy_fails() {
        let dir = tempfile::tempdir().unwrap();
        let surface = ScriptedSurface::new(Surface::Primary);
        let request = ArtifactRequest {
            no_download: true,
            ..ArtifactRequest::default()
        };
        let err = resolve_artifact(
            &surface,
            &artifact_config(dir.path()),
            &request,
            dir.path(),
            dir.path(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "artifact_not_found");
    }

    #[test]
    fn conflicting_download_flags_are_invalid() {
        let request = ArtifactRequest {
            force_download: true,
            no_download: true,
            ..ArtifactRequest::default()
        };
        assert_eq!(request.validate().unwrap_err().kind(), "validation");
    }
}

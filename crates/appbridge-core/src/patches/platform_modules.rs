use std::path::PathBuf;

use async_trait::async_trait;

use super::{PatchCheck, PatchOutcome, PatchRecipe, PatchTarget};
use crate::error::{BridgeError, Result};

const DARWIN_PACKAGE_DIR: &str = "node_modules/sparkle-darwin";
const DARWIN_BINARY: &str = "sparkle.node";
const SEARCH_DEPTH: usize = 12;
const MAX_REMOVALS: usize = 64;

/// Removes the macOS-only updater module, which cannot load anywhere else.
pub struct StripPlatformModules;

impl StripPlatformModules {
    async fn next_binary(&self, target: &PatchTarget<'_>) -> Result<Option<PathBuf>> {
        target
            .surface
            .find_first(target.app_dir, DARWIN_BINARY, SEARCH_DEPTH)
            .await
    }
}

#[async_trait]
impl PatchRecipe for StripPlatformModules {
    fn id(&self) -> &'static str {
        "strip-darwin-modules-v1"
    }

    async fn apply(&self, target: &PatchTarget<'_>) -> Result<PatchOutcome> {
        let mut removed = Vec::new();

        let package_dir = target.app_dir.join(DARWIN_PACKAGE_DIR);
        if target.surface.exists(&package_dir).await? {
            target.surface.remove_path(&package_dir).await?;
            removed.push(package_dir);
        }

        while let Some(binary) = self.next_binary(target).await? {
            if removed.len() >= MAX_REMOVALS || removed.contains(&binary) {
                return Err(BridgeError::PatchApply {
                    patch_id: self.id().to_string(),
                    reason: format!("could not remove {}", binary.display()),
                });
            }
            target.surface.remove_path(&binary).await?;
            removed.push(binary);
        }

        Ok(if removed.is_empty() {
            PatchOutcome::unchanged("no darwin-only modules present")
        } else {
            PatchOutcome::changed(format!("removed {} darwin-only entries", removed.len()))
        })
    }

    async fn verify(&self, target: &PatchTarget<'_>) -> Result<PatchCheck> {
        if target
            .surface
            .exists(&target.app_dir.join(DARWIN_PACKAGE_DIR))
            .await?
        {
            return Ok(PatchCheck {
                ok: false,
                reason: format!("{DARWIN_PACKAGE_DIR} still present"),
            });
        }
        if let Some(binary) = self.next_binary(target).await? {
            return Ok(PatchCheck {
                ok: false,
                reason: format!("{} still present", binary.display()),
            });
        }
        Ok(PatchCheck {
            ok: true,
            reason: "no darwin-only modules".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::HostSurface;

    #[tokio::test]
    async fn strips_updater_and_stays_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path();
        std::fs::create_dir_all(app.join("node_modules/sparkle-darwin/build")).unwrap();
        std::fs::write(app.join("node_modules/sparkle-darwin/build/sparkle.node"), b"x").unwrap();
        std::fs::create_dir_all(app.join("native/Release")).unwrap();
        std::fs::write(app.join("native/Release/sparkle.node"), b"x").unwrap();
        std::fs::write(app.join("package.json"), b"{}").unwrap();

        let surface = HostSurface::new();
        let target = PatchTarget {
            surface: &surface,
            app_dir: app,
        };
        let recipe = StripPlatformModules;

        let first = recipe.apply(&target).await.unwrap();
        assert!(first.changed);
        assert!(recipe.verify(&target).await.unwrap().ok);
        assert!(app.join("package.json").exists());

        let second = recipe.apply(&target).await.unwrap();
        assert!(!second.changed);
    }
}

//! Idempotent, verifiable mutations of the unpacked application tree.
//!
//! Recipes run in a fixed order. Each supported recipe is applied and then
//! verified unconditionally; a failed verification aborts the run.

mod platform_modules;
mod preload_bridge;

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::bridge::ExecutionSurface;
use crate::error::{BridgeError, Result};
use crate::metadata::AppMetadata;

pub use platform_modules::StripPlatformModules;
pub use preload_bridge::PreloadProcessBridge;

/// The tree a recipe operates on, reached through the active surface.
pub struct PatchTarget<'a> {
    pub surface: &'a dyn ExecutionSurface,
    pub app_dir: &'a Path,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchOutcome {
    pub changed: bool,
    pub reason: String,
}

impl PatchOutcome {
    pub fn changed(reason: impl Into<String>) -> Self {
        Self {
            changed: true,
            reason: reason.into(),
        }
    }

    pub fn unchanged(reason: impl Into<String>) -> Self {
        Self {
            changed: false,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchCheck {
    pub ok: bool,
    pub reason: String,
}

/// Per-recipe record kept in stage outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchResult {
    pub id: String,
    pub changed: bool,
    pub reason: String,
}

/// A single patch.
///
/// `apply` on an already-patched tree must report `changed = false`.
#[async_trait]
pub trait PatchRecipe: Send + Sync {
    fn id(&self) -> &'static str;

    /// Whether this recipe applies. Metadata is absent when patches run before it is read.
    fn supports(&self, _metadata: Option<&AppMetadata>) -> bool {
        true
    }

    async fn apply(&self, target: &PatchTarget<'_>) -> Result<PatchOutcome>;

    async fn verify(&self, target: &PatchTarget<'_>) -> Result<PatchCheck>;
}

/// Ordered set of recipes.
pub struct PatchRegistry {
    recipes: Vec<Box<dyn PatchRecipe>>,
}

impl Default for PatchRegistry {
    fn default() -> Self {
        Self::new(vec![
            Box::new(PreloadProcessBridge),
            Box::new(StripPlatformModules),
        ])
    }
}

impl PatchRegistry {
    pub fn new(recipes: Vec<Box<dyn PatchRecipe>>) -> Self {
        Self { recipes }
    }

    pub fn ids(&self) -> Vec<&'static str> {
        self.recipes.iter().map(|r| r.id()).collect()
    }

    /// Apply and verify every supported recipe in order.
    pub async fn apply_all(
        &self,
        metadata: Option<&AppMetadata>,
        target: &PatchTarget<'_>,
    ) -> Result<Vec<PatchResult>> {
        let mut results = Vec::new();

        for recipe in &self.recipes {
            let id = recipe.id();
            if !recipe.supports(metadata) {
                debug!(patch = %id, "Patch not supported, skipping");
                continue;
            }

            let outcome = recipe.apply(target).await?;
            let check = recipe.verify(target).await?;
            if !check.ok {
                return Err(BridgeError::PatchVerification {
                    patch_id: id.to_string(),
                    reason: check.reason,
                });
            }

            info!(patch = %id, changed = outcome.changed, reason = %outcome.reason, "Patch verified");
            results.push(PatchResult {
                id: id.to_string(),
                changed: outcome.changed,
                reason: outcome.reason,
            });
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::bridge::HostSurface;

    /// Claims it needs no change but never verifies.
    struct Liar {
        verified: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PatchRecipe for Liar {
        fn id(&self) -> &'static str {
            "liar"
        }

        async fn apply(&self, _target: &PatchTarget<'_>) -> Result<PatchOutcome> {
            Ok(PatchOutcome::unchanged("already present"))
        }

        async fn verify(&self, _target: &PatchTarget<'_>) -> Result<PatchCheck> {
            self.verified.fetch_add(1, Ordering::SeqCst);
            Ok(PatchCheck {
                ok: false,
                reason: "marker missing".to_string(),
            })
        }
    }

    struct Unsupported;

    #[async_trait]
    impl PatchRecipe for Unsupported {
        fn id(&self) -> &'static str {
            "unsupported"
        }

        fn supports(&self, _metadata: Option<&AppMetadata>) -> bool {
            false
        }

        async fn apply(&self, _target: &PatchTarget<'_>) -> Result<PatchOutcome> {
            panic!("unsupported recipe must not be applied");
        }

        async fn verify(&self, _target: &PatchTarget<'_>) -> Result<PatchCheck> {
            panic!("unsupported recipe must not be verified");
        }
    }

    #[test]
    fn default_order() {
        assert_eq!(
            PatchRegistry::default().ids(),
            vec!["preload-process-bridge-v1", "strip-darwin-modules-v1"]
        );
    }

    #[tokio::test]
    async fn verify_runs_even_when_nothing_changed() {
        let dir = tempfile::tempdir().unwrap();
        let surface = HostSurface::new();
        let verified = Arc::new(AtomicUsize::new(0));
        let registry = PatchRegistry::new(vec![
            Box::new(Unsupported),
            Box::new(Liar {
                verified: verified.clone(),
            }),
        ]);

        let target = PatchTarget {
            surface: &surface,
            app_dir: dir.path(),
        };
        let err = registry.apply_all(None, &target).await.unwrap_err();

        assert_eq!(verified.load(Ordering::SeqCst), 1);
        assert!(matches!(
            err,
            BridgeError::PatchVerification { ref patch_id, .. } if patch_id == "liar"
        ));
    }
}

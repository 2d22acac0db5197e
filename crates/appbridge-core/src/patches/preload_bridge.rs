use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;

use super::{PatchCheck, PatchOutcome, PatchRecipe, PatchTarget};
use crate::error::{BridgeError, Result};

/// Sandbox preload script, relative to the app root.
pub const PRELOAD_PATH: &str = ".vite/build/preload.js";

const MARKER: &str = r#"exposeInMainWorld("process""#;

/// Anchors tried in order; the injected bridge goes right after the match.
fn anchors() -> &'static [(Regex, &'static str)] {
    static ANCHORS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    ANCHORS.get_or_init(|| {
        [
            (
                r#"([A-Za-z_$][\w$]*)\.contextBridge\.exposeInMainWorld\("electronBridge",[A-Za-z0-9_$]+\);"#,
                "electronBridge",
            ),
            (
                r"(?:([A-Za-z_$][\w$]*)\.)?contextBridge\.exposeInMainWorld\([^)]*electronBridge[^)]*\);",
                "fallback-electronBridge",
            ),
        ]
        .into_iter()
        .filter_map(|(pattern, label)| Regex::new(pattern).ok().map(|re| (re, label)))
        .collect()
    })
}

fn bridge_snippet(receiver: Option<&str>) -> String {
    let bridge = match receiver {
        Some(r) => format!("{r}.contextBridge"),
        None => "contextBridge".to_string(),
    };
    format!(
        "const processBridge={{env:process.env,platform:process.platform,versions:process.versions,\
arch:process.arch,cwd:()=>process.env.PWD||process.cwd(),argv:process.argv,pid:process.pid}};\
{bridge}.exposeInMainWorld(\"process\",processBridge);"
    )
}

/// Insert the process bridge into `source`. `None` when no anchor matches.
pub(crate) fn inject(source: &str) -> Option<(String, &'static str)> {
    anchors().iter().find_map(|(anchor, label)| {
        let caps = anchor.captures(source)?;
        let end = caps.get(0)?.end();
        let receiver = caps.get(1).map(|m| m.as_str());
        let mut patched = String::with_capacity(source.len() + 256);
        patched.push_str(&source[..end]);
        patched.push_str(&bridge_snippet(receiver));
        patched.push_str(&source[end..]);
        Some((patched, *label))
    })
}

/// Exposes a `process` object to the renderer through the preload bridge.
pub struct PreloadProcessBridge;

#[async_trait]
impl PatchRecipe for PreloadProcessBridge {
    fn id(&self) -> &'static str {
        "preload-process-bridge-v1"
    }

    async fn apply(&self, target: &PatchTarget<'_>) -> Result<PatchOutcome> {
        let preload = target.app_dir.join(PRELOAD_PATH);
        if !target.surface.exists(&preload).await? {
            return Ok(PatchOutcome::unchanged("preload file not found"));
        }

        let raw = target.surface.read_file(&preload).await?;
        let source = String::from_utf8_lossy(&raw);
        if source.contains(MARKER) {
            return Ok(PatchOutcome::unchanged("process bridge already present"));
        }

        let (patched, label) = inject(&source).ok_or_else(|| BridgeError::PatchApply {
            patch_id: self.id().to_string(),
            reason: "preload anchor not found".to_string(),
        })?;
        target
            .surface
            .write_file(&preload, patched.as_bytes())
            .await?;

        Ok(PatchOutcome::changed(format!("inserted at {label}")))
    }

    async fn verify(&self, target: &PatchTarget<'_>) -> Result<PatchCheck> {
        let preload = target.app_dir.join(PRELOAD_PATH);
        if !target.surface.exists(&preload).await? {
            return Ok(PatchCheck {
                ok: false,
                reason: "preload file not found".to_string(),
            });
        }

        let raw = target.surface.read_file(&preload).await?;
        let ok = String::from_utf8_lossy(&raw).contains(MARKER);
        Ok(PatchCheck {
            ok,
            reason: if ok {
                "process bridge marker present".to_string()
            } else {
                "process bridge marker missing".to_string()
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::HostSurface;

    const PRELOAD: &str = r#"n.contextBridge.exposeInMainWorld("codexWindowType",A);n.contextBridge.exposeInMainWorld("electronBridge",B);"#;

    fn write_preload(dir: &std::path::Path, body: &str) -> std::path::PathBuf {
        let path = dir.join(PRELOAD_PATH);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn injects_after_the_direct_anchor() {
        let (patched, label) = inject(PRELOAD).unwrap();
        assert_eq!(label, "electronBridge");
        assert!(patched.starts_with(PRELOAD));
        assert!(patched.ends_with(r#"n.contextBridge.exposeInMainWorld("process",processBridge);"#));
    }

    #[test]
    fn fallback_anchor_keeps_receiver() {
        let source = r#"x.contextBridge.exposeInMainWorld( "electronBridge", { send } );tail"#;
        let (patched, label) = inject(source).unwrap();
        assert_eq!(label, "fallback-electronBridge");
        assert!(patched.contains(r#"x.contextBridge.exposeInMainWorld("process""#));
        assert!(patched.ends_with("tail"));
    }

    #[test]
    fn no_anchor_no_patch() {
        assert!(inject("console.log('nothing here');").is_none());
    }

    #[tokio::test]
    async fn apply_is_idempotent_and_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_preload(dir.path(), PRELOAD);
        let surface = HostSurface::new();
        let target = PatchTarget {
            surface: &surface,
            app_dir: dir.path(),
        };
        let recipe = PreloadProcessBridge;

        assert!(recipe.apply(&target).await.unwrap().changed);
        assert!(recipe.verify(&target).await.unwrap().ok);
        let once = std::fs::read_to_string(&path).unwrap();

        let again = recipe.apply(&target).await.unwrap();
        assert!(!again.changed);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), once);
    }

    #[tokio::test]
    async fn missing_preload_fails_verification() {
        let dir = tempfile::tempdir().unwrap();
        let surface = HostSurface::new();
        let target = PatchTarget {
            surface: &surface,
            app_dir: dir.path(),
        };
        let recipe = PreloadProcessBridge;

        assert!(!recipe.apply(&target).await.unwrap().changed);
        assert!(!recipe.verify(&target).await.unwrap().ok);
    }

    #[tokio::test]
    async fn unanchored_preload_is_an_apply_error() {
        let dir = tempfile::tempdir().unwrap();
        write_preload(dir.path(), "module.exports = {};");
        let surface = HostSurface::new();
        let target = PatchTarget {
            surface: &surface,
            app_dir: dir.path(),
        };
        let err = PreloadProcessBridge.apply(&target).await.unwrap_err();
        assert_eq!(err.kind(), "patch_apply");
    }
}

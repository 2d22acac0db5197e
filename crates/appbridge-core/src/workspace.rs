//! Content-addressed working layout.
//!
//! Everything derived from an artifact lives under directories keyed by the
//! artifact's SHA-256 digest and the target architecture tag, so the same
//! artifact always lands in the same place and can be reused.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::bridge::ExecutionSurface;
use crate::error::Result;

const HASH_BUFFER: usize = 64 * 1024;

/// Files whose joint presence marks a completed unpack and patch.
pub const REUSE_MARKERS: [&str; 2] = ["package.json", ".vite/build/preload.js"];

/// Stream a file through SHA-256 in constant memory.
pub async fn hash_artifact(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER];
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Architecture tag of the running host (`win32-x64`, `linux-arm64`, `darwin-arm64`).
pub fn host_arch_tag() -> String {
    let os = match std::env::consts::OS {
        "windows" => "win32",
        "macos" => "darwin",
        other => other,
    };
    let arch = match std::env::consts::ARCH {
        "x86_64" => "x64",
        "aarch64" => "arm64",
        "x86" => "ia32",
        other => other,
    };
    format!("{os}-{arch}")
}

/// Directory set for one `(content hash, architecture)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkPaths {
    pub workdir: PathBuf,
    /// Raw artifact extraction.
    pub extracted_dir: PathBuf,
    /// Staged inner archive and its unpacked sibling.
    pub staged_archive_dir: PathBuf,
    /// Unpacked application tree.
    pub app_dir: PathBuf,
    pub native_root_dir: PathBuf,
    /// Native module build tree; refined to `<native>/<runtimeVersion>-<arch>` once metadata is known.
    pub native_build_dir: PathBuf,
    pub user_data_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub manifests_dir: PathBuf,
}

impl WorkPaths {
    /// Pure derivation: no clock, no randomness, no filesystem access.
    pub fn derive(workdir: &Path, content_hash: &str, arch: &str) -> Self {
        let native_root_dir = workdir.join("native");
        Self {
            workdir: workdir.to_path_buf(),
            extracted_dir: workdir.join("extracted").join(content_hash),
            staged_archive_dir: workdir.join("staged").join(content_hash),
            app_dir: workdir.join("app").join(content_hash),
            native_build_dir: native_root_dir.join(arch),
            native_root_dir,
            user_data_dir: workdir.join("userdata").join(content_hash),
            cache_dir: workdir.join("cache").join(content_hash),
            logs_dir: workdir.join("logs"),
            manifests_dir: workdir.join("manifests"),
        }
    }

    /// Keep run records on the host even when the work tree lives in the secondary shell.
    pub fn with_host_records(mut self, host_workdir: &Path) -> Self {
        self.logs_dir = host_workdir.join("logs");
        self.manifests_dir = host_workdir.join("manifests");
        self
    }

    /// Native build tree for a concrete runtime version.
    pub fn native_build_dir_for(&self, runtime_version: &str, arch: &str) -> PathBuf {
        self.native_root_dir.join(format!("{runtime_version}-{arch}"))
    }

    pub fn reuse_markers(&self) -> Vec<PathBuf> {
        REUSE_MARKERS.iter().map(|m| self.app_dir.join(m)).collect()
    }
}

/// Reuse only if requested and every marker is already present.
pub async fn reuse_eligible(
    requested: bool,
    surface: &dyn ExecutionSurface,
    paths: &WorkPaths,
) -> Result<bool> {
    if !requested {
        return Ok(false);
    }
    for marker in paths.reuse_markers() {
        if !surface.exists(&marker).await? {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::HostSurface;

    #[test]
    fn layout_is_keyed_by_hash() {
        let paths = WorkPaths::derive(Path::new("W"), "abc123", "x64");
        assert_eq!(paths.app_dir, PathBuf::from("W/app/abc123"));
        assert_eq!(paths.extracted_dir, PathBuf::from("W/extracted/abc123"));
        assert_eq!(paths.native_build_dir, PathBuf::from("W/native/x64"));
        assert_eq!(paths.manifests_dir, PathBuf::from("W/manifests"));
    }

    #[test]
    fn layout_is_deterministic() {
        let a = WorkPaths::derive(Path::new("/w"), "deadbeef", "win32-x64");
        let b = WorkPaths::derive(Path::new("/w"), "deadbeef", "win32-x64");
        assert_eq!(a, b);
        assert_ne!(a, WorkPaths::derive(Path::new("/w"), "deadbeef", "linux-x64"));
    }

    #[test]
    fn host_records_relocate_logs_and_manifests_only() {
        let paths = WorkPaths::derive(Path::new("/home/me/work"), "h", "linux-x64")
            .with_host_records(Path::new("C:/work/wsl"));
        assert_eq!(paths.app_dir, PathBuf::from("/home/me/work/app/h"));
        assert_eq!(paths.manifests_dir, PathBuf::from("C:/work/wsl/manifests"));
        assert_eq!(paths.logs_dir, PathBuf::from("C:/work/wsl/logs"));
    }

    #[tokio::test]
    async fn hash_matches_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.bin");
        std::fs::write(&file, b"abc").unwrap();
        assert_eq!(
            hash_artifact(&file).await.unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn hash_spans_buffer_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("big.bin");
        let bytes = vec![7u8; HASH_BUFFER * 2 + 13];
        std::fs::write(&file, &bytes).unwrap();
        assert_eq!(
            hash_artifact(&file).await.unwrap(),
            hex::encode(Sha256::digest(&bytes))
        );
    }

    #[tokio::test]
    async fn reuse_requires_request_and_all_markers() {
        let dir = tempfile::tempdir().unwrap();
        let paths = WorkPaths::derive(dir.path(), "h", "linux-x64");
        let surface = HostSurface::new();

        std::fs::create_dir_all(&paths.app_dir).unwrap();
        std::fs::write(paths.app_dir.join("package.json"), b"{}").unwrap();
        assert!(!reuse_eligible(true, &surface, &paths).await.unwrap());

        std::fs::create_dir_all(paths.app_dir.join(".vite/build")).unwrap();
        std::fs::write(paths.app_dir.join(".vite/build/preload.js"), b"").unwrap();
        assert!(reuse_eligible(true, &surface, &paths).await.unwrap());
        assert!(!reuse_eligible(false, &surface, &paths).await.unwrap());
    }
}

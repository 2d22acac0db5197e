//! Primary surface: the host operating system.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::io::AsyncWriteExt;
use tracing::info;

use super::{run_process, CommandOutput, ExecOptions, ExecutionSurface};
use crate::error::{BridgeError, Result};
use crate::runtime::Surface;
use crate::workspace::{hash_artifact, host_arch_tag};

/// Runs commands as local processes and uses the host filesystem directly.
#[derive(Debug, Clone, Default)]
pub struct HostSurface;

impl HostSurface {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ExecutionSurface for HostSurface {
    fn kind(&self) -> Surface {
        Surface::Primary
    }

    async fn execute(
        &self,
        program: &str,
        args: &[String],
        options: &ExecOptions,
    ) -> Result<CommandOutput> {
        run_process(program, args, options).await
    }

    async fn shell_script(&self, script: &str) -> Result<CommandOutput> {
        let (shell, flag) = if cfg!(windows) {
            ("cmd", "/C")
        } else {
            ("sh", "-c")
        };
        run_process(
            shell,
            &[flag.to_string(), script.to_string()],
            &ExecOptions::default(),
        )
        .await
    }

    fn to_surface_path(&self, host_path: &Path) -> PathBuf {
        host_path.to_path_buf()
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        Ok(tokio::fs::metadata(path).await.is_ok())
    }

    async fn ensure_dir(&self, path: &Path) -> Result<()> {
        tokio::fs::create_dir_all(path).await?;
        Ok(())
    }

    async fn remove_path(&self, path: &Path) -> Result<()> {
        let metadata = match tokio::fs::symlink_metadata(path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if metadata.is_dir() {
            tokio::fs::remove_dir_all(path).await?;
        } else {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }

    async fn copy_file(&self, src: &Path, dst: &Path) -> Result<()> {
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(src, dst).await?;
        Ok(())
    }

    async fn copy_dir_contents(&self, src: &Path, dst: &Path) -> Result<()> {
        let mut pending = vec![(src.to_path_buf(), dst.to_path_buf())];
        while let Some((from, to)) = pending.pop() {
            tokio::fs::create_dir_all(&to).await?;
            let mut entries = tokio::fs::read_dir(&from).await?;
            while let Some(entry) = entries.next_entry().await? {
                let target = to.join(entry.file_name());
                if entry.file_type().await?.is_dir() {
                    pending.push((entry.path(), target));
                } else {
                    tokio::fs::copy(entry.path(), &target).await?;
                }
            }
        }
        Ok(())
    }

    async fn find_first(
        &self,
        root: &Path,
        name: &str,
        max_depth: usize,
    ) -> Result<Option<PathBuf>> {
        Ok(find_first_in(root.to_path_buf(), name.to_string(), 0, max_depth).await)
    }

    async fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(path).await?)
    }

    async fn write_file(&self, path: &Path, contents: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, contents).await?;
        Ok(())
    }

    async fn digest_file(&self, path: &Path) -> Result<String> {
        hash_artifact(path).await
    }

    async fn locate_tool(&self, name: &str, candidates: &[&str]) -> Result<Option<String>> {
        let probe = if cfg!(windows) { "where" } else { "which" };
        if let Ok(out) = run_process(probe, &[name.to_string()], &ExecOptions::default()).await {
            if out.success() {
                if let Some(found) = out.first_line() {
                    return Ok(Some(found.to_string()));
                }
            }
        }

        for candidate in candidates {
            if self.exists(Path::new(candidate)).await? {
                return Ok(Some((*candidate).to_string()));
            }
        }

        Ok(None)
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut response = reqwest::get(url).await?;
        if !response.status().is_success() {
            return Err(BridgeError::Http(format!(
                "Download failed ({}) for {url}",
                response.status()
            )));
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut bytes: u64 = 0;
        while let Some(chunk) = response.chunk().await? {
            bytes += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        info!(url = %url, dest = %dest.display(), bytes = bytes, "Downloaded artifact");
        Ok(())
    }

    async fn arch_tag(&self) -> Result<String> {
        Ok(host_arch_tag())
    }
}

/// Depth-first search that checks a directory's own entries before descending.
fn find_first_in(
    dir: PathBuf,
    name: String,
    depth: usize,
    max_depth: usize,
) -> BoxFuture<'static, Option<PathBuf>> {
    Box::pin(async move {
        if depth > max_depth {
            return None;
        }

        let mut entries = Vec::new();
        let mut reader = tokio::fs::read_dir(&dir).await.ok()?;
        while let Ok(Some(entry)) = reader.next_entry().await {
            entries.push(entry);
        }
        entries.sort_by_key(|e| e.file_name());

        if let Some(hit) = entries.iter().find(|e| e.file_name() == name.as_str()) {
            return Some(hit.path());
        }

        for entry in entries {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            if let Some(found) = find_first_in(entry.path(), name.clone(), depth + 1, max_depth).await
            {
                return Some(found);
            }
        }

        None
    })
}

//! Scripted surface for unit tests: filesystem calls hit the host, command
//! calls are recorded and answered from a queue.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{CommandOutput, ExecOptions, ExecutionSurface, HostSurface};
use crate::error::Result;
use crate::runtime::Surface;

pub(crate) struct ScriptedSurface {
    kind: Surface,
    host: HostSurface,
    responses: Mutex<VecDeque<CommandOutput>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedSurface {
    pub(crate) fn new(kind: Surface) -> Self {
        Self {
            kind,
            host: HostSurface::new(),
            responses: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queue the answer for the next command; unqueued commands succeed silently.
    pub(crate) fn respond(&self, exit_code: i32, stdout: &str) {
        self.responses.lock().unwrap().push_back(CommandOutput {
            exit_code,
            stdout: stdout.to_string(),
            stderr: String::new(),
        });
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn answer(&self, call: String) -> CommandOutput {
        self.calls.lock().unwrap().push(call);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ExecutionSurface for ScriptedSurface {
    fn kind(&self) -> Surface {
        self.kind
    }

    async fn execute(
        &self,
        program: &str,
        args: &[String],
        _options: &ExecOptions,
    ) -> Result<CommandOutput> {
        Ok(self.answer(format!("{program} {}", args.join(" "))))
    }

    async fn shell_script(&self, script: &str) -> Result<CommandOutput> {
        Ok(self.answer(script.to_string()))
    }

    fn to_surface_path(&self, host_path: &Path) -> PathBuf {
        host_path.to_path_buf()
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        self.host.exists(path).await
    }

    async fn ensure_dir(&self, path: &Path) -> Result<()> {
        self.host.ensure_dir(path).await
    }

    async fn remove_path(&self, path: &Path) -> Result<()> {
        self.host.remove_path(path).await
    }

    async fn copy_file(&self, src: &Path, dst: &Path) -> Result<()> {
        self.host.copy_file(src, dst).await
    }

    async fn copy_dir_contents(&self, src: &Path, dst: &Path) -> Result<()> {
        self.host.copy_dir_contents(src, dst).await
    }

    async fn find_first(
        &self,
        root: &Path,
        name: &str,
        max_depth: usize,
    ) -> Result<Option<PathBuf>> {
        self.host.find_first(root, name, max_depth).await
    }

    async fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        self.host.read_file(path).await
    }

    async fn write_file(&self, path: &Path, contents: &[u8]) -> Result<()> {
        self.host.write_file(path, contents).await
    }

    async fn digest_file(&self, path: &Path) -> Result<String> {
        self.host.digest_file(path).await
    }

    async fn locate_tool(&self, name: &str, _candidates: &[&str]) -> Result<Option<String>> {
        Ok(Some(name.to_string()))
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<()> {
        self.calls.lock().unwrap().push(format!("download {url}"));
        self.host.write_file(dest, b"downloaded").await
    }

    async fn arch_tag(&self) -> Result<String> {
        Ok("linux-x64".to_string())
    }
}

//! Shell bridge: one interface over the two execution surfaces.
//!
//! [`HostSurface`] spawns local processes and touches the host filesystem
//! directly. [`SecondarySurface`] forwards everything into the embedded POSIX
//! shell as `bash -lc` scripts. Stages are written once against
//! [`ExecutionSurface`] and run unchanged on either.

#[cfg(test)]
pub(crate) mod fake;
pub mod host;
pub mod quote;
pub mod secondary;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::{BridgeError, Result};
use crate::runtime::Surface;

pub use host::HostSurface;
pub use quote::{expand_home, parse_distro_list, quote_command, shell_quote, to_secondary_path};
pub use secondary::SecondarySurface;

/// Captured result of one external command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code (-1 when terminated by a signal).
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Convert a non-zero exit into a [`BridgeError::StepFailed`].
    pub fn check(self, step: &str) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            let stderr = if self.stderr.trim().is_empty() {
                format!("{step} exited with code {}", self.exit_code)
            } else {
                self.stderr.clone()
            };
            Err(BridgeError::step(step, self.exit_code, stderr))
        }
    }

    /// First non-empty stdout line, trimmed.
    pub fn first_line(&self) -> Option<&str> {
        self.stdout.lines().map(str::trim).find(|l| !l.is_empty())
    }
}

/// Options for a single command execution.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Working directory, in the surface's own path namespace.
    pub cwd: Option<PathBuf>,
    /// Extra environment variables.
    pub env: BTreeMap<String, String>,
    /// Bytes written to the child's stdin.
    pub stdin: Option<Vec<u8>>,
    /// Hand the terminal to the child instead of capturing output.
    pub inherit_stdio: bool,
}

impl ExecOptions {
    pub fn in_dir(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: Some(cwd.into()),
            ..Self::default()
        }
    }
}

/// One execution surface. Exactly two production implementations exist.
#[async_trait]
pub trait ExecutionSurface: Send + Sync {
    /// Which surface this is.
    fn kind(&self) -> Surface;

    /// Run `program` with `args`.
    async fn execute(
        &self,
        program: &str,
        args: &[String],
        options: &ExecOptions,
    ) -> Result<CommandOutput>;

    /// Run a shell script.
    async fn shell_script(&self, script: &str) -> Result<CommandOutput>;

    /// Translate a host path into this surface's path namespace.
    fn to_surface_path(&self, host_path: &Path) -> PathBuf;

    async fn exists(&self, path: &Path) -> Result<bool>;

    async fn ensure_dir(&self, path: &Path) -> Result<()>;

    /// Remove a file or directory tree. Missing paths are not an error.
    async fn remove_path(&self, path: &Path) -> Result<()>;

    async fn copy_file(&self, src: &Path, dst: &Path) -> Result<()>;

    /// Copy the contents of `src` into `dst`, merging with what is there.
    async fn copy_dir_contents(&self, src: &Path, dst: &Path) -> Result<()>;

    /// Find the first entry named `name` below `root`, at most `max_depth` levels down.
    async fn find_first(&self, root: &Path, name: &str, max_depth: usize)
        -> Result<Option<PathBuf>>;

    async fn read_file(&self, path: &Path) -> Result<Vec<u8>>;

    async fn write_file(&self, path: &Path, contents: &[u8]) -> Result<()>;

    /// Hex SHA-256 of a file, streamed.
    async fn digest_file(&self, path: &Path) -> Result<String>;

    /// Resolve a tool by name, then by explicit candidate locations.
    async fn locate_tool(&self, name: &str, candidates: &[&str]) -> Result<Option<String>>;

    /// Download `url` to `dest`.
    async fn download(&self, url: &str, dest: &Path) -> Result<()>;

    /// Architecture tag used in native module paths (`win32-x64`, `linux-arm64`, ...).
    async fn arch_tag(&self) -> Result<String>;
}

/// Spawn a local process and wait for it.
///
/// This is the only place a child process is created.
pub async fn run_process(
    program: &str,
    args: &[String],
    options: &ExecOptions,
) -> Result<CommandOutput> {
    debug!(program = %program, args = ?args, cwd = ?options.cwd, "Spawning process");

    let mut command = Command::new(program);
    command.args(args).envs(&options.env);
    if let Some(cwd) = &options.cwd {
        command.current_dir(cwd);
    }

    if options.inherit_stdio {
        command
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        let status = command.spawn()?.wait().await?;
        return Ok(CommandOutput {
            exit_code: status.code().unwrap_or(-1),
            ..CommandOutput::default()
        });
    }

    command
        .stdin(if options.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn()?;
    if let Some(input) = &options.stdin {
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input).await?;
            stdin.shutdown().await?;
        }
    }

    let output = child.wait_with_output().await?;
    let result = CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    };

    if !result.stderr.trim().is_empty() {
        debug!(program = %program, stderr = %result.stderr.trim_end(), "Process stderr");
    }

    Ok(result)
}

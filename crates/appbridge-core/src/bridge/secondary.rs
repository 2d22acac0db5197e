//! Secondary surface: the POSIX shell embedded in the host.
//!
//! Every operation becomes `<binary> [-d <distro>] -- bash -lc <script>`.
//! Paths are translated into the shell's namespace and quoted with
//! [`shell_quote`] before they reach a script.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::quote::{expand_home, parse_distro_list, quote_command, shell_quote, to_secondary_path};
use super::{run_process, CommandOutput, ExecOptions, ExecutionSurface};
use crate::error::{BridgeError, Result};
use crate::runtime::Surface;

/// Binaries tried, in order, when locating the secondary shell launcher.
pub const SHELL_BINARY_CANDIDATES: [&str; 2] = ["wsl.exe", "wsl"];

/// Absolute fallback location of the launcher.
pub const SHELL_BINARY_FALLBACK: &str = "/mnt/c/Windows/System32/wsl.exe";

/// Forwards commands into the secondary shell.
#[derive(Debug)]
pub struct SecondarySurface {
    binary: String,
    distro: Option<String>,
    home: OnceCell<String>,
}

impl SecondarySurface {
    /// Surface over an explicit launcher binary and optional distro.
    pub fn new(binary: impl Into<String>, distro: Option<String>) -> Self {
        Self {
            binary: binary.into(),
            distro,
            home: OnceCell::new(),
        }
    }

    /// Locate the launcher and resolve the requested distro against the installed ones.
    pub async fn discover(requested_distro: Option<&str>) -> Result<Self> {
        let binary = resolve_shell_binary().await?;
        let mut surface = Self::new(binary, None);
        if let Some(requested) = requested_distro {
            surface.distro = Some(surface.resolve_distro(requested).await?);
        }
        Ok(surface)
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    pub fn distro(&self) -> Option<&str> {
        self.distro.as_deref()
    }

    /// Launcher arguments wrapping `script`.
    pub fn wrap_args(&self, script: &str) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(distro) = &self.distro {
            args.push("-d".to_string());
            args.push(distro.clone());
        }
        args.extend(
            ["--", "bash", "-lc", script]
                .into_iter()
                .map(str::to_string),
        );
        args
    }

    async fn run_script(&self, script: &str, options: &ExecOptions) -> Result<CommandOutput> {
        let host_options = ExecOptions {
            stdin: options.stdin.clone(),
            inherit_stdio: options.inherit_stdio,
            ..ExecOptions::default()
        };
        run_process(&self.binary, &self.wrap_args(script), &host_options).await
    }

    async fn checked(&self, step: &str, script: &str) -> Result<CommandOutput> {
        debug!(step = %step, "Secondary shell step");
        self.shell_script(script).await?.check(step)
    }

    /// Installed distro names.
    pub async fn list_distros(&self) -> Result<Vec<String>> {
        let out = run_process(
            &self.binary,
            &["-l".to_string(), "-q".to_string()],
            &ExecOptions::default(),
        )
        .await?
        .check("list_distros")?;
        Ok(parse_distro_list(&out.stdout))
    }

    /// Match `requested` case-insensitively against the installed distros.
    pub async fn resolve_distro(&self, requested: &str) -> Result<String> {
        let distros = self.list_distros().await?;
        distros
            .iter()
            .find(|d| d.eq_ignore_ascii_case(requested))
            .cloned()
            .ok_or_else(|| BridgeError::ToolNotFound {
                tool: format!("Secondary shell distro {requested}"),
                hint: format!(
                    "Available: {}",
                    if distros.is_empty() {
                        "none".to_string()
                    } else {
                        distros.join(", ")
                    }
                ),
            })
    }

    /// Home directory inside the secondary shell, queried once per surface.
    pub async fn home_dir(&self) -> Result<String> {
        self.home
            .get_or_try_init(|| async {
                let out = self
                    .checked("resolve_home", r#"printf '%s' "$HOME""#)
                    .await?;
                Ok::<_, BridgeError>(out.stdout.trim().to_string())
            })
            .await
            .cloned()
    }

    /// Expand a `~`-relative path against [`Self::home_dir`].
    pub async fn expand_home_path(&self, path: &str) -> Result<String> {
        if path == "~" || path.starts_with("~/") {
            let home = self.home_dir().await?;
            Ok(expand_home(path, &home))
        } else {
            Ok(path.to_string())
        }
    }

    fn posix(&self, path: &Path) -> String {
        to_secondary_path(&path.to_string_lossy())
    }

    fn quoted(&self, path: &Path) -> String {
        shell_quote(&self.posix(path))
    }
}

#[async_trait]
impl ExecutionSurface for SecondarySurface {
    fn kind(&self) -> Surface {
        Surface::Secondary
    }

    async fn execute(
        &self,
        program: &str,
        args: &[String],
        options: &ExecOptions,
    ) -> Result<CommandOutput> {
        let mut script = String::new();
        if let Some(cwd) = &options.cwd {
            script.push_str(&format!("cd {} && ", self.quoted(cwd)));
        }
        script.push_str("exec ");
        if !options.env.is_empty() {
            script.push_str("env ");
            for (key, value) in &options.env {
                script.push_str(&shell_quote(&format!("{key}={value}")));
                script.push(' ');
            }
        }
        script.push_str(&quote_command(program, args));
        self.run_script(&script, options).await
    }

    async fn shell_script(&self, script: &str) -> Result<CommandOutput> {
        self.run_script(script, &ExecOptions::default()).await
    }

    fn to_surface_path(&self, host_path: &Path) -> PathBuf {
        PathBuf::from(self.posix(host_path))
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        let out = self
            .checked(
                "exists",
                &format!("[ -e {} ] && echo yes || echo no", self.quoted(path)),
            )
            .await?;
        Ok(out.first_line() == Some("yes"))
    }

    async fn ensure_dir(&self, path: &Path) -> Result<()> {
        self.checked("ensure_dir", &format!("mkdir -p {}", self.quoted(path)))
            .await?;
        Ok(())
    }

    async fn remove_path(&self, path: &Path) -> Result<()> {
        self.checked("remove_path", &format!("rm -rf {}", self.quoted(path)))
            .await?;
        Ok(())
    }

    async fn copy_file(&self, src: &Path, dst: &Path) -> Result<()> {
        let parent = dst.parent().unwrap_or(dst);
        self.checked(
            "copy_file",
            &format!(
                "mkdir -p {} && cp {} {}",
                self.quoted(parent),
                self.quoted(src),
                self.quoted(dst)
            ),
        )
        .await?;
        Ok(())
    }

    async fn copy_dir_contents(&self, src: &Path, dst: &Path) -> Result<()> {
        let src_contents = shell_quote(&format!("{}/.", self.posix(src)));
        self.checked(
            "copy_dir_contents",
            &format!(
                "mkdir -p {dst} && cp -a {src_contents} {dst}",
                dst = self.quoted(dst)
            ),
        )
        .await?;
        Ok(())
    }

    async fn find_first(
        &self,
        root: &Path,
        name: &str,
        max_depth: usize,
    ) -> Result<Option<PathBuf>> {
        // find counts the entry itself, the host walker counts directories.
        let out = self
            .checked(
                "find_first",
                &format!(
                    "find {} -maxdepth {} -name {} 2>/dev/null | head -n 1",
                    self.quoted(root),
                    max_depth + 1,
                    shell_quote(name)
                ),
            )
            .await?;
        Ok(out.first_line().map(PathBuf::from))
    }

    /// Reads text files; content travels over stdout.
    async fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        let out = self
            .checked("read_file", &format!("cat {}", self.quoted(path)))
            .await?;
        Ok(out.stdout.into_bytes())
    }

    async fn write_file(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let parent = path.parent().unwrap_or(path);
        let script = format!(
            "mkdir -p {} && cat > {}",
            self.quoted(parent),
            self.quoted(path)
        );
        let options = ExecOptions {
            stdin: Some(contents.to_vec()),
            ..ExecOptions::default()
        };
        self.run_script(&script, &options).await?.check("write_file")?;
        Ok(())
    }

    async fn digest_file(&self, path: &Path) -> Result<String> {
        let out = self
            .checked("hash_artifact", &format!("sha256sum {}", self.quoted(path)))
            .await?;
        let digest: String = out
            .stdout
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase()
            .chars()
            .filter(|c| c.is_ascii_hexdigit())
            .collect();
        if digest.len() != 64 {
            return Err(BridgeError::step(
                "hash_artifact",
                out.exit_code,
                format!("unexpected sha256sum output: {}", out.stdout.trim()),
            ));
        }
        Ok(digest)
    }

    async fn locate_tool(&self, name: &str, candidates: &[&str]) -> Result<Option<String>> {
        let out = self
            .checked(
                "locate_tool",
                &format!("command -v {} || true", shell_quote(name)),
            )
            .await?;
        if let Some(found) = out.first_line() {
            return Ok(Some(found.to_string()));
        }

        for candidate in candidates {
            let out = self
                .checked(
                    "locate_tool",
                    &format!("[ -x {} ] && echo yes || echo no", shell_quote(candidate)),
                )
                .await?;
            if out.first_line() == Some("yes") {
                return Ok(Some((*candidate).to_string()));
            }
        }

        Ok(None)
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<()> {
        let parent = dest.parent().unwrap_or(dest);
        let script = [
            "set -euo pipefail".to_string(),
            format!("mkdir -p {}", self.quoted(parent)),
            format!(
                "curl -L --fail --show-error --retry 3 --retry-delay 5 -o {} {}",
                self.quoted(dest),
                shell_quote(url)
            ),
            format!("[ -s {} ]", self.quoted(dest)),
        ]
        .join("\n");
        self.checked("download_artifact", &script).await?;
        info!(url = %url, dest = %self.posix(dest), "Downloaded artifact in secondary shell");
        Ok(())
    }

    async fn arch_tag(&self) -> Result<String> {
        let out = self.checked("resolve_arch", "uname -m").await?;
        let machine = out.first_line().unwrap_or_default();
        Ok(match machine {
            "x86_64" | "amd64" => "linux-x64".to_string(),
            "aarch64" | "arm64" => "linux-arm64".to_string(),
            other => format!("linux-{other}"),
        })
    }
}

/// Find the secondary shell launcher on the host.
pub async fn resolve_shell_binary() -> Result<String> {
    let probe = if cfg!(windows) { "where" } else { "which" };
    for candidate in SHELL_BINARY_CANDIDATES {
        if let Ok(out) = run_process(probe, &[candidate.to_string()], &ExecOptions::default()).await
        {
            if out.success() {
                return Ok(candidate.to_string());
            }
        }
    }

    if tokio::fs::metadata(SHELL_BINARY_FALLBACK).await.is_ok() {
        return Ok(SHELL_BINARY_FALLBACK.to_string());
    }

    Err(BridgeError::ToolNotFound {
        tool: "Secondary shell launcher (wsl.exe)".to_string(),
        hint: "Install WSL and ensure wsl.exe is on PATH.".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `env -- bash -lc <script>` runs the wrapped script locally.
    fn local_shell() -> SecondarySurface {
        SecondarySurface::new("env", None)
    }

    #[test]
    fn wrap_args_with_and_without_distro() {
        let plain = SecondarySurface::new("wsl.exe", None);
        assert_eq!(plain.wrap_args("true"), vec!["--", "bash", "-lc", "true"]);

        let pinned = SecondarySurface::new("wsl.exe", Some("Ubuntu".to_string()));
        assert_eq!(
            pinned.wrap_args("true"),
            vec!["-d", "Ubuntu", "--", "bash", "-lc", "true"]
        );
    }

    #[tokio::test]
    async fn quoted_arguments_survive_the_shell() {
        let surface = local_shell();
        let tricky = "it's a \"test\" with $HOME and Ünïcødé";
        let out = surface
            .execute("printf", &["%s".to_string(), tricky.to_string()], &ExecOptions::default())
            .await
            .unwrap();
        assert_eq!(out.stdout, tricky);
    }

    #[tokio::test]
    async fn execute_honours_cwd_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let surface = local_shell();
        let mut options = ExecOptions::in_dir(dir.path());
        options
            .env
            .insert("BRIDGE_VALUE".to_string(), "o'brien".to_string());

        let out = surface
            .execute(
                "sh",
                &["-c".to_string(), r#"printf '%s|%s' "$PWD" "$BRIDGE_VALUE""#.to_string()],
                &options,
            )
            .await
            .unwrap();
        let expected_dir = dir.path().canonicalize().unwrap();
        let (pwd, value) = out.stdout.split_once('|').unwrap();
        assert_eq!(Path::new(pwd).canonicalize().unwrap(), expected_dir);
        assert_eq!(value, "o'brien");
    }

    #[tokio::test]
    async fn file_operations_round_through_the_shell() {
        let dir = tempfile::tempdir().unwrap();
        let surface = local_shell();
        let file = dir.path().join("nested dir/it's.txt");

        surface.write_file(&file, b"hello bridge").await.unwrap();
        assert!(surface.exists(&file).await.unwrap());
        assert_eq!(surface.read_file(&file).await.unwrap(), b"hello bridge");

        let found = surface
            .find_first(dir.path(), "it's.txt", 1)
            .await
            .unwrap();
        assert_eq!(found, Some(file.clone()));

        surface.remove_path(&dir.path().join("nested dir")).await.unwrap();
        assert!(!surface.exists(&file).await.unwrap());
    }

    #[tokio::test]
    async fn digest_matches_host_hash() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("artifact.dmg");
        std::fs::write(&file, b"artifact bytes").unwrap();

        let surface = local_shell();
        let remote = surface.digest_file(&file).await.unwrap();
        let local = crate::workspace::hash_artifact(&file).await.unwrap();
        assert_eq!(remote, local);
    }

    #[tokio::test]
    async fn home_is_resolved_and_expanded() {
        let surface = local_shell();
        let home = surface.home_dir().await.unwrap();
        assert!(!home.is_empty());
        assert_eq!(
            surface.expand_home_path("~/work").await.unwrap(),
            format!("{}/work", home.trim_end_matches('/'))
        );
        assert_eq!(surface.expand_home_path("/abs").await.unwrap(), "/abs");
    }
}

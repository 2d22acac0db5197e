//! Operations exposed to the command-line front end.
//!
//! Every command resolves its surface once through a [`Session`]; the
//! prepare and launch commands additionally run under the fallback policy.

pub mod clean;
pub mod launch;
pub mod prepare;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::bridge::{ExecutionSurface, HostSurface, SecondarySurface};
use crate::config::BridgeConfig;
use crate::error::Result;
use crate::manifest::{read_latest, Located};
use crate::preflight;
use crate::runtime::{runtime_workdir, RuntimeOptions, Surface};

pub use crate::runtime::resolve_runtime;
pub use clean::{clean, CleanOptions, CleanReport};
pub use launch::{kill, launch, launch_on, KillReport, LaunchOptions, LaunchReport};
pub use prepare::{prepare, prepare_on, run, PrepareReport, PrepareSummary, RunOptions, RunReport};

/// Inputs shared by every command of one process.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Directory the command was started from.
    pub cwd: PathBuf,
    pub config: BridgeConfig,
    pub runtime: RuntimeOptions,
    /// Per-run log file, when one was opened.
    pub log_path: Option<PathBuf>,
}

/// A connected execution surface and the roots it works under.
pub struct Session {
    pub runtime: RuntimeOptions,
    pub surface: Arc<dyn ExecutionSurface>,
    /// Host root for this surface; logs and manifests live here.
    pub host_workdir: PathBuf,
    /// Working root in the surface's own namespace.
    pub surface_workdir: PathBuf,
}

impl Session {
    /// Connect to the surface `runtime` selects.
    ///
    /// On the secondary surface this discovers the shell launcher, runs
    /// preflight, and expands the `~`-relative working root.
    pub async fn open(config: &BridgeConfig, mut runtime: RuntimeOptions, require_display: bool) -> Result<Self> {
        let host_workdir = runtime_workdir(&config.workdir, runtime.surface);

        match runtime.surface {
            Surface::Primary => Ok(Self::new(
                runtime,
                Arc::new(HostSurface::new()),
                host_workdir.clone(),
                host_workdir,
            )),
            Surface::Secondary => {
                let surface = SecondarySurface::discover(runtime.secondary.distro.as_deref()).await?;
                preflight::check(&surface, require_display)
                    .await?
                    .into_result()?;

                let workdir = surface.expand_home_path(&runtime.secondary.workdir).await?;
                if let Some(cli_path) = runtime.secondary.cli_path.take() {
                    runtime.secondary.cli_path = Some(surface.expand_home_path(&cli_path).await?);
                }
                runtime.secondary.distro = surface.distro().map(str::to_string);
                runtime.secondary.workdir = workdir.clone();
                info!(
                    distro = %surface.distro().unwrap_or("default"),
                    workdir = %workdir,
                    "Secondary shell ready"
                );

                Ok(Self::new(
                    runtime,
                    Arc::new(surface),
                    host_workdir,
                    PathBuf::from(workdir),
                ))
            }
        }
    }

    /// Session over an already-connected surface.
    pub fn new(
        runtime: RuntimeOptions,
        surface: Arc<dyn ExecutionSurface>,
        host_workdir: PathBuf,
        surface_workdir: PathBuf,
    ) -> Self {
        Self {
            runtime,
            surface,
            host_workdir,
            surface_workdir,
        }
    }

    pub fn manifests_dir(&self) -> PathBuf {
        self.host_workdir.join("manifests")
    }
}

/// Most recent manifest under `manifests_root` whose name starts with `prefix`.
pub async fn locate_latest_manifest<T: DeserializeOwned>(
    manifests_root: &Path,
    prefix: &str,
) -> Result<Option<Located<T>>> {
    let found = read_latest(manifests_root, prefix).await?;
    match &found {
        Some(located) => debug!(path = %located.path.display(), "Latest manifest"),
        None => debug!(root = %manifests_root.display(), prefix = %prefix, "No manifest found"),
    }
    Ok(found)
}

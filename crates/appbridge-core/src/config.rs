//! Layered configuration: built-in defaults, `appbridge.config.json`, CLI overrides.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{BridgeError, Result};

/// Configuration file looked up in the invocation directory.
pub const CONFIG_FILE_NAME: &str = "appbridge.config.json";

/// Secondary-shell working root used when nothing else is configured.
pub const DEFAULT_SECONDARY_WORKDIR: &str = "~/.appbridge/work";

/// Artifact location used when no local copy exists.
pub const DEFAULT_DOWNLOAD_URL: &str = "https://persistent.oaistatic.com/codex-app-prod/Codex.dmg";

/// Fully merged configuration.
///
/// Runtime surface and fallback values are kept as raw strings here and are
/// validated only by [`crate::runtime::resolve_runtime`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    /// Primary working root.
    pub workdir: PathBuf,
    /// Preferred execution surface.
    #[serde(default)]
    pub runtime: Option<String>,
    /// Companion CLI binary on the host.
    #[serde(default)]
    pub cli_path: Option<String>,
    pub secondary: SecondaryConfig,
    pub native_build: NativeBuildConfig,
    pub logging: LoggingConfig,
    pub artifact: ArtifactConfig,
    pub app: AppConfig,
}

/// Settings for the secondary shell.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecondaryConfig {
    pub distro: Option<String>,
    pub workdir: Option<String>,
    pub cli_path: Option<String>,
    pub runtime_fallback: Option<String>,
}

/// How native modules are produced for the target runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NativeBuildStrategy {
    /// Rebuild from source, falling back to prebuilt binaries.
    #[default]
    Auto,
    /// Rebuild from source only.
    Rebuild,
    /// Fetch prebuilt binaries only.
    Prebuild,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeBuildConfig {
    pub strategy: NativeBuildStrategy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    pub level: String,
}

/// Where the artifact comes from and what lives inside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactConfig {
    /// File name looked up locally and used for downloads.
    pub file_name: String,
    pub download_url: String,
    /// Inner archive holding the application code tree.
    pub inner_archive_name: String,
    /// Filesystem image nested in the artifact when the inner archive is not directly visible.
    pub disk_image_name: String,
    /// In-image paths of the inner archive and its unpacked sibling.
    pub disk_image_entries: Vec<String>,
    /// Native modules rebuilt for the target runtime.
    pub native_modules: Vec<String>,
}

/// Identity of the packaged application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    /// Prefix of the application's build environment variables (`<PREFIX>_BUILD_NUMBER`).
    pub env_prefix: String,
    /// Companion CLI binary name.
    pub cli_name: String,
}

impl BridgeConfig {
    /// Built-in defaults relative to `cwd`.
    pub fn defaults(cwd: &Path) -> Self {
        Self {
            workdir: cwd.join("work"),
            runtime: None,
            cli_path: None,
            secondary: SecondaryConfig::default(),
            native_build: NativeBuildConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
            },
            artifact: ArtifactConfig {
                file_name: "Codex.dmg".to_string(),
                download_url: DEFAULT_DOWNLOAD_URL.to_string(),
                inner_archive_name: "app.asar".to_string(),
                disk_image_name: "4.hfs".to_string(),
                disk_image_entries: vec![
                    "Codex Installer/Codex.app/Contents/Resources/app.asar".to_string(),
                    "Codex Installer/Codex.app/Contents/Resources/app.asar.unpacked".to_string(),
                ],
                native_modules: vec!["better-sqlite3".to_string(), "node-pty".to_string()],
            },
            app: AppConfig {
                env_prefix: "CODEX".to_string(),
                cli_name: "codex".to_string(),
            },
        }
    }

    /// Environment variable naming the companion CLI (`CODEX_CLI_PATH`).
    pub fn cli_env_var(&self) -> String {
        format!("{}_CLI_PATH", self.app.env_prefix)
    }
}

/// Values supplied on the command line. `None` leaves the lower layer untouched.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub workdir: Option<PathBuf>,
    pub log_level: Option<String>,
    pub runtime: Option<String>,
    pub runtime_fallback: Option<String>,
    pub secondary_distro: Option<String>,
    pub secondary_workdir: Option<String>,
    pub secondary_cli_path: Option<String>,
    pub cli_path: Option<String>,
}

/// Load the effective configuration for an invocation started in `cwd`.
pub async fn load_config(cwd: &Path, overrides: &ConfigOverrides) -> Result<BridgeConfig> {
    let mut merged = serde_json::to_value(BridgeConfig::defaults(cwd))?;

    let config_path = cwd.join(CONFIG_FILE_NAME);
    if tokio::fs::try_exists(&config_path).await.unwrap_or(false) {
        let raw = tokio::fs::read_to_string(&config_path)
            .await
            .map_err(|e| BridgeError::Config(format!("{}: {e}", config_path.display())))?;
        let file: Value = serde_json::from_str(&raw)
            .map_err(|e| BridgeError::Config(format!("{}: {e}", config_path.display())))?;
        if !file.is_object() {
            return Err(BridgeError::Config(format!(
                "{}: expected a JSON object",
                config_path.display()
            )));
        }
        debug!(path = %config_path.display(), "Loaded configuration file");
        merge_values(&mut merged, file);
    }

    let mut config: BridgeConfig = serde_json::from_value(merged)
        .map_err(|e| BridgeError::Config(format!("{}: {e}", config_path.display())))?;
    apply_overrides(&mut config, overrides);

    if config.workdir.is_relative() {
        config.workdir = cwd.join(&config.workdir);
    }

    Ok(config)
}

/// Field-wise merge: objects recurse, everything else replaces.
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge_values(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

fn apply_overrides(config: &mut BridgeConfig, overrides: &ConfigOverrides) {
    fn set<T: Clone>(slot: &mut T, value: &Option<T>) {
        if let Some(value) = value {
            *slot = value.clone();
        }
    }
    fn set_opt<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
        if value.is_some() {
            *slot = value.clone();
        }
    }

    set(&mut config.workdir, &overrides.workdir);
    set(&mut config.logging.level, &overrides.log_level);
    set_opt(&mut config.runtime, &overrides.runtime);
    set_opt(&mut config.cli_path, &overrides.cli_path);
    set_opt(&mut config.secondary.distro, &overrides.secondary_distro);
    set_opt(&mut config.secondary.workdir, &overrides.secondary_workdir);
    set_opt(&mut config.secondary.cli_path, &overrides.secondary_cli_path);
    set_opt(
        &mut config.secondary.runtime_fallback,
        &overrides.runtime_fallback,
    );
}

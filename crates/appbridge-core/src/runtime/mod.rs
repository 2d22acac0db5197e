//! Runtime resolution: which execution surface runs a command and what
//! happens when the secondary surface fails.

pub mod fallback;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::{BridgeConfig, DEFAULT_SECONDARY_WORKDIR};
use crate::error::{BridgeError, Result};

pub use fallback::{run_with_fallback, Prompter, TerminalPrompter};

/// Subdirectory of the primary working root reserved for secondary-surface runs.
pub const SECONDARY_WORKDIR_NAME: &str = "wsl";

/// Execution surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Surface {
    /// The host operating system.
    Primary,
    /// The POSIX shell embedded in the host.
    Secondary,
}

impl Surface {
    pub const VALID: [&'static str; 2] = ["primary", "secondary"];

    pub fn as_str(&self) -> &'static str {
        match self {
            Surface::Primary => "primary",
            Surface::Secondary => "secondary",
        }
    }
}

impl fmt::Display for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Surface {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "primary" | "host" | "windows" => Ok(Surface::Primary),
            "secondary" | "wsl" => Ok(Surface::Secondary),
            _ => Err(BridgeError::Validation {
                field: "runtime",
                value: s.to_string(),
                expected: Self::VALID.to_vec(),
            }),
        }
    }
}

/// What to do when the secondary surface fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackPolicy {
    /// Ask on an interactive terminal; otherwise fail with a hint.
    #[default]
    Prompt,
    /// Retry on the primary surface after a warning.
    Primary,
    /// Propagate the failure.
    None,
}

impl FallbackPolicy {
    pub const VALID: [&'static str; 3] = ["prompt", "primary", "none"];

    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackPolicy::Prompt => "prompt",
            FallbackPolicy::Primary => "primary",
            FallbackPolicy::None => "none",
        }
    }
}

impl fmt::Display for FallbackPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FallbackPolicy {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "prompt" => Ok(FallbackPolicy::Prompt),
            "primary" | "windows" => Ok(FallbackPolicy::Primary),
            "none" => Ok(FallbackPolicy::None),
            _ => Err(BridgeError::Validation {
                field: "runtime fallback",
                value: s.to_string(),
                expected: Self::VALID.to_vec(),
            }),
        }
    }
}

/// Secondary-shell settings after resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecondaryOptions {
    pub distro: Option<String>,
    /// Working root inside the secondary shell; may still be `~`-relative.
    pub workdir: String,
    pub cli_path: Option<String>,
}

/// Resolved runtime for one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeOptions {
    pub surface: Surface,
    pub fallback: FallbackPolicy,
    pub secondary: SecondaryOptions,
}

impl RuntimeOptions {
    /// Same options, pinned to `surface`.
    pub fn with_surface(&self, surface: Surface) -> Self {
        Self {
            surface,
            ..self.clone()
        }
    }
}

/// Runtime-related command-line values.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub runtime: Option<String>,
    pub runtime_fallback: Option<String>,
    pub secondary_distro: Option<String>,
    pub secondary_workdir: Option<String>,
    pub secondary_cli_path: Option<String>,
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Resolve surface and fallback policy.
///
/// Surface: explicit CLI value, then configuration, then inference from
/// secondary-only CLI options, then primary. Fallback: CLI, configuration,
/// then prompt. Explicit CLI values are validated before configuration is read.
pub fn resolve_runtime(config: &BridgeConfig, cli: &RuntimeOverrides) -> Result<RuntimeOptions> {
    let cli_surface = non_empty(cli.runtime.as_deref())
        .map(Surface::from_str)
        .transpose()?;
    let cli_fallback = non_empty(cli.runtime_fallback.as_deref())
        .map(FallbackPolicy::from_str)
        .transpose()?;

    let config_surface = non_empty(config.runtime.as_deref())
        .map(Surface::from_str)
        .transpose()?;
    let config_fallback = non_empty(config.secondary.runtime_fallback.as_deref())
        .map(FallbackPolicy::from_str)
        .transpose()?;

    let inferred = [
        &cli.secondary_distro,
        &cli.secondary_workdir,
        &cli.secondary_cli_path,
    ]
    .iter()
    .any(|v| non_empty(v.as_deref()).is_some())
    .then_some(Surface::Secondary);

    let surface = cli_surface
        .or(config_surface)
        .or(inferred)
        .unwrap_or(Surface::Primary);
    let fallback = cli_fallback.or(config_fallback).unwrap_or_default();

    let pick = |cli: &Option<String>, config: &Option<String>| {
        non_empty(cli.as_deref())
            .or(non_empty(config.as_deref()))
            .map(str::to_string)
    };

    Ok(RuntimeOptions {
        surface,
        fallback,
        secondary: SecondaryOptions {
            distro: pick(&cli.secondary_distro, &config.secondary.distro),
            workdir: pick(&cli.secondary_workdir, &config.secondary.workdir)
                .unwrap_or_else(|| DEFAULT_SECONDARY_WORKDIR.to_string()),
            cli_path: pick(&cli.secondary_cli_path, &config.secondary.cli_path),
        },
    })
}

/// Working root on the host for `surface`; secondary runs never share a tree with primary runs.
pub fn runtime_workdir(base: &Path, surface: Surface) -> PathBuf {
    match surface {
        Surface::Primary => base.to_path_buf(),
        Surface::Secondary => base.join(SECONDARY_WORKDIR_NAME),
    }
}

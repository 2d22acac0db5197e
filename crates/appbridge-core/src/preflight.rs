//! Dependency preflight for the secondary shell.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::bridge::{shell_quote, ExecutionSurface};
use crate::error::{BridgeError, Result};

/// Tools every secondary-shell run needs.
pub const REQUIRED_TOOLS: [&str; 7] = ["node", "npm", "npx", "git", "7z", "curl", "python3"];

const MISSING_PREFIX: &str = "missing:";
const DISPLAY_PREFIX: &str = "display:";

/// Aggregated preflight outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreflightReport {
    pub ok: bool,
    pub missing_tools: Vec<String>,
    pub display_available: bool,
    pub display_required: bool,
}

impl PreflightReport {
    /// One line per failing condition.
    pub fn issues(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if !self.missing_tools.is_empty() {
            issues.push(format!(
                "Missing tools in secondary shell: {}",
                self.missing_tools.join(", ")
            ));
        }
        if self.display_required && !self.display_available {
            issues.push(
                "No graphical display in secondary shell (WAYLAND_DISPLAY and DISPLAY are unset). \
                 Enable WSLg or start an X server."
                    .to_string(),
            );
        }
        issues
    }

    /// `Ok(self)` when every check passed, otherwise a [`BridgeError::ToolMissing`].
    pub fn into_result(self) -> Result<Self> {
        if self.ok {
            Ok(self)
        } else {
            Err(self.into_error())
        }
    }

    pub fn into_error(self) -> BridgeError {
        BridgeError::ToolMissing(self)
    }
}

/// Probe script: one round trip for every tool plus the display signal.
fn probe_script() -> String {
    let tools = REQUIRED_TOOLS
        .iter()
        .map(|t| shell_quote(t))
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "missing=''; for tool in {tools}; do command -v \"$tool\" >/dev/null 2>&1 || missing=\"$missing $tool\"; done; \
         echo \"{MISSING_PREFIX}$missing\"; \
         if [ -n \"${{WAYLAND_DISPLAY:-}}\" ] || [ -n \"${{DISPLAY:-}}\" ]; then echo '{DISPLAY_PREFIX}yes'; else echo '{DISPLAY_PREFIX}no'; fi"
    )
}

/// Check required tools and, when `require_display`, a graphical display.
pub async fn check(surface: &dyn ExecutionSurface, require_display: bool) -> Result<PreflightReport> {
    let out = surface.shell_script(&probe_script()).await?.check("preflight")?;

    let mut missing_tools = Vec::new();
    let mut display_available = false;
    for line in out.stdout.lines().map(str::trim) {
        if let Some(rest) = line.strip_prefix(MISSING_PREFIX) {
            missing_tools.extend(rest.split_whitespace().map(str::to_string));
        } else if let Some(rest) = line.strip_prefix(DISPLAY_PREFIX) {
            display_available = rest == "yes";
        }
    }

    let ok = missing_tools.is_empty() && (display_available || !require_display);
    let report = PreflightReport {
        ok,
        missing_tools,
        display_available,
        display_required: require_display,
    };

    if report.ok {
        info!(display = display_available, "Secondary shell preflight passed");
    } else {
        warn!(missing = ?report.missing_tools, display = display_available, "Secondary shell preflight failed");
    }

    Ok(report)
}

//! Artifact metadata read from the unpacked application's `package.json`.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bridge::ExecutionSurface;
use crate::error::{BridgeError, Result};

/// Package descriptor inside the application root.
pub const PACKAGE_DESCRIPTOR: &str = "package.json";

const RUNTIME_PACKAGE: &str = "electron";
const DEPENDENCY_SECTIONS: [&str; 3] = ["devDependencies", "dependencies", "optionalDependencies"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppMetadata {
    pub package_name: Option<String>,
    pub package_version: Option<String>,
    /// Desktop runtime version the app was built against.
    pub runtime_version: String,
    /// Declared version of each configured native module, when present.
    pub native_module_versions: BTreeMap<String, String>,
    pub build_number: Option<String>,
    pub build_flavor: Option<String>,
}

impl AppMetadata {
    /// Pinned `name@version` spec for a native module.
    pub fn native_module_spec(&self, module: &str) -> Result<String> {
        self.native_module_versions
            .get(module)
            .map(|version| format!("{module}@{version}"))
            .ok_or_else(|| {
                BridgeError::Metadata(format!(
                    "native module {module} has no declared version in {PACKAGE_DESCRIPTOR}"
                ))
            })
    }
}

fn string_field(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse a package descriptor.
///
/// `build_key_prefix` selects the build fields (`codex` reads
/// `codexBuildNumber` and `codexBuildFlavor`).
pub fn parse_app_metadata(
    raw: &[u8],
    native_modules: &[String],
    build_key_prefix: &str,
) -> Result<AppMetadata> {
    let pkg: Value = serde_json::from_slice(raw)
        .map_err(|e| BridgeError::Metadata(format!("{PACKAGE_DESCRIPTOR} is not valid JSON: {e}")))?;

    let runtime_version = DEPENDENCY_SECTIONS
        .iter()
        .find_map(|section| string_field(pkg.get(section).and_then(|s| s.get(RUNTIME_PACKAGE))))
        .ok_or_else(|| {
            BridgeError::Metadata(format!(
                "{RUNTIME_PACKAGE} version not found in {PACKAGE_DESCRIPTOR}"
            ))
        })?;

    let native_module_versions = native_modules
        .iter()
        .filter_map(|module| {
            string_field(pkg.get("dependencies").and_then(|d| d.get(module)))
                .map(|version| (module.clone(), version))
        })
        .collect();

    Ok(AppMetadata {
        package_name: string_field(pkg.get("name")),
        package_version: string_field(pkg.get("version")),
        runtime_version,
        native_module_versions,
        build_number: string_field(pkg.get(format!("{build_key_prefix}BuildNumber"))),
        build_flavor: string_field(pkg.get(format!("{build_key_prefix}BuildFlavor"))),
    })
}

/// Read metadata from `app_dir` on `surface`. Fails if the descriptor is absent.
pub async fn read_app_metadata(
    surface: &dyn ExecutionSurface,
    app_dir: &Path,
    native_modules: &[String],
    build_key_prefix: &str,
) -> Result<AppMetadata> {
    let descriptor = app_dir.join(PACKAGE_DESCRIPTOR);
    if !surface.exists(&descriptor).await? {
        return Err(BridgeError::Metadata(format!(
            "{PACKAGE_DESCRIPTOR} missing from app dir: {}",
            descriptor.display()
        )));
    }
    let raw = surface.read_file(&descriptor).await?;
    parse_app_metadata(&raw, native_modules, build_key_prefix)
}

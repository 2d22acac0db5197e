//! Error types for appbridge-core

use std::path::Path;

use serde_json::{json, Value};
use thiserror::Error;

use crate::pipeline::StageResult;
use crate::preflight::PreflightReport;

/// Errors that can occur while preparing, launching, or cleaning an app.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// A runtime surface or fallback policy value outside its enumeration.
    #[error("Invalid {field}: {value}. Expected one of: {}", expected.join(", "))]
    Validation {
        field: &'static str,
        value: String,
        expected: Vec<&'static str>,
    },

    /// Aggregated preflight failure for the secondary shell.
    #[error("Secondary shell preflight checks failed.\n{}", .0.issues().join("\n"))]
    ToolMissing(PreflightReport),

    /// Required tool could not be found at all.
    #[error("{tool} not found. {hint}")]
    ToolNotFound { tool: String, hint: String },

    /// A pipeline stage failed; carries the partial success record.
    #[error("Stage failed: {}: {}", .0.failed_stage, .0.cause)]
    StageExecution(Box<PipelineExecutionError>),

    /// The secondary surface failed and no fallback was taken.
    #[error("{source}{}", hint.as_deref().map(|h| format!("\n{h}")).unwrap_or_default())]
    SecondaryRuntime {
        #[source]
        source: Box<BridgeError>,
        hint: Option<String>,
    },

    /// A patch did not verify after being applied.
    #[error("Patch verification failed: {patch_id} ({reason})")]
    PatchVerification { patch_id: String, reason: String },

    /// A patch could not be applied.
    #[error("Patch {patch_id} could not be applied: {reason}")]
    PatchApply { patch_id: String, reason: String },

    /// Native module binaries missing after preparation.
    #[error("Native verification failed. Missing files: {}", missing.join(", "))]
    NativeVerification { missing: Vec<String> },

    /// External step exited unsuccessfully.
    #[error("{step} failed (exit code {code}): {stderr}")]
    StepFailed {
        step: String,
        code: i32,
        stderr: String,
    },

    /// Source artifact missing.
    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    /// Unpacked application tree is missing something essential.
    #[error("Invalid application tree: {0}")]
    Metadata(String),

    /// Manifest could not be located or decoded.
    #[error("Manifest error: {0}")]
    Manifest(String),

    /// Configuration file could not be loaded.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A stage ran before the state it needs was produced.
    #[error("Pipeline state incomplete: {0} not resolved")]
    State(&'static str),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error (artifact downloads)
    #[error("HTTP error: {0}")]
    Http(String),
}

impl From<reqwest::Error> for BridgeError {
    fn from(err: reqwest::Error) -> Self {
        BridgeError::Http(err.to_string())
    }
}

/// Result type for appbridge-core operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// A failed stage together with every stage that succeeded before it.
#[derive(Debug, Error)]
#[error("Stage failed: {failed_stage}")]
pub struct PipelineExecutionError {
    pub failed_stage: String,
    pub duration_ms: u64,
    pub previous_results: Vec<StageResult>,
    pub cause: String,
    #[source]
    pub source: BridgeError,
}

impl BridgeError {
    /// Short machine-readable tag for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::Validation { .. } => "validation",
            BridgeError::ToolMissing(_) => "tool_missing",
            BridgeError::ToolNotFound { .. } => "tool_not_found",
            BridgeError::StageExecution(_) => "stage_execution",
            BridgeError::SecondaryRuntime { .. } => "secondary_runtime",
            BridgeError::PatchVerification { .. } => "patch_verification",
            BridgeError::PatchApply { .. } => "patch_apply",
            BridgeError::NativeVerification { .. } => "native_verification",
            BridgeError::StepFailed { .. } => "step_failed",
            BridgeError::ArtifactNotFound(_) => "artifact_not_found",
            BridgeError::Metadata(_) => "metadata",
            BridgeError::Manifest(_) => "manifest",
            BridgeError::Config(_) => "config",
            BridgeError::State(_) => "state",
            BridgeError::Io(_) => "io",
            BridgeError::Json(_) => "json",
            BridgeError::Http(_) => "http",
        }
    }

    /// Machine-readable details object for the top-level boundary.
    pub fn details(&self) -> Value {
        match self {
            BridgeError::Validation {
                field,
                value,
                expected,
            } => json!({
                "kind": self.kind(),
                "field": field,
                "value": value,
                "expected": expected,
            }),
            BridgeError::ToolMissing(report) => json!({
                "kind": self.kind(),
                "missingTools": report.missing_tools,
                "displayAvailable": report.display_available,
                "issues": report.issues(),
            }),
            BridgeError::StageExecution(err) => json!({
                "kind": self.kind(),
                "stage": err.failed_stage,
                "durationMs": err.duration_ms,
                "previousResults": err.previous_results,
                "cause": err.cause,
                "causeKind": err.source.kind(),
            }),
            BridgeError::SecondaryRuntime { source, hint } => json!({
                "kind": self.kind(),
                "hint": hint,
                "cause": source.details(),
            }),
            BridgeError::PatchVerification { patch_id, reason }
            | BridgeError::PatchApply { patch_id, reason } => json!({
                "kind": self.kind(),
                "patchId": patch_id,
                "reason": reason,
            }),
            BridgeError::NativeVerification { missing } => json!({
                "kind": self.kind(),
                "missing": missing,
            }),
            BridgeError::StepFailed { step, code, stderr } => json!({
                "kind": self.kind(),
                "step": step,
                "code": code,
                "stderr": stderr,
            }),
            other => json!({
                "kind": other.kind(),
                "message": other.to_string(),
            }),
        }
    }

    /// Whether a patch verification failure is anywhere in this error chain.
    pub fn is_patch_verification(&self) -> bool {
        match self {
            BridgeError::PatchVerification { .. } => true,
            BridgeError::StageExecution(err) => err.source.is_patch_verification(),
            BridgeError::SecondaryRuntime { source, .. } => source.is_patch_verification(),
            _ => false,
        }
    }

    pub(crate) fn step(step: impl Into<String>, code: i32, stderr: impl Into<String>) -> Self {
        BridgeError::StepFailed {
            step: step.into(),
            code,
            stderr: stderr.into().trim().to_string(),
        }
    }

    pub(crate) fn missing_path(path: &Path) -> Self {
        BridgeError::ArtifactNotFound(path.display().to_string())
    }
}

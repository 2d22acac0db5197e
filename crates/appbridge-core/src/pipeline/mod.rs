//! Ordered stage execution over one shared context.
//!
//! Stages run strictly in sequence: a stage may depend on filesystem side
//! effects of the one before it. The first failure aborts the run and is
//! wrapped together with every result collected so far.

pub mod context;
pub mod stages;

use std::time::Instant;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::error::{BridgeError, PipelineExecutionError, Result};

pub use context::{PipelineContext, PrepareOptions};
pub use stages::{prepare_stage_names, prepare_stages};

/// What a stage hands back on success.
#[derive(Debug, Clone, Default)]
pub struct StageOutput {
    pub outputs: Value,
    pub warnings: Vec<String>,
}

impl StageOutput {
    pub fn new(outputs: Value) -> Self {
        Self {
            outputs,
            warnings: Vec::new(),
        }
    }

    /// Output of a stage that did nothing because of a reuse hit.
    pub fn skipped(warning: impl Into<String>) -> Self {
        Self::new(json!({ "skipped": true })).with_warning(warning)
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn with_warnings(mut self, warnings: impl IntoIterator<Item = String>) -> Self {
        self.warnings.extend(warnings);
        self
    }
}

/// Normalised record of one successful stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageResult {
    pub stage: String,
    pub duration_ms: u64,
    pub warnings: Vec<String>,
    pub outputs: Value,
}

/// One named step of a pipeline.
#[async_trait]
pub trait Stage<C: Send>: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, ctx: &mut C) -> Result<StageOutput>;
}

/// Context that remembers what each finished stage produced.
pub trait PipelineState {
    fn record_stage(&mut self, result: &StageResult);
}

/// Handler signature for a [`StageDescriptor`].
pub type StageHandler<C> = for<'a> fn(&'a mut C) -> BoxFuture<'a, Result<StageOutput>>;

/// A stage given by name and plain handler function.
pub struct StageDescriptor<C> {
    pub name: &'static str,
    pub handler: StageHandler<C>,
}

impl<C> StageDescriptor<C> {
    pub const fn new(name: &'static str, handler: StageHandler<C>) -> Self {
        Self { name, handler }
    }
}

#[async_trait]
impl<C: Send> Stage<C> for StageDescriptor<C> {
    fn name(&self) -> &str {
        self.name
    }

    async fn run(&self, ctx: &mut C) -> Result<StageOutput> {
        (self.handler)(ctx).await
    }
}

/// Run `stages` in order against `ctx`.
pub async fn run_pipeline<C>(stages: &[Box<dyn Stage<C>>], ctx: &mut C) -> Result<Vec<StageResult>>
where
    C: PipelineState + Send,
{
    let mut results: Vec<StageResult> = Vec::with_capacity(stages.len());

    for stage in stages {
        let name = stage.name();
        let start = Instant::now();
        info!(stage = %name, "Running stage");

        match stage.run(ctx).await {
            Ok(output) => {
                let duration_ms = start.elapsed().as_millis() as u64;
                for warning in &output.warnings {
                    warn!(stage = %name, "{warning}");
                }
                info!(stage = %name, duration_ms = duration_ms, "Stage completed");

                let result = StageResult {
                    stage: name.to_string(),
                    duration_ms,
                    warnings: output.warnings,
                    outputs: output.outputs,
                };
                ctx.record_stage(&result);
                results.push(result);
            }
            Err(source) => {
                let duration_ms = start.elapsed().as_millis() as u64;
                error!(stage = %name, duration_ms = duration_ms, error = %source, "Stage failed");
                return Err(BridgeError::StageExecution(Box::new(PipelineExecutionError {
                    failed_stage: name.to_string(),
                    duration_ms,
                    previous_results: results,
                    cause: source.to_string(),
                    source,
                })));
            }
        }
    }

    Ok(results)
}

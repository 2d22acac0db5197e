//! AppBridge CLI
//!
//! The `appbridge` command prepares a packaged desktop app built for another
//! platform and launches it on the host or inside the embedded POSIX shell.
//!
//! ## Commands
//!
//! - `prepare`: Extract, patch, and rebuild native modules for the artifact
//! - `launch`: Start the most recently prepared app
//! - `run`: Prepare, then launch
//! - `clean`: Remove working data
//! - `kill`: Stop running app processes
//! - `manifest`: Show the latest prepare or launch manifest
//! - `stages`: List the prepare stages in order

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use tracing::debug;

use appbridge_core::{
    clean, kill, launch, load_config, locate_latest_manifest, prepare, prepare_stage_names,
    resolve_runtime, run, runtime_workdir, ArtifactRequest, BridgeError, CleanOptions,
    ConfigOverrides, Invocation, LaunchOptions, PrepareOptions, RunOptions, RuntimeOverrides,
    TerminalPrompter, LAUNCH_PREFIX, PREPARE_PREFIX,
};

#[derive(Parser)]
#[command(name = "appbridge")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Prepare and launch packaged desktop apps on a foreign host", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Working directory root (default: ./work)
    #[arg(long, global = true)]
    workdir: Option<PathBuf>,

    /// Log level when RUST_LOG is unset
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Execution surface: primary or secondary
    #[arg(long, global = true, env = "APPBRIDGE_RUNTIME")]
    runtime: Option<String>,

    /// What to do when the secondary surface fails: prompt, primary, or none
    #[arg(long, global = true)]
    runtime_fallback: Option<String>,

    /// Secondary shell distro
    #[arg(long, global = true)]
    secondary_distro: Option<String>,

    /// Working root inside the secondary shell
    #[arg(long, global = true)]
    secondary_workdir: Option<String>,

    /// Companion CLI path inside the secondary shell
    #[arg(long, global = true)]
    secondary_cli: Option<String>,

    /// Companion CLI path on the host
    #[arg(long, global = true)]
    cli_path: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct PrepareArgs {
    /// Artifact to prepare (default: look in the current directory, then download)
    #[arg(long, alias = "dmg")]
    artifact: Option<PathBuf>,

    /// Reuse a previously unpacked tree for the same artifact
    #[arg(long)]
    reuse: bool,

    /// Download the artifact even if a local copy exists
    #[arg(long, conflicts_with = "no_download")]
    download: bool,

    /// Never download the artifact
    #[arg(long)]
    no_download: bool,

    /// Download from this URL instead of the configured one
    #[arg(long)]
    download_url: Option<String>,
}

impl PrepareArgs {
    fn options(&self) -> PrepareOptions {
        PrepareOptions {
            artifact: ArtifactRequest {
                explicit_path: self.artifact.clone(),
                force_download: self.download,
                no_download: self.no_download,
                download_url: self.download_url.clone(),
            },
            reuse: self.reuse,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ManifestKindArg {
    Prepare,
    Launch,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract, patch, and rebuild native modules for the artifact
    Prepare(PrepareArgs),

    /// Launch a prepared app
    Launch {
        /// Prepare manifest to launch (default: the latest one)
        #[arg(long)]
        prepare_manifest: Option<PathBuf>,
    },

    /// Prepare, then launch
    Run {
        #[command(flatten)]
        prepare: PrepareArgs,

        /// Stop after prepare
        #[arg(long)]
        no_launch: bool,
    },

    /// Remove working data
    Clean {
        /// Remove only cache, logs, and manifests
        #[arg(long)]
        cache_only: bool,
    },

    /// Stop running app processes
    Kill,

    /// Show the latest manifest of a kind
    Manifest {
        #[arg(long, value_enum, default_value = "prepare")]
        kind: ManifestKindArg,
    },

    /// List the prepare stages in order
    Stages,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(err) = dispatch(cli).await {
        eprintln!("Error: {err:#}");
        if let Some(bridge) = err.downcast_ref::<BridgeError>() {
            if let Ok(details) = serde_json::to_string_pretty(&bridge.details()) {
                eprintln!("{details}");
            }
        }
        std::process::exit(1);
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("Failed to render result")?;
    println!("{rendered}");
    Ok(())
}

async fn dispatch(cli: Cli) -> Result<()> {
    if let Commands::Stages = cli.command {
        return print_json(&prepare_stage_names());
    }

    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    let overrides = ConfigOverrides {
        workdir: cli.workdir.clone(),
        log_level: cli.log_level.clone(),
        runtime: cli.runtime.clone(),
        runtime_fallback: cli.runtime_fallback.clone(),
        secondary_distro: cli.secondary_distro.clone(),
        secondary_workdir: cli.secondary_workdir.clone(),
        secondary_cli_path: cli.secondary_cli.clone(),
        cli_path: cli.cli_path.clone(),
    };
    let config = load_config(&cwd, &overrides).await?;
    let runtime = resolve_runtime(
        &config,
        &RuntimeOverrides {
            runtime: cli.runtime.clone(),
            runtime_fallback: cli.runtime_fallback.clone(),
            secondary_distro: cli.secondary_distro.clone(),
            secondary_workdir: cli.secondary_workdir.clone(),
            secondary_cli_path: cli.secondary_cli.clone(),
        },
    )?;

    let host_workdir = runtime_workdir(&config.workdir, runtime.surface);
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    let log_dir = match cli.command {
        Commands::Prepare(_) | Commands::Launch { .. } | Commands::Run { .. } => {
            Some(host_workdir.join("logs"))
        }
        _ => None,
    };
    let log_path = appbridge_core::init_tracing(cli.json, &level, log_dir.as_deref());
    debug!(surface = %runtime.surface, fallback = %runtime.fallback, "Runtime resolved");

    let invocation = Invocation {
        cwd,
        config,
        runtime,
        log_path,
    };
    let prompter = TerminalPrompter;

    match cli.command {
        Commands::Prepare(args) => {
            print_json(&prepare(&invocation, &args.options(), &prompter).await?)
        }
        Commands::Launch { prepare_manifest } => {
            let options = LaunchOptions { prepare_manifest };
            print_json(&launch(&invocation, &options, &prompter).await?)
        }
        Commands::Run { prepare, no_launch } => {
            let options = RunOptions {
                prepare: prepare.options(),
                no_launch,
            };
            print_json(&run(&invocation, &options, &prompter).await?)
        }
        Commands::Clean { cache_only } => {
            print_json(&clean(&invocation, &CleanOptions { cache_only }).await?)
        }
        Commands::Kill => print_json(&kill(&invocation).await),
        Commands::Manifest { kind } => {
            let prefix = match kind {
                ManifestKindArg::Prepare => PREPARE_PREFIX,
                ManifestKindArg::Launch => LAUNCH_PREFIX,
            };
            let manifests = host_workdir.join("manifests");
            let latest = locate_latest_manifest::<Value>(&manifests, prefix)
                .await?
                .with_context(|| format!("No {prefix}* manifest in {}", manifests.display()))?;
            print_json(&serde_json::json!({
                "path": latest.path,
                "data": latest.data,
            }))
        }
        Commands::Stages => print_json(&prepare_stage_names()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn prepare_flags_map_to_request() {
        let cli = Cli::parse_from([
            "appbridge",
            "prepare",
            "--dmg",
            "Codex.dmg",
            "--reuse",
            "--no-download",
        ]);
        let Commands::Prepare(args) = cli.command else {
            panic!("expected prepare");
        };
        let options = args.options();
        assert!(options.reuse);
        assert!(options.artifact.no_download);
        assert_eq!(options.artifact.explicit_path, Some(PathBuf::from("Codex.dmg")));
    }

    #[test]
    fn download_flags_conflict() {
        let parsed = Cli::try_parse_from(["appbridge", "prepare", "--download", "--no-download"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn global_runtime_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "appbridge",
            "launch",
            "--runtime",
            "secondary",
            "--runtime-fallback",
            "primary",
        ])
        .unwrap();
        assert_eq!(cli.runtime.as_deref(), Some("secondary"));
        assert_eq!(cli.runtime_fallback.as_deref(), Some("primary"));
    }
}

//! Prism CLI - campaign runner
//!
//! Commands: run, plan, clear-cache
//! Outputs JSON to stdout, logs to stderr
//! Exit codes: 0 success, 2 run finished with failed cells, 1 fatal error

use clap::{Parser, Subcommand};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};

use prism_core::config::ConfigError;
use prism_core::openai::{ImagePromptBuilder, OpenAiImageClient};
use prism_core::resolver::DirInputProvider;
use prism_core::telemetry::init_telemetry_with_level;
use prism_core::{
    AssetResolver, BatchOrchestrator, CacheStore, CampaignRun, CampaignSpec, CancelToken,
    EngineConfig, ExecutionReport, FsCacheStore, GenerationClient, OrchestratorError,
    RateGovernor, RunStatus,
};

#[derive(Parser)]
#[command(name = "prism-cli")]
#[command(about = "Prism CLI - Campaign Asset Generation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the engine config (TOML)
    #[arg(short, long, default_value = "prism.toml")]
    config: PathBuf,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve and generate every cell of a campaign
    Run {
        /// Campaign brief (JSON)
        #[arg(short, long)]
        campaign: PathBuf,

        /// Run twice; the second run must not call the service
        #[arg(long)]
        verify_cache: bool,

        /// Stop on the first failed cell
        #[arg(long)]
        fail_fast: bool,

        /// Override orchestrator.max_workers
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Show how each cell would resolve, without generating
    Plan {
        /// Campaign brief (JSON)
        #[arg(short, long)]
        campaign: PathBuf,
    },

    /// Remove every cached asset
    ClearCache,
}

fn print_json(value: &serde_json::Value) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}

fn fatal(error: impl std::fmt::Display) -> ExitCode {
    print_json(&json!({"success": false, "error": error.to_string()}));
    ExitCode::FAILURE
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = match EngineConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => return fatal(e),
    };
    init_telemetry_with_level(cli.log_level.as_deref().unwrap_or(&config.logging.level));

    let cache = match FsCacheStore::new(&config.storage.cache_dir) {
        Ok(c) => Arc::new(c),
        Err(e) => return fatal(e),
    };

    match cli.command {
        Commands::ClearCache => match cache.clear() {
            Ok(removed) => {
                info!(removed, "cache cleared");
                print_json(&json!({"success": true, "removed": removed}));
                ExitCode::SUCCESS
            }
            Err(e) => fatal(e),
        },

        Commands::Plan { campaign } => {
            let campaign = match CampaignSpec::load(&campaign) {
                Ok(c) => c,
                Err(e) => return fatal(e),
            };
            // Planning never reaches the service, so a key is optional.
            let client = match client_for(&config, true) {
                Ok(c) => c,
                Err(e) => return fatal(e),
            };
            let orchestrator = orchestrator(&config, cache, client);
            match orchestrator.plan(&campaign) {
                Ok(plan) => {
                    print_json(&json!({"success": true, "campaign_id": &campaign.campaign_id, "cells": plan}));
                    ExitCode::SUCCESS
                }
                Err(e) => fatal(e),
            }
        }

        Commands::Run {
            campaign,
            verify_cache,
            fail_fast,
            workers,
        } => {
            config.orchestrator.fail_fast |= fail_fast;
            if let Some(workers) = workers {
                config.orchestrator.max_workers = workers.max(1);
            }
            let campaign = match CampaignSpec::load(&campaign) {
                Ok(c) => c,
                Err(e) => return fatal(e),
            };
            let client = match client_for(&config, false) {
                Ok(c) => c,
                Err(e) => return fatal(e),
            };
            let orchestrator = orchestrator(&config, cache, client);

            let cancel = CancelToken::new();
            let trigger = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, cancelling run");
                    trigger.cancel();
                }
            });

            let first = match execute(&orchestrator, &campaign, &cancel, &config, None).await {
                Ok(report) => report,
                Err(code) => return code,
            };
            if !verify_cache || first.status == RunStatus::Cancelled {
                return finish(&first, None);
            }

            info!("verifying cache with a second run");
            let second = match execute(&orchestrator, &campaign, &cancel, &config, Some("verify")).await {
                Ok(report) => report,
                Err(code) => return code,
            };
            finish(&first, Some(&second))
        }
    }
}

fn client_for(config: &EngineConfig, key_optional: bool) -> Result<Arc<dyn GenerationClient>, ConfigError> {
    let api_key = match config.generator.resolve_api_key() {
        Ok(key) => key,
        Err(ConfigError::MissingApiKey(_)) if key_optional => String::new(),
        Err(e) => return Err(e),
    };
    Ok(Arc::new(OpenAiImageClient::new(&config.generator, api_key)?))
}

fn orchestrator(
    config: &EngineConfig,
    cache: Arc<FsCacheStore>,
    client: Arc<dyn GenerationClient>,
) -> BatchOrchestrator {
    let cache: Arc<dyn CacheStore> = cache;
    let resolver = AssetResolver::new(
        Arc::new(DirInputProvider::new(&config.storage.input_dir)),
        Arc::clone(&cache),
        Arc::new(ImagePromptBuilder::new(config.generator.size.clone())),
        config.key_policy(),
    );
    BatchOrchestrator::new(
        resolver,
        cache,
        client,
        Arc::new(RateGovernor::new(&config.rate_limit)),
        config.retry.clone(),
        config.orchestrator.clone(),
    )
}

/// One run: execute, persist assets and report. Fatal errors become an exit code.
///
/// `label` names the report file of a run that must not replace the main one.
async fn execute(
    orchestrator: &BatchOrchestrator,
    campaign: &CampaignSpec,
    cancel: &CancelToken,
    config: &EngineConfig,
    label: Option<&str>,
) -> Result<ExecutionReport, ExitCode> {
    let run = match orchestrator.execute(campaign, cancel).await {
        Ok(run) => run,
        Err(OrchestratorError::FailFast { cell, reason, report }) => {
            if let Err(e) = persist_report(&report, &config.storage.report_dir, label) {
                return Err(fatal(format!("failed to write report: {e}")));
            }
            print_json(&json!({
                "success": false,
                "error": format!("fail-fast on {cell}: {reason}"),
                "summary": report.summary,
            }));
            return Err(ExitCode::from(2));
        }
        Err(e) => return Err(fatal(e)),
    };

    if let Err(e) = write_outputs(&run, &config.storage.output_dir) {
        return Err(fatal(format!("failed to write outputs: {e}")));
    }
    if let Err(e) = persist_report(&run.report, &config.storage.report_dir, label) {
        return Err(fatal(format!("failed to write report: {e}")));
    }
    Ok(run.report)
}

fn persist_report(report: &ExecutionReport, dir: &Path, label: Option<&str>) -> std::io::Result<()> {
    let path = match label {
        Some(label) => report.write_json_labelled(dir, label)?,
        None => report.write_json(dir)?,
    };
    info!(path = %path.display(), "report written");
    Ok(())
}

/// `<output>/<campaign>/<product>/<ratio>_<locale>.<ext>`
fn write_outputs(run: &CampaignRun, output_dir: &Path) -> std::io::Result<usize> {
    let mut written = 0;
    for (record, asset) in run.outputs() {
        let dir = output_dir
            .join(&run.report.campaign_id)
            .join(&record.cell.product_id);
        fs::create_dir_all(&dir)?;
        let file = format!(
            "{}_{}.{}",
            record.cell.aspect_ratio,
            record.cell.locale,
            asset.extension()
        );
        fs::write(dir.join(file), asset.bytes())?;
        written += 1;
    }
    Ok(written)
}

fn finish(first: &ExecutionReport, second: Option<&ExecutionReport>) -> ExitCode {
    let mut success = first.status == RunStatus::Succeeded;
    let mut output = json!({
        "success": success,
        "run_id": first.run_id,
        "campaign_id": first.campaign_id,
        "status": first.status,
        "summary": first.summary,
    });

    if let Some(second) = second {
        let verified = second.summary.generation_calls == 0 && second.summary.failed == 0;
        if !verified {
            warn!(calls = second.summary.generation_calls, "second run was not served from cache");
        }
        success &= verified;
        output["success"] = json!(success);
        output["cache_verification"] = json!({
            "verified": verified,
            "status": second.status,
            "summary": second.summary,
        });
    }

    print_json(&output);
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    }
}

//! imagine – command-line front end for the generation engine.
//!
//! Startup order:
//! 1. Parse arguments and environment configuration.
//! 2. Initialise structured tracing (JSON when `IMAGINE_LOG_JSON` is set).
//! 3. Load the provider catalog and engine settings.
//! 4. Build the provider registry, then run the requested command.

mod config;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use imagine_core::{
    EngineConfig, EnvSecretStore, FsResultSink, HttpClient, ImageProvider, JobManager,
    ProviderRegistry,
};
use imagine_types::{GenerationRequest, JobStatus};
use tracing::{info, warn};

use crate::config::CliConfig;

#[derive(Debug, Parser)]
#[command(name = "imagine", version, about = "Generate images through hosted providers")]
struct Cli {
    /// Provider catalog (TOML).  May also carry an `[engine]` table.
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Submit one generation job and wait for its result.
    Generate(GenerateArgs),
    /// List registered providers and models.
    Models,
    /// Check connectivity and credentials for a provider.
    Health {
        #[arg(long)]
        provider: String,
    },
}

#[derive(Debug, Args)]
struct GenerateArgs {
    #[arg(long)]
    provider: String,
    #[arg(long)]
    model: String,
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    negative_prompt: Option<String>,
    #[arg(long, default_value_t = 1024)]
    width: u32,
    #[arg(long, default_value_t = 1024)]
    height: u32,
    #[arg(long, default_value_t = 20)]
    steps: u32,
    #[arg(long, default_value_t = 7.5)]
    cfg_scale: f32,
    /// Negative for a provider-chosen seed.
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    seed: i64,
    #[arg(long, default_value_t = 1)]
    batch_size: u32,
    #[arg(long)]
    sampler: Option<String>,
    /// Source image for img2img.
    #[arg(long)]
    image: Option<PathBuf>,
    /// Inpainting mask; requires `--image`.
    #[arg(long, requires = "image")]
    mask: Option<PathBuf>,
    /// img2img denoising strength in [0, 1].
    #[arg(long)]
    strength: Option<f32>,
    /// Artifact directory (default: `IMAGINE_OUTPUT_DIR` or `outputs`).
    #[arg(long)]
    out: Option<PathBuf>,
    /// Seconds to wait for a terminal state.
    #[arg(long, default_value_t = 600)]
    wait_timeout: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let cli = Cli::parse();
    let cfg = CliConfig::from_env();

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match cfg.log_level.parse::<tracing_subscriber::EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: IMAGINE_LOG='{}' is not a valid tracing filter ({}); \
                     falling back to 'info'",
                    cfg.log_level, e
                );
                tracing_subscriber::EnvFilter::new("info")
            }
        },
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true);

    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    // ── 3. Catalog and engine settings ─────────────────────────────────────────
    let (catalog, engine) = config::load_engine(cli.catalog.as_ref())?;

    // ── 4. Registry ────────────────────────────────────────────────────────────
    let http = HttpClient::new(
        Duration::from_secs(engine.http_connect_timeout_secs),
        Duration::from_secs(engine.http_request_timeout_secs),
    );
    let registry = ProviderRegistry::from_catalog(
        catalog,
        Arc::new(EnvSecretStore::new()),
        http.clone(),
        engine.retry_policy(),
    );

    match cli.command {
        Command::Generate(args) => generate(args, &cfg, engine, registry, http).await,
        Command::Models => {
            print_models(&registry);
            Ok(ExitCode::SUCCESS)
        }
        Command::Health { provider } => health(&registry, &provider).await,
    }
}

async fn generate(
    args: GenerateArgs,
    cfg: &CliConfig,
    engine: EngineConfig,
    registry: ProviderRegistry,
    http: HttpClient,
) -> anyhow::Result<ExitCode> {
    let wait_timeout = Duration::from_secs(args.wait_timeout);
    let request = build_request(&args).await?;

    if let Ok(resolved) = registry.resolve(&request.provider_id, &request.model_id) {
        info!(
            provider = %request.provider_id,
            model = %request.model_id,
            estimated_cost_usd = resolved.model.estimate_cost(&request),
            "cost estimate"
        );
    }

    let out = args.out.unwrap_or_else(|| cfg.output_dir.clone());
    let sink = FsResultSink::new(out, http);
    let manager =
        JobManager::start(engine, registry, Arc::new(sink)).context("failed to start engine")?;

    let id = manager.submit(request).await.context("submission rejected")?;
    info!(job_id = %id, "waiting for job");

    let waited = tokio::select! {
        snapshot = manager.wait(id, wait_timeout) => snapshot,
        _ = shutdown_signal() => {
            manager.cancel(id).await?;
            manager.wait(id, wait_timeout).await
        }
    };
    let snapshot = waited.context("job did not finish")?;

    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(if snapshot.status == JobStatus::Completed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn build_request(args: &GenerateArgs) -> anyhow::Result<GenerationRequest> {
    let mut request =
        GenerationRequest::new(args.provider.as_str(), args.model.as_str(), args.prompt.as_str())
            .with_size(args.width, args.height)
            .with_steps(args.steps)
            .with_cfg_scale(args.cfg_scale)
            .with_seed(args.seed)
            .with_batch_size(args.batch_size);

    if let Some(negative) = &args.negative_prompt {
        request = request.with_negative_prompt(negative.as_str());
    }
    if let Some(sampler) = &args.sampler {
        request = request.with_sampler(sampler.as_str());
    }
    if let Some(path) = &args.image {
        let image = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read image {}", path.display()))?;
        let mask = match &args.mask {
            Some(path) => Some(
                tokio::fs::read(path)
                    .await
                    .with_context(|| format!("failed to read mask {}", path.display()))?,
            ),
            None => None,
        };
        request = request.with_source_image(image, mask);
    }
    if let Some(strength) = args.strength {
        request = request.with_denoising_strength(strength);
    }
    Ok(request)
}

fn print_models(registry: &ProviderRegistry) {
    for provider in registry.descriptors() {
        println!("{} ({})", provider.provider_id, provider.kind);
        for model in &provider.models {
            let mut features = Vec::new();
            if model.supports_img2img {
                features.push("img2img");
            }
            if model.supports_inpainting {
                features.push("inpaint");
            }
            if model.supports_batch {
                features.push("batch");
            }
            features.push(if model.is_synchronous { "sync" } else { "queued" });
            println!(
                "  {:<22} {:<28} max {}x{}  ${:.4}/MP  [{}]",
                model.model_id,
                model.display_name,
                model.max_width,
                model.max_height,
                model.cost_per_megapixel,
                features.join(", ")
            );
        }
    }
}

async fn health(registry: &ProviderRegistry, provider_id: &str) -> anyhow::Result<ExitCode> {
    let provider = registry
        .get(provider_id)
        .with_context(|| format!("unknown provider '{provider_id}'"))?;
    match provider.adapter.health_check().await {
        Ok(()) => {
            println!("{provider_id}: ok");
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            println!("{provider_id}: {err}");
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Returns a future that resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; cancelling job");
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn generate_accepts_negative_seed() {
        let cli = Cli::try_parse_from([
            "imagine", "generate", "--provider", "fal", "--model", "flux-schnell", "--prompt",
            "a red fox", "--seed", "-1",
        ])
        .unwrap();
        match cli.command {
            Command::Generate(args) => {
                assert_eq!(args.seed, -1);
                assert_eq!(args.width, 1024);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn mask_requires_image() {
        let result = Cli::try_parse_from([
            "imagine", "generate", "--provider", "fal", "--model", "sd15", "--prompt", "x",
            "--mask", "mask.png",
        ]);
        assert!(result.is_err());
    }
}

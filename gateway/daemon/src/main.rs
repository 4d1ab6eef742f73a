//! Gateway Daemon - Command-Line Front End
//!
//! Loads the gateway configuration, builds every enabled backend and either
//! answers one prompt or administers the credential pools.
//!
//! # Usage
//!
//! ```bash
//! # Stream a reply from the best backend for gpt-4
//! gateway-daemon ask --model gpt-4 "Hello there"
//!
//! # Canonical events as JSON lines
//! gateway-daemon ask --model llama-3.1-8b --json "Hello there"
//!
//! # Support table
//! gateway-daemon models
//!
//! # Pool administration
//! gateway-daemon credentials list --backend openai-compat
//! gateway-daemon credentials reset --backend frame-session <ID>
//!
//! # Verbose logging
//! RUST_LOG=debug gateway-daemon models
//! ```
//!
//! Logs go to stderr; stdout only carries the reply.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gateway_core::backend::automation::AutomationLauncher;
use gateway_core::{
    default_config_path, load_config_from_path, BackendRegistry, ChatEvent, ChatRequest, ConfigOverrides,
    EventStream, GatewayConfig, ModelType,
};
use tracing::{info, warn};

/// Chat gateway over pooled third-party backends
#[derive(Parser, Debug)]
#[command(name = "gateway-daemon")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "GATEWAY_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory for pool snapshots
    #[arg(long, value_name = "DIR")]
    snapshot_dir: Option<PathBuf>,

    /// Proxy for every backend without its own
    #[arg(long, value_name = "URL")]
    proxy: Option<String>,

    /// Chrome DevTools endpoint for session-backed backends
    #[arg(long, value_name = "URL")]
    devtools: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Send one prompt and stream the reply to stdout
    Ask {
        /// Model to ask
        #[arg(short = 'm', long, value_parser = parse_model)]
        model: ModelType,

        /// Use this backend instead of routing by model
        #[arg(short = 'b', long)]
        backend: Option<String>,

        /// Print canonical events as JSON lines
        #[arg(long)]
        json: bool,

        /// Sampling temperature
        #[arg(long)]
        temperature: Option<f32>,

        /// Prompt text
        prompt: String,
    },

    /// List the models each backend serves
    Models,

    /// Administer a backend's credential pool
    Credentials {
        #[command(subcommand)]
        action: CredentialAction,
    },
}

#[derive(Debug, Subcommand)]
enum CredentialAction {
    /// Show every credential without its secret
    List {
        /// Backend name
        #[arg(short = 'b', long)]
        backend: String,
    },

    /// Remove a credential permanently
    Delete {
        /// Backend name
        #[arg(short = 'b', long)]
        backend: String,
        /// Credential id
        id: String,
    },

    /// Clear a credential's failures and invalid flag
    Reset {
        /// Backend name
        #[arg(short = 'b', long)]
        backend: String,
        /// Credential id
        id: String,
    },
}

fn parse_model(value: &str) -> std::result::Result<ModelType, String> {
    value.parse::<ModelType>().map_err(|_| {
        let known: Vec<&str> = ModelType::ALL.iter().map(ModelType::as_str).collect();
        format!("unknown model '{value}', expected one of: {}", known.join(", "))
    })
}

/// Initialize logging to stderr
fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("gateway_core=info,gateway_daemon=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn load_configuration(args: &Args) -> Result<GatewayConfig> {
    let path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(path).context("Failed to load configuration")?;

    let mut overrides = ConfigOverrides::new();
    if let Some(dir) = &args.snapshot_dir {
        overrides = overrides.with_snapshot_dir(dir.clone());
    }
    if let Some(proxy) = &args.proxy {
        overrides = overrides.with_proxy(proxy.clone());
    }
    if let Some(endpoint) = &args.devtools {
        overrides = overrides.with_devtools_endpoint(endpoint.clone());
    }
    overrides.apply(&mut config);

    info!(source = %config.source(), path = ?config.config_file_path, "Configuration loaded");
    Ok(config)
}

#[cfg(feature = "cdp")]
fn automation_launcher(config: &GatewayConfig) -> Option<Arc<dyn AutomationLauncher>> {
    config.devtools_endpoint.as_ref().map(|endpoint| {
        info!(endpoint = %endpoint, "Using DevTools automation driver");
        Arc::new(gateway_core::backend::cdp::CdpLauncher::new(endpoint.clone())) as Arc<dyn AutomationLauncher>
    })
}

#[cfg(not(feature = "cdp"))]
fn automation_launcher(config: &GatewayConfig) -> Option<Arc<dyn AutomationLauncher>> {
    if config.devtools_endpoint.is_some() {
        warn!("DevTools endpoint configured but this build lacks the `cdp` feature");
    }
    None
}

async fn ask(
    registry: &BackendRegistry,
    model: ModelType,
    backend: Option<&str>,
    json: bool,
    request: ChatRequest,
) -> Result<bool> {
    let backend = match backend {
        Some(name) => registry
            .get(name)
            .with_context(|| format!("No backend named '{name}' (have: {})", registry.names().join(", ")))?,
        None => registry
            .route(model)
            .with_context(|| format!("No configured backend serves {model}"))?,
    };
    info!(backend = %backend.name(), model = %model, "Asking");

    let stream = EventStream::new();
    let mut events = stream.subscribe();
    backend.ask_stream(request, stream.clone()).await;

    let mut stdout = std::io::stdout().lock();
    let mut succeeded = true;
    loop {
        let event = tokio::select! {
            event = events.next() => event,
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted");
                succeeded = false;
                break;
            }
        };
        let Some(event) = event else { break };

        if json {
            writeln!(stdout, "{}", serde_json::to_string(&event)?)?;
        } else {
            match &event {
                ChatEvent::Message { content } | ChatEvent::Done { content } => write!(stdout, "{content}")?,
                ChatEvent::Error { error } => {
                    writeln!(stdout)?;
                    eprintln!("error: {error}");
                }
            }
        }
        stdout.flush()?;

        if let ChatEvent::Error { .. } = event {
            succeeded = false;
        }
        if event.is_terminal() {
            break;
        }
    }
    if !json && succeeded {
        writeln!(stdout)?;
    }
    Ok(succeeded)
}

fn print_models(registry: &BackendRegistry) {
    for (backend, model, size) in registry.support_table() {
        println!("{backend:<16} {:<20} {size}", model.as_str());
    }
}

fn credentials(registry: &BackendRegistry, action: &CredentialAction) -> Result<()> {
    let backend = match action {
        CredentialAction::List { backend }
        | CredentialAction::Delete { backend, .. }
        | CredentialAction::Reset { backend, .. } => backend,
    };
    let pool = registry
        .credentials(backend)
        .with_context(|| format!("Backend '{backend}' is not configured or has no credential pool"))?;

    match action {
        CredentialAction::List { .. } => {
            for credential in pool.list() {
                println!(
                    "{}\t{}\tinvalid={}\tfailures={}\tuses={}\tin_use={}",
                    credential.id,
                    credential.label.as_deref().unwrap_or("-"),
                    credential.invalid,
                    credential.failed_count,
                    credential.use_count,
                    pool.is_in_use(&credential.id),
                );
            }
            let stats = pool.stats();
            println!(
                "total={} available={} invalid={} in_use={}",
                stats.total, stats.available, stats.invalid, stats.in_use
            );
        }
        CredentialAction::Delete { id, .. } => {
            pool.remove(id).with_context(|| format!("No credential '{id}' in {backend}"))?;
            println!("deleted {id}");
        }
        CredentialAction::Reset { id, .. } => {
            anyhow::ensure!(pool.reset(id), "No credential '{id}' in {backend}");
            println!("reset {id}");
        }
    }
    pool.flush().context("Failed to write pool snapshot")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging();

    let config = load_configuration(&args)?;
    let launcher = automation_launcher(&config);
    let registry = BackendRegistry::from_config(&config, launcher)
        .await
        .context("Failed to build backends")?;

    let outcome = match &args.command {
        Command::Ask {
            model,
            backend,
            json,
            temperature,
            prompt,
        } => {
            let mut request = ChatRequest::new(prompt.clone(), *model);
            if let Some(temperature) = temperature {
                request = request.with_temperature(*temperature);
            }
            ask(&registry, *model, backend.as_deref(), *json, request).await
        }
        Command::Models => {
            print_models(&registry);
            Ok(true)
        }
        Command::Credentials { action } => credentials(&registry, action).map(|()| true),
    };

    registry.shutdown().await;

    if !outcome? {
        std::process::exit(1);
    }
    Ok(())
}

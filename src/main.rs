//! Decoder Supervisor - runs external radio decoder pipelines and streams their output.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use decoder_supervisor::bus::{BusMessage, EventBus};
use decoder_supervisor::config::{Config, ConfigLoader, PublishFormat};
use decoder_supervisor::dashboard::{AppState, DashboardServer};
use decoder_supervisor::display;
use decoder_supervisor::publish::{JsonLinesSink, LogSink, PublishStats, Publisher};
use decoder_supervisor::supervisor::{StopOutcome, SupervisorRegistry};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser)]
#[command(
    name = "decoder-supervisor",
    about = "Supervise external decoder pipelines and stream their output",
    version
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Config file to use instead of the default search paths.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP control API until Ctrl-C.
    Serve {
        /// Address to bind (overrides config).
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides config).
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run one decoder in the foreground and print its output.
    Run {
        /// Decoder name from the catalog.
        decoder: String,
        /// Placeholder value, e.g. -p frequency=929.6125M
        #[arg(short = 'p', long = "param", value_parser = parse_key_val)]
        params: Vec<(String, String)>,
        /// Print events as JSON lines.
        #[arg(long)]
        json: bool,
    },
    /// List configured decoders and whether their executables are installed.
    Check,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{s}`"))?;
    if key.is_empty() {
        return Err(format!("empty key in `{s}`"));
    }
    Ok((key.to_string(), value.to_string()))
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn build_registry(config: &Config) -> Arc<SupervisorRegistry> {
    let bus = EventBus::new(config.supervisor.event_capacity);
    Arc::new(SupervisorRegistry::new(
        bus,
        config.supervisor.session_settings(),
    ))
}

async fn spawn_publisher(
    config: &Config,
    bus: &EventBus,
    cancel: CancellationToken,
) -> Result<Option<JoinHandle<PublishStats>>, BoxError> {
    if !config.publish.enabled {
        return Ok(None);
    }

    let handle = match (config.publish.format, &config.publish.path) {
        (PublishFormat::Log, _) => Publisher::spawn(bus, LogSink, cancel),
        (PublishFormat::JsonLines, Some(path)) => {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?;
            Publisher::spawn(bus, JsonLinesSink::new(file), cancel)
        }
        (PublishFormat::JsonLines, None) => {
            Publisher::spawn(bus, JsonLinesSink::new(tokio::io::stdout()), cancel)
        }
    };
    tracing::info!(format = ?config.publish.format, "Publishing decoded events");
    Ok(Some(handle))
}

async fn serve(config: Config, host: Option<String>, port: Option<u16>) -> Result<(), BoxError> {
    let registry = build_registry(&config);
    let cancel = CancellationToken::new();
    let publisher = spawn_publisher(&config, registry.bus(), cancel.child_token()).await?;

    let mut dashboard = config.dashboard.clone();
    if let Some(host) = host {
        dashboard.host = host;
    }
    if let Some(port) = port {
        dashboard.port = port;
    }

    let grace = config.supervisor.grace_period();
    let state = AppState::new(Arc::clone(&registry), Arc::new(config));
    let server = DashboardServer::new(state).with_config(dashboard);

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl-C");
        }
        shutdown.cancel();
    });

    let served = server.run(cancel.clone()).await;

    for (decoder, result) in registry.reset_all(grace).await {
        if let Err(e) = result {
            display::print_error(&format!("{decoder}: {e}"));
        }
    }

    cancel.cancel();
    if let Some(handle) = publisher {
        let stats = handle.await?;
        tracing::info!(
            published = stats.published,
            failed = stats.failed,
            dropped = stats.dropped,
            "Publisher finished"
        );
    }

    served.map_err(Into::into)
}

async fn run_decoder(
    config: Config,
    decoder: &str,
    params: Vec<(String, String)>,
    json: bool,
) -> Result<(), BoxError> {
    let parameters: HashMap<String, String> = params.into_iter().collect();
    let stages = config.decoder(decoder)?.resolve(decoder, &parameters)?;
    let registry = build_registry(&config);
    let grace = config.supervisor.grace_period();

    // Subscribe first so the earliest lines are not missed.
    let mut subscription = registry.bus().subscribe();
    let outcome = registry.start_decoder(decoder, &stages).await?;
    if !json {
        display::print_session_start(&outcome.session.status());
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!(decoder, "Received Ctrl-C, stopping decoder");
                if let StopOutcome::Stopped(report) = registry.stop_decoder(decoder, grace).await? {
                    if !json {
                        display::print_session_end(decoder, report.state, None);
                        display::print_stop_report(&report);
                    }
                }
                break;
            }
            message = subscription.recv() => {
                let Some(message) = message else { break };
                if message.decoder_name() != decoder {
                    continue;
                }
                if json {
                    println!("{}", serde_json::to_string(&message)?);
                }
                match message {
                    BusMessage::Line(event) => {
                        if !json {
                            display::print_event(&event);
                        }
                    }
                    BusMessage::SessionEnded { state, reason, .. } => {
                        if !json {
                            display::print_session_end(decoder, state, reason.as_deref());
                        }
                        registry.stop_decoder(decoder, grace).await?;
                        break;
                    }
                }
            }
        }
    }

    if subscription.dropped() > 0 {
        tracing::warn!(dropped = subscription.dropped(), "Output could not keep up with the decoder");
    }
    Ok(())
}

fn check(config: &Config) {
    for (name, decoder) in config.catalog() {
        display::print_decoder_check(&name, &decoder);
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let loader = match cli.config {
        Some(path) => ConfigLoader::with_path(path),
        None => ConfigLoader::new(),
    };
    let config = match loader.load() {
        Ok(config) => config,
        Err(e) => {
            display::print_error(&e.to_string());
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Commands::Serve { host, port } => serve(config, host, port).await,
        Commands::Run {
            decoder,
            params,
            json,
        } => run_decoder(config, &decoder, params, json).await,
        Commands::Check => {
            check(&config);
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            display::print_error(&e.to_string());
            ExitCode::FAILURE
        }
    }
}

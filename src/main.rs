use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use podcleaner::config::Config;
use podcleaner::http::{self, AppState};
use podcleaner::orchestrator;
use podcleaner::pipeline::{self, WorkerSelection};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "podcleaner", version, about = "Strips advertisements from podcast episodes")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Run one episode through the full pipeline and exit.
    Process {
        url: String,
        #[arg(short = 'o', long, default_value = "output.mp3")]
        output: PathBuf,
        #[arg(short = 'c', long = "config")]
        config: Option<String>,
        #[arg(long)]
        keep_intermediate: bool,
        #[arg(long)]
        debug: bool,
    },
    /// Run one or more long-lived pipeline workers (and/or the HTTP front-end).
    Service {
        #[arg(short = 's', long = "service")]
        service: ServiceKind,
        #[arg(long)]
        mqtt_host: Option<String>,
        #[arg(long)]
        mqtt_port: Option<u16>,
        #[arg(long)]
        web_host: Option<String>,
        #[arg(long)]
        web_port: Option<u16>,
        #[arg(short = 'c', long = "config")]
        config: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
#[value(rename_all = "kebab-case")]
enum ServiceKind {
    Web,
    Transcriber,
    AdDetector,
    AudioProcessor,
    Downloader,
    All,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        CliCommand::Process { url, output, config, keep_intermediate, debug } => {
            let mut config = Config::load_or_default(config.as_ref())?;
            if debug {
                config.log_level = "debug".to_string();
            }
            init_tracing(&config.log_level);

            orchestrator::run_once(&config, &url, &output, keep_intermediate).await?;
            info!(output = %output.display(), "pipeline run complete");
            Ok(())
        }
        CliCommand::Service { service, mqtt_host, mqtt_port, web_host, web_port, config } => {
            let mut config = Config::load_or_default(config.as_ref())?;
            if let Some(host) = mqtt_host {
                config.message_broker.mqtt.host = host;
            }
            if let Some(port) = mqtt_port {
                config.message_broker.mqtt.port = port;
            }
            if let Some(host) = web_host {
                config.web_server.host = host;
            }
            if let Some(port) = web_port {
                config.web_server.port = port;
            }
            init_tracing(&config.log_level);

            run_service(config, service).await
        }
    }
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_service(config: Config, service: ServiceKind) -> Result<()> {
    let bus = pipeline::build_bus(&config);

    let selection = match service {
        ServiceKind::Web => None,
        ServiceKind::Transcriber => Some(WorkerSelection::Transcriber),
        ServiceKind::AdDetector => Some(WorkerSelection::AdDetector),
        ServiceKind::AudioProcessor => Some(WorkerSelection::AudioProcessor),
        ServiceKind::Downloader => Some(WorkerSelection::Downloader),
        ServiceKind::All => Some(WorkerSelection::All),
    };

    let blobstore = match selection {
        Some(selection) => pipeline::spawn_workers(&config, bus.clone(), selection).await?,
        None => Arc::from(pipeline::build_blobstore(&config.object_storage).await?),
    };

    let run_web = matches!(service, ServiceKind::Web | ServiceKind::All);

    if run_web {
        let base_url = format!(
            "http{}://{}:{}",
            if config.web_server.use_https { "s" } else { "" },
            config.web_server.host,
            config.web_server.port
        );
        let state = Arc::new(AppState::new(bus.clone(), blobstore, base_url));
        http::register_handlers(state.clone()).await.context("failed to register HTTP bus handlers")?;

        bus.start().await.context("failed to start message bus")?;

        let router = http::build_router(state);
        let addr = format!("{}:{}", config.web_server.host, config.web_server.port);
        info!(%addr, "starting HTTP front-end");
        let listener = tokio::net::TcpListener::bind(&addr).await.context("failed to bind web server address")?;
        axum::serve(listener, router).await.context("HTTP server terminated unexpectedly")?;
    } else {
        bus.start().await.context("failed to start message bus")?;
        info!(service = ?service_name(service), "worker running, waiting for shutdown signal");
        tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
        bus.stop().await.ok();
    }

    Ok(())
}

fn service_name(service: ServiceKind) -> &'static str {
    match service {
        ServiceKind::Web => "web",
        ServiceKind::Transcriber => "transcriber",
        ServiceKind::AdDetector => "ad-detector",
        ServiceKind::AudioProcessor => "audio-processor",
        ServiceKind::Downloader => "downloader",
        ServiceKind::All => "all",
    }
}

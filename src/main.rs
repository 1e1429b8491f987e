mod bridge;
mod config;
mod hooks;
mod hume;
mod model;
mod pipeline;
mod registry;
mod store;
mod telephony;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use bridge::BridgeDeps;
use config::Config;
use hooks::{CompletionHook, LogHook, WebhookHook};
use hume::{HumeConnector, SessionManager};
use pipeline::risk::RiskFilter;
use registry::{ActiveCalls, HttpDirectory};
use store::{HttpStore, JsonlStore, PersistenceSink};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared application state accessible from all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub bridge: BridgeDeps,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("--version") => println!("voice-bridge {VERSION}"),
        Some("--help") | Some("-h") => print_usage(),
        Some(other) => {
            eprintln!("Unknown option: {other}");
            print_usage();
            std::process::exit(1);
        }
        None => {
            let rt = tokio::runtime::Runtime::new().expect("Failed to create tokio runtime");
            rt.block_on(server());
        }
    }
}

fn print_usage() {
    println!("voice-bridge {VERSION}");
    println!("Bridges Twilio and Vonage media streams to HumeAI EVI");
    println!();
    println!("Usage: voice-bridge [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --version   Print version");
    println!("  --help, -h  Print this help message");
    println!();
    println!("Without options, starts the bridge server.");
}

fn fail(msg: impl std::fmt::Display) -> ! {
    tracing::error!("{msg}");
    eprintln!("{msg}");
    std::process::exit(1);
}

async fn server() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_bridge=info,tower_http=info".into()),
        )
        .init();

    let config = match Config::load() {
        Ok(c) => Arc::new(c),
        Err(e) => fail(format!("Failed to load config: {e}")),
    };

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        external_url = %config.server.external_url,
        "Starting voice-bridge"
    );

    if config.hume.api_key.is_empty() {
        fail("hume.api_key is not set (config or HUME_API_KEY)");
    }
    if config.directory.url.is_empty() {
        fail("directory.url is not set (config or CALL_DIRECTORY_URL)");
    }

    let client = reqwest::Client::new();

    let connector = Arc::new(HumeConnector::new(
        config.hume.url.clone(),
        config.hume.api_key.clone(),
    ));
    let sessions = SessionManager::new(
        connector,
        config.hume.default_config_id.clone(),
        config.hume.connect_timeout(),
        config.audio.voice_sample_rate,
    );

    let sink: Arc<dyn PersistenceSink> = match &config.storage.url {
        Some(url) => {
            tracing::info!(url = %url, "Persisting call records over HTTP");
            Arc::new(HttpStore::new(client.clone(), url.clone()))
        }
        None => {
            let dir = config.storage_dir();
            tracing::info!(dir = %dir.display(), "Persisting call records as JSONL");
            Arc::new(JsonlStore::new(dir))
        }
    };

    let hook: Arc<dyn CompletionHook> = match &config.hooks.completion_url {
        Some(url) => {
            tracing::info!(url = %url, "Completion reports go to webhook");
            let hook_client = match reqwest::Client::builder().timeout(config.hooks.timeout()).build() {
                Ok(c) => c,
                Err(e) => fail(format!("Failed to build webhook client: {e}")),
            };
            Arc::new(WebhookHook::new(hook_client, url.clone()))
        }
        None => Arc::new(LogHook),
    };

    let risk = match &config.intelligence.risk_rules_file {
        Some(path) => match RiskFilter::from_file(path) {
            Ok(filter) => filter,
            Err(e) => fail(format!("Failed to load risk rules from {}: {e}", path.display())),
        },
        None => RiskFilter::default(),
    };
    tracing::info!(version = risk.version(), "Risk rules loaded");

    let state = AppState {
        bridge: BridgeDeps {
            config: config.clone(),
            directory: Arc::new(HttpDirectory::new(client.clone(), config.directory.url.clone())),
            sessions: Arc::new(sessions),
            sink,
            hook,
            risk: Arc::new(risk),
            active: ActiveCalls::new(),
        },
        config: config.clone(),
    };

    let app = Router::new()
        // Twilio webhooks and media stream
        .route("/twilio/voice", post(telephony::twilio::handle_voice))
        .route("/twilio/status", post(telephony::twilio::handle_status))
        .route("/twilio/media", get(telephony::twilio::handle_media_upgrade))
        // Vonage webhooks and media stream
        .route(
            "/vonage/answer",
            get(telephony::vonage::handle_answer).post(telephony::vonage::handle_answer_post),
        )
        .route("/vonage/event", post(telephony::vonage::handle_event))
        .route("/vonage/media", get(telephony::vonage::handle_media_upgrade))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = match format!("{}:{}", config.server.host, config.server.port).parse() {
        Ok(addr) => addr,
        Err(e) => fail(format!("Invalid server address: {e}")),
    };

    tracing::info!(%addr, "Listening");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => fail(format!("Failed to bind {addr}: {e}")),
    };

    if let Err(e) = axum::serve(listener, app).await {
        fail(format!("Server error: {e}"));
    }
}

async fn health() -> &'static str {
    "ok"
}

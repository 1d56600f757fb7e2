use std::{process::ExitCode, sync::Arc};

use clap::{ArgAction, Parser};
use mcp_bridge::{
    Result, TokenProvider,
    auth::{
        AuthTransport, BrowserBffFlow, FileCookieJar, FileStore, MemoryStore, TokenStore,
    },
    bridge::{Bridge, BridgeOptions, Elicitator},
    config::BridgeConfig,
    transport::HttpSender,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Debug, Parser)]
#[command(
    name = "mcp-bridge",
    version,
    about = "Expose a remote MCP server over stdio",
    disable_help_flag = true
)]
struct Args {
    /// Remote MCP server URL.
    #[arg(short = 'u', long)]
    url: String,

    /// Configuration file; `path|key` for an encrypted one.
    #[arg(short = 'c', long)]
    config: Option<String>,

    /// Key for an encrypted configuration file.
    #[arg(short = 'k', long)]
    key: Option<String>,

    /// Present verified ID tokens instead of access tokens.
    #[arg(short = 'i', long = "id-token")]
    id_token: bool,

    /// Authorize through the server's backend-for-frontend exchange.
    #[arg(short = 'b', long = "backend-for-frontend")]
    backend_for_frontend: bool,

    /// Header carrying the backend-for-frontend exchange.
    #[arg(short = 'h', long = "backend-for-frontend-header")]
    backend_for_frontend_header: Option<String>,

    #[arg(long, action = ArgAction::Help)]
    help: Option<bool>,
}

async fn options(args: &Args) -> Result<BridgeOptions> {
    let url = Url::parse(&args.url)?;
    let config = match &args.config {
        Some(location) => BridgeConfig::load(location, args.key.as_deref())?,
        None => BridgeConfig::default(),
    };

    let clients = config.clients.clone();
    let store: Arc<dyn TokenStore> = match &config.token_file {
        Some(path) => Arc::new(FileStore::open(path)?.with_clients(clients)),
        None => Arc::new(MemoryStore::with_clients(clients)),
    };

    let mut auth = AuthTransport::builder()
        .with_store(store.clone())
        .with_scopes(config.scopes.clone())
        .with_id_token(args.id_token);
    if let Some(ttl) = config.rejected_token_ttl() {
        auth = auth.with_rejected_token_ttl(ttl);
    }
    if let Some(path) = &config.cookie_file {
        auth = auth.with_cookies(Arc::new(FileCookieJar::open(path)?));
    }
    if args.backend_for_frontend {
        auth = auth.with_bff(Arc::new(BrowserBffFlow::new(store)));
        let header = args
            .backend_for_frontend_header
            .clone()
            .or_else(|| config.authorization_exchange_header.clone());
        if let Some(header) = header {
            auth = auth.with_bff_header(header);
        }
    }
    let auth = Arc::new(auth.build()?);

    let sender: Arc<dyn HttpSender> = auth.clone();
    let provider: Arc<dyn TokenProvider> = auth;
    let mut options = BridgeOptions::new(url)
        .with_sender(sender)
        .with_token_provider(provider);
    if config.elicitation_enabled() {
        options = options.with_elicitation_ui(Elicitator::new());
    }
    if let Some(interval) = config.ping_interval() {
        options = options.with_ping_interval(interval);
    }
    Ok(options)
}

async fn run(args: Args) -> Result<()> {
    let bridge = Bridge::connect(options(&args).await?).await?;
    info!("Serving {} on stdio", args.url);
    bridge.serve_stdio().await
}

#[tokio::main]
async fn main() -> ExitCode {
    // stdout carries JSON-RPC; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

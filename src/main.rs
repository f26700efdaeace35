//! timelayer server: layered conversation memory behind a local HTTP API.

use clap::Parser;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::EnvFilter;

use timelayer::{api, config::Config, prompts, AppState};

#[derive(Parser)]
#[command(name = "timelayer", version, about = "Local-first layered conversation memory")]
struct Args {
    /// Address to listen on (host:port)
    #[arg(short, long, env = "TIMELAYER_HTTP_ADDR")]
    addr: Option<String>,

    /// Base data directory (logs, prompts, sqlite)
    #[arg(short, long, env = "TIMELAYER_BASE_DIR")]
    base_dir: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let mut cfg = Config::from_env();
    if let Some(addr) = args.addr {
        cfg.http_addr = addr;
    }
    if let Some(base) = args.base_dir {
        cfg.base_dir = std::path::PathBuf::from(&base);
        cfg.log_dir = cfg.base_dir.join("logs");
        cfg.archive_dir = cfg.log_dir.join("archive");
        cfg.prompt_dir = cfg.base_dir.join("prompts");
        cfg.db_path = cfg.base_dir.join("memory").join("memory.sqlite");
    }

    if let Err(e) = api::check_bind_safety(&cfg) {
        eprintln!("{e}");
        std::process::exit(1);
    }

    cfg.ensure_dirs().expect("failed to create data directories");
    prompts::ensure_prompt_files(&cfg).expect("failed to write prompt files");

    let addr = cfg.http_addr.clone();
    let state = AppState::new(cfg).expect("failed to open database");

    info!(
        version = env!("CARGO_PKG_VERSION"),
        %addr,
        db = %state.cfg.db_path.display(),
        chat = %state.cfg.chat_url,
        rerank_mode = state.cfg.rerank_mode.as_str(),
        auth = if state.cfg.http_auth_token.is_some() { "enabled" } else { "disabled" },
        "timelayer starting"
    );

    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("server error");
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    info!("shutting down");
}

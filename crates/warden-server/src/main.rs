mod error;
mod handlers;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::{any, get};
use axum::Router;
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::handlers::{healthz, proxy_handler, not_found_fallback};
use crate::state::{create_default_config, load_config, AppState};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    #[arg(long, default_value = "warden.toml")]
    config: PathBuf,
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    if !args.config.exists() {
        warn!("config file missing, creating default config");
        let _ = create_default_config(&args.config);
    }

    let config = load_config(&args.config)?;
    let (state, audit_drain) = AppState::from_config(config)?;
    let state = Arc::new(state);
    tokio::spawn(audit_drain.run(state.repo.clone()));

    let app = Router::new()
        .route("/governance-plane/api/v1/proxy", any(proxy_handler))
        .route("/governance-plane/api/v1/proxy/*path", any(proxy_handler))
        .route("/healthz", get(healthz))
        .fallback(not_found_fallback)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("warden-server listening on {}", args.listen);
    let listener = tokio::net::TcpListener::bind(args.listen).await?;
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

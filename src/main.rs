use clap::Parser;
use std::sync::Arc;

mod auth;
mod config;
mod converters;
mod endpoints;
mod error;
mod http_client;
mod middleware;
mod models;
mod resolver;
mod routes;
mod schema;
mod streaming;
mod tokenizer;

use error::ApiError;

/// Exit codes: 0 clean shutdown, 1 configuration or bind failure,
/// 2 unrecoverable token-store corruption.
const EXIT_CONFIG: i32 = 1;
const EXIT_TOKEN_STORE: i32 = 2;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = config::CliArgs::parse();

    let config = match config::Config::from_args(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e:#}");
            std::process::exit(EXIT_CONFIG);
        }
    };
    if let Err(e) = config.validate() {
        eprintln!("Configuration error: {e:#}");
        std::process::exit(EXIT_CONFIG);
    }

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.to_lowercase()));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    tracing::info!("Antigravity Gateway starting...");

    let http = match reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(config.connect_timeout))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            eprintln!("Failed to build HTTP client: {e}");
            std::process::exit(EXIT_CONFIG);
        }
    };

    let auth = match auth::AuthManager::new(&config.token_store_file, http) {
        Ok(manager) => Arc::new(manager),
        Err(ApiError::TokenStoreCorrupt(msg)) => {
            eprintln!("Token store corrupt: {msg}");
            eprintln!(
                "Move {} aside and log in again.",
                config.token_store_file.display()
            );
            std::process::exit(EXIT_TOKEN_STORE);
        }
        Err(e) => {
            eprintln!("Failed to load token store: {e}");
            std::process::exit(EXIT_CONFIG);
        }
    };

    if args.login {
        match auth.login().await {
            Ok(account) => {
                println!("Logged in as {}", account.email);
                if let Some(project) = &account.project_id {
                    println!("Managed project: {project}");
                }
                return;
            }
            Err(e) => {
                eprintln!("Login failed: {e}");
                std::process::exit(EXIT_CONFIG);
            }
        }
    }

    if !auth.has_account().await {
        tracing::warn!(
            "No account in {}; API requests will fail until you run with --login",
            config.token_store_file.display()
        );
    }

    let pool = Arc::new(endpoints::EndpointPool::new());
    let upstream = match http_client::UpstreamClient::new(auth.clone(), pool.clone(), &config) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            eprintln!("Failed to initialize upstream client: {e}");
            std::process::exit(EXIT_CONFIG);
        }
    };
    let resolver = resolver::ModelResolver::new(&config);

    let state = routes::AppState {
        config: Arc::new(config.clone()),
        auth,
        pool,
        upstream,
        resolver,
        session_nonce: rand::random(),
    };

    let app = routes::build_router(state)
        .into_make_service_with_connect_info::<std::net::SocketAddr>();

    let addr = format!("{}:{}", config.host, config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("Failed to bind {addr}: {e}");
            std::process::exit(EXIT_CONFIG);
        }
    };

    tracing::info!("Server listening on http://{}", addr);
    tracing::info!(
        "Models: haiku -> {}, sonnet -> {}, opus -> {}",
        config.haiku_model,
        config.sonnet_model,
        config.opus_model
    );

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        eprintln!("Server error: {e}");
        std::process::exit(EXIT_CONFIG);
    }

    tracing::info!("Server shutdown complete");
}

/// Handle graceful shutdown signal
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown...");
        },
    }
}

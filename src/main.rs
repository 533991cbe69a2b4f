use std::sync::Arc;

use axum::http::HeaderValue;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::EnvFilter;

use pingpong_backend::{api, config::Config, db};

fn cors_layer(config: &Config) -> CorsLayer {
    let Some(origin) = config.cors_origin.as_deref() else {
        return CorsLayer::permissive();
    };
    match origin.parse::<HeaderValue>() {
        Ok(origin) => CorsLayer::new()
            .allow_origin(origin)
            .allow_methods(Any)
            .allow_headers(Any),
        Err(e) => {
            tracing::warn!("Ignoring invalid CORS_ORIGIN {origin:?}: {e}");
            CorsLayer::permissive()
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::load();

    let db = db::Database::new(&config.database_url)
        .await
        .expect("Failed to initialize database");
    let db = Arc::new(db);

    if config.skip_telegram_signature {
        tracing::warn!("Telegram login signature checks are disabled");
    }

    let port = config.port;
    let cors = cors_layer(&config);
    let app = api::router(db, Arc::new(config)).layer(cors);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .unwrap_or_else(|e| panic!("Failed to bind to port {port}: {e}"));

    tracing::info!("Pingpong backend listening on port {port}");
    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}

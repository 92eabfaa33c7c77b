use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use commerce_backend::{
    config::{get_config, init_config},
    database::pool::create_pool,
    routes, AppState,
};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    init_config()?;
    let config = get_config();

    let pool = create_pool().await?;
    sqlx::migrate!("./migrations").run(&pool).await?;

    let app_state = AppState::new(pool);

    {
        info!("Checking channel provider health...");
        if !app_state.sms_provider.health().await {
            warn!("SMS provider health check failed; sends may be degraded");
        }
        if !app_state.whatsapp_provider.health().await {
            warn!("WhatsApp provider health check failed; sends may be degraded");
        }
    }

    let base_routes = Router::new().route("/health", get(routes::health::health));

    let webhook_api = Router::new()
        .route("/api/webhook/sms", post(routes::webhook::handle_sms))
        .route(
            "/api/webhook/whatsapp",
            get(routes::webhook::verify_whatsapp).post(routes::webhook::handle_whatsapp),
        )
        .route(
            "/api/webhook/platform",
            post(routes::webhook::handle_platform),
        )
        .layer(axum::middleware::from_fn_with_state(
            commerce_backend::middleware::rate_limit::new_rps_state(config.webhook_rps),
            commerce_backend::middleware::rate_limit::rps_middleware,
        ));

    let integration_api = Router::new()
        .route(
            "/api/integration/conversations",
            get(routes::conversations::list_conversations),
        )
        .route(
            "/api/integration/campaigns/:id/conversations",
            get(routes::conversations::list_campaign_conversations),
        )
        .route(
            "/api/integration/conversations/:id/messages",
            get(routes::conversations::get_conversation_messages),
        )
        .route(
            "/api/integration/messages",
            post(routes::conversations::send_message),
        )
        .layer(axum::middleware::from_fn_with_state(
            commerce_backend::middleware::rate_limit::new_rps_state(config.integration_rps),
            commerce_backend::middleware::rate_limit::rps_middleware,
        ));

    let app = base_routes
        .merge(webhook_api)
        .merge(integration_api)
        .with_state(app_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(1024 * 1024));

    let addr: SocketAddr = config.server_address.parse()?;
    info!("Server listening on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

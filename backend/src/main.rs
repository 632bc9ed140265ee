use axum::{
    http::Method,
    routing::get,
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod auth;
mod config;
mod database;
mod error;
mod handlers;
mod services;
mod workflows;


pub struct AppState {
    pub db_pool: sqlx::PgPool,
    pub engine: Arc<workflows::WorkflowEngine>,
    pub audit: services::AuditService,
    pub jwt_secret: String,
}

impl AppState {
    pub fn new(db_pool: sqlx::PgPool, config: &config::Config) -> Self {
        let engine = workflows::WorkflowEngine::new(db_pool.clone(), config.approvals.clone());

        Self {
            audit: services::AuditService::new(db_pool.clone()),
            engine: Arc::new(engine),
            db_pool,
            jwt_secret: config.jwt_secret.clone(),
        }
    }
}

pub fn app(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health_check))
        .nest("/api/v1/approvals", handlers::approval_routes())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::from_env()?;
    let db_pool = database::create_pool(&config.database_url).await?;

    database::migrate(&db_pool).await?;

    let app_state = Arc::new(AppState::new(db_pool, &config));
    let app = app(app_state);

    let listener = tokio::net::TcpListener::bind(&config.server_addr).await?;
    tracing::info!("Server running on {}", config.server_addr);

    axum::serve(listener, app).await?;

    Ok(())
}

//! JSON HTTP API for PepperBot on axum.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderValue, Method},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use pepper_storage::Store;
use pepper_sync::{PipelineScheduler, ScrapeOutcome, ScrapeSummary};

pub mod auth;
pub mod error;
pub mod routes;

pub use auth::CurrentUser;
pub use error::{ApiError, ApiResult};

const DEFAULT_SECRET_KEY: &str = "your-secret-key-change-in-production";
const DEFAULT_BCRYPT_COST: u32 = 12;

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
    pub secret_key: String,
    pub access_token_expire_minutes: i64,
    pub cookie_secure: bool,
    pub cors_origins: Vec<String>,
    pub bcrypt_cost: u32,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let secret_key = lookup("SECRET_KEY")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SECRET_KEY.to_string());
        let cors_origins = lookup("PEPPER_CORS_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect()
            })
            .unwrap_or_else(|| {
                vec![
                    "http://localhost:3000".to_string(),
                    "http://localhost:8080".to_string(),
                ]
            });
        Self {
            port: lookup("PEPPER_WEB_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            secret_key,
            access_token_expire_minutes: lookup("ACCESS_TOKEN_EXPIRE_MINUTES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            cookie_secure: lookup("PEPPER_COOKIE_SECURE")
                .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            cors_origins,
            bcrypt_cost: lookup("PEPPER_BCRYPT_COST")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_BCRYPT_COST),
        }
    }

    pub fn uses_default_secret(&self) -> bool {
        self.secret_key == DEFAULT_SECRET_KEY
    }
}

pub struct AppState {
    pub store: Arc<dyn Store>,
    pub scheduler: Arc<PipelineScheduler>,
    pub config: WebConfig,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, scheduler: Arc<PipelineScheduler>, config: WebConfig) -> Self {
        Self {
            store,
            scheduler,
            config,
        }
    }
}

fn cors_layer(config: &WebConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(%origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
}

pub fn app(state: AppState) -> Router {
    let cors = cors_layer(&state.config);
    Router::new()
        .route("/health", get(routes::health))
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/auth/logout", post(auth::logout))
        .route("/users/me", get(auth::me))
        .route("/lists", get(routes::list_lists).post(routes::create_list))
        .route(
            "/lists/{list_id}",
            get(routes::get_list)
                .put(routes::update_list)
                .delete(routes::delete_list),
        )
        .route(
            "/lists/{list_id}/items",
            get(routes::list_items).post(routes::create_item),
        )
        .route(
            "/lists/{list_id}/items/{item_id}",
            put(routes::update_item).delete(routes::delete_item),
        )
        .route(
            "/filters",
            get(routes::list_filters).post(routes::create_filter),
        )
        .route(
            "/filters/{filter_id}",
            get(routes::get_filter)
                .put(routes::update_filter)
                .delete(routes::delete_filter),
        )
        .route(
            "/discounts",
            get(routes::list_discounts).post(routes::create_discount),
        )
        .route(
            "/discounts/{discount_id}",
            get(routes::get_discount)
                .put(routes::update_discount)
                .delete(routes::delete_discount),
        )
        .route(
            "/notifications",
            get(routes::list_notifications).post(routes::create_notification),
        )
        .route(
            "/notifications/{notification_id}",
            get(routes::get_notification).delete(routes::delete_notification),
        )
        .route(
            "/notifications/{notification_id}/read",
            put(routes::mark_notification_read),
        )
        .route("/telegram/links", get(routes::list_links))
        .route(
            "/telegram/links/{link_id}",
            delete(routes::unlink),
        )
        .route("/scraper/trigger", post(trigger_scrape))
        .route("/scraper/status", get(scraper_status))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

async fn trigger_scrape(State(state): State<Arc<AppState>>) -> ApiResult<Json<ScrapeSummary>> {
    match state.scheduler.trigger_scrape().await {
        ScrapeOutcome::Completed(summary) => Ok(Json(summary)),
        ScrapeOutcome::Skipped => Err(ApiError::Conflict(
            "A scrape is already in progress".into(),
        )),
    }
}

async fn scraper_status(State(state): State<Arc<AppState>>) -> Json<JsonValue> {
    Json(json!({
        "scheduler_running": state.scheduler.is_running().await,
        "scrape_in_flight": state.scheduler.scrape_in_flight(),
        "last_run": state.scheduler.last_run().await,
    }))
}

/// Bind on all interfaces and serve until ctrl-c.
pub async fn serve(state: AppState) -> anyhow::Result<()> {
    if state.config.uses_default_secret() {
        warn!("SECRET_KEY not set; using the built-in development key");
    }
    let port = state.config.port;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "http api listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "ctrl-c handler failed");
            }
        })
        .await?;
    Ok(())
}

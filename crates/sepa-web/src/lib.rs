//! Read-only price lookup API over the catalog.

use std::sync::Arc;

use anyhow::{bail, Context};
use axum::{
    extract::{FromRequestParts, Path, State},
    http::{header, request::Parts, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use sepa_core::{ProductListing, StoreOffer};
use sepa_sync::{connect_pool, sort_offers, CatalogReader, PgCatalog};
use serde::Serialize;
use serde_json::json;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "sepa-web";

const DEFAULT_BIND: &str = "0.0.0.0:5000";
const WEB_DB_CONNECTIONS: u32 = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebConfig {
    pub database_url: String,
    pub api_key: String,
    pub bind: String,
}

impl WebConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let Some(database_url) = var("DATABASE_URL").filter(|v| !v.trim().is_empty()) else {
            bail!("DATABASE_URL is not set");
        };
        let api_key = var("SEPA_API_KEY")
            .map(|raw| strip_quotes(&raw).to_string())
            .unwrap_or_default();
        if api_key.is_empty() {
            bail!("SEPA_API_KEY is not set");
        }
        let bind = var("SEPA_BIND")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BIND.to_string());
        Ok(Self {
            database_url,
            api_key,
            bind,
        })
    }
}

/// Deployment tooling tends to leave the key wrapped in quotes.
fn strip_quotes(raw: &str) -> &str {
    let trimmed = raw.trim();
    for quote in ['"', '\''] {
        if let Some(inner) = trimmed
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    trimmed
}

#[derive(Clone)]
pub struct AppState {
    reader: Arc<dyn CatalogReader>,
    api_key: Arc<str>,
}

impl AppState {
    pub fn new(reader: Arc<dyn CatalogReader>, api_key: impl Into<String>) -> Self {
        Self {
            reader,
            api_key: api_key.into().into(),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/health", get(health_handler))
        .route("/api/v1/products/{barcode}", get(product_handler))
        .with_state(state)
}

pub async fn serve(config: WebConfig) -> anyhow::Result<()> {
    let pool = connect_pool(&config.database_url, WEB_DB_CONNECTIONS).await?;
    let state = AppState::new(Arc::new(PgCatalog::new(pool)), config.api_key);
    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    info!(bind = %config.bind, "lookup api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(WebConfig::from_env()?).await
}

#[derive(Debug)]
pub enum ApiError {
    MissingToken,
    BadToken,
    NotFound,
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::MissingToken => (StatusCode::UNAUTHORIZED, "missing or malformed bearer token"),
            ApiError::BadToken => (StatusCode::FORBIDDEN, "invalid api key"),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "product not found"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal error"),
        };
        if let ApiError::Internal(err) = &self {
            warn!(error = %err, "lookup failed");
        }
        let mut resp = (status, Json(json!({ "error": message }))).into_response();
        if let ApiError::MissingToken = self {
            resp.headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        resp
    }
}

/// Proof that the request carried the configured bearer token.
pub struct Authorized;

impl FromRequestParts<AppState> for Authorized {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, ApiError> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(bearer_token)
            .ok_or(ApiError::MissingToken)?;
        if bool::from(token.as_bytes().ct_eq(state.api_key.as_bytes())) {
            Ok(Authorized)
        } else {
            Err(ApiError::BadToken)
        }
    }
}

fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

#[derive(Debug, Serialize)]
pub struct ProductResponse {
    pub barcode: String,
    pub name: Option<String>,
    pub brand: Option<String>,
    pub stores: Vec<StoreResponse>,
}

#[derive(Debug, Serialize)]
pub struct StoreResponse {
    pub store_id: String,
    pub chain_id: String,
    pub name: Option<String>,
    pub price: f64,
}

impl From<StoreOffer> for StoreResponse {
    fn from(offer: StoreOffer) -> Self {
        Self {
            store_id: offer.store_id,
            chain_id: offer.chain_id,
            name: offer.store_name,
            price: offer.price.cents() as f64 / 100.0,
        }
    }
}

impl From<ProductListing> for ProductResponse {
    fn from(mut listing: ProductListing) -> Self {
        sort_offers(&mut listing.stores);
        Self {
            barcode: listing.barcode,
            name: listing.name,
            brand: listing.brand,
            stores: listing.stores.into_iter().map(StoreResponse::from).collect(),
        }
    }
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn product_handler(
    _auth: Authorized,
    State(state): State<AppState>,
    Path(barcode): Path<String>,
) -> Result<Json<ProductResponse>, ApiError> {
    let listing = state
        .reader
        .lookup_barcode(barcode.trim())
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(listing.into()))
}

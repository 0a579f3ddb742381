//! API Service - Read-only queries over the ship telemetry star schema
//!
//! Endpoints:
//! - GET /health - Health check
//! - GET /ships - List known ships
//! - GET /positions - Position series for trend analysis
//! - GET /tanks - Per-tank readings (volume, percentage, vapor)
//! - GET /environment - Wind and air temperature series

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;

const TANK_COUNT: u8 = 5;
const DEFAULT_LIMIT: i64 = 100;
const MAX_LIMIT: i64 = 1000;

// ============================================================================
// State
// ============================================================================

#[derive(Clone)]
struct AppState {
    pool: PgPool,
}

// ============================================================================
// Response types
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    version: &'static str,
}

#[derive(Serialize, sqlx::FromRow)]
struct ShipResponse {
    ship_id: String,
    created_at: DateTime<Utc>,
}

#[derive(Serialize, sqlx::FromRow)]
struct PositionResponse {
    ship_id: String,
    datetime_id: NaiveDateTime,
    latitude: Option<f64>,
    longitude: Option<f64>,
    original_datetime: Option<NaiveDateTime>,
}

#[derive(Serialize)]
struct TankReadingResponse {
    ship_id: String,
    datetime_id: NaiveDateTime,
    tank: u8,
    liquid_volume: Option<f64>,
    max_volume: Option<f64>,
    percentage: Option<f64>,
    vapor_pressure: Option<f64>,
    vapor_temperature: Option<f64>,
}

#[derive(Serialize, sqlx::FromRow)]
struct EnvironmentResponse {
    ship_id: String,
    datetime_id: NaiveDateTime,
    wind_direction: Option<f64>,
    wind_speed: Option<f64>,
    air_temperature: Option<f64>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// ============================================================================
// Query params
// ============================================================================

#[derive(Deserialize)]
struct SeriesQuery {
    ship_id: Option<String>,
    from: Option<NaiveDateTime>,
    to: Option<NaiveDateTime>,
    limit: Option<i64>,
}

#[derive(Deserialize)]
struct TankQuery {
    tank: u8,
    ship_id: Option<String>,
    limit: Option<i64>,
}

fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        version: "0.1.0",
    })
}

async fn ships_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let ships: Result<Vec<ShipResponse>, _> =
        sqlx::query_as("SELECT ship_id, created_at FROM d_ship ORDER BY ship_id")
            .fetch_all(&state.pool)
            .await;

    match ships {
        Ok(s) => Json(serde_json::json!({ "ships": s })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

async fn positions_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SeriesQuery>,
) -> impl IntoResponse {
    let limit = clamp_limit(params.limit);

    // Build dynamic query
    let mut query = String::from(
        "SELECT f.ship_id, f.datetime_id, f.latitude, f.longitude, f.original_datetime \
         FROM f_data f \
         WHERE 1=1",
    );
    let mut idx = 1;
    if params.ship_id.is_some() {
        query.push_str(&format!(" AND f.ship_id = ${idx}"));
        idx += 1;
    }
    if params.from.is_some() {
        query.push_str(&format!(" AND f.datetime_id >= ${idx}"));
        idx += 1;
    }
    if params.to.is_some() {
        query.push_str(&format!(" AND f.datetime_id <= ${idx}"));
        idx += 1;
    }
    query.push_str(&format!(" ORDER BY f.datetime_id LIMIT ${idx}"));

    let mut q = sqlx::query_as::<_, PositionResponse>(&query);
    if let Some(ship_id) = &params.ship_id {
        q = q.bind(ship_id);
    }
    if let Some(from) = params.from {
        q = q.bind(from);
    }
    if let Some(to) = params.to {
        q = q.bind(to);
    }
    q = q.bind(limit);

    match q.fetch_all(&state.pool).await {
        Ok(positions) => Json(serde_json::json!({ "positions": positions })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

async fn tanks_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TankQuery>,
) -> impl IntoResponse {
    if params.tank >= TANK_COUNT {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: format!("tank must be 0..={}", TANK_COUNT - 1),
            }),
        )
            .into_response();
    }
    let limit = clamp_limit(params.limit);

    // Tank number is validated above; the column names are not user input.
    let n = params.tank;
    let mut query = format!(
        "SELECT f.ship_id, f.datetime_id, \
         f.tank{n}_liquid_volume AS liquid_volume, \
         f.tank{n}_max_volume AS max_volume, \
         f.tank{n}_percentage AS percentage, \
         f.tank{n}_vapor_pressure AS vapor_pressure, \
         f.tank{n}_vapor_temperature AS vapor_temperature \
         FROM f_data f \
         WHERE 1=1",
    );
    let mut idx = 1;
    if params.ship_id.is_some() {
        query.push_str(&format!(" AND f.ship_id = ${idx}"));
        idx += 1;
    }
    query.push_str(&format!(" ORDER BY f.datetime_id LIMIT ${idx}"));

    let mut q = sqlx::query(&query);
    if let Some(ship_id) = &params.ship_id {
        q = q.bind(ship_id);
    }
    q = q.bind(limit);

    match q.fetch_all(&state.pool).await {
        Ok(rows) => {
            let readings: Vec<TankReadingResponse> = rows
                .iter()
                .map(|row| TankReadingResponse {
                    ship_id: row.get("ship_id"),
                    datetime_id: row.get("datetime_id"),
                    tank: n,
                    liquid_volume: row.get("liquid_volume"),
                    max_volume: row.get("max_volume"),
                    percentage: row.get("percentage"),
                    vapor_pressure: row.get("vapor_pressure"),
                    vapor_temperature: row.get("vapor_temperature"),
                })
                .collect();
            Json(serde_json::json!({ "tank": n, "readings": readings })).into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

async fn environment_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SeriesQuery>,
) -> impl IntoResponse {
    let limit = clamp_limit(params.limit);

    let mut query = String::from(
        "SELECT f.ship_id, f.datetime_id, f.wind_direction, f.wind_speed, f.air_temperature \
         FROM f_data f \
         WHERE 1=1",
    );
    let mut idx = 1;
    if params.ship_id.is_some() {
        query.push_str(&format!(" AND f.ship_id = ${idx}"));
        idx += 1;
    }
    if params.from.is_some() {
        query.push_str(&format!(" AND f.datetime_id >= ${idx}"));
        idx += 1;
    }
    if params.to.is_some() {
        query.push_str(&format!(" AND f.datetime_id <= ${idx}"));
        idx += 1;
    }
    query.push_str(&format!(" ORDER BY f.datetime_id LIMIT ${idx}"));

    let mut q = sqlx::query_as::<_, EnvironmentResponse>(&query);
    if let Some(ship_id) = &params.ship_id {
        q = q.bind(ship_id);
    }
    if let Some(from) = params.from {
        q = q.bind(from);
    }
    if let Some(to) = params.to {
        q = q.bind(to);
    }
    q = q.bind(limit);

    match q.fetch_all(&state.pool).await {
        Ok(conditions) => Json(serde_json::json!({ "conditions": conditions })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    dotenvy::dotenv().ok();
    let db_url = std::env::var("DATABASE_URL").context("DATABASE_URL env var missing")?;
    let bind = std::env::var("API_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string());

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&db_url)
        .await
        .context("failed to connect to database")?;
    info!("database connected");

    let state = Arc::new(AppState { pool });

    // CORS for dashboards
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/ships", get(ships_handler))
        .route("/positions", get(positions_handler))
        .route("/tanks", get(tanks_handler))
        .route("/environment", get(environment_handler))
        .layer(cors)
        .with_state(state);

    info!(%bind, "API listening");
    info!("  GET /health");
    info!("  GET /ships");
    info!("  GET /positions?ship_id=&from=&to=&limit=");
    info!("  GET /tanks?tank=&ship_id=&limit=");
    info!("  GET /environment?ship_id=&from=&to=&limit=");

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_limit_defaults_and_caps() {
        assert_eq!(clamp_limit(None), DEFAULT_LIMIT);
        assert_eq!(clamp_limit(Some(50)), 50);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(-5)), 1);
        assert_eq!(clamp_limit(Some(10_000)), MAX_LIMIT);
    }
}

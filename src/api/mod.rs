//! Operator surface: health, status, metrics, and the command endpoint.

use crate::adaptation::AdaptationEngine;
use crate::journal::Journal;
use crate::knowledge::KnowledgeStore;
use crate::metrics::Metrics;
use crate::models::CoinStatus;
use crate::orchestrator::HealthRegistry;
use crate::reflection::ReflectionScheduler;
use crate::sniper::SniperHandle;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

#[derive(Clone)]
pub struct ApiContext {
    pub sniper: SniperHandle,
    pub knowledge: KnowledgeStore,
    pub journal: Journal,
    pub adapter: AdaptationEngine,
    pub scheduler: Arc<ReflectionScheduler>,
    pub health: HealthRegistry,
    pub metrics: Arc<Metrics>,
}

#[derive(Debug, Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }

    fn err(message: String) -> Json<Self> {
        Json(Self {
            success: false,
            data: None,
            error: Some(message),
        })
    }
}

#[derive(Debug, Deserialize)]
struct TradeQueryParams {
    limit: Option<usize>,
    symbol: Option<String>,
    pattern: Option<String>,
    since_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum OperatorCommand {
    Pause,
    Resume,
    TriggerReflection,
    Close { symbol: String },
    Blacklist { symbol: String, reason: String },
    Unblacklist { symbol: String },
    RollbackAdaptation { id: String },
}

pub async fn serve(ctx: ApiContext, port: u16) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/health", get(get_health))
        .route("/status", get(get_status))
        .route("/trades", get(get_trades))
        .route("/adaptations", get(get_adaptations))
        .route("/metrics", get(get_metrics))
        .route("/command", post(post_command))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(ctx));

    let addr = format!("0.0.0.0:{}", port);
    info!("🌍 Operator API listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn get_health(State(ctx): State<Arc<ApiContext>>) -> impl IntoResponse {
    let components: std::collections::HashMap<String, _> = ctx.health.all().into_iter().collect();
    ApiResponse::ok(serde_json::json!({
        "overall": ctx.health.overall().to_string(),
        "components": components,
    }))
}

async fn get_status(State(ctx): State<Arc<ApiContext>>) -> impl IntoResponse {
    let Some(snapshot) = ctx.sniper.snapshot().await else {
        return ApiResponse::err("sniper unavailable".to_string());
    };
    let blacklist = ctx.knowledge.get_blacklist().unwrap_or_default();
    let favored = ctx.knowledge.get_favored().unwrap_or_default();
    ApiResponse::ok(serde_json::json!({
        "account": snapshot.account,
        "paused": snapshot.paused,
        "open_positions": snapshot.positions,
        "active_conditions": snapshot.conditions.len(),
        "blacklist": blacklist,
        "favored": favored,
    }))
}

async fn get_trades(
    State(ctx): State<Arc<ApiContext>>,
    Query(params): Query<TradeQueryParams>,
) -> impl IntoResponse {
    let query = crate::journal::JournalQuery {
        since_ms: params.since_ms.unwrap_or(0),
        until_ms: None,
        symbol: params.symbol,
        pattern_id: params.pattern,
        limit: Some(params.limit.unwrap_or(50).min(500)),
    };
    match ctx.journal.query(&query) {
        Ok(trades) => ApiResponse::ok(serde_json::json!({ "trades": trades })),
        Err(e) => ApiResponse::err(e.to_string()),
    }
}

async fn get_adaptations(State(ctx): State<Arc<ApiContext>>) -> impl IntoResponse {
    match ctx.knowledge.get_recent_adaptations(7 * 24 * 3_600_000) {
        Ok(adaptations) => ApiResponse::ok(serde_json::json!({ "adaptations": adaptations })),
        Err(e) => ApiResponse::err(e.to_string()),
    }
}

async fn get_metrics(State(ctx): State<Arc<ApiContext>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&ctx.metrics.registry.gather(), &mut buffer) {
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }
    (StatusCode::OK, buffer).into_response()
}

async fn post_command(
    State(ctx): State<Arc<ApiContext>>,
    Json(command): Json<OperatorCommand>,
) -> impl IntoResponse {
    match command {
        OperatorCommand::Pause => {
            ctx.sniper.pause().await;
            info!("🎛️ Operator paused the engine");
            ApiResponse::ok("paused".to_string())
        }
        OperatorCommand::Resume => {
            ctx.sniper.resume().await;
            info!("🎛️ Operator resumed the engine");
            ApiResponse::ok("resumed".to_string())
        }
        OperatorCommand::TriggerReflection => {
            ctx.scheduler.force();
            ApiResponse::ok("reflection triggered".to_string())
        }
        OperatorCommand::Close { symbol } => {
            if ctx.sniper.manual_close(&symbol).await {
                info!("🎛️ Operator closed the {} position", symbol);
                ApiResponse::ok(format!("{} position closed", symbol))
            } else {
                ApiResponse::err(format!("no open position in {}", symbol))
            }
        }
        OperatorCommand::Blacklist { symbol, reason } => {
            match ctx
                .knowledge
                .set_coin_status(&symbol, CoinStatus::Blacklisted, Some(&reason))
            {
                Ok(()) => {
                    info!("🎛️ Operator blacklisted {}: {}", symbol, reason);
                    ApiResponse::ok(format!("{} blacklisted", symbol))
                }
                Err(e) => ApiResponse::err(e.to_string()),
            }
        }
        OperatorCommand::Unblacklist { symbol } => {
            match ctx.knowledge.set_coin_status(&symbol, CoinStatus::Normal, None) {
                Ok(()) => {
                    info!("🎛️ Operator unblacklisted {}", symbol);
                    ApiResponse::ok(format!("{} unblacklisted", symbol))
                }
                Err(e) => ApiResponse::err(e.to_string()),
            }
        }
        OperatorCommand::RollbackAdaptation { id } => {
            match ctx.knowledge.get_adaptation(&id) {
                Ok(Some(adaptation)) => {
                    match ctx.adapter.rollback(&adaptation, "operator rollback") {
                        Ok(()) => ApiResponse::ok(format!("adaptation {} rolled back", id)),
                        Err(e) => {
                            warn!("🎛️ Rollback of {} failed: {}", id, e);
                            ApiResponse::err(e.to_string())
                        }
                    }
                }
                Ok(None) => ApiResponse::err(format!("unknown adaptation {}", id)),
                Err(e) => ApiResponse::err(e.to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operator_commands_deserialize() {
        let pause: OperatorCommand = serde_json::from_str(r#"{"command":"pause"}"#).unwrap();
        assert!(matches!(pause, OperatorCommand::Pause));

        let blacklist: OperatorCommand = serde_json::from_str(
            r#"{"command":"blacklist","symbol":"DOGE","reason":"manual"}"#,
        )
        .unwrap();
        assert!(matches!(blacklist, OperatorCommand::Blacklist { .. }));

        let close: OperatorCommand =
            serde_json::from_str(r#"{"command":"close","symbol":"BTC"}"#).unwrap();
        assert!(matches!(close, OperatorCommand::Close { .. }));

        let rollback: OperatorCommand =
            serde_json::from_str(r#"{"command":"rollback_adaptation","id":"a1"}"#).unwrap();
        assert!(matches!(rollback, OperatorCommand::RollbackAdaptation { .. }));
    }
}

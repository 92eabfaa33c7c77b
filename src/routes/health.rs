use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::AppState;

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let database = sqlx::query("SELECT 1").execute(&state.pool).await.is_ok();
    let sms = state.sms_provider.health().await;
    let whatsapp = state.whatsapp_provider.health().await;

    let body = json!({
        "status": if database { "ok" } else { "degraded" },
        "database": database,
        "providers": {
            "sms": sms,
            "whatsapp": whatsapp,
        },
    });
    (StatusCode::OK, Json(body))
}

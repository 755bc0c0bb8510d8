use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let gate = &state.gate;

    // A poisoned gate means every new utterance will be refused.
    let status = if gate.is_poisoned() { "degraded" } else { "healthy" };

    HttpResponse::Ok().json(json!({
        "status": status,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": "recognize-server",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "engine": {
            "model": config.engine.model,
            "busy": gate.is_held(),
            "waiting_sessions": gate.waiting(),
            "poisoned": gate.is_poisoned()
        },
        "active_sessions": metrics.active_sessions
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "connections": {
            "total": metrics.connections_total,
            "active": metrics.active_sessions,
            "protocol_violations": metrics.protocol_violations,
            "transport_failures": metrics.transport_failures
        },
        "utterances": {
            "completed": metrics.utterances_completed,
            "aborted": metrics.utterances_aborted,
            "failed": metrics.utterances_failed,
            "average_duration_ms": metrics.average_utterance_ms(),
            "average_finalize_ms": metrics.average_finalize_ms(),
            "per_minute": if uptime_seconds > 0 {
                metrics.utterances_completed as f64 * 60.0 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "engine": {
            "busy": state.gate.is_held(),
            "waiting_sessions": state.gate.waiting(),
            "poisoned": state.gate.is_poisoned()
        }
    }))
}

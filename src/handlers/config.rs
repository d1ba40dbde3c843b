use crate::{
    config::AppConfig,
    error::{AppError, AppResult},
    state::AppState,
};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Public view of the configuration. The API key is reported only as
/// configured or not.
fn config_view(config: &AppConfig) -> serde_json::Value {
    json!({
        "server": {
            "host": config.server.host,
            "port": config.server.port
        },
        "live": {
            "endpoint": config.live.endpoint,
            "model": config.live.model,
            "voice": config.live.voice,
            "system_instruction": config.live.system_instruction,
            "handshake_timeout_ms": config.live.handshake_timeout_ms,
            "api_key_configured": !config.live.api_key.is_empty()
        },
        "audio": {
            "input_sample_rate": config.audio.input_sample_rate,
            "output_sample_rate": config.audio.output_sample_rate,
            "frame_size": config.audio.frame_size
        },
        "performance": {
            "max_concurrent_sessions": config.performance.max_concurrent_sessions,
            "heartbeat_interval_secs": config.performance.heartbeat_interval_secs,
            "client_timeout_secs": config.performance.client_timeout_secs
        }
    })
}

pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config_view(&config)
    })))
}

/// Apply a partial update. New values take effect for consultations started
/// afterwards; running sessions keep the settings they opened with.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> AppResult<HttpResponse> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut updated = state.get_config();
    updated
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state
        .update_config(updated.clone())
        .map_err(AppError::ValidationError)?;

    tracing::info!(
        model = %updated.live.model,
        voice = %updated.live.voice,
        max_sessions = updated.performance.max_concurrent_sessions,
        "Configuration updated"
    );

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": config_view(&updated)
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;
    use actix_web::{http::StatusCode, test, App};

    #[actix_web::test]
    async fn test_config_never_exposes_api_key() {
        let mut config = AppConfig::default();
        config.live.api_key = "secret-key".to_string();
        let state = web::Data::new(test_state(config));
        let app = test::init_service(
            App::new()
                .app_data(state)
                .route("/config", web::get().to(get_config)),
        )
        .await;

        let req = test::TestRequest::get().uri("/config").to_request();
        let body = test::call_and_read_body(&app, req).await;
        let text = String::from_utf8_lossy(&body);
        assert!(!text.contains("secret-key"));

        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["config"]["live"]["api_key_configured"], true);
    }

    #[actix_web::test]
    async fn test_update_config() {
        let state = web::Data::new(test_state(AppConfig::default()));
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"live": {"voice": "Kore"}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(state.get_config().live.voice, "Kore");

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"performance": {"max_concurrent_sessions": 0}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.get_config().performance.max_concurrent_sessions, 10);
    }
}

use crate::{live::VOICES, state::AppState, tools::tool_declarations};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Lists the functions the assistant may call during a consultation and the
/// prebuilt voices it can speak with.
pub async fn list_tools(state: web::Data<AppState>) -> HttpResponse {
    let config = state.get_config();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "model": config.live.model,
        "function_declarations": tool_declarations(),
        "voices": VOICES,
        "current_voice": config.live.voice
    }))
}

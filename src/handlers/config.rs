//! Runtime configuration endpoints.
//!
//! `PUT /api/v1/config` accepts a partial JSON document; see
//! [`AppConfig::update_from_json`](crate::config::AppConfig::update_from_json)
//! for which keys are honoured. Sessions already open keep the settings they
//! were created with.

use crate::error::{AppError, AppResult};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::info;

/// `GET /api/v1/config`
pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config
    })))
}

/// `PUT /api/v1/config`
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

    info!(
        frame_rate = updated.codec.frame_rate,
        crf = updated.codec.crf,
        max_sessions = updated.performance.max_concurrent_sessions,
        "Configuration updated"
    );

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": updated
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::mock::MockCodecBridge;
    use crate::config::AppConfig;
    use actix_web::{http::StatusCode, test, App};
    use std::sync::Arc;

    #[actix_web::test]
    async fn test_partial_update_applies_and_moves_session_limit() {
        let state = AppState::new(AppConfig::default(), Arc::new(MockCodecBridge::new()));
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/config", web::get().to(get_config))
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"codec": {"crf": 28}, "performance": {"max_concurrent_sessions": 5}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        assert_eq!(state.get_config().codec.crf, 28);
        assert_eq!(state.registry.max_sessions(), 5);

        let body: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/config").to_request()).await;
        assert_eq!(body["config"]["codec"]["crf"], 28);
        assert_eq!(body["config"]["codec"]["frame_rate"], 15);
    }

    #[actix_web::test]
    async fn test_invalid_update_is_rejected() {
        let state = AppState::new(AppConfig::default(), Arc::new(MockCodecBridge::new()));
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"codec": {"crf": 99}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.get_config().codec.crf, 23);
    }
}

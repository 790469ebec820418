use crate::{config::AppConfig, error::{AppError, AppResult}, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

// The engine API key never leaves the process; clients only learn whether
// one is configured.
fn config_payload(config: &AppConfig) -> serde_json::Value {
    json!({
        "server": {
            "host": config.server.host,
            "port": config.server.port
        },
        "engine": {
            "ws_url": config.engine.ws_url,
            "agent_id": config.engine.agent_id,
            "api_key_set": config.engine.api_key.is_some()
        },
        "stream": {
            "queue_capacity": config.stream.queue_capacity,
            "drain_wait_ms": config.stream.drain_wait_ms,
            "heartbeat_interval_secs": config.stream.heartbeat_interval_secs,
            "client_timeout_secs": config.stream.client_timeout_secs
        },
        "performance": {
            "max_concurrent_streams": config.performance.max_concurrent_streams
        }
    })
}

pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config_payload(&config)
    })))
}

pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> AppResult<HttpResponse> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state.update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": config_payload(&current_config)
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_get_config_redacts_api_key() {
        let mut config = AppConfig::default();
        config.engine.api_key = Some("sk-secret".to_string());
        let state = AppState::new(config);

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/config", web::get().to(get_config)),
        )
        .await;

        let req = test::TestRequest::get().uri("/config").to_request();
        let body: serde_json::Value =
            test::read_body_json(test::call_service(&app, req).await).await;

        assert_eq!(body["config"]["engine"]["api_key_set"], true);
        assert!(!body.to_string().contains("sk-secret"));
    }

    #[actix_web::test]
    async fn test_update_config_applies_and_echoes() {
        let state = AppState::new(AppConfig::default());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"performance": {"max_concurrent_streams": 25}}))
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert!(resp.status().is_success());
        assert_eq!(state.get_config().performance.max_concurrent_streams, 25);
    }

    #[actix_web::test]
    async fn test_update_config_rejects_invalid_values() {
        let state = AppState::new(AppConfig::default());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"server": {"port": 0}}))
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_REQUEST);
        // The live config must be untouched after a failed update.
        assert_eq!(state.get_config().server.port, 8080);
    }
}

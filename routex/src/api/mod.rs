//! HTTP surface: route table and middleware assembly

pub mod admin;
pub mod ingress;
pub mod oauth;

use axum::{
    extract::DefaultBodyLimit,
    middleware as axum_middleware,
    response::Json,
    routing::{get, post, put},
    Router,
};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::middleware::{
    recovery_layer, request_id_layer, sensitive_headers_layer, RateLimitLayer,
};
use crate::state::AppState;

/// `GET /health` -- liveness
async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// `GET /ready` -- readiness (store reachable)
async fn readiness(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> crate::error::Result<Json<Value>> {
    // One cheap query proves the pool is alive
    state.store.list_channels().await?;
    Ok(Json(json!({ "status": "ready" })))
}

/// Build the full application router
///
/// Stack order, outermost first: recovery, request id, trace, sensitive
/// header masking, rate limit, signature verification, body limit. The hot
/// path and the admin surface share the stack; health probes sit outside the
/// rate limiter.
pub fn router(state: AppState) -> Router {
    let rate_limit = RateLimitLayer::new(
        state.limiter.clone(),
        state.metrics.clone(),
        state.config.rate_limit.enabled,
    );
    let signature = state.signature_layer();

    let hot_path = Router::new()
        .route("/v1/messages", post(ingress::messages))
        .route("/v1/chat/completions", post(ingress::chat_completions))
        .route("/v1/models/{model_action}", post(ingress::generate_content));

    let admin_api = Router::new()
        .route("/api", get(admin::system_status))
        .route(
            "/api/channels",
            get(admin::list_channels).post(admin::create_channel),
        )
        .route("/api/channels/test/all", post(admin::test_all_channels))
        .route(
            "/api/channels/{name}",
            get(admin::get_channel)
                .put(admin::update_channel)
                .delete(admin::delete_channel),
        )
        .route("/api/channels/{name}/test", post(admin::test_channel))
        .route("/api/strategy", put(admin::set_strategy))
        .route(
            "/api/routing/rules",
            get(admin::list_rules).post(admin::create_rule),
        )
        .route(
            "/api/routing/rules/{id}",
            get(admin::get_rule)
                .put(admin::update_rule)
                .delete(admin::delete_rule),
        )
        .route(
            "/api/transformers",
            get(admin::list_transformers).post(admin::install_transformer),
        )
        .route("/api/transformers/{id}", put(admin::update_transformer))
        .route("/api/tee", get(admin::list_tees).post(admin::create_tee))
        .route(
            "/api/tee/{id}",
            put(admin::update_tee).delete(admin::delete_tee),
        )
        .route("/api/analytics", get(admin::analytics))
        .route("/api/metrics", get(admin::metrics))
        .route("/api/metrics/reset", post(admin::reset_metrics))
        .route("/api/requests", get(admin::list_requests))
        .route("/api/tracing/stats", get(admin::tracing_stats))
        .route("/api/tracing/traces", get(admin::list_traces))
        .route("/api/tracing/traces/{id}", get(admin::get_trace))
        .route("/api/tracing/clear", post(admin::clear_traces))
        .route("/api/oauth/providers", get(oauth::list_providers))
        .route("/api/oauth/{provider}/authorize", get(oauth::authorize))
        .route("/api/oauth/callback/{provider}", get(oauth::callback))
        .route(
            "/api/oauth/sessions/{id}",
            get(oauth::get_session).delete(oauth::delete_session),
        );

    let guarded = hot_path
        .merge(admin_api)
        .layer(axum_middleware::from_fn_with_state(
            signature,
            crate::middleware::SignatureLayer::middleware,
        ))
        .layer(axum_middleware::from_fn_with_state(
            rate_limit,
            RateLimitLayer::middleware,
        ))
        .layer(DefaultBodyLimit::max(state.config.server.body_limit_bytes));

    Router::new()
        .route("/health", get(health))
        .route("/ready", get(readiness))
        .merge(guarded)
        .layer(sensitive_headers_layer())
        .layer(TraceLayer::new_for_http())
        .layer(request_id_layer())
        .layer(recovery_layer())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;
    use tower::ServiceExt;

    async fn test_state() -> AppState {
        let mut config = crate::config::Config::default();
        config.crypto.master_password = "api-test-master-password-00000001".to_string();
        config.database.path = ":memory:".to_string();
        AppState::build(config).await.unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoints() {
        let app = router(test_state().await);
        let response = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        let response = app
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn test_admin_status_envelope() {
        let app = router(test_state().await);
        let response = app
            .oneshot(Request::get("/api").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], true);
        assert!(body["data"]["version"].is_string());
        assert_eq!(body["data"]["strategy"], "priority");
        assert_eq!(body["data"]["counts"]["channels"], 0);
    }

    #[tokio::test]
    async fn test_channel_crud_over_http() {
        let app = router(test_state().await);

        let create = Request::post("/api/channels")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({
                    "name": "primary",
                    "vendor": "anthropic",
                    "api_key": "sk-test-abcdef",
                    "models": ["claude-opus-4"],
                    "priority": 10
                })
                .to_string(),
            ))
            .unwrap();
        let response = app.clone().oneshot(create).await.unwrap();
        assert_eq!(response.status(), 200);

        let response = app
            .clone()
            .oneshot(Request::get("/api/channels/primary").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["data"]["name"], "primary");
        // Credential is masked on the way out
        let masked = body["data"]["api_key"].as_str().unwrap();
        assert!(masked.contains("***"));

        let response = app
            .oneshot(
                Request::delete("/api/channels/primary")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn test_unknown_channel_404_envelope() {
        let app = router(test_state().await);
        let response = app
            .oneshot(Request::get("/api/channels/ghost").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), 404);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["type"], "not_found");
    }

    #[tokio::test]
    async fn test_strategy_update() {
        let state = test_state().await;
        let app = router(state.clone());
        let response = app
            .oneshot(
                Request::put("/api/strategy")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({"strategy": "least_used"}).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(
            state.balancer.strategy(),
            crate::models::Strategy::LeastUsed
        );
    }

    #[tokio::test]
    async fn test_hot_path_without_channels_is_503() {
        let app = router(test_state().await);
        let response = app
            .oneshot(
                Request::post("/v1/messages")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({
                            "model": "claude-opus-4",
                            "max_tokens": 16,
                            "messages": [{"role": "user", "content": "hi"}]
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), 503);
    }
}

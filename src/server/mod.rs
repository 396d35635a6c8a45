//! HTTP 接口：战斗模拟客户端通过 `/api/command` 提交战场快照与指令
//!
//! 所有请求共享同一个 AgentRuntime（即同一个懒加载模型），每条命令使用全新的 CastleAgent。

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, Method, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};

use crate::agent::{AgentRuntime, CommandError};

const INVALID_DATA: &str = "Invalid data";

struct AppState {
    runtime: AgentRuntime,
}

type ApiError = (StatusCode, Json<Value>);

fn error_body(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

/// 允许任意来源的跨域请求（模拟客户端通常运行在其它端口）
fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

pub fn router(runtime: AgentRuntime) -> Router {
    let state = Arc::new(AppState { runtime });
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/command", post(api_command))
        .layer(cors())
        .with_state(state)
}

async fn api_status() -> Json<Value> {
    Json(json!({ "status": "online", "message": "API server is running" }))
}

async fn api_command(
    State(state): State<Arc<AppState>>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = body.map_err(|e| {
        tracing::warn!("rejected command body: {}", e);
        error_body(StatusCode::BAD_REQUEST, INVALID_DATA)
    })?;

    // 只拒绝缺失的字段；空指令与空战场照常交给代理
    let command = body.get("command").and_then(|c| c.as_str());
    let records = body.get("gameObjects").and_then(|g| g.as_array());
    let (Some(command), Some(records)) = (command, records) else {
        return Err(error_body(StatusCode::BAD_REQUEST, INVALID_DATA));
    };

    tracing::info!("received command \"{}\" with {} game objects", command, records.len());
    match state.runtime.process_command(records, command, None).await {
        Ok(result) => Ok(Json(json!({ "command": command, "result": result }))),
        Err(e @ CommandError::Decode(_)) => Err(error_body(StatusCode::BAD_REQUEST, e.to_string())),
        Err(e) => {
            tracing::error!("command failed: {}", e);
            Err(error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

/// 绑定地址并一直服务到进程退出
pub async fn serve(runtime: AgentRuntime, addr: SocketAddr) -> anyhow::Result<()> {
    let app = router(runtime);
    tracing::info!("castle API: http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::llm::MockLlmClient;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn app() -> Router {
        router(AgentRuntime::with_client(AppConfig::default(), Arc::new(MockLlmClient::default())))
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn post_json(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/command")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_status() {
        let request = Request::builder().uri("/api/status").body(Body::empty()).unwrap();
        let (status, body) = send(app(), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "online", "message": "API server is running"}));
    }

    #[tokio::test]
    async fn test_missing_fields_are_invalid() {
        let (status, body) = send(app(), post_json(r#"{"command": "charge"}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"error": "Invalid data"}));

        let (status, _) = send(app(), post_json("not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_undecodable_objects_are_bad_request() {
        let (status, body) = send(
            app(),
            post_json(r#"{"command": "charge", "gameObjects": [{"id": 1, "type": "unit", "position": [0, 0]}]}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().starts_with("invalid game objects"));
    }

    #[tokio::test]
    async fn test_command_returns_result() {
        let (status, body) = send(
            app(),
            post_json(
                r#"{"command": "hold", "gameObjects": [{"id": 1, "type": "structure", "position": {"x": 0, "y": 0}, "ally": true}]}"#,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"command": "hold", "result": []}));
    }

    #[tokio::test]
    async fn test_empty_command_and_objects_are_accepted() {
        let (status, body) = send(app(), post_json(r#"{"command": "hold", "gameObjects": []}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"command": "hold", "result": []}));

        let (status, body) = send(app(), post_json(r#"{"command": "", "gameObjects": []}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["command"], "");
    }

    #[tokio::test]
    async fn test_cors_preflight() {
        let request = Request::builder()
            .method("OPTIONS")
            .uri("/api/command")
            .header("origin", "http://localhost:3000")
            .header("access-control-request-method", "POST")
            .body(Body::empty())
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.headers()["access-control-allow-origin"], "*");
    }
}

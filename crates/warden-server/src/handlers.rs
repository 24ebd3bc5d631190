use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Response, StatusCode};
use axum::Json;
use governance::{ProxyRequest, ProxyResponse};
use serde::Serialize;
use serde_json::json;

use crate::error::AppError;
use crate::state::AppState;

const PROXY_PREFIX: &str = "/governance-plane/api/v1/proxy";

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub audit_dropped: u64,
}

pub async fn healthz(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        audit_dropped: control_plane::AuditSink::dropped(state.audit.as_ref()),
    })
}

pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    req: Request,
) -> Result<Response<Body>, AppError> {
    let (parts, body) = req.into_parts();
    let method = parts.method.to_string();
    let path = parts
        .uri
        .path()
        .strip_prefix(PROXY_PREFIX)
        .unwrap_or("")
        .to_string();
    let query = parts.uri.query().map(str::to_string);
    let headers = convert_headers(&parts.headers);
    let client_ip = headers
        .get("x-forwarded-for")
        .and_then(|list| list.split(',').next())
        .map(|ip| ip.trim().to_string());
    let body_bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|err| AppError::internal(err.to_string()))?;

    let proxy_request = ProxyRequest {
        method,
        path,
        query,
        headers,
        body: body_bytes.to_vec(),
        client_ip,
    };

    let response = state.gateway.handle_proxy(proxy_request).await?;
    proxy_response_to_http(response)
}

pub async fn not_found_fallback() -> Result<Response<Body>, AppError> {
    let body = json!({ "error": "not_found", "message": "unknown route" });
    let response = Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .map_err(|err| AppError::internal(err.to_string()))?;
    Ok(response)
}

fn convert_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            map.insert(name.as_str().to_lowercase(), value.to_string());
        }
    }
    map
}

fn proxy_response_to_http(response: ProxyResponse) -> Result<Response<Body>, AppError> {
    let mut builder = Response::builder().status(response.status);
    for (name, value) in response.headers {
        if let (Ok(name), Ok(value)) = (
            name.parse::<header::HeaderName>(),
            HeaderValue::from_str(&value),
        ) {
            builder = builder.header(name, value);
        }
    }
    builder
        .body(Body::from(response.body))
        .map_err(|err| AppError::internal(err.to_string()))
}

//! Relay module
//!
//! Accepts the unified OpenAI-shaped surface and drives each request
//! through channel selection, quota reservation, provider translation,
//! and billing.
//!
//! ## Architecture
//!
//! ```text
//! Request -> Middleware -> Dispatcher -> Adapter -> Upstream
//!               |              |            |
//!               v              v            v
//!          token/user     channel pick   provider wire
//!          resolution     + reservation  translation
//! ```
//!
//! ## API Endpoints
//!
//! - `POST /v1/chat/completions` - chat, streaming and buffered
//! - `POST /v1/completions` - plain completions
//! - `POST /v1/embeddings` - embeddings
//! - `POST /v1/images/generations` - image generation
//! - `GET /v1/models` - models visible to the calling token
//! - `GET /v1/models/:model` - single model detail

pub mod adapters;
pub mod client;
pub mod context;
pub mod dispatch;
pub mod middleware;
pub mod request;
pub mod sse;

use axum::extract::Path;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Json};
use serde_json::{json, Value};

use crate::ability;
use crate::error::GatewayError;

use adapters::RelayMode;

/// Unified chat completions endpoint (OpenAI-compatible).
///
/// Route: POST /v1/chat/completions
pub async fn chat_completions(headers: HeaderMap, Json(payload): Json<Value>) -> impl IntoResponse {
    dispatch::relay_request(headers, payload, RelayMode::ChatCompletions).await
}

/// Plain completions endpoint.
///
/// Route: POST /v1/completions
pub async fn completions(headers: HeaderMap, Json(payload): Json<Value>) -> impl IntoResponse {
    dispatch::relay_request(headers, payload, RelayMode::Completions).await
}

/// Embeddings endpoint.
///
/// Route: POST /v1/embeddings
pub async fn embeddings(headers: HeaderMap, Json(payload): Json<Value>) -> impl IntoResponse {
    dispatch::relay_request(headers, payload, RelayMode::Embeddings).await
}

/// Image generation endpoint.
///
/// Route: POST /v1/images/*
pub async fn images(headers: HeaderMap, Json(payload): Json<Value>) -> impl IntoResponse {
    dispatch::relay_request(headers, payload, RelayMode::Images).await
}

fn visible_models(headers: &HeaderMap) -> Result<Vec<String>, GatewayError> {
    let store = crate::db::global();
    let key = middleware::extract_bearer_key(headers)
        .ok_or_else(|| GatewayError::Unauthorized("missing bearer key".to_string()))?;
    let token = middleware::resolve_token(store, &key)?;
    let user = middleware::resolve_user(store, token.user_id)?;
    let mut models = ability::models_for_group(&user.group);
    if let Some(allowed) = token.allowed_models() {
        models.retain(|m| allowed.iter().any(|a| a == m));
    }
    Ok(models)
}

fn model_object(id: &str) -> Value {
    json!({
        "id": id,
        "object": "model",
        "created": 1700000000,
        "owned_by": "relay-gateway",
        "permission": [],
        "root": id,
        "parent": null
    })
}

/// List models visible to the calling token (OpenAI-compatible).
///
/// Route: GET /v1/models
pub async fn list_models(headers: HeaderMap) -> impl IntoResponse {
    match visible_models(&headers) {
        Ok(models) => {
            let data: Vec<Value> = models.iter().map(|m| model_object(m)).collect();
            Json(json!({ "object": "list", "data": data })).into_response()
        }
        Err(e) => e.into_response(),
    }
}

/// Get model details (OpenAI-compatible).
///
/// Route: GET /v1/models/:model_id
pub async fn get_model(Path(model_id): Path<String>, headers: HeaderMap) -> impl IntoResponse {
    match visible_models(&headers) {
        Ok(models) if models.iter().any(|m| *m == model_id) => {
            Json(model_object(&model_id)).into_response()
        }
        Ok(_) => {
            GatewayError::NotFound(format!("model '{}' is not available", model_id)).into_response()
        }
        Err(e) => e.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_objects_follow_the_list_shape() {
        let obj = model_object("gpt-4o");
        assert_eq!(obj["object"], "model");
        assert_eq!(obj["id"], "gpt-4o");
        assert_eq!(obj["root"], "gpt-4o");
    }
}

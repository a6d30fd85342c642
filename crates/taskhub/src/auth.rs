use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
};

use crate::app::AppState;
use taskhub_models::Identity;

// Axum extractor for Identity — always succeeds.
// Authentication mechanics are out of scope for the core: the bearer token
// (or X-User-Id header) is treated as the opaque current-user id.
#[async_trait]
impl FromRequestParts<AppState> for Identity {
    type Rejection = (StatusCode, String);

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        if let Some(identity) = parts.extensions.get::<Identity>() {
            return Ok(identity.clone());
        }

        let bearer = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|h| h.strip_prefix("Bearer ").map(|s| s.to_string()));

        let header_id = parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        match bearer.or(header_id).filter(|s| !s.is_empty()) {
            Some(id) => Ok(Identity::User { id }),
            None => Ok(Identity::Anonymous),
        }
    }
}

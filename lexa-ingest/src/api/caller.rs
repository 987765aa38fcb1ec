//! Caller identity
//!
//! Authentication happens at the gateway, which forwards the authenticated
//! principal in `X-Caller-Id`. Rate limits are keyed by that value.

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};

use crate::error::ApiError;

pub const CALLER_ID_HEADER: &str = "x-caller-id";

/// Authenticated caller, required by mutating endpoints
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerId(pub String);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for CallerId {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(CALLER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(|id| CallerId(id.to_string()))
            .ok_or_else(|| ApiError::Unauthorized(format!("Missing {} header", CALLER_ID_HEADER)))
    }
}

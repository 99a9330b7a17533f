//! Request-scoped context extracted from HTTP requests.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use runway_id::{EnvId, RequestId};

use crate::api::error::ApiError;
use crate::auth::{AuthError, AuthenticatedEnvironment};
use crate::state::AppState;

pub const AUTHORIZATION_HEADER: &str = "Authorization";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// The caller's request id and authenticated environment.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub environment: AuthenticatedEnvironment,
}

impl RequestContext {
    pub fn env_id(&self) -> &EnvId {
        &self.environment.env_id
    }

    /// Attaches this request's id to an error.
    pub fn error(&self, err: impl Into<ApiError>) -> ApiError {
        err.into().with_request_id(self.request_id.clone())
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn bearer_token(headers: &HeaderMap, request_id: &str) -> Result<String, ApiError> {
    let Some(auth_value) = header_string(headers, AUTHORIZATION_HEADER) else {
        return Err(ApiError::unauthorized(
            "missing_authorization",
            "Authorization header with a Bearer API key is required",
        )
        .with_request_id(request_id.to_string()));
    };

    let Some(token) = auth_value.trim().strip_prefix("Bearer ") else {
        return Err(ApiError::unauthorized(
            "invalid_authorization",
            "Authorization must be a Bearer token",
        )
        .with_request_id(request_id.to_string()));
    };

    let token = token.trim();
    if token.is_empty() {
        return Err(ApiError::unauthorized(
            "invalid_authorization",
            "Authorization Bearer token cannot be empty",
        )
        .with_request_id(request_id.to_string()));
    }
    Ok(token.to_string())
}

impl FromRequestParts<AppState> for RequestContext {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let request_id = header_string(&parts.headers, REQUEST_ID_HEADER)
            .unwrap_or_else(|| RequestId::new().to_string());

        let token = bearer_token(&parts.headers, &request_id)?;

        let environment = state
            .authenticator()
            .authenticate(&token)
            .await
            .map_err(|e| {
                let err = match e {
                    AuthError::InvalidApiKey => {
                        ApiError::unauthorized("invalid_api_key", "Invalid API key")
                    }
                    AuthError::Backend(message) => {
                        ApiError::service_unavailable("auth_unavailable", message)
                    }
                };
                err.with_request_id(request_id.clone())
            })?;

        Ok(Self {
            request_id,
            environment,
        })
    }
}

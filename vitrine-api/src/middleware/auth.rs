use async_trait::async_trait;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use vitrine_core::identity::{IdentityError, IdentityResolver};
use vitrine_shared::UserIdentity;

use crate::error::AppError;
use crate::state::AppState;

// ============================================================================
// JWT Claims
// ============================================================================

/// Claims issued by the storefront's auth provider.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CustomerClaims {
    pub sub: String,
    pub name: String,
    pub email: String,
    pub exp: usize,
}

impl From<CustomerClaims> for UserIdentity {
    fn from(claims: CustomerClaims) -> Self {
        UserIdentity::new(claims.sub, claims.name, claims.email)
    }
}

/// Verifies HS256 bearer tokens against the shared secret.
#[derive(Clone)]
pub struct JwtIdentityResolver {
    key: DecodingKey,
}

impl JwtIdentityResolver {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }
}

#[async_trait]
impl IdentityResolver for JwtIdentityResolver {
    async fn resolve(&self, credential: &str) -> Result<UserIdentity, IdentityError> {
        let token_data = decode::<CustomerClaims>(credential, &self.key, &Validation::default())
            .map_err(|e| IdentityError::InvalidCredentials(e.to_string()))?;
        Ok(token_data.claims.into())
    }
}

// ============================================================================
// Customer Authentication Middleware
// ============================================================================

pub async fn customer_auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    // 1. Extract token from Authorization header
    let token = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or(IdentityError::MissingCredentials)
        .map_err(rejected)?;

    // 2. Resolve the shopper
    let user = state.identity.resolve(token).await.map_err(rejected)?;

    // 3. Inject identity into request extensions
    req.extensions_mut().insert(user);

    Ok(next.run(req).await)
}

fn rejected(err: IdentityError) -> AppError {
    tracing::debug!("Rejected credentials: {}", err);
    AppError::AuthenticationError(err.to_string())
}

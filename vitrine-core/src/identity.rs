use async_trait::async_trait;
use vitrine_shared::UserIdentity;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Missing credentials")]
    MissingCredentials,
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),
}

/// Boundary to the auth collaborator: turns a presented credential into the
/// shopper stamped on reservations.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, credential: &str) -> Result<UserIdentity, IdentityError>;
}

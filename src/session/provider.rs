use super::{Credentials, Session};
use crate::error::AuthFailure;
use crate::store::Identity;
use async_trait::async_trait;

/// Identity provider behind the Session Store.
///
/// Implementations classify their own failures: rejected credentials map to
/// `InvalidCredentials`, dead tokens to `SessionExpired`, and anything the
/// provider itself could not complete (network, bad response) to
/// `ProviderError`.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Establish a new session from credentials.
    async fn sign_in(&self, credentials: &Credentials) -> Result<Session, AuthFailure>;

    /// Exchange a refresh token for a fresh session.
    async fn refresh(&self, refresh_token: &str) -> Result<Session, AuthFailure>;

    /// Resolve the identity behind a live access token.
    async fn user(&self, access_token: &str) -> Result<Identity, AuthFailure>;

    /// Invalidate the session remotely.
    async fn revoke(&self, access_token: &str) -> Result<(), AuthFailure>;
}

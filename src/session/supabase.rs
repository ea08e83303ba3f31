//! Supabase GoTrue identity provider.
//!
//! Talks to the auth REST API of a Supabase project with the public anon key:
//! - `POST /auth/v1/token?grant_type=password` and `grant_type=refresh_token`
//! - `POST /auth/v1/signup`
//! - `GET /auth/v1/user`
//! - `POST /auth/v1/logout`
//!
//! OAuth runs in the browser; its result reaches the core as a redirect
//! fragment handled by [`super::SessionStore::restore`].

use super::{AuthProvider, Credentials, Session};
use crate::config::SupabaseConfig;
use crate::error::AuthFailure;
use crate::store::{Identity, IdentityId};
use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use reqwest::StatusCode;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    expires_at: Option<i64>,
    user: Option<GoTrueUser>,
}

#[derive(Debug, Deserialize)]
struct GoTrueUser {
    id: String,
    email: Option<String>,
}

impl From<GoTrueUser> for Identity {
    fn from(user: GoTrueUser) -> Self {
        Self {
            id: IdentityId::from(user.id),
            email: user.email.filter(|e| !e.is_empty()),
        }
    }
}

/// GoTrue has used several error shapes over time.
#[derive(Debug, Default, Deserialize)]
struct GoTrueError {
    error: Option<String>,
    error_description: Option<String>,
    error_code: Option<String>,
    msg: Option<String>,
    message: Option<String>,
}

impl GoTrueError {
    fn parse(body: &str) -> Self {
        serde_json::from_str(body).unwrap_or_default()
    }

    fn describe(&self, status: StatusCode) -> String {
        self.error_description
            .clone()
            .or_else(|| self.msg.clone())
            .or_else(|| self.message.clone())
            .or_else(|| self.error.clone())
            .unwrap_or_else(|| format!("HTTP {status}"))
    }

    fn is_user_exists(&self) -> bool {
        self.error_code.as_deref() == Some("user_already_exists")
            || self
                .describe(StatusCode::OK)
                .to_ascii_lowercase()
                .contains("already registered")
    }
}

pub struct SupabaseAuthProvider {
    config: SupabaseConfig,
    http: reqwest::Client,
}

impl SupabaseAuthProvider {
    pub fn new(config: SupabaseConfig, timeout: std::time::Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { config, http })
    }

    fn auth_url(&self, path: &str) -> String {
        format!("{}/auth/v1/{}", self.config.url.trim_end_matches('/'), path)
    }

    /// Base headers; `bearer` defaults to the anon key.
    fn headers(&self, bearer: Option<&str>) -> Vec<(&'static str, String)> {
        vec![
            ("apikey", self.config.anon_key.clone()),
            (
                "Authorization",
                format!("Bearer {}", bearer.unwrap_or(&self.config.anon_key)),
            ),
        ]
    }

    async fn post_json(
        &self,
        path: &str,
        bearer: Option<&str>,
        body: &serde_json::Value,
    ) -> Result<(StatusCode, String), AuthFailure> {
        let mut request = self.http.post(self.auth_url(path)).json(body);
        for (key, value) in self.headers(bearer) {
            request = request.header(key, value);
        }
        let resp = request.send().await.map_err(transport)?;
        let status = resp.status();
        let body = resp.text().await.map_err(transport)?;
        Ok((status, body))
    }

    fn session_from(body: &str) -> Result<Session, AuthFailure> {
        let token: TokenResponse = serde_json::from_str(body)
            .map_err(|e| AuthFailure::ProviderError(format!("malformed token response: {e}")))?;
        let (Some(access_token), Some(user)) = (token.access_token, token.user) else {
            return Err(AuthFailure::ProviderError(
                "check your inbox to confirm the email address, then sign in".into(),
            ));
        };
        let now = Utc::now();
        let expires_at = token
            .expires_at
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .or_else(|| {
                token
                    .expires_in
                    .and_then(Duration::try_seconds)
                    .and_then(|delta| now.checked_add_signed(delta))
            })
            .unwrap_or_else(|| now + Duration::hours(1));
        Ok(Session {
            identity: user.into(),
            access_token,
            refresh_token: token.refresh_token.filter(|t| !t.is_empty()),
            expires_at,
        })
    }
}

#[async_trait]
impl AuthProvider for SupabaseAuthProvider {
    fn name(&self) -> &str {
        "supabase"
    }

    async fn sign_in(&self, credentials: &Credentials) -> Result<Session, AuthFailure> {
        match credentials {
            Credentials::Password { email, password } => {
                let (status, body) = self
                    .post_json(
                        "token?grant_type=password",
                        None,
                        &serde_json::json!({ "email": email.trim(), "password": password }),
                    )
                    .await?;
                match status {
                    s if s.is_success() => Self::session_from(&body),
                    StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED => {
                        Err(AuthFailure::InvalidCredentials)
                    }
                    s => Err(AuthFailure::ProviderError(GoTrueError::parse(&body).describe(s))),
                }
            }
            Credentials::SignUp { email, password } => {
                let (status, body) = self
                    .post_json(
                        "signup",
                        None,
                        &serde_json::json!({ "email": email.trim(), "password": password }),
                    )
                    .await?;
                if status.is_success() {
                    return Self::session_from(&body);
                }
                let error = GoTrueError::parse(&body);
                if error.is_user_exists() {
                    return Err(AuthFailure::AccountExists(email.trim().to_string()));
                }
                Err(AuthFailure::ProviderError(error.describe(status)))
            }
            Credentials::OAuth { provider, .. } => Err(AuthFailure::ProviderError(format!(
                "{provider} sign-in completes through the browser redirect"
            ))),
        }
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Session, AuthFailure> {
        let (status, body) = self
            .post_json(
                "token?grant_type=refresh_token",
                None,
                &serde_json::json!({ "refresh_token": refresh_token }),
            )
            .await?;
        match status {
            s if s.is_success() => Self::session_from(&body),
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED => Err(AuthFailure::SessionExpired),
            s => Err(AuthFailure::ProviderError(GoTrueError::parse(&body).describe(s))),
        }
    }

    async fn user(&self, access_token: &str) -> Result<Identity, AuthFailure> {
        let mut request = self.http.get(self.auth_url("user"));
        for (key, value) in self.headers(Some(access_token)) {
            request = request.header(key, value);
        }
        let resp = request.send().await.map_err(transport)?;
        let status = resp.status();
        match status {
            s if s.is_success() => {
                let user: GoTrueUser = resp.json().await.map_err(transport)?;
                Ok(user.into())
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(AuthFailure::SessionExpired),
            s => {
                let body = resp.text().await.unwrap_or_default();
                Err(AuthFailure::ProviderError(GoTrueError::parse(&body).describe(s)))
            }
        }
    }

    async fn revoke(&self, access_token: &str) -> Result<(), AuthFailure> {
        let (status, body) = self
            .post_json("logout", Some(access_token), &serde_json::json!({}))
            .await?;
        // An already-dead token is as good as revoked
        if status.is_success() || status == StatusCode::UNAUTHORIZED {
            return Ok(());
        }
        Err(AuthFailure::ProviderError(
            GoTrueError::parse(&body).describe(status),
        ))
    }
}

fn transport(err: reqwest::Error) -> AuthFailure {
    AuthFailure::ProviderError(format!("auth request failed: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> SupabaseAuthProvider {
        SupabaseAuthProvider::new(
            SupabaseConfig {
                url: server.uri(),
                anon_key: "anon-key".into(),
            },
            std::time::Duration::from_secs(5),
        )
        .unwrap()
    }

    fn token_body(access: &str) -> serde_json::Value {
        serde_json::json!({
            "access_token": access,
            "token_type": "bearer",
            "expires_in": 3600,
            "expires_at": 1_900_000_000,
            "refresh_token": "refresh-1",
            "user": { "id": "uuid-alice", "email": "alice@example.com" }
        })
    }

    fn password(email: &str, pw: &str) -> Credentials {
        Credentials::Password {
            email: email.into(),
            password: pw.into(),
        }
    }

    #[tokio::test]
    async fn password_grant_returns_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .and(query_param("grant_type", "password"))
            .and(header("apikey", "anon-key"))
            .and(body_json(serde_json::json!({
                "email": "alice@example.com",
                "password": "pw123456"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("access-1")))
            .expect(1)
            .mount(&server)
            .await;

        let session = provider(&server)
            .sign_in(&password(" alice@example.com ", "pw123456"))
            .await
            .unwrap();
        assert_eq!(session.identity.id.as_str(), "uuid-alice");
        assert_eq!(session.access_token, "access-1");
        assert_eq!(session.refresh_token.as_deref(), Some("refresh-1"));
        assert_eq!(session.expires_at.timestamp(), 1_900_000_000);
    }

    #[tokio::test]
    async fn rejected_password_is_invalid_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "Invalid login credentials"
            })))
            .mount(&server)
            .await;

        let err = provider(&server)
            .sign_in(&password("alice@example.com", "wrong"))
            .await
            .unwrap_err();
        assert_eq!(err, AuthFailure::InvalidCredentials);
    }

    #[tokio::test]
    async fn duplicate_signup_is_account_exists() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/signup"))
            .respond_with(ResponseTemplate::new(422).set_body_json(serde_json::json!({
                "code": 422,
                "error_code": "user_already_exists",
                "msg": "User already registered"
            })))
            .mount(&server)
            .await;

        let err = provider(&server)
            .sign_in(&Credentials::SignUp {
                email: "alice@example.com".into(),
                password: "pw123456".into(),
            })
            .await
            .unwrap_err();
        assert_eq!(err, AuthFailure::AccountExists("alice@example.com".into()));
    }

    #[tokio::test]
    async fn signup_pending_confirmation_is_provider_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/signup"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "uuid-new",
                "email": "new@example.com"
            })))
            .mount(&server)
            .await;

        let err = provider(&server)
            .sign_in(&Credentials::SignUp {
                email: "new@example.com".into(),
                password: "pw123456".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AuthFailure::ProviderError(m) if m.contains("confirm")));
    }

    #[tokio::test]
    async fn refresh_grant_and_expired_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .and(query_param("grant_type", "refresh_token"))
            .and(body_json(serde_json::json!({ "refresh_token": "refresh-1" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("access-2")))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .and(query_param("grant_type", "refresh_token"))
            .and(body_json(serde_json::json!({ "refresh_token": "stale" })))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "Invalid Refresh Token"
            })))
            .mount(&server)
            .await;

        let provider = provider(&server);
        let session = provider.refresh("refresh-1").await.unwrap();
        assert_eq!(session.access_token, "access-2");
        assert_eq!(
            provider.refresh("stale").await.unwrap_err(),
            AuthFailure::SessionExpired
        );
    }

    #[tokio::test]
    async fn user_lookup_uses_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/v1/user"))
            .and(header("Authorization", "Bearer access-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "uuid-alice",
                "email": "alice@example.com",
                "role": "authenticated"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/auth/v1/user"))
            .and(header("Authorization", "Bearer dead"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let provider = provider(&server);
        let identity = provider.user("access-1").await.unwrap();
        assert_eq!(identity.id.as_str(), "uuid-alice");
        assert_eq!(identity.email.as_deref(), Some("alice@example.com"));
        assert_eq!(
            provider.user("dead").await.unwrap_err(),
            AuthFailure::SessionExpired
        );
    }

    #[tokio::test]
    async fn logout_tolerates_dead_tokens_but_reports_outages() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/logout"))
            .and(header("Authorization", "Bearer access-1"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/logout"))
            .and(header("Authorization", "Bearer dead"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/logout"))
            .and(header("Authorization", "Bearer flaky"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let provider = provider(&server);
        provider.revoke("access-1").await.unwrap();
        provider.revoke("dead").await.unwrap();
        assert!(matches!(
            provider.revoke("flaky").await.unwrap_err(),
            AuthFailure::ProviderError(_)
        ));
    }

    #[tokio::test]
    async fn oauth_credentials_are_not_accepted_directly() {
        let server = MockServer::start().await;
        let err = provider(&server)
            .sign_in(&Credentials::OAuth {
                provider: "google".into(),
                subject: "g-1".into(),
                email: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AuthFailure::ProviderError(_)));
    }

    #[tokio::test]
    async fn unreachable_server_is_provider_error() {
        let provider = SupabaseAuthProvider::new(
            SupabaseConfig {
                url: "http://127.0.0.1:9".into(),
                anon_key: "anon-key".into(),
            },
            std::time::Duration::from_millis(500),
        )
        .unwrap();
        let err = provider.user("token").await.unwrap_err();
        assert!(matches!(err, AuthFailure::ProviderError(_)));
    }
}

//! Session Store: the current authenticated identity and its lifecycle.
//!
//! ## Design
//! - One [`SessionState`] is current at a time, starting at `Unknown`
//! - Providers sit behind [`AuthProvider`]: a local SQLite provider and Supabase GoTrue
//! - Every material change (identity or expiry) is broadcast as a [`SessionChange`]
//! - Tokens never leave this module; the rest of the core only sees an [`Identity`]

pub mod local;
pub mod provider;
pub mod store;
pub mod supabase;

pub use local::LocalAuthProvider;
pub use provider::AuthProvider;
pub use store::SessionStore;
pub use supabase::SupabaseAuthProvider;

use crate::error::AuthFailure;
use crate::store::{Identity, IdentityId};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// An authenticated session issued by an [`AuthProvider`].
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub identity: Identity,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn identity_id(&self) -> &IdentityId {
        &self.identity.id
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Expired, or close enough to expiry that it should be refreshed now.
    pub fn needs_refresh(&self, now: DateTime<Utc>, leeway: std::time::Duration) -> bool {
        let leeway = Duration::from_std(leeway).unwrap_or_else(|_| Duration::zero());
        now.checked_add_signed(leeway)
            .map_or(true, |deadline| self.expires_at <= deadline)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("identity", &self.identity)
            .field("access_token", &"[redacted]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[redacted]"),
            )
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing restored yet. Only ever the initial state.
    Unknown,
    Anonymous,
    Authenticated(Session),
}

impl SessionState {
    pub fn session(&self) -> Option<&Session> {
        match self {
            Self::Authenticated(session) => Some(session),
            _ => None,
        }
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.session().map(|s| &s.identity)
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated(_))
    }

    /// Same kind, identity and expiry. Token rotation alone is not a change.
    pub fn same_as(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Unknown, Self::Unknown) | (Self::Anonymous, Self::Anonymous) => true,
            (Self::Authenticated(a), Self::Authenticated(b)) => {
                a.identity.id == b.identity.id && a.expires_at == b.expires_at
            }
            _ => false,
        }
    }
}

/// Broadcast whenever the current session materially changes.
#[derive(Debug, Clone)]
pub struct SessionChange {
    pub previous: SessionState,
    pub current: SessionState,
}

impl SessionChange {
    /// The identity that just became current, if it differs from the previous one.
    pub fn signed_in(&self) -> Option<&Identity> {
        let current = self.current.identity()?;
        match self.previous.identity() {
            Some(previous) if previous.id == current.id => None,
            _ => Some(current),
        }
    }
}

pub enum Credentials {
    Password { email: String, password: String },
    SignUp { email: String, password: String },
    /// Identity asserted by an external OAuth provider after its callback.
    OAuth {
        provider: String,
        subject: String,
        email: Option<String>,
    },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password { email, .. } => f
                .debug_struct("Password")
                .field("email", email)
                .finish_non_exhaustive(),
            Self::SignUp { email, .. } => f
                .debug_struct("SignUp")
                .field("email", email)
                .finish_non_exhaustive(),
            Self::OAuth {
                provider,
                subject,
                email,
            } => f
                .debug_struct("OAuth")
                .field("provider", provider)
                .field("subject", subject)
                .field("email", email)
                .finish(),
        }
    }
}

/// Tokens handed back in an OAuth redirect fragment
/// (`#access_token=...&refresh_token=...&expires_at=...`).
#[derive(Clone, PartialEq, Eq)]
pub struct RedirectTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for RedirectTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedirectTokens")
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Parse a redirect fragment. `Ok(None)` when it carries no tokens at all,
/// `Err(ProviderError)` when the provider reported a failure.
pub fn parse_redirect_fragment(
    fragment: &str,
    now: DateTime<Utc>,
) -> Result<Option<RedirectTokens>, AuthFailure> {
    let fragment = fragment.trim().trim_start_matches('#');
    let mut access_token = None;
    let mut refresh_token = None;
    let mut expires_at = None;
    let mut expires_in = None;
    let mut error = None;
    let mut error_description = None;

    for pair in fragment.split('&').filter(|p| !p.is_empty()) {
        let (key, raw) = pair.split_once('=').unwrap_or((pair, ""));
        let value = urlencoding::decode(&raw.replace('+', " "))
            .map(|v| v.into_owned())
            .map_err(|_| AuthFailure::ProviderError(format!("malformed redirect value for {key}")))?;
        match key {
            "access_token" => access_token = Some(value),
            "refresh_token" => refresh_token = Some(value).filter(|v| !v.is_empty()),
            "expires_at" => expires_at = value.parse::<i64>().ok(),
            "expires_in" => expires_in = value.parse::<i64>().ok(),
            "error" => error = Some(value),
            "error_description" => error_description = Some(value),
            _ => {}
        }
    }

    if let Some(error) = error {
        return Err(AuthFailure::ProviderError(
            error_description.unwrap_or(error),
        ));
    }
    let Some(access_token) = access_token.filter(|t| !t.is_empty()) else {
        return Ok(None);
    };
    let expires_at = expires_at
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .or_else(|| {
            expires_in
                .and_then(Duration::try_seconds)
                .and_then(|delta| now.checked_add_signed(delta))
        })
        .ok_or_else(|| AuthFailure::ProviderError("redirect is missing token expiry".into()))?;

    Ok(Some(RedirectTokens {
        access_token,
        refresh_token,
        expires_at,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str, expires_at: DateTime<Utc>) -> Session {
        Session {
            identity: Identity {
                id: IdentityId::from(id),
                email: Some(format!("{id}@example.com")),
            },
            access_token: "secret-access".into(),
            refresh_token: Some("secret-refresh".into()),
            expires_at,
        }
    }

    #[test]
    fn debug_output_redacts_tokens() {
        let rendered = format!("{:?}", session("alice", Utc::now()));
        assert!(!rendered.contains("secret-access"));
        assert!(!rendered.contains("secret-refresh"));
        assert!(rendered.contains("alice"));

        let creds = Credentials::Password {
            email: "a@example.com".into(),
            password: "hunter22".into(),
        };
        assert!(!format!("{creds:?}").contains("hunter22"));
    }

    #[test]
    fn token_rotation_is_not_a_material_change() {
        let expiry = Utc::now() + Duration::hours(1);
        let a = SessionState::Authenticated(session("alice", expiry));
        let mut rotated = session("alice", expiry);
        rotated.access_token = "other".into();
        assert!(a.same_as(&SessionState::Authenticated(rotated)));

        let later = SessionState::Authenticated(session("alice", expiry + Duration::hours(1)));
        assert!(!a.same_as(&later));
        assert!(!a.same_as(&SessionState::Anonymous));
        assert!(!SessionState::Unknown.same_as(&SessionState::Anonymous));
    }

    #[test]
    fn needs_refresh_honours_leeway() {
        let now = Utc::now();
        let s = session("alice", now + Duration::seconds(30));
        assert!(!s.is_expired(now));
        assert!(s.needs_refresh(now, std::time::Duration::from_secs(60)));
        assert!(!s.needs_refresh(now, std::time::Duration::from_secs(10)));
    }

    #[test]
    fn signed_in_reports_new_identity_only() {
        let expiry = Utc::now() + Duration::hours(1);
        let change = SessionChange {
            previous: SessionState::Anonymous,
            current: SessionState::Authenticated(session("alice", expiry)),
        };
        assert_eq!(change.signed_in().unwrap().id.as_str(), "alice");

        let refresh = SessionChange {
            previous: SessionState::Authenticated(session("alice", expiry)),
            current: SessionState::Authenticated(session("alice", expiry + Duration::hours(1))),
        };
        assert!(refresh.signed_in().is_none());
    }

    #[test]
    fn fragment_with_tokens_parses() {
        let now = Utc::now();
        let tokens = parse_redirect_fragment(
            "#access_token=abc.def&refresh_token=r1&expires_at=1900000000&token_type=bearer",
            now,
        )
        .unwrap()
        .unwrap();
        assert_eq!(tokens.access_token, "abc.def");
        assert_eq!(tokens.refresh_token.as_deref(), Some("r1"));
        assert_eq!(tokens.expires_at.timestamp(), 1_900_000_000);
    }

    #[test]
    fn fragment_falls_back_to_expires_in() {
        let now = Utc::now();
        let tokens = parse_redirect_fragment("access_token=abc&expires_in=3600", now)
            .unwrap()
            .unwrap();
        assert_eq!(tokens.expires_at, now + Duration::seconds(3600));
        assert!(tokens.refresh_token.is_none());
    }

    #[test]
    fn fragment_without_tokens_is_none() {
        assert!(parse_redirect_fragment("", Utc::now()).unwrap().is_none());
        assert!(parse_redirect_fragment("#state=xyz", Utc::now())
            .unwrap()
            .is_none());
    }

    #[test]
    fn fragment_error_is_provider_error() {
        let err = parse_redirect_fragment(
            "#error=access_denied&error_description=User+denied%20access",
            Utc::now(),
        )
        .unwrap_err();
        assert_eq!(err, AuthFailure::ProviderError("User denied access".into()));
    }
}

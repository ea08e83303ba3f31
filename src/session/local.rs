//! SQLite-backed identity provider.
//!
//! Tables:
//! - `users`: id, email, password_hash, salt, created_at
//! - `oauth_links`: provider, subject, user_id
//! - `sessions`: access_hash, refresh_hash, user_id, expires_at, refresh_expires_at
//!
//! Tokens are random and only their SHA-256 digests are stored. A refresh
//! rotates both tokens; the old pair stops working immediately.

use super::{AuthProvider, Credentials, Session};
use crate::error::AuthFailure;
use crate::store::{Identity, IdentityId};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;

/// Token byte length before hex encoding (32 bytes = 64 hex chars).
const TOKEN_BYTES: usize = 32;

/// Salt byte length for password hashing.
const SALT_BYTES: usize = 16;

/// Number of SHA-256 iterations for password stretching.
const HASH_ITERATIONS: u32 = 100_000;

/// How long a refresh token stays usable: 30 days.
const REFRESH_TTL_SECS: i64 = 30 * 24 * 3600;

const MIN_PASSWORD_LEN: usize = 8;

struct Inner {
    conn: Mutex<Connection>,
    session_ttl_secs: i64,
    oauth_providers: Vec<String>,
}

pub struct LocalAuthProvider {
    inner: Arc<Inner>,
}

impl LocalAuthProvider {
    /// Open (or create) the auth database at the given path.
    pub fn open(
        db_path: &Path,
        session_ttl_secs: u64,
        oauth_providers: &[String],
    ) -> anyhow::Result<Self> {
        let conn = Connection::open(db_path)?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT UNIQUE COLLATE NOCASE,
                password_hash TEXT,
                salt TEXT,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS oauth_links (
                provider TEXT NOT NULL,
                subject TEXT NOT NULL,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                linked_at INTEGER NOT NULL,
                PRIMARY KEY (provider, subject)
            );

            CREATE TABLE IF NOT EXISTS sessions (
                access_hash TEXT PRIMARY KEY,
                refresh_hash TEXT NOT NULL UNIQUE,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                refresh_expires_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);",
        )?;

        Ok(Self {
            inner: Arc::new(Inner {
                conn: Mutex::new(conn),
                session_ttl_secs: i64::try_from(session_ttl_secs).unwrap_or(i64::MAX / 2),
                oauth_providers: oauth_providers
                    .iter()
                    .map(|p| p.trim().to_ascii_lowercase())
                    .collect(),
            }),
        })
    }

    /// Run `f` on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, AuthFailure>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T, AuthFailure> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| AuthFailure::ProviderError(format!("auth task failed: {e}")))?
    }
}

#[async_trait]
impl AuthProvider for LocalAuthProvider {
    fn name(&self) -> &str {
        "local"
    }

    async fn sign_in(&self, credentials: &Credentials) -> Result<Session, AuthFailure> {
        match credentials {
            Credentials::Password { email, password } => {
                let (email, password) = (email.clone(), password.clone());
                self.blocking(move |inner| {
                    let identity = inner.authenticate(&email, &password)?;
                    inner.create_session(identity)
                })
                .await
            }
            Credentials::SignUp { email, password } => {
                let (email, password) = (email.clone(), password.clone());
                self.blocking(move |inner| {
                    let identity = inner.register(&email, &password)?;
                    tracing::info!(identity = %identity.id, "Registered local user");
                    inner.create_session(identity)
                })
                .await
            }
            Credentials::OAuth {
                provider,
                subject,
                email,
            } => {
                let (provider, subject, email) = (
                    provider.trim().to_ascii_lowercase(),
                    subject.clone(),
                    email.clone(),
                );
                self.blocking(move |inner| {
                    let identity = inner.link_oauth(&provider, &subject, email.as_deref())?;
                    inner.create_session(identity)
                })
                .await
            }
        }
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Session, AuthFailure> {
        let refresh_hash = hash_token(refresh_token);
        self.blocking(move |inner| inner.rotate(&refresh_hash)).await
    }

    async fn user(&self, access_token: &str) -> Result<Identity, AuthFailure> {
        let access_hash = hash_token(access_token);
        self.blocking(move |inner| inner.validate(&access_hash)).await
    }

    async fn revoke(&self, access_token: &str) -> Result<(), AuthFailure> {
        let access_hash = hash_token(access_token);
        self.blocking(move |inner| {
            inner
                .conn
                .lock()
                .execute(
                    "DELETE FROM sessions WHERE access_hash = ?1",
                    params![access_hash],
                )
                .map_err(storage)?;
            Ok(())
        })
        .await
    }
}

impl Inner {
    fn register(&self, email: &str, password: &str) -> Result<Identity, AuthFailure> {
        let email = email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(AuthFailure::ProviderError(
                "a valid email address is required".into(),
            ));
        }
        if password.len() < MIN_PASSWORD_LEN {
            return Err(AuthFailure::ProviderError(format!(
                "password must be at least {MIN_PASSWORD_LEN} characters"
            )));
        }

        let id = IdentityId::generate();
        let salt = generate_salt();
        let password_hash = hash_password(password, &salt);

        let conn = self.conn.lock();
        let result = conn.execute(
            "INSERT INTO users (id, email, password_hash, salt, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id.as_str(), email, password_hash, salt, epoch_secs()],
        );

        match result {
            Ok(_) => Ok(Identity {
                id,
                email: Some(email.to_string()),
            }),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(AuthFailure::AccountExists(email.to_string()))
            }
            Err(e) => Err(storage(e)),
        }
    }

    fn authenticate(&self, email: &str, password: &str) -> Result<Identity, AuthFailure> {
        let conn = self.conn.lock();
        let row: Option<(String, String, Option<String>, Option<String>)> = conn
            .query_row(
                "SELECT id, email, password_hash, salt FROM users WHERE email = ?1 COLLATE NOCASE",
                params![email.trim()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()
            .map_err(storage)?;

        match row {
            Some((id, stored_email, Some(stored_hash), Some(salt))) => {
                let attempt_hash = hash_password(password, &salt);
                if !constant_time_eq(stored_hash.as_bytes(), attempt_hash.as_bytes()) {
                    return Err(AuthFailure::InvalidCredentials);
                }
                Ok(Identity {
                    id: IdentityId::from(id),
                    email: Some(stored_email),
                })
            }
            _ => {
                // Dummy hash so unknown and OAuth-only emails take as long as a bad password
                let _ = hash_password(password, "0000000000000000");
                Err(AuthFailure::InvalidCredentials)
            }
        }
    }

    fn link_oauth(
        &self,
        provider: &str,
        subject: &str,
        email: Option<&str>,
    ) -> Result<Identity, AuthFailure> {
        if !self.oauth_providers.iter().any(|p| p == provider) {
            return Err(AuthFailure::ProviderError(format!(
                "oauth provider '{provider}' is not enabled"
            )));
        }
        if subject.trim().is_empty() {
            return Err(AuthFailure::ProviderError(
                "oauth callback carried no subject".into(),
            ));
        }
        let email = email.map(str::trim).filter(|e| !e.is_empty());

        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(storage)?;

        let linked: Option<String> = tx
            .query_row(
                "SELECT user_id FROM oauth_links WHERE provider = ?1 AND subject = ?2",
                params![provider, subject],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage)?;

        let user_id = match linked {
            Some(user_id) => user_id,
            None => {
                let existing: Option<String> = match email {
                    Some(email) => tx
                        .query_row(
                            "SELECT id FROM users WHERE email = ?1 COLLATE NOCASE",
                            params![email],
                            |row| row.get(0),
                        )
                        .optional()
                        .map_err(storage)?,
                    None => None,
                };
                let user_id = match existing {
                    Some(id) => id,
                    None => {
                        let id = IdentityId::generate().to_string();
                        tx.execute(
                            "INSERT INTO users (id, email, created_at) VALUES (?1, ?2, ?3)",
                            params![id, email, epoch_secs()],
                        )
                        .map_err(storage)?;
                        id
                    }
                };
                tx.execute(
                    "INSERT INTO oauth_links (provider, subject, user_id, linked_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![provider, subject, user_id, epoch_secs()],
                )
                .map_err(storage)?;
                tracing::info!(provider, identity = %user_id, "OAuth identity linked");
                user_id
            }
        };

        // Backfill only; a recorded email is never overwritten
        if let Some(email) = email {
            tx.execute(
                "UPDATE users SET email = ?1 WHERE id = ?2 AND email IS NULL
                 AND NOT EXISTS (SELECT 1 FROM users WHERE email = ?1 COLLATE NOCASE)",
                params![email, user_id],
            )
            .map_err(storage)?;
        }
        let stored_email: Option<String> = tx
            .query_row(
                "SELECT email FROM users WHERE id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .map_err(storage)?;
        tx.commit().map_err(storage)?;

        Ok(Identity {
            id: IdentityId::from(user_id),
            email: stored_email,
        })
    }

    fn create_session(&self, identity: Identity) -> Result<Session, AuthFailure> {
        let conn = self.conn.lock();
        insert_session(&conn, identity, self.session_ttl_secs)
    }

    fn validate(&self, access_hash: &str) -> Result<Identity, AuthFailure> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT u.id, u.email FROM sessions s
             JOIN users u ON s.user_id = u.id
             WHERE s.access_hash = ?1 AND s.expires_at > ?2",
            params![access_hash, epoch_secs()],
            |row| {
                Ok(Identity {
                    id: IdentityId::from(row.get::<_, String>(0)?),
                    email: row.get(1)?,
                })
            },
        )
        .optional()
        .map_err(storage)?
        .ok_or(AuthFailure::SessionExpired)
    }

    fn rotate(&self, refresh_hash: &str) -> Result<Session, AuthFailure> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(storage)?;
        let identity = tx
            .query_row(
                "SELECT u.id, u.email FROM sessions s
                 JOIN users u ON s.user_id = u.id
                 WHERE s.refresh_hash = ?1 AND s.refresh_expires_at > ?2",
                params![refresh_hash, epoch_secs()],
                |row| {
                    Ok(Identity {
                        id: IdentityId::from(row.get::<_, String>(0)?),
                        email: row.get(1)?,
                    })
                },
            )
            .optional()
            .map_err(storage)?
            .ok_or(AuthFailure::SessionExpired)?;

        tx.execute(
            "DELETE FROM sessions WHERE refresh_hash = ?1",
            params![refresh_hash],
        )
        .map_err(storage)?;
        let session = insert_session(&tx, identity, self.session_ttl_secs)?;
        tx.commit().map_err(storage)?;
        Ok(session)
    }
}

fn insert_session(
    conn: &Connection,
    identity: Identity,
    ttl_secs: i64,
) -> Result<Session, AuthFailure> {
    let access_token = generate_token();
    let refresh_token = generate_token();
    let now = epoch_secs();
    let expires_at = now.saturating_add(ttl_secs);

    conn.execute(
        "INSERT INTO sessions (access_hash, refresh_hash, user_id, created_at, expires_at, refresh_expires_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            hash_token(&access_token),
            hash_token(&refresh_token),
            identity.id.as_str(),
            now,
            expires_at,
            now.saturating_add(REFRESH_TTL_SECS.max(ttl_secs)),
        ],
    )
    .map_err(storage)?;

    Ok(Session {
        identity,
        access_token,
        refresh_token: Some(refresh_token),
        expires_at: from_epoch_secs(expires_at),
    })
}

fn storage(err: rusqlite::Error) -> AuthFailure {
    tracing::warn!(error = %err, "Auth database error");
    AuthFailure::ProviderError(format!("auth database error: {err}"))
}

// ── Cryptographic Helpers ───────────────────────────────────────────

/// Generate a random salt (hex-encoded).
fn generate_salt() -> String {
    let mut bytes = [0u8; SALT_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Generate a random opaque token (hex-encoded).
fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Hash a password with salt using iterated SHA-256.
fn hash_password(password: &str, salt: &str) -> String {
    let mut hash = Sha256::new();
    hash.update(salt.as_bytes());
    hash.update(password.as_bytes());
    let mut result = hash.finalize();

    for _ in 1..HASH_ITERATIONS {
        let mut h = Sha256::new();
        h.update(result);
        h.update(salt.as_bytes());
        result = h.finalize();
    }

    hex::encode(result)
}

/// Tokens are already high-entropy, one pass is enough.
fn hash_token(token: &str) -> String {
    let mut h = Sha256::new();
    h.update(token.as_bytes());
    hex::encode(h.finalize())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn epoch_secs() -> i64 {
    Utc::now().timestamp()
}

fn from_epoch_secs(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

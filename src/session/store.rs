use super::{
    parse_redirect_fragment, AuthProvider, Credentials, LocalAuthProvider, Session,
    SessionChange, SessionState, SupabaseAuthProvider,
};
use crate::config::{AuthProviderKind, Config};
use crate::error::AuthFailure;
use crate::store::Identity;
use chrono::Utc;
use parking_lot::RwLock;
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Owns the current session.
///
/// State transitions (restore, sign-in, sign-out, revalidation) run one at a
/// time. Readers never wait on them: [`SessionStore::state`] is a snapshot.
/// With persistence enabled the session lives in a JSON file shared by every
/// client on the machine, so a refresh or sign-out in one is picked up by the
/// others on their next revalidation.
pub struct SessionStore {
    provider: Arc<dyn AuthProvider>,
    state: RwLock<SessionState>,
    changes: broadcast::Sender<SessionChange>,
    transitions: Mutex<()>,
    persist_path: Option<PathBuf>,
    refresh_leeway: Duration,
    remote_timeout: Duration,
}

impl SessionStore {
    pub fn new(
        provider: Arc<dyn AuthProvider>,
        persist_path: Option<PathBuf>,
        refresh_leeway: Duration,
        remote_timeout: Duration,
    ) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            provider,
            state: RwLock::new(SessionState::Unknown),
            changes,
            transitions: Mutex::new(()),
            persist_path,
            refresh_leeway,
            remote_timeout,
        }
    }

    /// Build the store with the provider selected in `[session]`.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let remote_timeout = config.store.remote_timeout();
        let provider: Arc<dyn AuthProvider> = match config.session.provider {
            AuthProviderKind::Local => {
                std::fs::create_dir_all(&config.data_dir)?;
                Arc::new(LocalAuthProvider::open(
                    &config.auth_db_path(),
                    config.session.ttl_secs,
                    &config.session.oauth_providers,
                )?)
            }
            AuthProviderKind::Supabase => {
                let supabase = config.supabase.clone().ok_or_else(|| {
                    anyhow::anyhow!("session.provider = \"supabase\" requires a [supabase] section")
                })?;
                Arc::new(SupabaseAuthProvider::new(supabase, remote_timeout)?)
            }
        };
        let persist_path = config
            .session
            .persist
            .then(|| config.session_file_path());
        Ok(Self::new(
            provider,
            persist_path,
            config.session.refresh_leeway(),
            remote_timeout,
        ))
    }

    pub fn state(&self) -> SessionState {
        self.state.read().clone()
    }

    pub fn current(&self) -> Option<Session> {
        self.state.read().session().cloned()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.state.read().identity().cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionChange> {
        self.changes.subscribe()
    }

    /// Recover a session from an OAuth redirect fragment, the current state,
    /// or the persisted session file, refreshing it if it is about to expire.
    pub async fn restore(&self, fragment: Option<&str>) -> Result<Option<Session>, AuthFailure> {
        let _guard = self.transitions.lock().await;

        if let Some(fragment) = fragment {
            match self.adopt_fragment(fragment).await {
                Ok(Some(session)) => return Ok(Some(session)),
                Ok(None) => {}
                Err(e) => {
                    self.settle_unknown();
                    return Err(e);
                }
            }
        }

        if let Some(session) = self.current() {
            return Ok(self.keep_fresh(session).await);
        }
        match self.load_persisted() {
            Some(session) => Ok(self.keep_fresh(session).await),
            None => {
                self.transition(SessionState::Anonymous);
                Ok(None)
            }
        }
    }

    pub async fn sign_in(&self, credentials: &Credentials) -> Result<Session, AuthFailure> {
        let _guard = self.transitions.lock().await;
        let session = self.remote(self.provider.sign_in(credentials)).await?;
        tracing::info!(
            identity = %session.identity.id,
            provider = self.provider.name(),
            "Signed in"
        );
        self.install(session.clone());
        Ok(session)
    }

    /// Best-effort remote invalidation, then an unconditional local clear.
    pub async fn sign_out(&self) {
        let _guard = self.transitions.lock().await;
        if let Some(session) = self.current() {
            if let Err(e) = self.remote(self.provider.revoke(&session.access_token)).await {
                tracing::warn!(
                    identity = %session.identity.id,
                    error = %e,
                    "Remote sign-out failed, clearing local session anyway"
                );
            }
        }
        self.clear_persisted();
        self.transition(SessionState::Anonymous);
    }

    /// Re-check the session after the client regains focus. Emits a change
    /// only if identity or expiry actually moved.
    pub async fn revalidate(&self) -> Result<Option<Session>, AuthFailure> {
        let _guard = self.transitions.lock().await;

        let Some(current) = self.current() else {
            return Ok(match self.load_persisted() {
                Some(session) => self.keep_fresh(session).await,
                None => {
                    self.transition(SessionState::Anonymous);
                    None
                }
            });
        };

        // Another client may have refreshed, switched account, or signed out
        let session = match (&self.persist_path, self.load_persisted()) {
            (Some(_), None) => {
                tracing::info!(identity = %current.identity.id, "Session cleared elsewhere");
                self.transition(SessionState::Anonymous);
                return Ok(None);
            }
            (_, Some(stored))
                if stored.identity.id != current.identity.id
                    || stored.expires_at > current.expires_at =>
            {
                stored
            }
            _ => current,
        };

        if session.needs_refresh(Utc::now(), self.refresh_leeway) {
            return Ok(self.keep_fresh(session).await);
        }
        match self.remote(self.provider.user(&session.access_token)).await {
            Ok(identity) => {
                let mut session = session;
                if identity.email.is_some() {
                    session.identity.email = identity.email;
                }
                self.install(session.clone());
                Ok(Some(session))
            }
            Err(AuthFailure::SessionExpired | AuthFailure::InvalidCredentials) => {
                Ok(self.renew(session).await)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Session revalidation failed, keeping current session");
                self.transition(SessionState::Authenticated(session.clone()));
                Ok(Some(session))
            }
        }
    }

    async fn adopt_fragment(&self, fragment: &str) -> Result<Option<Session>, AuthFailure> {
        let Some(tokens) = parse_redirect_fragment(fragment, Utc::now())? else {
            return Ok(None);
        };
        if let Some(current) = self.current() {
            if current.access_token == tokens.access_token {
                return Ok(Some(current));
            }
        }
        let identity = self.remote(self.provider.user(&tokens.access_token)).await?;
        let session = Session {
            identity,
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_at: tokens.expires_at,
        };
        tracing::info!(identity = %session.identity.id, "Session restored from redirect");
        self.install(session.clone());
        Ok(Some(session))
    }

    /// Keep `session` if it is fresh enough, otherwise renew it.
    async fn keep_fresh(&self, session: Session) -> Option<Session> {
        if session.needs_refresh(Utc::now(), self.refresh_leeway) {
            return self.renew(session).await;
        }
        self.transition(SessionState::Authenticated(session.clone()));
        Some(session)
    }

    async fn renew(&self, session: Session) -> Option<Session> {
        let now = Utc::now();
        let Some(refresh_token) = session.refresh_token.as_deref() else {
            if session.is_expired(now) {
                self.expire(&session);
                return None;
            }
            self.transition(SessionState::Authenticated(session.clone()));
            return Some(session);
        };

        match self.remote(self.provider.refresh(refresh_token)).await {
            Ok(renewed) => {
                tracing::debug!(identity = %renewed.identity.id, "Session refreshed");
                self.install(renewed.clone());
                Some(renewed)
            }
            Err(AuthFailure::ProviderError(e)) if !session.is_expired(now) => {
                tracing::warn!(error = %e, "Session refresh failed, keeping unexpired session");
                self.transition(SessionState::Authenticated(session.clone()));
                Some(session)
            }
            Err(AuthFailure::ProviderError(e)) => {
                // Leave the file in place so a later restore can retry the refresh
                tracing::warn!(error = %e, "Session refresh failed");
                self.transition(SessionState::Anonymous);
                None
            }
            Err(_) => {
                self.expire(&session);
                None
            }
        }
    }

    fn expire(&self, session: &Session) {
        tracing::info!(identity = %session.identity.id, "Session expired");
        self.clear_persisted();
        self.transition(SessionState::Anonymous);
    }

    /// A failed first restore still resolves the initial state.
    fn settle_unknown(&self) {
        if matches!(*self.state.read(), SessionState::Unknown) {
            self.transition(SessionState::Anonymous);
        }
    }

    fn install(&self, session: Session) {
        self.persist(&session);
        self.transition(SessionState::Authenticated(session));
    }

    /// Replace the state and broadcast if it materially changed.
    fn transition(&self, next: SessionState) {
        let mut state = self.state.write();
        if state.same_as(&next) {
            *state = next;
            return;
        }
        let previous = std::mem::replace(&mut *state, next.clone());
        drop(state);

        tracing::debug!(
            from = state_name(&previous),
            to = state_name(&next),
            "Session state changed"
        );
        // No subscribers is fine
        let _ = self.changes.send(SessionChange {
            previous,
            current: next,
        });
    }

    async fn remote<T>(
        &self,
        fut: impl Future<Output = Result<T, AuthFailure>>,
    ) -> Result<T, AuthFailure> {
        tokio::time::timeout(self.remote_timeout, fut)
            .await
            .map_err(|_| {
                AuthFailure::ProviderError(format!(
                    "identity provider did not answer within {}ms",
                    self.remote_timeout.as_millis()
                ))
            })?
    }

    // ── Persistence ─────────────────────────────────────────────

    fn persist(&self, session: &Session) {
        let Some(path) = &self.persist_path else {
            return;
        };
        if let Err(e) = write_session_file(path, session) {
            tracing::warn!(path = %path.display(), error = %e, "Failed to persist session");
        }
    }

    fn load_persisted(&self) -> Option<Session> {
        let path = self.persist_path.as_ref()?;
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read session file");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(session) => Some(session),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Discarding unreadable session file");
                self.clear_persisted();
                None
            }
        }
    }

    fn clear_persisted(&self) {
        let Some(path) = &self.persist_path else {
            return;
        };
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove session file");
            }
        }
    }
}

fn write_session_file(path: &Path, session: &Session) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
    // The file holds live tokens; keep it readable by the owner only.
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(&tmp)?;
    file.write_all(&serde_json::to_vec(session)?)?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn state_name(state: &SessionState) -> &'static str {
    match state {
        SessionState::Unknown => "unknown",
        SessionState::Anonymous => "anonymous",
        SessionState::Authenticated(_) => "authenticated",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::LocalAuthProvider;
    use crate::store::IdentityId;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const LEEWAY: Duration = Duration::from_secs(60);
    const TIMEOUT: Duration = Duration::from_secs(5);

    fn local_provider(tmp: &TempDir) -> Arc<dyn AuthProvider> {
        Arc::new(
            LocalAuthProvider::open(&tmp.path().join("auth.db"), 3600, &["google".to_string()])
                .unwrap(),
        )
    }

    fn session_file(tmp: &TempDir) -> PathBuf {
        tmp.path().join("session.json")
    }

    fn sign_up(email: &str) -> Credentials {
        Credentials::SignUp {
            email: email.into(),
            password: "password123!".into(),
        }
    }

    /// Answers every user lookup as alice after a short delay; revoke hangs.
    struct SlowProvider {
        user_calls: AtomicUsize,
    }

    #[async_trait]
    impl AuthProvider for SlowProvider {
        fn name(&self) -> &str {
            "slow"
        }

        async fn sign_in(&self, _credentials: &Credentials) -> Result<Session, AuthFailure> {
            Ok(Session {
                identity: alice(),
                access_token: "access".into(),
                refresh_token: None,
                expires_at: Utc::now() + chrono::Duration::hours(1),
            })
        }

        async fn refresh(&self, _refresh_token: &str) -> Result<Session, AuthFailure> {
            Err(AuthFailure::SessionExpired)
        }

        async fn user(&self, _access_token: &str) -> Result<Identity, AuthFailure> {
            self.user_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(alice())
        }

        async fn revoke(&self, _access_token: &str) -> Result<(), AuthFailure> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    fn alice() -> Identity {
        Identity {
            id: IdentityId::from("alice"),
            email: Some("alice@example.com".into()),
        }
    }

    fn drain(rx: &mut broadcast::Receiver<SessionChange>) -> Vec<SessionChange> {
        let mut out = Vec::new();
        while let Ok(change) = rx.try_recv() {
            out.push(change);
        }
        out
    }

    #[tokio::test]
    async fn empty_restore_settles_anonymous_once() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(local_provider(&tmp), Some(session_file(&tmp)), LEEWAY, TIMEOUT);
        let mut rx = store.subscribe();
        assert_eq!(store.state(), SessionState::Unknown);

        assert!(store.restore(None).await.unwrap().is_none());
        assert!(store.restore(None).await.unwrap().is_none());

        let changes = drain(&mut rx);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].previous, SessionState::Unknown);
        assert_eq!(changes[0].current, SessionState::Anonymous);
    }

    #[tokio::test]
    async fn persisted_session_survives_restart() {
        let tmp = TempDir::new().unwrap();
        let provider = local_provider(&tmp);
        let first = SessionStore::new(Arc::clone(&provider), Some(session_file(&tmp)), LEEWAY, TIMEOUT);
        let session = first.sign_in(&sign_up("alice@example.com")).await.unwrap();

        let second = SessionStore::new(provider, Some(session_file(&tmp)), LEEWAY, TIMEOUT);
        let mut rx = second.subscribe();
        let restored = second.restore(None).await.unwrap().unwrap();
        assert_eq!(restored.identity.id, session.identity.id);
        assert_eq!(restored.access_token, session.access_token);

        let changes = drain(&mut rx);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].signed_in().unwrap().id, session.identity.id);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn session_file_is_private_to_the_owner() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(local_provider(&tmp), Some(session_file(&tmp)), LEEWAY, TIMEOUT);
        store.sign_in(&sign_up("alice@example.com")).await.unwrap();

        let mode = std::fs::metadata(session_file(&tmp)).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let leftovers = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn expiring_persisted_session_is_refreshed() {
        let tmp = TempDir::new().unwrap();
        let provider = local_provider(&tmp);
        let store = SessionStore::new(Arc::clone(&provider), Some(session_file(&tmp)), LEEWAY, TIMEOUT);
        let mut session = store.sign_in(&sign_up("alice@example.com")).await.unwrap();

        session.expires_at = Utc::now() - chrono::Duration::seconds(1);
        write_session_file(&session_file(&tmp), &session).unwrap();

        let fresh = SessionStore::new(provider, Some(session_file(&tmp)), LEEWAY, TIMEOUT);
        let renewed = fresh.restore(None).await.unwrap().unwrap();
        assert_eq!(renewed.identity.id, session.identity.id);
        assert_ne!(renewed.access_token, session.access_token);
        assert!(renewed.expires_at > Utc::now());
    }

    #[tokio::test]
    async fn expired_session_without_refresh_is_dropped() {
        let tmp = TempDir::new().unwrap();
        let stale = Session {
            identity: alice(),
            access_token: "old".into(),
            refresh_token: None,
            expires_at: Utc::now() - chrono::Duration::minutes(5),
        };
        write_session_file(&session_file(&tmp), &stale).unwrap();

        let store = SessionStore::new(local_provider(&tmp), Some(session_file(&tmp)), LEEWAY, TIMEOUT);
        assert!(store.restore(None).await.unwrap().is_none());
        assert_eq!(store.state(), SessionState::Anonymous);
        assert!(!session_file(&tmp).exists());
    }

    #[tokio::test]
    async fn concurrent_fragment_restores_resolve_once() {
        let provider = Arc::new(SlowProvider {
            user_calls: AtomicUsize::new(0),
        });
        let store = SessionStore::new(provider.clone(), None, LEEWAY, TIMEOUT);
        let mut rx = store.subscribe();
        let fragment = "#access_token=tok&refresh_token=ref&expires_in=3600";

        let (a, b) = tokio::join!(store.restore(Some(fragment)), store.restore(Some(fragment)));
        assert_eq!(a.unwrap().unwrap().identity.id.as_str(), "alice");
        assert_eq!(b.unwrap().unwrap().identity.id.as_str(), "alice");
        assert_eq!(provider.user_calls.load(Ordering::SeqCst), 1);
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn fragment_error_is_provider_error() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(local_provider(&tmp), None, LEEWAY, TIMEOUT);
        let err = store
            .restore(Some("#error=access_denied&error_description=denied"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthFailure::ProviderError(_)));
        assert_eq!(store.state(), SessionState::Anonymous);
    }

    #[tokio::test]
    async fn sign_out_clears_locally_when_remote_hangs() {
        let tmp = TempDir::new().unwrap();
        let provider = Arc::new(SlowProvider {
            user_calls: AtomicUsize::new(0),
        });
        let store = SessionStore::new(
            provider,
            Some(session_file(&tmp)),
            LEEWAY,
            Duration::from_millis(50),
        );
        store
            .sign_in(&Credentials::Password {
                email: "alice@example.com".into(),
                password: "x".into(),
            })
            .await
            .unwrap();
        assert!(session_file(&tmp).exists());
        let mut rx = store.subscribe();

        tokio::time::timeout(Duration::from_secs(2), store.sign_out())
            .await
            .expect("sign-out must not wait on the remote call");
        assert_eq!(store.state(), SessionState::Anonymous);
        assert!(!session_file(&tmp).exists());
        let changes = drain(&mut rx);
        assert_eq!(changes.len(), 1);
        assert!(changes[0].previous.is_authenticated());
    }

    #[tokio::test]
    async fn sign_out_revokes_remotely() {
        let tmp = TempDir::new().unwrap();
        let provider = local_provider(&tmp);
        let store = SessionStore::new(Arc::clone(&provider), None, LEEWAY, TIMEOUT);
        let session = store.sign_in(&sign_up("alice@example.com")).await.unwrap();

        store.sign_out().await;
        assert_eq!(
            provider.user(&session.access_token).await.unwrap_err(),
            AuthFailure::SessionExpired
        );
    }

    #[tokio::test]
    async fn failed_sign_in_keeps_state() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(local_provider(&tmp), None, LEEWAY, TIMEOUT);
        store.restore(None).await.unwrap();

        let err = store
            .sign_in(&Credentials::Password {
                email: "nobody@example.com".into(),
                password: "password123!".into(),
            })
            .await
            .unwrap_err();
        assert_eq!(err, AuthFailure::InvalidCredentials);
        assert_eq!(store.state(), SessionState::Anonymous);
    }

    #[tokio::test]
    async fn revalidate_is_quiet_for_unchanged_session() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(local_provider(&tmp), Some(session_file(&tmp)), LEEWAY, TIMEOUT);
        let session = store.sign_in(&sign_up("alice@example.com")).await.unwrap();
        let mut rx = store.subscribe();

        let again = store.revalidate().await.unwrap().unwrap();
        assert_eq!(again.identity.id, session.identity.id);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn revalidate_drops_remotely_revoked_session() {
        let tmp = TempDir::new().unwrap();
        let provider = local_provider(&tmp);
        let store = SessionStore::new(Arc::clone(&provider), None, LEEWAY, TIMEOUT);
        let session = store.sign_in(&sign_up("alice@example.com")).await.unwrap();

        provider.revoke(&session.access_token).await.unwrap();
        let mut rx = store.subscribe();
        assert!(store.revalidate().await.unwrap().is_none());
        assert_eq!(store.state(), SessionState::Anonymous);
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn revalidate_follows_sign_out_in_another_client() {
        let tmp = TempDir::new().unwrap();
        let provider = local_provider(&tmp);
        let tab_a = SessionStore::new(Arc::clone(&provider), Some(session_file(&tmp)), LEEWAY, TIMEOUT);
        let tab_b = SessionStore::new(provider, Some(session_file(&tmp)), LEEWAY, TIMEOUT);

        tab_a.sign_in(&sign_up("alice@example.com")).await.unwrap();
        assert!(tab_b.restore(None).await.unwrap().is_some());

        tab_a.sign_out().await;
        assert!(tab_b.revalidate().await.unwrap().is_none());
        assert_eq!(tab_b.state(), SessionState::Anonymous);
    }
}

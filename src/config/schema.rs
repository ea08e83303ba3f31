use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration, loaded from `config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    /// Directory holding `credits.db`, `auth.db` and the persisted session token.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub supabase: Option<SupabaseConfig>,
    #[serde(default = "default_plans")]
    pub plans: Vec<PlanConfig>,
    #[serde(default)]
    pub checkout: CheckoutConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            store: StoreConfig::default(),
            ledger: LedgerConfig::default(),
            jobs: JobsConfig::default(),
            session: SessionConfig::default(),
            supabase: None,
            plans: default_plans(),
            checkout: CheckoutConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("ai", "opzen", "opzen")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".opzen"))
}

// ── Store ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StoreConfig {
    /// Upper bound for any single store call before it is classified unreachable.
    #[serde(default = "default_remote_timeout_ms")]
    pub remote_timeout_ms: u64,
    /// How long SQLite waits on a lock held by another client.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Attempts for read paths that hit an unreachable store.
    #[serde(default = "default_read_retries")]
    pub read_retries: u32,
    /// First backoff delay for read retries; doubled per attempt.
    #[serde(default = "default_read_backoff_ms")]
    pub read_backoff_ms: u64,
}

impl StoreConfig {
    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms.max(1))
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn read_backoff(&self) -> Duration {
        Duration::from_millis(self.read_backoff_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            remote_timeout_ms: default_remote_timeout_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
            read_retries: default_read_retries(),
            read_backoff_ms: default_read_backoff_ms(),
        }
    }
}

fn default_remote_timeout_ms() -> u64 {
    15_000
}
fn default_busy_timeout_ms() -> u64 {
    5_000
}
fn default_read_retries() -> u32 {
    3
}
fn default_read_backoff_ms() -> u64 {
    200
}

// ── Ledger ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LedgerConfig {
    /// Credits granted once when an account is first opened.
    #[serde(default = "default_welcome_grant")]
    pub welcome_grant: u64,
    /// Optimistic-concurrency retries before a write is reported as `Conflict`.
    #[serde(default = "default_max_conflict_retries")]
    pub max_conflict_retries: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            welcome_grant: default_welcome_grant(),
            max_conflict_retries: default_max_conflict_retries(),
        }
    }
}

fn default_welcome_grant() -> u64 {
    100
}
fn default_max_conflict_retries() -> u32 {
    5
}

// ── Jobs ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobsConfig {
    /// A pending job without a heartbeat for this long is considered abandoned.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    /// Period of the background sweep.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Terminal jobs older than this are purged by the sweeper.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    /// Run one scoped sweep whenever a session becomes authenticated.
    #[serde(default = "default_true")]
    pub sweep_on_session_start: bool,
}

impl JobsConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            retention_secs: default_retention_secs(),
            sweep_on_session_start: true,
        }
    }
}

fn default_stale_after_secs() -> u64 {
    15 * 60
}
fn default_sweep_interval_secs() -> u64 {
    5 * 60
}
fn default_retention_secs() -> u64 {
    30 * 24 * 3600
}
fn default_true() -> bool {
    true
}

// ── Session ─────────────────────────────────────────────────────

/// Which identity provider backs the Session Store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum AuthProviderKind {
    Local,
    Supabase,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SessionConfig {
    #[serde(default = "default_provider")]
    pub provider: AuthProviderKind,
    /// Lifetime of sessions issued by the local provider.
    #[serde(default = "default_session_ttl_secs")]
    pub ttl_secs: u64,
    /// Refresh a session this long before it expires.
    #[serde(default = "default_refresh_leeway_secs")]
    pub refresh_leeway_secs: u64,
    /// OAuth providers accepted by the local provider.
    #[serde(default = "default_oauth_providers")]
    pub oauth_providers: Vec<String>,
    /// Keep the current session in `session.json` so it survives restarts.
    #[serde(default = "default_true")]
    pub persist: bool,
}

impl SessionConfig {
    pub fn refresh_leeway(&self) -> Duration {
        Duration::from_secs(self.refresh_leeway_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            ttl_secs: default_session_ttl_secs(),
            refresh_leeway_secs: default_refresh_leeway_secs(),
            oauth_providers: default_oauth_providers(),
            persist: true,
        }
    }
}

fn default_provider() -> AuthProviderKind {
    AuthProviderKind::Local
}
fn default_session_ttl_secs() -> u64 {
    3600
}
fn default_refresh_leeway_secs() -> u64 {
    60
}
fn default_oauth_providers() -> Vec<String> {
    vec!["google".into()]
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SupabaseConfig {
    /// Project URL, e.g. `https://xxxx.supabase.co`.
    pub url: String,
    /// Public anon key used for the auth endpoints.
    pub anon_key: String,
}

// ── Plans & checkout ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PlanConfig {
    pub id: String,
    pub name: String,
    /// Price in the smallest unit of `currency`.
    pub price: u64,
    pub currency: String,
    pub credits: u64,
    pub duration_months: u32,
    #[serde(default)]
    pub description: String,
}

fn default_plans() -> Vec<PlanConfig> {
    vec![
        PlanConfig {
            id: "plan_starter".into(),
            name: "Starter".into(),
            price: 299_000,
            currency: "VND".into(),
            credits: 3_000,
            duration_months: 1,
            description: "Entry plan for new users.".into(),
        },
        PlanConfig {
            id: "plan_pro".into(),
            name: "Pro".into(),
            price: 599_000,
            currency: "VND".into(),
            credits: 7_000,
            duration_months: 2,
            description: "6,000 base + 1,000 bonus credits.".into(),
        },
        PlanConfig {
            id: "plan_ultra".into(),
            name: "Ultra".into(),
            price: 1_999_000,
            currency: "VND".into(),
            credits: 25_000,
            duration_months: 3,
            description: "20,000 base + 5,000 bonus credits, priority support.".into(),
        },
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CheckoutConfig {
    pub bank_name: String,
    pub account_holder: String,
    pub account_number: String,
    /// Transfer memo; `{reference}` and `{plan}` are substituted.
    pub memo_template: String,
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            bank_name: "MB Bank".into(),
            account_holder: "NGUYEN VAN A".into(),
            account_number: "0123456789".into(),
            memo_template: "{reference} {plan}".into(),
        }
    }
}

// ── Gateway ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Shared secret for `X-Signature` on payment webhooks. Unsigned requests
    /// are accepted only when this is unset.
    #[serde(default)]
    pub webhook_secret: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            webhook_secret: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8787".into()
}
fn default_request_timeout_secs() -> u64 {
    30
}

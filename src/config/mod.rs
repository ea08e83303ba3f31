//! Configuration loading.
//!
//! A missing file yields defaults. Environment variables override the file for
//! deployment-specific values (data directory, secrets, Supabase project).

mod schema;

pub use schema::{
    AuthProviderKind, CheckoutConfig, Config, GatewayConfig, JobsConfig, LedgerConfig,
    PlanConfig, SessionConfig, StoreConfig, SupabaseConfig,
};

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

impl Config {
    /// Default config file location: `$OPZEN_CONFIG` or the platform config dir.
    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("OPZEN_CONFIG") {
            if !path.trim().is_empty() {
                return PathBuf::from(path);
            }
        }
        directories::ProjectDirs::from("ai", "opzen", "opzen")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .unwrap_or_else(|| PathBuf::from("opzen.toml"))
    }

    /// Load from `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            Self::from_toml(&raw)
                .with_context(|| format!("Failed to parse config: {}", path.display()))?
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Write the config to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config dir: {}", parent.display()))?;
        }
        let raw = toml::to_string_pretty(self)?;
        std::fs::write(path, raw)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Some(dir) = env_non_empty("OPZEN_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(secret) = env_non_empty("OPZEN_WEBHOOK_SECRET") {
            self.gateway.webhook_secret = Some(secret);
        }
        if let (Some(url), Some(anon_key)) = (
            env_non_empty("SUPABASE_URL"),
            env_non_empty("SUPABASE_ANON_KEY"),
        ) {
            self.supabase = Some(SupabaseConfig { url, anon_key });
        }
    }

    pub fn credits_db_path(&self) -> PathBuf {
        self.data_dir.join("credits.db")
    }

    pub fn auth_db_path(&self) -> PathBuf {
        self.data_dir.join("auth.db")
    }

    pub fn session_file_path(&self) -> PathBuf {
        self.data_dir.join("session.json")
    }

    /// JSON schema of the config file.
    pub fn json_schema() -> serde_json::Value {
        serde_json::to_value(schemars::schema_for!(Config)).unwrap_or_default()
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

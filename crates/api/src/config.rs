//! API server configuration

use anyhow::{Context, Result};
use medibook_shared::settings::{env_var, parse_env};
use medibook_shared::{DuplicatePolicy, JobSettings, ReaperConfig, DEFAULT_MAX_ATTEMPTS};

const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";
const DEFAULT_ALLOWED_ORIGINS: &str = "http://localhost:3000,http://127.0.0.1:3000";

#[derive(Clone)]
pub struct Config {
    pub database_url: String,
    pub jwt_secret: String,
    pub jwt_expiry_hours: i64,
    pub bind_address: String,
    /// When set, `/cron/cleanup` requires `Authorization: Bearer <secret>`
    pub cron_secret: Option<String>,
    pub whatsapp_verify_token: Option<String>,
    pub duplicate_policy: DuplicatePolicy,
    pub webhook_max_attempts: i32,
    pub reaper: ReaperConfig,
    pub allowed_origins: Vec<String>,
    pub run_migrations: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let jwt_secret = std::env::var("JWT_SECRET").context("JWT_SECRET must be set")?;

        // Shared with the worker so both reap and retry on the same terms
        let jobs = JobSettings::from_env()?;

        let allowed_origins = env_var("ALLOWED_ORIGINS")
            .unwrap_or_else(|| DEFAULT_ALLOWED_ORIGINS.to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            database_url,
            jwt_secret,
            jwt_expiry_hours: parse_env("JWT_EXPIRY_HOURS", 24)?,
            bind_address: env_var("BIND_ADDRESS")
                .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string()),
            cron_secret: env_var("CRON_SECRET"),
            whatsapp_verify_token: env_var("WHATSAPP_VERIFY_TOKEN"),
            duplicate_policy: jobs.duplicate_policy,
            webhook_max_attempts: jobs.webhook_max_attempts,
            reaper: jobs.reaper,
            allowed_origins,
            run_migrations: parse_env("RUN_MIGRATIONS", false)?,
        })
    }

    /// Configuration for tests and local tooling
    pub fn for_tests(jwt_secret: &str) -> Self {
        Self {
            database_url: String::new(),
            jwt_secret: jwt_secret.to_string(),
            jwt_expiry_hours: 24,
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            cron_secret: None,
            whatsapp_verify_token: None,
            duplicate_policy: DuplicatePolicy::default(),
            webhook_max_attempts: DEFAULT_MAX_ATTEMPTS,
            reaper: ReaperConfig::default(),
            allowed_origins: Vec::new(),
            run_migrations: false,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("database_url", &"[REDACTED]")
            .field("jwt_secret", &"[REDACTED]")
            .field("jwt_expiry_hours", &self.jwt_expiry_hours)
            .field("bind_address", &self.bind_address)
            .field("cron_secret", &self.cron_secret.as_ref().map(|_| "[REDACTED]"))
            .field("duplicate_policy", &self.duplicate_policy)
            .field("webhook_max_attempts", &self.webhook_max_attempts)
            .field("reaper", &self.reaper)
            .field("allowed_origins", &self.allowed_origins)
            .field("run_migrations", &self.run_migrations)
            .finish()
    }
}

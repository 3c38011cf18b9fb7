use thiserror::Error;

#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub(super) runtime: RuntimeSettings,
    pub(super) database: DatabaseSettings,
    pub(super) redis: RedisSettings,
    pub(super) ai: AiSettings,
    pub(super) worker: WorkerSettings,
    pub(super) telemetry: TelemetrySettings,
}

#[derive(Debug, Clone)]
pub(crate) struct DatabaseSettings {
    pub(crate) postgres_server: String,
    pub(crate) postgres_port: u16,
    pub(crate) postgres_user: String,
    pub(crate) postgres_password: String,
    pub(crate) postgres_db: String,
    pub(crate) database_url: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct RedisSettings {
    pub(crate) host: Option<String>,
    pub(crate) port: u16,
    pub(crate) db: u16,
    pub(crate) password: String,
    pub(crate) url: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct AiSettings {
    pub(crate) openai_api_key: String,
    pub(crate) openai_base_url: String,
    pub(crate) ai_model: String,
    pub(crate) ai_max_tokens: u32,
    pub(crate) ai_request_timeout: u64,
    pub(crate) ai_max_score: f64,
}

#[derive(Debug, Clone)]
pub(crate) struct WorkerSettings {
    pub(crate) concurrency: usize,
    pub(crate) max_attempts: u32,
    pub(crate) backoff_base_secs: u64,
    pub(crate) backoff_cap_secs: u64,
    pub(crate) lease_timeout_secs: u64,
    pub(crate) poll_interval_secs: u64,
    pub(crate) sweep_interval_secs: u64,
    pub(crate) pending_orphan_secs: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct TelemetrySettings {
    pub(crate) log_level: String,
    pub(crate) json: bool,
    pub(crate) prometheus_enabled: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct RuntimeSettings {
    pub(crate) environment: Environment,
    pub(crate) strict_config: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Environment {
    Development,
    Production,
    Staging,
    Test,
}

impl Environment {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Staging => "staging",
            Self::Test => "test",
        }
    }

    pub(super) fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }
}

#[derive(Debug, Error)]
pub(crate) enum ConfigError {
    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
    #[error("missing required secret for {0}")]
    MissingSecret(&'static str),
}

impl DatabaseSettings {
    pub(crate) fn database_url(&self) -> String {
        if let Some(url) = &self.database_url {
            return url.clone();
        }

        format!(
            "postgresql://{}:{}@{}:{}/{}",
            self.postgres_user,
            self.postgres_password,
            self.postgres_server,
            self.postgres_port,
            self.postgres_db
        )
    }
}

impl RedisSettings {
    /// `None` means no Redis is configured and the in-memory queue backend
    /// should be used instead.
    pub(crate) fn redis_url(&self) -> Option<String> {
        if let Some(url) = &self.url {
            return Some(url.clone());
        }

        let host = self.host.as_ref()?;
        if self.password.is_empty() {
            Some(format!("redis://{}:{}/{}", host, self.port, self.db))
        } else {
            Some(format!("redis://:{}@{}:{}/{}", self.password, host, self.port, self.db))
        }
    }
}

use super::parsing::{
    env_optional, env_or_default, parse_bool, parse_environment, parse_f64, parse_u16, parse_u32,
    parse_u64, parse_usize,
};
use super::types::{
    AiSettings, ConfigError, DatabaseSettings, RedisSettings, RuntimeSettings, Settings,
    TelemetrySettings, WorkerSettings,
};

impl Settings {
    pub(crate) fn load() -> Result<Self, ConfigError> {
        let environment =
            parse_environment(env_optional("SCRIBA_ENV").or_else(|| env_optional("ENVIRONMENT")));
        let strict_config =
            env_optional("SCRIBA_STRICT_CONFIG").map(|value| parse_bool(&value)).unwrap_or(false)
                || environment.is_production();

        let postgres_server = env_or_default("POSTGRES_SERVER", "localhost");
        let postgres_port = parse_u16("POSTGRES_PORT", env_or_default("POSTGRES_PORT", "5432"))?;
        let postgres_user = env_or_default("POSTGRES_USER", "scriba");
        let postgres_password = env_or_default("POSTGRES_PASSWORD", "");
        let postgres_db = env_or_default("POSTGRES_DB", "scriba_db");
        let database_url = env_optional("DATABASE_URL");

        let redis_host = env_optional("REDIS_HOST");
        let redis_port = parse_u16("REDIS_PORT", env_or_default("REDIS_PORT", "6379"))?;
        let redis_db = parse_u16("REDIS_DB", env_or_default("REDIS_DB", "0"))?;
        let redis_password = env_or_default("REDIS_PASSWORD", "");
        let redis_url = env_optional("REDIS_URL");

        let openai_api_key = env_or_default("OPENAI_API_KEY", "");
        let openai_base_url = env_or_default("OPENAI_BASE_URL", "");
        let ai_model = env_or_default("AI_MODEL", "gpt-4o");
        let ai_max_tokens = parse_u32("AI_MAX_TOKENS", env_or_default("AI_MAX_TOKENS", "4000"))?;
        let ai_request_timeout =
            parse_u64("AI_REQUEST_TIMEOUT", env_or_default("AI_REQUEST_TIMEOUT", "120"))?;
        let ai_max_score = parse_f64("AI_MAX_SCORE", env_or_default("AI_MAX_SCORE", "100"))?;

        let concurrency =
            parse_usize("WORKER_CONCURRENCY", env_or_default("WORKER_CONCURRENCY", "4"))?;
        let max_attempts = parse_u32("MAX_ATTEMPTS", env_or_default("MAX_ATTEMPTS", "5"))?;
        let backoff_base_secs =
            parse_u64("BACKOFF_BASE_SECS", env_or_default("BACKOFF_BASE_SECS", "2"))?;
        let backoff_cap_secs =
            parse_u64("BACKOFF_CAP_SECS", env_or_default("BACKOFF_CAP_SECS", "300"))?;
        // Default lease covers several scoring-call timeouts so a slow AI
        // response is never mistaken for a crashed worker.
        let default_lease = (ai_request_timeout.saturating_mul(3)).to_string();
        let lease_timeout_secs =
            parse_u64("LEASE_TIMEOUT_SECS", env_or_default("LEASE_TIMEOUT_SECS", &default_lease))?;
        let poll_interval_secs =
            parse_u64("POLL_INTERVAL_SECS", env_or_default("POLL_INTERVAL_SECS", "2"))?;
        let sweep_interval_secs =
            parse_u64("SWEEP_INTERVAL_SECS", env_or_default("SWEEP_INTERVAL_SECS", "300"))?;
        let pending_orphan_secs =
            parse_u64("PENDING_ORPHAN_SECS", env_or_default("PENDING_ORPHAN_SECS", "600"))?;

        let log_level = env_or_default("SCRIBA_LOG_LEVEL", "info");
        let json = env_optional("SCRIBA_LOG_JSON").map(|value| parse_bool(&value)).unwrap_or(false);
        let prometheus_enabled =
            env_optional("PROMETHEUS_ENABLED").map(|value| parse_bool(&value)).unwrap_or(false);

        let settings = Self {
            runtime: RuntimeSettings { environment, strict_config },
            database: DatabaseSettings {
                postgres_server,
                postgres_port,
                postgres_user,
                postgres_password,
                postgres_db,
                database_url,
            },
            redis: RedisSettings {
                host: redis_host,
                port: redis_port,
                db: redis_db,
                password: redis_password,
                url: redis_url,
            },
            ai: AiSettings {
                openai_api_key,
                openai_base_url,
                ai_model,
                ai_max_tokens,
                ai_request_timeout,
                ai_max_score,
            },
            worker: WorkerSettings {
                concurrency,
                max_attempts,
                backoff_base_secs,
                backoff_cap_secs,
                lease_timeout_secs,
                poll_interval_secs,
                sweep_interval_secs,
                pending_orphan_secs,
            },
            telemetry: TelemetrySettings { log_level, json, prometheus_enabled },
        };

        settings.validate()?;
        Ok(settings)
    }

    pub(crate) fn database(&self) -> &DatabaseSettings {
        &self.database
    }

    pub(crate) fn redis(&self) -> &RedisSettings {
        &self.redis
    }

    pub(crate) fn ai(&self) -> &AiSettings {
        &self.ai
    }

    pub(crate) fn worker(&self) -> &WorkerSettings {
        &self.worker
    }

    pub(crate) fn telemetry(&self) -> &TelemetrySettings {
        &self.telemetry
    }

    pub(crate) fn runtime(&self) -> &RuntimeSettings {
        &self.runtime
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                field: "WORKER_CONCURRENCY",
                value: "0".to_string(),
            });
        }

        if self.worker.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "MAX_ATTEMPTS",
                value: "0".to_string(),
            });
        }

        if self.worker.lease_timeout_secs < self.ai.ai_request_timeout {
            return Err(ConfigError::InvalidValue {
                field: "LEASE_TIMEOUT_SECS",
                value: self.worker.lease_timeout_secs.to_string(),
            });
        }

        if self.worker.backoff_cap_secs < self.worker.backoff_base_secs {
            return Err(ConfigError::InvalidValue {
                field: "BACKOFF_CAP_SECS",
                value: self.worker.backoff_cap_secs.to_string(),
            });
        }

        if !(self.runtime.strict_config || self.runtime.environment.is_production()) {
            return Ok(());
        }

        if self.database.database_url.is_none() && self.database.postgres_password.is_empty() {
            return Err(ConfigError::MissingSecret("POSTGRES_PASSWORD"));
        }
        if self.ai.openai_api_key.is_empty() {
            return Err(ConfigError::MissingSecret("OPENAI_API_KEY"));
        }
        if self.ai.openai_base_url.is_empty() {
            return Err(ConfigError::MissingSecret("OPENAI_BASE_URL"));
        }

        Ok(())
    }
}

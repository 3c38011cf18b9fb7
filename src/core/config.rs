mod parsing;
mod settings;
mod types;

pub(crate) use types::{
    AiSettings, ConfigError, DatabaseSettings, Environment, RedisSettings, RuntimeSettings,
    Settings, TelemetrySettings, WorkerSettings,
};

//! Bridge configuration loaded from environment variables.
//!
//! Every knob has a default; only values that are present but malformed
//! are errors. Positional CLI arguments are applied on top by the caller.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use nwnbridge_domain::{DomainError, SqlIdentifier};

use crate::infrastructure::backend_supervisor::{BackendConfig, SupervisorError};
use crate::infrastructure::backoff::Backoff;
use crate::infrastructure::ollama::DEFAULT_OLLAMA_BASE_URL;
use crate::infrastructure::sqlite_state::{BusyRetry, StoreSchema};
use crate::use_cases::dispatch::DispatchConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("{var} is not a valid SQL identifier: {source}")]
    Identifier {
        var: &'static str,
        #[source]
        source: DomainError,
    },

    #[error("BRIDGE_BACKEND_COMMAND: {0}")]
    BackendCommand(#[from] SupervisorError),
}

/// Everything the bridge needs besides the positional arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    pub dispatch: DispatchConfig,
    pub schema: StoreSchema,
    pub busy: BusyRetry,
    pub backend: BackendConfig,
    /// Address of the supervised backend
    pub backend_address: String,
    /// Triggers file poll interval; `None` disables reloading
    pub catalog_reload: Option<Duration>,
}

impl BridgeConfig {
    /// Load configuration from the process environment.
    pub fn from_env(default_model: &str) -> Result<Self, ConfigError> {
        Self::from_lookup(default_model, |key| env::var(key).ok())
    }

    /// Load configuration through `lookup` (variable name -> value).
    pub fn from_lookup(
        default_model: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let vars = Vars(&lookup);

        let dispatch = DispatchConfig {
            poll_interval: Duration::from_millis(vars.positive("BRIDGE_POLL_INTERVAL_MS", 500)?),
            scan_batch_size: vars.positive("BRIDGE_SCAN_BATCH_SIZE", 256)?,
            max_pending: vars.positive("BRIDGE_MAX_PENDING", 1024)?,
            max_in_flight: vars.positive("BRIDGE_MAX_IN_FLIGHT", 2)?,
            max_attempts: vars.positive("BRIDGE_MAX_ATTEMPTS", 3)?,
            retry_backoff: vars.backoff(
                "BRIDGE_RETRY_BASE_DELAY_MS",
                "BRIDGE_RETRY_MAX_DELAY_MS",
                Backoff::default(),
            )?,
            inference_timeout: Duration::from_secs(
                vars.positive("BRIDGE_INFERENCE_TIMEOUT_SECS", 120)?,
            ),
            commit_timeout: Duration::from_secs(vars.positive("BRIDGE_COMMIT_TIMEOUT_SECS", 10)?),
            shutdown_grace: Duration::from_secs(vars.parse("BRIDGE_SHUTDOWN_GRACE_SECS", 10)?),
            max_scan_failures: vars.positive("BRIDGE_MAX_SCAN_FAILURES", 3)?,
            ..DispatchConfig::new(default_model)
        };

        let schema = StoreSchema {
            events_table: vars.identifier("BRIDGE_EVENTS_TABLE", "bridge_events")?,
            marker_column: vars.identifier("BRIDGE_MARKER_COLUMN", "id")?,
            tag_column: vars.identifier("BRIDGE_TAG_COLUMN", "tag")?,
            table_column: vars.identifier("BRIDGE_TABLE_COLUMN", "source_table")?,
            payload_column: vars.identifier("BRIDGE_PAYLOAD_COLUMN", "payload")?,
            target_tag_column: vars.identifier("BRIDGE_TARGET_TAG_COLUMN", "tag")?,
            consumed_column: vars.optional_identifier("BRIDGE_CONSUMED_COLUMN")?,
            resume_table: vars.identifier("BRIDGE_RESUME_TABLE", "bridge_resume")?,
        };

        let busy_delay = vars.positive("BRIDGE_STORE_BUSY_DELAY_MS", 50)?;
        let busy = BusyRetry {
            retries: vars.parse("BRIDGE_STORE_BUSY_RETRIES", 5)?,
            backoff: Backoff::new(busy_delay, busy_delay.saturating_mul(20)),
        };

        let backend = BackendConfig {
            max_restarts: vars.parse("BRIDGE_BACKEND_MAX_RESTARTS", 5)?,
            ready_timeout: Duration::from_secs(
                vars.positive("BRIDGE_BACKEND_READY_TIMEOUT_SECS", 30)?,
            ),
            ..match lookup("BRIDGE_BACKEND_COMMAND") {
                Some(command) => BackendConfig::from_command_line(&command)?,
                None => BackendConfig::default(),
            }
        };

        let reload_secs: u64 = vars.parse("BRIDGE_CATALOG_RELOAD_SECS", 5)?;

        Ok(Self {
            dispatch,
            schema,
            busy,
            backend,
            backend_address: lookup("BRIDGE_BACKEND_ADDRESS")
                .filter(|a| !a.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_OLLAMA_BASE_URL.to_string()),
            catalog_reload: (reload_secs > 0).then(|| Duration::from_secs(reload_secs)),
        })
    }
}

struct Vars<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Vars<'_, F> {
    fn get(&self, var: &str) -> Option<String> {
        (self.0)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(value) = self.get(var) else {
            return Ok(default);
        };
        match value.parse::<T>() {
            Ok(parsed) => Ok(parsed),
            Err(e) => Err(ConfigError::Invalid {
                var,
                reason: e.to_string(),
                value,
            }),
        }
    }

    /// Like `parse`, rejecting zero.
    fn positive<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr + PartialEq + Default,
        T::Err: std::fmt::Display,
    {
        let value = self.parse(var, default)?;
        if value == T::default() {
            return Err(ConfigError::Invalid {
                var,
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(value)
    }

    fn backoff(
        &self,
        base_var: &'static str,
        max_var: &'static str,
        default: Backoff,
    ) -> Result<Backoff, ConfigError> {
        let base = self.positive(base_var, default.base_delay_ms)?;
        let max = self.positive(max_var, default.max_delay_ms)?;
        if max < base {
            return Err(ConfigError::Invalid {
                var: max_var,
                value: max.to_string(),
                reason: format!("must not be below {base_var} ({base})"),
            });
        }
        Ok(Backoff {
            base_delay_ms: base,
            max_delay_ms: max,
            ..default
        })
    }

    fn identifier(&self, var: &'static str, default: &str) -> Result<SqlIdentifier, ConfigError> {
        let name = self.get(var).unwrap_or_else(|| default.to_string());
        SqlIdentifier::new(name).map_err(|source| ConfigError::Identifier { var, source })
    }

    fn optional_identifier(&self, var: &'static str) -> Result<Option<SqlIdentifier>, ConfigError> {
        self.get(var)
            .map(|name| {
                SqlIdentifier::new(name).map_err(|source| ConfigError::Identifier { var, source })
            })
            .transpose()
    }
}

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use jsonschema::{validator_for, Validator};
use once_cell::sync::OnceCell;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct ControllerConfig {
    /// Budget for a single inbound request, paused while the snap waits on its own outbound calls.
    pub max_request_time_ms: u64,
    /// A running snap with no traffic for this long is stopped.
    pub max_idle_time_ms: u64,
    pub idle_check_interval_ms: u64,
    pub max_init_time_ms: u64,
    /// Per-origin cap on callers waiting for a snap to start.
    pub max_queue_size: usize,
    /// Reject anything the registry has not verified.
    pub require_allowlist: bool,
    /// Permission name to the reason it may not be requested.
    pub excluded_permissions: BTreeMap<String, String>,
    /// Optional JSON file the controller document is persisted to.
    pub state_path: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_request_time_ms: 60_000,
            max_idle_time_ms: 30_000,
            idle_check_interval_ms: 5_000,
            max_init_time_ms: 60_000,
            max_queue_size: 5,
            require_allowlist: false,
            excluded_permissions: BTreeMap::new(),
            state_path: None,
        }
    }
}

impl ControllerConfig {
    pub fn max_request_time(&self) -> Duration {
        Duration::from_millis(self.max_request_time_ms)
    }

    pub fn max_idle_time(&self) -> Duration {
        Duration::from_millis(self.max_idle_time_ms)
    }

    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_millis(self.idle_check_interval_ms.max(1))
    }

    pub fn max_init_time(&self) -> Duration {
        Duration::from_millis(self.max_init_time_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct ExecutionConfig {
    pub init_timeout_ms: u64,
    pub ping_timeout_ms: u64,
    /// Grace window for a `terminate` acknowledgement before forced teardown.
    pub termination_timeout_ms: u64,
    pub destroy_timeout_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            init_timeout_ms: 60_000,
            ping_timeout_ms: 2_000,
            termination_timeout_ms: 1_000,
            destroy_timeout_ms: 5_000,
        }
    }
}

impl ExecutionConfig {
    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn termination_timeout(&self) -> Duration {
        Duration::from_millis(self.termination_timeout_ms)
    }

    pub fn destroy_timeout(&self) -> Duration {
        Duration::from_millis(self.destroy_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
}

impl Config {
    /// Apply `SNAPS_*` environment overrides on top of file or default values.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse::<u64>("SNAPS_MAX_REQUEST_TIME_MS") {
            self.controller.max_request_time_ms = v;
        }
        if let Some(v) = env_parse::<u64>("SNAPS_MAX_IDLE_TIME_MS") {
            self.controller.max_idle_time_ms = v;
        }
        if let Some(v) = env_parse::<u64>("SNAPS_IDLE_CHECK_INTERVAL_MS") {
            self.controller.idle_check_interval_ms = v;
        }
        if let Some(v) = env_parse::<usize>("SNAPS_MAX_QUEUE_SIZE") {
            self.controller.max_queue_size = v;
        }
        if let Some(v) = env_parse::<u64>("SNAPS_TERMINATION_TIMEOUT_MS") {
            self.execution.termination_timeout_ms = v;
        }
    }

    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_env_overrides();
        cfg
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

static CONFIG_SCHEMA: OnceCell<Validator> = OnceCell::new();

fn config_validator() -> Result<&'static Validator> {
    CONFIG_SCHEMA.get_or_try_init(|| {
        let schema_value = config_schema_json()?;
        validator_for(&schema_value).map_err(|err| anyhow::anyhow!("invalid config schema: {err}"))
    })
}

/// Returns the JSON schema describing the configuration structure.
pub fn config_schema_json() -> Result<serde_json::Value> {
    let schema = schemars::schema_for!(Config);
    Ok(serde_json::to_value(&schema)?)
}

pub fn write_schema_file(path: &str) -> Result<()> {
    let schema_json = config_schema_json()?;
    std::fs::write(path, serde_json::to_string_pretty(&schema_json)?)?;
    Ok(())
}

/// Load a TOML config file, validate it against the generated schema, then apply env overrides.
pub fn load_config(path: &str) -> Result<Config> {
    let content = std::fs::read_to_string(path)?;
    let raw: toml::Value = toml::from_str(&content)?;
    let json_value = serde_json::to_value(&raw)?;
    let validation_errors: Vec<_> = config_validator()?
        .iter_errors(&json_value)
        .map(|e| e.to_string())
        .collect();
    if !validation_errors.is_empty() {
        return Err(anyhow::anyhow!(validation_errors.join(", ")));
    }
    let mut cfg: Config = toml::from_str(&content)?;
    cfg.apply_env_overrides();
    tracing::debug!(target: "snaps::config", path, "loaded config");
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ConfigEnv;
    use std::io::Write;

    fn write_toml(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("tempfile");
        file.write_all(body.as_bytes()).expect("write");
        file
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.controller.max_request_time(), Duration::from_secs(60));
        assert_eq!(cfg.controller.max_idle_time(), Duration::from_secs(30));
        assert_eq!(cfg.controller.max_queue_size, 5);
        assert_eq!(cfg.execution.ping_timeout(), Duration::from_secs(2));
        assert_eq!(cfg.execution.termination_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn loads_partial_file_with_defaults() {
        let _env = ConfigEnv::clean();
        let file = write_toml(
            r#"
[controller]
max_queue_size = 2
require_allowlist = true

[controller.excluded_permissions]
eth_accounts = "use the ethereum provider instead"

[execution]
ping_timeout_ms = 500
"#,
        );
        let cfg = load_config(file.path().to_str().expect("utf8 path")).expect("config");
        assert_eq!(cfg.controller.max_queue_size, 2);
        assert!(cfg.controller.require_allowlist);
        assert_eq!(cfg.controller.max_idle_time_ms, 30_000);
        assert_eq!(
            cfg.controller.excluded_permissions.get("eth_accounts").map(String::as_str),
            Some("use the ethereum provider instead")
        );
        assert_eq!(cfg.execution.ping_timeout_ms, 500);
        assert_eq!(cfg.execution.init_timeout_ms, 60_000);
    }

    #[test]
    fn schema_rejects_wrong_types() {
        let _env = ConfigEnv::clean();
        let file = write_toml("[controller]\nmax_queue_size = \"lots\"\n");
        let err = load_config(file.path().to_str().expect("utf8 path")).expect_err("invalid");
        assert!(err.to_string().contains("lots"), "{err}");
    }

    #[test]
    fn env_overrides_win_over_file() {
        let mut env = ConfigEnv::clean();
        env.set("SNAPS_MAX_QUEUE_SIZE", "9")
            .set("SNAPS_TERMINATION_TIMEOUT_MS", "250")
            .set("SNAPS_MAX_IDLE_TIME_MS", "not-a-number");
        let file = write_toml("[controller]\nmax_queue_size = 2\n");
        let cfg = load_config(file.path().to_str().expect("utf8 path")).expect("config");
        assert_eq!(cfg.controller.max_queue_size, 9);
        assert_eq!(cfg.execution.termination_timeout_ms, 250);
        assert_eq!(cfg.controller.max_idle_time_ms, 30_000);
    }

    #[test]
    fn schema_file_is_written() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("schema.json");
        write_schema_file(path.to_str().expect("utf8 path")).expect("write schema");
        let text = std::fs::read_to_string(&path).expect("read");
        assert!(text.contains("max_request_time_ms"));
    }
}

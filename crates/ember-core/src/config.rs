//! ember.toml configuration parser.
//!
//! Every section is optional; missing keys fall back to the defaults
//! documented on each field. Durations use the short form `"500ms"`,
//! `"5s"`, `"2m"` or a bare number of seconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ModelInfo;

/// Errors raised while loading `ember.toml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmberConfig {
    pub executor: ExecutorConfig,
    pub lifecycle: LifecycleConfig,
    pub aws: AwsConfig,
    pub catalog: CatalogConfig,
}

/// Where the inference engine listens and how to talk to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// `host:port` of the executor's HTTP endpoint.
    pub address: String,
    /// Timeout for non-streaming calls and for establishing streams.
    #[serde(with = "duration_str")]
    pub request_timeout: Duration,
    /// Timeout for a single liveness probe.
    #[serde(with = "duration_str")]
    pub probe_timeout: Duration,
    /// Longest gap allowed between two frames of a streaming response.
    #[serde(with = "duration_str")]
    pub stream_idle_timeout: Duration,
    /// Capacity of the per-stream chunk channel.
    pub stream_buffer: usize,
    pub paths: BackendPaths,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:11434".to_string(),
            request_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(2),
            stream_idle_timeout: Duration::from_secs(300),
            stream_buffer: 32,
            paths: BackendPaths::default(),
        }
    }
}

/// HTTP paths of the executor's operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendPaths {
    pub generate: String,
    pub pull: String,
    pub list: String,
    pub health: String,
    pub delete: String,
}

impl Default for BackendPaths {
    fn default() -> Self {
        Self {
            generate: "/generate".to_string(),
            pull: "/pull".to_string(),
            list: "/list".to_string(),
            health: "/health".to_string(),
            delete: "/delete".to_string(),
        }
    }
}

/// Step bounds and retry policy for the lifecycle state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Executor count requested when starting (0/1 today).
    pub desired_capacity: u32,
    /// Bound on one attempt to scale the compute group and see it in service.
    #[serde(with = "duration_str")]
    pub capacity_timeout: Duration,
    /// Bound on one attempt to attach or detach the download route.
    #[serde(with = "duration_str")]
    pub route_timeout: Duration,
    /// Bound on one attempt to change the running task count.
    #[serde(with = "duration_str")]
    pub service_timeout: Duration,
    /// How long the executor gets to pass its health probe. Not retried.
    #[serde(with = "duration_str")]
    pub warmup_timeout: Duration,
    /// Interval between health probes while warming up.
    #[serde(with = "duration_str")]
    pub probe_interval: Duration,
    /// Interval between confirmation reads after a mutating call.
    #[serde(with = "duration_str")]
    pub confirm_interval: Duration,
    /// Attempts per step before the cluster is marked failed.
    pub max_attempts: u32,
    /// First retry delay; doubles on each further retry.
    #[serde(with = "duration_str")]
    pub backoff_base: Duration,
    /// Ceiling for the retry delay.
    #[serde(with = "duration_str")]
    pub backoff_max: Duration,
    /// Typical start-to-ready time, reported as `estimated_ready_by`.
    #[serde(with = "duration_str")]
    pub ready_estimate: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            desired_capacity: 1,
            capacity_timeout: Duration::from_secs(300),
            route_timeout: Duration::from_secs(120),
            service_timeout: Duration::from_secs(300),
            warmup_timeout: Duration::from_secs(600),
            probe_interval: Duration::from_secs(3),
            confirm_interval: Duration::from_secs(5),
            max_attempts: 3,
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(60),
            ready_estimate: Duration::from_secs(360),
        }
    }
}

/// Names of the cloud resources the AWS adapters operate on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsConfig {
    pub region: Option<String>,
    pub autoscaling_group: String,
    pub cluster: String,
    pub service: String,
    pub route_table_id: String,
    /// NAT gateway the default route points at while attached.
    pub nat_gateway_id: String,
    /// Gateway the default route is restored to on detach.
    pub restore_gateway_id: Option<String>,
    /// Path to the `aws` binary.
    pub cli: String,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            region: None,
            autoscaling_group: String::new(),
            cluster: String::new(),
            service: String::new(),
            route_table_id: String::new(),
            nat_gateway_id: String::new(),
            restore_gateway_id: None,
            cli: "aws".to_string(),
        }
    }
}

impl AwsConfig {
    /// Check that every resource name needed by the adapters is present.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let missing: Vec<&str> = [
            ("autoscaling_group", &self.autoscaling_group),
            ("cluster", &self.cluster),
            ("service", &self.service),
            ("route_table_id", &self.route_table_id),
            ("nat_gateway_id", &self.nat_gateway_id),
        ]
        .into_iter()
        .filter(|(_, v)| v.trim().is_empty())
        .map(|(k, _)| k)
        .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(format!(
                "[aws] missing {}",
                missing.join(", ")
            )))
        }
    }
}

/// Hosted models that are always listed, whether or not an executor runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub models: Vec<ModelInfo>,
}

impl EmberConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: EmberConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.lifecycle.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "lifecycle.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.executor.stream_buffer == 0 {
            return Err(ConfigError::Invalid(
                "executor.stream_buffer must be at least 1".to_string(),
            ));
        }
        if self.executor.address.trim().is_empty() {
            return Err(ConfigError::Invalid("executor.address is empty".to_string()));
        }
        Ok(())
    }
}

/// Parse a duration string like "5s", "500ms", "2m" or "10" (seconds).
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim()
            .parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms % 60_000 == 0 && ms > 0 {
        format!("{}m", ms / 60_000)
    } else if ms % 1000 == 0 {
        format!("{}s", ms / 1000)
    } else {
        format!("{ms}ms")
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_duration(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid duration '{raw}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = EmberConfig::from_toml_str("").unwrap();
        assert_eq!(config, EmberConfig::default());
        assert_eq!(config.lifecycle.max_attempts, 3);
        assert_eq!(config.executor.paths.health, "/health");
        assert_eq!(config.aws.cli, "aws");
    }

    #[test]
    fn parses_full_config() {
        let toml = r#"
[executor]
address = "10.0.3.17:11434"
stream_buffer = 8
request_timeout = "45s"

[executor.paths]
generate = "/api/generate"
pull = "/api/pull"
list = "/api/tags"
health = "/"

[lifecycle]
capacity_timeout = "3m"
probe_interval = "500ms"
max_attempts = 5

[aws]
region = "us-east-1"
autoscaling_group = "gpu-asg"
cluster = "llm"
service = "ollama"
route_table_id = "rtb-123"
nat_gateway_id = "nat-456"
restore_gateway_id = "igw-789"

[[catalog.models]]
name = "bedrock/claude-3-haiku"
"#;
        let config = EmberConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.executor.address, "10.0.3.17:11434");
        assert_eq!(config.executor.stream_buffer, 8);
        assert_eq!(config.executor.request_timeout, Duration::from_secs(45));
        assert_eq!(config.executor.paths.list, "/api/tags");
        // Unspecified path keeps its default.
        assert_eq!(config.executor.paths.delete, "/delete");
        assert_eq!(config.lifecycle.capacity_timeout, Duration::from_secs(180));
        assert_eq!(config.lifecycle.probe_interval, Duration::from_millis(500));
        assert_eq!(config.lifecycle.max_attempts, 5);
        assert_eq!(config.lifecycle.warmup_timeout, Duration::from_secs(600));
        assert!(config.aws.validate().is_ok());
        assert_eq!(config.catalog.models.len(), 1);
        assert_eq!(config.catalog.models[0].size, 0);
    }

    #[test]
    fn rejects_bad_duration() {
        let err = EmberConfig::from_toml_str("[lifecycle]\nwarmup_timeout = \"soon\"\n");
        assert!(matches!(err, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn rejects_overflowing_minutes() {
        let toml = format!("[lifecycle]\nroute_timeout = \"{}m\"\n", u64::MAX / 2);
        let err = EmberConfig::from_toml_str(&toml);
        assert!(matches!(err, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn rejects_zero_attempts() {
        let err = EmberConfig::from_toml_str("[lifecycle]\nmax_attempts = 0\n");
        assert!(matches!(err, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn aws_validate_lists_missing_keys() {
        let aws = AwsConfig {
            autoscaling_group: "asg".to_string(),
            ..Default::default()
        };
        let err = aws.validate().unwrap_err().to_string();
        assert!(err.contains("cluster"));
        assert!(err.contains("nat_gateway_id"));
        assert!(!err.contains("autoscaling_group"));
    }

    #[test]
    fn toml_round_trip_keeps_durations() {
        let config = EmberConfig::default();
        let text = config.to_toml_string().unwrap();
        assert!(text.contains("warmup_timeout = \"10m\""));
        let back = EmberConfig::from_toml_str(&text).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn parse_duration_forms() {
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("10"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("later"), None);
        assert_eq!(parse_duration(&format!("{}m", u64::MAX)), None);
    }

    #[test]
    fn read_missing_file_reports_path() {
        let err = EmberConfig::from_file(Path::new("/nonexistent/ember.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/ember.toml"));
    }
}

//! Application configuration.
//!
//! Aggregates multiplexer and Kafka settings into a single Config struct
//! that can be loaded from YAML files or environment variables.

use std::time::Duration;

use serde::Deserialize;

use crate::client::KafkaConfig;
use crate::mux::{MuxOptions, DEFAULT_DELIVERY_TIMEOUT, DEFAULT_SUBSCRIBER_CAPACITY};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "KAFKA_MUX_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "KAFKA_MUX";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "KAFKA_MUX_LOG";
/// Comma separated broker list, overriding `kafka.brokers`.
pub const PEERS_ENV_VAR: &str = "KAFKA_PEERS";

/// Default multiplexer name (consumer-group identity).
pub const DEFAULT_NAME: &str = "kafka-mux";

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Multiplexer name, used as the consumer group id.
    pub name: String,
    /// Bound on delivering one message to one subscriber, in milliseconds.
    pub delivery_timeout_ms: u64,
    /// Capacity of each subscriber's delivery channel.
    pub subscriber_capacity: usize,
    /// Kafka connection settings.
    pub kafka: KafkaConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            delivery_timeout_ms: DEFAULT_DELIVERY_TIMEOUT.as_millis() as u64,
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            kafka: KafkaConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    /// 5. `PEERS_ENV_VAR` for the broker list
    pub fn load(path: Option<&str>) -> Result<Self, Box<dyn std::error::Error>> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("kafka.brokers")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: Config = config.try_deserialize()?;

        if let Ok(peers) = std::env::var(PEERS_ENV_VAR) {
            let from_peers = KafkaConfig::from_peer_list(&peers);
            if !from_peers.brokers.is_empty() {
                config.kafka.brokers = from_peers.brokers;
            }
        }

        Ok(config)
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    /// Multiplexer options described by this configuration.
    pub fn mux_options(&self) -> MuxOptions {
        MuxOptions::default()
            .with_delivery_timeout(self.delivery_timeout())
            .with_subscriber_capacity(self.subscriber_capacity)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use serial_test::serial;

    use super::*;
    use crate::client::Partitioner;

    fn clear_env() {
        std::env::remove_var(CONFIG_ENV_VAR);
        std::env::remove_var(PEERS_ENV_VAR);
        std::env::remove_var("KAFKA_MUX__NAME");
        std::env::remove_var("KAFKA_MUX__KAFKA__BROKERS");
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.name, "kafka-mux");
        assert_eq!(config.delivery_timeout(), Duration::from_secs(1));
        assert_eq!(config.subscriber_capacity, 32);
        assert_eq!(config.kafka.brokers, vec!["localhost:9092".to_string()]);
    }

    #[test]
    fn test_mux_options() {
        let mut config = Config::for_test();
        config.delivery_timeout_ms = 250;
        config.subscriber_capacity = 0;

        let options = config.mux_options();
        assert_eq!(options.delivery_timeout, Duration::from_millis(250));
        assert_eq!(options.subscriber_capacity, 1);
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        clear_env();
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "name: phonebook\ndelivery_timeout_ms: 500\nkafka:\n  brokers: [\"kafka-0:9092\"]\n  partitioner: manual\n  partition: 2\n"
        )
        .unwrap();

        let config = Config::load(file.path().to_str()).unwrap();

        assert_eq!(config.name, "phonebook");
        assert_eq!(config.delivery_timeout_ms, 500);
        assert_eq!(config.kafka.brokers, vec!["kafka-0:9092".to_string()]);
        assert_eq!(config.kafka.partitioner, Partitioner::Manual);
        assert_eq!(config.kafka.fixed_partition(), Some(2));
    }

    #[test]
    #[serial]
    fn test_load_env_overrides() {
        clear_env();
        std::env::set_var("KAFKA_MUX__NAME", "orders-mux");
        std::env::set_var(PEERS_ENV_VAR, "kafka-0:9092,kafka-1:9092");

        let config = Config::load(None).unwrap();
        clear_env();

        assert_eq!(config.name, "orders-mux");
        assert_eq!(
            config.kafka.brokers,
            vec!["kafka-0:9092".to_string(), "kafka-1:9092".to_string()]
        );
    }

    #[test]
    #[serial]
    fn test_load_missing_explicit_file() {
        clear_env();
        let result = Config::load(Some("/nonexistent/kafka-mux.yaml"));
        assert!(result.is_err());
    }
}

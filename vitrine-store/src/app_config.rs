use serde::Deserialize;
use std::env;
use std::time::Duration;
use vitrine_core::ReservationPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub redis: RedisConfig,
    pub database: DatabaseConfig,
    pub kafka: KafkaConfig,
    pub auth: AuthConfig,
    pub reservations: ReservationRules,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReservationRules {
    pub ttl_seconds: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
    #[serde(default)]
    pub clock_skew_grace_seconds: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_sweep_interval() -> u64 { 300 }

fn default_channel_capacity() -> usize { 64 }

fn seconds(key: &str, value: u64) -> Result<chrono::Duration, config::ConfigError> {
    i64::try_from(value)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .ok_or_else(|| config::ConfigError::Message(format!("{} = {} is out of range", key, value)))
}

impl ReservationRules {
    pub fn policy(&self) -> Result<ReservationPolicy, config::ConfigError> {
        let ttl = seconds("reservations.ttl_seconds", self.ttl_seconds)?;
        let grace = seconds(
            "reservations.clock_skew_grace_seconds",
            self.clock_skew_grace_seconds,
        )?;
        ReservationPolicy::new(ttl, grace).map_err(|e| config::ConfigError::Message(e.to_string()))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds.max(1))
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Redis,
    Postgres,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    pub backend: StoreBackend,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct KafkaConfig {
    #[serde(default)]
    pub enabled: bool,
    pub brokers: String,
    pub topic: String,
    pub group_id: String,
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            // Per-environment overrides, optional
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Local overrides, not checked in
            .add_source(config::File::with_name("config/local").required(false))
            // Eg.. `VITRINE__STORE__BACKEND=redis`
            .add_source(config::Environment::with_prefix("VITRINE").separator("__"))
            .build()?;

        Self::validated(s)
    }

    /// Deserializes and rejects reservation rules the engine cannot honour.
    pub fn validated(settings: config::Config) -> Result<Self, config::ConfigError> {
        let config: Self = settings.try_deserialize()?;
        config.reservations.policy()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::{File, FileFormat};

    const SAMPLE: &str = r#"
        [server]
        port = 8080

        [store]
        backend = "redis"

        [redis]
        url = "redis://cache:6379"

        [database]
        url = "postgres://db/vitrine"

        [kafka]
        brokers = "kafka:9092"
        topic = "reservations.changed"
        group_id = "vitrine-relay"

        [auth]
        jwt_secret = "secret"

        [reservations]
        ttl_seconds = 900
        clock_skew_grace_seconds = 2
    "#;

    fn parse(toml: &str) -> Result<Config, config::ConfigError> {
        Config::validated(
            config::Config::builder()
                .add_source(File::from_str(toml, FileFormat::Toml))
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_parse_sample_config() {
        let config = parse(SAMPLE).unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert!(!config.kafka.enabled);
        assert_eq!(config.reservations.sweep_interval(), Duration::from_secs(300));
        assert_eq!(config.reservations.channel_capacity, 64);

        let policy = config.reservations.policy().unwrap();
        assert_eq!(policy.ttl, chrono::Duration::minutes(15));
        assert_eq!(policy.clock_skew_grace, chrono::Duration::seconds(2));
    }

    #[test]
    fn test_zero_ttl_is_rejected() {
        let sample = SAMPLE.replace("ttl_seconds = 900", "ttl_seconds = 0");
        let err = parse(&sample).unwrap_err();
        assert!(err.to_string().contains("TTL must be positive"));
    }

    #[test]
    fn test_out_of_range_ttl_is_rejected() {
        let huge = format!("ttl_seconds = {}", u64::MAX / 2);
        let sample = SAMPLE.replace("ttl_seconds = 900", &huge);
        let err = parse(&sample).unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }
}

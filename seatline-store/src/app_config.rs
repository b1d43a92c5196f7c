use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub kafka: KafkaConfig,
    pub vnpay: VnPaySettings,
    pub business_rules: BusinessRules,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    /// Trip-side database used by the inventory worker. Falls back to `url`.
    #[serde(default)]
    pub trip_url: Option<String>,
}

impl DatabaseConfig {
    pub fn trip_url(&self) -> &str {
        self.trip_url.as_deref().unwrap_or(&self.url)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    pub url: String,
    /// Logical database; selects the `__keyevent@{db}__:expired` channel.
    #[serde(default)]
    pub db: i64,
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,
}

impl RedisConfig {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

fn default_op_timeout_ms() -> u64 { 500 }

#[derive(Debug, Deserialize, Clone)]
pub struct KafkaConfig {
    pub brokers: String,
    #[serde(default = "default_group_id")]
    pub group_id: String,
}

fn default_group_id() -> String { "trip-inventory".to_string() }

#[derive(Debug, Deserialize, Clone)]
pub struct VnPaySettings {
    pub tmn_code: String,
    pub hash_secret: String,
    pub pay_url: String,
    pub return_url: String,
    #[serde(default = "default_vnpay_version")]
    pub version: String,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_order_type")]
    pub order_type: String,
}

fn default_vnpay_version() -> String { "2.1.0".to_string() }
fn default_currency() -> String { "VND".to_string() }
fn default_order_type() -> String { "other".to_string() }

#[derive(Debug, Deserialize, Clone)]
pub struct BusinessRules {
    pub seat_hold_seconds: u64,
    #[serde(default = "default_consumer_max_attempts")]
    pub consumer_max_attempts: u32,
    #[serde(default = "default_outbox_poll_interval_ms")]
    pub outbox_poll_interval_ms: u64,
    #[serde(default = "default_outbox_batch_size")]
    pub outbox_batch_size: usize,
    #[serde(default = "default_stale_sweep_seconds")]
    pub stale_sweep_seconds: u64,
}

fn default_consumer_max_attempts() -> u32 { 3 }
fn default_outbox_poll_interval_ms() -> u64 { 1000 }
fn default_outbox_batch_size() -> usize { 100 }
fn default_stale_sweep_seconds() -> u64 { 60 }

impl BusinessRules {
    pub fn seat_hold(&self) -> Duration {
        Duration::from_secs(self.seat_hold_seconds)
    }

    pub fn outbox_poll_interval(&self) -> Duration {
        Duration::from_millis(self.outbox_poll_interval_ms)
    }

    pub fn stale_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.stale_sweep_seconds)
    }
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            // Per-environment overrides, optional
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Local developer overrides, not checked in
            .add_source(config::File::with_name("config/local").required(false))
            // e.g. `SEATLINE__REDIS__URL=redis://cache:6379`
            .add_source(config::Environment::with_prefix("SEATLINE").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::{File, FileFormat};

    const MINIMAL: &str = r#"
        [server]
        port = 9503

        [database]
        url = "postgres://localhost/booking"

        [redis]
        url = "redis://localhost:6379"

        [kafka]
        brokers = "localhost:9092"

        [vnpay]
        tmn_code = "TMN"
        hash_secret = "secret"
        pay_url = "https://sandbox.vnpayment.vn/paymentv2/vpcpay.html"
        return_url = "http://localhost:9503/api/payment/return"

        [business_rules]
        seat_hold_seconds = 900
    "#;

    #[test]
    fn test_defaults_fill_optional_settings() {
        let config: Config = config::Config::builder()
            .add_source(File::from_str(MINIMAL, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.business_rules.seat_hold(), Duration::from_secs(900));
        assert_eq!(config.business_rules.consumer_max_attempts, 3);
        assert_eq!(config.business_rules.stale_sweep_interval(), Duration::from_secs(60));
        assert_eq!(config.redis.db, 0);
        assert_eq!(config.database.trip_url(), "postgres://localhost/booking");
        assert_eq!(config.kafka.group_id, "trip-inventory");
        assert_eq!(config.vnpay.version, "2.1.0");
    }
}

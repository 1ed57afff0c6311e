//! 桥接配置加载。
//!
//! 读取 YAML 配置文件，再用 `BRIDGE_*` 环境变量覆盖连接参数，最后校验。

use domain::{ExchangeKind, RouteRule};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::path::Path;

/// 配置加载错误。
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {reason}")]
    Io { path: String, reason: String },
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("missing required setting: {0}")]
    Missing(String),
    #[error("invalid value for {0}: {1}")]
    Invalid(String, String),
}

/// 桥接运行配置。
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub logging: LoggingConfig,
    pub rabbitmq: RabbitMqConfig,
    pub influxdb: InfluxDbConfig,
    pub shutdown: ShutdownConfig,
    pub topics: Vec<TopicConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// RabbitMQ 连接配置。
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RabbitMqConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub virtual_host: String,
    /// 心跳间隔（秒）
    pub heartbeat: u16,
    /// 单次代理操作的超时（秒）
    pub blocked_connection_timeout: u64,
    pub prefetch_count: u16,
    pub reconnect: ReconnectConfig,
}

impl Default for RabbitMqConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
            virtual_host: "/".to_string(),
            heartbeat: 600,
            blocked_connection_timeout: 300,
            prefetch_count: 10,
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// InfluxDB 连接配置。
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InfluxDbConfig {
    pub url: String,
    pub token: String,
    pub org: String,
    /// 默认 bucket
    pub bucket: String,
    /// 请求超时（毫秒）
    pub timeout: u64,
    pub batch_size: usize,
    pub linger_ms: u64,
    pub reconnect: ReconnectConfig,
}

impl Default for InfluxDbConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8086".to_string(),
            token: String::new(),
            org: String::new(),
            bucket: String::new(),
            timeout: 10_000,
            batch_size: 1,
            linger_ms: 0,
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// 重连退避配置；`max_retries: null` 表示不限次数。
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter_percent: u8,
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter_percent: 20,
            max_retries: Some(10),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub grace_period_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 5_000,
        }
    }
}

/// 单个订阅主题。
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    pub exchange: String,
    pub exchange_type: String,
    pub routing_key: String,
    pub queue_name: Option<String>,
    pub durable: bool,
    pub measurement: Option<String>,
    pub influx_bucket: Option<String>,
    pub timestamp_field: String,
    pub raw_fallback: bool,
    pub tags: BTreeMap<String, TagValue>,
    pub field_mapping: BTreeMap<String, String>,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            exchange: String::new(),
            exchange_type: "topic".to_string(),
            routing_key: "#".to_string(),
            queue_name: None,
            durable: true,
            measurement: None,
            influx_bucket: None,
            timestamp_field: "timestamp".to_string(),
            raw_fallback: true,
            tags: BTreeMap::new(),
            field_mapping: BTreeMap::new(),
        }
    }
}

/// 静态 tag 值（YAML 中可以写成字符串、数字或布尔）。
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagValue::Text(value) => f.write_str(value),
            TagValue::Integer(value) => write!(f, "{}", value),
            TagValue::Float(value) => write!(f, "{}", value),
            TagValue::Bool(value) => write!(f, "{}", value),
        }
    }
}

impl BridgeConfig {
    /// 读取配置文件，应用环境变量覆盖并校验。
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|err| ConfigError::Io {
            path: path.display().to_string(),
            reason: err.to_string(),
        })?;
        let mut config = Self::from_yaml_str(&text)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// 只解析，不做覆盖与校验。
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(text).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// `BRIDGE_*` 环境变量覆盖连接参数。
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(host) = read_optional("BRIDGE_RABBITMQ_HOST") {
            self.rabbitmq.host = host;
        }
        self.rabbitmq.port = read_u16_with_default("BRIDGE_RABBITMQ_PORT", self.rabbitmq.port)?;
        if let Some(username) = read_optional("BRIDGE_RABBITMQ_USERNAME") {
            self.rabbitmq.username = username;
        }
        if let Some(password) = read_optional("BRIDGE_RABBITMQ_PASSWORD") {
            self.rabbitmq.password = password;
        }
        if let Some(url) = read_optional("BRIDGE_INFLUXDB_URL") {
            self.influxdb.url = url;
        }
        if let Some(token) = read_optional("BRIDGE_INFLUXDB_TOKEN") {
            self.influxdb.token = token;
        }
        if let Some(org) = read_optional("BRIDGE_INFLUXDB_ORG") {
            self.influxdb.org = org;
        }
        if let Some(bucket) = read_optional("BRIDGE_INFLUXDB_BUCKET") {
            self.influxdb.bucket = bucket;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("influxdb.url", &self.influxdb.url),
            ("influxdb.token", &self.influxdb.token),
            ("influxdb.org", &self.influxdb.org),
            ("influxdb.bucket", &self.influxdb.bucket),
        ];
        for (key, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::Missing(key.to_string()));
            }
        }
        if self.topics.is_empty() {
            return Err(ConfigError::Missing("topics".to_string()));
        }
        if self.influxdb.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "influxdb.batch_size".to_string(),
                "0".to_string(),
            ));
        }
        validate_reconnect("rabbitmq.reconnect", &self.rabbitmq.reconnect)?;
        validate_reconnect("influxdb.reconnect", &self.influxdb.reconnect)?;
        self.routes().map(|_| ())
    }

    /// 按声明顺序把 topics 转换为路由规则。
    pub fn routes(&self) -> Result<Vec<RouteRule>, ConfigError> {
        self.topics
            .iter()
            .enumerate()
            .map(|(index, topic)| topic.to_route(index))
            .collect()
    }
}

impl TopicConfig {
    fn to_route(&self, index: usize) -> Result<RouteRule, ConfigError> {
        let kind = ExchangeKind::from_name(&self.exchange_type).ok_or_else(|| {
            ConfigError::Invalid(
                format!("topics[{}].exchange_type", index),
                self.exchange_type.clone(),
            )
        })?;
        let mut rule = RouteRule::new(self.exchange.clone(), kind, self.routing_key.clone());
        rule.queue_name = non_empty(&self.queue_name);
        rule.durable = self.durable;
        rule.measurement = non_empty(&self.measurement);
        rule.bucket = non_empty(&self.influx_bucket);
        rule.tags = self
            .tags
            .iter()
            .map(|(key, value)| (key.clone(), value.to_string()))
            .collect();
        rule.field_mapping = self.field_mapping.clone();
        rule.timestamp_field = self.timestamp_field.clone();
        rule.raw_fallback = self.raw_fallback;
        Ok(rule)
    }
}

fn validate_reconnect(key: &str, reconnect: &ReconnectConfig) -> Result<(), ConfigError> {
    if reconnect.jitter_percent > 100 {
        return Err(ConfigError::Invalid(
            format!("{}.jitter_percent", key),
            reconnect.jitter_percent.to_string(),
        ));
    }
    if reconnect.multiplier.is_nan() || reconnect.multiplier < 1.0 {
        return Err(ConfigError::Invalid(
            format!("{}.multiplier", key),
            reconnect.multiplier.to_string(),
        ));
    }
    if reconnect.max_delay_ms < reconnect.initial_delay_ms {
        return Err(ConfigError::Invalid(
            format!("{}.max_delay_ms", key),
            reconnect.max_delay_ms.to_string(),
        ));
    }
    Ok(())
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn read_u16_with_default(key: &str, default: u16) -> Result<u16, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u16>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_optional(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}

use anyhow::{Context, Result, bail};
use courier_common::SessionLimits;
use courier_transport::{DEFAULT_READ_BUFFER_SIZE, TlsAcceptor, TransportConfig};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

// Daemon configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    // Consumer protocol listener.
    pub tcp_bind: SocketAddr,
    // Metrics HTTP listener.
    pub metrics_bind: SocketAddr,
    // PEM files; TLS is offered to clients only when both are set.
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub max_heartbeat_interval_ms: u64,
    pub max_output_buffer_size: usize,
    pub max_output_buffer_timeout_ms: u64,
    pub max_msg_timeout_ms: u64,
    pub client_timeout_ms: u64,
    pub msg_timeout_ms: u64,
    pub max_rdy_count: i64,
    pub max_deflate_level: u32,
    // Largest IDENTIFY body accepted.
    pub max_body_bytes: usize,
    pub read_buffer_size: usize,
    pub snappy_verify_checksum: bool,
    // Log every readiness check.
    pub verbose: bool,
}

const DEFAULT_MAX_BODY_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct BrokerConfigOverride {
    tcp_bind: Option<String>,
    metrics_bind: Option<String>,
    tls_cert: Option<PathBuf>,
    tls_key: Option<PathBuf>,
    max_heartbeat_interval_ms: Option<u64>,
    max_output_buffer_size: Option<usize>,
    max_output_buffer_timeout_ms: Option<u64>,
    max_msg_timeout_ms: Option<u64>,
    client_timeout_ms: Option<u64>,
    msg_timeout_ms: Option<u64>,
    max_rdy_count: Option<i64>,
    max_deflate_level: Option<u32>,
    max_body_bytes: Option<usize>,
    read_buffer_size: Option<usize>,
    snappy_verify_checksum: Option<bool>,
    verbose: Option<bool>,
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|value| matches!(value.as_str(), "1" | "true" | "yes"))
}

fn positive<T: PartialOrd + Default>(value: T) -> Option<T> {
    (value > T::default()).then_some(value)
}

impl BrokerConfig {
    pub fn from_env() -> Result<Self> {
        let limits = SessionLimits::default();
        let tcp_bind = std::env::var("COURIER_TCP_BIND")
            .unwrap_or_else(|_| "0.0.0.0:4150".to_string())
            .parse()
            .with_context(|| "parse COURIER_TCP_BIND")?;
        let metrics_bind = std::env::var("COURIER_METRICS_BIND")
            .unwrap_or_else(|_| "0.0.0.0:4151".to_string())
            .parse()
            .with_context(|| "parse COURIER_METRICS_BIND")?;
        Ok(Self {
            tcp_bind,
            metrics_bind,
            tls_cert: std::env::var("COURIER_TLS_CERT").ok().map(PathBuf::from),
            tls_key: std::env::var("COURIER_TLS_KEY").ok().map(PathBuf::from),
            max_heartbeat_interval_ms: env_parse("COURIER_MAX_HEARTBEAT_INTERVAL_MS")
                .and_then(positive)
                .unwrap_or(limits.max_heartbeat_interval.as_millis() as u64),
            max_output_buffer_size: env_parse("COURIER_MAX_OUTPUT_BUFFER_SIZE")
                .and_then(positive)
                .unwrap_or(limits.max_output_buffer_size),
            max_output_buffer_timeout_ms: env_parse("COURIER_MAX_OUTPUT_BUFFER_TIMEOUT_MS")
                .and_then(positive)
                .unwrap_or(limits.max_output_buffer_timeout.as_millis() as u64),
            max_msg_timeout_ms: env_parse("COURIER_MAX_MSG_TIMEOUT_MS")
                .and_then(positive)
                .unwrap_or(limits.max_msg_timeout.as_millis() as u64),
            client_timeout_ms: env_parse("COURIER_CLIENT_TIMEOUT_MS")
                .and_then(positive)
                .unwrap_or(limits.client_timeout.as_millis() as u64),
            msg_timeout_ms: env_parse("COURIER_MSG_TIMEOUT_MS")
                .and_then(positive)
                .unwrap_or(limits.msg_timeout.as_millis() as u64),
            max_rdy_count: env_parse("COURIER_MAX_RDY_COUNT")
                .and_then(positive)
                .unwrap_or(limits.max_rdy_count),
            max_deflate_level: env_parse("COURIER_MAX_DEFLATE_LEVEL")
                .and_then(positive)
                .unwrap_or(limits.max_deflate_level),
            max_body_bytes: env_parse("COURIER_MAX_BODY_BYTES")
                .and_then(positive)
                .unwrap_or(DEFAULT_MAX_BODY_BYTES),
            read_buffer_size: env_parse("COURIER_READ_BUFFER_SIZE")
                .and_then(positive)
                .unwrap_or(DEFAULT_READ_BUFFER_SIZE),
            snappy_verify_checksum: env_flag("COURIER_SNAPPY_VERIFY_CHECKSUM").unwrap_or(false),
            verbose: env_flag("COURIER_VERBOSE").unwrap_or(false),
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("COURIER_CONFIG") {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read COURIER_CONFIG: {path}"))?;
            let override_cfg: BrokerConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse courierd config yaml")?;
            config.apply(override_cfg)?;
        }
        Ok(config)
    }

    fn apply(&mut self, override_cfg: BrokerConfigOverride) -> Result<()> {
        if let Some(value) = override_cfg.tcp_bind {
            self.tcp_bind = value.parse().with_context(|| "parse tcp_bind")?;
        }
        if let Some(value) = override_cfg.metrics_bind {
            self.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
        }
        if let Some(value) = override_cfg.tls_cert {
            self.tls_cert = Some(value);
        }
        if let Some(value) = override_cfg.tls_key {
            self.tls_key = Some(value);
        }
        if let Some(value) = override_cfg.max_heartbeat_interval_ms.and_then(positive) {
            self.max_heartbeat_interval_ms = value;
        }
        if let Some(value) = override_cfg.max_output_buffer_size.and_then(positive) {
            self.max_output_buffer_size = value;
        }
        if let Some(value) = override_cfg.max_output_buffer_timeout_ms.and_then(positive) {
            self.max_output_buffer_timeout_ms = value;
        }
        if let Some(value) = override_cfg.max_msg_timeout_ms.and_then(positive) {
            self.max_msg_timeout_ms = value;
        }
        if let Some(value) = override_cfg.client_timeout_ms.and_then(positive) {
            self.client_timeout_ms = value;
        }
        if let Some(value) = override_cfg.msg_timeout_ms.and_then(positive) {
            self.msg_timeout_ms = value;
        }
        if let Some(value) = override_cfg.max_rdy_count.and_then(positive) {
            self.max_rdy_count = value;
        }
        if let Some(value) = override_cfg.max_deflate_level.and_then(positive) {
            self.max_deflate_level = value;
        }
        if let Some(value) = override_cfg.max_body_bytes.and_then(positive) {
            self.max_body_bytes = value;
        }
        if let Some(value) = override_cfg.read_buffer_size.and_then(positive) {
            self.read_buffer_size = value;
        }
        if let Some(value) = override_cfg.snappy_verify_checksum {
            self.snappy_verify_checksum = value;
        }
        if let Some(value) = override_cfg.verbose {
            self.verbose = value;
        }
        Ok(())
    }

    pub fn session_limits(&self) -> Result<SessionLimits> {
        let limits = SessionLimits {
            max_heartbeat_interval: Duration::from_millis(self.max_heartbeat_interval_ms),
            max_output_buffer_size: self.max_output_buffer_size,
            max_output_buffer_timeout: Duration::from_millis(self.max_output_buffer_timeout_ms),
            max_msg_timeout: Duration::from_millis(self.max_msg_timeout_ms),
            client_timeout: Duration::from_millis(self.client_timeout_ms),
            msg_timeout: Duration::from_millis(self.msg_timeout_ms),
            max_rdy_count: self.max_rdy_count,
            max_deflate_level: self.max_deflate_level,
            ..SessionLimits::default()
        };
        limits.validate().context("validate session limits")?;
        Ok(limits)
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            read_buffer_size: self.read_buffer_size,
            snappy_verify_checksum: self.snappy_verify_checksum,
        }
    }

    /// Load the TLS acceptor if certificate material is configured.
    pub fn tls_acceptor(&self) -> Result<Option<TlsAcceptor>> {
        match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) => {
                let acceptor = courier_transport::acceptor_from_files(cert, key)
                    .context("load tls certificate")?;
                Ok(Some(acceptor))
            }
            (None, None) => Ok(None),
            _ => bail!("COURIER_TLS_CERT and COURIER_TLS_KEY must be set together"),
        }
    }
}

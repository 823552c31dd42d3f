//! Configuration surface (spec.md §3, §6, expanded in SPEC_FULL.md §10).
//!
//! Grounded on the teacher's `Environment`/`Environment::from_env` enum
//! (`lib.rs`) and its `env::var(...).expect(...)`-for-required-in-production
//! idiom (`handler/mod.rs::HandlerConfig::new`). The TOML file + `garde`
//! validation layer is learned from `empath-server/src/lib.rs::Server::from_config`,
//! since the teacher itself only reads individual env vars and this spec's
//! richer config surface needs a structured file.

use std::{env, fs, net::SocketAddr, path::PathBuf, time::Duration};

use garde::Validate;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Production,
    #[default]
    Development,
    Test,
}

impl Environment {
    pub fn from_env() -> Self {
        match env::var("NODE_ENV") {
            Ok(value) => match value.to_ascii_lowercase().as_str() {
                "production" => Environment::Production,
                "test" => Environment::Test,
                _ => Environment::Development,
            },
            Err(_) => Environment::Development,
        }
    }

    /// Whether outbound TLS should skip certificate verification. Gated on an
    /// explicit environment value (spec.md §9 REDESIGN FLAG), never on an
    /// env-string match scattered through the delivery code path.
    pub fn allows_insecure_tls(self) -> bool {
        matches!(self, Environment::Test | Environment::Development)
    }

    pub fn requires_production_material(self) -> bool {
        matches!(self, Environment::Production)
    }
}

#[derive(Debug, Validate, Deserialize)]
pub struct RateLimitConfig {
    #[garde(range(min = 1))]
    #[serde(default = "default_rate_limit_max")]
    pub max: u32,
    #[garde(range(min = 1_000))]
    #[serde(default = "default_rate_limit_window_ms")]
    pub window_ms: u64,
}

fn default_rate_limit_max() -> u32 {
    100
}

fn default_rate_limit_window_ms() -> u64 {
    3_600_000
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max: default_rate_limit_max(),
            window_ms: default_rate_limit_window_ms(),
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

#[derive(Debug, Validate, Deserialize, Default)]
pub struct TlsConfig {
    #[garde(skip)]
    pub cert_file: Option<PathBuf>,
    #[garde(skip)]
    pub key_file: Option<PathBuf>,
    #[garde(skip)]
    pub ca_file: Option<PathBuf>,
}

#[derive(Debug, Validate, Deserialize, Default)]
pub struct DkimConfig {
    #[garde(custom(validate_dkim_domain))]
    pub domain_name: Option<String>,
    #[garde(custom(validate_dkim_selector))]
    pub selector: Option<String>,
    #[garde(skip)]
    pub private_key_file: Option<PathBuf>,
}

fn validate_dkim_domain(value: &Option<String>, _ctx: &()) -> garde::Result {
    match value {
        Some(domain) if !crate::address::is_fqdn(domain) => Err(garde::Error::new(format!(
            "{domain} is not a fully qualified domain name"
        ))),
        _ => Ok(()),
    }
}

/// RFC 6376 selectors are a single domain label: letters, digits, hyphens
/// and dots, non-empty.
fn validate_dkim_selector(value: &Option<String>, _ctx: &()) -> garde::Result {
    match value {
        Some(selector) if selector.is_empty() => {
            Err(garde::Error::new("dkim selector must not be empty"))
        }
        Some(selector)
            if !selector
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.') =>
        {
            Err(garde::Error::new(format!(
                "{selector} is not a syntactically valid DKIM selector"
            )))
        }
        _ => Ok(()),
    }
}

fn default_max_message_size() -> u64 {
    25 * 1024 * 1024
}

fn default_exchanges() -> Vec<String> {
    vec![
        "mx1.forwardemail.net".to_string(),
        "mx2.forwardemail.net".to_string(),
    ]
}

fn default_listen_addr() -> String {
    "0.0.0.0:25".to_string()
}

#[derive(Debug, Validate, Deserialize)]
pub struct RelayConfig {
    #[garde(skip)]
    #[serde(default = "default_max_message_size")]
    pub max_message_size_bytes: u64,

    #[garde(dive)]
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[garde(length(min = 1))]
    #[serde(default = "default_exchanges")]
    pub exchanges: Vec<String>,

    #[garde(skip)]
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[garde(length(min = 1))]
    pub server_name: String,

    #[garde(skip)]
    #[serde(default)]
    pub environment: Environment,

    #[garde(dive)]
    #[serde(default)]
    pub tls: TlsConfig,

    #[garde(dive)]
    #[serde(default)]
    pub dkim: DkimConfig,

    #[garde(skip)]
    pub disposable_domains_file: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("failed to parse config file {0}: {1}")]
    Parse(PathBuf, toml::de::Error),
    #[error("config validation failed: {0}")]
    Validation(#[from] garde::Report),
    #[error("environment is production but required field is missing: {0}")]
    MissingInProduction(&'static str),
    #[error("invalid listen address {0}: {1}")]
    InvalidListenAddr(String, std::net::AddrParseError),
}

impl RelayConfig {
    pub fn load(path: &PathBuf) -> Result<Self, ConfigError> {
        let raw =
            fs::read_to_string(path).map_err(|e| ConfigError::Read(path.clone(), e))?;
        let mut config: RelayConfig =
            toml::from_str(&raw).map_err(|e| ConfigError::Parse(path.clone(), e))?;

        if matches!(env::var("NODE_ENV"), Ok(_)) {
            config.environment = Environment::from_env();
        }
        if let Ok(port) = env::var("PORT") {
            config.listen_addr = override_port(&config.listen_addr, &port);
        }

        config.validate()?;

        if config.environment.requires_production_material() {
            if config.tls.cert_file.is_none()
                || config.tls.key_file.is_none()
                || config.tls.ca_file.is_none()
            {
                return Err(ConfigError::MissingInProduction(
                    "tls.cert_file/key_file/ca_file",
                ));
            }
            if config.dkim.domain_name.is_none()
                || config.dkim.selector.is_none()
                || config.dkim.private_key_file.is_none()
            {
                return Err(ConfigError::MissingInProduction(
                    "dkim.domain_name/selector/private_key_file",
                ));
            }
        }

        Ok(config)
    }

    pub fn listen_socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen_addr
            .parse()
            .map_err(|e| ConfigError::InvalidListenAddr(self.listen_addr.clone(), e))
    }
}

fn override_port(listen_addr: &str, port: &str) -> String {
    match listen_addr.rsplit_once(':') {
        Some((host, _old_port)) => format!("{host}:{port}"),
        None => format!("{listen_addr}:{port}"),
    }
}

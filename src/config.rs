use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::access::AccessPaths;
use crate::auth::AuthConfig;
use crate::payments::{ChecksumGatewayConfig, HostedCheckoutConfig, Plans};
use crate::utils::{get_env_with_prefix, parse_env_with_prefix};

/// Default bound on a single outbound gateway call.
pub const DEFAULT_GATEWAY_TIMEOUT_SECS: u64 = 15;

const MIN_GATEWAY_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_GATEWAY_TIMEOUT: Duration = Duration::from_secs(60);

/// Gateway timeouts must fall in 1..=60 seconds.
pub fn validate_gateway_timeout(timeout: Duration) -> std::result::Result<(), String> {
    if timeout < MIN_GATEWAY_TIMEOUT || timeout > MAX_GATEWAY_TIMEOUT {
        return Err(format!(
            "gateway timeout must be between {}s and {}s, got {:?}",
            MIN_GATEWAY_TIMEOUT.as_secs(),
            MAX_GATEWAY_TIMEOUT.as_secs(),
            timeout
        ));
    }
    Ok(())
}

/// Main configuration for a carepay server
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Holds secrets, so it is never serialized.
    #[serde(skip)]
    pub gateways: GatewaysConfig,
    #[serde(default)]
    pub access: AccessPaths,
    /// Purchasable plans and their prices.
    #[serde(default)]
    pub plans: Plans,
    /// Token verification for the `/api/me` routes. Holds a secret.
    #[serde(skip)]
    pub auth: Option<AuthConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum request body size in bytes (default: 1MB)
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
    /// Whole-request timeout in seconds; 0 disables it
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_json")]
    pub json: bool,
}

/// Gateway credentials. A gateway without config is not registered.
#[derive(Debug, Clone, Default)]
pub struct GatewaysConfig {
    pub checksum: Option<ChecksumGatewayConfig>,
    pub hosted: Option<HostedCheckoutConfig>,
}

impl GatewaysConfig {
    pub fn is_empty(&self) -> bool {
        self.checksum.is_none() && self.hosted.is_none()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_body_size: default_max_body_size(),
            request_timeout_seconds: default_request_timeout_seconds(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: default_json(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_json() -> bool {
    false
}

fn default_max_body_size() -> usize {
    1024 * 1024 // gateway callbacks are small
}

fn default_request_timeout_seconds() -> u64 {
    30
}

impl ServerConfig {
    pub fn addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_seconds > 0).then(|| Duration::from_secs(self.request_timeout_seconds))
    }
}

/// Builder for Config with environment variable support
#[must_use = "builder does nothing until you call build()"]
pub struct ConfigBuilder {
    config: Config,
    /// A malformed `CAREPAY_PLANS`, reported by `build()`.
    plans_error: Option<String>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            plans_error: None,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.config.server.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.config.server.port = port;
        self
    }

    /// Set the maximum request body size in bytes
    ///
    /// ```rust
    /// use carepay::ConfigBuilder;
    ///
    /// let config = ConfigBuilder::new()
    ///     .with_max_body_size(256 * 1024)
    ///     .build()
    ///     .unwrap();
    /// assert_eq!(config.server.max_body_size, 256 * 1024);
    /// ```
    pub fn with_max_body_size(mut self, max_body_size: usize) -> Self {
        self.config.server.max_body_size = max_body_size;
        self
    }

    pub fn with_request_timeout_seconds(mut self, seconds: u64) -> Self {
        self.config.server.request_timeout_seconds = seconds;
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn with_json_logging(mut self, enabled: bool) -> Self {
        self.config.logging.json = enabled;
        self
    }

    pub fn with_checksum_gateway(mut self, config: ChecksumGatewayConfig) -> Self {
        self.config.gateways.checksum = Some(config);
        self
    }

    pub fn with_hosted_checkout(mut self, config: HostedCheckoutConfig) -> Self {
        self.config.gateways.hosted = Some(config);
        self
    }

    pub fn with_access_paths(mut self, paths: AccessPaths) -> Self {
        self.config.access = paths;
        self
    }

    pub fn with_plans(mut self, plans: Plans) -> Self {
        self.config.plans = plans;
        self
    }

    pub fn with_auth(mut self, auth: AuthConfig) -> Self {
        self.config.auth = Some(auth);
        self
    }

    /// Load configuration from environment variables with CAREPAY_ prefix
    pub fn from_env(mut self) -> Self {
        if let Some(host) = get_env_with_prefix("HOST") {
            self.config.server.host = host;
        }
        // CAREPAY_PORT first, then PORT for platforms that inject it
        if let Some(port) = parse_env_with_prefix("PORT") {
            self.config.server.port = port;
        }
        if let Some(size) = parse_env_with_prefix("MAX_BODY_SIZE") {
            self.config.server.max_body_size = size;
        }
        if let Some(secs) = parse_env_with_prefix("REQUEST_TIMEOUT_SECONDS") {
            self.config.server.request_timeout_seconds = secs;
        }
        if let Some(level) = get_env_with_prefix("LOG_LEVEL") {
            self.config.logging.level = level;
        }
        if let Some(json) = get_env_with_prefix("LOG_JSON") {
            self.config.logging.json = json.parse().unwrap_or(false);
        }

        if let Some(checksum) = ChecksumGatewayConfig::from_env() {
            self.config.gateways.checksum = Some(checksum);
        }
        if let Some(hosted) = HostedCheckoutConfig::from_env() {
            self.config.gateways.hosted = Some(hosted);
        }

        self.config.access = AccessPaths::from_env();

        match Plans::from_env() {
            Some(Ok(plans)) => self.config.plans = plans,
            Some(Err(e)) => self.plans_error = Some(e),
            None => {}
        }
        if let Some(auth) = AuthConfig::from_env() {
            self.config.auth = Some(auth);
        }

        self
    }

    /// Build the configuration, validating all settings
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration is invalid:
    /// - Invalid server address (host:port)
    /// - Invalid log level
    /// - Invalid gateway settings or timeouts
    /// - Relative access paths
    /// - A malformed plan catalog or a plan without valid prices
    /// - A JWT secret shorter than 32 bytes
    pub fn build(self) -> crate::error::Result<Config> {
        use crate::error::CarepayError;

        if let Some(e) = self.plans_error {
            return Err(CarepayError::bad_request(e));
        }

        self.config.server.addr().map_err(|e| {
            CarepayError::bad_request(format!(
                "Invalid server address {}:{} - {}",
                self.config.server.host, self.config.server.port, e
            ))
        })?;

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.config.logging.level.to_lowercase().as_str()) {
            return Err(CarepayError::bad_request(format!(
                "Invalid log level: {}. Must be one of: {}",
                self.config.logging.level,
                valid_log_levels.join(", ")
            )));
        }

        if self.config.server.port == 0 {
            return Err(CarepayError::bad_request("Server port must be greater than 0"));
        }

        if self.config.server.max_body_size == 0 {
            return Err(CarepayError::bad_request(
                "Maximum body size must be greater than 0",
            ));
        }

        if let Some(checksum) = &self.config.gateways.checksum {
            checksum.validate().map_err(CarepayError::bad_request)?;
        }
        if let Some(hosted) = &self.config.gateways.hosted {
            hosted.validate().map_err(CarepayError::bad_request)?;
        }

        self.config
            .access
            .validate()
            .map_err(CarepayError::bad_request)?;

        self.config
            .plans
            .validate()
            .map_err(CarepayError::bad_request)?;
        if let Some(auth) = &self.config.auth {
            auth.validate().map_err(CarepayError::bad_request)?;
        }

        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

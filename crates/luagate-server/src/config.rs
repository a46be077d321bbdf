//! Server configuration.
//!
//! Every tunable of the gateway lives in [`ServerConfig`], built with
//! `with_*` methods and checked once with [`ServerConfig::validate`] before
//! the server starts.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Lowest bcrypt cost the crypto module will accept.
pub const BCRYPT_MIN_COST: u32 = 4;
/// Highest bcrypt cost the crypto module will accept.
pub const BCRYPT_MAX_COST: u32 = 31;
/// Cost used when a script does not pass one.
pub const BCRYPT_DEFAULT_COST: u32 = 10;

/// Configuration for a gateway node.
///
/// # Example
///
/// ```
/// use luagate_server::ServerConfig;
/// use std::time::Duration;
///
/// let config = ServerConfig::new()
///     .with_com_dir("./com")
///     .with_session_ttl(Duration::from_secs(60));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Address the HTTP listener binds to
    pub bind: SocketAddr,
    /// The single URL path that accepts JSON-RPC posts
    pub route: String,
    /// Root directory of command scripts
    pub com_dir: PathBuf,
    /// Directory storage paths are resolved under
    pub data_dir: PathBuf,
    /// Identity stamped into every response
    pub node_id: String,
    /// Lifetime of an admitted session before the sweeper may evict it
    pub session_ttl: Duration,
    /// How often expired sessions are swept
    pub sweep_interval: Duration,
    /// Time allowed for a client to send request headers
    pub header_read_timeout: Duration,
    /// Timeout applied to outbound HTTP calls made by scripts
    pub http_timeout: Duration,
    /// Largest request body accepted, in bytes
    pub max_body_bytes: usize,
    /// Smallest bcrypt cost scripts may request
    pub bcrypt_min_cost: u32,
    /// Largest bcrypt cost scripts may request
    pub bcrypt_max_cost: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            route: "/api/v1/rpc".to_string(),
            com_dir: PathBuf::from("./com"),
            data_dir: PathBuf::from("./data"),
            node_id: uuid::Uuid::new_v4().to_string(),
            session_ttl: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(5),
            header_read_timeout: Duration::from_secs(10),
            http_timeout: Duration::from_secs(30),
            max_body_bytes: 10 * 1024 * 1024,
            bcrypt_min_cost: BCRYPT_MIN_COST,
            bcrypt_max_cost: BCRYPT_MAX_COST,
        }
    }
}

impl ServerConfig {
    /// Creates a configuration with default values and a fresh node id.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bind(mut self, bind: SocketAddr) -> Self {
        self.bind = bind;
        self
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = route.into();
        self
    }

    pub fn with_com_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.com_dir = dir.into();
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_header_read_timeout(mut self, timeout: Duration) -> Self {
        self.header_read_timeout = timeout;
        self
    }

    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    pub fn with_max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    pub fn with_bcrypt_cost_bounds(mut self, min: u32, max: u32) -> Self {
        self.bcrypt_min_cost = min;
        self.bcrypt_max_cost = max;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The route does not start with `/`
    /// - The node id is empty
    /// - The session TTL, sweep interval or any timeout is zero
    /// - The body limit is zero
    /// - The bcrypt bounds are outside 4..=31 or inverted
    pub fn validate(&self) -> Result<(), String> {
        if !self.route.starts_with('/') {
            return Err(format!("route must start with '/' (got {:?})", self.route));
        }

        if self.node_id.trim().is_empty() {
            return Err("node id must not be empty".to_string());
        }

        if self.session_ttl.is_zero() {
            return Err("session TTL must be greater than zero".to_string());
        }

        if self.sweep_interval.is_zero() {
            return Err("sweep interval must be greater than zero".to_string());
        }

        if self.header_read_timeout.is_zero() || self.http_timeout.is_zero() {
            return Err("timeouts must be greater than zero".to_string());
        }

        if self.max_body_bytes == 0 {
            return Err("max body size must be greater than zero".to_string());
        }

        if self.bcrypt_min_cost < BCRYPT_MIN_COST
            || self.bcrypt_max_cost > BCRYPT_MAX_COST
            || self.bcrypt_min_cost > self.bcrypt_max_cost
        {
            return Err(format!(
                "bcrypt cost bounds must satisfy {} <= min <= max <= {} (got {}..={})",
                BCRYPT_MIN_COST, BCRYPT_MAX_COST, self.bcrypt_min_cost, self.bcrypt_max_cost
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind.port(), 8080);
        assert_eq!(config.route, "/api/v1/rpc");
        assert_eq!(config.session_ttl, Duration::from_secs(1800));
        assert_eq!(config.sweep_interval, Duration::from_secs(5));
        assert_eq!(config.bcrypt_min_cost, 4);
        assert_eq!(config.bcrypt_max_cost, 31);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_node_ids_are_unique() {
        assert_ne!(ServerConfig::new().node_id, ServerConfig::new().node_id);
    }

    #[test]
    fn test_builder_pattern_chaining() {
        let config = ServerConfig::new()
            .with_route("/com")
            .with_com_dir("/srv/com")
            .with_data_dir("/srv/data")
            .with_node_id("node-1")
            .with_session_ttl(Duration::from_secs(10))
            .with_sweep_interval(Duration::from_millis(100))
            .with_bcrypt_cost_bounds(4, 12);

        assert_eq!(config.route, "/com");
        assert_eq!(config.com_dir, PathBuf::from("/srv/com"));
        assert_eq!(config.data_dir, PathBuf::from("/srv/data"));
        assert_eq!(config.node_id, "node-1");
        assert_eq!(config.session_ttl, Duration::from_secs(10));
        assert_eq!(config.bcrypt_max_cost, 12);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_route_without_slash_fails() {
        let config = ServerConfig::new().with_route("rpc");
        assert!(config.validate().unwrap_err().contains("route"));
    }

    #[test]
    fn test_validate_zero_ttl_fails() {
        let config = ServerConfig::new().with_session_ttl(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_empty_node_id_fails() {
        let config = ServerConfig::new().with_node_id("  ");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_bcrypt_bounds() {
        assert!(ServerConfig::new().with_bcrypt_cost_bounds(3, 10).validate().is_err());
        assert!(ServerConfig::new().with_bcrypt_cost_bounds(4, 32).validate().is_err());
        assert!(ServerConfig::new().with_bcrypt_cost_bounds(12, 10).validate().is_err());
        assert!(ServerConfig::new().with_bcrypt_cost_bounds(10, 10).validate().is_ok());
    }
}

use clap::Parser;
use std::net::SocketAddr;

/// Default hCaptcha verification endpoint.
pub const DEFAULT_CAPTCHA_URL: &str = "https://api.hcaptcha.com/siteverify";

/// CLI arguments for the relay server.
#[derive(Parser, Debug, Clone)]
#[command(name = "duet")]
#[command(about = "Anonymous two-party chat relay server")]
#[command(version)]
pub struct Args {
    /// Socket address to listen on.
    #[arg(long, default_value = "0.0.0.0:3000", env = "DUET_LISTEN")]
    pub listen: SocketAddr,
    /// Socket address for the metrics endpoint.
    #[arg(long, default_value = "127.0.0.1:9090", env = "DUET_METRICS")]
    pub metrics_addr: SocketAddr,
    /// Maximum total concurrent connections.
    #[arg(long, default_value = "10000", env = "DUET_MAX_CONNS")]
    pub max_conns: usize,
    /// Maximum concurrent connections per IP address.
    #[arg(long, default_value = "10", env = "DUET_MAX_CONNS_IP")]
    pub max_conns_ip: usize,
    /// Maximum messages per rate window per connection.
    #[arg(long, default_value = "5", env = "DUET_MSG_RATE")]
    pub msg_rate: u32,
    /// Rate window width in milliseconds.
    #[arg(long, default_value = "1000", env = "DUET_RATE_WINDOW_MS")]
    pub rate_window_ms: u64,
    /// Maximum WebSocket message size in bytes (bounds photo payloads).
    #[arg(long, default_value = "2097152", env = "DUET_MAX_PAYLOAD")]
    pub max_payload: usize,
    /// Verification phase timeout in seconds.
    #[arg(long, default_value = "60", env = "DUET_VERIFY_TIMEOUT")]
    pub verify_timeout: u64,
    /// Interval between liveness pings in seconds.
    #[arg(long, default_value = "30", env = "DUET_PING_INTERVAL")]
    pub ping_interval: u64,
    /// Captcha verification endpoint.
    #[arg(long, default_value = DEFAULT_CAPTCHA_URL, env = "DUET_CAPTCHA_URL")]
    pub captcha_url: String,
    /// Captcha secret. When unset, verification accepts any token.
    #[arg(long, env = "DUET_CAPTCHA_SECRET")]
    pub captcha_secret: Option<String>,
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address to listen on.
    pub listen: SocketAddr,
    /// Socket address for the metrics endpoint.
    pub metrics_addr: SocketAddr,
    /// Maximum total concurrent connections.
    pub max_conns: usize,
    /// Maximum concurrent connections per IP address.
    pub max_conns_ip: usize,
    /// Maximum messages per rate window per connection.
    pub msg_rate: u32,
    /// Rate window width in milliseconds.
    pub rate_window_ms: u64,
    /// Maximum WebSocket message size in bytes.
    pub max_payload: usize,
    /// Verification phase timeout in seconds.
    pub verify_timeout: u64,
    /// Interval between liveness pings in seconds.
    pub ping_interval: u64,
}

impl ServerConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_conns == 0 {
            return Err("max_conns must be greater than 0".to_string());
        }
        if self.max_conns > 1_000_000 {
            return Err("max_conns exceeds reasonable limit (1,000,000)".to_string());
        }

        if self.max_conns_ip == 0 {
            return Err("max_conns_ip must be greater than 0".to_string());
        }
        if self.max_conns_ip > self.max_conns {
            return Err("max_conns_ip cannot exceed max_conns".to_string());
        }

        if self.msg_rate == 0 {
            return Err("msg_rate must be greater than 0".to_string());
        }
        if self.msg_rate > 10_000 {
            return Err("msg_rate exceeds reasonable limit (10,000 per window)".to_string());
        }

        if self.rate_window_ms == 0 {
            return Err("rate_window_ms must be greater than 0".to_string());
        }
        if self.rate_window_ms > 600_000 {
            return Err("rate_window_ms exceeds reasonable limit (10 minutes)".to_string());
        }

        // 16 MiB comfortably covers client-resized photos as base64
        const MAX_ALLOWED_PAYLOAD: usize = 16 * 1024 * 1024;
        if self.max_payload == 0 {
            return Err("max_payload must be greater than 0".to_string());
        }
        if self.max_payload > MAX_ALLOWED_PAYLOAD {
            return Err(format!(
                "max_payload exceeds maximum allowed ({MAX_ALLOWED_PAYLOAD} bytes)"
            ));
        }

        if self.verify_timeout == 0 {
            return Err("verify_timeout must be greater than 0".to_string());
        }
        if self.verify_timeout > 600 {
            return Err("verify_timeout exceeds reasonable limit (600 seconds)".to_string());
        }

        if self.ping_interval == 0 {
            return Err("ping_interval must be greater than 0".to_string());
        }
        if self.ping_interval > 3600 {
            return Err("ping_interval exceeds reasonable limit (3600 seconds)".to_string());
        }

        Ok(())
    }
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            listen: args.listen,
            metrics_addr: args.metrics_addr,
            max_conns: args.max_conns,
            max_conns_ip: args.max_conns_ip,
            msg_rate: args.msg_rate,
            rate_window_ms: args.rate_window_ms,
            max_payload: args.max_payload,
            verify_timeout: args.verify_timeout,
            ping_interval: args.ping_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> ServerConfig {
        ServerConfig {
            listen: "127.0.0.1:3000".parse().unwrap(),
            metrics_addr: "127.0.0.1:9090".parse().unwrap(),
            max_conns: 1000,
            max_conns_ip: 10,
            msg_rate: 5,
            rate_window_ms: 1000,
            max_payload: 2_097_152,
            verify_timeout: 60,
            ping_interval: 30,
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn max_conns_zero() {
        let mut c = valid_config();
        c.max_conns = 0;
        assert!(c.validate().unwrap_err().contains("max_conns"));
    }

    #[test]
    fn max_conns_ip_exceeds_max_conns() {
        let mut c = valid_config();
        c.max_conns_ip = c.max_conns + 1;
        assert!(c.validate().unwrap_err().contains("max_conns_ip"));
    }

    #[test]
    fn msg_rate_zero() {
        let mut c = valid_config();
        c.msg_rate = 0;
        assert!(c.validate().unwrap_err().contains("msg_rate"));
    }

    #[test]
    fn rate_window_zero() {
        let mut c = valid_config();
        c.rate_window_ms = 0;
        assert!(c.validate().unwrap_err().contains("rate_window_ms"));
    }

    #[test]
    fn rate_window_too_large() {
        let mut c = valid_config();
        c.rate_window_ms = 600_001;
        assert!(c.validate().unwrap_err().contains("rate_window_ms"));
    }

    #[test]
    fn max_payload_too_large() {
        let mut c = valid_config();
        c.max_payload = 16 * 1024 * 1024 + 1;
        assert!(c.validate().unwrap_err().contains("max_payload"));
    }

    #[test]
    fn verify_timeout_zero() {
        let mut c = valid_config();
        c.verify_timeout = 0;
        assert!(c.validate().unwrap_err().contains("verify_timeout"));
    }

    #[test]
    fn ping_interval_too_large() {
        let mut c = valid_config();
        c.ping_interval = 3601;
        assert!(c.validate().unwrap_err().contains("ping_interval"));
    }

    #[test]
    fn boundary_values_valid() {
        let mut c = valid_config();
        c.max_conns = 1;
        c.max_conns_ip = 1;
        c.msg_rate = 1;
        c.rate_window_ms = 1;
        c.max_payload = 1;
        c.verify_timeout = 1;
        c.ping_interval = 1;
        assert!(c.validate().is_ok());
    }

    #[test]
    fn upper_boundary_values_valid() {
        let mut c = valid_config();
        c.max_conns = 1_000_000;
        c.max_conns_ip = 1_000_000;
        c.msg_rate = 10_000;
        c.rate_window_ms = 600_000;
        c.max_payload = 16 * 1024 * 1024;
        c.verify_timeout = 600;
        c.ping_interval = 3600;
        assert!(c.validate().is_ok());
    }
}

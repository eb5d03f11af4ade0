//! Command-line and environment configuration for the gateway binary.

use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use tgw_pool::RegistryConfig;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    /// Single-line human readable output.
    #[default]
    Compact,
    /// One JSON object per event.
    Json,
}

/// Gateway server configuration.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "tgw-server",
    version,
    about = "Bridge JSON-lines requests to pooled raw TCP exchanges"
)]
pub struct ServerConfig {
    /// Address the gateway listens on.
    #[arg(long, env = "TGW_LISTEN", default_value = "127.0.0.1:3000")]
    pub listen: SocketAddr,

    /// Upper bound for one upstream TCP connect, in milliseconds.
    #[arg(
        long,
        env = "TGW_CONNECT_TIMEOUT_MS",
        default_value_t = 5_000,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub connect_timeout_ms: u64,

    /// `tracing` filter directive, e.g. `info` or `tgw_pool=debug`.
    #[arg(long, env = "TGW_LOG", default_value = "info")]
    pub log_filter: String,

    /// Log output format.
    #[arg(long, env = "TGW_LOG_FORMAT", value_enum, default_value_t = LogFormat::Compact)]
    pub log_format: LogFormat,
}

impl ServerConfig {
    /// Registry settings derived from this configuration.
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ServerConfig::try_parse_from(["tgw-server"]).unwrap();
        assert_eq!(config.listen, "127.0.0.1:3000".parse().unwrap());
        assert_eq!(config.connect_timeout_ms, 5_000);
        assert_eq!(config.log_filter, "info");
        assert_eq!(config.log_format, LogFormat::Compact);
        assert_eq!(
            config.registry_config().connect_timeout,
            Duration::from_secs(5)
        );
    }

    #[test]
    fn flags_override_defaults() {
        let config = ServerConfig::try_parse_from([
            "tgw-server",
            "--listen",
            "0.0.0.0:4100",
            "--connect-timeout-ms",
            "750",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(config.listen.port(), 4100);
        assert_eq!(config.connect_timeout_ms, 750);
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn rejects_zero_connect_timeout() {
        let result =
            ServerConfig::try_parse_from(["tgw-server", "--connect-timeout-ms", "0"]);
        assert!(result.is_err());
    }
}

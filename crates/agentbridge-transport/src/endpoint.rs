use std::fmt;
use std::str::FromStr;

use crate::error::TransportError;

/// Host used when none is configured.
pub const DEFAULT_HOST: &str = "localhost";

/// Port the environment publishes telemetry on.
pub const DEFAULT_TELEMETRY_PORT: u16 = 10001;

/// Port the environment listens for action requests on.
pub const DEFAULT_COMMAND_PORT: u16 = 10002;

/// A `host:port` pair naming one side of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Endpoint on the default host.
    pub fn localhost(port: u16) -> Self {
        Self::new(DEFAULT_HOST, port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let input = input.trim();
        let input = input.strip_prefix("tcp://").unwrap_or(input);
        let (host, port) = input
            .rsplit_once(':')
            .ok_or_else(|| TransportError::InvalidEndpoint(input.to_string()))?;

        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(TransportError::InvalidEndpoint(input.to_string()));
        }

        let port = port
            .parse::<u16>()
            .map_err(|_| TransportError::InvalidEndpoint(input.to_string()))?;

        Ok(Self::new(host, port))
    }
}

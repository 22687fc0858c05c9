use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Identity of a logical service: interface + group + version
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceKey {
    interface_name: String,
    group: String,
    version: String,
}

impl ServiceKey {
    #[must_use]
    pub fn new(
        interface_name: impl Into<String>,
        group: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            interface_name: interface_name.into(),
            group: group.into(),
            version: version.into(),
        }
    }

    /// Key with empty group and version
    #[must_use]
    pub fn interface(interface_name: impl Into<String>) -> Self {
        Self::new(interface_name, String::new(), String::new())
    }

    #[must_use]
    pub fn interface_name(&self) -> &str {
        &self.interface_name
    }

    #[must_use]
    pub fn group(&self) -> &str {
        &self.group
    }

    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }
}

/// Concatenation used as the coordination path segment,
/// e.g. `demo.Greeter` + `` + `v1` => `demo.Greeterv1`.
impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.interface_name, self.group, self.version)
    }
}

/// One reachable process instance of a service
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    /// Parses `host:port`, splitting at the last `:` so bare IPv6 hosts work.
    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::Configuration(format!("Endpoint '{s}' is not host:port")))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(Error::Configuration(format!("Endpoint '{s}' has an empty host")));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| Error::Configuration(format!("Endpoint '{s}' has an invalid port: {e}")))?;
        Ok(Self::new(host, port))
    }
}

impl From<std::net::SocketAddr> for Endpoint {
    fn from(addr: std::net::SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

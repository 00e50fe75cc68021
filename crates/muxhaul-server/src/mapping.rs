//! Port mapping parsing
//!
//! A mapping is either `"<local>=<remote>"` or a bare port. A bare numeric
//! local side means "all interfaces", written `":<port>"`.

use crate::error::ConfigError;
use std::fmt;
use std::str::FromStr;

/// Local bind address paired with the remote target announced to the agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub local_addr: String,
    pub remote_addr: String,
}

impl PortMapping {
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(ConfigError::InvalidPortMapping(
                "empty port mapping".to_string(),
            ));
        }

        let parts: Vec<&str> = input.split('=').collect();
        match parts.as_slice() {
            [port] => {
                let port: u16 = port.trim().parse().map_err(|_| {
                    ConfigError::InvalidPortMapping(format!("invalid port in '{}'", input))
                })?;
                Ok(Self {
                    local_addr: format!(":{}", port),
                    remote_addr: port.to_string(),
                })
            }
            [local, remote] => {
                let local = local.trim();
                let remote = remote.trim();
                if local.is_empty() || remote.is_empty() {
                    return Err(ConfigError::InvalidPortMapping(format!(
                        "both sides of '{}' must be set",
                        input
                    )));
                }
                let local_addr = if local.parse::<u16>().is_ok() {
                    format!(":{}", local)
                } else {
                    local.to_string()
                };
                Ok(Self {
                    local_addr,
                    remote_addr: remote.to_string(),
                })
            }
            _ => Err(ConfigError::InvalidPortMapping(format!(
                "'{}' contains more than one '='",
                input
            ))),
        }
    }

    /// Address handed to the socket layer
    pub fn bind_addr(&self) -> String {
        normalize_bind_addr(&self.local_addr)
    }
}

impl FromStr for PortMapping {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.local_addr, self.remote_addr)
    }
}

/// Expand the host-less `":port"` form to all IPv4 interfaces.
pub fn normalize_bind_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_local_and_remote() {
        let mapping = PortMapping::parse("8080=127.0.0.1:9090").unwrap();
        assert_eq!(mapping.local_addr, ":8080");
        assert_eq!(mapping.remote_addr, "127.0.0.1:9090");
    }

    #[test]
    fn test_parse_bare_port() {
        let mapping = PortMapping::parse("8080").unwrap();
        assert_eq!(mapping.local_addr, ":8080");
        assert_eq!(mapping.remote_addr, "8080");
    }

    #[test]
    fn test_parse_trims_whitespace() {
        let mapping = PortMapping::parse("  443 = 10.0.0.5:8443 ").unwrap();
        assert_eq!(mapping.local_addr, ":443");
        assert_eq!(mapping.remote_addr, "10.0.0.5:8443");
    }

    #[test]
    fn test_parse_explicit_local_host_kept() {
        let mapping = PortMapping::parse("127.0.0.1:2222=22").unwrap();
        assert_eq!(mapping.local_addr, "127.0.0.1:2222");
        assert_eq!(mapping.remote_addr, "22");
        assert_eq!(mapping.bind_addr(), "127.0.0.1:2222");
    }

    #[test]
    fn test_parse_rejects_non_numeric_bare_port() {
        assert!(matches!(
            PortMapping::parse("http"),
            Err(ConfigError::InvalidPortMapping(_))
        ));
        assert!(PortMapping::parse("").is_err());
        assert!(PortMapping::parse("70000").is_err());
    }

    #[test]
    fn test_parse_rejects_empty_side_and_extra_separator() {
        assert!(PortMapping::parse("8080=").is_err());
        assert!(PortMapping::parse("=9090").is_err());
        assert!(PortMapping::parse("1=2=3").is_err());
    }

    #[test]
    fn test_bind_addr_expands_all_interfaces() {
        let mapping: PortMapping = "8080".parse().unwrap();
        assert_eq!(mapping.bind_addr(), "0.0.0.0:8080");
        assert_eq!(normalize_bind_addr("[::1]:80"), "[::1]:80");
    }

    #[test]
    fn test_display() {
        let mapping = PortMapping::parse("8080=127.0.0.1:9090").unwrap();
        assert_eq!(mapping.to_string(), ":8080=127.0.0.1:9090");
    }
}

// Composable, protocol-tagged addresses
//
// An address is a sequence of `/<protocol>/<value>` components. Path valued
// protocols (`host`, `unix`) consume the remainder of the string, so a socket
// or mountpoint path can contain slashes without escaping:
//
//   /host/mnt/ipfs
//   /unix/run/hostbind/9p.ipfs.sock
//   /ip4/127.0.0.1/tcp/564

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::fs::path::normalize_path;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("empty address")]
    Empty,

    #[error("address must start with '/': {0}")]
    NotAbsolute(String),

    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),

    #[error("protocol {0} requires a value")]
    MissingValue(Protocol),

    #[error("invalid value for {protocol}: {value}")]
    InvalidValue { protocol: Protocol, value: String },

    #[error("address is not a listener address: {0}")]
    NotListener(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Protocol {
    Host,
    Unix,
    Ip4,
    Ip6,
    Tcp,
}

impl Protocol {
    pub fn name(self) -> &'static str {
        match self {
            Protocol::Host => "host",
            Protocol::Unix => "unix",
            Protocol::Ip4 => "ip4",
            Protocol::Ip6 => "ip6",
            Protocol::Tcp => "tcp",
        }
    }

    /// Path protocols take every remaining segment as their value.
    pub fn is_path(self) -> bool {
        matches!(self, Protocol::Host | Protocol::Unix)
    }

    fn lookup(name: &str) -> Result<Self, AddressError> {
        match name {
            "host" => Ok(Protocol::Host),
            "unix" => Ok(Protocol::Unix),
            "ip4" => Ok(Protocol::Ip4),
            "ip6" => Ok(Protocol::Ip6),
            "tcp" => Ok(Protocol::Tcp),
            other => Err(AddressError::UnknownProtocol(other.to_string())),
        }
    }

    fn canonical_value(self, raw: &str) -> Result<String, AddressError> {
        let invalid = || AddressError::InvalidValue { protocol: self, value: raw.to_string() };
        match self {
            Protocol::Host | Protocol::Unix => normalize_path(raw).map_err(|_| invalid()),
            Protocol::Ip4 => raw.parse::<Ipv4Addr>().map(|a| a.to_string()).map_err(|_| invalid()),
            Protocol::Ip6 => raw.parse::<Ipv6Addr>().map(|a| a.to_string()).map_err(|_| invalid()),
            Protocol::Tcp => raw.parse::<u16>().map(|p| p.to_string()).map_err(|_| invalid()),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Component {
    protocol: Protocol,
    value: String,
}

impl Component {
    pub fn new(protocol: Protocol, value: &str) -> Result<Self, AddressError> {
        Ok(Self { protocol, value: protocol.canonical_value(value)? })
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.protocol.is_path() {
            // path values already start with '/'
            write!(f, "/{}{}", self.protocol, self.value)
        } else {
            write!(f, "/{}/{}", self.protocol, self.value)
        }
    }
}

/// A parsed, canonical address. Two addresses that name the same thing
/// compare equal and render to the same string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address {
    components: Vec<Component>,
}

impl Address {
    pub fn host_path(path: &str) -> Result<Self, AddressError> {
        Ok(Self { components: vec![Component::new(Protocol::Host, path)?] })
    }

    pub fn unix_socket(path: &str) -> Result<Self, AddressError> {
        Ok(Self { components: vec![Component::new(Protocol::Unix, path)?] })
    }

    pub fn tcp(addr: SocketAddr) -> Self {
        let (protocol, ip) = match addr.ip() {
            IpAddr::V4(ip) => (Protocol::Ip4, ip.to_string()),
            IpAddr::V6(ip) => (Protocol::Ip6, ip.to_string()),
        };
        Self {
            components: vec![
                Component { protocol, value: ip },
                Component { protocol: Protocol::Tcp, value: addr.port().to_string() },
            ],
        }
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    /// First value carried by `protocol`, if any.
    pub fn value_for(&self, protocol: Protocol) -> Option<&str> {
        self.components.iter().find(|c| c.protocol == protocol).map(|c| c.value.as_str())
    }

    /// The host filesystem path this address designates, for `/host/...`.
    pub fn as_host_path(&self) -> Option<&str> {
        match self.components.as_slice() {
            [c] if c.protocol == Protocol::Host => Some(&c.value),
            _ => None,
        }
    }

    pub fn is_listener(&self) -> bool {
        self.to_listen_addr().is_ok()
    }

    /// Resolve into something a socket can be bound to.
    pub fn to_listen_addr(&self) -> Result<ListenAddr, AddressError> {
        match self.components.as_slice() {
            [c] if c.protocol == Protocol::Unix => Ok(ListenAddr::Unix(PathBuf::from(&c.value))),
            [ip, port] if port.protocol == Protocol::Tcp => {
                let ip: IpAddr = match ip.protocol {
                    Protocol::Ip4 | Protocol::Ip6 => ip.value.parse().map_err(|_| {
                        AddressError::InvalidValue { protocol: ip.protocol, value: ip.value.clone() }
                    })?,
                    _ => return Err(AddressError::NotListener(self.to_string())),
                };
                let port: u16 = port.value.parse().map_err(|_| AddressError::InvalidValue {
                    protocol: Protocol::Tcp,
                    value: port.value.clone(),
                })?;
                Ok(ListenAddr::Tcp(SocketAddr::new(ip, port)))
            }
            _ => Err(AddressError::NotListener(self.to_string())),
        }
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(AddressError::Empty);
        }
        let Some(mut rest) = s.strip_prefix('/') else {
            return Err(AddressError::NotAbsolute(s.to_string()));
        };

        let mut components = Vec::new();
        while !rest.is_empty() {
            let Some((name, tail)) = rest.split_once('/') else {
                return Err(match Protocol::lookup(rest) {
                    Ok(protocol) => AddressError::MissingValue(protocol),
                    Err(err) => err,
                });
            };
            let protocol = Protocol::lookup(name)?;

            let raw = if protocol.is_path() {
                rest = "";
                format!("/{tail}")
            } else {
                let (value, remaining) = tail.split_once('/').unwrap_or((tail, ""));
                if value.is_empty() {
                    return Err(AddressError::MissingValue(protocol));
                }
                rest = remaining;
                value.to_string()
            };
            components.push(Component::new(protocol, &raw)?);
        }

        if components.is_empty() {
            return Err(AddressError::Empty);
        }
        Ok(Self { components })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for component in &self.components {
            write!(f, "{component}")?;
        }
        Ok(())
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Socket address a listener binds to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListenAddr {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

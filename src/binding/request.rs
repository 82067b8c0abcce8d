use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::address::{Address, AddressError};

/// Protocol used to expose a namespace to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum HostApi {
    #[serde(rename = "fuse")]
    Fuse,
    #[serde(rename = "9p")]
    NineP,
}

impl HostApi {
    pub const ALL: [HostApi; 2] = [HostApi::Fuse, HostApi::NineP];

    pub fn as_str(self) -> &'static str {
        match self {
            HostApi::Fuse => "fuse",
            HostApi::NineP => "9p",
        }
    }
}

/// Virtual filesystem variant served through a host API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    /// Read-only object tree
    Ipfs,
    /// Mutable name tree
    Ipns,
    /// Tree of pinned objects
    PinFs,
    /// Per-key tree
    KeyFs,
    /// Mutable files tree
    Files,
}

impl Namespace {
    pub const ALL: [Namespace; 5] =
        [Namespace::Ipfs, Namespace::Ipns, Namespace::PinFs, Namespace::KeyFs, Namespace::Files];

    pub fn as_str(self) -> &'static str {
        match self {
            Namespace::Ipfs => "ipfs",
            Namespace::Ipns => "ipns",
            Namespace::PinFs => "pinfs",
            Namespace::KeyFs => "keyfs",
            Namespace::Files => "files",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("unknown host API: {0}")]
    UnknownApi(String),

    #[error("unknown namespace: {0}")]
    UnknownNamespace(String),

    #[error("malformed request identity: {0}")]
    Malformed(String),

    #[error(transparent)]
    Address(#[from] AddressError),
}

impl FromStr for HostApi {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fuse" => Ok(HostApi::Fuse),
            "9p" | "plan9protocol" | "ninep" => Ok(HostApi::NineP),
            _ => Err(RequestError::UnknownApi(s.to_string())),
        }
    }
}

impl FromStr for Namespace {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Namespace::ALL
            .into_iter()
            .find(|ns| ns.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| RequestError::UnknownNamespace(s.to_string()))
    }
}

impl fmt::Display for HostApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Service coordinates of a binding.
///
/// Ordering is by host API, then namespace; the router relies on it to
/// form contiguous partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Header {
    pub api: HostApi,
    pub namespace: Namespace,
}

impl Header {
    pub fn new(api: HostApi, namespace: Namespace) -> Self {
        Self { api, namespace }
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}", self.api, self.namespace)
    }
}

/// Host specific half of a request.
///
/// The core only looks at `target` (for identity) and passes the opaque
/// argument list through to the attacher, which interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostRequest {
    pub target: Address,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<String>,
}

impl HostRequest {
    pub fn new(target: Address) -> Self {
        Self { target, arguments: Vec::new() }
    }

    pub fn with_arguments<I, S>(mut self, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments = arguments.into_iter().map(Into::into).collect();
        self
    }

    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }
}

impl fmt::Display for HostRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.target)
    }
}

/// A bind (or detach) request for one target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Request {
    pub header: Header,
    pub host: HostRequest,
}

impl Request {
    pub fn new(header: Header, host: HostRequest) -> Self {
        Self { header, host }
    }

    /// Canonical identity used for de-duplication and indexing:
    /// `/<api>/<namespace><target>`, e.g. `/fuse/ipfs/host/mnt/ipfs`.
    pub fn identity(&self) -> String {
        format!("{}{}", self.header, self.host.target)
    }

    /// Identity of the target alone, the key inside one header's index.
    pub fn target_identity(&self) -> String {
        self.host.target.to_string()
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identity())
    }
}

/// Parses the identity form back into a request without arguments.
impl FromStr for Request {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || RequestError::Malformed(s.to_string());
        let rest = s.strip_prefix('/').ok_or_else(malformed)?;
        let (api, rest) = rest.split_once('/').ok_or_else(malformed)?;
        let (namespace, target) = rest.split_once('/').ok_or_else(malformed)?;

        let header = Header::new(api.parse()?, namespace.parse()?);
        let target: Address = format!("/{target}").parse()?;
        Ok(Request::new(header, HostRequest::new(target)))
    }
}

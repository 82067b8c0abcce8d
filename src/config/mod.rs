use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::binding::{HostApi, Namespace};

/// Placeholder expanded to the hostbind home directory in paths and
/// listener addresses.
pub const HOME_VARIABLE: &str = "$HOSTBIND_HOME";

const HOME_ENV: &str = "HOSTBIND_HOME";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub mount: MountConfig,
    pub fuse: FuseConfig,
    pub ninep: NinePConfig,
}

/// What `mount` binds when no arguments are given.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountConfig {
    pub api: HostApi,
    pub namespaces: Vec<Namespace>,
    /// Target for the ipfs and pinfs namespaces.
    pub ipfs: String,
    /// Target for the ipns and keyfs namespaces.
    pub ipns: String,
    pub files: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuseConfig {
    pub allow_other: bool,
    pub auto_unmount: bool,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NinePConfig {
    /// Directory holding listener sockets. May contain `$HOSTBIND_HOME`.
    pub runtime_dir: String,
}

impl Config {
    /// Load configuration: built-in defaults, then `path` (if given), then
    /// `HOSTBIND__SECTION__KEY` environment variables.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let defaults = config::Config::try_from(&Config::default())
            .context("Failed to render default configuration")?;

        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("HOSTBIND")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("mount.namespaces"),
            )
            .build()
            .context("Failed to load configuration")?;

        config.try_deserialize().context("Invalid configuration")
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        toml::to_string_pretty(self).context("Failed to render configuration")
    }

    /// Default bind target for `namespace`.
    pub fn target_for(&self, namespace: Namespace) -> &str {
        match namespace {
            Namespace::Ipfs | Namespace::PinFs => &self.mount.ipfs,
            Namespace::Ipns | Namespace::KeyFs => &self.mount.ipns,
            Namespace::Files => &self.mount.files,
        }
    }

    pub fn runtime_dir(&self) -> PathBuf {
        PathBuf::from(expand_home(&self.ninep.runtime_dir))
    }

    /// Default 9P listener address for `namespace`.
    pub fn listener_for(&self, namespace: Namespace) -> String {
        let socket = self.runtime_dir().join(format!("9p.{}.sock", namespace.as_str()));
        format!("/unix{}", socket.display())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mount: MountConfig {
                api: HostApi::Fuse,
                namespaces: vec![Namespace::Ipfs, Namespace::Ipns],
                ipfs: "/ipfs".to_string(),
                ipns: "/ipns".to_string(),
                files: "/file".to_string(),
            },
            fuse: FuseConfig { allow_other: false, auto_unmount: true, read_only: true },
            ninep: NinePConfig { runtime_dir: HOME_VARIABLE.to_string() },
        }
    }
}

/// `$HOSTBIND_HOME`, falling back to `~/.hostbind` and then to a directory
/// under the system temp dir.
pub fn home_dir() -> PathBuf {
    if let Some(home) = std::env::var_os(HOME_ENV).filter(|h| !h.is_empty()) {
        return PathBuf::from(home);
    }
    match std::env::var_os("HOME").filter(|h| !h.is_empty()) {
        Some(home) => PathBuf::from(home).join(".hostbind"),
        None => std::env::temp_dir().join("hostbind"),
    }
}

/// Replace every `$HOSTBIND_HOME` in `value` with [`home_dir`].
pub fn expand_home(value: &str) -> String {
    if !value.contains(HOME_VARIABLE) {
        return value.to_string();
    }
    value.replace(HOME_VARIABLE, &home_dir().to_string_lossy())
}

// FUSE mount management
//
// Mount options travel through the binding core as an opaque argument list
// (`-o opt,opt=value`); this module converts them back and forth and
// performs the actual mount.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::runtime::Handle;

use super::FuseAdapter;
use crate::binding::{BindError, HostRequest};
use crate::fs::Filesystem;

/// Mount options for FUSE filesystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOptions {
    /// Allow other users to access the filesystem
    pub allow_other: bool,

    /// Allow root to access the filesystem
    pub allow_root: bool,

    /// Mount as read-only
    pub read_only: bool,

    /// Filesystem name (for mtab)
    pub fsname: Option<String>,

    /// Auto-unmount on process exit
    pub auto_unmount: bool,

    /// Options passed to the kernel verbatim
    pub extra: Vec<String>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            allow_other: false,
            allow_root: false,
            read_only: false,
            fsname: None,
            auto_unmount: true,
            extra: Vec::new(),
        }
    }
}

impl MountOptions {
    /// Convert to fuser mount options
    pub fn to_fuser_options(&self) -> Vec<fuser::MountOption> {
        let mut options = Vec::new();

        if self.allow_other {
            options.push(fuser::MountOption::AllowOther);
        }

        if self.allow_root {
            options.push(fuser::MountOption::AllowRoot);
        }

        if self.read_only {
            options.push(fuser::MountOption::RO);
        }

        if let Some(ref fsname) = self.fsname {
            options.push(fuser::MountOption::FSName(fsname.clone()));
        }

        if self.auto_unmount {
            options.push(fuser::MountOption::AutoUnmount);
        }

        options.extend(self.extra.iter().cloned().map(fuser::MountOption::CUSTOM));
        options
    }

    /// Render as a `-o` argument list. Empty when there is nothing to pass.
    pub fn to_arguments(&self) -> Vec<String> {
        let mut parts = Vec::new();
        if self.allow_other {
            parts.push("allow_other".to_string());
        }
        if self.allow_root {
            parts.push("allow_root".to_string());
        }
        if self.read_only {
            parts.push("ro".to_string());
        }
        if let Some(fsname) = &self.fsname {
            parts.push(format!("fsname={fsname}"));
        }
        if self.auto_unmount {
            parts.push("auto_unmount".to_string());
        }
        parts.extend(self.extra.iter().cloned());

        if parts.is_empty() { Vec::new() } else { vec!["-o".to_string(), parts.join(",")] }
    }

    /// Parse a `-o` argument list. Options listed nowhere here are kept in
    /// `extra`; without any arguments auto-unmount stays off.
    pub fn from_arguments(arguments: &[String]) -> Result<Self, String> {
        let mut options = MountOptions { auto_unmount: false, ..Default::default() };
        let mut args = arguments.iter();
        while let Some(arg) = args.next() {
            let list = if arg == "-o" {
                args.next().ok_or_else(|| "-o requires a value".to_string())?.as_str()
            } else if let Some(list) = arg.strip_prefix("-o") {
                list
            } else {
                return Err(format!("unexpected mount argument: {arg}"));
            };

            for option in list.split(',').map(str::trim).filter(|o| !o.is_empty()) {
                match option {
                    "allow_other" => options.allow_other = true,
                    "allow_root" => options.allow_root = true,
                    "ro" => options.read_only = true,
                    "rw" => options.read_only = false,
                    "auto_unmount" => options.auto_unmount = true,
                    other => match other.strip_prefix("fsname=") {
                        Some(name) => options.fsname = Some(name.to_string()),
                        None => options.extra.push(other.to_string()),
                    },
                }
            }
        }
        Ok(options)
    }
}

/// A FUSE bind target decoded from a host request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuseRequest {
    pub mountpoint: PathBuf,
    pub options: MountOptions,
}

impl FuseRequest {
    pub fn new(mountpoint: impl Into<PathBuf>, options: MountOptions) -> Self {
        Self { mountpoint: mountpoint.into(), options }
    }

    pub fn parse(request: &HostRequest) -> Result<Self, BindError> {
        let invalid = |reason: String| BindError::InvalidRequest { target: request.to_string(), reason };
        let mountpoint = request
            .target
            .as_host_path()
            .ok_or_else(|| invalid("FUSE targets must be host paths".to_string()))?;
        let options = MountOptions::from_arguments(request.arguments()).map_err(invalid)?;
        Ok(Self::new(mountpoint, options))
    }
}

/// Mount a namespace via FUSE
///
/// Blocks until the kernel accepts the mount; call from a blocking context.
/// Filesystem callbacks run on the session thread and reach the async
/// filesystem through `runtime`.
///
/// # Returns
/// A session handle that keeps the filesystem mounted until joined or dropped
pub fn mount(
    fs: Arc<dyn Filesystem>,
    runtime: Handle,
    mountpoint: impl AsRef<Path>,
    options: &MountOptions,
) -> Result<fuser::BackgroundSession> {
    let mountpoint = mountpoint.as_ref();

    if !mountpoint.exists() {
        anyhow::bail!("Mount point does not exist: {}", mountpoint.display());
    }

    if !mountpoint.is_dir() {
        anyhow::bail!("Mount point is not a directory: {}", mountpoint.display());
    }

    let adapter = FuseAdapter::new(fs, runtime);
    let fuser_options = options.to_fuser_options();

    tracing::info!(mountpoint = %mountpoint.display(), options = ?options, "Mounting FUSE filesystem");

    let session = fuser::spawn_mount2(adapter, mountpoint, &fuser_options)
        .with_context(|| format!("Failed to mount {}", mountpoint.display()))?;

    tracing::info!(mountpoint = %mountpoint.display(), "Filesystem mounted successfully");

    Ok(session)
}

/// Unmount a FUSE session. Dropping the session releases the kernel mount.
pub fn unmount(session: fuser::BackgroundSession, mountpoint: &Path) {
    tracing::info!(mountpoint = %mountpoint.display(), "Unmounting filesystem");
    drop(session);
    tracing::info!(mountpoint = %mountpoint.display(), "Filesystem unmounted successfully");
}

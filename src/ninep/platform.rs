// Host mount calls for 9P listeners

use anyhow::{Context, Result};

#[cfg(any(test, feature = "mockall"))]
use mockall::automock;

/// Attaches a running 9P listener to a host path, and detaches it again.
///
/// Both calls block; callers run them on the blocking pool.
#[cfg_attr(any(test, feature = "mockall"), automock)]
pub trait PlatformMount: Send + Sync {
    /// Mount the server reachable at `source` on `target`. `args` holds the
    /// kernel mount data, such as `trans=unix`.
    fn attach(&self, source: &str, target: &str, args: &str) -> Result<()>;

    fn detach(&self, target: &str) -> Result<()>;
}

/// The host's own mount facility.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemMount;

#[cfg(target_os = "linux")]
impl PlatformMount for SystemMount {
    fn attach(&self, source: &str, target: &str, args: &str) -> Result<()> {
        use nix::mount::{mount, MsFlags};

        tracing::info!(source, target, args, "Mounting 9P listener");
        mount(Some(source), target, Some("9p"), MsFlags::empty(), Some(args))
            .with_context(|| format!("Failed to mount 9P source {source} on {target}"))
    }

    fn detach(&self, target: &str) -> Result<()> {
        tracing::info!(target, "Unmounting 9P listener");
        nix::mount::umount(target).with_context(|| format!("Failed to unmount {target}"))
    }
}

/// Kernels without native 9P go through plan9port.
#[cfg(all(unix, not(target_os = "linux")))]
const PLAN9PORT_BINARY: &str = "9";

#[cfg(all(unix, not(target_os = "linux")))]
impl PlatformMount for SystemMount {
    fn attach(&self, source: &str, target: &str, _args: &str) -> Result<()> {
        use std::process::Command;

        tracing::info!(source, target, "Mounting 9P listener via plan9port");
        let output = Command::new(PLAN9PORT_BINARY)
            .arg("mount")
            .arg(source)
            .arg(target)
            .output()
            .with_context(|| {
                format!("native 9P mount is not supported here and plan9port `{PLAN9PORT_BINARY}` failed to run")
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Failed to mount: {}", stderr);
        }
        Ok(())
    }

    fn detach(&self, target: &str) -> Result<()> {
        use nix::mount::{unmount, MntFlags};

        tracing::info!(target, "Unmounting 9P listener");
        unmount(target, MntFlags::empty()).with_context(|| format!("Failed to unmount {target}"))
    }
}

// 9P host
//
// Serves a namespace over 9P on Unix or TCP listeners and optionally mounts
// those listeners on host paths.

pub mod attacher;
pub mod listener;
pub mod platform;

pub use attacher::{NineAttacher, NineRequest};
pub use listener::{Connection, ConnectionHandler, ListenerRegistry, ServerRef};
pub use platform::{PlatformMount, SystemMount};

#[cfg(any(test, feature = "mockall"))]
pub use platform::MockPlatformMount;

pub mod dispatcher;
pub mod hosts;
pub mod index;
pub mod metrics;
pub mod router;

pub use dispatcher::{drain, Manager};
pub use hosts::{
    attach_batch, spawn_batch, FilesystemFactory, HostAttacher, HostBuilder, HostTable,
};
pub use index::NameIndex;
pub use metrics::BindingMetrics;

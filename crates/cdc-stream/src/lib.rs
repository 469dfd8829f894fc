//! Long-lived change-stream watcher: the core of the core (C4).

pub mod cancellation;
pub mod config;
pub mod error;
pub mod retry;
pub mod sink;
pub mod watcher;

pub use cancellation::CancellationHandle;
pub use config::StreamWatcherConfig;
pub use error::{CdcError, Result};
pub use sink::{SchemaSinkAdapter, SinkCallback};
pub use watcher::StreamWatcher;

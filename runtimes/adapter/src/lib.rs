pub mod adapter;
pub mod component;
pub mod config;
pub mod events;
pub mod instance;
pub mod invocation;
pub mod provider;
pub mod registry;

pub use adapter::{AdapterStats, DopAdapter};
pub use component::{ComponentHandle, ComponentStats};
pub use config::{AdapterConfig, PolicyOverrides};
pub use events::{AdapterEvent, EventKind, InvocationRecord, InvocationStatus, ListenerId, ViolationDetail};
pub use instance::{ComponentInstance, FunctionTable};
pub use invocation::{InvocationReport, InvokeOptions};
pub use provider::{CapabilityProvider, InProcessProvider, ProviderFactory, RESERVED_MEMORY_KEY};

pub use dop_shared::*;

use std::sync::Once;
use tracing_subscriber::EnvFilter;

static INIT_LOGGING: Once = Once::new();

/// Installs a fmt subscriber honoring `RUST_LOG` (default `info`). Safe to
/// call more than once; only the first call has an effect.
pub fn init_logging() {
    INIT_LOGGING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        // Another subscriber may already be installed by the embedder
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    });
}

#[cfg(test)]
mod tests;

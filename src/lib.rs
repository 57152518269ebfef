pub mod config;
pub mod core;
pub mod jobs;
pub mod media;
pub mod providers;
pub mod registry;
pub mod runtime;
pub mod streaming;
pub mod transport;
pub mod warnings;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::GatewayConfig;
pub use core::context::RequestContext;
pub use core::error::RuntimeError;
pub use core::types::*;
pub use runtime::{GatewayRuntime, GatewayRuntimeBuilder};

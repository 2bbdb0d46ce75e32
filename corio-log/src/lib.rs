//! Logging facade of corio.
//!
//! Downstream crates emit diagnostics through the macros re-exported here.
//! Unless the `enable_log` feature is on, the no-op twins from [`dummy`]
//! shadow them, so release builds carry no tracing machinery at the call
//! sites.

#[cfg_attr(not(feature = "enable_log"), doc(hidden))]
pub use tracing::*;

#[cfg(not(feature = "enable_log"))]
pub mod dummy;

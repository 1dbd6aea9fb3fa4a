//! # Cactus Runtime Library
//!
//! The stack layer underneath effect handlers:
//!
//! - **Segments**: growable fiber stacks with a handler block, linked into
//!   a parent chain (the cactus stack)
//! - **Segment Cache**: per-domain free lists of power-of-two size classes
//! - **Stack Growth**: reallocation with pointer rewriting for exception,
//!   frame-pointer and native-call chains
//! - **Continuations**: one-shot atomic ownership of suspended chains
//! - **Root Scanning**: native (frame descriptors and local arenas) and
//!   flat (tagged word array) layouts
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        CACTUS RUNTIME                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │    Domain    │  │ Continuation │  │   Scanner    │          │
//! │  │ (domain.rs)  │  │(continuation)│  │  (scan.rs)   │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │         │                 │                 │                   │
//! │         └─────────────────┼─────────────────┘                   │
//! │                           │                                     │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │   Segments   │  │    Cache     │  │    Growth    │          │
//! │  │ (segment.rs) │  │  (cache.rs)  │  │ (growth.rs)  │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │                                                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod cache;
pub mod config;
pub mod continuation;
pub mod domain;
pub mod error;
pub mod fiber;
pub mod frame;
pub mod growth;
pub mod locals;
pub mod log;
pub mod named;
pub mod platform;
pub mod scan;
pub mod segment;
pub mod value;

// Re-exports
pub use cache::{CacheStats, SegmentCache};
pub use config::{ConfigError, RuntimeConfig, RuntimeConfigBuilder, ScanMode};
pub use continuation::{drop_continuation, Continuation};
pub use domain::{CStackLink, Domain, DomainId};
pub use error::{fatal_error, InvariantViolation, RuntimeError, RuntimeResult};
pub use fiber::FiberId;
pub use frame::{FrameDescriptor, FrameDescriptors, FrameTable, LiveSlot};
pub use locals::{LocalArena, LocalArenas, LocalRegion};
pub use log::{LogFormat, LogLevel};
pub use scan::{do_local_roots, scan_roots, RootSlot, RootVisitor, ScanContext, ScanFlags};
pub use segment::{Handlers, PoolClass, Segment};
pub use value::Value;

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Global runtime configuration.
static RUNTIME_CONFIG: std::sync::OnceLock<RuntimeConfig> = std::sync::OnceLock::new();

/// Initialize the runtime from `CACTUS_*` environment variables.
///
/// See [`RuntimeConfig::from_env`] for the recognized variables.
pub fn init() -> Result<(), ConfigError> {
    init_with_config(RuntimeConfig::from_env())
}

/// Initialize the runtime with `config`.
///
/// The first successful call wins; later calls only validate their argument.
/// Domains created afterwards with [`Domain::new`] use this configuration.
pub fn init_with_config(config: RuntimeConfig) -> Result<(), ConfigError> {
    config.validate()?;
    log::set_level(config.log.level);
    log::set_format(config.log.format);
    let _ = RUNTIME_CONFIG.set(config);
    Ok(())
}

/// Get the current runtime configuration.
///
/// Returns `None` if the runtime was not initialized.
pub fn runtime_config() -> Option<&'static RuntimeConfig> {
    RUNTIME_CONFIG.get()
}

//! # Runtime Configuration
//!
//! Stack sizing, debugging aids and logging, set programmatically or read
//! from the environment.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `CACTUS_INIT_MAIN_STACK_WSIZE` | Initial words of a domain's main segment | 16384 |
//! | `CACTUS_INIT_THREAD_STACK_WSIZE` | Initial words for thread stacks (0 = caller decides) | 0 |
//! | `CACTUS_FIBER_WSIZE` | Words of the smallest pooled segment class | 64 |
//! | `CACTUS_MAX_STACK_WSIZE` | Words a segment may grow to | 134217728 |
//! | `CACTUS_DEBUG_WIPE` | Overwrite freed segment bodies ("true"/"false") | debug builds |
//! | `CACTUS_FRAME_POINTERS` | Rewrite saved base pointers on growth | false |
//! | `CACTUS_SCAN_MODE` | Root scanner (native/flat) | native |
//! | `CACTUS_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | info |
//! | `CACTUS_LOG_FORMAT` | Log format (plain/json) | plain |
//!
//! The segment memory policy is chosen at build time with the `guard-pages`
//! and `mmap-stacks` features and reported by [`StackConfig::alloc_policy`].
//!
//! ```rust,ignore
//! use cactus_runtime::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::builder()
//!     .fiber_wsize(128)
//!     .max_stack_wsize(1 << 20)
//!     .build()?;
//! ```

use std::env;

use crate::log::{LogFormat, LogLevel};
use crate::platform::AllocPolicy;
use crate::segment::STACK_THRESHOLD_WORDS;

/// Which root scanner a domain uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanMode {
    /// Walk frames through frame descriptors.
    #[default]
    Native,
    /// Treat every live word as a candidate root.
    Flat,
}

impl ScanMode {
    /// Parse a mode name.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "native" => Some(ScanMode::Native),
            "flat" | "bytecode" => Some(ScanMode::Flat),
            _ => None,
        }
    }
}

/// Segment sizing.
#[derive(Debug, Clone)]
pub struct StackConfig {
    /// Initial body words of a domain's main segment.
    pub init_main_wsize: usize,

    /// Initial body words for thread stacks. 0 lets the caller decide.
    pub init_thread_wsize: usize,

    /// Body words of a fresh fiber segment and of pool class 0.
    pub fiber_wsize: usize,

    /// Upper bound on a segment's body words.
    pub max_wsize: usize,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            init_main_wsize: 16 * 1024,
            init_thread_wsize: 0,
            fiber_wsize: 64,
            max_wsize: 128 * 1024 * 1024,
        }
    }
}

impl StackConfig {
    /// Memory policy selected by the enabled features.
    pub fn alloc_policy(&self) -> AllocPolicy {
        AllocPolicy::build_default()
    }
}

/// Debugging aids.
#[derive(Debug, Clone)]
pub struct DebugConfig {
    /// Overwrite freed segment bodies and dead local blocks.
    pub wipe: bool,

    /// Maintain saved base pointers across stack growth.
    pub frame_pointers: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            wipe: cfg!(debug_assertions),
            frame_pointers: false,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Minimum level.
    pub level: LogLevel,

    /// Output format.
    pub format: LogFormat,
}

/// Complete runtime configuration.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Segment sizing.
    pub stack: StackConfig,

    /// Debugging aids.
    pub debug: DebugConfig,

    /// Root scanner selection.
    pub scan_mode: ScanMode,

    /// Logging.
    pub log: LogConfig,
}

impl RuntimeConfig {
    /// Start a builder from the defaults.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// Load configuration from `CACTUS_*` variables.
    ///
    /// Unset variables keep their default. Values that fail to parse or
    /// would break a sizing invariant are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = parse_env_usize("CACTUS_FIBER_WSIZE") {
            if val >= STACK_THRESHOLD_WORDS {
                config.stack.fiber_wsize = val;
            }
        }

        if let Some(val) = parse_env_usize("CACTUS_INIT_MAIN_STACK_WSIZE") {
            if val >= config.stack.fiber_wsize {
                config.stack.init_main_wsize = val;
            }
        }

        if let Some(val) = parse_env_usize("CACTUS_INIT_THREAD_STACK_WSIZE") {
            config.stack.init_thread_wsize = val;
        }

        if let Some(val) = parse_env_usize("CACTUS_MAX_STACK_WSIZE") {
            if val >= config.stack.init_main_wsize {
                config.stack.max_wsize = val;
            }
        }

        if let Some(val) = parse_env_bool("CACTUS_DEBUG_WIPE") {
            config.debug.wipe = val;
        }

        if let Some(val) = parse_env_bool("CACTUS_FRAME_POINTERS") {
            config.debug.frame_pointers = val;
        }

        if let Some(mode) = env::var("CACTUS_SCAN_MODE").ok().and_then(|s| ScanMode::from_str(&s)) {
            config.scan_mode = mode;
        }

        if let Some(level) = env::var("CACTUS_LOG_LEVEL").ok().and_then(|s| LogLevel::from_str(&s)) {
            config.log.level = level;
        }

        if let Some(format) = env::var("CACTUS_LOG_FORMAT").ok().and_then(|s| LogFormat::from_str(&s)) {
            config.log.format = format;
        }

        config
    }

    /// Check the sizing invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stack.fiber_wsize < STACK_THRESHOLD_WORDS {
            return Err(ConfigError::InvalidValue {
                field: "stack.fiber_wsize".into(),
                message: format!("must be at least {} words", STACK_THRESHOLD_WORDS),
            });
        }

        if self.stack.init_main_wsize < self.stack.fiber_wsize {
            return Err(ConfigError::InvalidValue {
                field: "stack.init_main_wsize".into(),
                message: "must be at least fiber_wsize".into(),
            });
        }

        if self.stack.max_wsize < self.stack.init_main_wsize {
            return Err(ConfigError::InvalidValue {
                field: "stack.max_wsize".into(),
                message: "must be at least init_main_wsize".into(),
            });
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A field breaks a constraint.
    InvalidValue {
        /// Field name.
        field: String,
        /// What is wrong.
        message: String,
    },
    /// An environment variable could not be parsed.
    EnvParseError {
        /// Variable name.
        var: String,
        /// What is wrong.
        message: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue { field, message } => {
                write!(f, "invalid configuration for '{}': {}", field, message)
            }
            ConfigError::EnvParseError { var, message } => {
                write!(f, "failed to parse environment variable '{}': {}", var, message)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Builder for [`RuntimeConfig`].
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Start from the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Initial main segment words.
    pub fn init_main_wsize(mut self, words: usize) -> Self {
        self.config.stack.init_main_wsize = words;
        self
    }

    /// Initial thread segment words.
    pub fn init_thread_wsize(mut self, words: usize) -> Self {
        self.config.stack.init_thread_wsize = words;
        self
    }

    /// Fiber segment words.
    pub fn fiber_wsize(mut self, words: usize) -> Self {
        self.config.stack.fiber_wsize = words;
        self
    }

    /// Maximum segment words.
    pub fn max_stack_wsize(mut self, words: usize) -> Self {
        self.config.stack.max_wsize = words;
        self
    }

    /// Wipe freed memory.
    pub fn debug_wipe(mut self, enabled: bool) -> Self {
        self.config.debug.wipe = enabled;
        self
    }

    /// Rewrite saved base pointers on growth.
    pub fn frame_pointers(mut self, enabled: bool) -> Self {
        self.config.debug.frame_pointers = enabled;
        self
    }

    /// Root scanner.
    pub fn scan_mode(mut self, mode: ScanMode) -> Self {
        self.config.scan_mode = mode;
        self
    }

    /// Log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log.level = level;
        self
    }

    /// Log format.
    pub fn log_format(mut self, format: LogFormat) -> Self {
        self.config.log.format = format;
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build without validation.
    pub fn build_unchecked(self) -> RuntimeConfig {
        self.config
    }
}

fn parse_env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn parse_env_bool(name: &str) -> Option<bool> {
    env::var(name).ok().and_then(|s| match s.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.stack.fiber_wsize, 64);
        assert_eq!(config.stack.init_main_wsize, 16384);
        assert_eq!(config.stack.init_thread_wsize, 0);
        assert_eq!(config.stack.max_wsize, 128 * 1024 * 1024);
        assert_eq!(config.scan_mode, ScanMode::Native);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::builder()
            .fiber_wsize(128)
            .init_main_wsize(1024)
            .max_stack_wsize(4096)
            .scan_mode(ScanMode::Flat)
            .frame_pointers(true)
            .build()
            .unwrap();
        assert_eq!(config.stack.fiber_wsize, 128);
        assert_eq!(config.stack.max_wsize, 4096);
        assert_eq!(config.scan_mode, ScanMode::Flat);
        assert!(config.debug.frame_pointers);
    }

    #[test]
    fn test_fiber_below_threshold_rejected() {
        let result = RuntimeConfig::builder().fiber_wsize(STACK_THRESHOLD_WORDS - 1).build();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "stack.fiber_wsize"
        ));
    }

    #[test]
    fn test_max_below_main_rejected() {
        let result = RuntimeConfig::builder()
            .init_main_wsize(2048)
            .max_stack_wsize(1024)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_build_unchecked_skips_validation() {
        let config = RuntimeConfig::builder().fiber_wsize(1).build_unchecked();
        assert_eq!(config.stack.fiber_wsize, 1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_scan_mode_from_str() {
        assert_eq!(ScanMode::from_str("NATIVE"), Some(ScanMode::Native));
        assert_eq!(ScanMode::from_str("bytecode"), Some(ScanMode::Flat));
        assert_eq!(ScanMode::from_str("conservative"), None);
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue {
            field: "stack.max_wsize".into(),
            message: "too small".into(),
        };
        assert_eq!(err.to_string(), "invalid configuration for 'stack.max_wsize': too small");
    }

    #[test]
    fn test_from_env_with_no_vars() {
        let config = RuntimeConfig::from_env();
        assert!(config.validate().is_ok());
    }
}

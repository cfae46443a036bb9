//! Heap tuning parameters.

use thiserror::Error;

const KB: usize = 1024;
const MB: usize = 1024 * KB;

/// Smallest arena the heap will accept. Two semi-spaces of 2 KiB each is
/// enough to bootstrap the global environment and the primitive table.
pub const MIN_HEAP_SIZE: usize = 4 * KB;

/// Default total arena size (both semi-spaces together).
pub const DEFAULT_HEAP_SIZE: usize = 4 * MB;

/// Default post-collection occupancy (percent of the semi-space) above
/// which the next collection grows the arena instead of swapping.
pub const DEFAULT_GROW_THRESHOLD: u8 = 75;

/// Default bound on symbol name length in bytes.
pub const DEFAULT_MAX_SYMBOL_LEN: usize = 1024;

/// Configuration for the heap and collector.
///
/// # Examples
///
/// ```
/// use lys_heap::HeapConfig;
///
/// let config = HeapConfig {
///     grow_threshold: 50,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct HeapConfig {
    /// Total arena size in bytes, covering both semi-spaces.
    ///
    /// Must be a power of two and at least [`MIN_HEAP_SIZE`]. The arena
    /// doubles whenever the growth policy fires, so this is only the
    /// starting size.
    pub heap_size: usize,

    /// Occupancy threshold in percent, within `[1, 99]`.
    ///
    /// If the live set after a collection exceeds this share of the
    /// semi-space, the next collection allocates a fresh arena of twice the
    /// total size instead of swapping.
    pub grow_threshold: u8,

    /// Maximum symbol name length in bytes.
    pub max_symbol_len: usize,

    /// Log per-cycle collection statistics at `info` level.
    pub verbose_gc: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        HeapConfig {
            heap_size: DEFAULT_HEAP_SIZE,
            grow_threshold: DEFAULT_GROW_THRESHOLD,
            max_symbol_len: DEFAULT_MAX_SYMBOL_LEN,
            verbose_gc: false,
        }
    }
}

impl HeapConfig {
    /// Check that all values are in valid ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heap_size < MIN_HEAP_SIZE {
            return Err(ConfigError::InvalidHeapSize(format!(
                "heap_size must be at least {} bytes",
                MIN_HEAP_SIZE
            )));
        }

        if !self.heap_size.is_power_of_two() {
            return Err(ConfigError::InvalidHeapSize(
                "heap_size must be a power of two".to_string(),
            ));
        }

        if self.grow_threshold < 1 || self.grow_threshold > 99 {
            return Err(ConfigError::InvalidThreshold(
                "grow_threshold must be between 1 and 99 percent".to_string(),
            ));
        }

        if self.max_symbol_len == 0 || self.max_symbol_len > self.heap_size / 4 {
            return Err(ConfigError::InvalidSymbolLen(
                "max_symbol_len must be non-zero and fit comfortably in a semi-space".to_string(),
            ));
        }

        Ok(())
    }

    /// Build a configuration from environment variables, starting from the
    /// defaults:
    ///
    /// - `LYS_HEAP_SIZE` — total arena bytes
    /// - `LYS_GC_THRESHOLD` — growth threshold percent
    /// - `LYS_GC_VERBOSE` — `1` or `true` enables verbose collection logs
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("LYS_HEAP_SIZE") {
            if let Ok(size) = val.parse::<usize>() {
                config.heap_size = size;
            }
        }

        if let Ok(val) = std::env::var("LYS_GC_THRESHOLD") {
            if let Ok(pct) = val.parse::<u8>() {
                config.grow_threshold = pct;
            }
        }

        if let Ok(val) = std::env::var("LYS_GC_VERBOSE") {
            config.verbose_gc = val == "1" || val.eq_ignore_ascii_case("true");
        }

        config
    }
}

/// Error types for heap configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid heap size: {0}")]
    InvalidHeapSize(String),

    #[error("invalid growth threshold: {0}")]
    InvalidThreshold(String),

    #[error("invalid symbol length bound: {0}")]
    InvalidSymbolLen(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let config = HeapConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.grow_threshold, 75);
    }

    #[test]
    fn test_non_power_of_two_rejected() {
        let config = HeapConfig {
            heap_size: 3 * MB,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tiny_heap_rejected() {
        let config = HeapConfig {
            heap_size: 1024,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_threshold_bounds() {
        for pct in [0u8, 100] {
            let config = HeapConfig {
                grow_threshold: pct,
                ..Default::default()
            };
            assert!(config.validate().is_err(), "threshold {pct} should fail");
        }
        for pct in [1u8, 50, 99] {
            let config = HeapConfig {
                grow_threshold: pct,
                ..Default::default()
            };
            assert!(config.validate().is_ok(), "threshold {pct} should pass");
        }
    }
}

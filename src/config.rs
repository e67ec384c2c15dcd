// CLASSIFICATION: COMMUNITY
// Filename: config.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

//! Platform configuration.
//!
//! All fields have defaults matching the 32-bit ARM layout core is built
//! for; a JSON document only needs to name the values it overrides.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading a [`PlatformConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    /// The configuration document is malformed.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    /// A value is out of range.
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

/// Tunables of the core platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// First virtual address core may allocate; the second page holds the main IPC buffer.
    pub vm_base: usize,
    /// Size of core's virtual address space.
    pub vm_size: usize,
    /// Lowest physical address not kept by the kernel.
    pub unused_phys_base: usize,
    /// End of the physical address space.
    pub unused_phys_limit: usize,
    /// Base of the stack area reserved in core's address space.
    pub stack_area_base: usize,
    /// Size of the stack area.
    pub stack_area_size: usize,
    /// Number of interrupt lines managed by the IRQ allocator.
    pub num_irqs: usize,
    /// Size of the I/O-port space.
    pub io_port_range: usize,
    /// Log the memory layout and allocator state during bootstrap.
    pub verbose_boot_info: bool,
    /// Priority assigned to newly created threads.
    pub thread_priority: u8,
    /// Radix of the CNode backing each protection domain's CSpace; the CNode
    /// is retyped from a single page.
    pub pd_cspace_size_log2: u8,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        let vm_base = 0x2000;
        Self {
            vm_base,
            vm_size: 3 * 1024 * 1024 * 1024 - vm_base,
            unused_phys_base: 0x0010_0000,
            unused_phys_limit: 1 << 32,
            stack_area_base: 0x4000_0000,
            stack_area_size: 0x1000_0000,
            num_irqs: 256,
            io_port_range: 0x1_0000,
            verbose_boot_info: true,
            thread_priority: 100,
            pd_cspace_size_log2: 8,
        }
    }
}

impl PlatformConfig {
    /// Parses a JSON document, filling unspecified fields with defaults.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses the JSON document at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.vm_base % 0x1000 != 0 || self.stack_area_base % 0x1000 != 0 {
            return Err(ConfigError::Invalid("virtual bases must be page aligned"));
        }
        if self.unused_phys_base >= self.unused_phys_limit {
            return Err(ConfigError::Invalid("empty physical address space"));
        }
        if !(2..=8).contains(&self.pd_cspace_size_log2) {
            return Err(ConfigError::Invalid("pd_cspace_size_log2 must lie in 2..=8"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_describe_lower_three_gib() {
        let config = PlatformConfig::default();
        assert_eq!(config.vm_base + config.vm_size, 0xc000_0000);
        assert_eq!(config.num_irqs, 256);
    }

    #[test]
    fn json_overrides_only_named_fields() {
        let config = PlatformConfig::from_json(r#"{ "verbose_boot_info": false, "num_irqs": 64 }"#)
            .expect("parse");
        assert!(!config.verbose_boot_info);
        assert_eq!(config.num_irqs, 64);
        assert_eq!(config.vm_base, 0x2000);
    }

    #[test]
    fn misaligned_base_is_rejected() {
        let err = PlatformConfig::from_json(r#"{ "vm_base": 4097 }"#).expect_err("misaligned");
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}

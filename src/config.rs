//! Runtime configuration for the JIT.
//!
//! Configuration is read from TOML (usually a `jit.toml` next to the host
//! runtime's own settings). Every field has a default, so an empty document
//! is a valid configuration:
//!
//! ```toml
//! pool_size = 16777216
//! protection = "write-xor-execute"
//! on_finalize_failure = "abort"
//! log_disassembly = false
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{JitError, JitResult};

/// Default executable pool reservation (16 MiB)
pub const DEFAULT_POOL_SIZE: usize = 16 * 1024 * 1024;

/// Smallest pool we accept; one page for code plus one for a stub
pub const MIN_POOL_SIZE: usize = 2 * 4096;

/// How the executable pool handles page permissions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProtectionPolicy {
    /// Pages are read-execute. A write widens the affected pages to
    /// read-write-execute for the duration of the write only, so code on
    /// them keeps running on other threads.
    WriteXorExecute,
    /// The whole pool is mapped read-write-execute for its lifetime
    ReadWriteExecute,
}

/// What happens when a slow-path stub cannot be linked or finalized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinalizeFailurePolicy {
    /// Treat the failure as fatal
    Abort,
    /// Report the error and invalidate the containing unit so the
    /// dispatcher falls back to a lower tier
    Deoptimize,
}

/// JIT configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JitConfig {
    /// Size of the executable pool in bytes
    pub pool_size: usize,
    /// Page protection strategy
    pub protection: ProtectionPolicy,
    /// Policy for stub finalization failures
    pub on_finalize_failure: FinalizeFailurePolicy,
    /// Log stub disassembly at trace level after generation
    pub log_disassembly: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            protection: ProtectionPolicy::WriteXorExecute,
            on_finalize_failure: FinalizeFailurePolicy::Abort,
            log_disassembly: false,
        }
    }
}

impl JitConfig {
    /// Parse a configuration from a TOML document
    pub fn from_toml_str(source: &str) -> JitResult<Self> {
        let config: JitConfig =
            toml::from_str(source).map_err(|e| JitError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn from_file(path: impl AsRef<Path>) -> JitResult<Self> {
        let path = path.as_ref();
        let source = fs::read_to_string(path)
            .map_err(|e| JitError::ConfigIo(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&source)
    }

    /// Check semantic constraints that serde cannot express
    pub fn validate(&self) -> JitResult<()> {
        if self.pool_size < MIN_POOL_SIZE {
            return Err(JitError::InvalidConfig(format!(
                "pool_size must be at least {} bytes, got {}",
                MIN_POOL_SIZE, self.pool_size
            )));
        }
        Ok(())
    }

    /// Set the pool size
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Set the protection policy
    pub fn with_protection(mut self, protection: ProtectionPolicy) -> Self {
        self.protection = protection;
        self
    }

    /// Surface finalization failures as errors and deoptimize instead of aborting
    pub fn deoptimize_on_failure(mut self) -> Self {
        self.on_finalize_failure = FinalizeFailurePolicy::Deoptimize;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_is_default() {
        let config = JitConfig::from_toml_str("").expect("empty config parses");
        assert_eq!(config, JitConfig::default());
    }

    #[test]
    fn test_parse_all_fields() {
        let config = JitConfig::from_toml_str(
            r#"
            pool_size = 1048576
            protection = "read-write-execute"
            on_finalize_failure = "deoptimize"
            log_disassembly = true
            "#,
        )
        .expect("config parses");

        assert_eq!(config.pool_size, 1024 * 1024);
        assert_eq!(config.protection, ProtectionPolicy::ReadWriteExecute);
        assert_eq!(config.on_finalize_failure, FinalizeFailurePolicy::Deoptimize);
        assert!(config.log_disassembly);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = JitConfig::from_toml_str("pool_sise = 10").unwrap_err();
        assert!(matches!(err, JitError::InvalidConfig(_)));
    }

    #[test]
    fn test_tiny_pool_rejected() {
        let err = JitConfig::from_toml_str("pool_size = 100").unwrap_err();
        assert!(err.to_string().contains("pool_size"));
    }

    #[test]
    fn test_missing_file() {
        let err = JitConfig::from_file("/nonexistent/jit.toml").unwrap_err();
        assert!(matches!(err, JitError::ConfigIo(_)));
    }

    #[test]
    fn test_builders() {
        let config = JitConfig::default()
            .with_pool_size(1 << 20)
            .with_protection(ProtectionPolicy::ReadWriteExecute)
            .deoptimize_on_failure();
        assert_eq!(config.pool_size, 1 << 20);
        assert_eq!(config.protection, ProtectionPolicy::ReadWriteExecute);
        assert_eq!(config.on_finalize_failure, FinalizeFailurePolicy::Deoptimize);
    }
}

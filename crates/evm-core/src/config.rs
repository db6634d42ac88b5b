//! VM-wide configuration (spec §6), loaded the way `evm-runtime` loads the
//! rest of the server's config and handed to [`crate::vm::Vm::new`].

use serde::{Deserialize, Serialize};

/// Configuration governing a single [`crate::vm::Vm`] instance: worker pool
/// sizing and accept/commit logging verbosity (spec §6 config keys
/// `vm.pool.size`, `vm.log.commit.debug`, `vm.log.accept.debug`,
/// `vm.log.accept.info`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Bounds how many `vm.post` dispatches may run concurrently
    /// (`vm.pool.size`).
    pub pool_size: usize,
    /// Log every commit at debug level (`vm.log.commit.debug`).
    pub log_commit_debug: bool,
    /// Log every accepted evaluation at debug level
    /// (`vm.log.accept.debug`).
    pub log_accept_debug: bool,
    /// Log every accepted evaluation at info level
    /// (`vm.log.accept.info`).
    pub log_accept_info: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            pool_size: 16,
            log_commit_debug: false,
            log_accept_debug: false,
            log_accept_info: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_config_keys() {
        let config = VmConfig::default();
        assert_eq!(config.pool_size, 16);
        assert!(config.log_accept_info);
        assert!(!config.log_accept_debug);
        assert!(!config.log_commit_debug);
    }

    #[test]
    fn deserializes_partial_toml_with_defaults() {
        let config: VmConfig = toml_like_defaults();
        assert_eq!(config.pool_size, 16);
    }

    fn toml_like_defaults() -> VmConfig {
        serde_json::from_str("{}").unwrap()
    }
}

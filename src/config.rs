use argus_core::config::{ConfigError, ModuleConfig};
use probe_common::program::PERF_PAGES_DEFAULT;

/// User configuration of the probe.
#[derive(Clone, Debug)]
pub struct Config {
    /// Enable the in-kernel policy tables. When false the probe writes an
    /// explicit pass-everything policy for every event type on init.
    pub enable_kernel_filters: bool,
    /// Enable pushing discarders down to the kernel. When false every
    /// discarder notification is a no-op.
    pub enable_discarders: bool,
    /// Poll the kernel per-syscall counters.
    pub syscall_monitor: bool,
    /// Pages of memory (4Kb) per CPU used for the perf buffers.
    pub perf_pages: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enable_kernel_filters: true,
            enable_discarders: true,
            syscall_monitor: false,
            perf_pages: PERF_PAGES_DEFAULT,
        }
    }
}

/// Extract Config from configuration file
impl TryFrom<&ModuleConfig> for Config {
    type Error = ConfigError;

    fn try_from(config: &ModuleConfig) -> Result<Self, Self::Error> {
        Ok(Config {
            enable_kernel_filters: config.with_default("enable_kernel_filters", true)?,
            enable_discarders: config.with_default("enable_discarders", true)?,
            syscall_monitor: config.with_default("syscall_monitor", false)?,
            perf_pages: config.with_default("perf_pages", PERF_PAGES_DEFAULT)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_for_missing_fields() {
        let raw = ModuleConfig::default();
        let config = Config::try_from(&raw).unwrap();
        assert!(config.enable_kernel_filters);
        assert!(config.enable_discarders);
        assert!(!config.syscall_monitor);
        assert_eq!(config.perf_pages, PERF_PAGES_DEFAULT);
    }

    #[test]
    fn fields_override_defaults() {
        let mut raw = ModuleConfig::default();
        raw.insert("enable_kernel_filters".to_string(), "false".to_string());
        raw.insert("syscall_monitor".to_string(), "true".to_string());
        let config = Config::try_from(&raw).unwrap();
        assert!(!config.enable_kernel_filters);
        assert!(config.syscall_monitor);
    }
}

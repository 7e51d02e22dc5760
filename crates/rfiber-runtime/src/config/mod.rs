//! Runtime configuration
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder methods
//! 2. Environment variables (`RFB_*`)
//! 3. Compile-time defaults (`RFB_CONFIG_RS` file merged by build.rs)
//!
//! ```rust,ignore
//! use rfiber_runtime::config::SchedulerConfig;
//!
//! let config = SchedulerConfig::from_env()
//!     .num_groups(2)
//!     .workers_per_group(4);
//! config.validate()?;
//! ```

pub mod defaults;

use std::time::Duration;

use rfiber_core::constants::MAX_WORKERS;
use rfiber_core::env::{env_get, env_get_bool, env_get_millis};
use rfiber_core::{FiberError, FiberResult};

/// Smallest stack a fiber may be given
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Scheduler configuration with builder pattern
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of scheduling groups
    pub num_groups: usize,
    /// Worker threads in each group
    pub workers_per_group: usize,
    /// Capacity of each worker's work queue (rounded up to a power of two)
    pub run_queue_capacity: usize,
    /// Default fiber stack size, served from the stack pool
    pub stack_size: usize,
    /// Number of freed default-size stacks kept for reuse
    pub stack_pool_capacity: usize,
    /// Empty polls before a worker parks
    pub idle_spins: u32,
    /// Upper bound on a single park
    pub park_timeout: Duration,
    /// Whether idle workers steal from other groups
    pub cross_group_stealing: bool,
    /// Raise the log level to debug at startup
    pub debug_logging: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl SchedulerConfig {
    /// Compile-time defaults with environment overrides
    ///
    /// Environment variables (all optional):
    /// - `RFB_NUM_GROUPS`
    /// - `RFB_WORKERS_PER_GROUP`
    /// - `RFB_RUN_QUEUE_CAPACITY`
    /// - `RFB_STACK_SIZE` - bytes
    /// - `RFB_STACK_POOL_CAPACITY`
    /// - `RFB_IDLE_SPINS`
    /// - `RFB_PARK_TIMEOUT_MS`
    /// - `RFB_CROSS_GROUP_STEALING` - 0/1
    /// - `RFB_DEBUG` - 0/1
    pub fn from_env() -> Self {
        let base = Self::new();
        Self {
            num_groups: env_get("RFB_NUM_GROUPS", base.num_groups),
            workers_per_group: env_get("RFB_WORKERS_PER_GROUP", base.workers_per_group),
            run_queue_capacity: env_get("RFB_RUN_QUEUE_CAPACITY", base.run_queue_capacity),
            stack_size: env_get("RFB_STACK_SIZE", base.stack_size),
            stack_pool_capacity: env_get("RFB_STACK_POOL_CAPACITY", base.stack_pool_capacity),
            idle_spins: env_get("RFB_IDLE_SPINS", base.idle_spins),
            park_timeout: env_get_millis("RFB_PARK_TIMEOUT_MS", base.park_timeout),
            cross_group_stealing: env_get_bool(
                "RFB_CROSS_GROUP_STEALING",
                base.cross_group_stealing,
            ),
            debug_logging: env_get_bool("RFB_DEBUG", base.debug_logging),
        }
    }

    /// Compile-time defaults only, no environment lookups
    pub fn new() -> Self {
        Self {
            num_groups: defaults::NUM_GROUPS,
            workers_per_group: defaults::WORKERS_PER_GROUP,
            run_queue_capacity: defaults::RUN_QUEUE_CAPACITY,
            stack_size: defaults::STACK_SIZE,
            stack_pool_capacity: defaults::STACK_POOL_CAPACITY,
            idle_spins: defaults::IDLE_SPINS,
            park_timeout: Duration::from_millis(defaults::PARK_TIMEOUT_MS),
            cross_group_stealing: defaults::CROSS_GROUP_STEALING,
            debug_logging: defaults::DEBUG_LOGGING || cfg!(feature = "debug-logging"),
        }
    }

    pub fn num_groups(mut self, n: usize) -> Self {
        self.num_groups = n;
        self
    }

    pub fn workers_per_group(mut self, n: usize) -> Self {
        self.workers_per_group = n;
        self
    }

    pub fn run_queue_capacity(mut self, cap: usize) -> Self {
        self.run_queue_capacity = cap;
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn stack_pool_capacity(mut self, cap: usize) -> Self {
        self.stack_pool_capacity = cap;
        self
    }

    pub fn idle_spins(mut self, spins: u32) -> Self {
        self.idle_spins = spins;
        self
    }

    pub fn park_timeout(mut self, d: Duration) -> Self {
        self.park_timeout = d;
        self
    }

    pub fn cross_group_stealing(mut self, enable: bool) -> Self {
        self.cross_group_stealing = enable;
        self
    }

    pub fn debug_logging(mut self, enable: bool) -> Self {
        self.debug_logging = enable;
        self
    }

    /// Total worker threads across all groups
    pub fn total_workers(&self) -> usize {
        self.num_groups * self.workers_per_group
    }

    /// Check the configuration before starting workers
    pub fn validate(&self) -> FiberResult<()> {
        if self.num_groups == 0 {
            return Err(FiberError::InvalidConfig("num_groups must be > 0"));
        }
        if self.workers_per_group == 0 {
            return Err(FiberError::InvalidConfig("workers_per_group must be > 0"));
        }
        if self.workers_per_group > MAX_WORKERS {
            return Err(FiberError::InvalidConfig("workers_per_group exceeds MAX_WORKERS"));
        }
        if self.run_queue_capacity < 2 {
            return Err(FiberError::InvalidConfig("run_queue_capacity must be >= 2"));
        }
        if self.stack_size < MIN_STACK_SIZE {
            return Err(FiberError::InvalidConfig("stack_size must be >= 16KB"));
        }
        if self.stack_size % crate::memory::page_size() != 0 {
            return Err(FiberError::InvalidConfig("stack_size must be a multiple of the page size"));
        }
        Ok(())
    }

    /// Log the configuration at info level
    pub fn print(&self) {
        rfiber_core::kinfo!("rfiber configuration:");
        rfiber_core::kinfo!("  num_groups:           {}", self.num_groups);
        rfiber_core::kinfo!("  workers_per_group:    {}", self.workers_per_group);
        rfiber_core::kinfo!("  run_queue_capacity:   {}", self.run_queue_capacity);
        rfiber_core::kinfo!("  stack_size:           {}", self.stack_size);
        rfiber_core::kinfo!("  stack_pool_capacity:  {}", self.stack_pool_capacity);
        rfiber_core::kinfo!("  idle_spins:           {}", self.idle_spins);
        rfiber_core::kinfo!("  park_timeout:         {:?}", self.park_timeout);
        rfiber_core::kinfo!("  cross_group_stealing: {}", self.cross_group_stealing);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = SchedulerConfig::new();
        assert!(config.num_groups >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = SchedulerConfig::new()
            .num_groups(2)
            .workers_per_group(3)
            .cross_group_stealing(false)
            .park_timeout(Duration::from_millis(5));

        assert_eq!(config.total_workers(), 6);
        assert!(!config.cross_group_stealing);
        assert_eq!(config.park_timeout, Duration::from_millis(5));
    }

    #[test]
    fn test_validation() {
        assert!(SchedulerConfig::new().num_groups(0).validate().is_err());
        assert!(SchedulerConfig::new().workers_per_group(0).validate().is_err());
        assert!(SchedulerConfig::new()
            .workers_per_group(MAX_WORKERS + 1)
            .validate()
            .is_err());
        assert!(SchedulerConfig::new().run_queue_capacity(0).validate().is_err());
        assert!(matches!(
            SchedulerConfig::new().run_queue_capacity(1).validate(),
            Err(FiberError::InvalidConfig(_))
        ));
        assert!(SchedulerConfig::new().run_queue_capacity(2).validate().is_ok());
        assert!(SchedulerConfig::new().stack_size(4096).validate().is_err());
        assert!(SchedulerConfig::new()
            .stack_size(MIN_STACK_SIZE + 1)
            .validate()
            .is_err());
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("RFB_NUM_GROUPS", "3");
        let config = SchedulerConfig::from_env();
        std::env::remove_var("RFB_NUM_GROUPS");
        assert_eq!(config.num_groups, 3);
    }
}

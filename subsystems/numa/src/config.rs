//! # NUMA Configuration
//!
//! Tunables fixed when the subsystem is brought up.

/// Default page size in bytes
pub const DEFAULT_PAGE_SIZE: u64 = 4096;

/// Default upper bound on a single `move_pages` batch
pub const DEFAULT_MAX_MOVE_PAGES: usize = 65_536;

/// Pids below this value name the kernel and init
pub const DEFAULT_RESERVED_PID_FLOOR: i32 = 2;

/// NUMA subsystem configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumaConfig {
    /// Page size in bytes (power of two)
    pub page_size: u64,
    /// Largest accepted `move_pages` count
    pub max_move_pages: usize,
    /// Lowest pid the userspace library and migration accept
    pub reserved_pid_floor: i32,
    /// Whether `migrate_pages` also relocates pages shared with other processes
    pub migrate_shared: bool,
}

impl NumaConfig {
    /// Default configuration
    pub const fn new() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_move_pages: DEFAULT_MAX_MOVE_PAGES,
            reserved_pid_floor: DEFAULT_RESERVED_PID_FLOOR,
            migrate_shared: false,
        }
    }

    /// Create builder
    pub fn builder() -> NumaConfigBuilder {
        NumaConfigBuilder::new()
    }

    /// log2 of the page size
    pub const fn page_shift(&self) -> u32 {
        self.page_size.trailing_zeros()
    }

    /// Virtual page number containing `addr`
    pub const fn vpn_of(&self, addr: u64) -> u64 {
        addr >> self.page_shift()
    }
}

impl Default for NumaConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`NumaConfig`]
#[derive(Debug, Clone)]
pub struct NumaConfigBuilder {
    config: NumaConfig,
}

impl NumaConfigBuilder {
    /// Start from defaults
    pub const fn new() -> Self {
        Self {
            config: NumaConfig::new(),
        }
    }

    /// Page size; ignored unless a power of two
    pub fn page_size(mut self, size: u64) -> Self {
        if size.is_power_of_two() {
            self.config.page_size = size;
        } else {
            log::warn!("NUMA: ignoring non power-of-two page size {}", size);
        }
        self
    }

    /// Largest `move_pages` batch
    pub fn max_move_pages(mut self, count: usize) -> Self {
        self.config.max_move_pages = count;
        self
    }

    /// Lowest accepted pid
    pub fn reserved_pid_floor(mut self, floor: i32) -> Self {
        self.config.reserved_pid_floor = floor;
        self
    }

    /// Relocate shared pages in `migrate_pages`
    pub fn migrate_shared(mut self, enabled: bool) -> Self {
        self.config.migrate_shared = enabled;
        self
    }

    /// Finish
    pub fn build(self) -> NumaConfig {
        self.config
    }
}

impl Default for NumaConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults_and_overrides() {
        let config = NumaConfig::builder()
            .page_size(3000)
            .max_move_pages(16)
            .migrate_shared(true)
            .build();

        assert_eq!(config.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(config.max_move_pages, 16);
        assert!(config.migrate_shared);
        assert_eq!(config.reserved_pid_floor, 2);
        assert_eq!(config.page_shift(), 12);
        assert_eq!(config.vpn_of(0x2fff), 2);
    }
}

//! Address space geometry and policy switches

use log::warn;

/// Storage strategy for the page protection table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableLayout {
    /// One byte per page for the whole space, allocated up front
    Flat,
    /// Lazily allocated chunks of `1 << 20` pages
    TwoLevel,
}

/// Virtual memory manager configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    pub page_size: usize,
    /// Allocation granularity (always 64K)
    pub granularity: usize,
    pub address_space_start: usize,
    pub address_space_limit: usize,
    pub user_space_limit: usize,
    pub working_set_limit: usize,
    /// Search the free-range index directly for dynamic placement
    pub large_address_space: bool,
    pub table_layout: TableLayout,
    /// Range reserved by the preloader, never handed out
    pub preload_reserve: Option<(usize, usize)>,
    pub force_exec: bool,
    pub write_watch_enabled: bool,
    /// Number of view records grown up front
    pub view_capacity: usize,
    /// Diagnostic cap on the free-range index length
    pub free_range_capacity: usize,
    pub min_stack_size: usize,
    pub default_stack_reserve: usize,
    pub default_stack_commit: usize,
    pub teb_size: usize,
    /// Stack bytes kept for overflow handling
    pub guaranteed_stack_bytes: usize,
}

pub const GRANULARITY: usize = 0x10000;
pub const GRANULARITY_MASK: usize = GRANULARITY - 1;

impl VmConfig {
    /// Layout of a 64-bit process
    pub fn wide(page_size: usize) -> Self {
        let view_block_size = 0x20_0000;
        Self {
            page_size,
            granularity: GRANULARITY,
            address_space_start: 0x10000,
            address_space_limit: 0x7fff_ffff_0000,
            user_space_limit: 0x7fff_ffff_0000,
            working_set_limit: 0x7fff_ffff_0000,
            large_address_space: true,
            table_layout: TableLayout::TwoLevel,
            preload_reserve: None,
            force_exec: false,
            write_watch_enabled: true,
            view_capacity: 256,
            free_range_capacity: view_block_size / (2 * core::mem::size_of::<usize>()),
            min_stack_size: 1024 * 1024,
            default_stack_reserve: 1024 * 1024,
            default_stack_commit: 0x1000,
            teb_size: 0x4000,
            guaranteed_stack_bytes: 0,
        }
    }

    /// Layout of a 32-bit process
    pub fn narrow(page_size: usize) -> Self {
        let view_block_size = 0x10_0000;
        Self {
            address_space_start: 0x110000,
            address_space_limit: 0xc000_0000,
            user_space_limit: 0x7fff_0000,
            working_set_limit: 0x7fff_0000,
            large_address_space: false,
            table_layout: TableLayout::Flat,
            free_range_capacity: view_block_size / (2 * core::mem::size_of::<usize>()),
            teb_size: 0x2000,
            ..Self::wide(page_size)
        }
    }

    /// Defaults for the running architecture
    pub fn host(page_size: usize) -> Self {
        if cfg!(target_pointer_width = "64") {
            Self::wide(page_size)
        } else {
            Self::narrow(page_size)
        }
    }

    /// Host defaults overlaid with `NTVM_*` environment switches
    pub fn from_env(page_size: usize) -> Self {
        let mut config = Self::host(page_size);
        if let Ok(value) = std::env::var("NTVM_PRELOAD_RESERVE") {
            match parse_reserve(&value) {
                Some(range) => config.preload_reserve = Some(range),
                None => warn!("ignoring malformed NTVM_PRELOAD_RESERVE {:?}", value),
            }
        }
        if env_flag("NTVM_FORCE_EXEC") {
            config.force_exec = true;
        }
        if env_flag("NTVM_DISABLE_WRITE_WATCH") {
            config.write_watch_enabled = false;
        }
        config
    }

    pub fn is_64bit(&self) -> bool {
        self.table_layout == TableLayout::TwoLevel
    }

    pub fn page_mask(&self) -> usize {
        self.page_size - 1
    }

    pub fn page_shift(&self) -> u32 {
        self.page_size.trailing_zeros()
    }

    /// Round down to a page boundary
    pub fn trunc_page(&self, addr: usize) -> usize {
        addr & !self.page_mask()
    }

    /// Round up to a page boundary
    pub fn round_page(&self, addr: usize) -> usize {
        addr.wrapping_add(self.page_mask()) & !self.page_mask()
    }

    /// Preload reserve widened to allocation granularity
    pub fn rounded_preload_reserve(&self) -> Option<(usize, usize)> {
        self.preload_reserve.map(|(start, end)| {
            (
                start & !GRANULARITY_MASK,
                end.saturating_add(GRANULARITY_MASK) & !GRANULARITY_MASK,
            )
        })
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).map(|v| v != "0" && !v.is_empty()).unwrap_or(false)
}

/// Parse `<hex>-<hex>`, with or without `0x`
fn parse_reserve(value: &str) -> Option<(usize, usize)> {
    let (start, end) = value.split_once('-')?;
    let parse = |s: &str| {
        let s = s.trim();
        let s = s.strip_prefix("0x").unwrap_or(s);
        usize::from_str_radix(s, 16).ok()
    };
    let (start, end) = (parse(start)?, parse(end)?);
    (start < end).then_some((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wide_layout() {
        let config = VmConfig::wide(0x1000);
        assert!(config.is_64bit());
        assert_eq!(config.address_space_start, 0x10000);
        assert_eq!(config.user_space_limit, 0x7fff_ffff_0000);
        assert_eq!(config.page_shift(), 12);
    }

    #[test]
    fn test_narrow_layout() {
        let config = VmConfig::narrow(0x1000);
        assert!(!config.is_64bit());
        assert_eq!(config.address_space_limit, 0xc000_0000);
        assert_eq!(config.granularity, 0x10000);
    }

    #[test]
    fn test_page_rounding() {
        let config = VmConfig::wide(0x1000);
        assert_eq!(config.trunc_page(0x12345), 0x12000);
        assert_eq!(config.round_page(0x12345), 0x13000);
        assert_eq!(config.round_page(0x12000), 0x12000);
    }

    #[test]
    fn test_parse_reserve() {
        assert_eq!(parse_reserve("0x10000-0x20000"), Some((0x10000, 0x20000)));
        assert_eq!(parse_reserve("7f000000-7f100000"), Some((0x7f00_0000, 0x7f10_0000)));
        assert_eq!(parse_reserve("20000-10000"), None);
        assert_eq!(parse_reserve("garbage"), None);
    }

    #[test]
    fn test_from_env_overlay() {
        // No other test touches these variables.
        std::env::set_var("NTVM_PRELOAD_RESERVE", "0x10000-0x20000");
        std::env::set_var("NTVM_FORCE_EXEC", "1");
        std::env::set_var("NTVM_DISABLE_WRITE_WATCH", "1");
        let config = VmConfig::from_env(0x1000);
        assert_eq!(config.preload_reserve, Some((0x10000, 0x20000)));
        assert!(config.force_exec);
        assert!(!config.write_watch_enabled);

        std::env::set_var("NTVM_PRELOAD_RESERVE", "20000-10000");
        std::env::set_var("NTVM_FORCE_EXEC", "0");
        std::env::remove_var("NTVM_DISABLE_WRITE_WATCH");
        let config = VmConfig::from_env(0x1000);
        assert_eq!(config.preload_reserve, None);
        assert!(!config.force_exec);
        assert!(config.write_watch_enabled);

        std::env::remove_var("NTVM_PRELOAD_RESERVE");
        std::env::remove_var("NTVM_FORCE_EXEC");
        assert_eq!(VmConfig::from_env(0x1000).preload_reserve, VmConfig::host(0x1000).preload_reserve);
    }

    #[test]
    fn test_rounded_preload_reserve() {
        let mut config = VmConfig::wide(0x1000);
        config.preload_reserve = Some((0x12345, 0x23456));
        assert_eq!(config.rounded_preload_reserve(), Some((0x10000, 0x30000)));
    }
}

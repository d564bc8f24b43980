//! Validated configuration inputs.  Construction checks `page_size`'s
//! power-of-two property (`ret > 0 && ret & (ret - 1) == 0`) once, at
//! `Config::new`, so every later consumer can assume it holds.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
)))]
use disabled_contracts::*;

use crate::error::PacError;

fn is_power_of_two(x: usize) -> bool {
    x > 0 && (x & (x - 1)) == 0
}

#[cfg(not(feature = "test_only_small_constants"))]
fn default_growth_series(page_size: usize) -> Vec<usize> {
    let _ = page_size;
    vec![1 << 20, 2 << 20, 4 << 20, 8 << 20]
}

#[cfg(feature = "test_only_small_constants")]
fn default_growth_series(page_size: usize) -> Vec<usize> {
    vec![page_size, 2 * page_size, 4 * page_size, 8 * page_size]
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Mapping granularity; all `base`/`size` values are multiples of
    /// this.
    pub page_size: usize,
    /// Cap on over-fit (in power-of-two multiples of the request) for
    /// the delay-coalesce (dirty) cache.  Default 6.
    pub lg_extent_max_active_fit: u32,
    /// Whether the retained-growth engine may ask the OS for fresh VM
    /// at all.
    pub retain: bool,
    /// Size, in bytes, above which large dirty extents bypass caching
    /// and are purged straight through to `retained`.
    pub oversize_threshold: usize,
    /// Size, in bytes, at or above which an extent is "large" for the
    /// purposes of the delay-coalesce record path:
    /// large extents get a single inactive-only coalesce attempt
    /// before being cached, instead of none at all. Approximates
    /// jemalloc's `SC_LARGE_MINCLASS`.
    pub large_min_class: usize,
    /// Decay period for the dirty cache, in milliseconds; `-1`
    /// disables forced decay for this cache.
    pub decay_ms_dirty: i64,
    /// Decay period for the muzzy cache, in milliseconds; `-1`
    /// disables forced decay for this cache.
    pub decay_ms_muzzy: i64,
    /// Whether the platform can merge independently obtained OS
    /// mappings.  When `false` and `retain` is also `false`, the core
    /// runs in exact-fit mode (no split/merge).
    pub maps_coalesce: bool,
    /// Geometric growth series, strictly increasing, in bytes.  The
    /// retained-growth engine's cursor walks this table.
    pub growth_series: Vec<usize>,
}

impl Config {
    #[ensures(ret.is_ok() -> is_power_of_two(ret.as_ref().unwrap().page_size))]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        page_size: usize,
        lg_extent_max_active_fit: u32,
        retain: bool,
        oversize_threshold: usize,
        large_min_class: usize,
        decay_ms_dirty: i64,
        decay_ms_muzzy: i64,
        maps_coalesce: bool,
        growth_series: Vec<usize>,
    ) -> Result<Config, PacError> {
        if !is_power_of_two(page_size) {
            return Err(PacError::InvalidConfig("page_size must be a power of two"));
        }
        if growth_series.is_empty() {
            return Err(PacError::InvalidConfig(
                "growth_series must have at least one entry",
            ));
        }
        if growth_series.windows(2).any(|w| w[0] >= w[1]) {
            return Err(PacError::InvalidConfig(
                "growth_series must be strictly increasing",
            ));
        }
        if growth_series.iter().any(|&s| s % page_size != 0) {
            return Err(PacError::InvalidConfig(
                "growth_series entries must be page-size multiples",
            ));
        }
        Ok(Config {
            page_size,
            lg_extent_max_active_fit,
            retain,
            oversize_threshold,
            large_min_class,
            decay_ms_dirty,
            decay_ms_muzzy,
            maps_coalesce,
            growth_series,
        })
    }

    /// Mirrors jemalloc's documented defaults: an 8 MiB oversize
    /// threshold, a 14 KiB large-class floor, retained growth enabled,
    /// a cap of 6 doublings of over-fit, and a four-step growth series
    /// from 1 MiB to 8 MiB.
    ///
    /// Under `test_only_small_constants` the growth series is scaled
    /// down to page-size multiples instead of megabytes, so property
    /// tests can exhaust it in a handful of iterations rather than
    /// needing gigabyte-scale requests.
    pub fn default_for_page_size(page_size: usize) -> Config {
        Config::new(
            page_size,
            6,
            true,
            8 << 20,
            14 * page_size,
            10_000,
            10_000,
            true,
            default_growth_series(page_size),
        )
        .expect("built-in defaults are always valid")
    }

    /// `true` when decay is force-enabled on both the dirty and muzzy
    /// caches (both decay periods are not `-1`).  Mirrors
    /// `extent_may_force_decay`.
    pub fn may_force_decay(&self) -> bool {
        self.decay_ms_dirty != -1 && self.decay_ms_muzzy != -1
    }
}

//! The page-granularity extent management core of a general-purpose
//! allocator.
//!
//! `Pac` (page allocator core) is the single entry point: it owns the
//! three lifecycle-state caches (dirty, muzzy, retained), the
//! retained-growth engine, the descriptor pool, and the boundary
//! index, and exposes `alloc`/`dalloc`/`evict_one`/`evict_all` as the
//! public surface. Everything else in this crate is a component `Pac`
//! assembles: `Edata`/`EdataHandle` (the descriptor), `Hooks` (the OS
//! boundary), `Emap` (the address-to-descriptor index), `Eset`/`Ecache`
//! (the per-state extent sets), `split_merge` (the only place a
//! descriptor's boundary moves), `recycle`/`grow`/`record`/`dalloc`
//! (the four operations that move extents between states), and
//! `Config`/`Stats`/`PacError` (configuration, counters, and typed
//! failures).
mod config;
mod dalloc;
mod debug_checks;
mod ecache;
mod edata;
mod edata_cache;
mod emap;
mod error;
mod eset;
mod grow;
mod hooks;
mod pac;
mod record;
mod recycle;
mod split_merge;
mod stats;

pub use config::Config;
pub use edata::{Edata, EdataHandle, ExtentState, Pai};
pub use edata_cache::{BoxEdataCache, EdataCache};
pub use error::PacError;
pub use hooks::{Hooks, SystemHooks};
pub use pac::Pac;
pub use stats::Stats;

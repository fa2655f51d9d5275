/// Thresholds of the quick abort policy.
///
/// All sizes are in KiB and signed: a negative `min_kb` disables quick
/// abort, so an abandoned fetch always finishes once it got its reply head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuickAbortConfig {
    /// Keep fetching if less than this much is left.
    pub min_kb: i64,
    /// Abort if more than this much is left.
    pub max_kb: i64,
    /// Keep fetching once this percentage has arrived.
    pub pct: i64,
}

impl Default for QuickAbortConfig {
    fn default() -> Self {
        QuickAbortConfig {
            min_kb: 16,
            max_kb: 16,
            pct: 95,
        }
    }
}

/// Store configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct Config {
    /// Largest reply head accepted, terminating empty line included.
    pub max_reply_header_size: usize,
    /// Let disk readers copy what they read into memory.
    pub memory_cache_disk: bool,
    /// Largest object copied from disk into memory.
    pub max_in_mem_obj_size: u64,
    /// Limit on open swap-in files, or 0 for no limit.
    pub max_open_disk_files: usize,
    /// How far the producer may run ahead of the slowest memory reader.
    pub read_ahead_gap: u64,
    /// Negative means range requests want the whole object.
    pub range_offset_limit: i64,
    pub quick_abort: QuickAbortConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_reply_header_size: 64 * 1024,
            memory_cache_disk: true,
            max_in_mem_obj_size: 512 * 1024,
            max_open_disk_files: 0,
            read_ahead_gap: 16 * 1024,
            range_offset_limit: 0,
            quick_abort: QuickAbortConfig::default(),
        }
    }
}

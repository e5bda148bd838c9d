use super::next_prime;

/// Early lock release mode (spec §4.5). `Clv` is documented in the original
/// as "controlled lock violation" but implemented identically to `Sx`
/// (spec §9 Open Questions) — we keep that equivalence rather than invent
/// new semantics for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElrMode {
    None,
    S,
    Sx,
    Clv,
}

impl ElrMode {
    /// `Clv` collapses onto `Sx`'s behavior everywhere it is consulted.
    pub fn releases_all_early(self) -> bool {
        matches!(self, ElrMode::Sx | ElrMode::Clv)
    }

    pub fn releases_read_early(self) -> bool {
        matches!(self, ElrMode::S | ElrMode::Sx | ElrMode::Clv)
    }
}

/// Every environment/configuration knob from spec §6.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub buffer_pool_pages: usize,
    pub page_writer_count: usize,
    pub dirty_threshold: usize,
    pub log_dir: std::path::PathBuf,
    pub max_openlog: usize,
    pub okvl_partitions: u8,
    pub okvl_prefix_len: usize,
    pub okvl_uniquefier_len: usize,
    pub elr_mode: ElrMode,
    pub lock_table_size: usize,
    pub fake_disk_latency_us: u64,
    /// Log partition file size in bytes.
    pub log_partition_size: u64,
    /// Page size in bytes (spec §3: default 8 KiB).
    pub page_size: usize,
    /// Number of generations the GC object-pool forest keeps alive.
    pub gc_generations: usize,
    /// Objects per GC segment.
    pub gc_segment_size: usize,
    /// Segments per GC generation.
    pub gc_segments_per_generation: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let lock_table_size = next_prime(1 << 16);
        EngineConfig {
            buffer_pool_pages: 65_536,
            page_writer_count: 4,
            dirty_threshold: 1_000,
            log_dir: std::path::PathBuf::from("./log"),
            max_openlog: 8,
            okvl_partitions: 4,
            okvl_prefix_len: 5,
            okvl_uniquefier_len: 1,
            elr_mode: ElrMode::Sx,
            lock_table_size,
            fake_disk_latency_us: 0,
            log_partition_size: 1 << 30,
            page_size: 8 * 1024,
            gc_generations: 64,
            gc_segment_size: 1 << 16,
            gc_segments_per_generation: 64,
        }
    }
}

impl EngineConfig {
    pub fn lock_table_size_rounded(requested: usize) -> usize {
        next_prime(requested)
    }
}

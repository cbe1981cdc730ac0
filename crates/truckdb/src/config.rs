//! Tunable capacities, thresholds, and timers. There is no external
//! config-file format: this is an embedded library, not a server, so every
//! tunable is a plain struct field with a documented default, set by the
//! embedding application at construction time.

use std::time::Duration;

/// Per-truck tunables.
#[derive(Debug, Clone)]
pub struct TruckConfig {
    /// Capacity of the tag value cache.
    pub tag_lru_capacity: usize,
    /// Flush the write buffer once it holds this many entries.
    pub flush_count_threshold: usize,
    /// Flush the write buffer after this much time since the oldest
    /// unflushed entry, if the count threshold hasn't been hit first.
    pub flush_time_threshold: Duration,
    /// Trigger a background compaction once this many mutations have
    /// accumulated since the last compaction.
    pub compact_threshold: u64,
    /// Maximum accepted length for a box id or tag during recovery; longer
    /// values are treated as corruption.
    pub max_id_len: u32,
}

impl Default for TruckConfig {
    fn default() -> Self {
        Self {
            tag_lru_capacity: 10_000,
            flush_count_threshold: 100,
            flush_time_threshold: Duration::from_millis(500),
            compact_threshold: 500,
            max_id_len: crate::record::MAX_ID_LEN,
        }
    }
}

/// Registry-wide tunables.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Directory under which every truck's `.dat`/`.idx` files live.
    pub root_path: std::path::PathBuf,
    /// Maximum number of simultaneously live `TruckWorker`s.
    pub max_active_trucks: usize,
    /// Capacity of the Registry-level global value cache.
    pub global_lru_capacity: usize,
    /// Capacity of the change bus's per-subscriber buffer.
    pub change_bus_buffer: usize,
    /// How long a request/response command may wait before timing out.
    pub request_timeout: Duration,
    pub truck: TruckConfig,
}

impl RegistryConfig {
    pub fn new(root_path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            root_path: root_path.into(),
            ..Self::default_with_empty_root()
        }
    }

    fn default_with_empty_root() -> Self {
        Self {
            root_path: std::path::PathBuf::new(),
            max_active_trucks: 50,
            global_lru_capacity: 50_000,
            change_bus_buffer: 1024,
            request_timeout: Duration::from_secs(30),
            truck: TruckConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truck_config_defaults_match_spec() {
        let cfg = TruckConfig::default();
        assert_eq!(cfg.tag_lru_capacity, 10_000);
        assert_eq!(cfg.flush_count_threshold, 100);
        assert_eq!(cfg.flush_time_threshold, Duration::from_millis(500));
        assert_eq!(cfg.compact_threshold, 500);
    }

    #[test]
    fn registry_config_defaults_match_spec() {
        let cfg = RegistryConfig::new("/tmp/truckdb");
        assert_eq!(cfg.max_active_trucks, 50);
        assert_eq!(cfg.global_lru_capacity, 50_000);
        assert_eq!(cfg.request_timeout, Duration::from_secs(30));
        assert_eq!(cfg.root_path, std::path::PathBuf::from("/tmp/truckdb"));
    }
}

// SPDX-FileCopyrightText: 2025 drmsurf contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::types::Tiling;

/// Per-device tunables, populated from the config INI.
#[derive(Debug, Clone)]
pub struct Settings {
    // Device
    /// Upper bound on BOs referenced by submitted-but-unretired batches.
    pub max_in_flight_bos: usize,
    /// How long `throttle` waits on a single busy BO before giving up.
    pub throttle_timeout_ms: u64,
    /// Overrides the chip-derived default tiling when set.
    pub forced_tiling: Option<Tiling>,

    // Caches
    /// Byte budget of the snapshot cache.
    pub snapshot_cache_max_size: usize,
    /// Glyph atlas dimensions in pixels.
    pub glyph_cache_width: u32,
    pub glyph_cache_height: u32,
    /// Maximum number of freed BOs retained per size bucket.
    pub bo_cache_bucket_capacity: usize,

    // Debug
    /// Decode and log every committed batch.
    pub dump_batches: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_in_flight_bos: 1024,
            throttle_timeout_ms: 1000,
            forced_tiling: None,
            snapshot_cache_max_size: 16 * 1024 * 1024,
            glyph_cache_width: 1024,
            glyph_cache_height: 1024,
            bo_cache_bucket_capacity: 16,
            dump_batches: false,
        }
    }
}

/// Parse an INI boolean the way the config loader accepts them.
pub fn parse_bool(value: &str) -> bool {
    let v = value.trim();
    v == "true" || v == "1"
}

// SPDX-FileCopyrightText: 2025 drmsurf contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use ini::Ini;
use log::{debug, info, warn};
use std::path::PathBuf;

use drmsurf_common::settings::{parse_bool, Settings};
use drmsurf_common::Tiling;

const CONFIG_DIR: &str = "drmsurf";
const CONFIG_FILE: &str = "drmsurf.ini";

/// Locate drmsurf.ini under the XDG or home config directory.
pub fn find_config_path() -> Option<PathBuf> {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        let path = PathBuf::from(&xdg).join(CONFIG_DIR).join(CONFIG_FILE);
        if path.exists() {
            return Some(path);
        }
    }

    if let Ok(home) = std::env::var("HOME") {
        let path = PathBuf::from(&home)
            .join(".config")
            .join(CONFIG_DIR)
            .join(CONFIG_FILE);
        if path.exists() {
            return Some(path);
        }
    }

    None
}

/// Load settings from `path`, or from the default location when `None`.
/// Missing or unparsable files leave the defaults in place.
pub fn load_config(path: Option<&PathBuf>) -> Settings {
    let config_path = match path {
        Some(p) => {
            if !p.exists() {
                warn!("Config file not found: {}", p.display());
                return Settings::default();
            }
            p.clone()
        }
        None => match find_config_path() {
            Some(p) => p,
            None => {
                info!("No drmsurf config found, using defaults");
                return Settings::default();
            }
        },
    };

    info!("Loading config from: {}", config_path.display());

    match Ini::load_from_file(&config_path) {
        Ok(conf) => settings_from_ini(&conf),
        Err(e) => {
            warn!("Failed to parse config: {}", e);
            Settings::default()
        }
    }
}

fn parse_or<T: std::str::FromStr>(value: &str, key: &str, default: T) -> T {
    match value.trim().parse() {
        Ok(v) => v,
        Err(_) => {
            warn!("Ignoring invalid {} value {:?}", key, value);
            default
        }
    }
}

pub fn settings_from_ini(conf: &Ini) -> Settings {
    let mut settings = Settings::default();

    // [Device]
    if let Some(section) = conf.section(Some("Device")) {
        if let Some(v) = section.get("max_in_flight_bos") {
            settings.max_in_flight_bos = parse_or(v, "max_in_flight_bos", settings.max_in_flight_bos);
        }
        if let Some(v) = section.get("throttle_timeout_ms") {
            settings.throttle_timeout_ms = parse_or(v, "throttle_timeout_ms", settings.throttle_timeout_ms);
        }
        if let Some(v) = section.get("tiling") {
            settings.forced_tiling = match v.trim() {
                "" | "auto" => None,
                other => Some(Tiling::from_str_or_default(other)),
            };
            debug!("Forced tiling: {:?}", settings.forced_tiling);
        }
    }

    // [Caches]
    if let Some(section) = conf.section(Some("Caches")) {
        if let Some(v) = section.get("snapshot_cache_max_size") {
            settings.snapshot_cache_max_size =
                parse_or(v, "snapshot_cache_max_size", settings.snapshot_cache_max_size);
        }
        if let Some(v) = section.get("glyph_cache_width") {
            settings.glyph_cache_width = parse_or(v, "glyph_cache_width", settings.glyph_cache_width);
        }
        if let Some(v) = section.get("glyph_cache_height") {
            settings.glyph_cache_height = parse_or(v, "glyph_cache_height", settings.glyph_cache_height);
        }
        if let Some(v) = section.get("bo_cache_bucket_capacity") {
            settings.bo_cache_bucket_capacity =
                parse_or(v, "bo_cache_bucket_capacity", settings.bo_cache_bucket_capacity);
        }
    }

    // [Debug]
    if let Some(section) = conf.section(Some("Debug")) {
        if let Some(v) = section.get("dump_batches") {
            settings.dump_batches = parse_bool(v);
        }
    }

    settings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sections_override_defaults() {
        let conf = Ini::load_from_str(
            "[Device]\nmax_in_flight_bos = 64\ntiling = x\n\
             [Caches]\nglyph_cache_width = 512\nsnapshot_cache_max_size = 4096\n\
             [Debug]\ndump_batches = true\n",
        )
        .unwrap();
        let s = settings_from_ini(&conf);
        assert_eq!(s.max_in_flight_bos, 64);
        assert_eq!(s.forced_tiling, Some(Tiling::X));
        assert_eq!(s.glyph_cache_width, 512);
        assert_eq!(s.glyph_cache_height, Settings::default().glyph_cache_height);
        assert_eq!(s.snapshot_cache_max_size, 4096);
        assert!(s.dump_batches);
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let conf = Ini::load_from_str("[Device]\nmax_in_flight_bos = lots\ntiling = auto\n").unwrap();
        let s = settings_from_ini(&conf);
        assert_eq!(s.max_in_flight_bos, Settings::default().max_in_flight_bos);
        assert!(s.forced_tiling.is_none());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let path = PathBuf::from("/nonexistent/drmsurf.ini");
        let s = load_config(Some(&path));
        assert_eq!(s.bo_cache_bucket_capacity, Settings::default().bo_cache_bucket_capacity);
    }
}

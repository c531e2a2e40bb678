// SPDX-FileCopyrightText: 2025 drmsurf contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Rendered gradient ramps.
//!
//! A gradient is drawn by sampling a one-row ARGB32 texture holding its
//! color ramp. The last [`GRADIENT_CACHE_SIZE`] ramps are kept in a ring and
//! found again by comparing patterns structurally.

use drmsurf_common::{Format, Tiling};

use crate::bo::{BoRef, BoUsage};
use crate::bo_cache::BoCache;
use crate::error::Result;

pub const GRADIENT_CACHE_SIZE: usize = 16;

/// Texels in a rendered ramp.
pub const GRADIENT_RAMP_WIDTH: u32 = 512;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradientStop {
    pub offset: f64,
    /// Non-premultiplied red, green, blue, alpha in `[0, 1]`.
    pub color: [f64; 4],
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GradientGeometry {
    Linear {
        p0: (f64, f64),
        p1: (f64, f64),
    },
    Radial {
        c0: (f64, f64),
        r0: f64,
        c1: (f64, f64),
        r1: f64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Extend {
    None,
    #[default]
    Pad,
    Repeat,
    Reflect,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GradientPattern {
    pub geometry: GradientGeometry,
    pub extend: Extend,
    pub stops: Vec<GradientStop>,
}

/// A ramp uploaded to the GPU.
#[derive(Debug, Clone)]
pub struct GradientRamp {
    pub bo: BoRef,
    pub width: u32,
    pub format: Format,
}

struct GradientEntry {
    pattern: GradientPattern,
    ramp: GradientRamp,
}

#[derive(Default)]
pub struct GradientCache {
    entries: Vec<GradientEntry>,
    next: usize,
    hits: u64,
    misses: u64,
}

impl GradientCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(hits, misses)` so far.
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }

    pub fn lookup(&self, pattern: &GradientPattern) -> Option<&GradientRamp> {
        self.entries
            .iter()
            .find(|e| e.pattern == *pattern)
            .map(|e| &e.ramp)
    }

    /// Cache a ramp, replacing the oldest entry once the ring is full.
    pub fn insert(&mut self, pattern: GradientPattern, ramp: GradientRamp) {
        let entry = GradientEntry { pattern, ramp };
        if self.entries.len() < GRADIENT_CACHE_SIZE {
            self.entries.push(entry);
        } else {
            self.entries[self.next] = entry;
            self.next = (self.next + 1) % GRADIENT_CACHE_SIZE;
        }
    }

    pub fn get_or_render(&mut self, cache: &mut BoCache, pattern: &GradientPattern) -> Result<GradientRamp> {
        if let Some(ramp) = self.lookup(pattern) {
            let ramp = ramp.clone();
            self.hits += 1;
            return Ok(ramp);
        }
        self.misses += 1;

        let pixels = render_ramp(&pattern.stops, GRADIENT_RAMP_WIDTH);
        let bo = cache.create(pixels.len() as u64, BoUsage::Texture, Tiling::None, 0)?;
        bo.write(0, &pixels)?;
        let ramp = GradientRamp {
            bo,
            width: GRADIENT_RAMP_WIDTH,
            format: Format::Argb32,
        };
        log::trace!("gradient_cache: rendered {} stops", pattern.stops.len());
        self.insert(pattern.clone(), ramp.clone());
        Ok(ramp)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.next = 0;
    }
}

/// Interpolated color at `t`, clamped to the first and last stop.
fn color_at(stops: &[GradientStop], t: f64) -> [f64; 4] {
    let (Some(first), Some(last)) = (stops.first(), stops.last()) else {
        return [0.0; 4];
    };
    if t <= first.offset {
        return first.color;
    }
    if t >= last.offset {
        return last.color;
    }
    for pair in stops.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        if t <= b.offset {
            let span = b.offset - a.offset;
            if span <= 0.0 {
                return b.color;
            }
            let f = (t - a.offset) / span;
            let mut c = [0.0; 4];
            for (i, out) in c.iter_mut().enumerate() {
                *out = a.color[i] + (b.color[i] - a.color[i]) * f;
            }
            return c;
        }
    }
    last.color
}

/// Render `width` premultiplied ARGB32 texels sampling the ramp at texel
/// centers.
pub fn render_ramp(stops: &[GradientStop], width: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(width as usize * 4);
    for i in 0..width {
        let t = (i as f64 + 0.5) / width as f64;
        let [r, g, b, a] = color_at(stops, t);
        let a = a.clamp(0.0, 1.0);
        let channel = |v: f64| ((v.clamp(0.0, 1.0) * a) * 255.0 + 0.5) as u32;
        let pixel = ((a * 255.0 + 0.5) as u32) << 24 | channel(r) << 16 | channel(g) << 8 | channel(b);
        out.extend_from_slice(&pixel.to_ne_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use drmsurf_kernel::SoftGem;
    use std::sync::Arc;

    fn linear(stops: Vec<GradientStop>) -> GradientPattern {
        GradientPattern {
            geometry: GradientGeometry::Linear {
                p0: (0.0, 0.0),
                p1: (100.0, 0.0),
            },
            extend: Extend::Pad,
            stops,
        }
    }

    fn stop(offset: f64, color: [f64; 4]) -> GradientStop {
        GradientStop { offset, color }
    }

    fn texel(pixels: &[u8], i: usize) -> u32 {
        u32::from_ne_bytes([pixels[i * 4], pixels[i * 4 + 1], pixels[i * 4 + 2], pixels[i * 4 + 3]])
    }

    #[test]
    fn test_ramp_endpoints() {
        let stops = [stop(0.0, [1.0, 0.0, 0.0, 1.0]), stop(1.0, [0.0, 0.0, 1.0, 1.0])];
        let px = render_ramp(&stops, 4);
        assert_eq!(px.len(), 16);
        // Texel centers at 1/8 and 7/8.
        assert_eq!(texel(&px, 0), 0xFFDF_0020);
        assert_eq!(texel(&px, 3), 0xFF20_00DF);
    }

    #[test]
    fn test_ramp_premultiplies() {
        let stops = [stop(0.0, [1.0, 1.0, 1.0, 0.5])];
        let px = render_ramp(&stops, 2);
        assert_eq!(texel(&px, 0), 0x8080_8080);
        assert_eq!(render_ramp(&[], 1), vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_cache_hit_shares_bo() {
        let gem = Arc::new(SoftGem::new());
        let mut bos = BoCache::new(gem, 4);
        let mut cache = GradientCache::new();
        let pattern = linear(vec![stop(0.0, [0.0; 4]), stop(1.0, [1.0; 4])]);
        let a = cache.get_or_render(&mut bos, &pattern).unwrap();
        let b = cache.get_or_render(&mut bos, &pattern.clone()).unwrap();
        assert!(Arc::ptr_eq(&a.bo, &b.bo));
        assert_eq!(cache.stats(), (1, 1));
    }

    #[test]
    fn test_ring_replaces_oldest() {
        let gem = Arc::new(SoftGem::new());
        let mut bos = BoCache::new(gem, 4);
        let mut cache = GradientCache::new();
        let patterns: Vec<_> = (0..=GRADIENT_CACHE_SIZE)
            .map(|i| linear(vec![stop(0.0, [i as f64 / 32.0, 0.0, 0.0, 1.0])]))
            .collect();
        for p in &patterns {
            cache.get_or_render(&mut bos, p).unwrap();
        }
        assert_eq!(cache.len(), GRADIENT_CACHE_SIZE);
        assert!(cache.lookup(&patterns[0]).is_none());
        assert!(cache.lookup(&patterns[1]).is_some());
        assert!(cache.lookup(&patterns[GRADIENT_CACHE_SIZE]).is_some());
    }
}

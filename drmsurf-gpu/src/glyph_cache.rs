// SPDX-FileCopyrightText: 2025 drmsurf contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Glyph atlas.
//!
//! Rasterized glyphs are packed into one of two textures, an A8 atlas for
//! coverage masks and an ARGB32 atlas for color glyphs. Each atlas is
//! managed by an [`RTree`]. A glyph used by the batch under construction is
//! pinned with that batch's epoch and survives until the device reports the
//! epoch retired.

use std::collections::HashMap;

use drmsurf_common::{Format, RectInt, Tiling};

use crate::bo::{BoRef, BoUsage};
use crate::bo_cache::BoCache;
use crate::commands::texcoord_2d_16;
use crate::error::Result;
use crate::image::ImageSurface;
use crate::rtree::{NodeId, RTree};

/// Leftover strips narrower than this are not split off.
pub const GLYPH_CACHE_MIN_SIZE: u32 = 4;

/// Glyphs larger than this in either direction are never cached.
pub const GLYPH_CACHE_MAX_SIZE: u32 = 128;

/// Identifies a glyph of a scaled font.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlyphKey {
    pub font: u64,
    pub glyph: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AtlasKind {
    Alpha,
    Color,
}

impl AtlasKind {
    pub fn format(self) -> Format {
        match self {
            Self::Alpha => Format::A8,
            Self::Color => Format::Argb32,
        }
    }

    fn index(self) -> usize {
        match self {
            Self::Alpha => 0,
            Self::Color => 1,
        }
    }
}

/// Where a cached glyph lives.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlyphEntry {
    pub atlas: AtlasKind,
    pub node: NodeId,
    pub rect: RectInt,
    /// Packed half-float texture coordinates of the bottom-right,
    /// bottom-left and top-left corners, in `RECTLIST` vertex order.
    pub texcoords: [u32; 3],
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GlyphStatus {
    Cached(GlyphEntry),
    /// The glyph cannot go through the atlas; draw it some other way.
    Fallback,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GlyphCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub fallbacks: u64,
}

struct Atlas {
    kind: AtlasKind,
    tree: RTree<GlyphKey>,
    bo: Option<BoRef>,
    stride: u32,
}

impl Atlas {
    fn new(kind: AtlasKind, width: u32, height: u32) -> Self {
        let stride = kind.format().stride_for_width(width).unwrap_or(width * 4);
        Self {
            kind,
            tree: RTree::new(width, height, GLYPH_CACHE_MIN_SIZE),
            bo: None,
            stride,
        }
    }

    fn bo(&mut self, cache: &mut BoCache) -> Result<BoRef> {
        if let Some(bo) = &self.bo {
            return Ok(BoRef::clone(bo));
        }
        let size = self.stride as u64 * self.tree.height() as u64;
        let bo = cache.create(size, BoUsage::Texture, Tiling::None, 0)?;
        log::debug!(
            "glyph_cache: created {:?} atlas {}x{} (handle {})",
            self.kind,
            self.tree.width(),
            self.tree.height(),
            bo.handle()
        );
        self.bo = Some(BoRef::clone(&bo));
        Ok(bo)
    }
}

pub struct GlyphCache {
    atlases: [Atlas; 2],
    entries: HashMap<GlyphKey, GlyphEntry>,
    stats: GlyphCacheStats,
}

impl GlyphCache {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            atlases: [
                Atlas::new(AtlasKind::Alpha, width, height),
                Atlas::new(AtlasKind::Color, width, height),
            ],
            entries: HashMap::new(),
            stats: GlyphCacheStats::default(),
        }
    }

    pub fn stats(&self) -> GlyphCacheStats {
        self.stats
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &GlyphKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Texture backing an atlas, once something has been uploaded to it.
    pub fn atlas_bo(&self, kind: AtlasKind) -> Option<&BoRef> {
        self.atlases[kind.index()].bo.as_ref()
    }

    pub fn atlas_stride(&self, kind: AtlasKind) -> u32 {
        self.atlases[kind.index()].stride
    }

    pub fn is_pinned(&self, key: &GlyphKey) -> bool {
        self.entries
            .get(key)
            .is_some_and(|e| self.atlases[e.atlas.index()].tree.is_pinned(e.node))
    }

    /// Look up a glyph, rasterizing and uploading it on a miss.
    ///
    /// The returned glyph is pinned until batch `epoch` retires.
    pub fn get_glyph<F>(&mut self, cache: &mut BoCache, key: GlyphKey, epoch: u64, rasterize: F) -> Result<GlyphStatus>
    where
        F: FnOnce() -> Result<ImageSurface>,
    {
        if let Some(entry) = self.entries.get(&key).copied() {
            let tree = &mut self.atlases[entry.atlas.index()].tree;
            tree.pin(entry.node, epoch);
            tree.touch(entry.node);
            self.stats.hits += 1;
            return Ok(GlyphStatus::Cached(entry));
        }
        self.stats.misses += 1;

        let image = rasterize()?;
        let Some(image) = normalize(image) else {
            self.stats.fallbacks += 1;
            return Ok(GlyphStatus::Fallback);
        };
        let (width, height) = (image.width(), image.height());
        let kind = if image.format() == Format::A8 {
            AtlasKind::Alpha
        } else {
            AtlasKind::Color
        };
        let atlas = &mut self.atlases[kind.index()];
        if width > GLYPH_CACHE_MAX_SIZE
            || height > GLYPH_CACHE_MAX_SIZE
            || width > atlas.tree.width()
            || height > atlas.tree.height()
        {
            self.stats.fallbacks += 1;
            return Ok(GlyphStatus::Fallback);
        }

        let node = match atlas.tree.insert(width, height) {
            Some(node) => node,
            None => match atlas.tree.evict(width, height) {
                Some((node, evicted)) => {
                    self.stats.evictions += evicted.len() as u64;
                    for old in evicted {
                        self.entries.remove(&old);
                    }
                    node
                }
                None => {
                    log::debug!("glyph_cache: {:?} atlas fully pinned", kind);
                    self.stats.fallbacks += 1;
                    return Ok(GlyphStatus::Fallback);
                }
            },
        };

        let Some(rect) = atlas.tree.rect(node) else {
            self.stats.fallbacks += 1;
            return Ok(GlyphStatus::Fallback);
        };
        let upload = atlas.bo(cache).and_then(|bo| {
            bo.put_image(atlas.stride, &image, 0, 0, width, height, rect.x as u32, rect.y as u32)
        });
        if let Err(e) = upload {
            atlas.tree.remove(node);
            return Err(e);
        }

        atlas.tree.set_owner(node, key);
        atlas.tree.pin(node, epoch);
        let entry = GlyphEntry {
            atlas: kind,
            node,
            rect: RectInt::new(rect.x, rect.y, width, height),
            texcoords: texcoords(rect.x as u32, rect.y as u32, width, height, atlas.tree.width(), atlas.tree.height()),
        };
        self.entries.insert(key, entry);
        log::trace!("glyph_cache: cached {:?} at {:?}", key, entry.rect);
        Ok(GlyphStatus::Cached(entry))
    }

    /// Batches up to `retired` have completed.
    pub fn unpin_all(&mut self, retired: u64) {
        for atlas in &mut self.atlases {
            atlas.tree.unpin_all(retired);
        }
    }

    /// Forget every glyph of `font`.
    ///
    /// Pinned regions stay occupied, with their owner cleared, until they are
    /// evicted.
    pub fn remove_font(&mut self, font: u64) {
        let keys: Vec<GlyphKey> = self.entries.keys().filter(|k| k.font == font).copied().collect();
        for key in keys {
            let Some(entry) = self.entries.remove(&key) else { continue };
            let tree = &mut self.atlases[entry.atlas.index()].tree;
            if tree.is_pinned(entry.node) {
                tree.take_owner(entry.node);
            } else {
                tree.remove(entry.node);
            }
        }
    }

    /// Drop every glyph and both atlas textures.
    pub fn clear(&mut self) {
        for atlas in &mut self.atlases {
            atlas.tree.reset();
            atlas.bo = None;
        }
        self.entries.clear();
    }
}

/// Bring a rasterized glyph into an atlas format. A1 masks are expanded to
/// A8; empty glyphs and formats with no atlas yield `None`.
fn normalize(image: ImageSurface) -> Option<ImageSurface> {
    if image.width() == 0 || image.height() == 0 {
        return None;
    }
    match image.format() {
        Format::A8 | Format::Argb32 | Format::Rgb24 => Some(image),
        Format::A1 => expand_a1(&image),
        Format::Rgb16_565 | Format::Rgb30 => None,
    }
}

fn expand_a1(image: &ImageSurface) -> Option<ImageSurface> {
    let mut out = ImageSurface::new(Format::A8, image.width(), image.height()).ok()?;
    let stride = image.stride() as usize;
    for y in 0..image.height() {
        let src = &image.data()[y as usize * stride..];
        for (x, px) in out.row_mut(y).iter_mut().enumerate() {
            if src[x / 8] & (1 << (x % 8)) != 0 {
                *px = 0xff;
            }
        }
    }
    Some(out)
}

fn texcoords(x: u32, y: u32, width: u32, height: u32, atlas_width: u32, atlas_height: u32) -> [u32; 3] {
    let sx = 1.0 / atlas_width as f32;
    let sy = 1.0 / atlas_height as f32;
    let x0 = x as f32 * sx;
    let y0 = y as f32 * sy;
    let x1 = (x + width) as f32 * sx;
    let y1 = (y + height) as f32 * sy;
    [
        texcoord_2d_16(x1, y1),
        texcoord_2d_16(x0, y1),
        texcoord_2d_16(x0, y0),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use drmsurf_kernel::SoftGem;
    use std::sync::Arc;

    fn setup() -> (Arc<SoftGem>, BoCache) {
        let gem = Arc::new(SoftGem::new());
        let cache = BoCache::new(gem.clone(), 4);
        (gem, cache)
    }

    fn mask(size: u32, value: u8) -> Result<ImageSurface> {
        let mut img = ImageSurface::new(Format::A8, size, size)?;
        img.data_mut().fill(value);
        Ok(img)
    }

    fn key(glyph: u32) -> GlyphKey {
        GlyphKey { font: 1, glyph }
    }

    #[test]
    fn test_hit_skips_rasterizer() {
        let (_gem, mut cache) = setup();
        let mut glyphs = GlyphCache::new(64, 64);
        let first = glyphs.get_glyph(&mut cache, key(1), 1, || mask(8, 0x80)).unwrap();
        let second = glyphs
            .get_glyph(&mut cache, key(1), 1, || panic!("rasterized twice"))
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(glyphs.stats().hits, 1);
        assert_eq!(glyphs.stats().misses, 1);
    }

    #[test]
    fn test_upload_lands_in_atlas() {
        let (_gem, mut cache) = setup();
        let mut glyphs = GlyphCache::new(64, 64);
        glyphs.get_glyph(&mut cache, key(1), 1, || mask(8, 0x11)).unwrap();
        let GlyphStatus::Cached(entry) = glyphs.get_glyph(&mut cache, key(2), 1, || mask(8, 0x22)).unwrap() else {
            panic!("expected a cached glyph");
        };
        let bo = glyphs.atlas_bo(AtlasKind::Alpha).unwrap();
        let stride = glyphs.atlas_stride(AtlasKind::Alpha);
        let atlas = bo.get_image(Format::A8, 64, 64, stride).unwrap();
        let row = atlas.row(entry.rect.y as u32);
        assert_eq!(row[entry.rect.x as usize], 0x22);
        assert_eq!(row[entry.rect.x as usize + 7], 0x22);
    }

    #[test]
    fn test_too_large_and_empty_fall_back() {
        let (_gem, mut cache) = setup();
        let mut glyphs = GlyphCache::new(64, 64);
        let big = glyphs.get_glyph(&mut cache, key(1), 1, || mask(65, 1)).unwrap();
        assert_eq!(big, GlyphStatus::Fallback);
        let empty = glyphs
            .get_glyph(&mut cache, key(2), 1, || ImageSurface::new(Format::A8, 0, 0))
            .unwrap();
        assert_eq!(empty, GlyphStatus::Fallback);
        assert_eq!(glyphs.stats().fallbacks, 2);
    }

    #[test]
    fn test_full_pinned_atlas_falls_back() {
        let (_gem, mut cache) = setup();
        let mut glyphs = GlyphCache::new(16, 16);
        let mut rects = Vec::new();
        for g in 0..4 {
            match glyphs.get_glyph(&mut cache, key(g), 5, || mask(8, g as u8 + 1)).unwrap() {
                GlyphStatus::Cached(e) => rects.push(e.rect),
                GlyphStatus::Fallback => panic!("atlas should hold four 8x8 glyphs"),
            }
        }
        let status = glyphs.get_glyph(&mut cache, key(9), 5, || mask(8, 0xff)).unwrap();
        assert_eq!(status, GlyphStatus::Fallback);

        // Nothing already cached was disturbed.
        for g in 0..4 {
            match glyphs.get_glyph(&mut cache, key(g), 5, || panic!("evicted")).unwrap() {
                GlyphStatus::Cached(e) => assert_eq!(e.rect, rects[g as usize]),
                GlyphStatus::Fallback => panic!("lost glyph {}", g),
            }
        }
    }

    #[test]
    fn test_pinned_glyph_survives_until_unpin() {
        let (_gem, mut cache) = setup();
        let mut glyphs = GlyphCache::new(8, 8);
        glyphs.get_glyph(&mut cache, key(1), 3, || mask(8, 1)).unwrap();
        assert!(glyphs.is_pinned(&key(1)));

        // Epoch 3 has not retired: the only node cannot be reused.
        glyphs.unpin_all(2);
        let status = glyphs.get_glyph(&mut cache, key(2), 4, || mask(8, 2)).unwrap();
        assert_eq!(status, GlyphStatus::Fallback);
        assert!(glyphs.contains(&key(1)));

        glyphs.unpin_all(3);
        let status = glyphs.get_glyph(&mut cache, key(2), 4, || mask(8, 2)).unwrap();
        assert!(matches!(status, GlyphStatus::Cached(_)));
        assert!(!glyphs.contains(&key(1)));
        assert_eq!(glyphs.stats().evictions, 1);
    }

    #[test]
    fn test_a1_expanded_to_a8() {
        let mut a1 = ImageSurface::new(Format::A1, 8, 1).unwrap();
        a1.data_mut()[0] = 0b0000_0101;
        let a8 = normalize(a1).unwrap();
        assert_eq!(a8.format(), Format::A8);
        assert_eq!(a8.row(0), &[0xff, 0, 0xff, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_remove_font() {
        let (_gem, mut cache) = setup();
        let mut glyphs = GlyphCache::new(64, 64);
        glyphs.get_glyph(&mut cache, key(1), 1, || mask(8, 1)).unwrap();
        glyphs
            .get_glyph(&mut cache, GlyphKey { font: 2, glyph: 1 }, 1, || mask(8, 1))
            .unwrap();
        glyphs.remove_font(1);
        assert_eq!(glyphs.len(), 1);
        assert!(!glyphs.contains(&key(1)));
    }

    #[test]
    fn test_stale_pinned_region_does_not_evict_recached_glyph() {
        let (_gem, mut cache) = setup();
        let mut glyphs = GlyphCache::new(16, 16);
        glyphs.get_glyph(&mut cache, key(1), 5, || mask(8, 1)).unwrap();
        glyphs.remove_font(1);
        assert!(!glyphs.contains(&key(1)));

        // Cached again while the old region is still pinned.
        let GlyphStatus::Cached(live) = glyphs.get_glyph(&mut cache, key(1), 5, || mask(8, 1)).unwrap() else {
            panic!("expected a cached glyph");
        };
        for g in 2..4 {
            glyphs.get_glyph(&mut cache, key(g), 5, || mask(8, g as u8)).unwrap();
        }
        glyphs.unpin_all(5);

        // The stale region is the least recently used and goes first.
        let other = GlyphKey { font: 2, glyph: 9 };
        let status = glyphs.get_glyph(&mut cache, other, 6, || mask(8, 9)).unwrap();
        assert!(matches!(status, GlyphStatus::Cached(_)));
        assert_eq!(glyphs.stats().evictions, 0);
        match glyphs.get_glyph(&mut cache, key(1), 6, || panic!("rasterized twice")).unwrap() {
            GlyphStatus::Cached(e) => assert_eq!(e.rect, live.rect),
            GlyphStatus::Fallback => panic!("live glyph lost"),
        }
    }

    #[test]
    fn test_texcoords_cover_rect() {
        let tc = texcoords(0, 0, 32, 16, 64, 64);
        assert_eq!(tc[0], texcoord_2d_16(0.5, 0.25));
        assert_eq!(tc[1], texcoord_2d_16(0.0, 0.25));
        assert_eq!(tc[2], 0);
    }
}

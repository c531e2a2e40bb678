// SPDX-FileCopyrightText: 2025 drmsurf contributors
// SPDX-License-Identifier: GPL-3.0-or-later

/// GEM object handle, local to one DRM file descriptor.
pub type GemHandle = u32;

/// Global (flink) name of a GEM object, shareable across processes.
pub type GemName = u32;

/// Offset of an object inside the GPU's graphics translation table.
pub type GttOffset = u64;

/// Page size (4 KiB), the granularity of every GEM allocation.
pub const PAGE_SIZE: usize = 0x1000;

/// Page size as u64 for address math.
pub const PAGE_SIZE_U64: u64 = PAGE_SIZE as u64;

/// Page shift (log2 of PAGE_SIZE).
pub const PAGE_SHIFT: u32 = 12;

/// Page mask for alignment checks.
pub const PAGE_MASK: u64 = PAGE_SIZE_U64 - 1;

/// Invalid handle sentinel.
pub const INVALID_HANDLE: GemHandle = 0;

/// Align a value up to the given alignment.
#[inline]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    let mask = alignment - 1;
    (value + mask) & !mask
}

/// Align a value down to the given alignment.
#[inline]
pub const fn align_down(value: u64, alignment: u64) -> u64 {
    value & !(alignment - 1)
}

/// Check if a value is page-aligned.
#[inline]
pub const fn is_page_aligned(value: u64) -> bool {
    value & PAGE_MASK == 0
}

// ---------------------------------------------------------------------------
// Pixel formats
// ---------------------------------------------------------------------------

/// Pixel format of a surface or image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Argb32,
    Rgb24,
    A8,
    A1,
    Rgb16_565,
    Rgb30,
}

impl Format {
    /// All formats, in cairo enum order.
    pub const ALL: [Format; 6] = [
        Self::Argb32,
        Self::Rgb24,
        Self::A8,
        Self::A1,
        Self::Rgb16_565,
        Self::Rgb30,
    ];

    /// Bits per pixel.
    pub const fn bpp(self) -> u32 {
        match self {
            Self::Argb32 | Self::Rgb24 | Self::Rgb30 => 32,
            Self::Rgb16_565 => 16,
            Self::A8 => 8,
            Self::A1 => 1,
        }
    }

    /// Bytes covered by `width` pixels, without stride padding.
    pub const fn row_bytes(self, width: u32) -> u32 {
        (self.bpp() * width + 7) / 8
    }

    /// Minimum stride for `width` pixels: row bytes rounded up to 4.
    /// Returns `None` when the width overflows the 32-bit stride range.
    pub const fn stride_for_width(self, width: u32) -> Option<u32> {
        let bpp = self.bpp();
        if width as u64 >= (i32::MAX as u64 - 7) / bpp as u64 {
            return None;
        }
        Some((self.row_bytes(width) + 3) & !3)
    }

    /// Content class described by this format.
    pub const fn content(self) -> Content {
        match self {
            Self::Argb32 => Content::ColorAlpha,
            Self::Rgb24 | Self::Rgb30 | Self::Rgb16_565 => Content::Color,
            Self::A8 | Self::A1 => Content::Alpha,
        }
    }
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Argb32 => write!(f, "ARGB32"),
            Self::Rgb24 => write!(f, "RGB24"),
            Self::A8 => write!(f, "A8"),
            Self::A1 => write!(f, "A1"),
            Self::Rgb16_565 => write!(f, "RGB16_565"),
            Self::Rgb30 => write!(f, "RGB30"),
        }
    }
}

/// What a surface stores: color, alpha, or both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Content {
    Color,
    Alpha,
    ColorAlpha,
}

impl Content {
    /// The canonical format for this content.
    pub const fn format(self) -> Format {
        match self {
            Self::Color => Format::Rgb24,
            Self::Alpha => Format::A8,
            Self::ColorAlpha => Format::Argb32,
        }
    }
}

// ---------------------------------------------------------------------------
// Tiling
// ---------------------------------------------------------------------------

/// Memory layout of a buffer object, matching `I915_TILING_*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum Tiling {
    #[default]
    None = 0,
    X = 1,
    Y = 2,
}

impl Tiling {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::None),
            1 => Some(Self::X),
            2 => Some(Self::Y),
            _ => None,
        }
    }

    pub fn from_str_or_default(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "x" | "1" => Self::X,
            "y" | "2" => Self::Y,
            _ => Self::None,
        }
    }

    /// Width in bytes of one tile row (512 for X, 128 for Y).
    pub const fn tile_width(self) -> u32 {
        match self {
            Self::None => 1,
            Self::X => 512,
            Self::Y => 128,
        }
    }

    /// Height in rows of one tile.
    pub const fn tile_height(self) -> u32 {
        match self {
            Self::None => 1,
            Self::X => 8,
            Self::Y => 32,
        }
    }

    /// Whether `stride` is usable with this tiling.
    ///
    /// Tiled strides must be a multiple of the tile width and no larger than
    /// the fence pitch limit (128 KiB).
    pub const fn stride_is_valid(self, stride: u32) -> bool {
        match self {
            Self::None => stride % 4 == 0,
            Self::X | Self::Y => {
                stride != 0 && stride % self.tile_width() == 0 && stride <= 128 * 1024
            }
        }
    }
}

/// Integer rectangle (surface extents, atlas regions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RectInt {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl RectInt {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

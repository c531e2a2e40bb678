// SPDX-FileCopyrightText: 2025 drmsurf contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Intel-class surfaces over the i915 interface.

use drmsurf_common::{Format, Tiling};

use super::{check_format, min_stride, SurfaceBackend, SurfaceLayout};
use crate::bo::{BoUsage, BufferObject};
use crate::error::{Error, Result};

const FORMATS: &[Format] = &[
    Format::Argb32,
    Format::Rgb24,
    Format::Rgb30,
    Format::Rgb16_565,
    Format::A8,
];

/// Texture size restrictions: widths are padded to 4 pixels and heights
/// to 2 rows.
const WIDTH_ALIGN: u32 = 4;
const HEIGHT_ALIGN: u32 = 2;

#[derive(Debug, Default)]
pub struct BasicBackend;

impl BasicBackend {
    pub fn new() -> Self {
        Self
    }
}

impl SurfaceBackend for BasicBackend {
    fn name(&self) -> &str {
        "basic"
    }

    fn formats(&self) -> &'static [Format] {
        FORMATS
    }

    fn layout(&self, format: Format, width: u32, height: u32, preferred: Tiling) -> Result<SurfaceLayout> {
        check_format(self, format)?;
        let padded_width = width.next_multiple_of(WIDTH_ALIGN);
        let rows = height.next_multiple_of(HEIGHT_ALIGN);
        let stride = min_stride(format, padded_width, height)?;
        let tiling = if preferred.stride_is_valid(stride) {
            preferred
        } else {
            Tiling::None
        };
        Ok(SurfaceLayout {
            stride,
            rows,
            tiling,
            usage: BoUsage::Render,
            domain: BoUsage::Render.initial_domain(),
        })
    }

    /// Switch the buffer to X tiling, the only layout the display engine
    /// scans out from.
    fn enable_scan_out(&self, bo: &BufferObject) -> Result<()> {
        let stride = bo.stride();
        let applied = bo.set_tiling(Tiling::X, stride)?;
        if applied != Tiling::X {
            log::warn!("basic: kernel kept handle {} {:?}-tiled", bo.handle(), applied);
            return Err(Error::InvalidTiling {
                tiling: Tiling::X,
                stride,
            });
        }
        log::debug!("basic: handle {} enabled for scan-out", bo.handle());
        Ok(())
    }
}

// SPDX-FileCopyrightText: 2025 drmsurf contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Radeon surfaces: linear, GTT-resident, no scan-out.

use drmsurf_common::{Format, Tiling};
use drmsurf_kernel::abi::Domains;

use super::{check_format, min_stride, SurfaceBackend, SurfaceLayout};
use crate::bo::{BoUsage, BufferObject};
use crate::error::Result;

const FORMATS: &[Format] = &[Format::Argb32, Format::Rgb24, Format::Rgb30, Format::A8];

#[derive(Debug, Default)]
pub struct RadeonBackend;

impl RadeonBackend {
    pub fn new() -> Self {
        Self
    }
}

impl SurfaceBackend for RadeonBackend {
    fn name(&self) -> &str {
        "radeon"
    }

    fn formats(&self) -> &'static [Format] {
        FORMATS
    }

    fn layout(&self, format: Format, width: u32, height: u32, _preferred: Tiling) -> Result<SurfaceLayout> {
        check_format(self, format)?;
        Ok(SurfaceLayout {
            stride: min_stride(format, width, height)?,
            rows: height,
            tiling: Tiling::None,
            usage: BoUsage::Render,
            domain: Domains::GTT,
        })
    }

    /// The CPU view does not outlive a flush.
    fn flush(&self, bo: &BufferObject) -> Result<()> {
        bo.unmap();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bo_cache::BoCache;
    use crate::error::Error;
    use drmsurf_kernel::SoftGem;
    use std::sync::Arc;

    #[test]
    fn test_layout_is_linear_and_unpadded() {
        let layout = RadeonBackend.layout(Format::Argb32, 101, 51, Tiling::Y).unwrap();
        assert_eq!(layout.stride, 404);
        assert_eq!(layout.rows, 51);
        assert_eq!(layout.tiling, Tiling::None);
        assert_eq!(layout.domain, Domains::GTT);
    }

    #[test]
    fn test_rejects_rgb565() {
        assert!(matches!(
            RadeonBackend.layout(Format::Rgb16_565, 8, 8, Tiling::None),
            Err(Error::InvalidFormat(Format::Rgb16_565))
        ));
        assert!(!RadeonBackend.supports_format(Format::A1));
    }

    #[test]
    fn test_flush_unmaps_and_no_scan_out() {
        let gem = Arc::new(SoftGem::new());
        let mut cache = BoCache::new(gem, 4);
        let bo = cache.create(4096, BoUsage::Render, Tiling::None, 0).unwrap();
        bo.map().unwrap();
        RadeonBackend.flush(&bo).unwrap();
        assert!(!bo.is_mapped());
        assert!(matches!(RadeonBackend.enable_scan_out(&bo), Err(Error::Unsupported(_))));
    }
}

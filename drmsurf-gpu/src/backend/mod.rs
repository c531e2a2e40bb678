// SPDX-FileCopyrightText: 2025 drmsurf contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Hardware-family surface backends.
//!
//! A backend decides which formats a family can render to, how a surface
//! of a given size is laid out in its buffer object, and what flushing or
//! scanning out a surface means for that hardware. The device picks one
//! from the PCI vendor id at creation time.

pub mod basic;
pub mod radeon;

use drmsurf_common::{Format, Tiling};
use drmsurf_kernel::abi::Domains;

use crate::bo::{BoUsage, BufferObject};
use crate::chip::{VENDOR_AMD, VENDOR_INTEL};
use crate::error::{Error, Result};

pub use basic::BasicBackend;
pub use radeon::RadeonBackend;

/// Largest width or height of a surface.
pub const MAX_SURFACE_SIZE: u32 = 2048;

/// How a new surface's buffer object is allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceLayout {
    pub stride: u32,
    /// Rows allocated, which may exceed the visible height.
    pub rows: u32,
    pub tiling: Tiling,
    pub usage: BoUsage,
    /// Read domain the object is moved to after allocation.
    pub domain: Domains,
}

impl SurfaceLayout {
    pub fn size(&self) -> u64 {
        self.stride as u64 * self.rows as u64
    }
}

/// Backend type selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    Basic,
    Radeon,
}

impl BackendType {
    pub fn for_vendor(vendor_id: u32) -> Result<Self> {
        match vendor_id {
            VENDOR_INTEL => Ok(Self::Basic),
            VENDOR_AMD => Ok(Self::Radeon),
            other => Err(Error::UnsupportedVendor(other)),
        }
    }

    pub fn create(self) -> Box<dyn SurfaceBackend> {
        match self {
            Self::Basic => Box::new(BasicBackend::new()),
            Self::Radeon => Box::new(RadeonBackend::new()),
        }
    }
}

/// Trait for hardware-family surface backends.
///
/// Flushing and scan-out have defaults so that backends only override the
/// operations their hardware needs.
pub trait SurfaceBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Formats this backend can allocate surfaces in.
    fn formats(&self) -> &'static [Format];

    fn supports_format(&self, format: Format) -> bool {
        self.formats().contains(&format)
    }

    /// Buffer layout for a `width`x`height` surface. `preferred` is the
    /// device's tiling choice; backends fall back to linear when the
    /// resulting stride cannot be tiled.
    fn layout(&self, format: Format, width: u32, height: u32, preferred: Tiling) -> Result<SurfaceLayout>;

    /// Called when a surface is flushed, after its CPU view is dropped.
    fn flush(&self, _bo: &BufferObject) -> Result<()> {
        Ok(())
    }

    /// Prepare a surface's buffer for the display engine.
    fn enable_scan_out(&self, _bo: &BufferObject) -> Result<()> {
        Err(Error::Unsupported("scan-out"))
    }
}

/// Reject formats the backend cannot render to.
pub(crate) fn check_format(backend: &dyn SurfaceBackend, format: Format) -> Result<()> {
    if backend.supports_format(format) {
        Ok(())
    } else {
        Err(Error::InvalidFormat(format))
    }
}

/// Minimum stride for `width` pixels, as a size error on overflow.
pub(crate) fn min_stride(format: Format, width: u32, height: u32) -> Result<u32> {
    format
        .stride_for_width(width)
        .ok_or(Error::InvalidSize { width, height })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_for_vendor() {
        assert_eq!(BackendType::for_vendor(VENDOR_INTEL).unwrap(), BackendType::Basic);
        assert_eq!(BackendType::for_vendor(VENDOR_AMD).unwrap(), BackendType::Radeon);
        assert!(matches!(
            BackendType::for_vendor(0x10de),
            Err(Error::UnsupportedVendor(0x10de))
        ));
        assert_eq!(BackendType::Radeon.create().name(), "radeon");
    }

    #[test]
    fn test_layout_size() {
        let layout = SurfaceLayout {
            stride: 512,
            rows: 10,
            tiling: Tiling::X,
            usage: BoUsage::Render,
            domain: Domains::RENDER,
        };
        assert_eq!(layout.size(), 5120);
    }
}

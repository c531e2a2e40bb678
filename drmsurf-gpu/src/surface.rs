// SPDX-FileCopyrightText: 2025 drmsurf contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! GEM-backed drawing surfaces.
//!
//! A [`DrmSurface`] is a rectangle of pixels in one buffer object, laid out
//! by the device's [`SurfaceBackend`](crate::backend::SurfaceBackend). The
//! drawing layer reads it back through [`DrmSurface::get_image`], writes to
//! it on the CPU through [`DrmSurface::map_to_image`] or
//! [`DrmSurface::put_image`], and renders to it through the device batch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use drmsurf_common::{Content, Format, GemName, RectInt};
use drmsurf_kernel::abi::Domains;
use drmsurf_kernel::Mapping;

use crate::backend::{SurfaceLayout, MAX_SURFACE_SIZE};
use crate::bo::{BoRef, BoUsage};
use crate::device::DeviceRef;
use crate::error::{Error, Result};
use crate::image::ImageSurface;

static NEXT_SURFACE_ID: AtomicU64 = AtomicU64::new(1);

pub struct DrmSurface {
    device: DeviceRef,
    id: u64,
    format: Format,
    width: u32,
    height: u32,
    stride: u32,
    bo: Option<BoRef>,
    /// A CPU view was handed out since the last flush.
    mapped: bool,
    finished: bool,
}

fn check_size(width: u32, height: u32) -> Result<()> {
    if width > MAX_SURFACE_SIZE || height > MAX_SURFACE_SIZE {
        return Err(Error::InvalidSize { width, height });
    }
    Ok(())
}

impl DrmSurface {
    fn new(device: DeviceRef, format: Format, width: u32, height: u32, stride: u32, bo: Option<BoRef>) -> Self {
        Self {
            device,
            id: NEXT_SURFACE_ID.fetch_add(1, Ordering::Relaxed),
            format,
            width,
            height,
            stride,
            bo,
            mapped: false,
            finished: false,
        }
    }

    /// Allocate a new surface. Zero-sized surfaces have no buffer object.
    pub fn create(device: &DeviceRef, format: Format, width: u32, height: u32) -> Result<Self> {
        check_size(width, height)?;
        let backend = device.backend();
        if !backend.supports_format(format) {
            return Err(Error::InvalidFormat(format));
        }
        if width == 0 || height == 0 {
            return Ok(Self::new(DeviceRef::clone(device), format, width, height, 0, None));
        }

        let layout: SurfaceLayout = backend.layout(format, width, height, device.preferred_tiling())?;
        let bo = device.bo_create(layout.size(), layout.usage, layout.tiling, layout.stride)?;
        if layout.domain != layout.usage.initial_domain() {
            bo.set_domain(layout.domain, Domains::empty())?;
        }
        log::debug!(
            "surface: {} {}x{} stride {} {:?} on handle {}",
            format,
            width,
            height,
            layout.stride,
            bo.tiling(),
            bo.handle()
        );
        Ok(Self::new(DeviceRef::clone(device), format, width, height, layout.stride, Some(bo)))
    }

    /// Wrap a buffer object shared under a global name.
    pub fn create_for_name(
        device: &DeviceRef,
        name: GemName,
        format: Format,
        width: u32,
        height: u32,
        stride: u32,
    ) -> Result<Self> {
        check_size(width, height)?;
        if !device.backend().supports_format(format) {
            return Err(Error::InvalidFormat(format));
        }
        let min = format
            .stride_for_width(width)
            .ok_or(Error::InvalidSize { width, height })?;
        if stride < min {
            return Err(Error::InvalidStride { stride, min });
        }
        if width == 0 || height == 0 {
            return Ok(Self::new(DeviceRef::clone(device), format, width, height, stride, None));
        }

        let bo = device.bo_create_for_name(name, stride)?;
        if bo.size() < stride as u64 * height as u64 {
            return Err(Error::InvalidSize { width, height });
        }
        Ok(Self::new(DeviceRef::clone(device), format, width, height, stride, Some(bo)))
    }

    pub fn device(&self) -> &DeviceRef {
        &self.device
    }

    /// Identity used to key cached snapshots.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn content(&self) -> Content {
        self.format.content()
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn bo(&self) -> Option<&BoRef> {
        self.bo.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn get_extents(&self) -> RectInt {
        RectInt::new(0, 0, self.width, self.height)
    }

    fn check_live(&self) -> Result<()> {
        if self.finished {
            Err(Error::SurfaceFinished)
        } else {
            Ok(())
        }
    }

    /// The buffer object, with pending rendering to it submitted and done.
    fn idle_bo(&self) -> Result<Option<&BoRef>> {
        self.check_live()?;
        let Some(bo) = &self.bo else { return Ok(None) };
        self.device.flush_for(bo)?;
        bo.wait(None)?;
        Ok(Some(bo))
    }

    /// Copy the surface into system memory.
    pub fn get_image(&self) -> Result<ImageSurface> {
        match self.idle_bo()? {
            Some(bo) => bo.get_image(self.format, self.width, self.height, self.stride),
            None => ImageSurface::new(self.format, self.width, self.height),
        }
    }

    pub fn acquire_source_image(&self) -> Result<ImageSurface> {
        self.get_image()
    }

    pub fn release_source_image(&self, image: ImageSurface) {
        log::trace!("surface: released {}x{} source image", image.width(), image.height());
    }

    /// A scratch image compatible with this surface.
    pub fn create_similar(&self, content: Content, width: u32, height: u32) -> Result<ImageSurface> {
        ImageSurface::new(content.format(), width, height)
    }

    /// CPU view of the surface. It must be dropped before the surface is
    /// flushed.
    pub fn map_to_image(&mut self) -> Result<MappedImage<'_>> {
        let Some(bo) = self.idle_bo()? else {
            return Err(Error::InvalidSize {
                width: self.width,
                height: self.height,
            });
        };
        let mapping = bo.map()?;
        self.device.snapshots().remove_source(bo.handle());
        self.mapped = true;
        Ok(MappedImage {
            mapping,
            format: self.format,
            width: self.width,
            height: self.height,
            stride: self.stride,
            _surface: std::marker::PhantomData,
        })
    }

    /// Upload a `width`x`height` block of `image` at (`src_x`, `src_y`) to
    /// (`dst_x`, `dst_y`).
    #[allow(clippy::too_many_arguments)]
    pub fn put_image(
        &self,
        image: &ImageSurface,
        src_x: u32,
        src_y: u32,
        width: u32,
        height: u32,
        dst_x: u32,
        dst_y: u32,
    ) -> Result<()> {
        if image.format() != self.format {
            return Err(Error::InvalidFormat(image.format()));
        }
        if dst_x.checked_add(width).map_or(true, |end| end > self.width)
            || dst_y.checked_add(height).map_or(true, |end| end > self.height)
        {
            return Err(Error::InvalidSize { width, height });
        }
        let Some(bo) = self.idle_bo()? else { return Ok(()) };
        bo.put_image(self.stride, image, src_x, src_y, width, height, dst_x, dst_y)?;
        self.device.snapshots().remove_source(bo.handle());
        Ok(())
    }

    /// Make CPU writes visible to the GPU. Nonzero `flags` request nothing.
    pub fn flush(&mut self, flags: u32) -> Result<()> {
        self.check_live()?;
        if flags != 0 {
            return Ok(());
        }
        let Some(bo) = &self.bo else { return Ok(()) };
        if std::mem::take(&mut self.mapped) {
            bo.unmap();
        }
        self.device.backend().flush(bo)
    }

    /// Release the buffer object. Pending batches keep their own reference.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        if let Some(bo) = &self.bo {
            if self.mapped {
                bo.unmap();
            }
        }
        self.device.snapshots().remove(self.id);
        self.bo = None;
        self.mapped = false;
        self.finished = true;
        Ok(())
    }

    /// Publish the surface's buffer object under a global name.
    pub fn flink(&self) -> Result<GemName> {
        self.check_live()?;
        let bo = self.bo.as_ref().ok_or(Error::InvalidSize {
            width: self.width,
            height: self.height,
        })?;
        self.device.bo_flink(bo)
    }

    pub fn enable_scan_out(&self) -> Result<()> {
        self.check_live()?;
        let bo = self.bo.as_ref().ok_or(Error::InvalidSize {
            width: self.width,
            height: self.height,
        })?;
        self.device.backend().enable_scan_out(bo)
    }

    /// A linear copy of the current contents, cached on the device until
    /// the surface is written to or finished.
    pub fn snapshot(&self) -> Result<Option<BoRef>> {
        let Some(bo) = self.idle_bo()? else { return Ok(None) };
        if let Some(copy) = self.device.snapshots().lookup(self.id) {
            return Ok(Some(copy));
        }

        let len = self.stride as usize * self.height as usize;
        let mut bytes = vec![0u8; len];
        bo.read_at(0, &mut bytes)?;
        let copy = self
            .device
            .bo_create(len as u64, BoUsage::Texture, drmsurf_common::Tiling::None, self.stride)?;
        copy.write(0, &bytes)?;
        self.device
            .snapshots()
            .insert(self.id, bo.handle(), BoRef::clone(&copy), len);
        Ok(Some(copy))
    }

    /// Drop cached snapshots after the contents changed behind the
    /// surface's back.
    pub fn invalidate_snapshot(&self) {
        let mut snapshots = self.device.snapshots();
        snapshots.remove(self.id);
        if let Some(bo) = &self.bo {
            snapshots.remove_source(bo.handle());
        }
    }
}

impl Drop for DrmSurface {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.finish();
        }
    }
}

impl std::fmt::Debug for DrmSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrmSurface")
            .field("id", &self.id)
            .field("format", &self.format)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .field("handle", &self.bo.as_ref().map(|bo| bo.handle()))
            .field("finished", &self.finished)
            .finish()
    }
}

/// CPU view of a surface, valid until the surface is next flushed.
pub struct MappedImage<'a> {
    mapping: Arc<Mapping>,
    format: Format,
    width: u32,
    height: u32,
    stride: u32,
    _surface: std::marker::PhantomData<&'a mut DrmSurface>,
}

impl MappedImage<'_> {
    pub fn format(&self) -> Format {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    fn row_offset(&self, y: u32) -> Result<usize> {
        if y >= self.height {
            return Err(Error::InvalidSize {
                width: self.width,
                height: y,
            });
        }
        Ok(y as usize * self.stride as usize)
    }

    pub fn read_row(&self, y: u32, dst: &mut [u8]) -> Result<()> {
        let at = self.row_offset(y)?;
        let len = dst.len().min(self.format.row_bytes(self.width) as usize);
        self.mapping.read(at, &mut dst[..len])?;
        Ok(())
    }

    pub fn write_row(&self, y: u32, src: &[u8]) -> Result<()> {
        let at = self.row_offset(y)?;
        let len = src.len().min(self.format.row_bytes(self.width) as usize);
        self.mapping.write(at, &src[..len])?;
        Ok(())
    }

    /// Fill every pixel of a 32bpp surface with `color`.
    pub fn fill_u32(&self, color: u32) -> Result<()> {
        if self.format.bpp() != 32 {
            return Err(Error::InvalidFormat(self.format));
        }
        let row: Vec<u8> = std::iter::repeat(color.to_ne_bytes())
            .take(self.width as usize)
            .flatten()
            .collect();
        for y in 0..self.height {
            self.write_row(y, &row)?;
        }
        Ok(())
    }

    /// Copy the mapped pixels into an image.
    pub fn to_image(&self) -> Result<ImageSurface> {
        let mut image = ImageSurface::new(self.format, self.width, self.height)?;
        for y in 0..self.height {
            self.read_row(y, image.row_mut(y))?;
        }
        Ok(image)
    }
}

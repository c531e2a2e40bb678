// SPDX-FileCopyrightText: 2025 drmsurf contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Buffer objects.
//!
//! A [`BufferObject`] owns one GEM handle. It is shared as [`BoRef`]
//! (`Arc<BufferObject>`) between surfaces, batches and caches; the handle is
//! closed, or parked in the BO cache, when the last reference goes away.
//! Dropping never takes the device lock: reusable objects are pushed onto a
//! [`ReleaseQueue`] that the cache drains under the lock later.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use drmsurf_common::{Format, GemHandle, GemName, GttOffset, Tiling};
use drmsurf_kernel::abi::{Domains, Madvise};
use drmsurf_kernel::{GemDriver, Mapping};

use crate::error::{Error, Result};
use crate::image::ImageSurface;

pub type BoRef = Arc<BufferObject>;

/// What a buffer is for. Picks the initial GPU domain and whether the
/// buffer may be recycled through the BO cache once released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoUsage {
    Render,
    Texture,
    Vertex,
    Batch,
    /// Handed to the display engine; never recycled.
    Scanout,
}

impl BoUsage {
    pub fn initial_domain(self) -> Domains {
        match self {
            Self::Render | Self::Scanout => Domains::RENDER,
            Self::Texture => Domains::SAMPLER,
            Self::Vertex => Domains::VERTEX,
            Self::Batch => Domains::COMMAND,
        }
    }

    pub fn reusable(self) -> bool {
        self != Self::Scanout
    }
}

/// A released GEM object waiting to be reused.
#[derive(Debug)]
pub(crate) struct FreeBo {
    pub handle: GemHandle,
    pub size: u64,
    pub tiling: Tiling,
    pub stride: u32,
    pub offset: GttOffset,
}

/// Objects dropped since the cache last looked.
#[derive(Default)]
pub(crate) struct ReleaseQueue {
    entries: Mutex<Vec<FreeBo>>,
}

impl ReleaseQueue {
    pub fn push(&self, bo: FreeBo) {
        self.entries.lock().push(bo);
    }

    pub fn drain(&self) -> Vec<FreeBo> {
        std::mem::take(&mut *self.entries.lock())
    }
}

pub struct BufferObject {
    driver: Arc<dyn GemDriver>,
    handle: GemHandle,
    size: u64,
    usage: BoUsage,
    name: AtomicU32,
    layout: Mutex<(Tiling, u32)>,
    offset: AtomicU64,
    mapping: Mutex<Option<Arc<Mapping>>>,
    domains: Mutex<(Domains, Domains)>,
    busy: AtomicBool,
    recycler: Weak<ReleaseQueue>,
}

impl BufferObject {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        driver: Arc<dyn GemDriver>,
        handle: GemHandle,
        size: u64,
        usage: BoUsage,
        tiling: Tiling,
        stride: u32,
        offset: GttOffset,
        recycler: Weak<ReleaseQueue>,
    ) -> Self {
        let domain = usage.initial_domain();
        Self {
            driver,
            handle,
            size,
            usage,
            name: AtomicU32::new(0),
            layout: Mutex::new((tiling, stride)),
            offset: AtomicU64::new(offset),
            mapping: Mutex::new(None),
            domains: Mutex::new((domain, Domains::empty())),
            busy: AtomicBool::new(false),
            recycler,
        }
    }

    /// Wrap a handle opened from a global name. Never recycled.
    pub(crate) fn from_name(
        driver: Arc<dyn GemDriver>,
        handle: GemHandle,
        name: GemName,
        size: u64,
        stride: u32,
    ) -> Self {
        let bo = Self::new(
            driver,
            handle,
            size,
            BoUsage::Render,
            Tiling::None,
            stride,
            0,
            Weak::new(),
        );
        bo.name.store(name, Ordering::Release);
        bo
    }

    pub fn handle(&self) -> GemHandle {
        self.handle
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn usage(&self) -> BoUsage {
        self.usage
    }

    pub fn tiling(&self) -> Tiling {
        self.layout.lock().0
    }

    pub fn stride(&self) -> u32 {
        self.layout.lock().1
    }

    /// Global name, if the object has been flinked or was opened by name.
    pub fn name(&self) -> Option<GemName> {
        match self.name.load(Ordering::Acquire) {
            0 => None,
            name => Some(name),
        }
    }

    /// GTT offset the kernel reported at the last submission.
    pub fn presumed_offset(&self) -> GttOffset {
        self.offset.load(Ordering::Acquire)
    }

    pub(crate) fn set_presumed_offset(&self, offset: GttOffset) {
        self.offset.store(offset, Ordering::Release);
    }

    pub fn domains(&self) -> (Domains, Domains) {
        *self.domains.lock()
    }

    pub(crate) fn add_batch_domains(&self, read: Domains, write: Domains) {
        let mut d = self.domains.lock();
        d.0 |= read;
        d.1 |= write;
    }

    /// Referenced by a submitted batch that has not been seen to retire.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub(crate) fn mark_busy(&self) {
        self.busy.store(true, Ordering::Release);
    }

    /// Ask the kernel whether the GPU is done with this object.
    pub fn is_inactive(&self) -> bool {
        if !self.is_busy() {
            return true;
        }
        match self.driver.busy(self.handle) {
            Ok(true) => false,
            Ok(false) => {
                self.busy.store(false, Ordering::Release);
                true
            }
            Err(e) => {
                log::warn!("bo: busy query on handle {} failed: {}", self.handle, e);
                self.busy.store(false, Ordering::Release);
                true
            }
        }
    }

    /// Block until the GPU is done with this object.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        if !self.is_busy() {
            return Ok(());
        }
        self.driver.wait(self.handle, timeout)?;
        self.busy.store(false, Ordering::Release);
        Ok(())
    }

    pub fn set_domain(&self, read: Domains, write: Domains) -> Result<()> {
        self.driver.set_domain(self.handle, read, write)?;
        *self.domains.lock() = (read, write);
        if read.intersects(Domains::CPU | Domains::GTT) {
            self.busy.store(false, Ordering::Release);
        }
        Ok(())
    }

    /// Map the object for CPU access.
    ///
    /// Mapping an already mapped object hands back the existing mapping.
    pub fn map(&self) -> Result<Arc<Mapping>> {
        let mut slot = self.mapping.lock();
        if let Some(mapping) = slot.as_ref() {
            log::warn!("bo: handle {} is already mapped", self.handle);
            return Ok(Arc::clone(mapping));
        }
        let mapping = Arc::new(self.driver.mmap(self.handle, self.size)?);
        self.set_domain(Domains::GTT, Domains::GTT)?;
        *slot = Some(Arc::clone(&mapping));
        Ok(mapping)
    }

    /// The current mapping, creating one if needed.
    pub(crate) fn mapping(&self) -> Result<Arc<Mapping>> {
        if let Some(mapping) = self.mapping.lock().as_ref() {
            return Ok(Arc::clone(mapping));
        }
        self.map()
    }

    pub fn is_mapped(&self) -> bool {
        self.mapping.lock().is_some()
    }

    /// Drop this object's mapping. Outstanding `Arc<Mapping>` views stay valid.
    pub fn unmap(&self) {
        self.mapping.lock().take();
    }

    /// Copy out of the object (`pread`).
    pub fn read(&self, offset: u64, dst: &mut [u8]) -> Result<()> {
        self.driver.pread(self.handle, offset, dst)?;
        Ok(())
    }

    /// Copy into the object (`pwrite`).
    pub fn write(&self, offset: u64, src: &[u8]) -> Result<()> {
        self.driver.pwrite(self.handle, offset, src)?;
        Ok(())
    }

    /// Publish the object under a global name. Idempotent.
    pub fn flink(&self) -> Result<GemName> {
        if let Some(name) = self.name() {
            return Ok(name);
        }
        let name = self.driver.flink(self.handle)?;
        self.name.store(name, Ordering::Release);
        Ok(name)
    }

    /// Change the tiling layout. Returns what the kernel applied.
    pub fn set_tiling(&self, tiling: Tiling, stride: u32) -> Result<Tiling> {
        if !tiling.stride_is_valid(stride) {
            return Err(Error::InvalidTiling { tiling, stride });
        }
        let applied = self.driver.set_tiling(self.handle, tiling, stride)?;
        *self.layout.lock() = (applied, stride);
        Ok(applied)
    }

    /// Tiled objects must go through the fenced GTT mapping to be detiled;
    /// linear ones can use pread/pwrite directly.
    pub(crate) fn read_at(&self, offset: u64, dst: &mut [u8]) -> Result<()> {
        if self.tiling() == Tiling::None {
            self.read(offset, dst)
        } else {
            self.mapping()?.read(offset as usize, dst)?;
            Ok(())
        }
    }

    fn write_at(&self, offset: u64, src: &[u8]) -> Result<()> {
        if self.tiling() == Tiling::None {
            self.write(offset, src)
        } else {
            self.mapping()?.write(offset as usize, src)?;
            Ok(())
        }
    }

    /// Read back `height` rows of `format` pixels laid out with `stride`.
    pub fn get_image(&self, format: Format, width: u32, height: u32, stride: u32) -> Result<ImageSurface> {
        let mut image = ImageSurface::new(format, width, height)?;
        if width == 0 || height == 0 {
            return Ok(image);
        }

        if image.stride() == stride {
            let len = stride as usize * height as usize;
            self.read_at(0, &mut image.data_mut()[..len])?;
        } else {
            for y in 0..height {
                self.read_at(y as u64 * stride as u64, image.row_mut(y))?;
            }
        }
        Ok(image)
    }

    /// Upload a `width`x`height` block of `src` at (`src_x`, `src_y`) to
    /// (`dst_x`, `dst_y`) of this object, whose rows are `stride` bytes apart.
    #[allow(clippy::too_many_arguments)]
    pub fn put_image(
        &self,
        stride: u32,
        src: &ImageSurface,
        src_x: u32,
        src_y: u32,
        width: u32,
        height: u32,
        dst_x: u32,
        dst_y: u32,
    ) -> Result<()> {
        let format = src.format();
        if format.bpp() < 8 {
            return Err(Error::InvalidFormat(format));
        }
        if src_x.checked_add(width).map_or(true, |end| end > src.width())
            || src_y.checked_add(height).map_or(true, |end| end > src.height())
        {
            return Err(Error::InvalidSize { width, height });
        }
        let cpp = (format.bpp() / 8) as usize;
        let row = width as usize * cpp;
        let data = src.data();

        if row == stride as usize && row == src.stride() as usize && src_x == 0 && dst_x == 0 {
            let start = src_y as usize * row;
            let offset = dst_y as u64 * stride as u64;
            return self.write_at(offset, &data[start..start + row * height as usize]);
        }

        for y in 0..height as usize {
            let from = (src_y as usize + y) * src.stride() as usize + src_x as usize * cpp;
            let to = (dst_y as u64 + y as u64) * stride as u64 + (dst_x as usize * cpp) as u64;
            self.write_at(to, &data[from..from + row])?;
        }
        Ok(())
    }
}

impl Drop for BufferObject {
    fn drop(&mut self) {
        self.mapping.get_mut().take();

        if self.usage.reusable() && self.name().is_none() {
            if let Some(queue) = self.recycler.upgrade() {
                match self.driver.madvise(self.handle, Madvise::DontNeed) {
                    Ok(_) => {
                        let (tiling, stride) = *self.layout.get_mut();
                        queue.push(FreeBo {
                            handle: self.handle,
                            size: self.size,
                            tiling,
                            stride,
                            offset: *self.offset.get_mut(),
                        });
                        return;
                    }
                    Err(e) => log::warn!("bo: madvise on handle {} failed: {}", self.handle, e),
                }
            }
        }

        log::trace!("bo: close handle {}", self.handle);
        self.driver.close(self.handle);
    }
}

impl std::fmt::Debug for BufferObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (tiling, stride) = *self.layout.lock();
        f.debug_struct("BufferObject")
            .field("handle", &self.handle)
            .field("size", &self.size)
            .field("usage", &self.usage)
            .field("tiling", &tiling)
            .field("stride", &stride)
            .field("name", &self.name())
            .field("busy", &self.is_busy())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drmsurf_kernel::SoftGem;

    fn make(gem: &Arc<SoftGem>, size: u64, usage: BoUsage, queue: &Arc<ReleaseQueue>) -> BoRef {
        let handle = gem.create(size).unwrap();
        let driver: Arc<dyn GemDriver> = gem.clone();
        Arc::new(BufferObject::new(
            driver,
            handle,
            size,
            usage,
            Tiling::None,
            0,
            0,
            Arc::downgrade(queue),
        ))
    }

    #[test]
    fn test_drop_parks_reusable_bo() {
        let gem = Arc::new(SoftGem::new());
        let queue = Arc::new(ReleaseQueue::default());
        let bo = make(&gem, 4096, BoUsage::Render, &queue);
        let handle = bo.handle();
        drop(bo);
        let parked = queue.drain();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].handle, handle);
        assert!(gem.is_purgeable(handle).unwrap());
        assert_eq!(gem.stats().closes, 0);
    }

    #[test]
    fn test_drop_closes_scanout_and_named() {
        let gem = Arc::new(SoftGem::new());
        let queue = Arc::new(ReleaseQueue::default());
        drop(make(&gem, 4096, BoUsage::Scanout, &queue));

        let named = make(&gem, 4096, BoUsage::Render, &queue);
        named.flink().unwrap();
        drop(named);

        assert!(queue.drain().is_empty());
        assert_eq!(gem.stats().closes, 2);
        assert_eq!(gem.live_objects(), 0);
    }

    #[test]
    fn test_map_twice_returns_same_mapping() {
        let gem = Arc::new(SoftGem::new());
        let queue = Arc::new(ReleaseQueue::default());
        let bo = make(&gem, 4096, BoUsage::Render, &queue);
        let a = bo.map().unwrap();
        let b = bo.map().unwrap();
        assert_eq!(a.as_ptr(), b.as_ptr());
        assert!(bo.is_mapped());
        bo.unmap();
        assert!(!bo.is_mapped());
        // Views outlive the unmap.
        a.write(0, &[1]).unwrap();
    }

    #[test]
    fn test_get_image_honors_stride() {
        let gem = Arc::new(SoftGem::new());
        let queue = Arc::new(ReleaseQueue::default());
        // 3 A8 pixels per row, BO rows padded to 16 bytes.
        let bo = make(&gem, 4096, BoUsage::Render, &queue);
        for y in 0..2u8 {
            bo.write(y as u64 * 16, &[y, y + 10, y + 20]).unwrap();
        }
        let img = bo.get_image(Format::A8, 3, 2, 16).unwrap();
        assert_eq!(img.stride(), 4);
        assert_eq!(img.row(0), &[0, 10, 20]);
        assert_eq!(img.row(1), &[1, 11, 21]);
    }

    #[test]
    fn test_put_image_sub_rect() {
        let gem = Arc::new(SoftGem::new());
        let queue = Arc::new(ReleaseQueue::default());
        let bo = make(&gem, 4096, BoUsage::Render, &queue);
        let mut src = ImageSurface::new(Format::Argb32, 4, 4).unwrap();
        src.fill_u32(0xFFAA_BBCC);
        bo.put_image(32, &src, 1, 1, 2, 2, 3, 0).unwrap();

        let img = bo.get_image(Format::Argb32, 8, 2, 32).unwrap();
        assert_eq!(img.pixel_u32(3, 0), Some(0xFFAA_BBCC));
        assert_eq!(img.pixel_u32(4, 1), Some(0xFFAA_BBCC));
        assert_eq!(img.pixel_u32(2, 0), Some(0));
        assert_eq!(img.pixel_u32(5, 0), Some(0));
    }

    #[test]
    fn test_set_tiling_validates_stride() {
        let gem = Arc::new(SoftGem::new());
        let queue = Arc::new(ReleaseQueue::default());
        let bo = make(&gem, 8192, BoUsage::Render, &queue);
        assert!(matches!(
            bo.set_tiling(Tiling::X, 400),
            Err(Error::InvalidTiling { .. })
        ));
        assert_eq!(bo.set_tiling(Tiling::X, 512).unwrap(), Tiling::X);
        assert_eq!(bo.stride(), 512);
    }
}

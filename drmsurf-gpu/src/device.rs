// SPDX-FileCopyrightText: 2025 drmsurf contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Per-GPU device state.
//!
//! A [`Device`] owns the BO cache, the batch under construction, the vertex
//! staging area and the glyph, gradient and snapshot caches, all behind one
//! mutex. Submitted batches are kept in flight until the kernel reports them
//! idle; [`Device::throttle`] is where callers block when too many objects
//! are still held by the GPU.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};

use drmsurf_common::settings::Settings;
use drmsurf_common::{GemName, Tiling};
use drmsurf_kernel::abi::{Domains, VERTEX_BUFFER_SIZE};
use drmsurf_kernel::GemDriver;

use crate::backend::{BackendType, SurfaceBackend};
use crate::batch::{Batch, InFlightBatch};
use crate::bo::{BoRef, BoUsage};
use crate::bo_cache::{BoCache, BoCacheStats};
use crate::chip::ChipInfo;
use crate::commands::{buf_info_color, _3DSTATE_BUF_INFO_CMD};
use crate::error::{Error, Result};
use crate::glyph_cache::{GlyphCache, GlyphCacheStats, GlyphKey, GlyphStatus};
use crate::gradient_cache::{GradientCache, GradientPattern, GradientRamp};
use crate::image::ImageSurface;
use crate::snapshot_cache::SnapshotCache;
use crate::vertex_buffer::{VertexBuffer, RECT_VERTICES, RUN_WORDS};

pub type DeviceRef = Arc<Device>;

/// Dwords and relocations of a color buffer `BUF_INFO`.
const BUF_INFO_WORDS: usize = 3;

/// Identity of the GPU a device is created for.
#[derive(Clone)]
pub struct DeviceDescriptor {
    pub driver: Arc<dyn GemDriver>,
    /// Kernel device number (`st_rdev`) of the DRM node.
    pub device_id: u64,
    /// PCI vendor id.
    pub vendor_id: u32,
    /// PCI device id. Zero asks the driver.
    pub chip_id: u32,
}

impl std::fmt::Debug for DeviceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceDescriptor")
            .field("driver", &self.driver.name())
            .field("device_id", &self.device_id)
            .field("vendor_id", &format_args!("{:#06x}", self.vendor_id))
            .field("chip_id", &format_args!("{:#06x}", self.chip_id))
            .finish()
    }
}

struct DeviceState {
    batch: Batch,
    vertices: VertexBuffer,
    /// Render target bound by the last `BUF_INFO` in the current batch.
    target: Option<BoRef>,
    in_flight: VecDeque<InFlightBatch>,
    in_flight_bos: usize,
    /// Epoch of the batch under construction.
    epoch: u64,
    /// Every batch up to and including this epoch has retired.
    retired: u64,
    glyphs: GlyphCache,
    gradients: GradientCache,
    snapshots: SnapshotCache,
    bo_cache: BoCache,
}

pub struct Device {
    driver: Arc<dyn GemDriver>,
    device_id: u64,
    vendor_id: u32,
    chip: ChipInfo,
    backend: Box<dyn SurfaceBackend>,
    tiling: Tiling,
    settings: Settings,
    finished: AtomicBool,
    state: Mutex<DeviceState>,
}

impl Device {
    /// Create a device for the GPU behind `desc.driver`.
    pub fn create(desc: DeviceDescriptor, settings: Settings) -> Result<DeviceRef> {
        let backend = BackendType::for_vendor(desc.vendor_id)?.create();
        let driver = desc.driver;

        let chip_id = match desc.chip_id {
            0 => driver
                .chip_id()
                .map_err(|e| Error::DeviceInit(format!("chip id query failed: {}", e)))?,
            id => id,
        };
        let chip = ChipInfo::identify(chip_id);
        let aperture = driver
            .aperture()
            .map_err(|e| Error::DeviceInit(format!("aperture query failed: {}", e)))?;
        if aperture.available == 0 {
            return Err(Error::DeviceInit("no GTT space available".into()));
        }
        let gtt_budget = aperture.available / 4 * 3;

        let tiling = settings.forced_tiling.unwrap_or_else(|| chip.default_tiling());

        let mut batch = Batch::new(gtt_budget);
        batch.set_dump(settings.dump_batches);

        log::info!(
            "device: {} backend on {} ({}, chip {:#06x}), aperture {} MiB, tiling {:?}",
            backend.name(),
            driver.name(),
            chip.name(),
            chip_id,
            aperture.size >> 20,
            tiling
        );

        let state = DeviceState {
            batch,
            vertices: VertexBuffer::new(),
            target: None,
            in_flight: VecDeque::new(),
            in_flight_bos: 0,
            epoch: 1,
            retired: 0,
            glyphs: GlyphCache::new(settings.glyph_cache_width, settings.glyph_cache_height),
            gradients: GradientCache::new(),
            snapshots: SnapshotCache::new(settings.snapshot_cache_max_size),
            bo_cache: BoCache::new(Arc::clone(&driver), settings.bo_cache_bucket_capacity),
        };

        Ok(Arc::new(Self {
            driver,
            device_id: desc.device_id,
            vendor_id: desc.vendor_id,
            chip,
            backend,
            tiling,
            settings,
            finished: AtomicBool::new(false),
            state: Mutex::new(state),
        }))
    }

    pub fn driver(&self) -> &Arc<dyn GemDriver> {
        &self.driver
    }

    pub fn fd(&self) -> i32 {
        self.driver.fd()
    }

    pub fn device_id(&self) -> u64 {
        self.device_id
    }

    pub fn vendor_id(&self) -> u32 {
        self.vendor_id
    }

    pub fn chip(&self) -> &ChipInfo {
        &self.chip
    }

    pub fn backend(&self) -> &dyn SurfaceBackend {
        self.backend.as_ref()
    }

    /// Tiling requested for new render targets.
    pub fn preferred_tiling(&self) -> Tiling {
        self.tiling
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    fn check_live(&self) -> Result<()> {
        if self.is_finished() {
            Err(Error::DeviceFinished)
        } else {
            Ok(())
        }
    }

    /// Epoch of the batch currently being built.
    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    /// Buffer objects held by submitted batches that have not retired.
    pub fn in_flight_bos(&self) -> usize {
        self.state.lock().in_flight_bos
    }

    pub fn bo_cache_stats(&self) -> BoCacheStats {
        self.state.lock().bo_cache.stats()
    }

    pub fn glyph_stats(&self) -> GlyphCacheStats {
        self.state.lock().glyphs.stats()
    }

    // -----------------------------------------------------------------------
    // Buffer objects
    // -----------------------------------------------------------------------

    pub fn bo_create(&self, size: u64, usage: BoUsage, tiling: Tiling, stride: u32) -> Result<BoRef> {
        self.check_live()?;
        self.state.lock().bo_cache.create(size, usage, tiling, stride)
    }

    pub fn bo_create_for_name(&self, name: GemName, stride: u32) -> Result<BoRef> {
        self.check_live()?;
        self.state.lock().bo_cache.create_for_name(name, stride)
    }

    /// Publish `bo` under a global name; later opens of it share `bo`.
    pub fn bo_flink(&self, bo: &BoRef) -> Result<GemName> {
        let name = bo.flink()?;
        self.state.lock().bo_cache.register_name(bo);
        Ok(name)
    }

    /// Whether the GPU is done with `bo`. Does not take the device lock.
    pub fn bo_is_inactive(&self, bo: &BoRef) -> bool {
        bo.is_inactive()
    }

    /// Block until the GPU is done with `bo`. Does not take the device lock.
    pub fn bo_wait(&self, bo: &BoRef) -> Result<()> {
        bo.wait(None)
    }

    // -----------------------------------------------------------------------
    // Command submission
    // -----------------------------------------------------------------------

    /// Queue rectangles onto `target`.
    ///
    /// `vertices` holds three vertices of `floats_per_vertex` floats per
    /// rectangle. The batch is committed and the drawing retried whenever
    /// it runs out of room.
    pub fn draw_rectangles(&self, target: &BoRef, floats_per_vertex: u32, vertices: &[f32]) -> Result<()> {
        self.check_live()?;
        let rect_floats = (floats_per_vertex * RECT_VERTICES) as usize;
        if rect_floats == 0 || vertices.len() % rect_floats != 0 {
            return Err(Error::InvalidSize {
                width: vertices.len() as u32,
                height: rect_floats as u32,
            });
        }

        let mut guard = self.state.lock();
        for rect in vertices.chunks_exact(rect_floats) {
            self.add_rectangle(&mut guard, target, floats_per_vertex, rect)?;
        }
        Ok(())
    }

    fn add_rectangle(&self, state: &mut DeviceState, target: &BoRef, floats_per_vertex: u32, rect: &[f32]) -> Result<()> {
        loop {
            let new_target = state.target.as_ref().map(|t| t.handle()) != Some(target.handle());
            if new_target && !state.vertices.is_empty() {
                state.vertices.finish(&mut state.batch, &mut state.bo_cache)?;
            }

            let (mut words, mut relocs) = state.vertices.pending_cost();
            words += RUN_WORDS;
            relocs += 1;
            if new_target {
                words += BUF_INFO_WORDS;
                relocs += 1;
            }
            let mut extra = VERTEX_BUFFER_SIZE as u64;
            if !state.batch.contains(target) {
                extra += target.size();
            }
            if !state.batch.has_space(words, relocs)? || !state.batch.gtt_fits(extra) {
                log::trace!("device: batch full, committing epoch {}", state.epoch);
                self.commit_locked(state)?;
                continue;
            }

            if new_target {
                state.batch.emit(_3DSTATE_BUF_INFO_CMD);
                state.batch.emit(buf_info_color(target.tiling(), target.stride()));
                state
                    .batch
                    .emit_reloc(target, 0, Domains::RENDER, Domains::RENDER)
                    .map_err(|_| Error::PrimitiveTooLarge { words, relocs })?;
                state.target = Some(BoRef::clone(target));
                state.snapshots.remove_source(target.handle());
            }

            state.vertices.start_rectangles(floats_per_vertex);
            if state.vertices.add_rectangle(rect)? {
                return Ok(());
            }
            state.vertices.finish(&mut state.batch, &mut state.bo_cache)?;
        }
    }

    fn commit_locked(&self, state: &mut DeviceState) -> Result<()> {
        let staged = state.vertices.finish(&mut state.batch, &mut state.bo_cache);
        if staged.is_err() {
            state.vertices.reset();
        }
        let committed = state.batch.commit(&mut state.bo_cache, state.epoch);
        state.target = None;
        state.epoch += 1;
        staged?;

        if let Some(batch) = committed? {
            state.in_flight_bos += batch.bo_count();
            state.in_flight.push_back(batch);
        }
        self.throttle_locked(state);
        Ok(())
    }

    /// Submit the batch under construction. Does nothing when it is empty.
    pub fn flush(&self) -> Result<()> {
        self.check_live()?;
        let mut state = self.state.lock();
        if state.batch.is_empty() && state.vertices.is_empty() {
            self.retire_locked(&mut state);
            return Ok(());
        }
        log::debug!("device: flush epoch {}", state.epoch);
        self.commit_locked(&mut state)?;
        state.snapshots.trim();
        Ok(())
    }

    /// Submit the pending batch if it references `bo`, so that the CPU sees
    /// what was drawn.
    pub fn flush_for(&self, bo: &BoRef) -> Result<()> {
        self.check_live()?;
        let mut state = self.state.lock();
        if state.batch.contains(bo) {
            log::trace!("device: handle {} is pending, flushing", bo.handle());
            self.commit_locked(&mut state)?;
        }
        Ok(())
    }

    /// Block until in-flight buffer objects fall within the configured bound.
    ///
    /// Best effort: this returns `Ok` with the count still over the bound
    /// when a wait times out (`throttle_timeout_ms`), or when the only batch
    /// in flight holds more objects than the bound by itself. The newest
    /// batch is never waited on here. Check [`Device::in_flight_bos`] to
    /// see what is left.
    pub fn throttle(&self) -> Result<()> {
        self.check_live()?;
        if let Err(e) = self.driver.throttle() {
            log::warn!("device: kernel throttle failed: {}", e);
        }
        let mut state = self.state.lock();
        self.throttle_locked(&mut state);
        Ok(())
    }

    fn throttle_locked(&self, state: &mut DeviceState) {
        self.retire_locked(state);
        let timeout = Duration::from_millis(self.settings.throttle_timeout_ms);
        while state.in_flight_bos > self.settings.max_in_flight_bos && state.in_flight.len() > 1 {
            let Some(oldest) = state.in_flight.front() else { break };
            log::trace!(
                "device: {} BOs in flight, waiting on epoch {}",
                state.in_flight_bos,
                oldest.epoch
            );
            if let Err(e) = oldest.batch_bo.wait(Some(timeout)) {
                log::warn!("device: throttle wait on epoch {} failed: {}", oldest.epoch, e);
                break;
            }
            self.retire_locked(state);
        }
    }

    /// Drop completed batches from the front of the queue and unpin what
    /// they used.
    fn retire_locked(&self, state: &mut DeviceState) {
        while let Some(batch) = state.in_flight.front() {
            if !batch.is_complete() {
                break;
            }
            let Some(batch) = state.in_flight.pop_front() else { break };
            state.in_flight_bos -= batch.bo_count();
            state.retired = state.retired.max(batch.epoch);
        }
        if state.in_flight.is_empty() {
            state.retired = state.epoch - 1;
        }
        state.glyphs.unpin_all(state.retired);
        state.bo_cache.collect_released();
    }

    /// Wait for every submitted batch.
    fn drain_locked(&self, state: &mut DeviceState) {
        while let Some(batch) = state.in_flight.pop_front() {
            if let Err(e) = batch.batch_bo.wait(None) {
                log::error!("device: waiting on epoch {} failed: {}", batch.epoch, e);
            }
            state.in_flight_bos -= batch.bo_count();
        }
        state.retired = state.epoch - 1;
        state.glyphs.unpin_all(state.retired);
    }

    /// Flush, wait for the GPU and release every cache.
    ///
    /// Further device operations report `DEVICE_FINISHED`.
    pub fn finish(&self) -> Result<()> {
        if self.finished.swap(true, Ordering::AcqRel) {
            return Err(Error::DeviceFinished);
        }
        let mut state = self.state.lock();
        let flushed = self.commit_locked(&mut state);
        if let Err(e) = &flushed {
            log::error!("device: final flush failed: {}", e);
        }
        self.drain_locked(&mut state);
        state.glyphs.clear();
        state.gradients.clear();
        state.snapshots.clear();
        state.bo_cache.clear();
        log::debug!("device: finished after {} epochs", state.epoch - 1);
        flushed
    }

    // -----------------------------------------------------------------------
    // Caches
    // -----------------------------------------------------------------------

    /// Look up a glyph, rasterizing it on a miss. The glyph stays pinned
    /// until the batch being built now has retired.
    pub fn get_glyph<F>(&self, key: GlyphKey, rasterize: F) -> Result<GlyphStatus>
    where
        F: FnOnce() -> Result<ImageSurface>,
    {
        self.check_live()?;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.glyphs.get_glyph(&mut state.bo_cache, key, state.epoch, rasterize)
    }

    /// Forget every cached glyph of a font that is going away.
    pub fn remove_font(&self, font: u64) {
        self.state.lock().glyphs.remove_font(font);
    }

    pub fn gradient(&self, pattern: &GradientPattern) -> Result<GradientRamp> {
        self.check_live()?;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.gradients.get_or_render(&mut state.bo_cache, pattern)
    }

    /// The snapshot cache, locked for the guard's lifetime.
    pub fn snapshots(&self) -> MappedMutexGuard<'_, SnapshotCache> {
        MutexGuard::map(self.state.lock(), |state| &mut state.snapshots)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if !self.is_finished() {
            let _ = self.finish();
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("driver", &self.driver.name())
            .field("device_id", &self.device_id)
            .field("chip", &self.chip.name())
            .field("backend", &self.backend.name())
            .field("finished", &self.is_finished())
            .finish()
    }
}

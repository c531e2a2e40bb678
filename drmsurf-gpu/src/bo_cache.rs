// SPDX-FileCopyrightText: 2025 drmsurf contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Size-bucketed cache of released buffer objects.
//!
//! Bucket `i` holds objects of `[4 KiB << i, 4 KiB << (i + 1))` bytes, so 12
//! buckets cover everything below 16 MiB. Larger objects always go straight
//! back to the kernel. Parked objects are marked `DONTNEED`; one the kernel
//! has purged in the meantime is closed instead of reused.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use drmsurf_common::{align_up, GemName, Tiling, PAGE_SIZE_U64};
use drmsurf_kernel::abi::Madvise;
use drmsurf_kernel::GemDriver;

use crate::bo::{BoRef, BoUsage, BufferObject, FreeBo, ReleaseQueue};
use crate::error::{Error, Result};

pub const NUM_BUCKETS: usize = 12;
pub const MIN_BUCKET_SIZE: u64 = 4096;

/// Bucket index for an object of `size` bytes, `None` when too large to cache.
pub fn bucket_for_size(size: u64) -> Option<usize> {
    let pages = size.max(MIN_BUCKET_SIZE) / MIN_BUCKET_SIZE;
    let bucket = (63 - pages.leading_zeros()) as usize;
    (bucket < NUM_BUCKETS).then_some(bucket)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BoCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub purged: u64,
    pub cached: usize,
}

pub struct BoCache {
    driver: Arc<dyn GemDriver>,
    buckets: Vec<VecDeque<FreeBo>>,
    capacity: usize,
    releases: Arc<ReleaseQueue>,
    names: HashMap<GemName, Weak<BufferObject>>,
    stats: BoCacheStats,
}

impl BoCache {
    pub fn new(driver: Arc<dyn GemDriver>, capacity: usize) -> Self {
        Self {
            driver,
            buckets: (0..NUM_BUCKETS).map(|_| VecDeque::new()).collect(),
            capacity,
            releases: Arc::new(ReleaseQueue::default()),
            names: HashMap::new(),
            stats: BoCacheStats::default(),
        }
    }

    pub fn driver(&self) -> &Arc<dyn GemDriver> {
        &self.driver
    }

    pub fn stats(&self) -> BoCacheStats {
        BoCacheStats {
            cached: self.buckets.iter().map(VecDeque::len).sum(),
            ..self.stats
        }
    }

    /// Move objects released since the last call into their buckets.
    pub fn collect_released(&mut self) {
        for bo in self.releases.drain() {
            let Some(bucket) = bucket_for_size(bo.size) else {
                self.driver.close(bo.handle);
                continue;
            };
            let slot = &mut self.buckets[bucket];
            if slot.len() >= self.capacity {
                if let Some(old) = slot.pop_front() {
                    log::trace!("bo_cache: bucket {} full, closing handle {}", bucket, old.handle);
                    self.driver.close(old.handle);
                }
            }
            log::trace!("bo_cache: park handle {} in bucket {}", bo.handle, bucket);
            slot.push_back(bo);
        }
    }

    /// Allocate a buffer object, reusing a cached one when possible.
    ///
    /// The tiling/stride pair is validated before any kernel call.
    pub fn create(&mut self, size: u64, usage: BoUsage, tiling: Tiling, stride: u32) -> Result<BoRef> {
        if size == 0 {
            return Err(Error::InvalidSize {
                width: 0,
                height: 0,
            });
        }
        if tiling != Tiling::None && !tiling.stride_is_valid(stride) {
            return Err(Error::InvalidTiling { tiling, stride });
        }

        let size = align_up(size, PAGE_SIZE_U64);
        self.collect_released();

        if usage.reusable() {
            if let Some(bo) = self.take_cached(size, usage, tiling, stride) {
                return Ok(bo);
            }
        }

        self.stats.misses += 1;
        let handle = self.driver.create(size)?;
        let mut applied = Tiling::None;
        if tiling != Tiling::None {
            match self.driver.set_tiling(handle, tiling, stride) {
                Ok(t) => applied = t,
                Err(e) => {
                    self.driver.close(handle);
                    return Err(e.into());
                }
            }
        }
        log::trace!(
            "bo_cache: new handle {} size=0x{:X} {:?} tiling={:?}",
            handle,
            size,
            usage,
            applied
        );
        Ok(self.wrap(handle, size, usage, applied, stride, 0))
    }

    fn take_cached(&mut self, size: u64, usage: BoUsage, tiling: Tiling, stride: u32) -> Option<BoRef> {
        let bucket = bucket_for_size(size)?;
        loop {
            let slot = &mut self.buckets[bucket];
            let index = slot.iter().position(|bo| {
                bo.size >= size && bo.tiling == tiling && (tiling == Tiling::None || bo.stride == stride)
            })?;
            let free = slot.remove(index)?;

            match self.driver.madvise(free.handle, Madvise::WillNeed) {
                Ok(true) => {
                    self.stats.hits += 1;
                    log::trace!("bo_cache: reuse handle {} for 0x{:X}", free.handle, size);
                    return Some(self.wrap(free.handle, free.size, usage, free.tiling, stride, free.offset));
                }
                Ok(false) => {
                    self.stats.purged += 1;
                    log::debug!("bo_cache: handle {} was purged, closing", free.handle);
                    self.driver.close(free.handle);
                }
                Err(e) => {
                    log::warn!("bo_cache: madvise on handle {} failed: {}", free.handle, e);
                    self.driver.close(free.handle);
                }
            }
        }
    }

    fn wrap(&self, handle: u32, size: u64, usage: BoUsage, tiling: Tiling, stride: u32, offset: u64) -> BoRef {
        Arc::new(BufferObject::new(
            Arc::clone(&self.driver),
            handle,
            size,
            usage,
            tiling,
            stride,
            offset,
            Arc::downgrade(&self.releases),
        ))
    }

    /// Open an object by global name. Opening a name that is still alive in
    /// this process returns the same buffer object.
    pub fn create_for_name(&mut self, name: GemName, stride: u32) -> Result<BoRef> {
        if let Some(bo) = self.names.get(&name).and_then(Weak::upgrade) {
            return Ok(bo);
        }
        self.names.retain(|_, weak| weak.strong_count() > 0);
        let (handle, size) = self.driver.open(name)?;
        let bo = Arc::new(BufferObject::from_name(
            Arc::clone(&self.driver),
            handle,
            name,
            size,
            stride,
        ));
        self.names.insert(name, Arc::downgrade(&bo));
        log::debug!("bo_cache: opened name {} as handle {} (0x{:X} bytes)", name, handle, size);
        Ok(bo)
    }

    /// Names with a live buffer object, or not yet swept.
    pub fn name_count(&self) -> usize {
        self.names.len()
    }

    /// Remember a flinked object so later opens of its name share it.
    pub fn register_name(&mut self, bo: &BoRef) {
        if let Some(name) = bo.name() {
            self.names.insert(name, Arc::downgrade(bo));
        }
        self.names.retain(|_, weak| weak.strong_count() > 0);
    }

    /// Close every cached object.
    pub fn clear(&mut self) {
        self.collect_released();
        for slot in &mut self.buckets {
            for bo in slot.drain(..) {
                self.driver.close(bo.handle);
            }
        }
        self.names.clear();
    }
}

impl Drop for BoCache {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drmsurf_kernel::SoftGem;

    fn cache() -> (Arc<SoftGem>, BoCache) {
        let gem = Arc::new(SoftGem::new());
        let cache = BoCache::new(gem.clone(), 4);
        (gem, cache)
    }

    #[test]
    fn test_bucket_for_size() {
        assert_eq!(bucket_for_size(1), Some(0));
        assert_eq!(bucket_for_size(4096), Some(0));
        assert_eq!(bucket_for_size(8191), Some(0));
        assert_eq!(bucket_for_size(8192), Some(1));
        assert_eq!(bucket_for_size(16 * 1024 * 1024 - 4096), Some(11));
        assert_eq!(bucket_for_size(16 * 1024 * 1024), None);
    }

    #[test]
    fn test_reuse_same_bucket() {
        let (gem, mut cache) = cache();
        let bo = cache.create(10_000, BoUsage::Render, Tiling::None, 0).unwrap();
        let handle = bo.handle();
        drop(bo);
        let again = cache.create(9_000, BoUsage::Texture, Tiling::None, 0).unwrap();
        assert_eq!(again.handle(), handle);
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(gem.stats().creates, 1);
    }

    #[test]
    fn test_tiling_mismatch_not_reused() {
        let (_gem, mut cache) = cache();
        let bo = cache.create(8192, BoUsage::Render, Tiling::X, 512).unwrap();
        let handle = bo.handle();
        drop(bo);
        let linear = cache.create(8192, BoUsage::Render, Tiling::None, 0).unwrap();
        assert_ne!(linear.handle(), handle);
        let tiled = cache.create(8192, BoUsage::Render, Tiling::X, 512).unwrap();
        assert_eq!(tiled.handle(), handle);
    }

    #[test]
    fn test_invalid_tiling_rejected_before_kernel() {
        let (gem, mut cache) = cache();
        let err = cache.create(8192, BoUsage::Render, Tiling::Y, 100).unwrap_err();
        assert_eq!(err.status(), drmsurf_common::error::INVALID_FORMAT);
        assert_eq!(gem.stats().creates, 0);
    }

    #[test]
    fn test_purged_bo_is_closed() {
        let (gem, mut cache) = cache();
        let bo = cache.create(4096, BoUsage::Render, Tiling::None, 0).unwrap();
        drop(bo);
        cache.collect_released();
        assert_eq!(gem.purge(), 1);
        let fresh = cache.create(4096, BoUsage::Render, Tiling::None, 0).unwrap();
        assert_eq!(cache.stats().purged, 1);
        assert_eq!(gem.stats().creates, 2);
        assert_eq!(gem.stats().closes, 1);
        drop(fresh);
    }

    #[test]
    fn test_bucket_capacity() {
        let (gem, mut cache) = cache();
        let bos: Vec<_> = (0..6)
            .map(|_| cache.create(4096, BoUsage::Render, Tiling::None, 0).unwrap())
            .collect();
        drop(bos);
        cache.collect_released();
        assert_eq!(cache.stats().cached, 4);
        assert_eq!(gem.stats().closes, 2);
        cache.clear();
        assert_eq!(gem.live_objects(), 0);
    }

    #[test]
    fn test_create_for_name_shares_object() {
        let (gem, mut cache) = cache();
        let bo = cache.create(4096, BoUsage::Render, Tiling::None, 0).unwrap();
        let name = bo.flink().unwrap();

        let a = cache.create_for_name(name, 64).unwrap();
        let b = cache.create_for_name(name, 64).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(gem.stats().opens, 1);

        a.write(0, &[42]).unwrap();
        let mut out = [0u8];
        bo.read(0, &mut out).unwrap();
        assert_eq!(out[0], 42);

        drop((a, b, bo));
        cache.clear();
        assert_eq!(gem.live_objects(), 0);
    }

    #[test]
    fn test_dead_names_are_swept() {
        let (_gem, mut cache) = cache();
        let owners: Vec<_> = (0..4)
            .map(|_| cache.create(4096, BoUsage::Render, Tiling::None, 0).unwrap())
            .collect();
        for owner in &owners {
            let name = owner.flink().unwrap();
            drop(cache.create_for_name(name, 0).unwrap());
        }
        // Each open sweeps the names whose objects have gone.
        assert_eq!(cache.name_count(), 1);
    }
}

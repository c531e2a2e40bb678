// SPDX-FileCopyrightText: 2025 drmsurf contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Byte-bounded cache of surface snapshots, keyed by surface id.
//!
//! While frozen the cache may grow past its budget. Thawing (and inserting
//! while thawed) evicts unreferenced entries, least recently used first,
//! until the total fits again. Entries remember the buffer object they
//! were copied from, so that writes to it can drop them.

use lru::LruCache;

use drmsurf_common::GemHandle;

use crate::bo::BoRef;

#[derive(Debug)]
struct SnapshotEntry {
    source: GemHandle,
    bo: BoRef,
    size: usize,
    refs: u32,
}

pub struct SnapshotCache {
    entries: LruCache<u64, SnapshotEntry>,
    size: usize,
    max_size: usize,
    frozen: u32,
}

impl SnapshotCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: LruCache::unbounded(),
            size: 0,
            max_size,
            frozen: 0,
        }
    }

    /// Total bytes held.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen > 0
    }

    /// Cache `bo`, a copy of object `source`, as the snapshot of surface
    /// `key`, replacing any older one.
    pub fn insert(&mut self, key: u64, source: GemHandle, bo: BoRef, size: usize) {
        if let Some(old) = self.entries.put(key, SnapshotEntry { source, bo, size, refs: 0 }) {
            self.size -= old.size;
        }
        self.size += size;
        log::trace!("snapshot_cache: insert {} ({} bytes, total {})", key, size, self.size);
        if self.frozen == 0 {
            self.shrink();
        }
    }

    pub fn lookup(&mut self, key: u64) -> Option<BoRef> {
        self.entries.get(&key).map(|e| BoRef::clone(&e.bo))
    }

    /// Look up and hold an entry; held entries are never evicted.
    pub fn acquire(&mut self, key: u64) -> Option<BoRef> {
        let entry = self.entries.get_mut(&key)?;
        entry.refs += 1;
        Some(BoRef::clone(&entry.bo))
    }

    pub fn release(&mut self, key: u64) {
        if let Some(entry) = self.entries.peek_mut(&key) {
            entry.refs = entry.refs.saturating_sub(1);
        }
    }

    pub fn remove(&mut self, key: u64) -> Option<BoRef> {
        let entry = self.entries.pop(&key)?;
        self.size -= entry.size;
        Some(entry.bo)
    }

    /// Drop every snapshot copied from `source`. Returns how many went.
    pub fn remove_source(&mut self, source: GemHandle) -> usize {
        let keys: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| e.source == source)
            .map(|(key, _)| *key)
            .collect();
        for key in &keys {
            self.remove(*key);
        }
        if !keys.is_empty() {
            log::trace!("snapshot_cache: handle {} written, dropped {} snapshots", source, keys.len());
        }
        keys.len()
    }

    pub fn freeze(&mut self) {
        self.frozen += 1;
    }

    pub fn thaw(&mut self) {
        self.frozen = self.frozen.saturating_sub(1);
        if self.frozen == 0 {
            self.shrink();
        }
    }

    /// Evict down to the budget unless a freeze is held. Does not touch the
    /// freeze count.
    pub fn trim(&mut self) {
        if self.frozen == 0 {
            self.shrink();
        }
    }

    fn shrink(&mut self) {
        if self.size <= self.max_size {
            return;
        }
        let mut excess = self.size - self.max_size;
        let victims: Vec<u64> = self
            .entries
            .iter()
            .rev()
            .filter(|(_, e)| e.refs == 0)
            .take_while(|(_, e)| {
                let take = excess > 0;
                excess = excess.saturating_sub(e.size);
                take
            })
            .map(|(key, _)| *key)
            .collect();
        for key in victims {
            self.remove(key);
        }
        log::debug!("snapshot_cache: shrunk to {} bytes", self.size);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.size = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bo::BoUsage;
    use crate::bo_cache::BoCache;
    use drmsurf_common::Tiling;
    use drmsurf_kernel::SoftGem;
    use std::sync::Arc;

    fn bos(n: usize) -> (BoCache, Vec<BoRef>) {
        let gem = Arc::new(SoftGem::new());
        let mut cache = BoCache::new(gem, 4);
        let bos = (0..n)
            .map(|_| cache.create(4096, BoUsage::Texture, Tiling::None, 0).unwrap())
            .collect();
        (cache, bos)
    }

    #[test]
    fn test_thaw_evicts_oldest_unreferenced() {
        let (_cache, bos) = bos(4);
        let mut snaps = SnapshotCache::new(250);
        snaps.freeze();
        for (i, bo) in bos.iter().enumerate() {
            snaps.insert(i as u64, 100 + i as u32, BoRef::clone(bo), 100);
        }
        assert_eq!(snaps.size(), 400);
        snaps.lookup(0);
        snaps.thaw();
        assert!(snaps.size() <= 250);
        // 1 and 2 were least recently used.
        assert!(snaps.lookup(0).is_some());
        assert!(snaps.lookup(1).is_none());
        assert!(snaps.lookup(2).is_none());
        assert!(snaps.lookup(3).is_some());
    }

    #[test]
    fn test_referenced_entries_are_kept() {
        let (_cache, bos) = bos(3);
        let mut snaps = SnapshotCache::new(50);
        snaps.freeze();
        for (i, bo) in bos.iter().enumerate() {
            snaps.insert(i as u64, 100 + i as u32, BoRef::clone(bo), 100);
            snaps.acquire(i as u64).unwrap();
        }
        snaps.thaw();
        // Everything is held, so nothing may go.
        assert_eq!(snaps.len(), 3);
        assert_eq!(snaps.size(), 300);

        snaps.release(1);
        snaps.freeze();
        snaps.thaw();
        assert_eq!(snaps.len(), 2);
        assert!(snaps.lookup(1).is_none());
    }

    #[test]
    fn test_trim_respects_freeze() {
        let (_cache, bos) = bos(2);
        let mut snaps = SnapshotCache::new(100);
        snaps.freeze();
        snaps.insert(0, 100, BoRef::clone(&bos[0]), 80);
        snaps.insert(1, 101, BoRef::clone(&bos[1]), 80);
        snaps.trim();
        assert!(snaps.is_frozen());
        assert_eq!(snaps.len(), 2);

        snaps.thaw();
        assert!(!snaps.is_frozen());
        assert_eq!(snaps.size(), 80);
        assert!(snaps.lookup(1).is_some());
    }

    #[test]
    fn test_remove_source_drops_copies() {
        let (_cache, bos) = bos(3);
        let mut snaps = SnapshotCache::new(1000);
        snaps.insert(1, 100, BoRef::clone(&bos[0]), 10);
        snaps.insert(2, 100, BoRef::clone(&bos[1]), 20);
        snaps.insert(3, 200, BoRef::clone(&bos[2]), 30);
        assert_eq!(snaps.remove_source(100), 2);
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps.size(), 30);
        assert_eq!(snaps.remove_source(100), 0);
    }

    #[test]
    fn test_insert_replaces_and_accounts() {
        let (_cache, bos) = bos(2);
        let mut snaps = SnapshotCache::new(1000);
        snaps.insert(7, 100, BoRef::clone(&bos[0]), 300);
        snaps.insert(7, 100, BoRef::clone(&bos[1]), 200);
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps.size(), 200);
        assert_eq!(snaps.remove(7).unwrap().handle(), bos[1].handle());
        assert_eq!(snaps.size(), 0);
    }
}

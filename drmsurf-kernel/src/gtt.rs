// SPDX-FileCopyrightText: 2025 drmsurf contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Graphics translation table model.
//!
//! Tracks where each GEM object is bound in the GPU's 32-bit aperture and
//! translates GTT addresses back to `(object, offset)` through a 2-level page
//! table with 4 KB pages.
//!
//! Layout: `[L0: 10 bits][L1: 10 bits][Offset: 12 bits]` = 32 bits total.

use std::collections::{BTreeMap, HashMap};

use drmsurf_common::{align_up, GttOffset};

/// Device-global object identity (GEM handles are only per-file).
pub type ObjectId = u32;

const PAGE_BITS: u32 = 12;
const PAGE_SIZE: u64 = 1 << PAGE_BITS;
const L1_BITS: u32 = 10;
const L0_BITS: u32 = 10;
const L1_SIZE: usize = 1 << L1_BITS;

const INVALID_ENTRY: u64 = u64::MAX;

pub const GTT_VA_BITS: u32 = L0_BITS + L1_BITS + PAGE_BITS;
pub const GTT_VA_SIZE: u64 = 1 << GTT_VA_BITS;

/// Offset 0 stays unbound so a zero presumed offset always means "unknown".
const GTT_START: u64 = PAGE_SIZE;

pub struct GttSpace {
    page_table: Vec<Option<Box<[u64; L1_SIZE]>>>,
    /// start -> (object, aligned size)
    ranges: BTreeMap<GttOffset, (ObjectId, u64)>,
    offsets: HashMap<ObjectId, GttOffset>,
    size: u64,
}

impl GttSpace {
    pub fn new(size: u64) -> Self {
        let l0_size = 1 << L0_BITS;
        let mut page_table = Vec::with_capacity(l0_size);
        for _ in 0..l0_size {
            page_table.push(None);
        }
        Self {
            page_table,
            ranges: BTreeMap::new(),
            offsets: HashMap::new(),
            size: size.min(GTT_VA_SIZE),
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bytes currently bound.
    pub fn used(&self) -> u64 {
        self.ranges.values().map(|&(_, len)| len).sum()
    }

    pub fn offset_of(&self, object: ObjectId) -> Option<GttOffset> {
        self.offsets.get(&object).copied()
    }

    pub fn bound_objects(&self) -> Vec<ObjectId> {
        self.offsets.keys().copied().collect()
    }

    /// Bind `object` first-fit, or return its existing offset.
    /// Returns `None` when no hole is large enough.
    pub fn bind(&mut self, object: ObjectId, size: u64) -> Option<GttOffset> {
        if let Some(offset) = self.offset_of(object) {
            return Some(offset);
        }

        let len = align_up(size.max(1), PAGE_SIZE);
        let mut cursor = GTT_START;
        for (&start, &(_, range_len)) in &self.ranges {
            if start >= cursor && start - cursor >= len {
                break;
            }
            cursor = cursor.max(start + range_len);
        }
        if cursor.checked_add(len)? > self.size {
            return None;
        }

        self.ranges.insert(cursor, (object, len));
        self.offsets.insert(object, cursor);
        for page in 0..len / PAGE_SIZE {
            self.set_entry(cursor + page * PAGE_SIZE, ((object as u64) << 32) | page);
        }
        log::trace!(
            "gtt: bind object {} at 0x{:X}..0x{:X}",
            object,
            cursor,
            cursor + len
        );
        Some(cursor)
    }

    pub fn unbind(&mut self, object: ObjectId) -> bool {
        let Some(offset) = self.offsets.remove(&object) else {
            return false;
        };
        if let Some((_, len)) = self.ranges.remove(&offset) {
            let mut at = 0;
            while at < len {
                self.set_entry(offset + at, INVALID_ENTRY);
                at += PAGE_SIZE;
            }
            log::trace!("gtt: unbind object {} from 0x{:X}", object, offset);
        }
        true
    }

    /// Resolve a GTT address to the bound object and the byte offset in it.
    pub fn translate(&self, addr: GttOffset) -> Option<(ObjectId, u64)> {
        let entry = self.get_entry(addr);
        if entry == INVALID_ENTRY {
            return None;
        }
        let object = (entry >> 32) as ObjectId;
        let page = entry & 0xFFFF_FFFF;
        Some((object, page * PAGE_SIZE + (addr & (PAGE_SIZE - 1))))
    }

    // ── Internal helpers ─────────────────────────────────────────────────

    fn l0_index(addr: u64) -> usize {
        ((addr >> (L1_BITS + PAGE_BITS)) & ((1 << L0_BITS) - 1)) as usize
    }

    fn l1_index(addr: u64) -> usize {
        ((addr >> PAGE_BITS) & ((1 << L1_BITS) - 1)) as usize
    }

    fn set_entry(&mut self, addr: u64, entry: u64) {
        if addr >= GTT_VA_SIZE {
            return;
        }
        let table = &mut self.page_table[Self::l0_index(addr)];
        match table {
            Some(table) => table[Self::l1_index(addr)] = entry,
            None if entry == INVALID_ENTRY => {}
            None => {
                let mut fresh = Box::new([INVALID_ENTRY; L1_SIZE]);
                fresh[Self::l1_index(addr)] = entry;
                *table = Some(fresh);
            }
        }
    }

    fn get_entry(&self, addr: u64) -> u64 {
        if addr >= GTT_VA_SIZE {
            return INVALID_ENTRY;
        }
        match &self.page_table[Self::l0_index(addr)] {
            Some(table) => table[Self::l1_index(addr)],
            None => INVALID_ENTRY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_is_stable() {
        let mut gtt = GttSpace::new(1 << 24);
        let a = gtt.bind(1, 0x2000).unwrap();
        assert_eq!(a, GTT_START);
        assert_eq!(gtt.bind(1, 0x2000), Some(a));
        let b = gtt.bind(2, 0x1000).unwrap();
        assert_eq!(b, a + 0x2000);
        assert_eq!(gtt.used(), 0x3000);
    }

    #[test]
    fn test_translate() {
        let mut gtt = GttSpace::new(1 << 24);
        gtt.bind(7, 0x1000).unwrap();
        let b = gtt.bind(9, 0x3000).unwrap();
        assert_eq!(gtt.translate(b + 0x1234), Some((9, 0x1234)));
        assert_eq!(gtt.translate(0), None);
        gtt.unbind(9);
        assert_eq!(gtt.translate(b + 0x1234), None);
        assert_eq!(gtt.offset_of(9), None);
    }

    #[test]
    fn test_hole_reuse() {
        let mut gtt = GttSpace::new(1 << 24);
        let a = gtt.bind(1, 0x4000).unwrap();
        gtt.bind(2, 0x1000).unwrap();
        gtt.unbind(1);
        assert_eq!(gtt.bind(3, 0x2000), Some(a));
        assert_eq!(gtt.bind(4, 0x2000), Some(a + 0x2000));
    }

    #[test]
    fn test_exhaustion() {
        let mut gtt = GttSpace::new(0x4000);
        assert!(gtt.bind(1, 0x3000).is_some());
        assert!(gtt.bind(2, 0x1000).is_none());
        assert!(!gtt.unbind(2));
    }
}

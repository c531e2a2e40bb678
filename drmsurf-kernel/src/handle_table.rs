// SPDX-FileCopyrightText: 2025 drmsurf contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::HashMap;

use drmsurf_common::{GemHandle, INVALID_HANDLE};

use crate::driver::{GemError, GemResult};

/// Maximum number of live handles per DRM file.
const MAX_HANDLES: usize = 1 << 20;

/// Per-file handle table: maps GemHandle -> T.
/// Handles are allocated starting from 1 (0 is invalid).
pub struct HandleTable<T> {
    objects: HashMap<GemHandle, T>,
    next_handle: GemHandle,
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self {
            objects: HashMap::new(),
            next_handle: 1,
        }
    }

    /// Add an object and return its handle.
    pub fn add(&mut self, object: T) -> GemResult<GemHandle> {
        if self.objects.len() >= MAX_HANDLES {
            return Err(GemError::OutOfMemory(0));
        }

        let mut handle = self.next_handle;
        while handle == INVALID_HANDLE || self.objects.contains_key(&handle) {
            handle = handle.wrapping_add(1);
        }
        self.next_handle = handle.wrapping_add(1);

        self.objects.insert(handle, object);
        Ok(handle)
    }

    pub fn get(&self, handle: GemHandle) -> GemResult<&T> {
        self.objects
            .get(&handle)
            .ok_or(GemError::InvalidHandle(handle))
    }

    pub fn close(&mut self, handle: GemHandle) -> GemResult<T> {
        self.objects
            .remove(&handle)
            .ok_or(GemError::InvalidHandle(handle))
    }

    pub fn contains(&self, handle: GemHandle) -> bool {
        self.objects.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (GemHandle, &T)> {
        self.objects.iter().map(|(&h, obj)| (h, obj))
    }
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_get() {
        let mut table = HandleTable::new();
        let handle = table.add("bo").unwrap();
        assert_ne!(handle, INVALID_HANDLE);
        assert_eq!(*table.get(handle).unwrap(), "bo");
    }

    #[test]
    fn test_close() {
        let mut table = HandleTable::new();
        let handle = table.add(1u32).unwrap();
        assert_eq!(table.close(handle).unwrap(), 1);
        assert!(matches!(table.get(handle), Err(GemError::InvalidHandle(h)) if h == handle));
        assert!(table.is_empty());
    }

    #[test]
    fn test_handles_are_unique() {
        let mut table = HandleTable::new();
        let a = table.add(()).unwrap();
        let b = table.add(()).unwrap();
        table.close(a).unwrap();
        let c = table.add(()).unwrap();
        assert_ne!(b, c);
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
    }
}

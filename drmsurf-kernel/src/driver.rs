// SPDX-FileCopyrightText: 2025 drmsurf contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! The GEM driver seam.
//!
//! Everything above this crate talks to the kernel only through
//! [`GemDriver`]. [`crate::i915::I915Gem`] issues the real ioctls and
//! [`crate::soft::SoftGem`] models them in process memory.

use std::any::Any;
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Duration;

use memmap2::MmapMut;
use thiserror::Error;

use drmsurf_common::error::{DEVICE_ERROR, INVALID_SIZE, NO_MEMORY, READ_ERROR, WRITE_ERROR};
use drmsurf_common::{GemHandle, GemName, Status, Tiling};

use crate::abi::{Domains, ExecFlags, ExecObject2, Madvise, RelocationEntry};

#[derive(Debug, Error)]
pub enum GemError {
    #[error("ioctl {name} failed: {source}")]
    Ioctl {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid GEM handle {0}")]
    InvalidHandle(GemHandle),
    #[error("no object with global name {0}")]
    InvalidName(GemName),
    #[error("access at {offset:#x}+{len:#x} outside object of {size:#x} bytes")]
    OutOfBounds { offset: u64, len: usize, size: u64 },
    #[error("out of memory allocating {0:#x} bytes")]
    OutOfMemory(u64),
    #[error("aperture exhausted binding {0} objects")]
    NoSpace(usize),
    #[error("malformed execbuffer: {0}")]
    InvalidExec(String),
    #[error("wait on handle {0} timed out")]
    Timeout(GemHandle),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GemError {
    /// Status the surface layer reports for this failure.
    pub fn status(&self) -> Status {
        match self {
            Self::OutOfMemory(_) | Self::NoSpace(_) => NO_MEMORY,
            Self::OutOfBounds { .. } => INVALID_SIZE,
            Self::Ioctl { name, .. } if name.contains("PREAD") => READ_ERROR,
            Self::Ioctl { name, .. } if name.contains("PWRITE") => WRITE_ERROR,
            Self::Ioctl { source, .. } if source.kind() == std::io::ErrorKind::OutOfMemory => {
                NO_MEMORY
            }
            _ => DEVICE_ERROR,
        }
    }
}

pub type GemResult<T> = Result<T, GemError>;

/// `GET_APERTURE` result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Aperture {
    pub size: u64,
    pub available: u64,
}

/// One `EXECBUFFER2` submission.
///
/// The batch object is the last entry of `objects` and carries `relocs`.
/// Relocation targets are indices into `objects` (`ExecFlags::HANDLE_LUT`).
/// On success each object's `offset` holds where the kernel bound it.
pub struct ExecRequest<'a> {
    pub objects: &'a mut [ExecObject2],
    pub relocs: &'a [RelocationEntry],
    pub batch_len: u32,
    pub flags: ExecFlags,
}

/// CPU view of a GEM object.
///
/// Holds the backing mapping alive for as long as the view exists. Access
/// goes through the bounds-checked copy helpers; raw pointer access is left
/// to callers that already hold the owning buffer object's map lock.
pub struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
    _owner: Box<dyn Any + Send + Sync>,
}

unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    pub fn from_mmap(mut map: MmapMut) -> Self {
        let len = map.len();
        let ptr = NonNull::new(map.as_mut_ptr()).unwrap_or(NonNull::dangling());
        Self {
            ptr,
            len,
            _owner: Box::new(map),
        }
    }

    /// Another view of the same memory, keeping `this` alive.
    pub fn share(this: &Arc<Mapping>) -> Mapping {
        Mapping {
            ptr: this.ptr,
            len: this.len,
            _owner: Box::new(Arc::clone(this)),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn check(&self, offset: usize, len: usize) -> GemResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(GemError::OutOfBounds {
                offset: offset as u64,
                len,
                size: self.len as u64,
            }),
        }
    }

    pub fn read(&self, offset: usize, dst: &mut [u8]) -> GemResult<()> {
        self.check(offset, dst.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    pub fn write(&self, offset: usize, src: &[u8]) -> GemResult<()> {
        self.check(offset, src.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.as_ptr().add(offset), src.len());
        }
        Ok(())
    }

    pub fn fill(&self, offset: usize, len: usize, value: u8) -> GemResult<()> {
        self.check(offset, len)?;
        unsafe {
            std::ptr::write_bytes(self.ptr.as_ptr().add(offset), value, len);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Mapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapping")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

/// Kernel interface used by the buffer-object layer.
pub trait GemDriver: Send + Sync {
    /// Short driver name for logs.
    fn name(&self) -> &str;

    /// File descriptor identifying the DRM device (fake for soft drivers).
    fn fd(&self) -> i32;

    /// PCI device id of the GPU.
    fn chip_id(&self) -> GemResult<u32>;

    fn aperture(&self) -> GemResult<Aperture>;

    /// Allocate a new object of at least `size` bytes.
    fn create(&self, size: u64) -> GemResult<GemHandle>;

    /// Drop this file's handle. Errors are logged, never returned.
    fn close(&self, handle: GemHandle);

    fn flink(&self, handle: GemHandle) -> GemResult<GemName>;

    /// Open a global name, returning a fresh handle and the object size.
    fn open(&self, name: GemName) -> GemResult<(GemHandle, u64)>;

    /// Request a tiling layout. Returns the tiling the kernel actually applied.
    fn set_tiling(&self, handle: GemHandle, tiling: Tiling, stride: u32) -> GemResult<Tiling>;

    fn mmap(&self, handle: GemHandle, size: u64) -> GemResult<Mapping>;

    fn pread(&self, handle: GemHandle, offset: u64, dst: &mut [u8]) -> GemResult<()>;

    fn pwrite(&self, handle: GemHandle, offset: u64, src: &[u8]) -> GemResult<()>;

    fn set_domain(&self, handle: GemHandle, read: Domains, write: Domains) -> GemResult<()>;

    /// Returns whether the backing pages were retained.
    fn madvise(&self, handle: GemHandle, advice: Madvise) -> GemResult<bool>;

    fn busy(&self, handle: GemHandle) -> GemResult<bool>;

    /// Block until the GPU is done with `handle`. `None` waits forever.
    fn wait(&self, handle: GemHandle, timeout: Option<Duration>) -> GemResult<()>;

    fn execbuffer(&self, request: &mut ExecRequest<'_>) -> GemResult<()>;

    /// Wait for the GPU to catch up with work older than ~20ms.
    fn throttle(&self) -> GemResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_bounds() {
        let map = Mapping::from_mmap(MmapMut::map_anon(4096).unwrap());
        map.write(4092, &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 4];
        map.read(4092, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
        assert!(matches!(
            map.write(4093, &[0; 4]),
            Err(GemError::OutOfBounds { .. })
        ));
        assert!(map.read(usize::MAX, &mut out).is_err());
    }

    #[test]
    fn test_shared_mapping_sees_writes() {
        let base = Arc::new(Mapping::from_mmap(MmapMut::map_anon(8192).unwrap()));
        let view = Mapping::share(&base);
        view.fill(100, 8, 0xAB).unwrap();
        let mut out = [0u8; 8];
        base.read(100, &mut out).unwrap();
        assert_eq!(out, [0xAB; 8]);
        drop(base);
        // View keeps the memory alive.
        view.read(100, &mut out).unwrap();
        assert_eq!(out[0], 0xAB);
    }

    #[test]
    fn test_error_status() {
        assert_eq!(GemError::OutOfMemory(4096).status(), NO_MEMORY);
        assert_eq!(GemError::InvalidHandle(3).status(), DEVICE_ERROR);
        let e = GemError::Ioctl {
            name: "I915_GEM_PREAD",
            source: std::io::Error::from_raw_os_error(5),
        };
        assert_eq!(e.status(), READ_ERROR);
    }
}

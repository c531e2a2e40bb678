// SPDX-FileCopyrightText: 2025 drmsurf contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Kernel ABI for the DRM/GEM and i915 ioctls.
//!
//! Every struct here is `#[repr(C)]` and laid out exactly as in
//! `drm.h` / `i915_drm.h`; the size assertions in the tests pin that down.
//!
//! ## Request encoding (`_IOC`)
//!
//! | Bits    | Field                 |
//! |---------|-----------------------|
//! | 7:0     | Number                |
//! | 15:8    | Type (`'d'` for DRM)  |
//! | 29:16   | Argument size         |
//! | 31:30   | Direction (W=1, R=2)  |

use bitflags::bitflags;

use drmsurf_common::{GemHandle, GemName};

// ---------------------------------------------------------------------------
// Limits shared with the batch layer
// ---------------------------------------------------------------------------

/// Size of the CPU-side command buffer (64 KiB).
pub const BATCH_SIZE: usize = 64 * 1024;

/// Size of the vertex staging buffer (512 KiB).
pub const VERTEX_BUFFER_SIZE: usize = 512 * 1024;

/// Maximum relocations (and exec objects) per batch.
pub const MAX_RELOCS: usize = 2048;

// ---------------------------------------------------------------------------
// Domains / flags
// ---------------------------------------------------------------------------

bitflags! {
    /// GEM memory domains (`I915_GEM_DOMAIN_*`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Domains: u32 {
        const CPU         = 0x01;
        const RENDER      = 0x02;
        const SAMPLER     = 0x04;
        const COMMAND     = 0x08;
        const INSTRUCTION = 0x10;
        const VERTEX      = 0x20;
        const GTT         = 0x40;
    }
}

bitflags! {
    /// `drm_i915_gem_execbuffer2.flags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ExecFlags: u64 {
        const RENDER     = 1;
        const BSD        = 2;
        const BLT        = 3;
        const NO_RELOC   = 1 << 11;
        const HANDLE_LUT = 1 << 12;
    }
}

/// `I915_MADV_*` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Madvise {
    WillNeed = 0,
    DontNeed = 1,
}

/// `I915_PARAM_CHIPSET_ID`.
pub const I915_PARAM_CHIPSET_ID: i32 = 4;

// ---------------------------------------------------------------------------
// Execbuffer structures
// ---------------------------------------------------------------------------

/// `struct drm_i915_gem_exec_object2` (56 bytes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct ExecObject2 {
    pub handle: u32,
    pub relocation_count: u32,
    pub relocs_ptr: u64,
    pub alignment: u64,
    /// In: presumed offset. Out: the offset the kernel bound the object at.
    pub offset: u64,
    pub flags: u64,
    pub rsvd1: u64,
    pub rsvd2: u64,
}

impl ExecObject2 {
    pub fn new(handle: GemHandle, presumed_offset: u64) -> Self {
        Self {
            handle,
            offset: presumed_offset,
            ..Self::default()
        }
    }
}

/// `struct drm_i915_gem_relocation_entry` (32 bytes).
///
/// With `ExecFlags::HANDLE_LUT`, `target_handle` is an index into the exec
/// object list rather than a GEM handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct RelocationEntry {
    pub target_handle: u32,
    pub delta: u32,
    /// Byte offset of the patched dword inside the batch object.
    pub offset: u64,
    pub presumed_offset: u64,
    pub read_domains: u32,
    pub write_domain: u32,
}

/// `struct drm_i915_gem_execbuffer2` (64 bytes).
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct ExecBuffer2 {
    pub buffers_ptr: u64,
    pub buffer_count: u32,
    pub batch_start_offset: u32,
    pub batch_len: u32,
    pub dr1: u32,
    pub dr4: u32,
    pub num_cliprects: u32,
    pub cliprects_ptr: u64,
    pub flags: u64,
    pub rsvd1: u64,
    pub rsvd2: u64,
}

// ---------------------------------------------------------------------------
// Object management structures
// ---------------------------------------------------------------------------

/// `struct drm_gem_close`.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct GemClose {
    pub handle: u32,
    pub pad: u32,
}

/// `struct drm_gem_flink`.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct GemFlink {
    pub handle: u32,
    pub name: GemName,
}

/// `struct drm_gem_open`.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct GemOpen {
    pub name: GemName,
    pub handle: u32,
    pub size: u64,
}

/// `struct drm_i915_gem_create`.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct GemCreate {
    pub size: u64,
    pub handle: u32,
    pub pad: u32,
}

/// `struct drm_i915_gem_pread` / `drm_i915_gem_pwrite`.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct GemRw {
    pub handle: u32,
    pub pad: u32,
    pub offset: u64,
    pub size: u64,
    pub data_ptr: u64,
}

/// `struct drm_i915_gem_mmap_gtt`.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct GemMmapGtt {
    pub handle: u32,
    pub pad: u32,
    pub offset: u64,
}

/// `struct drm_i915_gem_set_domain`.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct GemSetDomain {
    pub handle: u32,
    pub read_domains: u32,
    pub write_domain: u32,
}

/// `struct drm_i915_gem_set_tiling`.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct GemSetTiling {
    pub handle: u32,
    pub tiling_mode: u32,
    pub stride: u32,
    pub swizzle_mode: u32,
}

/// `struct drm_i915_gem_madvise`.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct GemMadvise {
    pub handle: u32,
    pub madv: u32,
    pub retained: u32,
}

/// `struct drm_i915_gem_busy`.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct GemBusy {
    pub handle: u32,
    pub busy: u32,
}

/// `struct drm_i915_gem_wait`.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct GemWait {
    pub bo_handle: u32,
    pub flags: u32,
    /// Nanoseconds; negative waits forever.
    pub timeout_ns: i64,
}

/// `struct drm_i915_gem_get_aperture`.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct GemGetAperture {
    pub aper_size: u64,
    pub aper_available_size: u64,
}

/// `struct drm_i915_getparam`.
#[derive(Debug)]
#[repr(C)]
pub struct GetParam {
    pub param: i32,
    pub value: *mut i32,
}

// ---------------------------------------------------------------------------
// Request numbers
// ---------------------------------------------------------------------------

const IOC_NONE: u64 = 0;
const IOC_WRITE: u64 = 1;
const IOC_READ: u64 = 2;

const DRM_IOCTL_BASE: u64 = b'd' as u64;
const DRM_COMMAND_BASE: u64 = 0x40;

const fn ioc(dir: u64, nr: u64, size: usize) -> u64 {
    (dir << 30) | ((size as u64) << 16) | (DRM_IOCTL_BASE << 8) | nr
}

const fn iow<T>(nr: u64) -> u64 {
    ioc(IOC_WRITE, nr, std::mem::size_of::<T>())
}

const fn ior<T>(nr: u64) -> u64 {
    ioc(IOC_READ, nr, std::mem::size_of::<T>())
}

const fn iowr<T>(nr: u64) -> u64 {
    ioc(IOC_READ | IOC_WRITE, nr, std::mem::size_of::<T>())
}

pub const DRM_IOCTL_GEM_CLOSE: u64 = iow::<GemClose>(0x09);
pub const DRM_IOCTL_GEM_FLINK: u64 = iowr::<GemFlink>(0x0a);
pub const DRM_IOCTL_GEM_OPEN: u64 = iowr::<GemOpen>(0x0b);

pub const DRM_IOCTL_I915_GETPARAM: u64 = iowr::<GetParam>(DRM_COMMAND_BASE + 0x06);
pub const DRM_IOCTL_I915_GEM_BUSY: u64 = iowr::<GemBusy>(DRM_COMMAND_BASE + 0x17);
pub const DRM_IOCTL_I915_GEM_THROTTLE: u64 = ioc(IOC_NONE, DRM_COMMAND_BASE + 0x18, 0);
pub const DRM_IOCTL_I915_GEM_CREATE: u64 = iowr::<GemCreate>(DRM_COMMAND_BASE + 0x1b);
pub const DRM_IOCTL_I915_GEM_PREAD: u64 = iow::<GemRw>(DRM_COMMAND_BASE + 0x1c);
pub const DRM_IOCTL_I915_GEM_PWRITE: u64 = iow::<GemRw>(DRM_COMMAND_BASE + 0x1d);
pub const DRM_IOCTL_I915_GEM_SET_DOMAIN: u64 = iow::<GemSetDomain>(DRM_COMMAND_BASE + 0x1f);
pub const DRM_IOCTL_I915_GEM_SET_TILING: u64 = iowr::<GemSetTiling>(DRM_COMMAND_BASE + 0x21);
pub const DRM_IOCTL_I915_GEM_GET_APERTURE: u64 = ior::<GemGetAperture>(DRM_COMMAND_BASE + 0x23);
pub const DRM_IOCTL_I915_GEM_MMAP_GTT: u64 = iowr::<GemMmapGtt>(DRM_COMMAND_BASE + 0x24);
pub const DRM_IOCTL_I915_GEM_MADVISE: u64 = iowr::<GemMadvise>(DRM_COMMAND_BASE + 0x26);
pub const DRM_IOCTL_I915_GEM_EXECBUFFER2: u64 = iow::<ExecBuffer2>(DRM_COMMAND_BASE + 0x29);
pub const DRM_IOCTL_I915_GEM_WAIT: u64 = iowr::<GemWait>(DRM_COMMAND_BASE + 0x2c);

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn test_struct_sizes() {
        assert_eq!(size_of::<ExecObject2>(), 56);
        assert_eq!(size_of::<RelocationEntry>(), 32);
        assert_eq!(size_of::<ExecBuffer2>(), 64);
        assert_eq!(size_of::<GemCreate>(), 16);
        assert_eq!(size_of::<GemOpen>(), 16);
        assert_eq!(size_of::<GemRw>(), 32);
        assert_eq!(size_of::<GemMadvise>(), 12);
        assert_eq!(size_of::<GemWait>(), 16);
    }

    #[test]
    fn test_field_offsets() {
        let obj = ExecObject2::default();
        let base = &obj as *const _ as usize;
        assert_eq!(&obj.offset as *const _ as usize - base, 24);
        assert_eq!(&obj.flags as *const _ as usize - base, 32);

        let exec = ExecBuffer2::default();
        let base = &exec as *const _ as usize;
        assert_eq!(&exec.cliprects_ptr as *const _ as usize - base, 32);
        assert_eq!(&exec.flags as *const _ as usize - base, 40);
    }

    #[test]
    fn test_request_numbers() {
        assert_eq!(DRM_IOCTL_GEM_CLOSE, 0x4008_6409);
        assert_eq!(DRM_IOCTL_GEM_FLINK, 0xC008_640A);
        assert_eq!(DRM_IOCTL_GEM_OPEN, 0xC010_640B);
        assert_eq!(DRM_IOCTL_I915_GEM_CREATE, 0xC010_645B);
        assert_eq!(DRM_IOCTL_I915_GEM_EXECBUFFER2, 0x4040_6469);
        assert_eq!(DRM_IOCTL_I915_GEM_MMAP_GTT, 0xC010_6464);
        assert_eq!(DRM_IOCTL_I915_GEM_THROTTLE, 0x0000_6458);
    }

    #[test]
    fn test_domain_flags() {
        let rw = Domains::RENDER | Domains::SAMPLER;
        assert_eq!(rw.bits(), 0x06);
        assert!(ExecFlags::HANDLE_LUT.contains(ExecFlags::HANDLE_LUT));
        assert_eq!((ExecFlags::RENDER | ExecFlags::HANDLE_LUT).bits(), 0x1001);
    }
}

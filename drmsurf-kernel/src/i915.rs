// SPDX-FileCopyrightText: 2025 drmsurf contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! i915 GEM driver over a DRM device node.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::time::Duration;

use memmap2::MmapOptions;

use drmsurf_common::{GemHandle, GemName, Tiling};

use crate::abi::*;
use crate::driver::{Aperture, ExecRequest, GemDriver, GemError, GemResult, Mapping};

pub struct I915Gem {
    file: File,
}

impl I915Gem {
    /// Open a DRM node such as `/dev/dri/card0` or `/dev/dri/renderD128`.
    pub fn open(path: &Path) -> GemResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        log::info!("i915: opened {}", path.display());
        Ok(Self { file })
    }

    pub fn from_file(file: File) -> Self {
        Self { file }
    }

    fn ioctl<T>(&self, name: &'static str, request: u64, arg: &mut T) -> GemResult<()> {
        loop {
            let ret = unsafe {
                libc::ioctl(self.file.as_raw_fd(), request as _, arg as *mut T as *mut libc::c_void)
            };
            if ret == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
                _ => return Err(GemError::Ioctl { name, source: err }),
            }
        }
    }
}

impl GemDriver for I915Gem {
    fn name(&self) -> &str {
        "i915"
    }

    fn fd(&self) -> i32 {
        self.file.as_raw_fd()
    }

    fn chip_id(&self) -> GemResult<u32> {
        let mut value: i32 = 0;
        let mut param = GetParam {
            param: I915_PARAM_CHIPSET_ID,
            value: &mut value,
        };
        self.ioctl("I915_GETPARAM", DRM_IOCTL_I915_GETPARAM, &mut param)?;
        Ok(value as u32)
    }

    fn aperture(&self) -> GemResult<Aperture> {
        let mut arg = GemGetAperture::default();
        self.ioctl("I915_GEM_GET_APERTURE", DRM_IOCTL_I915_GEM_GET_APERTURE, &mut arg)?;
        Ok(Aperture {
            size: arg.aper_size,
            available: arg.aper_available_size,
        })
    }

    fn create(&self, size: u64) -> GemResult<GemHandle> {
        let mut arg = GemCreate {
            size,
            ..Default::default()
        };
        self.ioctl("I915_GEM_CREATE", DRM_IOCTL_I915_GEM_CREATE, &mut arg)?;
        Ok(arg.handle)
    }

    fn close(&self, handle: GemHandle) {
        let mut arg = GemClose { handle, pad: 0 };
        if let Err(e) = self.ioctl("GEM_CLOSE", DRM_IOCTL_GEM_CLOSE, &mut arg) {
            log::warn!("i915: {}", e);
        }
    }

    fn flink(&self, handle: GemHandle) -> GemResult<GemName> {
        let mut arg = GemFlink { handle, name: 0 };
        self.ioctl("GEM_FLINK", DRM_IOCTL_GEM_FLINK, &mut arg)?;
        Ok(arg.name)
    }

    fn open(&self, name: GemName) -> GemResult<(GemHandle, u64)> {
        let mut arg = GemOpen {
            name,
            ..Default::default()
        };
        self.ioctl("GEM_OPEN", DRM_IOCTL_GEM_OPEN, &mut arg)?;
        Ok((arg.handle, arg.size))
    }

    fn set_tiling(&self, handle: GemHandle, tiling: Tiling, stride: u32) -> GemResult<Tiling> {
        let mut arg = GemSetTiling {
            handle,
            tiling_mode: tiling as u32,
            stride,
            swizzle_mode: 0,
        };
        self.ioctl("I915_GEM_SET_TILING", DRM_IOCTL_I915_GEM_SET_TILING, &mut arg)?;
        Ok(Tiling::from_raw(arg.tiling_mode).unwrap_or(Tiling::None))
    }

    fn mmap(&self, handle: GemHandle, size: u64) -> GemResult<Mapping> {
        let mut arg = GemMmapGtt {
            handle,
            ..Default::default()
        };
        self.ioctl("I915_GEM_MMAP_GTT", DRM_IOCTL_I915_GEM_MMAP_GTT, &mut arg)?;
        let map = unsafe {
            MmapOptions::new()
                .offset(arg.offset)
                .len(size as usize)
                .map_mut(&self.file)?
        };
        Ok(Mapping::from_mmap(map))
    }

    fn pread(&self, handle: GemHandle, offset: u64, dst: &mut [u8]) -> GemResult<()> {
        let mut arg = GemRw {
            handle,
            pad: 0,
            offset,
            size: dst.len() as u64,
            data_ptr: dst.as_mut_ptr() as u64,
        };
        self.ioctl("I915_GEM_PREAD", DRM_IOCTL_I915_GEM_PREAD, &mut arg)
    }

    fn pwrite(&self, handle: GemHandle, offset: u64, src: &[u8]) -> GemResult<()> {
        let mut arg = GemRw {
            handle,
            pad: 0,
            offset,
            size: src.len() as u64,
            data_ptr: src.as_ptr() as u64,
        };
        self.ioctl("I915_GEM_PWRITE", DRM_IOCTL_I915_GEM_PWRITE, &mut arg)
    }

    fn set_domain(&self, handle: GemHandle, read: Domains, write: Domains) -> GemResult<()> {
        let mut arg = GemSetDomain {
            handle,
            read_domains: read.bits(),
            write_domain: write.bits(),
        };
        self.ioctl("I915_GEM_SET_DOMAIN", DRM_IOCTL_I915_GEM_SET_DOMAIN, &mut arg)
    }

    fn madvise(&self, handle: GemHandle, advice: Madvise) -> GemResult<bool> {
        let mut arg = GemMadvise {
            handle,
            madv: advice as u32,
            retained: 0,
        };
        self.ioctl("I915_GEM_MADVISE", DRM_IOCTL_I915_GEM_MADVISE, &mut arg)?;
        Ok(arg.retained != 0)
    }

    fn busy(&self, handle: GemHandle) -> GemResult<bool> {
        let mut arg = GemBusy { handle, busy: 0 };
        self.ioctl("I915_GEM_BUSY", DRM_IOCTL_I915_GEM_BUSY, &mut arg)?;
        Ok(arg.busy != 0)
    }

    fn wait(&self, handle: GemHandle, timeout: Option<Duration>) -> GemResult<()> {
        let mut arg = GemWait {
            bo_handle: handle,
            flags: 0,
            timeout_ns: timeout.map_or(-1, |t| t.as_nanos().min(i64::MAX as u128) as i64),
        };
        match self.ioctl("I915_GEM_WAIT", DRM_IOCTL_I915_GEM_WAIT, &mut arg) {
            Err(GemError::Ioctl { source, .. }) if source.raw_os_error() == Some(libc::ETIME) => {
                Err(GemError::Timeout(handle))
            }
            other => other,
        }
    }

    fn execbuffer(&self, request: &mut ExecRequest<'_>) -> GemResult<()> {
        let count = request.objects.len();
        let Some(batch) = request.objects.last_mut() else {
            return Err(GemError::InvalidExec("empty object list".into()));
        };
        batch.relocation_count = request.relocs.len() as u32;
        batch.relocs_ptr = request.relocs.as_ptr() as u64;

        let mut arg = ExecBuffer2 {
            buffers_ptr: request.objects.as_mut_ptr() as u64,
            buffer_count: count as u32,
            batch_len: request.batch_len,
            flags: request.flags.bits(),
            ..Default::default()
        };
        self.ioctl("I915_GEM_EXECBUFFER2", DRM_IOCTL_I915_GEM_EXECBUFFER2, &mut arg)
    }

    fn throttle(&self) -> GemResult<()> {
        let mut unit = ();
        self.ioctl("I915_GEM_THROTTLE", DRM_IOCTL_I915_GEM_THROTTLE, &mut unit)
    }
}

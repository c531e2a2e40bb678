// SPDX-FileCopyrightText: 2025 drmsurf contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use thiserror::Error;

use drmsurf_common::error::{
    DEVICE_ERROR, DEVICE_FINISHED, DEVICE_TYPE_MISMATCH, INVALID_FORMAT, INVALID_SIZE,
    INVALID_STRIDE, NO_MEMORY, SURFACE_FINISHED, UNSUPPORTED,
};
use drmsurf_common::{Format, Status, Tiling};
use drmsurf_kernel::GemError;

/// Errors returned by the buffer-object and surface layer.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Gem(#[from] GemError),

    #[error("format {0} is not supported here")]
    InvalidFormat(Format),

    #[error("tiling {tiling:?} cannot use stride {stride}")]
    InvalidTiling { tiling: Tiling, stride: u32 },

    #[error("stride {stride} too small, need at least {min}")]
    InvalidStride { stride: u32, min: u32 },

    #[error("invalid size {width}x{height}")]
    InvalidSize { width: u32, height: u32 },

    #[error("{words} dwords and {relocs} relocations do not fit in an empty batch")]
    PrimitiveTooLarge { words: usize, relocs: usize },

    #[error("device has been finished")]
    DeviceFinished,

    #[error("surface has been finished")]
    SurfaceFinished,

    #[error("no surface backend for vendor {0:#06x}")]
    UnsupportedVendor(u32),

    #[error("device initialization failed: {0}")]
    DeviceInit(String),

    #[error("{0} is not supported by this backend")]
    Unsupported(&'static str),
}

impl Error {
    pub fn status(&self) -> Status {
        match self {
            Self::Gem(e) => e.status(),
            Self::InvalidFormat(_) | Self::InvalidTiling { .. } => INVALID_FORMAT,
            Self::InvalidStride { .. } => INVALID_STRIDE,
            Self::InvalidSize { .. } => INVALID_SIZE,
            Self::PrimitiveTooLarge { .. } => NO_MEMORY,
            Self::DeviceFinished => DEVICE_FINISHED,
            Self::SurfaceFinished => SURFACE_FINISHED,
            Self::UnsupportedVendor(_) => DEVICE_TYPE_MISMATCH,
            Self::DeviceInit(_) => DEVICE_ERROR,
            Self::Unsupported(_) => UNSUPPORTED,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// The batch has no room for the requested commands or relocations.
///
/// Not an error: commit the batch and retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchFull;

impl std::fmt::Display for BatchFull {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("batch full")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(Error::InvalidFormat(Format::A1).status(), INVALID_FORMAT);
        assert_eq!(
            Error::InvalidTiling {
                tiling: Tiling::X,
                stride: 100
            }
            .status(),
            INVALID_FORMAT
        );
        assert_eq!(Error::InvalidStride { stride: 4, min: 8 }.status(), INVALID_STRIDE);
        assert_eq!(Error::from(GemError::OutOfMemory(1)).status(), NO_MEMORY);
        assert_eq!(Error::DeviceFinished.status().text(), "DEVICE_FINISHED");
    }
}

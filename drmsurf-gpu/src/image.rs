// SPDX-FileCopyrightText: 2025 drmsurf contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! CPU-side pixel buffers exchanged with the drawing layer.

use drmsurf_common::{Format, RectInt};

use crate::error::{Error, Result};

/// A plain image in system memory. Rows are `stride` bytes apart.
#[derive(Clone, PartialEq, Eq)]
pub struct ImageSurface {
    format: Format,
    width: u32,
    height: u32,
    stride: u32,
    data: Vec<u8>,
}

impl ImageSurface {
    /// Zero-filled image with the minimum stride for `width`.
    pub fn new(format: Format, width: u32, height: u32) -> Result<Self> {
        let stride = format
            .stride_for_width(width)
            .ok_or(Error::InvalidSize { width, height })?;
        let len = (stride as usize)
            .checked_mul(height as usize)
            .ok_or(Error::InvalidSize { width, height })?;
        Ok(Self {
            format,
            width,
            height,
            stride,
            data: vec![0; len],
        })
    }

    /// Wrap existing pixel data. `data` must hold `stride * height` bytes.
    pub fn from_data(format: Format, width: u32, height: u32, stride: u32, data: Vec<u8>) -> Result<Self> {
        let min = format
            .stride_for_width(width)
            .ok_or(Error::InvalidSize { width, height })?;
        if stride < min || stride % 4 != 0 {
            return Err(Error::InvalidStride { stride, min });
        }
        if data.len() < stride as usize * height as usize {
            return Err(Error::InvalidSize { width, height });
        }
        Ok(Self {
            format,
            width,
            height,
            stride,
            data,
        })
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn extents(&self) -> RectInt {
        RectInt::new(0, 0, self.width, self.height)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Pixel bytes of row `y`, without stride padding.
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride as usize;
        &self.data[start..start + self.format.row_bytes(self.width) as usize]
    }

    pub fn row_mut(&mut self, y: u32) -> &mut [u8] {
        let start = y as usize * self.stride as usize;
        let len = self.format.row_bytes(self.width) as usize;
        &mut self.data[start..start + len]
    }

    /// Read a 32bpp pixel. Returns `None` for other formats or out of range.
    pub fn pixel_u32(&self, x: u32, y: u32) -> Option<u32> {
        if self.format.bpp() != 32 || x >= self.width || y >= self.height {
            return None;
        }
        let at = y as usize * self.stride as usize + x as usize * 4;
        let bytes = self.data.get(at..at + 4)?;
        Some(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Fill every pixel of a 32bpp image with `color`.
    pub fn fill_u32(&mut self, color: u32) {
        if self.format.bpp() != 32 {
            return;
        }
        for y in 0..self.height {
            for px in self.row_mut(y).chunks_exact_mut(4) {
                px.copy_from_slice(&color.to_ne_bytes());
            }
        }
    }
}

impl std::fmt::Debug for ImageSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageSurface")
            .field("format", &self.format)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .finish()
    }
}

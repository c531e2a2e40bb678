// SPDX-FileCopyrightText: 2025 drmsurf contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! GEM buffer objects, batch submission and GPU-resident caches for 2D
//! drawing surfaces.

pub mod backend;
pub mod batch;
pub mod bo;
pub mod bo_cache;
pub mod chip;
pub mod commands;
pub mod decoder;
pub mod device;
pub mod error;
pub mod glyph_cache;
pub mod gradient_cache;
pub mod image;
pub mod registry;
pub mod rtree;
pub mod snapshot_cache;
pub mod surface;
pub mod vertex_buffer;

pub use backend::{BackendType, SurfaceBackend};
pub use bo::{BoRef, BoUsage, BufferObject};
pub use device::{Device, DeviceDescriptor, DeviceRef};
pub use error::{Error, Result};
pub use image::ImageSurface;
pub use registry::DeviceRegistry;
pub use surface::{DrmSurface, MappedImage};

// SPDX-FileCopyrightText: 2025 drmsurf contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Vertex staging.
//!
//! Rectangles are appended as runs of equally sized vertices. On
//! [`VertexBuffer::finish`] the staged floats are uploaded into a fresh
//! vertex BO and every run becomes one `LOAD_STATE_IMMEDIATE_1` (S0 vertex
//! address, S1 vertex format) plus one indirect `PRIM3D_RECTLIST`.

use byteorder::{ByteOrder, LittleEndian};

use drmsurf_common::Tiling;
use drmsurf_kernel::abi::{Domains, VERTEX_BUFFER_SIZE};

use crate::batch::Batch;
use crate::bo::BoUsage;
use crate::bo_cache::BoCache;
use crate::commands::{
    i1_load_s, s1_vertex_format, PRIM3D, PRIM3D_INDIRECT_SEQUENTIAL, PRIM3D_RECTLIST,
    _3DSTATE_LOAD_STATE_IMMEDIATE_1,
};
use crate::error::{Error, Result};

/// Vertices per rectangle in a `RECTLIST`.
pub const RECT_VERTICES: u32 = 3;

/// Batch dwords emitted per run.
pub const RUN_WORDS: usize = 5;

/// Floats the staging area holds.
pub const VERTEX_FLOATS: usize = VERTEX_BUFFER_SIZE / 4;

/// The primitive's vertex count field is 16 bits wide.
const MAX_RUN_VERTICES: u32 = 0xffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct VertexRun {
    floats_per_vertex: u32,
    /// First float of the run in the staging area.
    start: usize,
    vertices: u32,
}

#[derive(Default)]
pub struct VertexBuffer {
    data: Vec<f32>,
    runs: Vec<VertexRun>,
}

impl VertexBuffer {
    pub fn new() -> Self {
        Self {
            data: Vec::with_capacity(VERTEX_FLOATS),
            runs: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn used_bytes(&self) -> usize {
        self.data.len() * 4
    }

    pub fn vertex_count(&self) -> u32 {
        self.runs.iter().map(|r| r.vertices).sum()
    }

    /// Vertex size of the run currently being filled.
    pub fn floats_per_vertex(&self) -> Option<u32> {
        self.runs.last().map(|r| r.floats_per_vertex)
    }

    /// Whether drawing with `floats_per_vertex` opens a new run.
    pub fn needs_new_run(&self, floats_per_vertex: u32) -> bool {
        self.floats_per_vertex() != Some(floats_per_vertex)
    }

    /// Batch dwords and relocations [`finish`](Self::finish) will emit.
    pub fn pending_cost(&self) -> (usize, usize) {
        let runs = self.runs.iter().filter(|r| r.vertices > 0).count();
        (runs * RUN_WORDS, runs)
    }

    /// Start or continue a run of rectangles with the given vertex size.
    pub fn start_rectangles(&mut self, floats_per_vertex: u32) {
        if self.needs_new_run(floats_per_vertex) {
            self.runs.retain(|r| r.vertices > 0);
            self.runs.push(VertexRun {
                floats_per_vertex,
                start: self.data.len(),
                vertices: 0,
            });
        }
    }

    /// Append one rectangle (three vertices).
    ///
    /// `Ok(false)` means the staging area or the current run is full and the
    /// buffer must be finished before retrying.
    pub fn add_rectangle(&mut self, vertices: &[f32]) -> Result<bool> {
        let Some(run) = self.runs.last_mut() else {
            return Err(Error::InvalidSize {
                width: vertices.len() as u32,
                height: 0,
            });
        };
        let expected = (run.floats_per_vertex * RECT_VERTICES) as usize;
        if vertices.len() != expected {
            return Err(Error::InvalidSize {
                width: vertices.len() as u32,
                height: expected as u32,
            });
        }
        if self.data.len() + expected > VERTEX_FLOATS || run.vertices + RECT_VERTICES > MAX_RUN_VERTICES {
            return Ok(false);
        }
        self.data.extend_from_slice(vertices);
        run.vertices += RECT_VERTICES;
        Ok(true)
    }

    /// Drop staged geometry without drawing it.
    pub fn reset(&mut self) {
        self.data.clear();
        self.runs.clear();
    }

    /// Upload staged vertices and emit their primitives into `batch`.
    ///
    /// The batch must have room for [`pending_cost`](Self::pending_cost);
    /// if it does not the staged geometry cannot be drawn and an error is
    /// returned with the staging area left intact.
    pub fn finish(&mut self, batch: &mut Batch, cache: &mut BoCache) -> Result<()> {
        let (words, relocs) = self.pending_cost();
        if relocs == 0 {
            self.reset();
            return Ok(());
        }
        let size = self.used_bytes() as u64;
        if !batch.has_space(words, relocs)? || !batch.gtt_fits(size) {
            return Err(Error::PrimitiveTooLarge { words, relocs });
        }

        let mut bytes = vec![0u8; self.used_bytes()];
        LittleEndian::write_f32_into(&self.data, &mut bytes);
        let vbo = cache.create(size, BoUsage::Vertex, Tiling::None, 0)?;
        vbo.write(0, &bytes)?;

        for run in self.runs.iter().filter(|r| r.vertices > 0) {
            batch.emit(_3DSTATE_LOAD_STATE_IMMEDIATE_1 | i1_load_s(0) | i1_load_s(1) | 1);
            batch
                .emit_reloc(&vbo, (run.start * 4) as u32, Domains::VERTEX, Domains::empty())
                .map_err(|_| Error::PrimitiveTooLarge { words, relocs })?;
            batch.emit(s1_vertex_format(run.floats_per_vertex));
            batch.emit(PRIM3D | PRIM3D_RECTLIST | PRIM3D_INDIRECT_SEQUENTIAL | run.vertices);
            batch.emit(0);
        }
        log::trace!(
            "vertex_buffer: flushed {} vertices in {} runs ({} bytes)",
            self.vertex_count(),
            relocs,
            size
        );
        self.reset();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drmsurf_kernel::SoftGem;
    use std::sync::Arc;

    #[test]
    fn test_runs_split_on_vertex_size() {
        let mut vb = VertexBuffer::new();
        vb.start_rectangles(2);
        assert!(vb.add_rectangle(&[0.0; 6]).unwrap());
        vb.start_rectangles(2);
        assert!(vb.add_rectangle(&[1.0; 6]).unwrap());
        vb.start_rectangles(4);
        assert!(vb.add_rectangle(&[2.0; 12]).unwrap());
        assert_eq!(vb.pending_cost(), (2 * RUN_WORDS, 2));
        assert_eq!(vb.vertex_count(), 9);
        assert_eq!(vb.used_bytes(), 24 * 4);
    }

    #[test]
    fn test_wrong_vertex_count_rejected() {
        let mut vb = VertexBuffer::new();
        assert!(vb.add_rectangle(&[0.0; 6]).is_err());
        vb.start_rectangles(2);
        assert!(vb.add_rectangle(&[0.0; 4]).is_err());
    }

    #[test]
    fn test_staging_full() {
        let mut vb = VertexBuffer::new();
        vb.start_rectangles(8);
        let rect = [0.5f32; 24];
        let fits = VERTEX_FLOATS / rect.len();
        for _ in 0..fits {
            assert!(vb.add_rectangle(&rect).unwrap());
        }
        assert!(!vb.add_rectangle(&rect).unwrap());
    }

    #[test]
    fn test_finish_emits_runs() {
        let gem = Arc::new(SoftGem::new());
        let mut cache = BoCache::new(gem.clone(), 4);
        let mut batch = Batch::new(1 << 28);
        let mut vb = VertexBuffer::new();

        vb.start_rectangles(2);
        vb.add_rectangle(&[0.0, 0.0, 10.0, 0.0, 10.0, 10.0]).unwrap();
        vb.start_rectangles(4);
        vb.add_rectangle(&[1.0; 12]).unwrap();
        vb.finish(&mut batch, &mut cache).unwrap();

        assert!(vb.is_empty());
        let words = batch.words();
        assert_eq!(words.len(), 2 * RUN_WORDS);
        assert_eq!(words[2], s1_vertex_format(2));
        assert_eq!(words[3], PRIM3D | PRIM3D_RECTLIST | PRIM3D_INDIRECT_SEQUENTIAL | 3);
        assert_eq!(words[7], s1_vertex_format(4));
        // One vertex BO shared by both runs; the second starts after 6 floats.
        assert_eq!(batch.exec_objects().len(), 1);
        assert_eq!(batch.relocations()[1].delta, 24);

        let vbo = &batch.targets()[0];
        let mut out = [0u8; 12];
        vbo.read(0, &mut out).unwrap();
        assert_eq!(LittleEndian::read_f32(&out[8..]), 10.0);
    }

    #[test]
    fn test_finish_empty_is_noop() {
        let gem = Arc::new(SoftGem::new());
        let mut cache = BoCache::new(gem.clone(), 4);
        let mut batch = Batch::new(1 << 28);
        let mut vb = VertexBuffer::new();
        vb.start_rectangles(2);
        vb.finish(&mut batch, &mut cache).unwrap();
        assert!(batch.is_empty());
        assert_eq!(gem.stats().creates, 0);
    }
}

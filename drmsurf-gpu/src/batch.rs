// SPDX-FileCopyrightText: 2025 drmsurf contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Batch buffer construction and submission.
//!
//! A [`Batch`] accumulates command dwords together with the exec-object and
//! relocation tables that go with them. Targets are deduplicated by GEM
//! handle; each relocation names its target by exec-table index
//! (`HANDLE_LUT`), and the batch object itself is appended as the final exec
//! entry at commit time.

use std::collections::HashMap;
use std::iter;

use byteorder::{ByteOrder, LittleEndian};

use drmsurf_common::{GemHandle, Tiling};
use drmsurf_kernel::abi::{Domains, ExecFlags, ExecObject2, RelocationEntry, BATCH_SIZE, MAX_RELOCS};
use drmsurf_kernel::ExecRequest;

use crate::bo::{BoRef, BoUsage};
use crate::bo_cache::BoCache;
use crate::commands::{MI_BATCH_BUFFER_END, MI_NOOP};
use crate::decoder;
use crate::error::{BatchFull, Error, Result};

/// Command dwords a batch can hold.
pub const BATCH_WORDS: usize = BATCH_SIZE / 4;

/// Dwords kept free for `MI_BATCH_BUFFER_END` and its padding.
const RESERVED_WORDS: usize = 2;

/// Exec entries available to targets; the last slot belongs to the batch.
pub const MAX_TARGETS: usize = MAX_RELOCS - 1;

/// A submitted batch and every object it keeps alive until it retires.
#[derive(Debug)]
pub struct InFlightBatch {
    pub epoch: u64,
    pub batch_bo: BoRef,
    pub bos: Vec<BoRef>,
}

impl InFlightBatch {
    /// Whether the GPU has finished the batch.
    pub fn is_complete(&self) -> bool {
        self.batch_bo.is_inactive()
    }

    /// Number of buffer objects held, the batch object included.
    pub fn bo_count(&self) -> usize {
        self.bos.len() + 1
    }
}

pub struct Batch {
    words: Vec<u32>,
    exec: Vec<ExecObject2>,
    targets: Vec<BoRef>,
    index: HashMap<GemHandle, u32>,
    relocs: Vec<RelocationEntry>,
    gtt_size: u64,
    gtt_budget: u64,
    dump: bool,
}

impl Batch {
    pub fn new(gtt_budget: u64) -> Self {
        Self {
            words: Vec::with_capacity(BATCH_WORDS),
            exec: Vec::new(),
            targets: Vec::new(),
            index: HashMap::new(),
            relocs: Vec::new(),
            gtt_size: 0,
            gtt_budget,
            dump: false,
        }
    }

    /// Log every committed batch through the command decoder.
    pub fn set_dump(&mut self, dump: bool) {
        self.dump = dump;
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn relocations(&self) -> &[RelocationEntry] {
        &self.relocs
    }

    pub fn exec_objects(&self) -> &[ExecObject2] {
        &self.exec
    }

    pub fn targets(&self) -> &[BoRef] {
        &self.targets
    }

    pub fn gtt_size(&self) -> u64 {
        self.gtt_size
    }

    pub fn gtt_budget(&self) -> u64 {
        self.gtt_budget
    }

    pub fn contains(&self, bo: &BoRef) -> bool {
        self.index.contains_key(&bo.handle())
    }

    /// Whether `extra` more bytes of new targets stay inside the GTT budget.
    /// An empty batch accepts anything.
    pub fn gtt_fits(&self, extra: u64) -> bool {
        self.exec.is_empty() || self.gtt_size + extra <= self.gtt_budget
    }

    /// Whether `words` more dwords and `relocs` more relocations fit.
    ///
    /// `Ok(false)` means the batch must be committed first; a request that
    /// would not fit even an empty batch is an error.
    pub fn has_space(&self, words: usize, relocs: usize) -> Result<bool> {
        if words + RESERVED_WORDS > BATCH_WORDS || relocs > MAX_TARGETS {
            return Err(Error::PrimitiveTooLarge { words, relocs });
        }
        Ok(self.words.len() + words + RESERVED_WORDS <= BATCH_WORDS
            && self.relocs.len() + relocs <= MAX_RELOCS
            && self.exec.len() + relocs <= MAX_TARGETS)
    }

    pub fn emit(&mut self, word: u32) {
        self.words.push(word);
    }

    pub fn emit_all(&mut self, words: &[u32]) {
        self.words.extend_from_slice(words);
    }

    /// Emit the address of `bo` plus `delta` and record a relocation for it.
    ///
    /// The dword written is the object's presumed address; the kernel patches
    /// it if the object moved. Returns [`BatchFull`] when the relocation
    /// table, the exec table or the GTT budget would overflow.
    pub fn emit_reloc(
        &mut self,
        bo: &BoRef,
        delta: u32,
        read_domains: Domains,
        write_domain: Domains,
    ) -> std::result::Result<(), BatchFull> {
        if self.relocs.len() >= MAX_RELOCS || self.words.len() + 1 + RESERVED_WORDS > BATCH_WORDS {
            return Err(BatchFull);
        }

        let target = match self.index.get(&bo.handle()) {
            Some(&index) => index,
            None => {
                if self.exec.len() >= MAX_TARGETS {
                    return Err(BatchFull);
                }
                // An oversized object still goes into an empty batch alone.
                if !self.exec.is_empty() && self.gtt_size + bo.size() > self.gtt_budget {
                    log::debug!(
                        "batch: GTT budget exhausted ({} + {} > {})",
                        self.gtt_size,
                        bo.size(),
                        self.gtt_budget
                    );
                    return Err(BatchFull);
                }
                let index = self.exec.len() as u32;
                self.exec.push(ExecObject2::new(bo.handle(), bo.presumed_offset()));
                self.targets.push(BoRef::clone(bo));
                self.index.insert(bo.handle(), index);
                self.gtt_size += bo.size();
                index
            }
        };

        let presumed = bo.presumed_offset();
        self.relocs.push(RelocationEntry {
            target_handle: target,
            delta,
            offset: (self.words.len() * 4) as u64,
            presumed_offset: presumed,
            read_domains: read_domains.bits(),
            write_domain: write_domain.bits(),
        });
        bo.add_batch_domains(read_domains, write_domain);
        self.words.push((presumed as u32).wrapping_add(delta));
        Ok(())
    }

    /// Drop everything recorded so far.
    pub fn reset(&mut self) {
        self.words.clear();
        self.exec.clear();
        self.targets.clear();
        self.index.clear();
        self.relocs.clear();
        self.gtt_size = 0;
    }

    /// Submit the batch. Returns `None` when there was nothing to submit.
    ///
    /// The batch is reset whether or not submission succeeds.
    pub fn commit(&mut self, cache: &mut BoCache, epoch: u64) -> Result<Option<InFlightBatch>> {
        if self.words.is_empty() {
            return Ok(None);
        }

        let mut words = std::mem::replace(&mut self.words, Vec::with_capacity(BATCH_WORDS));
        let mut exec = std::mem::take(&mut self.exec);
        let targets = std::mem::take(&mut self.targets);
        let relocs = std::mem::take(&mut self.relocs);
        self.reset();

        words.push(MI_BATCH_BUFFER_END);
        if words.len() % 2 != 0 {
            words.push(MI_NOOP);
        }

        if self.dump {
            log::debug!("batch: epoch {}\n{}", epoch, decoder::dump(&words));
        }

        let mut bytes = vec![0u8; words.len() * 4];
        LittleEndian::write_u32_into(&words, &mut bytes);

        let batch_bo = cache.create(bytes.len() as u64, BoUsage::Batch, Tiling::None, 0)?;
        batch_bo.write(0, &bytes)?;

        let mut batch_entry = ExecObject2::new(batch_bo.handle(), batch_bo.presumed_offset());
        batch_entry.relocation_count = relocs.len() as u32;
        exec.push(batch_entry);

        let mut request = ExecRequest {
            objects: &mut exec,
            relocs: &relocs,
            batch_len: bytes.len() as u32,
            flags: ExecFlags::RENDER | ExecFlags::HANDLE_LUT,
        };
        cache.driver().execbuffer(&mut request)?;

        for (entry, bo) in exec.iter().zip(targets.iter().chain(iter::once(&batch_bo))) {
            bo.set_presumed_offset(entry.offset);
            bo.mark_busy();
        }

        log::trace!(
            "batch: committed epoch {} ({} dwords, {} objects, {} relocations)",
            epoch,
            words.len(),
            exec.len(),
            relocs.len()
        );

        Ok(Some(InFlightBatch {
            epoch,
            batch_bo,
            bos: targets,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drmsurf_kernel::{GemDriver, RetireMode, SoftGem};
    use std::sync::Arc;

    fn setup(mode: RetireMode) -> (Arc<SoftGem>, BoCache) {
        let gem = Arc::new(SoftGem::with_mode(mode));
        let cache = BoCache::new(gem.clone(), 8);
        (gem, cache)
    }

    #[test]
    fn test_commit_empty_is_noop() {
        let (gem, mut cache) = setup(RetireMode::Immediate);
        let mut batch = Batch::new(1 << 28);
        assert!(batch.commit(&mut cache, 1).unwrap().is_none());
        assert_eq!(gem.stats().execbuffers, 0);
    }

    #[test]
    fn test_relocations_dedupe_targets() {
        let (_gem, mut cache) = setup(RetireMode::Immediate);
        let a = cache.create(4096, BoUsage::Render, Tiling::None, 0).unwrap();
        let b = cache.create(4096, BoUsage::Texture, Tiling::None, 0).unwrap();
        let mut batch = Batch::new(1 << 28);
        batch.emit_reloc(&a, 0, Domains::RENDER, Domains::RENDER).unwrap();
        batch.emit_reloc(&b, 16, Domains::SAMPLER, Domains::empty()).unwrap();
        batch.emit_reloc(&a, 64, Domains::RENDER, Domains::RENDER).unwrap();

        assert_eq!(batch.exec_objects().len(), 2);
        assert_eq!(batch.relocations().len(), 3);
        assert_eq!(batch.relocations()[2].target_handle, 0);
        assert_eq!(batch.relocations()[2].offset, 8);
        assert!(batch
            .relocations()
            .iter()
            .all(|r| (r.target_handle as usize) < batch.exec_objects().len()));
    }

    #[test]
    fn test_commit_patches_addresses() {
        let (gem, mut cache) = setup(RetireMode::OnWait);
        let target = cache.create(8192, BoUsage::Render, Tiling::None, 0).unwrap();
        let mut batch = Batch::new(1 << 28);
        batch.emit(0x7d8e_0001);
        batch.emit(0);
        batch.emit_reloc(&target, 0x40, Domains::RENDER, Domains::RENDER).unwrap();

        let inflight = batch.commit(&mut cache, 7).unwrap().unwrap();
        assert!(batch.is_empty());
        assert_eq!(inflight.epoch, 7);
        assert_eq!(inflight.bo_count(), 2);
        assert!(target.is_busy());
        assert!(!inflight.is_complete());

        let sub = gem.last_submission().unwrap();
        assert_eq!(sub.relocation_count, 1);
        // Three dwords plus BATCH_BUFFER_END, already even.
        assert_eq!(sub.words.len(), 4);
        assert_eq!(sub.words[3], MI_BATCH_BUFFER_END);
        let (handle, offset) = gem.resolve_gtt(sub.words[2] as u64).unwrap();
        assert_eq!(handle, target.handle());
        assert_eq!(offset, 0x40);
        assert_eq!(target.presumed_offset() + 0x40, sub.words[2] as u64);

        inflight.batch_bo.wait(None).unwrap();
        assert!(inflight.is_complete());
    }

    #[test]
    fn test_gtt_budget_forces_flush() {
        let (_gem, mut cache) = setup(RetireMode::Immediate);
        let a = cache.create(64 * 1024, BoUsage::Render, Tiling::None, 0).unwrap();
        let b = cache.create(64 * 1024, BoUsage::Render, Tiling::None, 0).unwrap();
        let mut batch = Batch::new(96 * 1024);
        batch.emit_reloc(&a, 0, Domains::RENDER, Domains::RENDER).unwrap();
        assert_eq!(batch.emit_reloc(&b, 0, Domains::RENDER, Domains::RENDER), Err(BatchFull));
        // Already-present targets cost nothing more.
        batch.emit_reloc(&a, 4, Domains::RENDER, Domains::RENDER).unwrap();
        assert!(!batch.gtt_fits(64 * 1024));
        assert!(batch.gtt_fits(32 * 1024));
        batch.commit(&mut cache, 1).unwrap();
        batch.emit_reloc(&b, 0, Domains::RENDER, Domains::RENDER).unwrap();
    }

    #[test]
    fn test_relocation_limit() {
        let (_gem, mut cache) = setup(RetireMode::Immediate);
        let bo = cache.create(4096, BoUsage::Render, Tiling::None, 0).unwrap();
        let mut batch = Batch::new(1 << 28);
        for _ in 0..MAX_RELOCS {
            batch.emit_reloc(&bo, 0, Domains::SAMPLER, Domains::empty()).unwrap();
        }
        assert_eq!(batch.emit_reloc(&bo, 0, Domains::SAMPLER, Domains::empty()), Err(BatchFull));
        assert!(!batch.has_space(0, 1).unwrap());
        let inflight = batch.commit(&mut cache, 1).unwrap().unwrap();
        assert_eq!(inflight.bos.len(), 1);
    }

    #[test]
    fn test_primitive_too_large() {
        let batch = Batch::new(1 << 28);
        assert!(batch.has_space(100, 2).unwrap());
        assert!(matches!(
            batch.has_space(BATCH_WORDS, 0),
            Err(Error::PrimitiveTooLarge { .. })
        ));
    }

    #[test]
    fn test_failed_commit_resets() {
        let (gem, mut cache) = setup(RetireMode::Immediate);
        let bo = cache.create(4096, BoUsage::Render, Tiling::None, 0).unwrap();
        let mut batch = Batch::new(1 << 28);
        batch.emit_reloc(&bo, 0, Domains::RENDER, Domains::RENDER).unwrap();
        // Closing the handle behind the cache's back makes execbuffer fail.
        gem.close(bo.handle());
        assert!(batch.commit(&mut cache, 1).is_err());
        assert!(batch.is_empty());
        assert!(batch.targets().is_empty());
    }
}

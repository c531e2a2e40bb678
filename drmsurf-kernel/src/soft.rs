// SPDX-FileCopyrightText: 2025 drmsurf contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! In-process GEM driver.
//!
//! `SoftGem` keeps object storage in anonymous mappings, binds objects into a
//! modelled GTT on execbuffer, applies relocations to the batch exactly as the
//! kernel would, and tracks completion on a [`FenceTimeline`]. Nothing is
//! executed; submitted batches are recorded for inspection instead.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use memmap2::MmapMut;
use parking_lot::Mutex;

use drmsurf_common::{align_up, GemHandle, GemName, GttOffset, Tiling, PAGE_SIZE_U64};

use crate::abi::{Domains, ExecFlags, Madvise};
use crate::driver::{Aperture, ExecRequest, GemDriver, GemError, GemResult, Mapping};
use crate::fence::{FenceTimeline, Seqno};
use crate::gtt::{GttSpace, ObjectId};
use crate::handle_table::HandleTable;

/// Default modelled aperture (256 MiB).
pub const DEFAULT_APERTURE: u64 = 256 * 1024 * 1024;

/// PCI id reported by default (965G).
pub const DEFAULT_CHIP_ID: u32 = 0x29a2;

/// Number of recent submissions kept for inspection.
const SUBMISSION_HISTORY: usize = 32;

static NEXT_FAKE_FD: AtomicI32 = AtomicI32::new(1000);

/// When submitted batches complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetireMode {
    /// Complete as soon as they are submitted.
    Immediate,
    /// Stay busy until someone waits on an object they reference.
    #[default]
    OnWait,
    /// Stay busy until [`SoftGem::retire_through`] or [`SoftGem::retire_all`].
    /// Waits block on the timeline.
    Manual,
}

/// Call counters, for tests and the smoke run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SoftStats {
    pub creates: u64,
    pub closes: u64,
    pub opens: u64,
    pub flinks: u64,
    pub execbuffers: u64,
    pub waits: u64,
    pub throttles: u64,
    pub preads: u64,
    pub pwrites: u64,
    pub madvises: u64,
}

/// A recorded execbuffer, with relocations already applied.
#[derive(Debug, Clone)]
pub struct Submission {
    pub seqno: Seqno,
    pub words: Vec<u32>,
    pub objects: Vec<(GemHandle, GttOffset)>,
    pub relocation_count: usize,
}

struct ObjectState {
    tiling: Tiling,
    stride: u32,
    madv: Madvise,
    purged: bool,
    name: Option<GemName>,
    handles: usize,
    last_seqno: Seqno,
    read_domains: Domains,
    write_domain: Domains,
}

struct SoftObject {
    id: ObjectId,
    size: u64,
    storage: Arc<Mapping>,
    state: Mutex<ObjectState>,
}

impl SoftObject {
    fn check_live(&self) -> GemResult<()> {
        if self.state.lock().purged {
            return Err(einval("object purged"));
        }
        Ok(())
    }
}

struct SoftState {
    handles: HandleTable<Arc<SoftObject>>,
    objects: HashMap<ObjectId, Arc<SoftObject>>,
    names: HashMap<GemName, Arc<SoftObject>>,
    next_name: GemName,
    gtt: GttSpace,
    stats: SoftStats,
    submissions: VecDeque<Submission>,
}

pub struct SoftGem {
    fd: i32,
    chip_id: u32,
    mode: RetireMode,
    tiling_supported: bool,
    next_id: AtomicU32,
    timeline: FenceTimeline,
    state: Mutex<SoftState>,
}

fn einval(what: &str) -> GemError {
    GemError::Io(io::Error::new(io::ErrorKind::InvalidInput, what.to_string()))
}

impl SoftGem {
    pub fn new() -> Self {
        Self::with_mode(RetireMode::default())
    }

    pub fn with_mode(mode: RetireMode) -> Self {
        Self {
            fd: NEXT_FAKE_FD.fetch_add(1, Ordering::Relaxed),
            chip_id: DEFAULT_CHIP_ID,
            mode,
            tiling_supported: true,
            next_id: AtomicU32::new(1),
            timeline: FenceTimeline::new(),
            state: Mutex::new(SoftState {
                handles: HandleTable::new(),
                objects: HashMap::new(),
                names: HashMap::new(),
                next_name: 1,
                gtt: GttSpace::new(DEFAULT_APERTURE),
                stats: SoftStats::default(),
                submissions: VecDeque::new(),
            }),
        }
    }

    pub fn with_chip_id(mut self, chip_id: u32) -> Self {
        self.chip_id = chip_id;
        self
    }

    pub fn with_aperture(self, size: u64) -> Self {
        self.state.lock().gtt = GttSpace::new(size);
        self
    }

    /// Model a kernel that silently refuses every tiling request.
    pub fn without_tiling(mut self) -> Self {
        self.tiling_supported = false;
        self
    }

    pub fn mode(&self) -> RetireMode {
        self.mode
    }

    pub fn timeline(&self) -> &FenceTimeline {
        &self.timeline
    }

    pub fn stats(&self) -> SoftStats {
        self.state.lock().stats
    }

    /// Number of live kernel objects (not handles).
    pub fn live_objects(&self) -> usize {
        self.state.lock().objects.len()
    }

    pub fn live_handles(&self) -> usize {
        self.state.lock().handles.len()
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().submissions.iter().cloned().collect()
    }

    pub fn last_submission(&self) -> Option<Submission> {
        self.state.lock().submissions.back().cloned()
    }

    pub fn retire_through(&self, seqno: Seqno) {
        self.timeline.signal(seqno);
    }

    pub fn retire_all(&self) {
        self.timeline.signal_all();
    }

    /// Tiling and stride currently recorded for `handle`.
    pub fn tiling_of(&self, handle: GemHandle) -> GemResult<(Tiling, u32)> {
        let obj = self.lookup(handle)?;
        let st = obj.state.lock();
        Ok((st.tiling, st.stride))
    }

    /// Read and write domains from the last `set_domain`.
    pub fn domains_of(&self, handle: GemHandle) -> GemResult<(Domains, Domains)> {
        let obj = self.lookup(handle)?;
        let st = obj.state.lock();
        Ok((st.read_domains, st.write_domain))
    }

    pub fn is_purgeable(&self, handle: GemHandle) -> GemResult<bool> {
        let obj = self.lookup(handle)?;
        let st = obj.state.lock();
        Ok(st.madv == Madvise::DontNeed)
    }

    /// Discard the pages of every idle object marked `DontNeed`, the way the
    /// kernel shrinker does under memory pressure. Returns how many were purged.
    pub fn purge(&self) -> usize {
        let state = self.state.lock();
        let mut purged = 0;
        for obj in state.objects.values() {
            let mut st = obj.state.lock();
            if st.madv == Madvise::DontNeed && !st.purged && self.timeline.is_complete(st.last_seqno) {
                st.purged = true;
                let _ = obj.storage.fill(0, obj.storage.len(), 0);
                purged += 1;
            }
        }
        log::debug!("soft_gem: purged {} objects", purged);
        purged
    }

    /// Resolve a GTT address from a submitted batch to `(handle, offset)`.
    pub fn resolve_gtt(&self, addr: GttOffset) -> Option<(GemHandle, u64)> {
        let state = self.state.lock();
        let (id, offset) = state.gtt.translate(addr)?;
        state
            .handles
            .iter()
            .filter(|(_, obj)| obj.id == id)
            .map(|(handle, _)| handle)
            .min()
            .map(|handle| (handle, offset))
    }

    fn lookup(&self, handle: GemHandle) -> GemResult<Arc<SoftObject>> {
        self.state.lock().handles.get(handle).cloned()
    }

    fn wait_object(&self, handle: GemHandle, obj: &SoftObject, timeout: Option<Duration>) -> GemResult<()> {
        let seqno = obj.state.lock().last_seqno;
        if seqno == 0 || self.timeline.is_complete(seqno) {
            return Ok(());
        }
        match self.mode {
            RetireMode::Manual => {
                if self.timeline.wait(seqno, timeout) {
                    Ok(())
                } else {
                    Err(GemError::Timeout(handle))
                }
            }
            RetireMode::Immediate | RetireMode::OnWait => {
                self.timeline.signal(seqno);
                Ok(())
            }
        }
    }
}

impl Default for SoftGem {
    fn default() -> Self {
        Self::new()
    }
}

impl GemDriver for SoftGem {
    fn name(&self) -> &str {
        "soft"
    }

    fn fd(&self) -> i32 {
        self.fd
    }

    fn chip_id(&self) -> GemResult<u32> {
        Ok(self.chip_id)
    }

    fn aperture(&self) -> GemResult<Aperture> {
        let state = self.state.lock();
        Ok(Aperture {
            size: state.gtt.size(),
            available: state.gtt.size() - state.gtt.used(),
        })
    }

    fn create(&self, size: u64) -> GemResult<GemHandle> {
        if size == 0 {
            return Err(einval("zero-sized object"));
        }
        let size = align_up(size, PAGE_SIZE_U64);
        let len = usize::try_from(size).map_err(|_| GemError::OutOfMemory(size))?;
        let map = MmapMut::map_anon(len).map_err(|_| GemError::OutOfMemory(size))?;

        let obj = Arc::new(SoftObject {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            size,
            storage: Arc::new(Mapping::from_mmap(map)),
            state: Mutex::new(ObjectState {
                tiling: Tiling::None,
                stride: 0,
                madv: Madvise::WillNeed,
                purged: false,
                name: None,
                handles: 1,
                last_seqno: 0,
                read_domains: Domains::CPU,
                write_domain: Domains::CPU,
            }),
        });

        let mut state = self.state.lock();
        let handle = state.handles.add(Arc::clone(&obj))?;
        state.objects.insert(obj.id, obj);
        state.stats.creates += 1;
        log::trace!("soft_gem: create handle={} size=0x{:X}", handle, size);
        Ok(handle)
    }

    fn close(&self, handle: GemHandle) {
        let mut state = self.state.lock();
        let obj = match state.handles.close(handle) {
            Ok(obj) => obj,
            Err(e) => {
                log::warn!("soft_gem: close: {}", e);
                return;
            }
        };
        state.stats.closes += 1;

        let last = {
            let mut st = obj.state.lock();
            st.handles -= 1;
            st.handles == 0
        };
        if last {
            state.names.retain(|_, o| !Arc::ptr_eq(o, &obj));
            state.gtt.unbind(obj.id);
            state.objects.remove(&obj.id);
            log::trace!("soft_gem: destroyed object {}", obj.id);
        }
    }

    fn flink(&self, handle: GemHandle) -> GemResult<GemName> {
        let mut state = self.state.lock();
        let obj = state.handles.get(handle)?.clone();
        state.stats.flinks += 1;
        let mut st = obj.state.lock();
        if let Some(name) = st.name {
            return Ok(name);
        }
        let name = state.next_name;
        state.next_name += 1;
        st.name = Some(name);
        drop(st);
        state.names.insert(name, obj);
        Ok(name)
    }

    fn open(&self, name: GemName) -> GemResult<(GemHandle, u64)> {
        let mut state = self.state.lock();
        let obj = state
            .names
            .get(&name)
            .cloned()
            .ok_or(GemError::InvalidName(name))?;
        let handle = state.handles.add(Arc::clone(&obj))?;
        obj.state.lock().handles += 1;
        state.stats.opens += 1;
        Ok((handle, obj.size))
    }

    fn set_tiling(&self, handle: GemHandle, tiling: Tiling, stride: u32) -> GemResult<Tiling> {
        let obj = self.lookup(handle)?;
        if !tiling.stride_is_valid(stride) {
            return Err(einval("stride does not fit tiling"));
        }
        let applied = if self.tiling_supported { tiling } else { Tiling::None };
        let mut st = obj.state.lock();
        st.tiling = applied;
        st.stride = if applied == Tiling::None { 0 } else { stride };
        Ok(applied)
    }

    fn mmap(&self, handle: GemHandle, size: u64) -> GemResult<Mapping> {
        let obj = self.lookup(handle)?;
        obj.check_live()?;
        if size > obj.size {
            return Err(GemError::OutOfBounds {
                offset: 0,
                len: size as usize,
                size: obj.size,
            });
        }
        Ok(Mapping::share(&obj.storage))
    }

    fn pread(&self, handle: GemHandle, offset: u64, dst: &mut [u8]) -> GemResult<()> {
        let obj = self.lookup(handle)?;
        obj.check_live()?;
        self.state.lock().stats.preads += 1;
        obj.storage.read(offset as usize, dst)
    }

    fn pwrite(&self, handle: GemHandle, offset: u64, src: &[u8]) -> GemResult<()> {
        let obj = self.lookup(handle)?;
        obj.check_live()?;
        self.state.lock().stats.pwrites += 1;
        obj.storage.write(offset as usize, src)
    }

    fn set_domain(&self, handle: GemHandle, read: Domains, write: Domains) -> GemResult<()> {
        let obj = self.lookup(handle)?;
        if read.intersects(Domains::CPU | Domains::GTT) {
            self.wait_object(handle, &obj, None)?;
        }
        let mut st = obj.state.lock();
        st.read_domains = read;
        st.write_domain = write;
        Ok(())
    }

    fn madvise(&self, handle: GemHandle, advice: Madvise) -> GemResult<bool> {
        let obj = self.lookup(handle)?;
        self.state.lock().stats.madvises += 1;
        let mut st = obj.state.lock();
        st.madv = advice;
        Ok(!st.purged)
    }

    fn busy(&self, handle: GemHandle) -> GemResult<bool> {
        let obj = self.lookup(handle)?;
        let seqno = obj.state.lock().last_seqno;
        Ok(seqno != 0 && !self.timeline.is_complete(seqno))
    }

    fn wait(&self, handle: GemHandle, timeout: Option<Duration>) -> GemResult<()> {
        let obj = self.lookup(handle)?;
        self.state.lock().stats.waits += 1;
        self.wait_object(handle, &obj, timeout)
    }

    fn execbuffer(&self, request: &mut ExecRequest<'_>) -> GemResult<()> {
        let mut state = self.state.lock();
        let count = request.objects.len();
        if count == 0 {
            return Err(GemError::InvalidExec("empty object list".into()));
        }
        if !request.flags.contains(ExecFlags::HANDLE_LUT) {
            return Err(GemError::InvalidExec("relocations must use HANDLE_LUT".into()));
        }
        if request.objects[count - 1].relocation_count as usize != request.relocs.len() {
            return Err(GemError::InvalidExec(format!(
                "batch carries {} relocations, {} supplied",
                request.objects[count - 1].relocation_count,
                request.relocs.len()
            )));
        }

        let mut objs = Vec::with_capacity(count);
        for entry in request.objects.iter() {
            let obj = state.handles.get(entry.handle)?.clone();
            obj.check_live()?;
            if objs.iter().any(|o: &Arc<SoftObject>| o.id == obj.id) {
                return Err(GemError::InvalidExec(format!(
                    "object {} listed twice",
                    entry.handle
                )));
            }
            objs.push(obj);
        }

        let batch = &objs[count - 1];
        let batch_len = request.batch_len as usize;
        if batch_len == 0 || batch_len % 8 != 0 || batch_len as u64 > batch.size {
            return Err(GemError::InvalidExec(format!("bad batch length {}", batch_len)));
        }

        // Bind, evicting idle objects outside this submission if the aperture is full.
        let mut evicted = false;
        for obj in &objs {
            if state.gtt.bind(obj.id, obj.size).is_some() {
                continue;
            }
            if !evicted {
                evicted = true;
                let victims: Vec<ObjectId> = state
                    .gtt
                    .bound_objects()
                    .into_iter()
                    .filter(|id| !objs.iter().any(|o| o.id == *id))
                    .filter(|id| {
                        state
                            .objects
                            .get(id)
                            .is_some_and(|o| self.timeline.is_complete(o.state.lock().last_seqno))
                    })
                    .collect();
                for id in victims {
                    state.gtt.unbind(id);
                }
                if state.gtt.bind(obj.id, obj.size).is_some() {
                    continue;
                }
            }
            return Err(GemError::NoSpace(count));
        }

        let mut word = [0u8; 4];
        for reloc in request.relocs {
            let target = reloc.target_handle as usize;
            if target >= count {
                return Err(GemError::InvalidExec(format!(
                    "relocation target index {} out of {} objects",
                    target, count
                )));
            }
            if reloc.offset % 4 != 0 || reloc.offset + 4 > batch_len as u64 {
                return Err(GemError::InvalidExec(format!(
                    "relocation at 0x{:X} outside batch",
                    reloc.offset
                )));
            }
            let base = state.gtt.offset_of(objs[target].id).unwrap_or(0);
            LittleEndian::write_u32(&mut word, (base as u32).wrapping_add(reloc.delta));
            batch.storage.write(reloc.offset as usize, &word)?;
        }

        let seqno = self.timeline.next();
        let mut bound = Vec::with_capacity(count);
        for (entry, obj) in request.objects.iter_mut().zip(&objs) {
            entry.offset = state.gtt.offset_of(obj.id).unwrap_or(0);
            obj.state.lock().last_seqno = seqno;
            bound.push((entry.handle, entry.offset));
        }

        let mut bytes = vec![0u8; batch_len];
        batch.storage.read(0, &mut bytes)?;
        let words = bytes.chunks_exact(4).map(LittleEndian::read_u32).collect();
        if state.submissions.len() == SUBMISSION_HISTORY {
            state.submissions.pop_front();
        }
        state.submissions.push_back(Submission {
            seqno,
            words,
            objects: bound,
            relocation_count: request.relocs.len(),
        });
        state.stats.execbuffers += 1;
        drop(state);

        log::trace!(
            "soft_gem: execbuffer seqno={} objects={} relocs={} len={}",
            seqno,
            count,
            request.relocs.len(),
            batch_len
        );

        if self.mode == RetireMode::Immediate {
            self.timeline.signal(seqno);
        }
        Ok(())
    }

    fn throttle(&self) -> GemResult<()> {
        self.state.lock().stats.throttles += 1;
        if self.mode != RetireMode::Manual {
            self.timeline.signal_all();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{ExecObject2, RelocationEntry};

    fn submit(gem: &SoftGem, target: GemHandle, batch: GemHandle, words: &[u32], relocs: &[RelocationEntry]) {
        let mut bytes = vec![0u8; words.len() * 4];
        LittleEndian::write_u32_into(words, &mut bytes);
        gem.pwrite(batch, 0, &bytes).unwrap();
        let mut objects = [ExecObject2::new(target, 0), ExecObject2::new(batch, 0)];
        objects[1].relocation_count = relocs.len() as u32;
        gem.execbuffer(&mut ExecRequest {
            objects: &mut objects,
            relocs,
            batch_len: bytes.len() as u32,
            flags: ExecFlags::RENDER | ExecFlags::HANDLE_LUT,
        })
        .unwrap();
    }

    #[test]
    fn test_create_close() {
        let gem = SoftGem::new();
        let h = gem.create(100).unwrap();
        assert_eq!(gem.live_objects(), 1);
        gem.close(h);
        assert_eq!(gem.live_objects(), 0);
        assert!(gem.create(0).is_err());
        assert_eq!(gem.stats().closes, 1);
    }

    #[test]
    fn test_flink_open_shares_storage() {
        let gem = SoftGem::new();
        let h = gem.create(4096).unwrap();
        gem.pwrite(h, 16, &[9, 8, 7]).unwrap();
        let name = gem.flink(h).unwrap();
        assert_eq!(gem.flink(h).unwrap(), name);

        let (h2, size) = gem.open(name).unwrap();
        assert_ne!(h, h2);
        assert_eq!(size, 4096);
        let mut out = [0u8; 3];
        gem.pread(h2, 16, &mut out).unwrap();
        assert_eq!(out, [9, 8, 7]);

        gem.close(h);
        assert_eq!(gem.live_objects(), 1);
        gem.close(h2);
        assert_eq!(gem.live_objects(), 0);
        assert!(matches!(gem.open(name), Err(GemError::InvalidName(_))));
    }

    #[test]
    fn test_execbuffer_applies_relocations() {
        let gem = SoftGem::new();
        let target = gem.create(8192).unwrap();
        let batch = gem.create(4096).unwrap();
        let relocs = [RelocationEntry {
            target_handle: 0,
            delta: 0x40,
            offset: 4,
            ..RelocationEntry::default()
        }];
        submit(&gem, target, batch, &[0x1234_0000, 0, 0x0500_0000, 0], &relocs);

        let sub = gem.last_submission().unwrap();
        let target_offset = sub.objects[0].1;
        assert_eq!(sub.words[1] as u64, target_offset + 0x40);
        assert_eq!(gem.resolve_gtt(sub.words[1] as u64), Some((target, 0x40)));
        assert!(gem.busy(target).unwrap());
        gem.wait(target, None).unwrap();
        assert!(!gem.busy(target).unwrap());
    }

    #[test]
    fn test_execbuffer_rejects_bad_target() {
        let gem = SoftGem::new();
        let target = gem.create(4096).unwrap();
        let batch = gem.create(4096).unwrap();
        let relocs = [RelocationEntry {
            target_handle: 5,
            offset: 4,
            ..RelocationEntry::default()
        }];
        let mut objects = [ExecObject2::new(target, 0), ExecObject2::new(batch, 0)];
        objects[1].relocation_count = 1;
        let err = gem
            .execbuffer(&mut ExecRequest {
                objects: &mut objects,
                relocs: &relocs,
                batch_len: 8,
                flags: ExecFlags::RENDER | ExecFlags::HANDLE_LUT,
            })
            .unwrap_err();
        assert!(matches!(err, GemError::InvalidExec(_)));
    }

    #[test]
    fn test_manual_retire_blocks_wait() {
        let gem = Arc::new(SoftGem::with_mode(RetireMode::Manual));
        let target = gem.create(4096).unwrap();
        let batch = gem.create(4096).unwrap();
        submit(&gem, target, batch, &[0, 0], &[]);
        assert!(matches!(
            gem.wait(target, Some(Duration::from_millis(5))),
            Err(GemError::Timeout(_))
        ));

        let retirer = {
            let gem = Arc::clone(&gem);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                gem.retire_all();
            })
        };
        gem.wait(target, Some(Duration::from_secs(5))).unwrap();
        retirer.join().unwrap();
    }

    #[test]
    fn test_madvise_and_purge() {
        let gem = SoftGem::new();
        let h = gem.create(4096).unwrap();
        assert!(gem.madvise(h, Madvise::DontNeed).unwrap());
        assert!(gem.is_purgeable(h).unwrap());
        assert_eq!(gem.purge(), 1);
        assert!(!gem.madvise(h, Madvise::WillNeed).unwrap());
        assert!(gem.mmap(h, 4096).is_err());
    }

    #[test]
    fn test_tiling_refused() {
        let gem = SoftGem::new().without_tiling();
        let h = gem.create(8192).unwrap();
        assert_eq!(gem.set_tiling(h, Tiling::X, 512).unwrap(), Tiling::None);

        let gem = SoftGem::new();
        let h = gem.create(8192).unwrap();
        assert_eq!(gem.set_tiling(h, Tiling::Y, 256).unwrap(), Tiling::Y);
        assert_eq!(gem.tiling_of(h).unwrap(), (Tiling::Y, 256));
        assert!(gem.set_tiling(h, Tiling::X, 100).is_err());
    }
}

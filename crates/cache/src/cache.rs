// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Bounded cache of backend-resident tables.
//!
//! A fixed number of slots, each owning one aligned table-sized buffer.
//! Acquiring a table pins its slot; eviction picks the unpinned slot with
//! the lowest decayed hit count, writes it back if dirty, and refills the
//! buffer. All I/O goes through the write-back queue under the cache's
//! own [`Context`]: table reads observe queued table writes, and dirty
//! tables are queued rather than written directly, so ordering against
//! other producers is expressed with sections and barriers instead of
//! blocking flushes.

use blockq_queue::{BlockBackend, BlockQueue, CacheMode, Context};
use bytes::BytesMut;
use snafu::OptionExt;
use tracing::debug;

use crate::error::{BusySnafu, Result};

/// Hit count a freshly filled table starts with, so it is not evicted
/// before it has had a chance to be used. The number is arbitrary.
const FRESH_HITS: u32 = 32;

/// Handle to a pinned table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableId(usize);

struct Slot {
    buf:    BytesMut,
    offset: Option<u64>,
    hits:   u32,
    pins:   u32,
    dirty:  bool,
}

impl Slot {
    fn new(table_size: usize) -> Self {
        Self {
            buf:    BytesMut::zeroed(table_size),
            offset: None,
            hits:   0,
            pins:   0,
            dirty:  false,
        }
    }
}

/// A bounded store of cached tables, written back through the queue.
pub struct TableCache {
    slots:             Vec<Slot>,
    table_size:        usize,
    writethrough:      bool,
    depends_on_flush:  bool,
    ctx:               Context,
}

impl TableCache {
    /// Create a cache of `num_tables` slots, each `table_size` bytes.
    ///
    /// In [`CacheMode::WriteThrough`] every release of a dirty table
    /// writes it back immediately; in write-back mode dirty tables stay
    /// cached until eviction or [`flush`](Self::flush).
    #[must_use]
    pub fn new(num_tables: usize, table_size: usize, mode: CacheMode) -> Self {
        Self {
            slots: (0..num_tables).map(|_| Slot::new(table_size)).collect(),
            table_size,
            writethrough: mode == CacheMode::WriteThrough,
            depends_on_flush: false,
            ctx: Context::new(),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize { self.slots.len() }

    #[must_use]
    pub const fn table_size(&self) -> usize { self.table_size }

    /// Acquire the table at `offset`, reading it from the queue if it is
    /// not cached.
    ///
    /// # Errors
    ///
    /// [`Error::Busy`](crate::Error::Busy) when every slot is pinned;
    /// release a table and retry. Otherwise the eviction write-back or
    /// the fill read failed.
    pub fn get<B: BlockBackend>(
        &mut self,
        queue: &mut BlockQueue<B>,
        offset: u64,
    ) -> Result<TableId> {
        self.acquire(queue, offset, true)
    }

    /// Acquire the slot for `offset` without reading it, for tables
    /// about to be fully initialized by the caller.
    ///
    /// # Errors
    ///
    /// Same as [`get`](Self::get), minus the fill read.
    pub fn get_empty<B: BlockBackend>(
        &mut self,
        queue: &mut BlockQueue<B>,
        offset: u64,
    ) -> Result<TableId> {
        self.acquire(queue, offset, false)
    }

    fn acquire<B: BlockBackend>(
        &mut self,
        queue: &mut BlockQueue<B>,
        offset: u64,
        read_from_disk: bool,
    ) -> Result<TableId> {
        if let Some(i) = self.slots.iter().position(|s| s.offset == Some(offset)) {
            self.slots[i].pins += 1;
            self.slots[i].hits += 1;
            return Ok(TableId(i));
        }

        let i = self.find_victim()?;
        debug!(offset, slot = i, "table cache miss");

        // Pin before the write-back so the slot cannot be claimed again
        // while its old content is being queued.
        self.slots[i].pins = 1;
        if let Err(err) = self.flush_entry(queue, i) {
            self.slots[i].pins = 0;
            return Err(err);
        }

        self.slots[i].offset = None;
        self.slots[i].dirty = false;

        if read_from_disk {
            // Read through the queue: a queued write of this table must
            // be observed by the fill.
            if let Err(err) = queue.pread(&mut self.ctx, offset, &mut self.slots[i].buf) {
                self.slots[i].pins = 0;
                return Err(err.into());
            }
        }

        self.slots[i].hits = FRESH_HITS;
        self.slots[i].offset = Some(offset);
        Ok(TableId(i))
    }

    /// Unpinned slot with the lowest decayed hit count.
    fn find_victim(&mut self) -> Result<usize> {
        let mut min_hits = u32::MAX;
        let mut victim = None;
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.pins > 0 {
                continue;
            }
            if slot.hits < min_hits {
                min_hits = slot.hits;
                victim = Some(i);
            }
            // Decay on scan: recent use outweighs ancient popularity.
            slot.hits /= 2;
        }
        victim.context(BusySnafu {
            capacity: self.slots.len(),
        })
    }

    /// The cached table bytes.
    #[must_use]
    pub fn table(&self, id: TableId) -> &[u8] { &self.slots[id.0].buf }

    /// Mutable access to the cached table bytes.
    ///
    /// Modifications are lost unless the table is also marked dirty.
    pub fn table_mut(&mut self, id: TableId) -> &mut [u8] { &mut self.slots[id.0].buf }

    /// Mark the table as modified so eviction and flush write it back.
    pub fn mark_dirty(&mut self, id: TableId) { self.slots[id.0].dirty = true; }

    /// Release one pin on the table.
    ///
    /// In writethrough mode a dirty table is queued for write-back
    /// before the pin is dropped.
    ///
    /// # Errors
    ///
    /// The writethrough write-back failed; the pin is kept.
    ///
    /// # Panics
    ///
    /// Panics when the table is released more often than acquired.
    pub fn put<B: BlockBackend>(&mut self, queue: &mut BlockQueue<B>, id: TableId) -> Result<()> {
        if self.writethrough {
            self.flush_entry(queue, id.0)?;
        }
        let slot = &mut self.slots[id.0];
        assert!(slot.pins > 0, "table released more times than acquired");
        slot.pins -= 1;
        Ok(())
    }

    /// Queue the write-back of one slot, honoring the pending
    /// backend-flush dependency.
    fn flush_entry<B: BlockBackend>(
        &mut self,
        queue: &mut BlockQueue<B>,
        i: usize,
    ) -> Result<()> {
        let Some(offset) = self.slots[i].offset else {
            return Ok(());
        };
        if !self.slots[i].dirty {
            return Ok(());
        }

        if self.depends_on_flush {
            // The table write must not pass outstanding data writes.
            queue.barrier(&mut self.ctx)?;
            self.depends_on_flush = false;
        }

        debug!(offset, slot = i, "writing back table");
        queue.pwrite(&mut self.ctx, offset, &self.slots[i].buf)?;
        self.slots[i].dirty = false;
        Ok(())
    }

    /// Queue every dirty table and make the result durable.
    ///
    /// Mirrors the sticky-error rule of the queue: once an entry fails
    /// with out-of-space, later entry failures do not replace it. The
    /// backend flush only runs when every entry was queued.
    ///
    /// # Errors
    ///
    /// The first failure, with out-of-space retained over later errors.
    pub fn flush<B: BlockBackend>(&mut self, queue: &mut BlockQueue<B>) -> Result<()> {
        let mut result: Result<()> = Ok(());
        for i in 0..self.slots.len() {
            if let Err(err) = self.flush_entry(queue, i) {
                let keep = matches!(&result, Err(prev) if prev.is_out_of_space());
                if !keep {
                    result = Err(err);
                }
            }
        }

        if result.is_ok() {
            queue.flush()?;
        }
        result
    }

    /// Order this cache's future write-backs after everything `other`
    /// has modified: the dependency's dirty tables are queued and fenced
    /// off, and this cache's context is pulled past the fence.
    ///
    /// # Errors
    ///
    /// Queueing the dependency's tables or the fence failed.
    pub fn set_dependency<B: BlockBackend>(
        &mut self,
        queue: &mut BlockQueue<B>,
        other: &mut Self,
    ) -> Result<()> {
        for i in 0..other.slots.len() {
            other.flush_entry(queue, i)?;
        }
        queue.barrier(&mut other.ctx)?;
        self.ctx.depend_on(other.ctx.section());
        Ok(())
    }

    /// Require a fence before the next table write-back, for tables
    /// whose content refers to data writes still in the queue.
    pub const fn depend_on_flush(&mut self) { self.depends_on_flush = true; }

    /// Drop the cache.
    ///
    /// # Panics
    ///
    /// Panics when a table is still pinned; dirty unpinned tables are
    /// discarded, as the caller is expected to have flushed.
    pub fn close(self) {
        assert!(
            self.slots.iter().all(|s| s.pins == 0),
            "table cache closed with pinned tables"
        );
    }
}

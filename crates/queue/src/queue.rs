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

//! The write-back block request queue.
//!
//! Writes are buffered in memory and ordered into sections bounded by
//! barriers; reads are answered from the buffered state first so a
//! producer always observes its own queued writes.
//!
//! ```text
//! ┌──────────────┐  pwrite/barrier  ┌─────────────────────────┐  submit   ┌──────────────┐
//! │  Context(s)  │ ───────────────► │ pending ──► in_flight   │ ────────► │   Backend    │
//! │  (producers) │ ◄─────────────── │   (sections, barriers)  │ ◄──────── │  (async I/O) │
//! └──────────────┘      pread       └─────────────────────────┘ complete  └──────────────┘
//! ```
//!
//! Dispatch is strictly in order with a single in-flight slot: a barrier
//! is only submitted once everything before it has completed, and nothing
//! after it is submitted while it is in flight. Requests within one
//! section carry no ordering guarantee relative to each other; everything
//! in section `k` is durable before anything in section `k + 1` reaches
//! the backend.
//!
//! Backend failures never reach the producer that queued the write; they
//! are routed through the installed error handler and the sticky error
//! reported by the next [`flush`](BlockQueue::flush) or `aio_flush`
//! waiter.

use std::collections::VecDeque;

use blockq_tasklet::{Step, enter, from_fn};
use bytes::BytesMut;
use slab::Slab;
use snafu::ResultExt;
use tracing::{debug, warn};

use crate::{
    backend::{AioCompletion, AioToken, BlockBackend, CacheMode},
    config::QueueConfig,
    context::Context,
    error::{BackendError, Fault, FlushSnafu, InternalSnafu, ReadSnafu, Result, WriteSnafu},
    overlap::{self, Span},
    request::{FlushHandle, QueuedRequest, Request, RequestKind, Waiter, WaiterFn},
};

/// What the error handler wants done with a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Reinstate the failed request at the head of the queue and clear
    /// the error; the environment is expected to be stopped and to retry
    /// once the operator has resolved the condition.
    KeepQueue,
    /// Discard queued work; the error stays sticky until the next
    /// `flush` reports it.
    Abort,
}

/// Handler consulted once per failing backend completion.
pub type ErrorHandler = Box<dyn FnMut(&BackendError) -> ErrorAction>;

/// Counter snapshot for observability and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending:            usize,
    pub in_flight:          usize,
    pub barriers_requested: u64,
    pub barriers_submitted: u64,
    pub waiters:            usize,
}

/// A write-back request queue bound to one backend.
pub struct BlockQueue<B> {
    backend: B,
    mode:    CacheMode,
    config:  QueueConfig,

    arena:     Slab<Request>,
    pending:   VecDeque<AioToken>,
    sections:  Vec<AioToken>,
    in_flight: VecDeque<AioToken>,

    flushing: bool,
    fault:    Fault,
    on_error: Option<ErrorHandler>,

    next_waiter:        u64,
    waiters_for_cb:     usize,
    barriers_requested: u64,
    barriers_submitted: u64,
}

impl<B: BlockBackend> BlockQueue<B> {
    pub(crate) fn with_config(backend: B, config: QueueConfig, on_error: Option<ErrorHandler>) -> Self {
        let mode = backend.cache_mode();
        debug!(?mode, "block queue created");
        Self {
            backend,
            mode,
            config,
            arena: Slab::new(),
            pending: VecDeque::new(),
            sections: Vec::new(),
            in_flight: VecDeque::new(),
            flushing: false,
            fault: Fault::default(),
            on_error,
            next_waiter: 0,
            waiters_for_cb: 0,
            barriers_requested: 0,
            barriers_submitted: 0,
        }
    }

    /// Queue a write of `data` at `offset`.
    ///
    /// The queue takes its own copy of the bytes. In write-back mode this
    /// never touches the backend directly: overlapping queued writes in
    /// the producer's section or later absorb what they can in place, the
    /// rest is inserted before the barrier that closes the producer's
    /// section. In writethrough mode the write is forwarded synchronously
    /// and the queue stays empty.
    ///
    /// # Errors
    ///
    /// Write-back enqueueing cannot fail; writethrough surfaces the
    /// backend result.
    pub fn pwrite(&mut self, ctx: &mut Context, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if self.mode == CacheMode::WriteThrough {
            return self.write_through(offset, data);
        }

        let ids: Vec<AioToken> = self.pending.iter().copied().collect();
        let residual = overlap::write_merge_pass(
            &mut self.arena,
            &ids,
            ctx,
            data,
            vec![Span::new(offset, 0, data.len())],
        );

        // A submitted buffer belongs to the backend operation, so the
        // in-flight pass only tightens the dependency.
        let flight: Vec<AioToken> = self.in_flight.iter().copied().collect();
        overlap::depend_pass(&self.arena, &flight, ctx, offset, data.len());

        for span in residual {
            self.insert_write(ctx, span.offset, &data[span.start..span.start + span.len]);
        }

        debug!(
            offset,
            len = data.len(),
            section = ctx.section(),
            pending = self.pending.len(),
            "queued write"
        );
        self.maybe_dispatch();
        Ok(())
    }

    /// Read `buf.len()` bytes at `offset`, observing every queued write.
    ///
    /// Newest queued data wins: the pending list is consulted first, then
    /// in-flight requests, and only the remainder is read from the
    /// backend. Overlapping a queued write pulls the context forward to
    /// that write's section.
    ///
    /// # Errors
    ///
    /// Returns the backend failure if the residual read fails.
    pub fn pread(&mut self, ctx: &mut Context, offset: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }

        let spans = vec![Span::new(offset, 0, buf.len())];
        let ids: Vec<AioToken> = self.pending.iter().copied().collect();
        let spans = overlap::read_pass(&self.arena, &ids, ctx, buf, spans);

        let flight: Vec<AioToken> = self.in_flight.iter().copied().collect();
        let spans = overlap::read_pass(&self.arena, &flight, ctx, buf, spans);

        for span in spans {
            self.backend
                .pread(span.offset, &mut buf[span.start..span.start + span.len])
                .context(ReadSnafu {
                    offset: span.offset,
                })?;
        }
        Ok(())
    }

    /// Close the producer's current section with a barrier.
    ///
    /// Barriers from independent contexts coalesce: if a barrier for the
    /// context's section (or a later one) is already queued, the context
    /// merges with it instead of queueing another fence, so contending
    /// producers do not multiply backend flushes.
    ///
    /// # Errors
    ///
    /// Write-back enqueueing cannot fail; writethrough surfaces the
    /// backend flush result.
    pub fn barrier(&mut self, ctx: &mut Context) -> Result<()> {
        if self.mode == CacheMode::WriteThrough {
            return self.flush_through();
        }

        self.barriers_requested += 1;

        for &bid in &self.sections {
            let existing = &self.arena[bid.0];
            if existing.section >= ctx.section {
                ctx.section = existing.section + 1;
                debug!(section = existing.section, "barrier merged");
                return Ok(());
            }
        }

        let section = ctx.section;
        let token = AioToken(self.arena.insert(Request::barrier(section)));
        self.pending.push_back(token);
        self.sections.push(token);
        ctx.section = section + 1;

        debug!(section, "barrier queued");
        self.maybe_dispatch();
        Ok(())
    }

    /// Queue a barrier and get notified when everything queued so far is
    /// durable.
    ///
    /// The callback fires exactly once with the completion status, or
    /// with the queue error if the queue fails before the barrier
    /// completes, unless the returned handle is cancelled first.
    ///
    /// Unlike [`barrier`](Self::barrier), the fence may only merge with a
    /// barrier that is the final queued request; merging into a barrier
    /// with writes queued after it would fire the callback before those
    /// writes are durable.
    pub fn aio_flush(
        &mut self,
        ctx: &mut Context,
        cb: impl FnOnce(std::result::Result<(), BackendError>) + 'static,
    ) -> FlushHandle {
        if self.mode == CacheMode::WriteThrough {
            let result = match self.backend.submit_flush(AioToken::SYNC) {
                Ok(()) => self.pump_sync(),
                Err(err) => Err(err),
            };
            cb(result);
            return FlushHandle {
                token:  AioToken::SYNC,
                waiter: 0,
                spent:  true,
            };
        }

        self.barriers_requested += 1;
        let waiter_id = self.next_waiter;
        self.next_waiter += 1;
        let waiter = Waiter {
            id: waiter_id,
            cb: Box::new(cb) as WaiterFn,
        };

        let mergeable = self
            .sections
            .iter()
            .copied()
            .find(|&bid| self.arena[bid.0].section >= ctx.section);
        if let Some(bid) = mergeable
            && self.pending.back() == Some(&bid)
        {
            let existing = &mut self.arena[bid.0];
            ctx.section = existing.section + 1;
            existing.waiters.push(waiter);
            self.waiters_for_cb += 1;
            self.maybe_dispatch();
            return FlushHandle {
                token:  bid,
                waiter: waiter_id,
                spent:  false,
            };
        }

        // Not mergeable: append past every existing barrier so the
        // waiter covers everything queued at this point.
        let section = match self.sections.last() {
            Some(&last) => ctx.section.max(self.arena[last.0].section + 1),
            None => ctx.section,
        };
        let mut req = Request::barrier(section);
        req.waiters.push(waiter);
        let token = AioToken(self.arena.insert(req));
        self.pending.push_back(token);
        self.sections.push(token);
        self.waiters_for_cb += 1;
        ctx.section = section + 1;

        debug!(section, "flush barrier queued");
        self.maybe_dispatch();
        FlushHandle {
            token,
            waiter: waiter_id,
            spent: false,
        }
    }

    /// Detach a waiter installed by [`aio_flush`](Self::aio_flush).
    ///
    /// The underlying barrier stays queued; only the callback is removed,
    /// and it will not fire even if the barrier later completes. Spent or
    /// already-fired handles are tolerated.
    pub fn cancel(&mut self, handle: FlushHandle) {
        if handle.spent {
            return;
        }
        if let Some(req) = self.arena.get_mut(handle.token.0)
            && let Some(pos) = req.waiters.iter().position(|w| w.id == handle.waiter)
        {
            req.waiters.remove(pos);
            self.waiters_for_cb -= 1;
        }
    }

    /// Drain the queue synchronously.
    ///
    /// Alternates dispatching and waiting for completions until both the
    /// pending and in-flight lists are empty, then reports (and consumes)
    /// the sticky error if one was recorded. While draining, barriers are
    /// never deferred. A `KeepQueue` handler decision keeps the drain
    /// going; an `Abort` decision ends it with the error.
    ///
    /// # Errors
    ///
    /// The first unresolved backend failure, exactly once.
    pub fn flush(&mut self) -> Result<()> {
        if self.mode == CacheMode::WriteThrough {
            return Ok(());
        }

        debug!(pending = self.pending.len(), "flush start");
        self.flushing = true;
        let result = enter(from_fn(|| self.flush_step()));
        self.flushing = false;
        result
    }

    fn flush_step(&mut self) -> Step<Result<()>> {
        if let Fault::Fatal(err) = self.fault.clone() {
            // Reporting consumes the sticky error.
            self.fault = Fault::Clear;
            return Step::Done(Err(err).context(FlushSnafu));
        }

        self.dispatch();
        if self.pending.is_empty() && self.in_flight.is_empty() {
            return Step::Done(Ok(()));
        }

        match self.backend.poll_complete() {
            Some(completion) => {
                self.complete(completion);
                Step::Yield
            }
            None => Step::Done(
                InternalSnafu {
                    message: "backend idle with requests outstanding".to_string(),
                }
                .fail(),
            ),
        }
    }

    /// Deliver every completion the backend has ready.
    ///
    /// This is the main-loop hook: with automatic dispatch each
    /// completion also restarts the dispatcher, so one call drains
    /// whatever the backend is willing to finish.
    pub fn drive(&mut self) {
        while let Some(completion) = self.backend.poll_complete() {
            self.complete(completion);
        }
    }

    /// Submit as much of the head of the queue as the ordering rules
    /// allow. A no-op under automatic dispatch, where every mutation and
    /// completion already runs it.
    pub fn dispatch(&mut self) {
        while self.submit_one() {}
    }

    /// True when nothing is queued or in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.pending.is_empty() && self.in_flight.is_empty() }

    #[must_use]
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pending:            self.pending.len(),
            in_flight:          self.in_flight.len(),
            barriers_requested: self.barriers_requested,
            barriers_submitted: self.barriers_submitted,
            waiters:            self.waiters_for_cb,
        }
    }

    #[must_use]
    pub fn cache_mode(&self) -> CacheMode { self.mode }

    #[must_use]
    pub fn backend(&self) -> &B { &self.backend }

    pub fn backend_mut(&mut self) -> &mut B { &mut self.backend }

    /// The queued requests in dispatch order.
    pub fn pending_requests(&self) -> impl Iterator<Item = QueuedRequest<'_>> {
        self.pending
            .iter()
            .map(|&token| QueuedRequest::view(&self.arena[token.0]))
    }

    /// Drain the queue and release it.
    ///
    /// # Errors
    ///
    /// Returns the flush failure, if any. The queue must still have
    /// drained: requests left outstanding after the flush are a caller
    /// bug and abort.
    ///
    /// # Panics
    ///
    /// Panics if requests or waiters survive the final flush.
    pub fn close(mut self) -> Result<()> {
        let result = self.flush();
        assert!(
            self.is_empty(),
            "block queue closed with requests outstanding"
        );
        assert_eq!(
            self.waiters_for_cb, 0,
            "block queue closed with waiters attached"
        );
        debug!("block queue closed");
        result
    }

    fn maybe_dispatch(&mut self) {
        if self.config.dispatch.is_auto() {
            self.dispatch();
        }
    }

    /// Insert a new write right before the barrier that closes its
    /// section. Targeting a barrier in a later section pulls the request
    /// and the context forward to it; with no such barrier the write is
    /// appended at the tail.
    fn insert_write(&mut self, ctx: &mut Context, offset: u64, data: &[u8]) {
        let mut section = ctx.section;
        let mut insert_at = None;
        for &bid in &self.sections {
            let existing = &self.arena[bid.0];
            if existing.section >= section {
                section = existing.section;
                insert_at = Some(
                    self.pending
                        .iter()
                        .position(|&t| t == bid)
                        .expect("barrier tracked in sections is queued"),
                );
                break;
            }
        }
        ctx.section = section;

        let token = AioToken(
            self.arena
                .insert(Request::write(offset, BytesMut::from(data), section)),
        );
        match insert_at {
            Some(pos) => self.pending.insert(pos, token),
            None => self.pending.push_back(token),
        }
    }

    /// Submit the head of the queue if the ordering rules allow it.
    ///
    /// Nothing is submitted while a request is in flight (strict in-order
    /// dispatch: this is what makes a barrier a fence) or while an error
    /// is being handled. Outside of a flush, a barrier with no waiters is
    /// held back until enough pending requests have piled up behind it.
    fn submit_one(&mut self) -> bool {
        if !self.fault.is_clear() || !self.in_flight.is_empty() {
            return false;
        }
        let Some(&head) = self.pending.front() else {
            return false;
        };

        let req = &self.arena[head.0];
        if req.is_barrier()
            && !self.flushing
            && self.waiters_for_cb == 0
            && self.pending.len() < self.config.barrier_defer_threshold
        {
            return false;
        }

        self.pending.pop_front();
        if req.is_barrier() {
            assert_eq!(
                self.sections.first(),
                Some(&head),
                "barrier submitted out of section order"
            );
            self.sections.remove(0);
        }
        self.in_flight.push_back(head);

        let submitted = match &self.arena[head.0].kind {
            RequestKind::Write { offset, buf } => {
                debug!(offset = *offset, len = buf.len(), "submitting write");
                self.backend.submit_write(head, *offset, buf)
            }
            RequestKind::Barrier => {
                debug!("submitting barrier");
                self.barriers_submitted += 1;
                self.backend.submit_flush(head)
            }
        };

        if let Err(err) = submitted {
            // Failed submission behaves like an immediately failed
            // completion.
            self.complete(AioCompletion {
                token:  head,
                result: Err(err),
            });
        }
        true
    }

    fn complete(&mut self, completion: AioCompletion) {
        let AioCompletion { token, result } = completion;
        let pos = self
            .in_flight
            .iter()
            .position(|&t| t == token)
            .expect("completion token is in flight");
        self.in_flight.remove(pos);
        let mut req = self.arena.remove(token.0);

        match result {
            Ok(()) => {
                self.fire_waiters(&mut req, Ok(()));
                self.maybe_dispatch();
            }
            Err(err) => self.fail(req, &err),
        }
    }

    /// Failure handling for one completed request.
    ///
    /// The sticky error is recorded first (out-of-space is never
    /// overwritten), every waiter on the queue is failed with it, and
    /// then the installed handler decides between reinstating the request
    /// for a retry and discarding the queue.
    fn fail(&mut self, mut req: Request, err: &BackendError) {
        let sticky = self.fault.stickied(err);
        self.fault = Fault::Recoverable(sticky.clone());
        warn!(error = %err, "backend completion failed");

        self.fire_waiters(&mut req, Err(sticky.clone()));
        self.fail_all_waiters(&sticky);

        let action = match self.on_error.as_mut() {
            Some(handler) => handler(err),
            None => ErrorAction::Abort,
        };

        match action {
            ErrorAction::KeepQueue => {
                let is_barrier = req.is_barrier();
                let token = AioToken(self.arena.insert(req));
                self.pending.push_front(token);
                if is_barrier {
                    self.sections.insert(0, token);
                }
                self.fault = Fault::Clear;
                // The dispatcher is deliberately not restarted: the
                // environment is stopped and will dispatch again when it
                // resumes.
                debug!("failed request reinstated for retry");
            }
            ErrorAction::Abort => {
                while let Some(token) = self.pending.pop_front() {
                    let mut dead = self.arena.remove(token.0);
                    self.fire_waiters(&mut dead, Err(sticky.clone()));
                }
                self.sections.clear();
                self.fault = Fault::Fatal(sticky);
                warn!("queued requests discarded after backend failure");
            }
        }
    }

    fn fire_waiters(
        &mut self,
        req: &mut Request,
        result: std::result::Result<(), BackendError>,
    ) {
        for waiter in req.waiters.drain(..) {
            self.waiters_for_cb -= 1;
            (waiter.cb)(result.clone());
        }
    }

    /// Fail every waiter attached to any queued request. The requests
    /// themselves stay queued; only the completion promises are settled.
    fn fail_all_waiters(&mut self, err: &BackendError) {
        let tokens: Vec<AioToken> = self
            .pending
            .iter()
            .chain(self.in_flight.iter())
            .copied()
            .collect();
        for token in tokens {
            let waiters = std::mem::take(&mut self.arena[token.0].waiters);
            for waiter in waiters {
                self.waiters_for_cb -= 1;
                (waiter.cb)(Err(err.clone()));
            }
        }
    }

    fn write_through(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let result = match self.backend.submit_write(AioToken::SYNC, offset, data) {
            Ok(()) => self.pump_sync(),
            Err(err) => Err(err),
        };
        result.context(WriteSnafu { offset })
    }

    fn flush_through(&mut self) -> Result<()> {
        let result = match self.backend.submit_flush(AioToken::SYNC) {
            Ok(()) => self.pump_sync(),
            Err(err) => Err(err),
        };
        result.context(FlushSnafu)
    }

    /// Wait for the completion of the single synchronous operation just
    /// submitted in writethrough mode.
    fn pump_sync(&mut self) -> std::result::Result<(), BackendError> {
        match self.backend.poll_complete() {
            Some(completion) => {
                debug_assert_eq!(completion.token, AioToken::SYNC);
                completion.result
            }
            // The backend broke its contract; surface it as an I/O
            // failure instead of spinning.
            None => Err(BackendError::Io {
                kind: std::io::ErrorKind::BrokenPipe,
            }),
        }
    }
}

impl<B> Drop for BlockQueue<B> {
    fn drop(&mut self) {
        if !(self.pending.is_empty() && self.in_flight.is_empty()) {
            warn!(
                pending = self.pending.len(),
                in_flight = self.in_flight.len(),
                "block queue dropped with queued requests"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DispatchPolicy, QueueBuilder, mem::MemBackend};

    fn manual_queue() -> BlockQueue<MemBackend> {
        QueueBuilder::new(MemBackend::new(2048, 0xA5, CacheMode::WriteBack))
            .dispatch(DispatchPolicy::Manual)
            .build()
    }

    fn assert_write(req: &QueuedRequest<'_>, offset: u64, len: usize, fill: u8, section: u64) {
        match req {
            QueuedRequest::Write {
                offset: o,
                data,
                section: s,
            } => {
                assert_eq!(*o, offset);
                assert_eq!(data.len(), len);
                assert!(data.iter().all(|&b| b == fill));
                assert_eq!(*s, section);
            }
            QueuedRequest::Barrier { .. } => panic!("expected write, found barrier"),
        }
    }

    fn assert_barrier(req: &QueuedRequest<'_>, section: u64) {
        assert_eq!(req, &QueuedRequest::Barrier { section });
    }

    #[test]
    fn test_basic_ordering() {
        let mut queue = manual_queue();
        let mut ctx = Context::new();

        queue.pwrite(&mut ctx, 0, &[0x12; 512]).unwrap();
        queue.pwrite(&mut ctx, 512, &[0x34; 42]).unwrap();
        queue.barrier(&mut ctx).unwrap();
        queue.pwrite(&mut ctx, 678, &[0x56; 42]).unwrap();

        let reqs: Vec<_> = queue.pending_requests().collect();
        assert_eq!(reqs.len(), 4);
        assert_write(&reqs[0], 0, 512, 0x12, 0);
        assert_write(&reqs[1], 512, 42, 0x34, 0);
        assert_barrier(&reqs[2], 0);
        assert_write(&reqs[3], 678, 42, 0x56, 1);
    }

    #[test]
    fn test_two_context_merge() {
        let mut queue = manual_queue();
        let mut ctx1 = Context::new();
        let mut ctx2 = Context::new();

        queue.pwrite(&mut ctx1, 0, &[0x12; 512]).unwrap();
        queue.barrier(&mut ctx1).unwrap();
        queue.pwrite(&mut ctx2, 512, &[0x34; 42]).unwrap();
        queue.pwrite(&mut ctx1, 1024, &[0x12; 512]).unwrap();
        queue.barrier(&mut ctx2).unwrap();
        queue.pwrite(&mut ctx2, 1536, &[0x34; 42]).unwrap();

        // ctx2's barrier merged into ctx1's; one barrier total.
        assert_eq!(ctx2.section(), 1);
        let reqs: Vec<_> = queue.pending_requests().collect();
        assert_eq!(reqs.len(), 5);
        assert_write(&reqs[0], 0, 512, 0x12, 0);
        assert_write(&reqs[1], 512, 42, 0x34, 0);
        assert_barrier(&reqs[2], 0);
        assert_write(&reqs[3], 1024, 512, 0x12, 1);
        assert_write(&reqs[4], 1536, 42, 0x34, 1);
    }

    #[test]
    fn test_barrier_merge_is_idempotent() {
        let mut queue = manual_queue();
        let mut ctx1 = Context::new();

        queue.pwrite(&mut ctx1, 0, &[0x12; 16]).unwrap();
        queue.barrier(&mut ctx1).unwrap();

        let mut ctx2 = Context::new();
        queue.barrier(&mut ctx2).unwrap();
        queue.barrier(&mut Context::new()).unwrap();

        let barriers = queue
            .pending_requests()
            .filter(|r| matches!(r, QueuedRequest::Barrier { .. }))
            .count();
        assert_eq!(barriers, 1);
        assert_eq!(ctx2.section(), 1);
        assert_eq!(queue.stats().barriers_requested, 3);
    }

    #[test]
    fn test_write_lands_before_closing_barrier() {
        let mut queue = manual_queue();
        let mut ctx1 = Context::new();

        queue.pwrite(&mut ctx1, 0, &[0x12; 8]).unwrap();
        queue.barrier(&mut ctx1).unwrap();
        queue.pwrite(&mut ctx1, 1024, &[0x12; 8]).unwrap();

        // A fresh context still writes into section 0, before the
        // barrier.
        let mut ctx2 = Context::new();
        queue.pwrite(&mut ctx2, 512, &[0x34; 8]).unwrap();
        assert_eq!(ctx2.section(), 0);

        let reqs: Vec<_> = queue.pending_requests().collect();
        assert_write(&reqs[0], 0, 8, 0x12, 0);
        assert_write(&reqs[1], 512, 8, 0x34, 0);
        assert_barrier(&reqs[2], 0);
        assert_write(&reqs[3], 1024, 8, 0x12, 1);
    }

    #[test]
    fn test_overlapping_write_must_not_merge_into_earlier_section() {
        let mut queue = manual_queue();

        let mut ctx1 = Context::new();
        queue.pwrite(&mut ctx1, 0, &[0x12; 512]).unwrap();

        let mut ctx2 = Context::new();
        queue.pwrite(&mut ctx2, 512, &[0x34; 512]).unwrap();
        queue.barrier(&mut ctx2).unwrap();
        queue.pwrite(&mut ctx2, 0, &[0x56; 512]).unwrap();

        let reqs: Vec<_> = queue.pending_requests().collect();
        assert_eq!(reqs.len(), 4);
        assert_write(&reqs[0], 0, 512, 0x12, 0);
        assert_write(&reqs[1], 512, 512, 0x34, 0);
        assert_barrier(&reqs[2], 0);
        assert_write(&reqs[3], 0, 512, 0x56, 1);
    }

    #[test]
    fn test_overlapping_write_merges_into_later_section() {
        let mut queue = manual_queue();

        let mut ctx1 = Context::new();
        queue.pwrite(&mut ctx1, 0, &[0x12; 512]).unwrap();
        queue.barrier(&mut ctx1).unwrap();
        queue.pwrite(&mut ctx1, 512, &[0x56; 512]).unwrap();

        // A fresh producer overwrites the queued section-1 write in
        // place and is pulled forward to its section.
        let mut ctx2 = Context::new();
        queue.pwrite(&mut ctx2, 512, &[0x34; 512]).unwrap();
        assert_eq!(ctx2.section(), 1);

        let reqs: Vec<_> = queue.pending_requests().collect();
        assert_eq!(reqs.len(), 3);
        assert_write(&reqs[0], 0, 512, 0x12, 0);
        assert_barrier(&reqs[1], 0);
        assert_write(&reqs[2], 512, 512, 0x34, 1);
    }

    #[test]
    fn test_aio_flush_merges_only_with_tail_barrier() {
        let mut queue = manual_queue();
        let mut ctx = Context::new();

        // Barrier at the tail: a flush waiter may merge with it.
        queue.pwrite(&mut ctx, 0, &[0x12; 8]).unwrap();
        queue.barrier(&mut ctx).unwrap();
        let mut ctx2 = Context::new();
        queue.aio_flush(&mut ctx2, |_| {});
        assert_eq!(
            queue
                .pending_requests()
                .filter(|r| matches!(r, QueuedRequest::Barrier { .. }))
                .count(),
            1
        );
        assert_eq!(ctx2.section(), 1);

        // With a write queued behind the barrier, the fence must be
        // appended instead, past every existing barrier.
        queue.pwrite(&mut ctx, 512, &[0x34; 8]).unwrap();
        let mut ctx3 = Context::new();
        queue.aio_flush(&mut ctx3, |_| {});
        let barriers: Vec<u64> = queue
            .pending_requests()
            .filter(|r| matches!(r, QueuedRequest::Barrier { .. }))
            .map(|r| r.section())
            .collect();
        assert_eq!(barriers, vec![0, 1]);
        assert_eq!(ctx3.section(), 2);

        let last = queue.pending_requests().last().unwrap();
        assert_barrier(&last, 1);
    }

    #[test]
    fn test_barrier_deferred_until_threshold() {
        let mut backend = MemBackend::new(2048, 0xA5, CacheMode::WriteBack);
        backend.clear_ops();
        let mut queue = QueueBuilder::new(backend)
            .dispatch(DispatchPolicy::Manual)
            .barrier_defer_threshold(3)
            .build();
        let mut ctx = Context::new();

        queue.barrier(&mut ctx).unwrap();
        queue.dispatch();
        // Alone, the barrier is deferred.
        assert_eq!(queue.stats().in_flight, 0);
        assert_eq!(queue.stats().barriers_submitted, 0);

        queue.pwrite(&mut ctx, 0, &[0x12; 8]).unwrap();
        queue.pwrite(&mut ctx, 16, &[0x34; 8]).unwrap();
        queue.dispatch();
        // Threshold reached; the barrier is now eligible and goes first.
        assert_eq!(queue.stats().in_flight, 1);
        assert_eq!(queue.stats().barriers_submitted, 1);
    }

    #[test]
    fn test_flush_drains_in_order() {
        let mut queue = manual_queue();
        let mut ctx = Context::new();

        queue.pwrite(&mut ctx, 0, &[0x12; 512]).unwrap();
        queue.barrier(&mut ctx).unwrap();
        queue.pwrite(&mut ctx, 678, &[0x56; 42]).unwrap();
        queue.flush().unwrap();

        assert!(queue.is_empty());
        use crate::mem::BackendOp;
        assert_eq!(
            queue.backend().ops(),
            &[
                BackendOp::Write {
                    offset: 0,
                    len:    512
                },
                BackendOp::Flush,
                BackendOp::Write {
                    offset: 678,
                    len:    42
                },
            ]
        );
    }
}

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

//! Queued request model.
//!
//! Requests live in a slab arena and are referred to everywhere by their
//! [`AioToken`]: the pending list, the section list, the in-flight list
//! and backend completions all carry tokens rather than owning or
//! borrowing the request itself. A request is removed from the arena
//! exactly once, when its completion has been processed (or when the
//! whole queue is drained on a fatal error).

use bytes::BytesMut;

use crate::{backend::AioToken, error::BackendError};

/// Completion callback attached to a request by `aio_flush`.
pub type WaiterFn = Box<dyn FnOnce(Result<(), BackendError>)>;

/// A completion handle attached to one request.
///
/// The id is unique for the lifetime of the queue, so a cancel can
/// identify its waiter even after arena slots have been reused.
pub(crate) struct Waiter {
    pub(crate) id: u64,
    pub(crate) cb: WaiterFn,
}

pub(crate) enum RequestKind {
    Write { offset: u64, buf: BytesMut },
    Barrier,
}

pub(crate) struct Request {
    pub(crate) section: u64,
    pub(crate) kind:    RequestKind,
    pub(crate) waiters: Vec<Waiter>,
}

impl Request {
    pub(crate) fn write(offset: u64, buf: BytesMut, section: u64) -> Self {
        Self {
            section,
            kind: RequestKind::Write { offset, buf },
            waiters: Vec::new(),
        }
    }

    pub(crate) const fn barrier(section: u64) -> Self {
        Self {
            section,
            kind: RequestKind::Barrier,
            waiters: Vec::new(),
        }
    }

    pub(crate) const fn is_barrier(&self) -> bool { matches!(self.kind, RequestKind::Barrier) }
}

/// A request as seen through [`pending_requests`](crate::BlockQueue::pending_requests).
#[derive(Debug, PartialEq, Eq)]
pub enum QueuedRequest<'a> {
    Write {
        offset:  u64,
        data:    &'a [u8],
        section: u64,
    },
    Barrier {
        section: u64,
    },
}

impl QueuedRequest<'_> {
    #[must_use]
    pub const fn section(&self) -> u64 {
        match self {
            Self::Write { section, .. } | Self::Barrier { section } => *section,
        }
    }
}

impl<'a> QueuedRequest<'a> {
    pub(crate) fn view(req: &'a Request) -> Self {
        match &req.kind {
            RequestKind::Write { offset, buf } => Self::Write {
                offset:  *offset,
                data:    buf.as_ref(),
                section: req.section,
            },
            RequestKind::Barrier => Self::Barrier {
                section: req.section,
            },
        }
    }
}

/// Identifier for one attached waiter, paired with the request it sits
/// on. Returned by `aio_flush`, consumed by `cancel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushHandle {
    pub(crate) token:  AioToken,
    pub(crate) waiter: u64,
    /// Writethrough flushes complete before `aio_flush` returns; their
    /// handle has nothing left to cancel.
    pub(crate) spent:  bool,
}

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

//! The backend contract the queue dispatches against.
//!
//! A backend accepts at most one asynchronous operation at a time (the
//! queue keeps a single in-flight slot) and reports completions through
//! [`poll_complete`](BlockBackend::poll_complete). Completions are routed
//! by [`AioToken`], never by pointer: the queue hands the backend a stable
//! request identifier at submission and looks the request up again when
//! the completion comes back.

use crate::error::BackendError;

/// Whether the queue buffers writes or forwards them synchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// Writes are buffered and ordered into sections; durability comes
    /// from barriers and `flush`.
    WriteBack,
    /// Every write is forwarded to the backend before returning; the
    /// queue itself stays empty.
    WriteThrough,
}

/// Stable identifier for a submitted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AioToken(pub(crate) usize);

impl AioToken {
    /// Token used for synchronous (writethrough) operations that never
    /// enter the request arena.
    pub(crate) const SYNC: Self = Self(usize::MAX);
}

/// A finished asynchronous operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AioCompletion {
    pub token:  AioToken,
    pub result: Result<(), BackendError>,
}

/// An asynchronous block device.
///
/// The queue assumes the backend serializes its own I/O; it will never
/// have more than one write or flush outstanding.
pub trait BlockBackend {
    /// Synchronous read of committed (or in-progress) data.
    ///
    /// # Errors
    ///
    /// Returns the backend failure for the read.
    fn pread(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), BackendError>;

    /// Submit an asynchronous write.
    ///
    /// The backend owns a copy of `data` from this point on; the result
    /// of the write is reported later through `poll_complete` with the
    /// same token.
    ///
    /// # Errors
    ///
    /// An error here means the submission itself failed; the queue turns
    /// it into a synthesized failed completion.
    fn submit_write(&mut self, token: AioToken, offset: u64, data: &[u8])
    -> Result<(), BackendError>;

    /// Submit an asynchronous flush of everything written so far.
    ///
    /// # Errors
    ///
    /// Same contract as [`submit_write`](BlockBackend::submit_write).
    fn submit_flush(&mut self, token: AioToken) -> Result<(), BackendError>;

    /// Deliver the next finished operation.
    ///
    /// May block while operations are outstanding (this is the main
    /// loop's AIO wait); returns `None` only when nothing is in flight.
    fn poll_complete(&mut self) -> Option<AioCompletion>;

    /// The cache mode the backend was opened with.
    fn cache_mode(&self) -> CacheMode;
}

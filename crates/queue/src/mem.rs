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

//! In-memory reference backend.
//!
//! Backs the queue with a plain byte buffer. Submitted operations
//! complete in order, but their completions are parked until
//! [`poll_complete`](crate::BlockBackend::poll_complete) is called, which
//! gives callers a deterministic in-flight window. The backend keeps a
//! submission log and supports single-shot error injection, so tests can
//! assert on drain order and failure handling without a real device.

use std::collections::VecDeque;

use crate::{
    backend::{AioCompletion, AioToken, BlockBackend, CacheMode},
    error::BackendError,
};

/// One successfully applied backend operation, in submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendOp {
    Write { offset: u64, len: usize },
    Flush,
}

/// A byte-buffer block backend.
pub struct MemBackend {
    data:        Vec<u8>,
    fill:        u8,
    mode:        CacheMode,
    completions: VecDeque<AioCompletion>,
    inject:      Option<BackendError>,
    ops:         Vec<BackendOp>,
}

impl MemBackend {
    /// Create a backend of `size` bytes, every byte set to `fill`.
    #[must_use]
    pub fn new(size: usize, fill: u8, mode: CacheMode) -> Self {
        Self {
            data: vec![fill; size],
            fill,
            mode,
            completions: VecDeque::new(),
            inject: None,
            ops: Vec::new(),
        }
    }

    /// Fail the next submitted write or flush with `err`.
    ///
    /// The submission itself succeeds; the failure is delivered through
    /// the completion, and the data is not applied.
    pub fn fail_next(&mut self, err: BackendError) { self.inject = Some(err); }

    /// Operations applied so far, in submission order.
    #[must_use]
    pub fn ops(&self) -> &[BackendOp] { &self.ops }

    pub fn clear_ops(&mut self) { self.ops.clear(); }

    /// The backing bytes.
    #[must_use]
    pub fn contents(&self) -> &[u8] { &self.data }

    fn grow_to(&mut self, end: usize) {
        if end > self.data.len() {
            self.data.resize(end, self.fill);
        }
    }
}

impl BlockBackend for MemBackend {
    fn pread(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), BackendError> {
        let start = usize::try_from(offset).map_err(|_| BackendError::Io {
            kind: std::io::ErrorKind::InvalidInput,
        })?;
        self.grow_to(start + buf.len());
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    fn submit_write(
        &mut self,
        token: AioToken,
        offset: u64,
        data: &[u8],
    ) -> Result<(), BackendError> {
        if let Some(err) = self.inject.take() {
            self.completions.push_back(AioCompletion {
                token,
                result: Err(err),
            });
            return Ok(());
        }

        let start = usize::try_from(offset).map_err(|_| BackendError::Io {
            kind: std::io::ErrorKind::InvalidInput,
        })?;
        self.grow_to(start + data.len());
        self.data[start..start + data.len()].copy_from_slice(data);
        self.ops.push(BackendOp::Write {
            offset,
            len: data.len(),
        });
        self.completions.push_back(AioCompletion {
            token,
            result: Ok(()),
        });
        Ok(())
    }

    fn submit_flush(&mut self, token: AioToken) -> Result<(), BackendError> {
        if let Some(err) = self.inject.take() {
            self.completions.push_back(AioCompletion {
                token,
                result: Err(err),
            });
            return Ok(());
        }

        self.ops.push(BackendOp::Flush);
        self.completions.push_back(AioCompletion {
            token,
            result: Ok(()),
        });
        Ok(())
    }

    fn poll_complete(&mut self) -> Option<AioCompletion> { self.completions.pop_front() }

    fn cache_mode(&self) -> CacheMode { self.mode }
}

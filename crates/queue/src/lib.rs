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

//! Write-back block request queue.
//!
//! Buffers writes from concurrent producers, orders them into sections
//! separated by barriers, answers reads consistently from the buffered
//! state, and dispatches to an asynchronous backend strictly in order.
//!
//! Features:
//! - Per-producer [`Context`] cursors; barriers from independent
//!   producers at the same section coalesce into one fence
//! - Read-your-own-writes across pending and in-flight requests
//! - In-place merging of overlapping writes within a section
//! - Batching heuristic that defers lone barriers until real work has
//!   queued up behind them
//! - Sticky error handling with a pluggable retry/abort decision
//! - Writethrough mode that bypasses the queue entirely

mod overlap;
mod queue;
mod request;

pub mod backend;
pub mod builder;
pub mod config;
pub mod context;
pub mod error;
pub mod mem;

pub use backend::{AioCompletion, AioToken, BlockBackend, CacheMode};
pub use builder::QueueBuilder;
pub use config::{DEFAULT_BARRIER_DEFER_THRESHOLD, DispatchPolicy, QueueConfig};
pub use context::Context;
pub use error::{BackendError, Error, Result};
pub use mem::{BackendOp, MemBackend};
pub use queue::{BlockQueue, ErrorAction, ErrorHandler, QueueStats};
pub use request::{FlushHandle, QueuedRequest, WaiterFn};

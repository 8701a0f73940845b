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

//! Bounded cached-table store over the write-back block queue.
//!
//! Callers pin fixed-size tables (metadata blocks that live at known
//! backend offsets), modify them in place, and let the cache decide when
//! to write them back. Ordering constraints between caches ("these
//! tables must hit the backend before those") are expressed through the
//! queue's sections rather than synchronous flushes.

mod cache;

pub mod error;

pub use cache::{TableCache, TableId};
pub use error::{Error, Result};

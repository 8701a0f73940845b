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

/// A per-producer cursor into a queue.
///
/// The only state a context carries is its current section. Operations on
/// the queue may raise the section to satisfy dependencies; nothing ever
/// lowers it except an explicit [`reset`](Context::reset), which re-arms
/// the cursor for a fresh producer session.
///
/// Several contexts can share one queue; a context must only ever be used
/// with the queue it was created for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Context {
    pub(crate) section: u64,
}

impl Context {
    #[must_use]
    pub const fn new() -> Self { Self { section: 0 } }

    /// Re-arm the cursor at section 0.
    pub const fn reset(&mut self) { self.section = 0; }

    /// The section the next write from this producer will land in.
    #[must_use]
    pub const fn section(&self) -> u64 { self.section }

    /// Raise the section to at least `section`. Never lowers it.
    ///
    /// The queue does this implicitly whenever an operation from this
    /// context overlaps queued data; callers ordering their writes
    /// against another producer's fence can also do it explicitly.
    pub const fn depend_on(&mut self, section: u64) {
        if section > self.section {
            self.section = section;
        }
    }
}

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

/// Number of pending requests a barrier waits for before the dispatcher
/// submits it, unless a flush or a waiter makes it urgent. Barriers are
/// expensive and should coalesce real work; this is a tuning knob, not
/// an ordering guarantee.
pub const DEFAULT_BARRIER_DEFER_THRESHOLD: usize = 50;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub dispatch: DispatchPolicy,
    pub barrier_defer_threshold: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            dispatch: DispatchPolicy::Auto,
            barrier_defer_threshold: DEFAULT_BARRIER_DEFER_THRESHOLD,
        }
    }
}

/// When the dispatcher runs on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPolicy {
    /// Dispatch after every mutation and from every completion.
    Auto,
    /// Dispatch only when the caller asks (or during `flush`). Lets
    /// tests and batching callers stage the queue before submitting.
    Manual,
}

impl DispatchPolicy {
    pub(crate) const fn is_auto(self) -> bool { matches!(self, Self::Auto) }
}

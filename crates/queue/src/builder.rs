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

use crate::{
    BlockQueue, DispatchPolicy, QueueConfig,
    backend::BlockBackend,
    error::BackendError,
    queue::{ErrorAction, ErrorHandler},
};

pub struct QueueBuilder<B> {
    backend:  B,
    config:   QueueConfig,
    on_error: Option<ErrorHandler>,
}

impl<B: BlockBackend> QueueBuilder<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            config: QueueConfig::default(),
            on_error: None,
        }
    }

    pub fn dispatch(mut self, policy: DispatchPolicy) -> Self {
        self.config.dispatch = policy;
        self
    }

    pub fn barrier_defer_threshold(mut self, threshold: usize) -> Self {
        self.config.barrier_defer_threshold = threshold;
        self
    }

    /// Install the handler consulted when a backend completion fails.
    ///
    /// Returning [`ErrorAction::KeepQueue`] reinstates the failed request
    /// at the head of the queue for a later retry; returning
    /// [`ErrorAction::Abort`] discards queued work and leaves the error
    /// sticky until the next `flush` reports it. Without a handler every
    /// failure aborts.
    pub fn on_error(mut self, handler: impl FnMut(&BackendError) -> ErrorAction + 'static) -> Self {
        self.on_error = Some(Box::new(handler));
        self
    }

    #[must_use]
    pub fn build(self) -> BlockQueue<B> {
        BlockQueue::with_config(self.backend, self.config, self.on_error)
    }
}

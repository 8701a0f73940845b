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

use blockq_queue::BackendError;
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Every slot is pinned. Cooperative callers release a table and
    /// retry; this is the suspension point of the acquire path.
    #[snafu(display("all {capacity} table slots are pinned"))]
    Busy {
        capacity: usize,
        #[snafu(implicit)]
        loc:      snafu::Location,
    },

    #[snafu(transparent)]
    Queue {
        source: blockq_queue::Error,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },
}

impl Error {
    /// True when the underlying failure is the non-overwritable
    /// out-of-space condition.
    #[must_use]
    pub fn is_out_of_space(&self) -> bool {
        match self {
            Self::Busy { .. } => false,
            Self::Queue { source, .. } => matches!(
                source,
                blockq_queue::Error::Read {
                    source: BackendError::OutOfSpace,
                    ..
                } | blockq_queue::Error::Write {
                    source: BackendError::OutOfSpace,
                    ..
                } | blockq_queue::Error::Flush {
                    source: BackendError::OutOfSpace,
                    ..
                }
            ),
        }
    }

    /// True when the acquire path should be retried after releasing a
    /// pinned table.
    #[must_use]
    pub const fn is_busy(&self) -> bool { matches!(self, Self::Busy { .. }) }
}

pub type Result<T> = std::result::Result<T, Error>;

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

use snafu::Snafu;

/// A failure reported by the backend for a single operation.
///
/// `OutOfSpace` is the one condition a human has to act on, so once the
/// queue has recorded it, later failures never replace it.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum BackendError {
    #[snafu(display("no space left on backend"))]
    OutOfSpace,

    #[snafu(display("backend I/O error: {kind}"))]
    Io { kind: std::io::ErrorKind },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("backend read failed at offset {offset}"))]
    Read {
        offset: u64,
        source: BackendError,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display("backend write failed at offset {offset}"))]
    Write {
        offset: u64,
        source: BackendError,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display("backend flush failed"))]
    Flush {
        source: BackendError,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display("queue state error: {message}"))]
    Internal {
        message: String,
        #[snafu(implicit)]
        loc:     snafu::Location,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Queue-global error state.
///
/// Transitions are confined to the completion path and `flush`:
/// a failed completion moves `Clear -> Recoverable`; the error handler
/// resolves `Recoverable` into `Clear` (retry later) or `Fatal` (sticky);
/// `flush` consumes `Fatal` and reports it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) enum Fault {
    #[default]
    Clear,
    /// A failure is being handled; the dispatcher must not submit.
    Recoverable(BackendError),
    /// A failure was accepted as final; sticky until `flush` reports it.
    Fatal(BackendError),
}

impl Fault {
    pub(crate) const fn is_clear(&self) -> bool { matches!(self, Self::Clear) }

    /// The error a new failure should be recorded as, honoring the
    /// non-overwritable out-of-space rule.
    pub(crate) fn stickied(&self, incoming: &BackendError) -> BackendError {
        match self {
            Self::Recoverable(BackendError::OutOfSpace) | Self::Fatal(BackendError::OutOfSpace) => {
                BackendError::OutOfSpace
            }
            _ => incoming.clone(),
        }
    }
}

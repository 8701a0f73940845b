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

//! Single-threaded cooperative tasks with explicit yield and enter.
//!
//! A [`Tasklet`] is a resumable unit of work: each call to
//! [`step`](Tasklet::step) either makes progress and yields, or finishes
//! with a value. Suspension points are written as a return of
//! [`Step::Yield`] and resumption is a plain method call, so multi-step
//! drain loops (a queue flush, a cache fill retry) read as straight-line
//! code without a stack-switching runtime behind them.
//!
//! This is not a scheduler. [`enter`] drives a single tasklet to
//! completion; [`TaskSet`] is a strict round-robin driver for a set of
//! tasklets that need to interleave, which is all a single-threaded
//! cooperative model requires.

/// The result of driving a tasklet one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step<T> {
    /// The tasklet made some progress and wants to run again.
    Yield,
    /// The tasklet finished.
    Done(T),
}

impl<T> Step<T> {
    /// Returns `true` if this step finished the tasklet.
    pub const fn is_done(&self) -> bool { matches!(self, Self::Done(_)) }
}

/// A resumable cooperative task.
pub trait Tasklet {
    type Output;

    /// Run until the next suspension point or until completion.
    fn step(&mut self) -> Step<Self::Output>;
}

/// Drive a single tasklet to completion.
///
/// This is the "enter" half of the primitive: the caller's stack becomes
/// the task loop. Use it when nothing else needs to run between steps.
pub fn enter<T: Tasklet>(mut task: T) -> T::Output {
    loop {
        if let Step::Done(value) = task.step() {
            return value;
        }
    }
}

/// A tasklet built from a closure returning [`Step`].
pub struct FromFn<F>(F);

impl<F, T> Tasklet for FromFn<F>
where
    F: FnMut() -> Step<T>,
{
    type Output = T;

    fn step(&mut self) -> Step<T> { (self.0)() }
}

/// Build a tasklet from a closure.
///
/// Each invocation of the closure is one step; return [`Step::Yield`] to
/// suspend and [`Step::Done`] to finish.
pub fn from_fn<F, T>(f: F) -> FromFn<F>
where
    F: FnMut() -> Step<T>,
{
    FromFn(f)
}

/// A round-robin driver over a set of tasklets.
///
/// Each call to [`run`](TaskSet::run) steps every live tasklet in spawn
/// order, repeatedly, until all of them have completed. Completed
/// tasklets are dropped; the relative order of the remaining ones is
/// preserved, so interleaving is deterministic.
#[derive(Default)]
pub struct TaskSet<'a> {
    tasks: Vec<Box<dyn Tasklet<Output = ()> + 'a>>,
}

impl<'a> TaskSet<'a> {
    #[must_use]
    pub fn new() -> Self { Self { tasks: Vec::new() } }

    /// Add a tasklet to the set.
    pub fn spawn(&mut self, task: impl Tasklet<Output = ()> + 'a) {
        self.tasks.push(Box::new(task));
    }

    /// Number of tasklets that have not completed yet.
    #[must_use]
    pub fn len(&self) -> usize { self.tasks.len() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.tasks.is_empty() }

    /// Step every live tasklet once, in spawn order.
    ///
    /// Returns the number of tasklets still live afterwards.
    pub fn step_all(&mut self) -> usize {
        self.tasks.retain_mut(|task| !task.step().is_done());
        self.tasks.len()
    }

    /// Drive all tasklets to completion.
    pub fn run(&mut self) {
        while self.step_all() > 0 {}
    }
}

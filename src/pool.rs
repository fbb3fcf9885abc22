// TCP reactor server framework.
//
// SPDX-License-Identifier: Apache-2.0
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::Error;

/// Why a task never produced a value.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum TaskError {
    /// the pool was stopped before the task ran
    Stopped,

    /// the task panicked during execution
    Panicked,
}

type Job = Box<dyn FnOnce() -> i32 + Send>;

/// A unit of work for the [`ThreadPool`] carrying a future-style result.
///
/// The submitting thread keeps its own `Arc<Task>` and blocks on
/// [`Task::value`]; the worker that runs the job completes the result with
/// the returned integer, a captured panic, or — when the pool stops before
/// the job ran — a cancellation.
pub struct Task {
    job: Mutex<Option<Job>>,
    result: Mutex<Option<Result<i32, TaskError>>>,
    done: Condvar,
}

impl Task {
    pub fn new(job: impl FnOnce() -> i32 + Send + 'static) -> Arc<Task> {
        Arc::new(Task {
            job: Mutex::new(Some(Box::new(job))),
            result: Mutex::new(None),
            done: Condvar::new(),
        })
    }

    /// Blocks until the task has completed and returns its outcome. A
    /// cancelled or panicked task reports the corresponding [`TaskError`]
    /// instead of blocking forever.
    pub fn value(&self) -> Result<i32, TaskError> {
        let mut result = self.result.lock().expect("task result poisoned");
        while result.is_none() {
            result = self.done.wait(result).expect("task result poisoned");
        }
        result.clone().expect("checked above")
    }

    /// Non-blocking peek at the outcome.
    pub fn try_value(&self) -> Option<Result<i32, TaskError>> {
        self.result.lock().expect("task result poisoned").clone()
    }

    fn take_job(&self) -> Option<Job> {
        self.job.lock().expect("task job poisoned").take()
    }

    fn finish(&self, outcome: Result<i32, TaskError>) {
        let mut result = self.result.lock().expect("task result poisoned");
        // First outcome wins; keeps shutdown robust when a stop races the
        // worker that just ran the job.
        if result.is_none() {
            *result = Some(outcome);
            self.done.notify_all();
        }
    }
}

struct PoolShared {
    queue: Mutex<VecDeque<Arc<Task>>>,
    available: Condvar,
    running: AtomicBool,
}

/// Fixed-size worker pool consuming [`Task`]s from an unbounded FIFO queue.
///
/// No backpressure is applied; admission control belongs to the layer
/// above. [`ThreadPool::stop`] is idempotent, cancels everything still
/// queued and returns only after all workers have been joined.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl ThreadPool {
    /// Pool with exactly `size` workers. A zero size is rejected at
    /// [`ThreadPool::start`].
    pub fn new(size: usize) -> ThreadPool {
        ThreadPool {
            shared: Arc::new(PoolShared {
                queue: Mutex::new(VecDeque::new()),
                available: Condvar::new(),
                running: AtomicBool::new(false),
            }),
            workers: Mutex::new(vec![]),
            size,
        }
    }

    /// Pool sized to half the hardware parallelism, at least one worker.
    pub fn with_default_size() -> ThreadPool {
        let size = thread::available_parallelism()
            .map(|n| n.get() / 2)
            .unwrap_or(1)
            .max(1);
        ThreadPool::new(size)
    }

    pub fn size(&self) -> usize { self.size }

    pub fn is_running(&self) -> bool { self.shared.running.load(Ordering::Acquire) }

    pub fn start(&self) -> Result<(), Error> {
        if self.size == 0 {
            return Err(Error::NoWorkers);
        }
        if self
            .shared
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::PoolRunning);
        }
        let mut workers = self.workers.lock().expect("pool workers poisoned");
        for _ in 0..self.size {
            let shared = self.shared.clone();
            workers.push(thread::spawn(move || worker_loop(shared)));
        }
        log::debug!(target: "pool", "Started {} worker(s)", self.size);
        Ok(())
    }

    /// Submits a task; fails once the pool has stopped. The running check
    /// happens under the queue lock so a task observed by `add_task` is
    /// either run or cancelled, never silently lost.
    pub fn add_task(&self, task: Arc<Task>) -> Result<(), Error> {
        {
            let mut queue = self.shared.queue.lock().expect("pool queue poisoned");
            if !self.is_running() {
                return Err(Error::PoolStopped);
            }
            queue.push_back(task);
        }
        self.shared.available.notify_one();
        Ok(())
    }

    /// Stops the pool: workers finish their current job and exit, queued
    /// tasks are cancelled with [`TaskError::Stopped`]. Idempotent through a
    /// compare-and-swap on the running flag.
    pub fn stop(&self) {
        if self
            .shared
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        // The empty critical section is load-bearing: a worker that read
        // `running == true` but has not yet parked would otherwise miss the
        // notification below and sleep forever.
        {
            let _queue = self.shared.queue.lock().expect("pool queue poisoned");
        }
        self.shared.available.notify_all();

        let workers: Vec<_> = self
            .workers
            .lock()
            .expect("pool workers poisoned")
            .drain(..)
            .collect();
        for worker in workers {
            if worker.join().is_err() {
                log::error!(target: "pool", "Worker thread panicked outside a task");
            }
        }

        let cancelled: Vec<_> = self
            .shared
            .queue
            .lock()
            .expect("pool queue poisoned")
            .drain(..)
            .collect();
        for task in &cancelled {
            task.finish(Err(TaskError::Stopped));
        }
        if !cancelled.is_empty() {
            log::debug!(target: "pool", "Cancelled {} queued task(s)", cancelled.len());
        }
        log::debug!(target: "pool", "Stopped");
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) { self.stop(); }
}

fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        let task = {
            let mut queue = shared.queue.lock().expect("pool queue poisoned");
            loop {
                if !shared.running.load(Ordering::Acquire) {
                    break None;
                }
                if let Some(task) = queue.pop_front() {
                    break Some(task);
                }
                queue = shared.available.wait(queue).expect("pool queue poisoned");
            }
        };
        let Some(task) = task else {
            break;
        };
        let Some(job) = task.take_job() else {
            continue;
        };
        match panic::catch_unwind(AssertUnwindSafe(job)) {
            Ok(value) => task.finish(Ok(value)),
            Err(_) => {
                log::error!(target: "pool", "Task panicked; result set to failure");
                task.finish(Err(TaskError::Panicked));
            }
        }
    }
}

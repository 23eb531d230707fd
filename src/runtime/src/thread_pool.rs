// Copyright 2021 The ADK Developers.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Worker pool for decode/load jobs.
//!
//! A job runs on a worker thread and returns a completion closure; the
//! completion is queued and only ever runs on the thread that polls
//! `run_completions` (the application main thread). Cancellation is
//! cooperative: jobs run to completion and the completion handler observes
//! the aborted state and discards the result.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

/// Work delivered back to the polling thread when a job finishes.
pub type Completion = Box<dyn FnOnce() + Send>;
type Job = Box<dyn FnOnce() -> Completion + Send>;

struct Shared {
    completions: Mutex<VecDeque<Completion>>,
    in_flight: AtomicUsize,
    idle: Condvar,
    idle_mutex: Mutex<()>,
}

/// Fixed pool of worker threads with a main-thread completion queue.
pub struct ThreadPool {
    tx: Option<Sender<Job>>,
    workers: Vec<thread::JoinHandle<()>>,
    shared: Arc<Shared>,
}

impl ThreadPool {
    /// Spawn `num_threads` workers named `name-N`.
    pub fn new(num_threads: usize, name: &str) -> ThreadPool {
        assert!(num_threads > 0);
        let (tx, rx) = channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let shared = Arc::new(Shared {
            completions: Mutex::new(VecDeque::new()),
            in_flight: AtomicUsize::new(0),
            idle: Condvar::new(),
            idle_mutex: Mutex::new(()),
        });
        let mut workers = Vec::with_capacity(num_threads);
        for i in 0..num_threads {
            let rx = rx.clone();
            let shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, i))
                .spawn(move || worker_loop(&rx, &shared))
                .expect("spawn worker thread");
            workers.push(handle);
        }
        ThreadPool {
            tx: Some(tx),
            workers: workers,
            shared: shared,
        }
    }

    /// Queue a job. Its returned completion runs on the next
    /// `run_completions` call.
    pub fn enqueue<J>(&self, job: J)
    where
        J: FnOnce() -> Completion + Send + 'static,
    {
        self.shared.in_flight.fetch_add(1, Ordering::Relaxed);
        self.tx
            .as_ref()
            .unwrap()
            .send(Box::new(job))
            .expect("thread pool workers gone");
    }

    /// Run every queued completion on the calling thread. Returns the number
    /// of completions that ran.
    pub fn run_completions(&self) -> usize {
        let mut ran = 0;
        loop {
            let completion = {
                let mut q = self.shared.completions.lock().unwrap();
                q.pop_front()
            };
            match completion {
                Some(f) => {
                    f();
                    self.shared.in_flight.fetch_sub(1, Ordering::Relaxed);
                    let _guard = self.shared.idle_mutex.lock().unwrap();
                    self.shared.idle.notify_all();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    /// Jobs that have been queued but whose completion has not yet run.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Relaxed)
    }

    /// Block until every queued job's completion has run, running them here.
    pub fn drain(&self) {
        while self.in_flight() > 0 {
            if self.run_completions() == 0 {
                let guard = self.shared.idle_mutex.lock().unwrap();
                if self.in_flight() > 0 && self.shared.completions.lock().unwrap().is_empty() {
                    let _guard = self
                        .shared
                        .idle
                        .wait_timeout(guard, ::std::time::Duration::from_millis(1))
                        .unwrap();
                }
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.tx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(rx: &Mutex<Receiver<Job>>, shared: &Shared) {
    loop {
        let job = {
            let rx = rx.lock().unwrap();
            rx.recv()
        };
        match job {
            Ok(job) => {
                let completion = job();
                shared.completions.lock().unwrap().push_back(completion);
                let _guard = shared.idle_mutex.lock().unwrap();
                shared.idle.notify_all();
            }
            Err(_) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn completion_runs_on_polling_thread() {
        let pool = ThreadPool::new(2, "test-worker");
        let hit = Arc::new(AtomicBool::new(false));
        let hit2 = hit.clone();
        pool.enqueue(move || {
            let value = 21 * 2;
            Box::new(move || {
                assert_eq!(value, 42);
                hit2.store(true, Ordering::SeqCst);
            })
        });
        pool.drain();
        assert!(hit.load(Ordering::SeqCst));
        assert_eq!(pool.in_flight(), 0);
    }
}

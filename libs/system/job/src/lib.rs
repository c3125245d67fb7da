// This file is part of Cinder.
//
// Cinder is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// Cinder is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with Cinder.  If not, see <http://www.gnu.org/licenses/>.

//! A small worker pool with two priority lanes. Jobs are plain closures and
//! always run to completion; there is no cancellation. Fencing is the
//! caller's business: keep a counter next to your submissions and spin
//! `while count > 0 { jobs.run_once(Priority::High); }` so the waiting thread
//! drains work instead of blocking.

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, trace};
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send>;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Priority {
    High,
    Idle,
}

pub struct JobSystem {
    high_tx: Option<Sender<Job>>,
    idle_tx: Option<Sender<Job>>,
    high_rx: Receiver<Job>,
    idle_rx: Receiver<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl JobSystem {
    pub fn new(worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        let (high_tx, high_rx) = unbounded::<Job>();
        let (idle_tx, idle_rx) = unbounded::<Job>();

        debug!("job: starting pool with {} workers", worker_count);
        let workers = (0..worker_count)
            .map(|n| {
                let high = high_rx.clone();
                let idle = idle_rx.clone();
                thread::Builder::new()
                    .name(format!("cinder-worker-{}", n))
                    .spawn(move || worker_main(high, idle))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self {
            high_tx: Some(high_tx),
            idle_tx: Some(idle_tx),
            high_rx,
            idle_rx,
            workers,
        }
    }

    /// One worker per available core, minus one for the submitting thread.
    pub fn with_default_workers() -> Self {
        let cores = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self::new(cores.saturating_sub(1).max(1))
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn submit(&self, priority: Priority, job: impl FnOnce() + Send + 'static) {
        let tx = match priority {
            Priority::High => self.high_tx.as_ref(),
            Priority::Idle => self.idle_tx.as_ref(),
        };
        tx.expect("job system is shutting down")
            .send(Box::new(job))
            .expect("worker pool hung up");
    }

    /// Run one queued job of `priority` on the calling thread. Returns false
    /// if that lane is currently empty.
    pub fn run_once(&self, priority: Priority) -> bool {
        let rx = match priority {
            Priority::High => &self.high_rx,
            Priority::Idle => &self.idle_rx,
        };
        match rx.try_recv() {
            Ok(job) => {
                job();
                true
            }
            Err(_) => false,
        }
    }
}

impl Drop for JobSystem {
    fn drop(&mut self) {
        trace!("job: shutting down pool");
        // Closing the channels wakes every worker out of its blocking recv.
        self.high_tx.take();
        self.idle_tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_main(high: Receiver<Job>, idle: Receiver<Job>) {
    loop {
        // High-priority work preempts anything idle that is still queued.
        if let Ok(job) = high.try_recv() {
            job();
            continue;
        }
        crossbeam_channel::select! {
            recv(high) -> job => match job {
                Ok(job) => job(),
                Err(_) => break,
            },
            recv(idle) -> job => match job {
                Ok(job) => job(),
                Err(_) => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[test]
    fn jobs_run_on_workers() {
        let jobs = JobSystem::new(2);
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..64 {
            let count = Arc::clone(&count);
            jobs.submit(Priority::High, move || {
                count.fetch_add(1, Ordering::AcqRel);
            });
        }
        while count.load(Ordering::Acquire) < 64 {
            jobs.run_once(Priority::High);
        }
        assert_eq!(count.load(Ordering::Acquire), 64);
    }

    #[test]
    fn caller_participates_in_fence_drain() {
        // A one-worker pool with the caller spinning run_once must still
        // drain a deep queue.
        let jobs = JobSystem::new(1);
        let pending = Arc::new(AtomicUsize::new(0));
        for _ in 0..32 {
            pending.fetch_add(1, Ordering::AcqRel);
            let pending = Arc::clone(&pending);
            jobs.submit(Priority::High, move || {
                pending.fetch_sub(1, Ordering::AcqRel);
            });
        }
        while pending.load(Ordering::Acquire) > 0 {
            jobs.run_once(Priority::High);
        }
    }

    #[test]
    fn idle_lane_still_drains() {
        let jobs = JobSystem::new(1);
        let done = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&done);
        jobs.submit(Priority::Idle, move || {
            count.fetch_add(1, Ordering::AcqRel);
        });
        while done.load(Ordering::Acquire) == 0 {
            jobs.run_once(Priority::Idle);
            std::thread::yield_now();
        }
    }

    #[test]
    fn drop_joins_workers() {
        let jobs = JobSystem::new(4);
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let count = Arc::clone(&count);
            jobs.submit(Priority::High, move || {
                count.fetch_add(1, Ordering::AcqRel);
            });
        }
        while count.load(Ordering::Acquire) < 16 {
            jobs.run_once(Priority::High);
        }
        drop(jobs);
        assert_eq!(count.load(Ordering::Acquire), 16);
    }
}

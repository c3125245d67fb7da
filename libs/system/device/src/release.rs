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

//! Deferred resource destruction. GPU work for frame N may still be in
//! flight while the CPU records frame N+1, so resources retired in frame N
//! must stay alive until at least the start of frame N+2. [`Deferred`]
//! handles enqueue their payload here on drop; [`rotate`] runs once per
//! frame and destroys the bucket that has aged out.
//!
//! Process-wide state, installed for the lifetime of the device: [`init`] at
//! device creation, [`teardown`] at device destruction. Outside that window
//! dropped handles destroy their payload immediately.

use log::trace;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::{
    any::Any,
    ops::{Deref, DerefMut},
};

const BUCKET_COUNT: usize = 3;

struct Queue {
    buckets: [Vec<Box<dyn Any + Send>>; BUCKET_COUNT],
    cursor: usize,
}

static QUEUE: Lazy<Mutex<Option<Queue>>> = Lazy::new(|| Mutex::new(None));

pub fn init() {
    let mut queue = QUEUE.lock();
    debug_assert!(queue.is_none(), "release queue initialized twice");
    *queue = Some(Queue {
        buckets: [Vec::new(), Vec::new(), Vec::new()],
        cursor: 0,
    });
}

/// Destroy everything still queued and uninstall the queue.
pub fn teardown() {
    let taken = QUEUE.lock().take();
    if let Some(queue) = taken {
        let pending: usize = queue.buckets.iter().map(Vec::len).sum();
        if pending > 0 {
            trace!("release: tearing down with {} pending resources", pending);
        }
    }
}

/// Advance one frame, destroying the bucket whose resources were retired two
/// full frames ago.
pub fn rotate() {
    let mut queue = QUEUE.lock();
    if let Some(queue) = queue.as_mut() {
        queue.cursor = (queue.cursor + 1) % BUCKET_COUNT;
        let aged_out = std::mem::take(&mut queue.buckets[queue.cursor]);
        if !aged_out.is_empty() {
            trace!("release: destroying {} aged resources", aged_out.len());
        }
        drop(aged_out);
    }
}

fn enqueue(resource: Box<dyn Any + Send>) {
    let mut queue = QUEUE.lock();
    match queue.as_mut() {
        Some(queue) => {
            let cursor = queue.cursor;
            queue.buckets[cursor].push(resource);
        }
        // No device; nothing can be in flight, destroy immediately.
        None => drop(resource),
    }
}

/// An owning handle whose payload is released through the per-frame queue
/// instead of being destroyed inline.
pub struct Deferred<T: Send + 'static> {
    value: Option<T>,
}

impl<T: Send + 'static> Deferred<T> {
    pub fn new(value: T) -> Self {
        Self { value: Some(value) }
    }
}

impl<T: Send + 'static> Deref for Deferred<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value.as_ref().expect("deferred value already taken")
    }
}

impl<T: Send + 'static> DerefMut for Deferred<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("deferred value already taken")
    }
}

impl<T: Send + 'static> Drop for Deferred<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            enqueue(Box::new(value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    struct Canary(Arc<AtomicBool>);

    impl Drop for Canary {
        fn drop(&mut self) {
            self.0.store(true, Ordering::Release);
        }
    }

    #[test]
    fn deferred_survives_two_frames() {
        // Tests in this crate share the process-wide queue; keep the whole
        // scenario in one test to avoid cross-talk.
        init();

        let dropped = Arc::new(AtomicBool::new(false));
        let handle = Deferred::new(Canary(Arc::clone(&dropped)));
        drop(handle);

        rotate();
        assert!(!dropped.load(Ordering::Acquire));
        rotate();
        assert!(!dropped.load(Ordering::Acquire));
        rotate();
        assert!(dropped.load(Ordering::Acquire));

        // Without an installed queue the payload dies inline.
        teardown();
        let dropped = Arc::new(AtomicBool::new(false));
        drop(Deferred::new(Canary(Arc::clone(&dropped))));
        assert!(dropped.load(Ordering::Acquire));
    }
}

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
use std::{
    cell::UnsafeCell,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};
use zerocopy::{AsBytes, FromBytes};

struct Page<T> {
    slots: Box<[UnsafeCell<T>]>,
}

struct Shared<T> {
    label: &'static str,
    pages: [Page<T>; 2],
    front: AtomicUsize,
    locked: AtomicBool,
}

// Concurrent writers are required by contract to hold disjoint reserved slot
// ranges, so shared mutable access through UnsafeCell never races.
unsafe impl<T: Send> Send for Shared<T> {}
unsafe impl<T: Send> Sync for Shared<T> {}

/// A double-buffered, CPU-visible structured buffer. `lock_discard` flips to
/// the back page and returns a [`MappedBuffer`] view; the previous contents
/// of that page are garbage and every slot the caller reserved must be
/// rewritten before `unlock`.
pub struct UploadBuffer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> UploadBuffer<T>
where
    T: AsBytes + FromBytes + Copy + Default,
{
    pub(crate) fn new(label: &'static str, count: usize) -> Self {
        let make_page = || Page {
            slots: (0..count)
                .map(|_| UnsafeCell::new(T::default()))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
        };
        Self {
            shared: Arc::new(Shared {
                label,
                pages: [make_page(), make_page()],
                front: AtomicUsize::new(0),
                locked: AtomicBool::new(false),
            }),
        }
    }

    pub fn label(&self) -> &'static str {
        self.shared.label
    }

    pub fn len(&self) -> usize {
        self.shared.pages[0].slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn byte_len(&self) -> usize {
        self.len() * std::mem::size_of::<T>()
    }

    /// Map the buffer for writing, discarding previous contents.
    pub fn lock_discard(&self) -> MappedBuffer<T> {
        let was_locked = self.shared.locked.swap(true, Ordering::AcqRel);
        debug_assert!(!was_locked, "{}: locked twice", self.shared.label);
        let page = self.shared.front.fetch_xor(1, Ordering::AcqRel) ^ 1;
        MappedBuffer {
            shared: Arc::clone(&self.shared),
            page,
        }
    }

    pub fn unlock(&self) {
        let was_locked = self.shared.locked.swap(false, Ordering::AcqRel);
        debug_assert!(was_locked, "{}: unlock without lock", self.shared.label);
    }

    /// Copy out the most recently written page. This stands in for the
    /// backend's staging-to-device copy and is what tests inspect.
    pub fn snapshot(&self) -> Vec<T> {
        debug_assert!(
            !self.shared.locked.load(Ordering::Acquire),
            "{}: snapshot while mapped",
            self.shared.label
        );
        let page = &self.shared.pages[self.shared.front.load(Ordering::Acquire)];
        page.slots
            .iter()
            .map(|slot| unsafe { *slot.get() })
            .collect()
    }
}

/// A mapped view of one page of an [`UploadBuffer`]. Cheap to clone into
/// per-bucket jobs; each writer must only touch slots it reserved.
pub struct MappedBuffer<T> {
    shared: Arc<Shared<T>>,
    page: usize,
}

impl<T> Clone for MappedBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            page: self.page,
        }
    }
}

impl<T: Copy> MappedBuffer<T> {
    pub fn len(&self) -> usize {
        self.shared.pages[self.page].slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write one record. Returns false when `index` is out of range.
    pub fn write(&self, index: usize, value: T) -> bool {
        match self.shared.pages[self.page].slots.get(index) {
            Some(slot) => {
                unsafe { *slot.get() = value };
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Device;
    use std::thread;

    #[test]
    fn write_and_snapshot_round_trip() {
        let device = Device::new();
        let buffer = device.create_upload_buffer::<u32>("test", 8);
        let mapped = buffer.lock_discard();
        for n in 0..8 {
            assert!(mapped.write(n, n as u32 * 10));
        }
        drop(mapped);
        buffer.unlock();
        assert_eq!(buffer.snapshot(), vec![0, 10, 20, 30, 40, 50, 60, 70]);
    }

    #[test]
    fn out_of_range_write_is_refused() {
        let device = Device::new();
        let buffer = device.create_upload_buffer::<u32>("test", 4);
        let mapped = buffer.lock_discard();
        assert!(!mapped.write(4, 1));
        drop(mapped);
        buffer.unlock();
    }

    #[test]
    fn pages_alternate_between_locks() {
        let device = Device::new();
        let buffer = device.create_upload_buffer::<u32>("test", 1);

        let mapped = buffer.lock_discard();
        mapped.write(0, 1);
        drop(mapped);
        buffer.unlock();
        assert_eq!(buffer.snapshot(), vec![1]);

        let mapped = buffer.lock_discard();
        mapped.write(0, 2);
        drop(mapped);
        buffer.unlock();
        assert_eq!(buffer.snapshot(), vec![2]);

        // The first page still holds the older frame's data.
        let mapped = buffer.lock_discard();
        drop(mapped);
        buffer.unlock();
        assert_eq!(buffer.snapshot(), vec![1]);
    }

    #[test]
    fn disjoint_parallel_writes_land() {
        let device = Device::new();
        let buffer = device.create_upload_buffer::<u64>("test", 1024);
        let mapped = buffer.lock_discard();

        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let view = mapped.clone();
                thread::spawn(move || {
                    for n in (worker..1024).step_by(4) {
                        view.write(n, n as u64);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        drop(mapped);
        buffer.unlock();

        let snapshot = buffer.snapshot();
        for (n, value) in snapshot.iter().enumerate() {
            assert_eq!(*value, n as u64);
        }
    }
}

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

//! The slice of the device layer the particle core depends on: opaque ids
//! for GPU-resident buffers, CPU-visible structured staging buffers with
//! lock-discard semantics, and the deferred release queue that keeps
//! retired resources alive until the GPU can no longer reference them.

mod upload;

pub mod release;

pub use upload::{MappedBuffer, UploadBuffer};

use log::trace;
use std::sync::atomic::{AtomicU64, Ordering};
use zerocopy::{AsBytes, FromBytes};

/// Opaque handle to a GPU-resident buffer owned by the backend.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct BufferId(u64);

impl BufferId {
    pub fn as_raw(self) -> u64 {
        self.0
    }
}

/// Hands out buffer ids and staging memory. Real backends sit behind this
/// boundary; everything the core writes goes through [`UploadBuffer`] and is
/// copied to the GPU by the owner of the frame graph.
#[derive(Default)]
pub struct Device {
    next_buffer_id: AtomicU64,
}

impl Device {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a GPU-resident buffer of `bytes` bytes. The contents are
    /// device-side only; the core never reads or writes them.
    pub fn create_buffer(&self, label: &'static str, bytes: usize) -> BufferId {
        let id = self.next_buffer_id.fetch_add(1, Ordering::AcqRel) + 1;
        trace!("device: buffer {} ({} bytes) -> {}", label, bytes, id);
        BufferId(id)
    }

    /// Create a double-buffered structured staging buffer of `count` records.
    pub fn create_upload_buffer<T>(&self, label: &'static str, count: usize) -> UploadBuffer<T>
    where
        T: AsBytes + FromBytes + Copy + Default,
    {
        trace!(
            "device: staging buffer {} ({} x {} bytes)",
            label,
            count,
            std::mem::size_of::<T>()
        );
        UploadBuffer::new(label, count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_ids_are_unique_and_nonzero() {
        let device = Device::new();
        let a = device.create_buffer("a", 16);
        let b = device.create_buffer("b", 16);
        assert_ne!(a, b);
        assert_ne!(a.as_raw(), 0);
        assert_ne!(b.as_raw(), 0);
    }
}

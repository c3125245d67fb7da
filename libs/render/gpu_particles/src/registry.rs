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

//! The sharded emitter registry. Eight independent buckets keep the frame
//! jobs contention-free: tick and upload run one job per bucket, and public
//! calls only touch the single bucket their UID routes to.

use crate::emitter::Emitter;
use fxhash::FxHashMap;
use parking_lot::RwLock;
use sparse::{SparseId, SparseSet};
use std::num::NonZeroU64;

pub(crate) const BUCKET_COUNT: usize = 8;

/// External emitter identity. Always odd: the UID counter is shifted left
/// and OR'd with one, so zero stays reserved as the "no emitter" sentinel in
/// GPU-side data.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EmitterId(NonZeroU64);

impl EmitterId {
    pub(crate) fn from_serial(serial: u64) -> Self {
        Self(NonZeroU64::new((serial << 1) | 1).expect("odd uids cannot be zero"))
    }

    pub fn as_raw(self) -> u64 {
        self.0.get()
    }

    /// Rehydrate an id received from the outside; zero is rejected.
    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }
}

pub(crate) fn bucket_index(id: EmitterId) -> usize {
    ((id.as_raw() >> 1) % BUCKET_COUNT as u64) as usize
}

#[derive(Default)]
pub(crate) struct BucketState {
    pub emitters: SparseSet<Emitter>,
    pub ids: FxHashMap<u64, SparseId>,
}

impl BucketState {
    pub fn resolve(&self, id: EmitterId) -> Option<SparseId> {
        let handle = *self.ids.get(&id.as_raw())?;
        self.emitters.contains(handle).then_some(handle)
    }
}

pub(crate) struct Registry {
    buckets: [RwLock<BucketState>; BUCKET_COUNT],
}

impl Registry {
    pub fn new() -> Self {
        Self {
            buckets: Default::default(),
        }
    }

    pub fn bucket(&self, index: usize) -> &RwLock<BucketState> {
        &self.buckets[index]
    }

    pub fn bucket_for(&self, id: EmitterId) -> &RwLock<BucketState> {
        &self.buckets[bucket_index(id)]
    }

    pub fn buckets(&self) -> impl Iterator<Item = &RwLock<BucketState>> {
        self.buckets.iter()
    }

    /// Run `func` against a live emitter, under the bucket's write lock.
    /// Unknown or dead UIDs are a silent no-op by contract: the caller may
    /// be racing a concurrent destroy.
    pub fn modify(&self, id: EmitterId, func: impl FnOnce(&mut Emitter)) {
        let mut bucket = self.bucket_for(id).write();
        if let Some(handle) = bucket.resolve(id) {
            if let Some(emitter) = bucket.emitters.get_mut(handle) {
                if emitter.is_alive() {
                    func(emitter);
                }
            }
        }
    }

    /// Read-path access to a live emitter. Shared references only, so this
    /// runs concurrently with other readers and with the atomic culling
    /// callback.
    pub fn inspect<R>(&self, id: EmitterId, func: impl FnOnce(&Emitter) -> R) -> Option<R> {
        let bucket = self.bucket_for(id).read();
        let handle = bucket.resolve(id)?;
        bucket.emitters.get(handle).map(func)
    }
}

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

//! GPU-driven particle engine core. Tens of thousands of particles across
//! thousands of emitters: per-frame CPU bookkeeping on this side, simulation
//! and rasterization on the GPU side.
//!
//! One frame looks like this:
//!
//! ```text
//! frame_move_begin(dt, cull_priority)
//!   free dead emitters -> allocate/evict slots -> culling entity
//!     -> bucket-parallel tick + entity moves -> fence
//! frame_move_end()
//!   map buffers -> bucket-parallel record upload -> fence
//!     -> bucket-parallel finalize -> fence
//! ```
//!
//! The device, entity, and job systems are collaborators by contract; see
//! the `device`, `entity`, and `job` crates for the seams.

mod emitter;
mod gpu;
mod registry;
mod system;
mod template;

pub use crate::{
    emitter::TransientFlags,
    gpu::{
        pack_flags, BoneGpuRecord, EmitterGpuRecord, GpuFlags, ParticleGpuRecord,
        BONE_BUFFER_COUNT, EMITTER_COUNT, INSTANCE_COUNT,
    },
    registry::EmitterId,
    system::{engine_graphs, CullPriorityFn, ParticleSystem, Stats},
    template::{
        CullPriority, DrawCallDesc, EmitterInterval, EmitterTemplate, FaceLock, LockMode,
        ParticleBudget, RateCurve, RenderPassDesc, TemplateFlags,
    },
};

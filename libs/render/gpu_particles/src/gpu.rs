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

//! Wire formats shared with the particle shaders, and the platform-tier
//! buffer budgets. Every layout here is load-bearing: offsets and bit
//! positions must match the shader side exactly.

use crate::emitter::TransientFlags;
use crate::template::TemplateFlags;
use bitflags::bitflags;
use std::mem;
use zerocopy::{AsBytes, FromBytes};

const KB: usize = 1024;
const MB: usize = 1024 * KB;

#[cfg(feature = "tier-mobile")]
mod tier {
    use super::{KB, MB};
    pub const MAX_INSTANCE_BUFFER_SIZE: usize = 16 * MB;
    pub const MAX_BONE_BUFFER_SIZE: usize = 512 * KB;
    pub const MAX_EMITTER_BUFFER_SIZE: usize = MB;
}

#[cfg(all(feature = "tier-console", not(feature = "tier-mobile")))]
mod tier {
    use super::MB;
    pub const MAX_INSTANCE_BUFFER_SIZE: usize = 32 * MB;
    pub const MAX_BONE_BUFFER_SIZE: usize = MB;
    pub const MAX_EMITTER_BUFFER_SIZE: usize = 2 * MB;
}

#[cfg(not(any(feature = "tier-mobile", feature = "tier-console")))]
mod tier {
    use super::MB;
    pub const MAX_INSTANCE_BUFFER_SIZE: usize = 64 * MB;
    pub const MAX_BONE_BUFFER_SIZE: usize = 2 * MB;
    pub const MAX_EMITTER_BUFFER_SIZE: usize = 4 * MB;
}

pub use tier::{MAX_BONE_BUFFER_SIZE, MAX_EMITTER_BUFFER_SIZE, MAX_INSTANCE_BUFFER_SIZE};

/// Per-particle state, owned and written entirely by the GPU. The CPU only
/// ever uses its size to derive the slot pool capacity. Half-precision
/// fields are stored as raw `u16` bit patterns.
#[repr(C)]
#[derive(AsBytes, FromBytes, Copy, Clone, Debug, Default)]
pub struct ParticleGpuRecord {
    pub color: [u16; 4],
    pub size_mass: [u16; 2],
    pub emitter_uid: u32,
    pub pos: [f32; 3],
    pub phase: f32,
    pub scale: [f32; 3],
    pub bone_frac: [u16; 2],
    pub velocity: [u16; 4],
    pub rotation: [u16; 4],
    pub angular_velocity: [u16; 4],
    pub spawn_uvs: [u16; 2],
    pub emitter_phase: [u16; 2],
    pub uniform_scale: [u16; 4],
    pub padding: [u16; 4],
}

/// Per-emitter record uploaded once per frame. 16-byte aligned rows; the
/// shader indexes this buffer with the slot passed through its uniforms.
#[repr(C)]
#[derive(AsBytes, FromBytes, Copy, Clone, Debug, Default, PartialEq)]
pub struct EmitterGpuRecord {
    pub scale: [f32; 3],
    pub duration: f32,
    pub last_scale: [f32; 3],
    pub dead_time: f32,
    pub inverse_scale: [f32; 3],
    pub packed_flags: u32,
    pub last_inverse_scale: [f32; 3],
    pub delta_time: f32,
    pub rotation: [f32; 4],
    pub last_rotation: [f32; 4],
    pub translation: [f32; 3],
    pub time: f32,
    pub last_translation: [f32; 3],
    pub prev_time: f32,
    pub culling_aggression: f32,
    pub bone_start: u32,
    pub bone_count: u32,
    pub particles_start: u32,
}

/// One bone of an emitter chain: current and previous position with the
/// cumulative chain distance in `w`.
#[repr(C)]
#[derive(AsBytes, FromBytes, Copy, Clone, Debug, Default, PartialEq)]
pub struct BoneGpuRecord {
    pub pos: [f32; 4],
    pub prev_pos: [f32; 4],
}

pub const INSTANCE_COUNT: usize = MAX_INSTANCE_BUFFER_SIZE / mem::size_of::<ParticleGpuRecord>();
pub const BONE_BUFFER_COUNT: usize = MAX_BONE_BUFFER_SIZE / mem::size_of::<BoneGpuRecord>();
pub const EMITTER_COUNT: usize = MAX_EMITTER_BUFFER_SIZE / mem::size_of::<EmitterGpuRecord>();

// Dynamic-culling tile grid. SLOTS_PER_THREAD must stay in sync with the
// culling shader.
pub const TILE_COUNT_X: usize = 64;
pub const TILE_COUNT_Y: usize = 32;
pub const TILE_COUNT: usize = TILE_COUNT_X * TILE_COUNT_Y;
pub const INSTANCES_PER_TILE: usize = 512;
pub const SLOTS_PER_THREAD: usize = 16;
pub const THREADS_PER_TILE: usize = INSTANCES_PER_TILE / SLOTS_PER_THREAD;

// Shader binding slots for the shared particle buffers.
pub const PARTICLE_DATA_SLOT: u32 = 0;
pub const PARTICLE_INDEX_SLOT: u32 = 1;
pub const EMITTER_BONES_SLOT: u32 = 2;
pub const EMITTER_DATA_SLOT: u32 = 3;
pub const CULLING_META_SLOT: u32 = 4;
pub const CULLING_TILES_SLOT: u32 = 5;

bitflags! {
    /// The packed per-emitter flag word as the shaders read it. Bit
    /// positions are frozen.
    pub struct GpuFlags: u32 {
        const EMITTING                  = 0x0000_0001;
        const CONTINUOUS                = 0x0000_0002;
        const LOCK_TRANSLATION          = 0x0000_0004;
        const LOCK_ROTATION             = 0x0000_0008;
        const LOCK_ROTATION_EMIT        = 0x0000_0010;
        const LOCK_SCALE_X              = 0x0000_0020;
        const LOCK_SCALE_X_EMIT         = 0x0000_0040;
        const LOCK_SCALE_Y              = 0x0000_0080;
        const LOCK_SCALE_Y_EMIT         = 0x0000_0100;
        const LOCK_SCALE_Z              = 0x0000_0200;
        const LOCK_SCALE_Z_EMIT         = 0x0000_0400;
        const LOCK_SCALE_X_BONE         = 0x0000_0800;
        const LOCK_SCALE_X_BONE_EMIT    = 0x0000_1000;
        const LOCK_SCALE_Y_BONE         = 0x0000_2000;
        const LOCK_SCALE_Y_BONE_EMIT    = 0x0000_4000;
        const LOCK_SCALE_Z_BONE         = 0x0000_8000;
        const LOCK_SCALE_Z_BONE_EMIT    = 0x0001_0000;
        const LOCK_MOVEMENT             = 0x0002_0000;
        const REVERSE_BONES             = 0x0004_0000;
        const NEW                       = 0x0008_0000;
        const TELEPORTED                = 0x0010_0000;
        const LOCK_TRANSLATION_BONE     = 0x0020_0000;
        const LOCK_ROTATION_BONE        = 0x0040_0000;
        const LOCK_ROTATION_BONE_EMIT   = 0x0080_0000;
        const LOCK_MOVEMENT_BONE        = 0x0100_0000;
        const VISIBLE                   = 0x0200_0000;
        const DYNAMIC_CULLING           = 0x0400_0000;
    }
}

/// Compress the emitter's state into the shader-visible flag word.
pub fn pack_flags(
    flags: TemplateFlags,
    transient: TransientFlags,
    dynamic_culling: bool,
) -> GpuFlags {
    let mut packed = GpuFlags::empty();
    if transient.intersects(TransientFlags::ACTIVE | TransientFlags::LAST_EMIT) {
        packed |= GpuFlags::EMITTING;
    }
    if flags.contains(TemplateFlags::CONTINUOUS) {
        packed |= GpuFlags::CONTINUOUS;
    }
    if flags.contains(TemplateFlags::LOCK_TRANSLATION) {
        packed |= GpuFlags::LOCK_TRANSLATION;
    }
    if flags.contains(TemplateFlags::LOCK_ROTATION) {
        packed |= GpuFlags::LOCK_ROTATION;
    }
    if flags.contains(TemplateFlags::LOCK_ROTATION_EMIT) {
        packed |= GpuFlags::LOCK_ROTATION_EMIT;
    }
    if flags.contains(TemplateFlags::LOCK_SCALE_X) {
        packed |= GpuFlags::LOCK_SCALE_X;
    }
    if flags.contains(TemplateFlags::LOCK_SCALE_X_EMIT) {
        packed |= GpuFlags::LOCK_SCALE_X_EMIT;
    }
    if flags.contains(TemplateFlags::LOCK_SCALE_Y) {
        packed |= GpuFlags::LOCK_SCALE_Y;
    }
    if flags.contains(TemplateFlags::LOCK_SCALE_Y_EMIT) {
        packed |= GpuFlags::LOCK_SCALE_Y_EMIT;
    }
    if flags.contains(TemplateFlags::LOCK_SCALE_Z) {
        packed |= GpuFlags::LOCK_SCALE_Z;
    }
    if flags.contains(TemplateFlags::LOCK_SCALE_Z_EMIT) {
        packed |= GpuFlags::LOCK_SCALE_Z_EMIT;
    }
    if flags.contains(TemplateFlags::LOCK_SCALE_X_BONE) {
        packed |= GpuFlags::LOCK_SCALE_X_BONE;
    }
    if flags.contains(TemplateFlags::LOCK_SCALE_X_BONE_EMIT) {
        packed |= GpuFlags::LOCK_SCALE_X_BONE_EMIT;
    }
    if flags.contains(TemplateFlags::LOCK_SCALE_Y_BONE) {
        packed |= GpuFlags::LOCK_SCALE_Y_BONE;
    }
    if flags.contains(TemplateFlags::LOCK_SCALE_Y_BONE_EMIT) {
        packed |= GpuFlags::LOCK_SCALE_Y_BONE_EMIT;
    }
    if flags.contains(TemplateFlags::LOCK_SCALE_Z_BONE) {
        packed |= GpuFlags::LOCK_SCALE_Z_BONE;
    }
    if flags.contains(TemplateFlags::LOCK_SCALE_Z_BONE_EMIT) {
        packed |= GpuFlags::LOCK_SCALE_Z_BONE_EMIT;
    }
    if flags.contains(TemplateFlags::LOCK_MOVEMENT) {
        packed |= GpuFlags::LOCK_MOVEMENT;
    }
    if flags.contains(TemplateFlags::REVERSE_BONES) {
        packed |= GpuFlags::REVERSE_BONES;
    }
    if transient.contains(TransientFlags::NEW) {
        packed |= GpuFlags::NEW;
    }
    if transient.contains(TransientFlags::TELEPORTED) {
        packed |= GpuFlags::TELEPORTED;
    }
    if flags.contains(TemplateFlags::LOCK_TRANSLATION_BONE) {
        packed |= GpuFlags::LOCK_TRANSLATION_BONE;
    }
    if flags.contains(TemplateFlags::LOCK_ROTATION_BONE) {
        packed |= GpuFlags::LOCK_ROTATION_BONE;
    }
    if flags.contains(TemplateFlags::LOCK_ROTATION_BONE_EMIT) {
        packed |= GpuFlags::LOCK_ROTATION_BONE_EMIT;
    }
    if flags.contains(TemplateFlags::LOCK_MOVEMENT_BONE) {
        packed |= GpuFlags::LOCK_MOVEMENT_BONE;
    }
    if transient.contains(TransientFlags::VISIBLE)
        && !transient.contains(TransientFlags::WAS_CULLED)
    {
        packed |= GpuFlags::VISIBLE;
    }
    if dynamic_culling {
        packed |= GpuFlags::DYNAMIC_CULLING;
    }
    packed
}

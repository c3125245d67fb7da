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

//! The per-emitter state machine: interval scheduling, lifetime accounting,
//! transform bookkeeping, draw-call binding, and the per-frame GPU record
//! writes.

use crate::gpu::{
    pack_flags, BoneGpuRecord, EmitterGpuRecord, BONE_BUFFER_COUNT, EMITTER_COUNT,
};
use crate::registry::EmitterId;
use crate::template::{DrawCallDesc, EmitterTemplate, TemplateFlags};
use bitflags::bitflags;
use buddy::BuddyAllocator;
use device::MappedBuffer;
use entity::{
    Bindings, BlendMode, CullMode, EntityDesc, EntityId, EntitySystem, PrimitiveType, UniformKey,
    UniformValue, Uniforms,
};
use geometry::{decompose_transform, Aabb};
use nalgebra::{Matrix4, Point3, UnitQuaternion, Vector3};
use smallvec::SmallVec;
use sparse::SparseId;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

bitflags! {
    /// Frame-to-frame emitter status bits; packed alongside the template
    /// flags for the GPU.
    pub struct TransientFlags: u32 {
        const NEW        = 1 << 0;
        const PAUSED     = 1 << 1;
        const TELEPORTED = 1 << 2;
        const ALIVE      = 1 << 3;
        const ACTIVE     = 1 << 4;
        const VISIBLE    = 1 << 5;
        const LAST_EMIT  = 1 << 6;
        const WAS_ACTIVE = 1 << 7;
        const WAS_CULLED = 1 << 8;
        const STATELESS  = 1 << 9;
        const GC         = 1 << 10;
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BonePosition {
    pub position: Vector3<f32>,
    pub distance: f32,
}

impl BonePosition {
    pub fn new(position: Vector3<f32>) -> Self {
        Self {
            position,
            distance: 0.0,
        }
    }
}

/// Everything `move_entities` needs from the frame coordinator.
pub(crate) struct MoveContext<'a> {
    pub entities: &'a dyn EntitySystem,
    pub emitter_offset: &'a AtomicUsize,
    pub bone_offset: &'a AtomicUsize,
}

/// Everything `upload` needs: the mapped buffers plus this frame's culling
/// state and read access to the slot allocator.
pub(crate) struct UploadContext<'a> {
    pub emitters: &'a MappedBuffer<EmitterGpuRecord>,
    pub bones: &'a MappedBuffer<BoneGpuRecord>,
    pub allocator: &'a BuddyAllocator,
    pub culling_aggression: f32,
    pub dynamic_culling: bool,
}

fn sample_range(range: (f32, f32)) -> f32 {
    let (min, max) = range;
    if max <= min {
        return min;
    }
    min + (max - min) * fastrand::f32()
}

fn matrix_uniform(m: &Matrix4<f32>) -> UniformValue {
    let mut values = [0f32; 16];
    values.copy_from_slice(m.as_slice());
    UniformValue::Matrix(values)
}

pub(crate) struct Emitter {
    pub(crate) template: Arc<EmitterTemplate>,
    pub(crate) uid: EmitterId,

    flags: TemplateFlags,
    transient: TransientFlags,
    culled: AtomicBool,

    pub(crate) emitter_duration: f32,
    pub(crate) particle_duration: f32,
    pub(crate) particle_count: u32,
    seed: f32,
    start_time: f32,

    animation_speed: f32,
    emitter_time: f32,
    prev_emitter_time: f32,
    event_time: f32,
    particle_delta_time: f32,
    interval_duration: f32,
    die_time: f32,
    particle_die_time: f32,

    pub(crate) allocation: Option<SparseId>,
    emitter_slot: usize,
    bone_slot: usize,

    pub(crate) bone_positions: SmallVec<[BonePosition; 8]>,
    prev_bone_positions: SmallVec<[BonePosition; 8]>,

    update_entity: Option<EntityId>,
    sort_entity: Option<EntityId>,
    render_entities: SmallVec<[EntityId; 1]>,
    dynamic_parameters: SmallVec<[(u64, UniformValue); 2]>,

    transform: Matrix4<f32>,
    translation: Vector3<f32>,
    last_translation: Vector3<f32>,
    rotation: UnitQuaternion<f32>,
    last_rotation: UnitQuaternion<f32>,
    scale: Vector3<f32>,
    last_scale: Vector3<f32>,
    inverse_scale: Vector3<f32>,
    last_inverse_scale: Vector3<f32>,
}

impl Emitter {
    pub(crate) fn new(
        uid: EmitterId,
        template: Arc<EmitterTemplate>,
        animation_speed: f32,
        event_duration: f32,
        delay: f32,
        now: f32,
    ) -> Self {
        let mut flags = template.template_flags();
        let animation_event = event_duration >= 0.0;
        if animation_event {
            flags |= TemplateFlags::ANIM_EVENT;
        }

        let seed = template.custom_seed.unwrap_or_else(fastrand::f32);
        let emitter_duration = if animation_event {
            event_duration
        } else {
            sample_range(template.emitter_duration)
        };

        let mut transient =
            TransientFlags::ALIVE | TransientFlags::ACTIVE | TransientFlags::NEW | TransientFlags::VISIBLE;
        if template.stateless {
            transient |= TransientFlags::STATELESS;
        }

        // A start delay runs the clocks up from negative time; the first
        // interval phase absorbs the same delay so both agree on t=0.
        let clock = (-delay).min(0.0);
        let mut interval_duration = -1.0;
        if template.interval.max_start > 0.0 {
            interval_duration =
                sample_range((template.interval.min_start, template.interval.max_start)).max(0.0)
                    + delay.max(0.0);
            transient |= TransientFlags::PAUSED;
        } else if template.interval.max_active > 0.0 {
            interval_duration =
                sample_range((template.interval.min_active, template.interval.max_active)).max(0.0)
                    + delay.max(0.0);
        }

        let particle_count = template.compute_particle_count(seed, animation_event);

        Self {
            uid,
            flags,
            transient,
            culled: AtomicBool::new(true),
            emitter_duration,
            particle_duration: sample_range(template.particle_duration),
            particle_count,
            seed,
            start_time: now + delay.max(0.0),
            animation_speed: animation_speed.max(template.min_animation_speed),
            emitter_time: clock,
            prev_emitter_time: clock,
            event_time: clock,
            particle_delta_time: 0.0,
            interval_duration,
            die_time: 0.0,
            particle_die_time: 0.0,
            allocation: None,
            emitter_slot: EMITTER_COUNT,
            bone_slot: BONE_BUFFER_COUNT,
            bone_positions: SmallVec::new(),
            prev_bone_positions: SmallVec::new(),
            update_entity: None,
            sort_entity: None,
            render_entities: SmallVec::new(),
            dynamic_parameters: SmallVec::new(),
            transform: Matrix4::identity(),
            translation: Vector3::zeros(),
            last_translation: Vector3::zeros(),
            rotation: UnitQuaternion::identity(),
            last_rotation: UnitQuaternion::identity(),
            scale: Vector3::repeat(1.0),
            last_scale: Vector3::repeat(1.0),
            inverse_scale: Vector3::repeat(1.0),
            last_inverse_scale: Vector3::repeat(1.0),
            template,
        }
    }

    fn set_flag(&mut self, value: bool, flag: TransientFlags) {
        if value {
            self.transient |= flag;
        } else {
            self.transient &= !flag;
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.transient.contains(TransientFlags::ALIVE)
    }

    pub(crate) fn is_active(&self) -> bool {
        self.transient.contains(TransientFlags::ACTIVE)
    }

    pub(crate) fn is_gc(&self) -> bool {
        self.transient.contains(TransientFlags::GC)
    }

    pub(crate) fn is_stateless(&self) -> bool {
        self.transient.contains(TransientFlags::STATELESS)
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.transient.contains(TransientFlags::PAUSED)
    }

    pub(crate) fn was_culled(&self) -> bool {
        self.transient.contains(TransientFlags::WAS_CULLED)
    }

    pub(crate) fn is_culled(&self) -> bool {
        self.culled.load(Ordering::Acquire)
    }

    pub(crate) fn has_draw_calls(&self) -> bool {
        !self.render_entities.is_empty()
    }

    pub(crate) fn transient_flags(&self) -> TransientFlags {
        self.transient
    }

    pub(crate) fn emitter_time(&self) -> f32 {
        self.emitter_time
    }

    pub(crate) fn bone_count(&self) -> u32 {
        self.bone_positions.len() as u32
    }

    pub(crate) fn set_gc(&mut self) {
        self.transient |= TransientFlags::GC;
    }

    /// Renderer visibility callback; this is the one mutation allowed on the
    /// registry's read path.
    pub(crate) fn set_culled(&self, culled: bool) {
        self.culled.store(culled, Ordering::Release);
    }

    pub(crate) fn set_alive(&mut self, alive: bool) {
        self.set_flag(alive, TransientFlags::ALIVE);
    }

    pub(crate) fn set_active(&mut self, active: bool) {
        self.set_flag(active, TransientFlags::ACTIVE);
    }

    pub(crate) fn set_new(&mut self, is_new: bool) {
        self.set_flag(is_new, TransientFlags::NEW);
    }

    pub(crate) fn set_teleported(&mut self, teleported: bool) {
        self.set_flag(teleported, TransientFlags::TELEPORTED);
    }

    pub(crate) fn set_visible(&mut self, visible: bool) {
        self.set_flag(visible, TransientFlags::VISIBLE);
    }

    pub(crate) fn set_animation_speed(&mut self, speed: f32) {
        self.animation_speed = speed.max(self.template.min_animation_speed);
    }

    pub(crate) fn set_transform(&mut self, transform: Matrix4<f32>) {
        self.transform = transform;
    }

    pub(crate) fn set_bones(&mut self, positions: &[Vector3<f32>]) {
        self.bone_positions.clear();
        self.bone_positions
            .extend(positions.iter().map(|p| BonePosition::new(*p)));
    }

    pub(crate) fn set_allocation(&mut self, allocation: Option<SparseId>) {
        self.allocation = allocation;
    }

    pub(crate) fn kill_orphaned(&mut self) {
        if !self.transient.contains(TransientFlags::ACTIVE) {
            self.transient &= !TransientFlags::ALIVE;
        }
    }

    /// Advance the state machine by one frame.
    pub(crate) fn tick(&mut self, delta_time: f32) {
        let was_culled = self.culled.swap(true, Ordering::AcqRel);
        self.set_flag(was_culled, TransientFlags::WAS_CULLED);

        if !self.transient.contains(TransientFlags::NEW) {
            self.transient &= !TransientFlags::LAST_EMIT;
        }

        if self.emitter_time > 0.0 {
            self.transient &= !TransientFlags::NEW;
        }

        // An orphaned-then-reactivated one-shot restarts from scratch.
        if self.transient.contains(TransientFlags::ACTIVE)
            && !self.transient.contains(TransientFlags::WAS_ACTIVE)
            && !self.flags.contains(TemplateFlags::CONTINUOUS)
            && self.emitter_time > 0.0
        {
            self.emitter_time = 0.0;
            self.transient |= TransientFlags::NEW;

            if self.template.interval.max_start > 0.0 {
                self.interval_duration =
                    sample_range((self.template.interval.min_start, self.template.interval.max_start))
                        .max(0.0);
                self.transient |= TransientFlags::PAUSED;
            }
        }

        self.prev_emitter_time = self.emitter_time;

        let anim_speed = self.animation_speed.max(self.template.min_animation_speed);
        let particle_speed = if self.flags.contains(TemplateFlags::ANIM_SPEED_PARTICLE) {
            anim_speed
        } else {
            1.0
        };
        let emitter_speed = if self.flags.contains(TemplateFlags::ANIM_SPEED_EMITTER) {
            anim_speed
        } else {
            1.0
        };

        if !self.transient.contains(TransientFlags::ACTIVE) {
            self.transient &= !TransientFlags::PAUSED;
        } else if self.interval_duration >= 0.0 {
            self.interval_duration -= emitter_speed * delta_time;
            if self.interval_duration < 0.0 {
                self.transient ^= TransientFlags::PAUSED;
                if self.transient.contains(TransientFlags::PAUSED) {
                    if self.template.interval.max_pause > 0.0 {
                        self.interval_duration = sample_range((
                            self.template.interval.min_pause,
                            self.template.interval.max_pause,
                        ))
                        .max(0.0);
                    } else {
                        self.interval_duration = -1.0;
                        self.transient ^= TransientFlags::PAUSED;
                    }
                } else if self.template.interval.max_active > 0.0 {
                    self.interval_duration = sample_range((
                        self.template.interval.min_active,
                        self.template.interval.max_active,
                    ))
                    .max(0.0);
                } else {
                    self.interval_duration = -1.0;
                }
            }
        }

        if !self.transient.contains(TransientFlags::PAUSED) {
            self.emitter_time += emitter_speed * delta_time;
        }

        if self.flags.contains(TemplateFlags::ANIM_EVENT) {
            self.event_time += self.animation_speed * delta_time;
        }

        self.particle_delta_time = particle_speed * delta_time;
        if self.prev_emitter_time < 0.0 {
            // Crossing t=0 mid-step: only the portion after the start counts.
            self.particle_delta_time = if self.emitter_time >= 0.0 {
                self.emitter_time * particle_speed / emitter_speed
            } else {
                0.0
            };
        }

        if !self.bone_positions.is_empty() {
            let mut bone_length = 0.0;
            self.bone_positions[0].distance = 0.0;
            for a in 1..self.bone_positions.len() {
                bone_length +=
                    (self.bone_positions[a].position - self.bone_positions[a - 1].position).norm();
                self.bone_positions[a].distance = bone_length;
            }
        }

        if self.transient.contains(TransientFlags::ACTIVE) {
            self.transient |= TransientFlags::WAS_ACTIVE;
        }

        if self.transient.contains(TransientFlags::ACTIVE)
            && !self.flags.contains(TemplateFlags::CONTINUOUS)
            && self.event_time.max(self.emitter_time) >= self.emitter_duration
        {
            self.transient &= !TransientFlags::ACTIVE;
            self.die_time = self.event_time.max(self.emitter_time) - self.emitter_duration;
        }

        if self.transient.contains(TransientFlags::ACTIVE) {
            self.die_time = 0.0;
            self.particle_die_time = 0.0;
        } else if self.transient.contains(TransientFlags::WAS_ACTIVE) {
            self.particle_die_time = 0.0;
            self.transient |= TransientFlags::LAST_EMIT;
        } else {
            self.die_time += emitter_speed * delta_time;
            self.particle_die_time += self.particle_delta_time;
        }

        if !self.transient.contains(TransientFlags::ACTIVE) {
            self.transient &= !TransientFlags::WAS_ACTIVE;
            if self.particle_die_time > self.particle_duration
                && !self.transient.contains(TransientFlags::LAST_EMIT)
            {
                self.transient &= !TransientFlags::ALIVE;
            }
        }

        let decomposed = decompose_transform(&self.transform);
        self.translation = decomposed.translation;
        self.rotation = decomposed.rotation;
        self.scale = decomposed.scale;
        self.inverse_scale = decomposed.inverse_scale();

        if self.transient.contains(TransientFlags::NEW) {
            self.prev_bone_positions.clear();
            self.last_translation = self.translation;
            self.last_rotation = self.rotation;
            self.last_scale = self.scale;
            self.last_inverse_scale = self.inverse_scale;
        }
    }

    pub(crate) fn bounds(&self) -> Aabb {
        if self.flags.contains(TemplateFlags::IGNORE_BOUNDING) {
            return Aabb::infinite();
        }

        let mut min_v = Vector3::zeros();
        let mut max_v = Vector3::zeros();
        if !self.bone_positions.is_empty() {
            let first = self
                .transform
                .transform_point(&Point3::from(self.bone_positions[0].position));
            min_v = first.coords;
            max_v = first.coords;
            for bone in &self.bone_positions[1..] {
                let p = self
                    .transform
                    .transform_point(&Point3::from(bone.position))
                    .coords;
                min_v = min_v.inf(&p);
                max_v = max_v.sup(&p);
            }
        }

        let scale = self.scale.abs();
        let axis_scale = scale.x.max(scale.y).max(scale.z).max(1.0);
        Aabb::from_min_max(min_v, max_v).inflate(self.template.bounding_size * axis_scale)
    }

    fn object_uniforms(&self, pass_count: usize) -> Uniforms {
        let mut uniforms = Uniforms::new()
            .with(UniformKey::WorldTransform, matrix_uniform(&self.transform))
            .with(UniformKey::StartTime, UniformValue::Float(self.start_time))
            .with(
                UniformKey::EmitterUid,
                UniformValue::Uint(self.uid.as_raw() as u32),
            )
            .with(UniformKey::Seed, UniformValue::Float(self.seed))
            .with(UniformKey::EmitterSlot, UniformValue::Uint(0))
            .with(UniformKey::PassCount, UniformValue::Uint(pass_count as u32))
            .with(
                UniformKey::MaxParticles,
                UniformValue::Uint(self.particle_count),
            );
        for (hash, value) in &self.dynamic_parameters {
            uniforms.add(UniformKey::Dynamic(*hash), *value);
        }
        uniforms
    }

    /// Create the update / sort / render entities on first use. Returns true
    /// when render entities were created (the caller owes a culling
    /// reference). A desc without a render pass is a silent no-op.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn create_draw_calls(
        &mut self,
        entities: &dyn EntitySystem,
        scene_layers: u8,
        desc: &DrawCallDesc,
        fallback_mesh: &entity::RenderMesh,
        shared_bindings: &Bindings,
        shared_uniforms: &Uniforms,
        dynamic_parameters: &[(u64, UniformValue)],
        static_bindings: &Bindings,
        static_uniforms: &Uniforms,
    ) -> bool {
        if !self.render_entities.is_empty() {
            return false;
        }

        let has_update = !desc.update_graphs.is_empty();
        let has_render = !desc.render_passes.is_empty();
        let has_sort = !desc.sort_graphs.is_empty() && has_update;
        if !has_render {
            return false;
        }

        // No persistent per-particle state without an update pass.
        self.set_flag(!has_update, TransientFlags::STATELESS);

        self.dynamic_parameters.clear();
        self.dynamic_parameters
            .extend(dynamic_parameters.iter().cloned());

        let object_uniforms = self.object_uniforms(desc.render_passes.len());
        let debug_name = desc.debug_name.clone().unwrap_or_default();

        if has_update {
            let id = entities.next_entity_id();
            let update_desc = EntityDesc::default()
                .with_blend_mode(BlendMode::Compute)
                .with_layers(scene_layers)
                .with_primitive_type(PrimitiveType::TriangleList)
                .with_cull_mode(CullMode::None)
                .with_graphs(desc.update_graphs.iter().copied())
                .with_object_uniforms(object_uniforms.clone())
                .with_object_uniforms(desc.object_uniforms.clone())
                .with_pipeline_uniforms(shared_uniforms.clone())
                .with_pipeline_uniforms(desc.pipeline_uniforms.clone())
                .with_bindings(shared_bindings)
                .with_bindings(static_bindings)
                .with_object_uniforms(static_uniforms.clone())
                .with_debug_name(format!("{} Update", debug_name));
            entities.create(id, update_desc);
            self.update_entity = Some(id);
        }

        if has_sort {
            let id = entities.next_entity_id();
            let sort_desc = EntityDesc::default()
                .with_blend_mode(BlendMode::ComputePost)
                .with_layers(scene_layers)
                .with_primitive_type(PrimitiveType::TriangleList)
                .with_cull_mode(CullMode::None)
                .with_graphs(desc.sort_graphs.iter().copied())
                .with_object_uniforms(object_uniforms.clone())
                .with_object_uniforms(desc.object_uniforms.clone())
                .with_pipeline_uniforms(shared_uniforms.clone())
                .with_pipeline_uniforms(desc.pipeline_uniforms.clone())
                .with_bindings(shared_bindings)
                .with_bindings(static_bindings)
                .with_object_uniforms(static_uniforms.clone())
                .with_debug_name(format!("{} Sort", debug_name));
            entities.create(id, sort_desc);
            self.sort_entity = Some(id);
        }

        self.render_entities.reserve(desc.render_passes.len());
        for (pass_index, pass) in desc.render_passes.iter().enumerate() {
            let id = entities.next_entity_id();
            let mesh = pass
                .mesh
                .or(desc.default_mesh)
                .unwrap_or(*fallback_mesh);
            let flip_tangent = if pass.cull_mode == CullMode::Cw {
                -1.0
            } else {
                1.0
            };
            let render_desc = EntityDesc::default()
                .with_blend_mode(pass.blend_mode.unwrap_or(BlendMode::AlphaBlend))
                .with_cull_mode(pass.cull_mode)
                .with_layers(scene_layers)
                .with_primitive_type(PrimitiveType::TriangleList)
                .with_graphs(pass.graphs.iter().copied())
                .with_object_uniforms(object_uniforms.clone())
                .with_object_uniforms(desc.object_uniforms.clone())
                .with_pipeline_uniforms(shared_uniforms.clone())
                .with_pipeline_uniforms(desc.pipeline_uniforms.clone())
                .with_bindings(shared_bindings)
                .with_bindings(static_bindings)
                .with_object_uniforms(static_uniforms.clone())
                .with_object_uniforms(
                    Uniforms::new()
                        .with(UniformKey::FlipTangent, UniformValue::Float(flip_tangent))
                        .with(UniformKey::PassId, UniformValue::Uint(pass_index as u32)),
                )
                .with_mesh(mesh)
                .with_debug_name(debug_name.clone());
            entities.create(id, render_desc);
            self.render_entities.push(id);
        }

        true
    }

    /// Tear everything down in reverse order. Returns true when render
    /// entities existed (the caller must return its culling reference).
    pub(crate) fn destroy_draw_calls(&mut self, entities: &dyn EntitySystem) -> bool {
        if self.render_entities.is_empty() {
            return false;
        }

        if let Some(id) = self.sort_entity.take() {
            entities.destroy(id);
        }
        if let Some(id) = self.update_entity.take() {
            entities.destroy(id);
        }
        for id in self.render_entities.drain(..) {
            entities.destroy(id);
        }
        true
    }

    fn move_entity(&self, ctx: &MoveContext, id: EntityId, instance_count: u32, aabb: Aabb) {
        let mut uniforms = Uniforms::new()
            .with(UniformKey::WorldTransform, matrix_uniform(&self.transform))
            .with(
                UniformKey::EmitterSlot,
                UniformValue::Uint(self.emitter_slot as u32),
            );
        for (hash, value) in &self.dynamic_parameters {
            uniforms.add(UniformKey::Dynamic(*hash), *value);
        }
        ctx.entities
            .move_entity(id, aabb, true, uniforms, instance_count);
    }

    /// Reserve GPU buffer slots for this frame and push fresh uniforms to
    /// every live entity. Returns whether the emitter has particles this
    /// frame.
    pub(crate) fn move_entities(&mut self, ctx: &MoveContext) -> bool {
        let mut has_particles = true;
        if self.emitter_time < 0.0 {
            has_particles = false;
        }
        if !self.transient.contains(TransientFlags::STATELESS) && self.allocation.is_none() {
            has_particles = false;
        }
        if !self.transient.contains(TransientFlags::ALIVE) {
            has_particles = false;
        }

        debug_assert_eq!(self.emitter_slot, EMITTER_COUNT);
        if has_particles {
            self.emitter_slot = ctx.emitter_offset.fetch_add(1, Ordering::AcqRel);
            if self.emitter_slot >= EMITTER_COUNT {
                self.emitter_slot = EMITTER_COUNT;
                has_particles = false;
            }
        }

        debug_assert_eq!(self.bone_slot, BONE_BUFFER_COUNT);
        if !self.bone_positions.is_empty() && has_particles {
            let count = self.bone_positions.len();
            let mut pos = ctx.bone_offset.load(Ordering::Acquire);
            loop {
                if pos + count > BONE_BUFFER_COUNT {
                    has_particles = false;
                    break;
                }
                match ctx.bone_offset.compare_exchange(
                    pos,
                    pos + count,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        self.bone_slot = pos;
                        break;
                    }
                    Err(current) => pos = current,
                }
            }
        }

        let full_count = if has_particles { self.particle_count } else { 0 };
        if !self.transient.contains(TransientFlags::STATELESS) {
            if let Some(id) = self.update_entity {
                self.move_entity(ctx, id, full_count, Aabb::infinite());
            }
            if let Some(id) = self.sort_entity {
                self.move_entity(ctx, id, full_count, Aabb::infinite());
            }
        }

        let visible_count = if has_particles && self.visible_this_frame() {
            self.particle_count
        } else {
            0
        };
        let bounds = self.bounds();
        for id in &self.render_entities {
            self.move_entity(ctx, *id, visible_count, bounds);
        }

        has_particles
    }

    fn visible_this_frame(&self) -> bool {
        self.transient.contains(TransientFlags::VISIBLE)
            && !self.transient.contains(TransientFlags::WAS_CULLED)
    }

    /// Write this emitter's reserved GPU records.
    pub(crate) fn upload(&self, ctx: &UploadContext) {
        if self.emitter_slot < EMITTER_COUNT {
            let particles_start = if self.transient.contains(TransientFlags::STATELESS) {
                0
            } else {
                self.allocation
                    .map(|id| ctx.allocator.range_of(id).offset)
                    .unwrap_or(0)
            };

            let record = EmitterGpuRecord {
                scale: self.scale.into(),
                duration: self.emitter_duration,
                last_scale: self.last_scale.into(),
                dead_time: self.die_time,
                inverse_scale: self.inverse_scale.into(),
                packed_flags: pack_flags(self.flags, self.transient, ctx.dynamic_culling).bits(),
                last_inverse_scale: self.last_inverse_scale.into(),
                delta_time: self.particle_delta_time,
                rotation: self.rotation.coords.into(),
                last_rotation: self.last_rotation.coords.into(),
                translation: self.translation.into(),
                time: self.emitter_time,
                last_translation: self.last_translation.into(),
                prev_time: self.prev_emitter_time,
                culling_aggression: ctx.culling_aggression,
                bone_start: self.bone_slot as u32,
                bone_count: self.bone_positions.len() as u32,
                particles_start,
            };
            ctx.emitters.write(self.emitter_slot, record);
        }

        if self.bone_slot < BONE_BUFFER_COUNT {
            for (a, bone) in self.bone_positions.iter().enumerate() {
                let prev = self.prev_bone_positions.get(a).unwrap_or(bone);
                let record = BoneGpuRecord {
                    pos: [
                        bone.position.x,
                        bone.position.y,
                        bone.position.z,
                        bone.distance,
                    ],
                    prev_pos: [
                        prev.position.x,
                        prev.position.y,
                        prev.position.z,
                        prev.distance,
                    ],
                };
                ctx.bones.write(self.bone_slot + a, record);
            }
        }
    }

    /// Close out the frame: release reserved slots, snapshot transforms and
    /// bones for motion vectors, and drop the one-shot teleport bit.
    pub(crate) fn move_end(&mut self) {
        self.emitter_slot = EMITTER_COUNT;
        self.bone_slot = BONE_BUFFER_COUNT;

        self.last_translation = self.translation;
        self.last_rotation = self.rotation;
        self.last_scale = self.scale;
        self.last_inverse_scale = self.inverse_scale;

        self.prev_bone_positions.clear();
        self.prev_bone_positions
            .extend(self.bone_positions.iter().copied());

        self.transient &= !TransientFlags::TELEPORTED;
    }
}

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

//! The public façade and frame coordinator. All façade calls are safe from
//! any thread; the two frame entry points (`frame_move_begin`,
//! `frame_move_end`) belong to the render loop and sequence the phases:
//! free, allocate/evict, culling, tick+move, upload, finalize.

use crate::emitter::{Emitter, MoveContext, UploadContext};
use crate::gpu::{
    BoneGpuRecord, EmitterGpuRecord, ParticleGpuRecord, BONE_BUFFER_COUNT, CULLING_META_SLOT,
    CULLING_TILES_SLOT, EMITTER_BONES_SLOT, EMITTER_COUNT, EMITTER_DATA_SLOT, INSTANCE_COUNT,
    INSTANCES_PER_TILE, PARTICLE_DATA_SLOT, PARTICLE_INDEX_SLOT, THREADS_PER_TILE, TILE_COUNT,
    TILE_COUNT_X, TILE_COUNT_Y,
};
use crate::registry::{EmitterId, Registry, BUCKET_COUNT};
use crate::template::{DrawCallDesc, EmitterTemplate};
use anyhow::{ensure, Result};
use buddy::BuddyAllocator;
use device::{
    release::{self, Deferred},
    Device, UploadBuffer,
};
use entity::{
    Binding, Bindings, BlendMode, EntityDesc, EntityId, EntitySystem, RenderMesh, UniformKey,
    UniformValue, Uniforms,
};
use geometry::Aabb;
use job::{JobSystem, Priority};
use log::{debug, trace};
use nalgebra::{Matrix4, Vector3};
use parking_lot::Mutex;
use smallvec::SmallVec;
use sparse::SparseId;
use std::mem;
use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering},
    Arc,
};

/// Graphs the engine reserves for itself; registered with the shader system
/// at startup.
pub mod engine_graphs {
    use entity::GraphId;

    pub const DYNAMIC_CULLING: GraphId = GraphId(1);
}

/// Scene-facing priority: larger values are culled first, negative values
/// are never culled.
pub type CullPriorityFn<'a> = &'a dyn Fn(&Aabb) -> f32;

#[derive(Copy, Clone, Debug, Default)]
pub struct Stats {
    pub num_emitters: usize,
    pub num_visible_emitters: usize,
    pub num_allocated_emitters: usize,
    pub num_allocated_slots: usize,
    pub num_used_slots: usize,
    pub num_particles: usize,
    pub num_bones: usize,
    pub max_particles: usize,
    pub max_bones: usize,
    pub max_emitters: usize,
}

#[derive(Copy, Clone)]
struct CullingFrameState {
    aggression: f32,
    enabled: bool,
}

struct CullingEntity {
    entity: Option<EntityId>,
    has_entity: bool,
}

struct Inner {
    registry: Registry,
    allocator: parking_lot::RwLock<BuddyAllocator>,
    entities: Arc<dyn EntitySystem>,
    jobs: Arc<JobSystem>,

    // Held through deferred handles: frames in flight may still reference
    // the staging memory when the system goes away.
    emitter_buffer: Deferred<UploadBuffer<EmitterGpuRecord>>,
    bone_buffer: Deferred<UploadBuffer<BoneGpuRecord>>,
    shared_bindings: Bindings,
    shared_uniforms: Uniforms,
    quad_mesh: RenderMesh,

    uid_counter: AtomicU64,
    emitter_offset: AtomicUsize,
    bone_offset: AtomicUsize,
    job_count: AtomicUsize,
    frame_time: Mutex<f32>,

    culling_ref: AtomicU64,
    culling_entity: Mutex<CullingEntity>,
    culling_frame: Mutex<CullingFrameState>,
    dynamic_culling_enabled: AtomicBool,
    dynamic_culling_aggression: AtomicU32,
}

/// The GPU particle engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ParticleSystem {
    inner: Arc<Inner>,
}

impl ParticleSystem {
    pub fn new(
        device: &Device,
        entities: Arc<dyn EntitySystem>,
        jobs: Arc<JobSystem>,
    ) -> Result<Self> {
        ensure!(INSTANCE_COUNT > 0 && BONE_BUFFER_COUNT > 0 && EMITTER_COUNT > 0);

        let instance_buffer = device.create_buffer(
            "particle-instance-buffer",
            INSTANCE_COUNT * mem::size_of::<ParticleGpuRecord>(),
        );
        let instance_index_buffer =
            device.create_buffer("particle-instance-index-buffer", INSTANCE_COUNT * 4);
        let culling_meta = device.create_buffer("particle-culling-meta", TILE_COUNT * 16);
        let culling_tiles =
            device.create_buffer("particle-culling-tiles", TILE_COUNT * INSTANCES_PER_TILE * 4);

        let emitter_buffer = Deferred::new(
            device.create_upload_buffer::<EmitterGpuRecord>("particle-emitter-buffer", EMITTER_COUNT),
        );
        let bone_buffer = Deferred::new(
            device.create_upload_buffer::<BoneGpuRecord>("particle-bone-buffer", BONE_BUFFER_COUNT),
        );
        let emitter_buffer_id = device.create_buffer(
            "particle-emitter-buffer-device",
            EMITTER_COUNT * mem::size_of::<EmitterGpuRecord>(),
        );
        let bone_buffer_id = device.create_buffer(
            "particle-bone-buffer-device",
            BONE_BUFFER_COUNT * mem::size_of::<BoneGpuRecord>(),
        );

        // The shared unit quad used by render passes without their own mesh:
        // 4 vertices of position + half-float uv, 6 indices.
        let quad_vertex_buffer = device.create_buffer("particle-quad-vertices", 4 * 16);
        let quad_index_buffer = device.create_buffer("particle-quad-indices", 6 * 2);
        let quad_mesh = RenderMesh {
            vertex_buffer: quad_vertex_buffer,
            index_buffer: quad_index_buffer,
            vertex_count: 4,
            index_count: 6,
            base_index: 0,
        };

        let mut shared_bindings = Bindings::new();
        shared_bindings.push(Binding {
            slot: PARTICLE_DATA_SLOT,
            buffer: instance_buffer,
        });
        shared_bindings.push(Binding {
            slot: PARTICLE_INDEX_SLOT,
            buffer: instance_index_buffer,
        });
        shared_bindings.push(Binding {
            slot: EMITTER_BONES_SLOT,
            buffer: bone_buffer_id,
        });
        shared_bindings.push(Binding {
            slot: EMITTER_DATA_SLOT,
            buffer: emitter_buffer_id,
        });
        shared_bindings.push(Binding {
            slot: CULLING_META_SLOT,
            buffer: culling_meta,
        });
        shared_bindings.push(Binding {
            slot: CULLING_TILES_SLOT,
            buffer: culling_tiles,
        });

        let shared_uniforms = Uniforms::new()
            .with(
                UniformKey::CullingTilesX,
                UniformValue::Uint(TILE_COUNT_X as u32),
            )
            .with(
                UniformKey::CullingTilesY,
                UniformValue::Uint(TILE_COUNT_Y as u32),
            )
            .with(
                UniformKey::CullingTileCapacity,
                UniformValue::Uint(INSTANCES_PER_TILE as u32),
            );

        debug!(
            "particles: pool of {} slots, {} emitters, {} bones",
            INSTANCE_COUNT, EMITTER_COUNT, BONE_BUFFER_COUNT
        );

        Ok(Self {
            inner: Arc::new(Inner {
                registry: Registry::new(),
                allocator: parking_lot::RwLock::new(BuddyAllocator::new(INSTANCE_COUNT as u32)),
                entities,
                jobs,
                emitter_buffer,
                bone_buffer,
                shared_bindings,
                shared_uniforms,
                quad_mesh,
                uid_counter: AtomicU64::new(0),
                emitter_offset: AtomicUsize::new(0),
                bone_offset: AtomicUsize::new(0),
                job_count: AtomicUsize::new(0),
                frame_time: Mutex::new(0.0),
                culling_ref: AtomicU64::new(0),
                culling_entity: Mutex::new(CullingEntity {
                    entity: None,
                    has_entity: false,
                }),
                culling_frame: Mutex::new(CullingFrameState {
                    aggression: 0.0,
                    enabled: false,
                }),
                dynamic_culling_enabled: AtomicBool::new(false),
                dynamic_culling_aggression: AtomicU32::new(0f32.to_bits()),
            }),
        })
    }

    /// Mint a fresh emitter UID. Thread-safe, unique, always odd.
    pub fn create_emitter_uid(&self) -> EmitterId {
        let serial = self.inner.uid_counter.fetch_add(1, Ordering::AcqRel);
        EmitterId::from_serial(serial)
    }

    /// Instantiate `template` under `id`. If a record for `id` still exists
    /// in the registry, it is reactivated in place instead.
    pub fn create_emitter(
        &self,
        id: EmitterId,
        template: &Arc<EmitterTemplate>,
        animation_speed: f32,
        event_duration: f32,
        delay: f32,
    ) {
        let now = *self.inner.frame_time.lock();
        let mut guard = self.inner.registry.bucket_for(id).write();
        let state = &mut *guard;

        if let Some(handle) = state.resolve(id) {
            let emitter = state.emitters.get_mut(handle).expect("resolved handle");
            if !emitter.is_gc() {
                emitter.set_active(true);
                emitter.set_alive(true);
                return;
            }
        }

        trace!("particles: create emitter {}", id.as_raw());
        let handle = state.emitters.insert(Emitter::new(
            id,
            Arc::clone(template),
            animation_speed,
            event_duration,
            delay,
            now,
        ));
        state.ids.insert(id.as_raw(), handle);
    }

    /// Stop the emitter and let its particles play out; the record is
    /// physically removed by the next frame's free pass. Works on orphaned
    /// emitters too.
    pub fn destroy_emitter(&self, id: EmitterId) {
        let mut guard = self.inner.registry.bucket_for(id).write();
        if let Some(handle) = guard.resolve(id) {
            let emitter = guard.emitters.get_mut(handle).expect("resolved handle");
            emitter.set_alive(false);
        }
    }

    /// Detach the emitter from its owner: stop emitting but keep existing
    /// particles until they expire naturally.
    pub fn orphan_emitter(&self, id: EmitterId) {
        self.inner.registry.modify(id, |e| e.set_active(false));
    }

    /// Suppress motion-vector history for one frame after a discontinuous
    /// transform change.
    pub fn teleport_emitter(&self, id: EmitterId) {
        self.inner.registry.modify(id, |e| e.set_teleported(true));
    }

    pub fn set_emitter_transform(&self, id: EmitterId, transform: Matrix4<f32>) {
        self.inner.registry.modify(id, |e| e.set_transform(transform));
    }

    pub fn set_emitter_bones(&self, id: EmitterId, positions: &[Vector3<f32>]) {
        self.inner.registry.modify(id, |e| e.set_bones(positions));
    }

    pub fn set_emitter_visible(&self, id: EmitterId, visible: bool) {
        self.inner.registry.modify(id, |e| e.set_visible(visible));
    }

    pub fn set_emitter_animation_speed(&self, id: EmitterId, speed: f32) {
        self.inner
            .registry
            .modify(id, |e| e.set_animation_speed(speed));
    }

    pub fn is_emitter_alive(&self, id: EmitterId) -> bool {
        self.inner
            .registry
            .inspect(id, |e| e.is_alive())
            .unwrap_or(false)
    }

    pub fn is_emitter_active(&self, id: EmitterId) -> bool {
        self.inner
            .registry
            .inspect(id, |e| e.is_active())
            .unwrap_or(false)
    }

    /// Renderer callback: the emitter's render entity survived culling this
    /// frame. Lock-free with respect to the frame jobs (atomic store under
    /// the bucket's read lock).
    pub fn set_draw_call_visible(&self, id: EmitterId) {
        self.inner.registry.inspect(id, |e| {
            if e.is_alive() {
                e.set_culled(false);
            }
        });
    }

    /// Create the emitter's draw-call entities. A desc without a render pass
    /// is a silent no-op and takes no culling reference.
    pub fn create_draw_calls(
        &self,
        id: EmitterId,
        scene_layers: u8,
        desc: &DrawCallDesc,
        dynamic_parameters: &[(u64, UniformValue)],
        static_bindings: &Bindings,
        static_uniforms: &Uniforms,
    ) {
        let inner = &self.inner;
        inner.registry.modify(id, |e| {
            if e.create_draw_calls(
                inner.entities.as_ref(),
                scene_layers,
                desc,
                &inner.quad_mesh,
                &inner.shared_bindings,
                &inner.shared_uniforms,
                dynamic_parameters,
                static_bindings,
                static_uniforms,
            ) {
                inner.culling_ref.fetch_add(1, Ordering::AcqRel);
            }
        });
    }

    pub fn destroy_draw_calls(&self, id: EmitterId) {
        let inner = &self.inner;
        inner.registry.modify(id, |e| {
            if e.destroy_draw_calls(inner.entities.as_ref()) {
                inner.release_culling_ref();
            }
        });
    }

    /// Externally supplied dynamic-culling state; latched once per frame.
    pub fn set_dynamic_culling(&self, enabled: bool, aggression: f32) {
        self.inner
            .dynamic_culling_enabled
            .store(enabled, Ordering::Release);
        self.inner
            .dynamic_culling_aggression
            .store(aggression.to_bits(), Ordering::Release);
    }

    /// Reap every emitter that no longer has an owner driving it.
    pub fn kill_orphaned(&self) {
        for bucket in self.inner.registry.buckets() {
            let mut state = bucket.write();
            for emitter in state.emitters.values_mut() {
                emitter.kill_orphaned();
            }
        }
    }

    /// Drop every emitter and reset the slot pool. Buffers survive.
    pub fn clear(&self) {
        debug!("particles: clear");
        for bucket in self.inner.registry.buckets() {
            let mut guard = bucket.write();
            let state = &mut *guard;
            for emitter in state.emitters.values_mut() {
                if emitter.destroy_draw_calls(self.inner.entities.as_ref()) {
                    self.inner.release_culling_ref();
                }
            }
            state.emitters.clear();
            state.ids.clear();
        }

        {
            let mut allocator = self.inner.allocator.write();
            allocator.clear();
            allocator.add_block(INSTANCE_COUNT as u32, 0);
        }

        let mut culling = self.inner.culling_entity.lock();
        if culling.has_entity {
            self.inner
                .entities
                .destroy(culling.entity.expect("culling entity exists"));
            culling.has_entity = false;
        }
    }

    pub fn stats(&self) -> Stats {
        let mut stats = Stats {
            max_particles: INSTANCE_COUNT,
            max_bones: BONE_BUFFER_COUNT,
            max_emitters: EMITTER_COUNT,
            ..Default::default()
        };

        for bucket in self.inner.registry.buckets() {
            let state = bucket.read();
            let allocator = self.inner.allocator.read();
            for emitter in state.emitters.values() {
                stats.num_emitters += 1;
                if !emitter.was_culled() {
                    stats.num_visible_emitters += 1;
                }
                if let Some(allocation) = emitter.allocation {
                    stats.num_allocated_slots += allocator.range_of(allocation).size as usize;
                    stats.num_used_slots += emitter.particle_count as usize;
                    stats.num_allocated_emitters += 1;
                }
                stats.num_bones += emitter.bone_count() as usize;
                stats.num_particles += emitter.particle_count as usize;
            }
        }

        stats
    }

    /// First half of the frame: free dead emitters, rebalance the slot pool,
    /// update the culling entity, then tick and move every emitter in
    /// bucket-parallel jobs.
    pub fn frame_move_begin(&self, delta_time: f32, cull_priority: CullPriorityFn) {
        release::rotate();

        {
            let mut frame_time = self.inner.frame_time.lock();
            *frame_time += delta_time;
        }
        {
            let mut culling = self.inner.culling_frame.lock();
            culling.enabled = self.inner.dynamic_culling_enabled.load(Ordering::Acquire);
            culling.aggression =
                f32::from_bits(self.inner.dynamic_culling_aggression.load(Ordering::Acquire));
        }

        self.inner.free_emitters();
        self.inner.allocate_emitters(cull_priority);
        self.move_culling();
        self.frame_move_entities(delta_time);
        self.inner.drain();
    }

    /// Second half of the frame: map the GPU buffers, upload every emitter
    /// and bone record in bucket-parallel jobs, then finalize.
    pub fn frame_move_end(&self) {
        self.upload_gpu_buffers();
        self.frame_move_end_entities();
        self.inner.drain();
    }

    fn move_culling(&self) {
        let inner = &self.inner;
        let need = inner.dynamic_culling_enabled.load(Ordering::Acquire)
            && inner.culling_ref.load(Ordering::Acquire) > 0;
        {
            let culling = inner.culling_entity.lock();
            if !need && !culling.has_entity {
                return;
            }
        }

        inner.job_count.fetch_add(1, Ordering::AcqRel);
        let job_inner = Arc::clone(inner);
        inner.jobs.submit(Priority::High, move || {
            job_inner.move_culling_job(need);
            job_inner.job_count.fetch_sub(1, Ordering::AcqRel);
        });
    }

    fn frame_move_entities(&self, delta_time: f32) {
        let inner = &self.inner;
        inner.bone_offset.store(0, Ordering::Release);
        inner.emitter_offset.store(0, Ordering::Release);

        for index in 0..BUCKET_COUNT {
            inner.job_count.fetch_add(1, Ordering::AcqRel);
            let job_inner = Arc::clone(inner);
            inner.jobs.submit(Priority::High, move || {
                job_inner.update_bucket(index, delta_time);
                job_inner.job_count.fetch_sub(1, Ordering::AcqRel);
            });
        }
    }

    fn upload_gpu_buffers(&self) {
        let inner = &self.inner;
        let mapped_emitters = inner.emitter_buffer.lock_discard();
        let mapped_bones = inner.bone_buffer.lock_discard();
        let culling = *inner.culling_frame.lock();

        for index in 0..BUCKET_COUNT {
            inner.job_count.fetch_add(1, Ordering::AcqRel);
            let job_inner = Arc::clone(inner);
            let emitters = mapped_emitters.clone();
            let bones = mapped_bones.clone();
            inner.jobs.submit(Priority::High, move || {
                {
                    let state = job_inner.registry.bucket(index).read();
                    let allocator = job_inner.allocator.read();
                    let ctx = UploadContext {
                        emitters: &emitters,
                        bones: &bones,
                        allocator: &allocator,
                        culling_aggression: culling.aggression,
                        dynamic_culling: culling.enabled,
                    };
                    for emitter in state.emitters.values() {
                        emitter.upload(&ctx);
                    }
                }
                job_inner.job_count.fetch_sub(1, Ordering::AcqRel);
            });
        }

        inner.drain();
        drop(mapped_emitters);
        drop(mapped_bones);
        inner.emitter_buffer.unlock();
        inner.bone_buffer.unlock();
    }

    fn frame_move_end_entities(&self) {
        let inner = &self.inner;
        for index in 0..BUCKET_COUNT {
            inner.job_count.fetch_add(1, Ordering::AcqRel);
            let job_inner = Arc::clone(inner);
            inner.jobs.submit(Priority::High, move || {
                {
                    let mut state = job_inner.registry.bucket(index).write();
                    for emitter in state.emitters.values_mut() {
                        emitter.move_end();
                    }
                }
                job_inner.job_count.fetch_sub(1, Ordering::AcqRel);
            });
        }
    }
}

struct ProcessEntry {
    emitter: SparseId,
    bucket: u8,
    particle_count: u32,
    allocation: Option<SparseId>,
    visible: bool,
    active: bool,
    weight: f32,
}

impl Inner {
    fn release_culling_ref(&self) {
        let previous = self.culling_ref.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "culling reference count went negative");
    }

    // Spin on the fence, contributing to the pool instead of blocking.
    fn drain(&self) {
        while self.job_count.load(Ordering::Acquire) > 0 {
            if !self.jobs.run_once(Priority::High) {
                std::hint::spin_loop();
            }
        }
    }

    fn free_emitters(&self) {
        for bucket in self.registry.buckets() {
            let mut guard = bucket.write();
            let state = &mut *guard;
            let mut dead: SmallVec<[(u64, SparseId); 8]> = SmallVec::new();
            {
                let mut allocator = self.allocator.write();
                state.emitters.retain(|handle, emitter| {
                    if !emitter.is_gc() {
                        return true;
                    }
                    debug_assert!(!emitter.has_draw_calls());
                    if let Some(allocation) = emitter.allocation.take() {
                        allocator.deallocate(allocation);
                    }
                    dead.push((emitter.uid.as_raw(), handle));
                    false
                });
            }
            // Only prune mappings that still point at the removed record: a
            // same-frame re-create may have remapped the uid already.
            for (uid, handle) in dead {
                if state.ids.get(&uid) == Some(&handle) {
                    state.ids.remove(&uid);
                }
            }
        }
    }

    fn allocate_emitters(&self, cull_priority: CullPriorityFn) {
        let mut gathered: Vec<ProcessEntry> = Vec::new();
        let mut need_allocation = false;

        for (index, bucket) in self.registry.buckets().enumerate() {
            let state = bucket.read();
            gathered.reserve(state.emitters.len());
            for (handle, emitter) in state.emitters.iter() {
                if emitter.is_stateless() {
                    continue;
                }
                let visible = emitter.has_draw_calls() && !emitter.is_culled();
                let weight = if visible || emitter.template.ignore_bounding {
                    -1.0
                } else {
                    cull_priority(&emitter.bounds())
                };
                if visible && emitter.allocation.is_none() {
                    need_allocation = true;
                }
                gathered.push(ProcessEntry {
                    emitter: handle,
                    bucket: index as u8,
                    particle_count: emitter.particle_count,
                    allocation: emitter.allocation,
                    visible,
                    active: emitter.is_active(),
                    weight,
                });
            }
        }

        if !need_allocation {
            return;
        }

        // Visible first, then still-active, then cheapest-to-keep; the sort
        // is stable so equal keys keep bucket-major gather order. Victims
        // are taken from the back, so the highest cull weight goes first.
        gathered.sort_by(|a, b| {
            b.visible
                .cmp(&a.visible)
                .then(b.active.cmp(&a.active))
                .then(a.weight.total_cmp(&b.weight))
        });

        let mut allocated: SmallVec<[(SparseId, u8, SparseId); 32]> = SmallVec::new();
        let mut freed: SmallVec<[(SparseId, u8); 32]> = SmallVec::new();

        {
            let mut allocator = self.allocator.write();
            let mut end = gathered.len();

            for a in 0..gathered.len() {
                if a >= end || !gathered[a].visible {
                    break;
                }
                if gathered[a].allocation.is_some() {
                    continue;
                }

                loop {
                    if let Some(allocation) = allocator.allocate(gathered[a].particle_count) {
                        allocated.push((gathered[a].emitter, gathered[a].bucket, allocation));
                        break;
                    }

                    // Allocation failed: walk from the back for a victim
                    // that still holds slots.
                    loop {
                        end -= 1;
                        if a == end || gathered[end].allocation.is_some() {
                            break;
                        }
                    }

                    if a == end || (gathered[end].visible && gathered[end].active) {
                        break;
                    }

                    freed.push((gathered[end].emitter, gathered[end].bucket));
                    allocator.deallocate(gathered[end].allocation.expect("victim holds slots"));
                }
            }
        }

        if !freed.is_empty() {
            trace!("particles: evicted {} emitters", freed.len());
        }

        allocated.sort_by_key(|entry| entry.1);
        freed.sort_by_key(|entry| entry.1);

        let mut b = 0;
        let mut c = 0;
        for index in 0..BUCKET_COUNT {
            let has_allocs = b < allocated.len() && allocated[b].1 == index as u8;
            let has_frees = c < freed.len() && freed[c].1 == index as u8;
            if !has_allocs && !has_frees {
                continue;
            }

            let mut state = self.registry.bucket(index).write();
            while b < allocated.len() && allocated[b].1 == index as u8 {
                if let Some(emitter) = state.emitters.get_mut(allocated[b].0) {
                    emitter.set_new(true);
                    emitter.set_allocation(Some(allocated[b].2));
                }
                b += 1;
            }
            while c < freed.len() && freed[c].1 == index as u8 {
                if let Some(emitter) = state.emitters.get_mut(freed[c].0) {
                    emitter.set_allocation(None);
                }
                c += 1;
            }
        }
    }

    fn move_culling_job(&self, need: bool) {
        let mut culling = self.culling_entity.lock();
        if culling.entity.is_none() {
            culling.entity = Some(self.entities.next_entity_id());
        }
        let entity = culling.entity.expect("assigned above");

        if !culling.has_entity {
            let desc = EntityDesc::default()
                .with_blend_mode(BlendMode::ComputePost)
                .with_layers(1)
                .with_graph(engine_graphs::DYNAMIC_CULLING)
                .with_bindings(&self.shared_bindings)
                .with_pipeline_uniforms(self.shared_uniforms.clone())
                .with_object_uniforms(
                    Uniforms::new().with(UniformKey::EmitterSlot, UniformValue::Uint(0)),
                )
                .with_debug_name("Particle Dynamic Culling");
            self.entities.create(entity, desc);
            culling.has_entity = true;
        }

        if !need {
            self.entities.destroy(entity);
            culling.has_entity = false;
        } else {
            self.entities.move_entity(
                entity,
                Aabb::infinite(),
                true,
                Uniforms::new(),
                (TILE_COUNT * THREADS_PER_TILE) as u32,
            );
        }
    }

    fn update_bucket(&self, index: usize, delta_time: f32) {
        let mut state = self.registry.bucket(index).write();
        let ctx = MoveContext {
            entities: self.entities.as_ref(),
            emitter_offset: &self.emitter_offset,
            bone_offset: &self.bone_offset,
        };
        for emitter in state.emitters.values_mut() {
            emitter.tick(delta_time);
            if !emitter.is_alive() {
                if emitter.destroy_draw_calls(self.entities.as_ref()) {
                    self.release_culling_ref();
                }
                emitter.set_gc();
            }
            emitter.move_entities(&ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{ParticleBudget, RenderPassDesc};
    use entity::{CullMode, GraphId};
    use fxhash::FxHashMap;
    use smallvec::smallvec;

    #[derive(Default)]
    struct Recorder {
        next_id: AtomicU64,
        created: Mutex<Vec<EntityId>>,
        destroyed: Mutex<Vec<EntityId>>,
        moves: Mutex<FxHashMap<EntityId, (u32, Uniforms)>>,
    }

    impl Recorder {
        fn created_count(&self) -> usize {
            self.created.lock().len()
        }

        fn last_instance_count(&self, id: EntityId) -> Option<u32> {
            self.moves.lock().get(&id).map(|(count, _)| *count)
        }
    }

    impl EntitySystem for Recorder {
        fn next_entity_id(&self) -> EntityId {
            self.next_id.fetch_add(1, Ordering::AcqRel) + 1
        }

        fn create(&self, id: EntityId, _desc: EntityDesc) {
            self.created.lock().push(id);
        }

        fn destroy(&self, id: EntityId) {
            self.destroyed.lock().push(id);
        }

        fn move_entity(
            &self,
            id: EntityId,
            _aabb: Aabb,
            _transform_changed: bool,
            uniforms: Uniforms,
            instance_count: u32,
        ) {
            self.moves.lock().insert(id, (instance_count, uniforms));
        }
    }

    fn test_template(count: u32) -> Arc<EmitterTemplate> {
        Arc::new(EmitterTemplate {
            update_graphs: smallvec![GraphId(10)],
            render_passes: smallvec![RenderPassDesc {
                graphs: smallvec![GraphId(11)],
                blend_mode: Some(BlendMode::AlphaBlend),
                cull_mode: CullMode::None,
                mesh: None,
            }],
            budget: ParticleBudget::Count { min: count, max: count },
            emitter_duration: (0.95, 0.95),
            particle_duration: (0.45, 0.45),
            min_animation_speed: 0.0,
            ..Default::default()
        })
    }

    struct Fixture {
        system: ParticleSystem,
        recorder: Arc<Recorder>,
    }

    fn fixture() -> Fixture {
        let device = Device::new();
        let recorder = Arc::new(Recorder::default());
        let jobs = Arc::new(JobSystem::new(2));
        let system = ParticleSystem::new(
            &device,
            Arc::clone(&recorder) as Arc<dyn EntitySystem>,
            jobs,
        )
        .expect("particle system setup");
        Fixture { system, recorder }
    }

    fn run_frame(system: &ParticleSystem, dt: f32) {
        system.frame_move_begin(dt, &|_| -1.0);
        system.frame_move_end();
    }

    fn spawn(fx: &Fixture, template: &Arc<EmitterTemplate>) -> EmitterId {
        let uid = fx.system.create_emitter_uid();
        fx.system.create_emitter(uid, template, 1.0, -1.0, 0.0);
        fx.system.create_draw_calls(
            uid,
            1,
            &DrawCallDesc::from_template(template.as_ref()),
            &[],
            &Bindings::new(),
            &Uniforms::new(),
        );
        uid
    }

    fn has_allocation(system: &ParticleSystem, id: EmitterId) -> bool {
        system
            .inner
            .registry
            .inspect(id, |e| e.allocation.is_some())
            .unwrap_or(false)
    }

    #[test]
    fn lifecycle_runs_active_then_last_emit_then_death() {
        let fx = fixture();
        let template = test_template(100);
        let uid = spawn(&fx, &template);

        for _ in 0..9 {
            fx.system.set_draw_call_visible(uid);
            run_frame(&fx.system, 0.1);
            assert!(fx.system.is_emitter_alive(uid));
            assert!(fx.system.is_emitter_active(uid));
        }

        // Crossing the emitter duration stops emission but keeps it alive
        // for the particle playout window.
        run_frame(&fx.system, 0.1);
        assert!(fx.system.is_emitter_alive(uid));
        assert!(!fx.system.is_emitter_active(uid));

        for _ in 0..4 {
            run_frame(&fx.system, 0.1);
            assert!(fx.system.is_emitter_alive(uid));
        }
        run_frame(&fx.system, 0.1);
        assert!(!fx.system.is_emitter_alive(uid));

        // Death released the draw calls.
        assert_eq!(fx.recorder.destroyed.lock().len(), 2);

        // And the next frame physically removes the record.
        run_frame(&fx.system, 0.1);
        assert_eq!(fx.system.stats().num_emitters, 0);
    }

    #[test]
    fn pool_eviction_reclaims_the_unseen_emitter() {
        let fx = fixture();
        // Five emitters at 2^17 slots each more than half-fill the desktop
        // pool; a sixth cannot fit without a victim.
        let template = test_template(1 << 17);
        let first: Vec<EmitterId> = (0..5).map(|_| spawn(&fx, &template)).collect();

        for uid in &first {
            fx.system.set_draw_call_visible(*uid);
        }
        run_frame(&fx.system, 0.016);
        for uid in &first {
            assert!(has_allocation(&fx.system, *uid), "initial fill failed");
        }

        // Everyone but the victim is seen again; the newcomer needs slots.
        let newcomer = spawn(&fx, &template);
        for (n, uid) in first.iter().enumerate() {
            if n != 1 {
                fx.system.set_draw_call_visible(*uid);
            }
        }
        fx.system.set_draw_call_visible(newcomer);
        run_frame(&fx.system, 0.016);

        assert!(has_allocation(&fx.system, newcomer));
        assert!(!has_allocation(&fx.system, first[1]), "victim kept its slots");
        for (n, uid) in first.iter().enumerate() {
            if n != 1 {
                assert!(has_allocation(&fx.system, *uid));
            }
        }
    }

    #[test]
    fn teleport_bit_is_uploaded_for_exactly_one_frame() {
        let fx = fixture();
        let template = test_template(64);
        let uid = spawn(&fx, &template);

        fx.system.set_draw_call_visible(uid);
        run_frame(&fx.system, 0.1);
        let flags = fx.system.inner.emitter_buffer.snapshot()[0].packed_flags;
        assert_eq!(flags & 0x0010_0000, 0);

        fx.system.teleport_emitter(uid);
        fx.system.set_draw_call_visible(uid);
        run_frame(&fx.system, 0.1);
        let flags = fx.system.inner.emitter_buffer.snapshot()[0].packed_flags;
        assert_ne!(flags & 0x0010_0000, 0);

        fx.system.set_draw_call_visible(uid);
        run_frame(&fx.system, 0.1);
        let flags = fx.system.inner.emitter_buffer.snapshot()[0].packed_flags;
        assert_eq!(flags & 0x0010_0000, 0);
    }

    #[test]
    fn same_frame_destroy_then_create_reactivates_in_place() {
        let fx = fixture();
        let template = test_template(32);
        let uid = fx.system.create_emitter_uid();

        fx.system.create_emitter(uid, &template, 1.0, -1.0, 0.0);
        fx.system.destroy_emitter(uid);
        assert!(!fx.system.is_emitter_alive(uid));

        fx.system.create_emitter(uid, &template, 1.0, -1.0, 0.0);
        assert!(fx.system.is_emitter_alive(uid));
        assert!(fx.system.is_emitter_active(uid));
        assert_eq!(fx.system.stats().num_emitters, 1);
    }

    #[test]
    fn destroying_an_orphaned_emitter_still_kills_it() {
        let fx = fixture();
        let template = test_template(16);
        let uid = spawn(&fx, &template);

        fx.system.orphan_emitter(uid);
        assert!(fx.system.is_emitter_alive(uid));
        assert!(!fx.system.is_emitter_active(uid));

        fx.system.destroy_emitter(uid);
        assert!(!fx.system.is_emitter_alive(uid));

        // One frame to observe the death and release the draw calls, the
        // next to physically reap the record.
        run_frame(&fx.system, 0.016);
        run_frame(&fx.system, 0.016);
        assert_eq!(fx.system.stats().num_emitters, 0);
        assert_eq!(fx.recorder.destroyed.lock().len(), 2);
    }

    #[test]
    fn unknown_uid_calls_are_silent_noops() {
        let fx = fixture();
        let uid = fx.system.create_emitter_uid();
        fx.system.set_emitter_transform(uid, Matrix4::identity());
        fx.system.set_emitter_visible(uid, true);
        fx.system.teleport_emitter(uid);
        fx.system.destroy_emitter(uid);
        assert!(!fx.system.is_emitter_alive(uid));
        assert!(!fx.system.is_emitter_active(uid));
    }

    #[test]
    fn template_without_render_pass_creates_nothing() {
        let fx = fixture();
        let template = Arc::new(EmitterTemplate {
            update_graphs: smallvec![GraphId(10)],
            ..Default::default()
        });
        let uid = fx.system.create_emitter_uid();
        fx.system.create_emitter(uid, &template, 1.0, -1.0, 0.0);
        fx.system.create_draw_calls(
            uid,
            1,
            &DrawCallDesc::from_template(template.as_ref()),
            &[],
            &Bindings::new(),
            &Uniforms::new(),
        );
        assert_eq!(fx.recorder.created_count(), 0);
    }

    #[test]
    fn bones_upload_with_cumulative_distances() {
        let fx = fixture();
        let template = test_template(64);
        let uid = spawn(&fx, &template);
        fx.system.set_emitter_bones(
            uid,
            &[
                Vector3::new(0.0, 0.0, 0.0),
                Vector3::new(3.0, 0.0, 0.0),
                Vector3::new(3.0, 4.0, 0.0),
            ],
        );

        fx.system.set_draw_call_visible(uid);
        run_frame(&fx.system, 0.1);
        // Frame two has an allocation from frame one, so records land.
        fx.system.set_draw_call_visible(uid);
        run_frame(&fx.system, 0.1);

        let emitter_record = fx.system.inner.emitter_buffer.snapshot()[0];
        assert_eq!(emitter_record.bone_count, 3);
        assert_eq!(emitter_record.bone_start, 0);

        let bones = fx.system.inner.bone_buffer.snapshot();
        assert_eq!(bones[0].pos[3], 0.0);
        assert_eq!(bones[1].pos[3], 3.0);
        assert_eq!(bones[2].pos[3], 8.0);
        // Previous positions trail by one frame and stay monotonic too.
        assert_eq!(bones[2].prev_pos[3], 8.0);
    }

    #[test]
    fn update_entities_get_full_count_and_culled_renders_get_zero() {
        let fx = fixture();
        let template = test_template(64);
        let uid = spawn(&fx, &template);
        // Two entities: update first, render second.
        let created = fx.recorder.created.lock().clone();
        assert_eq!(created.len(), 2);
        let (update_entity, render_entity) = (created[0], created[1]);

        fx.system.set_draw_call_visible(uid);
        run_frame(&fx.system, 0.1);
        fx.system.set_draw_call_visible(uid);
        run_frame(&fx.system, 0.1);
        assert_eq!(
            fx.recorder.last_instance_count(update_entity),
            Some(64)
        );
        assert_eq!(
            fx.recorder.last_instance_count(render_entity),
            Some(64)
        );

        // Nobody marks it visible this frame: the renderer sees zero
        // instances but the update dispatch keeps simulating.
        run_frame(&fx.system, 0.1);
        assert_eq!(
            fx.recorder.last_instance_count(update_entity),
            Some(64)
        );
        assert_eq!(fx.recorder.last_instance_count(render_entity), Some(0));
    }

    #[test]
    fn zero_dt_frames_are_harmless() {
        let fx = fixture();
        let template = test_template(16);
        let uid = spawn(&fx, &template);
        for _ in 0..3 {
            run_frame(&fx.system, 0.0);
        }
        assert!(fx.system.is_emitter_alive(uid));
        assert!(fx.system.is_emitter_active(uid));
    }

    #[test]
    fn clear_drops_emitters_and_restores_the_pool() {
        let fx = fixture();
        let template = test_template(1 << 17);
        let uids: Vec<EmitterId> = (0..3).map(|_| spawn(&fx, &template)).collect();
        for uid in &uids {
            fx.system.set_draw_call_visible(*uid);
        }
        run_frame(&fx.system, 0.016);
        assert_eq!(fx.system.stats().num_emitters, 3);

        fx.system.clear();
        let stats = fx.system.stats();
        assert_eq!(stats.num_emitters, 0);
        assert_eq!(stats.num_allocated_slots, 0);
        // All six entities went away with their emitters.
        assert_eq!(fx.recorder.destroyed.lock().len(), 6);

        // The whole pool is usable again.
        let uid = spawn(&fx, &template);
        fx.system.set_draw_call_visible(uid);
        run_frame(&fx.system, 0.016);
        assert!(has_allocation(&fx.system, uid));
    }

    #[test]
    fn kill_orphaned_reaps_only_detached_emitters() {
        let fx = fixture();
        let template = test_template(16);
        let kept = spawn(&fx, &template);
        let orphaned = spawn(&fx, &template);
        fx.system.orphan_emitter(orphaned);

        fx.system.kill_orphaned();
        assert!(fx.system.is_emitter_alive(kept));
        assert!(!fx.system.is_emitter_alive(orphaned));
    }

    #[test]
    fn dynamic_culling_entity_tracks_need() {
        let fx = fixture();
        fx.system.set_dynamic_culling(true, 0.5);
        let template = test_template(16);
        let uid = spawn(&fx, &template);
        let before = fx.recorder.created_count();
        assert_eq!(before, 2);

        run_frame(&fx.system, 0.016);
        // A render entity exists and culling is enabled, so the shared
        // culling entity appears.
        assert_eq!(fx.recorder.created_count(), 3);

        // Once the last render entity dies, the culling entity follows.
        fx.system.destroy_draw_calls(uid);
        run_frame(&fx.system, 0.016);
        let destroyed = fx.recorder.destroyed.lock().clone();
        assert_eq!(destroyed.len(), 3);
    }

    #[test]
    fn stats_report_population_and_budgets() {
        let fx = fixture();
        let template = test_template(64);
        let a = spawn(&fx, &template);
        let _b = spawn(&fx, &template);
        fx.system
            .set_emitter_bones(a, &[Vector3::zeros(), Vector3::new(1.0, 0.0, 0.0)]);

        fx.system.set_draw_call_visible(a);
        run_frame(&fx.system, 0.016);

        let stats = fx.system.stats();
        assert_eq!(stats.num_emitters, 2);
        assert_eq!(stats.num_bones, 2);
        assert_eq!(stats.num_allocated_emitters, 1);
        assert!(stats.num_allocated_slots >= 64);
        assert_eq!(stats.num_used_slots, 64);
        assert_eq!(stats.max_particles, INSTANCE_COUNT);
    }
}

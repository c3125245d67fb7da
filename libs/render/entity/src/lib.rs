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

//! The draw-call entity contract. Systems that emit geometry describe each
//! draw or dispatch with an [`EntityDesc`] and hand it to the renderer's
//! [`EntitySystem`]; afterwards they only talk about the entity through its
//! opaque id. Ownership is strictly one-way: the emitting system decides
//! when an entity dies, the entity system holds no back-references.

mod uniforms;

pub use uniforms::{UniformKey, UniformValue, Uniforms};

use device::BufferId;
use geometry::Aabb;
use smallvec::SmallVec;

pub type EntityId = u64;

/// Opaque identifier of an effect graph; resolved by the shader system.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct GraphId(pub u64);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BlendMode {
    Opaque,
    AlphaBlend,
    Additive,
    /// Compute dispatch that runs before rasterization.
    Compute,
    /// Compute dispatch that runs after the main compute wave.
    ComputePost,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum CullMode {
    #[default]
    None,
    Cw,
    Ccw,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PrimitiveType {
    TriangleList,
}

/// Geometry for a render entity. Buffers are device-owned; the counts are
/// all the entity system needs to issue the draw.
#[derive(Copy, Clone, Debug)]
pub struct RenderMesh {
    pub vertex_buffer: BufferId,
    pub index_buffer: BufferId,
    pub vertex_count: u32,
    pub index_count: u32,
    pub base_index: u32,
}

/// One buffer bound to a numbered shader slot.
#[derive(Copy, Clone, Debug)]
pub struct Binding {
    pub slot: u32,
    pub buffer: BufferId,
}

pub type Bindings = SmallVec<[Binding; 6]>;

/// Everything needed to create a draw-call entity, builder style.
#[derive(Clone, Debug)]
pub struct EntityDesc {
    pub blend_mode: BlendMode,
    pub cull_mode: CullMode,
    pub primitive_type: PrimitiveType,
    pub layers: u8,
    pub graphs: SmallVec<[GraphId; 4]>,
    pub object_uniforms: Uniforms,
    pub pipeline_uniforms: Uniforms,
    pub bindings: Bindings,
    pub mesh: Option<RenderMesh>,
    pub debug_name: Option<String>,
}

impl Default for EntityDesc {
    fn default() -> Self {
        Self {
            blend_mode: BlendMode::Opaque,
            cull_mode: CullMode::None,
            primitive_type: PrimitiveType::TriangleList,
            layers: 1,
            graphs: SmallVec::new(),
            object_uniforms: Uniforms::default(),
            pipeline_uniforms: Uniforms::default(),
            bindings: SmallVec::new(),
            mesh: None,
            debug_name: None,
        }
    }
}

impl EntityDesc {
    pub fn with_blend_mode(mut self, blend_mode: BlendMode) -> Self {
        self.blend_mode = blend_mode;
        self
    }

    pub fn with_cull_mode(mut self, cull_mode: CullMode) -> Self {
        self.cull_mode = cull_mode;
        self
    }

    pub fn with_primitive_type(mut self, primitive_type: PrimitiveType) -> Self {
        self.primitive_type = primitive_type;
        self
    }

    pub fn with_layers(mut self, layers: u8) -> Self {
        self.layers = layers;
        self
    }

    pub fn with_graph(mut self, graph: GraphId) -> Self {
        self.graphs.push(graph);
        self
    }

    pub fn with_graphs(mut self, graphs: impl IntoIterator<Item = GraphId>) -> Self {
        self.graphs.extend(graphs);
        self
    }

    pub fn with_object_uniforms(mut self, uniforms: Uniforms) -> Self {
        self.object_uniforms.merge(uniforms);
        self
    }

    pub fn with_pipeline_uniforms(mut self, uniforms: Uniforms) -> Self {
        self.pipeline_uniforms.merge(uniforms);
        self
    }

    pub fn with_binding(mut self, slot: u32, buffer: BufferId) -> Self {
        self.bindings.push(Binding { slot, buffer });
        self
    }

    pub fn with_bindings(mut self, bindings: &Bindings) -> Self {
        self.bindings.extend(bindings.iter().copied());
        self
    }

    pub fn with_mesh(mut self, mesh: RenderMesh) -> Self {
        self.mesh = Some(mesh);
        self
    }

    pub fn with_debug_name(mut self, name: impl Into<String>) -> Self {
        self.debug_name = Some(name.into());
        self
    }
}

/// The renderer-owned entity store. Implementations must be callable from
/// worker threads; every method is logically independent.
pub trait EntitySystem: Send + Sync {
    fn next_entity_id(&self) -> EntityId;

    fn create(&self, id: EntityId, desc: EntityDesc);

    fn destroy(&self, id: EntityId);

    /// Update the renderer's view of an entity: spatial bounds, per-frame
    /// uniforms, and the instance count for its draw or dispatch. An
    /// `instance_count` of zero keeps the entity alive but skips it.
    fn move_entity(
        &self,
        id: EntityId,
        aabb: Aabb,
        transform_changed: bool,
        uniforms: Uniforms,
        instance_count: u32,
    );
}

/// An entity sink with no renderer behind it; counts entities and otherwise
/// discards everything. Useful for headless runs and benchmarks.
#[derive(Default)]
pub struct HeadlessEntities {
    next_id: std::sync::atomic::AtomicU64,
    created: std::sync::atomic::AtomicU64,
    destroyed: std::sync::atomic::AtomicU64,
    moved: std::sync::atomic::AtomicU64,
}

impl HeadlessEntities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live(&self) -> u64 {
        use std::sync::atomic::Ordering;
        self.created.load(Ordering::Acquire) - self.destroyed.load(Ordering::Acquire)
    }

    pub fn moves(&self) -> u64 {
        self.moved.load(std::sync::atomic::Ordering::Acquire)
    }
}

impl EntitySystem for HeadlessEntities {
    fn next_entity_id(&self) -> EntityId {
        use std::sync::atomic::Ordering;
        self.next_id.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn create(&self, _id: EntityId, _desc: EntityDesc) {
        self.created
            .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
    }

    fn destroy(&self, _id: EntityId) {
        self.destroyed
            .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
    }

    fn move_entity(
        &self,
        _id: EntityId,
        _aabb: Aabb,
        _transform_changed: bool,
        _uniforms: Uniforms,
        _instance_count: u32,
    ) {
        self.moved.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
    }
}

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
use smallvec::SmallVec;

/// Names for the uniform slots the engine's shaders agree on. Effect-graph
/// parameters resolved at load time come through `Dynamic` with their hashed
/// id.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum UniformKey {
    WorldTransform,
    /// Index of the emitter's record in the per-emitter GPU buffer.
    EmitterSlot,
    EmitterUid,
    Seed,
    StartTime,
    PassCount,
    PassId,
    MaxParticles,
    FlipTangent,
    CullingTilesX,
    CullingTilesY,
    CullingTileCapacity,
    Dynamic(u64),
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum UniformValue {
    Float(f32),
    Uint(u32),
    Vector3([f32; 3]),
    Vector4([f32; 4]),
    Matrix([f32; 16]),
}

/// An ordered key/value set of shader uniforms. Later inserts of the same
/// key override earlier ones, which is what lets per-frame object uniforms
/// shadow the static set.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Uniforms {
    values: SmallVec<[(UniformKey, UniformValue); 8]>,
}

impl Uniforms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: UniformKey, value: UniformValue) -> Self {
        self.add(key, value);
        self
    }

    pub fn add(&mut self, key: UniformKey, value: UniformValue) {
        if let Some(existing) = self.values.iter_mut().find(|(k, _)| *k == key) {
            existing.1 = value;
            return;
        }
        self.values.push((key, value));
    }

    pub fn merge(&mut self, other: Uniforms) {
        for (key, value) in other.values {
            self.add(key, value);
        }
    }

    pub fn get(&self, key: UniformKey) -> Option<&UniformValue> {
        self.values
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(UniformKey, UniformValue)> {
        self.values.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_add_overrides() {
        let mut uniforms = Uniforms::new().with(UniformKey::Seed, UniformValue::Float(1.0));
        uniforms.add(UniformKey::Seed, UniformValue::Float(2.0));
        assert_eq!(uniforms.len(), 1);
        assert_eq!(
            uniforms.get(UniformKey::Seed),
            Some(&UniformValue::Float(2.0))
        );
    }

    #[test]
    fn merge_prefers_incoming() {
        let mut base = Uniforms::new()
            .with(UniformKey::PassId, UniformValue::Uint(0))
            .with(UniformKey::Seed, UniformValue::Float(0.5));
        base.merge(Uniforms::new().with(UniformKey::PassId, UniformValue::Uint(3)));
        assert_eq!(base.get(UniformKey::PassId), Some(&UniformValue::Uint(3)));
        assert_eq!(base.get(UniformKey::Seed), Some(&UniformValue::Float(0.5)));
    }

    #[test]
    fn dynamic_keys_are_distinct() {
        let uniforms = Uniforms::new()
            .with(UniformKey::Dynamic(1), UniformValue::Float(1.0))
            .with(UniformKey::Dynamic(2), UniformValue::Float(2.0));
        assert_eq!(uniforms.len(), 2);
    }
}

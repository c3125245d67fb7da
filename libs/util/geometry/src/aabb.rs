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
use nalgebra::Vector3;

/// Axis-aligned bounding box in center/extents form.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Aabb {
    pub center: Vector3<f32>,
    pub extents: Vector3<f32>,
}

impl Aabb {
    /// A box that contains everything; used for non-spatial entities that
    /// must never be culled.
    pub fn infinite() -> Self {
        Self {
            center: Vector3::zeros(),
            extents: Vector3::repeat(f32::MAX),
        }
    }

    pub fn from_min_max(min: Vector3<f32>, max: Vector3<f32>) -> Self {
        let center = (max + min) * 0.5;
        Self {
            center,
            extents: max - center,
        }
    }

    pub fn min(&self) -> Vector3<f32> {
        self.center - self.extents
    }

    pub fn max(&self) -> Vector3<f32> {
        self.center + self.extents
    }

    /// Grow symmetrically by `amount` on every axis.
    pub fn inflate(&self, amount: f32) -> Self {
        Self {
            center: self.center,
            extents: self.extents + Vector3::repeat(amount),
        }
    }

    pub fn is_infinite(&self) -> bool {
        self.extents.x >= f32::MAX
    }
}

impl Default for Aabb {
    fn default() -> Self {
        Self {
            center: Vector3::zeros(),
            extents: Vector3::zeros(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_max_round_trip() {
        let aabb = Aabb::from_min_max(Vector3::new(-1.0, -2.0, -3.0), Vector3::new(5.0, 4.0, 3.0));
        assert_eq!(aabb.min(), Vector3::new(-1.0, -2.0, -3.0));
        assert_eq!(aabb.max(), Vector3::new(5.0, 4.0, 3.0));
        assert_eq!(aabb.center, Vector3::new(2.0, 1.0, 0.0));
    }

    #[test]
    fn inflate_grows_every_axis() {
        let aabb = Aabb::from_min_max(Vector3::zeros(), Vector3::new(2.0, 2.0, 2.0)).inflate(3.0);
        assert_eq!(aabb.min(), Vector3::new(-3.0, -3.0, -3.0));
        assert_eq!(aabb.max(), Vector3::new(5.0, 5.0, 5.0));
    }

    #[test]
    fn infinite_is_detectable() {
        assert!(Aabb::infinite().is_infinite());
        assert!(!Aabb::default().is_infinite());
    }
}

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
use nalgebra::{Matrix3, Matrix4, Rotation3, UnitQuaternion, Vector3};

/// An affine transform split into translation, rotation, and per-axis scale.
/// Mirrored transforms are normalized to a proper rotation plus a negative
/// `scale.x`.
#[derive(Copy, Clone, Debug)]
pub struct Decomposed {
    pub translation: Vector3<f32>,
    pub rotation: UnitQuaternion<f32>,
    pub scale: Vector3<f32>,
}

impl Decomposed {
    pub fn identity() -> Self {
        Self {
            translation: Vector3::zeros(),
            rotation: UnitQuaternion::identity(),
            scale: Vector3::repeat(1.0),
        }
    }

    pub fn inverse_scale(&self) -> Vector3<f32> {
        Vector3::new(1.0 / self.scale.x, 1.0 / self.scale.y, 1.0 / self.scale.z)
    }
}

/// Split `transform` into translation, rotation, and scale. A non-positive
/// determinant is resolved by mirroring the local X axis, so the returned
/// rotation is always proper and the mirror is carried in `scale.x`.
pub fn decompose_transform(transform: &Matrix4<f32>) -> Decomposed {
    let det = transform.fixed_slice::<3, 3>(0, 0).determinant();
    let mirrored = det <= 0.0;

    let m = if mirrored {
        let mut flip = Matrix4::identity();
        flip[(0, 0)] = -1.0;
        transform * flip
    } else {
        *transform
    };

    let translation = Vector3::new(m[(0, 3)], m[(1, 3)], m[(2, 3)]);
    let basis: Matrix3<f32> = m.fixed_slice::<3, 3>(0, 0).into_owned();

    let mut scale = Vector3::new(
        basis.column(0).norm(),
        basis.column(1).norm(),
        basis.column(2).norm(),
    );

    let mut axes = basis;
    for a in 0..3 {
        if scale[a] != 0.0 {
            let inv = 1.0 / scale[a];
            axes.column_mut(a).scale_mut(inv);
        }
    }

    let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(axes));
    if mirrored {
        scale.x = -scale.x;
    }

    Decomposed {
        translation,
        rotation,
        scale,
    }
}

pub fn compose_transform(decomposed: &Decomposed) -> Matrix4<f32> {
    Matrix4::new_translation(&decomposed.translation)
        * decomposed.rotation.to_homogeneous()
        * Matrix4::new_nonuniform_scaling(&decomposed.scale)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f32::consts::FRAC_PI_3;

    fn trs(translation: [f32; 3], axis_angle: [f32; 3], scale: [f32; 3]) -> Matrix4<f32> {
        compose_transform(&Decomposed {
            translation: Vector3::from(translation),
            rotation: UnitQuaternion::from_scaled_axis(Vector3::from(axis_angle)),
            scale: Vector3::from(scale),
        })
    }

    #[test]
    fn round_trip_proper_transform() {
        let m = trs([10.0, -4.0, 2.5], [0.3, FRAC_PI_3, -1.1], [2.0, 0.5, 3.0]);
        let d = decompose_transform(&m);
        assert_relative_eq!(compose_transform(&d), m, epsilon = 1e-4);
        assert!(d.scale.x > 0.0);
    }

    #[test]
    fn mirrored_transform_lands_in_negative_scale_x() {
        let m = trs([1.0, 2.0, 3.0], [0.0, 0.7, 0.2], [-2.0, 1.0, 1.0]);
        let d = decompose_transform(&m);
        assert!(d.scale.x < 0.0);
        // The rotation must stay proper even though the input was mirrored.
        assert_relative_eq!(d.rotation.to_rotation_matrix().matrix().determinant(), 1.0, epsilon = 1e-5);
        assert_relative_eq!(compose_transform(&d), m, epsilon = 1e-4);
    }

    #[test]
    fn translation_survives_the_mirror_path() {
        let m = trs([5.0, 6.0, 7.0], [0.0, 0.0, 0.0], [-1.0, 1.0, 1.0]);
        let d = decompose_transform(&m);
        assert_relative_eq!(d.translation, Vector3::new(5.0, 6.0, 7.0), epsilon = 1e-6);
    }

    #[test]
    fn degenerate_transform_does_not_panic() {
        let mut m = Matrix4::identity();
        m[(1, 1)] = 0.0;
        let d = decompose_transform(&m);
        // Zero determinant takes the mirror path.
        assert!(d.scale.x <= 0.0);
    }

    #[test]
    fn inverse_scale_is_componentwise() {
        let d = Decomposed {
            scale: Vector3::new(2.0, 4.0, 0.5),
            ..Decomposed::identity()
        };
        assert_eq!(d.inverse_scale(), Vector3::new(0.5, 0.25, 2.0));
    }
}

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

//! Immutable emitter descriptions. Templates arrive fully parsed from the
//! asset pipeline; at runtime the engine only reads them.

use bitflags::bitflags;
use entity::{BlendMode, CullMode, GraphId, RenderMesh, Uniforms};
use smallvec::SmallVec;

/// How particles orient themselves relative to the camera or their motion.
/// Consumed by the update graph on the GPU; carried here untouched.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum FaceLock {
    #[default]
    None,
    Camera,
    CameraZ,
    CameraFixed,
    CameraVelocity,
    Velocity,
    VelocityCamera,
    XY,
    XZ,
    YZ,
    XYZ,
}

/// Whether a channel is locked to the emitter for a particle's whole life,
/// only at the moment it is emitted, or not at all.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum LockMode {
    #[default]
    Disabled,
    EmitOnly,
    Enabled,
}

/// Coarse importance class used when the scene decides what to cull first.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum CullPriority {
    Gameplay,
    Important,
    #[default]
    Cosmetic,
}

/// Interval scheduling ranges, all in seconds. A `max_*` of zero disables
/// that phase.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct EmitterInterval {
    pub min_start: f32,
    pub max_start: f32,
    pub min_active: f32,
    pub max_active: f32,
    pub min_pause: f32,
    pub max_pause: f32,
}

impl EmitterInterval {
    pub fn with_start(mut self, min: f32, max: f32) -> Self {
        self.min_start = min;
        self.max_start = max;
        self
    }

    pub fn with_active(mut self, min: f32, max: f32) -> Self {
        self.min_active = min;
        self.max_active = max;
        self
    }

    pub fn with_pause(mut self, min: f32, max: f32) -> Self {
        self.min_pause = min;
        self.max_pause = max;
        self
    }
}

/// A keyframed emission-rate track with a seed-driven variance band. The GPU
/// evaluates the full curve; the CPU only ever needs its upper bound to size
/// ring buffers.
#[derive(Clone, Debug, PartialEq)]
pub struct RateCurve {
    pub keys: SmallVec<[f32; 7]>,
    pub variance: f32,
}

impl RateCurve {
    pub fn from_constant(value: f32) -> Self {
        let mut keys = SmallVec::new();
        keys.push(value);
        Self {
            keys,
            variance: 0.0,
        }
    }

    /// Upper bound of the emission rate for a given seed in `[0, 1]`.
    pub fn max_with_variance(&self, seed: f32) -> f32 {
        let max_key = self.keys.iter().copied().fold(0.0f32, f32::max);
        max_key + self.variance * seed.clamp(0.0, 1.0)
    }
}

/// The particle budget formula: either an explicit count range (lerped by
/// seed) or a particles-per-second curve integrated over the ring-buffer
/// window.
#[derive(Clone, Debug, PartialEq)]
pub enum ParticleBudget {
    Count { min: u32, max: u32 },
    PerSecond(RateCurve),
}

impl Default for ParticleBudget {
    fn default() -> Self {
        Self::Count { min: 100, max: 100 }
    }
}

/// One render pass of an emitter: its graphs, raster state, and optional
/// dedicated geometry.
#[derive(Clone, Debug, Default)]
pub struct RenderPassDesc {
    pub graphs: SmallVec<[GraphId; 2]>,
    pub blend_mode: Option<BlendMode>,
    pub cull_mode: CullMode,
    pub mesh: Option<RenderMesh>,
}

bitflags! {
    /// Template-derived behavior bits. Stable for the emitter's lifetime,
    /// except `ANIM_EVENT` and `CUSTOM_SEED` which are fixed at creation.
    pub struct TemplateFlags: u32 {
        const CONTINUOUS                = 1 << 0;
        const ANIM_SPEED_EMITTER        = 1 << 1;
        const ANIM_SPEED_PARTICLE       = 1 << 2;
        const LOCK_TRANSLATION          = 1 << 3;
        const LOCK_ROTATION             = 1 << 4;
        const LOCK_ROTATION_EMIT        = 1 << 5;
        const LOCK_SCALE_X              = 1 << 6;
        const LOCK_SCALE_X_EMIT         = 1 << 7;
        const LOCK_SCALE_Y              = 1 << 8;
        const LOCK_SCALE_Y_EMIT         = 1 << 9;
        const LOCK_SCALE_Z              = 1 << 10;
        const LOCK_SCALE_Z_EMIT         = 1 << 11;
        const LOCK_SCALE_X_BONE         = 1 << 12;
        const LOCK_SCALE_X_BONE_EMIT    = 1 << 13;
        const LOCK_SCALE_Y_BONE         = 1 << 14;
        const LOCK_SCALE_Y_BONE_EMIT    = 1 << 15;
        const LOCK_SCALE_Z_BONE         = 1 << 16;
        const LOCK_SCALE_Z_BONE_EMIT    = 1 << 17;
        const LOCK_MOVEMENT             = 1 << 18;
        const LOCK_MOVEMENT_BONE        = 1 << 19;
        const LOCK_TRANSLATION_BONE     = 1 << 20;
        const LOCK_ROTATION_BONE        = 1 << 21;
        const LOCK_ROTATION_BONE_EMIT   = 1 << 22;
        const REVERSE_BONES             = 1 << 23;
        const IGNORE_BOUNDING           = 1 << 24;
        const ANIM_EVENT                = 1 << 25;
        const CUSTOM_SEED               = 1 << 26;
    }
}

fn lock_bits(mode: LockMode, base: TemplateFlags, emit: TemplateFlags) -> TemplateFlags {
    match mode {
        LockMode::Disabled => TemplateFlags::empty(),
        LockMode::EmitOnly => emit,
        LockMode::Enabled => base | emit,
    }
}

/// The draw-call-time view of a template: which graphs to bind to each
/// stage plus any uniforms the material system resolved. Usually derived
/// straight from the template with [`DrawCallDesc::from_template`].
#[derive(Clone, Debug, Default)]
pub struct DrawCallDesc {
    pub update_graphs: SmallVec<[GraphId; 1]>,
    pub sort_graphs: SmallVec<[GraphId; 1]>,
    pub render_passes: SmallVec<[RenderPassDesc; 1]>,
    pub default_mesh: Option<RenderMesh>,
    pub object_uniforms: Uniforms,
    pub pipeline_uniforms: Uniforms,
    pub debug_name: Option<String>,
}

impl DrawCallDesc {
    pub fn from_template(template: &EmitterTemplate) -> Self {
        Self {
            update_graphs: template.update_graphs.clone(),
            sort_graphs: template.sort_graphs.clone(),
            render_passes: template.render_passes.clone(),
            default_mesh: template.default_mesh,
            object_uniforms: Uniforms::default(),
            pipeline_uniforms: template.pipeline_uniforms.clone(),
            debug_name: None,
        }
    }
}

/// The immutable description an emitter instantiates.
#[derive(Clone, Debug)]
pub struct EmitterTemplate {
    pub update_graphs: SmallVec<[GraphId; 1]>,
    pub sort_graphs: SmallVec<[GraphId; 1]>,
    pub render_passes: SmallVec<[RenderPassDesc; 1]>,
    pub default_mesh: Option<RenderMesh>,
    pub pipeline_uniforms: Uniforms,

    pub face_lock: FaceLock,
    pub budget: ParticleBudget,
    /// Particles are dispatched in groups of `1 << group_size_shift`.
    pub group_size_shift: u32,
    pub emitter_duration: (f32, f32),
    pub particle_duration: (f32, f32),
    pub min_animation_speed: f32,
    /// In centimeters, matched against the transformed bone hull.
    pub bounding_size: f32,
    pub emit_burst: f32,
    pub emit_chance: f32,
    pub custom_seed: Option<f32>,
    pub interval: EmitterInterval,
    pub culling_priority: CullPriority,

    pub lock_rotation: LockMode,
    pub lock_rotation_to_bone: LockMode,
    pub lock_scale_x: LockMode,
    pub lock_scale_y: LockMode,
    pub lock_scale_z: LockMode,
    pub lock_scale_x_to_bone: LockMode,
    pub lock_scale_y_to_bone: LockMode,
    pub lock_scale_z_to_bone: LockMode,
    pub lock_translation: bool,
    pub lock_translation_to_bone: bool,
    pub lock_movement: bool,
    pub lock_movement_to_bone: bool,
    pub lock_to_screen: bool,

    pub continuous: bool,
    pub ignore_bounding: bool,
    pub reverse_bones: bool,
    pub stateless: bool,
    pub scale_emitter_duration: bool,
    pub scale_particle_duration: bool,
    pub anim_speed_emitter: bool,
    pub anim_speed_particle: bool,
}

impl Default for EmitterTemplate {
    fn default() -> Self {
        Self {
            update_graphs: SmallVec::new(),
            sort_graphs: SmallVec::new(),
            render_passes: SmallVec::new(),
            default_mesh: None,
            pipeline_uniforms: Uniforms::default(),
            face_lock: FaceLock::None,
            budget: ParticleBudget::default(),
            group_size_shift: 0,
            emitter_duration: (10.0, 10.0),
            particle_duration: (0.5, 0.5),
            min_animation_speed: 0.2,
            bounding_size: 500.0,
            emit_burst: 0.0,
            emit_chance: 1.0,
            custom_seed: None,
            interval: EmitterInterval::default(),
            culling_priority: CullPriority::Cosmetic,
            lock_rotation: LockMode::Disabled,
            lock_rotation_to_bone: LockMode::Disabled,
            lock_scale_x: LockMode::Disabled,
            lock_scale_y: LockMode::Disabled,
            lock_scale_z: LockMode::Disabled,
            lock_scale_x_to_bone: LockMode::Disabled,
            lock_scale_y_to_bone: LockMode::Disabled,
            lock_scale_z_to_bone: LockMode::Disabled,
            lock_translation: false,
            lock_translation_to_bone: false,
            lock_movement: false,
            lock_movement_to_bone: false,
            lock_to_screen: false,
            continuous: false,
            ignore_bounding: false,
            reverse_bones: false,
            stateless: false,
            scale_emitter_duration: false,
            scale_particle_duration: false,
            anim_speed_emitter: false,
            anim_speed_particle: false,
        }
    }
}

impl EmitterTemplate {
    pub fn template_flags(&self) -> TemplateFlags {
        let mut flags = TemplateFlags::empty();
        if self.continuous {
            flags |= TemplateFlags::CONTINUOUS;
        }
        if self.anim_speed_emitter {
            flags |= TemplateFlags::ANIM_SPEED_EMITTER;
        }
        if self.anim_speed_particle {
            flags |= TemplateFlags::ANIM_SPEED_PARTICLE;
        }
        if self.lock_translation {
            flags |= TemplateFlags::LOCK_TRANSLATION;
        }
        if self.lock_translation_to_bone {
            flags |= TemplateFlags::LOCK_TRANSLATION_BONE;
        }
        if self.lock_movement {
            flags |= TemplateFlags::LOCK_MOVEMENT;
        }
        if self.lock_movement_to_bone {
            flags |= TemplateFlags::LOCK_MOVEMENT_BONE;
        }
        if self.reverse_bones {
            flags |= TemplateFlags::REVERSE_BONES;
        }
        if self.ignore_bounding {
            flags |= TemplateFlags::IGNORE_BOUNDING;
        }
        if self.custom_seed.is_some() {
            flags |= TemplateFlags::CUSTOM_SEED;
        }
        flags |= lock_bits(
            self.lock_rotation,
            TemplateFlags::LOCK_ROTATION,
            TemplateFlags::LOCK_ROTATION_EMIT,
        );
        flags |= lock_bits(
            self.lock_rotation_to_bone,
            TemplateFlags::LOCK_ROTATION_BONE,
            TemplateFlags::LOCK_ROTATION_BONE_EMIT,
        );
        flags |= lock_bits(
            self.lock_scale_x,
            TemplateFlags::LOCK_SCALE_X,
            TemplateFlags::LOCK_SCALE_X_EMIT,
        );
        flags |= lock_bits(
            self.lock_scale_y,
            TemplateFlags::LOCK_SCALE_Y,
            TemplateFlags::LOCK_SCALE_Y_EMIT,
        );
        flags |= lock_bits(
            self.lock_scale_z,
            TemplateFlags::LOCK_SCALE_Z,
            TemplateFlags::LOCK_SCALE_Z_EMIT,
        );
        flags |= lock_bits(
            self.lock_scale_x_to_bone,
            TemplateFlags::LOCK_SCALE_X_BONE,
            TemplateFlags::LOCK_SCALE_X_BONE_EMIT,
        );
        flags |= lock_bits(
            self.lock_scale_y_to_bone,
            TemplateFlags::LOCK_SCALE_Y_BONE,
            TemplateFlags::LOCK_SCALE_Y_BONE_EMIT,
        );
        flags |= lock_bits(
            self.lock_scale_z_to_bone,
            TemplateFlags::LOCK_SCALE_Z_BONE,
            TemplateFlags::LOCK_SCALE_Z_BONE_EMIT,
        );
        flags
    }

    /// Number of dispatch groups a single emitter instance needs. Computed
    /// once at creation; constant thereafter.
    pub fn compute_group_count(&self, seed: f32, animation_event: bool) -> u32 {
        match &self.budget {
            ParticleBudget::Count { min, max } => {
                let t = seed.clamp(0.0, 1.0);
                let lerped = *min as f32 + (1.0 + *max as f32 - *min as f32) * t;
                (*max).min(lerped as u32)
            }
            ParticleBudget::PerSecond(curve) => {
                let min_speed = self.min_animation_speed.max(1e-1);
                let mut emitter_duration = self.emitter_duration.1;
                let mut particle_duration = self.particle_duration.1;
                if self.scale_emitter_duration || (animation_event && !self.continuous) {
                    emitter_duration /= min_speed;
                }
                if self.scale_particle_duration {
                    particle_duration /= min_speed;
                }

                let max_pps = curve.max_with_variance(seed);
                // A continuous emitter recycles particles, so the ring buffer
                // only has to cover one particle lifetime.
                let ring_buffer_time =
                    if self.continuous || animation_event || particle_duration < emitter_duration {
                        particle_duration
                    } else {
                        emitter_duration
                    };
                (ring_buffer_time * max_pps).ceil() as u32 + 1
            }
        }
    }

    pub fn compute_particle_count(&self, seed: f32, animation_event: bool) -> u32 {
        self.compute_group_count(seed, animation_event) << self.group_size_shift
    }

    pub fn is_locked(&self) -> bool {
        self.lock_translation
            || self.lock_translation_to_bone
            || self.lock_movement
            || self.lock_movement_to_bone
            || self.lock_rotation != LockMode::Disabled
            || self.lock_rotation_to_bone != LockMode::Disabled
    }

    pub fn is_locked_scale(&self) -> bool {
        self.lock_scale_x != LockMode::Disabled
            || self.lock_scale_y != LockMode::Disabled
            || self.lock_scale_z != LockMode::Disabled
            || self.lock_scale_x_to_bone != LockMode::Disabled
            || self.lock_scale_y_to_bone != LockMode::Disabled
            || self.lock_scale_z_to_bone != LockMode::Disabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_budget_is_clamped_by_max() {
        let template = EmitterTemplate {
            budget: ParticleBudget::Count { min: 10, max: 100 },
            ..Default::default()
        };
        assert_eq!(template.compute_group_count(0.0, false), 10);
        assert_eq!(template.compute_group_count(1.0, false), 100);
        assert!(template.compute_group_count(0.5, false) >= 10);
        assert!(template.compute_group_count(0.5, false) <= 100);
    }

    #[test]
    fn group_size_shift_scales_particle_count() {
        let template = EmitterTemplate {
            budget: ParticleBudget::Count { min: 8, max: 8 },
            group_size_shift: 3,
            ..Default::default()
        };
        assert_eq!(template.compute_particle_count(0.0, false), 64);
    }

    #[test]
    fn per_second_budget_covers_the_shorter_window() {
        // 10 pps over a 0.5s particle lifetime needs 6 slots; the 10s
        // emitter duration must not enter into it.
        let template = EmitterTemplate {
            budget: ParticleBudget::PerSecond(RateCurve::from_constant(10.0)),
            emitter_duration: (10.0, 10.0),
            particle_duration: (0.5, 0.5),
            ..Default::default()
        };
        assert_eq!(template.compute_group_count(0.0, false), 6);
    }

    #[test]
    fn per_second_budget_uses_emitter_window_for_one_shots() {
        // Short emitter, long particles: the emitter stops emitting first.
        let template = EmitterTemplate {
            budget: ParticleBudget::PerSecond(RateCurve::from_constant(10.0)),
            emitter_duration: (1.0, 1.0),
            particle_duration: (5.0, 5.0),
            ..Default::default()
        };
        assert_eq!(template.compute_group_count(0.0, false), 11);
    }

    #[test]
    fn animation_event_stretches_duration_by_min_speed() {
        let template = EmitterTemplate {
            budget: ParticleBudget::PerSecond(RateCurve::from_constant(10.0)),
            emitter_duration: (1.0, 1.0),
            particle_duration: (5.0, 5.0),
            min_animation_speed: 0.5,
            ..Default::default()
        };
        // An animation event always budgets for the particle lifetime.
        assert_eq!(template.compute_group_count(0.0, true), 51);
    }

    #[test]
    fn lock_modes_map_to_separate_bits() {
        let template = EmitterTemplate {
            lock_rotation: LockMode::EmitOnly,
            lock_scale_x: LockMode::Enabled,
            ..Default::default()
        };
        let flags = template.template_flags();
        assert!(flags.contains(TemplateFlags::LOCK_ROTATION_EMIT));
        assert!(!flags.contains(TemplateFlags::LOCK_ROTATION));
        assert!(flags.contains(TemplateFlags::LOCK_SCALE_X | TemplateFlags::LOCK_SCALE_X_EMIT));
    }

    #[test]
    fn rate_curve_variance_raises_the_bound() {
        let curve = RateCurve {
            keys: SmallVec::from_slice(&[1.0, 8.0, 3.0]),
            variance: 4.0,
        };
        assert_eq!(curve.max_with_variance(0.0), 8.0);
        assert_eq!(curve.max_with_variance(1.0), 12.0);
        assert_eq!(curve.max_with_variance(2.0), 12.0);
    }
}

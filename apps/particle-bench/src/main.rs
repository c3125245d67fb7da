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
use anyhow::Result;
use device::{release, Device};
use entity::{BlendMode, CullMode, EntitySystem, GraphId, HeadlessEntities};
use gpu_particles::{
    DrawCallDesc, EmitterTemplate, ParticleBudget, ParticleSystem, RateCurve, RenderPassDesc,
};
use job::JobSystem;
use log::info;
use nalgebra::{Matrix4, Vector3};
use smallvec::smallvec;
use std::{sync::Arc, time::Instant};
use structopt::StructOpt;

/// Drive the GPU particle system headless and report throughput
#[derive(Debug, StructOpt)]
struct Opt {
    /// Number of emitters to spawn
    #[structopt(short, long, default_value = "1024")]
    emitters: usize,

    /// Number of frames to simulate
    #[structopt(short, long, default_value = "600")]
    frames: usize,

    /// Simulated frame time in milliseconds
    #[structopt(short, long, default_value = "16")]
    dt_millis: u64,

    /// Worker threads (default: cores - 1)
    #[structopt(short, long)]
    workers: Option<usize>,
}

fn bench_template(rng: &fastrand::Rng) -> Arc<EmitterTemplate> {
    Arc::new(EmitterTemplate {
        update_graphs: smallvec![GraphId(100)],
        sort_graphs: smallvec![GraphId(101)],
        render_passes: smallvec![RenderPassDesc {
            graphs: smallvec![GraphId(102)],
            blend_mode: Some(BlendMode::Additive),
            cull_mode: CullMode::None,
            mesh: None,
        }],
        budget: ParticleBudget::PerSecond(RateCurve::from_constant(rng.f32() * 200.0 + 10.0)),
        emitter_duration: (2.0, 6.0),
        particle_duration: (0.4, 1.2),
        continuous: rng.bool(),
        ..Default::default()
    })
}

fn main() -> Result<()> {
    env_logger::init();
    let opt = Opt::from_args();

    let device = Device::new();
    release::init();

    let jobs = match opt.workers {
        Some(workers) => Arc::new(JobSystem::new(workers)),
        None => Arc::new(JobSystem::with_default_workers()),
    };
    let entities = Arc::new(HeadlessEntities::new());
    let system = ParticleSystem::new(
        &device,
        Arc::clone(&entities) as Arc<dyn EntitySystem>,
        Arc::clone(&jobs),
    )?;

    info!(
        "spawning {} emitters across {} workers",
        opt.emitters,
        jobs.worker_count()
    );
    let rng = fastrand::Rng::with_seed(0x0c1d);
    let mut uids = Vec::with_capacity(opt.emitters);
    for n in 0..opt.emitters {
        let template = bench_template(&rng);
        let uid = system.create_emitter_uid();
        system.create_emitter(uid, &template, 1.0, -1.0, rng.f32() * 0.5);
        system.set_emitter_transform(
            uid,
            Matrix4::new_translation(&Vector3::new(n as f32 * 10.0, 0.0, 0.0)),
        );
        system.create_draw_calls(
            uid,
            1,
            &DrawCallDesc::from_template(template.as_ref()),
            &[],
            &entity::Bindings::new(),
            &entity::Uniforms::new(),
        );
        uids.push(uid);
    }

    let dt = opt.dt_millis as f32 / 1000.0;
    let camera = Vector3::new(0.0, 0.0, -100.0);
    let cull_priority = move |aabb: &geometry::Aabb| -> f32 {
        if aabb.is_infinite() {
            return -1.0;
        }
        (aabb.center - camera).norm()
    };

    let start = Instant::now();
    for frame in 0..opt.frames {
        // Pretend the renderer saw most of the population last frame.
        for uid in &uids {
            if rng.u32(..100) < 90 {
                system.set_draw_call_visible(*uid);
            }
        }
        system.frame_move_begin(dt, &cull_priority);
        system.frame_move_end();

        if frame % 120 == 0 {
            let stats = system.stats();
            info!(
                "frame {:5}: {} emitters, {} visible, {}/{} slots, {} bones",
                frame,
                stats.num_emitters,
                stats.num_visible_emitters,
                stats.num_used_slots,
                stats.max_particles,
                stats.num_bones,
            );
        }

        // Churn: retire and respawn a slice of the population.
        if frame % 30 == 29 {
            for _ in 0..opt.emitters / 20 {
                let victim = uids[rng.usize(..uids.len())];
                system.destroy_emitter(victim);
            }
        }
    }
    let elapsed = start.elapsed();

    let stats = system.stats();
    println!(
        "{} frames in {:.2?} ({:.2} ms/frame)",
        opt.frames,
        elapsed,
        elapsed.as_secs_f64() * 1000.0 / opt.frames as f64
    );
    println!(
        "final population: {} emitters ({} allocated, {} slots of {})",
        stats.num_emitters, stats.num_allocated_emitters, stats.num_allocated_slots, stats.max_particles
    );
    println!("entity moves issued: {}", entities.moves());

    system.clear();
    release::teardown();
    Ok(())
}

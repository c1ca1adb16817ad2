//! Renders a handful of frames of the procedural scene without a window,
//! then prints what the diagnostics collected.

use rtao_graphics as gpu;
use rtao_render::diagnostics::{HitCountKind, Stage};
use std::{env, path::Path, sync::Arc, time::Instant};
use strum::IntoEnumIterator as _;

const DEFAULT_FRAME_COUNT: u32 = 10;

fn create_target(context: &gpu::Context, size: gpu::Extent) -> gpu::Texture {
    context
        .create_texture(gpu::TextureDesc {
            name: "presentation",
            format: gpu::TextureFormat::Rgba8Unorm,
            size,
            usage: gpu::TextureUsage::COPY | gpu::TextureUsage::TARGET,
        })
        .expect("Unable to create the presentation target")
}

fn main() {
    env_logger::init();

    let mut args = env::args().skip(1);
    let config = match args.next() {
        Some(path) => rtao::Config::load(Path::new(&path)).expect("Unable to load the config"),
        None => rtao::Config::default(),
    };
    let frame_count = args
        .next()
        .map(|count| count.parse().expect("Frame count must be a number"))
        .unwrap_or(DEFAULT_FRAME_COUNT);

    println!("Initializing");
    let context = Arc::new(gpu::Context::init(config.context_desc()).expect("Device is not supported"));
    let size = gpu::Extent::new_2d(320, 180);
    let loader = Box::new(rtao::ProceduralScene::new(config.scene.clone()));
    let mut engine = rtao::Engine::new(Arc::clone(&context), &config, loader);
    engine.on_init(size).expect("Initialization failed");
    let mut target = create_target(&context, size);

    println!("Rendering {} frames", frame_count);
    let start = Instant::now();
    let mut presented = 0;
    for _ in 0..frame_count {
        engine.on_update(1.0 / 60.0);
        match engine.on_render(target) {
            Ok(rtao::FrameOutcome::Presented) => presented += 1,
            Ok(rtao::FrameOutcome::Skipped) => {}
            Ok(rtao::FrameOutcome::Reinitialized) => target = create_target(&context, size),
            Err(e) => {
                log::error!("Rendering failed: {:?}", e);
                break;
            }
        }
    }
    let elapsed = start.elapsed();
    println!(
        "Presented {}/{} frames in {:.1} ms",
        presented,
        frame_count,
        elapsed.as_secs_f64() * 1000.0
    );

    if let Some(renderer) = engine.renderer() {
        let diag = renderer.diagnostics();
        for stage in Stage::iter() {
            println!("\t{:?}: {:?}", stage, diag.timer(stage).average());
        }
        println!(
            "\tcamera hits: {}, occluded AO rays: {}",
            diag.hit_count(HitCountKind::CameraRays),
            diag.hit_count(HitCountKind::AoRays)
        );
        println!(
            "\t{} rays, {:.2} Mrays/s",
            diag.ray_counts().total(),
            diag.rays_per_second() * 1e-6
        );
        println!(
            "\tacceleration structures: {} bytes, {} frames since build",
            diag.acceleration_structure_bytes(),
            diag.frames_since_build()
        );
    }

    context.destroy_texture(target);
    engine.destroy();
    println!("Done");
}

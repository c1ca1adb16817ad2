use rtao::{config, Config, Engine, FrameError, FrameOutcome, ProceduralScene, Requests};
use rtao_graphics as gpu;
use rtao_render::{resources::Resolution, ConfigurationError, RenderError};
use std::sync::Arc;

const SIZE: gpu::Extent = gpu::Extent {
    width: 64,
    height: 36,
    depth: 1,
};

fn small_config() -> Config {
    Config {
        scene: config::Scene {
            sphere_count: 4,
            ground_divisions: 1,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn engine(config: &Config) -> Engine {
    let _ = env_logger::builder().is_test(true).try_init();
    let context = Arc::new(gpu::Context::init(config.context_desc()).unwrap());
    let loader = Box::new(ProceduralScene::new(config.scene.clone()));
    Engine::new(context, config, loader)
}

fn create_target(engine: &Engine, size: gpu::Extent) -> gpu::Texture {
    engine
        .gpu()
        .create_texture(gpu::TextureDesc {
            name: "target",
            format: gpu::TextureFormat::Rgba8Unorm,
            size,
            usage: gpu::TextureUsage::COPY | gpu::TextureUsage::TARGET,
        })
        .unwrap()
}

fn finish(mut engine: Engine, target: gpu::Texture) {
    engine.gpu().destroy_texture(target);
    engine.destroy();
    assert_eq!(engine.gpu().memory_usage(), 0);
}

#[test]
fn init_and_present() {
    let mut engine = engine(&small_config());
    engine.on_init(SIZE).unwrap();
    assert_eq!(engine.last_drained(), Requests::DRAIN_ORDER);
    assert!(engine.pending_requests().is_empty());

    let target = create_target(&engine, SIZE);
    assert_eq!(engine.on_render(target).unwrap(), FrameOutcome::Presented);
    assert_eq!(
        engine.gpu().texture_state(target),
        Ok(gpu::TextureState::Present)
    );
    let renderer = engine.renderer().unwrap();
    // ground plus the spheres
    assert_eq!(renderer.acceleration_structures().top_level_instance_count(), 5);
    assert!(renderer.frame_index() > 0);
    finish(engine, target);
}

#[test]
fn render_before_init() {
    let mut engine = engine(&small_config());
    let target = create_target(&engine, SIZE);
    assert!(matches!(
        engine.on_render(target),
        Err(FrameError::NotInitialized)
    ));
    finish(engine, target);
}

#[test]
fn requests_coalesce() {
    let mut engine = engine(&small_config());
    engine.on_init(SIZE).unwrap();
    let target = create_target(&engine, SIZE);

    engine.request_as_initialization();
    engine.request_recreate_ao_samples();
    engine.request_geometry_initialization();
    engine.request_as_initialization();
    engine.request_geometry_initialization();
    assert_eq!(
        engine.pending_requests(),
        Requests::GEOMETRY | Requests::ACCELERATION_STRUCTURE | Requests::AO_SAMPLES
    );
    assert_eq!(engine.on_render(target).unwrap(), FrameOutcome::Presented);
    assert_eq!(
        engine.last_drained(),
        [
            Requests::GEOMETRY,
            Requests::ACCELERATION_STRUCTURE,
            Requests::AO_SAMPLES
        ]
    );
    assert!(engine.pending_requests().is_empty());

    // a scene reload implies the rest of the chain
    engine.request_scene_initialization();
    assert_eq!(engine.on_render(target).unwrap(), FrameOutcome::Presented);
    assert_eq!(
        engine.last_drained(),
        [
            Requests::SCENE,
            Requests::GEOMETRY,
            Requests::ACCELERATION_STRUCTURE
        ]
    );

    // nothing pending, nothing drained
    assert_eq!(engine.on_render(target).unwrap(), FrameOutcome::Presented);
    assert!(engine.last_drained().is_empty());
    finish(engine, target);
}

#[test]
fn resize_recreates_resources() {
    let config = Config {
        ray: config::Ray {
            samples_per_pixel: 1,
            ..Default::default()
        },
        ..small_config()
    };
    let mut engine = engine(&config);
    let full_hd = gpu::Extent::new_2d(1920, 1080);
    engine.on_init(full_hd).unwrap();
    let pool = engine.renderer().unwrap().pool();
    assert_eq!(pool.extent(Resolution::Raytracing), full_hd);
    assert_eq!(pool.extent(Resolution::Low), gpu::Extent::new_2d(960, 540));

    let size = gpu::Extent::new_2d(1280, 720);
    engine.on_size_changed(size);
    assert_eq!(engine.pending_requests(), Requests::RAYTRACING_RESOURCES);
    let target = create_target(&engine, size);
    assert_eq!(engine.on_render(target).unwrap(), FrameOutcome::Presented);
    assert_eq!(engine.last_drained(), [Requests::RAYTRACING_RESOURCES]);

    let pool = engine.renderer().unwrap().pool();
    assert_eq!(pool.extent(Resolution::Raytracing), size);
    assert_eq!(pool.extent(Resolution::Low), gpu::Extent::new_2d(640, 360));
    assert_eq!(pool.composed().size(), size);
    let image = engine.gpu().read_texture(target).unwrap();
    assert_eq!(image.extent(), size);
    finish(engine, target);
}

#[test]
fn unchanged_size_is_ignored() {
    let mut engine = engine(&small_config());
    engine.on_init(SIZE).unwrap();
    engine.on_size_changed(SIZE);
    engine.on_size_changed(gpu::Extent::new_2d(0, 0));
    assert!(engine.pending_requests().is_empty());
    assert_eq!(engine.size(), SIZE);
    engine.destroy();
}

#[test]
fn exhaustion_skips_the_frame() {
    let mut engine = engine(&small_config());
    engine.on_init(SIZE).unwrap();
    let target = create_target(&engine, SIZE);
    assert_eq!(engine.on_render(target).unwrap(), FrameOutcome::Presented);
    let budget = engine.gpu().memory_budget();

    // no room for the scratch buffers of the frame
    engine.gpu().set_memory_budget(0);
    assert_eq!(engine.on_render(target).unwrap(), FrameOutcome::Skipped);
    assert!(engine.pending_requests().is_empty());

    // a failing request stays pending
    engine.request_as_initialization();
    assert_eq!(engine.on_render(target).unwrap(), FrameOutcome::Skipped);
    assert_eq!(engine.pending_requests(), Requests::ACCELERATION_STRUCTURE);

    engine.gpu().set_memory_budget(budget);
    assert_eq!(engine.on_render(target).unwrap(), FrameOutcome::Presented);
    assert_eq!(engine.last_drained(), [Requests::ACCELERATION_STRUCTURE]);
    assert!(engine.pending_requests().is_empty());
    finish(engine, target);
}

#[test]
fn device_loss_reinitializes() {
    let mut engine = engine(&small_config());
    engine.on_init(SIZE).unwrap();
    let target = create_target(&engine, SIZE);
    assert_eq!(engine.on_render(target).unwrap(), FrameOutcome::Presented);

    engine.gpu().lose_device();
    assert_eq!(engine.on_render(target).unwrap(), FrameOutcome::Reinitialized);
    assert!(!engine.gpu().is_lost());
    // the cached scene is replayed without loading it again
    assert_eq!(
        engine.last_drained(),
        [
            Requests::GEOMETRY,
            Requests::ACCELERATION_STRUCTURE,
            Requests::RAYTRACING_RESOURCES,
            Requests::AO_SAMPLES
        ]
    );
    let renderer = engine.renderer().unwrap();
    assert!(renderer
        .acceleration_structures()
        .bottom_level()
        .iter()
        .all(|blas| blas.is_built()));
    assert_eq!(renderer.ray_tracer().shader_tables_key(), Some(0b11));

    // the old target went away with the device
    let target = create_target(&engine, SIZE);
    assert_eq!(engine.on_render(target).unwrap(), FrameOutcome::Presented);
    assert_eq!(
        engine.renderer().unwrap().pool().extent(Resolution::Raytracing),
        SIZE
    );
    finish(engine, target);
}

#[test]
fn reported_device_loss() {
    let mut engine = engine(&small_config());
    engine.on_init(SIZE).unwrap();
    engine.on_device_lost();
    let target = create_target(&engine, SIZE);
    assert_eq!(engine.on_render(target).unwrap(), FrameOutcome::Reinitialized);
    let target = create_target(&engine, SIZE);
    assert_eq!(engine.on_render(target).unwrap(), FrameOutcome::Presented);
    finish(engine, target);
}

#[test]
fn configuration_errors_are_fatal() {
    let config = Config {
        denoiser: config::Denoiser {
            supersampling_scale: 0,
            ..Default::default()
        },
        ..small_config()
    };
    let mut engine = engine(&config);
    let err = engine.on_init(SIZE).unwrap_err();
    assert!(!err.is_transient());
    assert!(matches!(
        err,
        FrameError::Render(RenderError::Configuration(ConfigurationError::InvalidScale))
    ));
}

#[test]
fn animation_moves_instances() {
    let mut engine = engine(&small_config());
    engine.on_init(SIZE).unwrap();
    let before = engine
        .renderer()
        .unwrap()
        .acceleration_structures()
        .instances()
        .to_vec();
    engine.on_update(0.5);
    let after = engine.renderer().unwrap().acceleration_structures().instances();
    assert_eq!(after.len(), before.len());
    assert_ne!(after, &before[..]);
    assert_eq!(engine.scene().unwrap().instances, after);
    engine.destroy();
}

#[test]
fn zero_counts_are_rejected() {
    for text in [
        "(ray: (samples_per_pixel: 0))",
        "(ray: (sample_set_count: 0))",
        "(engine: (timer_window: 0))",
    ] {
        let config = Config::from_ron(text).unwrap();
        let mut engine = engine(&config);
        let err = engine.on_init(SIZE).unwrap_err();
        assert!(!err.is_transient(), "{}", text);
        assert!(
            matches!(
                err,
                FrameError::Render(RenderError::Configuration(ConfigurationError::ZeroCount(_)))
            ),
            "{}: {:?}",
            text,
            err
        );
        assert!(engine.renderer().is_none());
    }
}

#[test]
fn animated_light_reaches_the_renderer() {
    let config = Config {
        scene: config::Scene {
            animate: false,
            animate_light: true,
            ..small_config().scene
        },
        ..small_config()
    };
    let mut engine = engine(&config);
    engine.on_init(SIZE).unwrap();
    let renderer = engine.renderer().unwrap();
    let before = renderer.geometry().unwrap().light_direction;
    let instances = renderer.acceleration_structures().instances().to_vec();

    engine.on_update(1.0);
    let renderer = engine.renderer().unwrap();
    let after = renderer.geometry().unwrap().light_direction;
    assert!(!after.abs_diff_eq(before, 1e-3));
    assert!((after.length() - 1.0).abs() < 1e-5);
    // the rotation keeps the elevation
    assert!((after.y - before.y).abs() < 1e-5);
    assert_eq!(renderer.acceleration_structures().instances(), &instances[..]);
    let described = glam::Vec3::from(engine.scene().unwrap().light_direction);
    assert!(described.normalize().abs_diff_eq(after, 1e-6));

    let target = create_target(&engine, SIZE);
    assert_eq!(engine.on_render(target).unwrap(), FrameOutcome::Presented);
    finish(engine, target);
}

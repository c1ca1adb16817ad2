use rtao_graphics as gpu;
use rtao_render::{
    diagnostics::{HitCountKind, Stage},
    resources::{AoResource, GBufferResource, Resolution},
    scene::{GeometryGroup, GeometryInstance, GeometryKind, Material, SceneDescription, Vertex},
    util::FramePacer,
    Camera, ConfigurationError, FrameResources, MaterialUser, RenderConfig, RenderError, Renderer,
};

fn context() -> gpu::Context {
    let _ = env_logger::builder().is_test(true).try_init();
    gpu::Context::init(gpu::ContextDesc::default()).unwrap()
}

fn quad() -> GeometryGroup {
    let corner = |x: f32, y: f32| Vertex {
        position: [x, y, 0.0],
        normal: [0.0, 0.0, 1.0],
    };
    GeometryGroup {
        name: "quad".to_string(),
        kind: GeometryKind::Triangles {
            vertices: vec![
                corner(-1.0, -1.0),
                corner(1.0, -1.0),
                corner(1.0, 1.0),
                corner(-1.0, 1.0),
            ],
            indices: vec![0, 1, 2, 0, 2, 3],
        },
        material: 0,
    }
}

fn sphere() -> GeometryGroup {
    GeometryGroup {
        name: "sphere".to_string(),
        kind: GeometryKind::Procedural {
            aabbs: vec![gpu::Aabb {
                min: glam::Vec3::splat(-1.0),
                max: glam::Vec3::splat(1.0),
            }],
        },
        material: 1,
    }
}

fn instance(blas: usize) -> GeometryInstance {
    GeometryInstance {
        blas,
        transform: gpu::IDENTITY_TRANSFORM,
        material: None,
        mask: 0xFF,
    }
}

fn scene(groups: Vec<GeometryGroup>, instances: Vec<GeometryInstance>) -> SceneDescription {
    SceneDescription {
        geometry_groups: groups,
        materials: vec![
            Material::default(),
            Material {
                albedo: [0.9, 0.2, 0.2],
                ..Default::default()
            },
        ],
        environment: [0.5, 0.6, 0.7],
        light_direction: [0.0, 1.0, 0.3].into(),
        instances,
    }
}

fn create_target(gpu: &gpu::Context, size: gpu::Extent) -> gpu::Texture {
    gpu.create_texture(gpu::TextureDesc {
        name: "target",
        format: gpu::TextureFormat::Rgba8Unorm,
        size,
        usage: gpu::TextureUsage::COPY | gpu::TextureUsage::TARGET,
    })
    .unwrap()
}

struct Harness {
    gpu: gpu::Context,
    pacer: FramePacer,
    renderer: Renderer,
    target: gpu::Texture,
}

impl Harness {
    fn new(desc: &SceneDescription, size: gpu::Extent, config: RenderConfig) -> Self {
        let gpu = context();
        let mut pacer = FramePacer::new(&gpu);
        let mut renderer = Renderer::new(&gpu, config).unwrap();
        renderer.load_geometry(&gpu, desc).unwrap();
        let (encoder, temp) = pacer.begin_frame(&gpu);
        renderer.initialize_structures(&gpu, encoder, temp).unwrap();
        renderer
            .recreate_raytracing_resources(&gpu, encoder, size)
            .unwrap();
        renderer.recreate_samples(&gpu, temp).unwrap();
        pacer.end_frame(&gpu).unwrap();
        let target = create_target(&gpu, size);
        Self {
            gpu,
            pacer,
            renderer,
            target,
        }
    }

    fn frame(&mut self) -> Result<(), RenderError> {
        let (encoder, temp) = self.pacer.begin_frame(&self.gpu);
        let result = self
            .renderer
            .render(&self.gpu, encoder, temp, &Camera::default(), self.target);
        let sync_point = self.pacer.end_frame(&self.gpu)?;
        self.renderer
            .finish_frame(&self.gpu, &sync_point, self.pacer.timings());
        result
    }

    fn read(&self, texture: gpu::Texture) -> gpu::TexelImage {
        self.gpu.read_texture(texture).unwrap()
    }

    fn gbuffer(&self, resource: GBufferResource) -> gpu::TexelImage {
        self.read(
            self.renderer
                .pool()
                .gbuffer(Resolution::Raytracing, resource)
                .texture(0),
        )
    }

    fn destroy(mut self) {
        self.pacer.wait_for_all(&self.gpu);
        self.gpu.destroy_texture(self.target);
        self.renderer.destroy(&self.gpu);
        self.pacer.destroy(&self.gpu);
    }
}

const SIZE: gpu::Extent = gpu::Extent {
    width: 32,
    height: 24,
    depth: 1,
};

#[test]
fn empty_instance_table_misses_everything() {
    let desc = scene(vec![quad(), sphere()], Vec::new());
    let mut harness = Harness::new(&desc, SIZE, RenderConfig::default());
    harness.frame().unwrap();

    let report = harness.renderer.last_build_report().unwrap();
    assert_eq!(report.instance_count, 0);
    assert_eq!(harness.renderer.acceleration_structures().bottom_level().len(), 2);

    let position = harness.gbuffer(GBufferResource::Position);
    assert!(position.texels().chunks(4).all(|t| t[3] == 0.0));
    let albedo = harness.gbuffer(GBufferResource::Albedo);
    // the environment shows through
    assert!((albedo.load(0, 0)[2] - 0.7).abs() < 0.01);
    assert_eq!(
        harness
            .renderer
            .diagnostics()
            .hit_count(HitCountKind::CameraRays),
        0
    );
    harness.destroy();
}

#[test]
fn instances_refit_and_hit() {
    let desc = scene(vec![quad(), sphere()], Vec::new());
    let mut harness = Harness::new(&desc, SIZE, RenderConfig::default());
    harness.frame().unwrap();

    harness
        .renderer
        .update_instances(&[instance(0), instance(1)]);
    harness.frame().unwrap();
    let report = harness.renderer.last_build_report().unwrap();
    assert_eq!(report.instance_count, 2);
    assert!(report.rebuilt.is_empty());
    assert_eq!(report.refit, vec![0, 1]);
    assert_eq!(
        harness
            .renderer
            .acceleration_structures()
            .top_level_instance_count(),
        2
    );

    let diagnostics = harness.renderer.diagnostics();
    assert!(diagnostics.hit_count(HitCountKind::CameraRays) > 0);
    assert!(diagnostics.ray_counts().total() > 0);
    assert!(diagnostics.timer(Stage::GBuffer).sample_count() > 0);

    // the sphere in front of the quad carries the red material
    let material = harness.gbuffer(GBufferResource::MaterialId);
    let center = material.load(SIZE.width / 2, SIZE.height / 2 + 6)[0];
    let table = harness.renderer.geometry().unwrap();
    assert_eq!(Some(center as u32), table.material_index(1));
    assert_eq!(table.material_index(2), None);
    harness.destroy();
}

#[test]
fn material_override() {
    let mut red_quad = instance(0);
    red_quad.material = Some(1);
    let desc = scene(vec![quad(), sphere()], vec![red_quad]);
    let mut harness = Harness::new(&desc, SIZE, RenderConfig::default());
    harness.frame().unwrap();
    let albedo = harness.gbuffer(GBufferResource::Albedo);
    let texel = albedo.load(SIZE.width / 2, SIZE.height / 2 + 6);
    assert!(texel[0] > 0.8 && texel[1] < 0.3);
    harness.destroy();
}

#[test]
fn forced_rebuild() {
    let desc = scene(vec![quad(), sphere()], vec![instance(0), instance(1)]);
    let mut harness = Harness::new(&desc, SIZE, RenderConfig::default());
    harness.frame().unwrap();
    assert!(harness.renderer.last_build_report().unwrap().rebuilt.is_empty());

    harness.renderer.force_rebuild();
    harness.frame().unwrap();
    assert_eq!(
        harness.renderer.last_build_report().unwrap().rebuilt,
        vec![0, 1]
    );
    harness.frame().unwrap();
    assert!(harness.renderer.last_build_report().unwrap().rebuilt.is_empty());
    harness.destroy();
}

#[test]
fn topology_change_forces_rebuild() {
    let desc = scene(vec![quad(), sphere()], vec![instance(0), instance(1)]);
    let mut harness = Harness::new(&desc, SIZE, RenderConfig::default());
    harness.frame().unwrap();
    assert_eq!(harness.renderer.last_build_report().unwrap().refit, vec![0, 1]);

    // keep one of the two quad triangles
    harness.renderer.set_primitive_count(0, 1).unwrap();
    harness.frame().unwrap();
    let report = harness.renderer.last_build_report().unwrap();
    assert_eq!(report.rebuilt, vec![0]);
    assert_eq!(report.refit, vec![1]);
    let blas = &harness.renderer.acceleration_structures().bottom_level()[0];
    assert_eq!(blas.primitive_count(), 1);
    assert_eq!(blas.frames_since_build(), 0);

    // the same count again leaves the topology alone
    harness.renderer.set_primitive_count(0, 1).unwrap();
    harness.frame().unwrap();
    assert!(harness.renderer.last_build_report().unwrap().rebuilt.is_empty());

    assert_eq!(
        harness.renderer.set_primitive_count(0, 3),
        Err(RenderError::Configuration(ConfigurationError::PrimitiveCount {
            name: "quad".to_string(),
            requested: 3,
            capacity: 2,
        }))
    );
    assert_eq!(
        harness.renderer.set_primitive_count(2, 1),
        Err(RenderError::Configuration(ConfigurationError::UnknownGeometry {
            index: 2,
            count: 2,
        }))
    );
    harness.destroy();
}

#[test]
fn group_transforms_move_instances() {
    let desc = scene(
        vec![quad(), sphere()],
        vec![instance(0), instance(1), instance(1)],
    );
    let mut harness = Harness::new(&desc, SIZE, RenderConfig::default());
    harness.frame().unwrap();

    let moved = [glam::Vec3::new(3.0, 0.0, 0.0), glam::Vec3::new(-3.0, 0.0, 0.0)]
        .map(|offset| gpu::transform_from_affine(&glam::Affine3A::from_translation(offset)));
    harness.renderer.set_group_transforms(1, &moved);
    let instances = harness.renderer.acceleration_structures().instances();
    assert_eq!(instances[0].transform, gpu::IDENTITY_TRANSFORM);
    assert_eq!(instances[1].transform, moved[0]);
    assert_eq!(instances[2].transform, moved[1]);

    harness.frame().unwrap();
    let report = harness.renderer.last_build_report().unwrap();
    assert!(report.rebuilt.is_empty());
    assert_eq!(report.instance_count, 3);

    // with the spheres out of the way the quad is visible
    let material = harness.gbuffer(GBufferResource::MaterialId);
    let center = material.load(SIZE.width / 2, SIZE.height / 2 + 6)[0];
    let table = harness.renderer.geometry().unwrap();
    assert_eq!(Some(center as u32), table.material_index(0));
    harness.destroy();
}

#[test]
fn rebuild_policy_limits_refits() {
    let desc = scene(vec![quad()], vec![instance(0)]);
    let mut config = RenderConfig::default();
    config.rebuild_policy.max_refits = Some(2);
    let mut harness = Harness::new(&desc, SIZE, config);
    let mut kinds = Vec::new();
    for _ in 0..4 {
        harness.frame().unwrap();
        let report = harness.renderer.last_build_report().unwrap();
        kinds.push(!report.rebuilt.is_empty());
    }
    assert_eq!(kinds, [false, false, true, false]);
    harness.destroy();
}

#[test]
fn dangling_reference_names_the_instance() {
    let desc = scene(vec![quad(), sphere()], vec![instance(0), instance(5)]);
    let mut harness = Harness::new(&desc, SIZE, RenderConfig::default());
    assert_eq!(
        harness.frame(),
        Err(RenderError::DanglingReference {
            instance: 1,
            blas: 5,
            count: 2,
        })
    );
    harness.destroy();
}

#[test]
fn dangling_material_names_the_instance() {
    let mut bad = instance(1);
    bad.material = Some(7);
    let desc = scene(vec![quad(), sphere()], vec![instance(0), bad]);
    let mut harness = Harness::new(&desc, SIZE, RenderConfig::default());
    let err = harness.frame().unwrap_err();
    assert!(!err.is_transient());
    assert_eq!(
        err,
        RenderError::DanglingMaterial {
            user: MaterialUser::Instance(1),
            material: 7,
            count: 2,
        }
    );
    harness.destroy();
}

#[test]
fn dangling_group_material_is_rejected() {
    let gpu = context();
    let mut renderer = Renderer::new(&gpu, RenderConfig::default()).unwrap();
    let usage = gpu.memory_usage();
    let mut broken = sphere();
    broken.material = 2;
    assert_eq!(
        renderer.load_geometry(&gpu, &scene(vec![quad(), broken], Vec::new())),
        Err(RenderError::DanglingMaterial {
            user: MaterialUser::Group("sphere".to_string()),
            material: 2,
            count: 2,
        })
    );
    assert!(renderer.geometry().is_none());
    assert_eq!(gpu.memory_usage(), usage);

    // without any materials, only the default one can be referenced
    let mut bare = scene(vec![quad()], Vec::new());
    bare.materials.clear();
    renderer.load_geometry(&gpu, &bare).unwrap();
    assert_eq!(renderer.geometry().unwrap().material_index(0), Some(0));
    renderer.destroy(&gpu);
}

#[test]
fn only_hemisphere_samples_are_uploaded() {
    let gpu = context();
    let mut renderer = Renderer::new(&gpu, RenderConfig::default()).unwrap();
    assert!(renderer.pool().hemisphere_samples().is_none());
    let usage = gpu.memory_usage();
    let mut temp = FrameResources::default();
    renderer.recreate_samples(&gpu, &mut temp).unwrap();
    assert!(temp.is_empty());

    // 4 rays per pixel in 8 sets, one padded direction each
    let expected = 4 * 8 * 16;
    let buffer = renderer.pool().hemisphere_samples().unwrap();
    assert_eq!(gpu.buffer_size(buffer), Ok(expected));
    assert_eq!(gpu.memory_usage(), usage + expected);

    renderer.recreate_samples(&gpu, &mut temp).unwrap();
    assert_eq!(temp.buffers, vec![buffer]);
    temp.destroy(&gpu);
    assert_eq!(gpu.memory_usage(), usage + expected);
    renderer.destroy(&gpu);
    assert_eq!(gpu.memory_usage(), 0);
}

#[test]
fn resolution_law() {
    let size = gpu::Extent::new_2d(33, 17);
    let desc = scene(vec![quad()], vec![instance(0)]);
    let mut config = RenderConfig::default();
    config.denoiser.supersampling_scale = 3;
    let mut harness = Harness::new(&desc, size, config);
    let pool = harness.renderer.pool();
    assert_eq!(pool.extent(Resolution::Low), gpu::Extent::new_2d(11, 6));
    assert_eq!(pool.ao(AoResource::Filtered).size(), gpu::Extent::new_2d(11, 6));
    assert_eq!(pool.ao(AoResource::Upsampled).size(), size);
    harness.frame().unwrap();
    assert_eq!(harness.read(harness.target).extent(), size);
    harness.destroy();
}

#[test]
fn resize_recreates_window_resources() {
    let desc = scene(vec![quad()], vec![instance(0)]);
    let mut harness = Harness::new(&desc, gpu::Extent::new_2d(192, 108), RenderConfig::default());
    harness.frame().unwrap();

    let size = gpu::Extent::new_2d(128, 72);
    harness.pacer.wait_for_all(&harness.gpu);
    let (encoder, _) = harness.pacer.begin_frame(&harness.gpu);
    harness
        .renderer
        .recreate_raytracing_resources(&harness.gpu, encoder, size)
        .unwrap();
    harness.pacer.end_frame(&harness.gpu).unwrap();

    // the old target no longer matches
    assert!(matches!(
        harness.frame(),
        Err(RenderError::Configuration(ConfigurationError::ResolutionMismatch {
            stage: "compose",
            ..
        }))
    ));
    harness.gpu.destroy_texture(harness.target);
    harness.target = create_target(&harness.gpu, size);
    harness.frame().unwrap();

    let pool = harness.renderer.pool();
    assert_eq!(pool.extent(Resolution::Raytracing), size);
    assert_eq!(pool.gbuffer(Resolution::Raytracing, GBufferResource::Position).size(), size);
    assert_eq!(pool.ao(AoResource::Coefficient).size(), size);
    assert_eq!(pool.composed().size(), size);
    assert_eq!(harness.read(harness.target).extent(), size);
    assert_eq!(
        harness.gpu.texture_state(harness.target),
        Ok(gpu::TextureState::Present)
    );
    harness.destroy();
}

#[test]
fn scratch_failure_leaves_nothing_built() {
    let gpu = context();
    let mut pacer = FramePacer::new(&gpu);
    let mut renderer = Renderer::new(&gpu, RenderConfig::default()).unwrap();
    let desc = scene(vec![quad(), sphere()], Vec::new());
    renderer.load_geometry(&gpu, &desc).unwrap();

    // room for the first structure, but not for its scratch buffer
    let geometry = gpu::AccelerationStructureGeometry::Triangles {
        vertex_data: gpu::Buffer::default().into(),
        vertex_stride: 24,
        vertex_count: 4,
        index_data: None,
        triangle_count: 2,
        is_opaque: true,
    };
    let sizes = gpu.get_bottom_level_acceleration_structure_sizes(&[geometry]);
    let usage = gpu.memory_usage();
    gpu.set_memory_budget(usage + sizes.data);

    let (encoder, temp) = pacer.begin_frame(&gpu);
    let err = renderer
        .initialize_structures(&gpu, encoder, temp)
        .unwrap_err();
    assert!(matches!(err, RenderError::BuildFailure { .. }));
    assert!(err.is_transient());
    assert!(renderer.acceleration_structures().bottom_level().is_empty());
    assert_eq!(renderer.ray_tracer().shader_tables_key(), None);
    assert_eq!(gpu.memory_usage(), usage);

    // retry after growing the budget
    gpu.set_memory_budget(1 << 30);
    renderer.initialize_structures(&gpu, encoder, temp).unwrap();
    assert!(renderer
        .acceleration_structures()
        .bottom_level()
        .iter()
        .all(|blas| blas.is_built()));
    pacer.end_frame(&gpu).unwrap();

    pacer.wait_for_all(&gpu);
    renderer.destroy(&gpu);
    pacer.destroy(&gpu);
}

#[test]
fn shader_table_layout() {
    let desc = scene(vec![quad(), sphere()], Vec::new());
    let harness = Harness::new(&desc, SIZE, RenderConfig::default());
    let ray_tracer = harness.renderer.ray_tracer();
    assert_eq!(ray_tracer.shader_tables_key(), Some(0b11));

    let hit = ray_tracer.hit_group_table().unwrap();
    let stride = hit.stride() as u64;
    assert_eq!(stride % gpu::limits::SHADER_RECORD_ALIGNMENT as u64, 0);
    assert!(stride >= gpu::limits::SHADER_IDENTIFIER_SIZE as u64);
    assert_eq!(hit.record_count(), 4);
    assert_eq!(hit.offset_of("triangle-radiance"), Some(0));
    assert_eq!(hit.offset_of("triangle-shadow"), Some(stride));
    assert_eq!(hit.offset_of("sphere-radiance"), Some(2 * stride));
    assert_eq!(hit.offset_of("sphere-shadow"), Some(3 * stride));

    // the environment radiance rides in the miss record
    let miss = ray_tracer.miss_table().unwrap();
    assert!(miss.stride() >= gpu::limits::SHADER_IDENTIFIER_SIZE + 16);
    assert_eq!(miss.offset_of("shadow-miss"), Some(miss.stride() as u64));
    harness.destroy();
}

#[test]
fn inactive_geometry_keeps_offsets() {
    let desc = scene(vec![sphere()], vec![instance(0)]);
    let harness = Harness::new(&desc, SIZE, RenderConfig::default());
    let ray_tracer = harness.renderer.ray_tracer();
    assert_eq!(ray_tracer.shader_tables_key(), Some(0b10));
    let hit = ray_tracer.hit_group_table().unwrap();
    assert_eq!(hit.offset_of("triangle-radiance"), None);
    assert_eq!(hit.offset_of("sphere-radiance"), Some(2 * hit.stride() as u64));
    harness.destroy();
}

#[test]
fn stale_shader_tables_are_rejected() {
    let desc = scene(vec![quad()], vec![instance(0)]);
    let mut harness = Harness::new(&desc, SIZE, RenderConfig::default());
    harness.frame().unwrap();

    // new geometry without initializing the structures again
    harness.pacer.wait_for_all(&harness.gpu);
    let other = scene(vec![sphere()], Vec::new());
    harness
        .renderer
        .load_geometry(&harness.gpu, &other)
        .unwrap();
    assert_eq!(
        harness.frame(),
        Err(RenderError::Configuration(
            ConfigurationError::StaleShaderTables {
                built: 0b01,
                current: 0,
            }
        ))
    );
    harness.destroy();
}

#[test]
fn deterministic_output() {
    let desc = scene(vec![quad(), sphere()], vec![instance(0), instance(1)]);
    let render = || {
        let mut harness = Harness::new(&desc, SIZE, RenderConfig::default());
        harness.frame().unwrap();
        let coefficient = harness.read(harness.renderer.pool().ao(AoResource::Coefficient).texture(0));
        let image = harness.read(harness.target);
        harness.destroy();
        (coefficient.texels().to_vec(), image.texels().to_vec())
    };
    assert_eq!(render(), render());
}

#[test]
fn render_without_targets_is_an_error() {
    let gpu = context();
    let mut pacer = FramePacer::new(&gpu);
    let mut renderer = Renderer::new(&gpu, RenderConfig::default()).unwrap();
    let (encoder, temp) = pacer.begin_frame(&gpu);
    let target = create_target(&gpu, SIZE);
    assert_eq!(
        renderer.render(&gpu, encoder, temp, &Camera::default(), target),
        Err(RenderError::Configuration(ConfigurationError::NoScene))
    );
    renderer
        .load_geometry(&gpu, &scene(vec![quad()], Vec::new()))
        .unwrap();
    assert_eq!(
        renderer.render(&gpu, encoder, temp, &Camera::default(), target),
        Err(RenderError::Configuration(
            ConfigurationError::MissingRenderTargets
        ))
    );
    pacer.end_frame(&gpu).unwrap();
    gpu.destroy_texture(target);
    renderer.destroy(&gpu);
    pacer.destroy(&gpu);
}

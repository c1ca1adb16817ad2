use rtao_graphics as gpu;
use std::sync::Arc;

fn context(memory_budget: u64) -> gpu::Context {
    let _ = env_logger::builder().is_test(true).try_init();
    gpu::Context::init(gpu::ContextDesc {
        validation: true,
        timing: true,
        memory_budget,
    })
    .unwrap()
}

fn texture(context: &gpu::Context, name: &str, size: gpu::Extent) -> gpu::Texture {
    context
        .create_texture(gpu::TextureDesc {
            name,
            format: gpu::TextureFormat::Rgba32Float,
            size,
            usage: gpu::TextureUsage::COPY | gpu::TextureUsage::STORAGE,
        })
        .unwrap()
}

#[test]
fn memory_budget() {
    let context = context(1000);
    let buffer = context
        .create_buffer(gpu::BufferDesc {
            name: "small",
            size: 600,
            memory: gpu::Memory::Device,
        })
        .unwrap();
    let err = context
        .create_buffer(gpu::BufferDesc {
            name: "large",
            size: 600,
            memory: gpu::Memory::Device,
        })
        .unwrap_err();
    assert_eq!(
        err,
        gpu::DeviceError::OutOfMemory {
            name: "large".to_string(),
            requested: 600,
            available: 400,
        }
    );
    context.destroy_buffer(buffer);
    assert_eq!(context.memory_usage(), 0);
}

#[test]
fn device_loss() {
    let context = context(1 << 20);
    let mut encoder = context.create_command_encoder(gpu::CommandEncoderDesc {
        name: "main",
        buffer_count: 1,
    });
    encoder.start();
    let sp = context.submit(&mut encoder).unwrap();
    assert!(context.wait_for(&sp, !0));

    context.lose_device();
    encoder.start();
    assert_eq!(context.submit(&mut encoder), Err(gpu::DeviceError::Lost));
    assert!(context
        .create_buffer(gpu::BufferDesc {
            name: "after loss",
            size: 4,
            memory: gpu::Memory::Shared,
        })
        .is_err());

    context.recreate();
    assert!(!context.is_lost());
    encoder.start();
    let next = context.submit(&mut encoder).unwrap();
    assert!(next.value() > sp.value());
}

#[test]
fn copy_requires_transitions() {
    let context = context(1 << 20);
    let size = gpu::Extent::new_2d(4, 4);
    let src = texture(&context, "src", size);
    let dst = texture(&context, "dst", size);
    let mut encoder = context.create_command_encoder(gpu::CommandEncoderDesc {
        name: "copy",
        buffer_count: 1,
    });

    encoder.start();
    encoder.init_texture(src);
    encoder.init_texture(dst);
    encoder.transfer("copy").copy_texture_to_texture(src, dst);
    match context.submit(&mut encoder) {
        Err(gpu::DeviceError::InvalidState {
            expected, actual, ..
        }) => {
            assert_eq!(expected, gpu::TextureState::CopySource);
            assert_eq!(actual, gpu::TextureState::Common);
        }
        other => panic!("Unexpected {:?}", other),
    }

    encoder.start();
    encoder.transition(src, gpu::TextureState::CopySource);
    encoder.transition(dst, gpu::TextureState::CopyDestination);
    encoder.transfer("copy").copy_texture_to_texture(src, dst);
    encoder.transition(dst, gpu::TextureState::Present);
    context.submit(&mut encoder).unwrap();
    assert_eq!(context.texture_state(dst).unwrap(), gpu::TextureState::Present);
    assert_eq!(encoder.timings().len(), 1);
}

struct Fill {
    output: gpu::TextureView,
    value: f32,
}

impl gpu::ComputeKernel for Fill {
    fn outputs(&self) -> Vec<gpu::KernelOutput> {
        vec![gpu::KernelOutput::Texture(self.output)]
    }
    fn execute(
        &self,
        _resources: &gpu::Resources,
        outputs: &mut gpu::KernelOutputs,
        grid: gpu::Extent,
    ) -> Result<(), gpu::DeviceError> {
        let value = self.value;
        outputs.texture(0).par_fill(grid, |_, _| [value; 4]);
        Ok(())
    }
}

struct Echo {
    input: gpu::TextureView,
    output: gpu::TextureView,
}

impl gpu::ComputeKernel for Echo {
    fn outputs(&self) -> Vec<gpu::KernelOutput> {
        vec![gpu::KernelOutput::Texture(self.output)]
    }
    fn execute(
        &self,
        resources: &gpu::Resources,
        outputs: &mut gpu::KernelOutputs,
        grid: gpu::Extent,
    ) -> Result<(), gpu::DeviceError> {
        let input = resources.texture(self.input)?;
        outputs.texture(0).par_fill(grid, |x, y| input.load(x, y));
        Ok(())
    }
}

#[test]
fn compute_dispatch() {
    let context = context(1 << 20);
    let size = gpu::Extent::new_2d(5, 3);
    let target = texture(&context, "target", size);
    let view = context
        .create_texture_view(gpu::TextureViewDesc {
            name: "target",
            texture: target,
        })
        .unwrap();
    let pipeline = context.create_compute_pipeline(gpu::ComputePipelineDesc {
        name: "fill",
        workgroup_size: [8, 8, 1],
    });
    let mut encoder = context.create_command_encoder(gpu::CommandEncoderDesc {
        name: "compute",
        buffer_count: 1,
    });
    encoder.start();
    encoder.init_texture(target);
    {
        let mut pass = encoder.compute("fill");
        let mut pc = pass.with(&pipeline);
        pc.bind(Fill {
            output: view,
            value: 0.25,
        });
        pc.dispatch(pipeline.get_dispatch_for(size));
    }
    context.submit(&mut encoder).unwrap();
    let image = context.read_texture(target).unwrap();
    assert!(image.texels().iter().all(|&v| v == 0.25));

    // reading and writing the same texture is rejected
    encoder.start();
    {
        let mut pass = encoder.compute("echo");
        let mut pc = pass.with(&pipeline);
        pc.bind(Echo {
            input: view,
            output: view,
        });
        pc.dispatch([1, 1, 1]);
    }
    assert_eq!(
        context.submit(&mut encoder),
        Err(gpu::DeviceError::Aliasing("target".to_string()))
    );
    // the image is back in place after the failed dispatch
    assert_eq!(context.texture_extent(target).unwrap(), size);
}

struct DepthRayGen;
impl gpu::RayGenProgram for DepthRayGen {
    fn ray_gen(
        &self,
        context: &gpu::LaunchContext<'_>,
        index: [u32; 2],
        _record: &[u8],
        outputs: &mut [[f32; 4]],
    ) {
        let size = context.size();
        let u = (index[0] as f32 + 0.5) / size.width as f32;
        let v = (index[1] as f32 + 0.5) / size.height as f32;
        let ray = gpu::Ray {
            origin: glam::Vec3::new(u * 2.0 - 1.0, v * 2.0 - 1.0, 5.0),
            t_min: 0.0,
            direction: -glam::Vec3::Z,
            t_max: 100.0,
        };
        let payload = context.trace_ray(&ray, gpu::RayFlags::empty(), 0xFF, 0, 1, 0);
        outputs[0] = [payload.t, payload.material_id as f32, 0.0, 1.0];
    }
}

struct MaterialHit;
impl gpu::ClosestHitProgram for MaterialHit {
    fn closest_hit(&self, _hit: &gpu::HitAttributes, record: &[u8], payload: &mut gpu::RayPayload) {
        payload.material_id = bytemuck::pod_read_unaligned::<u32>(&record[..4]);
    }
}

struct Background;
impl gpu::MissProgram for Background {
    fn miss(&self, _ray: &gpu::Ray, _record: &[u8], payload: &mut gpu::RayPayload) {
        payload.t = -1.0;
    }
}

#[test]
fn ray_dispatch() {
    let context = context(1 << 24);
    let vertices: [[f32; 3]; 3] = [[-1.0, -1.0, 0.0], [1.0, -1.0, 0.0], [0.0, 1.0, 0.0]];
    let vertex_buf = context
        .create_buffer(gpu::BufferDesc {
            name: "vertices",
            size: 36,
            memory: gpu::Memory::Shared,
        })
        .unwrap();
    context.write_buffer_pod(vertex_buf.into(), &vertices).unwrap();
    let geometry = gpu::AccelerationStructureGeometry::Triangles {
        vertex_data: vertex_buf.into(),
        vertex_stride: 12,
        vertex_count: 3,
        index_data: None,
        triangle_count: 1,
        is_opaque: true,
    };
    let blas_sizes = context.get_bottom_level_acceleration_structure_sizes(&[geometry]);
    let blas = context
        .create_acceleration_structure(gpu::AccelerationStructureDesc {
            name: "blas",
            ty: gpu::AccelerationStructureType::BottomLevel,
            size: blas_sizes.data,
            flags: gpu::AccelerationStructureFlags::PREFER_FAST_TRACE,
        })
        .unwrap();
    let tlas_sizes = context.get_top_level_acceleration_structure_sizes(1);
    let tlas = context
        .create_acceleration_structure(gpu::AccelerationStructureDesc {
            name: "tlas",
            ty: gpu::AccelerationStructureType::TopLevel,
            size: tlas_sizes.data,
            flags: gpu::AccelerationStructureFlags::PREFER_FAST_TRACE,
        })
        .unwrap();
    let scratch = context
        .create_buffer(gpu::BufferDesc {
            name: "scratch",
            size: blas_sizes.scratch.max(tlas_sizes.scratch),
            memory: gpu::Memory::Device,
        })
        .unwrap();
    let instances = context
        .create_acceleration_structure_instance_buffer(&[gpu::AccelerationStructureInstance {
            acceleration_structure_index: 0,
            transform: gpu::IDENTITY_TRANSFORM,
            mask: 0xFF,
            custom_index: 0,
            hit_group_offset: 0,
        }])
        .unwrap();

    let pipeline = context.create_ray_tracing_pipeline(gpu::RayTracingPipelineDesc {
        name: "depth",
        ray_generation: &[("main", Arc::new(DepthRayGen) as Arc<dyn gpu::RayGenProgram>)],
        miss: &[("miss", Arc::new(Background) as Arc<dyn gpu::MissProgram>)],
        hit_groups: &[gpu::HitGroupDesc {
            name: "material",
            closest_hit: Some(Arc::new(MaterialHit)),
            intersection: None,
        }],
        max_recursion_depth: 1,
    });

    let stride = 64u64;
    let table = context
        .create_buffer(gpu::BufferDesc {
            name: "shader table",
            size: 3 * 64,
            memory: gpu::Memory::Upload,
        })
        .unwrap();
    let mut hit_record = pipeline.shader_identifier("material").unwrap().0.to_vec();
    hit_record.extend_from_slice(&7u32.to_le_bytes());
    context
        .write_buffer(table.at(0), &pipeline.shader_identifier("main").unwrap().0)
        .unwrap();
    context
        .write_buffer(table.at(64), &pipeline.shader_identifier("miss").unwrap().0)
        .unwrap();
    context.write_buffer(table.at(128), &hit_record).unwrap();

    let size = gpu::Extent::new_2d(4, 4);
    let output = texture(&context, "output", size);
    let output_view = context
        .create_texture_view(gpu::TextureViewDesc {
            name: "output",
            texture: output,
        })
        .unwrap();

    let mut encoder = context.create_command_encoder(gpu::CommandEncoderDesc {
        name: "rt",
        buffer_count: 1,
    });
    encoder.start();
    encoder.init_texture(output);
    {
        let mut pass = encoder.acceleration_structure("build");
        pass.build_bottom_level(blas, &[geometry], scratch.into());
        pass.build_top_level(tlas, &[blas], 1, instances.into(), scratch.into());
    }
    {
        let mut pass = encoder.ray_tracing("trace");
        let mut pc = pass.with(&pipeline);
        pc.bind(gpu::RayTracingBindings {
            acceleration_structure: tlas,
            outputs: vec![output_view],
            ..Default::default()
        });
        let region = |offset| gpu::ShaderTableRegion {
            start: table.at(offset),
            size: stride,
            stride,
        };
        pc.dispatch_rays(gpu::DispatchRaysDesc {
            ray_generation: region(0),
            miss: region(64),
            hit_group: region(128),
            size,
        });
    }
    context.submit(&mut encoder).unwrap();
    assert!(context.is_acceleration_structure_built(tlas));

    let image = context.read_texture(output).unwrap();
    // the center of the image is covered by the triangle
    let center = image.load(2, 2);
    assert!((center[0] - 5.0).abs() < 1e-4);
    assert_eq!(center[1], 7.0);
    // the corner is outside of it
    assert_eq!(image.load(0, 3)[0], -1.0);

    // refitting a structure built without ALLOW_UPDATE is rejected
    encoder.start();
    encoder
        .acceleration_structure("refit")
        .update_bottom_level(blas, &[geometry], scratch.into());
    assert_eq!(
        context.submit(&mut encoder),
        Err(gpu::DeviceError::InvalidUpdate("blas".to_string()))
    );
}

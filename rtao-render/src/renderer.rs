use crate::{
    accel::{AccelerationStructureManager, BuildReport, RebuildPolicy},
    compose::{ComposeConfig, ComposeMode, Compositor},
    denoise::{Denoiser, DenoiserConfig},
    diagnostics::{Diagnostics, DEFAULT_TIMER_WINDOW},
    raytrace::{DispatchInputs, RayConfig, RayTracer, SceneConstants},
    resources::{Resolution, ResourcePool},
    samples::SampleSet,
    scene::{GeometryInstance, SceneDescription, SceneGeometry},
    Camera, ConfigurationError, FrameResources, RenderError,
};
use rtao_graphics as gpu;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RenderConfig {
    pub ray: RayConfig,
    pub denoiser: DenoiserConfig,
    pub compose: ComposeConfig,
    pub rebuild_policy: RebuildPolicy,
    /// Number of frames the stage timers average over.
    pub timer_window: usize,
}

impl RenderConfig {
    /// Reject counts the stages can't work with.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.ray.samples_per_pixel == 0 {
            return Err(ConfigurationError::ZeroCount("samples per pixel"));
        }
        if self.ray.sample_set_count == 0 {
            return Err(ConfigurationError::ZeroCount("sample set count"));
        }
        if self.timer_window == 0 {
            return Err(ConfigurationError::ZeroCount("timer window"));
        }
        Ok(())
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            ray: RayConfig::default(),
            denoiser: DenoiserConfig::default(),
            compose: ComposeConfig::default(),
            rebuild_policy: RebuildPolicy::default(),
            timer_window: DEFAULT_TIMER_WINDOW,
        }
    }
}

/// Ray traced ambient occlusion renderer.
///
/// It takes care of the acceleration structures, shader tables,
/// render targets, the denoising chain and the final composition.
///
/// It doesn't:
///   - manage or submit any command encoders
///   - know about the window to display on
///   - load scenes
pub struct Renderer {
    config: RenderConfig,
    pool: ResourcePool,
    accel: AccelerationStructureManager,
    ray_tracer: RayTracer,
    denoiser: Denoiser,
    compositor: Compositor,
    diagnostics: Diagnostics,
    geometry: Option<SceneGeometry>,
    samples: Option<SampleSet>,
    force_rebuild: bool,
    frame_index: u32,
    last_report: Option<BuildReport>,
}

impl Renderer {
    /// Create a renderer without a scene or window resources.
    #[profiling::function]
    pub fn new(gpu: &gpu::Context, config: RenderConfig) -> Result<Self, RenderError> {
        config.validate()?;
        let denoiser = Denoiser::new(gpu, config.denoiser)?;
        let pool = ResourcePool::new(gpu)?;
        Ok(Self {
            config,
            pool,
            accel: AccelerationStructureManager::new(config.rebuild_policy),
            ray_tracer: RayTracer::new(gpu),
            denoiser,
            compositor: Compositor::new(gpu, config.compose),
            diagnostics: Diagnostics::new(gpu, config.timer_window),
            geometry: None,
            samples: None,
            force_rebuild: false,
            frame_index: 0,
            last_report: None,
        })
    }

    /// Release everything. The device must be idle.
    pub fn destroy(&mut self, gpu: &gpu::Context) {
        self.accel.destroy(gpu);
        self.ray_tracer.destroy(gpu);
        self.denoiser.destroy(gpu);
        self.compositor.destroy(gpu);
        self.diagnostics.destroy(gpu);
        if let Some(mut geometry) = self.geometry.take() {
            geometry.destroy(gpu);
        }
        self.pool.destroy(gpu);
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    pub fn pool(&self) -> &ResourcePool {
        &self.pool
    }

    pub fn acceleration_structures(&self) -> &AccelerationStructureManager {
        &self.accel
    }

    pub fn ray_tracer(&self) -> &RayTracer {
        &self.ray_tracer
    }

    pub fn denoiser(&self) -> &Denoiser {
        &self.denoiser
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn geometry(&self) -> Option<&SceneGeometry> {
        self.geometry.as_ref()
    }

    pub fn samples(&self) -> Option<&SampleSet> {
        self.samples.as_ref()
    }

    pub fn frame_index(&self) -> u32 {
        self.frame_index
    }

    /// Outcome of the acceleration structure update of the last frame.
    pub fn last_build_report(&self) -> Option<&BuildReport> {
        self.last_report.as_ref()
    }

    pub fn set_compose_mode(&mut self, mode: ComposeMode) {
        self.compositor.set_mode(mode);
    }

    pub fn set_rebuild_policy(&mut self, policy: RebuildPolicy) {
        self.config.rebuild_policy = policy;
        self.accel.set_policy(policy);
    }

    /// Rebuild every bottom level structure with the next frame.
    pub fn force_rebuild(&mut self) {
        self.force_rebuild = true;
    }

    /// Upload the geometry and materials of a scene, replacing the previous one.
    ///
    /// The old geometry is destroyed right away, so the device must be idle.
    /// Acceleration structures need to be initialized again afterwards.
    #[profiling::function]
    pub fn load_geometry(&mut self, gpu: &gpu::Context, desc: &SceneDescription) -> Result<(), RenderError> {
        let geometry = SceneGeometry::upload(gpu, desc)?;
        self.accel.destroy(gpu);
        if let Some(mut old) = self.geometry.replace(geometry) {
            old.destroy(gpu);
        }
        self.accel.update_instance_transforms(&desc.instances);
        Ok(())
    }

    /// Build the bottom level structures of the loaded geometry,
    /// and the shader tables matching its geometry types.
    #[profiling::function]
    pub fn initialize_structures(
        &mut self,
        gpu: &gpu::Context,
        encoder: &mut gpu::CommandEncoder,
        temp: &mut FrameResources,
    ) -> Result<(), RenderError> {
        let geometry = self.geometry.as_ref().ok_or(ConfigurationError::NoScene)?;
        self.accel.initialize_structures(gpu, encoder, temp, geometry)?;
        self.ray_tracer.build_shader_tables(
            gpu,
            temp,
            self.accel.geometry_type_mask(),
            geometry.environment,
        )?;
        Ok(())
    }

    pub fn update_instances(&mut self, instances: &[GeometryInstance]) {
        self.accel.update_instance_transforms(instances);
    }

    /// Point the sun at `direction`, effective from the next frame.
    /// Ignored until a scene is loaded.
    pub fn set_light_direction(&mut self, direction: glam::Vec3) {
        if let Some(ref mut geometry) = self.geometry {
            geometry.light_direction = direction.normalize_or_zero();
        }
    }

    /// Move the instances of one geometry group, in instance table order.
    pub fn set_group_transforms(&mut self, blas: usize, transforms: &[gpu::Transform]) {
        self.accel.set_group_transforms(blas, transforms);
    }

    /// Trace only the first `count` primitives of a geometry group.
    pub fn set_primitive_count(&mut self, group: usize, count: u32) -> Result<(), RenderError> {
        self.accel.set_primitive_count(group, count)?;
        Ok(())
    }

    /// Recreate the render targets for a new raytracing resolution.
    #[profiling::function]
    pub fn recreate_raytracing_resources(
        &mut self,
        gpu: &gpu::Context,
        encoder: &mut gpu::CommandEncoder,
        size: gpu::Extent,
    ) -> Result<(), RenderError> {
        self.pool.recreate_window_size_dependent(
            gpu,
            encoder,
            size,
            self.config.denoiser.supersampling_scale,
        )?;
        self.denoiser.validate(&self.pool)?;
        Ok(())
    }

    /// Generate a new sample set from the ray configuration and upload it.
    #[profiling::function]
    pub fn recreate_samples(&mut self, gpu: &gpu::Context, temp: &mut FrameResources) -> Result<(), RenderError> {
        let ray = self.config.ray;
        let samples = SampleSet::generate(ray.samples_per_pixel, ray.sample_set_count, ray.seed);
        self.pool.upload_samples(gpu, &samples, temp)?;
        self.samples = Some(samples);
        Ok(())
    }

    fn upload_constants(
        &self,
        gpu: &gpu::Context,
        encoder: &mut gpu::CommandEncoder,
        temp: &mut FrameResources,
        camera: &Camera,
        light_direction: glam::Vec3,
    ) -> Result<(), RenderError> {
        let constants = SceneConstants::new(
            camera,
            self.pool.extent(Resolution::Raytracing),
            light_direction,
            &self.config.ray,
            self.frame_index,
        );
        let size = std::mem::size_of::<SceneConstants>() as u64;
        let staging = gpu.create_buffer(gpu::BufferDesc {
            name: "scene constants staging",
            size,
            memory: gpu::Memory::Upload,
        })?;
        temp.buffers.push(staging);
        gpu.write_buffer_pod(staging.into(), &[constants])?;
        if let mut pass = encoder.transfer("scene-constants") {
            pass.copy_buffer_to_buffer(staging.into(), self.pool.scene_constants().into(), size);
        }
        Ok(())
    }

    /// Record a whole frame: acceleration structure update, ray dispatches,
    /// denoising, and the composition into `target`.
    ///
    /// Passes recorded before an error are complete and can still be submitted,
    /// nothing is recorded past the failing stage.
    #[profiling::function]
    pub fn render(
        &mut self,
        gpu: &gpu::Context,
        encoder: &mut gpu::CommandEncoder,
        temp: &mut FrameResources,
        camera: &Camera,
        target: gpu::Texture,
    ) -> Result<(), RenderError> {
        let (light_direction, materials) = match self.geometry {
            Some(ref geometry) => (geometry.light_direction, geometry.material_buffer),
            None => return Err(ConfigurationError::NoScene.into()),
        };
        if !self.pool.has_window_resources() {
            return Err(ConfigurationError::MissingRenderTargets.into());
        }
        let hemisphere_samples = self.pool.hemisphere_samples().map(|hemisphere| hemisphere.into());

        let report = self
            .accel
            .rebuild_or_refit(gpu, encoder, temp, self.force_rebuild)?;
        self.force_rebuild = false;
        self.last_report = Some(report);

        self.upload_constants(gpu, encoder, temp, camera, light_direction)?;
        let inputs = DispatchInputs {
            acceleration_structure: self.accel.top_level(),
            constants: self.pool.scene_constants().into(),
            materials: materials.into(),
            hemisphere_samples,
            geometry_mask: self.accel.geometry_type_mask(),
        };
        self.ray_tracer.generate_gbuffer(encoder, &self.pool, &inputs)?;
        self.ray_tracer.calculate_visibility(encoder, &self.pool, &inputs)?;
        self.ray_tracer
            .calculate_ambient_occlusion(encoder, &self.pool, &inputs)?;

        self.denoiser.denoise(encoder, &self.pool)?;
        self.compositor.compose(
            gpu,
            encoder,
            &self.pool,
            target,
            light_direction,
            self.config.denoiser.supersampling_scale,
            self.denoiser.output_layer(),
        )?;
        self.diagnostics.count_hits(encoder, &self.pool);
        self.frame_index = self.frame_index.wrapping_add(1);
        Ok(())
    }

    /// Collect the diagnostics of a submitted frame.
    pub fn finish_frame(&mut self, gpu: &gpu::Context, sync_point: &gpu::SyncPoint, timings: &gpu::Timings) {
        self.diagnostics.sample(
            gpu,
            &self.pool,
            sync_point,
            timings,
            self.config.ray.samples_per_pixel,
        );
        self.diagnostics.set_acceleration_structure_stats(
            self.accel.memory_footprint(),
            self.accel.frames_since_build(),
        );
    }
}

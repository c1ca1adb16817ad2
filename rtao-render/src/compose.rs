use crate::{
    resources::{AoResource, GBufferResource, Resolution, ResourcePool},
    ConfigurationError, RenderError,
};
use rtao_graphics as gpu;

/// What ends up in the presentation target.
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq, strum::EnumIter)]
pub enum ComposeMode {
    /// Albedo lit by the ambient term scaled by the occlusion, plus a directional light.
    #[default]
    Shaded,
    /// Denoised occlusion at raytracing resolution.
    AmbientOcclusion,
    /// Occlusion straight out of the ray dispatch.
    RawAmbientOcclusion,
    Variance,
    Normals,
    Depth,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ComposeConfig {
    pub mode: ComposeMode,
    pub ambient_intensity: f32,
    pub light_intensity: f32,
    /// Distance mapped to black in the depth view.
    pub max_depth: f32,
}

impl Default for ComposeConfig {
    fn default() -> Self {
        Self {
            mode: ComposeMode::default(),
            ambient_intensity: 0.6,
            light_intensity: 0.8,
            max_depth: 50.0,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct ComposeParams {
    config: ComposeConfig,
    light_direction: glam::Vec3,
    supersampling_scale: u32,
}

struct ComposeData {
    params: ComposeParams,
    position: gpu::TextureView,
    normal_depth: gpu::TextureView,
    albedo: gpu::TextureView,
    ambient_occlusion: gpu::TextureView,
    raw_ambient_occlusion: gpu::TextureView,
    visibility: gpu::TextureView,
    variance: gpu::TextureView,
    output: gpu::TextureView,
}

impl gpu::ComputeKernel for ComposeData {
    fn outputs(&self) -> Vec<gpu::KernelOutput> {
        vec![gpu::KernelOutput::Texture(self.output)]
    }
    fn execute(
        &self,
        resources: &gpu::Resources,
        outputs: &mut gpu::KernelOutputs,
        grid: gpu::Extent,
    ) -> Result<(), gpu::DeviceError> {
        let position = resources.texture(self.position)?;
        let normal_depth = resources.texture(self.normal_depth)?;
        let albedo = resources.texture(self.albedo)?;
        let ao = resources.texture(self.ambient_occlusion)?;
        let raw_ao = resources.texture(self.raw_ambient_occlusion)?;
        let visibility = resources.texture(self.visibility)?;
        let variance = resources.texture(self.variance)?;
        let p = self.params;
        let c = p.config;
        outputs.texture(0).par_fill(grid, |x, y| {
            let color = albedo.load(x, y);
            if position.load(x, y)[3] == 0.0 {
                // albedo holds the environment radiance on a miss
                return match c.mode {
                    ComposeMode::Shaded => [color[0], color[1], color[2], 1.0],
                    _ => [0.0, 0.0, 0.0, 1.0],
                };
            }
            let nd = normal_depth.load(x, y);
            let normal = glam::Vec3::new(nd[0], nd[1], nd[2]);
            let grey = |v: f32| [v, v, v, 1.0];
            match c.mode {
                ComposeMode::Shaded => {
                    let occlusion = ao.load(x, y)[0];
                    let lit = visibility.load(x, y)[0] * normal.dot(p.light_direction).max(0.0);
                    let light = c.ambient_intensity * occlusion + c.light_intensity * lit;
                    [color[0] * light, color[1] * light, color[2] * light, 1.0]
                }
                ComposeMode::AmbientOcclusion => grey(ao.load(x, y)[0]),
                ComposeMode::RawAmbientOcclusion => grey(raw_ao.load(x, y)[0]),
                ComposeMode::Variance => {
                    let s = p.supersampling_scale;
                    grey(2.0 * variance.load_clamped((x / s) as i32, (y / s) as i32)[0].sqrt())
                }
                ComposeMode::Normals => {
                    let n = normal * 0.5 + 0.5;
                    [n.x, n.y, n.z, 1.0]
                }
                ComposeMode::Depth => grey(1.0 - nd[3] / c.max_depth),
            }
        });
        Ok(())
    }
}

pub struct Compositor {
    pipeline: gpu::ComputePipeline,
    config: ComposeConfig,
}

impl Compositor {
    pub fn new(gpu: &gpu::Context, config: ComposeConfig) -> Self {
        Self {
            pipeline: gpu.create_compute_pipeline(gpu::ComputePipelineDesc {
                name: "compose",
                workgroup_size: [8, 8, 1],
            }),
            config,
        }
    }

    pub fn destroy(&mut self, gpu: &gpu::Context) {
        gpu.destroy_compute_pipeline(&mut self.pipeline);
    }

    pub fn config(&self) -> &ComposeConfig {
        &self.config
    }

    pub fn set_mode(&mut self, mode: ComposeMode) {
        self.config.mode = mode;
    }

    /// Combine the stage outputs into the composed texture and copy it into `target`.
    ///
    /// `target` ends up in the `Present` state. The composed texture is back
    /// in `Common` afterwards, ready for the next frame.
    #[profiling::function]
    pub fn compose(
        &self,
        gpu: &gpu::Context,
        encoder: &mut gpu::CommandEncoder,
        pool: &ResourcePool,
        target: gpu::Texture,
        light_direction: glam::Vec3,
        supersampling_scale: u32,
        variance_layer: usize,
    ) -> Result<(), RenderError> {
        let composed = pool.composed();
        let target_size = gpu.texture_extent(target)?;
        if target_size != composed.size() {
            return Err(ConfigurationError::ResolutionMismatch {
                stage: "compose",
                expected: target_size,
                produced: composed.size(),
            }
            .into());
        }
        let gbuf = |resource| pool.gbuffer(Resolution::Raytracing, resource).view(0);

        if let mut pass = encoder.compute("compose") {
            let mut pc = pass.with(&self.pipeline);
            pc.bind(ComposeData {
                params: ComposeParams {
                    config: self.config,
                    light_direction,
                    supersampling_scale,
                },
                position: gbuf(GBufferResource::Position),
                normal_depth: gbuf(GBufferResource::NormalDepth),
                albedo: gbuf(GBufferResource::Albedo),
                ambient_occlusion: pool.ao(AoResource::Upsampled).view(0),
                raw_ambient_occlusion: pool.ao(AoResource::Coefficient).view(0),
                visibility: pool.ao(AoResource::Visibility).view(0),
                variance: pool.ao(AoResource::Variance).view(variance_layer),
                output: composed.view(0),
            });
            pc.dispatch(self.pipeline.get_dispatch_for(composed.size()));
        }

        encoder.transition(composed.texture(0), gpu::TextureState::CopySource);
        encoder.transition(target, gpu::TextureState::CopyDestination);
        if let mut pass = encoder.transfer("present") {
            pass.copy_texture_to_texture(composed.texture(0), target);
        }
        encoder.transition(target, gpu::TextureState::Present);
        encoder.transition(composed.texture(0), gpu::TextureState::Common);
        Ok(())
    }
}

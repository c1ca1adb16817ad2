//! Denoising chain of the raw occlusion signal.
//!
//! Order of the passes, all on the compute queue:
//!   1. downsample the G-buffer and the raw coefficient to low resolution
//!   2. estimate the local variance of the coefficient, then smooth it
//!   3. run the edge-aware a-trous wavelet filter, ping-ponging `Filtered`
//!      and `Variance` layers
//!   4. upsample the last filtered layer back to raytracing resolution
//!
//! With a supersampling scale of 1 the resampling passes are plain copies.

use crate::{
    resources::{AoResource, GBufferResource, Resolution, ResourcePool},
    ConfigurationError,
};
use rayon::prelude::*;
use rtao_graphics as gpu;

/// Depth difference accepted without penalty, relative to the depth.
const DEPTH_EPSILON: f32 = 1e-3;
const WEIGHT_EPSILON: f32 = 1e-6;

#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq, strum::EnumIter)]
pub enum DownsampleFilter {
    #[default]
    BoxFilter2x2,
    Gaussian9Tap,
    Gaussian25Tap,
    /// Depth-aware average around the most representative texel.
    Bilateral,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DenoiserConfig {
    /// Ratio between the raytracing and the low resolution.
    pub supersampling_scale: u32,
    pub downsample_filter: DownsampleFilter,
    /// Radius of the window for the variance estimation.
    pub variance_radius: u32,
    pub atrous_iterations: u32,
    /// Exponent of the normal similarity.
    pub normal_sigma: f32,
    pub depth_sigma: f32,
    /// Scale of the luminance tolerance relative to the local deviation.
    pub value_sigma: f32,
}

impl Default for DenoiserConfig {
    fn default() -> Self {
        Self {
            supersampling_scale: 2,
            downsample_filter: DownsampleFilter::default(),
            variance_radius: 2,
            atrous_iterations: 3,
            normal_sigma: 64.0,
            depth_sigma: 1.0,
            value_sigma: 4.0,
        }
    }
}

fn is_hit(position: [f32; 4]) -> bool {
    position[3] != 0.0
}

fn depth_of(normal_depth: [f32; 4]) -> f32 {
    normal_depth[3]
}

fn normal_of(normal_depth: [f32; 4]) -> glam::Vec3 {
    glam::Vec3::new(normal_depth[0], normal_depth[1], normal_depth[2])
}

fn block_origin(x: u32, y: u32, scale: u32) -> [i32; 2] {
    [(x * scale) as i32, (y * scale) as i32]
}

/// Texel of the `scale * scale` block whose depth is closest to the mean hit depth.
fn representative(
    position: &gpu::TexelImage,
    normal_depth: &gpu::TexelImage,
    x: u32,
    y: u32,
    scale: u32,
) -> [i32; 2] {
    let [ox, oy] = block_origin(x, y, scale);
    let mut sum = 0.0;
    let mut count = 0;
    for j in 0..scale as i32 {
        for i in 0..scale as i32 {
            if is_hit(position.load_clamped(ox + i, oy + j)) {
                sum += depth_of(normal_depth.load_clamped(ox + i, oy + j));
                count += 1;
            }
        }
    }
    if count == 0 {
        return [ox, oy];
    }
    let mean = sum / count as f32;
    let mut best = ([ox, oy], f32::INFINITY);
    for j in 0..scale as i32 {
        for i in 0..scale as i32 {
            if !is_hit(position.load_clamped(ox + i, oy + j)) {
                continue;
            }
            let distance = (depth_of(normal_depth.load_clamped(ox + i, oy + j)) - mean).abs();
            if distance < best.1 {
                best = ([ox + i, oy + j], distance);
            }
        }
    }
    best.0
}

struct CopyKernel {
    input: gpu::TextureView,
    output: gpu::TextureView,
}

impl gpu::ComputeKernel for CopyKernel {
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
        outputs
            .texture(0)
            .par_fill(grid, |x, y| input.load_clamped(x as i32, y as i32));
        Ok(())
    }
}

/// Pick one representative texel per block for every G-buffer target,
/// so the low resolution attributes stay consistent with each other.
struct DownsampleGBuffer {
    scale: u32,
    inputs: [gpu::TextureView; 4],
    outputs: [gpu::TextureView; 4],
}

impl gpu::ComputeKernel for DownsampleGBuffer {
    fn outputs(&self) -> Vec<gpu::KernelOutput> {
        self.outputs.iter().map(|&v| gpu::KernelOutput::Texture(v)).collect()
    }
    fn execute(
        &self,
        resources: &gpu::Resources,
        outputs: &mut gpu::KernelOutputs,
        grid: gpu::Extent,
    ) -> Result<(), gpu::DeviceError> {
        let inputs = [
            resources.texture(self.inputs[0])?,
            resources.texture(self.inputs[1])?,
            resources.texture(self.inputs[2])?,
            resources.texture(self.inputs[3])?,
        ];
        let (position, normal_depth) = (inputs[0], inputs[1]);
        let extent = outputs.texture(0).extent();
        let width = extent.width.min(grid.width);
        let mut picks = Vec::with_capacity((width * extent.height.min(grid.height)) as usize);
        for y in 0..extent.height.min(grid.height) {
            for x in 0..width {
                picks.push(representative(position, normal_depth, x, y, self.scale));
            }
        }
        for (k, input) in inputs.iter().enumerate() {
            outputs.texture(k).par_fill(grid, |x, y| {
                let [px, py] = picks[(y * width + x) as usize];
                input.load_clamped(px, py)
            });
        }
        Ok(())
    }
}

struct Downsample {
    filter: DownsampleFilter,
    scale: u32,
    input: gpu::TextureView,
    position: gpu::TextureView,
    normal_depth: gpu::TextureView,
    output: gpu::TextureView,
}

const GAUSSIAN_3: [f32; 3] = [1.0, 2.0, 1.0];
const GAUSSIAN_5: [f32; 5] = [1.0, 4.0, 6.0, 4.0, 1.0];

fn separable(input: &gpu::TexelImage, center: [i32; 2], taps: &[f32]) -> f32 {
    let half = taps.len() as i32 / 2;
    let mut sum = 0.0;
    let mut total = 0.0;
    for (j, wy) in taps.iter().enumerate() {
        for (i, wx) in taps.iter().enumerate() {
            let w = wx * wy;
            sum += w * input.load_clamped(center[0] + i as i32 - half, center[1] + j as i32 - half)[0];
            total += w;
        }
    }
    sum / total
}

impl gpu::ComputeKernel for Downsample {
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
        let position = resources.texture(self.position)?;
        let normal_depth = resources.texture(self.normal_depth)?;
        let scale = self.scale;
        let filter = self.filter;
        outputs.texture(0).par_fill(grid, |x, y| {
            let [ox, oy] = block_origin(x, y, scale);
            let center = [ox + scale as i32 / 2, oy + scale as i32 / 2];
            let value = match filter {
                DownsampleFilter::BoxFilter2x2 => {
                    let mut sum = 0.0;
                    for j in 0..scale as i32 {
                        for i in 0..scale as i32 {
                            sum += input.load_clamped(ox + i, oy + j)[0];
                        }
                    }
                    sum / (scale * scale) as f32
                }
                DownsampleFilter::Gaussian9Tap => separable(input, center, &GAUSSIAN_3),
                DownsampleFilter::Gaussian25Tap => separable(input, center, &GAUSSIAN_5),
                DownsampleFilter::Bilateral => {
                    let [rx, ry] = representative(position, normal_depth, x, y, scale);
                    let reference = normal_depth.load_clamped(rx, ry);
                    if !is_hit(position.load_clamped(rx, ry)) {
                        input.load_clamped(rx, ry)[0]
                    } else {
                        let mut sum = 0.0;
                        let mut total = 0.0;
                        for j in 0..scale as i32 {
                            for i in 0..scale as i32 {
                                if !is_hit(position.load_clamped(ox + i, oy + j)) {
                                    continue;
                                }
                                let nd = normal_depth.load_clamped(ox + i, oy + j);
                                let dz = (depth_of(nd) - depth_of(reference)).abs();
                                let w = 1.0 / (dz / (DEPTH_EPSILON * depth_of(reference).max(1.0)) + 1.0);
                                sum += w * input.load_clamped(ox + i, oy + j)[0];
                                total += w;
                            }
                        }
                        sum / total
                    }
                }
            };
            [value, 0.0, 0.0, 0.0]
        });
        Ok(())
    }
}

/// Local variance of the coefficient over the hit texels of a square window.
struct CalculateVariance {
    radius: u32,
    input: gpu::TextureView,
    position: gpu::TextureView,
    output: gpu::TextureView,
}

impl gpu::ComputeKernel for CalculateVariance {
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
        let position = resources.texture(self.position)?;
        let extent = input.extent();
        let r = self.radius as i32;
        outputs.texture(0).par_fill(grid, |x, y| {
            if !is_hit(position.load(x, y)) {
                return [0.0; 4];
            }
            let mut sum = 0.0;
            let mut sum_sq = 0.0;
            let mut count = 0;
            for j in -r..=r {
                for i in -r..=r {
                    let (sx, sy) = (x as i32 + i, y as i32 + j);
                    if sx < 0 || sy < 0 || sx >= extent.width as i32 || sy >= extent.height as i32 {
                        continue;
                    }
                    if !is_hit(position.load(sx as u32, sy as u32)) {
                        continue;
                    }
                    let v = input.load(sx as u32, sy as u32)[0];
                    sum += v;
                    sum_sq += v * v;
                    count += 1;
                }
            }
            let mean = sum / count as f32;
            let variance = (sum_sq / count as f32 - mean * mean).max(0.0);
            [variance, 0.0, 0.0, 0.0]
        });
        Ok(())
    }
}

struct GaussianSmoothing {
    input: gpu::TextureView,
    output: gpu::TextureView,
}

impl gpu::ComputeKernel for GaussianSmoothing {
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
        outputs
            .texture(0)
            .par_fill(grid, |x, y| [separable(input, [x as i32, y as i32], &GAUSSIAN_3), 0.0, 0.0, 0.0]);
        Ok(())
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq)]
struct AtrousParams {
    iteration: u32,
    normal_sigma: f32,
    depth_sigma: f32,
    value_sigma: f32,
}

/// One iteration of the edge-aware a-trous wavelet filter.
struct Atrous {
    params: AtrousParams,
    input: gpu::TextureView,
    variance: gpu::TextureView,
    position: gpu::TextureView,
    normal_depth: gpu::TextureView,
    output: gpu::TextureView,
    output_variance: gpu::TextureView,
}

const B3_SPLINE: [f32; 5] = [1.0 / 16.0, 1.0 / 4.0, 3.0 / 8.0, 1.0 / 4.0, 1.0 / 16.0];

impl Atrous {
    /// Filtered value and variance of one texel.
    fn filter_texel(
        &self,
        input: &gpu::TexelImage,
        variance: &gpu::TexelImage,
        position: &gpu::TexelImage,
        normal_depth: &gpu::TexelImage,
        x: u32,
        y: u32,
    ) -> (f32, f32) {
        let center_value = input.load(x, y)[0];
        let center_variance = variance.load(x, y)[0];
        if !is_hit(position.load(x, y)) {
            return (center_value, center_variance);
        }
        let p = &self.params;
        let step = 1i32 << p.iteration;
        let center_nd = normal_depth.load(x, y);
        let value_tolerance = p.value_sigma * center_variance.sqrt() + WEIGHT_EPSILON;
        let extent = input.extent();

        let mut sum = 0.0;
        let mut sum_variance = 0.0;
        let mut total = 0.0;
        for (j, hy) in B3_SPLINE.iter().enumerate() {
            for (i, hx) in B3_SPLINE.iter().enumerate() {
                let sx = x as i32 + (i as i32 - 2) * step;
                let sy = y as i32 + (j as i32 - 2) * step;
                if sx < 0 || sy < 0 || sx >= extent.width as i32 || sy >= extent.height as i32 {
                    continue;
                }
                let (sx, sy) = (sx as u32, sy as u32);
                if !is_hit(position.load(sx, sy)) {
                    continue;
                }
                let nd = normal_depth.load(sx, sy);
                let value = input.load(sx, sy)[0];
                let w_normal = normal_of(center_nd)
                    .dot(normal_of(nd))
                    .max(0.0)
                    .powf(p.normal_sigma);
                let depth_tolerance =
                    p.depth_sigma * step as f32 * DEPTH_EPSILON * depth_of(center_nd).max(1.0) + WEIGHT_EPSILON;
                let w_depth = (-(depth_of(nd) - depth_of(center_nd)).abs() / depth_tolerance).exp();
                let w_value = (-(value - center_value).abs() / value_tolerance).exp();
                let w = hx * hy * w_normal * w_depth * w_value;
                sum += w * value;
                sum_variance += w * w * variance.load(sx, sy)[0];
                total += w;
            }
        }
        if total <= WEIGHT_EPSILON {
            return (center_value, center_variance);
        }
        (sum / total, sum_variance / (total * total))
    }
}

impl gpu::ComputeKernel for Atrous {
    fn outputs(&self) -> Vec<gpu::KernelOutput> {
        vec![
            gpu::KernelOutput::Texture(self.output),
            gpu::KernelOutput::Texture(self.output_variance),
        ]
    }
    fn execute(
        &self,
        resources: &gpu::Resources,
        outputs: &mut gpu::KernelOutputs,
        grid: gpu::Extent,
    ) -> Result<(), gpu::DeviceError> {
        let input = resources.texture(self.input)?;
        let variance = resources.texture(self.variance)?;
        let position = resources.texture(self.position)?;
        let normal_depth = resources.texture(self.normal_depth)?;
        let extent = input.extent();
        let width = extent.width.min(grid.width);
        let height = extent.height.min(grid.height);
        let results = (0..width * height)
            .into_par_iter()
            .map(|i| self.filter_texel(input, variance, position, normal_depth, i % width, i / width))
            .collect::<Vec<_>>();
        outputs
            .texture(0)
            .par_fill(grid, |x, y| [results[(y * width + x) as usize].0, 0.0, 0.0, 0.0]);
        outputs
            .texture(1)
            .par_fill(grid, |x, y| [results[(y * width + x) as usize].1, 0.0, 0.0, 0.0]);
        Ok(())
    }
}

/// Bilateral upsampling guided by the raytracing resolution depth and normals.
struct UpsampleBilateral {
    scale: u32,
    input: gpu::TextureView,
    low_position: gpu::TextureView,
    low_normal_depth: gpu::TextureView,
    position: gpu::TextureView,
    normal_depth: gpu::TextureView,
    output: gpu::TextureView,
}

impl gpu::ComputeKernel for UpsampleBilateral {
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
        let low_position = resources.texture(self.low_position)?;
        let low_normal_depth = resources.texture(self.low_normal_depth)?;
        let position = resources.texture(self.position)?;
        let normal_depth = resources.texture(self.normal_depth)?;
        let scale = self.scale as f32;
        outputs.texture(0).par_fill(grid, |x, y| {
            if !is_hit(position.load(x, y)) {
                return [1.0, 0.0, 0.0, 0.0];
            }
            let reference = normal_depth.load(x, y);
            // low resolution texel centers around this one
            let fx = (x as f32 + 0.5) / scale - 0.5;
            let fy = (y as f32 + 0.5) / scale - 0.5;
            let (bx, by) = (fx.floor() as i32, fy.floor() as i32);
            let (tx, ty) = (fx - fx.floor(), fy - fy.floor());
            let mut sum = 0.0;
            let mut total = 0.0;
            let mut nearest = (f32::INFINITY, 1.0);
            for (j, wy) in [(0, 1.0 - ty), (1, ty)] {
                for (i, wx) in [(0, 1.0 - tx), (1, tx)] {
                    let (sx, sy) = (bx + i, by + j);
                    if !is_hit(low_position.load_clamped(sx, sy)) {
                        continue;
                    }
                    let nd = low_normal_depth.load_clamped(sx, sy);
                    let value = input.load_clamped(sx, sy)[0];
                    let dz = (depth_of(nd) - depth_of(reference)).abs();
                    if dz < nearest.0 {
                        nearest = (dz, value);
                    }
                    let w_depth = 1.0 / (dz / (DEPTH_EPSILON * depth_of(reference).max(1.0)) + 1.0);
                    let w_normal = normal_of(nd).dot(normal_of(reference)).max(0.0).powi(8);
                    let w = wx * wy * w_depth * w_normal;
                    sum += w * value;
                    total += w;
                }
            }
            let value = if total > WEIGHT_EPSILON {
                sum / total
            } else {
                nearest.1
            };
            [value, 0.0, 0.0, 0.0]
        });
        Ok(())
    }
}

struct Pipelines {
    copy: gpu::ComputePipeline,
    downsample_gbuffer: gpu::ComputePipeline,
    downsample: gpu::ComputePipeline,
    variance: gpu::ComputePipeline,
    smoothing: gpu::ComputePipeline,
    atrous: gpu::ComputePipeline,
    upsample: gpu::ComputePipeline,
}

impl Pipelines {
    fn init(gpu: &gpu::Context) -> Self {
        let create = |name: &str| {
            gpu.create_compute_pipeline(gpu::ComputePipelineDesc {
                name,
                workgroup_size: [8, 8, 1],
            })
        };
        Self {
            copy: create("copy"),
            downsample_gbuffer: create("downsample-gbuffer"),
            downsample: create("downsample"),
            variance: create("calculate-variance"),
            smoothing: create("gaussian-smoothing"),
            atrous: create("atrous"),
            upsample: create("upsample-bilateral"),
        }
    }

    fn destroy(&mut self, gpu: &gpu::Context) {
        for pipeline in [
            &mut self.copy,
            &mut self.downsample_gbuffer,
            &mut self.downsample,
            &mut self.variance,
            &mut self.smoothing,
            &mut self.atrous,
            &mut self.upsample,
        ] {
            gpu.destroy_compute_pipeline(pipeline);
        }
    }
}

pub struct Denoiser {
    pipelines: Pipelines,
    config: DenoiserConfig,
    /// Layer of `Filtered` holding the result of the last run.
    output_layer: usize,
}

impl Denoiser {
    pub fn new(gpu: &gpu::Context, config: DenoiserConfig) -> Result<Self, ConfigurationError> {
        if config.supersampling_scale == 0 {
            return Err(ConfigurationError::InvalidScale);
        }
        Ok(Self {
            pipelines: Pipelines::init(gpu),
            config,
            output_layer: 0,
        })
    }

    pub fn destroy(&mut self, gpu: &gpu::Context) {
        self.pipelines.destroy(gpu);
    }

    pub fn config(&self) -> &DenoiserConfig {
        &self.config
    }

    /// Change the configuration. The caller recreates the window resources
    /// when the supersampling scale changes.
    pub fn set_config(&mut self, config: DenoiserConfig) -> Result<(), ConfigurationError> {
        if config.supersampling_scale == 0 {
            return Err(ConfigurationError::InvalidScale);
        }
        self.config = config;
        Ok(())
    }

    /// Layer of the filtered coefficient written by the last run.
    pub fn output_layer(&self) -> usize {
        self.output_layer
    }

    /// Check that every stage consumes what the previous one produces.
    pub fn validate(&self, pool: &ResourcePool) -> Result<(), ConfigurationError> {
        let full = pool.extent(Resolution::Raytracing);
        let low = full.downscaled(self.config.supersampling_scale);
        let check = |stage, expected: gpu::Extent, produced: gpu::Extent| {
            if expected == produced {
                Ok(())
            } else {
                log::error!("Stage '{}' produces {:?}, expected {:?}", stage, produced, expected);
                Err(ConfigurationError::ResolutionMismatch {
                    stage,
                    expected,
                    produced,
                })
            }
        };
        check("ray dispatch", full, pool.ao(AoResource::Coefficient).size())?;
        check("downsample", low, pool.ao(AoResource::Filtered).size())?;
        check(
            "downsample gbuffer",
            low,
            pool.gbuffer(Resolution::Low, GBufferResource::NormalDepth).size(),
        )?;
        check("calculate variance", low, pool.ao(AoResource::Variance).size())?;
        check("gaussian smoothing", low, pool.ao(AoResource::SmoothedVariance).size())?;
        check("upsample", full, pool.ao(AoResource::Upsampled).size())?;
        Ok(())
    }

    /// Record the whole chain, from the raw coefficient to `Upsampled`.
    #[profiling::function]
    pub fn denoise(
        &mut self,
        encoder: &mut gpu::CommandEncoder,
        pool: &ResourcePool,
    ) -> Result<(), ConfigurationError> {
        self.validate(pool)?;
        let config = self.config;
        let scale = config.supersampling_scale;
        let full = pool.extent(Resolution::Raytracing);
        let low = pool.extent(Resolution::Low);
        let gbuf = |resolution, resource| pool.gbuffer(resolution, resource).view(0);
        let filtered = pool.ao(AoResource::Filtered);
        let variance = pool.ao(AoResource::Variance);

        if let mut pass = encoder.compute("downsample") {
            if scale == 1 {
                let mut pc = pass.with(&self.pipelines.copy);
                for resource in [
                    GBufferResource::Position,
                    GBufferResource::NormalDepth,
                    GBufferResource::MaterialId,
                    GBufferResource::Albedo,
                ] {
                    pc.bind(CopyKernel {
                        input: gbuf(Resolution::Raytracing, resource),
                        output: gbuf(Resolution::Low, resource),
                    });
                    pc.dispatch(self.pipelines.copy.get_dispatch_for(low));
                }
                pc.bind(CopyKernel {
                    input: pool.ao(AoResource::Coefficient).view(0),
                    output: filtered.view(0),
                });
                pc.dispatch(self.pipelines.copy.get_dispatch_for(low));
            } else {
                let inputs = [
                    gbuf(Resolution::Raytracing, GBufferResource::Position),
                    gbuf(Resolution::Raytracing, GBufferResource::NormalDepth),
                    gbuf(Resolution::Raytracing, GBufferResource::MaterialId),
                    gbuf(Resolution::Raytracing, GBufferResource::Albedo),
                ];
                let outputs = [
                    gbuf(Resolution::Low, GBufferResource::Position),
                    gbuf(Resolution::Low, GBufferResource::NormalDepth),
                    gbuf(Resolution::Low, GBufferResource::MaterialId),
                    gbuf(Resolution::Low, GBufferResource::Albedo),
                ];
                let mut pc = pass.with(&self.pipelines.downsample_gbuffer);
                pc.bind(DownsampleGBuffer {
                    scale,
                    inputs,
                    outputs,
                });
                pc.dispatch(self.pipelines.downsample_gbuffer.get_dispatch_for(low));

                let mut pc = pass.with(&self.pipelines.downsample);
                pc.bind(Downsample {
                    filter: config.downsample_filter,
                    scale,
                    input: pool.ao(AoResource::Coefficient).view(0),
                    position: inputs[0],
                    normal_depth: inputs[1],
                    output: filtered.view(0),
                });
                pc.dispatch(self.pipelines.downsample.get_dispatch_for(low));
            }
        }

        if let mut pass = encoder.compute("variance") {
            let mut pc = pass.with(&self.pipelines.variance);
            pc.bind(CalculateVariance {
                radius: config.variance_radius,
                input: filtered.view(0),
                position: gbuf(Resolution::Low, GBufferResource::Position),
                output: variance.view(0),
            });
            pc.dispatch(self.pipelines.variance.get_dispatch_for(low));

            let mut pc = pass.with(&self.pipelines.smoothing);
            pc.bind(GaussianSmoothing {
                input: variance.view(0),
                output: pool.ao(AoResource::SmoothedVariance).view(0),
            });
            pc.dispatch(self.pipelines.smoothing.get_dispatch_for(low));
        }

        let mut params = AtrousParams {
            iteration: 0,
            normal_sigma: config.normal_sigma,
            depth_sigma: config.depth_sigma,
            value_sigma: config.value_sigma,
        };
        // layer 0 holds the downsampled input
        let mut ping_pong = [0, 1];
        for _ in 0..config.atrous_iterations {
            let variance_in = if params.iteration == 0 {
                pool.ao(AoResource::SmoothedVariance).view(0)
            } else {
                variance.view(ping_pong[0])
            };
            let mut pass = encoder.compute("atrous");
            let mut pc = pass.with(&self.pipelines.atrous);
            pc.bind(Atrous {
                params,
                input: filtered.view(ping_pong[0]),
                variance: variance_in,
                position: gbuf(Resolution::Low, GBufferResource::Position),
                normal_depth: gbuf(Resolution::Low, GBufferResource::NormalDepth),
                output: filtered.view(ping_pong[1]),
                output_variance: variance.view(ping_pong[1]),
            });
            pc.dispatch(self.pipelines.atrous.get_dispatch_for(low));
            ping_pong.swap(0, 1);
            params.iteration += 1;
        }
        self.output_layer = ping_pong[0];
        debug_assert_eq!(self.output_layer, config.atrous_iterations as usize % 2);

        if let mut pass = encoder.compute("upsample") {
            let output = pool.ao(AoResource::Upsampled).view(0);
            if scale == 1 {
                let mut pc = pass.with(&self.pipelines.copy);
                pc.bind(CopyKernel {
                    input: filtered.view(self.output_layer),
                    output,
                });
                pc.dispatch(self.pipelines.copy.get_dispatch_for(full));
            } else {
                let mut pc = pass.with(&self.pipelines.upsample);
                pc.bind(UpsampleBilateral {
                    scale,
                    input: filtered.view(self.output_layer),
                    low_position: gbuf(Resolution::Low, GBufferResource::Position),
                    low_normal_depth: gbuf(Resolution::Low, GBufferResource::NormalDepth),
                    position: gbuf(Resolution::Raytracing, GBufferResource::Position),
                    normal_depth: gbuf(Resolution::Raytracing, GBufferResource::NormalDepth),
                    output,
                });
                pc.dispatch(self.pipelines.upsample.get_dispatch_for(full));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(extent: gpu::Extent, fun: impl Fn(u32, u32) -> [f32; 4] + Sync) -> gpu::TexelImage {
        let mut image = gpu::TexelImage::new(gpu::TextureFormat::Rgba32Float, extent);
        image.par_fill(extent, fun);
        image
    }

    fn atrous(iteration: u32) -> Atrous {
        let view = gpu::TextureView::default();
        Atrous {
            params: AtrousParams {
                iteration,
                normal_sigma: 64.0,
                depth_sigma: 1.0,
                value_sigma: 4.0,
            },
            input: view,
            variance: view,
            position: view,
            normal_depth: view,
            output: view,
            output_variance: view,
        }
    }

    #[test]
    fn representative_depth() {
        let extent = gpu::Extent::new_2d(2, 2);
        let position = image(extent, |x, _| [0.0, 0.0, 0.0, if x == 0 { 1.0 } else { 0.0 }]);
        let depths = [[1.0, 9.0], [2.0, 9.0]];
        let normal_depth = image(extent, |x, y| [0.0, 0.0, 1.0, depths[y as usize][x as usize]]);
        // mean of the hits is 1.5, both candidates are equally close, the first wins
        assert_eq!(representative(&position, &normal_depth, 0, 0, 2), [0, 0]);
    }

    #[test]
    fn zero_variance_is_preserved() {
        let extent = gpu::Extent::new_2d(6, 6);
        let input = image(extent, |x, _| [if x < 3 { 0.25 } else { 0.75 }, 0.0, 0.0, 0.0]);
        let variance = image(extent, |_, _| [0.0; 4]);
        let position = image(extent, |_, _| [0.0, 0.0, 0.0, 1.0]);
        let normal_depth = image(extent, |_, _| [0.0, 0.0, 1.0, 5.0]);
        let kernel = atrous(0);
        for y in 0..6 {
            for x in 0..6 {
                let (value, var) = kernel.filter_texel(&input, &variance, &position, &normal_depth, x, y);
                assert!((value - input.load(x, y)[0]).abs() < 1e-4, "texel {},{}", x, y);
                assert_eq!(var, 0.0);
            }
        }
    }

    #[test]
    fn zero_variance_survives_iterations() {
        let extent = gpu::Extent::new_2d(16, 16);
        let mut input = image(extent, |x, y| [((x * 7 + y * 3) % 5) as f32 * 0.2, 0.0, 0.0, 0.0]);
        let mut variance = image(extent, |_, _| [0.0; 4]);
        let position = image(extent, |_, _| [0.0, 0.0, 0.0, 1.0]);
        let normal_depth = image(extent, |_, _| [0.0, 0.0, 1.0, 5.0]);
        let original = input.clone();
        for iteration in 0..4 {
            let kernel = atrous(iteration);
            let mut next = gpu::TexelImage::new(gpu::TextureFormat::Rgba32Float, extent);
            let mut next_variance = gpu::TexelImage::new(gpu::TextureFormat::Rgba32Float, extent);
            for y in 0..extent.height {
                for x in 0..extent.width {
                    let (value, var) = kernel.filter_texel(&input, &variance, &position, &normal_depth, x, y);
                    next.store(x, y, [value, 0.0, 0.0, 0.0]);
                    next_variance.store(x, y, [var, 0.0, 0.0, 0.0]);
                }
            }
            input = next;
            variance = next_variance;
        }
        for y in 0..extent.height {
            for x in 0..extent.width {
                let (value, expected) = (input.load(x, y)[0], original.load(x, y)[0]);
                assert!((value - expected).abs() < 1e-5, "texel {},{}: {} != {}", x, y, value, expected);
                assert_eq!(variance.load(x, y)[0], 0.0);
            }
        }
    }

    struct Pattern {
        output: gpu::TextureView,
        fun: fn(u32, u32) -> [f32; 4],
    }

    impl gpu::ComputeKernel for Pattern {
        fn outputs(&self) -> Vec<gpu::KernelOutput> {
            vec![gpu::KernelOutput::Texture(self.output)]
        }
        fn execute(
            &self,
            _resources: &gpu::Resources,
            outputs: &mut gpu::KernelOutputs,
            grid: gpu::Extent,
        ) -> Result<(), gpu::DeviceError> {
            outputs.texture(0).par_fill(grid, self.fun);
            Ok(())
        }
    }

    // hits on the left, a block of misses on the right
    fn converged_position(x: u32, _y: u32) -> [f32; 4] {
        [0.0, 0.0, 0.0, if x < 12 { 1.0 } else { 0.0 }]
    }

    fn converged_coefficient(x: u32, _y: u32) -> [f32; 4] {
        [if x < 12 { 0.5 } else { 1.0 }, 0.0, 0.0, 0.0]
    }

    #[test]
    fn converged_signal_passes_the_chain() {
        let _ = env_logger::builder().is_test(true).try_init();
        let gpu = gpu::Context::init(gpu::ContextDesc::default()).unwrap();
        let size = gpu::Extent::new_2d(16, 10);
        let mut pool = ResourcePool::new(&gpu).unwrap();
        let config = DenoiserConfig {
            supersampling_scale: 1,
            atrous_iterations: 4,
            ..Default::default()
        };
        let mut denoiser = Denoiser::new(&gpu, config).unwrap();
        let mut fill = gpu.create_compute_pipeline(gpu::ComputePipelineDesc {
            name: "pattern",
            workgroup_size: [8, 8, 1],
        });
        let mut encoder = gpu.create_command_encoder(gpu::CommandEncoderDesc {
            name: "denoise",
            buffer_count: 1,
        });
        encoder.start();
        pool.recreate_window_size_dependent(&gpu, &mut encoder, size, 1)
            .unwrap();
        if let mut pass = encoder.compute("pattern") {
            let mut pc = pass.with(&fill);
            let gbuf = |resource| pool.gbuffer(Resolution::Raytracing, resource).view(0);
            let patterns: [(gpu::TextureView, fn(u32, u32) -> [f32; 4]); 3] = [
                (gbuf(GBufferResource::Position), converged_position),
                (gbuf(GBufferResource::NormalDepth), |_, _| [0.0, 1.0, 0.0, 4.0]),
                (pool.ao(AoResource::Coefficient).view(0), converged_coefficient),
            ];
            for (output, fun) in patterns {
                pc.bind(Pattern { output, fun });
                pc.dispatch(fill.get_dispatch_for(size));
            }
        }
        denoiser.denoise(&mut encoder, &pool).unwrap();
        gpu.submit(&mut encoder).unwrap();

        let upsampled = gpu
            .read_texture(pool.ao(AoResource::Upsampled).texture(0))
            .unwrap();
        assert_eq!(upsampled.extent(), size);
        for y in 0..size.height {
            for x in 0..size.width {
                let expected = converged_coefficient(x, y)[0];
                let value = upsampled.load(x, y)[0];
                assert!((value - expected).abs() < 1e-5, "texel {},{}: {}", x, y, value);
            }
        }
        let variance = gpu
            .read_texture(pool.ao(AoResource::Variance).texture(denoiser.output_layer()))
            .unwrap();
        assert!(variance.texels().chunks(4).all(|t| t[0] == 0.0));

        gpu.destroy_command_encoder(&mut encoder);
        gpu.destroy_compute_pipeline(&mut fill);
        denoiser.destroy(&gpu);
        pool.destroy(&gpu);
        assert_eq!(gpu.memory_usage(), 0);
    }

    #[test]
    fn noise_is_smoothed() {
        let extent = gpu::Extent::new_2d(8, 8);
        let input = image(extent, |x, y| [if (x + y) % 2 == 0 { 0.0 } else { 1.0 }, 0.0, 0.0, 0.0]);
        let variance = image(extent, |_, _| [0.25, 0.0, 0.0, 0.0]);
        let position = image(extent, |_, _| [0.0, 0.0, 0.0, 1.0]);
        let normal_depth = image(extent, |_, _| [0.0, 0.0, 1.0, 5.0]);
        let kernel = atrous(1);
        let (value, var) = kernel.filter_texel(&input, &variance, &position, &normal_depth, 4, 4);
        // a step of 2 only reaches texels of the same parity on a checkerboard
        assert_eq!(value, 0.0);
        assert!(var < 0.25);
        let kernel = atrous(0);
        let (value, _) = kernel.filter_texel(&input, &variance, &position, &normal_depth, 4, 4);
        assert!(value > 0.2 && value < 0.8);
    }

    #[test]
    fn misses_pass_through() {
        let extent = gpu::Extent::new_2d(3, 3);
        let input = image(extent, |x, _| [x as f32 * 0.5, 0.0, 0.0, 0.0]);
        let variance = image(extent, |_, _| [0.1, 0.0, 0.0, 0.0]);
        let position = image(extent, |_, _| [0.0; 4]);
        let normal_depth = image(extent, |_, _| [0.0; 4]);
        let (value, var) = atrous(0).filter_texel(&input, &variance, &position, &normal_depth, 1, 1);
        assert_eq!(value, 0.5);
        assert!((var - 0.1).abs() < 1e-6);
    }
}

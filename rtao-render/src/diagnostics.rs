//! Per-stage timers and ray statistics. Nothing here feeds back into rendering.

use std::{collections::VecDeque, time::Duration};

use crate::{
    resources::{AoResource, GBufferResource, Resolution, ResourcePool},
    util::{read_pod, EnumArray, EnumKey as _},
};
use rtao_graphics as gpu;

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, strum::EnumIter, strum::EnumCount)]
pub enum Stage {
    AccelerationStructure,
    GBuffer,
    Visibility,
    AmbientOcclusion,
    Denoise,
    Compose,
}

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, strum::EnumIter, strum::EnumCount)]
pub enum HitCountKind {
    /// Camera rays that hit geometry.
    CameraRays,
    /// Occluded ambient occlusion rays.
    AoRays,
}

crate::util::impl_enum_key!(Stage, HitCountKind);

/// One `u32` counter per kind.
pub const HIT_COUNT_BUFFER_SIZE: u64 = 4 * <HitCountKind as strum::EnumCount>::COUNT as u64;

impl Stage {
    /// Stage a pass label belongs to.
    pub fn from_label(label: &str) -> Option<Self> {
        Some(match label {
            "blas-init" | "blas" | "tlas" => Self::AccelerationStructure,
            "gbuffer" => Self::GBuffer,
            "visibility" => Self::Visibility,
            "ambient-occlusion" => Self::AmbientOcclusion,
            "downsample" | "variance" | "atrous" | "upsample" => Self::Denoise,
            "compose" | "present" => Self::Compose,
            _ => return None,
        })
    }
}

/// Running average of a stage duration over the last `window` frames.
#[derive(Clone, Debug)]
pub struct GpuTimer {
    samples: VecDeque<Duration>,
    window: usize,
}

impl GpuTimer {
    pub fn new(window: usize) -> Self {
        assert_ne!(window, 0);
        Self {
            samples: VecDeque::with_capacity(window),
            window,
        }
    }

    pub fn record(&mut self, duration: Duration) {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(duration);
    }

    pub fn last(&self) -> Option<Duration> {
        self.samples.back().copied()
    }

    pub fn average(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        self.samples.iter().sum::<Duration>() / self.samples.len() as u32
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}

/// Sum of one channel of a texture, written as `u32` into a buffer.
struct ReduceSum {
    input: gpu::TextureView,
    channel: usize,
    output: gpu::BufferPiece,
}

impl gpu::ComputeKernel for ReduceSum {
    fn outputs(&self) -> Vec<gpu::KernelOutput> {
        vec![gpu::KernelOutput::Buffer(self.output)]
    }
    fn execute(
        &self,
        resources: &gpu::Resources,
        outputs: &mut gpu::KernelOutputs,
        grid: gpu::Extent,
    ) -> Result<(), gpu::DeviceError> {
        use rayon::prelude::*;
        let input = resources.texture(self.input)?;
        let extent = input.extent();
        let width = extent.width.min(grid.width);
        let sum = (0..extent.height.min(grid.height))
            .into_par_iter()
            .map(|y| {
                (0..width)
                    .map(|x| input.load(x, y)[self.channel] as u64)
                    .sum::<u64>()
            })
            .sum::<u64>();
        let value = sum.min(u32::MAX as u64) as u32;
        outputs.buffer(0)[..4].copy_from_slice(bytemuck::bytes_of(&value));
        Ok(())
    }
}

pub const DEFAULT_TIMER_WINDOW: usize = 30;

pub struct Diagnostics {
    reduce: gpu::ComputePipeline,
    timers: EnumArray<Stage, GpuTimer>,
    hit_counts: EnumArray<HitCountKind, u32>,
    ray_counts: RayCounts,
    acceleration_structure_bytes: u64,
    frames_since_build: u32,
}

/// Rays traced by the last sampled frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RayCounts {
    pub camera: u64,
    pub visibility: u64,
    pub ambient_occlusion: u64,
}

impl RayCounts {
    pub fn total(&self) -> u64 {
        self.camera + self.visibility + self.ambient_occlusion
    }
}

impl Diagnostics {
    pub fn new(gpu: &gpu::Context, timer_window: usize) -> Self {
        Self {
            reduce: gpu.create_compute_pipeline(gpu::ComputePipelineDesc {
                name: "reduce-sum",
                workgroup_size: [8, 8, 1],
            }),
            timers: EnumArray::from_fn(|_| GpuTimer::new(timer_window)),
            hit_counts: EnumArray::default(),
            ray_counts: RayCounts::default(),
            acceleration_structure_bytes: 0,
            frames_since_build: 0,
        }
    }

    pub fn destroy(&mut self, gpu: &gpu::Context) {
        gpu.destroy_compute_pipeline(&mut self.reduce);
    }

    /// Record the hit count reductions of the current frame.
    pub fn count_hits(&self, encoder: &mut gpu::CommandEncoder, pool: &ResourcePool) {
        let size = pool.extent(Resolution::Raytracing);
        // position `w` is 1 on hits
        let sources = [
            (
                HitCountKind::CameraRays,
                pool.gbuffer(Resolution::Raytracing, GBufferResource::Position).view(0),
                3,
            ),
            (HitCountKind::AoRays, pool.ao(AoResource::HitCount).view(0), 0),
        ];
        let mut pass = encoder.compute("hit-count");
        let mut pc = pass.with(&self.reduce);
        for (kind, input, channel) in sources {
            pc.bind(ReduceSum {
                input,
                channel,
                output: pool.hit_counts().at(4 * kind.index() as u64),
            });
            pc.dispatch(self.reduce.get_dispatch_for(size));
        }
    }

    /// Pick up the results of a completed frame.
    ///
    /// Counters are only read back once `sync_point` is reached,
    /// otherwise the previous values stay.
    #[profiling::function]
    pub fn sample(
        &mut self,
        gpu: &gpu::Context,
        pool: &ResourcePool,
        sync_point: &gpu::SyncPoint,
        timings: &gpu::Timings,
        samples_per_pixel: u32,
    ) {
        let mut totals = EnumArray::<Stage, Option<Duration>>::default();
        for &(ref label, duration) in timings.iter() {
            if let Some(stage) = Stage::from_label(label) {
                *totals[stage].get_or_insert(Duration::ZERO) += duration;
            }
        }
        for (stage, total) in totals.iter() {
            if let Some(total) = *total {
                self.timers[stage].record(total);
            }
        }

        if !gpu.wait_for(sync_point, 0) {
            return;
        }
        let bytes = match gpu.read_buffer(pool.hit_counts().into(), HIT_COUNT_BUFFER_SIZE) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("Hit count readback failed: {}", e);
                return;
            }
        };
        self.hit_counts = EnumArray::from_fn(|kind: HitCountKind| {
            read_pod::<u32>(&bytes, kind.index()).unwrap_or(0)
        });
        let hits = self.hit_counts[HitCountKind::CameraRays] as u64;
        self.ray_counts = RayCounts {
            camera: pool.extent(Resolution::Raytracing).texel_count(),
            visibility: hits,
            ambient_occlusion: hits * samples_per_pixel as u64,
        };
    }

    pub fn set_acceleration_structure_stats(&mut self, bytes: u64, frames_since_build: u32) {
        self.acceleration_structure_bytes = bytes;
        self.frames_since_build = frames_since_build;
    }

    pub fn timer(&self, stage: Stage) -> &GpuTimer {
        &self.timers[stage]
    }

    pub fn hit_count(&self, kind: HitCountKind) -> u32 {
        self.hit_counts[kind]
    }

    pub fn ray_counts(&self) -> RayCounts {
        self.ray_counts
    }

    /// Rays per second over the averaged ray dispatch stages.
    pub fn rays_per_second(&self) -> f64 {
        let time = [Stage::GBuffer, Stage::Visibility, Stage::AmbientOcclusion]
            .iter()
            .map(|&stage| self.timers[stage].average())
            .sum::<Duration>()
            .as_secs_f64();
        if time == 0.0 {
            0.0
        } else {
            self.ray_counts.total() as f64 / time
        }
    }

    pub fn acceleration_structure_bytes(&self) -> u64 {
        self.acceleration_structure_bytes
    }

    pub fn frames_since_build(&self) -> u32 {
        self.frames_since_build
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_average() {
        let mut timer = GpuTimer::new(2);
        assert_eq!(timer.average(), Duration::ZERO);
        timer.record(Duration::from_millis(2));
        timer.record(Duration::from_millis(4));
        assert_eq!(timer.average(), Duration::from_millis(3));
        timer.record(Duration::from_millis(8));
        assert_eq!(timer.average(), Duration::from_millis(6));
        assert_eq!(timer.last(), Some(Duration::from_millis(8)));
        assert_eq!(timer.sample_count(), 2);
    }

    #[test]
    fn labels() {
        assert_eq!(Stage::from_label("atrous"), Some(Stage::Denoise));
        assert_eq!(Stage::from_label("tlas"), Some(Stage::AccelerationStructure));
        assert_eq!(Stage::from_label("scene-constants"), None);
    }
}

//! Settings of the application, deserialized from RON.
//!
//! Every field has a default, so a partial file (or no file at all) works.

use rtao_render as rr;
use std::{fs, path::Path};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unable to read the config")]
    Io(#[from] std::io::Error),
    #[error("unable to parse the config")]
    Parse(#[from] ron::error::SpannedError),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, serde::Deserialize)]
pub enum DownsampleFilter {
    #[default]
    Box,
    Gaussian9,
    Gaussian25,
    Bilateral,
}

impl From<DownsampleFilter> for rr::denoise::DownsampleFilter {
    fn from(filter: DownsampleFilter) -> Self {
        match filter {
            DownsampleFilter::Box => Self::BoxFilter2x2,
            DownsampleFilter::Gaussian9 => Self::Gaussian9Tap,
            DownsampleFilter::Gaussian25 => Self::Gaussian25Tap,
            DownsampleFilter::Bilateral => Self::Bilateral,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, serde::Deserialize)]
pub enum ComposeMode {
    #[default]
    Shaded,
    AmbientOcclusion,
    RawAmbientOcclusion,
    Variance,
    Normals,
    Depth,
}

impl From<ComposeMode> for rr::compose::ComposeMode {
    fn from(mode: ComposeMode) -> Self {
        match mode {
            ComposeMode::Shaded => Self::Shaded,
            ComposeMode::AmbientOcclusion => Self::AmbientOcclusion,
            ComposeMode::RawAmbientOcclusion => Self::RawAmbientOcclusion,
            ComposeMode::Variance => Self::Variance,
            ComposeMode::Normals => Self::Normals,
            ComposeMode::Depth => Self::Depth,
        }
    }
}

#[derive(Clone, Debug, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct Ray {
    pub samples_per_pixel: u32,
    pub sample_set_count: u32,
    pub ao_radius: f32,
    pub t_min: f32,
    pub seed: u64,
}

impl Default for Ray {
    fn default() -> Self {
        let rc = rr::raytrace::RayConfig::default();
        Self {
            samples_per_pixel: rc.samples_per_pixel,
            sample_set_count: rc.sample_set_count,
            ao_radius: rc.ao_radius,
            t_min: rc.t_min,
            seed: rc.seed,
        }
    }
}

#[derive(Clone, Debug, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct Denoiser {
    pub supersampling_scale: u32,
    pub downsample_filter: DownsampleFilter,
    pub variance_radius: u32,
    pub atrous_iterations: u32,
    pub normal_sigma: f32,
    pub depth_sigma: f32,
    pub value_sigma: f32,
}

impl Default for Denoiser {
    fn default() -> Self {
        let dc = rr::denoise::DenoiserConfig::default();
        Self {
            supersampling_scale: dc.supersampling_scale,
            downsample_filter: DownsampleFilter::default(),
            variance_radius: dc.variance_radius,
            atrous_iterations: dc.atrous_iterations,
            normal_sigma: dc.normal_sigma,
            depth_sigma: dc.depth_sigma,
            value_sigma: dc.value_sigma,
        }
    }
}

#[derive(Clone, Debug, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct Compose {
    pub mode: ComposeMode,
    pub ambient_intensity: f32,
    pub light_intensity: f32,
    pub max_depth: f32,
}

impl Default for Compose {
    fn default() -> Self {
        let cc = rr::compose::ComposeConfig::default();
        Self {
            mode: ComposeMode::default(),
            ambient_intensity: cc.ambient_intensity,
            light_intensity: cc.light_intensity,
            max_depth: cc.max_depth,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, serde::Deserialize)]
pub enum Layout {
    /// Spheres on a square grid above the ground.
    #[default]
    Grid,
    /// Spheres spread over a larger sphere.
    Sphere,
}

#[derive(Clone, Debug, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct Scene {
    pub layout: Layout,
    pub sphere_count: usize,
    pub sphere_radius: f32,
    /// Distance between grid cells, or the radius of the sphere layout.
    pub spacing: f32,
    pub ground_size: f32,
    /// Quads per side of the ground mesh.
    pub ground_divisions: u32,
    pub animate: bool,
    /// Rotate the light direction around the vertical axis over time.
    pub animate_light: bool,
    pub environment: [f32; 3],
    pub light_direction: mint::Vector3<f32>,
}

impl Default for Scene {
    fn default() -> Self {
        Self {
            layout: Layout::default(),
            sphere_count: 16,
            sphere_radius: 0.5,
            spacing: 1.5,
            ground_size: 20.0,
            ground_divisions: 4,
            animate: true,
            animate_light: false,
            environment: [0.6, 0.7, 0.9],
            light_direction: [0.3, 1.0, 0.5].into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct Engine {
    /// Device memory budget, in megabytes.
    pub memory_budget_mb: u64,
    pub validation: bool,
    /// Refits allowed before a bottom level structure is rebuilt.
    pub max_refits: Option<u32>,
    /// Frames averaged by the stage timers.
    pub timer_window: usize,
}

impl Default for Engine {
    fn default() -> Self {
        Self {
            memory_budget_mb: 1 << 10,
            validation: cfg!(debug_assertions),
            max_refits: Some(60),
            timer_window: rr::diagnostics::DEFAULT_TIMER_WINDOW,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: Engine,
    pub ray: Ray,
    pub denoiser: Denoiser,
    pub compose: Compose,
    pub scene: Scene,
}

impl Config {
    pub fn from_ron(text: &str) -> Result<Self, ConfigError> {
        Ok(ron::de::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        log::info!("Loading config from {}", path.display());
        let text = fs::read_to_string(path)?;
        Self::from_ron(&text)
    }

    pub fn context_desc(&self) -> rtao_graphics::ContextDesc {
        rtao_graphics::ContextDesc {
            validation: self.engine.validation,
            timing: true,
            memory_budget: self.engine.memory_budget_mb << 20,
        }
    }

    pub fn render_config(&self) -> rr::RenderConfig {
        rr::RenderConfig {
            ray: rr::raytrace::RayConfig {
                samples_per_pixel: self.ray.samples_per_pixel,
                sample_set_count: self.ray.sample_set_count,
                ao_radius: self.ray.ao_radius,
                t_min: self.ray.t_min,
                seed: self.ray.seed,
            },
            denoiser: rr::denoise::DenoiserConfig {
                supersampling_scale: self.denoiser.supersampling_scale,
                downsample_filter: self.denoiser.downsample_filter.into(),
                variance_radius: self.denoiser.variance_radius,
                atrous_iterations: self.denoiser.atrous_iterations,
                normal_sigma: self.denoiser.normal_sigma,
                depth_sigma: self.denoiser.depth_sigma,
                value_sigma: self.denoiser.value_sigma,
            },
            compose: rr::compose::ComposeConfig {
                mode: self.compose.mode.into(),
                ambient_intensity: self.compose.ambient_intensity,
                light_intensity: self.compose.light_intensity,
                max_depth: self.compose.max_depth,
            },
            rebuild_policy: rr::accel::RebuildPolicy {
                max_refits: self.engine.max_refits,
            },
            timer_window: self.engine.timer_window,
        }
    }
}

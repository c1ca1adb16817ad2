#![allow(
    irrefutable_let_patterns,
    clippy::new_without_default,
    // Conditions are more readable when spelled out.
    clippy::nonminimal_bool,
)]
#![warn(
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_qualifications,
    // We don't match on a reference, unless required.
    clippy::pattern_type_mismatch,
)]

//! Frame driver of the ambient occlusion renderer.
//!
//! The presentation host calls into [`Engine`] with the usual lifecycle
//! events. Requests for re-initialization are only recorded when made,
//! and carried out together at the start of the next frame.

pub mod config;
pub mod scene;

pub use config::Config;
pub use scene::{Animated, LoadError, ProceduralScene, SceneLoader};

use rtao_graphics as gpu;
use rtao_render::{
    self as rr, scene::SceneDescription, util::FramePacer, Camera, ConfigurationError,
    RenderError, Renderer,
};
use std::sync::Arc;

bitflags::bitflags! {
    /// Deferred work, executed at the start of the next frame.
    #[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq)]
    pub struct Requests: u32 {
        /// Load the scene description again.
        const SCENE = 1 << 0;
        /// Upload geometry and materials of the loaded scene.
        const GEOMETRY = 1 << 1;
        /// Build the bottom level structures and the shader tables.
        const ACCELERATION_STRUCTURE = 1 << 2;
        /// Recreate the render targets at the current size.
        const RAYTRACING_RESOURCES = 1 << 3;
        /// Generate and upload a new sample set.
        const AO_SAMPLES = 1 << 4;
    }
}

impl Requests {
    /// Order pending requests are executed in.
    pub const DRAIN_ORDER: [Self; 5] = [
        Self::SCENE,
        Self::GEOMETRY,
        Self::ACCELERATION_STRUCTURE,
        Self::RAYTRACING_RESOURCES,
        Self::AO_SAMPLES,
    ];

    /// Requests that become necessary once this one is carried out.
    fn implied(self) -> Self {
        if self == Self::SCENE {
            Self::GEOMETRY
        } else if self == Self::GEOMETRY {
            Self::ACCELERATION_STRUCTURE
        } else {
            Self::empty()
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The target holds the new frame.
    Presented,
    /// Nothing was presented, the frame is retried later.
    Skipped,
    /// The device was recreated along with everything on it.
    /// The host has to recreate its presentation target.
    Reinitialized,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("unable to load the scene")]
    Load(#[from] LoadError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error("engine is not initialized")]
    NotInitialized,
}

impl FrameError {
    pub fn is_transient(&self) -> bool {
        match *self {
            Self::Render(ref e) => e.is_transient(),
            _ => false,
        }
    }

    pub fn is_device_lost(&self) -> bool {
        match *self {
            Self::Render(ref e) => e.is_device_lost(),
            _ => false,
        }
    }
}

struct SceneState {
    loader: Box<dyn SceneLoader>,
    description: Option<SceneDescription>,
    time: f32,
}

struct Frame<'a> {
    gpu: &'a gpu::Context,
    encoder: &'a mut gpu::CommandEncoder,
    temp: &'a mut rr::FrameResources,
}

fn execute_request(
    request: Requests,
    renderer: &mut Renderer,
    scene: &mut SceneState,
    size: gpu::Extent,
    frame: &mut Frame,
) -> Result<(), FrameError> {
    log::debug!("Executing {:?}", request);
    if request == Requests::SCENE {
        scene.description = Some(scene.loader.load()?);
    } else if request == Requests::GEOMETRY {
        let description = scene
            .description
            .as_ref()
            .ok_or(RenderError::from(ConfigurationError::NoScene))?;
        renderer.load_geometry(frame.gpu, description)?;
    } else if request == Requests::ACCELERATION_STRUCTURE {
        renderer.initialize_structures(frame.gpu, frame.encoder, frame.temp)?;
    } else if request == Requests::RAYTRACING_RESOURCES {
        renderer.recreate_raytracing_resources(frame.gpu, frame.encoder, size)?;
    } else if request == Requests::AO_SAMPLES {
        renderer.recreate_samples(frame.gpu, frame.temp)?;
    }
    Ok(())
}

/// Drives the renderer through frames, requests and device loss.
pub struct Engine {
    gpu: Arc<gpu::Context>,
    pacer: FramePacer,
    renderer: Option<Renderer>,
    render_config: rr::RenderConfig,
    scene: SceneState,
    camera: Camera,
    size: gpu::Extent,
    requests: Requests,
    last_drained: Vec<Requests>,
    device_lost: bool,
}

impl Engine {
    pub fn new(gpu: Arc<gpu::Context>, config: &Config, loader: Box<dyn SceneLoader>) -> Self {
        let pacer = FramePacer::new(&gpu);
        Self {
            gpu,
            pacer,
            renderer: None,
            render_config: config.render_config(),
            scene: SceneState {
                loader,
                description: None,
                time: 0.0,
            },
            camera: Camera::default(),
            size: gpu::Extent::default(),
            requests: Requests::empty(),
            last_drained: Vec::new(),
            device_lost: false,
        }
    }

    /// Create the renderer and bring up everything for a target of `size`.
    #[profiling::function]
    pub fn on_init(&mut self, size: gpu::Extent) -> Result<(), FrameError> {
        log::info!("Initializing the engine at {:?}", size);
        self.size = size;
        self.renderer = Some(Renderer::new(&self.gpu, self.render_config)?);
        self.requests = Requests::all();
        self.run_frame(None).map(|_| ())
    }

    /// Advance the animation by `dt` seconds.
    #[profiling::function]
    pub fn on_update(&mut self, dt: f32) {
        let scene = &mut self.scene;
        scene.time += dt;
        if let Some(ref mut description) = scene.description {
            let changed = scene.loader.animate(scene.time, description);
            if let Some(ref mut renderer) = self.renderer {
                if changed.contains(Animated::INSTANCES) {
                    renderer.update_instances(&description.instances);
                }
                if changed.contains(Animated::LIGHT) {
                    renderer.set_light_direction(description.light_direction.into());
                }
            }
        }
    }

    pub fn on_size_changed(&mut self, size: gpu::Extent) {
        if size.width == 0 || size.height == 0 || size == self.size {
            return;
        }
        log::info!("Resizing to {:?}", size);
        self.size = size;
        self.request_recreate_raytracing_resources();
    }

    /// The host observed a device loss. Recovery happens with the next frame.
    pub fn on_device_lost(&mut self) {
        self.device_lost = true;
    }

    /// Render a frame into `target`, which must be of the current size.
    #[profiling::function]
    pub fn on_render(&mut self, target: gpu::Texture) -> Result<FrameOutcome, FrameError> {
        if self.renderer.is_none() {
            return Err(FrameError::NotInitialized);
        }
        if self.device_lost || self.gpu.is_lost() {
            self.reinitialize()?;
            return Ok(FrameOutcome::Reinitialized);
        }
        let outcome = self.run_frame(Some(target));
        profiling::finish_frame!();
        outcome
    }

    #[profiling::function]
    fn reinitialize(&mut self) -> Result<(), FrameError> {
        log::warn!("Recreating the device and all of its resources");
        self.gpu.recreate();
        // handles of the previous device are all gone
        self.pacer.forget();
        self.renderer = Some(Renderer::new(&self.gpu, self.render_config)?);
        self.device_lost = false;
        self.requests = match self.scene.description {
            Some(_) => Requests::all() - Requests::SCENE,
            None => Requests::all(),
        };
        self.run_frame(None)?;
        Ok(())
    }

    fn run_frame(&mut self, target: Option<gpu::Texture>) -> Result<FrameOutcome, FrameError> {
        let renderer = self.renderer.as_mut().ok_or(FrameError::NotInitialized)?;
        if self
            .requests
            .intersects(Requests::SCENE | Requests::GEOMETRY | Requests::RAYTRACING_RESOURCES)
        {
            // these destroy the old resources right away
            self.pacer.wait_for_all(&self.gpu);
        }

        let (encoder, temp) = self.pacer.begin_frame(&self.gpu);
        let mut frame = Frame {
            gpu: &self.gpu,
            encoder,
            temp,
        };

        let mut pending = std::mem::take(&mut self.requests);
        self.last_drained.clear();
        let mut result = Ok(());
        for request in Requests::DRAIN_ORDER {
            if !pending.contains(request) {
                continue;
            }
            match execute_request(request, renderer, &mut self.scene, self.size, &mut frame) {
                Ok(()) => {
                    pending.remove(request);
                    pending |= request.implied();
                    self.last_drained.push(request);
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        // whatever failed is retried with the next frame
        self.requests |= pending;

        if let Some(target) = target {
            if result.is_ok() {
                result = renderer
                    .render(frame.gpu, frame.encoder, frame.temp, &self.camera, target)
                    .map_err(FrameError::from);
            }
        }

        let mut outcome = match target {
            Some(_) => FrameOutcome::Presented,
            None => FrameOutcome::Skipped,
        };
        if let Err(e) = result {
            if e.is_device_lost() {
                log::error!("Device lost while recording: {}", e);
                self.device_lost = true;
                return Ok(FrameOutcome::Skipped);
            }
            if !e.is_transient() {
                log::error!("Frame failed: {}", e);
                return Err(e);
            }
            log::warn!("Skipping the frame: {}", e);
            outcome = FrameOutcome::Skipped;
        }

        // Passes recorded before a transient failure are complete,
        // and builds recorded by the drained requests have to run.
        match self.pacer.end_frame(&self.gpu) {
            Ok(sync_point) => {
                renderer.finish_frame(&self.gpu, &sync_point, self.pacer.timings());
                Ok(outcome)
            }
            Err(gpu::DeviceError::Lost) => {
                log::error!("Device lost on submission");
                self.device_lost = true;
                Ok(FrameOutcome::Skipped)
            }
            Err(e) => Err(RenderError::from(e).into()),
        }
    }

    pub fn request_scene_initialization(&mut self) {
        self.requests |= Requests::SCENE;
    }

    pub fn request_geometry_initialization(&mut self) {
        self.requests |= Requests::GEOMETRY;
    }

    pub fn request_as_initialization(&mut self) {
        self.requests |= Requests::ACCELERATION_STRUCTURE;
    }

    pub fn request_recreate_raytracing_resources(&mut self) {
        self.requests |= Requests::RAYTRACING_RESOURCES;
    }

    pub fn request_recreate_ao_samples(&mut self) {
        self.requests |= Requests::AO_SAMPLES;
    }

    pub fn pending_requests(&self) -> Requests {
        self.requests
    }

    /// Requests carried out by the last frame, in execution order.
    pub fn last_drained(&self) -> &[Requests] {
        &self.last_drained
    }

    pub fn gpu(&self) -> &Arc<gpu::Context> {
        &self.gpu
    }

    pub fn renderer(&self) -> Option<&Renderer> {
        self.renderer.as_ref()
    }

    pub fn scene(&self) -> Option<&SceneDescription> {
        self.scene.description.as_ref()
    }

    pub fn size(&self) -> gpu::Extent {
        self.size
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn set_camera(&mut self, camera: Camera) {
        self.camera = camera;
    }

    pub fn set_compose_mode(&mut self, mode: rr::compose::ComposeMode) {
        self.render_config.compose.mode = mode;
        if let Some(ref mut renderer) = self.renderer {
            renderer.set_compose_mode(mode);
        }
    }

    pub fn destroy(&mut self) {
        self.pacer.wait_for_all(&self.gpu);
        if let Some(mut renderer) = self.renderer.take() {
            renderer.destroy(&self.gpu);
        }
        self.pacer.destroy(&self.gpu);
    }
}

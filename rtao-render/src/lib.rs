#![allow(irrefutable_let_patterns, clippy::new_without_default)]
#![warn(
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_qualifications,
    // We don't match on a reference, unless required.
    clippy::pattern_type_mismatch,
)]

//! Ray traced ambient occlusion on top of `rtao-graphics`.
//!
//! A frame goes through the acceleration structure manager, three ray
//! dispatches (G-buffer, visibility and ambient occlusion), the denoising
//! chain and the compose stage, all recorded into one command stream.

pub mod accel;
pub mod compose;
pub mod denoise;
pub mod diagnostics;
mod error;
pub mod raytrace;
pub mod resources;
pub mod samples;
pub mod scene;
pub mod shader_table;
mod renderer;
pub mod util;

pub use error::*;
pub use renderer::*;

use rtao_graphics as gpu;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Camera {
    pub position: mint::Vector3<f32>,
    pub orientation: mint::Quaternion<f32>,
    /// Vertical field of view, in radians.
    pub fov_y: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: [0.0, 2.0, 8.0].into(),
            orientation: mint::Quaternion {
                v: [0.0; 3].into(),
                s: 1.0,
            },
            fov_y: 0.9,
            near: 0.01,
            far: 100.0,
        }
    }
}

/// Temporary resources of a frame, released once the device is done with it.
#[derive(Default)]
pub struct FrameResources {
    pub buffers: Vec<gpu::Buffer>,
    pub textures: Vec<gpu::Texture>,
    pub views: Vec<gpu::TextureView>,
    pub acceleration_structures: Vec<gpu::AccelerationStructure>,
}

impl FrameResources {
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
            && self.textures.is_empty()
            && self.views.is_empty()
            && self.acceleration_structures.is_empty()
    }

    pub fn destroy(&mut self, context: &gpu::Context) {
        for buffer in self.buffers.drain(..) {
            context.destroy_buffer(buffer);
        }
        for view in self.views.drain(..) {
            context.destroy_texture_view(view);
        }
        for texture in self.textures.drain(..) {
            context.destroy_texture(texture);
        }
        for accel in self.acceleration_structures.drain(..) {
            context.destroy_acceleration_structure(accel);
        }
    }
}

#![allow(
    // We don't use syntax sugar where it's not necessary.
    clippy::match_like_matches_macro,
    // Redundant matching is more explicit.
    clippy::redundant_pattern_matching,
    // Explicit lifetimes are often easier to reason about.
    clippy::needless_lifetimes,
    // No need for defaults in the internal types.
    clippy::new_without_default,
    // Matches are good and extendable, no need to make an exception here.
    clippy::single_match,
    // Push commands are more regular than macros.
    clippy::vec_init_then_push,
)]
#![warn(
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_qualifications,
    // We don't match on a reference, unless required.
    clippy::pattern_type_mismatch,
)]

//! Graphics abstraction of the `rtao` renderer.
//!
//! The API follows the shape of a modern explicit GPU interface: resources are
//! created on a [`Context`], work is recorded into a [`CommandEncoder`] through
//! typed pass encoders, and every submission returns a [`SyncPoint`] that can
//! be waited upon. The backend is a software device executing the recorded
//! stream on the CPU.

#[path = "soft/mod.rs"]
mod hal;
mod ray;

pub use hal::*;
pub use ray::*;

use std::time::Duration;

pub mod limits {
    /// Size of a shader identifier at the start of every shader record.
    pub const SHADER_IDENTIFIER_SIZE: u32 = 32;
    /// Every shader record stride is a multiple of this.
    pub const SHADER_RECORD_ALIGNMENT: u32 = 32;
    /// Start of every shader table is a multiple of this.
    pub const SHADER_TABLE_ALIGNMENT: u32 = 64;
    /// Largest shader record accepted by the ray tracing pipeline.
    pub const MAX_SHADER_RECORD_SIZE: u32 = 4096;
    /// Deepest `trace_ray` recursion supported by the device.
    pub const MAX_RECURSION_DEPTH: u32 = 31;
}

#[derive(Debug)]
pub struct ContextDesc {
    /// Enable extra validation of bindings and resource states.
    pub validation: bool,
    /// Collect pass timings on every submission.
    pub timing: bool,
    /// Total number of bytes the device is allowed to allocate.
    pub memory_budget: u64,
}

impl Default for ContextDesc {
    fn default() -> Self {
        Self {
            validation: true,
            timing: true,
            memory_budget: 1 << 30,
        }
    }
}

#[derive(Debug)]
pub struct NotSupportedError;

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum DeviceError {
    #[error("out of device memory allocating '{name}': {requested} bytes requested, {available} available")]
    OutOfMemory {
        name: String,
        requested: u64,
        available: u64,
    },
    #[error("device is lost")]
    Lost,
    #[error("resource '{name}' is in state {actual:?}, expected {expected:?}")]
    InvalidState {
        name: String,
        expected: TextureState,
        actual: TextureState,
    },
    #[error("resource '{0}' is bound for reading and writing in the same dispatch")]
    Aliasing(String),
    #[error("{0} handle does not refer to a live resource")]
    InvalidResource(&'static str),
    #[error("scratch buffer holds {provided} bytes, build requires {required}")]
    ScratchTooSmall { required: u64, provided: u64 },
    #[error("acceleration structure '{0}' can not be updated in place")]
    InvalidUpdate(String),
    #[error("{table} shader table has no record at index {index}")]
    ShaderTableOverflow { table: &'static str, index: u32 },
    #[error("shader record does not match any export of pipeline '{0}'")]
    UnknownShaderIdentifier(String),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Memory {
    /// Device-local memory, not accessible by the host.
    Device,
    /// Memory readable and writable by both the host and the device.
    Shared,
    /// Host-writable memory used for uploads.
    Upload,
}

impl Memory {
    pub fn is_host_visible(self) -> bool {
        match self {
            Self::Device => false,
            Self::Shared | Self::Upload => true,
        }
    }
}

#[derive(Debug)]
pub struct BufferDesc<'a> {
    pub name: &'a str,
    pub size: u64,
    pub memory: Memory,
}

#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub struct BufferPiece {
    pub buffer: Buffer,
    pub offset: u64,
}

impl From<Buffer> for BufferPiece {
    fn from(buffer: Buffer) -> Self {
        Self { buffer, offset: 0 }
    }
}

impl Buffer {
    pub fn at(self, offset: u64) -> BufferPiece {
        BufferPiece {
            buffer: self,
            offset,
        }
    }
}

#[derive(Clone, Copy, Debug, Hash, Eq, Ord, PartialEq, PartialOrd)]
pub enum TextureFormat {
    R32Float,
    Rg32Float,
    Rgba32Float,
    Rgba16Float,
    Rgba8Unorm,
    Bgra8Unorm,
    R32Uint,
}

impl TextureFormat {
    pub fn channel_count(&self) -> usize {
        match *self {
            Self::R32Float | Self::R32Uint => 1,
            Self::Rg32Float => 2,
            Self::Rgba32Float | Self::Rgba16Float | Self::Rgba8Unorm | Self::Bgra8Unorm => 4,
        }
    }

    pub fn bytes_per_texel(&self) -> u32 {
        match *self {
            Self::R32Float | Self::R32Uint => 4,
            Self::Rg32Float => 8,
            Self::Rgba32Float => 16,
            Self::Rgba16Float => 8,
            Self::Rgba8Unorm | Self::Bgra8Unorm => 4,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Hash, Eq, PartialEq)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl Extent {
    pub fn new_2d(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            depth: 1,
        }
    }

    pub fn texel_count(&self) -> u64 {
        self.width as u64 * self.height as u64 * self.depth as u64
    }

    /// Size of the grid covering this extent with cells of `scale` texels.
    pub fn downscaled(&self, scale: u32) -> Self {
        assert_ne!(scale, 0);
        Self {
            width: self.width.div_ceil(scale),
            height: self.height.div_ceil(scale),
            depth: self.depth,
        }
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq)]
    pub struct TextureUsage: u32 {
        const COPY = 1 << 0;
        const TARGET = 1 << 1;
        const RESOURCE = 1 << 2;
        const STORAGE = 1 << 3;
    }
}

/// Access state a texture is in, transitioned explicitly by the encoder.
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq)]
pub enum TextureState {
    #[default]
    Undefined,
    Common,
    CopySource,
    CopyDestination,
    Present,
}

#[derive(Debug)]
pub struct TextureDesc<'a> {
    pub name: &'a str,
    pub format: TextureFormat,
    pub size: Extent,
    pub usage: TextureUsage,
}

#[derive(Debug)]
pub struct TextureViewDesc<'a> {
    pub name: &'a str,
    pub texture: Texture,
}

/// Row-major 3x4 affine transform, same layout as the instance descriptors use.
pub type Transform = mint::RowMatrix3x4<f32>;

pub const IDENTITY_TRANSFORM: Transform = mint::RowMatrix3x4 {
    x: mint::Vector4 {
        x: 1.0,
        y: 0.0,
        z: 0.0,
        w: 0.0,
    },
    y: mint::Vector4 {
        x: 0.0,
        y: 1.0,
        z: 0.0,
        w: 0.0,
    },
    z: mint::Vector4 {
        x: 0.0,
        y: 0.0,
        z: 1.0,
        w: 0.0,
    },
};

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum AccelerationStructureType {
    TopLevel,
    BottomLevel,
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq)]
    pub struct AccelerationStructureFlags: u32 {
        const PREFER_FAST_TRACE = 1 << 0;
        const PREFER_FAST_BUILD = 1 << 1;
        const ALLOW_UPDATE = 1 << 2;
    }
}

#[derive(Debug)]
pub struct AccelerationStructureDesc<'a> {
    pub name: &'a str,
    pub ty: AccelerationStructureType,
    pub size: u64,
    pub flags: AccelerationStructureFlags,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct AccelerationStructureSizes {
    /// Size of the structure itself.
    pub data: u64,
    /// Size of the scratch buffer needed for building or updating.
    pub scratch: u64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AccelerationStructureGeometry {
    /// Triangles with `f32x3` positions at the start of every vertex.
    Triangles {
        vertex_data: BufferPiece,
        vertex_stride: u32,
        vertex_count: u32,
        /// `u32` indices, or `None` for a plain triangle list.
        index_data: Option<BufferPiece>,
        triangle_count: u32,
        is_opaque: bool,
    },
    /// Axis-aligned boxes as `[min.xyz, max.xyz]` of `f32`.
    Aabbs {
        aabb_data: BufferPiece,
        aabb_stride: u32,
        aabb_count: u32,
        is_opaque: bool,
    },
}

impl AccelerationStructureGeometry {
    pub fn primitive_count(&self) -> u32 {
        match *self {
            Self::Triangles { triangle_count, .. } => triangle_count,
            Self::Aabbs { aabb_count, .. } => aabb_count,
        }
    }

    /// The same geometry limited to its first `count` primitives.
    pub fn with_primitive_count(self, count: u32) -> Self {
        match self {
            Self::Triangles {
                vertex_data,
                vertex_stride,
                vertex_count,
                index_data,
                is_opaque,
                ..
            } => Self::Triangles {
                vertex_data,
                vertex_stride,
                vertex_count,
                index_data,
                triangle_count: count,
                is_opaque,
            },
            Self::Aabbs {
                aabb_data,
                aabb_stride,
                is_opaque,
                ..
            } => Self::Aabbs {
                aabb_data,
                aabb_stride,
                aabb_count: count,
                is_opaque,
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BuildMode {
    /// Construct the structure from scratch.
    Build,
    /// Refit the bounds of a previously built structure with unchanged topology.
    Update,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AccelerationStructureInstance {
    /// Index into the bottom level list passed alongside the instances.
    pub acceleration_structure_index: u32,
    pub transform: Transform,
    pub mask: u32,
    pub custom_index: u32,
    /// Offset added to the hit group index for every geometry of this instance.
    pub hit_group_offset: u32,
}

pub type Timings = Vec<(String, Duration)>;

pub struct CommandEncoderDesc<'a> {
    pub name: &'a str,
    /// Number of buffers that this encoder needs to keep alive.
    /// For example, one buffer is being run on GPU while the
    /// other is being actively encoded, which makes 2.
    pub buffer_count: u32,
}

pub struct ComputePipelineDesc<'a> {
    pub name: &'a str,
    pub workgroup_size: [u32; 3],
}

/// Region of a shader table, as consumed by `dispatch_rays`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ShaderTableRegion {
    pub start: BufferPiece,
    pub size: u64,
    pub stride: u64,
}

impl ShaderTableRegion {
    pub fn record_count(&self) -> u64 {
        if self.stride == 0 {
            0
        } else {
            self.size / self.stride
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DispatchRaysDesc {
    pub ray_generation: ShaderTableRegion,
    pub miss: ShaderTableRegion,
    pub hit_group: ShaderTableRegion,
    pub size: Extent,
}

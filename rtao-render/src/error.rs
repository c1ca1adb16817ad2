use rtao_graphics as gpu;
use std::fmt;

/// Inconsistent setup, detected when a stage is built. Never retried.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("{stage} produces {produced:?}, the next stage expects {expected:?}")]
    ResolutionMismatch {
        stage: &'static str,
        expected: gpu::Extent,
        produced: gpu::Extent,
    },
    #[error("shader tables were built for hit groups {built:#b}, active set is {current:#b}")]
    StaleShaderTables { built: u32, current: u32 },
    #[error("shader tables are not built")]
    MissingShaderTables,
    #[error("no top level acceleration structure to trace against")]
    MissingTopLevel,
    #[error("{0} bottom level structures exceed the limit of {limit}", limit = crate::accel::MAX_BLAS)]
    TooManyBlas(usize),
    #[error("shader record of '{name}' needs {required} bytes, the limit is {limit}")]
    RecordTooLarge {
        name: String,
        required: u32,
        limit: u32,
    },
    #[error("pipeline has no export named '{0}'")]
    UnknownProgram(String),
    #[error("supersampling scale must be at least 1")]
    InvalidScale,
    #[error("{0} must be at least 1")]
    ZeroCount(&'static str),
    #[error("no scene is loaded")]
    NoScene,
    #[error("geometry group {index} doesn't exist, there are {count}")]
    UnknownGeometry { index: usize, count: usize },
    #[error("'{name}' has {capacity} primitives, {requested} were requested")]
    PrimitiveCount {
        name: String,
        requested: u32,
        capacity: u32,
    },
    #[error("render targets are not created")]
    MissingRenderTargets,
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum RenderError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("failed to build '{name}'")]
    BuildFailure {
        name: String,
        #[source]
        source: gpu::DeviceError,
    },
    #[error("instance {instance} refers to bottom level structure {blas}, only {count} exist")]
    DanglingReference {
        instance: usize,
        blas: usize,
        count: usize,
    },
    #[error("{user} refers to material {material}, only {count} exist")]
    DanglingMaterial {
        user: MaterialUser,
        material: u32,
        count: usize,
    },
    #[error(transparent)]
    Device(#[from] gpu::DeviceError),
}

/// Holder of a material reference.
#[derive(Clone, Debug, PartialEq)]
pub enum MaterialUser {
    Instance(usize),
    Group(String),
}

impl fmt::Display for MaterialUser {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::Instance(index) => write!(f, "instance {}", index),
            Self::Group(ref name) => write!(f, "geometry group '{}'", name),
        }
    }
}

impl RenderError {
    /// Resource exhaustion, the frame can be retried later.
    pub fn is_transient(&self) -> bool {
        match *self {
            Self::BuildFailure { .. } => true,
            Self::Device(gpu::DeviceError::OutOfMemory { .. }) => true,
            _ => false,
        }
    }

    pub fn is_device_lost(&self) -> bool {
        match *self {
            Self::Device(gpu::DeviceError::Lost) => true,
            Self::BuildFailure {
                source: gpu::DeviceError::Lost,
                ..
            } => true,
            _ => false,
        }
    }
}

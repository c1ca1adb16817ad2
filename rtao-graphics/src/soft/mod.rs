use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    Arc, Mutex,
};

mod accel;
mod command;
mod pipeline;
mod resource;

pub use command::{
    ComputeKernel, KernelOutput, KernelOutputs, LaunchContext, RayTracingBindings, Resources,
};
pub use resource::TexelImage;

use resource::Storage;

/// Software device executing recorded command streams on the CPU.
pub struct Context {
    storage: Mutex<Storage>,
    memory_budget: AtomicU64,
    last_signaled: AtomicU64,
    next_pipeline_id: AtomicU32,
    lost: AtomicBool,
    validation: bool,
    timing: bool,
}

#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub struct Buffer {
    raw: u32,
}

#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub struct Texture {
    raw: u32,
}

#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub struct TextureView {
    raw: u32,
}

#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub struct AccelerationStructure {
    raw: u32,
}

/// Completion marker of a submission. Fence values grow monotonically.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SyncPoint {
    value: u64,
}

impl SyncPoint {
    pub fn value(&self) -> u64 {
        self.value
    }
}

#[derive(Debug)]
pub struct ComputePipeline {
    name: String,
    wg_size: [u32; 3],
}

impl ComputePipeline {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get_workgroup_size(&self) -> [u32; 3] {
        self.wg_size
    }

    pub fn get_dispatch_for(&self, size: crate::Extent) -> [u32; 3] {
        [
            size.width.div_ceil(self.wg_size[0]),
            size.height.div_ceil(self.wg_size[1]),
            size.depth.div_ceil(self.wg_size[2]),
        ]
    }
}

pub struct RayTracingPipeline {
    shared: Arc<pipeline::RayTracingPipelineShared>,
}

enum Command {
    BeginPass(String),
    EndPass,
    InitTexture(Texture),
    Transition {
        texture: Texture,
        state: crate::TextureState,
    },
    FillBuffer {
        dst: crate::BufferPiece,
        size: u64,
        value: u8,
    },
    CopyBufferToBuffer {
        src: crate::BufferPiece,
        dst: crate::BufferPiece,
        size: u64,
    },
    CopyTextureToTexture {
        src: Texture,
        dst: Texture,
    },
    BuildBottomLevel {
        dst: AccelerationStructure,
        geometries: Vec<crate::AccelerationStructureGeometry>,
        scratch: crate::BufferPiece,
        mode: crate::BuildMode,
    },
    BuildTopLevel {
        dst: AccelerationStructure,
        bottom_level: Vec<AccelerationStructure>,
        instance_count: u32,
        instance_data: crate::BufferPiece,
        scratch: crate::BufferPiece,
    },
    Dispatch {
        pipeline: String,
        wg_size: [u32; 3],
        groups: [u32; 3],
        kernel: Arc<dyn ComputeKernel>,
    },
    DispatchRays {
        pipeline: Arc<pipeline::RayTracingPipelineShared>,
        bindings: Arc<RayTracingBindings>,
        desc: crate::DispatchRaysDesc,
    },
}

pub struct CommandEncoder {
    name: String,
    commands: Vec<Command>,
    timings: crate::Timings,
}

pub struct TransferCommandEncoder<'a> {
    commands: &'a mut Vec<Command>,
}

pub struct AccelerationStructureCommandEncoder<'a> {
    commands: &'a mut Vec<Command>,
}

pub struct ComputeCommandEncoder<'a> {
    commands: &'a mut Vec<Command>,
}

pub struct ComputePipelineContext<'a> {
    commands: &'a mut Vec<Command>,
    pipeline: &'a ComputePipeline,
    kernel: Option<Arc<dyn ComputeKernel>>,
}

pub struct RayTracingCommandEncoder<'a> {
    commands: &'a mut Vec<Command>,
}

pub struct RayTracingPipelineContext<'a> {
    commands: &'a mut Vec<Command>,
    pipeline: &'a RayTracingPipeline,
    bindings: Option<Arc<RayTracingBindings>>,
}

impl Context {
    pub fn init(desc: crate::ContextDesc) -> Result<Self, crate::NotSupportedError> {
        if desc.memory_budget == 0 {
            log::error!("Device needs a non-zero memory budget");
            return Err(crate::NotSupportedError);
        }
        log::info!(
            "Initializing software device with {} MB of memory",
            desc.memory_budget >> 20
        );
        Ok(Self {
            storage: Mutex::new(Storage::default()),
            memory_budget: AtomicU64::new(desc.memory_budget),
            last_signaled: AtomicU64::new(0),
            next_pipeline_id: AtomicU32::new(1),
            lost: AtomicBool::new(false),
            validation: desc.validation,
            timing: desc.timing,
        })
    }

    /// Mark the device as lost. All further submissions and allocations fail
    /// until [`Context::recreate`] is called.
    pub fn lose_device(&self) {
        log::error!("Device lost");
        self.lost.store(true, Ordering::Release);
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    /// Bring a lost device back, with every resource of the old one gone.
    pub fn recreate(&self) {
        let mut storage = self.storage.lock().unwrap();
        let leaked = storage.resource_count();
        if leaked != 0 {
            log::warn!("Dropping {} resources of the previous device", leaked);
        }
        *storage = Storage::default();
        self.lost.store(false, Ordering::Release);
        log::info!("Device recreated");
    }

    pub fn memory_budget(&self) -> u64 {
        self.memory_budget.load(Ordering::Acquire)
    }

    /// Change the amount of memory the device may allocate.
    /// Existing allocations are never evicted.
    pub fn set_memory_budget(&self, budget: u64) {
        self.memory_budget.store(budget, Ordering::Release);
    }

    pub fn memory_usage(&self) -> u64 {
        self.storage.lock().unwrap().allocated
    }

    pub fn create_command_encoder(&self, desc: crate::CommandEncoderDesc) -> CommandEncoder {
        log::debug!(
            "Creating command encoder '{}' with {} buffers",
            desc.name,
            desc.buffer_count
        );
        CommandEncoder {
            name: desc.name.to_string(),
            commands: Vec::new(),
            timings: Vec::new(),
        }
    }

    pub fn destroy_command_encoder(&self, encoder: &mut CommandEncoder) {
        encoder.commands.clear();
    }

    /// Execute the recorded stream in order and signal a new fence value.
    #[profiling::function]
    pub fn submit(&self, encoder: &mut CommandEncoder) -> Result<SyncPoint, crate::DeviceError> {
        let commands = std::mem::take(&mut encoder.commands);
        if self.is_lost() {
            return Err(crate::DeviceError::Lost);
        }
        let mut storage = self.storage.lock().unwrap();
        let timings = self.execute(&mut storage, commands)?;
        if self.timing {
            encoder.timings = timings;
        }
        let value = self.last_signaled.fetch_add(1, Ordering::AcqRel) + 1;
        log::trace!("Submitted '{}' as fence value {}", encoder.name, value);
        Ok(SyncPoint { value })
    }

    /// Returns true if the sync point has been reached.
    ///
    /// Submissions complete before `submit` returns, so this never blocks.
    pub fn wait_for(&self, sp: &SyncPoint, _timeout_ms: u32) -> bool {
        sp.value <= self.last_signaled.load(Ordering::Acquire)
    }

    pub fn last_signaled(&self) -> u64 {
        self.last_signaled.load(Ordering::Acquire)
    }
}

impl CommandEncoder {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start(&mut self) {
        self.commands.clear();
    }

    /// Timings of the passes in the last submission of this encoder.
    pub fn timings(&self) -> &crate::Timings {
        &self.timings
    }

    /// Zero-fill a texture and make it usable by the following commands.
    pub fn init_texture(&mut self, texture: Texture) {
        self.commands.push(Command::InitTexture(texture));
    }

    pub fn transition(&mut self, texture: Texture, state: crate::TextureState) {
        self.commands.push(Command::Transition { texture, state });
    }

    pub fn transfer(&mut self, label: &str) -> TransferCommandEncoder {
        self.commands.push(Command::BeginPass(label.to_string()));
        TransferCommandEncoder {
            commands: &mut self.commands,
        }
    }

    pub fn acceleration_structure(&mut self, label: &str) -> AccelerationStructureCommandEncoder {
        self.commands.push(Command::BeginPass(label.to_string()));
        AccelerationStructureCommandEncoder {
            commands: &mut self.commands,
        }
    }

    pub fn compute(&mut self, label: &str) -> ComputeCommandEncoder {
        self.commands.push(Command::BeginPass(label.to_string()));
        ComputeCommandEncoder {
            commands: &mut self.commands,
        }
    }

    pub fn ray_tracing(&mut self, label: &str) -> RayTracingCommandEncoder {
        self.commands.push(Command::BeginPass(label.to_string()));
        RayTracingCommandEncoder {
            commands: &mut self.commands,
        }
    }
}

impl Drop for TransferCommandEncoder<'_> {
    fn drop(&mut self) {
        self.commands.push(Command::EndPass);
    }
}
impl Drop for AccelerationStructureCommandEncoder<'_> {
    fn drop(&mut self) {
        self.commands.push(Command::EndPass);
    }
}
impl Drop for ComputeCommandEncoder<'_> {
    fn drop(&mut self) {
        self.commands.push(Command::EndPass);
    }
}
impl Drop for RayTracingCommandEncoder<'_> {
    fn drop(&mut self) {
        self.commands.push(Command::EndPass);
    }
}

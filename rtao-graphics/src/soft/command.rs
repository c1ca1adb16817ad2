use std::{
    sync::{Arc, Mutex},
    time::Instant,
};

use rayon::prelude::*;

use super::{
    accel::{self, BuiltStructure, TopLevel},
    pipeline::{Export, RayTracingPipelineShared},
    resource::{Storage, TexelImage},
    Command,
};
use crate::{Aabb, ProceduralHit, Ray, RayFlags, RayPayload};

/// Resource written by a compute kernel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum KernelOutput {
    Texture(super::TextureView),
    Buffer(crate::BufferPiece),
}

/// Compute program executed by `dispatch`.
///
/// Outputs are detached from the device for the duration of the dispatch,
/// so a kernel reading one of its own outputs gets `DeviceError::Aliasing`.
pub trait ComputeKernel: Send + Sync {
    fn outputs(&self) -> Vec<KernelOutput>;
    /// `grid` is the number of invocations, workgroup count times workgroup size.
    fn execute(
        &self,
        resources: &Resources,
        outputs: &mut KernelOutputs,
        grid: crate::Extent,
    ) -> Result<(), crate::DeviceError>;
}

/// Read access to the device resources during a dispatch.
pub struct Resources<'a> {
    storage: &'a Storage,
    detached_buffers: Vec<super::Buffer>,
}

impl<'a> Resources<'a> {
    pub fn texture(&self, view: super::TextureView) -> Result<&'a TexelImage, crate::DeviceError> {
        let texture = self.storage.view_texture(view)?;
        readable_image(self.storage, texture)
    }

    pub fn buffer(&self, piece: crate::BufferPiece) -> Result<&'a [u8], crate::DeviceError> {
        if self.detached_buffers.contains(&piece.buffer) {
            let name = self.storage.buffer(piece.buffer)?.name.clone();
            return Err(crate::DeviceError::Aliasing(name));
        }
        self.storage.buffer_bytes(piece)
    }
}

fn readable_image(storage: &Storage, texture: super::Texture) -> Result<&TexelImage, crate::DeviceError> {
    let data = storage.texture(texture)?;
    if data.state != crate::TextureState::Common {
        return Err(crate::DeviceError::InvalidState {
            name: data.name.clone(),
            expected: crate::TextureState::Common,
            actual: data.state,
        });
    }
    data.image
        .as_ref()
        .ok_or_else(|| crate::DeviceError::Aliasing(data.name.clone()))
}

enum Detached {
    Texture {
        texture: super::Texture,
        image: TexelImage,
    },
    Buffer {
        buffer: super::Buffer,
        offset: usize,
        data: Vec<u8>,
    },
}

/// Write access to the outputs of a dispatch, in the order they were declared.
pub struct KernelOutputs {
    detached: Vec<Detached>,
}

impl KernelOutputs {
    pub fn len(&self) -> usize {
        self.detached.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detached.is_empty()
    }

    pub fn texture(&mut self, index: usize) -> &mut TexelImage {
        match self.detached[index] {
            Detached::Texture { ref mut image, .. } => image,
            Detached::Buffer { .. } => panic!("Output {} is not a texture", index),
        }
    }

    pub fn buffer(&mut self, index: usize) -> &mut [u8] {
        match self.detached[index] {
            Detached::Buffer {
                ref mut data,
                offset,
                ..
            } => &mut data[offset..],
            Detached::Texture { .. } => panic!("Output {} is not a buffer", index),
        }
    }
}

fn detach_texture(storage: &mut Storage, texture: super::Texture) -> Result<TexelImage, crate::DeviceError> {
    let data = storage.texture_mut(texture)?;
    if data.state != crate::TextureState::Common {
        return Err(crate::DeviceError::InvalidState {
            name: data.name.clone(),
            expected: crate::TextureState::Common,
            actual: data.state,
        });
    }
    if !data.usage.contains(crate::TextureUsage::STORAGE) {
        log::warn!("Texture '{}' is written without STORAGE usage", data.name);
    }
    data.image
        .take()
        .ok_or_else(|| crate::DeviceError::Aliasing(data.name.clone()))
}

fn detach(
    storage: &mut Storage,
    bindings: &[KernelOutput],
    detached: &mut Vec<Detached>,
) -> Result<(), crate::DeviceError> {
    for binding in bindings {
        match *binding {
            KernelOutput::Texture(view) => {
                let texture = storage.view_texture(view)?;
                let image = detach_texture(storage, texture)?;
                detached.push(Detached::Texture { texture, image });
            }
            KernelOutput::Buffer(piece) => {
                let data = storage.buffer_mut(piece.buffer)?;
                if detached.iter().any(|d| match *d {
                    Detached::Buffer { buffer, .. } => buffer == piece.buffer,
                    Detached::Texture { .. } => false,
                }) {
                    return Err(crate::DeviceError::Aliasing(data.name.clone()));
                }
                if piece.offset as usize > data.data.len() {
                    return Err(crate::DeviceError::InvalidResource("buffer offset"));
                }
                detached.push(Detached::Buffer {
                    buffer: piece.buffer,
                    offset: piece.offset as usize,
                    data: std::mem::take(&mut data.data),
                });
            }
        }
    }
    Ok(())
}

fn reattach(storage: &mut Storage, detached: Vec<Detached>) {
    for item in detached {
        match item {
            Detached::Texture { texture, image } => {
                if let Ok(data) = storage.texture_mut(texture) {
                    data.image = Some(image);
                }
            }
            Detached::Buffer { buffer, data, .. } => {
                if let Ok(target) = storage.buffer_mut(buffer) {
                    target.data = data;
                }
            }
        }
    }
}

/// Resources bound to a ray dispatch.
#[derive(Clone, Debug, Default)]
pub struct RayTracingBindings {
    pub acceleration_structure: super::AccelerationStructure,
    /// Textures readable by the programs, by slot.
    pub inputs: Vec<super::TextureView>,
    /// Buffers readable by the programs, by slot.
    pub buffers: Vec<crate::BufferPiece>,
    /// Textures written by the ray generation program, one value per launch index each.
    pub outputs: Vec<super::TextureView>,
    /// Root constants shared by every program.
    pub constants: Vec<u8>,
}

struct ResolvedRecord<'a> {
    export: Option<&'a Export>,
    local: &'a [u8],
}

fn resolve_table<'a>(
    storage: &'a Storage,
    pipeline: &'a RayTracingPipelineShared,
    region: &crate::ShaderTableRegion,
    category: &'static str,
) -> Result<Vec<ResolvedRecord<'a>>, crate::DeviceError> {
    let count = region.record_count() as usize;
    if count == 0 {
        return Ok(Vec::new());
    }
    let id_size = crate::limits::SHADER_IDENTIFIER_SIZE as u64;
    if region.start.offset % crate::limits::SHADER_TABLE_ALIGNMENT as u64 != 0
        || region.stride % crate::limits::SHADER_RECORD_ALIGNMENT as u64 != 0
        || region.stride < id_size
        || region.stride > crate::limits::MAX_SHADER_RECORD_SIZE as u64
    {
        log::error!("Misaligned {} table: {:?}", category, region);
        return Err(crate::DeviceError::InvalidResource("shader table layout"));
    }
    let bytes = storage.buffer_bytes(region.start)?;
    let stride = region.stride as usize;
    (0..count)
        .map(|i| {
            let record = bytes
                .get(i * stride..(i + 1) * stride)
                .ok_or(crate::DeviceError::InvalidResource("shader table range"))?;
            Ok(ResolvedRecord {
                export: pipeline.resolve(record, category)?,
                local: &record[id_size as usize..],
            })
        })
        .collect()
}

/// State shared by all invocations of a ray dispatch.
pub struct LaunchContext<'a> {
    size: crate::Extent,
    tlas: &'a TopLevel,
    inputs: Vec<&'a TexelImage>,
    buffers: Vec<&'a [u8]>,
    constants: &'a [u8],
    misses: Vec<ResolvedRecord<'a>>,
    hit_groups: Vec<ResolvedRecord<'a>>,
    error: Mutex<Option<crate::DeviceError>>,
}

impl LaunchContext<'_> {
    pub fn size(&self) -> crate::Extent {
        self.size
    }

    pub fn input(&self, slot: usize) -> Option<&TexelImage> {
        self.inputs.get(slot).copied()
    }

    pub fn buffer(&self, slot: usize) -> Option<&[u8]> {
        self.buffers.get(slot).copied()
    }

    pub fn constants(&self) -> &[u8] {
        self.constants
    }

    fn report(&self, error: crate::DeviceError) {
        let mut slot = self.error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    fn hit_group(&self, index: u32) -> Option<&ResolvedRecord<'_>> {
        let record = self.hit_groups.get(index as usize);
        if record.is_none() {
            self.report(crate::DeviceError::ShaderTableOverflow {
                table: "hit group",
                index,
            });
        }
        record
    }

    /// Trace a ray against the bound top level structure.
    ///
    /// The hit group is found at
    /// `ray_contribution + geometry_multiplier * geometry_index + instance.hit_group_offset`.
    pub fn trace_ray(
        &self,
        ray: &Ray,
        flags: RayFlags,
        mask: u32,
        ray_contribution: u32,
        geometry_multiplier: u32,
        miss_index: u32,
    ) -> RayPayload {
        let record_index = |instance_index: u32, geometry_index: u32| {
            ray_contribution
                + geometry_multiplier * geometry_index
                + self.tlas.instance(instance_index).hit_group_offset
        };
        let intersect = |instance_index: u32, geometry_index: u32, object_ray: &Ray, aabb: &Aabb| {
            let record = self.hit_group(record_index(instance_index, geometry_index))?;
            match record.export {
                Some(&Export::HitGroup {
                    intersection: Some(ref program),
                    ..
                }) => program.intersect(object_ray, aabb, record.local),
                _ => None::<ProceduralHit>,
            }
        };

        let mut payload = RayPayload::default();
        match self.tlas.trace(ray, flags, mask, intersect) {
            Some(candidate) => {
                let hit = candidate.attributes;
                payload.hit = true;
                payload.t = hit.t;
                payload.instance_custom_index = hit.instance_custom_index;
                if flags.contains(RayFlags::SKIP_CLOSEST_HIT_SHADER) {
                    return payload;
                }
                let index = record_index(hit.instance_index, hit.geometry_index);
                if let Some(record) = self.hit_group(index) {
                    if let Some(&Export::HitGroup {
                        closest_hit: Some(ref program),
                        ..
                    }) = record.export
                    {
                        program.closest_hit(&hit, record.local, &mut payload);
                    }
                }
            }
            None => match self.misses.get(miss_index as usize) {
                Some(&ResolvedRecord {
                    export: Some(&Export::Miss(ref program)),
                    local,
                }) => program.miss(ray, local, &mut payload),
                Some(_) => {}
                None => self.report(crate::DeviceError::ShaderTableOverflow {
                    table: "miss",
                    index: miss_index,
                }),
            },
        }
        payload
    }
}

impl super::TransferCommandEncoder<'_> {
    pub fn fill_buffer(&mut self, dst: crate::BufferPiece, size: u64, value: u8) {
        self.commands.push(Command::FillBuffer { dst, size, value });
    }

    pub fn copy_buffer_to_buffer(&mut self, src: crate::BufferPiece, dst: crate::BufferPiece, size: u64) {
        self.commands
            .push(Command::CopyBufferToBuffer { src, dst, size });
    }

    /// Copy the whole texture. Requires `CopySource` and `CopyDestination` states.
    pub fn copy_texture_to_texture(&mut self, src: super::Texture, dst: super::Texture) {
        self.commands
            .push(Command::CopyTextureToTexture { src, dst });
    }
}

impl super::AccelerationStructureCommandEncoder<'_> {
    pub fn build_bottom_level(
        &mut self,
        acceleration_structure: super::AccelerationStructure,
        meshes: &[crate::AccelerationStructureGeometry],
        scratch_data: crate::BufferPiece,
    ) {
        self.commands.push(Command::BuildBottomLevel {
            dst: acceleration_structure,
            geometries: meshes.to_vec(),
            scratch: scratch_data,
            mode: crate::BuildMode::Build,
        });
    }

    /// Refit a previously built structure with geometry of the same topology.
    pub fn update_bottom_level(
        &mut self,
        acceleration_structure: super::AccelerationStructure,
        meshes: &[crate::AccelerationStructureGeometry],
        scratch_data: crate::BufferPiece,
    ) {
        self.commands.push(Command::BuildBottomLevel {
            dst: acceleration_structure,
            geometries: meshes.to_vec(),
            scratch: scratch_data,
            mode: crate::BuildMode::Update,
        });
    }

    pub fn build_top_level(
        &mut self,
        acceleration_structure: super::AccelerationStructure,
        bottom_level: &[super::AccelerationStructure],
        instance_count: u32,
        instance_data: crate::BufferPiece,
        scratch_data: crate::BufferPiece,
    ) {
        self.commands.push(Command::BuildTopLevel {
            dst: acceleration_structure,
            bottom_level: bottom_level.to_vec(),
            instance_count,
            instance_data,
            scratch: scratch_data,
        });
    }
}

impl super::ComputeCommandEncoder<'_> {
    pub fn with<'b>(&'b mut self, pipeline: &'b super::ComputePipeline) -> super::ComputePipelineContext<'b> {
        super::ComputePipelineContext {
            commands: &mut *self.commands,
            pipeline,
            kernel: None,
        }
    }
}

impl super::ComputePipelineContext<'_> {
    pub fn bind(&mut self, kernel: impl ComputeKernel + 'static) {
        self.kernel = Some(Arc::new(kernel));
    }

    pub fn dispatch(&mut self, groups: [u32; 3]) {
        let kernel = match self.kernel {
            Some(ref kernel) => Arc::clone(kernel),
            None => panic!("Nothing is bound to '{}'", self.pipeline.name),
        };
        self.commands.push(Command::Dispatch {
            pipeline: self.pipeline.name.clone(),
            wg_size: self.pipeline.wg_size,
            groups,
            kernel,
        });
    }
}

impl super::RayTracingCommandEncoder<'_> {
    pub fn with<'b>(
        &'b mut self,
        pipeline: &'b super::RayTracingPipeline,
    ) -> super::RayTracingPipelineContext<'b> {
        super::RayTracingPipelineContext {
            commands: &mut *self.commands,
            pipeline,
            bindings: None,
        }
    }
}

impl super::RayTracingPipelineContext<'_> {
    pub fn bind(&mut self, bindings: RayTracingBindings) {
        self.bindings = Some(Arc::new(bindings));
    }

    pub fn dispatch_rays(&mut self, desc: crate::DispatchRaysDesc) {
        let bindings = match self.bindings {
            Some(ref bindings) => Arc::clone(bindings),
            None => panic!("Nothing is bound to '{}'", self.pipeline.shared.name),
        };
        self.commands.push(Command::DispatchRays {
            pipeline: Arc::clone(&self.pipeline.shared),
            bindings,
            desc,
        });
    }
}

impl super::Context {
    pub(super) fn execute(
        &self,
        storage: &mut Storage,
        commands: Vec<Command>,
    ) -> Result<crate::Timings, crate::DeviceError> {
        let mut timings = Vec::new();
        let mut pass = None::<(String, Instant)>;
        for command in commands {
            match command {
                Command::BeginPass(label) => pass = Some((label, Instant::now())),
                Command::EndPass => {
                    if let Some((label, start)) = pass.take() {
                        timings.push((label, start.elapsed()));
                    }
                }
                Command::InitTexture(texture) => {
                    let data = storage.texture_mut(texture)?;
                    if let Some(ref mut image) = data.image {
                        image.fill([0.0; 4]);
                    }
                    data.state = crate::TextureState::Common;
                }
                Command::Transition { texture, state } => {
                    let data = storage.texture_mut(texture)?;
                    log::trace!("Texture '{}': {:?} -> {:?}", data.name, data.state, state);
                    data.state = state;
                }
                Command::FillBuffer { dst, size, value } => {
                    let data = &mut storage.buffer_mut(dst.buffer)?.data;
                    let start = dst.offset as usize;
                    data.get_mut(start..start + size as usize)
                        .ok_or(crate::DeviceError::InvalidResource("buffer range"))?
                        .fill(value);
                }
                Command::CopyBufferToBuffer { src, dst, size } => {
                    let bytes = storage
                        .buffer_bytes(src)?
                        .get(..size as usize)
                        .ok_or(crate::DeviceError::InvalidResource("buffer range"))?
                        .to_vec();
                    let data = &mut storage.buffer_mut(dst.buffer)?.data;
                    let start = dst.offset as usize;
                    data.get_mut(start..start + bytes.len())
                        .ok_or(crate::DeviceError::InvalidResource("buffer range"))?
                        .copy_from_slice(&bytes);
                }
                Command::CopyTextureToTexture { src, dst } => {
                    self.copy_texture(storage, src, dst)?;
                }
                Command::BuildBottomLevel {
                    dst,
                    geometries,
                    scratch,
                    mode,
                } => accel::build_bottom_level(storage, dst, &geometries, scratch, mode)?,
                Command::BuildTopLevel {
                    dst,
                    bottom_level,
                    instance_count,
                    instance_data,
                    scratch,
                } => accel::build_top_level(
                    storage,
                    dst,
                    &bottom_level,
                    instance_count,
                    instance_data,
                    scratch,
                )?,
                Command::Dispatch {
                    pipeline,
                    wg_size,
                    groups,
                    kernel,
                } => {
                    profiling::scope!("dispatch");
                    let grid = crate::Extent {
                        width: groups[0] * wg_size[0],
                        height: groups[1] * wg_size[1],
                        depth: groups[2] * wg_size[2],
                    };
                    let mut detached = Vec::new();
                    let result = detach(storage, &kernel.outputs(), &mut detached);
                    let mut outputs = KernelOutputs { detached };
                    let result = result.and_then(|()| {
                        let resources = Resources {
                            storage: &*storage,
                            detached_buffers: outputs
                                .detached
                                .iter()
                                .filter_map(|d| match *d {
                                    Detached::Buffer { buffer, .. } => Some(buffer),
                                    Detached::Texture { .. } => None,
                                })
                                .collect(),
                        };
                        kernel.execute(&resources, &mut outputs, grid)
                    });
                    reattach(storage, outputs.detached);
                    if let Err(ref e) = result {
                        log::error!("Dispatch of '{}' failed: {}", pipeline, e);
                    }
                    result?;
                }
                Command::DispatchRays {
                    pipeline,
                    bindings,
                    desc,
                } => {
                    profiling::scope!("dispatch_rays");
                    let mut detached = Vec::new();
                    let outputs = bindings
                        .outputs
                        .iter()
                        .map(|&view| KernelOutput::Texture(view))
                        .collect::<Vec<_>>();
                    let result = detach(storage, &outputs, &mut detached).and_then(|()| {
                        trace_rays(&*storage, &pipeline, &bindings, &desc, &mut detached)
                    });
                    reattach(storage, detached);
                    if let Err(ref e) = result {
                        log::error!("Ray dispatch of '{}' failed: {}", pipeline.name, e);
                    }
                    result?;
                }
            }
        }
        Ok(timings)
    }

    fn copy_texture(
        &self,
        storage: &mut Storage,
        src: super::Texture,
        dst: super::Texture,
    ) -> Result<(), crate::DeviceError> {
        let source = storage.texture(src)?;
        if source.state != crate::TextureState::CopySource {
            return Err(crate::DeviceError::InvalidState {
                name: source.name.clone(),
                expected: crate::TextureState::CopySource,
                actual: source.state,
            });
        }
        let image = source
            .image
            .clone()
            .ok_or_else(|| crate::DeviceError::Aliasing(source.name.clone()))?;
        let target = storage.texture_mut(dst)?;
        if target.state != crate::TextureState::CopyDestination {
            return Err(crate::DeviceError::InvalidState {
                name: target.name.clone(),
                expected: crate::TextureState::CopyDestination,
                actual: target.state,
            });
        }
        let dst_image = target
            .image
            .as_mut()
            .ok_or(crate::DeviceError::InvalidResource("texture"))?;
        if dst_image.extent() != image.extent() {
            if self.validation {
                log::error!(
                    "Copy into '{}' of {:?} from {:?}",
                    target.name,
                    dst_image.extent(),
                    image.extent()
                );
            }
            return Err(crate::DeviceError::InvalidResource("copy extent"));
        }
        let extent = image.extent();
        for y in 0..extent.height {
            for x in 0..extent.width {
                dst_image.store(x, y, image.load(x, y));
            }
        }
        Ok(())
    }
}

fn trace_rays(
    storage: &Storage,
    pipeline: &RayTracingPipelineShared,
    bindings: &RayTracingBindings,
    desc: &crate::DispatchRaysDesc,
    detached: &mut [Detached],
) -> Result<(), crate::DeviceError> {
    let tlas = match storage.accel(bindings.acceleration_structure)?.built {
        Some(BuiltStructure::Top(ref tlas)) => tlas,
        _ => {
            return Err(crate::DeviceError::InvalidResource(
                "top level acceleration structure",
            ))
        }
    };
    let ray_gen_records = resolve_table(storage, pipeline, &desc.ray_generation, "ray generation")?;
    let (ray_gen, ray_gen_local) = match ray_gen_records.first() {
        Some(&ResolvedRecord {
            export: Some(&Export::RayGeneration(ref program)),
            local,
        }) => (program, local),
        _ => {
            return Err(crate::DeviceError::ShaderTableOverflow {
                table: "ray generation",
                index: 0,
            })
        }
    };
    let inputs = bindings
        .inputs
        .iter()
        .map(|&view| readable_image(storage, storage.view_texture(view)?))
        .collect::<Result<Vec<_>, _>>()?;
    let buffers = bindings
        .buffers
        .iter()
        .map(|&piece| storage.buffer_bytes(piece))
        .collect::<Result<Vec<_>, _>>()?;
    let context = LaunchContext {
        size: desc.size,
        tlas,
        inputs,
        buffers,
        constants: &bindings.constants,
        misses: resolve_table(storage, pipeline, &desc.miss, "miss")?,
        hit_groups: resolve_table(storage, pipeline, &desc.hit_group, "hit group")?,
        error: Mutex::new(None),
    };

    let output_count = detached.len();
    let width = desc.size.width as usize;
    let rows = (0..desc.size.height)
        .into_par_iter()
        .map(|y| {
            let mut row = vec![[0.0f32; 4]; width * output_count];
            let mut scratch = [[0.0f32; 4]; 0];
            for x in 0..width {
                let values = if output_count == 0 {
                    &mut scratch[..]
                } else {
                    &mut row[x * output_count..(x + 1) * output_count]
                };
                ray_gen.ray_gen(&context, [x as u32, y], ray_gen_local, values);
            }
            row
        })
        .collect::<Vec<_>>();
    if let Some(error) = context.error.into_inner().unwrap() {
        return Err(error);
    }

    for (k, item) in detached.iter_mut().enumerate() {
        let image = match *item {
            Detached::Texture { ref mut image, .. } => image,
            Detached::Buffer { .. } => continue,
        };
        let extent = image.extent();
        for (y, row) in rows.iter().enumerate().take(extent.height as usize) {
            for x in 0..width.min(extent.width as usize) {
                image.store(x as u32, y as u32, row[x * output_count + k]);
            }
        }
    }
    Ok(())
}

//! Bottom and top level acceleration structures over the scene.
//!
//! Every geometry group gets one bottom level structure, shared by all
//! instances of the group. The top level structure is created anew every
//! frame from the instance table, and the previous one is retired through
//! the frame resources.

use crate::{
    raytrace::RAY_TYPE_COUNT,
    scene::{GeometryInstance, GeometryType, SceneGeometry},
    util::EnumKey as _,
    ConfigurationError, FrameResources, MaterialUser, RenderError,
};
use rtao_graphics as gpu;

/// Largest number of bottom level structures in a scene.
pub const MAX_BLAS: usize = 1000;

/// When to rebuild a bottom level structure instead of refitting it.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RebuildPolicy {
    /// Rebuild after this many consecutive refits. `None` refits forever.
    pub max_refits: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildKind {
    Rebuild,
    Refit,
}

/// Outcome of a frame update of the acceleration structures.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BuildReport {
    pub rebuilt: Vec<usize>,
    pub refit: Vec<usize>,
    pub instance_count: u32,
}

pub struct BottomLevelStructure {
    pub name: String,
    pub geometry_type: GeometryType,
    /// Material of the geometry group, in the deduplicated table.
    pub material: u32,
    raw: gpu::AccelerationStructure,
    sizes: gpu::AccelerationStructureSizes,
    geometry: gpu::AccelerationStructureGeometry,
    /// Primitive count of the last build.
    built_primitive_count: u32,
    /// Primitives uploaded for the group, the structure is sized for all of them.
    capacity: u32,
    is_built: bool,
    frames_since_build: u32,
}

impl BottomLevelStructure {
    pub fn raw(&self) -> gpu::AccelerationStructure {
        self.raw
    }

    pub fn is_built(&self) -> bool {
        self.is_built
    }

    pub fn frames_since_build(&self) -> u32 {
        self.frames_since_build
    }

    pub fn primitive_count(&self) -> u32 {
        self.geometry.primitive_count()
    }

    fn topology_changed(&self) -> bool {
        self.geometry.primitive_count() != self.built_primitive_count
    }

    fn choose(&self, force_rebuild: bool, policy: RebuildPolicy) -> BuildKind {
        let expired = match policy.max_refits {
            Some(limit) => self.frames_since_build >= limit,
            None => false,
        };
        if force_rebuild || !self.is_built || self.topology_changed() || expired {
            BuildKind::Rebuild
        } else {
            BuildKind::Refit
        }
    }
}

/// Resources created by a build that are released if a later step fails.
#[derive(Default)]
struct Allocations {
    buffers: Vec<gpu::Buffer>,
    acceleration_structures: Vec<gpu::AccelerationStructure>,
}

impl Allocations {
    fn buffer(
        &mut self,
        gpu: &gpu::Context,
        name: &str,
        size: u64,
        memory: gpu::Memory,
    ) -> Result<gpu::Buffer, RenderError> {
        let buffer = gpu
            .create_buffer(gpu::BufferDesc { name, size, memory })
            .map_err(|source| RenderError::BuildFailure {
                name: name.to_string(),
                source,
            })?;
        self.buffers.push(buffer);
        Ok(buffer)
    }

    fn acceleration_structure(
        &mut self,
        gpu: &gpu::Context,
        desc: gpu::AccelerationStructureDesc,
    ) -> Result<gpu::AccelerationStructure, RenderError> {
        let name = desc.name.to_string();
        let accel = gpu
            .create_acceleration_structure(desc)
            .map_err(|source| RenderError::BuildFailure { name, source })?;
        self.acceleration_structures.push(accel);
        Ok(accel)
    }

    fn release(self, gpu: &gpu::Context) {
        for buffer in self.buffers {
            gpu.destroy_buffer(buffer);
        }
        for accel in self.acceleration_structures {
            gpu.destroy_acceleration_structure(accel);
        }
    }
}

#[derive(Default)]
pub struct AccelerationStructureManager {
    bottom_level: Vec<BottomLevelStructure>,
    instances: Vec<GeometryInstance>,
    top_level: Option<gpu::AccelerationStructure>,
    top_level_sizes: gpu::AccelerationStructureSizes,
    top_instance_count: u32,
    material_remap: Vec<u32>,
    policy: RebuildPolicy,
}

impl AccelerationStructureManager {
    pub fn new(policy: RebuildPolicy) -> Self {
        Self {
            policy,
            ..Default::default()
        }
    }

    pub fn policy(&self) -> RebuildPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: RebuildPolicy) {
        self.policy = policy;
    }

    /// Release every structure right away.
    pub fn destroy(&mut self, gpu: &gpu::Context) {
        for blas in self.bottom_level.drain(..) {
            gpu.destroy_acceleration_structure(blas.raw);
        }
        if let Some(tlas) = self.top_level.take() {
            gpu.destroy_acceleration_structure(tlas);
        }
        self.top_instance_count = 0;
    }

    fn retire(&mut self, temp: &mut FrameResources) {
        for blas in self.bottom_level.drain(..) {
            temp.acceleration_structures.push(blas.raw);
        }
        temp.acceleration_structures.extend(self.top_level.take());
        self.top_instance_count = 0;
    }

    /// Create and build one bottom level structure per geometry group.
    ///
    /// Either every structure is allocated and its build recorded,
    /// or nothing is: on failure all allocations made so far are released
    /// and no structure is left marked as built.
    #[profiling::function]
    pub fn initialize_structures(
        &mut self,
        gpu: &gpu::Context,
        encoder: &mut gpu::CommandEncoder,
        temp: &mut FrameResources,
        geometry: &SceneGeometry,
    ) -> Result<(), RenderError> {
        if geometry.groups.len() > MAX_BLAS {
            return Err(ConfigurationError::TooManyBlas(geometry.groups.len()).into());
        }
        self.retire(temp);

        let mut allocations = Allocations::default();
        let mut structures = Vec::with_capacity(geometry.groups.len());
        let mut scratches = Vec::with_capacity(geometry.groups.len());
        for group in geometry.groups.iter() {
            let sizes = gpu.get_bottom_level_acceleration_structure_sizes(&[group.desc]);
            let result = allocations
                .acceleration_structure(
                    gpu,
                    gpu::AccelerationStructureDesc {
                        name: &group.name,
                        ty: gpu::AccelerationStructureType::BottomLevel,
                        size: sizes.data,
                        flags: gpu::AccelerationStructureFlags::PREFER_FAST_TRACE
                            | gpu::AccelerationStructureFlags::ALLOW_UPDATE,
                    },
                )
                .and_then(|raw| {
                    let scratch = allocations.buffer(
                        gpu,
                        &format!("{} scratch", group.name),
                        sizes.scratch,
                        gpu::Memory::Device,
                    )?;
                    Ok((raw, scratch))
                });
            let (raw, scratch) = match result {
                Ok(pair) => pair,
                Err(e) => {
                    log::error!("Bottom level initialization failed: {}", e);
                    allocations.release(gpu);
                    return Err(e);
                }
            };
            scratches.push(scratch);
            structures.push(BottomLevelStructure {
                name: group.name.clone(),
                geometry_type: group.geometry_type,
                material: group.material,
                raw,
                sizes,
                geometry: group.desc,
                built_primitive_count: 0,
                capacity: group.desc.primitive_count(),
                is_built: false,
                frames_since_build: 0,
            });
        }

        if let mut pass = encoder.acceleration_structure("blas-init") {
            for (blas, &scratch) in structures.iter_mut().zip(scratches.iter()) {
                pass.build_bottom_level(blas.raw, &[blas.geometry], scratch.into());
                blas.is_built = true;
                blas.built_primitive_count = blas.geometry.primitive_count();
            }
        }
        temp.buffers.extend(scratches);
        log::info!(
            "Initialized {} bottom level structures, {} bytes",
            structures.len(),
            structures.iter().map(|s| s.sizes.data).sum::<u64>()
        );
        self.bottom_level = structures;
        self.material_remap = geometry.material_remap.clone();
        Ok(())
    }

    /// Limit a bottom level structure to the first `count` primitives of its group.
    /// A different count changes the topology, so the next update rebuilds it.
    pub fn set_primitive_count(&mut self, index: usize, count: u32) -> Result<(), ConfigurationError> {
        let total = self.bottom_level.len();
        let blas = self
            .bottom_level
            .get_mut(index)
            .ok_or(ConfigurationError::UnknownGeometry { index, count: total })?;
        if count > blas.capacity {
            return Err(ConfigurationError::PrimitiveCount {
                name: blas.name.clone(),
                requested: count,
                capacity: blas.capacity,
            });
        }
        blas.geometry = blas.geometry.with_primitive_count(count);
        if blas.topology_changed() {
            log::debug!("Topology of '{}' changed to {} primitives", blas.name, count);
        }
        Ok(())
    }

    /// Replace the instance table. Geometry is untouched.
    pub fn update_instance_transforms(&mut self, instances: &[GeometryInstance]) {
        self.instances.clear();
        self.instances.extend_from_slice(instances);
    }

    /// Move the instances of one geometry group to new transforms, in order.
    pub fn set_group_transforms(&mut self, blas: usize, transforms: &[gpu::Transform]) {
        let mut transforms = transforms.iter();
        for instance in self.instances.iter_mut().filter(|i| i.blas == blas) {
            match transforms.next() {
                Some(&transform) => instance.transform = transform,
                None => break,
            }
        }
    }

    pub fn instances(&self) -> &[GeometryInstance] {
        &self.instances
    }

    fn validate_instances(&self) -> Result<(), RenderError> {
        for (index, instance) in self.instances.iter().enumerate() {
            if instance.blas >= self.bottom_level.len() {
                log::error!("Instance {} has a dangling reference", index);
                return Err(RenderError::DanglingReference {
                    instance: index,
                    blas: instance.blas,
                    count: self.bottom_level.len(),
                });
            }
            if let Some(material) = instance.material {
                if material as usize >= self.material_remap.len() {
                    log::error!("Instance {} has a dangling material", index);
                    return Err(RenderError::DanglingMaterial {
                        user: MaterialUser::Instance(index),
                        material,
                        count: self.material_remap.len(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Rebuild or refit every bottom level structure, then build a new top level one.
    ///
    /// Nothing is recorded and no state changes unless every allocation succeeds.
    #[profiling::function]
    pub fn rebuild_or_refit(
        &mut self,
        gpu: &gpu::Context,
        encoder: &mut gpu::CommandEncoder,
        temp: &mut FrameResources,
        force_rebuild: bool,
    ) -> Result<BuildReport, RenderError> {
        self.validate_instances()?;

        let mut allocations = Allocations::default();
        let mut plan = Vec::with_capacity(self.bottom_level.len());
        let mut report = BuildReport::default();
        let result = (|| {
            for (index, blas) in self.bottom_level.iter().enumerate() {
                let kind = blas.choose(force_rebuild, self.policy);
                let sizes = gpu.get_bottom_level_acceleration_structure_sizes(&[blas.geometry]);
                if sizes.data > blas.sizes.data {
                    return Err(RenderError::BuildFailure {
                        name: blas.name.clone(),
                        source: gpu::DeviceError::OutOfMemory {
                            name: blas.name.clone(),
                            requested: sizes.data,
                            available: blas.sizes.data,
                        },
                    });
                }
                let scratch = allocations.buffer(
                    gpu,
                    &format!("{} scratch", blas.name),
                    sizes.scratch,
                    gpu::Memory::Device,
                )?;
                plan.push((index, kind, scratch));
            }

            let instance_count = self.instances.len() as u32;
            let sizes = gpu.get_top_level_acceleration_structure_sizes(instance_count);
            let tlas = allocations.acceleration_structure(
                gpu,
                gpu::AccelerationStructureDesc {
                    name: "tlas",
                    ty: gpu::AccelerationStructureType::TopLevel,
                    size: sizes.data,
                    flags: gpu::AccelerationStructureFlags::PREFER_FAST_TRACE,
                },
            )?;
            let instances = self
                .instances
                .iter()
                .map(|instance| gpu::AccelerationStructureInstance {
                    acceleration_structure_index: instance.blas as u32,
                    transform: instance.transform,
                    mask: instance.mask as u32,
                    custom_index: match instance.material {
                        Some(m) => self.material_remap[m as usize],
                        None => self.bottom_level[instance.blas].material,
                    },
                    hit_group_offset: hit_group_offset(
                        self.bottom_level[instance.blas].geometry_type,
                    ),
                })
                .collect::<Vec<_>>();
            let instance_buf = gpu
                .create_acceleration_structure_instance_buffer(&instances)
                .map_err(|source| RenderError::BuildFailure {
                    name: "instances".to_string(),
                    source,
                })?;
            allocations.buffers.push(instance_buf);
            let scratch = allocations.buffer(gpu, "tlas scratch", sizes.scratch, gpu::Memory::Device)?;
            Ok((tlas, sizes, instance_buf, scratch))
        })();
        let (tlas, tlas_sizes, instance_buf, tlas_scratch) = match result {
            Ok(pieces) => pieces,
            Err(e) => {
                log::warn!("Acceleration structure update skipped: {}", e);
                allocations.release(gpu);
                return Err(e);
            }
        };

        if !plan.is_empty() {
            let mut pass = encoder.acceleration_structure("blas");
            for &(index, kind, scratch) in plan.iter() {
                let blas = &mut self.bottom_level[index];
                match kind {
                    BuildKind::Rebuild => {
                        pass.build_bottom_level(blas.raw, &[blas.geometry], scratch.into());
                        blas.frames_since_build = 0;
                        blas.built_primitive_count = blas.geometry.primitive_count();
                        blas.is_built = true;
                        report.rebuilt.push(index);
                    }
                    BuildKind::Refit => {
                        assert!(blas.is_built, "Refit of '{}' before its first build", blas.name);
                        pass.update_bottom_level(blas.raw, &[blas.geometry], scratch.into());
                        blas.frames_since_build += 1;
                        report.refit.push(index);
                    }
                }
            }
        }

        let blas_handles = self.bottom_level.iter().map(|b| b.raw).collect::<Vec<_>>();
        if let mut pass = encoder.acceleration_structure("tlas") {
            pass.build_top_level(
                tlas,
                &blas_handles,
                self.instances.len() as u32,
                instance_buf.into(),
                tlas_scratch.into(),
            );
        }

        temp.acceleration_structures.extend(self.top_level.replace(tlas));
        temp.buffers.extend(allocations.buffers);
        self.top_level_sizes = tlas_sizes;
        self.top_instance_count = self.instances.len() as u32;
        report.instance_count = self.top_instance_count;
        log::trace!("Acceleration structures updated: {:?}", report);
        Ok(report)
    }

    pub fn top_level(&self) -> Option<gpu::AccelerationStructure> {
        self.top_level
    }

    pub fn top_level_instance_count(&self) -> u32 {
        self.top_instance_count
    }

    pub fn bottom_level(&self) -> &[BottomLevelStructure] {
        &self.bottom_level
    }

    /// Set of geometry types present in the bottom level structures, as a bit mask.
    pub fn geometry_type_mask(&self) -> u32 {
        self.bottom_level
            .iter()
            .fold(0, |mask, blas| mask | 1 << blas.geometry_type.index())
    }

    /// Bytes held by the built structures. Diagnostic only.
    pub fn memory_footprint(&self) -> u64 {
        let bottom = self.bottom_level.iter().map(|b| b.sizes.data).sum::<u64>();
        let top = match self.top_level {
            Some(_) => self.top_level_sizes.data,
            None => 0,
        };
        bottom + top
    }

    /// Largest number of frames any structure went without a rebuild.
    pub fn frames_since_build(&self) -> u32 {
        self.bottom_level
            .iter()
            .map(|b| b.frames_since_build)
            .max()
            .unwrap_or(0)
    }
}

/// Offset of the hit group records of a geometry type in the hit group table.
pub fn hit_group_offset(geometry_type: GeometryType) -> u32 {
    RAY_TYPE_COUNT * geometry_type.index() as u32
}

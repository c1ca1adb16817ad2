use std::sync::{atomic::Ordering, Arc};

use crate::{ClosestHitProgram, IntersectionProgram, MissProgram, RayGenProgram, ShaderIdentifier};

pub(super) enum Export {
    RayGeneration(Arc<dyn RayGenProgram>),
    Miss(Arc<dyn MissProgram>),
    HitGroup {
        closest_hit: Option<Arc<dyn ClosestHitProgram>>,
        intersection: Option<Arc<dyn IntersectionProgram>>,
    },
}

impl Export {
    fn category(&self) -> &'static str {
        match *self {
            Self::RayGeneration(_) => "ray generation",
            Self::Miss(_) => "miss",
            Self::HitGroup { .. } => "hit group",
        }
    }
}

pub(super) struct RayTracingPipelineShared {
    pub id: u32,
    pub name: String,
    pub exports: Vec<(String, Export)>,
}

impl RayTracingPipelineShared {
    fn identifier(&self, export_index: usize) -> ShaderIdentifier {
        let mut bytes = [0; crate::limits::SHADER_IDENTIFIER_SIZE as usize];
        bytes[..4].copy_from_slice(&self.id.to_le_bytes());
        bytes[4..8].copy_from_slice(&(export_index as u32 + 1).to_le_bytes());
        ShaderIdentifier(bytes)
    }

    /// Resolve the identifier at the start of a shader record.
    /// A zeroed identifier is a null record and resolves to `None`.
    pub fn resolve(
        &self,
        record: &[u8],
        category: &'static str,
    ) -> Result<Option<&Export>, crate::DeviceError> {
        let id_size = crate::limits::SHADER_IDENTIFIER_SIZE as usize;
        let unknown = || crate::DeviceError::UnknownShaderIdentifier(self.name.clone());
        let id = record.get(..id_size).ok_or_else(unknown)?;
        if id.iter().all(|&b| b == 0) {
            return Ok(None);
        }
        let pipeline_id = bytemuck::pod_read_unaligned::<u32>(&id[..4]);
        let export_index = bytemuck::pod_read_unaligned::<u32>(&id[4..8]);
        if pipeline_id != self.id || export_index == 0 {
            return Err(unknown());
        }
        let (_, ref export) = *self
            .exports
            .get(export_index as usize - 1)
            .ok_or_else(unknown)?;
        if export.category() != category {
            log::error!(
                "Record of a {} program found in the {} table",
                export.category(),
                category
            );
            return Err(unknown());
        }
        Ok(Some(export))
    }
}

impl super::RayTracingPipeline {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Identifier of the named export, to be placed at the start of its shader record.
    pub fn shader_identifier(&self, name: &str) -> Option<ShaderIdentifier> {
        self.shared
            .exports
            .iter()
            .position(|&(ref export_name, _)| export_name == name)
            .map(|index| self.shared.identifier(index))
    }
}

impl super::Context {
    pub fn create_compute_pipeline(&self, desc: crate::ComputePipelineDesc) -> super::ComputePipeline {
        assert!(
            desc.workgroup_size.iter().all(|&size| size != 0),
            "Empty workgroup in '{}'",
            desc.name
        );
        super::ComputePipeline {
            name: desc.name.to_string(),
            wg_size: desc.workgroup_size,
        }
    }

    pub fn destroy_compute_pipeline(&self, _pipeline: &mut super::ComputePipeline) {}

    pub fn create_ray_tracing_pipeline(
        &self,
        desc: crate::RayTracingPipelineDesc,
    ) -> super::RayTracingPipeline {
        assert!(
            desc.max_recursion_depth <= crate::limits::MAX_RECURSION_DEPTH,
            "Recursion depth {} of '{}' is not supported",
            desc.max_recursion_depth,
            desc.name
        );
        let mut exports = Vec::new();
        for &(name, ref program) in desc.ray_generation {
            exports.push((name.to_string(), Export::RayGeneration(Arc::clone(program))));
        }
        for &(name, ref program) in desc.miss {
            exports.push((name.to_string(), Export::Miss(Arc::clone(program))));
        }
        for group in desc.hit_groups {
            exports.push((
                group.name.to_string(),
                Export::HitGroup {
                    closest_hit: group.closest_hit.clone(),
                    intersection: group.intersection.clone(),
                },
            ));
        }
        if self.validation {
            for (i, &(ref name, _)) in exports.iter().enumerate() {
                if exports[..i].iter().any(|&(ref other, _)| other == name) {
                    log::warn!("Duplicate export '{}' in pipeline '{}'", name, desc.name);
                }
            }
        }
        let id = self.next_pipeline_id.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "Created ray tracing pipeline '{}' with {} exports",
            desc.name,
            exports.len()
        );
        super::RayTracingPipeline {
            shared: Arc::new(RayTracingPipelineShared {
                id,
                name: desc.name.to_string(),
                exports,
            }),
        }
    }

    pub fn destroy_ray_tracing_pipeline(&self, _pipeline: &mut super::RayTracingPipeline) {}
}

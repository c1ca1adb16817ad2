use crate::{MaterialUser, RenderError};
use rtao_graphics as gpu;
use std::collections::HashMap;

/// Geometry groups of the fixed scene topology.
#[derive(
    Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, strum::EnumIter, strum::EnumCount,
)]
pub enum GeometryType {
    Triangles,
    Procedural,
}

crate::util::impl_enum_key!(GeometryType);

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Zeroable, bytemuck::Pod)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
}

#[derive(Clone, Debug, PartialEq)]
pub enum GeometryKind {
    Triangles {
        vertices: Vec<Vertex>,
        indices: Vec<u32>,
    },
    /// Every box bounds one analytic sphere.
    Procedural { aabbs: Vec<gpu::Aabb> },
}

#[derive(Clone, Debug)]
pub struct GeometryGroup {
    pub name: String,
    pub kind: GeometryKind,
    /// Index into `SceneDescription::materials`.
    pub material: u32,
}

impl GeometryGroup {
    pub fn geometry_type(&self) -> GeometryType {
        match self.kind {
            GeometryKind::Triangles { .. } => GeometryType::Triangles,
            GeometryKind::Procedural { .. } => GeometryType::Procedural,
        }
    }

    pub fn primitive_count(&self) -> u32 {
        match self.kind {
            GeometryKind::Triangles { ref indices, .. } => indices.len() as u32 / 3,
            GeometryKind::Procedural { ref aabbs } => aabbs.len() as u32,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq)]
pub enum MaterialType {
    #[default]
    Default,
    Matte,
    Mirror,
    AnalyticalCheckerboardTexture,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Material {
    pub albedo: [f32; 3],
    pub roughness: f32,
    pub reflectance: f32,
    pub ty: MaterialType,
}

impl Default for Material {
    fn default() -> Self {
        Self {
            albedo: [0.75; 3],
            roughness: 1.0,
            reflectance: 0.0,
            ty: MaterialType::Default,
        }
    }
}

impl Material {
    fn key(&self) -> ([u32; 5], MaterialType) {
        (
            [
                self.albedo[0].to_bits(),
                self.albedo[1].to_bits(),
                self.albedo[2].to_bits(),
                self.roughness.to_bits(),
                self.reflectance.to_bits(),
            ],
            self.ty,
        )
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, bytemuck::Zeroable, bytemuck::Pod)]
pub(crate) struct GpuMaterial {
    pub albedo: [f32; 3],
    pub roughness: f32,
    pub reflectance: f32,
    pub ty: u32,
    pub pad: [u32; 2],
}

/// Content addressed table of unique materials.
///
/// Materials are keyed by the bit patterns of their fields, so equal
/// materials share one index and `-0.0` differs from `0.0`.
#[derive(Debug, Default)]
pub struct MaterialTable {
    materials: Vec<Material>,
    lookup: HashMap<([u32; 5], MaterialType), u32>,
}

impl MaterialTable {
    pub fn insert(&mut self, material: Material) -> u32 {
        let next = self.materials.len() as u32;
        let index = *self.lookup.entry(material.key()).or_insert(next);
        if index == next {
            self.materials.push(material);
        }
        index
    }

    pub fn len(&self) -> usize {
        self.materials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.materials.is_empty()
    }

    pub fn get(&self, index: u32) -> Option<&Material> {
        self.materials.get(index as usize)
    }

    pub(crate) fn gpu_data(&self) -> Vec<GpuMaterial> {
        self.materials
            .iter()
            .map(|m| GpuMaterial {
                albedo: m.albedo,
                roughness: m.roughness,
                reflectance: m.reflectance,
                ty: m.ty as u32,
                pad: [0; 2],
            })
            .collect()
    }
}

/// Placement of one geometry group in the world.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GeometryInstance {
    /// Index of the bottom level structure, one per geometry group.
    pub blas: usize,
    pub transform: gpu::Transform,
    /// Material override, an index into `SceneDescription::materials`.
    /// Instances without one use the material of their geometry group.
    pub material: Option<u32>,
    pub mask: u8,
}

#[derive(Clone, Debug)]
pub struct SceneDescription {
    pub geometry_groups: Vec<GeometryGroup>,
    pub materials: Vec<Material>,
    /// Radiance of the environment, seen by camera rays that miss.
    pub environment: [f32; 3],
    /// Direction towards the light.
    pub light_direction: mint::Vector3<f32>,
    pub instances: Vec<GeometryInstance>,
}

/// Transforms laying `count` instances on a square grid in the XZ plane,
/// bobbing up and down with `time`.
pub fn grid_transforms(count: usize, spacing: f32, time: f32) -> Vec<gpu::Transform> {
    let side = (count as f32).sqrt().ceil().max(1.0) as usize;
    let half = (side as f32 - 1.0) * spacing * 0.5;
    (0..count)
        .map(|i| {
            let (x, z) = ((i % side) as f32, (i / side) as f32);
            let phase = time + 0.5 * (x + z);
            let translation = glam::Vec3::new(x * spacing - half, 0.25 * phase.sin(), z * spacing - half);
            gpu::transform_from_affine(&glam::Affine3A::from_translation(translation))
        })
        .collect()
}

/// Transforms spreading `count` instances over a sphere of `radius`,
/// rotating about the vertical axis with `time`.
pub fn sphere_transforms(count: usize, radius: f32, time: f32) -> Vec<gpu::Transform> {
    let golden_angle = std::f32::consts::PI * (3.0 - 5f32.sqrt());
    (0..count)
        .map(|i| {
            let y = 1.0 - 2.0 * (i as f32 + 0.5) / count as f32;
            let ring = (1.0 - y * y).max(0.0).sqrt();
            let theta = golden_angle * i as f32 + time;
            let position = glam::Vec3::new(theta.cos() * ring, y, theta.sin() * ring) * radius;
            let rotation = glam::Quat::from_rotation_arc(glam::Vec3::Y, position.normalize_or_zero());
            gpu::transform_from_affine(&glam::Affine3A::from_rotation_translation(rotation, position))
        })
        .collect()
}

pub(crate) struct GeometryBuffers {
    pub name: String,
    pub geometry_type: GeometryType,
    pub material: u32,
    pub desc: gpu::AccelerationStructureGeometry,
    buffers: Vec<gpu::Buffer>,
}

/// Device copies of the scene geometry and materials.
pub struct SceneGeometry {
    pub(crate) groups: Vec<GeometryBuffers>,
    pub(crate) material_buffer: gpu::Buffer,
    materials: MaterialTable,
    /// Scene material index to deduplicated table index.
    pub(crate) material_remap: Vec<u32>,
    pub environment: [f32; 3],
    pub light_direction: glam::Vec3,
}

fn upload<T: bytemuck::Pod>(
    gpu: &gpu::Context,
    name: &str,
    data: &[T],
    buffers: &mut Vec<gpu::Buffer>,
) -> Result<gpu::Buffer, gpu::DeviceError> {
    let bytes = bytemuck::cast_slice::<T, u8>(data);
    let buffer = gpu.create_buffer(gpu::BufferDesc {
        name,
        size: bytes.len().max(4) as u64,
        memory: gpu::Memory::Shared,
    })?;
    buffers.push(buffer);
    gpu.write_buffer(buffer.into(), bytes)?;
    Ok(buffer)
}

impl SceneGeometry {
    #[profiling::function]
    pub fn upload(gpu: &gpu::Context, desc: &SceneDescription) -> Result<Self, RenderError> {
        let mut materials = MaterialTable::default();
        let mut remap = desc
            .materials
            .iter()
            .map(|&m| materials.insert(m))
            .collect::<Vec<_>>();
        if remap.is_empty() {
            // scenes without materials use the default one
            remap.push(materials.insert(Material::default()));
        }
        for group in desc.geometry_groups.iter() {
            if group.material as usize >= remap.len() {
                log::error!("Geometry group '{}' has a dangling material", group.name);
                return Err(RenderError::DanglingMaterial {
                    user: MaterialUser::Group(group.name.clone()),
                    material: group.material,
                    count: remap.len(),
                });
            }
        }

        let mut groups = Vec::with_capacity(desc.geometry_groups.len());
        let mut created = Vec::new();
        let result = (|| {
            for group in desc.geometry_groups.iter() {
                let mut buffers = Vec::new();
                let geometry = match group.kind {
                    GeometryKind::Triangles {
                        ref vertices,
                        ref indices,
                    } => {
                        let vertex_buf = upload(gpu, &format!("{}/vertices", group.name), vertices, &mut buffers);
                        created.extend_from_slice(&buffers);
                        let vertex_buf = vertex_buf?;
                        let index_buf = upload(gpu, &format!("{}/indices", group.name), indices, &mut buffers);
                        created.extend_from_slice(&buffers[1..]);
                        let index_buf = index_buf?;
                        gpu::AccelerationStructureGeometry::Triangles {
                            vertex_data: vertex_buf.into(),
                            vertex_stride: std::mem::size_of::<Vertex>() as u32,
                            vertex_count: vertices.len() as u32,
                            index_data: Some(index_buf.into()),
                            triangle_count: indices.len() as u32 / 3,
                            is_opaque: true,
                        }
                    }
                    GeometryKind::Procedural { ref aabbs } => {
                        let raw = aabbs
                            .iter()
                            .map(|aabb| [aabb.min.to_array(), aabb.max.to_array()])
                            .collect::<Vec<_>>();
                        let aabb_buf = upload(gpu, &format!("{}/aabbs", group.name), &raw, &mut buffers);
                        created.extend_from_slice(&buffers);
                        gpu::AccelerationStructureGeometry::Aabbs {
                            aabb_data: aabb_buf?.into(),
                            aabb_stride: 24,
                            aabb_count: aabbs.len() as u32,
                            is_opaque: true,
                        }
                    }
                };
                let material = remap[group.material as usize];
                groups.push(GeometryBuffers {
                    name: group.name.clone(),
                    geometry_type: group.geometry_type(),
                    material,
                    desc: geometry,
                    buffers,
                });
            }
            let mut material_buffers = Vec::new();
            let material_buffer = upload(gpu, "materials", &materials.gpu_data(), &mut material_buffers);
            created.extend_from_slice(&material_buffers);
            material_buffer
        })();

        match result {
            Ok(material_buffer) => {
                log::info!(
                    "Uploaded {} geometry groups with {} unique materials",
                    groups.len(),
                    materials.len()
                );
                Ok(Self {
                    groups,
                    material_buffer,
                    materials,
                    material_remap: remap,
                    environment: desc.environment,
                    light_direction: glam::Vec3::from(desc.light_direction).normalize_or_zero(),
                })
            }
            Err(e) => {
                for buffer in created {
                    gpu.destroy_buffer(buffer);
                }
                Err(e.into())
            }
        }
    }

    pub fn destroy(&mut self, gpu: &gpu::Context) {
        for group in self.groups.drain(..) {
            for buffer in group.buffers {
                gpu.destroy_buffer(buffer);
            }
        }
        gpu.destroy_buffer(self.material_buffer);
    }

    pub fn materials(&self) -> &MaterialTable {
        &self.materials
    }

    /// Table index of a scene material.
    pub fn material_index(&self, scene_material: u32) -> Option<u32> {
        self.material_remap.get(scene_material as usize).copied()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn geometry_types(&self) -> Vec<GeometryType> {
        let mut types = self.groups.iter().map(|g| g.geometry_type).collect::<Vec<_>>();
        types.sort();
        types.dedup();
        types
    }

    /// Index of the first geometry group of the given type.
    pub fn blas_index(&self, geometry_type: GeometryType) -> Option<usize> {
        self.groups.iter().position(|g| g.geometry_type == geometry_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn material_dedup() {
        let mut table = MaterialTable::default();
        let red = Material {
            albedo: [1.0, 0.0, 0.0],
            ..Default::default()
        };
        let a = table.insert(red);
        let b = table.insert(Material::default());
        let c = table.insert(red);
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
        let mirror = Material {
            ty: MaterialType::Mirror,
            ..red
        };
        assert_eq!(table.insert(mirror), 2);
    }

    #[test]
    fn procedural_kinds_compare_by_bounds() {
        let unit = |r: f32| GeometryKind::Procedural {
            aabbs: vec![gpu::Aabb {
                min: glam::Vec3::splat(-r),
                max: glam::Vec3::splat(r),
            }],
        };
        assert_eq!(unit(0.5), unit(0.5));
        assert_ne!(unit(0.5), unit(1.0));
    }

    #[test]
    fn grid_layout() {
        let transforms = grid_transforms(4, 2.0, 0.0);
        assert_eq!(transforms.len(), 4);
        // 2x2 grid centered on the origin
        assert_eq!(transforms[0].x.w, -1.0);
        assert_eq!(transforms[3].z.w, 1.0);
    }

    #[test]
    fn sphere_layout() {
        for t in sphere_transforms(16, 3.0, 0.7) {
            let position = glam::Vec3::new(t.x.w, t.y.w, t.z.w);
            assert!((position.length() - 3.0).abs() < 1e-4);
        }
    }
}

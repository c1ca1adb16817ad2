//! Ray dispatch stage: the ray tracing pipeline, its shader tables,
//! and the G-buffer, visibility and ambient occlusion passes.

use std::sync::Arc;

use crate::{
    resources::{AoResource, GBufferResource, Resolution, ResourcePool},
    scene::GeometryType,
    shader_table::{ShaderTable, ShaderTableEntry},
    util::{read_pod, EnumArray, EnumKey as _},
    ConfigurationError, FrameResources, RenderError,
};
use rtao_graphics as gpu;
use strum::IntoEnumIterator as _;

/// Ray types with a hit group record per geometry type.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, strum::EnumIter, strum::EnumCount)]
pub enum RayType {
    Radiance,
    Shadow,
}

pub const RAY_TYPE_COUNT: u32 = <RayType as strum::EnumCount>::COUNT as u32;

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, strum::EnumIter, strum::EnumCount)]
pub enum RayGenKind {
    GBuffer,
    Visibility,
    AmbientOcclusion,
}

crate::util::impl_enum_key!(RayType, RayGenKind);

impl RayGenKind {
    pub fn export_name(self) -> &'static str {
        match self {
            Self::GBuffer => "gbuffer",
            Self::Visibility => "visibility",
            Self::AmbientOcclusion => "ambient-occlusion",
        }
    }
}

fn hit_group_name(geometry_type: GeometryType, ray_type: RayType) -> &'static str {
    match (geometry_type, ray_type) {
        (GeometryType::Triangles, RayType::Radiance) => "triangle-radiance",
        (GeometryType::Triangles, RayType::Shadow) => "triangle-shadow",
        (GeometryType::Procedural, RayType::Radiance) => "sphere-radiance",
        (GeometryType::Procedural, RayType::Shadow) => "sphere-shadow",
    }
}

const RADIANCE_MISS: &str = "radiance-miss";
const SHADOW_MISS: &str = "shadow-miss";

/// Offset of surface points along the normal before tracing secondary rays.
const SURFACE_OFFSET: f32 = 1e-3;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Zeroable, bytemuck::Pod)]
pub struct SceneConstants {
    pub camera_position: [f32; 3],
    pub near: f32,
    pub camera_orientation: [f32; 4],
    /// Tangents of the half field of view, horizontal and vertical.
    pub tan_half_fov: [f32; 2],
    pub far: f32,
    pub ao_radius: f32,
    pub light_direction: [f32; 3],
    pub t_min: f32,
    pub target_size: [u32; 2],
    pub samples_per_set: u32,
    pub sample_set_count: u32,
    pub frame_index: u32,
    pub pad: [u32; 3],
}

impl SceneConstants {
    pub fn new(
        camera: &crate::Camera,
        target_size: gpu::Extent,
        light_direction: glam::Vec3,
        ray_config: &RayConfig,
        frame_index: u32,
    ) -> Self {
        let aspect = target_size.width as f32 / target_size.height.max(1) as f32;
        let tan_y = (0.5 * camera.fov_y).tan();
        Self {
            camera_position: camera.position.into(),
            near: camera.near,
            camera_orientation: camera.orientation.into(),
            tan_half_fov: [tan_y * aspect, tan_y],
            far: camera.far,
            ao_radius: ray_config.ao_radius,
            light_direction: light_direction.into(),
            t_min: ray_config.t_min,
            target_size: [target_size.width, target_size.height],
            samples_per_set: ray_config.samples_per_pixel,
            sample_set_count: ray_config.sample_set_count,
            frame_index,
            pad: [0; 3],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RayConfig {
    /// Ambient occlusion rays per pixel.
    pub samples_per_pixel: u32,
    /// Number of sample sets, picked per pixel and frame.
    pub sample_set_count: u32,
    pub ao_radius: f32,
    pub t_min: f32,
    pub seed: u64,
}

impl Default for RayConfig {
    fn default() -> Self {
        Self {
            samples_per_pixel: 4,
            sample_set_count: 8,
            ao_radius: 2.0,
            t_min: 1e-3,
            seed: 0,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, bytemuck::Zeroable, bytemuck::Pod)]
struct MissArgs {
    environment: [f32; 4],
}

// Buffer slots of the ray dispatches.
const CONSTANTS_SLOT: usize = 0;
const MATERIALS_SLOT: usize = 1;
const HEMISPHERE_SLOT: usize = 2;
// Input slots of the secondary ray dispatches.
const POSITION_SLOT: usize = 0;
const NORMAL_DEPTH_SLOT: usize = 1;

fn constants(context: &gpu::LaunchContext<'_>) -> SceneConstants {
    context
        .buffer(CONSTANTS_SLOT)
        .and_then(|bytes| read_pod(bytes, 0))
        .unwrap_or_default()
}

/// Integer hash spreading pixel coordinates over sample sets.
fn hash_pixel(x: u32, y: u32) -> u32 {
    let mut h = x.wrapping_mul(0x8da6_b343) ^ y.wrapping_mul(0xd816_3841);
    h ^= h >> 16;
    h = h.wrapping_mul(0x7feb_352d);
    h ^= h >> 15;
    h
}

struct GBufferRayGen;

impl gpu::RayGenProgram for GBufferRayGen {
    fn ray_gen(
        &self,
        context: &gpu::LaunchContext<'_>,
        index: [u32; 2],
        _record: &[u8],
        outputs: &mut [[f32; 4]],
    ) {
        let sc = constants(context);
        let size = context.size();
        let ndc = glam::Vec2::new(
            (index[0] as f32 + 0.5) / size.width as f32 * 2.0 - 1.0,
            1.0 - (index[1] as f32 + 0.5) / size.height as f32 * 2.0,
        );
        let local = glam::Vec3::new(ndc.x * sc.tan_half_fov[0], ndc.y * sc.tan_half_fov[1], -1.0);
        let orientation = glam::Quat::from_array(sc.camera_orientation);
        let ray = gpu::Ray {
            origin: sc.camera_position.into(),
            t_min: sc.near,
            direction: (orientation * local).normalize(),
            t_max: sc.far,
        };
        let payload = context.trace_ray(
            &ray,
            gpu::RayFlags::empty(),
            !0,
            RayType::Radiance as u32,
            RAY_TYPE_COUNT,
            RayType::Radiance as u32,
        );
        if payload.hit {
            let albedo = context
                .buffer(MATERIALS_SLOT)
                .and_then(|bytes| read_pod::<crate::scene::GpuMaterial>(bytes, payload.material_id as usize))
                .map_or([0.0; 3], |m| m.albedo);
            let p = payload.position;
            let n = payload.normal;
            outputs[GBufferResource::Position as usize] = [p.x, p.y, p.z, 1.0];
            outputs[GBufferResource::NormalDepth as usize] = [n.x, n.y, n.z, payload.t];
            outputs[GBufferResource::MaterialId as usize] = [payload.material_id as f32, 0.0, 0.0, 0.0];
            outputs[GBufferResource::Albedo as usize] = [albedo[0], albedo[1], albedo[2], 1.0];
        } else {
            // the miss program leaves the environment radiance in `position`
            let env = payload.position;
            outputs[GBufferResource::Position as usize] = [0.0; 4];
            outputs[GBufferResource::NormalDepth as usize] = [0.0; 4];
            outputs[GBufferResource::MaterialId as usize] = [0.0; 4];
            outputs[GBufferResource::Albedo as usize] = [env.x, env.y, env.z, 0.0];
        }
    }
}

/// Surface point of a G-buffer texel, if the camera ray hit anything.
fn surface(context: &gpu::LaunchContext<'_>, index: [u32; 2]) -> Option<(glam::Vec3, glam::Vec3)> {
    let position = context.input(POSITION_SLOT)?.load(index[0], index[1]);
    if position[3] == 0.0 {
        return None;
    }
    let normal = context.input(NORMAL_DEPTH_SLOT)?.load(index[0], index[1]);
    Some((
        glam::Vec3::new(position[0], position[1], position[2]),
        glam::Vec3::new(normal[0], normal[1], normal[2]),
    ))
}

fn shadow_ray(context: &gpu::LaunchContext<'_>, ray: &gpu::Ray) -> bool {
    let payload = context.trace_ray(
        ray,
        gpu::RayFlags::ACCEPT_FIRST_HIT_AND_END_SEARCH | gpu::RayFlags::SKIP_CLOSEST_HIT_SHADER,
        !0,
        RayType::Shadow as u32,
        RAY_TYPE_COUNT,
        RayType::Shadow as u32,
    );
    payload.hit
}

struct VisibilityRayGen;

impl gpu::RayGenProgram for VisibilityRayGen {
    fn ray_gen(
        &self,
        context: &gpu::LaunchContext<'_>,
        index: [u32; 2],
        _record: &[u8],
        outputs: &mut [[f32; 4]],
    ) {
        let (position, normal) = match surface(context, index) {
            Some(surface) => surface,
            None => {
                outputs[0] = [1.0, 0.0, 0.0, 0.0];
                return;
            }
        };
        let sc = constants(context);
        let ray = gpu::Ray {
            origin: position + normal * SURFACE_OFFSET,
            t_min: sc.t_min,
            direction: glam::Vec3::from(sc.light_direction),
            t_max: sc.far,
        };
        let visible = !shadow_ray(context, &ray);
        outputs[0] = [if visible { 1.0 } else { 0.0 }, 0.0, 0.0, 0.0];
    }
}

struct AmbientOcclusionRayGen;

impl gpu::RayGenProgram for AmbientOcclusionRayGen {
    fn ray_gen(
        &self,
        context: &gpu::LaunchContext<'_>,
        index: [u32; 2],
        _record: &[u8],
        outputs: &mut [[f32; 4]],
    ) {
        let (position, normal) = match surface(context, index) {
            Some(surface) => surface,
            None => {
                outputs[0] = [1.0, 0.0, 0.0, 0.0];
                outputs[1] = [0.0; 4];
                return;
            }
        };
        let sc = constants(context);
        let samples = match context.buffer(HEMISPHERE_SLOT) {
            Some(bytes) if sc.samples_per_set != 0 => bytes,
            _ => {
                outputs[0] = [1.0, 0.0, 0.0, 0.0];
                outputs[1] = [0.0; 4];
                return;
            }
        };
        let set = hash_pixel(index[0], index[1]).wrapping_add(sc.frame_index) % sc.sample_set_count.max(1);
        let (tangent, bitangent) = normal.any_orthonormal_pair();
        let mut hits = 0u32;
        for k in 0..sc.samples_per_set {
            let sample_index = (set * sc.samples_per_set + k) as usize;
            let s = match read_pod::<[f32; 4]>(samples, sample_index) {
                Some(s) => s,
                None => break,
            };
            let ray = gpu::Ray {
                origin: position + normal * SURFACE_OFFSET,
                t_min: sc.t_min,
                direction: tangent * s[0] + bitangent * s[1] + normal * s[2],
                t_max: sc.ao_radius,
            };
            if shadow_ray(context, &ray) {
                hits += 1;
            }
        }
        let coefficient = 1.0 - hits as f32 / sc.samples_per_set as f32;
        outputs[0] = [coefficient, 0.0, 0.0, 0.0];
        outputs[1] = [hits as f32, 0.0, 0.0, 0.0];
    }
}

/// Closest hit of both triangles and spheres: world space surface
/// with the normal facing the incoming ray. The instance custom index is the material.
struct SurfaceClosestHit;

impl gpu::ClosestHitProgram for SurfaceClosestHit {
    fn closest_hit(&self, hit: &gpu::HitAttributes, _record: &[u8], payload: &mut gpu::RayPayload) {
        let mut normal = hit.world_normal();
        if normal.dot(hit.world_ray.direction) > 0.0 {
            normal = -normal;
        }
        payload.position = hit.world_position();
        payload.normal = normal;
        payload.material_id = hit.instance_custom_index;
    }
}

/// Analytic sphere inscribed into the primitive box.
struct SphereIntersection;

impl gpu::IntersectionProgram for SphereIntersection {
    fn intersect(&self, ray: &gpu::Ray, aabb: &gpu::Aabb, _record: &[u8]) -> Option<gpu::ProceduralHit> {
        let center = aabb.center();
        let radius = 0.5 * (aabb.max - aabb.min).min_element();
        let oc = ray.origin - center;
        let a = ray.direction.length_squared();
        let b = oc.dot(ray.direction);
        let c = oc.length_squared() - radius * radius;
        let discriminant = b * b - a * c;
        if discriminant < 0.0 || a == 0.0 {
            return None;
        }
        let root = discriminant.sqrt();
        let near = (-b - root) / a;
        let far = (-b + root) / a;
        let t = if near >= ray.t_min { near } else { far };
        if t < ray.t_min || t > ray.t_max {
            return None;
        }
        Some(gpu::ProceduralHit {
            t,
            normal: (ray.at(t) - center) / radius,
        })
    }
}

struct RadianceMiss;

impl gpu::MissProgram for RadianceMiss {
    fn miss(&self, _ray: &gpu::Ray, record: &[u8], payload: &mut gpu::RayPayload) {
        let args = read_pod::<MissArgs>(record, 0).unwrap_or_default();
        payload.hit = false;
        payload.t = 0.0;
        payload.position = glam::Vec3::new(args.environment[0], args.environment[1], args.environment[2]);
    }
}

struct ShadowMiss;

impl gpu::MissProgram for ShadowMiss {
    fn miss(&self, _ray: &gpu::Ray, _record: &[u8], payload: &mut gpu::RayPayload) {
        payload.hit = false;
    }
}

struct ShaderTables {
    ray_gen: EnumArray<RayGenKind, ShaderTable>,
    miss: ShaderTable,
    hit_group: ShaderTable,
    /// Mask of the geometry types with active hit groups.
    key: u32,
}

impl ShaderTables {
    fn tables(&self) -> impl Iterator<Item = &ShaderTable> {
        self.ray_gen
            .values()
            .chain(Some(&self.miss))
            .chain(Some(&self.hit_group))
    }
}

/// Resources read by the ray dispatches of a frame.
#[derive(Clone, Copy, Debug)]
pub struct DispatchInputs {
    pub acceleration_structure: Option<gpu::AccelerationStructure>,
    pub constants: gpu::BufferPiece,
    pub materials: gpu::BufferPiece,
    pub hemisphere_samples: Option<gpu::BufferPiece>,
    /// Geometry types present in the acceleration structures.
    pub geometry_mask: u32,
}

pub struct RayTracer {
    pipeline: gpu::RayTracingPipeline,
    tables: Option<ShaderTables>,
}

impl RayTracer {
    pub fn new(gpu: &gpu::Context) -> Self {
        let surface_hit: Arc<dyn gpu::ClosestHitProgram> = Arc::new(SurfaceClosestHit);
        let sphere: Arc<dyn gpu::IntersectionProgram> = Arc::new(SphereIntersection);
        let hit_groups = GeometryType::iter()
            .flat_map(|gt| RayType::iter().map(move |rt| (gt, rt)))
            .map(|(gt, rt)| gpu::HitGroupDesc {
                name: hit_group_name(gt, rt),
                closest_hit: match rt {
                    RayType::Radiance => Some(Arc::clone(&surface_hit)),
                    RayType::Shadow => None,
                },
                intersection: match gt {
                    GeometryType::Triangles => None,
                    GeometryType::Procedural => Some(Arc::clone(&sphere)),
                },
            })
            .collect::<Vec<_>>();
        let ray_generation: [(&str, Arc<dyn gpu::RayGenProgram>); 3] = [
            (RayGenKind::GBuffer.export_name(), Arc::new(GBufferRayGen)),
            (RayGenKind::Visibility.export_name(), Arc::new(VisibilityRayGen)),
            (
                RayGenKind::AmbientOcclusion.export_name(),
                Arc::new(AmbientOcclusionRayGen),
            ),
        ];
        let miss: [(&str, Arc<dyn gpu::MissProgram>); 2] = [
            (RADIANCE_MISS, Arc::new(RadianceMiss)),
            (SHADOW_MISS, Arc::new(ShadowMiss)),
        ];
        let pipeline = gpu.create_ray_tracing_pipeline(gpu::RayTracingPipelineDesc {
            name: "ambient-occlusion",
            ray_generation: &ray_generation,
            miss: &miss,
            hit_groups: &hit_groups,
            max_recursion_depth: 1,
        });
        Self {
            pipeline,
            tables: None,
        }
    }

    pub fn destroy(&mut self, gpu: &gpu::Context) {
        if let Some(tables) = self.tables.take() {
            for table in tables.tables() {
                table.destroy(gpu);
            }
        }
        gpu.destroy_ray_tracing_pipeline(&mut self.pipeline);
    }

    /// Build every shader table for the geometry types in `geometry_mask`.
    ///
    /// Hit group records are laid out per geometry type and ray type in a fixed
    /// order, inactive types get null records, so offsets never move.
    #[profiling::function]
    pub fn build_shader_tables(
        &mut self,
        gpu: &gpu::Context,
        temp: &mut FrameResources,
        geometry_mask: u32,
        environment: [f32; 3],
    ) -> Result<(), RenderError> {
        let mut built = Vec::new();
        let result = self.create_tables(gpu, geometry_mask, environment, &mut built);
        match result {
            Ok(tables) => {
                if let Some(old) = self.tables.replace(tables) {
                    temp.buffers.extend(old.tables().map(ShaderTable::buffer));
                }
                log::info!("Built shader tables for geometry mask {:#b}", geometry_mask);
                Ok(())
            }
            Err(e) => {
                for buffer in built {
                    gpu.destroy_buffer(buffer);
                }
                Err(e)
            }
        }
    }

    fn create_tables(
        &self,
        gpu: &gpu::Context,
        geometry_mask: u32,
        environment: [f32; 3],
        built: &mut Vec<gpu::Buffer>,
    ) -> Result<ShaderTables, RenderError> {
        let mut keep = |table: ShaderTable| {
            built.push(table.buffer());
            table
        };
        let ray_gen = EnumArray::try_from_fn(|kind: RayGenKind| {
            ShaderTable::build(
                gpu,
                &self.pipeline,
                &format!("{}-raygen", kind.export_name()),
                &[ShaderTableEntry::program(kind.export_name(), &[])],
            )
            .map(&mut keep)
        })
        .map_err(|(_, e)| e)?;

        let env = MissArgs {
            environment: [environment[0], environment[1], environment[2], 1.0],
        };
        let miss = keep(ShaderTable::build(
            gpu,
            &self.pipeline,
            "miss",
            &[
                ShaderTableEntry::program(RADIANCE_MISS, bytemuck::bytes_of(&env)),
                ShaderTableEntry::program(SHADOW_MISS, &[]),
            ],
        )?);

        let mut entries = Vec::new();
        for gt in GeometryType::iter() {
            for rt in RayType::iter() {
                entries.push(if geometry_mask & (1 << gt.index()) != 0 {
                    ShaderTableEntry::program(hit_group_name(gt, rt), &[])
                } else {
                    ShaderTableEntry::Null
                });
            }
        }
        let hit_group = keep(ShaderTable::build(gpu, &self.pipeline, "hit-group", &entries)?);
        Ok(ShaderTables {
            ray_gen,
            miss,
            hit_group,
            key: geometry_mask,
        })
    }

    pub fn shader_tables_key(&self) -> Option<u32> {
        self.tables.as_ref().map(|t| t.key)
    }

    pub fn hit_group_table(&self) -> Option<&ShaderTable> {
        self.tables.as_ref().map(|t| &t.hit_group)
    }

    pub fn miss_table(&self) -> Option<&ShaderTable> {
        self.tables.as_ref().map(|t| &t.miss)
    }

    fn checked_tables(&self, geometry_mask: u32) -> Result<&ShaderTables, ConfigurationError> {
        let tables = self
            .tables
            .as_ref()
            .ok_or(ConfigurationError::MissingShaderTables)?;
        if tables.key != geometry_mask {
            return Err(ConfigurationError::StaleShaderTables {
                built: tables.key,
                current: geometry_mask,
            });
        }
        Ok(tables)
    }

    /// Launch `kind` once per texel of `size`.
    pub fn dispatch(
        &self,
        encoder: &mut gpu::CommandEncoder,
        kind: RayGenKind,
        bindings: gpu::RayTracingBindings,
        size: gpu::Extent,
        geometry_mask: u32,
    ) -> Result<(), RenderError> {
        let tables = self.checked_tables(geometry_mask)?;
        let desc = gpu::DispatchRaysDesc {
            ray_generation: tables.ray_gen[kind].region(),
            miss: tables.miss.region(),
            hit_group: tables.hit_group.region(),
            size,
        };
        if let mut pass = encoder.ray_tracing(kind.export_name()) {
            let mut pc = pass.with(&self.pipeline);
            pc.bind(bindings);
            pc.dispatch_rays(desc);
        }
        Ok(())
    }

    /// Trace camera rays into the G-buffer at raytracing resolution.
    #[profiling::function]
    pub fn generate_gbuffer(
        &self,
        encoder: &mut gpu::CommandEncoder,
        pool: &ResourcePool,
        inputs: &DispatchInputs,
    ) -> Result<(), RenderError> {
        let tlas = inputs
            .acceleration_structure
            .ok_or(ConfigurationError::MissingTopLevel)?;
        let outputs = [
            GBufferResource::Position,
            GBufferResource::NormalDepth,
            GBufferResource::MaterialId,
            GBufferResource::Albedo,
        ]
        .iter()
        .map(|&res| pool.gbuffer(Resolution::Raytracing, res).view(0))
        .collect();
        let bindings = gpu::RayTracingBindings {
            acceleration_structure: tlas,
            inputs: Vec::new(),
            buffers: vec![inputs.constants, inputs.materials],
            outputs,
            constants: Vec::new(),
        };
        let size = pool.extent(Resolution::Raytracing);
        self.dispatch(encoder, RayGenKind::GBuffer, bindings, size, inputs.geometry_mask)
    }

    /// Trace shadow rays from the G-buffer surface towards the light.
    #[profiling::function]
    pub fn calculate_visibility(
        &self,
        encoder: &mut gpu::CommandEncoder,
        pool: &ResourcePool,
        inputs: &DispatchInputs,
    ) -> Result<(), RenderError> {
        let tlas = inputs
            .acceleration_structure
            .ok_or(ConfigurationError::MissingTopLevel)?;
        let bindings = gpu::RayTracingBindings {
            acceleration_structure: tlas,
            inputs: gbuffer_inputs(pool),
            buffers: vec![inputs.constants],
            outputs: vec![pool.ao(AoResource::Visibility).view(0)],
            constants: Vec::new(),
        };
        let size = pool.extent(Resolution::Raytracing);
        self.dispatch(encoder, RayGenKind::Visibility, bindings, size, inputs.geometry_mask)
    }

    /// Trace cosine distributed occlusion rays of limited length around every surface point.
    #[profiling::function]
    pub fn calculate_ambient_occlusion(
        &self,
        encoder: &mut gpu::CommandEncoder,
        pool: &ResourcePool,
        inputs: &DispatchInputs,
    ) -> Result<(), RenderError> {
        let tlas = inputs
            .acceleration_structure
            .ok_or(ConfigurationError::MissingTopLevel)?;
        let mut buffers = vec![inputs.constants, inputs.materials];
        buffers.extend(inputs.hemisphere_samples);
        let bindings = gpu::RayTracingBindings {
            acceleration_structure: tlas,
            inputs: gbuffer_inputs(pool),
            buffers,
            outputs: vec![
                pool.ao(AoResource::Coefficient).view(0),
                pool.ao(AoResource::HitCount).view(0),
            ],
            constants: Vec::new(),
        };
        let size = pool.extent(Resolution::Raytracing);
        self.dispatch(
            encoder,
            RayGenKind::AmbientOcclusion,
            bindings,
            size,
            inputs.geometry_mask,
        )
    }
}

fn gbuffer_inputs(pool: &ResourcePool) -> Vec<gpu::TextureView> {
    vec![
        pool.gbuffer(Resolution::Raytracing, GBufferResource::Position).view(0),
        pool.gbuffer(Resolution::Raytracing, GBufferResource::NormalDepth).view(0),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpu::IntersectionProgram as _;

    #[test]
    fn sphere_inside_box() {
        let aabb = gpu::Aabb {
            min: glam::Vec3::splat(-1.0),
            max: glam::Vec3::splat(1.0),
        };
        let ray = gpu::Ray {
            origin: glam::Vec3::new(0.0, 0.0, 5.0),
            t_min: 0.0,
            direction: glam::Vec3::NEG_Z,
            t_max: 100.0,
        };
        let hit = SphereIntersection.intersect(&ray, &aabb, &[]).unwrap();
        assert!((hit.t - 4.0).abs() < 1e-5);
        assert!((hit.normal - glam::Vec3::Z).length() < 1e-5);
        // grazing the box corner misses the sphere
        let corner = gpu::Ray {
            origin: glam::Vec3::new(0.95, 0.95, 5.0),
            ..ray
        };
        assert!(SphereIntersection.intersect(&corner, &aabb, &[]).is_none());
    }

    #[test]
    fn constants_layout() {
        assert_eq!(std::mem::size_of::<SceneConstants>(), 96);
        assert!(std::mem::size_of::<SceneConstants>() as u64 <= crate::resources::SCENE_CONSTANTS_SIZE);
    }
}

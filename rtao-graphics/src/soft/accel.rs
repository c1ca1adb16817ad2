use std::{ops::ControlFlow, sync::Arc};

use glam::{Affine3A, Vec3};

use super::resource::Storage;
use crate::{Aabb, HitKind, ProceduralHit, Ray, RayFlags};

const HEADER_SIZE: u64 = 256;
const NODE_SIZE: u64 = 32;
const PRIMITIVE_SIZE: u64 = 48;
const SCRATCH_PER_PRIMITIVE: u64 = 24;
const INSTANCE_SIZE: u64 = std::mem::size_of::<RawInstance>() as u64;

const BINS: usize = 16;
const MAX_LEAF_SIZE: u32 = 4;
const MAX_STACK_DEPTH: usize = 64;

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct RawInstance {
    transform: [[f32; 4]; 3],
    custom_index: u32,
    mask: u32,
    hit_group_offset: u32,
    acceleration_structure_index: u32,
}

#[derive(Clone, Copy, Debug, Default)]
struct BvhNode {
    aabb: Aabb,
    /// First primitive for leaves, left child for inner nodes.
    left_first: u32,
    /// Number of primitives, zero for inner nodes.
    count: u32,
}

/// Bounding volume hierarchy over an indexed list of boxes.
#[derive(Debug, Default)]
pub(super) struct Bvh {
    nodes: Vec<BvhNode>,
    indices: Vec<u32>,
}

#[derive(Clone, Copy, Default)]
struct Bin {
    bounds: Aabb,
    count: u32,
}

impl Bvh {
    /// Binned SAH build. Children are always stored after their parent.
    pub fn build(boxes: &[Aabb]) -> Self {
        let mut bvh = Self {
            nodes: Vec::with_capacity(boxes.len() * 2),
            indices: (0..boxes.len() as u32).collect(),
        };
        if boxes.is_empty() {
            return bvh;
        }
        let centers = boxes.iter().map(Aabb::center).collect::<Vec<_>>();
        bvh.nodes.push(BvhNode {
            aabb: Aabb::EMPTY,
            left_first: 0,
            count: boxes.len() as u32,
        });
        let mut pending = vec![0usize];
        while let Some(node_index) = pending.pop() {
            bvh.update_bounds(node_index, boxes);
            if let Some((left, right)) = bvh.subdivide(node_index, boxes, &centers) {
                pending.push(left);
                pending.push(right);
            }
        }
        bvh
    }

    fn update_bounds(&mut self, node_index: usize, boxes: &[Aabb]) {
        let node = self.nodes[node_index];
        let first = node.left_first as usize;
        let aabb = self.indices[first..first + node.count as usize]
            .iter()
            .fold(Aabb::EMPTY, |acc, &i| acc.union(&boxes[i as usize]));
        self.nodes[node_index].aabb = aabb;
    }

    fn subdivide(
        &mut self,
        node_index: usize,
        boxes: &[Aabb],
        centers: &[Vec3],
    ) -> Option<(usize, usize)> {
        let node = self.nodes[node_index];
        if node.count <= MAX_LEAF_SIZE {
            return None;
        }
        let first = node.left_first as usize;
        let count = node.count as usize;

        let mut centroid_bounds = Aabb::EMPTY;
        for &i in &self.indices[first..first + count] {
            centroid_bounds.grow(centers[i as usize]);
        }
        let extent = centroid_bounds.max - centroid_bounds.min;
        let axis = if extent.x >= extent.y && extent.x >= extent.z {
            0
        } else if extent.y >= extent.z {
            1
        } else {
            2
        };
        let split_len = extent[axis];
        if split_len < 1e-6 {
            return None;
        }
        let split_min = centroid_bounds.min[axis];
        let scale = BINS as f32 / split_len;
        let bin_index = |value: f32| (((value - split_min) * scale) as usize).min(BINS - 1);

        let mut bins = [Bin::default(); BINS];
        for &i in &self.indices[first..first + count] {
            let bin = &mut bins[bin_index(centers[i as usize][axis])];
            bin.count += 1;
            bin.bounds = bin.bounds.union(&boxes[i as usize]);
        }

        let mut left_area = [0.0; BINS];
        let mut left_count = [0; BINS];
        let mut bounds = Aabb::EMPTY;
        let mut sum = 0;
        for i in 0..BINS {
            sum += bins[i].count;
            bounds = bounds.union(&bins[i].bounds);
            left_area[i] = bounds.area();
            left_count[i] = sum;
        }
        let mut best_cost = node.aabb.area() * node.count as f32;
        let mut best_split = None;
        bounds = Aabb::EMPTY;
        sum = 0;
        for i in (1..BINS).rev() {
            sum += bins[i].count;
            bounds = bounds.union(&bins[i].bounds);
            if sum == 0 || left_count[i - 1] == 0 {
                continue;
            }
            let cost = left_area[i - 1] * left_count[i - 1] as f32 + bounds.area() * sum as f32;
            if cost < best_cost {
                best_cost = cost;
                best_split = Some(i - 1);
            }
        }
        let split = best_split?;

        let slice = &mut self.indices[first..first + count];
        let mut left = 0;
        for j in 0..slice.len() {
            if bin_index(centers[slice[j] as usize][axis]) <= split {
                slice.swap(left, j);
                left += 1;
            }
        }
        if left == 0 || left == count {
            return None;
        }

        let left_index = self.nodes.len();
        self.nodes.push(BvhNode {
            aabb: Aabb::EMPTY,
            left_first: first as u32,
            count: left as u32,
        });
        self.nodes.push(BvhNode {
            aabb: Aabb::EMPTY,
            left_first: (first + left) as u32,
            count: (count - left) as u32,
        });
        self.nodes[node_index].left_first = left_index as u32;
        self.nodes[node_index].count = 0;
        Some((left_index, left_index + 1))
    }

    /// Recompute bounds bottom-up, keeping the topology.
    pub fn refit(&mut self, boxes: &[Aabb]) {
        for node_index in (0..self.nodes.len()).rev() {
            let node = self.nodes[node_index];
            if node.count != 0 {
                self.update_bounds(node_index, boxes);
            } else {
                let left = self.nodes[node.left_first as usize].aabb;
                let right = self.nodes[node.left_first as usize + 1].aabb;
                self.nodes[node_index].aabb = left.union(&right);
            }
        }
    }

    pub fn bounds(&self) -> Aabb {
        self.nodes.first().map_or(Aabb::EMPTY, |node| node.aabb)
    }

    /// Visit the primitives whose boxes overlap the ray, nearest nodes first.
    /// The visitor may shrink `t_max` to prune the remaining search.
    pub fn traverse(
        &self,
        ray: &Ray,
        t_max: &mut f32,
        mut visit: impl FnMut(u32, &mut f32) -> ControlFlow<()>,
    ) -> ControlFlow<()> {
        if self.nodes.is_empty() {
            return ControlFlow::Continue(());
        }
        let inv_direction = ray.direction.recip();
        let overlap = |aabb: &Aabb, t_max: f32| {
            aabb.intersect(&Ray { t_max, ..*ray }, inv_direction)
        };
        let mut stack = Vec::with_capacity(MAX_STACK_DEPTH);
        if overlap(&self.nodes[0].aabb, *t_max).is_some() {
            stack.push(0u32);
        }
        while let Some(node_index) = stack.pop() {
            let node = self.nodes[node_index as usize];
            if node.count != 0 {
                let first = node.left_first as usize;
                for &prim in &self.indices[first..first + node.count as usize] {
                    visit(prim, t_max)?;
                }
                continue;
            }
            let (a, b) = (node.left_first, node.left_first + 1);
            let ta = overlap(&self.nodes[a as usize].aabb, *t_max);
            let tb = overlap(&self.nodes[b as usize].aabb, *t_max);
            match (ta, tb) {
                (Some(ta), Some(tb)) => {
                    // nearest on top
                    if ta <= tb {
                        stack.push(b);
                        stack.push(a);
                    } else {
                        stack.push(a);
                        stack.push(b);
                    }
                }
                (Some(_), None) => stack.push(a),
                (None, Some(_)) => stack.push(b),
                (None, None) => {}
            }
        }
        ControlFlow::Continue(())
    }
}

pub(super) enum GeometryData {
    Triangles { triangles: Vec<[Vec3; 3]> },
    Aabbs { boxes: Vec<Aabb> },
}

impl GeometryData {
    fn primitive_count(&self) -> usize {
        match *self {
            Self::Triangles { ref triangles } => triangles.len(),
            Self::Aabbs { ref boxes } => boxes.len(),
        }
    }

    fn primitive_bounds(&self, index: usize) -> Aabb {
        match *self {
            Self::Triangles { ref triangles } => Aabb::from_points(&triangles[index]),
            Self::Aabbs { ref boxes } => boxes[index],
        }
    }
}

pub(super) struct BottomLevel {
    geometries: Vec<GeometryData>,
    /// Geometry and primitive index of every BVH primitive.
    primitives: Vec<(u32, u32)>,
    bvh: Bvh,
}

impl BottomLevel {
    fn primitive_boxes(geometries: &[GeometryData]) -> (Vec<(u32, u32)>, Vec<Aabb>) {
        let mut primitives = Vec::new();
        let mut boxes = Vec::new();
        for (geometry_index, geometry) in geometries.iter().enumerate() {
            for prim in 0..geometry.primitive_count() {
                primitives.push((geometry_index as u32, prim as u32));
                boxes.push(geometry.primitive_bounds(prim));
            }
        }
        (primitives, boxes)
    }
}

pub(super) struct InstanceData {
    bottom: Arc<BottomLevel>,
    object_to_world: Affine3A,
    world_to_object: Affine3A,
    mask: u32,
    custom_index: u32,
    pub hit_group_offset: u32,
}

pub(super) struct TopLevel {
    instances: Vec<InstanceData>,
    bvh: Bvh,
}

pub(super) enum BuiltStructure {
    Bottom(Arc<BottomLevel>),
    Top(TopLevel),
}

/// Closest hit candidate found by the traversal.
pub(super) struct Candidate {
    pub attributes: crate::HitAttributes,
}

fn intersect_triangle(
    ray: &Ray,
    t_max: f32,
    triangle: &[Vec3; 3],
    flags: RayFlags,
) -> Option<(f32, [f32; 2], bool)> {
    let e1 = triangle[1] - triangle[0];
    let e2 = triangle[2] - triangle[0];
    let p = ray.direction.cross(e2);
    let det = e1.dot(p);
    if det.abs() < 1e-12 {
        return None;
    }
    // Counter-clockwise winding as seen from the ray origin is the front face.
    let front_face = det > 0.0;
    if front_face && flags.contains(RayFlags::CULL_FRONT_FACING_TRIANGLES)
        || !front_face && flags.contains(RayFlags::CULL_BACK_FACING_TRIANGLES)
    {
        return None;
    }
    let inv_det = 1.0 / det;
    let s = ray.origin - triangle[0];
    let u = s.dot(p) * inv_det;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let q = s.cross(e1);
    let v = ray.direction.dot(q) * inv_det;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }
    let t = e2.dot(q) * inv_det;
    if t < ray.t_min || t >= t_max {
        return None;
    }
    Some((t, [u, v], front_face))
}

impl TopLevel {
    pub fn instance(&self, index: u32) -> &InstanceData {
        &self.instances[index as usize]
    }

    /// Find the closest (or any, with `ACCEPT_FIRST_HIT_AND_END_SEARCH`) hit.
    /// Procedural primitives are resolved by `intersect_procedural`, given the
    /// instance index, geometry index, the object space ray and the primitive box.
    pub fn trace(
        &self,
        ray: &Ray,
        flags: RayFlags,
        mask: u32,
        mut intersect_procedural: impl FnMut(u32, u32, &Ray, &Aabb) -> Option<ProceduralHit>,
    ) -> Option<Candidate> {
        let mut closest = None;
        let mut t_max = ray.t_max;
        let accept_first = flags.contains(RayFlags::ACCEPT_FIRST_HIT_AND_END_SEARCH);
        let _ = self.bvh.traverse(ray, &mut t_max, |instance_index, t_max| {
            let instance = &self.instances[instance_index as usize];
            if instance.mask & mask == 0 {
                return ControlFlow::Continue(());
            }
            let object_ray = ray.transformed(&instance.world_to_object);
            instance.bottom.bvh.traverse(&object_ray, t_max, |prim, t_max| {
                let (geometry_index, primitive_index) = instance.bottom.primitives[prim as usize];
                let found = match instance.bottom.geometries[geometry_index as usize] {
                    GeometryData::Triangles { ref triangles } => {
                        let triangle = &triangles[primitive_index as usize];
                        intersect_triangle(&object_ray, *t_max, triangle, flags).map(
                            |(t, barycentrics, front_face)| {
                                let normal = (triangle[1] - triangle[0])
                                    .cross(triangle[2] - triangle[0]);
                                (t, HitKind::Triangle { barycentrics, front_face }, normal)
                            },
                        )
                    }
                    GeometryData::Aabbs { ref boxes } => {
                        let aabb = &boxes[primitive_index as usize];
                        let bounded = Ray {
                            t_max: *t_max,
                            ..object_ray
                        };
                        intersect_procedural(instance_index, geometry_index, &bounded, aabb)
                            .filter(|hit| hit.t >= object_ray.t_min && hit.t < *t_max)
                            .map(|hit| (hit.t, HitKind::Procedural, hit.normal))
                    }
                };
                if let Some((t, kind, object_normal)) = found {
                    *t_max = t;
                    closest = Some(Candidate {
                        attributes: crate::HitAttributes {
                            t,
                            kind,
                            instance_index,
                            instance_custom_index: instance.custom_index,
                            geometry_index,
                            primitive_index,
                            object_normal,
                            object_to_world: instance.object_to_world,
                            world_ray: *ray,
                        },
                    });
                    if accept_first {
                        return ControlFlow::Break(());
                    }
                }
                ControlFlow::Continue(())
            })
        });
        closest
    }
}

fn read_vec3(bytes: &[u8], offset: usize) -> Result<Vec3, crate::DeviceError> {
    let raw = bytes
        .get(offset..offset + 12)
        .ok_or(crate::DeviceError::InvalidResource("geometry buffer range"))?;
    Ok(Vec3::from_array(bytemuck::pod_read_unaligned::<[f32; 3]>(raw)))
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32, crate::DeviceError> {
    let raw = bytes
        .get(offset..offset + 4)
        .ok_or(crate::DeviceError::InvalidResource("index buffer range"))?;
    Ok(bytemuck::pod_read_unaligned::<u32>(raw))
}

fn read_geometry(
    storage: &Storage,
    geometry: &crate::AccelerationStructureGeometry,
) -> Result<GeometryData, crate::DeviceError> {
    Ok(match *geometry {
        crate::AccelerationStructureGeometry::Triangles {
            vertex_data,
            vertex_stride,
            vertex_count,
            index_data,
            triangle_count,
            is_opaque: _,
        } => {
            let vertices = storage.buffer_bytes(vertex_data)?;
            let indices = match index_data {
                Some(piece) => Some(storage.buffer_bytes(piece)?),
                None => None,
            };
            let mut triangles = Vec::with_capacity(triangle_count as usize);
            for tri in 0..triangle_count as usize {
                let mut corners = [Vec3::ZERO; 3];
                for (k, corner) in corners.iter_mut().enumerate() {
                    let index = match indices {
                        Some(bytes) => read_u32(bytes, (tri * 3 + k) * 4)?,
                        None => (tri * 3 + k) as u32,
                    };
                    if index >= vertex_count {
                        return Err(crate::DeviceError::InvalidResource("vertex index"));
                    }
                    *corner = read_vec3(vertices, index as usize * vertex_stride as usize)?;
                }
                triangles.push(corners);
            }
            GeometryData::Triangles { triangles }
        }
        crate::AccelerationStructureGeometry::Aabbs {
            aabb_data,
            aabb_stride,
            aabb_count,
            is_opaque: _,
        } => {
            let bytes = storage.buffer_bytes(aabb_data)?;
            let mut boxes = Vec::with_capacity(aabb_count as usize);
            for i in 0..aabb_count as usize {
                let offset = i * aabb_stride as usize;
                boxes.push(Aabb {
                    min: read_vec3(bytes, offset)?,
                    max: read_vec3(bytes, offset + 12)?,
                });
            }
            GeometryData::Aabbs { boxes }
        }
    })
}

fn check_scratch(
    storage: &Storage,
    scratch: crate::BufferPiece,
    required: u64,
) -> Result<(), crate::DeviceError> {
    let provided = storage.buffer_bytes(scratch)?.len() as u64;
    if provided < required {
        return Err(crate::DeviceError::ScratchTooSmall { required, provided });
    }
    Ok(())
}

fn bottom_level_sizes(primitive_count: u64) -> crate::AccelerationStructureSizes {
    crate::AccelerationStructureSizes {
        data: HEADER_SIZE + primitive_count * (2 * NODE_SIZE + PRIMITIVE_SIZE),
        scratch: HEADER_SIZE + primitive_count * SCRATCH_PER_PRIMITIVE,
    }
}

fn top_level_sizes(instance_count: u64) -> crate::AccelerationStructureSizes {
    crate::AccelerationStructureSizes {
        data: HEADER_SIZE + instance_count * (2 * NODE_SIZE + INSTANCE_SIZE),
        scratch: HEADER_SIZE + instance_count * SCRATCH_PER_PRIMITIVE,
    }
}

pub(super) fn build_bottom_level(
    storage: &mut Storage,
    dst: super::AccelerationStructure,
    geometries: &[crate::AccelerationStructureGeometry],
    scratch: crate::BufferPiece,
    mode: crate::BuildMode,
) -> Result<(), crate::DeviceError> {
    let primitive_count = geometries.iter().map(|g| g.primitive_count() as u64).sum();
    let sizes = bottom_level_sizes(primitive_count);
    check_scratch(storage, scratch, sizes.scratch)?;
    let data = geometries
        .iter()
        .map(|g| read_geometry(storage, g))
        .collect::<Result<Vec<_>, _>>()?;

    let target = storage
        .acceleration_structures
        .get_mut(&dst.raw)
        .ok_or(crate::DeviceError::InvalidResource("acceleration structure"))?;
    if target.ty != crate::AccelerationStructureType::BottomLevel {
        return Err(crate::DeviceError::InvalidResource("bottom level acceleration structure"));
    }
    if target.size < sizes.data {
        return Err(crate::DeviceError::InvalidResource("acceleration structure size"));
    }

    let (primitives, boxes) = BottomLevel::primitive_boxes(&data);
    let bvh = match mode {
        crate::BuildMode::Build => Bvh::build(&boxes),
        crate::BuildMode::Update => {
            if !target
                .flags
                .contains(crate::AccelerationStructureFlags::ALLOW_UPDATE)
            {
                return Err(crate::DeviceError::InvalidUpdate(target.name.clone()));
            }
            let previous = match target.built {
                Some(BuiltStructure::Bottom(ref bottom)) => bottom,
                _ => return Err(crate::DeviceError::InvalidUpdate(target.name.clone())),
            };
            let same_topology = previous.primitives == primitives
                && previous
                    .geometries
                    .iter()
                    .zip(data.iter())
                    .all(|(a, b)| std::mem::discriminant(a) == std::mem::discriminant(b));
            if !same_topology {
                return Err(crate::DeviceError::InvalidUpdate(target.name.clone()));
            }
            let mut bvh = Bvh {
                nodes: previous.bvh.nodes.clone(),
                indices: previous.bvh.indices.clone(),
            };
            bvh.refit(&boxes);
            bvh
        }
    };
    log::trace!(
        "{:?} of '{}' with {} primitives",
        mode,
        target.name,
        primitives.len()
    );
    target.built = Some(BuiltStructure::Bottom(Arc::new(BottomLevel {
        geometries: data,
        primitives,
        bvh,
    })));
    Ok(())
}

pub(super) fn build_top_level(
    storage: &mut Storage,
    dst: super::AccelerationStructure,
    bottom_level: &[super::AccelerationStructure],
    instance_count: u32,
    instance_data: crate::BufferPiece,
    scratch: crate::BufferPiece,
) -> Result<(), crate::DeviceError> {
    let sizes = top_level_sizes(instance_count as u64);
    check_scratch(storage, scratch, sizes.scratch)?;
    let bytes = storage.buffer_bytes(instance_data)?;
    let mut instances = Vec::with_capacity(instance_count as usize);
    let mut boxes = Vec::with_capacity(instance_count as usize);
    for i in 0..instance_count as usize {
        let offset = i * INSTANCE_SIZE as usize;
        let raw = bytes
            .get(offset..offset + INSTANCE_SIZE as usize)
            .ok_or(crate::DeviceError::InvalidResource("instance buffer range"))?;
        let raw: RawInstance = bytemuck::pod_read_unaligned(raw);
        let handle = bottom_level
            .get(raw.acceleration_structure_index as usize)
            .ok_or(crate::DeviceError::InvalidResource("bottom level acceleration structure"))?;
        let bottom = match storage.accel(*handle)?.built {
            Some(BuiltStructure::Bottom(ref bottom)) => Arc::clone(bottom),
            _ => {
                return Err(crate::DeviceError::InvalidResource(
                    "bottom level acceleration structure",
                ))
            }
        };
        let object_to_world = crate::affine_from_transform(&raw.transform.into());
        boxes.push(bottom.bvh.bounds().transformed(&object_to_world));
        instances.push(InstanceData {
            bottom,
            object_to_world,
            world_to_object: object_to_world.inverse(),
            mask: raw.mask,
            custom_index: raw.custom_index,
            hit_group_offset: raw.hit_group_offset,
        });
    }

    let target = storage
        .acceleration_structures
        .get_mut(&dst.raw)
        .ok_or(crate::DeviceError::InvalidResource("acceleration structure"))?;
    if target.ty != crate::AccelerationStructureType::TopLevel {
        return Err(crate::DeviceError::InvalidResource("top level acceleration structure"));
    }
    if target.size < sizes.data {
        return Err(crate::DeviceError::InvalidResource("acceleration structure size"));
    }
    log::trace!("Build of '{}' with {} instances", target.name, instance_count);
    target.built = Some(BuiltStructure::Top(TopLevel {
        bvh: Bvh::build(&boxes),
        instances,
    }));
    Ok(())
}

impl super::Context {
    pub fn get_bottom_level_acceleration_structure_sizes(
        &self,
        geometries: &[crate::AccelerationStructureGeometry],
    ) -> crate::AccelerationStructureSizes {
        bottom_level_sizes(geometries.iter().map(|g| g.primitive_count() as u64).sum())
    }

    pub fn get_top_level_acceleration_structure_sizes(
        &self,
        instance_count: u32,
    ) -> crate::AccelerationStructureSizes {
        top_level_sizes(instance_count as u64)
    }

    /// Upload instance descriptors into a new buffer, consumed by `build_top_level`.
    pub fn create_acceleration_structure_instance_buffer(
        &self,
        instances: &[crate::AccelerationStructureInstance],
    ) -> Result<super::Buffer, crate::DeviceError> {
        let raw = instances
            .iter()
            .map(|instance| RawInstance {
                transform: instance.transform.into(),
                custom_index: instance.custom_index,
                mask: instance.mask,
                hit_group_offset: instance.hit_group_offset,
                acceleration_structure_index: instance.acceleration_structure_index,
            })
            .collect::<Vec<_>>();
        let buffer = self.create_buffer(crate::BufferDesc {
            name: "instances",
            size: (raw.len() as u64 * INSTANCE_SIZE).max(INSTANCE_SIZE),
            memory: crate::Memory::Upload,
        })?;
        self.write_buffer_pod(buffer.into(), &raw)?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_box(center: Vec3) -> Aabb {
        Aabb {
            min: center - Vec3::splat(0.5),
            max: center + Vec3::splat(0.5),
        }
    }

    fn collect_hits(bvh: &Bvh, boxes: &[Aabb], ray: &Ray) -> Vec<u32> {
        let mut hits = Vec::new();
        let mut t_max = ray.t_max;
        let _ = bvh.traverse(ray, &mut t_max, |prim, _| {
            if boxes[prim as usize]
                .intersect(ray, ray.direction.recip())
                .is_some()
            {
                hits.push(prim);
            }
            ControlFlow::Continue(())
        });
        hits.sort();
        hits
    }

    #[test]
    fn build_and_traverse() {
        let boxes = (0..40)
            .map(|i| unit_box(Vec3::new(i as f32 * 2.0, 0.0, 0.0)))
            .collect::<Vec<_>>();
        let bvh = Bvh::build(&boxes);
        assert!(bvh.nodes.len() > 1);
        let ray = Ray {
            origin: Vec3::new(20.0, 0.0, -10.0),
            t_min: 0.0,
            direction: Vec3::Z,
            t_max: 100.0,
        };
        assert_eq!(collect_hits(&bvh, &boxes, &ray), vec![10]);
    }

    #[test]
    fn refit_follows_moved_boxes() {
        let mut boxes = (0..16)
            .map(|i| unit_box(Vec3::new(i as f32, 0.0, 0.0)))
            .collect::<Vec<_>>();
        let mut bvh = Bvh::build(&boxes);
        for b in boxes.iter_mut() {
            *b = unit_box(b.center() + Vec3::new(0.0, 5.0, 0.0));
        }
        bvh.refit(&boxes);
        assert!((bvh.bounds().min.y - 4.5).abs() < 1e-5);
        let ray = Ray {
            origin: Vec3::new(3.0, 5.0, -10.0),
            t_min: 0.0,
            direction: Vec3::Z,
            t_max: 100.0,
        };
        assert_eq!(collect_hits(&bvh, &boxes, &ray), vec![3]);
    }

    #[test]
    fn triangle_faces() {
        let triangle = [Vec3::ZERO, Vec3::X, Vec3::Y];
        let toward = Ray {
            origin: Vec3::new(0.2, 0.2, 1.0),
            t_min: 0.0,
            direction: -Vec3::Z,
            t_max: 10.0,
        };
        let (t, _, front) = intersect_triangle(&toward, 10.0, &triangle, RayFlags::empty()).unwrap();
        assert!((t - 1.0).abs() < 1e-6);
        assert!(front);
        assert!(intersect_triangle(
            &toward,
            10.0,
            &triangle,
            RayFlags::CULL_FRONT_FACING_TRIANGLES
        )
        .is_none());
        assert!(intersect_triangle(&toward, 0.5, &triangle, RayFlags::empty()).is_none());
    }
}

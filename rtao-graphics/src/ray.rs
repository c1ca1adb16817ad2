use glam::{Affine3A, Vec3};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Default for Aabb {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl Aabb {
    pub const EMPTY: Self = Self {
        min: Vec3::splat(f32::INFINITY),
        max: Vec3::splat(f32::NEG_INFINITY),
    };

    pub fn from_points(points: &[Vec3]) -> Self {
        let mut aabb = Self::EMPTY;
        for &p in points {
            aabb.grow(p);
        }
        aabb
    }

    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    pub fn grow(&mut self, p: Vec3) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }

    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    pub fn area(&self) -> f32 {
        if self.is_empty() {
            return 0.0;
        }
        let d = self.max - self.min;
        2.0 * (d.x * d.y + d.y * d.z + d.z * d.x)
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Bounds of this box after an affine transformation.
    pub fn transformed(&self, transform: &Affine3A) -> Aabb {
        if self.is_empty() {
            return *self;
        }
        let mut result = Aabb::EMPTY;
        for i in 0..8 {
            let corner = Vec3::new(
                if i & 1 == 0 { self.min.x } else { self.max.x },
                if i & 2 == 0 { self.min.y } else { self.max.y },
                if i & 4 == 0 { self.min.z } else { self.max.z },
            );
            result.grow(transform.transform_point3(corner));
        }
        result
    }

    /// Slab test, returning the entry distance if the ray overlaps `[t_min, t_max]`.
    pub fn intersect(&self, ray: &Ray, inv_direction: Vec3) -> Option<f32> {
        let t0 = (self.min - ray.origin) * inv_direction;
        let t1 = (self.max - ray.origin) * inv_direction;
        let t_near = t0.min(t1).max_element().max(ray.t_min);
        let t_far = t0.max(t1).min_element().min(ray.t_max);
        if t_near <= t_far {
            Some(t_near)
        } else {
            None
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Ray {
    pub origin: Vec3,
    pub t_min: f32,
    pub direction: Vec3,
    pub t_max: f32,
}

impl Ray {
    pub fn at(&self, t: f32) -> Vec3 {
        self.origin + self.direction * t
    }

    pub fn transformed(&self, transform: &Affine3A) -> Ray {
        Ray {
            origin: transform.transform_point3(self.origin),
            t_min: self.t_min,
            direction: transform.transform_vector3(self.direction),
            t_max: self.t_max,
        }
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq)]
    pub struct RayFlags: u32 {
        const FORCE_OPAQUE = 1 << 0;
        const ACCEPT_FIRST_HIT_AND_END_SEARCH = 1 << 2;
        const SKIP_CLOSEST_HIT_SHADER = 1 << 3;
        const CULL_BACK_FACING_TRIANGLES = 1 << 4;
        const CULL_FRONT_FACING_TRIANGLES = 1 << 5;
    }
}

/// Payload carried by every ray of the software pipeline.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RayPayload {
    pub hit: bool,
    pub t: f32,
    pub position: Vec3,
    pub normal: Vec3,
    pub material_id: u32,
    pub instance_custom_index: u32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum HitKind {
    Triangle {
        barycentrics: [f32; 2],
        front_face: bool,
    },
    Procedural,
}

/// Everything a closest-hit program learns about the committed hit.
#[derive(Clone, Copy, Debug)]
pub struct HitAttributes {
    pub t: f32,
    pub kind: HitKind,
    pub instance_index: u32,
    pub instance_custom_index: u32,
    pub geometry_index: u32,
    pub primitive_index: u32,
    /// Geometric normal in object space, not normalized.
    pub object_normal: Vec3,
    pub object_to_world: Affine3A,
    pub world_ray: Ray,
}

impl HitAttributes {
    pub fn world_position(&self) -> Vec3 {
        self.world_ray.at(self.t)
    }

    pub fn world_normal(&self) -> Vec3 {
        let normal_matrix = self.object_to_world.matrix3.inverse().transpose();
        (normal_matrix * glam::Vec3A::from(self.object_normal))
            .normalize_or_zero()
            .into()
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProceduralHit {
    pub t: f32,
    /// Object space normal at the hit point.
    pub normal: Vec3,
}

pub trait RayGenProgram: Send + Sync {
    /// Executes for one launch index, writing one value per bound output.
    fn ray_gen(
        &self,
        context: &super::LaunchContext<'_>,
        index: [u32; 2],
        record: &[u8],
        outputs: &mut [[f32; 4]],
    );
}

pub trait ClosestHitProgram: Send + Sync {
    fn closest_hit(&self, hit: &HitAttributes, record: &[u8], payload: &mut RayPayload);
}

pub trait IntersectionProgram: Send + Sync {
    /// Intersects an object space ray with the primitive bounded by `aabb`.
    fn intersect(&self, ray: &Ray, aabb: &Aabb, record: &[u8]) -> Option<ProceduralHit>;
}

pub trait MissProgram: Send + Sync {
    fn miss(&self, ray: &Ray, record: &[u8], payload: &mut RayPayload);
}

#[derive(Clone)]
pub struct HitGroupDesc<'a> {
    pub name: &'a str,
    pub closest_hit: Option<Arc<dyn ClosestHitProgram>>,
    /// Required for procedural geometry, ignored for triangles.
    pub intersection: Option<Arc<dyn IntersectionProgram>>,
}

pub struct RayTracingPipelineDesc<'a> {
    pub name: &'a str,
    pub ray_generation: &'a [(&'a str, Arc<dyn RayGenProgram>)],
    pub miss: &'a [(&'a str, Arc<dyn MissProgram>)],
    pub hit_groups: &'a [HitGroupDesc<'a>],
    pub max_recursion_depth: u32,
}

pub fn affine_from_transform(transform: &crate::Transform) -> Affine3A {
    let m: [[f32; 4]; 3] = (*transform).into();
    Affine3A::from_cols_array(&[
        m[0][0], m[1][0], m[2][0], m[0][1], m[1][1], m[2][1], m[0][2], m[1][2], m[2][2], m[0][3],
        m[1][3], m[2][3],
    ])
}

pub fn transform_from_affine(affine: &Affine3A) -> crate::Transform {
    let c = affine.to_cols_array();
    [
        [c[0], c[3], c[6], c[9]],
        [c[1], c[4], c[7], c[10]],
        [c[2], c[5], c[8], c[11]],
    ]
    .into()
}

/// Opaque identifier placed at the start of a shader record.
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq)]
pub struct ShaderIdentifier(pub [u8; crate::limits::SHADER_IDENTIFIER_SIZE as usize]);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slab_test() {
        let aabb = Aabb {
            min: Vec3::splat(-1.0),
            max: Vec3::splat(1.0),
        };
        let ray = Ray {
            origin: Vec3::new(0.0, 0.0, -5.0),
            t_min: 0.0,
            direction: Vec3::Z,
            t_max: 100.0,
        };
        let t = aabb.intersect(&ray, ray.direction.recip()).unwrap();
        assert!((t - 4.0).abs() < 1e-5);

        let miss = Ray {
            origin: Vec3::new(3.0, 0.0, -5.0),
            ..ray
        };
        assert_eq!(aabb.intersect(&miss, miss.direction.recip()), None);
    }

    #[test]
    fn transformed_bounds() {
        let aabb = Aabb {
            min: Vec3::ZERO,
            max: Vec3::ONE,
        };
        let moved = aabb.transformed(&Affine3A::from_translation(Vec3::new(2.0, 0.0, 0.0)));
        assert_eq!(moved.min, Vec3::new(2.0, 0.0, 0.0));
        assert_eq!(moved.max, Vec3::new(3.0, 1.0, 1.0));
        assert!(Aabb::EMPTY.transformed(&Affine3A::IDENTITY).is_empty());
    }

    #[test]
    fn transform_layout() {
        let affine = Affine3A::from_scale_rotation_translation(
            Vec3::splat(2.0),
            glam::Quat::from_rotation_y(0.5),
            Vec3::new(1.0, 2.0, 3.0),
        );
        let transform = transform_from_affine(&affine);
        assert_eq!(transform.x.w, 1.0);
        assert_eq!(transform.z.w, 3.0);
        let back = affine_from_transform(&transform);
        assert!(back.abs_diff_eq(affine, 1e-6));
        assert_eq!(
            affine_from_transform(&crate::IDENTITY_TRANSFORM),
            Affine3A::IDENTITY
        );
    }
}

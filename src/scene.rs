use crate::config;
use rtao_graphics as gpu;
use rtao_render::scene::{
    grid_transforms, sphere_transforms, GeometryGroup, GeometryInstance, GeometryKind, Material,
    MaterialType, SceneDescription, Vertex,
};

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("scene '{name}' is empty")]
    Empty { name: String },
    #[error("invalid scene parameter: {0}")]
    InvalidParameter(&'static str),
}

bitflags::bitflags! {
    /// Parts of a scene changed by an animation step.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct Animated: u32 {
        const INSTANCES = 1 << 0;
        const LIGHT = 1 << 1;
    }
}

/// Source of scene content, consulted when the scene is (re)loaded.
pub trait SceneLoader {
    fn load(&mut self) -> Result<SceneDescription, LoadError>;

    /// Bring the instances and the light to the given time.
    fn animate(&mut self, _time: f32, _scene: &mut SceneDescription) -> Animated {
        Animated::empty()
    }
}

const GROUND_BLAS: usize = 0;
const SPHERE_BLAS: usize = 1;
const FULL_MASK: u8 = 0xFF;
/// Radians per second.
const LIGHT_SPEED: f32 = 0.5;

/// Built-in scene: a ground plane mesh with a set of analytic spheres on top.
pub struct ProceduralScene {
    config: config::Scene,
}

impl ProceduralScene {
    pub fn new(config: config::Scene) -> Self {
        Self { config }
    }

    fn ground(&self) -> GeometryKind {
        let n = self.config.ground_divisions.max(1);
        let half = 0.5 * self.config.ground_size;
        let step = self.config.ground_size / n as f32;
        let mut vertices = Vec::with_capacity(((n + 1) * (n + 1)) as usize);
        for z in 0..=n {
            for x in 0..=n {
                vertices.push(Vertex {
                    position: [x as f32 * step - half, 0.0, z as f32 * step - half],
                    normal: [0.0, 1.0, 0.0],
                });
            }
        }
        let mut indices = Vec::with_capacity((n * n * 6) as usize);
        for z in 0..n {
            for x in 0..n {
                let base = z * (n + 1) + x;
                let next = base + n + 1;
                indices.extend_from_slice(&[base, next, base + 1, base + 1, next, next + 1]);
            }
        }
        GeometryKind::Triangles { vertices, indices }
    }

    fn sphere_placement(&self, time: f32) -> Vec<gpu::Transform> {
        let c = &self.config;
        match c.layout {
            config::Layout::Grid => {
                let mut transforms = grid_transforms(c.sphere_count, c.spacing, time);
                // rest the grid on the ground
                for t in transforms.iter_mut() {
                    t.y.w += c.sphere_radius + 0.25;
                }
                transforms
            }
            config::Layout::Sphere => {
                let lift = c.spacing + c.sphere_radius;
                let mut transforms = sphere_transforms(c.sphere_count, c.spacing, time);
                for t in transforms.iter_mut() {
                    t.y.w += lift;
                }
                transforms
            }
        }
    }

    fn light_direction(&self, time: f32) -> mint::Vector3<f32> {
        let rotation = glam::Quat::from_rotation_y(time * LIGHT_SPEED);
        (rotation * glam::Vec3::from(self.config.light_direction)).into()
    }
}

fn palette() -> [Material; 4] {
    let matte = |albedo| Material {
        albedo,
        ty: MaterialType::Matte,
        ..Default::default()
    };
    [
        Material {
            albedo: [0.8, 0.8, 0.8],
            ty: MaterialType::AnalyticalCheckerboardTexture,
            ..Default::default()
        },
        matte([0.9, 0.3, 0.2]),
        matte([0.2, 0.7, 0.3]),
        Material {
            albedo: [0.9, 0.9, 0.95],
            roughness: 0.1,
            reflectance: 0.9,
            ty: MaterialType::Mirror,
        },
    ]
}

impl SceneLoader for ProceduralScene {
    #[profiling::function]
    fn load(&mut self) -> Result<SceneDescription, LoadError> {
        let c = &self.config;
        if c.sphere_radius <= 0.0 {
            return Err(LoadError::InvalidParameter("sphere radius"));
        }
        if c.ground_size <= 0.0 && c.sphere_count == 0 {
            return Err(LoadError::Empty {
                name: "procedural".to_string(),
            });
        }
        let materials = palette().to_vec();
        let r = c.sphere_radius;
        let geometry_groups = vec![
            GeometryGroup {
                name: "ground".to_string(),
                kind: self.ground(),
                material: 0,
            },
            GeometryGroup {
                name: "spheres".to_string(),
                kind: GeometryKind::Procedural {
                    aabbs: vec![gpu::Aabb {
                        min: glam::Vec3::splat(-r),
                        max: glam::Vec3::splat(r),
                    }],
                },
                material: 1,
            },
        ];

        let mut instances = vec![GeometryInstance {
            blas: GROUND_BLAS,
            transform: gpu::IDENTITY_TRANSFORM,
            material: None,
            mask: FULL_MASK,
        }];
        let sphere_materials = materials.len() as u32 - 1;
        instances.extend(self.sphere_placement(0.0).into_iter().enumerate().map(
            |(i, transform)| GeometryInstance {
                blas: SPHERE_BLAS,
                transform,
                material: Some(1 + i as u32 % sphere_materials),
                mask: FULL_MASK,
            },
        ));
        log::info!(
            "Procedural scene with {} spheres in {:?} layout",
            c.sphere_count,
            c.layout
        );

        Ok(SceneDescription {
            geometry_groups,
            materials,
            environment: c.environment,
            light_direction: c.light_direction,
            instances,
        })
    }

    fn animate(&mut self, time: f32, scene: &mut SceneDescription) -> Animated {
        let mut changed = Animated::empty();
        if self.config.animate {
            let mut transforms = self.sphere_placement(time).into_iter();
            for instance in scene.instances.iter_mut().filter(|i| i.blas == SPHERE_BLAS) {
                match transforms.next() {
                    Some(transform) => instance.transform = transform,
                    None => break,
                }
            }
            changed |= Animated::INSTANCES;
        }
        if self.config.animate_light {
            scene.light_direction = self.light_direction(time);
            changed |= Animated::LIGHT;
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ground_mesh() {
        let scene = ProceduralScene::new(config::Scene {
            ground_divisions: 2,
            ..Default::default()
        });
        match scene.ground() {
            GeometryKind::Triangles { vertices, indices } => {
                assert_eq!(vertices.len(), 9);
                assert_eq!(indices.len(), 2 * 2 * 6);
                assert!(indices.iter().all(|&i| (i as usize) < vertices.len()));
            }
            GeometryKind::Procedural { .. } => panic!("ground must be a mesh"),
        }
    }

    #[test]
    fn instance_table() {
        let mut scene = ProceduralScene::new(config::Scene {
            sphere_count: 5,
            ..Default::default()
        });
        let desc = scene.load().unwrap();
        assert_eq!(desc.instances.len(), 6);
        assert!(desc
            .instances
            .iter()
            .all(|i| i.blas < desc.geometry_groups.len()));
        assert!(desc
            .instances
            .iter()
            .filter_map(|i| i.material)
            .all(|m| (m as usize) < desc.materials.len()));
    }

    #[test]
    fn animation_moves_spheres_only() {
        let mut scene = ProceduralScene::new(config::Scene::default());
        let mut desc = scene.load().unwrap();
        let before = desc.clone();
        assert_eq!(scene.animate(1.0, &mut desc), Animated::INSTANCES);
        assert_eq!(desc.instances[0], before.instances[0]);
        assert_ne!(desc.instances[1..], before.instances[1..]);
        assert_eq!(desc.light_direction, before.light_direction);
    }

    #[test]
    fn light_rotates_around_the_vertical() {
        let config = config::Scene {
            animate: false,
            animate_light: true,
            light_direction: [1.0, 2.0, 0.0].into(),
            ..Default::default()
        };
        let mut scene = ProceduralScene::new(config);
        let mut desc = scene.load().unwrap();
        let instances = desc.instances.clone();

        // a quarter turn
        let time = std::f32::consts::FRAC_PI_2 / LIGHT_SPEED;
        assert_eq!(scene.animate(time, &mut desc), Animated::LIGHT);
        assert_eq!(desc.instances, instances);
        let light = glam::Vec3::from(desc.light_direction);
        assert!(light.abs_diff_eq(glam::Vec3::new(0.0, 2.0, -1.0), 1e-5), "{}", light);

        // back to the configured direction at time zero
        scene.animate(0.0, &mut desc);
        let light = glam::Vec3::from(desc.light_direction);
        assert!(light.abs_diff_eq(glam::Vec3::new(1.0, 2.0, 0.0), 1e-6), "{}", light);
    }

    #[test]
    fn rejects_bad_radius() {
        let mut scene = ProceduralScene::new(config::Scene {
            sphere_radius: 0.0,
            ..Default::default()
        });
        assert!(matches!(scene.load(), Err(LoadError::InvalidParameter(_))));
    }
}

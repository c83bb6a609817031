//! Scene data contract consumed by the renderer backend. Loaders (OBJ,
//! glTF, ...) live upstream and produce this representation; the backend
//! only reads it.

use glam::{Mat4, Vec2, Vec3, Vec4};

mod error;

pub use error::{Error, Result};

/// One buildable geometry: triangle-list positions and indices, plus
/// optional per-vertex attributes. Attribute vectors are either empty or
/// exactly `positions.len()` long.
#[derive(Debug, Clone, Default)]
pub struct GeometryData {
    pub positions: Vec<Vec3>,
    pub indices: Vec<u32>,
    pub normals: Vec<Vec3>,
    pub uvs: Vec<Vec2>,
    pub colors: Vec<Vec4>,
    pub material_id: u32,
}

impl GeometryData {
    pub fn num_tris(&self) -> usize {
        self.indices.len() / 3
    }
}

#[derive(Debug, Clone, Default)]
pub struct Mesh {
    pub geometries: Vec<GeometryData>,
}

impl Mesh {
    pub fn num_tris(&self) -> usize {
        self.geometries.iter().map(GeometryData::num_tris).sum()
    }
}

/// Placement of a mesh in the scene.
#[derive(Debug, Clone, Copy)]
pub struct Instance {
    pub mesh_id: usize,
    pub transform: Mat4,
}

/// Disney BSDF parameter block, uploaded verbatim as the material table.
/// `color_texture` is an index into the scene's texture list, -1 when the
/// base color is untextured.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DisneyMaterial {
    pub base_color: Vec3,
    pub metallic: f32,
    pub specular: f32,
    pub roughness: f32,
    pub specular_tint: f32,
    pub anisotropy: f32,
    pub sheen: f32,
    pub sheen_tint: f32,
    pub clearcoat: f32,
    pub clearcoat_gloss: f32,
    pub ior: f32,
    pub specular_transmission: f32,
    pub color_texture: i32,
    pub _pad: f32,
}

impl Default for DisneyMaterial {
    fn default() -> Self {
        Self {
            base_color: Vec3::splat(0.9),
            metallic: 0.0,
            specular: 0.0,
            roughness: 1.0,
            specular_tint: 0.0,
            anisotropy: 0.0,
            sheen: 0.0,
            sheen_tint: 0.0,
            clearcoat: 0.0,
            clearcoat_gloss: 0.0,
            ior: 1.5,
            specular_transmission: 0.0,
            color_texture: -1,
            _pad: 0.0,
        }
    }
}

/// Decoded texture pixels; image file decoding happens upstream.
#[derive(Debug, Clone)]
pub struct TextureImage {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub pixels: Vec<u8>,
    pub srgb: bool,
}

/// Rect area light. `position.w`/`v_x.w`/`v_y.w` carry the emission scale,
/// width and height so the record stays four-float aligned on the device.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct QuadLight {
    pub emission: Vec4,
    pub position: Vec4,
    pub normal: Vec4,
    pub v_x: Vec4,
    pub v_y: Vec4,
}

#[derive(Debug, Clone, Copy)]
pub struct Camera {
    pub position: Vec3,
    pub center: Vec3,
    pub up: Vec3,
    pub fov_y: f32,
}

#[derive(Debug, Clone, Default)]
pub struct Scene {
    pub meshes: Vec<Mesh>,
    pub instances: Vec<Instance>,
    pub materials: Vec<DisneyMaterial>,
    pub textures: Vec<TextureImage>,
    pub lights: Vec<QuadLight>,
    pub cameras: Vec<Camera>,
}

impl Scene {
    /// Number of triangles across the unique meshes.
    pub fn unique_tris(&self) -> usize {
        self.meshes.iter().map(Mesh::num_tris).sum()
    }

    /// Number of triangles after instancing.
    pub fn total_tris(&self) -> usize {
        self.instances
            .iter()
            .map(|i| self.meshes[i.mesh_id].num_tris())
            .sum()
    }

    pub fn num_geometries(&self) -> usize {
        self.meshes.iter().map(|m| m.geometries.len()).sum()
    }

    /// Referential integrity checks the backend runs before uploading
    /// anything to the device.
    pub fn validate(&self) -> Result<()> {
        for (instance_id, instance) in self.instances.iter().enumerate() {
            if instance.mesh_id >= self.meshes.len() {
                return Err(Error::MissingMesh {
                    instance: instance_id,
                    mesh: instance.mesh_id,
                });
            }
        }

        // The backend substitutes one placeholder material row when the
        // list is empty, so index 0 stays addressable either way.
        let material_count = self.materials.len().max(1);

        for (mesh_id, mesh) in self.meshes.iter().enumerate() {
            for (geometry_id, geometry) in mesh.geometries.iter().enumerate() {
                if geometry.positions.is_empty() {
                    return Err(Error::EmptyGeometry {
                        mesh: mesh_id,
                        geometry: geometry_id,
                    });
                }
                if geometry.indices.len() % 3 != 0 {
                    return Err(Error::BadIndexCount {
                        mesh: mesh_id,
                        geometry: geometry_id,
                        count: geometry.indices.len(),
                    });
                }
                if geometry.material_id as usize >= material_count {
                    return Err(Error::MissingMaterial {
                        mesh: mesh_id,
                        geometry: geometry_id,
                        material: geometry.material_id,
                    });
                }
            }
        }

        for (material_id, material) in self.materials.iter().enumerate() {
            if material.color_texture >= 0
                && material.color_texture as usize >= self.textures.len()
            {
                return Err(Error::MissingTexture {
                    material: material_id,
                    texture: material.color_texture,
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle_geometry() -> GeometryData {
        GeometryData {
            positions: vec![
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(1.0, 0.0, 0.0),
                Vec3::new(0.0, 1.0, 0.0),
            ],
            indices: vec![0, 1, 2],
            ..Default::default()
        }
    }

    fn mesh_with_tris(tris: usize) -> Mesh {
        let geometry = GeometryData {
            positions: vec![Vec3::ZERO; 3],
            indices: (0..tris).flat_map(|_| [0u32, 1, 2]).collect(),
            ..Default::default()
        };
        Mesh {
            geometries: vec![geometry],
        }
    }

    #[test]
    fn triangle_counts_ignore_instancing_for_unique_tris() {
        let scene = Scene {
            meshes: (1..=10).map(mesh_with_tris).collect(),
            instances: (0..1000)
                .map(|i| Instance {
                    mesh_id: i % 10,
                    transform: Mat4::IDENTITY,
                })
                .collect(),
            ..Default::default()
        };

        // 1 + 2 + ... + 10 unique triangles.
        assert_eq!(scene.unique_tris(), 55);
        // 100 instances of each mesh.
        assert_eq!(scene.total_tris(), 100 * 55);
        assert_eq!(scene.num_geometries(), 10);
    }

    #[test]
    fn single_triangle_scene_counts() {
        let scene = Scene {
            meshes: vec![Mesh {
                geometries: vec![triangle_geometry()],
            }],
            instances: vec![Instance {
                mesh_id: 0,
                transform: Mat4::IDENTITY,
            }],
            materials: vec![DisneyMaterial::default()],
            ..Default::default()
        };

        assert_eq!(scene.unique_tris(), 1);
        assert_eq!(scene.total_tris(), 1);
        assert_eq!(scene.num_geometries(), 1);
        assert!(scene.validate().is_ok());
    }

    #[test]
    fn validate_rejects_dangling_mesh_reference() {
        let scene = Scene {
            meshes: vec![Mesh {
                geometries: vec![triangle_geometry()],
            }],
            instances: vec![Instance {
                mesh_id: 3,
                transform: Mat4::IDENTITY,
            }],
            ..Default::default()
        };

        assert!(matches!(
            scene.validate(),
            Err(Error::MissingMesh {
                instance: 0,
                mesh: 3
            })
        ));
    }

    #[test]
    fn validate_rejects_partial_triangles() {
        let mut geometry = triangle_geometry();
        geometry.indices.pop();
        let scene = Scene {
            meshes: vec![Mesh {
                geometries: vec![geometry],
            }],
            ..Default::default()
        };

        assert!(matches!(scene.validate(), Err(Error::BadIndexCount { .. })));
    }

    #[test]
    fn validate_rejects_dangling_material_reference() {
        let mut geometry = triangle_geometry();
        geometry.material_id = 2;
        let scene = Scene {
            meshes: vec![Mesh {
                geometries: vec![geometry],
            }],
            materials: vec![DisneyMaterial::default()],
            ..Default::default()
        };

        assert!(matches!(
            scene.validate(),
            Err(Error::MissingMaterial {
                mesh: 0,
                geometry: 0,
                material: 2
            })
        ));
    }

    #[test]
    fn validate_rejects_dangling_texture_reference() {
        let scene = Scene {
            materials: vec![DisneyMaterial {
                color_texture: 0,
                ..Default::default()
            }],
            ..Default::default()
        };

        assert!(matches!(
            scene.validate(),
            Err(Error::MissingTexture { .. })
        ));
    }

    #[test]
    fn material_table_row_is_sixteen_floats() {
        assert_eq!(std::mem::size_of::<DisneyMaterial>(), 16 * 4);
    }
}

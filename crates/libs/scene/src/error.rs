use thiserror::Error as ThisError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("instance {instance} references missing mesh {mesh}")]
    MissingMesh { instance: usize, mesh: usize },
    #[error("mesh {mesh} geometry {geometry} has no vertices")]
    EmptyGeometry { mesh: usize, geometry: usize },
    #[error("mesh {mesh} geometry {geometry} index count {count} is not a multiple of 3")]
    BadIndexCount {
        mesh: usize,
        geometry: usize,
        count: usize,
    },
    #[error("mesh {mesh} geometry {geometry} references missing material {material}")]
    MissingMaterial {
        mesh: usize,
        geometry: usize,
        material: u32,
    },
    #[error("material {material} references missing texture {texture}")]
    MissingTexture { material: usize, texture: i32 },
}

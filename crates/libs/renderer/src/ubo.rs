use glam::{Vec3, Vec4};

/// Per-frame view parameters consumed by the raygen shader. The camera
/// basis spans the image plane: a ray for pixel (x, y) is
/// `cam_dir_top_left + (x / width) * cam_du + (y / height) * cam_dv`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewParams {
    pub cam_pos: Vec4,
    pub cam_du: Vec4,
    pub cam_dv: Vec4,
    pub cam_dir_top_left: Vec4,
    pub frame_id: u32,
    pub _pad: [u32; 3],
}

impl ViewParams {
    pub fn new(
        pos: Vec3,
        dir: Vec3,
        up: Vec3,
        fov_y: f32,
        width: u32,
        height: u32,
        frame_id: u32,
    ) -> Self {
        let dir = dir.normalize();

        let plane_height = 2.0 * (0.5 * fov_y.to_radians()).tan();
        let plane_width = plane_height * width as f32 / height as f32;

        let cam_du = dir.cross(up).normalize() * plane_width;
        let cam_dv = -(dir.cross(up).normalize().cross(dir).normalize()) * plane_height;
        let dir_top_left = dir - 0.5 * cam_du - 0.5 * cam_dv;

        Self {
            cam_pos: pos.extend(1.0),
            cam_du: cam_du.extend(0.0),
            cam_dv: cam_dv.extend(0.0),
            cam_dir_top_left: dir_top_left.extend(0.0),
            frame_id,
            _pad: [0; 3],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camera_basis_spans_the_image_plane() {
        // 90 degrees vertical fov on a square image: the plane is 2x2.
        let params = ViewParams::new(
            Vec3::ZERO,
            Vec3::new(0.0, 0.0, -1.0),
            Vec3::Y,
            90.0,
            512,
            512,
            0,
        );

        assert!((params.cam_du.truncate() - Vec3::new(2.0, 0.0, 0.0)).length() < 1e-5);
        assert!((params.cam_dv.truncate() - Vec3::new(0.0, -2.0, 0.0)).length() < 1e-5);
        assert!(
            (params.cam_dir_top_left.truncate() - Vec3::new(-1.0, 1.0, -1.0)).length() < 1e-5
        );
    }

    #[test]
    fn aspect_ratio_widens_the_horizontal_basis() {
        let params = ViewParams::new(
            Vec3::ZERO,
            Vec3::new(0.0, 0.0, -1.0),
            Vec3::Y,
            90.0,
            1024,
            512,
            0,
        );

        assert!((params.cam_du.truncate().length() - 4.0).abs() < 1e-5);
        assert!((params.cam_dv.truncate().length() - 2.0).abs() < 1e-5);
    }

    #[test]
    fn uniform_block_is_std140_sized() {
        assert_eq!(std::mem::size_of::<ViewParams>(), 80);
    }
}

// CPU-side data handed to the renderer
//
// Map geometry/textures come from the asset loader already decoded; camera
// and actor transforms come from the game tick. Nothing here touches Vulkan.

use crate::error::RenderError;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

/// Maximum number of actor transforms carried in the global UBO
pub const MAX_ACTORS: usize = 64;

/// Push-constant texture index meaning "no texture, use white"
pub const NO_TEXTURE: u32 = u32::MAX;

/// Interleaved vertex layout consumed by the G-buffer pipeline
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
}

impl Vertex {
    pub const fn new(position: [f32; 3], normal: [f32; 3], uv: [f32; 2]) -> Self {
        Self { position, normal, uv }
    }
}

/// One drawable triangle list
#[derive(Debug, Clone, Default)]
pub struct Primitive {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    /// Texture slot in the same push; `None` uses the primitive's own index
    pub texture: Option<u32>,
}

impl Primitive {
    /// Texture index pushed to the shader for primitive `index` of a map
    /// holding `texture_count` textures
    pub fn texture_slot(&self, index: usize, texture_count: usize) -> u32 {
        match self.texture {
            Some(slot) => slot,
            None if index < texture_count => index as u32,
            None => NO_TEXTURE,
        }
    }

    pub fn vertex_bytes(&self) -> u64 {
        std::mem::size_of_val(self.vertices.as_slice()) as u64
    }

    pub fn index_bytes(&self) -> u64 {
        index_buffer_size(self.indices.len())
    }
}

/// Byte length of a 32-bit index buffer holding `index_count` indices
pub fn index_buffer_size(index_count: usize) -> u64 {
    (index_count * std::mem::size_of::<u32>()) as u64
}

/// Decoded texture, pixels tightly packed RGBA8
#[derive(Debug, Clone, Default)]
pub struct Texture {
    pub width: u32,
    pub height: u32,
    /// Channel count of the source image, pixels are always expanded to 4
    pub channels: u32,
    pub pixels: Vec<u8>,
}

impl Texture {
    pub fn rgba8(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self { width, height, channels: 4, pixels }
    }

    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

/// Rejects a map before any GPU resource is created. Loading is all or
/// nothing: a map that passes here is uploaded completely.
pub fn validate_map(
    primitives: &[Primitive],
    textures: &[Texture],
    bindless_capacity: u32,
) -> Result<(), RenderError> {
    if textures.len() > bindless_capacity as usize {
        return Err(RenderError::BindlessCapacityExceeded {
            requested: textures.len(),
            capacity: bindless_capacity,
        });
    }

    for (i, primitive) in primitives.iter().enumerate() {
        if primitive.vertices.is_empty() {
            return Err(RenderError::InvalidMap(format!("primitive {} has no vertices", i)));
        }
        if primitive.indices.is_empty() {
            return Err(RenderError::InvalidMap(format!("primitive {} has no indices", i)));
        }
        if primitive.indices.len() % 3 != 0 {
            return Err(RenderError::InvalidMap(format!(
                "primitive {} is not a triangle list ({} indices)",
                i,
                primitive.indices.len()
            )));
        }
        let vertex_count = primitive.vertices.len();
        if let Some(&index) = primitive.indices.iter().find(|&&index| index as usize >= vertex_count) {
            return Err(RenderError::InvalidMap(format!(
                "primitive {} references vertex {} but only has {}",
                i, index, vertex_count
            )));
        }
        if let Some(slot) = primitive.texture {
            if slot as usize >= textures.len() {
                return Err(RenderError::InvalidMap(format!(
                    "primitive {} uses texture {} but the map has {} textures",
                    i,
                    slot,
                    textures.len()
                )));
            }
        }
    }

    for (i, texture) in textures.iter().enumerate() {
        if texture.width == 0 || texture.height == 0 {
            return Err(RenderError::InvalidMap(format!(
                "texture {} has an empty extent {}x{}",
                i, texture.width, texture.height
            )));
        }
        if !(1..=4).contains(&texture.channels) {
            return Err(RenderError::InvalidMap(format!(
                "texture {} has {} channels",
                i, texture.channels
            )));
        }
        if texture.pixels.len() != texture.expected_len() {
            return Err(RenderError::InvalidMap(format!(
                "texture {} holds {} bytes, {}x{} RGBA8 needs {}",
                i,
                texture.pixels.len(),
                texture.width,
                texture.height,
                texture.expected_len()
            )));
        }
    }

    Ok(())
}

/// Model and inverse model matrix of an animated actor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActorTransform {
    pub model: Mat4,
    pub inv_model: Mat4,
}

impl ActorTransform {
    pub fn new(model: Mat4) -> Self {
        Self { model, inv_model: model.inverse() }
    }
}

impl Default for ActorTransform {
    fn default() -> Self {
        Self { model: Mat4::IDENTITY, inv_model: Mat4::IDENTITY }
    }
}

/// Everything a frame needs from the game, read only
#[derive(Debug, Clone)]
pub struct FrameState {
    pub view: Mat4,
    pub proj: Mat4,
    pub actors: Vec<ActorTransform>,
}

impl FrameState {
    pub fn new(view: Mat4, proj: Mat4) -> Self {
        Self { view, proj, actors: Vec::new() }
    }

    pub fn from_camera(camera: &Camera, aspect: f32) -> Self {
        Self::new(camera.view(), camera.projection(aspect))
    }

    pub fn view_proj(&self) -> Mat4 {
        self.proj * self.view
    }

    /// World-space direction the camera looks at
    pub fn view_dir(&self) -> Vec3 {
        let forward = self.view.inverse().transform_vector3(Vec3::NEG_Z);
        forward.normalize_or_zero()
    }
}

/// First-person camera
#[derive(Debug, Clone, Copy)]
pub struct Camera {
    pub eye: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    pub fov_y: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            eye: Vec3::new(0.0, 2.0, 5.0),
            target: Vec3::ZERO,
            up: Vec3::Y,
            fov_y: 90f32.to_radians(),
            near: 0.01,
            far: 50.0,
        }
    }
}

impl Camera {
    pub fn view(&self) -> Mat4 {
        Mat4::look_at_rh(self.eye, self.target, self.up)
    }

    /// Right-handed perspective with Y flipped for Vulkan clip space
    pub fn projection(&self, aspect: f32) -> Mat4 {
        let mut proj = Mat4::perspective_rh(self.fov_y, aspect, self.near, self.far);
        proj.y_axis.y *= -1.0;
        proj
    }

    /// Camera circling `target` at `radius`, one degree per frame
    pub fn orbit(frame: u64, radius: f32, height: f32) -> Self {
        let angle = (frame % 360) as f32 * std::f32::consts::PI / 180.0;
        Self {
            eye: Vec3::new(radius * angle.sin(), height, radius * angle.cos()),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn quad() -> Primitive {
        Primitive {
            vertices: vec![
                Vertex::new([0.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0]),
                Vertex::new([1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [1.0, 0.0]),
                Vertex::new([1.0, 0.0, 1.0], [0.0, 1.0, 0.0], [1.0, 1.0]),
                Vertex::new([0.0, 0.0, 1.0], [0.0, 1.0, 0.0], [0.0, 1.0]),
            ],
            indices: vec![0, 1, 2, 2, 3, 0],
            texture: None,
        }
    }

    fn white(size: u32) -> Texture {
        Texture::rgba8(size, size, vec![255; (size * size * 4) as usize])
    }

    #[test]
    fn vertex_is_tightly_packed() {
        assert_eq!(std::mem::size_of::<Vertex>(), 32);
        assert_eq!(std::mem::offset_of!(Vertex, normal), 12);
        assert_eq!(std::mem::offset_of!(Vertex, uv), 24);
    }

    #[test]
    fn index_buffer_holds_four_bytes_per_index() {
        let primitive = quad();
        assert_eq!(primitive.index_bytes(), 6 * 4);
        assert_eq!(index_buffer_size(0), 0);
        assert_eq!(primitive.vertex_bytes(), 4 * 32);
    }

    #[test]
    fn valid_map_passes() {
        let primitives = vec![quad(), quad()];
        let textures = vec![white(2), white(4)];
        assert!(validate_map(&primitives, &textures, 16).is_ok());
        assert!(validate_map(&[], &[], 16).is_ok());
    }

    #[test]
    fn capacity_is_checked_before_content() {
        let mut broken = quad();
        broken.indices.clear();
        let textures = vec![white(1), white(1), white(1)];

        let err = validate_map(&[broken], &textures, 2).unwrap_err();
        assert!(matches!(
            err,
            RenderError::BindlessCapacityExceeded { requested: 3, capacity: 2 }
        ));
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let mut primitive = quad();
        primitive.indices[4] = 4;
        let err = validate_map(&[primitive], &[], 16).unwrap_err();
        assert!(err.to_string().contains("references vertex 4"));
    }

    #[test]
    fn non_triangle_lists_are_rejected() {
        let mut primitive = quad();
        primitive.indices.pop();
        assert!(matches!(
            validate_map(&[primitive], &[], 16),
            Err(RenderError::InvalidMap(_))
        ));
    }

    #[test]
    fn texture_size_must_match_rgba8() {
        let mut texture = white(4);
        texture.pixels.truncate(4 * 4 * 3);
        let err = validate_map(&[], &[texture], 16).unwrap_err();
        assert!(err.to_string().contains("needs 64"));

        let empty = Texture::rgba8(0, 4, Vec::new());
        assert!(validate_map(&[], &[empty], 16).is_err());
    }

    #[test]
    fn texture_override_must_exist() {
        let mut primitive = quad();
        primitive.texture = Some(1);
        assert!(validate_map(&[primitive.clone()], &[white(1)], 16).is_err());
        assert!(validate_map(&[primitive], &[white(1), white(1)], 16).is_ok());
    }

    #[test]
    fn texture_slot_defaults_to_primitive_index() {
        let primitive = quad();
        assert_eq!(primitive.texture_slot(0, 2), 0);
        assert_eq!(primitive.texture_slot(1, 2), 1);
        assert_eq!(primitive.texture_slot(2, 2), NO_TEXTURE);

        let pinned = Primitive { texture: Some(1), ..quad() };
        assert_eq!(pinned.texture_slot(5, 2), 1);
    }

    #[test]
    fn projection_flips_y_for_vulkan() {
        let camera = Camera::default();
        let gl_style = Mat4::perspective_rh(camera.fov_y, 16.0 / 9.0, camera.near, camera.far);
        let vk_style = camera.projection(16.0 / 9.0);
        assert_relative_eq!(vk_style.y_axis.y, -gl_style.y_axis.y);
        assert_relative_eq!(vk_style.x_axis.x, gl_style.x_axis.x);
    }

    #[test]
    fn view_dir_points_at_target() {
        let camera = Camera {
            eye: Vec3::new(0.0, 0.0, 10.0),
            target: Vec3::ZERO,
            ..Camera::default()
        };
        let frame = FrameState::from_camera(&camera, 1.0);
        let dir = frame.view_dir();
        assert_relative_eq!(dir.x, 0.0, epsilon = 1e-5);
        assert_relative_eq!(dir.y, 0.0, epsilon = 1e-5);
        assert_relative_eq!(dir.z, -1.0, epsilon = 1e-5);
        assert_eq!(frame.view_proj(), frame.proj * frame.view);
    }

    #[test]
    fn orbit_wraps_every_360_frames() {
        let a = Camera::orbit(10, 20.0, 12.0);
        let b = Camera::orbit(370, 20.0, 12.0);
        assert_relative_eq!(a.eye.x, b.eye.x, epsilon = 1e-4);
        assert_relative_eq!(a.eye.z, b.eye.z, epsilon = 1e-4);
        assert_relative_eq!(Camera::orbit(0, 20.0, 12.0).eye.z, 20.0);
    }

    #[test]
    fn actor_inverse_is_precomputed() {
        let actor = ActorTransform::new(Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0)));
        let round_trip = actor.model * actor.inv_model;
        assert!(round_trip.abs_diff_eq(Mat4::IDENTITY, 1e-6));
    }
}

// Procedural test level for the demo binary
//
// A checkered ground plane and a ring of blocks, each primitive with its own
// texture so texture k belongs to primitive k.

use glam::{Mat4, Vec3};

use crate::scene::{ActorTransform, Primitive, Texture, Vertex};

/// Side length in pixels of the generated textures
pub const TEXTURE_SIZE: u32 = 64;

const BLOCK_COUNT: usize = 8;
const RING_RADIUS: f32 = 3.0;

/// Flat square on the XZ plane centered at the origin, `divisions` quads per
/// side so the G-buffer position target has something to interpolate
pub fn ground(size: f32, divisions: u32) -> Primitive {
    let divisions = divisions.max(1);
    let step = size / divisions as f32;
    let half = size * 0.5;

    let mut vertices = Vec::with_capacity(((divisions + 1) * (divisions + 1)) as usize);
    for z in 0..=divisions {
        for x in 0..=divisions {
            let u = x as f32 / divisions as f32;
            let v = z as f32 / divisions as f32;
            vertices.push(Vertex::new(
                [-half + x as f32 * step, 0.0, -half + z as f32 * step],
                [0.0, 1.0, 0.0],
                [u * divisions as f32, v * divisions as f32],
            ));
        }
    }

    let row = divisions + 1;
    let mut indices = Vec::with_capacity((divisions * divisions * 6) as usize);
    for z in 0..divisions {
        for x in 0..divisions {
            let i = z * row + x;
            indices.extend_from_slice(&[i, i + row, i + 1, i + 1, i + row, i + row + 1]);
        }
    }

    Primitive { vertices, indices, texture: None }
}

/// Axis-aligned box with per-face normals and UVs
pub fn block(center: Vec3, half_extent: Vec3) -> Primitive {
    // (normal, tangent u, tangent v) per face
    const FACES: [([f32; 3], [f32; 3], [f32; 3]); 6] = [
        ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
        ([0.0, 0.0, -1.0], [-1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
        ([1.0, 0.0, 0.0], [0.0, 0.0, -1.0], [0.0, 1.0, 0.0]),
        ([-1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0]),
        ([0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, -1.0]),
        ([0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]),
    ];
    const CORNERS: [(f32, f32); 4] = [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)];

    let mut vertices = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);

    for (normal, u_axis, v_axis) in FACES {
        let n = Vec3::from(normal);
        let u = Vec3::from(u_axis);
        let v = Vec3::from(v_axis);
        let base = vertices.len() as u32;

        for (su, sv) in CORNERS {
            let position = center + (n + u * su + v * sv) * half_extent;
            vertices.push(Vertex::new(
                position.to_array(),
                normal,
                [(su + 1.0) * 0.5, (1.0 - sv) * 0.5],
            ));
        }
        indices.extend_from_slice(&[base, base + 1, base + 2, base + 2, base + 3, base]);
    }

    Primitive { vertices, indices, texture: None }
}

/// Two-color checkerboard, `cell` pixels per square
pub fn checker(size: u32, cell: u32, a: [u8; 4], b: [u8; 4]) -> Texture {
    let cell = cell.max(1);
    let mut pixels = Vec::with_capacity((size * size * 4) as usize);
    for y in 0..size {
        for x in 0..size {
            let color = if ((x / cell) + (y / cell)) % 2 == 0 { a } else { b };
            pixels.extend_from_slice(&color);
        }
    }
    Texture::rgba8(size, size, pixels)
}

fn block_color(i: usize) -> [u8; 4] {
    const PALETTE: [[u8; 4]; 4] = [
        [200, 64, 48, 255],
        [56, 148, 72, 255],
        [64, 96, 200, 255],
        [220, 180, 60, 255],
    ];
    PALETTE[i % PALETTE.len()]
}

/// Ground plus a ring of blocks, one texture per primitive
pub fn level() -> (Vec<Primitive>, Vec<Texture>) {
    let mut primitives = Vec::with_capacity(BLOCK_COUNT + 1);
    let mut textures = Vec::with_capacity(BLOCK_COUNT + 1);

    primitives.push(ground(20.0, 20));
    textures.push(checker(TEXTURE_SIZE, 8, [90, 90, 90, 255], [160, 160, 160, 255]));

    for i in 0..BLOCK_COUNT {
        let angle = i as f32 / BLOCK_COUNT as f32 * std::f32::consts::TAU;
        let height = 0.25 + 0.25 * (i % 3) as f32;
        let center = Vec3::new(RING_RADIUS * angle.cos(), height, RING_RADIUS * angle.sin());

        primitives.push(block(center, Vec3::new(0.4, height, 0.4)));
        textures.push(checker(TEXTURE_SIZE, 16, block_color(i), [240, 240, 240, 255]));
    }

    (primitives, textures)
}

/// Actors bobbing above the ring, one per block
pub fn actors(frame: u64) -> Vec<ActorTransform> {
    let t = frame as f32 * 0.02;
    (0..BLOCK_COUNT)
        .map(|i| {
            let angle = i as f32 / BLOCK_COUNT as f32 * std::f32::consts::TAU;
            let lift = 2.0 + 0.3 * (t + i as f32).sin();
            let translation = Vec3::new(RING_RADIUS * angle.cos(), lift, RING_RADIUS * angle.sin());
            ActorTransform::new(Mat4::from_translation(translation) * Mat4::from_rotation_y(t))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{validate_map, MAX_ACTORS};
    use approx::assert_relative_eq;

    #[test]
    fn level_is_a_valid_map() {
        let (primitives, textures) = level();
        assert_eq!(primitives.len(), textures.len());
        assert!(validate_map(&primitives, &textures, 16536).is_ok());

        // Every primitive samples its own texture
        for (i, primitive) in primitives.iter().enumerate() {
            assert_eq!(primitive.texture_slot(i, textures.len()), i as u32);
        }
    }

    #[test]
    fn ground_grid_counts() {
        let plane = ground(10.0, 4);
        assert_eq!(plane.vertices.len(), 25);
        assert_eq!(plane.indices.len(), 4 * 4 * 6);
        assert!(plane.vertices.iter().all(|v| v.normal == [0.0, 1.0, 0.0]));
    }

    #[test]
    fn block_faces_point_outward() {
        let center = Vec3::new(1.0, 2.0, 3.0);
        let cube = block(center, Vec3::splat(0.5));
        assert_eq!(cube.vertices.len(), 24);
        assert_eq!(cube.indices.len(), 36);

        for vertex in &cube.vertices {
            let offset = Vec3::from(vertex.position) - center;
            let normal = Vec3::from(vertex.normal);
            assert_relative_eq!(offset.dot(normal), 0.5, epsilon = 1e-5);
        }
    }

    #[test]
    fn checker_alternates_cells() {
        let texture = checker(4, 2, [255, 0, 0, 255], [0, 0, 255, 255]);
        assert_eq!(texture.pixels.len(), texture.expected_len());
        assert_eq!(&texture.pixels[0..4], &[255, 0, 0, 255]);
        // Pixel (2, 0) is in the next cell
        assert_eq!(&texture.pixels[8..12], &[0, 0, 255, 255]);
    }

    #[test]
    fn actors_fit_the_uniform_buffer() {
        let actors = actors(42);
        assert!(actors.len() <= MAX_ACTORS);
        for actor in actors {
            let identity = actor.model * actor.inv_model;
            assert!(identity.abs_diff_eq(Mat4::IDENTITY, 1e-4));
        }
    }
}

use bytemuck::{Pod, Zeroable};

/// The vertex layout stored in the shared vertex pool.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct VertexNormalUV {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
}

impl VertexNormalUV {
    pub fn new(position: [f32; 3], normal: [f32; 3], uv: [f32; 2]) -> Self {
        Self {
            position,
            normal,
            uv,
        }
    }
}

/// A unit quad facing +z, two triangles.
pub fn quad() -> ([VertexNormalUV; 4], [u32; 6]) {
    let n = [0.0, 0.0, 1.0];
    (
        [
            VertexNormalUV::new([0.0, 0.0, 0.0], n, [0.0, 0.0]),
            VertexNormalUV::new([1.0, 0.0, 0.0], n, [1.0, 0.0]),
            VertexNormalUV::new([1.0, 1.0, 0.0], n, [1.0, 1.0]),
            VertexNormalUV::new([0.0, 1.0, 0.0], n, [0.0, 1.0]),
        ],
        [0, 1, 2, 0, 2, 3],
    )
}

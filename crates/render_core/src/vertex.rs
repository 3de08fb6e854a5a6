//! Vertex formats streamed through the dynamic buffers
//!
//! Layouts match the shader inputs of the pipeline catalog: a general
//! position/texcoord/color format for 2D and effect geometry, a
//! two-texcoord format for lightmapped world surfaces, and a
//! position/normal/texcoord format for animated models.

use ash::vk;
use bytemuck::{Pod, Zeroable};

/// General-purpose vertex: UI, sprites, particles, sky, water
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct BasicVertex {
    /// Object-space position
    pub position: [f32; 3],
    /// Texture coordinates
    pub texcoord: [f32; 2],
    /// RGBA color, 8 bits per channel
    pub color: [u8; 4],
}

impl BasicVertex {
    /// Vertex buffer binding description
    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: std::mem::size_of::<Self>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    /// Attribute descriptions: position, texcoord, color
    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 3] {
        [
            vk::VertexInputAttributeDescription {
                location: 0,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: 0,
            },
            vk::VertexInputAttributeDescription {
                location: 1,
                binding: 0,
                format: vk::Format::R32G32_SFLOAT,
                offset: 12,
            },
            vk::VertexInputAttributeDescription {
                location: 2,
                binding: 0,
                format: vk::Format::R8G8B8A8_UNORM,
                offset: 20,
            },
        ]
    }
}

/// Lightmapped world-surface vertex
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct WorldVertex {
    /// World-space position
    pub position: [f32; 3],
    /// Diffuse texture coordinates
    pub texcoord: [f32; 2],
    /// Lightmap texture coordinates
    pub lm_texcoord: [f32; 2],
}

impl WorldVertex {
    /// Vertex buffer binding description
    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: std::mem::size_of::<Self>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    /// Attribute descriptions: position, texcoord, lightmap texcoord
    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 3] {
        [
            vk::VertexInputAttributeDescription {
                location: 0,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: 0,
            },
            vk::VertexInputAttributeDescription {
                location: 1,
                binding: 0,
                format: vk::Format::R32G32_SFLOAT,
                offset: 12,
            },
            vk::VertexInputAttributeDescription {
                location: 2,
                binding: 0,
                format: vk::Format::R32G32_SFLOAT,
                offset: 20,
            },
        ]
    }
}

/// Animated model vertex
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct AliasVertex {
    /// Object-space position
    pub position: [f32; 3],
    /// Vertex normal for shading
    pub normal: [f32; 3],
    /// Skin texture coordinates
    pub texcoord: [f32; 2],
}

impl AliasVertex {
    /// Vertex buffer binding description
    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: std::mem::size_of::<Self>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    /// Attribute descriptions: position, normal, texcoord
    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 3] {
        [
            vk::VertexInputAttributeDescription {
                location: 0,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: 0,
            },
            vk::VertexInputAttributeDescription {
                location: 1,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: 12,
            },
            vk::VertexInputAttributeDescription {
                location: 2,
                binding: 0,
                format: vk::Format::R32G32_SFLOAT,
                offset: 24,
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_sizes_match_strides() {
        assert_eq!(std::mem::size_of::<BasicVertex>(), 24);
        assert_eq!(std::mem::size_of::<WorldVertex>(), 28);
        assert_eq!(std::mem::size_of::<AliasVertex>(), 32);
        assert_eq!(BasicVertex::binding_description().stride, 24);
        assert_eq!(WorldVertex::binding_description().stride, 28);
        assert_eq!(AliasVertex::binding_description().stride, 32);
    }

    #[test]
    fn attribute_offsets_are_packed() {
        let attrs = BasicVertex::attribute_descriptions();
        assert_eq!(attrs[0].offset, 0);
        assert_eq!(attrs[1].offset, 12);
        assert_eq!(attrs[2].offset, 20);

        let attrs = AliasVertex::attribute_descriptions();
        assert_eq!(attrs[2].offset, 24);
    }
}

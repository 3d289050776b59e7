//! Shaders every pipeline helper starts from.
//!
//! The graphics and compute defaults also ship as prebuilt SPIR-V so the
//! default pipelines can be created on machines without a GLSL compiler.

use ash::vk;

/// Empty `main`, used as the default compute shader.
pub const MINIMAL_GLSL: &str = "#version 450\nvoid main() {}\n";

pub const VERTEX_GLSL: &str = "#version 450\nvoid main() {\n   gl_Position = vec4(1);\n}\n";

pub const FRAGMENT_GLSL: &str = "#version 450\n\
layout(location = 0) out vec4 uFragColor;\n\
void main(){\n   uFragColor = vec4(0,1,0,1);\n}\n";

pub const RAYGEN_GLSL: &str = "#version 460 core\n\
#extension GL_NV_ray_tracing : require\n\
layout(set = 0, binding = 0, rgba8) uniform image2D image;\n\
layout(set = 0, binding = 1) uniform accelerationStructureNV as;\n\
\n\
layout(location = 0) rayPayloadNV float payload;\n\
\n\
void main()\n\
{\n\
   vec4 col = vec4(0, 0, 0, 1);\n\
\n\
   vec3 origin = vec3(float(gl_LaunchIDNV.x)/float(gl_LaunchSizeNV.x), float(gl_LaunchIDNV.y)/float(gl_LaunchSizeNV.y), 1.0);\n\
   vec3 dir = vec3(0.0, 0.0, -1.0);\n\
\n\
   payload = 0.5;\n\
   traceNV(as, gl_RayFlagsCullBackFacingTrianglesNV, 0xff, 0, 1, 0, origin, 0.0, dir, 1000.0, 0);\n\
\n\
   col.y = payload;\n\
\n\
   imageStore(image, ivec2(gl_LaunchIDNV.xy), col);\n\
}\n";

pub const CLOSEST_HIT_GLSL: &str = "#version 460 core\n\
#extension GL_NV_ray_tracing : require\n\
layout(location = 0) rayPayloadInNV float hitValue;\n\
\n\
void main() {\n\
    hitValue = 1.0;\n\
}\n";

pub const MISS_GLSL: &str = "#version 460 core\n\
#extension GL_NV_ray_tracing : require\n\
layout(location = 0) rayPayloadInNV float hitValue;\n\
\n\
void main() {\n\
    hitValue = 0.0;\n\
}\n";

/// `GLCompute` entry point `main` with local size 1x1x1.
#[rustfmt::skip]
pub const COMPUTE_MINIMAL_SPIRV: &[u32] = &[
    0x0723_0203, 0x0001_0000, 0, 5, 0,
    0x0002_0011, 1,
    0x0003_000E, 0, 1,
    0x0005_000F, 5, 1, 0x6E69_616D, 0,
    0x0006_0010, 1, 17, 1, 1, 1,
    0x0002_0013, 2,
    0x0003_0021, 3, 2,
    0x0005_0036, 2, 1, 0, 3,
    0x0002_00F8, 4,
    0x0001_00FD,
    0x0001_0038,
];

/// Vertex shader writing `vec4(1)` to `Position`.
#[rustfmt::skip]
pub const VERTEX_SPIRV: &[u32] = &[
    0x0723_0203, 0x0001_0000, 0, 11, 0,
    0x0002_0011, 1,
    0x0003_000E, 0, 1,
    0x0006_000F, 0, 1, 0x6E69_616D, 0, 2,
    0x0004_0047, 2, 11, 0,
    0x0002_0013, 3,
    0x0003_0021, 4, 3,
    0x0003_0016, 5, 32,
    0x0004_0017, 6, 5, 4,
    0x0004_0020, 7, 3, 6,
    0x0004_003B, 7, 2, 3,
    0x0004_002B, 5, 8, 0x3F80_0000,
    0x0007_002C, 6, 9, 8, 8, 8, 8,
    0x0005_0036, 3, 1, 0, 4,
    0x0002_00F8, 10,
    0x0003_003E, 2, 9,
    0x0001_00FD,
    0x0001_0038,
];

/// Fragment shader writing opaque green to location 0.
#[rustfmt::skip]
pub const FRAGMENT_SPIRV: &[u32] = &[
    0x0723_0203, 0x0001_0000, 0, 12, 0,
    0x0002_0011, 1,
    0x0003_000E, 0, 1,
    0x0006_000F, 4, 1, 0x6E69_616D, 0, 2,
    0x0003_0010, 1, 7,
    0x0004_0047, 2, 30, 0,
    0x0002_0013, 3,
    0x0003_0021, 4, 3,
    0x0003_0016, 5, 32,
    0x0004_0017, 6, 5, 4,
    0x0004_0020, 7, 3, 6,
    0x0004_003B, 7, 2, 3,
    0x0004_002B, 5, 8, 0,
    0x0004_002B, 5, 9, 0x3F80_0000,
    0x0007_002C, 6, 10, 8, 9, 8, 9,
    0x0005_0036, 3, 1, 0, 4,
    0x0002_00F8, 11,
    0x0003_003E, 2, 10,
    0x0001_00FD,
    0x0001_0038,
];

/// Prebuilt words for one of the GLSL texts above, if there are any.
pub fn precompiled(stage: vk::ShaderStageFlags, glsl: &str) -> Option<&'static [u32]> {
    match (stage, glsl) {
        (vk::ShaderStageFlags::COMPUTE, MINIMAL_GLSL) => Some(COMPUTE_MINIMAL_SPIRV),
        (vk::ShaderStageFlags::VERTEX, VERTEX_GLSL) => Some(VERTEX_SPIRV),
        (vk::ShaderStageFlags::FRAGMENT, FRAGMENT_GLSL) => Some(FRAGMENT_SPIRV),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::{validate_spirv_header, SPIRV_MAGIC};
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    /// Walks the instruction stream and returns the word offset it ends at.
    fn instruction_stream_end(words: &[u32]) -> usize {
        let mut offset = 5;
        while offset < words.len() {
            let count = (words[offset] >> 16) as usize;
            assert!(count > 0, "zero-length instruction at word {offset}");
            offset += count;
        }
        offset
    }

    #[rstest]
    #[case(COMPUTE_MINIMAL_SPIRV)]
    #[case(VERTEX_SPIRV)]
    #[case(FRAGMENT_SPIRV)]
    fn modules_are_well_formed(#[case] words: &[u32]) {
        validate_spirv_header(words).unwrap();
        assert_eq!(words[0], SPIRV_MAGIC);
        let end = instruction_stream_end(words);
        assert_eq!(end, words.len(), "instruction lengths must tile the module");
        assert_eq!(*words.last().unwrap(), 0x0001_0038);
    }

    #[rstest]
    #[case(COMPUTE_MINIMAL_SPIRV, 5)]
    #[case(VERTEX_SPIRV, 11)]
    #[case(FRAGMENT_SPIRV, 12)]
    fn bound_is_one_past_the_last_id(#[case] words: &[u32], #[case] bound: u32) {
        assert_eq!(words[3], bound);
    }

    #[test]
    fn glsl_texts_declare_their_version() {
        for text in [MINIMAL_GLSL, VERTEX_GLSL, FRAGMENT_GLSL] {
            assert!(text.starts_with("#version 450\n"));
        }
        for text in [RAYGEN_GLSL, CLOSEST_HIT_GLSL, MISS_GLSL] {
            assert!(text.starts_with("#version 460 core\n"));
            assert!(text.contains("GL_NV_ray_tracing"));
        }
    }

    #[test]
    fn precompiled_lookup_requires_matching_stage() {
        assert!(precompiled(vk::ShaderStageFlags::VERTEX, VERTEX_GLSL).is_some());
        assert!(precompiled(vk::ShaderStageFlags::FRAGMENT, VERTEX_GLSL).is_none());
        assert!(precompiled(vk::ShaderStageFlags::VERTEX, MINIMAL_GLSL).is_none());
        assert!(precompiled(vk::ShaderStageFlags::RAYGEN_NV, RAYGEN_GLSL).is_none());
    }
}

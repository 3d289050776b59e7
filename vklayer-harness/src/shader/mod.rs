//! Shader sources and their conversion to SPIR-V.
//!
//! Tests describe shaders as GLSL, SPIR-V assembly or ready SPIR-V words.
//! A [`ShaderCompiler`] turns the first two into words; which backend is used
//! is decided once per run (see [`default_compiler`]).

use ash::vk;
use std::fmt::Debug;
use std::io::Cursor;
use std::sync::Arc;

use crate::config::ShaderToolConfig;
use crate::error::ShaderError;

pub mod builtin;
mod compiler;

pub use compiler::ExternalToolCompiler;
#[cfg(feature = "shaderc")]
pub use compiler::ShadercCompiler;

/// First word of every SPIR-V module.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;
/// Words in the module header (magic, version, generator, bound, schema).
pub const SPIRV_HEADER_WORDS: usize = 5;

/// A shader as a test writes it.
#[derive(Debug, Clone, Copy)]
pub enum ShaderSource<'a> {
    Glsl(&'a str),
    SpirvAsm(&'a str),
    Spirv(&'a [u32]),
}

impl ShaderSource<'_> {
    pub fn language(&self) -> &'static str {
        match self {
            ShaderSource::Glsl(_) => "GLSL",
            ShaderSource::SpirvAsm(_) => "SPIR-V assembly",
            ShaderSource::Spirv(_) => "SPIR-V",
        }
    }
}

/// Backend that turns text shaders into SPIR-V words.
pub trait ShaderCompiler: Send + Sync + Debug {
    fn name(&self) -> &str;

    fn compile_glsl(&self, stage: vk::ShaderStageFlags, source: &str) -> Result<Vec<u32>, ShaderError>;

    fn assemble(&self, source: &str) -> Result<Vec<u32>, ShaderError>;
}

/// Produces SPIR-V for `source`, compiling or assembling when needed.
///
/// Words supplied directly are passed through untouched so that tests can
/// hand malformed modules to the driver.
pub fn to_spirv(
    compiler: &dyn ShaderCompiler,
    stage: vk::ShaderStageFlags,
    source: &ShaderSource<'_>,
) -> Result<Vec<u32>, ShaderError> {
    match source {
        ShaderSource::Glsl(text) => match builtin::precompiled(stage, text) {
            Some(words) => Ok(words.to_vec()),
            None => compiler.compile_glsl(stage, text),
        },
        ShaderSource::SpirvAsm(text) => compiler.assemble(text),
        ShaderSource::Spirv(words) => Ok(words.to_vec()),
    }
}

/// Checks the magic number and that the header is complete.
pub fn validate_spirv_header(words: &[u32]) -> Result<(), ShaderError> {
    if words.len() < SPIRV_HEADER_WORDS {
        return Err(ShaderError::InvalidSpirv(format!(
            "{} words is shorter than the {SPIRV_HEADER_WORDS}-word header",
            words.len()
        )));
    }
    if words[0] != SPIRV_MAGIC {
        return Err(ShaderError::InvalidSpirv(format!(
            "bad magic number {:#010x}",
            words[0]
        )));
    }
    Ok(())
}

/// Reads a SPIR-V byte image produced by an external tool.
pub fn words_from_bytes(bytes: &[u8]) -> Result<Vec<u32>, ShaderError> {
    let words = ash::util::read_spv(&mut Cursor::new(bytes))
        .map_err(|e| ShaderError::InvalidSpirv(e.to_string()))?;
    validate_spirv_header(&words)?;
    Ok(words)
}

/// The compiler used when a test does not bring its own.
///
/// With the `shaderc` feature the in-process compiler is preferred and the
/// external tools remain the fallback for assembly.
pub fn default_compiler(tools: &ShaderToolConfig) -> Arc<dyn ShaderCompiler> {
    #[cfg(feature = "shaderc")]
    {
        match ShadercCompiler::new(tools) {
            Ok(compiler) => return Arc::new(compiler),
            Err(e) => tracing::warn!("shaderc unavailable, using external tools: {e}"),
        }
    }
    Arc::new(ExternalToolCompiler::new(tools))
}

/// Stage name as GLSL tools spell it on the command line.
pub fn stage_extension(stage: vk::ShaderStageFlags) -> Option<&'static str> {
    let name = match stage {
        vk::ShaderStageFlags::VERTEX => "vert",
        vk::ShaderStageFlags::TESSELLATION_CONTROL => "tesc",
        vk::ShaderStageFlags::TESSELLATION_EVALUATION => "tese",
        vk::ShaderStageFlags::GEOMETRY => "geom",
        vk::ShaderStageFlags::FRAGMENT => "frag",
        vk::ShaderStageFlags::COMPUTE => "comp",
        vk::ShaderStageFlags::RAYGEN_NV => "rgen",
        vk::ShaderStageFlags::ANY_HIT_NV => "rahit",
        vk::ShaderStageFlags::CLOSEST_HIT_NV => "rchit",
        vk::ShaderStageFlags::MISS_NV => "rmiss",
        vk::ShaderStageFlags::INTERSECTION_NV => "rint",
        vk::ShaderStageFlags::CALLABLE_NV => "rcall",
        vk::ShaderStageFlags::TASK_NV => "task",
        vk::ShaderStageFlags::MESH_NV => "mesh",
        _ => return None,
    };
    Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[derive(Debug)]
    struct Refusing;

    impl ShaderCompiler for Refusing {
        fn name(&self) -> &str {
            "refusing"
        }

        fn compile_glsl(&self, _: vk::ShaderStageFlags, _: &str) -> Result<Vec<u32>, ShaderError> {
            Err(ShaderError::CompilerUnavailable {
                language: "GLSL",
                reason: "test".into(),
            })
        }

        fn assemble(&self, _: &str) -> Result<Vec<u32>, ShaderError> {
            Err(ShaderError::AssembleFailed("test".into()))
        }
    }

    #[test]
    fn raw_words_bypass_the_compiler() {
        let words = [SPIRV_MAGIC, 0x0001_0000, 0, 1, 0];
        let out = to_spirv(&Refusing, vk::ShaderStageFlags::VERTEX, &ShaderSource::Spirv(&words)).unwrap();
        assert_eq!(out, words.to_vec());
    }

    #[test]
    fn malformed_words_are_not_rejected_on_the_way_through() {
        let words = [0xDEAD_BEEF_u32, 0, 0];
        let out = to_spirv(&Refusing, vk::ShaderStageFlags::VERTEX, &ShaderSource::Spirv(&words)).unwrap();
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn text_sources_go_to_the_compiler() {
        let err = to_spirv(&Refusing, vk::ShaderStageFlags::FRAGMENT, &ShaderSource::Glsl("void main(){}"))
            .unwrap_err();
        assert!(matches!(err, ShaderError::CompilerUnavailable { .. }));
        let err = to_spirv(&Refusing, vk::ShaderStageFlags::FRAGMENT, &ShaderSource::SpirvAsm("OpNop"))
            .unwrap_err();
        assert!(matches!(err, ShaderError::AssembleFailed(_)));
    }

    #[test]
    fn builtin_glsl_does_not_need_a_compiler() {
        let out = to_spirv(
            &Refusing,
            vk::ShaderStageFlags::VERTEX,
            &ShaderSource::Glsl(builtin::VERTEX_GLSL),
        )
        .unwrap();
        assert_eq!(out, builtin::VERTEX_SPIRV.to_vec());
    }

    #[rstest]
    #[case(&[], false)]
    #[case(&[SPIRV_MAGIC, 0x0001_0000, 0, 1], false)]
    #[case(&[0x0302_2307, 0x0001_0000, 0, 1, 0], false)]
    #[case(&[SPIRV_MAGIC, 0x0001_0000, 0, 1, 0], true)]
    fn header_validation(#[case] words: &[u32], #[case] ok: bool) {
        assert_eq!(validate_spirv_header(words).is_ok(), ok);
    }

    #[test]
    fn bytes_must_be_word_aligned() {
        let bytes = [0x03, 0x02, 0x23, 0x07, 0x00];
        assert!(words_from_bytes(&bytes).is_err());
    }

    #[rstest]
    #[case(vk::ShaderStageFlags::VERTEX, Some("vert"))]
    #[case(vk::ShaderStageFlags::COMPUTE, Some("comp"))]
    #[case(vk::ShaderStageFlags::RAYGEN_NV, Some("rgen"))]
    #[case(vk::ShaderStageFlags::ALL_GRAPHICS, None)]
    fn stage_names(#[case] stage: vk::ShaderStageFlags, #[case] expected: Option<&str>) {
        assert_eq!(stage_extension(stage), expected);
    }
}

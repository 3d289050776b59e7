use ash::vk;
use std::ffi::OsStr;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

use super::{stage_extension, words_from_bytes, ShaderCompiler};
use crate::config::ShaderToolConfig;
use crate::error::ShaderError;

/// Runs `glslangValidator` and `spirv-as` as child processes.
#[derive(Debug, Clone)]
pub struct ExternalToolCompiler {
    glslang: PathBuf,
    spirv_as: PathBuf,
    target_env: String,
}

impl ExternalToolCompiler {
    pub fn new(tools: &ShaderToolConfig) -> Self {
        Self {
            glslang: tools.glslang.clone(),
            spirv_as: tools.spirv_as.clone(),
            target_env: tools.spirv_env.clone(),
        }
    }

    fn run(
        &self,
        language: &'static str,
        program: &Path,
        args: &[&OsStr],
        output: &Path,
    ) -> Result<Result<Vec<u32>, String>, ShaderError> {
        debug!(program = %program.display(), ?args, "running shader tool");
        let result = Command::new(program).args(args).output();
        let out = match result {
            Ok(out) => out,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ShaderError::CompilerUnavailable {
                    language,
                    reason: format!("{} not found on PATH", program.display()),
                })
            }
            Err(e) => {
                return Err(ShaderError::CompilerUnavailable {
                    language,
                    reason: format!("failed to spawn {}: {e}", program.display()),
                })
            }
        };
        if !out.status.success() {
            let mut log = String::from_utf8_lossy(&out.stdout).into_owned();
            log.push_str(&String::from_utf8_lossy(&out.stderr));
            return Ok(Err(log));
        }
        let bytes = std::fs::read(output).map_err(|e| ShaderError::InvalidSpirv(e.to_string()))?;
        Ok(Ok(words_from_bytes(&bytes)?))
    }
}

fn write_source(dir: &Path, file_name: &str, text: &str) -> Result<PathBuf, ShaderError> {
    let path = dir.join(file_name);
    let mut file = std::fs::File::create(&path).map_err(|e| ShaderError::CompilerUnavailable {
        language: "GLSL",
        reason: format!("cannot stage shader source: {e}"),
    })?;
    file.write_all(text.as_bytes())
        .map_err(|e| ShaderError::CompilerUnavailable {
            language: "GLSL",
            reason: format!("cannot stage shader source: {e}"),
        })?;
    Ok(path)
}

fn scratch_dir() -> Result<tempfile::TempDir, ShaderError> {
    tempfile::tempdir().map_err(|e| ShaderError::CompilerUnavailable {
        language: "GLSL",
        reason: format!("cannot create scratch directory: {e}"),
    })
}

impl ShaderCompiler for ExternalToolCompiler {
    fn name(&self) -> &str {
        "external tools"
    }

    fn compile_glsl(&self, stage: vk::ShaderStageFlags, source: &str) -> Result<Vec<u32>, ShaderError> {
        let ext = stage_extension(stage).ok_or_else(|| ShaderError::CompileFailed {
            stage,
            log: "stage has no GLSL file extension".to_string(),
        })?;
        let dir = scratch_dir()?;
        let input = write_source(dir.path(), &format!("shader.{ext}"), source)?;
        let output = dir.path().join("shader.spv");
        let args = [
            OsStr::new("-V"),
            OsStr::new("--target-env"),
            OsStr::new(&self.target_env),
            OsStr::new("-S"),
            OsStr::new(ext),
            OsStr::new("-o"),
            output.as_os_str(),
            input.as_os_str(),
        ];
        self.run("GLSL", &self.glslang, &args, &output)?
            .map_err(|log| ShaderError::CompileFailed { stage, log })
    }

    fn assemble(&self, source: &str) -> Result<Vec<u32>, ShaderError> {
        let dir = scratch_dir()?;
        let input = write_source(dir.path(), "shader.spvasm", source)?;
        let output = dir.path().join("shader.spv");
        let args = [
            OsStr::new("--target-env"),
            OsStr::new(&self.target_env),
            OsStr::new("-o"),
            output.as_os_str(),
            input.as_os_str(),
        ];
        self.run("SPIR-V assembly", &self.spirv_as, &args, &output)?
            .map_err(ShaderError::AssembleFailed)
    }
}

/// Parses a target environment such as `vulkan1.1` into the packed version
/// number shaderc expects.
pub fn parse_target_env(text: &str) -> Option<u32> {
    let rest = text.strip_prefix("vulkan")?;
    let (major, minor) = rest.split_once('.')?;
    let major: u32 = major.parse().ok()?;
    let minor: u32 = minor.parse().ok()?;
    Some((major << 22) | (minor << 12))
}

/// In-process GLSL compiler backed by shaderc.
///
/// A fresh `shaderc::Compiler` is made per call so the backend can be shared
/// across test threads.
#[cfg(feature = "shaderc")]
#[derive(Debug, Clone)]
pub struct ShadercCompiler {
    env_version: u32,
    fallback: ExternalToolCompiler,
}

#[cfg(feature = "shaderc")]
impl ShadercCompiler {
    pub fn new(tools: &ShaderToolConfig) -> Result<Self, ShaderError> {
        let env_version = parse_target_env(&tools.spirv_env).ok_or_else(|| ShaderError::CompilerUnavailable {
            language: "GLSL",
            reason: format!("unknown target environment {}", tools.spirv_env),
        })?;
        if shaderc::Compiler::new().is_none() {
            return Err(ShaderError::CompilerUnavailable {
                language: "GLSL",
                reason: "shaderc failed to initialize".to_string(),
            });
        }
        Ok(Self {
            env_version,
            fallback: ExternalToolCompiler::new(tools),
        })
    }

    fn kind(stage: vk::ShaderStageFlags) -> Option<shaderc::ShaderKind> {
        use shaderc::ShaderKind;
        let kind = match stage {
            vk::ShaderStageFlags::VERTEX => ShaderKind::Vertex,
            vk::ShaderStageFlags::TESSELLATION_CONTROL => ShaderKind::TessControl,
            vk::ShaderStageFlags::TESSELLATION_EVALUATION => ShaderKind::TessEvaluation,
            vk::ShaderStageFlags::GEOMETRY => ShaderKind::Geometry,
            vk::ShaderStageFlags::FRAGMENT => ShaderKind::Fragment,
            vk::ShaderStageFlags::COMPUTE => ShaderKind::Compute,
            vk::ShaderStageFlags::RAYGEN_NV => ShaderKind::RayGeneration,
            vk::ShaderStageFlags::ANY_HIT_NV => ShaderKind::AnyHit,
            vk::ShaderStageFlags::CLOSEST_HIT_NV => ShaderKind::ClosestHit,
            vk::ShaderStageFlags::MISS_NV => ShaderKind::Miss,
            vk::ShaderStageFlags::INTERSECTION_NV => ShaderKind::Intersection,
            vk::ShaderStageFlags::CALLABLE_NV => ShaderKind::Callable,
            vk::ShaderStageFlags::TASK_NV => ShaderKind::Task,
            vk::ShaderStageFlags::MESH_NV => ShaderKind::Mesh,
            _ => return None,
        };
        Some(kind)
    }
}

#[cfg(feature = "shaderc")]
impl ShaderCompiler for ShadercCompiler {
    fn name(&self) -> &str {
        "shaderc"
    }

    fn compile_glsl(&self, stage: vk::ShaderStageFlags, source: &str) -> Result<Vec<u32>, ShaderError> {
        let unavailable = |reason: &str| ShaderError::CompilerUnavailable {
            language: "GLSL",
            reason: reason.to_string(),
        };
        let kind = Self::kind(stage).ok_or_else(|| ShaderError::CompileFailed {
            stage,
            log: "stage is not supported by shaderc".to_string(),
        })?;
        let compiler = shaderc::Compiler::new().ok_or_else(|| unavailable("shaderc failed to initialize"))?;
        let mut options = shaderc::CompileOptions::new().ok_or_else(|| unavailable("shaderc options"))?;
        options.set_target_env(shaderc::TargetEnv::Vulkan, self.env_version);
        let artifact = compiler
            .compile_into_spirv(source, kind, "shader.glsl", "main", Some(&options))
            .map_err(|e| ShaderError::CompileFailed {
                stage,
                log: e.to_string(),
            })?;
        Ok(artifact.as_binary().to_vec())
    }

    fn assemble(&self, source: &str) -> Result<Vec<u32>, ShaderError> {
        let Some(compiler) = shaderc::Compiler::new() else {
            return self.fallback.assemble(source);
        };
        let mut options = shaderc::CompileOptions::new().ok_or_else(|| ShaderError::CompilerUnavailable {
            language: "SPIR-V assembly",
            reason: "shaderc options".to_string(),
        })?;
        options.set_target_env(shaderc::TargetEnv::Vulkan, self.env_version);
        let artifact = compiler
            .assemble(source, Some(&options))
            .map_err(|e| ShaderError::AssembleFailed(e.to_string()))?;
        Ok(artifact.as_binary().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn missing_tools() -> ExternalToolCompiler {
        ExternalToolCompiler::new(&ShaderToolConfig {
            glslang: PathBuf::from("/nonexistent/glslangValidator"),
            spirv_as: PathBuf::from("/nonexistent/spirv-as"),
            spirv_env: "vulkan1.0".to_string(),
        })
    }

    #[test]
    fn missing_glslang_is_reported_as_unavailable() {
        let err = missing_tools()
            .compile_glsl(vk::ShaderStageFlags::VERTEX, "#version 450\nvoid main() {}\n")
            .unwrap_err();
        assert!(matches!(err, ShaderError::CompilerUnavailable { language: "GLSL", .. }));
    }

    #[test]
    fn missing_assembler_is_reported_as_unavailable() {
        let err = missing_tools().assemble("OpCapability Shader").unwrap_err();
        assert!(matches!(
            err,
            ShaderError::CompilerUnavailable {
                language: "SPIR-V assembly",
                ..
            }
        ));
    }

    #[test]
    fn unknown_stage_fails_before_spawning() {
        let err = missing_tools()
            .compile_glsl(vk::ShaderStageFlags::ALL, "void main() {}")
            .unwrap_err();
        assert!(matches!(err, ShaderError::CompileFailed { .. }));
    }

    #[test]
    fn target_env_packs_like_vk_make_version() {
        assert_eq!(parse_target_env("vulkan1.0"), Some(1 << 22));
        assert_eq!(parse_target_env("vulkan1.1"), Some((1 << 22) | (1 << 12)));
        assert_eq!(parse_target_env("opengl4.5"), None);
        assert_eq!(parse_target_env("vulkan"), None);
    }
}

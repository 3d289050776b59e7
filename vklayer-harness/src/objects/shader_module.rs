use ash::vk;
use std::ffi::{CStr, CString};
use std::io::Cursor;
use std::sync::Arc;

use super::DeviceObject;
use crate::device::HarnessDevice;
use crate::error::{Result, ShaderError, VkResultExt};
use crate::shader::{ShaderCompiler, ShaderSource};

/// A shader module together with the stage and entry point it is used with.
pub struct ShaderModule {
    device: Arc<HarnessDevice>,
    raw: vk::ShaderModule,
    stage: vk::ShaderStageFlags,
    entry_point: CString,
}

impl ShaderModule {
    /// Creates a module from SPIR-V words with entry point `main`.
    pub fn from_spirv(device: &Arc<HarnessDevice>, stage: vk::ShaderStageFlags, code: &[u32]) -> Result<Self> {
        let info = vk::ShaderModuleCreateInfo::builder().code(code);
        let raw = unsafe { device.create_shader_module(&info, None) }
            .vk_context("vkCreateShaderModule")?;
        device.track(raw, "shader module");
        Ok(Self {
            device: Arc::clone(device),
            raw,
            stage,
            entry_point: CString::new("main")?,
        })
    }

    /// Creates a module from a SPIR-V file image.
    pub fn from_bytes(device: &Arc<HarnessDevice>, stage: vk::ShaderStageFlags, bytes: &[u8]) -> Result<Self> {
        let code = ash::util::read_spv(&mut Cursor::new(bytes))
            .map_err(|e| ShaderError::InvalidSpirv(e.to_string()))?;
        Self::from_spirv(device, stage, &code)
    }

    /// Compiles or assembles `source` as needed, then creates the module.
    pub fn from_source(
        device: &Arc<HarnessDevice>,
        compiler: &dyn ShaderCompiler,
        stage: vk::ShaderStageFlags,
        source: &ShaderSource<'_>,
    ) -> Result<Self> {
        let code = crate::shader::to_spirv(compiler, stage, source)?;
        Self::from_spirv(device, stage, &code)
    }

    /// Replaces the entry point name used in [`ShaderModule::stage_info`].
    pub fn with_entry_point(mut self, name: &str) -> Result<Self> {
        self.entry_point = CString::new(name)?;
        Ok(self)
    }

    pub fn handle(&self) -> vk::ShaderModule {
        self.raw
    }

    pub fn stage(&self) -> vk::ShaderStageFlags {
        self.stage
    }

    pub fn entry_point(&self) -> &CStr {
        &self.entry_point
    }

    /// Stage info pointing at this module; valid while `self` is alive.
    pub fn stage_info(&self) -> vk::PipelineShaderStageCreateInfo {
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(self.stage)
            .module(self.raw)
            .name(&self.entry_point)
            .build()
    }
}

impl DeviceObject for ShaderModule {
    type Handle = vk::ShaderModule;

    fn handle(&self) -> vk::ShaderModule {
        self.raw
    }

    fn device(&self) -> &Arc<HarnessDevice> {
        &self.device
    }
}

impl std::fmt::Debug for ShaderModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use ash::vk::Handle;
        f.debug_struct("ShaderModule")
            .field("handle", &self.raw.as_raw())
            .field("stage", &self.stage)
            .field("entry_point", &self.entry_point)
            .finish()
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe { self.device.destroy_shader_module(self.raw, None) };
        self.device.untrack(self.raw);
    }
}

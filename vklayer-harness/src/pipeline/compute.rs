use ash::vk;
use std::ptr;
use std::sync::Arc;
use tracing::debug;

use super::{run_oneshot, PipelineResources};
use crate::device::DeviceContext;
use crate::error::Result;
use crate::monitor::{Monitor, Needles};
use crate::objects::ShaderModule;
use crate::shader::{builtin, ShaderSource};

/// Builds compute pipelines; starts from an empty `main` shader and no
/// descriptor bindings.
pub struct ComputePipelineBuilder {
    pub create_info: vk::ComputePipelineCreateInfo,
    pub resources: PipelineResources,
    pub layout_override: Option<vk::PipelineLayout>,
    shader: ShaderModule,
    monitor: Arc<Monitor>,
}

impl ComputePipelineBuilder {
    pub fn new(ctx: &DeviceContext) -> Result<Self> {
        let shader = ctx.make_shader(
            vk::ShaderStageFlags::COMPUTE,
            &ShaderSource::Glsl(builtin::MINIMAL_GLSL),
        )?;
        let create_info = vk::ComputePipelineCreateInfo::builder()
            .stage(shader.stage_info())
            .build();
        Ok(Self {
            create_info,
            resources: PipelineResources::new(ctx.device()),
            layout_override: None,
            shader,
            monitor: Arc::clone(ctx.monitor()),
        })
    }

    pub fn set_shader(&mut self, shader: ShaderModule) {
        self.create_info.stage = shader.stage_info();
        self.shader = shader;
    }

    pub fn shader(&self) -> &ShaderModule {
        &self.shader
    }

    pub fn init_state(&mut self) -> Result<()> {
        self.resources.init_state()
    }

    pub fn late_bind(&mut self) -> &vk::ComputePipelineCreateInfo {
        self.create_info.layout = self
            .layout_override
            .unwrap_or_else(|| self.resources.layout_handle());
        &self.create_info
    }

    /// Calls `vkCreateComputePipelines` once and returns its status.
    pub fn create_compute_pipeline(&mut self, implicit_destroy: bool, do_late_bind: bool) -> vk::Result {
        if do_late_bind {
            self.late_bind();
        }
        self.resources.release_previous(implicit_destroy);
        let device = Arc::clone(self.resources.device());
        let mut raw = vk::Pipeline::null();
        let result = unsafe {
            (device.fp_v1_0().create_compute_pipelines)(
                device.handle(),
                self.resources.cache_handle(),
                1,
                &self.create_info,
                ptr::null(),
                &mut raw,
            )
        };
        debug!(?result, "vkCreateComputePipelines");
        self.resources.adopt(raw, result)
    }

    pub fn pipeline(&self) -> vk::Pipeline {
        self.resources.pipeline()
    }

    #[track_caller]
    pub fn oneshot_test<N: Needles>(
        ctx: &DeviceContext,
        configure: impl FnOnce(&mut Self),
        mask: vk::DebugReportFlagsEXT,
        needles: N,
        positive: bool,
    ) -> Result<bool> {
        let mut builder = Self::new(ctx)?;
        configure(&mut builder);
        builder.init_state()?;
        let monitor = Arc::clone(&builder.monitor);
        Ok(run_oneshot(&monitor, mask, needles, positive, || {
            builder.create_compute_pipeline(true, true)
        }))
    }
}

impl std::fmt::Debug for ComputePipelineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputePipelineBuilder")
            .field("shader", &self.shader)
            .field("resources", &self.resources)
            .finish()
    }
}

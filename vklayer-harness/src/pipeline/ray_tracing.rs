//! `VK_NV_ray_tracing` pipelines.

use ash::extensions::nv::RayTracing;
use ash::vk;
use std::ptr;
use std::sync::Arc;
use tracing::debug;

use super::{null_or, run_oneshot, PipelineResources};
use crate::device::DeviceContext;
use crate::error::{HarnessError, Result};
use crate::monitor::{Monitor, Needles};
use crate::objects::ShaderModule;
use crate::shader::{builtin, ShaderSource};

/// Instance extensions a ray tracing test must request.
pub const INSTANCE_EXTENSIONS: &[&str] = &["VK_KHR_get_physical_device_properties2"];
/// Device extensions a ray tracing test must request.
pub const DEVICE_EXTENSIONS: &[&str] = &["VK_NV_ray_tracing", "VK_KHR_get_memory_requirements2"];

fn group(
    ty: vk::RayTracingShaderGroupTypeNV,
    general: u32,
    closest_hit: u32,
) -> vk::RayTracingShaderGroupCreateInfoNV {
    vk::RayTracingShaderGroupCreateInfoNV::builder()
        .ty(ty)
        .general_shader(general)
        .closest_hit_shader(closest_hit)
        .any_hit_shader(vk::SHADER_UNUSED_NV)
        .intersection_shader(vk::SHADER_UNUSED_NV)
        .build()
}

/// Raygen in group 0, a triangle hit group on stage 1 and miss on stage 2.
pub fn default_groups() -> Vec<vk::RayTracingShaderGroupCreateInfoNV> {
    vec![
        group(vk::RayTracingShaderGroupTypeNV::GENERAL, 0, vk::SHADER_UNUSED_NV),
        group(
            vk::RayTracingShaderGroupTypeNV::TRIANGLES_HIT_GROUP,
            vk::SHADER_UNUSED_NV,
            1,
        ),
        group(vk::RayTracingShaderGroupTypeNV::GENERAL, 2, vk::SHADER_UNUSED_NV),
    ]
}

/// Storage image at binding 0 and acceleration structure at binding 1, both
/// visible to raygen.
pub fn default_bindings() -> Vec<vk::DescriptorSetLayoutBinding> {
    [
        vk::DescriptorType::STORAGE_IMAGE,
        vk::DescriptorType::ACCELERATION_STRUCTURE_NV,
    ]
    .into_iter()
    .enumerate()
    .map(|(binding, ty)| vk::DescriptorSetLayoutBinding {
        binding: binding as u32,
        descriptor_type: ty,
        descriptor_count: 1,
        stage_flags: vk::ShaderStageFlags::RAYGEN_NV,
        p_immutable_samplers: ptr::null(),
    })
    .collect()
}

pub struct RayTracingPipelineBuilder {
    pub stages: Vec<vk::PipelineShaderStageCreateInfo>,
    pub groups: Vec<vk::RayTracingShaderGroupCreateInfoNV>,
    pub create_info: vk::RayTracingPipelineCreateInfoNV,
    pub resources: PipelineResources,
    pub layout_override: Option<vk::PipelineLayout>,
    shaders: Vec<ShaderModule>,
    loader: RayTracing,
    monitor: Arc<Monitor>,
}

impl RayTracingPipelineBuilder {
    /// Fails with a missing prerequisite unless the context enabled the ray
    /// tracing extension. The shaders need a GLSL compiler that knows
    /// `GL_NV_ray_tracing`.
    pub fn new(ctx: &DeviceContext) -> Result<Self> {
        if let Some(missing) = DEVICE_EXTENSIONS.iter().find(|ext| !ctx.extension_enabled(ext)) {
            return Err(HarnessError::MissingPrerequisite(format!(
                "device extension {missing} is not enabled"
            )));
        }
        let sources = [
            (vk::ShaderStageFlags::RAYGEN_NV, builtin::RAYGEN_GLSL),
            (vk::ShaderStageFlags::CLOSEST_HIT_NV, builtin::CLOSEST_HIT_GLSL),
            (vk::ShaderStageFlags::MISS_NV, builtin::MISS_GLSL),
        ];
        let shaders = sources
            .into_iter()
            .map(|(stage, text)| ctx.make_shader(stage, &ShaderSource::Glsl(text)))
            .collect::<Result<Vec<_>>>()?;

        let mut resources = PipelineResources::new(ctx.device());
        resources.dsl_bindings = default_bindings();
        let loader = RayTracing::new(ctx.instance().raw(), ctx.device().raw());
        Ok(Self {
            stages: shaders.iter().map(ShaderModule::stage_info).collect(),
            groups: default_groups(),
            create_info: vk::RayTracingPipelineCreateInfoNV::builder()
                .max_recursion_depth(0)
                .build(),
            resources,
            layout_override: None,
            shaders,
            loader,
            monitor: Arc::clone(ctx.monitor()),
        })
    }

    pub fn shaders(&self) -> &[ShaderModule] {
        &self.shaders
    }

    pub fn init_state(&mut self) -> Result<()> {
        self.resources.init_state()
    }

    pub fn late_bind(&mut self) -> &vk::RayTracingPipelineCreateInfoNV {
        let layout = self
            .layout_override
            .unwrap_or_else(|| self.resources.layout_handle());
        let ci = &mut self.create_info;
        ci.layout = layout;
        ci.stage_count = self.stages.len() as u32;
        ci.p_stages = null_or(&self.stages);
        ci.group_count = self.groups.len() as u32;
        ci.p_groups = null_or(&self.groups);
        &self.create_info
    }

    /// Calls `vkCreateRayTracingPipelinesNV` once and returns its status.
    pub fn create_ray_tracing_pipeline(&mut self, implicit_destroy: bool, do_late_bind: bool) -> vk::Result {
        if do_late_bind {
            self.late_bind();
        }
        self.resources.release_previous(implicit_destroy);
        let device = Arc::clone(self.resources.device());
        let mut raw = vk::Pipeline::null();
        let result = unsafe {
            (self.loader.fp().create_ray_tracing_pipelines_nv)(
                device.handle(),
                self.resources.cache_handle(),
                1,
                &self.create_info,
                ptr::null(),
                &mut raw,
            )
        };
        debug!(?result, "vkCreateRayTracingPipelinesNV");
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
            builder.create_ray_tracing_pipeline(true, true)
        }))
    }
}

impl std::fmt::Debug for RayTracingPipelineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RayTracingPipelineBuilder")
            .field("stages", &self.stages.len())
            .field("groups", &self.groups.len())
            .field("resources", &self.resources)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn groups_reference_raygen_hit_and_miss() {
        let groups = default_groups();
        let summary: Vec<_> = groups
            .iter()
            .map(|g| (g.ty, g.general_shader, g.closest_hit_shader))
            .collect();
        assert_eq!(
            summary,
            vec![
                (vk::RayTracingShaderGroupTypeNV::GENERAL, 0, vk::SHADER_UNUSED_NV),
                (vk::RayTracingShaderGroupTypeNV::TRIANGLES_HIT_GROUP, vk::SHADER_UNUSED_NV, 1),
                (vk::RayTracingShaderGroupTypeNV::GENERAL, 2, vk::SHADER_UNUSED_NV),
            ]
        );
        assert!(groups
            .iter()
            .all(|g| g.any_hit_shader == vk::SHADER_UNUSED_NV && g.intersection_shader == vk::SHADER_UNUSED_NV));
    }

    #[test]
    fn bindings_are_raygen_only() {
        let bindings = default_bindings();
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[1].descriptor_type, vk::DescriptorType::ACCELERATION_STRUCTURE_NV);
        assert!(bindings.iter().all(|b| b.stage_flags == vk::ShaderStageFlags::RAYGEN_NV));
    }
}

//! `VK_NV_ray_tracing` pipelines. Skipped on devices without the extension.

use ash::vk;

use super::pipeline::bind_graphics_pipeline_at;
use crate::error::Result;
use crate::pipeline::ray_tracing::{DEVICE_EXTENSIONS, INSTANCE_EXTENSIONS};
use crate::pipeline::RayTracingPipelineBuilder;
use crate::testcase::{TestCase, TestContext};

fn ray_tracing_pipeline_default(t: &mut TestContext) -> Result<()> {
    RayTracingPipelineBuilder::oneshot_test(t, |_| {}, vk::DebugReportFlagsEXT::ERROR, "", true)?;
    Ok(())
}

fn pipeline_wrong_bind_point_ray_tracing(t: &mut TestContext) -> Result<()> {
    bind_graphics_pipeline_at(
        t,
        vk::PipelineBindPoint::RAY_TRACING_NV,
        "VUID-vkCmdBindPipeline-pipelineBindPoint-02392",
    )
}

/// A test that needs every ray tracing extension.
fn ray_tracing_case(name: &'static str, body: crate::testcase::TestBody) -> TestCase {
    let case = INSTANCE_EXTENSIONS
        .iter()
        .fold(TestCase::new(name, body), |case, ext| case.instance_extension(ext));
    DEVICE_EXTENSIONS
        .iter()
        .fold(case, |case, ext| case.device_extension(ext))
}

pub fn tests() -> Vec<TestCase> {
    vec![
        ray_tracing_case("CreateRayTracingPipelineDefault", ray_tracing_pipeline_default),
        ray_tracing_case("PipelineWrongBindPointRayTracing", pipeline_wrong_bind_point_ray_tracing),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn cases_carry_both_extension_lists() {
        for case in tests() {
            let req = case.requirements();
            assert_eq!(req.instance_extensions, INSTANCE_EXTENSIONS.to_vec());
            assert_eq!(req.device_extensions, DEVICE_EXTENSIONS.to_vec());
        }
    }
}

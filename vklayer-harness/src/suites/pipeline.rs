//! Pipeline creation, pipeline layouts and pipeline binding.

use ash::vk::{self, Handle};
use tracing::debug;

use crate::error::{HarnessError, Result};
use crate::objects::PipelineLayout;
use crate::pipeline::{ComputePipelineBuilder, GraphicsPipelineBuilder};
use crate::shader::{builtin, ShaderSource};
use crate::testcase::{TestCase, TestContext};

const ERROR: vk::DebugReportFlagsEXT = vk::DebugReportFlagsEXT::ERROR;

fn create_pipeline_default(t: &mut TestContext) -> Result<()> {
    GraphicsPipelineBuilder::oneshot_test(t, |_| {}, ERROR, "", true)?;
    Ok(())
}

fn create_compute_pipeline_default(t: &mut TestContext) -> Result<()> {
    ComputePipelineBuilder::oneshot_test(t, |_| {}, ERROR, "", true)?;
    Ok(())
}

fn pso_polygon_mode_invalid(t: &mut TestContext) -> Result<()> {
    let cases = [
        (vk::PolygonMode::POINT, "polygonMode cannot be VK_POLYGON_MODE_POINT or VK_POLYGON_MODE_LINE"),
        (vk::PolygonMode::LINE, "polygonMode cannot be VK_POLYGON_MODE_POINT or VK_POLYGON_MODE_LINE"),
        (
            vk::PolygonMode::FILL_RECTANGLE_NV,
            "VUID-VkPipelineRasterizationStateCreateInfo-polygonMode-01414",
        ),
    ];
    for (mode, needle) in cases {
        GraphicsPipelineBuilder::oneshot_test(
            t,
            |b| {
                let rs = &mut b.state.rasterization_state;
                rs.rasterizer_discard_enable = vk::TRUE;
                rs.line_width = 1.0;
                rs.polygon_mode = mode;
            },
            ERROR,
            needle,
            false,
        )?;
    }
    Ok(())
}

/// Widths other than exactly 1.0 need the `wideLines` feature.
pub fn invalid_line_widths() -> [f32; 5] {
    [-1.0, 0.0, 1.0 - f32::EPSILON, 1.0 + f32::EPSILON, f32::NAN]
}

fn pso_line_width_invalid(t: &mut TestContext) -> Result<()> {
    for width in invalid_line_widths() {
        GraphicsPipelineBuilder::oneshot_test(
            t,
            |b| {
                b.state.input_assembly_state.topology = vk::PrimitiveTopology::LINE_LIST;
                b.state.rasterization_state.line_width = width;
            },
            ERROR,
            "VUID-VkGraphicsPipelineCreateInfo-pDynamicStates-00749",
            false,
        )?;
    }

    t.command_buffer_mut().begin()?;
    for width in invalid_line_widths() {
        t.expect_error("VUID-vkCmdSetLineWidth-lineWidth-00788");
        t.command_buffer().set_line_width(width);
        t.verify_found();
    }
    t.command_buffer_mut().end()?;
    Ok(())
}

fn enable_logic_op(b: &mut GraphicsPipelineBuilder, op: vk::LogicOp) {
    let blend = b
        .state
        .color_blend_state
        .get_or_insert_with(vk::PipelineColorBlendStateCreateInfo::default);
    blend.logic_op_enable = vk::TRUE;
    blend.logic_op = op;
}

fn color_blend_invalid_logic_op(t: &mut TestContext) -> Result<()> {
    GraphicsPipelineBuilder::oneshot_test(
        t,
        |b| enable_logic_op(b, vk::LogicOp::from_raw(16)),
        ERROR,
        "VUID-VkPipelineColorBlendStateCreateInfo-logicOpEnable-00607",
        false,
    )?;
    Ok(())
}

fn color_blend_unsupported_logic_op(t: &mut TestContext) -> Result<()> {
    GraphicsPipelineBuilder::oneshot_test(
        t,
        |b| enable_logic_op(b, vk::LogicOp::COPY),
        ERROR,
        "VUID-VkPipelineColorBlendStateCreateInfo-logicOpEnable-00606",
        false,
    )?;
    Ok(())
}

/// One binding more than the device allows; the last reuses binding 0.
pub fn too_many_bindings(max_bindings: u32) -> Vec<vk::VertexInputBindingDescription> {
    let mut bindings: Vec<_> = (0..=max_bindings)
        .map(|binding| vk::VertexInputBindingDescription {
            binding,
            stride: 4,
            input_rate: vk::VertexInputRate::VERTEX,
        })
        .collect();
    if let Some(last) = bindings.last_mut() {
        last.binding = 0;
    }
    bindings
}

/// One attribute more than the device allows; the last reuses location 0
/// and points at a binding that does not exist.
pub fn too_many_attributes(max_attributes: u32) -> Vec<vk::VertexInputAttributeDescription> {
    let mut attributes: Vec<_> = (0..=max_attributes)
        .map(|location| vk::VertexInputAttributeDescription {
            location,
            binding: 0,
            format: vk::Format::R32G32B32_SFLOAT,
            offset: 0,
        })
        .collect();
    if let Some(last) = attributes.last_mut() {
        last.location = 0;
        last.binding = 1;
    }
    attributes
}

fn invalid_vertex_binding_descriptions(t: &mut TestContext) -> Result<()> {
    let bindings = too_many_bindings(t.physical().limits().max_vertex_input_bindings);
    let attribute = vk::VertexInputAttributeDescription {
        location: 0,
        binding: 0,
        format: vk::Format::R32G32B32_SFLOAT,
        offset: 0,
    };
    GraphicsPipelineBuilder::oneshot_test(
        t,
        |b| {
            b.state.set_vertex_input(bindings, vec![attribute]);
        },
        ERROR,
        [
            "VUID-VkPipelineVertexInputStateCreateInfo-vertexBindingDescriptionCount-00613",
            "VUID-VkPipelineVertexInputStateCreateInfo-pVertexBindingDescriptions-00616",
        ],
        false,
    )?;
    Ok(())
}

fn invalid_vertex_attribute_descriptions(t: &mut TestContext) -> Result<()> {
    let attributes = too_many_attributes(t.physical().limits().max_vertex_input_attributes);
    let binding = vk::VertexInputBindingDescription {
        binding: 0,
        stride: 12,
        input_rate: vk::VertexInputRate::VERTEX,
    };
    GraphicsPipelineBuilder::oneshot_test(
        t,
        |b| {
            b.state.set_vertex_input(vec![binding], attributes);
        },
        ERROR,
        [
            "VUID-VkPipelineVertexInputStateCreateInfo-vertexAttributeDescriptionCount-00614",
            "VUID-VkVertexInputAttributeDescription-binding-00615",
            "VUID-VkPipelineVertexInputStateCreateInfo-pVertexAttributeDescriptions-00617",
        ],
        false,
    )?;
    Ok(())
}

fn invalid_pipeline_create_state(t: &mut TestContext) -> Result<()> {
    let fs = t.make_shader(vk::ShaderStageFlags::FRAGMENT, &ShaderSource::Glsl(builtin::FRAGMENT_GLSL))?;
    GraphicsPipelineBuilder::oneshot_test(
        t,
        |b| b.set_shaders(vec![fs]),
        ERROR,
        "Invalid Pipeline CreateInfo State: Vertex Shader required",
        false,
    )?;
    Ok(())
}

fn create_pipeline_duplicate_stage(t: &mut TestContext) -> Result<()> {
    let vs = ShaderSource::Glsl(builtin::VERTEX_GLSL);
    let shaders = vec![
        t.make_shader(vk::ShaderStageFlags::VERTEX, &vs)?,
        t.make_shader(vk::ShaderStageFlags::VERTEX, &vs)?,
        t.make_shader(vk::ShaderStageFlags::FRAGMENT, &ShaderSource::Glsl(builtin::FRAGMENT_GLSL))?,
    ];
    GraphicsPipelineBuilder::oneshot_test(
        t,
        |b| b.set_shaders(shaders),
        ERROR,
        "Multiple shaders provided for stage VK_SHADER_STAGE_VERTEX_BIT",
        false,
    )?;
    Ok(())
}

fn create_pipeline_missing_entrypoint(t: &mut TestContext) -> Result<()> {
    let vs = t.make_shader(vk::ShaderStageFlags::VERTEX, &ShaderSource::Glsl(builtin::VERTEX_GLSL))?;
    let fs = t
        .make_shader(vk::ShaderStageFlags::FRAGMENT, &ShaderSource::Glsl(builtin::FRAGMENT_GLSL))?
        .with_entry_point("foo")?;
    GraphicsPipelineBuilder::oneshot_test(
        t,
        |b| b.set_shaders(vec![vs, fs]),
        ERROR,
        "No entrypoint found named `foo`",
        false,
    )?;
    Ok(())
}

fn pipeline_not_bound(t: &mut TestContext) -> Result<()> {
    let bogus = vk::Pipeline::from_raw(0xbaad_b1be);
    t.command_buffer_mut().begin()?;
    t.expect_error("VUID-vkCmdBindPipeline-pipeline-parameter");
    t.command_buffer().bind_pipeline(vk::PipelineBindPoint::GRAPHICS, bogus);
    t.verify_found();
    t.command_buffer_mut().end()?;
    Ok(())
}

fn pipeline_wrong_bind_point_graphics(t: &mut TestContext) -> Result<()> {
    let mut pipe = ComputePipelineBuilder::new(t)?;
    pipe.init_state()?;
    let result = pipe.create_compute_pipeline(true, true);
    if result != vk::Result::SUCCESS {
        return Err(HarnessError::vulkan("vkCreateComputePipelines", result));
    }

    t.command_buffer_mut().begin()?;
    t.expect_error("VUID-vkCmdBindPipeline-pipelineBindPoint-00779");
    t.command_buffer()
        .bind_pipeline(vk::PipelineBindPoint::GRAPHICS, pipe.pipeline());
    t.verify_found();
    t.command_buffer_mut().end()?;
    Ok(())
}

/// Creates the default graphics pipeline and binds it at `bind_point`.
pub fn bind_graphics_pipeline_at(
    t: &mut TestContext,
    bind_point: vk::PipelineBindPoint,
    needle: &str,
) -> Result<()> {
    let mut pipe = GraphicsPipelineBuilder::new(t)?;
    pipe.init_state()?;
    let result = pipe.create_graphics_pipeline(true, true);
    if result != vk::Result::SUCCESS {
        return Err(HarnessError::vulkan("vkCreateGraphicsPipelines", result));
    }

    t.command_buffer_mut().begin()?;
    t.expect_error(needle);
    t.command_buffer().bind_pipeline(bind_point, pipe.pipeline());
    t.verify_found();
    t.command_buffer_mut().end()?;
    Ok(())
}

fn pipeline_wrong_bind_point_compute(t: &mut TestContext) -> Result<()> {
    bind_graphics_pipeline_at(
        t,
        vk::PipelineBindPoint::COMPUTE,
        "VUID-vkCmdBindPipeline-pipelineBindPoint-00780",
    )
}

/// Needles for every pair of ranges sharing a stage, in report order.
pub fn duplicate_stage_needles(ranges: &[vk::PushConstantRange]) -> Vec<String> {
    let mut needles = Vec::new();
    for (i, a) in ranges.iter().enumerate() {
        for (j, b) in ranges.iter().enumerate().skip(i + 1) {
            if a.stage_flags.intersects(b.stage_flags) {
                needles.push(format!(
                    "vkCreatePipelineLayout() Duplicate stage flags found in ranges {i} and {j}."
                ));
            }
        }
    }
    needles
}

fn range(stage_flags: vk::ShaderStageFlags, offset: u32, size: u32) -> vk::PushConstantRange {
    vk::PushConstantRange {
        stage_flags,
        offset,
        size,
    }
}

/// Creates a layout over `ranges` expecting `needles`, dropping any layout
/// the driver creates anyway.
fn probe_layout<N: crate::monitor::Needles>(t: &TestContext, ranges: &[vk::PushConstantRange], needles: N) {
    t.set_desired_failures(ERROR, needles);
    match PipelineLayout::probe(t.device(), &[], ranges) {
        Ok(layout) => debug!(?layout, "Layout created despite invalid ranges"),
        Err(result) => debug!(?result, "vkCreatePipelineLayout refused"),
    }
    t.verify_found();
}

fn invalid_push_constants(t: &mut TestContext) -> Result<()> {
    let vertex = vk::ShaderStageFlags::VERTEX;
    let too_big = t.physical().limits().max_push_constants_size + 4;
    let prefix = "vkCreatePipelineLayout() call has push constants index 0";
    let cases = [
        (range(vertex, 0, 0), format!("{prefix} with size 0.")),
        (range(vertex, 0, 1), format!("{prefix} with size 1.")),
        (range(vertex, 1, 4), format!("{prefix} with offset 1. Offset must")),
        (range(vertex, 0, too_big), format!("{prefix} with offset ")),
        (
            range(vk::ShaderStageFlags::empty(), 0, 16),
            "vkCreatePipelineLayout: value of pCreateInfo->pPushConstantRanges[0].stageFlags must not be 0".to_string(),
        ),
    ];
    for (bad, needle) in &cases {
        probe_layout(t, std::slice::from_ref(bad), needle);
    }
    Ok(())
}

/// Range sets whose overlapping stages must each be reported.
pub fn duplicate_range_sets() -> Vec<Vec<vk::PushConstantRange>> {
    use vk::ShaderStageFlags as S;
    vec![
        vec![range(S::VERTEX, 0, 4); 5],
        vec![
            range(S::VERTEX, 0, 4),
            range(S::GEOMETRY, 0, 4),
            range(S::FRAGMENT, 0, 4),
            range(S::VERTEX, 0, 4),
            range(S::GEOMETRY, 0, 4),
        ],
        vec![
            range(S::FRAGMENT, 0, 4),
            range(S::TESSELLATION_CONTROL, 0, 4),
            range(S::VERTEX, 0, 4),
            range(S::VERTEX, 0, 4),
            range(S::GEOMETRY, 0, 4),
        ],
    ]
}

fn push_constant_range_overlap(t: &mut TestContext) -> Result<()> {
    let pair = [range(vk::ShaderStageFlags::VERTEX, 0, 4); 2];
    probe_layout(t, &pair, "Duplicate stage flags found in ranges 0 and 1");

    for ranges in duplicate_range_sets() {
        probe_layout(t, &ranges, duplicate_stage_needles(&ranges));
    }
    Ok(())
}

fn cmd_push_constants(t: &mut TestContext) -> Result<()> {
    use vk::ShaderStageFlags as S;
    let layout = t.make_pipeline_layout(&[], &[range(S::VERTEX, 16, 64), range(S::FRAGMENT, 0, 32)])?;
    let data = [0u8; 128];

    t.command_buffer_mut().begin()?;
    t.begin_default_render_pass()?;
    let push = |stages: S, offset: u32, size: u32| {
        t.command_buffer()
            .push_constants(layout.handle(), stages, offset, &data[..size as usize]);
    };

    t.expect_error("vkCmdPushConstants: value of stageFlags must not be 0");
    push(S::empty(), 0, 16);
    t.verify_found();

    t.expect_success();
    push(S::FRAGMENT, 0, 16);
    push(S::VERTEX, 32, 48);
    push(S::VERTEX | S::FRAGMENT, 16, 16);
    t.verify_not_found();

    t.set_desired_failures(
        ERROR,
        [
            "VUID-vkCmdPushConstants-offset-01795",
            "VUID-vkCmdPushConstants-offset-01796",
        ],
    );
    push(S::GEOMETRY, 0, 16);
    t.verify_found();

    t.expect_error("VUID-vkCmdPushConstants-offset-01795");
    push(S::FRAGMENT, 80, 4);
    t.verify_found();

    t.expect_error("VUID-vkCmdPushConstants-offset-01795");
    push(S::VERTEX | S::FRAGMENT, 0, 20);
    t.verify_found();

    t.expect_error("VUID-vkCmdPushConstants-offset-01796");
    push(S::VERTEX, 16, 16);
    t.verify_found();

    t.command_buffer_mut().end_render_pass()?;
    t.command_buffer_mut().end()?;
    Ok(())
}

pub fn tests() -> Vec<TestCase> {
    vec![
        TestCase::new("CreatePipelineDefault", create_pipeline_default),
        TestCase::new("CreateComputePipelineDefault", create_compute_pipeline_default),
        TestCase::new("PSOPolygonModeInvalid", pso_polygon_mode_invalid).no_features(),
        TestCase::new("PSOLineWidthInvalid", pso_line_width_invalid).no_features(),
        TestCase::new("ColorBlendInvalidLogicOp", color_blend_invalid_logic_op).feature("logicOp"),
        TestCase::new("ColorBlendUnsupportedLogicOp", color_blend_unsupported_logic_op).no_features(),
        TestCase::new("InvalidVertexBindingDescriptions", invalid_vertex_binding_descriptions),
        TestCase::new("InvalidVertexAttributeDescriptions", invalid_vertex_attribute_descriptions),
        TestCase::new("InvalidPipelineCreateState", invalid_pipeline_create_state),
        TestCase::new("CreatePipelineDuplicateStage", create_pipeline_duplicate_stage),
        TestCase::new("CreatePipelineMissingEntrypoint", create_pipeline_missing_entrypoint),
        TestCase::new("PipelineNotBound", pipeline_not_bound).render_target(None),
        TestCase::new("PipelineWrongBindPointGraphics", pipeline_wrong_bind_point_graphics),
        TestCase::new("PipelineWrongBindPointCompute", pipeline_wrong_bind_point_compute),
        TestCase::new("InvalidPushConstants", invalid_push_constants).render_target(None),
        TestCase::new("PushConstantRangeOverlap", push_constant_range_overlap).render_target(None),
        TestCase::new("CmdPushConstants", cmd_push_constants),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn only_exactly_one_is_a_valid_width() {
        for width in invalid_line_widths() {
            assert!(width != 1.0, "{width} is valid without wideLines");
        }
        assert!(invalid_line_widths()[4].is_nan());
    }

    #[test]
    fn binding_overflow_duplicates_binding_zero() {
        let bindings = too_many_bindings(16);
        assert_eq!(bindings.len(), 17);
        assert_eq!(bindings[16].binding, 0);
        assert_eq!(bindings[15].binding, 15);
    }

    #[test]
    fn attribute_overflow_reuses_location_zero_on_a_missing_binding() {
        let attributes = too_many_attributes(16);
        assert_eq!(attributes.len(), 17);
        assert_eq!((attributes[16].location, attributes[16].binding), (0, 1));
        assert!(attributes[..16].iter().all(|a| a.binding == 0));
    }

    #[test]
    fn five_identical_ranges_report_every_pair() {
        let sets = duplicate_range_sets();
        let needles = duplicate_stage_needles(&sets[0]);
        assert_eq!(needles.len(), 10);
        assert_eq!(
            needles[0],
            "vkCreatePipelineLayout() Duplicate stage flags found in ranges 0 and 1."
        );
        assert_eq!(
            needles[9],
            "vkCreatePipelineLayout() Duplicate stage flags found in ranges 3 and 4."
        );
    }

    #[test]
    fn mixed_ranges_report_only_shared_stages() {
        let sets = duplicate_range_sets();
        let suffixes = |ranges: &[vk::PushConstantRange]| -> Vec<String> {
            duplicate_stage_needles(ranges)
                .into_iter()
                .map(|n| n.rsplit("ranges ").next().unwrap_or_default().to_string())
                .collect()
        };
        assert_eq!(suffixes(&sets[1]), vec!["0 and 3.", "1 and 4."]);
        assert_eq!(suffixes(&sets[2]), vec!["2 and 3."]);
    }
}

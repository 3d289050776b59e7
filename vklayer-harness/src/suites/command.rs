//! Command pool, command buffer and draw-time validation.

use ash::vk;
use tracing::debug;

use super::full_clear_rect;
use crate::error::{HarnessError, Result};
use crate::pipeline::{GraphicsPipelineBuilder, GraphicsPipelineState};
use crate::testcase::{TestCase, TestContext};

/// What a draw-failure test leaves out or gets wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawFailure {
    LineWidth,
    DepthBias,
    Viewport,
    Scissor,
    BlendConstants,
    DepthBounds,
    StencilReadMask,
    StencilWriteMask,
    StencilReference,
    IndexBufferNotBound,
    IndexBufferBadSize,
    IndexBufferBadOffset,
    IndexBufferBadBindSize,
    IndexBufferBadBindOffset,
    ClearAttachmentIndex,
}

/// Size of the index buffer used by the index-buffer cases: 512 `u16`s.
const INDEX_BUFFER_SIZE: vk::DeviceSize = 1024;

impl DrawFailure {
    pub fn needs_depth(self) -> bool {
        matches!(
            self,
            Self::DepthBounds | Self::StencilReadMask | Self::StencilWriteMask | Self::StencilReference
        )
    }

    /// States the pipeline declares dynamic but the command buffer never sets.
    pub fn dynamic_states(self) -> &'static [vk::DynamicState] {
        match self {
            Self::LineWidth => &[vk::DynamicState::LINE_WIDTH],
            Self::DepthBias => &[vk::DynamicState::DEPTH_BIAS],
            Self::Viewport => &[vk::DynamicState::VIEWPORT],
            Self::Scissor => &[vk::DynamicState::SCISSOR],
            Self::BlendConstants => &[vk::DynamicState::BLEND_CONSTANTS],
            Self::DepthBounds => &[vk::DynamicState::DEPTH_BOUNDS],
            Self::StencilReadMask => &[vk::DynamicState::STENCIL_COMPARE_MASK],
            Self::StencilWriteMask => &[vk::DynamicState::STENCIL_WRITE_MASK],
            Self::StencilReference => &[vk::DynamicState::STENCIL_REFERENCE],
            _ => &[],
        }
    }

    /// Applies the pipeline side of the failure.
    pub fn configure(self, state: &mut GraphicsPipelineState) {
        let dynamic = self.dynamic_states();
        if !dynamic.is_empty() {
            state.make_dynamic(dynamic);
        }
        match self {
            Self::LineWidth => {
                state.input_assembly_state.topology = vk::PrimitiveTopology::LINE_LIST;
            }
            Self::DepthBias => {
                state.rasterization_state.depth_bias_enable = vk::TRUE;
            }
            Self::BlendConstants => {
                state.set_color_blend_attachments(vec![vk::PipelineColorBlendAttachmentState::builder()
                    .blend_enable(true)
                    .dst_alpha_blend_factor(vk::BlendFactor::CONSTANT_COLOR)
                    .color_write_mask(vk::ColorComponentFlags::RGBA)
                    .build()]);
            }
            _ => {}
        }
        if self.needs_depth() {
            state.depth_stencil_state = Some(stencil_testing_state(self == Self::DepthBounds));
        }
    }

    /// Offset the index buffer is bound at, if one is bound at all.
    pub fn index_binding(self) -> Option<vk::DeviceSize> {
        match self {
            Self::IndexBufferBadSize | Self::IndexBufferBadOffset => Some(0),
            Self::IndexBufferBadBindSize | Self::IndexBufferBadBindOffset => Some(INDEX_BUFFER_SIZE / 2),
            _ => None,
        }
    }

    /// `(index_count, first_index)` of the indexed draw, if the case draws
    /// indexed.
    pub fn indexed_draw(self) -> Option<(u32, u32)> {
        match self {
            Self::IndexBufferNotBound => Some((3, 0)),
            Self::IndexBufferBadSize => Some((513, 0)),
            Self::IndexBufferBadOffset => Some((512, 1)),
            Self::IndexBufferBadBindSize => Some((257, 0)),
            Self::IndexBufferBadBindOffset => Some((256, 1)),
            _ => None,
        }
    }
}

/// Depth write on and stencil test on, with every op `KEEP` and compare
/// `NEVER`, so depth and stencil dynamic state is consumed by draws.
fn stencil_testing_state(depth_bounds: bool) -> vk::PipelineDepthStencilStateCreateInfo {
    let stencil = vk::StencilOpState {
        fail_op: vk::StencilOp::KEEP,
        pass_op: vk::StencilOp::KEEP,
        depth_fail_op: vk::StencilOp::KEEP,
        compare_op: vk::CompareOp::NEVER,
        ..Default::default()
    };
    vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(false)
        .depth_write_enable(true)
        .depth_compare_op(vk::CompareOp::NEVER)
        .depth_bounds_test_enable(depth_bounds)
        .min_depth_bounds(0.0)
        .max_depth_bounds(0.0)
        .stencil_test_enable(true)
        .front(stencil)
        .back(stencil)
        .build()
}

/// Records one triangle draw that trips `failure`, submits it and waits.
///
/// The caller arms its expectation first and verifies afterwards. Cases that
/// [`DrawFailure::needs_depth`] expect a depth/stencil render target.
pub fn draw_triangle(t: &mut TestContext, failure: DrawFailure) -> Result<()> {
    let mut pipe = GraphicsPipelineBuilder::new(t)?;
    failure.configure(&mut pipe.state);
    pipe.init_state()?;
    let result = pipe.create_graphics_pipeline(true, true);
    if result != vk::Result::SUCCESS {
        return Err(HarnessError::vulkan("vkCreateGraphicsPipelines", result));
    }

    let index_buffer = match failure.index_binding() {
        Some(_) => Some(t.make_buffer(
            INDEX_BUFFER_SIZE,
            vk::BufferUsageFlags::INDEX_BUFFER,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?),
        None => None,
    };
    let extent = t.extent();

    t.command_buffer_mut().begin()?;
    t.command_buffer()
        .bind_pipeline(vk::PipelineBindPoint::GRAPHICS, pipe.pipeline());
    t.begin_default_render_pass()?;
    let cb = t.command_buffer();
    if let (Some(buffer), Some(offset)) = (&index_buffer, failure.index_binding()) {
        cb.bind_index_buffer(buffer.handle(), offset, vk::IndexType::UINT16);
    }
    match failure.indexed_draw() {
        Some((count, first)) => cb.draw_indexed(count, 1, first, 0, 0),
        None => cb.draw(3, 1, 0, 0),
    }
    if failure == DrawFailure::ClearAttachmentIndex {
        let attachment = vk::ClearAttachment {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            color_attachment: 2_000_000_000,
            clear_value: vk::ClearValue::default(),
        };
        cb.clear_attachments(&[attachment], &[full_clear_rect(extent, 1)]);
    }
    t.command_buffer_mut().end_render_pass()?;
    t.command_buffer_mut().end()?;
    t.submit_default_and_wait()?;
    debug!(?failure, "Draw submitted");
    Ok(())
}

macro_rules! draw_failure_tests {
    ($($fn_name:ident: $failure:ident => $needle:literal;)*) => {
        $(
            fn $fn_name(t: &mut TestContext) -> Result<()> {
                t.expect_error($needle);
                draw_triangle(t, DrawFailure::$failure)?;
                t.verify_found();
                Ok(())
            }
        )*
    };
}

draw_failure_tests! {
    dynamic_depth_bias_not_bound: DepthBias => "Dynamic depth bias state not set for this command buffer";
    dynamic_line_width_not_bound: LineWidth => "Dynamic line width state not set for this command buffer";
    dynamic_viewport_not_bound: Viewport =>
        "Dynamic viewport(s) 0 are used by pipeline state object, but were not provided";
    dynamic_scissor_not_bound: Scissor =>
        "Dynamic scissor(s) 0 are used by pipeline state object, but were not provided";
    dynamic_blend_constants_not_bound: BlendConstants => "Dynamic blend constants state not set for this command buffer";
    dynamic_depth_bounds_not_bound: DepthBounds => "Dynamic depth bounds state not set for this command buffer";
    dynamic_stencil_read_not_bound: StencilReadMask =>
        "Dynamic stencil read mask state not set for this command buffer";
    dynamic_stencil_write_not_bound: StencilWriteMask =>
        "Dynamic stencil write mask state not set for this command buffer";
    dynamic_stencil_ref_not_bound: StencilReference =>
        "Dynamic stencil reference state not set for this command buffer";
    index_buffer_not_bound: IndexBufferNotBound => "Index buffer object not bound to this command buffer when Indexed ";
    index_buffer_bad_size: IndexBufferBadSize => "vkCmdDrawIndexed() index size ";
    index_buffer_bad_offset: IndexBufferBadOffset => "vkCmdDrawIndexed() index size ";
    index_buffer_bad_bind_size: IndexBufferBadBindSize => "vkCmdDrawIndexed() index size ";
    index_buffer_bad_bind_offset: IndexBufferBadBindOffset => "vkCmdDrawIndexed() index size ";
    missing_clear_attachment: ClearAttachmentIndex => "VUID-vkCmdClearAttachments-aspectMask-02501";
}

fn invalid_command_pool_consistency(t: &mut TestContext) -> Result<()> {
    let family = t.graphics_queue().family_index();
    let flags = vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER;
    let pool_one = t.make_command_pool(family, flags)?;
    let pool_two = t.make_command_pool(family, flags)?;
    let cb = pool_one.allocate_primary()?;

    t.expect_error("VUID-vkFreeCommandBuffers-pCommandBuffers-parent");
    unsafe { t.device().free_command_buffers(pool_two.handle(), &[cb.handle()]) };
    t.verify_found();
    Ok(())
}

fn command_buffer_two_submits(t: &mut TestContext) -> Result<()> {
    t.command_buffer_mut().begin()?;
    t.command_buffer_mut().end()?;
    t.submit_default_and_wait()?;

    t.expect_error("VK_COMMAND_BUFFER_USAGE_ONE_TIME_SUBMIT_BIT set, but has been submitted");
    let cb = t.command_buffer().handle();
    let result = t.graphics_queue().submit_raw(&[cb], vk::Fence::null());
    debug!(?result, "Second submission");
    t.graphics_queue().wait_idle()?;
    t.verify_found();
    Ok(())
}

fn no_begin_command_buffer(t: &mut TestContext) -> Result<()> {
    let cb = t.command_pool().allocate_primary()?;
    t.expect_error("You must call vkBeginCommandBuffer() before this call to ");
    let result = unsafe { t.device().end_command_buffer(cb.handle()) };
    debug!(?result, "vkEndCommandBuffer without begin");
    t.verify_found();
    Ok(())
}

fn secondary_command_buffer_null_renderpass(t: &mut TestContext) -> Result<()> {
    let cb = t.command_pool().allocate_secondary()?;
    let inheritance = vk::CommandBufferInheritanceInfo::default();
    let info = vk::CommandBufferBeginInfo::builder()
        .flags(
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
                | vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE,
        )
        .inheritance_info(&inheritance);

    t.expect_error("VUID-VkCommandBufferBeginInfo-flags-00053");
    let result = unsafe { t.device().begin_command_buffer(cb.handle(), &info) };
    debug!(?result, "vkBeginCommandBuffer with a null render pass");
    t.verify_found();
    Ok(())
}

fn rerecorded_secondary(t: &mut TestContext, explicit_reset: bool) -> Result<()> {
    t.expect_error("was destroyed or rerecorded");

    let pool = t.make_command_pool(
        t.graphics_queue().family_index(),
        vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
    )?;
    let mut secondary = pool.allocate_secondary()?;
    let inheritance = vk::CommandBufferInheritanceInfo::default();
    secondary.begin_with(vk::CommandBufferUsageFlags::empty(), Some(&inheritance))?;
    secondary.end()?;

    t.command_buffer_mut().begin()?;
    t.command_buffer().execute_commands(&[secondary.handle()]);

    if explicit_reset {
        secondary.reset(vk::CommandBufferResetFlags::empty())?;
    }
    secondary.begin_with(vk::CommandBufferUsageFlags::empty(), Some(&inheritance))?;
    secondary.end()?;

    t.command_buffer().execute_commands(&[secondary.handle()]);
    t.verify_found();
    Ok(())
}

fn secondary_command_buffer_rerecorded_explicit_reset(t: &mut TestContext) -> Result<()> {
    rerecorded_secondary(t, true)
}

fn secondary_command_buffer_rerecorded_no_reset(t: &mut TestContext) -> Result<()> {
    rerecorded_secondary(t, false)
}

fn command_buffer_reset_errors(t: &mut TestContext) -> Result<()> {
    // A pool without RESET_COMMAND_BUFFER; every call goes around the
    // harness, which would refuse them.
    let pool = t.make_command_pool(t.graphics_queue().family_index(), vk::CommandPoolCreateFlags::empty())?;
    let cb = pool.allocate_primary()?;
    let inheritance = vk::CommandBufferInheritanceInfo::default();
    let info = vk::CommandBufferBeginInfo::builder()
        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
        .inheritance_info(&inheritance);
    let device = std::sync::Arc::clone(t.device());

    t.expect_error("VUID-vkBeginCommandBuffer-commandBuffer-00049");
    unsafe {
        let _ = device.begin_command_buffer(cb.handle(), &info);
        let _ = device.begin_command_buffer(cb.handle(), &info);
    }
    t.verify_found();

    t.expect_error("VUID-vkResetCommandBuffer-commandBuffer-00046");
    let result = unsafe { device.reset_command_buffer(cb.handle(), vk::CommandBufferResetFlags::empty()) };
    debug!(?result, "vkResetCommandBuffer on a non-resettable pool");
    t.verify_found();

    t.expect_error("VUID-vkBeginCommandBuffer-commandBuffer-00050");
    unsafe {
        let _ = device.end_command_buffer(cb.handle());
        let _ = device.begin_command_buffer(cb.handle(), &info);
    }
    t.verify_found();
    Ok(())
}

fn clear_color_attachments_outside_render_pass(t: &mut TestContext) -> Result<()> {
    t.expect_error("vkCmdClearAttachments(): This call must be issued inside an active render pass");
    let extent = t.extent();
    t.command_buffer_mut().begin()?;
    let attachment = vk::ClearAttachment {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        color_attachment: 0,
        clear_value: vk::ClearValue::default(),
    };
    t.command_buffer()
        .clear_attachments(&[attachment], &[full_clear_rect(extent, 1)]);
    t.verify_found();
    Ok(())
}

fn clear_color_attachments_zero_layer_count(t: &mut TestContext) -> Result<()> {
    t.expect_error("VUID-vkCmdClearAttachments-layerCount-01934");
    let extent = t.extent();
    t.command_buffer_mut().begin()?;
    t.begin_default_render_pass()?;
    let attachment = vk::ClearAttachment {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        color_attachment: 0,
        clear_value: vk::ClearValue::default(),
    };
    t.command_buffer()
        .clear_attachments(&[attachment], &[full_clear_rect(extent, 0)]);
    t.verify_found();
    Ok(())
}

fn execute_commands_primary_cb(t: &mut TestContext) -> Result<()> {
    let mut primary = t.command_pool().allocate_primary()?;
    primary.begin()?;
    primary.end()?;

    let begin = t
        .render_pass_begin()
        .ok_or_else(|| HarnessError::MissingPrerequisite("render target not initialized".to_string()))?;
    t.command_buffer_mut().begin()?;
    t.command_buffer_mut()
        .begin_render_pass(&begin, vk::SubpassContents::SECONDARY_COMMAND_BUFFERS)?;

    t.expect_error("VUID-vkCmdExecuteCommands-pCommandBuffers-00088");
    t.command_buffer().execute_commands(&[primary.handle()]);
    t.verify_found();

    t.set_suppressed("All elements of pCommandBuffers must not be in the pending state");
    t.command_buffer_mut().end_render_pass()?;
    t.command_buffer_mut().end()?;
    Ok(())
}

fn execute_unrecorded_primary_cb(t: &mut TestContext) -> Result<()> {
    let cb = t.command_buffer().handle();
    t.expect_error("VUID-vkQueueSubmit-pCommandBuffers-00072");
    let result = t.graphics_queue().submit_raw(&[cb], vk::Fence::null());
    debug!(?result, "Submitted a command buffer in the initial state");
    t.verify_found();
    Ok(())
}

pub fn tests() -> Vec<TestCase> {
    let with_depth = Some(crate::device::RenderTargetSpec {
        depth: true,
        ..Default::default()
    });
    vec![
        TestCase::new("InvalidCommandPoolConsistency", invalid_command_pool_consistency),
        TestCase::new("DynamicDepthBiasNotBound", dynamic_depth_bias_not_bound),
        TestCase::new("DynamicLineWidthNotBound", dynamic_line_width_not_bound),
        TestCase::new("DynamicViewportNotBound", dynamic_viewport_not_bound),
        TestCase::new("DynamicScissorNotBound", dynamic_scissor_not_bound),
        TestCase::new("DynamicBlendConstantsNotBound", dynamic_blend_constants_not_bound),
        TestCase::new("DynamicDepthBoundsNotBound", dynamic_depth_bounds_not_bound)
            .feature("depthBounds")
            .render_target(with_depth),
        TestCase::new("DynamicStencilReadNotBound", dynamic_stencil_read_not_bound).render_target(with_depth),
        TestCase::new("DynamicStencilWriteNotBound", dynamic_stencil_write_not_bound).render_target(with_depth),
        TestCase::new("DynamicStencilRefNotBound", dynamic_stencil_ref_not_bound).render_target(with_depth),
        TestCase::new("IndexBufferNotBound", index_buffer_not_bound),
        TestCase::new("IndexBufferBadSize", index_buffer_bad_size),
        TestCase::new("IndexBufferBadOffset", index_buffer_bad_offset),
        TestCase::new("IndexBufferBadBindSize", index_buffer_bad_bind_size),
        TestCase::new("IndexBufferBadBindOffset", index_buffer_bad_bind_offset),
        TestCase::new("MissingClearAttachment", missing_clear_attachment),
        TestCase::new("CommandBufferTwoSubmits", command_buffer_two_submits),
        TestCase::new("NoBeginCommandBuffer", no_begin_command_buffer).render_target(None),
        TestCase::new("SecondaryCommandBufferNullRenderpass", secondary_command_buffer_null_renderpass)
            .render_target(None),
        TestCase::new(
            "SecondaryCommandBufferRerecordedExplicitReset",
            secondary_command_buffer_rerecorded_explicit_reset,
        )
        .render_target(None),
        TestCase::new("SecondaryCommandBufferRerecordedNoReset", secondary_command_buffer_rerecorded_no_reset)
            .render_target(None),
        TestCase::new("CommandBufferResetErrors", command_buffer_reset_errors).render_target(None),
        TestCase::new("ClearColorAttachmentsOutsideRenderPass", clear_color_attachments_outside_render_pass),
        TestCase::new("ClearColorAttachmentsZeroLayercount", clear_color_attachments_zero_layer_count),
        TestCase::new("ExecuteCommandsPrimaryCB", execute_commands_primary_cb),
        TestCase::new("ExecuteUnrecordedPrimaryCB", execute_unrecorded_primary_cb).render_target(None),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn fresh_state() -> GraphicsPipelineState {
        GraphicsPipelineState::new(
            vk::Extent2D {
                width: 32,
                height: 32,
            },
            vk::RenderPass::null(),
        )
    }

    #[rstest]
    #[case(DrawFailure::Viewport, vk::DynamicState::VIEWPORT)]
    #[case(DrawFailure::Scissor, vk::DynamicState::SCISSOR)]
    #[case(DrawFailure::StencilReadMask, vk::DynamicState::STENCIL_COMPARE_MASK)]
    fn dynamic_state_cases_declare_one_state(#[case] failure: DrawFailure, #[case] expected: vk::DynamicState) {
        let mut state = fresh_state();
        failure.configure(&mut state);
        assert_eq!(state.dynamic_states, vec![expected]);
        assert!(state.dynamic_state.is_some());
        // The static viewport and scissor stay declared.
        assert_eq!((state.viewports.len(), state.scissors.len()), (1, 1));
    }

    #[test]
    fn depth_cases_enable_stencil_testing() {
        let mut state = fresh_state();
        DrawFailure::DepthBounds.configure(&mut state);
        let ds = state.depth_stencil_state.expect("depth/stencil state");
        assert_eq!(ds.depth_bounds_test_enable, vk::TRUE);
        assert_eq!(ds.stencil_test_enable, vk::TRUE);
        assert_eq!(ds.front.compare_op, vk::CompareOp::NEVER);

        let mut state = fresh_state();
        DrawFailure::StencilReference.configure(&mut state);
        assert_eq!(state.depth_stencil_state.map(|ds| ds.depth_bounds_test_enable), Some(vk::FALSE));
        assert!(DrawFailure::StencilWriteMask.needs_depth());
        assert!(!DrawFailure::Viewport.needs_depth());
    }

    #[test]
    fn line_width_and_blend_cases_adjust_fixed_state() {
        let mut state = fresh_state();
        DrawFailure::LineWidth.configure(&mut state);
        assert_eq!(state.input_assembly_state.topology, vk::PrimitiveTopology::LINE_LIST);

        let mut state = fresh_state();
        DrawFailure::BlendConstants.configure(&mut state);
        assert_eq!(state.color_blend_attachments.len(), 1);
        assert_eq!(state.color_blend_attachments[0].blend_enable, vk::TRUE);
        assert_eq!(
            state.color_blend_attachments[0].dst_alpha_blend_factor,
            vk::BlendFactor::CONSTANT_COLOR
        );
    }

    #[rstest]
    #[case(DrawFailure::IndexBufferNotBound, None, Some((3, 0)))]
    #[case(DrawFailure::IndexBufferBadSize, Some(0), Some((513, 0)))]
    #[case(DrawFailure::IndexBufferBadOffset, Some(0), Some((512, 1)))]
    #[case(DrawFailure::IndexBufferBadBindSize, Some(512), Some((257, 0)))]
    #[case(DrawFailure::IndexBufferBadBindOffset, Some(512), Some((256, 1)))]
    #[case(DrawFailure::ClearAttachmentIndex, None, None)]
    fn index_cases_overrun_the_buffer(
        #[case] failure: DrawFailure,
        #[case] binding: Option<vk::DeviceSize>,
        #[case] draw: Option<(u32, u32)>,
    ) {
        assert_eq!(failure.index_binding(), binding);
        assert_eq!(failure.indexed_draw(), draw);
        if let (Some(offset), Some((count, first))) = (binding, draw) {
            let indices_available = (INDEX_BUFFER_SIZE - offset) / 2;
            assert!(u64::from(count + first) > indices_available);
        }
    }
}

use ash::vk;
use std::sync::Arc;

use crate::device::HarnessDevice;
use crate::error::{Result, VkResultExt};

super::device_object!(RenderPass, vk::RenderPass, destroy_render_pass, "render pass");
super::device_object!(Framebuffer, vk::Framebuffer, destroy_framebuffer, "framebuffer");

impl RenderPass {
    pub fn new(
        device: &Arc<HarnessDevice>,
        attachments: &[vk::AttachmentDescription],
        subpasses: &[vk::SubpassDescription],
        dependencies: &[vk::SubpassDependency],
    ) -> Result<Self> {
        let info = vk::RenderPassCreateInfo::builder()
            .attachments(attachments)
            .subpasses(subpasses)
            .dependencies(dependencies);
        Self::with_info(device, &info)
    }

    pub fn with_info(device: &Arc<HarnessDevice>, info: &vk::RenderPassCreateInfo) -> Result<Self> {
        let raw = unsafe { device.create_render_pass(info, None) }.vk_context("vkCreateRenderPass")?;
        Ok(Self::from_raw(device, raw))
    }

    /// One subpass writing attachment 0 (color) and, if `depth_format` is
    /// given, attachment 1 (depth/stencil).
    pub fn single_subpass(
        device: &Arc<HarnessDevice>,
        color_format: vk::Format,
        depth_format: Option<vk::Format>,
    ) -> Result<Self> {
        Self::color_targets(device, color_format, 1, depth_format)
    }

    /// One subpass writing `color_count` color attachments followed by an
    /// optional depth/stencil attachment.
    pub fn color_targets(
        device: &Arc<HarnessDevice>,
        color_format: vk::Format,
        color_count: u32,
        depth_format: Option<vk::Format>,
    ) -> Result<Self> {
        let color_attachment = vk::AttachmentDescription::builder()
            .format(color_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .build();
        let color_refs: Vec<vk::AttachmentReference> = (0..color_count)
            .map(|attachment| vk::AttachmentReference {
                attachment,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            })
            .collect();
        let depth_ref = vk::AttachmentReference {
            attachment: color_count,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };

        let mut attachments = vec![color_attachment; color_count as usize];
        let mut subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if let Some(format) = depth_format {
            attachments.push(
                vk::AttachmentDescription::builder()
                    .format(format)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(vk::AttachmentLoadOp::CLEAR)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .stencil_load_op(vk::AttachmentLoadOp::CLEAR)
                    .stencil_store_op(vk::AttachmentStoreOp::STORE)
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                    .build(),
            );
            subpass = subpass.depth_stencil_attachment(&depth_ref);
        }
        let subpasses = [subpass.build()];

        // Orders the implicit layout transition before the first color write.
        let dependency = vk::SubpassDependency::builder()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
            .build();

        Self::new(device, &attachments, &subpasses, &[dependency])
    }
}

impl Framebuffer {
    pub fn new(
        device: &Arc<HarnessDevice>,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        let raw = unsafe { device.create_framebuffer(&info, None) }.vk_context("vkCreateFramebuffer")?;
        Ok(Self::from_raw(device, raw))
    }
}

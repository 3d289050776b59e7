use ash::vk;
use std::sync::Arc;

use super::DescriptorSetLayout;
use crate::device::HarnessDevice;
use crate::error::{Result, VkResultExt};

super::device_object!(
    PipelineLayout,
    vk::PipelineLayout,
    destroy_pipeline_layout,
    "pipeline layout"
);

impl PipelineLayout {
    pub fn new(
        device: &Arc<HarnessDevice>,
        set_layouts: &[&DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<Self> {
        let handles: Vec<vk::DescriptorSetLayout> = set_layouts.iter().map(|l| l.handle()).collect();
        Self::from_handles(device, &handles, push_constant_ranges)
    }

    pub fn from_handles(
        device: &Arc<HarnessDevice>,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<Self> {
        let info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(set_layouts)
            .push_constant_ranges(push_constant_ranges);
        let raw = unsafe { device.create_pipeline_layout(&info, None) }
            .vk_context("vkCreatePipelineLayout")?;
        Ok(Self::from_raw(device, raw))
    }

    /// Calls `vkCreatePipelineLayout` and returns the driver status as is.
    ///
    /// Used by tests that feed invalid ranges and only care about the
    /// diagnostics; a handle created anyway is wrapped so it is destroyed.
    pub fn probe(
        device: &Arc<HarnessDevice>,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> std::result::Result<Self, vk::Result> {
        let info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(set_layouts)
            .push_constant_ranges(push_constant_ranges);
        let raw = unsafe { device.create_pipeline_layout(&info, None) }?;
        Ok(Self::from_raw(device, raw))
    }
}

use ash::vk;
use std::sync::Arc;

use crate::device::HarnessDevice;
use crate::error::{Result, VkResultExt};

super::device_object!(Sampler, vk::Sampler, destroy_sampler, "sampler");

impl Sampler {
    pub fn new(device: &Arc<HarnessDevice>, info: &vk::SamplerCreateInfo) -> Result<Self> {
        let raw = unsafe { device.create_sampler(info, None) }.vk_context("vkCreateSampler")?;
        Ok(Self::from_raw(device, raw))
    }
}

/// A sampler that every implementation accepts: nearest filtering, clamped
/// addressing, no anisotropy or comparison.
pub fn safe_sane_sampler_info() -> vk::SamplerCreateInfo {
    vk::SamplerCreateInfo::builder()
        .mag_filter(vk::Filter::NEAREST)
        .min_filter(vk::Filter::NEAREST)
        .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
        .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
        .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
        .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
        .mip_lod_bias(0.0)
        .anisotropy_enable(false)
        .max_anisotropy(1.0)
        .compare_enable(false)
        .compare_op(vk::CompareOp::NEVER)
        .min_lod(0.0)
        .max_lod(0.0)
        .border_color(vk::BorderColor::FLOAT_OPAQUE_WHITE)
        .unnormalized_coordinates(false)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sane_sampler_defaults() {
        let info = safe_sane_sampler_info();
        assert_eq!(info.mag_filter, vk::Filter::NEAREST);
        assert_eq!(info.address_mode_w, vk::SamplerAddressMode::CLAMP_TO_EDGE);
        assert_eq!(info.anisotropy_enable, vk::FALSE);
        assert_eq!(info.border_color, vk::BorderColor::FLOAT_OPAQUE_WHITE);
        assert_eq!(info.unnormalized_coordinates, vk::FALSE);
    }
}

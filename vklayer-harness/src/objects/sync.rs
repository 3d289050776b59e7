use ash::vk;
use std::sync::Arc;

use crate::device::HarnessDevice;
use crate::error::{Result, VkResultExt};

super::device_object!(Event, vk::Event, destroy_event, "event");
super::device_object!(Semaphore, vk::Semaphore, destroy_semaphore, "semaphore");
super::device_object!(Fence, vk::Fence, destroy_fence, "fence");

impl Event {
    pub fn new(device: &Arc<HarnessDevice>) -> Result<Self> {
        let info = vk::EventCreateInfo::default();
        let raw = unsafe { device.create_event(&info, None) }.vk_context("vkCreateEvent")?;
        Ok(Self::from_raw(device, raw))
    }

    pub fn set(&self) -> Result<()> {
        unsafe { self.device.set_event(self.raw) }.vk_context("vkSetEvent")
    }

    pub fn reset(&self) -> Result<()> {
        unsafe { self.device.reset_event(self.raw) }.vk_context("vkResetEvent")
    }

    pub fn is_set(&self) -> Result<bool> {
        unsafe { self.device.get_event_status(self.raw) }.vk_context("vkGetEventStatus")
    }
}

impl Semaphore {
    pub fn new(device: &Arc<HarnessDevice>) -> Result<Self> {
        let info = vk::SemaphoreCreateInfo::default();
        let raw = unsafe { device.create_semaphore(&info, None) }.vk_context("vkCreateSemaphore")?;
        Ok(Self::from_raw(device, raw))
    }
}

impl Fence {
    pub fn new(device: &Arc<HarnessDevice>, signaled: bool) -> Result<Self> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::builder().flags(flags);
        let raw = unsafe { device.create_fence(&info, None) }.vk_context("vkCreateFence")?;
        Ok(Self::from_raw(device, raw))
    }

    pub fn wait(&self, timeout_ns: u64) -> Result<()> {
        unsafe { self.device.wait_for_fences(&[self.raw], true, timeout_ns) }
            .vk_context("vkWaitForFences")
    }

    pub fn reset(&self) -> Result<()> {
        unsafe { self.device.reset_fences(&[self.raw]) }.vk_context("vkResetFences")
    }
}

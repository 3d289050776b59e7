use ash::vk;
use std::sync::Arc;

use crate::device::HarnessDevice;
use crate::error::{HarnessError, Result, VkResultExt};

/// A device memory allocation, freed on drop.
pub struct DeviceMemory {
    device: Arc<HarnessDevice>,
    raw: vk::DeviceMemory,
    size: vk::DeviceSize,
    properties: vk::MemoryPropertyFlags,
}

impl DeviceMemory {
    /// Allocates memory satisfying `requirements` from the first memory type
    /// with `properties`.
    pub fn allocate(
        device: &Arc<HarnessDevice>,
        requirements: &vk::MemoryRequirements,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        let type_index = device
            .physical()
            .find_memory_type(requirements.memory_type_bits, properties)
            .ok_or(HarnessError::NoSuitableMemoryType {
                type_bits: requirements.memory_type_bits,
                properties,
            })?;
        let info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(type_index);
        let raw = unsafe { device.allocate_memory(&info, None) }.vk_context("vkAllocateMemory")?;
        device.track(raw, "device memory");
        Ok(Self {
            device: Arc::clone(device),
            raw,
            size: requirements.size,
            properties,
        })
    }

    pub fn handle(&self) -> vk::DeviceMemory {
        self.raw
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Copies `data` into host-visible memory at `offset`.
    pub fn write_bytes(&self, offset: vk::DeviceSize, data: &[u8]) -> Result<()> {
        if !self.properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            return Err(HarnessError::vulkan("vkMapMemory", vk::Result::ERROR_MEMORY_MAP_FAILED));
        }
        let len = data.len() as vk::DeviceSize;
        unsafe {
            let ptr = self
                .device
                .map_memory(self.raw, offset, len, vk::MemoryMapFlags::empty())
                .vk_context("vkMapMemory")?;
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.cast::<u8>(), data.len());
            let flushed = if self.properties.contains(vk::MemoryPropertyFlags::HOST_COHERENT) {
                Ok(())
            } else {
                let range = vk::MappedMemoryRange::builder()
                    .memory(self.raw)
                    .offset(offset)
                    .size(vk::WHOLE_SIZE)
                    .build();
                self.device
                    .flush_mapped_memory_ranges(&[range])
                    .vk_context("vkFlushMappedMemoryRanges")
            };
            self.device.unmap_memory(self.raw);
            flushed
        }
    }
}

impl std::fmt::Debug for DeviceMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use ash::vk::Handle;
        f.debug_struct("DeviceMemory")
            .field("handle", &self.raw.as_raw())
            .field("size", &self.size)
            .field("properties", &self.properties)
            .finish()
    }
}

impl Drop for DeviceMemory {
    fn drop(&mut self) {
        unsafe { self.device.free_memory(self.raw, None) };
        self.device.untrack(self.raw);
    }
}

use ash::vk;
use std::sync::Arc;

use super::{DeviceMemory, DeviceObject, MemoryBacked};
use crate::device::HarnessDevice;
use crate::error::{Result, VkResultExt};

/// A buffer, optionally with its own memory allocation.
pub struct Buffer {
    device: Arc<HarnessDevice>,
    raw: vk::Buffer,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    memory: Option<DeviceMemory>,
}

impl Buffer {
    /// Creates an exclusive buffer of `size` bytes and binds memory with
    /// `properties` to it.
    pub fn new(
        device: &Arc<HarnessDevice>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        let info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .build();
        Self::with_info(device, &info, properties)
    }

    pub fn with_info(
        device: &Arc<HarnessDevice>,
        info: &vk::BufferCreateInfo,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        let mut buffer = Self::unbound(device, info)?;
        let requirements = unsafe { device.get_buffer_memory_requirements(buffer.raw) };
        let memory = DeviceMemory::allocate(device, &requirements, properties)?;
        unsafe { device.bind_buffer_memory(buffer.raw, memory.handle(), 0) }
            .vk_context("vkBindBufferMemory")?;
        buffer.memory = Some(memory);
        Ok(buffer)
    }

    /// Creates the buffer without binding memory.
    pub fn unbound(device: &Arc<HarnessDevice>, info: &vk::BufferCreateInfo) -> Result<Self> {
        let raw = unsafe { device.create_buffer(info, None) }.vk_context("vkCreateBuffer")?;
        device.track(raw, "buffer");
        Ok(Self {
            device: Arc::clone(device),
            raw,
            size: info.size,
            usage: info.usage,
            memory: None,
        })
    }

    pub fn handle(&self) -> vk::Buffer {
        self.raw
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    /// Writes `data` through a mapping; the memory must be host visible.
    pub fn write(&self, offset: vk::DeviceSize, data: &[u8]) -> Result<()> {
        match &self.memory {
            Some(memory) => memory.write_bytes(offset, data),
            None => Err(crate::error::HarnessError::vulkan(
                "vkMapMemory",
                vk::Result::ERROR_MEMORY_MAP_FAILED,
            )),
        }
    }

    pub fn descriptor_info(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: self.raw,
            offset: 0,
            range: vk::WHOLE_SIZE,
        }
    }
}

impl DeviceObject for Buffer {
    type Handle = vk::Buffer;

    fn handle(&self) -> vk::Buffer {
        self.raw
    }

    fn device(&self) -> &Arc<HarnessDevice> {
        &self.device
    }
}

impl MemoryBacked for Buffer {
    fn memory(&self) -> vk::DeviceMemory {
        self.memory
            .as_ref()
            .map_or(vk::DeviceMemory::null(), DeviceMemory::handle)
    }

    fn memory_size(&self) -> vk::DeviceSize {
        self.memory.as_ref().map_or(0, DeviceMemory::size)
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use ash::vk::Handle;
        f.debug_struct("Buffer")
            .field("handle", &self.raw.as_raw())
            .field("size", &self.size)
            .field("usage", &self.usage)
            .finish()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe { self.device.destroy_buffer(self.raw, None) };
        self.device.untrack(self.raw);
    }
}

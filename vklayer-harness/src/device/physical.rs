use ash::vk;
use std::ffi::CStr;
use tracing::info;

use super::instance::HarnessInstance;
use crate::error::{HarnessError, Result, VkResultExt};

/// Everything the harness queries once about the selected physical device.
#[derive(Debug, Clone)]
pub struct PhysicalDeviceInfo {
    pub handle: vk::PhysicalDevice,
    pub name: String,
    pub properties: vk::PhysicalDeviceProperties,
    pub features: vk::PhysicalDeviceFeatures,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub queue_families: Vec<vk::QueueFamilyProperties>,
    pub extensions: Vec<String>,
}

impl PhysicalDeviceInfo {
    /// Picks the first physical device with a queue family supporting
    /// `queue_flags`, in enumeration order.
    pub fn select(instance: &HarnessInstance, queue_flags: vk::QueueFlags) -> Result<Self> {
        let raw = instance.raw();
        let devices = unsafe { raw.enumerate_physical_devices() }
            .vk_context("vkEnumeratePhysicalDevices")?;
        info!("Found {} physical devices.", devices.len());

        for handle in devices {
            let info = Self::query(instance, handle)?;
            if info.queue_family_with(queue_flags).is_some() {
                info!(
                    "Selected physical device: {} ({:?})",
                    info.name, info.properties.device_type
                );
                return Ok(info);
            }
            info!("Device {} has no queue family with {:?}", info.name, queue_flags);
        }
        Err(HarnessError::NoSuitableDevice(queue_flags))
    }

    fn query(instance: &HarnessInstance, handle: vk::PhysicalDevice) -> Result<Self> {
        let raw = instance.raw();
        let properties = unsafe { raw.get_physical_device_properties(handle) };
        let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();
        let extensions = unsafe { raw.enumerate_device_extension_properties(handle) }
            .vk_context("vkEnumerateDeviceExtensionProperties")?
            .iter()
            .map(|p| {
                unsafe { CStr::from_ptr(p.extension_name.as_ptr()) }
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        Ok(Self {
            handle,
            name,
            properties,
            features: unsafe { raw.get_physical_device_features(handle) },
            memory_properties: unsafe { raw.get_physical_device_memory_properties(handle) },
            queue_families: unsafe { raw.get_physical_device_queue_family_properties(handle) },
            extensions,
        })
    }

    pub fn queue_family_with(&self, flags: vk::QueueFlags) -> Option<u32> {
        self.queue_families
            .iter()
            .position(|family| family.queue_count > 0 && family.queue_flags.contains(flags))
            .map(|index| index as u32)
    }

    pub fn supports_extension(&self, name: &str) -> bool {
        self.extensions.iter().any(|e| e == name)
    }

    pub fn limits(&self) -> &vk::PhysicalDeviceLimits {
        &self.properties.limits
    }

    pub fn find_memory_type(
        &self,
        type_bits: u32,
        properties: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        find_memory_type_index(&self.memory_properties, type_bits, properties)
    }
}

/// Lowest memory type index allowed by `type_bits` that has `properties`.
pub fn find_memory_type_index(
    memory: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    properties: vk::MemoryPropertyFlags,
) -> Option<u32> {
    memory.memory_types[..memory.memory_type_count as usize]
        .iter()
        .enumerate()
        .find(|(index, memory_type)| {
            (type_bits & (1 << index)) != 0 && memory_type.property_flags.contains(properties)
        })
        .map(|(index, _)| index as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_with(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut memory = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (slot, flags) in memory.memory_types.iter_mut().zip(types) {
            slot.property_flags = *flags;
        }
        memory
    }

    #[test]
    fn memory_type_respects_type_bits_and_flags() {
        let memory = memory_with(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        ]);
        assert_eq!(
            find_memory_type_index(&memory, 0b111, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            Some(0)
        );
        assert_eq!(
            find_memory_type_index(&memory, 0b100, vk::MemoryPropertyFlags::HOST_VISIBLE),
            Some(2)
        );
        assert_eq!(
            find_memory_type_index(&memory, 0b001, vk::MemoryPropertyFlags::HOST_VISIBLE),
            None
        );
    }

    #[test]
    fn types_beyond_count_are_ignored() {
        let memory = memory_with(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        assert_eq!(
            find_memory_type_index(&memory, u32::MAX, vk::MemoryPropertyFlags::empty()),
            Some(0)
        );
        assert_eq!(
            find_memory_type_index(&memory, 0b10, vk::MemoryPropertyFlags::empty()),
            None
        );
    }
}

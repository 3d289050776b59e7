//! Owning wrappers for the Vulkan objects tests create.
//!
//! Each wrapper holds an `Arc<HarnessDevice>`, records its handle in the
//! device ledger on creation and destroys it on drop.

use ash::vk::Handle;
use std::sync::Arc;

use crate::device::HarnessDevice;

/// Capability shared by every harness-owned object.
pub trait DeviceObject {
    type Handle: Handle + Copy;

    fn handle(&self) -> Self::Handle;
    fn device(&self) -> &Arc<HarnessDevice>;

    fn initialized(&self) -> bool {
        self.handle().as_raw() != 0
    }
}

/// Objects with device memory bound to them.
pub trait MemoryBacked {
    fn memory(&self) -> ash::vk::DeviceMemory;
    fn memory_size(&self) -> ash::vk::DeviceSize;
}

/// Defines a wrapper for a handle whose only teardown is one `vkDestroy*`.
macro_rules! device_object {
    ($(#[$meta:meta])* $name:ident, $handle:ty, $destroy:ident, $label:literal) => {
        $(#[$meta])*
        pub struct $name {
            device: std::sync::Arc<$crate::device::HarnessDevice>,
            raw: $handle,
        }

        impl $name {
            /// Takes ownership of `raw`, which must have been created on `device`.
            pub fn from_raw(device: &std::sync::Arc<$crate::device::HarnessDevice>, raw: $handle) -> Self {
                device.track(raw, $label);
                Self {
                    device: std::sync::Arc::clone(device),
                    raw,
                }
            }

            pub fn handle(&self) -> $handle {
                self.raw
            }
        }

        impl $crate::objects::DeviceObject for $name {
            type Handle = $handle;

            fn handle(&self) -> $handle {
                self.raw
            }

            fn device(&self) -> &std::sync::Arc<$crate::device::HarnessDevice> {
                &self.device
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                use ash::vk::Handle as _;
                write!(f, concat!(stringify!($name), "(0x{:x})"), self.raw.as_raw())
            }
        }

        impl Drop for $name {
            fn drop(&mut self) {
                unsafe { self.device.$destroy(self.raw, None) };
                self.device.untrack(self.raw);
            }
        }
    };
}
pub(crate) use device_object;

pub mod buffer;
pub mod command;
pub mod descriptor;
pub mod image;
pub mod memory;
pub mod pipeline_layout;
pub mod render_pass;
pub mod sampler;
pub mod shader_module;
pub mod sync;

pub use buffer::Buffer;
pub use command::{CommandBuffer, CommandBufferState, CommandPool};
pub use descriptor::{DescriptorPool, DescriptorSetLayout, OneOffDescriptorSet};
pub use image::{safe_sane_image_view_info, Image, ImageSpec, ImageView};
pub use memory::DeviceMemory;
pub use pipeline_layout::PipelineLayout;
pub use render_pass::{Framebuffer, RenderPass};
pub use sampler::{safe_sane_sampler_info, Sampler};
pub use shader_module::ShaderModule;
pub use sync::{Event, Fence, Semaphore};

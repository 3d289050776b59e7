//! The per-test device baseline: logical device, queues, a default command
//! pool and buffer, and a small render target with a matching render pass.

use ash::vk::{self, Handle};
use std::any::Any;
use std::ffi::CString;
use std::os::raw::c_char;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::features::{enabled_feature_names, feature_flag};
use super::{FeatureRequest, HarnessDevice, HarnessInstance, LedgerEntry, LedgerViolation, PhysicalDeviceInfo};
use crate::config::ShaderToolConfig;
use crate::error::{HarnessError, Result, VkResultExt};
use crate::monitor::Monitor;
use crate::objects::{
    Buffer, CommandBuffer, CommandPool, DescriptorSetLayout, Event, Fence, Framebuffer, Image, ImageSpec,
    ImageView, PipelineLayout, RenderPass, Sampler, Semaphore, ShaderModule,
};
use crate::shader::{self, ShaderCompiler, ShaderSource};

/// Color formats tried for the default render target, in order.
pub const COLOR_FORMAT_CANDIDATES: [vk::Format; 2] = [vk::Format::B8G8R8A8_UNORM, vk::Format::R8G8B8A8_UNORM];

/// Depth/stencil formats tried by [`DeviceContext::init_render_target_with_depth`].
pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D16_UNORM_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
    vk::Format::D32_SFLOAT_S8_UINT,
];

/// How the logical device and its defaults are brought up.
#[derive(Debug, Clone)]
pub struct DeviceOptions {
    /// Enabled when the device supports them; the rest are skipped.
    pub device_extensions: Vec<String>,
    pub features: FeatureRequest,
    pub command_pool_flags: vk::CommandPoolCreateFlags,
    /// Capability the default queue family must have.
    pub queue_flags: vk::QueueFlags,
    pub render_target_extent: vk::Extent2D,
    /// Backend for GLSL and assembly shaders; the configured default if unset.
    pub compiler: Option<Arc<dyn ShaderCompiler>>,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            device_extensions: Vec::new(),
            features: FeatureRequest::default(),
            command_pool_flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            queue_flags: vk::QueueFlags::GRAPHICS,
            render_target_extent: vk::Extent2D {
                width: 32,
                height: 32,
            },
            compiler: None,
        }
    }
}

/// Layout of the render target built by [`DeviceContext::init_render_target`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderTargetSpec {
    pub attachment_count: u32,
    pub usage: vk::ImageUsageFlags,
    pub depth: bool,
}

impl RenderTargetSpec {
    /// A target needs at least one color attachment; tests that want no
    /// target at all ask for none.
    pub fn validate(&self) -> Result<()> {
        if self.attachment_count == 0 {
            return Err(HarnessError::InvalidRenderTarget(
                "at least one color attachment is required".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for RenderTargetSpec {
    fn default() -> Self {
        Self {
            attachment_count: 1,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC,
            depth: false,
        }
    }
}

/// A device queue. Cheap to clone.
#[derive(Clone)]
pub struct Queue {
    device: Arc<HarnessDevice>,
    raw: vk::Queue,
    family_index: u32,
}

impl Queue {
    pub fn handle(&self) -> vk::Queue {
        self.raw
    }

    pub fn family_index(&self) -> u32 {
        self.family_index
    }

    /// Calls `vkQueueSubmit` and returns the status untouched.
    ///
    /// Used by tests that submit buffers in states the harness would refuse.
    pub fn submit_raw(&self, command_buffers: &[vk::CommandBuffer], fence: vk::Fence) -> vk::Result {
        let submit = vk::SubmitInfo::builder().command_buffers(command_buffers).build();
        unsafe {
            (self.device.fp_v1_0().queue_submit)(self.raw, 1, &submit, fence)
        }
    }

    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.queue_wait_idle(self.raw) }.vk_context("vkQueueWaitIdle")
    }

    /// Submits one executable command buffer, then waits for the queue to
    /// drain.
    ///
    /// A submission skipped by the validation layer
    /// (`VK_ERROR_VALIDATION_FAILED_EXT`) is a diagnostic, not a driver error,
    /// and leaves the buffer's state untouched.
    pub fn submit_and_wait(&self, command_buffer: &mut CommandBuffer) -> Result<()> {
        self.submit_and_wait_with_fence(command_buffer, vk::Fence::null())
    }

    pub fn submit_and_wait_with_fence(&self, command_buffer: &mut CommandBuffer, fence: vk::Fence) -> Result<()> {
        let previous = command_buffer.state();
        command_buffer.mark_submitted()?;
        match self.submit_raw(&[command_buffer.handle()], fence) {
            vk::Result::SUCCESS => {}
            vk::Result::ERROR_VALIDATION_FAILED_EXT => {
                debug!("vkQueueSubmit skipped by the validation layer");
                command_buffer.restore_state(previous);
                return self.wait_idle();
            }
            result => return Err(HarnessError::vulkan("vkQueueSubmit", result)),
        }
        let waited = self.wait_idle();
        command_buffer.mark_completed();
        waited
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("handle", &self.raw.as_raw())
            .field("family_index", &self.family_index)
            .finish()
    }
}

/// What was still alive when a context was torn down.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub outstanding: Vec<LedgerEntry>,
    pub violations: Vec<LedgerViolation>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.outstanding.is_empty() && self.violations.is_empty()
    }
}

struct RenderTarget {
    // Declared before the image so the view is destroyed first.
    view: ImageView,
    image: Image,
}

/// Owns the device and every default object a test starts with.
///
/// Fields drop in declaration order, which destroys children before the
/// objects they were created from.
pub struct DeviceContext {
    roster: Vec<Box<dyn Any>>,
    framebuffer: Option<Framebuffer>,
    render_targets: Vec<RenderTarget>,
    depth_target: Option<RenderTarget>,
    render_pass: RenderPass,
    command_buffer: CommandBuffer,
    command_pool: Arc<CommandPool>,
    queues: Vec<Queue>,
    graphics_queue: Queue,
    compiler: Arc<dyn ShaderCompiler>,
    color_format: vk::Format,
    depth_format: Option<vk::Format>,
    extent: vk::Extent2D,
    viewports: Vec<vk::Viewport>,
    scissors: Vec<vk::Rect2D>,
    clear_values: Vec<vk::ClearValue>,
    device: Arc<HarnessDevice>,
}

impl DeviceContext {
    /// Creates the logical device on `physical` and the default objects.
    ///
    /// Requested extensions the device lacks are skipped with a log line;
    /// named features it lacks are a [`HarnessError::MissingPrerequisite`].
    /// Device creation failure is [`HarnessError::Fatal`].
    pub fn new(instance: Arc<HarnessInstance>, physical: PhysicalDeviceInfo, options: &DeviceOptions) -> Result<Self> {
        let graphics_family = physical
            .queue_family_with(options.queue_flags)
            .ok_or(HarnessError::NoSuitableDevice(options.queue_flags))?;

        let features = options
            .features
            .resolve(&physical.features)
            .map_err(|missing| HarnessError::MissingPrerequisite(format!("device feature(s) {}", missing.join(", "))))?;

        let mut extensions = Vec::new();
        for name in &options.device_extensions {
            if physical.supports_extension(name) {
                extensions.push(name.clone());
            } else {
                info!("Device extension {} not supported, skipping it", name);
            }
        }

        let device = Self::create_device(instance, physical, features, extensions)?;
        let queues = Self::collect_queues(&device);
        let graphics_queue = queues
            .iter()
            .find(|q| q.family_index == graphics_family)
            .cloned()
            .ok_or(HarnessError::NoSuitableDevice(options.queue_flags))?;

        let color_format = Self::pick_format(
            &device,
            &COLOR_FORMAT_CANDIDATES,
            vk::FormatFeatureFlags::COLOR_ATTACHMENT,
        )
        .ok_or_else(|| HarnessError::MissingPrerequisite("no color attachment format".to_string()))?;

        let command_pool = CommandPool::new(&device, graphics_family, options.command_pool_flags)?;
        let command_buffer = command_pool.allocate_primary()?;
        let render_pass = RenderPass::single_subpass(&device, color_format, None)?;
        debug!(
            "Default objects created: pool family {}, color format {:?}",
            graphics_family, color_format
        );

        let compiler = match &options.compiler {
            Some(compiler) => Arc::clone(compiler),
            None => shader::default_compiler(&ShaderToolConfig::default()),
        };

        Ok(Self {
            roster: Vec::new(),
            framebuffer: None,
            render_targets: Vec::new(),
            depth_target: None,
            render_pass,
            command_buffer,
            command_pool,
            queues,
            graphics_queue,
            compiler,
            color_format,
            depth_format: None,
            extent: options.render_target_extent,
            viewports: Vec::new(),
            scissors: Vec::new(),
            clear_values: Vec::new(),
            device,
        })
    }

    fn create_device(
        instance: Arc<HarnessInstance>,
        physical: PhysicalDeviceInfo,
        features: vk::PhysicalDeviceFeatures,
        extensions: Vec<String>,
    ) -> Result<Arc<HarnessDevice>> {
        let priorities = [1.0f32];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = physical
            .queue_families
            .iter()
            .enumerate()
            .filter(|(_, family)| family.queue_count > 0)
            .map(|(index, _)| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(index as u32)
                    .queue_priorities(&priorities)
                    .build()
            })
            .collect();

        let extension_names = extensions
            .iter()
            .map(|e| CString::new(e.as_str()))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let extension_ptrs: Vec<*const c_char> = extension_names.iter().map(|e| e.as_ptr()).collect();

        let info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_features(&features)
            .enabled_extension_names(&extension_ptrs);

        let raw = unsafe { instance.raw().create_device(physical.handle, &info, None) }
            .map_err(|e| HarnessError::Fatal(format!("vkCreateDevice returned {e:?}")))?;
        info!(
            "Logical device created on {} with {} feature(s) and extensions {:?}",
            physical.name,
            enabled_feature_names(&features).len(),
            extensions
        );
        Ok(Arc::new(HarnessDevice::new(raw, instance, physical, features, extensions)))
    }

    fn collect_queues(device: &Arc<HarnessDevice>) -> Vec<Queue> {
        device
            .physical()
            .queue_families
            .iter()
            .enumerate()
            .filter(|(_, family)| family.queue_count > 0)
            .map(|(index, _)| Queue {
                device: Arc::clone(device),
                raw: unsafe { device.get_device_queue(index as u32, 0) },
                family_index: index as u32,
            })
            .collect()
    }

    fn pick_format(
        device: &HarnessDevice,
        candidates: &[vk::Format],
        required: vk::FormatFeatureFlags,
    ) -> Option<vk::Format> {
        candidates.iter().copied().find(|&format| {
            let properties = unsafe {
                device
                    .instance()
                    .raw()
                    .get_physical_device_format_properties(device.physical().handle, format)
            };
            properties.optimal_tiling_features.contains(required)
        })
    }

    /// Allocates color (and optionally depth) attachments, rebuilds the
    /// render pass to match, and creates the framebuffer, viewport and
    /// scissor.
    pub fn init_render_target(&mut self, spec: RenderTargetSpec) -> Result<()> {
        spec.validate()?;
        self.framebuffer = None;
        self.render_targets.clear();
        self.depth_target = None;

        self.depth_format = if spec.depth {
            let format = Self::pick_format(
                &self.device,
                &DEPTH_FORMAT_CANDIDATES,
                vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
            )
            .ok_or_else(|| HarnessError::MissingPrerequisite("no depth/stencil attachment format".to_string()))?;
            Some(format)
        } else {
            None
        };

        for _ in 0..spec.attachment_count {
            let image = Image::new(
                &self.device,
                ImageSpec::new(self.extent, self.color_format, spec.usage),
            )?;
            let view = image.create_view()?;
            self.render_targets.push(RenderTarget { view, image });
        }
        if let Some(format) = self.depth_format {
            let image = Image::new(
                &self.device,
                ImageSpec::new(self.extent, format, vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT),
            )?;
            let view = image.create_view()?;
            self.depth_target = Some(RenderTarget { view, image });
        }

        // Always matches the framebuffer views below.
        self.render_pass =
            RenderPass::color_targets(&self.device, self.color_format, spec.attachment_count, self.depth_format)?;

        let views: Vec<vk::ImageView> = self
            .render_targets
            .iter()
            .chain(self.depth_target.iter())
            .map(|target| target.view.handle())
            .collect();
        self.framebuffer = Some(Framebuffer::new(
            &self.device,
            self.render_pass.handle(),
            &views,
            self.extent,
        )?);

        self.clear_values = vec![
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: [0.0, 0.0, 0.0, 1.0],
                },
            };
            spec.attachment_count as usize
        ];
        if self.depth_format.is_some() {
            self.clear_values.push(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 },
            });
        }
        self.init_viewport();
        debug!(
            "Render target ready: {} color attachment(s), depth {:?}",
            spec.attachment_count, self.depth_format
        );
        Ok(())
    }

    /// Single color attachment with a depth/stencil attachment.
    pub fn init_render_target_with_depth(&mut self) -> Result<()> {
        self.init_render_target(RenderTargetSpec {
            depth: true,
            ..RenderTargetSpec::default()
        })
    }

    /// Sets the default viewport `{0, 0, w, h, 0, 1}` and matching scissor.
    pub fn init_viewport(&mut self) {
        self.viewports = vec![vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: self.extent.width as f32,
            height: self.extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }];
        self.scissors = vec![vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: self.extent,
        }];
    }

    /// Begin info for the default render pass over the whole framebuffer.
    ///
    /// Points into the context's clear values, so it is valid while `self`
    /// is. Returns `None` before [`DeviceContext::init_render_target`].
    pub fn render_pass_begin(&self) -> Option<vk::RenderPassBeginInfo> {
        let framebuffer = self.framebuffer.as_ref()?;
        Some(
            vk::RenderPassBeginInfo::builder()
                .render_pass(self.render_pass.handle())
                .framebuffer(framebuffer.handle())
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent: self.extent,
                })
                .clear_values(&self.clear_values)
                .build(),
        )
    }

    /// Begins the default render pass on the default command buffer.
    pub fn begin_default_render_pass(&mut self) -> Result<()> {
        let info = self
            .render_pass_begin()
            .ok_or_else(|| HarnessError::MissingPrerequisite("render target not initialized".to_string()))?;
        self.command_buffer
            .begin_render_pass(&info, vk::SubpassContents::INLINE)
    }

    /// Submits the default command buffer and waits for the queue.
    pub fn submit_default_and_wait(&mut self) -> Result<()> {
        self.graphics_queue.submit_and_wait(&mut self.command_buffer)
    }

    pub fn device(&self) -> &Arc<HarnessDevice> {
        &self.device
    }

    pub fn instance(&self) -> &Arc<HarnessInstance> {
        self.device.instance()
    }

    pub fn physical(&self) -> &PhysicalDeviceInfo {
        self.device.physical()
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        self.device.instance().monitor()
    }

    pub fn compiler(&self) -> &Arc<dyn ShaderCompiler> {
        &self.compiler
    }

    pub fn graphics_queue(&self) -> &Queue {
        &self.graphics_queue
    }

    pub fn queues(&self) -> &[Queue] {
        &self.queues
    }

    pub fn command_pool(&self) -> &Arc<CommandPool> {
        &self.command_pool
    }

    pub fn command_buffer(&self) -> &CommandBuffer {
        &self.command_buffer
    }

    pub fn command_buffer_mut(&mut self) -> &mut CommandBuffer {
        &mut self.command_buffer
    }

    pub fn render_pass(&self) -> &RenderPass {
        &self.render_pass
    }

    pub fn framebuffer(&self) -> Option<&Framebuffer> {
        self.framebuffer.as_ref()
    }

    pub fn render_target_views(&self) -> Vec<vk::ImageView> {
        self.render_targets.iter().map(|t| t.view.handle()).collect()
    }

    pub fn render_target_images(&self) -> Vec<vk::Image> {
        self.render_targets.iter().map(|t| t.image.handle()).collect()
    }

    pub fn color_format(&self) -> vk::Format {
        self.color_format
    }

    pub fn depth_format(&self) -> Option<vk::Format> {
        self.depth_format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn viewports(&self) -> &[vk::Viewport] {
        &self.viewports
    }

    pub fn scissors(&self) -> &[vk::Rect2D] {
        &self.scissors
    }

    pub fn feature_supported(&self, name: &str) -> bool {
        feature_flag(&self.physical().features, name).unwrap_or(false)
    }

    pub fn feature_enabled(&self, name: &str) -> bool {
        feature_flag(self.device.enabled_features(), name).unwrap_or(false)
    }

    pub fn extension_supported(&self, name: &str) -> bool {
        self.physical().supports_extension(name)
    }

    pub fn extension_enabled(&self, name: &str) -> bool {
        self.device.extension_enabled(name) || self.instance().extension_enabled(name)
    }

    pub fn make_image(&self, spec: ImageSpec) -> Result<Image> {
        Image::new(&self.device, spec)
    }

    pub fn make_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<Buffer> {
        Buffer::new(&self.device, size, usage, properties)
    }

    pub fn make_sampler(&self, info: &vk::SamplerCreateInfo) -> Result<Sampler> {
        Sampler::new(&self.device, info)
    }

    pub fn make_shader(&self, stage: vk::ShaderStageFlags, source: &ShaderSource<'_>) -> Result<ShaderModule> {
        ShaderModule::from_source(&self.device, self.compiler.as_ref(), stage, source)
    }

    pub fn make_descriptor_set_layout(&self, bindings: &[vk::DescriptorSetLayoutBinding]) -> Result<DescriptorSetLayout> {
        DescriptorSetLayout::new(&self.device, bindings, vk::DescriptorSetLayoutCreateFlags::empty())
    }

    pub fn make_pipeline_layout(
        &self,
        set_layouts: &[&DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<PipelineLayout> {
        PipelineLayout::new(&self.device, set_layouts, push_constant_ranges)
    }

    pub fn make_render_pass(
        &self,
        attachments: &[vk::AttachmentDescription],
        subpasses: &[vk::SubpassDescription],
        dependencies: &[vk::SubpassDependency],
    ) -> Result<RenderPass> {
        RenderPass::new(&self.device, attachments, subpasses, dependencies)
    }

    pub fn make_event(&self) -> Result<Event> {
        Event::new(&self.device)
    }

    pub fn make_semaphore(&self) -> Result<Semaphore> {
        Semaphore::new(&self.device)
    }

    pub fn make_fence(&self, signaled: bool) -> Result<Fence> {
        Fence::new(&self.device, signaled)
    }

    pub fn make_command_pool(&self, queue_family_index: u32, flags: vk::CommandPoolCreateFlags) -> Result<Arc<CommandPool>> {
        CommandPool::new(&self.device, queue_family_index, flags)
    }

    /// Hands an object to the context; it is destroyed at teardown, before
    /// the default objects.
    pub fn adopt<T: Any>(&mut self, object: T) {
        self.roster.push(Box::new(object));
    }

    /// Destroys everything the context owns and reports the handles that are
    /// still alive on the device.
    pub fn teardown(mut self) -> TeardownReport {
        if let Err(e) = self.device.wait_idle() {
            warn!("vkDeviceWaitIdle failed during teardown: {}", e);
        }
        self.roster.clear();
        self.framebuffer = None;
        self.render_targets.clear();
        self.depth_target = None;

        // The render pass, command buffer and pool are released by dropping
        // `self`; the device outlives them through `device`.
        let device = Arc::clone(&self.device);
        drop(self);

        let report = TeardownReport {
            outstanding: device.outstanding_handles(),
            violations: device.ledger_violations(),
        };
        if !report.is_clean() {
            warn!(
                "Teardown found {} live handle(s) and {} ledger violation(s)",
                report.outstanding.len(),
                report.violations.len()
            );
        }
        report
    }
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("device", &self.device)
            .field("graphics_queue", &self.graphics_queue)
            .field("color_format", &self.color_format)
            .field("depth_format", &self.depth_format)
            .field("extent", &self.extent)
            .field("render_targets", &self.render_targets.len())
            .field("adopted", &self.roster.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_options_target_a_small_graphics_device() {
        let options = DeviceOptions::default();
        assert_eq!(options.queue_flags, vk::QueueFlags::GRAPHICS);
        assert_eq!(
            options.render_target_extent,
            vk::Extent2D {
                width: 32,
                height: 32
            }
        );
        assert!(options
            .command_pool_flags
            .contains(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER));
        assert_eq!(options.features, FeatureRequest::AllSupported);
        assert!(options.compiler.is_none());
    }

    #[test]
    fn default_render_target_is_one_color_attachment() {
        let spec = RenderTargetSpec::default();
        assert_eq!(spec.attachment_count, 1);
        assert!(!spec.depth);
        assert!(spec.usage.contains(vk::ImageUsageFlags::COLOR_ATTACHMENT));
    }

    #[test]
    fn render_target_without_attachments_is_rejected() {
        let empty = RenderTargetSpec {
            attachment_count: 0,
            ..RenderTargetSpec::default()
        };
        assert!(matches!(empty.validate(), Err(HarnessError::InvalidRenderTarget(_))));
        let with_depth = RenderTargetSpec {
            attachment_count: 2,
            depth: true,
            ..RenderTargetSpec::default()
        };
        assert!(with_depth.validate().is_ok());
    }

    #[test]
    fn format_candidates_prefer_bgra_and_d16s8() {
        assert_eq!(COLOR_FORMAT_CANDIDATES[0], vk::Format::B8G8R8A8_UNORM);
        assert_eq!(DEPTH_FORMAT_CANDIDATES[0], vk::Format::D16_UNORM_S8_UINT);
    }

    #[test]
    fn clean_report_has_no_entries() {
        assert!(TeardownReport::default().is_clean());
        let report = TeardownReport {
            outstanding: vec![LedgerEntry {
                object_type: vk::ObjectType::FENCE,
                raw: 7,
                label: "fence",
            }],
            violations: Vec::new(),
        };
        assert!(!report.is_clean());
    }
}

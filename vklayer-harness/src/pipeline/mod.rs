//! Pipeline builders.
//!
//! Each builder keeps a fully populated create-info graph with working
//! defaults. A test mutates whatever sub-state it is probing, then calls
//! `create`, which returns the driver status as is. Builders own every object
//! they create (shaders, descriptor set, layout, cache, pipelines).

pub mod compute;
pub mod graphics;
pub mod ray_tracing;

use ash::vk;
use std::sync::Arc;
use tracing::debug;

use crate::device::HarnessDevice;
use crate::error::{Result, VkResultExt};
use crate::monitor::{Monitor, Needles};
use crate::objects::{OneOffDescriptorSet, PipelineLayout};

pub use compute::ComputePipelineBuilder;
pub use graphics::{GraphicsPipelineBuilder, GraphicsPipelineState};
pub use ray_tracing::RayTracingPipelineBuilder;

crate::objects::device_object!(
    /// A pipeline of any kind.
    Pipeline,
    vk::Pipeline,
    destroy_pipeline,
    "pipeline"
);

crate::objects::device_object!(PipelineCache, vk::PipelineCache, destroy_pipeline_cache, "pipeline cache");

impl PipelineCache {
    /// An empty cache.
    pub fn new(device: &Arc<HarnessDevice>) -> Result<Self> {
        let info = vk::PipelineCacheCreateInfo::default();
        let raw = unsafe { device.create_pipeline_cache(&info, None) }.vk_context("vkCreatePipelineCache")?;
        Ok(Self::from_raw(device, raw))
    }
}

fn null_or<T>(items: &[T]) -> *const T {
    if items.is_empty() {
        std::ptr::null()
    } else {
        items.as_ptr()
    }
}

/// The handle a create call wrote back, if any.
fn written_handle(raw: vk::Pipeline) -> Option<vk::Pipeline> {
    (raw != vk::Pipeline::null()).then_some(raw)
}

/// Descriptor set, layout, cache and created pipelines shared by every
/// builder kind.
#[derive(Debug)]
pub struct PipelineResources {
    device: Arc<HarnessDevice>,
    /// Bindings of the single descriptor set layout; none by default.
    pub dsl_bindings: Vec<vk::DescriptorSetLayoutBinding>,
    pub push_constant_ranges: Vec<vk::PushConstantRange>,
    pipeline: Option<Pipeline>,
    // Pipelines replaced without implicit destroy; destroyed with the builder.
    retired: Vec<Pipeline>,
    cache: Option<PipelineCache>,
    layout: Option<PipelineLayout>,
    descriptor_set: Option<OneOffDescriptorSet>,
}

impl PipelineResources {
    fn new(device: &Arc<HarnessDevice>) -> Self {
        Self {
            device: Arc::clone(device),
            dsl_bindings: Vec::new(),
            push_constant_ranges: Vec::new(),
            pipeline: None,
            retired: Vec::new(),
            cache: None,
            layout: None,
            descriptor_set: None,
        }
    }

    /// Creates the descriptor set (when bindings are given), the pipeline
    /// layout and the cache from the current settings.
    fn init_state(&mut self) -> Result<()> {
        self.layout = None;
        self.descriptor_set = if self.dsl_bindings.is_empty() {
            None
        } else {
            Some(OneOffDescriptorSet::new(&self.device, &self.dsl_bindings)?)
        };
        let set_layouts: Vec<_> = self.descriptor_set.iter().map(|set| set.layout()).collect();
        self.layout = Some(PipelineLayout::new(
            &self.device,
            &set_layouts,
            &self.push_constant_ranges,
        )?);
        if self.cache.is_none() {
            self.cache = Some(PipelineCache::new(&self.device)?);
        }
        Ok(())
    }

    fn layout_handle(&self) -> vk::PipelineLayout {
        self.layout.as_ref().map_or(vk::PipelineLayout::null(), PipelineLayout::handle)
    }

    fn cache_handle(&self) -> vk::PipelineCache {
        self.cache.as_ref().map_or(vk::PipelineCache::null(), PipelineCache::handle)
    }

    fn release_previous(&mut self, implicit_destroy: bool) {
        if let Some(previous) = self.pipeline.take() {
            if implicit_destroy {
                drop(previous);
            } else {
                self.retired.push(previous);
            }
        }
    }

    /// Takes ownership of whatever the driver wrote back.
    fn adopt(&mut self, raw: vk::Pipeline, result: vk::Result) -> vk::Result {
        match written_handle(raw) {
            Some(raw) => self.pipeline = Some(Pipeline::from_raw(&self.device, raw)),
            None => debug!("Pipeline creation returned {:?} without a handle", result),
        }
        result
    }

    pub fn device(&self) -> &Arc<HarnessDevice> {
        &self.device
    }

    pub fn pipeline(&self) -> vk::Pipeline {
        self.pipeline.as_ref().map_or(vk::Pipeline::null(), Pipeline::handle)
    }

    /// Pipelines kept alive by non-destroying recreation.
    pub fn retired(&self) -> &[Pipeline] {
        &self.retired
    }

    pub fn layout(&self) -> Option<&PipelineLayout> {
        self.layout.as_ref()
    }

    pub fn descriptor_set(&self) -> Option<&OneOffDescriptorSet> {
        self.descriptor_set.as_ref()
    }

    pub fn descriptor_set_mut(&mut self) -> Option<&mut OneOffDescriptorSet> {
        self.descriptor_set.as_mut()
    }
}

/// Arms `needles` (or `expect_success` for a positive test), runs `create`
/// and verifies.
#[track_caller]
fn run_oneshot<N: Needles>(
    monitor: &Monitor,
    mask: vk::DebugReportFlagsEXT,
    needles: N,
    positive: bool,
    create: impl FnOnce() -> vk::Result,
) -> bool {
    if positive {
        monitor.expect_success();
    } else {
        monitor.set_desired_failures(mask, needles);
    }
    let result = create();
    debug!("Oneshot pipeline creation returned {:?}", result);
    if positive {
        monitor.verify_not_found()
    } else {
        monitor.verify_found()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_slices_become_null() {
        let empty: [u32; 0] = [];
        assert!(null_or(&empty).is_null());
        let one = [7u32];
        assert_eq!(null_or(&one), one.as_ptr());
    }

    #[test]
    fn only_written_handles_are_adopted() {
        use ash::vk::Handle;
        assert_eq!(written_handle(vk::Pipeline::null()), None);
        let raw = vk::Pipeline::from_raw(0x1234);
        assert_eq!(written_handle(raw), Some(raw));
    }

    #[test]
    fn oneshot_arms_needles_for_negative_runs() {
        let monitor = Monitor::default();
        let passed = run_oneshot(&monitor, vk::DebugReportFlagsEXT::ERROR, ["VUID-x"], false, || {
            vk::Result::SUCCESS
        });
        assert!(!passed);
        assert!(monitor.has_failures());
    }

    #[test]
    fn oneshot_positive_run_verifies_silence() {
        let monitor = Monitor::default();
        let passed = run_oneshot(&monitor, vk::DebugReportFlagsEXT::ERROR, [""; 0], true, || {
            vk::Result::SUCCESS
        });
        assert!(passed);
        assert!(!monitor.has_failures());
    }
}

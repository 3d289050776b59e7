//! Command pools and command buffers with a tracked lifecycle.
//!
//! The harness refuses lifecycle calls that are illegal in the tracked state
//! with [`HarnessError::IllegalCommandBufferState`]. Tests that probe those
//! transitions on purpose issue the raw `ash::Device` call on
//! [`CommandBuffer::handle`] instead.

use ash::vk;
use std::sync::Arc;
use tracing::debug;

use crate::device::HarnessDevice;
use crate::error::{HarnessError, Result, VkResultExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandBufferState {
    Initial,
    Recording,
    RecordingInRenderPass,
    Executable,
    Pending,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferEvent {
    Begin,
    BeginRenderPass,
    EndRenderPass,
    End,
    Submit,
    /// The submission finished executing.
    Complete,
    Reset,
    /// A resource referenced by the recording was destroyed or changed.
    Invalidate,
}

impl CommandBufferState {
    /// Next state after `event`, or `None` when the event is illegal.
    ///
    /// `one_time_submit` is the usage the buffer was begun with; `resettable`
    /// is whether its pool has `RESET_COMMAND_BUFFER`.
    pub fn transition(
        self,
        event: CommandBufferEvent,
        one_time_submit: bool,
        resettable: bool,
    ) -> Option<Self> {
        use CommandBufferEvent as E;
        use CommandBufferState as S;
        match (self, event) {
            (S::Initial, E::Begin) => Some(S::Recording),
            (S::Executable | S::Invalid, E::Begin) if resettable => Some(S::Recording),
            (S::Recording, E::BeginRenderPass) => Some(S::RecordingInRenderPass),
            (S::RecordingInRenderPass, E::EndRenderPass) => Some(S::Recording),
            (S::Recording, E::End) => Some(S::Executable),
            (S::Executable, E::Submit) => Some(S::Pending),
            (S::Pending, E::Complete) if one_time_submit => Some(S::Invalid),
            (S::Pending, E::Complete) => Some(S::Executable),
            (S::Pending, E::Reset) => None,
            (_, E::Reset) if resettable => Some(S::Initial),
            (S::Recording | S::RecordingInRenderPass | S::Executable, E::Invalidate) => Some(S::Invalid),
            (S::Invalid, E::Invalidate) => Some(S::Invalid),
            _ => None,
        }
    }

    pub fn is_recording(self) -> bool {
        matches!(self, Self::Recording | Self::RecordingInRenderPass)
    }
}

/// A command pool. Shared by the buffers allocated from it, so it outlives
/// all of them.
pub struct CommandPool {
    device: Arc<HarnessDevice>,
    raw: vk::CommandPool,
    flags: vk::CommandPoolCreateFlags,
    queue_family_index: u32,
}

impl CommandPool {
    pub fn new(
        device: &Arc<HarnessDevice>,
        queue_family_index: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Arc<Self>> {
        let info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(queue_family_index)
            .flags(flags);
        let raw = unsafe { device.create_command_pool(&info, None) }
            .vk_context("vkCreateCommandPool")?;
        device.track(raw, "command pool");
        Ok(Arc::new(Self {
            device: Arc::clone(device),
            raw,
            flags,
            queue_family_index,
        }))
    }

    pub fn handle(&self) -> vk::CommandPool {
        self.raw
    }

    pub fn device(&self) -> &Arc<HarnessDevice> {
        &self.device
    }

    pub fn flags(&self) -> vk::CommandPoolCreateFlags {
        self.flags
    }

    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    pub fn resettable(&self) -> bool {
        self.flags
            .contains(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
    }

    pub fn allocate(self: &Arc<Self>, level: vk::CommandBufferLevel) -> Result<CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.raw)
            .level(level)
            .command_buffer_count(1);
        let raw = unsafe { self.device.allocate_command_buffers(&info) }
            .vk_context("vkAllocateCommandBuffers")?
            .into_iter()
            .next()
            .ok_or_else(|| HarnessError::vulkan("vkAllocateCommandBuffers", vk::Result::INCOMPLETE))?;
        self.device.track(raw, "command buffer");
        Ok(CommandBuffer {
            pool: Arc::clone(self),
            raw,
            level,
            state: CommandBufferState::Initial,
            one_time_submit: false,
        })
    }

    pub fn allocate_primary(self: &Arc<Self>) -> Result<CommandBuffer> {
        self.allocate(vk::CommandBufferLevel::PRIMARY)
    }

    pub fn allocate_secondary(self: &Arc<Self>) -> Result<CommandBuffer> {
        self.allocate(vk::CommandBufferLevel::SECONDARY)
    }
}

impl std::fmt::Debug for CommandPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use ash::vk::Handle;
        f.debug_struct("CommandPool")
            .field("handle", &self.raw.as_raw())
            .field("flags", &self.flags)
            .field("queue_family_index", &self.queue_family_index)
            .finish()
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe { self.device.destroy_command_pool(self.raw, None) };
        self.device.untrack(self.raw);
    }
}

pub struct CommandBuffer {
    pool: Arc<CommandPool>,
    raw: vk::CommandBuffer,
    level: vk::CommandBufferLevel,
    state: CommandBufferState,
    one_time_submit: bool,
}

impl CommandBuffer {
    pub fn handle(&self) -> vk::CommandBuffer {
        self.raw
    }

    pub fn level(&self) -> vk::CommandBufferLevel {
        self.level
    }

    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    pub fn pool(&self) -> &Arc<CommandPool> {
        &self.pool
    }

    pub fn device(&self) -> &Arc<HarnessDevice> {
        &self.pool.device
    }

    fn advance(&mut self, event: CommandBufferEvent, operation: &'static str) -> Result<()> {
        match self
            .state
            .transition(event, self.one_time_submit, self.pool.resettable())
        {
            Some(next) => {
                self.state = next;
                Ok(())
            }
            None => Err(HarnessError::IllegalCommandBufferState {
                state: self.state,
                operation,
            }),
        }
    }

    /// Begins recording with `ONE_TIME_SUBMIT`.
    pub fn begin(&mut self) -> Result<()> {
        self.begin_with(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT, None)
    }

    pub fn begin_with(
        &mut self,
        flags: vk::CommandBufferUsageFlags,
        inheritance: Option<&vk::CommandBufferInheritanceInfo>,
    ) -> Result<()> {
        let one_time = flags.contains(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        let previous = self.one_time_submit;
        self.one_time_submit = one_time;
        if let Err(e) = self.advance(CommandBufferEvent::Begin, "begin") {
            self.one_time_submit = previous;
            return Err(e);
        }
        let mut info = vk::CommandBufferBeginInfo::builder().flags(flags);
        if let Some(inheritance) = inheritance {
            info = info.inheritance_info(inheritance);
        }
        unsafe { self.device().begin_command_buffer(self.raw, &info) }
            .vk_context("vkBeginCommandBuffer")
    }

    pub fn end(&mut self) -> Result<()> {
        self.advance(CommandBufferEvent::End, "end")?;
        unsafe { self.device().end_command_buffer(self.raw) }.vk_context("vkEndCommandBuffer")
    }

    pub fn reset(&mut self, flags: vk::CommandBufferResetFlags) -> Result<()> {
        self.advance(CommandBufferEvent::Reset, "reset")?;
        unsafe { self.device().reset_command_buffer(self.raw, flags) }
            .vk_context("vkResetCommandBuffer")
    }

    pub fn begin_render_pass(
        &mut self,
        info: &vk::RenderPassBeginInfo,
        contents: vk::SubpassContents,
    ) -> Result<()> {
        self.advance(CommandBufferEvent::BeginRenderPass, "begin a render pass in")?;
        unsafe { self.device().cmd_begin_render_pass(self.raw, info, contents) };
        Ok(())
    }

    pub fn end_render_pass(&mut self) -> Result<()> {
        self.advance(CommandBufferEvent::EndRenderPass, "end a render pass in")?;
        unsafe { self.device().cmd_end_render_pass(self.raw) };
        Ok(())
    }

    pub(crate) fn mark_submitted(&mut self) -> Result<()> {
        self.advance(CommandBufferEvent::Submit, "submit")
    }

    /// Puts back the state recorded before a submission the layer skipped.
    pub(crate) fn restore_state(&mut self, state: CommandBufferState) {
        self.state = state;
    }

    pub(crate) fn mark_completed(&mut self) {
        if let Some(next) = self
            .state
            .transition(CommandBufferEvent::Complete, self.one_time_submit, false)
        {
            self.state = next;
        }
    }

    /// Notes that a resource used by the recording was destroyed.
    pub fn invalidate(&mut self) {
        if let Some(next) = self.state.transition(CommandBufferEvent::Invalidate, false, false) {
            debug!("Command buffer {:?} invalidated", self.raw);
            self.state = next;
        }
    }

    pub fn bind_pipeline(&self, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        unsafe { self.device().cmd_bind_pipeline(self.raw, bind_point, pipeline) };
    }

    pub fn set_viewport(&self, viewports: &[vk::Viewport]) {
        unsafe { self.device().cmd_set_viewport(self.raw, 0, viewports) };
    }

    pub fn set_scissor(&self, scissors: &[vk::Rect2D]) {
        unsafe { self.device().cmd_set_scissor(self.raw, 0, scissors) };
    }

    pub fn set_line_width(&self, width: f32) {
        unsafe { self.device().cmd_set_line_width(self.raw, width) };
    }

    pub fn bind_index_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, index_type: vk::IndexType) {
        unsafe { self.device().cmd_bind_index_buffer(self.raw, buffer, offset, index_type) };
    }

    pub fn draw(&self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        unsafe {
            self.device()
                .cmd_draw(self.raw, vertex_count, instance_count, first_vertex, first_instance)
        };
    }

    pub fn draw_indexed(
        &self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        unsafe {
            self.device().cmd_draw_indexed(
                self.raw,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        };
    }

    pub fn clear_attachments(&self, attachments: &[vk::ClearAttachment], rects: &[vk::ClearRect]) {
        unsafe { self.device().cmd_clear_attachments(self.raw, attachments, rects) };
    }

    pub fn execute_commands(&self, secondaries: &[vk::CommandBuffer]) {
        unsafe { self.device().cmd_execute_commands(self.raw, secondaries) };
    }

    pub fn set_event(&self, event: vk::Event, stage: vk::PipelineStageFlags) {
        unsafe { self.device().cmd_set_event(self.raw, event, stage) };
    }

    pub fn reset_event(&self, event: vk::Event, stage: vk::PipelineStageFlags) {
        unsafe { self.device().cmd_reset_event(self.raw, event, stage) };
    }

    pub fn push_constants(
        &self,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        unsafe { self.device().cmd_push_constants(self.raw, layout, stages, offset, data) };
    }
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("handle", &self.raw)
            .field("level", &self.level)
            .field("state", &self.state)
            .finish()
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        let device = Arc::clone(&self.pool.device);
        unsafe { device.free_command_buffers(self.pool.raw, &[self.raw]) };
        device.untrack(self.raw);
    }
}

#[cfg(test)]
mod tests {
    use super::CommandBufferEvent as E;
    use super::CommandBufferState as S;
    use super::*;
    use rstest::rstest;

    fn run(events: &[E], one_time: bool, resettable: bool) -> Option<S> {
        events
            .iter()
            .try_fold(S::Initial, |state, event| state.transition(*event, one_time, resettable))
    }

    #[test]
    fn full_lifecycle_returns_to_initial() {
        let events = [
            E::Begin,
            E::BeginRenderPass,
            E::EndRenderPass,
            E::End,
            E::Submit,
            E::Complete,
            E::Reset,
        ];
        assert_eq!(run(&events, false, true), Some(S::Initial));
    }

    #[test]
    fn one_time_submit_becomes_invalid_after_completion() {
        let events = [E::Begin, E::End, E::Submit, E::Complete];
        assert_eq!(run(&events, true, false), Some(S::Invalid));
        assert_eq!(run(&[E::Begin, E::End, E::Submit, E::Complete, E::Submit], true, false), None);
    }

    #[rstest]
    #[case(S::Initial, E::End)]
    #[case(S::Initial, E::Submit)]
    #[case(S::Recording, E::Submit)]
    #[case(S::RecordingInRenderPass, E::End)]
    #[case(S::Pending, E::Begin)]
    #[case(S::Pending, E::Reset)]
    #[case(S::Executable, E::BeginRenderPass)]
    fn illegal_transitions_are_refused(#[case] state: S, #[case] event: E) {
        assert_eq!(state.transition(event, false, true), None);
    }

    #[test]
    fn implicit_reset_needs_resettable_pool() {
        assert_eq!(S::Executable.transition(E::Begin, false, false), None);
        assert_eq!(S::Executable.transition(E::Begin, false, true), Some(S::Recording));
        assert_eq!(S::Invalid.transition(E::Reset, false, false), None);
        assert_eq!(S::Invalid.transition(E::Reset, false, true), Some(S::Initial));
    }

    #[test]
    fn invalidation_only_applies_to_recorded_buffers() {
        assert_eq!(S::Executable.transition(E::Invalidate, false, false), Some(S::Invalid));
        assert_eq!(S::Initial.transition(E::Invalidate, false, false), None);
        assert!(S::RecordingInRenderPass.is_recording());
        assert!(!S::Executable.is_recording());
    }
}

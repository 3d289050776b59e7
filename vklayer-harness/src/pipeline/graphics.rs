use ash::vk;
use std::ffi::c_void;
use std::ptr;
use std::sync::Arc;
use tracing::debug;

use super::{null_or, run_oneshot, PipelineResources};
use crate::device::DeviceContext;
use crate::error::Result;
use crate::monitor::{Monitor, Needles};
use crate::objects::ShaderModule;
use crate::shader::{builtin, ShaderCompiler, ShaderSource};

fn opt_ptr<T>(item: &Option<T>) -> *const T {
    item.as_ref().map_or(ptr::null(), |s| s as *const T)
}

/// Every sub-state of a graphics pipeline, plus the create info that points
/// into them.
///
/// Fields are public; tests overwrite whatever they probe. The `set_*`
/// helpers keep array counts in step with their vectors, while a count
/// written directly stays as written. Array pointers are only valid after
/// [`GraphicsPipelineState::late_bind`], which is why the builder calls it
/// right before creation.
#[derive(Debug)]
pub struct GraphicsPipelineState {
    pub shader_stages: Vec<vk::PipelineShaderStageCreateInfo>,
    pub vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    pub vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    pub vertex_input_state: vk::PipelineVertexInputStateCreateInfo,
    pub input_assembly_state: vk::PipelineInputAssemblyStateCreateInfo,
    pub tessellation_state: Option<vk::PipelineTessellationStateCreateInfo>,
    pub viewports: Vec<vk::Viewport>,
    pub scissors: Vec<vk::Rect2D>,
    /// Counts are left as set; dynamic viewports legitimately differ from
    /// the vector lengths.
    pub viewport_state: Option<vk::PipelineViewportStateCreateInfo>,
    pub rasterization_state: vk::PipelineRasterizationStateCreateInfo,
    /// Chained behind the rasterization state when present.
    pub line_state: Option<vk::PipelineRasterizationLineStateCreateInfoEXT>,
    pub multisample_state: vk::PipelineMultisampleStateCreateInfo,
    pub sample_mask: Vec<vk::SampleMask>,
    pub depth_stencil_state: Option<vk::PipelineDepthStencilStateCreateInfo>,
    pub color_blend_attachments: Vec<vk::PipelineColorBlendAttachmentState>,
    pub color_blend_state: Option<vk::PipelineColorBlendStateCreateInfo>,
    pub dynamic_states: Vec<vk::DynamicState>,
    pub dynamic_state: Option<vk::PipelineDynamicStateCreateInfo>,
    pub create_info: vk::GraphicsPipelineCreateInfo,
}

impl GraphicsPipelineState {
    /// Defaults that create a valid pipeline for a single color target of
    /// `extent` in subpass 0 of `render_pass`.
    pub fn new(extent: vk::Extent2D, render_pass: vk::RenderPass) -> Self {
        let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false)
            .build();

        let rasterization_state = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::BACK)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .depth_bias_enable(false)
            .build();

        let multisample_state = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1)
            .min_sample_shading(1.0)
            .build();

        let color_blend_state = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .logic_op(vk::LogicOp::COPY)
            .blend_constants([1.0, 1.0, 1.0, 1.0])
            .build();

        let create_info = vk::GraphicsPipelineCreateInfo::builder()
            .flags(vk::PipelineCreateFlags::DISABLE_OPTIMIZATION)
            .render_pass(render_pass)
            .subpass(0)
            .build();

        let mut state = Self {
            shader_stages: Vec::new(),
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            vertex_input_state: vk::PipelineVertexInputStateCreateInfo::default(),
            input_assembly_state,
            tessellation_state: None,
            viewports: Vec::new(),
            scissors: Vec::new(),
            viewport_state: None,
            rasterization_state,
            line_state: None,
            multisample_state,
            sample_mask: Vec::new(),
            depth_stencil_state: None,
            color_blend_attachments: Vec::new(),
            color_blend_state: Some(color_blend_state),
            dynamic_states: Vec::new(),
            dynamic_state: None,
            create_info,
        };
        state.set_vertex_input(Vec::new(), Vec::new());
        state.set_viewports(
            vec![vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            }],
            vec![vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            }],
        );
        state.add_default_color_attachment();
        state
    }

    /// Replaces viewports and scissors and sets the counts to match.
    pub fn set_viewports(&mut self, viewports: Vec<vk::Viewport>, scissors: Vec<vk::Rect2D>) {
        let viewport_state = self
            .viewport_state
            .get_or_insert_with(vk::PipelineViewportStateCreateInfo::default);
        viewport_state.viewport_count = viewports.len() as u32;
        viewport_state.scissor_count = scissors.len() as u32;
        self.viewports = viewports;
        self.scissors = scissors;
    }

    /// Replaces the vertex bindings and attributes and sets the counts to match.
    pub fn set_vertex_input(
        &mut self,
        bindings: Vec<vk::VertexInputBindingDescription>,
        attributes: Vec<vk::VertexInputAttributeDescription>,
    ) {
        self.vertex_input_state.vertex_binding_description_count = bindings.len() as u32;
        self.vertex_input_state.vertex_attribute_description_count = attributes.len() as u32;
        self.vertex_bindings = bindings;
        self.vertex_attributes = attributes;
    }

    /// Replaces the blend attachment states and sets the count to match.
    pub fn set_color_blend_attachments(&mut self, attachments: Vec<vk::PipelineColorBlendAttachmentState>) {
        self.color_blend_attachments = attachments;
        self.sync_blend_attachment_count();
    }

    /// Appends an opaque, non-blending attachment state writing all channels.
    pub fn add_default_color_attachment(&mut self) {
        self.color_blend_attachments.push(
            vk::PipelineColorBlendAttachmentState::builder()
                .blend_enable(false)
                .color_write_mask(vk::ColorComponentFlags::RGBA)
                .build(),
        );
        self.sync_blend_attachment_count();
    }

    fn sync_blend_attachment_count(&mut self) {
        let count = self.color_blend_attachments.len() as u32;
        if let Some(blend) = self.color_blend_state.as_mut() {
            blend.attachment_count = count;
        }
    }

    /// Declares `states` dynamic.
    pub fn make_dynamic(&mut self, states: &[vk::DynamicState]) {
        self.dynamic_states = states.to_vec();
        self.dynamic_state = Some(vk::PipelineDynamicStateCreateInfo {
            dynamic_state_count: states.len() as u32,
            ..Default::default()
        });
    }

    pub fn enable_tessellation(&mut self, patch_control_points: u32) {
        self.input_assembly_state.topology = vk::PrimitiveTopology::PATCH_LIST;
        self.tessellation_state = Some(
            vk::PipelineTessellationStateCreateInfo::builder()
                .patch_control_points(patch_control_points)
                .build(),
        );
    }

    /// Depth test and write with `LESS`; stencil off.
    pub fn enable_depth_stencil(&mut self) {
        self.depth_stencil_state = Some(
            vk::PipelineDepthStencilStateCreateInfo::builder()
                .depth_test_enable(true)
                .depth_write_enable(true)
                .depth_compare_op(vk::CompareOp::LESS)
                .max_depth_bounds(1.0)
                .build(),
        );
    }

    /// Chains a line rasterization state in `DEFAULT` mode.
    pub fn enable_line_state(&mut self) {
        self.line_state = Some(
            vk::PipelineRasterizationLineStateCreateInfoEXT::builder()
                .line_rasterization_mode(vk::LineRasterizationModeEXT::DEFAULT)
                .build(),
        );
    }

    /// Points every nested pointer at the current sub-states and sets the
    /// layout.
    ///
    /// Only the stage count follows its vector; every other count is left
    /// as set, so a deliberately mismatched count reaches the driver. Calling
    /// this any number of times without other mutation leaves the graph
    /// unchanged.
    pub fn late_bind(&mut self, layout: vk::PipelineLayout) -> &vk::GraphicsPipelineCreateInfo {
        self.create_info.layout = layout;
        self.rebind_pointers();
        &self.create_info
    }

    fn rebind_pointers(&mut self) {
        self.vertex_input_state.p_vertex_binding_descriptions = null_or(&self.vertex_bindings);
        self.vertex_input_state.p_vertex_attribute_descriptions = null_or(&self.vertex_attributes);

        if let Some(viewport_state) = self.viewport_state.as_mut() {
            viewport_state.p_viewports = null_or(&self.viewports);
            viewport_state.p_scissors = null_or(&self.scissors);
        }

        self.rasterization_state.p_next = self
            .line_state
            .as_ref()
            .map_or(ptr::null(), |line| line as *const _ as *const c_void);

        self.multisample_state.p_sample_mask = null_or(&self.sample_mask);

        if let Some(blend) = self.color_blend_state.as_mut() {
            blend.p_attachments = null_or(&self.color_blend_attachments);
        }

        if let Some(dynamic) = self.dynamic_state.as_mut() {
            dynamic.p_dynamic_states = null_or(&self.dynamic_states);
        }

        let ci = &mut self.create_info;
        ci.stage_count = self.shader_stages.len() as u32;
        ci.p_stages = null_or(&self.shader_stages);
        ci.p_vertex_input_state = &self.vertex_input_state;
        ci.p_input_assembly_state = &self.input_assembly_state;
        ci.p_tessellation_state = opt_ptr(&self.tessellation_state);
        ci.p_viewport_state = opt_ptr(&self.viewport_state);
        ci.p_rasterization_state = &self.rasterization_state;
        ci.p_multisample_state = &self.multisample_state;
        ci.p_depth_stencil_state = opt_ptr(&self.depth_stencil_state);
        ci.p_color_blend_state = opt_ptr(&self.color_blend_state);
        ci.p_dynamic_state = opt_ptr(&self.dynamic_state);
    }
}

/// A clone's array pointers point into its own vectors, never into the
/// original's. Pointers to inline sub-states move with the value, so
/// `late_bind` is still due before creation.
impl Clone for GraphicsPipelineState {
    fn clone(&self) -> Self {
        let mut copy = Self {
            shader_stages: self.shader_stages.clone(),
            vertex_bindings: self.vertex_bindings.clone(),
            vertex_attributes: self.vertex_attributes.clone(),
            vertex_input_state: self.vertex_input_state,
            input_assembly_state: self.input_assembly_state,
            tessellation_state: self.tessellation_state,
            viewports: self.viewports.clone(),
            scissors: self.scissors.clone(),
            viewport_state: self.viewport_state,
            rasterization_state: self.rasterization_state,
            line_state: self.line_state,
            multisample_state: self.multisample_state,
            sample_mask: self.sample_mask.clone(),
            depth_stencil_state: self.depth_stencil_state,
            color_blend_attachments: self.color_blend_attachments.clone(),
            color_blend_state: self.color_blend_state,
            dynamic_states: self.dynamic_states.clone(),
            dynamic_state: self.dynamic_state,
            create_info: self.create_info,
        };
        copy.rebind_pointers();
        copy
    }
}

/// Builds graphics pipelines against a context's render pass.
///
/// `new` fills in the defaults (the built-in vertex and fragment shaders,
/// see [`GraphicsPipelineState::new`]); a test edits `state` or
/// `resources.dsl_bindings`, calls [`init_state`](Self::init_state) and then
/// [`create_graphics_pipeline`](Self::create_graphics_pipeline).
pub struct GraphicsPipelineBuilder {
    pub state: GraphicsPipelineState,
    pub resources: PipelineResources,
    /// Used instead of the builder's own layout when set.
    pub layout_override: Option<vk::PipelineLayout>,
    shaders: Vec<ShaderModule>,
    monitor: Arc<Monitor>,
    compiler: Arc<dyn ShaderCompiler>,
}

impl GraphicsPipelineBuilder {
    pub fn new(ctx: &DeviceContext) -> Result<Self> {
        let device = ctx.device();
        let compiler = Arc::clone(ctx.compiler());
        let vs = ShaderModule::from_source(
            device,
            compiler.as_ref(),
            vk::ShaderStageFlags::VERTEX,
            &ShaderSource::Glsl(builtin::VERTEX_GLSL),
        )?;
        let fs = ShaderModule::from_source(
            device,
            compiler.as_ref(),
            vk::ShaderStageFlags::FRAGMENT,
            &ShaderSource::Glsl(builtin::FRAGMENT_GLSL),
        )?;
        let mut builder = Self {
            state: GraphicsPipelineState::new(ctx.extent(), ctx.render_pass().handle()),
            resources: PipelineResources::new(device),
            layout_override: None,
            shaders: Vec::new(),
            monitor: Arc::clone(ctx.monitor()),
            compiler,
        };
        builder.set_shaders(vec![vs, fs]);
        Ok(builder)
    }

    /// Replaces the shader stages with `shaders`, in order.
    pub fn set_shaders(&mut self, shaders: Vec<ShaderModule>) {
        self.state.shader_stages = shaders.iter().map(ShaderModule::stage_info).collect();
        self.shaders = shaders;
    }

    /// Compiles `source` and appends it as another stage.
    pub fn add_shader(&mut self, stage: vk::ShaderStageFlags, source: &ShaderSource<'_>) -> Result<()> {
        let module = ShaderModule::from_source(self.resources.device(), self.compiler.as_ref(), stage, source)?;
        self.state.shader_stages.push(module.stage_info());
        self.shaders.push(module);
        Ok(())
    }

    pub fn shaders(&self) -> &[ShaderModule] {
        &self.shaders
    }

    /// Creates the descriptor set, layout and cache from current settings.
    pub fn init_state(&mut self) -> Result<()> {
        self.resources.init_state()
    }

    pub fn late_bind(&mut self) -> &vk::GraphicsPipelineCreateInfo {
        let layout = self
            .layout_override
            .unwrap_or_else(|| self.resources.layout_handle());
        self.state.late_bind(layout)
    }

    /// Calls `vkCreateGraphicsPipelines` once and returns its status.
    ///
    /// With `implicit_destroy` a pipeline from an earlier call is destroyed
    /// first; otherwise it is kept alive until the builder drops.
    pub fn create_graphics_pipeline(&mut self, implicit_destroy: bool, do_late_bind: bool) -> vk::Result {
        if do_late_bind {
            self.late_bind();
        }
        self.resources.release_previous(implicit_destroy);
        let device = Arc::clone(self.resources.device());
        let mut raw = vk::Pipeline::null();
        let result = unsafe {
            (device.fp_v1_0().create_graphics_pipelines)(
                device.handle(),
                self.resources.cache_handle(),
                1,
                &self.state.create_info,
                ptr::null(),
                &mut raw,
            )
        };
        debug!(?result, "vkCreateGraphicsPipelines");
        self.resources.adopt(raw, result)
    }

    pub fn pipeline(&self) -> vk::Pipeline {
        self.resources.pipeline()
    }

    /// Builds a default pipeline, lets `configure` alter it and expects
    /// `needles` (or silence when `positive`) from creation.
    #[track_caller]
    pub fn oneshot_test<N: Needles>(
        ctx: &DeviceContext,
        configure: impl FnOnce(&mut Self),
        mask: vk::DebugReportFlagsEXT,
        needles: N,
        positive: bool,
    ) -> Result<bool> {
        let mut builder = Self::new(ctx)?;
        configure(&mut builder);
        builder.init_state()?;
        let monitor = Arc::clone(&builder.monitor);
        Ok(run_oneshot(&monitor, mask, needles, positive, || {
            builder.create_graphics_pipeline(true, true)
        }))
    }
}

impl std::fmt::Debug for GraphicsPipelineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphicsPipelineBuilder")
            .field("stages", &self.state.shader_stages.len())
            .field("resources", &self.resources)
            .field("compiler", &self.compiler.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use pretty_assertions::assert_eq;

    fn extent() -> vk::Extent2D {
        vk::Extent2D {
            width: 32,
            height: 32,
        }
    }

    /// Pointers and counts of the create-info graph.
    fn fingerprint(state: &GraphicsPipelineState) -> Vec<usize> {
        let ci = &state.create_info;
        let vp = state.viewport_state.as_ref().map_or((0, 0, 0, 0), |v| {
            (
                v.viewport_count as usize,
                v.p_viewports as usize,
                v.scissor_count as usize,
                v.p_scissors as usize,
            )
        });
        let blend = state
            .color_blend_state
            .as_ref()
            .map_or((0, 0), |b| (b.attachment_count as usize, b.p_attachments as usize));
        vec![
            ci.stage_count as usize,
            ci.p_stages as usize,
            ci.p_vertex_input_state as usize,
            ci.p_input_assembly_state as usize,
            ci.p_tessellation_state as usize,
            ci.p_viewport_state as usize,
            ci.p_rasterization_state as usize,
            ci.p_multisample_state as usize,
            ci.p_depth_stencil_state as usize,
            ci.p_color_blend_state as usize,
            ci.p_dynamic_state as usize,
            ci.layout.as_raw() as usize,
            ci.render_pass.as_raw() as usize,
            ci.subpass as usize,
            vp.0,
            vp.1,
            vp.2,
            vp.3,
            blend.0,
            blend.1,
            state.rasterization_state.p_next as usize,
            state.vertex_input_state.vertex_binding_description_count as usize,
        ]
    }

    #[test]
    fn defaults_describe_one_color_target() {
        let state = GraphicsPipelineState::new(extent(), vk::RenderPass::from_raw(0x10));
        assert_eq!(state.input_assembly_state.topology, vk::PrimitiveTopology::TRIANGLE_LIST);
        assert_eq!(state.rasterization_state.cull_mode, vk::CullModeFlags::BACK);
        assert_eq!(state.rasterization_state.line_width, 1.0);
        assert_eq!(state.multisample_state.rasterization_samples, vk::SampleCountFlags::TYPE_1);
        assert_eq!(state.color_blend_attachments.len(), 1);
        assert_eq!(state.viewports[0].width, 32.0);
        assert_eq!(state.scissors[0].extent, extent());
        assert_eq!(state.create_info.flags, vk::PipelineCreateFlags::DISABLE_OPTIMIZATION);
        assert!(state.depth_stencil_state.is_none());
        assert!(state.dynamic_state.is_none());
    }

    #[test]
    fn late_bind_points_into_the_sub_states() {
        let mut state = GraphicsPipelineState::new(extent(), vk::RenderPass::from_raw(0x10));
        let layout = vk::PipelineLayout::from_raw(0x20);
        state.late_bind(layout);
        let ci = &state.create_info;
        assert_eq!(ci.layout, layout);
        assert_eq!(ci.p_input_assembly_state, &state.input_assembly_state as *const _);
        assert!(ci.p_depth_stencil_state.is_null());
        assert!(ci.p_dynamic_state.is_null());
        assert!(state.rasterization_state.p_next.is_null());
        let blend = state.color_blend_state.as_ref().unwrap();
        assert_eq!(blend.attachment_count, 1);
        assert_eq!(blend.p_attachments, state.color_blend_attachments.as_ptr());
    }

    #[test]
    fn repeated_late_bind_yields_the_same_graph() {
        let mut state = GraphicsPipelineState::new(extent(), vk::RenderPass::from_raw(0x10));
        state.make_dynamic(&[vk::DynamicState::LINE_WIDTH]);
        state.enable_line_state();
        let layout = vk::PipelineLayout::from_raw(0x20);
        state.late_bind(layout);
        let first = fingerprint(&state);
        state.late_bind(layout);
        state.late_bind(layout);
        assert_eq!(fingerprint(&state), first);
    }

    #[test]
    fn viewport_counts_survive_late_bind() {
        let mut state = GraphicsPipelineState::new(extent(), vk::RenderPass::from_raw(0x10));
        state.make_dynamic(&[vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR]);
        state.viewports.clear();
        state.scissors.clear();
        state.late_bind(vk::PipelineLayout::null());
        let vp = state.viewport_state.as_ref().unwrap();
        assert_eq!((vp.viewport_count, vp.scissor_count), (1, 1));
        assert!(vp.p_viewports.is_null());
        assert_eq!(state.dynamic_state.as_ref().unwrap().dynamic_state_count, 2);
    }

    #[test]
    fn mismatched_counts_survive_late_bind() {
        let mut state = GraphicsPipelineState::new(extent(), vk::RenderPass::from_raw(0x10));
        state.color_blend_state.as_mut().unwrap().attachment_count = 3;
        state.make_dynamic(&[vk::DynamicState::LINE_WIDTH]);
        state.dynamic_state.as_mut().unwrap().dynamic_state_count = 0;
        state.vertex_input_state.vertex_binding_description_count = 2;
        // The builder binds once more inside create.
        state.late_bind(vk::PipelineLayout::null());
        state.late_bind(vk::PipelineLayout::null());
        let blend = state.color_blend_state.as_ref().unwrap();
        assert_eq!(blend.attachment_count, 3);
        assert_eq!(blend.p_attachments, state.color_blend_attachments.as_ptr());
        assert_eq!(state.dynamic_state.as_ref().unwrap().dynamic_state_count, 0);
        assert_eq!(state.vertex_input_state.vertex_binding_description_count, 2);
        assert_eq!(state.create_info.stage_count, 0);
    }

    #[test]
    fn setters_keep_counts_in_step() {
        let mut state = GraphicsPipelineState::new(extent(), vk::RenderPass::null());
        state.add_default_color_attachment();
        assert_eq!(state.color_blend_state.as_ref().unwrap().attachment_count, 2);
        state.set_color_blend_attachments(Vec::new());
        assert_eq!(state.color_blend_state.as_ref().unwrap().attachment_count, 0);
        state.set_vertex_input(
            vec![vk::VertexInputBindingDescription::default(); 2],
            vec![vk::VertexInputAttributeDescription::default(); 3],
        );
        assert_eq!(state.vertex_input_state.vertex_binding_description_count, 2);
        assert_eq!(state.vertex_input_state.vertex_attribute_description_count, 3);
    }

    #[test]
    fn clones_point_into_their_own_storage() {
        let mut original = GraphicsPipelineState::new(extent(), vk::RenderPass::from_raw(0x10));
        original.make_dynamic(&[vk::DynamicState::VIEWPORT]);
        original.enable_line_state();
        original.late_bind(vk::PipelineLayout::from_raw(0x20));
        let copy = original.clone();
        let blend = copy.color_blend_state.as_ref().unwrap();
        assert_eq!(blend.p_attachments, copy.color_blend_attachments.as_ptr());
        assert_ne!(blend.p_attachments, original.color_blend_attachments.as_ptr());
        assert_eq!(
            copy.dynamic_state.as_ref().unwrap().p_dynamic_states,
            copy.dynamic_states.as_ptr()
        );
        assert_eq!(copy.create_info.layout, original.create_info.layout);
    }

    #[test]
    fn optional_states_are_linked_when_enabled() {
        let mut state = GraphicsPipelineState::new(extent(), vk::RenderPass::null());
        state.enable_tessellation(3);
        state.enable_depth_stencil();
        state.enable_line_state();
        state.late_bind(vk::PipelineLayout::null());
        assert_eq!(state.input_assembly_state.topology, vk::PrimitiveTopology::PATCH_LIST);
        assert!(!state.create_info.p_tessellation_state.is_null());
        assert!(!state.create_info.p_depth_stencil_state.is_null());
        assert_eq!(
            state.rasterization_state.p_next,
            state.line_state.as_ref().unwrap() as *const _ as *const c_void
        );
    }
}

//! Attachments, render pass, graphics pipeline and framebuffers.

use std::io::Cursor;
use std::path::Path;

use anyhow::{anyhow, Result};
use ash::vk;
use ash::{Device, Instance};
use log::*;

use crate::config::MSAA_SAMPLES;
use crate::error::RendererError;
use crate::memory::{create_image_view, GpuImage, ImageDesc};
use crate::model::Vertex;
use crate::teardown::TeardownStack;

/// Depth formats probed in descending precision order.
pub const DEPTH_FORMAT_CANDIDATES: &[vk::Format] = &[
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

/// Fixed-function state that varies between configurations.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PipelineSettings {
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    pub samples: vk::SampleCountFlags,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_test: true,
            depth_write: true,
            samples: MSAA_SAMPLES,
        }
    }
}

//==================================================================================================
// SECTION: Format and sample count probing
//==================================================================================================

/// Returns the first candidate whose properties (as reported by `lookup`) contain `features`
/// for the given tiling.
pub fn select_supported_format<F>(
    candidates: &[vk::Format],
    tiling: vk::ImageTiling,
    features: vk::FormatFeatureFlags,
    lookup: F,
) -> Option<vk::Format>
where
    F: Fn(vk::Format) -> vk::FormatProperties,
{
    candidates.iter().copied().find(|&format| {
        let properties = lookup(format);
        match tiling {
            vk::ImageTiling::LINEAR => properties.linear_tiling_features.contains(features),
            vk::ImageTiling::OPTIMAL => properties.optimal_tiling_features.contains(features),
            _ => false,
        }
    })
}

pub fn find_depth_format(instance: &Instance, physical_device: vk::PhysicalDevice) -> Result<vk::Format> {
    let format = select_supported_format(
        DEPTH_FORMAT_CANDIDATES,
        vk::ImageTiling::OPTIMAL,
        vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
        // SAFETY: `physical_device` belongs to `instance`.
        |format| unsafe { instance.get_physical_device_format_properties(physical_device, format) },
    )
    .ok_or_else(|| anyhow!(RendererError::NoSupportedDepthFormat))?;
    info!("Depth format: {:?}", format);
    Ok(format)
}

/// Highest sample count not above `requested` that both colour and depth
/// framebuffers support.
pub fn clamp_sample_count(
    requested: vk::SampleCountFlags,
    limits: &vk::PhysicalDeviceLimits,
) -> vk::SampleCountFlags {
    let supported =
        limits.framebuffer_color_sample_counts & limits.framebuffer_depth_sample_counts;
    [
        vk::SampleCountFlags::TYPE_64,
        vk::SampleCountFlags::TYPE_32,
        vk::SampleCountFlags::TYPE_16,
        vk::SampleCountFlags::TYPE_8,
        vk::SampleCountFlags::TYPE_4,
        vk::SampleCountFlags::TYPE_2,
    ]
    .into_iter()
    .find(|&count| count.as_raw() <= requested.as_raw() && supported.contains(count))
    .unwrap_or(vk::SampleCountFlags::TYPE_1)
}

//==================================================================================================
// SECTION: Render pass
//==================================================================================================

/// Formats and sample count the render pass is built for. The attachment order is
/// `[msaa colour, depth, resolve]` when multisampling and `[colour, depth]` otherwise;
/// framebuffers and clear values follow the same order.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AttachmentLayout {
    pub color_format: vk::Format,
    pub depth_format: vk::Format,
    pub samples: vk::SampleCountFlags,
}

impl AttachmentLayout {
    pub fn is_multisampled(&self) -> bool {
        self.samples != vk::SampleCountFlags::TYPE_1
    }

    pub fn descriptions(&self) -> Vec<vk::AttachmentDescription> {
        let depth = vk::AttachmentDescription::default()
            .format(self.depth_format)
            .samples(self.samples)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);

        let presented = |load_op| {
            vk::AttachmentDescription::default()
                .format(self.color_format)
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(load_op)
                .store_op(vk::AttachmentStoreOp::STORE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        };

        if !self.is_multisampled() {
            return vec![presented(vk::AttachmentLoadOp::CLEAR), depth];
        }

        let msaa_color = vk::AttachmentDescription::default()
            .format(self.color_format)
            .samples(self.samples)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);

        vec![msaa_color, depth, presented(vk::AttachmentLoadOp::DONT_CARE)]
    }

    /// One clear value per attachment: black colour, depth 1.0, black resolve.
    pub fn clear_values(&self) -> Vec<vk::ClearValue> {
        let color = vk::ClearValue {
            color: vk::ClearColorValue {
                float32: [0.0, 0.0, 0.0, 1.0],
            },
        };
        let depth = vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: 1.0,
                stencil: 0,
            },
        };
        if self.is_multisampled() {
            vec![color, depth, color]
        } else {
            vec![color, depth]
        }
    }

    /// Orders per-framebuffer views to match [`AttachmentLayout::descriptions`].
    pub fn framebuffer_attachments(
        &self,
        color_view: Option<vk::ImageView>,
        depth_view: vk::ImageView,
        swapchain_view: vk::ImageView,
    ) -> Vec<vk::ImageView> {
        match color_view {
            Some(color_view) if self.is_multisampled() => {
                vec![color_view, depth_view, swapchain_view]
            }
            _ => vec![swapchain_view, depth_view],
        }
    }
}

/// Keeps the attachment clears from racing writes of the previous use of the images.
pub fn subpass_dependency() -> vk::SubpassDependency {
    let stages =
        vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
    vk::SubpassDependency::default()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(stages)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(stages)
        .dst_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        )
}

pub fn create_render_pass(
    device: &Device,
    layout: &AttachmentLayout,
    teardown: &mut TeardownStack,
) -> Result<vk::RenderPass> {
    let attachments = layout.descriptions();

    let color_ref = vk::AttachmentReference::default()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
    let depth_ref = vk::AttachmentReference::default()
        .attachment(1)
        .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
    let resolve_ref = vk::AttachmentReference::default()
        .attachment(2)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);

    let mut subpass = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(std::slice::from_ref(&color_ref))
        .depth_stencil_attachment(&depth_ref);
    if layout.is_multisampled() {
        subpass = subpass.resolve_attachments(std::slice::from_ref(&resolve_ref));
    }

    let subpasses = &[subpass];
    let dependencies = &[subpass_dependency()];
    let create_info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(subpasses)
        .dependencies(dependencies);

    // SAFETY: `create_info` only borrows locals that outlive the call.
    let render_pass = unsafe { device.create_render_pass(&create_info, None)? };
    teardown.push(render_pass);
    Ok(render_pass)
}

//==================================================================================================
// SECTION: Attachment images
//==================================================================================================

/// Depth buffer plus, when multisampling, the transient colour target.
pub struct RenderTargets {
    pub layout: AttachmentLayout,
    pub color: Option<(GpuImage, vk::ImageView)>,
    pub depth: GpuImage,
    pub depth_view: vk::ImageView,
}

impl RenderTargets {
    pub fn new(
        device: &Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        extent: vk::Extent2D,
        layout: AttachmentLayout,
        teardown: &mut TeardownStack,
    ) -> Result<Self> {
        let color = if layout.is_multisampled() {
            let image = GpuImage::new(
                device,
                memory_properties,
                ImageDesc {
                    extent,
                    format: layout.color_format,
                    samples: layout.samples,
                    usage: vk::ImageUsageFlags::COLOR_ATTACHMENT
                        | vk::ImageUsageFlags::TRANSIENT_ATTACHMENT,
                },
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )?;
            teardown.push_image(&image);
            let view =
                create_image_view(device, image.image, layout.color_format, vk::ImageAspectFlags::COLOR)?;
            teardown.push(view);
            Some((image, view))
        } else {
            None
        };

        let depth = GpuImage::new(
            device,
            memory_properties,
            ImageDesc {
                extent,
                format: layout.depth_format,
                samples: layout.samples,
                usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            },
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        teardown.push_image(&depth);
        let depth_view =
            create_image_view(device, depth.image, layout.depth_format, vk::ImageAspectFlags::DEPTH)?;
        teardown.push(depth_view);

        info!(
            "Render targets created ({:?}, multisampled: {}).",
            layout.samples,
            layout.is_multisampled()
        );

        Ok(Self {
            layout,
            color,
            depth,
            depth_view,
        })
    }
}

pub fn create_framebuffers(
    device: &Device,
    render_pass: vk::RenderPass,
    targets: &RenderTargets,
    swapchain_views: &[vk::ImageView],
    teardown: &mut TeardownStack,
) -> Result<Vec<vk::Framebuffer>> {
    let extent = targets.depth.extent;
    let color_view = targets.color.map(|(_, view)| view);
    let mut framebuffers = Vec::with_capacity(swapchain_views.len());
    for &swapchain_view in swapchain_views {
        let attachments =
            targets
                .layout
                .framebuffer_attachments(color_view, targets.depth_view, swapchain_view);
        let create_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(&attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        // SAFETY: every view matches the render pass attachment at the same index.
        let framebuffer = unsafe { device.create_framebuffer(&create_info, None)? };
        teardown.push(framebuffer);
        framebuffers.push(framebuffer);
    }
    Ok(framebuffers)
}

//==================================================================================================
// SECTION: Shaders and pipeline
//==================================================================================================

/// Reads a SPIR-V binary from disk into aligned words.
pub fn load_shader_code(path: &Path) -> Result<Vec<u32>> {
    let bytes = std::fs::read(path).map_err(|source| RendererError::MissingFile {
        path: path.to_path_buf(),
        source,
    })?;
    if bytes.is_empty() {
        return Err(anyhow!(RendererError::EmptyShader));
    }
    let code = ash::util::read_spv(&mut Cursor::new(&bytes))
        .map_err(|e| anyhow!("Failed to read SPIR-V from '{}': {}", path.display(), e))?;
    Ok(code)
}

fn create_shader_module(device: &Device, code: &[u32]) -> Result<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::default().code(code);
    // SAFETY: `code` is validated SPIR-V word data.
    unsafe { Ok(device.create_shader_module(&create_info, None)?) }
}

#[derive(Copy, Clone, Debug)]
pub struct GraphicsPipeline {
    pub layout: vk::PipelineLayout,
    pub pipeline: vk::Pipeline,
}

/// Builds the pipeline with fixed viewport and scissor covering `extent`.
pub fn create_pipeline(
    device: &Device,
    render_pass: vk::RenderPass,
    descriptor_set_layout: vk::DescriptorSetLayout,
    extent: vk::Extent2D,
    settings: &PipelineSettings,
    shader_paths: (&Path, &Path),
    teardown: &mut TeardownStack,
) -> Result<GraphicsPipeline> {
    let vert_code = load_shader_code(shader_paths.0)?;
    let frag_code = load_shader_code(shader_paths.1)?;

    let set_layouts = &[descriptor_set_layout];
    let layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(set_layouts);
    // SAFETY: `descriptor_set_layout` is live.
    let layout = unsafe { device.create_pipeline_layout(&layout_info, None)? };
    teardown.push(layout);

    let vert_module = create_shader_module(device, &vert_code)?;
    let frag_module = match create_shader_module(device, &frag_code) {
        Ok(module) => module,
        Err(e) => {
            // SAFETY: the module is not referenced by any pipeline.
            unsafe { device.destroy_shader_module(vert_module, None) };
            return Err(e);
        }
    };

    let result = build_pipeline(
        device,
        render_pass,
        layout,
        extent,
        settings,
        (vert_module, frag_module),
    );

    // SAFETY: pipeline creation has returned; the modules are no longer needed.
    unsafe {
        device.destroy_shader_module(vert_module, None);
        device.destroy_shader_module(frag_module, None);
    }

    let pipeline = result?;
    teardown.push(pipeline);
    Ok(GraphicsPipeline { layout, pipeline })
}

fn build_pipeline(
    device: &Device,
    render_pass: vk::RenderPass,
    layout: vk::PipelineLayout,
    extent: vk::Extent2D,
    settings: &PipelineSettings,
    modules: (vk::ShaderModule, vk::ShaderModule),
) -> Result<vk::Pipeline> {
    let entry_point = c"main";
    let shader_stages = [
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(modules.0)
            .name(entry_point),
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(modules.1)
            .name(entry_point),
    ];

    let binding_descriptions = [Vertex::binding_description()];
    let attribute_descriptions = Vertex::attribute_descriptions();
    let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&binding_descriptions)
        .vertex_attribute_descriptions(&attribute_descriptions);

    let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
        .primitive_restart_enable(false);

    let viewport = vk::Viewport::default()
        .x(0.0)
        .y(0.0)
        .width(extent.width as f32)
        .height(extent.height as f32)
        .min_depth(0.0)
        .max_depth(1.0);
    let scissor = vk::Rect2D::default()
        .offset(vk::Offset2D { x: 0, y: 0 })
        .extent(extent);
    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewports(std::slice::from_ref(&viewport))
        .scissors(std::slice::from_ref(&scissor));

    let rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(settings.cull_mode)
        .front_face(settings.front_face)
        .depth_bias_enable(false);

    let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
        .sample_shading_enable(false)
        .rasterization_samples(settings.samples);

    let depth_stencil_state = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(settings.depth_test)
        .depth_write_enable(settings.depth_write)
        .depth_compare_op(vk::CompareOp::LESS)
        .depth_bounds_test_enable(false)
        .min_depth_bounds(0.0)
        .max_depth_bounds(1.0)
        .stencil_test_enable(false);

    let color_blend_attachment = vk::PipelineColorBlendAttachmentState::default()
        .color_write_mask(vk::ColorComponentFlags::RGBA)
        .blend_enable(false)
        .src_color_blend_factor(vk::BlendFactor::ONE)
        .dst_color_blend_factor(vk::BlendFactor::ZERO)
        .color_blend_op(vk::BlendOp::ADD)
        .src_alpha_blend_factor(vk::BlendFactor::ONE)
        .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
        .alpha_blend_op(vk::BlendOp::ADD);
    let color_blend_state = vk::PipelineColorBlendStateCreateInfo::default()
        .logic_op_enable(false)
        .logic_op(vk::LogicOp::COPY)
        .attachments(std::slice::from_ref(&color_blend_attachment))
        .blend_constants([0.0, 0.0, 0.0, 0.0]);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input_state)
        .input_assembly_state(&input_assembly_state)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization_state)
        .multisample_state(&multisample_state)
        .depth_stencil_state(&depth_stencil_state)
        .color_blend_state(&color_blend_state)
        .layout(layout)
        .render_pass(render_pass)
        .subpass(0);

    // SAFETY: every state struct above outlives the call.
    unsafe {
        match device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None) {
            Ok(pipelines) => Ok(pipelines[0]),
            Err((pipelines, err)) => {
                for pipeline in pipelines {
                    if pipeline != vk::Pipeline::null() {
                        device.destroy_pipeline(pipeline, None);
                    }
                }
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn layout(samples: vk::SampleCountFlags) -> AttachmentLayout {
        AttachmentLayout {
            color_format: vk::Format::B8G8R8A8_SRGB,
            depth_format: vk::Format::D32_SFLOAT,
            samples,
        }
    }

    #[test]
    fn depth_probe_returns_first_supported_candidate() {
        let lookup = |format: vk::Format| {
            let mut properties = vk::FormatProperties::default();
            if format == vk::Format::D24_UNORM_S8_UINT || format == vk::Format::D32_SFLOAT_S8_UINT {
                properties.optimal_tiling_features = vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT;
            }
            properties
        };
        assert_eq!(
            select_supported_format(
                DEPTH_FORMAT_CANDIDATES,
                vk::ImageTiling::OPTIMAL,
                vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
                lookup,
            ),
            Some(vk::Format::D32_SFLOAT_S8_UINT)
        );
    }

    #[test]
    fn depth_probe_checks_the_requested_tiling() {
        let linear_only = |_: vk::Format| vk::FormatProperties {
            linear_tiling_features: vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
            ..Default::default()
        };
        assert_eq!(
            select_supported_format(
                DEPTH_FORMAT_CANDIDATES,
                vk::ImageTiling::OPTIMAL,
                vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
                linear_only,
            ),
            None
        );
    }

    #[test]
    fn sample_count_is_clamped_to_device_limits() {
        let limits = vk::PhysicalDeviceLimits {
            framebuffer_color_sample_counts: vk::SampleCountFlags::TYPE_1
                | vk::SampleCountFlags::TYPE_2
                | vk::SampleCountFlags::TYPE_4
                | vk::SampleCountFlags::TYPE_8,
            framebuffer_depth_sample_counts: vk::SampleCountFlags::TYPE_1
                | vk::SampleCountFlags::TYPE_2,
            ..Default::default()
        };
        assert_eq!(
            clamp_sample_count(vk::SampleCountFlags::TYPE_4, &limits),
            vk::SampleCountFlags::TYPE_2
        );
        assert_eq!(
            clamp_sample_count(vk::SampleCountFlags::TYPE_1, &limits),
            vk::SampleCountFlags::TYPE_1
        );
        assert_eq!(
            clamp_sample_count(vk::SampleCountFlags::TYPE_4, &vk::PhysicalDeviceLimits::default()),
            vk::SampleCountFlags::TYPE_1
        );
    }

    #[test]
    fn multisampled_pass_resolves_into_presentable_attachment() {
        let attachments = layout(vk::SampleCountFlags::TYPE_4).descriptions();
        assert_eq!(attachments.len(), 3);

        assert_eq!(attachments[0].samples, vk::SampleCountFlags::TYPE_4);
        assert_eq!(attachments[0].final_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(attachments[1].format, vk::Format::D32_SFLOAT);
        assert_eq!(attachments[1].samples, vk::SampleCountFlags::TYPE_4);
        assert_eq!(attachments[1].store_op, vk::AttachmentStoreOp::DONT_CARE);
        assert_eq!(attachments[2].samples, vk::SampleCountFlags::TYPE_1);
        assert_eq!(attachments[2].load_op, vk::AttachmentLoadOp::DONT_CARE);
        assert_eq!(attachments[2].store_op, vk::AttachmentStoreOp::STORE);
        assert_eq!(attachments[2].final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
    }

    #[test]
    fn single_sample_pass_draws_straight_into_the_swapchain_image() {
        let attachments = layout(vk::SampleCountFlags::TYPE_1).descriptions();
        assert_eq!(attachments.len(), 2);
        assert_eq!(attachments[0].load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(attachments[0].final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(attachments[1].final_layout, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
    }

    #[test]
    fn clear_values_match_attachment_order() {
        let values = layout(vk::SampleCountFlags::TYPE_4).clear_values();
        assert_eq!(values.len(), 3);
        // SAFETY: reading the union member each value was written with.
        unsafe {
            assert_eq!(values[0].color.float32, [0.0, 0.0, 0.0, 1.0]);
            assert_eq!(values[1].depth_stencil.depth, 1.0);
            assert_eq!(values[1].depth_stencil.stencil, 0);
            assert_eq!(values[2].color.float32, [0.0, 0.0, 0.0, 1.0]);
        }
        assert_eq!(layout(vk::SampleCountFlags::TYPE_1).clear_values().len(), 2);
    }

    #[test]
    fn framebuffer_views_follow_attachment_order() {
        let color = vk::ImageView::from_raw(1);
        let depth = vk::ImageView::from_raw(2);
        let swapchain = vk::ImageView::from_raw(3);

        assert_eq!(
            layout(vk::SampleCountFlags::TYPE_4).framebuffer_attachments(Some(color), depth, swapchain),
            vec![color, depth, swapchain]
        );
        assert_eq!(
            layout(vk::SampleCountFlags::TYPE_1).framebuffer_attachments(None, depth, swapchain),
            vec![swapchain, depth]
        );
    }

    #[test]
    fn dependency_waits_on_attachment_stages() {
        let dependency = subpass_dependency();
        let stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
        assert_eq!(dependency.src_subpass, vk::SUBPASS_EXTERNAL);
        assert_eq!(dependency.dst_subpass, 0);
        assert_eq!(dependency.src_stage_mask, stages);
        assert_eq!(dependency.dst_stage_mask, stages);
        assert!(dependency.src_access_mask.is_empty());
        assert_eq!(
            dependency.dst_access_mask,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
        );
    }

    #[test]
    fn default_settings_enable_depth_without_culling() {
        let settings = PipelineSettings::default();
        assert_eq!(settings.cull_mode, vk::CullModeFlags::NONE);
        assert_eq!(settings.front_face, vk::FrontFace::COUNTER_CLOCKWISE);
        assert!(settings.depth_test && settings.depth_write);
        assert_eq!(settings.samples, MSAA_SAMPLES);
    }

    #[test]
    fn missing_shader_is_reported() {
        let err = load_shader_code(Path::new("assets/shaders/missing.spv")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RendererError>(),
            Some(RendererError::MissingFile { .. })
        ));
    }

    #[test]
    fn empty_shader_is_rejected() {
        let path = std::env::temp_dir().join(format!("vkstage-empty-{}.spv", std::process::id()));
        std::fs::write(&path, b"").unwrap();
        let result = load_shader_code(&path);
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(
            result.unwrap_err().downcast_ref::<RendererError>(),
            Some(RendererError::EmptyShader)
        ));
    }

    #[test]
    fn truncated_shader_is_a_decode_error() {
        let path =
            std::env::temp_dir().join(format!("vkstage-truncated-{}.spv", std::process::id()));
        std::fs::write(&path, [0x03, 0x02, 0x23]).unwrap();
        let result = load_shader_code(&path);
        std::fs::remove_file(&path).unwrap();
        let err = result.unwrap_err();
        assert!(err.downcast_ref::<RendererError>().is_none());
        assert!(err.to_string().contains("Failed to read SPIR-V"));
    }
}

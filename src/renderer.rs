//! Startup, the frame entry point and teardown.

use std::path::Path;

use anyhow::{anyhow, Result};
use ash::vk;
use ash::{Device, Entry, Instance};
use log::*;
use winit::window::Window;

use crate::config::{
    FRAGMENT_SHADER_PATH, INSTANCE_COUNT, MODEL_PATH, MSAA_SAMPLES, TEXTURE_PATH,
    VERTEX_SHADER_PATH,
};
use crate::descriptor::{create_descriptor_set, create_descriptor_set_layout};
use crate::device::{create_instance, create_logical_device, pick_physical_device, Queues, SelectedDevice};
use crate::frame::{DrawResources, FrameContext, FrameExecutor, VulkanFrameBackend};
use crate::model::load_model;
use crate::render_target::{
    clamp_sample_count, create_framebuffers, create_pipeline, create_render_pass, find_depth_format,
    AttachmentLayout, PipelineSettings, RenderTargets,
};
use crate::swapchain::Swapchain;
use crate::teardown::TeardownStack;
use crate::uniform::UniformBlock;
use crate::upload::{upload_slice, Texture, UploadContext};
use crate::vk_window::create_surface;

pub struct Renderer {
    _entry: Entry,
    instance: Instance,
    surface_instance: ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
    device: Device,
    swapchain_device: ash::khr::swapchain::Device,
    teardown: TeardownStack,
    executor: FrameExecutor<VulkanFrameBackend>,
}

impl Renderer {
    /// Creates every Vulkan object needed to draw into `window`. On failure,
    /// whatever was already created is destroyed before the error is returned.
    pub fn new(window: &Window) -> Result<Self> {
        // SAFETY: the loaded library stays alive as long as `entry`.
        let entry =
            unsafe { Entry::load().map_err(|e| anyhow!("Failed to load Vulkan entry: {}", e))? };
        let instance = create_instance(window, &entry)?;
        let surface_instance = ash::khr::surface::Instance::new(&entry, &instance);

        // SAFETY: the window outlives the renderer; `main` drops the renderer first.
        let surface = match unsafe { create_surface(&instance, &entry, window, window) } {
            Ok(surface) => surface,
            Err(e) => {
                // SAFETY: nothing has been created from the instance yet.
                unsafe { instance.destroy_instance(None) };
                return Err(e);
            }
        };

        let (selected, device, queues) =
            match pick_physical_device(&instance, &surface_instance, surface).and_then(|selected| {
                let (device, queues) = create_logical_device(&instance, &selected)?;
                Ok((selected, device, queues))
            }) {
                Ok(created) => created,
                Err(e) => {
                    // SAFETY: no device exists, so the surface and instance are unused.
                    unsafe {
                        surface_instance.destroy_surface(surface, None);
                        instance.destroy_instance(None);
                    }
                    return Err(e);
                }
            };
        let swapchain_device = ash::khr::swapchain::Device::new(&instance, &device);

        let mut teardown = TeardownStack::new();
        let size = window.inner_size();
        let built = build_executor(
            &instance,
            &device,
            &swapchain_device,
            surface,
            &selected,
            queues,
            (size.width, size.height),
            &mut teardown,
        );

        match built {
            Ok(executor) => {
                info!(
                    "Renderer ready on `{}` ({} device objects).",
                    selected.name,
                    teardown.len()
                );
                Ok(Self {
                    _entry: entry,
                    instance,
                    surface_instance,
                    surface,
                    device,
                    swapchain_device,
                    teardown,
                    executor,
                })
            }
            Err(e) => {
                // SAFETY: every created child object is in `teardown`; the device is
                // drained before anything is destroyed.
                unsafe {
                    let _ = device.device_wait_idle();
                    teardown.flush(&device, &swapchain_device);
                    device.destroy_device(None);
                    surface_instance.destroy_surface(surface, None);
                    instance.destroy_instance(None);
                }
                Err(e)
            }
        }
    }

    pub fn draw_frame(&mut self) -> Result<()> {
        self.executor.draw_frame()
    }

    pub fn frames_drawn(&self) -> u64 {
        self.executor.frames_drawn()
    }

    /// Waits for the GPU to go idle, then destroys everything in reverse creation order.
    pub fn destroy(mut self) {
        // SAFETY: the executor is not used again; after the idle wait no GPU work
        // references any registered handle.
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                error!("Failed to wait for device idle before teardown: {}", e);
            }
            self.teardown.flush(&self.device, &self.swapchain_device);
            debug_assert!(self.teardown.is_empty());
            self.device.destroy_device(None);
            self.surface_instance.destroy_surface(self.surface, None);
            self.instance.destroy_instance(None);
        }
        info!("Destroyed renderer.");
    }
}

fn create_command_pool(
    device: &Device,
    queue_family: u32,
    teardown: &mut TeardownStack,
) -> Result<vk::CommandPool> {
    let create_info = vk::CommandPoolCreateInfo::default()
        .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
        .queue_family_index(queue_family);
    // SAFETY: `queue_family` is one of the families the device was created with.
    let command_pool = unsafe { device.create_command_pool(&create_info, None)? };
    teardown.push(command_pool);
    Ok(command_pool)
}

/// Runs the one-time setup steps in dependency order and hands the results to the frame loop.
#[allow(clippy::too_many_arguments)]
fn build_executor(
    instance: &Instance,
    device: &Device,
    swapchain_device: &ash::khr::swapchain::Device,
    surface: vk::SurfaceKHR,
    selected: &SelectedDevice,
    queues: Queues,
    framebuffer_size: (u32, u32),
    teardown: &mut TeardownStack,
) -> Result<FrameExecutor<VulkanFrameBackend>> {
    let capabilities = &selected.capabilities;
    let memory_properties = &capabilities.memory_properties;

    let command_pool = create_command_pool(device, selected.queue_families.graphics, teardown)?;

    let swapchain = Swapchain::new(
        device,
        swapchain_device,
        surface,
        &capabilities.swapchain_support,
        &selected.queue_families,
        framebuffer_size,
        teardown,
    )?;

    let samples = clamp_sample_count(MSAA_SAMPLES, &capabilities.properties.limits);
    if samples != MSAA_SAMPLES {
        warn!("Requested {:?} but the device supports at most {:?}.", MSAA_SAMPLES, samples);
    }
    let layout = AttachmentLayout {
        color_format: swapchain.format,
        depth_format: find_depth_format(instance, selected.physical_device)?,
        samples,
    };

    let render_pass = create_render_pass(device, &layout, teardown)?;
    let descriptor_set_layout = create_descriptor_set_layout(device, teardown)?;
    let settings = PipelineSettings {
        samples,
        ..Default::default()
    };
    let pipeline = create_pipeline(
        device,
        render_pass,
        descriptor_set_layout,
        swapchain.extent,
        &settings,
        (Path::new(VERTEX_SHADER_PATH), Path::new(FRAGMENT_SHADER_PATH)),
        teardown,
    )?;

    let targets = RenderTargets::new(device, memory_properties, swapchain.extent, layout, teardown)?;
    let framebuffers = create_framebuffers(
        device,
        render_pass,
        &targets,
        &swapchain.image_views,
        teardown,
    )?;
    debug!(
        "{} framebuffers for {} swapchain images ({:?}), {} queue families on device.",
        framebuffers.len(),
        swapchain.image_count(),
        swapchain.present_mode,
        capabilities.queue_families.len()
    );

    let upload = UploadContext {
        device,
        memory_properties,
        queue: queues.graphics,
        command_pool,
    };

    let texture = Texture::from_file(&upload, Path::new(TEXTURE_PATH), selected.max_anisotropy())?;
    teardown.push_image(&texture.image);
    teardown.push(texture.view);
    teardown.push(texture.sampler);

    let mesh = load_model(Path::new(MODEL_PATH))?;
    let vertex_buffer = upload_slice(&upload, vk::BufferUsageFlags::VERTEX_BUFFER, &mesh.vertices)?;
    teardown.push_buffer(&vertex_buffer);
    let index_buffer = upload_slice(&upload, vk::BufferUsageFlags::INDEX_BUFFER, &mesh.indices)?;
    teardown.push_buffer(&index_buffer);

    let uniforms = UniformBlock::new(device, memory_properties, teardown)?;
    let descriptor_set = create_descriptor_set(
        device,
        descriptor_set_layout,
        uniforms.buffer.buffer,
        &texture,
        teardown,
    )?;

    let context = FrameContext::new(device, command_pool, descriptor_set, uniforms, teardown)?;
    let resources = DrawResources {
        render_pass,
        framebuffers,
        extent: swapchain.extent,
        clear_values: layout.clear_values(),
        pipeline,
        vertex_buffer,
        index_buffer,
        index_count: mesh.indices.len() as u32,
        instance_count: INSTANCE_COUNT as u32,
    };

    let backend = VulkanFrameBackend::new(
        device.clone(),
        swapchain_device.clone(),
        swapchain.handle,
        queues.graphics,
        queues.present,
        resources,
        context,
    );
    Ok(FrameExecutor::new(backend))
}

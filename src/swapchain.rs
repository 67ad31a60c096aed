//! Swapchain negotiation and creation.
//!
//! The swapchain is built once at startup; there is no recreation path.

use anyhow::Result;
use ash::vk;
use ash::Device;
use log::*;

use crate::device::QueueFamilyIndices;
use crate::memory::create_image_view;
use crate::teardown::TeardownStack;

/// Surface properties of one physical device.
#[derive(Clone, Debug)]
pub struct SwapchainSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapchainSupport {
    pub fn query(
        surface_instance: &ash::khr::surface::Instance,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<Self> {
        // SAFETY: `physical_device` and `surface` belong to the instance behind `surface_instance`.
        unsafe {
            Ok(Self {
                capabilities: surface_instance
                    .get_physical_device_surface_capabilities(physical_device, surface)?,
                formats: surface_instance
                    .get_physical_device_surface_formats(physical_device, surface)?,
                present_modes: surface_instance
                    .get_physical_device_surface_present_modes(physical_device, surface)?,
            })
        }
    }
}

/// Prefers B8G8R8A8_SRGB with sRGB non-linear colour space, else the first format.
///
/// `formats` must be non-empty; device selection rejects devices without formats.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    formats
        .iter()
        .copied()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .unwrap_or(formats[0])
}

/// Prefers MAILBOX, else FIFO which every implementation supports.
pub fn choose_present_mode(present_modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    present_modes
        .iter()
        .copied()
        .find(|m| *m == vk::PresentModeKHR::MAILBOX)
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// Uses the surface's current extent unless it is the `u32::MAX` sentinel, in which
/// case the framebuffer size is clamped to the surface limits.
pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    framebuffer_size: (u32, u32),
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    let (width, height) = framebuffer_size;
    vk::Extent2D {
        width: width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// One more than the minimum, capped by the maximum (0 means unbounded).
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count + 1;
    if capabilities.max_image_count != 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

/// CONCURRENT across both families when they differ, otherwise EXCLUSIVE.
pub fn choose_sharing_mode(indices: &QueueFamilyIndices) -> (vk::SharingMode, Vec<u32>) {
    if indices.is_shared() {
        (vk::SharingMode::EXCLUSIVE, Vec::new())
    } else {
        (
            vk::SharingMode::CONCURRENT,
            vec![indices.graphics, indices.present],
        )
    }
}

pub struct Swapchain {
    pub handle: vk::SwapchainKHR,
    /// Owned by the presentation engine; never destroyed individually.
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
}

impl Swapchain {
    pub fn new(
        device: &Device,
        swapchain_device: &ash::khr::swapchain::Device,
        surface: vk::SurfaceKHR,
        support: &SwapchainSupport,
        indices: &QueueFamilyIndices,
        framebuffer_size: (u32, u32),
        teardown: &mut TeardownStack,
    ) -> Result<Self> {
        let surface_format = choose_surface_format(&support.formats);
        let present_mode = choose_present_mode(&support.present_modes);
        let extent = choose_extent(&support.capabilities, framebuffer_size);
        let image_count = choose_image_count(&support.capabilities);
        let (sharing_mode, family_indices) = choose_sharing_mode(indices);

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(&family_indices)
            .pre_transform(support.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(vk::SwapchainKHR::null());

        // SAFETY: `surface` is live and `create_info` only borrows locals.
        let handle = unsafe { swapchain_device.create_swapchain(&create_info, None)? };
        teardown.push(handle);
        // SAFETY: `handle` was just created.
        let images = unsafe { swapchain_device.get_swapchain_images(handle)? };

        let mut image_views = Vec::with_capacity(images.len());
        for &image in &images {
            let view =
                create_image_view(device, image, surface_format.format, vk::ImageAspectFlags::COLOR)?;
            teardown.push(view);
            image_views.push(view);
        }

        info!(
            "Swapchain created ({}x{}, {:?}, {:?}, {} images).",
            extent.width,
            extent.height,
            surface_format.format,
            present_mode,
            images.len()
        );

        Ok(Self {
            handle,
            images,
            image_views,
            format: surface_format.format,
            extent,
            present_mode,
        })
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }
}

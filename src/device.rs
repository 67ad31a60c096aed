//! Instance creation, physical device selection and logical device creation.

use std::collections::HashSet;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;

use anyhow::{anyhow, Result};
use ash::vk;
use ash::{Device, Entry, Instance};
use log::*;
use winit::window::Window;

use crate::config::DEVICE_EXTENSIONS;
use crate::error::{RendererError, SuitabilityError};
use crate::swapchain::SwapchainSupport;
use crate::vk_window::get_required_instance_extensions;

//--------------------------------------------------------------------------------------------------
// Instance
//--------------------------------------------------------------------------------------------------

/// Creates a Vulkan 1.3 instance with the window-system extensions for `window`.
pub fn create_instance(window: &Window, entry: &Entry) -> Result<Instance> {
    let app_name = CString::new(crate::config::WINDOW_TITLE)?;
    let engine_name = CString::new("No Engine")?;

    let application_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 1, 0, 0))
        .engine_name(&engine_name)
        .engine_version(vk::make_api_version(0, 1, 0, 0))
        .api_version(vk::API_VERSION_1_3);

    // SAFETY: `entry` holds a loaded Vulkan library; the names are NUL-terminated.
    let available = unsafe { entry.enumerate_instance_extension_properties(None)? };
    let available = available
        .iter()
        .map(|e| unsafe { CStr::from_ptr(e.extension_name.as_ptr()) }.to_owned())
        .collect::<HashSet<_>>();

    let mut extension_ptrs: Vec<*const c_char> = get_required_instance_extensions(window)?
        .iter()
        .map(|e| e.as_ptr())
        .collect();

    let mut flags = vk::InstanceCreateFlags::empty();
    if available.contains(vk::KHR_PORTABILITY_ENUMERATION_NAME) {
        info!("Enabling portability enumeration.");
        extension_ptrs.push(vk::KHR_PORTABILITY_ENUMERATION_NAME.as_ptr());
        flags |= vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    }
    if available.contains(vk::KHR_GET_PHYSICAL_DEVICE_PROPERTIES2_NAME) {
        extension_ptrs.push(vk::KHR_GET_PHYSICAL_DEVICE_PROPERTIES2_NAME.as_ptr());
    }

    let create_info = vk::InstanceCreateInfo::default()
        .flags(flags)
        .application_info(&application_info)
        .enabled_extension_names(&extension_ptrs);

    // SAFETY: every pointer in `create_info` outlives the call.
    Ok(unsafe { entry.create_instance(&create_info, None)? })
}

//--------------------------------------------------------------------------------------------------
// Physical device
//--------------------------------------------------------------------------------------------------

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilyIndices {
    /// Picks the graphics and present families. A family that can do both is
    /// preferred; otherwise the first of each is used.
    pub fn select(families: &[vk::QueueFamilyProperties], present_support: &[bool]) -> Option<Self> {
        let supports_graphics =
            |i: usize| families[i].queue_flags.contains(vk::QueueFlags::GRAPHICS);
        let supports_present = |i: usize| present_support.get(i).copied().unwrap_or(false);

        if let Some(both) = (0..families.len()).find(|&i| supports_graphics(i) && supports_present(i)) {
            return Some(Self {
                graphics: both as u32,
                present: both as u32,
            });
        }

        let graphics = (0..families.len()).find(|&i| supports_graphics(i))?;
        let present = (0..families.len()).find(|&i| supports_present(i))?;
        Some(Self {
            graphics: graphics as u32,
            present: present as u32,
        })
    }

    pub fn is_shared(&self) -> bool {
        self.graphics == self.present
    }

    /// The distinct family indices, graphics first.
    pub fn unique(&self) -> Vec<u32> {
        if self.is_shared() {
            vec![self.graphics]
        } else {
            vec![self.graphics, self.present]
        }
    }
}

/// Required names absent from `available`, in the order they were required.
pub fn missing_extensions<'a>(
    required: &[&'a CStr],
    available: &HashSet<&CStr>,
) -> Vec<&'a CStr> {
    required
        .iter()
        .copied()
        .filter(|name| !available.contains(name))
        .collect()
}

/// Everything queried once about the chosen GPU.
#[derive(Clone, Debug)]
pub struct DeviceCapabilities {
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub queue_families: Vec<vk::QueueFamilyProperties>,
    pub swapchain_support: SwapchainSupport,
    pub supports_anisotropy: bool,
    pub has_portability_subset: bool,
}

#[derive(Clone, Debug)]
pub struct SelectedDevice {
    pub physical_device: vk::PhysicalDevice,
    pub name: String,
    pub queue_families: QueueFamilyIndices,
    pub capabilities: DeviceCapabilities,
}

impl SelectedDevice {
    /// Anisotropy limit for samplers, if the feature is available.
    pub fn max_anisotropy(&self) -> Option<f32> {
        self.capabilities
            .supports_anisotropy
            .then(|| self.capabilities.properties.limits.max_sampler_anisotropy.min(16.0))
    }
}

/// Returns the first physical device that can render and present to `surface`.
pub fn pick_physical_device(
    instance: &Instance,
    surface_instance: &ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
) -> Result<SelectedDevice> {
    // SAFETY: `instance` is live.
    let physical_devices = unsafe { instance.enumerate_physical_devices()? };
    if physical_devices.is_empty() {
        warn!("No GPUs with Vulkan support were enumerated.");
    }

    for physical_device in physical_devices {
        // SAFETY: `physical_device` came from `instance`; the name is NUL-terminated.
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        match check_physical_device(instance, surface_instance, surface, physical_device, properties)
        {
            Ok((queue_families, capabilities)) => {
                info!(
                    "Selected physical device (`{}`), graphics family {}, present family {}.",
                    name, queue_families.graphics, queue_families.present
                );
                return Ok(SelectedDevice {
                    physical_device,
                    name,
                    queue_families,
                    capabilities,
                });
            }
            Err(error) => warn!("Skipping physical device (`{}`): {}", name, error),
        }
    }
    Err(anyhow!(RendererError::NoSuitableGpu))
}

fn check_physical_device(
    instance: &Instance,
    surface_instance: &ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
) -> Result<(QueueFamilyIndices, DeviceCapabilities)> {
    // SAFETY: `physical_device` came from `instance`; extension names are NUL-terminated.
    let extension_properties =
        unsafe { instance.enumerate_device_extension_properties(physical_device)? };
    let available = extension_properties
        .iter()
        .map(|e| unsafe { CStr::from_ptr(e.extension_name.as_ptr()) })
        .collect::<HashSet<_>>();

    let missing = missing_extensions(DEVICE_EXTENSIONS, &available);
    if !missing.is_empty() {
        return Err(anyhow!(SuitabilityError::Dynamic(format!(
            "Missing required device extensions: {:?}",
            missing
        ))));
    }

    let swapchain_support = SwapchainSupport::query(surface_instance, physical_device, surface)?;
    if swapchain_support.formats.is_empty() || swapchain_support.present_modes.is_empty() {
        return Err(anyhow!(SuitabilityError::Static(
            "Insufficient swapchain support."
        )));
    }

    // SAFETY: `physical_device` came from `instance`.
    let queue_families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
    let present_support = (0..queue_families.len() as u32)
        .map(|index| {
            // SAFETY: `index` is a valid queue family index for `physical_device`.
            unsafe {
                surface_instance.get_physical_device_surface_support(physical_device, index, surface)
            }
        })
        .collect::<Result<Vec<_>, _>>()?;
    let indices = QueueFamilyIndices::select(&queue_families, &present_support).ok_or_else(|| {
        anyhow!(SuitabilityError::Static("Missing required queue families."))
    })?;

    // SAFETY: `physical_device` came from `instance`.
    let (memory_properties, features) = unsafe {
        (
            instance.get_physical_device_memory_properties(physical_device),
            instance.get_physical_device_features(physical_device),
        )
    };

    Ok((
        indices,
        DeviceCapabilities {
            properties,
            memory_properties,
            queue_families,
            swapchain_support,
            supports_anisotropy: features.sampler_anisotropy == vk::TRUE,
            has_portability_subset: available.contains(vk::KHR_PORTABILITY_SUBSET_NAME),
        },
    ))
}

//--------------------------------------------------------------------------------------------------
// Logical device
//--------------------------------------------------------------------------------------------------

#[derive(Copy, Clone, Debug)]
pub struct Queues {
    pub graphics: vk::Queue,
    pub present: vk::Queue,
}

/// Creates the logical device with one queue per distinct family.
pub fn create_logical_device(instance: &Instance, selected: &SelectedDevice) -> Result<(Device, Queues)> {
    let indices = selected.queue_families;
    let queue_priorities = &[1.0];
    let queue_infos = indices
        .unique()
        .into_iter()
        .map(|family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(queue_priorities)
        })
        .collect::<Vec<_>>();

    let mut extension_ptrs: Vec<*const c_char> =
        DEVICE_EXTENSIONS.iter().map(|ext| ext.as_ptr()).collect();
    if selected.capabilities.has_portability_subset {
        extension_ptrs.push(vk::KHR_PORTABILITY_SUBSET_NAME.as_ptr());
    }

    let features = vk::PhysicalDeviceFeatures::default()
        .sampler_anisotropy(selected.capabilities.supports_anisotropy);

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_infos)
        .enabled_extension_names(&extension_ptrs)
        .enabled_features(&features);

    // SAFETY: every pointer in `create_info` outlives the call.
    let device = unsafe { instance.create_device(selected.physical_device, &create_info, None)? };

    // SAFETY: one queue was requested for each of these families.
    let queues = unsafe {
        Queues {
            graphics: device.get_device_queue(indices.graphics, 0),
            present: device.get_device_queue(indices.present, 0),
        }
    };
    Ok((device, queues))
}

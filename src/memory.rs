//! Device memory selection and whole-allocation buffers/images.
//!
//! Every resource gets its own `vk::DeviceMemory`; there is no sub-allocation.

use anyhow::{anyhow, Result};
use ash::vk;
use ash::Device;

use crate::error::RendererError;

/// Returns the lowest memory type index allowed by `type_filter` whose property
/// flags contain all of `properties`.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> Result<u32> {
    (0..memory_properties.memory_type_count)
        .find(|&i| {
            let allowed = (type_filter & (1 << i)) != 0;
            let flags = memory_properties.memory_types[i as usize].property_flags;
            allowed && flags.contains(properties)
        })
        .ok_or_else(|| {
            anyhow!(RendererError::NoSuitableMemoryType {
                type_filter,
                properties,
            })
        })
}

/// A buffer bound to its own allocation.
#[derive(Copy, Clone, Debug)]
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
}

impl GpuBuffer {
    /// Creates a buffer, allocates memory with `properties` for it and binds it.
    pub fn new(
        device: &Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        // SAFETY: `device` is a live logical device and `buffer_info` is fully initialised.
        let buffer = unsafe { device.create_buffer(&buffer_info, None)? };
        // SAFETY: `buffer` was just created from `device`.
        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let memory = match allocate(device, memory_properties, requirements, properties) {
            Ok(memory) => memory,
            Err(e) => {
                // SAFETY: `buffer` has no memory bound and is not referenced anywhere else.
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };
        bind_or_release(
            // SAFETY: `memory` was allocated for `buffer`'s requirements; binding happens once.
            || unsafe { device.bind_buffer_memory(buffer, memory, 0) },
            // SAFETY: the bind failed, so nothing else references `buffer` or `memory`.
            || unsafe {
                device.destroy_buffer(buffer, None);
                device.free_memory(memory, None);
            },
        )?;

        Ok(Self {
            buffer,
            memory,
            size,
            usage,
        })
    }

    /// Copies `bytes` to the start of this buffer through a temporary mapping.
    ///
    /// The buffer must live in host-visible, host-coherent memory.
    pub fn write_bytes(&self, device: &Device, bytes: &[u8]) -> Result<()> {
        if bytes.len() as vk::DeviceSize > self.size {
            return Err(anyhow!(
                "Write of {} bytes exceeds buffer size {}.",
                bytes.len(),
                self.size
            ));
        }
        // SAFETY: the memory is host visible, not currently mapped and at least
        // `bytes.len()` long; coherence makes an explicit flush unnecessary.
        unsafe {
            let ptr = device.map_memory(
                self.memory,
                0,
                self.size,
                vk::MemoryMapFlags::empty(),
            )?;
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.cast::<u8>(), bytes.len());
            device.unmap_memory(self.memory);
        }
        Ok(())
    }

    /// Destroys the buffer and frees its memory.
    ///
    /// # Safety
    ///
    /// No pending GPU work may reference the buffer.
    pub unsafe fn destroy(self, device: &Device) {
        unsafe {
            device.destroy_buffer(self.buffer, None);
            device.free_memory(self.memory, None);
        }
    }
}

/// An image bound to its own allocation, with its layout tracked on the host.
#[derive(Copy, Clone, Debug)]
pub struct GpuImage {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub layout: vk::ImageLayout,
}

/// Parameters for a single-mip 2D image.
#[derive(Copy, Clone, Debug)]
pub struct ImageDesc {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub samples: vk::SampleCountFlags,
    pub usage: vk::ImageUsageFlags,
}

impl GpuImage {
    pub fn new(
        device: &Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        desc: ImageDesc,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(desc.format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .samples(desc.samples);

        // SAFETY: `device` is live and `image_info` is fully initialised.
        let image = unsafe { device.create_image(&image_info, None)? };
        // SAFETY: `image` was just created from `device`.
        let requirements = unsafe { device.get_image_memory_requirements(image) };

        let memory = match allocate(device, memory_properties, requirements, properties) {
            Ok(memory) => memory,
            Err(e) => {
                // SAFETY: `image` has no memory bound and is not referenced anywhere else.
                unsafe { device.destroy_image(image, None) };
                return Err(e);
            }
        };
        bind_or_release(
            // SAFETY: `memory` satisfies `image`'s requirements; binding happens once.
            || unsafe { device.bind_image_memory(image, memory, 0) },
            // SAFETY: the bind failed, so nothing else references `image` or `memory`.
            || unsafe {
                device.destroy_image(image, None);
                device.free_memory(memory, None);
            },
        )?;

        Ok(Self {
            image,
            memory,
            format: desc.format,
            extent: desc.extent,
            layout: vk::ImageLayout::UNDEFINED,
        })
    }

    /// # Safety
    ///
    /// No pending GPU work or live view may reference the image.
    pub unsafe fn destroy(self, device: &Device) {
        unsafe {
            device.destroy_image(self.image, None);
            device.free_memory(self.memory, None);
        }
    }
}

fn allocate(
    device: &Device,
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    requirements: vk::MemoryRequirements,
    properties: vk::MemoryPropertyFlags,
) -> Result<vk::DeviceMemory> {
    let memory_type_index =
        find_memory_type(memory_properties, requirements.memory_type_bits, properties)?;
    let alloc_info = vk::MemoryAllocateInfo::default()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type_index);
    // SAFETY: `alloc_info` names a memory type that exists on this device.
    Ok(unsafe { device.allocate_memory(&alloc_info, None)? })
}

/// Runs `bind`; on failure runs `release` so the fresh object and its allocation do not leak.
fn bind_or_release(
    bind: impl FnOnce() -> Result<(), vk::Result>,
    release: impl FnOnce(),
) -> Result<()> {
    bind().map_err(|e| {
        release();
        anyhow::Error::new(e).context("Failed to bind device memory")
    })
}

/// Creates a single-mip 2D view over `image`.
pub fn create_image_view(
    device: &Device,
    image: vk::Image,
    format: vk::Format,
    aspects: vk::ImageAspectFlags,
) -> Result<vk::ImageView> {
    let subresource_range = vk::ImageSubresourceRange::default()
        .aspect_mask(aspects)
        .base_mip_level(0)
        .level_count(1)
        .base_array_layer(0)
        .layer_count(1);

    let create_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .subresource_range(subresource_range);

    // SAFETY: `image` is a live image created with a compatible format.
    unsafe { Ok(device.create_image_view(&create_info, None)?) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_table(flags: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut properties = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: flags.len() as u32,
            ..Default::default()
        };
        for (i, &property_flags) in flags.iter().enumerate() {
            properties.memory_types[i] = vk::MemoryType {
                property_flags,
                heap_index: 0,
            };
        }
        properties
    }

    const HOST: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
        vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw()
            | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
    );

    #[test]
    fn picks_lowest_matching_index() {
        let table = memory_table(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            HOST,
            HOST | vk::MemoryPropertyFlags::HOST_CACHED,
        ]);
        assert_eq!(find_memory_type(&table, 0b111, HOST).unwrap(), 1);
        assert_eq!(
            find_memory_type(&table, 0b111, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap(),
            0
        );
    }

    #[test]
    fn respects_type_filter() {
        let table = memory_table(&[HOST, HOST, HOST]);
        assert_eq!(find_memory_type(&table, 0b100, HOST).unwrap(), 2);
        assert_eq!(find_memory_type(&table, 0b110, HOST).unwrap(), 1);
    }

    #[test]
    fn superset_of_requested_flags_matches() {
        let table = memory_table(&[
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            HOST | vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ]);
        assert_eq!(find_memory_type(&table, u32::MAX, HOST).unwrap(), 1);
    }

    #[test]
    fn fails_when_nothing_qualifies() {
        let table = memory_table(&[vk::MemoryPropertyFlags::DEVICE_LOCAL, HOST]);
        let err = find_memory_type(&table, 0b01, HOST).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RendererError>(),
            Some(RendererError::NoSuitableMemoryType {
                type_filter: 0b01,
                ..
            })
        ));
        assert!(find_memory_type(&table, 0, vk::MemoryPropertyFlags::empty()).is_err());
    }

    #[test]
    fn ignores_entries_past_type_count() {
        let mut table = memory_table(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        table.memory_types[1].property_flags = HOST;
        assert!(find_memory_type(&table, 0b11, HOST).is_err());
    }

    #[test]
    fn failed_bind_releases_object_and_memory() {
        let mut released = 0;
        let result = bind_or_release(
            || Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            || released += 1,
        );
        assert_eq!(
            result.unwrap_err().downcast_ref::<vk::Result>(),
            Some(&vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
        );
        assert_eq!(released, 1);
    }

    #[test]
    fn successful_bind_keeps_the_allocation() {
        let mut released = 0;
        bind_or_release(|| Ok(()), || released += 1).unwrap();
        assert_eq!(released, 0);
    }
}

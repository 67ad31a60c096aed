//! Explicit destruction ordering for device-owned objects.
//!
//! Every object the renderer creates is pushed here right after creation and
//! destroyed by [`TeardownStack::flush`] in exact reverse order, so a resource
//! never outlives something that depends on it.

use ash::vk;
use ash::Device;
use log::*;

use crate::memory::{GpuBuffer, GpuImage};

/// A device-owned handle awaiting destruction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OwnedHandle {
    Buffer(vk::Buffer),
    Memory(vk::DeviceMemory),
    Image(vk::Image),
    ImageView(vk::ImageView),
    Sampler(vk::Sampler),
    Swapchain(vk::SwapchainKHR),
    RenderPass(vk::RenderPass),
    DescriptorSetLayout(vk::DescriptorSetLayout),
    PipelineLayout(vk::PipelineLayout),
    Pipeline(vk::Pipeline),
    Framebuffer(vk::Framebuffer),
    CommandPool(vk::CommandPool),
    DescriptorPool(vk::DescriptorPool),
    Semaphore(vk::Semaphore),
    Fence(vk::Fence),
}

macro_rules! owned_handle_from {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        $(impl From<$ty> for OwnedHandle {
            fn from(handle: $ty) -> Self {
                OwnedHandle::$variant(handle)
            }
        })*
    };
}

owned_handle_from! {
    Buffer => vk::Buffer,
    Memory => vk::DeviceMemory,
    Image => vk::Image,
    ImageView => vk::ImageView,
    Sampler => vk::Sampler,
    Swapchain => vk::SwapchainKHR,
    RenderPass => vk::RenderPass,
    DescriptorSetLayout => vk::DescriptorSetLayout,
    PipelineLayout => vk::PipelineLayout,
    Pipeline => vk::Pipeline,
    Framebuffer => vk::Framebuffer,
    CommandPool => vk::CommandPool,
    DescriptorPool => vk::DescriptorPool,
    Semaphore => vk::Semaphore,
    Fence => vk::Fence,
}

#[derive(Debug, Default)]
pub struct TeardownStack {
    entries: Vec<OwnedHandle>,
}

impl TeardownStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, handle: impl Into<OwnedHandle>) {
        self.entries.push(handle.into());
    }

    /// Registers a buffer and its allocation. The memory is freed before the buffer is destroyed.
    pub fn push_buffer(&mut self, buffer: &GpuBuffer) {
        self.push(buffer.buffer);
        self.push(buffer.memory);
    }

    pub fn push_image(&mut self, image: &GpuImage) {
        self.push(image.image);
        self.push(image.memory);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes every entry, newest first.
    pub fn drain_reverse(&mut self) -> impl Iterator<Item = OwnedHandle> + '_ {
        self.entries.drain(..).rev()
    }

    /// Destroys every registered handle, newest first.
    ///
    /// # Safety
    ///
    /// The device must be idle and none of the handles may be used afterwards.
    pub unsafe fn flush(&mut self, device: &Device, swapchain_device: &ash::khr::swapchain::Device) {
        let count = self.entries.len();
        for handle in self.drain_reverse() {
            trace!("Destroying {:?}", handle);
            unsafe {
                match handle {
                    OwnedHandle::Buffer(h) => device.destroy_buffer(h, None),
                    OwnedHandle::Memory(h) => device.free_memory(h, None),
                    OwnedHandle::Image(h) => device.destroy_image(h, None),
                    OwnedHandle::ImageView(h) => device.destroy_image_view(h, None),
                    OwnedHandle::Sampler(h) => device.destroy_sampler(h, None),
                    OwnedHandle::Swapchain(h) => swapchain_device.destroy_swapchain(h, None),
                    OwnedHandle::RenderPass(h) => device.destroy_render_pass(h, None),
                    OwnedHandle::DescriptorSetLayout(h) => {
                        device.destroy_descriptor_set_layout(h, None)
                    }
                    OwnedHandle::PipelineLayout(h) => device.destroy_pipeline_layout(h, None),
                    OwnedHandle::Pipeline(h) => device.destroy_pipeline(h, None),
                    OwnedHandle::Framebuffer(h) => device.destroy_framebuffer(h, None),
                    OwnedHandle::CommandPool(h) => device.destroy_command_pool(h, None),
                    OwnedHandle::DescriptorPool(h) => device.destroy_descriptor_pool(h, None),
                    OwnedHandle::Semaphore(h) => device.destroy_semaphore(h, None),
                    OwnedHandle::Fence(h) => device.destroy_fence(h, None),
                }
            }
        }
        debug!("Destroyed {} device objects.", count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn drains_in_reverse_creation_order() {
        let mut stack = TeardownStack::new();
        stack.push(vk::Image::from_raw(1));
        stack.push(vk::DeviceMemory::from_raw(2));
        stack.push(vk::ImageView::from_raw(3));
        stack.push(vk::Framebuffer::from_raw(4));
        assert_eq!(stack.len(), 4);

        let order: Vec<_> = stack.drain_reverse().collect();
        assert_eq!(
            order,
            vec![
                OwnedHandle::Framebuffer(vk::Framebuffer::from_raw(4)),
                OwnedHandle::ImageView(vk::ImageView::from_raw(3)),
                OwnedHandle::Memory(vk::DeviceMemory::from_raw(2)),
                OwnedHandle::Image(vk::Image::from_raw(1)),
            ]
        );
        assert!(stack.is_empty());
    }

    #[test]
    fn image_memory_is_released_before_the_image() {
        let image = GpuImage {
            image: vk::Image::from_raw(10),
            memory: vk::DeviceMemory::from_raw(11),
            format: vk::Format::D32_SFLOAT,
            extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            layout: vk::ImageLayout::UNDEFINED,
        };
        let mut stack = TeardownStack::new();
        stack.push_image(&image);
        stack.push(vk::ImageView::from_raw(12));

        let order: Vec<_> = stack.drain_reverse().collect();
        assert_eq!(
            order,
            vec![
                OwnedHandle::ImageView(vk::ImageView::from_raw(12)),
                OwnedHandle::Memory(vk::DeviceMemory::from_raw(11)),
                OwnedHandle::Image(vk::Image::from_raw(10)),
            ]
        );
    }

    #[test]
    fn conversion_keeps_the_handle_kind() {
        assert_eq!(
            OwnedHandle::from(vk::Fence::from_raw(7)),
            OwnedHandle::Fence(vk::Fence::from_raw(7))
        );
        assert_ne!(
            OwnedHandle::from(vk::Semaphore::from_raw(7)),
            OwnedHandle::from(vk::Fence::from_raw(7))
        );
    }
}

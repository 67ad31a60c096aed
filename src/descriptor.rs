//! Descriptor set layout, pool and the single descriptor set.
//!
//! Binding 0 is the uniform block (vertex stage), binding 1 the texture
//! sampler (fragment stage). The set is written once and never updated.

use std::mem::size_of;

use anyhow::Result;
use ash::vk;
use ash::Device;

use crate::teardown::TeardownStack;
use crate::uniform::UniformBufferObject;
use crate::upload::Texture;

pub const UNIFORM_BINDING: u32 = 0;
pub const SAMPLER_BINDING: u32 = 1;

pub fn layout_bindings() -> [vk::DescriptorSetLayoutBinding<'static>; 2] {
    [
        vk::DescriptorSetLayoutBinding::default()
            .binding(UNIFORM_BINDING)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::VERTEX),
        vk::DescriptorSetLayoutBinding::default()
            .binding(SAMPLER_BINDING)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT),
    ]
}

/// Exactly one descriptor of each kind the layout uses.
pub fn pool_sizes() -> [vk::DescriptorPoolSize; 2] {
    [
        vk::DescriptorPoolSize::default()
            .ty(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1),
        vk::DescriptorPoolSize::default()
            .ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(1),
    ]
}

pub fn create_descriptor_set_layout(
    device: &Device,
    teardown: &mut TeardownStack,
) -> Result<vk::DescriptorSetLayout> {
    let bindings = layout_bindings();
    let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
    // SAFETY: `create_info` borrows a local array that outlives the call.
    let layout = unsafe { device.create_descriptor_set_layout(&create_info, None)? };
    teardown.push(layout);
    Ok(layout)
}

/// Allocates the set from a pool sized for it and binds the uniform buffer and texture.
pub fn create_descriptor_set(
    device: &Device,
    layout: vk::DescriptorSetLayout,
    uniform_buffer: vk::Buffer,
    texture: &Texture,
    teardown: &mut TeardownStack,
) -> Result<vk::DescriptorSet> {
    let sizes = pool_sizes();
    let pool_info = vk::DescriptorPoolCreateInfo::default()
        .pool_sizes(&sizes)
        .max_sets(1);
    // SAFETY: `pool_info` borrows a local array that outlives the call.
    let pool = unsafe { device.create_descriptor_pool(&pool_info, None)? };
    teardown.push(pool);

    let layouts = [layout];
    let alloc_info = vk::DescriptorSetAllocateInfo::default()
        .descriptor_pool(pool)
        .set_layouts(&layouts);
    // SAFETY: the pool has room for exactly this set; it is freed with the pool.
    let set = unsafe { device.allocate_descriptor_sets(&alloc_info)?[0] };

    let buffer_info = vk::DescriptorBufferInfo::default()
        .buffer(uniform_buffer)
        .offset(0)
        .range(size_of::<UniformBufferObject>() as vk::DeviceSize);
    let image_info = vk::DescriptorImageInfo::default()
        .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
        .image_view(texture.view)
        .sampler(texture.sampler);

    let writes = [
        vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(UNIFORM_BINDING)
            .dst_array_element(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .buffer_info(std::slice::from_ref(&buffer_info)),
        vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(SAMPLER_BINDING)
            .dst_array_element(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(std::slice::from_ref(&image_info)),
    ];
    // SAFETY: the buffer, view and sampler are live and the set is not in use.
    unsafe { device.update_descriptor_sets(&writes, &[]) };
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_holds_one_descriptor_per_binding() {
        let sizes = pool_sizes();
        for binding in layout_bindings() {
            let size = sizes
                .iter()
                .find(|s| s.ty == binding.descriptor_type)
                .unwrap();
            assert_eq!(size.descriptor_count, binding.descriptor_count);
        }
        assert_eq!(sizes.iter().map(|s| s.descriptor_count).sum::<u32>(), 2);
    }

    #[test]
    fn bindings_target_the_expected_stages() {
        let [uniform, sampler] = layout_bindings();
        assert_eq!(uniform.binding, UNIFORM_BINDING);
        assert_eq!(uniform.descriptor_type, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(uniform.stage_flags, vk::ShaderStageFlags::VERTEX);
        assert_eq!(sampler.binding, SAMPLER_BINDING);
        assert_eq!(sampler.descriptor_type, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
        assert_eq!(sampler.stage_flags, vk::ShaderStageFlags::FRAGMENT);
    }
}

//! Per-frame transforms and the persistently mapped uniform block.

use std::mem::size_of;

use anyhow::Result;
use ash::vk;
use ash::Device;
use bytemuck::{Pod, Zeroable};
use nalgebra::Unit;

use crate::config::{
    CAMERA_EYE, CAMERA_TARGET, FOV_Y_DEGREES, INSTANCE_COUNT, INSTANCE_SPACING,
    ROTATION_DEGREES_PER_SECOND, Z_FAR, Z_NEAR,
};
use crate::memory::GpuBuffer;
use crate::model::Vec3;
use crate::teardown::TeardownStack;

pub type Mat4 = nalgebra::Matrix4<f32>;
type Point3 = nalgebra::Point3<f32>;

/// Layout shared with the vertex shader's uniform block at binding 0.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct UniformBufferObject {
    pub models: [Mat4; INSTANCE_COUNT],
    pub view: Mat4,
    pub proj: Mat4,
}

/// Maps OpenGL clip depth `[-w, w]` onto Vulkan's `[0, w]`.
fn depth_correction() -> Mat4 {
    Mat4::new(
        1.0, 0.0, 0.0, 0.0, //
        0.0, 1.0, 0.0, 0.0, //
        0.0, 0.0, 0.5, 0.5, //
        0.0, 0.0, 0.0, 1.0,
    )
}

/// Right-handed perspective with Vulkan's downward Y and `[0, 1]` depth.
pub fn projection(extent: vk::Extent2D) -> Mat4 {
    let aspect = extent.width as f32 / extent.height.max(1) as f32;
    let mut proj = depth_correction()
        * Mat4::new_perspective(aspect, FOV_Y_DEGREES.to_radians(), Z_NEAR, Z_FAR);
    proj[(1, 1)] *= -1.0;
    proj
}

pub fn view() -> Mat4 {
    let [ex, ey, ez] = CAMERA_EYE;
    let [tx, ty, tz] = CAMERA_TARGET;
    Mat4::look_at_rh(&Point3::new(ex, ey, ez), &Point3::new(tx, ty, tz), &Vec3::z())
}

/// Instance `index` sits `index * INSTANCE_SPACING` along Y and spins about +Z.
pub fn instance_model(index: usize, seconds: f32) -> Mat4 {
    let translation = Mat4::new_translation(&Vec3::new(0.0, index as f32 * INSTANCE_SPACING, 0.0));
    let angle = (seconds * ROTATION_DEGREES_PER_SECOND).to_radians();
    let rotation = Mat4::from_axis_angle(&Unit::new_normalize(Vec3::z()), angle);
    translation * rotation
}

pub fn build_uniforms(seconds: f32, extent: vk::Extent2D) -> UniformBufferObject {
    UniformBufferObject {
        models: std::array::from_fn(|i| instance_model(i, seconds)),
        view: view(),
        proj: projection(extent),
    }
}

/// Host-visible uniform buffer that stays mapped for its whole lifetime.
pub struct UniformBlock {
    pub buffer: GpuBuffer,
    mapped: *mut UniformBufferObject,
}

impl UniformBlock {
    pub fn new(
        device: &Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        teardown: &mut TeardownStack,
    ) -> Result<Self> {
        let buffer = GpuBuffer::new(
            device,
            memory_properties,
            size_of::<UniformBufferObject>() as vk::DeviceSize,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        teardown.push_buffer(&buffer);

        // SAFETY: the memory is host visible and never mapped elsewhere; freeing
        // it during teardown implicitly unmaps it.
        let mapped = unsafe {
            device.map_memory(buffer.memory, 0, buffer.size, vk::MemoryMapFlags::empty())?
        };

        Ok(Self {
            buffer,
            mapped: mapped.cast(),
        })
    }

    /// Overwrites the block. The caller must ensure no submitted frame still reads it.
    pub fn write(&mut self, ubo: &UniformBufferObject) {
        // SAFETY: `mapped` points at coherent memory sized for one `UniformBufferObject`.
        unsafe { self.mapped.write_unaligned(*ubo) };
    }
}

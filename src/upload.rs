//! Staging-buffer uploads into device-local memory.
//!
//! Every GPU-side step goes through [`run_one_shot_commands`], which submits a
//! transient command buffer and waits for the queue to drain before returning.
//! Uploads are therefore strictly serialized and never overlap frame rendering.

use std::path::Path;

use anyhow::{anyhow, Result};
use ash::vk;
use ash::Device;
use bytemuck::Pod;
use log::*;

use crate::error::RendererError;
use crate::memory::{create_image_view, GpuBuffer, GpuImage, ImageDesc};

const STAGING_PROPERTIES: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
    vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw()
        | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
);

/// What an upload needs from the device: where to allocate and where to submit.
#[derive(Copy, Clone)]
pub struct UploadContext<'a> {
    pub device: &'a Device,
    pub memory_properties: &'a vk::PhysicalDeviceMemoryProperties,
    pub queue: vk::Queue,
    pub command_pool: vk::CommandPool,
}

/// Allocates a transient command buffer, lets `record` fill it, submits it and
/// blocks until the queue is idle. The command buffer is freed on every path.
pub fn run_one_shot_commands<F>(ctx: &UploadContext, record: F) -> Result<()>
where
    F: FnOnce(&Device, vk::CommandBuffer),
{
    let alloc_info = vk::CommandBufferAllocateInfo::default()
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_pool(ctx.command_pool)
        .command_buffer_count(1);

    // SAFETY: `command_pool` belongs to `device`.
    let command_buffer = unsafe { ctx.device.allocate_command_buffers(&alloc_info)?[0] };

    let result = submit_and_wait(ctx, command_buffer, record);

    // SAFETY: after `submit_and_wait` returns the queue is idle or the buffer was never submitted.
    unsafe {
        ctx.device
            .free_command_buffers(ctx.command_pool, &[command_buffer]);
    }
    result
}

fn submit_and_wait<F>(ctx: &UploadContext, command_buffer: vk::CommandBuffer, record: F) -> Result<()>
where
    F: FnOnce(&Device, vk::CommandBuffer),
{
    let begin_info =
        vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

    // SAFETY: `command_buffer` was freshly allocated and is in the initial state.
    unsafe { ctx.device.begin_command_buffer(command_buffer, &begin_info)? };
    record(ctx.device, command_buffer);
    // SAFETY: recording started above.
    unsafe { ctx.device.end_command_buffer(command_buffer)? };

    let submit_info =
        vk::SubmitInfo::default().command_buffers(std::slice::from_ref(&command_buffer));
    // SAFETY: the command buffer is executable; `queue_wait_idle` keeps it alive until done.
    unsafe {
        ctx.device
            .queue_submit(ctx.queue, &[submit_info], vk::Fence::null())?;
        ctx.device.queue_wait_idle(ctx.queue)?;
    }
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Layout transitions
//--------------------------------------------------------------------------------------------------

/// Access masks and pipeline stages for one supported image layout change.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LayoutTransition {
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

impl LayoutTransition {
    pub fn between(old_layout: vk::ImageLayout, new_layout: vk::ImageLayout) -> Result<Self> {
        let (src_access, dst_access, src_stage, dst_stage) = match (old_layout, new_layout) {
            (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL) => (
                vk::AccessFlags::empty(),
                vk::AccessFlags::TRANSFER_WRITE,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
            ),
            (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL) => (
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::SHADER_READ,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
            ),
            _ => {
                return Err(anyhow!(RendererError::UnsupportedLayoutTransition {
                    old: old_layout,
                    new: new_layout,
                }));
            }
        };
        Ok(Self {
            old_layout,
            new_layout,
            src_access,
            dst_access,
            src_stage,
            dst_stage,
        })
    }

    /// Barrier over the single colour mip/layer of `image`.
    pub fn barrier(&self, image: vk::Image) -> vk::ImageMemoryBarrier<'static> {
        let subresource = vk::ImageSubresourceRange::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .base_mip_level(0)
            .level_count(1)
            .base_array_layer(0)
            .layer_count(1);

        vk::ImageMemoryBarrier::default()
            .old_layout(self.old_layout)
            .new_layout(self.new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(subresource)
            .src_access_mask(self.src_access)
            .dst_access_mask(self.dst_access)
    }
}

/// Moves `image` to `new_layout` and records the new layout on the host side.
pub fn transition_image_layout(
    ctx: &UploadContext,
    image: &mut GpuImage,
    new_layout: vk::ImageLayout,
) -> Result<()> {
    let transition = LayoutTransition::between(image.layout, new_layout)?;
    let barrier = transition.barrier(image.image);

    run_one_shot_commands(ctx, |device, command_buffer| {
        // SAFETY: `command_buffer` is recording and `barrier` names a live image.
        unsafe {
            device.cmd_pipeline_barrier(
                command_buffer,
                transition.src_stage,
                transition.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    })?;

    image.layout = new_layout;
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Copies
//--------------------------------------------------------------------------------------------------

/// Synchronous buffer-to-buffer copy of `size` bytes from offset 0.
pub fn copy_buffer(
    ctx: &UploadContext,
    src: vk::Buffer,
    dst: vk::Buffer,
    size: vk::DeviceSize,
) -> Result<()> {
    let region = vk::BufferCopy::default().size(size);
    run_one_shot_commands(ctx, |device, command_buffer| {
        // SAFETY: both buffers are live and at least `size` bytes long.
        unsafe { device.cmd_copy_buffer(command_buffer, src, dst, &[region]) };
    })
}

/// Copies tightly packed texels from `src` into the whole of `image`.
pub fn copy_buffer_to_image(ctx: &UploadContext, src: vk::Buffer, image: &GpuImage) -> Result<()> {
    if image.layout != vk::ImageLayout::TRANSFER_DST_OPTIMAL {
        return Err(anyhow!(
            "Buffer-to-image copy requires TRANSFER_DST_OPTIMAL, image is in {:?}.",
            image.layout
        ));
    }

    let region = vk::BufferImageCopy::default()
        .buffer_offset(0)
        .buffer_row_length(0)
        .buffer_image_height(0)
        .image_subresource(
            vk::ImageSubresourceLayers::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .mip_level(0)
                .base_array_layer(0)
                .layer_count(1),
        )
        .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
        .image_extent(vk::Extent3D {
            width: image.extent.width,
            height: image.extent.height,
            depth: 1,
        });

    let dst = image.image;
    run_one_shot_commands(ctx, |device, command_buffer| {
        // SAFETY: `dst` is in TRANSFER_DST_OPTIMAL and `src` holds the full extent.
        unsafe {
            device.cmd_copy_buffer_to_image(
                command_buffer,
                src,
                dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }
    })
}

//--------------------------------------------------------------------------------------------------
// Uploads
//--------------------------------------------------------------------------------------------------

fn create_staging_buffer(ctx: &UploadContext, bytes: &[u8]) -> Result<GpuBuffer> {
    if bytes.is_empty() {
        return Err(anyhow!("Cannot upload an empty byte range."));
    }
    let staging = GpuBuffer::new(
        ctx.device,
        ctx.memory_properties,
        bytes.len() as vk::DeviceSize,
        vk::BufferUsageFlags::TRANSFER_SRC,
        STAGING_PROPERTIES,
    )?;
    if let Err(e) = staging.write_bytes(ctx.device, bytes) {
        // SAFETY: nothing has been submitted that references `staging`.
        unsafe { staging.destroy(ctx.device) };
        return Err(e);
    }
    Ok(staging)
}

/// Uploads `bytes` into a new device-local buffer with `usage` (plus transfer-dst).
pub fn upload_buffer(
    ctx: &UploadContext,
    usage: vk::BufferUsageFlags,
    bytes: &[u8],
) -> Result<GpuBuffer> {
    let staging = create_staging_buffer(ctx, bytes)?;

    let result = GpuBuffer::new(
        ctx.device,
        ctx.memory_properties,
        staging.size,
        vk::BufferUsageFlags::TRANSFER_DST | usage,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )
    .and_then(|buffer| match copy_buffer(ctx, staging.buffer, buffer.buffer, staging.size) {
        Ok(()) => Ok(buffer),
        Err(e) => {
            // SAFETY: the failed copy left the queue idle or never submitted.
            unsafe { buffer.destroy(ctx.device) };
            Err(e)
        }
    });

    // SAFETY: every copy reading from `staging` has completed.
    unsafe { staging.destroy(ctx.device) };

    let buffer = result?;
    debug!("Uploaded {} bytes ({:?}).", buffer.size, buffer.usage);
    Ok(buffer)
}

/// Uploads a slice of plain-old-data values; see [`upload_buffer`].
pub fn upload_slice<T: Pod>(
    ctx: &UploadContext,
    usage: vk::BufferUsageFlags,
    data: &[T],
) -> Result<GpuBuffer> {
    upload_buffer(ctx, usage, bytemuck::cast_slice(data))
}

/// Uploads RGBA8 `pixels` into a new sampled image left in SHADER_READ_ONLY_OPTIMAL.
pub fn upload_image(
    ctx: &UploadContext,
    extent: vk::Extent2D,
    format: vk::Format,
    pixels: &[u8],
) -> Result<GpuImage> {
    let expected = extent.width as usize * extent.height as usize * 4;
    if pixels.len() != expected {
        return Err(anyhow!(
            "Pixel data is {} bytes, expected {} for a {}x{} RGBA8 image.",
            pixels.len(),
            expected,
            extent.width,
            extent.height
        ));
    }

    let staging = create_staging_buffer(ctx, pixels)?;

    let desc = ImageDesc {
        extent,
        format,
        samples: vk::SampleCountFlags::TYPE_1,
        usage: vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
    };
    let result = GpuImage::new(
        ctx.device,
        ctx.memory_properties,
        desc,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )
    .and_then(|mut image| {
        match fill_image(ctx, &staging, &mut image) {
            Ok(()) => Ok(image),
            Err(e) => {
                // SAFETY: the queue is idle after any failed one-shot submission.
                unsafe { image.destroy(ctx.device) };
                Err(e)
            }
        }
    });

    // SAFETY: the buffer-to-image copy has completed.
    unsafe { staging.destroy(ctx.device) };

    let image = result?;
    info!(
        "Uploaded {}x{} image ({:?}).",
        image.extent.width, image.extent.height, image.format
    );
    Ok(image)
}

fn fill_image(ctx: &UploadContext, staging: &GpuBuffer, image: &mut GpuImage) -> Result<()> {
    transition_image_layout(ctx, image, vk::ImageLayout::TRANSFER_DST_OPTIMAL)?;
    copy_buffer_to_image(ctx, staging.buffer, image)?;
    transition_image_layout(ctx, image, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
}

//--------------------------------------------------------------------------------------------------
// Textures
//--------------------------------------------------------------------------------------------------

/// Decoded RGBA8 pixels.
#[derive(Clone, Debug)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// Decodes an image file into RGBA8. A missing file is reported as
/// [`RendererError::MissingFile`].
pub fn decode_rgba8(path: &Path) -> Result<DecodedImage> {
    let img = image::open(path).map_err(|e| match e {
        image::ImageError::IoError(source) => anyhow!(RendererError::MissingFile {
            path: path.to_path_buf(),
            source,
        }),
        other => anyhow!("Failed to decode texture image '{}': {}", path.display(), other),
    })?;
    let rgba = img.into_rgba8();
    let (width, height) = rgba.dimensions();
    Ok(DecodedImage {
        width,
        height,
        pixels: rgba.into_raw(),
    })
}

/// A sampled texture: device-local image, its view and a sampler.
#[derive(Copy, Clone, Debug)]
pub struct Texture {
    pub image: GpuImage,
    pub view: vk::ImageView,
    pub sampler: vk::Sampler,
}

impl Texture {
    pub const FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

    /// Loads `path` and uploads it. `max_anisotropy` enables anisotropic filtering.
    pub fn from_file(ctx: &UploadContext, path: &Path, max_anisotropy: Option<f32>) -> Result<Self> {
        let decoded = decode_rgba8(path)?;
        let extent = vk::Extent2D {
            width: decoded.width,
            height: decoded.height,
        };
        let image = upload_image(ctx, extent, Self::FORMAT, &decoded.pixels)?;

        let view = match create_image_view(
            ctx.device,
            image.image,
            Self::FORMAT,
            vk::ImageAspectFlags::COLOR,
        ) {
            Ok(view) => view,
            Err(e) => {
                // SAFETY: nothing references the image yet.
                unsafe { image.destroy(ctx.device) };
                return Err(e);
            }
        };

        let create_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .anisotropy_enable(max_anisotropy.is_some())
            .max_anisotropy(max_anisotropy.unwrap_or(1.0))
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .unnormalized_coordinates(false)
            .compare_enable(false)
            .compare_op(vk::CompareOp::ALWAYS)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .mip_lod_bias(0.0)
            .min_lod(0.0)
            .max_lod(0.0);

        // SAFETY: `create_info` is fully initialised.
        let sampler = match unsafe { ctx.device.create_sampler(&create_info, None) } {
            Ok(sampler) => sampler,
            Err(e) => {
                // SAFETY: nothing references the view or image yet.
                unsafe {
                    ctx.device.destroy_image_view(view, None);
                    image.destroy(ctx.device);
                }
                return Err(e.into());
            }
        };

        Ok(Self {
            image,
            view,
            sampler,
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Readback (test harness)
//--------------------------------------------------------------------------------------------------

/// Copies `src` back into host memory. `src` needs TRANSFER_SRC usage.
#[cfg(test)]
pub fn read_back_buffer(ctx: &UploadContext, src: &GpuBuffer) -> Result<Vec<u8>> {
    let readback = GpuBuffer::new(
        ctx.device,
        ctx.memory_properties,
        src.size,
        vk::BufferUsageFlags::TRANSFER_DST,
        STAGING_PROPERTIES,
    )?;

    let result = copy_buffer(ctx, src.buffer, readback.buffer, src.size).and_then(|()| {
        let mut out = vec![0u8; src.size as usize];
        // SAFETY: the copy completed; the memory is host visible and coherent.
        unsafe {
            let ptr = ctx.device.map_memory(
                readback.memory,
                0,
                readback.size,
                vk::MemoryMapFlags::empty(),
            )?;
            std::ptr::copy_nonoverlapping(ptr.cast::<u8>(), out.as_mut_ptr(), out.len());
            ctx.device.unmap_memory(readback.memory);
        }
        Ok(out)
    });

    // SAFETY: the queue is idle.
    unsafe { readback.destroy(ctx.device) };
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undefined_to_transfer_dst_sets_only_destination_access() {
        let t = LayoutTransition::between(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
        .unwrap();
        assert_eq!(t.src_access, vk::AccessFlags::empty());
        assert_eq!(t.dst_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(t.src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(t.dst_stage, vk::PipelineStageFlags::TRANSFER);
    }

    #[test]
    fn transfer_dst_to_shader_read_sets_both_access_masks() {
        let t = LayoutTransition::between(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
        .unwrap();
        assert_eq!(t.src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(t.dst_access, vk::AccessFlags::SHADER_READ);
        assert_eq!(t.src_stage, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(t.dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
    }

    #[test]
    fn barrier_carries_the_transition() {
        use ash::vk::Handle;

        let image = vk::Image::from_raw(42);
        let t = LayoutTransition::between(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
        .unwrap();
        let barrier = t.barrier(image);
        assert_eq!(barrier.image, image);
        assert_eq!(barrier.old_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(barrier.new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(barrier.src_access_mask, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(barrier.dst_access_mask, vk::AccessFlags::SHADER_READ);
        assert_eq!(barrier.src_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
        assert_eq!(barrier.subresource_range.aspect_mask, vk::ImageAspectFlags::COLOR);
    }

    #[test]
    fn rejects_shader_read_to_transfer_dst() {
        for (old, new) in [
            (
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            ),
            (
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ),
        ] {
            let err = LayoutTransition::between(old, new).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<RendererError>(),
                Some(RendererError::UnsupportedLayoutTransition { .. })
            ));
        }
    }

    #[test]
    fn missing_texture_file_is_reported() {
        let err = decode_rgba8(Path::new("assets/textures/does-not-exist.png")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RendererError>(),
            Some(RendererError::MissingFile { .. })
        ));
    }

    #[test]
    fn decodes_bundled_texture() {
        let decoded = decode_rgba8(Path::new(crate::config::TEXTURE_PATH)).unwrap();
        assert!(decoded.width > 0 && decoded.height > 0);
        assert_eq!(
            decoded.pixels.len(),
            decoded.width as usize * decoded.height as usize * 4
        );
    }

    mod gpu {
        use super::*;
        use crate::gpu_test::HeadlessDevice;

        #[test]
        #[ignore = "requires a Vulkan driver"]
        fn buffer_upload_round_trips() {
            let headless = HeadlessDevice::new().unwrap();
            let ctx = headless.upload_context();

            for len in [1usize, 3, 256, 4099] {
                let source: Vec<u8> = (0..len).map(|i| (i * 31 % 251) as u8).collect();
                let buffer = upload_buffer(
                    &ctx,
                    vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_SRC,
                    &source,
                )
                .unwrap();
                assert_eq!(buffer.size, len as vk::DeviceSize);

                let read = read_back_buffer(&ctx, &buffer).unwrap();
                // SAFETY: the readback waited for the queue to go idle.
                unsafe { buffer.destroy(&headless.device) };
                assert_eq!(read, source);
            }
        }

        #[test]
        #[ignore = "requires a Vulkan driver"]
        fn vertex_slice_upload_round_trips() {
            use crate::model::{Vec2, Vec3, Vertex};

            let headless = HeadlessDevice::new().unwrap();
            let ctx = headless.upload_context();
            let vertices = [
                Vertex::new(Vec3::new(0.0, 1.0, 2.0), Vec3::new(1.0, 0.0, 0.0), Vec2::new(0.0, 1.0)),
                Vertex::new(Vec3::new(3.0, 4.0, 5.0), Vec3::new(0.0, 1.0, 0.0), Vec2::new(1.0, 0.0)),
            ];
            let buffer = upload_slice(
                &ctx,
                vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_SRC,
                &vertices,
            )
            .unwrap();

            let read = read_back_buffer(&ctx, &buffer).unwrap();
            // SAFETY: the readback waited for the queue to go idle.
            unsafe { buffer.destroy(&headless.device) };
            assert_eq!(read.as_slice(), bytemuck::cast_slice::<Vertex, u8>(&vertices));
        }

        #[test]
        #[ignore = "requires a Vulkan driver"]
        fn image_upload_ends_in_shader_read_layout() {
            let headless = HeadlessDevice::new().unwrap();
            let ctx = headless.upload_context();

            let extent = vk::Extent2D {
                width: 4,
                height: 2,
            };
            let pixels = vec![0x7fu8; 4 * 2 * 4];
            let image = upload_image(&ctx, extent, Texture::FORMAT, &pixels).unwrap();
            assert_eq!(image.layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
            // SAFETY: uploads leave the queue idle.
            unsafe { image.destroy(&headless.device) };
        }

        #[test]
        #[ignore = "requires a Vulkan driver"]
        fn empty_upload_is_rejected() {
            let headless = HeadlessDevice::new().unwrap();
            let ctx = headless.upload_context();
            assert!(upload_buffer(&ctx, vk::BufferUsageFlags::VERTEX_BUFFER, &[]).is_err());
        }
    }
}

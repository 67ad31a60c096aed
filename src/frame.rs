//! The per-frame state machine and its Vulkan backend.
//!
//! Exactly one frame is ever in flight: a single command buffer, fence and
//! semaphore pair are reused every iteration, and the fence wait at the top of
//! [`FrameExecutor::draw_frame`] is what makes re-recording the command buffer safe.

use std::time::Instant;

use anyhow::{anyhow, Result};
use ash::vk;
use ash::Device;
use log::*;

use crate::error::RendererError;
use crate::memory::GpuBuffer;
use crate::render_target::GraphicsPipeline;
use crate::teardown::TeardownStack;
use crate::uniform::{build_uniforms, UniformBlock};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    Acquiring,
    Recording,
    Submitted,
    Presenting,
}

impl FrameState {
    /// The only state reachable from `self`.
    pub fn next(self) -> Self {
        match self {
            FrameState::Idle => FrameState::Acquiring,
            FrameState::Acquiring => FrameState::Recording,
            FrameState::Recording => FrameState::Submitted,
            FrameState::Submitted => FrameState::Presenting,
            FrameState::Presenting => FrameState::Idle,
        }
    }

    pub fn transition(self, to: FrameState) -> Result<FrameState> {
        if self.next() == to {
            Ok(to)
        } else {
            Err(anyhow!(RendererError::InvalidFrameTransition { from: self, to }))
        }
    }
}

/// The GPU-facing steps of one frame, in the order the executor calls them.
pub trait FrameBackend {
    /// Blocks until the previous submission has retired.
    fn wait_for_fence(&mut self) -> Result<()>;
    fn reset_fence(&mut self) -> Result<()>;
    fn acquire_image(&mut self) -> Result<u32>;
    fn update_uniforms(&mut self, image_index: u32) -> Result<()>;
    fn record(&mut self, image_index: u32) -> Result<()>;
    fn submit(&mut self) -> Result<()>;
    fn present(&mut self, image_index: u32) -> Result<()>;
}

pub struct FrameExecutor<B> {
    backend: B,
    state: FrameState,
    frames_drawn: u64,
}

impl<B: FrameBackend> FrameExecutor<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            state: FrameState::Idle,
            frames_drawn: 0,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn frames_drawn(&self) -> u64 {
        self.frames_drawn
    }

    #[cfg(test)]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn enter(&mut self, to: FrameState) -> Result<()> {
        self.state = self.state.transition(to)?;
        trace!("Frame {}: {:?}", self.frames_drawn, to);
        Ok(())
    }

    /// Runs one full `Idle -> ... -> Idle` cycle. On error the executor is left in the
    /// state it had reached, and every later call fails with an invalid transition.
    pub fn draw_frame(&mut self) -> Result<()> {
        self.state.transition(FrameState::Acquiring)?;
        self.backend.wait_for_fence()?;
        self.backend.reset_fence()?;
        self.enter(FrameState::Acquiring)?;

        let image_index = self.backend.acquire_image()?;
        self.backend.update_uniforms(image_index)?;
        self.enter(FrameState::Recording)?;

        self.backend.record(image_index)?;
        self.backend.submit()?;
        self.enter(FrameState::Submitted)?;

        self.backend.present(image_index)?;
        self.enter(FrameState::Presenting)?;

        self.enter(FrameState::Idle)?;
        self.frames_drawn += 1;
        Ok(())
    }
}

//==================================================================================================
// SECTION: Vulkan backend
//==================================================================================================

/// The fence and semaphores guarding the single in-flight frame.
#[derive(Copy, Clone, Debug)]
pub struct FrameSync {
    pub fence: vk::Fence,
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
}

impl FrameSync {
    /// The fence starts signaled so the first frame does not wait.
    pub fn new(device: &Device, teardown: &mut TeardownStack) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::default();
        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);

        // SAFETY: `device` is live; each handle is registered right after creation.
        unsafe {
            let image_available = device.create_semaphore(&semaphore_info, None)?;
            teardown.push(image_available);
            let render_finished = device.create_semaphore(&semaphore_info, None)?;
            teardown.push(render_finished);
            let fence = device.create_fence(&fence_info, None)?;
            teardown.push(fence);
            Ok(Self {
                fence,
                image_available,
                render_finished,
            })
        }
    }
}

/// Everything the frame loop mutates, gathered in one place.
pub struct FrameContext {
    pub command_buffer: vk::CommandBuffer,
    pub sync: FrameSync,
    pub descriptor_set: vk::DescriptorSet,
    pub uniforms: UniformBlock,
}

impl FrameContext {
    /// Allocates the single primary command buffer from `command_pool`, which must
    /// allow individual resets.
    pub fn new(
        device: &Device,
        command_pool: vk::CommandPool,
        descriptor_set: vk::DescriptorSet,
        uniforms: UniformBlock,
        teardown: &mut TeardownStack,
    ) -> Result<Self> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        // SAFETY: `command_pool` belongs to `device`; the buffer is freed with the pool.
        let command_buffer = unsafe { device.allocate_command_buffers(&alloc_info)?[0] };
        let sync = FrameSync::new(device, teardown)?;
        Ok(Self {
            command_buffer,
            sync,
            descriptor_set,
            uniforms,
        })
    }
}

/// Immutable inputs of the draw.
pub struct DrawResources {
    pub render_pass: vk::RenderPass,
    pub framebuffers: Vec<vk::Framebuffer>,
    pub extent: vk::Extent2D,
    pub clear_values: Vec<vk::ClearValue>,
    pub pipeline: GraphicsPipeline,
    pub vertex_buffer: GpuBuffer,
    pub index_buffer: GpuBuffer,
    pub index_count: u32,
    pub instance_count: u32,
}

pub struct VulkanFrameBackend {
    device: Device,
    swapchain_device: ash::khr::swapchain::Device,
    swapchain: vk::SwapchainKHR,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    resources: DrawResources,
    context: FrameContext,
    start: Instant,
}

impl VulkanFrameBackend {
    pub fn new(
        device: Device,
        swapchain_device: ash::khr::swapchain::Device,
        swapchain: vk::SwapchainKHR,
        graphics_queue: vk::Queue,
        present_queue: vk::Queue,
        resources: DrawResources,
        context: FrameContext,
    ) -> Self {
        Self {
            device,
            swapchain_device,
            swapchain,
            graphics_queue,
            present_queue,
            resources,
            context,
            start: Instant::now(),
        }
    }
}

/// Treats a suboptimal acquire as success and an out-of-date swapchain as fatal.
pub fn check_acquire(result: Result<(u32, bool), vk::Result>) -> Result<u32> {
    match result {
        Ok((image_index, suboptimal)) => {
            if suboptimal {
                debug!("Acquired suboptimal swapchain image {}.", image_index);
            }
            Ok(image_index)
        }
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(anyhow!(RendererError::SurfaceOutOfDate)),
        Err(e) => Err(e.into()),
    }
}

/// Present counterpart of [`check_acquire`].
pub fn check_present(result: Result<bool, vk::Result>) -> Result<()> {
    match result {
        Ok(suboptimal) => {
            if suboptimal {
                debug!("Presented to a suboptimal swapchain.");
            }
            Ok(())
        }
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(anyhow!(RendererError::SurfaceOutOfDate)),
        Err(e) => Err(e.into()),
    }
}

fn record_draw(
    device: &Device,
    resources: &DrawResources,
    context: &FrameContext,
    image_index: u32,
) -> Result<()> {
    let command_buffer = context.command_buffer;
    let framebuffer = *resources
        .framebuffers
        .get(image_index as usize)
        .ok_or_else(|| anyhow!("No framebuffer for swapchain image {}.", image_index))?;

    let render_area = vk::Rect2D::default().extent(resources.extent);
    let begin_info = vk::RenderPassBeginInfo::default()
        .render_pass(resources.render_pass)
        .framebuffer(framebuffer)
        .render_area(render_area)
        .clear_values(&resources.clear_values);

    // SAFETY: the fence wait guarantees the command buffer is no longer executing.
    unsafe {
        device.reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())?;
        device.begin_command_buffer(command_buffer, &vk::CommandBufferBeginInfo::default())?;

        device.cmd_begin_render_pass(command_buffer, &begin_info, vk::SubpassContents::INLINE);
        device.cmd_bind_pipeline(
            command_buffer,
            vk::PipelineBindPoint::GRAPHICS,
            resources.pipeline.pipeline,
        );
        device.cmd_bind_vertex_buffers(command_buffer, 0, &[resources.vertex_buffer.buffer], &[0]);
        device.cmd_bind_index_buffer(
            command_buffer,
            resources.index_buffer.buffer,
            0,
            vk::IndexType::UINT32,
        );
        device.cmd_bind_descriptor_sets(
            command_buffer,
            vk::PipelineBindPoint::GRAPHICS,
            resources.pipeline.layout,
            0,
            &[context.descriptor_set],
            &[],
        );
        device.cmd_draw_indexed(
            command_buffer,
            resources.index_count,
            resources.instance_count,
            0,
            0,
            0,
        );
        device.cmd_end_render_pass(command_buffer);
        device.end_command_buffer(command_buffer)?;
    }
    Ok(())
}

impl FrameBackend for VulkanFrameBackend {
    fn wait_for_fence(&mut self) -> Result<()> {
        // SAFETY: the fence is live.
        unsafe {
            self.device
                .wait_for_fences(&[self.context.sync.fence], true, u64::MAX)?;
        }
        Ok(())
    }

    fn reset_fence(&mut self) -> Result<()> {
        // SAFETY: the wait above means no pending submission references the fence.
        unsafe { self.device.reset_fences(&[self.context.sync.fence])? };
        Ok(())
    }

    fn acquire_image(&mut self) -> Result<u32> {
        // SAFETY: the swapchain and semaphore are live; the semaphore is unsignaled
        // because the previous present consumed it.
        let result = unsafe {
            self.swapchain_device.acquire_next_image(
                self.swapchain,
                u64::MAX,
                self.context.sync.image_available,
                vk::Fence::null(),
            )
        };
        check_acquire(result)
    }

    fn update_uniforms(&mut self, _image_index: u32) -> Result<()> {
        let ubo = build_uniforms(self.start.elapsed().as_secs_f32(), self.resources.extent);
        self.context.uniforms.write(&ubo);
        Ok(())
    }

    fn record(&mut self, image_index: u32) -> Result<()> {
        record_draw(&self.device, &self.resources, &self.context, image_index)
    }

    fn submit(&mut self) -> Result<()> {
        let wait_semaphores = &[self.context.sync.image_available];
        let wait_stages = &[vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = &[self.context.command_buffer];
        let signal_semaphores = &[self.context.sync.render_finished];
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(wait_semaphores)
            .wait_dst_stage_mask(wait_stages)
            .command_buffers(command_buffers)
            .signal_semaphores(signal_semaphores);

        // SAFETY: the command buffer is fully recorded and the fence was reset this frame.
        unsafe {
            self.device
                .queue_submit(self.graphics_queue, &[submit_info], self.context.sync.fence)?;
        }
        Ok(())
    }

    fn present(&mut self, image_index: u32) -> Result<()> {
        let wait_semaphores = &[self.context.sync.render_finished];
        let swapchains = &[self.swapchain];
        let image_indices = &[image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(swapchains)
            .image_indices(image_indices);

        // SAFETY: `image_index` was acquired this frame and rendering signals the semaphore.
        let result = unsafe {
            self.swapchain_device
                .queue_present(self.present_queue, &present_info)
        };
        check_present(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Simulates the GPU: a submission is in flight until the next fence wait.
    #[derive(Default)]
    struct MockBackend {
        in_flight: bool,
        fence_signaled: bool,
        records: u32,
        records_while_in_flight: u32,
        submits_without_reset: u32,
        log: Vec<&'static str>,
        fail_acquire_at: Option<u32>,
        acquires: u32,
    }

    impl MockBackend {
        fn new() -> Self {
            Self {
                fence_signaled: true,
                ..Default::default()
            }
        }
    }

    impl FrameBackend for MockBackend {
        fn wait_for_fence(&mut self) -> Result<()> {
            self.log.push("wait");
            self.in_flight = false;
            self.fence_signaled = true;
            Ok(())
        }

        fn reset_fence(&mut self) -> Result<()> {
            self.log.push("reset");
            self.fence_signaled = false;
            Ok(())
        }

        fn acquire_image(&mut self) -> Result<u32> {
            self.log.push("acquire");
            self.acquires += 1;
            if self.fail_acquire_at == Some(self.acquires) {
                return check_acquire(Err(vk::Result::ERROR_OUT_OF_DATE_KHR));
            }
            Ok(self.acquires % 3)
        }

        fn update_uniforms(&mut self, _image_index: u32) -> Result<()> {
            self.log.push("uniforms");
            Ok(())
        }

        fn record(&mut self, _image_index: u32) -> Result<()> {
            self.log.push("record");
            self.records += 1;
            if self.in_flight {
                self.records_while_in_flight += 1;
            }
            Ok(())
        }

        fn submit(&mut self) -> Result<()> {
            self.log.push("submit");
            if self.fence_signaled {
                self.submits_without_reset += 1;
            }
            self.in_flight = true;
            Ok(())
        }

        fn present(&mut self, _image_index: u32) -> Result<()> {
            self.log.push("present");
            Ok(())
        }
    }

    #[test]
    fn never_records_while_a_frame_is_in_flight() {
        let mut executor = FrameExecutor::new(MockBackend::new());
        for _ in 0..100 {
            executor.draw_frame().unwrap();
            assert_eq!(executor.state(), FrameState::Idle);
            assert!(executor.backend().in_flight);
        }
        let backend = executor.backend();
        assert_eq!(executor.frames_drawn(), 100);
        assert_eq!(backend.records, 100);
        assert_eq!(backend.records_while_in_flight, 0);
        assert_eq!(backend.submits_without_reset, 0);
    }

    #[test]
    fn steps_run_in_state_machine_order() {
        let mut executor = FrameExecutor::new(MockBackend::new());
        executor.draw_frame().unwrap();
        assert_eq!(
            executor.backend().log,
            vec!["wait", "reset", "acquire", "uniforms", "record", "submit", "present"]
        );
    }

    #[test]
    fn states_cycle_back_to_idle() {
        let mut state = FrameState::Idle;
        for expected in [
            FrameState::Acquiring,
            FrameState::Recording,
            FrameState::Submitted,
            FrameState::Presenting,
            FrameState::Idle,
        ] {
            state = state.transition(expected).unwrap();
        }
        assert_eq!(state, FrameState::Idle);
    }

    #[test]
    fn skipping_a_state_is_rejected() {
        let err = FrameState::Idle.transition(FrameState::Recording).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RendererError>(),
            Some(RendererError::InvalidFrameTransition {
                from: FrameState::Idle,
                to: FrameState::Recording,
            })
        ));
        assert!(FrameState::Submitted.transition(FrameState::Recording).is_err());
        assert!(FrameState::Presenting.transition(FrameState::Presenting).is_err());
    }

    #[test]
    fn out_of_date_acquire_is_fatal() {
        let mut executor = FrameExecutor::new(MockBackend {
            fail_acquire_at: Some(2),
            ..MockBackend::new()
        });
        executor.draw_frame().unwrap();

        let err = executor.draw_frame().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RendererError>(),
            Some(RendererError::SurfaceOutOfDate)
        ));
        assert_eq!(executor.state(), FrameState::Acquiring);
        assert_eq!(executor.backend().records, 1);

        // The interrupted frame cannot be resumed.
        let err = executor.draw_frame().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RendererError>(),
            Some(RendererError::InvalidFrameTransition { .. })
        ));
        assert_eq!(executor.frames_drawn(), 1);
    }

    #[test]
    fn suboptimal_results_are_not_errors() {
        assert_eq!(check_acquire(Ok((2, true))).unwrap(), 2);
        assert_eq!(check_acquire(Ok((0, false))).unwrap(), 0);
        assert!(check_present(Ok(true)).is_ok());
        assert!(check_present(Ok(false)).is_ok());
    }

    #[test]
    fn other_vulkan_errors_pass_through() {
        let err = check_present(Err(vk::Result::ERROR_DEVICE_LOST)).unwrap_err();
        assert_eq!(
            err.downcast_ref::<vk::Result>(),
            Some(&vk::Result::ERROR_DEVICE_LOST)
        );
        let err = check_present(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RendererError>(),
            Some(RendererError::SurfaceOutOfDate)
        ));
    }
}

//! Frame pipeline: frame slots cycled round-robin across frames in flight.
//!
//! Each slot owns a command buffer, an image-available semaphore and a
//! fence; render-finished semaphores belong to the swapchain images. A slot
//! moves through `Idle -> Recording -> Submitted -> Presenting` and back to
//! `Idle` once its fence has been observed signaled, which happens lazily
//! when the slot comes up again.

use crate::command::CommandPool;
use crate::context::{DeviceContext, QueueRole};
use crate::driver::{Driver, SubmitDesc};
use crate::error::{GpuError, Result};
use crate::swapchain::{AcquiredImage, SwapchainManager};
use crate::sync::{wait_for_fence, FenceWait, FrameSync};
use ash::vk;
use std::time::Duration;

/// Frame pipeline configuration.
#[derive(Debug, Clone, Copy)]
pub struct FramePipelineConfig {
    /// Number of frame slots.
    pub frames_in_flight: usize,
    /// Bound on the wait for a slot's previous work.
    pub frame_timeout: Duration,
    /// Bound on swapchain image acquisition.
    pub acquire_timeout: Duration,
    /// Stage at which submitted work waits for the acquired image.
    pub wait_stage: vk::PipelineStageFlags,
}

impl Default for FramePipelineConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            frame_timeout: Duration::from_secs(1),
            acquire_timeout: Duration::from_secs(1),
            wait_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::TRANSFER,
        }
    }
}

impl FramePipelineConfig {
    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames;
        self
    }

    pub fn with_frame_timeout(mut self, timeout: Duration) -> Self {
        self.frame_timeout = timeout;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_wait_stage(mut self, stage: vk::PipelineStageFlags) -> Self {
        self.wait_stage = stage;
        self
    }
}

/// Per-slot lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Recording,
    Submitted,
    Presenting,
}

/// The frame currently being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveFrame {
    pub slot: usize,
    pub frame_number: u64,
    pub image_index: u32,
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub command_buffer: vk::CommandBuffer,
    /// The swapchain should be rebuilt after this frame.
    pub suboptimal: bool,
}

#[derive(Debug)]
struct FrameSlot {
    sync: FrameSync,
    command_buffer: vk::CommandBuffer,
    state: SlotState,
    // Frame whose completion signals the fence
    pending_frame: Option<u64>,
    image: Option<AcquiredImage>,
}

/// Drives begin/record/end for each frame.
#[derive(Debug)]
pub struct FramePipeline {
    config: FramePipelineConfig,
    command_pool: CommandPool,
    slots: Vec<FrameSlot>,
    next_slot: usize,
    next_frame: u64,
    active: Option<ActiveFrame>,
    completed_frame: Option<u64>,
}

impl FramePipeline {
    /// Create the frame slots.
    pub fn new<D: Driver>(ctx: &DeviceContext<D>, config: FramePipelineConfig) -> Result<Self> {
        if config.frames_in_flight == 0 {
            return Err(GpuError::InvalidState(
                "At least one frame in flight is required".to_string(),
            ));
        }
        let count = u32::try_from(config.frames_in_flight)
            .map_err(|_| GpuError::InvalidState("Too many frames in flight".to_string()))?;

        let command_pool = CommandPool::new(ctx, ctx.queue_family(QueueRole::Graphics))?;
        let command_buffers = match command_pool.allocate(ctx, count) {
            Ok(buffers) => buffers,
            Err(e) => {
                // SAFETY: nothing was recorded from the pool.
                unsafe { command_pool.destroy(ctx) };
                return Err(e);
            }
        };

        let mut slots: Vec<FrameSlot> = Vec::with_capacity(config.frames_in_flight);
        for command_buffer in command_buffers {
            match FrameSync::new(ctx) {
                Ok(sync) => slots.push(FrameSlot {
                    sync,
                    command_buffer,
                    state: SlotState::Idle,
                    pending_frame: None,
                    image: None,
                }),
                Err(e) => {
                    // SAFETY: none of the objects were used yet.
                    unsafe {
                        for slot in &slots {
                            slot.sync.destroy(ctx);
                        }
                        command_pool.destroy(ctx);
                    }
                    return Err(e);
                }
            }
        }

        tracing::debug!("Frame pipeline created with {} slots", slots.len());

        Ok(Self {
            config,
            command_pool,
            slots,
            next_slot: 0,
            next_frame: 0,
            active: None,
            completed_frame: None,
        })
    }

    /// Start a frame: wait for the next slot, acquire an image and begin recording.
    ///
    /// On `FrameTimeout` or an acquire failure the slot is left reusable and
    /// the next call retries the same slot.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn begin_frame<D: Driver>(
        &mut self,
        ctx: &DeviceContext<D>,
        swapchain: &SwapchainManager,
    ) -> Result<ActiveFrame> {
        if let Some(active) = &self.active {
            return Err(GpuError::InvalidState(format!(
                "Frame {} is still open",
                active.frame_number
            )));
        }

        let index = self.next_slot;
        self.wait_slot(ctx, index, self.config.frame_timeout)?;

        let slot = &mut self.slots[index];
        let acquired = swapchain.acquire_next_image(
            ctx,
            self.config.acquire_timeout,
            slot.sync.image_available,
        )?;

        let driver = ctx.driver();
        // SAFETY: the fence was observed signaled above, so it is not pending.
        if let Err(e) = unsafe { driver.reset_fence(slot.sync.in_flight) } {
            self.release_acquire(ctx, index);
            return Err(e.into());
        }
        // From here the slot must be retired through a submission
        slot.image = Some(acquired);
        slot.state = SlotState::Recording;

        let frame = ActiveFrame {
            slot: index,
            frame_number: self.next_frame,
            image_index: acquired.index,
            image: acquired.image,
            view: acquired.view,
            extent: swapchain.extent(),
            format: swapchain.format().format,
            command_buffer: slot.command_buffer,
            suboptimal: acquired.suboptimal,
        };
        self.active = Some(frame);

        // SAFETY: the slot's previous submission has completed.
        if let Err(e) = unsafe { driver.begin_command_buffer(slot.command_buffer) } {
            self.abandon_active(ctx);
            return Err(e.into());
        }

        tracing::trace!(
            "Frame {} begun on slot {index} with image {}",
            frame.frame_number,
            frame.image_index
        );
        Ok(frame)
    }

    /// Record commands into the open frame.
    ///
    /// May be called any number of times between `begin_frame` and `end_frame`.
    pub fn record<D: Driver, R>(
        &mut self,
        ctx: &DeviceContext<D>,
        recorder: impl FnOnce(&DeviceContext<D>, &ActiveFrame) -> R,
    ) -> Result<R> {
        let frame = self
            .active
            .ok_or_else(|| GpuError::InvalidState("No frame is being recorded".to_string()))?;
        Ok(recorder(ctx, &frame))
    }

    /// Finish recording, submit, and present.
    ///
    /// The slot's work has been submitted whenever this returns `Ok`,
    /// `OutOfDate`, `Suboptimal` or `DeviceLost` from presentation; the frame
    /// counts as ended in every case.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn end_frame<D: Driver>(
        &mut self,
        ctx: &DeviceContext<D>,
        swapchain: &SwapchainManager,
    ) -> Result<()> {
        let Some(frame) = self.active else {
            return Err(GpuError::InvalidState("No frame is being recorded".to_string()));
        };

        let driver = ctx.driver();
        let slot = &self.slots[frame.slot];

        // SAFETY: the buffer is recording.
        if let Err(e) = unsafe { driver.end_command_buffer(slot.command_buffer) } {
            self.abandon_active(ctx);
            return Err(e.into());
        }

        let Some(render_finished) = swapchain.render_finished(frame.image_index) else {
            self.abandon_active(ctx);
            return Err(GpuError::InvalidState(format!(
                "No render-finished semaphore for image {}",
                frame.image_index
            )));
        };

        let submit = SubmitDesc {
            command_buffers: vec![slot.command_buffer],
            wait_semaphores: vec![slot.sync.image_available],
            wait_stages: vec![self.config.wait_stage],
            signal_semaphores: vec![render_finished],
        };

        // SAFETY: all handles belong to the slot; the fence was reset in begin_frame.
        let submitted = unsafe { driver.queue_submit(ctx.graphics_queue(), &submit, slot.sync.in_flight) };
        if let Err(e) = submitted {
            self.active = None;
            let slot = &mut self.slots[frame.slot];
            slot.state = SlotState::Idle;
            slot.image = None;
            // SAFETY: the submission never reached the queue, so nothing is pending on the slot.
            if let Err(rearm) = unsafe { slot.sync.rearm(ctx) } {
                tracing::error!("Failed to re-arm sync objects of slot {}: {rearm}", frame.slot);
            }
            return Err(e.into());
        }

        let slot = &mut self.slots[frame.slot];
        slot.state = SlotState::Submitted;
        slot.pending_frame = Some(frame.frame_number);
        let image = slot.image;
        self.active = None;
        self.advance();

        let image = image.ok_or_else(|| {
            GpuError::InvalidState(format!("Slot {} has no acquired image", frame.slot))
        })?;
        let presented = swapchain.present(ctx, ctx.present_queue(), &image, &[render_finished]);
        self.slots[frame.slot].state = SlotState::Presenting;

        tracing::trace!("Frame {} submitted and presented", frame.frame_number);
        presented
    }

    /// Retire the open frame without presenting it.
    ///
    /// The slot's image-available signal is consumed by an empty submission.
    /// The image stays acquired until the swapchain is rebuilt.
    pub fn cancel_frame<D: Driver>(&mut self, ctx: &DeviceContext<D>) -> Result<()> {
        let Some(frame) = self.active else {
            return Err(GpuError::InvalidState("No frame is being recorded".to_string()));
        };

        let slot = &self.slots[frame.slot];
        // SAFETY: the buffer is recording; it is never submitted.
        if let Err(e) = unsafe { ctx.driver().end_command_buffer(slot.command_buffer) } {
            tracing::debug!("Ending cancelled command buffer failed: {e}");
        }

        tracing::debug!("Frame {} cancelled", frame.frame_number);
        self.abandon_active(ctx);
        Ok(())
    }

    /// Wait for every slot's work to finish and drop all image references.
    ///
    /// An open frame is cancelled first. Required before a swapchain rebuild
    /// and before shutdown.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn drain<D: Driver>(&mut self, ctx: &DeviceContext<D>, timeout: Duration) -> Result<()> {
        if self.active.is_some() {
            self.cancel_frame(ctx)?;
        }
        for index in 0..self.slots.len() {
            self.wait_slot(ctx, index, timeout)?;
        }
        tracing::trace!("Frame pipeline drained");
        Ok(())
    }

    /// Check slot fences without blocking and mark finished slots idle.
    pub fn poll<D: Driver>(&mut self, ctx: &DeviceContext<D>) -> Result<()> {
        for index in 0..self.slots.len() {
            let slot = &self.slots[index];
            if slot.pending_frame.is_none() {
                continue;
            }
            // SAFETY: the fence belongs to the slot.
            if unsafe { ctx.driver().fence_status(slot.sync.in_flight)? } {
                self.mark_complete(index);
            }
        }
        Ok(())
    }

    /// Highest frame number known to have completed on the GPU.
    pub fn completed_frame(&self) -> Option<u64> {
        self.completed_frame
    }

    /// Number of the next frame to begin (or of the open frame).
    pub fn frame_number(&self) -> u64 {
        self.next_frame
    }

    /// Slot the next `begin_frame` will use.
    pub fn current_slot(&self) -> usize {
        self.next_slot
    }

    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    pub fn active_frame(&self) -> Option<&ActiveFrame> {
        self.active.as_ref()
    }

    pub fn slot_states(&self) -> Vec<SlotState> {
        self.slots.iter().map(|s| s.state).collect()
    }

    pub fn config(&self) -> &FramePipelineConfig {
        &self.config
    }

    /// Destroy all slot objects and the command pool.
    ///
    /// # Safety
    /// The pipeline must be drained.
    pub unsafe fn destroy<D: Driver>(&mut self, ctx: &DeviceContext<D>) {
        for slot in self.slots.drain(..) {
            // SAFETY: drained by the caller.
            unsafe { slot.sync.destroy(ctx) };
        }
        // SAFETY: no buffer from the pool is pending.
        unsafe { self.command_pool.destroy(ctx) };
        tracing::debug!("Frame pipeline destroyed");
    }

    fn wait_slot<D: Driver>(
        &mut self,
        ctx: &DeviceContext<D>,
        index: usize,
        timeout: Duration,
    ) -> Result<()> {
        let fence = self.slots[index].sync.in_flight;
        // SAFETY: the fence belongs to the slot.
        match unsafe { wait_for_fence(ctx, fence, timeout)? } {
            FenceWait::Signaled => {
                self.mark_complete(index);
                Ok(())
            }
            FenceWait::TimedOut => {
                tracing::warn!("Slot {index} did not complete within {timeout:?}");
                Err(GpuError::FrameTimeout {
                    slot: index,
                    timeout,
                })
            }
        }
    }

    fn mark_complete(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        if let Some(frame) = slot.pending_frame.take() {
            self.completed_frame = Some(self.completed_frame.map_or(frame, |c| c.max(frame)));
        }
        slot.image = None;
        slot.state = SlotState::Idle;
    }

    fn advance(&mut self) {
        self.next_slot = (self.next_slot + 1) % self.slots.len();
        self.next_frame += 1;
    }

    // Consume the image-available signal of an acquire that never became a
    // frame. The slot stays idle with its fence untouched; the image stays
    // acquired until the swapchain is rebuilt.
    fn release_acquire<D: Driver>(&self, ctx: &DeviceContext<D>, index: usize) {
        let submit = SubmitDesc {
            wait_semaphores: vec![self.slots[index].sync.image_available],
            wait_stages: vec![self.config.wait_stage],
            ..SubmitDesc::default()
        };
        // SAFETY: the semaphore has a pending signal from acquisition; no fence is signaled.
        let submitted =
            unsafe { ctx.driver().queue_submit(ctx.graphics_queue(), &submit, vk::Fence::null()) };
        // The semaphore is signaled again by the next acquire, so the wait must finish first
        if let Err(e) = submitted.map_err(GpuError::from).and_then(|()| ctx.wait_idle()) {
            tracing::error!("Failed to release the acquire signal of slot {index}: {e}");
        }
    }

    // Consume the image-available signal of the open frame with an empty
    // submission so the slot's semaphores and fence stay consistent.
    fn abandon_active<D: Driver>(&mut self, ctx: &DeviceContext<D>) {
        let Some(frame) = self.active.take() else {
            return;
        };
        let wait_stage = self.config.wait_stage;
        let slot = &mut self.slots[frame.slot];

        let submit = SubmitDesc {
            wait_semaphores: vec![slot.sync.image_available],
            wait_stages: vec![wait_stage],
            ..SubmitDesc::default()
        };
        // SAFETY: the semaphore has a pending signal from acquisition; the fence was reset.
        let submitted =
            unsafe { ctx.driver().queue_submit(ctx.graphics_queue(), &submit, slot.sync.in_flight) };

        match submitted {
            Ok(()) => {
                slot.state = SlotState::Submitted;
                slot.pending_frame = Some(frame.frame_number);
            }
            Err(e) => {
                tracing::error!("Failed to retire frame {}: {e}", frame.frame_number);
                slot.state = SlotState::Idle;
                slot.image = None;
                // SAFETY: the submission failed, so nothing is pending on the slot.
                if let Err(e) = unsafe { slot.sync.rearm(ctx) } {
                    tracing::error!("Failed to re-arm sync objects of slot {}: {e}", frame.slot);
                }
            }
        }
        self.advance();
    }
}

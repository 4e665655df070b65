//! Clear-to-color frame recording.

use ash::vk;
use vkl_gpu::vulkan::color_subresource_range;
use vkl_gpu::ActiveFrame;

/// Record a clear of the frame's swapchain image, leaving it ready to present.
///
/// # Safety
///
/// `frame` must be the active frame of a pipeline built on `device`, with its
/// command buffer in the recording state.
pub unsafe fn record_clear(device: &ash::Device, frame: &ActiveFrame, color: [f32; 4]) {
    let range = color_subresource_range();

    let to_transfer = vk::ImageMemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::empty())
        .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .old_layout(vk::ImageLayout::UNDEFINED)
        .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(frame.image)
        .subresource_range(range);

    let to_present = vk::ImageMemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .dst_access_mask(vk::AccessFlags::MEMORY_READ)
        .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(frame.image)
        .subresource_range(range);

    let clear = vk::ClearColorValue { float32: color };

    // SAFETY: guaranteed by the caller.
    unsafe {
        // Chains with the image-available wait at the transfer stage
        device.cmd_pipeline_barrier(
            frame.command_buffer,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[to_transfer],
        );
        device.cmd_clear_color_image(
            frame.command_buffer,
            frame.image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &clear,
            &[range],
        );
        device.cmd_pipeline_barrier(
            frame.command_buffer,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[to_present],
        );
    }
}

use std::sync::Arc;

use anyhow::Result;
use ash::vk;

use crate::{device::Device, CommandBuffer, Fence};

#[derive(Debug, Clone, Copy)]
pub struct QueueFamily {
    pub index: u32,
    pub(crate) inner: vk::QueueFamilyProperties,
}

impl QueueFamily {
    pub(crate) fn new(index: u32, inner: vk::QueueFamilyProperties) -> Self {
        Self { index, inner }
    }

    pub fn supports_compute(&self) -> bool {
        self.inner.queue_flags.contains(vk::QueueFlags::COMPUTE)
    }

    pub fn supports_graphics(&self) -> bool {
        self.inner.queue_flags.contains(vk::QueueFlags::GRAPHICS)
    }

    pub fn has_queues(&self) -> bool {
        self.inner.queue_count > 0
    }

    pub fn supports_timestamp_queries(&self) -> bool {
        self.inner.timestamp_valid_bits > 0
    }
}

/// The single graphics/compute queue. All build, compaction and render work
/// is ordered by explicit submissions and fence waits on this queue.
pub struct Queue {
    device: Arc<Device>,
    pub inner: vk::Queue,
}

impl Queue {
    pub(crate) fn new(device: Arc<Device>, inner: vk::Queue) -> Self {
        Self { device, inner }
    }

    pub fn submit(&self, command_buffer: &CommandBuffer, fence: &Fence) -> Result<()> {
        let cmd_buffer_submit_info =
            vk::CommandBufferSubmitInfo::builder().command_buffer(command_buffer.inner);

        let submit_info = vk::SubmitInfo2::builder()
            .command_buffer_infos(std::slice::from_ref(&cmd_buffer_submit_info));

        unsafe {
            self.device.inner.queue_submit2(
                self.inner,
                std::slice::from_ref(&submit_info),
                fence.inner,
            )?
        };

        Ok(())
    }
}

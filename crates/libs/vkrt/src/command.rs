use std::sync::Arc;

use anyhow::Result;
use ash::vk;

use crate::{
    device::Device, Buffer, CompactedSizeQueryPool, DescriptorSet, Image, PipelineLayout,
    QueueFamily, RTPipeline, RayTracingContext, ShaderBindingTable, TimestampQueryPool,
};

pub struct CommandPool {
    device: Arc<Device>,
    ray_tracing: Arc<RayTracingContext>,
    pub inner: vk::CommandPool,
}

impl CommandPool {
    pub(crate) fn new(
        device: Arc<Device>,
        ray_tracing: Arc<RayTracingContext>,
        queue_family: QueueFamily,
        flags: Option<vk::CommandPoolCreateFlags>,
    ) -> Result<Self> {
        let flags = flags.unwrap_or_else(vk::CommandPoolCreateFlags::empty);

        let command_pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(queue_family.index)
            .flags(flags);
        let inner = unsafe { device.inner.create_command_pool(&command_pool_info, None)? };

        Ok(Self {
            device,
            ray_tracing,
            inner,
        })
    }

    pub fn allocate_command_buffers(
        &self,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> Result<Vec<CommandBuffer>> {
        let allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.inner)
            .level(level)
            .command_buffer_count(count);

        let buffers = unsafe { self.device.inner.allocate_command_buffers(&allocate_info)? };
        let buffers = buffers
            .into_iter()
            .map(|inner| CommandBuffer {
                device: self.device.clone(),
                ray_tracing: self.ray_tracing.clone(),
                inner,
            })
            .collect();

        Ok(buffers)
    }

    pub fn allocate_command_buffer(&self, level: vk::CommandBufferLevel) -> Result<CommandBuffer> {
        let buffers = self.allocate_command_buffers(level, 1)?;
        let buffer = buffers.into_iter().next().unwrap();

        Ok(buffer)
    }

    pub fn free_command_buffer(&self, buffer: &CommandBuffer) -> Result<()> {
        let buffs = [buffer.inner];
        unsafe { self.device.inner.free_command_buffers(self.inner, &buffs) };

        Ok(())
    }
}

impl crate::Context {
    pub fn create_command_pool(
        &self,
        queue_family: QueueFamily,
        flags: Option<vk::CommandPoolCreateFlags>,
    ) -> Result<CommandPool> {
        CommandPool::new(
            self.device.clone(),
            self.ray_tracing.clone(),
            queue_family,
            flags,
        )
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe { self.device.inner.destroy_command_pool(self.inner, None) };
    }
}

pub struct CommandBuffer {
    device: Arc<Device>,
    ray_tracing: Arc<RayTracingContext>,
    pub inner: vk::CommandBuffer,
}

impl CommandBuffer {
    pub fn begin(&self, flags: Option<vk::CommandBufferUsageFlags>) -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(flags.unwrap_or(vk::CommandBufferUsageFlags::empty()));
        unsafe {
            self.device
                .inner
                .begin_command_buffer(self.inner, &begin_info)?
        };

        Ok(())
    }

    pub fn end(&self) -> Result<()> {
        unsafe { self.device.inner.end_command_buffer(self.inner)? };

        Ok(())
    }

    pub fn reset(&self) -> Result<()> {
        unsafe {
            self.device
                .inner
                .reset_command_buffer(self.inner, vk::CommandBufferResetFlags::empty())?
        };

        Ok(())
    }

    pub fn build_acceleration_structures(
        &self,
        as_build_geo_info: &vk::AccelerationStructureBuildGeometryInfoKHR,
        as_build_range_info: &[vk::AccelerationStructureBuildRangeInfoKHR],
    ) {
        unsafe {
            self.ray_tracing
                .acceleration_structure_fn
                .cmd_build_acceleration_structures(
                    self.inner,
                    std::slice::from_ref(as_build_geo_info),
                    std::slice::from_ref(&as_build_range_info),
                )
        };
    }

    /// Hazard barrier between an acceleration structure build and any later
    /// command that reads or copies the structure within the same queue.
    pub fn acceleration_structure_barrier(&self) {
        let barrier = vk::MemoryBarrier2::builder()
            .src_stage_mask(vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR)
            .src_access_mask(
                vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR
                    | vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
            )
            .dst_stage_mask(vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR)
            .dst_access_mask(
                vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR
                    | vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
            )
            .build();

        let dependency_info =
            vk::DependencyInfo::builder().memory_barriers(std::slice::from_ref(&barrier));

        unsafe {
            self.device
                .inner
                .cmd_pipeline_barrier2(self.inner, &dependency_info)
        };
    }

    pub fn copy_acceleration_structure_compacted(
        &self,
        src: vk::AccelerationStructureKHR,
        dst: vk::AccelerationStructureKHR,
    ) {
        let copy_info = vk::CopyAccelerationStructureInfoKHR::builder()
            .src(src)
            .dst(dst)
            .mode(vk::CopyAccelerationStructureModeKHR::COMPACT);

        unsafe {
            self.ray_tracing
                .acceleration_structure_fn
                .cmd_copy_acceleration_structure(self.inner, &copy_info)
        };
    }

    pub fn write_compacted_size_query(
        &self,
        structure: vk::AccelerationStructureKHR,
        pool: &CompactedSizeQueryPool,
        query_index: u32,
    ) {
        unsafe {
            self.device
                .inner
                .cmd_reset_query_pool(self.inner, pool.inner, query_index, 1);
            self.ray_tracing
                .acceleration_structure_fn
                .cmd_write_acceleration_structures_properties(
                    self.inner,
                    &[structure],
                    vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR,
                    pool.inner,
                    query_index,
                )
        };
    }

    pub fn bind_rt_pipeline(&self, pipeline: &RTPipeline) {
        unsafe {
            self.device.inner.cmd_bind_pipeline(
                self.inner,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                pipeline.inner,
            )
        }
    }

    pub fn bind_descriptor_sets(
        &self,
        bind_point: vk::PipelineBindPoint,
        layout: &PipelineLayout,
        first_set: u32,
        sets: &[&DescriptorSet],
    ) {
        let sets = sets.iter().map(|s| s.inner).collect::<Vec<_>>();
        unsafe {
            self.device.inner.cmd_bind_descriptor_sets(
                self.inner,
                bind_point,
                layout.inner,
                first_set,
                &sets,
                &[],
            )
        }
    }

    pub fn pipeline_buffer_barriers(&self, barriers: &[BufferBarrier]) {
        let barriers = barriers
            .iter()
            .map(|b| {
                vk::BufferMemoryBarrier2::builder()
                    .src_stage_mask(b.src_stage_mask)
                    .src_access_mask(b.src_access_mask)
                    .dst_stage_mask(b.dst_stage_mask)
                    .dst_access_mask(b.dst_access_mask)
                    .buffer(b.buffer.inner)
                    .offset(0)
                    .size(vk::WHOLE_SIZE)
                    .build()
            })
            .collect::<Vec<_>>();

        let dependency_info = vk::DependencyInfo::builder().buffer_memory_barriers(&barriers);

        unsafe {
            self.device
                .inner
                .cmd_pipeline_barrier2(self.inner, &dependency_info)
        };
    }

    pub fn pipeline_image_barriers(&self, barriers: &[ImageBarrier]) {
        let barriers = barriers
            .iter()
            .map(|b| {
                vk::ImageMemoryBarrier2::builder()
                    .src_stage_mask(b.src_stage_mask)
                    .src_access_mask(b.src_access_mask)
                    .old_layout(b.old_layout)
                    .dst_stage_mask(b.dst_stage_mask)
                    .dst_access_mask(b.dst_access_mask)
                    .new_layout(b.new_layout)
                    .image(b.image.inner)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    })
                    .build()
            })
            .collect::<Vec<_>>();

        let dependency_info = vk::DependencyInfo::builder().image_memory_barriers(&barriers);

        unsafe {
            self.device
                .inner
                .cmd_pipeline_barrier2(self.inner, &dependency_info)
        };
    }

    pub fn copy_buffer(&self, src_buffer: &Buffer, dst_buffer: &Buffer) {
        unsafe {
            let region = vk::BufferCopy::builder().size(src_buffer.size);
            self.device.inner.cmd_copy_buffer(
                self.inner,
                src_buffer.inner,
                dst_buffer.inner,
                std::slice::from_ref(&region),
            )
        };
    }

    pub fn copy_buffer_to_image(&self, src: &Buffer, dst: &Image, layout: vk::ImageLayout) {
        let region = vk::BufferImageCopy::builder()
            .image_subresource(vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            })
            .image_extent(dst.extent);

        unsafe {
            self.device.inner.cmd_copy_buffer_to_image(
                self.inner,
                src.inner,
                dst.inner,
                layout,
                std::slice::from_ref(&region),
            );
        };
    }

    pub fn copy_image_to_buffer(&self, src: &Image, layout: vk::ImageLayout, dst: &Buffer) {
        let region = vk::BufferImageCopy::builder()
            .image_subresource(vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            })
            .image_extent(src.extent);

        unsafe {
            self.device.inner.cmd_copy_image_to_buffer(
                self.inner,
                src.inner,
                layout,
                dst.inner,
                std::slice::from_ref(&region),
            );
        };
    }

    pub fn trace_rays(&self, shader_binding_table: &ShaderBindingTable, width: u32, height: u32) {
        unsafe {
            self.ray_tracing.pipeline_fn.cmd_trace_rays(
                self.inner,
                &shader_binding_table.raygen_region,
                &shader_binding_table.miss_region,
                &shader_binding_table.hit_region,
                &vk::StridedDeviceAddressRegionKHR::default(),
                width,
                height,
                1,
            )
        };
    }

    pub fn reset_all_timestamp_queries_from_pool<const C: usize>(
        &self,
        pool: &TimestampQueryPool<C>,
    ) {
        unsafe {
            self.device
                .inner
                .cmd_reset_query_pool(self.inner, pool.inner, 0, C as _);
        }
    }

    pub fn write_timestamp<const C: usize>(
        &self,
        stage: vk::PipelineStageFlags2,
        pool: &TimestampQueryPool<C>,
        query_index: u32,
    ) {
        assert!(query_index < C as _, "Query index must be < {C}");

        unsafe {
            self.device
                .inner
                .cmd_write_timestamp2(self.inner, stage, pool.inner, query_index)
        }
    }
}

#[derive(Clone, Copy)]
pub struct BufferBarrier<'a> {
    pub buffer: &'a Buffer,
    pub src_access_mask: vk::AccessFlags2,
    pub dst_access_mask: vk::AccessFlags2,
    pub src_stage_mask: vk::PipelineStageFlags2,
    pub dst_stage_mask: vk::PipelineStageFlags2,
}

#[derive(Clone, Copy)]
pub struct ImageBarrier<'a> {
    pub image: &'a Image,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access_mask: vk::AccessFlags2,
    pub dst_access_mask: vk::AccessFlags2,
    pub src_stage_mask: vk::PipelineStageFlags2,
    pub dst_stage_mask: vk::PipelineStageFlags2,
}

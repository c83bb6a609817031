use std::sync::Arc;

use anyhow::Result;
use ash::vk;

use crate::{device::Device, Buffer, Context, ImageView, Sampler, TopLevelBvh};

pub struct DescriptorSetLayout {
    device: Arc<Device>,
    pub(crate) inner: vk::DescriptorSetLayout,
}

impl DescriptorSetLayout {
    pub(crate) fn new(
        device: Arc<Device>,
        bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> Result<Self> {
        let dsl_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(bindings);
        let inner = unsafe { device.inner.create_descriptor_set_layout(&dsl_info, None)? };

        Ok(Self { device, inner })
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device
                .inner
                .destroy_descriptor_set_layout(self.inner, None);
        }
    }
}

pub struct DescriptorPool {
    device: Arc<Device>,
    pub(crate) inner: vk::DescriptorPool,
}

impl DescriptorPool {
    pub(crate) fn new(
        device: Arc<Device>,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<Self> {
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes);
        let inner = unsafe { device.inner.create_descriptor_pool(&pool_info, None)? };

        Ok(Self { device, inner })
    }

    pub fn allocate_set(&self, layout: &DescriptorSetLayout) -> Result<DescriptorSet> {
        let layouts = [layout.inner];
        let sets_alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.inner)
            .set_layouts(&layouts);
        let mut sets = unsafe {
            self.device
                .inner
                .allocate_descriptor_sets(&sets_alloc_info)?
        };

        Ok(DescriptorSet {
            device: self.device.clone(),
            inner: sets.remove(0),
        })
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        unsafe { self.device.inner.destroy_descriptor_pool(self.inner, None) };
    }
}

pub struct DescriptorSet {
    device: Arc<Device>,
    pub(crate) inner: vk::DescriptorSet,
}

impl DescriptorSet {
    pub fn update(&self, writes: &[WriteDescriptorSet]) {
        use WriteDescriptorSetKind::*;

        // Keep the info structs referenced by the writes alive until the
        // update call; capacities are reserved so the raw pointers the
        // writes hold stay valid.
        let mut img_infos = Vec::with_capacity(writes.len());
        let mut buffer_infos = Vec::with_capacity(writes.len());
        let mut as_infos = Vec::with_capacity(writes.len());
        let mut buffer_array_infos = Vec::with_capacity(writes.len());
        let mut img_array_infos = Vec::with_capacity(writes.len());

        let descriptor_writes = writes
            .iter()
            .map(|write| match write.kind {
                StorageImage { view, layout } => {
                    let img_info = vk::DescriptorImageInfo::builder()
                        .image_view(view.inner)
                        .image_layout(layout);

                    img_infos.push(img_info);

                    vk::WriteDescriptorSet::builder()
                        .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                        .dst_binding(write.binding)
                        .dst_set(self.inner)
                        .image_info(std::slice::from_ref(img_infos.last().unwrap()))
                        .build()
                }
                AccelerationStructure { top_level } => {
                    let write_set_as = vk::WriteDescriptorSetAccelerationStructureKHR::builder()
                        .acceleration_structures(std::slice::from_ref(top_level.handle_ref()));

                    as_infos.push(write_set_as);

                    let mut write = vk::WriteDescriptorSet::builder()
                        .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                        .dst_binding(write.binding)
                        .dst_set(self.inner)
                        .push_next(as_infos.last_mut().unwrap())
                        .build();
                    write.descriptor_count = 1;

                    write
                }
                UniformBuffer { buffer } => {
                    let buffer_info = vk::DescriptorBufferInfo::builder()
                        .buffer(buffer.inner)
                        .range(vk::WHOLE_SIZE);

                    buffer_infos.push(buffer_info);

                    vk::WriteDescriptorSet::builder()
                        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                        .dst_binding(write.binding)
                        .dst_set(self.inner)
                        .buffer_info(std::slice::from_ref(buffer_infos.last().unwrap()))
                        .build()
                }
                StorageBuffer { buffer } => {
                    let buffer_info = vk::DescriptorBufferInfo::builder()
                        .buffer(buffer.inner)
                        .range(vk::WHOLE_SIZE);

                    buffer_infos.push(buffer_info);

                    vk::WriteDescriptorSet::builder()
                        .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                        .dst_binding(write.binding)
                        .dst_set(self.inner)
                        .buffer_info(std::slice::from_ref(buffer_infos.last().unwrap()))
                        .build()
                }
                StorageBufferArray { buffers } => {
                    let infos = buffers
                        .iter()
                        .map(|b| {
                            vk::DescriptorBufferInfo::builder()
                                .buffer(b.inner)
                                .range(vk::WHOLE_SIZE)
                                .build()
                        })
                        .collect::<Vec<_>>();

                    buffer_array_infos.push(infos);

                    vk::WriteDescriptorSet::builder()
                        .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                        .dst_binding(write.binding)
                        .dst_set(self.inner)
                        .buffer_info(buffer_array_infos.last().unwrap())
                        .build()
                }
                CombinedImageSamplerArray {
                    views,
                    sampler,
                    layout,
                } => {
                    let infos = views
                        .iter()
                        .map(|v| {
                            vk::DescriptorImageInfo::builder()
                                .image_view(v.inner)
                                .sampler(sampler.inner)
                                .image_layout(layout)
                                .build()
                        })
                        .collect::<Vec<_>>();

                    img_array_infos.push(infos);

                    vk::WriteDescriptorSet::builder()
                        .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                        .dst_binding(write.binding)
                        .dst_set(self.inner)
                        .image_info(img_array_infos.last().unwrap())
                        .build()
                }
            })
            .collect::<Vec<_>>();

        unsafe {
            self.device
                .inner
                .update_descriptor_sets(&descriptor_writes, &[])
        };
    }
}

impl Context {
    pub fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> Result<DescriptorSetLayout> {
        DescriptorSetLayout::new(self.device.clone(), bindings)
    }

    pub fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<DescriptorPool> {
        DescriptorPool::new(self.device.clone(), max_sets, pool_sizes)
    }
}

#[derive(Clone, Copy)]
pub struct WriteDescriptorSet<'a> {
    pub binding: u32,
    pub kind: WriteDescriptorSetKind<'a>,
}

#[derive(Clone, Copy)]
pub enum WriteDescriptorSetKind<'a> {
    StorageImage {
        view: &'a ImageView,
        layout: vk::ImageLayout,
    },
    AccelerationStructure {
        top_level: &'a TopLevelBvh,
    },
    UniformBuffer {
        buffer: &'a Buffer,
    },
    StorageBuffer {
        buffer: &'a Buffer,
    },
    StorageBufferArray {
        buffers: &'a [&'a Buffer],
    },
    CombinedImageSamplerArray {
        views: &'a [&'a ImageView],
        sampler: &'a Sampler,
        layout: vk::ImageLayout,
    },
}

use std::{
    mem::{align_of, size_of_val},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use anyhow::{anyhow, ensure, Result};
use ash::vk;
use gpu_allocator::vulkan::AllocationScheme;
use gpu_allocator::{
    vulkan::{Allocation, AllocationCreateDesc, Allocator},
    MemoryLocation,
};

use crate::{device::Device, Context};

/// Owning handle over a buffer and its memory. Host-visible buffers
/// (`MemoryLocation::CpuToGpu`) support scoped `map`/`unmap` access;
/// device-local buffers refuse to map.
pub struct Buffer {
    device: Arc<Device>,
    allocator: Arc<Mutex<Allocator>>,
    pub(crate) inner: vk::Buffer,
    allocation: Option<Allocation>,
    pub size: vk::DeviceSize,
    mapped: AtomicBool,
}

impl Buffer {
    pub(crate) fn new(
        device: Arc<Device>,
        allocator: Arc<Mutex<Allocator>>,
        usage: vk::BufferUsageFlags,
        memory_location: MemoryLocation,
        size: vk::DeviceSize,
    ) -> Result<Self> {
        let create_info = vk::BufferCreateInfo::builder().size(size).usage(usage);
        let inner = unsafe { device.inner.create_buffer(&create_info, None)? };
        let requirements = unsafe { device.inner.get_buffer_memory_requirements(inner) };
        let allocation = allocator.lock().unwrap().allocate(&AllocationCreateDesc {
            name: "buffer",
            requirements,
            location: memory_location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;

        unsafe {
            device
                .inner
                .bind_buffer_memory(inner, allocation.memory(), allocation.offset())?
        };

        Ok(Self {
            device,
            allocator,
            inner,
            allocation: Some(allocation),
            size,
            mapped: AtomicBool::new(false),
        })
    }

    /// Begin a scoped host mapping. Fails on device-local buffers and while
    /// another mapping is open. The pointer stays valid until `unmap`.
    pub fn map(&self) -> Result<*mut u8> {
        let ptr = self
            .allocation
            .as_ref()
            .unwrap()
            .mapped_ptr()
            .ok_or_else(|| anyhow!("cannot map a buffer that is not host-visible"))?;

        ensure!(
            !self.mapped.swap(true, Ordering::Acquire),
            "buffer is already mapped"
        );

        Ok(ptr.as_ptr() as *mut u8)
    }

    pub fn unmap(&self) -> Result<()> {
        ensure!(
            self.mapped.swap(false, Ordering::Release),
            "unmap without a matching map"
        );

        Ok(())
    }

    pub fn copy_data_to_buffer<T: Copy>(&self, data: &[T]) -> Result<()> {
        let ptr = self.map()?;
        unsafe {
            let mut align = ash::util::Align::new(
                ptr as *mut std::ffi::c_void,
                align_of::<T>() as _,
                size_of_val(data) as _,
            );
            align.copy_from_slice(data);
        };
        self.unmap()?;

        Ok(())
    }

    pub fn get_device_address(&self) -> u64 {
        let addr_info = vk::BufferDeviceAddressInfo::builder().buffer(self.inner);
        unsafe { self.device.inner.get_buffer_device_address(&addr_info) }
    }
}

impl Context {
    pub fn create_buffer(
        &self,
        usage: vk::BufferUsageFlags,
        memory_location: MemoryLocation,
        size: vk::DeviceSize,
    ) -> Result<Buffer> {
        Buffer::new(
            self.device.clone(),
            self.allocator.clone(),
            usage,
            memory_location,
            size,
        )
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe { self.device.inner.destroy_buffer(self.inner, None) };
        self.allocator
            .lock()
            .unwrap()
            .free(self.allocation.take().unwrap())
            .unwrap();
    }
}

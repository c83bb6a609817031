use std::sync::Arc;

use anyhow::Result;
use ash::vk;

use crate::{Context, Device};

pub struct TimestampQueryPool<const C: usize> {
    device: Arc<Device>,
    pub(crate) inner: vk::QueryPool,
    timestamp_period: f64,
}

impl<const C: usize> TimestampQueryPool<C> {
    pub(crate) fn new(device: Arc<Device>, timestamp_period: f64) -> Result<Self> {
        let create_info = vk::QueryPoolCreateInfo::builder()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(C as _);

        let inner = unsafe { device.inner.create_query_pool(&create_info, None)? };

        Ok(Self {
            device,
            inner,
            timestamp_period,
        })
    }

    /// Blocks until all C timestamps are available; results are in
    /// nanoseconds, already scaled by the device timestamp period.
    pub fn wait_for_all_results(&self) -> Result<[u64; C]> {
        let mut data = [0u64; C];

        unsafe {
            self.device.inner.get_query_pool_results(
                self.inner,
                0,
                C as _,
                &mut data,
                vk::QueryResultFlags::WAIT | vk::QueryResultFlags::TYPE_64,
            )?;
        }

        let mut result = [0u64; C];
        for (index, timestamp) in data.iter().enumerate() {
            result[index] = (*timestamp as f64 * self.timestamp_period) as u64;
        }

        Ok(result)
    }
}

impl<const C: usize> Drop for TimestampQueryPool<C> {
    fn drop(&mut self) {
        unsafe {
            self.device.inner.destroy_query_pool(self.inner, None);
        }
    }
}

/// Query pool holding post-build compacted sizes of acceleration
/// structures. The build records the size; the compaction pass reads it
/// back with a waiting query.
pub struct CompactedSizeQueryPool {
    device: Arc<Device>,
    pub(crate) inner: vk::QueryPool,
}

impl CompactedSizeQueryPool {
    pub(crate) fn new(device: Arc<Device>, query_count: u32) -> Result<Self> {
        let create_info = vk::QueryPoolCreateInfo::builder()
            .query_type(vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR)
            .query_count(query_count);

        let inner = unsafe { device.inner.create_query_pool(&create_info, None)? };

        Ok(Self { device, inner })
    }

    pub fn wait_for_result(&self, query_index: u32) -> Result<u64> {
        let mut data = [0u64; 1];

        unsafe {
            self.device.inner.get_query_pool_results(
                self.inner,
                query_index,
                1,
                &mut data,
                vk::QueryResultFlags::WAIT | vk::QueryResultFlags::TYPE_64,
            )?;
        }

        Ok(data[0])
    }
}

impl Drop for CompactedSizeQueryPool {
    fn drop(&mut self) {
        unsafe {
            self.device.inner.destroy_query_pool(self.inner, None);
        }
    }
}

impl Context {
    pub fn create_timestamp_query_pool<const C: usize>(&self) -> Result<TimestampQueryPool<C>> {
        TimestampQueryPool::new(
            self.device.clone(),
            self.physical_device.limits.timestamp_period as _,
        )
    }

    pub fn create_compacted_size_query_pool(
        &self,
        query_count: u32,
    ) -> Result<CompactedSizeQueryPool> {
        CompactedSizeQueryPool::new(self.device.clone(), query_count)
    }
}

use std::ffi::CStr;

use anyhow::Result;
use ash::{vk, Instance};

use crate::{device::DeviceFeatures, queue::QueueFamily};

#[derive(Debug, Clone)]
pub struct PhysicalDevice {
    pub(crate) inner: vk::PhysicalDevice,
    pub(crate) name: String,
    pub(crate) device_type: vk::PhysicalDeviceType,
    pub(crate) limits: vk::PhysicalDeviceLimits,
    pub(crate) queue_families: Vec<QueueFamily>,
    pub(crate) supported_extensions: Vec<String>,
    pub(crate) supported_device_features: DeviceFeatures,
    pub(crate) memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl PhysicalDevice {
    pub(crate) fn new(instance: &Instance, inner: vk::PhysicalDevice) -> Result<Self> {
        let props = unsafe { instance.get_physical_device_properties(inner) };

        let name = unsafe {
            CStr::from_ptr(props.device_name.as_ptr())
                .to_str()
                .unwrap()
                .to_owned()
        };

        let device_type = props.device_type;
        let limits = props.limits;

        let queue_family_properties =
            unsafe { instance.get_physical_device_queue_family_properties(inner) };
        let queue_families = queue_family_properties
            .into_iter()
            .enumerate()
            .map(|(index, p)| QueueFamily::new(index as _, p))
            .collect();

        let extension_properties =
            unsafe { instance.enumerate_device_extension_properties(inner)? };
        let supported_extensions = extension_properties
            .into_iter()
            .map(|p| {
                let name = unsafe { CStr::from_ptr(p.extension_name.as_ptr()) };
                name.to_str().unwrap().to_owned()
            })
            .collect();

        let mut ray_tracing_feature = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
        let mut acceleration_struct_feature =
            vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
        let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut features13 = vk::PhysicalDeviceVulkan13Features::default();
        let mut features = vk::PhysicalDeviceFeatures2::builder()
            .push_next(&mut ray_tracing_feature)
            .push_next(&mut acceleration_struct_feature)
            .push_next(&mut features12)
            .push_next(&mut features13);
        unsafe { instance.get_physical_device_features2(inner, &mut features) };

        let supported_device_features = DeviceFeatures {
            ray_tracing_pipeline: ray_tracing_feature.ray_tracing_pipeline == vk::TRUE,
            acceleration_structure: acceleration_struct_feature.acceleration_structure == vk::TRUE,
            runtime_descriptor_array: features12.runtime_descriptor_array == vk::TRUE,
            buffer_device_address: features12.buffer_device_address == vk::TRUE,
            synchronization2: features13.synchronization2 == vk::TRUE,
        };

        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(inner) };

        Ok(Self {
            inner,
            name,
            device_type,
            limits,
            queue_families,
            supported_extensions,
            supported_device_features,
            memory_properties,
        })
    }

    pub fn supports_extensions(&self, extensions: &[&str]) -> bool {
        let supported_extensions = self
            .supported_extensions
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>();
        extensions.iter().all(|e| supported_extensions.contains(e))
    }

    /// First memory type index matching both the type filter and all
    /// requested property flags. There is no fallback when none matches.
    pub fn memory_type_index(
        &self,
        type_filter: u32,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<u32> {
        (0..self.memory_properties.memory_type_count)
            .find(|&i| {
                type_filter & (1 << i) != 0
                    && self.memory_properties.memory_types[i as usize]
                        .property_flags
                        .contains(properties)
            })
            .ok_or_else(|| anyhow::anyhow!("no memory type satisfies {properties:?}"))
    }
}

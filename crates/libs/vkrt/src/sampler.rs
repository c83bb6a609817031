use std::sync::Arc;

use anyhow::Result;
use ash::vk;

use crate::{device::Device, Context};

/// Sampler shared by every scene texture: linear filtering with repeat
/// addressing. Nothing in the backend needs per-texture sampler state, so
/// there is no configurable variant.
pub struct Sampler {
    device: Arc<Device>,
    pub(crate) inner: vk::Sampler,
}

impl Sampler {
    pub(crate) fn linear_repeat(device: Arc<Device>) -> Result<Self> {
        let create_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT);
        let inner = unsafe { device.inner.create_sampler(&create_info, None)? };

        Ok(Self { device, inner })
    }
}

impl Context {
    pub fn create_texture_sampler(&self) -> Result<Sampler> {
        Sampler::linear_repeat(self.device.clone())
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        unsafe {
            self.device.inner.destroy_sampler(self.inner, None);
        }
    }
}

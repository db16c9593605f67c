// Texture samplers

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;

pub struct Sampler {
    device: Arc<VulkanDevice>,
    pub sampler: vk::Sampler,
}

impl Sampler {
    /// Filtered, repeating sampler for map textures
    pub fn linear(device: &Arc<VulkanDevice>) -> Result<Self> {
        Self::new(device, vk::Filter::LINEAR, vk::SamplerAddressMode::REPEAT)
    }

    /// Unfiltered, clamped sampler for reading G-buffer targets texel exact
    pub fn nearest(device: &Arc<VulkanDevice>) -> Result<Self> {
        Self::new(device, vk::Filter::NEAREST, vk::SamplerAddressMode::CLAMP_TO_EDGE)
    }

    fn new(device: &Arc<VulkanDevice>, filter: vk::Filter, address_mode: vk::SamplerAddressMode) -> Result<Self> {
        let mipmap_mode = if filter == vk::Filter::LINEAR {
            vk::SamplerMipmapMode::LINEAR
        } else {
            vk::SamplerMipmapMode::NEAREST
        };

        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(filter)
            .min_filter(filter)
            .mipmap_mode(mipmap_mode)
            .address_mode_u(address_mode)
            .address_mode_v(address_mode)
            .address_mode_w(address_mode)
            .anisotropy_enable(false)
            .compare_enable(false)
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE)
            .border_color(vk::BorderColor::FLOAT_OPAQUE_BLACK)
            .unnormalized_coordinates(false);

        let sampler = unsafe { device.device.create_sampler(&sampler_info, None) }
            .context("Failed to create sampler")?;

        Ok(Self {
            device: device.clone(),
            sampler,
        })
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_sampler(self.sampler, None);
        }
    }
}

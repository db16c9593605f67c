// Bindless texture registry
//
// A single variable-count COMBINED_IMAGE_SAMPLER array (set 1, binding 0)
// holding every texture of the loaded map. Texture k of a push lives at
// array element k until the next push replaces it.

use anyhow::Result;
use ash::vk;
use std::ops::Range;
use std::sync::Arc;

use crate::backend::descriptor::{DescriptorPool, DescriptorSetLayout};
use crate::backend::VulkanDevice;
use crate::error::RenderError;

/// Index bookkeeping for the bindless array
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindlessSlots {
    capacity: u32,
    bound: u32,
}

impl BindlessSlots {
    /// Capacity is the configured size, limited by what the driver accepts
    pub fn new(configured: u32, device_limit: u32) -> Self {
        let capacity = configured.min(device_limit).max(1);
        if capacity < configured {
            log::warn!(
                "Bindless capacity limited to {} by the device (configured {})",
                capacity,
                configured
            );
        }
        Self { capacity, bound: 0 }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of elements currently holding a texture
    #[cfg(test)]
    pub fn bound(&self) -> u32 {
        self.bound
    }

    pub fn check_capacity(&self, count: usize) -> Result<(), RenderError> {
        if count > self.capacity as usize {
            return Err(RenderError::BindlessCapacityExceeded {
                requested: count,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// Elements for a push of `count` textures, texture k at element k
    pub fn assign(&mut self, count: usize) -> Result<Range<u32>, RenderError> {
        self.check_capacity(count)?;
        self.bound = count as u32;
        Ok(0..self.bound)
    }

    pub fn reset(&mut self) {
        self.bound = 0;
    }
}

pub struct BindlessRegistry {
    device: Arc<VulkanDevice>,
    pub set: vk::DescriptorSet,
    pub slots: BindlessSlots,
    _pool: DescriptorPool,
    pub layout: DescriptorSetLayout,
}

impl BindlessRegistry {
    pub fn new(device: &Arc<VulkanDevice>, configured_capacity: u32) -> Result<Self> {
        let slots = BindlessSlots::new(configured_capacity, device.bindless_limit);
        let capacity = slots.capacity();

        let bindings = [vk::DescriptorSetLayoutBinding::default()
            .binding(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(capacity)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)];
        let binding_flags = [vk::DescriptorBindingFlags::PARTIALLY_BOUND
            | vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT
            | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND];

        let layout = DescriptorSetLayout::new(
            device,
            &bindings,
            vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL,
            &binding_flags,
        )?;

        let sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: capacity,
        }];
        let pool = DescriptorPool::new(
            device,
            1,
            &sizes,
            vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND,
        )?;

        let set = pool.allocate_variable(layout.layout, capacity)?;

        log::info!("Bindless texture array: {} slots", capacity);

        Ok(Self {
            device: device.clone(),
            set,
            slots,
            _pool: pool,
            layout,
        })
    }

    /// Point elements 0..views.len() at the given textures. The previous
    /// map's elements past the new count stay stale but are never indexed.
    pub fn bind_textures(&mut self, views: &[vk::ImageView], sampler: vk::Sampler) -> Result<()> {
        let elements = self.slots.assign(views.len())?;
        if views.is_empty() {
            return Ok(());
        }

        let image_infos: Vec<[vk::DescriptorImageInfo; 1]> = views
            .iter()
            .map(|&view| {
                [vk::DescriptorImageInfo {
                    sampler,
                    image_view: view,
                    image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                }]
            })
            .collect();

        let writes: Vec<vk::WriteDescriptorSet> = elements
            .zip(&image_infos)
            .map(|(element, info)| {
                vk::WriteDescriptorSet::default()
                    .dst_set(self.set)
                    .dst_binding(0)
                    .dst_array_element(element)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .image_info(info)
            })
            .collect();

        unsafe { self.device.device.update_descriptor_sets(&writes, &[]) };

        log::debug!("Bound {} textures into the bindless array", views.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_is_min_of_config_and_device() {
        assert_eq!(BindlessSlots::new(16536, 500_000).capacity(), 16536);
        assert_eq!(BindlessSlots::new(16536, 4096).capacity(), 4096);
        assert_eq!(BindlessSlots::new(0, 4096).capacity(), 1);
    }

    #[test]
    fn texture_k_gets_element_k() {
        let mut slots = BindlessSlots::new(8, 8);
        let elements: Vec<u32> = slots.assign(3).unwrap().collect();
        assert_eq!(elements, vec![0, 1, 2]);
        assert_eq!(slots.bound(), 3);

        // A later push restarts at element 0
        let elements: Vec<u32> = slots.assign(2).unwrap().collect();
        assert_eq!(elements, vec![0, 1]);
    }

    #[test]
    fn over_capacity_push_keeps_previous_binding() {
        let mut slots = BindlessSlots::new(4, 4);
        slots.assign(2).unwrap();

        let err = slots.assign(5).unwrap_err();
        assert!(matches!(
            err,
            RenderError::BindlessCapacityExceeded { requested: 5, capacity: 4 }
        ));
        assert_eq!(slots.bound(), 2);

        assert!(slots.check_capacity(4).is_ok());
        slots.reset();
        assert_eq!(slots.bound(), 0);
    }
}

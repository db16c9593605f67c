// Global uniform buffer - camera + actor transforms
//
// One host-visible copy per frame in flight, bound at set 0 binding 0 by
// both the G-buffer and the shading pipeline. Layout mirrors the std140
// `Global` block in the shaders.

use anyhow::Result;
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use crate::backend::descriptor::{DescriptorPool, DescriptorSetLayout};
use crate::backend::memory::BufferDesc;
use crate::backend::sync::FRAMES_IN_FLIGHT;
use crate::backend::{GpuBuffer, VulkanDevice};
use crate::scene::{ActorTransform, FrameState, MAX_ACTORS};

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ActorUniform {
    pub model: Mat4,
    pub inv_model: Mat4,
}

impl From<&ActorTransform> for ActorUniform {
    fn from(actor: &ActorTransform) -> Self {
        Self {
            model: actor.model,
            inv_model: actor.inv_model,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GlobalUbo {
    pub proj: Mat4,
    pub view: Mat4,
    pub view_proj: Mat4,
    /// xyz = world-space view direction
    pub view_dir: Vec4,
    /// xy = render extent in pixels
    pub view_dim: Vec4,
    pub actors: [ActorUniform; MAX_ACTORS],
}

impl GlobalUbo {
    pub fn new(frame: &FrameState, extent: vk::Extent2D) -> Self {
        if frame.actors.len() > MAX_ACTORS {
            log::warn!(
                "{} actors in frame, only the first {} are uploaded",
                frame.actors.len(),
                MAX_ACTORS
            );
        }

        let mut ubo = Self::zeroed();
        ubo.proj = frame.proj;
        ubo.view = frame.view;
        ubo.view_proj = frame.view_proj();
        ubo.view_dir = frame.view_dir().extend(0.0);
        ubo.view_dim = Vec4::new(extent.width as f32, extent.height as f32, 0.0, 0.0);

        for (slot, actor) in ubo.actors.iter_mut().zip(&frame.actors) {
            *slot = ActorUniform::from(actor);
        }
        ubo
    }

    pub const SIZE: vk::DeviceSize = std::mem::size_of::<Self>() as vk::DeviceSize;
}

/// Set layout and pool for the per-frame UBO descriptor sets
pub struct GlobalUniforms {
    pool: DescriptorPool,
    pub layout: DescriptorSetLayout,
}

impl GlobalUniforms {
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Self> {
        let bindings = [vk::DescriptorSetLayoutBinding::default()
            .binding(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(
                vk::ShaderStageFlags::VERTEX
                    | vk::ShaderStageFlags::FRAGMENT
                    | vk::ShaderStageFlags::COMPUTE,
            )];
        let layout = DescriptorSetLayout::new(
            device,
            &bindings,
            vk::DescriptorSetLayoutCreateFlags::empty(),
            &[],
        )?;

        let sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: FRAMES_IN_FLIGHT as u32,
        }];
        let pool = DescriptorPool::new(
            device,
            FRAMES_IN_FLIGHT as u32,
            &sizes,
            vk::DescriptorPoolCreateFlags::empty(),
        )?;

        Ok(Self { pool, layout })
    }

    /// UBO buffer for one frame slot and the set pointing at it
    pub fn create_frame_binding(&self, device: &Arc<VulkanDevice>, slot: usize) -> Result<(GpuBuffer, vk::DescriptorSet)> {
        let name = format!("global ubo {}", slot);
        let buffer = GpuBuffer::new(
            device,
            &BufferDesc {
                name: &name,
                size: GlobalUbo::SIZE,
                usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
                location: MemoryLocation::CpuToGpu,
                shared: false,
            },
        )?;

        let set = self.pool.allocate(&[self.layout.layout])?[0];

        let buffer_info = [vk::DescriptorBufferInfo {
            buffer: buffer.buffer,
            offset: 0,
            range: GlobalUbo::SIZE,
        }];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .buffer_info(&buffer_info);

        unsafe { device.device.update_descriptor_sets(&[write], &[]) };

        Ok((buffer, set))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use glam::Vec3;

    #[test]
    fn layout_matches_std140_block() {
        assert_eq!(std::mem::size_of::<ActorUniform>(), 128);
        assert_eq!(std::mem::offset_of!(GlobalUbo, view_dir), 192);
        assert_eq!(std::mem::offset_of!(GlobalUbo, view_dim), 208);
        assert_eq!(std::mem::offset_of!(GlobalUbo, actors), 224);
        assert_eq!(GlobalUbo::SIZE, 224 + 64 * 128);
    }

    #[test]
    fn camera_and_extent_are_copied() {
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y);
        let proj = Mat4::perspective_rh(1.0, 2.0, 0.1, 100.0);
        let frame = FrameState::new(view, proj);

        let ubo = GlobalUbo::new(&frame, vk::Extent2D { width: 1920, height: 1080 });
        assert_eq!(ubo.view_proj, proj * view);
        assert_eq!(ubo.view_dim.x, 1920.0);
        assert_eq!(ubo.view_dim.y, 1080.0);
        assert_relative_eq!(ubo.view_dir.z, -1.0, epsilon = 1e-5);
        assert_eq!(ubo.view_dir.w, 0.0);
    }

    #[test]
    fn actors_fill_leading_slots_and_excess_is_dropped() {
        let mut frame = FrameState::new(Mat4::IDENTITY, Mat4::IDENTITY);
        frame.actors = (0..MAX_ACTORS + 3)
            .map(|i| ActorTransform::new(Mat4::from_translation(Vec3::splat(i as f32 + 1.0))))
            .collect();

        let ubo = GlobalUbo::new(&frame, vk::Extent2D { width: 1, height: 1 });
        assert_eq!(ubo.actors[0].model, frame.actors[0].model);
        assert_eq!(ubo.actors[MAX_ACTORS - 1].inv_model, frame.actors[MAX_ACTORS - 1].inv_model);

        let empty = GlobalUbo::new(&FrameState::new(Mat4::IDENTITY, Mat4::IDENTITY), vk::Extent2D { width: 1, height: 1 });
        assert_eq!(empty.actors[0].model, Mat4::ZERO);
    }
}

// Shading pass - deferred lighting in a compute shader
//
// Reads the G-buffer through the "hold" descriptor set, writes an RGBA16F
// storage image, then blits it into the acquired swapchain image.

use anyhow::Result;
use ash::vk;
use bytemuck::{Pod, Zeroable};
use std::path::Path;
use std::sync::Arc;

use crate::backend::barrier::{self, FirstUse, ImageBarrier, LayoutChange};
use crate::backend::descriptor::{DescriptorPool, DescriptorSetLayout};
use crate::backend::memory::{subresource_range, ImageDesc};
use crate::backend::pipeline::{self, Pipeline};
use crate::backend::sampler::Sampler;
use crate::backend::shader::{ShaderModule, SHADING_COMP};
use crate::backend::{GpuImage, VulkanDevice};
use crate::renderer::gbuffer::{GBuffer, GBufferTargets};

pub const OUTPUT_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;

/// Matches `local_size_x/y` in shading.comp
pub const WORKGROUP_SIZE: u32 = 16;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct ShadingPush {
    pub frame: u32,
}

/// Workgroups covering every pixel of `extent`
pub fn dispatch_size(extent: vk::Extent2D) -> (u32, u32) {
    (
        extent.width.div_ceil(WORKGROUP_SIZE),
        extent.height.div_ceil(WORKGROUP_SIZE),
    )
}

/// Output made writable for the dispatch. The first use only needs a layout
/// change; later frames wait for the previous frame's blit to finish reading.
pub fn output_transition(initialized: bool) -> LayoutChange {
    if initialized {
        LayoutChange {
            old_layout: vk::ImageLayout::GENERAL,
            new_layout: vk::ImageLayout::GENERAL,
            src_stage: vk::PipelineStageFlags::TRANSFER,
            src_access: vk::AccessFlags::empty(),
            dst_stage: vk::PipelineStageFlags::COMPUTE_SHADER,
            dst_access: vk::AccessFlags::SHADER_WRITE,
        }
    } else {
        LayoutChange {
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::GENERAL,
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            src_access: vk::AccessFlags::empty(),
            dst_stage: vk::PipelineStageFlags::COMPUTE_SHADER,
            dst_access: vk::AccessFlags::SHADER_WRITE,
        }
    }
}

/// Compute writes made visible to the blit
pub const OUTPUT_TO_BLIT_SRC: LayoutChange = LayoutChange {
    old_layout: vk::ImageLayout::GENERAL,
    new_layout: vk::ImageLayout::GENERAL,
    src_stage: vk::PipelineStageFlags::COMPUTE_SHADER,
    src_access: vk::AccessFlags::SHADER_WRITE,
    dst_stage: vk::PipelineStageFlags::TRANSFER,
    dst_access: vk::AccessFlags::TRANSFER_READ,
};

/// Acquired swapchain image; chained to the present-semaphore wait, which
/// happens at the transfer stage
pub const SWAPCHAIN_TO_BLIT_DST: LayoutChange = LayoutChange {
    old_layout: vk::ImageLayout::UNDEFINED,
    new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
    src_stage: vk::PipelineStageFlags::TRANSFER,
    src_access: vk::AccessFlags::empty(),
    dst_stage: vk::PipelineStageFlags::TRANSFER,
    dst_access: vk::AccessFlags::TRANSFER_WRITE,
};

pub const SWAPCHAIN_TO_PRESENT: LayoutChange = LayoutChange {
    old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
    new_layout: vk::ImageLayout::PRESENT_SRC_KHR,
    src_stage: vk::PipelineStageFlags::TRANSFER,
    src_access: vk::AccessFlags::TRANSFER_WRITE,
    dst_stage: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
    dst_access: vk::AccessFlags::empty(),
};

/// Stage the frame submission waits on the present semaphore
pub const PRESENT_WAIT_STAGE: vk::PipelineStageFlags = vk::PipelineStageFlags::TRANSFER;

pub struct ShadingPass {
    device: Arc<VulkanDevice>,
    pipeline: Pipeline,
    hold_set: vk::DescriptorSet,
    _pool: DescriptorPool,
    _layout: DescriptorSetLayout,
    sampler: Sampler,
    pub output: GpuImage,
    output_layout: FirstUse,
}

impl ShadingPass {
    pub fn new(
        device: &Arc<VulkanDevice>,
        shader_dir: &Path,
        global_layout: vk::DescriptorSetLayout,
        targets: &GBufferTargets,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let sampled = |binding: u32| {
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::COMPUTE)
        };
        let bindings = [
            vk::DescriptorSetLayoutBinding::default()
                .binding(0)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::COMPUTE),
            sampled(1),
            sampled(2),
            sampled(3),
            sampled(4),
        ];
        let layout = DescriptorSetLayout::new(
            device,
            &bindings,
            vk::DescriptorSetLayoutCreateFlags::empty(),
            &[],
        )?;

        let sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_IMAGE,
                descriptor_count: 1,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: 4,
            },
        ];
        let pool = DescriptorPool::new(device, 1, &sizes, vk::DescriptorPoolCreateFlags::empty())?;
        let hold_set = pool.allocate(&[layout.layout])?[0];

        let shader = ShaderModule::load(device, shader_dir, SHADING_COMP)?;
        let pipeline = pipeline::create_compute_pipeline(
            device,
            &shader,
            &[global_layout, layout.layout],
            std::mem::size_of::<ShadingPush>() as u32,
        )?;

        let sampler = Sampler::nearest(device)?;
        let output = Self::create_output(device, extent)?;

        let pass = Self {
            device: device.clone(),
            pipeline,
            hold_set,
            _pool: pool,
            _layout: layout,
            sampler,
            output,
            output_layout: FirstUse::default(),
        };
        pass.write_hold_set(targets);
        Ok(pass)
    }

    fn create_output(device: &Arc<VulkanDevice>, extent: vk::Extent2D) -> Result<GpuImage> {
        GpuImage::new(
            device,
            &ImageDesc {
                name: "shading output",
                extent,
                format: OUTPUT_FORMAT,
                usage: vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC,
                aspect: vk::ImageAspectFlags::COLOR,
                shared: false,
            },
        )
    }

    fn write_hold_set(&self, targets: &GBufferTargets) {
        let output_info = [vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: self.output.view,
            image_layout: vk::ImageLayout::GENERAL,
        }];
        let sampled_infos: Vec<[vk::DescriptorImageInfo; 1]> = [
            targets.position.view,
            targets.normal.view,
            targets.albedo.view,
            targets.depth.view,
        ]
        .iter()
        .map(|&view| {
            [vk::DescriptorImageInfo {
                sampler: self.sampler.sampler,
                image_view: view,
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            }]
        })
        .collect();

        let mut writes = vec![vk::WriteDescriptorSet::default()
            .dst_set(self.hold_set)
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
            .image_info(&output_info)];
        for (binding, info) in (1u32..).zip(&sampled_infos) {
            writes.push(
                vk::WriteDescriptorSet::default()
                    .dst_set(self.hold_set)
                    .dst_binding(binding)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .image_info(info),
            );
        }

        unsafe { self.device.device.update_descriptor_sets(&writes, &[]) };
    }

    /// New output for `extent` and point the hold set at the new G-buffer
    /// targets; the GPU must be idle
    pub fn resize(&mut self, targets: &GBufferTargets, extent: vk::Extent2D) -> Result<()> {
        self.output = Self::create_output(&self.device, extent)?;
        self.output_layout = FirstUse::default();
        self.write_hold_set(targets);
        Ok(())
    }

    /// The last recording reached the queue
    pub fn commit_layouts(&mut self) {
        self.output_layout.commit();
    }

    pub fn discard_layouts(&mut self) {
        self.output_layout.discard();
    }

    /// Dispatch the lighting shader and blit the result into `swapchain_image`
    pub fn record(
        &mut self,
        cmd: vk::CommandBuffer,
        global_set: vk::DescriptorSet,
        gbuffer: &GBuffer,
        frame: u64,
        swapchain_image: vk::Image,
        swapchain_extent: vk::Extent2D,
    ) {
        let device = &self.device.device;
        let color = subresource_range(vk::ImageAspectFlags::COLOR);

        gbuffer.record_read_transitions(cmd);
        barrier::record(
            device,
            cmd,
            &[ImageBarrier {
                image: self.output.image,
                range: color,
                change: output_transition(self.output_layout.record()),
            }],
        );

        let push = ShadingPush { frame: frame as u32 };
        let (groups_x, groups_y) = dispatch_size(self.output.extent);

        unsafe {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, self.pipeline.pipeline);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                self.pipeline.layout,
                0,
                &[global_set, self.hold_set],
                &[],
            );
            device.cmd_push_constants(
                cmd,
                self.pipeline.layout,
                vk::ShaderStageFlags::COMPUTE,
                0,
                bytemuck::bytes_of(&push),
            );
            device.cmd_dispatch(cmd, groups_x, groups_y, 1);
        }

        barrier::record(
            device,
            cmd,
            &[
                ImageBarrier {
                    image: self.output.image,
                    range: color,
                    change: OUTPUT_TO_BLIT_SRC,
                },
                ImageBarrier {
                    image: swapchain_image,
                    range: color,
                    change: SWAPCHAIN_TO_BLIT_DST,
                },
            ],
        );

        let layers = vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        };
        let corner = |extent: vk::Extent2D| vk::Offset3D {
            x: extent.width as i32,
            y: extent.height as i32,
            z: 1,
        };
        let blit = vk::ImageBlit {
            src_subresource: layers,
            src_offsets: [vk::Offset3D::default(), corner(self.output.extent)],
            dst_subresource: layers,
            dst_offsets: [vk::Offset3D::default(), corner(swapchain_extent)],
        };

        unsafe {
            device.cmd_blit_image(
                cmd,
                self.output.image,
                vk::ImageLayout::GENERAL,
                swapchain_image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[blit],
                vk::Filter::NEAREST,
            );
        }

        barrier::record(
            device,
            cmd,
            &[ImageBarrier {
                image: swapchain_image,
                range: color,
                change: SWAPCHAIN_TO_PRESENT,
            }],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_covers_partial_tiles() {
        assert_eq!(dispatch_size(vk::Extent2D { width: 1920, height: 1080 }), (120, 68));
        assert_eq!(dispatch_size(vk::Extent2D { width: 16, height: 16 }), (1, 1));
        assert_eq!(dispatch_size(vk::Extent2D { width: 17, height: 1 }), (2, 1));
        assert_eq!(dispatch_size(vk::Extent2D { width: 0, height: 0 }), (0, 0));
    }

    #[test]
    fn output_leaves_undefined_only_once() {
        let first = output_transition(false);
        assert_eq!(first.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(first.new_layout, vk::ImageLayout::GENERAL);

        let later = output_transition(true);
        assert_eq!(later.old_layout, vk::ImageLayout::GENERAL);
        assert_eq!(later.src_stage, OUTPUT_TO_BLIT_SRC.dst_stage);
    }

    #[test]
    fn swapchain_image_ends_presentable() {
        assert_eq!(SWAPCHAIN_TO_BLIT_DST.new_layout, SWAPCHAIN_TO_PRESENT.old_layout);
        assert_eq!(SWAPCHAIN_TO_PRESENT.new_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(SWAPCHAIN_TO_BLIT_DST.src_stage, PRESENT_WAIT_STAGE);
    }
}

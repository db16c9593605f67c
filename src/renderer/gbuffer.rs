// G-buffer pass - geometry into position / normal / albedo / depth
//
// Rendered with dynamic rendering. Targets are shared by all frames in
// flight; the barriers at the start of the pass order this frame's writes
// after the previous frame's shading reads on the same queue.

use anyhow::Result;
use ash::vk;
use bytemuck::{Pod, Zeroable};
use std::path::Path;
use std::sync::Arc;

use crate::backend::barrier::{self, FirstUse, ImageBarrier, LayoutChange};
use crate::backend::memory::ImageDesc;
use crate::backend::pipeline::{self, GraphicsPipelineDesc, Pipeline};
use crate::backend::shader::{ShaderModule, GBUFFER_FRAG, GBUFFER_VERT};
use crate::backend::{GpuImage, VulkanDevice};
use crate::renderer::map::GpuMap;

pub const POSITION_FORMAT: vk::Format = vk::Format::R32G32B32A32_SFLOAT;
pub const NORMAL_FORMAT: vk::Format = vk::Format::R32G32B32A32_SFLOAT;
pub const ALBEDO_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;
pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

pub const COLOR_FORMATS: [vk::Format; 3] = [POSITION_FORMAT, NORMAL_FORMAT, ALBEDO_FORMAT];

const DEPTH_ATTACHMENT_LAYOUT: vk::ImageLayout = vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct PrimitivePush {
    pub primitive_index: u32,
    pub texture_index: u32,
}

/// Layout changes that make the targets writable: from UNDEFINED right
/// after (re)creation, from the shading pass's read layout afterwards.
/// Returns (color, depth).
pub fn attachment_transitions(initialized: bool) -> (LayoutChange, LayoutChange) {
    let (old_layout, src_stage) = if initialized {
        (vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL, vk::PipelineStageFlags::COMPUTE_SHADER)
    } else {
        (vk::ImageLayout::UNDEFINED, vk::PipelineStageFlags::TOP_OF_PIPE)
    };

    let color = LayoutChange {
        old_layout,
        new_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        src_stage,
        src_access: vk::AccessFlags::empty(),
        dst_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        dst_access: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
    };
    let depth = LayoutChange {
        old_layout,
        new_layout: DEPTH_ATTACHMENT_LAYOUT,
        src_stage,
        src_access: vk::AccessFlags::empty(),
        dst_stage: vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
            | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        dst_access: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
            | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
    };
    (color, depth)
}

/// Attachment writes made visible to compute-shader sampling.
/// Returns (color, depth).
pub fn read_transitions() -> (LayoutChange, LayoutChange) {
    let color = LayoutChange {
        old_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        src_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        src_access: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        dst_stage: vk::PipelineStageFlags::COMPUTE_SHADER,
        dst_access: vk::AccessFlags::SHADER_READ,
    };
    let depth = LayoutChange {
        old_layout: DEPTH_ATTACHMENT_LAYOUT,
        new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        src_stage: vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        src_access: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        dst_stage: vk::PipelineStageFlags::COMPUTE_SHADER,
        dst_access: vk::AccessFlags::SHADER_READ,
    };
    (color, depth)
}

pub struct GBufferTargets {
    pub position: GpuImage,
    pub normal: GpuImage,
    pub albedo: GpuImage,
    pub depth: GpuImage,
}

impl GBufferTargets {
    fn new(device: &Arc<VulkanDevice>, extent: vk::Extent2D) -> Result<Self> {
        let color = |name: &str, format: vk::Format| {
            GpuImage::new(
                device,
                &ImageDesc {
                    name,
                    extent,
                    format,
                    usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
                    aspect: vk::ImageAspectFlags::COLOR,
                    shared: false,
                },
            )
        };

        Ok(Self {
            position: color("gbuffer position", POSITION_FORMAT)?,
            normal: color("gbuffer normal", NORMAL_FORMAT)?,
            albedo: color("gbuffer albedo", ALBEDO_FORMAT)?,
            depth: GpuImage::new(
                device,
                &ImageDesc {
                    name: "gbuffer depth",
                    extent,
                    format: DEPTH_FORMAT,
                    usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
                    aspect: vk::ImageAspectFlags::DEPTH,
                    shared: false,
                },
            )?,
        })
    }

    pub fn colors(&self) -> [&GpuImage; 3] {
        [&self.position, &self.normal, &self.albedo]
    }

    fn barriers(&self, color: LayoutChange, depth: LayoutChange) -> Vec<ImageBarrier> {
        let mut barriers: Vec<ImageBarrier> = self
            .colors()
            .iter()
            .map(|image| ImageBarrier {
                image: image.image,
                range: image.subresource_range(),
                change: color,
            })
            .collect();
        barriers.push(ImageBarrier {
            image: self.depth.image,
            range: self.depth.subresource_range(),
            change: depth,
        });
        barriers
    }
}

pub struct GBuffer {
    device: Arc<VulkanDevice>,
    pub targets: GBufferTargets,
    layouts: FirstUse,
    pipeline: Pipeline,
}

impl GBuffer {
    pub fn new(
        device: &Arc<VulkanDevice>,
        shader_dir: &Path,
        extent: vk::Extent2D,
        global_layout: vk::DescriptorSetLayout,
        bindless_layout: vk::DescriptorSetLayout,
    ) -> Result<Self> {
        let vertex = ShaderModule::load(device, shader_dir, GBUFFER_VERT)?;
        let fragment = ShaderModule::load(device, shader_dir, GBUFFER_FRAG)?;

        let pipeline = pipeline::create_graphics_pipeline(
            device,
            &GraphicsPipelineDesc {
                vertex: &vertex,
                fragment: &fragment,
                set_layouts: &[global_layout, bindless_layout],
                push_constant_size: std::mem::size_of::<PrimitivePush>() as u32,
                color_formats: &COLOR_FORMATS,
                depth_format: DEPTH_FORMAT,
            },
        )?;

        let targets = GBufferTargets::new(device, extent)?;
        log::info!("G-buffer created: {}x{}", extent.width, extent.height);

        Ok(Self {
            device: device.clone(),
            targets,
            layouts: FirstUse::default(),
            pipeline,
        })
    }

    /// Replace the targets; the GPU must be idle
    pub fn resize(&mut self, extent: vk::Extent2D) -> Result<()> {
        self.targets = GBufferTargets::new(&self.device, extent)?;
        self.layouts = FirstUse::default();
        log::info!("G-buffer resized: {}x{}", extent.width, extent.height);
        Ok(())
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.targets.depth.extent
    }

    /// Geometry pass: one indexed draw per primitive of the loaded map
    pub fn record(
        &mut self,
        cmd: vk::CommandBuffer,
        global_set: vk::DescriptorSet,
        bindless_set: vk::DescriptorSet,
        map: Option<&GpuMap>,
    ) {
        let device = &self.device.device;
        let extent = self.extent();

        let (color, depth) = attachment_transitions(self.layouts.record());
        barrier::record(device, cmd, &self.targets.barriers(color, depth));

        let color_attachments: Vec<vk::RenderingAttachmentInfo> = self
            .targets
            .colors()
            .iter()
            .map(|image| {
                vk::RenderingAttachmentInfo::default()
                    .image_view(image.view)
                    .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .load_op(vk::AttachmentLoadOp::CLEAR)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .clear_value(vk::ClearValue {
                        color: vk::ClearColorValue { float32: [0.0; 4] },
                    })
            })
            .collect();
        let depth_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(self.targets.depth.view)
            .image_layout(DEPTH_ATTACHMENT_LAYOUT)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 },
            });

        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        let rendering_info = vk::RenderingInfo::default()
            .render_area(render_area)
            .layer_count(1)
            .color_attachments(&color_attachments)
            .depth_attachment(&depth_attachment);

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };

        unsafe {
            device.cmd_begin_rendering(cmd, &rendering_info);
            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_set_scissor(cmd, 0, &[render_area]);

            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline.pipeline);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline.layout,
                0,
                &[global_set, bindless_set],
                &[],
            );

            for (i, primitive) in map.map(|m| m.primitives.as_slice()).unwrap_or_default().iter().enumerate() {
                let push = PrimitivePush {
                    primitive_index: i as u32,
                    texture_index: primitive.texture_slot,
                };
                device.cmd_push_constants(
                    cmd,
                    self.pipeline.layout,
                    vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                    0,
                    bytemuck::bytes_of(&push),
                );
                device.cmd_bind_vertex_buffers(cmd, 0, &[primitive.vertex_buffer.buffer], &[0]);
                device.cmd_bind_index_buffer(cmd, primitive.index_buffer.buffer, 0, vk::IndexType::UINT32);
                device.cmd_draw_indexed(cmd, primitive.index_count, 1, 0, 0, 0);
            }

            device.cmd_end_rendering(cmd);
        }
    }

    /// The last recording reached the queue
    pub fn commit_layouts(&mut self) {
        self.layouts.commit();
    }

    pub fn discard_layouts(&mut self) {
        self.layouts.discard();
    }

    /// Targets become sampled images for the shading pass
    pub fn record_read_transitions(&self, cmd: vk::CommandBuffer) {
        let (color, depth) = read_transitions();
        barrier::record(&self.device.device, cmd, &self.targets.barriers(color, depth));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_frame_discards_previous_contents() {
        let (color, depth) = attachment_transitions(false);
        assert_eq!(color.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(depth.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(color.new_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(depth.new_layout, DEPTH_ATTACHMENT_LAYOUT);
    }

    #[test]
    fn later_frames_come_from_shading_reads() {
        let (color, depth) = attachment_transitions(true);
        let (read_color, read_depth) = read_transitions();

        assert_eq!(color.old_layout, read_color.new_layout);
        assert_eq!(depth.old_layout, read_depth.new_layout);
        assert!(color.src_stage.contains(read_color.dst_stage));
    }

    #[test]
    fn read_transitions_start_where_attachments_end() {
        let (color, depth) = attachment_transitions(true);
        let (read_color, read_depth) = read_transitions();
        assert_eq!(read_color.old_layout, color.new_layout);
        assert_eq!(read_depth.old_layout, depth.new_layout);
        assert_eq!(read_color.dst_stage, vk::PipelineStageFlags::COMPUTE_SHADER);
    }

    #[test]
    fn push_constants_are_two_words() {
        assert_eq!(std::mem::size_of::<PrimitivePush>(), 8);
        let push = PrimitivePush { primitive_index: 3, texture_index: crate::scene::NO_TEXTURE };
        assert_eq!(bytemuck::bytes_of(&push)[4..], [0xFF; 4]);
    }

    #[test]
    fn formats_match_shader_outputs() {
        assert_eq!(COLOR_FORMATS.len(), 3);
        assert_eq!(COLOR_FORMATS[2], vk::Format::R16G16B16A16_SFLOAT);
        assert_eq!(DEPTH_FORMAT, vk::Format::D32_SFLOAT);
    }
}

// GPU copy of the loaded level
//
// Every primitive and texture owns its buffers/image. Staging buffers are
// kept alongside until the transfer fence is seen signaled.

use anyhow::Result;
use ash::vk;
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use crate::backend::barrier::{self, ImageBarrier, LayoutChange};
use crate::backend::memory::{BufferDesc, ImageDesc};
use crate::backend::{GpuBuffer, GpuImage, VulkanDevice};
use crate::scene::{Primitive, Texture};

/// Sampled format of map textures
pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

pub struct GpuPrimitive {
    pub vertex_buffer: GpuBuffer,
    pub index_buffer: GpuBuffer,
    pub index_count: u32,
    /// Bindless element pushed with this primitive
    pub texture_slot: u32,
}

pub struct GpuTexture {
    pub image: GpuImage,
}

pub struct GpuMap {
    pub primitives: Vec<GpuPrimitive>,
    pub textures: Vec<GpuTexture>,
    staging: Vec<GpuBuffer>,
}

impl GpuMap {
    /// Create every destination resource and record the copies into `cmd`.
    /// Staging memory stays owned by the map until `release_staging`.
    pub fn record_upload(
        device: &Arc<VulkanDevice>,
        cmd: vk::CommandBuffer,
        primitives: &[Primitive],
        textures: &[Texture],
    ) -> Result<Self> {
        let mut map = Self {
            primitives: Vec::with_capacity(primitives.len()),
            textures: Vec::with_capacity(textures.len()),
            staging: Vec::with_capacity(primitives.len() * 2 + textures.len()),
        };

        for (i, primitive) in primitives.iter().enumerate() {
            let gpu_primitive = map.upload_primitive(device, cmd, i, primitive, textures.len())?;
            map.primitives.push(gpu_primitive);
        }

        map.upload_textures(device, cmd, textures)?;

        log::debug!(
            "Recorded upload: {} primitives, {} textures, {} staging buffers",
            map.primitives.len(),
            map.textures.len(),
            map.staging.len()
        );
        Ok(map)
    }

    fn upload_primitive(
        &mut self,
        device: &Arc<VulkanDevice>,
        cmd: vk::CommandBuffer,
        index: usize,
        primitive: &Primitive,
        texture_count: usize,
    ) -> Result<GpuPrimitive> {
        let vertex_buffer = self.upload_buffer(
            device,
            cmd,
            &format!("primitive {} vertices", index),
            bytemuck::cast_slice(&primitive.vertices),
            vk::BufferUsageFlags::VERTEX_BUFFER,
        )?;
        let index_buffer = self.upload_buffer(
            device,
            cmd,
            &format!("primitive {} indices", index),
            bytemuck::cast_slice(&primitive.indices),
            vk::BufferUsageFlags::INDEX_BUFFER,
        )?;

        Ok(GpuPrimitive {
            vertex_buffer,
            index_buffer,
            index_count: primitive.indices.len() as u32,
            texture_slot: primitive.texture_slot(index, texture_count),
        })
    }

    /// GPU-only buffer filled from a fresh staging buffer
    fn upload_buffer(
        &mut self,
        device: &Arc<VulkanDevice>,
        cmd: vk::CommandBuffer,
        name: &str,
        bytes: &[u8],
        usage: vk::BufferUsageFlags,
    ) -> Result<GpuBuffer> {
        let staging = GpuBuffer::staging(device, &format!("{} staging", name), bytes)?;
        let buffer = GpuBuffer::new(
            device,
            &BufferDesc {
                name,
                size: staging.size,
                usage: usage | vk::BufferUsageFlags::TRANSFER_DST,
                location: MemoryLocation::GpuOnly,
                shared: true,
            },
        )?;

        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: staging.size,
        };
        unsafe {
            device
                .device
                .cmd_copy_buffer(cmd, staging.buffer, buffer.buffer, &[region]);
        }

        self.staging.push(staging);
        Ok(buffer)
    }

    fn upload_textures(
        &mut self,
        device: &Arc<VulkanDevice>,
        cmd: vk::CommandBuffer,
        textures: &[Texture],
    ) -> Result<()> {
        if textures.is_empty() {
            return Ok(());
        }

        let mut staged = Vec::with_capacity(textures.len());
        for (i, texture) in textures.iter().enumerate() {
            let image = GpuImage::new(
                device,
                &ImageDesc {
                    name: &format!("texture {}", i),
                    extent: vk::Extent2D {
                        width: texture.width,
                        height: texture.height,
                    },
                    format: TEXTURE_FORMAT,
                    usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
                    aspect: vk::ImageAspectFlags::COLOR,
                    shared: true,
                },
            )?;
            let staging = GpuBuffer::staging(device, &format!("texture {} staging", i), texture.pixels.as_slice())?;
            staged.push((image, staging));
        }

        let to_transfer_dst: Vec<ImageBarrier> = staged
            .iter()
            .map(|(image, _)| ImageBarrier {
                image: image.image,
                range: image.subresource_range(),
                change: LayoutChange::UNDEFINED_TO_TRANSFER_DST,
            })
            .collect();
        barrier::record(&device.device, cmd, &to_transfer_dst);

        for (image, staging) in &staged {
            let region = vk::BufferImageCopy {
                buffer_offset: 0,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
                image_extent: vk::Extent3D {
                    width: image.extent.width,
                    height: image.extent.height,
                    depth: 1,
                },
            };
            unsafe {
                device.device.cmd_copy_buffer_to_image(
                    cmd,
                    staging.buffer,
                    image.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }
        }

        let to_shader_read: Vec<ImageBarrier> = staged
            .iter()
            .map(|(image, _)| ImageBarrier {
                image: image.image,
                range: image.subresource_range(),
                change: LayoutChange::TRANSFER_DST_TO_SHADER_READ,
            })
            .collect();
        barrier::record(&device.device, cmd, &to_shader_read);

        for (image, staging) in staged {
            self.textures.push(GpuTexture { image });
            self.staging.push(staging);
        }
        Ok(())
    }

    /// Free the staging buffers; only valid once the upload has completed
    pub fn release_staging(&mut self) -> usize {
        let count = self.staging.len();
        self.staging.clear();
        self.staging.shrink_to_fit();
        count
    }

    pub fn texture_views(&self) -> Vec<vk::ImageView> {
        self.textures.iter().map(|t| t.image.view).collect()
    }
}

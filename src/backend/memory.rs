// GPU memory - buffers and images backed by gpu-allocator
//
// Every resource owns its allocation and hands it back to the device's
// allocator on drop. Live allocations are counted on the device so leaks
// show up in the log at teardown.

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::Pod;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use super::VulkanDevice;

/// Live allocation counters
#[derive(Debug, Default)]
pub struct AllocationStats {
    allocations: AtomicUsize,
    bytes: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationSnapshot {
    pub allocations: usize,
    pub bytes: u64,
}

impl AllocationStats {
    pub fn record_alloc(&self, bytes: u64) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_free(&self, bytes: u64) {
        self.allocations.fetch_sub(1, Ordering::Relaxed);
        self.bytes.fetch_sub(bytes, Ordering::Relaxed);
    }

    pub fn live_allocations(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> AllocationSnapshot {
        AllocationSnapshot {
            allocations: self.allocations.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}

fn allocate(
    device: &VulkanDevice,
    name: &str,
    requirements: vk::MemoryRequirements,
    location: MemoryLocation,
    linear: bool,
) -> Result<Allocation> {
    let allocation = device
        .allocator()
        .allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })
        .with_context(|| {
            format!(
                "Out of GPU memory for `{}` ({:.2} MB)",
                name,
                requirements.size as f64 / (1024.0 * 1024.0)
            )
        })?;

    device.stats().record_alloc(allocation.size());
    Ok(allocation)
}

fn free(device: &VulkanDevice, allocation: Allocation) {
    let size = allocation.size();
    if let Err(e) = device.allocator().free(allocation) {
        log::error!("Failed to free GPU allocation: {}", e);
    }
    device.stats().record_free(size);
}

fn sharing<'a>(families: &'a [u32]) -> (vk::SharingMode, &'a [u32]) {
    if families.len() > 1 {
        (vk::SharingMode::CONCURRENT, families)
    } else {
        (vk::SharingMode::EXCLUSIVE, &[])
    }
}

pub struct BufferDesc<'a> {
    pub name: &'a str,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
    /// Touched by both the graphics and the transfer queue
    pub shared: bool,
}

pub struct GpuBuffer {
    device: Arc<VulkanDevice>,
    pub buffer: vk::Buffer,
    allocation: Option<Allocation>,
    pub size: vk::DeviceSize,
}

impl GpuBuffer {
    pub fn new(device: &Arc<VulkanDevice>, desc: &BufferDesc) -> Result<Self> {
        anyhow::ensure!(desc.size > 0, "Buffer `{}` has zero size", desc.name);

        let families = if desc.shared { device.sharing_families() } else { Vec::new() };
        let (sharing_mode, queue_families) = sharing(&families);

        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(sharing_mode)
            .queue_family_indices(queue_families);

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
            .with_context(|| format!("Failed to create buffer `{}`", desc.name))?;

        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let allocation = match allocate(device, desc.name, requirements, desc.location, true) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let bound = unsafe {
            device
                .device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            free(device, allocation);
            unsafe { device.device.destroy_buffer(buffer, None) };
            return Err(e).with_context(|| format!("Failed to bind memory of `{}`", desc.name));
        }

        Ok(Self {
            device: device.clone(),
            buffer,
            allocation: Some(allocation),
            size: desc.size,
        })
    }

    /// Host-visible staging buffer filled with `data`
    pub fn staging<T: Pod>(device: &Arc<VulkanDevice>, name: &str, data: &[T]) -> Result<Self> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let mut buffer = Self::new(
            device,
            &BufferDesc {
                name,
                size: bytes.len() as vk::DeviceSize,
                usage: vk::BufferUsageFlags::TRANSFER_SRC,
                location: MemoryLocation::CpuToGpu,
                shared: false,
            },
        )?;
        buffer.write(0, bytes)?;
        Ok(buffer)
    }

    /// Copy `data` into a host-visible buffer at byte `offset`
    pub fn write<T: Pod>(&mut self, offset: usize, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let mapped = self
            .allocation
            .as_mut()
            .and_then(|allocation| allocation.mapped_slice_mut())
            .context("Buffer is not CPU-accessible")?;

        let end = offset + bytes.len();
        anyhow::ensure!(
            end <= mapped.len(),
            "Write of {} bytes at {} overruns buffer of {} bytes",
            bytes.len(),
            offset,
            mapped.len()
        );

        mapped[offset..end].copy_from_slice(bytes);
        Ok(())
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            free(&self.device, allocation);
        }
        unsafe {
            self.device.device.destroy_buffer(self.buffer, None);
        }
    }
}

pub struct ImageDesc<'a> {
    pub name: &'a str,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub aspect: vk::ImageAspectFlags,
    pub shared: bool,
}

/// Single-mip 2D image with a view over the whole image
pub struct GpuImage {
    device: Arc<VulkanDevice>,
    pub image: vk::Image,
    pub view: vk::ImageView,
    allocation: Option<Allocation>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub aspect: vk::ImageAspectFlags,
}

impl GpuImage {
    pub fn new(device: &Arc<VulkanDevice>, desc: &ImageDesc) -> Result<Self> {
        let families = if desc.shared { device.sharing_families() } else { Vec::new() };
        let (sharing_mode, queue_families) = sharing(&families);

        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(desc.format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(desc.usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(sharing_mode)
            .queue_family_indices(queue_families);

        let image = unsafe { device.device.create_image(&image_info, None) }
            .with_context(|| format!("Failed to create image `{}`", desc.name))?;

        let requirements = unsafe { device.device.get_image_memory_requirements(image) };

        let allocation = match allocate(device, desc.name, requirements, MemoryLocation::GpuOnly, false) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let view = unsafe {
            device
                .device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
                .with_context(|| format!("Failed to bind memory of `{}`", desc.name))
                .and_then(|_| {
                    let view_info = vk::ImageViewCreateInfo::default()
                        .image(image)
                        .view_type(vk::ImageViewType::TYPE_2D)
                        .format(desc.format)
                        .subresource_range(subresource_range(desc.aspect));
                    device
                        .device
                        .create_image_view(&view_info, None)
                        .with_context(|| format!("Failed to create view of `{}`", desc.name))
                })
        };

        let view = match view {
            Ok(view) => view,
            Err(e) => {
                free(device, allocation);
                unsafe { device.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        Ok(Self {
            device: device.clone(),
            image,
            view,
            allocation: Some(allocation),
            format: desc.format,
            extent: desc.extent,
            aspect: desc.aspect,
        })
    }

    pub fn subresource_range(&self) -> vk::ImageSubresourceRange {
        subresource_range(self.aspect)
    }
}

impl Drop for GpuImage {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_image_view(self.view, None);
        }
        if let Some(allocation) = self.allocation.take() {
            free(&self.device, allocation);
        }
        unsafe {
            self.device.device.destroy_image(self.image, None);
        }
    }
}

/// Whole single-mip, single-layer range
pub fn subresource_range(aspect: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: aspect,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_track_live_allocations() {
        let stats = AllocationStats::default();
        stats.record_alloc(256);
        stats.record_alloc(1024);
        assert_eq!(stats.snapshot(), AllocationSnapshot { allocations: 2, bytes: 1280 });

        stats.record_free(256);
        assert_eq!(stats.live_allocations(), 1);
        assert_eq!(stats.snapshot().bytes, 1024);

        stats.record_free(1024);
        assert_eq!(stats.snapshot(), AllocationSnapshot::default());
    }

    #[test]
    fn single_family_is_exclusive() {
        let (mode, families) = sharing(&[0]);
        assert_eq!(mode, vk::SharingMode::EXCLUSIVE);
        assert!(families.is_empty());

        let (mode, families) = sharing(&[0, 2]);
        assert_eq!(mode, vk::SharingMode::CONCURRENT);
        assert_eq!(families, &[0, 2]);
    }

    #[test]
    fn subresource_covers_one_mip_one_layer() {
        let range = subresource_range(vk::ImageAspectFlags::DEPTH);
        assert_eq!(range.aspect_mask, vk::ImageAspectFlags::DEPTH);
        assert_eq!(range.level_count, 1);
        assert_eq!(range.layer_count, 1);
    }
}

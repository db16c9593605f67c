// Swapchain - Window presentation
//
// Manages the chain of images the shading output is blitted into and
// presented from. Triple buffered; the real image count always comes from
// the driver. Images are only ever blit destinations, so no views exist.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use std::time::Duration;

use super::device::SURFACE_FORMAT;
use super::{Surface, VulkanDevice};
use crate::error::RenderError;

/// Images requested from the driver
pub const DESIRED_IMAGE_COUNT: u32 = 3;

pub const IMAGE_USAGE: vk::ImageUsageFlags = vk::ImageUsageFlags::TRANSFER_DST;

/// `desired` clamped to the surface's [min, max] (max 0 means unbounded)
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR, desired: u32) -> u32 {
    let count = desired.max(caps.min_image_count);
    if caps.max_image_count > 0 {
        count.min(caps.max_image_count)
    } else {
        count
    }
}

pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// The requested mode when the surface offers it, otherwise FIFO (always
/// supported)
pub fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    requested: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if available.contains(&requested) {
        requested
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// Typed error for a failed acquire. A bounded acquire that expires is
/// treated like a fence timeout.
pub fn acquire_error(result: vk::Result, timeout: Duration) -> anyhow::Error {
    match result {
        vk::Result::ERROR_OUT_OF_DATE_KHR => RenderError::SwapchainOutOfDate.into(),
        vk::Result::TIMEOUT | vk::Result::NOT_READY => {
            RenderError::FenceTimeout { what: "swapchain acquire", timeout }.into()
        }
        vk::Result::ERROR_DEVICE_LOST => RenderError::DeviceLost { what: "swapchain acquire" }.into(),
        other => anyhow::Error::new(other).context("Failed to acquire swapchain image"),
    }
}

pub fn check_surface(
    caps: &vk::SurfaceCapabilitiesKHR,
    formats: &[vk::SurfaceFormatKHR],
) -> Result<(), RenderError> {
    if !caps.supported_usage_flags.contains(IMAGE_USAGE) {
        return Err(RenderError::UnsupportedSurface(format!(
            "images cannot be used as {:?}",
            IMAGE_USAGE
        )));
    }
    if !formats.contains(&SURFACE_FORMAT) {
        return Err(RenderError::UnsupportedSurface(
            "B8G8R8A8_UNORM / SRGB_NONLINEAR is not offered".to_string(),
        ));
    }
    Ok(())
}

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub swapchain_loader: ash::khr::swapchain::Device,
    pub images: Vec<vk::Image>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    requested_present_mode: vk::PresentModeKHR,
    surface: Arc<Surface>,
    device: Arc<VulkanDevice>,
}

impl Swapchain {
    pub fn new(
        device: Arc<VulkanDevice>,
        surface: Arc<Surface>,
        width: u32,
        height: u32,
        present_mode: vk::PresentModeKHR,
    ) -> Result<Self> {
        let swapchain_loader = ash::khr::swapchain::Device::new(&device.instance.instance, &device.device);

        let mut swapchain = Self {
            swapchain: vk::SwapchainKHR::null(),
            swapchain_loader,
            images: Vec::new(),
            format: SURFACE_FORMAT.format,
            extent: vk::Extent2D { width, height },
            present_mode,
            requested_present_mode: present_mode,
            surface,
            device,
        };
        swapchain.build(width, height)?;
        Ok(swapchain)
    }

    /// Rebuild for a new window size; the caller guarantees the GPU no
    /// longer uses the old images
    pub fn recreate(&mut self, width: u32, height: u32) -> Result<()> {
        log::info!("Recreating swapchain: {}x{}", width, height);
        self.build(width, height)
    }

    fn build(&mut self, width: u32, height: u32) -> Result<()> {
        let physical_device = self.device.physical_device;
        let caps = self.surface.capabilities(physical_device)?;
        let formats = self.surface.formats(physical_device)?;
        let present_modes = self.surface.present_modes(physical_device)?;

        check_surface(&caps, &formats)?;

        let present_mode = choose_present_mode(&present_modes, self.requested_present_mode);
        if present_mode != self.requested_present_mode {
            log::warn!(
                "Present mode {:?} unsupported, using {:?}",
                self.requested_present_mode,
                present_mode
            );
        }

        let extent = choose_extent(&caps, width, height);
        let image_count = choose_image_count(&caps, DESIRED_IMAGE_COUNT);

        let old_swapchain = self.swapchain;
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface.surface)
            .min_image_count(image_count)
            .image_format(SURFACE_FORMAT.format)
            .image_color_space(SURFACE_FORMAT.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(IMAGE_USAGE)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let swapchain = unsafe { self.swapchain_loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;

        // Old chain is retired even when the new one turns out unusable
        if old_swapchain != vk::SwapchainKHR::null() {
            unsafe { self.swapchain_loader.destroy_swapchain(old_swapchain, None) };
        }
        self.swapchain = swapchain;

        let images = unsafe { self.swapchain_loader.get_swapchain_images(swapchain) }
            .context("Failed to get swapchain images")?;

        self.images = images;
        self.extent = extent;
        self.present_mode = present_mode;

        log::info!(
            "Swapchain {}x{}, {} images (asked for {}), {:?}",
            extent.width,
            extent.height,
            self.images.len(),
            image_count,
            present_mode
        );
        Ok(())
    }

    /// Acquire next image for rendering, bounded by `timeout`;
    /// `SwapchainOutOfDate` means the caller must `recreate` and skip this
    /// frame
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore, timeout: Duration) -> Result<(u32, bool)> {
        let nanos = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        unsafe {
            self.swapchain_loader
                .acquire_next_image(self.swapchain, nanos, semaphore, vk::Fence::null())
        }
        .map_err(|result| acquire_error(result, timeout))
    }

    /// Present rendered image to screen; returns true when the swapchain
    /// should be recreated
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<bool> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.swapchain_loader.queue_present(queue, &present_info) };

        match result {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(e).context("Failed to present"),
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            self.swapchain_loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: vk::Extent2D { width: u32::MAX, height: u32::MAX },
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D { width: 4096, height: 4096 },
            supported_usage_flags: IMAGE_USAGE | vk::ImageUsageFlags::STORAGE,
            ..Default::default()
        }
    }

    #[test]
    fn image_count_is_clamped_to_surface_limits() {
        assert_eq!(choose_image_count(&caps(2, 8), 3), 3);
        assert_eq!(choose_image_count(&caps(4, 8), 3), 4);
        assert_eq!(choose_image_count(&caps(1, 2), 3), 2);
        assert_eq!(choose_image_count(&caps(2, 0), 3), 3);
    }

    #[test]
    fn fixed_surface_extent_wins() {
        let mut fixed = caps(2, 3);
        fixed.current_extent = vk::Extent2D { width: 800, height: 600 };
        assert_eq!(choose_extent(&fixed, 1920, 1080), vk::Extent2D { width: 800, height: 600 });
    }

    #[test]
    fn free_extent_is_clamped() {
        let extent = choose_extent(&caps(2, 3), 10_000, 0);
        assert_eq!(extent, vk::Extent2D { width: 4096, height: 1 });
    }

    #[test]
    fn unsupported_present_mode_falls_back_to_fifo() {
        let available = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            choose_present_mode(&available, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            choose_present_mode(&available, vk::PresentModeKHR::IMMEDIATE),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn acquire_results_map_to_typed_errors() {
        let timeout = Duration::from_millis(1000);

        let err = acquire_error(vk::Result::ERROR_OUT_OF_DATE_KHR, timeout);
        assert!(matches!(err.downcast_ref::<RenderError>(), Some(RenderError::SwapchainOutOfDate)));
        assert!(!crate::error::is_fatal(&err));

        for expired in [vk::Result::TIMEOUT, vk::Result::NOT_READY] {
            let err = acquire_error(expired, timeout);
            assert!(matches!(
                err.downcast_ref::<RenderError>(),
                Some(RenderError::FenceTimeout { what: "swapchain acquire", .. })
            ));
            assert!(crate::error::is_fatal(&err));
        }

        assert!(crate::error::is_fatal(&acquire_error(vk::Result::ERROR_DEVICE_LOST, timeout)));
        let err = acquire_error(vk::Result::ERROR_SURFACE_LOST_KHR, timeout);
        assert!(err.downcast_ref::<RenderError>().is_none());
    }

    #[test]
    fn surface_without_transfer_dst_is_unsupported() {
        let mut no_blit = caps(2, 3);
        no_blit.supported_usage_flags = vk::ImageUsageFlags::COLOR_ATTACHMENT;
        let err = check_surface(&no_blit, &[SURFACE_FORMAT]).unwrap_err();
        assert!(matches!(err, RenderError::UnsupportedSurface(_)));

        assert!(check_surface(&caps(2, 3), &[SURFACE_FORMAT]).is_ok());
        assert!(check_surface(&caps(2, 3), &[]).is_err());
    }
}

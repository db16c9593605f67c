// Transfer engine - out-of-band uploads on the transfer queue
//
// One command buffer and one fence: at most one upload is in flight. The
// fence is created signaled so the first wait returns immediately.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::command::{self, CommandPool};
use crate::backend::sync::{create_fence, submit_error, wait_for_fence};
use crate::backend::VulkanDevice;

/// Where the loaded map's upload stands relative to drawing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UploadState {
    /// No map, or its upload has not been submitted
    #[default]
    Empty,
    /// Submitted; staging memory is still held by the map
    InFlight,
    /// Transfer fence observed and staging memory released
    Resident,
}

/// Decides when a draw has to wait on the transfer fence before it may
/// read the map, and when staging memory may go
#[derive(Debug, Default)]
pub struct UploadTracker {
    state: UploadState,
}

impl UploadTracker {
    pub fn state(&self) -> UploadState {
        self.state
    }

    /// A new upload was submitted; the previous map must have been cleared
    pub fn submitted(&mut self) -> Result<()> {
        anyhow::ensure!(
            self.state == UploadState::Empty,
            "Upload submitted while the previous map is {:?}",
            self.state
        );
        self.state = UploadState::InFlight;
        Ok(())
    }

    /// The next draw must wait on the transfer fence and release staging
    pub fn must_wait_before_draw(&self) -> bool {
        self.state == UploadState::InFlight
    }

    /// The transfer fence was waited on and staging released
    pub fn completed(&mut self) -> Result<()> {
        anyhow::ensure!(
            self.state == UploadState::InFlight,
            "No upload in flight (state {:?})",
            self.state
        );
        self.state = UploadState::Resident;
        Ok(())
    }

    /// The map (and any staging it held) was destroyed
    pub fn cleared(&mut self) {
        self.state = UploadState::Empty;
    }
}

pub struct TransferEngine {
    device: Arc<VulkanDevice>,
    pub command_buffer: vk::CommandBuffer,
    pub fence: vk::Fence,
    pending: bool,
    timeout: Duration,
    pool: CommandPool,
}

impl TransferEngine {
    pub fn new(device: &Arc<VulkanDevice>, timeout: Duration) -> Result<Self> {
        let pool = CommandPool::new(device, device.transfer_queue_family)?;
        let command_buffer = pool.allocate(1)?[0];
        let fence = create_fence(device, true)?;

        Ok(Self {
            device: device.clone(),
            command_buffer,
            fence,
            pending: false,
            timeout,
            pool,
        })
    }

    /// Block until the outstanding upload (if any) has finished. Returns
    /// true when this call observed an upload completing.
    pub fn wait(&mut self) -> Result<bool> {
        wait_for_fence(&self.device.device, self.fence, self.timeout, "transfer")?;
        Ok(std::mem::take(&mut self.pending))
    }

    /// Wait for the previous upload, then start recording a new one
    pub fn begin(&mut self) -> Result<vk::CommandBuffer> {
        self.wait()?;
        command::begin_one_time(&self.device.device, self.command_buffer)?;
        Ok(self.command_buffer)
    }

    pub fn submit(&mut self) -> Result<()> {
        let device = &self.device.device;
        command::end(device, self.command_buffer)?;

        let command_buffers = [self.command_buffer];
        let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);

        unsafe {
            // Reset only once the submission is certain to be made
            device.reset_fences(&[self.fence]).context("Failed to reset transfer fence")?;
            if let Err(result) =
                device.queue_submit(self.device.transfer_queue, &[submit_info], self.fence)
            {
                // The reset fence would never signal again
                let fence = create_fence(&self.device, true)?;
                device.destroy_fence(self.fence, None);
                self.fence = fence;
                return Err(submit_error(result, "transfer"));
            }
        }

        self.pending = true;
        log::debug!(
            "Submitted upload on queue family {}",
            self.pool.queue_family
        );
        Ok(())
    }
}

impl Drop for TransferEngine {
    fn drop(&mut self) {
        if self.pending {
            if let Err(e) = self.wait() {
                log::error!("Upload still pending at shutdown: {:#}", e);
            }
        }
        unsafe {
            self.device.device.destroy_fence(self.fence, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_draw_after_push_waits_once() {
        let mut upload = UploadTracker::default();
        assert!(!upload.must_wait_before_draw());

        upload.submitted().unwrap();
        assert!(upload.must_wait_before_draw());

        upload.completed().unwrap();
        assert_eq!(upload.state(), UploadState::Resident);
        assert!(!upload.must_wait_before_draw());
        assert!(upload.completed().is_err());
    }

    #[test]
    fn second_push_while_staging_held_requires_clearing() {
        let mut upload = UploadTracker::default();
        upload.submitted().unwrap();

        // The old map still owns staging memory in flight
        assert!(upload.submitted().is_err());
        assert_eq!(upload.state(), UploadState::InFlight);

        upload.cleared();
        upload.submitted().unwrap();
        assert!(upload.must_wait_before_draw());
    }

    #[test]
    fn destroying_an_uploading_map_skips_the_draw_wait() {
        let mut upload = UploadTracker::default();
        upload.submitted().unwrap();
        upload.cleared();

        assert_eq!(upload.state(), UploadState::Empty);
        assert!(!upload.must_wait_before_draw());
        assert!(upload.completed().is_err());
    }

    #[test]
    fn resident_map_must_be_cleared_before_next_push() {
        let mut upload = UploadTracker::default();
        upload.submitted().unwrap();
        upload.completed().unwrap();
        assert!(upload.submitted().is_err());

        upload.cleared();
        assert!(upload.submitted().is_ok());
    }
}
